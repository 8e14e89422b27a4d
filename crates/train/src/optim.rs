//! AdamW with parameter groups, plus gradient-norm utilities.
//!
//! Update rule per parameter (decoupled weight decay):
//!   1. p *= 1 - lr * wd
//!   2. m = β1·m + (1 − β1)·g,  v = β2·v + (1 − β2)·g²
//!   3. p -= lr / (1 − β1ᵗ) · m / (√v / √(1 − β2ᵗ) + ε)
//!
//! Moments are held in `Var`s and updated with `set`, so the optimiser never
//! grows an autograd graph across steps.

use std::collections::{BTreeMap, HashMap};

use candle_core::{DType, Result, Tensor, Var};
use serde::{Deserialize, Serialize};

/// One group of parameters sharing hyper-parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamGroup {
    pub name: String,
    pub lr: f64,
    pub weight_decay: f64,
    /// Indices into the optimiser's parameter list.
    pub params: Vec<usize>,
}

/// Split parameters into a decayed group and a no-decay group.
///
/// Biases and normalisation weights (rank ≤ 1, or a name ending in
/// `.bias`) are never decayed.
pub fn param_groups(params: &[(String, Var)], lr: f64, weight_decay: f64) -> Vec<ParamGroup> {
    let mut decay = Vec::new();
    let mut no_decay = Vec::new();
    for (i, (name, var)) in params.iter().enumerate() {
        if var.rank() <= 1 || name.ends_with(".bias") {
            no_decay.push(i);
        } else {
            decay.push(i);
        }
    }
    vec![
        ParamGroup {
            name: "decay".into(),
            lr,
            weight_decay,
            params: decay,
        },
        ParamGroup {
            name: "no_decay".into(),
            lr,
            weight_decay: 0.0,
            params: no_decay,
        },
    ]
}

/// Serialisable optimiser state: JSON metadata plus named moment tensors.
#[derive(Debug, Clone)]
pub struct OptimizerState {
    pub meta: serde_json::Value,
    pub tensors: Vec<(String, Tensor)>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AdamWMeta {
    beta1: f64,
    beta2: f64,
    eps: f64,
    groups: Vec<GroupMeta>,
    steps: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct GroupMeta {
    name: String,
    lr: f64,
    weight_decay: f64,
    params: Vec<String>,
}

// ── AdamW ───────────────────────────────────────────────────────────────────

pub struct AdamW {
    params: Vec<(String, Var)>,
    groups: Vec<ParamGroup>,
    exp_avg: Vec<Var>,
    exp_avg_sq: Vec<Var>,
    steps: Vec<u64>,
    beta1: f64,
    beta2: f64,
    eps: f64,
}

impl AdamW {
    pub fn new(
        params: Vec<(String, Var)>,
        groups: Vec<ParamGroup>,
        (beta1, beta2): (f64, f64),
    ) -> Result<Self> {
        let mut exp_avg = Vec::with_capacity(params.len());
        let mut exp_avg_sq = Vec::with_capacity(params.len());
        for (_, var) in &params {
            let t = var.as_tensor();
            exp_avg.push(Var::zeros(t.shape(), DType::F32, t.device())?);
            exp_avg_sq.push(Var::zeros(t.shape(), DType::F32, t.device())?);
        }
        let steps = vec![0; params.len()];
        Ok(Self {
            params,
            groups,
            exp_avg,
            exp_avg_sq,
            steps,
            beta1,
            beta2,
            eps: 1e-8,
        })
    }

    pub fn groups(&self) -> &[ParamGroup] {
        &self.groups
    }

    pub fn params(&self) -> &[(String, Var)] {
        &self.params
    }

    /// Current learning rate of the first group.
    pub fn learning_rate(&self) -> f64 {
        self.groups.first().map_or(0.0, |g| g.lr)
    }

    /// Apply `lr` to every parameter group.
    pub fn set_learning_rate(&mut self, lr: f64) {
        for group in &mut self.groups {
            group.lr = lr;
        }
    }

    /// One update; `grads[i]` belongs to `params[i]`. Parameters without a
    /// gradient are left untouched and do not advance their step count.
    pub fn step(&mut self, grads: &[Option<Tensor>]) -> Result<()> {
        for group in &self.groups {
            for &i in &group.params {
                let Some(grad) = grads.get(i).and_then(|g| g.as_ref()) else {
                    continue;
                };
                let var = &self.params[i].1;

                if group.weight_decay > 0.0 {
                    let decayed = (var.as_tensor() * (1.0 - group.lr * group.weight_decay))?;
                    var.set(&decayed)?;
                }

                let m = &self.exp_avg[i];
                let v = &self.exp_avg_sq[i];
                let next_m = ((m.as_tensor() * self.beta1)? + (grad * (1.0 - self.beta1))?)?;
                let next_v =
                    ((v.as_tensor() * self.beta2)? + (grad.sqr()? * (1.0 - self.beta2))?)?;

                self.steps[i] += 1;
                let t = self.steps[i] as i32;
                let bc1 = 1.0 - self.beta1.powi(t);
                let bc2 = 1.0 - self.beta2.powi(t);

                let denom = ((next_v.sqrt()? / bc2.sqrt())? + self.eps)?;
                let update = ((&next_m / &denom)? * (group.lr / bc1))?;
                let next_p = (var.as_tensor() - update)?;

                var.set(&next_p)?;
                m.set(&next_m)?;
                v.set(&next_v)?;
            }
        }
        Ok(())
    }

    /// Snapshot of the moments as `<param>.exp_avg` / `<param>.exp_avg_sq`
    /// plus metadata.
    pub fn state(&self) -> Result<OptimizerState> {
        let mut tensors = Vec::with_capacity(2 * self.params.len());
        let mut steps = BTreeMap::new();
        for (i, (name, _)) in self.params.iter().enumerate() {
            tensors.push((format!("{name}.exp_avg"), self.exp_avg[i].as_tensor().copy()?));
            tensors.push((
                format!("{name}.exp_avg_sq"),
                self.exp_avg_sq[i].as_tensor().copy()?,
            ));
            steps.insert(name.clone(), self.steps[i]);
        }
        let groups = self
            .groups
            .iter()
            .map(|g| GroupMeta {
                name: g.name.clone(),
                lr: g.lr,
                weight_decay: g.weight_decay,
                params: g.params.iter().map(|&i| self.params[i].0.clone()).collect(),
            })
            .collect();
        let meta = AdamWMeta {
            beta1: self.beta1,
            beta2: self.beta2,
            eps: self.eps,
            groups,
            steps,
        };
        let meta = serde_json::to_value(meta)
            .map_err(|e| candle_core::Error::Msg(format!("optimizer meta: {e}")))?;
        Ok(OptimizerState { meta, tensors })
    }

    /// Restore from [`AdamW::state`]. Every parameter must be present with
    /// a matching shape.
    pub fn load_state(&mut self, state: &OptimizerState) -> Result<()> {
        let meta: AdamWMeta = serde_json::from_value(state.meta.clone())
            .map_err(|e| candle_core::Error::Msg(format!("optimizer meta: {e}")))?;
        let tensors: HashMap<&str, &Tensor> =
            state.tensors.iter().map(|(k, t)| (k.as_str(), t)).collect();
        let index: HashMap<&str, usize> = self
            .params
            .iter()
            .enumerate()
            .map(|(i, (n, _))| (n.as_str(), i))
            .collect();

        for (i, (name, var)) in self.params.iter().enumerate() {
            for (suffix, slot) in [("exp_avg", &self.exp_avg[i]), ("exp_avg_sq", &self.exp_avg_sq[i])] {
                let key = format!("{name}.{suffix}");
                let t = tensors.get(key.as_str()).ok_or_else(|| {
                    candle_core::Error::Msg(format!("optimizer state missing {key}"))
                })?;
                if t.dims() != var.dims() {
                    return Err(candle_core::Error::Msg(format!(
                        "optimizer state shape mismatch for {key}: expected {:?}, got {:?}",
                        var.dims(),
                        t.dims()
                    )));
                }
                slot.set(&t.to_device(var.device())?.to_dtype(DType::F32)?)?;
            }
            self.steps[i] = meta.steps.get(name).copied().unwrap_or(0);
        }

        let mut groups = Vec::with_capacity(meta.groups.len());
        for g in meta.groups {
            let params = g
                .params
                .iter()
                .map(|n| {
                    index.get(n.as_str()).copied().ok_or_else(|| {
                        candle_core::Error::Msg(format!("optimizer group references unknown {n}"))
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            groups.push(ParamGroup {
                name: g.name,
                lr: g.lr,
                weight_decay: g.weight_decay,
                params,
            });
        }
        self.groups = groups;
        self.beta1 = meta.beta1;
        self.beta2 = meta.beta2;
        self.eps = meta.eps;
        Ok(())
    }
}

// ── Gradient utilities ──────────────────────────────────────────────────────

/// Total L2 norm of gradients. NaN or inf propagates.
pub fn grad_norm(grads: &[Option<Tensor>]) -> Result<f64> {
    let mut total = 0.0f64;
    for g in grads.iter().flatten() {
        total += g.sqr()?.sum_all()?.to_dtype(DType::F64)?.to_scalar::<f64>()?;
    }
    Ok(total.sqrt())
}

/// Multiply every gradient by `factor`.
pub fn scale_grads(grads: &mut [Option<Tensor>], factor: f64) -> Result<()> {
    for g in grads.iter_mut() {
        if let Some(t) = g.take() {
            *g = Some((t * factor)?);
        }
    }
    Ok(())
}

/// Clip gradients so their global L2 norm ≤ `max_norm`. Returns the norm
/// before clipping.
pub fn clip_grad_norm(grads: &mut [Option<Tensor>], max_norm: f64) -> Result<f64> {
    let norm = grad_norm(grads)?;
    if norm > max_norm {
        scale_grads(grads, max_norm / (norm + 1e-6))?;
    }
    Ok(norm)
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn named(name: &str, t: Tensor) -> (String, Var) {
        (name.to_string(), Var::from_tensor(&t).unwrap())
    }

    fn two_params() -> Vec<(String, Var)> {
        let dev = Device::Cpu;
        vec![
            named("fc.weight", Tensor::ones((2, 2), DType::F32, &dev).unwrap()),
            named("fc.bias", Tensor::ones(2, DType::F32, &dev).unwrap()),
        ]
    }

    #[test]
    fn groups_split_bias_and_norm() {
        let dev = Device::Cpu;
        let params = vec![
            named("blocks.0.attn.qkv.weight", Tensor::zeros((4, 4), DType::F32, &dev).unwrap()),
            named("blocks.0.attn.qkv.bias", Tensor::zeros(4, DType::F32, &dev).unwrap()),
            named("norm.weight", Tensor::zeros(4, DType::F32, &dev).unwrap()),
            named("cls_token", Tensor::zeros((1, 1, 4), DType::F32, &dev).unwrap()),
        ];
        let groups = param_groups(&params, 1e-3, 0.05);
        assert_eq!(groups[0].params, vec![0, 3]);
        assert_eq!(groups[0].weight_decay, 0.05);
        assert_eq!(groups[1].params, vec![1, 2]);
        assert_eq!(groups[1].weight_decay, 0.0);
    }

    #[test]
    fn first_step_moves_by_lr_against_gradient_sign() {
        let params = two_params();
        let groups = param_groups(&params, 0.1, 0.0);
        let mut opt = AdamW::new(params.clone(), groups, (0.9, 0.95)).unwrap();
        let g = vec![
            Some(Tensor::new(&[[2f32, -2.], [0.5, -0.5]], &Device::Cpu).unwrap()),
            None,
        ];
        opt.step(&g).unwrap();
        // Adam's first step is lr · sign(g) up to ε.
        let w = params[0].1.as_tensor().to_vec2::<f32>().unwrap();
        assert!((w[0][0] - 0.9).abs() < 1e-5);
        assert!((w[0][1] - 1.1).abs() < 1e-5);
        assert!((w[1][0] - 0.9).abs() < 1e-5);
        // no gradient, no change
        let b = params[1].1.as_tensor().to_vec1::<f32>().unwrap();
        assert_eq!(b, vec![1.0, 1.0]);
    }

    #[test]
    fn decoupled_weight_decay_only_on_decay_group() {
        let params = two_params();
        let groups = param_groups(&params, 0.1, 0.5);
        let mut opt = AdamW::new(params.clone(), groups, (0.9, 0.95)).unwrap();
        let zeros = |shape: &[usize]| Some(Tensor::zeros(shape, DType::F32, &Device::Cpu).unwrap());
        opt.step(&[zeros(&[2, 2]), zeros(&[2])]).unwrap();
        let w = params[0].1.as_tensor().to_vec2::<f32>().unwrap();
        assert!((w[0][0] - 0.95).abs() < 1e-6);
        let b = params[1].1.as_tensor().to_vec1::<f32>().unwrap();
        assert_eq!(b, vec![1.0, 1.0]);
    }

    #[test]
    fn state_round_trip_restores_moments_and_steps() {
        let params = two_params();
        let mut opt = AdamW::new(params.clone(), param_groups(&params, 0.1, 0.05), (0.9, 0.95)).unwrap();
        let g = vec![
            Some(Tensor::ones((2, 2), DType::F32, &Device::Cpu).unwrap()),
            Some(Tensor::ones(2, DType::F32, &Device::Cpu).unwrap()),
        ];
        opt.step(&g).unwrap();
        opt.set_learning_rate(0.02);
        let state = opt.state().unwrap();

        let fresh = two_params();
        let mut other =
            AdamW::new(fresh.clone(), param_groups(&fresh, 1.0, 0.0), (0.5, 0.5)).unwrap();
        other.load_state(&state).unwrap();
        assert_eq!(other.groups(), opt.groups());
        assert_eq!(other.steps, opt.steps);
        assert_eq!(other.beta2, 0.95);
        let a = opt.exp_avg_sq[0].as_tensor().to_vec2::<f32>().unwrap();
        let b = other.exp_avg_sq[0].as_tensor().to_vec2::<f32>().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn state_is_a_snapshot() {
        let params = two_params();
        let mut opt = AdamW::new(params.clone(), param_groups(&params, 0.1, 0.0), (0.9, 0.95)).unwrap();
        let g = vec![Some(Tensor::ones((2, 2), DType::F32, &Device::Cpu).unwrap()), None];
        opt.step(&g).unwrap();
        let state = opt.state().unwrap();
        let saved = state.tensors[0].1.to_vec2::<f32>().unwrap();
        opt.step(&g).unwrap();
        assert_eq!(state.tensors[0].1.to_vec2::<f32>().unwrap(), saved);
        assert_ne!(opt.exp_avg[0].as_tensor().to_vec2::<f32>().unwrap(), saved);
    }

    #[test]
    fn load_state_rejects_missing_tensor() {
        let params = two_params();
        let opt = AdamW::new(params.clone(), param_groups(&params, 0.1, 0.0), (0.9, 0.95)).unwrap();
        let mut state = opt.state().unwrap();
        state.tensors.pop();
        let mut other = AdamW::new(params.clone(), param_groups(&params, 0.1, 0.0), (0.9, 0.95)).unwrap();
        assert!(other.load_state(&state).is_err());
    }

    #[test]
    fn clip_scales_to_max_norm() {
        let mut grads = vec![Some(Tensor::new(&[3f32, 4.], &Device::Cpu).unwrap()), None];
        let norm = clip_grad_norm(&mut grads, 1.0).unwrap();
        assert!((norm - 5.0).abs() < 1e-6);
        let after = grad_norm(&grads).unwrap();
        assert!((after - 1.0).abs() < 1e-4);
    }

    #[test]
    fn non_finite_norm_propagates() {
        let grads = vec![Some(Tensor::new(&[f32::INFINITY, 1.0], &Device::Cpu).unwrap())];
        assert!(!grad_norm(&grads).unwrap().is_finite());
    }
}
