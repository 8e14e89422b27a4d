//! LayerNorm with affine weight and bias.
//!
//! Built from plain tensor ops so gradients flow through the normalisation
//! into the input and both affine parameters.

use candle_core::{DType, Result, Tensor, D};
use candle_nn::{Init, VarBuilder};

pub struct LayerNorm {
    weight: Tensor,
    bias: Tensor,
    eps: f64,
}

impl LayerNorm {
    /// `vb` should be scoped to the layer prefix (e.g. `vb.pp("norm1")`).
    pub fn new(dim: usize, eps: f64, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            weight: vb.get_with_hints(dim, "weight", Init::Const(1.0))?,
            bias: vb.get_with_hints(dim, "bias", Init::Const(0.0))?,
            eps,
        })
    }

    /// Normalise over the last dimension, computed in `f32`.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let dtype = x.dtype();
        let x = x.to_dtype(DType::F32)?;
        let mean = x.mean_keepdim(D::Minus1)?;
        let centered = x.broadcast_sub(&mean)?;
        let var = centered.sqr()?.mean_keepdim(D::Minus1)?;
        let normed = centered.broadcast_div(&(var + self.eps)?.sqrt()?)?;
        normed
            .to_dtype(dtype)?
            .broadcast_mul(&self.weight)?
            .broadcast_add(&self.bias)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use candle_nn::VarMap;

    #[test]
    fn output_has_zero_mean_unit_variance() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let ln = LayerNorm::new(4, 1e-6, vb).unwrap();
        let x = Tensor::new(&[[1f32, 2., 3., 4.], [10., 0., -10., 0.]], &Device::Cpu).unwrap();
        let y = ln.forward(&x).unwrap();
        for row in y.to_vec2::<f32>().unwrap() {
            let mean = row.iter().sum::<f32>() / 4.0;
            let var = row.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / 4.0;
            assert!(mean.abs() < 1e-5);
            assert!((var - 1.0).abs() < 1e-3);
        }
    }

    #[test]
    fn backward_reaches_input_and_affine_params() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let ln = LayerNorm::new(3, 1e-5, vb).unwrap();
        let x = candle_core::Var::new(&[[0.5f32, -1.0, 2.0]], &Device::Cpu).unwrap();
        let target = Tensor::new(&[[1f32, 0., 0.]], &Device::Cpu).unwrap();
        let loss = (ln.forward(x.as_tensor()).unwrap() - target)
            .unwrap()
            .sqr()
            .unwrap()
            .sum_all()
            .unwrap();
        let grads = loss.backward().unwrap();
        assert!(grads.get(x.as_tensor()).is_some());
        for var in varmap.all_vars() {
            assert!(grads.get(var.as_tensor()).is_some());
        }
    }
}
