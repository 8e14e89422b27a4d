use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use candle_core::Device;
use clap::Parser;

use mae_common::{pretrain_loaders, DistContext, PretrainConfig};
use mae_train::{CandleEngine, TrainError, Trainer};

/// Exit status when the loss goes non-finite.
const EXIT_DIVERGED: u8 = 1;
/// Exit status for any failure other than divergence.
const EXIT_ERROR: u8 = 2;

#[derive(Parser, Debug)]
#[command(name = "mae-pretrain", about = "Masked-autoencoder ViT pre-training")]
struct Cli {
    /// JSON run configuration.
    #[arg(default_value = "config/pretrain.json")]
    config: PathBuf,
    /// Force verbose logging regardless of `VERBOSE` in the config.
    #[arg(long)]
    verbose: bool,
    /// Write a default configuration for `--datapath` to CONFIG and exit.
    #[arg(long, requires = "datapath")]
    init_config: bool,
    #[arg(long)]
    datapath: Option<PathBuf>,
}

fn main() -> ExitCode {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let code = exit_code(&err);
            // divergence is already logged by the trainer
            if code != EXIT_DIVERGED {
                tracing::error!("{err:#}");
            }
            ExitCode::from(code)
        }
    }
}

fn exit_code(err: &anyhow::Error) -> u8 {
    match err.downcast_ref::<TrainError>() {
        Some(e) if e.is_divergence() => EXIT_DIVERGED,
        _ => EXIT_ERROR,
    }
}

fn run(cli: Cli) -> Result<()> {
    if cli.init_config {
        let datapath = cli.datapath.context("--init-config needs --datapath")?;
        if let Some(dir) = cli.config.parent() {
            std::fs::create_dir_all(dir)?;
        }
        PretrainConfig::with_datapath(datapath).save(&cli.config)?;
        eprintln!("Created default config at {}", cli.config.display());
        return Ok(());
    }

    let mut config = PretrainConfig::load(&cli.config)?;
    if let Some(datapath) = cli.datapath {
        config.datapath = datapath;
    }
    config.validate()?;
    let verbose = config.verbose || cli.verbose;

    let dist = DistContext::from_env()?;
    let device = Device::cuda_if_available(dist.local_rank)?;
    if dist.is_main() {
        tracing::info!(
            config = %cli.config.display(),
            rank = dist.rank,
            world_size = dist.world_size,
            device = ?device,
            "Launching pre-training"
        );
    }
    if let Some(dir) = &config.output_dir {
        if dist.is_main() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("create output dir {}", dir.display()))?;
        }
    }

    let (train_loader, val_loader) = pretrain_loaders(&config, dist)?;
    let model_config = config.model_config()?;
    let lr = config.resolved_learning_rate(dist.world_size);
    let engine = CandleEngine::new(&model_config, &config, lr, &dist, device.clone())?;

    let mut trainer = Trainer::new(engine, config, dist, verbose);
    trainer.resume(&device)?;
    trainer.fit(&train_loader, Some(&val_loader))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_path_defaults() {
        let cli = Cli::try_parse_from(["mae-pretrain"]).unwrap();
        assert_eq!(cli.config, PathBuf::from("config/pretrain.json"));
        assert!(!cli.verbose);
    }

    #[test]
    fn divergence_exits_one_other_errors_two() {
        let diverged = anyhow::Error::from(TrainError::Divergence {
            loss: f64::NAN,
            epoch: 3,
            step: 17,
        });
        assert_eq!(exit_code(&diverged), 1);

        let wrapped = diverged.context("training failed");
        assert_eq!(exit_code(&wrapped), 1);

        assert_eq!(exit_code(&anyhow::anyhow!("no such file")), 2);
        let other = anyhow::Error::from(TrainError::Config("bad".into()));
        assert_eq!(exit_code(&other), 2);
    }

    #[test]
    fn init_config_requires_datapath() {
        assert!(Cli::try_parse_from(["mae-pretrain", "--init-config"]).is_err());
        let cli = Cli::try_parse_from([
            "mae-pretrain",
            "run.json",
            "--init-config",
            "--datapath",
            "/data/imagenet",
        ])
        .unwrap();
        assert!(cli.init_config);
        assert_eq!(cli.config, PathBuf::from("run.json"));
    }
}
