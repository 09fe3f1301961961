//! CLI entry point for llm-pretrain.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use llm_pretrain::checkpoint::{checkpoint_exists, read_meta};
use llm_pretrain::config::{DeviceMode, TrainConfig};
use llm_pretrain::distributed;
use llm_pretrain::logging::{init_console_logging, init_logging, rank_span};
use llm_pretrain::model::TinyLlamaBuilder;
use llm_pretrain::optim::LinearWarmupDecay;
use llm_pretrain::train::Trainer;

/// A JSON file path or a preset name.
fn resolve_train_config(source: &str) -> anyhow::Result<TrainConfig> {
    let path = Path::new(source);
    if path.exists() {
        return Ok(TrainConfig::from_json_file(path)?);
    }
    TrainConfig::preset(source).with_context(|| {
        format!(
            "'{}' is neither a config file nor a preset (tiny-cpu, small-gpu)",
            source
        )
    })
}

fn resolve_device_mode(device: &str) -> Result<DeviceMode, String> {
    match device {
        "cpu" => Ok(DeviceMode::Cpu),
        "cpu-distributed" | "cpu_distributed" => Ok(DeviceMode::CpuDistributed),
        "gpu" | "cuda" => Ok(DeviceMode::Gpu),
        other => Err(format!(
            "Unknown device: {}. Use 'cpu', 'cpu-distributed' or 'gpu'.",
            other
        )),
    }
}

/// Command-line overrides applied on top of a loaded config.
#[derive(Debug, Default, Clone, PartialEq)]
struct Overrides {
    batch_size: Option<usize>,
    learning_rate: Option<f64>,
    warmup_steps: Option<usize>,
    total_steps: Option<usize>,
    max_seq_len: Option<usize>,
    checkpoint_dir: Option<PathBuf>,
    metrics_dir: Option<PathBuf>,
    seed: Option<u64>,
    device: Option<DeviceMode>,
}

impl Overrides {
    fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    fn apply(&self, cfg: &mut TrainConfig) {
        if let Some(v) = self.batch_size {
            cfg.batch_size = v;
        }
        if let Some(v) = self.learning_rate {
            cfg.learning_rate = v;
        }
        if let Some(v) = self.warmup_steps {
            cfg.warmup_steps = v;
        }
        if let Some(v) = self.total_steps {
            cfg.total_steps = v;
        }
        if let Some(v) = self.max_seq_len {
            cfg.max_seq_len = v;
        }
        if let Some(v) = &self.checkpoint_dir {
            cfg.checkpoint_dir = v.clone();
        }
        if let Some(v) = &self.metrics_dir {
            cfg.metrics_dir = Some(v.clone());
        }
        if let Some(v) = self.seed {
            cfg.seed = v;
        }
        if let Some(v) = self.device {
            cfg.device = v;
        }
    }
}

#[derive(Parser)]
#[command(
    name = "llm-pretrain",
    about = "Multi-process pretraining for decoder-only language models"
)]
struct Cli {
    /// Emit JSON log lines instead of the console format
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train a model (one process per device; launch with RANK/WORLD_SIZE/LOCAL_RANK)
    Train {
        /// Config JSON file or preset name
        #[arg(long, default_value = "tiny-cpu")]
        config: String,

        /// Resume from a checkpoint directory; its stored config wins
        #[arg(long)]
        resume: Option<PathBuf>,

        #[arg(long)]
        batch_size: Option<usize>,

        #[arg(long)]
        learning_rate: Option<f64>,

        #[arg(long)]
        warmup_steps: Option<usize>,

        #[arg(long)]
        total_steps: Option<usize>,

        #[arg(long)]
        max_seq_len: Option<usize>,

        #[arg(long)]
        checkpoint_dir: Option<PathBuf>,

        #[arg(long)]
        metrics_dir: Option<PathBuf>,

        #[arg(long)]
        seed: Option<u64>,

        /// cpu, cpu-distributed or gpu
        #[arg(long)]
        device: Option<String>,
    },

    /// Print a checkpoint's metadata
    Inspect {
        checkpoint: PathBuf,
    },

    /// Write a preset config as JSON
    InitConfig {
        path: PathBuf,

        #[arg(long, default_value = "tiny-cpu")]
        preset: String,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

fn train(config: &str, resume: Option<PathBuf>, overrides: Overrides) -> anyhow::Result<()> {
    let cfg = match &resume {
        Some(dir) => {
            if !checkpoint_exists(dir) {
                bail!("no checkpoint found in {}", dir.display());
            }
            let mut stored = read_meta(dir)?.config;
            // Only the device may change across a resume.
            if let Some(device) = overrides.device {
                stored.device = device;
            }
            let ignored = Overrides {
                device: None,
                ..overrides.clone()
            };
            if !ignored.is_empty() {
                tracing::warn!("Ignoring config overrides: resuming with the checkpoint's config");
            }
            stored
        }
        None => {
            let mut cfg = resolve_train_config(config)?;
            overrides.apply(&mut cfg);
            cfg
        }
    };
    if let Err(errors) = cfg.validate() {
        bail!("invalid config:\n  {}", errors.join("\n  "));
    }

    let ctx = distributed::initialize(cfg.device)?;
    let span = rank_span(ctx.rank(), ctx.world_size());
    let _enter = span.enter();

    let builder = TinyLlamaBuilder::new(cfg.model.clone());
    let mut trainer = match resume {
        Some(dir) => Trainer::resume(&dir, ctx, &builder, overrides.device)?,
        None => Trainer::new(cfg, ctx, &builder)?,
    };

    let dataset = trainer.open_dataset()?;
    let summary = trainer.run(dataset)?;
    tracing::info!(
        final_step = summary.final_step,
        skipped_steps = summary.skipped_steps,
        last_loss = summary.last_loss,
        run_id = summary.run_id.as_deref(),
        checkpoint = ?summary.checkpoint,
        "Run complete"
    );
    Ok(())
}

fn inspect(dir: &Path) -> anyhow::Result<()> {
    let meta = read_meta(dir)?;
    let cfg = &meta.config;
    let schedule = LinearWarmupDecay::new(cfg.warmup_steps, cfg.total_steps)?;
    println!("checkpoint:     {}", dir.display());
    println!("format_version: {}", meta.format_version);
    println!("saved_at:       {}", meta.saved_at);
    println!("run_id:         {}", meta.run_id.as_deref().unwrap_or("-"));
    println!("step:           {}/{}", meta.step, cfg.total_steps);
    println!("lr:             {:.3e}", schedule.lr_at(cfg.learning_rate, meta.step));
    println!(
        "loss:           {}",
        meta.loss.map(|l| format!("{:.4}", l)).unwrap_or_else(|| "-".to_string())
    );
    println!(
        "precision:      {}",
        if cfg.mixed_precision {
            format!("{:?}", cfg.precision)
        } else {
            "f32".to_string()
        }
    );
    if let Some(scaler) = &meta.scaler {
        println!("loss_scale:     {}", scaler.scale);
    }
    println!(
        "model:          dim={} layers={} heads={} vocab={}",
        cfg.model.dim, cfg.model.n_layers, cfg.model.n_heads, cfg.model.vocab_size
    );
    Ok(())
}

fn init_config(path: &Path, preset: &str, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        bail!("{} exists; pass --force to overwrite", path.display());
    }
    let cfg = TrainConfig::preset(preset).with_context(|| format!("unknown preset '{}'", preset))?;
    cfg.to_json_file(path)?;
    println!("Wrote {} config to {}", preset, path.display());
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    if cli.json_logs {
        init_logging();
    } else {
        init_console_logging();
    }

    match cli.command {
        Commands::Train {
            config,
            resume,
            batch_size,
            learning_rate,
            warmup_steps,
            total_steps,
            max_seq_len,
            checkpoint_dir,
            metrics_dir,
            seed,
            device,
        } => {
            let device = device
                .as_deref()
                .map(resolve_device_mode)
                .transpose()
                .map_err(anyhow::Error::msg)?;
            let overrides = Overrides {
                batch_size,
                learning_rate,
                warmup_steps,
                total_steps,
                max_seq_len,
                checkpoint_dir,
                metrics_dir,
                seed,
                device,
            };
            if !overrides.is_empty() {
                tracing::debug!(?overrides, "Config overrides");
            }
            train(&config, resume, overrides)
        }
        Commands::Inspect { checkpoint } => inspect(&checkpoint),
        Commands::InitConfig {
            path,
            preset,
            force,
        } => init_config(&path, &preset, force),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_train_config_presets_and_files() {
        for alias in ["tiny-cpu", "tiny_cpu", "small-gpu", "small_gpu"] {
            assert!(resolve_train_config(alias).is_ok(), "alias {alias}");
        }
        assert!(resolve_train_config("nope").is_err());

        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("cfg.json");
        let mut cfg = TrainConfig::tiny_cpu();
        cfg.total_steps = 77;
        cfg.to_json_file(&path).unwrap();
        let loaded = resolve_train_config(path.to_str().unwrap()).unwrap();
        assert_eq!(loaded.total_steps, 77);
    }

    #[test]
    fn test_resolve_device_mode() {
        assert_eq!(resolve_device_mode("cpu"), Ok(DeviceMode::Cpu));
        assert_eq!(resolve_device_mode("cpu-distributed"), Ok(DeviceMode::CpuDistributed));
        assert_eq!(resolve_device_mode("cuda"), Ok(DeviceMode::Gpu));
        assert!(resolve_device_mode("tpu").is_err());
    }

    #[test]
    fn test_overrides_apply() {
        let mut cfg = TrainConfig::tiny_cpu();
        let overrides = Overrides {
            total_steps: Some(500),
            learning_rate: Some(3e-4),
            device: Some(DeviceMode::CpuDistributed),
            ..Overrides::default()
        };
        assert!(!overrides.is_empty());
        overrides.apply(&mut cfg);
        assert_eq!(cfg.total_steps, 500);
        assert_eq!(cfg.learning_rate, 3e-4);
        assert_eq!(cfg.device, DeviceMode::CpuDistributed);
        assert_eq!(cfg.batch_size, TrainConfig::tiny_cpu().batch_size);
    }

    #[test]
    fn test_init_config_refuses_overwrite() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("cfg.json");
        init_config(&path, "tiny-cpu", false).unwrap();
        assert!(init_config(&path, "tiny-cpu", false).is_err());
        init_config(&path, "small-gpu", true).unwrap();
        assert_eq!(
            TrainConfig::from_json_file(&path).unwrap().device,
            DeviceMode::Gpu
        );
    }
}
