//! Run configuration for multi-process pretraining.

use std::path::{Path, PathBuf};

use candle_core::DType;
use serde::{Deserialize, Serialize};

use crate::error::{config_error, IoResultExt, TrainResult};
use crate::model::ModelConfig;
use crate::optim::{AdamWConfig, GradScalerConfig};

fn default_project_name() -> String {
    "llm-pretrain".to_string()
}

fn default_weight_decay() -> f64 {
    0.01
}

fn default_save_interval() -> usize {
    10_000
}

fn default_log_steps() -> usize {
    10
}

fn default_num_workers() -> usize {
    4
}

fn default_prefetch_factor() -> usize {
    10
}

fn default_seed() -> u64 {
    42
}

fn default_true() -> bool {
    true
}

/// Where the process runs and whether it joins a process group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceMode {
    /// One process on the CPU; no rendezvous.
    Cpu,
    /// CPU processes launched with RANK/WORLD_SIZE/LOCAL_RANK, TCP collectives.
    CpuDistributed,
    /// One process per CUDA device, NCCL when available.
    Gpu,
}

impl DeviceMode {
    pub fn is_distributed(&self) -> bool {
        !matches!(self, DeviceMode::Cpu)
    }
}

/// Reduced-precision compute format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrecisionDtype {
    #[default]
    Bf16,
    F16,
}

impl PrecisionDtype {
    pub fn dtype(&self) -> DType {
        match self {
            PrecisionDtype::Bf16 => DType::BF16,
            PrecisionDtype::F16 => DType::F16,
        }
    }
}

/// Precision policy consumed by the step executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precision {
    Full,
    /// Forward in `dtype`, loss in f32, dynamic loss scaling.
    Mixed { dtype: DType },
}

impl Precision {
    pub fn compute_dtype(&self) -> DType {
        match self {
            Precision::Full => DType::F32,
            Precision::Mixed { dtype } => *dtype,
        }
    }

    pub fn is_mixed(&self) -> bool {
        matches!(self, Precision::Mixed { .. })
    }
}

/// Text tokenizer selection.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TokenizerConfig {
    /// Raw UTF-8 bytes; pad/eos is byte 0.
    #[default]
    Byte,
    /// A HuggingFace `tokenizer.json`.
    HuggingFace {
        path: PathBuf,
        /// Token used as pad and end-of-sequence.
        #[serde(default = "default_eos_token")]
        eos_token: String,
    },
}

fn default_eos_token() -> String {
    "</s>".to_string()
}

/// Training data selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DatasetConfig {
    /// JSON Lines with `input_ids` or `text` per line.
    Jsonl { path: PathBuf },
    /// Deterministic random records, for smoke runs and tests.
    Synthetic {
        num_records: usize,
        min_len: usize,
        max_len: usize,
    },
}

impl Default for DatasetConfig {
    fn default() -> Self {
        DatasetConfig::Synthetic {
            num_records: 1024,
            min_len: 8,
            max_len: 96,
        }
    }
}

/// Full hyperparameter set; persisted verbatim in checkpoint metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainConfig {
    /// Display name of the tracked run
    #[serde(default)]
    pub run_name: Option<String>,
    #[serde(default = "default_project_name")]
    pub project_name: String,

    /// Global batch size, split evenly across processes
    pub batch_size: usize,
    pub learning_rate: f64,
    pub warmup_steps: usize,
    pub total_steps: usize,
    #[serde(default = "default_weight_decay")]
    pub weight_decay: f64,
    /// Global L2 gradient clip threshold (None = disabled)
    #[serde(default)]
    pub grad_clip: Option<f64>,

    pub device: DeviceMode,
    #[serde(default = "default_true")]
    pub mixed_precision: bool,
    #[serde(default)]
    pub precision: PrecisionDtype,
    #[serde(default)]
    pub scaler: GradScalerConfig,

    pub max_seq_len: usize,
    pub model: ModelConfig,
    #[serde(default)]
    pub tokenizer: TokenizerConfig,
    #[serde(default)]
    pub dataset: DatasetConfig,
    pub cache_dir: PathBuf,
    #[serde(default)]
    pub keep_dataset_in_memory: bool,
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,
    #[serde(default = "default_prefetch_factor")]
    pub prefetch_factor: usize,
    #[serde(default = "default_seed")]
    pub seed: u64,

    pub checkpoint_dir: PathBuf,
    #[serde(default = "default_save_interval")]
    pub save_interval: usize,
    #[serde(default = "default_log_steps")]
    pub log_steps: usize,
    /// Root for the JSONL metrics sink (None = metrics are dropped)
    #[serde(default)]
    pub metrics_dir: Option<PathBuf>,
}

impl TrainConfig {
    /// Validate configuration and return the list of errors.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        if self.batch_size == 0 {
            errors.push("batch_size must be greater than 0".to_string());
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            errors.push(format!(
                "learning_rate must be > 0, got {}",
                self.learning_rate
            ));
        }
        if self.warmup_steps >= self.total_steps {
            errors.push(format!(
                "warmup_steps ({}) must be < total_steps ({})",
                self.warmup_steps, self.total_steps
            ));
        }
        if self.weight_decay < 0.0 {
            errors.push(format!("weight_decay must be >= 0, got {}", self.weight_decay));
        }
        if let Some(clip) = self.grad_clip {
            if !(clip.is_finite() && clip > 0.0) {
                errors.push(format!("grad_clip must be > 0 when set, got {}", clip));
            }
        }
        if self.max_seq_len == 0 {
            errors.push("max_seq_len must be greater than 0".to_string());
        }
        if self.max_seq_len > self.model.max_seq_len {
            errors.push(format!(
                "max_seq_len ({}) exceeds model.max_seq_len ({})",
                self.max_seq_len, self.model.max_seq_len
            ));
        }
        if self.save_interval == 0 {
            errors.push("save_interval must be greater than 0".to_string());
        }
        if self.log_steps == 0 {
            errors.push("log_steps must be greater than 0".to_string());
        }
        if self.num_workers == 0 || self.prefetch_factor == 0 {
            errors.push("num_workers and prefetch_factor must be greater than 0".to_string());
        }
        if let DatasetConfig::Synthetic {
            num_records,
            min_len,
            max_len,
        } = &self.dataset
        {
            if *num_records == 0 || *min_len == 0 || min_len > max_len {
                errors.push(format!(
                    "synthetic dataset needs num_records > 0 and 1 <= min_len <= max_len, got {}/{}/{}",
                    num_records, min_len, max_len
                ));
            }
        }
        if let Err(model_errors) = self.model.validate() {
            errors.extend(model_errors);
        }
        if self.mixed_precision {
            if let Err(scaler_errors) = self.scaler.validate() {
                errors.extend(scaler_errors);
            }
            if self.device == DeviceMode::Cpu {
                warnings.push(
                    "mixed_precision on CPU runs reduced-precision kernels slowly".to_string(),
                );
            }
        }
        if self.warmup_steps == 0 {
            warnings.push("warmup_steps = 0: first update runs at the full learning rate".to_string());
        }

        for warning in &warnings {
            tracing::warn!("Config warning: {}", warning);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    pub fn precision_policy(&self) -> Precision {
        if self.mixed_precision {
            Precision::Mixed {
                dtype: self.precision.dtype(),
            }
        } else {
            Precision::Full
        }
    }

    pub fn adamw_config(&self) -> AdamWConfig {
        AdamWConfig {
            weight_decay: self.weight_decay,
            ..AdamWConfig::default()
        }
    }

    /// Per-process batch size; the global batch must divide evenly.
    pub fn local_batch_size(&self, world_size: usize) -> TrainResult<usize> {
        if world_size == 0 || self.batch_size % world_size != 0 {
            return Err(config_error(format!(
                "batch_size ({}) must be divisible by world size ({})",
                self.batch_size, world_size
            )));
        }
        Ok(self.batch_size / world_size)
    }

    pub fn from_json_file(path: &Path) -> TrainResult<Self> {
        let raw = std::fs::read_to_string(path).with_path(path)?;
        serde_json::from_str(&raw)
            .map_err(|e| config_error(format!("invalid config {}: {}", path.display(), e)))
    }

    pub fn to_json_file(&self, path: &Path) -> TrainResult<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json).with_path(path)
    }

    /// Byte-level model on synthetic data; finishes in seconds on a laptop.
    pub fn tiny_cpu() -> Self {
        Self {
            run_name: Some("tiny-cpu".to_string()),
            project_name: default_project_name(),
            batch_size: 4,
            learning_rate: 1e-3,
            warmup_steps: 10,
            total_steps: 100,
            weight_decay: default_weight_decay(),
            grad_clip: Some(1.0),
            device: DeviceMode::Cpu,
            mixed_precision: false,
            precision: PrecisionDtype::Bf16,
            scaler: GradScalerConfig::default(),
            max_seq_len: 64,
            model: ModelConfig {
                max_seq_len: 64,
                ..ModelConfig::tiny()
            },
            tokenizer: TokenizerConfig::Byte,
            dataset: DatasetConfig::default(),
            cache_dir: PathBuf::from("cache"),
            keep_dataset_in_memory: true,
            num_workers: 2,
            prefetch_factor: 4,
            seed: default_seed(),
            checkpoint_dir: PathBuf::from("checkpoints/tiny-cpu"),
            save_interval: 50,
            log_steps: 10,
            metrics_dir: Some(PathBuf::from("runs")),
        }
    }

    /// ~110M model, bf16, 8-way data parallel.
    pub fn small_gpu() -> Self {
        Self {
            run_name: Some("small-gpu".to_string()),
            project_name: default_project_name(),
            batch_size: 256,
            learning_rate: 1e-4,
            warmup_steps: 10_000,
            total_steps: 1_000_000,
            weight_decay: default_weight_decay(),
            grad_clip: None,
            device: DeviceMode::Gpu,
            mixed_precision: true,
            precision: PrecisionDtype::Bf16,
            scaler: GradScalerConfig::default(),
            max_seq_len: 1024,
            model: ModelConfig::small(),
            tokenizer: TokenizerConfig::HuggingFace {
                path: PathBuf::from("tokenizer.json"),
                eos_token: default_eos_token(),
            },
            dataset: DatasetConfig::Jsonl {
                path: PathBuf::from("data/train.jsonl"),
            },
            cache_dir: PathBuf::from("cache"),
            keep_dataset_in_memory: false,
            num_workers: default_num_workers(),
            prefetch_factor: default_prefetch_factor(),
            seed: default_seed(),
            checkpoint_dir: PathBuf::from("checkpoints/small-gpu"),
            save_interval: default_save_interval(),
            log_steps: default_log_steps(),
            metrics_dir: Some(PathBuf::from("runs")),
        }
    }

    pub fn preset(name: &str) -> Option<Self> {
        match name {
            "tiny_cpu" | "tiny-cpu" => Some(Self::tiny_cpu()),
            "small_gpu" | "small-gpu" => Some(Self::small_gpu()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets_validate() {
        TrainConfig::tiny_cpu()
            .validate()
            .expect("tiny_cpu should validate");
        TrainConfig::small_gpu()
            .validate()
            .expect("small_gpu should validate");
        assert!(TrainConfig::preset("nope").is_none());
    }

    #[test]
    fn test_config_serde_roundtrip() {
        let cfg = TrainConfig::small_gpu();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: TrainConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg, cfg2);
    }

    #[test]
    fn test_defaults_fill_optional_fields() {
        let json = r#"{
            "batch_size": 8,
            "learning_rate": 0.0003,
            "warmup_steps": 5,
            "total_steps": 50,
            "device": "cpu-distributed",
            "max_seq_len": 32,
            "model": {"vocab_size": 256, "dim": 32, "n_layers": 1, "n_heads": 2,
                      "n_kv_heads": 2, "ffn_dim": 64, "max_seq_len": 32},
            "cache_dir": "cache",
            "checkpoint_dir": "ckpt"
        }"#;
        let cfg: TrainConfig = serde_json::from_str(json).unwrap();
        assert!(cfg.mixed_precision);
        assert_eq!(cfg.precision_policy(), Precision::Mixed { dtype: DType::BF16 });
        assert_eq!(cfg.scaler.growth_interval, 2000);
        assert_eq!(cfg.weight_decay, 0.01);
        assert_eq!(cfg.grad_clip, None);
        assert_eq!(cfg.tokenizer, TokenizerConfig::Byte);
        assert!(cfg.device.is_distributed());
        cfg.validate().unwrap();
    }

    #[test]
    fn test_validate_collects_all_errors() {
        let mut cfg = TrainConfig::tiny_cpu();
        cfg.warmup_steps = cfg.total_steps;
        cfg.batch_size = 0;
        cfg.max_seq_len = cfg.model.max_seq_len + 1;
        let errors = cfg.validate().unwrap_err();
        assert_eq!(errors.len(), 3, "{:?}", errors);
    }

    #[test]
    fn test_local_batch_requires_even_split() {
        let cfg = TrainConfig::small_gpu();
        assert_eq!(cfg.local_batch_size(8).unwrap(), 32);
        assert!(cfg.local_batch_size(3).is_err());
    }
}
