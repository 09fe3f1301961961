//! Training checkpoint save/load.
//!
//! A checkpoint is one directory:
//!   - `model.safetensors`: parameters
//!   - `optimizer.safetensors`: AdamW moments and update counter
//!   - `scheduler.json`: LR schedule snapshot
//!   - `meta.json`: format version, full config, step, run id, scaler
//!   - tokenizer artifact(s)
//!
//! Saves are staged in a sibling temporary directory and swapped into place,
//! so a reader sees either the previous checkpoint or the new one.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor};
use serde::{Deserialize, Serialize};

use crate::config::TrainConfig;
use crate::data::tokenizer::{load_tokenizer, TextTokenizer, TOKENIZER_CONFIG_FILE};
use crate::distributed::Role;
use crate::error::{checkpoint_error, IoResultExt, TrainResult};
use crate::logging::{log_checkpoint_load, log_checkpoint_save};
use crate::model::ModelBuilder;
use crate::optim::{GradScaler, GradScalerState, ScheduleState};
use crate::state::TrainingState;

pub const FORMAT_VERSION: u32 = 1;
pub const MODEL_FILE: &str = "model.safetensors";
pub const OPTIMIZER_FILE: &str = "optimizer.safetensors";
pub const SCHEDULER_FILE: &str = "scheduler.json";
pub const META_FILE: &str = "meta.json";

const REQUIRED_FILES: [&str; 5] = [
    META_FILE,
    MODEL_FILE,
    OPTIMIZER_FILE,
    SCHEDULER_FILE,
    TOKENIZER_CONFIG_FILE,
];

const LR_REL_TOLERANCE: f64 = 1e-12;

/// Metadata stored alongside model weights.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub format_version: u32,
    pub config: TrainConfig,
    pub step: usize,
    pub run_id: Option<String>,
    pub scaler: Option<GradScalerState>,
    /// Last logged loss, informational only.
    #[serde(default)]
    pub loss: Option<f64>,
    /// RFC 3339 wall-clock time of the save.
    pub saved_at: String,
}

/// Everything `load` reconstructs.
pub struct LoadedCheckpoint {
    pub state: TrainingState,
    pub config: TrainConfig,
    pub tokenizer: Box<dyn TextTokenizer>,
    pub meta: CheckpointMeta,
}

/// Writes checkpoints for the coordinator; a no-op on workers.
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    dir: PathBuf,
    role: Role,
}

impl CheckpointManager {
    pub fn new(dir: impl Into<PathBuf>, role: Role) -> Self {
        Self {
            dir: dir.into(),
            role,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Snapshot `state`. Returns the checkpoint directory on the
    /// coordinator and `None` on workers. Saving twice at the same step
    /// overwrites in place.
    pub fn save(
        &self,
        state: &TrainingState,
        config: &TrainConfig,
        tokenizer: &dyn TextTokenizer,
        loss: Option<f64>,
    ) -> TrainResult<Option<PathBuf>> {
        if !self.role.is_coordinator() {
            return Ok(None);
        }

        let parent = match self.dir.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&parent).with_path(&parent)?;
        let staging = tempfile::Builder::new()
            .prefix(".ckpt-staging-")
            .tempdir_in(&parent)
            .with_path(&parent)?;

        write_artifacts(staging.path(), state, config, tokenizer, loss)?;
        self.swap_into_place(staging.into_path())?;

        log_checkpoint_save(state.step, &self.dir.display().to_string(), loss);
        Ok(Some(self.dir.clone()))
    }

    fn previous_dir(&self) -> PathBuf {
        let mut name = self
            .dir
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".previous");
        self.dir.with_file_name(name)
    }

    fn swap_into_place(&self, staged: PathBuf) -> TrainResult<()> {
        let previous = self.previous_dir();
        if previous.exists() {
            std::fs::remove_dir_all(&previous).with_path(&previous)?;
        }
        if self.dir.exists() {
            std::fs::rename(&self.dir, &previous).with_path(&self.dir)?;
        }
        std::fs::rename(&staged, &self.dir).with_path(&self.dir)?;
        if previous.exists() {
            std::fs::remove_dir_all(&previous).with_path(&previous)?;
        }
        Ok(())
    }
}

fn write_artifacts(
    dir: &Path,
    state: &TrainingState,
    config: &TrainConfig,
    tokenizer: &dyn TextTokenizer,
    loss: Option<f64>,
) -> TrainResult<()> {
    let mut weights: HashMap<String, Tensor> = HashMap::with_capacity(state.params.len());
    for (name, var) in state.params.iter() {
        weights.insert(name.clone(), var.as_tensor().to_device(&Device::Cpu)?);
    }
    candle_core::safetensors::save(&weights, dir.join(MODEL_FILE))?;
    candle_core::safetensors::save(&state.optimizer.state_tensors()?, dir.join(OPTIMIZER_FILE))?;

    let schedule = state.schedule.state(state.base_lr, state.step);
    write_json(&dir.join(SCHEDULER_FILE), &schedule)?;

    tokenizer.save(dir)?;

    let meta = CheckpointMeta {
        format_version: FORMAT_VERSION,
        config: config.clone(),
        step: state.step,
        run_id: state.run_id.clone(),
        scaler: state.scaler.as_ref().map(GradScaler::state),
        loss,
        saved_at: chrono::Utc::now().to_rfc3339(),
    };
    // Written last: a directory with meta.json is complete.
    write_json(&dir.join(META_FILE), &meta)
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> TrainResult<()> {
    let json = serde_json::to_string_pretty(value)?;
    std::fs::write(path, json).with_path(path)
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> TrainResult<T> {
    let raw = std::fs::read_to_string(path).with_path(path)?;
    serde_json::from_str(&raw).map_err(|e| checkpoint_error(format!("invalid JSON: {}", e), path))
}

/// Resolve a checkpoint directory, falling back to the `.previous` copy
/// left behind by a save interrupted mid-swap.
fn resolve_dir(dir: &Path) -> PathBuf {
    if dir.join(META_FILE).exists() {
        return dir.to_path_buf();
    }
    let previous = CheckpointManager::new(dir, Role::Coordinator).previous_dir();
    if previous.join(META_FILE).exists() {
        tracing::warn!(
            path = %previous.display(),
            "Checkpoint swap was interrupted; using the previous checkpoint"
        );
        return previous;
    }
    dir.to_path_buf()
}

/// Whether `dir` (or its interrupted-swap fallback) holds a checkpoint.
pub fn checkpoint_exists(dir: &Path) -> bool {
    resolve_dir(dir).join(META_FILE).exists()
}

/// Read only the metadata record.
pub fn read_meta(dir: &Path) -> TrainResult<CheckpointMeta> {
    let dir = resolve_dir(dir);
    let meta: CheckpointMeta = read_json(&dir.join(META_FILE))?;
    if meta.format_version != FORMAT_VERSION {
        return Err(checkpoint_error(
            format!(
                "unsupported checkpoint format version {} (expected {})",
                meta.format_version, FORMAT_VERSION
            ),
            &dir,
        ));
    }
    Ok(meta)
}

/// Rebuild a [`TrainingState`] from `dir`.
///
/// Order: metadata, model skeleton + parameters (strict), optimizer
/// (strict), schedule (cross-checked), scaler, tokenizer.
pub fn load(dir: &Path, builder: &dyn ModelBuilder, device: &Device) -> TrainResult<LoadedCheckpoint> {
    let dir = resolve_dir(dir);
    for file in REQUIRED_FILES {
        if !dir.join(file).exists() {
            return Err(checkpoint_error(format!("missing artifact {}", file), &dir));
        }
    }

    let meta = read_meta(&dir)?;
    let config = meta.config.clone();
    let mut state = TrainingState::new(&config, builder, device)?;

    load_parameters(&dir.join(MODEL_FILE), &state, device)?;

    let optimizer_path = dir.join(OPTIMIZER_FILE);
    let optimizer_tensors = candle_core::safetensors::load(&optimizer_path, &Device::Cpu)?;
    state
        .optimizer
        .import_state(&optimizer_tensors)
        .map_err(|e| checkpoint_error(e.to_string(), &optimizer_path))?;
    if state.optimizer.step_count() > meta.step {
        return Err(checkpoint_error(
            format!(
                "optimizer applied {} updates but metadata says step {}",
                state.optimizer.step_count(),
                meta.step
            ),
            &optimizer_path,
        ));
    }

    let scheduler_path = dir.join(SCHEDULER_FILE);
    let schedule_state: ScheduleState = read_json(&scheduler_path)?;
    restore_schedule(&mut state, &schedule_state, &config, meta.step)
        .map_err(|msg| checkpoint_error(msg, &scheduler_path))?;

    state.scaler = match (&meta.scaler, state.precision.is_mixed()) {
        (Some(s), true) => Some(GradScaler::from_state(s)),
        (None, false) => None,
        (None, true) => {
            return Err(checkpoint_error(
                "mixed precision checkpoint without loss scaler state",
                dir.join(META_FILE),
            ))
        }
        (Some(_), false) => {
            tracing::warn!("Ignoring loss scaler state in a full-precision checkpoint");
            None
        }
    };

    let tokenizer = load_tokenizer(&dir)?;
    state.run_id = meta.run_id.clone();

    log_checkpoint_load(state.step, &dir.display().to_string(), state.run_id.as_deref());
    Ok(LoadedCheckpoint {
        state,
        config,
        tokenizer,
        meta,
    })
}

fn load_parameters(path: &Path, state: &TrainingState, device: &Device) -> TrainResult<()> {
    let tensors = candle_core::safetensors::load(path, device)?;

    let mut unexpected: Vec<&String> = tensors
        .keys()
        .filter(|k| !state.params.names().contains(k))
        .collect();
    if !unexpected.is_empty() {
        unexpected.sort();
        return Err(checkpoint_error(
            format!("unexpected tensors in checkpoint: {:?}", unexpected),
            path,
        ));
    }

    for (name, var) in state.params.iter() {
        let t = tensors
            .get(name)
            .ok_or_else(|| checkpoint_error(format!("missing tensor '{}'", name), path))?;
        if t.dims() != var.dims() {
            return Err(checkpoint_error(
                format!(
                    "shape mismatch for '{}': model {:?}, checkpoint {:?}",
                    name,
                    var.dims(),
                    t.dims()
                ),
                path,
            ));
        }
        var.set(&t.to_dtype(var.dtype())?)?;
    }
    Ok(())
}

/// Learning rates compared after a JSON round trip.
fn same_lr(a: f64, b: f64) -> bool {
    (a - b).abs() <= LR_REL_TOLERANCE * a.abs().max(b.abs())
}

fn restore_schedule(
    state: &mut TrainingState,
    saved: &ScheduleState,
    config: &TrainConfig,
    step: usize,
) -> Result<(), String> {
    if saved.warmup_steps != config.warmup_steps
        || saved.total_steps != config.total_steps
        || !same_lr(saved.base_lr, config.learning_rate)
    {
        return Err(format!(
            "schedule (W={}, T={}, lr={}) disagrees with config (W={}, T={}, lr={})",
            saved.warmup_steps,
            saved.total_steps,
            saved.base_lr,
            config.warmup_steps,
            config.total_steps,
            config.learning_rate
        ));
    }
    if saved.last_step != step {
        return Err(format!(
            "schedule is at step {} but metadata says {}",
            saved.last_step, step
        ));
    }
    let schedule = saved.schedule().map_err(|e| e.to_string())?;
    let lr = schedule.lr_at(saved.base_lr, step);
    if !same_lr(lr, saved.last_lr) {
        return Err(format!(
            "recomputed LR {} does not match saved LR {}",
            lr, saved.last_lr
        ));
    }

    state.schedule = schedule;
    state.base_lr = saved.base_lr;
    state.step = step;
    state.optimizer.set_lr(lr);
    Ok(())
}
