//! Integration tests for full training workflows
//!
//! These tests drive the public API end to end:
//! - JSONL dataset through the tokenized cache into a full run
//! - Interrupted run resumed into the same metrics stream
//! - Overflowing model under scaled precision
//! - Checkpoint directory layout and idempotent saves

use std::path::Path;
use std::sync::Arc;

use candle_core::{DType, Device, Result, Tensor};
use candle_nn::{Init, VarBuilder};
use llm_pretrain::{
    checkpoint::{self, CheckpointManager, FORMAT_VERSION, META_FILE, MODEL_FILE, OPTIMIZER_FILE},
    config::{DatasetConfig, TrainConfig},
    data::{ByteTokenizer, InMemoryDataset, RecordDataset},
    distributed::{DistContext, Role},
    error::TrainError,
    metrics::{NullSink, METRICS_FILE},
    model::{CausalLm, ModelBuilder, TinyLlamaBuilder},
    state::TrainingState,
    train::Trainer,
};

fn tiny_config(root: &Path, total_steps: usize) -> TrainConfig {
    let mut cfg = TrainConfig::tiny_cpu();
    cfg.total_steps = total_steps;
    cfg.warmup_steps = 1;
    cfg.log_steps = 2;
    cfg.save_interval = 2;
    cfg.checkpoint_dir = root.join("ckpt");
    cfg.cache_dir = root.join("cache");
    cfg.metrics_dir = Some(root.join("runs"));
    cfg
}

fn write_corpus(path: &Path) {
    let lines: Vec<String> = (0..24)
        .map(|i| {
            let text = format!("fn item_{i}() -> u32 {{ {} }}", "x + 1 ".repeat(i % 7 + 1));
            serde_json::json!({ "text": text }).to_string()
        })
        .collect();
    std::fs::write(path, lines.join("\n")).unwrap();
}

fn params_of(state: &TrainingState) -> Result<Vec<Vec<f32>>> {
    state
        .params
        .vars()
        .iter()
        .map(|v| v.as_tensor().flatten_all()?.to_vec1::<f32>())
        .collect()
}

#[test]
fn test_jsonl_run_resumes_into_same_metrics_stream() -> Result<()> {
    let tmp = tempfile::tempdir().unwrap();
    let corpus = tmp.path().join("corpus.jsonl");
    write_corpus(&corpus);

    let mut cfg = tiny_config(tmp.path(), 6);
    cfg.dataset = DatasetConfig::Jsonl { path: corpus };
    cfg.keep_dataset_in_memory = false;
    let builder = TinyLlamaBuilder::new(cfg.model.clone());

    let mut first = Trainer::new(cfg.clone(), DistContext::local(), &builder).unwrap();
    let dataset = first.open_dataset().unwrap();
    assert_eq!(dataset.len(), 24);
    let partial = first.run_until(dataset, 4).unwrap();
    assert_eq!(partial.final_step, 4);
    let run_id = partial.run_id.clone().unwrap();
    drop(first);

    let cached: Vec<_> = std::fs::read_dir(&cfg.cache_dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert!(cached.iter().any(|n| n.ends_with(".tokens")));
    assert!(cached.iter().any(|n| n.ends_with(".offsets")));

    let mut resumed = Trainer::resume(&cfg.checkpoint_dir, DistContext::local(), &builder, None).unwrap();
    assert_eq!(resumed.state().step, 4);
    let dataset = resumed.open_dataset().unwrap();
    let summary = resumed.run(dataset).unwrap();
    assert_eq!(summary.final_step, 6);
    assert_eq!(summary.run_id.as_deref(), Some(run_id.as_str()));
    assert!(resumed.state().is_finished());

    let metrics = std::fs::read_to_string(
        tmp.path()
            .join("runs")
            .join(&cfg.project_name)
            .join(&run_id)
            .join(METRICS_FILE),
    )
    .unwrap();
    let steps: Vec<u64> = metrics
        .lines()
        .map(|l| serde_json::from_str::<serde_json::Value>(l).unwrap()["step"].as_u64().unwrap())
        .collect();
    assert_eq!(steps, vec![2, 4, 6]);

    let meta = checkpoint::read_meta(&cfg.checkpoint_dir).unwrap();
    assert_eq!(meta.step, 6);
    assert_eq!(meta.run_id.as_deref(), Some(run_id.as_str()));
    Ok(())
}

#[test]
fn test_resume_with_unknown_run_id_fails() {
    let tmp = tempfile::tempdir().unwrap();
    let cfg = tiny_config(tmp.path(), 4);
    let builder = TinyLlamaBuilder::new(cfg.model.clone());
    let mut trainer = Trainer::new(cfg.clone(), DistContext::local(), &builder).unwrap();
    let dataset = trainer.open_dataset().unwrap();
    trainer.run_until(dataset, 2).unwrap();

    // The metrics store went away between runs.
    std::fs::remove_dir_all(tmp.path().join("runs")).unwrap();
    let mut resumed = Trainer::resume(&cfg.checkpoint_dir, DistContext::local(), &builder, None).unwrap();
    let dataset = resumed.open_dataset().unwrap();
    assert!(matches!(resumed.run(dataset), Err(TrainError::Config(_))));
}

/// Logits are NaN on every forward pass.
struct OverflowLm {
    w: Tensor,
}

impl CausalLm for OverflowLm {
    fn forward(&self, input_ids: &Tensor, _attention_mask: &Tensor) -> Result<Tensor> {
        let (b, t) = input_ids.dims2()?;
        (&self.w * f64::NAN)?
            .reshape((1, 1, 1))?
            .broadcast_as((b, t, 256))?
            .contiguous()
    }

    fn vocab_size(&self) -> usize {
        256
    }
}

struct OverflowLmBuilder;

impl ModelBuilder for OverflowLmBuilder {
    fn build(&self, vb: VarBuilder, _compute_dtype: DType) -> Result<Box<dyn CausalLm>> {
        let w = vb.get_with_hints(1, "w", Init::Const(0.5))?;
        Ok(Box::new(OverflowLm { w }))
    }
}

fn dataset() -> Arc<dyn RecordDataset> {
    let records = (0..16u32).map(|i| (1..10 + i).collect()).collect();
    Arc::new(InMemoryDataset::new(records).unwrap())
}

#[test]
fn test_overflowing_steps_are_skipped_under_loss_scaling() -> Result<()> {
    let tmp = tempfile::tempdir().unwrap();
    let mut cfg = tiny_config(tmp.path(), 6);
    cfg.mixed_precision = true;
    cfg.metrics_dir = None;

    let mut trainer = Trainer::new(cfg.clone(), DistContext::local(), &OverflowLmBuilder).unwrap();
    let before = params_of(trainer.state())?;
    let summary = trainer.run_until(dataset(), 3).unwrap();

    assert_eq!(summary.final_step, 3);
    assert_eq!(summary.skipped_steps, 3);
    assert_eq!(params_of(trainer.state())?, before);
    assert_eq!(trainer.state().optimizer.step_count(), 0);
    let scale = trainer.state().scaler.as_ref().unwrap().scale();
    assert_eq!(scale, cfg.scaler.init_scale * 0.125);

    // The scaler state survives the checkpoint.
    let meta = checkpoint::read_meta(&cfg.checkpoint_dir).unwrap();
    assert_eq!(meta.scaler.unwrap().scale, scale);
    Ok(())
}

#[test]
fn test_overflow_without_loss_scaling_is_fatal() {
    let tmp = tempfile::tempdir().unwrap();
    let mut cfg = tiny_config(tmp.path(), 6);
    cfg.metrics_dir = None;

    let mut trainer = Trainer::new(cfg, DistContext::local(), &OverflowLmBuilder).unwrap();
    match trainer.run(dataset()) {
        Err(TrainError::Divergence { step, .. }) => assert_eq!(step, 0),
        other => panic!("expected divergence, got {:?}", other.map(|s| s.final_step)),
    }
    assert_eq!(trainer.state().step, 0);
}

#[test]
fn test_checkpoint_layout_and_idempotent_save() -> Result<()> {
    let tmp = tempfile::tempdir().unwrap();
    let cfg = tiny_config(tmp.path(), 4);
    let builder = TinyLlamaBuilder::new(cfg.model.clone());
    let mut trainer = Trainer::new(cfg.clone(), DistContext::local(), &builder)
        .unwrap()
        .with_sink(Box::new(NullSink));
    trainer.run_until(dataset(), 2).unwrap();

    let dir = &cfg.checkpoint_dir;
    for file in [META_FILE, MODEL_FILE, OPTIMIZER_FILE] {
        assert!(dir.join(file).exists(), "missing {file}");
    }
    assert_eq!(checkpoint::read_meta(dir).unwrap().format_version, FORMAT_VERSION);

    let manager = CheckpointManager::new(dir.clone(), Role::Coordinator);
    let tokenizer = ByteTokenizer::new(cfg.max_seq_len);
    manager.save(trainer.state(), &cfg, &tokenizer, None).unwrap();
    manager.save(trainer.state(), &cfg, &tokenizer, None).unwrap();
    let entries: Vec<_> = std::fs::read_dir(tmp.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|n| n.starts_with("ckpt") || n.starts_with(".ckpt"))
        .collect();
    assert_eq!(entries, vec!["ckpt".to_string()]);

    let loaded = checkpoint::load(dir, &builder, &Device::Cpu).unwrap();
    assert_eq!(loaded.state.step, 2);
    assert_eq!(loaded.state.lr(), trainer.state().lr());
    assert_eq!(params_of(&loaded.state)?, params_of(trainer.state())?);

    let worker = CheckpointManager::new(tmp.path().join("worker"), Role::Worker);
    assert!(worker.save(trainer.state(), &cfg, &tokenizer, None).unwrap().is_none());
    assert!(!tmp.path().join("worker").exists());
    Ok(())
}
