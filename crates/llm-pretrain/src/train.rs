//! Run loop: sampling, step counting, periodic logging and checkpointing.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use indicatif::{ProgressBar, ProgressStyle};

use crate::checkpoint::{self, CheckpointManager};
use crate::config::{DeviceMode, TrainConfig};
use crate::data::{
    build_tokenizer, crop_rng, open_dataset, BatchPreparer, PrefetchLoader, RandomSampler,
    RecordDataset, TextTokenizer,
};
use crate::distributed::DistContext;
use crate::error::{config_error, TrainError, TrainResult};
use crate::logging::{log_training_step, TrainingMetrics};
use crate::metrics::{build_sink, MetricsSink};
use crate::model::ModelBuilder;
use crate::state::TrainingState;
use crate::step::{StepExecutor, StepOutcome};

/// What a call to [`Trainer::run`] did.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub start_step: usize,
    pub final_step: usize,
    pub skipped_steps: usize,
    /// Loss of the last executed step (rank-averaged).
    pub last_loss: Option<f64>,
    /// Set on the coordinator only.
    pub run_id: Option<String>,
    /// Set on the coordinator only.
    pub checkpoint: Option<PathBuf>,
}

/// Step outcomes accumulated between two log points.
#[derive(Debug, Default)]
struct LogWindow {
    loss_sum: f64,
    loss_count: usize,
    grad_norm_sum: f64,
    applied: usize,
    skipped: usize,
    tokens: usize,
    started: Option<Instant>,
}

impl LogWindow {
    fn record(&mut self, outcome: &StepOutcome) {
        self.started.get_or_insert_with(Instant::now);
        if outcome.loss.is_finite() {
            self.loss_sum += outcome.loss;
            self.loss_count += 1;
        }
        if outcome.skipped {
            self.skipped += 1;
        } else {
            self.grad_norm_sum += outcome.grad_norm;
            self.applied += 1;
        }
        self.tokens += outcome.tokens;
    }

    fn summarize(&self, last: &StepOutcome) -> TrainingMetrics {
        let loss = if self.loss_count > 0 {
            self.loss_sum / self.loss_count as f64
        } else {
            f64::NAN
        };
        let grad_norm = if self.applied > 0 {
            self.grad_norm_sum / self.applied as f64
        } else {
            f64::NAN
        };
        let elapsed = self
            .started
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or_default();
        let tokens_per_sec = if elapsed > 0.0 {
            self.tokens as f64 / elapsed
        } else {
            0.0
        };
        let metrics = TrainingMetrics::new(loss, last.lr, grad_norm, tokens_per_sec)
            .with_skipped_steps(self.skipped);
        match last.loss_scale {
            Some(scale) => metrics.with_loss_scale(scale),
            None => metrics,
        }
    }
}

fn sink_record(metrics: &TrainingMetrics) -> BTreeMap<String, f64> {
    let mut record = BTreeMap::new();
    record.insert("loss".to_string(), metrics.loss);
    record.insert("perplexity".to_string(), metrics.perplexity);
    record.insert("lr".to_string(), metrics.learning_rate);
    record.insert("grad_norm".to_string(), metrics.grad_norm);
    record.insert("tokens_per_sec".to_string(), metrics.tokens_per_sec);
    record.insert("skipped_steps".to_string(), metrics.skipped_steps as f64);
    if let Some(scale) = metrics.loss_scale {
        record.insert("loss_scale".to_string(), scale);
    }
    record
}

/// Step counter on the coordinator's terminal; hidden on workers.
fn progress_bar(is_coordinator: bool, start_step: usize, stop_step: usize) -> ProgressBar {
    if !is_coordinator {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(stop_step as u64);
    let style = ProgressStyle::default_bar()
        .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} ETA:{eta} {msg}")
        .map(|style| style.progress_chars("=>-"))
        .unwrap_or_else(|_| ProgressStyle::default_bar());
    pb.set_style(style);
    pb.set_position(start_step as u64);
    pb
}

/// Owns the training state of one process and drives it to the step budget.
pub struct Trainer {
    config: TrainConfig,
    ctx: DistContext,
    state: TrainingState,
    tokenizer: Box<dyn TextTokenizer>,
    executor: StepExecutor,
    checkpoints: CheckpointManager,
    sink: Box<dyn MetricsSink>,
}

impl Trainer {
    /// Fresh run at step 0.
    pub fn new(config: TrainConfig, ctx: DistContext, builder: &dyn ModelBuilder) -> TrainResult<Self> {
        if let Err(errors) = config.validate() {
            return Err(config_error(errors.join("; ")));
        }
        let tokenizer = build_tokenizer(&config.tokenizer, config.max_seq_len)?;
        let state = TrainingState::new(&config, builder, &ctx.device)?;
        Self::assemble(config, ctx, state, tokenizer)
    }

    /// Continue from the checkpoint in `dir`, using the configuration stored
    /// with it. Every rank loads the same directory. `device` replaces the
    /// stored device mode; later checkpoints record the replacement.
    pub fn resume(
        dir: &Path,
        ctx: DistContext,
        builder: &dyn ModelBuilder,
        device: Option<DeviceMode>,
    ) -> TrainResult<Self> {
        let loaded = checkpoint::load(dir, builder, &ctx.device)?;
        let mut config = loaded.config;
        config.checkpoint_dir = dir.to_path_buf();
        if let Some(device) = device {
            config.device = device;
        }
        Self::assemble(config, ctx, loaded.state, loaded.tokenizer)
    }

    fn assemble(
        config: TrainConfig,
        ctx: DistContext,
        state: TrainingState,
        tokenizer: Box<dyn TextTokenizer>,
    ) -> TrainResult<Self> {
        let model_vocab = state.model.vocab_size();
        if tokenizer.vocab_size() > model_vocab {
            return Err(config_error(format!(
                "tokenizer vocabulary ({}) exceeds model vocabulary ({})",
                tokenizer.vocab_size(),
                model_vocab
            )));
        }
        // Every rank needs the same global batch split before any data moves.
        config.local_batch_size(ctx.world_size())?;

        let checkpoints = CheckpointManager::new(config.checkpoint_dir.clone(), ctx.role);
        let sink = build_sink(&config);
        Ok(Self {
            executor: StepExecutor::new(config.grad_clip),
            config,
            ctx,
            state,
            tokenizer,
            checkpoints,
            sink,
        })
    }

    /// Replace the sink chosen by `metrics_dir`.
    pub fn with_sink(mut self, sink: Box<dyn MetricsSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn config(&self) -> &TrainConfig {
        &self.config
    }

    pub fn state(&self) -> &TrainingState {
        &self.state
    }

    pub fn tokenizer(&self) -> &dyn TextTokenizer {
        self.tokenizer.as_ref()
    }

    pub fn context(&self) -> &DistContext {
        &self.ctx
    }

    /// Open the configured dataset. The coordinator builds any token cache
    /// first; workers open it after a barrier.
    pub fn open_dataset(&self) -> TrainResult<Arc<dyn RecordDataset>> {
        let open = || {
            open_dataset(
                &self.config.dataset,
                self.tokenizer.as_ref(),
                &self.config.cache_dir,
                self.config.keep_dataset_in_memory,
                self.config.seed,
            )
        };
        let dataset = if self.ctx.role.is_coordinator() {
            let dataset = open()?;
            self.ctx.group.barrier()?;
            dataset
        } else {
            self.ctx.group.barrier()?;
            open()?
        };
        tracing::info!(records = dataset.len(), "Dataset ready");
        Ok(Arc::from(dataset))
    }

    /// Train until `total_steps`.
    pub fn run(&mut self, dataset: Arc<dyn RecordDataset>) -> TrainResult<RunSummary> {
        let total = self.config.total_steps;
        self.run_until(dataset, total)
    }

    /// Train until `stop_step` (clamped to `total_steps`), then checkpoint.
    /// Stopping early leaves a checkpoint that [`Trainer::resume`] continues
    /// exactly.
    pub fn run_until(&mut self, dataset: Arc<dyn RecordDataset>, stop_step: usize) -> TrainResult<RunSummary> {
        let rank = self.ctx.rank();
        let world_size = self.ctx.world_size();
        let is_coordinator = self.ctx.role.is_coordinator();
        let stop_step = stop_step.min(self.config.total_steps);
        let start_step = self.state.step;
        let local_batch = self.config.local_batch_size(world_size)?;

        self.state.params.broadcast_from_root(self.ctx.group.as_ref())?;

        let sampler = RandomSampler::new(dataset.len(), local_batch, self.config.seed, rank)?;
        let preparer = BatchPreparer::new(self.tokenizer.pad_id(), self.config.max_seq_len);
        let mut loader = PrefetchLoader::new(
            dataset,
            sampler,
            start_step..stop_step.max(start_step),
            self.config.num_workers,
            self.config.prefetch_factor,
        );

        self.ctx.group.barrier()?;
        if is_coordinator {
            let run_id = self.sink.init_run(self.state.run_id.as_deref())?;
            self.state.run_id = Some(run_id);
        }

        tracing::info!(
            start_step,
            stop_step,
            total_steps = self.config.total_steps,
            local_batch,
            world_size,
            params = self.state.params.numel(),
            "Starting training"
        );

        let log_steps = self.config.log_steps.max(1);
        let save_interval = self.config.save_interval;
        let mut window = LogWindow::default();
        let mut skipped_steps = 0;
        let mut last_loss = None;
        let mut checkpoint = None;
        let pb = progress_bar(is_coordinator, start_step, stop_step);

        while self.state.step < stop_step {
            let raw = loader.next_batch().ok_or_else(|| {
                TrainError::DataLoading(format!(
                    "loader exhausted at step {} before step {}",
                    self.state.step, stop_step
                ))
            })??;
            if raw.step != self.state.step {
                return Err(TrainError::DataLoading(format!(
                    "loader delivered step {} while training step {}",
                    raw.step, self.state.step
                )));
            }

            let mut rng = crop_rng(self.config.seed, rank, raw.step);
            let batch = preparer.prepare(&raw.records, &mut rng)?;
            let outcome = self
                .executor
                .execute(&mut self.state, &batch, self.ctx.group.as_ref())?;

            window.record(&outcome);
            if outcome.skipped {
                skipped_steps += 1;
            }
            last_loss = Some(outcome.loss);
            pb.inc(1);

            if outcome.step % log_steps == 0 {
                let metrics = window.summarize(&outcome);
                if is_coordinator {
                    pb.set_message(format!("loss: {:.4} | lr: {:.2e}", metrics.loss, metrics.learning_rate));
                    log_training_step(outcome.step, &metrics);
                    self.sink.log(outcome.step, &sink_record(&metrics))?;
                }
                window = LogWindow::default();
            }

            if save_interval > 0 && outcome.step % save_interval == 0 && outcome.step < stop_step {
                checkpoint = self.save(last_loss)?.or(checkpoint);
            }
        }
        drop(loader);
        pb.finish();

        if self.state.step > start_step || !checkpoint::checkpoint_exists(self.checkpoints.dir()) {
            checkpoint = self.save(last_loss)?.or(checkpoint);
        }
        self.sink.finish()?;

        tracing::info!(
            final_step = self.state.step,
            steps = self.state.step - start_step,
            skipped_steps,
            finished = self.state.is_finished(),
            "Training stopped"
        );

        Ok(RunSummary {
            start_step,
            final_step: self.state.step,
            skipped_steps,
            last_loss,
            run_id: if is_coordinator { self.state.run_id.clone() } else { None },
            checkpoint,
        })
    }

    fn save(&self, loss: Option<f64>) -> TrainResult<Option<PathBuf>> {
        self.checkpoints
            .save(&self.state, &self.config, self.tokenizer.as_ref(), loss)
    }
}
