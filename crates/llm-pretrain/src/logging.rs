//! Structured logging for training with tracing.
//!
//! JSON output for production runs, a pretty console layer for local runs,
//! and per-window metric events with automatic warnings for anomalies
//! (exploding gradients, collapsing loss scale, divergence).

use tracing::{debug, error, info, span, warn, Level, Span};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Gradient norm above which a step is flagged.
const GRAD_NORM_WARN: f64 = 10.0;

/// Loss scale below which fp16 training is likely stuck overflowing.
const LOSS_SCALE_WARN: f64 = 1.0;

/// Initialize structured logging.
///
/// Reads log level from RUST_LOG environment variable (defaults to "info").
/// Outputs JSON-formatted logs for production monitoring.
pub fn init_logging() {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,llm_pretrain=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Structured logging initialized");
}

/// Initialize simple console logging (for local runs/debugging).
pub fn init_console_logging() {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,llm_pretrain=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().pretty())
        .init();
}

/// Span carried by every event of a process so interleaved logs from
/// several ranks can be told apart.
pub fn rank_span(rank: usize, world_size: usize) -> Span {
    span!(Level::INFO, "rank", rank = rank, world_size = world_size)
}

/// Metrics aggregated over one logging window.
#[derive(Debug, Clone)]
pub struct TrainingMetrics {
    /// Mean loss over the window's applied steps.
    pub loss: f64,
    /// exp(loss).
    pub perplexity: f64,
    /// Learning rate after the window's last step.
    pub learning_rate: f64,
    /// Mean global gradient norm (L2, before clipping).
    pub grad_norm: f64,
    /// Throughput in tokens per second (this process).
    pub tokens_per_sec: f64,
    /// Current dynamic loss scale, when scaled precision is on.
    pub loss_scale: Option<f64>,
    /// Steps in the window whose update was skipped.
    pub skipped_steps: usize,
}

impl TrainingMetrics {
    pub fn new(loss: f64, learning_rate: f64, grad_norm: f64, tokens_per_sec: f64) -> Self {
        Self {
            loss,
            perplexity: loss.exp(),
            learning_rate,
            grad_norm,
            tokens_per_sec,
            loss_scale: None,
            skipped_steps: 0,
        }
    }

    pub fn with_loss_scale(mut self, scale: f64) -> Self {
        self.loss_scale = Some(scale);
        self
    }

    pub fn with_skipped_steps(mut self, skipped: usize) -> Self {
        self.skipped_steps = skipped;
        self
    }
}

/// Log one aggregated window of training.
///
/// Automatically emits warnings for:
/// - High gradient norm (> 10.0): potential instability
/// - Loss scale collapsed below 1: persistent overflow
/// - Divergence (NaN/infinite loss)
pub fn log_training_step(step: usize, metrics: &TrainingMetrics) {
    let span = span!(Level::INFO, "training_step", step = step);
    let _enter = span.enter();

    if !metrics.loss.is_finite() {
        error!(
            loss = metrics.loss,
            step = step,
            "Training diverged! NaN or infinite loss detected"
        );
        return;
    }

    info!(
        loss = metrics.loss,
        perplexity = metrics.perplexity,
        lr = metrics.learning_rate,
        grad_norm = metrics.grad_norm,
        tokens_per_sec = metrics.tokens_per_sec,
        loss_scale = metrics.loss_scale,
        skipped_steps = metrics.skipped_steps,
        "Training step completed"
    );

    if metrics.grad_norm > GRAD_NORM_WARN {
        warn!(
            grad_norm = metrics.grad_norm,
            step = step,
            threshold = GRAD_NORM_WARN,
            "High gradient norm detected - potential instability. Consider: \
             (1) reducing learning rate, (2) enabling gradient clipping"
        );
    }

    if let Some(scale) = metrics.loss_scale {
        if scale < LOSS_SCALE_WARN {
            warn!(
                loss_scale = scale,
                step = step,
                "Loss scale collapsed - gradients overflow on almost every step"
            );
        }
    }

    debug!(
        step = step,
        summary = format!("loss {:.4}, ppl {:.2}", metrics.loss, metrics.perplexity),
        "Training diagnostics"
    );
}

/// Log a step whose optimizer update was dropped for non-finite gradients.
pub fn log_skipped_step(step: usize, new_scale: f64) {
    warn!(
        step = step,
        loss_scale = new_scale,
        event = "step_skipped",
        "Non-finite gradients; optimizer update skipped and loss scale reduced"
    );
}

/// Log checkpoint save event.
pub fn log_checkpoint_save(step: usize, path: &str, loss: Option<f64>) {
    info!(
        step = step,
        path = path,
        loss = loss,
        event = "checkpoint_saved",
        "Checkpoint saved successfully"
    );
}

/// Log checkpoint restore event.
pub fn log_checkpoint_load(step: usize, path: &str, run_id: Option<&str>) {
    info!(
        step = step,
        path = path,
        run_id = run_id,
        event = "checkpoint_loaded",
        "Resuming from checkpoint"
    );
}

/// Log a collective backend falling back to a slower transport.
pub fn log_backend_fallback(wanted: &str, using: &str, reason: &str) {
    warn!(
        wanted = wanted,
        using = using,
        reason = reason,
        event = "backend_fallback",
        "Preferred collective backend unavailable, falling back"
    );
}
