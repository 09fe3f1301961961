//! One forward / backward / optimize cycle.
//!
//! Order per step:
//! forward -> loss -> (scaled) backward -> gradient all-reduce ->
//! unscale + finite check -> clip -> AdamW -> schedule -> scaler update.
//! The gradient store is dropped at the end of every step.

use candle_core::{Result, Tensor, D};

use crate::data::PreparedBatch;
use crate::distributed::ProcessGroup;
use crate::error::{TrainError, TrainResult};
use crate::logging::log_skipped_step;
use crate::optim::Gradients;
use crate::state::TrainingState;

/// Mean cross-entropy over positions with non-zero weight.
///
/// logits: [B, T, V] f32, label_ids: [B, T] u32, label_weights: [B, T] f32
/// (1 for counted positions, 0 for ignored ones).
pub fn masked_cross_entropy(logits: &Tensor, label_ids: &Tensor, label_weights: &Tensor) -> Result<Tensor> {
    let (b, t, v) = logits.dims3()?;
    let n = b * t;
    let log_probs = candle_nn::ops::log_softmax(&logits.reshape((n, v))?, D::Minus1)?;
    let picked = log_probs
        .gather(&label_ids.reshape((n, 1))?.contiguous()?, 1)?
        .reshape(n)?;
    let weights = label_weights.reshape(n)?;

    let count = weights.sum_all()?.to_scalar::<f32>()?;
    if count <= 0.0 {
        return Err(candle_core::Error::Msg(
            "batch has no label positions to score".to_string(),
        ));
    }
    (picked * weights)?.sum_all()?.neg()? / count as f64
}

/// What one step did, for logging.
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutcome {
    /// Completed step count after this step.
    pub step: usize,
    /// Unscaled loss, averaged across ranks.
    pub loss: f64,
    /// Global gradient L2 norm before clipping (non-finite when skipped).
    pub grad_norm: f64,
    /// LR the optimizer used for this step's update.
    pub lr: f64,
    /// The update was dropped for non-finite gradients.
    pub skipped: bool,
    /// Loss scale after the scaler update.
    pub loss_scale: Option<f64>,
    /// Tokens that contributed to the loss on this rank.
    pub tokens: usize,
}

/// Runs training steps against an explicit [`TrainingState`].
#[derive(Debug, Clone, Copy, Default)]
pub struct StepExecutor {
    grad_clip: Option<f64>,
}

impl StepExecutor {
    pub fn new(grad_clip: Option<f64>) -> Self {
        Self { grad_clip }
    }

    pub fn grad_clip(&self) -> Option<f64> {
        self.grad_clip
    }

    pub fn execute(
        &self,
        state: &mut TrainingState,
        batch: &PreparedBatch,
        group: &dyn ProcessGroup,
    ) -> TrainResult<StepOutcome> {
        let (input_ids, attention_mask, label_ids, label_weights) = batch.to_tensors(&state.device)?;

        let logits = state.model.forward(&input_ids, &attention_mask)?;
        let loss = masked_cross_entropy(&logits, &label_ids, &label_weights)?;
        let local_loss = loss.to_scalar::<f32>()?;

        let grad_store = match &state.scaler {
            Some(scaler) => scaler.scale_loss(&loss)?.backward()?,
            None => loss.backward()?,
        };
        let mut grads = Gradients::from_grad_store(&grad_store, &state.params)?;
        drop(grad_store);

        // Gradients and the loss travel in one buffer; every rank blocks here.
        let mut loss_value = local_loss as f64;
        if group.world_size() > 1 {
            let mut flat = grads.flatten_to_vec()?;
            flat.push(local_loss);
            group.all_reduce_mean(&mut flat)?;
            loss_value = flat.pop().unwrap_or(local_loss) as f64;
            grads.assign_from_flat(&flat)?;
        }

        if let Some(scaler) = &state.scaler {
            scaler.unscale(&mut grads)?;
        }
        let grad_norm = grads.global_norm()?;
        let finite = grad_norm.is_finite();
        // Checked on reduced values so every rank fails at the same step.
        if state.scaler.is_none() && !(finite && loss_value.is_finite()) {
            return Err(TrainError::Divergence {
                loss: loss_value,
                step: state.step,
            });
        }

        let lr = state.lr();
        if finite {
            if let Some(max_norm) = self.grad_clip {
                grads.clip_to_max_norm(max_norm, grad_norm)?;
            }
            state
                .optimizer
                .step(&grads)
                .map_err(|e| TrainError::Optimizer(e.to_string()))?;
        }
        drop(grads);

        state.advance_schedule();

        let loss_scale = match state.scaler.as_mut() {
            Some(scaler) => {
                scaler.update(!finite);
                if !finite {
                    log_skipped_step(state.step, scaler.scale());
                }
                Some(scaler.scale())
            }
            None => None,
        };

        Ok(StepOutcome {
            step: state.step,
            loss: loss_value,
            grad_norm,
            lr,
            skipped: !finite,
            loss_scale,
            tokens: batch.num_label_tokens(),
        })
    }
}
