pub mod adamw;
pub mod grad_scaler;
pub mod grads;
pub mod schedule;

pub use adamw::{AdamW, AdamWConfig};
pub use grad_scaler::{GradScaler, GradScalerConfig, GradScalerState};
pub use grads::{Gradients, CLIP_EPS};
pub use schedule::{LinearWarmupDecay, ScheduleState};
