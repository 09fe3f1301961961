//! Dynamic loss scaling for reduced-precision training.

use candle_core::{Result, Tensor};
use serde::{Deserialize, Serialize};

use super::grads::Gradients;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GradScalerConfig {
    #[serde(default = "default_init_scale")]
    pub init_scale: f64,
    #[serde(default = "default_growth_factor")]
    pub growth_factor: f64,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    /// Consecutive finite steps before the scale grows.
    #[serde(default = "default_growth_interval")]
    pub growth_interval: usize,
}

fn default_init_scale() -> f64 {
    65536.0
}
fn default_growth_factor() -> f64 {
    2.0
}
fn default_backoff_factor() -> f64 {
    0.5
}
fn default_growth_interval() -> usize {
    2000
}

impl Default for GradScalerConfig {
    fn default() -> Self {
        Self {
            init_scale: default_init_scale(),
            growth_factor: default_growth_factor(),
            backoff_factor: default_backoff_factor(),
            growth_interval: default_growth_interval(),
        }
    }
}

impl GradScalerConfig {
    pub fn validate(&self) -> std::result::Result<(), Vec<String>> {
        let mut errors = Vec::new();
        if !(self.init_scale.is_finite() && self.init_scale > 0.0) {
            errors.push(format!("scaler.init_scale must be > 0, got {}", self.init_scale));
        }
        if self.growth_factor < 1.0 {
            errors.push(format!(
                "scaler.growth_factor must be >= 1, got {}",
                self.growth_factor
            ));
        }
        if !(self.backoff_factor > 0.0 && self.backoff_factor < 1.0) {
            errors.push(format!(
                "scaler.backoff_factor must be in (0, 1), got {}",
                self.backoff_factor
            ));
        }
        if self.growth_interval == 0 {
            errors.push("scaler.growth_interval must be > 0".to_string());
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Multiplies the loss before backward so small reduced-precision gradients
/// stay representable, and adapts the factor to overflow.
#[derive(Debug, Clone)]
pub struct GradScaler {
    config: GradScalerConfig,
    scale: f64,
    growth_tracker: usize,
}

/// Persisted in checkpoint metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradScalerState {
    pub scale: f64,
    pub growth_tracker: usize,
    pub config: GradScalerConfig,
}

impl GradScaler {
    pub fn new(config: GradScalerConfig) -> Self {
        Self {
            scale: config.init_scale,
            growth_tracker: 0,
            config,
        }
    }

    pub fn from_state(state: &GradScalerState) -> Self {
        Self {
            config: state.config,
            scale: state.scale,
            growth_tracker: state.growth_tracker,
        }
    }

    pub fn state(&self) -> GradScalerState {
        GradScalerState {
            scale: self.scale,
            growth_tracker: self.growth_tracker,
            config: self.config,
        }
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }

    pub fn scale_loss(&self, loss: &Tensor) -> Result<Tensor> {
        loss * self.scale
    }

    pub fn unscale(&self, grads: &mut Gradients) -> Result<()> {
        grads.scale(1.0 / self.scale)
    }

    /// Advance the scale after a step; `found_non_finite` means the optimizer
    /// update was skipped.
    pub fn update(&mut self, found_non_finite: bool) {
        if found_non_finite {
            self.scale *= self.config.backoff_factor;
            self.growth_tracker = 0;
            return;
        }
        self.growth_tracker += 1;
        if self.growth_tracker >= self.config.growth_interval {
            self.scale *= self.config.growth_factor;
            self.growth_tracker = 0;
        }
    }
}
