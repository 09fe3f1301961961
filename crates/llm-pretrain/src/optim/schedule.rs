//! Linear warmup + linear decay learning rate schedule.

use serde::{Deserialize, Serialize};

use crate::error::{config_error, TrainResult};

/// Step -> learning-rate multiplier curve.
///
/// - Warmup phase: linear ramp from 0 toward 1 over `warmup_steps`
/// - Decay phase: linear decay from 1 at `warmup_steps` to 0 at `total_steps`
///
/// The curve is a pure function of `(warmup_steps, total_steps)`; resuming a
/// run only needs those two numbers and the step counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinearWarmupDecay {
    warmup_steps: usize,
    total_steps: usize,
}

impl LinearWarmupDecay {
    /// `total_steps` must be strictly greater than `warmup_steps`.
    pub fn new(warmup_steps: usize, total_steps: usize) -> TrainResult<Self> {
        if total_steps <= warmup_steps {
            return Err(config_error(format!(
                "total_steps ({}) must be > warmup_steps ({})",
                total_steps, warmup_steps
            )));
        }
        Ok(Self {
            warmup_steps,
            total_steps,
        })
    }

    pub fn warmup_steps(&self) -> usize {
        self.warmup_steps
    }

    pub fn total_steps(&self) -> usize {
        self.total_steps
    }

    pub fn multiplier(&self, step: usize) -> f64 {
        if step < self.warmup_steps {
            return step as f64 / self.warmup_steps as f64;
        }
        let decay_steps = (self.total_steps - self.warmup_steps) as f64;
        let progress = (step - self.warmup_steps) as f64 / decay_steps;
        (1.0 - progress).max(0.0)
    }

    /// Realized learning rate at `step`.
    pub fn lr_at(&self, base_lr: f64, step: usize) -> f64 {
        base_lr * self.multiplier(step)
    }

    /// Snapshot persisted next to the optimizer state.
    pub fn state(&self, base_lr: f64, step: usize) -> ScheduleState {
        ScheduleState {
            warmup_steps: self.warmup_steps,
            total_steps: self.total_steps,
            base_lr,
            last_step: step,
            last_lr: self.lr_at(base_lr, step),
        }
    }
}

/// Persisted scheduler artifact (`scheduler.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleState {
    pub warmup_steps: usize,
    pub total_steps: usize,
    pub base_lr: f64,
    pub last_step: usize,
    pub last_lr: f64,
}

impl ScheduleState {
    /// Rebuild the curve; fails on a corrupt snapshot with `total <= warmup`.
    pub fn schedule(&self) -> TrainResult<LinearWarmupDecay> {
        LinearWarmupDecay::new(self.warmup_steps, self.total_steps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-12
    }

    #[test]
    fn test_rejects_total_not_after_warmup() {
        assert!(LinearWarmupDecay::new(10, 10).is_err());
        assert!(LinearWarmupDecay::new(10, 5).is_err());
        assert!(LinearWarmupDecay::new(0, 1).is_ok());
    }

    #[test]
    fn test_scenario_points() {
        let s = LinearWarmupDecay::new(10, 100).unwrap();
        assert!(close(s.multiplier(0), 0.0));
        assert!(close(s.multiplier(5), 0.5));
        assert!(close(s.multiplier(10), 1.0));
        assert!(close(s.multiplier(55), 0.5));
        assert!(close(s.multiplier(100), 0.0));
    }

    #[test]
    fn test_endpoints_and_continuity_for_many_pairs() {
        for (w, t) in [(1, 2), (3, 17), (100, 1000), (999, 1000), (0, 50)] {
            let s = LinearWarmupDecay::new(w, t).unwrap();
            assert!(close(s.multiplier(0), if w == 0 { 1.0 } else { 0.0 }));
            assert!(close(s.multiplier(w), 1.0), "w={} t={}", w, t);
            assert!(close(s.multiplier(t), 0.0), "w={} t={}", w, t);

            // Left limit at W approaches 1 at the warmup slope.
            if w > 0 {
                let left = s.multiplier(w - 1);
                assert!(close(1.0 - left, 1.0 / w as f64));
            }
            // Piecewise linear: constant second difference inside each phase.
            for step in 1..t.saturating_sub(1) {
                if step == w || step + 1 == w || step == w + 1 {
                    continue;
                }
                let d1 = s.multiplier(step) - s.multiplier(step - 1);
                let d2 = s.multiplier(step + 1) - s.multiplier(step);
                assert!((d1 - d2).abs() < 1e-9, "not linear at step {}", step);
            }
        }
    }

    #[test]
    fn test_never_negative_past_total() {
        let s = LinearWarmupDecay::new(10, 100).unwrap();
        assert_eq!(s.multiplier(150), 0.0);
    }

    #[test]
    fn test_state_rebuilds_identical_curve() {
        let s = LinearWarmupDecay::new(7, 70).unwrap();
        let state = s.state(3e-4, 33);
        assert!(close(state.last_lr, 3e-4 * s.multiplier(33)));
        let rebuilt = state.schedule().unwrap();
        for step in 0..=70 {
            assert_eq!(rebuilt.multiplier(step), s.multiplier(step));
        }
    }

    #[test]
    fn test_snapshot_survives_json_exactly() {
        let s = LinearWarmupDecay::new(3, 12).unwrap();
        for base_lr in [3e-4, 6e-4, 1e-3, 2.5e-5] {
            for step in 0..=12 {
                let state = s.state(base_lr, step);
                let json = serde_json::to_string(&state).unwrap();
                let back: ScheduleState = serde_json::from_str(&json).unwrap();
                assert_eq!(back, state, "lr={} step={}", base_lr, step);
            }
        }
    }
}
