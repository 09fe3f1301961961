//! Explicit training state threaded through step executor, run loop and
//! checkpoint manager.

use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{VarBuilder, VarMap};

use crate::config::{Precision, TrainConfig};
use crate::distributed::ProcessGroup;
use crate::error::{TrainError, TrainResult};
use crate::model::{CausalLm, ModelBuilder};
use crate::optim::{AdamW, GradScaler, LinearWarmupDecay};

/// Trainable parameters in a stable (name-sorted) order.
///
/// Every process and every rebuild of the same model yields the same order,
/// so flattened gradients and optimizer moments line up across ranks and
/// across checkpoint restores.
#[derive(Clone)]
pub struct ParamSet {
    names: Vec<String>,
    vars: Vec<Var>,
}

impl ParamSet {
    pub fn from_varmap(varmap: &VarMap) -> TrainResult<Self> {
        let data = varmap
            .data()
            .lock()
            .map_err(|_| TrainError::Candle("VarMap lock poisoned".to_string()))?;
        let mut entries: Vec<(String, Var)> =
            data.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        let (names, vars) = entries.into_iter().unzip();
        Ok(Self { names, vars })
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn vars(&self) -> &[Var] {
        &self.vars
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Var)> {
        self.names.iter().zip(self.vars.iter())
    }

    pub fn numel(&self) -> usize {
        self.vars.iter().map(|v| v.elem_count()).sum()
    }

    /// Overwrite every parameter with rank 0's values.
    pub fn broadcast_from_root(&self, group: &dyn ProcessGroup) -> TrainResult<()> {
        if group.world_size() == 1 {
            return Ok(());
        }
        let mut flat = Vec::with_capacity(self.numel());
        for var in &self.vars {
            flat.extend(
                var.as_tensor()
                    .to_dtype(DType::F32)?
                    .flatten_all()?
                    .to_vec1::<f32>()?,
            );
        }
        group.broadcast(&mut flat)?;

        let mut offset = 0;
        for var in &self.vars {
            let n = var.elem_count();
            let t = Tensor::from_slice(&flat[offset..offset + n], var.shape(), var.device())?
                .to_dtype(var.dtype())?;
            var.set(&t)?;
            offset += n;
        }
        Ok(())
    }
}

/// Everything a resumed run needs to continue exactly where it stopped.
pub struct TrainingState {
    /// Completed optimizer-schedule steps (skipped updates included).
    pub step: usize,
    pub varmap: VarMap,
    pub params: ParamSet,
    pub model: Box<dyn CausalLm>,
    pub optimizer: AdamW,
    pub schedule: LinearWarmupDecay,
    pub base_lr: f64,
    pub scaler: Option<GradScaler>,
    pub precision: Precision,
    pub device: Device,
    /// Metrics stream identity; assigned by the coordinator's sink.
    pub run_id: Option<String>,
}

impl TrainingState {
    /// Fresh state at step 0 with a newly initialized model.
    pub fn new(config: &TrainConfig, builder: &dyn ModelBuilder, device: &Device) -> TrainResult<Self> {
        let precision = config.precision_policy();
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let model = builder.build(vb, precision.compute_dtype())?;
        let params = ParamSet::from_varmap(&varmap)?;
        if params.is_empty() {
            return Err(TrainError::Config("model registered no parameters".to_string()));
        }

        let schedule = LinearWarmupDecay::new(config.warmup_steps, config.total_steps)?;
        let base_lr = config.learning_rate;
        let optimizer = AdamW::new(params.clone(), schedule.lr_at(base_lr, 0), config.adamw_config())?;
        let scaler = precision
            .is_mixed()
            .then(|| GradScaler::new(config.scaler));

        Ok(Self {
            step: 0,
            varmap,
            params,
            model,
            optimizer,
            schedule,
            base_lr,
            scaler,
            precision,
            device: device.clone(),
            run_id: None,
        })
    }

    /// Learning rate the next optimizer update will use.
    pub fn lr(&self) -> f64 {
        self.optimizer.lr()
    }

    /// Advance the step counter and re-derive the LR from the schedule.
    pub fn advance_schedule(&mut self) {
        self.step += 1;
        self.optimizer
            .set_lr(self.schedule.lr_at(self.base_lr, self.step));
    }

    pub fn is_finished(&self) -> bool {
        self.step >= self.schedule.total_steps()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::LocalGroup;
    use crate::model::TinyLlamaBuilder;

    fn config() -> TrainConfig {
        let mut cfg = TrainConfig::tiny_cpu();
        cfg.warmup_steps = 4;
        cfg.total_steps = 20;
        cfg
    }

    #[test]
    fn test_param_set_sorted_and_stable() -> candle_core::Result<()> {
        let cfg = config();
        let builder = TinyLlamaBuilder::new(cfg.model.clone());
        let a = TrainingState::new(&cfg, &builder, &Device::Cpu).unwrap();
        let b = TrainingState::new(&cfg, &builder, &Device::Cpu).unwrap();

        let names = a.params.names().to_vec();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
        assert_eq!(names, b.params.names());
        for ((_, va), (_, vb)) in a.params.iter().zip(b.params.iter()) {
            assert_eq!(va.dims(), vb.dims());
        }
        assert!(a.params.numel() > 0);
        Ok(())
    }

    #[test]
    fn test_lr_follows_schedule() {
        let cfg = config();
        let builder = TinyLlamaBuilder::new(cfg.model.clone());
        let mut state = TrainingState::new(&cfg, &builder, &Device::Cpu).unwrap();
        assert_eq!(state.lr(), 0.0);
        for _ in 0..2 {
            state.advance_schedule();
        }
        assert!((state.lr() - cfg.learning_rate * 0.5).abs() < 1e-12);
        while !state.is_finished() {
            state.advance_schedule();
        }
        assert_eq!(state.step, 20);
        assert_eq!(state.lr(), 0.0);
    }

    #[test]
    fn test_scaler_only_under_mixed_precision() {
        let mut cfg = config();
        let builder = TinyLlamaBuilder::new(cfg.model.clone());
        assert!(TrainingState::new(&cfg, &builder, &Device::Cpu)
            .unwrap()
            .scaler
            .is_none());
        cfg.mixed_precision = true;
        let state = TrainingState::new(&cfg, &builder, &Device::Cpu).unwrap();
        assert!(state.scaler.is_some());
        assert!(state.precision.is_mixed());
    }

    #[test]
    fn test_broadcast_is_noop_for_single_process() -> candle_core::Result<()> {
        let cfg = config();
        let builder = TinyLlamaBuilder::new(cfg.model.clone());
        let state = TrainingState::new(&cfg, &builder, &Device::Cpu).unwrap();
        let before = state.params.vars()[0].as_tensor().flatten_all()?.to_vec1::<f32>()?;
        state.params.broadcast_from_root(&LocalGroup::new()).unwrap();
        let after = state.params.vars()[0].as_tensor().flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(before, after);
        Ok(())
    }
}
