//! AdamW with bias-corrected moments and decoupled weight decay.

use std::collections::HashMap;

use candle_core::{DType, Device, Result, Tensor};
use serde::{Deserialize, Serialize};

use super::grads::Gradients;
use crate::state::ParamSet;

const STEP_KEY: &str = "adamw.step";

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AdamWConfig {
    #[serde(default = "default_beta1")]
    pub beta1: f64,
    #[serde(default = "default_beta2")]
    pub beta2: f64,
    #[serde(default = "default_eps")]
    pub eps: f64,
    #[serde(default)]
    pub weight_decay: f64,
}

fn default_beta1() -> f64 {
    0.9
}
fn default_beta2() -> f64 {
    0.999
}
fn default_eps() -> f64 {
    1e-7
}

impl Default for AdamWConfig {
    fn default() -> Self {
        Self {
            beta1: default_beta1(),
            beta2: default_beta2(),
            eps: default_eps(),
            weight_decay: 0.0,
        }
    }
}

/// AdamW.
///
/// Update rule, with `t` the 1-based update count:
///   1. Weight decay: p *= (1 - lr * wd)
///   2. m = beta1*m + (1-beta1)*g
///   3. v = beta2*v + (1-beta2)*g^2
///   4. p -= lr / (1 - beta1^t) * m / (sqrt(v) / sqrt(1 - beta2^t) + eps)
pub struct AdamW {
    params: ParamSet,
    exp_avg: Vec<Tensor>,
    exp_avg_sq: Vec<Tensor>,
    step_count: usize,
    lr: f64,
    config: AdamWConfig,
}

impl AdamW {
    pub fn new(params: ParamSet, lr: f64, config: AdamWConfig) -> Result<Self> {
        let exp_avg = zeros_like_params(&params)?;
        let exp_avg_sq = zeros_like_params(&params)?;
        Ok(Self {
            params,
            exp_avg,
            exp_avg_sq,
            step_count: 0,
            lr,
            config,
        })
    }

    pub fn lr(&self) -> f64 {
        self.lr
    }

    pub fn set_lr(&mut self, lr: f64) {
        self.lr = lr;
    }

    /// Number of applied (non-skipped) updates; drives bias correction.
    pub fn step_count(&self) -> usize {
        self.step_count
    }

    pub fn config(&self) -> &AdamWConfig {
        &self.config
    }

    pub fn params(&self) -> &ParamSet {
        &self.params
    }

    pub fn step(&mut self, grads: &Gradients) -> Result<()> {
        if grads.len() != self.params.len() {
            return Err(candle_core::Error::Msg(format!(
                "AdamW got {} gradients for {} parameters",
                grads.len(),
                self.params.len()
            )));
        }

        self.step_count += 1;
        let t = self.step_count as i32;
        let AdamWConfig {
            beta1,
            beta2,
            eps,
            weight_decay,
        } = self.config;
        let bias_correction1 = 1.0 - beta1.powi(t);
        let bias_correction2_sqrt = (1.0 - beta2.powi(t)).sqrt();
        let step_size = self.lr / bias_correction1;

        for (i, (var, grad)) in self.params.vars().iter().zip(grads.tensors()).enumerate() {
            let dtype = var.dtype();
            let grad = grad.to_dtype(DType::F32)?;
            let mut p = var.as_tensor().to_dtype(DType::F32)?;

            if weight_decay > 0.0 {
                p = (p * (1.0 - self.lr * weight_decay))?;
            }

            let m = ((&self.exp_avg[i] * beta1)? + (&grad * (1.0 - beta1))?)?;
            let v = ((&self.exp_avg_sq[i] * beta2)? + (grad.sqr()? * (1.0 - beta2))?)?;

            let denom = ((v.sqrt()? / bias_correction2_sqrt)? + eps)?;
            let update = ((&m / &denom)? * step_size)?;
            let new_p = (p - update)?;
            var.set(&new_p.to_dtype(dtype)?)?;

            self.exp_avg[i] = m;
            self.exp_avg_sq[i] = v;
        }
        Ok(())
    }

    /// Moments and step counter keyed for a safetensors file.
    pub fn state_tensors(&self) -> Result<HashMap<String, Tensor>> {
        let mut out = HashMap::with_capacity(self.params.len() * 2 + 1);
        for (i, name) in self.params.names().iter().enumerate() {
            out.insert(
                format!("exp_avg.{name}"),
                self.exp_avg[i].to_device(&Device::Cpu)?,
            );
            out.insert(
                format!("exp_avg_sq.{name}"),
                self.exp_avg_sq[i].to_device(&Device::Cpu)?,
            );
        }
        out.insert(
            STEP_KEY.to_string(),
            Tensor::new(&[self.step_count as i64], &Device::Cpu)?,
        );
        Ok(out)
    }

    /// Strict restore: every moment must be present with the parameter's
    /// shape, and no foreign tensor may appear.
    pub fn import_state(&mut self, tensors: &HashMap<String, Tensor>) -> Result<()> {
        let expected = self.params.len() * 2 + 1;
        if tensors.len() != expected {
            let unexpected: Vec<&String> = tensors
                .keys()
                .filter(|k| !self.is_known_key(k))
                .collect();
            return Err(candle_core::Error::Msg(format!(
                "AdamW state mismatch: expected {} tensors, got {} (unexpected: {:?})",
                expected,
                tensors.len(),
                unexpected
            )));
        }

        let mut exp_avg = Vec::with_capacity(self.params.len());
        let mut exp_avg_sq = Vec::with_capacity(self.params.len());
        for (name, var) in self.params.iter() {
            let device = var.device();
            let shape = var.as_tensor().dims().to_vec();
            for (prefix, slot) in [("exp_avg", &mut exp_avg), ("exp_avg_sq", &mut exp_avg_sq)] {
                let key = format!("{prefix}.{name}");
                let t = tensors.get(&key).ok_or_else(|| {
                    candle_core::Error::Msg(format!("AdamW state missing '{key}'"))
                })?;
                if t.dims() != shape.as_slice() {
                    return Err(candle_core::Error::Msg(format!(
                        "AdamW state shape mismatch for '{}': expected {:?}, got {:?}",
                        key,
                        shape,
                        t.dims()
                    )));
                }
                slot.push(t.to_dtype(DType::F32)?.to_device(device)?);
            }
        }

        let step = tensors
            .get(STEP_KEY)
            .ok_or_else(|| candle_core::Error::Msg(format!("AdamW state missing '{STEP_KEY}'")))?
            .flatten_all()?
            .to_vec1::<i64>()?;
        let step_count = match step.as_slice() {
            [s] if *s >= 0 => *s as usize,
            other => {
                return Err(candle_core::Error::Msg(format!(
                    "AdamW step counter malformed: {:?}",
                    other
                )))
            }
        };

        self.exp_avg = exp_avg;
        self.exp_avg_sq = exp_avg_sq;
        self.step_count = step_count;
        Ok(())
    }

    fn is_known_key(&self, key: &str) -> bool {
        key == STEP_KEY
            || self.params.names().iter().any(|n| {
                key.strip_prefix("exp_avg.") == Some(n.as_str())
                    || key.strip_prefix("exp_avg_sq.") == Some(n.as_str())
            })
    }
}

fn zeros_like_params(params: &ParamSet) -> Result<Vec<Tensor>> {
    params
        .vars()
        .iter()
        .map(|v| Tensor::zeros(v.as_tensor().dims(), DType::F32, v.device()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::{Init, VarBuilder, VarMap};

    fn single_param(init: f64, len: usize) -> Result<(VarMap, ParamSet)> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        vb.get_with_hints(len, "w", Init::Const(init))?;
        let params = ParamSet::from_varmap(&varmap)
            .map_err(|e| candle_core::Error::Msg(e.to_string()))?;
        Ok((varmap, params))
    }

    #[test]
    fn test_first_step_moves_by_lr() -> Result<()> {
        // With bias correction the first update has magnitude ~lr regardless of |g|.
        let (_varmap, params) = single_param(1.0, 4)?;
        let mut opt = AdamW::new(params.clone(), 0.1, AdamWConfig::default())?;
        let g = Tensor::new(&[0.5f32, -2.0, 10.0, -0.01], &Device::Cpu)?;
        opt.step(&Gradients::from_tensors(vec![g]))?;

        let w = params.vars()[0].as_tensor().to_vec1::<f32>()?;
        let expected = [0.9f32, 1.1, 0.9, 1.1];
        for (a, b) in w.iter().zip(expected.iter()) {
            assert!((a - b).abs() < 1e-4, "{} vs {}", a, b);
        }
        assert_eq!(opt.step_count(), 1);
        Ok(())
    }

    #[test]
    fn test_decoupled_weight_decay_with_zero_grad() -> Result<()> {
        let (_varmap, params) = single_param(2.0, 3)?;
        let config = AdamWConfig {
            weight_decay: 0.5,
            ..AdamWConfig::default()
        };
        let mut opt = AdamW::new(params.clone(), 0.1, config)?;
        let g = Tensor::zeros(3, DType::F32, &Device::Cpu)?;
        opt.step(&Gradients::from_tensors(vec![g]))?;

        // p * (1 - 0.1 * 0.5) and no moment contribution.
        for v in params.vars()[0].as_tensor().to_vec1::<f32>()? {
            assert!((v - 1.9).abs() < 1e-6);
        }
        Ok(())
    }

    #[test]
    fn test_state_roundtrip_reproduces_next_update() -> Result<()> {
        let (_va, params_a) = single_param(1.0, 4)?;
        let (_vb, params_b) = single_param(1.0, 4)?;
        let g1 = Tensor::new(&[0.3f32, -0.7, 1.1, 0.2], &Device::Cpu)?;
        let g2 = Tensor::new(&[-0.4f32, 0.9, 0.05, -1.3], &Device::Cpu)?;

        let mut a = AdamW::new(params_a.clone(), 0.01, AdamWConfig::default())?;
        a.step(&Gradients::from_tensors(vec![g1.clone()]))?;

        let mut b = AdamW::new(params_b.clone(), 0.01, AdamWConfig::default())?;
        b.step(&Gradients::from_tensors(vec![g1]))?;
        let state = b.state_tensors()?;
        let mut restored = AdamW::new(params_b.clone(), 0.01, AdamWConfig::default())?;
        restored.import_state(&state)?;
        assert_eq!(restored.step_count(), 1);

        a.step(&Gradients::from_tensors(vec![g2.clone()]))?;
        restored.step(&Gradients::from_tensors(vec![g2]))?;
        assert_eq!(
            params_a.vars()[0].as_tensor().to_vec1::<f32>()?,
            params_b.vars()[0].as_tensor().to_vec1::<f32>()?
        );
        Ok(())
    }

    #[test]
    fn test_import_rejects_missing_and_misshaped() -> Result<()> {
        let (_v, params) = single_param(1.0, 4)?;
        let mut opt = AdamW::new(params, 0.01, AdamWConfig::default())?;
        let mut state = opt.state_tensors()?;

        let mut missing = state.clone();
        missing.remove("exp_avg_sq.w");
        assert!(opt.import_state(&missing).is_err());

        state.insert("exp_avg.w".into(), Tensor::zeros(5, DType::F32, &Device::Cpu)?);
        assert!(opt.import_state(&state).is_err());
        Ok(())
    }
}
