//! SwiGLU Feed-Forward Network for training.

use candle_core::{DType, Result, Tensor};
use candle_nn::VarBuilder;

use crate::layers::LinearTrain;

/// SwiGLU FFN: silu(w_gate(x)) * w_up(x), then w_down.
pub struct FeedForwardTrain {
    pub w_gate: LinearTrain,
    pub w_up: LinearTrain,
    pub w_down: LinearTrain,
}

impl FeedForwardTrain {
    pub fn new(dim: usize, ffn_dim: usize, compute_dtype: DType, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            w_gate: LinearTrain::new(dim, ffn_dim, compute_dtype, vb.pp("w_gate"))?,
            w_up: LinearTrain::new(dim, ffn_dim, compute_dtype, vb.pp("w_up"))?,
            w_down: LinearTrain::new(ffn_dim, dim, compute_dtype, vb.pp("w_down"))?,
        })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let gate = candle_nn::ops::silu(&self.w_gate.forward(x)?)?;
        let up = self.w_up.forward(x)?;
        self.w_down.forward(&(gate * up)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use candle_nn::VarMap;

    #[test]
    fn test_ffn_gradient_flows() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let ffn = FeedForwardTrain::new(32, 64, DType::F32, vb.pp("test"))?;

        let x = Tensor::randn(0.0f32, 1.0, (1, 2, 32), &device)?;
        let y = ffn.forward(&x)?;
        assert_eq!(y.dims(), &[1, 2, 32]);
        let grads = y.sum_all()?.backward()?;

        for (name, w) in [
            ("gate", ffn.w_gate.weight()),
            ("up", ffn.w_up.weight()),
            ("down", ffn.w_down.weight()),
        ] {
            let grad = grads
                .get(w)
                .unwrap_or_else(|| panic!("{} should have gradient", name));
            let gn = grad.sqr()?.sum_all()?.sqrt()?.to_scalar::<f32>()?;
            assert!(gn > 0.0, "{} gradient should be non-zero", name);
        }
        Ok(())
    }
}
