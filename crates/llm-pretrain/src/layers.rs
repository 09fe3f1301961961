//! Trainable layers: Linear and RMSNorm with a compute-dtype cast.
//!
//! Parameters live in f32 inside the `VarMap`; each forward casts the weight
//! to the layer's compute dtype so gradients flow back to the f32 master copy.

use candle_core::{DType, Result, Tensor};
#[cfg(test)]
use candle_core::Device;
use candle_nn::VarBuilder;

/// Bias-free linear projection.
pub struct LinearTrain {
    weight: Tensor, // [out_features, in_features]
    compute_dtype: DType,
    pub in_features: usize,
    pub out_features: usize,
}

impl LinearTrain {
    pub fn new(in_f: usize, out_f: usize, compute_dtype: DType, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints(
            (out_f, in_f),
            "weight",
            candle_nn::Init::Randn {
                mean: 0.0,
                stdev: 0.02,
            },
        )?;
        Ok(Self {
            weight,
            compute_dtype,
            in_features: in_f,
            out_features: out_f,
        })
    }

    /// x: [.., in_features] in the compute dtype.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let w = self.weight.to_dtype(self.compute_dtype)?.t()?;
        let x_dims = x.dims().to_vec();
        if x_dims.len() == 3 {
            let (b, m, k) = (x_dims[0], x_dims[1], x_dims[2]);
            x.reshape((b * m, k))?.matmul(&w)?.reshape((b, m, ()))
        } else {
            x.matmul(&w)
        }
    }

    pub fn weight(&self) -> &Tensor {
        &self.weight
    }
}

/// RMSNorm (differentiable). Statistics are taken in f32 and the result is
/// cast back to the input dtype.
pub struct RMSNormTrain {
    weight: Tensor, // [dim]
    eps: f64,
    pub dim: usize,
}

impl RMSNormTrain {
    pub fn new(dim: usize, eps: f64, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints(dim, "weight", candle_nn::Init::Const(1.0))?;
        Ok(Self { weight, eps, dim })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let dtype = x.dtype();
        let x = x.to_dtype(DType::F32)?;
        let last_dim = x.dims().len() - 1;
        let variance = x.sqr()?.mean_keepdim(last_dim)?;
        let denominator = (variance + self.eps)?.sqrt()?;
        x.broadcast_div(&denominator)?
            .broadcast_mul(&self.weight)?
            .to_dtype(dtype)
    }

    pub fn weight(&self) -> &Tensor {
        &self.weight
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::VarMap;

    #[test]
    fn test_linear_forward_shape() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let layer = LinearTrain::new(32, 48, DType::F32, vb.pp("test"))?;

        let x = Tensor::randn(0.0f32, 1.0, (2, 5, 32), &device)?;
        let y = layer.forward(&x)?;
        assert_eq!(y.dims(), &[2, 5, 48]);
        Ok(())
    }

    #[test]
    fn test_linear_gradient_reaches_f32_weight() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let layer = LinearTrain::new(16, 8, DType::F32, vb.pp("test"))?;

        let x = Tensor::randn(0.0f32, 1.0, (1, 3, 16), &device)?;
        let loss = layer.forward(&x)?.sum_all()?;
        let grads = loss.backward()?;

        let grad = grads.get(layer.weight()).expect("weight should have gradient");
        assert_eq!(grad.dtype(), DType::F32);
        let gn = grad.sqr()?.sum_all()?.sqrt()?.to_scalar::<f32>()?;
        assert!(gn > 0.0);
        Ok(())
    }

    #[test]
    fn test_rmsnorm_output_normalized() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let norm = RMSNormTrain::new(64, 1e-6, vb.pp("test"))?;

        let x = Tensor::randn(0.0f32, 1.0, (2, 4, 64), &device)?;
        let y = norm.forward(&x)?;

        let rms = y.sqr()?.mean_keepdim(2)?.sqrt()?;
        for v in rms.flatten_all()?.to_vec1::<f32>()? {
            assert!((v - 1.0).abs() < 0.1, "RMS should be ~1.0, got {}", v);
        }
        Ok(())
    }
}
