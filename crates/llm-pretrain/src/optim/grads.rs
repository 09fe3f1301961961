//! Dense gradient buffers aligned with a [`ParamSet`].

use candle_core::{backprop::GradStore, DType, Result, Tensor};

use crate::state::ParamSet;

/// Added to the norm before dividing, as in the usual clip-by-global-norm.
pub const CLIP_EPS: f64 = 1e-6;

/// One gradient tensor per parameter, in `ParamSet` order.
///
/// Parameters that received no gradient in the backward pass get a zero
/// tensor so that every process flattens gradients into the same layout.
pub struct Gradients {
    tensors: Vec<Tensor>,
}

impl Gradients {
    pub fn from_grad_store(grads: &GradStore, params: &ParamSet) -> Result<Self> {
        let tensors = params
            .vars()
            .iter()
            .map(|var| match grads.get(var.as_tensor()) {
                Some(g) => g.to_dtype(DType::F32),
                None => Tensor::zeros_like(var.as_tensor()),
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { tensors })
    }

    pub fn from_tensors(tensors: Vec<Tensor>) -> Self {
        Self { tensors }
    }

    pub fn tensors(&self) -> &[Tensor] {
        &self.tensors
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Sum of squares over every element of every gradient.
    pub fn sq_norm(&self) -> Result<f64> {
        let mut total = 0.0f64;
        for g in &self.tensors {
            total += g.sqr()?.sum_all()?.to_scalar::<f32>()? as f64;
        }
        Ok(total)
    }

    /// Global L2 norm, treating all gradients as one flattened vector.
    pub fn global_norm(&self) -> Result<f64> {
        Ok(self.sq_norm()?.sqrt())
    }

    /// NaN and inf both poison the squared norm.
    pub fn all_finite(&self) -> Result<bool> {
        Ok(self.sq_norm()?.is_finite())
    }

    pub fn scale(&mut self, factor: f64) -> Result<()> {
        for g in self.tensors.iter_mut() {
            *g = (&*g * factor)?;
        }
        Ok(())
    }

    /// Rescale so the global norm is at most `max_norm`, given the current
    /// `norm`. Returns whether the threshold bound.
    pub fn clip_to_max_norm(&mut self, max_norm: f64, norm: f64) -> Result<bool> {
        let coef = max_norm / (norm + CLIP_EPS);
        if coef < 1.0 {
            self.scale(coef)?;
            return Ok(true);
        }
        Ok(false)
    }

    pub fn numel(&self) -> usize {
        self.tensors.iter().map(|t| t.elem_count()).sum()
    }

    /// Concatenate every gradient into one host buffer.
    pub fn flatten_to_vec(&self) -> Result<Vec<f32>> {
        let mut flat = Vec::with_capacity(self.numel());
        for g in &self.tensors {
            flat.extend(g.flatten_all()?.to_vec1::<f32>()?);
        }
        Ok(flat)
    }

    /// Inverse of [`flatten_to_vec`](Self::flatten_to_vec).
    pub fn assign_from_flat(&mut self, flat: &[f32]) -> Result<()> {
        if flat.len() != self.numel() {
            return Err(candle_core::Error::Msg(format!(
                "flat gradient length {} does not match {} gradient elements",
                flat.len(),
                self.numel()
            )));
        }
        let mut offset = 0;
        for g in self.tensors.iter_mut() {
            let n = g.elem_count();
            let shape = g.shape().clone();
            *g = Tensor::from_slice(&flat[offset..offset + n], shape, g.device())?;
            offset += n;
        }
        Ok(())
    }
}
