//! Multi-head causal attention with RoPE and key padding mask.

use candle_core::{DType, Device, Result, Tensor, D};
use candle_nn::VarBuilder;

use crate::layers::LinearTrain;

/// Large negative used for masked keys; finite so `0 * mask` stays 0.
const MASKED_SCORE: f64 = -1e9;

/// Precompute RoPE cos/sin frequency tables.
pub fn precompute_rope_freqs(
    head_dim: usize,
    max_seq_len: usize,
    theta: f32,
    device: &Device,
) -> Result<(Tensor, Tensor)> {
    let half_dim = head_dim / 2;
    let freqs: Vec<f32> = (0..half_dim)
        .map(|i| 1.0 / theta.powf(2.0 * i as f32 / head_dim as f32))
        .collect();
    let freqs = Tensor::from_vec(freqs, (1, half_dim), device)?;
    let positions: Vec<f32> = (0..max_seq_len).map(|p| p as f32).collect();
    let positions = Tensor::from_vec(positions, (max_seq_len, 1), device)?;
    let angles = positions.matmul(&freqs)?; // [max_seq_len, half_dim]
    Ok((angles.cos()?, angles.sin()?))
}

/// q, k: [batch, n_heads, seq_len, head_dim]; cos, sin: [seq_len, half_dim]
fn apply_rotary_emb(q: &Tensor, k: &Tensor, cos: &Tensor, sin: &Tensor) -> Result<(Tensor, Tensor)> {
    let half = q.dim(D::Minus1)? / 2;
    let cos = cos.to_dtype(q.dtype())?.unsqueeze(0)?.unsqueeze(0)?;
    let sin = sin.to_dtype(q.dtype())?.unsqueeze(0)?.unsqueeze(0)?;

    let rotate = |x: &Tensor| -> Result<Tensor> {
        let x0 = x.narrow(D::Minus1, 0, half)?;
        let x1 = x.narrow(D::Minus1, half, half)?;
        let r0 = (x0.broadcast_mul(&cos)? - x1.broadcast_mul(&sin)?)?;
        let r1 = (x0.broadcast_mul(&sin)? + x1.broadcast_mul(&cos)?)?;
        Tensor::cat(&[&r0, &r1], D::Minus1)
    };
    Ok((rotate(q)?, rotate(k)?))
}

/// Training-mode multi-head attention (no KV cache).
pub struct AttentionTrain {
    pub wq: LinearTrain,
    pub wk: LinearTrain,
    pub wv: LinearTrain,
    pub wo: LinearTrain,
    pub n_heads: usize,
    pub n_kv_heads: usize,
    pub head_dim: usize,
}

impl AttentionTrain {
    pub fn new(
        dim: usize,
        n_heads: usize,
        n_kv_heads: usize,
        compute_dtype: DType,
        vb: VarBuilder,
    ) -> Result<Self> {
        let head_dim = dim / n_heads;
        let wq = LinearTrain::new(dim, n_heads * head_dim, compute_dtype, vb.pp("wq"))?;
        let wk = LinearTrain::new(dim, n_kv_heads * head_dim, compute_dtype, vb.pp("wk"))?;
        let wv = LinearTrain::new(dim, n_kv_heads * head_dim, compute_dtype, vb.pp("wv"))?;
        let wo = LinearTrain::new(n_heads * head_dim, dim, compute_dtype, vb.pp("wo"))?;
        Ok(Self {
            wq,
            wk,
            wv,
            wo,
            n_heads,
            n_kv_heads,
            head_dim,
        })
    }

    /// x: [batch, seq_len, dim]; `mask`: additive f32 [batch, 1, seq_len, seq_len].
    pub fn forward(&self, x: &Tensor, cos: &Tensor, sin: &Tensor, mask: &Tensor) -> Result<Tensor> {
        let (batch, seq_len, _dim) = x.dims3()?;
        let compute_dtype = x.dtype();

        let q = self.wq.forward(x)?;
        let k = self.wk.forward(x)?;
        let v = self.wv.forward(x)?;

        let q = q
            .reshape((batch, seq_len, self.n_heads, self.head_dim))?
            .transpose(1, 2)?;
        let k = k
            .reshape((batch, seq_len, self.n_kv_heads, self.head_dim))?
            .transpose(1, 2)?;
        let v = v
            .reshape((batch, seq_len, self.n_kv_heads, self.head_dim))?
            .transpose(1, 2)?;

        let (q, k) = apply_rotary_emb(&q, &k, cos, sin)?;

        // GQA: repeat K,V if needed
        let (k, v) = if self.n_kv_heads < self.n_heads {
            let n_rep = self.n_heads / self.n_kv_heads;
            (k.repeat(&[1, n_rep, 1, 1])?, v.repeat(&[1, n_rep, 1, 1])?)
        } else {
            (k, v)
        };

        // Scores and softmax in f32 regardless of compute dtype.
        let q = q.contiguous()?.to_dtype(DType::F32)?;
        let k = k.contiguous()?.to_dtype(DType::F32)?;
        let scale = (self.head_dim as f64).sqrt();
        let scores = (q.matmul(&k.transpose(2, 3)?)? / scale)?;
        let scores = scores.broadcast_add(mask)?;

        let attn_weights = candle_nn::ops::softmax(&scores, D::Minus1)?.to_dtype(compute_dtype)?;
        let attn_out = attn_weights.matmul(&v.contiguous()?)?;

        let attn_out = attn_out
            .transpose(1, 2)?
            .reshape((batch, seq_len, self.n_heads * self.head_dim))?;
        self.wo.forward(&attn_out)
    }
}

/// Upper triangle filled with -inf, diagonal and below = 0.
fn causal_mask(seq_len: usize, device: &Device) -> Result<Tensor> {
    let mut mask_data = vec![0.0f32; seq_len * seq_len];
    for i in 0..seq_len {
        for j in (i + 1)..seq_len {
            mask_data[i * seq_len + j] = f32::NEG_INFINITY;
        }
    }
    Tensor::from_vec(mask_data, (seq_len, seq_len), device)
}

/// Combine the causal mask with a `[batch, seq_len]` key padding mask
/// (nonzero = attend) into an additive `[batch, 1, seq_len, seq_len]` mask.
///
/// Right padding keeps key 0 valid for every row, so no row is fully masked.
pub fn attention_bias(attention_mask: &Tensor) -> Result<Tensor> {
    let (batch, seq_len) = attention_mask.dims2()?;
    let keep = attention_mask.to_dtype(DType::F32)?;
    let key_bias = ((keep - 1.0)? * -MASKED_SCORE)?.reshape((batch, 1, 1, seq_len))?;
    let causal = causal_mask(seq_len, attention_mask.device())?.reshape((1, 1, seq_len, seq_len))?;
    key_bias.broadcast_add(&causal)
}
