//! Pre-norm transformer block for training.

use candle_core::{DType, Result, Tensor};
use candle_nn::VarBuilder;

use crate::attention::AttentionTrain;
use crate::ffn::FeedForwardTrain;
use crate::layers::RMSNormTrain;
use crate::model::ModelConfig;

/// x + attn(norm(x)), then x + ffn(norm(x)).
pub struct TransformerBlockTrain {
    pub norm_attn: RMSNormTrain,
    pub norm_ffn: RMSNormTrain,
    pub attention: AttentionTrain,
    pub ffn: FeedForwardTrain,
}

impl TransformerBlockTrain {
    pub fn new(config: &ModelConfig, compute_dtype: DType, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            norm_attn: RMSNormTrain::new(config.dim, config.norm_eps, vb.pp("norm_attn"))?,
            norm_ffn: RMSNormTrain::new(config.dim, config.norm_eps, vb.pp("norm_ffn"))?,
            attention: AttentionTrain::new(
                config.dim,
                config.n_heads,
                config.n_kv_heads,
                compute_dtype,
                vb.pp("attn"),
            )?,
            ffn: FeedForwardTrain::new(config.dim, config.ffn_dim, compute_dtype, vb.pp("ffn"))?,
        })
    }

    /// x: [batch, seq, dim] -> [batch, seq, dim]
    pub fn forward(&self, x: &Tensor, cos: &Tensor, sin: &Tensor, mask: &Tensor) -> Result<Tensor> {
        let attn_out = self
            .attention
            .forward(&self.norm_attn.forward(x)?, cos, sin, mask)?;
        let x = (x + attn_out)?;
        let ffn_out = self.ffn.forward(&self.norm_ffn.forward(&x)?)?;
        x + ffn_out
    }
}
