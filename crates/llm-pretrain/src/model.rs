//! Model collaborator boundary and the bundled decoder-only transformer.
//!
//! The training core only sees [`CausalLm`] and constructs models through a
//! [`ModelBuilder`]; architecture changes happen in a builder, never by
//! mutating a live model.

use candle_core::{DType, Result, Tensor};
use candle_nn::{Module, VarBuilder};
use serde::{Deserialize, Serialize};

use crate::attention::{attention_bias, precompute_rope_freqs};
use crate::block::TransformerBlockTrain;
use crate::layers::RMSNormTrain;

/// Autoregressive language model as seen by the step executor.
pub trait CausalLm {
    /// input_ids: [batch, seq] u32, attention_mask: [batch, seq] u8 (1 = valid).
    /// Returns f32 logits [batch, seq, vocab_size].
    fn forward(&self, input_ids: &Tensor, attention_mask: &Tensor) -> Result<Tensor>;

    fn vocab_size(&self) -> usize;
}

/// Factory that registers parameters in `vb` and returns a model computing
/// in `compute_dtype`.
///
/// Building twice against fresh `VarMap`s must yield identical parameter
/// names and shapes; checkpoint loading relies on it.
pub trait ModelBuilder {
    fn build(&self, vb: VarBuilder, compute_dtype: DType) -> Result<Box<dyn CausalLm>>;
}

/// Architecture hyperparameters for [`TinyLlama`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub vocab_size: usize,
    pub dim: usize,
    pub n_layers: usize,
    pub n_heads: usize,
    pub n_kv_heads: usize,
    pub ffn_dim: usize,
    pub max_seq_len: usize,
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f32,
    #[serde(default = "default_norm_eps")]
    pub norm_eps: f64,
    #[serde(default = "default_weight_tied")]
    pub weight_tied: bool,
}

fn default_rope_theta() -> f32 {
    10000.0
}
fn default_norm_eps() -> f64 {
    1e-6
}
fn default_weight_tied() -> bool {
    true
}

impl ModelConfig {
    /// Byte-vocabulary model for CPU smoke runs.
    pub fn tiny() -> Self {
        Self {
            vocab_size: 256,
            dim: 64,
            n_layers: 2,
            n_heads: 4,
            n_kv_heads: 2,
            ffn_dim: 172,
            max_seq_len: 128,
            rope_theta: default_rope_theta(),
            norm_eps: default_norm_eps(),
            weight_tied: true,
        }
    }

    /// ~110M parameters with a 32k vocabulary.
    pub fn small() -> Self {
        Self {
            vocab_size: 32000,
            dim: 768,
            n_layers: 12,
            n_heads: 12,
            n_kv_heads: 4,
            ffn_dim: 2048,
            max_seq_len: 2048,
            rope_theta: default_rope_theta(),
            norm_eps: default_norm_eps(),
            weight_tied: true,
        }
    }

    pub fn validate(&self) -> std::result::Result<(), Vec<String>> {
        let mut errors = Vec::new();
        if self.vocab_size == 0 || self.dim == 0 || self.n_layers == 0 {
            errors.push("model.vocab_size, model.dim and model.n_layers must be > 0".to_string());
        }
        if self.n_heads == 0 || self.dim % self.n_heads != 0 {
            errors.push(format!(
                "model.dim ({}) must be divisible by model.n_heads ({})",
                self.dim, self.n_heads
            ));
        } else if (self.dim / self.n_heads) % 2 != 0 {
            errors.push("model head_dim must be even for rotary embeddings".to_string());
        }
        if self.n_kv_heads == 0 || self.n_heads % self.n_kv_heads != 0 {
            errors.push(format!(
                "model.n_heads ({}) must be divisible by model.n_kv_heads ({})",
                self.n_heads, self.n_kv_heads
            ));
        }
        if self.ffn_dim == 0 {
            errors.push("model.ffn_dim must be > 0".to_string());
        }
        if self.max_seq_len == 0 {
            errors.push("model.max_seq_len must be > 0".to_string());
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Decoder-only transformer: embedding -> blocks -> norm -> LM head.
pub struct TinyLlama {
    pub config: ModelConfig,
    pub tok_embed: candle_nn::Embedding,
    pub blocks: Vec<TransformerBlockTrain>,
    pub norm_final: RMSNormTrain,
    pub lm_head_weight: Option<Tensor>, // None if weight-tied
    compute_dtype: DType,
    freqs_cos: Tensor,
    freqs_sin: Tensor,
}

impl TinyLlama {
    pub fn new(config: &ModelConfig, compute_dtype: DType, vb: VarBuilder) -> Result<Self> {
        // N(0, 0.02) instead of candle_nn::embedding's unit-variance default;
        // tied heads produce huge initial logits otherwise.
        let embed_weights = vb.pp("tok_embed").get_with_hints(
            (config.vocab_size, config.dim),
            "weight",
            candle_nn::Init::Randn {
                mean: 0.0,
                stdev: 0.02,
            },
        )?;
        let tok_embed = candle_nn::Embedding::new(embed_weights, config.dim);

        let blocks = (0..config.n_layers)
            .map(|i| TransformerBlockTrain::new(config, compute_dtype, vb.pp(format!("blocks.{i}"))))
            .collect::<Result<Vec<_>>>()?;

        let norm_final = RMSNormTrain::new(config.dim, config.norm_eps, vb.pp("norm_final"))?;

        let lm_head_weight = if !config.weight_tied {
            Some(vb.get_with_hints(
                (config.vocab_size, config.dim),
                "lm_head.weight",
                candle_nn::Init::Randn {
                    mean: 0.0,
                    stdev: 0.02,
                },
            )?)
        } else {
            None
        };

        let head_dim = config.dim / config.n_heads;
        let (freqs_cos, freqs_sin) =
            precompute_rope_freqs(head_dim, config.max_seq_len, config.rope_theta, vb.device())?;

        Ok(Self {
            config: config.clone(),
            tok_embed,
            blocks,
            norm_final,
            lm_head_weight,
            compute_dtype,
            freqs_cos,
            freqs_sin,
        })
    }

    pub fn compute_dtype(&self) -> DType {
        self.compute_dtype
    }

    fn lm_head(&self) -> &Tensor {
        match &self.lm_head_weight {
            Some(w) => w,
            None => self.tok_embed.embeddings(),
        }
    }
}

impl CausalLm for TinyLlama {
    fn forward(&self, input_ids: &Tensor, attention_mask: &Tensor) -> Result<Tensor> {
        let (batch, seq_len) = input_ids.dims2()?;
        if seq_len > self.config.max_seq_len {
            return Err(candle_core::Error::Msg(format!(
                "sequence length {} exceeds model max_seq_len {}",
                seq_len, self.config.max_seq_len
            )));
        }

        let mut x = self.tok_embed.forward(input_ids)?.to_dtype(self.compute_dtype)?;
        let cos = self.freqs_cos.narrow(0, 0, seq_len)?;
        let sin = self.freqs_sin.narrow(0, 0, seq_len)?;
        let mask = attention_bias(attention_mask)?;

        for block in &self.blocks {
            x = block.forward(&x, &cos, &sin, &mask)?;
        }
        let x = self.norm_final.forward(&x)?;

        let lm_w = self.lm_head().to_dtype(self.compute_dtype)?.t()?;
        x.reshape((batch * seq_len, self.config.dim))?
            .matmul(&lm_w)?
            .reshape((batch, seq_len, self.config.vocab_size))?
            .to_dtype(DType::F32)
    }

    fn vocab_size(&self) -> usize {
        self.config.vocab_size
    }
}

/// Builds [`TinyLlama`] from a [`ModelConfig`].
#[derive(Debug, Clone)]
pub struct TinyLlamaBuilder {
    config: ModelConfig,
}

impl TinyLlamaBuilder {
    pub fn new(config: ModelConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }
}

impl ModelBuilder for TinyLlamaBuilder {
    fn build(&self, vb: VarBuilder, compute_dtype: DType) -> Result<Box<dyn CausalLm>> {
        Ok(Box::new(TinyLlama::new(&self.config, compute_dtype, vb)?))
    }
}
