//! Batch preparation: variable-length records -> fixed-shape training batch.

use candle_core::{Device, Result, Tensor};
use rand::Rng;

use crate::error::{TrainError, TrainResult};

/// Label value excluded from the loss.
pub const IGNORE_INDEX: i64 = -100;

/// Fixed-shape batch; every matrix is `batch_size x window`, row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedBatch {
    pub input_ids: Vec<u32>,
    pub attention_mask: Vec<bool>,
    pub labels: Vec<i64>,
    pub batch_size: usize,
    pub window: usize,
}

impl PreparedBatch {
    pub fn row_ids(&self, row: usize) -> &[u32] {
        &self.input_ids[row * self.window..(row + 1) * self.window]
    }

    pub fn row_mask(&self, row: usize) -> &[bool] {
        &self.attention_mask[row * self.window..(row + 1) * self.window]
    }

    pub fn row_labels(&self, row: usize) -> &[i64] {
        &self.labels[row * self.window..(row + 1) * self.window]
    }

    /// Positions that contribute to the loss.
    pub fn num_label_tokens(&self) -> usize {
        self.labels.iter().filter(|&&l| l != IGNORE_INDEX).count()
    }

    /// Materialize `(input_ids u32, attention_mask u8, label_ids u32, label_weights f32)`.
    ///
    /// Ignored labels become id 0 with weight 0, so the loss can gather
    /// without a sentinel.
    pub fn to_tensors(&self, device: &Device) -> Result<(Tensor, Tensor, Tensor, Tensor)> {
        let shape = (self.batch_size, self.window);
        let input_ids = Tensor::from_slice(&self.input_ids, shape, device)?;
        let mask: Vec<u8> = self.attention_mask.iter().map(|&m| m as u8).collect();
        let attention_mask = Tensor::from_vec(mask, shape, device)?;
        let (label_ids, label_weights): (Vec<u32>, Vec<f32>) = self
            .labels
            .iter()
            .map(|&l| {
                if l == IGNORE_INDEX {
                    (0u32, 0.0f32)
                } else {
                    (l as u32, 1.0f32)
                }
            })
            .unzip();
        let label_ids = Tensor::from_vec(label_ids, shape, device)?;
        let label_weights = Tensor::from_vec(label_weights, shape, device)?;
        Ok((input_ids, attention_mask, label_ids, label_weights))
    }
}

/// Crops, stop-pads, right-pads and shifts a batch of raw records.
#[derive(Debug, Clone, Copy)]
pub struct BatchPreparer {
    pad_id: u32,
    max_seq_len: usize,
}

impl BatchPreparer {
    pub fn new(pad_id: u32, max_seq_len: usize) -> Self {
        Self {
            pad_id,
            max_seq_len,
        }
    }

    pub fn pad_id(&self) -> u32 {
        self.pad_id
    }

    pub fn max_seq_len(&self) -> usize {
        self.max_seq_len
    }

    pub fn prepare<R: Rng>(&self, records: &[Vec<u32>], rng: &mut R) -> TrainResult<PreparedBatch> {
        if records.is_empty() {
            return Err(TrainError::DataLoading("cannot prepare an empty batch".to_string()));
        }
        if let Some(idx) = records.iter().position(|r| r.is_empty()) {
            return Err(TrainError::DataLoading(format!("record {} in batch is empty", idx)));
        }
        if self.max_seq_len == 0 {
            return Err(TrainError::Config("max_seq_len must be > 0".to_string()));
        }

        let longest = records.iter().map(Vec::len).max().unwrap_or(0);
        let window = longest.min(self.max_seq_len);
        let batch_size = records.len();

        let mut input_ids = Vec::with_capacity(batch_size * window);
        let mut attention_mask = Vec::with_capacity(batch_size * window);
        let mut labels = Vec::with_capacity(batch_size * window);

        let mut ids = Vec::with_capacity(window + 1);
        let mut mask = Vec::with_capacity(window + 1);
        for record in records {
            ids.clear();
            mask.clear();

            // Random crop; records of exactly `window` tokens are used whole.
            let content = if record.len() > window {
                let start = rng.gen_range(0..=record.len() - window);
                &record[start..start + window]
            } else {
                &record[..]
            };
            ids.extend_from_slice(content);
            mask.resize(content.len(), true);

            // Explicit stop token, then right padding; neither is attended.
            ids.resize(window + 1, self.pad_id);
            mask.resize(window + 1, false);

            for i in 0..window {
                input_ids.push(ids[i]);
                attention_mask.push(mask[i]);
                labels.push(if mask[i] { ids[i + 1] as i64 } else { IGNORE_INDEX });
            }
        }

        Ok(PreparedBatch {
            input_ids,
            attention_mask,
            labels,
            batch_size,
            window,
        })
    }
}
