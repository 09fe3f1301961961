//! Tokenizer collaborator: byte-level and HuggingFace `tokenizers` backends.
//!
//! Both persist a `tokenizer_config.json` describing the backend, the pad id
//! and the maximum length; the HuggingFace backend also writes its
//! `tokenizer.json`.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::TokenizerConfig;
use crate::error::{IoResultExt, TrainError, TrainResult};

pub const TOKENIZER_CONFIG_FILE: &str = "tokenizer_config.json";
pub const HF_TOKENIZER_FILE: &str = "tokenizer.json";

/// Text -> id encoder with a designated pad (= end-of-sequence) id.
pub trait TextTokenizer: Send + Sync {
    fn pad_id(&self) -> u32;
    fn vocab_size(&self) -> usize;
    /// Longest window the batch preparer may emit.
    fn max_length(&self) -> usize;
    /// Encode without truncation or special tokens.
    fn encode(&self, text: &str) -> TrainResult<Vec<u32>>;
    /// Write the tokenizer artifact into `dir`.
    fn save(&self, dir: &Path) -> TrainResult<()>;
    /// Stable description used to fingerprint tokenized caches.
    fn fingerprint(&self) -> String;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum TokenizerArtifact {
    Byte { max_length: usize },
    HuggingFace {
        max_length: usize,
        pad_id: u32,
        eos_token: String,
    },
}

/// Raw UTF-8 bytes as ids; byte 0 doubles as pad/eos.
#[derive(Debug, Clone)]
pub struct ByteTokenizer {
    max_length: usize,
}

impl ByteTokenizer {
    pub fn new(max_length: usize) -> Self {
        Self { max_length }
    }
}

impl TextTokenizer for ByteTokenizer {
    fn pad_id(&self) -> u32 {
        0
    }

    fn vocab_size(&self) -> usize {
        256
    }

    fn max_length(&self) -> usize {
        self.max_length
    }

    fn encode(&self, text: &str) -> TrainResult<Vec<u32>> {
        Ok(text.bytes().map(u32::from).collect())
    }

    fn save(&self, dir: &Path) -> TrainResult<()> {
        write_artifact(
            dir,
            &TokenizerArtifact::Byte {
                max_length: self.max_length,
            },
        )
    }

    fn fingerprint(&self) -> String {
        "byte".to_string()
    }
}

/// Wrapper around a HuggingFace `tokenizer.json`.
pub struct HfTokenizer {
    inner: tokenizers::Tokenizer,
    pad_id: u32,
    eos_token: String,
    vocab_size: usize,
    max_length: usize,
}

impl HfTokenizer {
    /// Load from a local tokenizer.json file; `eos_token` becomes the pad id.
    pub fn from_file(path: &Path, eos_token: &str, max_length: usize) -> TrainResult<Self> {
        let inner = tokenizers::Tokenizer::from_file(path).map_err(|e| {
            TrainError::DataLoading(format!(
                "failed to load tokenizer from {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_inner(inner, eos_token, max_length)
    }

    /// Load from raw bytes (e.g. embedded tokenizer.json).
    pub fn from_bytes(bytes: &[u8], eos_token: &str, max_length: usize) -> TrainResult<Self> {
        let inner = tokenizers::Tokenizer::from_bytes(bytes)
            .map_err(|e| TrainError::DataLoading(format!("failed to load tokenizer from bytes: {}", e)))?;
        Self::from_inner(inner, eos_token, max_length)
    }

    fn from_inner(mut inner: tokenizers::Tokenizer, eos_token: &str, max_length: usize) -> TrainResult<Self> {
        let pad_id = inner.token_to_id(eos_token).ok_or_else(|| {
            TrainError::Config(format!("tokenizer has no eos token '{}'", eos_token))
        })?;
        // Records are cropped by the batch preparer, never by the tokenizer.
        let _ = inner.with_truncation(None);
        let _ = inner.with_padding(None);
        let vocab_size = inner.get_vocab_size(true);
        Ok(Self {
            inner,
            pad_id,
            eos_token: eos_token.to_string(),
            vocab_size,
            max_length,
        })
    }
}

impl TextTokenizer for HfTokenizer {
    fn pad_id(&self) -> u32 {
        self.pad_id
    }

    fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    fn max_length(&self) -> usize {
        self.max_length
    }

    fn encode(&self, text: &str) -> TrainResult<Vec<u32>> {
        let encoding = self
            .inner
            .encode(text, false)
            .map_err(|e| TrainError::DataLoading(format!("encoding error: {}", e)))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn save(&self, dir: &Path) -> TrainResult<()> {
        let path = dir.join(HF_TOKENIZER_FILE);
        self.inner.save(&path, false).map_err(|e| TrainError::Io {
            message: e.to_string(),
            path: path.display().to_string(),
        })?;
        write_artifact(
            dir,
            &TokenizerArtifact::HuggingFace {
                max_length: self.max_length,
                pad_id: self.pad_id,
                eos_token: self.eos_token.clone(),
            },
        )
    }

    fn fingerprint(&self) -> String {
        format!("hf:{}:{}:{}", self.vocab_size, self.eos_token, self.pad_id)
    }
}

fn write_artifact(dir: &Path, artifact: &TokenizerArtifact) -> TrainResult<()> {
    let path = dir.join(TOKENIZER_CONFIG_FILE);
    let json = serde_json::to_string_pretty(artifact)?;
    std::fs::write(&path, json).with_path(&path)
}

/// Construct the tokenizer named by the run configuration.
pub fn build_tokenizer(config: &TokenizerConfig, max_length: usize) -> TrainResult<Box<dyn TextTokenizer>> {
    match config {
        TokenizerConfig::Byte => Ok(Box::new(ByteTokenizer::new(max_length))),
        TokenizerConfig::HuggingFace { path, eos_token } => {
            if !path.exists() {
                return Err(TrainError::Config(format!(
                    "tokenizer artifact not found: {}",
                    path.display()
                )));
            }
            Ok(Box::new(HfTokenizer::from_file(path, eos_token, max_length)?))
        }
    }
}

/// Restore a tokenizer previously written with [`TextTokenizer::save`].
pub fn load_tokenizer(dir: &Path) -> TrainResult<Box<dyn TextTokenizer>> {
    let path = dir.join(TOKENIZER_CONFIG_FILE);
    let raw = std::fs::read_to_string(&path).with_path(&path)?;
    let artifact: TokenizerArtifact = serde_json::from_str(&raw)?;
    match artifact {
        TokenizerArtifact::Byte { max_length } => Ok(Box::new(ByteTokenizer::new(max_length))),
        TokenizerArtifact::HuggingFace {
            max_length,
            pad_id,
            eos_token,
        } => {
            let tok = HfTokenizer::from_file(&dir.join(HF_TOKENIZER_FILE), &eos_token, max_length)?;
            if tok.pad_id != pad_id {
                return Err(TrainError::Checkpoint {
                    message: format!("tokenizer pad id {} does not match stored {}", tok.pad_id, pad_id),
                    path: path.display().to_string(),
                });
            }
            Ok(Box::new(tok))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_tokenizer_encodes_utf8() {
        let tok = ByteTokenizer::new(32);
        assert_eq!(tok.encode("hi").unwrap(), vec![104, 105]);
        assert_eq!(tok.encode("é").unwrap().len(), 2);
        assert_eq!(tok.pad_id(), 0);
    }

    #[test]
    fn test_byte_tokenizer_save_load() {
        let dir = tempfile::tempdir().unwrap();
        ByteTokenizer::new(77).save(dir.path()).unwrap();
        let restored = load_tokenizer(dir.path()).unwrap();
        assert_eq!(restored.max_length(), 77);
        assert_eq!(restored.vocab_size(), 256);
        assert_eq!(restored.fingerprint(), "byte");
    }

    #[test]
    fn test_hf_tokenizer_rejects_invalid_bytes() {
        assert!(HfTokenizer::from_bytes(b"not json", "</s>", 16).is_err());
    }

    #[test]
    fn test_missing_hf_artifact_is_config_error() {
        let cfg = TokenizerConfig::HuggingFace {
            path: "/nonexistent/tokenizer.json".into(),
            eos_token: "</s>".into(),
        };
        match build_tokenizer(&cfg, 16) {
            Err(TrainError::Config(msg)) => assert!(msg.contains("/nonexistent")),
            _ => panic!("expected config error"),
        }
    }

    #[test]
    fn test_load_without_artifact_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_tokenizer(dir.path()).is_err());
    }
}
