//! Record datasets: indexed collections of unpadded token id sequences.

use std::fs::File;
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rand::{Rng, SeedableRng};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::info;

use super::tokenizer::TextTokenizer;
use crate::config::DatasetConfig;
use crate::error::{IoResultExt, TrainError, TrainResult};

/// Indexed collection of raw records (each at least one token long).
///
/// Shared across prefetch workers, hence `Send + Sync`.
pub trait RecordDataset: Send + Sync {
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
    fn get_record(&self, idx: usize) -> TrainResult<Vec<u32>>;
}

fn out_of_range(idx: usize, len: usize) -> TrainError {
    TrainError::DataLoading(format!("record index {} out of range (len {})", idx, len))
}

/// Records held in memory.
pub struct InMemoryDataset {
    records: Vec<Vec<u32>>,
}

impl InMemoryDataset {
    pub fn new(records: Vec<Vec<u32>>) -> TrainResult<Self> {
        if let Some(idx) = records.iter().position(|r| r.is_empty()) {
            return Err(TrainError::DataLoading(format!("record {} is empty", idx)));
        }
        Ok(Self { records })
    }
}

impl RecordDataset for InMemoryDataset {
    fn len(&self) -> usize {
        self.records.len()
    }

    fn get_record(&self, idx: usize) -> TrainResult<Vec<u32>> {
        self.records
            .get(idx)
            .cloned()
            .ok_or_else(|| out_of_range(idx, self.records.len()))
    }
}

/// Variable-length synthetic sequences for training loop validation.
pub struct SyntheticDataset {
    records: Vec<Vec<u32>>,
}

impl SyntheticDataset {
    pub fn new(vocab_size: u32, num_records: usize, min_len: usize, max_len: usize, seed: u64) -> Self {
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        let min_len = min_len.max(1);
        let max_len = max_len.max(min_len);
        let vocab_size = vocab_size.max(2);

        let records = (0..num_records)
            .map(|i| {
                let len = rng.gen_range(min_len..=max_len);
                match i % 3 {
                    0 => {
                        // Repeated token
                        let tok = (i as u32 % (vocab_size - 1)) + 1;
                        vec![tok; len]
                    }
                    1 => {
                        // Sequential (modular)
                        let start = i as u32 % vocab_size;
                        (0..len as u32).map(|j| (start + j) % vocab_size).collect()
                    }
                    _ => (0..len).map(|_| rng.gen_range(0..vocab_size)).collect(),
                }
            })
            .collect();
        Self { records }
    }
}

impl RecordDataset for SyntheticDataset {
    fn len(&self) -> usize {
        self.records.len()
    }

    fn get_record(&self, idx: usize) -> TrainResult<Vec<u32>> {
        self.records
            .get(idx)
            .cloned()
            .ok_or_else(|| out_of_range(idx, self.records.len()))
    }
}

#[derive(Deserialize)]
struct JsonlLine {
    #[serde(default)]
    input_ids: Option<Vec<u32>>,
    #[serde(default)]
    text: Option<String>,
}

enum Storage {
    Memory(Vec<u32>),
    /// Lazily read from the token cache file.
    Disk(Mutex<File>),
}

/// JSON Lines dataset backed by a tokenized cache.
///
/// The first open tokenizes every line (`input_ids` verbatim, `text` through
/// the tokenizer) into `<stem>.<fingerprint>.tokens` / `.offsets` under the
/// cache directory; later opens with the same file and tokenizer reuse them.
pub struct JsonlDataset {
    offsets: Vec<u64>,
    storage: Storage,
    tokens_path: PathBuf,
}

impl JsonlDataset {
    pub fn open(
        path: &Path,
        tokenizer: &dyn TextTokenizer,
        cache_dir: &Path,
        keep_in_memory: bool,
    ) -> TrainResult<Self> {
        if !path.exists() {
            return Err(TrainError::DataLoading(format!(
                "dataset not found: {}",
                path.display()
            )));
        }
        std::fs::create_dir_all(cache_dir).with_path(cache_dir)?;

        let fingerprint = fingerprint(path, tokenizer)?;
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("dataset");
        let tokens_path = cache_dir.join(format!("{}.{}.tokens", stem, fingerprint));
        let offsets_path = cache_dir.join(format!("{}.{}.offsets", stem, fingerprint));

        if tokens_path.exists() && offsets_path.exists() {
            info!(path = %tokens_path.display(), "Reusing tokenized dataset cache");
        } else {
            build_cache(path, tokenizer, &tokens_path, &offsets_path)?;
        }

        let offsets = read_u64s(&offsets_path)?;
        if offsets.len() < 2 {
            return Err(TrainError::DataLoading(format!(
                "dataset {} contains no records",
                path.display()
            )));
        }
        let storage = if keep_in_memory {
            Storage::Memory(read_u32s(&tokens_path)?)
        } else {
            Storage::Disk(Mutex::new(File::open(&tokens_path).with_path(&tokens_path)?))
        };

        info!(
            records = offsets.len() - 1,
            in_memory = keep_in_memory,
            "Opened JSONL dataset"
        );
        Ok(Self {
            offsets,
            storage,
            tokens_path,
        })
    }

    pub fn cache_path(&self) -> &Path {
        &self.tokens_path
    }
}

impl RecordDataset for JsonlDataset {
    fn len(&self) -> usize {
        self.offsets.len() - 1
    }

    fn get_record(&self, idx: usize) -> TrainResult<Vec<u32>> {
        if idx >= self.len() {
            return Err(out_of_range(idx, self.len()));
        }
        let (start, end) = (self.offsets[idx] as usize, self.offsets[idx + 1] as usize);
        match &self.storage {
            Storage::Memory(tokens) => Ok(tokens[start..end].to_vec()),
            Storage::Disk(file) => {
                let mut file = file
                    .lock()
                    .map_err(|_| TrainError::DataLoading("dataset file lock poisoned".to_string()))?;
                let mut buf = vec![0u8; (end - start) * 4];
                file.seek(SeekFrom::Start(start as u64 * 4))
                    .with_path(&self.tokens_path)?;
                file.read_exact(&mut buf).with_path(&self.tokens_path)?;
                Ok(decode_u32s(&buf))
            }
        }
    }
}

/// Hash of the raw dataset bytes and the tokenizer identity.
fn fingerprint(path: &Path, tokenizer: &dyn TextTokenizer) -> TrainResult<String> {
    let mut hasher = Sha256::new();
    let mut file = File::open(path).with_path(path)?;
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).with_path(path)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    hasher.update(b"\n");
    hasher.update(tokenizer.fingerprint().as_bytes());
    let digest = hex::encode(hasher.finalize());
    Ok(digest[..16].to_string())
}

fn build_cache(
    path: &Path,
    tokenizer: &dyn TextTokenizer,
    tokens_path: &Path,
    offsets_path: &Path,
) -> TrainResult<()> {
    info!(path = %path.display(), "Tokenizing dataset into cache");
    let reader = BufReader::new(File::open(path).with_path(path)?);
    let mut tokens: Vec<u8> = Vec::new();
    let mut offsets: Vec<u64> = vec![0];
    let mut count: u64 = 0;

    for (line_no, line) in reader.lines().enumerate() {
        let line = line.with_path(path)?;
        if line.trim().is_empty() {
            continue;
        }
        let parsed: JsonlLine = serde_json::from_str(&line).map_err(|e| {
            TrainError::DataLoading(format!("{}:{}: {}", path.display(), line_no + 1, e))
        })?;
        let ids = match (parsed.input_ids, parsed.text) {
            (Some(ids), _) => ids,
            (None, Some(text)) => tokenizer.encode(&text)?,
            (None, None) => {
                return Err(TrainError::DataLoading(format!(
                    "{}:{}: expected `input_ids` or `text`",
                    path.display(),
                    line_no + 1
                )))
            }
        };
        // Empty records cannot form a training window.
        if ids.is_empty() {
            continue;
        }
        if let Some(bad) = ids.iter().find(|&&id| id as usize >= tokenizer.vocab_size()) {
            return Err(TrainError::DataLoading(format!(
                "{}:{}: token id {} outside vocabulary of {}",
                path.display(),
                line_no + 1,
                bad,
                tokenizer.vocab_size()
            )));
        }
        for id in &ids {
            tokens.extend_from_slice(&id.to_le_bytes());
        }
        count += ids.len() as u64;
        offsets.push(count);
    }

    // Write to temp names then rename, so an interrupted build is never reused.
    let tmp_tokens = tokens_path.with_extension("tokens.partial");
    let tmp_offsets = offsets_path.with_extension("offsets.partial");
    std::fs::write(&tmp_tokens, &tokens).with_path(&tmp_tokens)?;
    let offset_bytes: Vec<u8> = offsets.iter().flat_map(|o| o.to_le_bytes()).collect();
    std::fs::write(&tmp_offsets, offset_bytes).with_path(&tmp_offsets)?;
    std::fs::rename(&tmp_tokens, tokens_path).with_path(tokens_path)?;
    std::fs::rename(&tmp_offsets, offsets_path).with_path(offsets_path)?;
    Ok(())
}

fn decode_u32s(bytes: &[u8]) -> Vec<u32> {
    bytes
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

fn read_u32s(path: &Path) -> TrainResult<Vec<u32>> {
    let data = std::fs::read(path).with_path(path)?;
    if data.len() % 4 != 0 {
        return Err(TrainError::DataLoading(format!(
            "token cache {} has {} bytes (not a multiple of 4)",
            path.display(),
            data.len()
        )));
    }
    Ok(decode_u32s(&data))
}

fn read_u64s(path: &Path) -> TrainResult<Vec<u64>> {
    let data = std::fs::read(path).with_path(path)?;
    if data.len() % 8 != 0 {
        return Err(TrainError::DataLoading(format!(
            "offset cache {} has {} bytes (not a multiple of 8)",
            path.display(),
            data.len()
        )));
    }
    Ok(data
        .chunks_exact(8)
        .map(|c| u64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
        .collect())
}

/// Open the dataset named by the run configuration.
pub fn open_dataset(
    config: &DatasetConfig,
    tokenizer: &dyn TextTokenizer,
    cache_dir: &Path,
    keep_in_memory: bool,
    seed: u64,
) -> TrainResult<Box<dyn RecordDataset>> {
    match config {
        DatasetConfig::Jsonl { path } => Ok(Box::new(JsonlDataset::open(
            path,
            tokenizer,
            cache_dir,
            keep_in_memory,
        )?)),
        DatasetConfig::Synthetic {
            num_records,
            min_len,
            max_len,
        } => Ok(Box::new(SyntheticDataset::new(
            tokenizer.vocab_size() as u32,
            *num_records,
            *min_len,
            *max_len,
            seed,
        ))),
    }
}
