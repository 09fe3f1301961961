pub mod batch;
pub mod dataset;
pub mod loader;
pub mod sampler;
pub mod tokenizer;

pub use batch::{BatchPreparer, PreparedBatch, IGNORE_INDEX};
pub use dataset::{open_dataset, InMemoryDataset, JsonlDataset, RecordDataset, SyntheticDataset};
pub use loader::{PrefetchLoader, RawBatch};
pub use sampler::{crop_rng, RandomSampler};
pub use tokenizer::{build_tokenizer, load_tokenizer, ByteTokenizer, HfTokenizer, TextTokenizer};
