//! # LLM Pretraining Library
//!
//! Data-parallel pretraining core for decoder-only language models.
//!
//! ## Architecture Overview
//!
//! - **Distributed**: one process per device, NCCL or TCP collectives,
//!   explicit coordinator/worker roles
//! - **Data**: per-step seeded sampling, prefetching worker pool, shift-by-one
//!   batch preparation with an explicit stop token
//! - **Step**: mixed precision with dynamic loss scaling, global-norm
//!   clipping, AdamW under a linear warmup/decay schedule
//! - **Checkpoints**: atomic directory snapshots that resume bit-for-bit
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use llm_pretrain::{config::TrainConfig, distributed::DistContext};
//! use llm_pretrain::{model::TinyLlamaBuilder, train::Trainer};
//!
//! # fn main() -> anyhow::Result<()> {
//! let config = TrainConfig::tiny_cpu();
//! let builder = TinyLlamaBuilder::new(config.model.clone());
//! let mut trainer = Trainer::new(config, DistContext::local(), &builder)?;
//!
//! let dataset = trainer.open_dataset()?;
//! let summary = trainer.run(dataset)?;
//! println!("finished at step {}", summary.final_step);
//! # Ok(())
//! # }
//! ```

pub mod attention;
pub mod block;
pub mod checkpoint;
pub mod config;
pub mod data;
pub mod distributed;
pub mod error;
pub mod ffn;
pub mod layers;
pub mod logging;
pub mod metrics;
pub mod model;
pub mod optim;
pub mod state;
pub mod step;
pub mod train;
