//! Process identity injected by the launcher.

use crate::error::{TrainError, TrainResult};

pub const DEFAULT_MASTER_ADDR: &str = "127.0.0.1";
pub const DEFAULT_MASTER_PORT: u16 = 29500;

/// Rank, world size and local device index, plus the rendezvous address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistEnv {
    pub rank: usize,
    pub world_size: usize,
    pub local_rank: usize,
    pub master_addr: String,
    pub master_port: u16,
}

impl DistEnv {
    /// Single-process identity; no launcher variables needed.
    pub fn single() -> Self {
        Self {
            rank: 0,
            world_size: 1,
            local_rank: 0,
            master_addr: DEFAULT_MASTER_ADDR.to_string(),
            master_port: DEFAULT_MASTER_PORT,
        }
    }

    /// Read `RANK`, `WORLD_SIZE`, `LOCAL_RANK` (required) and
    /// `MASTER_ADDR`, `MASTER_PORT` (optional).
    pub fn from_env() -> TrainResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> TrainResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &str| -> TrainResult<usize> {
            let raw = lookup(key).ok_or_else(|| {
                TrainError::Config(format!(
                    "{} is not set; distributed runs must be started by a launcher that sets RANK, WORLD_SIZE and LOCAL_RANK",
                    key
                ))
            })?;
            raw.trim()
                .parse()
                .map_err(|_| TrainError::Config(format!("{} must be a non-negative integer, got '{}'", key, raw)))
        };

        let rank = required("RANK")?;
        let world_size = required("WORLD_SIZE")?;
        let local_rank = required("LOCAL_RANK")?;
        if world_size == 0 {
            return Err(TrainError::Config("WORLD_SIZE must be > 0".to_string()));
        }
        if rank >= world_size {
            return Err(TrainError::Config(format!(
                "RANK ({}) must be < WORLD_SIZE ({})",
                rank, world_size
            )));
        }

        let master_addr = lookup("MASTER_ADDR").unwrap_or_else(|| DEFAULT_MASTER_ADDR.to_string());
        let master_port = match lookup("MASTER_PORT") {
            Some(raw) => raw
                .trim()
                .parse()
                .map_err(|_| TrainError::Config(format!("MASTER_PORT must be a port number, got '{}'", raw)))?,
            None => DEFAULT_MASTER_PORT,
        };

        Ok(Self {
            rank,
            world_size,
            local_rank,
            master_addr,
            master_port,
        })
    }

    pub fn master_endpoint(&self) -> String {
        format!("{}:{}", self.master_addr, self.master_port)
    }
}
