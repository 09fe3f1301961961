//! NCCL collectives for one-process-per-GPU runs.
//!
//! The communicator id is created on rank 0 and shipped to the other ranks
//! over the TCP group, which stays alive for the id exchange only.

use std::sync::Arc;

use candle_core::Device;
use cudarc::driver::CudaDevice;
use cudarc::nccl::safe::{Comm, Id, ReduceOp};

use super::tcp::TcpGroup;
use super::{Backend, DistEnv, ProcessGroup};
use crate::error::{TrainError, TrainResult};

fn nccl_err(what: &str, e: impl std::fmt::Debug) -> TrainError {
    TrainError::Distributed(format!("{}: {:?}", what, e))
}

pub struct NcclGroup {
    rank: usize,
    world_size: usize,
    device: Arc<CudaDevice>,
    comm: Comm,
}

// SAFETY: the communicator is only driven from the training thread; the
// process group is shared behind `Arc` for the idempotent init handle.
unsafe impl Send for NcclGroup {}
unsafe impl Sync for NcclGroup {}

impl NcclGroup {
    pub fn new(env: &DistEnv, device: &Device) -> TrainResult<Self> {
        let cuda = match device {
            Device::Cuda(d) => d.cuda_device(),
            _ => {
                return Err(TrainError::Distributed(
                    "NCCL requires a CUDA device".to_string(),
                ))
            }
        };

        let bootstrap = TcpGroup::rendezvous(&env.master_endpoint(), env.rank, env.world_size)?;
        let id_bytes: Vec<u8> = if env.rank == 0 {
            let id = Id::new().map_err(|e| nccl_err("ncclGetUniqueId failed", e))?;
            id.internal().iter().map(|&c| c as u8).collect()
        } else {
            Vec::new()
        };
        let id_bytes = bootstrap.broadcast_bytes(&id_bytes)?;
        let internal: [std::ffi::c_char; 128] = id_bytes
            .iter()
            .map(|&b| b as std::ffi::c_char)
            .collect::<Vec<_>>()
            .try_into()
            .map_err(|_| TrainError::Distributed("malformed NCCL unique id".to_string()))?;
        let id = Id::uninit(internal);

        let comm = Comm::from_rank(Arc::clone(&cuda), env.rank, env.world_size, id)
            .map_err(|e| nccl_err("ncclCommInitRank failed", e))?;
        Ok(Self {
            rank: env.rank,
            world_size: env.world_size,
            device: cuda,
            comm,
        })
    }
}

impl ProcessGroup for NcclGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn backend(&self) -> Backend {
        Backend::Nccl
    }

    fn barrier(&self) -> TrainResult<()> {
        let mut token = [0.0f32];
        self.all_reduce_sum(&mut token)
    }

    fn all_reduce_sum(&self, buf: &mut [f32]) -> TrainResult<()> {
        if buf.is_empty() {
            return Ok(());
        }
        let send = self
            .device
            .htod_sync_copy(buf)
            .map_err(|e| nccl_err("host to device copy failed", e))?;
        let mut recv = self
            .device
            .alloc_zeros::<f32>(buf.len())
            .map_err(|e| nccl_err("device alloc failed", e))?;
        self.comm
            .all_reduce(&send, &mut recv, &ReduceOp::Sum)
            .map_err(|e| nccl_err("ncclAllReduce failed", e))?;
        let host = self
            .device
            .dtoh_sync_copy(&recv)
            .map_err(|e| nccl_err("device to host copy failed", e))?;
        buf.copy_from_slice(&host);
        Ok(())
    }

    fn broadcast(&self, buf: &mut [f32]) -> TrainResult<()> {
        if buf.is_empty() {
            return Ok(());
        }
        let send = self
            .device
            .htod_sync_copy(buf)
            .map_err(|e| nccl_err("host to device copy failed", e))?;
        let mut recv = self
            .device
            .alloc_zeros::<f32>(buf.len())
            .map_err(|e| nccl_err("device alloc failed", e))?;
        self.comm
            .broadcast(&Some(send), &mut recv, 0)
            .map_err(|e| nccl_err("ncclBroadcast failed", e))?;
        let host = self
            .device
            .dtoh_sync_copy(&recv)
            .map_err(|e| nccl_err("device to host copy failed", e))?;
        buf.copy_from_slice(&host);
        Ok(())
    }
}
