//! Distributed coordination: process identity, collective groups, device
//! binding, barriers.
//!
//! `initialize` runs once per process. The resulting [`DistContext`] is the
//! only handle the rest of the crate uses; coordinator-only behaviour is
//! decided by the explicit [`Role`] it carries.

pub mod env;
#[cfg(feature = "nccl")]
pub mod nccl;
pub mod tcp;

use std::fmt;
use std::sync::{Arc, OnceLock};

use candle_core::Device;

pub use env::DistEnv;
pub use tcp::TcpGroup;

use crate::config::DeviceMode;
use crate::error::{TrainError, TrainResult};

/// Transport behind a process group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Local,
    Tcp,
    Nccl,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Local => write!(f, "local"),
            Backend::Tcp => write!(f, "tcp"),
            Backend::Nccl => write!(f, "nccl"),
        }
    }
}

/// Who performs the single-writer duties (checkpoints, metrics).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Coordinator,
    Worker,
}

impl Role {
    pub fn from_rank(rank: usize) -> Self {
        if rank == 0 {
            Role::Coordinator
        } else {
            Role::Worker
        }
    }

    pub fn is_coordinator(&self) -> bool {
        matches!(self, Role::Coordinator)
    }
}

/// Collective operations every rank must call in the same order.
///
/// All calls block until every member of the group has made the matching
/// call; there is no timeout.
pub trait ProcessGroup: Send + Sync {
    fn rank(&self) -> usize;
    fn world_size(&self) -> usize;
    fn backend(&self) -> Backend;
    fn barrier(&self) -> TrainResult<()>;
    /// Elementwise sum across ranks, result left in `buf` on every rank.
    fn all_reduce_sum(&self, buf: &mut [f32]) -> TrainResult<()>;
    /// Overwrite `buf` on every rank with rank 0's contents.
    fn broadcast(&self, buf: &mut [f32]) -> TrainResult<()>;

    /// Elementwise mean across ranks.
    fn all_reduce_mean(&self, buf: &mut [f32]) -> TrainResult<()> {
        let world = self.world_size();
        if world == 1 {
            return Ok(());
        }
        self.all_reduce_sum(buf)?;
        let inv = 1.0 / world as f32;
        buf.iter_mut().for_each(|v| *v *= inv);
        Ok(())
    }
}

/// World of one: every collective is a no-op.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalGroup;

impl LocalGroup {
    pub fn new() -> Self {
        Self
    }
}

impl ProcessGroup for LocalGroup {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn backend(&self) -> Backend {
        Backend::Local
    }

    fn barrier(&self) -> TrainResult<()> {
        Ok(())
    }

    fn all_reduce_sum(&self, _buf: &mut [f32]) -> TrainResult<()> {
        Ok(())
    }

    fn broadcast(&self, _buf: &mut [f32]) -> TrainResult<()> {
        Ok(())
    }
}

/// An established process group bound to a device.
#[derive(Clone)]
pub struct DistContext {
    pub env: DistEnv,
    pub role: Role,
    pub device: Device,
    pub group: Arc<dyn ProcessGroup>,
}

impl fmt::Debug for DistContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DistContext")
            .field("env", &self.env)
            .field("role", &self.role)
            .field("device", &self.device)
            .field("backend", &self.group.backend())
            .finish()
    }
}

impl DistContext {
    /// Single process on the CPU.
    pub fn local() -> Self {
        Self {
            env: DistEnv::single(),
            role: Role::Coordinator,
            device: Device::Cpu,
            group: Arc::new(LocalGroup::new()),
        }
    }

    /// Build a context for an explicit identity without touching the
    /// process-wide handle; barriers once before returning.
    pub fn establish(mode: DeviceMode, env: DistEnv) -> TrainResult<Self> {
        let (device, group): (Device, Arc<dyn ProcessGroup>) = match mode {
            DeviceMode::Cpu => (Device::Cpu, Arc::new(LocalGroup::new())),
            DeviceMode::CpuDistributed => (Device::Cpu, tcp_group(&env)?),
            DeviceMode::Gpu => {
                let device = Device::new_cuda(env.local_rank).map_err(|e| {
                    TrainError::Distributed(format!(
                        "cannot bind CUDA device {}: {}",
                        env.local_rank, e
                    ))
                })?;
                let group = gpu_group(&env, &device)?;
                (device, group)
            }
        };

        group.barrier()?;
        tracing::info!(
            rank = env.rank,
            world_size = env.world_size,
            local_rank = env.local_rank,
            backend = %group.backend(),
            device = ?device,
            "Process group initialized"
        );
        Ok(Self {
            role: Role::from_rank(env.rank),
            env,
            device,
            group,
        })
    }

    pub fn rank(&self) -> usize {
        self.env.rank
    }

    pub fn world_size(&self) -> usize {
        self.env.world_size
    }
}

fn tcp_group(env: &DistEnv) -> TrainResult<Arc<dyn ProcessGroup>> {
    if env.world_size == 1 {
        return Ok(Arc::new(LocalGroup::new()));
    }
    Ok(Arc::new(TcpGroup::rendezvous(
        &env.master_endpoint(),
        env.rank,
        env.world_size,
    )?))
}

#[cfg(feature = "nccl")]
fn gpu_group(env: &DistEnv, device: &Device) -> TrainResult<Arc<dyn ProcessGroup>> {
    if env.world_size == 1 {
        return Ok(Arc::new(LocalGroup::new()));
    }
    match nccl::NcclGroup::new(env, device) {
        Ok(group) => Ok(Arc::new(group)),
        Err(e) => {
            crate::logging::log_backend_fallback("nccl", "tcp", &e.to_string());
            tcp_group(&DistEnv {
                master_port: env.master_port.wrapping_add(1),
                ..env.clone()
            })
        }
    }
}

#[cfg(not(feature = "nccl"))]
fn gpu_group(env: &DistEnv, _device: &Device) -> TrainResult<Arc<dyn ProcessGroup>> {
    if env.world_size > 1 {
        crate::logging::log_backend_fallback("nccl", "tcp", "built without the `nccl` feature");
    }
    tcp_group(env)
}

static CONTEXT: OnceLock<DistContext> = OnceLock::new();

/// Establish this process's group, bind its device and barrier.
///
/// Distributed modes read `RANK`/`WORLD_SIZE`/`LOCAL_RANK` from the
/// environment; their absence is a fatal configuration error. Calling again
/// returns the existing context.
pub fn initialize(mode: DeviceMode) -> TrainResult<DistContext> {
    if let Some(ctx) = CONTEXT.get() {
        tracing::debug!("Process group already initialized");
        return Ok(ctx.clone());
    }
    let env = if mode.is_distributed() {
        DistEnv::from_env()?
    } else {
        DistEnv::single()
    };
    let ctx = DistContext::establish(mode, env)?;
    Ok(CONTEXT.get_or_init(|| ctx).clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_from_rank() {
        assert_eq!(Role::from_rank(0), Role::Coordinator);
        assert_eq!(Role::from_rank(3), Role::Worker);
        assert!(Role::Coordinator.is_coordinator());
        assert!(!Role::Worker.is_coordinator());
    }

    #[test]
    fn test_local_group_collectives_are_identity() {
        let g = LocalGroup::new();
        let mut buf = vec![1.0, 2.0];
        g.barrier().unwrap();
        g.all_reduce_sum(&mut buf).unwrap();
        g.all_reduce_mean(&mut buf).unwrap();
        g.broadcast(&mut buf).unwrap();
        assert_eq!(buf, vec![1.0, 2.0]);
        assert_eq!(g.backend(), Backend::Local);
    }

    #[test]
    fn test_initialize_is_idempotent() {
        let a = initialize(DeviceMode::Cpu).unwrap();
        let b = initialize(DeviceMode::Cpu).unwrap();
        assert_eq!(a.env, b.env);
        assert!(Arc::ptr_eq(&a.group, &b.group));
        assert!(a.role.is_coordinator());
    }

    #[test]
    fn test_cpu_distributed_world_of_one_needs_no_peers() {
        let env = DistEnv::single();
        let ctx = DistContext::establish(DeviceMode::CpuDistributed, env).unwrap();
        assert_eq!(ctx.group.backend(), Backend::Local);
        assert_eq!(ctx.world_size(), 1);
    }
}
