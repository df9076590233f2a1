use crate::{Collective, CollectiveError, LocalCollective, SingleWorker};
use ember_core::WorkerBarrier;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tch::Device;
use thiserror::Error;
use tracing::info;

#[cfg(feature = "parallelism")]
use crate::NcclCollective;
#[cfg(feature = "parallelism")]
use tch::CStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// NCCL between CUDA devices, one worker thread per device.
    Nccl,
    /// Shared-memory reduction between worker threads; works on any device.
    Local,
}

#[derive(Debug, Error)]
pub enum SetupError {
    #[error("world size must be at least 1")]
    EmptyWorld,

    #[error("world size {requested} needs {requested} CUDA devices, {available} available")]
    MissingDevice { requested: usize, available: usize },

    #[error("the NCCL backend needs CUDA devices, but CPU was requested")]
    NcclOnCpu,

    #[error("the NCCL backend was requested but the \"parallelism\" feature is disabled")]
    ParallelismNotEnabled,

    #[error("failed to join the process group: {0}")]
    Join(#[from] CollectiveError),
}

enum Link {
    Single,
    Local(LocalCollective),
    #[cfg(feature = "parallelism")]
    Nccl {
        id: Arc<CStore>,
        barrier: Arc<WorkerBarrier>,
    },
}

/// A worker's seat in the group, to be moved into the worker's thread and
/// connected there.
pub struct WorkerHandle {
    rank: usize,
    world_size: usize,
    device: Device,
    link: Link,
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("rank", &self.rank)
            .field("world_size", &self.world_size)
            .field("device", &self.device)
            .finish()
    }
}

// The NCCL store is only read while building the communicator in the worker's
// own thread.
#[cfg(feature = "parallelism")]
unsafe impl Send for WorkerHandle {}

impl WorkerHandle {
    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn device(&self) -> Device {
        self.device
    }

    /// Joins the collective. For NCCL this blocks until every worker has
    /// connected.
    pub fn connect(self) -> Result<Worker, SetupError> {
        let collective: Box<dyn Collective> = match self.link {
            Link::Single => Box::new(SingleWorker),
            Link::Local(local) => Box::new(local),
            #[cfg(feature = "parallelism")]
            Link::Nccl { id, barrier } => {
                Box::new(NcclCollective::new(id, self.rank, self.device, barrier)?)
            }
        };
        Ok(Worker {
            rank: self.rank,
            world_size: self.world_size,
            device: self.device,
            collective,
        })
    }
}

/// A connected worker: its identity plus its end of the collective.
#[derive(Debug)]
pub struct Worker {
    pub rank: usize,
    pub world_size: usize,
    pub device: Device,
    pub collective: Box<dyn Collective>,
}

impl Worker {
    pub fn is_leader(&self) -> bool {
        self.rank == 0
    }
}

/// Cancels the group's barrier, releasing every worker blocked on it.
#[derive(Debug, Clone)]
pub struct GroupAbort {
    barrier: Arc<WorkerBarrier>,
}

impl GroupAbort {
    pub fn abort(&self) {
        self.barrier.cancel();
    }

    pub fn is_aborted(&self) -> bool {
        self.barrier.is_cancelled()
    }
}

#[derive(Debug)]
pub struct ProcessGroup {
    workers: Vec<WorkerHandle>,
    barrier: Arc<WorkerBarrier>,
}

impl ProcessGroup {
    pub fn world_size(&self) -> usize {
        self.barrier.parties()
    }

    pub fn abort_handle(&self) -> GroupAbort {
        GroupAbort {
            barrier: self.barrier.clone(),
        }
    }

    pub fn into_workers(self) -> Vec<WorkerHandle> {
        self.workers
    }
}

fn devices(world_size: usize, cpu: bool) -> Result<Vec<Device>, SetupError> {
    if cpu {
        return Ok(vec![Device::Cpu; world_size]);
    }
    let available = tch::Cuda::device_count().max(0) as usize;
    if available < world_size {
        return Err(SetupError::MissingDevice {
            requested: world_size,
            available,
        });
    }
    Ok((0..world_size).map(Device::Cuda).collect())
}

/// Lays out a job of `world_size` workers, one per device. Worker `r` runs on
/// `cuda:r`, or on the CPU when `cpu` is set.
pub fn init_process_group(
    backend: Backend,
    world_size: usize,
    cpu: bool,
) -> Result<ProcessGroup, SetupError> {
    if world_size == 0 {
        return Err(SetupError::EmptyWorld);
    }
    let devices = devices(world_size, cpu)?;
    let barrier = WorkerBarrier::new(world_size);

    let links: Vec<Link> = if world_size == 1 {
        vec![Link::Single]
    } else {
        match backend {
            Backend::Local => LocalCollective::group(barrier.clone())
                .into_iter()
                .map(Link::Local)
                .collect(),
            Backend::Nccl => {
                if cpu {
                    return Err(SetupError::NcclOnCpu);
                }
                nccl_links(&barrier)?
            }
        }
    };

    info!(?backend, world_size, cpu, "Initialized process group");
    let workers = links
        .into_iter()
        .zip(devices)
        .enumerate()
        .map(|(rank, (link, device))| WorkerHandle {
            rank,
            world_size,
            device,
            link,
        })
        .collect();
    Ok(ProcessGroup { workers, barrier })
}

#[cfg(feature = "parallelism")]
fn nccl_links(barrier: &Arc<WorkerBarrier>) -> Result<Vec<Link>, SetupError> {
    let id = Arc::new(CStore::new());
    Ok((0..barrier.parties())
        .map(|_| Link::Nccl {
            id: id.clone(),
            barrier: barrier.clone(),
        })
        .collect())
}

#[cfg(not(feature = "parallelism"))]
fn nccl_links(_barrier: &Arc<WorkerBarrier>) -> Result<Vec<Link>, SetupError> {
    Err(SetupError::ParallelismNotEnabled)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_world_is_rejected() {
        assert!(matches!(
            init_process_group(Backend::Local, 0, true),
            Err(SetupError::EmptyWorld)
        ));
    }

    #[test]
    fn nccl_needs_cuda() {
        assert!(matches!(
            init_process_group(Backend::Nccl, 2, true),
            Err(SetupError::NcclOnCpu)
        ));
    }

    #[test]
    fn local_group_assigns_ranks_in_order() {
        let group = init_process_group(Backend::Local, 3, true).unwrap();
        assert_eq!(group.world_size(), 3);
        let abort = group.abort_handle();
        let workers: Vec<Worker> = group
            .into_workers()
            .into_iter()
            .map(|handle| handle.connect().unwrap())
            .collect();
        for (rank, worker) in workers.iter().enumerate() {
            assert_eq!(worker.rank, rank);
            assert_eq!(worker.collective.rank(), rank);
            assert_eq!(worker.collective.world_size(), 3);
            assert_eq!(worker.device, Device::Cpu);
        }
        assert!(workers[0].is_leader());
        abort.abort();
        assert!(abort.is_aborted());
        assert!(workers[1].collective.barrier().is_err());
    }

    #[test]
    fn single_worker_needs_no_backend() {
        let group = init_process_group(Backend::Nccl, 1, true).unwrap();
        let worker = group.into_workers().pop().unwrap().connect().unwrap();
        assert_eq!(worker.world_size, 1);
        worker.collective.barrier().unwrap();
    }
}
