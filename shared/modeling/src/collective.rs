use ember_core::{BarrierCancelled, WorkerBarrier};
use std::{
    fmt::Debug,
    sync::{Arc, Mutex, PoisonError},
};
use tch::{Device, Kind, TchError, Tensor};
use thiserror::Error;

#[cfg(feature = "parallelism")]
use tch::{CStore, ReduceOpType, CNCCL};

#[derive(Debug, Error)]
pub enum CollectiveError {
    #[error("collective was aborted by another worker")]
    Aborted(#[from] BarrierCancelled),

    #[error("all-reduce failed: {0}")]
    Tch(#[from] TchError),
}

/// Communication between the workers of one job. Every call blocks until all
/// `world_size` workers have made the matching call.
pub trait Collective: Send + Debug {
    fn rank(&self) -> usize;
    fn world_size(&self) -> usize;

    /// Replaces `tensor` on every worker with the element-wise mean of all
    /// workers' values.
    fn all_reduce_mean(&self, tensor: &mut Tensor) -> Result<(), CollectiveError>;

    fn barrier(&self) -> Result<(), CollectiveError>;

    /// Releases peers blocked in this collective so a failed worker cannot hang
    /// the others.
    fn abort(&self) {}
}

pub trait CudaSynchronize {
    fn cuda_synchronize(&self);
}

impl CudaSynchronize for Device {
    fn cuda_synchronize(&self) {
        if let Device::Cuda(index) = self {
            tch::Cuda::synchronize(*index as i64);
        }
    }
}

/// World size one: nothing to communicate.
#[derive(Debug, Default, Clone, Copy)]
pub struct SingleWorker;

impl Collective for SingleWorker {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn all_reduce_mean(&self, _tensor: &mut Tensor) -> Result<(), CollectiveError> {
        Ok(())
    }

    fn barrier(&self) -> Result<(), CollectiveError> {
        Ok(())
    }
}

#[derive(Debug)]
struct LocalGroup {
    slots: Mutex<Vec<Option<Tensor>>>,
    barrier: Arc<WorkerBarrier>,
}

/// Workers running as threads of one process, exchanging tensors through
/// shared memory. Every worker sums the contributions in rank order, so all
/// workers end up with bit-identical results.
#[derive(Debug, Clone)]
pub struct LocalCollective {
    group: Arc<LocalGroup>,
    rank: usize,
}

impl LocalCollective {
    /// One handle per rank, all bound to `barrier`.
    pub fn group(barrier: Arc<WorkerBarrier>) -> Vec<Self> {
        let world_size = barrier.parties();
        let group = Arc::new(LocalGroup {
            slots: Mutex::new((0..world_size).map(|_| None).collect()),
            barrier,
        });
        (0..world_size)
            .map(|rank| Self {
                group: group.clone(),
                rank,
            })
            .collect()
    }
}

impl Collective for LocalCollective {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.group.barrier.parties()
    }

    fn all_reduce_mean(&self, tensor: &mut Tensor) -> Result<(), CollectiveError> {
        let _guard = tch::no_grad_guard();
        let contribution = tensor.to_device(Device::Cpu).to_kind(Kind::Float).copy();
        self.group
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)[self.rank] = Some(contribution);

        // every contribution is in place
        self.group.barrier.wait()?;

        let sum = {
            let slots = self
                .group
                .slots
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let mut contributions = slots.iter().flatten();
            let mut sum = match contributions.next() {
                Some(first) => first.copy(),
                None => return Ok(()),
            };
            for contribution in contributions {
                sum += contribution;
            }
            sum
        };

        // every worker has read the slots; they may be overwritten again
        self.group.barrier.wait()?;

        let mean = sum / self.world_size() as f64;
        tensor.f_copy_(&mean.to_device(tensor.device()).to_kind(tensor.kind()))?;
        Ok(())
    }

    fn barrier(&self) -> Result<(), CollectiveError> {
        self.group.barrier.wait()?;
        Ok(())
    }

    fn abort(&self) {
        self.group.barrier.cancel();
    }
}

/// NCCL communicator for one CUDA device. Workers are threads of this process,
/// one per device; `barrier` and `abort` go through the shared in-process
/// barrier.
#[cfg(feature = "parallelism")]
pub struct NcclCollective {
    comm: CNCCL,
    rank: usize,
    world_size: usize,
    device: Device,
    barrier: Arc<WorkerBarrier>,
}

#[cfg(feature = "parallelism")]
impl NcclCollective {
    /// Blocks until all `world_size` workers have joined the communicator.
    pub fn new(
        id: Arc<CStore>,
        rank: usize,
        device: Device,
        barrier: Arc<WorkerBarrier>,
    ) -> Result<Self, CollectiveError> {
        let world_size = barrier.parties();
        let comm = CNCCL::new(id, rank as i64, world_size as i64, device)?;
        Ok(Self {
            comm,
            rank,
            world_size,
            device,
            barrier,
        })
    }
}

#[cfg(feature = "parallelism")]
impl Debug for NcclCollective {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NcclCollective")
            .field("rank", &self.rank)
            .field("world_size", &self.world_size)
            .field("device", &self.device)
            .finish()
    }
}

// CNCCL is Send but not Sync; each worker thread owns its own communicator.
#[cfg(feature = "parallelism")]
unsafe impl Send for NcclCollective {}

#[cfg(feature = "parallelism")]
impl Collective for NcclCollective {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn all_reduce_mean(&self, tensor: &mut Tensor) -> Result<(), CollectiveError> {
        let _guard = tch::no_grad_guard();
        let mut fp32 = tensor.to_kind(Kind::Float);
        self.comm.all_reduce(&[&mut fp32], ReduceOpType::Sum)?;
        self.device.cuda_synchronize();
        let mean = fp32 / self.world_size as f64;
        tensor.f_copy_(&mean.to_kind(tensor.kind()))?;
        Ok(())
    }

    fn barrier(&self) -> Result<(), CollectiveError> {
        self.device.cuda_synchronize();
        self.barrier.wait()?;
        Ok(())
    }

    fn abort(&self) {
        self.barrier.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn run_group<T: Send + 'static>(
        world_size: usize,
        f: impl Fn(LocalCollective) -> T + Send + Sync + 'static,
    ) -> Vec<T> {
        let f = Arc::new(f);
        let handles: Vec<_> = LocalCollective::group(WorkerBarrier::new(world_size))
            .into_iter()
            .map(|collective| {
                let f = f.clone();
                thread::spawn(move || f(collective))
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    }

    #[test]
    fn mean_is_identical_on_every_rank() {
        let results = run_group(3, |collective| {
            let rank = collective.rank() as f32;
            let mut tensor = Tensor::from_slice(&[rank, 10.0 * rank]);
            collective.all_reduce_mean(&mut tensor).unwrap();
            // a second round reuses the slots
            let mut again = Tensor::from_slice(&[1.0f32 + rank]);
            collective.all_reduce_mean(&mut again).unwrap();
            (
                Vec::<f32>::try_from(&tensor).unwrap(),
                Vec::<f32>::try_from(&again).unwrap(),
            )
        });
        for (first, second) in results {
            assert_eq!(first, vec![1.0, 10.0]);
            assert_eq!(second, vec![2.0]);
        }
    }

    #[test]
    fn abort_releases_waiting_peers() {
        let results = run_group(2, |collective| {
            if collective.rank() == 0 {
                collective.abort();
                return true;
            }
            matches!(collective.barrier(), Err(CollectiveError::Aborted(_)))
        });
        assert!(results.into_iter().all(|released| released));
    }

    #[test]
    fn single_worker_leaves_tensor_untouched() {
        let mut tensor = Tensor::from_slice(&[3.0f32]);
        SingleWorker.all_reduce_mean(&mut tensor).unwrap();
        SingleWorker.barrier().unwrap();
        assert_eq!(Vec::<f32>::try_from(&tensor).unwrap(), vec![3.0]);
    }
}
