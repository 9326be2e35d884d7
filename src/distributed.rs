//! Data-parallel coordination
//!
//! Every worker runs the same training loop in lock-step. The only
//! cross-worker primitives are a barrier and a sum all-reduce over `f64`
//! buffers. Gradient averaging, batch-norm statistic averaging and metric
//! aggregation are built on the latter.
//!
//! - [`SingleProcess`]: world of one, every primitive is a no-op
//! - [`LocalGroup`]: N workers running as threads of one process, one per device

use std::collections::HashSet;
use std::marker::PhantomData;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;

use burn::module::{AutodiffModule, ModuleMapper, ModuleVisitor, ParamId};
use burn::optim::GradientsParams;
use burn::tensor::{backend::AutodiffBackend, Tensor, TensorData};
use tracing::{debug, error};

use crate::utils::error::{Result, SegMixError};

/// A group of workers training in lock-step
pub trait ProcessGroup: Send + Sync {
    fn rank(&self) -> usize;

    fn world_size(&self) -> usize;

    /// The coordinating worker owns every filesystem side effect
    fn is_main(&self) -> bool {
        self.rank() == 0
    }

    /// Block until every worker reached this point
    fn barrier(&self) -> Result<()>;

    /// Element-wise sum of `values` across all workers, written back in place
    fn all_reduce_sum(&self, values: &mut [f64]) -> Result<()>;

    /// Release every worker blocked in the group with an error
    fn abort(&self) {}
}

/// World of a single worker
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleProcess;

impl ProcessGroup for SingleProcess {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn barrier(&self) -> Result<()> {
        Ok(())
    }

    fn all_reduce_sum(&self, _values: &mut [f64]) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Default)]
struct BarrierState {
    arrived: usize,
    generation: u64,
    aborted: bool,
}

/// Reusable barrier that can be torn down when a worker fails
#[derive(Debug)]
struct AbortableBarrier {
    parties: usize,
    state: Mutex<BarrierState>,
    cvar: Condvar,
}

impl AbortableBarrier {
    fn new(parties: usize) -> Self {
        Self {
            parties,
            state: Mutex::new(BarrierState::default()),
            cvar: Condvar::new(),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, BarrierState>> {
        self.state
            .lock()
            .map_err(|_| SegMixError::Distributed("barrier state poisoned".to_string()))
    }

    fn wait(&self) -> Result<()> {
        let mut state = self.lock()?;
        if state.aborted {
            return Err(aborted());
        }

        let generation = state.generation;
        state.arrived += 1;
        if state.arrived == self.parties {
            state.arrived = 0;
            state.generation += 1;
            self.cvar.notify_all();
            return Ok(());
        }

        while state.generation == generation && !state.aborted {
            state = self
                .cvar
                .wait(state)
                .map_err(|_| SegMixError::Distributed("barrier state poisoned".to_string()))?;
        }

        if state.generation == generation {
            Err(aborted())
        } else {
            Ok(())
        }
    }

    fn abort(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.aborted = true;
        }
        self.cvar.notify_all();
    }
}

fn aborted() -> SegMixError {
    SegMixError::Distributed("a peer worker aborted".to_string())
}

#[derive(Debug)]
struct LocalShared {
    world_size: usize,
    barrier: AbortableBarrier,
    slots: Mutex<Vec<Vec<f64>>>,
}

/// In-process worker group; one handle per worker thread
#[derive(Debug, Clone)]
pub struct LocalGroup {
    rank: usize,
    shared: Arc<LocalShared>,
}

impl LocalGroup {
    /// Create the handles of a group with `world_size` members
    pub fn create(world_size: usize) -> Vec<LocalGroup> {
        let shared = Arc::new(LocalShared {
            world_size,
            barrier: AbortableBarrier::new(world_size),
            slots: Mutex::new(vec![Vec::new(); world_size]),
        });

        (0..world_size)
            .map(|rank| LocalGroup {
                rank,
                shared: Arc::clone(&shared),
            })
            .collect()
    }

    fn slots(&self) -> Result<MutexGuard<'_, Vec<Vec<f64>>>> {
        self.shared
            .slots
            .lock()
            .map_err(|_| SegMixError::Distributed("all-reduce buffer poisoned".to_string()))
    }
}

impl ProcessGroup for LocalGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.shared.world_size
    }

    fn barrier(&self) -> Result<()> {
        self.shared.barrier.wait()
    }

    fn all_reduce_sum(&self, values: &mut [f64]) -> Result<()> {
        self.slots()?[self.rank] = values.to_vec();
        self.shared.barrier.wait()?;

        let reduced = {
            let slots = self.slots()?;
            if let Some(bad) = slots.iter().position(|slot| slot.len() != values.len()) {
                Err(SegMixError::Distributed(format!(
                    "all-reduce desync: rank {} sent {} values, rank {} sent {}",
                    self.rank,
                    values.len(),
                    bad,
                    slots[bad].len()
                )))
            } else {
                let mut sum = vec![0.0f64; values.len()];
                for slot in slots.iter() {
                    for (acc, v) in sum.iter_mut().zip(slot.iter()) {
                        *acc += v;
                    }
                }
                Ok(sum)
            }
        };

        // Nobody may overwrite a slot before every worker has read them all
        self.shared.barrier.wait()?;

        values.copy_from_slice(&reduced?);
        Ok(())
    }

    fn abort(&self) {
        self.shared.barrier.abort();
    }
}

/// Run `worker` on `world_size` threads connected by a [`LocalGroup`].
///
/// A worker that fails aborts the group so its peers stop at their next
/// synchronisation point. Results come back ordered by rank; the first error
/// (by rank) is returned otherwise.
pub fn run_local_workers<T, F>(world_size: usize, worker: F) -> Result<Vec<T>>
where
    T: Send,
    F: Fn(LocalGroup) -> Result<T> + Sync,
{
    if world_size == 0 {
        return Err(SegMixError::Config("world size must be at least 1".to_string()));
    }

    let groups = LocalGroup::create(world_size);
    let worker = &worker;

    let outcomes: Vec<Result<T>> = thread::scope(|scope| {
        let handles: Vec<_> = groups
            .into_iter()
            .map(|group| {
                thread::Builder::new()
                    .name(format!("worker-{}", group.rank()))
                    .spawn_scoped(scope, move || {
                        let result = worker(group.clone());
                        if let Err(e) = &result {
                            error!("Worker {} failed: {}", group.rank(), e);
                            group.abort();
                        }
                        result
                    })
            })
            .collect();

        handles
            .into_iter()
            .enumerate()
            .map(|(rank, handle)| match handle {
                Ok(handle) => handle.join().unwrap_or_else(|_| {
                    Err(SegMixError::Distributed(format!("worker {} panicked", rank)))
                }),
                Err(e) => Err(SegMixError::Distributed(format!(
                    "failed to spawn worker {}: {}",
                    rank, e
                ))),
            })
            .collect()
    });

    outcomes.into_iter().collect()
}

struct GradientGather<'a, B: AutodiffBackend> {
    grads: &'a mut GradientsParams,
    flat: Vec<f64>,
    present: HashSet<ParamId>,
    error: Option<SegMixError>,
    _backend: PhantomData<B>,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for GradientGather<'_, B> {
    fn visit_float<const D: usize>(&mut self, id: ParamId, _tensor: &Tensor<B, D>) {
        if self.error.is_some() {
            return;
        }
        let Some(grad) = self.grads.remove::<B::InnerBackend, D>(id) else {
            return;
        };
        match grad.into_data().convert::<f32>().to_vec::<f32>() {
            Ok(values) => {
                self.flat.extend(values.into_iter().map(f64::from));
                self.present.insert(id);
            }
            Err(e) => {
                self.error = Some(SegMixError::Distributed(format!(
                    "failed to read gradient: {:?}",
                    e
                )))
            }
        }
    }
}

struct GradientScatter<'a, B: AutodiffBackend> {
    grads: &'a mut GradientsParams,
    flat: &'a [f64],
    offset: usize,
    present: HashSet<ParamId>,
    _backend: PhantomData<B>,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for GradientScatter<'_, B> {
    fn visit_float<const D: usize>(&mut self, id: ParamId, tensor: &Tensor<B, D>) {
        if !self.present.remove(&id) {
            return;
        }
        let dims = tensor.dims();
        let len: usize = dims.iter().product();
        let values: Vec<f32> = self.flat[self.offset..self.offset + len]
            .iter()
            .map(|&v| v as f32)
            .collect();
        self.offset += len;

        let grad =
            Tensor::<B::InnerBackend, D>::from_data(TensorData::new(values, dims), &tensor.device());
        self.grads.register::<B::InnerBackend, D>(id, grad);
    }
}

/// Average the gradients in `grads` across the group.
///
/// Only parameters of `module` with a registered gradient take part; the
/// visiting order is identical on every worker, which lines up the buffers.
pub fn all_reduce_gradients<B, M>(
    grads: GradientsParams,
    module: &M,
    group: &dyn ProcessGroup,
) -> Result<GradientsParams>
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
{
    let world_size = group.world_size();
    if world_size == 1 {
        return Ok(grads);
    }

    let mut grads = grads;
    let mut gather = GradientGather::<B> {
        grads: &mut grads,
        flat: Vec::new(),
        present: HashSet::new(),
        error: None,
        _backend: PhantomData,
    };
    module.visit(&mut gather);
    if let Some(e) = gather.error {
        return Err(e);
    }
    let mut flat = gather.flat;
    let present = gather.present;

    group.all_reduce_sum(&mut flat)?;
    let scale = 1.0 / world_size as f64;
    flat.iter_mut().for_each(|v| *v *= scale);
    debug!("Averaged {} gradient values over {} workers", flat.len(), world_size);

    let mut scatter = GradientScatter::<B> {
        grads: &mut grads,
        flat: &flat,
        offset: 0,
        present,
        _backend: PhantomData,
    };
    module.visit(&mut scatter);

    Ok(grads)
}

/// Collects the running statistics of a module: the float tensors that are
/// not trained by backward (batch-norm mean and variance).
struct RunningStatGather<B: AutodiffBackend> {
    flat: Vec<f64>,
    error: Option<SegMixError>,
    _backend: PhantomData<B>,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for RunningStatGather<B> {
    fn visit_float<const D: usize>(&mut self, _id: ParamId, tensor: &Tensor<B, D>) {
        if self.error.is_some() || tensor.is_require_grad() {
            return;
        }
        match tensor.clone().into_data().convert::<f32>().to_vec::<f32>() {
            Ok(values) => self.flat.extend(values.into_iter().map(f64::from)),
            Err(e) => {
                self.error = Some(SegMixError::Distributed(format!(
                    "failed to read running statistic: {:?}",
                    e
                )))
            }
        }
    }
}

struct RunningStatScatter<'a, B: AutodiffBackend> {
    flat: &'a [f64],
    offset: usize,
    _backend: PhantomData<B>,
}

impl<B: AutodiffBackend> ModuleMapper<B> for RunningStatScatter<'_, B> {
    fn map_float<const D: usize>(&mut self, _id: ParamId, tensor: Tensor<B, D>) -> Tensor<B, D> {
        if tensor.is_require_grad() {
            return tensor;
        }
        let dims = tensor.dims();
        let len: usize = dims.iter().product();
        let values: Vec<f32> = self.flat[self.offset..self.offset + len]
            .iter()
            .map(|&v| v as f32)
            .collect();
        self.offset += len;
        Tensor::from_data(TensorData::new(values, dims), &tensor.device())
    }
}

/// Average the batch-norm running statistics of `module` across the group so
/// that every worker holds the same model after a step.
pub fn all_reduce_running_stats<B, M>(module: M, group: &dyn ProcessGroup) -> Result<M>
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
{
    let world_size = group.world_size();
    if world_size == 1 {
        return Ok(module);
    }

    // Pending batch-norm updates are folded into the stored values first
    let _ = module.valid();

    let mut gather = RunningStatGather::<B> {
        flat: Vec::new(),
        error: None,
        _backend: PhantomData,
    };
    module.visit(&mut gather);
    if let Some(e) = gather.error {
        return Err(e);
    }
    let mut flat = gather.flat;

    group.all_reduce_sum(&mut flat)?;
    let scale = 1.0 / world_size as f64;
    flat.iter_mut().for_each(|v| *v *= scale);
    debug!("Averaged {} running statistic values over {} workers", flat.len(), world_size);

    let mut scatter = RunningStatScatter::<B> {
        flat: &flat,
        offset: 0,
        _backend: PhantomData,
    };
    Ok(module.map(&mut scatter))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_process_is_noop() {
        let group = SingleProcess;
        let mut values = vec![1.0, 2.0];
        group.barrier().unwrap();
        group.all_reduce_sum(&mut values).unwrap();
        assert_eq!(values, vec![1.0, 2.0]);
        assert!(group.is_main());
    }

    #[test]
    fn test_local_all_reduce_sums_across_workers() {
        let results = run_local_workers(3, |group| {
            let mut values = vec![group.rank() as f64, 1.0];
            group.all_reduce_sum(&mut values)?;
            // a second round reuses the slots
            let mut again = vec![10.0];
            group.all_reduce_sum(&mut again)?;
            group.barrier()?;
            Ok((values, again))
        })
        .unwrap();

        for (values, again) in results {
            assert_eq!(values, vec![3.0, 3.0]);
            assert_eq!(again, vec![30.0]);
        }
    }

    #[test]
    fn test_length_mismatch_is_fatal_everywhere() {
        let outcome = run_local_workers(2, |group| {
            let mut values = vec![0.0; group.rank() + 1];
            group.all_reduce_sum(&mut values)
        });
        assert!(matches!(outcome, Err(SegMixError::Distributed(_))));
    }

    #[test]
    fn test_failed_worker_releases_peers() {
        let outcome = run_local_workers(2, |group| {
            if group.rank() == 1 {
                return Err(SegMixError::Training("boom".to_string()));
            }
            group.barrier()
        });
        assert!(outcome.is_err());
    }
}
