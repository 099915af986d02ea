// pool.rs - Fixed-size worker pool executing `Task`s.
//
// `run` drives one task through its three phases:
//
//   1. pick the device from the task's requirement and the attached GPU
//   2. before_processing                          (caller thread)
//   3. process on N workers, worker 0 on the caller thread,
//      workers 1..N on scoped threads
//   4. after_processing, even if a worker failed  (caller thread)
//
// Workers are scoped threads, so a task can be borrowed rather than moved
// into the pool, and every worker is joined before `after_processing`.
// A panic inside `process` is caught and reported as `WorkerPanicked`; the
// other workers are released from any barrier and the locks still unwind.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::PoolConfig;
use crate::error::{Error, Result};
use crate::lock::PixelTransfer;
use crate::task::{Device, DeviceRequirement, Rendezvous, Task, WorkerContext};

/// Cloneable handle that aborts the pool's current run from any thread.
#[derive(Debug, Clone, Default)]
pub struct AbortHandle(Arc<AtomicBool>);

impl AbortHandle {
    /// Ask running workers to stop at their next abort poll.
    pub fn abort(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    fn reset(&self) {
        self.0.store(false, Ordering::Relaxed);
    }
}

/// A fixed number of workers plus an optional GPU transfer pipeline.
pub struct ThreadPool {
    workers: usize,
    gpu: Option<Arc<dyn PixelTransfer>>,
    abort: AbortHandle,
}

impl ThreadPool {
    /// Pool of `workers` workers (at least one).
    pub fn new(workers: usize) -> Self {
        ThreadPool { workers: workers.max(1), gpu: None, abort: AbortHandle::default() }
    }

    /// Pool sized from configuration; `workers = None` uses the available
    /// parallelism.
    pub fn from_config(cfg: &PoolConfig) -> Self {
        let workers = cfg
            .workers
            .unwrap_or_else(|| std::thread::available_parallelism().map_or(1, |n| n.get()));
        Self::new(workers)
    }

    /// Attach a GPU pipeline. Tasks accepting the GPU will run there.
    pub fn with_gpu(mut self, gpu: Arc<dyn PixelTransfer>) -> Self {
        self.gpu = Some(gpu);
        self
    }

    pub fn set_gpu(&mut self, gpu: Option<Arc<dyn PixelTransfer>>) {
        self.gpu = gpu;
    }

    pub fn has_gpu(&self) -> bool {
        self.gpu.is_some()
    }

    pub fn worker_count(&self) -> usize {
        self.workers
    }

    /// Handle for aborting runs. The flag is cleared when a run starts, so
    /// an abort only affects the run in progress.
    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    /// Device a task with `requirement` would run on.
    pub fn select_device(&self, requirement: DeviceRequirement) -> Result<Device> {
        match requirement {
            DeviceRequirement::CpuOnly => Ok(Device::Cpu),
            DeviceRequirement::GpuOnly if self.gpu.is_some() => Ok(Device::Gpu),
            DeviceRequirement::GpuOnly => Err(Error::GpuRequired),
            DeviceRequirement::CpuOrGpu if self.gpu.is_some() => Ok(Device::Gpu),
            DeviceRequirement::CpuOrGpu => Ok(Device::Cpu),
        }
    }

    /// Run `task` to completion.
    ///
    /// Returns the `before_processing` error if setup fails (nothing else
    /// runs), else the first worker error in worker order, else the
    /// `after_processing` result.
    pub fn run<T: Task + ?Sized>(&self, task: &mut T) -> Result<()> {
        let device = self.select_device(task.device_requirement())?;
        let workers = self.workers.min(task.max_workers()).max(1);
        self.abort.reset();

        debug!(workers, ?device, "task starting");
        task.before_processing(workers, device, self.gpu.clone())?;

        let result = self.execute(&*task, workers);
        let aborted = result.is_err() || self.abort.is_aborted();
        if aborted {
            warn!(workers, ?device, "task aborted");
        }

        let after = task.after_processing(workers, device, aborted);
        debug!(workers, ?device, ok = result.is_ok() && after.is_ok(), "task finished");
        result.and(after)
    }

    fn execute<T: Task + ?Sized>(&self, task: &T, workers: usize) -> Result<()> {
        let rendezvous = Rendezvous::new(workers);
        let abort: &AtomicBool = &self.abort.0;

        let results: Vec<Result<()>> = std::thread::scope(|s| {
            let rendezvous = &rendezvous;
            let handles: Vec<_> = (1..workers)
                .map(|index| s.spawn(move || run_worker(task, index, workers, abort, rendezvous)))
                .collect();

            let mut results = Vec::with_capacity(workers);
            results.push(run_worker(task, 0, workers, abort, rendezvous));
            for (i, handle) in handles.into_iter().enumerate() {
                // run_worker catches panics from `process`; this only
                // fires if the bookkeeping around it panicked.
                results.push(handle.join().unwrap_or(Err(Error::WorkerPanicked { worker: i + 1 })));
            }
            results
        });

        let mut secondary = None;
        for r in results {
            match r {
                Ok(()) => {}
                Err(Error::AnotherWorkerFailed) => secondary = Some(Error::AnotherWorkerFailed),
                Err(e) => return Err(e),
            }
        }
        secondary.map_or(Ok(()), Err)
    }
}

fn run_worker<T: Task + ?Sized>(
    task: &T,
    index: usize,
    workers: usize,
    abort: &AtomicBool,
    rendezvous: &Rendezvous,
) -> Result<()> {
    let ctx = WorkerContext::new(index, workers, abort, rendezvous);
    let result = match catch_unwind(AssertUnwindSafe(|| task.process(&ctx))) {
        Ok(r) => r,
        Err(_) => Err(Error::WorkerPanicked { worker: index }),
    };
    if let Err(e) = &result {
        if !matches!(e, Error::AnotherWorkerFailed) {
            warn!(worker = index, error = %e, "worker failed");
        }
        rendezvous.fail();
    }
    rendezvous.finish();
    result
}
