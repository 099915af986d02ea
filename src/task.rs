// task.rs - Three-phase task contract and the per-worker context.
//
// A task runs as:
//
//   before_processing   caller thread, once     validate, take content locks
//   process             every worker, parallel  the actual work
//   after_processing    caller thread, once     publish results, release locks
//
// `after_processing` runs whenever `before_processing` succeeded, including
// when a worker failed, panicked or the run was aborted.
//
// BARRIER
// ───────
// `WorkerContext::synchronize` is a counting barrier that tolerates workers
// leaving early. Three counters under one mutex:
//
//   hits       total synchronize() calls so far
//   bound      value of `hits` when the last barrier completed
//   remaining  workers that have not returned from `process`
//
// A barrier generation completes when `hits == bound + remaining`. A worker
// that returns from `process` without reaching the barrier lowers
// `remaining`, which can complete a generation the others are waiting on.
// A failed worker sets `failed`; every waiter wakes with
// `AnotherWorkerFailed` so nobody blocks on a peer that will never arrive.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::error::{Error, Result};
use crate::lock::PixelTransfer;

/// Where a task body executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Device {
    Cpu,
    Gpu,
}

impl Device {
    pub fn other(self) -> Device {
        match self {
            Device::Cpu => Device::Gpu,
            Device::Gpu => Device::Cpu,
        }
    }
}

/// Devices a task accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceRequirement {
    #[default]
    CpuOnly,
    GpuOnly,
    /// Run on the GPU when the pool has one, else on the CPU.
    CpuOrGpu,
}

/// A unit of parallel work.
///
/// `process` takes `&self`: state that workers mutate concurrently must be
/// atomic or behind a lock. Setup and teardown get `&mut self`.
pub trait Task: Send + Sync {
    /// Validate inputs and acquire content locks.
    ///
    /// `gpu` is the pool's pixel transfer pipeline, if it has one. An error
    /// here ends the run before any worker starts; `after_processing` is not
    /// called, so release whatever was acquired before returning.
    fn before_processing(
        &mut self,
        workers: usize,
        device: Device,
        gpu: Option<Arc<dyn PixelTransfer>>,
    ) -> Result<()>;

    /// Body run by every worker.
    fn process(&self, ctx: &WorkerContext<'_>) -> Result<()>;

    /// Publish results and release locks. `aborted` is set when the run was
    /// aborted or any worker failed.
    fn after_processing(&mut self, workers: usize, device: Device, aborted: bool) -> Result<()>;

    /// Upper bound on useful workers.
    fn max_workers(&self) -> usize {
        usize::MAX
    }

    fn device_requirement(&self) -> DeviceRequirement {
        DeviceRequirement::CpuOnly
    }
}

// ---------------------------------------------------------------------------
// Barrier
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct BarrierState {
    hits: usize,
    bound: usize,
    remaining: usize,
}

/// Shared per-run synchronization state. Created by the pool.
#[derive(Debug)]
pub(crate) struct Rendezvous {
    state: Mutex<BarrierState>,
    cv: Condvar,
    failed: AtomicBool,
}

impl Rendezvous {
    pub(crate) fn new(workers: usize) -> Self {
        Rendezvous {
            state: Mutex::new(BarrierState { hits: 0, bound: 0, remaining: workers }),
            cv: Condvar::new(),
            failed: AtomicBool::new(false),
        }
    }

    fn wait(&self) -> Result<()> {
        let mut s = self.state.lock();
        if self.failed.load(Ordering::Acquire) {
            return Err(Error::AnotherWorkerFailed);
        }
        let my_bound = s.bound;
        s.hits += 1;
        if s.hits == s.bound + s.remaining {
            s.bound = s.hits;
            self.cv.notify_all();
            return Ok(());
        }
        while !self.failed.load(Ordering::Acquire) && my_bound + s.remaining > s.hits {
            self.cv.wait(&mut s);
        }
        if self.failed.load(Ordering::Acquire) {
            return Err(Error::AnotherWorkerFailed);
        }
        Ok(())
    }

    /// A worker returned from `process`.
    pub(crate) fn finish(&self) {
        let mut s = self.state.lock();
        s.remaining -= 1;
        if s.hits > s.bound && s.hits == s.bound + s.remaining {
            s.bound = s.hits;
        }
        self.cv.notify_all();
    }

    /// A worker failed: wake everybody.
    pub(crate) fn fail(&self) {
        let _s = self.state.lock();
        self.failed.store(true, Ordering::Release);
        self.cv.notify_all();
    }

    pub(crate) fn has_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }
}

// ---------------------------------------------------------------------------
// WorkerContext
// ---------------------------------------------------------------------------

/// What a worker knows about its run.
pub struct WorkerContext<'a> {
    index: usize,
    worker_count: usize,
    abort: &'a AtomicBool,
    rendezvous: &'a Rendezvous,
}

impl<'a> WorkerContext<'a> {
    pub(crate) fn new(index: usize, worker_count: usize, abort: &'a AtomicBool, rendezvous: &'a Rendezvous) -> Self {
        WorkerContext { index, worker_count, abort, rendezvous }
    }

    /// Index of this worker, `0..worker_count()`.
    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    #[inline]
    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Worker 0 runs on the thread that called `ThreadPool::run`.
    #[inline]
    pub fn is_managing(&self) -> bool {
        self.index == 0
    }

    /// Poll at iteration granularity; return early when set.
    #[inline]
    pub fn is_aborted(&self) -> bool {
        self.abort.load(Ordering::Relaxed) || self.rendezvous.has_failed()
    }

    /// Block until every still-running worker reaches a `synchronize` call.
    ///
    /// Returns `AnotherWorkerFailed` if a peer failed before or during the
    /// wait; the caller should return that error.
    pub fn synchronize(&self) -> Result<()> {
        self.rendezvous.wait()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn run_workers<F>(n: usize, body: F) -> Vec<Result<()>>
    where
        F: Fn(&WorkerContext<'_>) -> Result<()> + Sync,
    {
        let abort = AtomicBool::new(false);
        let rv = Rendezvous::new(n);
        std::thread::scope(|s| {
            let handles: Vec<_> = (0..n)
                .map(|i| {
                    let (abort, rv, body) = (&abort, &rv, &body);
                    s.spawn(move || {
                        let ctx = WorkerContext::new(i, n, abort, rv);
                        let r = body(&ctx);
                        if r.is_err() {
                            rv.fail();
                        }
                        rv.finish();
                        r
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        })
    }

    #[test]
    fn test_barrier_orders_phases() {
        let before = AtomicUsize::new(0);
        let results = run_workers(4, |ctx| {
            before.fetch_add(1, Ordering::SeqCst);
            ctx.synchronize()?;
            assert_eq!(before.load(Ordering::SeqCst), 4);
            ctx.synchronize()?;
            ctx.synchronize()
        });
        assert!(results.iter().all(|r| r.is_ok()));
    }

    #[test]
    fn test_barrier_tolerates_early_exit() {
        // Worker 3 never synchronizes; the others must not deadlock.
        let results = run_workers(4, |ctx| {
            if ctx.index() == 3 {
                return Ok(());
            }
            ctx.synchronize()?;
            ctx.synchronize()
        });
        assert!(results.iter().all(|r| r.is_ok()));
    }

    #[test]
    fn test_failure_releases_waiters() {
        let results = run_workers(3, |ctx| {
            if ctx.index() == 1 {
                return Err(Error::NoSeeds);
            }
            ctx.synchronize()
        });
        assert!(matches!(results[1], Err(Error::NoSeeds)));
        for i in [0, 2] {
            assert!(matches!(results[i], Err(Error::AnotherWorkerFailed)));
        }
    }

    #[test]
    fn test_single_worker_never_blocks() {
        let results = run_workers(1, |ctx| {
            assert!(ctx.is_managing());
            ctx.synchronize()?;
            ctx.synchronize()
        });
        assert!(results[0].is_ok());
    }

    #[test]
    fn test_device_other() {
        assert_eq!(Device::Cpu.other(), Device::Gpu);
        assert_eq!(Device::Gpu.other(), Device::Cpu);
    }
}
