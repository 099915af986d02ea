// tests/test_pool.rs - ThreadPool phase ordering, barriers and failure paths.
//
// The tasks here are small probes that record what the pool did to them.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use floodmask::{
    Bitmap, Device, DeviceRequirement, Error, PixelTransfer, Task, ThreadPool, WorkerContext,
};

/// Records phases, worker indices and the arguments the pool passed.
#[derive(Default)]
struct Probe {
    events: Mutex<Vec<String>>,
    processed: AtomicUsize,
    requirement: DeviceRequirement,
    max_workers: Option<usize>,
    fail_worker: Option<usize>,
    panic_worker: Option<usize>,
    fail_setup: bool,
    seen_workers: usize,
    seen_device: Option<Device>,
    seen_gpu: bool,
    seen_aborted: Option<bool>,
}

impl Task for Probe {
    fn before_processing(
        &mut self,
        workers: usize,
        device: Device,
        gpu: Option<Arc<dyn PixelTransfer>>,
    ) -> floodmask::Result<()> {
        self.events.lock().push("before".into());
        if self.fail_setup {
            return Err(Error::NoSeeds);
        }
        self.seen_workers = workers;
        self.seen_device = Some(device);
        self.seen_gpu = gpu.is_some();
        Ok(())
    }

    fn process(&self, ctx: &WorkerContext<'_>) -> floodmask::Result<()> {
        if self.panic_worker == Some(ctx.index()) {
            panic!("probe panic in worker {}", ctx.index());
        }
        if self.fail_worker == Some(ctx.index()) {
            return Err(Error::BadChannel { channel: 9, channels: 1 });
        }
        self.processed.fetch_add(1, Ordering::SeqCst);
        self.events.lock().push(format!("process {}", ctx.index()));
        Ok(())
    }

    fn after_processing(&mut self, _workers: usize, _device: Device, aborted: bool) -> floodmask::Result<()> {
        self.events.lock().push("after".into());
        self.seen_aborted = Some(aborted);
        Ok(())
    }

    fn max_workers(&self) -> usize {
        self.max_workers.unwrap_or(usize::MAX)
    }

    fn device_requirement(&self) -> DeviceRequirement {
        self.requirement
    }
}

struct NullTransfer;

impl PixelTransfer for NullTransfer {
    fn push_pixels(&self, _bitmap: &Bitmap) -> floodmask::Result<()> {
        Ok(())
    }

    fn pull_pixels(&self, _bitmap: &Bitmap) -> floodmask::Result<()> {
        Ok(())
    }
}

// ===== Phases =====

#[test]
fn pool_runs_phases_in_order() {
    let mut task = Probe::default();
    ThreadPool::new(4).run(&mut task).unwrap();

    let events = task.events.lock().clone();
    assert_eq!(events.first().map(String::as_str), Some("before"));
    assert_eq!(events.last().map(String::as_str), Some("after"));
    let mut workers: Vec<&str> = events[1..events.len() - 1].iter().map(String::as_str).collect();
    workers.sort_unstable();
    assert_eq!(workers, vec!["process 0", "process 1", "process 2", "process 3"]);
    assert_eq!(task.seen_workers, 4);
    assert_eq!(task.seen_device, Some(Device::Cpu));
    assert!(!task.seen_gpu);
    assert_eq!(task.seen_aborted, Some(false));
}

#[test]
fn pool_clamps_to_max_workers() {
    let mut task = Probe { max_workers: Some(2), ..Default::default() };
    ThreadPool::new(8).run(&mut task).unwrap();
    assert_eq!(task.seen_workers, 2);
    assert_eq!(task.processed.load(Ordering::SeqCst), 2);

    let mut task = Probe { max_workers: Some(0), ..Default::default() };
    ThreadPool::new(8).run(&mut task).unwrap();
    assert_eq!(task.seen_workers, 1);
}

#[test]
fn pool_setup_error_runs_nothing() {
    let mut task = Probe { fail_setup: true, ..Default::default() };
    assert!(matches!(ThreadPool::new(3).run(&mut task), Err(Error::NoSeeds)));
    assert_eq!(*task.events.lock(), vec!["before".to_string()]);
    assert_eq!(task.processed.load(Ordering::SeqCst), 0);
}

// ===== Failures =====

#[test]
fn pool_worker_error_still_runs_after_processing() {
    let mut task = Probe { fail_worker: Some(1), ..Default::default() };
    let err = ThreadPool::new(3).run(&mut task).unwrap_err();
    assert!(matches!(err, Error::BadChannel { channel: 9, .. }));
    assert_eq!(task.events.lock().last().map(String::as_str), Some("after"));
    assert_eq!(task.seen_aborted, Some(true));
}

#[test]
fn pool_worker_panic_is_reported() {
    let mut task = Probe { panic_worker: Some(2), ..Default::default() };
    let err = ThreadPool::new(3).run(&mut task).unwrap_err();
    assert!(matches!(err, Error::WorkerPanicked { worker: 2 }));
    assert_eq!(task.seen_aborted, Some(true));
}

#[test]
fn pool_managing_worker_panic_is_reported() {
    let mut task = Probe { panic_worker: Some(0), ..Default::default() };
    let err = ThreadPool::new(2).run(&mut task).unwrap_err();
    assert!(matches!(err, Error::WorkerPanicked { worker: 0 }));
}

// ===== Devices =====

#[test]
fn pool_gpu_only_without_gpu() {
    let mut task = Probe { requirement: DeviceRequirement::GpuOnly, ..Default::default() };
    assert!(matches!(ThreadPool::new(2).run(&mut task), Err(Error::GpuRequired)));
    assert!(task.events.lock().is_empty());
}

#[test]
fn pool_cpu_or_gpu_prefers_attached_gpu() {
    let pool = ThreadPool::new(2).with_gpu(Arc::new(NullTransfer));
    assert!(pool.has_gpu());

    let mut task = Probe { requirement: DeviceRequirement::CpuOrGpu, ..Default::default() };
    pool.run(&mut task).unwrap();
    assert_eq!(task.seen_device, Some(Device::Gpu));
    assert!(task.seen_gpu);

    // CPU-only tasks still see the pipeline, for stale-copy pulls.
    let mut task = Probe::default();
    pool.run(&mut task).unwrap();
    assert_eq!(task.seen_device, Some(Device::Cpu));
    assert!(task.seen_gpu);
}

// ===== Barrier =====

/// Every worker bumps a counter, meets the others, then checks the count.
struct Meeting {
    arrived: AtomicUsize,
    checked: AtomicUsize,
    /// Worker that returns before the barrier.
    leaver: Option<usize>,
}

impl Task for Meeting {
    fn before_processing(
        &mut self,
        _workers: usize,
        _device: Device,
        _gpu: Option<Arc<dyn PixelTransfer>>,
    ) -> floodmask::Result<()> {
        Ok(())
    }

    fn process(&self, ctx: &WorkerContext<'_>) -> floodmask::Result<()> {
        if self.leaver == Some(ctx.index()) {
            return Ok(());
        }
        self.arrived.fetch_add(1, Ordering::SeqCst);
        ctx.synchronize()?;
        let expected = ctx.worker_count() - self.leaver.map_or(0, |_| 1);
        assert_eq!(self.arrived.load(Ordering::SeqCst), expected);
        ctx.synchronize()?;
        self.checked.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn after_processing(&mut self, _workers: usize, _device: Device, _aborted: bool) -> floodmask::Result<()> {
        Ok(())
    }
}

#[test]
fn pool_barrier_waits_for_all_workers() {
    for workers in [1, 2, 5] {
        let mut task = Meeting { arrived: AtomicUsize::new(0), checked: AtomicUsize::new(0), leaver: None };
        ThreadPool::new(workers).run(&mut task).unwrap();
        assert_eq!(task.checked.load(Ordering::SeqCst), workers);
    }
}

#[test]
fn pool_barrier_tolerates_early_return() {
    let mut task = Meeting { arrived: AtomicUsize::new(0), checked: AtomicUsize::new(0), leaver: Some(1) };
    ThreadPool::new(4).run(&mut task).unwrap();
    assert_eq!(task.checked.load(Ordering::SeqCst), 3);
}

/// One worker fails while the others wait at a barrier.
struct FailAtBarrier;

impl Task for FailAtBarrier {
    fn before_processing(
        &mut self,
        _workers: usize,
        _device: Device,
        _gpu: Option<Arc<dyn PixelTransfer>>,
    ) -> floodmask::Result<()> {
        Ok(())
    }

    fn process(&self, ctx: &WorkerContext<'_>) -> floodmask::Result<()> {
        if ctx.index() == 2 {
            return Err(Error::NotPrepared("probe"));
        }
        ctx.synchronize()
    }

    fn after_processing(&mut self, _workers: usize, _device: Device, aborted: bool) -> floodmask::Result<()> {
        assert!(aborted);
        Ok(())
    }
}

#[test]
fn pool_failure_releases_barrier_waiters() {
    let err = ThreadPool::new(4).run(&mut FailAtBarrier).unwrap_err();
    // The original failure wins over the waiters' AnotherWorkerFailed.
    assert!(matches!(err, Error::NotPrepared("probe")));
}

// ===== Abort =====

struct Spin;

impl Task for Spin {
    fn before_processing(
        &mut self,
        _workers: usize,
        _device: Device,
        _gpu: Option<Arc<dyn PixelTransfer>>,
    ) -> floodmask::Result<()> {
        Ok(())
    }

    fn process(&self, ctx: &WorkerContext<'_>) -> floodmask::Result<()> {
        while !ctx.is_aborted() {
            std::thread::yield_now();
        }
        Ok(())
    }

    fn after_processing(&mut self, _workers: usize, _device: Device, aborted: bool) -> floodmask::Result<()> {
        assert!(aborted);
        Ok(())
    }
}

#[test]
fn pool_abort_handle_stops_run() {
    let pool = ThreadPool::new(3);
    let handle = pool.abort_handle();
    let finished = AtomicBool::new(false);
    std::thread::scope(|s| {
        s.spawn(|| {
            // `run` clears the flag when it starts, so keep raising it until
            // the run is over.
            while !finished.load(Ordering::SeqCst) {
                std::thread::sleep(std::time::Duration::from_millis(2));
                handle.abort();
            }
        });
        let result = pool.run(&mut Spin);
        finished.store(true, Ordering::SeqCst);
        result.unwrap();
    });
}
