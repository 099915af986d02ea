// lock.rs - Reference-counted content locks over shared bitmaps.
//
// A task declares, per bitmap, whether it will read or write it and on which
// device. The lock keeps one descriptor per locked bitmap:
//
//   { read, write, on_cpu, on_gpu, pinned, ref_count }
//
// and enforces:
//
//   request    held                                  outcome
//   ───────    ────                                  ───────
//   read  D    nothing                               new descriptor
//   read  D    read (any device)                     shared, D added
//   read  D    write on D                            shared (write-then-read)
//   read  D    write on the other device             LockConflict
//   write D    nothing                               new descriptor
//   write D    write on D only                       shared
//   write D    read, or write on the other device    LockConflict
//
// Acquiring on a device whose copy is stale runs a transfer first (push
// CPU→GPU, pull GPU→CPU) through the `PixelTransfer` the lock was given.
// When the count of a descriptor drops to zero the bitmap is unpinned and,
// if it was written, the written devices become the only current copies.
//
// Descriptors live in a slot arena: a released slot is reused by the next
// acquisition, so a long-lived task does not allocate per run.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::bitmap::{Bitmap, Residency, ResourceId};
use crate::error::{Error, Result};
use crate::task::Device;

/// Moves pixel bytes between a bitmap's CPU and GPU copies.
///
/// Called with the bitmap's residency mutex held by the content lock:
/// implementations must not query or change residency themselves.
pub trait PixelTransfer: Send + Sync {
    /// Make the GPU copy equal to the CPU bytes.
    fn push_pixels(&self, bitmap: &Bitmap) -> Result<()>;

    /// Make the CPU bytes equal to the GPU copy.
    fn pull_pixels(&self, bitmap: &Bitmap) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    Read,
    Write,
}

/// Lock state of one bitmap.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LockDescriptor {
    pub read: bool,
    pub write: bool,
    pub on_cpu: bool,
    pub on_gpu: bool,
    pub pinned: bool,
    pub ref_count: usize,
}

impl LockDescriptor {
    #[inline]
    fn on(&self, device: Device) -> bool {
        match device {
            Device::Cpu => self.on_cpu,
            Device::Gpu => self.on_gpu,
        }
    }

    #[inline]
    fn add_device(&mut self, device: Device) {
        match device {
            Device::Cpu => self.on_cpu = true,
            Device::Gpu => self.on_gpu = true,
        }
    }
}

impl fmt::Display for LockDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match (self.read, self.write) {
            (true, true) => "read+write",
            (false, true) => "write",
            _ => "read",
        };
        let dev = match (self.on_cpu, self.on_gpu) {
            (true, true) => "cpu+gpu",
            (false, true) => "gpu",
            _ => "cpu",
        };
        write!(f, "{kind} on {dev} (refs {})", self.ref_count)
    }
}

struct LockSlot {
    bitmap: Arc<Bitmap>,
    desc: LockDescriptor,
}

/// Content locks held by one task.
#[derive(Default)]
pub struct ContentLock {
    slots: Vec<Option<LockSlot>>,
    transfer: Option<Arc<dyn PixelTransfer>>,
}

impl ContentLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_transfer(transfer: Arc<dyn PixelTransfer>) -> Self {
        ContentLock { slots: Vec::new(), transfer: Some(transfer) }
    }

    /// Replace the transfer pipeline used for stale copies.
    pub fn set_transfer(&mut self, transfer: Option<Arc<dyn PixelTransfer>>) {
        self.transfer = transfer;
    }

    // -----------------------------------------------------------------------
    // Acquisition
    // -----------------------------------------------------------------------

    pub fn read_lock(&mut self, bitmap: &Arc<Bitmap>, device: Device) -> Result<()> {
        let Some(idx) = self.find(bitmap.id()) else {
            let transferred = self.make_current(bitmap, device)?;
            let pinned = device == Device::Cpu || transferred;
            if pinned {
                bitmap.pin();
            }
            let mut desc = LockDescriptor { read: true, pinned, ref_count: 1, ..Default::default() };
            desc.add_device(device);
            self.insert(bitmap, desc);
            debug!(bitmap = %bitmap.id(), ?device, "read lock acquired");
            return Ok(());
        };

        let desc = self.desc(idx);
        if desc.write && !desc.on(device) {
            return Err(conflict(bitmap.id(), &desc, LockKind::Read, device));
        }
        let transferred = if desc.on(device) { false } else { self.make_current(bitmap, device)? };

        let desc = self.desc_mut(idx, bitmap.id())?;
        desc.add_device(device);
        if (device == Device::Cpu || transferred) && !desc.pinned {
            desc.pinned = true;
            bitmap.pin();
        }
        desc.read = true;
        desc.ref_count += 1;
        debug!(bitmap = %bitmap.id(), ?device, refs = desc.ref_count, "read lock shared");
        Ok(())
    }

    /// Lock for writing. The copy on `device` is made current first, so
    /// writers may combine with existing content.
    pub fn write_lock(&mut self, bitmap: &Arc<Bitmap>, device: Device) -> Result<()> {
        let Some(idx) = self.find(bitmap.id()) else {
            self.make_current(bitmap, device)?;
            let pinned = device == Device::Cpu;
            if pinned {
                bitmap.pin();
            }
            let mut desc = LockDescriptor { write: true, pinned, ref_count: 1, ..Default::default() };
            desc.add_device(device);
            self.insert(bitmap, desc);
            debug!(bitmap = %bitmap.id(), ?device, "write lock acquired");
            return Ok(());
        };

        let desc = self.desc(idx);
        if !desc.write || desc.read || !desc.on(device) || desc.on(device.other()) {
            return Err(conflict(bitmap.id(), &desc, LockKind::Write, device));
        }
        let desc = self.desc_mut(idx, bitmap.id())?;
        desc.ref_count += 1;
        debug!(bitmap = %bitmap.id(), ?device, refs = desc.ref_count, "write lock shared");
        Ok(())
    }

    /// Acquire write locks then read locks on `device`. On failure, locks
    /// taken by this call are released again.
    pub fn lock_all(&mut self, read: &[&Arc<Bitmap>], write: &[&Arc<Bitmap>], device: Device) -> Result<()> {
        let mut taken: Vec<&Arc<Bitmap>> = Vec::with_capacity(read.len() + write.len());
        let requests = write
            .iter()
            .map(|b| (*b, LockKind::Write))
            .chain(read.iter().map(|b| (*b, LockKind::Read)));
        for (bitmap, kind) in requests {
            let r = match kind {
                LockKind::Read => self.read_lock(bitmap, device),
                LockKind::Write => self.write_lock(bitmap, device),
            };
            if let Err(e) = r {
                for b in taken.into_iter().rev() {
                    // Each was locked just above; unlocking cannot miss.
                    let _ = self.unlock(b);
                }
                return Err(e);
            }
            taken.push(bitmap);
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Release
    // -----------------------------------------------------------------------

    /// Drop one reference. The last one finalizes residency and frees the
    /// slot.
    pub fn unlock(&mut self, bitmap: &Bitmap) -> Result<()> {
        let idx = self.find(bitmap.id()).ok_or(Error::NotLocked { resource: bitmap.id() })?;
        let desc = self.desc_mut(idx, bitmap.id())?;
        desc.ref_count -= 1;
        if desc.ref_count > 0 {
            debug!(bitmap = %bitmap.id(), refs = desc.ref_count, "lock reference dropped");
            return Ok(());
        }
        if let Some(slot) = self.slots[idx].take() {
            release(&slot);
        }
        Ok(())
    }

    /// Release every lock regardless of reference counts.
    pub fn unlock_all(&mut self) {
        for slot in self.slots.iter_mut() {
            if let Some(slot) = slot.take() {
                release(&slot);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn is_locked(&self, bitmap: &Bitmap) -> bool {
        self.find(bitmap.id()).is_some()
    }

    pub fn descriptor(&self, bitmap: &Bitmap) -> Option<LockDescriptor> {
        self.find(bitmap.id()).map(|idx| self.desc(idx))
    }

    /// 0 when not locked.
    pub fn ref_count(&self, bitmap: &Bitmap) -> usize {
        self.descriptor(bitmap).map_or(0, |d| d.ref_count)
    }

    /// Number of locked bitmaps.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn find(&self, id: ResourceId) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.as_ref().is_some_and(|s| s.bitmap.id() == id))
    }

    fn insert(&mut self, bitmap: &Arc<Bitmap>, desc: LockDescriptor) {
        let slot = LockSlot { bitmap: Arc::clone(bitmap), desc };
        match self.slots.iter_mut().find(|s| s.is_none()) {
            Some(free) => *free = Some(slot),
            None => self.slots.push(Some(slot)),
        }
    }

    fn desc(&self, idx: usize) -> LockDescriptor {
        self.slots[idx].as_ref().map(|s| s.desc).unwrap_or_default()
    }

    fn desc_mut(&mut self, idx: usize, resource: ResourceId) -> Result<&mut LockDescriptor> {
        self.slots[idx]
            .as_mut()
            .map(|s| &mut s.desc)
            .ok_or(Error::NotLocked { resource })
    }

    /// Transfer to `device` if its copy is stale. Returns whether a transfer
    /// ran.
    fn make_current(&self, bitmap: &Bitmap, device: Device) -> Result<bool> {
        let mut residency = bitmap.residency_guard();
        if residency.is_up_to_date(device) {
            return Ok(false);
        }
        let transfer = self.transfer.as_ref().ok_or(Error::NoPipeline { resource: bitmap.id() })?;
        match device {
            Device::Gpu => transfer.push_pixels(bitmap)?,
            Device::Cpu => transfer.pull_pixels(bitmap)?,
        }
        residency.mark_up_to_date(device);
        info!(bitmap = %bitmap.id(), to = ?device, "pixels transferred");
        Ok(true)
    }
}

fn release(slot: &LockSlot) {
    let desc = slot.desc;
    if desc.pinned {
        slot.bitmap.unpin();
    }
    if desc.write {
        *slot.bitmap.residency_guard() = Residency { cpu: desc.on_cpu, gpu: desc.on_gpu };
    }
    debug!(bitmap = %slot.bitmap.id(), %desc, "lock released");
}

fn conflict(resource: ResourceId, held: &LockDescriptor, requested: LockKind, device: Device) -> Error {
    Error::LockConflict { resource, held: held.to_string(), requested, device }
}

impl Drop for ContentLock {
    fn drop(&mut self) {
        if !self.is_empty() {
            warn!(held = self.len(), "content lock dropped while holding locks; releasing");
            self.unlock_all();
        }
    }
}

impl fmt::Debug for ContentLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.slots.iter().flatten().map(|s| (s.bitmap.id(), s.desc)))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitmap::PixelFormat;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        log: Mutex<Vec<(ResourceId, Device)>>,
    }

    impl PixelTransfer for Recorder {
        fn push_pixels(&self, bitmap: &Bitmap) -> Result<()> {
            self.log.lock().push((bitmap.id(), Device::Gpu));
            Ok(())
        }

        fn pull_pixels(&self, bitmap: &Bitmap) -> Result<()> {
            self.log.lock().push((bitmap.id(), Device::Cpu));
            Ok(())
        }
    }

    fn bitmap() -> Arc<Bitmap> {
        Arc::new(Bitmap::new(PixelFormat::Gray8, 4, 4))
    }

    #[test]
    fn test_read_locks_share() {
        let b = bitmap();
        let mut lock = ContentLock::new();
        lock.read_lock(&b, Device::Cpu).unwrap();
        lock.read_lock(&b, Device::Cpu).unwrap();
        assert_eq!(lock.ref_count(&b), 2);
        assert!(b.is_pinned());
        lock.unlock(&b).unwrap();
        assert!(lock.is_locked(&b));
        lock.unlock(&b).unwrap();
        assert!(!lock.is_locked(&b));
        assert!(!b.is_pinned());
    }

    #[test]
    fn test_write_then_read_same_device() {
        let b = bitmap();
        let mut lock = ContentLock::new();
        lock.write_lock(&b, Device::Cpu).unwrap();
        lock.read_lock(&b, Device::Cpu).unwrap();
        let d = lock.descriptor(&b).unwrap();
        assert!(d.read && d.write && d.on_cpu && !d.on_gpu);
        assert_eq!(d.ref_count, 2);
    }

    #[test]
    fn test_write_after_read_conflicts() {
        let b = bitmap();
        let mut lock = ContentLock::new();
        lock.read_lock(&b, Device::Cpu).unwrap();
        let err = lock.write_lock(&b, Device::Cpu).unwrap_err();
        assert!(matches!(err, Error::LockConflict { requested: LockKind::Write, .. }));
        // The failed request changed nothing.
        assert_eq!(lock.ref_count(&b), 1);
    }

    #[test]
    fn test_missing_pipeline() {
        let b = bitmap();
        let mut lock = ContentLock::new();
        assert!(matches!(lock.read_lock(&b, Device::Gpu), Err(Error::NoPipeline { .. })));
        assert!(!lock.is_locked(&b));
    }

    #[test]
    fn test_gpu_read_pushes_once() {
        let b = bitmap();
        let rec = Arc::new(Recorder::default());
        let mut lock = ContentLock::with_transfer(rec.clone());
        lock.read_lock(&b, Device::Gpu).unwrap();
        lock.read_lock(&b, Device::Gpu).unwrap();
        assert_eq!(rec.log.lock().as_slice(), &[(b.id(), Device::Gpu)]);
        assert_eq!(b.residency(), Residency { cpu: true, gpu: true });
        lock.unlock_all();
        assert!(lock.is_empty());
        assert!(!b.is_pinned());
    }

    #[test]
    fn test_slots_are_reused() {
        let (a, b) = (bitmap(), bitmap());
        let mut lock = ContentLock::new();
        lock.read_lock(&a, Device::Cpu).unwrap();
        lock.unlock(&a).unwrap();
        lock.read_lock(&b, Device::Cpu).unwrap();
        assert_eq!(lock.slots.len(), 1);
    }

    #[test]
    fn test_lock_all_rolls_back() {
        let (a, b) = (bitmap(), bitmap());
        let mut lock = ContentLock::new();
        lock.read_lock(&b, Device::Cpu).unwrap();
        // `a` is write-locked first, then `b` conflicts as a write target.
        let err = lock.lock_all(&[], &[&a, &b], Device::Cpu).unwrap_err();
        assert!(matches!(err, Error::LockConflict { .. }));
        assert!(!lock.is_locked(&a));
        assert_eq!(lock.ref_count(&b), 1);
    }

    #[test]
    fn test_drop_releases() {
        let b = bitmap();
        {
            let mut lock = ContentLock::new();
            lock.write_lock(&b, Device::Cpu).unwrap();
            assert!(b.is_pinned());
        }
        assert!(!b.is_pinned());
    }
}
