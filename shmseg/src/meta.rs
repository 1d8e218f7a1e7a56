//! The shared metadata header embedded at the start of every segment.
//!
//! One [`SegmentMeta`] lives at offset 0 of the backing object and is
//! mutated concurrently by every attached process through its own mapping.
//! It is never constructed or dropped as a Rust object in shared memory:
//! the creator initializes the fields in place through a reinterpreted
//! pointer, and everyone else reads and writes them atomically.

use std::mem::size_of;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// The segment is live; operations proceed normally.
pub(crate) const STATUS_LIVE: usize = 0;
/// The segment has been deleted, either by its last owner or by an explicit
/// `unlink()`. Monotonic: never reverts to live.
pub(crate) const STATUS_DELETED: usize = 1;

/// Bytes the header occupies at the start of the backing object.
pub(crate) const META_SIZE: usize = size_of::<SegmentMeta>();

/// Fixed-layout control record shared by all attached processes.
///
/// All fields use atomic storage: `status` and `ref_count` are genuinely
/// concurrent, and `payload_size` is written once by the creator before any
/// attacher can observe it, but atomic loads keep the cross-process reads
/// race-free.
#[repr(C)]
pub(crate) struct SegmentMeta {
    status: AtomicUsize,
    ref_count: AtomicUsize,
    payload_size: AtomicU64,
}

impl SegmentMeta {
    /// Initializes a freshly created header in place: one reference (the
    /// creator's), live status, and the requested payload size.
    pub(crate) fn init(&self, payload_size: u64) {
        self.payload_size.store(payload_size, Ordering::Relaxed);
        self.ref_count.store(1, Ordering::Relaxed);
        self.status.store(STATUS_LIVE, Ordering::Release);
    }

    pub(crate) fn is_deleted(&self) -> bool {
        self.status.load(Ordering::Acquire) == STATUS_DELETED
    }

    pub(crate) fn mark_deleted(&self) {
        self.status.store(STATUS_DELETED, Ordering::Release);
    }

    /// Takes a reference on behalf of an attaching handle.
    ///
    /// Refuses to move the count off zero: a zero count means a last owner
    /// is mid-teardown, and incrementing would hand the attacher a segment
    /// whose name is about to vanish. The CAS loop makes the check and the
    /// increment one atomic step.
    pub(crate) fn try_retain(&self) -> bool {
        let mut current = self.ref_count.load(Ordering::Acquire);
        loop {
            if current == 0 {
                return false;
            }
            match self.ref_count.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Drops one reference and returns the count *before* the decrement.
    ///
    /// Exactly one releasing handle observes 1: that handle is the unique
    /// last owner and must mark the segment deleted and remove the name.
    /// Pairing the single `fetch_sub` with [`try_retain`](Self::try_retain)
    /// refusing zero closes the delete/attach race without any wider lock.
    pub(crate) fn release(&self) -> usize {
        self.ref_count.fetch_sub(1, Ordering::AcqRel)
    }

    pub(crate) fn ref_count(&self) -> usize {
        self.ref_count.load(Ordering::Acquire)
    }

    pub(crate) fn payload_size(&self) -> u64 {
        self.payload_size.load(Ordering::Acquire)
    }

    #[cfg(test)]
    fn new_for_tests(payload_size: u64) -> Self {
        Self {
            status: AtomicUsize::new(STATUS_LIVE),
            ref_count: AtomicUsize::new(1),
            payload_size: AtomicU64::new(payload_size),
        }
    }
}
