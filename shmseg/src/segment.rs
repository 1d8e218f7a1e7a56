//! The shared segment handle: creation, attach, lazy mapping, release.
//!
//! A [`Segment`] is a per-process, per-open handle. It owns exactly one
//! backend handle and, once [`map`](Segment::map) has been called, one
//! payload mapping. The segment itself (the named backing object and the
//! shared metadata header at its start) is shared by reference among every
//! attached handle in every process.
//!
//! # Lifecycle
//!
//! ```text
//! create(name, size)         attach(name)
//!       │                         │ fails NotFound / SegmentGone
//!       ▼                         ▼
//!   Segment (ref_count 1)     Segment (ref_count += 1)
//!       │  map()/unmap()          │  map()/unmap()
//!       ▼                         ▼
//!     drop ──────────────────── drop
//!       └── the handle that drops the count to zero marks the
//!           segment Deleted and removes the name
//! ```

use std::ptr::NonNull;

use crate::backend::ShmObject;
use crate::error::{Result, SegError};
use crate::meta::{SegmentMeta, META_SIZE};
use crate::name::SegName;
use crate::trace::{debug, warn};

/// Per-process handle to a named shared-memory segment.
///
/// Dropping the handle releases its reference; the unique handle that drops
/// the shared count to zero tears the segment down (marks it deleted and
/// removes the name from the OS namespace).
///
/// A handle belongs to one logical owner: every mutating operation takes
/// `&mut self`, so simultaneous `map`/`unmap`/release from two threads on
/// the same handle is rejected at compile time rather than guarded by an
/// internal lock.
#[derive(Debug)]
pub struct Segment {
    name: SegName,
    shm: ShmObject,
    header: NonNull<SegmentMeta>,
    /// Base of the payload mapping (covers header + payload). The address
    /// handed to callers points `META_SIZE` bytes past this.
    payload_base: Option<NonNull<u8>>,
}

// SAFETY: the raw pointers target shared mappings owned by this handle, not
// thread-local state; the shared header is only accessed atomically. The
// handle may move between threads, but &mut receivers keep its own state
// single-owner.
unsafe impl Send for Segment {}

impl Segment {
    /// Creates a new segment with a payload of `payload_size` bytes.
    ///
    /// Allocates a backing object of `payload_size` plus the metadata
    /// header, maps only the header, and initializes it: one reference
    /// (this handle's), live status, the requested size. The payload stays
    /// unmapped until [`map`](Self::map).
    ///
    /// # Errors
    ///
    /// - [`SegError::AlreadyExists`] if the name is taken; nothing is
    ///   touched or removed in that case.
    /// - Any failure after the object exists (resize, header map) removes
    ///   the just-created name before reporting, so a half-created segment
    ///   never leaks into the namespace.
    pub fn create(name: SegName, payload_size: u64) -> Result<Self> {
        let total_bytes = payload_size
            .checked_add(META_SIZE as u64)
            .ok_or_else(|| SegError::os("create", &name, std::io::ErrorKind::InvalidInput))?;

        let shm = ShmObject::create(&name, total_bytes)?;

        let raw = match shm.map(META_SIZE) {
            Ok(raw) => raw,
            Err(source) => {
                drop(shm);
                let _ = ShmObject::remove(&name);
                return Err(SegError::map_failed(&name, source));
            }
        };
        let Some(header) = NonNull::new(raw.cast::<SegmentMeta>()) else {
            drop(shm);
            let _ = ShmObject::remove(&name);
            return Err(SegError::InvalidMetadata);
        };

        let segment = Self {
            name,
            shm,
            header,
            payload_base: None,
        };
        segment.meta().init(payload_size);
        debug!(name = %segment.name, payload_size, "created segment");
        Ok(segment)
    }

    /// Attaches to an existing segment.
    ///
    /// Opens the backing object, maps its header, and only then validates
    /// liveness: a segment marked deleted, or one whose reference count
    /// already reached zero and is mid-teardown, fails with
    /// [`SegError::SegmentGone`] instead of being resurrected. On success
    /// the shared count is incremented atomically. The payload stays
    /// unmapped until [`map`](Self::map).
    ///
    /// # Errors
    ///
    /// [`SegError::NotFound`] if no segment has this name, and
    /// [`SegError::SegmentGone`] as above. Anything opened before a failure
    /// is unmapped and closed before the error returns.
    pub fn attach(name: SegName) -> Result<Self> {
        let shm = ShmObject::open(&name)?;

        let raw = match shm.map(META_SIZE) {
            Ok(raw) => raw,
            Err(source) => return Err(SegError::map_failed(&name, source)),
        };
        let Some(header) = NonNull::new(raw.cast::<SegmentMeta>()) else {
            return Err(SegError::InvalidMetadata);
        };

        // The existence check above is no proof of liveness: validate the
        // shared status strictly after mapping, and take the reference with
        // a CAS that refuses a zero count.
        let meta = unsafe { header.as_ref() };
        if meta.is_deleted() || !meta.try_retain() {
            // SAFETY: the header mapping was created just above and is
            // released exactly once here.
            if let Err(err) = unsafe { ShmObject::unmap(raw, META_SIZE) } {
                warn!(name = %name, error = %err, "failed to unmap header of dying segment");
            }
            return Err(SegError::SegmentGone {
                name: name.to_string(),
            });
        }

        debug!(name = %name, "attached to segment");
        Ok(Self {
            name,
            shm,
            header,
            payload_base: None,
        })
    }

    /// Maps the payload region into this process and returns its address.
    ///
    /// Idempotent: once mapped, further calls return the identical address
    /// without a new OS mapping. The address always points past the header;
    /// callers never see header bytes.
    ///
    /// # Errors
    ///
    /// [`SegError::MapFailed`] if the mapping syscall fails; the handle is
    /// left in its unmapped state.
    pub fn map(&mut self) -> Result<NonNull<u8>> {
        if let Some(base) = self.payload_base {
            return Ok(Self::payload_addr(base));
        }

        // Mapping offsets must be page-aligned, so the payload cannot be
        // mapped at its raw byte offset; map the whole object and step the
        // returned pointer past the header.
        let len = self.mapped_len();
        let raw = self
            .shm
            .map(len)
            .map_err(|source| SegError::map_failed(&self.name, source))?;
        let base = NonNull::new(raw).ok_or(SegError::InvalidMetadata)?;

        self.payload_base = Some(base);
        Ok(Self::payload_addr(base))
    }

    /// Releases this handle's payload mapping, if any.
    ///
    /// Other handles' mappings and the shared reference count are
    /// unaffected; each handle maps independently. No-op when unmapped.
    pub fn unmap(&mut self) -> Result<()> {
        if let Some(base) = self.payload_base.take() {
            let len = self.mapped_len();
            // SAFETY: base/len describe the live payload mapping this
            // handle made in `map`; taking it out of payload_base above
            // guarantees it is released exactly once.
            unsafe { ShmObject::unmap(base.as_ptr(), len) }
                .map_err(|source| SegError::os("unmap", &self.name, source))?;
        }
        Ok(())
    }

    /// Marks the segment deleted immediately, independent of its reference
    /// count, and (where the platform decouples names from contents)
    /// removes the name from the namespace right away.
    ///
    /// No new attach can succeed afterwards; handles that attached before
    /// the unlink keep working until they individually release.
    pub fn unlink(&mut self) -> Result<()> {
        self.meta().mark_deleted();
        match ShmObject::remove(&self.name) {
            Ok(()) => Ok(()),
            // Another handle may have unlinked or torn down first.
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(SegError::os("remove", &self.name, source)),
        }
    }

    /// The payload size requested at creation, exactly as requested:
    /// never the OS-rounded allocation, and never including the header.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.meta().payload_size()
    }

    /// The current shared reference count, observed through this handle's
    /// header mapping. A live value: it may change the instant after it is
    /// read.
    #[must_use]
    pub fn ref_count(&self) -> usize {
        self.meta().ref_count()
    }

    /// The segment's name.
    #[must_use]
    pub fn name(&self) -> &SegName {
        &self.name
    }

    /// The current payload address, or `None` while unmapped.
    #[must_use]
    pub fn addr(&self) -> Option<NonNull<u8>> {
        self.payload_base.map(Self::payload_addr)
    }

    /// The underlying shared memory file descriptor.
    #[cfg(unix)]
    #[must_use]
    pub fn fd(&self) -> std::os::fd::BorrowedFd<'_> {
        use std::os::fd::AsFd;
        self.shm.as_fd()
    }

    /// The native Win32 file-mapping handle.
    #[cfg(windows)]
    #[must_use]
    pub fn native_handle(&self) -> windows_sys::Win32::Foundation::HANDLE {
        self.shm.native_handle()
    }

    fn meta(&self) -> &SegmentMeta {
        // SAFETY: the header mapping is created before Self exists and
        // released only in Drop, after the last use of meta().
        unsafe { self.header.as_ref() }
    }

    /// Length of the payload mapping: the whole object, header included.
    fn mapped_len(&self) -> usize {
        META_SIZE + self.meta().payload_size() as usize
    }

    fn payload_addr(base: NonNull<u8>) -> NonNull<u8> {
        // SAFETY: base is the non-null start of a mapping at least
        // META_SIZE + payload bytes long.
        unsafe { NonNull::new_unchecked(base.as_ptr().add(META_SIZE)) }
    }
}

impl Drop for Segment {
    /// Releases this handle: decrements the shared count, unmaps payload
    /// and header, and, only as the unique last owner, marks the segment
    /// deleted and removes the name. Teardown failures are logged, never
    /// propagated; a leaked OS object is a degraded outcome, not a crash.
    fn drop(&mut self) {
        let payload_len = self.mapped_len();

        // The handle that observes the count at 1 is the unique last owner.
        // Marking Deleted before the namespace removal keeps any attacher
        // that already mapped the header from taking a reference.
        let last_owner = self.meta().release() == 1;
        if last_owner {
            self.meta().mark_deleted();
        }

        if let Some(base) = self.payload_base.take() {
            // SAFETY: the live payload mapping this handle made in `map`,
            // released exactly once.
            if let Err(err) = unsafe { ShmObject::unmap(base.as_ptr(), payload_len) } {
                warn!(name = %self.name, error = %err, "failed to unmap payload at release");
            }
        }

        // SAFETY: the header mapping created at construction; no use of
        // meta() may follow.
        if let Err(err) = unsafe { ShmObject::unmap(self.header.as_ptr().cast(), META_SIZE) } {
            warn!(name = %self.name, error = %err, "failed to unmap header at release");
        }

        if last_owner {
            debug!(name = %self.name, "last handle released, removing segment");
            if let Err(err) = ShmObject::remove(&self.name) {
                // Already gone if an explicit unlink preceded the release.
                if err.kind() != std::io::ErrorKind::NotFound {
                    warn!(name = %self.name, error = %err, "failed to remove segment name");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn unique_name(tag: &str) -> SegName {
        static COUNTER: AtomicU32 = AtomicU32::new(0);
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        SegName::new(format!("/shmseg-unit-{tag}-{}-{n}", std::process::id())).unwrap()
    }

    /// /dev/shm may be read-only in sandboxed environments; skip instead of
    /// failing there.
    fn create_or_skip(name: SegName, payload: u64) -> Option<Segment> {
        match Segment::create(name, payload) {
            Ok(seg) => Some(seg),
            Err(SegError::Os { ref source, .. })
                if source.kind() == std::io::ErrorKind::PermissionDenied =>
            {
                eprintln!("skipping: shared memory not permitted here");
                None
            }
            Err(err) => panic!("create failed: {err}"),
        }
    }

    #[test]
    fn create_initializes_header() {
        let Some(seg) = create_or_skip(unique_name("init"), 4096) else {
            return;
        };
        assert_eq!(seg.size(), 4096);
        assert_eq!(seg.ref_count(), 1);
        assert!(seg.addr().is_none());
    }

    #[test]
    fn map_is_idempotent() {
        let Some(mut seg) = create_or_skip(unique_name("idem"), 1024) else {
            return;
        };
        let first = seg.map().unwrap();
        let second = seg.map().unwrap();
        assert_eq!(first, second);
        assert_eq!(seg.addr(), Some(first));
    }

    #[test]
    fn unmap_is_a_noop_when_unmapped() {
        let Some(mut seg) = create_or_skip(unique_name("noop"), 64) else {
            return;
        };
        seg.unmap().unwrap();
        seg.map().unwrap();
        seg.unmap().unwrap();
        assert!(seg.addr().is_none());
        seg.unmap().unwrap();
    }

    #[test]
    fn remap_preserves_payload_bytes() {
        let Some(mut seg) = create_or_skip(unique_name("remap"), 256) else {
            return;
        };
        let addr = seg.map().unwrap();
        let msg = b"still here";
        unsafe {
            std::slice::from_raw_parts_mut(addr.as_ptr(), msg.len()).copy_from_slice(msg);
        }
        seg.unmap().unwrap();

        let addr = seg.map().unwrap();
        let bytes = unsafe { std::slice::from_raw_parts(addr.as_ptr(), msg.len()) };
        assert_eq!(bytes, msg);
    }

    #[test]
    fn attach_after_unlink_fails() {
        let name = unique_name("unlinked");
        let Some(mut seg) = create_or_skip(name.clone(), 64) else {
            return;
        };
        seg.unlink().unwrap();

        let err = Segment::attach(name).unwrap_err();
        assert!(
            matches!(err, SegError::SegmentGone { .. } | SegError::NotFound { .. }),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn attach_to_missing_name_is_not_found() {
        let err = Segment::attach(unique_name("missing")).unwrap_err();
        assert!(matches!(err, SegError::NotFound { .. }));
    }

    #[test]
    fn duplicate_create_is_already_exists() {
        let name = unique_name("dup");
        let Some(seg) = create_or_skip(name.clone(), 128) else {
            return;
        };
        let err = Segment::create(name, 128).unwrap_err();
        assert!(matches!(err, SegError::AlreadyExists { .. }));
        // Losing the race touches nothing: the winner is intact.
        assert_eq!(seg.ref_count(), 1);
        assert_eq!(seg.size(), 128);
    }

    #[test]
    fn name_is_reusable_after_last_release() {
        let name = unique_name("reuse");
        {
            let Some(_seg) = create_or_skip(name.clone(), 64) else {
                return;
            };
        }
        // The last drop removed the name, so the same name creates afresh.
        let seg = Segment::create(name, 32).unwrap();
        assert_eq!(seg.size(), 32);
        assert_eq!(seg.ref_count(), 1);
    }
}
