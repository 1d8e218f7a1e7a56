//! POSIX backend: `shm_open` / `mmap` via rustix.

use std::io;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::ptr::null_mut;

use rustix::fs::{ftruncate, Mode};
use rustix::io::Errno;
use rustix::mm::{mmap, munmap, MapFlags, ProtFlags};
use rustix::shm;

use crate::error::SegError;
use crate::name::SegName;

/// An open POSIX shared memory object. Dropping it closes the descriptor;
/// the name and any mappings are unaffected.
#[derive(Debug)]
pub(crate) struct ShmObject {
    fd: OwnedFd,
}

impl ShmObject {
    /// Creates the object with create-exclusive semantics and resizes it to
    /// `total_bytes`. A failed resize removes the just-created name before
    /// reporting, so a half-created object never leaks into the namespace.
    pub(crate) fn create(name: &SegName, total_bytes: u64) -> Result<Self, SegError> {
        let fd = shm::open(
            name.as_str(),
            shm::OFlags::CREATE | shm::OFlags::EXCL | shm::OFlags::RDWR,
            Mode::RUSR | Mode::WUSR,
        )
        .map_err(|err| match err {
            Errno::EXIST => SegError::AlreadyExists {
                name: name.to_string(),
            },
            err => SegError::os("shm_open", name, err),
        })?;

        if let Err(err) = ftruncate(&fd, total_bytes) {
            drop(fd);
            let _ = shm::unlink(name.as_str());
            return Err(SegError::os("ftruncate", name, err));
        }

        Ok(Self { fd })
    }

    /// Opens an existing object.
    pub(crate) fn open(name: &SegName) -> Result<Self, SegError> {
        let fd = shm::open(name.as_str(), shm::OFlags::RDWR, Mode::empty()).map_err(|err| {
            match err {
                Errno::NOENT => SegError::NotFound {
                    name: name.to_string(),
                },
                err => SegError::os("shm_open", name, err),
            }
        })?;

        Ok(Self { fd })
    }

    /// Maps the first `len` bytes of the object into this process.
    pub(crate) fn map(&self, len: usize) -> io::Result<*mut u8> {
        // SAFETY: a fresh MAP_SHARED mapping of a valid fd at offset 0; the
        // kernel picks the address, so nothing in this process is aliased.
        let addr = unsafe {
            mmap(
                null_mut(),
                len,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                &self.fd,
                0,
            )
        }
        .map_err(io::Error::from)?;

        Ok(addr.cast())
    }

    /// Releases one mapping previously returned by [`map`](Self::map).
    ///
    /// # Safety
    ///
    /// `addr` and `len` must describe exactly one live mapping made by
    /// `map`, and nothing may touch that region afterwards.
    pub(crate) unsafe fn unmap(addr: *mut u8, len: usize) -> io::Result<()> {
        munmap(addr.cast(), len).map_err(io::Error::from)
    }

    /// Removes the name from the namespace. Existing descriptors and
    /// mappings remain valid until they are individually closed/unmapped.
    pub(crate) fn remove(name: &SegName) -> io::Result<()> {
        shm::unlink(name.as_str()).map_err(io::Error::from)
    }
}

impl AsFd for ShmObject {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}
