//! Win32 backend: `CreateFileMappingW` / `MapViewOfFile` via windows-sys.

use std::io;
use std::ptr::{null, null_mut};

use windows_sys::Win32::Foundation::{
    CloseHandle, GetLastError, ERROR_ALREADY_EXISTS, ERROR_FILE_NOT_FOUND, HANDLE,
    INVALID_HANDLE_VALUE,
};
use windows_sys::Win32::System::Memory::{
    CreateFileMappingW, MapViewOfFile, OpenFileMappingW, UnmapViewOfFile, FILE_MAP_ALL_ACCESS,
    MEMORY_MAPPED_VIEW_ADDRESS, PAGE_READWRITE,
};

use crate::error::SegError;
use crate::name::SegName;

/// NUL-terminated UTF-16 form of a kernel object name.
fn wide(name: &str) -> Vec<u16> {
    name.encode_utf16().chain(std::iter::once(0)).collect()
}

/// An open Win32 file-mapping object. Dropping it closes the handle; the
/// kernel removes the namespace entry on its own once the last handle and
/// view are gone.
#[derive(Debug)]
pub(crate) struct ShmObject {
    handle: HANDLE,
}

// SAFETY: the handle refers to a kernel object, not thread-local state.
unsafe impl Send for ShmObject {}

impl ShmObject {
    /// Creates the object, `total_bytes` large, backed by the paging file.
    ///
    /// `CreateFileMappingW` hands back a valid handle even when the name is
    /// already taken, signalling the loss of the race only through
    /// `ERROR_ALREADY_EXISTS`; that handle must be closed, not used.
    pub(crate) fn create(name: &SegName, total_bytes: u64) -> Result<Self, SegError> {
        let object_name = wide(name.object_name());
        let handle = unsafe {
            CreateFileMappingW(
                INVALID_HANDLE_VALUE,
                null(),
                PAGE_READWRITE,
                (total_bytes >> 32) as u32,
                total_bytes as u32,
                object_name.as_ptr(),
            )
        };
        let last_error = unsafe { GetLastError() };

        if !handle.is_null() && last_error == ERROR_ALREADY_EXISTS {
            unsafe { CloseHandle(handle) };
            return Err(SegError::AlreadyExists {
                name: name.to_string(),
            });
        }
        if handle.is_null() {
            return Err(SegError::os(
                "CreateFileMappingW",
                name,
                io::Error::from_raw_os_error(last_error as i32),
            ));
        }

        Ok(Self { handle })
    }

    /// Opens an existing object.
    pub(crate) fn open(name: &SegName) -> Result<Self, SegError> {
        let object_name = wide(name.object_name());
        let handle = unsafe { OpenFileMappingW(FILE_MAP_ALL_ACCESS, 0, object_name.as_ptr()) };
        if handle.is_null() {
            let last_error = unsafe { GetLastError() };
            return Err(match last_error {
                ERROR_FILE_NOT_FOUND => SegError::NotFound {
                    name: name.to_string(),
                },
                code => SegError::os(
                    "OpenFileMappingW",
                    name,
                    io::Error::from_raw_os_error(code as i32),
                ),
            });
        }

        Ok(Self { handle })
    }

    /// Maps the first `len` bytes of the object into this process.
    pub(crate) fn map(&self, len: usize) -> io::Result<*mut u8> {
        let view = unsafe { MapViewOfFile(self.handle, FILE_MAP_ALL_ACCESS, 0, 0, len) };
        if view.Value.is_null() {
            return Err(io::Error::last_os_error());
        }
        Ok(view.Value.cast())
    }

    /// Releases one view previously returned by [`map`](Self::map).
    ///
    /// # Safety
    ///
    /// `addr` must be the base address of exactly one live view made by
    /// `map`, and nothing may touch that region afterwards.
    pub(crate) unsafe fn unmap(addr: *mut u8, _len: usize) -> io::Result<()> {
        let view = MEMORY_MAPPED_VIEW_ADDRESS { Value: addr.cast() };
        if UnmapViewOfFile(view) == 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// No-op: the Win32 namespace entry vanishes with the last handle, so
    /// there is nothing to remove eagerly. Attach-side Deleted checks give
    /// callers the same observable contract as the POSIX backend.
    pub(crate) fn remove(_name: &SegName) -> io::Result<()> {
        Ok(())
    }

    /// The native file-mapping handle.
    pub(crate) fn native_handle(&self) -> HANDLE {
        self.handle
    }
}

impl Drop for ShmObject {
    fn drop(&mut self) {
        unsafe { CloseHandle(self.handle) };
    }
}
