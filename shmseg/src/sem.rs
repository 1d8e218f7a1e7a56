//! Named counting semaphores for cross-process signalling.
//!
//! A [`Semaphore`] is an independent synchronization primitive identified by
//! the same name form as segments; it is not layered on
//! [`Segment`](crate::Segment) and has no shared metadata of its own: the OS
//! owns the count.
//!
//! # Basic Usage
//!
//! ```no_run
//! use shmseg::{SegName, Semaphore};
//!
//! // Process A: create with an initial count of 0 and signal.
//! let name = SegName::new("/ready")?;
//! let sem = Semaphore::create(name.clone(), 0)?;
//! sem.post()?;
//!
//! // Process B: wait for the signal.
//! let sem = Semaphore::open(name)?;
//! sem.wait()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use thiserror::Error;

use crate::name::{InvalidName, SegName};
use crate::trace::error;

/// Result alias for semaphore operations.
pub type SemResult<T> = std::result::Result<T, SemError>;

/// Errors produced by [`Semaphore`] operations.
#[derive(Debug, Error)]
pub enum SemError {
    /// The semaphore name is not a valid portable name.
    #[error(transparent)]
    InvalidName(#[from] InvalidName),

    /// A create lost the name race: the semaphore already exists.
    #[error("semaphore `{name}` already exists")]
    AlreadyExists { name: String },

    /// An open found no semaphore under the given name.
    #[error("semaphore `{name}` not found")]
    NotFound { name: String },

    /// `try_wait` found the count at zero.
    #[error("semaphore would block")]
    WouldBlock,

    /// Passthrough for all other OS failures.
    #[error("{op} failed for `{name}`: {source}")]
    Os {
        op: &'static str,
        name: String,
        #[source]
        source: std::io::Error,
    },
}

impl SemError {
    fn os(op: &'static str, name: &SegName, source: std::io::Error) -> Self {
        Self::Os {
            op,
            name: name.to_string(),
            source,
        }
    }
}

/// Per-process handle to a named counting semaphore.
///
/// Dropping the handle closes it and removes the name best-effort; removal
/// failures (for instance when another handle already removed it) are
/// logged, never propagated.
#[derive(Debug)]
pub struct Semaphore {
    name: SegName,
    raw: imp::RawSem,
}

// SAFETY: the raw handle refers to a kernel/libc object valid across
// threads; all operations on it are themselves thread-safe.
unsafe impl Send for Semaphore {}
unsafe impl Sync for Semaphore {}

impl Semaphore {
    /// Creates a new semaphore with the given initial count.
    ///
    /// # Errors
    ///
    /// [`SemError::AlreadyExists`] if the name is taken.
    pub fn create(name: SegName, initial: u32) -> SemResult<Self> {
        let raw = imp::create(&name, initial)?;
        Ok(Self { name, raw })
    }

    /// Opens an existing semaphore.
    ///
    /// # Errors
    ///
    /// [`SemError::NotFound`] if no semaphore has this name.
    pub fn open(name: SegName) -> SemResult<Self> {
        let raw = imp::open(&name)?;
        Ok(Self { name, raw })
    }

    /// Releases the semaphore, incrementing its count and waking one
    /// waiter if any.
    pub fn post(&self) -> SemResult<()> {
        imp::post(self)
    }

    /// Acquires the semaphore, blocking until the count is positive and
    /// then decrementing it.
    pub fn wait(&self) -> SemResult<()> {
        imp::wait(self)
    }

    /// Acquires the semaphore without blocking.
    ///
    /// # Errors
    ///
    /// [`SemError::WouldBlock`] if the count is zero.
    pub fn try_wait(&self) -> SemResult<()> {
        imp::try_wait(self)
    }

    /// Reads the current count.
    ///
    /// A live, shared value: it may change the instant after it is read.
    /// On Windows this is emulated by releasing once (observing the
    /// previous count) and immediately re-acquiring, which briefly perturbs
    /// the count.
    pub fn value(&self) -> SemResult<u32> {
        imp::value(self)
    }

    /// The semaphore's name.
    #[must_use]
    pub fn name(&self) -> &SegName {
        &self.name
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        if let Err(err) = imp::close_and_remove(self) {
            error!(name = %self.name, error = %err, "failed to remove semaphore name");
        }
    }
}

#[cfg(unix)]
mod imp {
    use std::ffi::CString;
    use std::io;

    use super::{SemError, SemResult, Semaphore};
    use crate::name::SegName;

    pub(super) type RawSem = *mut libc::sem_t;

    fn c_name(name: &SegName) -> CString {
        // SegName validation rejects interior NULs.
        CString::new(name.as_str()).expect("validated name has no NUL")
    }

    pub(super) fn create(name: &SegName, initial: u32) -> SemResult<RawSem> {
        let c = c_name(name);
        let raw = unsafe {
            libc::sem_open(
                c.as_ptr(),
                libc::O_CREAT | libc::O_EXCL,
                0o644 as libc::c_uint,
                initial as libc::c_uint,
            )
        };
        if raw == libc::SEM_FAILED {
            let err = io::Error::last_os_error();
            return Err(match err.raw_os_error() {
                Some(libc::EEXIST) => SemError::AlreadyExists {
                    name: name.to_string(),
                },
                _ => SemError::os("sem_open", name, err),
            });
        }
        Ok(raw)
    }

    pub(super) fn open(name: &SegName) -> SemResult<RawSem> {
        let c = c_name(name);
        let raw = unsafe { libc::sem_open(c.as_ptr(), 0) };
        if raw == libc::SEM_FAILED {
            let err = io::Error::last_os_error();
            return Err(match err.raw_os_error() {
                Some(libc::ENOENT) => SemError::NotFound {
                    name: name.to_string(),
                },
                _ => SemError::os("sem_open", name, err),
            });
        }
        Ok(raw)
    }

    pub(super) fn post(sem: &Semaphore) -> SemResult<()> {
        if unsafe { libc::sem_post(sem.raw) } == -1 {
            return Err(SemError::os(
                "sem_post",
                &sem.name,
                io::Error::last_os_error(),
            ));
        }
        Ok(())
    }

    pub(super) fn wait(sem: &Semaphore) -> SemResult<()> {
        loop {
            if unsafe { libc::sem_wait(sem.raw) } == 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINTR) {
                return Err(SemError::os("sem_wait", &sem.name, err));
            }
        }
    }

    pub(super) fn try_wait(sem: &Semaphore) -> SemResult<()> {
        if unsafe { libc::sem_trywait(sem.raw) } == -1 {
            let err = io::Error::last_os_error();
            return Err(match err.raw_os_error() {
                Some(libc::EAGAIN) => SemError::WouldBlock,
                _ => SemError::os("sem_trywait", &sem.name, err),
            });
        }
        Ok(())
    }

    pub(super) fn value(sem: &Semaphore) -> SemResult<u32> {
        let mut value: libc::c_int = 0;
        if unsafe { libc::sem_getvalue(sem.raw, &mut value) } == -1 {
            return Err(SemError::os(
                "sem_getvalue",
                &sem.name,
                io::Error::last_os_error(),
            ));
        }
        // Some implementations report waiters as a negative count.
        Ok(value.max(0) as u32)
    }

    pub(super) fn close_and_remove(sem: &Semaphore) -> io::Result<()> {
        unsafe { libc::sem_close(sem.raw) };
        let c = c_name(&sem.name);
        if unsafe { libc::sem_unlink(c.as_ptr()) } == -1 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::NotFound {
                return Err(err);
            }
        }
        Ok(())
    }
}

#[cfg(windows)]
mod imp {
    use std::io;

    use windows_sys::Win32::Foundation::{
        CloseHandle, GetLastError, ERROR_ALREADY_EXISTS, ERROR_FILE_NOT_FOUND, HANDLE,
        WAIT_FAILED, WAIT_OBJECT_0, WAIT_TIMEOUT,
    };
    use windows_sys::Win32::System::Threading::{
        CreateSemaphoreW, OpenSemaphoreW, ReleaseSemaphore, WaitForSingleObject, INFINITE,
        SEMAPHORE_ALL_ACCESS,
    };

    use super::{SemError, SemResult, Semaphore};
    use crate::name::SegName;

    pub(super) type RawSem = HANDLE;

    fn wide(name: &SegName) -> Vec<u16> {
        name.object_name()
            .encode_utf16()
            .chain(std::iter::once(0))
            .collect()
    }

    pub(super) fn create(name: &SegName, initial: u32) -> SemResult<RawSem> {
        let object_name = wide(name);
        let raw = unsafe {
            CreateSemaphoreW(
                std::ptr::null(),
                initial as i32,
                i32::MAX,
                object_name.as_ptr(),
            )
        };
        let last_error = unsafe { GetLastError() };
        if !raw.is_null() && last_error == ERROR_ALREADY_EXISTS {
            unsafe { CloseHandle(raw) };
            return Err(SemError::AlreadyExists {
                name: name.to_string(),
            });
        }
        if raw.is_null() {
            return Err(SemError::os(
                "CreateSemaphoreW",
                name,
                io::Error::from_raw_os_error(last_error as i32),
            ));
        }
        Ok(raw)
    }

    pub(super) fn open(name: &SegName) -> SemResult<RawSem> {
        let object_name = wide(name);
        let raw = unsafe { OpenSemaphoreW(SEMAPHORE_ALL_ACCESS, 0, object_name.as_ptr()) };
        if raw.is_null() {
            let last_error = unsafe { GetLastError() };
            return Err(match last_error {
                ERROR_FILE_NOT_FOUND => SemError::NotFound {
                    name: name.to_string(),
                },
                code => SemError::os(
                    "OpenSemaphoreW",
                    name,
                    io::Error::from_raw_os_error(code as i32),
                ),
            });
        }
        Ok(raw)
    }

    pub(super) fn post(sem: &Semaphore) -> SemResult<()> {
        if unsafe { ReleaseSemaphore(sem.raw, 1, std::ptr::null_mut()) } == 0 {
            return Err(SemError::os(
                "ReleaseSemaphore",
                &sem.name,
                io::Error::last_os_error(),
            ));
        }
        Ok(())
    }

    pub(super) fn wait(sem: &Semaphore) -> SemResult<()> {
        match unsafe { WaitForSingleObject(sem.raw, INFINITE) } {
            WAIT_OBJECT_0 => Ok(()),
            WAIT_FAILED => Err(SemError::os(
                "WaitForSingleObject",
                &sem.name,
                io::Error::last_os_error(),
            )),
            code => Err(SemError::os(
                "WaitForSingleObject",
                &sem.name,
                io::Error::from_raw_os_error(code as i32),
            )),
        }
    }

    pub(super) fn try_wait(sem: &Semaphore) -> SemResult<()> {
        match unsafe { WaitForSingleObject(sem.raw, 0) } {
            WAIT_OBJECT_0 => Ok(()),
            WAIT_TIMEOUT => Err(SemError::WouldBlock),
            _ => Err(SemError::os(
                "WaitForSingleObject",
                &sem.name,
                io::Error::last_os_error(),
            )),
        }
    }

    /// Win32 exposes no direct count query: release once to learn the
    /// previous count, then immediately re-acquire to undo it.
    pub(super) fn value(sem: &Semaphore) -> SemResult<u32> {
        let mut previous: i32 = 0;
        if unsafe { ReleaseSemaphore(sem.raw, 1, &mut previous) } == 0 {
            return Err(SemError::os(
                "ReleaseSemaphore",
                &sem.name,
                io::Error::last_os_error(),
            ));
        }
        wait(sem)?;
        Ok(previous.max(0) as u32)
    }

    pub(super) fn close_and_remove(sem: &Semaphore) -> io::Result<()> {
        // The kernel drops the name with the last handle; closing is all
        // there is to do.
        if unsafe { CloseHandle(sem.raw) } == 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn unique_name(tag: &str) -> SegName {
        static COUNTER: AtomicU32 = AtomicU32::new(0);
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        SegName::new(format!("/shmseg-sem-{tag}-{}-{n}", std::process::id())).unwrap()
    }

    fn create_or_skip(name: SegName, initial: u32) -> Option<Semaphore> {
        match Semaphore::create(name, initial) {
            Ok(sem) => Some(sem),
            Err(SemError::Os { ref source, .. })
                if source.kind() == std::io::ErrorKind::PermissionDenied =>
            {
                eprintln!("skipping: named semaphores not permitted here");
                None
            }
            Err(err) => panic!("create failed: {err}"),
        }
    }

    #[test]
    fn post_and_wait_adjust_the_count() {
        let Some(sem) = create_or_skip(unique_name("count"), 3) else {
            return;
        };
        assert_eq!(sem.value().unwrap(), 3);

        sem.post().unwrap();
        assert_eq!(sem.value().unwrap(), 4);

        sem.wait().unwrap();
        sem.wait().unwrap();
        assert_eq!(sem.value().unwrap(), 2);
    }

    #[test]
    fn try_wait_on_zero_would_block() {
        let Some(sem) = create_or_skip(unique_name("zero"), 0) else {
            return;
        };
        assert!(matches!(sem.try_wait(), Err(SemError::WouldBlock)));

        sem.post().unwrap();
        sem.try_wait().unwrap();
        assert!(matches!(sem.try_wait(), Err(SemError::WouldBlock)));
    }

    #[test]
    fn duplicate_create_is_already_exists() {
        let name = unique_name("dup");
        let Some(_sem) = create_or_skip(name.clone(), 1) else {
            return;
        };
        let err = Semaphore::create(name, 1).unwrap_err();
        assert!(matches!(err, SemError::AlreadyExists { .. }));
    }

    #[test]
    fn open_missing_is_not_found() {
        let err = Semaphore::open(unique_name("missing")).unwrap_err();
        assert!(matches!(err, SemError::NotFound { .. }));
    }

    #[test]
    fn open_sees_creator_posts() {
        let name = unique_name("pair");
        let Some(creator) = create_or_skip(name.clone(), 0) else {
            return;
        };
        let opener = Semaphore::open(name).unwrap();

        creator.post().unwrap();
        opener.wait().unwrap();
        assert!(matches!(opener.try_wait(), Err(SemError::WouldBlock)));
    }
}
