//! Platform backends for named shared-memory objects.
//!
//! Each platform provides one `ShmObject` type satisfying the same contract;
//! the core depends only on this surface and never branches on platform:
//!
//! | operation | behavior |
//! |-----------|----------|
//! | `create(name, total_bytes)` | create-exclusive: exactly one of N racing creators wins, the rest get `AlreadyExists` |
//! | `open(name)` | open an existing object, `NotFound` if absent |
//! | `map(len)` | map the first `len` bytes of the object into this process |
//! | `unmap(addr, len)` | release one mapping made by `map` |
//! | `remove(name)` | remove the name from the OS namespace |
//! | close | dropping the `ShmObject` closes the backend handle (best-effort) |
//!
//! The removal semantics diverge: POSIX unlinks a name while mappings remain
//! valid, while the Win32 namespace entry disappears on its own once the
//! last handle closes (so `remove` there is a successful no-op). The core's
//! Deleted flag in the shared header papers over the difference so attach
//! observes one consistent contract on both platforms.

#[cfg(unix)]
mod posix;
#[cfg(unix)]
pub(crate) use posix::ShmObject;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
pub(crate) use windows::ShmObject;
