//! Named, reference-counted shared-memory segments.
//!
//! A segment is a named block of memory that multiple unrelated processes can
//! create, attach to, and release safely without a central coordinator. The
//! segment's own liveness state lives *inside* the shared memory: a small
//! metadata header at the start of the backing object carries an atomic
//! reference count and a Live/Deleted status flag that every attached process
//! observes through its mapping. The last handle to release a segment removes
//! it from the OS namespace.
//!
//! # Overview
//!
//! - [`Segment`] - per-process handle to a named segment (create / attach /
//!   map / unmap / unlink)
//! - [`SegName`] - validated segment name (`/name` form)
//! - [`Semaphore`] - named counting semaphore for cross-process signalling
//! - [`SegError`] / [`SemError`] - typed errors for every fallible operation
//!
//! # Basic Usage
//!
//! ```no_run
//! use shmseg::{SegName, Segment};
//!
//! // Process A: create a segment with a 4096-byte payload.
//! let name = SegName::new("/my-segment")?;
//! let mut seg = Segment::create(name.clone(), 4096)?;
//! let addr = seg.map()?;
//! unsafe { addr.as_ptr().write(42) };
//!
//! // Process B: attach to the same name.
//! let mut peer = Segment::attach(name)?;
//! assert_eq!(peer.size(), 4096);
//! assert_eq!(peer.ref_count(), 2);
//! let addr = peer.map()?;
//! assert_eq!(unsafe { addr.as_ptr().read() }, 42);
//! # Ok::<(), shmseg::SegError>(())
//! ```
//!
//! # Memory Layout
//!
//! ```text
//! OS shared memory object: "/my-segment"
//! ┌────────────────────┬──────────────────────────────┐
//! │ SegmentMeta        │ payload (size() bytes)       │
//! │ status, ref_count, │ raw bytes, interpreted by    │
//! │ payload_size       │ the caller                   │
//! └────────────────────┴──────────────────────────────┘
//!                      ↑
//!                 map() returns this address; callers
//!                 never see the header bytes.
//! ```
//!
//! # Cleanup Semantics
//!
//! Every successful create or attach holds one reference. Dropping a handle
//! releases it: the payload and header mappings are unmapped, the shared
//! count is decremented, and the unique handle that observes the count reach
//! zero marks the segment `Deleted` and removes the name. An attach that
//! races with that teardown fails with [`SegError::SegmentGone`] rather than
//! resurrecting the dying segment.
//!
//! Segment names are host-global state. Callers (and tests) should use
//! process-unique names; a leftover object from a crashed run surfaces as
//! [`SegError::AlreadyExists`] on the next create.

mod backend;
mod meta;

pub mod error;
pub mod name;
pub mod segment;
pub mod sem;
pub mod trace;

pub use error::{Result, SegError};
pub use name::{InvalidName, SegName};
pub use segment::Segment;
pub use sem::{SemError, Semaphore};
