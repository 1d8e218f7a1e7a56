//! Error types for segment operations.

use thiserror::Error;

use crate::name::InvalidName;

/// Result alias for segment operations.
pub type Result<T> = std::result::Result<T, SegError>;

/// Errors produced by [`Segment`](crate::Segment) operations.
#[derive(Debug, Error)]
pub enum SegError {
    /// The segment name is not a valid portable name.
    #[error(transparent)]
    InvalidName(#[from] InvalidName),

    /// A create lost the name race: the segment already exists.
    #[error("segment `{name}` already exists")]
    AlreadyExists { name: String },

    /// An attach found no segment under the given name.
    #[error("segment `{name}` not found")]
    NotFound { name: String },

    /// An attach found the segment mid-teardown: it is marked deleted and
    /// must not be resurrected.
    #[error("segment `{name}` is marked deleted")]
    SegmentGone { name: String },

    /// A mapping syscall failed; the handle is left in its unmapped state.
    #[error("mapping failed for `{name}`: {source}")]
    MapFailed {
        name: String,
        #[source]
        source: std::io::Error,
    },

    /// The metadata header is not mapped where an operation requires it.
    #[error("segment metadata is not mapped")]
    InvalidMetadata,

    /// Passthrough for all other backend failures.
    #[error("{op} failed for `{name}`: {source}")]
    Os {
        op: &'static str,
        name: String,
        #[source]
        source: std::io::Error,
    },
}

impl SegError {
    pub(crate) fn os(
        op: &'static str,
        name: &crate::SegName,
        source: impl Into<std::io::Error>,
    ) -> Self {
        Self::Os {
            op,
            name: name.to_string(),
            source: source.into(),
        }
    }

    pub(crate) fn map_failed(name: &crate::SegName, source: impl Into<std::io::Error>) -> Self {
        Self::MapFailed {
            name: name.to_string(),
            source: source.into(),
        }
    }
}
