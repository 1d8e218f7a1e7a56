//! Validated segment and semaphore names.

use std::fmt;

use thiserror::Error;

/// Longest name accepted, including the leading slash.
const NAME_MAX: usize = 255;

/// A name was rejected by [`SegName::new`].
#[derive(Debug, Error)]
#[error("invalid name `{name}`: {reason}")]
pub struct InvalidName {
    pub name: String,
    pub reason: &'static str,
}

/// A validated, portable segment name.
///
/// The canonical form follows the POSIX `shm_open` rules, which are the
/// stricter of the two backends:
///
/// - starts with `/`
/// - contains no further `/` characters
/// - at most 255 bytes, and more than just the leading slash
/// - no interior NUL bytes
///
/// The Windows backend strips the leading slash when naming the kernel
/// object, so the same [`SegName`] identifies the same segment on either
/// platform.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SegName(String);

impl SegName {
    /// Validates `name` and returns it as a [`SegName`].
    ///
    /// # Errors
    ///
    /// Returns [`InvalidName`] naming the violated rule.
    pub fn new(name: impl Into<String>) -> Result<Self, InvalidName> {
        let name = name.into();

        if !name.starts_with('/') {
            return Err(InvalidName {
                name,
                reason: "name must start with '/'",
            });
        }

        if name.len() == 1 {
            return Err(InvalidName {
                name,
                reason: "name must not be empty after the leading '/'",
            });
        }

        if name[1..].contains('/') {
            return Err(InvalidName {
                name,
                reason: "name must not contain additional '/' characters",
            });
        }

        if name.len() > NAME_MAX {
            return Err(InvalidName {
                name,
                reason: "name length must be <= 255 bytes",
            });
        }

        if name.contains('\0') {
            return Err(InvalidName {
                name,
                reason: "name must not contain NUL bytes",
            });
        }

        Ok(Self(name))
    }

    /// The canonical `/name` form.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The kernel object name on Windows: the canonical form without the
    /// leading slash.
    #[cfg(windows)]
    pub(crate) fn object_name(&self) -> &str {
        &self.0[1..]
    }
}

impl fmt::Display for SegName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for SegName {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}
