#![forbid(unsafe_code)]
//! Error types for SLFS.
//!
//! Defines `SlfsError` and a `Result<T>` alias used throughout the
//! workspace. Includes errno mappings for syscall-layer response codes.

use thiserror::Error;

/// Unified error type for all SLFS operations.
#[derive(Debug, Error)]
pub enum SlfsError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt metadata at block {block}: {detail}")]
    Corruption { block: u32, detail: String },

    #[error("invalid on-disk format: {0}")]
    Format(String),

    /// No free segment could be produced, even after an emergency cleaner
    /// run. Fails the user operation with ENOSPC.
    #[error("no space left on device")]
    NoSpace,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("permission denied")]
    PermissionDenied,

    #[error("file too large")]
    FileTooLarge,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl SlfsError {
    /// Convert this error into a POSIX errno suitable for syscall replies.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Corruption { .. } => libc::EIO,
            Self::Format(_) | Self::InvalidArgument(_) => libc::EINVAL,
            Self::NoSpace => libc::ENOSPC,
            Self::NotFound(_) => libc::ENOENT,
            Self::PermissionDenied => libc::EACCES,
            Self::FileTooLarge => libc::EFBIG,
        }
    }
}

/// Result alias using `SlfsError`.
pub type Result<T> = std::result::Result<T, SlfsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mappings() {
        assert_eq!(SlfsError::NoSpace.to_errno(), libc::ENOSPC);
        assert_eq!(
            SlfsError::Corruption {
                block: 7,
                detail: "bad imap slot".into()
            }
            .to_errno(),
            libc::EIO
        );
        assert_eq!(
            SlfsError::NotFound("inode 9".into()).to_errno(),
            libc::ENOENT
        );
        assert_eq!(SlfsError::FileTooLarge.to_errno(), libc::EFBIG);
    }
}
