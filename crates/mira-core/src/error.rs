use std::io;

use thiserror::Error;

/// Errors produced by calls into the remote API.
///
/// The transport layer collapses its own failure modes (timeouts, token
/// expiry, malformed responses) into `Transient`; `Fatal` is reserved for
/// conditions a retry cannot fix.
#[derive(Error, Debug)]
pub enum RemoteError {
    #[error("not found on remote")]
    NotFound,

    #[error("transient remote failure: {0}")]
    Transient(String),

    #[error("fatal remote failure: {0}")]
    Fatal(String),
}

pub type RemoteResult<T> = Result<T, RemoteError>;

/// Errors surfaced across the filesystem facade.
///
/// The kernel-binding layer maps these onto negated errno values; `errno`
/// gives the conventional code for each variant.
#[derive(Error, Debug)]
pub enum FsError {
    #[error("no such file or directory")]
    NotFound,

    #[error("not a directory")]
    NotADirectory,

    #[error("access denied")]
    AccessDenied,

    #[error("temporary failure, retry")]
    Transient,

    #[error("fatal: {0}")]
    Fatal(String),
}

impl FsError {
    /// POSIX errno for this error.
    pub fn errno(&self) -> i32 {
        match self {
            FsError::NotFound => 2,       // ENOENT
            FsError::NotADirectory => 20, // ENOTDIR
            FsError::AccessDenied => 13,  // EACCES
            FsError::Transient => 11,     // EAGAIN
            FsError::Fatal(_) => 5,       // EIO
        }
    }
}

impl From<RemoteError> for FsError {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::NotFound => FsError::NotFound,
            RemoteError::Transient(_) => FsError::Transient,
            RemoteError::Fatal(msg) => FsError::Fatal(msg),
        }
    }
}

impl From<io::Error> for FsError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => FsError::NotFound,
            _ => FsError::AccessDenied,
        }
    }
}

pub type FsResult<T> = Result<T, FsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(FsError::NotFound.errno(), 2);
        assert_eq!(FsError::NotADirectory.errno(), 20);
        assert_eq!(FsError::AccessDenied.errno(), 13);
    }

    #[test]
    fn test_remote_error_conversion() {
        assert!(matches!(
            FsError::from(RemoteError::NotFound),
            FsError::NotFound
        ));
        assert!(matches!(
            FsError::from(RemoteError::Transient("timeout".into())),
            FsError::Transient
        ));
    }
}
