//! Error taxonomy.
//!
//! Engine failures travel as [`Errno`] and are surfaced unchanged inside
//! [`Error::Engine`]. The remaining variants are raised by this layer itself.

use std::fmt;
use std::io;

use thiserror::Error;

/// A positive errno value reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Errno(i32);

impl Errno {
    pub const EPERM: Errno = Errno(libc::EPERM);
    pub const ENOENT: Errno = Errno(libc::ENOENT);
    pub const EIO: Errno = Errno(libc::EIO);
    pub const ENOMEM: Errno = Errno(libc::ENOMEM);
    pub const EACCES: Errno = Errno(libc::EACCES);
    pub const EFAULT: Errno = Errno(libc::EFAULT);
    pub const EISDIR: Errno = Errno(libc::EISDIR);
    pub const EINVAL: Errno = Errno(libc::EINVAL);
    pub const ENOTTY: Errno = Errno(libc::ENOTTY);
    pub const ENOSPC: Errno = Errno(libc::ENOSPC);
    pub const EOVERFLOW: Errno = Errno(libc::EOVERFLOW);
    pub const EOPNOTSUPP: Errno = Errno(libc::EOPNOTSUPP);
    pub const ESTALE: Errno = Errno(libc::ESTALE);

    /// Wrap a raw errno. The sign is discarded; a code with no positive
    /// counterpart (`i32::MIN`) becomes EIO.
    pub const fn new(code: i32) -> Self {
        match code.checked_abs() {
            Some(code) => Errno(code),
            None => Errno::EIO,
        }
    }

    /// Normalize an engine status code.
    ///
    /// Zero is success. Both the negative (Linux) and the positive
    /// (Solaris) conventions are accepted for failures.
    pub fn from_status(status: i32) -> std::result::Result<(), Errno> {
        if status == 0 {
            Ok(())
        } else {
            Err(Errno::new(status))
        }
    }

    pub const fn code(self) -> i32 {
        self.0
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", io::Error::from_raw_os_error(self.0))
    }
}

impl std::error::Error for Errno {}

/// Errors returned by file, synchronizer and flag operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("engine error: {0}")]
    Engine(#[from] Errno),

    #[error("permission denied")]
    PermissionDenied,

    #[error("unsupported attribute flags: {flags:#x}")]
    Unsupported { flags: u32 },

    #[error("unknown control command: {cmd:#x}")]
    UnknownCommand { cmd: u32 },

    #[error("is a directory")]
    IsDirectory,

    #[error("file too large to open without O_LARGEFILE")]
    Overflow,

    #[error("invalid seek to offset {offset}")]
    InvalidSeek { offset: i64 },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// The errno a host would report for this error.
    pub fn errno(&self) -> Errno {
        match self {
            Error::Engine(errno) => *errno,
            Error::PermissionDenied => Errno::EACCES,
            Error::Unsupported { .. } => Errno::EOPNOTSUPP,
            Error::UnknownCommand { .. } => Errno::ENOTTY,
            Error::IsDirectory => Errno::EISDIR,
            Error::Overflow => Errno::EOVERFLOW,
            Error::InvalidSeek { .. } => Errno::EINVAL,
        }
    }

    /// Negative status in the host's calling convention.
    pub fn to_status(&self) -> i32 {
        -self.errno().code()
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        io::Error::from_raw_os_error(err.errno().code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_normalization() {
        assert_eq!(Errno::from_status(0), Ok(()));
        assert_eq!(Errno::from_status(-libc::EIO), Err(Errno::EIO));
        // Solaris-style positive code maps to the same errno
        assert_eq!(Errno::from_status(libc::ENOSPC), Err(Errno::ENOSPC));
    }

    #[test]
    fn test_unrepresentable_status_becomes_eio() {
        assert_eq!(Errno::new(i32::MIN), Errno::EIO);
        assert_eq!(Errno::from_status(i32::MIN), Err(Errno::EIO));
        assert_eq!(
            Error::Engine(Errno::new(i32::MIN)).to_status(),
            -libc::EIO
        );
    }

    #[test]
    fn test_error_to_status() {
        assert_eq!(Error::PermissionDenied.to_status(), -libc::EACCES);
        assert_eq!(
            Error::Unsupported { flags: 1 }.to_status(),
            -libc::EOPNOTSUPP
        );
        assert_eq!(Error::UnknownCommand { cmd: 0 }.errno(), Errno::ENOTTY);
        assert_eq!(Error::Engine(Errno::ESTALE).errno(), Errno::ESTALE);
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err: io::Error = Error::IsDirectory.into();
        assert_eq!(io_err.raw_os_error(), Some(libc::EISDIR));
    }
}
