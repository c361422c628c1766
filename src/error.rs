use alloc_counter::no_alloc;
use std::ffi::c_int;

use crate::config::DecodeError;
use crate::sync::SyncMsg;

/// Result type for our error type.
pub type Result<T> = std::result::Result<T, Error>;

/// An error type which can track cause (reason the error happened) and context (what we were
/// doing when the error happened) without allocating.
///
/// Errors are produced in freshly cloned processes, so this must stay `Copy` and heap-free.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Error {
    pub kind: ErrorKind,
    pub errno: c_int,
    pub cause: Option<&'static str>,
    pub context: Option<&'static str>,
}

/// What class of failure an [`Error`] is. Every class is fatal to the process tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ErrorKind {
    /// Reading the configuration stream failed.
    #[error("configuration error")]
    Config,

    /// The configuration stream was read but is malformed.
    #[error("{0}")]
    Decode(DecodeError),

    /// Creating a descendant process failed.
    #[error("process creation error")]
    Spawn,

    /// Entering a namespace failed.
    #[error("namespace error")]
    Namespace,

    /// Assuming an identity inside a new user namespace failed.
    #[error("identity error")]
    Identity,

    /// A sync channel was short-read, short-written, or closed by the peer.
    #[error("protocol error")]
    Protocol,

    /// A peer sent a tag other than the one the handshake requires next.
    #[error("unexpected sync message: expected {expected}, got {got:#x}")]
    UnexpectedMessage { expected: SyncMsg, got: u32 },

    /// Any other OS-level failure.
    #[error("os error")]
    Io,
}

impl Error {
    /// Create an empty error of the given kind.
    #[cfg_attr(debug_assertions, no_alloc)]
    pub fn new(kind: ErrorKind) -> Error {
        Error {
            kind,
            errno: 0,
            cause: None,
            context: None,
        }
    }

    /// Create an error from the last OS error.
    #[cfg_attr(debug_assertions, no_alloc)]
    pub fn last_os_error() -> Error {
        Error {
            kind: ErrorKind::Io,
            errno: unsafe { *libc::__errno_location() },
            cause: None,
            context: None,
        }
    }

    /// Replace the kind of an error.
    #[cfg_attr(debug_assertions, no_alloc)]
    pub fn kind(self, kind: ErrorKind) -> Error {
        Error { kind, ..self }
    }

    /// Replace the cause of an error.
    #[cfg_attr(debug_assertions, no_alloc)]
    pub fn cause(self, msg: &'static str) -> Error {
        Error {
            cause: Some(msg),
            ..self
        }
    }

    /// Replace the context of an error.
    #[cfg_attr(debug_assertions, no_alloc)]
    pub fn context(self, msg: &'static str) -> Error {
        Error {
            context: Some(msg),
            ..self
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Error {
        Error {
            kind: ErrorKind::Io,
            errno: e.raw_os_error().unwrap_or(0),
            cause: None,
            context: None,
        }
    }
}

impl From<DecodeError> for Error {
    fn from(e: DecodeError) -> Error {
        Error::new(ErrorKind::Decode(e)).cause("failed to decode namespace configuration")
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        if let Some(context) = self.context {
            write!(f, "{context}: ")?;
        }
        if let Some(cause) = self.cause {
            write!(f, "{cause}: ")?;
        }
        write!(f, "{}", self.kind)?;

        if self.errno != 0 {
            // Get the error message from errno.
            let error_msg = unsafe { libc::strerror(self.errno) };
            let error_msg_len = unsafe { libc::strlen(error_msg) };
            let error_msg_str: &str = unsafe {
                std::str::from_utf8_unchecked(std::slice::from_raw_parts(
                    error_msg as *const u8,
                    error_msg_len,
                ))
            };
            write!(f, ": {} (errno {})", error_msg_str, self.errno)?;
        }

        Ok(())
    }
}

impl std::error::Error for Error {}

// Define a macro, bail!, which returns an error of a given kind with no errno and a custom
// message.
macro_rules! bail {
    ($kind:expr, $msg:expr) => {
        return Err($crate::error::Error::new($kind).cause($msg))
    };
}
pub(crate) use bail;

// Define a macro, bail_errno!, which returns an error with the last OS error:
//
// - `bail_errno!(kind, msg)` returns an error of `kind` with the last OS error and a cause.
// - `bail_errno!(msg)` does the same, with kind `Io`.
macro_rules! bail_errno {
    ($kind:expr, $msg:expr) => {
        return Err($crate::error::Error::last_os_error()
            .kind($kind)
            .cause($msg))
    };
    ($msg:expr) => {
        return Err($crate::error::Error::last_os_error().cause($msg))
    };
}
pub(crate) use bail_errno;
