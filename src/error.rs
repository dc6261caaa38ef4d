use std::fmt;

use thiserror::Error as ThisError;

/// Canonical error kinds surfaced by the runtime.
///
/// Socket errnos and `getaddrinfo` failures are translated to one of these
/// kinds; see [`Error::from_errno`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidArgument,
    NotFound,
    AlreadyExists,
    ResourceExhausted,
    FailedPrecondition,
    Unavailable,
    Cancelled,
    Unimplemented,
    Aborted,
    PermissionDenied,
    OutOfRange,
    Internal,
}

impl ErrorKind {
    pub fn name(self) -> &'static str {
        match self {
            ErrorKind::InvalidArgument => "invalid argument",
            ErrorKind::NotFound => "not found",
            ErrorKind::AlreadyExists => "already exists",
            ErrorKind::ResourceExhausted => "resource exhausted",
            ErrorKind::FailedPrecondition => "failed precondition",
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Unimplemented => "unimplemented",
            ErrorKind::Aborted => "aborted",
            ErrorKind::PermissionDenied => "permission denied",
            ErrorKind::OutOfRange => "out of range",
            ErrorKind::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Runtime error: a canonical kind plus a human-readable message.
///
/// Cloneable so it can be recorded as a connection's `last_error` and handed
/// to close handlers at the same time.
#[derive(Debug, Clone, ThisError)]
#[error("{kind}: {message}")]
pub struct Error {
    kind: ErrorKind,
    message: String,
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Close handlers receive the status the connection closed with.
pub type Status = std::result::Result<(), Error>;

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Error {
            kind,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Prefixes the message with additional context.
    pub fn annotate(mut self, context: impl AsRef<str>) -> Self {
        self.message = format!("{}: {}", context.as_ref(), self.message);
        self
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Error::new(ErrorKind::InvalidArgument, message)
    }
    pub fn not_found(message: impl Into<String>) -> Self {
        Error::new(ErrorKind::NotFound, message)
    }
    pub fn already_exists(message: impl Into<String>) -> Self {
        Error::new(ErrorKind::AlreadyExists, message)
    }
    pub fn resource_exhausted(message: impl Into<String>) -> Self {
        Error::new(ErrorKind::ResourceExhausted, message)
    }
    pub fn failed_precondition(message: impl Into<String>) -> Self {
        Error::new(ErrorKind::FailedPrecondition, message)
    }
    pub fn unavailable(message: impl Into<String>) -> Self {
        Error::new(ErrorKind::Unavailable, message)
    }
    pub fn cancelled(message: impl Into<String>) -> Self {
        Error::new(ErrorKind::Cancelled, message)
    }
    pub fn unimplemented(message: impl Into<String>) -> Self {
        Error::new(ErrorKind::Unimplemented, message)
    }
    pub fn aborted(message: impl Into<String>) -> Self {
        Error::new(ErrorKind::Aborted, message)
    }
    pub fn permission_denied(message: impl Into<String>) -> Self {
        Error::new(ErrorKind::PermissionDenied, message)
    }
    pub fn out_of_range(message: impl Into<String>) -> Self {
        Error::new(ErrorKind::OutOfRange, message)
    }
    pub fn internal(message: impl Into<String>) -> Self {
        Error::new(ErrorKind::Internal, message)
    }

    /// Translates a raw errno value to an error with the canonical kind.
    pub fn from_errno(errno: i32) -> Self {
        let description = errno_string(errno);
        Error::new(errno_kind(errno), description)
    }

    /// Translates the calling thread's last OS error.
    pub fn last_os_error() -> Self {
        Error::from_errno(last_errno())
    }
}

/// The calling thread's current errno value.
pub fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

/// Human-readable description of an errno value.
pub fn errno_string(errno: i32) -> String {
    std::io::Error::from_raw_os_error(errno).to_string()
}

/// True for errno values that mean "would block, retry later" rather than a
/// hard failure. Socket reads and writes treat these as zero-byte results.
pub fn is_retryable_errno(errno: i32) -> bool {
    errno == libc::EAGAIN || errno == libc::EWOULDBLOCK
}

fn errno_kind(mut errno: i32) -> ErrorKind {
    // EAGAIN and EWOULDBLOCK may share a value; normalize before matching.
    if errno == libc::EWOULDBLOCK {
        errno = libc::EAGAIN;
    }
    match errno {
        libc::EAGAIN | libc::EADDRNOTAVAIL => ErrorKind::Unavailable,
        libc::ECANCELED => ErrorKind::Cancelled,
        libc::EACCES | libc::EPERM => ErrorKind::PermissionDenied,
        libc::ECHRNG | libc::ERANGE => ErrorKind::OutOfRange,
        libc::EBADE
        | libc::EBADF
        | libc::EBADFD
        | libc::EBADMSG
        | libc::EBADR
        | libc::EBADRQC
        | libc::EBADSLT
        | libc::EDESTADDRREQ
        | libc::EDOM
        | libc::EMSGSIZE
        | libc::ENAMETOOLONG
        | libc::EISDIR
        | libc::EINVAL
        | libc::EISNAM
        | libc::E2BIG
        | libc::EFBIG
        | libc::ENOTSOCK
        | libc::ENXIO => ErrorKind::InvalidArgument,
        libc::ECONNABORTED => ErrorKind::Aborted,
        libc::EADDRINUSE | libc::EEXIST => ErrorKind::AlreadyExists,
        libc::ENOENT | libc::ESRCH => ErrorKind::NotFound,
        libc::ENFILE
        | libc::EDQUOT
        | libc::EMLINK
        | libc::EMFILE
        | libc::ENOSPC
        | libc::EUSERS
        | libc::EXFULL
        | libc::ENOLCK
        | libc::ENOMEM => ErrorKind::ResourceExhausted,
        libc::ESOCKTNOSUPPORT
        | libc::EAFNOSUPPORT
        | libc::ENOPROTOOPT
        | libc::ENOSYS
        | libc::ENOTSUP
        | libc::EPFNOSUPPORT
        | libc::EPROTONOSUPPORT => ErrorKind::Unimplemented,
        _ => ErrorKind::Internal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_translation() {
        assert_eq!(Error::from_errno(libc::EINVAL).kind(), ErrorKind::InvalidArgument);
        assert_eq!(Error::from_errno(libc::EAGAIN).kind(), ErrorKind::Unavailable);
        assert_eq!(Error::from_errno(libc::EWOULDBLOCK).kind(), ErrorKind::Unavailable);
        assert_eq!(Error::from_errno(libc::EMFILE).kind(), ErrorKind::ResourceExhausted);
        assert_eq!(Error::from_errno(libc::EADDRINUSE).kind(), ErrorKind::AlreadyExists);
        assert_eq!(Error::from_errno(libc::ENOENT).kind(), ErrorKind::NotFound);
        assert_eq!(Error::from_errno(libc::EPERM).kind(), ErrorKind::PermissionDenied);
        assert_eq!(Error::from_errno(libc::ECONNRESET).kind(), ErrorKind::Internal);
    }

    #[test]
    fn retryable() {
        assert!(is_retryable_errno(libc::EAGAIN));
        assert!(is_retryable_errno(libc::EWOULDBLOCK));
        assert!(!is_retryable_errno(libc::EPIPE));
    }

    #[test]
    fn annotate_prefixes() {
        let err = Error::invalid_argument("bad port").annotate("parsing hostport");
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert!(err.to_string().contains("parsing hostport: bad port"));
    }
}
