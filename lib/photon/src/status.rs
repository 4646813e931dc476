use std::fmt;
use std::io;

/// How bad the outcome is. `Ok` statuses may still carry an informational
/// code such as `Retry` or `Continue`.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Severity {
    Ok,
    Error,
    Fatal,
}

/// The closed set of outcome codes used by every layer of the client.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Code {
    None,
    /// The operation could not be completed in full and must be re-entered
    /// once the socket becomes ready again. Not an error.
    Retry,
    /// The operation succeeded but more rounds are needed. Not an error.
    Continue,
    InvalidArgument,
    InvalidOperation,
    SocketError,
    SocketTimeout,
    SocketDisconnected,
    HandshakeFailed,
    LoginFailed,
    AuthFailed,
    StreamDisconnect,
    StreamConnect,
    ConnectionError,
    PollerError,
    NoMoreFreeSIDs,
    InvalidResponse,
    NotFound,
    Cancelled,
    Unsupported,
}

/// Outcome carrier used uniformly across the client. Socket level failures
/// additionally record the OS errno.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Status {
    pub severity: Severity,
    pub code: Code,
    pub errno: i32,
}

impl Status {
    #[inline]
    pub fn new(severity: Severity, code: Code) -> Status {
        Status {
            severity,
            code,
            errno: 0,
        }
    }

    /// Plain success.
    #[inline]
    pub fn ok() -> Status {
        Status::new(Severity::Ok, Code::None)
    }

    /// Success, but the operation needs to be re-entered (short read or
    /// short write).
    #[inline]
    pub fn retry() -> Status {
        Status::new(Severity::Ok, Code::Retry)
    }

    /// Success, but more rounds are required to finish the exchange.
    #[inline]
    pub fn more() -> Status {
        Status::new(Severity::Ok, Code::Continue)
    }

    #[inline]
    pub fn error(code: Code) -> Status {
        Status::new(Severity::Error, code)
    }

    #[inline]
    pub fn fatal(code: Code) -> Status {
        Status::new(Severity::Fatal, code)
    }

    #[inline]
    pub fn with_errno(mut self, errno: i32) -> Status {
        self.errno = errno;
        self
    }

    #[inline]
    pub fn is_ok(&self) -> bool {
        self.severity == Severity::Ok
    }

    #[inline]
    pub fn is_retry(&self) -> bool {
        self.severity == Severity::Ok && self.code == Code::Retry
    }

    #[inline]
    pub fn is_continue(&self) -> bool {
        self.severity == Severity::Ok && self.code == Code::Continue
    }

    /// True for anything that is neither success nor a transient retry.
    #[inline]
    pub fn has_failed(&self) -> bool {
        self.severity != Severity::Ok
    }
}

impl Default for Status {
    #[inline]
    fn default() -> Status {
        Status::ok()
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.errno != 0 {
            write!(f, "{:?}/{:?} (errno {})", self.severity, self.code, self.errno)
        } else {
            write!(f, "{:?}/{:?}", self.severity, self.code)
        }
    }
}

impl From<io::Error> for Status {
    /// `WouldBlock` folds into the retry outcome, everything else is a
    /// socket error with the OS errno attached.
    #[inline]
    fn from(err: io::Error) -> Status {
        match err.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => Status::retry(),
            _ => Status::error(Code::SocketError).with_errno(err.raw_os_error().unwrap_or(0)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ok_retry_continue() {
        assert!(Status::ok().is_ok());
        assert!(!Status::ok().is_retry());
        assert!(Status::retry().is_ok());
        assert!(Status::retry().is_retry());
        assert!(Status::more().is_continue());
        assert!(!Status::retry().has_failed());
    }

    #[test]
    fn test_errors_fail() {
        let status = Status::error(Code::SocketTimeout);

        assert!(!status.is_ok());
        assert!(status.has_failed());
        assert_eq!(status.code, Code::SocketTimeout);
    }

    #[test]
    fn test_would_block_folds_to_retry() {
        let status: Status = io::Error::from(io::ErrorKind::WouldBlock).into();

        assert!(status.is_retry());
    }

    #[test]
    fn test_io_error_carries_errno() {
        let status: Status = io::Error::from_raw_os_error(104).into();

        assert!(status.has_failed());
        assert_eq!(status.code, Code::SocketError);
        assert_eq!(status.errno, 104);
    }
}
