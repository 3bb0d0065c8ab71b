use std::fmt::Display;
use std::{fmt, io, result};
use std::net::AddrParseError;
use std::sync::PoisonError;


#[derive(Debug, PartialEq, Eq)]
pub struct Error {
    err: Box<ErrorKind>, // use a Box to keep the Result type smaller
}

/// Whether a failed backend connection may be retried later (Transient)
/// or should be excluded for the rest of the session (Permanent).
#[derive(strum::Display, Debug, Copy, Clone, Eq, PartialEq)]
pub enum ErrorType {
    Transient,
    Permanent,
}

/// An error that is reported to the client as an ERR packet without ending the session.
#[derive(Debug, Clone)]
pub struct QueryError {
    pub code: u16,
    pub sql_state: &'static str,
    pub message: String,
}

#[derive(Debug)]
pub enum ErrorKind {
    TooBusyError,
    Timeout,
    PoisonError,
    ClosedError,
    StringError(String),
    ProtocolError(String),
    BackendError(ErrorType, String),
    QueryError(QueryError),
    IOError(io::Error),
    JSONError(serde_json::Error),
    YAMLError(serde_yaml::Error),
    TlsError(rustls::Error),
    UTF8Error(std::str::Utf8Error),
    ArrayFromSliceError(std::array::TryFromSliceError),
}

pub type Result<T> = result::Result<T, Error>;

impl Error {
    pub fn new<S: ToString>(s: S) -> Self {
        Error {
            err: Box::new(ErrorKind::StringError(s.to_string())),
        }
    }

    pub fn protocol_error<S: ToString>(s: S) -> Self {
        Error {
            err: Box::new(ErrorKind::ProtocolError(s.to_string())),
        }
    }

    pub fn backend<S: ToString>(ty: ErrorType, s: S) -> Self {
        Error {
            err: Box::new(ErrorKind::BackendError(ty, s.to_string())),
        }
    }

    /// An error the client sees as an ERR packet; the session survives it.
    pub fn query_error<S: ToString>(code: u16, sql_state: &'static str, s: S) -> Self {
        Error {
            err: Box::new(ErrorKind::QueryError(QueryError {
                code,
                sql_state,
                message: s.to_string(),
            })),
        }
    }

    pub fn too_busy() -> Self {
        Error {
            err: Box::new(ErrorKind::TooBusyError),
        }
    }

    pub fn closed() -> Self {
        Error {
            err: Box::new(ErrorKind::ClosedError),
        }
    }

    pub fn timeout() -> Self {
        Error {
            err: Box::new(ErrorKind::Timeout),
        }
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.err
    }

    /// Returns the QueryError if this error should be sent to the client without closing the session.
    pub fn as_query_error(&self) -> Option<&QueryError> {
        match self.kind() {
            ErrorKind::QueryError(e) => Some(e),
            _ => None,
        }
    }

    pub fn error_type(&self) -> ErrorType {
        match self.kind() {
            ErrorKind::BackendError(ty, _) => *ty,
            ErrorKind::IOError(_) | ErrorKind::Timeout | ErrorKind::ClosedError => ErrorType::Transient,
            _ => ErrorType::Permanent,
        }
    }
}

impl From<&str> for Error {
    fn from(err: &str) -> Self {
        Error {
            err: Box::new(ErrorKind::StringError(String::from(err))),
        }
    }
}

impl From<String> for Error {
    fn from(err: String) -> Self {
        Error {
            err: Box::new(ErrorKind::StringError(err)),
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error {
            err: Box::new(ErrorKind::IOError(err)),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error {
            err: Box::new(ErrorKind::JSONError(err)),
        }
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Error {
            err: Box::new(ErrorKind::YAMLError(err)),
        }
    }
}

impl From<std::str::Utf8Error> for Error {
    fn from(err: std::str::Utf8Error) -> Self {
        Error {
            err: Box::new(ErrorKind::UTF8Error(err)),
        }
    }
}

impl From<std::array::TryFromSliceError> for Error {
    fn from(err: std::array::TryFromSliceError) -> Self {
        Error {
            err: Box::new(ErrorKind::ArrayFromSliceError(err)),
        }
    }
}

impl From<AddrParseError> for Error {
    fn from(err: AddrParseError) -> Self {
        Error::new(err)
    }
}

impl From<std::num::ParseIntError> for Error {
    fn from(err: std::num::ParseIntError) -> Self {
        Error::new(err)
    }
}

impl<Guard> From<PoisonError<Guard>> for Error {
    fn from(_: PoisonError<Guard>) -> Self {
        Error {
            err: Box::new(ErrorKind::PoisonError),
        }
    }
}

impl From<rustls::Error> for Error {
    fn from(err: rustls::Error) -> Self {
        Error {
            err: Box::new(ErrorKind::TlsError(err)),
        }
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        std::fmt::Display::fmt(&self.err, f)
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ErrorKind::TooBusyError => f.write_str("server is too busy to handle this request"),
            ErrorKind::ClosedError => f.write_str("socket/file is closed"),
            ErrorKind::PoisonError => f.write_str("another thread panicked while holding the mutex"),
            ErrorKind::StringError(s) => f.write_str(s),
            ErrorKind::ProtocolError(s) => write!(f, "protocol error: {}", s),
            ErrorKind::BackendError(ty, s) => write!(f, "{} backend error: {}", ty, s),
            ErrorKind::QueryError(e) => write!(f, "#{} ({}): {}", e.code, e.sql_state, &e.message),
            ErrorKind::IOError(e) => std::fmt::Display::fmt(&e, f),
            ErrorKind::JSONError(e) => std::fmt::Display::fmt(&e, f),
            ErrorKind::YAMLError(e) => std::fmt::Display::fmt(&e, f),
            ErrorKind::TlsError(e) => std::fmt::Display::fmt(&e, f),
            ErrorKind::UTF8Error(e) => std::fmt::Display::fmt(&e, f),
            ErrorKind::ArrayFromSliceError(e) => std::fmt::Display::fmt(&e, f),
            ErrorKind::Timeout => f.write_str("operation timed out"),
        }
    }
}

impl PartialEq for ErrorKind {
    fn eq(&self, other: &Self) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }
}

impl Eq for ErrorKind {}
