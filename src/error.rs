//! `postline` error types.
use std::{backtrace::Backtrace, fmt, io, str::Utf8Error, sync::Arc};

use crate::{
    config::ConfigError,
    postgres::{DatabaseError, ProtocolError},
    scram::ScramError,
    session::UnsupportedAuth,
};

/// A specialized [`Result`] type for `postline` operation.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// All possible error from `postline` library.
pub struct Error {
    context: String,
    backtrace: Backtrace,
    kind: ErrorKind,
}

impl Error {
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }

    pub(crate) fn into_kind(self) -> ErrorKind {
        self.kind
    }

    /// Returns the backend error if this error originates from an
    /// `ErrorResponse` message.
    pub fn as_database(&self) -> Option<&DatabaseError> {
        match &self.kind {
            ErrorKind::Database(e) => Some(e),
            _ => None,
        }
    }

    pub(crate) fn closed(reason: &'static str) -> Error {
        ErrorKind::Closed(reason).into()
    }

    /// Session-fatal transport error, cloneable so it can be fanned out to
    /// every pending query.
    pub(crate) fn broken(source: &Arc<io::Error>) -> Error {
        ErrorKind::Broken(Arc::clone(source)).into()
    }
}

/// All possible error kind from `postline` library.
pub enum ErrorKind {
    /// Configuration parse or validation failure.
    Config(ConfigError),
    /// Malformed or unexpected backend message.
    Protocol(ProtocolError),
    Io(io::Error),
    /// Backend `ErrorResponse`.
    Database(DatabaseError),
    Utf8(Utf8Error),
    /// Authentication variant the session does not implement.
    UnsupportedAuth(UnsupportedAuth),
    /// SASL/SCRAM exchange failure.
    Scram(ScramError),
    /// The password producer failed.
    Password(Box<dyn std::error::Error + Send + Sync>),
    /// The connect deadline fired before the first `ReadyForQuery`.
    ConnectTimeout,
    /// The per-query read timeout fired before the query completed.
    QueryTimeout,
    /// The session can no longer accept work.
    Closed(&'static str),
    /// Transport failure, shared by every query it killed.
    Broken(Arc<io::Error>),
}

macro_rules! from {
    (<$ty:ty>$pat:pat => $body:expr) => {
        impl From<$ty> for Error {
            fn from($pat: $ty) -> Self {
                let backtrace = std::backtrace::Backtrace::capture();
                Self { context: String::new(), backtrace, kind: $body }
            }
        }
    };
}

from!(<ErrorKind>e => e);
from!(<ConfigError>e => ErrorKind::Config(e));
from!(<ProtocolError>e => ErrorKind::Protocol(e));
from!(<io::Error>e => ErrorKind::Io(e));
from!(<DatabaseError>e => ErrorKind::Database(e));
from!(<Utf8Error>e => ErrorKind::Utf8(e));
from!(<UnsupportedAuth>e => ErrorKind::UnsupportedAuth(e));
from!(<ScramError>e => ErrorKind::Scram(e));

impl std::error::Error for Error { }

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.context.is_empty() {
            write!(f, "{}: ", self.context)?;
        }

        fmt::Display::fmt(&self.kind, f)?;

        if let std::backtrace::BacktraceStatus::Captured = self.backtrace.status() {
            let mut backtrace = self.backtrace.to_string();
            write!(f, "\n\n")?;
            writeln!(f, "Stack backtrace:")?;
            backtrace.truncate(backtrace.trim_end().len());
            write!(f, "{}", backtrace)?;
        }

        Ok(())
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

impl std::error::Error for ErrorKind { }

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(e) => e.fmt(f),
            Self::Protocol(e) => e.fmt(f),
            Self::Io(e) => e.fmt(f),
            Self::Database(e) => e.fmt(f),
            Self::Utf8(e) => e.fmt(f),
            Self::UnsupportedAuth(e) => e.fmt(f),
            Self::Scram(e) => e.fmt(f),
            Self::Password(e) => write!(f, "password producer failed: {e}"),
            Self::ConnectTimeout => f.write_str("timeout expired"),
            Self::QueryTimeout => f.write_str("query read timeout"),
            Self::Closed(reason) => f.write_str(reason),
            Self::Broken(e) => write!(f, "connection broken: {e}"),
        }
    }
}

impl fmt::Debug for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}
