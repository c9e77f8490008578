//! Protocol level errors.
use bytes::{Buf, Bytes};
use std::fmt;

use super::backend::BackendMessage;
use crate::common::ByteStr;

/// An error when translating buffer from postgres
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProtocolError {
    #[error("{}", unexpected_display(.expect, .found, .phase))]
    Unexpected {
        expect: Option<u8>,
        found: u8,
        phase: Option<&'static str>,
    },
    #[error("unknown authentication request variant ({auth})")]
    UnknownAuth {
        auth: u32,
    },
    #[error("message field is not valid utf-8")]
    Utf8(#[from] std::str::Utf8Error),
}

fn unexpected_display(expect: &Option<u8>, found: &u8, phase: &Option<&'static str>) -> String {
    let found_name = BackendMessage::message_name(*found);
    let mut msg = match expect {
        Some(expect) => format!(
            "unexpected message: expected {}, found {found_name} ({:?})",
            BackendMessage::message_name(*expect),
            *found as char,
        ),
        None => format!("unknown or unexpected message {found_name} ({:?})", *found as char),
    };
    if let Some(phase) = phase {
        msg.push_str(" in ");
        msg.push_str(phase);
    }
    msg
}

impl ProtocolError {
    pub(crate) fn unknown(found: u8) -> ProtocolError {
        Self::Unexpected {
            expect: None,
            found,
            phase: None,
        }
    }

    pub(crate) fn unexpected(expect: u8, found: u8) -> ProtocolError {
        Self::Unexpected {
            expect: Some(expect),
            found,
            phase: None,
        }
    }

    pub(crate) fn unexpected_phase(found: u8, phase: &'static str) -> ProtocolError {
        Self::Unexpected {
            expect: None,
            found,
            phase: Some(phase),
        }
    }

    pub(crate) fn unknown_auth(auth: u32) -> ProtocolError {
        Self::UnknownAuth { auth }
    }

    pub(crate) fn utf8(err: std::str::Utf8Error) -> ProtocolError {
        Self::Utf8(err)
    }
}

/// An error reported by the backend via `ErrorResponse`, or the payload of a
/// `NoticeResponse` (both share the tagged-field body layout).
#[derive(Debug, Clone, Default)]
pub struct DatabaseError {
    /// Always present: ERROR, FATAL, PANIC, or for notices WARNING, NOTICE,
    /// DEBUG, INFO, LOG.
    pub severity: ByteStr,
    /// The SQLSTATE code.
    pub code: ByteStr,
    /// The primary human-readable error message.
    pub message: ByteStr,
    pub detail: Option<ByteStr>,
    pub hint: Option<ByteStr>,
    pub position: Option<u32>,
    pub constraint: Option<ByteStr>,
    pub table: Option<ByteStr>,
    pub column: Option<ByteStr>,
}

impl DatabaseError {
    /// Parse the tagged fields of an `ErrorResponse`/`NoticeResponse` body.
    ///
    /// Unrecognized field tags are silently ignored, as the protocol demands.
    pub fn parse(mut body: Bytes) -> DatabaseError {
        let mut err = DatabaseError::default();

        while body.has_remaining() {
            let tag = body.get_u8();
            if tag == 0 {
                break;
            }
            let end = match body.iter().position(|b| *b == 0) {
                Some(end) => end,
                None => break,
            };
            let value = body.split_to(end);
            body.advance(1); // nul
            let Ok(value) = ByteStr::from_utf8(value) else {
                continue;
            };
            match tag {
                b'S' => err.severity = value,
                b'C' => err.code = value,
                b'M' => err.message = value,
                b'D' => err.detail = Some(value),
                b'H' => err.hint = Some(value),
                b'P' => err.position = value.parse().ok(),
                b'n' => err.constraint = Some(value),
                b't' => err.table = Some(value),
                b'c' => err.column = Some(value),
                _ => {}
            }
        }

        err
    }
}

impl std::error::Error for DatabaseError { }

impl fmt::Display for DatabaseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.severity, self.message)?;
        if !self.code.is_empty() {
            write!(f, " ({})", self.code)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_error_fields() {
        let body = Bytes::from_static(
            b"SERROR\0C42P01\0Mrelation \"foo\" does not exist\0P15\0ttable\0\0",
        );
        let err = DatabaseError::parse(body);
        assert_eq!(err.severity, "ERROR");
        assert_eq!(err.code, "42P01");
        assert_eq!(err.message, "relation \"foo\" does not exist");
        assert_eq!(err.position, Some(15));
        assert_eq!(err.table.as_deref(), Some("table"));
        assert_eq!(
            err.to_string(),
            "ERROR: relation \"foo\" does not exist (42P01)",
        );
    }

    #[test]
    fn unknown_tags_ignored() {
        let body = Bytes::from_static(b"SFATAL\0Zmystery\0Mbad\0\0");
        let err = DatabaseError::parse(body);
        assert_eq!(err.severity, "FATAL");
        assert_eq!(err.message, "bad");
    }
}
