//! Postgres Frontend and Backend Protocol
//!
//! Docs here mostly quoted from the official postgres documentation.
//!
//! All communication is through a stream of messages. The first byte of a
//! message identifies the message type, and the next four bytes specify the
//! length of the rest of the message (this length count includes itself, but
//! not the message-type byte). The remaining contents of the message are
//! determined by the message type.
//!
//! For historical reasons, the very first message sent by the client (the
//! startup message) has no initial message-type byte; neither do `SSLRequest`
//! and `CancelRequest`, which reuse the startup slot with magic version
//! numbers.
//!
//! <https://www.postgresql.org/docs/17/protocol-overview.html>

pub mod frontend;
pub mod backend;

mod error;

pub use frontend::FrontendProtocol;
pub use backend::{BackendMessage, BackendProtocol, ErrorResponse, NoticeResponse};
pub use error::{DatabaseError, ProtocolError};

/// Object ID of a postgres type.
pub type Oid = u32;

/// Data of a particular data type might be transmitted in any of several
/// different formats. As of PostgreSQL 7.4 the only supported formats are
/// "text" and "binary". Text has format code zero, binary has format code one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PgFormat {
    Text,
    Binary,
}

impl PgFormat {
    pub fn format_code(self) -> u16 {
        match self {
            Self::Text => 0,
            Self::Binary => 1,
        }
    }

    pub fn from_code(code: u16) -> PgFormat {
        match code {
            1 => Self::Binary,
            _ => Self::Text,
        }
    }
}
