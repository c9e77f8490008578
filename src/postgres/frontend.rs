//! Postgres Frontend Messages
//!
//! All struct fields here mirror the actual message sent to postgres.
use bytes::{BufMut, BytesMut};

use crate::ext::{BufMutExt, StrExt, UsizeExt};

use super::PgFormat;

/// write a frontend message to `buf`
pub fn write<F: FrontendProtocol>(msg: F, buf: &mut BytesMut) {
    // msgtype + length
    const PREFIX: usize = 1 + 4;

    let size = msg.size_hint();
    buf.reserve(PREFIX + size as usize);

    let offset = buf.len();
    buf.put_u8(F::MSGTYPE);
    buf.put_i32(4 + size);

    msg.encode(&mut *buf);

    assert_eq!(
        buf.len() - offset,
        PREFIX + size as usize,
        "[BUG] Frontend Message body not equal to size hint"
    );
}

/// A type which can be encoded into postgres frontend message
///
/// For historical reasons, the very first message sent by the client (the
/// startup message) has no initial message-type byte.
///
/// Thus, [`Startup`], [`SslRequest`] and [`CancelRequest`] do not implement
/// [`FrontendProtocol`]
pub trait FrontendProtocol {
    /// message type
    const MSGTYPE: u8;

    /// size of the main body
    ///
    /// note that this is *only* the size of main body as oppose of actual
    /// postgres message
    fn size_hint(&self) -> i32;

    /// write the main body of the message
    ///
    /// `buf` have the length returned from `size_hint`
    ///
    /// writing less or past length results in panic
    fn encode(self, buf: impl BufMut);
}

/// Postgres Startup frontend message
///
/// For historical reasons, the very first message sent by the client (the
/// startup message) has no initial message-type byte.
#[derive(Debug)]
pub struct Startup<'a> {
    /// Parameter name and value pairs.
    ///
    /// `user` is required; there is no default. Parameter names beginning
    /// with `_pq_.` are reserved for protocol extensions, while others are
    /// treated as run-time parameters to be set at backend start time.
    pub params: &'a [(&'a str, &'a str)],
}

impl Startup<'_> {
    pub fn write(self, buf: &mut BytesMut) {
        let offset = buf.len();

        // Length of message contents in bytes, including self.
        // reserve 4 bytes for length
        buf.put_i32(0);

        // Int32(196608)
        // The protocol version number. The most significant 16 bits are the
        // major version number (3 for the protocol described here). The least
        // significant 16 bits are the minor version number (0 for the
        // protocol described here).
        buf.put_i32(196608);

        // The protocol version number is followed by one or more pairs of
        // parameter name and value strings.
        for (name, value) in self.params {
            buf.put_nul_string(name);
            buf.put_nul_string(value);
        }

        // A zero byte is required as a terminator after the last name/value
        // pair.
        buf.put_u8(b'\0');

        // write the length
        let mut written_buf = &mut buf[offset..];
        written_buf.put_i32(written_buf.len().to_i32());
    }
}

/// The SSL request message, sent in place of a startup message to ask the
/// server for TLS.
///
/// The server then responds with a single byte containing S or N, indicating
/// that it is willing or unwilling to perform SSL, respectively.
#[derive(Debug)]
pub struct SslRequest;

impl SslRequest {
    /// The SSL request code.
    ///
    /// The value is chosen to contain 1234 in the most significant 16 bits,
    /// and 5679 in the least significant 16 bits.
    pub const CODE: i32 = 80877103;

    pub fn write(self, buf: &mut BytesMut) {
        buf.put_i32(8);
        buf.put_i32(Self::CODE);
    }
}

/// The cancel request message, sent to a *new* connection in place of a
/// startup message.
///
/// The server will process this request and then close the connection.
#[derive(Debug)]
pub struct CancelRequest {
    /// The process ID of the target backend.
    pub process_id: u32,
    /// The secret key for the target backend.
    pub secret_key: u32,
}

impl CancelRequest {
    /// The cancel request code.
    ///
    /// The value is chosen to contain 1234 in the most significant 16 bits,
    /// and 5678 in the least significant 16 bits. (To avoid confusion, this
    /// code must not be the same as any protocol version number.)
    pub const CODE: i32 = 80877102;

    pub fn write(self, buf: &mut BytesMut) {
        buf.put_i32(16);
        buf.put_i32(Self::CODE);
        buf.put_u32(self.process_id);
        buf.put_u32(self.secret_key);
    }
}

/// Identifies the message as a password response.
///
/// Also used for GSSAPI, SSPI and SASL response messages. The exact message
/// type can be deduced from the context.
#[derive(Debug)]
pub struct PasswordMessage<'a> {
    /// The password (encrypted, if requested).
    pub password: &'a str,
}

impl FrontendProtocol for PasswordMessage<'_> {
    const MSGTYPE: u8 = b'p';

    fn size_hint(&self) -> i32 {
        self.password.nul_string_len()
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_nul_string(self.password);
    }
}

/// Initial SASL response, carrying the selected mechanism and the
/// client-first message of the SASL exchange.
#[derive(Debug)]
pub struct SaslInitialResponse<'a> {
    /// Name of the SASL authentication mechanism that the client selected.
    pub mechanism: &'a str,
    /// SASL mechanism specific "Initial Client Response".
    pub response: &'a [u8],
}

impl FrontendProtocol for SaslInitialResponse<'_> {
    const MSGTYPE: u8 = b'p';

    fn size_hint(&self) -> i32 {
        self.mechanism.nul_string_len() + 4 + self.response.len().to_i32()
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_nul_string(self.mechanism);
        // Length of SASL mechanism specific "Initial Client Response",
        // or -1 if there is no initial response.
        buf.put_i32(self.response.len().to_i32());
        buf.put_slice(self.response);
    }
}

/// SASL response, carrying mechanism specific message data.
#[derive(Debug)]
pub struct SaslResponse<'a> {
    /// SASL mechanism specific message data.
    pub data: &'a [u8],
}

impl FrontendProtocol for SaslResponse<'_> {
    const MSGTYPE: u8 = b'p';

    fn size_hint(&self) -> i32 {
        self.data.len().to_i32()
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_slice(self.data);
    }
}

/// Identifies the message as a simple query
pub struct Query<'a> {
    /// the query string itself
    pub sql: &'a str,
}

impl FrontendProtocol for Query<'_> {
    const MSGTYPE: u8 = b'Q';

    fn size_hint(&self) -> i32 {
        self.sql.nul_string_len()
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_nul_string(self.sql);
    }
}

/// Identifies the message as a Parse command
pub struct Parse<'a> {
    /// prepared statement name (an empty string selects the unnamed prepared
    /// statement).
    pub prepare_name: &'a str,
    /// The query string to be parsed.
    pub sql: &'a str,
    /// Object IDs of prespecified parameter data types.
    ///
    /// Note that this is not an indication of the number of parameters that
    /// might appear in the query string, only the number that the frontend
    /// wants to prespecify types for. Placing a zero here is equivalent to
    /// leaving the type unspecified.
    pub oids: &'a [u32],
}

impl FrontendProtocol for Parse<'_> {
    const MSGTYPE: u8 = b'P';

    fn size_hint(&self) -> i32 {
        self.prepare_name.nul_string_len()
            + self.sql.nul_string_len()
            + 2
            + (self.oids.len().to_i32() * 4)
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_nul_string(self.prepare_name);
        buf.put_nul_string(self.sql);
        buf.put_u16(self.oids.len().to_u16());
        for oid in self.oids {
            buf.put_u32(*oid);
        }
    }
}

/// Identifies the message as a Bind command.
///
/// Parameter values are supplied pre-encoded; `None` is the NULL parameter
/// (wire length -1, no value bytes follow).
pub struct Bind<'a> {
    /// The name of the destination portal (an empty string selects the
    /// unnamed portal).
    pub portal_name: &'a str,
    /// The name of the source prepared statement (an empty string selects the
    /// unnamed prepared statement).
    pub stmt_name: &'a str,
    /// A single format code applied to all parameters.
    pub param_format: PgFormat,
    /// The parameter values, in the format indicated by `param_format`.
    pub params: &'a [Option<bytes::Bytes>],
    /// A single format code applied to all result columns.
    pub result_format: PgFormat,
}

impl FrontendProtocol for Bind<'_> {
    const MSGTYPE: u8 = b'B';

    fn size_hint(&self) -> i32 {
        self.portal_name.nul_string_len()
            + self.stmt_name.nul_string_len()
            // param format code count + one code
            + 2 + 2
            // param count
            + 2
            + self.params.iter().fold(0i32, |acc, p| {
                acc + 4 + p.as_ref().map_or(0, |v| v.len().to_i32())
            })
            // result format code count + one code
            + 2 + 2
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_nul_string(self.portal_name);
        buf.put_nul_string(self.stmt_name);

        buf.put_u16(1);
        buf.put_u16(self.param_format.format_code());

        buf.put_u16(self.params.len().to_u16());
        for param in self.params {
            match param {
                // As a special case, -1 indicates a NULL parameter value.
                // No value bytes follow in the NULL case.
                None => buf.put_i32(-1),
                Some(value) => {
                    buf.put_i32(value.len().to_i32());
                    buf.put_slice(value);
                }
            }
        }

        buf.put_u16(1);
        buf.put_u16(self.result_format.format_code());
    }
}

/// Identifies the message as a Execute command
pub struct Execute<'a> {
    /// The name of the portal to execute (an empty string selects the unnamed
    /// portal).
    pub portal_name: &'a str,
    /// Maximum number of rows to return, if portal contains a query that
    /// returns rows (ignored otherwise). Zero denotes "no limit".
    pub max_row: i32,
}

impl FrontendProtocol for Execute<'_> {
    const MSGTYPE: u8 = b'E';

    fn size_hint(&self) -> i32 {
        self.portal_name.nul_string_len() + 4
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_nul_string(self.portal_name);
        buf.put_i32(self.max_row);
    }
}

/// Identifies the message as a Describe command.
pub struct Describe<'a> {
    /// 'S' to describe a prepared statement; or 'P' to describe a portal.
    pub kind: u8,
    /// The name of the prepared statement or portal to describe (an empty
    /// string selects the unnamed prepared statement or portal).
    pub name: &'a str,
}

impl FrontendProtocol for Describe<'_> {
    const MSGTYPE: u8 = b'D';

    fn size_hint(&self) -> i32 {
        1 + self.name.nul_string_len()
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_u8(self.kind);
        buf.put_nul_string(self.name);
    }
}

/// Identifies the message as a Close command
pub struct Close<'a> {
    /// 'S' to close a prepared statement; or 'P' to close a portal.
    pub variant: u8,
    /// The name of the prepared statement or portal to close (an empty string
    /// selects the unnamed prepared statement or portal).
    pub name: &'a str,
}

impl FrontendProtocol for Close<'_> {
    const MSGTYPE: u8 = b'C';

    fn size_hint(&self) -> i32 {
        1 + self.name.nul_string_len()
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_u8(self.variant);
        buf.put_nul_string(self.name);
    }
}

/// COPY data sent from the frontend.
pub struct CopyData<'a> {
    /// Data that forms part of a COPY data stream.
    ///
    /// Messages sent from the frontend might divide the data stream
    /// arbitrarily.
    pub data: &'a [u8],
}

impl FrontendProtocol for CopyData<'_> {
    const MSGTYPE: u8 = b'd';

    fn size_hint(&self) -> i32 {
        self.data.len().to_i32()
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_slice(self.data);
    }
}

/// Identifies the message as a COPY failure indicator.
pub struct CopyFail<'a> {
    /// An error message to report as the cause of failure.
    pub message: &'a str,
}

impl FrontendProtocol for CopyFail<'_> {
    const MSGTYPE: u8 = b'f';

    fn size_hint(&self) -> i32 {
        self.message.nul_string_len()
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_nul_string(self.message);
    }
}

macro_rules! unit_msg {
    ($(
        $(#[$doc:meta])* struct $name:ident, $ty:literal;
    )*) => {$(
            $(#[$doc])*
            pub struct $name;

            impl FrontendProtocol for $name {
                const MSGTYPE: u8 = $ty;

                fn size_hint(&self) -> i32 { 0 }

                fn encode(self, _: impl BufMut) { }
            }
    )*};
}

unit_msg! {
    /// Identifies the message as a COPY-complete indicator.
    struct CopyDone, b'c';

    /// Identifies the message as a Flush command
    struct Flush, b'H';

    /// Identifies the message as a Sync command
    struct Sync, b'S';

    /// Identifies the message as a termination.
    struct Terminate, b'X';
}

#[cfg(test)]
mod test {
    use bytes::BytesMut;

    use super::*;

    #[test]
    fn password_message_framing() {
        let mut buf = BytesMut::new();
        write(PasswordMessage { password: "s3cret" }, &mut buf);
        assert_eq!(&buf[..], b"p\x00\x00\x00\x0bs3cret\x00");
    }

    #[test]
    fn startup_params_layout() {
        let mut buf = BytesMut::new();
        Startup { params: &[("user", "alice"), ("database", "db")] }.write(&mut buf);

        // length prefix covers the whole message
        assert_eq!(buf[..4], (buf.len() as i32).to_be_bytes());
        // protocol version 3.0
        assert_eq!(buf[4..8], 196608i32.to_be_bytes());
        assert_eq!(&buf[8..], b"user\0alice\0database\0db\0\0");
    }

    #[test]
    fn cancel_request_layout() {
        let mut buf = BytesMut::new();
        CancelRequest { process_id: 42, secret_key: 7 }.write(&mut buf);
        let mut expect = Vec::new();
        expect.extend_from_slice(&16i32.to_be_bytes());
        expect.extend_from_slice(&80877102i32.to_be_bytes());
        expect.extend_from_slice(&42u32.to_be_bytes());
        expect.extend_from_slice(&7u32.to_be_bytes());
        assert_eq!(&buf[..], expect);
    }

    #[test]
    fn sasl_initial_response_framing() {
        let mut buf = BytesMut::new();
        write(
            SaslInitialResponse { mechanism: "SCRAM-SHA-256", response: b"n,,n=*,r=abc" },
            &mut buf,
        );
        assert_eq!(buf[0], b'p');
        assert!(buf[..].ends_with(b"SCRAM-SHA-256\0\x00\x00\x00\x0cn,,n=*,r=abc"));
    }

    #[test]
    fn bind_null_parameter() {
        let mut buf = BytesMut::new();
        write(
            Bind {
                portal_name: "",
                stmt_name: "q1",
                param_format: PgFormat::Text,
                params: &[None, Some(bytes::Bytes::from_static(b"14"))],
                result_format: PgFormat::Text,
            },
            &mut buf,
        );
        // portal nul, stmt "q1" nul, 1 format code (text), 2 params:
        // NULL (-1) then 2-byte value
        let body = &buf[5..];
        assert_eq!(&body[..4], b"\0q1\0");
        assert_eq!(body[4..8], [0, 1, 0, 0]);
        assert_eq!(body[8..10], 2u16.to_be_bytes());
        assert_eq!(body[10..14], (-1i32).to_be_bytes());
        assert_eq!(body[14..18], 2i32.to_be_bytes());
        assert_eq!(&body[18..20], b"14");
    }
}
