//! The buffered message stream over a [`Socket`].
use bytes::{Buf, BytesMut};
use lru::LruCache;
use std::{
    io,
    num::NonZeroUsize,
    task::{Context, Poll, ready},
};

use crate::{
    Result,
    common::ByteStr,
    net::{ChannelBinding, Socket},
    postgres::{
        BackendProtocol, ErrorResponse, FrontendProtocol, NoticeResponse,
        backend::BackendMessage, frontend,
    },
    transport::PgTransport,
};

const DEFAULT_BUF_CAPACITY: usize = 1024;
const DEFAULT_PREPARED_STMT_CACHE: NonZeroUsize = NonZeroUsize::new(24).unwrap();

/// A [`Socket`] with read and write message buffers and the prepared
/// statement map of this transport.
///
/// A new transport starts with an empty statement map.
pub struct Stream {
    // io
    socket: Socket,
    read_buf: BytesMut,
    write_buf: BytesMut,

    // name -> statement text already parsed on this connection
    stmts: LruCache<ByteStr, ByteStr>,
}

macro_rules! poll_message {
    (
        poll($io:ident, $cx:ident);
        let $msgtype:ident;
        let $body:ident;
    ) => {
        let Some(mut header) = $io.read_buf.get(..5) else {
            $io.read_buf.reserve(1024);
            let n = ready!(crate::io::poll_read(&mut $io.socket, &mut $io.read_buf, $cx)?);
            if n == 0 {
                return Poll::Ready(Err(io::Error::from(io::ErrorKind::UnexpectedEof).into()));
            }
            continue;
        };

        let $msgtype = header.get_u8();
        let len = header.get_i32() as usize;

        if $io.read_buf.len() - 1/*msgtype*/ < len {
            $io.read_buf.reserve(1 + len);
            let n = ready!(crate::io::poll_read(&mut $io.socket, &mut $io.read_buf, $cx)?);
            if n == 0 {
                return Poll::Ready(Err(io::Error::from(io::ErrorKind::UnexpectedEof).into()));
            }
            continue;
        }

        $io.read_buf.advance(5);
        let $body = $io.read_buf.split_to(len - 4).freeze();
    };
}

impl Stream {
    pub fn new(socket: Socket) -> Self {
        Self {
            socket,
            read_buf: BytesMut::with_capacity(DEFAULT_BUF_CAPACITY),
            write_buf: BytesMut::with_capacity(DEFAULT_BUF_CAPACITY),
            stmts: LruCache::new(DEFAULT_PREPARED_STMT_CACHE),
        }
    }

    pub fn socket(&self) -> &Socket {
        &self.socket
    }

    /// Write the `SSLRequest` magic into the send buffer.
    pub fn send_ssl_request(&mut self) {
        frontend::SslRequest.write(&mut self.write_buf);
    }

    /// Write a `CancelRequest` into the send buffer.
    pub fn send_cancel_request(&mut self, cancel: frontend::CancelRequest) {
        cancel.write(&mut self.write_buf);
    }

    /// Read the single-byte answer to `SSLRequest`: `S` or `N`.
    pub fn poll_ssl_answer(&mut self, cx: &mut Context) -> Poll<io::Result<u8>> {
        loop {
            if let Some(byte) = self.read_buf.first().copied() {
                self.read_buf.advance(1);
                return Poll::Ready(Ok(byte));
            }
            self.read_buf.reserve(1);
            let n = ready!(crate::io::poll_read(&mut self.socket, &mut self.read_buf, cx)?);
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::UnexpectedEof.into()));
            }
        }
    }

    /// Discard the buffers and hand back the socket for a TLS upgrade.
    ///
    /// Only valid between the `SSLRequest` answer and the startup message,
    /// when both buffers are empty.
    pub fn into_socket(self) -> Socket {
        debug_assert!(self.read_buf.is_empty());
        self.socket
    }

    /// Poll one raw backend message.
    ///
    /// Unlike [`PgTransport::poll_recv`], every message is surfaced,
    /// including `ErrorResponse` and `NoticeResponse`; routing them is the
    /// session's job.
    pub fn poll_message(&mut self, cx: &mut Context) -> Poll<Result<BackendMessage>> {
        loop {
            poll_message! {
                poll(self, cx);
                let msgtype;
                let body;
            }

            return Poll::Ready(Ok(BackendMessage::decode(msgtype, body)?));
        }
    }

    /// Gracefully close the transport.
    pub async fn close(mut self) -> io::Result<()> {
        use crate::transport::PgTransportExt;
        self.send(frontend::Terminate);
        self.flush().await?;
        self.socket.shutdown().await
    }

    /// Shut the socket down without a `Terminate` message.
    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.socket.shutdown().await
    }

    /// Poll-form socket shutdown.
    pub fn poll_shutdown(&mut self, cx: &mut Context) -> Poll<io::Result<()>> {
        use tokio::io::AsyncWrite;
        std::pin::Pin::new(&mut self.socket).poll_shutdown(cx)
    }

    pub fn write_buffered(&self) -> bool {
        !self.write_buf.is_empty()
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream").field("socket", &self.socket).finish()
    }
}

impl PgTransport for Stream {
    fn poll_flush(&mut self, cx: &mut Context) -> Poll<io::Result<()>> {
        crate::io::poll_write_all(&mut self.socket, &mut self.write_buf, cx)
    }

    fn poll_recv<B: BackendProtocol>(&mut self, cx: &mut Context) -> Poll<Result<B>> {
        if !self.write_buf.is_empty() {
            ready!(self.poll_flush(cx)?)
        }

        loop {
            poll_message! {
                poll(self, cx);
                let msgtype;
                let body;
            }

            match msgtype {
                ErrorResponse::MSGTYPE => {
                    Err(ErrorResponse::new(body).to_db_error())?
                },
                NoticeResponse::MSGTYPE => {
                    log::warn!("{}", NoticeResponse::new(body).to_db_error());
                    continue;
                },
                _ => return Poll::Ready(Ok(B::decode(msgtype, body)?)),
            }
        }
    }

    fn send<F: FrontendProtocol>(&mut self, message: F) {
        log::trace!("(F) {}", std::any::type_name::<F>());
        frontend::write(message, &mut self.write_buf);
    }

    fn send_startup(&mut self, startup: frontend::Startup) {
        log::trace!("(F) {startup:?}");
        startup.write(&mut self.write_buf);
    }

    fn channel_binding(&self) -> ChannelBinding {
        self.socket.channel_binding()
    }

    fn get_stmt(&mut self, name: &str) -> Option<ByteStr> {
        self.stmts.get(name).cloned()
    }

    fn add_stmt(&mut self, name: ByteStr, text: ByteStr) {
        self.stmts.push(name, text);
    }
}
