//! The [`PgTransport`] trait.
use std::{
    io,
    task::{Context, Poll},
};

use crate::{
    Result,
    common::ByteStr,
    net::ChannelBinding,
    postgres::{BackendProtocol, FrontendProtocol, frontend},
};

/// A buffered stream which can send and receive postgres message.
///
/// This is the seam between the session logic and the wire: the connect
/// phase (startup + authentication) is written against this trait so it can
/// be driven by a scripted transport in tests.
pub trait PgTransport: Unpin {
    /// Poll to flush the underlying io.
    fn poll_flush(&mut self, cx: &mut Context) -> Poll<io::Result<()>>;

    /// Poll to receive a message.
    ///
    /// Implementor should handle `NoticeResponse` and should not return it.
    ///
    /// Implementor also should handle `ErrorResponse` and return it as
    /// [`Err`].
    fn poll_recv<B: BackendProtocol>(&mut self, cx: &mut Context) -> Poll<Result<B>>;

    /// Send message to the backend.
    ///
    /// Note that this send is buffered, caller must also call
    /// [`poll_flush`][1] or [`flush`][2] afterwards.
    ///
    /// [1]: PgTransport::poll_flush
    /// [2]: PgTransportExt::flush
    fn send<F: FrontendProtocol>(&mut self, message: F);

    /// Send [`Startup`][1] message to the backend.
    ///
    /// For historical reasons, the very first message sent by the client (the
    /// startup message) has no initial message-type byte.
    ///
    /// Thus, [`Startup`][1] does not implement [`FrontendProtocol`]
    ///
    /// [1]: frontend::Startup
    fn send_startup(&mut self, startup: frontend::Startup);

    /// Channel binding material of the current transport, consumed by the
    /// SASL mechanism selection.
    fn channel_binding(&self) -> ChannelBinding;

    /// Text of an already parsed prepared statement.
    fn get_stmt(&mut self, name: &str) -> Option<ByteStr>;

    /// Record a statement observed to parse successfully.
    fn add_stmt(&mut self, name: ByteStr, text: ByteStr);
}

impl<P> PgTransport for &mut P where P: PgTransport {
    fn poll_flush(&mut self, cx: &mut Context) -> Poll<io::Result<()>> {
        P::poll_flush(self, cx)
    }

    fn poll_recv<B: BackendProtocol>(&mut self, cx: &mut Context) -> Poll<Result<B>> {
        P::poll_recv(self, cx)
    }

    fn send<F: FrontendProtocol>(&mut self, message: F) {
        P::send(self, message);
    }

    fn send_startup(&mut self, startup: frontend::Startup) {
        P::send_startup(self, startup);
    }

    fn channel_binding(&self) -> ChannelBinding {
        P::channel_binding(self)
    }

    fn get_stmt(&mut self, name: &str) -> Option<ByteStr> {
        P::get_stmt(self, name)
    }

    fn add_stmt(&mut self, name: ByteStr, text: ByteStr) {
        P::add_stmt(self, name, text);
    }
}

/// An extension trait to provide `Future` API for [`PgTransport`].
pub trait PgTransportExt: PgTransport {
    /// Flush the underlying io.
    fn flush(&mut self) -> impl Future<Output = io::Result<()>> {
        std::future::poll_fn(|cx| self.poll_flush(cx))
    }

    /// Receive a backend message.
    fn recv<B: BackendProtocol>(&mut self) -> impl Future<Output = Result<B>> {
        std::future::poll_fn(|cx| self.poll_recv(cx))
    }
}

impl<T> PgTransportExt for T where T: PgTransport { }
