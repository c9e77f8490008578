//! Socket transport: TCP, Unix domain socket, optionally upgraded to TLS.
use std::io;

use tokio::net::TcpStream;

#[cfg(feature = "tls")]
pub mod tls;

use crate::config::KeepAlive;

/// The server certificate material the SASL layer may bind to.
///
/// `Required` carries the `tls-server-end-point` hash computed at handshake
/// time.
#[derive(Debug, Clone)]
pub enum ChannelBinding {
    /// Plaintext transport, channel binding impossible.
    Unsupported,
    /// TLS transport without a usable peer certificate, or channel binding
    /// not requested.
    Supported,
    /// TLS transport with the end-point hash of the peer certificate.
    Required(Vec<u8>),
}

/// an either `TcpStream`, `UnixStream` or TLS stream, which implement
/// `AsyncRead` and `AsyncWrite` transparently
pub struct Socket {
    kind: Kind,
}

enum Kind {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(tokio::net::UnixStream),
    #[cfg(feature = "tls")]
    Tls(Box<tls::TlsSocket>),
}

impl Socket {
    /// Open the transport for `host`/`port`.
    ///
    /// A host beginning with `/` is a Unix socket directory; the socket file
    /// is `<host>/.s.PGSQL.<port>`.
    pub async fn connect(host: &str, port: u16, keepalive: &KeepAlive) -> io::Result<Socket> {
        match host.starts_with('/') {
            true => Self::connect_socket(&format!("{host}/.s.PGSQL.{port}")).await,
            false => Self::connect_tcp(host, port, keepalive).await,
        }
    }

    pub async fn connect_tcp(host: &str, port: u16, keepalive: &KeepAlive) -> io::Result<Socket> {
        let socket = TcpStream::connect((host, port)).await?;
        socket.set_nodelay(true)?;

        if keepalive.enabled {
            let sock = socket2::SockRef::from(&socket);
            let mut cfg = socket2::TcpKeepalive::new();
            if let Some(delay) = keepalive.initial_delay {
                cfg = cfg.with_time(delay);
            }
            sock.set_tcp_keepalive(&cfg)?;
        }

        Ok(Socket { kind: Kind::Tcp(socket) })
    }

    pub async fn connect_socket(path: &str) -> io::Result<Socket> {
        #[cfg(unix)]
        {
            let socket = tokio::net::UnixStream::connect(path).await?;
            Ok(Socket { kind: Kind::Unix(socket) })
        }

        #[cfg(not(unix))]
        {
            let _ = path;
            Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "unix domain sockets are not available on this platform",
            ))
        }
    }

    /// Whether this transport can carry the `SSLRequest` dance.
    pub fn is_tcp(&self) -> bool {
        matches!(self.kind, Kind::Tcp(_))
    }

    pub fn is_tls(&self) -> bool {
        #[cfg(feature = "tls")]
        return matches!(self.kind, Kind::Tls(_));
        #[cfg(not(feature = "tls"))]
        false
    }

    /// Channel binding material for SASL, per the current transport state.
    pub fn channel_binding(&self) -> ChannelBinding {
        match &self.kind {
            #[cfg(feature = "tls")]
            Kind::Tls(tls) => match tls.server_end_point() {
                Some(hash) => ChannelBinding::Required(hash.to_vec()),
                None => ChannelBinding::Supported,
            },
            _ => ChannelBinding::Unsupported,
        }
    }

    /// Perform the TLS handshake over an already connected TCP transport.
    ///
    /// Must only be called after the server answered `S` to `SSLRequest`.
    #[cfg(feature = "tls")]
    pub async fn upgrade_tls(
        self,
        host: &str,
        config: std::sync::Arc<tokio_rustls::rustls::ClientConfig>,
    ) -> io::Result<Socket> {
        let Kind::Tcp(tcp) = self.kind else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "tls upgrade requires a tcp transport",
            ));
        };
        let tls = tls::handshake(tcp, host, config).await?;
        Ok(Socket { kind: Kind::Tls(Box::new(tls)) })
    }

    pub async fn shutdown(&mut self) -> io::Result<()> {
        use tokio::io::AsyncWriteExt;
        match &mut self.kind {
            Kind::Tcp(t) => t.shutdown().await,
            #[cfg(unix)]
            Kind::Unix(u) => u.shutdown().await,
            #[cfg(feature = "tls")]
            Kind::Tls(t) => t.stream_mut().shutdown().await,
        }
    }
}

impl tokio::io::AsyncRead for Socket {
    fn poll_read(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<io::Result<()>> {
        use std::pin::Pin;
        match &mut self.kind {
            Kind::Tcp(t) => Pin::new(t).poll_read(cx, buf),
            #[cfg(unix)]
            Kind::Unix(u) => Pin::new(u).poll_read(cx, buf),
            #[cfg(feature = "tls")]
            Kind::Tls(t) => Pin::new(t.stream_mut()).poll_read(cx, buf),
        }
    }
}

impl tokio::io::AsyncWrite for Socket {
    fn poll_write(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<Result<usize, io::Error>> {
        use std::pin::Pin;
        match &mut self.kind {
            Kind::Tcp(t) => Pin::new(t).poll_write(cx, buf),
            #[cfg(unix)]
            Kind::Unix(u) => Pin::new(u).poll_write(cx, buf),
            #[cfg(feature = "tls")]
            Kind::Tls(t) => Pin::new(t.stream_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), io::Error>> {
        use std::pin::Pin;
        match &mut self.kind {
            Kind::Tcp(t) => Pin::new(t).poll_flush(cx),
            #[cfg(unix)]
            Kind::Unix(u) => Pin::new(u).poll_flush(cx),
            #[cfg(feature = "tls")]
            Kind::Tls(t) => Pin::new(t.stream_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), io::Error>> {
        use std::pin::Pin;
        match &mut self.kind {
            Kind::Tcp(t) => Pin::new(t).poll_shutdown(cx),
            #[cfg(unix)]
            Kind::Unix(u) => Pin::new(u).poll_shutdown(cx),
            #[cfg(feature = "tls")]
            Kind::Tls(t) => Pin::new(t.stream_mut()).poll_shutdown(cx),
        }
    }

    fn is_write_vectored(&self) -> bool {
        match &self.kind {
            Kind::Tcp(t) => t.is_write_vectored(),
            #[cfg(unix)]
            Kind::Unix(u) => u.is_write_vectored(),
            #[cfg(feature = "tls")]
            Kind::Tls(t) => t.stream_ref().is_write_vectored(),
        }
    }

    fn poll_write_vectored(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> std::task::Poll<Result<usize, io::Error>> {
        use std::pin::Pin;
        match &mut self.kind {
            Kind::Tcp(t) => Pin::new(t).poll_write_vectored(cx, bufs),
            #[cfg(unix)]
            Kind::Unix(u) => Pin::new(u).poll_write_vectored(cx, bufs),
            #[cfg(feature = "tls")]
            Kind::Tls(t) => Pin::new(t.stream_mut()).poll_write_vectored(cx, bufs),
        }
    }
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            Kind::Tcp(tcp) => std::fmt::Debug::fmt(tcp, f),
            #[cfg(unix)]
            Kind::Unix(unix) => std::fmt::Debug::fmt(unix, f),
            #[cfg(feature = "tls")]
            Kind::Tls(_) => f.write_str("TlsSocket"),
        }
    }
}
