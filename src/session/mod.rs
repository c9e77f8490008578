//! The connection session: one client, one backend connection, one query at
//! a time.
//!
//! [`Session::connect`] drives the transport through (optional) TLS
//! negotiation, startup and authentication up to the backend's first
//! `ReadyForQuery`, then hands the connection to a driver task. The returned
//! handle feeds that task through a mailbox; queries execute strictly in
//! FIFO order.
mod driver;
mod event;
mod startup;

pub use driver::Snapshot;
pub use event::{Events, SessionEvent};
pub use startup::UnsupportedAuth;

use std::{
    collections::HashMap,
    sync::{
        Arc, Once,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use tokio::{
    sync::{mpsc, oneshot},
    time::Instant,
};

use self::driver::{Command, Driver, QueuedQuery};
use crate::{
    Error, Result,
    common::ByteStr,
    config::{Config, KeepAlive, SslMode},
    error::ErrorKind,
    net::Socket,
    postgres::ProtocolError,
    query::{Query, QueryHandle, QueryId, QueryObject, QueryRun, RowStream, Sink},
    stream::Stream,
    transport::PgTransportExt,
    types::Types,
};

/// Connection facts shared between the handle and the driver.
pub(crate) struct Shared {
    pub host: ByteStr,
    pub port: u16,
    pub keepalive: KeepAlive,
    /// Write-once backend key data, from startup.
    pub process_id: u32,
    pub secret_key: u32,
    pub binary: bool,
    pub query_timeout: Option<Duration>,
    pub types: Option<Arc<Types>>,
}

/// Handle to a connected session.
///
/// Cheap to clone; every clone feeds the same connection. The session is
/// single use: once ended (or broken) it cannot be revived, and a new
/// session means a new [`connect`][Session::connect].
#[derive(Clone)]
pub struct Session {
    send: mpsc::UnboundedSender<Command>,
    shared: Arc<Shared>,
    next_id: Arc<AtomicU64>,
}

impl Session {
    /// Open the transport and drive it to ready.
    ///
    /// Completes exactly once: with the session after the backend's first
    /// `ReadyForQuery`, or with the first connect-phase error. When a
    /// connect deadline is configured, its expiry destroys the transport
    /// mid-handshake.
    pub async fn connect(config: Config) -> Result<(Session, Events)> {
        let connecting = Self::open(&config);

        let (stream, data) = match config.connect_timeout {
            Some(deadline) => match tokio::time::timeout(deadline, connecting).await {
                Ok(result) => result?,
                Err(_) => return Err(ErrorKind::ConnectTimeout.into()),
            },
            None => connecting.await?,
        };

        let shared = Arc::new(Shared {
            host: config.host.clone(),
            port: config.port,
            keepalive: config.keepalive,
            process_id: data.process_id,
            secret_key: data.secret_key,
            binary: config.binary,
            query_timeout: config.query_timeout,
            types: config.types.clone(),
        });

        let (send, recv) = mpsc::unbounded_channel();
        let (event_send, event_recv) = mpsc::unbounded_channel();

        let _ = event_send.send(SessionEvent::Connect);
        tokio::spawn(Driver::new(
            stream,
            Arc::clone(&shared),
            data.parameters,
            recv,
            event_send,
        ));

        let session = Session {
            send,
            shared,
            next_id: Arc::new(AtomicU64::new(1)),
        };
        Ok((session, Events { recv: event_recv }))
    }

    async fn open(config: &Config) -> Result<(Stream, startup::StartupData)> {
        let socket = Socket::connect(&config.host, config.port, &config.keepalive).await?;
        let mut stream = Self::negotiate_tls(Stream::new(socket), config).await?;
        let data = startup::run(&mut stream, config).await?;
        Ok((stream, data))
    }

    /// The `SSLRequest` dance, when configured.
    async fn negotiate_tls(mut stream: Stream, config: &Config) -> Result<Stream> {
        if config.ssl == SslMode::Disable {
            return Ok(stream);
        }

        // SSLRequest is only defined over TCP
        if !stream.socket().is_tcp() {
            return match config.ssl {
                SslMode::Require => Err(crate::config::ConfigError::new(
                    "ssl required over a unix socket transport",
                )
                .into()),
                _ => Ok(stream),
            };
        }

        stream.send_ssl_request();
        stream.flush().await?;
        let answer = std::future::poll_fn(|cx| stream.poll_ssl_answer(cx)).await?;

        match answer {
            b'S' => {
                #[cfg(feature = "tls")]
                {
                    let Some(tls) = config.ssl_config.clone() else {
                        return Err(crate::config::ConfigError::new(
                            "ssl requested but no tls client config provided",
                        )
                        .into());
                    };
                    let socket = stream.into_socket().upgrade_tls(&config.host, tls).await?;
                    Ok(Stream::new(socket))
                }
                #[cfg(not(feature = "tls"))]
                {
                    Err(crate::config::ConfigError::new(
                        "server accepted ssl but the `tls` feature is disabled",
                    )
                    .into())
                }
            }
            b'N' => match config.ssl {
                SslMode::Require => Err(crate::config::ConfigError::new(
                    "server does not support ssl",
                )
                .into()),
                _ => Ok(stream),
            },
            byte => Err(ProtocolError::unknown(byte).into()),
        }
    }

    fn next_id(&self) -> QueryId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn deadline(&self, timeout: Option<Duration>) -> Option<Instant> {
        timeout
            .or(self.shared.query_timeout)
            .map(|t| Instant::now() + t)
    }

    fn dispatch(&self, q: QueuedQuery) {
        if let Err(err) = self.send.send(Command::Query(q)) {
            if let Command::Query(mut q) = err.0 {
                q.handler.on_error(Error::closed("client was closed"));
            }
        }
    }

    /// Enqueue a query; the handle resolves when it completes or fails.
    ///
    /// Rejected (asynchronously, through the handle) once the session is
    /// ending or no longer queryable.
    pub fn query(&self, query: Query) -> QueryHandle {
        let id = self.next_id();
        let deadline = self.deadline(query.timeout);
        let (send, recv) = oneshot::channel();
        let run = QueryRun::new(
            query,
            self.shared.binary,
            self.shared.types.clone(),
            Sink::Collect(Some(send)),
        );
        self.dispatch(QueuedQuery { id, deadline, timed_out: false, handler: Box::new(run) });
        QueryHandle { id, recv }
    }

    /// Enqueue a query and stream its rows as they arrive.
    pub fn query_stream(&self, query: Query) -> RowStream {
        let id = self.next_id();
        let deadline = self.deadline(query.timeout);
        let (send, recv) = mpsc::unbounded_channel();
        let run = QueryRun::new(
            query,
            self.shared.binary,
            self.shared.types.clone(),
            Sink::Stream(Some(send)),
        );
        self.dispatch(QueuedQuery { id, deadline, timed_out: false, handler: Box::new(run) });
        RowStream { id, recv }
    }

    /// Enqueue a caller-built query object (e.g. a COPY driver).
    pub fn submit(&self, handler: Box<dyn QueryObject>, timeout: Option<Duration>) -> QueryId {
        let id = self.next_id();
        let deadline = self.deadline(timeout);
        self.dispatch(QueuedQuery { id, deadline, timed_out: false, handler });
        id
    }

    /// Ask the backend to abandon a query.
    ///
    /// A still-queued query is simply removed; the active query is canceled
    /// through a second short-lived connection carrying a `CancelRequest`.
    /// The session's own connection is never touched.
    pub async fn cancel(&self, id: QueryId) -> Result<()> {
        let (send, recv) = oneshot::channel();
        if self.send.send(Command::Cancel(id, send)).is_err() {
            return Ok(());
        }
        recv.await.unwrap_or(Ok(()))
    }

    /// Initiate shutdown; idempotent.
    ///
    /// Graceful (`Terminate`, then close) when idle; forced transport
    /// destruction when a query is active or the wire is unhealthy.
    /// Resolves when the transport has closed.
    pub async fn end(&self) {
        let (send, recv) = oneshot::channel();
        if self.send.send(Command::End(send)).is_err() {
            return;
        }
        let _ = recv.await;
    }

    /// The process ID of the backend, from `BackendKeyData`.
    pub fn process_id(&self) -> u32 {
        self.shared.process_id
    }

    /// The secret key of the backend, from `BackendKeyData`.
    pub fn secret_key(&self) -> u32 {
        self.shared.secret_key
    }

    /// Backend parameters reported via `ParameterStatus`, as currently known.
    pub async fn parameters(&self) -> HashMap<ByteStr, ByteStr> {
        self.snapshot().await.map(|s| s.parameters).unwrap_or_default()
    }

    /// Number of queries waiting in the queue.
    ///
    /// Deprecated observation window; prefer tracking your own handles.
    pub async fn queued_queries(&self) -> usize {
        observation_warning();
        self.snapshot().await.map(|s| s.queued).unwrap_or(0)
    }

    /// Identifier of the query currently on the wire, if any.
    ///
    /// Deprecated observation window; prefer tracking your own handles.
    pub async fn active_query(&self) -> Option<QueryId> {
        observation_warning();
        self.snapshot().await.and_then(|s| s.active)
    }

    async fn snapshot(&self) -> Option<Snapshot> {
        let (send, recv) = oneshot::channel();
        self.send.send(Command::Snapshot(send)).ok()?;
        recv.await.ok()
    }
}

fn observation_warning() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        log::warn!(
            "queue observation accessors are read-only diagnostics and may go away; \
             do not build control flow on them"
        );
    });
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("process_id", &self.shared.process_id)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use std::net::SocketAddr;
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    use super::*;
    use crate::query::Query;

    /// A scripted backend speaking just enough of the protocol.
    struct Backend {
        socket: TcpStream,
    }

    impl Backend {
        async fn accept(listener: &TcpListener) -> Backend {
            let (socket, _) = listener.accept().await.unwrap();
            let mut backend = Backend { socket };
            backend.read_startup().await;
            backend
        }

        async fn read_startup(&mut self) {
            let len = self.socket.read_i32().await.unwrap() as usize;
            let mut body = vec![0; len - 4];
            self.socket.read_exact(&mut body).await.unwrap();
        }

        async fn send(&mut self, msgtype: u8, body: &[u8]) {
            let mut frame = vec![msgtype];
            frame.extend_from_slice(&((body.len() + 4) as i32).to_be_bytes());
            frame.extend_from_slice(body);
            self.socket.write_all(&frame).await.unwrap();
        }

        /// AuthenticationOk, BackendKeyData(42, 7), a ParameterStatus and
        /// the first ReadyForQuery.
        async fn finish_startup(&mut self) {
            self.send(b'R', &0u32.to_be_bytes()).await;
            let mut key_data = 42u32.to_be_bytes().to_vec();
            key_data.extend_from_slice(&7u32.to_be_bytes());
            self.send(b'K', &key_data).await;
            self.send(b'S', b"server_version\017.2\0").await;
            self.send(b'Z', b"I").await;
        }

        async fn recv(&mut self) -> (u8, Vec<u8>) {
            let msgtype = self.socket.read_u8().await.unwrap();
            let len = self.socket.read_i32().await.unwrap() as usize;
            let mut body = vec![0; len - 4];
            self.socket.read_exact(&mut body).await.unwrap();
            (msgtype, body)
        }

        /// Expect a simple query and return its text.
        async fn recv_query(&mut self) -> String {
            let (msgtype, body) = self.recv().await;
            assert_eq!(msgtype, b'Q', "expected a simple Query message");
            String::from_utf8(body[..body.len() - 1].to_vec()).unwrap()
        }

        async fn complete(&mut self, tag: &str) {
            let mut body = tag.as_bytes().to_vec();
            body.push(0);
            self.send(b'C', &body).await;
            self.send(b'Z', b"I").await;
        }

        async fn error(&mut self, code: &str, message: &str) {
            let mut body = Vec::new();
            body.extend_from_slice(b"SERROR\0");
            body.extend_from_slice(format!("C{code}\0").as_bytes());
            body.extend_from_slice(format!("M{message}\0").as_bytes());
            body.push(0);
            self.send(b'E', &body).await;
            self.send(b'Z', b"I").await;
        }
    }

    fn rt() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
    }

    fn config_for(addr: SocketAddr) -> Config {
        Config::new()
            .host(addr.ip().to_string())
            .port(addr.port())
            .user("alice")
    }

    async fn listener() -> (TcpListener, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        (listener, addr)
    }

    fn closed_with(err: &Error, reason: &str) -> bool {
        matches!(err.kind(), ErrorKind::Closed(m) if *m == reason)
    }

    #[test]
    fn connect_happy_path() {
        rt().block_on(async {
            let (listener, addr) = listener().await;
            let server = tokio::spawn(async move {
                let mut backend = Backend::accept(&listener).await;
                backend.finish_startup().await;
                backend
            });

            let (session, mut events) = Session::connect(config_for(addr)).await.unwrap();

            assert_eq!(session.process_id(), 42);
            assert_eq!(session.secret_key(), 7);
            assert!(matches!(events.next().await, Some(SessionEvent::Connect)));

            let params = session.parameters().await;
            assert_eq!(params.get("server_version").map(|v| v.as_str()), Some("17.2"));

            let _backend = server.await.unwrap();
        });
    }

    #[test]
    fn connect_error_before_ready() {
        rt().block_on(async {
            let (listener, addr) = listener().await;
            tokio::spawn(async move {
                let mut backend = Backend::accept(&listener).await;
                backend
                    .send(b'E', b"SFATAL\0C28P01\0Mpassword authentication failed\0\0")
                    .await;
            });

            let err = Session::connect(config_for(addr)).await.unwrap_err();
            assert_eq!(err.as_database().unwrap().code, "28P01");
        });
    }

    #[test]
    fn connect_timeout_expires() {
        rt().block_on(async {
            let (listener, addr) = listener().await;
            // accept but never answer the startup message
            tokio::spawn(async move {
                let (_socket, _) = listener.accept().await.unwrap();
                tokio::time::sleep(Duration::from_secs(5)).await;
            });

            let config = config_for(addr).connect_timeout(Duration::from_millis(50));
            let err = Session::connect(config).await.unwrap_err();
            assert!(matches!(err.kind(), ErrorKind::ConnectTimeout));
        });
    }

    #[test]
    fn fifo_order_and_single_drain() {
        rt().block_on(async {
            let (listener, addr) = listener().await;
            let server = tokio::spawn(async move {
                let mut backend = Backend::accept(&listener).await;
                backend.finish_startup().await;
                let mut texts = Vec::new();
                for _ in 0..3 {
                    texts.push(backend.recv_query().await);
                    backend.complete("SELECT 0").await;
                }
                (backend, texts)
            });

            let (session, mut events) = Session::connect(config_for(addr)).await.unwrap();

            let q1 = session.query(Query::new("select 1"));
            let q2 = session.query(Query::new("select 2"));
            let q3 = session.query(Query::new("select 3"));

            q1.await.unwrap();
            q2.await.unwrap();
            q3.await.unwrap();

            let (_backend, texts) = server.await.unwrap();
            assert_eq!(texts, ["select 1", "select 2", "select 3"]);

            // exactly one drain, after the last completion
            let mut drains = 0;
            while let Ok(Some(event)) =
                tokio::time::timeout(Duration::from_millis(100), events.next()).await
            {
                if matches!(event, SessionEvent::Drain) {
                    drains += 1;
                }
            }
            assert_eq!(drains, 1);
        });
    }

    #[test]
    fn backend_error_is_local_to_its_query() {
        rt().block_on(async {
            let (listener, addr) = listener().await;
            let server = tokio::spawn(async move {
                let mut backend = Backend::accept(&listener).await;
                backend.finish_startup().await;
                backend.recv_query().await;
                backend.error("42P01", "relation \"nope\" does not exist").await;
                backend.recv_query().await;
                backend.complete("SELECT 1").await;
                backend
            });

            let (session, mut events) = Session::connect(config_for(addr)).await.unwrap();

            let err = session.query(Query::new("select * from nope")).await.unwrap_err();
            assert_eq!(err.as_database().unwrap().code, "42P01");

            // the session stays usable
            session.query(Query::new("select 1")).await.unwrap();

            let _backend = server.await.unwrap();

            // no session-level error event was emitted
            assert!(matches!(events.next().await, Some(SessionEvent::Connect)));
            while let Ok(Some(event)) =
                tokio::time::timeout(Duration::from_millis(50), events.next()).await
            {
                assert!(
                    !matches!(event, SessionEvent::Error(_)),
                    "backend query errors must not surface as session errors",
                );
            }
        });
    }

    #[test]
    fn socket_close_fails_active_and_queued() {
        rt().block_on(async {
            let (listener, addr) = listener().await;
            let server = tokio::spawn(async move {
                let mut backend = Backend::accept(&listener).await;
                backend.finish_startup().await;
                // swallow the first query, then die mid-window
                backend.recv_query().await;
                drop(backend);
            });

            let (session, mut events) = Session::connect(config_for(addr)).await.unwrap();

            let q_active = session.query(Query::new("select pg_sleep(10)"));
            let q_pending = session.query(Query::new("select 2"));

            let err = q_active.await.unwrap_err();
            assert!(closed_with(&err, "Connection terminated unexpectedly"), "{err}");
            let err = q_pending.await.unwrap_err();
            assert!(closed_with(&err, "Connection terminated unexpectedly"), "{err}");

            server.await.unwrap();

            // exactly one error event, then end
            assert!(matches!(events.next().await, Some(SessionEvent::Connect)));
            assert!(matches!(events.next().await, Some(SessionEvent::Error(_))));
            assert!(matches!(events.next().await, Some(SessionEvent::End)));

            // the session is no longer queryable
            let err = session.query(Query::new("select 3")).await.unwrap_err();
            assert!(closed_with(&err, "connection is not queryable"), "{err}");
        });
    }

    #[test]
    fn query_read_timeout_fires_and_late_reply_is_discarded() {
        rt().block_on(async {
            let (listener, addr) = listener().await;
            let server = tokio::spawn(async move {
                let mut backend = Backend::accept(&listener).await;
                backend.finish_startup().await;
                backend.recv_query().await;
                // reply long after the client side deadline
                tokio::time::sleep(Duration::from_millis(150)).await;
                backend.complete("SELECT 1").await;
                // the next query must run normally
                backend.recv_query().await;
                backend.complete("SELECT 2").await;
                backend
            });

            let config = config_for(addr).query_timeout(Duration::from_millis(50));
            let (session, _events) = Session::connect(config).await.unwrap();

            let started = Instant::now();
            let err = session.query(Query::new("select slow")).await.unwrap_err();
            assert!(matches!(err.kind(), ErrorKind::QueryTimeout));
            assert!(started.elapsed() < Duration::from_millis(140), "timeout fired too late");

            // the late CommandComplete for the dead query is discarded and
            // the window closes; this query then runs normally
            let result = session
                .query(Query::new("select fast").timeout(Duration::from_secs(5)))
                .await
                .unwrap();
            assert_eq!(result.tag.as_deref(), Some("SELECT 2"));

            let _backend = server.await.unwrap();
        });
    }

    #[test]
    fn graceful_end_sends_terminate() {
        rt().block_on(async {
            let (listener, addr) = listener().await;
            let server = tokio::spawn(async move {
                let mut backend = Backend::accept(&listener).await;
                backend.finish_startup().await;
                backend.recv_query().await;
                backend.complete("SELECT 1").await;
                let (msgtype, _) = backend.recv().await;
                msgtype
            });

            let (session, mut events) = Session::connect(config_for(addr)).await.unwrap();
            session.query(Query::new("select 1")).await.unwrap();
            session.end().await;

            assert_eq!(server.await.unwrap(), b'X', "expected a Terminate message");

            assert!(matches!(events.next().await, Some(SessionEvent::Connect)));
            let mut saw_end = false;
            while let Ok(Some(event)) =
                tokio::time::timeout(Duration::from_millis(100), events.next()).await
            {
                saw_end |= matches!(event, SessionEvent::End);
            }
            assert!(saw_end);
        });
    }

    #[test]
    fn forced_end_with_active_query() {
        rt().block_on(async {
            let (listener, addr) = listener().await;
            let (submitted_tx, submitted_rx) = oneshot::channel();
            let server = tokio::spawn(async move {
                let mut backend = Backend::accept(&listener).await;
                backend.finish_startup().await;
                backend.recv_query().await;
                submitted_tx.send(()).unwrap();
                // never reply; the client must force the transport down
                backend
            });

            let (session, mut events) = Session::connect(config_for(addr)).await.unwrap();

            let q = session.query(Query::new("select pg_sleep(10)"));
            submitted_rx.await.unwrap();

            session.end().await;

            let err = q.await.unwrap_err();
            assert!(closed_with(&err, "Connection terminated"), "{err}");

            assert!(matches!(events.next().await, Some(SessionEvent::Connect)));
            assert!(matches!(events.next().await, Some(SessionEvent::End)));

            // ended sessions reject further work as closed
            let err = session.query(Query::new("select 1")).await.unwrap_err();
            assert!(closed_with(&err, "client was closed"), "{err}");

            let _backend = server.await.unwrap();
        });
    }

    #[test]
    fn end_is_idempotent() {
        rt().block_on(async {
            let (listener, addr) = listener().await;
            let server = tokio::spawn(async move {
                let mut backend = Backend::accept(&listener).await;
                backend.finish_startup().await;
                let _ = backend.recv().await; // Terminate
            });

            let (session, _events) = Session::connect(config_for(addr)).await.unwrap();
            session.end().await;
            session.end().await;
            server.await.unwrap();
        });
    }

    #[test]
    fn named_statement_skips_reparse() {
        rt().block_on(async {
            let (listener, addr) = listener().await;
            let server = tokio::spawn(async move {
                let mut backend = Backend::accept(&listener).await;
                backend.finish_startup().await;

                // first run: Parse, Bind, Describe, Execute, Sync
                let mut msgtypes = Vec::new();
                loop {
                    let (msgtype, _) = backend.recv().await;
                    msgtypes.push(msgtype);
                    if msgtype == b'S' {
                        break;
                    }
                }
                assert_eq!(msgtypes, [b'P', b'B', b'D', b'E', b'S']);
                backend.send(b'1', b"").await; // ParseComplete
                backend.send(b'2', b"").await; // BindComplete
                backend.send(b'n', b"").await; // NoData
                backend.complete("SELECT 0").await;

                // second run under the same name: no Parse
                let mut msgtypes = Vec::new();
                loop {
                    let (msgtype, _) = backend.recv().await;
                    msgtypes.push(msgtype);
                    if msgtype == b'S' {
                        break;
                    }
                }
                assert_eq!(msgtypes, [b'B', b'D', b'E', b'S']);
                backend.send(b'2', b"").await;
                backend.send(b'n', b"").await;
                backend.complete("SELECT 0").await;

                backend
            });

            let (session, _events) = Session::connect(config_for(addr)).await.unwrap();

            session
                .query(Query::new("select $1").name("stmt_a").bind("x"))
                .await
                .unwrap();
            session
                .query(Query::new("select $1").name("stmt_a").bind("y"))
                .await
                .unwrap();

            let _backend = server.await.unwrap();
        });
    }

    #[test]
    fn cancel_removes_queued_query() {
        rt().block_on(async {
            let (listener, addr) = listener().await;
            let (submitted_tx, submitted_rx) = oneshot::channel();
            let server = tokio::spawn(async move {
                let mut backend = Backend::accept(&listener).await;
                backend.finish_startup().await;
                backend.recv_query().await;
                submitted_tx.send(()).unwrap();
                tokio::time::sleep(Duration::from_millis(100)).await;
                backend.complete("SELECT 1").await;
                backend
            });

            let (session, _events) = Session::connect(config_for(addr)).await.unwrap();

            let q1 = session.query(Query::new("select slow"));
            let q2 = session.query(Query::new("select queued"));
            submitted_rx.await.unwrap();

            session.cancel(q2.id()).await.unwrap();

            let err = q2.await.unwrap_err();
            assert!(closed_with(&err, "query was canceled"), "{err}");
            q1.await.unwrap();

            let _backend = server.await.unwrap();
        });
    }

    #[test]
    fn cancel_active_opens_second_connection() {
        rt().block_on(async {
            let (listener, addr) = listener().await;
            let (submitted_tx, submitted_rx) = oneshot::channel();
            let server = tokio::spawn(async move {
                let mut backend = Backend::accept(&listener).await;
                backend.finish_startup().await;
                backend.recv_query().await;
                submitted_tx.send(()).unwrap();

                // the cancel arrives on a fresh connection
                let (mut cancel_socket, _) = listener.accept().await.unwrap();
                let mut frame = [0u8; 16];
                cancel_socket.read_exact(&mut frame).await.unwrap();
                drop(cancel_socket);

                backend.complete("SELECT 1").await;
                (backend, frame)
            });

            let (session, _events) = Session::connect(config_for(addr)).await.unwrap();

            let q = session.query(Query::new("select slow"));
            submitted_rx.await.unwrap();
            session.cancel(q.id()).await.unwrap();

            let (_backend, frame) = server.await.unwrap();
            assert_eq!(frame[..4], 16i32.to_be_bytes());
            assert_eq!(frame[4..8], 80877102i32.to_be_bytes());
            assert_eq!(frame[8..12], 42u32.to_be_bytes()); // process id
            assert_eq!(frame[12..16], 7u32.to_be_bytes()); // secret key

            // the primary connection was never touched
            q.await.unwrap();
        });
    }

    #[test]
    fn observation_accessors() {
        rt().block_on(async {
            let (listener, addr) = listener().await;
            let (submitted_tx, submitted_rx) = oneshot::channel();
            let server = tokio::spawn(async move {
                let mut backend = Backend::accept(&listener).await;
                backend.finish_startup().await;
                backend.recv_query().await;
                submitted_tx.send(()).unwrap();
                tokio::time::sleep(Duration::from_millis(100)).await;
                backend.complete("SELECT 1").await;
                backend.recv_query().await;
                backend.complete("SELECT 1").await;
                backend
            });

            let (session, _events) = Session::connect(config_for(addr)).await.unwrap();

            let q1 = session.query(Query::new("select slow"));
            let q2 = session.query(Query::new("select queued"));
            submitted_rx.await.unwrap();

            assert_eq!(session.active_query().await, Some(q1.id()));
            assert_eq!(session.queued_queries().await, 1);

            q1.await.unwrap();
            q2.await.unwrap();
            let _backend = server.await.unwrap();
        });
    }
}
