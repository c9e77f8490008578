//! Cancellation of an in-flight query.
//!
//! A `CancelRequest` cannot travel on the session's own connection while a
//! query is executing; it goes out on a new, short-lived connection to the
//! same address. The server processes the request and closes without
//! replying. Cancellation is a hint: the server may or may not act on it.
use crate::{Result, config::KeepAlive, net::Socket, postgres::frontend, stream::Stream, transport::PgTransportExt};

/// Open a second connection and fire a `CancelRequest` at the backend
/// identified by `process_id`/`secret_key`.
///
/// The primary connection of the session is never touched.
pub(crate) async fn cancel_request(
    host: &str,
    port: u16,
    keepalive: &KeepAlive,
    process_id: u32,
    secret_key: u32,
) -> Result<()> {
    let socket = Socket::connect(host, port, keepalive).await?;
    let mut stream = Stream::new(socket);

    stream.send_cancel_request(frontend::CancelRequest { process_id, secret_key });
    stream.flush().await?;

    // the server closes the connection; nothing more to read
    stream.shutdown().await?;
    Ok(())
}
