//! The connect phase: startup message, authentication, and the wait for the
//! first `ReadyForQuery`.
//!
//! <https://www.postgresql.org/docs/current/protocol-flow.html#PROTOCOL-FLOW-START-UP>
use md5::{Digest, Md5};
use std::collections::HashMap;

use crate::{
    Error, Result,
    common::ByteStr,
    config::{Config, PasswordSource},
    error::ErrorKind,
    net::ChannelBinding,
    pgpass,
    postgres::{
        BackendMessage, ProtocolError,
        backend::{self, sasl_mechanisms},
        frontend,
    },
    scram::ScramSession,
    transport::{PgTransport, PgTransportExt},
};

/// Authentication variant the session does not implement.
#[derive(Debug, thiserror::Error)]
#[error("authentication method {0} is not supported")]
pub struct UnsupportedAuth(pub &'static str);

/// Startup phase successful response.
#[derive(Debug)]
pub(crate) struct StartupData {
    /// Secret-key data the session must save to be able to issue cancel
    /// requests later.
    pub process_id: u32,
    pub secret_key: u32,
    /// The initial setting of backend parameters, such as client_encoding or
    /// DateStyle.
    pub parameters: HashMap<ByteStr, ByteStr>,
}

/// Assemble the startup key/value map from the connection parameters.
pub(crate) fn startup_params(config: &Config) -> Vec<(&'static str, String)> {
    let mut params = Vec::with_capacity(4);

    params.push(("user", config.user.to_string()));
    params.push(("database", config.dbname.to_string()));

    let app_name = config
        .application_name
        .as_ref()
        .or(config.fallback_application_name.as_ref());
    if let Some(name) = app_name {
        params.push(("application_name", name.to_string()));
    }

    // an empty replication value means the server default
    if let Some(replication) = config.replication.as_ref().filter(|r| !r.is_empty()) {
        params.push(("replication", replication.to_string()));
    }

    if let Some(ms) = config.statement_timeout {
        params.push(("statement_timeout", ms.to_string()));
    }
    if let Some(ms) = config.lock_timeout {
        params.push(("lock_timeout", ms.to_string()));
    }
    if let Some(ms) = config.idle_in_transaction_session_timeout {
        params.push(("idle_in_transaction_session_timeout", ms.to_string()));
    }

    if let Some(options) = config.options.as_ref().filter(|o| !o.is_empty()) {
        params.push(("options", options.to_string()));
    }

    params
}

/// Perform the whole startup conversation on `io`.
///
/// Any error returned here is a connect-phase error: it completes the
/// caller's `connect` exactly once.
pub(crate) async fn run<IO: PgTransport>(io: &mut IO, config: &Config) -> Result<StartupData> {
    // To begin a session, a frontend opens a connection to the server and
    // sends a startup message.

    let params = startup_params(config);
    let params = params
        .iter()
        .map(|(name, value)| (*name, value.as_str()))
        .collect::<Vec<_>>();

    io.send_startup(frontend::Startup { params: &params });
    io.flush().await?;

    authenticate(io, config).await?;

    // After having received AuthenticationOk, the frontend must wait for
    // further messages from the server. In this phase a backend process is
    // being started, and the frontend is just an interested bystander.
    //
    // The backend will send some ParameterStatus messages, BackendKeyData,
    // and finally ReadyForQuery.

    let mut parameters = HashMap::new();
    let mut key_data = None;

    loop {
        use BackendMessage::*;
        match io.recv().await? {
            ReadyForQuery(_) => break,
            BackendKeyData(new_key_data) => key_data = Some(new_key_data),
            ParameterStatus(param) => {
                parameters.insert(param.name, param.value);
            }
            NegotiateProtocolVersion(v) => {
                log::warn!("server negotiated protocol minor version {}", v.minor);
            }
            f => Err(ProtocolError::unexpected_phase(f.msgtype(), "startup phase"))?,
        }
    }

    let Some(key_data) = key_data else {
        return Err(ProtocolError::unexpected_phase(
            backend::ReadyForQuery::MSGTYPE,
            "startup phase without BackendKeyData",
        )
        .into());
    };

    Ok(StartupData {
        process_id: key_data.process_id,
        secret_key: key_data.secret_key,
        parameters,
    })
}

/// Respond to each authentication-request variant until `AuthenticationOk`.
///
/// For all authentication methods except GSSAPI, SSPI and SASL, there is at
/// most one request and one response. For SASL, multiple exchanges of
/// packets are needed to complete the authentication.
async fn authenticate<IO: PgTransport>(io: &mut IO, config: &Config) -> Result<()> {
    // resolved lazily at the first challenge, then cached for the session
    let mut password: Option<String> = None;
    let mut scram: Option<ScramSession> = None;

    macro_rules! password {
        () => {{
            if password.is_none() {
                password = Some(resolve_password(config).await?);
            }
            password.as_deref().unwrap_or_default()
        }};
    }

    loop {
        use backend::Authentication::*;
        match io.recv().await? {
            // we gucci
            Ok => return Result::Ok(()),

            // The frontend must now send a PasswordMessage containing the
            // password in clear-text form.
            CleartextPassword => {
                io.send(frontend::PasswordMessage { password: password!() });
                io.flush().await?;
            }

            MD5Password { salt } => {
                let hashed = md5_password(&config.user, password!(), &salt);
                io.send(frontend::PasswordMessage { password: &hashed });
                io.flush().await?;
            }

            SASL { mechanisms } => {
                let _ = password!();
                let binding = match config.enable_channel_binding {
                    true => io.channel_binding(),
                    false => ChannelBinding::Unsupported,
                };
                let session = ScramSession::start(sasl_mechanisms(&mechanisms), binding)
                    .map_err(Error::from)?;
                io.send(frontend::SaslInitialResponse {
                    mechanism: session.mechanism().as_str(),
                    response: session.response().as_bytes(),
                });
                io.flush().await?;
                scram = Some(session);
            }

            SASLContinue { data } => {
                let Some(session) = scram.as_mut() else {
                    return Err(ProtocolError::unexpected_phase(
                        backend::Authentication::MSGTYPE,
                        "SASLContinue without SASL exchange",
                    )
                    .into());
                };
                session.advance(password!(), &data)?;
                io.send(frontend::SaslResponse { data: session.response().as_bytes() });
                io.flush().await?;
            }

            SASLFinal { data } => {
                let Some(session) = scram.take() else {
                    return Err(ProtocolError::unexpected_phase(
                        backend::Authentication::MSGTYPE,
                        "SASLFinal without SASL exchange",
                    )
                    .into());
                };
                session.finalize(&data)?;
            }

            f => Err(UnsupportedAuth(f.name()))?,
        }
    }
}

/// Obtain the password per the configured source.
///
/// An absent password falls back to a best-effort credentials file lookup;
/// failure there is non-fatal and yields the empty password.
async fn resolve_password(config: &Config) -> Result<String> {
    match &config.password {
        PasswordSource::Static(pass) => Result::Ok(pass.expose().to_string()),
        PasswordSource::Producer(producer) => match producer().await {
            Ok(pass) => Result::Ok(pass),
            Err(err) => Err(ErrorKind::Password(err).into()),
        },
        PasswordSource::None => {
            let path = config.passfile.clone().or_else(pgpass::default_path);
            let pass = path.and_then(|path| {
                pgpass::lookup(&path, &config.host, config.port, &config.dbname, &config.user)
            });
            Result::Ok(pass.unwrap_or_default())
        }
    }
}

/// PostgreSQL MD5 password response:
/// `"md5" + hex(md5(hex(md5(password + user)) + salt))`.
pub(crate) fn md5_password(user: &str, password: &str, salt: &[u8; 4]) -> String {
    let mut hasher = Md5::new();
    hasher.update(password.as_bytes());
    hasher.update(user.as_bytes());
    let inner = format!("{:x}", hasher.finalize());

    let mut hasher = Md5::new();
    hasher.update(inner.as_bytes());
    hasher.update(salt);
    format!("md5{:x}", hasher.finalize())
}
