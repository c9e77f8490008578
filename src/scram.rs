//! SCRAM-SHA-256 and SCRAM-SHA-256-PLUS client engine.
//!
//! Implements the client side of RFC 5802 / RFC 7677 as postgres speaks it:
//! a three step exchange carried in `SASLInitialResponse`, `SASLResponse`
//! and verified against `AuthenticationSASLFinal`.
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::net::ChannelBinding;

/// Nonce entropy before base64 encoding.
const NONCE_LEN: usize = 18;

/// SASL mechanism selected for a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mechanism {
    ScramSha256,
    ScramSha256Plus,
}

impl Mechanism {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ScramSha256 => "SCRAM-SHA-256",
            Self::ScramSha256Plus => "SCRAM-SHA-256-PLUS",
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Phase {
    InitialSent,
    ResponseSent,
}

/// SCRAM exchange failure.
#[derive(Debug, thiserror::Error)]
pub enum ScramError {
    #[error("only SCRAM-SHA-256(-PLUS) mechanisms are supported")]
    UnsupportedMechanism,
    #[error("SASL message received out of order")]
    WrongPhase,
    #[error("server message is not valid utf-8")]
    NotUtf8,
    #[error("malformed attribute in server message")]
    MalformedAttribute,
    #[error("server message is missing attribute `{0}`")]
    MissingAttribute(char),
    #[error("server nonce is not printable ascii")]
    InvalidNonce,
    #[error("server salt is not base64")]
    InvalidSalt,
    #[error("server iteration count is not a positive integer")]
    InvalidIterations,
    #[error("server nonce does not extend the client nonce")]
    NonceMismatch,
    #[error("server rejected authentication: {0}")]
    ServerRejected(String),
    #[error("server signature is missing or not base64")]
    InvalidVerifier,
    #[error("server signature mismatch")]
    SignatureMismatch,
}

/// State of one SCRAM exchange. Single use; discarded after
/// [`finalize`][ScramSession::finalize].
#[derive(Debug)]
pub struct ScramSession {
    mechanism: Mechanism,
    binding: ChannelBinding,
    client_nonce: String,
    phase: Phase,
    /// base64 signature the final server message must carry.
    server_signature: Option<String>,
    /// most recent outgoing payload.
    response: String,
}

impl ScramSession {
    /// Pick a mechanism from the server's offer and build the client-first
    /// message.
    ///
    /// `SCRAM-SHA-256-PLUS` is considered only when the transport provides
    /// certificate material ([`ChannelBinding::Required`]).
    pub fn start<'a>(
        offered: impl Iterator<Item = &'a str>,
        binding: ChannelBinding,
    ) -> Result<Self, ScramError> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::rng().fill_bytes(&mut nonce);
        Self::start_with_nonce(offered, binding, BASE64.encode(nonce))
    }

    fn start_with_nonce<'a>(
        offered: impl Iterator<Item = &'a str>,
        binding: ChannelBinding,
        client_nonce: String,
    ) -> Result<Self, ScramError> {
        let mut candidates = Vec::with_capacity(2);
        if matches!(binding, ChannelBinding::Required(_)) {
            candidates.push(Mechanism::ScramSha256Plus);
        }
        candidates.push(Mechanism::ScramSha256);

        let offered = offered.collect::<Vec<_>>();
        let mechanism = candidates
            .into_iter()
            .find(|c| offered.contains(&c.as_str()))
            .ok_or(ScramError::UnsupportedMechanism)?;

        let gs2 = gs2_header(mechanism, &binding);
        let response = format!("{gs2},,n=*,r={client_nonce}");

        Ok(Self {
            mechanism,
            binding,
            client_nonce,
            phase: Phase::InitialSent,
            server_signature: None,
            response,
        })
    }

    pub fn mechanism(&self) -> Mechanism {
        self.mechanism
    }

    /// The payload to send next (client-first after [`start`][Self::start],
    /// client-final after [`advance`][Self::advance]).
    pub fn response(&self) -> &str {
        &self.response
    }

    /// Process the server-first message and build the client-final message.
    pub fn advance(&mut self, password: &str, server_first: &[u8]) -> Result<(), ScramError> {
        if self.phase != Phase::InitialSent {
            return Err(ScramError::WrongPhase);
        }

        let server_first = std::str::from_utf8(server_first).map_err(|_| ScramError::NotUtf8)?;
        let attrs = Attributes::parse(server_first)?;

        let server_nonce = attrs.require('r')?;
        let salt = attrs.require('s')?;
        let iterations = attrs.require('i')?;

        if !is_printable(server_nonce) {
            return Err(ScramError::InvalidNonce);
        }
        if !is_base64(salt) {
            return Err(ScramError::InvalidSalt);
        }
        let iterations = parse_iterations(iterations)?;

        // the server nonce must strictly extend ours
        if !server_nonce.starts_with(&self.client_nonce)
            || server_nonce.len() <= self.client_nonce.len()
        {
            return Err(ScramError::NonceMismatch);
        }

        let salt = BASE64.decode(salt).map_err(|_| ScramError::InvalidSalt)?;

        let cbind = binding_token(self.mechanism, &self.binding);

        let client_first_bare = format!("n=*,r={}", self.client_nonce);
        let without_proof = format!("c={cbind},r={server_nonce}");
        let auth_message = format!("{client_first_bare},{server_first},{without_proof}");

        let salted_password = salt_password(password.as_bytes(), &salt, iterations);

        let client_key = hmac_sha256(&salted_password, b"Client Key");
        let stored_key: [u8; 32] = Sha256::digest(client_key).into();
        let client_signature = hmac_sha256(&stored_key, auth_message.as_bytes());
        let client_proof = xor(&client_key, &client_signature);

        let server_key = hmac_sha256(&salted_password, b"Server Key");
        let server_signature = hmac_sha256(&server_key, auth_message.as_bytes());

        self.server_signature = Some(BASE64.encode(server_signature));
        self.response = format!("{without_proof},p={}", BASE64.encode(client_proof));
        self.phase = Phase::ResponseSent;

        Ok(())
    }

    /// Verify the server-final message.
    pub fn finalize(self, server_final: &[u8]) -> Result<(), ScramError> {
        if self.phase != Phase::ResponseSent {
            return Err(ScramError::WrongPhase);
        }

        let server_final = std::str::from_utf8(server_final).map_err(|_| ScramError::NotUtf8)?;
        let attrs = Attributes::parse(server_final)?;

        if let Ok(reason) = attrs.require('e') {
            return Err(ScramError::ServerRejected(reason.into()));
        }

        let verifier = attrs.require('v').map_err(|_| ScramError::InvalidVerifier)?;
        if !is_base64(verifier) {
            return Err(ScramError::InvalidVerifier);
        }

        match self.server_signature.as_deref() == Some(verifier) {
            true => Ok(()),
            false => Err(ScramError::SignatureMismatch),
        }
    }
}

fn gs2_header(mechanism: Mechanism, binding: &ChannelBinding) -> &'static str {
    match (mechanism, binding) {
        (Mechanism::ScramSha256Plus, _) => "p=tls-server-end-point",
        // client supports channel binding, server did not offer -PLUS
        (_, ChannelBinding::Supported | ChannelBinding::Required(_)) => "y",
        (_, ChannelBinding::Unsupported) => "n",
    }
}

/// The `c=` attribute of the client-final message.
fn binding_token(mechanism: Mechanism, binding: &ChannelBinding) -> String {
    match (mechanism, binding) {
        (Mechanism::ScramSha256Plus, ChannelBinding::Required(end_point)) => {
            let mut data = b"p=tls-server-end-point,,".to_vec();
            data.extend_from_slice(end_point);
            BASE64.encode(data)
        }
        // base64("y,,")
        (_, ChannelBinding::Supported | ChannelBinding::Required(_)) => String::from("eSws"),
        // base64("n,,")
        (_, ChannelBinding::Unsupported) => String::from("biws"),
    }
}

struct Attributes<'a> {
    pairs: Vec<(char, &'a str)>,
}

impl<'a> Attributes<'a> {
    /// Parse comma separated `name=value` attributes.
    fn parse(message: &'a str) -> Result<Self, ScramError> {
        let mut pairs = Vec::new();
        for part in message.split(',') {
            let mut chars = part.chars();
            let (Some(name), Some('=')) = (chars.next(), chars.next()) else {
                return Err(ScramError::MalformedAttribute);
            };
            pairs.push((name, chars.as_str()));
        }
        Ok(Self { pairs })
    }

    fn require(&self, name: char) -> Result<&'a str, ScramError> {
        self.pairs
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| *v)
            .ok_or(ScramError::MissingAttribute(name))
    }
}

/// Printable ascii excluding comma, per the RFC nonce grammar.
fn is_printable(value: &str) -> bool {
    !value.is_empty() && value.bytes().all(|b| (0x21..=0x7e).contains(&b) && b != b',')
}

/// Strict base64 shape: 4-byte groups with optional `=`/`==` tail.
fn is_base64(value: &str) -> bool {
    let bytes = value.as_bytes();
    if bytes.is_empty() || bytes.len() % 4 != 0 {
        return false;
    }
    let padding = bytes.iter().rev().take_while(|b| **b == b'=').count();
    if padding > 2 {
        return false;
    }
    bytes[..bytes.len() - padding]
        .iter()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'+' | b'/'))
}

fn parse_iterations(value: &str) -> Result<u32, ScramError> {
    if value.is_empty() || value.starts_with('0') || !value.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ScramError::InvalidIterations);
    }
    value.parse().map_err(|_| ScramError::InvalidIterations)
}

pub(crate) fn salt_password(password: &[u8], salt: &[u8], iterations: u32) -> [u8; 32] {
    let mut out = [0u8; 32];
    pbkdf2::pbkdf2_hmac::<Sha256>(password, salt, iterations, &mut out);
    out
}

pub(crate) fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = Hmac::<Sha256>::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

fn xor(a: &[u8; 32], b: &[u8; 32]) -> [u8; 32] {
    let mut out = [0u8; 32];
    for i in 0..32 {
        out[i] = a[i] ^ b[i];
    }
    out
}

#[cfg(test)]
mod test {
    use super::*;

    const CLIENT_NONCE: &str = "rOprNGfwEbeRWgbNEkqO";
    const SERVER_FIRST: &str =
        "r=rOprNGfwEbeRWgbNEkqO%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0,s=W22ZaJ0SNY7soEsUEjb6gQ==,i=4096";

    fn session() -> ScramSession {
        ScramSession::start_with_nonce(
            ["SCRAM-SHA-256"].into_iter(),
            ChannelBinding::Unsupported,
            CLIENT_NONCE.into(),
        )
        .unwrap()
    }

    #[test]
    fn client_first_message() {
        let session = session();
        assert_eq!(session.mechanism(), Mechanism::ScramSha256);
        assert_eq!(session.response(), "n,,n=*,r=rOprNGfwEbeRWgbNEkqO");
    }

    #[test]
    fn full_exchange_against_reference_derivation() {
        let mut session = session();
        session.advance("pencil", SERVER_FIRST.as_bytes()).unwrap();

        // derive the expected values independently from the RFC formulae
        let server_nonce = "rOprNGfwEbeRWgbNEkqO%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0";
        let salt = BASE64.decode("W22ZaJ0SNY7soEsUEjb6gQ==").unwrap();
        let auth_message = format!(
            "n=*,r={CLIENT_NONCE},{SERVER_FIRST},c=biws,r={server_nonce}"
        );

        let salted = salt_password(b"pencil", &salt, 4096);
        let client_key = hmac_sha256(&salted, b"Client Key");
        let stored_key: [u8; 32] = sha2::Sha256::digest(client_key).into();
        let client_signature = hmac_sha256(&stored_key, auth_message.as_bytes());
        let proof = xor(&client_key, &client_signature);

        assert_eq!(
            session.response(),
            format!("c=biws,r={server_nonce},p={}", BASE64.encode(proof)),
        );

        // round-trip property: proof XOR signature recovers the client key
        assert_eq!(xor(&proof, &client_signature), client_key);

        let server_key = hmac_sha256(&salted, b"Server Key");
        let server_signature = hmac_sha256(&server_key, auth_message.as_bytes());
        let server_final = format!("v={}", BASE64.encode(server_signature));

        session.finalize(server_final.as_bytes()).unwrap();
    }

    #[test]
    fn signature_mismatch_rejected() {
        let mut session = session();
        session.advance("pencil", SERVER_FIRST.as_bytes()).unwrap();
        let bogus = format!("v={}", BASE64.encode([7u8; 32]));
        assert!(matches!(
            session.finalize(bogus.as_bytes()),
            Err(ScramError::SignatureMismatch),
        ));
    }

    #[test]
    fn server_error_attribute_surfaced() {
        let mut session = session();
        session.advance("pencil", SERVER_FIRST.as_bytes()).unwrap();
        let err = session.finalize(b"e=invalid-proof").unwrap_err();
        assert!(matches!(err, ScramError::ServerRejected(reason) if reason == "invalid-proof"));
    }

    #[test]
    fn nonce_must_strictly_extend() {
        // identical nonce (no server extension)
        {
            let mut session = session();
            let msg = format!("r={CLIENT_NONCE},s=W22ZaJ0SNY7soEsUEjb6gQ==,i=4096");
            assert!(matches!(
                session.advance("pencil", msg.as_bytes()),
                Err(ScramError::NonceMismatch),
            ));
        }

        // different prefix
        let mut session = session();
        let msg = "r=QSXCR+Q6sek8bf92,s=W22ZaJ0SNY7soEsUEjb6gQ==,i=4096";
        assert!(matches!(
            session.advance("pencil", msg.as_bytes()),
            Err(ScramError::NonceMismatch),
        ));
    }

    #[test]
    fn iteration_count_validation() {
        for bad in ["0", "-1", "4096x", "", "04096"] {
            let mut session = session();
            let msg = format!("r={CLIENT_NONCE}ext,s=W22ZaJ0SNY7soEsUEjb6gQ==,i={bad}");
            assert!(
                matches!(session.advance("pencil", msg.as_bytes()), Err(ScramError::InvalidIterations)),
                "iteration count {bad:?} should be rejected",
            );
        }
    }

    #[test]
    fn base64_validation() {
        assert!(is_base64("W22ZaJ0SNY7soEsUEjb6gQ=="));
        assert!(is_base64("QSXCR+Q6sek8bf92"));
        for bad in ["abc", "ab=c", "a!bc", "====", "AAA=AAA=", ""] {
            assert!(!is_base64(bad), "{bad:?} should fail base64 validation");
        }

        let mut session = session();
        let msg = format!("r={CLIENT_NONCE}ext,s=notb64!,i=4096");
        assert!(matches!(
            session.advance("pencil", msg.as_bytes()),
            Err(ScramError::InvalidSalt),
        ));
    }

    #[test]
    fn missing_attributes_rejected() {
        let mut session = session();
        assert!(matches!(
            session.advance("pencil", b"s=W22ZaJ0SNY7soEsUEjb6gQ==,i=4096"),
            Err(ScramError::MissingAttribute('r')),
        ));
    }

    #[test]
    fn mechanism_selection() {
        // -PLUS preferred when certificate material is available
        let session = ScramSession::start_with_nonce(
            ["SCRAM-SHA-256-PLUS", "SCRAM-SHA-256"].into_iter(),
            ChannelBinding::Required(vec![0xAB; 32]),
            CLIENT_NONCE.into(),
        )
        .unwrap();
        assert_eq!(session.mechanism(), Mechanism::ScramSha256Plus);
        assert!(session.response().starts_with("p=tls-server-end-point,,"));

        // no certificate: -PLUS never picked even when offered
        let session = ScramSession::start_with_nonce(
            ["SCRAM-SHA-256-PLUS", "SCRAM-SHA-256"].into_iter(),
            ChannelBinding::Supported,
            CLIENT_NONCE.into(),
        )
        .unwrap();
        assert_eq!(session.mechanism(), Mechanism::ScramSha256);
        assert!(session.response().starts_with("y,,"));

        // unknown mechanisms only
        assert!(matches!(
            ScramSession::start_with_nonce(
                ["PLAIN"].into_iter(),
                ChannelBinding::Unsupported,
                CLIENT_NONCE.into(),
            ),
            Err(ScramError::UnsupportedMechanism),
        ));
    }

    #[test]
    fn channel_binding_token() {
        let end_point = vec![0x11, 0x22, 0x33];
        let mut session = ScramSession::start_with_nonce(
            ["SCRAM-SHA-256-PLUS"].into_iter(),
            ChannelBinding::Required(end_point.clone()),
            CLIENT_NONCE.into(),
        )
        .unwrap();
        session.advance("pencil", SERVER_FIRST.as_bytes()).unwrap();

        let mut cbind_data = b"p=tls-server-end-point,,".to_vec();
        cbind_data.extend_from_slice(&end_point);
        let expect = format!("c={}", BASE64.encode(cbind_data));
        assert!(
            session.response().starts_with(&expect),
            "client-final must carry the bound certificate hash",
        );
    }

    #[test]
    fn out_of_order_messages_rejected() {
        let mut session = session();
        session.advance("pencil", SERVER_FIRST.as_bytes()).unwrap();
        assert!(matches!(
            session.advance("pencil", SERVER_FIRST.as_bytes()),
            Err(ScramError::WrongPhase),
        ));
    }
}
