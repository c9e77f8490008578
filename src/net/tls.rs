//! TLS upgrade and the `tls-server-end-point` channel binding hash.
use std::{io, sync::Arc};

use sha2::{Digest, Sha256, Sha384, Sha512};
use tokio::net::TcpStream;
use tokio_rustls::{
    TlsConnector,
    client::TlsStream,
    rustls::{ClientConfig, pki_types::ServerName},
};

/// A TLS client stream plus the channel binding hash of the peer certificate.
pub struct TlsSocket {
    stream: TlsStream<TcpStream>,
    server_end_point: Option<Vec<u8>>,
}

impl TlsSocket {
    pub fn stream_mut(&mut self) -> &mut TlsStream<TcpStream> {
        &mut self.stream
    }

    pub fn stream_ref(&self) -> &TlsStream<TcpStream> {
        &self.stream
    }

    /// `tls-server-end-point` hash of the peer certificate, if one was
    /// presented and its signature algorithm is understood.
    pub fn server_end_point(&self) -> Option<&[u8]> {
        self.server_end_point.as_deref()
    }
}

/// Perform the TLS client handshake and capture the peer certificate hash.
pub async fn handshake(
    tcp: TcpStream,
    host: &str,
    config: Arc<ClientConfig>,
) -> io::Result<TlsSocket> {
    let name = ServerName::try_from(host.to_owned())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    let stream = TlsConnector::from(config).connect(name, tcp).await?;

    let server_end_point = stream
        .get_ref()
        .1
        .peer_certificates()
        .and_then(|certs| certs.first())
        .and_then(|cert| tls_server_end_point(cert.as_ref()));

    Ok(TlsSocket { stream, server_end_point })
}

/// Compute the RFC 5929 `tls-server-end-point` binding of a DER certificate.
///
/// The hash function is the one from the certificate's signatureAlgorithm,
/// except MD5 and SHA-1 are replaced by SHA-256. This substitution matches
/// the PostgreSQL server; changing it breaks SCRAM-SHA-256-PLUS against real
/// servers.
pub fn tls_server_end_point(der: &[u8]) -> Option<Vec<u8>> {
    let hash = match signature_algorithm_oid(der)? {
        // md5WithRSAEncryption, sha1WithRSAEncryption, ecdsa-with-SHA1:
        // hash is MD5 or SHA-1, use SHA-256 instead
        oid::RSA_MD5 | oid::RSA_SHA1 | oid::ECDSA_SHA1 => CertHash::Sha256,
        oid::RSA_SHA256 | oid::ECDSA_SHA256 => CertHash::Sha256,
        oid::RSA_SHA384 | oid::ECDSA_SHA384 => CertHash::Sha384,
        oid::RSA_SHA512 | oid::ECDSA_SHA512 => CertHash::Sha512,
        // unrecognized algorithm (e.g. Ed25519): SHA-256 is the interoperable
        // default
        _ => CertHash::Sha256,
    };

    let digest = match hash {
        CertHash::Sha256 => <[u8; 32]>::from(Sha256::digest(der)).to_vec(),
        CertHash::Sha384 => <[u8; 48]>::from(Sha384::digest(der)).to_vec(),
        CertHash::Sha512 => <[u8; 64]>::from(Sha512::digest(der)).to_vec(),
    };

    Some(digest)
}

enum CertHash {
    Sha256,
    Sha384,
    Sha512,
}

mod oid {
    //! DER-encoded OID bodies of the signature algorithms we recognize.
    pub const RSA_MD5: &[u8] = &[0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x01, 0x01, 0x04];
    pub const RSA_SHA1: &[u8] = &[0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x01, 0x01, 0x05];
    pub const RSA_SHA256: &[u8] = &[0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x01, 0x01, 0x0b];
    pub const RSA_SHA384: &[u8] = &[0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x01, 0x01, 0x0c];
    pub const RSA_SHA512: &[u8] = &[0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x01, 0x01, 0x0d];
    pub const ECDSA_SHA1: &[u8] = &[0x2a, 0x86, 0x48, 0xce, 0x3d, 0x04, 0x01];
    pub const ECDSA_SHA256: &[u8] = &[0x2a, 0x86, 0x48, 0xce, 0x3d, 0x04, 0x03, 0x02];
    pub const ECDSA_SHA384: &[u8] = &[0x2a, 0x86, 0x48, 0xce, 0x3d, 0x04, 0x03, 0x03];
    pub const ECDSA_SHA512: &[u8] = &[0x2a, 0x86, 0x48, 0xce, 0x3d, 0x04, 0x03, 0x04];
}

/// Extract the signatureAlgorithm OID from a DER `Certificate`.
///
/// ```text
/// Certificate ::= SEQUENCE {
///     tbsCertificate       TBSCertificate,   -- skipped
///     signatureAlgorithm   AlgorithmIdentifier { OBJECT IDENTIFIER, ... },
///     signatureValue       BIT STRING }
/// ```
///
/// Only the three outer TLV hops are walked; no general ASN.1 parsing.
fn signature_algorithm_oid(der: &[u8]) -> Option<&[u8]> {
    // outer Certificate SEQUENCE
    let (tag, certificate, _) = read_tlv(der)?;
    if tag != 0x30 {
        return None;
    }
    // tbsCertificate
    let (_, _, rest) = read_tlv(certificate)?;
    // signatureAlgorithm AlgorithmIdentifier
    let (tag, algorithm, _) = read_tlv(rest)?;
    if tag != 0x30 {
        return None;
    }
    // first element: the OBJECT IDENTIFIER
    let (tag, oid, _) = read_tlv(algorithm)?;
    if tag != 0x06 {
        return None;
    }
    Some(oid)
}

/// Read one DER TLV; returns (tag, value, remainder).
fn read_tlv(buf: &[u8]) -> Option<(u8, &[u8], &[u8])> {
    let (&tag, buf) = buf.split_first()?;
    let (&first, mut buf) = buf.split_first()?;

    let len = if first & 0x80 == 0 {
        first as usize
    } else {
        let n = (first & 0x7f) as usize;
        if n == 0 || n > 4 || buf.len() < n {
            return None;
        }
        let mut len = 0usize;
        for _ in 0..n {
            let (&b, rest) = buf.split_first()?;
            len = len << 8 | b as usize;
            buf = rest;
        }
        len
    };

    if buf.len() < len {
        return None;
    }
    let (value, rest) = buf.split_at(len);
    Some((tag, value, rest))
}

#[cfg(test)]
mod test {
    use super::*;

    /// Hand-built DER: SEQUENCE { SEQUENCE {} (tbs), SEQUENCE { OID }, BIT STRING {} }
    fn fake_cert(oid_body: &[u8]) -> Vec<u8> {
        let mut alg = vec![0x06, oid_body.len() as u8];
        alg.extend_from_slice(oid_body);

        let mut inner = vec![0x30, 0x00]; // empty tbsCertificate
        inner.extend_from_slice(&[0x30, alg.len() as u8]);
        inner.extend_from_slice(&alg);
        inner.extend_from_slice(&[0x03, 0x01, 0x00]); // empty BIT STRING

        let mut cert = vec![0x30, inner.len() as u8];
        cert.extend_from_slice(&inner);
        cert
    }

    #[test]
    fn oid_extraction() {
        let cert = fake_cert(oid::RSA_SHA256);
        assert_eq!(signature_algorithm_oid(&cert), Some(oid::RSA_SHA256));
    }

    #[test]
    fn sha1_substituted_with_sha256() {
        let cert = fake_cert(oid::RSA_SHA1);
        let expect = <[u8; 32]>::from(Sha256::digest(&cert)).to_vec();
        assert_eq!(tls_server_end_point(&cert), Some(expect));
    }

    #[test]
    fn sha384_used_as_is() {
        let cert = fake_cert(oid::RSA_SHA384);
        let expect = <[u8; 48]>::from(Sha384::digest(&cert)).to_vec();
        assert_eq!(tls_server_end_point(&cert), Some(expect));
    }

    #[test]
    fn long_form_length() {
        // SEQUENCE with 0x81-prefixed length
        let mut body = vec![0u8; 130];
        body[0] = 0x30;
        body[1] = 0x00;
        let mut der = vec![0x30, 0x81, 128];
        der.extend_from_slice(&body[..128]);
        let (tag, value, _) = read_tlv(&der).unwrap();
        assert_eq!(tag, 0x30);
        assert_eq!(value.len(), 128);
    }

    #[test]
    fn truncated_rejected() {
        assert!(read_tlv(&[0x30]).is_none());
        assert!(read_tlv(&[0x30, 0x05, 0x01]).is_none());
        assert_eq!(signature_algorithm_oid(&[0x04, 0x00]), None);
    }
}
