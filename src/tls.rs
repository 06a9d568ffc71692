//! Client TLS for target connections, built on tokio-rustls.
//!
//! Trust comes from an explicit CA bundle when configured, otherwise from
//! the webpki roots. `tls_allow_invalid_certs` swaps the verifier for one
//! that accepts anything; it exists for development targets with self-signed
//! certificates and is loudly logged.

use crate::config::TargetConfig;
use crate::error::{Error, Result};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls;
use tokio_rustls::rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use tokio_rustls::rustls::{DigitallySignedStruct, SignatureScheme};
use tokio_rustls::TlsConnector;

/// Open a TLS connection to `host:port` per the target configuration.
pub async fn connect(cfg: &TargetConfig, host: &str, port: u16) -> Result<TlsStream<TcpStream>> {
    let connector = connector(cfg)?;
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|_| Error::Msg(format!("invalid TLS server name '{host}'")))?;
    let stream = TcpStream::connect((host, port)).await?;
    let tls = connector.connect(server_name, stream).await?;
    tracing::info!(host, port, "TLS connection established");
    Ok(tls)
}

/// Build the connector: trust roots (or the accept-anything verifier), then
/// the optional client identity for mutual TLS.
pub fn connector(cfg: &TargetConfig) -> Result<TlsConnector> {
    if !cfg.tls_enabled {
        return Err(Error::Msg("TLS not enabled for target".into()));
    }

    let identity = client_identity(cfg)?;
    let builder = rustls::ClientConfig::builder();

    let config = if cfg.tls_allow_invalid_certs {
        tracing::warn!("TLS certificate validation disabled - this is insecure!");
        let builder = builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert));
        match identity {
            Some((chain, key)) => builder.with_client_auth_cert(chain, key).map_err(tls_err)?,
            None => builder.with_no_client_auth(),
        }
    } else {
        let builder = builder.with_root_certificates(trust_roots(cfg)?);
        match identity {
            Some((chain, key)) => builder.with_client_auth_cert(chain, key).map_err(tls_err)?,
            None => builder.with_no_client_auth(),
        }
    };

    Ok(TlsConnector::from(Arc::new(config)))
}

fn trust_roots(cfg: &TargetConfig) -> Result<rustls::RootCertStore> {
    let mut roots = rustls::RootCertStore::empty();
    match &cfg.tls_ca_file {
        Some(path) => {
            for cert in read_pem_certs(path)? {
                roots.add(cert).map_err(tls_err)?;
            }
            if roots.is_empty() {
                return Err(Error::Msg(format!("no CA certificates in {path}")));
            }
        }
        None => {
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        }
    }
    Ok(roots)
}

/// Certificate chain and key for mutual TLS, when both are configured.
fn client_identity(
    cfg: &TargetConfig,
) -> Result<Option<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)>> {
    let (Some(cert_path), Some(key_path)) = (&cfg.tls_client_cert, &cfg.tls_client_key) else {
        return Ok(None);
    };

    let chain = read_pem_certs(cert_path)?;
    if chain.is_empty() {
        return Err(Error::Msg(format!("no certificates in {cert_path}")));
    }

    let key_pem = std::fs::read(key_path)?;
    let key = rustls_pemfile::pkcs8_private_keys(&mut &key_pem[..])
        .next()
        .ok_or_else(|| Error::Msg(format!("no PKCS#8 private key in {key_path}")))??;

    Ok(Some((chain, PrivateKeyDer::from(key))))
}

fn read_pem_certs(path: &str) -> Result<Vec<CertificateDer<'static>>> {
    let pem = std::fs::read(path)?;
    rustls_pemfile::certs(&mut &pem[..])
        .collect::<std::io::Result<Vec<_>>>()
        .map_err(Error::Io)
}

fn tls_err(e: rustls::Error) -> Error {
    Error::Msg(format!("TLS configuration: {e}"))
}

/// Verifier behind `tls_allow_invalid_certs`: passes every certificate and
/// handshake signature. Development only.
#[derive(Debug)]
struct AcceptAnyServerCert;

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}
