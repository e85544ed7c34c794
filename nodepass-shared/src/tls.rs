//! TLS material for the control channel (§3 tlsMode, §4.1, §9).
//!
//! Mode `"0"` is plain TCP. Mode `"1"` generates an in-memory self-signed
//! TLS 1.3 identity once at startup. Mode `"2"` loads a certificate/key pair
//! from disk and reloads it on `certReloadInterval` via a background task,
//! mirroring the teacher's `GetCertificate`-callback pattern but built on
//! `rustls::server::ResolvesServerCert` instead of a Go-style callback.

use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use tracing::{debug, warn};

use crate::config::TlsMode;
use crate::error::ConfigError;

/// Builds the `rustls::ServerConfig` to wrap the control listener in, or
/// `None` for plain TCP. For mode `"2"` also spawns the periodic reload
/// task and returns its join handle so the caller can let it run for the
/// lifetime of the tunnel.
pub fn server_tls_config(
    mode: TlsMode,
    cert_path: Option<&str>,
    key_path: Option<&str>,
    reload_interval: Duration,
) -> Result<Option<(Arc<rustls::ServerConfig>, Option<tokio::task::JoinHandle<()>>)>, ConfigError> {
    match mode {
        TlsMode::Plain => Ok(None),
        TlsMode::SelfSigned => {
            let key = self_signed_certified_key()?;
            let resolver = Arc::new(StaticResolver(Arc::new(key)));
            let cfg = build_server_config(resolver);
            Ok(Some((cfg, None)))
        }
        TlsMode::FileBacked => {
            let cert_path = cert_path.ok_or(ConfigError::MissingTlsMaterial)?.to_string();
            let key_path = key_path.ok_or(ConfigError::MissingTlsMaterial)?.to_string();

            let initial = load_certified_key(&cert_path, &key_path)?;
            let resolver = Arc::new(ReloadingResolver {
                current: RwLock::new(Arc::new(initial)),
            });
            let cfg = build_server_config(resolver.clone());

            let handle = tokio::spawn(reload_loop(resolver, cert_path, key_path, reload_interval));
            Ok(Some((cfg, Some(handle))))
        }
    }
}

fn build_server_config(resolver: Arc<dyn ResolvesServerCert>) -> Arc<rustls::ServerConfig> {
    Arc::new(
        rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_cert_resolver(resolver),
    )
}

async fn reload_loop(
    resolver: Arc<ReloadingResolver>,
    cert_path: String,
    key_path: String,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await; // first tick fires immediately; we already loaded once.
    loop {
        ticker.tick().await;
        match load_certified_key(&cert_path, &key_path) {
            Ok(key) => {
                *resolver.current.write().expect("lock poisoned") = Arc::new(key);
                debug!(cert_path, "reloaded TLS certificate");
            }
            Err(e) => warn!(cert_path, error = %e, "failed to reload TLS certificate, keeping previous"),
        }
    }
}

struct StaticResolver(Arc<CertifiedKey>);

impl std::fmt::Debug for StaticResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticResolver").finish()
    }
}

impl ResolvesServerCert for StaticResolver {
    fn resolve(&self, _client_hello: ClientHello) -> Option<Arc<CertifiedKey>> {
        Some(self.0.clone())
    }
}

struct ReloadingResolver {
    current: RwLock<Arc<CertifiedKey>>,
}

impl std::fmt::Debug for ReloadingResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReloadingResolver").finish()
    }
}

impl ResolvesServerCert for ReloadingResolver {
    fn resolve(&self, _client_hello: ClientHello) -> Option<Arc<CertifiedKey>> {
        Some(self.current.read().expect("lock poisoned").clone())
    }
}

fn self_signed_certified_key() -> Result<CertifiedKey, ConfigError> {
    let rcgen::CertifiedKey { cert, key_pair } =
        rcgen::generate_simple_self_signed(["nodepass.local".to_string()])
            .map_err(|e| ConfigError::InvalidUrl(format!("failed to generate self-signed cert: {e}")))?;

    let cert_der = rustls::pki_types::CertificateDer::from(cert.der().to_vec());
    let key_der = rustls::pki_types::PrivateKeyDer::try_from(key_pair.serialize_der())
        .map_err(|e| ConfigError::InvalidUrl(format!("invalid generated key: {e}")))?;

    let signing_key = rustls::crypto::ring::sign::any_supported_type(&key_der)
        .map_err(|e| ConfigError::InvalidUrl(format!("unsupported key type: {e}")))?;

    Ok(CertifiedKey::new(vec![cert_der], signing_key))
}

fn load_certified_key(cert_path: &str, key_path: &str) -> Result<CertifiedKey, ConfigError> {
    let cert_bytes = std::fs::read(PathBuf::from(cert_path))
        .map_err(|e| ConfigError::InvalidUrl(format!("reading {cert_path}: {e}")))?;
    let key_bytes = std::fs::read(PathBuf::from(key_path))
        .map_err(|e| ConfigError::InvalidUrl(format!("reading {key_path}: {e}")))?;

    let certs: Vec<_> = rustls_pemfile::certs(&mut cert_bytes.as_slice())
        .collect::<Result<_, _>>()
        .map_err(|e| ConfigError::InvalidUrl(format!("parsing {cert_path}: {e}")))?;
    if certs.is_empty() {
        return Err(ConfigError::InvalidUrl(format!("{cert_path} contains no certificates")));
    }

    let key = rustls_pemfile::private_key(&mut key_bytes.as_slice())
        .map_err(|e| ConfigError::InvalidUrl(format!("parsing {key_path}: {e}")))?
        .ok_or_else(|| ConfigError::InvalidUrl(format!("{key_path} contains no private key")))?;

    let signing_key = rustls::crypto::ring::sign::any_supported_type(&key)
        .map_err(|e| ConfigError::InvalidUrl(format!("unsupported key type in {key_path}: {e}")))?;

    Ok(CertifiedKey::new(certs, signing_key))
}

/// Builds a `rustls::ClientConfig` that accepts whatever leaf certificate
/// the server presents without chasing a CA chain. The control channel
/// carries no credential beyond reachability (Non-goals, §1): TLS here is
/// opportunistic transport encryption, not endpoint authentication.
pub fn client_tls_config() -> Arc<rustls::ClientConfig> {
    Arc::new(
        rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
            .with_no_client_auth(),
    )
}

#[derive(Debug)]
struct AcceptAnyServerCert;

impl rustls::client::danger::ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
