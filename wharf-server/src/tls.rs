//! Certificate and key loading for the HTTPS listener.
//!
//! Material is read once per generation; a rotated certificate is picked up
//! by the restart that its file change triggers.

use axum_server::tls_rustls::RustlsConfig;
use rustls::ServerConfig;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use std::{
    io::{self, BufReader},
    path::{Path, PathBuf},
    sync::Arc,
};
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("Certificate file not found: {0}")]
    CertificateNotFound(PathBuf),

    #[error("Private key file not found: {0}")]
    PrivateKeyNotFound(PathBuf),

    #[error("Failed to parse certificate: {0}")]
    CertificateParseFailed(String),

    #[error("Failed to parse private key: {0}")]
    PrivateKeyParseFailed(String),

    #[error("No private keys found in file")]
    NoPrivateKeysFound,

    #[error("Multiple private keys found, expected one")]
    MultiplePrivateKeysFound,

    #[error("TLS configuration error: {0}")]
    ConfigurationError(String),

    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
}

impl TlsError {
    /// The certificate or key file does not exist.
    pub fn is_missing(&self) -> bool {
        matches!(
            self,
            TlsError::CertificateNotFound(_) | TlsError::PrivateKeyNotFound(_)
        )
    }
}

/// Install ring as the process-wide rustls provider. Safe to call repeatedly.
pub fn install_crypto_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

/// Build the acceptor configuration from a PEM certificate chain and key.
pub async fn load_rustls_config(cert: &Path, key: &Path) -> Result<RustlsConfig, TlsError> {
    let certs = load_certificates(cert).await?;
    let key = load_private_key(key).await?;

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| TlsError::ConfigurationError(e.to_string()))?;
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    debug!(cert = %cert.display(), "TLS configuration loaded");
    Ok(RustlsConfig::from_config(Arc::new(config)))
}

async fn read_pem(path: &Path) -> Result<Option<Vec<u8>>, TlsError> {
    match tokio::fs::read(path).await {
        Ok(data) => Ok(Some(data)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

/// Load certificates from a PEM file.
pub async fn load_certificates(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let pem_data = read_pem(path)
        .await?
        .ok_or_else(|| TlsError::CertificateNotFound(path.to_path_buf()))?;

    let mut reader = BufReader::new(&pem_data[..]);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::CertificateParseFailed(e.to_string()))?;

    if certs.is_empty() {
        return Err(TlsError::CertificateParseFailed(
            "No certificates found in file".to_string(),
        ));
    }

    Ok(certs)
}

/// Load a PKCS#8 or RSA private key from a PEM file.
pub async fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let pem_data = read_pem(path)
        .await?
        .ok_or_else(|| TlsError::PrivateKeyNotFound(path.to_path_buf()))?;

    let mut reader = BufReader::new(&pem_data[..]);
    let pkcs8 = rustls_pemfile::pkcs8_private_keys(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::PrivateKeyParseFailed(e.to_string()))?;
    if !pkcs8.is_empty() {
        return single_key(pkcs8.into_iter().map(PrivateKeyDer::from).collect());
    }

    let mut reader = BufReader::new(&pem_data[..]);
    let rsa = rustls_pemfile::rsa_private_keys(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::PrivateKeyParseFailed(e.to_string()))?;
    single_key(rsa.into_iter().map(PrivateKeyDer::from).collect())
}

fn single_key(mut keys: Vec<PrivateKeyDer<'static>>) -> Result<PrivateKeyDer<'static>, TlsError> {
    match keys.len() {
        0 => Err(TlsError::NoPrivateKeysFound),
        1 => Ok(keys.remove(0)),
        _ => Err(TlsError::MultiplePrivateKeysFound),
    }
}
