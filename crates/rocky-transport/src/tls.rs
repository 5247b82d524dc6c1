//! TLS configuration for relay endpoints

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::RootCertStore;
use tokio_rustls::TlsAcceptor;

use crate::{TransportError, TransportResult};

/// TLS mode of an endpoint
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum TlsSettings {
    /// Plain TCP
    #[default]
    Disabled,
    /// Server-authenticated TLS
    Server { cert_path: PathBuf, key_path: PathBuf },
    /// Mutual TLS; clients must present a certificate issued by the CA bundle
    Mutual {
        cert_path: PathBuf,
        key_path: PathBuf,
        ca_path: PathBuf,
    },
}

impl TlsSettings {
    pub fn is_enabled(&self) -> bool {
        !matches!(self, TlsSettings::Disabled)
    }

    pub fn describe(&self) -> &'static str {
        match self {
            TlsSettings::Disabled => "plain",
            TlsSettings::Server { .. } => "tls",
            TlsSettings::Mutual { .. } => "mtls",
        }
    }

    /// Build the acceptor for this mode; `None` for plain endpoints
    pub fn build_acceptor(&self) -> TransportResult<Option<TlsAcceptor>> {
        let config = match self {
            TlsSettings::Disabled => return Ok(None),
            TlsSettings::Server {
                cert_path,
                key_path,
            } => {
                ensure_crypto_provider();
                let certs = load_certs(cert_path)?;
                let key = load_private_key(key_path)?;

                rustls::ServerConfig::builder()
                    .with_no_client_auth()
                    .with_single_cert(certs, key)
                    .map_err(|e| TransportError::TlsError(format!("Invalid cert/key: {}", e)))?
            }
            TlsSettings::Mutual {
                cert_path,
                key_path,
                ca_path,
            } => {
                ensure_crypto_provider();
                let certs = load_certs(cert_path)?;
                let key = load_private_key(key_path)?;
                let roots = load_client_roots(ca_path)?;

                let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
                    .build()
                    .map_err(|e| {
                        TransportError::TlsError(format!("Invalid client CA bundle: {}", e))
                    })?;

                rustls::ServerConfig::builder()
                    .with_client_cert_verifier(verifier)
                    .with_single_cert(certs, key)
                    .map_err(|e| TransportError::TlsError(format!("Invalid cert/key: {}", e)))?
            }
        };

        Ok(Some(TlsAcceptor::from(Arc::new(config))))
    }
}

// Initialize rustls crypto provider
static CRYPTO_PROVIDER_INIT: std::sync::Once = std::sync::Once::new();

pub fn ensure_crypto_provider() {
    CRYPTO_PROVIDER_INIT.call_once(|| {
        if rustls::crypto::ring::default_provider()
            .install_default()
            .is_err()
        {
            tracing::debug!("Rustls crypto provider already installed");
        }
    });
}

fn load_certs(path: &Path) -> TransportResult<Vec<CertificateDer<'static>>> {
    let file = File::open(path).map_err(|e| {
        TransportError::TlsError(format!(
            "Failed to open cert file {}: {}",
            path.display(),
            e
        ))
    })?;
    let mut reader = BufReader::new(file);

    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TransportError::TlsError(format!("Failed to parse certs: {}", e)))?;

    if certs.is_empty() {
        return Err(TransportError::TlsError(format!(
            "No certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> TransportResult<PrivateKeyDer<'static>> {
    let file = File::open(path).map_err(|e| {
        TransportError::TlsError(format!("Failed to open key file {}: {}", path.display(), e))
    })?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| TransportError::TlsError(format!("Failed to parse key: {}", e)))?
        .ok_or_else(|| TransportError::TlsError("No private key found".to_string()))
}

fn load_client_roots(path: &Path) -> TransportResult<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path)? {
        roots
            .add(cert)
            .map_err(|e| TransportError::ConfigurationError(format!("Invalid CA cert: {}", e)))?;
    }
    Ok(roots)
}
