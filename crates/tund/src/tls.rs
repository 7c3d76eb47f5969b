//! TLS support for the tunnel listener

use anyhow::{anyhow, bail, Context, Result};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use rustls_pemfile::{certs, private_key};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;
use tracing::info;

/// TLS settings for accepted connections
#[derive(Clone)]
pub struct TlsConfig {
    acceptor: Option<TlsAcceptor>,
}

impl std::fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsConfig")
            .field("enabled", &self.acceptor.is_some())
            .finish()
    }
}

impl TlsConfig {
    /// Plain TCP
    pub fn disabled() -> Self {
        Self { acceptor: None }
    }

    /// Build an acceptor from a PEM certificate chain and private key
    pub fn from_files<P: AsRef<Path>>(cert_path: P, key_path: P) -> Result<Self> {
        let chain = load_certs(cert_path.as_ref())?;
        let key = load_key(key_path.as_ref())?;

        // TLS 1.2 and 1.3, the rustls defaults
        let server_config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(chain, key)
            .context("Invalid certificate/key pair")?;

        info!("TLS enabled for the tunnel listener");
        Ok(Self {
            acceptor: Some(TlsAcceptor::from(Arc::new(server_config))),
        })
    }

    /// Whether connections go through a TLS handshake
    pub fn is_enabled(&self) -> bool {
        self.acceptor.is_some()
    }

    /// Acceptor for the TLS handshake, if enabled
    pub fn acceptor(&self) -> Option<&TlsAcceptor> {
        self.acceptor.as_ref()
    }
}

fn open_pem(path: &Path, what: &str) -> Result<BufReader<File>> {
    info!("Loading TLS {} from {:?}", what, path);
    let file = File::open(path).with_context(|| format!("Failed to open {} {:?}", what, path))?;
    Ok(BufReader::new(file))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = open_pem(path, "certificate")?;
    let chain = certs(&mut reader)
        .collect::<std::io::Result<Vec<_>>>()
        .with_context(|| format!("Malformed certificate PEM in {:?}", path))?;

    if chain.is_empty() {
        bail!("No certificates in {:?}", path);
    }
    Ok(chain)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let mut reader = open_pem(path, "private key")?;
    private_key(&mut reader)
        .with_context(|| format!("Malformed private key PEM in {:?}", path))?
        .ok_or_else(|| anyhow!("No private key in {:?}", path))
}
