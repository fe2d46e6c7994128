//! mTLS server configuration.
//!
//! When `TLS_CERT_FILE`, `TLS_KEY_FILE` and `TLS_CA_FILE` are all set the
//! server presents the given certificate and only accepts clients whose
//! certificate chains to the CA.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use tonic::transport::{Certificate, Identity, ServerTlsConfig};
use tracing::{info, warn};

pub const CERT_ENV: &str = "TLS_CERT_FILE";
pub const KEY_ENV: &str = "TLS_KEY_FILE";
pub const CA_ENV: &str = "TLS_CA_FILE";

/// PEM files making up the server's mTLS identity.
#[derive(Debug, Clone, PartialEq)]
pub struct TlsFiles {
    pub cert: PathBuf,
    pub key: PathBuf,
    pub ca: PathBuf,
}

impl TlsFiles {
    pub fn from_env() -> Option<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Resolve the three paths through `lookup`. Returns `None` unless all
    /// of them are set.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Option<Self> {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        match (get(CERT_ENV), get(KEY_ENV), get(CA_ENV)) {
            (Some(cert), Some(key), Some(ca)) => Some(Self {
                cert: cert.into(),
                key: key.into(),
                ca: ca.into(),
            }),
            (None, None, None) => None,
            (cert, key, ca) => {
                warn!(
                    cert = cert.is_some(),
                    key = key.is_some(),
                    ca = ca.is_some(),
                    "partial TLS configuration ignored, all of {CERT_ENV}, {KEY_ENV} and {CA_ENV} are required"
                );
                None
            }
        }
    }
}

fn read(path: &Path) -> anyhow::Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("reading {}", path.display()))
}

fn check_certs(pem: &[u8], path: &Path) -> anyhow::Result<()> {
    let certs = rustls_pemfile::certs(&mut &pem[..])
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("parsing certificates in {}", path.display()))?;
    if certs.is_empty() {
        bail!("no certificate found in {}", path.display());
    }
    Ok(())
}

fn check_key(pem: &[u8], path: &Path) -> anyhow::Result<()> {
    let key = rustls_pemfile::private_key(&mut &pem[..])
        .with_context(|| format!("parsing private key in {}", path.display()))?;
    if key.is_none() {
        bail!("no private key found in {}", path.display());
    }
    Ok(())
}

/// Load and validate the PEM files into a tonic server TLS config that
/// requires client certificates.
pub fn load_server_tls(files: &TlsFiles) -> anyhow::Result<ServerTlsConfig> {
    let cert = read(&files.cert)?;
    let key = read(&files.key)?;
    let ca = read(&files.ca)?;

    check_certs(&cert, &files.cert)?;
    check_key(&key, &files.key)?;
    check_certs(&ca, &files.ca)?;

    info!(cert = %files.cert.display(), ca = %files.ca.display(), "loaded mTLS credentials");
    Ok(ServerTlsConfig::new()
        .identity(Identity::from_pem(cert, key))
        .client_ca_root(Certificate::from_pem(ca)))
}
