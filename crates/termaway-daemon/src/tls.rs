//! TLS certificate loading and server config construction.
//!
//! The daemon serves TLS iff both `server.crt` and `server.key` exist in the
//! certificate directory. The pair is provisioned externally (the host
//! application writes it with modes 644/600) and loaded read-only at
//! startup; the daemon never generates certificates itself.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tracing::info;

use crate::errors::DaemonError;

/// Load the PEM cert+key pair from `cert_dir` if both files are present.
///
/// Returns `Ok(None)` when either file is missing; the caller serves
/// plaintext in that case.
pub fn load_cert_pair(
    cert_dir: &Path,
) -> Result<Option<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)>, DaemonError> {
    let cert_path = cert_dir.join("server.crt");
    let key_path = cert_dir.join("server.key");

    if !cert_path.exists() || !key_path.exists() {
        return Ok(None);
    }

    let certs = rustls_pemfile::certs(&mut BufReader::new(
        File::open(&cert_path).map_err(DaemonError::Io)?,
    ))
    .collect::<Result<Vec<_>, _>>()
    .map_err(DaemonError::Io)?;

    if certs.is_empty() {
        return Err(DaemonError::TlsConfig(format!(
            "no certificates found in {}",
            cert_path.display()
        )));
    }

    let key = rustls_pemfile::private_key(&mut BufReader::new(
        File::open(&key_path).map_err(DaemonError::Io)?,
    ))
    .map_err(DaemonError::Io)?
    .ok_or_else(|| {
        DaemonError::TlsConfig(format!("no private key found in {}", key_path.display()))
    })?;

    info!(
        event = "daemon.tls.cert_loaded",
        cert_path = %cert_path.display(),
    );

    Ok(Some((certs, key)))
}

/// Build a `rustls::ServerConfig` from the given cert and key.
///
/// Uses `builder_with_provider` so the crypto provider is explicit and
/// independent of whether `install_default()` has been called.
pub fn build_server_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<Arc<rustls::ServerConfig>, DaemonError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| DaemonError::TlsConfig(e.to_string()))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| DaemonError::TlsConfig(e.to_string()))?;
    Ok(Arc::new(config))
}
