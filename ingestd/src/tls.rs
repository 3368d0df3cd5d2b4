// ingestd/src/tls.rs
// Server-side TLS setup from PEM cert/key files.

use anyhow::{bail, Context, Result};
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;

/// Load an acceptor from the configured certificate and key. Any failure
/// here is fatal at startup.
pub fn load_acceptor(cert_file: &str, key_file: &str) -> Result<TlsAcceptor> {
    let mut cert_reader = BufReader::new(
        File::open(cert_file).with_context(|| format!("open TLS cert {cert_file}"))?,
    );
    let certs = rustls_pemfile::certs(&mut cert_reader)
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("parse TLS cert {cert_file}"))?;
    if certs.is_empty() {
        bail!("no certificates found in {cert_file}");
    }

    let mut key_reader = BufReader::new(
        File::open(key_file).with_context(|| format!("open TLS key {key_file}"))?,
    );
    let key = rustls_pemfile::private_key(&mut key_reader)
        .with_context(|| format!("parse TLS key {key_file}"))?
        .with_context(|| format!("no private key found in {key_file}"))?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("build TLS server config")?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}
