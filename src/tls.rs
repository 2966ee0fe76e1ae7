//! Server certificate loading and `rustls::ServerConfig` construction.
//!
//! Certificate *generation* and OS trust-store installation are external
//! collaborators (§1); this module only turns an already-issued cert+key
//! pair on disk into a usable TLS server configuration, restricted to TLS
//! 1.2/1.3 with no client-certificate requirement (§4.G step 2).

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use rustls_pemfile::{certs, pkcs8_private_keys};

pub fn cert_reader<P: AsRef<Path>>(cert_path: P) -> Result<Vec<CertificateDer<'static>>> {
    let cert_file = File::open(cert_path)?;
    let mut reader = BufReader::new(cert_file);
    let parsed = certs(&mut reader);

    let certs: Result<Vec<CertificateDer>, _> = parsed.map(|res| res.map(CertificateDer::from)).collect();
    Ok(certs?)
}

pub fn privkey_reader<P: AsRef<Path>>(key_path: P) -> Result<PrivateKeyDer<'static>> {
    let key_file = File::open(key_path.as_ref())?;
    let mut reader = BufReader::new(key_file);

    let key = pkcs8_private_keys(&mut reader)
        .next()
        .transpose()?
        .ok_or_else(|| anyhow::anyhow!("no PKCS8 key found in {}", key_path.as_ref().display()))?;

    Ok(PrivateKeyDer::Pkcs8(key))
}

/// Loads the server certificate chain and key and builds a TLS 1.2/1.3
/// server config with no client-certificate requirement. Called once at
/// startup (§3 ServerCert); the resulting config is shared read-only by every
/// accepted connection.
pub fn build_server_config<P: AsRef<Path>>(cert_path: P, key_path: P) -> Result<Arc<ServerConfig>> {
    let cert_chain = cert_reader(&cert_path)?;
    let key = privkey_reader(&key_path)?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(cert_chain, key)?;

    Ok(Arc::new(config))
}
