//! Camouflage TLS identity
//!
//! The listener presents a throwaway self-signed certificate for the
//! configured server name, generated at startup. Clients authenticate with
//! the shared password, not the certificate chain.

use crate::{Error, Result};
use rustls::pki_types::{CertificateDer, PrivatePkcs8KeyDer};
use std::sync::Arc;

/// Build a TLS server config around a fresh self-signed certificate
pub fn self_signed_config(sni: &str) -> Result<Arc<rustls::ServerConfig>> {
    let certified = rcgen::generate_simple_self_signed(vec![sni.to_string()])
        .map_err(|e| Error::tls(format!("certificate generation failed: {}", e)))?;

    let cert_der: CertificateDer<'static> = certified.cert.der().clone();
    let key_der = PrivatePkcs8KeyDer::from(certified.key_pair.serialize_der());

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert_der], key_der.into())?;

    Ok(Arc::new(config))
}
