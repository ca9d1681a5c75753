use crate::error::{self, Result};

use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use snafu::{OptionExt, ResultExt};

use std::fs::File;
use std::io::BufReader;

/// Installs `ring` as the process-wide rustls provider.
///
/// The provider is normally inferred from rustls feature flags, but more than one enabled provider makes the
/// choice ambiguous and rustls panics on first use.
pub(crate) fn install_default_crypto_provider() -> Result<()> {
    CryptoProvider::install_default(rustls::crypto::ring::default_provider())
        .map_err(|_| error::Error::CryptoProvider)
}

fn open(path: &str) -> Result<BufReader<File>> {
    File::open(path)
        .map(BufReader::new)
        .context(error::ReadTlsFileSnafu { path })
}

fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>> {
    rustls_pemfile::certs(&mut open(path)?)
        .collect::<std::result::Result<Vec<_>, _>>()
        .context(error::ReadTlsFileSnafu { path })
}

fn load_private_key(path: &str) -> Result<PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut open(path)?)
        .context(error::ReadTlsFileSnafu { path })?
        .context(error::MissingPrivateKeySnafu { path })
}

/// Builds the webhook's TLS config from the PEM certificate chain and key mounted into the Pod.
pub(crate) fn server_config(cert_path: &str, key_path: &str) -> Result<ServerConfig> {
    let certs = load_certs(cert_path)?;
    let key = load_private_key(key_path)?;
    ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context(error::TlsConfigSnafu)
}
