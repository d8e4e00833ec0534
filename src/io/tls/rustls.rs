//! TLS transport backed by rustls through async-tls. Certificates come
//! from PEM files, or, when none are configured, from a freshly generated
//! self-signed certificate so STARTTLS works out of the box in dev setups.

use crate::io::tls::{TlsUpgrade, TlsUpgradeFut};
use crate::io::Io;
use crate::smtp::SmtpError;
use async_tls::TlsAcceptor;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// TLS transport settings: certificate and key paths, plus the names to
/// bake into a self-signed certificate when no files are given.
#[derive(Debug, Clone, Default)]
pub struct TlsOptions {
    pub cert_path: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
    /// Subject names for the self-signed fallback. Filled from the
    /// configured hosts and their resolved addresses.
    pub subject_names: Vec<String>,
}

#[derive(Clone)]
pub struct RustlsProvider {
    acceptor: TlsAcceptor,
}

impl From<TlsAcceptor> for RustlsProvider {
    fn from(acceptor: TlsAcceptor) -> Self {
        RustlsProvider { acceptor }
    }
}

impl RustlsProvider {
    /// Builds the provider from the options: PEM files when configured,
    /// a self-signed certificate otherwise.
    pub fn from_options(options: &TlsOptions) -> Result<Self, SmtpError> {
        let config = match (&options.cert_path, &options.key_path) {
            (Some(cert), Some(key)) => server_config_from_files(cert, key)?,
            (None, None) => {
                let (cn, sans) = self_signed_names(&options.subject_names);
                warn!(
                    "no certificate configured, generating a self-signed one for {}",
                    cn
                );
                self_signed_server_config(&cn, &sans)?
            }
            _ => {
                return Err(SmtpError::Config(
                    "cert_path and key_path must be given together".to_owned(),
                ))
            }
        };
        Ok(RustlsProvider {
            acceptor: TlsAcceptor::from(Arc::new(config)),
        })
    }
}

impl TlsUpgrade for RustlsProvider {
    fn upgrade_to_tls(&self, stream: Box<dyn Io>) -> TlsUpgradeFut {
        let accept = self.acceptor.accept(stream);
        Box::pin(async move {
            let encrypted = accept.await?;
            let encrypted: Box<dyn Io> = Box::new(encrypted);
            Ok(encrypted)
        })
    }
}

impl std::fmt::Debug for RustlsProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RustlsProvider").finish()
    }
}

fn server_config_from_files(
    cert_path: &Path,
    key_path: &Path,
) -> Result<rustls::ServerConfig, SmtpError> {
    let cert_data = std::fs::read(cert_path)
        .map_err(|e| SmtpError::Tls(format!("could not read {:?}: {}", cert_path, e)))?;
    let mut cert_reader = std::io::BufReader::new(&cert_data[..]);
    let certs: Vec<rustls::Certificate> = rustls_pemfile::certs(&mut cert_reader)
        .map_err(|e| SmtpError::Tls(format!("could not parse certs in {:?}: {}", cert_path, e)))?
        .into_iter()
        .map(rustls::Certificate)
        .collect();
    if certs.is_empty() {
        return Err(SmtpError::Tls(format!("no certs found in {:?}", cert_path)));
    }

    let key_data = std::fs::read(key_path)
        .map_err(|e| SmtpError::Tls(format!("could not read {:?}: {}", key_path, e)))?;
    let mut key_reader = std::io::BufReader::new(&key_data[..]);
    let mut keys = rustls_pemfile::pkcs8_private_keys(&mut key_reader)
        .map_err(|e| SmtpError::Tls(format!("could not parse keys in {:?}: {}", key_path, e)))?;
    if keys.is_empty() {
        let mut key_reader = std::io::BufReader::new(&key_data[..]);
        keys = rustls_pemfile::rsa_private_keys(&mut key_reader)
            .map_err(|e| SmtpError::Tls(format!("could not parse keys in {:?}: {}", key_path, e)))?;
    }
    let key = keys
        .into_iter()
        .next()
        .map(rustls::PrivateKey)
        .ok_or_else(|| SmtpError::Tls(format!("no private key found in {:?}", key_path)))?;

    build_server_config(certs, key)
}

fn self_signed_server_config(cn: &str, sans: &[String]) -> Result<rustls::ServerConfig, SmtpError> {
    let mut params = rcgen::CertificateParams::new(sans.to_vec());
    params
        .distinguished_name
        .push(rcgen::DnType::CommonName, cn);
    let cert = rcgen::Certificate::from_params(params)
        .map_err(|e| SmtpError::Tls(format!("self-signed cert generation failed: {}", e)))?;
    let der = cert
        .serialize_der()
        .map_err(|e| SmtpError::Tls(format!("self-signed cert serialization failed: {}", e)))?;
    let key = rustls::PrivateKey(cert.serialize_private_key_der());
    build_server_config(vec![rustls::Certificate(der)], key)
}

fn build_server_config(
    certs: Vec<rustls::Certificate>,
    key: rustls::PrivateKey,
) -> Result<rustls::ServerConfig, SmtpError> {
    rustls::ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| SmtpError::Tls(e.to_string()))
}

/// CN and SANs for the self-signed fallback. A loopback or `localhost`
/// first candidate gets the conventional `localhost.local` CN.
fn self_signed_names(candidates: &[String]) -> (String, Vec<String>) {
    let cn = match candidates.first() {
        None => "localhost.local".to_owned(),
        Some(first) => {
            let is_loopback = first == "localhost"
                || first
                    .parse::<IpAddr>()
                    .map(|ip| ip.is_loopback())
                    .unwrap_or(false);
            if is_loopback {
                "localhost.local".to_owned()
            } else {
                first.clone()
            }
        }
    };
    let mut sans: Vec<String> = candidates.to_vec();
    if !sans.iter().any(|san| *san == cn) {
        sans.push(cn.clone());
    }
    (cn, sans)
}
