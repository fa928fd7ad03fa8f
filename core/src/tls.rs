//! TLS support for the upstream connection.
//!
//! This module turns the configuration's `ssl` option map into a rustls
//! client configuration: certificate authority loading, optional client
//! certificates, ALPN, and session resumption. Peer verification is always
//! on; an option map that tries to disable it is overridden with a warning.

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore};
use rustls_pemfile::{certs, pkcs8_private_keys};
use serde_yaml::Value;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_rustls::{client::TlsStream, TlsConnector};
use tracing::{info, warn};

/// TLS-related errors
#[derive(Error, Debug)]
pub enum TlsError {
    #[error("failed to read certificate material: {0}")]
    CertificateRead(#[from] std::io::Error),

    #[error("failed to parse certificate: {0}")]
    CertificateParse(String),

    #[error("failed to parse private key: {0}")]
    PrivateKeyParse(String),

    #[error("TLS configuration error: {0}")]
    ConfigError(#[from] rustls::Error),

    #[error("no private keys found in key file")]
    NoPrivateKeys,

    #[error("no certificates found in certificate file")]
    NoCertificates,

    #[error("client certificate and key must be configured together")]
    IncompleteClientCert,

    #[error("invalid TLS server name {0:?}")]
    BadServerName(String),

    #[error("bad value for TLS option {key:?}")]
    BadOption { key: String },

    #[error("TLS handshake with {host} failed: {reason}")]
    Handshake { host: String, reason: String },
}

/// Option-map keys the broker recognizes. Keys outside this list are
/// skipped with a warning; keys inside it that have no counterpart in a
/// client-side TLS layer (callback and context machinery, server-only
/// knobs like `client_ca`) are accepted and ignored, also with a warning.
const OPTION_WHITELIST: &[&str] = &[
    "ca",
    "client_ca",
    "cert_file",
    "cert",
    "key_file",
    "key",
    "password_cb",
    "use_cert",
    "dh",
    "verify_mode",
    "verify_callback",
    "reuse_ctx",
    "session_cache_size",
    "session_cache",
    "session_key",
    "npn_protocols",
    "alpn_protocols",
    "server",
    "startHandshake",
];

const IGNORED_OPTIONS: &[&str] = &[
    "client_ca",
    "password_cb",
    "use_cert",
    "dh",
    "verify_callback",
    "reuse_ctx",
    "session_cache",
    "session_key",
    "npn_protocols",
    "server",
    "startHandshake",
];

/// Parsed subset of the `ssl` option map.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TlsSettings {
    pub ca: Option<PathBuf>,
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
    pub alpn_protocols: Vec<String>,
    pub session_cache_size: Option<usize>,
}

impl TlsSettings {
    /// Interpret the raw configuration map.
    pub fn from_map(map: &BTreeMap<String, Value>) -> Result<Self, TlsError> {
        let mut settings = TlsSettings::default();
        for (key, value) in map {
            if !OPTION_WHITELIST.contains(&key.as_str()) {
                warn!(key = %key, "ssl option outside the permitted set, skipping");
                continue;
            }
            if IGNORED_OPTIONS.contains(&key.as_str()) {
                warn!(key = %key, "ssl option has no effect in this TLS layer, ignoring");
                continue;
            }
            match key.as_str() {
                "ca" => settings.ca = Some(path_value(key, value)?),
                "cert_file" | "cert" => settings.cert = Some(path_value(key, value)?),
                "key_file" | "key" => settings.key = Some(path_value(key, value)?),
                "alpn_protocols" => settings.alpn_protocols = string_list(key, value)?,
                "session_cache_size" => {
                    settings.session_cache_size =
                        Some(value.as_u64().ok_or_else(|| TlsError::BadOption {
                            key: key.clone(),
                        })? as usize)
                }
                "verify_mode" => {
                    // Peer verification is force-set; a map asking for less
                    // does not get it.
                    if value.as_str() != Some("peer") {
                        warn!(
                            requested = ?value,
                            "verify_mode is forced to peer verification"
                        );
                    }
                }
                _ => {}
            }
        }
        if settings.cert.is_some() != settings.key.is_some() {
            return Err(TlsError::IncompleteClientCert);
        }
        Ok(settings)
    }
}

fn path_value(key: &str, value: &Value) -> Result<PathBuf, TlsError> {
    value
        .as_str()
        .map(PathBuf::from)
        .ok_or_else(|| TlsError::BadOption {
            key: key.to_string(),
        })
}

fn string_list(key: &str, value: &Value) -> Result<Vec<String>, TlsError> {
    match value {
        Value::String(s) => Ok(vec![s.clone()]),
        Value::Sequence(seq) => seq
            .iter()
            .map(|v| {
                v.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| TlsError::BadOption {
                        key: key.to_string(),
                    })
            })
            .collect(),
        _ => Err(TlsError::BadOption {
            key: key.to_string(),
        }),
    }
}

/// TLS connector wrapper for the upstream stream.
#[derive(Clone)]
pub struct TlsClient {
    connector: TlsConnector,
}

impl TlsClient {
    /// Build a connector from parsed settings.
    pub fn new(settings: &TlsSettings) -> Result<Self, TlsError> {
        let mut roots = RootCertStore::empty();
        match &settings.ca {
            Some(ca_path) => {
                let ca_certs = load_certs(ca_path)?;
                if ca_certs.is_empty() {
                    return Err(TlsError::NoCertificates);
                }
                for cert in ca_certs {
                    roots
                        .add(cert)
                        .map_err(|e| TlsError::CertificateParse(e.to_string()))?;
                }
            }
            None => {
                roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            }
        }

        let builder = ClientConfig::builder().with_root_certificates(roots);
        let mut config = match (&settings.cert, &settings.key) {
            (Some(cert_path), Some(key_path)) => {
                let cert_chain = load_certs(cert_path)?;
                if cert_chain.is_empty() {
                    return Err(TlsError::NoCertificates);
                }
                let mut keys = load_private_keys(key_path)?;
                if keys.is_empty() {
                    return Err(TlsError::NoPrivateKeys);
                }
                builder.with_client_auth_cert(cert_chain, keys.remove(0))?
            }
            _ => builder.with_no_client_auth(),
        };

        if !settings.alpn_protocols.is_empty() {
            config.alpn_protocols = settings
                .alpn_protocols
                .iter()
                .map(|p| p.as_bytes().to_vec())
                .collect();
        }
        if let Some(size) = settings.session_cache_size {
            config.resumption = rustls::client::Resumption::in_memory_sessions(size.max(1));
        }

        info!("TLS connector initialized");
        Ok(Self {
            connector: TlsConnector::from(Arc::new(config)),
        })
    }

    /// Run the handshake against an established TCP stream.
    pub async fn connect(
        &self,
        host: &str,
        stream: TcpStream,
    ) -> Result<TlsStream<TcpStream>, TlsError> {
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|_| TlsError::BadServerName(host.to_string()))?;
        self.connector
            .connect(server_name, stream)
            .await
            .map_err(|e| TlsError::Handshake {
                host: host.to_string(),
                reason: e.to_string(),
            })
    }
}

impl std::fmt::Debug for TlsClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsClient").finish_non_exhaustive()
    }
}

/// Load certificates from a PEM file
fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let cert_file = File::open(path)?;
    let mut reader = BufReader::new(cert_file);

    let certs: Vec<CertificateDer<'static>> = certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::CertificateParse(e.to_string()))?;

    info!("loaded {} certificates from {}", certs.len(), path.display());

    Ok(certs)
}

/// Load private keys from a PEM file
fn load_private_keys(path: &Path) -> Result<Vec<PrivateKeyDer<'static>>, TlsError> {
    let key_file = File::open(path)?;
    let mut reader = BufReader::new(key_file);

    let keys: Vec<PrivateKeyDer<'static>> = pkcs8_private_keys(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::PrivateKeyParse(e.to_string()))?
        .into_iter()
        .map(|k| k.into())
        .collect();

    if keys.is_empty() {
        // Try RSA keys if PKCS8 keys are not found
        let key_file = File::open(path)?;
        let mut reader = BufReader::new(key_file);

        let rsa_keys: Vec<PrivateKeyDer<'static>> = rustls_pemfile::rsa_private_keys(&mut reader)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| TlsError::PrivateKeyParse(e.to_string()))?
            .into_iter()
            .map(|k| k.into())
            .collect();

        info!(
            "loaded {} RSA private keys from {}",
            rsa_keys.len(),
            path.display()
        );
        Ok(rsa_keys)
    } else {
        info!(
            "loaded {} PKCS8 private keys from {}",
            keys.len(),
            path.display()
        );
        Ok(keys)
    }
}
