//! Broker configuration.
//!
//! A YAML key/value document. `socket` and `graylog` are required; the
//! rest are optional features. The configuration is immutable between
//! reloads: `SIGUSR1` re-reads the file, and a reload that fails to parse
//! or validate keeps the previous configuration in force.

use serde::Deserialize;
use serde_yaml::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed config: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// The recognized configuration document.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Config {
    /// Path of the Unix intake socket.
    pub socket: PathBuf,

    /// Octal mode bits applied to the intake socket after binding.
    #[serde(default, deserialize_with = "de_perms")]
    pub perms: Option<u32>,

    /// Upstream endpoint, `host` or `host:port` (default port 12222).
    pub graylog: String,

    /// TLS option map; presence switches the upstream to TLS.
    #[serde(default)]
    pub ssl: Option<BTreeMap<String, Value>>,

    /// Spool file path. Unset disables crash persistence.
    #[serde(default)]
    pub buffer: Option<PathBuf>,

    /// Status file path. Unset disables status snapshots.
    #[serde(default)]
    pub status: Option<PathBuf>,

    /// Pidfile path. Unset disables single-instance pid tracking.
    #[serde(default)]
    pub pidfile: Option<PathBuf>,

    /// Optional cap on the in-memory queue; oldest records are dropped
    /// beyond it. Unset leaves the queue unbounded.
    #[serde(default)]
    pub queue_limit: Option<usize>,
}

impl Config {
    /// Parse the YAML document at `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&raw)?)
    }

    /// Build a minimal configuration from command-line flags alone.
    pub fn from_flags(socket: PathBuf, graylog: String) -> Self {
        Self {
            socket,
            perms: None,
            graylog,
            ssl: None,
            buffer: None,
            status: None,
            pidfile: None,
            queue_limit: None,
        }
    }

    /// Apply `--listen` / `--graylog` overrides on top of a loaded file.
    pub fn apply_overrides(&mut self, listen: Option<PathBuf>, graylog: Option<String>) {
        if let Some(listen) = listen {
            self.socket = listen;
        }
        if let Some(graylog) = graylog {
            self.graylog = graylog;
        }
    }
}

/// `perms` appears either as a string (`"0660"`) or a bare number whose
/// decimal digits read as octal (`0660` parses as the integer 660 under
/// YAML 1.2). Both forms are interpreted octal.
fn de_perms<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error as _;
    let value = Option::<Value>::deserialize(deserializer)?;
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => parse_octal(&s)
            .map(Some)
            .map_err(|_| D::Error::custom(format!("bad perms value {:?}", s))),
        Some(Value::Number(n)) => {
            let digits = n.to_string();
            parse_octal(&digits)
                .map(Some)
                .map_err(|_| D::Error::custom(format!("bad perms value {}", digits)))
        }
        Some(other) => Err(D::Error::custom(format!(
            "bad perms value: {:?}",
            other
        ))),
    }
}

fn parse_octal(digits: &str) -> Result<u32, std::num::ParseIntError> {
    u32::from_str_radix(digits.trim_start_matches("0o"), 8)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write_config(body: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broker.yml");
        std::fs::write(&path, body).unwrap();
        (dir, path)
    }

    #[test]
    fn minimal_config_parses() {
        let (_dir, path) = write_config(
            "socket: /run/gelf.sock\n\
             graylog: logs.example.com:12201\n",
        );
        let config = Config::load(&path).unwrap();
        assert_eq!(config.socket, PathBuf::from("/run/gelf.sock"));
        assert_eq!(config.graylog, "logs.example.com:12201");
        assert!(config.ssl.is_none());
        assert!(config.perms.is_none());
        assert!(config.queue_limit.is_none());
    }

    #[test]
    fn full_config_parses() {
        let (_dir, path) = write_config(
            "socket: /run/gelf.sock\n\
             perms: \"0660\"\n\
             graylog: logs.example.com\n\
             ssl:\n  ca: /etc/ssl/graylog-ca.pem\n\
             buffer: /var/spool/gelf-broker.buf\n\
             status: /run/gelf-broker.status\n\
             pidfile: /run/gelf-broker.pid\n\
             queue_limit: 100000\n",
        );
        let config = Config::load(&path).unwrap();
        assert_eq!(config.perms, Some(0o660));
        assert!(config.ssl.is_some());
        assert_eq!(config.buffer, Some(PathBuf::from("/var/spool/gelf-broker.buf")));
        assert_eq!(config.queue_limit, Some(100_000));
    }

    #[test]
    fn bare_numeric_perms_read_as_octal() {
        let (_dir, path) = write_config(
            "socket: /s\n\
             graylog: h\n\
             perms: 660\n",
        );
        assert_eq!(Config::load(&path).unwrap().perms, Some(0o660));
    }

    #[test]
    fn missing_required_key_is_an_error() {
        let (_dir, path) = write_config("socket: /run/gelf.sock\n");
        assert!(matches!(Config::load(&path), Err(ConfigError::Yaml(_))));
    }

    #[test]
    fn malformed_yaml_is_an_error() {
        let (_dir, path) = write_config(": : :\n\t-");
        assert!(matches!(Config::load(&path), Err(ConfigError::Yaml(_))));
    }

    #[test]
    fn cli_overrides_replace_file_values() {
        let (_dir, path) = write_config(
            "socket: /run/a.sock\n\
             graylog: old:1\n",
        );
        let mut config = Config::load(&path).unwrap();
        config.apply_overrides(Some(PathBuf::from("/run/b.sock")), Some("new:2".into()));
        assert_eq!(config.socket, PathBuf::from("/run/b.sock"));
        assert_eq!(config.graylog, "new:2");
    }
}
