//! Environment-driven configuration shared by every gridwatch binary.
//!
//! Values come from the process environment, optionally seeded from a `.env`
//! file. Lookups go through a closure so tests never touch the real
//! environment.

use crate::error::ConfigError;
use crate::requirements::CheckParams;
use crate::transport::{MqttSettings, TlsFiles};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// `EX_CONFIG` from sysexits.h.
pub const EXIT_CONFIG: i32 = 78;

pub const BROKER_HOST: &str = "GRIDWATCH_BROKER_HOST";
pub const BROKER_PORT: &str = "GRIDWATCH_BROKER_PORT";
pub const CA_CERT: &str = "GRIDWATCH_CA_CERT";
pub const CERT: &str = "GRIDWATCH_CERT";
pub const PRIVATE_KEY: &str = "GRIDWATCH_PRIVATE_KEY";

pub const DEFAULT_BROKER_PORT: u16 = 8883;

/// Loads `.env` if present. A missing file is not an error.
pub fn load_dotenv() {
    if let Ok(path) = dotenvy::dotenv() {
        tracing::debug!(path = %path.display(), "loaded .env");
    }
}

/// Reads variables from the process environment.
pub fn process_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

pub fn required(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<String, ConfigError> {
    lookup(key).ok_or(ConfigError::Missing(key))
}

pub fn parsed_or<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| ConfigError::Invalid { key, reason: e.to_string() }),
    }
}

pub fn read_file(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path)
        .map_err(|source| ConfigError::Io { path: path.display().to_string(), source })
}

/// Check parameters from an optional YAML file; no file means defaults.
pub fn load_check_params(path: Option<&Path>) -> Result<CheckParams, ConfigError> {
    match path {
        None => Ok(CheckParams::default()),
        Some(p) => Ok(CheckParams::from_yaml(&read_file(p)?)?),
    }
}

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub keep_alive: Duration,
    pub tls: TlsFiles,
}

impl BrokerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&process_env)
    }

    pub fn from_lookup(lookup: &impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        Ok(Self {
            host: required(lookup, BROKER_HOST)?,
            port: parsed_or(lookup, BROKER_PORT, DEFAULT_BROKER_PORT)?,
            keep_alive: Duration::from_secs(15),
            tls: TlsFiles {
                ca: PathBuf::from(required(lookup, CA_CERT)?),
                cert: PathBuf::from(required(lookup, CERT)?),
                key: PathBuf::from(required(lookup, PRIVATE_KEY)?),
            },
        })
    }

    pub fn settings(&self, client_id: impl Into<String>) -> MqttSettings {
        MqttSettings {
            host: self.host.clone(),
            port: self.port,
            client_id: client_id.into(),
            keep_alive: self.keep_alive,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn broker_config_requires_all_tls_paths() {
        let lookup = env(&[(BROKER_HOST, "broker.local"), (CA_CERT, "ca.pem"), (CERT, "c2.pem")]);
        assert!(matches!(
            BrokerConfig::from_lookup(&lookup),
            Err(ConfigError::Missing(PRIVATE_KEY))
        ));

        let lookup = env(&[
            (BROKER_HOST, "broker.local"),
            (CA_CERT, "ca.pem"),
            (CERT, "c2.pem"),
            (PRIVATE_KEY, "c2.key"),
        ]);
        let cfg = BrokerConfig::from_lookup(&lookup).unwrap();
        assert_eq!(cfg.port, DEFAULT_BROKER_PORT);
        assert_eq!(cfg.settings("c2").client_id, "c2");
    }

    #[test]
    fn bad_port_is_invalid() {
        let lookup = env(&[(BROKER_PORT, "eighty")]);
        let err = parsed_or(&lookup, BROKER_PORT, DEFAULT_BROKER_PORT).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: BROKER_PORT, .. }));
    }

    #[test]
    fn check_params_file_is_optional() {
        assert_eq!(load_check_params(None).unwrap(), CheckParams::default());
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("params.yaml");
        std::fs::write(&path, "disable: [safety_voltage]\n").unwrap();
        assert_eq!(load_check_params(Some(&path)).unwrap().disable, vec!["safety_voltage"]);
        assert!(matches!(
            load_check_params(Some(&dir.path().join("absent.yaml"))),
            Err(ConfigError::Io { .. })
        ));
    }

    #[test]
    fn threshold_left_out_of_the_params_file_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("params.yaml");
        let text = "enable: [total_harmonic_distortion]\nthd:\n  meters: [s1]\n";
        std::fs::write(&path, text).unwrap();
        let err = load_check_params(Some(&path)).unwrap_err();
        assert!(matches!(err, ConfigError::Params(_)));
        assert!(err.to_string().contains("limit"), "{err}");
    }
}
