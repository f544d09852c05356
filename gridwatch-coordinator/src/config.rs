use gridwatch_core::config::{self as shared, BrokerConfig};
use gridwatch_core::contracts::DEFAULT_C2_ADDRESS;
use gridwatch_core::ConfigError;
use std::net::SocketAddr;

pub const C2_ADDRESS: &str = "GRIDWATCH_C2_ADDRESS";
pub const HTTP_BIND: &str = "GRIDWATCH_HTTP_BIND";

#[derive(Debug, Clone)]
pub struct C2Config {
    /// Topic prefix of the C2.
    pub address: String,
    pub http_bind: SocketAddr,
    pub broker: BrokerConfig,
}

impl C2Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&shared::process_env)
    }

    pub fn from_lookup(lookup: &impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        Ok(Self {
            address: lookup(C2_ADDRESS).unwrap_or_else(|| DEFAULT_C2_ADDRESS.to_string()),
            http_bind: shared::parsed_or(
                lookup,
                HTTP_BIND,
                SocketAddr::from(([0, 0, 0, 0], 8080)),
            )?,
            broker: BrokerConfig::from_lookup(lookup)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_and_overrides() {
        let lookup = |key: &str| match key {
            "GRIDWATCH_BROKER_HOST" => Some("broker".to_string()),
            "GRIDWATCH_CA_CERT" | "GRIDWATCH_CERT" | "GRIDWATCH_PRIVATE_KEY" => {
                Some(format!("/etc/gridwatch/{key}"))
            }
            HTTP_BIND => Some("127.0.0.1:9000".to_string()),
            _ => None,
        };
        let cfg = C2Config::from_lookup(&lookup).unwrap();
        assert_eq!(cfg.address, DEFAULT_C2_ADDRESS);
        assert_eq!(cfg.http_bind.port(), 9000);
        assert_eq!(cfg.broker.port, 8883);
    }
}
