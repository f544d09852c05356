//! Monitor configuration from the environment
//!
//! Broker and TLS settings are shared with the C2 and loaded separately
//! through [`gridwatch_core::config::BrokerConfig`].

use gridwatch_core::config::{self as shared, read_file};
use gridwatch_core::contracts::{lm_address, nm_address, DEFAULT_C2_ADDRESS};
use gridwatch_core::requirements::{CheckParams, DEFAULT_PROFILE};
use gridwatch_core::{ConfigError, Topology};
use std::path::PathBuf;
use uuid::Uuid;

pub const LM_ID: &str = "GRIDWATCH_LM_ID";
pub const LM_ADDRESS: &str = "GRIDWATCH_LM_ADDRESS";
pub const TOPOLOGY_FILE: &str = "GRIDWATCH_TOPOLOGY_FILE";
pub const SENSOR_FILE: &str = "GRIDWATCH_SENSOR_FILE";
pub const NM_ID: &str = "GRIDWATCH_NM_ID";
pub const NM_ADDRESS: &str = "GRIDWATCH_NM_ADDRESS";
pub const C2_ADDRESS: &str = "GRIDWATCH_C2_ADDRESS";
pub const PROFILE: &str = "GRIDWATCH_PROFILE";
pub const CHECK_PARAMS: &str = "GRIDWATCH_CHECK_PARAMS";

/// Settings every monitor needs, whatever its role.
#[derive(Debug, Clone)]
pub struct CommonConfig {
    pub c2_address: String,
    /// Requirement profile: `grid`, `demkit` or `coteq`.
    pub profile: String,
    pub check_params: Option<PathBuf>,
}

impl CommonConfig {
    fn from_lookup(lookup: &impl Fn(&str) -> Option<String>) -> Self {
        Self {
            c2_address: lookup(C2_ADDRESS).unwrap_or_else(|| DEFAULT_C2_ADDRESS.to_string()),
            profile: lookup(PROFILE).unwrap_or_else(|| DEFAULT_PROFILE.to_string()),
            check_params: lookup(CHECK_PARAMS).map(PathBuf::from),
        }
    }

    pub fn load_check_params(&self) -> Result<CheckParams, ConfigError> {
        shared::load_check_params(self.check_params.as_deref())
    }
}

#[derive(Debug, Clone)]
pub struct LmConfig {
    pub id: Uuid,
    pub address: String,
    pub topology_file: PathBuf,
    pub sensor_file: PathBuf,
    pub common: CommonConfig,
}

impl LmConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&shared::process_env)
    }

    /// A missing id is generated, so a restarted LM registers as a new peer.
    pub fn from_lookup(lookup: &impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let id = shared::parsed_or(lookup, LM_ID, Uuid::new_v4())?;
        Ok(Self {
            id,
            address: lookup(LM_ADDRESS).unwrap_or_else(|| lm_address(id)),
            topology_file: PathBuf::from(shared::required(lookup, TOPOLOGY_FILE)?),
            sensor_file: PathBuf::from(shared::required(lookup, SENSOR_FILE)?),
            common: CommonConfig::from_lookup(lookup),
        })
    }

    /// Reads and validates the topology file. Returns the document as read,
    /// which is what the C2 receives on registration.
    pub fn load_topology(&self) -> Result<(String, Topology), ConfigError> {
        let document = read_file(&self.topology_file)?;
        let topology = Topology::from_json(&document)?;
        Ok((document, topology))
    }
}

#[derive(Debug, Clone)]
pub struct NmConfig {
    pub id: Uuid,
    pub address: String,
    pub common: CommonConfig,
}

impl NmConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&shared::process_env)
    }

    pub fn from_lookup(lookup: &impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let id = shared::parsed_or(lookup, NM_ID, Uuid::new_v4())?;
        Ok(Self {
            id,
            address: lookup(NM_ADDRESS).unwrap_or_else(|| nm_address(id)),
            common: CommonConfig::from_lookup(lookup),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridwatch_devkit::fixtures;
    use std::io::Write;

    #[test]
    fn lm_requires_its_files() {
        let err = LmConfig::from_lookup(&|_: &str| None).unwrap_err();
        assert!(matches!(err, ConfigError::Missing(TOPOLOGY_FILE)));
    }

    #[test]
    fn lm_defaults_its_address_from_the_id() {
        let id = Uuid::new_v4();
        let lookup = |key: &str| match key {
            LM_ID => Some(id.to_string()),
            TOPOLOGY_FILE => Some("/etc/gridwatch/topology.json".to_string()),
            SENSOR_FILE => Some("/var/lib/gridwatch/sensors.json".to_string()),
            _ => None,
        };
        let cfg = LmConfig::from_lookup(&lookup).unwrap();
        assert_eq!(cfg.address, lm_address(id));
        assert_eq!(cfg.common.profile, DEFAULT_PROFILE);
        assert_eq!(cfg.common.c2_address, DEFAULT_C2_ADDRESS);
    }

    #[test]
    fn malformed_id_is_invalid() {
        let lookup = |key: &str| (key == NM_ID).then(|| "nope".to_string());
        let err = NmConfig::from_lookup(&lookup).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: NM_ID, .. }));
    }

    #[test]
    fn topology_file_is_validated() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(fixtures::substation_a_json().as_bytes()).unwrap();
        let path = file.path().display().to_string();
        let lookup = move |key: &str| match key {
            TOPOLOGY_FILE | SENSOR_FILE => Some(path.clone()),
            _ => None,
        };
        let cfg = LmConfig::from_lookup(&lookup).unwrap();
        let (document, topology) = cfg.load_topology().unwrap();
        assert_eq!(document, fixtures::substation_a_json());
        assert_eq!(topology.meters().len(), 3);
    }
}
