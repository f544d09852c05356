//! Error types shared by every gridwatch process.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TopologyError {
    #[error("invalid topology document: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("duplicate {kind} id '{id}'")]
    DuplicateId { kind: &'static str, id: String },
    #[error("{kind} '{id}' references unknown power line '{line}'")]
    UnknownLine { kind: &'static str, id: String, line: String },
    #[error("{kind} '{id}' references unknown bus '{bus}'")]
    UnknownBus { kind: &'static str, id: String, bus: String },
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,
    #[error("mqtt client error: {0}")]
    Mqtt(#[from] rumqttc::ClientError),
    #[error("failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("tls material: {0}")]
    Tls(String),
}

#[derive(Debug, Error)]
pub enum RpcError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("no reply from {target} within {timeout_ms} ms")]
    Timeout { target: String, timeout_ms: u128 },
    #[error("reply channel dropped before a response arrived")]
    Cancelled,
    #[error("{target} answered {status}")]
    Rejected { target: String, status: crate::rpc::RpcStatus },
    #[error("unexpected reply payload: {0}")]
    Payload(#[source] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum RequirementError {
    #[error("unknown deployment profile '{0}'")]
    UnknownProfile(String),
    #[error("unknown check '{0}'")]
    UnknownCheck(String),
    #[error("check '{check}' needs the '{section}' parameter section")]
    MissingParams { check: &'static str, section: &'static str },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
    #[error("cannot read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid check parameters: {0}")]
    Params(#[from] serde_yaml::Error),
    #[error(transparent)]
    Topology(#[from] TopologyError),
    #[error(transparent)]
    Requirement(#[from] RequirementError),
}
