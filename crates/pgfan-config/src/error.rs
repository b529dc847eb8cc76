use thiserror::Error;

/// Errors that can occur when parsing or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {message}")]
    Io { path: String, message: String },

    #[error("failed to parse YAML: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("duplicate peer name '{0}'")]
    DuplicatePeer(String),

    #[error("duplicate pipeline name '{0}'")]
    DuplicatePipeline(String),

    #[error("pipeline '{pipeline}' references unknown peer '{peer}'")]
    UnknownPeer { pipeline: String, peer: String },

    #[error("pipeline '{0}' needs at least one source and one sink")]
    EmptyPipeline(String),

    #[error("pipeline '{pipeline}' source '{peer}' is not a postgres peer")]
    NonPostgresSource { pipeline: String, peer: String },

    #[error("peer '{peer}': {message}")]
    InvalidPeerConfig { peer: String, message: String },

    #[error("invalid transformation in '{scope}': {message}")]
    InvalidTransformation { scope: String, message: String },
}

pub type ConfigResult<T> = Result<T, ConfigError>;
