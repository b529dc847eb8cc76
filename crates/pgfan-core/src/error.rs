use thiserror::Error;

/// Errors that can occur in pgfan-core.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid glob pattern '{pattern}': {message}")]
    InvalidPattern { pattern: String, message: String },

    #[error("invalid regex: {0}")]
    InvalidRegex(#[from] regex::Error),

    #[error("invalid operation code '{0}': expected one of c, u, d, r")]
    InvalidOpCode(String),

    #[error("transform error: {0}")]
    Transform(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
