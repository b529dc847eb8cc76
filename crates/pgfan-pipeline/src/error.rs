use thiserror::Error;

/// Errors raised while building or running a pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Invalid or contradictory configuration. Fatal at startup.
    #[error("config error: {0}")]
    Config(String),

    /// A peer failed to establish its transport.
    #[error("peer '{peer}' failed to connect: {message}")]
    Connect { peer: String, message: String },

    /// A sink publish failed. Logged and counted; never propagated upstream.
    #[error("transport error: {0}")]
    Transport(String),

    /// A transformation produced invalid state at runtime.
    #[error("transform error: {0}")]
    Transform(String),

    /// The connector does not support the requested capability.
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// Upstream replication failure.
    #[error(transparent)]
    Source(#[from] pgfan_pg::PgError),

    /// Cooperative shutdown; not a failure.
    #[error("cancelled")]
    Cancelled,
}

impl PipelineError {
    /// Short kind label used in logs and metric labels.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Config(_) => "config",
            PipelineError::Connect { .. } => "connect",
            PipelineError::Transport(_) => "transport",
            PipelineError::Transform(_) => "transform",
            PipelineError::Unsupported(_) => "unsupported",
            PipelineError::Source(_) => "source",
            PipelineError::Cancelled => "cancelled",
        }
    }
}
