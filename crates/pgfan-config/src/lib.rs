mod error;
mod model;
mod validation;

pub use error::{ConfigError, ConfigResult};
pub use model::{
    AckPolicyConfig, Config, MetricsConfig, OverflowMode, PeerConfig, PeerRef, PipelineConfig,
    PipelineSection, PostgresPeerConfig, ReplicationSettings, SinkConfig,
};
pub use validation::validate;
