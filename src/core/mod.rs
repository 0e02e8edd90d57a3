// Infrastructure shared by the scheduler, the store and the agent runtime

pub mod config;
pub mod errors;
pub mod logging;

// Re-export commonly used types
pub use config::{
    AgentConfig, LoggingConfig, OracleConfig, SchedulerConfig, StoreBackend, StoreConfig,
    SwarmConfig, SwarmConfigBuilder,
};
pub use errors::{Result, SwarmError};
pub use logging::init_tracing;
