use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::errors::{Result, SwarmError};

/// Coordinator configuration with all tuning parameters.
///
/// Durations are carried as milliseconds so the YAML stays readable;
/// use the accessor methods to get a [`Duration`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SwarmConfig {
    pub oracle: OracleConfig,
    pub scheduler: SchedulerConfig,
    pub agent: AgentConfig,
    pub store: StoreConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OracleConfig {
    /// Planning attempts before the task fails with `PlanningExhausted`
    pub max_retries: u32,
    /// Bound on a single oracle call
    pub call_timeout_ms: u64,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            call_timeout_ms: 60_000,
        }
    }
}

impl OracleConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Scheduling pass interval when no notification wakes the loop
    pub poll_interval_ms: u64,
    /// Attempts a subtask gets before it is marked Failed
    pub max_attempts: u32,
    /// Avoid the agent that just failed a subtask when another capable one exists
    pub exclude_failed_agent: bool,
    /// Request a partial re-plan once a subtask has used this many attempts
    pub replan_after_attempts: Option<u32>,
    /// Partial re-plans allowed per task
    pub max_replans: u32,
    /// Re-read/re-commit rounds before a conditional write gives up
    pub cas_retry_limit: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 500,
            max_attempts: 3,
            exclude_failed_agent: true,
            replan_after_attempts: None,
            max_replans: 1,
            cas_retry_limit: 16,
        }
    }
}

impl SchedulerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub heartbeat_interval_ms: u64,
    /// Silence beyond this marks the agent Offline
    pub heartbeat_timeout_ms: u64,
    /// Assignment re-scan interval; notifications only shorten the wait
    pub poll_interval_ms: u64,
    pub default_skill_timeout_ms: u64,
    /// Per-skill execution bounds, keyed by skill name
    pub skill_timeouts_ms: HashMap<String, u64>,
    /// Probability in [0, 1] of failing an attempt before the skill runs
    pub failure_probability: f64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 30_000,
            heartbeat_timeout_ms: 60_000,
            poll_interval_ms: 1_000,
            default_skill_timeout_ms: 120_000,
            skill_timeouts_ms: HashMap::new(),
            failure_probability: 0.0,
        }
    }
}

impl AgentConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Execution bound for `skill`, falling back to the default
    pub fn skill_timeout(&self, skill: &str) -> Duration {
        let ms = self
            .skill_timeouts_ms
            .get(skill)
            .copied()
            .unwrap_or(self.default_skill_timeout_ms);
        Duration::from_millis(ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    Sled,
    Redis,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    /// Database directory for the sled backend
    pub path: Option<PathBuf>,
    pub host: String,
    pub port: u16,
    /// Prefix applied to every key and channel
    pub namespace: String,
    pub password: Option<String>,
    /// Buffered notifications per channel before the oldest are dropped
    pub channel_capacity: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            path: None,
            host: "127.0.0.1".to_string(),
            port: 6379,
            namespace: "swarm".to_string(),
            password: None,
            channel_capacity: 256,
        }
    }
}

impl StoreConfig {
    /// Connection URL for networked backends
    pub fn url(&self) -> String {
        match &self.password {
            Some(password) => format!("redis://:{}@{}:{}/", password, self.host, self.port),
            None => format!("redis://{}:{}/", self.host, self.port),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// One of trace, debug, info, warn, error
    pub level: String,
    pub with_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            with_target: false,
        }
    }
}

impl SwarmConfig {
    /// Create a new builder for SwarmConfig
    pub fn builder() -> SwarmConfigBuilder {
        SwarmConfigBuilder::new()
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: SwarmConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&content)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.oracle.max_retries == 0 {
            return Err(SwarmError::Configuration(
                "oracle.max_retries must be greater than 0".to_string(),
            ));
        }
        if self.oracle.call_timeout_ms == 0 {
            return Err(SwarmError::Configuration(
                "oracle.call_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.scheduler.max_attempts == 0 {
            return Err(SwarmError::Configuration(
                "scheduler.max_attempts must be greater than 0".to_string(),
            ));
        }
        if self.scheduler.poll_interval_ms == 0 || self.agent.poll_interval_ms == 0 {
            return Err(SwarmError::Configuration(
                "poll intervals must be greater than 0".to_string(),
            ));
        }
        if self.scheduler.cas_retry_limit == 0 {
            return Err(SwarmError::Configuration(
                "scheduler.cas_retry_limit must be greater than 0".to_string(),
            ));
        }
        if let Some(threshold) = self.scheduler.replan_after_attempts {
            if threshold == 0 {
                return Err(SwarmError::Configuration(
                    "scheduler.replan_after_attempts must be greater than 0".to_string(),
                ));
            }
        }
        if self.agent.heartbeat_interval_ms == 0 {
            return Err(SwarmError::Configuration(
                "agent.heartbeat_interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.agent.heartbeat_timeout_ms <= self.agent.heartbeat_interval_ms {
            return Err(SwarmError::Configuration(
                "agent.heartbeat_timeout_ms should be greater than heartbeat_interval_ms"
                    .to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.agent.failure_probability) {
            return Err(SwarmError::Configuration(
                "agent.failure_probability must be within [0, 1]".to_string(),
            ));
        }
        if self.store.backend == StoreBackend::Sled && self.store.path.is_none() {
            return Err(SwarmError::Configuration(
                "store.path is required for the sled backend".to_string(),
            ));
        }
        if self.store.namespace.is_empty() {
            return Err(SwarmError::Configuration(
                "store.namespace cannot be empty".to_string(),
            ));
        }
        if self.store.channel_capacity == 0 {
            return Err(SwarmError::Configuration(
                "store.channel_capacity must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Short intervals for local runs and tests
    pub fn development() -> Self {
        Self {
            oracle: OracleConfig {
                max_retries: 5,
                call_timeout_ms: 2_000,
            },
            scheduler: SchedulerConfig {
                poll_interval_ms: 20,
                ..Default::default()
            },
            agent: AgentConfig {
                heartbeat_interval_ms: 50,
                heartbeat_timeout_ms: 1_000,
                poll_interval_ms: 20,
                default_skill_timeout_ms: 2_000,
                ..Default::default()
            },
            logging: LoggingConfig {
                level: "debug".to_string(),
                with_target: true,
            },
            ..Default::default()
        }
    }
}

/// Builder for SwarmConfig
pub struct SwarmConfigBuilder {
    config: SwarmConfig,
}

impl SwarmConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: SwarmConfig::default(),
        }
    }

    /// Start from the development preset
    pub fn development() -> Self {
        Self {
            config: SwarmConfig::development(),
        }
    }

    pub fn oracle_retries(mut self, retries: u32) -> Self {
        self.config.oracle.max_retries = retries;
        self
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.config.scheduler.max_attempts = attempts;
        self
    }

    pub fn exclude_failed_agent(mut self, exclude: bool) -> Self {
        self.config.scheduler.exclude_failed_agent = exclude;
        self
    }

    pub fn replan_after_attempts(mut self, threshold: Option<u32>) -> Self {
        self.config.scheduler.replan_after_attempts = threshold;
        self
    }

    pub fn max_replans(mut self, replans: u32) -> Self {
        self.config.scheduler.max_replans = replans;
        self
    }

    pub fn heartbeat(mut self, interval: Duration, timeout: Duration) -> Self {
        self.config.agent.heartbeat_interval_ms = interval.as_millis() as u64;
        self.config.agent.heartbeat_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn skill_timeout(mut self, skill: impl Into<String>, timeout: Duration) -> Self {
        self.config
            .agent
            .skill_timeouts_ms
            .insert(skill.into(), timeout.as_millis() as u64);
        self
    }

    pub fn failure_probability(mut self, probability: f64) -> Self {
        self.config.agent.failure_probability = probability;
        self
    }

    pub fn sled(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.store.backend = StoreBackend::Sled;
        self.config.store.path = Some(path.into());
        self
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.config.store.namespace = namespace.into();
        self
    }

    /// Build and validate the configuration
    pub fn build(self) -> Result<SwarmConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for SwarmConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
