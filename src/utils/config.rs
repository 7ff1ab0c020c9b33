// src/utils/config.rs
//! Engine configuration
//!
//! Values are layered with the `config` crate:
//!
//! 1. Built-in defaults (`EngineConfig::default()`)
//! 2. Optional file `config/engine.{yaml,toml,json}`
//! 3. Environment variables prefixed with `AGENT_POOL`, nested with `__`
//!    (e.g. `AGENT_POOL__RUNTIME__MAX_AGENTS=32`)

use crate::utils::errors::{EngineError, Result};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

const DEFAULT_CONFIG_FILE: &str = "config/engine";
const ENV_PREFIX: &str = "AGENT_POOL";

/// Top-level engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Pool manager and autoscaling settings
    pub runtime: RuntimeConfig,

    /// Pools created at startup, one per agent type
    pub pools: Vec<PoolDefinition>,

    /// Log output settings
    pub logging: LoggingConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            runtime: RuntimeConfig::default(),
            pools: vec![
                PoolDefinition::new("requirements-analyzer"),
                PoolDefinition::new("code-generator"),
                PoolDefinition::new("test-generator"),
            ],
            logging: LoggingConfig::default(),
        }
    }
}

/// Pool manager settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Upper bound on agents across all pools (default: 20)
    pub max_agents: usize,

    /// Agents each pool starts with (default: 2)
    pub min_agents: usize,

    /// Default per-pool concurrency cap (default: 5)
    pub pool_size: usize,

    /// Utilization percentage above which a pool grows (default: 80)
    pub scale_up_threshold: f64,

    /// Utilization percentage below which a pool shrinks (default: 20)
    pub scale_down_threshold: f64,

    /// Agents added per scale-up (default: 2)
    pub scale_up_step: usize,

    /// Agents removed per scale-down (default: 1)
    pub scale_down_step: usize,

    /// Heartbeat and health-check period (default: 30s)
    pub health_check_interval_ms: u64,

    /// Minimum time between two scaling actions on one pool (default: 60s)
    pub cooldown_period_ms: u64,

    /// How long an agent must be idle before scale-down may remove it (default: 5min)
    pub idle_grace_period_ms: u64,

    /// Timeout for jobs that don't carry their own (default: 60s)
    pub default_job_timeout_ms: u64,

    /// Period of metrics publication and scaling evaluation (default: 10s)
    pub metrics_interval_ms: u64,

    /// Time workers get to exit during shutdown before being aborted (default: 5s)
    pub shutdown_grace_period_ms: u64,

    /// Optional per-pool queue bound; unbounded when absent
    pub max_queue_length: Option<usize>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_agents: 20,
            min_agents: 2,
            pool_size: 5,
            scale_up_threshold: 80.0,
            scale_down_threshold: 20.0,
            scale_up_step: 2,
            scale_down_step: 1,
            health_check_interval_ms: 30_000,
            cooldown_period_ms: 60_000,
            idle_grace_period_ms: 300_000,
            default_job_timeout_ms: 60_000,
            metrics_interval_ms: 10_000,
            shutdown_grace_period_ms: 5_000,
            max_queue_length: None,
        }
    }
}

impl RuntimeConfig {
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    /// Heartbeat age after which an agent counts as unresponsive
    pub fn heartbeat_deadline(&self) -> Duration {
        self.health_check_interval().saturating_mul(2)
    }

    pub fn cooldown_period(&self) -> Duration {
        Duration::from_millis(self.cooldown_period_ms)
    }

    pub fn idle_grace_period(&self) -> Duration {
        Duration::from_millis(self.idle_grace_period_ms)
    }

    pub fn default_job_timeout(&self) -> Duration {
        Duration::from_millis(self.default_job_timeout_ms)
    }

    pub fn metrics_interval(&self) -> Duration {
        Duration::from_millis(self.metrics_interval_ms)
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_period_ms)
    }
}

/// A pool to create at startup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolDefinition {
    /// Agent type served by the pool
    pub agent_type: String,

    /// Starting agent count; `runtime.min_agents` when absent
    #[serde(default)]
    pub initial_agents: Option<usize>,

    /// Concurrency cap; `runtime.pool_size` when absent
    #[serde(default)]
    pub max_concurrency: Option<usize>,
}

impl PoolDefinition {
    pub fn new(agent_type: impl Into<String>) -> Self {
        Self {
            agent_type: agent_type.into(),
            initial_agents: None,
            max_concurrency: None,
        }
    }

    pub fn with_initial_agents(mut self, agents: usize) -> Self {
        self.initial_agents = Some(agents);
        self
    }

    pub fn with_max_concurrency(mut self, cap: usize) -> Self {
        self.max_concurrency = Some(cap);
        self
    }

    pub fn initial_agents_or(&self, runtime: &RuntimeConfig) -> usize {
        self.initial_agents.unwrap_or(runtime.min_agents)
    }

    pub fn max_concurrency_or(&self, runtime: &RuntimeConfig) -> usize {
        self.max_concurrency.unwrap_or(runtime.pool_size)
    }
}

/// Log output settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl EngineConfig {
    /// Load from defaults, `config/engine.*` (if present) and the environment
    pub fn load() -> Result<Self> {
        let settings = Config::builder()
            .add_source(File::with_name(DEFAULT_CONFIG_FILE).required(false))
            .add_source(Self::environment())
            .build()?;

        let config: EngineConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load from an explicit file, still honouring environment overrides
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let settings = Config::builder()
            .add_source(File::from(path.as_ref()))
            .add_source(Self::environment())
            .build()?;

        let config: EngineConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    fn environment() -> Environment {
        Environment::with_prefix(ENV_PREFIX)
            .separator("__")
            .try_parsing(true)
    }

    /// Validate settings
    pub fn validate(&self) -> Result<()> {
        let rt = &self.runtime;

        if rt.max_agents == 0 {
            return Err(invalid("max_agents must be at least 1"));
        }
        if rt.min_agents == 0 {
            return Err(invalid("min_agents must be at least 1"));
        }
        if rt.pool_size == 0 {
            return Err(invalid("pool_size must be at least 1"));
        }
        if !(0.0..=100.0).contains(&rt.scale_up_threshold)
            || !(0.0..=100.0).contains(&rt.scale_down_threshold)
        {
            return Err(invalid("scaling thresholds must be percentages (0-100)"));
        }
        if rt.scale_down_threshold >= rt.scale_up_threshold {
            return Err(invalid(
                "scale_down_threshold must be lower than scale_up_threshold",
            ));
        }
        if rt.scale_up_step == 0 || rt.scale_down_step == 0 {
            return Err(invalid("scaling steps must be at least 1"));
        }
        if rt.health_check_interval_ms == 0 || rt.metrics_interval_ms == 0 {
            return Err(invalid("timer intervals must be greater than 0"));
        }
        if rt.default_job_timeout_ms == 0 {
            return Err(invalid("default_job_timeout_ms must be greater than 0"));
        }
        if rt.max_queue_length == Some(0) {
            return Err(invalid("max_queue_length must be at least 1 when set"));
        }

        let mut seen = HashSet::new();
        let mut initial_total = 0usize;
        for pool in &self.pools {
            if pool.agent_type.trim().is_empty() {
                return Err(invalid("pool agent_type cannot be empty"));
            }
            if !seen.insert(pool.agent_type.as_str()) {
                return Err(invalid(&format!(
                    "pool '{}' is defined more than once",
                    pool.agent_type
                )));
            }
            let initial = pool.initial_agents_or(rt);
            if initial == 0 {
                return Err(invalid(&format!(
                    "pool '{}' must start with at least one agent",
                    pool.agent_type
                )));
            }
            if pool.max_concurrency_or(rt) == 0 {
                return Err(invalid(&format!(
                    "pool '{}' needs a concurrency cap of at least 1",
                    pool.agent_type
                )));
            }
            initial_total = initial_total.saturating_add(initial);
        }

        if initial_total > rt.max_agents {
            return Err(invalid(&format!(
                "pools start with {} agents but max_agents is {}",
                initial_total, rt.max_agents
            )));
        }

        Ok(())
    }
}

fn invalid(message: &str) -> EngineError {
    EngineError::Configuration(message.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.runtime.heartbeat_deadline(), Duration::from_secs(60));
        assert_eq!(config.pools.len(), 3);
    }

    #[test]
    fn test_validation() {
        let mut config = EngineConfig::default();
        config.runtime.scale_down_threshold = 90.0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.runtime.scale_up_step = 0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.pools.push(PoolDefinition::new("code-generator"));
        assert!(matches!(
            config.validate(),
            Err(EngineError::Configuration(msg)) if msg.contains("more than once")
        ));

        let mut config = EngineConfig::default();
        config.runtime.max_agents = 4;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_pool_definition_fallbacks() {
        let runtime = RuntimeConfig::default();
        let pool = PoolDefinition::new("requirements-analyzer");
        assert_eq!(pool.initial_agents_or(&runtime), 2);
        assert_eq!(pool.max_concurrency_or(&runtime), 5);

        let pool = pool.with_initial_agents(3).with_max_concurrency(3);
        assert_eq!(pool.initial_agents_or(&runtime), 3);
        assert_eq!(pool.max_concurrency_or(&runtime), 3);
    }

    #[test]
    fn test_load_from_yaml_file() {
        let mut file = tempfile::Builder::new()
            .suffix(".yaml")
            .tempfile()
            .unwrap();
        writeln!(
            file,
            "runtime:\n  max_agents: 8\n  min_agents: 1\n  scale_up_threshold: 75\n\
             pools:\n  - agent_type: requirements-analyzer\n    initial_agents: 3\n\
             logging:\n  json: true"
        )
        .unwrap();

        let config = EngineConfig::load_from(file.path()).unwrap();
        assert_eq!(config.runtime.max_agents, 8);
        assert_eq!(config.runtime.min_agents, 1);
        assert_eq!(config.runtime.scale_up_threshold, 75.0);
        // untouched values keep their defaults
        assert_eq!(config.runtime.scale_down_step, 1);
        assert_eq!(config.pools.len(), 1);
        assert_eq!(config.pools[0].initial_agents, Some(3));
        assert!(config.logging.json);
    }

    #[test]
    fn test_load_from_invalid_file() {
        let mut file = tempfile::Builder::new()
            .suffix(".yaml")
            .tempfile()
            .unwrap();
        writeln!(file, "runtime:\n  scale_up_step: 0").unwrap();

        assert!(matches!(
            EngineConfig::load_from(file.path()),
            Err(EngineError::Configuration(_))
        ));
    }
}
