// src/utils/errors.rs
//! Engine error taxonomy
//!
//! Every fallible operation in the crate returns [`Result`]. Callers of
//! [`crate::PoolManager::route_job`] see these variants either directly or
//! through the [`crate::JobHandle`] of a submitted job.

use std::time::Duration;

/// Crate-wide result alias
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors produced by the agent pool engine
#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    /// Duplicate pool, unknown agent type, or invalid settings.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Configuration sources could not be read or deserialized.
    #[error("failed to load configuration: {0}")]
    ConfigLoad(String),

    /// No pool serves the requested agent type.
    #[error("no pool for agent type '{0}'")]
    NoSuchPool(String),

    /// The agent type's handler does not expose the requested action.
    #[error("agent type '{agent_type}' does not support action '{action}'")]
    UnsupportedAction { agent_type: String, action: String },

    /// Adding an agent would exceed `max_agents`. Returned by manual
    /// `create_agent`/`create_pool`; `route_job` queues instead.
    #[error("agent capacity exhausted: {0}")]
    Capacity(String),

    /// The pool queue reached its configured bound.
    #[error("queue for pool '{agent_type}' is full ({limit} jobs)")]
    QueueFull { agent_type: String, limit: usize },

    /// The job exceeded its allotted time.
    #[error("job {job_id} timed out after {timeout:?}")]
    Timeout { job_id: String, timeout: Duration },

    /// The worker crashed, exited, or stopped sending heartbeats.
    #[error("worker fault on agent {agent_id}: {reason}")]
    WorkerFault { agent_id: String, reason: String },

    /// The task handler reported a domain failure.
    #[error("job {job_id} failed: {message}")]
    Execution { job_id: String, message: String },

    /// The job was cancelled before it produced a result.
    #[error("job {job_id} cancelled: {reason}")]
    Cancelled { job_id: String, reason: String },

    /// A worker execution context could not be started.
    #[error("failed to spawn worker: {0}")]
    Spawn(String),

    /// The manager no longer accepts work.
    #[error("pool manager is shutting down")]
    ShuttingDown,

    /// Tracing or metrics could not be installed.
    #[error("observability setup failed: {0}")]
    Observability(String),
}

impl EngineError {
    /// Whether this error ends a job without any result from its handler.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, EngineError::Cancelled { .. })
    }
}

impl From<config::ConfigError> for EngineError {
    fn from(err: config::ConfigError) -> Self {
        EngineError::ConfigLoad(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = EngineError::UnsupportedAction {
            agent_type: "code-generator".to_string(),
            action: "fly".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "agent type 'code-generator' does not support action 'fly'"
        );

        let err = EngineError::NoSuchPool("test-writer".to_string());
        assert!(err.to_string().contains("test-writer"));
    }

    #[test]
    fn test_cancellation_predicate() {
        let cancelled = EngineError::Cancelled {
            job_id: "job_1".to_string(),
            reason: "manager shutdown".to_string(),
        };
        assert!(cancelled.is_cancellation());
        assert!(!EngineError::ShuttingDown.is_cancellation());
    }
}
