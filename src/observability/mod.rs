// src/observability/mod.rs
//! Tracing, logging and metrics
//!
//! - **Tracing**: `tracing-subscriber` with `RUST_LOG`-style filtering and
//!   optional JSON output
//! - **Metrics**: `metrics` facade exported through a Prometheus recorder
//!
//! The helpers below are the only places that name metrics, so the
//! dashboard-facing schema lives in one file.

use crate::runtime::pool::PoolStatus;
use crate::runtime::scaling::ScaleDirection;
use crate::utils::config::LoggingConfig;
use crate::utils::errors::{EngineError, Result};
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

pub const JOBS_SUBMITTED: &str = "agent_pool_jobs_submitted_total";
pub const JOBS_FINISHED: &str = "agent_pool_jobs_finished_total";
pub const JOB_DURATION: &str = "agent_pool_job_duration_seconds";
pub const SCALING_ACTIONS: &str = "agent_pool_scaling_actions_total";
pub const AGENTS_REPLACED: &str = "agent_pool_agents_replaced_total";
pub const POOL_AGENTS: &str = "agent_pool_agents";
pub const POOL_ACTIVE_JOBS: &str = "agent_pool_active_jobs";
pub const POOL_QUEUE_LENGTH: &str = "agent_pool_queue_length";
pub const POOL_UTILIZATION: &str = "agent_pool_utilization_percent";

/// Terminal outcome of a job, used as a metrics label
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Failed,
    TimedOut,
    Cancelled,
    Faulted,
}

impl JobOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobOutcome::Completed => "completed",
            JobOutcome::Failed => "failed",
            JobOutcome::TimedOut => "timed_out",
            JobOutcome::Cancelled => "cancelled",
            JobOutcome::Faulted => "faulted",
        }
    }
}

/// Install the global tracing subscriber with default logging settings
pub fn init_tracing() -> Result<()> {
    init_tracing_with(&LoggingConfig::default())
}

/// Install the global tracing subscriber
///
/// `RUST_LOG` wins over `logging.level` when set.
pub fn init_tracing_with(logging: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(logging.level.as_str()));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    let installed = if logging.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    installed.map_err(|e| EngineError::Observability(format!("tracing: {}", e)))
}

/// Install the Prometheus recorder and describe engine metrics
///
/// The returned handle renders the scrape payload; serving it is up to the
/// embedding application.
pub fn init_metrics() -> Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| EngineError::Observability(format!("metrics: {}", e)))?;

    describe_counter!(JOBS_SUBMITTED, "Jobs accepted by route_job");
    describe_counter!(JOBS_FINISHED, "Jobs that reached a terminal state");
    describe_histogram!(JOB_DURATION, "Worker execution time of finished jobs");
    describe_counter!(SCALING_ACTIONS, "Scale-up and scale-down actions applied");
    describe_counter!(AGENTS_REPLACED, "Unhealthy agents replaced by health checks");
    describe_gauge!(POOL_AGENTS, "Agents per pool");
    describe_gauge!(POOL_ACTIVE_JOBS, "In-flight jobs per pool");
    describe_gauge!(POOL_QUEUE_LENGTH, "Queued jobs per pool");
    describe_gauge!(POOL_UTILIZATION, "Active jobs over agents, in percent");

    Ok(handle)
}

pub(crate) fn record_submission(agent_type: &str, queued: bool) {
    let disposition = if queued { "queued" } else { "dispatched" };
    counter!(JOBS_SUBMITTED, "agent_type" => agent_type.to_string(), "disposition" => disposition)
        .increment(1);
}

pub(crate) fn record_job_outcome(agent_type: &str, outcome: JobOutcome, elapsed: Option<Duration>) {
    counter!(JOBS_FINISHED, "agent_type" => agent_type.to_string(), "outcome" => outcome.as_str())
        .increment(1);
    if let Some(elapsed) = elapsed {
        histogram!(JOB_DURATION, "agent_type" => agent_type.to_string()).record(elapsed.as_secs_f64());
    }
}

pub(crate) fn record_scaling(agent_type: &str, direction: ScaleDirection, delta: usize) {
    counter!(SCALING_ACTIONS, "agent_type" => agent_type.to_string(), "direction" => direction.as_str())
        .increment(delta as u64);
}

pub(crate) fn record_replacement(agent_type: &str) {
    counter!(AGENTS_REPLACED, "agent_type" => agent_type.to_string()).increment(1);
}

pub(crate) fn publish_pool_gauges(pool: &PoolStatus) {
    let agent_type = pool.agent_type.clone();
    gauge!(POOL_AGENTS, "agent_type" => agent_type.clone()).set(pool.agents as f64);
    gauge!(POOL_ACTIVE_JOBS, "agent_type" => agent_type.clone()).set(pool.active_jobs as f64);
    gauge!(POOL_QUEUE_LENGTH, "agent_type" => agent_type.clone()).set(pool.queue_length as f64);
    gauge!(POOL_UTILIZATION, "agent_type" => agent_type).set(pool.utilization);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_labels() {
        assert_eq!(JobOutcome::Completed.as_str(), "completed");
        assert_eq!(JobOutcome::TimedOut.as_str(), "timed_out");
        assert_eq!(JobOutcome::Faulted.as_str(), "faulted");
    }

    #[test]
    fn test_recording_without_recorder_is_noop() {
        // no recorder installed: the facade discards values
        record_submission("requirements-analyzer", true);
        record_job_outcome("requirements-analyzer", JobOutcome::Completed, Some(Duration::from_millis(5)));
        record_scaling("requirements-analyzer", ScaleDirection::Up, 2);
    }
}
