// src/runtime/job.rs
//! Jobs and their caller-facing result handles
//!
//! A [`JobRequest`] is what callers submit. The manager stamps it into a
//! [`Job`] and hands back a [`Submission`] carrying a [`JobHandle`]; the
//! handle resolves exactly once, with the handler's output or an
//! [`EngineError`].

use crate::utils::errors::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use ulid::Ulid;

/// Job priority
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    #[default]
    Normal,
    /// Inserted at the head of the pool queue
    High,
}

/// A unit of work as submitted by a caller
#[derive(Debug, Clone)]
pub struct JobRequest {
    /// Agent type whose pool should run the job
    pub agent_type: String,

    /// Handler action to invoke
    pub action: String,

    /// Action input
    pub payload: serde_json::Value,

    pub priority: Priority,

    /// Overrides the configured default timeout
    pub timeout: Option<Duration>,
}

impl JobRequest {
    pub fn new(agent_type: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            agent_type: agent_type.into(),
            action: action.into(),
            payload: serde_json::Value::Null,
            priority: Priority::Normal,
            timeout: None,
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// A job accepted by the manager
#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub agent_type: String,
    pub action: String,
    pub payload: serde_json::Value,
    pub priority: Priority,
    pub timeout: Duration,
    pub submitted_at: Instant,
    /// Set when the job had to wait for an agent
    pub queued_at: Option<Instant>,
}

impl Job {
    pub(crate) fn from_request(request: JobRequest, default_timeout: Duration) -> Self {
        Self {
            id: format!("job_{}", Ulid::new()),
            agent_type: request.agent_type,
            action: request.action,
            payload: request.payload,
            priority: request.priority,
            timeout: request.timeout.unwrap_or(default_timeout),
            submitted_at: Instant::now(),
            queued_at: None,
        }
    }

    /// What the worker needs to run the job
    pub(crate) fn envelope(&self) -> JobEnvelope {
        JobEnvelope {
            id: self.id.clone(),
            action: self.action.clone(),
            payload: self.payload.clone(),
        }
    }
}

/// Wire form of a job sent to a worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEnvelope {
    pub id: String,
    pub action: String,
    pub payload: serde_json::Value,
}

/// Successful job result
#[derive(Debug, Clone)]
pub struct JobOutput {
    pub job_id: String,
    pub agent_id: String,
    pub result: serde_json::Value,
    /// Time the handler spent on the job, as reported by the worker
    pub execution_time: Duration,
    /// When the manager received the completion
    pub completed_at: Instant,
}

pub(crate) type Responder = oneshot::Sender<Result<JobOutput>>;

/// A job waiting in a pool queue together with its caller's responder
#[derive(Debug)]
pub(crate) struct QueuedJob {
    pub job: Job,
    pub responder: Responder,
}

impl QueuedJob {
    /// Resolve the caller with a cancellation
    pub fn cancel(self, reason: &str) {
        let _ = self.responder.send(Err(EngineError::Cancelled {
            job_id: self.job.id,
            reason: reason.to_string(),
        }));
    }
}

/// Caller side of a job's pending result
#[derive(Debug)]
pub struct JobHandle {
    job_id: String,
    receiver: oneshot::Receiver<Result<JobOutput>>,
}

impl JobHandle {
    pub(crate) fn channel(job_id: &str) -> (Responder, Self) {
        let (tx, rx) = oneshot::channel();
        (
            tx,
            Self {
                job_id: job_id.to_string(),
                receiver: rx,
            },
        )
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Wait for the job to reach a terminal state
    pub async fn wait(self) -> Result<JobOutput> {
        match self.receiver.await {
            Ok(outcome) => outcome,
            // responder dropped without an answer: the manager went away
            Err(_) => Err(EngineError::Cancelled {
                job_id: self.job_id,
                reason: "pool manager dropped the job".to_string(),
            }),
        }
    }
}

/// Outcome of [`crate::PoolManager::route_job`]
#[derive(Debug)]
pub enum Submission {
    /// An idle agent took the job right away
    Dispatched {
        job_id: String,
        agent_id: String,
        handle: JobHandle,
    },

    /// No idle agent; the job waits in the pool queue
    Queued {
        job_id: String,
        /// 1-based position at insertion time
        queue_position: usize,
        estimated_wait: Duration,
        handle: JobHandle,
    },
}

impl Submission {
    pub fn job_id(&self) -> &str {
        match self {
            Submission::Dispatched { job_id, .. } | Submission::Queued { job_id, .. } => job_id,
        }
    }

    pub fn is_queued(&self) -> bool {
        matches!(self, Submission::Queued { .. })
    }

    pub fn queue_position(&self) -> Option<usize> {
        match self {
            Submission::Queued { queue_position, .. } => Some(*queue_position),
            Submission::Dispatched { .. } => None,
        }
    }

    pub fn into_handle(self) -> JobHandle {
        match self {
            Submission::Dispatched { handle, .. } | Submission::Queued { handle, .. } => handle,
        }
    }

    /// Shorthand for `into_handle().wait()`
    pub async fn wait(self) -> Result<JobOutput> {
        self.into_handle().wait().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_builder() {
        let request = JobRequest::new("code-generator", "generate")
            .with_payload(json!({"spec": "fizzbuzz"}))
            .with_priority(Priority::High)
            .with_timeout(Duration::from_secs(5));

        let job = Job::from_request(request, Duration::from_secs(60));
        assert!(job.id.starts_with("job_"));
        assert_eq!(job.priority, Priority::High);
        assert_eq!(job.timeout, Duration::from_secs(5));
        assert!(job.queued_at.is_none());
        assert_eq!(job.envelope().payload["spec"], "fizzbuzz");
    }

    #[test]
    fn test_default_timeout_applies() {
        let job = Job::from_request(JobRequest::new("a", "b"), Duration::from_secs(60));
        assert_eq!(job.timeout, Duration::from_secs(60));
        assert_eq!(job.priority, Priority::Normal);
    }

    #[test]
    fn test_priority_wire_format() {
        assert_eq!(serde_json::to_value(Priority::High).unwrap(), json!("high"));
        let parsed: Priority = serde_json::from_value(json!("normal")).unwrap();
        assert_eq!(parsed, Priority::Normal);
    }

    #[tokio::test]
    async fn test_cancelled_queued_job_resolves_handle() {
        let job = Job::from_request(JobRequest::new("a", "b"), Duration::from_secs(1));
        let (responder, handle) = JobHandle::channel(&job.id);
        QueuedJob { job, responder }.cancel("manager shutdown");

        let err = handle.wait().await.unwrap_err();
        assert!(err.is_cancellation());
    }

    #[tokio::test]
    async fn test_dropped_responder_is_cancellation() {
        let (responder, handle) = JobHandle::channel("job_x");
        drop(responder);
        assert!(matches!(
            handle.wait().await,
            Err(EngineError::Cancelled { job_id, .. }) if job_id == "job_x"
        ));
    }
}
