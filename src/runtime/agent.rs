// src/runtime/agent.rs
//! Agent handles
//!
//! An [`AgentHandle`] is the manager's bookkeeping for one worker: its
//! status, the job bound to it, and the caller waiting on that job.
//!
//! Retirement happens under the pool lock and consumes the handle, so a
//! terminating agent is never observable in a pool; its worker is awaited
//! through the returned [`WorkerLink`].

use crate::runtime::job::{Job, Responder};
use crate::runtime::worker::{ManagerMessage, WorkerLink};
use crate::utils::errors::Result;
use serde::Serialize;
use std::time::{Duration, Instant};
use tokio::task::AbortHandle;

/// Lifecycle status of an agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Idle,
    Busy,
}

/// A timed-out job the worker is still running
#[derive(Debug, Clone)]
pub(crate) struct OrphanedJob {
    pub job_id: String,
    pub since: Instant,
}

/// The caller's outstanding result plus its timeout guard
#[derive(Debug)]
pub(crate) struct PendingCompletion {
    pub responder: Responder,
    pub timeout_guard: AbortHandle,
    pub dispatched_at: Instant,
}

impl PendingCompletion {
    /// Disarm the timeout guard and hand back the responder
    pub fn disarm(self) -> Responder {
        self.timeout_guard.abort();
        self.responder
    }
}

/// Manager-side handle to one worker
#[derive(Debug)]
pub struct AgentHandle {
    pub id: String,
    pub agent_type: String,
    pub status: AgentStatus,
    worker: WorkerLink,
    current_job: Option<Job>,
    pending: Option<PendingCompletion>,
    orphan: Option<OrphanedJob>,
    pub created_at: Instant,
    pub last_used: Instant,
    pub last_heartbeat: Instant,
    pub jobs_done: u64,
    pub errors: u64,
}

impl AgentHandle {
    pub(crate) fn new(id: String, agent_type: String, worker: WorkerLink) -> Self {
        let now = Instant::now();
        Self {
            id,
            agent_type,
            status: AgentStatus::Idle,
            worker,
            current_job: None,
            pending: None,
            orphan: None,
            created_at: now,
            last_used: now,
            last_heartbeat: now,
            jobs_done: 0,
            errors: 0,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.status == AgentStatus::Idle
    }

    /// Idle and not still working off a timed-out job
    pub fn is_available(&self) -> bool {
        self.is_idle() && self.orphan.is_none()
    }

    pub fn current_job(&self) -> Option<&Job> {
        self.current_job.as_ref()
    }

    /// Whether `job_id` is the job this agent is bound to
    pub fn is_running(&self, job_id: &str) -> bool {
        self.current_job.as_ref().is_some_and(|job| job.id == job_id)
    }

    /// Bind a job and mark the agent busy
    pub(crate) fn bind(&mut self, job: Job, pending: PendingCompletion) {
        self.status = AgentStatus::Busy;
        self.current_job = Some(job);
        self.pending = Some(pending);
        self.last_used = Instant::now();
    }

    /// Unbind the current job and return to idle
    pub(crate) fn release(&mut self) -> Option<(Job, PendingCompletion)> {
        if self.status == AgentStatus::Busy {
            self.status = AgentStatus::Idle;
        }
        self.last_used = Instant::now();
        let job = self.current_job.take()?;
        let pending = self.pending.take()?;
        Some((job, pending))
    }

    /// Remember a job whose caller gave up while the worker still runs it
    pub(crate) fn orphan(&mut self, job_id: String) {
        self.orphan = Some(OrphanedJob {
            job_id,
            since: Instant::now(),
        });
    }

    /// Clear the orphan if `job_id` is it. `true` when cleared.
    pub(crate) fn settle_orphan(&mut self, job_id: &str) -> bool {
        if self.orphan.as_ref().is_some_and(|o| o.job_id == job_id) {
            self.orphan = None;
            return true;
        }
        false
    }

    pub fn orphaned_job(&self) -> Option<&str> {
        self.orphan.as_ref().map(|o| o.job_id.as_str())
    }

    #[cfg(test)]
    pub(crate) fn backdate_orphan(&mut self, by: Duration) {
        if let Some(orphan) = self.orphan.as_mut() {
            if let Some(since) = orphan.since.checked_sub(by) {
                orphan.since = since;
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn abort_worker(&self) {
        self.worker.abort();
    }

    pub(crate) fn send(&self, message: ManagerMessage) -> Result<()> {
        self.worker.send(&self.id, message)
    }

    pub fn record_heartbeat(&mut self) {
        self.last_heartbeat = Instant::now();
    }

    /// No heartbeat within `deadline`, the worker task has exited, or a
    /// timed-out job has kept the worker busy for longer than `deadline`
    pub fn is_unresponsive(&self, deadline: Duration) -> bool {
        self.worker.is_finished()
            || self.last_heartbeat.elapsed() > deadline
            || self.orphan.as_ref().is_some_and(|o| o.since.elapsed() > deadline)
    }

    pub fn idle_for(&self) -> Option<Duration> {
        self.is_idle().then(|| self.last_used.elapsed())
    }

    /// Consume the handle, returning the worker link and any bound job
    pub(crate) fn into_worker(mut self) -> (WorkerLink, Option<(Job, PendingCompletion)>) {
        let bound = self.current_job.take().zip(self.pending.take());
        (self.worker, bound)
    }

    pub fn snapshot(&self) -> AgentSnapshot {
        AgentSnapshot {
            id: self.id.clone(),
            status: self.status,
            current_job: self.current_job.as_ref().map(|job| job.id.clone()),
            orphaned_job: self.orphaned_job().map(str::to_string),
            jobs_done: self.jobs_done,
            errors: self.errors,
            age_ms: self.created_at.elapsed().as_millis() as u64,
            idle_ms: self.idle_for().map(|d| d.as_millis() as u64),
        }
    }
}

/// Point-in-time view of an agent for status output
#[derive(Debug, Clone, Serialize)]
pub struct AgentSnapshot {
    pub id: String,
    pub status: AgentStatus,
    pub current_job: Option<String>,
    /// Timed-out job the worker has not finished yet
    pub orphaned_job: Option<String>,
    pub jobs_done: u64,
    pub errors: u64,
    pub age_ms: u64,
    pub idle_ms: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::job::{JobHandle, JobRequest};
    use crate::runtime::worker::silent_link;

    fn handle(id: &str) -> AgentHandle {
        let (link, _inbox) = silent_link();
        AgentHandle::new(id.to_string(), "requirements-analyzer".to_string(), link)
    }

    fn bound_job() -> (Job, PendingCompletion, JobHandle) {
        let job = Job::from_request(
            JobRequest::new("requirements-analyzer", "analyze"),
            Duration::from_secs(60),
        );
        let (responder, handle) = JobHandle::channel(&job.id);
        let guard = tokio::spawn(std::future::pending::<()>());
        let pending = PendingCompletion {
            responder,
            timeout_guard: guard.abort_handle(),
            dispatched_at: Instant::now(),
        };
        (job, pending, handle)
    }

    #[tokio::test]
    async fn test_status_follows_bind_and_release() {
        let mut agent = handle("agent_a");
        assert_eq!(agent.snapshot().status, AgentStatus::Idle);

        let (job, pending, _handle) = bound_job();
        let job_id = job.id.clone();
        agent.bind(job, pending);
        assert_eq!(agent.status, AgentStatus::Busy);
        assert_eq!(agent.snapshot().current_job.as_deref(), Some(job_id.as_str()));
        assert!(agent.idle_for().is_none());

        assert!(agent.release().is_some());
        assert!(agent.is_idle());
        assert!(agent.release().is_none());
    }

    #[tokio::test]
    async fn test_into_worker_hands_over_bound_job() {
        let mut agent = handle("agent_a");
        let (job, pending, _handle) = bound_job();
        let job_id = job.id.clone();
        agent.bind(job, pending);

        let (_link, bound) = agent.into_worker();
        assert_eq!(bound.map(|(job, _)| job.id), Some(job_id));
    }

    #[tokio::test]
    async fn test_orphan_blocks_availability() {
        let mut agent = handle("agent_a");
        assert!(agent.is_available());

        agent.orphan("job_late".to_string());
        assert!(agent.is_idle());
        assert!(!agent.is_available());
        assert_eq!(agent.snapshot().orphaned_job.as_deref(), Some("job_late"));

        assert!(agent.settle_orphan("job_late"));
        assert!(agent.is_available());
        assert!(agent.snapshot().orphaned_job.is_none());
    }

    #[test]
    fn test_status_wire_names() {
        assert_eq!(serde_json::to_value(AgentStatus::Idle).unwrap(), "idle");
        assert_eq!(serde_json::to_value(AgentStatus::Busy).unwrap(), "busy");
    }
}
