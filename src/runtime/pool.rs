// src/runtime/pool.rs
//! Per-agent-type pools
//!
//! A [`Pool`] owns the agent handles serving one agent type, the queue of
//! jobs waiting for them and the pool's rolling metrics. It is plain data:
//! the manager keeps each pool behind its own mutex and never holds that
//! lock across an `.await`.
//!
//! # Architecture
//!
//! ```text
//! Pool("code-generator")
//! ├─ Agents: {agent_01H.. (idle), agent_01J.. (busy: job_..)}
//! ├─ Queue:  [high job, normal job, normal job]
//! └─ Metrics: processed / errors / timeouts / avg response
//! ```

use crate::runtime::agent::{AgentHandle, AgentSnapshot, PendingCompletion};
use crate::runtime::job::{Job, Priority, QueuedJob};
use crate::runtime::scaling::{utilization, PoolLoad, ScalingRecord};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

/// Rolling job metrics for a pool
#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolMetrics {
    /// Jobs that reached a terminal state through a worker or a timeout
    pub processed: u64,
    pub errors: u64,
    pub timeouts: u64,
    pub total_response_ms: u64,
}

impl PoolMetrics {
    pub fn average_response_ms(&self) -> f64 {
        if self.processed == 0 {
            0.0
        } else {
            self.total_response_ms as f64 / self.processed as f64
        }
    }
}

/// Serializable view of a pool
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub agent_type: String,
    pub agents: usize,
    pub idle_agents: usize,
    pub busy_agents: usize,
    pub active_jobs: usize,
    pub queue_length: usize,
    pub max_concurrency: usize,
    pub utilization: f64,
    pub metrics: PoolMetrics,
    pub average_response_ms: f64,
    pub last_activity: DateTime<Utc>,
    pub last_scaling: Option<ScalingRecord>,
    pub agent_details: Vec<AgentSnapshot>,
}

/// Agents, queue and metrics for one agent type
#[derive(Debug)]
pub struct Pool {
    agent_type: String,
    /// Keyed by ULID-based id, so iteration runs oldest agent first
    agents: BTreeMap<String, AgentHandle>,
    queue: VecDeque<QueuedJob>,
    max_concurrency: usize,
    active_jobs: usize,
    metrics: PoolMetrics,
    last_activity: DateTime<Utc>,
    last_scaled_at: Option<Instant>,
    last_scaling: Option<ScalingRecord>,
}

impl Pool {
    pub fn new(agent_type: impl Into<String>, max_concurrency: usize) -> Self {
        Self {
            agent_type: agent_type.into(),
            agents: BTreeMap::new(),
            queue: VecDeque::new(),
            max_concurrency,
            active_jobs: 0,
            metrics: PoolMetrics::default(),
            last_activity: Utc::now(),
            last_scaled_at: None,
            last_scaling: None,
        }
    }

    pub fn agent_type(&self) -> &str {
        &self.agent_type
    }

    pub fn agent_count(&self) -> usize {
        self.agents.len()
    }

    pub fn active_jobs(&self) -> usize {
        self.active_jobs
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    pub fn metrics(&self) -> &PoolMetrics {
        &self.metrics
    }

    pub fn utilization(&self) -> f64 {
        utilization(self.active_jobs, self.agents.len())
    }

    pub fn agent(&self, agent_id: &str) -> Option<&AgentHandle> {
        self.agents.get(agent_id)
    }

    pub fn agent_mut(&mut self, agent_id: &str) -> Option<&mut AgentHandle> {
        self.agents.get_mut(agent_id)
    }

    pub fn agent_ids(&self) -> Vec<String> {
        self.agents.keys().cloned().collect()
    }

    pub(crate) fn insert_agent(&mut self, agent: AgentHandle) {
        // pools created larger than their cap widen the cap
        if self.agents.len() >= self.max_concurrency {
            self.max_concurrency = self.agents.len() + 1;
        }
        self.agents.insert(agent.id.clone(), agent);
    }

    /// Take an agent out of the pool, releasing its in-flight slot
    pub(crate) fn remove_agent(&mut self, agent_id: &str) -> Option<AgentHandle> {
        let agent = self.agents.remove(agent_id)?;
        if agent.current_job().is_some() {
            self.active_jobs = self.active_jobs.saturating_sub(1);
        }
        self.touch();
        Some(agent)
    }

    pub(crate) fn drain_agents(&mut self) -> Vec<AgentHandle> {
        self.active_jobs = 0;
        std::mem::take(&mut self.agents).into_values().collect()
    }

    /// First available agent in id order
    ///
    /// Agents still running a timed-out job are skipped until their worker
    /// reports that job.
    pub fn find_available_agent(&self) -> Option<String> {
        self.agents
            .values()
            .find(|agent| agent.is_available())
            .map(|agent| agent.id.clone())
    }

    /// Queue a job; high priority goes to the head. Returns the 1-based position.
    pub(crate) fn enqueue(&mut self, mut queued: QueuedJob) -> usize {
        queued.job.queued_at = Some(Instant::now());
        self.touch();
        match queued.job.priority {
            Priority::High => {
                self.queue.push_front(queued);
                1
            }
            Priority::Normal => {
                self.queue.push_back(queued);
                self.queue.len()
            }
        }
    }

    /// Put a job back at the head without touching its queue timestamp
    pub(crate) fn requeue_front(&mut self, queued: QueuedJob) {
        self.queue.push_front(queued);
    }

    pub(crate) fn dequeue(&mut self) -> Option<QueuedJob> {
        self.queue.pop_front()
    }

    pub(crate) fn drain_queue(&mut self) -> Vec<QueuedJob> {
        self.queue.drain(..).collect()
    }

    /// Bind `job` to an idle agent. Hands the job back if the agent is gone or busy.
    pub(crate) fn bind_job(
        &mut self,
        agent_id: &str,
        job: Job,
        pending: PendingCompletion,
    ) -> Result<(), (Job, PendingCompletion)> {
        match self.agents.get_mut(agent_id) {
            Some(agent) if agent.is_available() => {
                agent.bind(job, pending);
                self.active_jobs += 1;
                self.touch();
                debug_assert!(self.active_jobs <= self.agents.len());
                Ok(())
            }
            _ => Err((job, pending)),
        }
    }

    /// Free the agent running `job_id`. `None` when the correlation is gone.
    pub(crate) fn release_job(
        &mut self,
        agent_id: &str,
        job_id: &str,
    ) -> Option<(Job, PendingCompletion)> {
        let agent = self.agents.get_mut(agent_id)?;
        if !agent.is_running(job_id) {
            return None;
        }
        let released = agent.release()?;
        self.active_jobs = self.active_jobs.saturating_sub(1);
        self.touch();
        Some(released)
    }

    pub(crate) fn record_outcome(&mut self, response: Duration, success: bool) {
        self.metrics.processed += 1;
        self.metrics.total_response_ms += response.as_millis() as u64;
        if !success {
            self.metrics.errors += 1;
        }
    }

    pub(crate) fn record_timeout(&mut self, waited: Duration) {
        self.record_outcome(waited, false);
        self.metrics.timeouts += 1;
    }

    /// Rough wait for a job at `position`: one average response per wave of agents
    pub fn estimated_wait(&self, position: usize) -> Duration {
        let agents = self.agents.len().max(1);
        let waves = position.div_ceil(agents) as f64;
        Duration::from_millis((waves * self.metrics.average_response_ms()).round() as u64)
    }

    /// Idle agents past `grace`, longest idle first
    pub fn idle_agents_past(&self, grace: Duration) -> Vec<String> {
        let mut idle: Vec<(Duration, &String)> = self
            .agents
            .iter()
            .filter_map(|(id, agent)| agent.idle_for().map(|d| (d, id)))
            .filter(|(idle_for, _)| *idle_for >= grace)
            .collect();
        idle.sort_by(|a, b| b.0.cmp(&a.0));
        idle.into_iter().map(|(_, id)| id.clone()).collect()
    }

    pub fn unresponsive_agents(&self, deadline: Duration) -> Vec<String> {
        self.agents
            .values()
            .filter(|agent| agent.is_unresponsive(deadline))
            .map(|agent| agent.id.clone())
            .collect()
    }

    pub fn load(&self) -> PoolLoad {
        PoolLoad {
            active_jobs: self.active_jobs,
            agents: self.agents.len(),
            max_concurrency: self.max_concurrency,
            since_last_scaling: self.last_scaled_at.map(|at| at.elapsed()),
        }
    }

    pub(crate) fn mark_scaled(&mut self, record: ScalingRecord) {
        self.last_scaled_at = Some(Instant::now());
        self.last_scaling = Some(record);
        self.touch();
    }

    fn touch(&mut self) {
        self.last_activity = Utc::now();
    }

    pub fn status(&self) -> PoolStatus {
        let idle = self.agents.values().filter(|a| a.is_idle()).count();
        PoolStatus {
            agent_type: self.agent_type.clone(),
            agents: self.agents.len(),
            idle_agents: idle,
            busy_agents: self.active_jobs,
            active_jobs: self.active_jobs,
            queue_length: self.queue.len(),
            max_concurrency: self.max_concurrency,
            utilization: self.utilization(),
            metrics: self.metrics.clone(),
            average_response_ms: self.metrics.average_response_ms(),
            last_activity: self.last_activity,
            last_scaling: self.last_scaling.clone(),
            agent_details: self.agents.values().map(AgentHandle::snapshot).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::agent::AgentStatus;
    use crate::runtime::job::{JobHandle, JobRequest};
    use crate::runtime::worker::silent_link;
    use proptest::prelude::*;

    fn add_agent(pool: &mut Pool, id: &str) {
        let (link, _inbox) = silent_link();
        pool.insert_agent(AgentHandle::new(id.to_string(), pool.agent_type().to_string(), link));
    }

    fn queued(priority: Priority) -> (QueuedJob, JobHandle) {
        let request = JobRequest::new("requirements-analyzer", "analyze").with_priority(priority);
        let job = Job::from_request(request, Duration::from_secs(60));
        let (responder, handle) = JobHandle::channel(&job.id);
        (QueuedJob { job, responder }, handle)
    }

    fn pending(responder: crate::runtime::job::Responder) -> PendingCompletion {
        let guard = tokio::spawn(std::future::pending::<()>());
        PendingCompletion {
            responder,
            timeout_guard: guard.abort_handle(),
            dispatched_at: Instant::now(),
        }
    }

    #[tokio::test]
    async fn test_find_available_agent_in_id_order() {
        let mut pool = Pool::new("requirements-analyzer", 3);
        assert!(pool.find_available_agent().is_none());

        add_agent(&mut pool, "agent_b");
        add_agent(&mut pool, "agent_a");
        assert_eq!(pool.find_available_agent().as_deref(), Some("agent_a"));
    }

    #[tokio::test]
    async fn test_orphaned_agent_is_skipped_until_settled() {
        let mut pool = Pool::new("requirements-analyzer", 3);
        add_agent(&mut pool, "agent_a");
        add_agent(&mut pool, "agent_b");

        pool.agent_mut("agent_a").unwrap().orphan("job_late".to_string());
        assert_eq!(pool.find_available_agent().as_deref(), Some("agent_b"));

        let (QueuedJob { job, responder }, _handle) = queued(Priority::Normal);
        assert!(pool.bind_job("agent_a", job, pending(responder)).is_err());

        let agent = pool.agent_mut("agent_a").unwrap();
        assert!(!agent.settle_orphan("job_other"));
        assert!(agent.settle_orphan("job_late"));
        assert_eq!(pool.find_available_agent().as_deref(), Some("agent_a"));
    }

    #[tokio::test]
    async fn test_long_orphan_counts_as_unresponsive() {
        let mut pool = Pool::new("requirements-analyzer", 3);
        add_agent(&mut pool, "agent_a");
        let deadline = Duration::from_secs(2);

        let agent = pool.agent_mut("agent_a").unwrap();
        agent.orphan("job_late".to_string());
        assert!(pool.unresponsive_agents(deadline).is_empty());

        pool.agent_mut("agent_a").unwrap().backdate_orphan(Duration::from_secs(10));
        assert_eq!(pool.unresponsive_agents(deadline), vec!["agent_a".to_string()]);
    }

    #[tokio::test]
    async fn test_bind_and_release() {
        let mut pool = Pool::new("requirements-analyzer", 3);
        add_agent(&mut pool, "agent_a");

        let (QueuedJob { job, responder }, _handle) = queued(Priority::Normal);
        let job_id = job.id.clone();
        assert!(pool.bind_job("agent_a", job, pending(responder)).is_ok());
        assert_eq!(pool.active_jobs(), 1);
        assert_eq!(pool.agent("agent_a").unwrap().status, AgentStatus::Busy);
        assert!(pool.find_available_agent().is_none());

        // a busy agent refuses a second job
        let (QueuedJob { job, responder }, _handle2) = queued(Priority::Normal);
        assert!(pool.bind_job("agent_a", job, pending(responder)).is_err());

        // stale correlation is ignored
        assert!(pool.release_job("agent_a", "job_unknown").is_none());

        let (job, _) = pool.release_job("agent_a", &job_id).unwrap();
        assert_eq!(job.id, job_id);
        assert_eq!(pool.active_jobs(), 0);
        assert!(pool.agent("agent_a").unwrap().is_idle());
    }

    #[tokio::test]
    async fn test_removing_busy_agent_frees_slot() {
        let mut pool = Pool::new("requirements-analyzer", 3);
        add_agent(&mut pool, "agent_a");
        let (QueuedJob { job, responder }, _handle) = queued(Priority::Normal);
        pool.bind_job("agent_a", job, pending(responder)).unwrap();

        let agent = pool.remove_agent("agent_a").unwrap();
        assert!(agent.current_job().is_some());
        assert_eq!(pool.active_jobs(), 0);
        assert_eq!(pool.agent_count(), 0);
    }

    #[test]
    fn test_priority_queueing() {
        let mut pool = Pool::new("requirements-analyzer", 1);
        let (first, _h1) = queued(Priority::Normal);
        let (second, _h2) = queued(Priority::Normal);
        let (urgent, _h3) = queued(Priority::High);
        let urgent_id = urgent.job.id.clone();
        let first_id = first.job.id.clone();

        assert_eq!(pool.enqueue(first), 1);
        assert_eq!(pool.enqueue(second), 2);
        assert_eq!(pool.enqueue(urgent), 1);
        assert_eq!(pool.queue_len(), 3);

        let head = pool.dequeue().unwrap();
        assert_eq!(head.job.id, urgent_id);
        assert!(head.job.queued_at.is_some());
        assert_eq!(pool.dequeue().unwrap().job.id, first_id);
    }

    #[tokio::test]
    async fn test_estimated_wait_uses_average_response() {
        let mut pool = Pool::new("requirements-analyzer", 3);
        add_agent(&mut pool, "agent_a");
        add_agent(&mut pool, "agent_b");
        assert_eq!(pool.estimated_wait(1), Duration::ZERO);

        pool.record_outcome(Duration::from_millis(100), true);
        pool.record_outcome(Duration::from_millis(300), true);
        assert_eq!(pool.estimated_wait(1), Duration::from_millis(200));
        assert_eq!(pool.estimated_wait(3), Duration::from_millis(400));
    }

    #[test]
    fn test_metrics() {
        let mut pool = Pool::new("requirements-analyzer", 1);
        pool.record_outcome(Duration::from_millis(10), true);
        pool.record_outcome(Duration::from_millis(30), false);
        pool.record_timeout(Duration::from_millis(50));

        let metrics = pool.metrics();
        assert_eq!(metrics.processed, 3);
        assert_eq!(metrics.errors, 2);
        assert_eq!(metrics.timeouts, 1);
        assert_eq!(metrics.average_response_ms(), 30.0);
    }

    #[tokio::test]
    async fn test_insert_beyond_cap_widens_cap() {
        let mut pool = Pool::new("requirements-analyzer", 1);
        add_agent(&mut pool, "agent_a");
        add_agent(&mut pool, "agent_b");
        assert_eq!(pool.max_concurrency(), 2);
    }

    proptest! {
        #[test]
        fn prop_high_priority_always_dequeues_first(normals in 0usize..10, highs in 1usize..5) {
            let mut pool = Pool::new("requirements-analyzer", 1);
            let mut handles = Vec::new();
            let mut last_high = String::new();

            for _ in 0..normals {
                let (job, handle) = queued(Priority::Normal);
                pool.enqueue(job);
                handles.push(handle);
            }
            for _ in 0..highs {
                let (job, handle) = queued(Priority::High);
                last_high = job.job.id.clone();
                pool.enqueue(job);
                handles.push(handle);
            }

            prop_assert_eq!(pool.queue_len(), normals + highs);
            let head = pool.dequeue().unwrap();
            prop_assert_eq!(head.job.id, last_high);
            for _ in 1..highs {
                prop_assert_eq!(pool.dequeue().unwrap().job.priority, Priority::High);
            }
            while let Some(next) = pool.dequeue() {
                prop_assert_eq!(next.job.priority, Priority::Normal);
            }
        }
    }
}
