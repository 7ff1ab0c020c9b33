// src/runtime/manager.rs
//! Pool manager
//!
//! Top-level orchestrator: creates pools and agents, routes jobs, reacts to
//! worker messages, scales pools and replaces unhealthy agents.
//!
//! # Concurrency
//!
//! Each pool sits behind its own `parking_lot::Mutex`. Every structural
//! change to a pool (binding a job, freeing an agent, queueing, scaling)
//! happens synchronously while that lock is held and never across an
//! `.await`, so mutations of one pool are serialized no matter which task
//! triggers them: a caller, the worker-event dispatcher, a timeout guard or
//! housekeeping. The global agent count is an atomic; scale-up reserves
//! slots with compare-and-swap so `max_agents` holds across pools.
//!
//! ```text
//! route_job ──▶ Pool ──idle agent──▶ Worker ──WorkerEvent──▶ dispatcher
//!                 │                                            │
//!                 └──queue◀──────── process_queue ◀────────────┘
//! ```

use crate::observability::{self, JobOutcome};
use crate::runtime::agent::{AgentHandle, PendingCompletion};
use crate::runtime::handler::HandlerRegistry;
use crate::runtime::housekeeping;
use crate::runtime::job::{Job, JobHandle, JobOutput, JobRequest, QueuedJob, Responder, Submission};
use crate::runtime::pool::{Pool, PoolStatus};
use crate::runtime::scaling::{
    HoldReason, ScaleDirection, ScalingDecision, ScalingPolicy, ScalingRecord, ScalingState,
};
use crate::runtime::worker::{spawn_worker, ManagerMessage, WorkerEvent, WorkerLink, WorkerMessage, WorkerSpec};
use crate::utils::config::{EngineConfig, RuntimeConfig};
use crate::utils::errors::{EngineError, Result};
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, trace, warn};
use ulid::Ulid;

/// Snapshot returned by [`PoolManager::get_status`]
#[derive(Debug, Clone, Serialize)]
pub struct ManagerStatus {
    pub total_agents: usize,
    pub total_pools: usize,
    pub pools: Vec<PoolStatus>,
    pub scaling_state: ScalingState,
}

impl ManagerStatus {
    pub fn pool(&self, agent_type: &str) -> Option<&PoolStatus> {
        self.pools.iter().find(|p| p.agent_type == agent_type)
    }
}

/// An agent swapped out by a health check
#[derive(Debug, Clone, Serialize)]
pub struct Replacement {
    pub agent_type: String,
    pub retired: String,
    pub replacement: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct HealthReport {
    pub agents_checked: usize,
    pub replaced: Vec<Replacement>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ShutdownReport {
    /// Queued jobs resolved with a cancellation
    pub cancelled_jobs: usize,
    /// In-flight jobs whose worker was terminated
    pub interrupted_jobs: usize,
    pub terminated_workers: usize,
    /// Workers aborted after the grace period
    pub forced_terminations: usize,
}

/// Handle to the pool manager
///
/// Cheap to clone; all clones drive the same pools.
#[derive(Clone)]
pub struct PoolManager {
    inner: Arc<ManagerInner>,
}

pub(crate) struct ManagerInner {
    config: RuntimeConfig,
    policy: ScalingPolicy,
    registry: HandlerRegistry,
    pools: DashMap<String, Arc<Mutex<Pool>>>,
    /// agent id → agent type
    agent_index: DashMap<String, String>,
    total_agents: AtomicUsize,
    events: mpsc::UnboundedSender<WorkerEvent>,
    shutting_down: AtomicBool,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl PoolManager {
    /// Create the configured pools and start background housekeeping
    ///
    /// Must be called inside a tokio runtime. Any pool that cannot get its
    /// workers aborts startup.
    pub fn initialize(config: EngineConfig, registry: HandlerRegistry) -> Result<Self> {
        config.validate()?;
        for pool in &config.pools {
            if !registry.contains(&pool.agent_type) {
                return Err(EngineError::Configuration(format!(
                    "no handler registered for agent type '{}'",
                    pool.agent_type
                )));
            }
        }
        tokio::runtime::Handle::try_current()
            .map_err(|e| EngineError::Spawn(format!("pool manager needs a tokio runtime: {}", e)))?;

        let (events, event_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(ManagerInner {
            policy: ScalingPolicy::from(&config.runtime),
            config: config.runtime.clone(),
            registry,
            pools: DashMap::new(),
            agent_index: DashMap::new(),
            total_agents: AtomicUsize::new(0),
            events,
            shutting_down: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
        });

        for pool in &config.pools {
            let size = pool.initial_agents_or(&config.runtime);
            let cap = pool.max_concurrency_or(&config.runtime);
            if let Err(e) = inner.create_pool(&pool.agent_type, size, cap) {
                error!("Failed to start pool '{}': {}", pool.agent_type, e);
                inner.abort_all();
                return Err(e);
            }
        }

        housekeeping::start(&inner, event_rx);

        info!(
            "Pool manager initialized with {} pools and {} agents",
            inner.pools.len(),
            inner.total_agents.load(Ordering::SeqCst)
        );
        Ok(Self { inner })
    }

    /// Add a pool for `agent_type` with `size` agents
    pub fn create_pool(&self, agent_type: &str, size: usize) -> Result<()> {
        self.inner.ensure_running()?;
        if size == 0 {
            return Err(EngineError::Configuration(format!(
                "pool '{}' must start with at least one agent",
                agent_type
            )));
        }
        let cap = size.max(self.inner.config.pool_size);
        self.inner.create_pool(agent_type, size, cap)
    }

    /// Add one agent to an existing pool
    ///
    /// Ignores the pool's concurrency cap but not `max_agents`.
    pub fn create_agent(&self, agent_type: &str) -> Result<String> {
        self.inner.ensure_running()?;
        let pool_handle = self.inner.pool(agent_type)?;
        let mut pool = pool_handle.lock();
        let agent_id = self.inner.create_agent(&mut pool)?;
        self.inner.process_queue(&mut pool);
        Ok(agent_id)
    }

    /// Submit a job
    ///
    /// Dispatches to an idle agent when one exists, otherwise queues the job
    /// and runs a scaling check. Queuing is not an error.
    pub fn route_job(&self, request: JobRequest) -> Result<Submission> {
        self.inner.route_job(request)
    }

    /// Evaluate and apply autoscaling for one pool
    pub fn check_scaling(&self, agent_type: &str) -> Result<ScalingDecision> {
        self.inner.ensure_running()?;
        self.inner.check_scaling(agent_type)
    }

    /// Retire an agent and wait for its worker to stop
    ///
    /// A job the agent was running fails with [`EngineError::WorkerFault`].
    pub async fn remove_agent(&self, agent_id: &str) -> Result<()> {
        let link = self.inner.remove_agent(agent_id)?;
        ManagerInner::await_exit(agent_id.to_string(), link, self.inner.config.shutdown_grace_period()).await;
        Ok(())
    }

    /// Replace every agent that stopped heartbeating or whose worker exited
    pub async fn perform_health_checks(&self) -> HealthReport {
        self.inner.perform_health_checks().await
    }

    pub fn get_status(&self) -> ManagerStatus {
        self.inner.status()
    }

    pub fn total_agents(&self) -> usize {
        self.inner.total_agents.load(Ordering::SeqCst)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::SeqCst)
    }

    /// Stop timers, cancel queued jobs and terminate every worker
    ///
    /// Returns once all workers have exited or been aborted.
    pub async fn shutdown(&self) -> Result<ShutdownReport> {
        self.inner.shutdown().await
    }
}

impl ManagerInner {
    fn ensure_running(&self) -> Result<()> {
        if self.shutting_down.load(Ordering::SeqCst) {
            Err(EngineError::ShuttingDown)
        } else {
            Ok(())
        }
    }

    fn pool(&self, agent_type: &str) -> Result<Arc<Mutex<Pool>>> {
        self.pools
            .get(agent_type)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| EngineError::NoSuchPool(agent_type.to_string()))
    }

    pub(crate) fn pool_handles(&self) -> Vec<Arc<Mutex<Pool>>> {
        self.pools.iter().map(|entry| Arc::clone(entry.value())).collect()
    }

    fn create_pool(&self, agent_type: &str, size: usize, cap: usize) -> Result<()> {
        if !self.registry.contains(agent_type) {
            return Err(EngineError::Configuration(format!(
                "no handler registered for agent type '{}'",
                agent_type
            )));
        }

        match self.pools.entry(agent_type.to_string()) {
            Entry::Occupied(_) => Err(EngineError::Configuration(format!(
                "pool '{}' already exists",
                agent_type
            ))),
            Entry::Vacant(slot) => {
                let mut pool = Pool::new(agent_type, cap);
                for _ in 0..size {
                    if let Err(e) = self.create_agent(&mut pool) {
                        for agent in pool.drain_agents() {
                            self.forget_agent(&agent.id);
                            agent.into_worker().0.into_task().abort();
                        }
                        return Err(e);
                    }
                }
                info!("Created pool '{}' with {} agents (cap {})", agent_type, size, pool.max_concurrency());
                slot.insert(Arc::new(Mutex::new(pool)));
                Ok(())
            }
        }
    }

    /// Reserve a global slot, then spawn and register an agent
    fn create_agent(&self, pool: &mut Pool) -> Result<String> {
        if !self.try_reserve_slot() {
            return Err(EngineError::Capacity(format!(
                "pool '{}' cannot grow past max_agents ({})",
                pool.agent_type(),
                self.config.max_agents
            )));
        }
        self.spawn_agent(pool).map_err(|e| {
            self.total_agents.fetch_sub(1, Ordering::SeqCst);
            e
        })
    }

    fn spawn_agent(&self, pool: &mut Pool) -> Result<String> {
        let agent_type = pool.agent_type().to_string();
        let handler = self.registry.instantiate(&agent_type)?;
        let agent_id = format!("agent_{}", Ulid::new());

        let link = spawn_worker(
            WorkerSpec {
                agent_id: agent_id.clone(),
                agent_type: agent_type.clone(),
                handler,
                heartbeat_interval: self.config.health_check_interval(),
            },
            self.events.clone(),
        )?;

        pool.insert_agent(AgentHandle::new(agent_id.clone(), agent_type.clone(), link));
        self.agent_index.insert(agent_id.clone(), agent_type);
        debug!("Agent {} joined pool '{}'", agent_id, pool.agent_type());
        Ok(agent_id)
    }

    fn try_reserve_slot(&self) -> bool {
        self.total_agents
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < self.config.max_agents).then_some(n + 1)
            })
            .is_ok()
    }

    fn forget_agent(&self, agent_id: &str) {
        if self.agent_index.remove(agent_id).is_some() {
            let _ = self
                .total_agents
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        }
    }

    fn route_job(self: &Arc<Self>, request: JobRequest) -> Result<Submission> {
        self.ensure_running()?;
        let pool_handle = self.pool(&request.agent_type)?;
        self.registry.ensure_supported(&request.agent_type, &request.action)?;

        let job = Job::from_request(request, self.config.default_job_timeout());
        let job_id = job.id.clone();
        let agent_type = job.agent_type.clone();
        let (responder, handle) = JobHandle::channel(&job_id);

        let submission = {
            let mut pool = pool_handle.lock();
            match pool.find_available_agent() {
                Some(agent_id) => {
                    trace!("Dispatching job {} to agent {}", job_id, agent_id);
                    self.execute_job(&mut pool, &agent_id, job, responder);
                    Submission::Dispatched {
                        job_id,
                        agent_id,
                        handle,
                    }
                }
                None => {
                    if let Some(limit) = self.config.max_queue_length {
                        if pool.queue_len() >= limit {
                            return Err(EngineError::QueueFull { agent_type, limit });
                        }
                    }
                    let queue_position = pool.enqueue(QueuedJob { job, responder });
                    let estimated_wait = pool.estimated_wait(queue_position);
                    debug!(
                        "No idle agent in '{}', job {} queued at position {}",
                        agent_type, job_id, queue_position
                    );
                    Submission::Queued {
                        job_id,
                        queue_position,
                        estimated_wait,
                        handle,
                    }
                }
            }
        };

        observability::record_submission(&agent_type, submission.is_queued());
        if submission.is_queued() {
            if let Err(e) = self.check_scaling(&agent_type) {
                warn!("Scaling check for '{}' failed: {}", agent_type, e);
            }
        }
        Ok(submission)
    }

    /// Bind `job` to an idle agent, send it to the worker and arm its timeout
    fn execute_job(self: &Arc<Self>, pool: &mut Pool, agent_id: &str, job: Job, responder: Responder) {
        let envelope = job.envelope();
        let timeout_guard = self.arm_timeout(pool.agent_type(), agent_id, &job.id, job.timeout);
        let pending = PendingCompletion {
            responder,
            timeout_guard,
            dispatched_at: Instant::now(),
        };

        if let Err((job, pending)) = pool.bind_job(agent_id, job, pending) {
            warn!("Agent {} could not take job {}, requeueing", agent_id, job.id);
            let responder = pending.disarm();
            pool.requeue_front(QueuedJob { job, responder });
            return;
        }

        let sent = pool
            .agent(agent_id)
            .map(|agent| agent.send(ManagerMessage::Execute { job: envelope }));
        if let Some(Err(e)) = sent {
            warn!("Dispatch to agent {} failed: {}", agent_id, e);
            self.replace_agent(pool, agent_id, "worker unreachable at dispatch");
        }
    }

    fn arm_timeout(self: &Arc<Self>, agent_type: &str, agent_id: &str, job_id: &str, timeout: Duration) -> AbortHandle {
        let manager = Arc::downgrade(self);
        let agent_type = agent_type.to_string();
        let agent_id = agent_id.to_string();
        let job_id = job_id.to_string();

        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(inner) = manager.upgrade() {
                inner.handle_timeout(&agent_type, &agent_id, &job_id, timeout);
            }
        })
        .abort_handle()
    }

    fn handle_timeout(self: &Arc<Self>, agent_type: &str, agent_id: &str, job_id: &str, timeout: Duration) {
        let Ok(pool_handle) = self.pool(agent_type) else { return };
        let mut pool = pool_handle.lock();

        // no correlation: the job finished first
        let Some((job, pending)) = pool.release_job(agent_id, job_id) else { return };

        warn!("Job {} timed out after {:?} on agent {}", job.id, timeout, agent_id);
        pool.record_timeout(pending.dispatched_at.elapsed());
        if let Some(agent) = pool.agent_mut(agent_id) {
            // the worker is still busy with it; keep new jobs away until it reports
            agent.errors += 1;
            agent.orphan(job.id.clone());
        }
        observability::record_job_outcome(agent_type, JobOutcome::TimedOut, None);

        // this task is the guard, nothing to disarm
        let _ = pending.responder.send(Err(EngineError::Timeout {
            job_id: job.id,
            timeout,
        }));
        self.process_queue(&mut pool);
    }

    /// Route one worker message
    pub(crate) fn handle_worker_message(self: &Arc<Self>, event: WorkerEvent) {
        let WorkerEvent { agent_id, message } = event;

        let Some(agent_type) = self.agent_index.get(&agent_id).map(|e| e.value().clone()) else {
            trace!("Ignoring message from retired agent {}", agent_id);
            return;
        };
        let Ok(pool_handle) = self.pool(&agent_type) else { return };
        let mut pool = pool_handle.lock();

        // any message is a sign of life
        if let Some(agent) = pool.agent_mut(&agent_id) {
            agent.record_heartbeat();
        }

        match message {
            WorkerMessage::WorkerReady { .. } => {
                debug!("Agent {} ready", agent_id);
            }
            WorkerMessage::HealthCheck { status, metrics } => {
                trace!("Heartbeat from {}: {:?} {:?}", agent_id, status, metrics);
            }
            WorkerMessage::JobComplete {
                job_id,
                result,
                execution_time_ms,
            } => {
                self.finish_job(&mut pool, &agent_id, &job_id, Ok(result), execution_time_ms);
            }
            WorkerMessage::JobError {
                job_id,
                error,
                execution_time_ms,
            } => {
                self.finish_job(&mut pool, &agent_id, &job_id, Err(error), execution_time_ms);
            }
            WorkerMessage::JobCancelled { job_id, reason } => {
                if let Some((job, pending)) = pool.release_job(&agent_id, &job_id) {
                    observability::record_job_outcome(&agent_type, JobOutcome::Cancelled, None);
                    let _ = pending.disarm().send(Err(EngineError::Cancelled {
                        job_id: job.id,
                        reason,
                    }));
                } else if let Some(agent) = pool.agent_mut(&agent_id) {
                    agent.settle_orphan(&job_id);
                }
            }
            WorkerMessage::WorkerError { error } => {
                error!("Agent {} reported a fault: {}", agent_id, error);
                self.replace_agent(&mut pool, &agent_id, &error);
            }
            WorkerMessage::WorkerShutdown => {
                warn!("Agent {} exited unexpectedly", agent_id);
                self.replace_agent(&mut pool, &agent_id, "worker exited unexpectedly");
            }
        }

        self.process_queue(&mut pool);
    }

    fn finish_job(
        &self,
        pool: &mut Pool,
        agent_id: &str,
        job_id: &str,
        outcome: std::result::Result<serde_json::Value, String>,
        execution_time_ms: u64,
    ) {
        let Some((job, pending)) = pool.release_job(agent_id, job_id) else {
            debug!("Ignoring late result for job {} from agent {}", job_id, agent_id);
            if let Some(agent) = pool.agent_mut(agent_id) {
                if agent.settle_orphan(job_id) {
                    debug!("Agent {} is available again", agent_id);
                }
            }
            return;
        };

        let response = pending.dispatched_at.elapsed();
        let execution_time = Duration::from_millis(execution_time_ms);
        let responder = pending.disarm();
        let success = outcome.is_ok();

        pool.record_outcome(response, success);
        if let Some(agent) = pool.agent_mut(agent_id) {
            if success {
                agent.jobs_done += 1;
            } else {
                agent.errors += 1;
            }
        }

        let reply = match outcome {
            Ok(result) => {
                observability::record_job_outcome(pool.agent_type(), JobOutcome::Completed, Some(execution_time));
                Ok(JobOutput {
                    job_id: job.id,
                    agent_id: agent_id.to_string(),
                    result,
                    execution_time,
                    completed_at: Instant::now(),
                })
            }
            Err(message) => {
                debug!("Job {} failed on agent {}: {}", job.id, agent_id, message);
                observability::record_job_outcome(pool.agent_type(), JobOutcome::Failed, Some(execution_time));
                Err(EngineError::Execution {
                    job_id: job.id,
                    message,
                })
            }
        };
        let _ = responder.send(reply);
    }

    /// Dispatch queued jobs while idle agents remain
    fn process_queue(self: &Arc<Self>, pool: &mut Pool) {
        while pool.queue_len() > 0 {
            let Some(agent_id) = pool.find_available_agent() else { break };
            let Some(queued) = pool.dequeue() else { break };
            trace!("Dispatching queued job {} to agent {}", queued.job.id, agent_id);
            self.execute_job(pool, &agent_id, queued.job, queued.responder);
        }
    }

    /// Take an agent out of service
    ///
    /// A bound job fails with `WorkerFault`; the worker is told to shut down
    /// and its link is returned for the caller to await or reap.
    fn retire_agent(&self, pool: &mut Pool, agent_id: &str, reason: &str) -> Option<WorkerLink> {
        let agent = pool.remove_agent(agent_id)?;
        self.forget_agent(agent_id);

        let (link, bound) = agent.into_worker();
        if let Some((job, pending)) = bound {
            warn!("Job {} lost its agent {}: {}", job.id, agent_id, reason);
            pool.record_outcome(pending.dispatched_at.elapsed(), false);
            observability::record_job_outcome(pool.agent_type(), JobOutcome::Faulted, None);
            let _ = pending.disarm().send(Err(EngineError::WorkerFault {
                agent_id: agent_id.to_string(),
                reason: reason.to_string(),
            }));
        }

        let _ = link.send(agent_id, ManagerMessage::Shutdown);
        Some(link)
    }

    /// Retire a faulty agent and put a fresh one of the same type in its place
    fn replace_agent(self: &Arc<Self>, pool: &mut Pool, agent_id: &str, reason: &str) -> Option<String> {
        let link = self.retire_agent(pool, agent_id, reason)?;
        self.reap(agent_id.to_string(), link);

        if self.shutting_down.load(Ordering::SeqCst) {
            return None;
        }

        match self.create_agent(pool) {
            Ok(replacement) => {
                info!("Replaced agent {} with {} in pool '{}'", agent_id, replacement, pool.agent_type());
                observability::record_replacement(pool.agent_type());
                Some(replacement)
            }
            Err(e) => {
                error!("Could not replace agent {}: {}", agent_id, e);
                None
            }
        }
    }

    fn remove_agent(self: &Arc<Self>, agent_id: &str) -> Result<WorkerLink> {
        self.ensure_running()?;
        let agent_type = self
            .agent_index
            .get(agent_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| EngineError::Configuration(format!("unknown agent '{}'", agent_id)))?;
        let pool_handle = self.pool(&agent_type)?;
        let mut pool = pool_handle.lock();

        let link = self
            .retire_agent(&mut pool, agent_id, "agent removed")
            .ok_or_else(|| EngineError::Configuration(format!("unknown agent '{}'", agent_id)))?;
        info!("Removed agent {} from pool '{}'", agent_id, agent_type);
        self.process_queue(&mut pool);
        Ok(link)
    }

    /// Await a worker's exit in the background
    fn reap(&self, agent_id: String, link: WorkerLink) {
        let grace = self.config.shutdown_grace_period();
        self.tracker.spawn(Self::await_exit(agent_id, link, grace));
    }

    /// Wait for a worker to exit, aborting it after `grace`. `true` if aborted.
    async fn await_exit(agent_id: String, link: WorkerLink, grace: Duration) -> bool {
        let mut task = link.into_task();
        match tokio::time::timeout(grace, &mut task).await {
            Ok(_) => false,
            Err(_) => {
                warn!("Worker {} did not stop within {:?}, aborting", agent_id, grace);
                task.abort();
                let _ = task.await;
                true
            }
        }
    }

    pub(crate) fn check_scaling(self: &Arc<Self>, agent_type: &str) -> Result<ScalingDecision> {
        let pool_handle = self.pool(agent_type)?;
        let mut retired = Vec::new();
        let decision = {
            let mut pool = pool_handle.lock();
            self.apply_scaling(&mut pool, &mut retired)
        };
        for (agent_id, link) in retired {
            self.reap(agent_id, link);
        }
        Ok(decision)
    }

    fn apply_scaling(self: &Arc<Self>, pool: &mut Pool, retired: &mut Vec<(String, WorkerLink)>) -> ScalingDecision {
        let load = pool.load();
        let utilization = pool.utilization();
        let decision = self
            .policy
            .evaluate(&load, self.total_agents.load(Ordering::SeqCst));

        let applied = match decision {
            ScalingDecision::ScaleUp(wanted) => match self.scale_up(pool, wanted) {
                0 => ScalingDecision::Hold(HoldReason::AtCapacity),
                added => ScalingDecision::ScaleUp(added),
            },
            ScalingDecision::ScaleDown(wanted) => match self.scale_down(pool, wanted, retired) {
                0 => ScalingDecision::Hold(HoldReason::NoIdleAgents),
                removed => ScalingDecision::ScaleDown(removed),
            },
            hold => hold,
        };

        let (direction, delta) = match applied {
            ScalingDecision::ScaleUp(n) => (ScaleDirection::Up, n),
            ScalingDecision::ScaleDown(n) => (ScaleDirection::Down, n),
            ScalingDecision::Hold(reason) => {
                trace!("Pool '{}' holds at {:.0}% utilization: {:?}", pool.agent_type(), utilization, reason);
                return applied;
            }
        };

        info!(
            "Scaled pool '{}' {} by {} agent(s) at {:.0}% utilization, now {}",
            pool.agent_type(),
            direction.as_str(),
            delta,
            utilization,
            pool.agent_count()
        );
        observability::record_scaling(pool.agent_type(), direction, delta);
        pool.mark_scaled(ScalingRecord {
            direction,
            delta,
            agents_after: pool.agent_count(),
            utilization,
            at: Utc::now(),
        });

        if direction == ScaleDirection::Up {
            self.process_queue(pool);
        }
        applied
    }

    fn scale_up(&self, pool: &mut Pool, wanted: usize) -> usize {
        let mut added = 0;
        for _ in 0..wanted {
            if let Err(e) = self.create_agent(pool) {
                debug!("Scale-up of '{}' stopped: {}", pool.agent_type(), e);
                break;
            }
            added += 1;
        }
        added
    }

    fn scale_down(&self, pool: &mut Pool, wanted: usize, retired: &mut Vec<(String, WorkerLink)>) -> usize {
        let removable = wanted.min(pool.agent_count().saturating_sub(1));
        let candidates = pool.idle_agents_past(self.config.idle_grace_period());

        let mut removed = 0;
        for agent_id in candidates.into_iter().take(removable) {
            if let Some(link) = self.retire_agent(pool, &agent_id, "scaled down") {
                retired.push((agent_id, link));
                removed += 1;
            }
        }
        removed
    }

    pub(crate) async fn perform_health_checks(self: &Arc<Self>) -> HealthReport {
        let deadline = self.config.heartbeat_deadline();
        let mut report = HealthReport::default();

        for pool_handle in self.pool_handles() {
            {
                let mut pool = pool_handle.lock();
                report.agents_checked += pool.agent_count();

                for agent_id in pool.unresponsive_agents(deadline) {
                    warn!("Agent {} missed heartbeats for {:?}, replacing", agent_id, deadline);
                    if let Some(replacement) = self.replace_agent(&mut pool, &agent_id, "missed heartbeats") {
                        report.replaced.push(Replacement {
                            agent_type: pool.agent_type().to_string(),
                            retired: agent_id,
                            replacement,
                        });
                    }
                }

                for agent_id in pool.agent_ids() {
                    if let Some(agent) = pool.agent(&agent_id) {
                        let _ = agent.send(ManagerMessage::HealthCheck);
                    }
                }
                self.process_queue(&mut pool);
            }
            // completions waiting on this thread go first
            tokio::task::yield_now().await;
        }

        report
    }

    pub(crate) async fn evaluate_scaling(self: &Arc<Self>) {
        let agent_types: Vec<String> = self.pools.iter().map(|e| e.key().clone()).collect();
        for agent_type in agent_types {
            if self.shutting_down.load(Ordering::SeqCst) {
                return;
            }
            if let Err(e) = self.check_scaling(&agent_type) {
                debug!("Scaling check for '{}' skipped: {}", agent_type, e);
            }
            tokio::task::yield_now().await;
        }
    }

    pub(crate) fn status(&self) -> ManagerStatus {
        let mut pools: Vec<PoolStatus> = self
            .pool_handles()
            .iter()
            .map(|pool| pool.lock().status())
            .collect();
        pools.sort_by(|a, b| a.agent_type.cmp(&b.agent_type));

        let total_agents = self.total_agents.load(Ordering::SeqCst);
        ManagerStatus {
            total_agents,
            total_pools: pools.len(),
            pools,
            scaling_state: ScalingState {
                max_agents: self.config.max_agents,
                total_agents,
                remaining_capacity: self.config.max_agents.saturating_sub(total_agents),
                scale_up_threshold: self.config.scale_up_threshold,
                scale_down_threshold: self.config.scale_down_threshold,
                cooldown_ms: self.config.cooldown_period_ms,
            },
        }
    }

    pub(crate) fn publish_metrics(&self) {
        let status = self.status();
        for pool in &status.pools {
            observability::publish_pool_gauges(pool);
        }
        debug!(
            "Pool manager: {} agents across {} pools, {} queued",
            status.total_agents,
            status.total_pools,
            status.pools.iter().map(|p| p.queue_length).sum::<usize>()
        );
    }

    pub(crate) fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub(crate) fn tracker(&self) -> &TaskTracker {
        &self.tracker
    }

    pub(crate) fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Kill every worker without ceremony; used when startup fails
    fn abort_all(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        self.cancel.cancel();
        for pool_handle in self.pool_handles() {
            for agent in pool_handle.lock().drain_agents() {
                self.forget_agent(&agent.id);
                agent.into_worker().0.into_task().abort();
            }
        }
        self.pools.clear();
    }

    async fn shutdown(self: &Arc<Self>) -> Result<ShutdownReport> {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return Err(EngineError::ShuttingDown);
        }
        info!("Shutting down pool manager");
        self.cancel.cancel();

        let mut report = ShutdownReport::default();
        let mut links = Vec::new();

        for pool_handle in self.pool_handles() {
            let mut pool = pool_handle.lock();

            for queued in pool.drain_queue() {
                observability::record_job_outcome(pool.agent_type(), JobOutcome::Cancelled, None);
                queued.cancel("manager shutdown");
                report.cancelled_jobs += 1;
            }

            for agent in pool.drain_agents() {
                let agent_id = agent.id.clone();
                self.forget_agent(&agent_id);

                let (link, bound) = agent.into_worker();
                if let Some((job, pending)) = bound {
                    observability::record_job_outcome(pool.agent_type(), JobOutcome::Cancelled, None);
                    let _ = pending.disarm().send(Err(EngineError::Cancelled {
                        job_id: job.id,
                        reason: "worker terminated by shutdown".to_string(),
                    }));
                    report.interrupted_jobs += 1;
                }
                let _ = link.send(&agent_id, ManagerMessage::Shutdown);
                links.push((agent_id, link));
            }
        }

        let grace = self.config.shutdown_grace_period();
        let exits = join_all(
            links
                .into_iter()
                .map(|(agent_id, link)| Self::await_exit(agent_id, link, grace)),
        )
        .await;
        report.terminated_workers = exits.len();
        report.forced_terminations = exits.iter().filter(|forced| **forced).count();

        self.tracker.close();
        self.tracker.wait().await;
        self.pools.clear();
        self.agent_index.clear();
        self.total_agents.store(0, Ordering::SeqCst);

        info!(
            "Pool manager stopped: {} queued jobs cancelled, {} in-flight interrupted, {} workers terminated ({} forced)",
            report.cancelled_jobs, report.interrupted_jobs, report.terminated_workers, report.forced_terminations
        );
        Ok(report)
    }
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        // stops the background loops; workers exit once their links drop
        self.cancel.cancel();
    }
}

/// Weak handle used by background tasks so they never keep the manager alive
pub(crate) type ManagerRef = Weak<ManagerInner>;
