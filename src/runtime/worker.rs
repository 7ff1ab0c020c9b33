// src/runtime/worker.rs
//! Worker execution context
//!
//! Every agent owns one worker: an independent tokio task hosting a single
//! [`TaskHandler`]. The manager and the worker share nothing but two
//! channels:
//!
//! ```text
//! PoolManager ── ManagerMessage ──▶ Worker ── spawn_blocking ──▶ TaskHandler
//!      ▲                              │
//!      └──────── WorkerEvent ─────────┘   (one channel shared by all workers)
//! ```
//!
//! Handler code runs on the blocking pool so long or CPU-bound actions never
//! stall heartbeats or the manager. A job that arrives while another is
//! running waits in the worker's backlog.

use crate::runtime::handler::{HandlerError, TaskHandler};
use crate::runtime::job::JobEnvelope;
use crate::utils::errors::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, trace, warn};

/// Manager → worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ManagerMessage {
    Execute { job: JobEnvelope },
    Shutdown,
    /// Ask for an immediate heartbeat
    HealthCheck,
}

/// Worker → manager
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    WorkerReady {
        agent_id: String,
        agent_type: String,
    },
    JobComplete {
        job_id: String,
        result: serde_json::Value,
        execution_time_ms: u64,
    },
    JobError {
        job_id: String,
        error: String,
        execution_time_ms: u64,
    },
    HealthCheck {
        status: WorkerStatus,
        metrics: WorkerMetrics,
    },
    WorkerError {
        error: String,
    },
    WorkerShutdown,
    JobCancelled {
        job_id: String,
        reason: String,
    },
}

/// A worker message tagged with its sender
#[derive(Debug, Clone)]
pub struct WorkerEvent {
    pub agent_id: String,
    pub message: WorkerMessage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Idle,
    Busy,
}

/// Counters reported with every heartbeat
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerMetrics {
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub backlog: usize,
    pub uptime_ms: u64,
}

/// The manager's end of a worker
#[derive(Debug)]
pub struct WorkerLink {
    sender: mpsc::UnboundedSender<ManagerMessage>,
    task: JoinHandle<()>,
}

impl WorkerLink {
    /// Send without waiting; fails once the worker has exited
    pub fn send(&self, agent_id: &str, message: ManagerMessage) -> Result<()> {
        self.sender.send(message).map_err(|_| EngineError::WorkerFault {
            agent_id: agent_id.to_string(),
            reason: "worker channel closed".to_string(),
        })
    }

    /// Whether the worker task is gone (clean exit or crash)
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub fn into_task(self) -> JoinHandle<()> {
        self.task
    }

    #[cfg(test)]
    pub(crate) fn abort(&self) {
        self.task.abort();
    }
}

/// Spawn settings for a worker
#[derive(Clone)]
pub struct WorkerSpec {
    pub agent_id: String,
    pub agent_type: String,
    pub handler: Arc<dyn TaskHandler>,
    pub heartbeat_interval: Duration,
}

/// Start a worker on the current tokio runtime
pub fn spawn_worker(spec: WorkerSpec, outbox: mpsc::UnboundedSender<WorkerEvent>) -> Result<WorkerLink> {
    let runtime = tokio::runtime::Handle::try_current()
        .map_err(|e| EngineError::Spawn(format!("no tokio runtime for {}: {}", spec.agent_id, e)))?;

    let (sender, inbox) = mpsc::unbounded_channel();
    debug!("Spawning {} worker {}", spec.agent_type, spec.agent_id);

    let worker = Worker {
        agent_id: spec.agent_id,
        agent_type: spec.agent_type,
        handler: spec.handler,
        heartbeat_interval: spec.heartbeat_interval,
        outbox,
        metrics: WorkerMetrics::default(),
        started_at: Instant::now(),
    };
    let task = runtime.spawn(worker.run(inbox));

    Ok(WorkerLink { sender, task })
}

struct RunningJob {
    job_id: String,
    started: Instant,
    task: JoinHandle<std::result::Result<serde_json::Value, HandlerError>>,
}

type JoinOutcome = std::result::Result<
    std::result::Result<serde_json::Value, HandlerError>,
    tokio::task::JoinError,
>;

struct Worker {
    agent_id: String,
    agent_type: String,
    handler: Arc<dyn TaskHandler>,
    heartbeat_interval: Duration,
    outbox: mpsc::UnboundedSender<WorkerEvent>,
    metrics: WorkerMetrics,
    started_at: Instant,
}

impl Worker {
    async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<ManagerMessage>) {
        let ready = WorkerMessage::WorkerReady {
            agent_id: self.agent_id.clone(),
            agent_type: self.agent_type.clone(),
        };
        if !self.emit(ready) {
            return;
        }

        let mut heartbeat = tokio::time::interval(self.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut backlog: VecDeque<JobEnvelope> = VecDeque::new();
        let mut running: Option<RunningJob> = None;

        loop {
            while running.is_none() {
                let Some(job) = backlog.pop_front() else { break };
                running = self.start(job);
            }
            self.metrics.backlog = backlog.len();

            tokio::select! {
                message = inbox.recv() => match message {
                    Some(ManagerMessage::Execute { job }) => {
                        trace!("Worker {} received job {}", self.agent_id, job.id);
                        backlog.push_back(job);
                    }
                    Some(ManagerMessage::HealthCheck) => {
                        if !self.heartbeat(running.is_some()) {
                            return;
                        }
                    }
                    Some(ManagerMessage::Shutdown) | None => {
                        self.shut_down(running.take(), backlog);
                        return;
                    }
                },

                _ = heartbeat.tick() => {
                    if !self.heartbeat(running.is_some()) {
                        return;
                    }
                }

                outcome = join_running(&mut running) => {
                    let Some(job) = running.take() else { continue };
                    if !self.finish(job, outcome) {
                        return;
                    }
                }
            }
        }
    }

    fn start(&self, job: JobEnvelope) -> Option<RunningJob> {
        let started = Instant::now();

        if !self.handler.supports(&job.action) {
            self.emit(WorkerMessage::JobError {
                job_id: job.id,
                error: HandlerError::UnsupportedAction(job.action).to_string(),
                execution_time_ms: 0,
            });
            return None;
        }

        let handler = Arc::clone(&self.handler);
        let JobEnvelope { id, action, payload } = job;
        let task = tokio::task::spawn_blocking(move || handler.execute(&action, payload));

        Some(RunningJob {
            job_id: id,
            started,
            task,
        })
    }

    /// Report a finished job; `false` means the worker must exit
    fn finish(&mut self, job: RunningJob, outcome: JoinOutcome) -> bool {
        let execution_time_ms = job.started.elapsed().as_millis() as u64;

        let message = match outcome {
            Ok(Ok(result)) => {
                self.metrics.jobs_completed += 1;
                WorkerMessage::JobComplete {
                    job_id: job.job_id,
                    result,
                    execution_time_ms,
                }
            }
            Ok(Err(e)) => {
                self.metrics.jobs_failed += 1;
                WorkerMessage::JobError {
                    job_id: job.job_id,
                    error: e.to_string(),
                    execution_time_ms,
                }
            }
            Err(e) if e.is_panic() => {
                let reason = panic_message(e.into_panic());
                error!(
                    "Worker {} crashed while running job {}: {}",
                    self.agent_id, job.job_id, reason
                );
                self.emit(WorkerMessage::WorkerError {
                    error: format!("handler panicked: {}", reason),
                });
                return false;
            }
            Err(e) => {
                self.metrics.jobs_failed += 1;
                WorkerMessage::JobError {
                    job_id: job.job_id,
                    error: format!("execution aborted: {}", e),
                    execution_time_ms,
                }
            }
        };

        self.emit(message)
    }

    fn heartbeat(&mut self, busy: bool) -> bool {
        self.metrics.uptime_ms = self.started_at.elapsed().as_millis() as u64;
        let status = if busy { WorkerStatus::Busy } else { WorkerStatus::Idle };
        self.emit(WorkerMessage::HealthCheck {
            status,
            metrics: self.metrics.clone(),
        })
    }

    fn shut_down(&self, running: Option<RunningJob>, backlog: VecDeque<JobEnvelope>) {
        debug!("Worker {} shutting down", self.agent_id);

        // the blocking task keeps running until the handler returns; its
        // result is simply never reported
        let pending = running
            .map(|job| job.job_id)
            .into_iter()
            .chain(backlog.into_iter().map(|job| job.id));

        for job_id in pending {
            self.emit(WorkerMessage::JobCancelled {
                job_id,
                reason: "worker shutting down".to_string(),
            });
        }

        self.emit(WorkerMessage::WorkerShutdown);
    }

    fn emit(&self, message: WorkerMessage) -> bool {
        let event = WorkerEvent {
            agent_id: self.agent_id.clone(),
            message,
        };
        if self.outbox.send(event).is_err() {
            warn!("Worker {} lost its manager, exiting", self.agent_id);
            return false;
        }
        true
    }
}

async fn join_running(running: &mut Option<RunningJob>) -> JoinOutcome {
    match running {
        Some(job) => (&mut job.task).await,
        None => std::future::pending().await,
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// A link to a worker that never answers, for bookkeeping tests
#[cfg(test)]
pub(crate) fn silent_link() -> (WorkerLink, mpsc::UnboundedReceiver<ManagerMessage>) {
    let (sender, inbox) = mpsc::unbounded_channel();
    let task = tokio::spawn(std::future::pending::<()>());
    (WorkerLink { sender, task }, inbox)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::handler::SimulatedHandler;
    use serde_json::json;

    fn spawn_test_worker(heartbeat: Duration) -> (WorkerLink, mpsc::UnboundedReceiver<WorkerEvent>) {
        let (outbox, events) = mpsc::unbounded_channel();
        let spec = WorkerSpec {
            agent_id: "agent_test".to_string(),
            agent_type: "requirements-analyzer".to_string(),
            handler: Arc::new(SimulatedHandler::default()),
            heartbeat_interval: heartbeat,
        };
        (spawn_worker(spec, outbox).unwrap(), events)
    }

    /// Next event that isn't a heartbeat
    async fn next_event(events: &mut mpsc::UnboundedReceiver<WorkerEvent>) -> WorkerMessage {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
                .await
                .expect("worker went quiet")
                .expect("worker channel closed");
            if !matches!(event.message, WorkerMessage::HealthCheck { .. }) {
                return event.message;
            }
        }
    }

    fn execute(id: &str, action: &str, payload: serde_json::Value) -> ManagerMessage {
        ManagerMessage::Execute {
            job: JobEnvelope {
                id: id.to_string(),
                action: action.to_string(),
                payload,
            },
        }
    }

    #[test]
    fn test_message_wire_format() {
        let value = serde_json::to_value(WorkerMessage::JobCancelled {
            job_id: "job_1".to_string(),
            reason: "shutdown".to_string(),
        })
        .unwrap();
        assert_eq!(value["type"], "job_cancelled");
        assert_eq!(value["job_id"], "job_1");

        let parsed: ManagerMessage = serde_json::from_value(json!({"type": "shutdown"})).unwrap();
        assert_eq!(parsed, ManagerMessage::Shutdown);
    }

    #[test]
    fn test_spawn_outside_runtime_fails() {
        let (outbox, _events) = mpsc::unbounded_channel();
        let spec = WorkerSpec {
            agent_id: "agent_test".to_string(),
            agent_type: "requirements-analyzer".to_string(),
            handler: Arc::new(SimulatedHandler::default()),
            heartbeat_interval: Duration::from_secs(1),
        };
        assert!(matches!(spawn_worker(spec, outbox), Err(EngineError::Spawn(_))));
    }

    #[tokio::test]
    async fn test_ready_then_complete() {
        let (link, mut events) = spawn_test_worker(Duration::from_secs(30));
        assert!(matches!(next_event(&mut events).await, WorkerMessage::WorkerReady { .. }));

        link.send("agent_test", execute("job_1", "echo", json!({"n": 7})))
            .unwrap();

        match next_event(&mut events).await {
            WorkerMessage::JobComplete { job_id, result, .. } => {
                assert_eq!(job_id, "job_1");
                assert_eq!(result["echo"]["n"], 7);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_handler_failure_and_unknown_action() {
        let (link, mut events) = spawn_test_worker(Duration::from_secs(30));
        next_event(&mut events).await;

        link.send("agent_test", execute("job_1", "analyze", json!({"fail": true})))
            .unwrap();
        assert!(matches!(
            next_event(&mut events).await,
            WorkerMessage::JobError { job_id, .. } if job_id == "job_1"
        ));

        link.send("agent_test", execute("job_2", "deploy", json!({})))
            .unwrap();
        assert!(matches!(
            next_event(&mut events).await,
            WorkerMessage::JobError { error, .. } if error.contains("deploy")
        ));
    }

    #[tokio::test]
    async fn test_heartbeats_continue_during_long_job() {
        let (link, mut events) = spawn_test_worker(Duration::from_millis(20));
        link.send("agent_test", execute("job_1", "analyze", json!({"duration_ms": 200})))
            .unwrap();

        let mut busy_beats = 0;
        loop {
            let event = events.recv().await.unwrap();
            match event.message {
                WorkerMessage::HealthCheck { status: WorkerStatus::Busy, .. } => busy_beats += 1,
                WorkerMessage::JobComplete { .. } => break,
                _ => {}
            }
        }
        assert!(busy_beats >= 2, "only {} heartbeats while busy", busy_beats);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_running_and_backlog() {
        let (link, mut events) = spawn_test_worker(Duration::from_secs(30));
        next_event(&mut events).await;

        link.send("agent_test", execute("job_1", "analyze", json!({"duration_ms": 300})))
            .unwrap();
        link.send("agent_test", execute("job_2", "analyze", json!({})))
            .unwrap();
        link.send("agent_test", ManagerMessage::Shutdown).unwrap();

        let mut cancelled = Vec::new();
        loop {
            match next_event(&mut events).await {
                WorkerMessage::JobCancelled { job_id, .. } => cancelled.push(job_id),
                WorkerMessage::WorkerShutdown => break,
                other => panic!("unexpected message: {:?}", other),
            }
        }
        assert_eq!(cancelled, vec!["job_1", "job_2"]);

        link.into_task().await.unwrap();
    }

    #[tokio::test]
    async fn test_handler_panic_crashes_worker() {
        let (link, mut events) = spawn_test_worker(Duration::from_secs(30));
        next_event(&mut events).await;

        link.send("agent_test", execute("job_1", "analyze", json!({"panic": true})))
            .unwrap();
        assert!(matches!(
            next_event(&mut events).await,
            WorkerMessage::WorkerError { error } if error.contains("simulated handler crash")
        ));

        link.into_task().await.unwrap();
    }
}
