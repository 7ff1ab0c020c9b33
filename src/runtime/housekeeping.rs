// src/runtime/housekeeping.rs
//! Background loops owned by the pool manager
//!
//! - **dispatcher**: drains the shared worker event channel
//! - **housekeeping**: periodic health checks, scaling evaluation and
//!   metrics publication
//!
//! Both run on the manager's `TaskTracker`, stop when its cancellation
//! token fires and only hold a weak reference between iterations.

use crate::runtime::manager::{ManagerInner, ManagerRef};
use crate::runtime::worker::WorkerEvent;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

pub(crate) fn start(inner: &Arc<ManagerInner>, events: mpsc::UnboundedReceiver<WorkerEvent>) {
    inner.tracker().spawn(dispatch(Arc::downgrade(inner), events));
    inner.tracker().spawn(housekeeping(Arc::downgrade(inner)));
}

async fn dispatch(manager: ManagerRef, mut events: mpsc::UnboundedReceiver<WorkerEvent>) {
    let Some(cancel) = manager.upgrade().map(|m| m.cancellation()) else { return };

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => break,

            event = events.recv() => {
                let Some(event) = event else { break };
                let Some(inner) = manager.upgrade() else { break };
                inner.handle_worker_message(event);
            }
        }
    }

    debug!("Worker event dispatcher stopped");
}

async fn housekeeping(manager: ManagerRef) {
    let Some((cancel, health_period, metrics_period)) = manager.upgrade().map(|m| {
        (
            m.cancellation(),
            m.config().health_check_interval(),
            m.config().metrics_interval(),
        )
    }) else {
        return;
    };

    // first tick one period out, not immediately
    let mut health = interval_at(Instant::now() + health_period, health_period);
    health.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut metrics = interval_at(Instant::now() + metrics_period, metrics_period);
    metrics.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => break,

            _ = health.tick() => {
                let Some(inner) = manager.upgrade() else { break };
                let report = inner.perform_health_checks().await;
                if !report.replaced.is_empty() {
                    warn!(
                        "Health check replaced {} of {} agents",
                        report.replaced.len(),
                        report.agents_checked
                    );
                }
            }

            _ = metrics.tick() => {
                let Some(inner) = manager.upgrade() else { break };
                inner.evaluate_scaling().await;
                inner.publish_metrics();
            }
        }
    }

    info!("Pool manager housekeeping stopped");
}
