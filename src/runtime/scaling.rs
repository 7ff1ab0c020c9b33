// src/runtime/scaling.rs
//! Autoscaling decisions
//!
//! The controller is a pure function of a pool's load, the global agent
//! count and the time since the pool's last scaling action. The manager
//! applies the decision under the pool lock.
//!
//! ```text
//! utilization = active_jobs / agents * 100
//!
//!   > scale_up_threshold    ──▶ ScaleUp(min(step, global room, pool room))
//!   < scale_down_threshold  ──▶ ScaleDown(min(step, agents - 1))
//!   otherwise               ──▶ Hold
//! ```
//!
//! Both directions wait out the cooldown, so a pool sees at most one
//! scaling action per cooldown window.

use crate::utils::config::RuntimeConfig;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;

/// Active jobs over agents, in percent
pub fn utilization(active_jobs: usize, agents: usize) -> f64 {
    if agents == 0 {
        return 0.0;
    }
    active_jobs as f64 / agents as f64 * 100.0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScaleDirection {
    Up,
    Down,
}

impl ScaleDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScaleDirection::Up => "up",
            ScaleDirection::Down => "down",
        }
    }
}

/// Why no scaling happened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HoldReason {
    WithinThresholds,
    CoolingDown,
    /// Global `max_agents` or the pool's concurrency cap reached
    AtCapacity,
    /// Pool is already down to one agent
    AtMinimum,
    /// Nothing idle long enough to remove
    NoIdleAgents,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScalingDecision {
    ScaleUp(usize),
    ScaleDown(usize),
    Hold(HoldReason),
}

impl ScalingDecision {
    pub fn is_hold(&self) -> bool {
        matches!(self, ScalingDecision::Hold(_))
    }
}

/// A scaling action that was applied to a pool
#[derive(Debug, Clone, Serialize)]
pub struct ScalingRecord {
    pub direction: ScaleDirection,
    pub delta: usize,
    pub agents_after: usize,
    pub utilization: f64,
    pub at: DateTime<Utc>,
}

/// Inputs for one pool's evaluation
#[derive(Debug, Clone, Copy)]
pub struct PoolLoad {
    pub active_jobs: usize,
    pub agents: usize,
    pub max_concurrency: usize,
    /// `None` if the pool never scaled
    pub since_last_scaling: Option<Duration>,
}

/// Thresholds and limits driving the control loop
#[derive(Debug, Clone)]
pub struct ScalingPolicy {
    pub scale_up_threshold: f64,
    pub scale_down_threshold: f64,
    pub scale_up_step: usize,
    pub scale_down_step: usize,
    pub cooldown: Duration,
    pub max_agents: usize,
}

impl From<&RuntimeConfig> for ScalingPolicy {
    fn from(config: &RuntimeConfig) -> Self {
        Self {
            scale_up_threshold: config.scale_up_threshold,
            scale_down_threshold: config.scale_down_threshold,
            scale_up_step: config.scale_up_step,
            scale_down_step: config.scale_down_step,
            cooldown: config.cooldown_period(),
            max_agents: config.max_agents,
        }
    }
}

impl ScalingPolicy {
    /// Decide what to do with one pool given the current global agent count
    pub fn evaluate(&self, load: &PoolLoad, global_agents: usize) -> ScalingDecision {
        let utilization = utilization(load.active_jobs, load.agents);
        let cooled_down = load
            .since_last_scaling
            .map_or(true, |elapsed| elapsed >= self.cooldown);

        if utilization > self.scale_up_threshold {
            if !cooled_down {
                return ScalingDecision::Hold(HoldReason::CoolingDown);
            }
            let global_room = self.max_agents.saturating_sub(global_agents);
            let pool_room = load.max_concurrency.saturating_sub(load.agents);
            match self.scale_up_step.min(global_room).min(pool_room) {
                0 => ScalingDecision::Hold(HoldReason::AtCapacity),
                n => ScalingDecision::ScaleUp(n),
            }
        } else if utilization < self.scale_down_threshold {
            if !cooled_down {
                return ScalingDecision::Hold(HoldReason::CoolingDown);
            }
            if load.agents <= 1 {
                return ScalingDecision::Hold(HoldReason::AtMinimum);
            }
            ScalingDecision::ScaleDown(self.scale_down_step.min(load.agents - 1))
        } else {
            ScalingDecision::Hold(HoldReason::WithinThresholds)
        }
    }
}

/// Global scaling view reported by `get_status`
#[derive(Debug, Clone, Serialize)]
pub struct ScalingState {
    pub max_agents: usize,
    pub total_agents: usize,
    pub remaining_capacity: usize,
    pub scale_up_threshold: f64,
    pub scale_down_threshold: f64,
    pub cooldown_ms: u64,
}
