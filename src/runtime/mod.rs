// src/runtime/mod.rs
//! Agent pool runtime
//!
//! This module provides the pooled execution environment, including:
//!
//! - **Manager**: Pool creation, job routing, scaling and shutdown
//! - **Pool**: Agents, priority queue and metrics per agent type
//! - **Worker**: Isolated execution context hosting one task handler
//! - **Scaling**: Utilization-driven autoscaling decisions
//! - **Handler**: Registry of task handlers per agent type
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                       PoolManager                        │
//! │  ┌────────────────┐ ┌────────────────┐ ┌──────────────┐  │
//! │  │ Pool           │ │ Pool           │ │ Pool         │  │
//! │  │ requirements-  │ │ code-generator │ │ test-        │  │
//! │  │ analyzer       │ │                │ │ generator    │  │
//! │  └───────┬────────┘ └───────┬────────┘ └──────┬───────┘  │
//! │          │                  │                 │          │
//! │      Worker tasks (one per agent, own handler instance)  │
//! │          │                  │                 │          │
//! │          └──────── WorkerEvent channel ───────┘          │
//! │                           │                              │
//! │              dispatcher + housekeeping loops             │
//! └──────────────────────────────────────────────────────────┘
//! ```

pub mod agent;
pub mod handler;
mod housekeeping;
pub mod job;
pub mod manager;
pub mod pool;
pub mod scaling;
pub mod worker;

// Re-export commonly used types
pub use agent::{AgentSnapshot, AgentStatus};
pub use handler::{HandlerError, HandlerRegistry, SimulatedHandler, TaskHandler};
pub use job::{JobHandle, JobOutput, JobRequest, Priority, Submission};
pub use manager::{HealthReport, ManagerStatus, PoolManager, Replacement, ShutdownReport};
pub use pool::{PoolMetrics, PoolStatus};
pub use scaling::{HoldReason, ScalingDecision, ScalingPolicy, ScalingState};
