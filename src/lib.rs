// src/lib.rs
//! Agent Pool Engine Library
//!
//! Manages pools of isolated worker execution contexts, one pool per agent
//! type, and routes jobs to them with priority queueing, autoscaling and
//! health-check based self-healing.
//!
//! # Architecture
//!
//! The engine is structured into several key modules:
//!
//! - **runtime**: Pool manager, pools, workers, scaling and task handlers
//! - **observability**: Metrics, tracing, and logging
//! - **utils**: Configuration and errors

// Public module exports
pub mod observability;
pub mod runtime;
pub mod utils;

// Re-export commonly used types
pub use runtime::handler::{HandlerRegistry, SimulatedHandler, TaskHandler};
pub use runtime::job::{JobHandle, JobOutput, JobRequest, Priority, Submission};
pub use runtime::manager::PoolManager;
pub use utils::config::EngineConfig;
pub use utils::errors::{EngineError, Result};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const GIT_HASH: &str = env!("GIT_HASH");

/// Engine build information
pub struct BuildInfo {
    pub version: &'static str,
    pub git_hash: &'static str,
    pub build_timestamp: &'static str,
    pub rustc_version: &'static str,
}

impl BuildInfo {
    pub fn current() -> Self {
        Self {
            version: VERSION,
            git_hash: GIT_HASH,
            build_timestamp: env!("BUILD_TIMESTAMP"),
            rustc_version: env!("RUSTC_VERSION"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_build_info() {
        let info = BuildInfo::current();
        assert!(!info.version.is_empty());
        assert!(!info.git_hash.is_empty());
    }
}
