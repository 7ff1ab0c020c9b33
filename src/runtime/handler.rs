// src/runtime/handler.rs
//! Task handlers and the capability registry
//!
//! Each agent type maps to one [`TaskHandler`] implementation. The
//! [`HandlerRegistry`] is built once at the entry point and resolves agent
//! types statically; an agent type without a registered handler is a
//! configuration error, never a silent fallback.

use crate::utils::errors::{EngineError, Result};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Failure reported by a task handler
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandlerError {
    #[error("unsupported action '{0}'")]
    UnsupportedAction(String),

    #[error("{0}")]
    Failed(String),
}

/// Domain logic hosted by a worker
///
/// `execute` runs on the blocking thread pool, so implementations may block
/// or do CPU-heavy work.
pub trait TaskHandler: Send + Sync + 'static {
    /// Named actions this handler exposes
    fn actions(&self) -> &[&'static str];

    /// Run `action` with `payload`
    fn execute(&self, action: &str, payload: Value) -> std::result::Result<Value, HandlerError>;

    fn supports(&self, action: &str) -> bool {
        self.actions().iter().any(|a| *a == action)
    }
}

type HandlerFactory = Arc<dyn Fn() -> Arc<dyn TaskHandler> + Send + Sync>;

struct Registration {
    factory: HandlerFactory,
    actions: Vec<String>,
}

/// Agent type → handler factory map
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    entries: HashMap<String, Arc<Registration>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory producing one handler instance per worker
    pub fn register<F, H>(&mut self, agent_type: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn() -> H + Send + Sync + 'static,
        H: TaskHandler,
    {
        let actions = factory()
            .actions()
            .iter()
            .map(|a| a.to_string())
            .collect();
        let factory: HandlerFactory = Arc::new(move || Arc::new(factory()) as Arc<dyn TaskHandler>);

        self.entries.insert(
            agent_type.into(),
            Arc::new(Registration { factory, actions }),
        );
        self
    }

    pub fn contains(&self, agent_type: &str) -> bool {
        self.entries.contains_key(agent_type)
    }

    pub fn agent_types(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Actions exposed by the handler registered for `agent_type`
    pub fn actions(&self, agent_type: &str) -> Option<&[String]> {
        self.entries.get(agent_type).map(|r| r.actions.as_slice())
    }

    /// Check an action before a job is accepted
    pub fn ensure_supported(&self, agent_type: &str, action: &str) -> Result<()> {
        let registration = self.entries.get(agent_type).ok_or_else(|| {
            EngineError::Configuration(format!("no handler registered for '{}'", agent_type))
        })?;

        if registration.actions.iter().any(|a| a == action) {
            Ok(())
        } else {
            Err(EngineError::UnsupportedAction {
                agent_type: agent_type.to_string(),
                action: action.to_string(),
            })
        }
    }

    /// Build a fresh handler for a new worker
    pub fn instantiate(&self, agent_type: &str) -> Result<Arc<dyn TaskHandler>> {
        self.entries
            .get(agent_type)
            .map(|r| (r.factory)())
            .ok_or_else(|| {
                EngineError::Configuration(format!("no handler registered for '{}'", agent_type))
            })
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(self.entries.iter().map(|(k, r)| (k, &r.actions)))
            .finish()
    }
}

/// Stand-in handler that simulates work
///
/// Payload fields:
/// - `duration_ms`: how long the action sleeps
/// - `fail`: report a handler failure instead of a result
/// - `panic`: crash the worker
#[derive(Debug, Clone)]
pub struct SimulatedHandler {
    actions: Vec<&'static str>,
}

impl SimulatedHandler {
    pub fn new(actions: Vec<&'static str>) -> Self {
        Self { actions }
    }
}

impl Default for SimulatedHandler {
    fn default() -> Self {
        Self::new(vec!["analyze", "generate", "echo"])
    }
}

impl TaskHandler for SimulatedHandler {
    fn actions(&self) -> &[&'static str] {
        &self.actions
    }

    fn execute(&self, action: &str, payload: Value) -> std::result::Result<Value, HandlerError> {
        if !self.supports(action) {
            return Err(HandlerError::UnsupportedAction(action.to_string()));
        }

        if let Some(ms) = payload.get("duration_ms").and_then(Value::as_u64) {
            std::thread::sleep(Duration::from_millis(ms));
        }

        if payload.get("panic").and_then(Value::as_bool) == Some(true) {
            panic!("simulated handler crash during '{}'", action);
        }

        if payload.get("fail").and_then(Value::as_bool) == Some(true) {
            return Err(HandlerError::Failed(format!("simulated failure in '{}'", action)));
        }

        Ok(json!({
            "action": action,
            "echo": payload,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> HandlerRegistry {
        let mut registry = HandlerRegistry::new();
        registry.register("requirements-analyzer", SimulatedHandler::default);
        registry
    }

    #[test]
    fn test_registry_lookup() {
        let registry = registry();
        assert!(registry.contains("requirements-analyzer"));
        assert!(!registry.contains("code-generator"));
        assert_eq!(
            registry.actions("requirements-analyzer").unwrap(),
            &["analyze", "generate", "echo"]
        );
        assert!(registry.instantiate("requirements-analyzer").is_ok());
        assert!(matches!(
            registry.instantiate("code-generator"),
            Err(EngineError::Configuration(_))
        ));
    }

    #[test]
    fn test_ensure_supported() {
        let registry = registry();
        assert!(registry.ensure_supported("requirements-analyzer", "analyze").is_ok());
        assert!(matches!(
            registry.ensure_supported("requirements-analyzer", "deploy"),
            Err(EngineError::UnsupportedAction { action, .. }) if action == "deploy"
        ));
    }

    #[test]
    fn test_simulated_handler() {
        let handler = SimulatedHandler::default();
        let out = handler.execute("echo", json!({"x": 1})).unwrap();
        assert_eq!(out["echo"]["x"], 1);

        assert_eq!(
            handler.execute("deploy", Value::Null),
            Err(HandlerError::UnsupportedAction("deploy".to_string()))
        );
        assert!(matches!(
            handler.execute("analyze", json!({"fail": true})),
            Err(HandlerError::Failed(_))
        ));
    }
}
