//! Interpreter configuration.

use crate::registry::{Registry, SessionRegistry};
use crate::service::EventSink;
use statecraft_core::Data;
use std::sync::Arc;

/// Default bound on microsteps per macrostep.
pub const DEFAULT_MAX_MICROSTEPS: usize = 100_000;

/// Link from an invoked session back to the session that invoked it.
#[derive(Debug, Clone)]
pub struct ParentLink {
    /// Sink of the invoking session.
    pub sink: EventSink,
    /// Id of the invocation that started this session.
    pub invoke_id: String,
    /// Type the invocation was started with.
    pub invoke_type: String,
}

/// Session configuration.
#[derive(Clone)]
pub struct InterpreterConfig {
    /// Session id. Generated when unset.
    pub session_id: Option<String>,
    /// Factories for data models, invokers, I/O processors and custom content.
    pub registry: Arc<Registry>,
    /// Live sessions, for `#_scxml_<id>` targets.
    pub sessions: Option<Arc<SessionRegistry>>,
    pub parent: Option<ParentLink>,
    /// Values overriding top-level `data` declarations of the same name.
    pub initial_data: Data,
    /// A macrostep that takes more microsteps than this fails.
    pub max_microsteps: usize,
}

impl Default for InterpreterConfig {
    fn default() -> Self {
        Self {
            session_id: None,
            registry: Arc::new(Registry::builtin()),
            sessions: None,
            parent: None,
            initial_data: Data::Undefined,
            max_microsteps: DEFAULT_MAX_MICROSTEPS,
        }
    }
}

impl InterpreterConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_session_id(mut self, id: impl Into<String>) -> Self {
        self.session_id = Some(id.into());
        self
    }

    pub fn with_registry(mut self, registry: Arc<Registry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_sessions(mut self, sessions: Arc<SessionRegistry>) -> Self {
        self.sessions = Some(sessions);
        self
    }

    pub fn with_parent(mut self, parent: ParentLink) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn with_initial_data(mut self, data: Data) -> Self {
        self.initial_data = data;
        self
    }

    pub fn with_max_microsteps(mut self, limit: usize) -> Self {
        self.max_microsteps = limit.max(1);
        self
    }
}
