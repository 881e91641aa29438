//! Capability interfaces for invoked services, I/O processors and custom
//! executable content, and the sink they use to reach a session.

use crate::datamodel::DataModel;
use crate::error::InterpreterError;
use serde::{Deserialize, Serialize};
use statecraft_core::{Data, Event, EventType};
use statecraft_queue::EventQueue;
use std::collections::BTreeMap;

/// Where an event delivered through an [`EventSink`] comes from.
#[derive(Debug, Clone, Copy)]
pub enum Source<'a> {
    /// An invoked service of the receiving session.
    Invoke {
        invoke_type: &'a str,
        invoke_id: &'a str,
    },
    /// An I/O processor; `origin` is the address replies go to.
    IoProcessor { io_type: &'a str, origin: &'a str },
}

/// Entry point into a session's queues.
///
/// Sinks are cheap to clone and may be used from any thread.
#[derive(Debug, Clone)]
pub struct EventSink {
    session_id: String,
    internal: EventQueue,
    external: EventQueue,
}

impl EventSink {
    pub fn new(session_id: impl Into<String>, internal: EventQueue, external: EventQueue) -> Self {
        Self {
            session_id: session_id.into(),
            internal,
            external,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Delivers an event to the session, stamping its type and the origin
    /// fields the event does not already carry.
    pub fn event_to_session(&self, mut event: Event, source: Source<'_>, internal: bool) {
        event.event_type = match (internal, event.event_type) {
            (true, _) => EventType::Internal,
            (false, EventType::Platform) => EventType::Platform,
            (false, _) => EventType::External,
        };

        match source {
            Source::Invoke {
                invoke_type,
                invoke_id,
            } => {
                if event.invoke_id.is_none() {
                    event.invoke_id = Some(invoke_id.to_string());
                }
                if event.origin_type.is_none() {
                    event.origin_type = Some(invoke_type.to_string());
                }
            }
            Source::IoProcessor { io_type, origin } => {
                if event.origin.is_none() {
                    event.origin = Some(origin.to_string());
                }
                if event.origin_type.is_none() {
                    event.origin_type = Some(io_type.to_string());
                }
            }
        }

        if internal {
            self.internal.enqueue(event);
        } else {
            self.external.enqueue(event);
        }
    }

    /// Enqueues an external event as is.
    pub fn send(&self, event: Event) {
        self.external.enqueue(event);
    }
}

/// Everything an invoker needs to start a service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InvokeRequest {
    pub invoke_id: String,
    pub invoke_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src: Option<String>,
    #[serde(default)]
    pub params: Vec<(String, Data)>,
    #[serde(default)]
    pub namelist: Vec<(String, Data)>,
    #[serde(default)]
    pub content: Data,
    #[serde(default)]
    pub autoforward: bool,
}

/// A service started by a state's `invoke` and stopped when the state exits.
pub trait Invoker: Send {
    /// Starts the service.
    fn invoke(&mut self, request: &InvokeRequest) -> Result<(), InterpreterError>;

    /// Stops the service. Called at most once, after a successful `invoke`.
    fn uninvoke(&mut self);

    /// Delivers an event from the invoking session.
    fn send(&mut self, event: Event) -> Result<(), InterpreterError>;
}

/// Sends events to targets of one transport type.
pub trait IoProcessor: Send {
    fn send(&mut self, target: Option<&str>, event: Event) -> Result<(), InterpreterError>;

    /// Address other parties use to reach the owning session, published in
    /// `_ioprocessors`.
    fn location(&self, session_id: &str) -> Option<String> {
        let _ = session_id;
        None
    }
}

/// An action contributed by the embedding application.
pub trait ExecutableContent: Send {
    fn execute(
        &mut self,
        attrs: &BTreeMap<String, String>,
        content: Option<&serde_json::Value>,
        datamodel: &mut dyn DataModel,
        sink: &EventSink,
    ) -> Result<(), InterpreterError>;
}
