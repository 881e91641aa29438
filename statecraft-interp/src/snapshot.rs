//! Serialized session state.

use crate::error::InterpreterError;
use crate::executor::DelayedRoute;
use crate::interpreter::InterpreterState;
use crate::service::InvokeRequest;
use serde::{Deserialize, Serialize};
use statecraft_core::{Data, Event};
use std::collections::BTreeMap;

/// A delayed send that has not fired yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelayedSnapshot {
    pub id: String,
    pub event: Event,
    /// Time left until delivery.
    pub remaining_ms: u64,
    /// Set for sends routed through the outbox; unset for sends to the
    /// session's own external queue.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route: Option<DelayedRoute>,
}

/// A running invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvokeSnapshot {
    /// Id of the invoking state.
    pub state: String,
    /// Position of the definition in the state's `invoke` list.
    pub index: usize,
    pub request: InvokeRequest,
}

/// Everything needed to resume a session against the same document.
///
/// States are referenced by id, so a snapshot stays readable after the
/// document is reloaded; the checksum ties it to the document's content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub document: String,
    pub checksum: String,
    pub state: InterpreterState,
    /// Active states in document order.
    pub configuration: Vec<String>,
    /// Recorded history, keyed by history state id.
    #[serde(default)]
    pub history: BTreeMap<String, Vec<String>>,
    /// States whose `done.state` event has been raised and still holds.
    #[serde(default)]
    pub done_raised: Vec<String>,
    /// States whose `data` has been initialized (late binding).
    #[serde(default)]
    pub initialized: Vec<String>,
    /// Entered states whose invocations have not started yet.
    #[serde(default)]
    pub pending_invokes: Vec<String>,
    pub datamodel: Data,
    #[serde(default)]
    pub internal_queue: Vec<Event>,
    #[serde(default)]
    pub external_queue: Vec<Event>,
    #[serde(default)]
    pub outbox: Vec<Event>,
    /// Routes of the events in `outbox`, by send id.
    #[serde(default)]
    pub outbox_routes: BTreeMap<String, DelayedRoute>,
    #[serde(default)]
    pub delayed: Vec<DelayedSnapshot>,
    #[serde(default)]
    pub invokes: Vec<InvokeSnapshot>,
}

impl SessionSnapshot {
    pub fn to_json(&self) -> Result<serde_json::Value, InterpreterError> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn to_vec(&self) -> Result<Vec<u8>, InterpreterError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, InterpreterError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_round_trip() {
        let snapshot = SessionSnapshot {
            session_id: "s1".to_string(),
            document: "door".to_string(),
            checksum: "0000abcd".to_string(),
            state: InterpreterState::Stable,
            configuration: vec!["closed".to_string()],
            history: BTreeMap::new(),
            done_raised: Vec::new(),
            initialized: Vec::new(),
            pending_invokes: Vec::new(),
            datamodel: Data::from_json(&serde_json::json!({"count": 2})),
            internal_queue: Vec::new(),
            external_queue: vec![Event::external("open")],
            outbox: Vec::new(),
            outbox_routes: BTreeMap::new(),
            delayed: vec![DelayedSnapshot {
                id: "t".to_string(),
                event: Event::external("tick"),
                remaining_ms: 500,
                route: None,
            }],
            invokes: Vec::new(),
        };

        let bytes = snapshot.to_vec().unwrap();
        assert_eq!(SessionSnapshot::from_slice(&bytes).unwrap(), snapshot);
        assert_eq!(snapshot.to_json().unwrap()["state"], "stable");
    }

    #[test]
    fn test_minimal_json_uses_defaults() {
        let json = serde_json::json!({
            "session_id": "s",
            "document": "d",
            "checksum": "c",
            "state": "instantiated",
            "configuration": [],
            "datamodel": {"type": "undefined"}
        });
        let snapshot: SessionSnapshot = serde_json::from_value(json).unwrap();
        assert!(snapshot.delayed.is_empty());
        assert_eq!(snapshot.state, InterpreterState::Instantiated);
    }
}
