//! Events exchanged between sessions, queues and the data model.

use crate::data::Data;
use crate::error::CoreError;
use serde::{Deserialize, Serialize};

/// Origin type stamped on events delivered through the session's own I/O
/// processor.
pub const SCXML_EVENT_PROCESSOR: &str = "http://www.w3.org/TR/scxml/#SCXMLEventProcessor";

/// Where an event came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    /// Raised by the session itself.
    Internal,
    /// Sent from outside, by a timer, or by an invoked child.
    #[default]
    External,
    /// Generated by the platform (errors, completion).
    Platform,
}

/// Platform error categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Evaluation or action failure.
    Execution,
    /// An event could not be delivered.
    Communication,
    /// Anything else the platform reports.
    Platform,
}

impl ErrorKind {
    pub fn event_name(self) -> &'static str {
        match self {
            ErrorKind::Execution => "error.execution",
            ErrorKind::Communication => "error.communication",
            ErrorKind::Platform => "error.platform",
        }
    }
}

/// A state-chart event.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Event {
    pub name: String,

    #[serde(rename = "type")]
    pub event_type: EventType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invoke_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub send_id: Option<String>,

    /// Send id is internal bookkeeping and must not be exposed as `_event.sendid`.
    #[serde(default)]
    pub hide_send_id: bool,

    #[serde(default)]
    pub data: Data,

    /// Ordered, possibly repeated keys.
    #[serde(default)]
    pub params: Vec<(String, Data)>,

    #[serde(default)]
    pub namelist: Vec<(String, Data)>,
}

impl Event {
    pub fn new(name: impl Into<String>, event_type: EventType) -> Self {
        Self {
            name: name.into(),
            event_type,
            ..Default::default()
        }
    }

    pub fn internal(name: impl Into<String>) -> Self {
        Self::new(name, EventType::Internal)
    }

    pub fn external(name: impl Into<String>) -> Self {
        Self::new(name, EventType::External)
    }

    /// A platform error event carrying a message, and the send id of the
    /// failed send if there is one.
    pub fn error(kind: ErrorKind, message: impl Into<String>, send_id: Option<String>) -> Self {
        let mut data = Data::compound();
        data.insert("message", Data::verbatim(message));
        Self {
            name: kind.event_name().to_string(),
            event_type: EventType::Platform,
            send_id,
            data,
            ..Default::default()
        }
    }

    /// The completion event of a compound or parallel state.
    pub fn done_state(state_id: &str, data: Data) -> Self {
        Self {
            name: format!("done.state.{}", state_id),
            event_type: EventType::Internal,
            data,
            ..Default::default()
        }
    }

    /// The completion event of an invoked service.
    pub fn done_invoke(invoke_id: &str, data: Data) -> Self {
        Self {
            name: format!("done.invoke.{}", invoke_id),
            event_type: EventType::External,
            invoke_id: Some(invoke_id.to_string()),
            data,
            ..Default::default()
        }
    }

    pub fn with_data(mut self, data: Data) -> Self {
        self.data = data;
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: Data) -> Self {
        self.params.push((key.into(), value));
        self
    }

    pub fn with_send_id(mut self, send_id: impl Into<String>) -> Self {
        self.send_id = Some(send_id.into());
        self
    }

    pub fn is_error(&self) -> bool {
        self.name == "error" || self.name.starts_with("error.")
    }

    /// Returns true if this event matches the space separated descriptor list.
    pub fn matches(&self, descriptor: &str) -> bool {
        descriptor
            .split_whitespace()
            .any(|token| name_matches(token, &self.name))
    }

    /// The value of `_event` as seen by the data model.
    pub fn to_data(&self) -> Data {
        let mut data = Data::compound();
        data.insert("name", Data::verbatim(self.name.clone()));
        let kind = match self.event_type {
            EventType::Internal => "internal",
            EventType::External => "external",
            EventType::Platform => "platform",
        };
        data.insert("type", Data::verbatim(kind));
        if let Some(origin) = &self.origin {
            data.insert("origin", Data::verbatim(origin.clone()));
        }
        if let Some(origin_type) = &self.origin_type {
            data.insert("origintype", Data::verbatim(origin_type.clone()));
        }
        if let Some(invoke_id) = &self.invoke_id {
            data.insert("invokeid", Data::verbatim(invoke_id.clone()));
        }
        if let (Some(send_id), false) = (&self.send_id, self.hide_send_id) {
            data.insert("sendid", Data::verbatim(send_id.clone()));
        }
        data.insert("data", self.payload());
        data
    }

    /// The event payload with params and namelist folded in.
    ///
    /// A body that is not a compound is kept under the `content` key.
    pub fn payload(&self) -> Data {
        if self.params.is_empty() && self.namelist.is_empty() {
            return self.data.clone();
        }
        let mut payload = match &self.data {
            Data::Compound(_) => self.data.clone(),
            Data::Undefined => Data::compound(),
            body => {
                let mut wrapped = Data::compound();
                wrapped.insert(CONTENT_KEY, body.clone());
                wrapped
            }
        };
        for (key, value) in self.namelist.iter().chain(self.params.iter()) {
            if payload.get(key).is_none() {
                payload.insert(key.clone(), value.clone());
            }
        }
        payload
    }
}

/// Payload key holding a non-compound body next to params.
pub const CONTENT_KEY: &str = "content";

/// Matches a single descriptor token against an event name.
///
/// `*` matches everything. Otherwise the token (with an optional trailing
/// `.*` or `.` removed) must equal the name or be a `.`-separated prefix of it.
pub fn name_matches(token: &str, name: &str) -> bool {
    if token == "*" {
        return true;
    }
    let token = token
        .strip_suffix(".*")
        .or_else(|| token.strip_suffix('.'))
        .unwrap_or(token);
    if token.is_empty() {
        return false;
    }
    match name.strip_prefix(token) {
        Some(rest) => rest.is_empty() || rest.starts_with('.'),
        None => false,
    }
}

/// Validates a space separated descriptor list.
pub fn validate_descriptor(descriptor: &str) -> Result<Vec<String>, CoreError> {
    let tokens: Vec<String> = descriptor.split_whitespace().map(str::to_string).collect();
    if tokens.is_empty() {
        return Err(CoreError::InvalidDescriptor {
            descriptor: descriptor.to_string(),
            reason: "empty descriptor".to_string(),
        });
    }
    for token in &tokens {
        if token == "*" {
            continue;
        }
        let body = token.strip_suffix(".*").unwrap_or(token);
        let valid = !body.is_empty()
            && body.split('.').all(|segment| {
                !segment.is_empty()
                    && segment
                        .chars()
                        .all(|c| c.is_alphanumeric() || c == '_' || c == '-' || c == ':')
            });
        if !valid {
            return Err(CoreError::InvalidDescriptor {
                descriptor: descriptor.to_string(),
                reason: format!("invalid token '{}'", token),
            });
        }
    }
    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_and_prefix_match() {
        assert!(name_matches("error", "error"));
        assert!(name_matches("error", "error.execution"));
        assert!(name_matches("error.*", "error.execution"));
        assert!(name_matches("done.state", "done.state.p"));
        assert!(!name_matches("err", "error"));
        assert!(!name_matches("error.execution", "error"));
    }

    #[test]
    fn test_wildcard() {
        assert!(name_matches("*", "anything.at.all"));
        let event = Event::external("foo.bar");
        assert!(event.matches("baz *"));
        assert!(event.matches("baz foo"));
        assert!(!event.matches("baz qux"));
    }

    #[test]
    fn test_validate_descriptor() {
        assert_eq!(
            validate_descriptor("a.b  c").unwrap(),
            vec!["a.b".to_string(), "c".to_string()]
        );
        assert!(validate_descriptor("error.*").is_ok());
        assert!(validate_descriptor("").is_err());
        assert!(validate_descriptor("a..b").is_err());
        assert!(validate_descriptor("a b!").is_err());
    }

    #[test]
    fn test_error_event() {
        let event = Event::error(ErrorKind::Execution, "boom", Some("s1".to_string()));
        assert_eq!(event.name, "error.execution");
        assert_eq!(event.event_type, EventType::Platform);
        assert!(event.is_error());
        assert_eq!(event.data.get("message"), Some(&Data::verbatim("boom")));
    }

    #[test]
    fn test_event_data_hides_send_id() {
        let mut event = Event::external("go").with_send_id("s1");
        assert_eq!(
            event.to_data().get("sendid"),
            Some(&Data::verbatim("s1"))
        );
        event.hide_send_id = true;
        assert!(event.to_data().get("sendid").is_none());
    }

    #[test]
    fn test_payload_folds_params() {
        let event = Event::external("go")
            .with_param("a", Data::from(1))
            .with_param("a", Data::from(2));
        assert_eq!(event.payload().get("a"), Some(&Data::from(1)));
    }

    #[test]
    fn test_payload_keeps_atom_body_with_params() {
        let event = Event::external("go")
            .with_data(Data::verbatim("hello"))
            .with_param("a", Data::from(1));
        let payload = event.payload();
        assert_eq!(payload.get(CONTENT_KEY), Some(&Data::verbatim("hello")));
        assert_eq!(payload.get("a"), Some(&Data::from(1)));

        let plain = Event::external("go").with_param("a", Data::from(1));
        assert!(plain.payload().get(CONTENT_KEY).is_none());
    }
}
