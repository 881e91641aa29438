//! State-chart documents.
//!
//! Documents arrive already parsed, as JSON:
//!
//! ```json
//! {
//!   "name": "door",
//!   "initial": "closed",
//!   "data": [{"id": "count", "expr": "0"}],
//!   "states": [
//!     {"id": "closed",
//!      "transitions": [{"event": "open", "target": "opened", "cond": "count < 3"}]},
//!     {"id": "opened", "kind": "final"}
//!   ]
//! }
//! ```
//!
//! Loading validates the document and flattens it into arenas. State and
//! transition handles are assigned in document pre-order, so comparing two
//! handles compares document positions. Handle 0 is a synthetic root standing
//! in for the document element.

use crate::error::CoreError;
use crate::event::validate_descriptor;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

/// Index of a state in its document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateHandle(pub u32);

impl StateHandle {
    pub const ROOT: StateHandle = StateHandle(0);

    fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for StateHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

/// Index of a transition in its document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransitionHandle(pub u32);

impl TransitionHandle {
    fn index(self) -> usize {
        self.0 as usize
    }
}

// ---------------------------------------------------------------------------
// Raw document
// ---------------------------------------------------------------------------

fn deserialize_string_or_seq<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::{self, Visitor};

    struct StringOrSeq;

    impl<'de> Visitor<'de> for StringOrSeq {
        type Value = Vec<String>;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a string or array of strings")
        }

        fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(v.split_whitespace().map(str::to_string).collect())
        }

        fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
        where
            A: de::SeqAccess<'de>,
        {
            let mut ids = Vec::new();
            while let Some(s) = seq.next_element::<String>()? {
                ids.push(s);
            }
            Ok(ids)
        }
    }

    deserializer.deserialize_any(StringOrSeq)
}

/// When `data` declarations are initialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Binding {
    /// All declarations at session start.
    #[default]
    Early,
    /// A state's declarations on its first entry.
    Late,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateKindRaw {
    #[default]
    State,
    Parallel,
    Final,
    History,
}

/// Whether a history state remembers direct children or all atomic descendants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryType {
    #[default]
    Shallow,
    Deep,
}

/// External transitions exit their source; internal ones do not when all
/// targets are descendants of a compound source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransitionType {
    #[default]
    External,
    Internal,
}

/// A `name` + value pair evaluated at send, invoke or done time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Param {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

/// A data declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataDecl {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expr: Option<String>,
    /// Literal JSON content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<serde_json::Value>,
}

/// Payload of a `done.state.*` event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DoneData {
    #[serde(default)]
    pub params: Vec<Param>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contentexpr: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SendAction {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eventexpr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub targetexpr: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub send_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub typeexpr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idlocation: Option<String>,
    /// Duration such as `"500ms"` or `"2s"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delayexpr: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub namelist: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<Param>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contentexpr: Option<String>,
}

/// One `if`/`elseif`/`else` arm. The arm without a condition is the `else`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Branch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cond: Option<String>,
    #[serde(default)]
    pub actions: Vec<Action>,
}

/// Executable content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Action {
    Raise {
        event: String,
    },
    Assign {
        location: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expr: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<serde_json::Value>,
        /// `replace` (default) or `merge`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mode: Option<String>,
    },
    Send(SendAction),
    Cancel {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sendid: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sendidexpr: Option<String>,
    },
    Script {
        source: String,
    },
    Log {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        label: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expr: Option<String>,
    },
    If {
        branches: Vec<Branch>,
    },
    Foreach {
        array: String,
        item: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        index: Option<String>,
        #[serde(default)]
        actions: Vec<Action>,
    },
    Custom {
        name: String,
        #[serde(default)]
        attrs: BTreeMap<String, String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<serde_json::Value>,
    },
}

/// An invocation declared on a state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InvokeDef {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub invoke_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub typeexpr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub srcexpr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idlocation: Option<String>,
    #[serde(default)]
    pub autoforward: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub namelist: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<Param>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contentexpr: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub finalize: Vec<Action>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRaw {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cond: Option<String>,
    #[serde(
        default,
        deserialize_with = "deserialize_string_or_seq",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub target: Vec<String>,
    #[serde(rename = "type", default)]
    pub transition_type: TransitionType,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<Action>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateRaw {
    pub id: String,
    #[serde(default)]
    pub kind: StateKindRaw,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history: Option<HistoryType>,
    #[serde(
        default,
        deserialize_with = "deserialize_string_or_seq",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub initial: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub states: Vec<StateRaw>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub transitions: Vec<TransitionRaw>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub on_entry: Vec<Action>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub on_exit: Vec<Action>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub invoke: Vec<InvokeDef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub data: Vec<DataDecl>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub done_data: Option<DoneData>,
}

fn default_datamodel() -> String {
    "expr".to_string()
}

/// Raw document as stored/transmitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentRaw {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default = "default_datamodel")]
    pub datamodel: String,
    #[serde(default)]
    pub binding: Binding,
    #[serde(
        default,
        deserialize_with = "deserialize_string_or_seq",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub initial: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub data: Vec<DataDecl>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script: Option<String>,
    pub states: Vec<StateRaw>,
}

// ---------------------------------------------------------------------------
// Validated document
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateKind {
    Atomic,
    Compound,
    Parallel,
    Final,
    History(HistoryType),
}

/// A state in the arena.
#[derive(Debug, Clone)]
pub struct StateNode {
    pub id: String,
    pub kind: StateKind,
    pub parent: Option<StateHandle>,
    /// Children in document order, history states included.
    pub children: Vec<StateHandle>,
    /// Default entry targets of a compound state.
    pub initial: Vec<StateHandle>,
    pub transitions: Vec<TransitionHandle>,
    pub on_entry: Vec<Action>,
    pub on_exit: Vec<Action>,
    pub invoke: Vec<InvokeDef>,
    pub data: Vec<DataDecl>,
    pub done_data: Option<DoneData>,
}

/// A transition in the arena.
#[derive(Debug, Clone)]
pub struct TransitionNode {
    pub source: StateHandle,
    pub targets: Vec<StateHandle>,
    /// Descriptor tokens. Empty means eventless.
    pub events: Vec<String>,
    pub cond: Option<String>,
    pub transition_type: TransitionType,
    pub actions: Vec<Action>,
}

impl TransitionNode {
    pub fn is_eventless(&self) -> bool {
        self.events.is_empty()
    }

    pub fn is_targetless(&self) -> bool {
        self.targets.is_empty()
    }

    /// Returns true if any descriptor token matches `name`.
    pub fn matches(&self, name: &str) -> bool {
        self.events
            .iter()
            .any(|token| crate::event::name_matches(token, name))
    }
}

/// Validated and indexed document.
#[derive(Debug, Clone)]
pub struct Document {
    pub name: String,
    pub datamodel: String,
    pub binding: Binding,
    pub script: Option<String>,
    states: Vec<StateNode>,
    transitions: Vec<TransitionNode>,
    ids: HashMap<String, StateHandle>,

    /// Original raw document.
    pub raw: DocumentRaw,

    /// Hash of the raw document, used to match snapshots to documents.
    pub checksum: String,
}

struct PendingTransition<'a> {
    source: StateHandle,
    raw: &'a TransitionRaw,
}

impl Document {
    /// Parses and validates a document from JSON.
    pub fn from_json(json: &serde_json::Value) -> Result<Self, CoreError> {
        let raw: DocumentRaw = serde_json::from_value(json.clone())?;
        Self::from_raw(raw)
    }

    /// Parses and validates a document from JSON text.
    pub fn from_json_str(text: &str) -> Result<Self, CoreError> {
        let raw: DocumentRaw = serde_json::from_str(text)?;
        Self::from_raw(raw)
    }

    /// Validates and indexes a raw document.
    pub fn from_raw(raw: DocumentRaw) -> Result<Self, CoreError> {
        if raw.states.is_empty() {
            return Err(CoreError::invalid("document has no states"));
        }

        let mut doc = Document {
            name: raw.name.clone().unwrap_or_default(),
            datamodel: raw.datamodel.clone(),
            binding: raw.binding,
            script: raw.script.clone(),
            states: vec![StateNode {
                id: String::new(),
                kind: StateKind::Compound,
                parent: None,
                children: Vec::new(),
                initial: Vec::new(),
                transitions: Vec::new(),
                on_entry: Vec::new(),
                on_exit: Vec::new(),
                invoke: Vec::new(),
                data: raw.data.clone(),
                done_data: None,
            }],
            transitions: Vec::new(),
            ids: HashMap::new(),
            raw: raw.clone(),
            checksum: String::new(),
        };

        // Pass 1: states in pre-order.
        let mut pending = Vec::new();
        let mut initials: Vec<(StateHandle, &[String])> = Vec::new();
        for child in &raw.states {
            let handle = doc.add_state(child, StateHandle::ROOT, &mut pending, &mut initials)?;
            doc.states[0].children.push(handle);
        }
        initials.push((StateHandle::ROOT, raw.initial.as_slice()));

        // Pass 2: transitions in pre-order of their sources.
        for p in pending {
            doc.add_transition(p)?;
        }

        // Pass 3: initial targets.
        for (handle, ids) in initials {
            doc.resolve_initial(handle, ids)?;
        }

        doc.validate_history()?;

        let json_bytes = serde_json::to_vec(&raw)?;
        doc.checksum = format!("{:08x}", crc32c::crc32c(&json_bytes));

        tracing::debug!(
            name = %doc.name,
            states = doc.states.len() - 1,
            transitions = doc.transitions.len(),
            checksum = %doc.checksum,
            "document loaded"
        );

        Ok(doc)
    }

    fn add_state<'a>(
        &mut self,
        raw: &'a StateRaw,
        parent: StateHandle,
        pending: &mut Vec<PendingTransition<'a>>,
        initials: &mut Vec<(StateHandle, &'a [String])>,
    ) -> Result<StateHandle, CoreError> {
        if raw.id.is_empty() {
            return Err(CoreError::invalid("state without id"));
        }
        if self.ids.contains_key(&raw.id) {
            return Err(CoreError::DuplicateState { id: raw.id.clone() });
        }

        let kind = match raw.kind {
            StateKindRaw::State if raw.states.is_empty() => StateKind::Atomic,
            StateKindRaw::State => StateKind::Compound,
            StateKindRaw::Parallel => StateKind::Parallel,
            StateKindRaw::Final => StateKind::Final,
            StateKindRaw::History => StateKind::History(raw.history.unwrap_or_default()),
        };

        match kind {
            StateKind::Final | StateKind::History(_) if !raw.states.is_empty() => {
                return Err(CoreError::invalid(format!(
                    "state '{}' cannot have child states",
                    raw.id
                )));
            }
            StateKind::Parallel if !raw.initial.is_empty() => {
                return Err(CoreError::invalid(format!(
                    "parallel state '{}' cannot declare an initial state",
                    raw.id
                )));
            }
            StateKind::Atomic | StateKind::Final if !raw.initial.is_empty() => {
                return Err(CoreError::invalid(format!(
                    "atomic state '{}' cannot declare an initial state",
                    raw.id
                )));
            }
            StateKind::History(_) => {
                if parent == StateHandle::ROOT
                    || self.states[parent.index()].kind == StateKind::Parallel
                {
                    return Err(CoreError::invalid(format!(
                        "history '{}' must be a child of a compound state",
                        raw.id
                    )));
                }
                if raw.transitions.len() > 1 {
                    return Err(CoreError::invalid(format!(
                        "history '{}' has more than one default transition",
                        raw.id
                    )));
                }
                if let Some(t) = raw.transitions.first() {
                    if t.event.is_some() || t.cond.is_some() || t.target.is_empty() {
                        return Err(CoreError::invalid(format!(
                            "history '{}' default transition must be unguarded, eventless and targeted",
                            raw.id
                        )));
                    }
                }
            }
            _ => {}
        }

        let handle = StateHandle(self.states.len() as u32);
        self.ids.insert(raw.id.clone(), handle);
        self.states.push(StateNode {
            id: raw.id.clone(),
            kind,
            parent: Some(parent),
            children: Vec::new(),
            initial: Vec::new(),
            transitions: Vec::new(),
            on_entry: raw.on_entry.clone(),
            on_exit: raw.on_exit.clone(),
            invoke: raw.invoke.clone(),
            data: raw.data.clone(),
            done_data: raw.done_data.clone(),
        });

        for t in &raw.transitions {
            pending.push(PendingTransition { source: handle, raw: t });
        }
        if kind == StateKind::Compound {
            initials.push((handle, raw.initial.as_slice()));
        }

        for child in &raw.states {
            let child_handle = self.add_state(child, handle, pending, initials)?;
            self.states[handle.index()].children.push(child_handle);
        }

        if kind == StateKind::Compound && self.child_states(handle).next().is_none() {
            return Err(CoreError::invalid(format!(
                "compound state '{}' has only history children",
                raw.id
            )));
        }

        Ok(handle)
    }

    fn add_transition(&mut self, pending: PendingTransition<'_>) -> Result<(), CoreError> {
        let source_id = self.states[pending.source.index()].id.clone();
        let events = match &pending.raw.event {
            Some(descriptor) => validate_descriptor(descriptor)?,
            None => Vec::new(),
        };

        let mut targets = Vec::with_capacity(pending.raw.target.len());
        for id in &pending.raw.target {
            targets.push(self.resolve(id, &source_id)?);
        }

        let handle = TransitionHandle(self.transitions.len() as u32);
        self.transitions.push(TransitionNode {
            source: pending.source,
            targets,
            events,
            cond: pending.raw.cond.clone(),
            transition_type: pending.raw.transition_type,
            actions: pending.raw.actions.clone(),
        });
        self.states[pending.source.index()].transitions.push(handle);
        Ok(())
    }

    fn resolve_initial(&mut self, handle: StateHandle, ids: &[String]) -> Result<(), CoreError> {
        let referrer = self.states[handle.index()].id.clone();
        let initial = if ids.is_empty() {
            match self.child_states(handle).next() {
                Some(first) => vec![first],
                None => return Err(CoreError::invalid("document has no states")),
            }
        } else {
            let mut targets = Vec::with_capacity(ids.len());
            for id in ids {
                let target = self.resolve(id, &referrer)?;
                if !self.is_descendant(target, handle) {
                    return Err(CoreError::invalid(format!(
                        "initial state '{}' is not a descendant of '{}'",
                        id, referrer
                    )));
                }
                targets.push(target);
            }
            targets
        };
        self.states[handle.index()].initial = initial;
        Ok(())
    }

    fn validate_history(&self) -> Result<(), CoreError> {
        for (handle, state) in self.states() {
            if !matches!(state.kind, StateKind::History(_)) {
                continue;
            }
            let parent = state.parent.unwrap_or(StateHandle::ROOT);
            if let Some(t) = self.history_default(handle) {
                for &target in &self.transition(t).targets {
                    if !self.is_descendant(target, parent) {
                        return Err(CoreError::invalid(format!(
                            "history '{}' default target '{}' is outside its parent",
                            state.id,
                            self.state(target).id
                        )));
                    }
                }
            }

            // Follow default transitions through other history states.
            let mut seen = HashSet::new();
            let mut frontier = vec![handle];
            while let Some(h) = frontier.pop() {
                if !seen.insert(h) {
                    return Err(CoreError::CyclicHistory {
                        id: state.id.clone(),
                    });
                }
                if let Some(t) = self.history_default(h) {
                    frontier.extend(
                        self.transition(t)
                            .targets
                            .iter()
                            .copied()
                            .filter(|&s| self.is_history(s)),
                    );
                }
            }
        }
        Ok(())
    }

    fn resolve(&self, id: &str, referrer: &str) -> Result<StateHandle, CoreError> {
        self.ids
            .get(id)
            .copied()
            .ok_or_else(|| CoreError::UnknownState {
                id: id.to_string(),
                referrer: referrer.to_string(),
            })
    }

    /// Looks up a state by id.
    pub fn lookup(&self, id: &str) -> Option<StateHandle> {
        self.ids.get(id).copied()
    }

    pub fn state(&self, handle: StateHandle) -> &StateNode {
        &self.states[handle.index()]
    }

    pub fn transition(&self, handle: TransitionHandle) -> &TransitionNode {
        &self.transitions[handle.index()]
    }

    /// All states in document order, the root first.
    pub fn states(&self) -> impl Iterator<Item = (StateHandle, &StateNode)> {
        self.states
            .iter()
            .enumerate()
            .map(|(i, s)| (StateHandle(i as u32), s))
    }

    pub fn state_count(&self) -> usize {
        self.states.len()
    }

    pub fn transition_count(&self) -> usize {
        self.transitions.len()
    }

    pub fn id(&self, handle: StateHandle) -> &str {
        &self.state(handle).id
    }

    pub fn parent(&self, handle: StateHandle) -> Option<StateHandle> {
        self.state(handle).parent
    }

    /// Children that take part in configurations (history excluded).
    pub fn child_states(&self, handle: StateHandle) -> impl Iterator<Item = StateHandle> + '_ {
        self.state(handle)
            .children
            .iter()
            .copied()
            .filter(move |&c| !self.is_history(c))
    }

    pub fn history_children(&self, handle: StateHandle) -> impl Iterator<Item = StateHandle> + '_ {
        self.state(handle)
            .children
            .iter()
            .copied()
            .filter(move |&c| self.is_history(c))
    }

    /// Returns true if `state` is a proper descendant of `ancestor`.
    pub fn is_descendant(&self, state: StateHandle, ancestor: StateHandle) -> bool {
        let mut current = self.parent(state);
        while let Some(p) = current {
            if p == ancestor {
                return true;
            }
            current = self.parent(p);
        }
        false
    }

    /// Proper ancestors of `state`, nearest first, stopping before `stop`.
    /// With no `stop` the root is included.
    pub fn proper_ancestors(&self, state: StateHandle, stop: Option<StateHandle>) -> Vec<StateHandle> {
        let mut out = Vec::new();
        let mut current = self.parent(state);
        while let Some(p) = current {
            if Some(p) == stop {
                break;
            }
            out.push(p);
            current = self.parent(p);
        }
        out
    }

    pub fn is_atomic(&self, handle: StateHandle) -> bool {
        matches!(self.state(handle).kind, StateKind::Atomic | StateKind::Final)
    }

    /// Compound states and the root.
    pub fn is_compound(&self, handle: StateHandle) -> bool {
        self.state(handle).kind == StateKind::Compound
    }

    pub fn is_parallel(&self, handle: StateHandle) -> bool {
        self.state(handle).kind == StateKind::Parallel
    }

    pub fn is_final(&self, handle: StateHandle) -> bool {
        self.state(handle).kind == StateKind::Final
    }

    pub fn is_history(&self, handle: StateHandle) -> bool {
        matches!(self.state(handle).kind, StateKind::History(_))
    }

    /// The default transition of a history state.
    pub fn history_default(&self, handle: StateHandle) -> Option<TransitionHandle> {
        match self.state(handle).kind {
            StateKind::History(_) => self.state(handle).transitions.first().copied(),
            _ => None,
        }
    }

    /// Returns the raw document as JSON.
    pub fn to_json(&self) -> Result<serde_json::Value, CoreError> {
        Ok(serde_json::to_value(&self.raw)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_document() -> serde_json::Value {
        json!({
            "name": "player",
            "initial": "idle",
            "states": [
                {"id": "idle", "transitions": [{"event": "play", "target": "active"}]},
                {"id": "active", "initial": "playing", "states": [
                    {"id": "h", "kind": "history", "history": "deep",
                     "transitions": [{"target": "playing"}]},
                    {"id": "playing", "transitions": [{"event": "pause", "target": "paused"}]},
                    {"id": "paused", "transitions": [{"event": "play", "target": "playing"}]}
                ], "transitions": [{"event": "stop", "target": "done"}]},
                {"id": "done", "kind": "final"}
            ]
        })
    }

    #[test]
    fn test_parse_document() {
        let doc = Document::from_json(&sample_document()).unwrap();

        assert_eq!(doc.name, "player");
        assert_eq!(doc.datamodel, "expr");
        assert_eq!(doc.state_count(), 7);
        assert_eq!(doc.transition_count(), 5);
        assert_eq!(doc.checksum.len(), 8);
    }

    #[test]
    fn test_handles_follow_document_order() {
        let doc = Document::from_json(&sample_document()).unwrap();
        let ids: Vec<&str> = doc.states().skip(1).map(|(_, s)| s.id.as_str()).collect();
        assert_eq!(ids, vec!["idle", "active", "h", "playing", "paused", "done"]);

        let active = doc.lookup("active").unwrap();
        let playing = doc.lookup("playing").unwrap();
        assert!(doc.is_descendant(playing, active));
        assert!(!doc.is_descendant(active, playing));
        assert_eq!(doc.proper_ancestors(playing, None), vec![active, StateHandle::ROOT]);
        assert_eq!(doc.state(active).initial, vec![playing]);
        assert_eq!(doc.state(StateHandle::ROOT).initial, vec![doc.lookup("idle").unwrap()]);
    }

    #[test]
    fn test_kinds() {
        let doc = Document::from_json(&sample_document()).unwrap();
        assert!(doc.is_atomic(doc.lookup("idle").unwrap()));
        assert!(doc.is_compound(doc.lookup("active").unwrap()));
        assert!(doc.is_final(doc.lookup("done").unwrap()));
        assert!(doc.is_atomic(doc.lookup("done").unwrap()));
        let h = doc.lookup("h").unwrap();
        assert!(doc.is_history(h));
        assert!(doc.history_default(h).is_some());
        let children: Vec<_> = doc.child_states(doc.lookup("active").unwrap()).collect();
        assert_eq!(children.len(), 2);
    }

    #[test]
    fn test_checksum_stable() {
        let a = Document::from_json(&sample_document()).unwrap();
        let b = Document::from_json(&sample_document()).unwrap();
        assert_eq!(a.checksum, b.checksum);
    }

    #[test]
    fn test_actions_deserialize() {
        let json = json!({
            "states": [{"id": "a", "on_entry": [
                {"kind": "assign", "location": "x", "expr": "1"},
                {"kind": "send", "event": "tick", "delay": "1s", "id": "t1"},
                {"kind": "if", "branches": [
                    {"cond": "x > 0", "actions": [{"kind": "raise", "event": "pos"}]},
                    {"actions": [{"kind": "log", "label": "neg"}]}
                ]},
                {"kind": "foreach", "array": "items", "item": "it", "index": "i"}
            ]}]
        });
        let doc = Document::from_json(&json).unwrap();
        let a = doc.state(doc.lookup("a").unwrap());
        assert_eq!(a.on_entry.len(), 4);
        match &a.on_entry[1] {
            Action::Send(send) => {
                assert_eq!(send.event.as_deref(), Some("tick"));
                assert_eq!(send.delay.as_deref(), Some("1s"));
            }
            other => panic!("unexpected action {:?}", other),
        }
    }

    #[test]
    fn test_unknown_target() {
        let json = json!({
            "states": [{"id": "a", "transitions": [{"event": "go", "target": "b"}]}]
        });
        let result = Document::from_json(&json);
        assert!(matches!(result, Err(CoreError::UnknownState { .. })));
    }

    #[test]
    fn test_duplicate_id() {
        let json = json!({
            "states": [{"id": "a"}, {"id": "b", "states": [{"id": "a"}]}]
        });
        let result = Document::from_json(&json);
        assert!(matches!(result, Err(CoreError::DuplicateState { .. })));
    }

    #[test]
    fn test_initial_not_descendant() {
        let json = json!({
            "states": [
                {"id": "a", "initial": "c", "states": [{"id": "b"}]},
                {"id": "c"}
            ]
        });
        assert!(Document::from_json(&json).is_err());
    }

    #[test]
    fn test_parallel_with_initial() {
        let json = json!({
            "states": [{"id": "p", "kind": "parallel", "initial": "a",
                        "states": [{"id": "a"}, {"id": "b"}]}]
        });
        assert!(Document::from_json(&json).is_err());
    }

    #[test]
    fn test_initial_on_atomic() {
        let json = json!({"states": [{"id": "a", "initial": "a"}]});
        assert!(Document::from_json(&json).is_err());
    }

    #[test]
    fn test_children_on_final() {
        let json = json!({"states": [{"id": "f", "kind": "final", "states": [{"id": "x"}]}]});
        assert!(Document::from_json(&json).is_err());
    }

    #[test]
    fn test_history_under_parallel() {
        let json = json!({
            "states": [{"id": "p", "kind": "parallel", "states": [
                {"id": "h", "kind": "history"},
                {"id": "a"}
            ]}]
        });
        assert!(Document::from_json(&json).is_err());
    }

    #[test]
    fn test_guarded_history_default() {
        let json = json!({
            "states": [{"id": "s", "states": [
                {"id": "h", "kind": "history",
                 "transitions": [{"target": "a", "cond": "x"}]},
                {"id": "a"}
            ]}]
        });
        assert!(Document::from_json(&json).is_err());
    }

    #[test]
    fn test_cyclic_history() {
        let json = json!({
            "states": [{"id": "s", "states": [
                {"id": "h1", "kind": "history", "transitions": [{"target": "h2"}]},
                {"id": "h2", "kind": "history", "transitions": [{"target": "h1"}]},
                {"id": "a"}
            ]}]
        });
        let result = Document::from_json(&json);
        assert!(matches!(result, Err(CoreError::CyclicHistory { .. })));
    }

    #[test]
    fn test_invalid_descriptor() {
        let json = json!({
            "states": [{"id": "a", "transitions": [{"event": "go..now", "target": "a"}]}]
        });
        let result = Document::from_json(&json);
        assert!(matches!(result, Err(CoreError::InvalidDescriptor { .. })));
    }

    #[test]
    fn test_empty_document() {
        let json = json!({"states": []});
        assert!(Document::from_json(&json).is_err());
    }
}
