//! The session interpreter.
//!
//! An [`Interpreter`] runs one document. It has no thread of its own: callers
//! drive it with [`Interpreter::step`], which performs one macrostep. That is
//! all eventless and internal work, then at most one external event. Timers
//! and producers on other threads only ever touch the session's queues.

use crate::config::InterpreterConfig;
use crate::error::InterpreterError;
use crate::executor::{ContentExecutor, SessionQueues};
use crate::registry::{ServiceContext, SessionRegistry};
use crate::service::EventSink;
use crate::datamodel::DataModel;
use crate::snapshot::{InvokeSnapshot, SessionSnapshot};
use parking_lot::ReentrantMutex;
use serde::{Deserialize, Serialize};
use statecraft_core::{
    Binding, Configuration, Data, Document, Event, HistoryValues, MicroStep, MicroStepPlan,
    StateHandle, TransitionHandle,
};
use statecraft_queue::DelayedEventQueue;
use std::cell::RefCell;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterpreterState {
    /// Created, initial configuration not entered yet.
    Instantiated,
    /// Inside a macrostep.
    Stepping,
    /// Between macrosteps.
    Stable,
    /// A top-level final state was reached.
    Finished,
    Cancelled,
}

impl InterpreterState {
    pub fn is_terminal(self) -> bool {
        matches!(self, InterpreterState::Finished | InterpreterState::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            InterpreterState::Instantiated => "instantiated",
            InterpreterState::Stepping => "stepping",
            InterpreterState::Stable => "stable",
            InterpreterState::Finished => "finished",
            InterpreterState::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for InterpreterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mutable session state, guarded by the session lock.
struct Session {
    state: InterpreterState,
    configuration: Configuration,
    history: HistoryValues,
    /// Completed states whose `done.state` event was raised.
    done_raised: BTreeSet<StateHandle>,
    /// States whose `data` was initialized.
    initialized: BTreeSet<StateHandle>,
    /// States entered in this macrostep whose invocations are pending.
    to_invoke: BTreeSet<StateHandle>,
    /// Bumped by reset, restore and cancel so a waiting step notices.
    epoch: u64,
    executor: ContentExecutor,
}

/// A running state-chart session.
pub struct Interpreter {
    doc: Arc<Document>,
    session_id: String,
    queues: SessionQueues,
    timers: Arc<DelayedEventQueue>,
    sink: EventSink,
    sessions: Option<Arc<SessionRegistry>>,
    initial_data: Data,
    max_microsteps: usize,
    cancel_requested: AtomicBool,
    session: ReentrantMutex<RefCell<Session>>,
}

impl fmt::Debug for Interpreter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Interpreter")
            .field("session_id", &self.session_id)
            .field("document", &self.doc.name)
            .field("state", &self.state())
            .finish()
    }
}

impl Interpreter {
    /// Creates a session for `doc`. The data model named by the document
    /// must be registered.
    pub fn new(doc: Arc<Document>, config: InterpreterConfig) -> Result<Self, InterpreterError> {
        let session_id = config
            .session_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let queues = SessionQueues::default();
        let sink = EventSink::new(
            session_id.clone(),
            queues.internal.clone(),
            queues.external.clone(),
        );
        let ctx = ServiceContext {
            sink: sink.clone(),
            registry: Arc::clone(&config.registry),
            sessions: config.sessions.clone(),
        };

        let datamodel = config.registry.create_data_model(&doc.datamodel, &ctx)?;
        let timers = Arc::new(DelayedEventQueue::new());
        timers.start()?;

        let executor = ContentExecutor::new(
            doc.name.clone(),
            datamodel,
            queues.clone(),
            Arc::clone(&timers),
            ctx,
            config.parent,
        );

        if let Some(sessions) = &config.sessions {
            sessions.register(sink.clone());
        }
        tracing::info!(session = %session_id, document = %doc.name, "session created");

        Ok(Self {
            doc,
            session_id,
            queues,
            timers,
            sink,
            sessions: config.sessions,
            initial_data: config.initial_data,
            max_microsteps: config.max_microsteps,
            cancel_requested: AtomicBool::new(false),
            session: ReentrantMutex::new(RefCell::new(Session {
                state: InterpreterState::Instantiated,
                configuration: Configuration::new(),
                history: HistoryValues::new(),
                done_raised: BTreeSet::new(),
                initialized: BTreeSet::new(),
                to_invoke: BTreeSet::new(),
                epoch: 0,
                executor,
            })),
        })
    }

    /// Loads a JSON document and creates a session for it.
    pub fn from_json(json: &str, config: InterpreterConfig) -> Result<Self, InterpreterError> {
        let doc = Document::from_json_str(json)?;
        Self::new(Arc::new(doc), config)
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn document(&self) -> &Arc<Document> {
        &self.doc
    }

    /// Sink feeding this session's queues.
    pub fn sink(&self) -> EventSink {
        self.sink.clone()
    }

    /// Enqueues an external event.
    pub fn send(&self, event: Event) {
        self.sink.send(event);
    }

    /// Returns true if external events are waiting to be processed.
    pub fn has_pending_events(&self) -> bool {
        !self.queues.external.is_empty()
    }

    /// Current lifecycle state. Reports `Stepping` when called from inside a
    /// step on the same thread.
    pub fn state(&self) -> InterpreterState {
        let guard = self.session.lock();
        let state = match guard.try_borrow() {
            Ok(session) => session.state,
            Err(_) => InterpreterState::Stepping,
        };
        state
    }

    /// Ids of the active states in document order.
    pub fn configuration(&self) -> Result<Vec<String>, InterpreterError> {
        let guard = self.session.lock();
        let session = guard.try_borrow().map_err(|_| InterpreterError::Busy)?;
        Ok(self.state_ids(&session.configuration))
    }

    /// Returns true if the state with this id is active.
    pub fn is_active(&self, id: &str) -> Result<bool, InterpreterError> {
        let Some(handle) = self.doc.lookup(id) else {
            return Ok(false);
        };
        let guard = self.session.lock();
        let session = guard.try_borrow().map_err(|_| InterpreterError::Busy)?;
        Ok(session.configuration.contains(&handle))
    }

    /// Runs `f` against the session's data model.
    pub fn with_datamodel<R>(
        &self,
        f: impl FnOnce(&mut dyn DataModel) -> R,
    ) -> Result<R, InterpreterError> {
        let guard = self.session.lock();
        let mut session = guard.try_borrow_mut().map_err(|_| InterpreterError::Busy)?;
        Ok(f(session.executor.datamodel()))
    }

    /// Performs one macrostep.
    ///
    /// The first step enters the initial configuration and returns without
    /// looking at the external queue. Later steps drain eventless and
    /// internal work, then take at most one external event, waiting up to
    /// `timeout` for it (`None` waits indefinitely, `Some(ZERO)` polls).
    /// The session lock is released while waiting.
    pub fn step(&self, timeout: Option<Duration>) -> Result<InterpreterState, InterpreterError> {
        let (epoch, token) = {
            let guard = self.session.lock();
            let mut session = guard.try_borrow_mut().map_err(|_| InterpreterError::Busy)?;
            let session = &mut *session;

            if session.state.is_terminal() {
                return Err(InterpreterError::Terminated {
                    state: session.state,
                });
            }
            if self.cancel_requested.load(Ordering::Acquire) {
                self.exit_interpreter(session, InterpreterState::Cancelled);
                return Ok(session.state);
            }

            if session.state == InterpreterState::Instantiated {
                session.state = InterpreterState::Stepping;
                let result = self.start(session);
                return self.settle(session, result);
            }

            session.state = InterpreterState::Stepping;
            session.executor.route_outbox();
            let result = self.macrostep(session);
            if result.is_err() || session.state.is_terminal() {
                return self.settle(session, result);
            }
            if self.cancel_requested.load(Ordering::Acquire) {
                self.exit_interpreter(session, InterpreterState::Cancelled);
                return Ok(session.state);
            }

            if let Some(event) = self.queues.external.try_dequeue() {
                let result = self.process_external(session, event);
                return self.settle(session, result);
            }
            if timeout == Some(Duration::ZERO) {
                return self.settle(session, Ok(()));
            }

            session.state = InterpreterState::Stable;
            (session.epoch, self.queues.external.interrupt_token())
        };

        let event = self.queues.external.dequeue_since(token, timeout);

        let guard = self.session.lock();
        let mut session = guard.try_borrow_mut().map_err(|_| InterpreterError::Busy)?;
        let session = &mut *session;

        if session.epoch != epoch || session.state.is_terminal() {
            if let Some(event) = event {
                if session.state == InterpreterState::Cancelled {
                    tracing::debug!(session = %self.session_id, event = %event.name, "discarding event of cancelled session");
                } else {
                    self.queues.external.requeue_front(event);
                }
            }
            return Ok(session.state);
        }
        if self.cancel_requested.load(Ordering::Acquire) {
            self.exit_interpreter(session, InterpreterState::Cancelled);
            return Ok(session.state);
        }

        session.state = InterpreterState::Stepping;
        session.executor.route_outbox();
        let result = match event {
            Some(event) => self.process_external(session, event),
            None => self.macrostep(session),
        };
        self.settle(session, result)
    }

    /// Leaves the stepping state after a macrostep.
    fn settle(
        &self,
        session: &mut Session,
        result: Result<(), InterpreterError>,
    ) -> Result<InterpreterState, InterpreterError> {
        if session.state == InterpreterState::Stepping {
            session.state = InterpreterState::Stable;
        }
        result.map(|()| session.state)
    }

    /// Returns the session to its initial, not yet started state.
    pub fn reset(&self) -> Result<(), InterpreterError> {
        let guard = self.session.lock();
        let mut session = guard.try_borrow_mut().map_err(|_| InterpreterError::Busy)?;
        let session = &mut *session;

        session.executor.uninvoke_all();
        session.executor.cancel_all_sends();
        session.executor.reset_datamodel(&self.doc.datamodel)?;
        self.queues.internal.reset();
        self.queues.external.reset();
        self.queues.outbox.reset();

        session.configuration.clear();
        session.history.clear();
        session.done_raised.clear();
        session.initialized.clear();
        session.to_invoke.clear();
        session.state = InterpreterState::Instantiated;
        session.epoch += 1;
        self.cancel_requested.store(false, Ordering::Release);
        self.publish_configuration(session);
        self.register();

        self.queues.external.interrupt();
        tracing::info!(session = %self.session_id, "session reset");
        Ok(())
    }

    /// Cancels the session: pending sends are dropped, invocations stopped
    /// and the active states exited. Called from inside a step on the same
    /// thread, cancellation happens at the end of the current macrostep.
    pub fn cancel(&self) {
        self.cancel_requested.store(true, Ordering::Release);
        let guard = self.session.lock();
        if let Ok(mut session) = guard.try_borrow_mut() {
            if !session.state.is_terminal() {
                session.epoch += 1;
                self.exit_interpreter(&mut session, InterpreterState::Cancelled);
            }
        }
        self.queues.external.interrupt();
    }

    /// Captures the session.
    pub fn serialize(&self) -> Result<SessionSnapshot, InterpreterError> {
        let guard = self.session.lock();
        let session = guard.try_borrow().map_err(|_| InterpreterError::Busy)?;

        let outbox = self.queues.outbox.serialize();
        let invokes = session
            .executor
            .invoke_records()
            .into_iter()
            .map(|record| InvokeSnapshot {
                state: self.doc.id(record.state).to_string(),
                index: record.index,
                request: record.request,
            })
            .collect();

        Ok(SessionSnapshot {
            session_id: self.session_id.clone(),
            document: self.doc.name.clone(),
            checksum: self.doc.checksum.clone(),
            state: session.state,
            configuration: self.state_ids(&session.configuration),
            history: session
                .history
                .iter()
                .map(|(h, states)| (self.doc.id(*h).to_string(), self.state_ids(states)))
                .collect(),
            done_raised: self.state_ids(&session.done_raised),
            initialized: self.state_ids(&session.initialized),
            pending_invokes: self.state_ids(&session.to_invoke),
            datamodel: session.executor.datamodel_ref().snapshot(),
            internal_queue: self.queues.internal.serialize(),
            external_queue: self.queues.external.serialize(),
            outbox_routes: session.executor.outbox_routes(&outbox),
            outbox,
            delayed: session.executor.delayed_snapshot(),
            invokes,
        })
    }

    /// Restores a snapshot taken from a session of the same document.
    /// A waiting step is woken and returns.
    pub fn deserialize(&self, snapshot: &SessionSnapshot) -> Result<(), InterpreterError> {
        if snapshot.checksum != self.doc.checksum {
            return Err(InterpreterError::SnapshotMismatch {
                reason: format!(
                    "checksum {} does not match document checksum {}",
                    snapshot.checksum, self.doc.checksum
                ),
            });
        }
        let configuration = self.resolve(&snapshot.configuration)?;
        let done_raised = self.resolve(&snapshot.done_raised)?;
        let initialized = self.resolve(&snapshot.initialized)?;
        let to_invoke = self.resolve(&snapshot.pending_invokes)?;
        let mut history = HistoryValues::new();
        for (id, states) in &snapshot.history {
            let handle = self.resolve_one(id)?;
            history.insert(handle, self.resolve(states)?.into_iter().collect());
        }

        let guard = self.session.lock();
        let mut session = guard.try_borrow_mut().map_err(|_| InterpreterError::Busy)?;
        let session = &mut *session;

        session.executor.uninvoke_all();
        session.executor.datamodel().restore(&snapshot.datamodel)?;
        session.executor.restore_delayed(&snapshot.outbox_routes, &snapshot.delayed);
        self.queues.internal.deserialize(snapshot.internal_queue.clone());
        self.queues.external.deserialize(snapshot.external_queue.clone());
        self.queues.outbox.deserialize(snapshot.outbox.clone());

        session.configuration = configuration;
        session.history = history;
        session.done_raised = done_raised;
        session.initialized = initialized;
        session.to_invoke = to_invoke;
        session.state = match snapshot.state {
            InterpreterState::Stepping => InterpreterState::Stable,
            other => other,
        };
        session.epoch += 1;
        self.cancel_requested.store(false, Ordering::Release);
        self.publish_configuration(session);

        for invoke in &snapshot.invokes {
            let state = self.resolve_one(&invoke.state)?;
            let finalize = self
                .doc
                .state(state)
                .invoke
                .get(invoke.index)
                .map(|def| def.finalize.clone())
                .unwrap_or_default();
            if let Err(e) = session.executor.start_request(
                state,
                invoke.index,
                invoke.request.clone(),
                finalize,
            ) {
                session.executor.raise_error(&e);
            }
        }

        if session.state.is_terminal() {
            self.unregister();
        } else {
            self.register();
        }
        self.queues.external.interrupt();
        tracing::info!(
            session = %self.session_id,
            from = %snapshot.session_id,
            state = %session.state,
            "session restored"
        );
        Ok(())
    }

    fn resolve_one(&self, id: &str) -> Result<StateHandle, InterpreterError> {
        self.doc
            .lookup(id)
            .ok_or_else(|| InterpreterError::SnapshotMismatch {
                reason: format!("unknown state '{}'", id),
            })
    }

    fn resolve(&self, ids: &[String]) -> Result<BTreeSet<StateHandle>, InterpreterError> {
        ids.iter().map(|id| self.resolve_one(id)).collect()
    }

    fn state_ids<'a>(&self, states: impl IntoIterator<Item = &'a StateHandle>) -> Vec<String> {
        states
            .into_iter()
            .map(|&h| self.doc.id(h).to_string())
            .collect()
    }

    fn register(&self) {
        if let Some(sessions) = &self.sessions {
            sessions.register(self.sink.clone());
        }
    }

    fn unregister(&self) {
        if let Some(sessions) = &self.sessions {
            sessions.unregister(&self.session_id);
        }
    }

    /// Initializes data, runs the document script and enters the initial
    /// configuration.
    fn start(&self, session: &mut Session) -> Result<(), InterpreterError> {
        tracing::info!(session = %self.session_id, "session started");

        let no_overrides = Data::Undefined;
        for (handle, node) in self.doc.states() {
            let root = handle == StateHandle::ROOT;
            if !root && self.doc.binding == Binding::Late {
                continue;
            }
            let overrides = if root {
                &self.initial_data
            } else {
                &no_overrides
            };
            session.executor.init_data(&node.data, overrides);
            session.initialized.insert(handle);
        }
        if let Some(script) = &self.doc.script {
            session.executor.run_script(script);
        }

        let plan = MicroStep::new(&self.doc).initial_plan(&session.history);
        if self.apply_plan(session, &plan) {
            self.exit_interpreter(session, InterpreterState::Finished);
            return Ok(());
        }
        self.macrostep(session)
    }

    /// Handles one external event, then the macrostep it starts.
    fn process_external(&self, session: &mut Session, event: Event) -> Result<(), InterpreterError> {
        if let Some(invoke_id) = &event.invoke_id {
            if !session.executor.has_invoke(invoke_id) {
                tracing::debug!(
                    session = %self.session_id,
                    event = %event.name,
                    invoke_id = %invoke_id,
                    "dropping event from inactive invocation"
                );
                return self.macrostep(session);
            }
        }

        tracing::debug!(session = %self.session_id, event = %event.name, "external event");
        session.executor.datamodel().set_event(&event);
        session.executor.finalize_and_forward(&event);

        let transitions = self.select(session, Some(&event.name));
        if !transitions.is_empty() && self.microstep(session, transitions) {
            self.exit_interpreter(session, InterpreterState::Finished);
            return Ok(());
        }
        self.macrostep(session)
    }

    /// Runs eventless transitions and internal events until none are left,
    /// then starts the invocations of states entered on the way.
    fn macrostep(&self, session: &mut Session) -> Result<(), InterpreterError> {
        let mut microsteps = 0usize;
        loop {
            loop {
                let mut transitions = self.select(session, None);
                if transitions.is_empty() {
                    let Some(event) = self.queues.internal.try_dequeue() else {
                        break;
                    };
                    tracing::trace!(session = %self.session_id, event = %event.name, "internal event");
                    session.executor.datamodel().set_event(&event);
                    transitions = self.select(session, Some(&event.name));
                }
                if transitions.is_empty() {
                    continue;
                }

                microsteps += 1;
                if microsteps > self.max_microsteps {
                    tracing::error!(
                        session = %self.session_id,
                        limit = self.max_microsteps,
                        "macrostep does not settle"
                    );
                    return Err(InterpreterError::MicrostepLimit {
                        limit: self.max_microsteps,
                    });
                }
                if self.microstep(session, transitions) {
                    self.exit_interpreter(session, InterpreterState::Finished);
                    return Ok(());
                }
            }

            let pending: Vec<StateHandle> = std::mem::take(&mut session.to_invoke)
                .into_iter()
                .filter(|s| session.configuration.contains(s))
                .collect();
            for state in pending {
                let node = self.doc.state(state);
                for (index, def) in node.invoke.iter().enumerate() {
                    session.executor.invoke(state, &node.id, index, def);
                }
            }

            if self.queues.internal.is_empty() {
                return Ok(());
            }
        }
    }

    fn select(&self, session: &mut Session, event: Option<&str>) -> Vec<TransitionHandle> {
        let Session {
            configuration,
            history,
            executor,
            ..
        } = session;
        MicroStep::new(&self.doc).select_transitions(configuration, history, event, |_, cond| {
            executor.eval_cond(cond)
        })
    }

    /// Takes the selected transitions. Returns true if a top-level final
    /// state was entered.
    fn microstep(&self, session: &mut Session, transitions: Vec<TransitionHandle>) -> bool {
        let plan = MicroStep::new(&self.doc).plan(&session.configuration, &session.history, transitions);
        self.apply_plan(session, &plan)
    }

    fn apply_plan(&self, session: &mut Session, plan: &MicroStepPlan) -> bool {
        let engine = MicroStep::new(&self.doc);
        tracing::debug!(
            session = %self.session_id,
            transitions = plan.transitions.len(),
            exit = ?self.state_ids(&plan.exit_set),
            enter = ?self.state_ids(&plan.entry_set),
            "microstep"
        );

        for (history, recorded) in &plan.history_updates {
            session.history.insert(*history, recorded.clone());
        }
        for &state in &plan.exit_set {
            session.executor.uninvoke_state(state);
            session.to_invoke.remove(&state);
            session.executor.execute_block(&self.doc.state(state).on_exit);
            session.configuration.remove(&state);
        }
        // Exited states, and parallels left with a non-final region, complete
        // again when re-entered within this microstep.
        prune_done_raised(&engine, session);

        for &t in &plan.transitions {
            session.executor.execute_block(&self.doc.transition(t).actions);
        }

        let mut finished = false;
        for &state in &plan.entry_set {
            let node = self.doc.state(state);
            session.configuration.insert(state);
            session.to_invoke.insert(state);
            if session.initialized.insert(state) {
                session.executor.init_data(&node.data, &Data::Undefined);
            }
            session.executor.execute_block(&node.on_entry);
            if let Some(&t) = plan.history_content.get(&state) {
                session.executor.execute_block(&self.doc.transition(t).actions);
            }

            if !self.doc.is_final(state) {
                continue;
            }
            if engine.is_top_level_final(state) {
                finished = true;
                continue;
            }
            let parent = self.doc.parent(state);
            for completed in engine.completed_by(&session.configuration, state) {
                if !session.done_raised.insert(completed) {
                    continue;
                }
                let data = match (&node.done_data, Some(completed) == parent) {
                    (Some(done), true) => session.executor.done_data(done),
                    _ => Data::Undefined,
                };
                let event = Event::done_state(self.doc.id(completed), data);
                tracing::debug!(session = %self.session_id, event = %event.name, "completion");
                self.queues.internal.enqueue(event);
            }
        }

        prune_done_raised(&engine, session);
        self.publish_configuration(session);
        finished
    }

    fn publish_configuration(&self, session: &mut Session) {
        let ids = session
            .configuration
            .iter()
            .map(|&h| self.doc.id(h).to_string())
            .collect();
        session.executor.datamodel().set_active_states(ids);
    }

    /// Exits every active state, deepest first, and ends the session.
    fn exit_interpreter(&self, session: &mut Session, end: InterpreterState) {
        let engine = MicroStep::new(&self.doc);
        let mut done_data = Data::Undefined;

        for state in engine.exit_all(&session.configuration) {
            let node = self.doc.state(state);
            session.executor.uninvoke_state(state);
            session.executor.execute_block(&node.on_exit);
            session.configuration.remove(&state);
            if end == InterpreterState::Finished && engine.is_top_level_final(state) {
                if let Some(done) = &node.done_data {
                    done_data = session.executor.done_data(done);
                }
            }
        }
        session.executor.uninvoke_all();
        session.executor.cancel_all_sends();
        session.to_invoke.clear();
        session.done_raised.clear();
        session.state = end;
        self.publish_configuration(session);

        if end == InterpreterState::Finished {
            session.executor.notify_parent_done(done_data);
        }
        self.unregister();
        tracing::info!(session = %self.session_id, state = %end, "session ended");
    }
}

impl Drop for Interpreter {
    fn drop(&mut self) {
        self.session.get_mut().get_mut().executor.uninvoke_all();
        self.timers.stop();
        self.unregister();
    }
}

/// Forgets completion events whose condition no longer holds.
fn prune_done_raised(engine: &MicroStep<'_>, session: &mut Session) {
    let Session {
        configuration,
        done_raised,
        ..
    } = session;
    done_raised.retain(|&s| configuration.contains(&s) && engine.is_in_final_state(configuration, s));
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Instant;

    fn interpreter(doc: serde_json::Value) -> Interpreter {
        Interpreter::from_json(&doc.to_string(), InterpreterConfig::new()).unwrap()
    }

    fn poll(interp: &Interpreter) -> InterpreterState {
        interp.step(Some(Duration::ZERO)).unwrap()
    }

    fn holds(interp: &Interpreter, expr: &str) -> bool {
        interp
            .with_datamodel(|dm| dm.eval_as_bool(expr))
            .unwrap()
            .unwrap()
    }

    /// Steps until `id` is active or two seconds pass.
    fn step_until_active(interp: &Interpreter, id: &str) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if interp.is_active(id).unwrap() {
                return true;
            }
            if interp.step(Some(Duration::from_millis(50))).is_err() {
                return false;
            }
        }
        interp.is_active(id).unwrap()
    }

    type Trace = Arc<parking_lot::Mutex<Vec<String>>>;

    /// Appends its `label` attribute to the trace.
    struct Mark(Trace);

    impl crate::service::ExecutableContent for Mark {
        fn execute(
            &mut self,
            attrs: &std::collections::BTreeMap<String, String>,
            _content: Option<&serde_json::Value>,
            _datamodel: &mut dyn DataModel,
            _sink: &EventSink,
        ) -> Result<(), InterpreterError> {
            let label = attrs.get("label").cloned().unwrap_or_default();
            self.0.lock().push(label);
            Ok(())
        }
    }

    struct Recorder(Trace);

    impl crate::service::Invoker for Recorder {
        fn invoke(
            &mut self,
            request: &crate::service::InvokeRequest,
        ) -> Result<(), InterpreterError> {
            self.0.lock().push(format!("invoke {}", request.invoke_id));
            Ok(())
        }

        fn uninvoke(&mut self) {
            self.0.lock().push("uninvoke".to_string());
        }

        fn send(&mut self, _event: Event) -> Result<(), InterpreterError> {
            Ok(())
        }
    }

    /// An interpreter whose `mark` content and `recorder` invocations
    /// write to the returned trace.
    fn traced(doc: serde_json::Value) -> (Interpreter, Trace) {
        let trace = Trace::default();
        let mut registry = crate::registry::Registry::builtin();
        let marks = Arc::clone(&trace);
        registry.register_executable_content("mark", move |_: &ServiceContext| {
            Box::new(Mark(Arc::clone(&marks))) as Box<dyn crate::service::ExecutableContent>
        });
        let invokes = Arc::clone(&trace);
        registry.register_invoker("recorder", move |_: &ServiceContext| {
            Box::new(Recorder(Arc::clone(&invokes))) as Box<dyn crate::service::Invoker>
        });
        let config = InterpreterConfig::new().with_registry(Arc::new(registry));
        let interp = Interpreter::from_json(&doc.to_string(), config).unwrap();
        (interp, trace)
    }

    fn mark(label: &str) -> serde_json::Value {
        json!({"kind": "custom", "name": "mark", "attrs": {"label": label}})
    }

    fn door() -> serde_json::Value {
        json!({
            "name": "door",
            "data": [{"id": "opened", "expr": "0"}],
            "states": [
                {"id": "closed", "transitions": [{"event": "open", "target": "open"}]},
                {
                    "id": "open",
                    "on_entry": [{"kind": "script", "source": "opened = opened + 1"}],
                    "transitions": [
                        {"event": "close", "target": "closed"},
                        {"event": "lock", "target": "locked"}
                    ]
                },
                {"id": "locked", "kind": "final"}
            ]
        })
    }

    #[test]
    fn test_first_step_enters_initial_configuration() {
        let interp = interpreter(door());
        interp.send(Event::external("open"));
        assert_eq!(interp.state(), InterpreterState::Instantiated);

        assert_eq!(poll(&interp), InterpreterState::Stable);
        assert_eq!(interp.configuration().unwrap(), vec!["closed"]);

        // The queued event is left for the next step.
        poll(&interp);
        assert_eq!(interp.configuration().unwrap(), vec!["open"]);
    }

    #[test]
    fn test_one_external_event_per_step() {
        let interp = interpreter(door());
        poll(&interp);

        interp.send(Event::external("open"));
        interp.send(Event::external("close"));
        interp.send(Event::external("open"));
        poll(&interp);
        assert_eq!(interp.configuration().unwrap(), vec!["open"]);
        poll(&interp);
        assert_eq!(interp.configuration().unwrap(), vec!["closed"]);
        poll(&interp);
        assert!(holds(&interp, "opened == 2"));

        // Unmatched events are consumed without a transition.
        interp.send(Event::external("knock"));
        poll(&interp);
        assert_eq!(interp.configuration().unwrap(), vec!["open"]);
    }

    #[test]
    fn test_top_level_final_finishes_session() {
        let interp = interpreter(door());
        poll(&interp);
        interp.send(Event::external("open"));
        interp.send(Event::external("lock"));
        poll(&interp);
        assert_eq!(poll(&interp), InterpreterState::Finished);
        assert!(interp.configuration().unwrap().is_empty());
        assert!(matches!(
            interp.step(Some(Duration::ZERO)),
            Err(InterpreterError::Terminated {
                state: InterpreterState::Finished
            })
        ));
    }

    #[test]
    fn test_internal_events_run_before_next_external() {
        let interp = interpreter(json!({
            "states": [
                {"id": "s0", "transitions": [{
                    "event": "go",
                    "target": "s1",
                    "actions": [{"kind": "raise", "event": "inner"}]
                }]},
                {"id": "s1", "transitions": [
                    {"event": "inner", "target": "s2"},
                    {"event": "next", "target": "s3"}
                ]},
                {"id": "s2"},
                {"id": "s3"}
            ]
        }));
        poll(&interp);
        interp.send(Event::external("go"));
        interp.send(Event::external("next"));
        poll(&interp);
        assert_eq!(interp.configuration().unwrap(), vec!["s2"]);
    }

    #[test]
    fn test_eventless_transitions_settle() {
        let interp = interpreter(json!({
            "data": [{"id": "n", "expr": "0"}],
            "states": [
                {"id": "count", "transitions": [
                    {"cond": "n < 3", "target": "count", "actions": [
                        {"kind": "script", "source": "n = n + 1"}
                    ]},
                    {"cond": "n == 3", "target": "stop"}
                ]},
                {"id": "stop"}
            ]
        }));
        assert_eq!(poll(&interp), InterpreterState::Stable);
        assert_eq!(interp.configuration().unwrap(), vec!["stop"]);
        assert!(holds(&interp, "n == 3"));
    }

    #[test]
    fn test_microstep_limit() {
        let config = InterpreterConfig::new().with_max_microsteps(10);
        let doc = json!({
            "states": [{"id": "spin", "transitions": [{"target": "spin"}]}]
        });
        let interp = Interpreter::from_json(&doc.to_string(), config).unwrap();
        assert!(matches!(
            interp.step(Some(Duration::ZERO)),
            Err(InterpreterError::MicrostepLimit { limit: 10 })
        ));
        assert_eq!(interp.state(), InterpreterState::Stable);
    }

    #[test]
    fn test_parallel_completion_raises_done_once() {
        let counter = |state: &str, var: &str| {
            json!({"event": format!("done.state.{}", state), "actions": [
                {"kind": "script", "source": format!("{0} = {0} + 1", var)}
            ]})
        };
        let interp = interpreter(json!({
            "data": [
                {"id": "a", "expr": "0"},
                {"id": "b", "expr": "0"},
                {"id": "p", "expr": "0"}
            ],
            "states": [{
                "id": "p",
                "kind": "parallel",
                "states": [
                    {"id": "ra", "states": [
                        {"id": "a1", "transitions": [{"event": "go", "target": "a2"}]},
                        {"id": "a2", "kind": "final"}
                    ]},
                    {"id": "rb", "states": [
                        {"id": "b1", "transitions": [{"event": "go", "target": "b2"}]},
                        {"id": "b2", "kind": "final"}
                    ]}
                ],
                "transitions": [counter("ra", "a"), counter("rb", "b"), counter("p", "p")]
            }]
        }));
        poll(&interp);
        interp.send(Event::external("go"));
        poll(&interp);
        assert_eq!(
            interp.configuration().unwrap(),
            vec!["p", "ra", "a2", "rb", "b2"]
        );
        assert!(holds(&interp, "a == 1 && b == 1 && p == 1"));

        interp.send(Event::external("poke"));
        poll(&interp);
        assert!(holds(&interp, "a == 1 && b == 1 && p == 1"));
    }

    #[test]
    fn test_reentered_state_completes_again() {
        let interp = interpreter(json!({
            "data": [{"id": "n", "expr": "0"}],
            "states": [{
                "id": "s",
                "states": [
                    {"id": "w", "transitions": [{"event": "finish", "target": "f"}]},
                    {"id": "f", "kind": "final"}
                ],
                "transitions": [
                    {"event": "done.state.s", "actions": [
                        {"kind": "script", "source": "n = n + 1"}
                    ]},
                    {"event": "again", "target": "f"}
                ]
            }]
        }));
        poll(&interp);
        interp.send(Event::external("finish"));
        poll(&interp);
        assert!(holds(&interp, "n == 1"));

        // `again` exits s and enters it straight into its final child.
        interp.send(Event::external("again"));
        poll(&interp);
        assert_eq!(interp.configuration().unwrap(), vec!["s", "f"]);
        assert!(holds(&interp, "n == 2"));
    }

    #[test]
    fn test_parallel_completes_again_after_region_restarts() {
        let interp = interpreter(json!({
            "data": [{"id": "n", "expr": "0"}],
            "states": [{
                "id": "p",
                "kind": "parallel",
                "states": [
                    {"id": "ra", "states": [
                        {"id": "a1", "transitions": [{"event": "go", "target": "a2"}]},
                        {"id": "a2", "kind": "final", "transitions": [
                            {"event": "redo", "target": "a2"}
                        ]}
                    ]},
                    {"id": "rb", "states": [{"id": "b", "kind": "final"}]}
                ],
                "transitions": [{"event": "done.state.p", "actions": [
                    {"kind": "script", "source": "n = n + 1"}
                ]}]
            }]
        }));
        poll(&interp);
        interp.send(Event::external("go"));
        poll(&interp);
        assert!(holds(&interp, "n == 1"));

        interp.send(Event::external("redo"));
        poll(&interp);
        assert!(holds(&interp, "n == 2"));
    }

    #[test]
    fn test_invocations_start_after_internal_events() {
        let (interp, trace) = traced(json!({
            "states": [{
                "id": "s",
                "on_entry": [{"kind": "raise", "event": "inner"}, mark("entry")],
                "invoke": [{"type": "recorder", "id": "svc"}],
                "transitions": [{"event": "inner", "actions": [mark("inner")]}]
            }]
        }));
        poll(&interp);
        assert_eq!(*trace.lock(), vec!["entry", "inner", "invoke svc"]);
    }

    #[test]
    fn test_state_left_before_internal_events_drain_is_not_invoked() {
        let (interp, trace) = traced(json!({
            "states": [
                {
                    "id": "s",
                    "on_entry": [{"kind": "raise", "event": "leave"}],
                    "invoke": [{"type": "recorder", "id": "svc"}],
                    "transitions": [{"event": "leave", "target": "t"}]
                },
                {"id": "t"}
            ]
        }));
        poll(&interp);
        assert_eq!(interp.configuration().unwrap(), vec!["t"]);
        assert!(trace.lock().is_empty());
    }

    #[test]
    fn test_done_data_of_final_child() {
        let interp = interpreter(json!({
            "data": [{"id": "got", "expr": "0"}],
            "states": [
                {"id": "job", "states": [
                    {"id": "work", "transitions": [{"event": "finish", "target": "end"}]},
                    {"id": "end", "kind": "final", "done_data": {
                        "params": [{"name": "code", "expr": "7"}]
                    }}
                ], "transitions": [{"event": "done.state.job", "target": "after", "actions": [
                    {"kind": "script", "source": "got = _event.data.code"}
                ]}]},
                {"id": "after"}
            ]
        }));
        poll(&interp);
        interp.send(Event::external("finish"));
        poll(&interp);
        assert_eq!(interp.configuration().unwrap(), vec!["after"]);
        assert!(holds(&interp, "got == 7"));
    }

    #[test]
    fn test_failed_guard_raises_error_execution() {
        let interp = interpreter(json!({
            "states": [
                {"id": "s", "transitions": [
                    {"event": "go", "cond": "missing +", "target": "bad"},
                    {"event": "error.execution", "target": "failed"}
                ]},
                {"id": "bad"},
                {"id": "failed"}
            ]
        }));
        poll(&interp);
        interp.send(Event::external("go"));
        poll(&interp);
        assert_eq!(interp.configuration().unwrap(), vec!["failed"]);
    }

    #[test]
    fn test_late_binding_initializes_on_entry() {
        let interp = interpreter(json!({
            "binding": "late",
            "data": [{"id": "top", "expr": "1"}],
            "states": [
                {"id": "a", "transitions": [{"event": "go", "target": "b"}]},
                {"id": "b", "data": [{"id": "inner", "expr": "top + 1"}]}
            ]
        }));
        poll(&interp);
        assert!(interp
            .with_datamodel(|dm| dm.binding("inner").is_none())
            .unwrap());
        interp.send(Event::external("go"));
        poll(&interp);
        assert!(holds(&interp, "inner == 2"));
    }

    #[test]
    fn test_initial_data_overrides_declarations() {
        let config = InterpreterConfig::new()
            .with_initial_data(Data::from_json(&json!({"opened": 10})));
        let interp = Interpreter::from_json(&door().to_string(), config).unwrap();
        poll(&interp);
        assert!(holds(&interp, "opened == 10"));
    }

    #[test]
    fn test_delayed_send_delivered_by_waiting_step() {
        let interp = interpreter(json!({
            "states": [
                {"id": "waiting",
                 "on_entry": [{"kind": "send", "event": "tick", "delay": "20ms"}],
                 "transitions": [{"event": "tick", "target": "ticked"}]},
                {"id": "ticked"}
            ]
        }));
        poll(&interp);
        assert_eq!(interp.configuration().unwrap(), vec!["waiting"]);
        interp.step(Some(Duration::from_secs(2))).unwrap();
        assert_eq!(interp.configuration().unwrap(), vec!["ticked"]);
    }

    #[test]
    fn test_cancel() {
        let sessions = Arc::new(SessionRegistry::new());
        let config = InterpreterConfig::new()
            .with_session_id("door-1")
            .with_sessions(Arc::clone(&sessions));
        let interp = Interpreter::from_json(&door().to_string(), config).unwrap();
        poll(&interp);
        assert!(sessions.contains("door-1"));

        interp.cancel();
        assert_eq!(interp.state(), InterpreterState::Cancelled);
        assert!(interp.configuration().unwrap().is_empty());
        assert!(!sessions.contains("door-1"));
        assert!(matches!(
            interp.step(None),
            Err(InterpreterError::Terminated { .. })
        ));
    }

    #[test]
    fn test_cancel_exits_deepest_first() {
        let (interp, trace) = traced(json!({
            "states": [{
                "id": "outer",
                "on_exit": [mark("outer")],
                "states": [{
                    "id": "mid",
                    "on_exit": [mark("mid")],
                    "states": [{
                        "id": "leaf",
                        "on_exit": [mark("leaf")],
                        "invoke": [{"type": "recorder", "id": "svc"}]
                    }]
                }]
            }]
        }));
        poll(&interp);
        assert_eq!(*trace.lock(), vec!["invoke svc"]);
        trace.lock().clear();

        interp.cancel();
        assert_eq!(*trace.lock(), vec!["uninvoke", "leaf", "mid", "outer"]);
        assert_eq!(interp.state(), InterpreterState::Cancelled);
    }

    #[test]
    fn test_cancel_wakes_waiting_step() {
        let interp = Arc::new(interpreter(door()));
        poll(&interp);

        let runner = {
            let interp = Arc::clone(&interp);
            std::thread::spawn(move || interp.step(None))
        };
        std::thread::sleep(Duration::from_millis(50));
        interp.cancel();

        let result = runner.join().unwrap().unwrap();
        assert_eq!(result, InterpreterState::Cancelled);
    }

    #[test]
    fn test_reset_restarts_session() {
        let interp = interpreter(door());
        poll(&interp);
        interp.send(Event::external("open"));
        poll(&interp);
        interp.send(Event::external("close"));

        interp.reset().unwrap();
        assert_eq!(interp.state(), InterpreterState::Instantiated);
        assert!(interp.configuration().unwrap().is_empty());

        poll(&interp);
        assert_eq!(interp.configuration().unwrap(), vec!["closed"]);
        assert!(holds(&interp, "opened == 0"));
        poll(&interp);
        assert_eq!(interp.configuration().unwrap(), vec!["closed"]);
    }

    #[test]
    fn test_serialize_and_resume() {
        let interp = interpreter(door());
        poll(&interp);
        interp.send(Event::external("open"));
        poll(&interp);
        interp.send(Event::external("close"));

        let snapshot = interp.serialize().unwrap();
        assert_eq!(snapshot.configuration, vec!["open"]);
        assert_eq!(snapshot.external_queue.len(), 1);

        let resumed = interpreter(door());
        resumed.deserialize(&snapshot).unwrap();
        assert_eq!(resumed.state(), InterpreterState::Stable);
        assert_eq!(resumed.configuration().unwrap(), vec!["open"]);
        assert!(holds(&resumed, "opened == 1"));

        let again = resumed.serialize().unwrap();
        assert_eq!(again.configuration, snapshot.configuration);
        assert_eq!(again.datamodel, snapshot.datamodel);
        assert_eq!(again.external_queue, snapshot.external_queue);

        poll(&resumed);
        assert_eq!(resumed.configuration().unwrap(), vec!["closed"]);
    }

    #[test]
    fn test_deserialize_rejects_other_document() {
        let interp = interpreter(door());
        poll(&interp);
        let mut snapshot = interp.serialize().unwrap();
        snapshot.checksum = "deadbeef".to_string();
        assert!(matches!(
            interp.deserialize(&snapshot),
            Err(InterpreterError::SnapshotMismatch { .. })
        ));

        let mut snapshot = interp.serialize().unwrap();
        snapshot.configuration = vec!["nowhere".to_string()];
        assert!(matches!(
            interp.deserialize(&snapshot),
            Err(InterpreterError::SnapshotMismatch { .. })
        ));
        assert_eq!(interp.configuration().unwrap(), vec!["closed"]);
    }

    #[test]
    fn test_send_between_registered_sessions() {
        let sessions = Arc::new(SessionRegistry::new());
        let config = |id: &str| {
            InterpreterConfig::new()
                .with_session_id(id)
                .with_sessions(Arc::clone(&sessions))
        };
        let ping = json!({
            "states": [{"id": "idle", "transitions": [{"event": "ping", "actions": [
                {"kind": "send", "event": "pong", "target": "#_scxml_b"}
            ]}]}]
        });
        let pong = json!({
            "states": [
                {"id": "waiting", "transitions": [{"event": "pong", "target": "got"}]},
                {"id": "got"}
            ]
        });
        let a = Interpreter::from_json(&ping.to_string(), config("a")).unwrap();
        let b = Interpreter::from_json(&pong.to_string(), config("b")).unwrap();
        poll(&a);
        poll(&b);

        a.send(Event::external("ping"));
        poll(&a);
        poll(&b);
        assert_eq!(b.configuration().unwrap(), vec!["got"]);
    }

    #[test]
    fn test_nested_session_reports_done() {
        let child = json!({
            "states": [
                {"id": "c0", "transitions": [{"target": "end"}]},
                {"id": "end", "kind": "final", "done_data": {"content": {"result": 42}}}
            ]
        });
        let interp = interpreter(json!({
            "data": [{"id": "result", "expr": "0"}],
            "states": [
                {"id": "waiting",
                 "invoke": [{"type": "scxml", "id": "child", "content": child}],
                 "transitions": [{"event": "done.invoke.child", "target": "complete", "actions": [
                     {"kind": "script", "source": "result = _event.data.result"}
                 ]}]},
                {"id": "complete"}
            ]
        }));
        poll(&interp);
        assert!(step_until_active(&interp, "complete"));
        assert!(holds(&interp, "result == 42"));
    }
}
