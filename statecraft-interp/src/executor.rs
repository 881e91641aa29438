//! Executable content.
//!
//! The executor owns everything actions act upon: the data model, the
//! session's queues and timers, running invocations and I/O processors.
//! A failing action raises its platform error event into the internal queue
//! and ends the block it belongs to; the enclosing microstep goes on.

use crate::config::ParentLink;
use crate::datamodel::DataModel;
use crate::error::InterpreterError;
use crate::registry::ServiceContext;
use crate::service::{ExecutableContent, InvokeRequest, Invoker, IoProcessor, Source};
use crate::snapshot::DelayedSnapshot;
use serde::{Deserialize, Serialize};
use statecraft_core::document::{DataDecl, DoneData};
use statecraft_core::event::SCXML_EVENT_PROCESSOR;
use statecraft_core::{
    Action, Data, Event, EventType, InvokeDef, Param, SendAction, StateHandle,
};
use statecraft_queue::{DelayedEventQueue, EventQueue};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

/// Target log records of the `log` action are emitted under.
pub const LOG_TARGET: &str = "statecraft::log";

/// Type names accepted for the built-in event processor.
const SCXML_TYPE_ALIASES: [&str; 2] = [SCXML_EVENT_PROCESSOR, "scxml"];

fn is_scxml_type(send_type: &str) -> bool {
    SCXML_TYPE_ALIASES.contains(&send_type)
}

/// The queues of one session.
#[derive(Debug, Clone, Default)]
pub struct SessionQueues {
    pub internal: EventQueue,
    pub external: EventQueue,
    /// Delayed sends that must be routed by the stepping context.
    pub outbox: EventQueue,
}

/// Where a delayed send that fired into the outbox goes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelayedRoute {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    pub send_type: String,
}

/// A running invocation.
struct InvokeRegistration {
    state: StateHandle,
    index: usize,
    request: InvokeRequest,
    finalize: Vec<Action>,
    invoker: Box<dyn Invoker>,
}

/// Serializable view of a running invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct InvokeRecord {
    pub state: StateHandle,
    /// Position of the definition in the state's `invoke` list.
    pub index: usize,
    pub request: InvokeRequest,
}

/// Parses a CSS style duration: `250ms`, `1.5s`, or a bare number of
/// milliseconds.
pub fn parse_delay(text: &str) -> Result<Duration, InterpreterError> {
    let text = text.trim();
    if text.is_empty() {
        return Ok(Duration::ZERO);
    }
    let (number, millis_per_unit) = if let Some(n) = text.strip_suffix("ms") {
        (n, 1.0)
    } else if let Some(n) = text.strip_suffix('s') {
        (n, 1000.0)
    } else {
        (text, 1.0)
    };
    let value: f64 = number
        .trim()
        .parse()
        .map_err(|_| InterpreterError::execution(format!("invalid delay '{}'", text)))?;
    if !value.is_finite() || value < 0.0 {
        return Err(InterpreterError::execution(format!(
            "invalid delay '{}'",
            text
        )));
    }
    Ok(Duration::from_secs_f64(value * millis_per_unit / 1000.0))
}

fn display_value(data: &Data) -> String {
    match data {
        Data::Atom { text, .. } => text.clone(),
        Data::Undefined => "undefined".to_string(),
        other => other.to_string(),
    }
}

/// Executes action blocks for one session.
pub struct ContentExecutor {
    session_id: String,
    session_name: String,
    datamodel: Box<dyn DataModel>,
    queues: SessionQueues,
    timers: Arc<DelayedEventQueue>,
    ctx: ServiceContext,
    parent: Option<ParentLink>,
    invokes: BTreeMap<String, InvokeRegistration>,
    io_processors: BTreeMap<String, Box<dyn IoProcessor>>,
    custom: HashMap<String, Box<dyn ExecutableContent>>,
    routes: HashMap<String, DelayedRoute>,
}

impl ContentExecutor {
    pub fn new(
        session_name: impl Into<String>,
        datamodel: Box<dyn DataModel>,
        queues: SessionQueues,
        timers: Arc<DelayedEventQueue>,
        ctx: ServiceContext,
        parent: Option<ParentLink>,
    ) -> Self {
        let mut executor = Self {
            session_id: ctx.sink.session_id().to_string(),
            session_name: session_name.into(),
            datamodel,
            queues,
            timers,
            ctx,
            parent,
            invokes: BTreeMap::new(),
            io_processors: BTreeMap::new(),
            custom: HashMap::new(),
            routes: HashMap::new(),
        };
        executor.publish_system_bindings();
        executor
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Address of this session for the built-in event processor.
    pub fn origin(&self) -> String {
        format!("#_scxml_{}", self.session_id)
    }

    pub fn datamodel(&mut self) -> &mut dyn DataModel {
        self.datamodel.as_mut()
    }

    pub fn datamodel_ref(&self) -> &dyn DataModel {
        self.datamodel.as_ref()
    }

    /// Swaps in a fresh data model and republishes the system bindings.
    pub fn replace_datamodel(&mut self, datamodel: Box<dyn DataModel>) {
        self.datamodel = datamodel;
        self.publish_system_bindings();
    }

    fn publish_system_bindings(&mut self) {
        self.datamodel
            .set_system("_sessionid", Data::verbatim(self.session_id.clone()));
        self.datamodel
            .set_system("_name", Data::verbatim(self.session_name.clone()));

        let mut location = Data::compound();
        location.insert("location", Data::verbatim(self.origin()));
        let mut processors = Data::compound();
        processors.insert("scxml", location.clone());
        processors.insert(SCXML_EVENT_PROCESSOR, location);
        for name in self.ctx.registry.io_processor_names() {
            let mut entry = Data::compound();
            if let Some(at) = self
                .io_processors
                .get(&name)
                .and_then(|p| p.location(&self.session_id))
            {
                entry.insert("location", Data::verbatim(at));
            }
            processors.insert(name, entry);
        }
        self.datamodel.set_system("_ioprocessors", processors);
        self.publish_invokers();
    }

    fn publish_invokers(&mut self) {
        let invokers: Data = Data::Compound(
            self.invokes
                .iter()
                .map(|(id, reg)| (id.clone(), Data::verbatim(reg.request.invoke_type.clone())))
                .collect(),
        );
        self.datamodel.set_system("_invokers", invokers);
    }

    /// Raises the error event for `err` into the internal queue.
    pub fn raise_error(&self, err: &InterpreterError) {
        tracing::warn!(session = %self.session_id, code = err.error_code(), "{}", err);
        self.queues.internal.enqueue(err.to_event());
    }

    /// Runs a block. Returns false if an action failed and the rest of the
    /// block was skipped.
    pub fn execute_block(&mut self, actions: &[Action]) -> bool {
        match self.execute_all(actions) {
            Ok(()) => true,
            Err(e) => {
                self.raise_error(&e);
                false
            }
        }
    }

    fn execute_all(&mut self, actions: &[Action]) -> Result<(), InterpreterError> {
        for action in actions {
            self.execute(action)?;
        }
        Ok(())
    }

    /// Runs one action. Failures inside nested blocks propagate.
    pub fn execute(&mut self, action: &Action) -> Result<(), InterpreterError> {
        match action {
            Action::Raise { event } => {
                self.queues.internal.enqueue(Event::internal(event.clone()));
                Ok(())
            }
            Action::Assign {
                location,
                expr,
                content,
                mode,
            } => {
                let value = match (expr, content) {
                    (Some(expr), _) => self.datamodel.eval_as_data(expr)?,
                    (None, Some(content)) => Data::from_json(content),
                    (None, None) => Data::Undefined,
                };
                let mut attrs = BTreeMap::new();
                if let Some(mode) = mode {
                    attrs.insert("mode".to_string(), mode.clone());
                }
                self.datamodel.assign(location, value, &attrs)?;
                Ok(())
            }
            Action::Send(send) => self.send(send),
            Action::Cancel { sendid, sendidexpr } => {
                let id = match (sendid, sendidexpr) {
                    (Some(id), _) => id.clone(),
                    (None, Some(expr)) => self.eval_string(expr)?,
                    (None, None) => {
                        return Err(InterpreterError::execution("cancel without a send id"))
                    }
                };
                self.cancel_send(&id);
                Ok(())
            }
            Action::Script { source } => {
                self.datamodel.eval(source)?;
                Ok(())
            }
            Action::Log { label, expr } => {
                let value = match expr {
                    Some(expr) => display_value(&self.datamodel.eval_as_data(expr)?),
                    None => String::new(),
                };
                tracing::info!(
                    target: LOG_TARGET,
                    session = %self.session_id,
                    label = label.as_deref().unwrap_or(""),
                    "{}",
                    value
                );
                Ok(())
            }
            Action::If { branches } => {
                for branch in branches {
                    let taken = match &branch.cond {
                        None => true,
                        Some(cond) => self.datamodel.eval_as_bool(cond)?,
                    };
                    if taken {
                        return self.execute_all(&branch.actions);
                    }
                }
                Ok(())
            }
            Action::Foreach {
                array,
                item,
                index,
                actions,
            } => {
                let saved_item = self.datamodel.binding(item);
                let saved_index = index.as_ref().map(|i| self.datamodel.binding(i));

                let result = self.foreach(array, item, index.as_deref(), actions);

                self.datamodel.restore_binding(item, saved_item);
                if let (Some(index), Some(saved)) = (index, saved_index) {
                    self.datamodel.restore_binding(index, saved);
                }
                result
            }
            Action::Custom {
                name,
                attrs,
                content,
            } => {
                if !self.custom.contains_key(name) {
                    let created = self.ctx.registry.create_executable_content(name, &self.ctx)?;
                    self.custom.insert(name.clone(), created);
                }
                let Some(handler) = self.custom.get_mut(name) else {
                    return Ok(());
                };
                handler.execute(
                    attrs,
                    content.as_ref(),
                    self.datamodel.as_mut(),
                    &self.ctx.sink,
                )
            }
        }
    }

    fn foreach(
        &mut self,
        array: &str,
        item: &str,
        index: Option<&str>,
        actions: &[Action],
    ) -> Result<(), InterpreterError> {
        let len = self.datamodel.get_length(array)?;
        for iteration in 0..len {
            self.datamodel.set_foreach(item, array, index, iteration)?;
            self.execute_all(actions)?;
        }
        Ok(())
    }

    fn eval_string(&mut self, expr: &str) -> Result<String, InterpreterError> {
        Ok(display_value(&self.datamodel.eval_as_data(expr)?))
    }

    fn eval_params(&mut self, params: &[Param]) -> Result<Vec<(String, Data)>, InterpreterError> {
        let mut values = Vec::with_capacity(params.len());
        for param in params {
            let value = match (&param.expr, &param.location) {
                (Some(expr), _) => self.datamodel.eval_as_data(expr)?,
                (None, Some(location)) => self.datamodel.eval_as_data(location)?,
                (None, None) => Data::Undefined,
            };
            values.push((param.name.clone(), value));
        }
        Ok(values)
    }

    fn eval_namelist(&mut self, names: &[String]) -> Result<Vec<(String, Data)>, InterpreterError> {
        let mut values = Vec::with_capacity(names.len());
        for name in names {
            values.push((name.clone(), self.datamodel.eval_as_data(name)?));
        }
        Ok(values)
    }

    fn eval_content(
        &mut self,
        content: &Option<serde_json::Value>,
        contentexpr: &Option<String>,
    ) -> Result<Data, InterpreterError> {
        Ok(match (content, contentexpr) {
            (Some(serde_json::Value::String(text)), _) => self.datamodel.get_as_data(text)?,
            (Some(content), _) => Data::from_json(content),
            (None, Some(expr)) => self.datamodel.eval_as_data(expr)?,
            (None, None) => Data::Undefined,
        })
    }

    fn send(&mut self, send: &SendAction) -> Result<(), InterpreterError> {
        let send_type = match (&send.send_type, &send.typeexpr) {
            (Some(t), _) => t.clone(),
            (None, Some(expr)) => self.eval_string(expr)?,
            (None, None) => SCXML_EVENT_PROCESSOR.to_string(),
        };
        let scxml = is_scxml_type(&send_type);
        if !scxml && !self.ctx.registry.has_io_processor(&send_type) {
            return Err(InterpreterError::execution(format!(
                "unsupported send type '{}'",
                send_type
            )));
        }

        let name = match (&send.event, &send.eventexpr) {
            (Some(name), _) => name.clone(),
            (None, Some(expr)) => self.eval_string(expr)?,
            (None, None) if scxml => {
                return Err(InterpreterError::execution("send without an event name"))
            }
            (None, None) => String::new(),
        };
        let target = match (&send.target, &send.targetexpr) {
            (Some(t), _) => Some(t.clone()),
            (None, Some(expr)) => Some(self.eval_string(expr)?),
            (None, None) => None,
        };
        let delay = match (&send.delay, &send.delayexpr) {
            (Some(d), _) => parse_delay(d)?,
            (None, Some(expr)) => {
                let text = self.eval_string(expr)?;
                parse_delay(&text)?
            }
            (None, None) => Duration::ZERO,
        };

        let (send_id, hide_send_id) = match (&send.id, &send.idlocation) {
            (Some(id), _) => (id.clone(), false),
            (None, location) => {
                let id = format!("send.{}", uuid::Uuid::new_v4().simple());
                if let Some(location) = location {
                    self.datamodel
                        .assign(location, Data::verbatim(id.clone()), &BTreeMap::new())?;
                }
                (id, location.is_none())
            }
        };

        let mut event = Event::external(name);
        event.send_id = Some(send_id.clone());
        event.hide_send_id = hide_send_id;
        event.origin = Some(self.origin());
        event.origin_type = Some(if scxml {
            SCXML_EVENT_PROCESSOR.to_string()
        } else {
            send_type.clone()
        });
        event.namelist = self.eval_namelist(&send.namelist)?;
        event.params = self.eval_params(&send.params)?;
        event.data = self.eval_content(&send.content, &send.contentexpr)?;

        let internal_target = target.as_deref() == Some("#_internal");
        if delay.is_zero() {
            return self.deliver(target.as_deref(), &send_type, event);
        }
        if internal_target {
            return Err(InterpreterError::execution(
                "delayed sends to #_internal are not allowed",
            ));
        }

        tracing::debug!(
            session = %self.session_id,
            send_id = %send_id,
            delay_ms = delay.as_millis() as u64,
            "delayed send"
        );
        if scxml && target.is_none() {
            self.timers
                .enqueue_delayed(send_id, event, delay, &self.queues.external);
        } else {
            self.routes
                .insert(send_id.clone(), DelayedRoute { target, send_type });
            self.timers.enqueue_delayed_notify(
                send_id,
                event,
                delay,
                &self.queues.outbox,
                &self.queues.external,
            );
        }
        Ok(())
    }

    /// Delivers an event right away.
    fn deliver(
        &mut self,
        target: Option<&str>,
        send_type: &str,
        mut event: Event,
    ) -> Result<(), InterpreterError> {
        let send_id = event.send_id.clone();
        let undeliverable = |target: &str, reason: &str| {
            InterpreterError::communication(target, reason, send_id.clone())
        };

        if !is_scxml_type(send_type) {
            if !self.io_processors.contains_key(send_type) {
                let created = self.ctx.registry.create_io_processor(send_type, &self.ctx)?;
                self.io_processors.insert(send_type.to_string(), created);
            }
            let Some(processor) = self.io_processors.get_mut(send_type) else {
                return Ok(());
            };
            return processor
                .send(target, event)
                .map_err(|e| undeliverable(target.unwrap_or(send_type), &e.to_string()));
        }

        match target {
            None => {
                self.queues.external.enqueue(event);
                Ok(())
            }
            Some("#_internal") => {
                event.event_type = EventType::Internal;
                self.queues.internal.enqueue(event);
                Ok(())
            }
            Some("#_parent") => {
                let parent = self
                    .parent
                    .as_ref()
                    .ok_or_else(|| undeliverable("#_parent", "session has no parent"))?;
                parent.sink.event_to_session(
                    event,
                    Source::Invoke {
                        invoke_type: &parent.invoke_type,
                        invoke_id: &parent.invoke_id,
                    },
                    false,
                );
                Ok(())
            }
            Some(t) if t.starts_with("#_scxml_") => {
                let session_id = &t["#_scxml_".len()..];
                if session_id == self.session_id {
                    self.queues.external.enqueue(event);
                    return Ok(());
                }
                let sink = self
                    .ctx
                    .sessions
                    .as_ref()
                    .and_then(|sessions| sessions.lookup(session_id))
                    .ok_or_else(|| undeliverable(t, "no such session"))?;
                let origin = self.origin();
                sink.event_to_session(
                    event,
                    Source::IoProcessor {
                        io_type: SCXML_EVENT_PROCESSOR,
                        origin: &origin,
                    },
                    false,
                );
                Ok(())
            }
            Some(t) if t.starts_with("#_") => {
                let invoke_id = &t[2..];
                let registration = self
                    .invokes
                    .get_mut(invoke_id)
                    .ok_or_else(|| undeliverable(t, "no such invocation"))?;
                registration
                    .invoker
                    .send(event)
                    .map_err(|e| undeliverable(t, &e.to_string()))
            }
            Some(t) => Err(undeliverable(t, "unknown target")),
        }
    }

    /// Cancels a pending delayed send. Unknown ids are ignored.
    pub fn cancel_send(&mut self, send_id: &str) {
        self.routes.remove(send_id);
        if self.timers.cancel_delayed(send_id) {
            tracing::debug!(session = %self.session_id, send_id = %send_id, "delayed send cancelled");
        }
    }

    pub fn cancel_all_sends(&mut self) {
        self.timers.cancel_all_delayed();
        self.routes.clear();
    }

    /// Routes delayed sends that fired into the outbox.
    pub fn route_outbox(&mut self) {
        while let Some(event) = self.queues.outbox.try_dequeue() {
            let route = event
                .send_id
                .as_ref()
                .and_then(|id| self.routes.remove(id));
            let Some(route) = route else {
                tracing::debug!(event = %event.name, "dropping unroutable outbox event");
                continue;
            };
            if let Err(e) = self.deliver(route.target.as_deref(), &route.send_type, event) {
                self.raise_error(&e);
            }
        }
    }

    /// Routes of delayed sends that already fired into the outbox.
    pub fn outbox_routes(&self, outbox: &[Event]) -> BTreeMap<String, DelayedRoute> {
        outbox
            .iter()
            .filter_map(|event| event.send_id.as_ref())
            .filter_map(|id| self.routes.get(id).map(|route| (id.clone(), route.clone())))
            .collect()
    }

    /// Pending delayed sends, soonest first.
    pub fn delayed_snapshot(&self) -> Vec<DelayedSnapshot> {
        self.timers
            .pending()
            .into_iter()
            .map(|pending| {
                let route = if pending.target.same_queue(&self.queues.outbox) {
                    self.routes.get(&pending.id).cloned()
                } else {
                    None
                };
                DelayedSnapshot {
                    id: pending.id,
                    event: pending.event,
                    remaining_ms: pending.remaining.as_millis() as u64,
                    route,
                }
            })
            .collect()
    }

    /// Replaces all routes and pending delayed sends.
    pub fn restore_delayed(
        &mut self,
        outbox_routes: &BTreeMap<String, DelayedRoute>,
        delayed: &[DelayedSnapshot],
    ) {
        self.cancel_all_sends();
        self.routes = outbox_routes
            .iter()
            .map(|(id, route)| (id.clone(), route.clone()))
            .collect();
        for entry in delayed {
            let delay = Duration::from_millis(entry.remaining_ms);
            match &entry.route {
                None => self.timers.enqueue_delayed(
                    entry.id.clone(),
                    entry.event.clone(),
                    delay,
                    &self.queues.external,
                ),
                Some(route) => {
                    self.routes.insert(entry.id.clone(), route.clone());
                    self.timers.enqueue_delayed_notify(
                        entry.id.clone(),
                        entry.event.clone(),
                        delay,
                        &self.queues.outbox,
                        &self.queues.external,
                    );
                }
            }
        }
    }

    /// Replaces the data model with a fresh one of the given type.
    pub fn reset_datamodel(&mut self, name: &str) -> Result<(), InterpreterError> {
        let datamodel = self.ctx.registry.create_data_model(name, &self.ctx)?;
        self.replace_datamodel(datamodel);
        Ok(())
    }

    /// Declares `data` items. Values in `overrides` win over the declared
    /// expressions; a failing expression binds the item to undefined.
    pub fn init_data(&mut self, decls: &[DataDecl], overrides: &Data) {
        for decl in decls {
            let value = match overrides.get(&decl.id) {
                Some(value) => Ok(value.clone()),
                None => match (&decl.expr, &decl.content) {
                    (Some(expr), _) => self.datamodel.eval_as_data(expr).map_err(Into::into),
                    (None, Some(content)) => self.eval_content(&Some(content.clone()), &None),
                    (None, None) => Ok(Data::Undefined),
                },
            };
            let value = value.unwrap_or_else(|e: InterpreterError| {
                self.raise_error(&e);
                Data::Undefined
            });
            if let Err(e) = self.datamodel.declare(&decl.id, value) {
                self.raise_error(&e.into());
            }
        }
    }

    /// Runs the document level script.
    pub fn run_script(&mut self, source: &str) {
        if let Err(e) = self.datamodel.eval(source) {
            self.raise_error(&e.into());
        }
    }

    /// Evaluates a transition condition; failures count as false.
    pub fn eval_cond(&mut self, cond: &str) -> bool {
        match self.datamodel.eval_as_bool(cond) {
            Ok(value) => value,
            Err(e) => {
                self.raise_error(&e.into());
                false
            }
        }
    }

    /// Payload of a `done.state` event.
    pub fn done_data(&mut self, done: &DoneData) -> Data {
        let result = if done.content.is_some() || done.contentexpr.is_some() {
            self.eval_content(&done.content, &done.contentexpr)
        } else {
            self.eval_params(&done.params).map(|params| {
                if params.is_empty() {
                    Data::Undefined
                } else {
                    Data::Compound(params.into_iter().collect())
                }
            })
        };
        result.unwrap_or_else(|e| {
            self.raise_error(&e);
            Data::Undefined
        })
    }

    /// Starts an invocation declared on `state`. Failures raise
    /// `error.execution`.
    pub fn invoke(&mut self, state: StateHandle, state_id: &str, index: usize, def: &InvokeDef) {
        if let Err(e) = self.start_invoke(state, state_id, index, def) {
            self.raise_error(&e);
        }
    }

    fn start_invoke(
        &mut self,
        state: StateHandle,
        state_id: &str,
        index: usize,
        def: &InvokeDef,
    ) -> Result<(), InterpreterError> {
        let invoke_type = match (&def.invoke_type, &def.typeexpr) {
            (Some(t), _) => t.clone(),
            (None, Some(expr)) => self.eval_string(expr)?,
            (None, None) => "scxml".to_string(),
        };
        let invoke_id = match &def.id {
            Some(id) => id.clone(),
            None => {
                let id = format!("{}.{}", state_id, uuid::Uuid::new_v4().simple());
                if let Some(location) = &def.idlocation {
                    self.datamodel
                        .assign(location, Data::verbatim(id.clone()), &BTreeMap::new())?;
                }
                id
            }
        };
        let src = match (&def.src, &def.srcexpr) {
            (Some(src), _) => Some(src.clone()),
            (None, Some(expr)) => Some(self.eval_string(expr)?),
            (None, None) => None,
        };

        let request = InvokeRequest {
            invoke_id,
            invoke_type,
            src,
            params: self.eval_params(&def.params)?,
            namelist: self.eval_namelist(&def.namelist)?,
            content: self.eval_content(&def.content, &def.contentexpr)?,
            autoforward: def.autoforward,
        };
        self.start_request(state, index, request, def.finalize.clone())
    }

    /// Starts an invocation from a complete request.
    pub fn start_request(
        &mut self,
        state: StateHandle,
        index: usize,
        request: InvokeRequest,
        finalize: Vec<Action>,
    ) -> Result<(), InterpreterError> {
        if self.invokes.contains_key(&request.invoke_id) {
            return Err(InterpreterError::execution(format!(
                "invocation '{}' is already running",
                request.invoke_id
            )));
        }
        let mut invoker = self
            .ctx
            .registry
            .create_invoker(&request.invoke_type, &self.ctx)?;
        invoker.invoke(&request)?;

        tracing::info!(
            session = %self.session_id,
            invoke_id = %request.invoke_id,
            invoke_type = %request.invoke_type,
            "invoked"
        );
        self.invokes.insert(
            request.invoke_id.clone(),
            InvokeRegistration {
                state,
                index,
                request,
                finalize,
                invoker,
            },
        );
        self.publish_invokers();
        Ok(())
    }

    pub fn has_invoke(&self, invoke_id: &str) -> bool {
        self.invokes.contains_key(invoke_id)
    }

    pub fn uninvoke(&mut self, invoke_id: &str) {
        if let Some(mut registration) = self.invokes.remove(invoke_id) {
            registration.invoker.uninvoke();
            tracing::info!(session = %self.session_id, invoke_id = %invoke_id, "uninvoked");
            self.publish_invokers();
        }
    }

    /// Stops the invocations started by `state`.
    pub fn uninvoke_state(&mut self, state: StateHandle) {
        let ids: Vec<String> = self
            .invokes
            .iter()
            .filter(|(_, reg)| reg.state == state)
            .map(|(id, _)| id.clone())
            .collect();
        for id in ids {
            self.uninvoke(&id);
        }
    }

    pub fn uninvoke_all(&mut self) {
        let ids: Vec<String> = self.invokes.keys().cloned().collect();
        for id in ids {
            self.uninvoke(&id);
        }
    }

    pub fn invoke_records(&self) -> Vec<InvokeRecord> {
        self.invokes
            .values()
            .map(|reg| InvokeRecord {
                state: reg.state,
                index: reg.index,
                request: reg.request.clone(),
            })
            .collect()
    }

    /// Runs the `finalize` block of the invocation that sent `event`, then
    /// forwards the event to every invocation with autoforward set.
    pub fn finalize_and_forward(&mut self, event: &Event) {
        let finalize = event
            .invoke_id
            .as_ref()
            .and_then(|id| self.invokes.get(id))
            .map(|reg| reg.finalize.clone())
            .unwrap_or_default();
        if !finalize.is_empty() {
            self.execute_block(&finalize);
        }

        let mut failures = Vec::new();
        for (id, reg) in self.invokes.iter_mut() {
            if !reg.request.autoforward {
                continue;
            }
            if let Err(e) = reg.invoker.send(event.clone()) {
                failures.push(InterpreterError::communication(
                    format!("#_{}", id),
                    e.to_string(),
                    None,
                ));
            }
        }
        for failure in failures {
            self.raise_error(&failure);
        }
    }

    /// Sends `done.invoke.<id>` to the invoking session, if any.
    pub fn notify_parent_done(&self, data: Data) {
        if let Some(parent) = &self.parent {
            parent.sink.event_to_session(
                Event::done_invoke(&parent.invoke_id, data),
                Source::Invoke {
                    invoke_type: &parent.invoke_type,
                    invoke_id: &parent.invoke_id,
                },
                false,
            );
        }
    }
}
