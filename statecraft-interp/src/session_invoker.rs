//! Invoker that runs a document as a nested session on its own thread.

use crate::config::{InterpreterConfig, ParentLink};
use crate::error::InterpreterError;
use crate::interpreter::Interpreter;
use crate::registry::ServiceContext;
use crate::service::{InvokeRequest, Invoker, Source};
use statecraft_core::event::SCXML_EVENT_PROCESSOR;
use statecraft_core::{Data, Document, Event};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Invoke types handled by [`SessionInvoker`].
pub const SESSION_INVOKER_TYPES: [&str; 4] = [
    "scxml",
    "http://www.w3.org/TR/scxml/",
    "http://www.w3.org/TR/scxml",
    "statecraft",
];

/// How long the session thread waits for an event before stepping again.
const STEP_INTERVAL: Duration = Duration::from_millis(100);

/// Runs the invoked document as a child session.
///
/// The document comes from the request content, or from the file named by
/// `src` (an optional `file:` prefix is stripped). Params and namelist
/// values override the child's top-level data.
pub struct SessionInvoker {
    ctx: ServiceContext,
    child: Option<Arc<Interpreter>>,
    runner: Option<JoinHandle<()>>,
}

impl SessionInvoker {
    pub fn new(ctx: ServiceContext) -> Self {
        Self {
            ctx,
            child: None,
            runner: None,
        }
    }

    /// The running child session.
    pub fn child(&self) -> Option<&Arc<Interpreter>> {
        self.child.as_ref()
    }

    fn load(request: &InvokeRequest) -> Result<Document, InterpreterError> {
        if !request.content.is_undefined() {
            return Ok(Document::from_json(&request.content.to_json())?);
        }
        let Some(src) = &request.src else {
            return Err(InterpreterError::execution(format!(
                "invocation '{}' has neither src nor content",
                request.invoke_id
            )));
        };
        let path = src.strip_prefix("file:").unwrap_or(src);
        let text = std::fs::read_to_string(path)
            .map_err(|e| InterpreterError::execution(format!("cannot read '{}': {}", src, e)))?;
        Ok(Document::from_json_str(&text)?)
    }
}

fn initial_data(request: &InvokeRequest) -> Data {
    let mut data = Data::compound();
    for (name, value) in request.params.iter().chain(&request.namelist) {
        data.insert(name.clone(), value.clone());
    }
    data
}

fn run(child: &Interpreter) {
    loop {
        match child.step(Some(STEP_INTERVAL)) {
            Ok(state) if state.is_terminal() => break,
            Ok(_) => {}
            Err(InterpreterError::Terminated { .. }) => break,
            Err(e) => {
                tracing::warn!(session = %child.session_id(), "nested session failed: {}", e);
                child.cancel();
                break;
            }
        }
    }
    tracing::debug!(session = %child.session_id(), state = %child.state(), "nested session stopped");
}

impl Invoker for SessionInvoker {
    fn invoke(&mut self, request: &InvokeRequest) -> Result<(), InterpreterError> {
        let doc = Self::load(request)?;
        let mut config = InterpreterConfig::new()
            .with_registry(Arc::clone(&self.ctx.registry))
            .with_parent(ParentLink {
                sink: self.ctx.sink.clone(),
                invoke_id: request.invoke_id.clone(),
                invoke_type: request.invoke_type.clone(),
            })
            .with_initial_data(initial_data(request));
        if let Some(sessions) = &self.ctx.sessions {
            config = config.with_sessions(Arc::clone(sessions));
        }

        let child = Arc::new(Interpreter::new(Arc::new(doc), config)?);
        let runner = {
            let child = Arc::clone(&child);
            std::thread::Builder::new()
                .name(format!("statecraft-session-{}", child.session_id()))
                .spawn(move || run(&child))
                .map_err(|e| {
                    InterpreterError::execution(format!("cannot start session thread: {}", e))
                })?
        };

        tracing::debug!(
            parent = %self.ctx.sink.session_id(),
            session = %child.session_id(),
            invoke_id = %request.invoke_id,
            "nested session started"
        );
        self.child = Some(child);
        self.runner = Some(runner);
        Ok(())
    }

    fn uninvoke(&mut self) {
        if let Some(child) = self.child.take() {
            child.cancel();
        }
        if let Some(runner) = self.runner.take() {
            if runner.join().is_err() {
                tracing::warn!(parent = %self.ctx.sink.session_id(), "nested session thread panicked");
            }
        }
    }

    fn send(&mut self, event: Event) -> Result<(), InterpreterError> {
        let child = self
            .child
            .as_ref()
            .ok_or_else(|| InterpreterError::execution("no nested session is running"))?;
        let origin = format!("#_scxml_{}", self.ctx.sink.session_id());
        child.sink().event_to_session(
            event,
            Source::IoProcessor {
                io_type: SCXML_EVENT_PROCESSOR,
                origin: &origin,
            },
            false,
        );
        Ok(())
    }
}

impl Drop for SessionInvoker {
    fn drop(&mut self) {
        self.uninvoke();
    }
}
