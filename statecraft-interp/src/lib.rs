//! # statecraft-interp
//!
//! Session interpreter for statecraft.
//!
//! This crate provides:
//! - [`Interpreter`]: runs one document with run-to-completion macrosteps
//! - [`ContentExecutor`]: executable content, sends and invocations
//! - The [`DataModel`] interface with the `expr` and `null` data models
//! - Invoker, I/O processor and custom content interfaces and their
//!   [`Registry`]
//! - [`SessionSnapshot`] for suspending and resuming sessions

pub mod config;
pub mod datamodel;
pub mod error;
pub mod executor;
pub mod interpreter;
pub mod registry;
pub mod service;
pub mod session_invoker;
pub mod snapshot;

pub use config::{InterpreterConfig, ParentLink, DEFAULT_MAX_MICROSTEPS};
pub use datamodel::{DataModel, DataModelExtension, ExprDataModel, NullDataModel};
pub use error::{DataModelError, InterpreterError};
pub use executor::{parse_delay, ContentExecutor, DelayedRoute, SessionQueues};
pub use interpreter::{Interpreter, InterpreterState};
pub use registry::{
    DataModelFactory, ExecutableContentFactory, InvokerFactory, IoProcessorFactory, Registry,
    ServiceContext, SessionRegistry,
};
pub use service::{EventSink, ExecutableContent, InvokeRequest, Invoker, IoProcessor, Source};
pub use session_invoker::{SessionInvoker, SESSION_INVOKER_TYPES};
pub use snapshot::{DelayedSnapshot, InvokeSnapshot, SessionSnapshot};
