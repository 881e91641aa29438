//! # statecraft-core
//!
//! State-chart core for statecraft.
//!
//! This crate provides:
//! - The `Data` value model and its text encoding
//! - Events and descriptor matching
//! - Document loading and validation
//! - The expression language used by the built-in data model
//! - Microstep computation (transition selection, exit and entry sets)

pub mod codec;
pub mod data;
pub mod document;
pub mod error;
pub mod event;
pub mod expr;
pub mod microstep;

pub use data::{AtomKind, Blob, Data, NodeRef};
pub use document::{
    Action, Binding, Document, DocumentRaw, InvokeDef, Param, SendAction, StateHandle, StateKind,
    TransitionHandle,
};
pub use error::CoreError;
pub use event::{ErrorKind, Event, EventType};
pub use expr::{Expr, Path, Scope, Script};
pub use microstep::{Configuration, HistoryValues, MicroStep, MicroStepPlan};
