//! # statecraft-storage
//!
//! Storage layer for statecraft.
//!
//! This crate provides:
//! - Snapshot storage and retrieval for serialized sessions
//! - An index of the latest snapshot per session
//! - Snapshot policies for callers that persist periodically

pub mod error;
pub mod snapshot;

pub use error::StorageError;
pub use snapshot::{SnapshotMeta, SnapshotPolicy, SnapshotStore};
