//! Persistence layer: the event history log
//!
//! This module provides:
//! - [`HistoryStore`] trait for append-only execution histories
//! - [`InMemoryHistoryStore`] for tests and embedding
//! - [`PostgresHistoryStore`] for production
//! - [`codec`] for turning commands into events and checking replays

pub mod codec;
mod memory;
mod postgres;
mod store;

pub use memory::InMemoryHistoryStore;
pub use postgres::PostgresHistoryStore;
pub use store::{
    EventRecord, ExecutionId, ExecutionInfo, ExecutionStatus, HistoryStore, NewEvent,
    NewExecution, StoreError,
};
