//! ADI-State: execution record persistence for the ADI agent engine
//!
//! This crate owns the single cross-process source of truth for agent runs:
//! one [`ExecutionRecord`] per (evaluation, agent) run, moved through a strict
//! one-way state machine.
//!
//! ## Layer 0 - Data/Persistence
//!
//! Focus: monotonic transitions, writer-of-record semantics, and backends that
//! may only become visible to readers after a delay.
//!
//! ## Key Components
//!
//! - `ExecutionStore`: backend-agnostic async store trait
//! - `MemoryExecutionStore` / `LaggedExecutionStore`: in-process adapters
//! - `SurrealExecutionStore`: SurrealDB-backed adapter

mod error;
pub mod fakes;
mod migrations;
pub mod storage_traits;
pub mod surreal_store;

pub use error::StorageError;
pub use fakes::{LaggedExecutionStore, MemoryExecutionStore};
pub use storage_traits::{
    ExecutionId, ExecutionRecord, ExecutionStatus, ExecutionStore, StorageResult, Transition,
};
pub use surreal_store::SurrealExecutionStore;
