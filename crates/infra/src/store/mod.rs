//! Durable job state and stage artifacts.
//!
//! The store is the single source of truth for where a job is; queue messages
//! are only hints that some stage may have work to do.

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::InMemoryJobStore;
pub use postgres::PostgresJobStore;
pub use r#trait::{JobFilter, JobSnapshot, JobStore, StageOutput, StoreError};
