//! `callpipe-core`: call-processing domain building blocks.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! the job state machine, stage artifacts, queue message shape and the typed
//! contracts stage handlers implement.

pub mod artifact;
pub mod error;
pub mod handler;
pub mod id;
pub mod job;
pub mod message;
pub mod stage;
pub mod status;
pub mod version;

pub use artifact::{Channel, DialogueTurn, Insight, InsightDraft, InsightKind, Summary, TurnDraft};
pub use error::{DomainError, DomainResult};
pub use handler::{
    HandlerError, PostprocessHandler, StageHandlers, SttHandler, SummaryHandler,
};
pub use id::{DeliveryId, JobId, LeaseId};
pub use job::{AudioRef, ErrorKind, FailureDecision, Job, JobError, JobSource};
pub use message::QueueMessage;
pub use stage::Stage;
pub use status::JobStatus;
pub use version::{ExpectedVersion, Versioned};
