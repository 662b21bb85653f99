//! Orchestration core: queues, job store, stage workers and the pieces around them.

pub mod broker;
pub mod config;
pub mod dispatcher;
pub mod pipeline;
pub mod projection;
pub mod reconcile;
pub mod retry;
pub mod storage;
pub mod store;
pub mod worker;


pub use broker::{BrokerError, DeadLetter, InMemoryBroker, QueueBroker};
pub use config::{ConfigError, PipelineConfig, StageSettings};
pub use dispatcher::{DispatchError, Dispatcher};
pub use pipeline::Pipeline;
pub use projection::{JobSummaryView, JobView, StatusProjection};
pub use reconcile::{ReconcileError, Reconciler, SweepReport};
pub use retry::{BackoffStrategy, RetryPolicy};
pub use storage::{AcceptAllStorage, AudioStorage, LocalDirStorage, StorageError};
pub use store::{InMemoryJobStore, JobFilter, JobStore, PostgresJobStore, StageOutput, StoreError};
pub use worker::{
    DiscardReason, Outcome, PollSettings, PoolHandle, PoolStats, StageWorker, StageWorkerPool,
    WorkerError, WorkerSettings,
};
