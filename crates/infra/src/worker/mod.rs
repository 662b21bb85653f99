//! Stage workers and the thread pools that run them.

pub mod invoke;
pub mod pool;
pub mod stage_worker;

pub use invoke::{invoke_with_timeout, StageInput, StageResult};
pub use pool::{PollSettings, PoolHandle, PoolStats, StageWorkerPool};
pub use stage_worker::{DiscardReason, Outcome, StageWorker, WorkerError, WorkerSettings};
