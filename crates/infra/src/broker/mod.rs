//! Per-stage work queues.
//!
//! Messages name a job and a stage; the job store stays the source of truth
//! for whether the work is still wanted.

pub mod in_memory;
#[cfg(feature = "redis")]
pub mod redis;
pub mod r#trait;

pub use in_memory::InMemoryBroker;
#[cfg(feature = "redis")]
pub use self::redis::RedisBroker;
pub use r#trait::{BrokerError, DeadLetter, QueueBroker};
