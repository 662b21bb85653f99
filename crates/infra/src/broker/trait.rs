use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use callpipe_core::{JobId, QueueMessage, Stage};

/// A message that was removed from its live queue after giving up on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub message: QueueMessage,
    pub reason: String,
    pub dead_lettered_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn new(message: QueueMessage, reason: impl Into<String>) -> Self {
        Self {
            message,
            reason: reason.into(),
            dead_lettered_at: Utc::now(),
        }
    }
}

/// Queue broker operation error.
///
/// A stale lease is *not* an error: acking or nacking a message whose lease
/// has expired and been handed to someone else is a silent no-op.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker connection error: {0}")]
    Connection(String),

    #[error("broker command error: {0}")]
    Command(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("message has no lease: {0}")]
    NotLeased(String),

    #[error("broker lock poisoned")]
    Poisoned,
}

/// Durable per-stage FIFO queues with visibility-timeout leases.
///
/// ## Delivery
///
/// Delivery is at-least-once. A leased message is hidden from other
/// consumers until it is acked, nacked, or its visibility timeout lapses,
/// at which point it becomes leasable again with `attempt + 1`.
///
/// ## Leases
///
/// Every `lease()` stamps a fresh `lease_id` on the returned message.
/// `ack`, `nack` and `dead_letter` only take effect when the caller's
/// `lease_id` is still the current one.
pub trait QueueBroker: Send + Sync {
    /// Append a fresh message for `job_id` to `stage`'s queue.
    fn enqueue(&self, stage: Stage, job_id: JobId) -> Result<QueueMessage, BrokerError>;

    /// Take the oldest visible message from `stage`, hiding it for `visibility_timeout`.
    fn lease(
        &self,
        stage: Stage,
        visibility_timeout: Duration,
    ) -> Result<Option<QueueMessage>, BrokerError>;

    /// Permanently remove a leased message.
    fn ack(&self, message: &QueueMessage) -> Result<(), BrokerError>;

    /// Release a leased message, making it visible again after `delay`.
    fn nack(&self, message: &QueueMessage, delay: Duration) -> Result<(), BrokerError>;

    /// Remove a leased message from its live queue and park it in the stage's dead-letter list.
    fn dead_letter(&self, message: &QueueMessage, reason: &str) -> Result<(), BrokerError>;

    /// Dead-lettered messages for `stage`, oldest first.
    fn dead_letters(&self, stage: Stage) -> Result<Vec<DeadLetter>, BrokerError>;

    /// Messages currently in `stage`'s live queue, leased or not.
    fn depth(&self, stage: Stage) -> Result<usize, BrokerError>;
}

impl<B> QueueBroker for Arc<B>
where
    B: QueueBroker + ?Sized,
{
    fn enqueue(&self, stage: Stage, job_id: JobId) -> Result<QueueMessage, BrokerError> {
        (**self).enqueue(stage, job_id)
    }

    fn lease(
        &self,
        stage: Stage,
        visibility_timeout: Duration,
    ) -> Result<Option<QueueMessage>, BrokerError> {
        (**self).lease(stage, visibility_timeout)
    }

    fn ack(&self, message: &QueueMessage) -> Result<(), BrokerError> {
        (**self).ack(message)
    }

    fn nack(&self, message: &QueueMessage, delay: Duration) -> Result<(), BrokerError> {
        (**self).nack(message, delay)
    }

    fn dead_letter(&self, message: &QueueMessage, reason: &str) -> Result<(), BrokerError> {
        (**self).dead_letter(message, reason)
    }

    fn dead_letters(&self, stage: Stage) -> Result<Vec<DeadLetter>, BrokerError> {
        (**self).dead_letters(stage)
    }

    fn depth(&self, stage: Stage) -> Result<usize, BrokerError> {
        (**self).depth(stage)
    }
}

/// `now + duration`, saturating at the far future.
pub(crate) fn visible_at(now: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(duration)
        .ok()
        .and_then(|offset| now.checked_add_signed(offset))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
