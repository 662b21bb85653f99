//! Queue message shape (broker-owned, never stored in the job store).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::{DeliveryId, JobId, LeaseId};
use crate::stage::Stage;

/// A unit of work on a stage queue.
///
/// Carries only the job reference; everything else is read from the job store,
/// so a lost message can always be reconstructed from job state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueMessage {
    /// Stable across redeliveries of the same enqueued message.
    pub delivery_id: DeliveryId,
    pub job_id: JobId,
    pub stage: Stage,
    /// Number of times this message has been leased (1 on first delivery).
    pub attempt: u32,
    pub enqueued_at: DateTime<Utc>,
    pub visible_after: DateTime<Utc>,
    /// Set while the message is leased; identifies the current lease holder.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_id: Option<LeaseId>,
}

impl QueueMessage {
    /// A fresh, immediately visible message.
    pub fn new(stage: Stage, job_id: JobId) -> Self {
        let now = Utc::now();
        Self {
            delivery_id: DeliveryId::new(),
            job_id,
            stage,
            attempt: 0,
            enqueued_at: now,
            visible_after: now,
            lease_id: None,
        }
    }

    pub fn is_visible_at(&self, now: DateTime<Utc>) -> bool {
        self.visible_after <= now
    }
}
