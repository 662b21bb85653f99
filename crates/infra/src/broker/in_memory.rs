use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use tracing::debug;

use callpipe_core::{JobId, LeaseId, QueueMessage, Stage};

use super::r#trait::{visible_at, BrokerError, DeadLetter, QueueBroker};

#[derive(Debug, Default)]
struct StageQueue {
    /// Live messages in enqueue order.
    messages: Vec<QueueMessage>,
    dead: Vec<DeadLetter>,
}

impl StageQueue {
    /// Index of the message if `lease_id` still owns it.
    fn position_for_lease(&self, message: &QueueMessage) -> Option<usize> {
        let lease_id = message.lease_id?;
        self.messages.iter().position(|m| {
            m.delivery_id == message.delivery_id && m.lease_id == Some(lease_id)
        })
    }
}

/// In-memory queue broker.
///
/// Intended for tests/dev. Leasing scans the stage queue linearly.
#[derive(Debug, Default)]
pub struct InMemoryBroker {
    queues: Mutex<HashMap<Stage, StageQueue>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_queue<T>(
        &self,
        stage: Stage,
        f: impl FnOnce(&mut StageQueue) -> T,
    ) -> Result<T, BrokerError> {
        let mut queues = self.queues.lock().map_err(|_| BrokerError::Poisoned)?;
        Ok(f(queues.entry(stage).or_default()))
    }

    /// Snapshot of live messages for `stage` (leased or not).
    pub fn messages(&self, stage: Stage) -> Result<Vec<QueueMessage>, BrokerError> {
        self.with_queue(stage, |q| q.messages.clone())
    }
}

fn require_lease(message: &QueueMessage) -> Result<LeaseId, BrokerError> {
    message
        .lease_id
        .ok_or_else(|| BrokerError::NotLeased(message.delivery_id.to_string()))
}

impl QueueBroker for InMemoryBroker {
    fn enqueue(&self, stage: Stage, job_id: JobId) -> Result<QueueMessage, BrokerError> {
        let message = QueueMessage::new(stage, job_id);
        let stored = message.clone();
        self.with_queue(stage, move |q| q.messages.push(stored))?;
        Ok(message)
    }

    fn lease(
        &self,
        stage: Stage,
        visibility_timeout: Duration,
    ) -> Result<Option<QueueMessage>, BrokerError> {
        let now = Utc::now();
        self.with_queue(stage, |q| {
            let slot = q.messages.iter_mut().find(|m| m.is_visible_at(now))?;
            slot.attempt += 1;
            slot.lease_id = Some(LeaseId::new());
            slot.visible_after = visible_at(now, visibility_timeout);
            Some(slot.clone())
        })
    }

    fn ack(&self, message: &QueueMessage) -> Result<(), BrokerError> {
        require_lease(message)?;
        self.with_queue(message.stage, |q| match q.position_for_lease(message) {
            Some(idx) => {
                q.messages.remove(idx);
            }
            None => debug!(delivery_id = %message.delivery_id, "ack ignored for stale lease"),
        })
    }

    fn nack(&self, message: &QueueMessage, delay: Duration) -> Result<(), BrokerError> {
        require_lease(message)?;
        self.with_queue(message.stage, |q| match q.position_for_lease(message) {
            Some(idx) => {
                let slot = &mut q.messages[idx];
                slot.lease_id = None;
                slot.visible_after = visible_at(Utc::now(), delay);
            }
            None => debug!(delivery_id = %message.delivery_id, "nack ignored for stale lease"),
        })
    }

    fn dead_letter(&self, message: &QueueMessage, reason: &str) -> Result<(), BrokerError> {
        require_lease(message)?;
        self.with_queue(message.stage, |q| match q.position_for_lease(message) {
            Some(idx) => {
                let removed = q.messages.remove(idx);
                q.dead.push(DeadLetter::new(removed, reason));
            }
            None => {
                debug!(delivery_id = %message.delivery_id, "dead-letter ignored for stale lease")
            }
        })
    }

    fn dead_letters(&self, stage: Stage) -> Result<Vec<DeadLetter>, BrokerError> {
        self.with_queue(stage, |q| q.dead.clone())
    }

    fn depth(&self, stage: Stage) -> Result<usize, BrokerError> {
        self.with_queue(stage, |q| q.messages.len())
    }
}
