//! Redis-backed queue broker (durable, at-least-once delivery).
//!
//! ## Layout
//!
//! - **Ready set**: `{prefix}:queue:{stage}` sorted set, member = delivery id,
//!   score = `visible_after` in epoch milliseconds. Leased messages stay in the
//!   set with their score pushed forward by the visibility timeout.
//! - **Message body**: `{prefix}:msg:{delivery_id}` JSON-encoded `QueueMessage`,
//!   including the current `lease_id`.
//! - **Dead letters**: `{prefix}:dlq:{stage}` list of JSON-encoded `DeadLetter`s.
//!
//! Lease, ack, nack and dead-letter run as Lua scripts so that the lease
//! check and the mutation are a single atomic step on the server.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use tracing::{debug, instrument};

use callpipe_core::{JobId, LeaseId, QueueMessage, Stage};

use super::r#trait::{visible_at, BrokerError, DeadLetter, QueueBroker};

/// Default key prefix
const DEFAULT_PREFIX: &str = "callpipe";

const LEASE_SCRIPT: &str = r#"
local ids = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, 1)
if #ids == 0 then
    return false
end
local id = ids[1]
local body = redis.call('GET', ARGV[2] .. id)
if not body then
    redis.call('ZREM', KEYS[1], id)
    return false
end
local msg = cjson.decode(body)
msg['attempt'] = msg['attempt'] + 1
msg['lease_id'] = ARGV[3]
msg['visible_after'] = ARGV[4]
local encoded = cjson.encode(msg)
redis.call('SET', ARGV[2] .. id, encoded)
redis.call('ZADD', KEYS[1], ARGV[5], id)
return encoded
"#;

const ACK_SCRIPT: &str = r#"
local body = redis.call('GET', KEYS[2])
if not body then
    return 0
end
local msg = cjson.decode(body)
if msg['lease_id'] ~= ARGV[1] then
    return 0
end
redis.call('ZREM', KEYS[1], ARGV[2])
redis.call('DEL', KEYS[2])
return 1
"#;

const NACK_SCRIPT: &str = r#"
local body = redis.call('GET', KEYS[2])
if not body then
    return 0
end
local msg = cjson.decode(body)
if msg['lease_id'] ~= ARGV[1] then
    return 0
end
msg['lease_id'] = nil
msg['visible_after'] = ARGV[3]
redis.call('SET', KEYS[2], cjson.encode(msg))
redis.call('ZADD', KEYS[1], ARGV[4], ARGV[2])
return 1
"#;

const DEAD_LETTER_SCRIPT: &str = r#"
local body = redis.call('GET', KEYS[2])
if not body then
    return 0
end
local msg = cjson.decode(body)
if msg['lease_id'] ~= ARGV[1] then
    return 0
end
redis.call('ZREM', KEYS[1], ARGV[2])
redis.call('DEL', KEYS[2])
redis.call('RPUSH', KEYS[3], ARGV[3])
return 1
"#;

#[derive(Clone)]
pub struct RedisBroker {
    client: Arc<redis::Client>,
    prefix: String,
    lease_script: Arc<redis::Script>,
    ack_script: Arc<redis::Script>,
    nack_script: Arc<redis::Script>,
    dead_letter_script: Arc<redis::Script>,
}

impl core::fmt::Debug for RedisBroker {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RedisBroker")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

impl RedisBroker {
    /// Create a new Redis broker.
    ///
    /// # Arguments
    ///
    /// * `redis_url` - Redis connection URL (e.g., "redis://localhost:6379")
    /// * `prefix` - key prefix (default: "callpipe")
    pub fn new(redis_url: impl AsRef<str>, prefix: Option<String>) -> Result<Self, BrokerError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| BrokerError::Connection(e.to_string()))?;

        Ok(Self {
            client: Arc::new(client),
            prefix: prefix.unwrap_or_else(|| DEFAULT_PREFIX.to_string()),
            lease_script: Arc::new(redis::Script::new(LEASE_SCRIPT)),
            ack_script: Arc::new(redis::Script::new(ACK_SCRIPT)),
            nack_script: Arc::new(redis::Script::new(NACK_SCRIPT)),
            dead_letter_script: Arc::new(redis::Script::new(DEAD_LETTER_SCRIPT)),
        })
    }

    fn connection(&self) -> Result<redis::Connection, BrokerError> {
        self.client
            .get_connection()
            .map_err(|e| BrokerError::Connection(e.to_string()))
    }

    fn queue_key(&self, stage: Stage) -> String {
        format!("{}:queue:{}", self.prefix, stage.as_str())
    }

    fn message_key_prefix(&self) -> String {
        format!("{}:msg:", self.prefix)
    }

    fn message_key(&self, message: &QueueMessage) -> String {
        format!("{}{}", self.message_key_prefix(), message.delivery_id)
    }

    fn dlq_key(&self, stage: Stage) -> String {
        format!("{}:dlq:{}", self.prefix, stage.as_str())
    }
}

fn epoch_ms(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn rfc3339(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn require_lease(message: &QueueMessage) -> Result<LeaseId, BrokerError> {
    message
        .lease_id
        .ok_or_else(|| BrokerError::NotLeased(message.delivery_id.to_string()))
}

impl QueueBroker for RedisBroker {
    #[instrument(skip(self), fields(stage = %stage, job_id = %job_id), err)]
    fn enqueue(&self, stage: Stage, job_id: JobId) -> Result<QueueMessage, BrokerError> {
        let message = QueueMessage::new(stage, job_id);
        let body = serde_json::to_string(&message)
            .map_err(|e| BrokerError::Serialization(e.to_string()))?;

        let mut conn = self.connection()?;
        redis::pipe()
            .atomic()
            .cmd("SET")
            .arg(self.message_key(&message))
            .arg(&body)
            .ignore()
            .cmd("ZADD")
            .arg(self.queue_key(stage))
            .arg(epoch_ms(message.visible_after))
            .arg(message.delivery_id.to_string())
            .ignore()
            .query::<()>(&mut conn)
            .map_err(|e| BrokerError::Command(format!("enqueue failed: {}", e)))?;

        Ok(message)
    }

    #[instrument(skip(self), fields(stage = %stage), err)]
    fn lease(
        &self,
        stage: Stage,
        visibility_timeout: Duration,
    ) -> Result<Option<QueueMessage>, BrokerError> {
        let now = Utc::now();
        let hidden_until = visible_at(now, visibility_timeout);
        let mut conn = self.connection()?;

        let body: Option<String> = self
            .lease_script
            .key(self.queue_key(stage))
            .arg(epoch_ms(now))
            .arg(self.message_key_prefix())
            .arg(LeaseId::new().to_string())
            .arg(rfc3339(hidden_until))
            .arg(epoch_ms(hidden_until))
            .invoke(&mut conn)
            .map_err(|e| BrokerError::Command(format!("lease failed: {}", e)))?;

        body.map(|b| {
            serde_json::from_str(&b).map_err(|e| BrokerError::Serialization(e.to_string()))
        })
        .transpose()
    }

    #[instrument(skip(self, message), fields(delivery_id = %message.delivery_id), err)]
    fn ack(&self, message: &QueueMessage) -> Result<(), BrokerError> {
        let lease_id = require_lease(message)?;
        let mut conn = self.connection()?;

        let removed: i64 = self
            .ack_script
            .key(self.queue_key(message.stage))
            .key(self.message_key(message))
            .arg(lease_id.to_string())
            .arg(message.delivery_id.to_string())
            .invoke(&mut conn)
            .map_err(|e| BrokerError::Command(format!("ack failed: {}", e)))?;

        if removed == 0 {
            debug!("ack ignored for stale lease");
        }
        Ok(())
    }

    #[instrument(skip(self, message), fields(delivery_id = %message.delivery_id), err)]
    fn nack(&self, message: &QueueMessage, delay: Duration) -> Result<(), BrokerError> {
        let lease_id = require_lease(message)?;
        let visible = visible_at(Utc::now(), delay);
        let mut conn = self.connection()?;

        let released: i64 = self
            .nack_script
            .key(self.queue_key(message.stage))
            .key(self.message_key(message))
            .arg(lease_id.to_string())
            .arg(message.delivery_id.to_string())
            .arg(rfc3339(visible))
            .arg(epoch_ms(visible))
            .invoke(&mut conn)
            .map_err(|e| BrokerError::Command(format!("nack failed: {}", e)))?;

        if released == 0 {
            debug!("nack ignored for stale lease");
        }
        Ok(())
    }

    #[instrument(skip(self, message), fields(delivery_id = %message.delivery_id), err)]
    fn dead_letter(&self, message: &QueueMessage, reason: &str) -> Result<(), BrokerError> {
        let lease_id = require_lease(message)?;
        let entry = serde_json::to_string(&DeadLetter::new(message.clone(), reason))
            .map_err(|e| BrokerError::Serialization(e.to_string()))?;
        let mut conn = self.connection()?;

        let moved: i64 = self
            .dead_letter_script
            .key(self.queue_key(message.stage))
            .key(self.message_key(message))
            .key(self.dlq_key(message.stage))
            .arg(lease_id.to_string())
            .arg(message.delivery_id.to_string())
            .arg(entry)
            .invoke(&mut conn)
            .map_err(|e| BrokerError::Command(format!("dead-letter failed: {}", e)))?;

        if moved == 0 {
            debug!("dead-letter ignored for stale lease");
        }
        Ok(())
    }

    fn dead_letters(&self, stage: Stage) -> Result<Vec<DeadLetter>, BrokerError> {
        let mut conn = self.connection()?;
        let entries: Vec<String> = redis::cmd("LRANGE")
            .arg(self.dlq_key(stage))
            .arg(0)
            .arg(-1)
            .query(&mut conn)
            .map_err(|e| BrokerError::Command(format!("LRANGE failed: {}", e)))?;

        entries
            .iter()
            .map(|e| {
                serde_json::from_str(e).map_err(|err| BrokerError::Serialization(err.to_string()))
            })
            .collect()
    }

    fn depth(&self, stage: Stage) -> Result<usize, BrokerError> {
        let mut conn = self.connection()?;
        redis::cmd("ZCARD")
            .arg(self.queue_key(stage))
            .query(&mut conn)
            .map_err(|e| BrokerError::Command(format!("ZCARD failed: {}", e)))
    }
}
