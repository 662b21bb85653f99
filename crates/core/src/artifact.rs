//! Stage outputs owned by a job: transcript turns, the summary and insights.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::{DomainError, DomainResult};
use crate::id::JobId;

/// Speaker side of a call.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Caller,
    Agent,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Caller => "caller",
            Channel::Agent => "agent",
        }
    }
}

impl core::str::FromStr for Channel {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "caller" => Ok(Channel::Caller),
            "agent" => Ok(Channel::Agent),
            other => Err(DomainError::invalid_id(format!("unknown channel '{other}'"))),
        }
    }
}

/// A transcribed segment as returned by an STT handler (not yet bound to a job).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnDraft {
    pub channel: Channel,
    pub start_ms: u64,
    pub end_ms: u64,
    pub text: String,
}

impl TurnDraft {
    pub fn new(channel: Channel, start_ms: u64, end_ms: u64, text: impl Into<String>) -> Self {
        Self {
            channel,
            start_ms,
            end_ms,
            text: text.into(),
        }
    }
}

/// One utterance of a call transcript. Immutable once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DialogueTurn {
    pub job_id: JobId,
    /// Position in the transcript (0-based); turns are always read in this order.
    pub seq: u32,
    pub channel: Channel,
    pub start_ms: u64,
    pub end_ms: u64,
    pub text: String,
}

impl DialogueTurn {
    /// Bind handler drafts to a job, validating timing and assigning order.
    pub fn from_drafts(job_id: JobId, drafts: Vec<TurnDraft>) -> DomainResult<Vec<DialogueTurn>> {
        drafts
            .into_iter()
            .enumerate()
            .map(|(idx, d)| {
                if d.end_ms < d.start_ms {
                    return Err(DomainError::validation(format!(
                        "turn {idx} ends before it starts ({} < {})",
                        d.end_ms, d.start_ms
                    )));
                }
                Ok(DialogueTurn {
                    job_id,
                    seq: idx as u32,
                    channel: d.channel,
                    start_ms: d.start_ms,
                    end_ms: d.end_ms,
                    text: d.text,
                })
            })
            .collect()
    }
}

/// One summary per job; re-running the summary stage replaces it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    pub job_id: JobId,
    pub text: String,
    pub generated_at: DateTime<Utc>,
}

impl Summary {
    pub fn new(job_id: JobId, text: impl Into<String>) -> Self {
        Self {
            job_id,
            text: text.into(),
            generated_at: Utc::now(),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InsightKind {
    Entity,
    Sentiment,
    Other,
}

impl InsightKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            InsightKind::Entity => "entity",
            InsightKind::Sentiment => "sentiment",
            InsightKind::Other => "other",
        }
    }
}

impl core::str::FromStr for InsightKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "entity" => Ok(InsightKind::Entity),
            "sentiment" => Ok(InsightKind::Sentiment),
            "other" => Ok(InsightKind::Other),
            other => Err(DomainError::invalid_id(format!("unknown insight kind '{other}'"))),
        }
    }
}

/// Post-processing output as returned by a handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InsightDraft {
    pub kind: InsightKind,
    pub payload: JsonValue,
}

impl InsightDraft {
    pub fn new(kind: InsightKind, payload: JsonValue) -> Self {
        Self { kind, payload }
    }
}

/// Extracted entity / sentiment / other fact about a call.
///
/// The set for a job is replaced as a whole when post-processing re-runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Insight {
    pub job_id: JobId,
    pub kind: InsightKind,
    pub payload: JsonValue,
}

impl Insight {
    pub fn from_drafts(job_id: JobId, drafts: Vec<InsightDraft>) -> Vec<Insight> {
        drafts
            .into_iter()
            .map(|d| Insight {
                job_id,
                kind: d.kind,
                payload: d.payload,
            })
            .collect()
    }
}
