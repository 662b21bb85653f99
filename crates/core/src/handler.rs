//! Stage handler contracts.
//!
//! Handlers are the external capabilities (speech-to-text, LLM summary, NLP
//! extraction). Each stage has one typed contract; the mapping from stage to
//! handler is fixed by [`StageHandlers`] and resolved once at startup.
//!
//! Handlers must not touch the job store or broker: they receive a typed
//! input snapshot and return a typed output or a [`HandlerError`].

use std::sync::Arc;

use thiserror::Error;

use crate::artifact::{DialogueTurn, InsightDraft, Summary, TurnDraft};
use crate::job::{AudioRef, ErrorKind};

/// Error returned by a stage handler.
///
/// `retryable` separates a transient downstream outage from a permanent
/// input problem; the worker skips retries for the latter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct HandlerError {
    pub retryable: bool,
    pub message: String,
}

impl HandlerError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            retryable: true,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            retryable: false,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        if self.retryable {
            ErrorKind::Transient
        } else {
            ErrorKind::Permanent
        }
    }
}

/// Speech-to-text: recording in, ordered turns out.
pub trait SttHandler: Send + Sync {
    fn transcribe(&self, audio_ref: &AudioRef) -> Result<Vec<TurnDraft>, HandlerError>;
}

/// Summarization: ordered turns in, summary text out.
pub trait SummaryHandler: Send + Sync {
    fn summarize(&self, turns: &[DialogueTurn]) -> Result<String, HandlerError>;
}

/// Post-processing: summary + turns in, insights out.
pub trait PostprocessHandler: Send + Sync {
    fn extract(
        &self,
        summary: &Summary,
        turns: &[DialogueTurn],
    ) -> Result<Vec<InsightDraft>, HandlerError>;
}

impl<F> SttHandler for F
where
    F: Fn(&AudioRef) -> Result<Vec<TurnDraft>, HandlerError> + Send + Sync,
{
    fn transcribe(&self, audio_ref: &AudioRef) -> Result<Vec<TurnDraft>, HandlerError> {
        self(audio_ref)
    }
}

impl<F> SummaryHandler for F
where
    F: Fn(&[DialogueTurn]) -> Result<String, HandlerError> + Send + Sync,
{
    fn summarize(&self, turns: &[DialogueTurn]) -> Result<String, HandlerError> {
        self(turns)
    }
}

impl<F> PostprocessHandler for F
where
    F: Fn(&Summary, &[DialogueTurn]) -> Result<Vec<InsightDraft>, HandlerError> + Send + Sync,
{
    fn extract(
        &self,
        summary: &Summary,
        turns: &[DialogueTurn],
    ) -> Result<Vec<InsightDraft>, HandlerError> {
        self(summary, turns)
    }
}

/// The fixed stage -> handler mapping.
#[derive(Clone)]
pub struct StageHandlers {
    pub stt: Arc<dyn SttHandler>,
    pub summary: Arc<dyn SummaryHandler>,
    pub postprocess: Arc<dyn PostprocessHandler>,
}

impl StageHandlers {
    pub fn new(
        stt: impl SttHandler + 'static,
        summary: impl SummaryHandler + 'static,
        postprocess: impl PostprocessHandler + 'static,
    ) -> Self {
        Self {
            stt: Arc::new(stt),
            summary: Arc::new(summary),
            postprocess: Arc::new(postprocess),
        }
    }
}

impl core::fmt::Debug for StageHandlers {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("StageHandlers").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::Channel;

    #[test]
    fn closures_implement_handler_contracts() {
        let stt = |_: &AudioRef| -> Result<Vec<TurnDraft>, HandlerError> {
            Ok(vec![TurnDraft::new(Channel::Agent, 0, 10, "hi")])
        };
        let out = stt.transcribe(&AudioRef::parse("a1").unwrap()).unwrap();
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn error_kind_follows_retryable_flag() {
        assert_eq!(HandlerError::transient("503").kind(), ErrorKind::Transient);
        assert_eq!(HandlerError::permanent("bad codec").kind(), ErrorKind::Permanent);
    }
}
