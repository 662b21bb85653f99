//! Running a stage handler under a deadline.

use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use callpipe_core::{
    AudioRef, DialogueTurn, HandlerError, InsightDraft, Stage, StageHandlers, Summary, TurnDraft,
};

/// Everything a handler reads, loaded from the store before the call.
#[derive(Debug, Clone)]
pub enum StageInput {
    Stt { audio_ref: AudioRef },
    Summary { turns: Vec<DialogueTurn> },
    Postprocess { summary: Summary, turns: Vec<DialogueTurn> },
}

impl StageInput {
    pub fn stage(&self) -> Stage {
        match self {
            StageInput::Stt { .. } => Stage::Stt,
            StageInput::Summary { .. } => Stage::Summary,
            StageInput::Postprocess { .. } => Stage::Postprocess,
        }
    }
}

/// Unbound handler output; the worker attaches job ids before committing.
#[derive(Debug, Clone, PartialEq)]
pub enum StageResult {
    Turns(Vec<TurnDraft>),
    Summary(String),
    Insights(Vec<InsightDraft>),
}

fn call(handlers: &StageHandlers, input: StageInput) -> Result<StageResult, HandlerError> {
    match input {
        StageInput::Stt { audio_ref } => handlers.stt.transcribe(&audio_ref).map(StageResult::Turns),
        StageInput::Summary { turns } => handlers.summary.summarize(&turns).map(StageResult::Summary),
        StageInput::Postprocess { summary, turns } => handlers
            .postprocess
            .extract(&summary, &turns)
            .map(StageResult::Insights),
    }
}

/// Invoke the handler for `input` on its own thread and wait at most `timeout`.
///
/// A handler that overruns is abandoned (its thread finishes in the background
/// and its result is dropped). Timeouts and panics surface as transient errors.
pub fn invoke_with_timeout(
    handlers: &StageHandlers,
    input: StageInput,
    timeout: Duration,
) -> Result<StageResult, HandlerError> {
    let stage = input.stage();
    let handlers = handlers.clone();
    let (tx, rx) = mpsc::channel();

    thread::Builder::new()
        .name(format!("{stage}-handler"))
        .spawn(move || {
            let _ = tx.send(call(&handlers, input));
        })
        .map_err(|e| HandlerError::transient(format!("failed to start {stage} handler: {e}")))?;

    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(RecvTimeoutError::Timeout) => Err(HandlerError::transient(format!(
            "{stage} handler timed out after {}ms",
            timeout.as_millis()
        ))),
        Err(RecvTimeoutError::Disconnected) => Err(HandlerError::transient(format!(
            "{stage} handler panicked"
        ))),
    }
}
