//! One lease-process-commit cycle for a single stage.

use std::time::Duration;

use thiserror::Error;
use tracing::{debug, error, info, info_span, warn};

use callpipe_core::{
    DialogueTurn, DomainError, ErrorKind, ExpectedVersion, FailureDecision, HandlerError, Insight,
    Job, JobError, JobId, JobStatus, QueueMessage, Stage, StageHandlers, Summary,
};

use crate::broker::{BrokerError, QueueBroker};
use crate::retry::RetryPolicy;
use crate::store::{JobStore, StageOutput, StoreError};

use super::invoke::{invoke_with_timeout, StageInput, StageResult};

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error("failed to spawn worker thread: {0}")]
    Spawn(String),
}

/// Per-stage knobs a worker runs with.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub max_attempts: u32,
    pub handler_timeout: Duration,
    pub visibility_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            handler_timeout: Duration::from_secs(120),
            visibility_timeout: Duration::from_secs(300),
            retry: RetryPolicy::default(),
        }
    }
}

/// Why a delivery was dropped without doing any work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
    /// The message names a job the store does not know.
    UnknownJob,
    /// The job is no longer waiting on this stage.
    NotForStage(JobStatus),
    /// Another writer changed the job between our read and our write.
    Conflict,
}

/// What a single `process_next` call did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Nothing was visible on the queue.
    Idle,
    /// Output committed and the next stage enqueued.
    Advanced { job_id: JobId, next: Stage },
    Completed { job_id: JobId },
    /// Handler failed transiently; the message comes back after `delay`.
    Retrying {
        job_id: JobId,
        attempt: u32,
        delay: Duration,
    },
    /// The job is now `Failed`.
    Failed { job_id: JobId, kind: ErrorKind },
    Cancelled { job_id: JobId },
    Discarded {
        job_id: JobId,
        reason: DiscardReason,
    },
}

/// Stage worker: leases a message, claims the job, runs the handler, commits.
///
/// ## Idempotency
///
/// Every state change goes through a version-checked store write against the
/// version this worker last observed. Duplicate or superseded deliveries lose
/// that check and are dropped, so at-least-once delivery never produces a
/// second set of artifacts.
///
/// Store or broker failures are returned as `WorkerError` *without* acking, so
/// the lease expires and the message is redelivered.
#[derive(Debug, Clone)]
pub struct StageWorker<S, B> {
    name: String,
    stage: Stage,
    store: S,
    broker: B,
    handlers: StageHandlers,
    settings: WorkerSettings,
}

impl<S, B> StageWorker<S, B>
where
    S: JobStore,
    B: QueueBroker,
{
    pub fn new(
        stage: Stage,
        store: S,
        broker: B,
        handlers: StageHandlers,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            name: format!("{stage}-worker"),
            stage,
            store,
            broker,
            handlers,
            settings,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn settings(&self) -> &WorkerSettings {
        &self.settings
    }

    /// Lease and fully handle at most one message.
    pub fn process_next(&self) -> Result<Outcome, WorkerError> {
        match self
            .broker
            .lease(self.stage, self.settings.visibility_timeout)?
        {
            Some(message) => self.handle(message),
            None => Ok(Outcome::Idle),
        }
    }

    /// Handle an already leased message.
    pub fn handle(&self, message: QueueMessage) -> Result<Outcome, WorkerError> {
        let span = info_span!(
            "stage_message",
            worker = %self.name,
            stage = %self.stage,
            job_id = %message.job_id,
            delivery = message.attempt,
        );
        let _enter = span.enter();
        let job_id = message.job_id;

        let Some(job) = self.store.get(job_id)? else {
            debug!("job not found, dropping message");
            return self.discard(&message, DiscardReason::UnknownJob);
        };

        let accepts = matches!(
            job.status,
            JobStatus::Queued(s) | JobStatus::Processing(s) if s == self.stage
        );
        if !accepts {
            debug!(status = %job.status, version = job.version, "stale delivery, dropping message");
            return self.discard(&message, DiscardReason::NotForStage(job.status));
        }

        if job.cancel_requested {
            return self.cancel(job, &message);
        }

        let observed = job.version;
        let mut claimed = job;
        claimed.claim(self.stage)?;
        let claimed = match self.store.update(&claimed, ExpectedVersion::Exact(observed)) {
            Ok(stored) => stored,
            Err(e) if e.is_conflict() => {
                debug!(version = observed, "lost claim race, dropping message");
                return self.discard(&message, DiscardReason::Conflict);
            }
            Err(e) => return Err(e.into()),
        };
        debug!(version = claimed.version, "claimed job");

        let result = match self.load_input(&claimed)? {
            Some(input) => invoke_with_timeout(&self.handlers, input, self.settings.handler_timeout),
            None => Err(HandlerError::permanent(format!(
                "{} input missing for job {}",
                self.stage, job_id
            ))),
        };

        match result.and_then(|r| bind_output(job_id, r)) {
            Ok(output) => self.commit(claimed, output, &message),
            Err(err) => self.record_failure(claimed, err, &message),
        }
    }

    fn discard(&self, message: &QueueMessage, reason: DiscardReason) -> Result<Outcome, WorkerError> {
        self.broker.ack(message)?;
        Ok(Outcome::Discarded {
            job_id: message.job_id,
            reason,
        })
    }

    fn cancel(&self, job: Job, message: &QueueMessage) -> Result<Outcome, WorkerError> {
        let observed = job.version;
        let mut cancelled = job;
        cancelled.fail(JobError::cancelled(self.stage))?;

        match self.store.update(&cancelled, ExpectedVersion::Exact(observed)) {
            Ok(stored) => {
                info!(version = stored.version, "job cancelled");
                self.broker.ack(message)?;
                Ok(Outcome::Cancelled { job_id: stored.id })
            }
            Err(e) if e.is_conflict() => self.discard(message, DiscardReason::Conflict),
            Err(e) => Err(e.into()),
        }
    }

    fn load_input(&self, job: &Job) -> Result<Option<StageInput>, StoreError> {
        Ok(match self.stage {
            Stage::Stt => Some(StageInput::Stt {
                audio_ref: job.audio_ref.clone(),
            }),
            // A silent call has no turns; the summary handler still runs on the empty transcript.
            Stage::Summary => Some(StageInput::Summary {
                turns: self.store.turns(job.id)?,
            }),
            Stage::Postprocess => {
                let turns = self.store.turns(job.id)?;
                self.store
                    .summary(job.id)?
                    .map(|summary| StageInput::Postprocess { summary, turns })
            }
        })
    }

    fn commit(
        &self,
        claimed: Job,
        output: StageOutput,
        message: &QueueMessage,
    ) -> Result<Outcome, WorkerError> {
        let observed = claimed.version;
        let job_id = claimed.id;
        let mut advanced = claimed;
        let next = advanced.advance(self.stage)?;

        match self
            .store
            .commit_stage(&advanced, ExpectedVersion::Exact(observed), output)
        {
            Ok(stored) => debug!(version = stored.version, status = %stored.status, "stage committed"),
            Err(e) if e.is_conflict() => {
                // Superseded while the handler ran; the redelivery sorts it out.
                debug!(version = observed, "commit lost version check, discarding output");
                return Ok(Outcome::Discarded {
                    job_id,
                    reason: DiscardReason::Conflict,
                });
            }
            Err(e) => return Err(e.into()),
        }

        if let Some(next) = next {
            if let Err(e) = self.broker.enqueue(next, job_id) {
                error!(next_stage = %next, error = %e, "enqueue failed after commit; job left for reconciliation");
            }
        }
        self.broker.ack(message)?;

        Ok(match next {
            Some(next) => {
                info!(next_stage = %next, "stage complete");
                Outcome::Advanced { job_id, next }
            }
            None => {
                info!("job completed");
                Outcome::Completed { job_id }
            }
        })
    }

    fn record_failure(
        &self,
        claimed: Job,
        err: HandlerError,
        message: &QueueMessage,
    ) -> Result<Outcome, WorkerError> {
        let observed = claimed.version;
        let job_id = claimed.id;
        let kind = err.kind();
        let mut failed = claimed;
        let decision = failed.record_failure(
            self.stage,
            JobError::new(kind, err.message.clone(), Some(self.stage)),
            err.retryable,
            self.settings.max_attempts,
        )?;

        match self.store.update(&failed, ExpectedVersion::Exact(observed)) {
            Ok(_) => {}
            Err(e) if e.is_conflict() => {
                debug!(version = observed, "failure record lost version check, discarding");
                return Ok(Outcome::Discarded {
                    job_id,
                    reason: DiscardReason::Conflict,
                });
            }
            Err(e) => return Err(e.into()),
        }

        match decision {
            FailureDecision::Retry { attempt } => {
                let delay = self.settings.retry.delay_for(attempt, jitter_seed(job_id));
                warn!(
                    attempt,
                    max_attempts = self.settings.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "handler failed, will retry"
                );
                self.broker.nack(message, delay)?;
                Ok(Outcome::Retrying {
                    job_id,
                    attempt,
                    delay,
                })
            }
            FailureDecision::Exhausted { attempt } => {
                warn!(attempt, kind = %kind, error = %err, "job failed");
                let reason = format!("{kind} after {attempt} attempt(s): {}", err.message);
                self.broker.dead_letter(message, &reason)?;
                Ok(Outcome::Failed { job_id, kind })
            }
        }
    }
}

/// Per-job jitter seed so jobs failing together don't retry in lockstep.
fn jitter_seed(job_id: JobId) -> u64 {
    job_id.as_uuid().as_u128() as u64
}

/// Attach handler output to its job, rejecting malformed results as permanent failures.
fn bind_output(job_id: JobId, result: StageResult) -> Result<StageOutput, HandlerError> {
    match result {
        StageResult::Turns(drafts) => DialogueTurn::from_drafts(job_id, drafts)
            .map(StageOutput::Turns)
            .map_err(|e| HandlerError::permanent(format!("invalid transcript: {e}"))),
        StageResult::Summary(text) => Ok(StageOutput::Summary(Summary::new(job_id, text))),
        StageResult::Insights(drafts) => Ok(StageOutput::Insights(Insight::from_drafts(
            job_id, drafts,
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use callpipe_core::{AudioRef, Channel, InsightDraft, InsightKind, JobSource, TurnDraft};

    use crate::broker::InMemoryBroker;
    use crate::store::InMemoryJobStore;

    type Worker = StageWorker<Arc<InMemoryJobStore>, Arc<InMemoryBroker>>;

    fn ok_handlers() -> StageHandlers {
        StageHandlers::new(
            |_: &AudioRef| -> Result<Vec<TurnDraft>, HandlerError> {
                Ok(vec![
                    TurnDraft::new(Channel::Caller, 0, 1000, "my order is late"),
                    TurnDraft::new(Channel::Agent, 1000, 2500, "let me check that"),
                ])
            },
            |turns: &[DialogueTurn]| -> Result<String, HandlerError> {
                Ok(format!("{} turns about a late order", turns.len()))
            },
            |_: &Summary, _: &[DialogueTurn]| -> Result<Vec<InsightDraft>, HandlerError> {
                Ok(vec![InsightDraft::new(
                    InsightKind::Sentiment,
                    serde_json::json!({ "label": "negative" }),
                )])
            },
        )
    }

    fn settings() -> WorkerSettings {
        WorkerSettings {
            max_attempts: 3,
            handler_timeout: Duration::from_secs(5),
            visibility_timeout: Duration::from_secs(30),
            retry: RetryPolicy::immediate(),
        }
    }

    struct Fixture {
        store: Arc<InMemoryJobStore>,
        broker: Arc<InMemoryBroker>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                store: Arc::new(InMemoryJobStore::new()),
                broker: Arc::new(InMemoryBroker::new()),
            }
        }

        fn worker(&self, stage: Stage, handlers: StageHandlers) -> Worker {
            StageWorker::new(
                stage,
                Arc::clone(&self.store),
                Arc::clone(&self.broker),
                handlers,
                settings(),
            )
        }

        /// A job queued for STT with one message waiting.
        fn queued_job(&self) -> JobId {
            let mut job = Job::new(AudioRef::parse("calls/7.wav").unwrap(), JobSource::Audio, None);
            self.store.insert(&job).unwrap();
            let stage = job.enqueue_entry_stage().unwrap();
            self.store.update(&job, ExpectedVersion::Exact(0)).unwrap();
            self.broker.enqueue(stage, job.id).unwrap();
            job.id
        }

        fn job(&self, id: JobId) -> Job {
            self.store.get(id).unwrap().unwrap()
        }
    }

    #[test]
    fn idle_when_queue_is_empty() {
        let fx = Fixture::new();
        let worker = fx.worker(Stage::Stt, ok_handlers());
        assert_eq!(worker.process_next().unwrap(), Outcome::Idle);
    }

    #[test]
    fn stt_success_commits_turns_and_enqueues_summary() {
        let fx = Fixture::new();
        let id = fx.queued_job();
        let worker = fx.worker(Stage::Stt, ok_handlers());

        let outcome = worker.process_next().unwrap();

        assert_eq!(outcome, Outcome::Advanced { job_id: id, next: Stage::Summary });
        let job = fx.job(id);
        assert_eq!(job.status, JobStatus::Queued(Stage::Summary));
        assert_eq!(job.version, 3);
        assert_eq!(fx.store.turns(id).unwrap().len(), 2);
        assert_eq!(fx.broker.depth(Stage::Stt).unwrap(), 0);
        assert_eq!(fx.broker.depth(Stage::Summary).unwrap(), 1);
    }

    #[test]
    fn stale_message_is_acked_and_dropped() {
        let fx = Fixture::new();
        let id = fx.queued_job();
        fx.broker.enqueue(Stage::Stt, id).unwrap();
        let worker = fx.worker(Stage::Stt, ok_handlers());

        worker.process_next().unwrap();
        let second = worker.process_next().unwrap();

        assert_eq!(
            second,
            Outcome::Discarded {
                job_id: id,
                reason: DiscardReason::NotForStage(JobStatus::Queued(Stage::Summary)),
            }
        );
        assert_eq!(fx.broker.depth(Stage::Stt).unwrap(), 0);
        assert_eq!(fx.store.turns(id).unwrap().len(), 2);
    }

    #[test]
    fn unknown_job_is_dropped() {
        let fx = Fixture::new();
        let ghost = JobId::new();
        fx.broker.enqueue(Stage::Stt, ghost).unwrap();

        let outcome = fx.worker(Stage::Stt, ok_handlers()).process_next().unwrap();

        assert_eq!(
            outcome,
            Outcome::Discarded { job_id: ghost, reason: DiscardReason::UnknownJob }
        );
        assert_eq!(fx.broker.depth(Stage::Stt).unwrap(), 0);
    }

    #[test]
    fn transient_failure_retries_then_succeeds() {
        let fx = Fixture::new();
        let id = fx.queued_job();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let flaky = StageHandlers {
            stt: Arc::new(move |_: &AudioRef| -> Result<Vec<TurnDraft>, HandlerError> {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(HandlerError::transient("engine busy"))
                } else {
                    Ok(vec![TurnDraft::new(Channel::Caller, 0, 10, "hi")])
                }
            }),
            ..ok_handlers()
        };
        let worker = fx.worker(Stage::Stt, flaky);

        let first = worker.process_next().unwrap();
        assert!(matches!(first, Outcome::Retrying { attempt: 1, .. }));
        let job = fx.job(id);
        assert_eq!(job.status, JobStatus::Processing(Stage::Stt));
        assert_eq!(job.attempts(Stage::Stt), 1);
        assert_eq!(job.last_error.as_ref().unwrap().kind, ErrorKind::Transient);

        let second = worker.process_next().unwrap();
        assert_eq!(second, Outcome::Advanced { job_id: id, next: Stage::Summary });
        assert!(fx.job(id).last_error.is_none());
    }

    #[test]
    fn transient_failures_stop_at_max_attempts() {
        let fx = Fixture::new();
        let id = fx.queued_job();
        let failing = StageHandlers {
            stt: Arc::new(|_: &AudioRef| -> Result<Vec<TurnDraft>, HandlerError> {
                Err(HandlerError::transient("engine busy"))
            }),
            ..ok_handlers()
        };
        let worker = fx.worker(Stage::Stt, failing);

        assert!(matches!(worker.process_next().unwrap(), Outcome::Retrying { attempt: 1, .. }));
        assert!(matches!(worker.process_next().unwrap(), Outcome::Retrying { attempt: 2, .. }));
        assert_eq!(
            worker.process_next().unwrap(),
            Outcome::Failed { job_id: id, kind: ErrorKind::Transient }
        );
        assert_eq!(worker.process_next().unwrap(), Outcome::Idle);

        let job = fx.job(id);
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts(Stage::Stt), 3);
        assert_eq!(fx.broker.dead_letters(Stage::Stt).unwrap().len(), 1);
    }

    #[test]
    fn permanent_failure_fails_immediately() {
        let fx = Fixture::new();
        let id = fx.queued_job();
        let broken = StageHandlers {
            stt: Arc::new(|_: &AudioRef| -> Result<Vec<TurnDraft>, HandlerError> {
                Err(HandlerError::permanent("not audio"))
            }),
            ..ok_handlers()
        };

        let outcome = fx.worker(Stage::Stt, broken).process_next().unwrap();

        assert_eq!(outcome, Outcome::Failed { job_id: id, kind: ErrorKind::Permanent });
        let job = fx.job(id);
        assert_eq!(job.attempts(Stage::Stt), 1);
        assert_eq!(job.last_error.unwrap().stage, Some(Stage::Stt));
        assert!(fx.store.turns(id).unwrap().is_empty());
    }

    #[test]
    fn malformed_handler_output_is_permanent() {
        let fx = Fixture::new();
        let id = fx.queued_job();
        let backwards = StageHandlers {
            stt: Arc::new(|_: &AudioRef| -> Result<Vec<TurnDraft>, HandlerError> {
                Ok(vec![TurnDraft::new(Channel::Caller, 500, 100, "time travel")])
            }),
            ..ok_handlers()
        };

        let outcome = fx.worker(Stage::Stt, backwards).process_next().unwrap();
        assert_eq!(outcome, Outcome::Failed { job_id: id, kind: ErrorKind::Permanent });
    }

    #[test]
    fn cancel_requested_before_claim_fails_job_without_running_handler() {
        let fx = Fixture::new();
        let id = fx.queued_job();
        let mut job = fx.job(id);
        job.request_cancel().unwrap();
        fx.store.update(&job, ExpectedVersion::Exact(job.version)).unwrap();

        let ran = Arc::new(AtomicU32::new(0));
        let seen = Arc::clone(&ran);
        let handlers = StageHandlers {
            stt: Arc::new(move |_: &AudioRef| -> Result<Vec<TurnDraft>, HandlerError> {
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(vec![])
            }),
            ..ok_handlers()
        };

        let outcome = fx.worker(Stage::Stt, handlers).process_next().unwrap();

        assert_eq!(outcome, Outcome::Cancelled { job_id: id });
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        let job = fx.job(id);
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.last_error.unwrap().kind, ErrorKind::Cancelled);
        assert_eq!(fx.broker.depth(Stage::Stt).unwrap(), 0);
    }

    #[test]
    fn missing_upstream_input_is_permanent() {
        let fx = Fixture::new();
        let mut job = Job::new(AudioRef::parse("x.wav").unwrap(), JobSource::Audio, None);
        fx.store.insert(&job).unwrap();
        job.enqueue_entry_stage().unwrap();
        job.claim(Stage::Stt).unwrap();
        job.advance(Stage::Stt).unwrap();
        job.claim(Stage::Summary).unwrap();
        job.advance(Stage::Summary).unwrap();
        fx.store.update(&job, ExpectedVersion::Any).unwrap();
        fx.broker.enqueue(Stage::Postprocess, job.id).unwrap();

        let outcome = fx.worker(Stage::Postprocess, ok_handlers()).process_next().unwrap();

        assert_eq!(
            outcome,
            Outcome::Failed { job_id: job.id, kind: ErrorKind::Permanent }
        );
        let error = fx.job(job.id).last_error.unwrap();
        assert!(error.message.contains("input missing"), "{}", error.message);
    }

    #[test]
    fn silent_call_is_summarized_from_empty_transcript() {
        let fx = Fixture::new();
        let id = fx.queued_job();
        let silent = StageHandlers {
            stt: Arc::new(|_: &AudioRef| -> Result<Vec<TurnDraft>, HandlerError> { Ok(vec![]) }),
            summary: Arc::new(|turns: &[DialogueTurn]| -> Result<String, HandlerError> {
                Ok(if turns.is_empty() {
                    "No transcript available.".to_owned()
                } else {
                    format!("{} turns", turns.len())
                })
            }),
            ..ok_handlers()
        };

        let stt = fx.worker(Stage::Stt, silent.clone()).process_next().unwrap();
        assert_eq!(stt, Outcome::Advanced { job_id: id, next: Stage::Summary });
        assert!(fx.store.turns(id).unwrap().is_empty());

        let summary = fx.worker(Stage::Summary, silent).process_next().unwrap();

        assert_eq!(summary, Outcome::Advanced { job_id: id, next: Stage::Postprocess });
        assert_eq!(fx.job(id).status, JobStatus::Queued(Stage::Postprocess));
        assert_eq!(
            fx.store.summary(id).unwrap().unwrap().text,
            "No transcript available."
        );
    }

    #[test]
    fn redelivered_processing_job_is_reclaimed() {
        let fx = Fixture::new();
        let id = fx.queued_job();
        let crashed = fx.broker.lease(Stage::Stt, Duration::ZERO).unwrap().unwrap();
        let mut job = fx.job(id);
        job.claim(Stage::Stt).unwrap();
        fx.store.update(&job, ExpectedVersion::Exact(job.version)).unwrap();

        let outcome = fx.worker(Stage::Stt, ok_handlers()).process_next().unwrap();

        assert_eq!(outcome, Outcome::Advanced { job_id: id, next: Stage::Summary });
        // The crashed worker's lease is stale now.
        fx.broker.ack(&crashed).unwrap();
        assert_eq!(fx.broker.depth(Stage::Summary).unwrap(), 1);
    }
}
