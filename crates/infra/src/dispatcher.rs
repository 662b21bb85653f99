//! Entry point for new work: creates jobs and puts them on the first queue.

use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{info, instrument, warn};

use callpipe_core::{
    AudioRef, DialogueTurn, DomainError, ExpectedVersion, Job, JobError, JobId, JobSource, Stage,
    TurnDraft,
};

use crate::broker::{BrokerError, QueueBroker};
use crate::storage::AudioStorage;
use crate::store::{JobStore, StageOutput, StoreError};

/// Version-checked writes that race with workers are retried this many times.
const MAX_WRITE_RETRIES: usize = 5;

#[derive(Debug, Error)]
pub enum DispatchError {
    /// The job was created but failed its precondition check.
    #[error("job {job_id} rejected: {reason}")]
    Rejected { job_id: JobId, reason: String },

    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("job {0} kept changing underneath the request")]
    Contended(JobId),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

impl From<DomainError> for DispatchError {
    fn from(err: DomainError) -> Self {
        DispatchError::InvalidRequest(err.to_string())
    }
}

/// Creates jobs and feeds the pipeline.
///
/// Every state change is a version-checked write followed by an enqueue. If the
/// process dies between the two, the job sits in `Uploaded` or `Queued_*` until
/// the reconciler re-enqueues it.
#[derive(Debug, Clone)]
pub struct Dispatcher<S, B, A> {
    store: S,
    broker: B,
    storage: A,
}

impl<S, B, A> Dispatcher<S, B, A>
where
    S: JobStore,
    B: QueueBroker,
    A: AudioStorage,
{
    pub fn new(store: S, broker: B, storage: A) -> Self {
        Self {
            store,
            broker,
            storage,
        }
    }

    /// Accept an uploaded recording.
    ///
    /// Precondition failures still leave a `Failed` job behind so the caller can
    /// look it up; its id is carried in `DispatchError::Rejected`.
    #[instrument(skip(self, extra_meta), err)]
    pub fn submit(
        &self,
        audio_ref: &str,
        extra_meta: Option<JsonValue>,
    ) -> Result<JobId, DispatchError> {
        let (reference, precondition) = match AudioRef::parse(audio_ref) {
            Ok(reference) => {
                let reachable = self
                    .storage
                    .check(&reference)
                    .map_err(|e| e.to_string());
                (reference, reachable)
            }
            Err(e) => (AudioRef::from_stored(audio_ref.trim()), Err(e.to_string())),
        };

        let job = Job::new(reference, JobSource::Audio, extra_meta);
        let job = self.store.insert(&job)?;

        if let Err(reason) = precondition {
            return self.reject(job, reason);
        }

        self.enter_pipeline(job)
    }

    /// Accept a call that is already transcribed; it skips speech-to-text.
    #[instrument(skip(self, turns, extra_meta), fields(turns = turns.len()), err)]
    pub fn submit_transcript(
        &self,
        audio_ref: &str,
        turns: Vec<TurnDraft>,
        extra_meta: Option<JsonValue>,
    ) -> Result<JobId, DispatchError> {
        if turns.is_empty() {
            return Err(DispatchError::InvalidRequest(
                "a transcript needs at least one turn".to_string(),
            ));
        }
        let reference = AudioRef::parse(audio_ref)?;

        let job = Job::new(reference, JobSource::Transcript, extra_meta);
        let turns = DialogueTurn::from_drafts(job.id, turns)?;
        let job = self.store.insert(&job)?;

        let mut queued = job.clone();
        let stage = queued.enqueue_entry_stage()?;
        let stored = self.store.commit_stage(
            &queued,
            ExpectedVersion::Exact(job.version),
            StageOutput::Turns(turns),
        )?;

        self.enqueue(stage, stored.id);
        info!(job_id = %stored.id, stage = %stage, "transcript job accepted");
        Ok(stored.id)
    }

    /// Ask for a non-terminal job to stop at its next worker checkpoint.
    #[instrument(skip(self), err)]
    pub fn request_cancel(&self, job_id: JobId) -> Result<Job, DispatchError> {
        self.retry_write(job_id, |job| job.request_cancel())
    }

    /// Re-run `stage` and everything after it for a finished job.
    #[instrument(skip(self), err)]
    pub fn rerun(&self, job_id: JobId, stage: Stage) -> Result<Job, DispatchError> {
        self.check_rerun_inputs(job_id, stage)?;
        let stored = self.retry_write(job_id, |job| job.rerun(stage))?;
        self.enqueue(stage, job_id);
        info!(job_id = %job_id, stage = %stage, version = stored.version, "job re-queued");
        Ok(stored)
    }

    fn enter_pipeline(&self, job: Job) -> Result<JobId, DispatchError> {
        let mut queued = job.clone();
        let stage = queued.enqueue_entry_stage()?;
        let stored = self
            .store
            .update(&queued, ExpectedVersion::Exact(job.version))?;

        self.enqueue(stage, stored.id);
        info!(job_id = %stored.id, stage = %stage, "job accepted");
        Ok(stored.id)
    }

    fn reject(&self, job: Job, reason: String) -> Result<JobId, DispatchError> {
        let mut failed = job.clone();
        failed.fail(JobError::validation(reason.clone()))?;
        self.store
            .update(&failed, ExpectedVersion::Exact(job.version))?;

        warn!(job_id = %job.id, reason = %reason, "job rejected");
        Err(DispatchError::Rejected {
            job_id: job.id,
            reason,
        })
    }

    /// Enqueue after a durable transition. A failure here is repaired by reconciliation.
    fn enqueue(&self, stage: Stage, job_id: JobId) {
        if let Err(e) = self.broker.enqueue(stage, job_id) {
            warn!(job_id = %job_id, stage = %stage, error = %e, "enqueue failed; job left for reconciliation");
        }
    }

    /// Stage inputs a rerun depends on must still exist. Empty turns are valid
    /// input to summary (a silent call), so only audio and summary are checked.
    fn check_rerun_inputs(&self, job_id: JobId, stage: Stage) -> Result<(), DispatchError> {
        match stage {
            Stage::Stt => {
                let job = self
                    .store
                    .get(job_id)?
                    .ok_or(DispatchError::NotFound(job_id))?;
                let reference = AudioRef::parse(job.audio_ref.as_str())?;
                self.storage.check(&reference).map_err(|e| {
                    DispatchError::InvalidRequest(format!(
                        "job {job_id} cannot re-run {stage}: {e}"
                    ))
                })?;
            }
            Stage::Summary => {}
            Stage::Postprocess => {
                if self.store.summary(job_id)?.is_none() {
                    return Err(DispatchError::InvalidRequest(format!(
                        "job {job_id} has no summary to re-run {stage} from"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Read-modify-write with the version check, retried while workers race us.
    fn retry_write(
        &self,
        job_id: JobId,
        mut change: impl FnMut(&mut Job) -> Result<(), DomainError>,
    ) -> Result<Job, DispatchError> {
        for _ in 0..MAX_WRITE_RETRIES {
            let job = self
                .store
                .get(job_id)?
                .ok_or(DispatchError::NotFound(job_id))?;
            let mut changed = job.clone();
            change(&mut changed)?;

            match self
                .store
                .update(&changed, ExpectedVersion::Exact(job.version))
            {
                Ok(stored) => return Ok(stored),
                Err(e) if e.is_conflict() => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(DispatchError::Contended(job_id))
    }
}
