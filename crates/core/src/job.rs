//! The job entity and its state-changing operations.
//!
//! All methods here are pure: they validate a transition and mutate the
//! in-memory snapshot. Persisting the snapshot (and bumping `version`) is the
//! job store's responsibility, guarded by an [`ExpectedVersion`] check.
//!
//! [`ExpectedVersion`]: crate::ExpectedVersion

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::{DomainError, DomainResult};
use crate::id::JobId;
use crate::stage::Stage;
use crate::status::JobStatus;
use crate::version::Versioned;

const MAX_AUDIO_REF_LEN: usize = 1024;

/// Opaque reference to an uploaded recording, owned by the storage collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AudioRef(String);

impl AudioRef {
    /// Validate that a reference is well-formed.
    ///
    /// Reachability is the storage collaborator's concern; this only rejects
    /// blank, oversized or control-character references.
    pub fn parse(raw: impl Into<String>) -> DomainResult<Self> {
        let raw = raw.into();
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(DomainError::validation("audio reference is empty"));
        }
        if trimmed.len() > MAX_AUDIO_REF_LEN {
            return Err(DomainError::validation(format!(
                "audio reference exceeds {MAX_AUDIO_REF_LEN} bytes"
            )));
        }
        if trimmed.chars().any(char::is_control) {
            return Err(DomainError::validation(
                "audio reference contains control characters",
            ));
        }
        Ok(Self(trimmed.to_string()))
    }

    /// Wrap a reference without validation (rows loaded from storage).
    pub fn from_stored(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for AudioRef {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Category of a recorded job error.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Downstream outage or timeout; retried with backoff.
    Transient,
    /// Malformed or unsupported input; never retried.
    Permanent,
    /// The job was cancelled before a stage ran.
    Cancelled,
    /// The dispatcher rejected the submission.
    Validation,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Transient => "transient",
            ErrorKind::Permanent => "permanent",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Validation => "validation",
        }
    }
}

impl core::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for ErrorKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "transient" => Ok(ErrorKind::Transient),
            "permanent" => Ok(ErrorKind::Permanent),
            "cancelled" => Ok(ErrorKind::Cancelled),
            "validation" => Ok(ErrorKind::Validation),
            other => Err(DomainError::invalid_id(format!("unknown error kind '{other}'"))),
        }
    }
}

/// Structured error stored on the job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub kind: ErrorKind,
    pub message: String,
    /// Stage that produced the error (`None` for dispatcher rejections).
    pub stage: Option<Stage>,
}

impl JobError {
    pub fn new(kind: ErrorKind, message: impl Into<String>, stage: Option<Stage>) -> Self {
        Self {
            kind,
            message: message.into(),
            stage,
        }
    }

    pub fn cancelled(stage: Stage) -> Self {
        Self::new(ErrorKind::Cancelled, "job cancelled on request", Some(stage))
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message, None)
    }
}

/// Where a job entered the pipeline.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobSource {
    /// Uploaded audio; starts at the STT stage.
    Audio,
    /// Pre-transcribed call; turns are supplied and the STT stage is skipped.
    Transcript,
}

impl JobSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobSource::Audio => "audio",
            JobSource::Transcript => "transcript",
        }
    }

    /// The first stage a job from this source is queued for.
    pub fn entry_stage(&self) -> Stage {
        match self {
            JobSource::Audio => Stage::Stt,
            JobSource::Transcript => Stage::Summary,
        }
    }
}

/// Outcome of recording a handler failure on a job.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FailureDecision {
    /// Attempts remain; the message should be redelivered after backoff.
    Retry { attempt: u32 },
    /// The job is now `Failed`.
    Exhausted { attempt: u32 },
}

/// The unit of work: one uploaded call moving through the stages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub status: JobStatus,
    pub source: JobSource,
    pub audio_ref: AudioRef,
    /// Incremented by the store on every persisted write.
    pub version: u64,
    /// Handler attempts per stage; reset whenever the stage is (re-)entered.
    pub attempt_count: BTreeMap<Stage, u32>,
    pub last_error: Option<JobError>,
    pub cancel_requested: bool,
    /// Caller-supplied metadata carried unchanged through the pipeline.
    pub extra_meta: Option<JsonValue>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Versioned for Job {
    type Id = JobId;

    fn id(&self) -> &JobId {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

impl Job {
    /// Create a job in `Uploaded` at version 0.
    pub fn new(audio_ref: AudioRef, source: JobSource, extra_meta: Option<JsonValue>) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            status: JobStatus::Uploaded,
            source,
            audio_ref,
            version: 0,
            attempt_count: BTreeMap::new(),
            last_error: None,
            cancel_requested: false,
            extra_meta,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn attempts(&self, stage: Stage) -> u32 {
        self.attempt_count.get(&stage).copied().unwrap_or(0)
    }

    /// Refresh `updated_at` without changing state.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    fn set_status(&mut self, next: JobStatus) {
        if let JobStatus::Queued(stage) = next {
            self.attempt_count.insert(stage, 0);
        }
        self.status = next;
        self.updated_at = Utc::now();
    }

    fn transition(&mut self, next: JobStatus) -> DomainResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(DomainError::illegal_transition(self.status, next));
        }
        self.set_status(next);
        Ok(())
    }

    /// Leave `Uploaded` for the entry stage of this job's source.
    pub fn enqueue_entry_stage(&mut self) -> DomainResult<Stage> {
        let stage = self.source.entry_stage();
        match (self.status, self.source) {
            (JobStatus::Uploaded, JobSource::Transcript) => {
                self.set_status(JobStatus::Queued(stage));
            }
            _ => self.transition(JobStatus::Queued(stage))?,
        }
        Ok(stage)
    }

    /// Claim the job for a stage (`Queued_X` or a reclaimed `Processing_X` -> `Processing_X`).
    pub fn claim(&mut self, stage: Stage) -> DomainResult<()> {
        self.transition(JobStatus::Processing(stage))
    }

    /// Leave `Processing_X` after its output has been produced.
    ///
    /// Returns the next stage to enqueue, or `None` when the job completed.
    pub fn advance(&mut self, stage: Stage) -> DomainResult<Option<Stage>> {
        if self.status != JobStatus::Processing(stage) {
            return Err(DomainError::illegal_transition(
                self.status,
                format!("advance from {stage}"),
            ));
        }
        let next = stage.next();
        match next {
            Some(n) => self.transition(JobStatus::Queued(n))?,
            None => self.transition(JobStatus::Completed)?,
        }
        self.last_error = None;
        Ok(next)
    }

    /// Record a failed handler attempt for `stage`.
    ///
    /// Retryable errors keep the job in `Processing_X` until `max_attempts`
    /// attempts have been recorded; non-retryable errors fail immediately.
    pub fn record_failure(
        &mut self,
        stage: Stage,
        error: JobError,
        retryable: bool,
        max_attempts: u32,
    ) -> DomainResult<FailureDecision> {
        if self.status != JobStatus::Processing(stage) {
            return Err(DomainError::illegal_transition(
                self.status,
                format!("record failure for {stage}"),
            ));
        }
        let attempt = self.attempts(stage) + 1;
        self.attempt_count.insert(stage, attempt);
        self.last_error = Some(error);
        self.updated_at = Utc::now();

        if retryable && attempt < max_attempts {
            Ok(FailureDecision::Retry { attempt })
        } else {
            self.status = JobStatus::Failed;
            Ok(FailureDecision::Exhausted { attempt })
        }
    }

    /// Move any non-terminal job to `Failed`.
    pub fn fail(&mut self, error: JobError) -> DomainResult<()> {
        self.transition(JobStatus::Failed)?;
        self.last_error = Some(error);
        Ok(())
    }

    /// Flag the job for cancellation at the next worker checkpoint.
    pub fn request_cancel(&mut self) -> DomainResult<()> {
        if self.status.is_terminal() {
            return Err(DomainError::validation(format!(
                "job {} is already {}",
                self.id, self.status
            )));
        }
        self.cancel_requested = true;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Re-enter `stage` (and, implicitly, every downstream stage) from a terminal state.
    pub fn rerun(&mut self, stage: Stage) -> DomainResult<()> {
        if !self.status.is_terminal() {
            return Err(DomainError::illegal_transition(
                self.status,
                format!("rerun {stage}"),
            ));
        }
        if self.source == JobSource::Transcript && stage == Stage::Stt {
            return Err(DomainError::validation(
                "transcript jobs have no audio to re-transcribe",
            ));
        }
        // A failed job has output only for the stages before the one that failed.
        if self.status == JobStatus::Failed {
            match self.last_error.as_ref().map(|e| e.stage) {
                Some(Some(failed_at)) if stage > failed_at => {
                    return Err(DomainError::validation(format!(
                        "job {} failed at {failed_at}; {stage} has no input",
                        self.id
                    )));
                }
                Some(None) if stage != Stage::Stt => {
                    return Err(DomainError::validation(format!(
                        "job {} never entered the pipeline; rerun from {}",
                        self.id,
                        Stage::Stt
                    )));
                }
                _ => {}
            }
        }
        for s in stage.downstream_inclusive() {
            self.attempt_count.insert(s, 0);
        }
        self.last_error = None;
        self.cancel_requested = false;
        self.set_status(JobStatus::Queued(stage));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn audio_job() -> Job {
        Job::new(AudioRef::parse("s3://calls/a1.wav").unwrap(), JobSource::Audio, None)
    }

    fn transient(stage: Stage) -> JobError {
        JobError::new(ErrorKind::Transient, "upstream 503", Some(stage))
    }

    #[test]
    fn audio_ref_validation() {
        assert!(AudioRef::parse("   ").is_err());
        assert!(AudioRef::parse("a\u{0}b").is_err());
        assert!(AudioRef::parse("x".repeat(MAX_AUDIO_REF_LEN + 1)).is_err());
        assert_eq!(AudioRef::parse("  a1 ").unwrap().as_str(), "a1");
    }

    #[test]
    fn new_job_starts_uploaded_at_version_zero() {
        let job = audio_job();
        assert_eq!(job.status, JobStatus::Uploaded);
        assert_eq!(job.version, 0);
        assert!(job.last_error.is_none());
    }

    #[test]
    fn full_success_path() {
        let mut job = audio_job();
        assert_eq!(job.enqueue_entry_stage().unwrap(), Stage::Stt);
        for stage in Stage::ALL {
            job.claim(stage).unwrap();
            let next = job.advance(stage).unwrap();
            assert_eq!(next, stage.next());
        }
        assert_eq!(job.status, JobStatus::Completed);
    }

    #[test]
    fn transcript_job_enters_at_summary() {
        let mut job = Job::new(AudioRef::parse("a1").unwrap(), JobSource::Transcript, None);
        assert_eq!(job.enqueue_entry_stage().unwrap(), Stage::Summary);
        assert_eq!(job.status, JobStatus::Queued(Stage::Summary));
    }

    #[test]
    fn claim_requires_matching_stage() {
        let mut job = audio_job();
        job.enqueue_entry_stage().unwrap();
        assert!(job.claim(Stage::Summary).is_err());
        job.claim(Stage::Stt).unwrap();
        // reclaim after lease expiry is allowed
        job.claim(Stage::Stt).unwrap();
    }

    #[test]
    fn retry_bound_is_exact() {
        let mut job = audio_job();
        job.enqueue_entry_stage().unwrap();
        job.claim(Stage::Stt).unwrap();

        assert_eq!(
            job.record_failure(Stage::Stt, transient(Stage::Stt), true, 3).unwrap(),
            FailureDecision::Retry { attempt: 1 }
        );
        assert_eq!(
            job.record_failure(Stage::Stt, transient(Stage::Stt), true, 3).unwrap(),
            FailureDecision::Retry { attempt: 2 }
        );
        assert_eq!(job.status, JobStatus::Processing(Stage::Stt));
        assert_eq!(
            job.record_failure(Stage::Stt, transient(Stage::Stt), true, 3).unwrap(),
            FailureDecision::Exhausted { attempt: 3 }
        );
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts(Stage::Stt), 3);
        assert_eq!(job.last_error.as_ref().unwrap().kind, ErrorKind::Transient);
    }

    #[test]
    fn permanent_failure_skips_retries() {
        let mut job = audio_job();
        job.enqueue_entry_stage().unwrap();
        job.claim(Stage::Stt).unwrap();
        let err = JobError::new(ErrorKind::Permanent, "unreadable audio", Some(Stage::Stt));
        assert_eq!(
            job.record_failure(Stage::Stt, err, false, 5).unwrap(),
            FailureDecision::Exhausted { attempt: 1 }
        );
        assert_eq!(job.status, JobStatus::Failed);
    }

    #[test]
    fn attempts_reset_when_stage_is_entered() {
        let mut job = audio_job();
        job.enqueue_entry_stage().unwrap();
        job.claim(Stage::Stt).unwrap();
        job.record_failure(Stage::Stt, transient(Stage::Stt), true, 3).unwrap();
        job.advance(Stage::Stt).unwrap();
        assert!(job.last_error.is_none());

        job.claim(Stage::Summary).unwrap();
        job.record_failure(Stage::Summary, transient(Stage::Summary), true, 3).unwrap();
        job.advance(Stage::Summary).unwrap();
        job.claim(Stage::Postprocess).unwrap();
        job.advance(Stage::Postprocess).unwrap();

        job.rerun(Stage::Summary).unwrap();
        assert_eq!(job.status, JobStatus::Queued(Stage::Summary));
        assert_eq!(job.attempts(Stage::Summary), 0);
        assert_eq!(job.attempts(Stage::Stt), 1);
    }

    #[test]
    fn terminal_jobs_reject_everything_but_rerun() {
        let mut job = audio_job();
        job.fail(JobError::validation("missing object")).unwrap();
        assert!(job.enqueue_entry_stage().is_err());
        assert!(job.claim(Stage::Stt).is_err());
        assert!(job.request_cancel().is_err());
        assert!(job.fail(JobError::validation("again")).is_err());
        job.rerun(Stage::Stt).unwrap();
        assert_eq!(job.status, JobStatus::Queued(Stage::Stt));
        assert!(job.last_error.is_none());
    }

    #[test]
    fn rerun_requires_terminal_state() {
        let mut job = audio_job();
        job.enqueue_entry_stage().unwrap();
        assert!(job.rerun(Stage::Stt).is_err());
    }

    #[test]
    fn rerun_cannot_skip_past_the_failed_stage() {
        let mut job = audio_job();
        job.enqueue_entry_stage().unwrap();
        job.claim(Stage::Stt).unwrap();
        job.advance(Stage::Stt).unwrap();
        job.claim(Stage::Summary).unwrap();
        job.record_failure(Stage::Summary, transient(Stage::Summary), false, 3).unwrap();

        assert!(job.rerun(Stage::Postprocess).is_err());
        assert_eq!(job.status, JobStatus::Failed);
        job.rerun(Stage::Summary).unwrap();

        let mut rejected = audio_job();
        rejected.fail(JobError::validation("missing object")).unwrap();
        assert!(rejected.rerun(Stage::Summary).is_err());
        assert!(rejected.rerun(Stage::Postprocess).is_err());
    }

    #[test]
    fn cancel_flag_is_cleared_by_rerun() {
        let mut job = audio_job();
        job.request_cancel().unwrap();
        assert!(job.cancel_requested);
        job.fail(JobError::cancelled(Stage::Stt)).unwrap();
        job.rerun(Stage::Stt).unwrap();
        assert!(!job.cancel_requested);
    }

    #[test]
    fn job_serializes_attempt_counts_by_stage_name() {
        let mut job = audio_job();
        job.attempt_count.insert(Stage::Summary, 2);
        let json = serde_json::to_value(&job).unwrap();
        assert_eq!(json["attempt_count"]["summary"], 2);
        assert_eq!(json["status"], "uploaded");
    }
}
