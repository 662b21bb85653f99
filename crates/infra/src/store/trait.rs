use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;

use callpipe_core::{
    DialogueTurn, ExpectedVersion, Insight, Job, JobId, JobStatus, Stage, Summary,
};

/// Job store operation error.
///
/// ## Error Categories
///
/// - **Concurrency**: the optimistic version check failed (another writer won)
/// - **NotFound**: no job row with that id
/// - **AlreadyExists**: insert of an id that is already stored
/// - **InvalidWrite**: the write itself is malformed (wrong job id, bad version)
/// - **Storage**: the backend is unavailable or returned garbage
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("optimistic concurrency check failed: {0}")]
    Concurrency(String),

    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error("job already exists: {0}")]
    AlreadyExists(JobId),

    #[error("invalid write: {0}")]
    InvalidWrite(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Concurrency(_))
    }

    pub(crate) fn version_mismatch(job_id: JobId, expected: ExpectedVersion, actual: u64) -> Self {
        StoreError::Concurrency(format!(
            "job {job_id}: expected {expected:?}, found version {actual}"
        ))
    }
}

/// Artifacts produced by one stage, committed together with the job transition.
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutput {
    /// Replaces any turns previously stored for the job.
    Turns(Vec<DialogueTurn>),
    /// Replaces the job's summary.
    Summary(Summary),
    /// Replaces any insights previously stored for the job.
    Insights(Vec<Insight>),
}

impl StageOutput {
    pub fn stage(&self) -> Stage {
        match self {
            StageOutput::Turns(_) => Stage::Stt,
            StageOutput::Summary(_) => Stage::Summary,
            StageOutput::Insights(_) => Stage::Postprocess,
        }
    }

    /// Reject artifacts that belong to a different job.
    pub fn check_owner(&self, job_id: JobId) -> Result<(), StoreError> {
        let foreign = match self {
            StageOutput::Turns(turns) => turns.iter().any(|t| t.job_id != job_id),
            StageOutput::Summary(summary) => summary.job_id != job_id,
            StageOutput::Insights(insights) => insights.iter().any(|i| i.job_id != job_id),
        };
        if foreign {
            return Err(StoreError::InvalidWrite(format!(
                "{} output contains artifacts of another job than {job_id}",
                self.stage()
            )));
        }
        Ok(())
    }
}

/// A job and every artifact stored for it, read at one point in time.
#[derive(Debug, Clone, PartialEq)]
pub struct JobSnapshot {
    pub job: Job,
    pub turns: Vec<DialogueTurn>,
    pub summary: Option<Summary>,
    pub insights: Vec<Insight>,
}

/// Selection of jobs for listing and reconciliation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobFilter {
    /// Match any of these statuses (empty = all).
    pub statuses: Vec<JobStatus>,
    /// Only jobs whose last write is strictly older than this.
    pub updated_before: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl JobFilter {
    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.statuses.push(status);
        self
    }

    pub fn updated_before(mut self, at: DateTime<Utc>) -> Self {
        self.updated_before = Some(at);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, job: &Job) -> bool {
        (self.statuses.is_empty() || self.statuses.contains(&job.status))
            && self.updated_before.is_none_or(|at| job.updated_at < at)
    }
}

/// Durable, version-checked job state plus stage artifacts.
///
/// ## Versioning
///
/// Every successful write bumps `version` by exactly one. Writes carry an
/// `ExpectedVersion`; when it does not match the stored version the write is
/// rejected with `StoreError::Concurrency` and nothing is changed.
///
/// ## Atomicity
///
/// `commit_stage` persists a stage's artifacts and the job's next status in one
/// step: readers never observe `Queued_Summary` without the turns it depends on.
pub trait JobStore: Send + Sync {
    /// Store a new job. Its version must be 0.
    fn insert(&self, job: &Job) -> Result<Job, StoreError>;

    fn get(&self, job_id: JobId) -> Result<Option<Job>, StoreError>;

    /// Overwrite the job row if `expected` matches; returns the stored job with its new version.
    fn update(&self, job: &Job, expected: ExpectedVersion) -> Result<Job, StoreError>;

    /// `update` plus the artifacts of the stage that just finished, atomically.
    fn commit_stage(
        &self,
        job: &Job,
        expected: ExpectedVersion,
        output: StageOutput,
    ) -> Result<Job, StoreError>;

    /// Turns ordered by `seq`.
    fn turns(&self, job_id: JobId) -> Result<Vec<DialogueTurn>, StoreError>;

    fn summary(&self, job_id: JobId) -> Result<Option<Summary>, StoreError>;

    fn insights(&self, job_id: JobId) -> Result<Vec<Insight>, StoreError>;

    /// The job row and its artifacts from a single consistent read. Separate
    /// `get` and artifact calls can straddle a concurrent `commit_stage`.
    fn snapshot(&self, job_id: JobId) -> Result<Option<JobSnapshot>, StoreError>;

    /// Matching jobs, newest first.
    fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError>;
}

impl<S> JobStore for Arc<S>
where
    S: JobStore + ?Sized,
{
    fn insert(&self, job: &Job) -> Result<Job, StoreError> {
        (**self).insert(job)
    }

    fn get(&self, job_id: JobId) -> Result<Option<Job>, StoreError> {
        (**self).get(job_id)
    }

    fn update(&self, job: &Job, expected: ExpectedVersion) -> Result<Job, StoreError> {
        (**self).update(job, expected)
    }

    fn commit_stage(
        &self,
        job: &Job,
        expected: ExpectedVersion,
        output: StageOutput,
    ) -> Result<Job, StoreError> {
        (**self).commit_stage(job, expected, output)
    }

    fn turns(&self, job_id: JobId) -> Result<Vec<DialogueTurn>, StoreError> {
        (**self).turns(job_id)
    }

    fn summary(&self, job_id: JobId) -> Result<Option<Summary>, StoreError> {
        (**self).summary(job_id)
    }

    fn insights(&self, job_id: JobId) -> Result<Vec<Insight>, StoreError> {
        (**self).insights(job_id)
    }

    fn snapshot(&self, job_id: JobId) -> Result<Option<JobSnapshot>, StoreError> {
        (**self).snapshot(job_id)
    }

    fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError> {
        (**self).list(filter)
    }
}
