//! Read-only views of job progress for clients.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value as JsonValue;

use callpipe_core::{
    DialogueTurn, Insight, JobError, JobId, JobSource, JobStatus, Stage, Summary,
};

use crate::store::{JobFilter, JobSnapshot, JobStore, StoreError};

/// Full status of one job, with whatever artifacts have been committed so far.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobView {
    pub job_id: JobId,
    pub status: JobStatus,
    pub source: JobSource,
    pub audio_ref: String,
    pub version: u64,
    pub attempt_count: BTreeMap<Stage, u32>,
    pub cancel_requested: bool,
    pub extra_meta: Option<JsonValue>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub turns: Vec<DialogueTurn>,
    pub summary: Option<Summary>,
    pub insights: Vec<Insight>,
    pub last_error: Option<JobError>,
}

/// One row of a job listing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobSummaryView {
    pub job_id: JobId,
    pub status: JobStatus,
    pub source: JobSource,
    pub audio_ref: String,
    pub extra_meta: Option<JsonValue>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_error: Option<JobError>,
}

/// Status projection over the job store.
///
/// Reads go straight to the store, so a view reflects whatever was last
/// committed. `get` reads the job and its artifacts in one snapshot, so
/// artifacts only ever appear together with the status that follows their stage.
#[derive(Debug, Clone)]
pub struct StatusProjection<S> {
    store: S,
    default_limit: usize,
}

impl<S: JobStore> StatusProjection<S> {
    pub fn new(store: S, default_limit: usize) -> Self {
        Self {
            store,
            default_limit,
        }
    }

    /// The job and its artifacts as of one consistent store read.
    pub fn get(&self, job_id: JobId) -> Result<Option<JobView>, StoreError> {
        let Some(JobSnapshot {
            job,
            turns,
            summary,
            insights,
        }) = self.store.snapshot(job_id)?
        else {
            return Ok(None);
        };

        Ok(Some(JobView {
            job_id: job.id,
            status: job.status,
            source: job.source,
            audio_ref: job.audio_ref.as_str().to_string(),
            version: job.version,
            attempt_count: job.attempt_count,
            cancel_requested: job.cancel_requested,
            extra_meta: job.extra_meta,
            created_at: job.created_at,
            updated_at: job.updated_at,
            turns,
            summary,
            insights,
            last_error: job.last_error,
        }))
    }

    /// Newest-first listing; `filter.limit` defaults to the configured page size.
    pub fn list(&self, filter: JobFilter) -> Result<Vec<JobSummaryView>, StoreError> {
        let filter = JobFilter {
            limit: Some(filter.limit.unwrap_or(self.default_limit)),
            ..filter
        };

        Ok(self
            .store
            .list(&filter)?
            .into_iter()
            .map(|job| JobSummaryView {
                job_id: job.id,
                status: job.status,
                source: job.source,
                audio_ref: job.audio_ref.as_str().to_string(),
                extra_meta: job.extra_meta,
                created_at: job.created_at,
                updated_at: job.updated_at,
                last_error: job.last_error,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use callpipe_core::{AudioRef, Channel, ExpectedVersion, Job, TurnDraft};

    use crate::store::{InMemoryJobStore, StageOutput};

    /// Serves only whole-job snapshots; piecewise reads fail.
    struct SnapshotOnly(InMemoryJobStore);

    impl JobStore for SnapshotOnly {
        fn insert(&self, job: &Job) -> Result<Job, StoreError> {
            self.0.insert(job)
        }

        fn get(&self, _: JobId) -> Result<Option<Job>, StoreError> {
            Err(StoreError::Storage("piecewise read".to_string()))
        }

        fn update(&self, job: &Job, expected: ExpectedVersion) -> Result<Job, StoreError> {
            self.0.update(job, expected)
        }

        fn commit_stage(
            &self,
            job: &Job,
            expected: ExpectedVersion,
            output: StageOutput,
        ) -> Result<Job, StoreError> {
            self.0.commit_stage(job, expected, output)
        }

        fn turns(&self, _: JobId) -> Result<Vec<DialogueTurn>, StoreError> {
            Err(StoreError::Storage("piecewise read".to_string()))
        }

        fn summary(&self, _: JobId) -> Result<Option<Summary>, StoreError> {
            Err(StoreError::Storage("piecewise read".to_string()))
        }

        fn insights(&self, _: JobId) -> Result<Vec<Insight>, StoreError> {
            Err(StoreError::Storage("piecewise read".to_string()))
        }

        fn snapshot(&self, job_id: JobId) -> Result<Option<JobSnapshot>, StoreError> {
            self.0.snapshot(job_id)
        }

        fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError> {
            self.0.list(filter)
        }
    }

    #[test]
    fn unknown_job_has_no_view() {
        let projection = StatusProjection::new(Arc::new(InMemoryJobStore::new()), 10);
        assert!(projection.get(JobId::new()).unwrap().is_none());
    }

    #[test]
    fn fresh_job_has_no_artifacts() {
        let store = Arc::new(InMemoryJobStore::new());
        let job = Job::new(AudioRef::parse("a.wav").unwrap(), JobSource::Audio, None);
        store.insert(&job).unwrap();

        let view = StatusProjection::new(Arc::clone(&store), 10)
            .get(job.id)
            .unwrap()
            .unwrap();

        assert_eq!(view.status, JobStatus::Uploaded);
        assert!(view.turns.is_empty());
        assert!(view.summary.is_none());
        assert!(view.insights.is_empty());
        assert!(view.last_error.is_none());
    }

    #[test]
    fn list_applies_default_limit_and_status_filter() {
        let store = Arc::new(InMemoryJobStore::new());
        for i in 0..5 {
            let mut job = Job::new(AudioRef::parse(format!("{i}.wav")).unwrap(), JobSource::Audio, None);
            store.insert(&job).unwrap();
            if i % 2 == 0 {
                job.enqueue_entry_stage().unwrap();
                store.update(&job, ExpectedVersion::Exact(0)).unwrap();
            }
        }
        let projection = StatusProjection::new(Arc::clone(&store), 3);

        assert_eq!(projection.list(JobFilter::default()).unwrap().len(), 3);
        assert_eq!(projection.list(JobFilter::default().limit(10)).unwrap().len(), 5);

        let queued = projection
            .list(JobFilter::default().with_status(JobStatus::Queued(Stage::Stt)).limit(10))
            .unwrap();
        assert_eq!(queued.len(), 3);
    }

    #[test]
    fn view_serializes_status_as_text() {
        let store = Arc::new(InMemoryJobStore::new());
        let job = Job::new(AudioRef::parse("a.wav").unwrap(), JobSource::Audio, None);
        store.insert(&job).unwrap();

        let view = StatusProjection::new(store, 10).get(job.id).unwrap().unwrap();
        let json = serde_json::to_value(&view).unwrap();

        assert_eq!(json["status"], "uploaded");
        assert_eq!(json["source"], "audio");
    }

    #[test]
    fn view_comes_from_a_single_snapshot() {
        let store = Arc::new(SnapshotOnly(InMemoryJobStore::new()));
        let mut job = Job::new(AudioRef::parse("a.wav").unwrap(), JobSource::Audio, None);
        store.insert(&job).unwrap();
        job.enqueue_entry_stage().unwrap();
        job.claim(Stage::Stt).unwrap();
        job.advance(Stage::Stt).unwrap();
        let turns = DialogueTurn::from_drafts(
            job.id,
            vec![TurnDraft::new(Channel::Caller, 0, 40, "hello?")],
        )
        .unwrap();
        store
            .commit_stage(&job, ExpectedVersion::Exact(0), StageOutput::Turns(turns))
            .unwrap();

        let view = StatusProjection::new(Arc::clone(&store), 10)
            .get(job.id)
            .unwrap()
            .unwrap();

        assert_eq!(view.status, JobStatus::Queued(Stage::Summary));
        assert_eq!(view.version, 1);
        assert_eq!(view.turns.len(), 1);
        assert!(view.summary.is_none());
    }
}
