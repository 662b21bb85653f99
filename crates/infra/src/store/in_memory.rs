use std::collections::HashMap;
use std::sync::RwLock;

use callpipe_core::{DialogueTurn, ExpectedVersion, Insight, Job, JobId, Summary};

use super::r#trait::{JobFilter, JobSnapshot, JobStore, StageOutput, StoreError};

#[derive(Debug, Default)]
struct Tables {
    jobs: HashMap<JobId, Job>,
    turns: HashMap<JobId, Vec<DialogueTurn>>,
    summaries: HashMap<JobId, Summary>,
    insights: HashMap<JobId, Vec<Insight>>,
}

impl Tables {
    /// Version-checked overwrite of the job row.
    fn write_job(&mut self, job: &Job, expected: ExpectedVersion) -> Result<Job, StoreError> {
        let current = self
            .jobs
            .get(&job.id)
            .ok_or(StoreError::NotFound(job.id))?;

        if !expected.matches(current.version) {
            return Err(StoreError::version_mismatch(job.id, expected, current.version));
        }

        let mut stored = job.clone();
        stored.version = current.version + 1;
        stored.created_at = current.created_at;
        self.jobs.insert(job.id, stored.clone());
        Ok(stored)
    }
}

/// In-memory job store.
///
/// Intended for tests/dev. All tables sit behind one lock so `commit_stage`
/// is trivially atomic.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    tables: RwLock<Tables>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Tables>, StoreError> {
        self.tables
            .read()
            .map_err(|_| StoreError::Storage("lock poisoned".to_string()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Tables>, StoreError> {
        self.tables
            .write()
            .map_err(|_| StoreError::Storage("lock poisoned".to_string()))
    }
}

impl JobStore for InMemoryJobStore {
    fn insert(&self, job: &Job) -> Result<Job, StoreError> {
        if job.version != 0 {
            return Err(StoreError::InvalidWrite(format!(
                "new job {} must start at version 0, got {}",
                job.id, job.version
            )));
        }

        let mut tables = self.write()?;
        if tables.jobs.contains_key(&job.id) {
            return Err(StoreError::AlreadyExists(job.id));
        }
        tables.jobs.insert(job.id, job.clone());
        Ok(job.clone())
    }

    fn get(&self, job_id: JobId) -> Result<Option<Job>, StoreError> {
        Ok(self.read()?.jobs.get(&job_id).cloned())
    }

    fn update(&self, job: &Job, expected: ExpectedVersion) -> Result<Job, StoreError> {
        self.write()?.write_job(job, expected)
    }

    fn commit_stage(
        &self,
        job: &Job,
        expected: ExpectedVersion,
        output: StageOutput,
    ) -> Result<Job, StoreError> {
        output.check_owner(job.id)?;

        let mut tables = self.write()?;
        let stored = tables.write_job(job, expected)?;
        match output {
            StageOutput::Turns(mut turns) => {
                turns.sort_by_key(|t| t.seq);
                tables.turns.insert(job.id, turns);
            }
            StageOutput::Summary(summary) => {
                tables.summaries.insert(job.id, summary);
            }
            StageOutput::Insights(insights) => {
                tables.insights.insert(job.id, insights);
            }
        }
        Ok(stored)
    }

    fn turns(&self, job_id: JobId) -> Result<Vec<DialogueTurn>, StoreError> {
        Ok(self.read()?.turns.get(&job_id).cloned().unwrap_or_default())
    }

    fn summary(&self, job_id: JobId) -> Result<Option<Summary>, StoreError> {
        Ok(self.read()?.summaries.get(&job_id).cloned())
    }

    fn insights(&self, job_id: JobId) -> Result<Vec<Insight>, StoreError> {
        Ok(self.read()?.insights.get(&job_id).cloned().unwrap_or_default())
    }

    fn snapshot(&self, job_id: JobId) -> Result<Option<JobSnapshot>, StoreError> {
        let tables = self.read()?;
        Ok(tables.jobs.get(&job_id).map(|job| JobSnapshot {
            job: job.clone(),
            turns: tables.turns.get(&job_id).cloned().unwrap_or_default(),
            summary: tables.summaries.get(&job_id).cloned(),
            insights: tables.insights.get(&job_id).cloned().unwrap_or_default(),
        }))
    }

    fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError> {
        let tables = self.read()?;
        let mut jobs: Vec<Job> = tables
            .jobs
            .values()
            .filter(|job| filter.matches(job))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        if let Some(limit) = filter.limit {
            jobs.truncate(limit);
        }
        Ok(jobs)
    }
}
