//! Periodic repair of jobs whose queue message went missing.
//!
//! A crash between a durable transition and its enqueue leaves a job in
//! `Uploaded` or `Queued_*` with nothing on the queue. The sweep re-enqueues
//! such jobs once they have been idle for longer than the grace period.
//! Re-enqueueing a job that still has a message is harmless: the duplicate
//! loses its version check and is dropped.

use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use callpipe_core::{ExpectedVersion, Job, JobError, JobSource, JobStatus, Stage};

use crate::broker::{BrokerError, QueueBroker};
use crate::store::{JobFilter, JobStore, StoreError};

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

/// What one sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub requeued: usize,
    /// Transcript jobs found in `Uploaded` without their turns.
    pub failed: usize,
    /// Jobs that changed while we looked at them.
    pub skipped: usize,
}

#[derive(Debug, Clone)]
pub struct Reconciler<S, B> {
    store: S,
    broker: B,
    grace: Duration,
    batch_size: usize,
}

impl<S, B> Reconciler<S, B>
where
    S: JobStore,
    B: QueueBroker,
{
    pub fn new(store: S, broker: B, grace: Duration) -> Self {
        Self {
            store,
            broker,
            grace,
            batch_size: 500,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Re-enqueue every stuck job older than the grace period.
    pub fn sweep(&self) -> Result<SweepReport, ReconcileError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.grace).unwrap_or(chrono::Duration::zero());

        let mut filter = JobFilter::default()
            .with_status(JobStatus::Uploaded)
            .updated_before(cutoff)
            .limit(self.batch_size);
        for stage in Stage::ALL {
            filter = filter.with_status(JobStatus::Queued(stage));
        }

        let mut report = SweepReport::default();
        for job in self.store.list(&filter)? {
            self.repair(job, &mut report)?;
        }

        if report != SweepReport::default() {
            info!(
                requeued = report.requeued,
                failed = report.failed,
                skipped = report.skipped,
                "reconciliation sweep finished"
            );
        }
        Ok(report)
    }

    fn repair(&self, job: Job, report: &mut SweepReport) -> Result<(), ReconcileError> {
        let observed = job.version;
        let job_id = job.id;
        let mut repaired = job;

        let stage = match (repaired.status, repaired.source) {
            (JobStatus::Uploaded, JobSource::Transcript) => {
                // Turns are committed together with leaving Uploaded, so they never landed.
                if repaired
                    .fail(JobError::validation("transcript was never persisted"))
                    .is_err()
                {
                    return Ok(());
                }
                None
            }
            (JobStatus::Uploaded, JobSource::Audio) => match repaired.enqueue_entry_stage() {
                Ok(stage) => Some(stage),
                Err(_) => return Ok(()),
            },
            (JobStatus::Queued(stage), _) => {
                repaired.touch();
                Some(stage)
            }
            _ => return Ok(()),
        };

        match self.store.update(&repaired, ExpectedVersion::Exact(observed)) {
            Ok(_) => {}
            Err(e) if e.is_conflict() => {
                debug!(job_id = %job_id, "job moved during sweep, skipping");
                report.skipped += 1;
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }

        match stage {
            Some(stage) => {
                self.broker.enqueue(stage, job_id)?;
                warn!(job_id = %job_id, stage = %stage, "re-enqueued stuck job");
                report.requeued += 1;
            }
            None => {
                warn!(job_id = %job_id, "failed orphaned transcript job");
                report.failed += 1;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use callpipe_core::AudioRef;

    use crate::broker::InMemoryBroker;
    use crate::store::InMemoryJobStore;

    fn fixture() -> (
        Reconciler<Arc<InMemoryJobStore>, Arc<InMemoryBroker>>,
        Arc<InMemoryJobStore>,
        Arc<InMemoryBroker>,
    ) {
        let store = Arc::new(InMemoryJobStore::new());
        let broker = Arc::new(InMemoryBroker::new());
        let reconciler = Reconciler::new(Arc::clone(&store), Arc::clone(&broker), Duration::ZERO);
        (reconciler, store, broker)
    }

    fn stored_job(store: &InMemoryJobStore, source: JobSource) -> Job {
        let job = Job::new(AudioRef::parse("a.wav").unwrap(), source, None);
        store.insert(&job).unwrap()
    }

    #[test]
    fn uploaded_audio_job_is_advanced_and_enqueued() {
        let (reconciler, store, broker) = fixture();
        let job = stored_job(&store, JobSource::Audio);
        std::thread::sleep(Duration::from_millis(2));

        let report = reconciler.sweep().unwrap();

        assert_eq!(report.requeued, 1);
        assert_eq!(
            store.get(job.id).unwrap().unwrap().status,
            JobStatus::Queued(Stage::Stt)
        );
        assert_eq!(broker.depth(Stage::Stt).unwrap(), 1);
    }

    #[test]
    fn queued_job_without_message_is_re_enqueued() {
        let (reconciler, store, broker) = fixture();
        let mut job = stored_job(&store, JobSource::Audio);
        job.enqueue_entry_stage().unwrap();
        job.claim(Stage::Stt).unwrap();
        job.advance(Stage::Stt).unwrap();
        store.update(&job, ExpectedVersion::Any).unwrap();
        std::thread::sleep(Duration::from_millis(2));

        let report = reconciler.sweep().unwrap();

        assert_eq!(report.requeued, 1);
        assert_eq!(broker.depth(Stage::Summary).unwrap(), 1);
        assert_eq!(
            store.get(job.id).unwrap().unwrap().status,
            JobStatus::Queued(Stage::Summary)
        );
    }

    #[test]
    fn orphaned_transcript_job_is_failed() {
        let (reconciler, store, _) = fixture();
        let job = stored_job(&store, JobSource::Transcript);
        std::thread::sleep(Duration::from_millis(2));

        let report = reconciler.sweep().unwrap();

        assert_eq!(report.failed, 1);
        let job = store.get(job.id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
    }

    #[test]
    fn recent_jobs_are_left_alone() {
        let store = Arc::new(InMemoryJobStore::new());
        let broker = Arc::new(InMemoryBroker::new());
        let reconciler =
            Reconciler::new(Arc::clone(&store), Arc::clone(&broker), Duration::from_secs(3600));
        stored_job(&store, JobSource::Audio);

        assert_eq!(reconciler.sweep().unwrap(), SweepReport::default());
        assert_eq!(broker.depth(Stage::Stt).unwrap(), 0);
    }
}
