//! A fixed-size pool of threads running one `StageWorker` each.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{error, info};

use callpipe_core::Stage;

use crate::broker::QueueBroker;
use crate::store::JobStore;

use super::stage_worker::{Outcome, StageWorker, WorkerError};

/// Idle polling cadence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    /// Delay after the first empty lease.
    pub interval: Duration,
    /// The delay doubles on consecutive empty leases up to this cap.
    pub max_interval: Duration,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(5),
        }
    }
}

/// Pool runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Messages leased and handled (everything except `Idle`).
    pub processed: u64,
    pub advanced: u64,
    pub completed: u64,
    pub retried: u64,
    pub failed: u64,
    pub discarded: u64,
    pub cancelled: u64,
    /// Store/broker errors that left a message for redelivery.
    pub errors: u64,
}

impl PoolStats {
    fn record(&mut self, outcome: &Outcome) {
        if matches!(outcome, Outcome::Idle) {
            return;
        }
        self.processed += 1;
        match outcome {
            Outcome::Idle => {}
            Outcome::Advanced { .. } => self.advanced += 1,
            Outcome::Completed { .. } => self.completed += 1,
            Outcome::Retrying { .. } => self.retried += 1,
            Outcome::Failed { .. } => self.failed += 1,
            Outcome::Cancelled { .. } => self.cancelled += 1,
            Outcome::Discarded { .. } => self.discarded += 1,
        }
    }
}

/// Handle to control and join a running pool.
#[derive(Debug)]
pub struct PoolHandle {
    stage: Stage,
    shutdown: Arc<AtomicBool>,
    joins: Vec<thread::JoinHandle<()>>,
    stats: Arc<Mutex<PoolStats>>,
    started: Instant,
}

impl PoolHandle {
    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn workers(&self) -> usize {
        self.joins.len()
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    /// Get current pool statistics.
    pub fn stats(&self) -> PoolStats {
        self.stats
            .lock()
            .map(|s| s.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    /// Request graceful shutdown and wait for every worker to finish its current message.
    pub fn shutdown(self) -> PoolStats {
        self.shutdown.store(true, Ordering::SeqCst);
        let stats = Arc::clone(&self.stats);
        for join in self.joins {
            let _ = join.join();
        }
        info!(stage = %self.stage, "worker pool stopped");
        stats
            .lock()
            .map(|s| s.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }
}

/// Stage worker pool.
///
/// Each thread loops lease -> handle. Workers share nothing but the store and
/// broker, so adding threads only adds throughput.
pub struct StageWorkerPool;

impl StageWorkerPool {
    /// Spawn `workers` threads for `worker`'s stage.
    pub fn spawn<S, B>(
        worker: StageWorker<S, B>,
        workers: usize,
        poll: PollSettings,
    ) -> Result<PoolHandle, WorkerError>
    where
        S: JobStore + Clone + 'static,
        B: QueueBroker + Clone + 'static,
    {
        let stage = worker.stage();
        let shutdown = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(Mutex::new(PoolStats::default()));
        let mut joins = Vec::with_capacity(workers);

        for idx in 0..workers.max(1) {
            let name = format!("{}-{}", worker.name(), idx);
            let worker = worker.clone().with_name(name.clone());
            let shutdown_flag = Arc::clone(&shutdown);
            let stats = Arc::clone(&stats);

            let spawned = thread::Builder::new()
                .name(name)
                .spawn(move || worker_loop(worker, shutdown_flag, stats, poll));

            match spawned {
                Ok(join) => joins.push(join),
                Err(e) => {
                    // Stop whatever already started before reporting.
                    shutdown.store(true, Ordering::SeqCst);
                    for join in joins {
                        let _ = join.join();
                    }
                    return Err(WorkerError::Spawn(e.to_string()));
                }
            }
        }

        info!(stage = %stage, workers = joins.len(), "worker pool started");
        Ok(PoolHandle {
            stage,
            shutdown,
            joins,
            stats,
            started: Instant::now(),
        })
    }
}

fn worker_loop<S, B>(
    worker: StageWorker<S, B>,
    shutdown: Arc<AtomicBool>,
    stats: Arc<Mutex<PoolStats>>,
    poll: PollSettings,
) where
    S: JobStore,
    B: QueueBroker,
{
    info!(worker = worker.name(), stage = %worker.stage(), "worker started");
    let mut idle_delay = poll.interval;

    while !shutdown.load(Ordering::SeqCst) {
        match worker.process_next() {
            Ok(Outcome::Idle) => {
                sleep_unless_shutdown(idle_delay, &shutdown);
                idle_delay = (idle_delay * 2).min(poll.max_interval);
            }
            Ok(outcome) => {
                if let Ok(mut s) = stats.lock() {
                    s.record(&outcome);
                }
                idle_delay = poll.interval;
            }
            Err(e) => {
                error!(worker = worker.name(), error = %e, "worker iteration failed");
                if let Ok(mut s) = stats.lock() {
                    s.errors += 1;
                }
                sleep_unless_shutdown(poll.max_interval, &shutdown);
            }
        }
    }

    info!(worker = worker.name(), "worker stopped");
}

/// Sleep in short slices so shutdown is noticed promptly.
fn sleep_unless_shutdown(total: Duration, shutdown: &AtomicBool) {
    let slice = Duration::from_millis(10);
    let deadline = Instant::now() + total;
    while !shutdown.load(Ordering::SeqCst) {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        thread::sleep(slice.min(deadline - now));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use callpipe_core::{
        AudioRef, Channel, DialogueTurn, ExpectedVersion, HandlerError, InsightDraft, Job,
        JobSource, JobStatus, StageHandlers, Summary, TurnDraft,
    };

    use crate::broker::InMemoryBroker;
    use crate::retry::RetryPolicy;
    use crate::store::InMemoryJobStore;
    use crate::worker::WorkerSettings;

    fn handlers() -> StageHandlers {
        StageHandlers::new(
            |_: &AudioRef| -> Result<Vec<TurnDraft>, HandlerError> {
                Ok(vec![TurnDraft::new(Channel::Caller, 0, 10, "hello")])
            },
            |_: &[DialogueTurn]| -> Result<String, HandlerError> { Ok("greeting".into()) },
            |_: &Summary, _: &[DialogueTurn]| -> Result<Vec<InsightDraft>, HandlerError> {
                Ok(vec![])
            },
        )
    }

    fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if check() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        check()
    }

    #[test]
    fn pool_drains_queue_and_reports_stats() {
        let store = Arc::new(InMemoryJobStore::new());
        let broker = Arc::new(InMemoryBroker::new());
        let mut ids = Vec::new();
        for _ in 0..10 {
            let mut job = Job::new(AudioRef::parse("a.wav").unwrap(), JobSource::Audio, None);
            store.insert(&job).unwrap();
            job.enqueue_entry_stage().unwrap();
            store.update(&job, ExpectedVersion::Exact(0)).unwrap();
            broker.enqueue(Stage::Stt, job.id).unwrap();
            ids.push(job.id);
        }

        let worker = StageWorker::new(
            Stage::Stt,
            Arc::clone(&store),
            Arc::clone(&broker),
            handlers(),
            WorkerSettings {
                retry: RetryPolicy::immediate(),
                ..WorkerSettings::default()
            },
        );
        let pool = StageWorkerPool::spawn(
            worker,
            3,
            PollSettings {
                interval: Duration::from_millis(5),
                max_interval: Duration::from_millis(20),
            },
        )
        .unwrap();
        assert_eq!(pool.workers(), 3);

        assert!(wait_until(Duration::from_secs(5), || {
            pool.stats().advanced == 10
        }));
        let stats = pool.shutdown();

        assert_eq!(stats.processed, 10);
        assert_eq!(stats.errors, 0);
        for id in ids {
            assert_eq!(
                store.get(id).unwrap().unwrap().status,
                JobStatus::Queued(Stage::Summary)
            );
        }
        assert_eq!(broker.depth(Stage::Summary).unwrap(), 10);
    }

    #[test]
    fn idle_pool_shuts_down_promptly() {
        let worker = StageWorker::new(
            Stage::Postprocess,
            Arc::new(InMemoryJobStore::new()),
            Arc::new(InMemoryBroker::new()),
            handlers(),
            WorkerSettings::default(),
        );
        let pool = StageWorkerPool::spawn(
            worker,
            2,
            PollSettings {
                interval: Duration::from_millis(10),
                max_interval: Duration::from_secs(10),
            },
        )
        .unwrap();
        thread::sleep(Duration::from_millis(50));

        let started = Instant::now();
        let stats = pool.shutdown();

        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(stats, PoolStats::default());
    }
}
