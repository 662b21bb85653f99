//! Wiring: one dispatcher, one projection, one reconciler and a worker pool per stage.

use std::collections::BTreeMap;

use tracing::info;

use callpipe_core::{Stage, StageHandlers};

use crate::broker::QueueBroker;
use crate::config::PipelineConfig;
use crate::dispatcher::Dispatcher;
use crate::projection::StatusProjection;
use crate::reconcile::Reconciler;
use crate::storage::AudioStorage;
use crate::store::JobStore;
use crate::worker::{PoolHandle, PoolStats, StageWorker, StageWorkerPool, WorkerError};

/// A running pipeline over a shared store and broker.
pub struct Pipeline<S, B, A> {
    dispatcher: Dispatcher<S, B, A>,
    projection: StatusProjection<S>,
    reconciler: Reconciler<S, B>,
    pools: Vec<PoolHandle>,
}

impl<S, B, A> Pipeline<S, B, A>
where
    S: JobStore + Clone + 'static,
    B: QueueBroker + Clone + 'static,
    A: AudioStorage,
{
    /// Start every stage's worker pool as configured.
    pub fn start(
        config: &PipelineConfig,
        store: S,
        broker: B,
        storage: A,
        handlers: StageHandlers,
    ) -> Result<Self, WorkerError> {
        let mut pools: Vec<PoolHandle> = Vec::with_capacity(Stage::ALL.len());
        for stage in Stage::ALL {
            let worker = StageWorker::new(
                stage,
                store.clone(),
                broker.clone(),
                handlers.clone(),
                config.worker_settings(stage),
            );
            match StageWorkerPool::spawn(worker, config.stage(stage).workers, config.poll) {
                Ok(pool) => pools.push(pool),
                Err(e) => {
                    for pool in pools {
                        pool.shutdown();
                    }
                    return Err(e);
                }
            }
        }
        info!(service = %config.service_name, "pipeline started");

        Ok(Self {
            dispatcher: Dispatcher::new(store.clone(), broker.clone(), storage),
            projection: StatusProjection::new(store.clone(), config.job_list_limit),
            reconciler: Reconciler::new(store, broker, config.reconcile_grace),
            pools,
        })
    }

    pub fn dispatcher(&self) -> &Dispatcher<S, B, A> {
        &self.dispatcher
    }

    pub fn projection(&self) -> &StatusProjection<S> {
        &self.projection
    }

    pub fn reconciler(&self) -> &Reconciler<S, B> {
        &self.reconciler
    }

    pub fn stats(&self) -> BTreeMap<Stage, PoolStats> {
        self.pools.iter().map(|p| (p.stage(), p.stats())).collect()
    }

    /// Stop all pools, letting in-flight messages finish.
    pub fn shutdown(self) -> BTreeMap<Stage, PoolStats> {
        let stats = self
            .pools
            .into_iter()
            .map(|p| (p.stage(), p.shutdown()))
            .collect();
        info!("pipeline stopped");
        stats
    }
}
