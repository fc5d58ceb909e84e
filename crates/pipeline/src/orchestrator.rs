//! The pipeline handle and its publish-side operations.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::Semaphore;
use tracing::info;

use encoding::FrameEncoder;
use ingestion::{AcquisitionEngine, FieldDecoder, Model};
use storage::{
    LatestPointer, PublishOutcome, PublishPolicy, PublishState, Publisher, StagingArea, StoreLayout,
};
use wx_common::RunId;

use crate::error::Result;

/// Worker pool size and retention depth.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Frames built at once across all models and variables.
    pub max_concurrent: usize,
    /// Cycles kept in the raw cache and in the published tree.
    pub keep_runs: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            keep_runs: 2,
        }
    }
}

/// Builds frames into staging and promotes them.
///
/// One instance per process; share it behind an `Arc`.
pub struct Pipeline {
    pub(crate) acquisition: Arc<AcquisitionEngine>,
    pub(crate) decoder: Arc<dyn FieldDecoder>,
    pub(crate) encoder: Arc<FrameEncoder>,
    pub(crate) staging: Arc<StagingArea>,
    pub(crate) publisher: Publisher,
    pub(crate) workers: Arc<Semaphore>,
    pub(crate) config: PipelineConfig,
    active: Mutex<HashMap<(String, RunId), usize>>,
}

impl Pipeline {
    pub fn new(
        acquisition: Arc<AcquisitionEngine>,
        decoder: Arc<dyn FieldDecoder>,
        encoder: Arc<FrameEncoder>,
        layout: StoreLayout,
        publish_policy: PublishPolicy,
        config: PipelineConfig,
    ) -> Self {
        let staging = Arc::new(StagingArea::new(layout));
        let publisher = Publisher::new(Arc::clone(&staging), publish_policy);
        Self {
            acquisition,
            decoder,
            encoder,
            staging,
            publisher,
            workers: Arc::new(Semaphore::new(config.max_concurrent.max(1))),
            config,
            active: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn staging(&self) -> &StagingArea {
        &self.staging
    }

    pub fn layout(&self) -> &StoreLayout {
        self.staging.layout()
    }

    pub fn acquisition(&self) -> &AcquisitionEngine {
        &self.acquisition
    }

    /// Publish a variable's staged frames if the gate (or, once published,
    /// the delta) is met.
    pub async fn publish(&self, model: Model, run: &RunId, var: &str) -> Result<PublishOutcome> {
        let var = self.acquisition.registry().resolve(model, var)?.spec.id;
        Ok(self
            .publisher
            .publish_from_staging(model.id(), run, &var)
            .await?)
    }

    pub async fn status(&self, model: Model, run: &RunId, var: &str) -> Result<PublishState> {
        let var = self.acquisition.registry().resolve(model, var)?.spec.id;
        Ok(self.publisher.status(model.id(), run, &var).await?)
    }

    pub async fn latest(&self, model: Model) -> Result<Option<LatestPointer>> {
        Ok(self.publisher.read_pointer(model.id()).await?)
    }

    /// Operator action: restore the previous pointer.
    pub async fn rollback(&self, model: Model) -> Result<RunId> {
        let run = self.publisher.rollback(model.id()).await?;
        info!(model = %model, run = %run, "Rolled back");
        Ok(run)
    }

    /// Operator action: let publishes move the pointer again after a rollback.
    pub async fn release_hold(&self, model: Model) -> Result<bool> {
        Ok(self.publisher.release_hold(model.id()).await?)
    }

    /// Drop idle per-key locks of the staging area and the publisher.
    pub fn prune_locks(&self) {
        self.staging.prune_locks();
        self.publisher.prune_locks();
    }

    /// Live lock entries across staging and publish.
    pub fn lock_count(&self) -> usize {
        self.staging.lock_count() + self.publisher.lock_count()
    }

    /// Mark a run as being built until the guard drops. Retention never
    /// deletes an active run.
    pub(crate) fn activate(&self, model: Model, run: &RunId) -> ActiveRun<'_> {
        let key = (model.id().to_string(), run.clone());
        *self.active_runs().entry(key.clone()).or_insert(0) += 1;
        ActiveRun {
            pipeline: self,
            key,
        }
    }

    pub(crate) fn active_runs_for(&self, model: Model) -> Vec<RunId> {
        self.active_runs()
            .keys()
            .filter(|(m, _)| m == model.id())
            .map(|(_, run)| run.clone())
            .collect()
    }

    fn active_runs(&self) -> std::sync::MutexGuard<'_, HashMap<(String, RunId), usize>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }
}

pub(crate) struct ActiveRun<'a> {
    pipeline: &'a Pipeline,
    key: (String, RunId),
}

impl Drop for ActiveRun<'_> {
    fn drop(&mut self) {
        let mut active = self.pipeline.active_runs();
        if let Some(count) = active.get_mut(&self.key) {
            *count -= 1;
            if *count == 0 {
                active.remove(&self.key);
            }
        }
    }
}
