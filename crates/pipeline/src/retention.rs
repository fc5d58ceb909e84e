//! Retention over the raw cache, the published tree and staging.

use std::collections::HashSet;

use tracing::{info, instrument};

use ingestion::Model;
use storage::{enforce_retention, CacheConfig, RetentionSummary};
use wx_common::RunId;

use crate::error::Result;
use crate::orchestrator::Pipeline;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetentionReport {
    pub cache: RetentionSummary,
    pub published: RetentionSummary,
    /// Staging runs dropped because a newer run is published.
    pub discarded_staging: Vec<RunId>,
}

impl Pipeline {
    /// Keep the newest `keep_runs` cycles of a model.
    ///
    /// The run the pointer names and every run being built are protected
    /// even when they fall outside the window. Idle lock entries are pruned
    /// on the way out.
    #[instrument(skip_all, fields(model = %model))]
    pub async fn enforce_retention(&self, model: Model) -> Result<RetentionReport> {
        let pointer = self.publisher.read_pointer(model.id()).await?.map(|p| p.run);
        let active = self.active_runs_for(model);
        let protected: HashSet<String> = pointer
            .iter()
            .chain(active.iter())
            .map(|r| r.to_string())
            .collect();

        let layout = self.layout();
        let keep = self.config.keep_runs;
        let cache_cfg = CacheConfig::new(layout.cache_model_dir(model.id())?, keep);
        let published_cfg = CacheConfig::new(layout.published_model_dir(model.id())?, keep);
        let (cache, published) = tokio::task::spawn_blocking(move || {
            let cache = enforce_retention(&cache_cfg, &protected)?;
            let published = enforce_retention(&published_cfg, &protected)?;
            Ok::<_, storage::StoreError>((cache, published))
        })
        .await??;

        let mut discarded_staging = Vec::new();
        if let Some(pointer) = &pointer {
            for run in self.staging.staged_runs(model.id()).await? {
                let superseded = run < *pointer
                    && !active.contains(&run)
                    && !published.kept_cycles.contains(&run.to_string());
                if superseded {
                    self.staging.discard_run(model.id(), &run).await?;
                    discarded_staging.push(run);
                }
            }
        }

        self.prune_locks();

        info!(
            cache_deleted = cache.deleted_cycles.len(),
            published_deleted = published.deleted_cycles.len(),
            staging_discarded = discarded_staging.len(),
            failures = cache.failures.len() + published.failures.len(),
            "Retention pass finished"
        );
        Ok(RetentionReport {
            cache,
            published,
            discarded_staging,
        })
    }
}
