//! Building every forecast hour of a variable, then publishing it.

use std::collections::HashSet;

use futures::stream::{self, StreamExt};
use tracing::{debug, info, instrument, warn};

use ingestion::Model;
use storage::{PublishOutcome, StoreError};
use wx_common::{Region, RunId, RunSelector};

use crate::error::Result;
use crate::orchestrator::Pipeline;
use crate::stage::StageOutcome;

/// What one build pass did for a (model, run, variable).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BuildReport {
    pub var: String,
    /// Forecast hours the variable should have.
    pub expected: usize,
    /// Already staged before this pass.
    pub skipped: usize,
    pub staged: Vec<u32>,
    pub not_ready: Vec<(u32, String)>,
    /// Frames that failed on their own; siblings were unaffected.
    pub failed: Vec<(u32, String)>,
    /// `None` while the publish gate is not met.
    pub publish: Option<PublishOutcome>,
}

impl BuildReport {
    /// Every expected frame is staged.
    pub fn is_complete(&self) -> bool {
        self.skipped + self.staged.len() == self.expected
    }
}

impl Pipeline {
    /// Stage every missing forecast hour of a variable through the worker
    /// pool, then publish what is staged.
    ///
    /// Frame-local failures are reported and skipped. Any other failure,
    /// such as a fatal upstream error, aborts the pass.
    #[instrument(skip_all, fields(model = %model, run = %run, var = %var))]
    pub async fn build_variable(
        &self,
        model: Model,
        region: &Region,
        run: &RunId,
        var: &str,
        forecast_hours: &[u32],
    ) -> Result<BuildReport> {
        let _active = self.activate(model, run);
        let var = self.acquisition.registry().resolve(model, var)?.spec.id;

        let staged_before: HashSet<u32> = self
            .staging
            .rebuild_staging_manifest(model.id(), run, &var)
            .await?
            .frames
            .iter()
            .map(|f| f.fhr)
            .collect();
        let pending: Vec<u32> = forecast_hours
            .iter()
            .copied()
            .filter(|fhr| !staged_before.contains(fhr))
            .collect();

        let mut report = BuildReport {
            var: var.clone(),
            expected: forecast_hours.len(),
            skipped: forecast_hours.len() - pending.len(),
            ..Default::default()
        };

        let selector = RunSelector::Run(run.clone());
        let results: Vec<_> = stream::iter(pending)
            .map(|fhr| {
                let selector = &selector;
                let var = &var;
                async move { (fhr, self.stage_frame(model, region, selector, var, fhr).await) }
            })
            .buffer_unordered(self.config.max_concurrent.max(1))
            .collect()
            .await;

        let mut fatal = None;
        for (fhr, result) in results {
            match result {
                Ok(StageOutcome::Staged(_)) => report.staged.push(fhr),
                Ok(StageOutcome::NotReady { reason, .. }) => report.not_ready.push((fhr, reason)),
                Err(e) if e.is_frame_local() => report.failed.push((fhr, e.to_string())),
                Err(e) => {
                    warn!(fhr, error = %e, "Build pass aborted");
                    fatal.get_or_insert(e);
                }
            }
        }
        if let Some(e) = fatal {
            return Err(e);
        }
        report.staged.sort_unstable();
        report.not_ready.sort_by_key(|(fhr, _)| *fhr);
        report.failed.sort_by_key(|(fhr, _)| *fhr);

        let publish = if report.is_complete() {
            self.publisher
                .publish_complete(model.id(), run, &var, report.expected)
                .await
        } else {
            self.publisher.publish_from_staging(model.id(), run, &var).await
        };
        report.publish = match publish {
            Ok(outcome) => Some(outcome),
            Err(StoreError::GateNotMet { staged, gate, .. }) => {
                debug!(staged, gate, "Publish gate not met yet");
                None
            }
            Err(e) => return Err(e.into()),
        };

        info!(
            staged = report.staged.len(),
            skipped = report.skipped,
            not_ready = report.not_ready.len(),
            failed = report.failed.len(),
            published = report.publish.is_some(),
            "Build pass finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_completeness() {
        let mut report = BuildReport {
            expected: 3,
            skipped: 1,
            staged: vec![3],
            ..Default::default()
        };
        assert!(!report.is_complete());
        report.staged.push(6);
        assert!(report.is_complete());
    }
}
