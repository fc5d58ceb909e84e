//! One frame: fetch, decode, derive, encode, stage.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use encoding::{target_size, EncodedFrame, FrameTarget, Resampling};
use ingestion::{
    decode_with_relaxation, derive_composite, DecodedField, FetchRequest, FetchResult,
    FieldDecoder, FieldSelection, IngestionError, Model, Plan, ResolvedVariable,
};
use storage::FrameSidecar;
use wx_common::{FrameId, OutputMode, PaletteKind, Region, RunId, RunSelector, ValidTime};

use crate::error::{PipelineError, Result};
use crate::orchestrator::Pipeline;

/// A frame that made it into staging.
#[derive(Debug, Clone, PartialEq)]
pub struct StagedFrame {
    pub run: RunId,
    pub var: String,
    pub frame_id: String,
    pub output_mode: OutputMode,
    pub palette_kind: PaletteKind,
    pub resampling: Resampling,
    /// Frames staged for the variable after this one.
    pub staged: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StageOutcome {
    Staged(StagedFrame),
    /// Upstream has not published the inputs yet; nothing was written.
    NotReady { run: RunId, reason: String },
}

impl StageOutcome {
    pub fn is_staged(&self) -> bool {
        matches!(self, StageOutcome::Staged(_))
    }

    /// The staged frame, or [`PipelineError::NotReady`] for callers that
    /// need the frame now.
    pub fn into_staged(self, model: Model, var: &str, fhr: u32) -> Result<StagedFrame> {
        match self {
            StageOutcome::Staged(frame) => Ok(frame),
            StageOutcome::NotReady { run, reason } => Err(PipelineError::NotReady {
                model: model.to_string(),
                run: run.to_string(),
                var: var.to_string(),
                fhr,
                reason,
            }),
        }
    }
}

impl Pipeline {
    /// Build one frame and stage it. Re-staging a frame replaces it.
    ///
    /// Holds a worker slot for the whole unit of work.
    #[instrument(skip_all, fields(model = %model, run = %run, var = %var, fhr = fhr))]
    pub async fn stage_frame(
        &self,
        model: Model,
        region: &Region,
        run: &RunSelector,
        var: &str,
        fhr: u32,
    ) -> Result<StageOutcome> {
        let _permit = self
            .workers
            .acquire()
            .await
            .map_err(|e| PipelineError::Worker(e.to_string()))?;

        let request = FetchRequest {
            model,
            run: run.clone(),
            forecast_hour: fhr,
            variable: var.to_string(),
            region: region.clone(),
        };
        let resolved = self.acquisition.validate(&request)?;
        let fetched = self.acquisition.fetch(&request).await?;
        if let Some(reason) = fetched.not_ready_reason.clone() {
            debug!(reason = %reason, "Frame not ready");
            return Ok(StageOutcome::NotReady {
                run: fetched.run,
                reason,
            });
        }

        let run = fetched.run.clone();
        let var = resolved.spec.id.clone();
        let frame = FrameId::from_hour(fhr).map_err(IngestionError::from)?;
        let tile_path = self
            .staging
            .scratch_tile_path(model.id(), &run, &var, frame)
            .await?;

        let decoder = Arc::clone(&self.decoder);
        let encoder = Arc::clone(&self.encoder);
        let target = FrameTarget {
            region: region.clone(),
            size: (0, 0),
            path: tile_path.clone(),
        };
        let built = tokio::task::spawn_blocking(move || -> Result<EncodedFrame> {
            let field = decode_field(decoder.as_ref(), model, &resolved, &fetched)?;
            let target = FrameTarget {
                size: target_size(&field, &target.region.bounds),
                ..target
            };
            Ok(encoder.encode_frame(&field, &resolved.spec, &target)?)
        })
        .await
        .map_err(PipelineError::from)
        .and_then(|r| r);

        let encoded = match built {
            Ok(encoded) => encoded,
            Err(e) => {
                tokio::fs::remove_file(&tile_path).await.ok();
                metrics::counter!("frames_failed_total", "model" => model.id()).increment(1);
                warn!(error = %e, "Frame build failed");
                return Err(e);
            }
        };

        let sidecar = FrameSidecar {
            frame_id: frame.to_string(),
            fhr,
            valid_time: ValidTime::for_run(&run, fhr).map(|t| t.to_iso8601()),
            units: encoded.units.clone(),
            output_mode: encoded.output_mode,
            palette_kind: encoded.palette_kind,
            tile_file: String::new(),
        };
        let manifest = self
            .staging
            .put_frame(model.id(), &run, &var, &encoded.tile_path, &sidecar)
            .await?;

        metrics::counter!("frames_staged_total", "model" => model.id()).increment(1);
        info!(
            run = %run,
            resampling = %encoded.resampling,
            staged = manifest.frames.len(),
            "Frame built"
        );
        Ok(StageOutcome::Staged(StagedFrame {
            run,
            var,
            frame_id: sidecar.frame_id,
            output_mode: encoded.output_mode,
            palette_kind: encoded.palette_kind,
            resampling: encoded.resampling,
            staged: manifest.frames.len(),
        }))
    }
}

/// Decode the fetched payloads and combine composites.
pub(crate) fn decode_field(
    decoder: &dyn FieldDecoder,
    model: Model,
    resolved: &ResolvedVariable,
    fetched: &FetchResult,
) -> ingestion::Result<DecodedField> {
    let variable = &resolved.spec.id;
    match &resolved.plan {
        Plan::Primary(selection) => decode_one(decoder, variable, selection, fetched.path.as_ref()),
        Plan::Derived { kind, components } => {
            let paths = fetched.component_paths.clone().unwrap_or_default();
            let mut fields = BTreeMap::new();
            for (role, selection) in components {
                let field = decode_one(decoder, variable, selection, paths.get(role))?;
                fields.insert(role.clone(), field);
            }
            derive_composite(model, *kind, variable, &fields)
        }
    }
}

fn decode_one(
    decoder: &dyn FieldDecoder,
    variable: &str,
    selection: &FieldSelection,
    path: Option<&PathBuf>,
) -> ingestion::Result<DecodedField> {
    let path = path.ok_or_else(|| IngestionError::Derivation {
        variable: variable.to_string(),
        reason: format!("no payload fetched for '{}'", selection.var_id),
    })?;
    decode_with_relaxation(decoder, path, &selection.filter_keys, &selection.search).map_err(
        |source| IngestionError::Decode {
            variable: selection.var_id.clone(),
            source,
        },
    )
}
