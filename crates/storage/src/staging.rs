//! The staging area: frames accumulate here before a variable is published.
//!
//! The filesystem is the source of truth. The staging manifest is always
//! recomputed from the sidecars physically present, so a crash between
//! writing a frame and updating the manifest is repaired by the next rebuild.

use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::{debug, info, instrument, warn};

use wx_common::{FrameId, RunId};

use crate::atomic::{commit_file, read_json, temp_path_for, write_json_atomic};
use crate::error::{StoreError, StoreResult};
use crate::layout::{frame_of_sidecar, sidecar_file_name, tile_file_name, StoreLayout, MANIFEST_FILE};
use crate::locks::KeyedLocks;
use crate::manifest::{FrameSidecar, StagingManifest};

type StagingKey = (String, RunId, String);

/// Working area for frames that are not yet visible to readers.
#[derive(Debug)]
pub struct StagingArea {
    layout: StoreLayout,
    locks: KeyedLocks<StagingKey>,
}

impl StagingArea {
    pub fn new(layout: StoreLayout) -> Self {
        Self {
            layout,
            locks: KeyedLocks::new(),
        }
    }

    pub fn layout(&self) -> &StoreLayout {
        &self.layout
    }

    pub fn var_dir(&self, model: &str, run: &RunId, var: &str) -> StoreResult<PathBuf> {
        self.layout.staging_var_dir(model, run, var)
    }

    /// Drop manifest locks nobody holds. Entries come back on the next rebuild.
    pub fn prune_locks(&self) {
        self.locks.prune();
    }

    pub fn lock_count(&self) -> usize {
        self.locks.len()
    }

    /// A fresh temp path in the variable's staging directory for the encoder
    /// to write a tile into. The directory is created.
    pub async fn scratch_tile_path(
        &self,
        model: &str,
        run: &RunId,
        var: &str,
        frame: FrameId,
    ) -> StoreResult<PathBuf> {
        let dir = self.var_dir(model, run, var)?;
        fs::create_dir_all(&dir).await.map_err(StoreError::io(&dir))?;
        Ok(temp_path_for(&dir.join(tile_file_name(frame))))
    }

    /// Move an encoded tile into place, write its sidecar and rebuild the
    /// staging manifest. Re-staging a frame replaces it.
    #[instrument(skip(self, tile, sidecar), fields(fid = %sidecar.frame_id))]
    pub async fn put_frame(
        &self,
        model: &str,
        run: &RunId,
        var: &str,
        tile: &Path,
        sidecar: &FrameSidecar,
    ) -> StoreResult<StagingManifest> {
        let frame = sidecar.frame().ok_or_else(|| {
            StoreError::ContractViolation(format!(
                "sidecar frame_id '{}' does not encode fhr {}",
                sidecar.frame_id, sidecar.fhr
            ))
        })?;
        let dir = self.var_dir(model, run, var)?;
        let tile_name = tile_file_name(frame);

        commit_file(tile, &dir.join(&tile_name)).await?;
        let sidecar = FrameSidecar {
            tile_file: tile_name,
            ..sidecar.clone()
        };
        write_json_atomic(&dir.join(sidecar_file_name(frame)), &sidecar).await?;

        let manifest = self.rebuild_staging_manifest(model, run, var).await?;
        info!(
            model = %model,
            run = %run,
            var = %var,
            staged = manifest.frames.len(),
            "Frame staged"
        );
        Ok(manifest)
    }

    /// Recompute the staging manifest from the sidecars on disk.
    ///
    /// Serialized per (model, run, variable). Output is deterministic, so two
    /// rebuilds with nothing staged in between write identical bytes.
    pub async fn rebuild_staging_manifest(
        &self,
        model: &str,
        run: &RunId,
        var: &str,
    ) -> StoreResult<StagingManifest> {
        let dir = self.var_dir(model, run, var)?;
        let _guard = self
            .locks
            .lock(&(model.to_string(), run.clone(), var.to_string()))
            .await;

        let frames = scan_frames(&dir).await?;
        let manifest = StagingManifest {
            model: model.to_string(),
            run: run.clone(),
            var: var.to_string(),
            frames,
        };
        if dir.exists() {
            write_json_atomic(&dir.join(MANIFEST_FILE), &manifest).await?;
        }
        Ok(manifest)
    }

    /// The last written staging manifest, if any.
    pub async fn load_staging_manifest(
        &self,
        model: &str,
        run: &RunId,
        var: &str,
    ) -> StoreResult<Option<StagingManifest>> {
        read_json(&self.var_dir(model, run, var)?.join(MANIFEST_FILE)).await
    }

    /// Runs with anything staged for a model.
    pub async fn staged_runs(&self, model: &str) -> StoreResult<Vec<RunId>> {
        let dir = self.layout.staging_model_dir(model)?;
        let mut runs = Vec::new();
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(runs),
            Err(e) => return Err(StoreError::io(&dir)(e)),
        };
        while let Some(entry) = entries.next_entry().await.map_err(StoreError::io(&dir))? {
            if let Ok(run) = RunId::parse(&entry.file_name().to_string_lossy()) {
                runs.push(run);
            }
        }
        runs.sort();
        Ok(runs)
    }

    /// Remove a run's staging directory once it is no longer needed.
    pub async fn discard_run(&self, model: &str, run: &RunId) -> StoreResult<()> {
        let dir = self.layout.staging_model_dir(model)?.join(run.as_str());
        match fs::remove_dir_all(&dir).await {
            Ok(()) => {
                debug!(model = %model, run = %run, "Discarded staging run");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::io(&dir)(e)),
        }
    }
}

/// Read every valid `<fid>.json` whose tile exists, sorted by forecast hour.
pub(crate) async fn scan_frames(dir: &Path) -> StoreResult<Vec<FrameSidecar>> {
    let mut frames = Vec::new();
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(frames),
        Err(e) => return Err(StoreError::io(dir)(e)),
    };

    while let Some(entry) = entries.next_entry().await.map_err(StoreError::io(dir))? {
        let name = entry.file_name().to_string_lossy().into_owned();
        let Some(frame) = frame_of_sidecar(&name) else {
            continue;
        };
        let sidecar: FrameSidecar = match read_json(&entry.path()).await {
            Ok(Some(s)) => s,
            Ok(None) => continue,
            Err(e) => {
                warn!(path = %entry.path().display(), error = %e, "Skipping unreadable sidecar");
                continue;
            }
        };
        if sidecar.frame() != Some(frame) {
            warn!(path = %entry.path().display(), "Sidecar does not match its file name");
            continue;
        }
        if !dir.join(&sidecar.tile_file).exists() {
            continue;
        }
        frames.push(sidecar);
    }

    frames.sort_by_key(|f| f.fhr);
    Ok(frames)
}
