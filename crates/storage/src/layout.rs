//! On-disk layout of the data directory.
//!
//! ```text
//! <root>/cache/<model>/<YYYYMMDD>/<HH>/<model>.t<HH>z.f<FFF>.<var>.grib2
//! <root>/staging/<model>/<run>/<var>/<fid>.tif | <fid>.json | manifest.json
//! <root>/published/<model>/LATEST.json
//! <root>/published/<model>/LATEST.previous.json
//! <root>/published/<model>/<run>/<var>/<fid>.tif | <fid>.json | manifest.json
//! ```
//!
//! Every segment is validated before it becomes part of a path.

use std::path::{Path, PathBuf};

use wx_common::{validate_segment, FrameId, RunId};

use crate::error::StoreResult;

pub const MANIFEST_FILE: &str = "manifest.json";
pub const POINTER_FILE: &str = "LATEST.json";
pub const PREVIOUS_POINTER_FILE: &str = "LATEST.previous.json";
pub const POINTER_HOLD_FILE: &str = "LATEST.hold.json";
pub const TILE_EXT: &str = "tif";
pub const SIDECAR_EXT: &str = "json";

/// Paths under one data directory.
#[derive(Debug, Clone)]
pub struct StoreLayout {
    root: PathBuf,
}

impl StoreLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn cache_root(&self) -> PathBuf {
        self.root.join("cache")
    }

    pub fn staging_root(&self) -> PathBuf {
        self.root.join("staging")
    }

    pub fn published_root(&self) -> PathBuf {
        self.root.join("published")
    }

    /// Raw cache directory of one model.
    pub fn cache_model_dir(&self, model: &str) -> StoreResult<PathBuf> {
        Ok(self.cache_root().join(validate_segment(model)?))
    }

    /// Raw cache directory of one cycle: `<model>/<YYYYMMDD>/<HH>`.
    pub fn cache_cycle_dir(&self, model: &str, run: &RunId) -> StoreResult<PathBuf> {
        Ok(self
            .cache_model_dir(model)?
            .join(run.date())
            .join(format!("{:02}", run.hour())))
    }

    /// Raw GRIB2 payload of one field. The variable is part of the name so
    /// fields of the same cycle never share a file.
    pub fn raw_field_path(
        &self,
        model: &str,
        run: &RunId,
        forecast_hour: u32,
        var: &str,
    ) -> StoreResult<PathBuf> {
        validate_segment(var)?;
        Ok(self.cache_cycle_dir(model, run)?.join(format!(
            "{}.t{:02}z.f{:03}.{}.grib2",
            model,
            run.hour(),
            forecast_hour,
            var
        )))
    }

    pub fn staging_model_dir(&self, model: &str) -> StoreResult<PathBuf> {
        Ok(self.staging_root().join(validate_segment(model)?))
    }

    pub fn staging_var_dir(&self, model: &str, run: &RunId, var: &str) -> StoreResult<PathBuf> {
        Ok(self
            .staging_model_dir(model)?
            .join(run.as_str())
            .join(validate_segment(var)?))
    }

    pub fn published_model_dir(&self, model: &str) -> StoreResult<PathBuf> {
        Ok(self.published_root().join(validate_segment(model)?))
    }

    pub fn published_run_dir(&self, model: &str, run: &RunId) -> StoreResult<PathBuf> {
        Ok(self.published_model_dir(model)?.join(run.as_str()))
    }

    pub fn published_var_dir(&self, model: &str, run: &RunId, var: &str) -> StoreResult<PathBuf> {
        Ok(self
            .published_run_dir(model, run)?
            .join(validate_segment(var)?))
    }

    pub fn pointer_path(&self, model: &str) -> StoreResult<PathBuf> {
        Ok(self.published_model_dir(model)?.join(POINTER_FILE))
    }

    pub fn previous_pointer_path(&self, model: &str) -> StoreResult<PathBuf> {
        Ok(self.published_model_dir(model)?.join(PREVIOUS_POINTER_FILE))
    }

    /// Present while an operator rollback pins the pointer.
    pub fn pointer_hold_path(&self, model: &str) -> StoreResult<PathBuf> {
        Ok(self.published_model_dir(model)?.join(POINTER_HOLD_FILE))
    }
}

pub fn tile_file_name(frame: FrameId) -> String {
    format!("{}.{}", frame, TILE_EXT)
}

pub fn sidecar_file_name(frame: FrameId) -> String {
    format!("{}.{}", frame, SIDECAR_EXT)
}

/// Frame id of a sidecar file name, `None` for anything else.
pub fn frame_of_sidecar(name: &str) -> Option<FrameId> {
    let stem = name.strip_suffix(".json")?;
    FrameId::parse(stem).ok()
}
