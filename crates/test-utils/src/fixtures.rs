//! Store and clock fixtures.

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use tempfile::TempDir;

use storage::{FrameSidecar, StagingArea, StagingManifest, StoreLayout};
use wx_common::{FrameId, ManualClock, OutputMode, PaletteKind, RunId, ValidTime};

/// 2026-02-07 12:00 UTC. With the GFS 4 h publication lag the latest cycle
/// is `20260207_06z`.
pub fn fixed_now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 2, 7, 12, 0, 0).unwrap()
}

/// A manual clock starting at [`fixed_now`].
pub fn manual_clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(fixed_now()))
}

pub fn run(id: &str) -> RunId {
    RunId::parse(id).unwrap()
}

/// A store rooted in a fresh temporary directory.
pub struct TestStore {
    pub dir: TempDir,
    pub layout: StoreLayout,
}

impl TestStore {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("Failed to create temporary store");
        let layout = StoreLayout::new(dir.path());
        Self { dir, layout }
    }

    pub fn staging(&self) -> Arc<StagingArea> {
        Arc::new(StagingArea::new(self.layout.clone()))
    }

    /// Stage a placeholder tile and sidecar for each forecast hour.
    pub async fn stage_frames(
        &self,
        staging: &StagingArea,
        model: &str,
        run: &RunId,
        var: &str,
        fhrs: &[u32],
    ) -> StagingManifest {
        let mut manifest = None;
        for &fhr in fhrs {
            let frame = FrameId::from_hour(fhr).unwrap();
            let tile = staging
                .scratch_tile_path(model, run, var, frame)
                .await
                .unwrap();
            tokio::fs::write(&tile, b"tile").await.unwrap();
            let staged = staging
                .put_frame(model, run, var, &tile, &sidecar(run, fhr))
                .await
                .unwrap();
            manifest = Some(staged);
        }
        match manifest {
            Some(m) => m,
            None => staging
                .rebuild_staging_manifest(model, run, var)
                .await
                .unwrap(),
        }
    }
}

impl Default for TestStore {
    fn default() -> Self {
        Self::new()
    }
}

/// A continuous, byte-plus-alpha sidecar for `fhr` of `run`.
pub fn sidecar(run: &RunId, fhr: u32) -> FrameSidecar {
    let frame = FrameId::from_hour(fhr).unwrap();
    FrameSidecar {
        frame_id: frame.to_string(),
        fhr,
        valid_time: ValidTime::for_run(run, fhr).map(|t| t.to_iso8601()),
        units: Some("K".to_string()),
        output_mode: OutputMode::ByteAlpha,
        palette_kind: PaletteKind::Continuous,
        tile_file: String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sidecar_frame_matches_hour() {
        let s = sidecar(&run("20260207_06z"), 12);
        assert_eq!(s.frame_id, "012");
        assert_eq!(s.frame().map(|f| f.forecast_hour()), Some(12));
    }

    #[tokio::test]
    async fn test_stage_frames() {
        let store = TestStore::new();
        let staging = store.staging();
        let manifest = store
            .stage_frames(&staging, "gfs", &run("20260207_06z"), "tmp2m", &[6, 0, 3])
            .await;
        assert_eq!(manifest.frame_ids(), vec!["000", "003", "006"]);
    }
}
