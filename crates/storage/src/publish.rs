//! Promotion of staged frames into the published tree.
//!
//! Per (model, run, variable) the lifecycle is
//! `Staging -> Gated -> Published`, and a newer run's publish supersedes an
//! older one by moving the model's `LATEST.json` pointer. Every file in the
//! published tree is replaced by rename only, so a failed publish leaves the
//! previous state exactly as it was.
//!
//! A rollback pins the pointer with `LATEST.hold.json`. While the hold is in
//! place publishes still land in the published tree but never move the
//! pointer; [`Publisher::release_hold`] lifts it.

use std::path::Path;
use std::sync::Arc;

use tokio::fs;
use tracing::{debug, info, instrument, warn};

use wx_common::{FrameId, RunId};

use crate::atomic::{link_or_copy_atomic, read_json, write_json_atomic};
use crate::error::{StoreError, StoreResult};
use crate::layout::{sidecar_file_name, MANIFEST_FILE};
use crate::locks::KeyedLocks;
use crate::manifest::{FrameEntry, LatestPointer, PublishedManifest, StagingManifest, CONTRACT_VERSION};
use crate::staging::StagingArea;

/// Publish thresholds and URL shapes.
#[derive(Debug, Clone)]
pub struct PublishPolicy {
    /// Frames required before a variable's run is first published.
    pub gate: usize,
    /// New frames required before an already published variable is extended.
    pub delta: usize,
    pub zoom_max: u8,
    /// Prefix of XYZ tile URLs: `<prefix>/<model>/<run>/<var>/<fid>/{z}/{x}/{y}.png`.
    pub tile_url_prefix: String,
    /// Prefix of whole-frame URLs: `<prefix>/<model>/<run>/<var>/<fid>.tif`.
    pub frame_url_prefix: String,
}

impl Default for PublishPolicy {
    fn default() -> Self {
        Self {
            gate: 6,
            delta: 3,
            zoom_max: 7,
            tile_url_prefix: "/tiles".to_string(),
            frame_url_prefix: "/frames".to_string(),
        }
    }
}

impl PublishPolicy {
    fn frame_entry(&self, model: &str, run: &RunId, var: &str, fid: &str, fhr: u32, valid_time: Option<String>) -> FrameEntry {
        FrameEntry {
            frame_id: fid.to_string(),
            fhr,
            valid_time,
            url: format!(
                "{}/{}/{}/{}/{}/{{z}}/{{x}}/{{y}}.png",
                self.tile_url_prefix, model, run, var, fid
            ),
            frame_image_url: format!("{}/{}/{}/{}/{}.tif", self.frame_url_prefix, model, run, var, fid),
        }
    }

    fn manifest_for(&self, model: &str, run: &RunId, var: &str, staged: &StagingManifest) -> PublishedManifest {
        let frames: Vec<FrameEntry> = staged
            .frames
            .iter()
            .map(|f| self.frame_entry(model, run, var, &f.frame_id, f.fhr, f.valid_time.clone()))
            .collect();
        PublishedManifest {
            contract_version: CONTRACT_VERSION,
            available_frames: frames.len(),
            zoom_max: self.zoom_max,
            frames,
        }
    }
}

/// Where a (model, run, variable) is in its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishState {
    /// Fewer frames staged than the gate.
    Staging { staged: usize },
    /// Enough frames staged; not yet published.
    Gated { staged: usize },
    /// Visible to readers.
    Published { frames: usize, pending: usize },
}

/// Result of a successful publish call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    /// First publish of this run/variable.
    Published { frames: usize, pointer_moved: bool },
    /// An existing publish was extended with newer frames.
    Extended { frames: usize, added: usize, pointer_moved: bool },
    /// Already published and too few new frames to re-publish.
    Unchanged { frames: usize, pending: usize },
}

/// Promotes staged frames and owns the per-model pointer.
pub struct Publisher {
    staging: Arc<StagingArea>,
    policy: PublishPolicy,
    model_locks: KeyedLocks<String>,
}

impl Publisher {
    pub fn new(staging: Arc<StagingArea>, policy: PublishPolicy) -> Self {
        Self {
            staging,
            policy,
            model_locks: KeyedLocks::new(),
        }
    }

    pub fn policy(&self) -> &PublishPolicy {
        &self.policy
    }

    /// The model's current pointer.
    pub async fn read_pointer(&self, model: &str) -> StoreResult<Option<LatestPointer>> {
        read_json(&self.staging.layout().pointer_path(model)?).await
    }

    /// The published manifest of one variable.
    pub async fn read_published(
        &self,
        model: &str,
        run: &RunId,
        var: &str,
    ) -> StoreResult<Option<PublishedManifest>> {
        let dir = self.staging.layout().published_var_dir(model, run, var)?;
        read_json(&dir.join(MANIFEST_FILE)).await
    }

    /// Lifecycle state of a (model, run, variable).
    pub async fn status(&self, model: &str, run: &RunId, var: &str) -> StoreResult<PublishState> {
        let staged = self.staging.rebuild_staging_manifest(model, run, var).await?;
        let published = self.read_published(model, run, var).await?;
        Ok(match published {
            Some(m) => PublishState::Published {
                frames: m.frames.len(),
                pending: new_frame_count(&staged, &m),
            },
            None if staged.frames.len() >= self.policy.gate => PublishState::Gated {
                staged: staged.frames.len(),
            },
            None => PublishState::Staging {
                staged: staged.frames.len(),
            },
        })
    }

    /// Publish with the configured gate.
    pub async fn publish_from_staging(
        &self,
        model: &str,
        run: &RunId,
        var: &str,
    ) -> StoreResult<PublishOutcome> {
        self.publish_with_gate(model, run, var, self.policy.gate, None).await
    }

    /// Publish once every expected frame is staged, even when fewer than the
    /// gate are expected (short forecast ranges). The publish delta does not
    /// apply: a complete variable promotes its last frames however few.
    pub async fn publish_complete(
        &self,
        model: &str,
        run: &RunId,
        var: &str,
        expected_frames: usize,
    ) -> StoreResult<PublishOutcome> {
        let gate = self.policy.gate.min(expected_frames.max(1));
        self.publish_with_gate(model, run, var, gate, Some(expected_frames)).await
    }

    #[instrument(skip_all, fields(model = %model, run = %run, var = %var, gate = gate))]
    async fn publish_with_gate(
        &self,
        model: &str,
        run: &RunId,
        var: &str,
        gate: usize,
        expected_frames: Option<usize>,
    ) -> StoreResult<PublishOutcome> {
        let _guard = self.model_locks.lock(&model.to_string()).await;

        let staged = self.staging.rebuild_staging_manifest(model, run, var).await?;
        if staged.frames.len() < gate {
            return Err(StoreError::GateNotMet {
                model: model.to_string(),
                run: run.to_string(),
                var: var.to_string(),
                staged: staged.frames.len(),
                gate,
            });
        }

        let complete = expected_frames.is_some_and(|n| staged.frames.len() >= n);
        let existing = self.read_published(model, run, var).await?;
        let added = match &existing {
            Some(current) => {
                let added = new_frame_count(&staged, current);
                if added == 0 || (!complete && added < self.policy.delta) {
                    debug!(pending = added, delta = self.policy.delta, "Below publish delta");
                    return Ok(PublishOutcome::Unchanged {
                        frames: current.frames.len(),
                        pending: added,
                    });
                }
                added
            }
            None => staged.frames.len(),
        };

        let manifest = self.policy.manifest_for(model, run, var, &staged);
        manifest.validate()?;

        let src_dir = self.staging.var_dir(model, run, var)?;
        let dst_dir = self.staging.layout().published_var_dir(model, run, var)?;
        fs::create_dir_all(&dst_dir).await.map_err(StoreError::io(&dst_dir))?;
        for frame in &staged.frames {
            let fid = FrameId::parse(&frame.frame_id)?;
            link_or_copy_atomic(&src_dir.join(&frame.tile_file), &dst_dir.join(&frame.tile_file)).await?;
            let sidecar = sidecar_file_name(fid);
            link_or_copy_atomic(&src_dir.join(&sidecar), &dst_dir.join(&sidecar)).await?;
        }
        write_json_atomic(&dst_dir.join(MANIFEST_FILE), &manifest).await?;

        let pointer_moved = self.advance_pointer(model, run).await?;
        metrics::counter!("publishes_total", "model" => model.to_string()).increment(1);

        let frames = manifest.frames.len();
        info!(frames, added, pointer_moved, "Published variable");
        Ok(match existing {
            None => PublishOutcome::Published { frames, pointer_moved },
            Some(_) => PublishOutcome::Extended {
                frames,
                added,
                pointer_moved,
            },
        })
    }

    /// Point `LATEST.json` at `run` unless it already names the same or a
    /// newer run, or a rollback hold pins it. The old payload is kept as the
    /// rollback snapshot.
    async fn advance_pointer(&self, model: &str, run: &RunId) -> StoreResult<bool> {
        let layout = self.staging.layout();
        let pointer_path = layout.pointer_path(model)?;
        let current: Option<LatestPointer> = read_json(&pointer_path).await?;

        let hold: Option<LatestPointer> = read_json(&layout.pointer_hold_path(model)?).await?;
        if let Some(hold) = hold {
            info!(model = %model, run = %run, held = %hold.run, "Pointer held by rollback");
            return Ok(false);
        }

        if let Some(current) = &current {
            if current.run >= *run {
                return Ok(false);
            }
            write_json_atomic(&layout.previous_pointer_path(model)?, current).await?;
        }
        write_json_atomic(&pointer_path, &LatestPointer { run: run.clone() }).await?;
        info!(model = %model, run = %run, "Pointer switched");
        Ok(true)
    }

    /// Restore the previous pointer payload and hold the pointer there. The
    /// replaced payload becomes the new snapshot, so a rollback can itself be
    /// undone.
    #[instrument(skip(self))]
    pub async fn rollback(&self, model: &str) -> StoreResult<RunId> {
        let _guard = self.model_locks.lock(&model.to_string()).await;
        let layout = self.staging.layout();
        let pointer_path = layout.pointer_path(model)?;
        let previous_path = layout.previous_pointer_path(model)?;

        let previous: LatestPointer = read_json(&previous_path)
            .await?
            .ok_or_else(|| StoreError::NoRollbackSnapshot(model.to_string()))?;
        let current: Option<LatestPointer> = read_json(&pointer_path).await?;

        if !run_is_published(layout.published_run_dir(model, &previous.run)?.as_path()).await {
            warn!(model = %model, run = %previous.run, "Rollback target has no published variables");
            return Err(StoreError::Lookup(wx_common::WxError::RunNotFound {
                model: model.to_string(),
                run: previous.run.to_string(),
            }));
        }

        write_json_atomic(&layout.pointer_hold_path(model)?, &previous).await?;
        write_json_atomic(&pointer_path, &previous).await?;
        if let Some(current) = current {
            write_json_atomic(&previous_path, &current).await?;
        }
        metrics::counter!("pointer_rollbacks_total", "model" => model.to_string()).increment(1);
        info!(model = %model, run = %previous.run, "Pointer rolled back and held");
        Ok(previous.run)
    }

    /// The run a rollback pinned the pointer to, if any.
    pub async fn read_hold(&self, model: &str) -> StoreResult<Option<RunId>> {
        let hold: Option<LatestPointer> =
            read_json(&self.staging.layout().pointer_hold_path(model)?).await?;
        Ok(hold.map(|h| h.run))
    }

    /// Let publishes move the pointer again. The pointer itself stays where
    /// the rollback left it until the next publish of a newer run.
    #[instrument(skip(self))]
    pub async fn release_hold(&self, model: &str) -> StoreResult<bool> {
        let _guard = self.model_locks.lock(&model.to_string()).await;
        let path = self.staging.layout().pointer_hold_path(model)?;
        match fs::remove_file(&path).await {
            Ok(()) => {
                info!(model = %model, "Pointer hold released");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StoreError::io(&path)(e)),
        }
    }

    /// Drop lock entries nobody holds.
    pub fn prune_locks(&self) {
        self.model_locks.prune();
    }

    pub fn lock_count(&self) -> usize {
        self.model_locks.len()
    }
}

fn new_frame_count(staged: &StagingManifest, published: &PublishedManifest) -> usize {
    let have = published.frame_ids();
    staged
        .frames
        .iter()
        .filter(|f| !have.contains(&f.frame_id.as_str()))
        .count()
}

async fn run_is_published(run_dir: &Path) -> bool {
    let Ok(mut entries) = fs::read_dir(run_dir).await else {
        return false;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        if entry.path().join(MANIFEST_FILE).exists() {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atomic::PreparedWrite;
    use crate::layout::StoreLayout;
    use crate::manifest::FrameSidecar;
    use wx_common::{OutputMode, PaletteKind};

    struct Fixture {
        _dir: tempfile::TempDir,
        staging: Arc<StagingArea>,
        publisher: Publisher,
    }

    fn fixture(gate: usize, delta: usize) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let staging = Arc::new(StagingArea::new(StoreLayout::new(dir.path())));
        let publisher = Publisher::new(
            staging.clone(),
            PublishPolicy {
                gate,
                delta,
                ..Default::default()
            },
        );
        Fixture {
            _dir: dir,
            staging,
            publisher,
        }
    }

    async fn stage(f: &Fixture, run: &RunId, fhr: u32) {
        let frame = FrameId::from_hour(fhr).unwrap();
        let tile = f.staging.scratch_tile_path("gfs", run, "tmp2m", frame).await.unwrap();
        std::fs::write(&tile, b"tile").unwrap();
        let sidecar = FrameSidecar {
            frame_id: frame.to_string(),
            fhr,
            valid_time: wx_common::ValidTime::for_run(run, fhr).map(|v| v.to_iso8601()),
            units: Some("K".into()),
            output_mode: OutputMode::ByteAlpha,
            palette_kind: PaletteKind::Continuous,
            tile_file: String::new(),
        };
        f.staging.put_frame("gfs", run, "tmp2m", &tile, &sidecar).await.unwrap();
    }

    fn run(s: &str) -> RunId {
        RunId::parse(s).unwrap()
    }

    #[tokio::test]
    async fn test_gate_blocks_publish_without_side_effects() {
        let f = fixture(3, 1);
        let r = run("20260207_06z");
        stage(&f, &r, 0).await;
        stage(&f, &r, 1).await;

        let err = f.publisher.publish_from_staging("gfs", &r, "tmp2m").await.unwrap_err();
        assert!(matches!(err, StoreError::GateNotMet { staged: 2, gate: 3, .. }));
        assert!(f.publisher.read_published("gfs", &r, "tmp2m").await.unwrap().is_none());
        assert!(f.publisher.read_pointer("gfs").await.unwrap().is_none());
        assert!(!f.staging.layout().published_model_dir("gfs").unwrap().exists());
        assert_eq!(
            f.publisher.status("gfs", &r, "tmp2m").await.unwrap(),
            PublishState::Staging { staged: 2 }
        );
    }

    #[tokio::test]
    async fn test_publish_writes_manifest_and_pointer() {
        let f = fixture(2, 1);
        let r = run("20260207_06z");
        stage(&f, &r, 3).await;
        stage(&f, &r, 0).await;
        assert_eq!(
            f.publisher.status("gfs", &r, "tmp2m").await.unwrap(),
            PublishState::Gated { staged: 2 }
        );

        let outcome = f.publisher.publish_from_staging("gfs", &r, "tmp2m").await.unwrap();
        assert_eq!(outcome, PublishOutcome::Published { frames: 2, pointer_moved: true });

        let manifest = f.publisher.read_published("gfs", &r, "tmp2m").await.unwrap().unwrap();
        manifest.validate().unwrap();
        assert_eq!(manifest.frame_ids(), vec!["000", "003"]);
        assert_eq!(manifest.frames[1].valid_time.as_deref(), Some("2026-02-07T09:00:00Z"));
        assert_eq!(
            manifest.frames[0].url,
            "/tiles/gfs/20260207_06z/tmp2m/000/{z}/{x}/{y}.png"
        );
        assert_eq!(manifest.frames[0].frame_image_url, "/frames/gfs/20260207_06z/tmp2m/000.tif");

        let dst = f.staging.layout().published_var_dir("gfs", &r, "tmp2m").unwrap();
        assert!(dst.join("000.tif").exists());
        assert!(dst.join("003.json").exists());
        assert_eq!(f.publisher.read_pointer("gfs").await.unwrap().unwrap().run, r);
    }

    #[tokio::test]
    async fn test_publish_delta() {
        let f = fixture(2, 2);
        let r = run("20260207_06z");
        stage(&f, &r, 0).await;
        stage(&f, &r, 1).await;
        f.publisher.publish_from_staging("gfs", &r, "tmp2m").await.unwrap();

        stage(&f, &r, 2).await;
        let outcome = f.publisher.publish_from_staging("gfs", &r, "tmp2m").await.unwrap();
        assert_eq!(outcome, PublishOutcome::Unchanged { frames: 2, pending: 1 });
        assert_eq!(
            f.publisher.read_published("gfs", &r, "tmp2m").await.unwrap().unwrap().available_frames,
            2
        );

        stage(&f, &r, 3).await;
        let outcome = f.publisher.publish_from_staging("gfs", &r, "tmp2m").await.unwrap();
        assert_eq!(
            outcome,
            PublishOutcome::Extended { frames: 4, added: 2, pointer_moved: false }
        );
    }

    #[tokio::test]
    async fn test_older_run_does_not_move_pointer() {
        let f = fixture(1, 1);
        let newer = run("20260207_06z");
        let older = run("20260207_00z");
        stage(&f, &newer, 0).await;
        f.publisher.publish_from_staging("gfs", &newer, "tmp2m").await.unwrap();
        stage(&f, &older, 0).await;
        let outcome = f.publisher.publish_from_staging("gfs", &older, "tmp2m").await.unwrap();
        assert_eq!(outcome, PublishOutcome::Published { frames: 1, pointer_moved: false });
        assert_eq!(f.publisher.read_pointer("gfs").await.unwrap().unwrap().run, newer);
    }

    #[tokio::test]
    async fn test_rollback_restores_previous_pointer() {
        let f = fixture(1, 1);
        let a = run("20260207_00z");
        let b = run("20260207_06z");

        assert!(matches!(
            f.publisher.rollback("gfs").await,
            Err(StoreError::NoRollbackSnapshot(_))
        ));

        stage(&f, &a, 0).await;
        f.publisher.publish_from_staging("gfs", &a, "tmp2m").await.unwrap();
        stage(&f, &b, 0).await;
        f.publisher.publish_from_staging("gfs", &b, "tmp2m").await.unwrap();

        assert_eq!(f.publisher.rollback("gfs").await.unwrap(), a);
        assert_eq!(f.publisher.read_pointer("gfs").await.unwrap().unwrap().run, a);
        // and back again
        assert_eq!(f.publisher.rollback("gfs").await.unwrap(), b);
    }

    #[tokio::test]
    async fn test_crash_before_pointer_rename_keeps_old_pointer() {
        let f = fixture(1, 1);
        let a = run("20260207_00z");
        stage(&f, &a, 0).await;
        f.publisher.publish_from_staging("gfs", &a, "tmp2m").await.unwrap();

        let pointer_path = f.staging.layout().pointer_path("gfs").unwrap();
        let next = serde_json::to_vec(&LatestPointer { run: run("20260207_06z") }).unwrap();
        let pending = PreparedWrite::prepare(&pointer_path, &next).await.unwrap();
        // Simulated crash: the temp file exists but the rename never happens.
        std::mem::forget(pending);

        let pointer = f.publisher.read_pointer("gfs").await.unwrap().unwrap();
        assert_eq!(pointer.run, a);
    }

    #[tokio::test]
    async fn test_rollback_holds_pointer_until_released() {
        let f = fixture(1, 1);
        let a = run("20260207_00z");
        let b = run("20260207_06z");
        let c = run("20260207_12z");

        stage(&f, &a, 0).await;
        f.publisher.publish_from_staging("gfs", &a, "tmp2m").await.unwrap();
        stage(&f, &b, 0).await;
        f.publisher.publish_from_staging("gfs", &b, "tmp2m").await.unwrap();
        assert_eq!(f.publisher.rollback("gfs").await.unwrap(), a);
        assert_eq!(f.publisher.read_hold("gfs").await.unwrap(), Some(a.clone()));

        // More frames for the rolled-back run, then a brand new run.
        stage(&f, &b, 3).await;
        let outcome = f.publisher.publish_from_staging("gfs", &b, "tmp2m").await.unwrap();
        assert_eq!(
            outcome,
            PublishOutcome::Extended { frames: 2, added: 1, pointer_moved: false }
        );
        stage(&f, &c, 0).await;
        let outcome = f.publisher.publish_from_staging("gfs", &c, "tmp2m").await.unwrap();
        assert_eq!(outcome, PublishOutcome::Published { frames: 1, pointer_moved: false });
        assert_eq!(f.publisher.read_pointer("gfs").await.unwrap().unwrap().run, a);

        assert!(f.publisher.release_hold("gfs").await.unwrap());
        assert!(!f.publisher.release_hold("gfs").await.unwrap());
        assert_eq!(f.publisher.read_hold("gfs").await.unwrap(), None);

        stage(&f, &c, 3).await;
        let outcome = f.publisher.publish_from_staging("gfs", &c, "tmp2m").await.unwrap();
        assert_eq!(
            outcome,
            PublishOutcome::Extended { frames: 2, added: 1, pointer_moved: true }
        );
        assert_eq!(f.publisher.read_pointer("gfs").await.unwrap().unwrap().run, c);
    }

    #[tokio::test]
    async fn test_prune_locks_drops_idle_models() {
        let f = fixture(1, 1);
        for r in ["20260207_00z", "20260207_06z"] {
            let r = run(r);
            stage(&f, &r, 0).await;
            f.publisher.publish_from_staging("gfs", &r, "tmp2m").await.unwrap();
        }
        assert_eq!(f.publisher.lock_count(), 1);
        f.publisher.prune_locks();
        assert_eq!(f.publisher.lock_count(), 0);
    }

    #[tokio::test]
    async fn test_publish_complete_lowers_gate() {
        let f = fixture(6, 3);
        let r = run("20260207_06z");
        stage(&f, &r, 0).await;
        stage(&f, &r, 1).await;
        assert!(f.publisher.publish_from_staging("gfs", &r, "tmp2m").await.is_err());
        let outcome = f.publisher.publish_complete("gfs", &r, "tmp2m", 2).await.unwrap();
        assert!(matches!(outcome, PublishOutcome::Published { frames: 2, .. }));
    }
}
