//! Staging, gated publish and discovery working together on one data dir.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use storage::{
    enforce_retention, CacheConfig, DiscoveryCache, FrameSidecar, PublishOutcome, PublishPolicy,
    Publisher, StagingArea, StoreError, StoreLayout,
};
use wx_common::{FrameId, OutputMode, PaletteKind, RunId, RunSelector, SystemClock, ValidTime};

struct Store {
    _dir: tempfile::TempDir,
    layout: StoreLayout,
    staging: Arc<StagingArea>,
    publisher: Publisher,
    discovery: DiscoveryCache,
}

fn store() -> Store {
    let dir = tempfile::tempdir().unwrap();
    let layout = StoreLayout::new(dir.path());
    let staging = Arc::new(StagingArea::new(layout.clone()));
    let publisher = Publisher::new(staging.clone(), PublishPolicy::default());
    // Zero TTL so every read sees the filesystem.
    let discovery = DiscoveryCache::new(layout.clone(), Duration::ZERO, Arc::new(SystemClock));
    Store {
        _dir: dir,
        layout,
        staging,
        publisher,
        discovery,
    }
}

async fn stage(store: &Store, model: &str, run: &RunId, var: &str, fhr: u32) -> usize {
    let frame = FrameId::from_hour(fhr).unwrap();
    let tile = store
        .staging
        .scratch_tile_path(model, run, var, frame)
        .await
        .unwrap();
    std::fs::write(&tile, format!("{}-{}", var, fhr)).unwrap();
    let sidecar = FrameSidecar {
        frame_id: frame.to_string(),
        fhr,
        valid_time: ValidTime::for_run(run, fhr).map(|v| v.to_iso8601()),
        units: Some("K".to_string()),
        output_mode: OutputMode::ByteAlpha,
        palette_kind: PaletteKind::Continuous,
        tile_file: String::new(),
    };
    store
        .staging
        .put_frame(model, run, var, &tile, &sidecar)
        .await
        .unwrap()
        .frames
        .len()
}

#[tokio::test]
async fn test_six_frames_cross_the_gate() {
    let store = store();
    let run = RunId::parse("20260207_01z").unwrap();

    for fhr in 0..6u32 {
        let staged = stage(&store, "x", &run, "t", fhr).await;
        assert_eq!(staged, fhr as usize + 1);

        let result = store.publisher.publish_from_staging("x", &run, "t").await;
        if fhr < 5 {
            assert!(
                matches!(result, Err(StoreError::GateNotMet { .. })),
                "published early at fhr {}",
                fhr
            );
            assert!(store.discovery.list_models().await.unwrap().is_empty());
        } else {
            result.unwrap();
        }
    }

    let pointer = store.publisher.read_pointer("x").await.unwrap().unwrap();
    assert_eq!(pointer.run.as_str(), "20260207_01z");

    let frames = store
        .discovery
        .list_frames("x", &RunSelector::Latest, "t")
        .await
        .unwrap();
    assert_eq!(frames.len(), 6);
    let fhrs: Vec<u32> = frames.iter().map(|f| f.fhr).collect();
    assert_eq!(fhrs, vec![0, 1, 2, 3, 4, 5]);
    assert_eq!(frames[5].valid_time.as_deref(), Some("2026-02-07T06:00:00Z"));
}

#[tokio::test]
async fn test_staged_frames_of_new_run_stay_invisible() {
    let store = store();
    let old = RunId::parse("20260207_00z").unwrap();
    let new = RunId::parse("20260207_06z").unwrap();

    for fhr in 0..6 {
        stage(&store, "gfs", &old, "tmp2m", fhr).await;
    }
    store.publisher.publish_from_staging("gfs", &old, "tmp2m").await.unwrap();

    for fhr in 0..3 {
        stage(&store, "gfs", &new, "tmp2m", fhr).await;
    }
    assert!(store.publisher.publish_from_staging("gfs", &new, "tmp2m").await.is_err());

    let runs = store.discovery.list_runs("gfs").await.unwrap();
    assert_eq!(runs, vec![old.clone()]);
    let manifest = store.discovery.load_manifest("gfs", &RunSelector::Latest).await.unwrap();
    assert_eq!(manifest.run, old);
    assert_eq!(manifest.variables["tmp2m"].available_frames, 6);
}

#[tokio::test]
async fn test_complete_variable_publishes_tail_below_delta() {
    let store = store();
    let run = RunId::parse("20260207_06z").unwrap();

    for fhr in 0..6 {
        stage(&store, "gfs", &run, "tmp2m", fhr).await;
    }
    let outcome = store.publisher.publish_from_staging("gfs", &run, "tmp2m").await.unwrap();
    assert_eq!(outcome, PublishOutcome::Published { frames: 6, pointer_moved: true });

    // Two late frames are below the delta of 3 for an open-ended publish...
    stage(&store, "gfs", &run, "tmp2m", 6).await;
    stage(&store, "gfs", &run, "tmp2m", 7).await;
    let outcome = store.publisher.publish_from_staging("gfs", &run, "tmp2m").await.unwrap();
    assert_eq!(outcome, PublishOutcome::Unchanged { frames: 6, pending: 2 });

    // ...but they are the last ones expected, so they go out.
    let outcome = store.publisher.publish_complete("gfs", &run, "tmp2m", 8).await.unwrap();
    assert_eq!(
        outcome,
        PublishOutcome::Extended { frames: 8, added: 2, pointer_moved: false }
    );
    let manifest = store.publisher.read_published("gfs", &run, "tmp2m").await.unwrap().unwrap();
    assert_eq!(manifest.available_frames, 8);

    let outcome = store.publisher.publish_complete("gfs", &run, "tmp2m", 8).await.unwrap();
    assert_eq!(outcome, PublishOutcome::Unchanged { frames: 8, pending: 0 });
}

#[tokio::test]
async fn test_incomplete_variable_still_honours_delta() {
    let store = store();
    let run = RunId::parse("20260207_06z").unwrap();

    for fhr in 0..7 {
        stage(&store, "gfs", &run, "tmp2m", fhr).await;
    }
    store.publisher.publish_from_staging("gfs", &run, "tmp2m").await.unwrap();
    stage(&store, "gfs", &run, "tmp2m", 7).await;

    let outcome = store.publisher.publish_complete("gfs", &run, "tmp2m", 10).await.unwrap();
    assert_eq!(outcome, PublishOutcome::Unchanged { frames: 7, pending: 1 });
}

#[tokio::test]
async fn test_retention_spares_pointer_target() {
    let store = store();
    let runs: Vec<RunId> = ["20260206_18z", "20260207_00z", "20260207_06z"]
        .iter()
        .map(|r| RunId::parse(r).unwrap())
        .collect();
    for run in &runs {
        for fhr in 0..6 {
            stage(&store, "gfs", run, "tmp2m", fhr).await;
        }
        store.publisher.publish_from_staging("gfs", run, "tmp2m").await.unwrap();
    }
    // Operator rolled back to the previous run.
    assert_eq!(store.publisher.rollback("gfs").await.unwrap(), runs[1]);

    let published = CacheConfig::new(store.layout.published_model_dir("gfs").unwrap(), 1);
    let pointer = store.publisher.read_pointer("gfs").await.unwrap().unwrap();
    let protected: HashSet<String> = [pointer.run.to_string()].into_iter().collect();
    let summary = enforce_retention(&published, &protected).unwrap();

    assert_eq!(summary.deleted_cycles, vec!["20260206_18z"]);
    assert_eq!(summary.kept_cycles, vec!["20260207_06z", "20260207_00z"]);
    assert_eq!(
        store.discovery.list_frames("gfs", &RunSelector::Latest, "tmp2m").await.unwrap().len(),
        6
    );
}
