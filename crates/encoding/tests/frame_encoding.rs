//! Whole-frame encoding through the local raster engine.

use std::sync::Arc;

use encoding::encode::byte_to_value;
use encoding::{
    target_size, EncodingError, EncodingPolicy, FrameEncoder, FrameTarget, LocalRasterEngine,
    OverviewStrategy, RasterEngine, Resampling, NODATA, OVERVIEW_LEVELS,
};
use ingestion::{VariableRegistry, VariableSpec};
use test_utils::{
    assert_approx_eq, constant_field, reflectivity_field, temperature_field, with_missing,
    TEST_BOUNDS,
};
use wx_common::{BoundingBox, OutputMode, PaletteKind, Region};

fn spec(id: &str) -> VariableSpec {
    VariableRegistry::builtin().unwrap().get(id).unwrap().clone()
}

fn whole_grid() -> Region {
    Region::new("grid", TEST_BOUNDS).unwrap()
}

fn encoder(engine: LocalRasterEngine) -> FrameEncoder {
    FrameEncoder::new(Arc::new(engine), EncodingPolicy::default())
}

#[test]
fn test_continuous_frame_uses_smooth_resampling() {
    let dir = tempfile::tempdir().unwrap();
    let field = temperature_field(64, 32);
    let region = whole_grid();
    let target = FrameTarget {
        size: target_size(&field, &region.bounds),
        region,
        path: dir.path().join("006.tif"),
    };
    let encoder = encoder(LocalRasterEngine::new());

    let frame = encoder.encode_frame(&field, &spec("tmp2m"), &target).unwrap();

    assert_eq!(frame.palette_kind, PaletteKind::Continuous);
    assert_eq!(frame.output_mode, OutputMode::ByteAlpha);
    assert_eq!(frame.resampling, Resampling::Bilinear);
    assert_eq!(frame.units.as_deref(), Some("K"));
    assert_eq!(frame.overviews, OverviewStrategy::FullPass);

    let meta = encoder.engine().metadata(&target.path).unwrap();
    assert_eq!((meta.width, meta.height), (64, 32));
    assert_eq!(meta.resampling, Some(Resampling::Bilinear));
    assert_eq!(meta.overview_resampling, Some(Resampling::Bilinear));
    assert!(meta.mask_overviews);
    assert!(meta
        .bands
        .iter()
        .all(|b| b.overview_sets == 1 && b.overview_levels == OVERVIEW_LEVELS.to_vec()));

    // Same grid, so pixel centres line up with the source cells.
    let raster = encoder.engine().read(&target.path).unwrap();
    let i = 10 * 64 + 20;
    let value = byte_to_value(raster.bands[0][i], 220.0, 330.0).unwrap();
    assert_approx_eq!(value, field.get(20, 10), 0.5);

    let leftovers: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(leftovers, vec!["006.tif".to_string()]);
}

#[test]
fn test_categorical_frame_keeps_exact_indices() {
    let dir = tempfile::tempdir().unwrap();
    let field = constant_field("radar_ptype", 40, 20, 65.0);
    let region = Region::new("east", BoundingBox::new(-100.0, 30.0, -70.0, 50.0)).unwrap();
    let target = FrameTarget {
        size: (90, 60),
        region,
        path: dir.path().join("003.tif"),
    };
    let encoder = encoder(LocalRasterEngine::new());

    let frame = encoder
        .encode_frame(&field, &spec("radar_ptype"), &target)
        .unwrap();

    assert_eq!(frame.palette_kind, PaletteKind::Discrete);
    assert_eq!(frame.resampling, Resampling::Nearest);
    let meta = encoder.engine().metadata(&target.path).unwrap();
    assert_eq!(meta.overview_resampling, Some(Resampling::Nearest));

    let raster = encoder.engine().read(&target.path).unwrap();
    assert!(raster.bands[0].iter().all(|&b| b == 65));
    assert!(raster.bands[1].iter().all(|&a| a == 255));
}

#[test]
fn test_missing_values_become_transparent() {
    let dir = tempfile::tempdir().unwrap();
    let field = with_missing(temperature_field(8, 4), 1);
    let region = whole_grid();
    let target = FrameTarget {
        size: (8, 4),
        region,
        path: dir.path().join("000.tif"),
    };
    let encoder = encoder(LocalRasterEngine::new());
    encoder.encode_frame(&field, &spec("tmp2m"), &target).unwrap();

    let raster = encoder.engine().read(&target.path).unwrap();
    assert!(raster.bands[0].iter().all(|&b| b == NODATA));
    assert!(raster.bands[1].iter().all(|&a| a == 0));
}

#[test]
fn test_weak_reflectivity_is_masked() {
    let dir = tempfile::tempdir().unwrap();
    let field = reflectivity_field(80, 4);
    let target = FrameTarget {
        size: (80, 4),
        region: whole_grid(),
        path: dir.path().join("001.tif"),
    };
    let encoder = encoder(LocalRasterEngine::new());
    encoder.encode_frame(&field, &spec("refc"), &target).unwrap();

    let raster = encoder.engine().read(&target.path).unwrap();
    let alpha = &raster.bands[1];
    assert_eq!(alpha[80], 0);
    assert_eq!(alpha[80 + 60], 255);
}

#[test]
fn test_engine_without_mask_support_builds_band_subsets() {
    let dir = tempfile::tempdir().unwrap();
    let field = temperature_field(64, 32);
    let target = FrameTarget {
        size: (64, 32),
        region: whole_grid(),
        path: dir.path().join("009.tif"),
    };
    let encoder = encoder(LocalRasterEngine::without_mask_overviews());

    let frame = encoder.encode_frame(&field, &spec("tmp2m"), &target).unwrap();
    assert_eq!(frame.overviews, OverviewStrategy::BandSubsets);

    let meta = encoder.engine().metadata(&target.path).unwrap();
    assert!(!meta.mask_overviews);
    assert!(meta.bands.iter().all(|b| b.overview_sets == 1));
}

#[test]
fn test_region_outside_source_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let field = temperature_field(16, 8);
    let europe = Region::new("europe", BoundingBox::new(-15.0, 35.0, 45.0, 72.0)).unwrap();
    let target = FrameTarget {
        size: (32, 32),
        region: europe,
        path: dir.path().join("000.tif"),
    };

    let err = encoder(LocalRasterEngine::new())
        .encode_frame(&field, &spec("tmp2m"), &target)
        .unwrap_err();
    assert!(matches!(err, EncodingError::OutsideSource { .. }));
    assert_eq!(err.http_status_code(), 400);
    assert!(!target.path.exists());
}
