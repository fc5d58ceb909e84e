//! Scheduler passes against scripted upstream data.

use std::sync::Arc;
use std::time::Duration;

use encoding::{EncodingPolicy, FrameEncoder, LocalRasterEngine};
use ingester::{IngesterConfig, ModelPlan, Scheduler};
use ingestion::{AcquisitionEngine, FetchPolicy, Model, Provider, VariableRegistry};
use pipeline::{Pipeline, PipelineConfig};
use storage::{PublishOutcome, PublishPolicy};
use test_utils::{temperature_field, wind_components, ScriptedDecoder, ScriptedProvider, TestStore};
use wx_common::Region;

fn scheduler(store: &TestStore, plans: Vec<ModelPlan>) -> Scheduler {
    let acquisition = AcquisitionEngine::new(
        Arc::new(VariableRegistry::builtin().unwrap()),
        store.layout.clone(),
        FetchPolicy {
            provider_timeout: Duration::from_secs(5),
            rounds: 1,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        },
        test_utils::manual_clock(),
    )
    .with_providers(
        Model::Gfs,
        vec![Arc::new(ScriptedProvider::serving("aws")) as Arc<dyn Provider>],
    );
    let (u, v) = wind_components(32, 16, 5.0, 0.0);
    let decoder = ScriptedDecoder::new()
        .with_field("tmp2m", temperature_field(64, 32))
        .with_field("ugrd10m", u)
        .with_field("vgrd10m", v);
    let pipeline = Pipeline::new(
        Arc::new(acquisition),
        Arc::new(decoder),
        Arc::new(FrameEncoder::new(
            Arc::new(LocalRasterEngine::new()),
            EncodingPolicy::default(),
        )),
        store.layout.clone(),
        PublishPolicy::default(),
        PipelineConfig {
            max_concurrent: 3,
            keep_runs: 2,
        },
    );
    Scheduler::new(Arc::new(pipeline), plans, Duration::from_secs(1), Duration::ZERO)
}

fn gfs_plan(variables: &[&str]) -> ModelPlan {
    ModelPlan {
        model: Model::Gfs,
        region: Region::conus(),
        variables: variables.iter().map(|v| v.to_string()).collect(),
        forecast_hours: Some(vec![0, 3, 6, 9, 12, 15]),
    }
}

#[tokio::test]
async fn test_single_pass_publishes_every_variable() {
    let store = TestStore::new();
    let scheduler = scheduler(&store, vec![gfs_plan(&["temperature", "wind_speed"])]);

    let reports = scheduler.run_once().await;
    assert_eq!(reports.len(), 1);
    let report = &reports[0];
    assert_eq!(report.run.as_str(), "20260207_06z");
    assert!(report.failed.is_empty());
    assert_eq!(report.builds.len(), 2);
    for build in &report.builds {
        assert_eq!(build.staged.len(), 6);
        assert!(matches!(
            build.publish,
            Some(PublishOutcome::Published { frames: 6, .. })
        ));
    }

    let mut serving = report.serving.clone();
    serving.sort();
    assert_eq!(serving, vec!["tmp2m".to_string(), "wspd10m".to_string()]);
    assert!(report.retention.is_some());
}

#[tokio::test]
async fn test_second_pass_skips_staged_frames() {
    let store = TestStore::new();
    let scheduler = scheduler(&store, vec![gfs_plan(&["tmp2m"])]);

    scheduler.run_once().await;
    let reports = scheduler.run_once().await;
    let build = &reports[0].builds[0];
    assert_eq!(build.skipped, 6);
    assert!(build.staged.is_empty());
    assert!(matches!(
        build.publish,
        Some(PublishOutcome::Unchanged { .. })
    ));
}

#[tokio::test]
async fn test_hours_outside_the_model_schedule_are_dropped() {
    let store = TestStore::new();
    let mut plan = gfs_plan(&["tmp2m"]);
    plan.forecast_hours = Some(vec![0, 1, 2, 3]);
    let scheduler = scheduler(&store, vec![plan]);

    let reports = scheduler.run_once().await;
    let build = &reports[0].builds[0];
    assert_eq!(build.expected, 2);
    assert_eq!(build.staged, vec![0, 3]);
}

#[tokio::test]
async fn test_unknown_variable_fails_the_model_pass() {
    let store = TestStore::new();
    let scheduler = scheduler(&store, vec![gfs_plan(&["not_a_variable"])]);

    assert!(scheduler.run_model(&scheduler.plans()[0]).await.is_err());
    assert!(scheduler.run_once().await.is_empty());
}

#[test]
fn test_from_config_builds_plans() {
    let dir = tempfile::tempdir().unwrap();
    let yaml = format!(
        r#"
data_dir: {}
models:
  - id: gfs
    variables: [tmp2m]
    forecast_hours: {{ end: 12, step: 6 }}
    providers:
      - name: aws
        url_template: "https://example.invalid/gfs.{{date}}/{{hour}}/gfs.t{{hour}}z.f{{fhr}}"
  - id: hrrr
    providers:
      - name: aws
        url_template: "https://example.invalid/hrrr.{{date}}/hrrr.t{{hour}}z.f{{fhr2}}"
  - id: nam
    enabled: false
"#,
        dir.path().display()
    );
    let path = dir.path().join("ingester.yaml");
    std::fs::write(&path, yaml).unwrap();
    let config = IngesterConfig::load(&path).unwrap();

    let scheduler = Scheduler::from_config(&config, None).unwrap();
    let models: Vec<Model> = scheduler.plans().iter().map(|p| p.model).collect();
    assert_eq!(models, vec![Model::Gfs, Model::Hrrr]);
    assert_eq!(scheduler.plans()[0].forecast_hours, Some(vec![0, 6, 12]));
    assert!(scheduler.plans()[1].variables.is_empty());
    assert_eq!(scheduler.pipeline().layout().root(), dir.path());

    let only_hrrr = Scheduler::from_config(&config, Some("hrrr")).unwrap();
    assert_eq!(only_hrrr.plans().len(), 1);
    assert!(Scheduler::from_config(&config, Some("nam")).is_err());
}
