//! Multi-provider fetch engine.
//!
//! For one `(model, run, forecast hour, variable, region)` request the engine
//! resolves the variable, asks each configured provider in priority order for
//! every upstream field the variable needs, and writes the payloads into the
//! raw cache. "Upstream not published yet" never surfaces as an error: once
//! all providers and retry rounds are exhausted the engine returns a
//! [`FetchResult`] carrying the reason. Any fatal failure stops immediately.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use storage::{write_atomic, StoreLayout};
use wx_common::{Clock, Region, RunId, RunSelector};

use crate::classify::{NotReadyClassifier, Readiness};
use crate::error::{IngestionError, Result};
use crate::models::Model;
use crate::providers::{Provider, ProviderRequest, SearchTerm};
use crate::registry::{Plan, ResolvedVariable, VariableRegistry};

/// Timeouts and retry rounds.
#[derive(Debug, Clone)]
pub struct FetchPolicy {
    /// After this long a provider attempt counts as not-ready.
    pub provider_timeout: Duration,
    /// Passes over the provider list before giving up.
    pub rounds: u32,
    /// Sleep before the second round; doubles each round.
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for FetchPolicy {
    fn default() -> Self {
        Self {
            provider_timeout: Duration::from_secs(60),
            rounds: 2,
            initial_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(30),
        }
    }
}

/// What to fetch.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub model: Model,
    pub run: RunSelector,
    pub forecast_hour: u32,
    pub variable: String,
    pub region: Region,
}

/// Terminal result of one fetch.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchResult {
    /// The concrete run fetched (`latest` resolved).
    pub run: RunId,
    /// Canonical variable id.
    pub variable: String,
    /// Primary payload: the field itself, or a composite's first component.
    pub path: Option<PathBuf>,
    /// Set when upstream is not ready; `path` is then `None`.
    pub not_ready_reason: Option<String>,
    /// Component payloads of a composite, by role.
    pub component_paths: Option<BTreeMap<String, PathBuf>>,
    /// Whether the provider returned whole files rather than byte ranges.
    pub is_full_file: bool,
    /// Served from the raw cache without network access.
    pub from_cache: bool,
}

impl FetchResult {
    fn not_ready(run: RunId, variable: String, reason: String) -> Self {
        Self {
            run,
            variable,
            path: None,
            not_ready_reason: Some(reason),
            component_paths: None,
            is_full_file: false,
            from_cache: false,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.not_ready_reason.is_none() && self.path.is_some()
    }
}

/// The acquisition engine. Cheap to share behind an `Arc`.
pub struct AcquisitionEngine {
    registry: Arc<VariableRegistry>,
    layout: StoreLayout,
    providers: HashMap<Model, Vec<Arc<dyn Provider>>>,
    classifier: NotReadyClassifier,
    policy: FetchPolicy,
    clock: Arc<dyn Clock>,
}

impl AcquisitionEngine {
    pub fn new(
        registry: Arc<VariableRegistry>,
        layout: StoreLayout,
        policy: FetchPolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            registry,
            layout,
            providers: HashMap::new(),
            classifier: NotReadyClassifier::default(),
            policy,
            clock,
        }
    }

    /// Providers for a model, highest priority first.
    pub fn with_providers(mut self, model: Model, providers: Vec<Arc<dyn Provider>>) -> Self {
        self.providers.insert(model, providers);
        self
    }

    pub fn with_classifier(mut self, classifier: NotReadyClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn registry(&self) -> &VariableRegistry {
        &self.registry
    }

    /// Resolve `latest` to the newest cycle upstream should have started.
    pub fn resolve_run(&self, model: Model, run: &RunSelector) -> RunId {
        match run {
            RunSelector::Run(run) => run.clone(),
            RunSelector::Latest => model.latest_cycle(self.clock.utc_now()),
        }
    }

    /// Check the request against the model before touching the network.
    pub fn validate(&self, request: &FetchRequest) -> Result<ResolvedVariable> {
        let model = request.model;
        let resolved = self.registry.resolve(model, &request.variable)?;
        if !model.has_forecast_hour(&resolved.spec, request.forecast_hour) {
            return Err(IngestionError::UnsupportedForecastHour {
                model: model.to_string(),
                variable: resolved.spec.id.clone(),
                forecast_hour: request.forecast_hour,
            });
        }
        if !model.covers(&request.region) {
            return Err(IngestionError::RegionOutsideDomain {
                model: model.to_string(),
                region: request.region.id.clone(),
            });
        }
        Ok(resolved)
    }

    #[instrument(skip_all, fields(model = %request.model, run = %request.run, fhr = request.forecast_hour, var = %request.variable))]
    pub async fn fetch(&self, request: &FetchRequest) -> Result<FetchResult> {
        let model = request.model;
        let resolved = self.validate(request)?;
        let run = self.resolve_run(model, &request.run);
        let variable = resolved.spec.id.clone();

        let selections = resolved.plan.selections();
        let mut paths = BTreeMap::new();
        for selection in &selections {
            let path = self
                .layout
                .raw_field_path(model.id(), &run, request.forecast_hour, &selection.var_id)?;
            paths.insert(selection.var_id.clone(), path);
        }

        if paths.values().all(|p| non_empty(p)) {
            debug!("All fields present in raw cache");
            return Ok(self.result(run, variable, &resolved.plan, paths, false, true));
        }

        let providers = self.providers.get(&model).filter(|p| !p.is_empty()).ok_or_else(|| {
            IngestionError::InvalidConfig(format!("no providers configured for {}", model))
        })?;
        let provider_request = ProviderRequest {
            model,
            run: run.clone(),
            forecast_hour: request.forecast_hour,
            terms: selections
                .iter()
                .map(|s| SearchTerm {
                    var_id: s.var_id.clone(),
                    patterns: s.search.clone(),
                })
                .collect(),
        };

        let mut reasons: Vec<String> = Vec::new();
        let mut backoff = self.policy.initial_backoff;
        for round in 0..self.policy.rounds.max(1) {
            if round > 0 {
                debug!(round, backoff_secs = backoff.as_secs_f64(), "All providers not ready, backing off");
                tokio::time::sleep(backoff).await;
                backoff = std::cmp::min(backoff * 2, self.policy.max_backoff);
            }

            for provider in providers {
                let name = provider.name().to_string();
                let attempt =
                    tokio::time::timeout(self.policy.provider_timeout, provider.fetch(&provider_request)).await;

                let payload = match attempt {
                    Err(_) => {
                        let reason = format!(
                            "{}: timed out after {}s",
                            name,
                            self.policy.provider_timeout.as_secs_f64()
                        );
                        self.record_not_ready(model, &reason);
                        reasons.push(reason);
                        continue;
                    }
                    Ok(Err(err)) => match self.classifier.classify_error(&err) {
                        Readiness::NotReady(why) => {
                            let reason = format!("{}: {}", name, why);
                            self.record_not_ready(model, &reason);
                            reasons.push(reason);
                            continue;
                        }
                        Readiness::Fatal => {
                            warn!(provider = %name, error = %err, "Fatal upstream error");
                            return Err(IngestionError::FatalFetch {
                                provider: name,
                                source: err,
                            });
                        }
                    },
                    Ok(Ok(payload)) => payload,
                };

                if let Some(missing) = paths.keys().find(|v| !payload.fields.contains_key(*v)) {
                    let reason = format!("{}: inventory not found for '{}'", name, missing);
                    self.record_not_ready(model, &reason);
                    reasons.push(reason);
                    continue;
                }

                for (var_id, path) in &paths {
                    write_atomic(path, &payload.fields[var_id]).await?;
                }
                info!(provider = %name, fields = paths.len(), "Fetched upstream fields");
                return Ok(self.result(run, variable, &resolved.plan, paths, payload.is_full_file, false));
            }
        }

        Ok(FetchResult::not_ready(run, variable, reasons.join("; ")))
    }

    fn record_not_ready(&self, model: Model, reason: &str) {
        warn!(reason = %reason, "Upstream not ready");
        metrics::counter!("fetch_not_ready_total", "model" => model.id()).increment(1);
    }

    fn result(
        &self,
        run: RunId,
        variable: String,
        plan: &Plan,
        paths: BTreeMap<String, PathBuf>,
        is_full_file: bool,
        from_cache: bool,
    ) -> FetchResult {
        let (path, component_paths) = match plan {
            Plan::Primary(selection) => (paths.get(&selection.var_id).cloned(), None),
            Plan::Derived { kind, components } => {
                let by_role: BTreeMap<String, PathBuf> = components
                    .iter()
                    .filter_map(|(role, sel)| paths.get(&sel.var_id).map(|p| (role.clone(), p.clone())))
                    .collect();
                let primary_role = kind.required_roles()[0];
                (by_role.get(primary_role).cloned(), Some(by_role))
            }
        };
        FetchResult {
            run,
            variable,
            path,
            not_ready_reason: None,
            component_paths,
            is_full_file,
            from_cache,
        }
    }
}

fn non_empty(path: &std::path::Path) -> bool {
    std::fs::metadata(path).map(|m| m.len() > 0).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{ProviderPayload, UpstreamError};
    use async_trait::async_trait;
    use bytes::Bytes;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use wx_common::ManualClock;

    /// Fails with 404 a fixed number of times, then serves every term.
    struct Flaky {
        failures: AtomicUsize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Provider for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn fetch(&self, request: &ProviderRequest) -> std::result::Result<ProviderPayload, UpstreamError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(UpstreamError::HttpStatus {
                    status: 404,
                    url: "u".into(),
                });
            }
            Ok(ProviderPayload {
                fields: request
                    .terms
                    .iter()
                    .map(|t| (t.var_id.clone(), Bytes::from(t.var_id.clone())))
                    .collect(),
                is_full_file: false,
            })
        }
    }

    fn engine(dir: &std::path::Path, provider: Arc<Flaky>, rounds: u32) -> AcquisitionEngine {
        let clock = Arc::new(ManualClock::new(chrono::Utc.with_ymd_and_hms(2026, 2, 7, 12, 0, 0).unwrap()));
        AcquisitionEngine::new(
            Arc::new(VariableRegistry::builtin().unwrap()),
            StoreLayout::new(dir),
            FetchPolicy {
                provider_timeout: Duration::from_secs(5),
                rounds,
                initial_backoff: Duration::ZERO,
                max_backoff: Duration::ZERO,
            },
            clock,
        )
        .with_providers(Model::Gfs, vec![provider])
    }

    fn request(var: &str, fhr: u32) -> FetchRequest {
        FetchRequest {
            model: Model::Gfs,
            run: RunSelector::Latest,
            forecast_hour: fhr,
            variable: var.to_string(),
            region: Region::conus(),
        }
    }

    fn flaky(failures: usize) -> Arc<Flaky> {
        Arc::new(Flaky {
            failures: AtomicUsize::new(failures),
            calls: AtomicUsize::new(0),
        })
    }

    #[tokio::test]
    async fn test_latest_resolves_from_clock() {
        let dir = tempfile::tempdir().unwrap();
        let result = engine(dir.path(), flaky(0), 1)
            .fetch(&request("tmp2m", 6))
            .await
            .unwrap();
        // 12:00 minus 4h lag -> 06z
        assert_eq!(result.run.as_str(), "20260207_06z");
        assert!(result.is_ready());
    }

    #[tokio::test]
    async fn test_second_round_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let provider = flaky(1);
        let result = engine(dir.path(), provider.clone(), 2)
            .fetch(&request("tmp2m", 6))
            .await
            .unwrap();
        assert!(result.is_ready());
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_rounds_exhausted_is_not_ready() {
        let dir = tempfile::tempdir().unwrap();
        let provider = flaky(5);
        let result = engine(dir.path(), provider.clone(), 3)
            .fetch(&request("tmp2m", 6))
            .await
            .unwrap();
        assert!(!result.is_ready());
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
        assert!(result.not_ready_reason.unwrap().contains("flaky"));
    }

    #[tokio::test]
    async fn test_cache_hit_skips_network() {
        let dir = tempfile::tempdir().unwrap();
        let provider = flaky(0);
        let engine = engine(dir.path(), provider.clone(), 1);
        let first = engine.fetch(&request("wind_speed", 6)).await.unwrap();
        assert!(!first.from_cache);
        let second = engine.fetch(&request("wspd10m", 6)).await.unwrap();
        assert!(second.from_cache);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
        assert_eq!(first.component_paths, second.component_paths);
    }

    #[tokio::test]
    async fn test_request_validation() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path(), flaky(0), 1);

        let err = engine.fetch(&request("precip_ptype", 0)).await.unwrap_err();
        assert!(matches!(err, IngestionError::UnsupportedForecastHour { .. }));

        let mut outside = request("tmp2m", 6);
        outside.model = Model::Hrrr;
        outside.forecast_hour = 1;
        outside.region = Region::new("europe", wx_common::BoundingBox::new(-15.0, 35.0, 45.0, 72.0)).unwrap();
        let err = engine.fetch(&outside).await.unwrap_err();
        assert!(matches!(err, IngestionError::RegionOutsideDomain { .. }));

        let mut no_provider = request("tmp2m", 1);
        no_provider.model = Model::Hrrr;
        assert!(matches!(
            engine.fetch(&no_provider).await,
            Err(IngestionError::InvalidConfig(_))
        ));
    }
}
