//! Polling scheduler: one pass per model per interval.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::future::join_all;
use tracing::{debug, error, info, instrument, warn};

use encoding::{EncodingPolicy, FrameEncoder, LocalRasterEngine};
use ingestion::{
    AcquisitionEngine, GribDecoder, HttpProvider, Model, Provider, VariableRegistry,
};
use pipeline::{BuildReport, Pipeline, RetentionReport};
use storage::{DiscoveryCache, StoreLayout};
use wx_common::{Clock, Region, RunId, RunSelector, SystemClock};

use crate::config::IngesterConfig;

/// What to build for one model.
#[derive(Debug, Clone)]
pub struct ModelPlan {
    pub model: Model,
    pub region: Region,
    /// Empty means every variable the model offers.
    pub variables: Vec<String>,
    /// Narrows each variable's own forecast hours when set.
    pub forecast_hours: Option<Vec<u32>>,
}

/// Result of one model pass.
#[derive(Debug, Clone)]
pub struct ModelReport {
    pub model: Model,
    pub run: RunId,
    pub builds: Vec<BuildReport>,
    /// Variables whose pass aborted, with the error.
    pub failed: Vec<(String, String)>,
    pub retention: Option<RetentionReport>,
    /// Variables published under the model's pointer after the pass.
    pub serving: Vec<String>,
}

pub struct Scheduler {
    pipeline: Arc<Pipeline>,
    plans: Vec<ModelPlan>,
    poll_interval: Duration,
    discovery: DiscoveryCache,
}

impl Scheduler {
    pub fn new(
        pipeline: Arc<Pipeline>,
        plans: Vec<ModelPlan>,
        poll_interval: Duration,
        discovery_ttl: Duration,
    ) -> Self {
        let discovery = DiscoveryCache::new(
            pipeline.layout().clone(),
            discovery_ttl,
            Arc::new(SystemClock),
        );
        Self {
            pipeline,
            plans,
            poll_interval,
            discovery,
        }
    }

    /// Wire HTTP providers, the GRIB decoder and the local raster engine
    /// from configuration.
    pub fn from_config(config: &IngesterConfig, only_model: Option<&str>) -> Result<Self> {
        let registry = match &config.variables_file {
            Some(path) => VariableRegistry::from_yaml_file(path)
                .with_context(|| format!("Failed to load variables from {}", path.display()))?,
            None => VariableRegistry::builtin().context("Invalid built-in variable table")?,
        };
        let layout = StoreLayout::new(&config.data_dir);
        let fetch = config.fetch_policy();
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        let mut acquisition = AcquisitionEngine::new(
            Arc::new(registry),
            layout.clone(),
            fetch.clone(),
            clock,
        );
        let mut plans = Vec::new();
        for model_config in config.enabled_models(only_model)? {
            let model = model_config.model()?;
            let mut providers: Vec<Arc<dyn Provider>> = Vec::new();
            for provider in &model_config.providers {
                let http = HttpProvider::new(
                    provider.name.clone(),
                    provider.url_template.clone(),
                    fetch.provider_timeout,
                )
                .with_context(|| format!("provider '{}' of {}", provider.name, model))?;
                providers.push(Arc::new(http));
            }
            info!(
                model = %model,
                providers = providers.len(),
                variables = model_config.variables.len(),
                "Configured model"
            );
            acquisition = acquisition.with_providers(model, providers);
            plans.push(ModelPlan {
                model,
                region: model_config.region()?,
                variables: model_config.variables.clone(),
                forecast_hours: model_config.forecast_hours.map(|r| r.hours()),
            });
        }

        let encoder = FrameEncoder::new(Arc::new(LocalRasterEngine::new()), EncodingPolicy::default());
        let pipeline = Pipeline::new(
            Arc::new(acquisition),
            Arc::new(GribDecoder),
            Arc::new(encoder),
            layout,
            config.publish_policy(),
            config.pipeline_config(),
        );
        Ok(Self::new(
            Arc::new(pipeline),
            plans,
            config.poll_interval(),
            config.discovery_ttl(),
        ))
    }

    pub fn plans(&self) -> &[ModelPlan] {
        &self.plans
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Poll forever. Failures are logged and retried on the next pass.
    pub async fn run_forever(&self) -> Result<()> {
        loop {
            info!("Starting ingestion pass");
            self.run_once().await;

            info!(
                interval_secs = self.poll_interval.as_secs(),
                "Sleeping until next pass"
            );
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// One pass over every model.
    pub async fn run_once(&self) -> Vec<ModelReport> {
        let mut reports = Vec::with_capacity(self.plans.len());
        for plan in &self.plans {
            match self.run_model(plan).await {
                Ok(report) => reports.push(report),
                Err(e) => error!(model = %plan.model, error = %e, "Model pass failed"),
            }
        }
        reports
    }

    /// Build every variable of the model's latest upstream cycle, then run
    /// retention.
    #[instrument(skip_all, fields(model = %plan.model))]
    pub async fn run_model(&self, plan: &ModelPlan) -> Result<ModelReport> {
        let model = plan.model;
        let run = self
            .pipeline
            .acquisition()
            .resolve_run(model, &RunSelector::Latest);
        let jobs = self.jobs(plan)?;
        info!(run = %run, variables = jobs.len(), "Starting model pass");

        // Frames of all variables share the pipeline's worker pool.
        let results = join_all(jobs.iter().map(|(var, hours)| {
            self.pipeline
                .build_variable(model, &plan.region, &run, var, hours)
        }))
        .await;

        let mut builds = Vec::new();
        let mut failed = Vec::new();
        for ((var, _), result) in jobs.iter().zip(results) {
            match result {
                Ok(report) => builds.push(report),
                Err(e) => {
                    error!(var = %var, error = %e, "Variable pass failed");
                    failed.push((var.clone(), e.to_string()));
                }
            }
        }

        let retention = match self.pipeline.enforce_retention(model).await {
            Ok(report) => Some(report),
            Err(e) => {
                warn!(error = %e, "Retention pass failed");
                None
            }
        };

        let serving = match self
            .discovery
            .list_vars(model.id(), &RunSelector::Latest)
            .await
        {
            Ok(vars) => vars,
            Err(e) => {
                debug!(error = %e, "Nothing published yet");
                Vec::new()
            }
        };

        info!(
            run = %run,
            built = builds.len(),
            failed = failed.len(),
            serving = serving.len(),
            "Model pass finished"
        );
        Ok(ModelReport {
            model,
            run,
            builds,
            failed,
            retention,
            serving,
        })
    }

    /// Canonical variable ids and their forecast hours.
    fn jobs(&self, plan: &ModelPlan) -> Result<Vec<(String, Vec<u32>)>> {
        let registry = self.pipeline.acquisition().registry();
        let requested = if plan.variables.is_empty() {
            registry.ids_for(plan.model)
        } else {
            plan.variables.clone()
        };

        let mut jobs: Vec<(String, Vec<u32>)> = Vec::new();
        for var in &requested {
            let resolved = registry
                .resolve(plan.model, var)
                .with_context(|| format!("variable '{}' of {}", var, plan.model))?;
            if jobs.iter().any(|(id, _)| *id == resolved.spec.id) {
                continue;
            }
            let own = plan.model.target_forecast_hours(&resolved.spec);
            let hours = match &plan.forecast_hours {
                Some(hours) => hours.iter().copied().filter(|h| own.contains(h)).collect(),
                None => own,
            };
            if hours.is_empty() {
                debug!(var = %resolved.spec.id, "No forecast hours to build");
                continue;
            }
            jobs.push((resolved.spec.id, hours));
        }
        Ok(jobs)
    }
}
