//! Ingester configuration.
//!
//! Loaded from a single YAML file. Every section and most keys are optional;
//! a file listing only the models and their providers is enough.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use ingestion::{FetchPolicy, Model};
use pipeline::PipelineConfig;
use storage::PublishPolicy;
use wx_common::Region;

#[derive(Debug, Clone, Deserialize)]
pub struct IngesterConfig {
    /// Root of `cache/`, `staging/` and `published/`.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Frames built at once.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub publish: PublishConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default = "default_discovery_ttl")]
    pub discovery_ttl_secs: u64,
    /// YAML list of variable definitions replacing the built-in table.
    #[serde(default)]
    pub variables_file: Option<PathBuf>,
    #[serde(default)]
    pub models: Vec<ModelConfig>,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_concurrency() -> usize {
    4
}

fn default_poll_interval() -> u64 {
    300
}

fn default_discovery_ttl() -> u64 {
    5
}

#[derive(Debug, Clone, Deserialize)]
pub struct FetchConfig {
    #[serde(default = "default_provider_timeout")]
    pub provider_timeout_secs: u64,
    #[serde(default = "default_rounds")]
    pub rounds: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_secs: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,
}

fn default_provider_timeout() -> u64 {
    60
}

fn default_rounds() -> u32 {
    2
}

fn default_initial_backoff() -> u64 {
    2
}

fn default_max_backoff() -> u64 {
    30
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            provider_timeout_secs: default_provider_timeout(),
            rounds: default_rounds(),
            initial_backoff_secs: default_initial_backoff(),
            max_backoff_secs: default_max_backoff(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PublishConfig {
    #[serde(default = "default_gate")]
    pub gate: usize,
    #[serde(default = "default_delta")]
    pub delta: usize,
    #[serde(default = "default_zoom_max")]
    pub zoom_max: u8,
    #[serde(default = "default_tile_url_prefix")]
    pub tile_url_prefix: String,
    #[serde(default = "default_frame_url_prefix")]
    pub frame_url_prefix: String,
}

fn default_gate() -> usize {
    6
}

fn default_delta() -> usize {
    3
}

fn default_zoom_max() -> u8 {
    7
}

fn default_tile_url_prefix() -> String {
    "/tiles".to_string()
}

fn default_frame_url_prefix() -> String {
    "/frames".to_string()
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            gate: default_gate(),
            delta: default_delta(),
            zoom_max: default_zoom_max(),
            tile_url_prefix: default_tile_url_prefix(),
            frame_url_prefix: default_frame_url_prefix(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetentionConfig {
    /// Cycles kept in both the raw cache and the published tree.
    #[serde(default = "default_keep_runs")]
    pub keep_runs: usize,
}

fn default_keep_runs() -> usize {
    2
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            keep_runs: default_keep_runs(),
        }
    }
}

/// One model to poll.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    pub id: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Variable ids or aliases. Empty means every variable the model offers.
    #[serde(default)]
    pub variables: Vec<String>,
    /// Defaults to CONUS.
    #[serde(default)]
    pub region: Option<Region>,
    /// Defaults to the model's own forecast hours per variable.
    #[serde(default)]
    pub forecast_hours: Option<HourRange>,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
}

fn default_enabled() -> bool {
    true
}

impl ModelConfig {
    pub fn model(&self) -> Result<Model> {
        Ok(self.id.parse::<Model>()?)
    }

    /// The configured region, validated.
    pub fn region(&self) -> Result<Region> {
        match &self.region {
            Some(region) => Ok(Region::new(region.id.clone(), region.bounds)?),
            None => Ok(Region::conus()),
        }
    }
}

/// Inclusive `start..=end` stepping by `step`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct HourRange {
    #[serde(default)]
    pub start: u32,
    pub end: u32,
    #[serde(default = "default_step")]
    pub step: u32,
}

fn default_step() -> u32 {
    1
}

impl HourRange {
    pub fn hours(&self) -> Vec<u32> {
        (self.start..=self.end)
            .step_by(self.step.max(1) as usize)
            .collect()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    /// Upstream file URL; see [`ingestion::ProviderRequest::expand_url`].
    pub url_template: String,
}

impl IngesterConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config = Self::from_yaml_str(&content)
            .with_context(|| format!("Invalid config {}", path.display()))?;
        Ok(config)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that would only fail later inside a pass.
    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            bail!("concurrency must be at least 1");
        }
        if self.publish.gate == 0 {
            bail!("publish.gate must be at least 1");
        }
        if self.retention.keep_runs == 0 {
            bail!("retention.keep_runs must be at least 1");
        }
        for model in &self.models {
            model
                .model()
                .with_context(|| format!("models entry '{}'", model.id))?;
            model
                .region()
                .with_context(|| format!("region of model '{}'", model.id))?;
            if model.enabled && model.providers.is_empty() {
                bail!("model '{}' is enabled but has no providers", model.id);
            }
            if let Some(range) = model.forecast_hours {
                if range.step == 0 || range.start > range.end {
                    bail!(
                        "model '{}' has an empty forecast hour range {}..={} step {}",
                        model.id,
                        range.start,
                        range.end,
                        range.step
                    );
                }
            }
        }
        Ok(())
    }

    /// Enabled models, optionally narrowed to one id.
    pub fn enabled_models(&self, only: Option<&str>) -> Result<Vec<&ModelConfig>> {
        let models: Vec<&ModelConfig> = self
            .models
            .iter()
            .filter(|m| m.enabled)
            .filter(|m| only.map_or(true, |id| m.id.eq_ignore_ascii_case(id)))
            .collect();
        if let Some(id) = only {
            if models.is_empty() {
                bail!("model '{}' is not configured or not enabled", id);
            }
        }
        Ok(models)
    }

    pub fn fetch_policy(&self) -> FetchPolicy {
        FetchPolicy {
            provider_timeout: Duration::from_secs(self.fetch.provider_timeout_secs),
            rounds: self.fetch.rounds.max(1),
            initial_backoff: Duration::from_secs(self.fetch.initial_backoff_secs),
            max_backoff: Duration::from_secs(self.fetch.max_backoff_secs),
        }
    }

    pub fn publish_policy(&self) -> PublishPolicy {
        PublishPolicy {
            gate: self.publish.gate,
            delta: self.publish.delta,
            zoom_max: self.publish.zoom_max,
            tile_url_prefix: self.publish.tile_url_prefix.clone(),
            frame_url_prefix: self.publish.frame_url_prefix.clone(),
        }
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            max_concurrent: self.concurrency,
            keep_runs: self.retention.keep_runs,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn discovery_ttl(&self) -> Duration {
        Duration::from_secs(self.discovery_ttl_secs)
    }
}
