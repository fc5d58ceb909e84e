//! Read-side TTL cache over the published tree.
//!
//! Only `published/` is ever read, so staged frames are invisible here until
//! a publish promotes them. Entries expire lazily: an access past the TTL
//! drops the entry and reloads it, and every insert sweeps out the other
//! expired entries so keys of retired runs do not pile up. There is no
//! background sweep.
//!
//! `latest` is resolved to a concrete run before any run-scoped key is
//! built, so `latest` and the run it names share one entry.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::fs;
use tokio::sync::RwLock;
use tracing::debug;

use wx_common::{validate_segment, Clock, FrameId, RunId, RunSelector, WxError};

use crate::atomic::read_json;
use crate::error::{StoreError, StoreResult};
use crate::layout::{StoreLayout, MANIFEST_FILE};
use crate::manifest::{FrameEntry, LatestPointer, PublishedManifest, RunManifest, CONTRACT_VERSION};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Op {
    Models,
    Pointer,
    Runs,
    Vars,
    Frames,
    Manifest,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    op: Op,
    model: String,
    run: Option<RunId>,
    var: Option<String>,
}

impl CacheKey {
    fn new(op: Op, model: &str, run: Option<&RunId>, var: Option<&str>) -> Self {
        Self {
            op,
            model: model.to_string(),
            run: run.cloned(),
            var: var.map(str::to_string),
        }
    }
}

#[derive(Debug, Clone)]
enum Cached {
    Names(Arc<Vec<String>>),
    Runs(Arc<Vec<RunId>>),
    Run(RunId),
    Frames(Arc<Vec<FrameEntry>>),
    Manifest(Arc<RunManifest>),
}

struct Entry {
    value: Cached,
    inserted_at: Instant,
}

/// Hit/miss counters, readable without locking.
#[derive(Debug, Default)]
pub struct DiscoveryStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub expired: AtomicU64,
}

impl DiscoveryStats {
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}

/// Cached listings of published state.
///
/// Construct once per process and share by `Arc`.
pub struct DiscoveryCache {
    layout: StoreLayout,
    ttl: Duration,
    clock: Arc<dyn Clock>,
    entries: RwLock<HashMap<CacheKey, Entry>>,
    stats: DiscoveryStats,
}

impl DiscoveryCache {
    pub fn new(layout: StoreLayout, ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            layout,
            ttl,
            clock,
            entries: RwLock::new(HashMap::new()),
            stats: DiscoveryStats::default(),
        }
    }

    pub fn stats(&self) -> &DiscoveryStats {
        &self.stats
    }

    async fn get(&self, key: &CacheKey) -> Option<Cached> {
        let now = self.clock.now();
        {
            let entries = self.entries.read().await;
            match entries.get(key) {
                Some(entry) if now.saturating_duration_since(entry.inserted_at) <= self.ttl => {
                    self.stats.hits.fetch_add(1, Ordering::Relaxed);
                    return Some(entry.value.clone());
                }
                Some(_) => {}
                None => {
                    self.stats.misses.fetch_add(1, Ordering::Relaxed);
                    return None;
                }
            }
        }

        let mut entries = self.entries.write().await;
        if entries
            .get(key)
            .is_some_and(|e| now.saturating_duration_since(e.inserted_at) > self.ttl)
        {
            entries.remove(key);
            self.stats.expired.fetch_add(1, Ordering::Relaxed);
        }
        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    async fn put(&self, key: CacheKey, value: Cached) {
        let now = self.clock.now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, e| now.saturating_duration_since(e.inserted_at) <= self.ttl);
        let swept = before - entries.len();
        if swept > 0 {
            self.stats.expired.fetch_add(swept as u64, Ordering::Relaxed);
            debug!(swept, "Swept expired discovery entries");
        }
        entries.insert(
            key,
            Entry {
                value,
                inserted_at: now,
            },
        );
    }

    /// Number of live and not yet evicted entries.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn model_dir(&self, model: &str) -> StoreResult<PathBuf> {
        self.layout.published_model_dir(model)
    }

    /// Models with a published tree, sorted.
    pub async fn list_models(&self) -> StoreResult<Vec<String>> {
        let key = CacheKey::new(Op::Models, "", None, None);
        if let Some(Cached::Names(names)) = self.get(&key).await {
            return Ok(names.as_ref().clone());
        }

        let mut models = Vec::new();
        for name in subdir_names(&self.layout.published_root()).await? {
            if validate_segment(&name).is_ok() {
                models.push(name);
            }
        }
        models.sort();
        self.put(key, Cached::Names(Arc::new(models.clone()))).await;
        Ok(models)
    }

    /// Resolve `latest` through the model's pointer; concrete runs pass through.
    pub async fn resolve_run(&self, model: &str, run: &RunSelector) -> StoreResult<RunId> {
        let dir = self.model_dir(model)?;
        let latest = match run {
            RunSelector::Run(run) => return Ok(run.clone()),
            RunSelector::Latest => CacheKey::new(Op::Pointer, model, None, None),
        };
        if let Some(Cached::Run(run)) = self.get(&latest).await {
            return Ok(run);
        }

        let pointer: Option<LatestPointer> = read_json(&self.layout.pointer_path(model)?).await?;
        let run = match pointer {
            Some(p) => p.run,
            None if dir.exists() => {
                return Err(WxError::RunNotFound {
                    model: model.to_string(),
                    run: "latest".to_string(),
                }
                .into())
            }
            None => return Err(WxError::ModelNotFound(model.to_string()).into()),
        };
        self.put(latest, Cached::Run(run.clone())).await;
        Ok(run)
    }

    /// Published runs of a model, newest first.
    pub async fn list_runs(&self, model: &str) -> StoreResult<Vec<RunId>> {
        let dir = self.model_dir(model)?;
        let key = CacheKey::new(Op::Runs, model, None, None);
        if let Some(Cached::Runs(runs)) = self.get(&key).await {
            return Ok(runs.as_ref().clone());
        }
        if !dir.exists() {
            return Err(WxError::ModelNotFound(model.to_string()).into());
        }

        let mut runs = Vec::new();
        for name in subdir_names(&dir).await? {
            let Ok(run) = RunId::parse(&name) else {
                continue;
            };
            if !published_vars(&dir.join(&name)).await?.is_empty() {
                runs.push(run);
            }
        }
        runs.sort_by(|a, b| b.cmp(a));
        self.put(key, Cached::Runs(Arc::new(runs.clone()))).await;
        Ok(runs)
    }

    /// Published variables of a run, sorted.
    pub async fn list_vars(&self, model: &str, run: &RunSelector) -> StoreResult<Vec<String>> {
        let run = self.resolve_run(model, run).await?;
        let key = CacheKey::new(Op::Vars, model, Some(&run), None);
        if let Some(Cached::Names(vars)) = self.get(&key).await {
            return Ok(vars.as_ref().clone());
        }

        let vars = published_vars(&self.layout.published_run_dir(model, &run)?).await?;
        if vars.is_empty() {
            return Err(WxError::RunNotFound {
                model: model.to_string(),
                run: run.to_string(),
            }
            .into());
        }
        self.put(key, Cached::Names(Arc::new(vars.clone()))).await;
        Ok(vars)
    }

    /// Frames of a published variable, ascending by forecast hour.
    pub async fn list_frames(
        &self,
        model: &str,
        run: &RunSelector,
        var: &str,
    ) -> StoreResult<Vec<FrameEntry>> {
        validate_segment(var)?;
        let run = self.resolve_run(model, run).await?;
        let key = CacheKey::new(Op::Frames, model, Some(&run), Some(var));
        if let Some(Cached::Frames(frames)) = self.get(&key).await {
            return Ok(frames.as_ref().clone());
        }

        let manifest = self.read_var_manifest(model, &run, var).await?;
        let mut frames: Vec<FrameEntry> = manifest
            .frames
            .into_iter()
            .filter(|f| FrameId::parse(&f.frame_id).is_ok())
            .collect();
        frames.sort_by_key(|f| f.fhr);
        self.put(key, Cached::Frames(Arc::new(frames.clone()))).await;
        Ok(frames)
    }

    /// Every published variable manifest of a run.
    pub async fn load_manifest(&self, model: &str, run: &RunSelector) -> StoreResult<RunManifest> {
        let run = self.resolve_run(model, run).await?;
        let key = CacheKey::new(Op::Manifest, model, Some(&run), None);
        if let Some(Cached::Manifest(manifest)) = self.get(&key).await {
            return Ok(manifest.as_ref().clone());
        }

        let mut variables = BTreeMap::new();
        for var in self.list_vars(model, &RunSelector::Run(run.clone())).await? {
            let manifest = self.read_var_manifest(model, &run, &var).await?;
            variables.insert(var, manifest);
        }
        let manifest = RunManifest {
            contract_version: CONTRACT_VERSION,
            model: model.to_string(),
            run,
            variables,
        };
        self.put(key, Cached::Manifest(Arc::new(manifest.clone()))).await;
        Ok(manifest)
    }

    async fn read_var_manifest(&self, model: &str, run: &RunId, var: &str) -> StoreResult<PublishedManifest> {
        let path = self.layout.published_var_dir(model, run, var)?.join(MANIFEST_FILE);
        debug!(path = %path.display(), "Loading published manifest");
        read_json(&path).await?.ok_or_else(|| {
            WxError::VariableNotFound {
                model: model.to_string(),
                run: run.to_string(),
                var: var.to_string(),
            }
            .into()
        })
    }
}

async fn subdir_names(dir: &Path) -> StoreResult<Vec<String>> {
    let mut names = Vec::new();
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
        Err(e) => return Err(StoreError::io(dir)(e)),
    };
    while let Some(entry) = entries.next_entry().await.map_err(StoreError::io(dir))? {
        let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
        let name = entry.file_name().to_string_lossy().into_owned();
        if is_dir && !name.starts_with('.') {
            names.push(name);
        }
    }
    Ok(names)
}

/// Variable directories of a run that hold a published manifest.
async fn published_vars(run_dir: &Path) -> StoreResult<Vec<String>> {
    let mut vars = Vec::new();
    for name in subdir_names(run_dir).await? {
        if validate_segment(&name).is_ok() && run_dir.join(&name).join(MANIFEST_FILE).exists() {
            vars.push(name);
        }
    }
    vars.sort();
    Ok(vars)
}
