//! Cycle inventory and keep-N retention.
//!
//! A cycle inventory is a directory whose children are cycle directories.
//! Two shapes occur and may be mixed:
//!
//! - flat run directories (`published/<model>/20260207_06z`), and
//! - day/hour nesting (`cache/<model>/20260207/06`), canonicalised to the
//!   run id `20260207_06z`.
//!
//! Ordering is all-or-nothing: if every cycle name is a run id the listing is
//! sorted by name (fixed width, so lexicographic is chronological); if any
//! name is irregular the whole listing falls back to modification time.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tracing::{debug, info, instrument, warn};
use walkdir::WalkDir;

use wx_common::RunId;

use crate::atomic::is_temp_name;
use crate::error::{StoreError, StoreResult};

/// Retention settings for one inventory.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub base_dir: PathBuf,
    pub keep_runs: usize,
}

impl CacheConfig {
    pub fn new(base_dir: impl Into<PathBuf>, keep_runs: usize) -> Self {
        Self {
            base_dir: base_dir.into(),
            keep_runs,
        }
    }
}

/// One cycle directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cycle {
    /// Run id for canonical cycles, the relative path otherwise.
    pub name: String,
    pub path: PathBuf,
    /// Enclosing day directory for day/hour nested cycles.
    pub day_dir: Option<PathBuf>,
    pub modified: SystemTime,
}

impl Cycle {
    pub fn run_id(&self) -> Option<RunId> {
        RunId::parse(&self.name).ok()
    }
}

/// Outcome of one retention pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetentionSummary {
    pub deleted_cycles: Vec<String>,
    pub deleted_files: usize,
    pub deleted_day_dirs: usize,
    pub kept_cycles: Vec<String>,
    /// Cycles that could not be deleted, with the reason. Retried next pass.
    pub failures: Vec<(String, String)>,
}

fn is_day_name(name: &str) -> bool {
    name.len() == 8 && name.bytes().all(|b| b.is_ascii_digit())
}

fn is_hour_name(name: &str) -> bool {
    name.len() == 2 && name.bytes().all(|b| b.is_ascii_digit())
}

fn modified(path: &Path) -> SystemTime {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .unwrap_or(SystemTime::UNIX_EPOCH)
}

fn subdirs(dir: &Path) -> StoreResult<Vec<(String, PathBuf)>> {
    let mut out = Vec::new();
    for entry in fs::read_dir(dir).map_err(StoreError::io(dir))? {
        let entry = entry.map_err(StoreError::io(dir))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') || is_temp_name(&name) {
            continue;
        }
        if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            out.push((name, entry.path()));
        }
    }
    Ok(out)
}

/// List cycles newest first. A missing base directory is an empty inventory.
pub fn list_cycles(cfg: &CacheConfig) -> StoreResult<Vec<Cycle>> {
    if !cfg.base_dir.exists() {
        return Ok(Vec::new());
    }

    let mut cycles = Vec::new();
    for (name, path) in subdirs(&cfg.base_dir)? {
        if !is_day_name(&name) {
            cycles.push(Cycle {
                modified: modified(&path),
                name,
                path,
                day_dir: None,
            });
            continue;
        }
        for (hour, hour_path) in subdirs(&path)? {
            let cycle_name = if is_hour_name(&hour) {
                format!("{}_{}z", name, hour)
            } else {
                format!("{}/{}", name, hour)
            };
            cycles.push(Cycle {
                modified: modified(&hour_path),
                name: cycle_name,
                path: hour_path,
                day_dir: Some(path.clone()),
            });
        }
    }

    if cycles.iter().all(|c| RunId::is_valid(&c.name)) {
        cycles.sort_by(|a, b| b.name.cmp(&a.name));
    } else {
        debug!(base = %cfg.base_dir.display(), "Irregular cycle names, ordering by mtime");
        cycles.sort_by(|a, b| b.modified.cmp(&a.modified).then_with(|| b.name.cmp(&a.name)));
    }
    Ok(cycles)
}

/// Delete every cycle beyond the newest `max(1, keep_runs)`, except the
/// protected ones. Per-cycle failures are collected, never fatal.
#[instrument(skip(cfg, protected), fields(base = %cfg.base_dir.display(), keep = cfg.keep_runs))]
pub fn enforce_retention(cfg: &CacheConfig, protected: &HashSet<String>) -> StoreResult<RetentionSummary> {
    let cycles = list_cycles(cfg)?;
    let keep = cfg.keep_runs.max(1);
    let mut summary = RetentionSummary::default();

    for (i, cycle) in cycles.into_iter().enumerate() {
        if i < keep {
            summary.kept_cycles.push(cycle.name);
            continue;
        }
        if protected.contains(&cycle.name) {
            debug!(cycle = %cycle.name, "Keeping protected cycle");
            summary.kept_cycles.push(cycle.name);
            continue;
        }

        let files = WalkDir::new(&cycle.path)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .count();
        match fs::remove_dir_all(&cycle.path) {
            Ok(()) => {
                summary.deleted_files += files;
                summary.deleted_cycles.push(cycle.name.clone());
            }
            Err(e) => {
                warn!(cycle = %cycle.name, error = %e, "Failed to delete cycle");
                summary.failures.push((cycle.name.clone(), e.to_string()));
                continue;
            }
        }

        if let Some(day) = &cycle.day_dir {
            let empty = fs::read_dir(day).map(|mut d| d.next().is_none()).unwrap_or(false);
            if empty && fs::remove_dir(day).is_ok() {
                summary.deleted_day_dirs += 1;
            }
        }
    }

    metrics::counter!("retention_deleted_cycles_total").increment(summary.deleted_cycles.len() as u64);
    info!(
        deleted = summary.deleted_cycles.len(),
        files = summary.deleted_files,
        day_dirs = summary.deleted_day_dirs,
        kept = summary.kept_cycles.len(),
        failures = summary.failures.len(),
        "Retention pass complete"
    );
    Ok(summary)
}
