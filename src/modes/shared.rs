use anyhow::{Context, Result, anyhow};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::sync::Arc;
use tracing::{info, warn};

use crate::cache::{AlertCache, MemoryCache, SqliteCache};
use crate::call::CallEvent;
use crate::catalog::{Catalog, CatalogDocument, MemoryCatalog, SqliteCatalog};
use crate::engine::{AlertRecord, Evaluator};
use crate::notify::{self, Notifier};

#[derive(Clone)]
pub(super) struct EngineCfg {
    pub catalog_db_path: String,
    /// Empty means the in-memory cache.
    pub cache_db_path: String,
    pub refresh_secs: u64,
}

#[derive(Clone)]
pub(super) struct ReplayCfg {
    pub input_path: String,
    /// Optional JSON catalog document; falls back to the SQLite catalog.
    pub catalog_path: Option<String>,
    pub speed: f64,
    pub fixed_step_ms: Option<u64>,
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
    pub notify: bool,
}

pub(super) fn must_env(key: &str) -> Result<String> {
    std::env::var(key).map_err(|_| anyhow!("Missing env var {key}"))
}

pub(super) fn parse_bool_env(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true") || v.eq_ignore_ascii_case("yes"))
        .unwrap_or(default)
}

pub(super) fn load_engine_cfg() -> EngineCfg {
    EngineCfg {
        catalog_db_path: std::env::var("CATALOG_DB_PATH")
            .unwrap_or_else(|_| "./catalog.sqlite".into()),
        cache_db_path: std::env::var("CACHE_DB_PATH")
            .map(|v| v.trim().to_string())
            .unwrap_or_default(),
        refresh_secs: std::env::var("CATALOG_REFRESH_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(30),
    }
}

pub(super) fn load_replay_cfg() -> Result<ReplayCfg> {
    let input_path = must_env("REPLAY_INPUT_PATH")?;
    let catalog_path = std::env::var("REPLAY_CATALOG_PATH")
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty());
    let speed = std::env::var("REPLAY_SPEED")
        .ok()
        .and_then(|v| v.parse::<f64>().ok())
        .filter(|v| *v > 0.0)
        .unwrap_or(1.0);
    let fixed_step_ms = std::env::var("REPLAY_STEP_MS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|v| *v > 0);
    let min_delay_ms = std::env::var("REPLAY_MIN_DELAY_MS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0);
    let max_delay_ms = std::env::var("REPLAY_MAX_DELAY_MS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(10_000);

    Ok(ReplayCfg {
        input_path,
        catalog_path,
        speed,
        fixed_step_ms,
        min_delay_ms,
        max_delay_ms,
        notify: parse_bool_env("REPLAY_NOTIFY", false),
    })
}

pub(super) fn open_catalog(cfg: &EngineCfg) -> Result<Arc<dyn Catalog>> {
    let catalog = SqliteCatalog::open(&cfg.catalog_db_path)
        .with_context(|| format!("failed to open catalog {}", cfg.catalog_db_path))?;
    Ok(Arc::new(catalog))
}

pub(super) fn open_document_catalog(path: &str) -> Result<Arc<dyn Catalog>> {
    let doc = CatalogDocument::load(path)?;
    Ok(Arc::new(MemoryCatalog::from_document(doc)))
}

pub(super) fn open_cache(cfg: &EngineCfg) -> Result<Arc<dyn AlertCache>> {
    if cfg.cache_db_path.is_empty() {
        info!("Active-alert cache: in-memory");
        return Ok(Arc::new(MemoryCache::new()));
    }
    info!("Active-alert cache: sqlite at {}", cfg.cache_db_path);
    let cache = SqliteCache::open(&cfg.cache_db_path)
        .with_context(|| format!("failed to open cache {}", cfg.cache_db_path))?;
    Ok(Arc::new(cache))
}

/// Read newline-delimited call events, ordered by start time.
pub(super) fn load_call_events(path: &str) -> Result<Vec<CallEvent>> {
    let file = File::open(path).with_context(|| format!("failed to open replay file {path}"))?;
    let reader = BufReader::new(file);

    let mut events = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("failed to read line {}", idx + 1))?;
        if line.trim().is_empty() {
            continue;
        }
        let event: CallEvent = serde_json::from_str(&line)
            .with_context(|| format!("invalid JSON at line {}", idx + 1))?;
        events.push(event);
    }

    events.sort_by(|a, b| a.start_time.total_cmp(&b.start_time));
    Ok(events)
}

/// Resolve the call's system, evaluate it and hand any results to the
/// notifier. Unknown systems are skipped.
pub(super) async fn handle_call(
    evaluator: &Evaluator,
    notifier: Option<&Notifier>,
    call: &CallEvent,
    now: f64,
) -> Vec<AlertRecord> {
    let system = match evaluator.catalog().system(&call.short_name) {
        Ok(Some(system)) => system,
        Ok(None) => {
            warn!("Unknown radio system {:?}, skipping call", call.short_name);
            return Vec::new();
        }
        Err(e) => {
            warn!("System lookup failed for {}: {e:#}", call.short_name);
            return Vec::new();
        }
    };

    let records = evaluator.evaluate(&system, call, now);
    if let Some(notifier) = notifier {
        notify::dispatch(notifier, &system, call, &records).await;
    }
    records
}
