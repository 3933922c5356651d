use anyhow::{Result, anyhow};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::cache::{AlertCache, MemoryCache};
use crate::engine::Evaluator;
use crate::notify::{self, Notifier};

use super::shared::{
    handle_call, load_call_events, load_engine_cfg, load_replay_cfg, open_catalog,
    open_document_catalog,
};

pub(super) async fn run() -> Result<()> {
    let replay = load_replay_cfg()?;
    let events = load_call_events(&replay.input_path)?;
    if events.is_empty() {
        return Err(anyhow!("Replay input is empty: {}", replay.input_path));
    }

    let catalog = match &replay.catalog_path {
        Some(path) => open_document_catalog(path)?,
        None => open_catalog(&load_engine_cfg())?,
    };
    // Replay runs on the calls' own clock, so the cache is always fresh and
    // swept lazily instead of by wall-clock sweepers.
    let cache: Arc<dyn AlertCache> = Arc::new(MemoryCache::new());
    let evaluator = Evaluator::new(catalog, Arc::clone(&cache));

    let notifier = replay.notify.then(Notifier::from_env);
    info!(
        "Replay started: {} events from {}",
        events.len(),
        replay.input_path
    );
    if let Some(n) = &notifier {
        info!("Replay notify enabled: {n}");
    }

    let mut fired = 0usize;
    let mut quiet = 0usize;

    for (idx, event) in events.iter().enumerate() {
        if idx > 0 {
            let prev = &events[idx - 1];
            let delay_ms = if let Some(step_ms) = replay.fixed_step_ms {
                step_ms
            } else {
                let delta_s = (event.start_time - prev.start_time).max(0.0);
                let scaled = (delta_s * 1000.0 / replay.speed).round() as u64;
                scaled.clamp(replay.min_delay_ms, replay.max_delay_ms)
            };
            if delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            }
        }

        let now = event.start_time;
        if let Err(e) = cache.evict_expired(&event.short_name, now) {
            warn!("Replay eviction failed for {}: {e:#}", event.short_name);
        }

        let records = handle_call(&evaluator, notifier.as_ref(), event, now).await;
        if records.is_empty() {
            quiet += 1;
            continue;
        }
        fired += records.len();
        if notifier.is_none() {
            if let Ok(Some(system)) = evaluator.catalog().system(&event.short_name) {
                let formatted = notify::format_alert(&system, &records, event);
                println!("\n[REPLAY ALERT {}]\n{}\n", idx + 1, formatted);
            }
        }
    }

    info!(
        "Replay complete: calls={}, alerts_fired={}, quiet_calls={}",
        events.len(),
        fired,
        quiet
    );

    Ok(())
}
