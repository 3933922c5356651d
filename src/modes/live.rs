use anyhow::{Context, Result};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{self, AsyncBufRead, AsyncBufReadExt};
use tracing::{info, warn};

use crate::cache::now_epoch;
use crate::call::CallEvent;
use crate::catalog::Catalog;
use crate::engine::Evaluator;
use crate::notify::Notifier;
use crate::sweep::{SweepCfg, SweepHandle, SweepSupervisor};

use super::shared::{handle_call, load_engine_cfg, open_cache, open_catalog};

pub(super) async fn run() -> Result<()> {
    let cfg = load_engine_cfg();
    let catalog = open_catalog(&cfg)?;
    let cache = open_cache(&cfg)?;

    let sweep_cfg = SweepCfg::from_env();
    let (sweeps, sweep_join) = SweepSupervisor::spawn(Arc::clone(&cache), sweep_cfg);
    reconcile_sweeps(catalog.as_ref(), &sweeps).await?;

    {
        let catalog = Arc::clone(&catalog);
        let sweeps = sweeps.clone();
        let every = Duration::from_secs(cfg.refresh_secs);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(every).await;
                if let Err(e) = reconcile_sweeps(catalog.as_ref(), &sweeps).await {
                    warn!("Sweep reconcile failed: {e:#}");
                }
            }
        });
    }

    let notifier = Notifier::from_env();
    info!("Notifier: {notifier}");

    let evaluator = Evaluator::new(catalog, cache);

    info!("Running in live mode. Reading call events from stdin...");
    let fired = read_calls(io::BufReader::new(io::stdin()), &evaluator, Some(&notifier)).await?;

    info!("Input stream ended after {fired} alert(s), shutting down sweepers");
    sweeps.shutdown().await?;
    let _ = sweep_join.await;
    Ok(())
}

/// Evaluate newline-delimited call events until the input ends and return
/// how many alerts fired. Lines that are not valid JSON (or not UTF-8 at
/// all) are logged and skipped.
async fn read_calls<R>(input: R, evaluator: &Evaluator, notifier: Option<&Notifier>) -> Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = input.split(b'\n');
    let mut fired = 0usize;
    loop {
        let line = match lines.next_segment().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) if e.kind() == std::io::ErrorKind::InvalidData => {
                warn!("Skipping unreadable call event: {e}");
                continue;
            }
            Err(e) => return Err(e).context("failed to read call events"),
        };
        let line = line.trim_ascii();
        if line.is_empty() {
            continue;
        }
        let call: CallEvent = match serde_json::from_slice(line) {
            Ok(call) => call,
            Err(e) => {
                warn!("Skipping malformed call event: {e}");
                continue;
            }
        };

        let records = handle_call(evaluator, notifier, &call, now_epoch()).await;
        if !records.is_empty() {
            info!(
                "{} alert(s) fired for {}",
                records.len(),
                call.short_name
            );
            fired += records.len();
        }
    }
    Ok(fired)
}

/// Bring the running sweepers in line with the catalog: (re)start systems
/// without a live sweeper, stop the ones that vanished. A renamed system is
/// stop-old + start-new.
async fn reconcile_sweeps(catalog: &dyn Catalog, sweeps: &SweepHandle) -> Result<()> {
    let wanted: HashSet<String> = catalog
        .systems()?
        .into_iter()
        .map(|s| s.short_name)
        .collect();
    let running: HashSet<String> = sweeps.running().await?.into_iter().collect();

    for name in running.difference(&wanted) {
        sweeps.stop(name).await?;
    }
    // Covers both new systems and sweepers that exited on their own.
    for name in wanted.difference(&running) {
        sweeps.restart(name).await?;
    }
    Ok(())
}
