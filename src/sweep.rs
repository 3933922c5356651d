//! Background expiry of active-alert entries, one task per radio system.
//!
//! The supervisor owns every task handle and cancellation signal. Other
//! code only talks to it through [`SweepHandle`] commands, so the map of
//! running sweepers is never touched from request handling.

use anyhow::{Result, anyhow};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::cache::{AlertCache, now_epoch};

#[derive(Debug, Clone, Copy)]
pub struct SweepCfg {
    /// Sleep between passes.
    pub interval: Duration,
    /// How long `stop` waits for the sweeper to wind down before leaving it
    /// to exit on its own.
    pub grace: Duration,
}

impl SweepCfg {
    /// | Env var             | Default | Purpose                          |
    /// |---------------------|---------|----------------------------------|
    /// | `SWEEP_INTERVAL_MS` | `1000`  | Pause between sweep passes       |
    /// | `SWEEP_GRACE_MS`    | `2000`  | Wait for a stopping sweeper      |
    pub fn from_env() -> Self {
        let interval_ms: u64 = std::env::var("SWEEP_INTERVAL_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|v| *v > 0)
            .unwrap_or(1000);
        let grace_ms: u64 = std::env::var("SWEEP_GRACE_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(2000);
        Self {
            interval: Duration::from_millis(interval_ms),
            grace: Duration::from_millis(grace_ms),
        }
    }
}

impl Default for SweepCfg {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            grace: Duration::from_secs(2),
        }
    }
}

/// One eviction pass. Returns how many entries were removed.
pub fn sweep_once(cache: &dyn AlertCache, system: &str, now: f64) -> Result<usize> {
    cache.evict_expired(system, now)
}

async fn sweep_loop(
    cache: Arc<dyn AlertCache>,
    system: String,
    interval: Duration,
    mut cancel: watch::Receiver<bool>,
) {
    info!("Sweep started for {system}");
    loop {
        // Cancellation is only observed between passes. A dropped sender
        // means the supervisor itself is gone.
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            changed = cancel.changed() => {
                if changed.is_err() || *cancel.borrow() {
                    break;
                }
                continue;
            }
        }
        if *cancel.borrow() {
            break;
        }
        match sweep_once(cache.as_ref(), &system, now_epoch()) {
            Ok(0) => {}
            Ok(removed) => info!("Removed {removed} expired alert(s) for {system}"),
            Err(e) => warn!("Sweep pass failed for {system}: {e:#}"),
        }
    }
    info!("Sweep stopped for {system}");
}

struct SweepTask {
    cancel: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

enum Command {
    Start(String, oneshot::Sender<()>),
    Stop(String, oneshot::Sender<()>),
    Restart(String, oneshot::Sender<()>),
    Running(oneshot::Sender<Vec<String>>),
    Shutdown(oneshot::Sender<()>),
}

/// Cloneable front end to the supervisor task.
#[derive(Clone)]
pub struct SweepHandle {
    tx: mpsc::Sender<Command>,
}

impl SweepHandle {
    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(make(reply_tx))
            .await
            .map_err(|_| anyhow!("sweep supervisor is not running"))?;
        reply_rx
            .await
            .map_err(|_| anyhow!("sweep supervisor dropped the request"))
    }

    /// Start sweeping `system` unless a live sweeper already exists.
    pub async fn start(&self, system: &str) -> Result<()> {
        self.request(|tx| Command::Start(system.to_string(), tx)).await
    }

    pub async fn stop(&self, system: &str) -> Result<()> {
        self.request(|tx| Command::Stop(system.to_string(), tx)).await
    }

    pub async fn restart(&self, system: &str) -> Result<()> {
        self.request(|tx| Command::Restart(system.to_string(), tx)).await
    }

    /// Short names with a live sweeper, sorted.
    pub async fn running(&self) -> Result<Vec<String>> {
        self.request(Command::Running).await
    }

    /// Stop every sweeper and end the supervisor.
    pub async fn shutdown(&self) -> Result<()> {
        self.request(Command::Shutdown).await
    }
}

pub struct SweepSupervisor {
    cache: Arc<dyn AlertCache>,
    cfg: SweepCfg,
    tasks: HashMap<String, SweepTask>,
}

impl SweepSupervisor {
    /// Spawn the supervisor; it runs until `shutdown` or every handle drops.
    pub fn spawn(cache: Arc<dyn AlertCache>, cfg: SweepCfg) -> (SweepHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(32);
        let supervisor = Self {
            cache,
            cfg,
            tasks: HashMap::new(),
        };
        let join = tokio::spawn(supervisor.run(rx));
        (SweepHandle { tx }, join)
    }

    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        while let Some(cmd) = rx.recv().await {
            match cmd {
                Command::Start(system, reply) => {
                    self.start(&system);
                    let _ = reply.send(());
                }
                Command::Stop(system, reply) => {
                    self.stop(&system).await;
                    let _ = reply.send(());
                }
                Command::Restart(system, reply) => {
                    info!("Restarting sweep for {system}");
                    self.stop(&system).await;
                    self.start(&system);
                    let _ = reply.send(());
                }
                Command::Running(reply) => {
                    let mut names: Vec<String> = self
                        .tasks
                        .iter()
                        .filter(|(_, t)| !t.handle.is_finished())
                        .map(|(name, _)| name.clone())
                        .collect();
                    names.sort();
                    let _ = reply.send(names);
                }
                Command::Shutdown(reply) => {
                    self.stop_all().await;
                    let _ = reply.send(());
                    return;
                }
            }
        }
        self.stop_all().await;
    }

    fn start(&mut self, system: &str) {
        if let Some(task) = self.tasks.get(system) {
            if !task.handle.is_finished() {
                return;
            }
            warn!("Sweep task for {system} had exited, replacing it");
        }
        info!("Starting sweep for {system}");
        let (cancel, cancel_rx) = watch::channel(false);
        let handle = tokio::spawn(sweep_loop(
            Arc::clone(&self.cache),
            system.to_string(),
            self.cfg.interval,
            cancel_rx,
        ));
        self.tasks
            .insert(system.to_string(), SweepTask { cancel, handle });
    }

    async fn stop(&mut self, system: &str) {
        let Some(task) = self.tasks.remove(system) else {
            return;
        };
        info!("Stopping sweep for {system}");
        let _ = task.cancel.send(true);
        // The sweeper is only ever asked to stop. If it is still mid-pass it
        // finishes that pass and exits by itself.
        if tokio::time::timeout(self.cfg.grace, task.handle).await.is_err() {
            warn!(
                "Sweep for {system} still running after {:?}, it will exit after its current pass",
                self.cfg.grace
            );
        }
    }

    async fn stop_all(&mut self) {
        let names: Vec<String> = self.tasks.keys().cloned().collect();
        for name in names {
            self.stop(&name).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{ActiveAlertEntry, MemoryCache};

    fn fast_cfg() -> SweepCfg {
        SweepCfg {
            interval: Duration::from_millis(10),
            grace: Duration::from_millis(200),
        }
    }

    fn entry(trigger_id: i64, last_detected: f64, ignore_seconds: u64) -> ActiveAlertEntry {
        ActiveAlertEntry {
            trigger_id,
            last_detected,
            ignore_seconds,
        }
    }

    #[test]
    fn sweep_once_removes_only_expired() {
        let cache = MemoryCache::new();
        cache.append("a", entry(1, 1000.0, 300)).unwrap();
        cache.append("a", entry(2, 1200.0, 300)).unwrap();
        assert_eq!(sweep_once(&cache, "a", 1300.0).unwrap(), 1);
        assert_eq!(cache.read("a").unwrap(), vec![entry(2, 1200.0, 300)]);
    }

    #[tokio::test]
    async fn started_sweeper_evicts_expired_entries() {
        let cache = Arc::new(MemoryCache::new());
        let now = now_epoch();
        cache.append("county", entry(1, now - 600.0, 300)).unwrap();
        cache.append("county", entry(2, now, 300)).unwrap();
        cache.append("other", entry(3, now - 600.0, 300)).unwrap();

        let (handle, _join) = SweepSupervisor::spawn(cache.clone(), fast_cfg());
        handle.start("county").await.unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;

        assert_eq!(cache.read("county").unwrap(), vec![entry(2, now, 300)]);
        // No sweeper runs for "other".
        assert_eq!(cache.read("other").unwrap().len(), 1);
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn start_is_idempotent_and_stop_removes() {
        let cache = Arc::new(MemoryCache::new());
        let (handle, _join) = SweepSupervisor::spawn(cache, fast_cfg());

        handle.start("a").await.unwrap();
        handle.start("a").await.unwrap();
        handle.start("b").await.unwrap();
        assert_eq!(handle.running().await.unwrap(), vec!["a", "b"]);

        handle.stop("a").await.unwrap();
        assert_eq!(handle.running().await.unwrap(), vec!["b"]);

        // Stopping something that never ran is a no-op.
        handle.stop("zzz").await.unwrap();
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn restart_keeps_a_single_sweeper() {
        let cache = Arc::new(MemoryCache::new());
        let (handle, _join) = SweepSupervisor::spawn(cache.clone(), fast_cfg());

        handle.restart("a").await.unwrap();
        assert_eq!(handle.running().await.unwrap(), vec!["a"]);
        handle.restart("a").await.unwrap();
        assert_eq!(handle.running().await.unwrap(), vec!["a"]);

        cache.append("a", entry(1, now_epoch() - 10.0, 1)).unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(cache.read("a").unwrap().is_empty());
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn stopped_sweeper_no_longer_evicts() {
        let cache = Arc::new(MemoryCache::new());
        let (handle, _join) = SweepSupervisor::spawn(cache.clone(), fast_cfg());
        handle.start("a").await.unwrap();
        handle.stop("a").await.unwrap();

        cache.append("a", entry(1, now_epoch() - 10.0, 1)).unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(cache.read("a").unwrap().len(), 1);
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn stop_does_not_wait_out_a_long_interval() {
        let cfg = SweepCfg {
            interval: Duration::from_secs(60),
            grace: Duration::from_secs(5),
        };
        let (handle, _join) = SweepSupervisor::spawn(Arc::new(MemoryCache::new()), cfg);
        handle.start("a").await.unwrap();

        let began = std::time::Instant::now();
        handle.stop("a").await.unwrap();
        assert!(began.elapsed() < Duration::from_secs(1));
        assert!(handle.running().await.unwrap().is_empty());
        handle.shutdown().await.unwrap();
    }

    struct UnreachableStore;

    impl AlertCache for UnreachableStore {
        fn read(&self, _: &str) -> Result<Vec<ActiveAlertEntry>> {
            Err(anyhow!("store offline"))
        }

        fn append(&self, _: &str, _: ActiveAlertEntry) -> Result<()> {
            Err(anyhow!("store offline"))
        }

        fn replace(&self, _: &str, _: Vec<ActiveAlertEntry>) -> Result<()> {
            Err(anyhow!("store offline"))
        }

        fn evict_expired(&self, _: &str, _: f64) -> Result<usize> {
            Err(anyhow!("store offline"))
        }
    }

    #[tokio::test]
    async fn failing_passes_keep_the_sweeper_alive() {
        let (handle, _join) = SweepSupervisor::spawn(Arc::new(UnreachableStore), fast_cfg());
        handle.start("county").await.unwrap();

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(handle.running().await.unwrap(), vec!["county"]);
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_ends_supervisor() {
        let cache = Arc::new(MemoryCache::new());
        let (handle, join) = SweepSupervisor::spawn(cache, fast_cfg());
        handle.start("a").await.unwrap();
        handle.shutdown().await.unwrap();
        join.await.unwrap();
        assert!(handle.running().await.is_err());
    }
}
