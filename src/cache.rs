//! Active-alert cache: per-system record of triggers that recently fired
//! and are suppressed until their ignore window runs out.

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlite::State;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::info;

use crate::catalog::{SharedDb, lock_db};

/// Wall clock in fractional epoch seconds.
pub fn now_epoch() -> f64 {
    Utc::now().timestamp_millis() as f64 / 1000.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveAlertEntry {
    pub trigger_id: i64,
    pub last_detected: f64,
    pub ignore_seconds: u64,
}

impl ActiveAlertEntry {
    pub fn expires_at(&self) -> f64 {
        self.last_detected + self.ignore_seconds as f64
    }

    /// Suppression holds while `now < last_detected + ignore_seconds`.
    pub fn is_expired(&self, now: f64) -> bool {
        now >= self.expires_at()
    }
}

/// Split into `(kept, expired)`, preserving relative order on both sides.
pub fn partition_expired(
    entries: Vec<ActiveAlertEntry>,
    now: f64,
) -> (Vec<ActiveAlertEntry>, Vec<ActiveAlertEntry>) {
    let (expired, kept): (Vec<_>, Vec<_>) = entries.into_iter().partition(|e| e.is_expired(now));
    (kept, expired)
}

/// Store shared by evaluators (read + append) and sweepers (evict).
///
/// Each call is atomic on its own; nothing makes a sequence of calls atomic.
pub trait AlertCache: Send + Sync {
    fn read(&self, system: &str) -> Result<Vec<ActiveAlertEntry>>;

    fn append(&self, system: &str, entry: ActiveAlertEntry) -> Result<()>;

    /// Swap the whole collection for `kept`.
    fn replace(&self, system: &str, kept: Vec<ActiveAlertEntry>) -> Result<()>;

    /// Drop every entry with `expires_at <= now` and return how many went.
    ///
    /// The fallback is read → partition → replace, which loses any entry
    /// appended between the read and the replace. Stores that can do it in
    /// one step override this.
    fn evict_expired(&self, system: &str, now: f64) -> Result<usize> {
        let entries = self.read(system)?;
        let total = entries.len();
        let (kept, _) = partition_expired(entries, now);
        let removed = total - kept.len();
        if removed > 0 {
            self.replace(system, kept)?;
        }
        Ok(removed)
    }
}

// ─────────────────────────── In-memory ───────────────────────────────────

#[derive(Debug, Default)]
pub struct MemoryCache {
    systems: Mutex<HashMap<String, Vec<ActiveAlertEntry>>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Vec<ActiveAlertEntry>>>> {
        self.systems
            .lock()
            .map_err(|_| anyhow!("active alert cache mutex poisoned"))
    }
}

impl AlertCache for MemoryCache {
    fn read(&self, system: &str) -> Result<Vec<ActiveAlertEntry>> {
        Ok(self.lock()?.get(system).cloned().unwrap_or_default())
    }

    fn append(&self, system: &str, entry: ActiveAlertEntry) -> Result<()> {
        self.lock()?.entry(system.to_string()).or_default().push(entry);
        Ok(())
    }

    fn replace(&self, system: &str, kept: Vec<ActiveAlertEntry>) -> Result<()> {
        let mut map = self.lock()?;
        if kept.is_empty() {
            map.remove(system);
        } else {
            map.insert(system.to_string(), kept);
        }
        Ok(())
    }

    fn evict_expired(&self, system: &str, now: f64) -> Result<usize> {
        let mut map = self.lock()?;
        let Some(entries) = map.get_mut(system) else {
            return Ok(0);
        };
        let before = entries.len();
        entries.retain(|e| !e.is_expired(now));
        let removed = before - entries.len();
        if entries.is_empty() {
            map.remove(system);
        }
        Ok(removed)
    }
}

// ───────────────────────────── SQLite ────────────────────────────────────

const CACHE_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS active_alerts (
    system         TEXT    NOT NULL,
    trigger_id     INTEGER NOT NULL,
    last_detected  REAL    NOT NULL,
    ignore_seconds INTEGER NOT NULL,
    expires_at     REAL    NOT NULL
);
CREATE INDEX IF NOT EXISTS active_alerts_expiry ON active_alerts (system, expires_at);";

/// Cache that survives restarts, so a redeploy does not re-fire every
/// trigger that was still inside its ignore window.
#[derive(Clone)]
pub struct SqliteCache {
    db: SharedDb,
}

impl SqliteCache {
    pub fn open(path: &str) -> Result<Self> {
        let conn =
            sqlite::open(path).with_context(|| format!("failed to open alert cache {path}"))?;
        conn.execute(CACHE_SCHEMA)?;
        info!("Active alert cache opened at {path}");
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
        })
    }
}

fn insert_entry(conn: &sqlite::Connection, system: &str, entry: &ActiveAlertEntry) -> Result<()> {
    let mut stmt = conn.prepare(
        "INSERT INTO active_alerts (system, trigger_id, last_detected, ignore_seconds, expires_at)
         VALUES (?, ?, ?, ?, ?)",
    )?;
    stmt.bind((1, system))?;
    stmt.bind((2, entry.trigger_id))?;
    stmt.bind((3, entry.last_detected))?;
    stmt.bind((4, entry.ignore_seconds as i64))?;
    stmt.bind((5, entry.expires_at()))?;
    stmt.next()?;
    Ok(())
}

impl AlertCache for SqliteCache {
    fn read(&self, system: &str) -> Result<Vec<ActiveAlertEntry>> {
        let db = lock_db(&self.db)?;
        let mut stmt = db.prepare(
            "SELECT trigger_id, last_detected, ignore_seconds FROM active_alerts
             WHERE system = ? ORDER BY rowid",
        )?;
        stmt.bind((1, system))?;
        let mut entries = Vec::new();
        while let State::Row = stmt.next()? {
            entries.push(ActiveAlertEntry {
                trigger_id: stmt.read::<i64, _>(0)?,
                last_detected: stmt.read::<f64, _>(1)?,
                ignore_seconds: stmt.read::<i64, _>(2)?.max(0) as u64,
            });
        }
        Ok(entries)
    }

    fn append(&self, system: &str, entry: ActiveAlertEntry) -> Result<()> {
        let db = lock_db(&self.db)?;
        insert_entry(&db, system, &entry)
    }

    fn replace(&self, system: &str, kept: Vec<ActiveAlertEntry>) -> Result<()> {
        let db = lock_db(&self.db)?;
        db.execute("BEGIN IMMEDIATE")?;
        let result = (|| -> Result<()> {
            let mut stmt = db.prepare("DELETE FROM active_alerts WHERE system = ?")?;
            stmt.bind((1, system))?;
            stmt.next()?;
            for entry in &kept {
                insert_entry(&db, system, entry)?;
            }
            Ok(())
        })();
        match result {
            Ok(()) => {
                db.execute("COMMIT")?;
                Ok(())
            }
            Err(e) => {
                db.execute("ROLLBACK").ok();
                Err(e)
            }
        }
    }

    fn evict_expired(&self, system: &str, now: f64) -> Result<usize> {
        let db = lock_db(&self.db)?;
        let mut stmt = db.prepare("DELETE FROM active_alerts WHERE system = ? AND expires_at <= ?")?;
        stmt.bind((1, system))?;
        stmt.bind((2, now))?;
        stmt.next()?;
        Ok(db.change_count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(trigger_id: i64, last_detected: f64, ignore_seconds: u64) -> ActiveAlertEntry {
        ActiveAlertEntry {
            trigger_id,
            last_detected,
            ignore_seconds,
        }
    }

    /// Only the three primitive operations, so the default eviction runs.
    #[derive(Default)]
    struct PrimitiveOnly(MemoryCache);

    impl AlertCache for PrimitiveOnly {
        fn read(&self, system: &str) -> Result<Vec<ActiveAlertEntry>> {
            self.0.read(system)
        }
        fn append(&self, system: &str, entry: ActiveAlertEntry) -> Result<()> {
            self.0.append(system, entry)
        }
        fn replace(&self, system: &str, kept: Vec<ActiveAlertEntry>) -> Result<()> {
            self.0.replace(system, kept)
        }
    }

    #[test]
    fn expiry_boundary_is_inclusive() {
        let e = entry(1, 1000.0, 300);
        assert!(!e.is_expired(1299.9));
        assert!(e.is_expired(1300.0));
        assert!(e.is_expired(1310.0));
    }

    #[test]
    fn partition_is_order_independent() {
        let mixed = vec![
            entry(1, 1000.0, 300), // expires 1300
            entry(2, 1100.0, 300), // expires 1400
            entry(3, 900.0, 60),   // expires 960
            entry(4, 1200.0, 100), // expires 1300
        ];
        let mut reversed = mixed.clone();
        reversed.reverse();

        for input in [mixed, reversed] {
            let (kept, expired) = partition_expired(input, 1300.0);
            let mut kept_ids: Vec<i64> = kept.iter().map(|e| e.trigger_id).collect();
            let mut expired_ids: Vec<i64> = expired.iter().map(|e| e.trigger_id).collect();
            kept_ids.sort();
            expired_ids.sort();
            assert_eq!(kept_ids, vec![2]);
            assert_eq!(expired_ids, vec![1, 3, 4]);
        }
    }

    #[test]
    fn partition_of_nothing_expired_keeps_everything() {
        let entries = vec![entry(1, 1000.0, 300), entry(2, 1000.0, 300)];
        let (kept, expired) = partition_expired(entries.clone(), 1000.0);
        assert_eq!(kept, entries);
        assert!(expired.is_empty());
    }

    fn exercise_store(cache: &dyn AlertCache) {
        cache.append("a", entry(1, 1000.0, 300)).unwrap();
        cache.append("a", entry(2, 1000.0, 500)).unwrap();
        cache.append("b", entry(1, 1000.0, 10)).unwrap();

        assert_eq!(cache.read("a").unwrap().len(), 2);
        assert!(cache.read("missing").unwrap().is_empty());

        assert_eq!(cache.evict_expired("a", 1300.0).unwrap(), 1);
        assert_eq!(cache.read("a").unwrap(), vec![entry(2, 1000.0, 500)]);
        // Other systems are untouched.
        assert_eq!(cache.read("b").unwrap().len(), 1);

        assert_eq!(cache.evict_expired("a", 1300.0).unwrap(), 0);
        assert_eq!(cache.evict_expired("a", 1500.0).unwrap(), 1);
        assert!(cache.read("a").unwrap().is_empty());
        assert_eq!(cache.evict_expired("missing", 1500.0).unwrap(), 0);

        cache
            .replace("b", vec![entry(7, 2000.0, 1), entry(8, 2000.0, 1)])
            .unwrap();
        let ids: Vec<i64> = cache.read("b").unwrap().iter().map(|e| e.trigger_id).collect();
        assert_eq!(ids, vec![7, 8]);
        cache.replace("b", Vec::new()).unwrap();
        assert!(cache.read("b").unwrap().is_empty());
    }

    #[test]
    fn memory_cache_operations() {
        exercise_store(&MemoryCache::new());
    }

    #[test]
    fn default_eviction_via_replace() {
        exercise_store(&PrimitiveOnly::default());
    }

    #[test]
    fn sqlite_cache_operations() {
        exercise_store(&SqliteCache::open(":memory:").unwrap());
    }

    #[test]
    fn sqlite_cache_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.sqlite");
        let path = path.to_str().unwrap();

        SqliteCache::open(path)
            .unwrap()
            .append("a", entry(3, 1000.0, 300))
            .unwrap();

        let reopened = SqliteCache::open(path).unwrap();
        assert_eq!(reopened.read("a").unwrap(), vec![entry(3, 1000.0, 300)]);
    }
}
