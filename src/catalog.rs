//! Trigger catalog: radio systems, their alert triggers and the keyword
//! filters those triggers reference.
//!
//! The catalog is owned by the admin side of the application; the alert
//! engine only ever reads a snapshot per evaluation.

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use sqlite::State;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::info;

pub const DEFAULT_TONE_TOLERANCE_PCT: f64 = 2.0;
pub const DEFAULT_IGNORE_SECS: u64 = 300;
pub const DEFAULT_TWO_TONE_A_LENGTH: f64 = 0.8;
pub const DEFAULT_TWO_TONE_B_LENGTH: f64 = 2.3;
pub const DEFAULT_LONG_TONE_LENGTH: f64 = 0.0;
pub const DEFAULT_HI_LOW_ALTERNATIONS: u32 = 4;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RadioSystem {
    pub system_id: i64,
    /// Stable key for cache and sweep scoping.
    pub short_name: String,
    #[serde(default)]
    pub name: String,
}

// ───────────────────────────── Raw rows ──────────────────────────────────

/// A trigger exactly as stored: every target column is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TriggerRow {
    pub trigger_id: i64,
    #[serde(default)]
    pub trigger_name: String,
    #[serde(default)]
    pub enabled: bool,
    pub two_tone_a: Option<f64>,
    pub two_tone_a_length: Option<f64>,
    pub two_tone_b: Option<f64>,
    pub two_tone_b_length: Option<f64>,
    pub long_tone: Option<f64>,
    pub long_tone_length: Option<f64>,
    pub hi_low_tone_a: Option<f64>,
    pub hi_low_tone_b: Option<f64>,
    pub hi_low_alternations: Option<u32>,
    pub alert_filter_id: Option<i64>,
    pub tone_tolerance: Option<f64>,
    pub ignore_time: Option<u64>,
    #[serde(default)]
    pub enable_facebook: bool,
    #[serde(default)]
    pub enable_telegram: bool,
}

// ─────────────────────────── Typed triggers ──────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TwoToneTarget {
    pub freq_a: f64,
    pub min_len_a: f64,
    pub freq_b: f64,
    pub min_len_b: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LongToneTarget {
    pub freq: f64,
    pub min_len: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HiLowTarget {
    pub freq_hi: f64,
    pub freq_low: f64,
    pub min_alternations: u32,
}

/// One condition a trigger requires. Only the categories whose targets are
/// configured become conditions; an empty list means the trigger is inert.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Condition {
    TwoTone(TwoToneTarget),
    LongTone(LongToneTarget),
    HiLow(HiLowTarget),
    /// Referenced filter id. Whether it is actually required depends on the
    /// filter being resolvable and enabled at evaluation time.
    KeywordFilter(i64),
}

#[derive(Debug, Clone, PartialEq)]
pub struct AlertTrigger {
    pub id: i64,
    pub name: String,
    pub enabled: bool,
    pub conditions: Vec<Condition>,
    pub tone_tolerance: f64,
    pub ignore_time: u64,
    pub facebook_enabled: bool,
    pub telegram_enabled: bool,
}

impl AlertTrigger {
    pub fn is_inert(&self) -> bool {
        self.conditions.is_empty()
    }
}

impl From<TriggerRow> for AlertTrigger {
    fn from(row: TriggerRow) -> Self {
        let mut conditions = Vec::new();

        if let (Some(freq_a), Some(freq_b)) = (row.two_tone_a, row.two_tone_b) {
            conditions.push(Condition::TwoTone(TwoToneTarget {
                freq_a,
                min_len_a: row.two_tone_a_length.unwrap_or(DEFAULT_TWO_TONE_A_LENGTH),
                freq_b,
                min_len_b: row.two_tone_b_length.unwrap_or(DEFAULT_TWO_TONE_B_LENGTH),
            }));
        }
        if let Some(freq) = row.long_tone {
            conditions.push(Condition::LongTone(LongToneTarget {
                freq,
                min_len: row.long_tone_length.unwrap_or(DEFAULT_LONG_TONE_LENGTH),
            }));
        }
        if let (Some(freq_hi), Some(freq_low)) = (row.hi_low_tone_a, row.hi_low_tone_b) {
            conditions.push(Condition::HiLow(HiLowTarget {
                freq_hi,
                freq_low,
                min_alternations: row
                    .hi_low_alternations
                    .unwrap_or(DEFAULT_HI_LOW_ALTERNATIONS),
            }));
        }
        if let Some(filter_id) = row.alert_filter_id {
            conditions.push(Condition::KeywordFilter(filter_id));
        }

        Self {
            id: row.trigger_id,
            name: row.trigger_name,
            enabled: row.enabled,
            conditions,
            tone_tolerance: row.tone_tolerance.unwrap_or(DEFAULT_TONE_TOLERANCE_PCT),
            ignore_time: row.ignore_time.unwrap_or(DEFAULT_IGNORE_SECS),
            facebook_enabled: row.enable_facebook,
            telegram_enabled: row.enable_telegram,
        }
    }
}

// ──────────────────────────── Filters ────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Keyword {
    pub keyword: String,
    #[serde(default)]
    pub is_excluded: bool,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

fn enabled_by_default() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertFilter {
    pub alert_filter_id: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    #[serde(default)]
    pub keywords: Vec<Keyword>,
}

// ──────────────────────────── Boundary ───────────────────────────────────

/// Read-only view of the configuration store.
pub trait Catalog: Send + Sync {
    fn systems(&self) -> Result<Vec<RadioSystem>>;
    fn system(&self, short_name: &str) -> Result<Option<RadioSystem>>;
    /// Triggers for a system, ordered by id.
    fn triggers(&self, system_id: i64) -> Result<Vec<AlertTrigger>>;
    fn filter(&self, filter_id: i64) -> Result<Option<AlertFilter>>;
}

/// JSON document accepted by the import mode and by [`MemoryCatalog`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogDocument {
    #[serde(default)]
    pub systems: Vec<SystemDocument>,
    #[serde(default)]
    pub filters: Vec<AlertFilter>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemDocument {
    #[serde(flatten)]
    pub system: RadioSystem,
    #[serde(default)]
    pub triggers: Vec<TriggerRow>,
}

impl CatalogDocument {
    pub fn load(path: &str) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read catalog document {path}"))?;
        serde_json::from_str(&raw).with_context(|| format!("invalid catalog JSON in {path}"))
    }
}

// ─────────────────────────── In-memory ───────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct MemoryCatalog {
    systems: Vec<RadioSystem>,
    triggers: HashMap<i64, Vec<AlertTrigger>>,
    filters: HashMap<i64, AlertFilter>,
}

impl MemoryCatalog {
    pub fn from_document(doc: CatalogDocument) -> Self {
        let mut catalog = Self::default();
        for sys in doc.systems {
            let mut triggers: Vec<AlertTrigger> =
                sys.triggers.into_iter().map(AlertTrigger::from).collect();
            triggers.sort_by_key(|t| t.id);
            catalog.triggers.insert(sys.system.system_id, triggers);
            catalog.systems.push(sys.system);
        }
        for filter in doc.filters {
            catalog.filters.insert(filter.alert_filter_id, filter);
        }
        catalog
    }
}

impl Catalog for MemoryCatalog {
    fn systems(&self) -> Result<Vec<RadioSystem>> {
        Ok(self.systems.clone())
    }

    fn system(&self, short_name: &str) -> Result<Option<RadioSystem>> {
        Ok(self
            .systems
            .iter()
            .find(|s| s.short_name == short_name)
            .cloned())
    }

    fn triggers(&self, system_id: i64) -> Result<Vec<AlertTrigger>> {
        Ok(self.triggers.get(&system_id).cloned().unwrap_or_default())
    }

    fn filter(&self, filter_id: i64) -> Result<Option<AlertFilter>> {
        Ok(self.filters.get(&filter_id).cloned())
    }
}

// ───────────────────────────── SQLite ────────────────────────────────────

const CATALOG_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS radio_systems (
    system_id  INTEGER PRIMARY KEY,
    short_name TEXT    NOT NULL UNIQUE,
    name       TEXT    NOT NULL DEFAULT ''
);
CREATE TABLE IF NOT EXISTS alert_triggers (
    trigger_id          INTEGER PRIMARY KEY,
    system_id           INTEGER NOT NULL,
    trigger_name        TEXT    NOT NULL DEFAULT '',
    enabled             INTEGER NOT NULL DEFAULT 0,
    two_tone_a          REAL,
    two_tone_a_length   REAL,
    two_tone_b          REAL,
    two_tone_b_length   REAL,
    long_tone           REAL,
    long_tone_length    REAL,
    hi_low_tone_a       REAL,
    hi_low_tone_b       REAL,
    hi_low_alternations INTEGER,
    alert_filter_id     INTEGER,
    tone_tolerance      REAL,
    ignore_time         INTEGER,
    enable_facebook     INTEGER NOT NULL DEFAULT 0,
    enable_telegram     INTEGER NOT NULL DEFAULT 0
);
CREATE TABLE IF NOT EXISTS alert_filters (
    alert_filter_id INTEGER PRIMARY KEY,
    name            TEXT    NOT NULL DEFAULT '',
    enabled         INTEGER NOT NULL DEFAULT 1
);
CREATE TABLE IF NOT EXISTS filter_keywords (
    keyword_id      INTEGER PRIMARY KEY AUTOINCREMENT,
    alert_filter_id INTEGER NOT NULL,
    keyword         TEXT    NOT NULL,
    is_excluded     INTEGER NOT NULL DEFAULT 0,
    enabled         INTEGER NOT NULL DEFAULT 1
);";

pub type SharedDb = Arc<Mutex<sqlite::Connection>>;

pub(crate) fn lock_db(db: &SharedDb) -> Result<MutexGuard<'_, sqlite::Connection>> {
    db.lock().map_err(|_| anyhow!("sqlite connection mutex poisoned"))
}

#[derive(Clone)]
pub struct SqliteCatalog {
    db: SharedDb,
}

impl SqliteCatalog {
    /// Open (or create) the catalog database and ensure the schema exists.
    pub fn open(path: &str) -> Result<Self> {
        let conn = sqlite::open(path).with_context(|| format!("failed to open catalog {path}"))?;
        conn.execute(CATALOG_SCHEMA)?;
        info!("Catalog DB opened at {path}");
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn upsert_system(&self, system: &RadioSystem) -> Result<()> {
        let db = lock_db(&self.db)?;
        let mut stmt = db.prepare(
            "INSERT OR REPLACE INTO radio_systems (system_id, short_name, name) VALUES (?, ?, ?)",
        )?;
        stmt.bind((1, system.system_id))?;
        stmt.bind((2, system.short_name.as_str()))?;
        stmt.bind((3, system.name.as_str()))?;
        stmt.next()?;
        Ok(())
    }

    pub fn upsert_trigger(&self, system_id: i64, row: &TriggerRow) -> Result<()> {
        let db = lock_db(&self.db)?;
        let mut stmt = db.prepare(
            "INSERT OR REPLACE INTO alert_triggers (
                trigger_id, system_id, trigger_name, enabled,
                two_tone_a, two_tone_a_length, two_tone_b, two_tone_b_length,
                long_tone, long_tone_length,
                hi_low_tone_a, hi_low_tone_b, hi_low_alternations,
                alert_filter_id, tone_tolerance, ignore_time,
                enable_facebook, enable_telegram
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )?;
        stmt.bind((1, row.trigger_id))?;
        stmt.bind((2, system_id))?;
        stmt.bind((3, row.trigger_name.as_str()))?;
        stmt.bind((4, row.enabled as i64))?;
        stmt.bind((5, row.two_tone_a))?;
        stmt.bind((6, row.two_tone_a_length))?;
        stmt.bind((7, row.two_tone_b))?;
        stmt.bind((8, row.two_tone_b_length))?;
        stmt.bind((9, row.long_tone))?;
        stmt.bind((10, row.long_tone_length))?;
        stmt.bind((11, row.hi_low_tone_a))?;
        stmt.bind((12, row.hi_low_tone_b))?;
        stmt.bind((13, row.hi_low_alternations.map(i64::from)))?;
        stmt.bind((14, row.alert_filter_id))?;
        stmt.bind((15, row.tone_tolerance))?;
        stmt.bind((16, row.ignore_time.map(|s| s as i64)))?;
        stmt.bind((17, row.enable_facebook as i64))?;
        stmt.bind((18, row.enable_telegram as i64))?;
        stmt.next()?;
        Ok(())
    }

    /// Replace a filter and its whole keyword list.
    pub fn upsert_filter(&self, filter: &AlertFilter) -> Result<()> {
        let db = lock_db(&self.db)?;
        let mut stmt = db.prepare(
            "INSERT OR REPLACE INTO alert_filters (alert_filter_id, name, enabled) VALUES (?, ?, ?)",
        )?;
        stmt.bind((1, filter.alert_filter_id))?;
        stmt.bind((2, filter.name.as_str()))?;
        stmt.bind((3, filter.enabled as i64))?;
        stmt.next()?;

        let mut stmt = db.prepare("DELETE FROM filter_keywords WHERE alert_filter_id = ?")?;
        stmt.bind((1, filter.alert_filter_id))?;
        stmt.next()?;

        for kw in &filter.keywords {
            let mut stmt = db.prepare(
                "INSERT INTO filter_keywords (alert_filter_id, keyword, is_excluded, enabled)
                 VALUES (?, ?, ?, ?)",
            )?;
            stmt.bind((1, filter.alert_filter_id))?;
            stmt.bind((2, kw.keyword.as_str()))?;
            stmt.bind((3, kw.is_excluded as i64))?;
            stmt.bind((4, kw.enabled as i64))?;
            stmt.next()?;
        }
        Ok(())
    }

    /// Load a whole document. Existing rows with the same ids are replaced.
    pub fn import(&self, doc: &CatalogDocument) -> Result<(usize, usize, usize)> {
        let mut trigger_count = 0;
        for sys in &doc.systems {
            self.upsert_system(&sys.system)?;
            for row in &sys.triggers {
                self.upsert_trigger(sys.system.system_id, row)?;
                trigger_count += 1;
            }
        }
        for filter in &doc.filters {
            self.upsert_filter(filter)?;
        }
        Ok((doc.systems.len(), trigger_count, doc.filters.len()))
    }

    fn query_systems(&self, short_name: Option<&str>) -> Result<Vec<RadioSystem>> {
        let db = lock_db(&self.db)?;
        let mut stmt = match short_name {
            Some(name) => {
                let mut stmt = db.prepare(
                    "SELECT system_id, short_name, name FROM radio_systems WHERE short_name = ?",
                )?;
                stmt.bind((1, name))?;
                stmt
            }
            None => db.prepare(
                "SELECT system_id, short_name, name FROM radio_systems ORDER BY system_id",
            )?,
        };
        let mut systems = Vec::new();
        while let State::Row = stmt.next()? {
            systems.push(RadioSystem {
                system_id: stmt.read::<i64, _>(0)?,
                short_name: stmt.read::<String, _>(1)?,
                name: stmt.read::<String, _>(2)?,
            });
        }
        Ok(systems)
    }
}

impl Catalog for SqliteCatalog {
    fn systems(&self) -> Result<Vec<RadioSystem>> {
        self.query_systems(None)
    }

    fn system(&self, short_name: &str) -> Result<Option<RadioSystem>> {
        Ok(self.query_systems(Some(short_name))?.into_iter().next())
    }

    fn triggers(&self, system_id: i64) -> Result<Vec<AlertTrigger>> {
        let db = lock_db(&self.db)?;
        let mut stmt = db.prepare(
            "SELECT trigger_id, trigger_name, enabled,
                    two_tone_a, two_tone_a_length, two_tone_b, two_tone_b_length,
                    long_tone, long_tone_length,
                    hi_low_tone_a, hi_low_tone_b, hi_low_alternations,
                    alert_filter_id, tone_tolerance, ignore_time,
                    enable_facebook, enable_telegram
             FROM alert_triggers WHERE system_id = ? ORDER BY trigger_id",
        )?;
        stmt.bind((1, system_id))?;

        let mut triggers = Vec::new();
        while let State::Row = stmt.next()? {
            let row = TriggerRow {
                trigger_id: stmt.read::<i64, _>(0)?,
                trigger_name: stmt.read::<String, _>(1)?,
                enabled: stmt.read::<i64, _>(2)? != 0,
                two_tone_a: stmt.read::<Option<f64>, _>(3)?,
                two_tone_a_length: stmt.read::<Option<f64>, _>(4)?,
                two_tone_b: stmt.read::<Option<f64>, _>(5)?,
                two_tone_b_length: stmt.read::<Option<f64>, _>(6)?,
                long_tone: stmt.read::<Option<f64>, _>(7)?,
                long_tone_length: stmt.read::<Option<f64>, _>(8)?,
                hi_low_tone_a: stmt.read::<Option<f64>, _>(9)?,
                hi_low_tone_b: stmt.read::<Option<f64>, _>(10)?,
                hi_low_alternations: stmt
                    .read::<Option<i64>, _>(11)?
                    .map(|n| n.max(0) as u32),
                alert_filter_id: stmt.read::<Option<i64>, _>(12)?,
                tone_tolerance: stmt.read::<Option<f64>, _>(13)?,
                ignore_time: stmt.read::<Option<i64>, _>(14)?.map(|n| n.max(0) as u64),
                enable_facebook: stmt.read::<i64, _>(15)? != 0,
                enable_telegram: stmt.read::<i64, _>(16)? != 0,
            };
            triggers.push(AlertTrigger::from(row));
        }
        Ok(triggers)
    }

    fn filter(&self, filter_id: i64) -> Result<Option<AlertFilter>> {
        let db = lock_db(&self.db)?;
        let mut stmt =
            db.prepare("SELECT name, enabled FROM alert_filters WHERE alert_filter_id = ?")?;
        stmt.bind((1, filter_id))?;
        let (name, enabled) = match stmt.next()? {
            State::Row => (stmt.read::<String, _>(0)?, stmt.read::<i64, _>(1)? != 0),
            State::Done => return Ok(None),
        };

        let mut stmt = db.prepare(
            "SELECT keyword, is_excluded, enabled FROM filter_keywords
             WHERE alert_filter_id = ? ORDER BY keyword_id",
        )?;
        stmt.bind((1, filter_id))?;
        let mut keywords = Vec::new();
        while let State::Row = stmt.next()? {
            keywords.push(Keyword {
                keyword: stmt.read::<String, _>(0)?,
                is_excluded: stmt.read::<i64, _>(1)? != 0,
                enabled: stmt.read::<i64, _>(2)? != 0,
            });
        }

        Ok(Some(AlertFilter {
            alert_filter_id: filter_id,
            name,
            enabled,
            keywords,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_document() -> CatalogDocument {
        serde_json::from_str(
            r#"{
                "systems": [{
                    "system_id": 1,
                    "short_name": "county",
                    "name": "County Fire",
                    "triggers": [
                        {"trigger_id": 20, "trigger_name": "Station 2", "enabled": true,
                         "long_tone": 1000.0, "alert_filter_id": 5},
                        {"trigger_id": 10, "trigger_name": "Station 1", "enabled": true,
                         "two_tone_a": 700.0, "two_tone_a_length": 1.0,
                         "two_tone_b": 1200.0, "two_tone_b_length": 3.0,
                         "tone_tolerance": 2.0, "ignore_time": 120,
                         "enable_telegram": true}
                    ]
                }],
                "filters": [{
                    "alert_filter_id": 5,
                    "name": "fires",
                    "keywords": [
                        {"keyword": "structure fire"},
                        {"keyword": "false alarm", "is_excluded": true}
                    ]
                }]
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn row_defaults_fill_in() {
        let trigger = AlertTrigger::from(TriggerRow {
            trigger_id: 1,
            enabled: true,
            two_tone_a: Some(700.0),
            two_tone_b: Some(1200.0),
            hi_low_tone_a: Some(1500.0),
            hi_low_tone_b: Some(700.0),
            ..Default::default()
        });
        assert_eq!(trigger.tone_tolerance, DEFAULT_TONE_TOLERANCE_PCT);
        assert_eq!(trigger.ignore_time, DEFAULT_IGNORE_SECS);
        assert_eq!(
            trigger.conditions,
            vec![
                Condition::TwoTone(TwoToneTarget {
                    freq_a: 700.0,
                    min_len_a: 0.8,
                    freq_b: 1200.0,
                    min_len_b: 2.3,
                }),
                Condition::HiLow(HiLowTarget {
                    freq_hi: 1500.0,
                    freq_low: 700.0,
                    min_alternations: 4,
                }),
            ]
        );
    }

    #[test]
    fn half_configured_two_tone_is_not_a_condition() {
        let trigger = AlertTrigger::from(TriggerRow {
            trigger_id: 1,
            two_tone_a: Some(700.0),
            hi_low_tone_b: Some(700.0),
            ..Default::default()
        });
        assert!(trigger.is_inert());
    }

    #[test]
    fn memory_catalog_orders_triggers() {
        let catalog = MemoryCatalog::from_document(sample_document());
        let sys = catalog.system("county").unwrap().unwrap();
        let ids: Vec<i64> = catalog
            .triggers(sys.system_id)
            .unwrap()
            .iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(ids, vec![10, 20]);
        assert!(catalog.system("nope").unwrap().is_none());
        assert!(catalog.triggers(99).unwrap().is_empty());
        assert_eq!(catalog.filter(5).unwrap().unwrap().keywords.len(), 2);
    }

    #[test]
    fn sqlite_catalog_import_round_trip() {
        let catalog = SqliteCatalog::open(":memory:").unwrap();
        let (systems, triggers, filters) = catalog.import(&sample_document()).unwrap();
        assert_eq!((systems, triggers, filters), (1, 2, 1));

        let sys = catalog.system("county").unwrap().unwrap();
        assert_eq!(sys.name, "County Fire");

        let loaded = catalog.triggers(sys.system_id).unwrap();
        let memory = MemoryCatalog::from_document(sample_document())
            .triggers(1)
            .unwrap();
        assert_eq!(loaded, memory);

        let filter = catalog.filter(5).unwrap().unwrap();
        assert!(filter.enabled);
        assert_eq!(filter.keywords[1].keyword, "false alarm");
        assert!(filter.keywords[1].is_excluded);
        assert!(catalog.filter(6).unwrap().is_none());
    }

    #[test]
    fn sqlite_filter_upsert_replaces_keywords() {
        let catalog = SqliteCatalog::open(":memory:").unwrap();
        let mut filter = sample_document().filters.remove(0);
        catalog.upsert_filter(&filter).unwrap();
        filter.keywords.truncate(1);
        filter.enabled = false;
        catalog.upsert_filter(&filter).unwrap();

        let loaded = catalog.filter(5).unwrap().unwrap();
        assert!(!loaded.enabled);
        assert_eq!(loaded.keywords.len(), 1);
    }
}
