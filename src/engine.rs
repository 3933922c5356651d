//! Condition evaluation: decides which of a system's triggers fire for a
//! call, records the fire in the active-alert cache and builds the alert
//! records handed to the notifier.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::cache::{ActiveAlertEntry, AlertCache};
use crate::call::CallEvent;
use crate::catalog::{AlertTrigger, Catalog, Condition, RadioSystem};
use crate::filter::{KeywordMatch, match_keywords};
use crate::tones::{ToneMatch, match_hi_low, match_long_tone, match_two_tone};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    TwoTone,
    LongTone,
    HiLow,
    AlertFilter,
}

/// Required/met bookkeeping for one category of one trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CategoryOutcome {
    pub category: Category,
    pub required: bool,
    pub met: bool,
}

impl CategoryOutcome {
    fn required(category: Category, met: bool) -> Self {
        Self {
            category,
            required: true,
            met,
        }
    }

    fn not_required(category: Category) -> Self {
        Self {
            category,
            required: false,
            met: false,
        }
    }
}

/// AND over the required categories only. Nothing required never fires.
pub fn all_required_met(outcomes: &[CategoryOutcome]) -> bool {
    let mut required = outcomes.iter().filter(|o| o.required).peekable();
    required.peek().is_some() && required.all(|o| o.met)
}

/// One fired trigger, with everything that matched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRecord {
    pub trigger_id: i64,
    pub trigger_name: String,
    /// Epoch seconds of the evaluation that fired.
    pub timestamp: f64,
    pub facebook_enabled: bool,
    pub telegram_enabled: bool,
    pub two_tone: Vec<ToneMatch>,
    pub long_tone: Vec<ToneMatch>,
    pub hi_low_tone: Vec<ToneMatch>,
    pub alert_filter: Vec<KeywordMatch>,
}

impl AlertRecord {
    fn empty(trigger: &AlertTrigger, now: f64) -> Self {
        Self {
            trigger_id: trigger.id,
            trigger_name: trigger.name.clone(),
            timestamp: now,
            facebook_enabled: trigger.facebook_enabled,
            telegram_enabled: trigger.telegram_enabled,
            two_tone: Vec::new(),
            long_tone: Vec::new(),
            hi_low_tone: Vec::new(),
            alert_filter: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    /// No category required; the trigger can never fire.
    Inert,
    Unmet(Vec<CategoryOutcome>),
    Fired(AlertRecord),
}

pub struct Evaluator {
    catalog: Arc<dyn Catalog>,
    cache: Arc<dyn AlertCache>,
}

impl Evaluator {
    pub fn new(catalog: Arc<dyn Catalog>, cache: Arc<dyn AlertCache>) -> Self {
        Self { catalog, cache }
    }

    pub fn catalog(&self) -> &Arc<dyn Catalog> {
        &self.catalog
    }

    /// Evaluate every enabled, non-suppressed trigger of `system` against
    /// `call`. Returns the fired records in trigger order.
    ///
    /// Never fails as a whole: catalog and cache problems are logged and
    /// degrade to "no triggers" and "no suppression" respectively.
    pub fn evaluate(&self, system: &RadioSystem, call: &CallEvent, now: f64) -> Vec<AlertRecord> {
        let mut fired = Vec::new();

        let triggers = match self.catalog.triggers(system.system_id) {
            Ok(t) => t,
            Err(e) => {
                warn!("Failed to load triggers for {}: {e:#}", system.short_name);
                return fired;
            }
        };
        if triggers.is_empty() {
            warn!("No alert triggers for {}. Skipping tone check", system.short_name);
            return fired;
        }

        let mut suppressed = self.suppressed_ids(&system.short_name, now);

        for trigger in &triggers {
            if !trigger.enabled {
                continue;
            }
            if suppressed.contains(&trigger.id) {
                debug!("Ignoring {} (id={}), still inside ignore window", trigger.name, trigger.id);
                continue;
            }

            let record = match self.evaluate_trigger(trigger, call, now) {
                Verdict::Fired(record) => record,
                Verdict::Inert => {
                    debug!("Skipping {} (id={}): no conditions configured", trigger.name, trigger.id);
                    continue;
                }
                Verdict::Unmet(outcomes) => {
                    debug!("{} (id={}) not triggered: {outcomes:?}", trigger.name, trigger.id);
                    continue;
                }
            };

            info!("Alert triggered for {} (id={}) on {}", trigger.name, trigger.id, system.short_name);

            let entry = ActiveAlertEntry {
                trigger_id: trigger.id,
                last_detected: now,
                ignore_seconds: trigger.ignore_time,
            };
            if let Err(e) = self.cache.append(&system.short_name, entry) {
                warn!(
                    "Failed to record active alert for {} on {}; it may re-fire early: {e:#}",
                    trigger.name, system.short_name
                );
            }
            suppressed.insert(trigger.id);
            fired.push(record);
        }

        fired
    }

    /// Trigger ids whose ignore window is still open. A failed read counts
    /// as "nothing suppressed".
    fn suppressed_ids(&self, short_name: &str, now: f64) -> HashSet<i64> {
        match self.cache.read(short_name) {
            Ok(entries) => entries
                .into_iter()
                .filter(|e| !e.is_expired(now))
                .map(|e| e.trigger_id)
                .collect(),
            Err(e) => {
                warn!("Active alert cache read failed for {short_name}, dedup disabled for this call: {e:#}");
                HashSet::new()
            }
        }
    }

    /// Run every configured matcher for one trigger and combine the results.
    pub fn evaluate_trigger(&self, trigger: &AlertTrigger, call: &CallEvent, now: f64) -> Verdict {
        if trigger.is_inert() {
            return Verdict::Inert;
        }

        let tolerance = trigger.tone_tolerance;
        let mut record = AlertRecord::empty(trigger, now);
        let mut outcomes = Vec::with_capacity(trigger.conditions.len());

        for condition in &trigger.conditions {
            let outcome = match condition {
                Condition::TwoTone(target) => {
                    let matches = match_two_tone(target, tolerance, &call.tones.two_tone);
                    let met = !matches.is_empty();
                    record.two_tone.extend(matches);
                    CategoryOutcome::required(Category::TwoTone, met)
                }
                Condition::LongTone(target) => {
                    let matches = match_long_tone(target, tolerance, &call.tones.long_tone);
                    let met = !matches.is_empty();
                    record.long_tone.extend(matches);
                    CategoryOutcome::required(Category::LongTone, met)
                }
                Condition::HiLow(target) => {
                    let matches = match_hi_low(target, tolerance, &call.tones.hl_tone);
                    let met = !matches.is_empty();
                    record.hi_low_tone.extend(matches);
                    CategoryOutcome::required(Category::HiLow, met)
                }
                Condition::KeywordFilter(filter_id) => {
                    match self.catalog.filter(*filter_id) {
                        Ok(Some(filter)) if filter.enabled => {
                            let matches = match_keywords(&filter.keywords, call.transcript_text());
                            let met = !matches.is_empty();
                            record.alert_filter.extend(matches);
                            CategoryOutcome::required(Category::AlertFilter, met)
                        }
                        Ok(Some(_)) => CategoryOutcome::not_required(Category::AlertFilter),
                        // An unresolvable filter blocks the trigger.
                        Ok(None) => {
                            warn!(
                                "{} (id={}) references missing alert filter {filter_id}",
                                trigger.name, trigger.id
                            );
                            CategoryOutcome::required(Category::AlertFilter, false)
                        }
                        Err(e) => {
                            warn!(
                                "Alert filter {filter_id} lookup failed for {} (id={}): {e:#}",
                                trigger.name, trigger.id
                            );
                            CategoryOutcome::required(Category::AlertFilter, false)
                        }
                    }
                }
            };
            outcomes.push(outcome);
        }

        if !outcomes.iter().any(|o| o.required) {
            return Verdict::Inert;
        }
        if all_required_met(&outcomes) {
            Verdict::Fired(record)
        } else {
            Verdict::Unmet(outcomes)
        }
    }
}
