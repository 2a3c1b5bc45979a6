//! In-memory schedule cache and the sync that rebuilds it from the store.
//!
//! A [`CacheSnapshot`] is built wholesale on every sync and swapped in as a
//! unit; between syncs only the scheduler loop mutates it, and readers get
//! immutable copies.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::warn;

use crate::{
    error::{Result, SchedulerError},
    schedule::Schedule,
    store::ScheduleStore,
    types::{ScheduleDefinition, ScheduleKind},
};

/// A definition plus its computed due time.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleEntry {
    pub definition: ScheduleDefinition,
    pub schedule: Schedule,
    pub next_due_at: DateTime<Utc>,
    /// Set after a failed hand-off. The entry stays due and is retried on
    /// every wake, but never wakes the loop on its own before this instant.
    pub retry_after: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
}

impl ScheduleEntry {
    /// Compile `definition` and compute its first due time from the persisted
    /// `last_run_at`, falling back to `reference` for a never-run schedule.
    pub fn new(definition: ScheduleDefinition, reference: DateTime<Utc>) -> Result<Self> {
        let schedule = Schedule::from_definition(&definition)?;
        let next_due_at = schedule
            .next_due(definition.last_run_at, reference)
            .ok_or_else(|| SchedulerError::invalid(&definition.name, "no future due time"))?;
        Ok(Self {
            definition,
            schedule,
            next_due_at,
            retry_after: None,
            consecutive_failures: 0,
        })
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_due_at <= now
    }

    /// The instant at which the loop needs to look at this entry again.
    pub fn wake_at(&self) -> DateTime<Utc> {
        match self.retry_after {
            Some(r) if r > self.next_due_at => r,
            _ => self.next_due_at,
        }
    }

    /// Apply a confirmed hand-off at `run_at`.
    pub(crate) fn mark_dispatched(&mut self, run_at: DateTime<Utc>) {
        self.definition.last_run_at = Some(run_at);
        self.definition.total_run_count = self.definition.total_run_count.saturating_add(1);
        self.retry_after = None;
        self.consecutive_failures = 0;
        self.next_due_at = self
            .schedule
            .next_due(Some(run_at), run_at)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
    }

    /// Leave the entry due; on its own it wakes the loop again after `delay`.
    pub(crate) fn mark_failed(&mut self, now: DateTime<Utc>, delay: Duration) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.retry_after = Some(now + delay);
    }

    pub fn summary(&self) -> EntrySummary {
        EntrySummary {
            name: self.definition.name.clone(),
            task: self.definition.task.clone(),
            kind: self.definition.kind,
            rule: self.definition.rule(),
            next_due_at: self.next_due_at,
            last_run_at: self.definition.last_run_at,
            total_run_count: self.definition.total_run_count,
            consecutive_failures: self.consecutive_failures,
        }
    }
}

/// Serializable view of one entry, for logs and introspection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntrySummary {
    pub name: String,
    pub task: String,
    pub kind: ScheduleKind,
    pub rule: String,
    pub next_due_at: DateTime<Utc>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub total_run_count: u64,
    pub consecutive_failures: u32,
}

/// All enabled entries keyed by name. Iteration is always in name order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheSnapshot {
    entries: BTreeMap<String, ScheduleEntry>,
    synced_at: Option<DateTime<Utc>>,
}

impl CacheSnapshot {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn synced_at(&self) -> Option<DateTime<Utc>> {
        self.synced_at
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&ScheduleEntry> {
        self.entries.get(name)
    }

    pub(crate) fn get_mut(&mut self, name: &str) -> Option<&mut ScheduleEntry> {
        self.entries.get_mut(name)
    }

    pub fn entries(&self) -> impl Iterator<Item = &ScheduleEntry> {
        self.entries.values()
    }

    /// Entries due at `now`, sorted by name.
    pub fn due(&self, now: DateTime<Utc>) -> Vec<&ScheduleEntry> {
        self.entries.values().filter(|e| e.is_due(now)).collect()
    }

    /// Earliest instant any entry needs attention, `None` when empty.
    pub fn next_wake(&self) -> Option<DateTime<Utc>> {
        self.entries.values().map(ScheduleEntry::wake_at).min()
    }

    pub fn summaries(&self) -> Vec<EntrySummary> {
        self.entries.values().map(ScheduleEntry::summary).collect()
    }
}

/// A definition dropped from the cache and why.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedDefinition {
    pub name: String,
    pub reason: String,
}

/// Result of one sync.
#[derive(Debug, Clone)]
pub struct SyncOutcome {
    pub snapshot: CacheSnapshot,
    pub skipped: Vec<SkippedDefinition>,
}

/// Rebuild the cache from the store's enabled definitions.
///
/// Read-only against the store. A failed read is returned as an error so the
/// caller can keep its previous snapshot.
pub async fn sync(
    store: &dyn ScheduleStore,
    previous: Option<&CacheSnapshot>,
    reference: DateTime<Utc>,
) -> Result<SyncOutcome> {
    let definitions = store.list_enabled_schedules().await?;
    Ok(build_snapshot(definitions, previous, reference))
}

/// Build a fresh snapshot from `definitions`, carrying over in-memory state
/// from `previous` where the store has not caught up with it yet.
///
/// Malformed definitions are logged and skipped individually.
pub fn build_snapshot(
    definitions: Vec<ScheduleDefinition>,
    previous: Option<&CacheSnapshot>,
    reference: DateTime<Utc>,
) -> SyncOutcome {
    let mut entries = BTreeMap::new();
    let mut skipped = Vec::new();

    for def in definitions.into_iter().filter(|d| d.enabled) {
        let name = def.name.clone();
        let prior = previous.and_then(|p| p.get(&name));
        match merge_entry(def, prior, reference) {
            Ok(entry) => {
                entries.insert(name, entry);
            }
            Err(e) => {
                warn!(schedule = %name, error = %e, "skipping malformed schedule");
                skipped.push(SkippedDefinition {
                    name,
                    reason: e.to_string(),
                });
            }
        }
    }

    SyncOutcome {
        snapshot: CacheSnapshot {
            entries,
            synced_at: Some(reference),
        },
        skipped,
    }
}

/// Bookkeeping written back asynchronously may not have landed when the
/// store is read. While the in-memory `last_run_at` is at least as new as
/// the persisted one it wins, and for an unchanged definition the previous
/// due time and retry state are kept as-is.
fn merge_entry(
    mut def: ScheduleDefinition,
    prior: Option<&ScheduleEntry>,
    reference: DateTime<Utc>,
) -> Result<ScheduleEntry> {
    if let Some(prior) = prior {
        if prior.definition.last_run_at >= def.last_run_at {
            def.last_run_at = prior.definition.last_run_at;
            def.total_run_count = def.total_run_count.max(prior.definition.total_run_count);

            if prior.definition.same_schedule(&def) {
                return Ok(ScheduleEntry {
                    definition: def,
                    schedule: prior.schedule.clone(),
                    next_due_at: prior.next_due_at,
                    retry_after: prior.retry_after,
                    consecutive_failures: prior.consecutive_failures,
                });
            }
        }
    }
    ScheduleEntry::new(def, reference)
}
