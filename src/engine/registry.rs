//! Tab registry: per-tab lifecycle records and the ignored flag.
//!
//! All methods are pure state transitions with no I/O. The engine
//! shares one registry between its event loop and in-flight closures
//! through [`SharedRegistry`]; callers lock, read or write, and drop the
//! guard before any await point.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::browser::TabId;

/// Registry handle shared by the engine, the closer and the startup pass.
pub type SharedRegistry = Arc<Mutex<TabRegistry>>;

/// Lifecycle record for one tab.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TabRecord {
    /// Last settled URL. `None` until the first load completes and
    /// again after a navigation starts.
    pub url: Option<String>,
    /// When the URL last finished loading. Primary tie-break signal.
    pub last_settled: Option<Instant>,
    /// Set while a closure of this tab is in flight.
    pub ignored: bool,
    /// Bumped on every write. Only garbage collection reads it.
    pub last_touched: Instant,
}

impl TabRecord {
    fn fresh(now: Instant) -> Self {
        Self {
            url: None,
            last_settled: None,
            ignored: false,
            last_touched: now,
        }
    }
}

/// Tab registry: the single writer of [`TabRecord`]s.
///
/// Writes to a record whose `ignored` flag is set are refused with
/// `Err("tab_ignored")`: the record belongs to the in-flight closure
/// until the closure clears the flag or the tab's removal deletes it.
#[derive(Debug, Default)]
pub struct TabRegistry {
    tabs: HashMap<TabId, TabRecord>,
}

impl TabRegistry {
    pub fn new() -> Self {
        Self {
            tabs: HashMap::new(),
        }
    }

    pub fn shared() -> SharedRegistry {
        Arc::new(Mutex::new(Self::new()))
    }

    /// Track a newly observed tab, or forget the URL of a known one.
    pub fn register(&mut self, id: TabId) -> Result<(), &'static str> {
        let now = Instant::now();
        match self.tabs.get_mut(&id) {
            Some(record) if record.ignored => Err("tab_ignored"),
            Some(record) => {
                record.url = None;
                record.last_settled = None;
                record.last_touched = now;
                Ok(())
            }
            None => {
                self.tabs.insert(id, TabRecord::fresh(now));
                Ok(())
            }
        }
    }

    /// Track a tab discovered already loaded (startup enumeration).
    ///
    /// A known tab that already settled on `url` keeps its settle time.
    pub fn register_settled(&mut self, id: TabId, url: &str) -> Result<(), &'static str> {
        let now = Instant::now();
        let record = self.tabs.entry(id).or_insert_with(|| TabRecord::fresh(now));
        if record.ignored {
            return Err("tab_ignored");
        }
        record.last_touched = now;
        if record.url.as_deref() != Some(url) || record.last_settled.is_none() {
            record.url = Some(url.to_string());
            record.last_settled = Some(now);
        }
        Ok(())
    }

    /// Record that `id` finished loading `url`.
    pub fn mark_settled(&mut self, id: TabId, url: &str) -> Result<(), &'static str> {
        let now = Instant::now();
        let record = self.tabs.entry(id).or_insert_with(|| TabRecord::fresh(now));
        if record.ignored {
            return Err("tab_ignored");
        }
        record.url = Some(url.to_string());
        record.last_settled = Some(now);
        record.last_touched = now;
        Ok(())
    }

    /// A new navigation started: the tab's URL is unresolved again.
    pub fn reset(&mut self, id: TabId) -> Result<(), &'static str> {
        self.register(id)
    }

    /// Set or clear the ignored flag.
    ///
    /// Setting it on an unknown tab creates the record, so a closure can
    /// always protect its target. Clearing it on an unknown tab is a
    /// no-op. Returns whether the record existed beforehand.
    pub fn set_ignored(&mut self, id: TabId, ignored: bool) -> bool {
        let now = Instant::now();
        match self.tabs.get_mut(&id) {
            Some(record) => {
                record.ignored = ignored;
                record.last_touched = now;
                true
            }
            None => {
                if ignored {
                    let mut record = TabRecord::fresh(now);
                    record.ignored = true;
                    self.tabs.insert(id, record);
                }
                false
            }
        }
    }

    /// Whether `id` must stay out of duplicate detection.
    ///
    /// Unknown tabs count as ignored.
    pub fn is_ignored(&self, id: TabId) -> bool {
        self.tabs.get(&id).is_none_or(|record| record.ignored)
    }

    pub fn last_settled(&self, id: TabId) -> Option<Instant> {
        self.tabs.get(&id).and_then(|record| record.last_settled)
    }

    /// Whether `url` differs from the last settled URL of `id`.
    ///
    /// Unknown tabs and tabs that never settled report a change.
    pub fn has_changed_url(&self, id: TabId, url: &str) -> bool {
        self.tabs
            .get(&id)
            .is_none_or(|record| record.url.as_deref() != Some(url))
    }

    /// Bump `last_touched` without changing anything else.
    pub fn touch(&mut self, id: TabId) {
        if let Some(record) = self.tabs.get_mut(&id) {
            record.last_touched = Instant::now();
        }
    }

    /// Delete a record. Idempotent; returns whether it existed.
    pub fn remove(&mut self, id: TabId) -> bool {
        self.tabs.remove(&id).is_some()
    }

    pub fn exists(&self, id: TabId) -> bool {
        self.tabs.contains_key(&id)
    }

    pub fn get(&self, id: TabId) -> Option<&TabRecord> {
        self.tabs.get(&id)
    }

    pub fn len(&self) -> usize {
        self.tabs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tabs.is_empty()
    }

    /// Drop records for tabs missing from an inventory snapshot.
    ///
    /// `live` is the snapshot, requested at `snapshot_at`. A missing
    /// record last touched at or before `snapshot_at` is deleted. A
    /// missing record touched later may simply be newer than the
    /// snapshot, so it survives until idle for longer than `retention`.
    /// Records present in the snapshot are never deleted.
    ///
    /// Returns the number of records deleted.
    pub fn collect_garbage(
        &mut self,
        live: &HashSet<TabId>,
        snapshot_at: Instant,
        retention: Duration,
    ) -> usize {
        let now = Instant::now();
        let before = self.tabs.len();
        self.tabs.retain(|id, record| {
            live.contains(id)
                || (record.last_touched > snapshot_at
                    && now.saturating_duration_since(record.last_touched) <= retention)
        });
        before - self.tabs.len()
    }
}
