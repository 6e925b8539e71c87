//! Per-window debounced refocus of surviving tabs.
//!
//! A burst of closures in one window produces at most one focus action,
//! fired a quiet period after the *last* request (trailing edge). Each
//! request replaces the window's pending payload and restarts its timer.
//!
//! Timer tasks carry a generation number. A task that wakes up after
//! being superseded finds a newer generation in the table and exits
//! without acting, even if its abort raced with the wake-up.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::browser::{self, Browser, BrowserError, TabId, WindowId};

use super::tiebreak::KeepInfo;

#[derive(Debug)]
struct Pending {
    keep: KeepInfo,
    generation: u64,
    task: JoinHandle<()>,
}

#[derive(Debug, Default)]
struct Timers {
    windows: HashMap<WindowId, Pending>,
    next_generation: u64,
}

/// Coalescing refocus scheduler. Cheap to clone; clones share timers.
#[derive(Clone)]
pub struct RefocusScheduler {
    browser: Arc<dyn Browser>,
    timers: Arc<Mutex<Timers>>,
    quiet: Duration,
}

impl RefocusScheduler {
    pub fn new(browser: Arc<dyn Browser>, quiet: Duration) -> Self {
        Self {
            browser,
            timers: Arc::new(Mutex::new(Timers::default())),
            quiet,
        }
    }

    /// Ask for `keep` to be brought forward once its window goes quiet.
    ///
    /// A coalesced request keeps the active flag of the one it replaces:
    /// once an active tab was closed in this burst, the final keeper must
    /// end up active.
    ///
    /// Must be called from within a tokio runtime.
    pub fn request(&self, mut keep: KeepInfo) {
        let window = keep.window_id;
        let mut timers = self.timers.lock();
        if let Some(previous) = timers.windows.get(&window) {
            keep.active |= previous.keep.active;
        }
        timers.next_generation += 1;
        let generation = timers.next_generation;

        let task = tokio::spawn(fire_after(
            Arc::clone(&self.browser),
            Arc::clone(&self.timers),
            window,
            generation,
            self.quiet,
        ));

        if let Some(previous) = timers.windows.insert(
            window,
            Pending {
                keep,
                generation,
                task,
            },
        ) {
            previous.task.abort();
            tracing::debug!(
                ?window,
                replaced = ?previous.keep.tab_id,
                keeper = ?keep.tab_id,
                "refocus coalesced"
            );
        }
    }

    /// Cancel the pending refocus for `window`.
    ///
    /// Idempotent: returns `false` when nothing was pending.
    pub fn cancel_window(&self, window: WindowId) -> bool {
        match self.timers.lock().windows.remove(&window) {
            Some(pending) => {
                pending.task.abort();
                tracing::debug!(?window, "refocus cancelled");
                true
            }
            None => false,
        }
    }

    /// Cancel every pending refocus. Returns how many were pending.
    pub fn cancel_all(&self) -> usize {
        let mut timers = self.timers.lock();
        let count = timers.windows.len();
        for (_, pending) in timers.windows.drain() {
            pending.task.abort();
        }
        if count > 0 {
            tracing::debug!(count, "all refocus timers cancelled");
        }
        count
    }

    /// The keeper waiting to be focused in `window`, if any.
    pub fn pending(&self, window: WindowId) -> Option<TabId> {
        self.timers
            .lock()
            .windows
            .get(&window)
            .map(|pending| pending.keep.tab_id)
    }
}

async fn fire_after(
    browser: Arc<dyn Browser>,
    timers: Arc<Mutex<Timers>>,
    window: WindowId,
    generation: u64,
    quiet: Duration,
) {
    tokio::time::sleep(quiet).await;

    let keep = {
        let mut timers = timers.lock();
        match timers.windows.get(&window) {
            Some(pending) if pending.generation == generation => {}
            _ => return,
        }
        match timers.windows.remove(&window) {
            Some(pending) => pending.keep,
            None => return,
        }
    };

    // The keeper may have been closed by an unrelated event meanwhile.
    let tab = match browser.get_tab(keep.tab_id).await {
        Ok(tab) => tab,
        Err(BrowserError::NotFound(_)) => {
            tracing::debug!(keeper = ?keep.tab_id, "keeper gone, refocus dropped");
            return;
        }
        Err(e) => {
            tracing::debug!(keeper = ?keep.tab_id, error = %e, "keeper lookup failed, refocus dropped");
            return;
        }
    };

    if !keep.active {
        return;
    }
    tracing::debug!(keeper = ?tab.id, window = ?tab.window_id, index = keep.index, "refocusing keeper");
    browser::focus_tab(&*browser, tab.id, tab.window_id).await;
}
