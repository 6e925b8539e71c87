//! Reconciliation engine: tab registry, duplicate search, closure and
//! refocus.
//!
//! Architecture: the daemon feeds browser events to [`Engine::handle_event`]
//! strictly in arrival order. Each event is fully routed (registry update
//! plus duplicate search) before the next one is handled. Closures run as
//! background tasks so their retry loops and refocus timers overlap with
//! later events; the ignored flag, set synchronously before a closure is
//! spawned, keeps those tabs out of every later search.

pub mod closer;
pub mod refocus;
pub mod registry;
pub mod startup;
pub mod tiebreak;

#[cfg(test)]
pub(crate) mod testing;

use std::collections::HashSet;
use std::sync::Arc;

use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;

use crate::browser::{self, Browser, BrowserError, BrowserEvent, Tab, TabId, TabQuery, TabStatus, WindowId};
use crate::config::EngineConfig;
use crate::matching::{self, UrlClass};

use closer::{CloseError, Closer, RetryPolicy};
use refocus::RefocusScheduler;
use registry::{SharedRegistry, TabRegistry};
use startup::{StartupPolicy, StartupReport};
use tiebreak::Candidate;

/// Outcome of one duplicate search.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SearchOutcome {
    /// Duplicates found and handed to the closer.
    pub closures: usize,
    /// The observed tab itself lost and is being closed.
    pub observed_lost: bool,
}

pub struct Engine {
    browser: Arc<dyn Browser>,
    registry: SharedRegistry,
    closer: Closer,
    refocus: RefocusScheduler,
    config: EngineConfig,
    closures: JoinSet<Result<u32, CloseError>>,
    startup: Option<JoinHandle<StartupReport>>,
}

impl Engine {
    /// Must be called from within a tokio runtime.
    pub fn new(browser: Arc<dyn Browser>, config: EngineConfig) -> Self {
        let registry = TabRegistry::shared();
        let refocus = RefocusScheduler::new(Arc::clone(&browser), config.refocus_quiet);
        let closer = Closer::new(
            Arc::clone(&browser),
            registry.clone(),
            refocus.clone(),
            RetryPolicy {
                attempts: config.retry_attempts,
                delay: config.retry_delay,
            },
        );
        Self {
            browser,
            registry,
            closer,
            refocus,
            config,
            closures: JoinSet::new(),
            startup: None,
        }
    }

    pub fn registry(&self) -> &SharedRegistry {
        &self.registry
    }

    pub fn refocus(&self) -> &RefocusScheduler {
        &self.refocus
    }

    /// Route one browser event.
    pub async fn handle_event(&mut self, event: BrowserEvent) {
        self.reap_closures();

        match event {
            BrowserEvent::Created { tab } => {
                if let Err(reason) = self.registry.lock().register(tab.id) {
                    tracing::debug!(tab = ?tab.id, reason, "created tab not registered");
                }
            }
            BrowserEvent::BeforeNavigate {
                tab_id,
                frame_id,
                url,
            } => {
                if frame_id != 0 || self.is_ignored(tab_id) {
                    return;
                }
                if let Err(reason) = self.registry.lock().reset(tab_id) {
                    tracing::debug!(tab = ?tab_id, reason, "navigation reset skipped");
                    return;
                }
                if let Some(tab) = self.fetch_tab(tab_id).await {
                    self.search_duplicates(&tab, Some(&url), true).await;
                }
            }
            BrowserEvent::NavigationCompleted { tab_id, frame_id } => {
                if frame_id != 0 || self.is_ignored(tab_id) {
                    return;
                }
                if let Some(tab) = self.fetch_tab(tab_id).await {
                    self.settle_and_search(&tab).await;
                }
            }
            BrowserEvent::Updated {
                tab_id,
                status,
                url,
                tab,
            } => {
                if self.is_ignored(tab_id) || status != Some(TabStatus::Complete) {
                    return;
                }
                if url.is_some() {
                    let changed = self.registry.lock().has_changed_url(tab_id, &tab.url);
                    if matching::is_blank(&tab.url) || !changed {
                        return;
                    }
                } else if matching::classify(&tab.url) != UrlClass::Internal {
                    return;
                }
                self.settle_and_search(&tab).await;
            }
            BrowserEvent::Attached { tab_id, window_id } => {
                if self.is_ignored(tab_id) {
                    return;
                }
                if let Some(tab) = self.fetch_tab(tab_id).await {
                    tracing::debug!(tab = ?tab_id, window = ?window_id, "tab attached");
                    self.search_duplicates(&tab, None, false).await;
                }
            }
            BrowserEvent::Detached { tab_id, window_id } => {
                tracing::debug!(tab = ?tab_id, window = ?window_id, "tab detached");
                self.registry.lock().touch(tab_id);
            }
            BrowserEvent::Removed {
                tab_id,
                window_id,
                window_closing,
            } => {
                self.registry.lock().remove(tab_id);
                if window_closing {
                    self.refocus.cancel_window(window_id);
                }
            }
            BrowserEvent::Installed { reason } => {
                tracing::info!(reason, "extension installed");
                self.schedule_startup();
            }
            BrowserEvent::Startup => {
                tracing::info!("browser started");
                self.schedule_startup();
            }
        }
    }

    async fn settle_and_search(&mut self, tab: &Tab) {
        if let Err(reason) = self.registry.lock().mark_settled(tab.id, &tab.url) {
            tracing::debug!(tab = ?tab.id, reason, "settle skipped");
            return;
        }
        self.search_duplicates(tab, None, false).await;
    }

    /// Look for tabs in `observed`'s window that share its canonical key,
    /// and close the loser of each pair.
    ///
    /// `in_flight` is the URL of a navigation that has started but not
    /// finished; it stands in for the observed tab's settled URL. With
    /// `require_settled`, only fully loaded candidates are considered.
    pub async fn search_duplicates(
        &mut self,
        observed: &Tab,
        in_flight: Option<&str>,
        require_settled: bool,
    ) -> SearchOutcome {
        let mut outcome = SearchOutcome::default();
        let opts = self.config.matching;
        let url = in_flight.unwrap_or(&observed.url);

        let Some(pattern) = matching::query_pattern(url, &opts) else {
            return outcome;
        };
        let query = TabQuery {
            window_id: Some(observed.window_id),
            url_pattern: Some(pattern),
            status: require_settled.then_some(TabStatus::Complete),
        };
        let candidates = browser::query_or_empty(&*self.browser, &query).await;
        let key = matching::canonical_key(url, &opts);

        // Snapshotted once, on the first real match.
        let mut focused: Option<Option<WindowId>> = None;

        for candidate in candidates {
            if candidate.id == observed.id
                || self.is_ignored(candidate.id)
                || (matching::is_blank(&candidate.url) && !candidate.is_complete())
                || matching::canonical_key(&candidate.url, &opts) != key
            {
                continue;
            }

            let focused_window = match focused {
                Some(window) => window,
                None => {
                    let window = self.focused_window().await;
                    focused = Some(window);
                    window
                }
            };

            // Registry state is re-read after every await. A concurrent
            // pass may have claimed the observed tab itself; it is then
            // already being closed and must not decide anything.
            if self.is_ignored(observed.id) {
                tracing::debug!(observed = ?observed.id, "observed tab claimed meanwhile, search stopped");
                break;
            }
            if self.is_ignored(candidate.id) {
                continue;
            }
            let (observed_settled, candidate_settled) = {
                let registry = self.registry.lock();
                (
                    registry.last_settled(observed.id),
                    registry.last_settled(candidate.id),
                )
            };
            let verdict = tiebreak::resolve(
                &Candidate::from_tab(observed, observed_settled),
                &Candidate::from_tab(&candidate, candidate_settled),
                focused_window,
            );

            tracing::info!(
                observed = ?observed.id,
                candidate = ?candidate.id,
                loser = ?verdict.loser,
                keeper = ?verdict.keep.tab_id,
                window = ?observed.window_id,
                %key,
                "duplicate found"
            );

            self.closer.claim(verdict.loser);
            let closer = self.closer.clone();
            let (loser, keep) = (verdict.loser, verdict.keep);
            self.closures
                .spawn(async move { closer.close_duplicate(loser, keep).await });
            outcome.closures += 1;

            if verdict.loser == observed.id {
                outcome.observed_lost = true;
                break;
            }
        }

        outcome
    }

    /// Sweep registry records for tabs the browser no longer reports.
    ///
    /// A failed inventory query skips the sweep; an empty result from a
    /// failure must not wipe the registry.
    pub async fn collect_garbage(&mut self) -> usize {
        let snapshot_at = Instant::now();
        let tabs = match self.browser.query_tabs(&TabQuery::default()).await {
            Ok(tabs) => tabs,
            Err(e) => {
                tracing::warn!(error = %e, "inventory snapshot failed, skipping gc");
                return 0;
            }
        };
        let live: HashSet<TabId> = tabs.iter().map(|t| t.id).collect();
        let removed =
            self.registry
                .lock()
                .collect_garbage(&live, snapshot_at, self.config.gc_retention);
        if removed > 0 {
            tracing::debug!(removed, "stale tab records collected");
        }
        removed
    }

    /// Cancel pending refocus intent and schedule a startup pass after
    /// the configured delay. A pass already scheduled is replaced.
    fn schedule_startup(&mut self) {
        self.refocus.cancel_all();
        if let Some(previous) = self.startup.take() {
            previous.abort();
        }

        let browser = Arc::clone(&self.browser);
        let registry = self.registry.clone();
        let closer = self.closer.clone();
        let delay = self.config.startup_delay;
        let policy = StartupPolicy {
            matching: self.config.matching,
            concurrent_limit: self.config.concurrent_close_limit,
            sequential_gap: self.config.sequential_gap,
        };
        self.startup = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            startup::reconcile_all(&browser, &registry, &closer, &policy).await
        }));
    }

    /// Wait for the scheduled startup pass, if any.
    pub async fn wait_startup(&mut self) -> Option<StartupReport> {
        let handle = self.startup.take()?;
        handle.await.ok()
    }

    /// Wait for every in-flight closure to finish.
    pub async fn drain_closures(&mut self) {
        while let Some(result) = self.closures.join_next().await {
            log_join(result);
        }
    }

    /// Stop background work: refocus timers, closures, startup pass.
    pub fn shutdown(&mut self) {
        let timers = self.refocus.cancel_all();
        self.closures.abort_all();
        if let Some(startup) = self.startup.take() {
            startup.abort();
        }
        tracing::debug!(timers, "engine stopped");
    }

    fn reap_closures(&mut self) {
        while let Some(result) = self.closures.try_join_next() {
            log_join(result);
        }
    }

    fn is_ignored(&self, id: TabId) -> bool {
        self.registry.lock().is_ignored(id)
    }

    async fn fetch_tab(&self, id: TabId) -> Option<Tab> {
        match self.browser.get_tab(id).await {
            Ok(tab) => Some(tab),
            Err(BrowserError::NotFound(_)) => {
                self.registry.lock().remove(id);
                tracing::debug!(tab = ?id, "tab vanished before lookup");
                None
            }
            Err(e) => {
                tracing::warn!(tab = ?id, error = %e, "tab lookup failed");
                None
            }
        }
    }

    async fn focused_window(&self) -> Option<WindowId> {
        match self.browser.focused_window().await {
            Ok(window) => window,
            Err(e) => {
                tracing::debug!(error = %e, "focused window unknown");
                None
            }
        }
    }
}

fn log_join(result: Result<Result<u32, CloseError>, tokio::task::JoinError>) {
    match result {
        Ok(Ok(_)) | Ok(Err(CloseError::Gone(_))) => {}
        Ok(Err(e)) => tracing::debug!(error = %e, "closure abandoned"),
        Err(e) if e.is_cancelled() => {}
        Err(e) => tracing::warn!(error = %e, "closure task panicked"),
    }
}
