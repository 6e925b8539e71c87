//! Startup reconciliation: one bulk pass over the whole inventory.
//!
//! Every tab is registered, comparable tabs are grouped by window and
//! canonical key, and each group is reduced to its most recently
//! accessed tab. Small groups close their losers concurrently; large
//! groups close them one at a time with a gap, so a burst of removals
//! does not lock the tab strip.

use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;

use crate::browser::{self, Browser, Tab, TabQuery, WindowId};
use crate::matching::{self, MatchOptions};

use super::closer::Closer;
use super::registry::SharedRegistry;

/// How a duplicate group's losers are closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClosePlan {
    /// All removal requests issued at once; failures are independent.
    Concurrent,
    /// One removal at a time, separated by the given gap.
    Sequential(Duration),
}

impl ClosePlan {
    pub fn for_losers(losers: usize, concurrent_limit: usize, gap: Duration) -> Self {
        if losers <= concurrent_limit {
            Self::Concurrent
        } else {
            Self::Sequential(gap)
        }
    }
}

/// Summary of a startup pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StartupReport {
    pub tabs: usize,
    pub groups: usize,
    pub closed: usize,
    pub failed: usize,
}

/// Startup reconciler settings.
#[derive(Debug, Clone, Copy)]
pub struct StartupPolicy {
    pub matching: MatchOptions,
    pub concurrent_limit: usize,
    pub sequential_gap: Duration,
}

/// Run one startup pass.
pub async fn reconcile_all(
    browser: &Arc<dyn Browser>,
    registry: &SharedRegistry,
    closer: &Closer,
    policy: &StartupPolicy,
) -> StartupReport {
    let tabs = browser::query_or_empty(&**browser, &TabQuery::default()).await;
    let mut report = StartupReport {
        tabs: tabs.len(),
        ..StartupReport::default()
    };

    register_all(registry, &tabs);

    for (_, mut group) in group_duplicates(registry, tabs, &policy.matching) {
        report.groups += 1;
        group.sort_by_key(|t| (Reverse(t.last_accessed), t.index, t.id));
        let keeper = group.remove(0);
        let plan = ClosePlan::for_losers(group.len(), policy.concurrent_limit, policy.sequential_gap);
        tracing::debug!(keeper = ?keeper.id, losers = group.len(), ?plan, "closing startup duplicates");

        let mut closed_active = false;
        match plan {
            ClosePlan::Concurrent => {
                let results = join_all(group.iter().map(|t| closer.close(t.id))).await;
                for (loser, result) in group.iter().zip(results) {
                    tally(&mut report, &mut closed_active, loser, result.is_ok());
                }
            }
            ClosePlan::Sequential(gap) => {
                for (i, loser) in group.iter().enumerate() {
                    if i > 0 {
                        tokio::time::sleep(gap).await;
                    }
                    let ok = closer.close(loser.id).await.is_ok();
                    tally(&mut report, &mut closed_active, loser, ok);
                }
            }
        }

        if closed_active {
            browser::focus_tab(&**browser, keeper.id, keeper.window_id).await;
        }
    }

    tracing::info!(
        tabs = report.tabs,
        groups = report.groups,
        closed = report.closed,
        failed = report.failed,
        "startup reconciliation finished"
    );
    report
}

fn tally(report: &mut StartupReport, closed_active: &mut bool, loser: &Tab, ok: bool) {
    if ok {
        report.closed += 1;
        *closed_active |= loser.active;
    } else {
        report.failed += 1;
    }
}

fn register_all(registry: &SharedRegistry, tabs: &[Tab]) {
    let mut registry = registry.lock();
    for tab in tabs {
        let result = if tab.is_complete() && !matching::is_blank(&tab.url) {
            registry.register_settled(tab.id, &tab.url)
        } else if registry.exists(tab.id) {
            Ok(())
        } else {
            registry.register(tab.id)
        };
        if let Err(reason) = result {
            tracing::debug!(tab = ?tab.id, reason, "startup registration skipped");
        }
    }
}

/// Groups of two or more comparable, non-ignored tabs sharing a window
/// and a canonical key. Tabs keep inventory order within a group.
fn group_duplicates(
    registry: &SharedRegistry,
    tabs: Vec<Tab>,
    opts: &MatchOptions,
) -> Vec<((WindowId, String), Vec<Tab>)> {
    let registry = registry.lock();
    let mut order = Vec::new();
    let mut groups: HashMap<(WindowId, String), Vec<Tab>> = HashMap::new();

    for tab in tabs {
        if !matching::classify(&tab.url).is_comparable() || registry.is_ignored(tab.id) {
            continue;
        }
        let key = (tab.window_id, matching::canonical_key(&tab.url, opts));
        let group = groups.entry(key.clone()).or_default();
        if group.is_empty() {
            order.push(key);
        }
        group.push(tab);
    }

    order
        .into_iter()
        .filter_map(|key| {
            let group = groups.remove(&key)?;
            (group.len() > 1).then_some((key, group))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use tokio::time::Instant;

    use super::*;
    use crate::browser::{BrowserError, TabId};
    use crate::engine::closer::RetryPolicy;
    use crate::engine::refocus::RefocusScheduler;
    use crate::engine::registry::TabRegistry;
    use crate::engine::testing::{FakeBrowser, tab};

    const GAP: Duration = Duration::from_millis(50);

    fn policy() -> StartupPolicy {
        StartupPolicy {
            matching: MatchOptions::default(),
            concurrent_limit: 4,
            sequential_gap: GAP,
        }
    }

    fn accessed(mut t: Tab, at: u64) -> Tab {
        t.last_accessed = Some(at);
        t
    }

    async fn run(fake: &Arc<FakeBrowser>) -> (StartupReport, SharedRegistry) {
        let browser: Arc<dyn Browser> = fake.clone();
        let registry = TabRegistry::shared();
        let refocus = RefocusScheduler::new(browser.clone(), Duration::from_millis(250));
        let closer = Closer::new(
            browser.clone(),
            registry.clone(),
            refocus,
            RetryPolicy {
                attempts: 3,
                delay: Duration::from_millis(100),
            },
        );
        let report = reconcile_all(&browser, &registry, &closer, &policy()).await;
        (report, registry)
    }

    /// One group: a keeper accessed last, plus `losers` older copies.
    fn group_of(losers: usize) -> Arc<FakeBrowser> {
        let fake = FakeBrowser::new();
        fake.add_tab(accessed(tab(100, 1, "https://example.com/x"), 10_000));
        for i in 0..losers {
            fake.add_tab(accessed(tab(i as i64 + 1, 1, "https://example.com/x"), i as u64));
        }
        Arc::new(fake)
    }

    #[test]
    fn plan_boundary() {
        assert_eq!(ClosePlan::for_losers(1, 4, GAP), ClosePlan::Concurrent);
        assert_eq!(ClosePlan::for_losers(4, 4, GAP), ClosePlan::Concurrent);
        assert_eq!(ClosePlan::for_losers(5, 4, GAP), ClosePlan::Sequential(GAP));
    }

    #[tokio::test(start_paused = true)]
    async fn four_losers_close_concurrently() {
        let fake = group_of(4);
        let start = Instant::now();
        let (report, _) = run(&fake).await;

        assert_eq!(report.closed, 4);
        assert_eq!(fake.tab_ids(), vec![TabId(100)]);
        assert!(fake.remove_attempts().iter().all(|(_, t)| *t == start));
    }

    #[tokio::test(start_paused = true)]
    async fn five_losers_close_sequentially_with_gap() {
        let fake = group_of(5);
        let start = Instant::now();
        let (report, _) = run(&fake).await;

        assert_eq!(report.closed, 5);
        assert_eq!(fake.tab_ids(), vec![TabId(100)]);
        let times: Vec<_> = fake.remove_attempts().iter().map(|(_, t)| *t).collect();
        assert_eq!(times.len(), 5);
        for (i, t) in times.iter().enumerate() {
            assert_eq!(*t - start, GAP * i as u32);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn keeps_most_recently_accessed() {
        let fake = Arc::new(FakeBrowser::with_tabs([
            accessed(tab(1, 1, "https://example.com/a"), 5),
            accessed(tab(2, 1, "https://www.example.com/a/"), 50),
            accessed(tab(3, 1, "https://example.com/a#top"), 20),
        ]));
        let (report, _) = run(&fake).await;
        assert_eq!(report.groups, 1);
        assert_eq!(fake.tab_ids(), vec![TabId(2)]);
    }

    #[tokio::test(start_paused = true)]
    async fn groups_stay_within_a_window() {
        let fake = Arc::new(FakeBrowser::with_tabs([
            tab(1, 1, "https://example.com/a"),
            tab(2, 2, "https://example.com/a"),
        ]));
        let (report, registry) = run(&fake).await;
        assert_eq!(report.groups, 0);
        assert_eq!(fake.tab_ids().len(), 2);
        assert_eq!(registry.lock().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn non_comparable_tabs_are_registered_but_left_alone() {
        let fake = Arc::new(FakeBrowser::with_tabs([
            tab(1, 1, "about:blank"),
            tab(2, 1, "about:blank"),
            tab(3, 1, "chrome-extension://abc/options.html"),
            tab(4, 1, "chrome-extension://abc/options.html"),
        ]));
        let (report, registry) = run(&fake).await;
        assert_eq!(report.closed, 0);
        assert_eq!(fake.tab_ids().len(), 4);
        assert!(!registry.lock().is_ignored(TabId(1)));
        assert!(registry.lock().last_settled(TabId(1)).is_none());
        assert!(registry.lock().last_settled(TabId(3)).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn refocuses_keeper_when_active_loser_closed() {
        let mut active_loser = accessed(tab(1, 1, "https://example.com/a"), 1);
        active_loser.active = true;
        let fake = Arc::new(FakeBrowser::with_tabs([
            active_loser,
            accessed(tab(2, 1, "https://example.com/a"), 9),
        ]));
        run(&fake).await;
        assert_eq!(fake.activations(), vec![TabId(2)]);
        assert_eq!(fake.window_focuses(), vec![WindowId(1)]);
    }

    #[tokio::test(start_paused = true)]
    async fn no_refocus_when_losers_were_inactive() {
        let fake = group_of(2);
        run(&fake).await;
        assert!(fake.activations().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_failures_are_independent() {
        let fake = group_of(3);
        fake.fail_removals(TabId(2), [BrowserError::Permanent("denied".into())]);
        let (report, registry) = run(&fake).await;
        assert_eq!(report.closed, 2);
        assert_eq!(report.failed, 1);
        assert!(!registry.lock().is_ignored(TabId(2)));
        assert_eq!(fake.tab_ids(), vec![TabId(100), TabId(2)]);
    }

    #[tokio::test(start_paused = true)]
    async fn inventory_failure_is_an_empty_pass() {
        let fake = group_of(2);
        fake.fail_queries(true);
        let (report, _) = run(&fake).await;
        assert_eq!(report, StartupReport::default());
        assert_eq!(fake.tab_ids().len(), 3);
    }
}
