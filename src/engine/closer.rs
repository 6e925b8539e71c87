//! Closure executor: removes losing tabs with bounded retry.
//!
//! The loser is marked ignored before the first removal request, so
//! neither its own removal event nor a concurrent duplicate search can
//! pick it up again. The flag is cleared on every failure path and left
//! set after a successful removal; the tab's removal event deletes the
//! record shortly after.

use std::sync::Arc;
use std::time::Duration;

use crate::browser::{Browser, BrowserError, TabId};

use super::refocus::RefocusScheduler;
use super::registry::SharedRegistry;
use super::tiebreak::KeepInfo;

/// Retry ceiling for removals on a locked tab strip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Zero is treated as one.
    pub attempts: u32,
    pub delay: Duration,
}

/// Why a closure did not remove its target.
#[derive(Debug, thiserror::Error)]
pub enum CloseError {
    /// The tab vanished before it could be removed. A benign race.
    #[error("tab {0:?} already gone")]
    Gone(TabId),
    #[error("tab {tab:?} still locked after {attempts} attempts: {source}")]
    Exhausted {
        tab: TabId,
        attempts: u32,
        source: BrowserError,
    },
    #[error("failed to close tab {tab:?}: {source}")]
    Failed { tab: TabId, source: BrowserError },
}

/// Closure executor. Cheap to clone; clones share the registry.
#[derive(Clone)]
pub struct Closer {
    browser: Arc<dyn Browser>,
    registry: SharedRegistry,
    refocus: RefocusScheduler,
    policy: RetryPolicy,
}

impl Closer {
    pub fn new(
        browser: Arc<dyn Browser>,
        registry: SharedRegistry,
        refocus: RefocusScheduler,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            browser,
            registry,
            refocus,
            policy,
        }
    }

    /// Mark `loser` ignored. Synchronous, so callers can claim a tab
    /// before handing the removal off to a background task.
    pub fn claim(&self, loser: TabId) {
        self.registry.lock().set_ignored(loser, true);
    }

    /// Claim and remove `loser`. Returns the number of attempts used.
    pub async fn close(&self, loser: TabId) -> Result<u32, CloseError> {
        self.claim(loser);
        self.remove_claimed(loser).await
    }

    /// Remove an already-claimed duplicate, then schedule the keeper's
    /// refocus if it is still tracked.
    pub async fn close_duplicate(&self, loser: TabId, keep: KeepInfo) -> Result<u32, CloseError> {
        let attempts = self.remove_claimed(loser).await?;
        if self.registry.lock().exists(keep.tab_id) {
            self.refocus.request(keep);
        }
        Ok(attempts)
    }

    /// Removal loop for a tab whose ignored flag is already set.
    pub async fn remove_claimed(&self, loser: TabId) -> Result<u32, CloseError> {
        let max_attempts = self.policy.attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let error = match self.browser.remove_tab(loser).await {
                Ok(()) => {
                    tracing::info!(tab = ?loser, attempt, "duplicate closed");
                    return Ok(attempt);
                }
                Err(e) => e,
            };

            match error {
                BrowserError::NotFound(_) => {
                    self.registry.lock().remove(loser);
                    tracing::debug!(tab = ?loser, "duplicate already gone");
                    return Err(CloseError::Gone(loser));
                }
                e if e.is_transient() && attempt < max_attempts => {
                    tracing::debug!(tab = ?loser, attempt, error = %e, "tab strip locked, retrying");
                    tokio::time::sleep(self.policy.delay).await;
                }
                e if e.is_transient() => {
                    self.registry.lock().set_ignored(loser, false);
                    tracing::warn!(tab = ?loser, attempts = attempt, error = %e, "giving up on duplicate");
                    return Err(CloseError::Exhausted {
                        tab: loser,
                        attempts: attempt,
                        source: e,
                    });
                }
                e => {
                    self.registry.lock().set_ignored(loser, false);
                    tracing::warn!(tab = ?loser, error = %e, "failed to close duplicate");
                    return Err(CloseError::Failed {
                        tab: loser,
                        source: e,
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::WindowId;
    use crate::engine::registry::TabRegistry;
    use crate::engine::testing::{FakeBrowser, tab};

    const A: TabId = TabId(1);
    const B: TabId = TabId(2);
    const QUIET: Duration = Duration::from_millis(250);

    fn locked() -> BrowserError {
        BrowserError::Transient("Tabs cannot be edited right now".into())
    }

    fn setup(attempts: u32) -> (Arc<FakeBrowser>, SharedRegistry, Closer) {
        let fake = Arc::new(FakeBrowser::with_tabs([
            tab(1, 1, "https://example.com/page"),
            tab(2, 1, "https://example.com/page#frag"),
        ]));
        let registry = TabRegistry::shared();
        {
            let mut r = registry.lock();
            r.mark_settled(A, "https://example.com/page").unwrap();
            r.mark_settled(B, "https://example.com/page#frag").unwrap();
        }
        let refocus = RefocusScheduler::new(fake.clone(), QUIET);
        let closer = Closer::new(
            fake.clone(),
            registry.clone(),
            refocus,
            RetryPolicy {
                attempts,
                delay: Duration::from_millis(100),
            },
        );
        (fake, registry, closer)
    }

    fn keep_a(active: bool) -> KeepInfo {
        KeepInfo {
            tab_id: A,
            window_id: WindowId(1),
            active,
            index: 1,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn success_leaves_flag_set() {
        let (fake, registry, closer) = setup(5);
        assert_eq!(closer.close(B).await.unwrap(), 1);
        assert_eq!(fake.removed(), vec![B]);
        assert!(registry.lock().get(B).unwrap().ignored);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_retry_then_succeed() {
        let (fake, registry, closer) = setup(5);
        fake.fail_removals(B, [locked(), locked()]);

        closer.claim(B);
        let attempts = closer.close_duplicate(B, keep_a(true)).await.unwrap();
        assert_eq!(attempts, 3);
        assert_eq!(fake.removed(), vec![B]);
        assert!(registry.lock().get(B).unwrap().ignored);

        // Attempts are spaced by the retry delay.
        let times: Vec<_> = fake.remove_attempts().iter().map(|(_, t)| *t).collect();
        assert_eq!(times[1] - times[0], Duration::from_millis(100));
        assert_eq!(times[2] - times[1], Duration::from_millis(100));

        // Exactly one refocus, for A's window.
        tokio::time::sleep(QUIET * 2).await;
        assert_eq!(fake.activations(), vec![A]);
        assert_eq!(fake.window_focuses(), vec![WindowId(1)]);
    }

    #[tokio::test(start_paused = true)]
    async fn flag_stays_set_while_retrying() {
        let (fake, registry, closer) = setup(5);
        fake.fail_removals(B, [locked()]);

        let task = tokio::spawn({
            let closer = closer.clone();
            async move { closer.close(B).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(registry.lock().is_ignored(B));
        assert_eq!(task.await.unwrap().unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_clear_flag() {
        let (fake, registry, closer) = setup(3);
        fake.fail_removals(B, [locked(), locked(), locked(), locked()]);

        let err = closer.close(B).await.unwrap_err();
        assert!(matches!(err, CloseError::Exhausted { attempts: 3, .. }));
        assert_eq!(fake.remove_attempts().len(), 3);
        assert!(fake.removed().is_empty());
        assert!(!registry.lock().is_ignored(B));
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_failure_is_not_retried() {
        let (fake, registry, closer) = setup(5);
        fake.fail_removals(B, [BrowserError::Permanent("nope".into())]);

        let err = closer.close_duplicate(B, keep_a(true)).await;
        assert!(matches!(err, Err(CloseError::Failed { .. })));
        assert_eq!(fake.remove_attempts().len(), 1);
        assert!(!registry.lock().is_ignored(B));

        tokio::time::sleep(QUIET * 2).await;
        assert!(fake.activations().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn vanished_tab_drops_record() {
        let (fake, registry, closer) = setup(5);
        fake.drop_tab(B);

        let err = closer.close(B).await.unwrap_err();
        assert!(matches!(err, CloseError::Gone(id) if id == B));
        assert!(!registry.lock().exists(B));
    }

    #[tokio::test(start_paused = true)]
    async fn no_refocus_for_untracked_keeper() {
        let (fake, registry, closer) = setup(5);
        registry.lock().remove(A);

        closer.claim(B);
        closer.close_duplicate(B, keep_a(true)).await.unwrap();
        tokio::time::sleep(QUIET * 2).await;
        assert!(fake.activations().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn zero_attempts_still_tries_once() {
        let (fake, _registry, closer) = setup(0);
        fake.fail_removals(B, [locked()]);
        assert!(matches!(
            closer.close(B).await,
            Err(CloseError::Exhausted { attempts: 1, .. })
        ));
    }
}
