//! Engine tuning: timings, retry ceiling, startup batch policy.

use std::time::Duration;

use crate::matching::MatchOptions;

/// Runtime configuration for the reconciliation engine.
///
/// Built from CLI flags in `main.rs`; [`Default`] carries the values
/// the daemon ships with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Which URL components duplicate detection ignores.
    pub matching: MatchOptions,
    /// Quiet period before a coalesced refocus fires.
    pub refocus_quiet: Duration,
    /// Delay between removal attempts on a locked tab strip.
    pub retry_delay: Duration,
    /// Total removal attempts, including the first.
    pub retry_attempts: u32,
    /// Wait before the startup pass, so the inventory settles.
    pub startup_delay: Duration,
    /// Duplicate groups with at most this many losers close concurrently.
    pub concurrent_close_limit: usize,
    /// Gap between removals when a group closes sequentially.
    pub sequential_gap: Duration,
    /// How often stale registry records are swept.
    pub gc_interval: Duration,
    /// How long a record missing from the inventory may linger when it
    /// was touched after the inventory snapshot was requested.
    pub gc_retention: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            matching: MatchOptions::default(),
            refocus_quiet: Duration::from_millis(250),
            retry_delay: Duration::from_millis(100),
            retry_attempts: 5,
            startup_delay: Duration::from_millis(1000),
            concurrent_close_limit: 4,
            sequential_gap: Duration::from_millis(50),
            gc_interval: Duration::from_secs(5 * 60),
            gc_retention: Duration::from_secs(30 * 60),
        }
    }
}
