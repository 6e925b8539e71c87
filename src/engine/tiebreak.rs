//! Keeper selection between two tabs that share a canonical key.
//!
//! Two steps, always in this order:
//!
//! 1. Recency: the tab that settled first is the provisional keeper. A
//!    tab that never settled is presumed newer than any tab that did.
//!    Ties go against the observed tab, which is the newly arriving one.
//! 2. Focus override: when the focused window is known, a tab in that
//!    window that is active itself, or whose rival lies outside that
//!    window, overrides the provisional keeper. If both tabs qualify the
//!    provisional keeper stands.

use tokio::time::Instant;

use crate::browser::{Tab, TabId, WindowId};

/// One side of a duplicate pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    pub id: TabId,
    pub window_id: WindowId,
    pub active: bool,
    pub index: u32,
    pub last_settled: Option<Instant>,
}

impl Candidate {
    pub fn from_tab(tab: &Tab, last_settled: Option<Instant>) -> Self {
        Self {
            id: tab.id,
            window_id: tab.window_id,
            active: tab.active,
            index: tab.index,
            last_settled,
        }
    }
}

/// What the refocus step needs to know about the surviving tab.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepInfo {
    pub tab_id: TabId,
    pub window_id: WindowId,
    /// One of the pair was the active tab, so the keeper should end up
    /// active once the loser is gone.
    pub active: bool,
    /// The keeper's position in its window's tab strip.
    pub index: u32,
}

/// Outcome of [`resolve`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verdict {
    pub loser: TabId,
    pub keep: KeepInfo,
}

/// Decide which of `observed` and `other` survives.
pub fn resolve(observed: &Candidate, other: &Candidate, focused: Option<WindowId>) -> Verdict {
    let mut keep_observed = settled_before(observed.last_settled, other.last_settled);

    if let Some(window) = focused {
        match (
            overrides(observed, other, window),
            overrides(other, observed, window),
        ) {
            (true, false) => keep_observed = true,
            (false, true) => keep_observed = false,
            _ => {}
        }
    }

    let (keeper, loser) = if keep_observed {
        (observed, other)
    } else {
        (other, observed)
    };
    Verdict {
        loser: loser.id,
        keep: KeepInfo {
            tab_id: keeper.id,
            window_id: keeper.window_id,
            active: keeper.active || loser.active,
            index: keeper.index,
        },
    }
}

/// Strictly earlier settle time. `None` is later than any `Some`.
fn settled_before(a: Option<Instant>, b: Option<Instant>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a < b,
        (Some(_), None) => true,
        (None, _) => false,
    }
}

fn overrides(candidate: &Candidate, rival: &Candidate, focused: WindowId) -> bool {
    candidate.window_id == focused && (candidate.active || rival.window_id != focused)
}
