//! Browser boundary: the tab/window inventory, its mutation calls, and
//! the lifecycle event stream.
//!
//! The browser is a remote, eventually-consistent service: every call
//! may suspend and may fail. The engine only ever talks to it through
//! the [`Browser`] trait. [`remote::RemoteBrowser`] is the production
//! implementation, backed by the IPC bridge.

pub mod remote;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Opaque tab identifier assigned by the browser.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TabId(pub i64);

/// Opaque window identifier assigned by the browser.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WindowId(pub i64);

/// Load state of a tab's top-level document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TabStatus {
    Loading,
    Complete,
}

/// A tab as reported by the browser inventory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tab {
    pub id: TabId,
    pub window_id: WindowId,
    #[serde(default)]
    pub url: String,
    pub status: TabStatus,
    /// Whether this is the selected tab of its window.
    #[serde(default)]
    pub active: bool,
    /// Zero-based position within the window's tab strip.
    #[serde(default)]
    pub index: u32,
    /// Unix epoch millis of the last time the tab was viewed.
    #[serde(default)]
    pub last_accessed: Option<u64>,
}

impl Tab {
    pub fn is_complete(&self) -> bool {
        self.status == TabStatus::Complete
    }
}

/// Filter for [`Browser::query_tabs`]. `None` fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabQuery {
    #[serde(default)]
    pub window_id: Option<WindowId>,
    #[serde(default)]
    pub url_pattern: Option<String>,
    #[serde(default)]
    pub status: Option<TabStatus>,
}

/// Lifecycle events delivered by the browser.
///
/// Navigation events carry the frame they refer to; only the top-level
/// frame (`frame_id == 0`) is meaningful to the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BrowserEvent {
    Created {
        tab: Tab,
    },
    BeforeNavigate {
        tab_id: TabId,
        frame_id: u32,
        url: String,
    },
    NavigationCompleted {
        tab_id: TabId,
        frame_id: u32,
    },
    /// A tab property changed. `status` and `url` are set only when that
    /// property is part of the change; `tab` is the tab after the change.
    Updated {
        tab_id: TabId,
        #[serde(default)]
        status: Option<TabStatus>,
        #[serde(default)]
        url: Option<String>,
        tab: Tab,
    },
    Attached {
        tab_id: TabId,
        window_id: WindowId,
    },
    Detached {
        tab_id: TabId,
        window_id: WindowId,
    },
    Removed {
        tab_id: TabId,
        window_id: WindowId,
        #[serde(default)]
        window_closing: bool,
    },
    Installed {
        reason: String,
    },
    Startup,
}

/// Errors returned by browser calls.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrowserError {
    /// The tab strip is locked against mutation (e.g. mid-drag). Worth
    /// retrying after a short delay.
    #[error("tabs cannot be edited right now: {0}")]
    Transient(String),
    /// The tab vanished between decision and action.
    #[error("no tab with id {0:?}")]
    NotFound(TabId),
    #[error("{0}")]
    Permanent(String),
    /// The bridge connection closed before a reply arrived.
    #[error("browser disconnected")]
    Disconnected,
}

impl BrowserError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// The browser's tab/window API.
///
/// `set_active` and `focus_window` are independent calls; callers that
/// want one logical focus operation issue both.
#[async_trait]
pub trait Browser: Send + Sync {
    async fn query_tabs(&self, query: &TabQuery) -> Result<Vec<Tab>, BrowserError>;

    async fn get_tab(&self, id: TabId) -> Result<Tab, BrowserError>;

    async fn remove_tab(&self, id: TabId) -> Result<(), BrowserError>;

    async fn set_active(&self, id: TabId) -> Result<(), BrowserError>;

    async fn focus_window(&self, id: WindowId) -> Result<(), BrowserError>;

    /// The window that currently has input focus, if the browser knows.
    async fn focused_window(&self) -> Result<Option<WindowId>, BrowserError>;
}

/// Query the inventory, degrading a failure to an empty result.
pub async fn query_or_empty(browser: &dyn Browser, query: &TabQuery) -> Vec<Tab> {
    match browser.query_tabs(query).await {
        Ok(tabs) => tabs,
        Err(e) => {
            tracing::warn!(error = %e, ?query, "tab query failed");
            Vec::new()
        }
    }
}

/// Bring a tab to the front: select it and focus its window.
///
/// Both calls are issued together; a failure of one leaves the other's
/// effect in place. Failures are dropped, not retried.
pub async fn focus_tab(browser: &dyn Browser, tab: TabId, window: WindowId) {
    let (activated, focused) = tokio::join!(browser.set_active(tab), browser.focus_window(window));
    if let Err(e) = activated {
        tracing::debug!(?tab, error = %e, "activate failed");
    }
    if let Err(e) = focused {
        tracing::debug!(?window, error = %e, "window focus failed");
    }
}
