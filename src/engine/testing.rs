//! In-memory [`Browser`] for engine tests.
//!
//! Holds a tab list, records every mutation, and replays scripted
//! removal failures. Queries honour URL match patterns the way a
//! browser does. Every call resolves immediately, so paused-clock
//! tests only advance time through the engine's own timers.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;
use url::Url;

use crate::browser::{Browser, BrowserError, Tab, TabId, TabQuery, TabStatus, WindowId};

/// A complete, inactive tab.
pub fn tab(id: i64, window: i64, url: &str) -> Tab {
    Tab {
        id: TabId(id),
        window_id: WindowId(window),
        url: url.to_string(),
        status: TabStatus::Complete,
        active: false,
        index: id as u32,
        last_accessed: None,
    }
}

/// A tab whose top-level document is still loading.
pub fn loading_tab(id: i64, window: i64, url: &str) -> Tab {
    Tab {
        status: TabStatus::Loading,
        ..tab(id, window, url)
    }
}

#[derive(Debug, Default)]
struct FakeState {
    tabs: Vec<Tab>,
    focused: Option<WindowId>,
    remove_failures: HashMap<TabId, VecDeque<BrowserError>>,
    remove_attempts: Vec<(TabId, Instant)>,
    removed: Vec<TabId>,
    activations: Vec<TabId>,
    window_focuses: Vec<WindowId>,
    queries: Vec<TabQuery>,
    fail_queries: bool,
}

type Hook = Box<dyn Fn() + Send + Sync>;

#[derive(Default)]
pub struct FakeBrowser {
    state: Mutex<FakeState>,
    on_focused_window: Mutex<Option<Hook>>,
}

impl FakeBrowser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tabs(tabs: impl IntoIterator<Item = Tab>) -> Self {
        let fake = Self::new();
        fake.state.lock().tabs.extend(tabs);
        fake
    }

    pub fn add_tab(&self, tab: Tab) {
        self.state.lock().tabs.push(tab);
    }

    /// Make a tab vanish without going through `remove_tab`.
    pub fn drop_tab(&self, id: TabId) {
        self.state.lock().tabs.retain(|t| t.id != id);
    }

    pub fn set_focused(&self, window: Option<WindowId>) {
        self.state.lock().focused = window;
    }

    /// Fail the next removals of `id` with `errors`, in order.
    pub fn fail_removals(&self, id: TabId, errors: impl IntoIterator<Item = BrowserError>) {
        self.state
            .lock()
            .remove_failures
            .entry(id)
            .or_default()
            .extend(errors);
    }

    /// Run `hook` every time the focused window is looked up, as if
    /// another task ran while the caller was suspended.
    pub fn on_focused_window(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.on_focused_window.lock() = Some(Box::new(hook));
    }

    pub fn fail_queries(&self, fail: bool) {
        self.state.lock().fail_queries = fail;
    }

    pub fn tab_ids(&self) -> Vec<TabId> {
        self.state.lock().tabs.iter().map(|t| t.id).collect()
    }

    /// Tabs successfully removed, in order.
    pub fn removed(&self) -> Vec<TabId> {
        self.state.lock().removed.clone()
    }

    /// Every removal attempt, successful or not, with its time.
    pub fn remove_attempts(&self) -> Vec<(TabId, Instant)> {
        self.state.lock().remove_attempts.clone()
    }

    pub fn activations(&self) -> Vec<TabId> {
        self.state.lock().activations.clone()
    }

    pub fn window_focuses(&self) -> Vec<WindowId> {
        self.state.lock().window_focuses.clone()
    }

    pub fn queries(&self) -> Vec<TabQuery> {
        self.state.lock().queries.clone()
    }
}

#[async_trait]
impl Browser for FakeBrowser {
    async fn query_tabs(&self, query: &TabQuery) -> Result<Vec<Tab>, BrowserError> {
        let mut state = self.state.lock();
        state.queries.push(query.clone());
        if state.fail_queries {
            return Err(BrowserError::Permanent("query failed".into()));
        }
        Ok(state
            .tabs
            .iter()
            .filter(|t| query.window_id.is_none_or(|w| t.window_id == w))
            .filter(|t| query.status.is_none_or(|s| t.status == s))
            .filter(|t| {
                query
                    .url_pattern
                    .as_deref()
                    .is_none_or(|p| matches_pattern(p, &t.url))
            })
            .cloned()
            .collect())
    }

    async fn get_tab(&self, id: TabId) -> Result<Tab, BrowserError> {
        self.state
            .lock()
            .tabs
            .iter()
            .find(|t| t.id == id)
            .cloned()
            .ok_or(BrowserError::NotFound(id))
    }

    async fn remove_tab(&self, id: TabId) -> Result<(), BrowserError> {
        let mut state = self.state.lock();
        state.remove_attempts.push((id, Instant::now()));
        if let Some(error) = state
            .remove_failures
            .get_mut(&id)
            .and_then(VecDeque::pop_front)
        {
            return Err(error);
        }
        let before = state.tabs.len();
        state.tabs.retain(|t| t.id != id);
        if state.tabs.len() == before {
            return Err(BrowserError::NotFound(id));
        }
        state.removed.push(id);
        Ok(())
    }

    async fn set_active(&self, id: TabId) -> Result<(), BrowserError> {
        let mut state = self.state.lock();
        let window = state
            .tabs
            .iter()
            .find(|t| t.id == id)
            .map(|t| t.window_id)
            .ok_or(BrowserError::NotFound(id))?;
        for t in state.tabs.iter_mut().filter(|t| t.window_id == window) {
            t.active = t.id == id;
        }
        state.activations.push(id);
        Ok(())
    }

    async fn focus_window(&self, id: WindowId) -> Result<(), BrowserError> {
        let mut state = self.state.lock();
        state.focused = Some(id);
        state.window_focuses.push(id);
        Ok(())
    }

    async fn focused_window(&self) -> Result<Option<WindowId>, BrowserError> {
        if let Some(hook) = &*self.on_focused_window.lock() {
            hook();
        }
        Ok(self.state.lock().focused)
    }
}

/// Browser match-pattern semantics: `*` scheme covers `http` and
/// `https`, a `*.` host also matches the bare domain, the port is
/// ignored, and the path glob runs over path plus query,
/// case-sensitively.
pub fn matches_pattern(pattern: &str, url: &str) -> bool {
    let Some((scheme, rest)) = pattern.split_once("://") else {
        return glob(pattern, url);
    };
    let Ok(parsed) = Url::parse(url) else {
        return false;
    };
    let scheme_ok = match scheme {
        "*" => matches!(parsed.scheme(), "http" | "https"),
        other => other == parsed.scheme(),
    };
    let (host_pattern, path_pattern) = rest.split_at(rest.find('/').unwrap_or(rest.len()));
    let host = parsed.host_str().unwrap_or_default();
    let host_ok = match host_pattern.strip_prefix("*.") {
        Some(base) => host == base || host.ends_with(&format!(".{base}")),
        None => host_pattern == "*" || host_pattern == host,
    };
    let mut path = parsed.path().to_string();
    if let Some(query) = parsed.query() {
        path.push('?');
        path.push_str(query);
    }
    scheme_ok && host_ok && glob(path_pattern, &path)
}

fn glob(pattern: &str, text: &str) -> bool {
    match pattern.split_once('*') {
        None => pattern == text,
        Some((head, tail)) => text.strip_prefix(head).is_some_and(|rest| {
            (0..=rest.len())
                .filter(|&i| rest.is_char_boundary(i))
                .any(|i| glob(tail, &rest[i..]))
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matching::{self, MatchOptions};

    #[test]
    fn pattern_glob_follows_browser_rules() {
        assert!(matches_pattern("*://*.example.com/a*", "https://www.example.com/a/"));
        assert!(matches_pattern("*://*.example.com/a*", "http://example.com:8080/a?x=1"));
        assert!(!matches_pattern("*://*.example.com/a*", "https://example.org/a"));
        assert!(!matches_pattern("*://*.example.com/a*", "ftp://example.com/a"));
        assert!(!matches_pattern("*://*.example.com/Docs*", "https://example.com/docs"));
        assert!(matches_pattern("chrome://settings/*", "chrome://settings/"));
        assert!(matches_pattern("about:preferences*", "about:preferences"));
    }

    #[test]
    fn pattern_admits_every_key_equal_url() {
        let opts = MatchOptions::default();
        let groups: &[&[&str]] = &[
            &["https://example.com/Docs", "https://example.com/docs", "https://WWW.example.com/DOCS/"],
            &["https://example.com/a", "https://www.example.com/a/", "https://example.com/a#top"],
            &["http://127.0.0.1:8080/X", "http://127.0.0.1:8080/x/"],
            &["https://example.com/", "https://www.example.com"],
            &["chrome://settings/", "chrome://settings/"],
        ];
        for group in groups {
            for observed in *group {
                let pattern = matching::query_pattern(observed, &opts).unwrap();
                for other in *group {
                    assert_eq!(
                        matching::canonical_key(observed, &opts),
                        matching::canonical_key(other, &opts)
                    );
                    assert!(matches_pattern(&pattern, other), "{pattern} vs {other}");
                }
            }
        }
    }
}
