//! URL canonicalization: classification, comparison keys, query patterns.
//!
//! Two tabs point at the same destination iff their canonical keys are
//! equal. The query pattern is only a coarse filter handed to the
//! browser's inventory query; exact equivalence is always rechecked
//! locally with [`canonical_key`].

use std::sync::LazyLock;

use regex::Regex;
use url::Url;

static NETWORK_URL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(f|ht)tps?://").expect("static network regex"));

/// Browser-internal pages. Includes the local search-view scheme.
const INTERNAL_PREFIXES: &[&str] = &[
    "chrome://",
    "chrome-search://",
    "edge://",
    "brave://",
    "vivaldi://",
    "opera://",
    "about:",
];

const EXTENSION_PREFIXES: &[&str] = &[
    "chrome-extension://",
    "moz-extension://",
    "safari-web-extension://",
    "extension://",
];

/// Coarse URL classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UrlClass {
    /// `about:blank` or an empty URL: a tab with nothing loaded yet.
    Blank,
    /// Browser-internal page. Compared by identity.
    Internal,
    /// Extension page. Never compared.
    Extension,
    /// `http`, `https`, `ftp` or `ftps`.
    Network,
    /// Anything else (`file:`, `data:`, unparseable network URLs, ...).
    Invalid,
}

impl UrlClass {
    /// Whether URLs of this class take part in duplicate detection.
    pub fn is_comparable(self) -> bool {
        matches!(self, Self::Internal | Self::Network)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Blank => "blank",
            Self::Internal => "internal",
            Self::Extension => "extension",
            Self::Network => "network",
            Self::Invalid => "invalid",
        }
    }
}

/// Knobs controlling which URL components the canonical key ignores.
///
/// The defaults fold the fragment, a leading `www.` label and letter
/// case, and keep the scheme and the query string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchOptions {
    pub ignore_fragment: bool,
    pub ignore_www: bool,
    pub case_insensitive: bool,
    pub ignore_query: bool,
    pub ignore_scheme: bool,
}

impl Default for MatchOptions {
    fn default() -> Self {
        Self {
            ignore_fragment: true,
            ignore_www: true,
            case_insensitive: true,
            ignore_query: false,
            ignore_scheme: false,
        }
    }
}

/// Classify a URL.
pub fn classify(url: &str) -> UrlClass {
    if is_blank(url) {
        return UrlClass::Blank;
    }
    if NETWORK_URL.is_match(url) {
        return match Url::parse(url) {
            Ok(parsed) if parsed.host_str().is_some() => UrlClass::Network,
            _ => UrlClass::Invalid,
        };
    }
    if INTERNAL_PREFIXES.iter().any(|p| url.starts_with(p)) {
        return UrlClass::Internal;
    }
    if EXTENSION_PREFIXES.iter().any(|p| url.starts_with(p)) {
        return UrlClass::Extension;
    }
    UrlClass::Invalid
}

pub fn is_blank(url: &str) -> bool {
    url.is_empty() || url == "about:blank"
}

/// Canonical comparison key.
///
/// Network URLs are normalized per `opts`; every other class is
/// returned unchanged.
pub fn canonical_key(url: &str, opts: &MatchOptions) -> String {
    if classify(url) != UrlClass::Network {
        return url.to_string();
    }
    match Url::parse(url) {
        Ok(parsed) => network_key(&parsed, opts),
        Err(_) => url.to_string(),
    }
}

fn network_key(parsed: &Url, opts: &MatchOptions) -> String {
    let host = parsed.host_str().unwrap_or_default();
    let host = if opts.ignore_www {
        host.strip_prefix("www.").unwrap_or(host)
    } else {
        host
    };

    let mut key = String::with_capacity(parsed.as_str().len());
    if !opts.ignore_scheme {
        key.push_str(parsed.scheme());
        key.push_str("://");
    }
    key.push_str(host);
    if let Some(port) = parsed.port() {
        key.push(':');
        key.push_str(&port.to_string());
    }
    key.push_str(parsed.path());
    if !opts.ignore_query
        && let Some(query) = parsed.query().filter(|q| !q.is_empty())
    {
        key.push('?');
        key.push_str(query);
    }
    if !opts.ignore_fragment
        && let Some(fragment) = parsed.fragment().filter(|f| !f.is_empty())
    {
        key.push('#');
        key.push_str(fragment);
    }

    if opts.case_insensitive {
        key = key.to_lowercase();
    }
    if key.ends_with('/') {
        key.pop();
    }
    key
}

/// Coarse match pattern for the browser's inventory query.
///
/// Returns `None` for URLs that never take part in duplicate detection.
/// Every tab whose key equals `url`'s key matches the pattern:
///
/// - `http`/`https` share the `*` scheme; `ftp`/`ftps` are spelled out.
/// - The host gets a `*.` prefix when `www.` is folded.
/// - The path always ends in a wildcard, since the key folds a trailing
///   slash. Browsers compare paths case-sensitively, so a case-folding
///   key cuts the path before its first letter.
pub fn query_pattern(url: &str, opts: &MatchOptions) -> Option<String> {
    match classify(url) {
        UrlClass::Network => {
            let parsed = Url::parse(url).ok()?;
            let host = parsed.host_str()?;
            let host = match parsed.domain() {
                Some(domain) if opts.ignore_www => {
                    format!("*.{}", domain.strip_prefix("www.").unwrap_or(domain))
                }
                _ => host.to_string(),
            };
            let scheme = match parsed.scheme() {
                "http" | "https" => "*",
                other => other,
            };
            let path = parsed.path();
            let path = match path.strip_suffix('/') {
                Some("") => "/",
                Some(trimmed) => trimmed,
                None => path,
            };
            let path = match path.find(|c: char| c.is_ascii_alphabetic()) {
                Some(cut) if opts.case_insensitive => &path[..cut],
                _ => path,
            };
            Some(format!("{scheme}://{host}{path}*"))
        }
        UrlClass::Internal => Some(format!("{url}*")),
        UrlClass::Blank | UrlClass::Extension | UrlClass::Invalid => None,
    }
}

/// Human-readable breakdown of how `url` is matched, one field per line.
pub fn describe(url: &str, opts: &MatchOptions) -> String {
    let class = classify(url);
    let mut out = format!("{url}\n  class:   {}\n", class.name());
    if class.is_comparable() {
        out.push_str(&format!("  key:     {}\n", canonical_key(url, opts)));
    }
    match query_pattern(url, opts) {
        Some(pattern) => out.push_str(&format!("  pattern: {pattern}\n")),
        None => out.push_str("  pattern: (not compared)\n"),
    }
    out
}
