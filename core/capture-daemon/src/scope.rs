//! Capture filter: decides whether a request belongs to the session at all.
//!
//! The host check runs before a request enters the pending map and is the
//! only scope authority. The static-asset rule runs later, on finished
//! transactions, because it can be toggled mid-session.

use crawl_capture_protocol::CaptureSettings;
use url::Url;

const PROTECTED_PREFIXES: &[&str] = &[
    "chrome://",
    "chrome-extension://",
    "chrome-search://",
    "edge://",
    "about:",
    "view-source:",
    "devtools://",
];

const PROTECTED_HOSTS: &[&str] = &[
    "chrome.google.com/webstore",
    "microsoftedge.microsoft.com/addons",
];

pub const STATIC_EXTENSIONS: &[&str] = &[
    ".css", ".js", ".jpg", ".jpeg", ".png", ".gif", ".svg", ".ico", ".woff", ".woff2", ".ttf",
    ".eot",
];

/// Browser-internal pages and extension stores can never be instrumented.
pub fn is_debuggable_url(url: &str) -> bool {
    let url = url.trim();
    if url.is_empty() {
        return false;
    }
    if PROTECTED_PREFIXES
        .iter()
        .any(|prefix| url.starts_with(prefix))
    {
        return false;
    }
    !PROTECTED_HOSTS.iter().any(|host| url.contains(host))
}

pub fn is_static_asset(url: &str) -> bool {
    let path = match Url::parse(url) {
        Ok(parsed) => parsed.path().to_ascii_lowercase(),
        Err(_) => return false,
    };
    STATIC_EXTENSIONS.iter().any(|ext| path.ends_with(ext))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureScope {
    host: String,
    include_subdomains: bool,
}

impl CaptureScope {
    /// Returns `None` when the target URL has no usable host.
    pub fn from_settings(settings: &CaptureSettings) -> Option<Self> {
        let target = Url::parse(settings.target_url.trim()).ok()?;
        let host = target.host_str()?.to_ascii_lowercase();
        if host.is_empty() {
            return None;
        }
        Some(Self {
            host,
            include_subdomains: settings.include_subdomains,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn accepts(&self, url: &str) -> bool {
        if !is_debuggable_url(url) {
            return false;
        }
        let parsed = match Url::parse(url) {
            Ok(parsed) => parsed,
            Err(_) => return false,
        };
        if !matches!(parsed.scheme(), "http" | "https") {
            return false;
        }
        let host = match parsed.host_str() {
            Some(host) => host.to_ascii_lowercase(),
            None => return false,
        };

        if host == self.host {
            return true;
        }
        self.include_subdomains
            && host
                .strip_suffix(self.host.as_str())
                .map(|prefix| prefix.ends_with('.'))
                .unwrap_or(false)
    }
}
