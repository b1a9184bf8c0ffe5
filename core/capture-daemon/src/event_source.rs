//! Event source seam.
//!
//! The instrumentation channel itself is opaque. The daemon only needs to
//! pick a target, attach/detach, and ask whether a target still exists.
//! Network events and detachment signals arrive separately, as IPC requests.

use async_trait::async_trait;
use crawl_capture_protocol::TargetInfo;
use std::collections::HashSet;
use std::sync::Mutex;

use crate::error::CaptureError;
use crate::scope::is_debuggable_url;

#[async_trait]
pub trait EventSource: Send + Sync {
    /// Picks the page a new session should observe.
    async fn resolve_target(&self) -> Result<String, CaptureError>;

    async fn attach(&self, target: &str) -> Result<(), CaptureError>;

    async fn detach(&self, target: &str) -> Result<(), CaptureError>;

    async fn target_exists(&self, target: &str) -> bool;
}

#[derive(Default)]
struct BridgeState {
    targets: Vec<TargetInfo>,
    attached: HashSet<String>,
}

/// Event source fed by an external bridge process over IPC.
///
/// The bridge registers the pages it can see; attach/detach toggle whether
/// the daemon wants events from a page.
#[derive(Default)]
pub struct BridgeEventSource {
    state: Mutex<BridgeState>,
}

impl BridgeEventSource {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut BridgeState) -> T) -> T {
        match self.state.lock() {
            Ok(mut guard) => f(&mut guard),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }

    /// Registers or refreshes a target. Returns true when its URL changed
    /// (a navigation).
    pub fn upsert_target(&self, target: TargetInfo) -> bool {
        self.with_state(|state| {
            if target.focused {
                for existing in state.targets.iter_mut() {
                    existing.focused = false;
                }
            }
            match state
                .targets
                .iter_mut()
                .find(|existing| existing.target_handle == target.target_handle)
            {
                Some(existing) => {
                    let navigated = existing.url != target.url;
                    *existing = target;
                    navigated
                }
                None => {
                    state.targets.push(target);
                    false
                }
            }
        })
    }

    /// Forgets a target. Returns true when it was attached.
    pub fn remove_target(&self, target_handle: &str) -> bool {
        self.with_state(|state| {
            state
                .targets
                .retain(|existing| existing.target_handle != target_handle);
            state.attached.remove(target_handle)
        })
    }

    /// Records an unsolicited detachment reported by the bridge.
    pub fn mark_detached(&self, target_handle: &str) {
        self.with_state(|state| {
            state.attached.remove(target_handle);
        });
    }

    pub fn is_attached(&self, target_handle: &str) -> bool {
        self.with_state(|state| state.attached.contains(target_handle))
    }

    pub fn targets(&self) -> Vec<TargetInfo> {
        self.with_state(|state| state.targets.clone())
    }
}

#[async_trait]
impl EventSource for BridgeEventSource {
    async fn resolve_target(&self) -> Result<String, CaptureError> {
        self.with_state(|state| {
            let debuggable = |target: &&TargetInfo| is_debuggable_url(&target.url);
            state
                .targets
                .iter()
                .filter(debuggable)
                .find(|target| target.focused)
                .or_else(|| state.targets.iter().find(debuggable))
                .map(|target| target.target_handle.clone())
                .ok_or(CaptureError::NoTarget)
        })
    }

    async fn attach(&self, target: &str) -> Result<(), CaptureError> {
        self.with_state(|state| {
            let known = state
                .targets
                .iter()
                .any(|existing| existing.target_handle == target);
            if !known {
                return Err(CaptureError::TargetGone(target.to_string()));
            }
            state.attached.insert(target.to_string());
            Ok(())
        })
    }

    async fn detach(&self, target: &str) -> Result<(), CaptureError> {
        self.with_state(|state| {
            state.attached.remove(target);
        });
        Ok(())
    }

    async fn target_exists(&self, target: &str) -> bool {
        self.with_state(|state| {
            state
                .targets
                .iter()
                .any(|existing| existing.target_handle == target)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(handle: &str, url: &str, focused: bool) -> TargetInfo {
        TargetInfo {
            target_handle: handle.to_string(),
            url: url.to_string(),
            focused,
        }
    }

    #[tokio::test]
    async fn prefers_focused_debuggable_target() {
        let source = BridgeEventSource::new();
        source.upsert_target(target("tab-1", "https://a.example", false));
        source.upsert_target(target("tab-2", "https://b.example", true));

        assert_eq!(source.resolve_target().await.expect("target"), "tab-2");
    }

    #[tokio::test]
    async fn skips_focused_internal_page() {
        let source = BridgeEventSource::new();
        source.upsert_target(target("tab-1", "chrome://extensions", true));
        source.upsert_target(target("tab-2", "https://b.example", false));

        assert_eq!(source.resolve_target().await.expect("target"), "tab-2");
    }

    #[tokio::test]
    async fn no_debuggable_target_is_an_error() {
        let source = BridgeEventSource::new();
        source.upsert_target(target("tab-1", "about:blank", true));

        assert!(matches!(
            source.resolve_target().await,
            Err(CaptureError::NoTarget)
        ));
    }

    #[tokio::test]
    async fn attach_requires_known_target() {
        let source = BridgeEventSource::new();
        assert!(source.attach("tab-9").await.is_err());

        source.upsert_target(target("tab-9", "https://a.example", false));
        source.attach("tab-9").await.expect("attach");
        assert!(source.is_attached("tab-9"));

        assert!(source.remove_target("tab-9"));
        assert!(!source.target_exists("tab-9").await);
    }

    #[test]
    fn upsert_reports_navigation() {
        let source = BridgeEventSource::new();
        assert!(!source.upsert_target(target("tab-1", "https://a.example/", false)));
        assert!(!source.upsert_target(target("tab-1", "https://a.example/", true)));
        assert!(source.upsert_target(target("tab-1", "https://a.example/next", true)));
        assert_eq!(source.targets().len(), 1);
    }
}
