//! Capture session state machine.
//!
//! `CaptureSession` is owned by the runtime actor and mutated only through
//! `&mut self` on the actor's turn. Every method here is synchronous; the
//! asynchronous halves of start/stop/reattach run elsewhere and report back
//! through the `complete_*` / `finish_*` methods, tagged with the session
//! epoch they belong to so late results from an old session are ignored.
//!
//! ```text
//! Idle ─start─▶ Starting ─ack─▶ Active ─stop─▶ Stopping ─done─▶ Idle
//!                  │              ▲  │
//!                  └─fail─▶ Idle  │  └─detach(other)─▶ Detached
//!                                 └──────reattach──────────┘
//! ```

use crawl_capture_protocol::{
    CaptureSettings, CaptureStats, DetachReason, NetworkEvent, SessionPhase, SessionSnapshot,
    SessionStatus, SettingsPatch,
};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info};

use crate::correlator::{correlate, Correlation, PendingMap};
use crate::endpoint::canonicalize;
use crate::error::CaptureError;
use crate::record::CaptureRecord;
use crate::reporting::StartAck;
use crate::scope::{is_static_asset, CaptureScope};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Starting,
    Active,
    Detached { reason: DetachReason },
    Stopping,
}

impl SessionState {
    pub fn phase(&self) -> SessionPhase {
        match self {
            SessionState::Idle => SessionPhase::Idle,
            SessionState::Starting => SessionPhase::Starting,
            SessionState::Active => SessionPhase::Active,
            SessionState::Detached { .. } => SessionPhase::Detached,
            SessionState::Stopping => SessionPhase::Stopping,
        }
    }
}

/// What the runtime needs to finish a stop asynchronously.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopTicket {
    pub epoch: u64,
    pub target_handle: Option<String>,
    pub session_id: Option<String>,
    pub stats: CaptureStats,
}

#[derive(Debug, Clone, PartialEq)]
#[allow(clippy::large_enum_variant)]
pub enum EventOutcome {
    /// Not routed: no active session, or the event belongs to another target.
    Ignored,
    /// Correlator state advanced; nothing finished.
    Progressed,
    /// Finished transaction dropped by the static-asset rule.
    Dropped,
    Captured {
        record: CaptureRecord,
        stats: CaptureStats,
        new_endpoint: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DetachAction {
    Ignore,
    /// Target is gone; tear the session down like `stop()`.
    Terminate,
    /// Wait the fixed delay, then try one reattach.
    ScheduleReattach { epoch: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReattachOutcome {
    Attached,
    TargetGone,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReattachResult {
    Ignore,
    Resumed(CaptureStats),
    StillDetached,
    Terminate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NavigateAction {
    Ignore,
    /// Re-broadcast current stats so freshly loaded observers catch up.
    Resignal(CaptureStats),
    /// Opportunistic retry while detached.
    Reattach { epoch: u64 },
}

#[derive(Debug)]
pub struct CaptureSession {
    state: SessionState,
    epoch: u64,
    target_handle: Option<String>,
    session_id: Option<String>,
    scope_target_id: Option<String>,
    settings: Option<CaptureSettings>,
    scope: Option<CaptureScope>,
    stats: CaptureStats,
    seen_endpoints: HashSet<String>,
    pending: PendingMap,
    reattach_in_flight: bool,
    /// Detach signals seen while `Starting`, before the target is known.
    start_detaches: HashMap<String, DetachReason>,
}

impl Default for CaptureSession {
    fn default() -> Self {
        Self::new()
    }
}

impl CaptureSession {
    pub fn new() -> Self {
        Self {
            state: SessionState::Idle,
            epoch: 0,
            target_handle: None,
            session_id: None,
            scope_target_id: None,
            settings: None,
            scope: None,
            stats: CaptureStats::default(),
            seen_endpoints: HashSet::new(),
            pending: PendingMap::new(),
            reattach_in_flight: false,
            start_detaches: HashMap::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// True while a session is attached or recovering its attachment.
    pub fn is_active(&self) -> bool {
        self.state.phase().is_live()
    }

    pub fn stats(&self) -> CaptureStats {
        self.stats
    }

    pub fn settings(&self) -> Option<&CaptureSettings> {
        self.settings.as_ref()
    }

    pub fn target_handle(&self) -> Option<&str> {
        self.target_handle.as_deref()
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn seen_endpoints(&self) -> &HashSet<String> {
        &self.seen_endpoints
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_pending(&self, request_id: &str) -> bool {
        self.pending.contains_key(request_id)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Start
    // ─────────────────────────────────────────────────────────────────────

    /// Idle → Starting. Clears every per-session field and returns the new epoch.
    pub fn begin_start(&mut self, settings: CaptureSettings) -> Result<u64, CaptureError> {
        if self.state != SessionState::Idle {
            return Err(CaptureError::AlreadyRunning(self.state.phase()));
        }
        settings
            .validate()
            .map_err(|err| CaptureError::InvalidSettings(err.message))?;
        let scope = CaptureScope::from_settings(&settings).ok_or_else(|| {
            CaptureError::InvalidSettings("target_url has no usable host".to_string())
        })?;

        self.reset();
        self.epoch += 1;
        self.state = SessionState::Starting;
        self.scope = Some(scope);
        self.scope_target_id = settings.scope_target_id.clone();
        self.settings = Some(settings);
        Ok(self.epoch)
    }

    /// Starting → Active once the target is attached and the collector issued
    /// a session id. Returns false for a stale epoch.
    pub fn complete_start(&mut self, epoch: u64, target_handle: String, ack: StartAck) -> bool {
        if epoch != self.epoch || self.state != SessionState::Starting {
            return false;
        }
        info!(
            session_id = %ack.session_id,
            target = %target_handle,
            "Capture session active"
        );
        self.target_handle = Some(target_handle);
        self.session_id = Some(ack.session_id);
        if ack.scope_target_id.is_some() {
            self.scope_target_id = ack.scope_target_id;
        }
        self.state = SessionState::Active;
        true
    }

    /// A detach signal for the new target that arrived while the start was
    /// still in flight. Only meaningful right after `complete_start`.
    pub fn take_start_detach(&mut self) -> Option<DetachReason> {
        let target = self.target_handle.as_deref()?;
        let reason = self.start_detaches.remove(target);
        self.start_detaches.clear();
        reason
    }

    /// Starting → Idle with everything cleared; partial starts never stay live.
    pub fn abort_start(&mut self, epoch: u64) -> bool {
        if epoch != self.epoch || self.state != SessionState::Starting {
            return false;
        }
        self.reset();
        true
    }

    // ─────────────────────────────────────────────────────────────────────
    // Stop
    // ─────────────────────────────────────────────────────────────────────

    /// Active|Detached → Stopping. Unfinished transactions are dropped; they
    /// were never counted.
    pub fn begin_stop(&mut self) -> Result<StopTicket, CaptureError> {
        if !self.is_active() {
            return Err(CaptureError::NotActive(self.state.phase()));
        }
        self.state = SessionState::Stopping;
        self.reattach_in_flight = false;
        let dropped = self.pending.len();
        self.pending.clear();
        if dropped > 0 {
            debug!(dropped, "Dropping unfinished transactions at stop");
        }
        Ok(StopTicket {
            epoch: self.epoch,
            target_handle: self.target_handle.clone(),
            session_id: self.session_id.clone(),
            stats: self.stats,
        })
    }

    /// Stopping → Idle. Returns the final stats for a matching epoch.
    pub fn finish_stop(&mut self, epoch: u64) -> Option<CaptureStats> {
        if epoch != self.epoch || self.state != SessionState::Stopping {
            return None;
        }
        let stats = self.stats;
        self.reset();
        Some(stats)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Events
    // ─────────────────────────────────────────────────────────────────────

    pub fn handle_event(&mut self, target_handle: &str, event: NetworkEvent) -> EventOutcome {
        if self.state != SessionState::Active
            || self.target_handle.as_deref() != Some(target_handle)
        {
            return EventOutcome::Ignored;
        }
        let scope = match &self.scope {
            Some(scope) => scope,
            None => return EventOutcome::Ignored,
        };

        let transaction = match correlate(&mut self.pending, scope, event) {
            Correlation::Finished(transaction) => transaction,
            Correlation::Unknown | Correlation::Filtered => return EventOutcome::Ignored,
            Correlation::Tracked | Correlation::Updated | Correlation::Failed => {
                return EventOutcome::Progressed
            }
        };

        let capture_static = self
            .settings
            .as_ref()
            .map(|settings| settings.capture_static_assets)
            .unwrap_or(false);
        if !capture_static && is_static_asset(&transaction.url) {
            debug!(url = %transaction.url, "Static asset dropped");
            return EventOutcome::Dropped;
        }

        let endpoint = canonicalize(&transaction.url);
        let new_endpoint = self
            .seen_endpoints
            .insert(endpoint.dedup_key(&transaction.method));
        if new_endpoint {
            self.stats.endpoint_count = self.seen_endpoints.len() as u64;
            info!(method = %transaction.method, endpoint = %endpoint, "New endpoint discovered");
        }
        self.stats.request_count += 1;

        let session_id = self.session_id.as_deref().unwrap_or_default();
        EventOutcome::Captured {
            record: CaptureRecord::from_transaction(session_id, transaction, &endpoint),
            stats: self.stats,
            new_endpoint,
        }
    }

    /// Live-patches the filter flags. The target URL stays fixed.
    pub fn update_settings(
        &mut self,
        patch: &SettingsPatch,
    ) -> Result<CaptureSettings, CaptureError> {
        let settings = match (&self.state, self.settings.as_mut()) {
            (
                SessionState::Starting | SessionState::Active | SessionState::Detached { .. },
                Some(settings),
            ) => settings,
            _ => return Err(CaptureError::NotActive(self.state.phase())),
        };
        patch.apply(settings);
        self.scope = CaptureScope::from_settings(settings);
        Ok(settings.clone())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Detachment
    // ─────────────────────────────────────────────────────────────────────

    /// While `Starting` the target is not known yet, so the signal is held
    /// until the start completes (see [`Self::take_start_detach`]).
    pub fn on_detached(&mut self, target_handle: &str, reason: DetachReason) -> DetachAction {
        if self.state == SessionState::Starting {
            // A later target-closed must not be downgraded by a transient signal.
            let latched = self
                .start_detaches
                .entry(target_handle.to_string())
                .or_insert(reason);
            if reason == DetachReason::TargetClosed {
                *latched = reason;
            }
            return DetachAction::Ignore;
        }
        if !self.is_active() || self.target_handle.as_deref() != Some(target_handle) {
            return DetachAction::Ignore;
        }
        if reason == DetachReason::TargetClosed {
            return DetachAction::Terminate;
        }

        // Terminal events for in-flight requests are lost while detached.
        let dropped = self.pending.len();
        self.pending.clear();
        if dropped > 0 {
            debug!(dropped, "Dropping unfinished transactions at detach");
        }

        // user-cancelled is treated like any other transient loss.
        self.state = SessionState::Detached { reason };
        DetachAction::ScheduleReattach { epoch: self.epoch }
    }

    /// Claims the single in-flight reattach attempt. Returns the target to
    /// reattach, or `None` when no attempt is due.
    pub fn begin_reattach(&mut self, epoch: u64) -> Option<String> {
        if epoch != self.epoch || self.reattach_in_flight {
            return None;
        }
        match self.state {
            SessionState::Detached { .. } => {
                self.reattach_in_flight = true;
                self.target_handle.clone()
            }
            _ => None,
        }
    }

    pub fn complete_reattach(&mut self, epoch: u64, outcome: ReattachOutcome) -> ReattachResult {
        if epoch != self.epoch || !matches!(self.state, SessionState::Detached { .. }) {
            return ReattachResult::Ignore;
        }
        self.reattach_in_flight = false;
        match outcome {
            ReattachOutcome::Attached => {
                self.state = SessionState::Active;
                ReattachResult::Resumed(self.stats)
            }
            ReattachOutcome::TargetGone => ReattachResult::Terminate,
            ReattachOutcome::Failed(_) => ReattachResult::StillDetached,
        }
    }

    pub fn on_navigated(&mut self, target_handle: &str) -> NavigateAction {
        if self.target_handle.as_deref() != Some(target_handle) {
            return NavigateAction::Ignore;
        }
        match self.state {
            SessionState::Active => NavigateAction::Resignal(self.stats),
            SessionState::Detached { .. } if !self.reattach_in_flight => {
                NavigateAction::Reattach { epoch: self.epoch }
            }
            _ => NavigateAction::Ignore,
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Views
    // ─────────────────────────────────────────────────────────────────────

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            active: self.is_active(),
            stats: self.stats,
            target_handle: self.target_handle.clone(),
            session_id: self.session_id.clone(),
            updated_at: None,
        }
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            phase: self.state.phase(),
            active: self.is_active(),
            stats: self.stats,
            target_handle: self.target_handle.clone(),
            session_id: self.session_id.clone(),
            scope_target_id: self.scope_target_id.clone(),
            settings: self.settings.clone(),
            pending_transactions: self.pending.len(),
            detach_reason: match self.state {
                SessionState::Detached { reason } => Some(reason),
                _ => None,
            },
        }
    }

    fn reset(&mut self) {
        self.state = SessionState::Idle;
        self.target_handle = None;
        self.session_id = None;
        self.scope_target_id = None;
        self.settings = None;
        self.scope = None;
        self.stats = CaptureStats::default();
        self.seen_endpoints.clear();
        self.pending.clear();
        self.reattach_in_flight = false;
        self.start_detaches.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use crawl_capture_protocol::HeaderMap;

    const TARGET: &str = "tab-1";

    fn settings(include_subdomains: bool, capture_static_assets: bool) -> CaptureSettings {
        CaptureSettings {
            target_url: "https://example.com".to_string(),
            scope_target_id: Some("scope-1".to_string()),
            include_subdomains,
            capture_static_assets,
        }
    }

    fn ack() -> StartAck {
        StartAck {
            session_id: "session-1".to_string(),
            scope_target_id: None,
        }
    }

    fn active_session(capture_static_assets: bool) -> CaptureSession {
        let mut session = CaptureSession::new();
        let epoch = session
            .begin_start(settings(false, capture_static_assets))
            .expect("begin start");
        assert!(session.complete_start(epoch, TARGET.to_string(), ack()));
        session
    }

    fn run_request(
        session: &mut CaptureSession,
        id: &str,
        method: &str,
        url: &str,
    ) -> EventOutcome {
        session.handle_event(
            TARGET,
            NetworkEvent::RequestObserved {
                request_id: id.to_string(),
                url: url.to_string(),
                method: method.to_string(),
                headers: HeaderMap::new(),
                body: None,
                timestamp: Utc::now(),
            },
        );
        session.handle_event(
            TARGET,
            NetworkEvent::ResponseReceived {
                request_id: id.to_string(),
                status: 200,
                headers: HeaderMap::new(),
                mime_type: Some("application/json".to_string()),
            },
        );
        session.handle_event(
            TARGET,
            NetworkEvent::LoadingFinished {
                request_id: id.to_string(),
            },
        )
    }

    fn assert_stats_invariant(session: &CaptureSession) {
        let stats = session.stats();
        assert_eq!(stats.endpoint_count as usize, session.seen_endpoints().len());
        assert!(stats.request_count >= stats.endpoint_count);
    }

    #[test]
    fn start_requires_idle() {
        let mut session = active_session(false);
        assert!(matches!(
            session.begin_start(settings(false, false)),
            Err(CaptureError::AlreadyRunning(SessionPhase::Active))
        ));
    }

    #[test]
    fn start_rejects_invalid_target() {
        let mut session = CaptureSession::new();
        let mut bad = settings(false, false);
        bad.target_url = "ftp://example.com".to_string();
        assert!(matches!(
            session.begin_start(bad),
            Err(CaptureError::InvalidSettings(_))
        ));
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[test]
    fn aborted_start_leaves_nothing_behind() {
        let mut session = CaptureSession::new();
        let epoch = session.begin_start(settings(false, false)).expect("begin");
        assert_eq!(session.state(), SessionState::Starting);
        assert!(!session.is_active());

        assert!(session.abort_start(epoch));
        assert_eq!(session.state(), SessionState::Idle);
        assert!(session.settings().is_none());
        assert_eq!(session.snapshot(), SessionSnapshot::default());
    }

    #[test]
    fn stale_start_completion_is_ignored() {
        let mut session = CaptureSession::new();
        let first = session.begin_start(settings(false, false)).expect("begin");
        assert!(session.abort_start(first));
        let second = session.begin_start(settings(false, false)).expect("begin again");

        assert!(!session.complete_start(first, TARGET.to_string(), ack()));
        assert_eq!(session.state(), SessionState::Starting);
        assert!(session.complete_start(second, TARGET.to_string(), ack()));
    }

    #[test]
    fn collector_scope_target_overrides_requested_one() {
        let mut session = CaptureSession::new();
        let epoch = session.begin_start(settings(false, false)).expect("begin");
        session.complete_start(
            epoch,
            TARGET.to_string(),
            StartAck {
                session_id: "session-9".to_string(),
                scope_target_id: Some("scope-from-collector".to_string()),
            },
        );
        assert_eq!(
            session.status().scope_target_id.as_deref(),
            Some("scope-from-collector")
        );
    }

    #[test]
    fn counts_requests_and_distinct_endpoints() {
        let mut session = active_session(false);

        let outcome = run_request(&mut session, "r1", "GET", "https://example.com/users/42");
        assert!(matches!(
            outcome,
            EventOutcome::Captured {
                new_endpoint: true,
                ..
            }
        ));
        let outcome = run_request(&mut session, "r2", "GET", "https://example.com/users/99");
        assert!(matches!(
            outcome,
            EventOutcome::Captured {
                new_endpoint: false,
                ..
            }
        ));
        run_request(&mut session, "r3", "POST", "https://example.com/users/99");

        assert_eq!(
            session.stats(),
            CaptureStats {
                request_count: 3,
                endpoint_count: 2,
            }
        );
        assert!(session.seen_endpoints().contains("GET:/users/{id}"));
        assert!(session.seen_endpoints().contains("POST:/users/{id}"));
        assert_stats_invariant(&session);
    }

    #[test]
    fn captured_record_carries_session_and_endpoint() {
        let mut session = active_session(false);
        match run_request(&mut session, "r1", "GET", "https://example.com/api/items?page=2") {
            EventOutcome::Captured { record, stats, .. } => {
                assert_eq!(record.session_id, "session-1");
                assert_eq!(record.endpoint, "/api/items?page={value}");
                assert_eq!(record.status_code, 200);
                assert_eq!(stats.request_count, 1);
            }
            other => panic!("expected capture, got {:?}", other),
        }
    }

    #[test]
    fn scope_scenario_tracks_only_target_host() {
        let mut session = active_session(false);

        for (id, url) in [
            ("a", "https://example.com/api"),
            ("b", "https://cdn.example.com/x"),
            ("c", "https://other.com/y"),
        ] {
            session.handle_event(
                TARGET,
                NetworkEvent::RequestObserved {
                    request_id: id.to_string(),
                    url: url.to_string(),
                    method: "GET".to_string(),
                    headers: HeaderMap::new(),
                    body: None,
                    timestamp: Utc::now(),
                },
            );
        }

        assert_eq!(session.pending_len(), 1);
        assert!(session.is_pending("a"));
    }

    #[test]
    fn static_assets_dropped_unless_enabled() {
        let mut session = active_session(false);
        assert_eq!(
            run_request(&mut session, "r1", "GET", "https://example.com/app.js"),
            EventOutcome::Dropped
        );
        assert!(matches!(
            run_request(&mut session, "r2", "GET", "https://example.com/api/data"),
            EventOutcome::Captured { .. }
        ));
        assert_eq!(session.stats().request_count, 1);

        session
            .update_settings(&SettingsPatch {
                include_subdomains: None,
                capture_static_assets: Some(true),
            })
            .expect("patch");
        assert!(matches!(
            run_request(&mut session, "r3", "GET", "https://example.com/app.js"),
            EventOutcome::Captured { .. }
        ));
        assert_stats_invariant(&session);
    }

    #[test]
    fn update_settings_widens_scope_live() {
        let mut session = active_session(false);
        assert!(matches!(
            run_request(&mut session, "r1", "GET", "https://cdn.example.com/x"),
            EventOutcome::Ignored
        ));

        session
            .update_settings(&SettingsPatch {
                include_subdomains: Some(true),
                capture_static_assets: None,
            })
            .expect("patch");
        assert!(matches!(
            run_request(&mut session, "r2", "GET", "https://cdn.example.com/x"),
            EventOutcome::Captured { .. }
        ));
        assert_eq!(
            session.settings().map(|s| s.target_url.as_str()),
            Some("https://example.com")
        );
    }

    #[test]
    fn update_settings_requires_session() {
        let mut session = CaptureSession::new();
        assert!(matches!(
            session.update_settings(&SettingsPatch::default()),
            Err(CaptureError::NotActive(SessionPhase::Idle))
        ));
    }

    #[test]
    fn events_from_other_targets_are_ignored() {
        let mut session = active_session(false);
        let outcome = session.handle_event(
            "tab-2",
            NetworkEvent::RequestObserved {
                request_id: "r1".to_string(),
                url: "https://example.com/api".to_string(),
                method: "GET".to_string(),
                headers: HeaderMap::new(),
                body: None,
                timestamp: Utc::now(),
            },
        );
        assert_eq!(outcome, EventOutcome::Ignored);
        assert_eq!(session.pending_len(), 0);
    }

    #[test]
    fn stop_returns_final_stats_and_resets() {
        let mut session = active_session(false);
        run_request(&mut session, "r1", "GET", "https://example.com/api");
        session.handle_event(
            TARGET,
            NetworkEvent::RequestObserved {
                request_id: "unfinished".to_string(),
                url: "https://example.com/slow".to_string(),
                method: "GET".to_string(),
                headers: HeaderMap::new(),
                body: None,
                timestamp: Utc::now(),
            },
        );

        let ticket = session.begin_stop().expect("stop");
        assert_eq!(ticket.session_id.as_deref(), Some("session-1"));
        assert_eq!(ticket.stats.request_count, 1);
        assert_eq!(session.pending_len(), 0);

        assert!(matches!(
            session.begin_stop(),
            Err(CaptureError::NotActive(SessionPhase::Stopping))
        ));

        let stats = session.finish_stop(ticket.epoch).expect("finish");
        assert_eq!(stats.request_count, 1);
        assert_eq!(session.state(), SessionState::Idle);
        assert!(session.seen_endpoints().is_empty());
        assert!(matches!(
            session.begin_stop(),
            Err(CaptureError::NotActive(SessionPhase::Idle))
        ));
    }

    #[test]
    fn target_closed_terminates() {
        let mut session = active_session(false);
        assert_eq!(
            session.on_detached(TARGET, DetachReason::TargetClosed),
            DetachAction::Terminate
        );
        session.begin_stop().expect("stop");
        session.finish_stop(session.epoch());
        assert!(!session.is_active());
    }

    #[test]
    fn transient_detach_reattaches_with_stats_intact() {
        let mut session = active_session(false);
        run_request(&mut session, "r1", "GET", "https://example.com/api");
        let before = session.stats();

        let epoch = match session.on_detached(TARGET, DetachReason::Other) {
            DetachAction::ScheduleReattach { epoch } => epoch,
            other => panic!("expected reattach, got {:?}", other),
        };
        assert_eq!(session.status().phase, SessionPhase::Detached);
        assert!(session.is_active());
        assert_eq!(
            run_request(&mut session, "r2", "GET", "https://example.com/api"),
            EventOutcome::Ignored
        );

        assert_eq!(session.begin_reattach(epoch).as_deref(), Some(TARGET));
        assert_eq!(session.begin_reattach(epoch), None);
        assert_eq!(
            session.complete_reattach(epoch, ReattachOutcome::Attached),
            ReattachResult::Resumed(before)
        );
        assert_eq!(session.state(), SessionState::Active);
        assert_eq!(session.stats(), before);
    }

    #[test]
    fn user_cancelled_detach_is_treated_as_transient() {
        let mut session = active_session(false);
        assert!(matches!(
            session.on_detached(TARGET, DetachReason::UserCancelled),
            DetachAction::ScheduleReattach { .. }
        ));
        assert_eq!(
            session.status().detach_reason,
            Some(DetachReason::UserCancelled)
        );
    }

    #[test]
    fn failed_reattach_waits_for_next_signal() {
        let mut session = active_session(false);
        let epoch = match session.on_detached(TARGET, DetachReason::Other) {
            DetachAction::ScheduleReattach { epoch } => epoch,
            other => panic!("expected reattach, got {:?}", other),
        };
        session.begin_reattach(epoch);
        assert_eq!(
            session.complete_reattach(epoch, ReattachOutcome::Failed("busy".to_string())),
            ReattachResult::StillDetached
        );
        assert!(matches!(
            session.state(),
            SessionState::Detached { .. }
        ));

        assert_eq!(
            session.on_navigated(TARGET),
            NavigateAction::Reattach { epoch }
        );
    }

    #[test]
    fn vanished_target_during_reattach_terminates() {
        let mut session = active_session(false);
        let epoch = match session.on_detached(TARGET, DetachReason::Other) {
            DetachAction::ScheduleReattach { epoch } => epoch,
            other => panic!("expected reattach, got {:?}", other),
        };
        session.begin_reattach(epoch);
        assert_eq!(
            session.complete_reattach(epoch, ReattachOutcome::TargetGone),
            ReattachResult::Terminate
        );
    }

    #[test]
    fn detach_while_starting_is_held_for_the_resolved_target() {
        let mut session = CaptureSession::new();
        let epoch = session.begin_start(settings(false, false)).expect("begin");
        assert_eq!(
            session.on_detached("tab-2", DetachReason::Other),
            DetachAction::Ignore
        );
        assert_eq!(
            session.on_detached(TARGET, DetachReason::TargetClosed),
            DetachAction::Ignore
        );
        assert_eq!(
            session.on_detached(TARGET, DetachReason::Other),
            DetachAction::Ignore
        );

        assert!(session.complete_start(epoch, TARGET.to_string(), ack()));
        assert_eq!(session.take_start_detach(), Some(DetachReason::TargetClosed));
        assert_eq!(session.take_start_detach(), None);
        assert_eq!(
            session.on_detached(TARGET, DetachReason::TargetClosed),
            DetachAction::Terminate
        );
    }

    #[test]
    fn held_detach_does_not_leak_into_next_session() {
        let mut session = CaptureSession::new();
        let epoch = session.begin_start(settings(false, false)).expect("begin");
        session.on_detached(TARGET, DetachReason::TargetClosed);
        assert!(session.abort_start(epoch));

        let epoch = session.begin_start(settings(false, false)).expect("begin");
        assert!(session.complete_start(epoch, TARGET.to_string(), ack()));
        assert_eq!(session.take_start_detach(), None);
    }

    #[test]
    fn detach_drops_unfinished_transactions() {
        let mut session = active_session(false);
        session.handle_event(
            TARGET,
            NetworkEvent::RequestObserved {
                request_id: "r1".to_string(),
                url: "https://example.com/api".to_string(),
                method: "GET".to_string(),
                headers: HeaderMap::new(),
                body: None,
                timestamp: Utc::now(),
            },
        );
        assert!(session.is_pending("r1"));

        let epoch = match session.on_detached(TARGET, DetachReason::Other) {
            DetachAction::ScheduleReattach { epoch } => epoch,
            other => panic!("expected reattach, got {:?}", other),
        };
        assert_eq!(session.pending_len(), 0);

        session.begin_reattach(epoch);
        session.complete_reattach(epoch, ReattachOutcome::Attached);
        assert_eq!(
            session.handle_event(
                TARGET,
                NetworkEvent::LoadingFinished {
                    request_id: "r1".to_string(),
                },
            ),
            EventOutcome::Ignored
        );
        assert_eq!(session.status().pending_transactions, 0);
        assert_eq!(session.stats(), CaptureStats::default());
    }

    #[test]
    fn repeated_detach_keeps_single_reattach_in_flight() {
        let mut session = active_session(false);
        let epoch = match session.on_detached(TARGET, DetachReason::Other) {
            DetachAction::ScheduleReattach { epoch } => epoch,
            other => panic!("expected reattach, got {:?}", other),
        };
        assert_eq!(session.begin_reattach(epoch).as_deref(), Some(TARGET));

        assert!(matches!(
            session.on_detached(TARGET, DetachReason::Other),
            DetachAction::ScheduleReattach { .. }
        ));
        assert_eq!(session.begin_reattach(epoch), None);

        assert_eq!(
            session.complete_reattach(epoch, ReattachOutcome::Failed("busy".to_string())),
            ReattachResult::StillDetached
        );
        assert_eq!(session.begin_reattach(epoch).as_deref(), Some(TARGET));
    }

    #[test]
    fn detach_for_other_target_or_idle_is_ignored() {
        let mut session = CaptureSession::new();
        assert_eq!(
            session.on_detached(TARGET, DetachReason::TargetClosed),
            DetachAction::Ignore
        );

        let mut session = active_session(false);
        assert_eq!(
            session.on_detached("tab-2", DetachReason::Other),
            DetachAction::Ignore
        );
    }

    #[test]
    fn navigation_on_active_target_resignals() {
        let mut session = active_session(false);
        run_request(&mut session, "r1", "GET", "https://example.com/api");
        assert_eq!(
            session.on_navigated(TARGET),
            NavigateAction::Resignal(session.stats())
        );
        assert_eq!(session.on_navigated("tab-2"), NavigateAction::Ignore);
    }

    #[test]
    fn snapshot_reflects_live_session() {
        let session = active_session(false);
        let snapshot = session.snapshot();
        assert!(snapshot.active);
        assert_eq!(snapshot.target_handle.as_deref(), Some(TARGET));
        assert_eq!(snapshot.session_id.as_deref(), Some("session-1"));
    }
}
