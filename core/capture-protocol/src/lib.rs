//! IPC protocol types and validation for crawl-capture.
//!
//! This crate is shared by the daemon, the control surface and the event-source
//! bridge to prevent schema drift. The daemon remains the authority on
//! validation, but clients can reuse the same types to construct valid requests.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use url::Url;

pub const PROTOCOL_VERSION: u32 = 1;
pub const MAX_REQUEST_BYTES: usize = 1024 * 1024; // 1MB
pub const MAX_REQUEST_ID_LEN: usize = 256;

pub type HeaderMap = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub enum Method {
    GetHealth,
    GetStatus,
    StartCapture,
    StopCapture,
    UpdateSettings,
    SetCollectorUrl,
    CollectorHealth,
    WatchStats,
    SourceEvent,
    SourceSignal,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Request {
    pub protocol_version: u32,
    pub method: Method,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub params: Option<Value>,
}

impl Request {
    pub fn new(method: Method, id: Option<String>, params: Option<Value>) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            method,
            id,
            params,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl Response {
    pub fn ok(id: Option<String>, data: Value) -> Self {
        Self {
            ok: true,
            id,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(id: Option<String>, code: &str, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            id,
            data: None,
            error: Some(ErrorInfo::new(code, message)),
        }
    }

    pub fn error_with_info(id: Option<String>, error: ErrorInfo) -> Self {
        Self {
            ok: false,
            id,
            data: None,
            error: Some(error),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Capture session types
// ─────────────────────────────────────────────────────────────────────────────

fn default_include_subdomains() -> bool {
    true
}

/// Settings for one capture session.
///
/// `target_url` and `scope_target_id` are fixed for the lifetime of a session;
/// the two filter flags can be live-patched with [`SettingsPatch`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CaptureSettings {
    pub target_url: String,
    #[serde(default)]
    pub scope_target_id: Option<String>,
    #[serde(default = "default_include_subdomains")]
    pub include_subdomains: bool,
    #[serde(default)]
    pub capture_static_assets: bool,
}

impl CaptureSettings {
    pub fn new(target_url: impl Into<String>) -> Self {
        Self {
            target_url: target_url.into(),
            scope_target_id: None,
            include_subdomains: default_include_subdomains(),
            capture_static_assets: false,
        }
    }

    pub fn validate(&self) -> Result<(), ErrorInfo> {
        let url = Url::parse(self.target_url.trim()).map_err(|err| {
            ErrorInfo::new(
                "invalid_target_url",
                format!("target_url is not a valid URL: {}", err),
            )
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ErrorInfo::new(
                "invalid_target_url",
                "target_url must use http or https",
            ));
        }
        if url.host_str().map(str::is_empty).unwrap_or(true) {
            return Err(ErrorInfo::new(
                "invalid_target_url",
                "target_url must include a host",
            ));
        }
        if let Some(scope_target_id) = &self.scope_target_id {
            if scope_target_id.trim().is_empty() {
                return Err(ErrorInfo::new(
                    "invalid_scope_target_id",
                    "scope_target_id must not be blank",
                ));
            }
        }
        Ok(())
    }
}

/// Live filter changes for an active session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SettingsPatch {
    #[serde(default)]
    pub include_subdomains: Option<bool>,
    #[serde(default)]
    pub capture_static_assets: Option<bool>,
}

impl SettingsPatch {
    pub fn apply(&self, settings: &mut CaptureSettings) {
        if let Some(value) = self.include_subdomains {
            settings.include_subdomains = value;
        }
        if let Some(value) = self.capture_static_assets {
            settings.capture_static_assets = value;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.include_subdomains.is_none() && self.capture_static_assets.is_none()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureStats {
    pub request_count: u64,
    pub endpoint_count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionPhase {
    Idle,
    Starting,
    Active,
    Detached,
    Stopping,
}

impl SessionPhase {
    /// True while the event source is (or is meant to be) attached.
    pub fn is_live(&self) -> bool {
        matches!(self, SessionPhase::Active | SessionPhase::Detached)
    }
}

/// The process-wide record a reopened control surface reads to reconstruct
/// status without asking the daemon.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub active: bool,
    pub stats: CaptureStats,
    #[serde(default)]
    pub target_handle: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
}

/// Full status as answered by the daemon's actor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStatus {
    pub phase: SessionPhase,
    pub active: bool,
    pub stats: CaptureStats,
    #[serde(default)]
    pub target_handle: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub scope_target_id: Option<String>,
    #[serde(default)]
    pub settings: Option<CaptureSettings>,
    #[serde(default)]
    pub pending_transactions: usize,
    #[serde(default)]
    pub detach_reason: Option<DetachReason>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Event source types
// ─────────────────────────────────────────────────────────────────────────────

/// One network lifecycle event for a single request identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", deny_unknown_fields)]
pub enum NetworkEvent {
    RequestObserved {
        request_id: String,
        url: String,
        method: String,
        #[serde(default)]
        headers: HeaderMap,
        #[serde(default)]
        body: Option<String>,
        timestamp: DateTime<Utc>,
    },
    RequestHeaders {
        request_id: String,
        headers: HeaderMap,
    },
    ResponseReceived {
        request_id: String,
        status: u16,
        #[serde(default)]
        headers: HeaderMap,
        #[serde(default)]
        mime_type: Option<String>,
    },
    LoadingFinished {
        request_id: String,
    },
    LoadingFailed {
        request_id: String,
        #[serde(default)]
        error_text: Option<String>,
    },
}

impl NetworkEvent {
    pub fn request_id(&self) -> &str {
        match self {
            NetworkEvent::RequestObserved { request_id, .. }
            | NetworkEvent::RequestHeaders { request_id, .. }
            | NetworkEvent::ResponseReceived { request_id, .. }
            | NetworkEvent::LoadingFinished { request_id }
            | NetworkEvent::LoadingFailed { request_id, .. } => request_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            NetworkEvent::RequestObserved { .. } => "request_observed",
            NetworkEvent::RequestHeaders { .. } => "request_headers",
            NetworkEvent::ResponseReceived { .. } => "response_received",
            NetworkEvent::LoadingFinished { .. } => "loading_finished",
            NetworkEvent::LoadingFailed { .. } => "loading_failed",
        }
    }

    pub fn validate(&self) -> Result<(), ErrorInfo> {
        let request_id = self.request_id();
        if request_id.trim().is_empty() {
            return Err(ErrorInfo::new(
                "invalid_request_id",
                "request_id is required",
            ));
        }
        if request_id.len() > MAX_REQUEST_ID_LEN {
            return Err(ErrorInfo::new(
                "invalid_request_id",
                format!(
                    "request_id must be {} characters or fewer",
                    MAX_REQUEST_ID_LEN
                ),
            ));
        }

        if let NetworkEvent::RequestObserved { url, method, .. } = self {
            require_str(url, "url")?;
            require_str(method, "method")?;
        }

        Ok(())
    }
}

/// A network event tagged with the target it was observed on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceEvent {
    pub target_handle: String,
    pub event: NetworkEvent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DetachReason {
    TargetClosed,
    #[serde(alias = "canceled_by_user")]
    UserCancelled,
    #[serde(other)]
    Other,
}

impl DetachReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DetachReason::TargetClosed => "target-closed",
            DetachReason::UserCancelled => "user-cancelled",
            DetachReason::Other => "other",
        }
    }
}

/// A page/tab the event source can observe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TargetInfo {
    pub target_handle: String,
    pub url: String,
    #[serde(default)]
    pub focused: bool,
}

/// Out-of-band signals from the event source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "signal", rename_all = "snake_case", deny_unknown_fields)]
pub enum SourceSignal {
    TargetUpdated {
        target: TargetInfo,
    },
    TargetRemoved {
        target_handle: String,
    },
    Detached {
        target_handle: String,
        reason: DetachReason,
    },
}

impl SourceSignal {
    pub fn target_handle(&self) -> &str {
        match self {
            SourceSignal::TargetUpdated { target } => &target.target_handle,
            SourceSignal::TargetRemoved { target_handle }
            | SourceSignal::Detached { target_handle, .. } => target_handle,
        }
    }

    pub fn validate(&self) -> Result<(), ErrorInfo> {
        require_str(self.target_handle(), "target_handle")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CollectorUrl {
    pub collector_url: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// Parsing
// ─────────────────────────────────────────────────────────────────────────────

fn parse_params<T: DeserializeOwned>(params: Option<Value>, what: &str) -> Result<T, ErrorInfo> {
    let params = params.ok_or_else(|| {
        ErrorInfo::new("missing_params", format!("{} params are required", what))
    })?;
    serde_json::from_value(params).map_err(|err| {
        ErrorInfo::new(
            "invalid_params",
            format!("{} payload is invalid: {}", what, err),
        )
    })
}

pub fn parse_settings(params: Option<Value>) -> Result<CaptureSettings, ErrorInfo> {
    let settings: CaptureSettings = parse_params(params, "settings")?;
    settings.validate()?;
    Ok(settings)
}

pub fn parse_settings_patch(params: Option<Value>) -> Result<SettingsPatch, ErrorInfo> {
    let patch: SettingsPatch = parse_params(params, "settings patch")?;
    if patch.is_empty() {
        return Err(ErrorInfo::new(
            "invalid_params",
            "settings patch must change at least one field",
        ));
    }
    Ok(patch)
}

pub fn parse_source_event(params: Option<Value>) -> Result<SourceEvent, ErrorInfo> {
    let event: SourceEvent = parse_params(params, "source event")?;
    require_str(&event.target_handle, "target_handle")?;
    event.event.validate()?;
    Ok(event)
}

pub fn parse_source_signal(params: Option<Value>) -> Result<SourceSignal, ErrorInfo> {
    let signal: SourceSignal = parse_params(params, "source signal")?;
    signal.validate()?;
    Ok(signal)
}

pub fn parse_collector_url(params: Option<Value>) -> Result<String, ErrorInfo> {
    let payload: CollectorUrl = parse_params(params, "collector url")?;
    let trimmed = payload.collector_url.trim().trim_end_matches('/');
    let url = Url::parse(trimmed).map_err(|err| {
        ErrorInfo::new(
            "invalid_collector_url",
            format!("collector_url is not a valid URL: {}", err),
        )
    })?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ErrorInfo::new(
            "invalid_collector_url",
            "collector_url must use http or https",
        ));
    }
    Ok(trimmed.to_string())
}

fn require_str(value: &str, field: &str) -> Result<(), ErrorInfo> {
    if value.trim().is_empty() {
        return Err(ErrorInfo::new(
            "missing_field",
            format!("{} is required", field),
        ));
    }
    Ok(())
}
