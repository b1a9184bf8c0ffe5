//! Error types for the capture daemon.
//!
//! Only `start` and `stop` surface [`CaptureError`] to the control surface;
//! everything on the event path is absorbed and logged.

use crawl_capture_protocol::{ErrorInfo, SessionPhase};
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    // ─────────────────────────────────────────────────────────────────────
    // State machine rejections
    // ─────────────────────────────────────────────────────────────────────
    #[error("Capture session already running (phase: {0:?})")]
    AlreadyRunning(SessionPhase),

    #[error("No active capture session (phase: {0:?})")]
    NotActive(SessionPhase),

    #[error("Invalid capture settings: {0}")]
    InvalidSettings(String),

    // ─────────────────────────────────────────────────────────────────────
    // Event source
    // ─────────────────────────────────────────────────────────────────────
    #[error("No debuggable target found. Open a regular http(s) page before starting capture")]
    NoTarget,

    #[error("Target no longer exists: {0}")]
    TargetGone(String),

    #[error("Failed to attach to target {target}: {details}")]
    AttachFailed { target: String, details: String },

    // ─────────────────────────────────────────────────────────────────────
    // Collector
    // ─────────────────────────────────────────────────────────────────────
    #[error("Failed to start session on collector: {0}")]
    Handshake(#[source] ReportError),

    #[error("Capture daemon is shutting down")]
    Shutdown,
}

impl CaptureError {
    pub fn code(&self) -> &'static str {
        match self {
            CaptureError::AlreadyRunning(_) => "already_running",
            CaptureError::NotActive(_) => "not_active",
            CaptureError::InvalidSettings(_) => "invalid_settings",
            CaptureError::NoTarget => "no_target",
            CaptureError::TargetGone(_) => "target_gone",
            CaptureError::AttachFailed { .. } => "attach_failed",
            CaptureError::Handshake(_) => "handshake_failed",
            CaptureError::Shutdown => "shutdown",
        }
    }
}

impl From<CaptureError> for ErrorInfo {
    fn from(err: CaptureError) -> Self {
        ErrorInfo::new(err.code(), err.to_string())
    }
}

/// Failures talking to the backend collector.
#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error("Collector request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Collector returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Collector response malformed: {0}")]
    Malformed(String),

    #[error("Invalid collector URL {url}: {details}")]
    InvalidUrl { url: String, details: String },
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Home directory not found")]
    NoHome,

    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Failed to write config {path}: {details}")]
    Write { path: PathBuf, details: String },
}
