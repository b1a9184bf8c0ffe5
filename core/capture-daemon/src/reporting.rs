//! Backend collector client.
//!
//! `notify_start` is the only call whose failure matters: it aborts the
//! session start. Stop notifications and transaction pushes are fire-and-forget
//! from the session's point of view; the caller logs failures and moves on.
//! There is no retry queue, so each transaction is delivered at most once.

use async_trait::async_trait;
use crawl_capture_protocol::CaptureStats;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::RwLock;
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::error::ReportError;
use crate::record::CaptureRecord;

const START_PATH: &str = "capture/start";
const STOP_PATH: &str = "capture/stop";
const RECORD_PATH: &str = "capture/record";
const HEALTH_PATH: &str = "health";
const MAX_ERROR_BODY_CHARS: usize = 512;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartMeta {
    pub target_url: String,
    pub scope_target_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartAck {
    pub session_id: String,
    #[serde(default)]
    pub scope_target_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WireStats {
    request_count: u64,
    endpoint_count: u64,
}

impl From<CaptureStats> for WireStats {
    fn from(stats: CaptureStats) -> Self {
        Self {
            request_count: stats.request_count,
            endpoint_count: stats.endpoint_count,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StopBody<'a> {
    session_id: &'a str,
    stats: WireStats,
}

#[async_trait]
pub trait Reporter: Send + Sync {
    async fn notify_start(&self, meta: &StartMeta) -> Result<StartAck, ReportError>;

    async fn notify_stop(&self, session_id: &str, stats: CaptureStats) -> Result<(), ReportError>;

    async fn push_transaction(&self, record: &CaptureRecord) -> Result<(), ReportError>;

    async fn health(&self) -> Result<(), ReportError>;

    /// Points subsequent calls at a different collector.
    fn set_base_url(&self, base_url: &str) -> Result<(), ReportError>;

    fn base_url(&self) -> String;
}

pub struct HttpReporter {
    client: Client,
    base_url: RwLock<Url>,
}

impl HttpReporter {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ReportError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: RwLock::new(parse_base_url(base_url)?),
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, ReportError> {
        let base = self
            .base_url
            .read()
            .map(|url| url.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone());
        base.join(path).map_err(|err| ReportError::InvalidUrl {
            url: format!("{}{}", base, path),
            details: err.to_string(),
        })
    }

    async fn post<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<reqwest::Response, ReportError> {
        let url = self.endpoint(path)?;
        debug!(url = %url, "Collector POST");
        let response = self.client.post(url).json(body).send().await?;
        ensure_success(response).await
    }
}

#[async_trait]
impl Reporter for HttpReporter {
    async fn notify_start(&self, meta: &StartMeta) -> Result<StartAck, ReportError> {
        let response = self.post(START_PATH, meta).await?;
        let ack: StartAck = response
            .json()
            .await
            .map_err(|err| ReportError::Malformed(err.to_string()))?;
        if ack.session_id.trim().is_empty() {
            return Err(ReportError::Malformed(
                "sessionId missing from start response".to_string(),
            ));
        }
        Ok(ack)
    }

    async fn notify_stop(&self, session_id: &str, stats: CaptureStats) -> Result<(), ReportError> {
        let body = StopBody {
            session_id,
            stats: stats.into(),
        };
        self.post(STOP_PATH, &body).await.map(|_| ())
    }

    async fn push_transaction(&self, record: &CaptureRecord) -> Result<(), ReportError> {
        self.post(RECORD_PATH, record).await.map(|_| ())
    }

    async fn health(&self) -> Result<(), ReportError> {
        let url = self.endpoint(HEALTH_PATH)?;
        let response = self.client.get(url).send().await?;
        ensure_success(response).await.map(|_| ())
    }

    fn set_base_url(&self, base_url: &str) -> Result<(), ReportError> {
        let parsed = parse_base_url(base_url)?;
        match self.base_url.write() {
            Ok(mut guard) => *guard = parsed,
            Err(poisoned) => *poisoned.into_inner() = parsed,
        }
        Ok(())
    }

    fn base_url(&self) -> String {
        self.base_url
            .read()
            .map(|url| url.to_string())
            .unwrap_or_else(|poisoned| poisoned.into_inner().to_string())
    }
}

/// `Url::join` replaces the last segment unless the base ends in `/`.
fn parse_base_url(base_url: &str) -> Result<Url, ReportError> {
    let trimmed = base_url.trim().trim_end_matches('/');
    let url = Url::parse(&format!("{}/", trimmed)).map_err(|err| ReportError::InvalidUrl {
        url: base_url.to_string(),
        details: err.to_string(),
    })?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ReportError::InvalidUrl {
            url: base_url.to_string(),
            details: "collector URL must use http or https".to_string(),
        });
    }
    Ok(url)
}

async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, ReportError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ReportError::Status {
        status: status.as_u16(),
        body: body.chars().take(MAX_ERROR_BODY_CHARS).collect(),
    })
}
