//! Transaction correlation.
//!
//! Merges the lifecycle events of one request identifier into a single
//! transaction. Each call is one synchronous step over the caller's pending
//! map; nothing here is retained between calls.
//!
//! Per identifier: `unseen → observed → responded → finished | failed`.
//! Events for identifiers that were never admitted are dropped without error.

use chrono::{DateTime, Utc};
use crawl_capture_protocol::{HeaderMap, NetworkEvent};
use std::collections::HashMap;

use crate::scope::CaptureScope;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingTransaction {
    pub request_id: String,
    pub url: String,
    pub method: String,
    pub request_headers: HeaderMap,
    pub request_body: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub status_code: Option<u16>,
    pub response_headers: Option<HeaderMap>,
    pub mime_type: Option<String>,
}

/// A finished request/response pair, removed from the pending map.
pub type Transaction = PendingTransaction;

pub type PendingMap = HashMap<String, PendingTransaction>;

#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(clippy::large_enum_variant)]
pub enum Correlation {
    /// New identifier admitted into the pending map.
    Tracked,
    /// Known identifier updated in place.
    Updated,
    Finished(Transaction),
    /// Pending entry discarded on a load failure.
    Failed,
    /// Rejected by the capture filter; never enters the pending map.
    Filtered,
    /// No pending entry for this identifier.
    Unknown,
}

pub fn correlate(
    pending: &mut PendingMap,
    scope: &CaptureScope,
    event: NetworkEvent,
) -> Correlation {
    match event {
        NetworkEvent::RequestObserved {
            request_id,
            url,
            method,
            headers,
            body,
            timestamp,
        } => {
            if !scope.accepts(&url) {
                // A redirect hop leaving scope takes the whole transaction with it.
                if pending.remove(&request_id).is_some() {
                    return Correlation::Failed;
                }
                return Correlation::Filtered;
            }

            if let Some(existing) = pending.get_mut(&request_id) {
                existing.url = url;
                existing.method = method;
                if !headers.is_empty() {
                    existing.request_headers = headers;
                }
                if body.is_some() {
                    existing.request_body = body;
                }
                existing.status_code = None;
                existing.response_headers = None;
                existing.mime_type = None;
                return Correlation::Updated;
            }

            pending.insert(
                request_id.clone(),
                PendingTransaction {
                    request_id,
                    url,
                    method,
                    request_headers: headers,
                    request_body: body,
                    timestamp,
                    status_code: None,
                    response_headers: None,
                    mime_type: None,
                },
            );
            Correlation::Tracked
        }
        NetworkEvent::RequestHeaders {
            request_id,
            headers,
        } => match pending.get_mut(&request_id) {
            Some(existing) => {
                existing.request_headers = headers;
                Correlation::Updated
            }
            None => Correlation::Unknown,
        },
        NetworkEvent::ResponseReceived {
            request_id,
            status,
            headers,
            mime_type,
        } => match pending.get_mut(&request_id) {
            Some(existing) => {
                existing.status_code = Some(status);
                existing.response_headers = Some(headers);
                existing.mime_type = mime_type.filter(|value| !value.trim().is_empty());
                Correlation::Updated
            }
            None => Correlation::Unknown,
        },
        NetworkEvent::LoadingFinished { request_id } => match pending.remove(&request_id) {
            Some(transaction) => Correlation::Finished(transaction),
            None => Correlation::Unknown,
        },
        NetworkEvent::LoadingFailed { request_id, .. } => match pending.remove(&request_id) {
            Some(_) => Correlation::Failed,
            None => Correlation::Unknown,
        },
    }
}
