//! Collector record built from a finished transaction.

use crawl_capture_protocol::HeaderMap;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::correlator::Transaction;
use crate::endpoint::EndpointSignature;

const UNKNOWN_MIME: &str = "unknown";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureRecord {
    pub session_id: String,
    pub url: String,
    pub endpoint: String,
    pub method: String,
    pub status_code: u16,
    pub headers: HeaderMap,
    pub response_headers: HeaderMap,
    pub timestamp: String,
    pub mime_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub post_data: Option<String>,
    pub get_params: Option<Value>,
    pub post_params: Option<Value>,
    pub body_type: String,
}

impl CaptureRecord {
    pub fn from_transaction(
        session_id: &str,
        transaction: Transaction,
        endpoint: &EndpointSignature,
    ) -> Self {
        let response_headers = transaction.response_headers.unwrap_or_default();
        let body_type = header_value(&transaction.request_headers, "content-type")
            .unwrap_or_default()
            .to_string();
        let mime_type = transaction
            .mime_type
            .or_else(|| header_value(&response_headers, "content-type").map(str::to_string))
            .unwrap_or_else(|| UNKNOWN_MIME.to_string());
        let get_params = url::Url::parse(&transaction.url)
            .ok()
            .and_then(|url| collect_params(url.query_pairs()));
        let post_params = transaction
            .request_body
            .as_deref()
            .and_then(|body| parse_body_params(&body_type, body));

        Self {
            session_id: session_id.to_string(),
            url: transaction.url,
            endpoint: endpoint.to_string(),
            method: transaction.method,
            status_code: transaction.status_code.unwrap_or(0),
            headers: transaction.request_headers,
            response_headers,
            timestamp: transaction.timestamp.to_rfc3339(),
            mime_type,
            post_data: transaction.request_body,
            get_params,
            post_params,
            body_type,
        }
    }
}

/// Case-insensitive header lookup.
pub fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

fn parse_body_params(content_type: &str, body: &str) -> Option<Value> {
    let content_type = content_type.to_ascii_lowercase();
    if content_type.contains("application/json") {
        match serde_json::from_str::<Value>(body) {
            Ok(value) => Some(value),
            Err(err) => {
                tracing::debug!(error = %err, "Request body is not valid JSON");
                None
            }
        }
    } else if content_type.contains("application/x-www-form-urlencoded") {
        collect_params(url::form_urlencoded::parse(body.as_bytes()))
    } else {
        None
    }
}

/// Repeated keys collapse into arrays, preserving order.
fn collect_params<'a, I>(pairs: I) -> Option<Value>
where
    I: Iterator<Item = (std::borrow::Cow<'a, str>, std::borrow::Cow<'a, str>)>,
{
    let mut params = Map::new();
    for (key, value) in pairs {
        let value = Value::String(value.into_owned());
        match params.get_mut(key.as_ref()) {
            Some(Value::Array(values)) => values.push(value),
            Some(existing) => {
                let first = existing.take();
                *existing = Value::Array(vec![first, value]);
            }
            None => {
                params.insert(key.into_owned(), value);
            }
        }
    }

    if params.is_empty() {
        None
    } else {
        Some(Value::Object(params))
    }
}
