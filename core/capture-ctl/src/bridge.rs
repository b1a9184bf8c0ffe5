//! Event-source bridge: forwards newline-delimited JSON from an
//! instrumentation process to the daemon.
//!
//! Each line is either a network event
//! (`{"target_handle": "...", "event": {"kind": ...}}`) or a target signal
//! (`{"signal": "target_updated" | "target_removed" | "detached", ...}`).
//! Malformed lines are logged and skipped; losing the daemon ends the bridge.

use crawl_capture_protocol::{parse_source_event, parse_source_signal, ErrorInfo, Method};
use serde_json::Value;
use std::io::BufRead;
use tracing::{debug, warn};

use crate::daemon_client::{ClientError, DaemonClient};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BridgeSummary {
    pub forwarded: usize,
    pub skipped: usize,
    pub rejected: usize,
}

/// Decides which daemon method a line belongs to and validates it locally.
pub fn classify(line: &str) -> Result<(Method, Value), ErrorInfo> {
    let value: Value = serde_json::from_str(line)
        .map_err(|err| ErrorInfo::new("invalid_json", format!("line is not JSON: {}", err)))?;

    if value.get("signal").is_some() {
        parse_source_signal(Some(value.clone()))?;
        Ok((Method::SourceSignal, value))
    } else if value.get("event").is_some() {
        parse_source_event(Some(value.clone()))?;
        Ok((Method::SourceEvent, value))
    } else {
        Err(ErrorInfo::new(
            "unknown_line",
            "line is neither an event nor a signal",
        ))
    }
}

pub fn run<R: BufRead>(input: R, client: &DaemonClient) -> Result<BridgeSummary, ClientError> {
    let mut summary = BridgeSummary::default();

    for (index, line) in input.lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let (method, params) = match classify(trimmed) {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!(line = index + 1, error = %err, "Skipping bridge line");
                summary.skipped += 1;
                continue;
            }
        };

        match client.call_with_retry(method, Some(params)) {
            Ok(_) => {
                debug!(line = index + 1, method = ?method, "Forwarded");
                summary.forwarded += 1;
            }
            Err(ClientError::Daemon(err)) => {
                warn!(line = index + 1, error = %err, "Daemon rejected bridge line");
                summary.rejected += 1;
            }
            Err(err) => return Err(err),
        }
    }

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_events_and_signals() {
        let (method, _) = classify(
            r#"{"target_handle":"tab-1","event":{"kind":"loading_finished","request_id":"r1"}}"#,
        )
        .expect("event");
        assert_eq!(method, Method::SourceEvent);

        let (method, _) = classify(
            r#"{"signal":"detached","target_handle":"tab-1","reason":"target-closed"}"#,
        )
        .expect("signal");
        assert_eq!(method, Method::SourceSignal);
    }

    #[test]
    fn rejects_malformed_lines() {
        assert_eq!(classify("{oops").unwrap_err().code, "invalid_json");
        assert_eq!(classify(r#"{"hello":1}"#).unwrap_err().code, "unknown_line");
        assert!(classify(
            r#"{"target_handle":"","event":{"kind":"loading_finished","request_id":"r1"}}"#
        )
        .is_err());
        assert!(classify(r#"{"signal":"navigated","target_handle":"tab-1"}"#).is_err());
    }

    #[test]
    fn blank_and_invalid_lines_never_reach_the_daemon() {
        let dir = tempfile::tempdir().unwrap();
        let client = DaemonClient::new(dir.path().join("absent.sock"));
        let input = "\n{oops}\n   \n{\"hello\":1}\n";

        let summary = run(input.as_bytes(), &client).expect("no daemon calls");
        assert_eq!(
            summary,
            BridgeSummary {
                forwarded: 0,
                skipped: 2,
                rejected: 0,
            }
        );
    }

    #[test]
    fn missing_daemon_ends_the_bridge() {
        let dir = tempfile::tempdir().unwrap();
        let client = DaemonClient::new(dir.path().join("absent.sock"));
        let input = r#"{"target_handle":"tab-1","event":{"kind":"loading_finished","request_id":"r1"}}"#;

        assert!(matches!(
            run(input.as_bytes(), &client),
            Err(ClientError::Connect { .. })
        ));
    }
}
