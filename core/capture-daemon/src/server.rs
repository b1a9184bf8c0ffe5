//! Unix-socket IPC server.
//!
//! One request per connection, newline-delimited JSON in both directions.
//! `watch_stats` is the exception: after the first response the connection
//! stays open and receives one line per stats change.

use crawl_capture_protocol::{
    parse_collector_url, parse_settings, parse_settings_patch, parse_source_event,
    parse_source_signal, DetachReason, ErrorInfo, Method, Request, Response, SourceSignal,
    MAX_REQUEST_BYTES, PROTOCOL_VERSION,
};
use serde::Serialize;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use crate::config::save_collector_url;
use crate::event_source::BridgeEventSource;
use crate::reporting::Reporter;
use crate::runtime::CaptureHandle;

const READ_TIMEOUT_SECS: u64 = 2;
const READ_CHUNK_SIZE: usize = 4096;

/// Everything a request handler can reach.
pub struct ServerContext {
    pub capture: CaptureHandle,
    pub bridge: Arc<BridgeEventSource>,
    pub reporter: Arc<dyn Reporter>,
    /// Where `set_collector_url` persists the new URL. `None` keeps it in memory.
    pub config_path: Option<PathBuf>,
}

pub async fn serve(listener: UnixListener, ctx: Arc<ServerContext>) {
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let ctx = Arc::clone(&ctx);
                tokio::spawn(handle_connection(stream, ctx));
            }
            Err(err) => {
                warn!(error = %err, "Failed to accept daemon connection");
            }
        }
    }
}

async fn handle_connection(mut stream: UnixStream, ctx: Arc<ServerContext>) {
    let request = match read_request(&mut stream).await {
        Ok(request) => request,
        Err(err) => {
            warn!(code = %err.code, message = %err.message, "Failed to read request");
            let _ = write_response(&mut stream, &Response::error_with_info(None, err)).await;
            return;
        }
    };

    debug!(method = ?request.method, id = ?request.id, "Daemon request received");
    if request.method == Method::WatchStats && request.protocol_version == PROTOCOL_VERSION {
        watch_stats(stream, request.id, &ctx).await;
        return;
    }

    let response = handle_request(request, &ctx).await;
    let _ = write_response(&mut stream, &response).await;
}

async fn read_request(stream: &mut UnixStream) -> Result<Request, ErrorInfo> {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; READ_CHUNK_SIZE];
    let deadline = Duration::from_secs(READ_TIMEOUT_SECS);

    loop {
        let read = tokio::time::timeout(deadline, stream.read(&mut chunk))
            .await
            .map_err(|_| ErrorInfo::new("read_timeout", "request timed out"))?;
        match read {
            Ok(0) => break,
            Ok(n) => {
                buffer.extend_from_slice(&chunk[..n]);
                if buffer.len() > MAX_REQUEST_BYTES {
                    return Err(ErrorInfo::new(
                        "request_too_large",
                        "request exceeded maximum size",
                    ));
                }
                if chunk[..n].contains(&b'\n') {
                    break;
                }
            }
            Err(err) => {
                return Err(ErrorInfo::new(
                    "read_error",
                    format!("failed to read request: {}", err),
                ));
            }
        }
    }

    let request_bytes = match buffer.iter().position(|b| *b == b'\n') {
        Some(index) => &buffer[..index],
        None => buffer.as_slice(),
    };
    if request_bytes.iter().all(|b| b.is_ascii_whitespace()) {
        return Err(ErrorInfo::new("empty_request", "request body was empty"));
    }

    serde_json::from_slice(request_bytes).map_err(|err| {
        ErrorInfo::new(
            "invalid_json",
            format!("request was not valid JSON: {}", err),
        )
    })
}

async fn write_response(stream: &mut UnixStream, response: &Response) -> std::io::Result<()> {
    let mut line = serde_json::to_vec(response)?;
    line.push(b'\n');
    stream.write_all(&line).await?;
    stream.flush().await
}

pub async fn handle_request(request: Request, ctx: &ServerContext) -> Response {
    if request.protocol_version != PROTOCOL_VERSION {
        return Response::error(
            request.id,
            "protocol_mismatch",
            "unsupported protocol version",
        );
    }

    let id = request.id;
    match request.method {
        Method::GetHealth => {
            let phase = ctx.capture.status().await.ok().map(|status| status.phase);
            Response::ok(
                id,
                serde_json::json!({
                    "status": "ok",
                    "pid": std::process::id(),
                    "version": env!("CARGO_PKG_VERSION"),
                    "protocol_version": PROTOCOL_VERSION,
                    "collector_url": ctx.reporter.base_url(),
                    "phase": phase,
                }),
            )
        }
        Method::GetStatus | Method::WatchStats => match ctx.capture.status().await {
            Ok(status) => to_response(id, &status, "status"),
            Err(err) => Response::error_with_info(id, err.into()),
        },
        Method::StartCapture => {
            let settings = match parse_settings(request.params) {
                Ok(settings) => settings,
                Err(err) => return Response::error_with_info(id, err),
            };
            match ctx.capture.start(settings).await {
                Ok(status) => to_response(
                    id,
                    &serde_json::json!({ "success": true, "status": status }),
                    "start result",
                ),
                Err(err) => Response::error_with_info(id, err.into()),
            }
        }
        Method::StopCapture => match ctx.capture.stop().await {
            Ok(stats) => to_response(
                id,
                &serde_json::json!({ "success": true, "stats": stats }),
                "stop result",
            ),
            Err(err) => Response::error_with_info(id, err.into()),
        },
        Method::UpdateSettings => {
            let patch = match parse_settings_patch(request.params) {
                Ok(patch) => patch,
                Err(err) => return Response::error_with_info(id, err),
            };
            match ctx.capture.update_settings(patch).await {
                Ok(settings) => to_response(id, &settings, "settings"),
                Err(err) => Response::error_with_info(id, err.into()),
            }
        }
        Method::SetCollectorUrl => set_collector_url(id, request.params, ctx),
        Method::CollectorHealth => {
            let collector_url = ctx.reporter.base_url();
            match ctx.reporter.health().await {
                Ok(()) => Response::ok(
                    id,
                    serde_json::json!({ "reachable": true, "collector_url": collector_url }),
                ),
                Err(err) => Response::ok(
                    id,
                    serde_json::json!({
                        "reachable": false,
                        "collector_url": collector_url,
                        "error": err.to_string(),
                    }),
                ),
            }
        }
        Method::SourceEvent => {
            let event = match parse_source_event(request.params) {
                Ok(event) => event,
                Err(err) => return Response::error_with_info(id, err),
            };
            match ctx.capture.network_event(event) {
                Ok(()) => Response::ok(id, serde_json::json!({ "accepted": true })),
                Err(err) => Response::error_with_info(id, err.into()),
            }
        }
        Method::SourceSignal => {
            let signal = match parse_source_signal(request.params) {
                Ok(signal) => signal,
                Err(err) => return Response::error_with_info(id, err),
            };
            match apply_signal(signal, ctx) {
                Ok(()) => Response::ok(id, serde_json::json!({ "accepted": true })),
                Err(err) => Response::error_with_info(id, err),
            }
        }
    }
}

fn set_collector_url(id: Option<String>, params: Option<Value>, ctx: &ServerContext) -> Response {
    let url = match parse_collector_url(params) {
        Ok(url) => url,
        Err(err) => return Response::error_with_info(id, err),
    };
    if let Err(err) = ctx.reporter.set_base_url(&url) {
        return Response::error(id, "invalid_collector_url", err.to_string());
    }

    let persisted = match &ctx.config_path {
        Some(path) => match save_collector_url(path, &url) {
            Ok(()) => true,
            Err(err) => {
                warn!(error = %err, "Failed to persist collector URL");
                false
            }
        },
        None => false,
    };
    info!(collector_url = %url, persisted, "Collector URL updated");
    Response::ok(
        id,
        serde_json::json!({ "collector_url": url, "persisted": persisted }),
    )
}

/// Target bookkeeping happens here; session consequences go to the runtime.
fn apply_signal(signal: SourceSignal, ctx: &ServerContext) -> Result<(), ErrorInfo> {
    let result = match signal {
        SourceSignal::TargetUpdated { target } => {
            let target_handle = target.target_handle.clone();
            if ctx.bridge.upsert_target(target) {
                ctx.capture.navigated(target_handle)
            } else {
                Ok(())
            }
        }
        SourceSignal::TargetRemoved { target_handle } => {
            ctx.bridge.remove_target(&target_handle);
            ctx.capture.detached(target_handle, DetachReason::TargetClosed)
        }
        SourceSignal::Detached {
            target_handle,
            reason,
        } => {
            ctx.bridge.mark_detached(&target_handle);
            ctx.capture.detached(target_handle, reason)
        }
    };
    result.map_err(ErrorInfo::from)
}

async fn watch_stats(mut stream: UnixStream, id: Option<String>, ctx: &ServerContext) {
    // Subscribe before reading status so no update falls in between.
    let mut updates = ctx.capture.subscribe();
    let initial = match ctx.capture.status().await {
        Ok(status) => to_response(id.clone(), &status, "status"),
        Err(err) => Response::error_with_info(id.clone(), err.into()),
    };
    let failed = !initial.ok;
    if write_response(&mut stream, &initial).await.is_err() || failed {
        return;
    }

    loop {
        match updates.recv().await {
            Ok(stats) => {
                let data = serde_json::json!({ "stats": stats });
                let response = to_response(id.clone(), &data, "stats");
                if write_response(&mut stream, &response).await.is_err() {
                    debug!("Stats watcher disconnected");
                    return;
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                debug!(skipped, "Stats watcher lagged; skipping to latest");
            }
            Err(RecvError::Closed) => return,
        }
    }
}

fn to_response<T: Serialize>(id: Option<String>, value: &T, what: &str) -> Response {
    match serde_json::to_value(value) {
        Ok(value) => Response::ok(id, value),
        Err(err) => Response::error(
            id,
            "serialization_error",
            format!("Failed to serialize {}: {}", what, err),
        ),
    }
}
