//! Blocking client for the capture daemon socket.
//!
//! One request per connection. Failures are surfaced to the caller; nothing
//! here falls back to reading state files.

use crawl_capture_protocol::{ErrorInfo, Method, Request, Response, MAX_REQUEST_BYTES};
use serde_json::Value;
use std::io::{BufRead, BufReader, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::time::Duration;

const READ_TIMEOUT_MS: u64 = 2_000;
const WRITE_TIMEOUT_MS: u64 = 600;
const RETRY_DELAY_MS: u64 = 50;

/// Start and stop wait on the collector; allow for its request timeout.
pub const SLOW_READ_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Failed to connect to daemon socket {path}: {source}")]
    Connect {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Daemon I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Daemon protocol error: {0}")]
    Protocol(String),

    #[error("{0}")]
    Daemon(ErrorInfo),
}

impl ClientError {
    /// Only a failed connect is retried. Once the request may have been
    /// written, resending could deliver it twice.
    fn is_transient(&self) -> bool {
        matches!(self, ClientError::Connect { .. })
    }
}

pub struct DaemonClient {
    socket: PathBuf,
    read_timeout: Duration,
}

impl DaemonClient {
    pub fn new(socket: PathBuf) -> Self {
        Self {
            socket,
            read_timeout: Duration::from_millis(READ_TIMEOUT_MS),
        }
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn call(&self, method: Method, params: Option<Value>) -> Result<Value, ClientError> {
        let mut stream = self.connect()?;
        write_request(&mut stream, method, params)?;
        read_response(&mut stream).and_then(into_data)
    }

    pub fn call_with_retry(
        &self,
        method: Method,
        params: Option<Value>,
    ) -> Result<Value, ClientError> {
        match self.call(method, params.clone()) {
            Err(err) if err.is_transient() => {
                tracing::warn!(error = %err, method = ?method, "Daemon request failed; retrying");
                std::thread::sleep(Duration::from_millis(RETRY_DELAY_MS));
                self.call(method, params)
            }
            result => result,
        }
    }

    /// Streams `watch_stats` lines to `on_update` until the daemon closes the
    /// connection or `on_update` returns false.
    pub fn watch<F>(&self, mut on_update: F) -> Result<(), ClientError>
    where
        F: FnMut(Value) -> bool,
    {
        let mut stream = self.connect()?;
        // Updates arrive only when stats change.
        stream.set_read_timeout(None)?;
        write_request(&mut stream, Method::WatchStats, None)?;

        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        loop {
            line.clear();
            if reader.read_line(&mut line)? == 0 {
                return Ok(());
            }
            if line.trim().is_empty() {
                continue;
            }
            let response: Response = serde_json::from_str(line.trim())
                .map_err(|err| ClientError::Protocol(format!("Invalid stats line: {}", err)))?;
            if !on_update(into_data(response)?) {
                return Ok(());
            }
        }
    }

    fn connect(&self) -> Result<UnixStream, ClientError> {
        let stream = UnixStream::connect(&self.socket).map_err(|source| ClientError::Connect {
            path: self.socket.clone(),
            source,
        })?;
        let _ = stream.set_read_timeout(Some(self.read_timeout));
        let _ = stream.set_write_timeout(Some(Duration::from_millis(WRITE_TIMEOUT_MS)));
        Ok(stream)
    }
}

fn write_request(
    stream: &mut UnixStream,
    method: Method,
    params: Option<Value>,
) -> Result<(), ClientError> {
    let request = Request::new(method, Some(request_id(method)), params);
    let mut payload = serde_json::to_vec(&request)
        .map_err(|err| ClientError::Protocol(format!("Failed to serialize request: {}", err)))?;
    payload.push(b'\n');
    stream.write_all(&payload)?;
    stream.flush()?;
    Ok(())
}

fn read_response(stream: &mut UnixStream) -> Result<Response, ClientError> {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 4096];

    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                buffer.extend_from_slice(&chunk[..n]);
                if buffer.len() > MAX_REQUEST_BYTES {
                    return Err(ClientError::Protocol(
                        "Response exceeded maximum size".to_string(),
                    ));
                }
                if chunk[..n].contains(&b'\n') {
                    break;
                }
            }
            Err(err)
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                return Err(ClientError::Protocol(
                    "Timed out waiting for daemon response".to_string(),
                ));
            }
            Err(err) => return Err(ClientError::Io(err)),
        }
    }

    let response_bytes = match buffer.iter().position(|b| *b == b'\n') {
        Some(index) => &buffer[..index],
        None => buffer.as_slice(),
    };
    if response_bytes.is_empty() {
        return Err(ClientError::Protocol("Daemon response was empty".to_string()));
    }

    serde_json::from_slice(response_bytes)
        .map_err(|err| ClientError::Protocol(format!("Failed to parse response JSON: {}", err)))
}

fn into_data(response: Response) -> Result<Value, ClientError> {
    if response.ok {
        return Ok(response.data.unwrap_or(Value::Null));
    }
    Err(ClientError::Daemon(response.error.unwrap_or_else(|| {
        ErrorInfo::new("unknown", "Unknown daemon error")
    })))
}

fn request_id(method: Method) -> String {
    format!("ctl-{:?}-{}", method, std::process::id()).to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixListener;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Instant;

    fn read_request(stream: &mut UnixStream) -> Option<Request> {
        let mut line = String::new();
        BufReader::new(stream).read_line(&mut line).ok()?;
        serde_json::from_str(line.trim()).ok()
    }

    fn respond(stream: &mut UnixStream, response: &Response) {
        let mut payload = serde_json::to_vec(response).unwrap();
        payload.push(b'\n');
        let _ = stream.write_all(&payload);
    }

    /// Serves `responses` in order, one connection each.
    fn fake_daemon(
        socket: PathBuf,
        responses: Vec<Response>,
    ) -> (std::thread::JoinHandle<Vec<Request>>, Arc<AtomicUsize>) {
        let listener = UnixListener::bind(&socket).unwrap();
        listener.set_nonblocking(true).unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let accepted_clone = Arc::clone(&accepted);

        let server = std::thread::spawn(move || {
            let start = Instant::now();
            let mut seen = Vec::new();
            let mut responses = responses.into_iter();
            while start.elapsed() < Duration::from_secs(5) {
                match listener.accept() {
                    Ok((mut stream, _)) => {
                        stream.set_nonblocking(false).unwrap();
                        accepted_clone.fetch_add(1, Ordering::SeqCst);
                        if let Some(request) = read_request(&mut stream) {
                            seen.push(request);
                        }
                        match responses.next() {
                            Some(response) => respond(&mut stream, &response),
                            None => break,
                        }
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                        if responses.len() == 0 {
                            break;
                        }
                        std::thread::sleep(Duration::from_millis(10));
                    }
                    Err(_) => break,
                }
            }
            seen
        });
        (server, accepted)
    }

    #[test]
    fn call_returns_data_on_success() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("daemon.sock");
        let (server, _) = fake_daemon(
            socket.clone(),
            vec![Response::ok(None, serde_json::json!({ "status": "ok" }))],
        );

        let data = DaemonClient::new(socket)
            .call(Method::GetHealth, None)
            .expect("health");
        assert_eq!(data["status"], "ok");

        let seen = server.join().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].method, Method::GetHealth);
    }

    #[test]
    fn daemon_errors_are_not_retried() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("daemon.sock");
        let (server, accepted) = fake_daemon(
            socket.clone(),
            vec![Response::error(None, "not_active", "No active capture session")],
        );

        let err = DaemonClient::new(socket)
            .call_with_retry(Method::StopCapture, None)
            .unwrap_err();
        match err {
            ClientError::Daemon(info) => assert_eq!(info.code, "not_active"),
            other => panic!("expected daemon error, got {:?}", other),
        }

        server.join().unwrap();
        assert_eq!(accepted.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dropped_connection_after_request_is_not_resent() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("daemon.sock");
        let listener = UnixListener::bind(&socket).unwrap();
        listener.set_nonblocking(true).unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let accepted_clone = Arc::clone(&accepted);

        let server = std::thread::spawn(move || {
            let start = Instant::now();
            while start.elapsed() < Duration::from_millis(500) {
                match listener.accept() {
                    Ok((mut stream, _)) => {
                        stream.set_nonblocking(false).unwrap();
                        accepted_clone.fetch_add(1, Ordering::SeqCst);
                        let _ = read_request(&mut stream);
                        // Hang up without answering.
                    }
                    Err(_) => std::thread::sleep(Duration::from_millis(10)),
                }
            }
        });

        let err = DaemonClient::new(socket)
            .call_with_retry(Method::SourceEvent, None)
            .unwrap_err();
        assert!(!matches!(err, ClientError::Connect { .. }));

        server.join().unwrap();
        assert_eq!(accepted.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn missing_socket_is_a_connect_error() {
        let dir = tempfile::tempdir().unwrap();
        let client = DaemonClient::new(dir.path().join("absent.sock"));
        assert!(matches!(
            client.call_with_retry(Method::GetStatus, None),
            Err(ClientError::Connect { .. })
        ));
    }

    #[test]
    fn watch_stops_when_callback_declines() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("daemon.sock");
        let listener = UnixListener::bind(&socket).unwrap();
        let server = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let request = read_request(&mut stream).unwrap();
            assert_eq!(request.method, Method::WatchStats);
            for count in 0..3 {
                respond(
                    &mut stream,
                    &Response::ok(
                        None,
                        serde_json::json!({
                            "stats": { "request_count": count, "endpoint_count": 0 }
                        }),
                    ),
                );
            }
        });

        let mut seen = 0;
        DaemonClient::new(socket)
            .watch(|_| {
                seen += 1;
                seen < 2
            })
            .expect("watch");
        assert_eq!(seen, 2);
        server.join().unwrap();
    }
}
