//! crawl-captured entrypoint.
//!
//! Binds the IPC socket, resets any snapshot left active by a previous run,
//! and runs the capture runtime until SIGINT/SIGTERM. A live session is
//! stopped (and reported to the collector) before the process exits.

use fs_err as fs;
use std::path::Path;
use std::sync::Arc;
use tokio::net::UnixListener;
use tracing::{error, info, warn};

use crawl_capture_daemon::config::{self, DaemonConfig};
use crawl_capture_daemon::{
    logging, serve, spawn_runtime, BridgeEventSource, EventSource, HttpReporter, Reporter,
    ServerContext, SnapshotStore,
};

#[tokio::main]
async fn main() {
    let _logging_guard = logging::init(config::log_dir().ok().as_deref());

    let daemon_config = match config::load_config(None) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %err, "Failed to load config; using defaults");
            DaemonConfig::default()
        }
    };

    let socket_path = match config::socket_path() {
        Ok(path) => path,
        Err(err) => {
            error!(error = %err, "Failed to resolve daemon socket path");
            std::process::exit(1);
        }
    };
    if let Err(err) = prepare_socket(&socket_path) {
        error!(error = %err, path = %socket_path.display(), "Failed to prepare daemon socket");
        std::process::exit(1);
    }
    let listener = match UnixListener::bind(&socket_path) {
        Ok(listener) => listener,
        Err(err) => {
            error!(error = %err, path = %socket_path.display(), "Failed to bind daemon socket");
            std::process::exit(1);
        }
    };

    let mut store = match config::snapshot_path() {
        Ok(path) => SnapshotStore::new(&path),
        Err(err) => {
            warn!(error = %err, "Failed to resolve snapshot path; keeping state in memory");
            SnapshotStore::new_in_memory()
        }
    };
    if let Err(err) = store.reset_stale() {
        warn!(error = %err, "Failed to reset stale session snapshot");
    }

    let reporter: Arc<dyn Reporter> = match HttpReporter::new(
        &daemon_config.collector_url,
        daemon_config.request_timeout(),
    ) {
        Ok(reporter) => Arc::new(reporter),
        Err(err) => {
            error!(error = %err, "Failed to build collector client");
            std::process::exit(1);
        }
    };

    let bridge = Arc::new(BridgeEventSource::new());
    let source: Arc<dyn EventSource> = bridge.clone();
    let (capture, runtime_task) = spawn_runtime(
        store,
        source,
        Arc::clone(&reporter),
        daemon_config.reattach_delay(),
    );

    let ctx = Arc::new(ServerContext {
        capture: capture.clone(),
        bridge,
        reporter,
        config_path: config::config_path().ok(),
    });

    info!(
        path = %socket_path.display(),
        collector_url = %daemon_config.collector_url,
        "Crawl capture daemon started"
    );

    tokio::select! {
        _ = serve(listener, ctx) => {}
        _ = shutdown_signal() => {}
    }

    if let Err(err) = capture.shutdown().await {
        warn!(error = %err, "Capture runtime did not shut down cleanly");
    }
    if let Err(err) = runtime_task.await {
        warn!(error = %err, "Capture runtime task failed");
    }
    if let Err(err) = fs::remove_file(&socket_path) {
        warn!(error = %err, "Failed to remove daemon socket");
    }
    info!("Crawl capture daemon stopped");
}

fn prepare_socket(socket_path: &Path) -> Result<(), String> {
    let parent = socket_path
        .parent()
        .ok_or_else(|| "Socket path has no parent".to_string())?;
    fs::create_dir_all(parent)
        .map_err(|err| format!("Failed to create socket directory: {}", err))?;
    if socket_path.exists() {
        fs::remove_file(socket_path)
            .map_err(|err| format!("Failed to remove existing socket: {}", err))?;
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
