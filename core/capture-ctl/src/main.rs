//! crawl-capture: control surface for the crawl capture daemon.
//!
//! ## Subcommands
//!
//! - `start` / `stop` / `status` / `settings`: session control
//! - `collector-url` / `health`: collector configuration and reachability
//! - `watch`: stream stats updates as JSON lines
//! - `bridge`: forward event-source JSON lines (stdin or file) to the daemon

mod bridge;
mod daemon_client;

use clap::{Parser, Subcommand};
use crawl_capture_daemon::config;
use crawl_capture_daemon::{read_snapshot, ConfigError};
use crawl_capture_protocol::{CaptureSettings, Method, SettingsPatch};
use fs_err as fs;
use serde_json::Value;
use std::io::BufReader;
use std::path::PathBuf;

use daemon_client::{ClientError, DaemonClient, SLOW_READ_TIMEOUT};

#[derive(Parser)]
#[command(name = "crawl-capture")]
#[command(about = "Control the crawl capture daemon")]
#[command(version)]
struct Cli {
    /// Daemon socket (defaults to $CRAWL_CAPTURE_SOCKET or ~/.crawl-capture/daemon.sock)
    #[arg(long, global = true, value_name = "PATH")]
    socket: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start capturing traffic for a site
    Start {
        /// Page URL whose host defines the capture scope
        #[arg(value_name = "URL")]
        target_url: String,

        /// Identifier the collector should file this session under
        #[arg(long)]
        scope_target_id: Option<String>,

        /// Only capture the exact host, not its subdomains
        #[arg(long)]
        no_subdomains: bool,

        /// Also capture scripts, styles, images and fonts
        #[arg(long)]
        static_assets: bool,
    },

    /// Stop the running session and print its final stats
    Stop,

    /// Show session status
    Status {
        /// Read the persisted snapshot instead of asking the daemon
        #[arg(long)]
        offline: bool,
    },

    /// Change capture filters on the running session
    Settings {
        #[arg(long, value_name = "BOOL")]
        include_subdomains: Option<bool>,

        #[arg(long, value_name = "BOOL")]
        capture_static_assets: Option<bool>,
    },

    /// Point the daemon at a different collector (persisted to config.toml)
    CollectorUrl {
        #[arg(value_name = "URL")]
        url: String,
    },

    /// Check daemon and collector reachability
    Health,

    /// Stream stats updates until interrupted
    Watch,

    /// Forward event-source JSON lines to the daemon
    Bridge {
        /// Read lines from a file instead of stdin
        #[arg(long, value_name = "PATH")]
        input: Option<PathBuf>,
    },
}

#[derive(Debug, thiserror::Error)]
enum CtlError {
    #[error(transparent)]
    Client(#[from] ClientError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(crawl_capture_daemon::logging::env_filter())
        .with_writer(std::io::stderr)
        .init();
    let cli = Cli::parse();

    if let Err(err) = run(cli) {
        eprintln!("crawl-capture: {}", err);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), CtlError> {
    let socket = match cli.socket {
        Some(path) => path,
        None => config::socket_path()?,
    };
    let client = DaemonClient::new(socket);

    match cli.command {
        Commands::Start {
            target_url,
            scope_target_id,
            no_subdomains,
            static_assets,
        } => {
            let settings = CaptureSettings {
                target_url,
                scope_target_id,
                include_subdomains: !no_subdomains,
                capture_static_assets: static_assets,
            };
            let params = to_params(&settings)?;
            let data = client
                .with_read_timeout(SLOW_READ_TIMEOUT)
                .call(Method::StartCapture, Some(params))?;
            print_json(&data);
        }
        Commands::Stop => {
            let data = client
                .with_read_timeout(SLOW_READ_TIMEOUT)
                .call(Method::StopCapture, None)?;
            print_json(&data);
        }
        Commands::Status { offline } => status(&client, offline)?,
        Commands::Settings {
            include_subdomains,
            capture_static_assets,
        } => {
            let patch = SettingsPatch {
                include_subdomains,
                capture_static_assets,
            };
            let data = client.call(Method::UpdateSettings, Some(to_params(&patch)?))?;
            print_json(&data);
        }
        Commands::CollectorUrl { url } => {
            let params = serde_json::json!({ "collector_url": url });
            let data = client.call(Method::SetCollectorUrl, Some(params))?;
            print_json(&data);
        }
        Commands::Health => {
            let daemon = client.call_with_retry(Method::GetHealth, None)?;
            let collector = client
                .with_read_timeout(SLOW_READ_TIMEOUT)
                .call(Method::CollectorHealth, None)?;
            print_json(&serde_json::json!({ "daemon": daemon, "collector": collector }));
        }
        Commands::Watch => {
            client.watch(|update| {
                println!("{}", update);
                true
            })?;
        }
        Commands::Bridge { input } => {
            let summary = match input {
                Some(path) => bridge::run(BufReader::new(fs::File::open(path)?), &client)?,
                None => bridge::run(std::io::stdin().lock(), &client)?,
            };
            tracing::info!(
                forwarded = summary.forwarded,
                skipped = summary.skipped,
                rejected = summary.rejected,
                "Bridge input finished"
            );
        }
    }

    Ok(())
}

/// Falls back to the persisted snapshot when the daemon is not running.
fn status(client: &DaemonClient, offline: bool) -> Result<(), CtlError> {
    if !offline {
        match client.call_with_retry(Method::GetStatus, None) {
            Ok(data) => {
                print_json(&data);
                return Ok(());
            }
            Err(err @ ClientError::Connect { .. }) => {
                tracing::warn!(error = %err, "Daemon unreachable; reading persisted snapshot");
            }
            Err(err) => return Err(err.into()),
        }
    }

    let snapshot = read_snapshot(&config::snapshot_path()?);
    let mut data = serde_json::to_value(&snapshot).unwrap_or(Value::Null);
    if let Some(object) = data.as_object_mut() {
        object.insert("source".to_string(), Value::String("snapshot".to_string()));
    }
    print_json(&data);
    Ok(())
}

fn to_params<T: serde::Serialize>(value: &T) -> Result<Value, CtlError> {
    serde_json::to_value(value).map_err(|err| CtlError::Io(err.into()))
}

fn print_json(value: &Value) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{}", text),
        Err(_) => println!("{}", value),
    }
}
