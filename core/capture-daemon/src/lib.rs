//! Crawl capture daemon.
//!
//! Owns a single capture session at a time. Network events and target signals
//! arrive over the IPC socket from an event-source bridge; finished, in-scope
//! transactions are canonicalized, counted, and pushed to the collector.

pub mod config;
pub mod correlator;
pub mod endpoint;
pub mod error;
pub mod event_source;
pub mod logging;
pub mod record;
pub mod reporting;
pub mod runtime;
pub mod scope;
pub mod server;
pub mod session;
pub mod store;

pub use config::DaemonConfig;
pub use endpoint::{canonicalize, EndpointSignature};
pub use error::{CaptureError, ConfigError, ReportError};
pub use event_source::{BridgeEventSource, EventSource};
pub use record::CaptureRecord;
pub use reporting::{HttpReporter, Reporter, StartAck, StartMeta};
pub use runtime::{spawn_runtime, CaptureHandle};
pub use scope::CaptureScope;
pub use server::{serve, ServerContext};
pub use store::{read_snapshot, SnapshotStore};
