//! Capture runtime.
//!
//! One tokio task owns the [`CaptureSession`] and processes commands strictly
//! in arrival order. Nothing awaits on that task: attach, handshake, detach,
//! and collector calls run in spawned tasks that post their result back as a
//! command tagged with the session epoch.

use crawl_capture_protocol::{
    CaptureSettings, CaptureStats, DetachReason, NetworkEvent, SessionSnapshot, SessionStatus,
    SettingsPatch, SourceEvent,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::CaptureError;
use crate::event_source::EventSource;
use crate::record::CaptureRecord;
use crate::reporting::{Reporter, StartAck, StartMeta};
use crate::session::{
    CaptureSession, DetachAction, EventOutcome, NavigateAction, ReattachOutcome, ReattachResult,
    SessionState, StopTicket,
};
use crate::store::SnapshotStore;

const STATS_CHANNEL_CAPACITY: usize = 64;

type StartReply = oneshot::Sender<Result<SessionStatus, CaptureError>>;
type StopReply = oneshot::Sender<Result<CaptureStats, CaptureError>>;

enum Command {
    Start {
        settings: CaptureSettings,
        reply: StartReply,
    },
    Stop {
        reply: StopReply,
    },
    UpdateSettings {
        patch: SettingsPatch,
        reply: oneshot::Sender<Result<CaptureSettings, CaptureError>>,
    },
    Status {
        reply: oneshot::Sender<SessionStatus>,
    },
    Network(SourceEvent),
    Detached {
        target_handle: String,
        reason: DetachReason,
    },
    Navigated {
        target_handle: String,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },

    // Completions from spawned I/O.
    StartFinished {
        epoch: u64,
        result: Result<(String, StartAck), CaptureError>,
    },
    StopFinished {
        epoch: u64,
    },
    ReattachDue {
        epoch: u64,
    },
    ReattachFinished {
        epoch: u64,
        outcome: ReattachOutcome,
    },
}

/// Cloneable client for the capture runtime.
#[derive(Clone)]
pub struct CaptureHandle {
    tx: mpsc::UnboundedSender<Command>,
    stats_tx: broadcast::Sender<CaptureStats>,
}

impl CaptureHandle {
    pub async fn start(&self, settings: CaptureSettings) -> Result<SessionStatus, CaptureError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Start { settings, reply })?;
        rx.await.map_err(|_| CaptureError::Shutdown)?
    }

    /// Ends the session and returns its final stats. A second call while the
    /// first is still finishing fails with `NotActive`.
    pub async fn stop(&self) -> Result<CaptureStats, CaptureError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Stop { reply })?;
        rx.await.map_err(|_| CaptureError::Shutdown)?
    }

    pub async fn update_settings(
        &self,
        patch: SettingsPatch,
    ) -> Result<CaptureSettings, CaptureError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::UpdateSettings { patch, reply })?;
        rx.await.map_err(|_| CaptureError::Shutdown)?
    }

    pub async fn status(&self) -> Result<SessionStatus, CaptureError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Status { reply })?;
        rx.await.map_err(|_| CaptureError::Shutdown)
    }

    pub fn network_event(&self, event: SourceEvent) -> Result<(), CaptureError> {
        self.send(Command::Network(event))
    }

    pub fn detached(
        &self,
        target_handle: String,
        reason: DetachReason,
    ) -> Result<(), CaptureError> {
        self.send(Command::Detached {
            target_handle,
            reason,
        })
    }

    pub fn navigated(&self, target_handle: String) -> Result<(), CaptureError> {
        self.send(Command::Navigated { target_handle })
    }

    /// Stats updates, one per counted transaction plus re-signals after
    /// reattach and navigation.
    pub fn subscribe(&self) -> broadcast::Receiver<CaptureStats> {
        self.stats_tx.subscribe()
    }

    /// Stops any live session, then ends the runtime task.
    pub async fn shutdown(&self) -> Result<(), CaptureError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Shutdown { reply })?;
        rx.await.map_err(|_| CaptureError::Shutdown)
    }

    fn send(&self, command: Command) -> Result<(), CaptureError> {
        self.tx.send(command).map_err(|_| CaptureError::Shutdown)
    }
}

/// Spawns the runtime task. Must be called from within a tokio runtime.
pub fn spawn_runtime(
    store: SnapshotStore,
    source: Arc<dyn EventSource>,
    reporter: Arc<dyn Reporter>,
    reattach_delay: Duration,
) -> (CaptureHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let (stats_tx, _) = broadcast::channel(STATS_CHANNEL_CAPACITY);

    let actor = CaptureActor {
        session: CaptureSession::new(),
        store,
        source,
        reporter,
        stats_tx: stats_tx.clone(),
        self_tx: tx.downgrade(),
        reattach_delay,
        pending_start: None,
        stop_waiters: Vec::new(),
        shutdown: None,
    };
    let task = tokio::spawn(actor.run(rx));

    (CaptureHandle { tx, stats_tx }, task)
}

struct CaptureActor {
    session: CaptureSession,
    store: SnapshotStore,
    source: Arc<dyn EventSource>,
    reporter: Arc<dyn Reporter>,
    stats_tx: broadcast::Sender<CaptureStats>,
    self_tx: mpsc::WeakUnboundedSender<Command>,
    reattach_delay: Duration,
    pending_start: Option<StartReply>,
    stop_waiters: Vec<StopReply>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl CaptureActor {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = rx.recv().await {
            self.dispatch(command);
            if self.shutdown_complete() {
                break;
            }
        }
        debug!("Capture runtime stopped");
    }

    fn dispatch(&mut self, command: Command) {
        match command {
            Command::Start { settings, reply } => self.start(settings, reply),
            Command::Stop { reply } => {
                self.begin_stop(Some(reply));
            }
            Command::UpdateSettings { patch, reply } => {
                let result = self.session.update_settings(&patch);
                if let Ok(settings) = &result {
                    info!(
                        include_subdomains = settings.include_subdomains,
                        capture_static_assets = settings.capture_static_assets,
                        "Capture settings updated"
                    );
                }
                let _ = reply.send(result);
            }
            Command::Status { reply } => {
                let _ = reply.send(self.session.status());
            }
            Command::Network(SourceEvent {
                target_handle,
                event,
            }) => self.network_event(&target_handle, event),
            Command::Detached {
                target_handle,
                reason,
            } => self.detached(&target_handle, reason),
            Command::Navigated { target_handle } => match self.session.on_navigated(&target_handle)
            {
                NavigateAction::Resignal(stats) => self.publish_stats(stats),
                NavigateAction::Reattach { epoch } => self.attempt_reattach(epoch),
                NavigateAction::Ignore => {}
            },
            Command::Shutdown { reply } => {
                info!("Capture runtime shutting down");
                self.shutdown = Some(reply);
            }
            Command::StartFinished { epoch, result } => self.start_finished(epoch, result),
            Command::StopFinished { epoch } => self.stop_finished(epoch),
            Command::ReattachDue { epoch } => self.attempt_reattach(epoch),
            Command::ReattachFinished { epoch, outcome } => self.reattach_finished(epoch, outcome),
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Start
    // ─────────────────────────────────────────────────────────────────────

    fn start(&mut self, settings: CaptureSettings, reply: StartReply) {
        if self.shutdown.is_some() {
            let _ = reply.send(Err(CaptureError::Shutdown));
            return;
        }
        let epoch = match self.session.begin_start(settings.clone()) {
            Ok(epoch) => epoch,
            Err(err) => {
                let _ = reply.send(Err(err));
                return;
            }
        };
        info!(target_url = %settings.target_url, epoch, "Starting capture session");
        self.pending_start = Some(reply);

        let source = Arc::clone(&self.source);
        let reporter = Arc::clone(&self.reporter);
        let tx = self.self_tx.clone();
        tokio::spawn(async move {
            let result = run_start(source.as_ref(), reporter.as_ref(), &settings).await;
            post(&tx, Command::StartFinished { epoch, result });
        });
    }

    fn start_finished(&mut self, epoch: u64, result: Result<(String, StartAck), CaptureError>) {
        match result {
            Ok((target, ack)) => {
                if !self.session.complete_start(epoch, target.clone(), ack) {
                    warn!(epoch, target = %target, "Discarding stale start completion");
                    self.spawn_detach(target);
                    return;
                }
                if let Some(reason) = self.session.take_start_detach() {
                    self.start_interrupted(target, reason);
                    return;
                }
                self.persist();
                self.publish_stats(self.session.stats());
                if let Some(reply) = self.pending_start.take() {
                    let _ = reply.send(Ok(self.session.status()));
                }
            }
            Err(err) => {
                if !self.session.abort_start(epoch) {
                    return;
                }
                warn!(error = %err, "Capture session failed to start");
                self.persist();
                if let Some(reply) = self.pending_start.take() {
                    let _ = reply.send(Err(err));
                }
            }
        }
    }

    /// The target detached while the handshake was in flight. A closed target
    /// ends the fresh session (the collector still gets its stop); anything
    /// else goes through the normal reattach path.
    fn start_interrupted(&mut self, target: String, reason: DetachReason) {
        warn!(
            target = %target,
            reason = reason.as_str(),
            "Target detached while capture was starting"
        );
        self.detached(&target, reason);

        let reply = match self.pending_start.take() {
            Some(reply) => reply,
            None => return,
        };
        if self.session.is_active() {
            self.persist();
            let _ = reply.send(Ok(self.session.status()));
        } else {
            let _ = reply.send(Err(CaptureError::TargetGone(target)));
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Stop
    // ─────────────────────────────────────────────────────────────────────

    /// Returns false when there was no live session to stop.
    fn begin_stop(&mut self, reply: Option<StopReply>) -> bool {
        let ticket = match self.session.begin_stop() {
            Ok(ticket) => ticket,
            Err(err) => {
                debug!(error = %err, "Stop rejected");
                if let Some(reply) = reply {
                    let _ = reply.send(Err(err));
                }
                return false;
            }
        };
        if let Some(reply) = reply {
            self.stop_waiters.push(reply);
        }
        info!(
            session_id = ?ticket.session_id,
            requests = ticket.stats.request_count,
            endpoints = ticket.stats.endpoint_count,
            "Stopping capture session"
        );

        let source = Arc::clone(&self.source);
        let reporter = Arc::clone(&self.reporter);
        let tx = self.self_tx.clone();
        tokio::spawn(async move {
            let epoch = ticket.epoch;
            run_stop(source.as_ref(), reporter.as_ref(), ticket).await;
            post(&tx, Command::StopFinished { epoch });
        });
        true
    }

    fn stop_finished(&mut self, epoch: u64) {
        let stats = match self.session.finish_stop(epoch) {
            Some(stats) => stats,
            None => return,
        };
        self.write_snapshot(&SessionSnapshot {
            stats,
            ..SessionSnapshot::default()
        });
        info!(
            requests = stats.request_count,
            endpoints = stats.endpoint_count,
            "Capture session stopped"
        );
        for reply in self.stop_waiters.drain(..) {
            let _ = reply.send(Ok(stats));
        }
    }

    /// Tears the session down without a caller waiting on the result.
    fn terminate(&mut self) {
        self.begin_stop(None);
    }

    // ─────────────────────────────────────────────────────────────────────
    // Events and detachment
    // ─────────────────────────────────────────────────────────────────────

    fn network_event(&mut self, target_handle: &str, event: NetworkEvent) {
        if let EventOutcome::Captured { record, stats, .. } =
            self.session.handle_event(target_handle, event)
        {
            self.persist();
            self.publish_stats(stats);
            self.spawn_push(record);
        }
    }

    fn detached(&mut self, target_handle: &str, reason: DetachReason) {
        match self.session.on_detached(target_handle, reason) {
            DetachAction::Ignore => {
                debug!(target = %target_handle, reason = reason.as_str(), "Ignoring detach signal");
            }
            DetachAction::Terminate => {
                info!(target = %target_handle, "Target closed; ending capture session");
                self.terminate();
            }
            DetachAction::ScheduleReattach { epoch } => {
                warn!(
                    target = %target_handle,
                    reason = reason.as_str(),
                    "Detached from target; scheduling reattach"
                );
                self.persist();
                let delay = self.reattach_delay;
                let tx = self.self_tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    post(&tx, Command::ReattachDue { epoch });
                });
            }
        }
    }

    fn attempt_reattach(&mut self, epoch: u64) {
        let target = match self.session.begin_reattach(epoch) {
            Some(target) => target,
            None => return,
        };
        debug!(target = %target, "Attempting reattach");

        let source = Arc::clone(&self.source);
        let tx = self.self_tx.clone();
        tokio::spawn(async move {
            let outcome = if !source.target_exists(&target).await {
                ReattachOutcome::TargetGone
            } else {
                match source.attach(&target).await {
                    Ok(()) => ReattachOutcome::Attached,
                    Err(CaptureError::TargetGone(_)) => ReattachOutcome::TargetGone,
                    Err(err) => ReattachOutcome::Failed(err.to_string()),
                }
            };
            post(&tx, Command::ReattachFinished { epoch, outcome });
        });
    }

    fn reattach_finished(&mut self, epoch: u64, outcome: ReattachOutcome) {
        let failure = match &outcome {
            ReattachOutcome::Failed(details) => Some(details.clone()),
            _ => None,
        };
        match self.session.complete_reattach(epoch, outcome) {
            ReattachResult::Resumed(stats) => {
                info!("Reattached to target; capture resumed");
                self.persist();
                self.publish_stats(stats);
            }
            ReattachResult::StillDetached => {
                warn!(
                    error = failure.as_deref().unwrap_or("unknown"),
                    "Reattach failed; waiting for the next navigation or detach signal"
                );
            }
            ReattachResult::Terminate => {
                info!("Target disappeared while detached; ending capture session");
                self.terminate();
            }
            ReattachResult::Ignore => {}
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Helpers
    // ─────────────────────────────────────────────────────────────────────

    /// Once shutdown is requested, live sessions are stopped and the loop
    /// waits until the session is back to idle.
    fn shutdown_complete(&mut self) -> bool {
        if self.shutdown.is_none() {
            return false;
        }
        match self.session.state() {
            SessionState::Idle => {
                if let Some(reply) = self.shutdown.take() {
                    let _ = reply.send(());
                }
                true
            }
            SessionState::Active | SessionState::Detached { .. } => {
                self.terminate();
                false
            }
            SessionState::Starting | SessionState::Stopping => false,
        }
    }

    fn persist(&mut self) {
        let snapshot = self.session.snapshot();
        self.write_snapshot(&snapshot);
    }

    fn write_snapshot(&mut self, snapshot: &SessionSnapshot) {
        if let Err(err) = self.store.save(snapshot) {
            warn!(error = %err, "Failed to persist session snapshot");
        }
    }

    fn publish_stats(&self, stats: CaptureStats) {
        // No subscribers is fine.
        let _ = self.stats_tx.send(stats);
    }

    fn spawn_push(&self, record: CaptureRecord) {
        let reporter = Arc::clone(&self.reporter);
        tokio::spawn(async move {
            if let Err(err) = reporter.push_transaction(&record).await {
                warn!(
                    endpoint = %record.endpoint,
                    method = %record.method,
                    error = %err,
                    "Failed to push transaction to collector"
                );
            }
        });
    }

    fn spawn_detach(&self, target: String) {
        let source = Arc::clone(&self.source);
        tokio::spawn(async move {
            if let Err(err) = source.detach(&target).await {
                warn!(target = %target, error = %err, "Failed to detach from target");
            }
        });
    }
}

fn post(tx: &mpsc::WeakUnboundedSender<Command>, command: Command) {
    if let Some(tx) = tx.upgrade() {
        let _ = tx.send(command);
    }
}

/// Attach first, then open the collector session. A failed handshake releases
/// the attachment so no partial session is left behind.
async fn run_start(
    source: &dyn EventSource,
    reporter: &dyn Reporter,
    settings: &CaptureSettings,
) -> Result<(String, StartAck), CaptureError> {
    let target = source.resolve_target().await?;
    source.attach(&target).await?;

    let meta = StartMeta {
        target_url: settings.target_url.clone(),
        scope_target_id: settings.scope_target_id.clone(),
    };
    match reporter.notify_start(&meta).await {
        Ok(ack) => Ok((target, ack)),
        Err(err) => {
            if let Err(detach_err) = source.detach(&target).await {
                warn!(
                    target = %target,
                    error = %detach_err,
                    "Failed to detach after handshake failure"
                );
            }
            Err(CaptureError::Handshake(err))
        }
    }
}

/// Best-effort on both halves; stop always completes.
async fn run_stop(source: &dyn EventSource, reporter: &dyn Reporter, ticket: StopTicket) {
    if let Some(target) = &ticket.target_handle {
        if let Err(err) = source.detach(target).await {
            warn!(target = %target, error = %err, "Failed to detach from target");
        }
    }
    if let Some(session_id) = &ticket.session_id {
        if let Err(err) = reporter.notify_stop(session_id, ticket.stats).await {
            warn!(session_id = %session_id, error = %err, "Failed to notify collector of stop");
        }
    }
}
