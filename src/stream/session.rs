//! Self-healing live vitals session.
//!
//! [`SessionManager`] owns at most one connection for one identity. A single
//! background worker drives the connection lifecycle: it opens the transport,
//! sends `"ping"` on every heartbeat tick while open, forwards decoded events
//! to the caller's [`EventHandler`], and reconnects with exponential backoff
//! after any close until [`SessionManager::stop`] is called.
//!
//! All transport and timer activity is serialized through one `select!` loop,
//! so handler calls never overlap and `stop` can be called from anywhere,
//! including from inside the handler.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::retry::{with_timeout, ReconnectPolicy};
use crate::stream::client::{
    Connector, FrameSink, SessionIdentity, StreamClientError, StreamConfig, Transport,
    WsConnector,
};
use crate::stream::proto::{InboundFrame, VitalsEvent, PING_FRAME};

/// Lifecycle state of a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not started yet.
    Idle,
    /// Handshake in progress.
    Connecting,
    /// Connected; heartbeat running.
    Open,
    /// Waiting out the backoff delay before the next connect.
    ReconnectScheduled,
    /// Stopped for good. No state is reachable from here.
    ///
    /// Published by `stop` itself; a close frame may still be flushing in
    /// the background, bounded by the configured close timeout.
    Terminated,
}

/// Observable snapshot of a session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionStatus {
    pub state: ConnectionState,
    /// Consecutive failed connects or unexpected closes since the last open.
    pub attempt: u32,
    /// Backoff delay of the pending reconnect, if one is scheduled.
    pub next_retry_in: Option<Duration>,
    /// When the connection last reached [`ConnectionState::Open`].
    pub last_open_at: Option<Instant>,
}

impl Default for SessionStatus {
    fn default() -> Self {
        Self {
            state: ConnectionState::Idle,
            attempt: 0,
            next_retry_in: None,
            last_open_at: None,
        }
    }
}

/// Receives decoded vitals events.
///
/// Runs inline with frame delivery, so implementations should return quickly
/// (for example by queueing a refresh).
pub trait EventHandler: Send + 'static {
    fn on_event(&mut self, event: VitalsEvent);
}

impl<F> EventHandler for F
where
    F: FnMut(VitalsEvent) + Send + 'static,
{
    fn on_event(&mut self, event: VitalsEvent) {
        self(event)
    }
}

/// Result of [`SessionManager::start`]. None of these are errors.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StartOutcome {
    /// A worker was spawned and is connecting.
    Started,
    /// A session for an equal identity is already running.
    AlreadyRunning,
    /// A session for a different identity is running; use a new manager.
    IdentityMismatch,
    /// Subject or credential is blank; nothing was started.
    InvalidIdentity,
    /// The manager was stopped and cannot be restarted.
    Terminated,
}

/// Cloneable handle that terminates a session.
///
/// Handy for stopping from inside an [`EventHandler`].
#[derive(Clone, Debug)]
pub struct StopHandle {
    cancel: CancellationToken,
    status: Arc<watch::Sender<SessionStatus>>,
}

impl StopHandle {
    /// Terminates the session. Idempotent.
    pub fn stop(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.cancel.cancel();
        self.status.send_modify(|status| {
            status.state = ConnectionState::Terminated;
            status.next_retry_in = None;
        });
        debug!(event = "stream_stop_requested");
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

struct ActiveSession {
    identity: SessionIdentity,
    worker: Option<JoinHandle<()>>,
}

/// Owns one live vitals stream for one identity.
///
/// Dropping the manager stops the session.
pub struct SessionManager {
    config: StreamConfig,
    connector: Arc<dyn Connector>,
    stop: StopHandle,
    active: Option<ActiveSession>,
}

impl SessionManager {
    /// Creates an idle manager using the websocket connector.
    pub fn new(config: StreamConfig) -> Self {
        Self::with_connector(config, WsConnector)
    }

    /// Creates an idle manager with a custom transport.
    pub fn with_connector<C: Connector>(config: StreamConfig, connector: C) -> Self {
        let (status, _) = watch::channel(SessionStatus::default());
        Self {
            config,
            connector: Arc::new(connector),
            stop: StopHandle {
                cancel: CancellationToken::new(),
                status: Arc::new(status),
            },
            active: None,
        }
    }

    /// Starts streaming for `identity`, delivering events to `handler`.
    ///
    /// Redundant calls never open a second connection. Must be called from
    /// within a Tokio runtime.
    pub fn start<H: EventHandler>(&mut self, identity: SessionIdentity, handler: H) -> StartOutcome {
        if self.stop.is_stopped() {
            debug!(event = "stream_start_skipped", reason = "terminated");
            return StartOutcome::Terminated;
        }
        if !identity.is_valid() {
            debug!(event = "stream_start_skipped", reason = "invalid_identity");
            return StartOutcome::InvalidIdentity;
        }
        if let Some(active) = &self.active {
            if active.identity == identity {
                return StartOutcome::AlreadyRunning;
            }
            warn!(
                event = "stream_start_skipped",
                reason = "identity_mismatch",
                running_subject_id = %active.identity.subject_id(),
                requested_subject_id = %identity.subject_id()
            );
            return StartOutcome::IdentityMismatch;
        }

        let lifecycle = Lifecycle {
            status: Arc::clone(&self.stop.status),
            cancel: self.stop.cancel.clone(),
            policy: *self.config.reconnect_policy(),
            attempt: 0,
        };
        let worker = tokio::spawn(session_worker(
            identity.clone(),
            Arc::clone(&self.connector),
            self.config.clone(),
            Box::new(handler),
            lifecycle,
        ));
        self.active = Some(ActiveSession {
            identity,
            worker: Some(worker),
        });
        StartOutcome::Started
    }

    /// Terminates the session: cancels timers, closes the connection, and
    /// suppresses any further reconnects or handler calls. Idempotent.
    pub fn stop(&self) {
        self.stop.stop();
    }

    /// Stops the session and waits until the worker has closed the
    /// connection and exited.
    pub async fn stop_and_wait(&mut self) {
        self.stop();
        if let Some(worker) = self.active.as_mut().and_then(|active| active.worker.take()) {
            let _ = worker.await;
        }
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn is_terminated(&self) -> bool {
        self.stop.is_stopped()
    }

    /// Identity of the running session, if started.
    pub fn identity(&self) -> Option<&SessionIdentity> {
        self.active.as_ref().map(|active| &active.identity)
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    pub fn status(&self) -> SessionStatus {
        self.stop.status.borrow().clone()
    }

    /// Subscribes to status changes.
    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.stop.status.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        self.stop.status.borrow().state
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.stop.status.borrow().attempt
    }

    /// Time elapsed since the connection last opened.
    ///
    /// Hosts can use this to show how long the feed has been offline.
    pub fn time_since_last_open(&self) -> Option<Duration> {
        self.stop
            .status
            .borrow()
            .last_open_at
            .map(|opened_at| opened_at.elapsed())
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.stop.stop();
    }
}

/// Worker-owned state record. Every transition goes through one method and
/// is refused once the session has been stopped.
struct Lifecycle {
    status: Arc<watch::Sender<SessionStatus>>,
    cancel: CancellationToken,
    policy: ReconnectPolicy,
    attempt: u32,
}

impl Lifecycle {
    fn transition(&self, apply: impl FnOnce(&mut SessionStatus)) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        self.status.send_if_modified(|status| {
            if status.state == ConnectionState::Terminated {
                return false;
            }
            apply(status);
            true
        })
    }

    fn enter_connecting(&self) -> bool {
        self.transition(|status| {
            status.state = ConnectionState::Connecting;
            status.next_retry_in = None;
        })
    }

    fn enter_open(&mut self) -> bool {
        self.attempt = 0;
        self.transition(|status| {
            status.state = ConnectionState::Open;
            status.attempt = 0;
            status.next_retry_in = None;
            status.last_open_at = Some(Instant::now());
        })
    }

    /// Counts one failure and returns the delay before the next connect.
    fn enter_reconnect_scheduled(&mut self) -> Option<Duration> {
        self.attempt = self.attempt.saturating_add(1);
        let attempt = self.attempt;
        let delay = self.policy.delay_for_attempt(attempt);
        self.transition(|status| {
            status.state = ConnectionState::ReconnectScheduled;
            status.attempt = attempt;
            status.next_retry_in = Some(delay);
        })
        .then_some(delay)
    }

    fn finish(&self) {
        self.status.send_modify(|status| {
            status.state = ConnectionState::Terminated;
            status.next_retry_in = None;
        });
    }
}

enum SessionOutcome {
    Stopped,
    Disconnected,
}

async fn session_worker(
    identity: SessionIdentity,
    connector: Arc<dyn Connector>,
    config: StreamConfig,
    mut handler: Box<dyn EventHandler>,
    mut lifecycle: Lifecycle,
) {
    let cancel = lifecycle.cancel.clone();

    loop {
        if !lifecycle.enter_connecting() {
            break;
        }
        debug!(
            event = "stream_connecting",
            subject_id = %identity.subject_id(),
            endpoint = %config.endpoint(),
            attempt = lifecycle.attempt
        );

        let connected = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            result = open_transport(connector.as_ref(), &config, &identity) => result,
        };

        match connected {
            Ok(transport) => {
                if !lifecycle.enter_open() {
                    close_transport(transport, config.close_timeout()).await;
                    break;
                }
                info!(event = "stream_connected", subject_id = %identity.subject_id());
                match run_open_session(transport, handler.as_mut(), &config, &cancel).await {
                    SessionOutcome::Stopped => break,
                    SessionOutcome::Disconnected => {
                        info!(event = "stream_disconnected", subject_id = %identity.subject_id());
                    }
                }
            }
            Err(err) => {
                warn!(
                    event = "stream_connect_failed",
                    subject_id = %identity.subject_id(),
                    error = %err
                );
            }
        }

        let Some(delay) = lifecycle.enter_reconnect_scheduled() else {
            break;
        };
        info!(
            event = "stream_reconnect_scheduled",
            attempt = lifecycle.attempt,
            delay_ms = delay.as_millis() as u64
        );

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    lifecycle.finish();
    debug!(event = "stream_terminated", subject_id = %identity.subject_id());
}

async fn open_transport(
    connector: &dyn Connector,
    config: &StreamConfig,
    identity: &SessionIdentity,
) -> Result<Transport, StreamClientError> {
    let url = config.session_url(identity)?;
    let connecting = connector.connect(url);
    match config.connect_timeout() {
        Some(timeout) => with_timeout(timeout, connecting)
            .await
            .map_err(|_| StreamClientError::ConnectTimeout(timeout))?,
        None => connecting.await,
    }
}

/// Drives one open connection until it closes or the session is stopped.
///
/// The heartbeat interval lives only for the duration of this call.
async fn run_open_session(
    transport: Transport,
    handler: &mut dyn EventHandler,
    config: &StreamConfig,
    cancel: &CancellationToken,
) -> SessionOutcome {
    let Transport {
        mut sink,
        mut stream,
    } = transport;
    let period = config.heartbeat_interval();
    let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut writable = true;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                if writable {
                    debug!(event = "stream_closing");
                    close_sink(&mut sink, config.close_timeout()).await;
                }
                return SessionOutcome::Stopped;
            }
            maybe_inbound = stream.next() => {
                match maybe_inbound {
                    Some(Ok(Message::Text(text))) => deliver(text.as_str(), handler),
                    // Binary frames carrying UTF-8 JSON are accepted as an
                    // extension; a browser client would drop them.
                    Some(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                        Ok(text) => deliver(text, handler),
                        Err(err) => warn!(event = "stream_frame_dropped", error = %err),
                    },
                    Some(Ok(Message::Close(frame))) => {
                        debug!(event = "stream_close_received", frame = ?frame);
                        close_sink(&mut sink, config.close_timeout()).await;
                        return SessionOutcome::Disconnected;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        warn!(event = "stream_transport_error", error = %err);
                        return SessionOutcome::Disconnected;
                    }
                    None => return SessionOutcome::Disconnected,
                }
            }
            _ = heartbeat.tick() => {
                if !writable {
                    debug!(event = "stream_ping_skipped");
                    continue;
                }
                let sent = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return SessionOutcome::Stopped,
                    sent = sink.send(Message::text(PING_FRAME)) => sent,
                };
                match sent {
                    Ok(()) => trace!(event = "stream_ping_sent"),
                    Err(err) => {
                        writable = false;
                        debug!(event = "stream_ping_failed", error = %err);
                    }
                }
            }
        }
    }
}

fn deliver(text: &str, handler: &mut dyn EventHandler) {
    match InboundFrame::parse(text) {
        Ok(InboundFrame::Pong) => trace!(event = "stream_pong_received"),
        Ok(InboundFrame::Event(event)) => handler.on_event(event),
        Err(err) => warn!(event = "stream_frame_dropped", error = %err),
    }
}

async fn close_transport(transport: Transport, timeout: Duration) {
    let Transport { mut sink, .. } = transport;
    close_sink(&mut sink, timeout).await;
}

async fn close_sink(sink: &mut FrameSink, timeout: Duration) {
    match with_timeout(timeout, sink.close()).await {
        Ok(Ok(())) => trace!(event = "stream_closed"),
        Ok(Err(err)) => debug!(event = "stream_close_failed", error = %err),
        Err(_) => debug!(event = "stream_close_timed_out"),
    }
}
