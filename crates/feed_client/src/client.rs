//! Connection manager and the public client handle.
//!
//! [`FeedClient`] is a cheap cloneable handle; the work happens in a single
//! manager task that owns the transport, the retry timer, the heartbeat
//! interval, and both registries. All state transitions run on that task, so
//! no locking is needed. Public methods send commands into the task and, for
//! the connection-affecting ones, await its acknowledgment.

use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use common::{Envelope, EnvelopeType, Error, MetricsUpdate, Result, SnapshotUpdate, UnsubscribePayload};
use metrics::{counter, gauge};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep, Interval, MissedTickBehavior, Sleep};
use tracing::{debug, error, info, warn};

use crate::backoff::ReconnectPolicy;
use crate::callback::{CallbackHandle, Listener};
use crate::config::FeedConfig;
use crate::dispatcher::Dispatcher;
use crate::state::ConnectionState;
use crate::subscription::SubscriptionSet;
use crate::transport::{Connector, Transport, TransportEvent, WsConnector};

pub(crate) enum Command {
    Connect {
        respond_to: oneshot::Sender<Result<()>>,
    },
    Disconnect {
        respond_to: oneshot::Sender<()>,
    },
    Subscribe {
        targets: Vec<String>,
        metric_types: Option<Vec<String>>,
        respond_to: oneshot::Sender<Result<()>>,
    },
    Unsubscribe {
        targets: Option<Vec<String>>,
        respond_to: oneshot::Sender<()>,
    },
    AddListener {
        id: u64,
        listener: Listener,
    },
    RemoveListener {
        handle: CallbackHandle,
    },
    SetAuthToken {
        token: Option<String>,
        respond_to: oneshot::Sender<Result<()>>,
    },
    State {
        respond_to: oneshot::Sender<ConnectionState>,
    },
}

/// Handle to the realtime analytics feed.
///
/// Cloning is cheap; every clone talks to the same connection. Dropping the
/// last handle shuts the connection down and stops the manager task.
#[derive(Clone)]
pub struct FeedClient {
    cmd_tx: mpsc::UnboundedSender<Command>,
    listener_ids: Arc<AtomicU64>,
}

impl FeedClient {
    /// Spawn the manager task with the production WebSocket connector.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: FeedConfig) -> Self {
        Self::with_connector(config, Arc::new(WsConnector))
    }

    /// Spawn the manager task with a custom connector.
    pub fn with_connector(config: FeedConfig, connector: Arc<dyn Connector>) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let manager = ConnectionManager::new(config, connector, cmd_rx);
        tokio::spawn(manager.run());
        Self {
            cmd_tx,
            listener_ids: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Establish the connection. No-op when already connected; from any other
    /// state this initiates a single connection attempt.
    ///
    /// Resolves once the transport reports open or failed. A failure here does
    /// not cancel automatic recovery: a retry is already scheduled when the
    /// attempt budget allows it.
    pub async fn connect(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send_command(Command::Connect { respond_to: tx })?;
        rx.await.map_err(|_| Error::ClientStopped)?
    }

    /// Tear the connection down: cancels all timers, closes the transport,
    /// clears the subscription set, and leaves the state `Disconnected`.
    /// Registered listeners stay valid. Idempotent.
    pub async fn disconnect(&self) {
        let (tx, rx) = oneshot::channel();
        if self.send_command(Command::Disconnect { respond_to: tx }).is_ok() {
            let _ = rx.await;
        }
    }

    /// Subscribe to realtime metrics for the given code ids, connecting first
    /// if necessary. Sends one subscribe message carrying the full tracked set.
    pub async fn subscribe(
        &self,
        targets: Vec<String>,
        metric_types: Option<Vec<String>>,
    ) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send_command(Command::Subscribe {
            targets,
            metric_types,
            respond_to: tx,
        })?;
        rx.await.map_err(|_| Error::ClientStopped)?
    }

    /// Stop tracking the given code ids (`None` targets the whole set). The
    /// unsubscribe message is only sent while connected; the local set shrinks
    /// either way and the next replay carries the reduced set.
    pub async fn unsubscribe(&self, targets: Option<Vec<String>>) {
        let (tx, rx) = oneshot::channel();
        if self
            .send_command(Command::Unsubscribe {
                targets,
                respond_to: tx,
            })
            .is_ok()
        {
            let _ = rx.await;
        }
    }

    /// Replace the auth credential. When the client is connected this cycles
    /// the transport so the new token is presented, replaying subscriptions.
    pub async fn set_auth_token(&self, token: Option<String>) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send_command(Command::SetAuthToken {
            token,
            respond_to: tx,
        })?;
        rx.await.map_err(|_| Error::ClientStopped)?
    }

    /// Current connection state.
    pub async fn state(&self) -> ConnectionState {
        let (tx, rx) = oneshot::channel();
        if self.send_command(Command::State { respond_to: tx }).is_err() {
            return ConnectionState::Disconnected;
        }
        rx.await.unwrap_or(ConnectionState::Disconnected)
    }

    pub fn on_metrics_update<F>(&self, listener: F) -> CallbackHandle
    where
        F: Fn(&MetricsUpdate) -> Result<()> + Send + 'static,
    {
        self.add_listener(Listener::Metrics(Box::new(listener)))
    }

    pub fn on_snapshot_update<F>(&self, listener: F) -> CallbackHandle
    where
        F: Fn(&SnapshotUpdate) -> Result<()> + Send + 'static,
    {
        self.add_listener(Listener::Snapshot(Box::new(listener)))
    }

    pub fn on_state_change<F>(&self, listener: F) -> CallbackHandle
    where
        F: Fn(ConnectionState) + Send + 'static,
    {
        self.add_listener(Listener::State(Box::new(listener)))
    }

    pub fn on_error<F>(&self, listener: F) -> CallbackHandle
    where
        F: Fn(&str) + Send + 'static,
    {
        self.add_listener(Listener::Error(Box::new(listener)))
    }

    /// Detach the listener the handle names. Idempotent.
    pub fn remove_listener(&self, handle: CallbackHandle) {
        let _ = self.cmd_tx.send(Command::RemoveListener { handle });
    }

    fn add_listener(&self, listener: Listener) -> CallbackHandle {
        let id = self.listener_ids.fetch_add(1, Ordering::Relaxed);
        let handle = CallbackHandle::new(listener.category(), id);
        let _ = self.cmd_tx.send(Command::AddListener { id, listener });
        handle
    }

    fn send_command(&self, cmd: Command) -> Result<()> {
        self.cmd_tx.send(cmd).map_err(|_| Error::ClientStopped)
    }
}

enum LoopEvent {
    Command(Command),
    Inbound(TransportEvent),
    RetryFired,
    HeartbeatTick,
    Shutdown,
}

/// Owns the transport, the timers, and the registries. Runs until every
/// [`FeedClient`] handle is dropped.
struct ConnectionManager {
    config: FeedConfig,
    connector: Arc<dyn Connector>,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    state: ConnectionState,
    transport: Option<Box<dyn Transport>>,
    dispatcher: Dispatcher,
    subscriptions: SubscriptionSet,
    policy: ReconnectPolicy,
    /// The single in-flight retry timer. Armed on entering `Reconnecting`,
    /// dropped on every exit from it.
    retry_timer: Option<Pin<Box<Sleep>>>,
    /// Armed while `Connected` only.
    heartbeat: Option<Interval>,
}

impl ConnectionManager {
    fn new(
        config: FeedConfig,
        connector: Arc<dyn Connector>,
        cmd_rx: mpsc::UnboundedReceiver<Command>,
    ) -> Self {
        let policy = ReconnectPolicy::new(config.reconnect_interval, config.max_reconnect_attempts);
        let subscriptions =
            SubscriptionSet::new(config.update_interval.map(|d| d.as_millis() as u64));
        Self {
            config,
            connector,
            cmd_rx,
            state: ConnectionState::Disconnected,
            transport: None,
            dispatcher: Dispatcher::new(),
            subscriptions,
            policy,
            retry_timer: None,
            heartbeat: None,
        }
    }

    async fn run(mut self) {
        loop {
            match self.next_event().await {
                LoopEvent::Command(cmd) => self.handle_command(cmd).await,
                LoopEvent::Inbound(TransportEvent::Frame(text)) => {
                    counter!("feed_messages_received_total").increment(1);
                    self.dispatcher.handle_frame(&text);
                }
                LoopEvent::Inbound(TransportEvent::Closed) => {
                    warn!("feed connection lost");
                    self.handle_abnormal_close();
                }
                LoopEvent::RetryFired => {
                    self.retry_timer = None;
                    // Failures re-enter the scheduler with the counter intact.
                    let _ = self.attempt_connect().await;
                }
                LoopEvent::HeartbeatTick => {
                    counter!("feed_heartbeats_total").increment(1);
                    self.send_envelope(Envelope::new(EnvelopeType::Ping, None)).await;
                }
                LoopEvent::Shutdown => {
                    debug!("all client handles dropped, shutting down");
                    self.do_disconnect().await;
                    return;
                }
            }
        }
    }

    async fn next_event(&mut self) -> LoopEvent {
        let transport = self.transport.as_mut();
        let retry = self.retry_timer.as_mut();
        let heartbeat = self.heartbeat.as_mut();

        tokio::select! {
            biased;

            cmd = self.cmd_rx.recv() => match cmd {
                Some(cmd) => LoopEvent::Command(cmd),
                None => LoopEvent::Shutdown,
            },
            event = next_transport_event(transport) => LoopEvent::Inbound(event),
            () = retry_elapsed(retry) => LoopEvent::RetryFired,
            () = heartbeat_tick(heartbeat) => LoopEvent::HeartbeatTick,
        }
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Connect { respond_to } => {
                let result = self.do_connect().await;
                let _ = respond_to.send(result);
            }
            Command::Disconnect { respond_to } => {
                self.do_disconnect().await;
                let _ = respond_to.send(());
            }
            Command::Subscribe {
                targets,
                metric_types,
                respond_to,
            } => {
                let result = self.do_subscribe(targets, metric_types).await;
                let _ = respond_to.send(result);
            }
            Command::Unsubscribe { targets, respond_to } => {
                self.do_unsubscribe(targets).await;
                let _ = respond_to.send(());
            }
            Command::AddListener { id, listener } => {
                self.dispatcher.callbacks_mut().insert(id, listener);
            }
            Command::RemoveListener { handle } => {
                self.dispatcher.callbacks_mut().remove(handle);
            }
            Command::SetAuthToken { token, respond_to } => {
                let result = self.do_set_auth_token(token).await;
                let _ = respond_to.send(result);
            }
            Command::State { respond_to } => {
                let _ = respond_to.send(self.state);
            }
        }
    }

    /// Manual connect: no-op when connected, otherwise cancels any pending
    /// retry and runs one attempt.
    async fn do_connect(&mut self) -> Result<()> {
        if self.state == ConnectionState::Connected {
            return Ok(());
        }
        self.retry_timer = None;
        self.attempt_connect().await
    }

    async fn attempt_connect(&mut self) -> Result<()> {
        self.transition(ConnectionState::Connecting);
        counter!("feed_connect_attempts_total").increment(1);
        let url = match self.config.connect_url() {
            Ok(url) => url,
            Err(e) => {
                self.dispatcher.notify_error(&format!("connection failed: {e}"));
                self.schedule_retry();
                return Err(e);
            }
        };
        // The URL may carry the auth token as a query parameter; log the host only.
        info!(host = url.host_str().unwrap_or("<unknown>"), "connecting to analytics feed");
        match self.connector.open(&url).await {
            Ok(transport) => {
                self.install(transport).await;
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "failed to open feed connection");
                self.dispatcher.notify_error(&format!("connection failed: {e}"));
                self.schedule_retry();
                Err(e)
            }
        }
    }

    /// Bring a freshly opened transport into service.
    async fn install(&mut self, transport: Box<dyn Transport>) {
        self.transport = Some(transport);
        self.policy.reset();
        self.retry_timer = None;
        self.transition(ConnectionState::Connected);
        counter!("feed_connections_total").increment(1);
        gauge!("feed_connected").set(1.0);
        self.start_heartbeat();
        if !self.subscriptions.is_empty() {
            debug!(targets = self.subscriptions.len(), "replaying subscriptions");
            self.send_subscribe().await;
        }
    }

    fn start_heartbeat(&mut self) {
        let mut interval = tokio::time::interval(self.config.heartbeat_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        interval.reset(); // first ping one full period from now
        self.heartbeat = Some(interval);
    }

    /// Teardown order matters: timers first so nothing fires afterwards, then
    /// the transport, then the tracked set, then the state notification.
    async fn do_disconnect(&mut self) {
        self.retry_timer = None;
        self.heartbeat = None;
        if let Some(mut transport) = self.transport.take() {
            transport.close().await;
        }
        gauge!("feed_connected").set(0.0);
        self.subscriptions.clear();
        self.transition(ConnectionState::Disconnected);
    }

    async fn do_subscribe(
        &mut self,
        targets: Vec<String>,
        metric_types: Option<Vec<String>>,
    ) -> Result<()> {
        if self.state != ConnectionState::Connected {
            self.do_connect().await?;
        }
        self.subscriptions.merge(targets, metric_types);
        self.send_subscribe().await;
        Ok(())
    }

    async fn do_unsubscribe(&mut self, targets: Option<Vec<String>>) {
        let removed = self.subscriptions.remove(targets);
        if removed.is_empty() {
            return;
        }
        if self.state != ConnectionState::Connected {
            // The local set already shrank; the server catches up on the next
            // replay, which resends the reduced set.
            warn!(count = removed.len(), "not connected, skipping unsubscribe message");
            return;
        }
        match serde_json::to_value(UnsubscribePayload { target_ids: removed }) {
            Ok(payload) => {
                self.send_envelope(Envelope::control(EnvelopeType::Unsubscribe, Some(payload)))
                    .await;
            }
            Err(e) => warn!(error = %e, "failed to encode unsubscribe payload"),
        }
    }

    async fn do_set_auth_token(&mut self, token: Option<String>) -> Result<()> {
        if self.config.auth_token == token {
            return Ok(());
        }
        self.config.auth_token = token;
        if matches!(
            self.state,
            ConnectionState::Disconnected | ConnectionState::Error
        ) {
            return Ok(());
        }
        // Cycle the transport so the new credential is presented. The
        // subscription set is untouched and replays on the new connection.
        info!("auth token changed, cycling connection");
        self.retry_timer = None;
        self.heartbeat = None;
        if let Some(mut transport) = self.transport.take() {
            transport.close().await;
        }
        gauge!("feed_connected").set(0.0);
        self.transition(ConnectionState::Reconnecting);
        self.do_connect().await
    }

    fn handle_abnormal_close(&mut self) {
        self.heartbeat = None;
        self.transport = None;
        counter!("feed_disconnects_total").increment(1);
        gauge!("feed_connected").set(0.0);
        self.schedule_retry();
    }

    /// Arm the single retry timer, or give up when the budget is spent.
    fn schedule_retry(&mut self) {
        match self.policy.next_delay() {
            Some(delay) => {
                info!(
                    attempt = self.policy.attempts(),
                    max_attempts = self.policy.max_attempts(),
                    delay_ms = delay.as_millis() as u64,
                    "scheduling reconnect"
                );
                counter!("feed_reconnects_scheduled_total").increment(1);
                self.retry_timer = Some(Box::pin(sleep(delay)));
                self.transition(ConnectionState::Reconnecting);
            }
            None => {
                error!(
                    attempts = self.policy.attempts(),
                    "max reconnection attempts reached, giving up"
                );
                self.transition(ConnectionState::Error);
                self.dispatcher.notify_error("max reconnection attempts reached");
            }
        }
    }

    async fn send_subscribe(&mut self) {
        let payload = self.subscriptions.subscribe_payload();
        match serde_json::to_value(payload) {
            Ok(value) => {
                self.send_envelope(Envelope::control(EnvelopeType::Subscribe, Some(value)))
                    .await;
            }
            Err(e) => warn!(error = %e, "failed to encode subscribe payload"),
        }
    }

    async fn send_envelope(&mut self, envelope: Envelope) {
        let kind = envelope.kind;
        let text = match serde_json::to_string(&envelope) {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "failed to encode outbound message");
                return;
            }
        };
        let Some(transport) = self.transport.as_mut() else {
            warn!(kind = ?kind, "not connected, dropping outbound message");
            return;
        };
        if let Err(e) = transport.send(text).await {
            warn!(error = %e, "send failed, treating connection as lost");
            self.handle_abnormal_close();
        }
    }

    fn transition(&mut self, next: ConnectionState) {
        if self.state == next {
            return;
        }
        debug!(from = %self.state, to = %next, "connection state change");
        self.state = next;
        self.dispatcher.notify_state(next);
    }
}

async fn next_transport_event(transport: Option<&mut Box<dyn Transport>>) -> TransportEvent {
    match transport {
        Some(transport) => transport.next_event().await,
        None => std::future::pending().await,
    }
}

async fn retry_elapsed(timer: Option<&mut Pin<Box<Sleep>>>) {
    match timer {
        Some(timer) => timer.as_mut().await,
        None => std::future::pending().await,
    }
}

async fn heartbeat_tick(interval: Option<&mut Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
