use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use shaderlink_correlation::CorrelationRegistry;
use shaderlink_events::EventStreamHub;
use shaderlink_protocol::{
    ConnectionConfig, Envelope, Heartbeat, LinkError, LinkResult, MessageId, MessageKind, decode,
    encode,
};
use shaderlink_transport::{Connector, Frame, FrameSink, FrameStream};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

use crate::state::{ConnectionEvent, ConnectionPhase, ConnectionState, SeenIds};

const SEEN_ID_WINDOW: usize = 1024;
const SWEEP_INTERVAL: Duration = Duration::from_millis(500);
const EVENT_BUFFER: usize = 256;

type SharedSink = Arc<tokio::sync::Mutex<Box<dyn FrameSink>>>;

struct ActiveLink {
    epoch: u64,
    sink: SharedSink,
    tasks: Vec<JoinHandle<()>>,
}

struct Inner {
    config: ConnectionConfig,
    connector: Arc<dyn Connector>,
    registry: CorrelationRegistry<Envelope>,
    state: RwLock<ConnectionState>,
    active: Mutex<Option<ActiveLink>>,
    phase_tx: watch::Sender<ConnectionPhase>,
    inbound: EventStreamHub<Envelope>,
    events: EventStreamHub<ConnectionEvent>,
    seen: Mutex<SeenIds>,
    epoch: AtomicU64,
    auto_reconnect: AtomicBool,
    stopped: AtomicBool,
    reconnecting: AtomicBool,
    lost_notified: AtomicBool,
    reconnect_task: Mutex<Option<JoinHandle<()>>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

/// Owns one transport at a time and keeps it healthy.
///
/// Cloning yields another handle to the same connection.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(config: ConnectionConfig, connector: Arc<dyn Connector>) -> Self {
        Self::with_registry(config, connector, CorrelationRegistry::new())
    }

    pub fn with_registry(
        config: ConnectionConfig,
        connector: Arc<dyn Connector>,
        registry: CorrelationRegistry<Envelope>,
    ) -> Self {
        let (phase_tx, _) = watch::channel(ConnectionPhase::Disconnected);
        let auto_reconnect = config.auto_reconnect;
        Self {
            inner: Arc::new(Inner {
                config,
                connector,
                registry,
                state: RwLock::new(ConnectionState::default()),
                active: Mutex::new(None),
                phase_tx,
                inbound: EventStreamHub::new(EVENT_BUFFER),
                events: EventStreamHub::new(EVENT_BUFFER),
                seen: Mutex::new(SeenIds::new(SEEN_ID_WINDOW)),
                epoch: AtomicU64::new(0),
                auto_reconnect: AtomicBool::new(auto_reconnect),
                stopped: AtomicBool::new(false),
                reconnecting: AtomicBool::new(false),
                lost_notified: AtomicBool::new(false),
                reconnect_task: Mutex::new(None),
                sweeper: Mutex::new(None),
            }),
        }
    }

    /// Open the transport. A failed attempt is reported but not fatal: with
    /// auto-reconnect on, retries continue in the background.
    #[instrument(skip(self), fields(endpoint = %self.inner.connector.endpoint()))]
    pub async fn connect(&self) -> LinkResult<()> {
        self.inner.stopped.store(false, Ordering::SeqCst);
        self.inner
            .auto_reconnect
            .store(self.inner.config.auto_reconnect, Ordering::SeqCst);
        self.inner.ensure_sweeper();

        let result = self.inner.attempt_connect().await;
        if result.is_err() {
            self.inner.schedule_reconnect();
        }
        result
    }

    /// Stop for good: no further reconnects. Safe to call repeatedly and
    /// concurrently with failure handling; `Disconnected` is emitted once.
    #[instrument(skip(self))]
    pub fn disconnect(&self) {
        let inner = &self.inner;
        inner.auto_reconnect.store(false, Ordering::SeqCst);
        inner.stopped.store(true, Ordering::SeqCst);
        if let Some(task) = inner.reconnect_task.lock().take() {
            task.abort();
        }
        inner.reconnecting.store(false, Ordering::SeqCst);

        match inner.current_epoch() {
            Some(epoch) => {
                inner.handle_disconnect(epoch, "disconnect requested", false);
            }
            None => inner.transition(ConnectionPhase::Disconnected),
        }
    }

    /// Write one text frame. Only allowed while fully `Connected`.
    pub async fn send(&self, text: String) -> LinkResult<()> {
        if self.phase() != ConnectionPhase::Connected {
            return Err(LinkError::NotConnected);
        }
        self.inner.write(text).await
    }

    pub async fn send_envelope(&self, envelope: &Envelope) -> LinkResult<()> {
        let text = encode(envelope).map_err(|error| LinkError::Serialization(error.to_string()))?;
        debug!(id = %envelope.id, kind = envelope.kind.type_name(), "sending envelope");
        self.send(text).await
    }

    /// Wrap `kind` in a new envelope and send it, returning the envelope id.
    pub async fn send_kind(&self, kind: MessageKind) -> LinkResult<MessageId> {
        let envelope = Envelope::new(kind);
        self.send_envelope(&envelope).await?;
        Ok(envelope.id)
    }

    /// Wait up to `timeout` for the phase to be `Connected`.
    pub async fn wait_connected(&self, timeout: Duration) -> bool {
        let mut phase = self.inner.phase_tx.subscribe();
        matches!(
            tokio::time::timeout(timeout, phase.wait_for(|p| *p == ConnectionPhase::Connected))
                .await,
            Ok(Ok(_))
        )
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.inner.state.read().phase
    }

    pub fn snapshot(&self) -> ConnectionState {
        self.inner.state.read().clone()
    }

    pub fn registry(&self) -> &CorrelationRegistry<Envelope> {
        &self.inner.registry
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    /// Inbound envelopes in receive order, after correlation.
    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.inner.inbound.subscribe()
    }

    pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    pub fn watch_phase(&self) -> watch::Receiver<ConnectionPhase> {
        self.inner.phase_tx.subscribe()
    }
}

impl Inner {
    fn current_epoch(&self) -> Option<u64> {
        self.active.lock().as_ref().map(|link| link.epoch)
    }

    fn transition(&self, to: ConnectionPhase) {
        let mut state = self.state.write();
        self.apply_phase(&mut state, to);
    }

    // Called with the state lock held so observers see transitions in order.
    fn apply_phase(&self, state: &mut ConnectionState, to: ConnectionPhase) {
        if state.phase == to {
            return;
        }
        let from = state.phase;
        state.phase = to;
        self.phase_tx.send_replace(to);
        self.events
            .publish(ConnectionEvent::PhaseChanged { from, to });
        info!(%from, %to, "connection phase changed");
    }

    /// Move to `Connecting` unless a connection exists or is being made.
    /// `Ok(false)` means already connected.
    fn begin_connecting(&self) -> LinkResult<bool> {
        let mut state = self.state.write();
        match state.phase {
            phase if phase.is_live() => Ok(false),
            ConnectionPhase::Connecting => Err(LinkError::InvalidState(
                "connect already in progress".to_owned(),
            )),
            _ => {
                self.apply_phase(&mut state, ConnectionPhase::Connecting);
                Ok(true)
            }
        }
    }

    /// Transition only if `epoch` is still the live connection.
    fn transition_live(&self, epoch: u64, to: ConnectionPhase) -> bool {
        let active = self.active.lock();
        if active.as_ref().map(|link| link.epoch) != Some(epoch) {
            return false;
        }
        self.transition(to);
        true
    }

    fn ensure_sweeper(&self) {
        let mut sweeper = self.sweeper.lock();
        if sweeper.as_ref().is_none_or(|task| task.is_finished()) {
            *sweeper = Some(self.registry.spawn_sweeper(SWEEP_INTERVAL));
        }
    }

    async fn attempt_connect(self: &Arc<Self>) -> LinkResult<()> {
        if !self.begin_connecting()? {
            return Ok(());
        }

        let timeout = self.config.connection_timeout;
        let duplex = match tokio::time::timeout(timeout, self.connector.connect()).await {
            Ok(Ok(duplex)) => duplex,
            Ok(Err(error)) => return Err(self.connect_failed(error.to_string())),
            Err(_) => return Err(self.connect_failed(format!("timed out after {timeout:?}"))),
        };

        if self.stopped.load(Ordering::SeqCst) {
            let mut sink = duplex.sink;
            let _ = sink.send(Frame::Close(None)).await;
            self.transition(ConnectionPhase::Disconnected);
            return Err(LinkError::NotConnected);
        }

        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        {
            let mut state = self.state.write();
            state.last_activity = Some(Instant::now());
            state.consecutive_failures = 0;
            state.unhealthy_checks = 0;
            state.awaiting_pong = false;
        }
        *self.active.lock() = Some(ActiveLink {
            epoch,
            sink: Arc::new(tokio::sync::Mutex::new(duplex.sink)),
            tasks: Vec::new(),
        });

        let receive = tokio::spawn(receive_loop(Arc::downgrade(self), duplex.stream, epoch));
        let health = tokio::spawn(health_loop(
            Arc::downgrade(self),
            epoch,
            self.config.health_check_interval,
        ));
        {
            let mut active = self.active.lock();
            match active.as_mut() {
                Some(link) if link.epoch == epoch => link.tasks.extend([receive, health]),
                _ => {
                    receive.abort();
                    health.abort();
                }
            }
        }

        if !self.transition_live(epoch, ConnectionPhase::Connected) {
            return Err(LinkError::NotConnected);
        }
        if self.lost_notified.swap(false, Ordering::SeqCst) {
            self.events.publish(ConnectionEvent::Restored);
        }
        info!(epoch, endpoint = %self.connector.endpoint(), "connected");
        Ok(())
    }

    fn connect_failed(&self, reason: String) -> LinkError {
        let failures = {
            let mut state = self.state.write();
            state.consecutive_failures += 1;
            state.consecutive_failures
        };
        warn!(failures, %reason, "connect attempt failed");
        self.transition(ConnectionPhase::Disconnected);
        self.note_failure(failures);
        LinkError::ConnectFailed(reason)
    }

    fn note_failure(&self, failures: u32) {
        if failures >= self.config.failure_notice_threshold
            && !self.lost_notified.swap(true, Ordering::SeqCst)
        {
            warn!(failures, "connection lost");
            self.events.publish(ConnectionEvent::ConnectionLost {
                consecutive_failures: failures,
            });
        }
    }

    /// Tear down connection `epoch`. Returns `false` if it was already torn
    /// down, which makes every failure path safe to call concurrently.
    fn handle_disconnect(self: &Arc<Self>, epoch: u64, reason: &str, unexpected: bool) -> bool {
        let link = {
            let mut active = self.active.lock();
            match active.as_ref() {
                Some(link) if link.epoch == epoch => active.take(),
                _ => None,
            }
        };
        let Some(link) = link else {
            return false;
        };

        for task in &link.tasks {
            task.abort();
        }
        let sink = link.sink;
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                let mut sink = sink.lock().await;
                if let Err(error) = sink.send(Frame::Close(None)).await {
                    debug!(%error, "close frame not delivered");
                }
            });
        }

        let expired = self.registry.expire_all();
        let failures = {
            let mut state = self.state.write();
            state.awaiting_pong = false;
            state.unhealthy_checks = 0;
            if unexpected {
                state.consecutive_failures += 1;
            }
            state.consecutive_failures
        };
        if unexpected {
            warn!(epoch, reason, expired, "connection dropped");
        } else {
            info!(epoch, reason, expired, "connection closed");
        }
        self.transition(ConnectionPhase::Disconnected);
        if unexpected {
            self.note_failure(failures);
        }
        self.schedule_reconnect();
        true
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        if !self.auto_reconnect.load(Ordering::SeqCst) || self.stopped.load(Ordering::SeqCst) {
            return;
        }
        if self.reconnecting.swap(true, Ordering::SeqCst) {
            return;
        }
        let task = tokio::spawn(reconnect_loop(
            Arc::downgrade(self),
            self.config.reconnect_interval,
        ));
        *self.reconnect_task.lock() = Some(task);
    }

    async fn write(self: &Arc<Self>, text: String) -> LinkResult<()> {
        let (epoch, sink) = {
            let active = self.active.lock();
            let link = active.as_ref().ok_or(LinkError::NotConnected)?;
            (link.epoch, Arc::clone(&link.sink))
        };
        self.write_to(epoch, &sink, text).await
    }

    async fn write_to(self: &Arc<Self>, epoch: u64, sink: &SharedSink, text: String) -> LinkResult<()> {
        let result = sink.lock().await.send(Frame::Text(text)).await;
        if let Err(error) = result {
            warn!(epoch, %error, "write failed");
            self.handle_disconnect(epoch, "write failed", true);
            return Err(LinkError::Transport(error.to_string()));
        }
        Ok(())
    }

    /// Write on connection `epoch` regardless of health phase. Used for the
    /// heartbeat, which must go out precisely when the link looks unwell.
    async fn write_control(self: &Arc<Self>, epoch: u64, kind: MessageKind) {
        let sink = {
            let active = self.active.lock();
            match active.as_ref() {
                Some(link) if link.epoch == epoch => Arc::clone(&link.sink),
                _ => return,
            }
        };
        match encode(&Envelope::new(kind)) {
            Ok(text) => {
                let _ = self.write_to(epoch, &sink, text).await;
            }
            Err(error) => warn!(%error, "failed to encode control frame"),
        }
    }

    async fn on_text(self: &Arc<Self>, epoch: u64, text: &str) {
        let recovered = {
            let mut state = self.state.write();
            state.last_activity = Some(Instant::now());
            state.unhealthy_checks = 0;
            matches!(
                state.phase,
                ConnectionPhase::Degraded | ConnectionPhase::Unhealthy
            )
        };
        if recovered {
            self.transition_live(epoch, ConnectionPhase::Connected);
        }

        let envelope = match decode(text) {
            Ok(envelope) => envelope,
            Err(error) => {
                warn!(%error, "dropping undecodable frame");
                return;
            }
        };
        if !self.seen.lock().insert(&envelope.id) {
            debug!(id = %envelope.id, "dropping duplicate envelope");
            return;
        }

        match &envelope.kind {
            MessageKind::Pong(_) => {
                self.state.write().awaiting_pong = false;
                debug!("pong received");
                return;
            }
            MessageKind::Ping(_) => {
                self.write_control(epoch, MessageKind::Pong(Heartbeat::default()))
                    .await;
                return;
            }
            MessageKind::Unknown { kind, .. } => {
                debug!(kind = %kind, "ignoring unknown message kind");
                return;
            }
            _ => {}
        }

        debug!(id = %envelope.id, kind = envelope.kind.type_name(), "envelope received");
        if let Some(key) = envelope.correlation_key() {
            self.registry.resolve(&key, envelope.clone());
        }
        self.inbound.publish(envelope);
    }

    /// One health-loop iteration. Returns `false` once the connection has
    /// been torn down.
    async fn health_check(self: &Arc<Self>, epoch: u64) -> bool {
        let elapsed = {
            let state = self.state.read();
            state
                .last_activity
                .map_or(Duration::ZERO, |last| last.elapsed())
        };

        if elapsed < self.config.healthy_threshold {
            self.state.write().unhealthy_checks = 0;
            return self.transition_live(epoch, ConnectionPhase::Connected);
        }

        if elapsed < self.config.unhealthy_threshold {
            self.state.write().unhealthy_checks = 0;
            if !self.transition_live(epoch, ConnectionPhase::Degraded) {
                return false;
            }
            self.ping(epoch).await;
            return true;
        }

        let checks = {
            let mut state = self.state.write();
            state.unhealthy_checks += 1;
            state.unhealthy_checks
        };
        if !self.transition_live(epoch, ConnectionPhase::Unhealthy) {
            return false;
        }
        warn!(checks, elapsed_ms = elapsed.as_millis() as u64, "connection unhealthy");
        if checks >= self.config.max_unhealthy_checks {
            self.handle_disconnect(epoch, "health check failed", true);
            return false;
        }
        self.ping(epoch).await;
        true
    }

    async fn ping(self: &Arc<Self>, epoch: u64) {
        self.state.write().awaiting_pong = true;
        self.write_control(epoch, MessageKind::Ping(Heartbeat::default()))
            .await;
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(link) = self.active.get_mut().take() {
            for task in link.tasks {
                task.abort();
            }
        }
        for slot in [self.reconnect_task.get_mut(), self.sweeper.get_mut()] {
            if let Some(task) = slot.take() {
                task.abort();
            }
        }
    }
}

async fn receive_loop(inner: Weak<Inner>, mut stream: Box<dyn FrameStream>, epoch: u64) {
    loop {
        let frame = stream.next_frame().await;
        let Some(inner) = inner.upgrade() else {
            break;
        };
        match frame {
            Some(Ok(Frame::Text(text))) => inner.on_text(epoch, &text).await,
            Some(Ok(Frame::Close(reason))) => {
                let reason = reason.unwrap_or_else(|| "peer closed".to_owned());
                inner.handle_disconnect(epoch, &reason, true);
                break;
            }
            Some(Err(error)) => {
                inner.handle_disconnect(epoch, &error.to_string(), true);
                break;
            }
            None => {
                inner.handle_disconnect(epoch, "stream ended", true);
                break;
            }
        }
    }
    debug!(epoch, "receive loop stopped");
}

async fn health_loop(inner: Weak<Inner>, epoch: u64, interval: Duration) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(inner) = inner.upgrade() else {
            break;
        };
        if !inner.health_check(epoch).await {
            break;
        }
    }
    debug!(epoch, "health loop stopped");
}

async fn reconnect_loop(inner: Weak<Inner>, delay: Duration) {
    loop {
        tokio::time::sleep(delay).await;
        let Some(inner) = inner.upgrade() else {
            break;
        };
        if !inner.auto_reconnect.load(Ordering::SeqCst) || inner.stopped.load(Ordering::SeqCst) {
            inner.reconnecting.store(false, Ordering::SeqCst);
            break;
        }
        if inner.attempt_connect().await.is_err() {
            continue;
        }
        inner.reconnecting.store(false, Ordering::SeqCst);
        // The fresh connection may already have dropped; its teardown saw
        // `reconnecting` set and left the retry to us.
        if inner.state.read().phase == ConnectionPhase::Disconnected
            && !inner.reconnecting.swap(true, Ordering::SeqCst)
        {
            continue;
        }
        break;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{Context, Result};
    use serde_json::json;
    use shaderlink_correlation::CallOutcome;
    use shaderlink_protocol::{RequestId, TaskId, Thinking, ToolResult};
    use shaderlink_transport::memory_transport;

    fn fast_config() -> ConnectionConfig {
        ConnectionConfig {
            reconnect_interval: Duration::from_secs(1),
            connection_timeout: Duration::from_secs(5),
            health_check_interval: Duration::from_secs(1),
            healthy_threshold: Duration::from_secs(2),
            unhealthy_threshold: Duration::from_secs(4),
            max_unhealthy_checks: 3,
            failure_notice_threshold: 3,
            ..ConnectionConfig::default()
        }
    }

    fn frame(kind: MessageKind) -> String {
        encode(&Envelope::new(kind)).expect("catalogue kinds always encode")
    }

    fn tool_result(request_id: &str) -> MessageKind {
        MessageKind::ToolResult(ToolResult {
            request_id: RequestId::from(request_id),
            tool_name: "compile_shader".into(),
            success: true,
            result: Some(json!({"hasErrors": false, "diagnostics": []})),
            error: None,
        })
    }

    async fn next_phase(events: &mut broadcast::Receiver<ConnectionEvent>) -> Result<ConnectionPhase> {
        loop {
            if let ConnectionEvent::PhaseChanged { to, .. } = events.recv().await? {
                return Ok(to);
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn silent_peer_degrades_then_reconnects_and_expires_in_flight_calls() -> Result<()> {
        let (connector, mut acceptor) = memory_transport();
        let manager = ConnectionManager::new(fast_config(), Arc::new(connector));
        let mut events = manager.events();

        manager.connect().await?;
        let _silent = acceptor.accept().await.context("no first peer")?;
        let in_flight = manager.registry().register(
            RequestId::from("in-flight"),
            "compile_shader",
            Some(Duration::from_secs(60)),
        )?;

        let mut phases = Vec::new();
        for _ in 0..7 {
            phases.push(next_phase(&mut events).await?);
        }
        use ConnectionPhase::*;
        assert_eq!(
            phases,
            vec![Connecting, Connected, Degraded, Unhealthy, Disconnected, Connecting, Connected]
        );
        assert!(matches!(in_flight.wait().await, CallOutcome::TimedOut));

        // A reply to the pre-drop call arriving on the new connection
        // resolves nothing but is still delivered to subscribers.
        let mut inbound = manager.subscribe();
        let peer = acceptor.accept().await.context("no second peer")?;
        assert!(peer.send_text(frame(tool_result("in-flight"))));
        let late = inbound.recv().await?;
        assert_eq!(late.kind.type_name(), "ToolResult");
        assert_eq!(manager.registry().pending_count(), 0);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn pong_restores_health_and_is_not_forwarded() -> Result<()> {
        let (connector, mut acceptor) = memory_transport();
        let manager = ConnectionManager::new(fast_config(), Arc::new(connector));
        manager.connect().await?;
        let mut peer = acceptor.accept().await.context("no peer")?;
        let mut inbound = manager.subscribe();

        // Let the link go quiet until the health loop pings it.
        let ping = peer.recv_text().await.context("no ping")?;
        assert!(matches!(decode(&ping)?.kind, MessageKind::Ping(_)));
        assert_eq!(manager.phase(), ConnectionPhase::Degraded);
        assert!(manager.snapshot().awaiting_pong);

        assert!(peer.send_text(frame(MessageKind::Pong(Heartbeat::default()))));
        assert!(manager.wait_connected(Duration::from_secs(1)).await);
        assert!(!manager.snapshot().awaiting_pong);

        assert!(peer.send_text(frame(tool_result("unsolicited"))));
        let first = inbound.recv().await?;
        assert_eq!(first.kind.type_name(), "ToolResult");
        Ok(())
    }

    #[tokio::test]
    async fn replies_resolve_pending_calls_and_noise_is_dropped() -> Result<()> {
        let (connector, mut acceptor) = memory_transport();
        let manager = ConnectionManager::new(ConnectionConfig::default(), Arc::new(connector));
        manager.connect().await?;
        let peer = acceptor.accept().await.context("no peer")?;
        let mut inbound = manager.subscribe();
        let reply = manager.registry().register(
            RequestId::from("r-1"),
            "compile_shader",
            Some(Duration::from_secs(30)),
        )?;

        assert!(peer.send_text("{not json"));
        assert!(peer.send_text(r#"{"type":"ToolResult","payload":{}}"#));
        assert!(peer.send_text(r#"{"id":"u-1","type":"HotReload","payload":{"x":1}}"#));
        assert!(peer.send_text(frame(tool_result("r-1"))));

        match reply.wait().await {
            CallOutcome::Resolved(envelope) => {
                assert_eq!(envelope.correlation_key(), Some(RequestId::from("r-1")));
            }
            other => anyhow::bail!("expected resolution, got {other:?}"),
        }
        // Malformed and unknown frames never reach subscribers.
        let forwarded = inbound.recv().await?;
        assert_eq!(forwarded.kind.type_name(), "ToolResult");
        assert_eq!(manager.phase(), ConnectionPhase::Connected);
        Ok(())
    }

    #[tokio::test]
    async fn inbound_ping_is_answered_with_pong() -> Result<()> {
        let (connector, mut acceptor) = memory_transport();
        let manager = ConnectionManager::new(ConnectionConfig::default(), Arc::new(connector));
        manager.connect().await?;
        let mut peer = acceptor.accept().await.context("no peer")?;

        assert!(peer.send_text(frame(MessageKind::Ping(Heartbeat::default()))));
        let reply = peer.recv_text().await.context("no reply")?;
        assert!(matches!(decode(&reply)?.kind, MessageKind::Pong(_)));
        Ok(())
    }

    #[tokio::test]
    async fn redelivered_envelopes_are_dropped() -> Result<()> {
        let (connector, mut acceptor) = memory_transport();
        let manager = ConnectionManager::new(ConnectionConfig::default(), Arc::new(connector));
        manager.connect().await?;
        let peer = acceptor.accept().await.context("no peer")?;
        let mut inbound = manager.subscribe();

        let thinking = |message: &str| {
            MessageKind::Thinking(Thinking {
                task_id: TaskId::from("t-1"),
                message: message.to_owned(),
            })
        };
        let first = encode(&Envelope::new(thinking("first")))?;
        assert!(peer.send_text(first.clone()));
        assert!(peer.send_text(first));
        assert!(peer.send_text(frame(thinking("second"))));

        let mut messages = Vec::new();
        for _ in 0..2 {
            if let MessageKind::Thinking(body) = inbound.recv().await?.kind {
                messages.push(body.message);
            }
        }
        assert_eq!(messages, vec!["first", "second"]);
        Ok(())
    }

    #[tokio::test]
    async fn send_requires_connected_phase() -> Result<()> {
        let (connector, _acceptor) = memory_transport();
        let manager = ConnectionManager::new(ConnectionConfig::default(), Arc::new(connector));
        let err = manager.send("hello".to_owned()).await.unwrap_err();
        assert!(matches!(err, LinkError::NotConnected));

        manager.connect().await?;
        manager.send_kind(MessageKind::Ping(Heartbeat::default())).await?;
        manager.disconnect();
        let err = manager.send("hello".to_owned()).await.unwrap_err();
        assert!(matches!(err, LinkError::NotConnected));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_emits_once_and_stops_reconnecting() -> Result<()> {
        let (connector, mut acceptor) = memory_transport();
        let manager = ConnectionManager::new(fast_config(), Arc::new(connector));
        manager.connect().await?;
        let peer = acceptor.accept().await.context("no peer")?;
        let mut events = manager.events();

        let racing = manager.clone();
        let a = tokio::spawn(async move { racing.disconnect() });
        manager.disconnect();
        drop(peer);
        a.await?;
        tokio::time::sleep(Duration::from_secs(10)).await;

        let mut disconnected = 0;
        let mut connecting = 0;
        while let Ok(event) = events.try_recv() {
            match event {
                ConnectionEvent::PhaseChanged {
                    to: ConnectionPhase::Disconnected,
                    ..
                } => disconnected += 1,
                ConnectionEvent::PhaseChanged {
                    to: ConnectionPhase::Connecting,
                    ..
                } => connecting += 1,
                _ => {}
            }
        }
        assert_eq!(disconnected, 1);
        assert_eq!(connecting, 0);
        assert_eq!(manager.phase(), ConnectionPhase::Disconnected);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn refused_connects_retry_and_notify_loss_once() -> Result<()> {
        let (connector, _acceptor) = memory_transport();
        connector.refuse_next(4);
        let config = ConnectionConfig {
            failure_notice_threshold: 2,
            ..fast_config()
        };
        let manager = ConnectionManager::new(config, Arc::new(connector));
        let mut events = manager.events();

        assert!(manager.connect().await.is_err());
        assert!(manager.wait_connected(Duration::from_secs(30)).await);

        let mut lost = 0;
        let mut restored = 0;
        while let Ok(event) = events.try_recv() {
            match event {
                ConnectionEvent::ConnectionLost { .. } => lost += 1,
                ConnectionEvent::Restored => restored += 1,
                ConnectionEvent::PhaseChanged { .. } => {}
            }
        }
        assert_eq!(lost, 1);
        assert_eq!(restored, 1);
        assert_eq!(manager.snapshot().consecutive_failures, 0);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn peer_close_triggers_reconnect() -> Result<()> {
        let (connector, mut acceptor) = memory_transport();
        let manager = ConnectionManager::new(fast_config(), Arc::new(connector));
        manager.connect().await?;
        let peer = acceptor.accept().await.context("no peer")?;
        let mut events = manager.events();

        peer.close(Some("restarting".into()));
        assert_eq!(next_phase(&mut events).await?, ConnectionPhase::Disconnected);
        assert_eq!(next_phase(&mut events).await?, ConnectionPhase::Connecting);
        assert_eq!(next_phase(&mut events).await?, ConnectionPhase::Connected);
        assert!(acceptor.accept().await.is_some());
        Ok(())
    }
}
