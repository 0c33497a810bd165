use std::{future::Future, pin::Pin, sync::Arc, time::Duration};

use {
    tether_config::TransportConfig,
    tether_protocol::{InboundMessage, OutboundMessage, close_codes},
    tether_sessions::Session,
    tokio::{
        sync::{mpsc, oneshot, watch},
        time::{Instant, sleep_until},
    },
    tracing::{debug, info, warn},
    url::Url,
};

#[cfg(feature = "metrics")]
use metrics::counter;

use crate::{
    endpoint,
    error::{Result, TransportError},
    heartbeat::{HeartbeatAction, HeartbeatMonitor},
    machine::{ConnectionMachine, Effect},
    renew::SessionRenewer,
    router::{MessageRouter, Route, RouteError},
    socket::{Connector, Frame, Socket, TungsteniteConnector},
    state::ConnectionState,
    subscribers::{DisconnectEvent, SubscriberCounts, SubscriberRegistry, Subscription},
};

const COMMAND_BUFFER: usize = 64;

type OpenFuture = Pin<Box<dyn Future<Output = Result<Box<dyn Socket>>> + Send>>;
type RenewFuture = Pin<Box<dyn Future<Output = Option<String>> + Send>>;

enum Command {
    Connect {
        url: Url,
        reply: oneshot::Sender<ConnectionState>,
    },
    Reconnect {
        reply: oneshot::Sender<ConnectionState>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
    Send {
        text: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to the single live connection.
///
/// Cheap to clone. All handles share one driver task that owns the socket,
/// the state machine and every timer. The driver stops on
/// [`shutdown`](Self::shutdown) or when the last handle is dropped.
#[derive(Clone)]
pub struct ConnectionManager {
    cmd_tx: mpsc::Sender<Command>,
    state_rx: watch::Receiver<ConnectionState>,
    subscribers: SubscriberRegistry,
    server_url: Option<String>,
}

impl ConnectionManager {
    /// A manager using the tokio-tungstenite connector. Must be called from
    /// within a tokio runtime.
    pub fn new(config: TransportConfig) -> Self {
        Self::builder(config).build()
    }

    pub fn builder(config: TransportConfig) -> ConnectionManagerBuilder {
        ConnectionManagerBuilder {
            config,
            connector: Arc::new(TungsteniteConnector),
            renewer: None,
            server_url: None,
        }
    }

    /// Open a connection to `url`. A no-op returning the current state while
    /// a socket is pending or open, or while caller attempts are throttled.
    pub async fn connect(&self, url: &str) -> Result<ConnectionState> {
        let url = Url::parse(url)?;
        self.connect_url(url).await
    }

    pub async fn connect_url(&self, url: Url) -> Result<ConnectionState> {
        self.request(|reply| Command::Connect { url, reply }).await
    }

    /// Connect to `session`'s socket on the configured server.
    pub async fn connect_session(&self, session: &Session) -> Result<ConnectionState> {
        let base = self
            .server_url
            .as_deref()
            .ok_or_else(|| TransportError::InvalidUrl("no server url configured".into()))?;
        let url = endpoint::session_url(base, &session.id)?;
        self.connect_url(url).await
    }

    /// Reconnect to the last URL with a fresh attempt budget.
    pub async fn reconnect(&self) -> Result<ConnectionState> {
        self.request(|reply| Command::Reconnect { reply }).await
    }

    /// Close with a normal-closure code. No automatic reconnection follows.
    pub async fn disconnect(&self) {
        if self
            .request(|reply| Command::Disconnect { reply })
            .await
            .is_err()
        {
            debug!("disconnect after shutdown");
        }
    }

    /// Write `message` if connected. Otherwise fails with
    /// [`TransportError::NotConnected`] and may trigger a reconnection.
    pub async fn send(&self, message: &OutboundMessage) -> Result<()> {
        let text = message.to_text()?;
        self.request(|reply| Command::Send { text, reply }).await?
    }

    pub async fn send_chat(&self, content: impl Into<String>, user_id: impl Into<String>) -> Result<()> {
        self.send(&OutboundMessage::chat(content, user_id)).await
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Wait until the connection reaches `state`.
    pub async fn wait_for_state(&self, state: ConnectionState) -> Result<()> {
        let mut rx = self.watch_state();
        rx.wait_for(|s| *s == state)
            .await
            .map(|_| ())
            .map_err(|_| TransportError::Shutdown)
    }

    pub fn on_message(&self, f: impl Fn(&InboundMessage) + Send + Sync + 'static) -> Subscription {
        self.subscribers.on_message(f)
    }

    pub fn on_connect(&self, f: impl Fn(&Url) + Send + Sync + 'static) -> Subscription {
        self.subscribers.on_connect(f)
    }

    pub fn on_disconnect(
        &self,
        f: impl Fn(&DisconnectEvent) + Send + Sync + 'static,
    ) -> Subscription {
        self.subscribers.on_disconnect(f)
    }

    pub fn subscriber_counts(&self) -> SubscriberCounts {
        self.subscribers.counts()
    }

    /// Disconnect and stop the driver task.
    pub async fn shutdown(&self) {
        if self
            .request(|reply| Command::Shutdown { reply })
            .await
            .is_err()
        {
            debug!("already shut down");
        }
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(make(tx))
            .await
            .map_err(|_| TransportError::Shutdown)?;
        rx.await.map_err(|_| TransportError::Shutdown)
    }
}

pub struct ConnectionManagerBuilder {
    config: TransportConfig,
    connector: Arc<dyn Connector>,
    renewer: Option<Arc<dyn SessionRenewer>>,
    server_url: Option<String>,
}

impl ConnectionManagerBuilder {
    pub fn connector(mut self, connector: impl Connector + 'static) -> Self {
        self.connector = Arc::new(connector);
        self
    }

    /// Used to rebind when the server deletes the active session.
    pub fn session_renewer(mut self, renewer: Arc<dyn SessionRenewer>) -> Self {
        self.renewer = Some(renewer);
        self
    }

    /// HTTP(S) base URL of the server, for [`ConnectionManager::connect_session`].
    pub fn server_url(mut self, url: impl Into<String>) -> Self {
        self.server_url = Some(url.into());
        self
    }

    /// Spawn the driver task and return the first handle.
    pub fn build(self) -> ConnectionManager {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let subscribers = SubscriberRegistry::new();

        let driver = Driver {
            connector: self.connector,
            renewer: self.renewer,
            machine: ConnectionMachine::new(&self.config),
            heartbeat: HeartbeatMonitor::new(&self.config.heartbeat),
            router: MessageRouter::new(),
            subscribers: subscribers.clone(),
            state_tx,
            socket: None,
            opening: None,
            reconnect_at: None,
            renewing: None,
            close_grace: self.config.close_grace(),
            write_timeout: self.config.heartbeat.timeout(),
            respond_to_ping: self.config.heartbeat.respond_to_ping,
        };
        tokio::spawn(driver.run(cmd_rx));

        ConnectionManager {
            cmd_tx,
            state_rx,
            subscribers,
            server_url: self.server_url,
        }
    }
}

// ── Driver ──────────────────────────────────────────────────────────────────

/// Owns the socket and serializes every transport event: commands, the
/// pending open, inbound frames, heartbeat and reconnect deadlines, and
/// session renewal.
struct Driver {
    connector: Arc<dyn Connector>,
    renewer: Option<Arc<dyn SessionRenewer>>,
    machine: ConnectionMachine,
    heartbeat: HeartbeatMonitor,
    router: MessageRouter,
    subscribers: SubscriberRegistry,
    state_tx: watch::Sender<ConnectionState>,
    socket: Option<Box<dyn Socket>>,
    opening: Option<OpenFuture>,
    reconnect_at: Option<Instant>,
    renewing: Option<RenewFuture>,
    close_grace: Duration,
    /// Upper bound on a single frame write; a stalled write is a dead socket.
    write_timeout: Duration,
    respond_to_ping: bool,
}

impl Driver {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<Command>) {
        debug!("connection driver started");
        loop {
            let heartbeat_at = self.heartbeat.next_deadline();
            let reconnect_at = self.reconnect_at;

            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(cmd) => {
                        if !self.handle_command(cmd).await {
                            break;
                        }
                    },
                    None => {
                        self.stop().await;
                        break;
                    },
                },
                opened = poll_opening(&mut self.opening) => {
                    self.opening = None;
                    self.on_opened(opened).await;
                },
                frame = next_frame(&mut self.socket) => self.on_frame(frame).await,
                _ = sleep_until_opt(heartbeat_at) => self.on_heartbeat_deadline().await,
                _ = sleep_until_opt(reconnect_at) => {
                    self.reconnect_at = None;
                    info!(attempt = self.machine.attempt(), "reconnecting");
                    let effects = self.machine.reconnect_due(Instant::now());
                    self.apply(effects).await;
                },
                renewed = poll_renewal(&mut self.renewing) => {
                    self.renewing = None;
                    self.on_renewed(renewed).await;
                },
            }
        }
        debug!("connection driver stopped");
    }

    /// Returns `false` when the driver should exit.
    async fn handle_command(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::Connect { url, reply } => {
                let effects = self.machine.connect(url, Instant::now());
                if effects.is_empty() {
                    debug!(state = %self.machine.state(), "connect ignored");
                }
                self.apply(effects).await;
                let _ = reply.send(self.machine.state());
            },
            Command::Reconnect { reply } => {
                info!("manual reconnect");
                let effects = self.machine.reconnect(Instant::now());
                self.apply(effects).await;
                let _ = reply.send(self.machine.state());
            },
            Command::Disconnect { reply } => {
                info!("disconnecting");
                let effects = self.machine.disconnect("client disconnect");
                self.apply(effects).await;
                let _ = reply.send(());
            },
            Command::Send { text, reply } => {
                let result = self.send(text).await;
                let _ = reply.send(result);
            },
            Command::Shutdown { reply } => {
                self.stop().await;
                let _ = reply.send(());
                return false;
            },
        }
        true
    }

    async fn stop(&mut self) {
        let effects = self.machine.disconnect("client shutdown");
        self.apply(effects).await;
        self.renewing = None;
    }

    async fn send(&mut self, text: String) -> Result<()> {
        let state = self.machine.state();
        if state == ConnectionState::Connected {
            return self.write(text).await;
        }
        let effects = self.machine.send_failed(Instant::now());
        if !effects.is_empty() {
            info!(%state, "send while not connected, reconnecting");
        }
        self.apply(effects).await;
        Err(TransportError::NotConnected(state))
    }

    async fn write(&mut self, text: String) -> Result<()> {
        let Some(socket) = self.socket.as_mut() else {
            return Err(TransportError::NotConnected(self.machine.state()));
        };
        let error = match tokio::time::timeout(self.write_timeout, socket.send_text(text)).await {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(e)) => e,
            Err(_) => {
                warn!(
                    timeout_ms = self.write_timeout.as_millis() as u64,
                    "socket write stalled"
                );
                TransportError::WriteTimeout(self.write_timeout)
            },
        };
        self.socket_failed(&error.to_string()).await;
        Err(error)
    }

    fn open(&mut self, url: Url) {
        self.socket = None;
        self.router.set_active_session(endpoint::session_id(&url));
        info!(url = %url, attempt = self.machine.attempt(), "connecting");
        #[cfg(feature = "metrics")]
        counter!("transport_connect_attempts_total").increment(1);

        let connector = Arc::clone(&self.connector);
        self.opening = Some(Box::pin(async move { connector.connect(&url).await }));
    }

    async fn on_opened(&mut self, opened: Result<Box<dyn Socket>>) {
        match opened {
            Ok(socket) => {
                self.socket = Some(socket);
                info!(url = ?self.machine.url().map(Url::as_str), "connected");
                #[cfg(feature = "metrics")]
                counter!("transport_connections_opened_total").increment(1);
                let effects = self.machine.on_open();
                self.apply(effects).await;
            },
            Err(e) => {
                warn!(error = %e, "connection failed");
                self.socket_failed(&e.to_string()).await;
            },
        }
    }

    /// An error on the socket (or the handshake): notify, then treat as an
    /// abnormal close.
    async fn socket_failed(&mut self, message: &str) {
        self.socket = None;
        let mut effects = self.machine.on_error(message);
        effects.extend(self.machine.on_close(close_codes::ABNORMAL, message));
        self.apply(effects).await;
    }

    async fn on_frame(&mut self, frame: Option<Result<Frame>>) {
        match frame {
            Some(Ok(Frame::Text(text))) => {
                let routed = self.router.route(&text);
                self.on_routed(routed).await;
            },
            Some(Ok(Frame::Binary(bytes))) => {
                let routed = self.router.route_binary(&bytes);
                self.on_routed(routed).await;
            },
            Some(Ok(Frame::Close { code, reason })) => {
                info!(code, reason = %reason, "socket closed by peer");
                self.socket = None;
                let effects = self.machine.on_close(code, &reason);
                self.apply(effects).await;
            },
            Some(Err(e)) => {
                warn!(error = %e, "socket error");
                self.socket_failed(&e.to_string()).await;
            },
            None => {
                info!("connection lost");
                self.socket = None;
                let effects = self.machine.on_close(close_codes::ABNORMAL, "connection lost");
                self.apply(effects).await;
            },
        }
    }

    async fn on_routed(&mut self, routed: Result<Route, RouteError>) {
        #[cfg(feature = "metrics")]
        counter!("transport_frames_received_total").increment(1);

        match routed {
            Ok(Route::Ping) => {
                if self.respond_to_ping {
                    match OutboundMessage::Pong.to_text() {
                        Ok(text) => {
                            if let Err(e) = self.write(text).await {
                                debug!(error = %e, "failed to answer ping");
                            }
                        },
                        Err(e) => warn!(error = %e, "failed to encode pong"),
                    }
                }
            },
            Ok(Route::Pong) => {
                debug!("pong received");
                self.heartbeat.on_pong();
            },
            Ok(Route::ActiveSessionDeleted { session_id }) => self.on_session_deleted(session_id),
            Ok(Route::Deliver(message)) => {
                let delivered = self.subscribers.emit_message(&message);
                debug!(tag = message.tag(), delivered, "message dispatched");
            },
            Err(e) => {
                warn!(error = %e, "discarding malformed frame");
                #[cfg(feature = "metrics")]
                counter!("transport_frames_malformed_total").increment(1);
            },
        }
    }

    fn on_session_deleted(&mut self, session_id: String) {
        match &self.renewer {
            Some(renewer) => {
                info!(session_id = %session_id, "active session deleted, resolving a new one");
                let renewer = Arc::clone(renewer);
                self.renewing = Some(Box::pin(
                    async move { renewer.renew(&session_id).await },
                ));
            },
            None => {
                warn!(session_id = %session_id, "active session deleted and no renewer configured");
                self.subscribers
                    .emit_message(&InboundMessage::SessionDeleted { session_id });
            },
        }
    }

    async fn on_renewed(&mut self, renewed: Option<String>) {
        let Some(session_id) = renewed else {
            warn!("session renewal produced no session");
            return;
        };
        let Some(current) = self.machine.url().cloned() else {
            return;
        };
        if endpoint::session_id(&current).as_deref() == Some(session_id.as_str()) {
            return;
        }
        info!(session_id = %session_id, "rebinding to renewed session");
        let url = endpoint::rebind(&current, &session_id);
        let effects = self.machine.switch_url(url, Instant::now());
        self.apply(effects).await;
    }

    async fn on_heartbeat_deadline(&mut self) {
        match self.heartbeat.poll(Instant::now()) {
            Some(HeartbeatAction::SendPing) => match OutboundMessage::Ping.to_text() {
                Ok(text) => {
                    debug!("sending heartbeat ping");
                    if let Err(e) = self.write(text).await {
                        debug!(error = %e, "heartbeat ping failed");
                    }
                },
                Err(e) => warn!(error = %e, "failed to encode ping"),
            },
            Some(HeartbeatAction::TimedOut) => {
                warn!("heartbeat timed out, closing socket");
                #[cfg(feature = "metrics")]
                counter!("transport_heartbeat_timeouts_total").increment(1);
                let effects = self.machine.on_heartbeat_timeout();
                self.apply(effects).await;
            },
            None => {},
        }
    }

    async fn apply(&mut self, effects: Vec<Effect>) {
        self.publish_state();
        for effect in effects {
            match effect {
                Effect::Open(url) => self.open(url),
                Effect::Close { code, reason } => self.close_socket(code, &reason).await,
                Effect::ScheduleReconnect(delay) => {
                    info!(
                        delay_ms = delay.as_millis() as u64,
                        attempt = self.machine.attempt(),
                        "reconnect scheduled"
                    );
                    #[cfg(feature = "metrics")]
                    counter!("transport_reconnects_scheduled_total").increment(1);
                    self.reconnect_at = Some(Instant::now() + delay);
                },
                Effect::CancelReconnect => self.reconnect_at = None,
                Effect::StartHeartbeat => self.heartbeat.start(Instant::now()),
                Effect::StopHeartbeat => self.heartbeat.stop(),
                Effect::NotifyConnected(url) => {
                    self.subscribers.emit_connect(&url);
                },
                Effect::NotifyDisconnected(event) => {
                    if let DisconnectEvent::GaveUp { attempts } = &event {
                        warn!(attempts, "reconnection attempts exhausted");
                    }
                    self.subscribers.emit_disconnect(&event);
                },
            }
        }
    }

    fn publish_state(&self) {
        let state = self.machine.state();
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            debug!(from = %current, to = %state, "state changed");
            *current = state;
            true
        });
    }

    /// Close the socket (or abandon a pending open) and wait briefly for the
    /// peer's close frame. Both steps are bounded by `close_grace`.
    async fn close_socket(&mut self, code: u16, reason: &str) {
        self.opening = None;
        let Some(mut socket) = self.socket.take() else {
            return;
        };
        debug!(code, reason, "closing socket");
        match tokio::time::timeout(self.close_grace, socket.close(code, reason)).await {
            Ok(Ok(())) => {},
            Ok(Err(e)) => debug!(error = %e, "close handshake failed"),
            Err(_) => {
                debug!("close frame write stalled, dropping socket");
                return;
            },
        }
        let echo = async {
            while let Some(Ok(frame)) = socket.next().await {
                if matches!(frame, Frame::Close { .. }) {
                    break;
                }
            }
        };
        if tokio::time::timeout(self.close_grace, echo).await.is_err() {
            debug!("no close frame from peer");
        }
    }
}

async fn poll_opening(opening: &mut Option<OpenFuture>) -> Result<Box<dyn Socket>> {
    match opening {
        Some(fut) => fut.await,
        None => std::future::pending().await,
    }
}

async fn next_frame(socket: &mut Option<Box<dyn Socket>>) -> Option<Result<Frame>> {
    match socket {
        Some(socket) => socket.next().await,
        None => std::future::pending().await,
    }
}

async fn poll_renewal(renewing: &mut Option<RenewFuture>) -> Option<String> {
    match renewing {
        Some(fut) => fut.await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}
