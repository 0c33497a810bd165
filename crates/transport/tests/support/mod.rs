//! In-memory sockets for driving a `ConnectionManager` deterministically.
#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use {
    async_trait::async_trait,
    serde_json::Value,
    tether_config::TransportConfig,
    tether_transport::{Connector, DisconnectEvent, Frame, Socket, TransportError},
    tokio::sync::mpsc,
    url::Url,
};

pub const SESSION_URL: &str = "ws://h/ws/session/abc/";

/// What the client wrote to a fake socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sent {
    Text(String),
    Close { code: u16, reason: String },
}

impl Sent {
    pub fn json(&self) -> Value {
        match self {
            Self::Text(text) => serde_json::from_str(text).expect("client sent invalid json"),
            Self::Close { .. } => panic!("expected text, got {self:?}"),
        }
    }
}

/// The server side of one accepted fake connection.
pub struct ServerEnd {
    pub url: Url,
    to_client: Option<mpsc::UnboundedSender<Frame>>,
    from_client: mpsc::UnboundedReceiver<Sent>,
}

impl ServerEnd {
    pub fn send(&self, text: &str) {
        if let Some(tx) = &self.to_client {
            let _ = tx.send(Frame::Text(text.to_string()));
        }
    }

    pub fn send_json(&self, value: Value) {
        self.send(&value.to_string());
    }

    pub fn close(&self, code: u16, reason: &str) {
        if let Some(tx) = &self.to_client {
            let _ = tx.send(Frame::Close {
                code,
                reason: reason.to_string(),
            });
        }
    }

    /// Drop the connection without a close frame.
    pub fn drop_connection(&mut self) {
        self.to_client = None;
    }

    pub async fn recv(&mut self) -> Sent {
        self.from_client
            .recv()
            .await
            .expect("client side dropped")
    }

    pub fn try_recv(&mut self) -> Option<Sent> {
        self.from_client.try_recv().ok()
    }
}

#[derive(Default)]
struct Live {
    current: AtomicUsize,
    max: AtomicUsize,
}

struct FakeSocket {
    incoming: mpsc::UnboundedReceiver<Frame>,
    outgoing: mpsc::UnboundedSender<Sent>,
    closed: bool,
    stalled: bool,
    live: Arc<Live>,
}

#[async_trait]
impl Socket for FakeSocket {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        if self.stalled {
            std::future::pending::<()>().await;
        }
        if self.closed {
            return Err(TransportError::Socket("socket closed".into()));
        }
        self.outgoing
            .send(Sent::Text(text))
            .map_err(|_| TransportError::Socket("peer gone".into()))
    }

    async fn next(&mut self) -> Option<Result<Frame, TransportError>> {
        if self.closed {
            return None;
        }
        self.incoming.recv().await.map(Ok)
    }

    async fn close(&mut self, code: u16, reason: &str) -> Result<(), TransportError> {
        if self.stalled {
            std::future::pending::<()>().await;
        }
        self.closed = true;
        let _ = self.outgoing.send(Sent::Close {
            code,
            reason: reason.to_string(),
        });
        Ok(())
    }
}

impl Drop for FakeSocket {
    fn drop(&mut self) {
        self.live.current.fetch_sub(1, Ordering::SeqCst);
    }
}

struct Inner {
    accepted_tx: mpsc::UnboundedSender<ServerEnd>,
    accepted_rx: Mutex<mpsc::UnboundedReceiver<ServerEnd>>,
    attempts: AtomicUsize,
    refuse: AtomicBool,
    stall_writes: AtomicBool,
    live: Arc<Live>,
}

/// Hands out in-memory sockets and counts connection attempts.
#[derive(Clone)]
pub struct FakeConnector {
    inner: Arc<Inner>,
}

impl FakeConnector {
    pub fn new() -> Self {
        let (accepted_tx, accepted_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                accepted_tx,
                accepted_rx: Mutex::new(accepted_rx),
                attempts: AtomicUsize::new(0),
                refuse: AtomicBool::new(false),
                stall_writes: AtomicBool::new(false),
                live: Arc::new(Live::default()),
            }),
        }
    }

    /// Make every following connection attempt fail.
    pub fn refuse(&self, refuse: bool) {
        self.inner.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Sockets opened from now on never finish a write or a close, like a
    /// peer that stopped reading.
    pub fn stall_writes(&self, stall: bool) {
        self.inner.stall_writes.store(stall, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> usize {
        self.inner.attempts.load(Ordering::SeqCst)
    }

    /// Most sockets ever alive at the same time.
    pub fn max_live(&self) -> usize {
        self.inner.live.max.load(Ordering::SeqCst)
    }

    /// The next accepted connection, waiting (in virtual time) for it.
    pub async fn accept(&self) -> ServerEnd {
        for _ in 0..600 {
            if let Some(end) = self.try_accept() {
                return end;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        panic!("no connection accepted within 60s");
    }

    pub fn try_accept(&self) -> Option<ServerEnd> {
        self.inner.accepted_rx.lock().unwrap().try_recv().ok()
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, url: &Url) -> Result<Box<dyn Socket>, TransportError> {
        self.inner.attempts.fetch_add(1, Ordering::SeqCst);
        if self.inner.refuse.load(Ordering::SeqCst) {
            return Err(TransportError::Socket("connection refused".into()));
        }

        let (to_client, incoming) = mpsc::unbounded_channel();
        let (outgoing, from_client) = mpsc::unbounded_channel();
        let live = Arc::clone(&self.inner.live);
        let now = live.current.fetch_add(1, Ordering::SeqCst) + 1;
        live.max.fetch_max(now, Ordering::SeqCst);

        let _ = self.inner.accepted_tx.send(ServerEnd {
            url: url.clone(),
            to_client: Some(to_client),
            from_client,
        });
        Ok(Box::new(FakeSocket {
            incoming,
            outgoing,
            closed: false,
            stalled: self.inner.stall_writes.load(Ordering::SeqCst),
            live,
        }))
    }
}

pub fn config() -> TransportConfig {
    TransportConfig::default()
}

/// Collects events from a subscriber callback.
#[derive(Clone)]
pub struct Recorder<T> {
    events: Arc<Mutex<Vec<T>>>,
}

impl<T: Clone + Send + 'static> Recorder<T> {
    pub fn new() -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn callback(&self) -> impl Fn(&T) + Send + Sync + 'static {
        let events = Arc::clone(&self.events);
        move |event: &T| events.lock().unwrap().push(event.clone())
    }

    pub fn events(&self) -> Vec<T> {
        self.events.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    /// Wait (in virtual time) until at least `n` events were recorded.
    pub async fn wait_for(&self, n: usize) -> Vec<T> {
        self.wait_until(|events| events.len() >= n).await
    }

    /// Wait (in virtual time) until `done` holds for the recorded events.
    pub async fn wait_until(&self, done: impl Fn(&[T]) -> bool) -> Vec<T> {
        for _ in 0..600 {
            let events = self.events();
            if done(&events) {
                return events;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not met, got {} events", self.len());
    }
}

pub fn gave_up_count(events: &[DisconnectEvent]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, DisconnectEvent::GaveUp { .. }))
        .count()
}
