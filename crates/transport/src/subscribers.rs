use std::{
    collections::BTreeMap,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{Arc, Mutex, Weak},
    time::Duration,
};

use {tether_protocol::InboundMessage, tracing::error, url::Url};

/// Why the disconnect channel fired.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectEvent {
    /// The socket closed. `reconnect_in` is set when a reconnection has been
    /// scheduled.
    Closed {
        code: u16,
        reason: String,
        reconnect_in: Option<Duration>,
    },
    /// A socket or handshake error. A `Closed` event follows.
    Error { message: String },
    /// Reconnection attempts are exhausted; fires once per exhaustion.
    GaveUp { attempts: u32 },
}

type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Channel<T> {
    next_id: u64,
    handlers: BTreeMap<u64, Handler<T>>,
}

impl<T> Default for Channel<T> {
    fn default() -> Self {
        Self {
            next_id: 0,
            handlers: BTreeMap::new(),
        }
    }
}

#[derive(Default)]
struct Channels {
    message: Mutex<Channel<InboundMessage>>,
    connect: Mutex<Channel<Url>>,
    disconnect: Mutex<Channel<DisconnectEvent>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChannelKind {
    Message,
    Connect,
    Disconnect,
}

impl ChannelKind {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::Connect => "connect",
            Self::Disconnect => "disconnect",
        }
    }
}

/// Per-channel subscriber counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscriberCounts {
    pub message: usize,
    pub connect: usize,
    pub disconnect: usize,
}

/// Consumer callbacks on the message, connect and disconnect channels.
///
/// Handlers run synchronously on the dispatching task, in registration
/// order. The registry lock is not held while a handler runs, so handlers
/// may register or unregister freely; a handler removed mid-dispatch still
/// sees the event being dispatched. A panicking handler is logged and the
/// remaining handlers still run.
#[derive(Clone, Default)]
pub struct SubscriberRegistry {
    channels: Arc<Channels>,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_message(&self, f: impl Fn(&InboundMessage) + Send + Sync + 'static) -> Subscription {
        let id = insert(&self.channels.message, Arc::new(f));
        self.subscription(ChannelKind::Message, id)
    }

    pub fn on_connect(&self, f: impl Fn(&Url) + Send + Sync + 'static) -> Subscription {
        let id = insert(&self.channels.connect, Arc::new(f));
        self.subscription(ChannelKind::Connect, id)
    }

    pub fn on_disconnect(
        &self,
        f: impl Fn(&DisconnectEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let id = insert(&self.channels.disconnect, Arc::new(f));
        self.subscription(ChannelKind::Disconnect, id)
    }

    pub fn emit_message(&self, message: &InboundMessage) -> usize {
        dispatch(&self.channels.message, ChannelKind::Message, message)
    }

    pub fn emit_connect(&self, url: &Url) -> usize {
        dispatch(&self.channels.connect, ChannelKind::Connect, url)
    }

    pub fn emit_disconnect(&self, event: &DisconnectEvent) -> usize {
        dispatch(&self.channels.disconnect, ChannelKind::Disconnect, event)
    }

    pub fn counts(&self) -> SubscriberCounts {
        SubscriberCounts {
            message: len(&self.channels.message),
            connect: len(&self.channels.connect),
            disconnect: len(&self.channels.disconnect),
        }
    }

    fn subscription(&self, kind: ChannelKind, id: u64) -> Subscription {
        Subscription {
            channels: Some(Arc::downgrade(&self.channels)),
            kind,
            id,
        }
    }
}

fn insert<T>(channel: &Mutex<Channel<T>>, handler: Handler<T>) -> u64 {
    let mut ch = channel.lock().unwrap_or_else(|e| e.into_inner());
    let id = ch.next_id;
    ch.next_id += 1;
    ch.handlers.insert(id, handler);
    id
}

fn len<T>(channel: &Mutex<Channel<T>>) -> usize {
    channel
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .handlers
        .len()
}

fn dispatch<T>(channel: &Mutex<Channel<T>>, kind: ChannelKind, value: &T) -> usize {
    let handlers: Vec<Handler<T>> = channel
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .handlers
        .values()
        .cloned()
        .collect();

    for handler in &handlers {
        if catch_unwind(AssertUnwindSafe(|| handler(value))).is_err() {
            error!(channel = kind.as_str(), "subscriber panicked");
        }
    }
    handlers.len()
}

/// Registration token. Unregisters its handler on
/// [`unsubscribe`](Self::unsubscribe) or drop.
#[must_use = "dropping a Subscription unregisters the handler"]
pub struct Subscription {
    channels: Option<Weak<Channels>>,
    kind: ChannelKind,
    id: u64,
}

impl Subscription {
    pub fn unsubscribe(mut self) {
        self.remove();
    }

    /// Keep the handler registered for the registry's whole lifetime.
    pub fn detach(mut self) {
        self.channels = None;
    }

    fn remove(&mut self) {
        let Some(channels) = self.channels.take().and_then(|w| w.upgrade()) else {
            return;
        };
        match self.kind {
            ChannelKind::Message => remove(&channels.message, self.id),
            ChannelKind::Connect => remove(&channels.connect, self.id),
            ChannelKind::Disconnect => remove(&channels.disconnect, self.id),
        }
    }
}

fn remove<T>(channel: &Mutex<Channel<T>>, id: u64) {
    channel
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .handlers
        .remove(&id);
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.remove();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("channel", &self.kind.as_str())
            .field("id", &self.id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        std::sync::atomic::{AtomicUsize, Ordering},
    };

    fn error_msg(text: &str) -> InboundMessage {
        InboundMessage::Error {
            message: text.into(),
        }
    }

    #[test]
    fn dispatch_in_registration_order() {
        let registry = SubscriberRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let subs: Vec<_> = (0..3)
            .map(|i| {
                let log = Arc::clone(&log);
                registry.on_message(move |_| log.lock().unwrap().push(i))
            })
            .collect();

        assert_eq!(registry.emit_message(&error_msg("x")), 3);
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2]);
        drop(subs);
    }

    #[test]
    fn unsubscribe_leaves_others() {
        let registry = SubscriberRegistry::new();
        let a = Arc::new(AtomicUsize::new(0));
        let b = Arc::new(AtomicUsize::new(0));

        let sub_a = {
            let a = Arc::clone(&a);
            registry.on_message(move |_| {
                a.fetch_add(1, Ordering::SeqCst);
            })
        };
        let _sub_b = {
            let b = Arc::clone(&b);
            registry.on_message(move |_| {
                b.fetch_add(1, Ordering::SeqCst);
            })
        };

        registry.emit_message(&error_msg("1"));
        sub_a.unsubscribe();
        registry.emit_message(&error_msg("2"));

        assert_eq!(a.load(Ordering::SeqCst), 1);
        assert_eq!(b.load(Ordering::SeqCst), 2);
        assert_eq!(registry.counts().message, 1);
    }

    #[test]
    fn drop_unsubscribes_and_detach_keeps() {
        let registry = SubscriberRegistry::new();
        {
            let _sub = registry.on_connect(|_| {});
            assert_eq!(registry.counts().connect, 1);
        }
        assert_eq!(registry.counts().connect, 0);

        registry.on_disconnect(|_| {}).detach();
        assert_eq!(registry.counts(), SubscriberCounts {
            message: 0,
            connect: 0,
            disconnect: 1,
        });
    }

    #[test]
    fn panicking_handler_is_isolated() {
        let registry = SubscriberRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let _bad = registry.on_message(|_| panic!("handler bug"));
        let _good = {
            let hits = Arc::clone(&hits);
            registry.on_message(move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
            })
        };

        registry.emit_message(&error_msg("x"));
        registry.emit_message(&error_msg("y"));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn handler_may_unsubscribe_during_dispatch() {
        let registry = SubscriberRegistry::new();
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        let hits = Arc::new(AtomicUsize::new(0));

        let sub = {
            let slot = Arc::clone(&slot);
            let hits = Arc::clone(&hits);
            registry.on_message(move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
                if let Some(sub) = slot.lock().unwrap().take() {
                    sub.unsubscribe();
                }
            })
        };
        *slot.lock().unwrap() = Some(sub);

        registry.emit_message(&error_msg("1"));
        registry.emit_message(&error_msg("2"));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(registry.counts().message, 0);
    }

    #[test]
    fn subscription_outliving_registry_is_harmless() {
        let registry = SubscriberRegistry::new();
        let sub = registry.on_message(|_| {});
        drop(registry);
        sub.unsubscribe();
    }
}
