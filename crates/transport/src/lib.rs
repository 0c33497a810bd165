//! Real-time session transport.
//!
//! A [`ConnectionManager`] owns one WebSocket per session and keeps it alive:
//! bounded exponential reconnection, ping/pong heartbeats, and fan-out of
//! normalized inbound messages to any number of subscribers.
//!
//! [`ConnectionMachine`] holds the lifecycle rules as pure transitions;
//! [`HeartbeatMonitor`] and [`ReconnectPolicy`] compute deadlines;
//! [`MessageRouter`] parses frames. One driver task per manager executes the
//! resulting effects.

pub mod backoff;
pub mod endpoint;
pub mod error;
pub mod heartbeat;
pub mod machine;
pub mod manager;
pub mod renew;
pub mod router;
pub mod socket;
pub mod state;
pub mod subscribers;

pub use {
    backoff::ReconnectPolicy,
    error::TransportError,
    heartbeat::{HeartbeatAction, HeartbeatMonitor},
    machine::{ConnectionMachine, Effect},
    manager::{ConnectionManager, ConnectionManagerBuilder},
    renew::SessionRenewer,
    router::{MessageRouter, Route, RouteError},
    socket::{Connector, Frame, Socket, TungsteniteConnector},
    state::ConnectionState,
    subscribers::{DisconnectEvent, SubscriberCounts, SubscriberRegistry, Subscription},
};
