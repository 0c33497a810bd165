use std::time::Duration;

use {tether_config::HeartbeatConfig, tokio::time::Instant};

/// What the driver should do when a heartbeat deadline passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatAction {
    /// Write a `ping` frame. A pong deadline has been armed.
    SendPing,
    /// The last ping went unanswered; force-close the socket.
    TimedOut,
}

/// Ping/pong liveness probing, expressed as deadlines.
///
/// The monitor owns no timers. The driver sleeps until
/// [`next_deadline`](Self::next_deadline) and then calls
/// [`poll`](Self::poll), so arming a deadline always replaces the previous
/// one and stopping is just clearing both.
#[derive(Debug, Clone)]
pub struct HeartbeatMonitor {
    enabled: bool,
    interval: Duration,
    timeout: Duration,
    next_ping: Option<Instant>,
    pong_deadline: Option<Instant>,
}

impl HeartbeatMonitor {
    pub fn new(config: &HeartbeatConfig) -> Self {
        Self {
            enabled: config.enabled,
            interval: config.interval(),
            timeout: config.timeout(),
            next_ping: None,
            pong_deadline: None,
        }
    }

    /// Begin probing; the first ping is due one interval from `now`.
    pub fn start(&mut self, now: Instant) {
        if !self.enabled {
            return;
        }
        self.next_ping = Some(now + self.interval);
        self.pong_deadline = None;
    }

    pub fn stop(&mut self) {
        self.next_ping = None;
        self.pong_deadline = None;
    }

    pub fn awaiting_pong(&self) -> bool {
        self.pong_deadline.is_some()
    }

    /// The earliest instant at which [`poll`](Self::poll) has work to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.next_ping, self.pong_deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    pub fn poll(&mut self, now: Instant) -> Option<HeartbeatAction> {
        if self.pong_deadline.is_some_and(|d| now >= d) {
            self.stop();
            return Some(HeartbeatAction::TimedOut);
        }
        if self.next_ping.is_some_and(|d| now >= d) {
            self.next_ping = Some(now + self.interval);
            self.pong_deadline = Some(now + self.timeout);
            return Some(HeartbeatAction::SendPing);
        }
        None
    }

    pub fn on_pong(&mut self) {
        self.pong_deadline = None;
    }
}
