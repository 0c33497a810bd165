use std::time::Duration;

use {
    tether_config::TransportConfig,
    tether_protocol::close_codes,
    tokio::time::Instant,
    url::Url,
};

use crate::{backoff::ReconnectPolicy, state::ConnectionState, subscribers::DisconnectEvent};

/// Work the driver performs after a transition, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Open a new socket to the URL. Any previous socket is already gone.
    Open(Url),
    /// Close the current socket (or abandon a pending open).
    Close { code: u16, reason: String },
    ScheduleReconnect(Duration),
    CancelReconnect,
    StartHeartbeat,
    StopHeartbeat,
    NotifyConnected(Url),
    NotifyDisconnected(DisconnectEvent),
}

/// Connection lifecycle as a pure state machine.
///
/// Every transition returns the effects the driver must execute. The
/// machine never touches a socket or a timer itself.
#[derive(Debug, Clone)]
pub struct ConnectionMachine {
    state: ConnectionState,
    url: Option<Url>,
    policy: ReconnectPolicy,
    min_connect_interval: Duration,
    last_attempt: Option<Instant>,
    reconnect_pending: bool,
    /// Set by a caller-initiated disconnect; cleared by the next connect.
    stopped: bool,
    gave_up_reported: bool,
}

impl ConnectionMachine {
    pub fn new(config: &TransportConfig) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            url: None,
            policy: ReconnectPolicy::new(&config.reconnect),
            min_connect_interval: config.min_connect_interval(),
            last_attempt: None,
            reconnect_pending: false,
            stopped: false,
            gave_up_reported: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn url(&self) -> Option<&Url> {
        self.url.as_ref()
    }

    pub fn attempt(&self) -> u32 {
        self.policy.attempt()
    }

    pub fn reconnect_pending(&self) -> bool {
        self.reconnect_pending
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    // ── Caller-initiated ────────────────────────────────────────────────────

    /// Caller asks for a connection. A no-op while a socket exists or while
    /// the caller throttle is in effect.
    pub fn connect(&mut self, url: Url, now: Instant) -> Vec<Effect> {
        if self.state.is_active() {
            return Vec::new();
        }
        if self.throttled(now) {
            return Vec::new();
        }
        if self.state == ConnectionState::Error {
            self.policy.reset();
            self.gave_up_reported = false;
        }
        self.begin(url, now)
    }

    /// Manual reconnect to the last URL with a fresh attempt budget. Not
    /// subject to the caller throttle.
    pub fn reconnect(&mut self, now: Instant) -> Vec<Effect> {
        let Some(url) = self.url.clone() else {
            return Vec::new();
        };
        if self.state.is_active() {
            return Vec::new();
        }
        self.policy.reset();
        self.gave_up_reported = false;
        self.begin(url, now)
    }

    fn begin(&mut self, url: Url, now: Instant) -> Vec<Effect> {
        self.stopped = false;
        self.url = Some(url);
        let mut effects = self.cancel_reconnect();
        effects.extend(self.open(now));
        effects
    }

    /// Caller-initiated close. Nothing reconnects until the next `connect`.
    pub fn disconnect(&mut self, reason: &str) -> Vec<Effect> {
        self.stopped = true;
        let was_active = self.state.is_active();
        let mut effects = self.cancel_reconnect();
        effects.push(Effect::StopHeartbeat);
        self.state = ConnectionState::Disconnected;
        if was_active {
            effects.push(Effect::Close {
                code: close_codes::NORMAL,
                reason: reason.to_string(),
            });
            effects.push(Effect::NotifyDisconnected(DisconnectEvent::Closed {
                code: close_codes::NORMAL,
                reason: reason.to_string(),
                reconnect_in: None,
            }));
        }
        effects
    }

    /// A send found no open socket. Opportunistically reconnects unless
    /// something already will, the caller stopped us, or the budget is spent.
    pub fn send_failed(&mut self, now: Instant) -> Vec<Effect> {
        if self.stopped
            || self.reconnect_pending
            || self.state != ConnectionState::Disconnected
            || self.policy.exhausted()
        {
            return Vec::new();
        }
        match self.url.clone() {
            Some(url) => self.connect(url, now),
            None => Vec::new(),
        }
    }

    /// Rebind to a new URL (the active session was replaced). Skips the
    /// caller throttle and restarts the attempt budget.
    pub fn switch_url(&mut self, url: Url, now: Instant) -> Vec<Effect> {
        self.url = Some(url);
        if self.stopped {
            return Vec::new();
        }
        self.policy.reset();
        self.gave_up_reported = false;

        let mut effects = self.cancel_reconnect();
        if self.state.is_active() {
            effects.push(Effect::StopHeartbeat);
            effects.push(Effect::Close {
                code: close_codes::NORMAL,
                reason: "session changed".into(),
            });
        }
        effects.extend(self.open(now));
        effects
    }

    // ── Socket events ───────────────────────────────────────────────────────

    pub fn on_open(&mut self) -> Vec<Effect> {
        if self.state != ConnectionState::Connecting {
            return Vec::new();
        }
        self.state = ConnectionState::Connected;
        self.policy.reset();
        self.gave_up_reported = false;
        let mut effects = vec![Effect::StartHeartbeat];
        if let Some(url) = &self.url {
            effects.push(Effect::NotifyConnected(url.clone()));
        }
        effects
    }

    /// Error notification. State is left to the close that always follows.
    pub fn on_error(&mut self, message: &str) -> Vec<Effect> {
        if !self.state.is_active() {
            return Vec::new();
        }
        vec![
            Effect::StopHeartbeat,
            Effect::NotifyDisconnected(DisconnectEvent::Error {
                message: message.to_string(),
            }),
        ]
    }

    /// The socket closed (or an open attempt failed).
    pub fn on_close(&mut self, code: u16, reason: &str) -> Vec<Effect> {
        if !self.state.is_active() {
            return Vec::new();
        }
        let mut effects = vec![Effect::StopHeartbeat];

        if close_codes::is_normal(code) || self.stopped {
            self.state = ConnectionState::Disconnected;
            effects.push(closed(code, reason, None));
            return effects;
        }

        match self.policy.next_delay() {
            Some(delay) => {
                self.state = ConnectionState::Disconnected;
                self.reconnect_pending = true;
                effects.push(closed(code, reason, Some(delay)));
                effects.push(Effect::ScheduleReconnect(delay));
            },
            None => {
                self.state = ConnectionState::Error;
                effects.push(closed(code, reason, None));
                if !self.gave_up_reported {
                    self.gave_up_reported = true;
                    effects.push(Effect::NotifyDisconnected(DisconnectEvent::GaveUp {
                        attempts: self.policy.attempt(),
                    }));
                }
            },
        }
        effects
    }

    /// No pong arrived in time: force-close, then take the abnormal path.
    pub fn on_heartbeat_timeout(&mut self) -> Vec<Effect> {
        if self.state != ConnectionState::Connected {
            return Vec::new();
        }
        let reason = "heartbeat timeout";
        let mut effects = vec![Effect::Close {
            code: close_codes::HEARTBEAT_TIMEOUT,
            reason: reason.into(),
        }];
        effects.extend(self.on_close(close_codes::HEARTBEAT_TIMEOUT, reason));
        effects
    }

    /// The backoff delay elapsed. Scheduled attempts bypass the throttle.
    pub fn reconnect_due(&mut self, now: Instant) -> Vec<Effect> {
        if !self.reconnect_pending {
            return Vec::new();
        }
        self.reconnect_pending = false;
        if self.stopped || self.state != ConnectionState::Disconnected {
            return Vec::new();
        }
        self.open(now)
    }

    // ── Helpers ─────────────────────────────────────────────────────────────

    fn throttled(&self, now: Instant) -> bool {
        self.last_attempt
            .is_some_and(|last| now.saturating_duration_since(last) < self.min_connect_interval)
    }

    fn cancel_reconnect(&mut self) -> Vec<Effect> {
        if std::mem::take(&mut self.reconnect_pending) {
            vec![Effect::CancelReconnect]
        } else {
            Vec::new()
        }
    }

    fn open(&mut self, now: Instant) -> Vec<Effect> {
        let Some(url) = self.url.clone() else {
            return Vec::new();
        };
        self.state = ConnectionState::Connecting;
        self.last_attempt = Some(now);
        vec![Effect::Open(url)]
    }
}

fn closed(code: u16, reason: &str, reconnect_in: Option<Duration>) -> Effect {
    Effect::NotifyDisconnected(DisconnectEvent::Closed {
        code,
        reason: reason.to_string(),
        reconnect_in,
    })
}

#[cfg(test)]
mod tests {
    use {super::*, tether_config::ReconnectConfig};

    fn url() -> Url {
        Url::parse("ws://h/ws/session/abc/").unwrap()
    }

    fn machine() -> ConnectionMachine {
        ConnectionMachine::new(&TransportConfig::default())
    }

    fn connected(now: Instant) -> ConnectionMachine {
        let mut m = machine();
        m.connect(url(), now);
        m.on_open();
        m
    }

    #[test]
    fn connect_then_open() {
        let now = Instant::now();
        let mut m = machine();
        assert_eq!(m.connect(url(), now), vec![Effect::Open(url())]);
        assert_eq!(m.state(), ConnectionState::Connecting);

        assert_eq!(m.on_open(), vec![
            Effect::StartHeartbeat,
            Effect::NotifyConnected(url())
        ]);
        assert_eq!(m.state(), ConnectionState::Connected);
    }

    #[test]
    fn connect_is_idempotent_while_active() {
        let now = Instant::now();
        let mut m = machine();
        m.connect(url(), now);
        let later = now + Duration::from_secs(10);
        assert!(m.connect(url(), later).is_empty());
        m.on_open();
        assert!(m.connect(url(), later).is_empty());
        assert_eq!(m.state(), ConnectionState::Connected);
    }

    #[test]
    fn caller_connects_are_throttled() {
        let now = Instant::now();
        let mut m = machine();
        m.connect(url(), now);
        m.on_close(close_codes::NORMAL, "bye");
        assert!(m.connect(url(), now + Duration::from_millis(500)).is_empty());
        assert_eq!(m.state(), ConnectionState::Disconnected);
        assert_eq!(m.connect(url(), now + Duration::from_secs(2)), vec![Effect::Open(url())]);
    }

    #[test]
    fn normal_close_does_not_retry() {
        let mut m = connected(Instant::now());
        let effects = m.on_close(close_codes::NORMAL, "");
        assert_eq!(m.state(), ConnectionState::Disconnected);
        assert!(!effects.iter().any(|e| matches!(e, Effect::ScheduleReconnect(_))));
        assert!(!m.reconnect_pending());
    }

    #[test]
    fn abnormal_close_schedules_backoff() {
        let now = Instant::now();
        let mut m = connected(now);
        let effects = m.on_close(close_codes::ABNORMAL, "");
        assert_eq!(effects, vec![
            Effect::StopHeartbeat,
            closed(close_codes::ABNORMAL, "", Some(Duration::from_secs(1))),
            Effect::ScheduleReconnect(Duration::from_secs(1)),
        ]);
        assert_eq!(m.attempt(), 1);

        // Scheduled attempts ignore the caller throttle.
        assert_eq!(m.reconnect_due(now), vec![Effect::Open(url())]);
        m.on_close(close_codes::ABNORMAL, "");
        assert_eq!(m.attempt(), 2);
        m.reconnect_due(now);
        m.on_open();
        assert_eq!(m.attempt(), 0);
    }

    #[test]
    fn heartbeat_timeout_forces_close_and_reconnects() {
        let mut m = connected(Instant::now());
        let effects = m.on_heartbeat_timeout();
        assert_eq!(effects[0], Effect::Close {
            code: close_codes::HEARTBEAT_TIMEOUT,
            reason: "heartbeat timeout".into()
        });
        assert!(effects.contains(&Effect::ScheduleReconnect(Duration::from_secs(1))));
        assert_eq!(m.attempt(), 1);
        assert_eq!(m.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn exhaustion_reports_once_and_enters_error() {
        let now = Instant::now();
        let mut m = ConnectionMachine::new(&TransportConfig {
            reconnect: ReconnectConfig {
                max_attempts: 15,
                ..ReconnectConfig::default()
            },
            ..TransportConfig::default()
        });
        m.connect(url(), now);
        m.on_open();

        let mut scheduled = 0;
        let mut gave_up = 0;
        for _ in 0..16 {
            for effect in m.on_close(close_codes::ABNORMAL, "") {
                match effect {
                    Effect::ScheduleReconnect(_) => scheduled += 1,
                    Effect::NotifyDisconnected(DisconnectEvent::GaveUp { attempts }) => {
                        assert_eq!(attempts, 15);
                        gave_up += 1;
                    },
                    _ => {},
                }
            }
            m.reconnect_due(now);
        }
        assert_eq!(scheduled, 15);
        assert_eq!(gave_up, 1);
        assert_eq!(m.state(), ConnectionState::Error);

        // Terminal: nothing automatic happens any more.
        assert!(m.reconnect_due(now).is_empty());
        assert!(m.on_close(close_codes::ABNORMAL, "").is_empty());
        assert!(m.send_failed(now + Duration::from_secs(60)).is_empty());

        // Manual intervention starts over.
        let later = now + Duration::from_secs(60);
        assert_eq!(m.connect(url(), later), vec![Effect::Open(url())]);
        assert_eq!(m.attempt(), 0);
    }

    #[test]
    fn disconnect_is_terminal_for_automation() {
        let now = Instant::now();
        let mut m = connected(now);
        m.on_close(close_codes::ABNORMAL, "");
        assert!(m.reconnect_pending());

        let effects = m.disconnect("bye");
        assert!(effects.contains(&Effect::CancelReconnect));
        assert!(!effects.iter().any(|e| matches!(e, Effect::Close { .. })));
        assert!(m.reconnect_due(now).is_empty());
        assert!(m.send_failed(now + Duration::from_secs(60)).is_empty());
        assert_eq!(m.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn disconnect_while_connected_closes_normally() {
        let mut m = connected(Instant::now());
        let effects = m.disconnect("bye");
        assert!(effects.contains(&Effect::Close {
            code: close_codes::NORMAL,
            reason: "bye".into()
        }));
        assert!(m.is_stopped());
        // A late close event for the dropped socket changes nothing.
        assert!(m.on_close(close_codes::ABNORMAL, "").is_empty());
    }

    #[test]
    fn error_notifies_without_changing_state() {
        let mut m = connected(Instant::now());
        let effects = m.on_error("reset by peer");
        assert_eq!(effects, vec![
            Effect::StopHeartbeat,
            Effect::NotifyDisconnected(DisconnectEvent::Error {
                message: "reset by peer".into()
            }),
        ]);
        assert_eq!(m.state(), ConnectionState::Connected);
    }

    #[test]
    fn send_failure_reconnects_opportunistically() {
        let now = Instant::now();
        let mut m = connected(now);
        m.on_close(close_codes::NORMAL, "server restart");
        let later = now + Duration::from_secs(5);
        assert_eq!(m.send_failed(later), vec![Effect::Open(url())]);

        // Not while a scheduled reconnect is pending.
        let mut m = connected(now);
        m.on_close(close_codes::ABNORMAL, "");
        assert!(m.send_failed(later).is_empty());
    }

    #[test]
    fn switch_url_reopens_immediately() {
        let now = Instant::now();
        let mut m = connected(now);
        let other = Url::parse("ws://h/ws/session/xyz/").unwrap();
        let effects = m.switch_url(other.clone(), now);
        assert_eq!(effects, vec![
            Effect::StopHeartbeat,
            Effect::Close {
                code: close_codes::NORMAL,
                reason: "session changed".into()
            },
            Effect::Open(other.clone()),
        ]);
        assert_eq!(m.url(), Some(&other));
        assert_eq!(m.state(), ConnectionState::Connecting);
    }

    #[test]
    fn manual_reconnect_resets_budget() {
        let now = Instant::now();
        let mut m = connected(now);
        m.on_close(close_codes::ABNORMAL, "");
        assert_eq!(m.attempt(), 1);
        let effects = m.reconnect(now + Duration::from_secs(5));
        assert_eq!(effects, vec![Effect::CancelReconnect, Effect::Open(url())]);
        assert_eq!(m.attempt(), 0);
    }

    #[test]
    fn manual_reconnect_from_error_ignores_throttle() {
        let now = Instant::now();
        let mut m = ConnectionMachine::new(&TransportConfig {
            reconnect: ReconnectConfig {
                max_attempts: 1,
                ..ReconnectConfig::default()
            },
            ..TransportConfig::default()
        });
        m.connect(url(), now);
        m.on_close(close_codes::ABNORMAL, "refused");
        m.reconnect_due(now);
        m.on_close(close_codes::ABNORMAL, "refused");
        assert_eq!(m.state(), ConnectionState::Error);

        // Same instant as the last failed open.
        assert_eq!(m.reconnect(now), vec![Effect::Open(url())]);
        assert_eq!(m.state(), ConnectionState::Connecting);
        assert_eq!(m.attempt(), 0);
    }
}
