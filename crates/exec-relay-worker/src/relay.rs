//! Runtime-free half of the edge relay: turns socket events into
//! [`RelayCore`] input and carries out its directives against anything that
//! can send and close synchronously, as Workers sockets do.

use std::time::Duration;

use exec_relay::relay::{Directive, GOING_AWAY};
use exec_relay::{CloseFrame, RelayCore, RelayFrame, SessionState, Side, SocketEvent, Termination};

pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(1800);
const MAX_IDLE_TIMEOUT_SECS: u64 = 7 * 24 * 60 * 60;

/// One side of an edge session.
pub trait EdgeSocket {
    fn send(&self, frame: RelayFrame) -> Result<(), String>;

    /// Best effort; failures are the implementation's to report.
    fn close(&self, frame: &CloseFrame);
}

/// Idle timeout from the `EXEC_IDLE_TIMEOUT_SECS` var. `0` disables it;
/// unset, unparsable or more than a week keeps the default.
pub fn idle_timeout_from_var(raw: Option<&str>) -> Option<Duration> {
    match raw.map(str::trim).and_then(|raw| raw.parse::<u64>().ok()) {
        Some(0) => None,
        Some(seconds) if seconds <= MAX_IDLE_TIMEOUT_SECS => Some(Duration::from_secs(seconds)),
        _ => Some(DEFAULT_IDLE_TIMEOUT),
    }
}

/// A data message as a relay event. Text wins when both payloads are set;
/// neither means the message carried nothing relayable.
pub fn message_event(text: Option<String>, bytes: Option<Vec<u8>>) -> Option<SocketEvent> {
    text.map(RelayFrame::Text)
        .or_else(|| bytes.map(RelayFrame::Binary))
        .map(SocketEvent::Message)
}

pub fn close_event(code: u16, reason: String) -> SocketEvent {
    SocketEvent::Closed(Some(CloseFrame::new(code, reason)))
}

#[derive(Debug)]
pub struct EdgeRelay {
    core: RelayCore,
    frames_to_upstream: u64,
    frames_to_client: u64,
}

impl Default for EdgeRelay {
    fn default() -> Self {
        Self::new()
    }
}

impl EdgeRelay {
    /// Both sockets are already accepted, so the session starts open.
    pub fn new() -> Self {
        let mut core = RelayCore::new();
        core.open();
        Self {
            core,
            frames_to_upstream: 0,
            frames_to_client: 0,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.core.state() == SessionState::Closed
    }

    pub fn termination(&self) -> Option<&Termination> {
        self.core.termination()
    }

    pub fn frames_to_upstream(&self) -> u64 {
        self.frames_to_upstream
    }

    pub fn frames_to_client(&self) -> u64 {
        self.frames_to_client
    }

    /// Returns true when a frame was relayed, which restarts the idle timer.
    pub fn on_event<S>(&mut self, from: Side, event: SocketEvent, client: &S, upstream: &S) -> bool
    where
        S: EdgeSocket + ?Sized,
    {
        let directive = self.core.on_event(from, event);
        self.execute(directive, client, upstream)
    }

    pub fn on_idle_timeout<S>(&mut self, client: &S, upstream: &S)
    where
        S: EdgeSocket + ?Sized,
    {
        let directive = self.core.shutdown(
            Termination::IdleTimeout,
            CloseFrame::new(GOING_AWAY, "idle timeout"),
        );
        self.execute(directive, client, upstream);
    }

    fn execute<S>(&mut self, directive: Directive, client: &S, upstream: &S) -> bool
    where
        S: EdgeSocket + ?Sized,
    {
        let socket = |side: Side| match side {
            Side::Client => client,
            Side::Upstream => upstream,
        };
        match directive {
            Directive::Forward { to, frame } => match socket(to).send(frame) {
                Ok(()) => {
                    match to {
                        Side::Upstream => self.frames_to_upstream += 1,
                        Side::Client => self.frames_to_client += 1,
                    }
                    true
                }
                Err(message) => {
                    if let Directive::Close { side, frame } =
                        self.core.on_event(to, SocketEvent::Error(message))
                    {
                        socket(side).close(&frame);
                    }
                    self.core.finish();
                    false
                }
            },
            Directive::Close { side, frame } => {
                socket(side).close(&frame);
                // Workers leave answering a received close to the script.
                if let Some(Termination::Closed { by, .. }) = self.core.termination() {
                    socket(*by).close(&frame);
                }
                self.core.finish();
                false
            }
            Directive::CloseBoth(frame) => {
                client.close(&frame);
                upstream.close(&frame);
                self.core.finish();
                false
            }
            Directive::Ignore => false,
        }
    }
}
