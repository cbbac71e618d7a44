use tracing::trace;

use super::{CloseFrame, INTERNAL_ERROR, RelayFrame, Side, SocketEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// How a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    /// `by` sent a close frame (`code`) or its stream ended (`None`).
    Closed { by: Side, code: Option<u16> },
    /// `by` failed to read or accept a write.
    Errored { by: Side, message: String },
    IdleTimeout,
    /// Closed from outside the session, for example on shutdown.
    Terminated { code: u16 },
}

/// I/O the caller must perform next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    Forward { to: Side, frame: RelayFrame },
    /// Close one side; the other is already gone.
    Close { side: Side, frame: CloseFrame },
    CloseBoth(CloseFrame),
    Ignore,
}

/// Relay state machine: `Connecting → Open → Closing → Closed`.
///
/// Data frames move only while `Open`. The first close or error on either
/// side moves the session to `Closing` and asks for the other side to be
/// closed; later events are ignored. The caller reports completion of the
/// close I/O with [`finish`](Self::finish).
#[derive(Debug)]
pub struct RelayCore {
    state: SessionState,
    termination: Option<Termination>,
}

impl Default for RelayCore {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayCore {
    pub fn new() -> Self {
        Self {
            state: SessionState::Connecting,
            termination: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn termination(&self) -> Option<&Termination> {
        self.termination.as_ref()
    }

    /// Both sockets are live.
    pub fn open(&mut self) {
        if self.state == SessionState::Connecting {
            self.state = SessionState::Open;
        }
    }

    pub fn on_event(&mut self, from: Side, event: SocketEvent) -> Directive {
        if self.is_winding_down() {
            trace!(side = from.as_str(), "event after close ignored");
            return Directive::Ignore;
        }
        match event {
            SocketEvent::Message(frame) => {
                if self.state == SessionState::Open {
                    Directive::Forward {
                        to: from.peer(),
                        frame,
                    }
                } else {
                    trace!(side = from.as_str(), "frame before open dropped");
                    Directive::Ignore
                }
            }
            SocketEvent::Closed(frame) => {
                self.begin_closing(Termination::Closed {
                    by: from,
                    code: frame.as_ref().map(|frame| frame.code),
                });
                Directive::Close {
                    side: from.peer(),
                    frame: CloseFrame::mirrored(frame),
                }
            }
            SocketEvent::Error(message) => {
                let reason = format!("{} error", from.as_str());
                self.begin_closing(Termination::Errored { by: from, message });
                Directive::Close {
                    side: from.peer(),
                    frame: CloseFrame::new(INTERNAL_ERROR, reason),
                }
            }
        }
    }

    /// Ends the session from outside: both sides get `frame`.
    pub fn shutdown(&mut self, termination: Termination, frame: CloseFrame) -> Directive {
        if self.is_winding_down() {
            return Directive::Ignore;
        }
        self.begin_closing(termination);
        Directive::CloseBoth(frame)
    }

    pub fn finish(&mut self) {
        self.state = SessionState::Closed;
    }

    fn is_winding_down(&self) -> bool {
        matches!(self.state, SessionState::Closing | SessionState::Closed)
    }

    fn begin_closing(&mut self, termination: Termination) {
        self.state = SessionState::Closing;
        self.termination = Some(termination);
    }
}
