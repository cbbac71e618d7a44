//! Bidirectional relay between the browser socket and the cluster socket.
//!
//! [`RelayCore`] decides what happens to each socket event without doing
//! any I/O. The tokio driver in [`session`] and the edge worker both feed it
//! events and carry out the [`Directive`]s it returns.

mod state;

#[cfg(all(test, feature = "runtime"))]
pub(crate) mod memory;
#[cfg(feature = "runtime")]
pub mod session;
#[cfg(feature = "runtime")]
pub mod socket;

pub use state::{Directive, RelayCore, SessionState, Termination};

pub const NORMAL_CLOSURE: u16 = 1000;
pub const GOING_AWAY: u16 = 1001;
pub const INTERNAL_ERROR: u16 = 1011;

/// Close reasons must fit a control frame alongside the 2-byte code.
pub const MAX_CLOSE_REASON_BYTES: usize = 123;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Client,
    Upstream,
}

impl Side {
    pub fn peer(self) -> Self {
        match self {
            Self::Client => Self::Upstream,
            Self::Upstream => Self::Client,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Client => "client",
            Self::Upstream => "upstream",
        }
    }
}

/// A data frame, relayed verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayFrame {
    Text(String),
    Binary(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseFrame {
    pub code: u16,
    pub reason: String,
}

impl CloseFrame {
    /// Builds a close frame, cutting `reason` to [`MAX_CLOSE_REASON_BYTES`]
    /// on a char boundary.
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        let mut reason = reason.into();
        if reason.len() > MAX_CLOSE_REASON_BYTES {
            let mut end = MAX_CLOSE_REASON_BYTES;
            while !reason.is_char_boundary(end) {
                end -= 1;
            }
            reason.truncate(end);
        }
        Self { code, reason }
    }

    pub fn normal() -> Self {
        Self::new(NORMAL_CLOSURE, "")
    }

    /// The frame to send to the other side after `received` arrived. Codes
    /// that may not appear on the wire (1005, 1006, 1015 and anything
    /// outside the assigned ranges) become 1000.
    pub fn mirrored(received: Option<CloseFrame>) -> Self {
        match received {
            Some(frame) if is_sendable_close_code(frame.code) => Self::new(frame.code, frame.reason),
            _ => Self::normal(),
        }
    }
}

pub fn is_sendable_close_code(code: u16) -> bool {
    matches!(code, 1000..=1003 | 1007..=1014 | 3000..=4999)
}

/// What a socket reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    Message(RelayFrame),
    /// Peer sent a close frame, or the stream ended (`None`).
    Closed(Option<CloseFrame>),
    Error(String),
}
