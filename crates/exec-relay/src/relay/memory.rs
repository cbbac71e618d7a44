//! In-memory sockets for driving sessions without a network.

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::socket::{RelaySocket, SocketError};
use super::{CloseFrame, RelayFrame, SocketEvent};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Outbound {
    Frame(RelayFrame),
    Close(CloseFrame),
    /// The session answered a close received from this peer.
    CloseAck,
}

pub(crate) struct MemorySocket {
    events: mpsc::UnboundedReceiver<SocketEvent>,
    outbound: mpsc::UnboundedSender<Outbound>,
    closed: bool,
}

/// The test's handle on a [`MemorySocket`]: push events in, read what the
/// session wrote out.
pub(crate) struct MemoryPeer {
    pub(crate) events: mpsc::UnboundedSender<SocketEvent>,
    pub(crate) outbound: mpsc::UnboundedReceiver<Outbound>,
}

pub(crate) fn memory_socket() -> (MemorySocket, MemoryPeer) {
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    (
        MemorySocket {
            events: events_rx,
            outbound: outbound_tx,
            closed: false,
        },
        MemoryPeer {
            events: events_tx,
            outbound: outbound_rx,
        },
    )
}

impl MemoryPeer {
    pub(crate) fn push(&self, event: SocketEvent) {
        let _ = self.events.send(event);
    }

    pub(crate) fn text(&self, value: &str) {
        self.push(SocketEvent::Message(RelayFrame::Text(value.to_string())));
    }

    pub(crate) async fn next(&mut self) -> Option<Outbound> {
        self.outbound.recv().await
    }
}

#[async_trait]
impl RelaySocket for MemorySocket {
    async fn recv(&mut self) -> Option<SocketEvent> {
        self.events.recv().await
    }

    async fn send(&mut self, frame: RelayFrame) -> Result<(), SocketError> {
        if self.closed {
            return Err(SocketError::Closed);
        }
        self.outbound
            .send(Outbound::Frame(frame))
            .map_err(|_| SocketError::Closed)
    }

    async fn close(&mut self, frame: CloseFrame) -> Result<(), SocketError> {
        if self.closed {
            return Err(SocketError::Closed);
        }
        self.closed = true;
        self.outbound
            .send(Outbound::Close(frame))
            .map_err(|_| SocketError::Closed)
    }

    async fn finish_close(&mut self) -> Result<(), SocketError> {
        if self.closed {
            return Err(SocketError::Closed);
        }
        self.closed = true;
        self.outbound
            .send(Outbound::CloseAck)
            .map_err(|_| SocketError::Closed)
    }
}
