use async_trait::async_trait;
use thiserror::Error;

use super::{CloseFrame, RelayFrame, SocketEvent};

#[derive(Debug, Error)]
pub enum SocketError {
    #[error("socket already closed")]
    Closed,
    #[error("socket transport error: {0}")]
    Transport(String),
}

/// One end of a relay session, whatever runtime produced it.
///
/// `recv` yields data frames, the peer's close and transport errors; control
/// frames such as ping and pong stay inside the transport. `None` means the
/// stream ended without a close frame.
#[async_trait]
pub trait RelaySocket: Send {
    async fn recv(&mut self) -> Option<SocketEvent>;

    async fn send(&mut self, frame: RelayFrame) -> Result<(), SocketError>;

    async fn close(&mut self, frame: CloseFrame) -> Result<(), SocketError>;

    /// Answers a close this socket received, so the far end sees a clean
    /// closing handshake before the socket is dropped.
    async fn finish_close(&mut self) -> Result<(), SocketError> {
        Ok(())
    }
}

#[async_trait]
impl<T> RelaySocket for Box<T>
where
    T: RelaySocket + ?Sized,
{
    async fn recv(&mut self) -> Option<SocketEvent> {
        (**self).recv().await
    }

    async fn send(&mut self, frame: RelayFrame) -> Result<(), SocketError> {
        (**self).send(frame).await
    }

    async fn close(&mut self, frame: CloseFrame) -> Result<(), SocketError> {
        (**self).close(frame).await
    }

    async fn finish_close(&mut self) -> Result<(), SocketError> {
        (**self).finish_close().await
    }
}
