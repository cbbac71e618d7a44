//! The server-to-cluster leg: connecting the exec socket and adapting
//! tokio-tungstenite streams to [`RelaySocket`].

use std::borrow::Cow;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use http::HeaderValue;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::protocol::CloseFrame as WireCloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{WebSocketStream, connect_async};
use tracing::debug;

use crate::error::ExecError;
use crate::handshake::{ExecContext, NOMAD_TOKEN_HEADER};
use crate::params::build_upstream_url;
use crate::relay::socket::{RelaySocket, SocketError};
use crate::relay::{CloseFrame, RelayFrame, SocketEvent};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Where the credential goes on the upstream handshake.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CredentialPlacement {
    /// `X-Nomad-Token` request header.
    #[default]
    Header,
    /// `token` query parameter, for clients that cannot set headers.
    Query,
}

/// Opens the cluster exec socket for an authorized upgrade.
#[async_trait]
pub trait UpstreamConnector: Send + Sync {
    async fn connect(&self, context: &ExecContext) -> Result<Box<dyn RelaySocket>, ExecError>;
}

#[derive(Debug, Clone)]
pub struct TungsteniteConnector {
    cluster_addr: String,
    placement: CredentialPlacement,
    connect_timeout: Duration,
}

impl TungsteniteConnector {
    pub fn new(cluster_addr: impl Into<String>) -> Self {
        Self {
            cluster_addr: cluster_addr.into(),
            placement: CredentialPlacement::Header,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_placement(mut self, placement: CredentialPlacement) -> Self {
        self.placement = placement;
        self
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    /// The handshake request for `context`, credential included.
    pub fn request_for(&self, context: &ExecContext) -> Result<Request, ExecError> {
        let in_query = self.placement == CredentialPlacement::Query;
        let url = build_upstream_url(
            &self.cluster_addr,
            &context.params,
            in_query.then_some(&context.credential),
        )
        .map_err(|error| ExecError::UpstreamConnect(error.to_string()))?;

        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|error| ExecError::UpstreamConnect(error.to_string()))?;

        if !in_query {
            let mut token = HeaderValue::from_str(context.credential.expose()).map_err(|_| {
                ExecError::UpstreamConnect("credential is not a valid header value".to_string())
            })?;
            token.set_sensitive(true);
            request.headers_mut().insert(NOMAD_TOKEN_HEADER, token);
        }
        Ok(request)
    }
}

#[async_trait]
impl UpstreamConnector for TungsteniteConnector {
    async fn connect(&self, context: &ExecContext) -> Result<Box<dyn RelaySocket>, ExecError> {
        let request = self.request_for(context)?;
        let (stream, response) = tokio::time::timeout(self.connect_timeout, connect_async(request))
            .await
            .map_err(|_| {
                ExecError::UpstreamConnect(format!(
                    "no handshake within {}s",
                    self.connect_timeout.as_secs()
                ))
            })?
            .map_err(|error| ExecError::UpstreamConnect(describe_handshake_error(&error)))?;
        debug!(
            alloc_id = %context.params.alloc_id,
            task = %context.params.task,
            status = %response.status(),
            "upstream exec socket connected"
        );
        Ok(Box::new(TungsteniteSocket::new(stream)))
    }
}

fn describe_handshake_error(error: &WsError) -> String {
    match error {
        WsError::Http(response) => format!("cluster answered {}", response.status()),
        other => other.to_string(),
    }
}

/// A tokio-tungstenite stream as a relay side. Used for the upstream leg
/// and for sockets accepted by the native listener.
pub struct TungsteniteSocket<S> {
    inner: WebSocketStream<S>,
}

impl<S> TungsteniteSocket<S> {
    pub fn new(inner: WebSocketStream<S>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<S> RelaySocket for TungsteniteSocket<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn recv(&mut self) -> Option<SocketEvent> {
        loop {
            let event = match self.inner.next().await? {
                Ok(Message::Text(text)) => SocketEvent::Message(RelayFrame::Text(text)),
                Ok(Message::Binary(bytes)) => SocketEvent::Message(RelayFrame::Binary(bytes)),
                Ok(Message::Close(frame)) => SocketEvent::Closed(frame.map(|frame| {
                    CloseFrame::new(u16::from(frame.code), frame.reason.into_owned())
                })),
                Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => continue,
                Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => {
                    SocketEvent::Closed(None)
                }
                Err(error) => SocketEvent::Error(error.to_string()),
            };
            return Some(event);
        }
    }

    async fn send(&mut self, frame: RelayFrame) -> Result<(), SocketError> {
        let message = match frame {
            RelayFrame::Text(text) => Message::Text(text),
            RelayFrame::Binary(bytes) => Message::Binary(bytes),
        };
        self.inner.send(message).await.map_err(socket_error)
    }

    async fn close(&mut self, frame: CloseFrame) -> Result<(), SocketError> {
        let frame = WireCloseFrame {
            code: CloseCode::from(frame.code),
            reason: Cow::Owned(frame.reason),
        };
        self.inner.close(Some(frame)).await.map_err(socket_error)
    }

    async fn finish_close(&mut self) -> Result<(), SocketError> {
        // Flushes the reply tungstenite queued when the peer's close arrived.
        SinkExt::close(&mut self.inner).await.map_err(socket_error)
    }
}

fn socket_error(error: WsError) -> SocketError {
    match error {
        WsError::ConnectionClosed | WsError::AlreadyClosed => SocketError::Closed,
        other => SocketError::Transport(other.to_string()),
    }
}
