//! Exec upgrades through axum's `WebSocketUpgrade`, mounted as middleware
//! over the whole router.

use async_trait::async_trait;
use axum::extract::ws::{CloseFrame as AxumCloseFrame, Message, WebSocket};
use axum::extract::{FromRequestParts, Request, State, WebSocketUpgrade};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use exec_relay::handshake::{cookie_header, is_exec_upgrade};
use exec_relay::{CloseFrame, RelayFrame, RelaySocket, SessionDescriptor, SocketError, SocketEvent};
use futures_util::SinkExt;
use tracing::{debug, warn};

use super::relay;
use crate::server::{ApiError, AppState};

pub const RUNTIME: &str = "framework";

/// Takes over exec upgrade requests and passes everything else on.
pub async fn exec_upgrade(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if !is_exec_upgrade(request.uri().path(), request.headers()) {
        return next.run(request).await;
    }

    let (mut parts, _body) = request.into_parts();
    let cookies = cookie_header(&parts.headers);
    let context = match state.handshake().authorize(parts.uri.query(), cookies.as_deref()) {
        Ok(context) => context,
        Err(error) => {
            debug!(runtime = RUNTIME, %error, "exec upgrade rejected");
            return ApiError::from(error).into_response();
        }
    };

    let upgrade = match WebSocketUpgrade::from_request_parts(&mut parts, &state).await {
        Ok(upgrade) => upgrade,
        Err(rejection) => return rejection.into_response(),
    };

    let upstream = match state.upstream().connect(&context).await {
        Ok(upstream) => upstream,
        Err(error) => {
            warn!(
                runtime = RUNTIME,
                alloc_id = %context.params.alloc_id,
                task = %context.params.task,
                %error,
                "upstream exec connection failed"
            );
            return ApiError::from(error).into_response();
        }
    };

    let sessions = state.sessions().clone();
    let options = state.relay_options();
    let descriptor = SessionDescriptor::new(&context.params, RUNTIME);
    drop(context);

    upgrade.on_upgrade(move |socket| async move {
        relay(&sessions, descriptor, AxumSocket::new(socket), upstream, options).await;
    })
}

/// An upgraded axum socket as a relay side.
pub struct AxumSocket {
    inner: WebSocket,
}

impl AxumSocket {
    pub fn new(inner: WebSocket) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl RelaySocket for AxumSocket {
    async fn recv(&mut self) -> Option<SocketEvent> {
        loop {
            let event = match self.inner.recv().await? {
                Ok(Message::Text(text)) => SocketEvent::Message(RelayFrame::Text(text)),
                Ok(Message::Binary(bytes)) => SocketEvent::Message(RelayFrame::Binary(bytes)),
                Ok(Message::Close(frame)) => SocketEvent::Closed(
                    frame.map(|frame| CloseFrame::new(frame.code, frame.reason.into_owned())),
                ),
                Ok(Message::Ping(_) | Message::Pong(_)) => continue,
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
        self.inner
            .send(message)
            .await
            .map_err(|error| SocketError::Transport(error.to_string()))
    }

    async fn close(&mut self, frame: CloseFrame) -> Result<(), SocketError> {
        self.inner
            .send(Message::Close(Some(AxumCloseFrame {
                code: frame.code,
                reason: frame.reason.into(),
            })))
            .await
            .map_err(|error| SocketError::Transport(error.to_string()))
    }

    async fn finish_close(&mut self) -> Result<(), SocketError> {
        SinkExt::close(&mut self.inner)
            .await
            .map_err(|error| SocketError::Transport(error.to_string()))
    }
}
