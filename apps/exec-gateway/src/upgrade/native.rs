//! Exec upgrades on a dedicated listener, decided inside the WebSocket
//! handshake's accept callback.
//!
//! The callback either rejects with a JSON error response or accepts and
//! keeps the [`ExecContext`] for the connection. The upstream leg is opened
//! after the handshake, so an upstream failure here closes the already
//! upgraded client with 1011 instead of answering 502.

use std::net::SocketAddr;
use std::time::Duration;

use axum::http::{HeaderValue, StatusCode, header};
use exec_relay::handshake::{EXEC_PATH, cookie_header};
use exec_relay::{ExecContext, RelaySocket, SessionDescriptor, TungsteniteSocket};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::time::timeout;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tracing::{debug, info, warn};

use super::relay;
use crate::server::AppState;

pub const RUNTIME: &str = "native";

/// How long a client may take to finish the upgrade handshake.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

pub struct NativeExecServer {
    pub address: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    join: tokio::task::JoinHandle<()>,
}

impl NativeExecServer {
    pub async fn close(mut self) -> Result<(), String> {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        self.join
            .await
            .map_err(|error| format!("native exec listener join failed: {error}"))
    }
}

pub async fn spawn_native_exec_server(
    state: AppState,
    bind_addr: SocketAddr,
) -> std::io::Result<NativeExecServer> {
    spawn_native_exec_server_with_timeout(state, bind_addr, DEFAULT_HANDSHAKE_TIMEOUT).await
}

pub async fn spawn_native_exec_server_with_timeout(
    state: AppState,
    bind_addr: SocketAddr,
    handshake_timeout: Duration,
) -> std::io::Result<NativeExecServer> {
    let listener = TcpListener::bind(bind_addr).await?;
    let address = listener.local_addr()?;
    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

    info!(runtime = RUNTIME, bind_addr = %address, "native exec listener ready");

    let join = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        tokio::spawn(handle_connection(state.clone(), stream, peer, handshake_timeout));
                    }
                    Err(error) => warn!(runtime = RUNTIME, %error, "native exec accept failed"),
                },
            }
        }
    });

    Ok(NativeExecServer {
        address,
        shutdown: Some(shutdown_tx),
        join,
    })
}

async fn handle_connection(
    state: AppState,
    stream: TcpStream,
    peer: SocketAddr,
    handshake_timeout: Duration,
) {
    let mut accepted: Option<ExecContext> = None;
    let handshake = state.handshake();

    let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        if request.uri().path() != EXEC_PATH {
            return Err(error_response(StatusCode::NOT_FOUND, "not_found", "not found"));
        }
        let cookies = cookie_header(request.headers());
        match handshake.authorize(request.uri().query(), cookies.as_deref()) {
            Ok(context) => {
                accepted = Some(context);
                Ok(response)
            }
            Err(error) => Err(error_response(
                error.status(),
                error.code(),
                error.public_message(),
            )),
        }
    };

    let client = match timeout(handshake_timeout, accept_hdr_async(stream, callback)).await {
        Ok(Ok(client)) => client,
        Ok(Err(error)) => {
            debug!(runtime = RUNTIME, %peer, %error, "native exec handshake rejected");
            return;
        }
        Err(_) => {
            debug!(runtime = RUNTIME, %peer, timeout = ?handshake_timeout, "native exec handshake timed out");
            return;
        }
    };
    let Some(context) = accepted else {
        return;
    };
    let mut client = TungsteniteSocket::new(client);

    let upstream = match state.upstream().connect(&context).await {
        Ok(upstream) => upstream,
        Err(error) => {
            warn!(
                runtime = RUNTIME,
                alloc_id = %context.params.alloc_id,
                task = %context.params.task,
                %error,
                "upstream exec connection failed after upgrade"
            );
            if let Err(close_error) = client.close(error.close_frame()).await {
                debug!(runtime = RUNTIME, %close_error, "client already gone");
            }
            return;
        }
    };

    let descriptor = SessionDescriptor::new(&context.params, RUNTIME);
    drop(context);
    relay(
        state.sessions(),
        descriptor,
        client,
        upstream,
        state.relay_options(),
    )
    .await;
}

fn error_response(status: StatusCode, code: &str, message: &str) -> ErrorResponse {
    let body = serde_json::json!({ "error": code, "message": message }).to_string();
    let mut response = ErrorResponse::new(Some(body));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    response
}
