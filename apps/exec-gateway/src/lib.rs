#![forbid(unsafe_code)]

use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use exec_relay::relay::GOING_AWAY;
use exec_relay::{CloseFrame, CredentialPlacement, SessionRegistry, TungsteniteConnector};
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::config::Config;
use crate::server::{AppState, SERVICE_NAME, build_router};
use crate::upgrade::native::spawn_native_exec_server;

pub mod config;
pub mod server;
pub mod upgrade;

pub fn build_state(config: Config) -> AppState {
    let placement = if config.upstream_token_in_query {
        CredentialPlacement::Query
    } else {
        CredentialPlacement::Header
    };
    let connector = TungsteniteConnector::new(config.cluster_addr.clone())
        .with_placement(placement)
        .with_connect_timeout(config.upstream_connect_timeout);
    AppState::new(config, Arc::new(connector))
}

pub fn build_app(config: Config) -> axum::Router {
    build_router(build_state(config))
}

/// Serves until Ctrl-C.
pub async fn serve(config: Config) -> Result<()> {
    serve_with_shutdown(config, async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            warn!(%error, "ctrl-c handler unavailable");
            std::future::pending::<()>().await;
        }
    })
    .await
}

/// Serves the router and, when configured, the native exec listener until
/// `shutdown` resolves. Live sessions are then closed with 1001.
pub async fn serve_with_shutdown<F>(config: Config, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let state = build_state(config.clone());
    let listener = TcpListener::bind(config.bind_addr).await?;
    info!(
        service = SERVICE_NAME,
        bind_addr = %config.bind_addr,
        cluster_addr = %config.cluster_addr,
        "exec gateway listening"
    );

    let native = match config.native_bind_addr {
        Some(bind_addr) => Some(spawn_native_exec_server(state.clone(), bind_addr).await?),
        None => None,
    };

    let sessions = state.sessions().clone();
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(async move {
            shutdown.await;
            terminate_sessions(&sessions);
        })
        .await?;

    if let Some(native) = native {
        native.close().await.map_err(anyhow::Error::msg)?;
    }
    info!(service = SERVICE_NAME, "exec gateway stopped");
    Ok(())
}

fn terminate_sessions(sessions: &SessionRegistry) {
    let terminated = sessions.terminate_all(CloseFrame::new(GOING_AWAY, "server shutting down"));
    info!(terminated, "shutdown requested, closing exec sessions");
}
