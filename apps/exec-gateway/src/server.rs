use std::sync::Arc;
use std::time::SystemTime;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router, middleware};
use exec_relay::handshake::{TICKET_PATH, cookie_header};
use exec_relay::{
    CredentialResolver, CsrfPolicy, ExecError, ExecHandshake, RelayOptions, SessionRegistry,
    TicketAuthority, TicketRequestError, UpstreamConnector,
};
use serde::Serialize;
use tower::ServiceBuilder;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing::debug;

use crate::config::Config;
use crate::upgrade::framework;

pub const SERVICE_NAME: &str = "exec-gateway";

#[derive(Clone)]
pub struct AppState {
    config: Arc<Config>,
    handshake: ExecHandshake,
    upstream: Arc<dyn UpstreamConnector>,
    sessions: SessionRegistry,
    started_at: SystemTime,
}

impl AppState {
    #[must_use]
    pub fn new(config: Config, upstream: Arc<dyn UpstreamConnector>) -> Self {
        let handshake = ExecHandshake::new(
            TicketAuthority::new(config.ticket_secret.clone()),
            CredentialResolver::new(config.credential_cookie.clone()),
            CsrfPolicy::new(config.csrf_cookie.clone(), config.csrf_header.clone()),
        );
        Self {
            config: Arc::new(config),
            handshake,
            upstream,
            sessions: SessionRegistry::new(),
            started_at: SystemTime::now(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn handshake(&self) -> &ExecHandshake {
        &self.handshake
    }

    pub fn upstream(&self) -> &dyn UpstreamConnector {
        self.upstream.as_ref()
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    pub fn relay_options(&self) -> RelayOptions {
        RelayOptions {
            idle_timeout: self.config.idle_timeout,
        }
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    version: &'static str,
    uptime_seconds: u64,
    active_sessions: usize,
}

#[derive(Debug, Serialize)]
struct TicketResponse {
    ticket: String,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health))
        .route(TICKET_PATH, post(issue_ws_ticket))
        .fallback(not_found)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            framework::exec_upgrade,
        ))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
                .layer(PropagateRequestIdLayer::x_request_id())
                .layer(TraceLayer::new_for_http()),
        )
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let uptime_seconds = match state.started_at.elapsed() {
        Ok(duration) => duration.as_secs(),
        Err(_) => 0,
    };

    Json(HealthResponse {
        status: "ok",
        service: SERVICE_NAME,
        version: env!("CARGO_PKG_VERSION"),
        uptime_seconds,
        active_sessions: state.sessions.len(),
    })
}

async fn issue_ws_ticket(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let cookies = cookie_header(&headers);
    let csrf_header = headers
        .get(state.handshake.csrf().header_name())
        .and_then(|value| value.to_str().ok());

    let ticket = state
        .handshake
        .issue_ticket(cookies.as_deref(), csrf_header)
        .map_err(|error| {
            debug!(%error, "ws ticket refused");
            ApiError::from(error)
        })?;

    Ok((
        [(header::CACHE_CONTROL, "no-store")],
        Json(TicketResponse { ticket }),
    ))
}

async fn not_found() -> ApiError {
    ApiError::NotFound
}

#[derive(Debug)]
pub(crate) enum ApiError {
    NotFound,
    InvalidRequest(String),
    Unauthorized,
    CsrfMismatch,
    UpstreamUnavailable(String),
}

impl From<ExecError> for ApiError {
    fn from(error: ExecError) -> Self {
        match error {
            ExecError::ClientInput => Self::InvalidRequest(error.public_message().to_string()),
            ExecError::Authentication => Self::Unauthorized,
            ExecError::UpstreamConnect(_) => {
                Self::UpstreamUnavailable(error.public_message().to_string())
            }
        }
    }
}

impl From<TicketRequestError> for ApiError {
    fn from(error: TicketRequestError) -> Self {
        match error {
            TicketRequestError::Unauthorized => Self::Unauthorized,
            TicketRequestError::CsrfMismatch => Self::CsrfMismatch,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        match self {
            Self::NotFound => (
                StatusCode::NOT_FOUND,
                Json(serde_json::json!({
                    "error": "not_found",
                })),
            )
                .into_response(),
            Self::InvalidRequest(message) => (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({
                    "error": "invalid_request",
                    "message": message,
                })),
            )
                .into_response(),
            Self::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                Json(serde_json::json!({
                    "error": "unauthorized",
                    "message": "unauthorized",
                })),
            )
                .into_response(),
            Self::CsrfMismatch => (
                StatusCode::FORBIDDEN,
                Json(serde_json::json!({
                    "error": "csrf_mismatch",
                    "message": "csrf token missing or mismatched",
                })),
            )
                .into_response(),
            Self::UpstreamUnavailable(message) => (
                StatusCode::BAD_GATEWAY,
                Json(serde_json::json!({
                    "error": "upstream_unavailable",
                    "message": message,
                })),
            )
                .into_response(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use anyhow::{Result, anyhow};
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{Method, Request, header};
    use exec_relay::{ExecContext, ExecError, RelaySocket, UpstreamConnector};
    use http_body_util::BodyExt;
    use secrecy::SecretString;
    use serde_json::Value;
    use tower::ServiceExt;

    use super::{AppState, build_router};
    use crate::config::Config;

    const COOKIES: &str = "nomad_token=cluster-secret; csrf_token=csrf-1";

    /// Counts connect attempts and always refuses.
    #[derive(Default)]
    struct RefusingConnector {
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl UpstreamConnector for RefusingConnector {
        async fn connect(
            &self,
            _context: &ExecContext,
        ) -> Result<Box<dyn RelaySocket>, ExecError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(ExecError::UpstreamConnect("connection refused".to_string()))
        }
    }

    fn test_config() -> Config {
        Config {
            bind_addr: std::net::SocketAddr::from(([127, 0, 0, 1], 0)),
            native_bind_addr: None,
            log_filter: "info".to_string(),
            cluster_addr: "http://127.0.0.1:4646".to_string(),
            ticket_secret: SecretString::new("router-test-secret".to_string()),
            credential_cookie: "nomad_token".to_string(),
            csrf_cookie: "csrf_token".to_string(),
            csrf_header: "x-csrf-token".to_string(),
            upstream_token_in_query: false,
            upstream_connect_timeout: std::time::Duration::from_secs(1),
            idle_timeout: None,
            uses_development_secret: false,
        }
    }

    fn test_state() -> (AppState, Arc<RefusingConnector>) {
        let connector = Arc::new(RefusingConnector::default());
        (AppState::new(test_config(), connector.clone()), connector)
    }

    async fn response_json(response: axum::response::Response) -> Result<Value> {
        let collected = response.into_body().collect().await?;
        let bytes = collected.to_bytes();
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn ticket_request(cookie: Option<&str>, csrf: Option<&str>) -> Result<Request<Body>> {
        let mut builder = Request::builder()
            .method(Method::POST)
            .uri("/api/auth/ws-ticket");
        if let Some(cookie) = cookie {
            builder = builder.header(header::COOKIE, cookie);
        }
        if let Some(csrf) = csrf {
            builder = builder.header("x-csrf-token", csrf);
        }
        Ok(builder.body(Body::empty())?)
    }

    fn upgrade_request(uri: &str, cookie: Option<&str>) -> Result<Request<Body>> {
        let mut builder = Request::builder()
            .uri(uri)
            .header(header::CONNECTION, "upgrade")
            .header(header::UPGRADE, "websocket")
            .header(header::SEC_WEBSOCKET_VERSION, "13")
            .header(header::SEC_WEBSOCKET_KEY, "dGhlIHNhbXBsZSBub25jZQ==");
        if let Some(cookie) = cookie {
            builder = builder.header(header::COOKIE, cookie);
        }
        Ok(builder.body(Body::empty())?)
    }

    #[tokio::test]
    async fn health_reports_active_sessions() -> Result<()> {
        let (state, _) = test_state();
        let response = build_router(state)
            .oneshot(Request::builder().uri("/healthz").body(Body::empty())?)
            .await?;
        assert_eq!(response.status(), axum::http::StatusCode::OK);
        assert!(response.headers().contains_key("x-request-id"));
        let body = response_json(response).await?;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["service"], "exec-gateway");
        assert_eq!(body["active_sessions"], 0);
        Ok(())
    }

    #[tokio::test]
    async fn ticket_endpoint_issues_verifiable_ticket() -> Result<()> {
        let (state, _) = test_state();
        let handshake = state.handshake().clone();
        let response = build_router(state)
            .oneshot(ticket_request(Some(COOKIES), Some("csrf-1"))?)
            .await?;
        assert_eq!(response.status(), axum::http::StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CACHE_CONTROL),
            Some(&axum::http::HeaderValue::from_static("no-store"))
        );
        let body = response_json(response).await?;
        let ticket = body["ticket"]
            .as_str()
            .ok_or_else(|| anyhow!("missing ticket"))?;
        assert!(handshake.tickets().verify(ticket));
        assert!(!ticket.contains("cluster-secret"));
        Ok(())
    }

    #[tokio::test]
    async fn ticket_endpoint_requires_cookie() -> Result<()> {
        let (state, _) = test_state();
        let response = build_router(state)
            .oneshot(ticket_request(Some("csrf_token=csrf-1"), Some("csrf-1"))?)
            .await?;
        assert_eq!(response.status(), axum::http::StatusCode::UNAUTHORIZED);
        assert_eq!(response_json(response).await?["error"], "unauthorized");
        Ok(())
    }

    #[tokio::test]
    async fn ticket_endpoint_rejects_csrf_mismatch() -> Result<()> {
        let (state, _) = test_state();
        let app = build_router(state);
        let mismatch = app
            .clone()
            .oneshot(ticket_request(Some(COOKIES), Some("csrf-2"))?)
            .await?;
        assert_eq!(mismatch.status(), axum::http::StatusCode::FORBIDDEN);
        assert_eq!(response_json(mismatch).await?["error"], "csrf_mismatch");

        let missing = app.oneshot(ticket_request(Some(COOKIES), None)?).await?;
        assert_eq!(missing.status(), axum::http::StatusCode::FORBIDDEN);
        Ok(())
    }

    #[tokio::test]
    async fn unknown_paths_get_json_404() -> Result<()> {
        let (state, _) = test_state();
        let response = build_router(state)
            .oneshot(Request::builder().uri("/v1/jobs").body(Body::empty())?)
            .await?;
        assert_eq!(response.status(), axum::http::StatusCode::NOT_FOUND);
        assert_eq!(response_json(response).await?["error"], "not_found");
        Ok(())
    }

    #[tokio::test]
    async fn non_upgrade_exec_request_falls_through() -> Result<()> {
        let (state, connector) = test_state();
        let response = build_router(state)
            .oneshot(
                Request::builder()
                    .uri("/api/ws/exec?allocId=a&task=t")
                    .body(Body::empty())?,
            )
            .await?;
        assert_eq!(response.status(), axum::http::StatusCode::NOT_FOUND);
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 0);
        Ok(())
    }

    #[tokio::test]
    async fn upgrade_without_alloc_is_bad_request() -> Result<()> {
        let (state, connector) = test_state();
        let ticket = state.handshake().tickets().issue();
        let uri = format!(
            "/api/ws/exec?task=main&ticket={}",
            urlencoding::encode(&ticket)
        );
        let response = build_router(state)
            .oneshot(upgrade_request(&uri, Some(COOKIES))?)
            .await?;
        assert_eq!(response.status(), axum::http::StatusCode::BAD_REQUEST);
        assert_eq!(response_json(response).await?["error"], "invalid_request");
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 0);
        Ok(())
    }

    #[tokio::test]
    async fn upgrade_with_bad_ticket_or_no_cookie_is_unauthorized() -> Result<()> {
        let (state, connector) = test_state();
        let ticket = state.handshake().tickets().issue();
        let app = build_router(state);

        let bad_ticket = app
            .clone()
            .oneshot(upgrade_request(
                "/api/ws/exec?allocId=a&task=t&ticket=Zm9vfGJhcnxiYXo%3D",
                Some(COOKIES),
            )?)
            .await?;
        assert_eq!(bad_ticket.status(), axum::http::StatusCode::UNAUTHORIZED);
        let bad_ticket_body = response_json(bad_ticket).await?;

        let no_cookie = app
            .oneshot(upgrade_request(
                &format!(
                    "/api/ws/exec?allocId=a&task=t&ticket={}",
                    urlencoding::encode(&ticket)
                ),
                Some("csrf_token=csrf-1"),
            )?)
            .await?;
        assert_eq!(no_cookie.status(), axum::http::StatusCode::UNAUTHORIZED);
        assert_eq!(response_json(no_cookie).await?, bad_ticket_body);
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 0);
        Ok(())
    }
}
