use std::pin::pin;
use std::time::Duration;

use exec_relay::handshake::{EXEC_PATH, NOMAD_TOKEN_HEADER, TICKET_PATH};
use exec_relay::{
    CloseFrame, CredentialResolver, CsrfPolicy, ExecError, ExecHandshake, RelayFrame, Side,
    SocketEvent, TicketAuthority, TicketRequestError,
};
use futures_util::future::{self, Either};
use futures_util::{StreamExt, stream};
use secrecy::SecretString;
use worker::*;

use crate::fetch_url::upstream_fetch_url;
use crate::relay::{EdgeRelay, EdgeSocket, close_event, idle_timeout_from_var, message_event};

const RUNTIME: &str = "edge";
const DEFAULT_CLUSTER_ADDR: &str = "http://127.0.0.1:4646";

#[event(fetch)]
async fn fetch(req: Request, env: Env, _ctx: Context) -> Result<Response> {
    console_error_panic_hook::set_once();

    let url = req.url()?;
    let handshake = handshake(&env)?;

    match (req.method(), url.path()) {
        (Method::Post, TICKET_PATH) => issue_ticket(&req, &handshake),
        (Method::Get, EXEC_PATH) if is_websocket_upgrade(&req)? => {
            let cluster_addr = env
                .var("NOMAD_ADDR")
                .map(|value| value.to_string())
                .unwrap_or_else(|_| DEFAULT_CLUSTER_ADDR.to_string());
            let idle_timeout = idle_timeout_from_var(
                env.var("EXEC_IDLE_TIMEOUT_SECS")
                    .ok()
                    .map(|value| value.to_string())
                    .as_deref(),
            );
            exec_upgrade(&req, url.query(), &handshake, &cluster_addr, idle_timeout).await
        }
        _ => json_error(404, "not_found", "not found"),
    }
}

fn handshake(env: &Env) -> Result<ExecHandshake> {
    let secret = env.secret("EXEC_TICKET_SECRET")?.to_string();
    if secret.trim().is_empty() {
        return Err(Error::RustError("EXEC_TICKET_SECRET must be set".to_string()));
    }
    Ok(ExecHandshake::new(
        TicketAuthority::new(SecretString::new(secret)),
        CredentialResolver::default(),
        CsrfPolicy::default(),
    ))
}

fn is_websocket_upgrade(req: &Request) -> Result<bool> {
    Ok(req
        .headers()
        .get("Upgrade")?
        .is_some_and(|value| value.trim().eq_ignore_ascii_case("websocket")))
}

fn issue_ticket(req: &Request, handshake: &ExecHandshake) -> Result<Response> {
    let cookies = req.headers().get("Cookie")?;
    let csrf = req.headers().get(handshake.csrf().header_name())?;
    match handshake.issue_ticket_at(cookies.as_deref(), csrf.as_deref(), Date::now().as_millis()) {
        Ok(ticket) => {
            let mut response = Response::from_json(&serde_json::json!({ "ticket": ticket }))?;
            response.headers_mut().set("Cache-Control", "no-store")?;
            Ok(response)
        }
        Err(TicketRequestError::Unauthorized) => json_error(401, "unauthorized", "unauthorized"),
        Err(TicketRequestError::CsrfMismatch) => {
            json_error(403, "csrf_mismatch", "csrf token missing or mismatched")
        }
    }
}

async fn exec_upgrade(
    req: &Request,
    query: Option<&str>,
    handshake: &ExecHandshake,
    cluster_addr: &str,
    idle_timeout: Option<Duration>,
) -> Result<Response> {
    let cookies = req.headers().get("Cookie")?;
    let context = match handshake.authorize_at(query, cookies.as_deref(), Date::now().as_millis()) {
        Ok(context) => context,
        Err(error) => return reject(&error),
    };

    let upstream_url = match upstream_fetch_url(cluster_addr, &context.params) {
        Ok(url) => url,
        Err(error) => return reject(&ExecError::UpstreamConnect(error.to_string())),
    };

    let headers = Headers::new();
    headers.set("Upgrade", "websocket")?;
    headers.set(NOMAD_TOKEN_HEADER, context.credential.expose())?;
    let mut init = RequestInit::new();
    init.with_headers(headers);
    let upstream_request = Request::new_with_init(upstream_url.as_str(), &init)?;

    let upstream = match Fetch::Request(upstream_request).send().await {
        Ok(response) => response.websocket(),
        Err(error) => {
            console_log!("[{}] upstream fetch failed: {}", RUNTIME, error);
            None
        }
    };
    let Some(upstream) = upstream else {
        return reject(&ExecError::UpstreamConnect(
            "cluster did not upgrade the connection".to_string(),
        ));
    };

    let pair = WebSocketPair::new()?;
    pair.server.accept()?;
    upstream.accept()?;

    let alloc_id = context.params.alloc_id.clone();
    drop(context);
    let server = pair.server;
    wasm_bindgen_futures::spawn_local(async move {
        console_log!("[{}] exec session opened alloc_id={}", RUNTIME, alloc_id);
        match relay(&server, &upstream, idle_timeout).await {
            Ok(relay) => console_log!(
                "[{}] exec session closed alloc_id={} termination={:?} frames_to_upstream={} frames_to_client={}",
                RUNTIME,
                alloc_id,
                relay.termination(),
                relay.frames_to_upstream(),
                relay.frames_to_client()
            ),
            Err(error) => {
                console_log!("[{}] exec relay failed alloc_id={}: {}", RUNTIME, alloc_id, error)
            }
        }
    });

    Response::from_websocket(pair.client)
}

struct EdgeWebSocket<'a>(&'a WebSocket);

impl EdgeSocket for EdgeWebSocket<'_> {
    fn send(&self, frame: RelayFrame) -> std::result::Result<(), String> {
        let result = match frame {
            RelayFrame::Text(text) => self.0.send_with_str(text),
            RelayFrame::Binary(bytes) => self.0.send_with_bytes(bytes),
        };
        result.map_err(|error| error.to_string())
    }

    fn close(&self, frame: &CloseFrame) {
        if let Err(error) = self.0.close(Some(frame.code), Some(frame.reason.as_str())) {
            console_log!("[{}] close failed: {}", RUNTIME, error);
        }
    }
}

/// Feeds both sockets' events and the idle timer into an [`EdgeRelay`]
/// until the session is closed.
async fn relay(
    client: &WebSocket,
    upstream: &WebSocket,
    idle_timeout: Option<Duration>,
) -> Result<EdgeRelay> {
    let client_events = client.events()?.map(|event| (Side::Client, event));
    let upstream_events = upstream.events()?.map(|event| (Side::Upstream, event));
    let mut events = pin!(stream::select(client_events, upstream_events));
    let (client, upstream) = (EdgeWebSocket(client), EdgeWebSocket(upstream));

    let mut relay = EdgeRelay::new();
    let mut idle = idle_timeout.map(|timeout| Box::pin(Delay::from(timeout)));

    while !relay.is_closed() {
        let next = match idle.as_mut() {
            Some(delay) => match future::select(events.next(), delay.as_mut()).await {
                Either::Left((next, _)) => next,
                Either::Right(((), _)) => {
                    relay.on_idle_timeout(&client, &upstream);
                    break;
                }
            },
            None => events.next().await,
        };
        let Some((side, event)) = next else {
            break;
        };
        let event = match event {
            Ok(WebsocketEvent::Message(message)) => {
                match message_event(message.text(), message.bytes()) {
                    Some(event) => event,
                    None => continue,
                }
            }
            Ok(WebsocketEvent::Close(close)) => close_event(close.code(), close.reason()),
            Err(error) => SocketEvent::Error(error.to_string()),
        };

        if relay.on_event(side, event, &client, &upstream) {
            if let Some(timeout) = idle_timeout {
                idle = Some(Box::pin(Delay::from(timeout)));
            }
        }
    }
    Ok(relay)
}

fn reject(error: &ExecError) -> Result<Response> {
    json_error(error.status().as_u16(), error.code(), error.public_message())
}

fn json_error(status: u16, code: &str, message: &str) -> Result<Response> {
    Ok(Response::from_json(&serde_json::json!({ "error": code, "message": message }))?
        .with_status(status))
}
