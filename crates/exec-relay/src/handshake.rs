//! Upgrade-time authorization shared by every runtime adapter.
//!
//! Order matters: parameters first (400), then the ticket (401), then the
//! credential cookie on the same request (401). Only a request that passes
//! all three yields an [`ExecContext`] and may reach the cluster.

use http::HeaderMap;
use http::header::{COOKIE, UPGRADE};
use thiserror::Error;
use tracing::debug;

use crate::clock::unix_millis;
use crate::credential::{Credential, CredentialResolver, CsrfPolicy};
use crate::error::ExecError;
use crate::params::{ExecParameters, query_param};
use crate::ticket::TicketAuthority;

/// Browser-facing exec socket path.
pub const EXEC_PATH: &str = "/api/ws/exec";
/// Ticket endpoint path.
pub const TICKET_PATH: &str = "/api/auth/ws-ticket";
/// Query parameter carrying the ticket.
pub const TICKET_PARAM: &str = "ticket";
/// Handshake header carrying the credential to the cluster.
pub const NOMAD_TOKEN_HEADER: &str = "X-Nomad-Token";

/// Everything an adapter needs to open the upstream leg.
#[derive(Debug, Clone)]
pub struct ExecContext {
    pub params: ExecParameters,
    pub credential: Credential,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TicketRequestError {
    #[error("no credential cookie")]
    Unauthorized,
    #[error("csrf token mismatch")]
    CsrfMismatch,
}

#[derive(Debug, Clone)]
pub struct ExecHandshake {
    tickets: TicketAuthority,
    credentials: CredentialResolver,
    csrf: CsrfPolicy,
}

impl ExecHandshake {
    pub fn new(tickets: TicketAuthority, credentials: CredentialResolver, csrf: CsrfPolicy) -> Self {
        Self {
            tickets,
            credentials,
            csrf,
        }
    }

    pub fn tickets(&self) -> &TicketAuthority {
        &self.tickets
    }

    pub fn credentials(&self) -> &CredentialResolver {
        &self.credentials
    }

    pub fn csrf(&self) -> &CsrfPolicy {
        &self.csrf
    }

    pub fn authorize(
        &self,
        query: Option<&str>,
        cookie_header: Option<&str>,
    ) -> Result<ExecContext, ExecError> {
        self.authorize_at(query, cookie_header, unix_millis())
    }

    pub fn authorize_at(
        &self,
        query: Option<&str>,
        cookie_header: Option<&str>,
        now_ms: u64,
    ) -> Result<ExecContext, ExecError> {
        let params = ExecParameters::from_query(query).ok_or(ExecError::ClientInput)?;

        let Some(ticket) = query_param(query, TICKET_PARAM) else {
            debug!(alloc_id = %params.alloc_id, "exec upgrade without ticket");
            return Err(ExecError::Authentication);
        };
        if let Err(reason) = self.tickets.check_at(&ticket, now_ms) {
            debug!(alloc_id = %params.alloc_id, %reason, "exec ticket rejected");
            return Err(ExecError::Authentication);
        }

        let Some(credential) = self.credentials.resolve(cookie_header) else {
            debug!(alloc_id = %params.alloc_id, "exec upgrade without credential cookie");
            return Err(ExecError::Authentication);
        };

        Ok(ExecContext { params, credential })
    }

    /// Mints a ticket for a cookie-authenticated, CSRF-checked request.
    pub fn issue_ticket(
        &self,
        cookie_header: Option<&str>,
        csrf_header: Option<&str>,
    ) -> Result<String, TicketRequestError> {
        self.issue_ticket_at(cookie_header, csrf_header, unix_millis())
    }

    pub fn issue_ticket_at(
        &self,
        cookie_header: Option<&str>,
        csrf_header: Option<&str>,
        now_ms: u64,
    ) -> Result<String, TicketRequestError> {
        if self.credentials.resolve(cookie_header).is_none() {
            return Err(TicketRequestError::Unauthorized);
        }
        if !self.csrf.check(cookie_header, csrf_header) {
            return Err(TicketRequestError::CsrfMismatch);
        }
        Ok(self.tickets.issue_at(now_ms))
    }
}

/// True for a WebSocket upgrade aimed at [`EXEC_PATH`].
pub fn is_exec_upgrade(path: &str, headers: &HeaderMap) -> bool {
    path == EXEC_PATH
        && headers
            .get(UPGRADE)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.trim().eq_ignore_ascii_case("websocket"))
}

/// All `Cookie` headers joined into one, as HTTP/2 clients may split them.
pub fn cookie_header(headers: &HeaderMap) -> Option<String> {
    let values: Vec<&str> = headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .collect();
    if values.is_empty() {
        None
    } else {
        Some(values.join("; "))
    }
}
