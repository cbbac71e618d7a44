//! Short-lived signed tickets that authorize a WebSocket upgrade.
//!
//! A ticket is standard base64 of `timestamp|nonce|signature`, where
//! `timestamp` is issuance time in Unix milliseconds, `nonce` is 16 random
//! bytes in hex and `signature` is hex HMAC-SHA256 over `timestamp|nonce`.
//! Tickets carry no credential material and nothing is remembered after
//! issuance: a ticket stays valid for every upgrade attempt inside its age
//! window and then lapses on its own.

use std::hint::black_box;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use hmac::{Hmac, Mac};
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;

use crate::clock::unix_millis;

type HmacSha256 = Hmac<Sha256>;

/// Maximum ticket age accepted on upgrade.
pub const TICKET_MAX_AGE_MS: u64 = 30_000;

const NONCE_BYTES: usize = 16;
const SEPARATOR: char = '|';

/// Why a ticket was refused. Only ever logged server-side; callers answer
/// with a plain yes/no.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TicketError {
    #[error("ticket is not valid base64 text")]
    Encoding,
    #[error("ticket does not have exactly three parts")]
    Shape,
    #[error("ticket signature does not match")]
    Signature,
    #[error("ticket timestamp is not an integer")]
    Timestamp,
    #[error("ticket is {age_ms}ms old")]
    Expired { age_ms: u64 },
    #[error("ticket timestamp is in the future")]
    FromTheFuture,
}

/// Mints a ticket signed with `secret` at `now_ms`.
pub fn issue_ticket(secret: &[u8], now_ms: u64) -> String {
    let mut nonce = [0_u8; NONCE_BYTES];
    rand::thread_rng().fill_bytes(&mut nonce);
    let payload = format!("{now_ms}{SEPARATOR}{}", hex::encode(nonce));
    let signature = sign(secret, &payload);
    STANDARD.encode(format!("{payload}{SEPARATOR}{signature}"))
}

/// Returns whether `ticket` was signed with `secret` and is at most
/// `max_age_ms` old at `now_ms`. Never panics.
pub fn verify_ticket(ticket: &str, secret: &[u8], max_age_ms: u64, now_ms: u64) -> bool {
    check_ticket(ticket, secret, max_age_ms, now_ms).is_ok()
}

fn check_ticket(
    ticket: &str,
    secret: &[u8],
    max_age_ms: u64,
    now_ms: u64,
) -> Result<(), TicketError> {
    let decoded = STANDARD
        .decode(ticket)
        .map_err(|_| TicketError::Encoding)?;
    let decoded = String::from_utf8(decoded).map_err(|_| TicketError::Encoding)?;

    let parts: Vec<&str> = decoded.split(SEPARATOR).collect();
    let &[timestamp, nonce, signature] = parts.as_slice() else {
        return Err(TicketError::Shape);
    };

    let expected = sign(secret, &format!("{timestamp}{SEPARATOR}{nonce}"));
    if !constant_time_eq(expected.as_bytes(), signature.as_bytes()) {
        return Err(TicketError::Signature);
    }

    let issued_at: u64 = timestamp.parse().map_err(|_| TicketError::Timestamp)?;
    let age_ms = now_ms
        .checked_sub(issued_at)
        .ok_or(TicketError::FromTheFuture)?;
    if age_ms > max_age_ms {
        return Err(TicketError::Expired { age_ms });
    }
    Ok(())
}

fn sign(secret: &[u8], payload: &str) -> String {
    // HMAC accepts keys of any length.
    let mut mac = match HmacSha256::new_from_slice(secret) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(payload.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time byte comparison. A length mismatch still runs a comparison
/// of the expected value against itself before answering.
pub fn constant_time_eq(expected: &[u8], provided: &[u8]) -> bool {
    if expected.len() != provided.len() {
        black_box(expected.ct_eq(expected));
        return false;
    }
    expected.ct_eq(provided).into()
}

/// Issues and verifies tickets with one server-held secret.
#[derive(Clone)]
pub struct TicketAuthority {
    secret: SecretString,
    max_age_ms: u64,
}

impl std::fmt::Debug for TicketAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TicketAuthority")
            .field("secret", &"[REDACTED]")
            .field("max_age_ms", &self.max_age_ms)
            .finish()
    }
}

impl TicketAuthority {
    pub fn new(secret: SecretString) -> Self {
        Self {
            secret,
            max_age_ms: TICKET_MAX_AGE_MS,
        }
    }

    pub fn with_max_age_ms(mut self, max_age_ms: u64) -> Self {
        self.max_age_ms = max_age_ms;
        self
    }

    pub fn max_age_ms(&self) -> u64 {
        self.max_age_ms
    }

    pub fn issue(&self) -> String {
        self.issue_at(unix_millis())
    }

    pub fn issue_at(&self, now_ms: u64) -> String {
        issue_ticket(self.secret_bytes(), now_ms)
    }

    pub fn verify(&self, ticket: &str) -> bool {
        self.verify_at(ticket, unix_millis())
    }

    pub fn verify_at(&self, ticket: &str, now_ms: u64) -> bool {
        self.check_at(ticket, now_ms).is_ok()
    }

    /// Like [`verify_at`](Self::verify_at) but says why a ticket failed.
    pub fn check_at(&self, ticket: &str, now_ms: u64) -> Result<(), TicketError> {
        check_ticket(ticket, self.secret_bytes(), self.max_age_ms, now_ms)
    }

    fn secret_bytes(&self) -> &[u8] {
        self.secret.expose_secret().as_bytes()
    }
}
