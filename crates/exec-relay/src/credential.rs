//! The long-lived cluster credential and the cookies it travels in.

use std::fmt;

use cookie::Cookie;
use secrecy::{ExposeSecret, SecretString};

use crate::ticket::constant_time_eq;

pub const DEFAULT_CREDENTIAL_COOKIE: &str = "nomad_token";
pub const DEFAULT_CSRF_COOKIE: &str = "csrf_token";
pub const DEFAULT_CSRF_HEADER: &str = "x-csrf-token";

/// Bearer credential for the cluster API. Redacted from `Debug`.
#[derive(Clone)]
pub struct Credential(SecretString);

impl Credential {
    pub fn new(value: impl Into<String>) -> Self {
        Self(SecretString::new(value.into()))
    }

    pub fn expose(&self) -> &str {
        self.0.expose_secret()
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential([REDACTED])")
    }
}

/// Value of cookie `name` in a `Cookie` request header, if present.
pub fn cookie_value(cookie_header: &str, name: &str) -> Option<String> {
    Cookie::split_parse(cookie_header)
        .filter_map(Result::ok)
        .find(|cookie| cookie.name() == name)
        .map(|cookie| cookie.value().to_string())
}

/// Finds the credential in the caller's session cookie.
#[derive(Debug, Clone)]
pub struct CredentialResolver {
    cookie_name: String,
}

impl Default for CredentialResolver {
    fn default() -> Self {
        Self::new(DEFAULT_CREDENTIAL_COOKIE)
    }
}

impl CredentialResolver {
    pub fn new(cookie_name: impl Into<String>) -> Self {
        Self {
            cookie_name: cookie_name.into(),
        }
    }

    pub fn cookie_name(&self) -> &str {
        &self.cookie_name
    }

    /// URL-decoded credential cookie; `None` when absent, empty or not
    /// decodable.
    pub fn resolve(&self, cookie_header: Option<&str>) -> Option<Credential> {
        let raw = cookie_value(cookie_header?, &self.cookie_name)?;
        let decoded = urlencoding::decode(&raw).ok()?;
        if decoded.is_empty() {
            return None;
        }
        Some(Credential::new(decoded.into_owned()))
    }
}

/// Double-submit CSRF check: the header must echo the CSRF cookie.
#[derive(Debug, Clone)]
pub struct CsrfPolicy {
    cookie_name: String,
    header_name: String,
}

impl Default for CsrfPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_CSRF_COOKIE, DEFAULT_CSRF_HEADER)
    }
}

impl CsrfPolicy {
    pub fn new(cookie_name: impl Into<String>, header_name: impl Into<String>) -> Self {
        Self {
            cookie_name: cookie_name.into(),
            header_name: header_name.into(),
        }
    }

    pub fn header_name(&self) -> &str {
        &self.header_name
    }

    pub fn check(&self, cookie_header: Option<&str>, header_value: Option<&str>) -> bool {
        let Some(expected) = cookie_header.and_then(|header| cookie_value(header, &self.cookie_name))
        else {
            return false;
        };
        let Some(provided) = header_value else {
            return false;
        };
        !expected.is_empty() && constant_time_eq(expected.as_bytes(), provided.as_bytes())
    }
}
