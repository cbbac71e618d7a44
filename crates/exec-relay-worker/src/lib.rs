//! Exec relay on Cloudflare Workers.
//!
//! The worker has no server-side upgrade hook: it builds the browser socket
//! pair itself, reaches the cluster with a `fetch` carrying
//! `Upgrade: websocket`, and relays between the two halves by feeding their
//! event streams into [`relay::EdgeRelay`], which wraps
//! [`exec_relay::RelayCore`].

mod fetch_url;
pub mod relay;

#[cfg(target_arch = "wasm32")]
mod edge;

pub use fetch_url::upstream_fetch_url;
