//! Ticket-authorized WebSocket exec relay.
//!
//! A browser first trades its session cookie for a short-lived [`ticket`],
//! then opens the exec socket with that ticket in the query string. The
//! [`handshake`] checks parameters, ticket and credential on the upgrade
//! request, and the [`relay`] pairs the browser socket with one upstream
//! exec socket on the cluster.
//!
//! Everything outside the `runtime` feature is free of I/O so the same
//! protocol runs inside an edge worker.

pub mod clock;
pub mod credential;
pub mod error;
pub mod handshake;
pub mod params;
pub mod relay;
pub mod ticket;

#[cfg(feature = "runtime")]
pub mod registry;
#[cfg(feature = "runtime")]
pub mod upstream;

pub use credential::{Credential, CredentialResolver, CsrfPolicy};
pub use error::ExecError;
pub use handshake::{ExecContext, ExecHandshake, TicketRequestError};
pub use params::{ExecParameters, UpstreamUrlError, build_upstream_url};
pub use relay::{CloseFrame, RelayCore, RelayFrame, SessionState, Side, SocketEvent, Termination};
pub use ticket::{TicketAuthority, TicketError};

#[cfg(feature = "runtime")]
pub use registry::{SessionDescriptor, SessionId, SessionRegistry, SessionSnapshot};
#[cfg(feature = "runtime")]
pub use relay::session::{RelayOptions, RelayOutcome, RelaySession};
#[cfg(feature = "runtime")]
pub use relay::socket::{RelaySocket, SocketError};
#[cfg(feature = "runtime")]
pub use upstream::{CredentialPlacement, TungsteniteConnector, TungsteniteSocket, UpstreamConnector};
