//! Exec upgrade adapters. Both run the same handshake and relay; they
//! differ only in how the server hands over the upgraded socket.

use exec_relay::{RelayOptions, RelayOutcome, RelaySession, RelaySocket, SessionDescriptor, SessionRegistry};
use tracing::info;

pub mod framework;
pub mod native;

/// Runs one relay session to completion and logs how it ended.
pub(crate) async fn relay<C, U>(
    sessions: &SessionRegistry,
    descriptor: SessionDescriptor,
    client: C,
    upstream: U,
    options: RelayOptions,
) -> RelayOutcome
where
    C: RelaySocket,
    U: RelaySocket,
{
    let runtime = descriptor.runtime;
    let outcome = RelaySession::open(sessions, descriptor, client, upstream, options)
        .run()
        .await;
    info!(
        session_id = %outcome.session_id,
        runtime,
        active_sessions = sessions.len(),
        "exec relay finished"
    );
    outcome
}
