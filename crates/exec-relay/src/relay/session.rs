//! Tokio driver for one relay session.

use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::{Instant, sleep};
use tracing::{debug, info};

use super::socket::RelaySocket;
use super::state::{Directive, RelayCore, SessionState, Termination};
use super::{CloseFrame, GOING_AWAY, RelayFrame, Side, SocketEvent};
use crate::registry::{Registration, SessionDescriptor, SessionId, SessionRegistry};

#[derive(Debug, Clone, Copy, Default)]
pub struct RelayOptions {
    /// Close both sides after this long without a relayed frame.
    pub idle_timeout: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayOutcome {
    pub session_id: SessionId,
    pub termination: Termination,
    pub frames_to_upstream: u64,
    pub frames_to_client: u64,
}

/// A registered pairing of one client socket and one upstream socket.
///
/// Both sockets are driven from a single task; each direction keeps
/// transport order and nothing is buffered beyond the socket itself.
pub struct RelaySession<C, U> {
    core: RelayCore,
    client: C,
    upstream: U,
    options: RelayOptions,
    terminate: oneshot::Receiver<CloseFrame>,
    registration: Registration,
    frames_to_upstream: u64,
    frames_to_client: u64,
}

impl<C, U> RelaySession<C, U>
where
    C: RelaySocket,
    U: RelaySocket,
{
    /// Registers the session and marks it open. Call only once both sockets
    /// are live.
    pub fn open(
        registry: &SessionRegistry,
        descriptor: SessionDescriptor,
        client: C,
        upstream: U,
        options: RelayOptions,
    ) -> Self {
        let (alloc_id, task, runtime) = (
            descriptor.alloc_id.clone(),
            descriptor.task.clone(),
            descriptor.runtime,
        );
        let (registration, terminate) = registry.register(descriptor);
        info!(
            session_id = %registration.id(),
            %alloc_id,
            %task,
            runtime,
            "exec session opened"
        );
        let mut core = RelayCore::new();
        core.open();
        Self {
            core,
            client,
            upstream,
            options,
            terminate,
            registration,
            frames_to_upstream: 0,
            frames_to_client: 0,
        }
    }

    pub fn id(&self) -> SessionId {
        self.registration.id()
    }

    /// Relays until either side closes or errors, the idle deadline passes
    /// or the registry terminates the session.
    pub async fn run(mut self) -> RelayOutcome {
        let idle_timeout = self.options.idle_timeout;
        let idle = sleep(idle_timeout.unwrap_or_default());
        tokio::pin!(idle);
        let mut idle_armed = idle_timeout.is_some();
        let mut terminate_armed = true;

        while self.core.state() != SessionState::Closed {
            let directive = tokio::select! {
                event = self.client.recv() => {
                    self.core.on_event(Side::Client, event.unwrap_or(SocketEvent::Closed(None)))
                }
                event = self.upstream.recv() => {
                    self.core.on_event(Side::Upstream, event.unwrap_or(SocketEvent::Closed(None)))
                }
                signal = &mut self.terminate, if terminate_armed => {
                    terminate_armed = false;
                    match signal {
                        Ok(frame) => self
                            .core
                            .shutdown(Termination::Terminated { code: frame.code }, frame),
                        Err(_) => Directive::Ignore,
                    }
                }
                () = &mut idle, if idle_armed => {
                    self.core.shutdown(
                        Termination::IdleTimeout,
                        CloseFrame::new(GOING_AWAY, "idle timeout"),
                    )
                }
            };

            if self.execute(directive).await {
                if let Some(timeout) = idle_timeout {
                    match Instant::now().checked_add(timeout) {
                        Some(deadline) => idle.as_mut().reset(deadline),
                        None => idle_armed = false,
                    }
                }
            }
        }

        let outcome = RelayOutcome {
            session_id: self.id(),
            termination: self
                .core
                .termination()
                .cloned()
                .unwrap_or(Termination::Closed {
                    by: Side::Client,
                    code: None,
                }),
            frames_to_upstream: self.frames_to_upstream,
            frames_to_client: self.frames_to_client,
        };
        info!(
            session_id = %outcome.session_id,
            termination = ?outcome.termination,
            frames_to_upstream = outcome.frames_to_upstream,
            frames_to_client = outcome.frames_to_client,
            "exec session closed"
        );
        outcome
    }

    /// Carries out one directive. Returns true when a frame was relayed.
    async fn execute(&mut self, directive: Directive) -> bool {
        match directive {
            Directive::Forward { to, frame } => match self.send(to, frame).await {
                Ok(()) => {
                    match to {
                        Side::Upstream => self.frames_to_upstream += 1,
                        Side::Client => self.frames_to_client += 1,
                    }
                    true
                }
                Err(message) => {
                    if let Directive::Close { side, frame } =
                        self.core.on_event(to, SocketEvent::Error(message))
                    {
                        self.close(side, frame).await;
                        self.core.finish();
                    }
                    false
                }
            },
            Directive::Close { side, frame } => {
                self.close(side, frame).await;
                let closed_by = match self.core.termination() {
                    Some(Termination::Closed { by, .. }) => Some(*by),
                    _ => None,
                };
                if let Some(by) = closed_by {
                    self.finish_close(by).await;
                }
                self.core.finish();
                false
            }
            Directive::CloseBoth(frame) => {
                self.close(Side::Client, frame.clone()).await;
                self.close(Side::Upstream, frame).await;
                self.core.finish();
                false
            }
            Directive::Ignore => false,
        }
    }

    async fn send(&mut self, to: Side, frame: RelayFrame) -> Result<(), String> {
        let result = match to {
            Side::Client => self.client.send(frame).await,
            Side::Upstream => self.upstream.send(frame).await,
        };
        result.map_err(|error| error.to_string())
    }

    async fn finish_close(&mut self, side: Side) {
        let result = match side {
            Side::Client => self.client.finish_close().await,
            Side::Upstream => self.upstream.finish_close().await,
        };
        if let Err(error) = result {
            debug!(session_id = %self.id(), side = side.as_str(), %error, "close reply not sent");
        }
    }

    async fn close(&mut self, side: Side, frame: CloseFrame) {
        let code = frame.code;
        let result = match side {
            Side::Client => self.client.close(frame).await,
            Side::Upstream => self.upstream.close(frame).await,
        };
        match result {
            Ok(()) => debug!(session_id = %self.id(), side = side.as_str(), close_code = code, "closed relay side"),
            Err(error) => debug!(session_id = %self.id(), side = side.as_str(), %error, "relay side already gone"),
        }
    }
}
