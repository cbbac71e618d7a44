//! Live exec sessions, keyed by session id.
//!
//! Sessions register when the relay opens and are removed by a guard when
//! the relay ends, including when its task is dropped. Each entry carries a
//! one-shot termination signal so sessions can be closed from outside.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::oneshot;
use tracing::debug;
use uuid::Uuid;

use crate::clock::unix_millis;
use crate::params::ExecParameters;
use crate::relay::CloseFrame;

pub type SessionId = Uuid;

/// What a session is about, recorded at registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionDescriptor {
    pub alloc_id: String,
    pub task: String,
    /// Which upgrade adapter accepted the socket.
    pub runtime: &'static str,
}

impl SessionDescriptor {
    pub fn new(params: &ExecParameters, runtime: &'static str) -> Self {
        Self {
            alloc_id: params.alloc_id.clone(),
            task: params.task.clone(),
            runtime,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    pub id: SessionId,
    #[serde(flatten)]
    pub descriptor: SessionDescriptor,
    pub opened_at_ms: u64,
}

struct SessionEntry {
    descriptor: SessionDescriptor,
    opened_at_ms: u64,
    terminate: Option<oneshot::Sender<CloseFrame>>,
}

#[derive(Clone, Default)]
pub struct SessionRegistry {
    entries: Arc<Mutex<HashMap<SessionId, SessionEntry>>>,
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("active", &self.len())
            .finish()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(
        &self,
        descriptor: SessionDescriptor,
    ) -> (Registration, oneshot::Receiver<CloseFrame>) {
        let id = Uuid::new_v4();
        let (terminate_tx, terminate_rx) = oneshot::channel();
        self.entries.lock().insert(
            id,
            SessionEntry {
                descriptor,
                opened_at_ms: unix_millis(),
                terminate: Some(terminate_tx),
            },
        );
        (
            Registration {
                id,
                registry: self.clone(),
            },
            terminate_rx,
        )
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn contains(&self, id: &SessionId) -> bool {
        self.entries.lock().contains_key(id)
    }

    pub fn snapshot(&self) -> Vec<SessionSnapshot> {
        let mut sessions: Vec<SessionSnapshot> = self
            .entries
            .lock()
            .iter()
            .map(|(id, entry)| SessionSnapshot {
                id: *id,
                descriptor: entry.descriptor.clone(),
                opened_at_ms: entry.opened_at_ms,
            })
            .collect();
        sessions.sort_by_key(|session| session.opened_at_ms);
        sessions
    }

    /// Asks one session to close both sides with `frame`. Returns false when
    /// the session is unknown or already asked.
    pub fn terminate(&self, id: &SessionId, frame: CloseFrame) -> bool {
        let sender = self
            .entries
            .lock()
            .get_mut(id)
            .and_then(|entry| entry.terminate.take());
        match sender {
            Some(sender) => sender.send(frame).is_ok(),
            None => false,
        }
    }

    /// Asks every live session to close. Returns how many were signalled.
    pub fn terminate_all(&self, frame: CloseFrame) -> usize {
        let senders: Vec<oneshot::Sender<CloseFrame>> = self
            .entries
            .lock()
            .values_mut()
            .filter_map(|entry| entry.terminate.take())
            .collect();
        senders
            .into_iter()
            .map(|sender| sender.send(frame.clone()).is_ok())
            .filter(|sent| *sent)
            .count()
    }

    fn remove(&self, id: &SessionId) {
        if self.entries.lock().remove(id).is_some() {
            debug!(session_id = %id, "exec session unregistered");
        }
    }
}

/// Removes its session from the registry on drop.
pub(crate) struct Registration {
    id: SessionId,
    registry: SessionRegistry,
}

impl Registration {
    pub(crate) fn id(&self) -> SessionId {
        self.id
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::GOING_AWAY;

    fn descriptor(alloc_id: &str) -> SessionDescriptor {
        SessionDescriptor {
            alloc_id: alloc_id.to_string(),
            task: "main".to_string(),
            runtime: "test",
        }
    }

    #[test]
    fn registration_guard_removes_entry() {
        let registry = SessionRegistry::new();
        let (registration, _terminate) = registry.register(descriptor("a"));
        let id = registration.id();
        assert_eq!(registry.len(), 1);
        assert!(registry.contains(&id));
        drop(registration);
        assert!(registry.is_empty());
        assert!(!registry.contains(&id));
    }

    #[test]
    fn snapshot_lists_sessions() {
        let registry = SessionRegistry::new();
        let (_a, _ta) = registry.register(descriptor("a"));
        let (_b, _tb) = registry.register(descriptor("b"));
        let mut allocs: Vec<String> = registry
            .snapshot()
            .into_iter()
            .map(|session| session.descriptor.alloc_id)
            .collect();
        allocs.sort();
        assert_eq!(allocs, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn terminate_signals_once() {
        let registry = SessionRegistry::new();
        let (registration, terminate) = registry.register(descriptor("a"));
        let frame = CloseFrame::new(GOING_AWAY, "bye");
        assert!(registry.terminate(&registration.id(), frame.clone()));
        assert!(!registry.terminate(&registration.id(), frame.clone()));
        assert_eq!(terminate.await.unwrap(), frame);
        assert!(!registry.terminate(&Uuid::new_v4(), CloseFrame::normal()));
    }

    #[tokio::test]
    async fn terminate_all_signals_every_session() {
        let registry = SessionRegistry::new();
        let (_a, terminate_a) = registry.register(descriptor("a"));
        let (_b, terminate_b) = registry.register(descriptor("b"));
        let frame = CloseFrame::new(GOING_AWAY, "server shutting down");
        assert_eq!(registry.terminate_all(frame.clone()), 2);
        assert_eq!(terminate_a.await.unwrap(), frame);
        assert_eq!(terminate_b.await.unwrap(), frame);
        assert_eq!(registry.terminate_all(frame), 0);
    }
}
