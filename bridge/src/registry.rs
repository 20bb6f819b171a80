//! Client id to session registry.
//!
//! The one piece of state shared by all connections. Each client id has an
//! establishment slot: a connection holds the slot from CONNECT until its
//! session is fully closed, so at most one session per client id exists at
//! any time. A CONNECT for an id whose session is READY closes that session
//! (MQTT-3.1.4-2); one for an id still being established waits for it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info};

use crate::session::{CloseOutcome, CloseReason, SessionHandle};

/// Delay before retrying a slot held by a session still being established.
pub const TAKEOVER_RETRY: Duration = Duration::from_millis(100);

type Slot = Arc<tokio::sync::Mutex<()>>;

/// Concurrency-safe map of READY sessions by client id.
#[derive(Default)]
pub struct Registry {
    sessions: Mutex<HashMap<String, SessionHandle>>,
    slots: Mutex<HashMap<String, Slot>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the establishment slot for `client_id`.
    ///
    /// A READY session holding the id is closed first; an establishing one
    /// is waited for.
    pub async fn claim(self: &Arc<Self>, client_id: &str) -> ClientSlot {
        loop {
            let slot = self
                .slots
                .lock()
                .entry(client_id.to_string())
                .or_default()
                .clone();

            if let Ok(guard) = slot.try_lock_owned() {
                return ClientSlot {
                    registry: Arc::clone(self),
                    client_id: client_id.to_string(),
                    registered: None,
                    _guard: guard,
                };
            }

            let existing = self.get(client_id).filter(|handle| !handle.is_closed());
            match existing {
                Some(handle) => {
                    info!(
                        "Client {} reconnecting, closing session from {}",
                        client_id,
                        handle.remote_addr()
                    );
                    handle.close(CloseReason::TakenOver).await;
                }
                None => {
                    debug!("Client {} still being established, retrying", client_id);
                    tokio::time::sleep(TAKEOVER_RETRY).await;
                }
            }
        }
    }

    pub fn get(&self, client_id: &str) -> Option<SessionHandle> {
        self.sessions.lock().get(client_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }

    pub fn client_ids(&self) -> Vec<String> {
        self.sessions.lock().keys().cloned().collect()
    }

    /// Close every registered session and wait for all of them.
    pub async fn close_all(&self, reason: CloseReason) -> Vec<CloseOutcome> {
        let handles: Vec<SessionHandle> = self.sessions.lock().values().cloned().collect();
        let closes = handles.iter().map(|handle| handle.close(reason));
        futures::future::join_all(closes)
            .await
            .into_iter()
            .flatten()
            .collect()
    }

    fn release(&self, client_id: &str, registered: Option<&SessionHandle>) {
        if let Some(handle) = registered {
            let mut sessions = self.sessions.lock();
            // Only remove our own entry.
            if sessions
                .get(client_id)
                .is_some_and(|current| current.same_session(handle))
            {
                sessions.remove(client_id);
            }
        }

        let mut slots = self.slots.lock();
        // One reference in the map, one in the guard being dropped.
        if slots
            .get(client_id)
            .is_some_and(|slot| Arc::strong_count(slot) <= 2)
        {
            slots.remove(client_id);
        }
    }
}

/// Exclusive right to a client id, released on drop.
pub struct ClientSlot {
    registry: Arc<Registry>,
    client_id: String,
    registered: Option<SessionHandle>,
    _guard: OwnedMutexGuard<()>,
}

impl ClientSlot {
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Publish the READY session under the slot's client id.
    pub fn register(&mut self, handle: SessionHandle) {
        self.registry
            .sessions
            .lock()
            .insert(self.client_id.clone(), handle.clone());
        self.registered = Some(handle);
    }
}

impl Drop for ClientSlot {
    fn drop(&mut self) {
        self.registry
            .release(&self.client_id, self.registered.as_ref());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryBroker;
    use crate::session::{BridgeSession, SessionConfig};
    use crate::types::ConnectRequest;
    use tokio::sync::mpsc;

    async fn ready_session(broker: &MemoryBroker, client_id: &str) -> BridgeSession {
        let (tx, _rx) = mpsc::channel(16);
        let mut session = BridgeSession::new(
            SessionConfig::default(),
            ConnectRequest::new(client_id),
            "127.0.0.1:1".parse().unwrap(),
            tx,
        );
        session.open(broker).await.unwrap();
        session
    }

    #[tokio::test]
    async fn test_claim_and_release() {
        let registry = Arc::new(Registry::new());
        let broker = MemoryBroker::default();
        let session = ready_session(&broker, "c1").await;

        let mut slot = registry.claim("c1").await;
        slot.register(session.handle());
        assert_eq!(registry.len(), 1);
        assert!(registry.get("c1").is_some());

        drop(slot);
        assert!(registry.is_empty());
        assert!(registry.slots.lock().is_empty());
    }

    #[tokio::test]
    async fn test_claim_takes_over_ready_session() {
        let registry = Arc::new(Registry::new());
        let broker = MemoryBroker::default();
        let mut session = ready_session(&broker, "c1").await;

        let mut slot = registry.claim("c1").await;
        slot.register(session.handle());

        let owner = tokio::spawn(async move {
            let (_tx, rx) = mpsc::channel(1);
            let outcome = session.run(rx).await;
            drop(slot);
            outcome
        });

        let second = registry.claim("c1").await;
        assert_eq!(second.client_id(), "c1");
        let outcome = owner.await.unwrap();
        assert_eq!(outcome.reason, CloseReason::TakenOver);
    }

    #[tokio::test(start_paused = true)]
    async fn test_claim_waits_for_establishing_session() {
        let registry = Arc::new(Registry::new());
        let first = registry.claim("c1").await;

        let waiter = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.claim("c1").await.client_id().to_string() })
        };

        tokio::time::sleep(TAKEOVER_RETRY * 3).await;
        assert!(!waiter.is_finished());

        drop(first);
        assert_eq!(waiter.await.unwrap(), "c1");
    }

    #[tokio::test]
    async fn test_stale_release_keeps_newer_registration() {
        let registry = Arc::new(Registry::new());
        let broker = MemoryBroker::default();
        let old = ready_session(&broker, "c1").await;
        let new = ready_session(&broker, "c1").await;

        registry.release("c1", Some(&old.handle()));
        registry.sessions.lock().insert("c1".to_string(), new.handle());
        registry.release("c1", Some(&old.handle()));
        assert!(registry.get("c1").unwrap().same_session(&new.handle()));
    }
}
