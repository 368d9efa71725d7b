//! Session registry.
//!
//! Keyed map from session key to exactly one active runtime backend.
//! Reservation is atomic: the key is claimed before the backend factory
//! runs, so two concurrent creates for the same key cannot both build a
//! backend, while creates for distinct keys proceed in parallel.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use log::{debug, warn};
use tokio_util::sync::CancellationToken;

use crate::backend::{BackendKind, RuntimeBackend};
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::session::SessionKey;

/// One registered session: the backend plus the token that interrupts its
/// in-flight waits on removal.
pub struct SessionEntry {
    pub backend: Arc<dyn RuntimeBackend>,
    pub cancel: CancellationToken,
}

impl std::fmt::Debug for SessionEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionEntry")
            .field("kind", &self.backend.kind())
            .field("cancel", &self.cancel)
            .finish_non_exhaustive()
    }
}

enum Slot {
    /// Key claimed; factory/start still running. The id ties the slot to
    /// the `create_exclusive` call that placed it, so that call touches
    /// only its own reservation: after a remove (cancellation is
    /// cooperative, the factory may still finish) the key can already be
    /// re-reserved by someone else.
    Reserved {
        cancel: CancellationToken,
        id: u64,
    },
    Active(Arc<SessionEntry>),
}

/// Registry enforcing at most one live backend per key.
#[derive(Default)]
pub struct SessionRegistry {
    slots: DashMap<SessionKey, Slot>,
    next_reservation: AtomicU64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up the active backend for a key. Reserved (still provisioning)
    /// entries are not returned.
    pub fn get(&self, key: &SessionKey) -> Option<Arc<SessionEntry>> {
        match self.slots.get(key).as_deref() {
            Some(Slot::Active(entry)) => Some(entry.clone()),
            _ => None,
        }
    }

    /// Create the backend for `key`, failing with `DuplicateSession` if any
    /// live entry (reserved or active) exists.
    ///
    /// The factory receives the session's cancellation token and runs
    /// outside the map lock; it is expected to return a *started* backend.
    /// On factory failure the reservation is released.
    pub async fn create_exclusive<F, Fut>(
        &self,
        key: &SessionKey,
        factory: F,
    ) -> OrchestratorResult<Arc<SessionEntry>>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = OrchestratorResult<Arc<dyn RuntimeBackend>>>,
    {
        let cancel = CancellationToken::new();
        let reservation = self.next_reservation.fetch_add(1, Ordering::Relaxed);
        match self.slots.entry(key.clone()) {
            Entry::Occupied(_) => return Err(OrchestratorError::DuplicateSession(key.clone())),
            Entry::Vacant(slot) => {
                slot.insert(Slot::Reserved {
                    cancel: cancel.clone(),
                    id: reservation,
                });
            }
        }

        match factory(cancel.clone()).await {
            Ok(backend) => {
                let entry = Arc::new(SessionEntry { backend, cancel });
                // upgrade only our own reservation; a concurrent remove may
                // have released the key (and a later create re-reserved it),
                // in which case the fresh backend must not be registered
                let upgraded = match self.slots.entry(key.clone()) {
                    Entry::Occupied(mut occupied) => {
                        if matches!(occupied.get(), Slot::Reserved { id, .. } if *id == reservation)
                        {
                            occupied.insert(Slot::Active(entry.clone()));
                            true
                        } else {
                            false
                        }
                    }
                    Entry::Vacant(_) => false,
                };
                if !upgraded {
                    if let Err(e) = entry.backend.cleanup().await {
                        warn!("cleanup of orphaned backend for {} failed: {}", key, e);
                    }
                    return Err(OrchestratorError::Cancelled);
                }
                debug!("session {} registered ({})", key, entry.backend.kind());
                Ok(entry)
            }
            Err(e) => {
                // release only our own reservation, never a foreign slot
                self.slots.remove_if(key, |_, slot| {
                    matches!(slot, Slot::Reserved { id, .. } if *id == reservation)
                });
                Err(e)
            }
        }
    }

    /// Remove the entry for `key`, cancelling in-flight waits and always
    /// running backend cleanup. Idempotent; returns whether an entry
    /// existed. Cleanup failures are logged, never propagated, so the key
    /// is never left permanently reserved.
    pub async fn remove(&self, key: &SessionKey) -> bool {
        let slot = match self.slots.remove(key) {
            Some((_, slot)) => slot,
            None => return false,
        };

        match slot {
            Slot::Reserved { cancel, .. } => {
                // interrupt the in-flight create; its upgrade path will
                // find its reservation gone, which is fine
                cancel.cancel();
                true
            }
            Slot::Active(entry) => {
                entry.cancel.cancel();
                if let Err(e) = entry.backend.cleanup().await {
                    warn!("cleanup for {} failed (entry removed anyway): {}", key, e);
                }
                true
            }
        }
    }

    /// Number of active sessions per backend kind.
    pub fn counts(&self) -> (usize, usize) {
        let mut local = 0;
        let mut remote = 0;
        for slot in self.slots.iter() {
            if let Slot::Active(entry) = slot.value() {
                match entry.backend.kind() {
                    BackendKind::Local => local += 1,
                    BackendKind::Remote => remote += 1,
                }
            }
        }
        (local, remote)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Event;
    use crate::session::{MessageAck, StatusSnapshot};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    struct NullBackend {
        kind: BackendKind,
        cleanups: AtomicU32,
    }

    impl NullBackend {
        fn new(kind: BackendKind) -> Self {
            Self {
                kind,
                cleanups: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl RuntimeBackend for NullBackend {
        fn kind(&self) -> BackendKind {
            self.kind
        }
        async fn start(&self, _cancel: &CancellationToken) -> OrchestratorResult<()> {
            Ok(())
        }
        async fn send_message(&self, _text: &str, _run: bool) -> OrchestratorResult<MessageAck> {
            unimplemented!("not exercised")
        }
        async fn pause(&self) -> OrchestratorResult<bool> {
            Ok(true)
        }
        async fn resume(&self) -> OrchestratorResult<bool> {
            Ok(true)
        }
        async fn status(&self) -> OrchestratorResult<StatusSnapshot> {
            unimplemented!("not exercised")
        }
        async fn events_since(&self, _since: u64) -> OrchestratorResult<Vec<Event>> {
            Ok(Vec::new())
        }
        async fn cleanup(&self) -> OrchestratorResult<()> {
            self.cleanups.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn key() -> SessionKey {
        SessionKey::new("alice", "shop", "main")
    }

    #[tokio::test]
    async fn test_create_then_get() {
        let registry = SessionRegistry::new();
        let entry = registry
            .create_exclusive(&key(), |_cancel| async {
                Ok(Arc::new(NullBackend::new(BackendKind::Local)) as Arc<dyn RuntimeBackend>)
            })
            .await
            .unwrap();
        assert_eq!(entry.backend.kind(), BackendKind::Local);
        assert!(registry.get(&key()).is_some());
        assert_eq!(registry.counts(), (1, 0));
    }

    #[tokio::test]
    async fn test_duplicate_create_is_rejected() {
        let registry = SessionRegistry::new();
        registry
            .create_exclusive(&key(), |_c| async {
                Ok(Arc::new(NullBackend::new(BackendKind::Remote)) as Arc<dyn RuntimeBackend>)
            })
            .await
            .unwrap();

        let err = registry
            .create_exclusive(&key(), |_c| async {
                Ok(Arc::new(NullBackend::new(BackendKind::Remote)) as Arc<dyn RuntimeBackend>)
            })
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::DuplicateSession(_)));
    }

    #[tokio::test]
    async fn test_concurrent_creates_one_winner() {
        let registry = Arc::new(SessionRegistry::new());

        let slow_factory = |_c: CancellationToken| async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(Arc::new(NullBackend::new(BackendKind::Local)) as Arc<dyn RuntimeBackend>)
        };

        let r1 = registry.clone();
        let r2 = registry.clone();
        let k = key();
        let (a, b) = tokio::join!(
            r1.create_exclusive(&k, slow_factory),
            r2.create_exclusive(&k, slow_factory),
        );

        let successes = [a.is_ok(), b.is_ok()].iter().filter(|&&ok| ok).count();
        assert_eq!(successes, 1);
        let duplicate = if a.is_err() { a.err() } else { b.err() };
        assert!(matches!(
            duplicate,
            Some(OrchestratorError::DuplicateSession(_))
        ));
        assert_eq!(registry.counts(), (1, 0));
    }

    #[tokio::test]
    async fn test_failed_factory_releases_key() {
        let registry = SessionRegistry::new();
        let err = registry
            .create_exclusive(&key(), |_c| async {
                Err::<Arc<dyn RuntimeBackend>, _>(OrchestratorError::ProvisioningFatal {
                    backend: BackendKind::Local,
                    reason: "boom".to_string(),
                })
            })
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::ProvisioningFatal { .. }));

        // key is free again
        assert!(registry.get(&key()).is_none());
        registry
            .create_exclusive(&key(), |_c| async {
                Ok(Arc::new(NullBackend::new(BackendKind::Local)) as Arc<dyn RuntimeBackend>)
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_create_finishing_after_remove_does_not_displace_new_entry() {
        let registry = Arc::new(SessionRegistry::new());
        let gate = Arc::new(tokio::sync::Notify::new());
        let first_backend = Arc::new(NullBackend::new(BackendKind::Local));

        let reg = registry.clone();
        let gate_in = gate.clone();
        let backend_in = first_backend.clone();
        let first = tokio::spawn(async move {
            reg.create_exclusive(&key(), move |_c| async move {
                gate_in.notified().await;
                Ok(backend_in as Arc<dyn RuntimeBackend>)
            })
            .await
        });

        // let the first call place its reservation, then free the key
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(registry.remove(&key()).await);

        // a second create claims the freed key while the first factory is
        // still in flight
        let second = registry
            .create_exclusive(&key(), |_c| async {
                Ok(Arc::new(NullBackend::new(BackendKind::Remote)) as Arc<dyn RuntimeBackend>)
            })
            .await
            .unwrap();
        assert_eq!(second.backend.kind(), BackendKind::Remote);

        // the first call completes late: it must not register, and its
        // backend must be cleaned up, not leaked
        gate.notify_one();
        let late = first.await.unwrap();
        assert!(matches!(late, Err(OrchestratorError::Cancelled)));
        assert_eq!(first_backend.cleanups.load(Ordering::SeqCst), 1);

        // the second entry is the one registered
        assert_eq!(registry.counts(), (0, 1));
        assert_eq!(
            registry.get(&key()).unwrap().backend.kind(),
            BackendKind::Remote
        );
    }

    #[tokio::test]
    async fn test_failed_create_does_not_release_foreign_reservation() {
        let registry = Arc::new(SessionRegistry::new());
        let gate = Arc::new(tokio::sync::Notify::new());

        let reg = registry.clone();
        let gate_in = gate.clone();
        let first = tokio::spawn(async move {
            reg.create_exclusive(&key(), move |_c| async move {
                gate_in.notified().await;
                Err::<Arc<dyn RuntimeBackend>, _>(OrchestratorError::ProvisioningFatal {
                    backend: BackendKind::Local,
                    reason: "boom".to_string(),
                })
            })
            .await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(registry.remove(&key()).await);

        let second = registry
            .create_exclusive(&key(), |_c| async {
                Ok(Arc::new(NullBackend::new(BackendKind::Remote)) as Arc<dyn RuntimeBackend>)
            })
            .await
            .unwrap();

        // the first call errors late; the second entry must survive
        gate.notify_one();
        assert!(first.await.unwrap().is_err());
        assert_eq!(registry.counts(), (0, 1));
        assert_eq!(
            registry.get(&key()).unwrap().backend.kind(),
            second.backend.kind()
        );
    }

    #[tokio::test]
    async fn test_remove_is_idempotent_and_runs_cleanup() {
        let registry = SessionRegistry::new();
        let backend = Arc::new(NullBackend::new(BackendKind::Local));
        let backend_in = backend.clone();
        registry
            .create_exclusive(&key(), move |_c| async move {
                Ok(backend_in as Arc<dyn RuntimeBackend>)
            })
            .await
            .unwrap();

        assert!(registry.remove(&key()).await);
        assert_eq!(backend.cleanups.load(Ordering::SeqCst), 1);
        assert!(!registry.remove(&key()).await);
        assert_eq!(backend.cleanups.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_distinct_keys_are_independent() {
        let registry = SessionRegistry::new();
        let other = SessionKey::new("bob", "shop", "main");

        registry
            .create_exclusive(&key(), |_c| async {
                Ok(Arc::new(NullBackend::new(BackendKind::Local)) as Arc<dyn RuntimeBackend>)
            })
            .await
            .unwrap();
        registry
            .create_exclusive(&other, |_c| async {
                Ok(Arc::new(NullBackend::new(BackendKind::Remote)) as Arc<dyn RuntimeBackend>)
            })
            .await
            .unwrap();

        assert_eq!(registry.counts(), (1, 1));
        assert!(registry.remove(&key()).await);
        assert!(registry.get(&other).is_some());
    }
}
