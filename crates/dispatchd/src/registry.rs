//! Registry of running, cancellable invocations.
//!
//! Each asynchronous invocation registers a cancellation token once its child
//! process has spawned and clears it before reporting a terminal result.
//! Cancelling signals the token; the runner task owning the child does the
//! kill, so the lock is never held across process I/O.

use dispatch_core::Id;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug)]
struct Slot {
    id: Id,
    token: CancellationToken,
}

/// Running invocations in registration order.
#[derive(Debug, Default)]
pub struct ProcessRegistry {
    slots: Mutex<Vec<Slot>>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a running invocation. Returns false if the id is already present.
    pub async fn try_register(&self, id: Id, token: CancellationToken) -> bool {
        let mut slots = self.slots.lock().await;
        if slots.iter().any(|s| s.id == id) {
            return false;
        }
        debug!(execution_id = %id, running = slots.len() + 1, "registered process");
        slots.push(Slot { id, token });
        true
    }

    /// Remove an invocation. Returns whether it was registered.
    pub async fn clear(&self, id: &Id) -> bool {
        let mut slots = self.slots.lock().await;
        let before = slots.len();
        slots.retain(|s| &s.id != id);
        let removed = slots.len() != before;
        if removed {
            debug!(execution_id = %id, running = slots.len(), "cleared process");
        }
        removed
    }

    /// Request termination of one invocation. False when nothing is registered
    /// under that id.
    pub async fn signal(&self, id: &Id) -> bool {
        let slots = self.slots.lock().await;
        match slots.iter().find(|s| &s.id == id) {
            Some(slot) => {
                slot.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Request termination of the most recently started invocation.
    pub async fn signal_latest(&self) -> Option<Id> {
        let slots = self.slots.lock().await;
        let slot = slots.last()?;
        slot.token.cancel();
        Some(slot.id.clone())
    }

    /// Request termination of every registered invocation.
    pub async fn signal_all(&self) -> usize {
        let slots = self.slots.lock().await;
        for slot in slots.iter() {
            slot.token.cancel();
        }
        slots.len()
    }

    pub async fn is_registered(&self, id: &Id) -> bool {
        self.slots.lock().await.iter().any(|s| &s.id == id)
    }

    /// Ids of running invocations, oldest first.
    pub async fn running_ids(&self) -> Vec<Id> {
        self.slots
            .lock()
            .await
            .iter()
            .map(|s| s.id.clone())
            .collect()
    }

    pub async fn is_empty(&self) -> bool {
        self.slots.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_then_clear() {
        let registry = ProcessRegistry::new();
        let id = Id::new();

        assert!(registry.is_empty().await);
        assert!(registry.try_register(id.clone(), CancellationToken::new()).await);
        assert!(registry.is_registered(&id).await);

        assert!(registry.clear(&id).await);
        assert!(!registry.is_registered(&id).await);
        assert!(!registry.clear(&id).await);
    }

    #[tokio::test]
    async fn duplicate_registration_is_rejected() {
        let registry = ProcessRegistry::new();
        let id = Id::new();
        assert!(registry.try_register(id.clone(), CancellationToken::new()).await);
        assert!(!registry.try_register(id, CancellationToken::new()).await);
        assert_eq!(registry.running_ids().await.len(), 1);
    }

    #[tokio::test]
    async fn signal_with_nothing_registered_returns_false() {
        let registry = ProcessRegistry::new();
        assert!(!registry.signal(&Id::new()).await);
        assert!(registry.signal_latest().await.is_none());
        assert_eq!(registry.signal_all().await, 0);
    }

    #[tokio::test]
    async fn signal_cancels_only_the_target() {
        let registry = ProcessRegistry::new();
        let (a, b) = (Id::new(), Id::new());
        let (ta, tb) = (CancellationToken::new(), CancellationToken::new());
        registry.try_register(a.clone(), ta.clone()).await;
        registry.try_register(b.clone(), tb.clone()).await;

        assert!(registry.signal(&a).await);
        assert!(ta.is_cancelled());
        assert!(!tb.is_cancelled());
        // Signalling does not remove; the runner clears on exit.
        assert!(registry.is_registered(&a).await);
    }

    #[tokio::test]
    async fn signal_latest_targets_newest_registration() {
        let registry = ProcessRegistry::new();
        let (a, b) = (Id::new(), Id::new());
        let (ta, tb) = (CancellationToken::new(), CancellationToken::new());
        registry.try_register(a.clone(), ta.clone()).await;
        registry.try_register(b.clone(), tb.clone()).await;

        assert_eq!(registry.signal_latest().await, Some(b.clone()));
        assert!(tb.is_cancelled());
        assert!(!ta.is_cancelled());

        registry.clear(&b).await;
        assert_eq!(registry.signal_latest().await, Some(a));
        assert!(ta.is_cancelled());
    }
}
