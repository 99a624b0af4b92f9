//! In-flight transaction bookkeeping.

use crate::ClientError;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::debug;

/// Why a pending request was completed without a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    ConnectionClosed,
    Timeout,
    Cancelled,
}

/// What a waiting caller eventually receives: the response PDU or the reason
/// it will never arrive.
pub type Completion = Result<Vec<u8>, AbortReason>;

#[derive(Debug)]
pub struct PendingRequest {
    pub transaction_id: u16,
    pub completion: oneshot::Sender<Completion>,
    pub created_at: Instant,
}

impl PendingRequest {
    fn complete(self, result: Completion) {
        debug!(
            transaction_id = self.transaction_id,
            elapsed_ms = self.created_at.elapsed().as_millis() as u64,
            ok = result.is_ok(),
            "resolving pending request"
        );
        // The caller may already be gone; nothing left to tell it.
        let _ = self.completion.send(result);
    }
}

#[derive(Debug)]
struct Inner {
    pending: HashMap<u16, PendingRequest>,
    open: bool,
}

/// Maps transaction ids to the callers waiting on them.
///
/// Every entry leaves the map exactly once, through [`try_resolve`],
/// [`drain_all`] or [`remove`]; whichever gets there first wins and the
/// others see nothing.
///
/// [`try_resolve`]: TransactionRegistry::try_resolve
/// [`drain_all`]: TransactionRegistry::drain_all
/// [`remove`]: TransactionRegistry::remove
#[derive(Debug)]
pub struct TransactionRegistry {
    next_id: AtomicU16,
    inner: Mutex<Inner>,
}

impl Default for TransactionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionRegistry {
    /// A closed registry; [`reopen`](Self::reopen) it once a link is up.
    pub fn new() -> Self {
        Self {
            next_id: AtomicU16::new(1),
            inner: Mutex::new(Inner {
                pending: HashMap::new(),
                open: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Next transaction id, wrapping at 2^16.
    pub fn next_id(&self) -> u16 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn register(
        &self,
        transaction_id: u16,
        completion: oneshot::Sender<Completion>,
    ) -> Result<(), ClientError> {
        let mut inner = self.lock();
        if !inner.open {
            return Err(ClientError::ConnectionClosed);
        }
        if inner.pending.contains_key(&transaction_id) {
            return Err(ClientError::DuplicateTransaction(transaction_id));
        }
        inner.pending.insert(
            transaction_id,
            PendingRequest {
                transaction_id,
                completion,
                created_at: Instant::now(),
            },
        );
        Ok(())
    }

    /// Remove and complete the entry for `transaction_id`.
    ///
    /// Returns `false` when nothing was pending under that id.
    pub fn try_resolve(&self, transaction_id: u16, result: Completion) -> bool {
        let entry = self.lock().pending.remove(&transaction_id);
        match entry {
            Some(pending) => {
                pending.complete(result);
                true
            }
            None => false,
        }
    }

    /// Drop an entry without completing it.
    pub fn remove(&self, transaction_id: u16) -> bool {
        self.lock().pending.remove(&transaction_id).is_some()
    }

    /// Fail every pending entry with `reason` and close the registry so that
    /// nothing can register until [`reopen`](Self::reopen).
    pub fn drain_all(&self, reason: AbortReason) -> usize {
        let drained: Vec<PendingRequest> = {
            let mut inner = self.lock();
            inner.open = false;
            inner.pending.drain().map(|(_, pending)| pending).collect()
        };
        let count = drained.len();
        for pending in drained {
            pending.complete(Err(reason));
        }
        count
    }

    pub fn reopen(&self) {
        self.lock().open = true;
    }

    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::{AbortReason, TransactionRegistry};
    use crate::ClientError;
    use std::collections::HashSet;
    use std::sync::atomic::Ordering;
    use tokio::sync::oneshot;

    fn open_registry() -> TransactionRegistry {
        let registry = TransactionRegistry::new();
        registry.reopen();
        registry
    }

    #[test]
    fn ids_are_distinct_and_wrap() {
        let registry = TransactionRegistry::new();
        let ids: HashSet<u16> = (0..1000).map(|_| registry.next_id()).collect();
        assert_eq!(ids.len(), 1000);

        registry.next_id.store(u16::MAX, Ordering::Relaxed);
        assert_eq!(registry.next_id(), u16::MAX);
        assert_eq!(registry.next_id(), 0);
        assert_eq!(registry.next_id(), 1);
    }

    #[test]
    fn duplicate_id_is_rejected_while_pending() {
        let registry = open_registry();
        let (tx, _rx) = oneshot::channel();
        registry.register(7, tx).unwrap();

        let (tx, _rx2) = oneshot::channel();
        assert!(matches!(
            registry.register(7, tx),
            Err(ClientError::DuplicateTransaction(7))
        ));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn only_the_first_resolution_counts() {
        let registry = open_registry();
        let (tx, rx) = oneshot::channel();
        registry.register(3, tx).unwrap();

        assert!(registry.try_resolve(3, Ok(vec![0x06])));
        assert!(!registry.try_resolve(3, Err(AbortReason::Timeout)));
        assert_eq!(rx.await.unwrap(), Ok(vec![0x06]));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn drain_fails_everything_and_closes() {
        let registry = open_registry();
        let mut receivers = Vec::new();
        for id in 1..=5 {
            let (tx, rx) = oneshot::channel();
            registry.register(id, tx).unwrap();
            receivers.push(rx);
        }

        assert_eq!(registry.drain_all(AbortReason::ConnectionClosed), 5);
        for rx in receivers {
            assert_eq!(rx.await.unwrap(), Err(AbortReason::ConnectionClosed));
        }
        assert!(registry.is_empty());

        let (tx, _rx) = oneshot::channel();
        assert!(matches!(
            registry.register(9, tx),
            Err(ClientError::ConnectionClosed)
        ));
        assert_eq!(registry.drain_all(AbortReason::ConnectionClosed), 0);

        registry.reopen();
        let (tx, _rx) = oneshot::channel();
        registry.register(9, tx).unwrap();
    }

    #[test]
    fn remove_is_silent() {
        let registry = open_registry();
        let (tx, mut rx) = oneshot::channel();
        registry.register(11, tx).unwrap();
        assert!(registry.remove(11));
        assert!(!registry.remove(11));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn resolving_a_dropped_waiter_still_removes_it() {
        let registry = open_registry();
        let (tx, rx) = oneshot::channel();
        registry.register(4, tx).unwrap();
        drop(rx);
        assert!(registry.try_resolve(4, Ok(Vec::new())));
        assert!(registry.is_empty());
    }
}
