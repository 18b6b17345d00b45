//! In-process lock store.
//!
//! [`MemoryLockStore`] grants one holder per resource identifier among every
//! clone of the store. It suits single-process deployments and tests: loss of
//! ownership can be simulated with [`MemoryLockStore::revoke`], and store
//! outages with [`MemoryLockStore::fail_next`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;
use tracing::{debug, warn};

use super::{
    BoxError, BoxFuture, HeldLock, LockError, LockHandle, LockRequest, LockStore, LossSignal,
};

#[derive(Default)]
struct State {
    holders: HashMap<String, Holder>,
    next_lease: u64,
    pending_failures: usize,
    grants: u64,
}

struct Holder {
    lease: u64,
    loss: LossSignal,
}

#[derive(Default)]
struct Shared {
    state: Mutex<State>,
    // Woken whenever a resource becomes available.
    freed: Notify,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn free(&self, resource: &str, lease: u64) {
        let mut state = self.state();
        if state.holders.get(resource).is_some_and(|h| h.lease == lease) {
            state.holders.remove(resource);
            drop(state);
            self.freed.notify_waiters();
        }
    }
}

/// Shared in-memory lock store. Clones share the same lock table.
///
/// # Examples
///
/// ```
/// use lockjob::lock::{LockRequest, LockStore, MemoryLockStore};
/// use tokio_util::sync::CancellationToken;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let store = MemoryLockStore::new();
/// let request = LockRequest::new("reports", CancellationToken::new());
///
/// let mut handle = store.acquire(request).await.unwrap();
/// assert!(store.is_held("reports"));
///
/// handle.release().await.unwrap();
/// assert!(!store.is_held("reports"));
/// # }
/// ```
#[derive(Clone, Default)]
pub struct MemoryLockStore {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for MemoryLockStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryLockStore").finish_non_exhaustive()
    }
}

impl MemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if some handle currently owns `resource`.
    pub fn is_held(&self, resource: &str) -> bool {
        self.shared.state().holders.contains_key(resource)
    }

    /// Number of resources currently held.
    pub fn held_count(&self) -> usize {
        self.shared.state().holders.len()
    }

    /// Total number of grants since the store was created.
    pub fn grants(&self) -> u64 {
        self.shared.state().grants
    }

    /// Revokes ownership of `resource`, firing the holder's loss signal and
    /// making the resource available to waiters.
    ///
    /// Returns `false` if nobody held the resource.
    pub fn revoke(&self, resource: &str) -> bool {
        let holder = self.shared.state().holders.remove(resource);
        let Some(holder) = holder else {
            return false;
        };

        warn!(resource, lease = holder.lease, "revoking lock");
        holder.loss.fire();
        self.shared.freed.notify_waiters();
        true
    }

    /// Makes the next `count` acquisition attempts fail as if the store were
    /// unreachable.
    pub fn fail_next(&self, count: usize) {
        self.shared.state().pending_failures += count;
    }

    fn try_grant(&self, request: &LockRequest) -> Result<Option<LockHandle>, LockError> {
        let mut state = self.shared.state();
        if state.pending_failures > 0 {
            state.pending_failures -= 1;
            return Err(request.failed("lock store unavailable"));
        }

        if state.holders.contains_key(request.resource()) {
            return Ok(None);
        }

        state.next_lease += 1;
        state.grants += 1;
        let lease = state.next_lease;
        let loss = LossSignal::new();
        state.holders.insert(
            request.resource().to_owned(),
            Holder {
                lease,
                loss: loss.clone(),
            },
        );
        drop(state);

        debug!(resource = request.resource(), lease, "granted lock");
        let held = MemoryLease {
            shared: Arc::clone(&self.shared),
            resource: request.resource().to_owned(),
            lease,
        };
        Ok(Some(LockHandle::new(request.resource(), loss, held)))
    }

    async fn acquire_inner(&self, request: LockRequest) -> Result<LockHandle, LockError> {
        loop {
            if request.is_cancelled() {
                return Err(request.cancelled());
            }

            // Register interest before checking so a release between the
            // check and the wait is not missed.
            let freed = self.shared.freed.notified();
            tokio::pin!(freed);
            freed.as_mut().enable();

            if let Some(handle) = self.try_grant(&request)? {
                return Ok(handle);
            }

            tokio::select! {
                biased;
                _ = request.cancellation().cancelled() => return Err(request.cancelled()),
                _ = &mut freed => {}
            }
        }
    }
}

impl LockStore for MemoryLockStore {
    fn acquire(&self, request: LockRequest) -> BoxFuture<'_, Result<LockHandle, LockError>> {
        Box::pin(self.acquire_inner(request))
    }
}

// Frees the resource on release or drop, unless it was revoked in between.
struct MemoryLease {
    shared: Arc<Shared>,
    resource: String,
    lease: u64,
}

impl HeldLock for MemoryLease {
    fn release(self: Box<Self>) -> BoxFuture<'static, Result<(), BoxError>> {
        drop(self);
        Box::pin(async { Ok(()) })
    }
}

impl Drop for MemoryLease {
    fn drop(&mut self) {
        self.shared.free(&self.resource, self.lease);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn request(resource: &str) -> LockRequest {
        LockRequest::new(resource, CancellationToken::new())
    }

    #[tokio::test]
    async fn grants_distinct_resources_independently() {
        let store = MemoryLockStore::new();
        let _a = store.acquire(request("a")).await.unwrap();
        let _b = store.acquire(request("b")).await.unwrap();

        assert_eq!(store.held_count(), 2);
        assert_eq!(store.grants(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn waiter_is_granted_after_release() {
        let store = MemoryLockStore::new();
        let mut first = store.acquire(request("a")).await.unwrap();

        let waiter = {
            let store = store.clone();
            tokio::spawn(async move { store.acquire(request("a")).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        first.release().await.unwrap();
        let second = waiter.await.unwrap().unwrap();
        assert_eq!(second.resource(), "a");
        assert!(store.is_held("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_handle_frees_resource() {
        let store = MemoryLockStore::new();
        let first = store.acquire(request("a")).await.unwrap();
        drop(first);

        assert!(!store.is_held("a"));
        store.acquire(request("a")).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_aborts_wait() {
        let store = MemoryLockStore::new();
        let _held = store.acquire(request("a")).await.unwrap();

        let cancel = CancellationToken::new();
        let waiter = {
            let store = store.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { store.acquire(LockRequest::new("a", cancel)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();

        let err = waiter.await.unwrap().unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn cancelled_request_is_rejected_even_when_free() {
        let store = MemoryLockStore::new();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = store.acquire(LockRequest::new("a", cancel)).await.unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(store.grants(), 0);
    }

    #[tokio::test]
    async fn revoke_fires_loss_and_frees_resource() {
        let store = MemoryLockStore::new();
        let mut handle = store.acquire(request("a")).await.unwrap();

        assert!(store.revoke("a"));
        assert!(handle.is_lost());
        assert!(!store.is_held("a"));

        // A newer holder must survive the stale handle's release.
        let _next = store.acquire(request("a")).await.unwrap();
        handle.release().await.unwrap();
        assert!(store.is_held("a"));
        assert!(!store.revoke("b"));
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let store = MemoryLockStore::new();
        store.fail_next(1);

        let err = store.acquire(request("a")).await.unwrap_err();
        assert!(matches!(err, LockError::AcquisitionFailed { .. }));
        store.acquire(request("a")).await.unwrap();
    }
}
