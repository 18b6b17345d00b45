//! Distributed lock primitives.
//!
//! This module defines the contract between the job loop and a lock backing
//! store:
//!
//! - [`LockStore`] — grants exclusive ownership of a named resource.
//! - [`LockRequest`] — resource identifier plus the cancellation context the
//!   acquisition waits under.
//! - [`LockHandle`] — current ownership of one resource, with a
//!   [`LossSignal`] and an idempotent release.
//! - [`LockError`] — every failure the lock layer and job loop report.
//!
//! Correctness of mutual exclusion is entirely the store's responsibility;
//! nothing in this crate implements consensus of its own.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub mod memory;
pub mod signal;

pub use memory::MemoryLockStore;
pub use signal::{LossRegistration, LossSignal};

/// Opaque error produced by a store or a unit of work.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Boxed, `Send` future used at the trait seams of this crate.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Errors produced by lock acquisition, release, and the job loop.
#[derive(Debug, Error)]
pub enum LockError {
    /// The stop signal fired while waiting for the lock. A normal shutdown path.
    #[error("acquisition of lock `{resource}` was cancelled")]
    AcquisitionCancelled { resource: String },

    /// The store was unreachable or rejected the request.
    #[error("failed to acquire lock `{resource}`: {source}")]
    AcquisitionFailed {
        resource: String,
        #[source]
        source: BoxError,
    },

    /// The store revoked ownership while the lock was held.
    #[error("lock `{resource}` was lost")]
    LockLost { resource: String },

    /// The unit of work failed while the lock was held.
    #[error("unit of work failed while holding lock `{resource}`: {source}")]
    UnhandledWork {
        resource: String,
        #[source]
        source: BoxError,
    },

    /// The store failed to release the lock.
    #[error("failed to release lock `{resource}`: {source}")]
    Release {
        resource: String,
        #[source]
        source: BoxError,
    },
}

impl LockError {
    /// Returns `true` for [`LockError::AcquisitionCancelled`].
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::AcquisitionCancelled { .. })
    }

    /// The resource identifier the error refers to.
    pub fn resource(&self) -> &str {
        match self {
            Self::AcquisitionCancelled { resource }
            | Self::AcquisitionFailed { resource, .. }
            | Self::LockLost { resource }
            | Self::UnhandledWork { resource, .. }
            | Self::Release { resource, .. } => resource,
        }
    }
}

/// A request to acquire the lock on one resource.
///
/// The cancellation token aborts the wait; stores must resolve with
/// [`LockError::AcquisitionCancelled`] once it fires.
#[derive(Debug, Clone)]
pub struct LockRequest {
    resource: String,
    cancel: CancellationToken,
}

impl LockRequest {
    pub fn new(resource: impl Into<String>, cancel: CancellationToken) -> Self {
        Self {
            resource: resource.into(),
            cancel,
        }
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Builds the cancellation error for this request.
    pub fn cancelled(&self) -> LockError {
        LockError::AcquisitionCancelled {
            resource: self.resource.clone(),
        }
    }

    /// Wraps a store failure for this request.
    pub fn failed(&self, source: impl Into<BoxError>) -> LockError {
        LockError::AcquisitionFailed {
            resource: self.resource.clone(),
            source: source.into(),
        }
    }
}

/// Store-side ownership of a granted lock.
///
/// Implementors must also free the resource when dropped without an explicit
/// [`release`](HeldLock::release), since a [`LockHandle`] that falls out of
/// scope abandons its lease by dropping it.
pub trait HeldLock: Send + Sync {
    /// Returns the resource to the store.
    fn release(self: Box<Self>) -> BoxFuture<'static, Result<(), BoxError>>;
}

/// Local representation of a currently held distributed lock.
///
/// Exclusively owned by whoever acquired it. [`release`](Self::release) is
/// idempotent; dropping an unreleased handle abandons the lease.
pub struct LockHandle {
    resource: String,
    loss: LossSignal,
    lease: Option<Box<dyn HeldLock>>,
    acquired_at: Instant,
}

impl LockHandle {
    pub fn new(
        resource: impl Into<String>,
        loss: LossSignal,
        lease: impl HeldLock + 'static,
    ) -> Self {
        Self {
            resource: resource.into(),
            loss,
            lease: Some(Box::new(lease)),
            acquired_at: Instant::now(),
        }
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// The signal that fires if the store revokes this lock.
    pub fn loss(&self) -> &LossSignal {
        &self.loss
    }

    pub fn is_lost(&self) -> bool {
        self.loss.is_lost()
    }

    pub fn is_released(&self) -> bool {
        self.lease.is_none()
    }

    pub fn acquired_at(&self) -> Instant {
        self.acquired_at
    }

    /// Releases the lock back to the store. Subsequent calls are no-ops.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Release`] if the store fails to free the resource.
    /// The handle counts as released either way.
    pub async fn release(&mut self) -> Result<(), LockError> {
        let Some(lease) = self.lease.take() else {
            return Ok(());
        };

        lease.release().await.map_err(|source| LockError::Release {
            resource: self.resource.clone(),
            source,
        })?;

        debug!(
            resource = %self.resource,
            held_for = ?self.acquired_at.elapsed(),
            "released lock"
        );
        Ok(())
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        if let Some(lease) = self.lease.take() {
            debug!(
                resource = %self.resource,
                held_for = ?self.acquired_at.elapsed(),
                "abandoning lock"
            );
            drop(lease);
        }
    }
}

impl fmt::Debug for LockHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockHandle")
            .field("resource", &self.resource)
            .field("loss", &self.loss)
            .field("released", &self.is_released())
            .finish()
    }
}

/// A backing store that arbitrates lock grants across processes.
///
/// `acquire` must suspend until ownership is granted or the request's
/// cancellation token fires. No timeout is applied by callers.
///
/// # Contract
///
/// - At most one outstanding [`LockHandle`] per resource identifier across
///   every participant.
/// - Loss of ownership is reported through the handle's [`LossSignal`],
///   never by polling.
/// - Releasing (or dropping) the handle makes the resource available again.
pub trait LockStore: Send + Sync {
    fn acquire(&self, request: LockRequest) -> BoxFuture<'_, Result<LockHandle, LockError>>;
}

impl<S> LockStore for Arc<S>
where
    S: LockStore + ?Sized,
{
    fn acquire(&self, request: LockRequest) -> BoxFuture<'_, Result<LockHandle, LockError>> {
        (**self).acquire(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingLease {
        released: Arc<AtomicUsize>,
        dropped: Arc<AtomicUsize>,
    }

    impl HeldLock for CountingLease {
        fn release(self: Box<Self>) -> BoxFuture<'static, Result<(), BoxError>> {
            self.released.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Ok(()) })
        }
    }

    impl Drop for CountingLease {
        fn drop(&mut self) {
            self.dropped.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct FailingLease;

    impl HeldLock for FailingLease {
        fn release(self: Box<Self>) -> BoxFuture<'static, Result<(), BoxError>> {
            Box::pin(async { Err("store unreachable".into()) })
        }
    }

    fn counting_handle() -> (LockHandle, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let released = Arc::new(AtomicUsize::new(0));
        let dropped = Arc::new(AtomicUsize::new(0));
        let handle = LockHandle::new(
            "jobs/report",
            LossSignal::new(),
            CountingLease {
                released: Arc::clone(&released),
                dropped: Arc::clone(&dropped),
            },
        );
        (handle, released, dropped)
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let (mut handle, released, _) = counting_handle();

        handle.release().await.unwrap();
        handle.release().await.unwrap();

        assert!(handle.is_released());
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn drop_abandons_lease() {
        let (handle, released, dropped) = counting_handle();
        drop(handle);

        assert_eq!(released.load(Ordering::SeqCst), 0);
        assert_eq!(dropped.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_release_reports_resource() {
        let mut handle = LockHandle::new("jobs/report", LossSignal::new(), FailingLease);

        let err = handle.release().await.unwrap_err();
        assert!(matches!(err, LockError::Release { .. }));
        assert_eq!(err.resource(), "jobs/report");
        assert!(handle.is_released());
        assert!(handle.release().await.is_ok());
    }

    #[test]
    fn request_builds_errors() {
        let request = LockRequest::new("jobs/report", CancellationToken::new());

        assert!(request.cancelled().is_cancelled());
        let failed = request.failed("connection refused");
        assert!(!failed.is_cancelled());
        assert_eq!(
            failed.to_string(),
            "failed to acquire lock `jobs/report`: connection refused"
        );
    }
}
