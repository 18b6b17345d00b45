//! Loss notification for held locks.
//!
//! A [`LossSignal`] fires at most once, when the backing store revokes
//! ownership of a lock (connectivity loss, session expiry, forced takeover).
//! Interested parties either await [`LossSignal::lost`] or register a
//! callback with [`LossSignal::register`]; callbacks stay registered only as
//! long as the returned [`LossRegistration`] guard is alive.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio_util::sync::CancellationToken;

type Observer = Box<dyn FnOnce() + Send + 'static>;

struct Inner {
    fired: CancellationToken,
    observers: Mutex<HashMap<u64, Observer>>,
    next_id: AtomicU64,
    can_fire: bool,
}

impl Inner {
    fn observers(&self) -> MutexGuard<'_, HashMap<u64, Observer>> {
        self.observers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// One-shot, observable notification that a lock has been lost.
///
/// Cloning is cheap; all clones observe the same underlying signal.
///
/// # Examples
///
/// ```
/// use lockjob::lock::LossSignal;
///
/// let signal = LossSignal::new();
/// let registration = signal.register(|| println!("lost!"));
/// assert_eq!(signal.observer_count(), 1);
///
/// drop(registration);
/// assert_eq!(signal.observer_count(), 0);
///
/// assert!(signal.fire());
/// assert!(signal.is_lost());
/// ```
#[derive(Clone)]
pub struct LossSignal {
    inner: Arc<Inner>,
}

impl LossSignal {
    /// Creates a signal that may be fired by the store.
    pub fn new() -> Self {
        Self::build(true)
    }

    /// Creates a signal that can never fire.
    ///
    /// Used by stores that cannot detect loss of ownership; the handle is
    /// then only released explicitly.
    pub fn never() -> Self {
        Self::build(false)
    }

    fn build(can_fire: bool) -> Self {
        Self {
            inner: Arc::new(Inner {
                fired: CancellationToken::new(),
                observers: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
                can_fire,
            }),
        }
    }

    /// Returns `true` if this signal is able to fire at all.
    pub fn can_fire(&self) -> bool {
        self.inner.can_fire
    }

    /// Returns `true` once the signal has fired.
    pub fn is_lost(&self) -> bool {
        self.inner.fired.is_cancelled()
    }

    /// Completes when the signal fires. Pends forever for [`LossSignal::never`].
    pub async fn lost(&self) {
        self.inner.fired.cancelled().await;
    }

    /// Fires the signal, running every registered observer exactly once.
    ///
    /// Returns `false` if the signal had already fired or cannot fire.
    pub fn fire(&self) -> bool {
        if !self.inner.can_fire || self.inner.fired.is_cancelled() {
            return false;
        }
        self.inner.fired.cancel();

        // Observers run outside the lock so they may register or drop
        // other registrations freely.
        let observers = std::mem::take(&mut *self.inner.observers());
        for (_, observer) in observers {
            observer();
        }
        true
    }

    /// Registers `observer` to run when the signal fires.
    ///
    /// If the signal has already fired the observer runs immediately. The
    /// observer is unregistered when the returned guard is dropped.
    pub fn register<F>(&self, observer: F) -> LossRegistration
    where
        F: FnOnce() + Send + 'static,
    {
        let mut observers = self.inner.observers();
        if self.inner.fired.is_cancelled() {
            drop(observers);
            observer();
            return LossRegistration {
                inner: Arc::clone(&self.inner),
                id: None,
            };
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        observers.insert(id, Box::new(observer));
        LossRegistration {
            inner: Arc::clone(&self.inner),
            id: Some(id),
        }
    }

    /// Number of observers currently registered and not yet run.
    pub fn observer_count(&self) -> usize {
        self.inner.observers().len()
    }
}

impl Default for LossSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for LossSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LossSignal")
            .field("can_fire", &self.inner.can_fire)
            .field("lost", &self.is_lost())
            .field("observers", &self.observer_count())
            .finish()
    }
}

/// Guard for an observer registered on a [`LossSignal`].
///
/// Dropping the guard unregisters the observer if it has not run yet.
#[must_use = "dropping the registration unregisters the observer"]
pub struct LossRegistration {
    inner: Arc<Inner>,
    id: Option<u64>,
}

impl LossRegistration {
    /// Returns `true` while the observer is still waiting for the signal.
    pub fn is_pending(&self) -> bool {
        match self.id {
            Some(id) => self.inner.observers().contains_key(&id),
            None => false,
        }
    }
}

impl Drop for LossRegistration {
    fn drop(&mut self) {
        if let Some(id) = self.id.take() {
            self.inner.observers().remove(&id);
        }
    }
}

impl fmt::Debug for LossRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LossRegistration")
            .field("pending", &self.is_pending())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter() -> (Arc<AtomicUsize>, impl FnOnce() + Send + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let hook = {
            let count = Arc::clone(&count);
            move || {
                count.fetch_add(1, Ordering::SeqCst);
            }
        };
        (count, hook)
    }

    #[test]
    fn fire_runs_observers_once() {
        let signal = LossSignal::new();
        let (count, hook) = counter();
        let _registration = signal.register(hook);

        assert!(signal.fire());
        assert!(!signal.fire());
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(signal.observer_count(), 0);
    }

    #[test]
    fn dropped_registration_never_runs() {
        let signal = LossSignal::new();
        let (count, hook) = counter();
        let registration = signal.register(hook);
        assert!(registration.is_pending());

        drop(registration);
        signal.fire();

        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn register_after_fire_runs_immediately() {
        let signal = LossSignal::new();
        signal.fire();

        let (count, hook) = counter();
        let registration = signal.register(hook);

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!registration.is_pending());
        assert_eq!(signal.observer_count(), 0);
    }

    #[test]
    fn never_signal_ignores_fire() {
        let signal = LossSignal::never();
        assert!(!signal.can_fire());
        assert!(!signal.fire());
        assert!(!signal.is_lost());
    }

    #[test]
    fn clones_share_state() {
        let signal = LossSignal::new();
        let clone = signal.clone();
        let _registration = clone.register(|| {});

        assert_eq!(signal.observer_count(), 1);
        clone.fire();
        assert!(signal.is_lost());
    }

    #[tokio::test]
    async fn lost_completes_after_fire() {
        let signal = LossSignal::new();
        let waiter = {
            let signal = signal.clone();
            tokio::spawn(async move { signal.lost().await })
        };

        signal.fire();
        waiter.await.unwrap();
    }
}
