//! Composition of the stop signal with a lock's loss signal.
//!
//! A [`CombinedCancellation`] fires when either the external stop token is
//! cancelled or the held lock is lost. One is built for every held period and
//! dropped when that period ends; dropping it unregisters its observer from
//! the loss signal.

use tokio_util::sync::CancellationToken;

use crate::lock::{LossRegistration, LossSignal};

/// Why a [`CombinedCancellation`] fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelCause {
    /// The external stop signal was set.
    Stopped,
    /// The lock was revoked by the store.
    Lost,
}

/// Derived signal = stop OR loss.
///
/// Backed by a child of the stop token, so stop propagates without any
/// registration; loss is bridged in through a [`LossRegistration`] that lives
/// exactly as long as this value.
///
/// # Examples
///
/// ```
/// use lockjob::cancel::{CancelCause, CombinedCancellation};
/// use lockjob::lock::LossSignal;
/// use tokio_util::sync::CancellationToken;
///
/// let stop = CancellationToken::new();
/// let loss = LossSignal::new();
/// let combined = CombinedCancellation::new(&stop, &loss);
/// assert!(!combined.is_cancelled());
///
/// loss.fire();
/// assert!(combined.is_cancelled());
/// assert_eq!(combined.cause(), Some(CancelCause::Lost));
/// ```
#[derive(Debug)]
pub struct CombinedCancellation {
    stop: CancellationToken,
    loss: LossSignal,
    token: CancellationToken,
    _bridge: LossRegistration,
}

impl CombinedCancellation {
    pub fn new(stop: &CancellationToken, loss: &LossSignal) -> Self {
        let token = stop.child_token();
        let bridge = {
            let token = token.clone();
            loss.register(move || token.cancel())
        };

        Self {
            stop: stop.clone(),
            loss: loss.clone(),
            token,
            _bridge: bridge,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Completes once either source fires.
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }

    /// Which source fired. Stop takes precedence when both have.
    pub fn cause(&self) -> Option<CancelCause> {
        if self.stop.is_cancelled() {
            Some(CancelCause::Stopped)
        } else if self.loss.is_lost() {
            Some(CancelCause::Lost)
        } else {
            None
        }
    }

    /// A token for downstream work that follows this signal but cannot
    /// cancel it.
    pub fn child_token(&self) -> CancellationToken {
        self.token.child_token()
    }
}
