//! Lock-gated repeating jobs.
//!
//! A [`JobLoop`] owns one resource identifier and one [`UnitOfWork`]. It
//! acquires the resource's lock, runs the work on a fixed cadence while the
//! lock is held, and starts over when the lock is lost or the work fails. It
//! exits once the external stop signal is set.
//!
//! ```text
//! Idle ──► Acquiring ──► Held ──► Idle ──► ...
//!  │           │           │
//!  │           │           └─► Stopping ──► Stopped
//!  └───────────┴─────────────────────────► Stopped
//! ```
//!
//! No error ever leaves the loop: acquisition failures, lock loss, unit of
//! work errors and panics are logged and the loop returns to `Idle`. Retries
//! happen immediately unless a [`Backoff`] is configured.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;
use tracing::{Instrument, Span, debug, error, info, info_span, warn};

use crate::cancel::{CancelCause, CombinedCancellation};
use crate::lock::{BoxError, BoxFuture, LockError, LockHandle, LockRequest, LockStore};

pub mod backoff;

pub use backoff::Backoff;
use backoff::BackoffState;

/// Cadence used when none is configured.
pub const DEFAULT_CADENCE: Duration = Duration::from_secs(30);

/// The repeated action performed while the lock is held.
///
/// Any `Fn(CancellationToken) -> impl Future<Output = Result<(), BoxError>>`
/// that is `Send + Sync + 'static` implements this trait. The token fires
/// when the job is stopping or the lock was lost; long-running work should
/// watch it and return early.
pub trait UnitOfWork: Send + Sync + 'static {
    fn call(&self, cancel: CancellationToken) -> BoxFuture<'static, Result<(), BoxError>>;
}

impl<T, F> UnitOfWork for T
where
    T: Fn(CancellationToken) -> F + Send + Sync + 'static,
    F: Future<Output = Result<(), BoxError>> + Send + 'static,
{
    fn call(&self, cancel: CancellationToken) -> BoxFuture<'static, Result<(), BoxError>> {
        Box::pin((self)(cancel))
    }
}

/// Wraps an async closure as a shared [`UnitOfWork`].
///
/// The direct `Fn` bound lets the closure's argument and error types be
/// inferred at the call site.
pub fn unit_of_work<W, F>(work: W) -> Arc<dyn UnitOfWork>
where
    W: Fn(CancellationToken) -> F + Send + Sync + 'static,
    F: Future<Output = Result<(), BoxError>> + Send + 'static,
{
    Arc::new(work)
}

/// Where a [`JobLoop`] is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobState {
    /// No handle held, not attempting.
    Idle,
    /// Waiting for the store to grant the lock.
    Acquiring,
    /// Lock held; the unit of work runs on the cadence.
    Held,
    /// Stop observed while held; releasing the lock.
    Stopping,
    /// Terminal.
    Stopped,
}

impl JobState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Acquiring => "acquiring",
            Self::Held => "held",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Collaborators shared by every job in a process: the lock store, the stop
/// signal, and the span jobs log under.
#[derive(Clone)]
pub struct JobContext {
    store: Arc<dyn LockStore>,
    stop: CancellationToken,
    span: Span,
}

impl JobContext {
    pub fn new(store: Arc<dyn LockStore>, stop: CancellationToken) -> Self {
        Self {
            store,
            stop,
            span: Span::none(),
        }
    }

    /// Parent span for every job built from this context.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn store(&self) -> &Arc<dyn LockStore> {
        &self.store
    }

    pub fn stop(&self) -> &CancellationToken {
        &self.stop
    }

    pub fn span(&self) -> &Span {
        &self.span
    }
}

impl fmt::Debug for JobContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobContext")
            .field("stopped", &self.stop.is_cancelled())
            .finish_non_exhaustive()
    }
}

// How a held period ended.
enum HeldExit {
    Stopped,
    Lost,
    Failed(LockError),
}

/// The acquire → work → release loop for one resource.
///
/// # Examples
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use std::time::Duration;
/// use lockjob::job::{JobContext, JobLoop};
/// use lockjob::lock::MemoryLockStore;
/// use tokio_util::sync::CancellationToken;
///
/// # #[tokio::main]
/// # async fn main() {
/// let stop = CancellationToken::new();
/// let ctx = JobContext::new(Arc::new(MemoryLockStore::new()), stop.clone());
///
/// let job = JobLoop::new(ctx, "reports", |_cancel| async {
///     println!("generating report");
///     Ok(())
/// })
/// .cadence(Duration::from_secs(30));
///
/// let task = tokio::spawn(job.run());
/// stop.cancel();
/// task.await.unwrap();
/// # }
/// ```
pub struct JobLoop {
    ctx: JobContext,
    resource: String,
    work: Arc<dyn UnitOfWork>,
    cadence: Duration,
    backoff: Backoff,
    state: watch::Sender<JobState>,
}

impl JobLoop {
    pub fn new<W, F>(ctx: JobContext, resource: impl Into<String>, work: W) -> Self
    where
        W: Fn(CancellationToken) -> F + Send + Sync + 'static,
        F: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        Self::with_shared(ctx, resource, unit_of_work(work))
    }

    /// Like [`JobLoop::new`] for any [`UnitOfWork`] behind an [`Arc`].
    pub fn with_shared(
        ctx: JobContext,
        resource: impl Into<String>,
        work: Arc<dyn UnitOfWork>,
    ) -> Self {
        let (state, _) = watch::channel(JobState::Idle);
        Self {
            ctx,
            resource: resource.into(),
            work,
            cadence: DEFAULT_CADENCE,
            backoff: Backoff::None,
            state,
        }
    }

    /// Time slept between unit of work invocations while the lock is held.
    pub fn cadence(mut self, cadence: Duration) -> Self {
        self.cadence = cadence;
        self
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Subscribes to state transitions. Take this before calling [`run`](Self::run).
    pub fn state(&self) -> watch::Receiver<JobState> {
        self.state.subscribe()
    }

    /// Runs until the stop signal drives the loop to [`JobState::Stopped`].
    pub async fn run(self) {
        let span = info_span!(parent: &self.ctx.span, "job", resource = %self.resource);
        self.run_loop().instrument(span).await;
    }

    async fn run_loop(&self) {
        let stop = &self.ctx.stop;
        let mut backoff = BackoffState::new(self.backoff);

        loop {
            self.transition(JobState::Idle);
            if stop.is_cancelled() {
                break;
            }

            self.transition(JobState::Acquiring);
            info!("will try to acquire lock");
            let request = LockRequest::new(&self.resource, stop.clone());
            let mut handle = match self.ctx.store.acquire(request).await {
                Ok(handle) => handle,
                Err(e) if e.is_cancelled() => {
                    debug!("acquisition cancelled by stop signal");
                    break;
                }
                Err(e) => {
                    error!(error = %e, detail = ?e, "lock acquisition failed");
                    self.transition(JobState::Idle);
                    self.pause(&mut backoff).await;
                    continue;
                }
            };

            backoff.reset();
            self.transition(JobState::Held);
            let exit = self.hold(&handle).await;

            // Leave Held before the store can hand the lock to someone else.
            self.transition(match exit {
                HeldExit::Stopped => JobState::Stopping,
                _ => JobState::Idle,
            });
            if let Err(e) = handle.release().await {
                warn!(error = %e, "failed to release lock");
            }
            drop(handle);

            match exit {
                HeldExit::Stopped => break,
                HeldExit::Lost => {
                    let e = LockError::LockLost {
                        resource: self.resource.clone(),
                    };
                    info!(error = %e, "retrying acquisition");
                    tokio::task::yield_now().await;
                }
                HeldExit::Failed(e) => {
                    error!(error = %e, detail = ?e, "job failed while holding lock");
                    self.pause(&mut backoff).await;
                }
            }
        }

        self.transition(JobState::Stopped);
        info!("job stopped");
    }

    // One held period. Both loss-signal registrations made here are guards
    // local to this frame, so they are torn down on every return path.
    async fn hold(&self, handle: &LockHandle) -> HeldExit {
        let kind = if handle.loss().can_fire() {
            "cancelable"
        } else {
            "uncancelable"
        };
        info!(kind, "acquired lock");

        let _loss_logger = {
            let resource = self.resource.clone();
            handle
                .loss()
                .register(move || error!(resource = %resource, "lost lock"))
        };
        let combined = CombinedCancellation::new(&self.ctx.stop, handle.loss());

        while !combined.is_cancelled() {
            let interrupted = tokio::select! {
                biased;
                _ = combined.cancelled() => true,
                _ = tokio::time::sleep(self.cadence) => false,
            };

            if !interrupted {
                debug!("running unit of work");
                if let Err(source) = self.run_work(&combined).await {
                    return HeldExit::Failed(LockError::UnhandledWork {
                        resource: self.resource.clone(),
                        source,
                    });
                }
            }

            if self.ctx.stop.is_cancelled() {
                debug!("stop requested");
            } else {
                debug!("stop not requested");
            }
        }

        match combined.cause() {
            Some(CancelCause::Stopped) => HeldExit::Stopped,
            _ => HeldExit::Lost,
        }
    }

    // Runs one call on its own task so a panic surfaces as a `JoinError`
    // instead of unwinding through the loop. The task is aborted if the loop
    // itself is dropped mid-call.
    async fn run_work(&self, combined: &CombinedCancellation) -> Result<(), BoxError> {
        let work = Arc::clone(&self.work);
        let cancel = combined.child_token();
        let task = tokio::spawn(async move { work.call(cancel).await }.in_current_span());

        match AbortOnDropHandle::new(task).await {
            Ok(result) => result,
            Err(e) => Err(e.into()),
        }
    }

    // Waits out the backoff delay, cut short by stop. Without a backoff this
    // only yields to the scheduler.
    async fn pause(&self, backoff: &mut BackoffState) {
        let Some(delay) = backoff.next_delay() else {
            tokio::task::yield_now().await;
            return;
        };
        debug!(delay = ?delay, "backing off before retry");
        tokio::select! {
            _ = self.ctx.stop.cancelled() => {}
            _ = tokio::time::sleep(delay) => {}
        }
    }

    fn transition(&self, next: JobState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(from = %previous, to = %next, "job state changed");
        }
    }
}

impl fmt::Debug for JobLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobLoop")
            .field("resource", &self.resource)
            .field("cadence", &self.cadence)
            .field("backoff", &self.backoff)
            .field("state", &*self.state.borrow())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::MemoryLockStore;

    fn context(store: &MemoryLockStore) -> (JobContext, CancellationToken) {
        let stop = CancellationToken::new();
        (JobContext::new(Arc::new(store.clone()), stop.clone()), stop)
    }

    #[test]
    fn state_labels() {
        assert_eq!(JobState::Acquiring.to_string(), "acquiring");
        assert!(JobState::Stopped.is_terminal());
        assert!(!JobState::Stopping.is_terminal());
    }

    #[test]
    fn defaults() {
        let store = MemoryLockStore::new();
        let (ctx, _) = context(&store);
        let job = JobLoop::new(ctx, "reports", |_| async { Ok(()) });

        assert_eq!(job.cadence, DEFAULT_CADENCE);
        assert_eq!(job.backoff, Backoff::None);
        assert_eq!(*job.state().borrow(), JobState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn stopping_while_held_releases_lock() {
        let store = MemoryLockStore::new();
        let (ctx, stop) = context(&store);
        let job = JobLoop::new(ctx, "reports", |_| async { Ok(()) })
            .cadence(Duration::from_secs(5));
        let mut state = job.state();
        let task = tokio::spawn(job.run());

        state.wait_for(|s| *s == JobState::Held).await.unwrap();
        assert!(store.is_held("reports"));

        stop.cancel();
        task.await.unwrap();
        assert_eq!(*state.borrow(), JobState::Stopped);
        assert!(!store.is_held("reports"));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_acquisition_backs_off_when_configured() {
        let store = MemoryLockStore::new();
        store.fail_next(2);
        let (ctx, stop) = context(&store);
        let job = JobLoop::new(ctx, "reports", |_| async { Ok(()) })
            .backoff(Backoff::Fixed(Duration::from_secs(10)));
        let mut state = job.state();
        let start = tokio::time::Instant::now();
        let task = tokio::spawn(job.run());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(*state.borrow(), JobState::Idle);

        state.wait_for(|s| *s == JobState::Held).await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(20));

        stop.cancel();
        task.await.unwrap();
    }
}
