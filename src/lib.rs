//! # lockjob
//!
//! Lock-gated repeating background jobs. Every process runs the same jobs;
//! a distributed lock per job guarantees that at most one of them performs
//! the work at any moment.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use lockjob::job::{JobContext, JobLoop};
//! use lockjob::lock::MemoryLockStore;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() {
//!     let stop = CancellationToken::new();
//!     let ctx = JobContext::new(Arc::new(MemoryLockStore::new()), stop.clone());
//!
//!     let job = JobLoop::new(ctx, "a1416b2940b34bbb9189caaa13f11b1a", |_cancel| async {
//!         println!("Doing stuff.");
//!         Ok(())
//!     })
//!     .cadence(Duration::from_secs(30));
//!
//!     let task = tokio::spawn(job.run());
//!     tokio::signal::ctrl_c().await.ok();
//!     stop.cancel();
//!     task.await.ok();
//! }
//! ```

// ── Lock store contract and the in-process store ─────────────────────────────
pub mod lock;

// ── Stop ∨ loss signal composition ───────────────────────────────────────────
pub mod cancel;

// ── The acquire → work → release loop ────────────────────────────────────────
pub mod job;

// ── Configuration and process-level supervision ──────────────────────────────
pub mod config;
pub mod worker;

// ── Convenience re-exports ────────────────────────────────────────────────────
pub use cancel::{CancelCause, CombinedCancellation};
pub use config::{ConfigError, JobConfig, WorkerConfig};
pub use job::{Backoff, JobContext, JobLoop, JobState, UnitOfWork, unit_of_work};
pub use lock::{
    BoxError, LockError, LockHandle, LockRequest, LockStore, LossSignal, MemoryLockStore,
};
pub use worker::{WorkerError, WorkerSet};
