//! Process-level supervision of job loops.
//!
//! A [`WorkerSet`] spawns one [`JobLoop`] per protected resource on the Tokio
//! runtime, keeps their state receivers for inspection, and on shutdown sets
//! the shared stop signal and waits for every loop to reach
//! [`JobState::Stopped`].

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::config::{ConfigError, JobConfig, WorkerConfig};
use crate::job::{JobContext, JobLoop, JobState, UnitOfWork};

/// Errors produced while building a [`WorkerSet`].
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("no unit of work registered for job `{job}`")]
    MissingWork { job: String },

    #[error("resource `{resource}` already has a running job")]
    DuplicateResource { resource: String },
}

// Bookkeeping for one spawned loop.
struct ManagedJob {
    name: String,
    resource: String,
    state: watch::Receiver<JobState>,
    task: JoinHandle<()>,
}

/// Owns the job loops of one process.
///
/// # Examples
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use lockjob::config::JobConfig;
/// use lockjob::job::{JobContext, unit_of_work};
/// use lockjob::lock::MemoryLockStore;
/// use lockjob::worker::WorkerSet;
/// use tokio_util::sync::CancellationToken;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let ctx = JobContext::new(Arc::new(MemoryLockStore::new()), CancellationToken::new());
/// let mut workers = WorkerSet::new(ctx);
/// workers.spawn_configured(
///     &JobConfig::new("reports", "reports"),
///     unit_of_work(|_cancel| async { Ok(()) }),
/// )?;
///
/// workers.run_until(async { tokio::signal::ctrl_c().await.unwrap_or(()) }).await;
/// # Ok(())
/// # }
/// ```
pub struct WorkerSet {
    ctx: JobContext,
    jobs: Vec<ManagedJob>,
}

impl WorkerSet {
    pub fn new(ctx: JobContext) -> Self {
        Self {
            ctx,
            jobs: Vec::new(),
        }
    }

    /// Builds and spawns every job in `config`, looking up each job's work
    /// with `work_for`.
    ///
    /// `ctx` must carry the store that `config.store` describes, for example
    /// one built with [`StoreConfig::memory_store`](crate::config::StoreConfig::memory_store).
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::Config`] if the configuration is invalid and
    /// [`WorkerError::MissingWork`] if `work_for` has nothing for a job. No
    /// job is spawned in either case.
    pub fn from_config<F>(
        ctx: JobContext,
        config: &WorkerConfig,
        mut work_for: F,
    ) -> Result<Self, WorkerError>
    where
        F: FnMut(&JobConfig) -> Option<Arc<dyn UnitOfWork>>,
    {
        config.validate()?;

        let mut planned = Vec::with_capacity(config.jobs.len());
        for job in &config.jobs {
            let work = work_for(job).ok_or_else(|| WorkerError::MissingWork {
                job: job.name.clone(),
            })?;
            planned.push((job, work));
        }

        info!(store = %config.store.url, jobs = planned.len(), "starting configured jobs");
        let mut workers = Self::new(ctx);
        for (job, work) in planned {
            let job_loop = JobLoop::with_shared(workers.ctx.clone(), &job.resource, work)
                .cadence(job.cadence())
                .backoff(job.backoff.into());
            workers.spawn(&job.name, job_loop)?;
        }
        Ok(workers)
    }

    pub fn context(&self) -> &JobContext {
        &self.ctx
    }

    /// Spawns a job described by `config`.
    pub fn spawn_configured(
        &mut self,
        config: &JobConfig,
        work: Arc<dyn UnitOfWork>,
    ) -> Result<(), WorkerError> {
        let job = JobLoop::with_shared(self.ctx.clone(), &config.resource, work)
            .cadence(config.cadence())
            .backoff(config.backoff.into());
        self.spawn(&config.name, job)
    }

    /// Spawns an already built loop under `name`.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::DuplicateResource`] if another job in this set
    /// protects the same resource.
    pub fn spawn(&mut self, name: impl Into<String>, job: JobLoop) -> Result<(), WorkerError> {
        if self.jobs.iter().any(|j| j.resource == job.resource()) {
            return Err(WorkerError::DuplicateResource {
                resource: job.resource().to_owned(),
            });
        }

        let name = name.into();
        let resource = job.resource().to_owned();
        let state = job.state();
        info!(job = %name, resource = %resource, "starting job");
        let task = tokio::spawn(job.run());

        self.jobs.push(ManagedJob {
            name,
            resource,
            state,
            task,
        });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Current state of every job, in spawn order.
    pub fn states(&self) -> Vec<(String, JobState)> {
        self.jobs
            .iter()
            .map(|j| (j.name.clone(), *j.state.borrow()))
            .collect()
    }

    /// State receiver for the job called `name`.
    pub fn watch(&self, name: &str) -> Option<watch::Receiver<JobState>> {
        self.jobs
            .iter()
            .find(|j| j.name == name)
            .map(|j| j.state.clone())
    }

    /// Resources this set is responsible for.
    pub fn resources(&self) -> HashSet<&str> {
        self.jobs.iter().map(|j| j.resource.as_str()).collect()
    }

    /// Sets the stop signal and waits for every job to stop.
    pub async fn shutdown(self) {
        info!(jobs = self.jobs.len(), "stopping jobs");
        self.ctx.stop().cancel();

        for job in self.jobs {
            if let Err(e) = job.task.await {
                error!(job = %job.name, error = %e, "job task ended abnormally");
            }
        }
        info!("all jobs stopped");
    }

    /// Waits for `signal` and then shuts down.
    pub async fn run_until<F>(self, signal: F)
    where
        F: Future<Output = ()>,
    {
        tokio::select! {
            _ = signal => {}
            _ = self.ctx.stop().cancelled() => {}
        }
        self.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::unit_of_work;
    use crate::lock::MemoryLockStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn noop() -> Arc<dyn UnitOfWork> {
        unit_of_work(|_| async { Ok(()) })
    }

    fn context() -> (JobContext, MemoryLockStore) {
        let store = MemoryLockStore::new();
        let ctx = JobContext::new(Arc::new(store.clone()), CancellationToken::new());
        (ctx, store)
    }

    #[tokio::test(start_paused = true)]
    async fn runs_and_stops_configured_jobs() {
        let (ctx, store) = context();
        let config = WorkerConfig::from_json_str(
            r#"{ "jobs": [
                { "name": "a", "resource": "ra", "poll_interval_secs": 1 },
                { "name": "b", "resource": "rb", "poll_interval_secs": 1 }
            ] }"#,
        )
        .unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let workers = WorkerSet::from_config(ctx, &config, |_| {
            let calls = Arc::clone(&calls);
            Some(unit_of_work(move |_| {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }))
        })
        .unwrap();
        assert_eq!(workers.len(), 2);

        let mut a = workers.watch("a").unwrap();
        a.wait_for(|s| *s == JobState::Held).await.unwrap();
        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert!(store.is_held("ra") && store.is_held("rb"));

        workers.shutdown().await;
        assert_eq!(store.held_count(), 0);
        assert!(calls.load(Ordering::SeqCst) >= 4);
    }

    #[tokio::test]
    async fn missing_work_spawns_nothing() {
        let (ctx, store) = context();
        let config = WorkerConfig {
            jobs: vec![JobConfig::new("a", "ra"), JobConfig::new("b", "rb")],
            ..WorkerConfig::default()
        };

        let result = WorkerSet::from_config(ctx, &config, |job| {
            (job.name == "a").then(|| unit_of_work(|_| async { Ok(()) }))
        });

        assert!(matches!(result, Err(WorkerError::MissingWork { job }) if job == "b"));
        assert_eq!(store.grants(), 0);
    }

    #[tokio::test]
    async fn duplicate_resource_is_rejected() {
        let (ctx, _) = context();
        let mut workers = WorkerSet::new(ctx);
        workers
            .spawn_configured(&JobConfig::new("a", "shared"), noop())
            .unwrap();

        let err = workers
            .spawn_configured(&JobConfig::new("b", "shared"), noop())
            .unwrap_err();
        assert!(matches!(err, WorkerError::DuplicateResource { .. }));
        assert_eq!(workers.resources().len(), 1);

        workers.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn run_until_stops_on_signal() {
        let (ctx, _) = context();
        let mut workers = WorkerSet::new(ctx);
        workers
            .spawn_configured(&JobConfig::new("a", "ra"), noop())
            .unwrap();
        let mut state = workers.watch("a").unwrap();

        workers
            .run_until(tokio::time::sleep(Duration::from_secs(1)))
            .await;
        assert_eq!(*state.borrow_and_update(), JobState::Stopped);
    }
}
