//! Two simulated process instances competing for the same jobs.
//!
//! Both "instances" share one in-memory lock store, so for each resource
//! only one of them does the work. Every 20 seconds the demo revokes the
//! report lock to show the holder losing it and the loops re-acquiring.
//!
//! Run with:
//!
//! ```text
//! RUST_LOG=lockjob=debug,two_workers=info cargo run --example two_workers
//! ```

use std::sync::Arc;
use std::time::Duration;

use lockjob::config::WorkerConfig;
use lockjob::job::{JobContext, unit_of_work};
use lockjob::lock::MemoryLockStore;
use lockjob::worker::WorkerSet;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

const CONFIG: &str = r#"{
    "store": { "url": "memory://" },
    "jobs": [
        { "name": "reports", "resource": "a1416b2940b34bbb9189caaa13f11b1a", "poll_interval_secs": 3 },
        { "name": "cleanup", "resource": "cleanup", "poll_interval_secs": 5,
          "backoff": { "kind": "exponential", "initial_ms": 200, "max_ms": 5000 } }
    ]
}"#;

fn instance(
    name: &'static str,
    store: &MemoryLockStore,
    config: &WorkerConfig,
) -> Result<WorkerSet, Box<dyn std::error::Error>> {
    let ctx = JobContext::new(Arc::new(store.clone()), CancellationToken::new())
        .with_span(tracing::info_span!("instance", name));

    let workers = WorkerSet::from_config(ctx, config, |job| {
        let job_name = job.name.clone();
        Some(unit_of_work(move |_cancel| {
            let job_name = job_name.clone();
            async move {
                info!(instance = name, job = %job_name, "Doing stuff.");
                Ok(())
            }
        }))
    })?;
    Ok(workers)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut config = WorkerConfig::from_json_str(CONFIG)?;
    config.apply_env(|var| std::env::var(var).ok())?;
    config.validate()?;

    let store = config.store.memory_store()?;
    let first = instance("first", &store, &config)?;
    let second = instance("second", &store, &config)?;

    let revoker = {
        let store = store.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(20));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                store.revoke("a1416b2940b34bbb9189caaa13f11b1a");
            }
        })
    };

    info!("press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;

    revoker.abort();
    tokio::join!(first.shutdown(), second.shutdown());
    info!(held = store.held_count(), "demo finished");
    Ok(())
}
