//! Long-running loops: planning, dispatch, usage flush, history cleanup.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tracing::{error, info};

use newsflow_common::Config;
use newsflow_delivery::{DeliveryPlanner, Dispatcher, JobStore, PollOutcome, UsageAccounting};

const PLANNER_TICK_SECS: u64 = 300;
const USAGE_FLUSH_SECS: u64 = 600;
const CLEANUP_TICK_SECS: u64 = 24 * 60 * 60;
const STALLED_SWEEP_SECS: u64 = 60;
/// How long a job may sit in processing before it is presumed orphaned
/// by a crashed worker. Well above the send timeout.
const CLAIM_STALE_SECS: i64 = 600;

/// Run all worker loops until ctrl-c.
pub async fn run(
    planner: Arc<DeliveryPlanner>,
    dispatcher: Arc<Dispatcher>,
    jobs: JobStore,
    usage: Arc<UsageAccounting>,
    config: &Config,
) -> Result<()> {
    let mut handles = Vec::new();

    handles.push(tokio::spawn(planner_loop(planner)));
    for worker in 0..config.dispatch_workers {
        handles.push(tokio::spawn(dispatch_loop(
            dispatcher.clone(),
            worker,
            config.dispatch_poll_secs,
        )));
    }
    handles.push(tokio::spawn(usage_loop(usage)));
    handles.push(tokio::spawn(stalled_loop(jobs.clone())));
    handles.push(tokio::spawn(cleanup_loop(jobs, config.delivery_retention_days)));

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, stopping worker loops");
    for handle in handles {
        handle.abort();
    }
    Ok(())
}

async fn planner_loop(planner: Arc<DeliveryPlanner>) {
    let mut tick = tokio::time::interval(Duration::from_secs(PLANNER_TICK_SECS));
    loop {
        tick.tick().await;
        if let Err(err) = planner.plan(Utc::now()).await {
            error!(error = %err, "Planner tick failed");
        }
    }
}

/// Drain runnable jobs, then idle until the next poll. A non-idle outcome
/// means there may be more work, so the loop polls again immediately.
async fn dispatch_loop(dispatcher: Arc<Dispatcher>, worker: usize, poll_secs: u64) {
    info!(worker, "Dispatch worker started");
    loop {
        match dispatcher.poll_once().await {
            Ok(PollOutcome::Idle) => {
                tokio::time::sleep(Duration::from_secs(poll_secs)).await;
            }
            Ok(_) => {}
            Err(err) => {
                error!(worker, error = %err, "Dispatch poll failed");
                tokio::time::sleep(Duration::from_secs(poll_secs)).await;
            }
        }
    }
}

async fn usage_loop(usage: Arc<UsageAccounting>) {
    let mut tick = tokio::time::interval(Duration::from_secs(USAGE_FLUSH_SECS));
    loop {
        tick.tick().await;
        if let Err(err) = usage.flush().await {
            error!(error = %err, "Usage flush failed");
        }
    }
}

async fn stalled_loop(jobs: JobStore) {
    let mut tick = tokio::time::interval(Duration::from_secs(STALLED_SWEEP_SECS));
    loop {
        tick.tick().await;
        if let Err(err) = jobs
            .requeue_stalled(chrono::Duration::seconds(CLAIM_STALE_SECS))
            .await
        {
            error!(error = %err, "Stalled job sweep failed");
        }
    }
}

async fn cleanup_loop(jobs: JobStore, retention_days: i64) {
    let mut tick = tokio::time::interval(Duration::from_secs(CLEANUP_TICK_SECS));
    loop {
        tick.tick().await;
        if let Err(err) = jobs.cleanup_history(retention_days).await {
            error!(error = %err, "Delivery history cleanup failed");
        }
    }
}
