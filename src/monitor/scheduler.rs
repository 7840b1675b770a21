//! Background loops — interval-driven monitor passes and the cron-gated
//! staleness sweep.

use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::error::ConfigError;
use crate::monitor::ReplyMonitor;

/// Spawn the interval loop driving `run_once`.
///
/// The first tick is delayed by a random fraction of the interval so several
/// instances started together do not align their runs. Returns a `JoinHandle`
/// and a shutdown flag; set the flag to stop polling.
pub fn spawn_monitor_loop(
    monitor: Arc<ReplyMonitor>,
    interval: Duration,
) -> (JoinHandle<()>, Arc<AtomicBool>) {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);

    let handle = tokio::spawn(async move {
        let jitter = rand::thread_rng().gen_range(0..=interval.as_secs().max(1) / 4);
        info!(
            interval_secs = interval.as_secs(),
            jitter_secs = jitter,
            "Reply monitor loop started"
        );
        tokio::time::sleep(Duration::from_secs(jitter)).await;

        let mut tick = tokio::time::interval(interval);
        loop {
            tick.tick().await;

            if shutdown.load(Ordering::Relaxed) {
                info!("Reply monitor loop shutting down");
                return;
            }

            let summary = monitor.run_once().await;
            if summary.store_outage {
                error!(run_id = %summary.run_id, "Monitor run hit a store outage");
            }
        }
    });

    (handle, shutdown_flag)
}

/// Spawn the cron-gated staleness sweep loop.
///
/// Wakes once a minute, fires when the schedule's next occurrence has passed.
pub fn spawn_sweep_loop(
    monitor: Arc<ReplyMonitor>,
    schedule: &str,
) -> Result<(JoinHandle<()>, Arc<AtomicBool>), ConfigError> {
    let schedule = cron::Schedule::from_str(schedule).map_err(|e| ConfigError::InvalidSchedule {
        expr: schedule.to_string(),
        message: e.to_string(),
    })?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);

    let handle = tokio::spawn(async move {
        info!("Staleness sweep loop started");
        let mut next_fire = schedule.upcoming(Utc).next();
        let mut tick = tokio::time::interval(Duration::from_secs(60));

        loop {
            tick.tick().await;

            if shutdown.load(Ordering::Relaxed) {
                info!("Staleness sweep loop shutting down");
                return;
            }

            let due = next_fire.is_some_and(|at| at <= Utc::now());
            if !due {
                continue;
            }
            next_fire = schedule.upcoming(Utc).next();

            match monitor.sweep_stale().await {
                Ok(summary) if summary.threads_staled > 0 => {
                    info!(threads = summary.threads_staled, "Sweep pass complete");
                }
                Ok(_) => {}
                Err(e) => error!(error = %e, "Staleness sweep failed"),
            }
        }
    });

    Ok((handle, shutdown_flag))
}
