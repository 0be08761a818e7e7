//! Periodic, non-overlapping scan cycles on a tokio runtime.
//!
//! The cycle is moved into a blocking task for each tick and handed back
//! when the tick finishes, so two cycles of the same deployer can never run
//! at once. Ticks missed while a cycle runs long are skipped.

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::deployer::ScanCycle;

pub struct ScanScheduler;

/// Control surface of a running scheduler.
pub struct SchedulerHandle<T> {
    period_tx: watch::Sender<Duration>,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<Option<T>>,
}

impl ScanScheduler {
    /// Start running `cycle` immediately and then every `cycle.scan_period()`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn<T: ScanCycle>(cycle: T) -> SchedulerHandle<T> {
        let (period_tx, period_rx) = watch::channel(cycle.scan_period());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run(cycle, period_rx, shutdown_rx));
        SchedulerHandle {
            period_tx,
            shutdown_tx,
            task,
        }
    }
}

impl<T> SchedulerHandle<T> {
    /// Change the period; takes effect after the current wait.
    pub fn set_period(&self, period: Duration) {
        self.period_tx.send_replace(period);
    }

    pub fn period(&self) -> Duration {
        *self.period_tx.borrow()
    }

    /// Stop after the in-flight cycle, if any, and get the cycle back.
    ///
    /// Returns `None` when a cycle panicked.
    pub async fn shutdown(self) -> Option<T> {
        self.shutdown_tx.send_replace(true);
        match self.task.await {
            Ok(cycle) => cycle,
            Err(e) => {
                error!("Scheduler task failed: {}", e);
                None
            }
        }
    }
}

fn interval_every(period: Duration, start: Instant) -> Interval {
    let mut interval = tokio::time::interval_at(start, period.max(Duration::from_millis(1)));
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval
}

async fn run<T: ScanCycle>(
    mut cycle: T,
    mut period_rx: watch::Receiver<Duration>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Option<T> {
    let mut interval = interval_every(*period_rx.borrow_and_update(), Instant::now());

    loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.changed() => {
                debug!("Scan scheduler stopping");
                return Some(cycle);
            }
            changed = period_rx.changed() => {
                if changed.is_err() {
                    return Some(cycle);
                }
                let period = *period_rx.borrow_and_update();
                info!("Scan period changed to {:?}", period);
                cycle.set_scan_period(period);
                interval = interval_every(period, Instant::now() + period);
            }
            _ = interval.tick() => {
                let joined = tokio::task::spawn_blocking(move || {
                    let outcome = cycle.run_cycle();
                    (cycle, outcome)
                })
                .await;
                match joined {
                    Ok((returned, outcome)) => {
                        cycle = returned;
                        if let Err(e) = outcome {
                            warn!("Scan cycle failed: {}", e);
                        }
                    }
                    Err(e) => {
                        error!("Scan cycle panicked, scheduler stopped: {}", e);
                        return None;
                    }
                }
            }
        }
    }
}
