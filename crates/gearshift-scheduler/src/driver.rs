use std::sync::Arc;
use std::time::Duration;

use gearshift_core::config::SchedulerConfig;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::service::TaskService;

/// Totals for one driver run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DriverSummary {
    pub iterations: u64,
    /// Iterations that returned an error or left a connection undelivered.
    pub failed: u64,
    pub promoted: u64,
}

/// Runs the promotion cycle on a fixed interval for a bounded number of
/// iterations.
pub struct SchedulerDriver {
    service: Arc<TaskService>,
    poll_interval: Duration,
    max_iterations: u64,
}

impl SchedulerDriver {
    pub fn new(service: Arc<TaskService>, poll_interval: Duration, max_iterations: u64) -> Self {
        Self {
            service,
            poll_interval,
            max_iterations,
        }
    }

    pub fn from_config(service: Arc<TaskService>, config: &SchedulerConfig) -> Self {
        Self::new(
            service,
            Duration::from_secs(config.poll_interval_secs),
            config.max_iterations,
        )
    }

    /// Promote due tasks until `max_iterations` cycles have run or
    /// `shutdown` flips to `true`. A failing cycle is logged and counted;
    /// it never stops the loop.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> DriverSummary {
        info!(
            poll_secs = self.poll_interval.as_secs(),
            max_iterations = self.max_iterations,
            "scheduler driver started"
        );
        let mut summary = DriverSummary::default();

        while summary.iterations < self.max_iterations {
            if *shutdown.borrow() {
                break;
            }
            summary.iterations += 1;

            match self.service.promote_due_tasks().await {
                Ok(report) => {
                    summary.promoted += report.claimed as u64;
                    if !report.is_success() {
                        summary.failed += 1;
                        warn!(iteration = summary.iterations, "promotion left tasks undelivered");
                    }
                }
                Err(e) => {
                    summary.failed += 1;
                    error!(iteration = summary.iterations, code = e.code(), "promotion failed: {e}");
                }
            }

            if summary.iterations == self.max_iterations {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("scheduler driver shutting down");
                        break;
                    }
                }
            }
        }

        info!(
            iterations = summary.iterations,
            failed = summary.failed,
            promoted = summary.promoted,
            "scheduler driver finished"
        );
        summary
    }
}
