use std::collections::HashSet;
use std::sync::Arc;

use chrono::Duration;
use gearshift_broker::{BatchReport, ConnectionRegistry, DispatchRouter, JobRegistry, Worker};
use gearshift_core::{Clock, GearshiftConfig, GearshiftError, Result, SystemClock, Task};
use tracing::{info, warn};

use crate::store::{SchedulerStore, SqliteStore};

/// What `add` did with each task.
#[derive(Debug, Default)]
pub struct AddReport {
    /// Ids of tasks written to the store for later promotion.
    pub persisted: Vec<String>,
    pub dispatch: BatchReport,
}

/// Result of one promotion cycle.
#[derive(Debug, Default)]
pub struct PromotionReport {
    /// Due tasks this cycle claimed.
    pub claimed: usize,
    pub dispatch: BatchReport,
    /// Ids written back with one repeat fewer.
    pub rescheduled: Vec<String>,
    /// Ids removed after their last repeat.
    pub deleted: Vec<String>,
    /// Ids whose connection failed; written back unchanged for the next cycle.
    pub retried: Vec<String>,
    /// Ids that no longer validate. They keep their claim until it expires.
    pub rejected: Vec<(String, GearshiftError)>,
}

impl PromotionReport {
    pub fn is_success(&self) -> bool {
        self.dispatch.is_success() && self.rejected.is_empty()
    }
}

/// Entry point for submitting tasks and promoting the ones that come due.
pub struct TaskService {
    config: GearshiftConfig,
    store: Arc<dyn SchedulerStore>,
    router: DispatchRouter,
    jobs: JobRegistry,
    clock: Arc<dyn Clock>,
}

impl TaskService {
    pub fn new(
        config: GearshiftConfig,
        store: Arc<dyn SchedulerStore>,
        router: DispatchRouter,
    ) -> Self {
        Self {
            config,
            store,
            router,
            jobs: JobRegistry::builtin(),
            clock: Arc::new(SystemClock),
        }
    }

    /// Wire a service from configuration alone: SQLite at
    /// `database.path`, Gearman clients for every configured connection.
    pub fn from_config(config: GearshiftConfig) -> Result<Self> {
        let store = SqliteStore::open(&config.database.path, Arc::new(SystemClock))?;
        let router = DispatchRouter::new(Arc::new(ConnectionRegistry::from_config(&config)));
        Ok(Self::new(config, Arc::new(store), router))
    }

    /// Replace the jobs workers can be built with.
    pub fn with_jobs(mut self, jobs: JobRegistry) -> Self {
        self.jobs = jobs;
        self
    }

    /// Use `clock` for the scheduled-or-immediate split. The store keeps
    /// its own clock and should be given the same one.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Persist the scheduled tasks and dispatch the rest.
    ///
    /// Every task is validated first; one bad task rejects the whole call
    /// before anything is written or sent.
    pub async fn add(&self, tasks: Vec<Task>) -> Result<AddReport> {
        for task in &tasks {
            self.router.validate(task)?;
        }

        let now = self.clock.now();
        let (scheduled, immediate): (Vec<Task>, Vec<Task>) =
            tasks.into_iter().partition(|task| task.is_scheduled_at(now));

        if !scheduled.is_empty() {
            self.store.save_all(&scheduled)?;
            for task in &scheduled {
                info!(task_id = %task.id(), start = %task.start(), "task scheduled");
            }
        }
        let dispatch = self.router.dispatch_batch(&immediate).await?;

        Ok(AddReport {
            persisted: scheduled.iter().map(|t| t.id().to_string()).collect(),
            dispatch,
        })
    }

    /// Claim every due task, dispatch them in one batch, then decay each
    /// delivered task once and write it back or delete it. Buffered writes
    /// are flushed once at the end.
    ///
    /// A task that no longer validates is left out of the batch and keeps
    /// its claim until the lease runs out. A task whose connection failed is
    /// written back undecayed with its claim released, so the next cycle
    /// tries it again. Dispatch already issued is never undone: a storage
    /// error after it leaves the claims to expire, and the tasks are
    /// promoted again.
    pub async fn promote_due_tasks(&self) -> Result<PromotionReport> {
        let lease = Duration::seconds(self.config.scheduler.lease_secs as i64);
        let claimed = self.store.claim_due_tasks(lease)?;
        if claimed.is_empty() {
            return Ok(PromotionReport::default());
        }

        let mut report = PromotionReport {
            claimed: claimed.len(),
            ..PromotionReport::default()
        };
        let mut valid = Vec::with_capacity(claimed.len());
        for task in claimed {
            match self.router.validate(&task) {
                Ok(()) => valid.push(task),
                Err(e) => {
                    warn!(task_id = %task.id(), err = %e, "scheduled task cannot be dispatched");
                    report.rejected.push((task.id().to_string(), e));
                }
            }
        }

        report.dispatch = self.router.dispatch_batch(&valid).await?;
        let mut undelivered: HashSet<&str> = HashSet::new();
        for (group, err) in report.dispatch.failures() {
            warn!(
                connection = %group.connection,
                tasks = group.task_ids.len(),
                err = %err,
                "due tasks not delivered, retrying next cycle"
            );
            undelivered.extend(group.task_ids.iter().map(String::as_str));
        }

        let mut retried = Vec::new();
        for task in &mut valid {
            if undelivered.contains(task.id()) {
                self.store.reschedule(task, false)?;
                retried.push(task.id().to_string());
                continue;
            }
            task.decay_once();
            if task.repeat_remaining() < 1 {
                self.store.delete(task, false)?;
                report.deleted.push(task.id().to_string());
            } else {
                self.store.reschedule(task, false)?;
                info!(
                    task_id = %task.id(),
                    remaining = task.repeat_remaining(),
                    next = %task.start(),
                    "task rescheduled"
                );
                report.rescheduled.push(task.id().to_string());
            }
        }
        report.retried = retried;
        self.store.flush()?;

        info!(
            claimed = report.claimed,
            rescheduled = report.rescheduled.len(),
            deleted = report.deleted.len(),
            retried = report.retried.len(),
            rejected = report.rejected.len(),
            "promotion cycle complete"
        );
        Ok(report)
    }

    /// Build the worker named `name` from configuration.
    pub fn get_worker(&self, name: &str) -> Result<Worker> {
        Worker::from_config(&self.config, name, &self.jobs)
    }

    /// Every configured worker, in name order.
    pub fn workers(&self) -> Result<Vec<Worker>> {
        self.config
            .workers
            .keys()
            .map(|name| self.get_worker(name))
            .collect()
    }
}
