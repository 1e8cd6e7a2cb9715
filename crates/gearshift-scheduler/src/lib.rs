//! `gearshift-scheduler`: durable queue for deferred and recurring tasks.
//!
//! # Overview
//!
//! [`service::TaskService`] splits submitted tasks into "dispatch now" and
//! "persist for later". Deferred tasks live in the SQLite
//! `scheduled_tasks` table behind [`store::SchedulerStore`]. Each
//! promotion cycle claims the due ones, dispatches them through the
//! broker, then decays their repeat count: a task with repeats left is
//! written back one interval later, the rest are deleted.
//! [`driver::SchedulerDriver`] runs the cycle on a timer.
//!
//! Claims carry a lease, so several promoters can share one database
//! without dispatching the same task twice.

pub mod db;
pub mod driver;
pub mod service;
pub mod store;

pub use driver::{DriverSummary, SchedulerDriver};
pub use service::{AddReport, PromotionReport, TaskService};
pub use store::{SchedulerStore, SqliteStore};
