use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use gearshift_broker::{
    BrokerClient, BrokerError, ClientFactory, ConnectionRegistry, DispatchOp, DispatchOutcome,
    DispatchRouter, DispatchStatus, JobRequest, TaskBatch,
};
use gearshift_core::config::ConnectionConfig;
use gearshift_core::{GearshiftConfig, ManualClock, Task};
use gearshift_scheduler::{SchedulerDriver, SchedulerStore, SqliteStore, TaskService};
use rusqlite::Connection;
use tokio::sync::watch;

/// Every job the fake broker accepted, as `(connection, unique id)`.
type Sent = Arc<Mutex<Vec<(String, String)>>>;

struct FakeClient {
    name: String,
    sent: Sent,
    down: bool,
}

#[async_trait]
impl BrokerClient for FakeClient {
    fn name(&self) -> &str {
        &self.name
    }

    async fn submit(
        &self,
        op: DispatchOp,
        job: &JobRequest,
    ) -> Result<DispatchOutcome, BrokerError> {
        let mut batch = TaskBatch::new();
        batch.enqueue(op, job.clone());
        let mut outcomes = self.run_tasks(batch).await?;
        outcomes.pop().ok_or(BrokerError::Closed)
    }

    async fn run_tasks(&self, batch: TaskBatch) -> Result<Vec<DispatchOutcome>, BrokerError> {
        if self.down {
            return Err(BrokerError::Unreachable {
                servers: "127.0.0.1:4730".to_string(),
            });
        }
        let mut sent = self.sent.lock().unwrap();
        Ok(batch
            .into_jobs()
            .into_iter()
            .map(|(_, job)| {
                sent.push((self.name.clone(), job.unique_id.clone()));
                DispatchOutcome {
                    handle: format!("H:fake:{}", sent.len()),
                    unique_id: job.unique_id,
                    status: DispatchStatus::Queued,
                }
            })
            .collect())
    }
}

struct FakeFactory {
    sent: Sent,
    down: Vec<&'static str>,
}

impl ClientFactory for FakeFactory {
    fn create(&self, name: &str, _config: &ConnectionConfig) -> Arc<dyn BrokerClient> {
        Arc::new(FakeClient {
            name: name.to_string(),
            sent: Arc::clone(&self.sent),
            down: self.down.iter().any(|d| *d == name),
        })
    }
}

struct Harness {
    service: Arc<TaskService>,
    store: Arc<SqliteStore>,
    clock: Arc<ManualClock>,
    sent: Sent,
}

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 6, 1, 12, 0, 0).unwrap()
}

fn harness_with(conn: Connection, down: Vec<&'static str>) -> Harness {
    let clock = Arc::new(ManualClock::new(t0()));
    let store = Arc::new(SqliteStore::with_clock(conn, clock.clone()).unwrap());
    let sent: Sent = Arc::default();

    let mut config = GearshiftConfig::default();
    config
        .connections
        .insert("reports".to_string(), ConnectionConfig::default());
    let registry = ConnectionRegistry::with_factory(
        config.connections.clone(),
        FakeFactory {
            sent: Arc::clone(&sent),
            down,
        },
    );
    let service = TaskService::new(
        config,
        store.clone(),
        DispatchRouter::new(Arc::new(registry)),
    )
    .with_clock(clock.clone());

    Harness {
        service: Arc::new(service),
        store,
        clock,
        sent,
    }
}

fn harness() -> Harness {
    harness_with(Connection::open_in_memory().unwrap(), Vec::new())
}

fn sent_ids(sent: &Sent) -> Vec<String> {
    sent.lock().unwrap().iter().map(|(_, id)| id.clone()).collect()
}

#[tokio::test]
async fn immediate_task_is_dispatched_and_not_persisted() {
    let h = harness();
    let mut task = Task::new("job.x");
    task.set_id("a1").set_start(t0());

    let report = h.service.add(vec![task]).await.unwrap();

    assert!(report.persisted.is_empty());
    assert_eq!(report.dispatch.dispatched(), 1);
    assert_eq!(sent_ids(&h.sent), vec!["a1"]);
    assert!(h.store.find_by_id("a1").unwrap().is_none());
}

#[tokio::test]
async fn future_task_is_persisted_until_due() {
    let h = harness();
    let mut task = Task::new("job.x");
    task.set_id("b1").set_start(t0() + Duration::days(2));

    let report = h.service.add(vec![task]).await.unwrap();
    assert_eq!(report.persisted, vec!["b1"]);
    assert!(sent_ids(&h.sent).is_empty());
    assert!(h.store.get_due_tasks().unwrap().is_empty());

    h.clock.advance(Duration::days(2));
    let due = h.store.get_due_tasks().unwrap();
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].id(), "b1");

    let report = h.service.promote_due_tasks().await.unwrap();
    assert_eq!(report.claimed, 1);
    assert_eq!(report.deleted, vec!["b1"]);
    assert_eq!(sent_ids(&h.sent), vec!["b1"]);
    assert!(h.store.find_by_id("b1").unwrap().is_none());
}

#[tokio::test]
async fn recurring_task_runs_twice_then_is_deleted() {
    let h = harness();
    let start = t0() - Duration::seconds(1);
    let mut task = Task::new("job.x");
    task.set_id("c1").set_start(start).set_repeat(2, "P1D").unwrap();

    let report = h.service.add(vec![task]).await.unwrap();
    assert_eq!(report.persisted, vec!["c1"]);
    assert!(sent_ids(&h.sent).is_empty());

    let first = h.service.promote_due_tasks().await.unwrap();
    assert_eq!(first.rescheduled, vec!["c1"]);
    assert_eq!(sent_ids(&h.sent), vec!["c1"]);

    let stored = h.store.find_by_id("c1").unwrap().unwrap();
    assert_eq!(stored.repeat_remaining(), 1);
    assert_eq!(stored.start(), t0() + Duration::days(1) - Duration::seconds(1));
    assert!(stored.is_background());

    // Not due again until a day has passed.
    let idle = h.service.promote_due_tasks().await.unwrap();
    assert_eq!(idle.claimed, 0);

    h.clock.advance(Duration::days(1));
    let second = h.service.promote_due_tasks().await.unwrap();
    assert_eq!(second.deleted, vec!["c1"]);
    assert_eq!(sent_ids(&h.sent), vec!["c1", "c1"]);
    assert!(h.store.find_by_id("c1").unwrap().is_none());
}

#[tokio::test]
async fn add_splits_a_mixed_batch() {
    let h = harness();
    let mut now = Task::new("job.x");
    now.set_id("now").set_start(t0());
    let mut later = Task::new("job.x");
    later.set_id("later").set_start(t0() + Duration::hours(1));
    let mut elsewhere = Task::new("job.y");
    elsewhere.set_id("elsewhere").set_connection_name("reports").set_start(t0());

    let report = h.service.add(vec![now, later, elsewhere]).await.unwrap();

    assert_eq!(report.persisted, vec!["later"]);
    assert_eq!(report.dispatch.groups.len(), 2);
    assert_eq!(
        *h.sent.lock().unwrap(),
        vec![
            ("default".to_string(), "now".to_string()),
            ("reports".to_string(), "elsewhere".to_string())
        ]
    );
}

#[tokio::test]
async fn invalid_task_rejects_the_whole_add() {
    let h = harness();
    let mut later = Task::new("job.x");
    later.set_id("later").set_start(t0() + Duration::days(1));
    let mut lost = Task::new("job.x");
    lost.set_id("lost").set_connection_name("nowhere");

    let err = h.service.add(vec![later, lost]).await.unwrap_err();
    assert_eq!(err.code(), "CONFIG_ERROR");
    assert!(h.store.find_by_id("later").unwrap().is_none());
    assert!(sent_ids(&h.sent).is_empty());
}

#[tokio::test]
async fn undelivered_connection_is_reported_and_other_tasks_still_promote() {
    let h = harness_with(Connection::open_in_memory().unwrap(), vec!["reports"]);
    let mut a = Task::new("job.x");
    a.set_id("a").set_start(t0() + Duration::hours(1));
    let mut b = Task::new("job.y");
    b.set_id("b")
        .set_connection_name("reports")
        .set_start(t0() + Duration::hours(1));
    h.service.add(vec![a, b]).await.unwrap();

    h.clock.advance(Duration::hours(2));
    let report = h.service.promote_due_tasks().await.unwrap();

    assert!(!report.is_success());
    assert_eq!(report.claimed, 2);
    assert_eq!(sent_ids(&h.sent), vec!["a"]);
    let failures: Vec<_> = report
        .dispatch
        .failures()
        .map(|(group, _)| group.connection.clone())
        .collect();
    assert_eq!(failures, vec!["reports"]);

    assert_eq!(report.deleted, vec!["a"]);
    assert_eq!(report.retried, vec!["b"]);
    assert!(h.store.find_by_id("a").unwrap().is_none());
    let kept = h.store.find_by_id("b").unwrap().unwrap();
    assert_eq!(kept.repeat_remaining(), 1);
    assert_eq!(kept.start(), t0() + Duration::hours(1));
}

#[tokio::test]
async fn undelivered_tasks_keep_their_repeats_and_are_retried() {
    let h = harness_with(Connection::open_in_memory().unwrap(), vec!["default"]);
    let mut once = Task::new("job.x");
    once.set_id("once").set_start(t0() + Duration::hours(1));
    let mut daily = Task::new("job.x");
    daily
        .set_id("daily")
        .set_start(t0() + Duration::hours(1))
        .set_repeat(3, "P1D")
        .unwrap();
    h.service.add(vec![once, daily]).await.unwrap();

    h.clock.advance(Duration::hours(2));
    let first = h.service.promote_due_tasks().await.unwrap();
    assert!(sent_ids(&h.sent).is_empty());
    assert!(first.deleted.is_empty());
    assert!(first.rescheduled.is_empty());
    assert_eq!(first.retried, vec!["daily", "once"]);

    assert!(h.store.find_by_id("once").unwrap().is_some());
    let daily = h.store.find_by_id("daily").unwrap().unwrap();
    assert_eq!(daily.repeat_remaining(), 3);
    assert_eq!(daily.start(), t0() + Duration::hours(1));

    // Claims were released, so the next cycle picks them up straight away.
    let second = h.service.promote_due_tasks().await.unwrap();
    assert_eq!(second.claimed, 2);
}

#[tokio::test]
async fn task_with_a_removed_connection_does_not_block_the_others() {
    let h = harness();
    let mut stale = Task::new("job.x");
    stale
        .set_id("stale")
        .set_connection_name("reports")
        .set_start(t0() + Duration::hours(1));
    let mut good = Task::new("job.x");
    good.set_id("good").set_start(t0() + Duration::hours(2));
    h.service.add(vec![stale, good]).await.unwrap();

    // Same database, but "reports" has since been dropped from configuration.
    let config = GearshiftConfig::default();
    let registry = ConnectionRegistry::with_factory(
        config.connections.clone(),
        FakeFactory {
            sent: Arc::clone(&h.sent),
            down: Vec::new(),
        },
    );
    let service = TaskService::new(
        config,
        h.store.clone(),
        DispatchRouter::new(Arc::new(registry)),
    )
    .with_clock(h.clock.clone());

    h.clock.advance(Duration::hours(3));
    let report = service.promote_due_tasks().await.unwrap();

    assert!(!report.is_success());
    assert_eq!(report.claimed, 2);
    assert_eq!(sent_ids(&h.sent), vec!["good"]);
    assert_eq!(report.deleted, vec!["good"]);
    let rejected: Vec<_> = report.rejected.iter().map(|(id, _)| id.as_str()).collect();
    assert_eq!(rejected, vec!["stale"]);
    assert_eq!(report.rejected[0].1.code(), "CONFIG_ERROR");

    // The stale row stays put under its claim; nothing is lost.
    assert!(h.store.find_by_id("stale").unwrap().is_some());
    assert_eq!(service.promote_due_tasks().await.unwrap().claimed, 0);
}

#[tokio::test]
async fn concurrent_promoters_claim_disjoint_sets() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("gearshift.db");

    let first = harness_with(Connection::open(&path).unwrap(), Vec::new());
    let tasks: Vec<Task> = (0..20)
        .map(|i| {
            let mut task = Task::new("job.x");
            task.set_id(format!("t{i:02}"))
                .set_start(t0() + Duration::minutes(i + 1));
            task
        })
        .collect();
    first.service.add(tasks).await.unwrap();
    first.clock.advance(Duration::hours(1));

    let second = harness_with(Connection::open(&path).unwrap(), Vec::new());
    second.clock.advance(Duration::hours(1));

    let (a, b) = tokio::join!(
        tokio::task::spawn_blocking({
            let store = first.store.clone();
            move || store.claim_due_tasks(Duration::minutes(5))
        }),
        tokio::task::spawn_blocking({
            let store = second.store.clone();
            move || store.claim_due_tasks(Duration::minutes(5))
        }),
    );
    let a = a.unwrap().unwrap();
    let b = b.unwrap().unwrap();

    let mut ids: Vec<_> = a.iter().chain(b.iter()).map(|t| t.id().to_string()).collect();
    assert_eq!(ids.len(), 20);
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 20);
}

#[tokio::test]
async fn driver_runs_bounded_iterations() {
    let h = harness();
    let mut task = Task::new("job.x");
    task.set_id("d1")
        .set_start(t0() - Duration::seconds(1))
        .set_repeat(5, "PT1M")
        .unwrap();
    h.service.add(vec![task]).await.unwrap();

    let driver = SchedulerDriver::new(h.service.clone(), StdDuration::ZERO, 3);
    let (_tx, shutdown) = watch::channel(false);
    let summary = driver.run(shutdown).await;

    assert_eq!(summary.iterations, 3);
    assert_eq!(summary.failed, 0);
    // The manual clock never moves, so only the first cycle finds it due.
    assert_eq!(summary.promoted, 1);
    assert_eq!(h.store.find_by_id("d1").unwrap().unwrap().repeat_remaining(), 4);
}

#[tokio::test]
async fn driver_counts_failed_iterations_and_keeps_going() {
    let h = harness_with(Connection::open_in_memory().unwrap(), vec!["default"]);
    let mut task = Task::new("job.x");
    task.set_id("e1").set_start(t0() + Duration::seconds(1));
    h.service.add(vec![task]).await.unwrap();
    h.clock.advance(Duration::seconds(2));

    let driver = SchedulerDriver::new(h.service.clone(), StdDuration::ZERO, 2);
    let (_tx, shutdown) = watch::channel(false);
    let summary = driver.run(shutdown).await;

    // The undelivered task is written back unclaimed and fails again.
    assert_eq!(summary.iterations, 2);
    assert_eq!(summary.failed, 2);
    assert_eq!(summary.promoted, 2);
    assert!(h.store.find_by_id("e1").unwrap().is_some());
}

#[tokio::test]
async fn driver_stops_on_shutdown() {
    let h = harness();
    let driver = SchedulerDriver::new(h.service.clone(), StdDuration::from_secs(3600), 10);
    let (tx, shutdown) = watch::channel(false);

    let handle = tokio::spawn(async move { driver.run(shutdown).await });
    tokio::time::sleep(StdDuration::from_millis(50)).await;
    tx.send(true).unwrap();

    let summary = handle.await.unwrap();
    assert_eq!(summary.iterations, 1);
}

#[tokio::test]
async fn get_worker_reports_configuration_problems() {
    let h = harness();
    let err = h.service.get_worker("ghost").unwrap_err();
    assert_eq!(err.to_string(), "Configuration error: Worker 'ghost' is not configured");
    assert!(h.service.workers().unwrap().is_empty());
}
