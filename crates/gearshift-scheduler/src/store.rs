use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use gearshift_core::{Clock, GearshiftError, Priority, RepeatInterval, Result, SystemClock, Task};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use tracing::{debug, info};

use crate::db::init_db;

/// Durable queue of deferred and recurring tasks.
///
/// Writes made with `flush = false` are buffered and reach the database
/// together, in one transaction, at the next flushing call. Reads only ever
/// see what has been committed.
pub trait SchedulerStore: Send + Sync {
    /// Persist a scheduled task. A task that would run right away is
    /// rejected without touching the database.
    fn save<'a>(&self, task: &'a Task, flush: bool) -> Result<&'a Task>;

    fn delete(&self, task: &Task, flush: bool) -> Result<()>;

    fn find_by_id(&self, id: &str) -> Result<Option<Task>>;

    /// Every task whose start has arrived, earliest first.
    fn get_due_tasks(&self) -> Result<Vec<Task>>;

    /// Save each task, flushing once after the last.
    fn save_all(&self, tasks: &[Task]) -> Result<()> {
        let last = tasks.len().saturating_sub(1);
        for (i, task) in tasks.iter().enumerate() {
            self.save(task, i == last)?;
        }
        Ok(())
    }

    /// Rewrite a persisted task after a promotion, without the scheduled
    /// check `save` applies, and release its claim.
    fn reschedule(&self, task: &Task, flush: bool) -> Result<()>;

    /// Atomically claim every due task that nobody holds a live claim on,
    /// until `now + lease`. Concurrent callers get disjoint sets.
    fn claim_due_tasks(&self, lease: Duration) -> Result<Vec<Task>>;

    /// Commit buffered writes.
    fn flush(&self) -> Result<()>;
}

enum PendingWrite {
    Upsert(Task),
    Delete(String),
}

struct Inner {
    conn: Connection,
    pending: Vec<PendingWrite>,
}

/// [`SchedulerStore`] over a SQLite `scheduled_tasks` table.
pub struct SqliteStore {
    inner: Mutex<Inner>,
    clock: Arc<dyn Clock>,
}

const COLUMNS: &str = "id, connection_name, background, priority, capability, payload, \
                       context, start_at, repeat_remaining, repeat_interval";

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn conversion_error(index: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(index, Type::Text, message.into())
}

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<Task> {
    let priority: String = row.get(3)?;
    let priority: Priority = priority.parse().map_err(|e| conversion_error(3, e))?;

    let start: String = row.get(7)?;
    let start = DateTime::parse_from_rfc3339(&start)
        .map_err(|e| conversion_error(7, e.to_string()))?;

    let interval = row
        .get::<_, Option<String>>(9)?
        .map(|text| text.parse::<RepeatInterval>())
        .transpose()
        .map_err(|e| conversion_error(9, e))?;

    let mut task = Task::new(row.get::<_, String>(4)?);
    task.set_id(row.get::<_, String>(0)?)
        .set_connection_name(row.get::<_, String>(1)?)
        .set_background(row.get(2)?)
        .set_priority(priority)
        .set_payload(row.get::<_, Vec<u8>>(5)?)
        .set_start(start)
        .restore_repeat(row.get(8)?, interval);
    if let Some(context) = row.get::<_, Option<String>>(6)? {
        task.set_context(context);
    }
    Ok(task)
}

fn upsert(conn: &Connection, task: &Task, now: &str) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO scheduled_tasks
         (id, connection_name, background, priority, capability, payload, context,
          start_at, repeat_remaining, repeat_interval, claimed_until, created_at, updated_at)
         VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,NULL,?11,?11)
         ON CONFLICT(id) DO UPDATE SET
            connection_name  = excluded.connection_name,
            background       = excluded.background,
            priority         = excluded.priority,
            capability       = excluded.capability,
            payload          = excluded.payload,
            context          = excluded.context,
            start_at         = excluded.start_at,
            repeat_remaining = excluded.repeat_remaining,
            repeat_interval  = excluded.repeat_interval,
            claimed_until    = NULL,
            updated_at       = excluded.updated_at",
        params![
            task.id(),
            task.connection_name(),
            task.is_background(),
            task.priority().to_string(),
            task.capability(),
            task.payload(),
            task.context(),
            timestamp(task.start()),
            task.repeat_remaining(),
            task.repeat_interval().map(RepeatInterval::as_str),
            now,
        ],
    )?;
    Ok(())
}

impl SqliteStore {
    /// Wrap an open connection, initialising the schema if needed.
    pub fn new(conn: Connection) -> Result<Self> {
        Self::with_clock(conn, Arc::new(SystemClock))
    }

    pub fn with_clock(conn: Connection, clock: Arc<dyn Clock>) -> Result<Self> {
        init_db(&conn)?;
        // Several promoters may share one database file.
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .map_err(GearshiftError::storage)?;
        Ok(Self {
            inner: Mutex::new(Inner {
                conn,
                pending: Vec::new(),
            }),
            clock,
        })
    }

    /// Open (or create) the database file at `path`.
    pub fn open(path: impl AsRef<Path>, clock: Arc<dyn Clock>) -> Result<Self> {
        let conn = Connection::open(path).map_err(GearshiftError::storage)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")
            .map_err(GearshiftError::storage)?;
        Self::with_clock(conn, clock)
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(&self, write: PendingWrite, flush: bool) -> Result<()> {
        let mut inner = self.lock();
        inner.pending.push(write);
        if flush {
            self.commit(&mut inner)?;
        }
        Ok(())
    }

    /// Apply the buffer in one transaction. The buffer is emptied whether or
    /// not the commit succeeds.
    fn commit(&self, inner: &mut Inner) -> Result<()> {
        if inner.pending.is_empty() {
            return Ok(());
        }
        let pending = std::mem::take(&mut inner.pending);
        let now = timestamp(self.clock.now());

        let tx = inner.conn.transaction().map_err(GearshiftError::storage)?;
        for write in &pending {
            let applied = match write {
                PendingWrite::Upsert(task) => upsert(&tx, task, &now),
                PendingWrite::Delete(id) => tx
                    .execute("DELETE FROM scheduled_tasks WHERE id = ?1", [id])
                    .map(|_| ()),
            };
            applied.map_err(GearshiftError::storage)?;
        }
        tx.commit().map_err(GearshiftError::storage)?;
        debug!(writes = pending.len(), "scheduler store flushed");
        Ok(())
    }
}

impl SchedulerStore for SqliteStore {
    fn save<'a>(&self, task: &'a Task, flush: bool) -> Result<&'a Task> {
        if !task.is_scheduled_at(self.clock.now()) {
            return Err(GearshiftError::domain("This is not a scheduled task!"));
        }
        self.push(PendingWrite::Upsert(task.clone()), flush)?;
        Ok(task)
    }

    /// All or nothing: every task is checked before any is buffered.
    fn save_all(&self, tasks: &[Task]) -> Result<()> {
        let now = self.clock.now();
        if tasks.iter().any(|task| !task.is_scheduled_at(now)) {
            return Err(GearshiftError::domain("This is not a scheduled task!"));
        }
        let mut inner = self.lock();
        inner
            .pending
            .extend(tasks.iter().cloned().map(PendingWrite::Upsert));
        self.commit(&mut inner)
    }

    fn delete(&self, task: &Task, flush: bool) -> Result<()> {
        self.push(PendingWrite::Delete(task.id().to_string()), flush)
    }

    fn find_by_id(&self, id: &str) -> Result<Option<Task>> {
        let inner = self.lock();
        inner
            .conn
            .query_row(
                &format!("SELECT {COLUMNS} FROM scheduled_tasks WHERE id = ?1"),
                [id],
                task_from_row,
            )
            .optional()
            .map_err(GearshiftError::storage)
    }

    fn get_due_tasks(&self) -> Result<Vec<Task>> {
        let now = timestamp(self.clock.now());
        let inner = self.lock();
        let mut stmt = inner
            .conn
            .prepare_cached(&format!(
                "SELECT {COLUMNS} FROM scheduled_tasks
                 WHERE start_at <= ?1 ORDER BY start_at, id"
            ))
            .map_err(GearshiftError::storage)?;
        let tasks = stmt
            .query_map([&now], task_from_row)
            .and_then(|rows| rows.collect::<rusqlite::Result<Vec<_>>>())
            .map_err(GearshiftError::storage)?;
        Ok(tasks)
    }

    fn reschedule(&self, task: &Task, flush: bool) -> Result<()> {
        self.push(PendingWrite::Upsert(task.clone()), flush)
    }

    fn claim_due_tasks(&self, lease: Duration) -> Result<Vec<Task>> {
        let now = self.clock.now();
        let now_str = timestamp(now);
        let until = timestamp(now + lease);

        let mut inner = self.lock();
        let tx = inner
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(GearshiftError::storage)?;

        // Collect first so the statement is dropped before the updates.
        let candidates: Vec<(Task, Option<String>)> = {
            let mut stmt = tx
                .prepare_cached(&format!(
                    "SELECT {COLUMNS}, claimed_until FROM scheduled_tasks
                     WHERE start_at <= ?1
                       AND (claimed_until IS NULL OR claimed_until <= ?1)
                     ORDER BY start_at, id"
                ))
                .map_err(GearshiftError::storage)?;
            let rows = stmt
                .query_map([&now_str], |row| {
                    Ok((task_from_row(row)?, row.get::<_, Option<String>>(10)?))
                })
                .and_then(|rows| rows.collect::<rusqlite::Result<Vec<_>>>())
                .map_err(GearshiftError::storage)?;
            rows
        };

        let mut claimed = Vec::with_capacity(candidates.len());
        for (task, previous) in candidates {
            let changed = tx
                .execute(
                    "UPDATE scheduled_tasks SET claimed_until = ?1, updated_at = ?2
                     WHERE id = ?3 AND claimed_until IS ?4",
                    params![until, now_str, task.id(), previous],
                )
                .map_err(GearshiftError::storage)?;
            if changed == 1 {
                claimed.push(task);
            }
        }
        tx.commit().map_err(GearshiftError::storage)?;

        if !claimed.is_empty() {
            info!(count = claimed.len(), until = %until, "due tasks claimed");
        }
        Ok(claimed)
    }

    fn flush(&self) -> Result<()> {
        let mut inner = self.lock();
        self.commit(&mut inner)
    }
}
