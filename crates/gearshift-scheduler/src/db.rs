use gearshift_core::{GearshiftError, Result};
use rusqlite::Connection;

/// Initialise the scheduler schema in `conn`.
///
/// Creates the `scheduled_tasks` table (idempotent) and an index on
/// `start_at` for the due-task query. Timestamps are fixed-width RFC 3339
/// UTC strings, so text order is time order.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS scheduled_tasks (
            id               TEXT    NOT NULL PRIMARY KEY,
            connection_name  TEXT    NOT NULL,
            background       INTEGER NOT NULL,
            priority         TEXT    NOT NULL,   -- low | normal | high
            capability       TEXT    NOT NULL,
            payload          BLOB    NOT NULL,
            context          TEXT,
            start_at         TEXT    NOT NULL,
            repeat_remaining INTEGER NOT NULL,
            repeat_interval  TEXT,               -- ISO-8601 duration or NULL
            claimed_until    TEXT,               -- promoter lease, NULL when free
            created_at       TEXT    NOT NULL,
            updated_at       TEXT    NOT NULL
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_scheduled_tasks_start_at
            ON scheduled_tasks (start_at);
        ",
    )
    .map_err(GearshiftError::storage)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init_db(&conn).unwrap();
        init_db(&conn).unwrap();

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM scheduled_tasks", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }
}
