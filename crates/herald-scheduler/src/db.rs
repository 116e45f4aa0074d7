use std::path::Path;

use rusqlite::Connection;

use crate::error::Result;

/// Initialise the job schema in `conn`.
///
/// Creates the `jobs` table (idempotent), the `deleted_jobs` tombstones that
/// stop ids from being reused, the indexes the due-job query relies on, and
/// the `channel_settings` switches.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS jobs (
            id            TEXT    NOT NULL PRIMARY KEY,
            channel       TEXT    NOT NULL,
            trigger_rule  TEXT    NOT NULL,   -- JSON-encoded Trigger enum
            trigger_time  TEXT    NOT NULL,   -- fixed-width RFC 3339 UTC
            payload       TEXT    NOT NULL,   -- opaque JSON
            state         TEXT    NOT NULL,
            attempt       INTEGER NOT NULL DEFAULT 0,
            max_attempts  INTEGER NOT NULL,
            version       INTEGER NOT NULL,
            unique_key    TEXT,
            run_count     INTEGER NOT NULL DEFAULT 0,
            last_error    TEXT,
            created_at    TEXT    NOT NULL,
            updated_at    TEXT    NOT NULL,
            finished_at   TEXT
        ) STRICT;

        -- Due-job polling: WHERE state = 'pending' AND trigger_time <= ? ORDER BY trigger_time, id
        CREATE INDEX IF NOT EXISTS idx_jobs_due ON jobs (state, trigger_time, id);

        CREATE INDEX IF NOT EXISTS idx_jobs_channel ON jobs (channel, state);

        -- At most one live job per unique key.
        CREATE UNIQUE INDEX IF NOT EXISTS idx_jobs_unique_live ON jobs (unique_key)
            WHERE unique_key IS NOT NULL AND state IN ('pending', 'firing');

        CREATE TABLE IF NOT EXISTS deleted_jobs (
            id  TEXT NOT NULL PRIMARY KEY
        ) STRICT, WITHOUT ROWID;

        -- Per-channel on/off switch. No row means enabled.
        CREATE TABLE IF NOT EXISTS channel_settings (
            channel  TEXT    NOT NULL PRIMARY KEY,
            enabled  INTEGER NOT NULL
        ) STRICT, WITHOUT ROWID;
        ",
    )?;
    Ok(())
}

/// Open (or create) the database file and prepare it for durable writes.
///
/// WAL with `synchronous=FULL` makes every committed statement survive a
/// crash. `busy_timeout` lets the CLI and a running daemon share the file.
pub fn open(path: impl AsRef<Path>) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.execute_batch(
        "PRAGMA journal_mode=WAL;
         PRAGMA synchronous=FULL;
         PRAGMA busy_timeout=5000;",
    )?;
    init_db(&conn)?;
    Ok(conn)
}

/// In-memory database with the schema applied. Nothing survives a drop.
pub fn open_in_memory() -> Result<Connection> {
    let conn = Connection::open_in_memory()?;
    init_db(&conn)?;
    Ok(conn)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        let conn = open_in_memory().unwrap();
        init_db(&conn).unwrap();
        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master
                 WHERE type = 'table' AND name IN ('jobs', 'deleted_jobs', 'channel_settings')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 3);
    }
}
