use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;

use crate::error::Result;

/// Initialise the sensor schema in `conn`.
///
/// Safe to call on every startup; every statement is `IF NOT EXISTS`.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS sensor_cursors (
            sensor_id   TEXT    NOT NULL PRIMARY KEY,   -- location/name
            cursor      TEXT    NOT NULL,
            updated_at  TEXT    NOT NULL
        ) STRICT;

        CREATE TABLE IF NOT EXISTS sensor_ticks (
            id              TEXT    NOT NULL PRIMARY KEY,   -- UUID v7
            sensor_id       TEXT    NOT NULL,
            started_at      TEXT    NOT NULL,
            ended_at        TEXT    NOT NULL,
            status          TEXT    NOT NULL,
            dispatched      TEXT    NOT NULL,   -- JSON array of DispatchedRun
            suppressed_keys TEXT    NOT NULL,   -- JSON array of strings
            skip_reason     TEXT,
            error           TEXT,
            cursor          TEXT,
            origin_run_id   TEXT
        ) STRICT;

        -- last_tick and range queries: WHERE sensor_id = ? ORDER BY ended_at DESC
        CREATE INDEX IF NOT EXISTS idx_sensor_ticks_sensor_ended
            ON sensor_ticks (sensor_id, ended_at);

        -- Seen-key index for run-request deduplication. run_id stays NULL while
        -- the dispatch is in flight and after a permanent rejection.
        CREATE TABLE IF NOT EXISTS sensor_run_keys (
            sensor_id   TEXT    NOT NULL,
            run_key     TEXT    NOT NULL,
            run_id      TEXT,
            fingerprint TEXT    NOT NULL,
            tick_id     TEXT    NOT NULL,
            admitted_at TEXT    NOT NULL,
            PRIMARY KEY (sensor_id, run_key)
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_sensor_run_keys_admitted
            ON sensor_run_keys (admitted_at);

        CREATE TABLE IF NOT EXISTS sensor_states (
            sensor_id   TEXT    NOT NULL PRIMARY KEY,
            status      TEXT    NOT NULL,   -- running | stopped
            updated_at  TEXT    NOT NULL
        ) STRICT;

        CREATE TABLE IF NOT EXISTS run_status_watermarks (
            sensor_id   TEXT    NOT NULL PRIMARY KEY,
            event_id    INTEGER NOT NULL,
            updated_at  TEXT    NOT NULL
        ) STRICT;

        CREATE TABLE IF NOT EXISTS daemon_leases (
            name        TEXT    NOT NULL PRIMARY KEY,
            holder      TEXT    NOT NULL,
            expires_at  TEXT    NOT NULL
        ) STRICT;
        ",
    )?;
    Ok(())
}

/// Fixed-width RFC 3339 so stored timestamps order lexicographically.
pub(crate) fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        let conn = Connection::open_in_memory().expect("open");
        init_db(&conn).expect("first");
        init_db(&conn).expect("second");
    }

    #[test]
    fn timestamps_sort_as_strings() {
        let early = DateTime::parse_from_rfc3339("2026-01-01T00:00:09Z")
            .unwrap()
            .with_timezone(&Utc);
        let late = early + chrono::Duration::milliseconds(1500);
        assert!(ts(early) < ts(late));
        assert_eq!(parse_ts(&ts(late)).unwrap(), late);
    }
}
