use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, instrument};

use crate::db::{init_db, parse_ts, ts};
use crate::error::Result;
use crate::types::{SensorId, SensorStatus, TickRecord, TickStatus};

/// Durable per-sensor cursor. Atomic per key.
pub trait CursorStore: Send + Sync {
    fn cursor(&self, id: &SensorId) -> Result<Option<String>>;

    /// Unconditional write; `None` clears the cursor.
    fn set_cursor(&self, id: &SensorId, cursor: Option<&str>) -> Result<()>;

    /// Write `new` only if the stored cursor still equals `expected`.
    fn compare_and_set_cursor(
        &self,
        id: &SensorId,
        expected: Option<&str>,
        new: &str,
    ) -> Result<bool>;
}

/// Filter for tick history queries. Results are newest first.
#[derive(Debug, Clone, Default)]
pub struct TickQuery {
    /// Inclusive lower bound on `ended_at`.
    pub after: Option<DateTime<Utc>>,
    /// Exclusive upper bound on `ended_at`.
    pub before: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl TickQuery {
    pub fn latest(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..Self::default()
        }
    }

    pub fn between(after: DateTime<Utc>, before: DateTime<Utc>) -> Self {
        Self {
            after: Some(after),
            before: Some(before),
            limit: None,
        }
    }
}

/// Append-only tick history.
pub trait TickStore: Send + Sync {
    fn append_tick(&self, tick: &TickRecord) -> Result<()>;
    fn last_tick(&self, id: &SensorId) -> Result<Option<TickRecord>>;
    fn ticks(&self, id: &SensorId, query: &TickQuery) -> Result<Vec<TickRecord>>;
    fn purge_ticks_before(&self, cutoff: DateTime<Utc>) -> Result<usize>;
}

/// One entry of the seen-key index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunKeyEntry {
    pub run_key: String,
    pub run_id: Option<String>,
    pub fingerprint: String,
    pub tick_id: String,
    pub admitted_at: DateTime<Utc>,
}

/// Persisted seen-key set backing the deduplicator.
pub trait RunKeyIndex: Send + Sync {
    /// Atomically claim `key`. Returns `None` when this call claimed it,
    /// or the existing entry when it was already taken.
    fn claim_run_key(
        &self,
        id: &SensorId,
        key: &str,
        fingerprint: &str,
        tick_id: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<RunKeyEntry>>;

    fn confirm_run_key(&self, id: &SensorId, key: &str, run_id: &str) -> Result<()>;

    /// Forget a claim so a later tick may dispatch the key again.
    fn release_run_key(&self, id: &SensorId, key: &str) -> Result<()>;

    fn lookup_run_key(&self, id: &SensorId, key: &str) -> Result<Option<RunKeyEntry>>;

    fn purge_run_keys_before(&self, cutoff: DateTime<Utc>) -> Result<usize>;
}

/// Start/stop overrides set by operators.
pub trait SensorStateStore: Send + Sync {
    fn sensor_status(&self, id: &SensorId) -> Result<Option<SensorStatus>>;
    fn set_sensor_status(&self, id: &SensorId, status: SensorStatus) -> Result<()>;
}

/// Highest run-status event id each run-status sensor has processed.
pub trait WatermarkStore: Send + Sync {
    fn watermark(&self, id: &SensorId) -> Result<Option<i64>>;
    /// Never moves backwards.
    fn advance_watermark(&self, id: &SensorId, event_id: i64) -> Result<()>;
}

/// Everything the tick pipeline persists.
pub trait SensorStore:
    CursorStore + TickStore + RunKeyIndex + SensorStateStore + WatermarkStore
{
}

impl<T> SensorStore for T where
    T: CursorStore + TickStore + RunKeyIndex + SensorStateStore + WatermarkStore
{
}

/// SQLite-backed [`SensorStore`].
///
/// Wraps a single connection in a `Mutex`; every trait method is one
/// statement or one transaction, which is what makes claim and CAS atomic.
pub struct SqliteSensorStore {
    db: Mutex<Connection>,
}

impl SqliteSensorStore {
    /// Wrap a connection, initialising the schema if needed.
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.db.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl CursorStore for SqliteSensorStore {
    fn cursor(&self, id: &SensorId) -> Result<Option<String>> {
        let db = self.conn();
        let cursor = db
            .query_row(
                "SELECT cursor FROM sensor_cursors WHERE sensor_id = ?1",
                [id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(cursor)
    }

    #[instrument(skip(self, cursor), fields(sensor = %id))]
    fn set_cursor(&self, id: &SensorId, cursor: Option<&str>) -> Result<()> {
        let db = self.conn();
        match cursor {
            Some(cursor) => {
                db.execute(
                    "INSERT INTO sensor_cursors (sensor_id, cursor, updated_at)
                     VALUES (?1, ?2, ?3)
                     ON CONFLICT(sensor_id) DO UPDATE
                     SET cursor = excluded.cursor, updated_at = excluded.updated_at",
                    params![id.to_string(), cursor, ts(Utc::now())],
                )?;
            }
            None => {
                db.execute(
                    "DELETE FROM sensor_cursors WHERE sensor_id = ?1",
                    [id.to_string()],
                )?;
            }
        }
        debug!("cursor written");
        Ok(())
    }

    fn compare_and_set_cursor(
        &self,
        id: &SensorId,
        expected: Option<&str>,
        new: &str,
    ) -> Result<bool> {
        let db = self.conn();
        let now = ts(Utc::now());
        let changed = match expected {
            Some(expected) => db.execute(
                "UPDATE sensor_cursors SET cursor = ?1, updated_at = ?2
                 WHERE sensor_id = ?3 AND cursor = ?4",
                params![new, now, id.to_string(), expected],
            )?,
            None => db.execute(
                "INSERT OR IGNORE INTO sensor_cursors (sensor_id, cursor, updated_at)
                 VALUES (?1, ?2, ?3)",
                params![id.to_string(), new, now],
            )?,
        };
        Ok(changed == 1)
    }
}

const TICK_COLUMNS: &str = "id, sensor_id, started_at, ended_at, status, dispatched,
     suppressed_keys, skip_reason, error, cursor, origin_run_id";

impl TickStore for SqliteSensorStore {
    #[instrument(skip(self, tick), fields(sensor = %tick.sensor_id, tick_id = %tick.id))]
    fn append_tick(&self, tick: &TickRecord) -> Result<()> {
        let dispatched = serde_json::to_string(&tick.dispatched)?;
        let suppressed = serde_json::to_string(&tick.suppressed_keys)?;
        let db = self.conn();
        db.execute(
            "INSERT INTO sensor_ticks
             (id, sensor_id, started_at, ended_at, status, dispatched,
              suppressed_keys, skip_reason, error, cursor, origin_run_id)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11)",
            params![
                tick.id,
                tick.sensor_id.to_string(),
                ts(tick.started_at),
                ts(tick.ended_at),
                tick.status.to_string(),
                dispatched,
                suppressed,
                tick.skip_reason,
                tick.error,
                tick.cursor,
                tick.origin_run_id,
            ],
        )?;
        Ok(())
    }

    fn last_tick(&self, id: &SensorId) -> Result<Option<TickRecord>> {
        Ok(self.ticks(id, &TickQuery::latest(1))?.into_iter().next())
    }

    fn ticks(&self, id: &SensorId, query: &TickQuery) -> Result<Vec<TickRecord>> {
        let db = self.conn();
        let after = query.after.map(ts);
        let before = query.before.map(ts);
        // SQLite treats a negative LIMIT as unbounded.
        let limit = query.limit.map_or(-1, |l| l as i64);
        let mut stmt = db.prepare_cached(&format!(
            "SELECT {TICK_COLUMNS} FROM sensor_ticks
             WHERE sensor_id = ?1
               AND (?2 IS NULL OR ended_at >= ?2)
               AND (?3 IS NULL OR ended_at < ?3)
             ORDER BY ended_at DESC, id DESC
             LIMIT ?4"
        ))?;
        let rows = stmt.query_map(params![id.to_string(), after, before, limit], row_to_tick)?;
        let mut ticks = Vec::new();
        for row in rows {
            ticks.push(row?);
        }
        Ok(ticks)
    }

    fn purge_ticks_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let db = self.conn();
        let n = db.execute(
            "DELETE FROM sensor_ticks WHERE ended_at < ?1",
            [ts(cutoff)],
        )?;
        Ok(n)
    }
}

/// Map a SQLite row to a `TickRecord`.
fn row_to_tick(row: &rusqlite::Row<'_>) -> rusqlite::Result<TickRecord> {
    let sensor: String = row.get(1)?;
    let sensor_id = SensorId::parse(&sensor).ok_or_else(|| conversion_error(1, format!("bad sensor id: {sensor}")))?;
    let status: String = row.get(4)?;
    let status: TickStatus = status.parse().map_err(|e: String| conversion_error(4, e))?;
    let dispatched: String = row.get(5)?;
    let suppressed: String = row.get(6)?;

    Ok(TickRecord {
        id: row.get(0)?,
        sensor_id,
        started_at: parse_ts(&row.get::<_, String>(2)?)?,
        ended_at: parse_ts(&row.get::<_, String>(3)?)?,
        status,
        dispatched: serde_json::from_str(&dispatched).map_err(|e| conversion_error(5, e.to_string()))?,
        suppressed_keys: serde_json::from_str(&suppressed)
            .map_err(|e| conversion_error(6, e.to_string()))?,
        skip_reason: row.get(7)?,
        error: row.get(8)?,
        cursor: row.get(9)?,
        origin_run_id: row.get(10)?,
    })
}

fn conversion_error(column: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        column,
        rusqlite::types::Type::Text,
        message.into(),
    )
}

fn row_to_run_key(row: &rusqlite::Row<'_>) -> rusqlite::Result<RunKeyEntry> {
    Ok(RunKeyEntry {
        run_key: row.get(0)?,
        run_id: row.get(1)?,
        fingerprint: row.get(2)?,
        tick_id: row.get(3)?,
        admitted_at: parse_ts(&row.get::<_, String>(4)?)?,
    })
}

impl RunKeyIndex for SqliteSensorStore {
    fn claim_run_key(
        &self,
        id: &SensorId,
        key: &str,
        fingerprint: &str,
        tick_id: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<RunKeyEntry>> {
        let db = self.conn();
        let inserted = db.execute(
            "INSERT OR IGNORE INTO sensor_run_keys
             (sensor_id, run_key, run_id, fingerprint, tick_id, admitted_at)
             VALUES (?1, ?2, NULL, ?3, ?4, ?5)",
            params![id.to_string(), key, fingerprint, tick_id, ts(at)],
        )?;
        if inserted == 1 {
            return Ok(None);
        }
        let existing = db.query_row(
            "SELECT run_key, run_id, fingerprint, tick_id, admitted_at
             FROM sensor_run_keys WHERE sensor_id = ?1 AND run_key = ?2",
            params![id.to_string(), key],
            row_to_run_key,
        )?;
        Ok(Some(existing))
    }

    fn confirm_run_key(&self, id: &SensorId, key: &str, run_id: &str) -> Result<()> {
        let db = self.conn();
        db.execute(
            "UPDATE sensor_run_keys SET run_id = ?1 WHERE sensor_id = ?2 AND run_key = ?3",
            params![run_id, id.to_string(), key],
        )?;
        Ok(())
    }

    fn release_run_key(&self, id: &SensorId, key: &str) -> Result<()> {
        let db = self.conn();
        db.execute(
            "DELETE FROM sensor_run_keys WHERE sensor_id = ?1 AND run_key = ?2",
            params![id.to_string(), key],
        )?;
        Ok(())
    }

    fn lookup_run_key(&self, id: &SensorId, key: &str) -> Result<Option<RunKeyEntry>> {
        let db = self.conn();
        let entry = db
            .query_row(
                "SELECT run_key, run_id, fingerprint, tick_id, admitted_at
                 FROM sensor_run_keys WHERE sensor_id = ?1 AND run_key = ?2",
                params![id.to_string(), key],
                row_to_run_key,
            )
            .optional()?;
        Ok(entry)
    }

    fn purge_run_keys_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let db = self.conn();
        let n = db.execute(
            "DELETE FROM sensor_run_keys WHERE admitted_at < ?1",
            [ts(cutoff)],
        )?;
        Ok(n)
    }
}

impl SensorStateStore for SqliteSensorStore {
    fn sensor_status(&self, id: &SensorId) -> Result<Option<SensorStatus>> {
        let db = self.conn();
        let status: Option<String> = db
            .query_row(
                "SELECT status FROM sensor_states WHERE sensor_id = ?1",
                [id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        // An unreadable override is treated as absent.
        Ok(status.and_then(|s| s.parse().ok()))
    }

    fn set_sensor_status(&self, id: &SensorId, status: SensorStatus) -> Result<()> {
        let db = self.conn();
        db.execute(
            "INSERT INTO sensor_states (sensor_id, status, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(sensor_id) DO UPDATE
             SET status = excluded.status, updated_at = excluded.updated_at",
            params![id.to_string(), status.to_string(), ts(Utc::now())],
        )?;
        Ok(())
    }
}

impl WatermarkStore for SqliteSensorStore {
    fn watermark(&self, id: &SensorId) -> Result<Option<i64>> {
        let db = self.conn();
        let event_id = db
            .query_row(
                "SELECT event_id FROM run_status_watermarks WHERE sensor_id = ?1",
                [id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(event_id)
    }

    fn advance_watermark(&self, id: &SensorId, event_id: i64) -> Result<()> {
        let db = self.conn();
        db.execute(
            "INSERT INTO run_status_watermarks (sensor_id, event_id, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(sensor_id) DO UPDATE
             SET event_id = MAX(event_id, excluded.event_id),
                 updated_at = excluded.updated_at",
            params![id.to_string(), event_id, ts(Utc::now())],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::types::DispatchedRun;

    fn store() -> SqliteSensorStore {
        SqliteSensorStore::new(Connection::open_in_memory().expect("open")).expect("store")
    }

    fn tick(id: &SensorId, ended_at: DateTime<Utc>, status: TickStatus) -> TickRecord {
        TickRecord {
            id: uuid::Uuid::now_v7().to_string(),
            sensor_id: id.clone(),
            started_at: ended_at - Duration::seconds(1),
            ended_at,
            status,
            dispatched: vec![DispatchedRun {
                run_key: Some("a".into()),
                run_id: Some("run-1".into()),
                job_name: "ingest".into(),
                fingerprint: "f".into(),
            }],
            suppressed_keys: vec!["b".into()],
            skip_reason: None,
            error: None,
            cursor: Some("c".into()),
            origin_run_id: None,
        }
    }

    #[test]
    fn cursor_cas() {
        let store = store();
        let id = SensorId::new("loc", "s");
        assert_eq!(store.cursor(&id).unwrap(), None);
        assert!(store.compare_and_set_cursor(&id, None, "1").unwrap());
        assert!(!store.compare_and_set_cursor(&id, None, "x").unwrap());
        assert!(!store.compare_and_set_cursor(&id, Some("0"), "x").unwrap());
        assert!(store.compare_and_set_cursor(&id, Some("1"), "2").unwrap());
        assert_eq!(store.cursor(&id).unwrap().as_deref(), Some("2"));

        store.set_cursor(&id, None).unwrap();
        assert_eq!(store.cursor(&id).unwrap(), None);
    }

    #[test]
    fn tick_history_roundtrip_and_range() {
        let store = store();
        let id = SensorId::new("loc", "s");
        let other = SensorId::new("loc", "other");
        let t0 = Utc::now();
        store.append_tick(&tick(&id, t0, TickStatus::Success)).unwrap();
        store
            .append_tick(&tick(&id, t0 + Duration::seconds(10), TickStatus::Skipped))
            .unwrap();
        store
            .append_tick(&tick(&other, t0 + Duration::seconds(20), TickStatus::Failure))
            .unwrap();

        let last = store.last_tick(&id).unwrap().expect("last");
        assert_eq!(last.status, TickStatus::Skipped);
        assert_eq!(last.run_keys().collect::<Vec<_>>(), vec!["a", "b"]);

        let all = store.ticks(&id, &TickQuery::default()).unwrap();
        assert_eq!(all.len(), 2);

        let ranged = store
            .ticks(&id, &TickQuery::between(t0, t0 + Duration::seconds(5)))
            .unwrap();
        assert_eq!(ranged.len(), 1);
        assert_eq!(ranged[0].status, TickStatus::Success);

        assert_eq!(store.purge_ticks_before(t0 + Duration::seconds(15)).unwrap(), 2);
        assert!(store.last_tick(&id).unwrap().is_none());
    }

    #[test]
    fn run_key_claim_is_first_wins() {
        let store = store();
        let id = SensorId::new("loc", "s");
        let now = Utc::now();
        assert!(store.claim_run_key(&id, "k", "f1", "t1", now).unwrap().is_none());
        let existing = store
            .claim_run_key(&id, "k", "f2", "t2", now)
            .unwrap()
            .expect("duplicate");
        assert_eq!(existing.tick_id, "t1");
        assert_eq!(existing.fingerprint, "f1");

        store.confirm_run_key(&id, "k", "run-9").unwrap();
        let entry = store.lookup_run_key(&id, "k").unwrap().expect("entry");
        assert_eq!(entry.run_id.as_deref(), Some("run-9"));

        // Keys are scoped per sensor.
        let other = SensorId::new("loc", "t");
        assert!(store.claim_run_key(&other, "k", "f1", "t3", now).unwrap().is_none());

        store.release_run_key(&id, "k").unwrap();
        assert!(store.lookup_run_key(&id, "k").unwrap().is_none());
    }

    #[test]
    fn watermark_never_moves_backwards() {
        let store = store();
        let id = SensorId::new("loc", "s");
        store.advance_watermark(&id, 10).unwrap();
        store.advance_watermark(&id, 4).unwrap();
        assert_eq!(store.watermark(&id).unwrap(), Some(10));
    }

    #[test]
    fn sensor_status_override() {
        let store = store();
        let id = SensorId::new("loc", "s");
        assert_eq!(store.sensor_status(&id).unwrap(), None);
        store.set_sensor_status(&id, SensorStatus::Stopped).unwrap();
        assert_eq!(store.sensor_status(&id).unwrap(), Some(SensorStatus::Stopped));
    }
}
