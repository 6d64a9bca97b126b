use std::sync::Arc;

use rusqlite::Connection;
use tracing::info;

use crate::error::Result;
use crate::store::{
    CursorStore, RunKeyEntry, RunKeyIndex, SensorStateStore, SensorStore, SqliteSensorStore,
    TickQuery, TickStore,
};
use crate::types::{SensorId, SensorStatus, TickRecord};

/// Operator view of persisted sensor state.
///
/// Opens its own connection, so the CLI can inspect or adjust sensors while
/// a daemon is running against the same database file.
pub struct SensorHandle {
    store: Arc<dyn SensorStore>,
}

impl SensorHandle {
    pub fn new(store: Arc<dyn SensorStore>) -> Self {
        Self { store }
    }

    pub fn open(conn: Connection) -> Result<Self> {
        Ok(Self::new(Arc::new(SqliteSensorStore::new(conn)?)))
    }

    /// Tick history, newest first.
    pub fn ticks(&self, id: &SensorId, query: &TickQuery) -> Result<Vec<TickRecord>> {
        self.store.ticks(id, query)
    }

    pub fn cursor(&self, id: &SensorId) -> Result<Option<String>> {
        self.store.cursor(id)
    }

    /// Overwrite or clear a cursor. The next tick evaluates from the new value.
    pub fn set_cursor(&self, id: &SensorId, cursor: Option<&str>) -> Result<()> {
        self.store.set_cursor(id, cursor)?;
        info!(sensor = %id, cleared = cursor.is_none(), "cursor set by operator");
        Ok(())
    }

    pub fn start(&self, id: &SensorId) -> Result<()> {
        self.store.set_sensor_status(id, SensorStatus::Running)?;
        info!(sensor = %id, "sensor started");
        Ok(())
    }

    pub fn stop(&self, id: &SensorId) -> Result<()> {
        self.store.set_sensor_status(id, SensorStatus::Stopped)?;
        info!(sensor = %id, "sensor stopped");
        Ok(())
    }

    /// The operator override, if one was ever set.
    pub fn status_override(&self, id: &SensorId) -> Result<Option<SensorStatus>> {
        self.store.sensor_status(id)
    }

    /// Which tick admitted `key`, and the run it launched.
    pub fn run_key(&self, id: &SensorId, key: &str) -> Result<Option<RunKeyEntry>> {
        self.store.lookup_run_key(id, key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_stop_and_cursor_reset() {
        let handle = SensorHandle::open(Connection::open_in_memory().unwrap()).unwrap();
        let id = SensorId::new("loc", "s");
        assert_eq!(handle.status_override(&id).unwrap(), None);

        handle.stop(&id).unwrap();
        assert_eq!(handle.status_override(&id).unwrap(), Some(SensorStatus::Stopped));
        handle.start(&id).unwrap();
        assert_eq!(handle.status_override(&id).unwrap(), Some(SensorStatus::Running));

        handle.set_cursor(&id, Some("42")).unwrap();
        assert_eq!(handle.cursor(&id).unwrap().as_deref(), Some("42"));
        handle.set_cursor(&id, None).unwrap();
        assert_eq!(handle.cursor(&id).unwrap(), None);
        assert!(handle.ticks(&id, &TickQuery::latest(10)).unwrap().is_empty());
    }
}
