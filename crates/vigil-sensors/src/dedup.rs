//! Run-request deduplication.
//!
//! A keyed request is admitted at most once per sensor. The claim is written
//! before dispatch so that a second tick (or a restarted daemon) sees the key
//! even while the first dispatch is still in flight:
//!
//! ```text
//! admit(key) ── Duplicate ──▶ suppressed, listed on the tick record
//!     │
//!  Admitted ──▶ dispatcher.submit()
//!                  ├─ Ok(run_id)        ──▶ confirm(key, run_id)
//!                  ├─ Err(Permanent)    ──▶ claim kept, never retried
//!                  └─ Err(Transient)    ──▶ release(key), next tick may retry
//! ```
//!
//! Unkeyed requests bypass the index entirely.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};

use crate::error::Result;
use crate::store::{RunKeyEntry, RunKeyIndex};
use crate::types::{RunRequest, SensorId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmitDecision {
    Admitted,
    /// An earlier tick already claimed the key.
    Duplicate(RunKeyEntry),
}

pub struct RunKeyDeduplicator<S: ?Sized> {
    index: Arc<S>,
    /// Keys older than this are forgotten by [`purge`](Self::purge).
    retention: Option<Duration>,
}

impl<S: RunKeyIndex + ?Sized> RunKeyDeduplicator<S> {
    pub fn new(index: Arc<S>, retention: Option<Duration>) -> Self {
        Self { index, retention }
    }

    /// Decide whether `request` may be dispatched, claiming its key if so.
    pub fn admit(
        &self,
        sensor: &SensorId,
        request: &RunRequest,
        tick_id: &str,
        now: DateTime<Utc>,
    ) -> Result<AdmitDecision> {
        let Some(key) = request.run_key.as_deref() else {
            return Ok(AdmitDecision::Admitted);
        };
        let fingerprint = request.fingerprint();
        match self
            .index
            .claim_run_key(sensor, key, &fingerprint, tick_id, now)?
        {
            None => Ok(AdmitDecision::Admitted),
            Some(existing) => {
                if existing.fingerprint != fingerprint {
                    warn!(
                        sensor = %sensor,
                        run_key = key,
                        first_tick = %existing.tick_id,
                        "run key reused with a different request payload"
                    );
                }
                info!(sensor = %sensor, run_key = key, run_id = ?existing.run_id, "duplicate run request suppressed");
                Ok(AdmitDecision::Duplicate(existing))
            }
        }
    }

    /// Attach the launcher's run id to an admitted key.
    pub fn confirm(&self, sensor: &SensorId, request: &RunRequest, run_id: &str) -> Result<()> {
        match request.run_key.as_deref() {
            Some(key) => self.index.confirm_run_key(sensor, key, run_id),
            None => Ok(()),
        }
    }

    /// Undo an admission after a transient dispatch failure.
    pub fn release(&self, sensor: &SensorId, request: &RunRequest) -> Result<()> {
        match request.run_key.as_deref() {
            Some(key) => self.index.release_run_key(sensor, key),
            None => Ok(()),
        }
    }

    /// Drop keys admitted before the retention horizon. No-op when retention
    /// is unbounded.
    pub fn purge(&self, now: DateTime<Utc>) -> Result<usize> {
        match self.retention {
            Some(retention) => self.index.purge_run_keys_before(now - retention),
            None => Ok(0),
        }
    }
}
