use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::EvaluationError;
use crate::resources::Resources;
use crate::types::{RunRequest, RunStatusEvent, SensorId};

/// Side effects an evaluation records besides its yielded requests.
#[derive(Debug, Default)]
pub(crate) struct TickScratch {
    pub cursor_update: Option<String>,
    pub skip_reason: Option<String>,
}

/// Everything one evaluation may see and do during a tick.
///
/// Moved into the evaluation; dropped when it returns, which closes the
/// request stream.
pub struct SensorContext {
    sensor_id: SensorId,
    cursor: Option<String>,
    last_tick_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    resources: Resources,
    run_status: Option<RunStatusEvent>,
    cancel: CancellationToken,
    requests: mpsc::Sender<RunRequest>,
    scratch: Arc<Mutex<TickScratch>>,
}

pub(crate) struct ContextParts {
    pub sensor_id: SensorId,
    pub cursor: Option<String>,
    pub last_tick_at: Option<DateTime<Utc>>,
    pub now: DateTime<Utc>,
    pub resources: Resources,
    pub run_status: Option<RunStatusEvent>,
    pub cancel: CancellationToken,
    pub requests: mpsc::Sender<RunRequest>,
    pub scratch: Arc<Mutex<TickScratch>>,
}

impl SensorContext {
    pub(crate) fn from_parts(parts: ContextParts) -> Self {
        Self {
            sensor_id: parts.sensor_id,
            cursor: parts.cursor,
            last_tick_at: parts.last_tick_at,
            now: parts.now,
            resources: parts.resources,
            run_status: parts.run_status,
            cancel: parts.cancel,
            requests: parts.requests,
            scratch: parts.scratch,
        }
    }

    pub fn sensor_id(&self) -> &SensorId {
        &self.sensor_id
    }

    /// Cursor persisted by the last tick that was allowed to write one.
    pub fn cursor(&self) -> Option<&str> {
        self.cursor.as_deref()
    }

    /// End time of the previous recorded tick.
    pub fn last_tick_at(&self) -> Option<DateTime<Utc>> {
        self.last_tick_at
    }

    /// Tick start time.
    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    pub fn resources(&self) -> &Resources {
        &self.resources
    }

    /// The event that triggered this tick. Always set for run-status sensors.
    pub fn run_status_event(&self) -> Option<&RunStatusEvent> {
        self.run_status.as_ref()
    }

    /// Fired when the tick is abandoned. Adapters doing long I/O should select on it.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Yield a run request. Dispatch happens as soon as the scheduler pulls it,
    /// before the evaluation returns.
    pub async fn request_run(&self, request: RunRequest) -> Result<(), EvaluationError> {
        self.requests
            .send(request)
            .await
            .map_err(|_| EvaluationError::TickClosed)
    }

    /// Record the new cursor. Write-once per tick; persisted only if the tick
    /// outcome allows it.
    pub fn update_cursor(&self, cursor: impl Into<String>) -> Result<(), EvaluationError> {
        let mut scratch = self.scratch.lock().unwrap_or_else(|e| e.into_inner());
        if scratch.cursor_update.is_some() {
            return Err(EvaluationError::CursorAlreadyUpdated);
        }
        scratch.cursor_update = Some(cursor.into());
        Ok(())
    }

    /// Explain why nothing was requested. Shown on the tick record.
    pub fn skip(&self, reason: impl Into<String>) {
        let mut scratch = self.scratch.lock().unwrap_or_else(|e| e.into_inner());
        scratch.skip_reason = Some(reason.into());
    }
}

impl std::fmt::Debug for SensorContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SensorContext")
            .field("sensor_id", &self.sensor_id)
            .field("cursor", &self.cursor)
            .field("now", &self.now)
            .field("run_status", &self.run_status)
            .finish_non_exhaustive()
    }
}
