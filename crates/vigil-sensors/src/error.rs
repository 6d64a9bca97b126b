use thiserror::Error;

/// Errors that can occur within the sensor subsystem.
#[derive(Debug, Error)]
pub enum SensorError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A persisted JSON column could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The cursor changed underneath a compare-and-set write.
    #[error("Cursor for {id} was modified concurrently")]
    CursorConflict { id: String },

    /// Another daemon instance holds the scheduling lease.
    #[error("Lease {name} is held by {holder}")]
    LeaseHeld { name: String, holder: String },

    /// The run-status event stream could not be opened.
    #[error("Event source error: {0}")]
    EventSource(String),
}

/// Invalid sensor configuration. Never reaches the scheduler loop.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DefinitionError {
    #[error("sensor name must not be empty")]
    EmptyName,

    #[error("sensor {sensor}: name must not contain '/'")]
    SlashInName { sensor: String },

    #[error("sensor {sensor}: {field} must be positive")]
    NonPositive { sensor: String, field: &'static str },

    #[error("sensor {sensor}: monitor_all_locations cannot be combined with explicit job or location selectors")]
    ConflictingMonitorScope { sensor: String },

    #[error("sensor {sensor}: run-status sensor must react to at least one status")]
    NoMonitoredStatus { sensor: String },

    #[error("sensor {sensor}: required resource '{resource}' is not provided")]
    MissingResource { sensor: String, resource: String },

    #[error("sensor {sensor} is already registered")]
    Duplicate { sensor: String },
}

/// Raised by user evaluation logic. Isolated to the tick that produced it.
#[derive(Debug, Error)]
pub enum EvaluationError {
    /// The evaluation logic failed.
    #[error("{0}")]
    Failed(String),

    /// `update_cursor` was called more than once in the same tick.
    #[error("cursor already updated during this tick")]
    CursorAlreadyUpdated,

    /// The tick stopped accepting requests (deadline or dispatch failure).
    #[error("tick is closed; no further run requests are accepted")]
    TickClosed,
}

impl EvaluationError {
    pub fn failed(message: impl Into<String>) -> Self {
        EvaluationError::Failed(message.into())
    }
}

impl From<anyhow::Error> for EvaluationError {
    fn from(e: anyhow::Error) -> Self {
        EvaluationError::Failed(format!("{e:#}"))
    }
}

/// Rejection from the run launcher.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    /// Worth retrying on a later tick; the run key stays unadmitted.
    #[error("transient dispatch failure: {0}")]
    Transient(String),

    /// The launcher will never accept this request; the run key stays admitted.
    #[error("permanent dispatch failure: {0}")]
    Permanent(String),
}

impl DispatchError {
    pub fn is_transient(&self) -> bool {
        matches!(self, DispatchError::Transient(_))
    }
}

/// Why a tick ended in `Failure` or `Timeout`. Rendered into the tick record.
#[derive(Debug, Error)]
pub enum TickError {
    /// Deadline exceeded; the evaluation was abandoned.
    #[error("evaluation exceeded its {}s deadline", after.as_secs_f64())]
    Timeout { after: std::time::Duration },

    #[error("evaluation failed: {0}")]
    Evaluation(#[from] EvaluationError),

    #[error("evaluation panicked: {0}")]
    Panicked(String),

    #[error("dispatch of {job} failed: {source}")]
    Dispatch {
        job: String,
        #[source]
        source: DispatchError,
    },
}

pub type Result<T> = std::result::Result<T, SensorError>;
