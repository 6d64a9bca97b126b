//! `vigil-sensors`: sensor evaluation, run deduplication and tick scheduling
//! with SQLite persistence.
//!
//! # Overview
//!
//! A sensor is a declarative [`SensorDefinition`] bound to evaluation logic.
//! Each tick the evaluation reads its cursor, yields zero or more
//! [`RunRequest`]s and may write a new cursor. Keyed requests pass through
//! the [`RunKeyDeduplicator`] before reaching the [`RunDispatcher`], so a run
//! key is dispatched at most once per sensor. Every attempt leaves a
//! [`TickRecord`].
//!
//! # Tick outcomes
//!
//! | Outcome   | When                                   | Cursor written               |
//! |-----------|----------------------------------------|------------------------------|
//! | `Success` | at least one run dispatched            | yes                          |
//! | `Skipped` | nothing dispatched (or all duplicates) | yes                          |
//! | `Failure` | evaluation error, panic, or dispatch   | only if set before the error |
//! | `Timeout` | deadline exceeded                      | never                        |
//!
//! Poll sensors are driven by [`SensorDaemon`]; run-status sensors by the
//! [`RunStatusCorrelator`].

pub mod clock;
pub mod context;
pub mod db;
pub mod dedup;
pub mod definition;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod evaluator;
pub mod handle;
pub mod lease;
pub mod resources;
pub mod run_status;
pub mod store;
pub mod tick;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use context::SensorContext;
pub use dedup::{AdmitDecision, RunKeyDeduplicator};
pub use definition::{
    sensor_fn, MonitorScope, RunStatusTarget, Sensor, SensorDefinition, SensorEvaluation,
    SensorKind, SensorRegistry,
};
pub use dispatch::{ChannelDispatcher, RunDispatcher, RunSubmission};
pub use engine::{is_due, DaemonSettings, SensorDaemon};
pub use error::{DefinitionError, DispatchError, EvaluationError, Result, SensorError, TickError};
pub use handle::SensorHandle;
pub use lease::{LeaseOutcome, LeaseStore};
pub use resources::Resources;
pub use run_status::{BroadcastEventSource, EventFilter, RunStatusCorrelator, RunStatusEventSource};
pub use store::{SensorStore, SqliteSensorStore, TickQuery};
pub use tick::{TickRunner, TickSettings};
pub use types::{
    DispatchedRun, JobSelector, RunRequest, RunStatus, RunStatusEvent, SensorId, SensorStatus,
    TickRecord, TickStatus,
};
