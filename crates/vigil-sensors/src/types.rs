use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Sensor identity: a name unique within its code location.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SensorId {
    pub location: String,
    pub name: String,
}

impl SensorId {
    pub fn new(location: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            name: name.into(),
        }
    }

    /// Parse the `location/name` form. The name may not contain `/`.
    pub fn parse(s: &str) -> Option<Self> {
        let (location, name) = s.rsplit_once('/')?;
        if location.is_empty() || name.is_empty() {
            return None;
        }
        Some(Self::new(location, name))
    }
}

impl std::fmt::Display for SensorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.location, self.name)
    }
}

/// A candidate instruction to start a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRequest {
    /// Dedup key. `None` means the request is never deduplicated.
    pub run_key: Option<String>,
    pub job_name: String,
    /// Code location of the target job. `None` targets the sensor's own location.
    pub location: Option<String>,
    #[serde(default)]
    pub run_config: serde_json::Value,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl RunRequest {
    pub fn new(job_name: impl Into<String>) -> Self {
        Self {
            run_key: None,
            job_name: job_name.into(),
            location: None,
            run_config: serde_json::Value::Null,
            tags: BTreeMap::new(),
        }
    }

    pub fn with_run_key(mut self, key: impl Into<String>) -> Self {
        self.run_key = Some(key.into());
        self
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    pub fn with_run_config(mut self, run_config: serde_json::Value) -> Self {
        self.run_config = run_config;
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// SHA-256 over everything except the run key.
    ///
    /// Two requests that share a key but not a fingerprint indicate the
    /// evaluation logic is reusing keys for different payloads.
    pub fn fingerprint(&self) -> String {
        let payload = serde_json::json!({
            "job_name": self.job_name,
            "location": self.location,
            "run_config": self.run_config,
            "tags": self.tags,
        });
        let mut hasher = Sha256::new();
        hasher.update(payload.to_string().as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// Outcome of one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TickStatus {
    /// At least one run was dispatched.
    Success,
    /// Evaluation finished without dispatching anything.
    Skipped,
    /// Evaluation or dispatch raised an error.
    Failure,
    /// Evaluation exceeded its deadline and was abandoned.
    Timeout,
}

impl std::fmt::Display for TickStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TickStatus::Success => "success",
            TickStatus::Skipped => "skipped",
            TickStatus::Failure => "failure",
            TickStatus::Timeout => "timeout",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for TickStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "success" => Ok(TickStatus::Success),
            "skipped" => Ok(TickStatus::Skipped),
            "failure" => Ok(TickStatus::Failure),
            "timeout" => Ok(TickStatus::Timeout),
            other => Err(format!("unknown tick status: {other}")),
        }
    }
}

/// A request that reached the run launcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchedRun {
    pub run_key: Option<String>,
    /// Run id assigned by the launcher; `None` if it permanently rejected the request.
    pub run_id: Option<String>,
    pub job_name: String,
    pub fingerprint: String,
}

/// Append-only record of one evaluation attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TickRecord {
    /// UUID v7, so ids sort by creation time.
    pub id: String,
    pub sensor_id: SensorId,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub status: TickStatus,
    pub dispatched: Vec<DispatchedRun>,
    /// Keys that were suppressed because an earlier tick already dispatched them.
    pub suppressed_keys: Vec<String>,
    pub skip_reason: Option<String>,
    pub error: Option<String>,
    /// Cursor written after this tick, if any.
    pub cursor: Option<String>,
    /// Run whose status event triggered this tick (run-status sensors only).
    pub origin_run_id: Option<String>,
}

impl TickRecord {
    /// Every key this tick produced, dispatched or suppressed.
    pub fn run_keys(&self) -> impl Iterator<Item = &str> {
        self.dispatched
            .iter()
            .filter_map(|d| d.run_key.as_deref())
            .chain(self.suppressed_keys.iter().map(String::as_str))
    }
}

/// Persisted start/stop override for a sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorStatus {
    Running,
    Stopped,
}

impl std::fmt::Display for SensorStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SensorStatus::Running => "running",
            SensorStatus::Stopped => "stopped",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for SensorStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "running" => Ok(SensorStatus::Running),
            "stopped" => Ok(SensorStatus::Stopped),
            other => Err(format!("unknown sensor status: {other}")),
        }
    }
}

/// Status of a monitored run as reported by the execution engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Started,
    Success,
    Failure,
    Canceled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, RunStatus::Started)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunStatus::Started => "started",
            RunStatus::Success => "success",
            RunStatus::Failure => "failure",
            RunStatus::Canceled => "canceled",
        };
        write!(f, "{s}")
    }
}

/// Emitted by the execution engine for a monitored job's run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStatusEvent {
    /// Monotonic storage id; used as the redelivery watermark.
    pub event_id: i64,
    pub run_id: String,
    pub job_name: String,
    pub location: String,
    pub status: RunStatus,
    /// Failure detail; only set when `status` is `Failure`.
    pub failure: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl RunStatusEvent {
    /// An event not yet assigned a storage id.
    pub fn new(
        run_id: impl Into<String>,
        job_name: impl Into<String>,
        location: impl Into<String>,
        status: RunStatus,
    ) -> Self {
        Self {
            event_id: 0,
            run_id: run_id.into(),
            job_name: job_name.into(),
            location: location.into(),
            status,
            failure: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_failure(mut self, detail: impl Into<String>) -> Self {
        self.failure = Some(detail.into());
        self
    }
}

/// Points at one job, optionally pinned to a code location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSelector {
    pub job_name: String,
    /// `None` matches the job in any location.
    pub location: Option<String>,
}

impl JobSelector {
    pub fn new(job_name: impl Into<String>) -> Self {
        Self {
            job_name: job_name.into(),
            location: None,
        }
    }

    pub fn in_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    pub fn matches(&self, event: &RunStatusEvent) -> bool {
        self.job_name == event.job_name
            && self
                .location
                .as_deref()
                .map_or(true, |location| location == event.location)
    }
}
