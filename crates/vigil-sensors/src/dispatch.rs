use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use crate::error::DispatchError;
use crate::types::{RunRequest, SensorId};

/// The run launcher. Accepts a deduplicated request and starts a run.
#[async_trait]
pub trait RunDispatcher: Send + Sync {
    /// Returns the launched run's id.
    async fn submit(&self, sensor: &SensorId, request: &RunRequest) -> Result<String, DispatchError>;
}

/// A request handed to the launcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSubmission {
    pub run_id: String,
    pub sensor_id: SensorId,
    pub request: RunRequest,
    pub submitted_at: DateTime<Utc>,
}

impl RunSubmission {
    pub fn new(sensor: &SensorId, request: &RunRequest) -> Self {
        Self {
            run_id: Uuid::now_v7().to_string(),
            sensor_id: sensor.clone(),
            request: request.clone(),
            submitted_at: Utc::now(),
        }
    }
}

/// Forwards submissions to an in-process launcher task over mpsc.
///
/// A closed receiver is reported as transient: the launcher may come back
/// and the key should stay unadmitted until it does.
pub struct ChannelDispatcher {
    tx: mpsc::Sender<RunSubmission>,
}

impl ChannelDispatcher {
    pub fn new(tx: mpsc::Sender<RunSubmission>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl RunDispatcher for ChannelDispatcher {
    async fn submit(&self, sensor: &SensorId, request: &RunRequest) -> Result<String, DispatchError> {
        let submission = RunSubmission::new(sensor, request);
        let run_id = submission.run_id.clone();
        self.tx
            .send(submission)
            .await
            .map_err(|_| DispatchError::Transient("launcher channel closed".to_string()))?;
        debug!(sensor = %sensor, %run_id, job = %request.job_name, "run submitted");
        Ok(run_id)
    }
}
