use std::path::PathBuf;

use async_trait::async_trait;
use tracing::debug;
use vigil_sensors::{DispatchError, RunDispatcher, RunRequest, RunSubmission, SensorId};

/// Hands runs to an external launcher by dropping one JSON file per run
/// into a spool directory.
///
/// Files are written under a temporary name and renamed into place, so a
/// launcher watching the directory never sees a partial submission.
pub struct SpoolDispatcher {
    dir: PathBuf,
}

impl SpoolDispatcher {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl RunDispatcher for SpoolDispatcher {
    async fn submit(&self, sensor: &SensorId, request: &RunRequest) -> Result<String, DispatchError> {
        let submission = RunSubmission::new(sensor, request);
        // A request that cannot be encoded never will be.
        let body = serde_json::to_vec_pretty(&submission)
            .map_err(|e| DispatchError::Permanent(format!("cannot encode submission: {e}")))?;

        let io = |e: std::io::Error| DispatchError::Transient(format!("spool {}: {e}", self.dir.display()));
        tokio::fs::create_dir_all(&self.dir).await.map_err(io)?;
        let tmp = self.dir.join(format!(".{}.json.tmp", submission.run_id));
        let path = self.dir.join(format!("{}.json", submission.run_id));
        tokio::fs::write(&tmp, body).await.map_err(io)?;
        tokio::fs::rename(&tmp, &path).await.map_err(io)?;

        debug!(sensor = %sensor, run_id = %submission.run_id, path = %path.display(), "run spooled");
        Ok(submission.run_id)
    }
}
