use std::path::PathBuf;
use std::time::{Duration, UNIX_EPOCH};

use async_trait::async_trait;
use vigil_core::config::DirectorySensorConfig;
use vigil_sensors::{
    EvaluationError, RunRequest, SensorContext, SensorDefinition, SensorEvaluation, SensorId,
};

/// Requests one run per new or modified file in a directory.
///
/// Every file is offered on every tick and the `name:mtime` run key makes
/// repeats duplicates. Files moved in with an old modification time are
/// therefore still picked up. The cursor records the newest modification
/// time seen, in milliseconds since the epoch, for operators only.
pub struct DirectorySensor {
    directory: PathBuf,
    job: String,
}

impl DirectorySensor {
    pub fn new(directory: impl Into<PathBuf>, job: impl Into<String>) -> Self {
        Self {
            directory: directory.into(),
            job: job.into(),
        }
    }
}

/// Definition for a `[[sensors]]` config entry.
pub fn definition(config: &DirectorySensorConfig) -> SensorDefinition {
    let mut definition = SensorDefinition::poll(
        SensorId::new(&config.location, &config.name),
        Duration::from_secs(config.interval_secs),
    )
    .with_description(format!("new files in {}", config.directory));
    if let Some(secs) = config.max_duration_secs {
        definition = definition.with_max_duration(Duration::from_secs(secs));
    }
    if !config.enabled {
        definition = definition.stopped_by_default();
    }
    definition
}

struct Entry {
    name: String,
    path: PathBuf,
    mtime_ms: u128,
}

#[async_trait]
impl SensorEvaluation for DirectorySensor {
    async fn evaluate(&self, ctx: SensorContext) -> Result<(), EvaluationError> {
        let previous: u128 = ctx.cursor().and_then(|c| c.parse().ok()).unwrap_or(0);

        let mut dir = tokio::fs::read_dir(&self.directory).await.map_err(|e| {
            EvaluationError::failed(format!("cannot list {}: {e}", self.directory.display()))
        })?;
        let mut entries = Vec::new();
        while let Some(item) = dir
            .next_entry()
            .await
            .map_err(|e| EvaluationError::failed(e.to_string()))?
        {
            if ctx.is_cancelled() {
                return Ok(());
            }
            let meta = match item.metadata().await {
                Ok(meta) if meta.is_file() => meta,
                _ => continue,
            };
            let mtime_ms = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map_or(0, |d| d.as_millis());
            entries.push(Entry {
                name: item.file_name().to_string_lossy().into_owned(),
                path: item.path(),
                mtime_ms,
            });
        }

        if entries.is_empty() {
            ctx.skip(format!("no files in {}", self.directory.display()));
            return Ok(());
        }
        entries.sort_by(|a, b| a.mtime_ms.cmp(&b.mtime_ms).then_with(|| a.name.cmp(&b.name)));

        let newest = entries.iter().map(|e| e.mtime_ms).fold(previous, u128::max);
        for entry in entries {
            let request = RunRequest::new(&self.job)
                .with_run_key(format!("{}:{}", entry.name, entry.mtime_ms))
                .with_run_config(serde_json::json!({ "path": entry.path.display().to_string() }))
                .with_tag("file", entry.name);
            ctx.request_run(request).await?;
        }
        ctx.update_cursor(newest.to_string())?;
        Ok(())
    }
}
