use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashSet;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;
use vigil_core::VigilConfig;

use crate::clock::{Clock, SystemClock};
use crate::dedup::{AdmitDecision, RunKeyDeduplicator};
use crate::definition::{Sensor, SensorRegistry};
use crate::dispatch::RunDispatcher;
use crate::error::{DispatchError, Result, SensorError, TickError};
use crate::evaluator::{evaluate, EvaluationInput, RequestSink};
use crate::store::{CursorStore, SensorStateStore, SensorStore, TickStore};
use crate::types::{
    DispatchedRun, RunRequest, RunStatusEvent, SensorId, SensorStatus, TickRecord, TickStatus,
};

/// Knobs the tick pipeline reads from configuration.
#[derive(Debug, Clone)]
pub struct TickSettings {
    /// Deadline for sensors that do not set their own.
    pub default_deadline: Duration,
    /// How long admitted run keys are remembered. `None` keeps them forever.
    pub dedup_retention: Option<chrono::Duration>,
    /// How long tick records are kept. `None` keeps them forever.
    pub tick_retention: Option<chrono::Duration>,
    /// Upper bound on ticks evaluating at once, across every driver.
    pub max_concurrent_ticks: usize,
}

impl Default for TickSettings {
    fn default() -> Self {
        Self {
            default_deadline: Duration::from_secs(vigil_core::config::DEFAULT_MAX_DURATION_SECS),
            dedup_retention: None,
            tick_retention: None,
            max_concurrent_ticks: vigil_core::config::DEFAULT_MAX_CONCURRENT_TICKS,
        }
    }
}

impl TickSettings {
    pub fn from_config(config: &VigilConfig) -> Self {
        let days = |d: Option<u64>| d.map(|d| chrono::Duration::days(d as i64));
        Self {
            default_deadline: Duration::from_secs(config.daemon.default_max_duration_secs),
            dedup_retention: days(config.dedup.retention_days),
            tick_retention: days(config.ticks.retention_days),
            max_concurrent_ticks: config.daemon.max_concurrent_ticks,
        }
    }
}

/// Runs single ticks: load state, evaluate, deduplicate, dispatch, record.
///
/// Holds the in-flight set, so at most one tick per sensor runs at a time no
/// matter whether the daemon loop or the run-status correlator started it.
/// Also holds the tick permits, so both drivers share one concurrency limit.
pub struct TickRunner {
    store: Arc<dyn SensorStore>,
    dispatcher: Arc<dyn RunDispatcher>,
    registry: Arc<SensorRegistry>,
    clock: Arc<dyn Clock>,
    dedup: RunKeyDeduplicator<dyn SensorStore>,
    settings: TickSettings,
    in_flight: DashSet<SensorId>,
    permits: Semaphore,
}

/// Removes the sensor from the in-flight set when the tick ends, however it ends.
struct InFlight<'a> {
    set: &'a DashSet<SensorId>,
    id: SensorId,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.set.remove(&self.id);
    }
}

impl TickRunner {
    pub fn new(
        store: Arc<dyn SensorStore>,
        dispatcher: Arc<dyn RunDispatcher>,
        registry: Arc<SensorRegistry>,
        settings: TickSettings,
    ) -> Self {
        Self {
            dedup: RunKeyDeduplicator::new(Arc::clone(&store), settings.dedup_retention),
            store,
            dispatcher,
            registry,
            clock: Arc::new(SystemClock),
            permits: Semaphore::new(settings.max_concurrent_ticks.max(1)),
            settings,
            in_flight: DashSet::new(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn store(&self) -> &Arc<dyn SensorStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<SensorRegistry> {
        &self.registry
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn is_in_flight(&self, id: &SensorId) -> bool {
        self.in_flight.contains(id)
    }

    /// Tick permits not currently held.
    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    /// Effective start/stop state: the operator override, else the default.
    pub fn is_enabled(&self, sensor: &Sensor) -> Result<bool> {
        let status = self
            .store
            .sensor_status(sensor.id())?
            .unwrap_or(sensor.definition.default_status);
        Ok(status == SensorStatus::Running)
    }

    fn claim<'a>(&'a self, id: &SensorId) -> Option<InFlight<'a>> {
        self.in_flight.insert(id.clone()).then(|| InFlight {
            set: &self.in_flight,
            id: id.clone(),
        })
    }

    /// Run one tick of `sensor`.
    ///
    /// Waits for a tick permit first. Returns `None` when nothing was
    /// recorded: the sensor already had a tick in flight, is stopped, or was
    /// stopped or removed while this tick was evaluating.
    #[instrument(skip_all, fields(sensor = %sensor.id()))]
    pub async fn run_tick(
        &self,
        sensor: Arc<Sensor>,
        trigger: Option<RunStatusEvent>,
    ) -> Result<Option<TickRecord>> {
        let id = sensor.id().clone();
        let Some(_guard) = self.claim(&id) else {
            debug!("tick already in flight");
            return Ok(None);
        };
        let Ok(_permit) = self.permits.acquire().await else {
            return Ok(None);
        };
        if !self.is_enabled(&sensor)? {
            debug!("sensor stopped; not ticking");
            return Ok(None);
        }

        let started_at = self.clock.now();
        let cursor = self.store.cursor(&id)?;
        let last_tick_at = self.store.last_tick(&id)?.map(|t| t.ended_at);
        let tick_id = Uuid::now_v7().to_string();
        let origin_run_id = trigger.as_ref().map(|e| e.run_id.clone());

        let mut sink = DispatchSink {
            runner: self,
            sensor_id: &id,
            tick_id: &tick_id,
            dispatched: Vec::new(),
            suppressed: Vec::new(),
        };
        let deadline = sensor
            .definition
            .max_duration
            .unwrap_or(self.settings.default_deadline);
        let evaluation = evaluate(
            EvaluationInput {
                sensor: Arc::clone(&sensor),
                cursor: cursor.clone(),
                last_tick_at,
                now: started_at,
                run_status: trigger,
                deadline,
            },
            &mut sink,
        )
        .await;
        let DispatchSink {
            dispatched,
            suppressed,
            ..
        } = sink;

        let status = match &evaluation.error {
            None if !dispatched.is_empty() => TickStatus::Success,
            None => TickStatus::Skipped,
            Some(TickError::Timeout { .. }) => TickStatus::Timeout,
            Some(_) => TickStatus::Failure,
        };
        let skip_reason = match status {
            TickStatus::Skipped => evaluation.skip_reason.clone().or_else(|| {
                (!suppressed.is_empty())
                    .then(|| format!("all {} run requests were duplicates", suppressed.len()))
            }),
            _ => None,
        };

        // A sensor stopped or removed mid-tick keeps whatever it already
        // dispatched, but its tick and cursor are not recorded.
        match self.registry.get(&id) {
            Some(current) if self.is_enabled(&current)? => {}
            _ => {
                info!(
                    dispatched = dispatched.len(),
                    "sensor stopped or removed during tick; result discarded"
                );
                return Ok(None);
            }
        }

        let written_cursor = match evaluation.cursor_update.as_deref() {
            Some(next) => {
                if self
                    .store
                    .compare_and_set_cursor(&id, cursor.as_deref(), next)?
                {
                    Some(next.to_string())
                } else {
                    let conflict = SensorError::CursorConflict { id: id.to_string() };
                    warn!(error = %conflict, "cursor update dropped");
                    None
                }
            }
            None => None,
        };

        let record = TickRecord {
            id: tick_id,
            sensor_id: id,
            started_at,
            ended_at: self.clock.now(),
            status,
            dispatched,
            suppressed_keys: suppressed,
            skip_reason,
            error: evaluation.error.as_ref().map(|e| e.to_string()),
            cursor: written_cursor,
            origin_run_id,
        };
        self.store.append_tick(&record)?;

        match status {
            TickStatus::Success | TickStatus::Skipped => info!(
                %status,
                dispatched = record.dispatched.len(),
                suppressed = record.suppressed_keys.len(),
                "tick complete"
            ),
            TickStatus::Failure | TickStatus::Timeout => warn!(
                %status,
                error = record.error.as_deref().unwrap_or_default(),
                "tick failed"
            ),
        }
        Ok(Some(record))
    }

    /// Drop tick records and run keys past their retention horizons.
    pub fn housekeep(&self) -> Result<(usize, usize)> {
        let now = self.clock.now();
        let ticks = match self.settings.tick_retention {
            Some(retention) => self.store.purge_ticks_before(now - retention)?,
            None => 0,
        };
        let keys = self.dedup.purge(now)?;
        if ticks > 0 || keys > 0 {
            info!(ticks, run_keys = keys, "housekeeping purged expired records");
        }
        Ok((ticks, keys))
    }
}

/// Dedup-then-dispatch for each request an evaluation yields.
struct DispatchSink<'a> {
    runner: &'a TickRunner,
    sensor_id: &'a SensorId,
    tick_id: &'a str,
    dispatched: Vec<DispatchedRun>,
    suppressed: Vec<String>,
}

#[async_trait]
impl<'a> RequestSink for DispatchSink<'a> {
    async fn offer(&mut self, request: RunRequest) -> std::result::Result<(), DispatchError> {
        let dedup = &self.runner.dedup;
        let decision = dedup
            .admit(self.sensor_id, &request, self.tick_id, self.runner.clock.now())
            .map_err(|e| DispatchError::Transient(format!("run key index unavailable: {e}")))?;
        if let AdmitDecision::Duplicate(_) = decision {
            if let Some(key) = request.run_key {
                self.suppressed.push(key);
            }
            return Ok(());
        }

        let fingerprint = request.fingerprint();
        match self.runner.dispatcher.submit(self.sensor_id, &request).await {
            Ok(run_id) => {
                if let Err(e) = dedup.confirm(self.sensor_id, &request, &run_id) {
                    warn!(error = %e, run_key = ?request.run_key, "could not record run id for admitted key");
                }
                self.dispatched.push(DispatchedRun {
                    run_key: request.run_key,
                    run_id: Some(run_id),
                    job_name: request.job_name,
                    fingerprint,
                });
                Ok(())
            }
            Err(e) if e.is_transient() => {
                if let Err(release) = dedup.release(self.sensor_id, &request) {
                    error!(error = %release, run_key = ?request.run_key, "could not release run key after transient failure");
                }
                Err(e)
            }
            Err(e) => {
                self.dispatched.push(DispatchedRun {
                    run_key: request.run_key,
                    run_id: None,
                    job_name: request.job_name,
                    fingerprint,
                });
                Err(e)
            }
        }
    }
}
