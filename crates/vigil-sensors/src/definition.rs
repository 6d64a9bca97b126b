use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::context::SensorContext;
use crate::error::{DefinitionError, EvaluationError};
use crate::resources::Resources;
use crate::types::{JobSelector, RunStatus, RunStatusEvent, SensorId, SensorStatus};

/// User-supplied evaluation logic. Invoked once per tick.
#[async_trait]
pub trait SensorEvaluation: Send + Sync {
    async fn evaluate(&self, ctx: SensorContext) -> Result<(), EvaluationError>;
}

struct FnEvaluation<F>(F);

#[async_trait]
impl<F, Fut> SensorEvaluation for FnEvaluation<F>
where
    F: Fn(SensorContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), EvaluationError>> + Send,
{
    async fn evaluate(&self, ctx: SensorContext) -> Result<(), EvaluationError> {
        (self.0)(ctx).await
    }
}

/// Wrap an async closure as evaluation logic.
pub fn sensor_fn<F, Fut>(f: F) -> Arc<dyn SensorEvaluation>
where
    F: Fn(SensorContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), EvaluationError>> + Send + 'static,
{
    Arc::new(FnEvaluation(f))
}

/// What drives a sensor's ticks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SensorKind {
    /// Ticked by the daemon loop every `minimum_interval`.
    Poll,
    /// Ticked by the correlator for each matching run-status event.
    RunStatus(RunStatusTarget),
}

/// Raw monitoring configuration of a run-status sensor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStatusTarget {
    /// Statuses the sensor reacts to.
    pub statuses: Vec<RunStatus>,
    #[serde(default)]
    pub monitor_all_locations: bool,
    #[serde(default)]
    pub monitored_jobs: Vec<JobSelector>,
    /// Whole code locations to monitor.
    #[serde(default)]
    pub monitored_locations: Vec<String>,
}

impl RunStatusTarget {
    pub fn on(status: RunStatus) -> Self {
        Self {
            statuses: vec![status],
            monitor_all_locations: false,
            monitored_jobs: Vec::new(),
            monitored_locations: Vec::new(),
        }
    }

    pub fn monitor_all(mut self) -> Self {
        self.monitor_all_locations = true;
        self
    }

    pub fn monitor_job(mut self, selector: JobSelector) -> Self {
        self.monitored_jobs.push(selector);
        self
    }

    pub fn monitor_location(mut self, location: impl Into<String>) -> Self {
        self.monitored_locations.push(location.into());
        self
    }

    fn scope(&self, sensor: &SensorId) -> Result<MonitorScope, DefinitionError> {
        let explicit = !self.monitored_jobs.is_empty() || !self.monitored_locations.is_empty();
        match (self.monitor_all_locations, explicit) {
            (true, true) => Err(DefinitionError::ConflictingMonitorScope {
                sensor: sensor.to_string(),
            }),
            (true, false) => Ok(MonitorScope::All),
            (false, true) => Ok(MonitorScope::Selected {
                jobs: self.monitored_jobs.clone(),
                locations: self.monitored_locations.clone(),
            }),
            (false, false) => Ok(MonitorScope::SameLocation),
        }
    }
}

/// Resolved set of runs a run-status sensor observes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorScope {
    All,
    Selected {
        jobs: Vec<JobSelector>,
        locations: Vec<String>,
    },
    /// Every job in the sensor's own location.
    SameLocation,
}

impl MonitorScope {
    pub fn matches(&self, sensor: &SensorId, event: &RunStatusEvent) -> bool {
        match self {
            MonitorScope::All => true,
            MonitorScope::SameLocation => event.location == sensor.location,
            MonitorScope::Selected { jobs, locations } => {
                locations.iter().any(|l| *l == event.location)
                    || jobs.iter().any(|j| j.matches(event))
            }
        }
    }
}

/// Declarative part of a sensor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorDefinition {
    pub id: SensorId,
    pub description: Option<String>,
    /// Spacing between the end of one tick and the start of the next.
    pub minimum_interval: Duration,
    /// Evaluation deadline. `None` uses the daemon default.
    pub max_duration: Option<Duration>,
    pub default_status: SensorStatus,
    pub kind: SensorKind,
    /// Resource keys the evaluation needs injected.
    #[serde(default)]
    pub required_resources: Vec<String>,
}

impl SensorDefinition {
    pub fn poll(id: SensorId, minimum_interval: Duration) -> Self {
        Self {
            id,
            description: None,
            minimum_interval,
            max_duration: None,
            default_status: SensorStatus::Running,
            kind: SensorKind::Poll,
            required_resources: Vec::new(),
        }
    }

    pub fn run_status(id: SensorId, target: RunStatusTarget) -> Self {
        Self {
            kind: SensorKind::RunStatus(target),
            ..Self::poll(id, Duration::ZERO)
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_max_duration(mut self, max_duration: Duration) -> Self {
        self.max_duration = Some(max_duration);
        self
    }

    pub fn stopped_by_default(mut self) -> Self {
        self.default_status = SensorStatus::Stopped;
        self
    }

    pub fn requires(mut self, resource: impl Into<String>) -> Self {
        self.required_resources.push(resource.into());
        self
    }
}

/// A validated definition bound to its evaluation logic.
pub struct Sensor {
    pub definition: SensorDefinition,
    scope: Option<MonitorScope>,
    evaluation: Arc<dyn SensorEvaluation>,
    resources: Resources,
}

impl Sensor {
    fn bind(
        definition: SensorDefinition,
        evaluation: Arc<dyn SensorEvaluation>,
        available: &Resources,
    ) -> Result<Self, DefinitionError> {
        let id = &definition.id;
        if id.name.trim().is_empty() || id.location.trim().is_empty() {
            return Err(DefinitionError::EmptyName);
        }
        if id.name.contains('/') {
            return Err(DefinitionError::SlashInName {
                sensor: id.to_string(),
            });
        }
        if definition.max_duration.is_some_and(|d| d.is_zero()) {
            return Err(DefinitionError::NonPositive {
                sensor: id.to_string(),
                field: "max_duration",
            });
        }
        let scope = match &definition.kind {
            SensorKind::Poll => {
                if definition.minimum_interval.is_zero() {
                    return Err(DefinitionError::NonPositive {
                        sensor: id.to_string(),
                        field: "minimum_interval",
                    });
                }
                None
            }
            SensorKind::RunStatus(target) => {
                if target.statuses.is_empty() {
                    return Err(DefinitionError::NoMonitoredStatus {
                        sensor: id.to_string(),
                    });
                }
                Some(target.scope(id)?)
            }
        };
        if let Some(missing) = definition
            .required_resources
            .iter()
            .find(|r| !available.contains(r))
        {
            return Err(DefinitionError::MissingResource {
                sensor: id.to_string(),
                resource: missing.clone(),
            });
        }
        let resources = available.scoped(&definition.required_resources);
        Ok(Self {
            definition,
            scope,
            evaluation,
            resources,
        })
    }

    pub fn id(&self) -> &SensorId {
        &self.definition.id
    }

    pub fn is_run_status(&self) -> bool {
        self.scope.is_some()
    }

    pub fn monitor_scope(&self) -> Option<&MonitorScope> {
        self.scope.as_ref()
    }

    /// Whether this run-status sensor wants `event`. Always false for poll sensors.
    pub fn observes(&self, event: &RunStatusEvent) -> bool {
        let (Some(scope), SensorKind::RunStatus(target)) = (&self.scope, &self.definition.kind)
        else {
            return false;
        };
        target.statuses.contains(&event.status) && scope.matches(self.id(), event)
    }

    pub(crate) fn evaluation(&self) -> Arc<dyn SensorEvaluation> {
        Arc::clone(&self.evaluation)
    }

    pub(crate) fn resources(&self) -> Resources {
        self.resources.clone()
    }
}

impl std::fmt::Debug for Sensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sensor")
            .field("definition", &self.definition)
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

/// The set of deployed sensors. Shared between the daemon loop, the
/// correlator and operator handles.
pub struct SensorRegistry {
    /// Injected into sensors at bind time.
    resources: Resources,
    sensors: RwLock<BTreeMap<SensorId, Arc<Sensor>>>,
}

impl SensorRegistry {
    pub fn new(resources: Resources) -> Self {
        Self {
            resources,
            sensors: RwLock::new(BTreeMap::new()),
        }
    }

    /// Validate and add one sensor. Identities must be unique.
    pub fn register(
        &self,
        definition: SensorDefinition,
        evaluation: Arc<dyn SensorEvaluation>,
    ) -> Result<(), DefinitionError> {
        let sensor = Sensor::bind(definition, evaluation, &self.resources)?;
        let mut sensors = self.sensors.write().unwrap_or_else(|e| e.into_inner());
        if sensors.contains_key(sensor.id()) {
            return Err(DefinitionError::Duplicate {
                sensor: sensor.id().to_string(),
            });
        }
        debug!(sensor = %sensor.id(), "sensor registered");
        sensors.insert(sensor.id().clone(), Arc::new(sensor));
        Ok(())
    }

    /// Swap in a reloaded definition set. All-or-nothing: one invalid
    /// definition leaves the current set untouched.
    pub fn replace(
        &self,
        definitions: Vec<(SensorDefinition, Arc<dyn SensorEvaluation>)>,
    ) -> Result<(), DefinitionError> {
        let mut next = BTreeMap::new();
        for (definition, evaluation) in definitions {
            let sensor = Sensor::bind(definition, evaluation, &self.resources)?;
            let id = sensor.id().clone();
            if next.insert(id.clone(), Arc::new(sensor)).is_some() {
                return Err(DefinitionError::Duplicate {
                    sensor: id.to_string(),
                });
            }
        }
        let count = next.len();
        *self.sensors.write().unwrap_or_else(|e| e.into_inner()) = next;
        info!(count, "sensor definitions reloaded");
        Ok(())
    }

    pub fn get(&self, id: &SensorId) -> Option<Arc<Sensor>> {
        self.sensors
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }

    pub fn contains(&self, id: &SensorId) -> bool {
        self.get(id).is_some()
    }

    /// Snapshot of every sensor, ordered by identity.
    pub fn all(&self) -> Vec<Arc<Sensor>> {
        self.sensors
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    pub fn poll_sensors(&self) -> Vec<Arc<Sensor>> {
        self.all().into_iter().filter(|s| !s.is_run_status()).collect()
    }

    pub fn run_status_sensors(&self) -> Vec<Arc<Sensor>> {
        self.all().into_iter().filter(|s| s.is_run_status()).collect()
    }
}
