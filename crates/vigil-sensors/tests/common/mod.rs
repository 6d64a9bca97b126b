#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use rusqlite::Connection;
use vigil_sensors::{
    DispatchError, ManualClock, RunDispatcher, RunRequest, Sensor, SensorDefinition,
    SensorEvaluation, SensorId, SensorRegistry, SqliteSensorStore, TickRecord, TickRunner,
    TickSettings,
};
use vigil_sensors::resources::Resources;

/// Launcher double: records submissions and fails on demand.
#[derive(Default)]
pub struct Launcher {
    pub submitted: Mutex<Vec<RunRequest>>,
    pub failures: Mutex<VecDeque<DispatchError>>,
    pub delays: Mutex<VecDeque<Duration>>,
}

impl Launcher {
    pub fn fail_next(&self, error: DispatchError) {
        self.failures.lock().unwrap().push_back(error);
    }

    /// Make the next submission take `delay` before answering.
    pub fn delay_next(&self, delay: Duration) {
        self.delays.lock().unwrap().push_back(delay);
    }

    pub fn keys(&self) -> Vec<Option<String>> {
        self.submitted
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.run_key.clone())
            .collect()
    }

    pub fn jobs(&self) -> Vec<String> {
        self.submitted
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.job_name.clone())
            .collect()
    }
}

#[async_trait]
impl RunDispatcher for Launcher {
    async fn submit(&self, _sensor: &SensorId, request: &RunRequest) -> Result<String, DispatchError> {
        let delay = self.delays.lock().unwrap().pop_front();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = self.failures.lock().unwrap().pop_front() {
            return Err(error);
        }
        let mut submitted = self.submitted.lock().unwrap();
        submitted.push(request.clone());
        Ok(format!("run-{}", submitted.len()))
    }
}

pub struct Harness {
    pub registry: Arc<SensorRegistry>,
    pub store: Arc<SqliteSensorStore>,
    pub launcher: Arc<Launcher>,
    pub clock: Arc<ManualClock>,
    pub runner: Arc<TickRunner>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_resources(Resources::new())
    }

    pub fn with_resources(resources: Resources) -> Self {
        Self::build(resources, TickSettings::default())
    }

    pub fn with_settings(settings: TickSettings) -> Self {
        Self::build(Resources::new(), settings)
    }

    fn build(resources: Resources, settings: TickSettings) -> Self {
        let registry = Arc::new(SensorRegistry::new(resources));
        let store = Arc::new(SqliteSensorStore::new(Connection::open_in_memory().unwrap()).unwrap());
        let launcher = Arc::new(Launcher::default());
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
        ));
        let runner = Arc::new(
            TickRunner::new(
                store.clone(),
                launcher.clone(),
                registry.clone(),
                settings,
            )
            .with_clock(clock.clone()),
        );
        Self {
            registry,
            store,
            launcher,
            clock,
            runner,
        }
    }

    pub fn register(
        &self,
        definition: SensorDefinition,
        evaluation: Arc<dyn SensorEvaluation>,
    ) -> Arc<Sensor> {
        let id = definition.id.clone();
        self.registry.register(definition, evaluation).unwrap();
        self.registry.get(&id).unwrap()
    }

    /// Run one tick and expect it to be recorded.
    pub async fn tick(&self, sensor: &Arc<Sensor>) -> TickRecord {
        self.runner
            .run_tick(sensor.clone(), None)
            .await
            .unwrap()
            .expect("tick recorded")
    }
}
