use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use vigil_core::VigilConfig;

use crate::error::Result;
use crate::store::TickStore;
use crate::tick::TickRunner;

#[derive(Debug, Clone)]
pub struct DaemonSettings {
    /// How often due poll sensors are checked.
    pub loop_interval: Duration,
    pub housekeeping_interval: Duration,
}

impl DaemonSettings {
    pub fn from_config(config: &VigilConfig) -> Self {
        Self {
            loop_interval: Duration::from_millis(config.daemon.loop_interval_ms),
            housekeeping_interval: Duration::from_secs(config.daemon.housekeeping_interval_secs),
        }
    }
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self::from_config(&VigilConfig::default())
    }
}

/// Whether a poll sensor whose last tick ended at `last_end` may tick at `now`.
///
/// A sensor that never ticked is due immediately. The interval is measured
/// from the end of the previous tick, so a slow evaluation pushes the next
/// one back instead of piling up.
pub fn is_due(last_end: Option<DateTime<Utc>>, interval: Duration, now: DateTime<Utc>) -> bool {
    let Some(last_end) = last_end else {
        return true;
    };
    chrono::Duration::from_std(interval)
        .ok()
        .and_then(|interval| last_end.checked_add_signed(interval))
        .is_some_and(|next| now >= next)
}

/// The poll-sensor scheduling loop.
///
/// Each iteration launches every enabled, due, idle poll sensor on its own
/// task, up to the runner's free tick permits. Run-status sensors are driven
/// by the correlator instead.
pub struct SensorDaemon {
    runner: Arc<TickRunner>,
    settings: DaemonSettings,
    tasks: JoinSet<()>,
}

impl SensorDaemon {
    pub fn new(runner: Arc<TickRunner>, settings: DaemonSettings) -> Self {
        Self {
            runner,
            settings,
            tasks: JoinSet::new(),
        }
    }

    pub fn runner(&self) -> &Arc<TickRunner> {
        &self.runner
    }

    /// Launch ticks for every poll sensor that is due. Returns how many were launched.
    pub fn run_iteration(&mut self) -> Result<usize> {
        self.reap();
        let now = self.runner.clock().now();
        let mut launched = 0;
        // Launched tasks take their permit inside `run_tick`.
        let mut free = self.runner.available_permits();

        for sensor in self.runner.registry().poll_sensors() {
            let id = sensor.id();
            if self.runner.is_in_flight(id) {
                continue;
            }
            match self.runner.is_enabled(&sensor) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    warn!(sensor = %id, error = %e, "could not read sensor status");
                    continue;
                }
            }
            let last_end = self.runner.store().last_tick(id)?.map(|t| t.ended_at);
            if !is_due(last_end, sensor.definition.minimum_interval, now) {
                continue;
            }
            if free == 0 {
                debug!("tick concurrency limit reached; remaining sensors wait");
                break;
            }
            free -= 1;

            let runner = Arc::clone(&self.runner);
            self.tasks.spawn(async move {
                let id = sensor.id().clone();
                if let Err(e) = runner.run_tick(sensor, None).await {
                    error!(sensor = %id, error = %e, "tick aborted");
                }
            });
            launched += 1;
        }
        Ok(launched)
    }

    /// Wait for every launched tick to finish.
    pub async fn wait_idle(&mut self) {
        while let Some(joined) = self.tasks.join_next().await {
            log_join(joined);
        }
    }

    fn reap(&mut self) {
        while let Some(joined) = self.tasks.try_join_next() {
            log_join(joined);
        }
    }

    /// Main loop. Runs until `shutdown` broadcasts `true`, then lets
    /// in-flight ticks finish.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            sensors = self.runner.registry().poll_sensors().len(),
            free_permits = self.runner.available_permits(),
            "sensor daemon started"
        );

        let mut interval = tokio::time::interval(self.settings.loop_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut housekeeping = tokio::time::interval(self.settings.housekeeping_interval);
        housekeeping.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.run_iteration() {
                        error!("sensor daemon iteration error: {e}");
                    }
                }
                _ = housekeeping.tick() => {
                    if let Err(e) = self.runner.housekeep() {
                        error!("housekeeping failed: {e}");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!(in_flight = self.tasks.len(), "sensor daemon shutting down");
                        break;
                    }
                }
            }
        }
        self.wait_idle().await;
        info!("sensor daemon stopped");
    }
}

fn log_join(joined: std::result::Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        if e.is_panic() {
            error!(error = %e, "tick task panicked");
        }
    }
}
