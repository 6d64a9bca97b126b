//! Run-status sensors: evaluation driven by the execution engine's
//! run-status event stream instead of polling.
//!
//! The correlator subscribes once, matches each event against every
//! run-status sensor's monitoring scope, and queues it on that sensor's
//! worker. Workers process their queue one event at a time, so a sensor's
//! ticks stay serialized while different sensors run in parallel.
//!
//! Delivery is at-least-once. Each sensor keeps a watermark (highest event
//! id it recorded a tick for); redelivered events at or below it are
//! dropped before evaluation. Keyed run requests are additionally covered
//! by the run-key index, like any other sensor.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures_util::stream::{BoxStream, StreamExt};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::definition::Sensor;
use crate::error::{Result, SensorError};
use crate::store::WatermarkStore;
use crate::tick::TickRunner;
use crate::types::{RunStatusEvent, SensorId, TickRecord};

const WORKER_QUEUE: usize = 64;

#[derive(Debug, Clone, Copy, Default)]
pub struct EventFilter {
    /// Replay stored events with a greater id before going live.
    /// `None` starts at the live tail.
    pub after_event_id: Option<i64>,
}

/// Push-based run-status event feed.
#[async_trait]
pub trait RunStatusEventSource: Send + Sync {
    async fn subscribe(&self, filter: EventFilter) -> Result<BoxStream<'static, RunStatusEvent>>;
}

struct History {
    events: Vec<RunStatusEvent>,
    next_id: i64,
}

/// In-process event source: keeps every published event and fans them out
/// over a broadcast channel.
pub struct BroadcastEventSource {
    history: Mutex<History>,
    tx: broadcast::Sender<RunStatusEvent>,
}

impl BroadcastEventSource {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            history: Mutex::new(History {
                events: Vec::new(),
                next_id: 1,
            }),
            tx,
        }
    }

    /// Store `event` under the next id and deliver it to live subscribers.
    pub fn publish(&self, mut event: RunStatusEvent) -> RunStatusEvent {
        let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        event.event_id = history.next_id;
        history.next_id += 1;
        history.events.push(event.clone());
        // No subscribers is fine; the event is still replayable.
        let _ = self.tx.send(event.clone());
        event
    }

    /// Deliver an already-published event a second time.
    pub fn redeliver(&self, event_id: i64) -> bool {
        let history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        match history.events.iter().find(|e| e.event_id == event_id) {
            Some(event) => {
                let _ = self.tx.send(event.clone());
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl RunStatusEventSource for BroadcastEventSource {
    async fn subscribe(&self, filter: EventFilter) -> Result<BoxStream<'static, RunStatusEvent>> {
        // Subscribing under the history lock leaves no gap between replay and live.
        let (backlog, mut rx) = {
            let history = self.history.lock().unwrap_or_else(|e| e.into_inner());
            let backlog: Vec<_> = match filter.after_event_id {
                Some(after) => history
                    .events
                    .iter()
                    .filter(|e| e.event_id > after)
                    .cloned()
                    .collect(),
                None => Vec::new(),
            };
            (backlog, self.tx.subscribe())
        };

        let stream = async_stream::stream! {
            for event in backlog {
                yield event;
            }
            loop {
                match rx.recv().await {
                    Ok(event) => yield event,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "run-status subscriber lagged; events lost");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        };
        Ok(stream.boxed())
    }
}

/// Routes run-status events to run-status sensors.
pub struct RunStatusCorrelator {
    runner: Arc<TickRunner>,
    source: Arc<dyn RunStatusEventSource>,
    workers: HashMap<SensorId, mpsc::Sender<RunStatusEvent>>,
    tasks: JoinSet<()>,
}

impl RunStatusCorrelator {
    pub fn new(runner: Arc<TickRunner>, source: Arc<dyn RunStatusEventSource>) -> Self {
        Self {
            runner,
            source,
            workers: HashMap::new(),
            tasks: JoinSet::new(),
        }
    }

    /// Where to resume the stream: the lowest watermark among run-status
    /// sensors, or the live tail if none has processed anything yet.
    pub fn resume_point(&self) -> Result<Option<i64>> {
        let mut lowest: Option<i64> = None;
        for sensor in self.runner.registry().run_status_sensors() {
            if let Some(mark) = self.runner.store().watermark(sensor.id())? {
                lowest = Some(lowest.map_or(mark, |l| l.min(mark)));
            }
        }
        Ok(lowest)
    }

    /// Queue `event` on every sensor whose scope matches. Returns how many matched.
    ///
    /// Waits while a matching sensor's queue is full, which holds back the
    /// whole stream until that sensor catches up. Events are never dropped
    /// here: a dropped event would sit below a later watermark and be lost.
    pub async fn route(&mut self, event: RunStatusEvent) -> usize {
        let matching: Vec<_> = self
            .runner
            .registry()
            .run_status_sensors()
            .into_iter()
            .filter(|s| s.observes(&event))
            .filter(|s| match self.runner.is_enabled(s) {
                Ok(enabled) => enabled,
                Err(e) => {
                    warn!(sensor = %s.id(), error = %e, "could not read sensor status");
                    false
                }
            })
            .collect();
        if matching.is_empty() {
            debug!(event_id = event.event_id, job = %event.job_name, "no sensor observes event");
            return 0;
        }
        for sensor in &matching {
            let tx = self.worker(sensor.id());
            if tx.send(event.clone()).await.is_err() {
                warn!(sensor = %sensor.id(), event_id = event.event_id, "sensor worker gone; event dropped");
            }
        }
        matching.len()
    }

    fn worker(&mut self, id: &SensorId) -> mpsc::Sender<RunStatusEvent> {
        if let Some(tx) = self.workers.get(id).filter(|tx| !tx.is_closed()) {
            return tx.clone();
        }
        let (tx, mut rx) = mpsc::channel::<RunStatusEvent>(WORKER_QUEUE);
        let runner = Arc::clone(&self.runner);
        let id = id.clone();
        self.workers.insert(id.clone(), tx.clone());
        self.tasks.spawn(async move {
            while let Some(event) = rx.recv().await {
                // Look up per event so reloaded definitions take effect.
                let Some(sensor) = runner.registry().get(&id) else {
                    debug!(sensor = %id, "sensor removed; dropping event");
                    continue;
                };
                let event_id = event.event_id;
                if let Err(e) = Self::deliver(&runner, sensor, event).await {
                    error!(sensor = %id, event_id, error = %e, "run-status tick aborted");
                }
            }
        });
        tx
    }

    /// Tick `sensor` for one event unless its watermark shows the event was
    /// already handled. Advances the watermark when a tick is recorded.
    pub async fn deliver(
        runner: &TickRunner,
        sensor: Arc<Sensor>,
        event: RunStatusEvent,
    ) -> Result<Option<TickRecord>> {
        let id = sensor.id().clone();
        let event_id = event.event_id;
        if runner
            .store()
            .watermark(&id)?
            .is_some_and(|mark| event_id <= mark)
        {
            debug!(sensor = %id, event_id, "event already processed; skipped");
            return Ok(None);
        }
        let record = runner.run_tick(sensor, Some(event)).await?;
        if record.is_some() {
            runner.store().advance_watermark(&id, event_id)?;
        }
        Ok(record)
    }

    /// Stop accepting events and wait for queued ones to be processed.
    pub async fn drain(&mut self) {
        self.workers.clear();
        while let Some(joined) = self.tasks.join_next().await {
            if let Err(e) = joined {
                if e.is_panic() {
                    error!(error = %e, "run-status worker panicked");
                }
            }
        }
    }

    /// Subscribe and route events until `shutdown` broadcasts `true`.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let after_event_id = self.resume_point()?;
        let mut events = self
            .source
            .subscribe(EventFilter { after_event_id })
            .await?;
        info!(
            sensors = self.runner.registry().run_status_sensors().len(),
            after_event_id,
            "run-status correlator started"
        );

        loop {
            tokio::select! {
                next = events.next() => match next {
                    Some(event) => {
                        self.route(event).await;
                    }
                    None => {
                        self.drain().await;
                        return Err(SensorError::EventSource("run-status stream ended".into()));
                    }
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("run-status correlator shutting down");
                        break;
                    }
                }
            }
        }
        self.drain().await;
        Ok(())
    }
}
