// End-to-end tick behaviour: dedup, cursor persistence, deadlines, dispatch
// failures and interval spacing.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::Harness;
use vigil_sensors::store::{CursorStore, RunKeyIndex, SensorStateStore, TickStore};
use vigil_sensors::{
    sensor_fn, DaemonSettings, DispatchError, EvaluationError, RunRequest, SensorDaemon,
    SensorDefinition, SensorId, SensorStatus, TickQuery, TickStatus,
};

fn poll(name: &str, secs: u64) -> SensorDefinition {
    SensorDefinition::poll(SensorId::new("etl", name), Duration::from_secs(secs))
}

#[tokio::test]
async fn growing_list_dispatches_only_new_keys() {
    let h = Harness::new();
    let items = Arc::new(Mutex::new(vec!["a".to_string()]));
    let seen = Arc::clone(&items);
    let sensor = h.register(
        poll("files", 5),
        sensor_fn(move |ctx| {
            let items = seen.lock().unwrap().clone();
            async move {
                for item in items {
                    ctx.request_run(RunRequest::new("ingest").with_run_key(item)).await?;
                }
                Ok(())
            }
        }),
    );

    let first = h.tick(&sensor).await;
    assert_eq!(first.status, TickStatus::Success);
    assert_eq!(first.run_keys().collect::<Vec<_>>(), vec!["a"]);

    items.lock().unwrap().push("b".to_string());
    let second = h.tick(&sensor).await;
    assert_eq!(second.status, TickStatus::Success);
    assert_eq!(second.dispatched.len(), 1);
    assert_eq!(second.dispatched[0].run_key.as_deref(), Some("b"));
    assert_eq!(second.suppressed_keys, vec!["a"]);

    assert_eq!(h.launcher.keys(), vec![Some("a".into()), Some("b".into())]);
}

#[tokio::test]
async fn a_key_is_dispatched_at_most_once() {
    let h = Harness::new();
    let sensor = h.register(
        poll("steady", 5),
        sensor_fn(|ctx| async move {
            ctx.request_run(RunRequest::new("job").with_run_key("k")).await?;
            ctx.request_run(RunRequest::new("job").with_run_key("k")).await?;
            Ok(())
        }),
    );
    for _ in 0..5 {
        h.tick(&sensor).await;
        h.clock.advance(chrono::Duration::seconds(5));
    }
    assert_eq!(h.launcher.keys(), vec![Some("k".into())]);

    let history = h.store.ticks(sensor.id(), &TickQuery::latest(10)).unwrap();
    assert_eq!(history.len(), 5);
    assert_eq!(history[0].status, TickStatus::Skipped);
    assert_eq!(history[4].status, TickStatus::Success);
    assert_eq!(history[4].suppressed_keys, vec!["k"]);
}

#[tokio::test]
async fn nil_keys_always_dispatch() {
    let h = Harness::new();
    let sensor = h.register(
        poll("unkeyed", 5),
        sensor_fn(|ctx| async move {
            ctx.request_run(RunRequest::new("job")).await?;
            ctx.request_run(RunRequest::new("job")).await?;
            Ok(())
        }),
    );
    let first = h.tick(&sensor).await;
    assert_eq!(first.dispatched.len(), 2);
    h.tick(&sensor).await;
    assert_eq!(h.launcher.keys(), vec![None, None, None, None]);
}

#[tokio::test]
async fn cursor_written_on_success_is_seen_next_tick() {
    let h = Harness::new();
    let observed = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&observed);
    let sensor = h.register(
        poll("cursor", 5),
        sensor_fn(move |ctx| {
            let log = Arc::clone(&log);
            async move {
                log.lock().unwrap().push(ctx.cursor().map(str::to_string));
                ctx.update_cursor("v")?;
                ctx.skip("nothing to do");
                Ok(())
            }
        }),
    );
    let first = h.tick(&sensor).await;
    assert_eq!(first.status, TickStatus::Skipped);
    assert_eq!(first.skip_reason.as_deref(), Some("nothing to do"));
    assert_eq!(first.cursor.as_deref(), Some("v"));
    h.tick(&sensor).await;

    assert_eq!(*observed.lock().unwrap(), vec![None, Some("v".to_string())]);
}

#[tokio::test]
async fn cursor_from_timed_out_tick_is_discarded() {
    let h = Harness::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let observed = Arc::new(Mutex::new(Vec::new()));
    let (count, log) = (Arc::clone(&calls), Arc::clone(&observed));
    let sensor = h.register(
        poll("slow", 5).with_max_duration(Duration::from_millis(50)),
        sensor_fn(move |ctx| {
            let call = count.fetch_add(1, Ordering::SeqCst);
            let log = Arc::clone(&log);
            async move {
                log.lock().unwrap().push(ctx.cursor().map(str::to_string));
                if call == 0 {
                    ctx.update_cursor("v")?;
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                }
                Ok(())
            }
        }),
    );
    h.store.set_cursor(sensor.id(), Some("before")).unwrap();

    let first = h.tick(&sensor).await;
    assert_eq!(first.status, TickStatus::Timeout);
    assert!(first.cursor.is_none());
    assert!(first.error.as_deref().unwrap().contains("deadline"));

    let second = h.tick(&sensor).await;
    assert_eq!(second.status, TickStatus::Skipped);
    assert_eq!(
        *observed.lock().unwrap(),
        vec![Some("before".to_string()), Some("before".to_string())]
    );
}

#[tokio::test]
async fn slow_launch_past_deadline_is_still_recorded() {
    let h = Harness::new();
    let sensor = h.register(
        poll("slow-launch", 5).with_max_duration(Duration::from_millis(100)),
        sensor_fn(|ctx| async move {
            ctx.request_run(RunRequest::new("job").with_run_key("a")).await?;
            Ok(())
        }),
    );
    h.launcher.delay_next(Duration::from_millis(500));

    let first = h.tick(&sensor).await;
    assert_eq!(first.status, TickStatus::Timeout);
    assert_eq!(first.run_keys().collect::<Vec<_>>(), vec!["a"]);
    assert_eq!(first.dispatched[0].run_id.as_deref(), Some("run-1"));
    assert_eq!(h.launcher.keys(), vec![Some("a".into())]);
    let entry = h.store.lookup_run_key(sensor.id(), "a").unwrap().unwrap();
    assert_eq!(entry.run_id.as_deref(), Some("run-1"));

    let second = h.tick(&sensor).await;
    assert_eq!(second.status, TickStatus::Skipped);
    assert_eq!(second.suppressed_keys, vec!["a"]);
    assert_eq!(h.launcher.keys(), vec![Some("a".into())]);
}

#[tokio::test]
async fn failure_after_yield_dispatches_and_keeps_cursor() {
    let h = Harness::new();
    let sensor = h.register(
        poll("flaky", 5),
        sensor_fn(|ctx| async move {
            ctx.request_run(RunRequest::new("job").with_run_key("x")).await?;
            ctx.request_run(RunRequest::new("job").with_run_key("y")).await?;
            Err(EvaluationError::failed("upstream returned 500"))
        }),
    );
    h.store.set_cursor(sensor.id(), Some("c0")).unwrap();

    let record = h.tick(&sensor).await;
    assert_eq!(record.status, TickStatus::Failure);
    assert_eq!(record.run_keys().collect::<Vec<_>>(), vec!["x", "y"]);
    assert!(record.error.as_deref().unwrap().contains("upstream returned 500"));
    assert_eq!(h.launcher.keys(), vec![Some("x".into()), Some("y".into())]);
    assert_eq!(h.store.cursor(sensor.id()).unwrap().as_deref(), Some("c0"));
    assert_eq!(
        h.store.lookup_run_key(sensor.id(), "x").unwrap().unwrap().run_id.as_deref(),
        Some("run-1")
    );
}

#[tokio::test]
async fn panicking_evaluation_is_a_failed_tick() {
    let h = Harness::new();
    let sensor = h.register(
        poll("buggy", 5),
        sensor_fn(|_ctx| async move {
            let items: Vec<u32> = Vec::new();
            let _fourth = items[3];
            Ok(())
        }),
    );
    let record = h.tick(&sensor).await;
    assert_eq!(record.status, TickStatus::Failure);
    assert!(record.error.as_deref().unwrap().contains("panicked"));
}

#[tokio::test]
async fn transient_dispatch_failure_is_retried_next_tick() {
    let h = Harness::new();
    let sensor = h.register(
        poll("retry", 5),
        sensor_fn(|ctx| async move {
            ctx.update_cursor("advanced")?;
            ctx.request_run(RunRequest::new("job").with_run_key("k")).await?;
            Ok(())
        }),
    );
    h.launcher
        .fail_next(DispatchError::Transient("launcher restarting".into()));

    let first = h.tick(&sensor).await;
    assert_eq!(first.status, TickStatus::Failure);
    assert!(first.dispatched.is_empty());
    assert!(h.store.lookup_run_key(sensor.id(), "k").unwrap().is_none());
    assert!(h.store.cursor(sensor.id()).unwrap().is_none());

    let second = h.tick(&sensor).await;
    assert_eq!(second.status, TickStatus::Success);
    assert_eq!(h.launcher.keys(), vec![Some("k".into())]);
}

#[tokio::test]
async fn permanent_dispatch_failure_keeps_the_key() {
    let h = Harness::new();
    let sensor = h.register(
        poll("rejected", 5),
        sensor_fn(|ctx| async move {
            ctx.request_run(RunRequest::new("missing_job").with_run_key("k")).await?;
            Ok(())
        }),
    );
    h.launcher
        .fail_next(DispatchError::Permanent("no such job".into()));

    let first = h.tick(&sensor).await;
    assert_eq!(first.status, TickStatus::Failure);
    assert_eq!(first.dispatched.len(), 1);
    assert!(first.dispatched[0].run_id.is_none());

    let second = h.tick(&sensor).await;
    assert_eq!(second.status, TickStatus::Skipped);
    assert_eq!(second.suppressed_keys, vec!["k"]);
    assert!(h.launcher.keys().is_empty());
}

#[tokio::test]
async fn interval_is_measured_from_tick_end() {
    let h = Harness::new();
    let clock = Arc::clone(&h.clock);
    let sensor = h.register(
        poll("forty", 30),
        sensor_fn(move |_ctx| {
            // Simulates a 40s evaluation.
            clock.advance(chrono::Duration::seconds(40));
            async { Ok(()) }
        }),
    );
    let mut daemon = SensorDaemon::new(Arc::clone(&h.runner), DaemonSettings::default());

    assert_eq!(daemon.run_iteration().unwrap(), 1);
    daemon.wait_idle().await;

    h.clock.advance(chrono::Duration::seconds(20));
    assert_eq!(daemon.run_iteration().unwrap(), 0);

    h.clock.advance(chrono::Duration::seconds(10));
    assert_eq!(daemon.run_iteration().unwrap(), 1);
    daemon.wait_idle().await;

    let history = h.store.ticks(sensor.id(), &TickQuery::latest(2)).unwrap();
    let (second, first) = (&history[0], &history[1]);
    assert_eq!(first.ended_at - first.started_at, chrono::Duration::seconds(40));
    assert!(second.started_at - first.ended_at >= chrono::Duration::seconds(30));
}

#[tokio::test]
async fn stopped_sensor_is_not_scheduled() {
    let h = Harness::new();
    let sensor = h.register(poll("paused", 5), sensor_fn(|_ctx| async { Ok(()) }));
    h.store
        .set_sensor_status(sensor.id(), SensorStatus::Stopped)
        .unwrap();

    let mut daemon = SensorDaemon::new(Arc::clone(&h.runner), DaemonSettings::default());
    assert_eq!(daemon.run_iteration().unwrap(), 0);
    assert!(h.runner.run_tick(sensor.clone(), None).await.unwrap().is_none());
    assert!(h.store.last_tick(sensor.id()).unwrap().is_none());
}

#[tokio::test]
async fn stopping_mid_tick_discards_the_outcome() {
    let h = Harness::new();
    let store = Arc::clone(&h.store);
    let sensor = h.register(
        poll("stopping", 5),
        sensor_fn(move |ctx| {
            let store = Arc::clone(&store);
            async move {
                ctx.update_cursor("v")?;
                store
                    .set_sensor_status(ctx.sensor_id(), SensorStatus::Stopped)
                    .map_err(|e| EvaluationError::failed(e.to_string()))?;
                ctx.request_run(RunRequest::new("job").with_run_key("k")).await?;
                Ok(())
            }
        }),
    );
    assert!(h.runner.run_tick(sensor.clone(), None).await.unwrap().is_none());
    assert!(h.store.last_tick(sensor.id()).unwrap().is_none());
    assert!(h.store.cursor(sensor.id()).unwrap().is_none());
    // Already-dispatched work stays dispatched and deduplicated.
    assert_eq!(h.launcher.keys(), vec![Some("k".into())]);
}

#[tokio::test]
async fn state_survives_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("vigil.db");
    let id = SensorId::new("etl", "restart");

    for expected in [TickStatus::Success, TickStatus::Skipped] {
        let conn = rusqlite::Connection::open(&path).unwrap();
        let store = Arc::new(vigil_sensors::SqliteSensorStore::new(conn).unwrap());
        let registry = Arc::new(vigil_sensors::SensorRegistry::new(Default::default()));
        registry
            .register(
                SensorDefinition::poll(id.clone(), Duration::from_secs(5)),
                sensor_fn(|ctx| async move {
                    let next = ctx.cursor().map_or(1, |c| c.parse::<u32>().unwrap_or(0) + 1);
                    ctx.request_run(RunRequest::new("job").with_run_key("once")).await?;
                    ctx.update_cursor(next.to_string())?;
                    Ok(())
                }),
            )
            .unwrap();
        let launcher = Arc::new(common::Launcher::default());
        let runner = vigil_sensors::TickRunner::new(
            store.clone(),
            launcher,
            registry.clone(),
            vigil_sensors::TickSettings::default(),
        );
        let record = runner
            .run_tick(registry.get(&id).unwrap(), None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.status, expected);
    }

    let conn = rusqlite::Connection::open(&path).unwrap();
    let store = vigil_sensors::SqliteSensorStore::new(conn).unwrap();
    assert_eq!(store.cursor(&id).unwrap().as_deref(), Some("2"));
    assert_eq!(store.ticks(&id, &TickQuery::default()).unwrap().len(), 2);
}
