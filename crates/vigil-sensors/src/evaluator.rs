//! Runs one sensor evaluation under a hard deadline.
//!
//! The evaluation runs on its own task and streams run requests through a
//! bounded channel. Each request is handed to the [`RequestSink`] as soon as
//! it is yielded, so requests produced before a later failure are still
//! dispatched. On deadline the task is aborted and the context's
//! cancellation token fired; adapters that honour the token stop their I/O,
//! others are dropped at their next await point.
//!
//! The deadline bounds the evaluation, not the sink. A request already
//! handed to the sink is seen through to the launcher's answer, so a claimed
//! run key is always either confirmed or released.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::context::{ContextParts, SensorContext, TickScratch};
use crate::definition::Sensor;
use crate::error::{DispatchError, EvaluationError, TickError};
use crate::types::{RunRequest, RunStatusEvent};

/// Receives yielded requests in order. Returning an error stops the tick.
#[async_trait]
pub trait RequestSink: Send {
    async fn offer(&mut self, request: RunRequest) -> Result<(), DispatchError>;
}

/// One evaluation's inputs.
pub struct EvaluationInput {
    pub sensor: Arc<Sensor>,
    /// Snapshot read before the tick.
    pub cursor: Option<String>,
    pub last_tick_at: Option<DateTime<Utc>>,
    pub now: DateTime<Utc>,
    pub run_status: Option<RunStatusEvent>,
    pub deadline: Duration,
}

/// Classified result of one evaluation.
#[derive(Debug)]
pub struct Evaluation {
    /// `None` when the evaluation ran to completion.
    pub error: Option<TickError>,
    /// Cursor the tick may persist, already filtered by outcome.
    pub cursor_update: Option<String>,
    pub skip_reason: Option<String>,
}

impl Evaluation {
    pub fn timed_out(&self) -> bool {
        matches!(self.error, Some(TickError::Timeout { .. }))
    }
}

enum Driven {
    Finished(Result<Result<(), EvaluationError>, tokio::task::JoinError>),
    DispatchFailed { job: String, error: DispatchError },
    TimedOut,
}

/// Evaluate `input.sensor` once, forwarding yielded requests to `sink`.
pub async fn evaluate<K>(input: EvaluationInput, sink: &mut K) -> Evaluation
where
    K: RequestSink + ?Sized,
{
    let sensor_id = input.sensor.id().clone();
    let (tx, mut rx) = mpsc::channel(1);
    let scratch = Arc::new(Mutex::new(TickScratch::default()));
    let cancel = CancellationToken::new();

    let ctx = SensorContext::from_parts(ContextParts {
        sensor_id: sensor_id.clone(),
        cursor: input.cursor,
        last_tick_at: input.last_tick_at,
        now: input.now,
        resources: input.sensor.resources(),
        run_status: input.run_status,
        cancel: cancel.clone(),
        requests: tx,
        scratch: Arc::clone(&scratch),
    });

    let evaluation = input.sensor.evaluation();
    let mut handle = tokio::spawn(async move { evaluation.evaluate(ctx).await });

    let deadline = Instant::now() + input.deadline;
    let driven = drive(&mut rx, &mut handle, sink, deadline).await;

    let error = match driven {
        Driven::TimedOut => {
            cancel.cancel();
            handle.abort();
            warn!(sensor = %sensor_id, deadline_secs = input.deadline.as_secs_f64(), "evaluation timed out");
            Some(TickError::Timeout {
                after: input.deadline,
            })
        }
        Driven::DispatchFailed { job, error } => {
            cancel.cancel();
            handle.abort();
            Some(TickError::Dispatch { job, source: error })
        }
        Driven::Finished(Ok(Ok(()))) => None,
        Driven::Finished(Ok(Err(e))) => Some(TickError::Evaluation(e)),
        Driven::Finished(Err(join_error)) => Some(TickError::Panicked(panic_message(join_error))),
    };

    let scratch = std::mem::take(&mut *scratch.lock().unwrap_or_else(|e| e.into_inner()));
    // A timed-out or dispatch-aborted tick never persists partial progress.
    // An erroring evaluation keeps a cursor it explicitly wrote before failing.
    let cursor_update = match &error {
        None | Some(TickError::Evaluation(_)) | Some(TickError::Panicked(_)) => scratch.cursor_update,
        Some(_) => None,
    };

    debug!(sensor = %sensor_id, failed = error.is_some(), "evaluation finished");
    Evaluation {
        error,
        cursor_update,
        skip_reason: scratch.skip_reason,
    }
}

async fn drive<K>(
    rx: &mut mpsc::Receiver<RunRequest>,
    handle: &mut JoinHandle<Result<(), EvaluationError>>,
    sink: &mut K,
    deadline: Instant,
) -> Driven
where
    K: RequestSink + ?Sized,
{
    let mut joined = None;
    let mut open = true;
    loop {
        if !open {
            if let Some(result) = joined.take() {
                return Driven::Finished(result);
            }
        }
        tokio::select! {
            biased;
            _ = tokio::time::sleep_until(deadline) => return Driven::TimedOut,
            next = rx.recv(), if open => match next {
                // Not raced against the deadline: the sink may already hold a
                // run key claim for this request.
                Some(request) => {
                    let job = request.job_name.clone();
                    if let Err(error) = sink.offer(request).await {
                        return Driven::DispatchFailed { job, error };
                    }
                }
                None => open = false,
            },
            result = &mut *handle, if joined.is_none() => {
                joined = Some(result);
                // The context may have been moved somewhere that outlives the
                // evaluation; stop accepting and drain what is buffered.
                rx.close();
            }
        }
    }
}

fn panic_message(error: tokio::task::JoinError) -> String {
    if !error.is_panic() {
        return error.to_string();
    }
    let payload = error.into_panic();
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{sensor_fn, SensorDefinition, SensorEvaluation, SensorRegistry};
    use crate::resources::Resources;
    use crate::types::SensorId;

    #[derive(Default)]
    struct Collect {
        seen: Vec<RunRequest>,
        fail_on: Option<String>,
    }

    #[async_trait]
    impl RequestSink for Collect {
        async fn offer(&mut self, request: RunRequest) -> Result<(), DispatchError> {
            if self.fail_on.as_deref() == request.run_key.as_deref() {
                return Err(DispatchError::Transient("launcher down".into()));
            }
            self.seen.push(request);
            Ok(())
        }
    }

    fn input(evaluation: Arc<dyn SensorEvaluation>, deadline: Duration) -> EvaluationInput {
        let registry = SensorRegistry::new(Resources::new());
        let id = SensorId::new("loc", "s");
        registry
            .register(SensorDefinition::poll(id.clone(), Duration::from_secs(30)), evaluation)
            .expect("register");
        EvaluationInput {
            sensor: registry.get(&id).expect("sensor"),
            cursor: Some("before".into()),
            last_tick_at: None,
            now: Utc::now(),
            run_status: None,
            deadline,
        }
    }

    fn keys(sink: &Collect) -> Vec<Option<String>> {
        sink.seen.iter().map(|r| r.run_key.clone()).collect()
    }

    #[tokio::test]
    async fn completed_evaluation_keeps_cursor_and_order() {
        let eval = sensor_fn(|ctx| async move {
            assert_eq!(ctx.cursor(), Some("before"));
            ctx.request_run(RunRequest::new("job").with_run_key("1")).await?;
            ctx.request_run(RunRequest::new("job").with_run_key("2")).await?;
            ctx.update_cursor("after")?;
            Ok(())
        });
        let mut sink = Collect::default();
        let result = evaluate(input(eval, Duration::from_secs(5)), &mut sink).await;
        assert!(result.error.is_none());
        assert_eq!(result.cursor_update.as_deref(), Some("after"));
        assert_eq!(keys(&sink), vec![Some("1".into()), Some("2".into())]);
    }

    #[tokio::test]
    async fn timeout_discards_cursor_and_cancels() {
        let token = Arc::new(Mutex::new(None));
        let seen = Arc::clone(&token);
        let eval = sensor_fn(move |ctx| {
            let seen = Arc::clone(&seen);
            async move {
                ctx.update_cursor("partial")?;
                *seen.lock().unwrap() = Some(ctx.cancellation().clone());
                std::future::pending::<()>().await;
                Ok(())
            }
        });
        let mut sink = Collect::default();
        let result = evaluate(input(eval, Duration::from_millis(50)), &mut sink).await;
        assert!(result.timed_out());
        assert!(result.cursor_update.is_none());
        let token: Option<CancellationToken> = token.lock().unwrap().clone();
        assert!(token.expect("evaluation started").is_cancelled());
    }

    #[tokio::test]
    async fn error_after_yield_keeps_yielded_requests() {
        let eval = sensor_fn(|ctx| async move {
            ctx.request_run(RunRequest::new("job").with_run_key("x")).await?;
            ctx.request_run(RunRequest::new("job").with_run_key("y")).await?;
            Err(EvaluationError::failed("boom"))
        });
        let mut sink = Collect::default();
        let result = evaluate(input(eval, Duration::from_secs(5)), &mut sink).await;
        assert!(matches!(result.error, Some(TickError::Evaluation(_))));
        assert!(result.cursor_update.is_none());
        assert_eq!(keys(&sink), vec![Some("x".into()), Some("y".into())]);
    }

    #[tokio::test]
    async fn error_keeps_cursor_written_before_failure() {
        let eval = sensor_fn(|ctx| async move {
            ctx.update_cursor("checkpoint")?;
            Err(anyhow::anyhow!("downstream unavailable").into())
        });
        let mut sink = Collect::default();
        let result = evaluate(input(eval, Duration::from_secs(5)), &mut sink).await;
        assert!(matches!(result.error, Some(TickError::Evaluation(_))));
        assert_eq!(result.cursor_update.as_deref(), Some("checkpoint"));
    }

    fn explode() -> Result<(), EvaluationError> {
        panic!("sensor bug")
    }

    #[tokio::test]
    async fn panic_is_isolated() {
        let eval = sensor_fn(|_ctx| async move { explode() });
        let mut sink = Collect::default();
        let result = evaluate(input(eval, Duration::from_secs(5)), &mut sink).await;
        match result.error {
            Some(TickError::Panicked(message)) => assert_eq!(message, "sensor bug"),
            other => panic!("expected panic outcome, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn dispatch_failure_stops_the_tick() {
        let eval = sensor_fn(|ctx| async move {
            ctx.update_cursor("after")?;
            for key in ["1", "2", "3"] {
                ctx.request_run(RunRequest::new("job").with_run_key(key)).await?;
            }
            Ok(())
        });
        let mut sink = Collect {
            fail_on: Some("2".into()),
            ..Collect::default()
        };
        let result = evaluate(input(eval, Duration::from_secs(5)), &mut sink).await;
        assert!(matches!(result.error, Some(TickError::Dispatch { .. })));
        assert!(result.cursor_update.is_none());
        assert_eq!(keys(&sink), vec![Some("1".into())]);
    }

    struct Slow {
        delay: Duration,
        seen: Vec<RunRequest>,
    }

    #[async_trait]
    impl RequestSink for Slow {
        async fn offer(&mut self, request: RunRequest) -> Result<(), DispatchError> {
            tokio::time::sleep(self.delay).await;
            self.seen.push(request);
            Ok(())
        }
    }

    #[tokio::test]
    async fn offer_in_progress_outlives_the_deadline() {
        let eval = sensor_fn(|ctx| async move {
            ctx.request_run(RunRequest::new("job").with_run_key("a")).await?;
            ctx.request_run(RunRequest::new("job").with_run_key("b")).await?;
            ctx.update_cursor("after")?;
            Ok(())
        });
        let mut sink = Slow {
            delay: Duration::from_millis(200),
            seen: Vec::new(),
        };
        let result = evaluate(input(eval, Duration::from_millis(50)), &mut sink).await;
        assert!(result.timed_out());
        assert!(result.cursor_update.is_none());
        let keys: Vec<_> = sink.seen.iter().map(|r| r.run_key.clone()).collect();
        assert_eq!(keys, vec![Some("a".to_string())]);
    }

    #[tokio::test]
    async fn skip_reason_is_reported() {
        let eval = sensor_fn(|ctx| async move {
            ctx.skip("nothing new");
            Ok(())
        });
        let mut sink = Collect::default();
        let result = evaluate(input(eval, Duration::from_secs(5)), &mut sink).await;
        assert!(result.error.is_none());
        assert_eq!(result.skip_reason.as_deref(), Some("nothing new"));
    }
}
