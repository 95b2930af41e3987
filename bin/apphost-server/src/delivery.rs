//! The two ways a lifecycle task's progress reaches a client.
//!
//! * **Accept-and-drain** ([`accept_and_drain`]): answer at once with the
//!   first snapshot, then keep reading the task in the background until it
//!   ends, logging the outcome.
//! * **Live stream** ([`live_stream`]): forward every snapshot to an
//!   [`EventSink`] until the task ends or the client goes away.
//!
//! [`wants_event_stream`] picks between them from the `Accept` header.

use apphost_core::{BackgroundTask, LifecycleTask, Manifest, Snapshot, TaskRegistry};
use async_trait::async_trait;
use axum::http::HeaderMap;
use axum::http::header::ACCEPT;
use axum::response::sse::Event;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::error::ServerError;

pub const EVENT_STREAM: &str = "text/event-stream";

/// `true` when one of the `Accept` media types is exactly
/// `text/event-stream` (parameters ignored).
pub fn wants_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get_all(ACCEPT)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|media| media.split(';').next().unwrap_or_default().trim())
        .any(|media| media.eq_ignore_ascii_case(EVENT_STREAM))
}

// ── Accept-and-drain ───────────────────────────────────────────────────────────

/// Result of [`accept_and_drain`].
#[derive(Debug)]
pub struct Accepted {
    /// First snapshot read from the task; this is what the client gets.
    pub snapshot: Snapshot,
    /// The background loop draining the rest, absent when the first
    /// snapshot was already terminal.
    pub drain: Option<BackgroundTask>,
}

pub async fn accept_and_drain(mut task: LifecycleTask, registry: &TaskRegistry) -> Accepted {
    let snapshot = task.next().await;
    if snapshot.terminal {
        log_outcome(&task, &snapshot);
        return Accepted {
            snapshot,
            drain: None,
        };
    }

    let drain = registry.spawn("drain", task.key().to_string(), async move {
        loop {
            let snapshot = task.next().await;
            if snapshot.terminal {
                log_outcome(&task, &snapshot);
                break;
            }
        }
    });
    Accepted {
        snapshot,
        drain: Some(drain),
    }
}

fn log_outcome(task: &LifecycleTask, last: &Snapshot) {
    match &last.error {
        Some(err) => error!(
            task = %task.id(),
            key = %task.key(),
            op = %task.operation(),
            error = %err,
            "lifecycle operation failed"
        ),
        None => info!(
            task = %task.id(),
            key = %task.key(),
            op = %task.operation(),
            state = %last.manifest.state,
            "lifecycle operation completed"
        ),
    }
}

// ── Live stream ────────────────────────────────────────────────────────────────

/// One event of a live stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    State(Manifest),
    /// Classified error body, as an HTTP error response would carry it,
    /// plus its `status`.
    Error(Value),
}

impl StreamEvent {
    pub fn into_sse(self) -> Result<Event, axum::Error> {
        match self {
            StreamEvent::State(manifest) => Event::default().event("state").json_data(manifest),
            StreamEvent::Error(body) => Event::default().event("error").json_data(body),
        }
    }
}

/// The transport went away; nothing more can be delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Disconnected;

/// Where a live stream writes its events.
#[async_trait]
pub trait EventSink: Send {
    /// Deliver one event. `Err(Disconnected)` tells the caller to stop.
    async fn emit(&mut self, event: StreamEvent) -> Result<(), Disconnected>;
}

#[async_trait]
impl EventSink for mpsc::Sender<StreamEvent> {
    async fn emit(&mut self, event: StreamEvent) -> Result<(), Disconnected> {
        self.send(event).await.map_err(|_| Disconnected)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOutcome {
    /// The task ended successfully and its final state was delivered.
    Completed { emitted: usize },
    /// The task failed and an `error` event was delivered.
    Failed { emitted: usize },
    /// The client went away; the task keeps running on its own.
    Disconnected { emitted: usize },
}

pub async fn live_stream<S: EventSink + ?Sized>(mut task: LifecycleTask, sink: &mut S) -> StreamOutcome {
    let mut emitted = 0;
    loop {
        let snapshot = task.next().await;
        let (event, done) = match snapshot.error {
            Some(err) => {
                let classified = ServerError::from(err);
                let mut body = classified.body();
                body["status"] = classified.status().as_u16().into();
                (StreamEvent::Error(body), Some(StreamOutcome::Failed { emitted: emitted + 1 }))
            }
            None => {
                let done = snapshot
                    .terminal
                    .then_some(StreamOutcome::Completed { emitted: emitted + 1 });
                (StreamEvent::State(snapshot.manifest), done)
            }
        };

        if sink.emit(event).await.is_err() {
            debug!(task = %task.id(), key = %task.key(), emitted, "client disconnected from event stream");
            return StreamOutcome::Disconnected { emitted };
        }
        emitted += 1;

        if let Some(outcome) = done {
            debug!(task = %task.id(), ?outcome, "event stream finished");
            return outcome;
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod test {
    use std::sync::Arc;
    use std::time::Duration;

    use apphost_core::testing::ScriptedInstaller;
    use apphost_core::{
        AppKey, AppState, AppType, Coordinator, DomainError, LifecycleRequest,
    };
    use axum::http::HeaderValue;
    use tokio::sync::Semaphore;
    use tracing_test::traced_test;

    use super::*;

    fn install(slug: &str) -> LifecycleRequest {
        LifecycleRequest::install(
            AppKey::new("alice.example", slug, AppType::Webapp),
            Some("https://x/app.tar".into()),
        )
    }

    fn coordinator(installer: ScriptedInstaller) -> Coordinator {
        Coordinator::new(Arc::new(installer), TaskRegistry::new())
    }

    /// Records events; optionally opens `gate` after each one, or refuses
    /// everything past `accept` events.
    #[derive(Default)]
    struct RecordingSink {
        events: Vec<StreamEvent>,
        gate: Option<Arc<Semaphore>>,
        accept: Option<usize>,
    }

    #[async_trait]
    impl EventSink for RecordingSink {
        async fn emit(&mut self, event: StreamEvent) -> Result<(), Disconnected> {
            if self.accept.is_some_and(|n| self.events.len() >= n) {
                return Err(Disconnected);
            }
            self.events.push(event);
            if let Some(gate) = &self.gate {
                gate.add_permits(1);
            }
            Ok(())
        }
    }

    fn states(events: &[StreamEvent]) -> Vec<AppState> {
        events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::State(m) => Some(m.state),
                StreamEvent::Error(_) => None,
            })
            .collect()
    }

    #[test]
    fn accept_header_negotiation() {
        let mut headers = HeaderMap::new();
        assert!(!wants_event_stream(&headers));

        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        assert!(!wants_event_stream(&headers));

        headers.insert(ACCEPT, HeaderValue::from_static("application/json, text/event-stream;q=0.9"));
        assert!(wants_event_stream(&headers));

        headers.insert(ACCEPT, HeaderValue::from_static("text/event-stream-v2"));
        assert!(!wants_event_stream(&headers));

        headers.insert(ACCEPT, HeaderValue::from_static("Text/Event-Stream"));
        assert!(wants_event_stream(&headers));
    }

    #[tokio::test]
    async fn accepted_with_first_snapshot_then_drained() {
        let gate = Arc::new(Semaphore::new(0));
        let coordinator = coordinator(
            ScriptedInstaller::new()
                .with_steps(vec![AppState::Downloading, AppState::Installing])
                .gated(gate.clone()),
        );
        let mut task = coordinator.create(install("drive")).await.unwrap();
        coordinator.start(&mut task);

        let accepted = accept_and_drain(task, coordinator.registry()).await;
        assert!(!accepted.snapshot.terminal);
        assert_eq!(accepted.snapshot.manifest.state, AppState::Installing);

        let drain = accepted.drain.expect("drain loop spawned");
        gate.add_permits(10);
        assert!(drain.join().await);
        assert!(
            coordinator
                .registry()
                .shutdown(Duration::from_secs(5))
                .await
        );
    }

    #[tokio::test]
    #[traced_test]
    async fn already_finished_task_needs_no_drain_loop() {
        let coordinator =
            coordinator(ScriptedInstaller::new().failing(DomainError::BadManifest("no name".into())));
        let mut task = coordinator.create(install("drive")).await.unwrap();
        let worker = coordinator.start(&mut task).unwrap();
        worker.join().await;

        let accepted = accept_and_drain(task, coordinator.registry()).await;
        assert!(accepted.snapshot.terminal);
        assert_eq!(accepted.snapshot.manifest.state, AppState::Errored);
        assert!(accepted.drain.is_none());
        assert!(coordinator.registry().is_empty());
        assert!(logs_contain("lifecycle operation failed"));
    }

    #[tokio::test]
    async fn live_stream_emits_each_state_then_stops() {
        let gate = Arc::new(Semaphore::new(0));
        let coordinator = coordinator(
            ScriptedInstaller::new()
                .with_steps(vec![AppState::Downloading])
                .gated(gate.clone()),
        );
        let mut task = coordinator.create(install("drive")).await.unwrap();
        coordinator.start(&mut task);

        let mut sink = RecordingSink {
            gate: Some(gate),
            ..Default::default()
        };
        let outcome = live_stream(task, &mut sink).await;

        assert_eq!(outcome, StreamOutcome::Completed { emitted: 3 });
        assert_eq!(
            states(&sink.events),
            vec![AppState::Installing, AppState::Downloading, AppState::Ready]
        );
    }

    #[tokio::test]
    async fn live_stream_failure_ends_with_one_error_event() {
        let gate = Arc::new(Semaphore::new(0));
        let coordinator = coordinator(
            ScriptedInstaller::new()
                .gated(gate.clone())
                .failing(DomainError::SourceNotReachable("https://x/app.tar".into())),
        );
        let mut task = coordinator.create(install("foo")).await.unwrap();
        coordinator.start(&mut task);

        let mut sink = RecordingSink {
            gate: Some(gate),
            ..Default::default()
        };
        let outcome = live_stream(task, &mut sink).await;

        assert_eq!(outcome, StreamOutcome::Failed { emitted: 3 });
        let Some(StreamEvent::Error(body)) = sink.events.last() else {
            panic!("last event is not an error: {:?}", sink.events);
        };
        assert_eq!(body["status"], 400);
        assert!(body["error"].as_str().unwrap().contains("not reachable"));
        let errors = sink
            .events
            .iter()
            .filter(|e| matches!(e, StreamEvent::Error(_)))
            .count();
        assert_eq!(errors, 1);
    }

    #[tokio::test]
    async fn live_stream_of_finished_task_emits_one_state() {
        let coordinator = coordinator(ScriptedInstaller::new());
        let mut task = coordinator.create(install("drive")).await.unwrap();
        coordinator.start(&mut task).unwrap().join().await;

        let mut sink = RecordingSink::default();
        let outcome = live_stream(task, &mut sink).await;
        assert_eq!(outcome, StreamOutcome::Completed { emitted: 1 });
        assert_eq!(states(&sink.events), vec![AppState::Ready]);
    }

    #[tokio::test]
    async fn lagging_consumer_skips_to_latest_state() {
        let gate = Arc::new(Semaphore::new(0));
        let coordinator = coordinator(
            ScriptedInstaller::new()
                .with_steps(vec![AppState::Downloading, AppState::Installing])
                .gated(gate.clone()),
        );
        let mut task = coordinator.create(install("drive")).await.unwrap();
        coordinator.start(&mut task);

        // Both steps are reported before the stream reads anything.
        gate.add_permits(2);
        while gate.available_permits() > 0 {
            tokio::task::yield_now().await;
        }
        tokio::task::yield_now().await;

        let mut sink = RecordingSink {
            gate: Some(gate),
            ..Default::default()
        };
        let outcome = live_stream(task, &mut sink).await;

        assert_eq!(outcome, StreamOutcome::Completed { emitted: 2 });
        assert_eq!(
            states(&sink.events),
            vec![AppState::Installing, AppState::Ready],
            "Downloading was superseded before it was read"
        );
    }

    #[tokio::test]
    async fn disconnect_mid_stream_lets_work_finish() {
        let gate = Arc::new(Semaphore::new(0));
        let installer = Arc::new(
            ScriptedInstaller::new()
                .with_steps(vec![AppState::Downloading])
                .gated(gate.clone()),
        );
        let coordinator = Coordinator::new(installer.clone(), TaskRegistry::new());
        let mut task = coordinator.create(install("drive")).await.unwrap();
        let worker = coordinator.start(&mut task).unwrap();

        let mut sink = RecordingSink {
            gate: Some(gate.clone()),
            accept: Some(1),
            ..Default::default()
        };
        let outcome = live_stream(task, &mut sink).await;
        assert_eq!(outcome, StreamOutcome::Disconnected { emitted: 1 });

        gate.add_permits(10);
        assert!(worker.join().await);
        assert_eq!(installer.runs(), 1);
        assert!(!installer.locks().is_held(&AppKey::new("alice.example", "drive", AppType::Webapp)));
    }

    #[tokio::test]
    async fn channel_sink_reports_closed_receiver() {
        let (mut tx, rx) = mpsc::channel::<StreamEvent>(1);
        drop(rx);
        let err = tx.emit(StreamEvent::Error(Value::Null)).await.unwrap_err();
        assert_eq!(err, Disconnected);
    }

    #[test]
    fn sse_events_are_named() {
        assert!(StreamEvent::Error(serde_json::json!({"error": "x"})).into_sse().is_ok());
    }
}
