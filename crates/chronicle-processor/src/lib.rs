#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **chronicle-processor** – The serial event processing actor of Chronicle.
//!
//! One consumer task owns all projector and reactor invocation. Callers hand
//! it event ids over a bounded FIFO and get back a single-shot [`Completion`]
//! that resolves once the event has been driven through every stage - fetch
//! the envelope, reify the typed event, project it into every interested
//! read-model, fan it out to reactors. Every failure past the queue is
//! logged and never propagated; the completion fires regardless.
//!
//! Projection is guarded by the lag gate: a projector that is behind by more
//! than one subscribed event has missed something, so the current event is
//! skipped for it and the condition is surfaced to the logger for operator
//! attention rather than silently breaking cursor monotonicity.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error};

use chronicle_projector::{ProjectorRegistry, ProjectorStore};
use chronicle_reactor::ReactorRegistry;
use chronicle_registry::EventRegistry;
use chronicle_store_core::EventLog;
use chronicle_types::EventId;

/// Default capacity of the processing FIFO; a full queue back-pressures
/// committers.
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

//─────────────────────────────
//  Error type
//─────────────────────────────

/// Errors surfaced by processor lifecycle operations.
#[derive(Debug, thiserror::Error)]
pub enum ProcessorError {
    /// `start` was called on a processor that is already running.
    #[error("processor has already been started")]
    AlreadyStarted,
    /// The processor has been stopped; it cannot be restarted.
    #[error("processor has been stopped")]
    Stopped,
}

//─────────────────────────────
//  Processing mode
//─────────────────────────────

/// Live processing versus replay.
///
/// Replay rebuilds read-models from history: the lag gate is meaningless
/// (every cursor was just dropped) and reactors must not fire again for
/// events whose side effects already happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Normal operation: gate, project, react.
    Live,
    /// Rebuilding projections: project only.
    Replay,
}

//─────────────────────────────
//  Requests and completions
//─────────────────────────────

struct Request {
    event_id: EventId,
    done: oneshot::Sender<()>,
}

/// Single-shot signal that an enqueued event has been fully processed.
///
/// Resolves after every matching projector and reactor has been attempted,
/// whether or not any of them failed. If the processor is torn down with the
/// request still queued, the signal resolves at teardown.
#[derive(Debug)]
pub struct Completion {
    rx: oneshot::Receiver<()>,
}

impl std::future::Future for Completion {
    type Output = ();

    fn poll(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<()> {
        // A dropped sender counts as delivery; nothing will ever fire it.
        std::pin::Pin::new(&mut self.rx).poll(cx).map(|_| ())
    }
}

//─────────────────────────────
//  Processor
//─────────────────────────────

enum Lifecycle {
    Created {
        worker: Worker,
        stop_tx: oneshot::Sender<()>,
    },
    Running {
        stop_tx: oneshot::Sender<()>,
        join: JoinHandle<()>,
    },
    Stopped,
}

/// Handle to the serial processing actor.
///
/// The processor is created idle: requests enqueued before [`start`] are
/// retained (up to the queue capacity) and serviced once the consumer task
/// runs. [`stop`] lets the in-flight event finish, then parks the processor
/// for good - restarting a stopped processor is not supported.
///
/// [`start`]: Processor::start
/// [`stop`]: Processor::stop
pub struct Processor {
    tx: mpsc::Sender<Request>,
    state: Mutex<Lifecycle>,
}

impl Processor {
    /// Create a processor with the default queue capacity.
    pub fn new(
        log: Arc<dyn EventLog>,
        events: Arc<EventRegistry>,
        projectors: Arc<ProjectorRegistry>,
        reactors: Arc<ReactorRegistry>,
        store: ProjectorStore,
        mode: Mode,
    ) -> Self {
        Self::with_capacity(
            log,
            events,
            projectors,
            reactors,
            store,
            mode,
            DEFAULT_QUEUE_CAPACITY,
        )
    }

    /// Create a processor with an explicit queue capacity.
    pub fn with_capacity(
        log: Arc<dyn EventLog>,
        events: Arc<EventRegistry>,
        projectors: Arc<ProjectorRegistry>,
        reactors: Arc<ReactorRegistry>,
        store: ProjectorStore,
        mode: Mode,
        capacity: usize,
    ) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        let (stop_tx, stop_rx) = oneshot::channel();
        let worker = Worker {
            rx,
            stop_rx,
            log,
            events,
            projectors,
            reactors,
            store,
            mode,
        };
        Self {
            tx,
            state: Mutex::new(Lifecycle::Created { worker, stop_tx }),
        }
    }

    /// Spawn the consumer task. Must be called exactly once, from within a
    /// tokio runtime.
    pub fn start(&self) -> Result<(), ProcessorError> {
        let mut state = self.lock_state();
        match std::mem::replace(&mut *state, Lifecycle::Stopped) {
            Lifecycle::Created { worker, stop_tx } => {
                let join = tokio::spawn(worker.run());
                *state = Lifecycle::Running { stop_tx, join };
                Ok(())
            }
            running @ Lifecycle::Running { .. } => {
                *state = running;
                Err(ProcessorError::AlreadyStarted)
            }
            Lifecycle::Stopped => Err(ProcessorError::Stopped),
        }
    }

    /// Stop the consumer task.
    ///
    /// The in-flight event, if any, completes before the task exits. No
    /// further requests are dequeued; requests still in the queue are
    /// abandoned and their completions resolve at teardown.
    pub async fn stop(&self) -> Result<(), ProcessorError> {
        let previous = {
            let mut state = self.lock_state();
            std::mem::replace(&mut *state, Lifecycle::Stopped)
        };
        match previous {
            // Never started: dropping the worker releases the queue.
            Lifecycle::Created { .. } => Ok(()),
            Lifecycle::Running { stop_tx, join } => {
                let _ = stop_tx.send(());
                if let Err(err) = join.await {
                    error!(error = %err, "processor task did not shut down cleanly");
                }
                Ok(())
            }
            Lifecycle::Stopped => Err(ProcessorError::Stopped),
        }
    }

    /// Enqueue an event id for processing.
    ///
    /// Blocks while the queue is full. The returned [`Completion`] resolves
    /// exactly once, after the event has been driven through all stages.
    pub async fn process(&self, event_id: EventId) -> Result<Completion, ProcessorError> {
        let (done, rx) = oneshot::channel();
        self.tx
            .send(Request { event_id, done })
            .await
            .map_err(|_| ProcessorError::Stopped)?;
        Ok(Completion { rx })
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, Lifecycle> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

//─────────────────────────────
//  Worker
//─────────────────────────────

struct Worker {
    rx: mpsc::Receiver<Request>,
    stop_rx: oneshot::Receiver<()>,
    log: Arc<dyn EventLog>,
    events: Arc<EventRegistry>,
    projectors: Arc<ProjectorRegistry>,
    reactors: Arc<ReactorRegistry>,
    store: ProjectorStore,
    mode: Mode,
}

impl Worker {
    async fn run(mut self) {
        debug!(mode = ?self.mode, "processor running");
        loop {
            tokio::select! {
                biased;
                _ = &mut self.stop_rx => {
                    debug!("processor stop requested");
                    break;
                }
                request = self.rx.recv() => match request {
                    Some(request) => self.process_one(request).await,
                    None => break,
                }
            }
        }
        debug!("processor loop exited");
    }

    async fn process_one(&self, request: Request) {
        self.apply(request.event_id).await;
        // The completion fires on every path, including total failure.
        let _ = request.done.send(());
    }

    async fn apply(&self, event_id: EventId) {
        let envelope = match self.log.fetch_by_id(event_id).await {
            Ok(envelope) => envelope,
            Err(err) => {
                error!(event_id, error = %err, "failed to load envelope");
                return;
            }
        };

        let event = match self.events.reify(&envelope) {
            Ok(event) => event,
            Err(err) => {
                error!(event_id, name = %envelope.name, error = %err, "failed to reify event");
                return;
            }
        };
        let event = event.as_ref();

        for projector in self.projectors.for_event(event) {
            if self.mode == Mode::Live {
                let lag = match self.store.out_of_sync_at(projector.as_ref(), envelope.id).await {
                    Ok(lag) => lag,
                    Err(err) => {
                        error!(
                            projector = projector.name(),
                            error = %err,
                            "failed to determine projector lag"
                        );
                        continue;
                    }
                };
                // A lag of one is the event being processed right now.
                if lag > 1 {
                    error!(
                        projector = projector.name(),
                        event = %envelope.name,
                        lag,
                        "projector is out of sync, skipping event"
                    );
                    continue;
                }
            }

            if let Err(err) = projector.handle(event) {
                error!(
                    projector = projector.name(),
                    event = %envelope.name,
                    error = %err,
                    "projector handler failed"
                );
                continue;
            }

            if let Err(err) = self.store.update_last_handled(projector.as_ref(), &envelope).await {
                error!(
                    projector = projector.name(),
                    error = %err,
                    "failed to advance projector cursor"
                );
            }
        }

        if self.mode == Mode::Live {
            for callable in self.reactors.for_event(event) {
                if catch_unwind(AssertUnwindSafe(|| callable(event))).is_err() {
                    error!(event = %envelope.name, "reactor panicked while handling event");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chronicle_reactor::Reactor;
    use chronicle_store_memory::MemoryStore;
    use chronicle_types::{
        downcast_event, DomainEvent, EventMeta, NewEnvelope, PayloadMap, Reifiable,
    };
    use serde::{Deserialize, Serialize};
    use std::any::TypeId;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct NotePayload {
        text: String,
    }

    #[derive(Debug, Clone)]
    struct NoteAdded {
        meta: EventMeta,
        payload: NotePayload,
    }

    impl NoteAdded {
        fn new(text: &str) -> Self {
            Self {
                meta: EventMeta::fresh(1),
                payload: NotePayload {
                    text: text.to_string(),
                },
            }
        }
    }

    impl DomainEvent for NoteAdded {
        fn version(&self) -> u8 {
            self.meta.version
        }
        fn occurred_at(&self) -> i64 {
            self.meta.occurred_at
        }
    }

    impl Reifiable for NoteAdded {
        type Payload = NotePayload;
        fn payload(&self) -> &NotePayload {
            &self.payload
        }
        fn from_parts(payload: NotePayload, meta: EventMeta) -> Self {
            Self { meta, payload }
        }
    }

    struct CollectingProjector {
        name: String,
        seen: Mutex<Vec<String>>,
        fail_on: Option<String>,
    }

    impl CollectingProjector {
        fn new(name: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                seen: Mutex::new(Vec::new()),
                fail_on: None,
            })
        }

        fn failing_on(name: &str, text: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                seen: Mutex::new(Vec::new()),
                fail_on: Some(text.to_string()),
            })
        }

        fn seen(&self) -> Vec<String> {
            self.seen.lock().unwrap().clone()
        }
    }

    impl chronicle_projector::Projector for CollectingProjector {
        fn name(&self) -> &str {
            &self.name
        }

        fn interested_in(&self) -> Vec<TypeId> {
            vec![TypeId::of::<NoteAdded>()]
        }

        fn handle(&self, event: &dyn DomainEvent) -> anyhow::Result<()> {
            let note = downcast_event::<NoteAdded>(event)
                .ok_or_else(|| anyhow::anyhow!("unexpected event type"))?;
            if self.fail_on.as_deref() == Some(note.payload.text.as_str()) {
                anyhow::bail!("rejected '{}'", note.payload.text);
            }
            self.seen.lock().unwrap().push(note.payload.text.clone());
            Ok(())
        }
    }

    struct NoteReactor {
        seen: Arc<Mutex<Vec<String>>>,
        panic_on: Option<String>,
    }

    impl Reactor for NoteReactor {
        type Event = NoteAdded;

        fn handle(&self, event: &NoteAdded) {
            if self.panic_on.as_deref() == Some(event.payload.text.as_str()) {
                panic!("reactor blew up");
            }
            self.seen.lock().unwrap().push(event.payload.text.clone());
        }
    }

    struct Fixture {
        memory: MemoryStore,
        events: Arc<EventRegistry>,
        projectors: Arc<ProjectorRegistry>,
        reactors: Arc<ReactorRegistry>,
    }

    impl Fixture {
        fn new() -> Self {
            let events = Arc::new(EventRegistry::new());
            events.register("note.added", &NoteAdded::new("proto")).unwrap();
            Self {
                memory: MemoryStore::new(),
                events,
                projectors: Arc::new(ProjectorRegistry::new()),
                reactors: Arc::new(ReactorRegistry::new()),
            }
        }

        fn store(&self) -> ProjectorStore {
            ProjectorStore::new(
                Arc::new(self.memory.clone()),
                Arc::new(self.memory.clone()),
                self.events.clone(),
            )
        }

        fn processor(&self, mode: Mode) -> Processor {
            Processor::new(
                Arc::new(self.memory.clone()),
                self.events.clone(),
                self.projectors.clone(),
                self.reactors.clone(),
                self.store(),
                mode,
            )
        }

        /// Append an event the way the engine would: name and payload
        /// resolved through the registry, metadata stamped on the envelope.
        async fn append(&self, event: &NoteAdded) -> EventId {
            self.memory
                .append(NewEnvelope {
                    name: self.events.name_of(event).unwrap(),
                    payload: self.events.encode_payload(event).unwrap(),
                    version: event.version(),
                    occurred_at: 1_700_000_000,
                })
                .await
                .unwrap()
        }
    }

    #[tokio::test]
    async fn projects_events_in_enqueue_order_and_advances_cursor() {
        let fixture = Fixture::new();
        let projector = CollectingProjector::new("notes");
        fixture.projectors.register(projector.clone()).unwrap();

        let processor = fixture.processor(Mode::Live);
        processor.start().unwrap();

        let mut last = 0;
        for text in ["a", "b", "c"] {
            last = fixture.append(&NoteAdded::new(text)).await;
            processor.process(last).await.unwrap().await;
        }

        assert_eq!(projector.seen(), vec!["a", "b", "c"]);
        assert_eq!(
            fixture
                .store()
                .last_handled(projector.as_ref())
                .await
                .unwrap(),
            Some(last)
        );
        processor.stop().await.unwrap();
    }

    #[tokio::test]
    async fn requests_enqueued_before_start_are_retained() {
        let fixture = Fixture::new();
        let projector = CollectingProjector::new("notes");
        fixture.projectors.register(projector.clone()).unwrap();

        let processor = fixture.processor(Mode::Live);
        let first = fixture.append(&NoteAdded::new("early")).await;
        let completion = processor.process(first).await.unwrap();

        processor.start().unwrap();
        completion.await;

        assert_eq!(projector.seen(), vec!["early"]);
        processor.stop().await.unwrap();
    }

    #[tokio::test]
    async fn completion_fires_when_the_envelope_is_missing() {
        let fixture = Fixture::new();
        let projector = CollectingProjector::new("notes");
        fixture.projectors.register(projector.clone()).unwrap();

        let processor = fixture.processor(Mode::Live);
        processor.start().unwrap();

        processor.process(404).await.unwrap().await;
        assert!(projector.seen().is_empty());
        processor.stop().await.unwrap();
    }

    #[tokio::test]
    async fn unregistered_envelope_aborts_at_reify() {
        let fixture = Fixture::new();
        let projector = CollectingProjector::new("notes");
        fixture.projectors.register(projector.clone()).unwrap();

        // Appended behind the registry's back with a name nobody registered.
        let id = fixture
            .memory
            .append(NewEnvelope {
                name: "note.updated".to_string(),
                payload: PayloadMap::new(),
                version: 1,
                occurred_at: 0,
            })
            .await
            .unwrap();

        let processor = fixture.processor(Mode::Live);
        processor.start().unwrap();
        processor.process(id).await.unwrap().await;

        assert!(projector.seen().is_empty());
        processor.stop().await.unwrap();
    }

    #[tokio::test]
    async fn lag_gate_skips_the_projector_but_not_the_event() {
        let fixture = Fixture::new();
        let projector = CollectingProjector::new("notes");
        fixture.projectors.register(projector.clone()).unwrap();

        let processor = fixture.processor(Mode::Live);
        processor.start().unwrap();

        // Steady state: each event is exactly one ahead when processed.
        for text in ["a", "b", "c"] {
            let id = fixture.append(&NoteAdded::new(text)).await;
            processor.process(id).await.unwrap().await;
        }
        let cursor_before = fixture
            .store()
            .last_handled(projector.as_ref())
            .await
            .unwrap();

        // An envelope the processor never saw widens the gap to two.
        fixture.append(&NoteAdded::new("missed")).await;
        let fifth = fixture.append(&NoteAdded::new("e")).await;
        processor.process(fifth).await.unwrap().await;

        assert_eq!(projector.seen(), vec!["a", "b", "c"]);
        assert_eq!(
            fixture
                .store()
                .last_handled(projector.as_ref())
                .await
                .unwrap(),
            cursor_before
        );
        processor.stop().await.unwrap();
    }

    #[tokio::test]
    async fn a_backlog_of_committed_events_passes_the_gate_one_by_one() {
        let fixture = Fixture::new();
        let projector = CollectingProjector::new("notes");
        fixture.projectors.register(projector.clone()).unwrap();

        let processor = fixture.processor(Mode::Live);

        // All three are in the log before the first one is processed; each
        // is still only one ahead of the cursor at its own turn.
        let mut completions = Vec::new();
        for text in ["a", "b", "c"] {
            let id = fixture.append(&NoteAdded::new(text)).await;
            completions.push(processor.process(id).await.unwrap());
        }

        processor.start().unwrap();
        for completion in completions {
            completion.await;
        }

        assert_eq!(projector.seen(), vec!["a", "b", "c"]);
        processor.stop().await.unwrap();
    }

    #[tokio::test]
    async fn replay_mode_projects_without_gate_or_reactors() {
        let fixture = Fixture::new();
        let projector = CollectingProjector::new("notes");
        fixture.projectors.register(projector.clone()).unwrap();

        let reacted = Arc::new(Mutex::new(Vec::new()));
        fixture
            .reactors
            .register(NoteReactor {
                seen: reacted.clone(),
                panic_on: None,
            })
            .unwrap();

        let first = fixture.append(&NoteAdded::new("a")).await;
        let second = fixture.append(&NoteAdded::new("b")).await;

        let processor = fixture.processor(Mode::Replay);
        processor.start().unwrap();
        // Out of order with no cursors at all: the gate must not interfere.
        processor.process(first).await.unwrap().await;
        processor.process(second).await.unwrap().await;

        assert_eq!(projector.seen(), vec!["a", "b"]);
        assert!(reacted.lock().unwrap().is_empty());
        processor.stop().await.unwrap();
    }

    #[tokio::test]
    async fn reactors_fire_live_and_panics_are_contained() {
        let fixture = Fixture::new();
        let reacted = Arc::new(Mutex::new(Vec::new()));
        fixture
            .reactors
            .register(NoteReactor {
                seen: reacted.clone(),
                panic_on: Some("boom".to_string()),
            })
            .unwrap();

        let processor = fixture.processor(Mode::Live);
        processor.start().unwrap();

        let id = fixture.append(&NoteAdded::new("boom")).await;
        processor.process(id).await.unwrap().await;

        // The panic was contained; the next event still reaches the reactor.
        let id = fixture.append(&NoteAdded::new("fine")).await;
        processor.process(id).await.unwrap().await;

        assert_eq!(*reacted.lock().unwrap(), vec!["fine".to_string()]);
        processor.stop().await.unwrap();
    }

    #[tokio::test]
    async fn failed_handler_leaves_the_cursor_alone() {
        let fixture = Fixture::new();
        let projector = CollectingProjector::failing_on("notes", "bad");
        fixture.projectors.register(projector.clone()).unwrap();

        let processor = fixture.processor(Mode::Live);
        processor.start().unwrap();

        let good = fixture.append(&NoteAdded::new("good")).await;
        processor.process(good).await.unwrap().await;

        let bad = fixture.append(&NoteAdded::new("bad")).await;
        processor.process(bad).await.unwrap().await;

        assert_eq!(projector.seen(), vec!["good"]);
        assert_eq!(
            fixture
                .store()
                .last_handled(projector.as_ref())
                .await
                .unwrap(),
            Some(good)
        );
        processor.stop().await.unwrap();
    }

    #[tokio::test]
    async fn lifecycle_misuse_is_an_error() {
        let fixture = Fixture::new();
        let processor = fixture.processor(Mode::Live);

        processor.start().unwrap();
        assert!(matches!(
            processor.start(),
            Err(ProcessorError::AlreadyStarted)
        ));

        processor.stop().await.unwrap();
        assert!(matches!(processor.start(), Err(ProcessorError::Stopped)));
        assert!(matches!(processor.stop().await, Err(ProcessorError::Stopped)));
        assert!(matches!(
            processor.process(1).await,
            Err(ProcessorError::Stopped)
        ));
    }
}
