//! Bounded-concurrency batch dispatcher.
//!
//! Dispatching never waits: a slot is taken with a non-blocking semaphore acquire, and a full pool
//! makes [`TaskDispatcher::dispatch_next`] a no-op. Each completion frees its slot and schedules one
//! more dispatch after the configured interval. The batch finalizes exactly once, after the last
//! in-flight worker has reported.

use std::any::Any;
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::FutureExt;
use serde::Serialize;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info};

use crate::pipeline::context::{BatchItem, ContextSource};
use crate::pipeline::worker::{
    LogLevel, OperationType, Services, TranslationTask, TranslationWorker, WorkerEvent,
    WorkerOptions, WorkerOutcome, WorkerSink,
};

pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DispatchEvent {
    BatchStarted {
        total: usize,
    },
    BatchProgress {
        completed: usize,
        total: usize,
    },
    ItemResult(WorkerOutcome),
    ItemStream {
        id: String,
        fragment: String,
    },
    ItemThinking {
        id: String,
    },
    BatchFinished {
        results: Vec<WorkerOutcome>,
        completed: usize,
        total: usize,
    },
    WorkerLog {
        message: String,
        level: LogLevel,
    },
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DispatchStats {
    pub running: bool,
    pub stopping: bool,
    pub queued: usize,
    pub in_flight: usize,
    pub completed: usize,
    pub total: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Idle,
    Running,
    /// No new dispatches; waiting for in-flight workers.
    Stopping,
}

/// Runtime state of the active batch.
struct BatchState {
    queue: VecDeque<BatchItem>,
    in_flight: usize,
    completed: usize,
    total: usize,
    results: Vec<WorkerOutcome>,
    semaphore: Arc<Semaphore>,
    context: Arc<dyn ContextSource>,
    opts: WorkerOptions,
    source_language: Option<String>,
}

struct DispatchState {
    phase: Phase,
    /// Bumped per batch so timers from a finished batch cannot dispatch into a new one.
    generation: u64,
    batch: Option<BatchState>,
}

struct Inner {
    services: Arc<Services>,
    interval: Duration,
    state: Mutex<DispatchState>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<DispatchEvent>>>,
}

#[derive(Clone)]
pub struct TaskDispatcher {
    inner: Arc<Inner>,
}

impl TaskDispatcher {
    #[must_use]
    pub fn new(services: Arc<Services>) -> Self {
        Self::with_interval(services, DEFAULT_INTERVAL)
    }

    #[must_use]
    pub fn with_interval(services: Arc<Services>, interval: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                services,
                interval,
                state: Mutex::new(DispatchState {
                    phase: Phase::Idle,
                    generation: 0,
                    batch: None,
                }),
                subscribers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// New receiver for all events emitted from now on. Dropped receivers are pruned on the next
    /// emit.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<DispatchEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers().push(tx);
        rx
    }

    /// True from `start_batch` until the batch has finalized, including while stopping.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state().phase != Phase::Idle
    }

    #[must_use]
    pub fn stats(&self) -> DispatchStats {
        let st = self.state();
        let mut stats = DispatchStats {
            running: st.phase == Phase::Running,
            stopping: st.phase == Phase::Stopping,
            ..DispatchStats::default()
        };
        if let Some(b) = st.batch.as_ref() {
            stats.queued = b.queue.len();
            stats.in_flight = b.in_flight;
            stats.completed = b.completed;
            stats.total = b.total;
        }
        stats
    }

    /// Starts a batch and fills up to `concurrency` slots without waiting. Returns false, leaving
    /// the running batch untouched, if a batch is already active. Must be called inside a tokio
    /// runtime.
    pub fn start_batch(
        &self,
        items: Vec<BatchItem>,
        context: Arc<dyn ContextSource>,
        concurrency: usize,
        opts: WorkerOptions,
    ) -> bool {
        self.start_batch_with_source_language(items, context, concurrency, opts, None)
    }

    pub fn start_batch_with_source_language(
        &self,
        items: Vec<BatchItem>,
        context: Arc<dyn ContextSource>,
        concurrency: usize,
        opts: WorkerOptions,
        source_language: Option<String>,
    ) -> bool {
        let max_concurrency = concurrency.max(1);
        let total = items.len();
        {
            let mut st = self.state();
            if st.phase != Phase::Idle {
                debug!("start_batch refused: a batch is active");
                return false;
            }
            st.phase = Phase::Running;
            st.generation = st.generation.wrapping_add(1);
            st.batch = Some(BatchState {
                queue: items.into(),
                in_flight: 0,
                completed: 0,
                total,
                results: Vec::with_capacity(total),
                semaphore: Arc::new(Semaphore::new(max_concurrency)),
                context,
                opts,
                source_language,
            });
            info!(total, concurrency = max_concurrency, "batch started");
            self.emit(DispatchEvent::BatchStarted { total });
            if total == 0 {
                self.finalize(&mut st);
                return true;
            }
        }
        for _ in 0..max_concurrency {
            if !self.dispatch_next() {
                break;
            }
        }
        true
    }

    /// Starts one queued item if a slot is free. Never waits; returns whether a worker was
    /// spawned.
    pub fn dispatch_next(&self) -> bool {
        let mut st = self.state();
        if st.phase != Phase::Running {
            return false;
        }
        let generation = st.generation;
        let Some(batch) = st.batch.as_mut() else {
            return false;
        };
        if batch.queue.is_empty() {
            return false;
        }
        let Ok(permit) = batch.semaphore.clone().try_acquire_owned() else {
            return false;
        };
        let Some(item) = batch.queue.pop_front() else {
            return false;
        };
        batch.in_flight += 1;
        let context = batch.context.clone();
        let task = TranslationTask::new(&item, OperationType::BatchTranslation, &batch.opts)
            .with_source_language(batch.source_language.clone());
        debug!(item = %item.id, in_flight = batch.in_flight, "dispatch");
        drop(st);

        let this = self.clone();
        tokio::spawn(async move {
            this.run_item(item, task, context, permit, generation).await;
        });
        true
    }

    /// Stops dispatching. In-flight workers finish normally; the batch finalizes when the last
    /// one reports, or right away if none is running.
    pub fn stop(&self) {
        let mut st = self.state();
        match st.phase {
            Phase::Idle | Phase::Stopping => {}
            Phase::Running => {
                st.phase = Phase::Stopping;
                let in_flight = st.batch.as_ref().map_or(0, |b| b.in_flight);
                info!(in_flight, "batch stop requested");
                if in_flight == 0 {
                    self.finalize(&mut st);
                }
            }
        }
    }

    async fn run_item(
        &self,
        item: BatchItem,
        task: TranslationTask,
        context: Arc<dyn ContextSource>,
        permit: OwnedSemaphorePermit,
        generation: u64,
    ) {
        let id = item.id.clone();
        let events = self.clone();
        let forward = move |e: WorkerEvent| {
            events.emit(match e {
                WorkerEvent::Thinking => DispatchEvent::ItemThinking { id: id.clone() },
                WorkerEvent::Fragment(fragment) => DispatchEvent::ItemStream {
                    id: id.clone(),
                    fragment,
                },
                WorkerEvent::Log { level, message } => DispatchEvent::WorkerLog { message, level },
            });
        };
        let sink: WorkerSink<'_> = &forward;
        let services = self.inner.services.clone();
        let op = task.op;
        let work = async {
            let snapshot = context.snapshot(&item).await;
            TranslationWorker::new(task, snapshot, services)
                .run(Some(sink))
                .await
        };
        let outcome = match AssertUnwindSafe(work).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(item = %item.id, "worker panicked: {message}");
                WorkerOutcome::failed(&item.id, op, format!("worker panicked: {message}"), 0)
            }
        };
        drop(permit);
        self.on_worker_finished(outcome, generation);
    }

    fn on_worker_finished(&self, outcome: WorkerOutcome, generation: u64) {
        let mut st = self.state();
        if st.generation != generation {
            return;
        }
        let phase = st.phase;
        let Some(batch) = st.batch.as_mut() else {
            return;
        };
        self.emit(DispatchEvent::ItemResult(outcome.clone()));
        batch.in_flight = batch.in_flight.saturating_sub(1);
        batch.completed += 1;
        batch.results.push(outcome);
        self.emit(DispatchEvent::BatchProgress {
            completed: batch.completed,
            total: batch.total,
        });

        let more = !batch.queue.is_empty();
        let idle = batch.in_flight == 0;
        if phase == Phase::Running && more {
            drop(st);
            self.schedule_dispatch(generation);
        } else if idle {
            self.finalize(&mut st);
        }
    }

    fn schedule_dispatch(&self, generation: u64) {
        let this = self.clone();
        let interval = self.inner.interval;
        tokio::spawn(async move {
            if !interval.is_zero() {
                tokio::time::sleep(interval).await;
            }
            if this.state().generation == generation {
                this.dispatch_next();
            }
        });
    }

    /// Emits the terminal event and resets to idle. Callers hold the state lock, so this runs at
    /// most once per batch.
    fn finalize(&self, st: &mut MutexGuard<'_, DispatchState>) {
        let Some(batch) = st.batch.take() else {
            return;
        };
        st.phase = Phase::Idle;
        info!(
            completed = batch.completed,
            total = batch.total,
            failed = batch.results.iter().filter(|r| !r.is_ok()).count(),
            "batch finished"
        );
        self.emit(DispatchEvent::BatchFinished {
            results: batch.results,
            completed: batch.completed,
            total: batch.total,
        });
    }

    fn emit(&self, event: DispatchEvent) {
        self.subscribers()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn state(&self) -> MutexGuard<'_, DispatchState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn subscribers(&self) -> MutexGuard<'_, Vec<mpsc::UnboundedSender<DispatchEvent>>> {
        self.inner.subscribers.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
