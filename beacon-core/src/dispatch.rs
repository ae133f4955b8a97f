//! Sequential task dispatcher
//!
//! One named worker thread executes every [`Task`] in submission order. The
//! dispatcher adds two things on top of a plain channel:
//!
//! - **Coalescing**: [`Dispatcher::post_once`] drops the submission while a
//!   task of the same [`TaskKind`] is still pending.
//! - **Deferral**: `post_once` tasks wait for their delay on the worker. An
//!   immediate Flush cancels deferred Flushes, since it reads the same store.
//!
//! A panic inside a task is caught and logged; the worker keeps serving.

use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use crate::collector::ConfigHandler;
use crate::error::Result;

/// Longest delay a deferred task is held for
const MAX_DELAY: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Unit of work executed by the dispatcher
#[derive(Clone)]
pub enum Task {
    /// Drain the event store
    Flush,
    /// Fetch remote configuration and hand it to the handler
    CheckConfig(Arc<dyn ConfigHandler>),
}

impl Task {
    pub fn kind(&self) -> TaskKind {
        match self {
            Task::Flush => TaskKind::Flush,
            Task::CheckConfig(_) => TaskKind::CheckConfig,
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.kind(), f)
    }
}

/// Coalescing tag of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    Flush,
    CheckConfig,
}

/// Executes tasks on the worker thread
pub trait TaskHandler: Send + 'static {
    fn handle(&mut self, task: Task);
}

impl<F> TaskHandler for F
where
    F: FnMut(Task) + Send + 'static,
{
    fn handle(&mut self, task: Task) {
        self(task);
    }
}

enum Envelope {
    Now(Task),
    Later { task: Task, due: Instant },
    Shutdown,
}

#[derive(Default)]
struct State {
    sender: Option<Sender<Envelope>>,
    pending: HashMap<TaskKind, usize>,
}

impl State {
    fn settle(&mut self, kind: TaskKind, count: usize) {
        if let Some(pending) = self.pending.get_mut(&kind) {
            *pending = pending.saturating_sub(count);
        }
    }
}

fn lock(state: &Mutex<State>) -> MutexGuard<'_, State> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handle to a running worker thread
pub struct Dispatcher {
    name: String,
    state: Arc<Mutex<State>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_id: ThreadId,
}

impl Dispatcher {
    /// Start a worker thread named `name` that runs tasks with `handler`
    pub fn spawn(name: impl Into<String>, handler: impl TaskHandler) -> Result<Self> {
        let name = name.into();
        let (sender, receiver) = mpsc::channel();
        let state = Arc::new(Mutex::new(State {
            sender: Some(sender),
            pending: HashMap::new(),
        }));

        let worker = Worker {
            receiver,
            state: Arc::clone(&state),
            handler: Box::new(handler),
            deferred: Vec::new(),
        };
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || worker.run())?;

        tracing::debug!(worker = %name, "Dispatcher started");

        Ok(Self {
            name,
            state,
            worker_id: handle.thread().id(),
            worker: Mutex::new(Some(handle)),
        })
    }

    /// Submit `task` for immediate execution.
    ///
    /// Returns `false` when the dispatcher is shut down and the task was dropped.
    pub fn post(&self, task: Task) -> bool {
        self.submit(task, None)
    }

    /// Submit `task` to run after `delay`, unless a task of the same kind is
    /// already pending. Returns `true` only when a new task was scheduled.
    pub fn post_once(&self, task: Task, delay: Duration) -> bool {
        self.submit(task, Some(delay))
    }

    fn submit(&self, task: Task, delay: Option<Duration>) -> bool {
        let kind = task.kind();
        let mut state = lock(&self.state);

        if delay.is_some() && state.pending.get(&kind).copied().unwrap_or(0) > 0 {
            tracing::trace!(?kind, "Coalesced with pending task");
            return false;
        }

        let Some(sender) = state.sender.as_ref() else {
            tracing::warn!(worker = %self.name, ?kind, "Dispatcher is shut down, dropping task");
            return false;
        };

        let envelope = match delay {
            Some(delay) => Envelope::Later {
                task,
                due: Instant::now() + delay.min(MAX_DELAY),
            },
            None => Envelope::Now(task),
        };

        if sender.send(envelope).is_err() {
            tracing::warn!(worker = %self.name, ?kind, "Dispatcher worker is gone, dropping task");
            state.sender = None;
            return false;
        }

        *state.pending.entry(kind).or_insert(0) += 1;
        true
    }

    /// Number of submitted tasks of `kind` that have not started yet
    pub fn pending(&self, kind: TaskKind) -> usize {
        lock(&self.state).pending.get(&kind).copied().unwrap_or(0)
    }

    /// Whether the dispatcher still accepts tasks
    pub fn is_alive(&self) -> bool {
        lock(&self.state).sender.is_some()
    }

    /// Stop accepting tasks and wait for the worker to finish the immediate
    /// tasks already queued. Deferred tasks are dropped.
    ///
    /// Safe to call more than once, and from a task running on the worker.
    pub fn shutdown(&self) {
        let sender = lock(&self.state).sender.take();
        if let Some(sender) = sender {
            let _ = sender.send(Envelope::Shutdown);
        }

        if thread::current().id() == self.worker_id {
            return;
        }

        let handle = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::error!(worker = %self.name, "Dispatcher worker terminated abnormally");
            } else {
                tracing::debug!(worker = %self.name, "Dispatcher stopped");
            }
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct Worker {
    receiver: Receiver<Envelope>,
    state: Arc<Mutex<State>>,
    handler: Box<dyn TaskHandler>,
    deferred: Vec<(Instant, Task)>,
}

impl Worker {
    fn run(mut self) {
        loop {
            let next_due = self.deferred.iter().map(|(due, _)| *due).min();
            let received = match next_due {
                Some(due) => {
                    match self
                        .receiver
                        .recv_timeout(due.saturating_duration_since(Instant::now()))
                    {
                        Ok(envelope) => Some(envelope),
                        Err(RecvTimeoutError::Timeout) => None,
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                None => match self.receiver.recv() {
                    Ok(envelope) => Some(envelope),
                    Err(_) => break,
                },
            };

            match received {
                Some(Envelope::Now(task)) => self.execute(task),
                Some(Envelope::Later { task, due }) => self.deferred.push((due, task)),
                Some(Envelope::Shutdown) => break,
                None => self.run_due(),
            }
        }

        let mut state = lock(&self.state);
        state.sender = None;
        state.pending.clear();
    }

    fn run_due(&mut self) {
        let now = Instant::now();
        let (mut ready, waiting): (Vec<_>, Vec<_>) =
            self.deferred.drain(..).partition(|(due, _)| *due <= now);
        self.deferred = waiting;
        ready.sort_by_key(|(due, _)| *due);

        for (_, task) in ready {
            self.execute(task);
        }
    }

    fn execute(&mut self, task: Task) {
        let kind = task.kind();
        lock(&self.state).settle(kind, 1);

        if kind == TaskKind::Flush {
            let before = self.deferred.len();
            self.deferred.retain(|(_, t)| t.kind() != TaskKind::Flush);
            let cancelled = before - self.deferred.len();
            if cancelled > 0 {
                lock(&self.state).settle(kind, cancelled);
                tracing::trace!(cancelled, "Flush preempted deferred flushes");
            }
        }

        let handler = &mut self.handler;
        if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(|| handler.handle(task))) {
            tracing::error!(?kind, message = panic_message(&*panic), "Task panicked");
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("<non-string panic>")
}
