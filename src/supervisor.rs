//! Background work owned by a session.
//!
//! Every UI mutation runs as a task in the session's [`TaskSet`]. Failures
//! are reported through a hook instead of being lost, and the set can be
//! awaited ([`TaskSet::sync`]) or torn down with a grace period.
//! [`Sequencer`] tickets keep mutations delivered in call order even
//! though their tasks run concurrently.

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::AbortHandle;

/// Why a background task did not complete.
#[derive(Debug)]
pub enum TaskFailure {
    Error(anyhow::Error),
    Panic(String),
}

impl std::fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskFailure::Error(e) => write!(f, "{e:#}"),
            TaskFailure::Panic(msg) => write!(f, "task panicked: {msg}"),
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

pub type FailureHook = Arc<dyn Fn(TaskFailure) + Send + Sync>;

struct TaskEntry {
    label: Option<String>,
    abort: AbortHandle,
}

struct TaskSetInner {
    tasks: Mutex<HashMap<u64, TaskEntry>>,
    next: AtomicU64,
    drained: Notify,
    on_failure: FailureHook,
}

impl TaskSetInner {
    fn finish(&self, id: u64) {
        let mut tasks = self.tasks.lock();
        tasks.remove(&id);
        if tasks.is_empty() {
            self.drained.notify_waiters();
        }
    }
}

#[derive(Clone)]
pub struct TaskSet {
    inner: Arc<TaskSetInner>,
}

impl TaskSet {
    pub fn new(on_failure: FailureHook) -> Self {
        Self {
            inner: Arc::new(TaskSetInner {
                tasks: Mutex::new(HashMap::new()),
                next: AtomicU64::new(0),
                drained: Notify::new(),
                on_failure,
            }),
        }
    }

    /// Spawn a supervised task. Labeled tasks can be cancelled by label.
    pub fn spawn<F>(&self, label: Option<String>, fut: F)
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let id = self.inner.next.fetch_add(1, Ordering::Relaxed);
        let inner = self.inner.clone();
        // Hold the lock across spawn so the task cannot finish before it
        // is recorded.
        let mut tasks = self.inner.tasks.lock();
        let handle = tokio::spawn(async move {
            let failure = match AssertUnwindSafe(fut).catch_unwind().await {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(TaskFailure::Error(e)),
                Err(payload) => Some(TaskFailure::Panic(panic_message(payload.as_ref()))),
            };
            if let Some(failure) = failure {
                tracing::warn!(error = %failure, "background task failed");
                (inner.on_failure)(failure);
            }
            inner.finish(id);
        });
        tasks.insert(
            id,
            TaskEntry {
                label,
                abort: handle.abort_handle(),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.inner.tasks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.tasks.lock().is_empty()
    }

    /// Wait until no task is running.
    pub async fn sync(&self) {
        loop {
            let drained = self.inner.drained.notified();
            tokio::pin!(drained);
            drained.as_mut().enable();
            if self.is_empty() {
                return;
            }
            drained.await;
        }
    }

    /// Abort every task carrying `label`. Returns how many were aborted.
    pub fn cancel_labeled(&self, label: &str) -> usize {
        let mut tasks = self.inner.tasks.lock();
        let ids: Vec<u64> = tasks
            .iter()
            .filter(|(_, t)| t.label.as_deref() == Some(label))
            .map(|(id, _)| *id)
            .collect();
        for id in &ids {
            if let Some(task) = tasks.remove(id) {
                task.abort.abort();
            }
        }
        if tasks.is_empty() {
            self.inner.drained.notify_waiters();
        }
        ids.len()
    }

    pub fn abort_all(&self) -> usize {
        let mut tasks = self.inner.tasks.lock();
        let count = tasks.len();
        for (_, task) in tasks.drain() {
            task.abort.abort();
        }
        self.inner.drained.notify_waiters();
        count
    }

    /// Give running tasks `grace` to finish, then abort the rest.
    /// Returns how many were aborted.
    pub async fn shutdown(&self, grace: Duration) -> usize {
        if tokio::time::timeout(grace, self.sync()).await.is_ok() {
            return 0;
        }
        self.abort_all()
    }
}

#[derive(Default)]
struct SequencerInner {
    next: AtomicU64,
    state: Mutex<SequencerState>,
    turn: Notify,
}

#[derive(Default)]
struct SequencerState {
    serving: u64,
    /// Tickets released out of turn.
    released: BTreeSet<u64>,
}

/// Hands out tickets that are served strictly in issue order.
#[derive(Clone, Default)]
pub struct Sequencer {
    inner: Arc<SequencerInner>,
}

impl Sequencer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ticket(&self) -> Ticket {
        Ticket {
            inner: self.inner.clone(),
            number: self.inner.next.fetch_add(1, Ordering::AcqRel),
        }
    }
}

/// A place in line. Dropping a ticket, served or not, lets later tickets
/// through.
pub struct Ticket {
    inner: Arc<SequencerInner>,
    number: u64,
}

impl Ticket {
    pub async fn wait_turn(&self) {
        loop {
            let turn = self.inner.turn.notified();
            tokio::pin!(turn);
            turn.as_mut().enable();
            if self.inner.state.lock().serving == self.number {
                return;
            }
            turn.await;
        }
    }
}

impl Drop for Ticket {
    fn drop(&mut self) {
        let mut guard = self.inner.state.lock();
        let state = &mut *guard;
        state.released.insert(self.number);
        let mut advanced = false;
        while state.released.remove(&state.serving) {
            state.serving += 1;
            advanced = true;
        }
        drop(guard);
        if advanced {
            self.inner.turn.notify_waiters();
        }
    }
}
