use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures::future::BoxFuture;
use futures::stream::{SplitSink, SplitStream};
use futures::{FutureExt, SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::ReferenceConfig;
use crate::node::Node;
use crate::page::{format_error, Page, PageCore};
use crate::protocol::{Command, Control, Event, CLOSE_APP_DONE};
use crate::registry::{RefError, RefId, RefObject, Registries};
use crate::representer::{RenderError, Representer, ShellParams};
use crate::supervisor::{panic_message, Sequencer, TaskFailure, TaskSet};
use crate::transport::{History, InFlight, Outbound, Queue};

/// The application entry point, run once per session.
pub type Handler = Arc<dyn Fn(Page) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Wrap an async function as a [`Handler`].
pub fn handler<F, Fut>(f: F) -> Handler
where
    F: Fn(Page) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |page: Page| -> BoxFuture<'static, anyhow::Result<()>> { Box::pin(f(page)) })
}

/// Per-browser-session authentication data filled in by plugins.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AuthContext(Map<String, Value>);

impl AuthContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.0.insert(key.into(), value);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Display name of the authenticated user: `user` itself when it is a
    /// string, else its `email` or `name` field.
    pub fn user(&self) -> Option<String> {
        match self.0.get("user")? {
            Value::String(user) => Some(user.clone()),
            Value::Object(user) => user
                .get("email")
                .or_else(|| user.get("name"))
                .and_then(Value::as_str)
                .map(str::to_string),
            _ => None,
        }
    }
}

/// Settings shared by every session of one manager.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub title: String,
    pub debug: bool,
    pub idle_timeout: Duration,
    /// Time background tasks get to finish when the session ends.
    pub grace: Duration,
    pub history_limit: Option<usize>,
    pub references: ReferenceConfig,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            title: "livepage".to_string(),
            debug: false,
            idle_timeout: Duration::from_secs(300),
            grace: Duration::from_secs(1),
            history_limit: None,
            references: ReferenceConfig::default(),
        }
    }
}

/// Everything needed to start a session.
pub struct SessionParams {
    pub process: String,
    pub handler: Handler,
    pub representer: Arc<dyn Representer>,
    pub settings: Arc<SessionSettings>,
    pub query: HashMap<String, String>,
    pub auth: AuthContext,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SocketState {
    Disconnected,
    Attaching,
    Connected,
    /// Closed cleanly; kept until reattached or the idle timeout fires.
    Dormant,
}

/// How an attached socket ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Detach {
    /// Client closed with 1000 or 1001.
    Closed { code: u16 },
    /// Any other close, or the connection dropped.
    Abnormal { code: u16 },
    SendFailed,
    /// Client reported it is done with the session.
    Done,
    ClientError(String),
    /// A newer socket took over.
    Superseded,
    SessionEnded,
}

impl Detach {
    /// Whether the session should be declared dormant.
    pub fn is_dormant(&self) -> bool {
        matches!(self, Detach::Closed { .. } | Detach::SendFailed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    Done,
    Cancelled,
    Error,
}

impl FinishReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FinishReason::Done => "done",
            FinishReason::Cancelled => "cancelled",
            FinishReason::Error => "error",
        }
    }
}

/// A connection's hold on a session's attach slot. Dropping it frees the
/// slot unless a newer connection has taken it since.
pub struct SocketClaim {
    slot: Arc<Mutex<Option<(u64, CancellationToken)>>>,
    generation: u64,
    token: CancellationToken,
}

impl Drop for SocketClaim {
    fn drop(&mut self) {
        let mut slot = self.slot.lock();
        if slot.as_ref().is_some_and(|(g, _)| *g == self.generation) {
            *slot = None;
        }
    }
}

/// One browser session ("process"): the running handler, its page state,
/// and at most one attached socket.
#[derive(Clone)]
pub struct Session {
    pub process: String,
    pub created_at: Instant,
    page: Page,
    handler: Handler,
    settings: Arc<SessionSettings>,
    history: Arc<Mutex<History>>,
    /// Set by the main route; the next attach replays history.
    reset: Arc<AtomicBool>,
    state: Arc<RwLock<SocketState>>,
    /// Generation and cancel token of the socket currently attached.
    socket: Arc<Mutex<Option<(u64, CancellationToken)>>>,
    socket_generation: Arc<AtomicU64>,
    attach_lock: Arc<tokio::sync::Mutex<()>>,
    destroy_timer: Arc<Mutex<Option<JoinHandle<()>>>>,
    /// Fires when the session is destroyed. Attached sockets close with
    /// 3001 and the handler is cancelled.
    pub cancelled: CancellationToken,
    /// Fires once the handler and its background tasks have wound down.
    finished: CancellationToken,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("process", &self.process)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Session {
    fn new(params: SessionParams) -> Self {
        let SessionParams {
            process,
            handler,
            representer,
            settings,
            query,
            auth,
        } = params;

        let outbound = Arc::new(Queue::new());
        let hook_queue = outbound.clone();
        let debug = settings.debug;
        let tasks = TaskSet::new(Arc::new(move |failure: TaskFailure| {
            let content = format_error(
                "An error occurred in a background task.",
                Some(&failure.to_string()),
                debug,
            );
            hook_queue.push(Outbound::single(Command::Error { content }, true));
        }));

        let core = Arc::new(PageCore {
            route: format!("/{process}"),
            process: process.clone(),
            representer,
            registries: Registries::new(&settings.references),
            outbound,
            inbound: Queue::new(),
            tasks,
            sequencer: Sequencer::new(),
            emitted: Mutex::new(HashSet::new()),
            query,
            auth,
            debug,
        });

        Self {
            process,
            created_at: Instant::now(),
            page: Page::new(core),
            handler,
            history: Arc::new(Mutex::new(History::new(settings.history_limit))),
            settings,
            reset: Arc::new(AtomicBool::new(false)),
            state: Arc::new(RwLock::new(SocketState::Disconnected)),
            socket: Arc::new(Mutex::new(None)),
            socket_generation: Arc::new(AtomicU64::new(0)),
            attach_lock: Arc::new(tokio::sync::Mutex::new(())),
            destroy_timer: Arc::new(Mutex::new(None)),
            cancelled: CancellationToken::new(),
            finished: CancellationToken::new(),
        }
    }

    /// Create the session and start its handler. `on_finish` runs once the
    /// handler has ended and background tasks were wound down.
    pub fn spawn<F>(params: SessionParams, on_finish: F) -> Session
    where
        F: FnOnce(&Session, FinishReason) + Send + 'static,
    {
        let session = Session::new(params);
        tracing::info!(
            process = %session.process,
            user = session.user().as_deref().unwrap_or("-"),
            "created process"
        );
        let runner = session.clone();
        tokio::spawn(async move {
            let reason = runner.run().await;
            on_finish(&runner, reason);
            runner.finished.cancel();
        });
        session
    }

    async fn run(&self) -> FinishReason {
        let core = self.page.core().clone();
        let handler = (self.handler)(self.page.clone());
        let outcome = tokio::select! {
            _ = self.cancelled.cancelled() => None,
            result = AssertUnwindSafe(handler).catch_unwind() => Some(result),
        };

        let reason = match outcome {
            None => FinishReason::Cancelled,
            Some(Ok(Ok(()))) => FinishReason::Done,
            Some(Ok(Err(e))) => {
                tracing::error!(process = %self.process, error = ?e, "handler failed");
                core.push_error(
                    "An error occurred. You may need to refresh the page.",
                    Some(&format!("{e:?}")),
                );
                FinishReason::Error
            }
            Some(Err(payload)) => {
                let message = panic_message(payload.as_ref());
                tracing::error!(process = %self.process, panic = %message, "handler panicked");
                core.push_error(
                    "An error occurred. You may need to refresh the page.",
                    Some(&message),
                );
                FinishReason::Error
            }
        };

        let aborted = core.tasks.shutdown(self.settings.grace).await;
        if aborted > 0 {
            tracing::debug!(process = %self.process, aborted, "aborted background tasks");
        }
        if reason != FinishReason::Cancelled && self.state() == SocketState::Connected {
            let _ = tokio::time::timeout(self.settings.grace, core.outbound.wait_empty()).await;
        }

        tracing::info!(
            process = %self.process,
            user = self.user().as_deref().unwrap_or("-"),
            reason = reason.as_str(),
            "finished process"
        );
        reason
    }

    /// Wait until the session has fully finished.
    pub async fn finished(&self) {
        self.finished.cancelled().await;
    }

    pub fn page(&self) -> &Page {
        &self.page
    }

    pub fn route(&self) -> &str {
        self.page.route()
    }

    pub fn user(&self) -> Option<String> {
        self.page.auth().user()
    }

    pub fn debug(&self) -> bool {
        self.settings.debug
    }

    pub fn state(&self) -> SocketState {
        *self.state.read()
    }

    fn set_state(&self, state: SocketState) {
        *self.state.write() = state;
    }

    pub fn is_alive(&self) -> bool {
        !self.cancelled.is_cancelled()
    }

    /// Whether both handles refer to the same session.
    pub fn ptr_eq(&self, other: &Session) -> bool {
        Arc::ptr_eq(self.page.core(), other.page.core())
    }

    pub fn registries(&self) -> &Registries {
        &self.page.core().registries
    }

    pub fn resolve_object(&self, id: RefId) -> Result<RefObject, RefError> {
        self.registries().objects.lock().resolve(id)
    }

    pub fn render_fragment(&self, node: &Node) -> Result<String, RenderError> {
        self.page.core().render_fragment(node)
    }

    pub fn history_len(&self) -> usize {
        self.history.lock().len()
    }

    pub fn pending_outbound(&self) -> usize {
        self.page.core().outbound.len()
    }

    /// Render the session shell for a page load. The next socket attach
    /// replays the history so the reloaded page catches up.
    pub fn main_page(&self) -> String {
        self.reset.store(true, Ordering::SeqCst);
        if self.state() != SocketState::Connected {
            self.schedule_destroy(self.settings.idle_timeout);
        }
        self.page.core().representer.shell(&ShellParams {
            title: &self.settings.title,
            route: self.route(),
            debug: self.settings.debug,
        })
    }

    /// Cancel the handler and close any attached socket.
    pub fn destroy(&self) {
        self.cancel_destroy_timer();
        self.cancelled.cancel();
    }

    fn schedule_destroy(&self, after: Duration) {
        let session = self.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            if session.state() != SocketState::Connected {
                tracing::info!(process = %session.process, "idle timeout, destroying process");
                session.cancelled.cancel();
            }
        });
        if let Some(previous) = self.destroy_timer.lock().replace(handle) {
            previous.abort();
        }
    }

    fn cancel_destroy_timer(&self) {
        if let Some(timer) = self.destroy_timer.lock().take() {
            timer.abort();
        }
    }

    /// Take the socket slot for a new connection, superseding the current
    /// one. The session counts as attached until the claim is dropped.
    pub fn claim_socket(&self) -> SocketClaim {
        let generation = self.socket_generation.fetch_add(1, Ordering::AcqRel) + 1;
        let token = CancellationToken::new();
        if let Some((_, previous)) = self.socket.lock().replace((generation, token.clone())) {
            previous.cancel();
        }
        SocketClaim {
            slot: self.socket.clone(),
            generation,
            token,
        }
    }

    /// Whether a socket holds, or is waiting for, the attach slot.
    pub fn is_attached(&self) -> bool {
        self.socket.lock().is_some()
    }

    /// Serve `socket` until it closes, fails, or is superseded.
    ///
    /// A newer claim closes the older socket first; commands are never
    /// delivered to two sockets at once.
    pub async fn attach(&self, socket: WebSocket, claim: SocketClaim) -> Detach {
        let generation = claim.generation;
        let token = claim.token.clone();

        let _attached = self.attach_lock.lock().await;
        let (mut tx, mut rx) = socket.split();

        if self.cancelled.is_cancelled() {
            close(&mut tx, CLOSE_APP_DONE, "application finished").await;
            return Detach::SessionEnded;
        }
        if token.is_cancelled() {
            close(&mut tx, 1000, "superseded").await;
            return Detach::Superseded;
        }

        self.cancel_destroy_timer();
        self.set_state(SocketState::Attaching);
        tracing::info!(
            process = %self.process,
            user = self.user().as_deref().unwrap_or("-"),
            generation,
            "socket attached"
        );

        let outcome = match self.replay(&mut tx).await {
            Err(detach) => detach,
            Ok(()) => {
                self.set_state(SocketState::Connected);
                tokio::select! {
                    detach = self.recv_loop(&mut rx) => detach,
                    detach = self.send_loop(&mut tx) => detach,
                    _ = token.cancelled() => Detach::Superseded,
                    _ = self.cancelled.cancelled() => Detach::SessionEnded,
                }
            }
        };

        match &outcome {
            Detach::Superseded => close(&mut tx, 1000, "superseded").await,
            Detach::SessionEnded => {
                // Last words of the handler, e.g. its error banner.
                let _ = tokio::time::timeout(self.settings.grace, self.flush(&mut tx)).await;
                close(&mut tx, CLOSE_APP_DONE, "application finished").await
            }
            Detach::Done | Detach::ClientError(_) => {
                close(&mut tx, CLOSE_APP_DONE, "application finished").await
            }
            _ => {
                let _ = tx.close().await;
            }
        }

        drop(claim);
        self.after_detach(&outcome);
        outcome
    }

    fn after_detach(&self, outcome: &Detach) {
        let process = &self.process;
        match outcome {
            Detach::Closed { code } => {
                tracing::info!(%process, code, "socket closed, process dormant");
                self.set_state(SocketState::Dormant);
                self.schedule_destroy(self.settings.idle_timeout);
            }
            Detach::SendFailed => {
                tracing::info!(%process, "socket send failed, process dormant");
                self.set_state(SocketState::Dormant);
                self.schedule_destroy(self.settings.idle_timeout);
            }
            Detach::Abnormal { code } => {
                tracing::warn!(%process, code, "socket disconnected abnormally");
                let content = format_error(
                    "The connection to the server was interrupted.",
                    Some(&format!("close code {code}")),
                    self.settings.debug,
                );
                self.page
                    .core()
                    .outbound
                    .push(Outbound::single(Command::Error { content }, false));
                self.set_state(SocketState::Disconnected);
                self.schedule_destroy(self.settings.idle_timeout);
            }
            Detach::Done => {
                tracing::info!(%process, "client finished");
                self.set_state(SocketState::Disconnected);
                self.destroy();
            }
            Detach::ClientError(message) => {
                tracing::warn!(%process, %message, "client reported an error");
                self.set_state(SocketState::Disconnected);
                self.destroy();
            }
            Detach::SessionEnded => self.set_state(SocketState::Disconnected),
            Detach::Superseded => {}
        }
    }

    async fn replay(&self, tx: &mut SplitSink<WebSocket, Message>) -> Result<(), Detach> {
        if !self.reset.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let entries = self.history.lock().snapshot();
        tracing::debug!(process = %self.process, entries = entries.len(), "replaying history");
        for entry in entries {
            if tx.send(Message::Text(entry.into())).await.is_err() {
                self.reset.store(true, Ordering::SeqCst);
                return Err(Detach::SendFailed);
            }
        }
        Ok(())
    }

    async fn recv_loop(&self, rx: &mut SplitStream<WebSocket>) -> Detach {
        let core = self.page.core();
        loop {
            let message = match rx.next().await {
                Some(Ok(message)) => message,
                Some(Err(e)) => {
                    tracing::debug!(process = %self.process, error = %e, "socket receive failed");
                    return Detach::Abnormal { code: 1006 };
                }
                None => return Detach::Abnormal { code: 1006 },
            };
            let text = match message {
                Message::Text(text) => text,
                Message::Close(frame) => {
                    let code = frame.map(|f| f.code).unwrap_or(1005);
                    return match code {
                        1000 | 1001 => Detach::Closed { code },
                        code => Detach::Abnormal { code },
                    };
                }
                _ => continue,
            };
            let event = match Event::parse(text.as_str()) {
                Ok(event) => event,
                Err(e) => {
                    tracing::warn!(process = %self.process, error = %e, "dropping malformed event");
                    continue;
                }
            };
            match event.control() {
                Some(Control::Start { number }) => {
                    tracing::debug!(process = %self.process, ?number, "client started");
                }
                Some(Control::Done) => return Detach::Done,
                Some(Control::Error(message)) => return Detach::ClientError(message),
                Some(Control::Disconnect) => return Detach::Closed { code: 1000 },
                Some(Control::LiveDisconnected { id }) => {
                    let cancelled = core.tasks.cancel_labeled(&id);
                    tracing::debug!(process = %self.process, %id, cancelled, "live element removed");
                }
                None => core.inbound.push(event),
            }
        }
    }

    /// Send whatever is still queued without waiting for more.
    async fn flush(&self, tx: &mut SplitSink<WebSocket, Message>) {
        let outbound = &self.page.core().outbound;
        while let Some(item) = outbound.try_pop() {
            let batch = InFlight::new(outbound, item);
            let Ok(text) = serde_json::to_string(&batch.commands) else {
                batch.delivered();
                continue;
            };
            if tx.send(Message::Text(text.clone().into())).await.is_err() {
                return;
            }
            if batch.delivered().is_some_and(|b| b.retain) {
                self.history.lock().push(text);
            }
        }
    }

    async fn send_loop(&self, tx: &mut SplitSink<WebSocket, Message>) -> Detach {
        let outbound = &self.page.core().outbound;
        loop {
            let batch = InFlight::new(outbound, outbound.pop().await);
            let text = match serde_json::to_string(&batch.commands) {
                Ok(text) => text,
                Err(e) => {
                    tracing::error!(process = %self.process, error = %e, "cannot serialize commands");
                    batch.delivered();
                    continue;
                }
            };
            // On failure `batch` is dropped here and goes back to the head
            // of the queue.
            if tx.send(Message::Text(text.clone().into())).await.is_err() {
                return Detach::SendFailed;
            }
            if batch.delivered().is_some_and(|b| b.retain) {
                self.history.lock().push(text);
            }
        }
    }
}

async fn close(tx: &mut SplitSink<WebSocket, Message>, code: u16, reason: &str) {
    let frame = CloseFrame {
        code,
        reason: reason.to_string().into(),
    };
    let _ = tx.send(Message::Close(Some(frame))).await;
}
