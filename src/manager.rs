use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use parking_lot::RwLock;
use tokio::sync::broadcast;

use crate::config::{Config, SessionsConfig};
use crate::representer::{HtmlRepresenter, Representer};
use crate::session::{
    AuthContext, Detach, FinishReason, Handler, Session, SessionParams, SessionSettings,
};

/// How many destroyed process ids are remembered to tell "expired" from
/// "never existed".
const EXPIRED_MEMORY: usize = 4096;

/// Generate an unguessable, URL-safe process id.
pub fn new_process_id() -> String {
    URL_SAFE_NO_PAD.encode(uuid::Uuid::new_v4().as_bytes())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Created { process: String },
    Dormant { process: String },
    Active { process: String },
    Destroyed { process: String },
}

#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("too many processes ({0}), cannot create another")]
    Capacity(usize),
    #[error("missing process: {process}")]
    Missing { process: String, expired: bool },
}

/// Request data a new session starts with.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub query: HashMap<String, String>,
    pub auth: AuthContext,
}

#[derive(Default)]
struct ManagerInner {
    sessions: HashMap<String, Session>,
    /// Dormant processes by the order they became dormant.
    dormant: BTreeMap<u64, String>,
    dormant_seq: HashMap<String, u64>,
    next_seq: u64,
    expired: VecDeque<String>,
    expired_set: HashSet<String>,
}

impl ManagerInner {
    fn mark_dormant(&mut self, process: &str) -> bool {
        if self.dormant_seq.contains_key(process) {
            return false;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.dormant.insert(seq, process.to_string());
        self.dormant_seq.insert(process.to_string(), seq);
        true
    }

    fn unmark_dormant(&mut self, process: &str) -> bool {
        match self.dormant_seq.remove(process) {
            Some(seq) => {
                self.dormant.remove(&seq);
                true
            }
            None => false,
        }
    }

    fn remember_expired(&mut self, process: String) {
        if !self.expired_set.insert(process.clone()) {
            return;
        }
        self.expired.push_back(process);
        while self.expired.len() > EXPIRED_MEMORY {
            if let Some(old) = self.expired.pop_front() {
                self.expired_set.remove(&old);
            }
        }
    }

    fn forget_expired(&mut self, process: &str) {
        if self.expired_set.remove(process) {
            self.expired.retain(|p| p != process);
        }
    }

    /// Remove `process` if it is still this very session.
    fn remove_if_same(&mut self, session: &Session) -> bool {
        match self.sessions.get(&session.process) {
            Some(current) if current.ptr_eq(session) => {
                self.sessions.remove(&session.process);
                self.unmark_dormant(&session.process);
                self.remember_expired(session.process.clone());
                true
            }
            _ => false,
        }
    }
}

/// Keyed table of sessions for one application.
///
/// Creates sessions on demand, evicts dormant ones above the soft cap,
/// refuses creation at the hard cap, and reaps sessions whose handler ended.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<RwLock<ManagerInner>>,
    events_tx: broadcast::Sender<SessionEvent>,
    handler: Handler,
    representer: Arc<dyn Representer>,
    settings: Arc<SessionSettings>,
    limits: Arc<SessionsConfig>,
}

impl SessionManager {
    pub fn new(handler: Handler, limits: SessionsConfig, settings: SessionSettings) -> Self {
        let (events_tx, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(RwLock::new(ManagerInner::default())),
            events_tx,
            handler,
            representer: Arc::new(HtmlRepresenter),
            settings: Arc::new(settings),
            limits: Arc::new(limits),
        }
    }

    pub fn from_config(handler: Handler, config: &Config) -> Self {
        let settings = SessionSettings {
            title: config.server.title.clone(),
            debug: config.server.debug,
            idle_timeout: config.sessions.idle_timeout(),
            grace: config.sessions.shutdown_grace(),
            history_limit: config.sessions.history_limit,
            references: config.references.clone(),
        };
        Self::new(handler, config.sessions.clone(), settings)
    }

    pub fn with_representer(mut self, representer: Arc<dyn Representer>) -> Self {
        self.representer = representer;
        self
    }

    pub fn hide_processes(&self) -> bool {
        self.limits.hide_processes
    }

    pub fn debug(&self) -> bool {
        self.settings.debug
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events_tx.subscribe()
    }

    pub fn len(&self) -> usize {
        self.inner.read().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().sessions.is_empty()
    }

    pub fn processes(&self) -> Vec<String> {
        self.inner.read().sessions.keys().cloned().collect()
    }

    /// Dormant processes, oldest first.
    pub fn dormant_processes(&self) -> Vec<String> {
        self.inner.read().dormant.values().cloned().collect()
    }

    pub fn is_expired(&self, process: &str) -> bool {
        self.inner.read().expired_set.contains(process)
    }

    fn missing(&self, process: &str) -> ManagerError {
        let expired = self.is_expired(process);
        tracing::warn!(%process, expired, "request for missing process");
        ManagerError::Missing {
            process: process.to_string(),
            expired,
        }
    }

    /// Look up a live session. Never creates one.
    pub fn get(&self, process: &str) -> Result<Session, ManagerError> {
        let session = self.inner.read().sessions.get(process).cloned();
        session.ok_or_else(|| self.missing(process))
    }

    /// Look up `process`, creating it when absent and `ensure` is set.
    pub fn get_or_create(
        &self,
        process: &str,
        ensure: bool,
        ctx: RequestContext,
    ) -> Result<Session, ManagerError> {
        if let Some(session) = self.inner.read().sessions.get(process) {
            return Ok(session.clone());
        }
        if !ensure {
            return Err(self.missing(process));
        }

        let mut inner = self.inner.write();
        if let Some(session) = inner.sessions.get(process) {
            return Ok(session.clone());
        }

        let evicted = self.reclaim(&mut inner);
        if inner.sessions.len() >= self.limits.hard_cap {
            drop(inner);
            self.announce_destroyed(evicted);
            tracing::warn!(hard_cap = self.limits.hard_cap, "refusing to create process");
            return Err(ManagerError::Capacity(self.limits.hard_cap));
        }

        let manager = self.clone();
        let session = Session::spawn(
            SessionParams {
                process: process.to_string(),
                handler: self.handler.clone(),
                representer: self.representer.clone(),
                settings: self.settings.clone(),
                query: ctx.query,
                auth: ctx.auth,
            },
            move |session, reason| manager.finished(session, reason),
        );
        inner.sessions.insert(process.to_string(), session.clone());
        inner.forget_expired(process);
        drop(inner);

        self.announce_destroyed(evicted);
        let _ = self.events_tx.send(SessionEvent::Created {
            process: process.to_string(),
        });
        Ok(session)
    }

    /// Create a session under a fresh process id.
    pub fn create(&self, ctx: RequestContext) -> Result<Session, ManagerError> {
        self.get_or_create(&new_process_id(), true, ctx)
    }

    /// Evict the oldest dormant sessions until at most `soft_cap` remain,
    /// or no dormant session is left.
    fn reclaim(&self, inner: &mut ManagerInner) -> Vec<String> {
        let excess = inner.sessions.len().saturating_sub(self.limits.soft_cap);
        let mut evicted = Vec::new();
        while evicted.len() < excess {
            let Some((_, process)) = inner.dormant.pop_first() else {
                break;
            };
            inner.dormant_seq.remove(&process);
            match inner.sessions.get(&process).map(Session::is_attached) {
                Some(false) => {}
                Some(true) => {
                    tracing::debug!(%process, "dormant process was reattached, keeping it");
                    continue;
                }
                None => continue,
            }
            if let Some(session) = inner.sessions.remove(&process) {
                tracing::info!(%process, "evicting dormant process");
                session.destroy();
                inner.remember_expired(process.clone());
                evicted.push(process);
            }
        }
        evicted
    }

    fn announce_destroyed(&self, processes: Vec<String>) {
        for process in processes {
            let _ = self.events_tx.send(SessionEvent::Destroyed { process });
        }
    }

    pub fn declare_dormant(&self, process: &str) {
        let changed = {
            let mut inner = self.inner.write();
            inner.sessions.contains_key(process) && inner.mark_dormant(process)
        };
        if changed {
            let _ = self.events_tx.send(SessionEvent::Dormant {
                process: process.to_string(),
            });
        }
    }

    pub fn declare_active(&self, process: &str) {
        if self.inner.write().unmark_dormant(process) {
            let _ = self.events_tx.send(SessionEvent::Active {
                process: process.to_string(),
            });
        }
    }

    /// Record how a socket on `session` ended. A session that another
    /// socket has claimed in the meantime stays active.
    pub fn on_detach(&self, session: &Session, outcome: &Detach) {
        if !session.is_alive() || !outcome.is_dormant() {
            return;
        }
        let changed = {
            let mut inner = self.inner.write();
            let current = inner
                .sessions
                .get(&session.process)
                .is_some_and(|s| s.ptr_eq(session));
            current && !session.is_attached() && inner.mark_dormant(&session.process)
        };
        if changed {
            let _ = self.events_tx.send(SessionEvent::Dormant {
                process: session.process.clone(),
            });
        }
    }

    /// Destroy a session and forget it.
    pub fn remove(&self, process: &str) -> Option<Session> {
        let session = {
            let mut inner = self.inner.write();
            let session = inner.sessions.remove(process)?;
            inner.unmark_dormant(process);
            inner.remember_expired(process.to_string());
            session
        };
        session.destroy();
        let _ = self.events_tx.send(SessionEvent::Destroyed {
            process: process.to_string(),
        });
        Some(session)
    }

    fn finished(&self, session: &Session, reason: FinishReason) {
        let removed = self.inner.write().remove_if_same(session);
        session.destroy();
        if removed {
            tracing::debug!(process = %session.process, reason = reason.as_str(), "process removed");
            let _ = self.events_tx.send(SessionEvent::Destroyed {
                process: session.process.clone(),
            });
        }
    }

    /// Destroy every session and wait up to `timeout` for them to finish.
    /// Returns how many sessions were drained.
    pub async fn drain(&self, timeout: Duration) -> usize {
        let sessions: Vec<Session> = {
            let mut inner = self.inner.write();
            let drained: Vec<Session> = inner.sessions.drain().map(|(_, s)| s).collect();
            inner.dormant.clear();
            inner.dormant_seq.clear();
            for session in &drained {
                inner.remember_expired(session.process.clone());
            }
            drained
        };
        for session in &sessions {
            session.destroy();
        }
        let waits = sessions.iter().map(|s| s.finished());
        if tokio::time::timeout(timeout, futures::future::join_all(waits))
            .await
            .is_err()
        {
            tracing::warn!("timed out waiting for processes to finish");
        }
        for session in &sessions {
            let _ = self.events_tx.send(SessionEvent::Destroyed {
                process: session.process.clone(),
            });
        }
        sessions.len()
    }
}
