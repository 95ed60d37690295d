use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{next_id, RefError, RefId};
use crate::config::ReferenceConfig;
use crate::node::Node;

/// Arguments of a client-side call: positional JSON values from the request
/// body and keyword arguments from the query string.
#[derive(Debug, Clone, Default)]
pub struct CallArgs {
    pub args: Vec<Value>,
    pub kwargs: HashMap<String, String>,
}

/// What a callback hands back to the method route.
#[derive(Clone)]
pub enum CallResult {
    Empty,
    Json(Value),
    Html(Node),
}

impl From<()> for CallResult {
    fn from(_: ()) -> Self {
        CallResult::Empty
    }
}

impl From<Value> for CallResult {
    fn from(value: Value) -> Self {
        CallResult::Json(value)
    }
}

impl From<Node> for CallResult {
    fn from(node: Node) -> Self {
        CallResult::Html(node)
    }
}

type CallbackFn = dyn Fn(CallArgs) -> BoxFuture<'static, anyhow::Result<CallResult>> + Send + Sync;

/// A server-side callable the client can invoke through `method/{id}`.
#[derive(Clone)]
pub struct Callback {
    func: Arc<CallbackFn>,
    anchor: Option<Weak<AnchorToken>>,
}

impl Callback {
    pub fn new<F, Fut, R>(f: F) -> Self
    where
        F: Fn(CallArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
        R: Into<CallResult>,
    {
        let func = move |args: CallArgs| -> BoxFuture<'static, anyhow::Result<CallResult>> {
            let fut = f(args);
            Box::pin(async move { fut.await.map(Into::into) })
        };
        Self {
            func: Arc::new(func),
            anchor: None,
        }
    }

    /// Tie the callback's liveness to `anchor`. Weak registries drop the
    /// callback once the anchor is dropped or invalidated.
    pub fn anchored(mut self, anchor: &Anchor) -> Self {
        self.anchor = Some(Arc::downgrade(&anchor.token));
        self
    }

    pub async fn call(&self, args: CallArgs) -> anyhow::Result<CallResult> {
        (self.func)(args).await
    }
}

impl std::fmt::Debug for Callback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Callback")
            .field("anchored", &self.anchor.is_some())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
struct AnchorToken {
    generation: AtomicU64,
}

/// Liveness handle for weakly registered callbacks.
///
/// A callback registered while anchored resolves only while some clone of
/// the anchor is alive and the anchor has not been invalidated since the
/// registration. Components hold one anchor and call [`Anchor::invalidate`]
/// when they re-render so stale handlers stop resolving.
#[derive(Debug, Clone, Default)]
pub struct Anchor {
    token: Arc<AnchorToken>,
}

impl Anchor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn invalidate(&self) {
        self.token.generation.fetch_add(1, Ordering::AcqRel);
    }
}

/// Something that can be registered under an id.
#[derive(Debug, Clone)]
pub enum RefObject {
    Function(Callback),
    Value(Value),
}

impl RefObject {
    fn anchor(&self) -> Option<&Weak<AnchorToken>> {
        match self {
            RefObject::Function(callback) => callback.anchor.as_ref(),
            RefObject::Value(_) => None,
        }
    }
}

struct WeakEntry {
    object: Option<RefObject>,
    token: Weak<AnchorToken>,
    generation: u64,
}

impl WeakEntry {
    fn is_live(&self) -> bool {
        self.token
            .upgrade()
            .is_some_and(|t| t.generation.load(Ordering::Acquire) == self.generation)
    }
}

/// Registry that does not keep its objects alive past their anchor.
///
/// Dead entries keep their id as a tombstone so a dead id never falls
/// through to another registry.
#[derive(Default)]
pub struct WeakRegistry {
    entries: HashMap<RefId, WeakEntry>,
    since_sweep: usize,
}

const SWEEP_EVERY: usize = 256;

impl WeakRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an anchored object. Objects without an anchor are handed back.
    pub fn register(&mut self, object: RefObject, id: Option<RefId>) -> Result<RefId, RefObject> {
        let Some(token) = object.anchor().cloned() else {
            return Err(object);
        };
        let id = id.unwrap_or_else(next_id);
        let (object, generation) = match token.upgrade() {
            Some(live) => (Some(object), live.generation.load(Ordering::Acquire)),
            None => (None, 0),
        };
        self.entries.insert(
            id,
            WeakEntry {
                object,
                token,
                generation,
            },
        );
        self.since_sweep += 1;
        if self.since_sweep >= SWEEP_EVERY {
            self.sweep();
        }
        Ok(id)
    }

    /// `None` when the id was never registered here.
    pub fn resolve(&self, id: RefId) -> Option<Result<RefObject, RefError>> {
        let entry = self.entries.get(&id)?;
        match (&entry.object, entry.is_live()) {
            (Some(object), true) => Some(Ok(object.clone())),
            _ => Some(Err(RefError::NotFound(id.to_string()))),
        }
    }

    pub fn forget(&mut self, id: RefId) {
        self.entries.remove(&id);
    }

    pub fn live_count(&self) -> usize {
        self.entries.values().filter(|e| e.is_live()).count()
    }

    fn sweep(&mut self) {
        self.since_sweep = 0;
        for entry in self.entries.values_mut() {
            if entry.object.is_some() && !entry.is_live() {
                entry.object = None;
            }
        }
    }
}

/// Strong registry, optionally bounded to the `keep` most recent entries.
///
/// With `rotate` the oldest entry is evicted to make room; without it a
/// registration beyond `keep` fails and is not retained.
pub struct StrongRotatingRegistry {
    keep: Option<usize>,
    rotate: bool,
    entries: HashMap<RefId, RefObject>,
    order: VecDeque<RefId>,
}

impl StrongRotatingRegistry {
    pub fn new(keep: usize, rotate: bool) -> Self {
        Self {
            keep: Some(keep),
            rotate,
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    pub fn unbounded() -> Self {
        Self {
            keep: None,
            rotate: false,
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    pub fn register(&mut self, object: RefObject, id: Option<RefId>) -> Result<RefId, RefError> {
        let id = id.unwrap_or_else(next_id);
        if self.entries.insert(id, object).is_some() {
            self.order.retain(|existing| *existing != id);
        }
        self.order.push_back(id);

        if let Some(keep) = self.keep {
            if self.order.len() > keep {
                if self.rotate {
                    if let Some(oldest) = self.order.pop_front() {
                        self.entries.remove(&oldest);
                    }
                } else {
                    self.order.pop_back();
                    self.entries.remove(&id);
                    return Err(RefError::Overflow { keep });
                }
            }
        }
        Ok(id)
    }

    pub fn resolve(&self, id: RefId) -> Option<RefObject> {
        self.entries.get(&id).cloned()
    }

    pub fn forget(&mut self, id: RefId) {
        if self.entries.remove(&id).is_some() {
            self.order.retain(|existing| *existing != id);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Which registry callbacks and values go to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RefPolicy {
    Weak,
    Strong,
    #[default]
    Hybrid,
}

/// The session's object registry: weak first, then a bounded strong map.
pub struct ObjectRegistry {
    policy: RefPolicy,
    weak: WeakRegistry,
    strong: StrongRotatingRegistry,
}

impl ObjectRegistry {
    pub fn new(config: &ReferenceConfig) -> Self {
        let strong = match config.policy {
            RefPolicy::Strong => StrongRotatingRegistry::unbounded(),
            RefPolicy::Weak | RefPolicy::Hybrid => {
                StrongRotatingRegistry::new(config.keep, config.rotate)
            }
        };
        Self {
            policy: config.policy,
            weak: WeakRegistry::new(),
            strong,
        }
    }

    pub fn register(&mut self, object: RefObject) -> Result<RefId, RefError> {
        self.register_as(object, None)
    }

    /// Register under a caller-chosen id, replacing whatever was there in
    /// either map, including a dead weak entry.
    pub fn register_as(&mut self, object: RefObject, id: Option<RefId>) -> Result<RefId, RefError> {
        if let Some(id) = id {
            self.weak.forget(id);
            self.strong.forget(id);
        }
        match self.policy {
            RefPolicy::Weak => self
                .weak
                .register(object, id)
                .map_err(|_| RefError::NotWeakable),
            RefPolicy::Strong => self.strong.register(object, id),
            RefPolicy::Hybrid => match self.weak.register(object, id) {
                Ok(id) => Ok(id),
                Err(object) => self.strong.register(object, id),
            },
        }
    }

    pub fn resolve(&self, id: RefId) -> Result<RefObject, RefError> {
        if let Some(found) = self.weak.resolve(id) {
            return found;
        }
        self.strong
            .resolve(id)
            .ok_or_else(|| RefError::NotFound(id.to_string()))
    }

    pub fn strong_len(&self) -> usize {
        self.strong.len()
    }
}
