//! Request middleware plugins and their capability contract.
//!
//! A plugin exports capabilities (`"session"`, `"auth"`) and requires
//! others. [`PluginSet::resolve`] checks that every requirement has a
//! provider and orders plugins so providers wrap their dependents.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use axum::extract::Request;
use axum::http::{header, HeaderMap, HeaderValue};
use axum::middleware::Next;
use axum::response::Response;
use axum::Router;
use parking_lot::Mutex;
use rand::Rng;

use crate::config::{PluginConfig, PluginKind};
use crate::session::AuthContext;

/// Name of the cookie identifying a browser across requests.
pub const SESSION_COOKIE: &str = "livepage_session";

/// Browser sessions kept before the oldest is forgotten.
const MAX_BROWSER_SESSIONS: usize = 10_000;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PluginError {
    #[error("plugin '{plugin}' requires the '{capability}' capability, but no enabled plugin exports it")]
    MissingCapability { plugin: String, capability: String },
    #[error("plugin dependency cycle involving '{0}'")]
    Cycle(String),
    #[error("plugin '{plugin}' is misconfigured: {reason}")]
    Misconfigured { plugin: String, reason: String },
}

pub trait Plugin: Send + Sync {
    fn exports(&self) -> Vec<&'static str>;

    fn requires(&self) -> Vec<&'static str> {
        Vec::new()
    }

    /// Wrap `router` with this plugin's middleware.
    fn apply(&self, router: Router) -> Router;
}

/// A plugin as configured, before resolution.
pub struct PluginEntry {
    pub name: String,
    pub plugin: Arc<dyn Plugin>,
    pub enabled: bool,
    pub required: bool,
}

impl PluginEntry {
    pub fn new(name: impl Into<String>, plugin: Arc<dyn Plugin>) -> Self {
        Self {
            name: name.into(),
            plugin,
            enabled: true,
            required: true,
        }
    }
}

/// Resolved plugins, providers first.
#[derive(Default)]
pub struct PluginSet {
    ordered: Vec<(String, Arc<dyn Plugin>)>,
}

impl std::fmt::Debug for PluginSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginSet")
            .field("plugins", &self.names())
            .finish()
    }
}

impl PluginSet {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build the plugins named in the config file.
    pub fn from_config(plugins: &BTreeMap<String, PluginConfig>) -> Result<Self, PluginError> {
        let mut entries = Vec::with_capacity(plugins.len());
        for (name, config) in plugins {
            let plugin: Arc<dyn Plugin> = match config.kind {
                PluginKind::Session => Arc::new(SessionPlugin::new()),
                PluginKind::Token => {
                    let token = config.token.clone().ok_or_else(|| PluginError::Misconfigured {
                        plugin: name.clone(),
                        reason: "missing `token`".into(),
                    })?;
                    let user = config.user.clone().unwrap_or_else(|| name.clone());
                    Arc::new(TokenPlugin::new(token, user))
                }
            };
            entries.push(PluginEntry {
                name: name.clone(),
                plugin,
                enabled: config.enabled,
                required: config.required,
            });
        }
        Self::resolve(entries)
    }

    pub fn resolve(configured: Vec<PluginEntry>) -> Result<Self, PluginError> {
        let mut plugins: Vec<PluginEntry> = configured.into_iter().filter(|p| p.enabled).collect();

        let mut exports: HashMap<&'static str, usize> = HashMap::new();
        for (index, entry) in plugins.iter().enumerate() {
            for capability in entry.plugin.exports() {
                exports.insert(capability, index);
            }
        }
        if !exports.contains_key("session") {
            exports.insert("session", plugins.len());
            plugins.push(PluginEntry {
                name: "session".into(),
                plugin: Arc::new(SessionPlugin::new()),
                enabled: true,
                required: false,
            });
        }

        let mut dependencies: Vec<Vec<usize>> = Vec::with_capacity(plugins.len());
        for entry in &plugins {
            let mut providers = Vec::new();
            for capability in entry.plugin.requires() {
                let provider =
                    *exports
                        .get(capability)
                        .ok_or_else(|| PluginError::MissingCapability {
                            plugin: entry.name.clone(),
                            capability: capability.to_string(),
                        })?;
                providers.push(provider);
            }
            dependencies.push(providers);
        }
        for providers in &dependencies {
            for &provider in providers {
                plugins[provider].required = true;
            }
        }

        let order = topological_order(&dependencies)
            .map_err(|index| PluginError::Cycle(plugins[index].name.clone()))?;

        let ordered: Vec<(String, Arc<dyn Plugin>)> = order
            .into_iter()
            .filter(|&index| plugins[index].required)
            .map(|index| (plugins[index].name.clone(), plugins[index].plugin.clone()))
            .collect();
        for (name, _) in &ordered {
            tracing::info!(plugin = %name, "set up plugin");
        }
        Ok(Self { ordered })
    }

    pub fn names(&self) -> Vec<&str> {
        self.ordered.iter().map(|(name, _)| name.as_str()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }

    /// Layer every plugin onto `router`. The layer added last runs first, so
    /// dependents are applied before their providers.
    pub fn apply(&self, router: Router) -> Router {
        self.ordered
            .iter()
            .rev()
            .fold(router, |router, (_, plugin)| plugin.apply(router))
    }
}

/// Kahn's algorithm over `deps[i]` = plugins `i` depends on. Returns the
/// index of a plugin on a cycle when there is one.
fn topological_order(deps: &[Vec<usize>]) -> Result<Vec<usize>, usize> {
    let mut pending: Vec<usize> = deps.iter().map(Vec::len).collect();
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); deps.len()];
    for (index, providers) in deps.iter().enumerate() {
        for &provider in providers {
            dependents[provider].push(index);
        }
    }
    let mut ready: VecDeque<usize> = (0..deps.len()).filter(|&i| pending[i] == 0).collect();
    let mut order = Vec::with_capacity(deps.len());
    while let Some(index) = ready.pop_front() {
        order.push(index);
        for &dependent in &dependents[index] {
            pending[dependent] -= 1;
            if pending[dependent] == 0 {
                ready.push_back(dependent);
            }
        }
    }
    match pending.iter().position(|&n| n > 0) {
        Some(stuck) => Err(stuck),
        None => Ok(order),
    }
}

#[derive(Default)]
struct StoreInner {
    contexts: HashMap<String, AuthContext>,
    order: VecDeque<String>,
}

/// Per-browser auth contexts keyed by session cookie.
#[derive(Clone, Default)]
pub struct BrowserSessions {
    inner: Arc<Mutex<StoreInner>>,
}

impl BrowserSessions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.lock().contexts.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn create(&self) -> String {
        let id: String = rand::thread_rng()
            .sample_iter(&rand::distributions::Alphanumeric)
            .take(32)
            .map(char::from)
            .collect();
        let mut inner = self.inner.lock();
        inner.contexts.insert(id.clone(), AuthContext::default());
        inner.order.push_back(id.clone());
        while inner.order.len() > MAX_BROWSER_SESSIONS {
            if let Some(old) = inner.order.pop_front() {
                inner.contexts.remove(&old);
            }
        }
        id
    }
}

/// The calling browser's session, placed in request extensions by the
/// session plugin.
#[derive(Clone)]
pub struct BrowserSession {
    pub id: String,
    store: BrowserSessions,
}

impl BrowserSession {
    pub fn auth(&self) -> AuthContext {
        self.store
            .inner
            .lock()
            .contexts
            .get(&self.id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn update(&self, f: impl FnOnce(&mut AuthContext)) {
        if let Some(ctx) = self.store.inner.lock().contexts.get_mut(&self.id) {
            f(ctx);
        }
    }
}

pub(crate) fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .find_map(|pair| {
            let (key, value) = pair.trim().split_once('=')?;
            (key == name).then(|| value.to_string())
        })
}

async fn session_cookie(store: BrowserSessions, mut req: Request, next: Next) -> Response {
    let known = cookie_value(req.headers(), SESSION_COOKIE).filter(|id| store.contains(id));
    let (id, fresh) = match known {
        Some(id) => (id, false),
        None => (store.create(), true),
    };
    req.extensions_mut().insert(BrowserSession {
        id: id.clone(),
        store,
    });
    let mut response = next.run(req).await;
    if fresh {
        let cookie = format!("{SESSION_COOKIE}={id}; Path=/; HttpOnly; SameSite=Lax");
        if let Ok(value) = HeaderValue::from_str(&cookie) {
            response.headers_mut().append(header::SET_COOKIE, value);
        }
    }
    response
}

/// Cookie-backed browser sessions.
pub struct SessionPlugin {
    store: BrowserSessions,
}

impl SessionPlugin {
    pub fn new() -> Self {
        Self {
            store: BrowserSessions::new(),
        }
    }

    pub fn store(&self) -> &BrowserSessions {
        &self.store
    }
}

impl Default for SessionPlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl Plugin for SessionPlugin {
    fn exports(&self) -> Vec<&'static str> {
        vec!["session"]
    }

    fn apply(&self, router: Router) -> Router {
        let store = self.store.clone();
        router.layer(axum::middleware::from_fn(move |req, next| {
            let store = store.clone();
            async move { session_cookie(store, req, next).await }
        }))
    }
}

/// Shared-secret gate. A browser that presented the token once stays
/// authenticated through its session cookie.
pub struct TokenPlugin {
    token: Arc<str>,
    user: Arc<str>,
}

impl TokenPlugin {
    pub fn new(token: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            token: Arc::from(token.into()),
            user: Arc::from(user.into()),
        }
    }
}

impl Plugin for TokenPlugin {
    fn exports(&self) -> Vec<&'static str> {
        vec!["auth"]
    }

    fn requires(&self) -> Vec<&'static str> {
        vec!["session"]
    }

    fn apply(&self, router: Router) -> Router {
        let token = self.token.clone();
        let user = self.user.clone();
        router.layer(axum::middleware::from_fn(move |req, next| {
            let token = token.clone();
            let user = user.clone();
            async move { crate::api::auth::require_token(token, user, req, next).await }
        }))
    }
}
