pub mod auth;
pub mod error;
mod handlers;
mod web;

use std::sync::Arc;

use axum::{
    extract::DefaultBodyLimit,
    http::{HeaderName, HeaderValue},
    routing::{get, post},
    Router,
};
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use crate::manager::SessionManager;
use crate::plugins::PluginSet;
use crate::shutdown::ShutdownCoordinator;

use handlers::*;

#[derive(Clone)]
pub struct AppState {
    pub manager: SessionManager,
    pub shutdown: ShutdownCoordinator,
}

/// Configuration for the HTTP/WS router.
///
/// Use `RouterConfig::default()` in tests for a setup without plugins or
/// rate limiting.
#[derive(Default)]
pub struct RouterConfig {
    /// Requests per second per client IP on session routes.
    pub rate_limit: Option<u32>,
    pub plugins: PluginSet,
}

pub fn router(state: AppState, config: RouterConfig) -> Router {
    let app = Router::new()
        .route("/", get(root))
        .route("/{process}/", get(main_page))
        .route("/{process}/socket", get(socket))
        .route("/{process}/method/{id}", get(method).post(method))
        .route("/{process}/file/{*path}", get(file))
        .route("/{process}/vfile/{*path}", get(vfile))
        .route("/{process}/post", post(post_future))
        .route("/{process}/queue", post(put_queue))
        .with_state(state.clone());

    let app = match config.rate_limit {
        Some(rps) => {
            use tower_governor::{
                governor::GovernorConfigBuilder, key_extractor::PeerIpKeyExtractor, GovernorLayer,
            };
            match GovernorConfigBuilder::default()
                .per_second(u64::from(rps))
                .burst_size(rps)
                .key_extractor(PeerIpKeyExtractor)
                .finish()
            {
                Some(governor_conf) => app.layer(GovernorLayer::new(Arc::new(governor_conf))),
                None => {
                    tracing::warn!(rps, "invalid rate limit, serving without one");
                    app
                }
            }
        }
        None => app,
    };

    // Plugins wrap the session routes only; health checks and the client
    // script stay reachable without a cookie or token.
    let app = config.plugins.apply(app);

    let open = Router::new()
        .route("/health", get(health))
        .route("/_/{*path}", get(web::client_asset))
        .with_state(state);

    Router::new()
        .merge(open)
        .merge(app)
        .layer(DefaultBodyLimit::max(1024 * 1024)) // 1 MB
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("x-frame-options"),
            HeaderValue::from_static("DENY"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("x-content-type-options"),
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("referrer-policy"),
            HeaderValue::from_static("no-referrer"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("permissions-policy"),
            HeaderValue::from_static("geolocation=(), microphone=(), camera=()"),
        ))
        .layer(TraceLayer::new_for_http())
}
