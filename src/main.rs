//! livepage - server-driven live pages
//!
//! Serves a small demo application: every browser tab gets its own
//! session, whose handler keeps running across reloads and reconnects.
//!
//! ## Commands
//!
//! **`serve`** (default): Load the config, resolve plugins, and serve
//! HTTP/WS until Ctrl+C, then drain sessions and close sockets.
//!
//! **`check-config`**: Load and validate the config and plugin graph,
//! then exit.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser as ClapParser, Subcommand};
use thiserror::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use livepage::{
    api,
    config::{self, Config, ConfigError},
    handler,
    plugins::{PluginError, PluginSet},
    shutdown::ShutdownCoordinator,
    CallArgs, Callback, Node, Page, SessionManager,
};

/// livepage - server-driven live pages
#[derive(ClapParser, Debug)]
#[command(name = "livepage", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Config file (defaults to the platform config dir)
    #[arg(long, env = "LIVEPAGE_CONFIG")]
    config: Option<PathBuf>,

    /// Address to bind, overriding `server.bind`
    #[arg(long, env = "LIVEPAGE_BIND")]
    bind: Option<SocketAddr>,

    /// Show error details in the browser
    #[arg(long, env = "LIVEPAGE_DEBUG")]
    debug: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Serve the demo application (default)
    Serve,
    /// Validate the config file and plugin graph
    CheckConfig,
}

#[derive(Error, Debug)]
pub enum LivepageError {
    #[error("{0}")]
    Config(#[from] ConfigError),

    #[error("plugin error: {0}")]
    Plugin(#[from] PluginError),

    #[error("task join error: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[tokio::main]
async fn main() -> Result<(), LivepageError> {
    let cli = Cli::parse();
    init_tracing();

    let config = load_config(&cli)?;
    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => run_server(config).await,
        Commands::CheckConfig => check_config(&config),
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "livepage=info,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_config(cli: &Cli) -> Result<Config, LivepageError> {
    let path = cli.config.clone().or_else(config::default_config_path);
    let mut config = match &path {
        Some(path) => match Config::load(path)? {
            Some(config) => {
                tracing::info!(path = %path.display(), "loaded config");
                config
            }
            None if cli.config.is_some() => {
                tracing::warn!(path = %path.display(), "config file not found, using defaults");
                Config::default()
            }
            None => Config::default(),
        },
        None => Config::default(),
    };
    if let Some(bind) = cli.bind {
        config.server.bind = bind;
    }
    if cli.debug {
        config.server.debug = true;
    }
    Ok(config)
}

fn check_config(config: &Config) -> Result<(), LivepageError> {
    config.validate()?;
    let plugins = PluginSet::from_config(&config.plugins)?;
    println!("config ok");
    println!("  bind: {}", config.server.bind);
    println!(
        "  sessions: soft_cap={} hard_cap={} idle_timeout={}s",
        config.sessions.soft_cap, config.sessions.hard_cap, config.sessions.idle_timeout_secs
    );
    println!("  plugins: {}", plugins.names().join(", "));
    Ok(())
}

// ── Demo application ───────────────────────────────────────────────

async fn counter(page: Page) -> anyhow::Result<()> {
    page.set_title("livepage");
    page.print(Node::el("h1").text("Counter"));
    page.print(Node::el("div").id("count").text("0"));

    let count = Arc::new(AtomicU64::new(0));
    let display = page.select("#count");
    let increment = Callback::new(move |_: CallArgs| {
        let count = count.clone();
        let display = display.clone();
        async move {
            let n = count.fetch_add(1, Ordering::Relaxed) + 1;
            display.set(Node::text(n.to_string()));
            Ok(())
        }
    });
    page.print(Node::el("button").on("click", increment).text("+1"));

    let log = page.select("#events");
    page.print(Node::el("ul").id("events"));
    loop {
        let event = page.recv().await;
        tracing::debug!(process = page.process(), kind = %event.kind, "application event");
        log.without_history()
            .print(Node::el("li").text(format!("{}: {:?}", event.kind, event.data)));
    }
}

// ── Server mode ────────────────────────────────────────────────────

async fn run_server(config: Config) -> Result<(), LivepageError> {
    tracing::info!("livepage server starting");

    let plugins = PluginSet::from_config(&config.plugins)?;
    if !plugins.is_empty() {
        tracing::info!(plugins = ?plugins.names(), "plugins resolved");
    }

    let bind = config.server.bind;
    let grace = config.sessions.shutdown_grace();
    let manager = SessionManager::from_config(handler(counter), &config);
    let shutdown = ShutdownCoordinator::new();
    let state = api::AppState {
        manager: manager.clone(),
        shutdown: shutdown.clone(),
    };
    let app = api::router(
        state,
        api::RouterConfig {
            rate_limit: config.server.rate_limit,
            plugins,
        },
    );

    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!(addr = %listener.local_addr()?, "HTTP/WS server listening");

    // Oneshot channel for server shutdown on Ctrl+C
    let (server_shutdown_tx, server_shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let http_handle = tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async {
            server_shutdown_rx.await.ok();
        })
        .await
    });

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(?e, "cannot listen for Ctrl+C");
    } else {
        tracing::info!("received Ctrl+C");
    }

    let drained = manager.drain(grace).await;
    tracing::info!(drained, "sessions drained");

    // Signal WebSocket handlers to send close frames
    shutdown.shutdown();
    if !shutdown.wait_idle(Duration::from_secs(2)).await {
        tracing::warn!(active = shutdown.active_count(), "sockets still open at shutdown");
    }

    let _ = server_shutdown_tx.send(());
    http_handle.await??;

    tracing::info!("livepage server exiting");
    Ok(())
}
