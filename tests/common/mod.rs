#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use futures::StreamExt;
use livepage::api::{self, AppState, RouterConfig};
use livepage::config::SessionsConfig;
use livepage::session::SessionSettings;
use livepage::shutdown::ShutdownCoordinator;
use livepage::{Handler, SessionManager};
use tokio::net::TcpListener;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

pub type Ws = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// A running server and the state behind it.
pub struct TestServer {
    pub addr: SocketAddr,
    pub state: AppState,
}

impl TestServer {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn ws_url(&self, path: &str) -> String {
        format!("ws://{}{}", self.addr, path)
    }

    pub fn manager(&self) -> &SessionManager {
        &self.state.manager
    }
}

/// Sessions config with processes visible in URLs, so tests can pick ids.
pub fn visible_sessions() -> SessionsConfig {
    SessionsConfig {
        hide_processes: false,
        ..Default::default()
    }
}

pub fn create_test_state(handler: Handler, limits: SessionsConfig) -> AppState {
    create_test_state_with(handler, limits, SessionSettings::default())
}

pub fn create_test_state_with(
    handler: Handler,
    limits: SessionsConfig,
    settings: SessionSettings,
) -> AppState {
    AppState {
        manager: SessionManager::new(handler, limits, settings),
        shutdown: ShutdownCoordinator::new(),
    }
}

/// Start a server whose sessions are reaped after `idle_timeout`.
pub async fn start_server_idle(
    handler: Handler,
    limits: SessionsConfig,
    idle_timeout: Duration,
) -> TestServer {
    let settings = SessionSettings {
        idle_timeout,
        ..SessionSettings::default()
    };
    start_server_with(
        create_test_state_with(handler, limits, settings),
        RouterConfig::default(),
    )
    .await
}

pub async fn start_server(handler: Handler, limits: SessionsConfig) -> TestServer {
    start_server_with(create_test_state(handler, limits), RouterConfig::default()).await
}

pub async fn start_server_with(state: AppState, config: RouterConfig) -> TestServer {
    let app = api::router(state.clone(), config);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    TestServer { addr, state }
}

/// Load the session page, then open its socket, like a browser would.
pub async fn open_page(server: &TestServer, process: &str) -> Ws {
    let response = reqwest::get(server.url(&format!("/{process}/"))).await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    connect(server, process).await
}

pub async fn connect(server: &TestServer, process: &str) -> Ws {
    let (ws, _response) = connect_async(server.ws_url(&format!("/{process}/socket")))
        .await
        .expect("WS connect failed");
    ws
}

/// Read text frames until one contains `needle`. Panics on timeout or close.
pub async fn recv_until(ws: &mut Ws, needle: &str) -> String {
    let wait = async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) if text.contains(needle) => {
                    return text.to_string();
                }
                Some(Ok(Message::Close(frame))) => {
                    panic!("socket closed while waiting for {needle:?}: {frame:?}")
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => panic!("socket error while waiting for {needle:?}: {e}"),
                None => panic!("socket ended while waiting for {needle:?}"),
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(5), wait)
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {needle:?}"))
}

/// Skip text frames until the server closes; returns the close code and reason.
pub async fn recv_close(ws: &mut Ws) -> (u16, String) {
    let wait = async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Close(Some(frame)))) => {
                    return (u16::from(frame.code), frame.reason.to_string());
                }
                Some(Ok(Message::Close(None))) => return (1005, String::new()),
                Some(Ok(_)) => continue,
                Some(Err(e)) => panic!("socket error while waiting for close: {e}"),
                None => panic!("socket ended without a close frame"),
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(5), wait)
        .await
        .expect("timed out waiting for close frame")
}

/// Poll `check` until it holds, for at most two seconds.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}

/// Pull the reference id out of a rendered `livepage.call(this, ID, event)`.
pub fn callback_id(text: &str) -> u64 {
    let start = text
        .find("livepage.call(this, ")
        .expect("no callback in frame")
        + "livepage.call(this, ".len();
    let digits: String = text[start..].chars().take_while(char::is_ascii_digit).collect();
    digits.parse().unwrap()
}

/// Pull the future id out of an eval command `livepage.evaluate(ID, ...)`.
pub fn evaluate_id(text: &str) -> u64 {
    let start = text
        .find("livepage.evaluate(")
        .expect("no evaluate in frame")
        + "livepage.evaluate(".len();
    let digits: String = text[start..].chars().take_while(char::is_ascii_digit).collect();
    digits.parse().unwrap()
}
