use std::collections::HashMap;

use axum::{
    body::Bytes,
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Extension, FromRequest, Path, Query, RawQuery, Request, State,
    },
    http::{header, HeaderValue},
    response::{Html, IntoResponse, Redirect, Response},
    Form, Json,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;

use crate::manager::{new_process_id, RequestContext};
use crate::plugins::BrowserSession;
use crate::protocol::CLOSE_MISSING_PROCESS;
use crate::registry::{CallArgs, CallResult, RefId, RefObject};
use crate::session::Session;

use super::error::ApiError;
use super::AppState;

#[derive(Serialize)]
pub(super) struct HealthResponse {
    status: &'static str,
    sessions: usize,
}

pub(super) async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        sessions: state.manager.len(),
    })
}

fn request_context(
    query: HashMap<String, String>,
    browser: Option<Extension<BrowserSession>>,
) -> RequestContext {
    RequestContext {
        query,
        auth: browser.map(|Extension(b)| b.auth()).unwrap_or_default(),
    }
}

/// The session shell must never be cached: a reload has to reach the
/// server so the next socket replays history.
fn shell_response(html: String) -> Response {
    let mut response = Html(html).into_response();
    let headers = response.headers_mut();
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-cache, no-store, must-revalidate"),
    );
    headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
    headers.insert(header::EXPIRES, HeaderValue::from_static("0"));
    response
}

/// `/`: start a new session. With hidden processes the shell is served
/// right here; otherwise the browser is sent to the session's own URL.
pub(super) async fn root(
    State(state): State<AppState>,
    RawQuery(raw_query): RawQuery,
    Query(query): Query<HashMap<String, String>>,
    browser: Option<Extension<BrowserSession>>,
) -> Result<Response, ApiError> {
    let process = new_process_id();
    if state.manager.hide_processes() {
        let session =
            state
                .manager
                .get_or_create(&process, true, request_context(query, browser))?;
        return Ok(shell_response(session.main_page()));
    }
    let url = match raw_query {
        Some(q) if !q.is_empty() => format!("/{process}/?{q}"),
        _ => format!("/{process}/"),
    };
    Ok(Redirect::temporary(&url).into_response())
}

pub(super) async fn main_page(
    State(state): State<AppState>,
    Path(process): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    browser: Option<Extension<BrowserSession>>,
) -> Result<Response, ApiError> {
    let session = state
        .manager
        .get_or_create(&process, true, request_context(query, browser))?;
    state.manager.declare_active(&process);
    Ok(shell_response(session.main_page()))
}

pub(super) async fn socket(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(process): Path<String>,
) -> Response {
    match state.manager.get(&process) {
        Ok(session) => ws.on_upgrade(move |socket| serve_socket(state, session, socket)),
        Err(_) => ws.on_upgrade(close_missing),
    }
}

async fn close_missing(mut socket: WebSocket) {
    let frame = CloseFrame {
        code: CLOSE_MISSING_PROCESS,
        reason: "Missing application".into(),
    };
    let _ = socket.send(Message::Close(Some(frame))).await;
}

async fn shutdown_signalled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

async fn serve_socket(state: AppState, session: Session, socket: WebSocket) {
    // Register this connection for graceful shutdown tracking
    let (_guard, mut shutdown_rx) = state.shutdown.register();
    // Claim first: a racing clean close of the previous socket must not
    // leave this session listed as dormant.
    let claim = session.claim_socket();
    state.manager.declare_active(&session.process);

    let attach = session.attach(socket, claim);
    tokio::pin!(attach);
    let outcome = tokio::select! {
        outcome = &mut attach => outcome,
        _ = shutdown_signalled(&mut shutdown_rx) => {
            tracing::debug!(process = %session.process, "socket received shutdown signal");
            session.destroy();
            attach.await
        }
    };
    state.manager.on_detach(&session, &outcome);
}

/// Positional arguments from a method body. Empty means none, an array is
/// spread, any other JSON value is a single argument, and anything that is
/// not JSON is passed through as one string.
pub(crate) fn parse_args(body: &[u8]) -> Vec<Value> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Vec::new();
    }
    match serde_json::from_slice::<Value>(body) {
        Ok(Value::Array(args)) => args,
        Ok(value) => vec![value],
        Err(_) => vec![Value::String(String::from_utf8_lossy(body).into_owned())],
    }
}

fn is_form(req: &Request) -> bool {
    req.headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("application/x-www-form-urlencoded"))
}

async fn read_args(req: Request) -> Result<Vec<Value>, ApiError> {
    if is_form(&req) {
        let Form(fields) = Form::<HashMap<String, String>>::from_request(req, &())
            .await
            .map_err(|e| ApiError::InvalidRequest(e.body_text()))?;
        let fields = fields.into_iter().map(|(k, v)| (k, Value::String(v))).collect();
        return Ok(vec![Value::Object(fields)]);
    }
    let body = Bytes::from_request(req, &())
        .await
        .map_err(|e| ApiError::InvalidRequest(e.body_text()))?;
    Ok(parse_args(&body))
}

pub(super) async fn method(
    State(state): State<AppState>,
    Path((process, id)): Path<(String, RefId)>,
    Query(kwargs): Query<HashMap<String, String>>,
    req: Request,
) -> Result<Response, ApiError> {
    let session = state.manager.get(&process)?;
    let callback = match session.resolve_object(id)? {
        RefObject::Function(callback) => callback,
        RefObject::Value(_) => return Err(ApiError::NotCallable(id)),
    };
    let args = read_args(req).await?;

    let result = callback.call(CallArgs { args, kwargs }).await.map_err(|e| {
        tracing::warn!(%process, id, error = %e, "callback failed");
        ApiError::Application {
            message: "Application error.".into(),
            detail: session.debug().then(|| format!("{e:?}")),
        }
    })?;

    Ok(match result {
        CallResult::Empty => Json(Value::Null).into_response(),
        CallResult::Json(value) => Json(value).into_response(),
        CallResult::Html(node) => {
            let markup = session
                .render_fragment(&node)
                .map_err(|e| ApiError::RenderFailed(e.to_string()))?;
            Html(markup).into_response()
        }
    })
}

pub(super) async fn file(
    State(state): State<AppState>,
    Path((process, path)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let session = state.manager.get(&process)?;
    let resolved = session
        .registries()
        .files
        .lock()
        .resolve(&path)
        .map_err(|_| ApiError::FileNotFound(path.clone()))?;
    let content = tokio::fs::read(&resolved).await.map_err(|e| {
        tracing::debug!(%process, path = %resolved.display(), error = %e, "cannot read file");
        ApiError::FileNotFound(path.clone())
    })?;
    let mime = mime_guess::from_path(&resolved).first_or_octet_stream().to_string();
    Ok((
        [
            (header::CONTENT_TYPE, mime),
            (header::CACHE_CONTROL, "no-cache".to_string()),
        ],
        content,
    )
        .into_response())
}

pub(super) async fn vfile(
    State(state): State<AppState>,
    Path((process, path)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let session = state.manager.get(&process)?;
    let file = session
        .registries()
        .vfiles
        .lock()
        .resolve(&path)
        .map_err(|_| ApiError::FileNotFound(path.clone()))?;
    Ok(([(header::CONTENT_TYPE, file.media_type)], file.content).into_response())
}

#[derive(Deserialize)]
pub(super) struct PostBody {
    reqid: RefId,
    #[serde(default)]
    value: Value,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Deserialize)]
pub(super) struct QueueBody {
    reqid: RefId,
    value: Value,
}

fn parse_json<T: serde::de::DeserializeOwned>(body: &[u8]) -> Result<T, ApiError> {
    serde_json::from_slice(body).map_err(|e| ApiError::InvalidRequest(e.to_string()))
}

fn ok_status() -> Json<Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

/// Settle a pending future. Unknown or already settled ids are ignored.
pub(super) async fn post_future(
    State(state): State<AppState>,
    Path(process): Path<String>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let session = state.manager.get(&process)?;
    let body: PostBody = parse_json(&body)?;
    let mut futures = session.registries().futures.lock();
    let settled = match body.error {
        Some(Value::String(message)) => futures.reject(body.reqid, message),
        Some(error) => futures.reject(body.reqid, error.to_string()),
        None => futures.resolve(body.reqid, body.value),
    };
    if !settled {
        tracing::debug!(%process, reqid = body.reqid, "ignoring settlement of unknown future");
    }
    Ok(ok_status())
}

pub(super) async fn put_queue(
    State(state): State<AppState>,
    Path(process): Path<String>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let session = state.manager.get(&process)?;
    let body: QueueBody = parse_json(&body)?;
    session.registries().queues.lock().put(body.reqid, body.value)?;
    Ok(ok_status())
}
