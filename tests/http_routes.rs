//! End-to-end tests for the per-process HTTP routes over a real server.
//!
//! Covers callbacks rendered into markup, `eval` round trips through the
//! `post` route, files, the token plugin, and rate limiting.

mod common;

use std::sync::Arc;

use futures::SinkExt;
use livepage::api::RouterConfig;
use livepage::plugins::{PluginEntry, PluginSet, TokenPlugin};
use livepage::{handler, CallArgs, Callback, Node, VirtualFile};
use serde_json::json;
use tokio_tungstenite::tungstenite::Message;

async fn send_event(ws: &mut common::Ws, event: serde_json::Value) {
    ws.send(Message::Text(event.to_string().into())).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_health() {
    let app = handler(|page| async move {
        page.recv().await;
        Ok(())
    });
    let server = common::start_server(app, common::visible_sessions()).await;

    let response = reqwest::get(server.url("/health")).await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["status"], "ok");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_rendered_callback_is_callable() {
    let app = handler(|page| async move {
        let log = page.clone();
        let button = Node::el("button")
            .on(
                "click",
                Callback::new(move |call: CallArgs| {
                    let log = log.clone();
                    async move {
                        let kind = call.args.first().map(|e| e["type"].clone());
                        log.print(Node::el("p").text("clicked"));
                        Ok(json!({ "seen": kind }))
                    }
                }),
            )
            .text("go");
        page.print(button);
        loop {
            page.recv().await;
        }
        #[allow(unreachable_code)]
        Ok(())
    });
    let server = common::start_server(app, common::visible_sessions()).await;
    let mut ws = common::open_page(&server, "btn").await;

    let frame = common::recv_until(&mut ws, "livepage.call(this, ").await;
    let id = common::callback_id(&frame);

    let response = reqwest::Client::new()
        .post(server.url(&format!("/btn/method/{id}")))
        .json(&json!([{ "type": "click" }]))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["seen"], "click");

    common::recv_until(&mut ws, "clicked").await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_eval_round_trip() {
    let app = handler(|page| async move {
        page.recv().await;
        let value = page.eval("6 * 7").await?;
        page.print(Node::el("p").text(format!("answer {value}")));
        page.recv().await;
        Ok(())
    });
    let server = common::start_server(app, common::visible_sessions()).await;
    let mut ws = common::open_page(&server, "ev").await;
    send_event(&mut ws, json!({ "type": "go" })).await;

    let frame = common::recv_until(&mut ws, "livepage.evaluate(").await;
    assert!(frame.contains("6 * 7"));
    let reqid = common::evaluate_id(&frame);

    let response = reqwest::Client::new()
        .post(server.url("/ev/post"))
        .json(&json!({ "reqid": reqid, "value": 42 }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    common::recv_until(&mut ws, "answer 42").await;

    // A second settlement of the same future is ignored.
    let response = reqwest::Client::new()
        .post(server.url("/ev/post"))
        .json(&json!({ "reqid": reqid, "value": 0 }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_files_linked_from_markup() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("report.txt");
    std::fs::write(&path, "quarterly numbers").unwrap();

    let app = handler(move |page| {
        let path = path.clone();
        async move {
            let file_url = page.file_url(&path);
            let vfile_url = page.vfile_url(VirtualFile::new(
                "<svg></svg>",
                Some("logo.svg"),
                None,
            ));
            page.print(
                Node::el("div")
                    .child(Node::el("a").attr("href", file_url).text("report"))
                    .child(Node::el("img").attr("src", vfile_url)),
            );
            page.recv().await;
            Ok(())
        }
    });
    let server = common::start_server(app, common::visible_sessions()).await;
    let mut ws = common::open_page(&server, "files").await;

    let frame = common::recv_until(&mut ws, "/files/vfile/").await;

    let response = reqwest::get(server.url(link(&frame, "/files/file/")))
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert_eq!(response.text().await.unwrap(), "quarterly numbers");

    let response = reqwest::get(server.url(link(&frame, "/files/vfile/")))
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert_eq!(
        response.headers()[reqwest::header::CONTENT_TYPE],
        "image/svg+xml"
    );
}

/// The attribute value starting with `prefix`, as quoted inside a JSON frame.
fn link<'a>(frame: &'a str, prefix: &str) -> &'a str {
    let start = frame.find(prefix).unwrap();
    let end = start + frame[start..].find('\\').unwrap();
    &frame[start..end]
}

#[tokio::test(flavor = "multi_thread")]
async fn test_token_plugin_remembers_browser() {
    let app = handler(|page| async move {
        let user = page.auth().user().unwrap_or_default();
        page.print(Node::el("p").text(format!("user {user}")));
        page.recv().await;
        Ok(())
    });
    let state = common::create_test_state(app, common::visible_sessions());
    let plugins = PluginSet::resolve(vec![PluginEntry::new(
        "auth",
        Arc::new(TokenPlugin::new("s3cret", "carol")),
    )])
    .unwrap();
    let server = common::start_server_with(
        state,
        RouterConfig {
            plugins,
            ..Default::default()
        },
    )
    .await;
    let client = reqwest::Client::new();

    let response = client.get(server.url("/tok/")).send().await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::UNAUTHORIZED);

    let response = client
        .get(server.url("/tok/"))
        .bearer_auth("wrong")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::FORBIDDEN);

    let response = client
        .get(server.url("/tok/?token=s3cret"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let cookie = response.headers()[reqwest::header::SET_COOKIE]
        .to_str()
        .unwrap()
        .split(';')
        .next()
        .unwrap()
        .to_string();
    assert!(cookie.starts_with("livepage_session="));
    assert_eq!(
        server.manager().get("tok").unwrap().user().as_deref(),
        Some("carol")
    );

    // The cookie alone is enough afterwards.
    let response = client
        .get(server.url("/tok/"))
        .header(reqwest::header::COOKIE, &cookie)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);

    // The client script needs no token.
    let response = client.get(server.url("/_/livepage.js")).send().await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_rate_limit_rejects_bursts() {
    let app = handler(|page| async move {
        page.recv().await;
        Ok(())
    });
    let state = common::create_test_state(app, common::visible_sessions());
    let server = common::start_server_with(
        state,
        RouterConfig {
            rate_limit: Some(1),
            ..Default::default()
        },
    )
    .await;
    let client = reqwest::Client::new();

    let mut statuses = Vec::new();
    for _ in 0..5 {
        let response = client.get(server.url("/rl/")).send().await.unwrap();
        statuses.push(response.status());
    }
    assert_eq!(statuses[0], reqwest::StatusCode::OK);
    assert!(statuses.contains(&reqwest::StatusCode::TOO_MANY_REQUESTS));

    // Health is outside the limiter.
    let response = client.get(server.url("/health")).send().await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
}
