use std::sync::Arc;

use axum::{extract::Request, middleware::Next, response::Response};
use serde_json::json;
use subtle::ConstantTimeEq;

use super::error::ApiError;
use crate::plugins::BrowserSession;

/// Extract a Bearer token from the Authorization header.
fn extract_bearer(req: &Request) -> Option<String> {
    let value = req.headers().get("authorization")?.to_str().ok()?;
    value.strip_prefix("Bearer ").map(str::to_string)
}

/// Extract a `?token=` value from the query string.
fn extract_query_token(req: &Request) -> Option<String> {
    req.uri().query().and_then(|query| {
        query
            .split('&')
            .find_map(|pair| pair.strip_prefix("token=").map(str::to_string))
    })
}

/// Token gate middleware.
///
/// 1. A browser whose session already carries a user passes.
/// 2. Otherwise a Bearer header or `?token=` must match `expected`; the
///    browser session, if any, is then marked as `user`.
/// 3. Anything else is rejected.
pub async fn require_token(
    expected: Arc<str>,
    user: Arc<str>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let browser = req.extensions().get::<BrowserSession>().cloned();
    if browser.as_ref().is_some_and(|b| b.auth().user().is_some()) {
        return Ok(next.run(req).await);
    }

    let Some(token) = extract_bearer(&req).or_else(|| extract_query_token(&req)) else {
        return Err(ApiError::AuthRequired);
    };
    if !bool::from(token.as_bytes().ct_eq(expected.as_bytes())) {
        tracing::warn!(path = %req.uri().path(), "rejected invalid token");
        return Err(ApiError::AuthInvalid);
    }

    if let Some(browser) = browser {
        browser.update(|ctx| ctx.insert("user", json!({ "name": &*user })));
    }
    Ok(next.run(req).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
        routing::get,
        Router,
    };
    use tower::ServiceExt;

    async fn ok_handler() -> &'static str {
        "ok"
    }

    fn test_app(token: &str) -> Router {
        let token: Arc<str> = Arc::from(token);
        let user: Arc<str> = Arc::from("tester");
        Router::new()
            .route("/test", get(ok_handler))
            .layer(axum::middleware::from_fn(move |req, next| {
                let t = token.clone();
                let u = user.clone();
                async move { require_token(t, u, req, next).await }
            }))
    }

    async fn status_of(app: Router, req: Request<Body>) -> StatusCode {
        app.oneshot(req).await.unwrap().status()
    }

    #[test]
    fn extract_bearer_with_header() {
        let req = Request::builder()
            .uri("/test")
            .header("authorization", "Bearer my-secret-token")
            .body(Body::empty())
            .unwrap();
        assert_eq!(extract_bearer(&req), Some("my-secret-token".to_string()));
    }

    #[test]
    fn extract_bearer_ignores_other_schemes() {
        let req = Request::builder()
            .uri("/test")
            .header("authorization", "Basic abc")
            .body(Body::empty())
            .unwrap();
        assert_eq!(extract_bearer(&req), None);
    }

    #[test]
    fn extract_query_token_among_params() {
        let req = Request::builder()
            .uri("/test?a=1&token=abc123")
            .body(Body::empty())
            .unwrap();
        assert_eq!(extract_query_token(&req), Some("abc123".to_string()));
    }

    #[tokio::test]
    async fn missing_token_is_401() {
        let req = Request::builder().uri("/test").body(Body::empty()).unwrap();
        assert_eq!(status_of(test_app("secret"), req).await, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn wrong_bearer_is_403() {
        let req = Request::builder()
            .uri("/test")
            .header("authorization", "Bearer wrong")
            .body(Body::empty())
            .unwrap();
        assert_eq!(status_of(test_app("secret"), req).await, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn correct_bearer_passes() {
        let req = Request::builder()
            .uri("/test")
            .header("authorization", "Bearer secret")
            .body(Body::empty())
            .unwrap();
        assert_eq!(status_of(test_app("secret"), req).await, StatusCode::OK);
    }

    #[tokio::test]
    async fn correct_query_token_passes() {
        let req = Request::builder()
            .uri("/test?token=secret")
            .body(Body::empty())
            .unwrap();
        assert_eq!(status_of(test_app("secret"), req).await, StatusCode::OK);
    }
}
