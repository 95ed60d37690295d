use axum::extract::Path;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use rust_embed::Embed;

#[derive(Embed)]
#[folder = "assets/"]
struct ClientAssets;

/// Serve the embedded browser client under `/_/`.
pub async fn client_asset(Path(path): Path<String>) -> Response {
    let Some(file) = ClientAssets::get(&path) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let mime = mime_guess::from_path(&path).first_or_text_plain().to_string();
    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, mime),
            (header::CACHE_CONTROL, "no-cache".to_string()),
        ],
        file.data.into_owned(),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_script_is_embedded() {
        let file = ClientAssets::get("livepage.js").expect("assets/livepage.js should be embedded");
        let content = std::str::from_utf8(&file.data).unwrap();
        assert!(content.contains("livepage"));
    }

    #[tokio::test]
    async fn unknown_asset_is_404() {
        let response = client_asset(Path("nope.js".to_string())).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn client_script_is_javascript() {
        let response = client_asset(Path("livepage.js".to_string())).await;
        assert_eq!(response.status(), StatusCode::OK);
        let mime = response.headers()[header::CONTENT_TYPE].to_str().unwrap();
        assert!(mime.contains("javascript"));
    }
}
