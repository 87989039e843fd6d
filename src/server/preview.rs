//! Static preview page.
//!
//! The template is read once at startup; `{{key}}` placeholders are filled
//! from the configured data map and the rendered page is served as-is.

use std::collections::HashMap;
use std::path::Path;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;

/// A pre-rendered HTML page.
#[derive(Clone)]
pub struct PreviewPage {
    html: Bytes,
}

impl PreviewPage {
    /// Load the template and substitute the data values.
    pub async fn load(
        template_path: &Path,
        data: &HashMap<String, serde_json::Value>,
    ) -> std::io::Result<Self> {
        let mut html = tokio::fs::read_to_string(template_path).await?;
        for (key, value) in data {
            let placeholder = format!("{{{{{}}}}}", key);
            let rendered = match value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            html = html.replace(&placeholder, &rendered);
        }
        Ok(Self {
            html: Bytes::from(html),
        })
    }

    pub fn html(&self) -> &Bytes {
        &self.html
    }
}

pub async fn preview_handler(State(page): State<PreviewPage>) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/html; charset=utf-8")],
        page.html.clone(),
    )
        .into_response()
}
