use anyhow::{Context, Result};
use axum::{body::Body, http::Request, http::StatusCode, Router};
use faultline::server::build_router;
use faultline_core::Config;
use http_body_util::BodyExt;
use tower::ServiceExt;

/// The HTTP router driven in-process, without binding a socket.
pub struct TestApp {
    router: Router,
}

impl TestApp {
    pub fn new(mut config: Config) -> Self {
        config.server.cors_enabled = false;
        config.server.verbose = false;

        Self {
            router: build_router(&config),
        }
    }

    /// POST and fail unless the response is a 2xx.
    pub async fn post_json(
        &self,
        path: &str,
        payload: serde_json::Value,
    ) -> Result<serde_json::Value> {
        let (status, body) = self.post_json_status(path, payload).await?;
        if !status.is_success() {
            anyhow::bail!("request failed with status {}: {}", status, body);
        }
        Ok(body)
    }

    /// POST and hand back whatever status the router chose.
    pub async fn post_json_status(
        &self,
        path: &str,
        payload: serde_json::Value,
    ) -> Result<(StatusCode, serde_json::Value)> {
        let body = Body::from(serde_json::to_vec(&payload)?);
        let request = Request::builder()
            .method("POST")
            .uri(path)
            .header("content-type", "application/json")
            .body(body)?;

        self.execute(request).await
    }

    pub async fn get_json(&self, path: &str) -> Result<serde_json::Value> {
        let request = Request::builder()
            .method("GET")
            .uri(path)
            .body(Body::empty())?;

        let (status, body) = self.execute(request).await?;
        if !status.is_success() {
            anyhow::bail!("request failed with status {}", status);
        }
        Ok(body)
    }

    async fn execute(&self, request: Request<Body>) -> Result<(StatusCode, serde_json::Value)> {
        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .context("router execution failed")?;

        let status = response.status();
        let bytes = response.into_body().collect().await?.to_bytes();
        let body = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            // Extractor rejections come back as plain text.
            serde_json::from_slice(&bytes).unwrap_or_else(|_| {
                serde_json::Value::String(String::from_utf8_lossy(&bytes).into_owned())
            })
        };
        Ok((status, body))
    }
}
