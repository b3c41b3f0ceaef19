//! HTTP implementation of [`PersistenceApi`].

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Url};
use serde_json::{json, Value};
use tracing::debug;

use sandbox_bridge_core::config::PersistenceConfig;
use sandbox_bridge_core::types::{Identity, ImageRequest, PersistenceScope, UserProgress};

use crate::capabilities::PersistenceApi;

const DEFAULT_TIMEOUT_MS: u64 = 15_000;

pub struct HttpPersistenceApi {
    client: reqwest::Client,
    base_url: Url,
    api_token: Option<String>,
    identity: Identity,
}

impl HttpPersistenceApi {
    pub fn new(config: &PersistenceConfig, identity: Identity) -> anyhow::Result<Self> {
        let base_url = Url::parse(&config.base_url)
            .with_context(|| format!("Invalid persistence base_url: {}", config.base_url))?;
        if base_url.cannot_be_a_base() {
            anyhow::bail!("Persistence base_url cannot be a base: {base_url}");
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(
                config.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS),
            ))
            .build()?;
        Ok(Self {
            client,
            base_url,
            api_token: config.resolve_api_token(),
            identity,
        })
    }

    /// Append percent-encoded path segments to the base URL.
    pub fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn scope_endpoint(&self, scope: &PersistenceScope, tail: &[&str]) -> Url {
        let mut segments = vec![
            "lessons",
            scope.lesson_id.as_str(),
            "stages",
            scope.stage_id.as_str(),
            "substages",
            scope.substage_id.as_str(),
            "interactions",
            scope.interaction_type_id.as_str(),
        ];
        segments.extend_from_slice(tail);
        self.endpoint(&segments)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let mut builder = self
            .client
            .request(method, url)
            .header("content-type", "application/json");
        if let Some(tenant) = &self.identity.tenant_id {
            builder = builder.header("x-tenant-id", tenant);
        }
        if let Some(user) = &self.identity.user_id {
            builder = builder.header("x-user-id", user);
        }
        if let Some(token) = &self.api_token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        builder
    }

    async fn send(&self, builder: RequestBuilder) -> anyhow::Result<Value> {
        let response = builder.send().await?;
        let status = response.status();
        debug!(%status, url = %response.url(), "Persistence API response");

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Persistence API error {status}: {body}");
        }

        let body = response.text().await?;
        if body.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body).context("Persistence API returned invalid JSON")
    }
}

#[async_trait]
impl PersistenceApi for HttpPersistenceApi {
    async fn save_instance_data(&self, scope: &PersistenceScope, data: Value) -> anyhow::Result<Value> {
        let url = self.scope_endpoint(scope, &["instance-data"]);
        self.send(self.request(Method::POST, url).json(&json!({ "data": data })))
            .await
    }

    async fn instance_data_history(
        &self,
        scope: &PersistenceScope,
        filters: Value,
    ) -> anyhow::Result<Value> {
        let url = self.scope_endpoint(scope, &["instance-data", "history"]);
        self.send(self.request(Method::POST, url).json(&json!({ "filters": filters })))
            .await
    }

    async fn save_user_progress(
        &self,
        scope: &PersistenceScope,
        progress: &UserProgress,
    ) -> anyhow::Result<Value> {
        let url = self.scope_endpoint(scope, &["progress"]);
        self.send(self.request(Method::PUT, url).json(progress)).await
    }

    async fn user_progress(&self, scope: &PersistenceScope) -> anyhow::Result<Value> {
        let url = self.scope_endpoint(scope, &["progress"]);
        self.send(self.request(Method::GET, url)).await
    }

    async fn mark_completed(&self, scope: &PersistenceScope) -> anyhow::Result<Value> {
        let url = self.scope_endpoint(scope, &["complete"]);
        self.send(self.request(Method::POST, url)).await
    }

    async fn increment_attempts(&self, scope: &PersistenceScope) -> anyhow::Result<Value> {
        let url = self.scope_endpoint(scope, &["attempts"]);
        self.send(self.request(Method::POST, url)).await
    }

    async fn user_public_profile(&self, user_id: &str) -> anyhow::Result<Value> {
        let url = self.endpoint(&["users", user_id, "public-profile"]);
        self.send(self.request(Method::GET, url)).await
    }

    async fn generate_image(&self, lesson_id: &str, request: &ImageRequest) -> anyhow::Result<Value> {
        let url = self.endpoint(&["lessons", lesson_id, "images"]);
        self.send(self.request(Method::POST, url).json(request)).await
    }

    async fn lesson_images(&self, lesson_id: &str) -> anyhow::Result<Value> {
        let url = self.endpoint(&["lessons", lesson_id, "images"]);
        self.send(self.request(Method::GET, url)).await
    }

    async fn lesson_image_ids(&self, lesson_id: &str) -> anyhow::Result<Value> {
        let url = self.endpoint(&["lessons", lesson_id, "images", "ids"]);
        self.send(self.request(Method::GET, url)).await
    }

    async fn delete_image(&self, lesson_id: &str, image_id: &str) -> anyhow::Result<Value> {
        let url = self.endpoint(&["lessons", lesson_id, "images", image_id]);
        self.send(self.request(Method::DELETE, url)).await
    }
}

/// Stand-in used when no persistence API is configured. Every call fails,
/// which outcome-style operations surface as `{success: false}`.
pub struct UnconfiguredPersistence;

impl UnconfiguredPersistence {
    fn unavailable() -> anyhow::Result<Value> {
        anyhow::bail!("No persistence API configured")
    }
}

#[async_trait]
impl PersistenceApi for UnconfiguredPersistence {
    async fn save_instance_data(&self, _: &PersistenceScope, _: Value) -> anyhow::Result<Value> {
        Self::unavailable()
    }

    async fn instance_data_history(&self, _: &PersistenceScope, _: Value) -> anyhow::Result<Value> {
        Self::unavailable()
    }

    async fn save_user_progress(&self, _: &PersistenceScope, _: &UserProgress) -> anyhow::Result<Value> {
        Self::unavailable()
    }

    async fn user_progress(&self, _: &PersistenceScope) -> anyhow::Result<Value> {
        Self::unavailable()
    }

    async fn mark_completed(&self, _: &PersistenceScope) -> anyhow::Result<Value> {
        Self::unavailable()
    }

    async fn increment_attempts(&self, _: &PersistenceScope) -> anyhow::Result<Value> {
        Self::unavailable()
    }

    async fn user_public_profile(&self, _: &str) -> anyhow::Result<Value> {
        Self::unavailable()
    }

    async fn generate_image(&self, _: &str, _: &ImageRequest) -> anyhow::Result<Value> {
        Self::unavailable()
    }

    async fn lesson_images(&self, _: &str) -> anyhow::Result<Value> {
        Self::unavailable()
    }

    async fn lesson_image_ids(&self, _: &str) -> anyhow::Result<Value> {
        Self::unavailable()
    }

    async fn delete_image(&self, _: &str, _: &str) -> anyhow::Result<Value> {
        Self::unavailable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::Path;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::{get, put};
    use axum::{Json, Router};

    fn config(base_url: &str) -> PersistenceConfig {
        PersistenceConfig {
            base_url: base_url.to_string(),
            api_token: Some("tok".into()),
            api_token_env: None,
            timeout_ms: Some(2_000),
        }
    }

    fn identity() -> Identity {
        Identity {
            user_id: Some("u1".into()),
            tenant_id: Some("t1".into()),
        }
    }

    fn scope() -> PersistenceScope {
        PersistenceScope {
            lesson_id: "l 1".into(),
            stage_id: "st1".into(),
            substage_id: "s1".into(),
            interaction_type_id: "quiz".into(),
        }
    }

    #[test]
    fn test_scope_endpoint_encodes_segments() {
        let api = HttpPersistenceApi::new(&config("https://api.example/v1/"), identity()).unwrap();
        let url = api.scope_endpoint(&scope(), &["progress"]);
        assert_eq!(
            url.as_str(),
            "https://api.example/v1/lessons/l%201/stages/st1/substages/s1/interactions/quiz/progress"
        );
        assert_eq!(
            api.endpoint(&["users", "u/2", "public-profile"]).as_str(),
            "https://api.example/v1/users/u%2F2/public-profile"
        );
    }

    #[test]
    fn test_rejects_invalid_base_url() {
        assert!(HttpPersistenceApi::new(&config("not a url"), identity()).is_err());
        assert!(HttpPersistenceApi::new(&config("mailto:ops@example.com"), identity()).is_err());
    }

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn test_progress_roundtrip_sends_identity_headers() {
        async fn put_progress(
            Path((lesson, _stage, _sub, kind)): Path<(String, String, String, String)>,
            headers: HeaderMap,
            Json(body): Json<Value>,
        ) -> Json<Value> {
            Json(json!({
                "lesson": lesson,
                "kind": kind,
                "tenant": headers.get("x-tenant-id").and_then(|v| v.to_str().ok()),
                "user": headers.get("x-user-id").and_then(|v| v.to_str().ok()),
                "auth": headers.get("authorization").and_then(|v| v.to_str().ok()),
                "body": body,
            }))
        }

        let app = Router::new().route(
            "/lessons/{lesson}/stages/{stage}/substages/{sub}/interactions/{kind}/progress",
            put(put_progress),
        );
        let base = serve(app).await;
        let api = HttpPersistenceApi::new(&config(&base), identity()).unwrap();

        let progress = UserProgress {
            score: Some(0.0),
            ..Default::default()
        };
        let reply = api.save_user_progress(&scope(), &progress).await.unwrap();
        assert_eq!(reply["lesson"], "l 1");
        assert_eq!(reply["kind"], "quiz");
        assert_eq!(reply["tenant"], "t1");
        assert_eq!(reply["user"], "u1");
        assert_eq!(reply["auth"], "Bearer tok");
        assert_eq!(reply["body"], json!({"score": 0.0}));
    }

    #[tokio::test]
    async fn test_error_status_is_an_error() {
        let app = Router::new().route(
            "/lessons/{lesson}/images/ids",
            get(|| async { (StatusCode::SERVICE_UNAVAILABLE, "down") }),
        );
        let base = serve(app).await;
        let api = HttpPersistenceApi::new(&config(&base), identity()).unwrap();
        let err = api.lesson_image_ids("l1").await.unwrap_err();
        assert!(err.to_string().contains("503"));
    }

    #[tokio::test]
    async fn test_unconfigured_always_fails() {
        let api = UnconfiguredPersistence;
        assert!(api.lesson_images("l1").await.is_err());
    }
}
