pub mod health;

use axum::{
    routing::{get, post},
    Router,
};

use crate::assistant::handlers::handle_assistant;
use crate::generation::handlers::handle_generate;
use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_handler))
        // Conversational assistant (SSE)
        .route("/api/v1/ai/assistant", post(handle_assistant))
        // Single-shot generation
        .route("/api/v1/ai/generate", post(handle_generate))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use sqlx::postgres::PgPoolOptions;
    use tower::ServiceExt;
    use uuid::Uuid;

    use super::*;
    use crate::assistant::attachment::RemoteAttachments;
    use crate::auth::{tests::sign, JwtVerifier};
    use crate::config::{AssistantLimits, Config};
    use crate::llm_client::LlmClient;

    const SECRET: &str = "test-secret";

    fn test_state() -> AppState {
        let config = Config {
            database_url: "postgres://localhost/recruiter_test".into(),
            redis_url: "redis://127.0.0.1:1/".into(),
            s3_endpoint: "http://127.0.0.1:9000".into(),
            aws_access_key_id: "test".into(),
            aws_secret_access_key: "test".into(),
            jwt_secret: SECRET.into(),
            anthropic_api_key: None,
            anthropic_base_url: "http://127.0.0.1:1".into(),
            google_api_key: None,
            google_base_url: "http://127.0.0.1:1".into(),
            assistant: AssistantLimits::default(),
            broadcast_timeout: Duration::from_millis(100),
            port: 0,
            rust_log: "debug".into(),
        };
        AppState {
            db: PgPoolOptions::new()
                .connect_lazy(&config.database_url)
                .unwrap(),
            redis: redis::Client::open(config.redis_url.clone()).unwrap(),
            llm: LlmClient::from_config(&config).unwrap(),
            jwt: JwtVerifier::new(SECRET),
            attachments: Arc::new(RemoteAttachments::new(reqwest::Client::new(), None)),
            config,
        }
    }

    fn bearer() -> String {
        format!(
            "Bearer {}",
            sign(SECRET, &json!({"sub": "user-1", "role": "authenticated"}))
        )
    }

    fn post(uri: &str, auth: Option<String>, body: Value) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(auth) = auth {
            builder = builder.header(header::AUTHORIZATION, auth);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    async fn error_code(response: axum::response::Response) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        body["error"]["code"].as_str().unwrap_or_default().to_string()
    }

    #[tokio::test]
    async fn test_health_lists_configured_providers() {
        let response = build_router(test_state())
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["status"], json!("ok"));
        assert_eq!(body["providers"], json!([]));
    }

    #[tokio::test]
    async fn test_assistant_requires_bearer_token() {
        let response = build_router(test_state())
            .oneshot(post(
                "/api/v1/ai/assistant",
                None,
                json!({"message": "hi"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(error_code(response).await, "UNAUTHORIZED");
    }

    #[tokio::test]
    async fn test_assistant_validates_before_streaming() {
        let response = build_router(test_state())
            .oneshot(post(
                "/api/v1/ai/assistant",
                Some(bearer()),
                json!({"hr_specialist_id": Uuid::new_v4(), "message": "hi"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(error_code(response).await, "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn test_generate_rejects_unknown_operation() {
        let response = build_router(test_state())
            .oneshot(post(
                "/api/v1/ai/generate",
                Some(bearer()),
                json!({
                    "organization_id": Uuid::new_v4(),
                    "hr_specialist_id": Uuid::new_v4(),
                    "operation": "horoscope"
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    fn bearer_for_org(organization_id: Uuid) -> String {
        format!(
            "Bearer {}",
            sign(
                SECRET,
                &json!({
                    "sub": "user-1",
                    "role": "authenticated",
                    "organization_id": organization_id.to_string()
                }),
            )
        )
    }

    #[tokio::test]
    async fn test_assistant_rejects_other_organization() {
        let response = build_router(test_state())
            .oneshot(post(
                "/api/v1/ai/assistant",
                Some(bearer_for_org(Uuid::new_v4())),
                json!({
                    "organization_id": Uuid::new_v4(),
                    "hr_specialist_id": Uuid::new_v4(),
                    "message": "List active vacancies"
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(error_code(response).await, "FORBIDDEN");
    }

    #[tokio::test]
    async fn test_generate_rejects_other_organization() {
        let response = build_router(test_state())
            .oneshot(post(
                "/api/v1/ai/generate",
                Some(bearer_for_org(Uuid::new_v4())),
                json!({
                    "organization_id": Uuid::new_v4(),
                    "hr_specialist_id": Uuid::new_v4(),
                    "operation": "document_generation",
                    "candidate_id": Uuid::new_v4()
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(error_code(response).await, "FORBIDDEN");
    }

    #[tokio::test]
    async fn test_forged_token_is_rejected() {
        let forged = format!(
            "Bearer {}",
            sign("other-secret", &json!({"sub": "user-1"}))
        );
        let response = build_router(test_state())
            .oneshot(post("/api/v1/ai/generate", Some(forged), json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
