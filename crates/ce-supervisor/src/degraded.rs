// SPDX-License-Identifier: MIT OR Apache-2.0
//! Degraded endpoint served in place of the gateway when artifact
//! resolution fails.
//!
//! Deployment monitors need the exact diagnosis, so every route answers
//! 503 with the structured resolver payload rather than a confusing 404.

use axum::{
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use ce_resolver::ResolverFailure;
use serde_json::json;
use std::sync::Arc;

/// Build the degraded router around one resolver failure.
pub fn build_degraded_app(failure: Arc<ResolverFailure>) -> Router {
    let payload = serde_json::to_value(failure.as_ref()).unwrap_or_else(|_| {
        json!({"status": "artifact_resolver_failed", "stage": "unknown"})
    });

    let health_body = json!({"ok": false, "status": failure.status});
    let health = move || {
        let body = health_body.clone();
        async move { (StatusCode::SERVICE_UNAVAILABLE, Json(body)) }
    };

    let full = payload.clone();
    let serve_payload = move || {
        let body = full.clone();
        async move { (StatusCode::SERVICE_UNAVAILABLE, Json(body)) }
    };

    Router::new()
        .route("/healthz", get(health))
        .route("/run", post(serve_payload.clone()))
        .route("/artifact-resolver/error", get(serve_payload.clone()))
        .fallback(move || {
            let body = payload.clone();
            async move { (StatusCode::SERVICE_UNAVAILABLE, Json(body)).into_response() }
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use serde_json::Value;
    use tower::ServiceExt;

    fn failure() -> Arc<ResolverFailure> {
        Arc::new(ResolverFailure {
            status: "artifact_resolver_failed".into(),
            stage: "models".into(),
            message: "one or more required models could not be resolved".into(),
            details: json!({
                "unresolved_models": [{
                    "reason": "required_model_not_declared_in_app_artifacts",
                    "filename": "weights.safetensors",
                    "input_name": "unet_name",
                    "class_type": "UNETLoader",
                }]
            }),
        })
    }

    async fn fetch(app: Router, method: &str, uri: &str) -> (StatusCode, Value) {
        let resp = app
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn healthz_reports_not_ok() {
        let (status, body) = fetch(build_degraded_app(failure()), "GET", "/healthz").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["ok"], false);
        assert_eq!(body["status"], "artifact_resolver_failed");
    }

    #[tokio::test]
    async fn run_serves_the_failure_verbatim() {
        let (status, body) = fetch(build_degraded_app(failure()), "POST", "/run").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["stage"], "models");
        assert_eq!(
            body["details"]["unresolved_models"][0]["reason"],
            "required_model_not_declared_in_app_artifacts"
        );
    }

    #[tokio::test]
    async fn error_route_and_fallback_serve_the_payload() {
        let (status, body) =
            fetch(build_degraded_app(failure()), "GET", "/artifact-resolver/error").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["status"], "artifact_resolver_failed");

        let (status, body) = fetch(build_degraded_app(failure()), "GET", "/contract").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["stage"], "models");
    }
}
