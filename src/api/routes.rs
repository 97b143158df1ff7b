//! API route definitions.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};

use super::state::AppState;
use super::ApiError;
use crate::detect::DetectError;
use crate::events::StreamKey;
use crate::pipeline::DetectionRequest;

const DEFAULT_EVENT_LIMIT: usize = 50;
const MAX_EVENT_LIMIT: usize = 1000;

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/methods", get(list_methods))
        .route("/detect", post(detect))
        .route("/events", get(list_events))
}

fn meta() -> Value {
    json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION")
    })
}

pub(super) async fn health(State(state): State<AppState>) -> Json<Value> {
    let store = state.pipeline.store().clone();
    let database = match tokio::task::spawn_blocking(move || store.ping()).await {
        Ok(Ok(())) => "ok",
        _ => "unavailable",
    };
    let available = state.pipeline.registry().list().iter().filter(|m| m.available).count();
    Json(json!({
        "data": {
            "status": if database == "ok" { "ok" } else { "degraded" },
            "version": env!("CARGO_PKG_VERSION"),
            "uptime_secs": state.started.elapsed().as_secs(),
            "database": database,
            "methods_available": available
        },
        "meta": meta()
    }))
}

async fn list_methods(State(state): State<AppState>) -> Json<Value> {
    let methods = state.pipeline.registry().list();
    Json(json!({
        "data": methods,
        "meta": { "total": methods.len() }
    }))
}

async fn detect(
    State(state): State<AppState>,
    body: Result<Json<DetectionRequest>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(request) = body.map_err(|e| DetectError::InvalidInput(e.body_text()))?;
    let response = state.pipeline.run(request).await?;
    Ok(Json(json!({ "data": response, "meta": meta() })))
}

#[derive(Debug, Deserialize)]
struct EventsQuery {
    resource_id: Option<String>,
    metric_name: Option<String>,
    limit: Option<usize>,
}

async fn list_events(
    State(state): State<AppState>,
    Query(q): Query<EventsQuery>,
) -> Result<Json<Value>, ApiError> {
    let key = match (q.resource_id, q.metric_name) {
        (Some(r), Some(m)) => Some(StreamKey::new(r, m)),
        (None, None) => None,
        _ => {
            return Err(DetectError::InvalidInput(
                "resource_id and metric_name must be given together".into(),
            )
            .into())
        }
    };
    let limit = q.limit.unwrap_or(DEFAULT_EVENT_LIMIT).min(MAX_EVENT_LIMIT);

    let store = state.pipeline.store().clone();
    let events = tokio::task::spawn_blocking(move || store.recent(key.as_ref(), limit))
        .await
        .map_err(|e| DetectError::Storage(e.to_string()))?
        .map_err(|e| DetectError::Storage(format!("{e:#}")))?;

    Ok(Json(json!({
        "data": events,
        "meta": { "total": events.len(), "limit": limit }
    })))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    use crate::api::router;
    use crate::api::state::AppState;
    use crate::config::{Config, DetectorsConfig};
    use crate::detect::DetectorRegistry;
    use crate::events::MemoryEventStore;
    use crate::pipeline::Pipeline;

    fn app() -> axum::Router {
        let config = Arc::new(Config::default());
        let registry = Arc::new(DetectorRegistry::from_config(&DetectorsConfig::default()));
        let pipeline = Pipeline::new(config, registry, Arc::new(MemoryEventStore::new())).unwrap();
        router(AppState::new(pipeline))
    }

    async fn send(req: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = app().oneshot(req).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    fn post(body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/api/v1/detect")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let (status, body) = send(Request::get("/health").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["status"], "ok");
        assert_eq!(body["data"]["database"], "ok");
    }

    #[tokio::test]
    async fn test_methods_listing() {
        let (status, body) = send(Request::get("/api/v1/methods").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        let ids: Vec<&str> = body["data"]
            .as_array()
            .unwrap()
            .iter()
            .map(|m| m["id"].as_str().unwrap())
            .collect();
        assert!(ids.contains(&"isolation-forest"));
        assert!(ids.contains(&"matrix-profile"));
    }

    #[tokio::test]
    async fn test_detect_unknown_method_is_422() {
        let (status, body) = send(post(
            r#"{"series":[{"resource_id":"a","metric_name":"cpu","data":[]}],"method":"arima"}"#,
        ))
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["error"]["kind"], "detector_unavailable");
    }

    #[tokio::test]
    async fn test_detect_empty_series_is_400() {
        let (status, body) = send(post(r#"{"series":[]}"#)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["kind"], "invalid_input");
    }

    #[tokio::test]
    async fn test_malformed_json_is_400() {
        let (status, body) = send(post("{not json")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["kind"], "invalid_input");
    }

    #[tokio::test]
    async fn test_detect_ok() {
        let data: Vec<String> = [10.1, 10.5, 10.8, 45.2, 11.2, 10.4, 10.9, 10.2, 11.0, 10.6]
            .iter()
            .enumerate()
            .map(|(i, v)| format!(r#"{{"timestamp":"2025-12-28T22:{i:02}:00Z","value":{v}}}"#))
            .collect();
        let body = format!(
            r#"{{"series":[{{"resource_id":"pod-web-001","metric_name":"cpu","data":[{}]}}]}}"#,
            data.join(",")
        );
        let (status, body) = send(post(&body)).await;
        assert_eq!(status, StatusCode::OK);
        let result = &body["data"]["results"][0];
        assert_eq!(result["status"], "ok");
        assert_eq!(result["method"], "isolation-forest");
        assert_eq!(result["anomaly_count"], 1);
        assert_eq!(result["events"][0]["peak_time"], "2025-12-28T22:03:00Z");
        assert!(result["points"][3]["reason"].is_string());
    }

    #[tokio::test]
    async fn test_events_requires_both_keys() {
        let (status, _) = send(
            Request::get("/api/v1/events?resource_id=a")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = send(Request::get("/api/v1/events").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["meta"]["total"], 0);
    }

    #[tokio::test]
    async fn test_unknown_route_is_404() {
        let (status, body) = send(Request::get("/nope").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["kind"], "not_found");
    }
}
