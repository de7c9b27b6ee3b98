//! HTTP API routes

mod devices;
mod monitor;
mod tuning;

use axum::{
    routing::{delete, get, post, put},
    Router,
};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Build the API router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/stats", get(monitor::stats))
        .route("/api/events", get(monitor::events))
        .route("/api/devices", post(devices::register))
        .route("/api/devices/:id", delete(devices::remove))
        .route(
            "/api/devices/:id/stream",
            post(devices::open_stream).delete(devices::close_stream),
        )
        .route("/api/devices/:id/chunks", post(devices::push_chunk))
        .route("/api/devices/:id/signals", post(devices::signal))
        .route("/api/devices/:id/volume", put(devices::set_volume))
        .route("/api/workers", put(tuning::set_workers))
        .route("/api/tuning/trigger", post(tuning::trigger))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::AddressBook;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use std::sync::Arc;
    use std::time::Duration;
    use streamtune_core::{
        Collaborators, DeviceController, DeviceId, Engine, EngineConfig, Result, StreamMetadata,
        StreamRelay, SystemMetrics, SystemSampler,
    };
    use tower::ServiceExt;

    struct NoopController;

    #[async_trait]
    impl DeviceController for NoopController {
        async fn probe(&self, _: &DeviceId, _: &str, _: u16) -> Result<Duration> {
            Ok(Duration::from_millis(5))
        }

        async fn set_volume(&self, _: &DeviceId, _: u8) -> Result<()> {
            Ok(())
        }

        async fn play(&self, _: &DeviceId, _: &str, _: &StreamMetadata) -> Result<()> {
            Ok(())
        }

        async fn stop(&self, _: &DeviceId) -> Result<()> {
            Ok(())
        }
    }

    struct NoRelay;

    impl StreamRelay for NoRelay {
        fn endpoint_url(&self, _: &DeviceId) -> Option<String> {
            None
        }
    }

    struct Quiet;

    impl SystemSampler for Quiet {
        fn sample(&self) -> SystemMetrics {
            SystemMetrics::default()
        }
    }

    fn app() -> (Router, Engine) {
        let collaborators = Collaborators::new(Arc::new(NoopController), Arc::new(NoRelay))
            .with_sampler(Arc::new(Quiet));
        let engine = Engine::start(EngineConfig::default(), collaborators).unwrap();
        let router = create_router(AppState::new(engine.clone(), AddressBook::default()));
        (router, engine)
    }

    fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_device_stream_and_chunk_flow() {
        let (app, engine) = app();

        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/api/devices",
                serde_json::json!({ "id": "kitchen", "host": "10.0.0.20", "port": 7000 }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/api/devices",
                serde_json::json!({ "id": "kitchen", "host": "10.0.0.20", "port": 7000 }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        // No stream yet: the chunk is dropped.
        let response = app
            .clone()
            .oneshot(
                Request::post("/api/devices/kitchen/chunks")
                    .body(Body::from(vec![1u8, 0]))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/api/devices/kitchen/stream",
                serde_json::json!({ "title": "Morning" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["bufferSize"], 250);

        let response = app
            .clone()
            .oneshot(
                Request::post("/api/devices/kitchen/chunks")
                    .body(Body::from(vec![1u8, 0, 2, 0]))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&bytes[..], &[1, 0, 2, 0]);

        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/api/devices/kitchen/signals",
                serde_json::json!({ "signal": "dropout" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["adjustment"]["to"], 350);

        let response = app
            .oneshot(Request::get("/api/stats").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let stats = body_json(response).await;
        assert_eq!(stats["bufferStates"]["kitchen"]["current_size"], 350);
        assert_eq!(stats["devices"][0]["id"], "kitchen");
        engine.shutdown();
    }

    #[tokio::test]
    async fn test_unknown_device_is_not_found() {
        let (app, engine) = app();
        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/api/devices/ghost/stream",
                serde_json::json!({}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(response).await["error"]["code"], 404);

        let response = app
            .oneshot(
                Request::delete("/api/devices/ghost")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        engine.shutdown();
    }

    #[tokio::test]
    async fn test_worker_override_and_bad_trigger() {
        let (app, engine) = app();
        let response = app
            .clone()
            .oneshot(json_request(
                "PUT",
                "/api/workers",
                serde_json::json!({ "count": 1 }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["workers"], 1);

        let response = app
            .oneshot(json_request(
                "POST",
                "/api/tuning/trigger",
                serde_json::json!({ "reason": "manual" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        engine.shutdown();
    }
}
