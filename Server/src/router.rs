use std::path::Path;
use std::sync::Arc;

use axum::{http::Request, routing::get, Router};
use tower::ServiceBuilder;
use tower_http::{
    cors::CorsLayer,
    services::ServeDir,
    trace::{DefaultMakeSpan, TraceLayer},
};
use tracing::instrument;

use crate::handlers::sessions;
use crate::services::session_registry::SessionRegistry;
use crate::types::AppState;

/// HTTP side of the server: the session list and everything the transcoders write under
/// `media_base`.
#[instrument(skip_all)]
pub fn create_router(registry: Arc<SessionRegistry>, media_base: &Path) -> Router {
    let app_state = AppState { registry };

    Router::new()
        .route("/sessions", get(sessions::list_sessions))
        .route("/sessions/*id", get(sessions::get_session))
        // Manifests and segments produced by the transcoders
        .fallback_service(ServeDir::new(media_base))
        .layer(
            // We allow cross-origin requests from any origin
            CorsLayer::permissive(),
        )
        .layer(
            ServiceBuilder::new().layer(
                TraceLayer::new_for_http()
                    .make_span_with(DefaultMakeSpan::new().include_headers(true))
                    .on_request(|request: &Request<axum::body::Body>, _span: &tracing::Span| {
                        // Segment polling is far too chatty for info
                        if request.uri().path().ends_with(".m4s") {
                            return;
                        }
                        tracing::info!("Received request for endpoint: {}", request.uri().path());
                    }),
            ),
        )
        .with_state(app_state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::session_registry::StreamType;
    use axum::body::Body;
    use axum::http::StatusCode;
    use tower::ServiceExt;

    async fn get(router: Router, uri: &str) -> (StatusCode, Vec<u8>) {
        let response = router
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, body.to_vec())
    }

    #[tokio::test]
    async fn serves_media_files_and_sessions() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("stream1.mp4")).unwrap();
        std::fs::write(dir.path().join("stream1.mp4/stream1.mpd"), "<MPD/>").unwrap();

        let registry = Arc::new(SessionRegistry::new(4));
        registry.add_dash_unit(StreamType::Dynamic, "10.0.0.5:live/stream1", 0).unwrap();
        let router = create_router(registry, dir.path());

        let (status, body) = get(router.clone(), "/stream1.mp4/stream1.mpd").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"<MPD/>");

        let (status, _) = get(router.clone(), "/missing.mpd").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = get(router.clone(), "/sessions").await;
        assert_eq!(status, StatusCode::OK);
        let sessions: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(sessions[0]["id"], "10.0.0.5:live/stream1");
        assert_eq!(sessions[0]["stream_type"], "dynamic");

        let (status, _) = get(router.clone(), "/sessions/10.0.0.5:live/stream1").await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = get(router, "/sessions/nobody").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
