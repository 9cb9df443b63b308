//! Callcoach server library logic.

pub mod api_ws;
pub mod config;
pub mod prompt;

use axum::{routing::get, Extension, Json, Router};
use callcoach_media::{MediaWorkerPool, RouterRegistry};
use callcoach_pipeline::{AgentPipeline, ChatModel, SttConnector};
use callcoach_rooms::{RoomRegistry, UserRegistry};
use config::Config;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tower_http::cors::{Any, CorsLayer};

/// Application state shared across all connections.
///
/// Every manager is constructed once at process start and injected; there
/// is no hidden global instance, so tests build isolated states per test.
#[derive(Clone)]
pub struct AppState {
    /// Loaded configuration.
    pub config: Arc<Config>,
    /// Fixed pool of media routing workers.
    pub pool: Arc<MediaWorkerPool>,
    /// Per-room routing contexts.
    pub routers: RouterRegistry,
    /// Room lifecycle.
    pub rooms: RoomRegistry,
    /// Connected identities and their media resources.
    pub users: UserRegistry,
    /// Live WebSocket bindings.
    pub connections: api_ws::ConnectionRegistry,
    /// Active agent pipelines, one per room.
    pub agents: Arc<RwLock<HashMap<String, Arc<AgentPipeline>>>>,
    /// Streaming transcription backend.
    pub stt_connector: Arc<dyn SttConnector>,
    /// Coaching model backend.
    pub chat_model: Arc<dyn ChatModel>,
}

impl AppState {
    /// Builds the full resource graph from a configuration and the two
    /// vendor backends.
    pub fn new(
        config: Config,
        stt_connector: Arc<dyn SttConnector>,
        chat_model: Arc<dyn ChatModel>,
    ) -> Self {
        let pool = Arc::new(match config.media.num_workers {
            Some(size) => MediaWorkerPool::new(size),
            None => MediaWorkerPool::with_default_size(),
        });
        let routers = RouterRegistry::new();
        let users = UserRegistry::new();
        let rooms = RoomRegistry::new(
            pool.clone(),
            routers.clone(),
            users.clone(),
            Arc::new(config.media.clone()),
            prompt::DEFAULT_CALL_TOPIC,
        );

        Self {
            config: Arc::new(config),
            pool,
            routers,
            rooms,
            users,
            connections: api_ws::ConnectionRegistry::default(),
            agents: Arc::new(RwLock::new(HashMap::new())),
            stt_connector,
            chat_model,
        }
    }

    /// Closes and forgets the agent pipeline for a room, if any.
    pub async fn close_agent(&self, room_id: &str) {
        if let Some(pipeline) = self.agents.write().await.remove(room_id) {
            pipeline.close();
        }
    }
}

/// Health check handler.
///
/// Returns `200 OK` with server status and version. Used by load
/// balancers, monitoring, and CI to verify the server is running.
async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Builds the application router with all routes.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws", get(api_ws::ws_handler))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(Extension(Arc::new(state)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    struct NoStt;

    #[async_trait::async_trait]
    impl SttConnector for NoStt {
        async fn connect(
            &self,
            _options: &callcoach_pipeline::SttOptions,
        ) -> Result<Box<dyn callcoach_pipeline::SttSession>, callcoach_pipeline::PipelineError>
        {
            Err(callcoach_pipeline::PipelineError::Stt(
                "no stt in this test".to_string(),
            ))
        }
    }

    struct NoLlm;

    #[async_trait::async_trait]
    impl ChatModel for NoLlm {
        async fn stream_chat(
            &self,
            _messages: Vec<callcoach_pipeline::ChatMessage>,
        ) -> Result<
            tokio::sync::mpsc::Receiver<Result<String, callcoach_pipeline::PipelineError>>,
            callcoach_pipeline::PipelineError,
        > {
            Err(callcoach_pipeline::PipelineError::Llm(
                "no llm in this test".to_string(),
            ))
        }
    }

    fn test_state() -> AppState {
        let mut config = Config::default();
        config.media.num_workers = Some(1);
        AppState::new(config, Arc::new(NoStt), Arc::new(NoLlm))
    }

    #[tokio::test]
    async fn health_check_returns_ok() {
        let app = app(test_state());

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "ok");
    }

    #[tokio::test]
    async fn ws_without_token_is_unauthorized() {
        let app = app(test_state());

        // A well-formed upgrade request, but no identity token.
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/ws")
                    .header("host", "localhost")
                    .header("connection", "upgrade")
                    .header("upgrade", "websocket")
                    .header("sec-websocket-version", "13")
                    .header("sec-websocket-key", "dGhlIHNhbXBsZSBub25jZQ==")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
