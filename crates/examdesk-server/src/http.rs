use std::net::SocketAddr;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use examdesk_core::ChatError;

use crate::AppState;

pub const CORRELATION_HEADER: &str = "x-examdesk-correlation-id";

#[derive(Debug, Deserialize)]
struct ChatInput {
    #[serde(default)]
    prompt: Option<String>,
}

#[derive(Debug, Serialize)]
struct ChatReply {
    response: String,
}

#[derive(Debug, Serialize)]
struct ErrorEnvelope {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<String>,
}

enum ApiError {
    InvalidPrompt,
    Chat {
        correlation_id: String,
        source: ChatError,
    },
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::InvalidPrompt => (
                StatusCode::BAD_REQUEST,
                Json(ErrorEnvelope {
                    error: "prompt is required".to_string(),
                    code: Some("INVALID_PROMPT".to_string()),
                }),
            )
                .into_response(),
            ApiError::Chat {
                correlation_id,
                source,
            } => {
                tracing::error!(
                    correlation_id = %correlation_id,
                    code = source.code(),
                    "chat request failed: {source}"
                );
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(ErrorEnvelope {
                        error: "Internal server error".to_string(),
                        code: None,
                    }),
                )
                    .into_response()
            }
        }
    }
}

pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let app = app_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "examdesk listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_err() {
                std::future::pending::<()>().await;
            }
        })
        .await?;
    Ok(())
}

pub fn app_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/global/health", get(global_health))
        .route("/chat", post(chat))
        .route("/api/chat", post(chat))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn global_health() -> impl IntoResponse {
    Json(json!({
        "healthy": true,
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn chat(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(input): Json<ChatInput>,
) -> Result<Json<ChatReply>, ApiError> {
    let prompt = input
        .prompt
        .filter(|p| !p.trim().is_empty())
        .ok_or(ApiError::InvalidPrompt)?;
    let correlation_id = correlation_id(&headers);

    match state.chat.respond(&prompt, &correlation_id).await {
        Ok(response) => Ok(Json(ChatReply { response })),
        Err(source) => Err(ApiError::Chat {
            correlation_id,
            source,
        }),
    }
}

fn correlation_id(headers: &HeaderMap) -> String {
    headers
        .get(CORRELATION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}
