use axum::response::sse::{Event, KeepAlive};
use axum::{
    extract::State,
    middleware,
    response::{IntoResponse, Response, Sse},
    routing::{get, post},
    Json, Router,
};
use futures_util::StreamExt;
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::cors::CorsLayer;
use tracing::Instrument;

use crate::health;
use crate::logging::session_id_middleware;
use crate::specs::openai::OpenAiMessage;
use crate::types::RelayEvent;
use crate::AppState;

const EVENT_CHANNEL_CAPACITY: usize = 100;
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub messages: Vec<OpenAiMessage>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/chat", post(chat_handler))
        .route("/health", get(health::liveness))
        .route("/readyz", get(health::readiness))
        .layer(axum::extract::DefaultBodyLimit::max(state.args.max_body_size))
        .layer(middleware::from_fn(session_id_middleware))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// `data:` payload for one relay event. A serialization failure is reported
/// in the same `{"error"}` shape as any other relay error.
fn event_data(event: &RelayEvent) -> String {
    match event.to_data() {
        Ok(data) => data,
        Err(e) => {
            tracing::error!("[⚙️  -> 🌐] Failed to serialize relay event: {}", e);
            error_data(&e.to_string())
        }
    }
}

fn error_data(message: &str) -> String {
    serde_json::json!({ "error": message }).to_string()
}

pub async fn chat_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ChatRequest>,
) -> Response {
    if let Err(e) = state.config.api_key() {
        tracing::error!("[🌐 <- ⚙️ ] Rejecting chat request: {}", e.inner);
        return e.into_response();
    }
    if body.messages.is_empty() {
        tracing::warn!("[🌐 -> ⚙️ ] Chat request with empty history");
    }

    let (tx, rx) = mpsc::channel::<RelayEvent>(EVENT_CHANNEL_CAPACITY);
    let relay = state.relay.clone();
    let history = body.messages;

    let stream_span = tracing::info_span!(
        "relay",
        stream_id = %uuid::Uuid::new_v4(),
        model = %state.config.model
    );
    tokio::spawn(
        async move {
            let end_state = relay.run(history, tx).await;
            tracing::debug!("[⚙️ ] Relay finished in {:?}", end_state);
        }
        .instrument(stream_span),
    );

    let events = ReceiverStream::new(rx).map(|event| Ok::<_, Infallible>(Event::default().data(event_data(&event))));

    Sse::new(events)
        .keep_alive(
            KeepAlive::new()
                .interval(KEEPALIVE_INTERVAL)
                .text("keepalive"),
        )
        .into_response()
}
