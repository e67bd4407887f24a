use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::State,
    http::HeaderMap,
    response::sse::{Event, Sse},
    routing::post,
    Json, Router,
};
use futures_util::stream::{self, Stream};
use serde_json::json;

use fleet_common::ChatCompletionRequest;

use super::ApiError;
use crate::gateway::InferenceStream;
use crate::AppState;

const USER_ID_HEADER: &str = "x-user-id";
const ANONYMOUS_USER: &str = "anonymous";

enum Phase {
    Streaming(InferenceStream),
    /// An error event was sent; `[DONE]` follows.
    Closing,
    Done,
}

/// POST /v1/chat/completions - stream a completion from a selected node.
async fn chat_completions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<ChatCompletionRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let model = request
        .model
        .clone()
        .filter(|m| !m.is_empty())
        .ok_or_else(|| ApiError::InvalidRequest("model is required".to_string()))?;
    let user_id = headers
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .unwrap_or(ANONYMOUS_USER)
        .to_string();

    let node = state
        .selector
        .select(&model)
        .await
        .ok_or_else(|| ApiError::NoCapacity(model.clone()))?;

    let inference = state
        .correlator
        .start(&node.node_id, &user_id, &model, request)
        .await?;

    tracing::info!(
        node_id = %inference.node_id(),
        request_id = %inference.request_id(),
        user_id = %user_id,
        model = %model,
        "Request dispatched"
    );

    Ok(Sse::new(sse_events(inference)))
}

/// One `data:` event per chunk, then `[DONE]`. Dropping the SSE stream drops
/// the inference stream with it.
fn sse_events(inference: InferenceStream) -> impl Stream<Item = Result<Event, Infallible>> {
    stream::unfold(Phase::Streaming(inference), |phase| async move {
        let mut inference = match phase {
            Phase::Streaming(inference) => inference,
            Phase::Closing => return Some((Ok(done_event()), Phase::Done)),
            Phase::Done => return None,
        };
        match inference.next().await {
            Some(Ok(chunk)) => match Event::default().json_data(&chunk) {
                Ok(event) => Some((Ok(event), Phase::Streaming(inference))),
                Err(e) => {
                    tracing::error!(
                        request_id = %inference.request_id(),
                        "Failed to encode chunk: {}",
                        e
                    );
                    Some((Ok(done_event()), Phase::Done))
                }
            },
            Some(Err(e)) => {
                tracing::warn!(
                    node_id = %inference.node_id(),
                    request_id = %inference.request_id(),
                    "Inference failed: {}",
                    e
                );
                let body = json!({
                    "error": {
                        "type": "inference_failed",
                        "message": e.to_string()
                    }
                });
                Some((Ok(Event::default().data(body.to_string())), Phase::Closing))
            }
            None => Some((Ok(done_event()), Phase::Done)),
        }
    })
}

fn done_event() -> Event {
    Event::default().data("[DONE]")
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .with_state(state)
}
