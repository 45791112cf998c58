use crate::app::AppState;
use crate::error::{AppError, AppResult, STREAM_INTERRUPTED};
use crate::models::{
    CompletionRequest, CompletionResult, HealthStatus, ReasonResult, StreamEvent, ValidJson,
};
use crate::translate::{self, StreamTranslator};
use crate::upstream::{ChunkStream, UpstreamError};
use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive};
use axum::response::{IntoResponse, Response, Sse};
use futures_util::StreamExt;
use std::convert::Infallible;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

const STREAM_CHANNEL_CAPACITY: usize = 64;
const DONE_SENTINEL: &str = "[DONE]";

pub async fn health() -> Json<HealthStatus> {
    Json(HealthStatus::ok())
}

pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    state.metrics.render()
}

pub async fn create_chat_completions(
    State(state): State<AppState>,
    payload: Result<ValidJson<CompletionRequest>, AppError>,
) -> AppResult<Response> {
    let req = accept("chat_completions", payload)?;
    if req.stream {
        let outcome = open_stream(&state, &req).await;
        record_request("chat_completions_stream", status_of(&outcome));
        return outcome;
    }
    let outcome = complete(&state, &req).await;
    record_request("chat_completions", status_of(&outcome));
    Ok(Json(outcome?).into_response())
}

pub async fn create_reason(
    State(state): State<AppState>,
    payload: Result<ValidJson<CompletionRequest>, AppError>,
) -> AppResult<Json<ReasonResult>> {
    let mut req = accept("reason", payload)?;
    req.stream = false;
    let outcome = complete(&state, &req).await;
    record_request("reason", status_of(&outcome));
    Ok(Json(ReasonResult::from(outcome?)))
}

/// Unwraps an extracted body, counting rejected requests before they are answered.
fn accept<T>(endpoint: &'static str, payload: Result<ValidJson<T>, AppError>) -> AppResult<T> {
    match payload {
        Ok(ValidJson(value)) => Ok(value),
        Err(err) => {
            tracing::debug!(endpoint, error = %err, "request rejected");
            record_request(endpoint, err.status);
            Err(err)
        }
    }
}

async fn complete(state: &AppState, req: &CompletionRequest) -> AppResult<CompletionResult> {
    let started_at = Instant::now();
    let resp = state
        .upstream
        .complete(req)
        .await
        .map_err(upstream_error_to_app)?;
    metrics::histogram!("reason_relay_upstream_latency_seconds", "mode" => "complete")
        .record(started_at.elapsed().as_secs_f64());
    let result = translate::completion_result(resp).map_err(upstream_error_to_app)?;
    tracing::debug!(
        id = %result.id,
        model = %result.model,
        messages = req.messages.len(),
        has_reasoning = result.reasoning_content.is_some(),
        prompt_tokens = result.usage.prompt_tokens,
        completion_tokens = result.usage.completion_tokens,
        reasoning_tokens = result.usage.reasoning_tokens,
        duration_ms = started_at.elapsed().as_millis() as u64,
        "completion relayed"
    );
    Ok(result)
}

async fn open_stream(state: &AppState, req: &CompletionRequest) -> AppResult<Response> {
    let started_at = Instant::now();
    let chunks = state
        .upstream
        .stream(req)
        .await
        .map_err(upstream_error_to_app)?;
    metrics::histogram!("reason_relay_upstream_latency_seconds", "mode" => "stream_open")
        .record(started_at.elapsed().as_secs_f64());

    let (tx, rx) = mpsc::channel::<Event>(STREAM_CHANNEL_CAPACITY);
    tokio::spawn(relay_chunks(chunks, tx, started_at));
    let body = ReceiverStream::new(rx).map(Ok::<_, Infallible>);
    Ok(Sse::new(body)
        .keep_alive(KeepAlive::default())
        .into_response())
}

/// Forwards provider chunks to the client until either side ends.
async fn relay_chunks(mut chunks: ChunkStream, tx: mpsc::Sender<Event>, started_at: Instant) {
    let mut translator = StreamTranslator::new();
    loop {
        let next = tokio::select! {
            _ = tx.closed() => {
                tracing::debug!(
                    chunks = translator.chunks(),
                    "client disconnected, closing upstream stream"
                );
                return;
            }
            next = chunks.next() => next,
        };
        match next {
            Some(Ok(chunk)) => {
                for event in translator.push(&chunk) {
                    if send_event(&tx, &event).await.is_err() {
                        return;
                    }
                }
            }
            Some(Err(err)) => {
                metrics::counter!("reason_relay_upstream_errors_total", "kind" => err.kind())
                    .increment(1);
                tracing::warn!(
                    error = %err,
                    chunks = translator.chunks(),
                    "upstream stream interrupted"
                );
                let event = StreamEvent::Error {
                    error: STREAM_INTERRUPTED.to_string(),
                    detail: err.to_string(),
                };
                if send_event(&tx, &event).await.is_ok() {
                    let _ = tx.send(Event::default().data(DONE_SENTINEL)).await;
                }
                return;
            }
            None => break,
        }
    }

    tracing::debug!(
        id = translator.id().unwrap_or(""),
        model = translator.model().unwrap_or(""),
        chunks = translator.chunks(),
        reasoning_chars = translator.reasoning_chars(),
        content_chars = translator.content_chars(),
        duration_ms = started_at.elapsed().as_millis() as u64,
        "stream relayed"
    );
    let done = translator.finish();
    if send_event(&tx, &done).await.is_ok() {
        let _ = tx.send(Event::default().data(DONE_SENTINEL)).await;
    }
}

async fn send_event(
    tx: &mpsc::Sender<Event>,
    event: &StreamEvent,
) -> Result<(), mpsc::error::SendError<Event>> {
    metrics::counter!("reason_relay_stream_events_total", "type" => event.kind()).increment(1);
    let sse = match Event::default().json_data(event) {
        Ok(sse) => sse,
        Err(err) => {
            tracing::error!("failed to encode stream event: {err}");
            return Ok(());
        }
    };
    tx.send(sse).await
}

fn status_of<T>(outcome: &AppResult<T>) -> StatusCode {
    match outcome {
        Ok(_) => StatusCode::OK,
        Err(err) => err.status,
    }
}

fn record_request(endpoint: &'static str, status: StatusCode) {
    let outcome = if status.is_success() { "success" } else { "error" };
    metrics::counter!(
        "reason_relay_requests_total",
        "endpoint" => endpoint,
        "outcome" => outcome,
        "status" => status.as_u16().to_string()
    )
    .increment(1);
}

fn upstream_error_to_app(err: UpstreamError) -> AppError {
    metrics::counter!("reason_relay_upstream_errors_total", "kind" => err.kind()).increment(1);
    if let UpstreamError::Status { status, code, .. } = &err {
        tracing::warn!(
            upstream_status = status.as_u16(),
            upstream_code = code.as_deref().unwrap_or(""),
            "upstream rejected request"
        );
    } else {
        tracing::warn!(error = %err, "upstream call failed");
    }
    AppError::from(err)
}
