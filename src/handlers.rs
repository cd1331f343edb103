use crate::app::AppState;
use crate::assemble::assemble_response;
use crate::cache;
use crate::dispatch;
use crate::error::{AppError, AppResult};
use crate::openai::{self, ChatRequest, build_chunk, completion_id, now_ts};
use crate::stream::StreamSession;
use crate::tokens::{TokenCounter, Usage};
use crate::upstream::UpstreamCallError;
use axum::Json;
use axum::body::Body;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures_util::StreamExt;
use metrics::counter;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

pub async fn create_chat_completions(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> AppResult<Response> {
    let request = openai::parse_chat_request(&body)?;

    if state.limiter.wait().await.is_err() {
        counter!("linegate_rate_limited_total").increment(1);
        return Err(AppError::rate_limited("request rate limit exceeded"));
    }

    let fingerprint = cache::fingerprint(&request.model, &request.messages);
    if !request.stream {
        if let Some(cached) = state.cache.get(&fingerprint) {
            counter!("linegate_cache_hits_total").increment(1);
            counter!("linegate_requests_total", "mode" => "sync", "outcome" => "cache_hit")
                .increment(1);
            return Ok(Json(cached).into_response());
        }
        counter!("linegate_cache_misses_total").increment(1);
    }

    let mut token_counter = TokenCounter::new(state.config.estimator);
    token_counter.record_prompt(&request.messages);

    let cancel = CancellationToken::new();
    let outcome = dispatch::dispatch(
        &state.http,
        &state.proxies,
        &state.rotator,
        &state.mapper,
        &state.config,
        &request,
        &cancel,
    )
    .await;

    if request.stream {
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(err) => {
                counter!("linegate_requests_total", "mode" => "stream", "outcome" => "upstream_error")
                    .increment(1);
                return Ok(error_sse_response(
                    &upstream_error_to_app(err),
                    &request.model,
                ));
            }
        };
        counter!("linegate_requests_total", "mode" => "stream", "outcome" => "ok").increment(1);
        tracing::debug!(
            caller_id = %outcome.identity.caller_id,
            attempt = outcome.attempt,
            model = %request.model,
            "streaming session starting"
        );
        return Ok(stream_response(&state, request, token_counter, outcome));
    }

    let outcome = match outcome {
        Ok(outcome) => outcome,
        Err(err) => {
            counter!("linegate_requests_total", "mode" => "sync", "outcome" => "upstream_error")
                .increment(1);
            return Err(upstream_error_to_app(err));
        }
    };
    let value = assemble_response(
        outcome.response,
        token_counter,
        &request.model,
        state.cache.as_ref(),
        &fingerprint,
    )
    .await?;
    counter!("linegate_requests_total", "mode" => "sync", "outcome" => "ok").increment(1);
    Ok(Json(value).into_response())
}

pub async fn list_models(State(state): State<AppState>) -> Json<Value> {
    let created = now_ts();
    let data: Vec<Value> = state
        .mapper
        .external_models()
        .into_iter()
        .map(|id| {
            json!({
                "id": id,
                "object": "model",
                "created": created,
                "owned_by": "linegate",
            })
        })
        .collect();
    Json(json!({"object": "list", "data": data}))
}

pub async fn metrics(State(state): State<AppState>) -> String {
    state.metrics.render()
}

fn stream_response(
    state: &AppState,
    request: ChatRequest,
    token_counter: TokenCounter,
    outcome: dispatch::RetryOutcome,
) -> Response {
    let (tx, rx) = mpsc::channel::<Bytes>(64);
    let session = StreamSession::new(tx, token_counter, request.model, &state.config);
    tokio::spawn(session.run(outcome.response));
    let body = Body::from_stream(ReceiverStream::new(rx).map(Ok::<_, std::convert::Infallible>));
    sse_response(body)
}

/// Dispatch failed before the session started: the client still gets a
/// well-formed one-shot SSE stream, one error frame then `[DONE]`.
fn error_sse_response(err: &AppError, model: &str) -> Response {
    let usage = Usage::new(0, 0);
    let frame = build_chunk(
        &completion_id(),
        now_ts(),
        model,
        json!({"content": err.message}),
        Some("error"),
        &usage,
    );
    let payload = format!("data: {frame}\n\ndata: [DONE]\n\n");
    sse_response(Body::from(payload))
}

fn sse_response(body: Body) -> Response {
    Response::builder()
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .body(body)
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn upstream_error_to_app(err: UpstreamCallError) -> AppError {
    let status = err.status.unwrap_or(StatusCode::BAD_GATEWAY);
    AppError::new(status, "upstream_error", err.message).with_type("api_error")
}
