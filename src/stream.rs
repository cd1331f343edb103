use crate::config::GatewayConfig;
use crate::openai::{build_chunk, completion_id, now_ts};
use crate::protocol::{ParsedLine, translate_line};
use crate::tokens::TokenCounter;
use bytes::Bytes;
use futures_util::{FutureExt, StreamExt, TryStreamExt};
use metrics::counter;
use serde_json::{Value, json};
use std::panic::AssertUnwindSafe;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;

const MAX_CONSECUTIVE_SERIALIZE_FAILURES: u32 = 5;

#[derive(Debug, thiserror::Error)]
pub enum StreamAbort {
    #[error("upstream line exceeded {0} bytes")]
    LineTooLong(usize),
    #[error("upstream read failed: {0}")]
    Upstream(String),
    #[error("dropped {0} consecutive frames: {1}")]
    Serialize(u32, String),
}

impl StreamAbort {
    fn cause(&self) -> &'static str {
        match self {
            StreamAbort::LineTooLong(_) => "line_too_long",
            StreamAbort::Upstream(_) => "upstream_read",
            StreamAbort::Serialize(..) => "serialize",
        }
    }
}

enum SessionStop {
    ClientGone,
    Abort(StreamAbort),
}

/// One live SSE session. Owns the request's token counter and the sending
/// half of the response body channel; everything here is request-scoped.
pub struct StreamSession {
    tx: mpsc::Sender<Bytes>,
    counter: TokenCounter,
    id: String,
    created: i64,
    model: String,
    heartbeat_interval: Duration,
    flush_interval: Duration,
    read_buffer_bytes: usize,
    max_line_bytes: usize,
    pending: String,
    last_flush: Option<Instant>,
    serialize_failures: u32,
    finish_reason: Option<String>,
}

impl StreamSession {
    pub fn new(
        tx: mpsc::Sender<Bytes>,
        counter: TokenCounter,
        model: String,
        config: &GatewayConfig,
    ) -> Self {
        Self {
            tx,
            counter,
            id: completion_id(),
            created: now_ts(),
            model,
            heartbeat_interval: Duration::from_millis(config.heartbeat_interval_ms),
            flush_interval: Duration::from_millis(config.flush_interval_ms),
            read_buffer_bytes: config.read_buffer_bytes,
            max_line_bytes: config.max_line_bytes,
            pending: String::new(),
            last_flush: None,
            serialize_failures: 0,
            finish_reason: None,
        }
    }

    /// Drives the session to completion. Panics in the body are contained
    /// here and become a terminal error frame; the heartbeat task is always
    /// stopped and joined before any terminal write, so no comment can land
    /// after the final frame or `[DONE]`.
    pub async fn run(mut self, upstream: reqwest::Response) {
        let heartbeat_token = CancellationToken::new();
        let heartbeat = spawn_heartbeat(
            self.tx.clone(),
            self.heartbeat_interval,
            heartbeat_token.clone(),
        );

        let outcome = AssertUnwindSafe(self.drive(upstream)).catch_unwind().await;

        heartbeat_token.cancel();
        let _ = heartbeat.await;

        match outcome {
            Ok(Ok(())) => self.finish().await,
            Ok(Err(SessionStop::ClientGone)) => {
                counter!("linegate_stream_aborts_total", "cause" => "client_gone").increment(1);
            }
            Ok(Err(SessionStop::Abort(abort))) => {
                counter!("linegate_stream_aborts_total", "cause" => abort.cause()).increment(1);
                tracing::warn!(error = %abort, "stream session aborted");
                self.finish_with_error(&abort.to_string()).await;
            }
            Err(panic) => {
                let detail = panic_message(panic);
                counter!("linegate_stream_aborts_total", "cause" => "panic").increment(1);
                tracing::error!(detail = %detail, "stream session panicked");
                self.finish_with_error(&detail).await;
            }
        }
    }

    async fn drive(&mut self, upstream: reqwest::Response) -> Result<(), SessionStop> {
        self.emit_delta(json!({"role": "assistant", "content": ""}), true)
            .await?;

        let byte_stream = upstream.bytes_stream().map_err(std::io::Error::other);
        let reader = StreamReader::new(Box::pin(byte_stream));
        let codec = LinesCodec::new_with_max_length(self.max_line_bytes);
        let mut lines = FramedRead::with_capacity(reader, codec, self.read_buffer_bytes);
        let gone = self.tx.clone();

        loop {
            tokio::select! {
                biased;
                _ = gone.closed() => return Err(SessionStop::ClientGone),
                item = lines.next() => match item {
                    None => break,
                    Some(Ok(line)) => self.handle_line(&line).await?,
                    Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                        return Err(SessionStop::Abort(StreamAbort::LineTooLong(
                            self.max_line_bytes,
                        )));
                    }
                    Some(Err(LinesCodecError::Io(err))) => {
                        return Err(SessionStop::Abort(StreamAbort::Upstream(err.to_string())));
                    }
                },
            }
        }

        self.flush_now().await
    }

    async fn handle_line(&mut self, line: &str) -> Result<(), SessionStop> {
        match translate_line(line) {
            ParsedLine::Content(text) => {
                if text.is_empty() {
                    return Ok(());
                }
                self.counter.record_output(&text);
                self.emit_delta(json!({"content": text}), false).await
            }
            ParsedLine::Reasoning(text) => {
                if text.is_empty() {
                    return Ok(());
                }
                self.counter.record_output(&text);
                self.emit_delta(json!({"reasoning_content": text}), false)
                    .await
            }
            ParsedLine::Finish(reason) => {
                if let Some(reason) = reason {
                    self.finish_reason = Some(reason);
                }
                Ok(())
            }
            ParsedLine::Usage(usage) => {
                tracing::debug!(
                    prompt = usage.prompt_tokens,
                    completion = usage.completion_tokens,
                    total = usage.total(),
                    "backend reported usage"
                );
                self.counter.record_server_usage(usage);
                Ok(())
            }
            ParsedLine::Ignored => Ok(()),
        }
    }

    async fn emit_delta(&mut self, delta: Value, force: bool) -> Result<(), SessionStop> {
        let frame = build_chunk(
            &self.id,
            self.created,
            &self.model,
            delta,
            None,
            &self.counter.snapshot(),
        );
        self.send_frame(&frame, force).await
    }

    async fn finish(&mut self) {
        let usage = self.counter.finalize();
        let reason = self
            .finish_reason
            .clone()
            .unwrap_or_else(|| "stop".to_string());
        let frame = build_chunk(
            &self.id,
            self.created,
            &self.model,
            json!({}),
            Some(&reason),
            &usage,
        );
        let _ = self.send_frame(&frame, true).await;
        let _ = self.write_done().await;
    }

    async fn finish_with_error(&mut self, detail: &str) {
        let frame = build_chunk(
            &self.id,
            self.created,
            &self.model,
            json!({"content": detail}),
            Some("error"),
            &self.counter.snapshot(),
        );
        let _ = self.send_frame(&frame, true).await;
        let _ = self.write_done().await;
    }

    async fn send_frame(&mut self, frame: &Value, force: bool) -> Result<(), SessionStop> {
        match serde_json::to_string(frame) {
            Ok(payload) => {
                self.serialize_failures = 0;
                self.write_frame(&payload, force).await
            }
            Err(err) => {
                self.serialize_failures += 1;
                tracing::warn!(
                    consecutive = self.serialize_failures,
                    error = %err,
                    "failed to serialize stream frame"
                );
                if self.serialize_failures >= MAX_CONSECUTIVE_SERIALIZE_FAILURES {
                    Err(SessionStop::Abort(StreamAbort::Serialize(
                        self.serialize_failures,
                        err.to_string(),
                    )))
                } else {
                    Ok(())
                }
            }
        }
    }

    async fn write_frame(&mut self, payload: &str, force: bool) -> Result<(), SessionStop> {
        self.pending.push_str("data: ");
        self.pending.push_str(payload);
        self.pending.push_str("\n\n");
        let due = match self.last_flush {
            None => true,
            Some(at) => at.elapsed() >= self.flush_interval,
        };
        if force || due {
            self.flush_now().await
        } else {
            Ok(())
        }
    }

    async fn write_done(&mut self) -> Result<(), SessionStop> {
        self.pending.push_str("data: [DONE]\n\n");
        self.flush_now().await
    }

    async fn flush_now(&mut self) -> Result<(), SessionStop> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let bytes = Bytes::from(std::mem::take(&mut self.pending));
        self.tx
            .send(bytes)
            .await
            .map_err(|_| SessionStop::ClientGone)?;
        self.last_flush = Some(Instant::now());
        Ok(())
    }
}

fn spawn_heartbeat(
    tx: mpsc::Sender<Bytes>,
    period: Duration,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick completes immediately; skip it so the initial
        // frame leads the stream.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = ticker.tick() => {
                    if tx
                        .send(Bytes::from_static(b": heartbeat\n\n"))
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
            }
        }
    })
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "stream task panicked".to_string()
    }
}
