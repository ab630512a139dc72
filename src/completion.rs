//! Streaming chat completions with retrying stream setup.
//!
//! Each call goes through `Pending -> Sent -> {Streaming -> Completed} | Failed`.
//! Only stream *establishment* is retried:
//!
//! | Response | Action |
//! |----------|--------|
//! | 401 / 403 | fail immediately as `unauthorized` |
//! | 429 | retry; `rate_limited` once retries run out |
//! | other 4xx | fail immediately as `upstream_failure` |
//! | 5xx, network error | retry; `upstream_failure` once retries run out |
//!
//! Backoff is `retry_base_delay_ms * 2^(attempt - 1)`.
//!
//! Once tokens flow, a relay task forwards them through a small bounded
//! channel. A read error or an idle stream ends delivery with
//! [`STREAM_FAILURE_NOTICE`] as the last chunk; nothing is replayed. Dropping
//! the [`TokenStream`] stops the relay at its next await point.

use futures::{Stream, StreamExt};
use serde::Serialize;
use std::fmt::Display;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::{read_secret, CompletionConfig};
use crate::error::{Result, VaultError};
use crate::models::ChatTurn;

/// Appended when a stream breaks after tokens were delivered.
pub const STREAM_FAILURE_NOTICE: &str =
    "\n\n[The response was interrupted before it finished. Please try again.]";

const CHANNEL_CAPACITY: usize = 16;

#[derive(Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatTurn],
    max_tokens: u32,
    temperature: f32,
    stream: bool,
}

pub struct CompletionStreamer {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    config: CompletionConfig,
}

impl CompletionStreamer {
    /// Reads the credential from `config.api_key_env`.
    ///
    /// # Errors
    ///
    /// [`VaultError::ConfigurationMissing`] when the variable is unset or empty.
    pub fn new(config: &CompletionConfig) -> Result<Self> {
        let api_key = read_secret(&config.api_key_env).ok_or_else(|| {
            VaultError::ConfigurationMissing(format!("{} is not set", config.api_key_env))
        })?;
        Self::with_api_key(config, api_key)
    }

    pub fn with_api_key(config: &CompletionConfig, api_key: impl Into<String>) -> Result<Self> {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(VaultError::ConfigurationMissing(
                "completion API key is empty".to_string(),
            ));
        }
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| VaultError::Unknown(format!("http client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
            api_key,
            config: config.clone(),
        })
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    /// Open a token stream for `messages`, retrying setup per the table above.
    pub async fn stream(&self, messages: &[ChatTurn]) -> Result<CompletionStream> {
        let body = CompletionRequest {
            model: &self.config.model,
            messages,
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
            stream: true,
        };
        let base = Duration::from_millis(self.config.retry_base_delay_ms);
        let idle = Duration::from_secs(self.config.stream_idle_timeout_secs);

        let mut retry_delays = Vec::new();
        let mut last_err = None;

        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                let delay = backoff_delay(base, attempt);
                warn!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "retrying completion request"
                );
                tokio::time::sleep(delay).await;
                retry_delays.push(delay);
            }

            let resp = self
                .client
                .post(&self.endpoint)
                .bearer_auth(&self.api_key)
                .header("HTTP-Referer", &self.config.site_url)
                .header("X-Title", &self.config.app_title)
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();
                    let code = status.as_u16();

                    if status.is_success() {
                        info!(attempts = attempt + 1, model = %self.config.model, "completion stream opened");
                        let tokens = spawn_relay(response.bytes_stream(), idle);
                        return Ok(CompletionStream {
                            tokens,
                            attempts: attempt + 1,
                            retry_delays,
                        });
                    }

                    let body_text = response.text().await.unwrap_or_default();

                    if code == 401 || code == 403 {
                        return Err(VaultError::Unauthorized { status: code });
                    }
                    if code == 429 {
                        last_err = Some(VaultError::RateLimited(body_text));
                        continue;
                    }
                    if status.is_server_error() {
                        last_err = Some(VaultError::upstream(
                            Some(code),
                            format!("completion API error {}: {}", status, body_text),
                        ));
                        continue;
                    }

                    return Err(VaultError::upstream(
                        Some(code),
                        format!("completion API error {}: {}", status, body_text),
                    ));
                }
                Err(e) => {
                    last_err = Some(VaultError::upstream(None, e.to_string()));
                    continue;
                }
            }
        }

        Err(last_err
            .unwrap_or_else(|| VaultError::upstream(None, "completion failed after retries")))
    }
}

/// Delay before retry number `attempt` (1-based). Saturates instead of
/// overflowing.
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let factor = 2u32.pow(attempt.saturating_sub(1).min(16));
    base.checked_mul(factor).unwrap_or(Duration::MAX)
}

/// An open completion: the tokens plus how the stream was established.
pub struct CompletionStream {
    pub tokens: TokenStream,
    /// Requests sent, including the successful one.
    pub attempts: u32,
    /// Delays slept before each retry, in order.
    pub retry_delays: Vec<Duration>,
}

/// Incremental model output. Dropping it cancels the upstream stream.
pub struct TokenStream {
    rx: mpsc::Receiver<String>,
}

impl TokenStream {
    pub async fn recv(&mut self) -> Option<String> {
        self.rx.recv().await
    }

    /// Drain everything into one string.
    pub async fn collect_text(mut self) -> String {
        let mut out = String::new();
        while let Some(token) = self.rx.recv().await {
            out.push_str(&token);
        }
        out
    }
}

impl Stream for TokenStream {
    type Item = String;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<String>> {
        self.rx.poll_recv(cx)
    }
}

/// How a relay ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    Completed { chunks: usize },
    Failed { chunks: usize },
    Cancelled { chunks: usize },
}

fn spawn_relay<S, B, E>(stream: S, idle: Duration) -> TokenStream
where
    S: Stream<Item = std::result::Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Display + Send + 'static,
{
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    tokio::spawn(async move {
        let started = Instant::now();
        let outcome = relay_tokens(stream, tx, idle).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        match outcome {
            RelayOutcome::Completed { chunks } => {
                info!(chunks, elapsed_ms, "completion stream finished")
            }
            RelayOutcome::Failed { chunks } => {
                warn!(chunks, elapsed_ms, "completion stream failed mid-flight")
            }
            RelayOutcome::Cancelled { chunks } => {
                info!(chunks, elapsed_ms, "completion stream cancelled by caller")
            }
        }
    });
    TokenStream { rx }
}

/// Forward server-sent completion events from `stream` to `tx` as tokens.
pub async fn relay_tokens<S, B, E>(stream: S, tx: mpsc::Sender<String>, idle: Duration) -> RelayOutcome
where
    S: Stream<Item = std::result::Result<B, E>>,
    B: AsRef<[u8]>,
    E: Display,
{
    let mut stream = Box::pin(stream);
    let mut buffer: Vec<u8> = Vec::new();
    let mut chunks = 0;

    loop {
        let next = tokio::select! {
            _ = tx.closed() => return RelayOutcome::Cancelled { chunks },
            next = tokio::time::timeout(idle, stream.next()) => next,
        };

        let bytes = match next {
            Err(_) => {
                warn!(idle_secs = idle.as_secs(), "completion stream went idle");
                let _ = tx.send(STREAM_FAILURE_NOTICE.to_string()).await;
                return RelayOutcome::Failed { chunks };
            }
            Ok(None) => {
                // Last line may lack a trailing newline.
                let rest = std::mem::take(&mut buffer);
                return match parse_sse_line(&rest) {
                    SseLine::Token(token) => {
                        if tx.send(token).await.is_err() {
                            return RelayOutcome::Cancelled { chunks };
                        }
                        RelayOutcome::Completed { chunks: chunks + 1 }
                    }
                    SseLine::Error(message) => {
                        warn!(%message, "completion stream reported an error");
                        let _ = tx.send(STREAM_FAILURE_NOTICE.to_string()).await;
                        RelayOutcome::Failed { chunks }
                    }
                    _ => RelayOutcome::Completed { chunks },
                };
            }
            Ok(Some(Err(e))) => {
                warn!(error = %e, chunks, "completion stream read failed");
                let _ = tx.send(STREAM_FAILURE_NOTICE.to_string()).await;
                return RelayOutcome::Failed { chunks };
            }
            Ok(Some(Ok(bytes))) => bytes,
        };

        buffer.extend_from_slice(bytes.as_ref());
        while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = buffer.drain(..=pos).collect();
            match parse_sse_line(&line) {
                SseLine::Token(token) => {
                    if tx.send(token).await.is_err() {
                        return RelayOutcome::Cancelled { chunks };
                    }
                    chunks += 1;
                }
                SseLine::Done => return RelayOutcome::Completed { chunks },
                SseLine::Error(message) => {
                    warn!(%message, "completion stream reported an error");
                    let _ = tx.send(STREAM_FAILURE_NOTICE.to_string()).await;
                    return RelayOutcome::Failed { chunks };
                }
                SseLine::Skip => {}
            }
        }
    }
}

#[derive(Debug, PartialEq)]
enum SseLine {
    Token(String),
    Done,
    Error(String),
    Skip,
}

fn parse_sse_line(raw: &[u8]) -> SseLine {
    let line = String::from_utf8_lossy(raw);
    let line = line.trim();
    let Some(data) = line.strip_prefix("data:") else {
        return SseLine::Skip;
    };
    let data = data.trim();
    if data == "[DONE]" {
        return SseLine::Done;
    }

    let Ok(event) = serde_json::from_str::<serde_json::Value>(data) else {
        return SseLine::Skip;
    };
    if let Some(error) = event.get("error") {
        let message = error
            .get("message")
            .and_then(|m| m.as_str())
            .unwrap_or("unknown stream error");
        return SseLine::Error(message.to_string());
    }

    match event
        .pointer("/choices/0/delta/content")
        .and_then(|c| c.as_str())
    {
        Some(text) if !text.is_empty() => SseLine::Token(text.to_string()),
        _ => SseLine::Skip,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    fn event(text: &str) -> String {
        format!(
            "data: {}\n\n",
            serde_json::json!({ "choices": [{ "delta": { "content": text } }] })
        )
    }

    fn ok(s: String) -> std::result::Result<Vec<u8>, String> {
        Ok(s.into_bytes())
    }

    #[test]
    fn test_backoff_doubles() {
        let base = Duration::from_secs(1);
        assert_eq!(backoff_delay(base, 1), Duration::from_secs(1));
        assert_eq!(backoff_delay(base, 2), Duration::from_secs(2));
        assert_eq!(backoff_delay(base, 3), Duration::from_secs(4));
    }

    #[test]
    fn test_backoff_saturates() {
        assert_eq!(backoff_delay(Duration::MAX, 2), Duration::MAX);
        let base = Duration::from_millis(60_000);
        assert_eq!(backoff_delay(base, 40), base * 65_536);
    }

    #[test]
    fn test_parse_sse_line() {
        assert_eq!(
            parse_sse_line(event("Hi").trim().as_bytes()),
            SseLine::Token("Hi".to_string())
        );
        assert_eq!(parse_sse_line(b"data: [DONE]\n"), SseLine::Done);
        assert_eq!(parse_sse_line(b": OPENROUTER PROCESSING\n"), SseLine::Skip);
        assert_eq!(parse_sse_line(b"\n"), SseLine::Skip);
        assert_eq!(
            parse_sse_line(br#"data: {"choices":[{"delta":{"role":"assistant"}}]}"#),
            SseLine::Skip
        );
        assert_eq!(
            parse_sse_line(br#"data: {"error":{"message":"overloaded"}}"#),
            SseLine::Error("overloaded".to_string())
        );
    }

    #[tokio::test]
    async fn test_relay_splits_events_across_chunks() {
        let whole = format!("{}{}data: [DONE]\n\n", event("Hel"), event("lo"));
        let (a, b) = whole.split_at(17);
        let source = stream::iter(vec![ok(a.to_string()), ok(b.to_string())]);

        let (tx, mut rx) = mpsc::channel(16);
        let outcome = relay_tokens(source, tx, Duration::from_secs(5)).await;
        assert_eq!(outcome, RelayOutcome::Completed { chunks: 2 });

        let mut text = String::new();
        while let Some(t) = rx.recv().await {
            text.push_str(&t);
        }
        assert_eq!(text, "Hello");
    }

    #[tokio::test]
    async fn test_relay_multibyte_split() {
        let whole = event("héllo wörld");
        let bytes = whole.into_bytes();
        let cut = bytes.iter().position(|b| *b >= 0x80).unwrap() + 1;
        let source = stream::iter(vec![
            Ok::<_, String>(bytes[..cut].to_vec()),
            Ok(bytes[cut..].to_vec()),
        ]);

        let (tx, mut rx) = mpsc::channel(16);
        relay_tokens(source, tx, Duration::from_secs(5)).await;
        assert_eq!(rx.recv().await.as_deref(), Some("héllo wörld"));
    }

    #[tokio::test]
    async fn test_relay_mid_stream_failure_appends_notice() {
        let source = stream::iter(vec![
            ok(event("partial ")),
            ok(event("answer")),
            Err("connection reset".to_string()),
        ]);

        let (tx, mut rx) = mpsc::channel(16);
        let outcome = relay_tokens(source, tx, Duration::from_secs(5)).await;
        assert_eq!(outcome, RelayOutcome::Failed { chunks: 2 });

        let mut parts = Vec::new();
        while let Some(t) = rx.recv().await {
            parts.push(t);
        }
        assert_eq!(parts, vec!["partial ", "answer", STREAM_FAILURE_NOTICE]);
    }

    #[tokio::test]
    async fn test_relay_idle_timeout() {
        let source = stream::iter(vec![ok(event("first"))]).chain(stream::pending());
        let (tx, mut rx) = mpsc::channel(16);
        let outcome = relay_tokens(source, tx, Duration::from_millis(50)).await;
        assert_eq!(outcome, RelayOutcome::Failed { chunks: 1 });
        assert_eq!(rx.recv().await.as_deref(), Some("first"));
        assert_eq!(rx.recv().await.as_deref(), Some(STREAM_FAILURE_NOTICE));
    }

    #[tokio::test]
    async fn test_relay_stops_when_receiver_dropped() {
        let events: Vec<_> = (0..1000).map(|i| ok(event(&format!("t{} ", i)))).collect();
        let (tx, mut rx) = mpsc::channel(1);

        let relay = tokio::spawn(relay_tokens(
            stream::iter(events),
            tx,
            Duration::from_secs(5),
        ));
        assert_eq!(rx.recv().await.as_deref(), Some("t0 "));
        drop(rx);

        match relay.await.unwrap() {
            RelayOutcome::Cancelled { chunks } => assert!(chunks < 1000),
            other => panic!("expected cancellation, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_key_is_configuration_error() {
        let config = CompletionConfig {
            api_key_env: "VAULT_CONTEXT_TEST_UNSET_COMPLETION_KEY".to_string(),
            ..CompletionConfig::default()
        };
        let err = CompletionStreamer::new(&config).err().unwrap();
        assert_eq!(err.code(), "configuration_missing");
        assert_eq!(err.status(), 500);
    }
}
