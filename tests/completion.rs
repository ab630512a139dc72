use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use futures::{stream, StreamExt};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use vault_context::completion::{CompletionStreamer, STREAM_FAILURE_NOTICE};
use vault_context::config::CompletionConfig;
use vault_context::models::ChatTurn;

#[derive(Clone, Copy)]
enum Mode {
    Healthy,
    Unauthorized,
    RateLimitedOnce,
    AlwaysRateLimited,
    BadRequest,
    AlwaysDown,
    BreaksMidStream,
    Endless,
}

struct Mock {
    mode: Mode,
    hits: AtomicUsize,
    last_body: Mutex<Option<Value>>,
    last_headers: Mutex<Option<HeaderMap>>,
    stream_dropped: Arc<AtomicBool>,
}

struct DropFlag(Arc<AtomicBool>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

fn event(text: &str) -> String {
    format!(
        "data: {}\n\n",
        serde_json::json!({ "choices": [{ "delta": { "content": text } }] })
    )
}

fn sse(body: Body) -> Response {
    ([(header::CONTENT_TYPE, "text/event-stream")], body).into_response()
}

fn healthy() -> Response {
    sse(Body::from(format!(
        ": OPENROUTER PROCESSING\n\n{}{}data: [DONE]\n\n",
        event("Hello"),
        event(" world")
    )))
}

async fn chat(State(mock): State<Arc<Mock>>, headers: HeaderMap, Json(body): Json<Value>) -> Response {
    let n = mock.hits.fetch_add(1, Ordering::SeqCst) + 1;
    *mock.last_body.lock().unwrap() = Some(body);
    *mock.last_headers.lock().unwrap() = Some(headers);

    match mock.mode {
        Mode::Healthy => healthy(),
        Mode::Unauthorized => (StatusCode::UNAUTHORIZED, "invalid key").into_response(),
        Mode::RateLimitedOnce if n == 1 => (StatusCode::TOO_MANY_REQUESTS, "slow down").into_response(),
        Mode::RateLimitedOnce => healthy(),
        Mode::AlwaysRateLimited => (StatusCode::TOO_MANY_REQUESTS, "slow down").into_response(),
        Mode::BadRequest => (StatusCode::BAD_REQUEST, "bad model").into_response(),
        Mode::AlwaysDown => (StatusCode::SERVICE_UNAVAILABLE, "down").into_response(),
        Mode::BreaksMidStream => {
            let parts = stream::iter(vec![
                Ok::<String, std::io::Error>(event("Partial")),
                Ok(event(" answer")),
                Err(std::io::Error::new(std::io::ErrorKind::Other, "upstream died")),
            ])
            .then(|part| async move {
                if part.is_err() {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
                part
            });
            sse(Body::from_stream(parts))
        }
        Mode::Endless => {
            let flag = DropFlag(mock.stream_dropped.clone());
            let parts = stream::unfold((0u64, flag), |(i, flag)| async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                Some((
                    Ok::<String, std::io::Error>(event(&format!("t{} ", i))),
                    (i + 1, flag),
                ))
            });
            sse(Body::from_stream(parts))
        }
    }
}

async fn start(mode: Mode) -> (CompletionConfig, Arc<Mock>) {
    let mock = Arc::new(Mock {
        mode,
        hits: AtomicUsize::new(0),
        last_body: Mutex::new(None),
        last_headers: Mutex::new(None),
        stream_dropped: Arc::new(AtomicBool::new(false)),
    });
    let app = Router::new()
        .route("/api/v1/chat/completions", post(chat))
        .with_state(mock.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let config = CompletionConfig {
        base_url: format!("http://{}/api/v1", addr),
        retry_base_delay_ms: 10,
        stream_idle_timeout_secs: 5,
        ..CompletionConfig::default()
    };
    (config, mock)
}

fn messages() -> Vec<ChatTurn> {
    vec![
        ChatTurn::system("You answer questions about notes."),
        ChatTurn::user("What bugs are mentioned?"),
    ]
}

#[tokio::test]
async fn test_streams_tokens() {
    let (config, mock) = start(Mode::Healthy).await;
    let streamer = CompletionStreamer::with_api_key(&config, "test-key").unwrap();

    let opened = streamer.stream(&messages()).await.unwrap();
    assert_eq!(opened.attempts, 1);
    assert!(opened.retry_delays.is_empty());
    assert_eq!(opened.tokens.collect_text().await, "Hello world");
    assert_eq!(mock.hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_request_shape() {
    let (config, mock) = start(Mode::Healthy).await;
    let streamer = CompletionStreamer::with_api_key(&config, "test-key").unwrap();
    streamer.stream(&messages()).await.unwrap().tokens.collect_text().await;

    let body = mock.last_body.lock().unwrap().clone().unwrap();
    assert_eq!(body["model"], "anthropic/claude-3.5-sonnet");
    assert_eq!(body["stream"], true);
    assert_eq!(body["max_tokens"], 2000);
    assert_eq!(body["messages"][0]["role"], "system");
    assert_eq!(body["messages"][1]["role"], "user");
    assert_eq!(body["messages"][1]["content"], "What bugs are mentioned?");

    let headers = mock.last_headers.lock().unwrap().clone().unwrap();
    assert_eq!(headers["authorization"], "Bearer test-key");
    assert_eq!(headers["x-title"], "vault-context");
    assert_eq!(headers["http-referer"], "http://localhost:7340");
}

#[tokio::test]
async fn test_unauthorized_is_not_retried() {
    let (config, mock) = start(Mode::Unauthorized).await;
    let streamer = CompletionStreamer::with_api_key(&config, "wrong").unwrap();

    let err = streamer.stream(&messages()).await.err().unwrap();
    assert_eq!(err.code(), "unauthorized");
    assert_eq!(err.status(), 401);
    assert_eq!(mock.hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_rate_limit_then_success() {
    let (mut config, mock) = start(Mode::RateLimitedOnce).await;
    config.retry_base_delay_ms = 1000;
    let streamer = CompletionStreamer::with_api_key(&config, "test-key").unwrap();

    let started = Instant::now();
    let opened = streamer.stream(&messages()).await.unwrap();
    assert!(started.elapsed() >= Duration::from_secs(1));
    assert_eq!(opened.attempts, 2);
    assert_eq!(opened.retry_delays, vec![Duration::from_secs(1)]);
    assert_eq!(opened.tokens.collect_text().await, "Hello world");
    assert_eq!(mock.hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_rate_limit_exhausts_retries() {
    let (config, mock) = start(Mode::AlwaysRateLimited).await;
    let streamer = CompletionStreamer::with_api_key(&config, "test-key").unwrap();

    let err = streamer.stream(&messages()).await.err().unwrap();
    assert_eq!(err.code(), "rate_limited");
    assert_eq!(mock.hits.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_client_error_is_not_retried() {
    let (config, mock) = start(Mode::BadRequest).await;
    let streamer = CompletionStreamer::with_api_key(&config, "test-key").unwrap();

    let err = streamer.stream(&messages()).await.err().unwrap();
    assert_eq!(err.code(), "upstream_failure");
    assert_eq!(mock.hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_server_errors_retried_with_backoff() {
    let (config, mock) = start(Mode::AlwaysDown).await;
    let streamer = CompletionStreamer::with_api_key(&config, "test-key").unwrap();

    let err = streamer.stream(&messages()).await.err().unwrap();
    assert_eq!(err.code(), "upstream_failure");
    assert_eq!(err.status(), 502);
    assert_eq!(mock.hits.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_unreachable_host_is_upstream_failure() {
    let config = CompletionConfig {
        base_url: "http://127.0.0.1:1".to_string(),
        max_retries: 1,
        retry_base_delay_ms: 10,
        ..CompletionConfig::default()
    };
    let streamer = CompletionStreamer::with_api_key(&config, "test-key").unwrap();
    let err = streamer.stream(&messages()).await.err().unwrap();
    assert_eq!(err.code(), "upstream_failure");
}

#[tokio::test]
async fn test_mid_stream_failure_keeps_partial_output() {
    let (config, mock) = start(Mode::BreaksMidStream).await;
    let streamer = CompletionStreamer::with_api_key(&config, "test-key").unwrap();

    let text = streamer
        .stream(&messages())
        .await
        .unwrap()
        .tokens
        .collect_text()
        .await;
    assert!(text.starts_with("Partial answer"), "got {:?}", text);
    assert!(text.ends_with(STREAM_FAILURE_NOTICE));
    // no replay of the request once tokens have flowed
    assert_eq!(mock.hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_dropping_tokens_releases_upstream() {
    let (config, mock) = start(Mode::Endless).await;
    let streamer = CompletionStreamer::with_api_key(&config, "test-key").unwrap();

    let mut opened = streamer.stream(&messages()).await.unwrap();
    assert_eq!(opened.tokens.recv().await.as_deref(), Some("t0 "));
    drop(opened);

    let deadline = Instant::now() + Duration::from_secs(5);
    while !mock.stream_dropped.load(Ordering::SeqCst) {
        assert!(Instant::now() < deadline, "upstream stream was never released");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
