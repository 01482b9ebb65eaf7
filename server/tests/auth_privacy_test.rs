//! Privacy tests for credentials in logs.
//!
//! Viewer access tokens and publisher signatures must never appear in log
//! output, even at TRACE level.
//!
//! # Test Approach
//!
//! 1. Use a custom tracing subscriber Layer to capture all log messages and
//!    span fields, plus the JSON formatter used in production
//! 2. Exercise the admission and ingest paths with real and bogus credentials
//! 3. Verify that the credentials do NOT appear in captured logs

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tower::ServiceExt;
use tracing::span::{Attributes, Id, Record};
use tracing::Subscriber;
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

use toppet_server::auth::StaticTokenAuthenticator;
use toppet_server::config::Config;
use toppet_server::routes::{create_router, AppState};
use toppet_server::types::UserId;

const VIEWER_TOKEN: &str = "viewer-secret-7f3a9c";
const BOGUS_TOKEN: &str = "bogus-secret-55e1d0";

// ============================================================================
// Log Capture Infrastructure
// ============================================================================

/// A buffer for capturing log output during tests.
#[derive(Clone, Default)]
struct LogCapture {
    logs: Arc<Mutex<Vec<String>>>,
}

impl LogCapture {
    fn get_logs(&self) -> String {
        self.logs.lock().unwrap().join("\n")
    }
}

/// A tracing Layer that captures log events for inspection.
struct CaptureLayer {
    capture: LogCapture,
}

impl<S> Layer<S> for CaptureLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = StringVisitor::default();
        event.record(&mut visitor);

        let message = format!(
            "[{}] {}: {}",
            event.metadata().level(),
            event.metadata().target(),
            visitor.parts.join(" ")
        );

        self.capture.logs.lock().unwrap().push(message);
    }

    fn on_new_span(&self, attrs: &Attributes<'_>, _id: &Id, _ctx: Context<'_, S>) {
        let mut visitor = StringVisitor::default();
        attrs.record(&mut visitor);

        let message = format!(
            "[span {}] {}",
            attrs.metadata().name(),
            visitor.parts.join(" ")
        );

        self.capture.logs.lock().unwrap().push(message);
    }

    fn on_record(&self, _id: &Id, values: &Record<'_>, _ctx: Context<'_, S>) {
        let mut visitor = StringVisitor::default();
        values.record(&mut visitor);

        self.capture
            .logs
            .lock()
            .unwrap()
            .push(format!("[span record] {}", visitor.parts.join(" ")));
    }
}

/// Collects all event fields into strings.
#[derive(Default)]
struct StringVisitor {
    parts: Vec<String>,
}

impl tracing::field::Visit for StringVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        self.parts.push(format!("{}={:?}", field.name(), value));
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        self.parts.push(format!("{}={}", field.name(), value));
    }
}

/// Runs an async test body with log capture at TRACE level.
async fn with_log_capture_async<F, Fut>(test_fn: F) -> String
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    let capture = LogCapture::default();
    let layer = CaptureLayer {
        capture: capture.clone(),
    };

    let subscriber = tracing_subscriber::registry()
        .with(layer.with_filter(tracing_subscriber::filter::LevelFilter::TRACE));

    let _guard = tracing::subscriber::set_default(subscriber);
    test_fn().await;

    capture.get_logs()
}

/// In-memory sink for the formatted log output.
#[derive(Clone, Default)]
struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl io::Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Runs an async test body under the JSON formatter at TRACE level.
async fn with_json_output_async<F, Fut>(test_fn: F) -> String
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    let buffer = SharedBuffer::default();
    let writer = buffer.clone();
    let layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(move || writer.clone())
        .with_filter(tracing_subscriber::filter::LevelFilter::TRACE);

    let subscriber = tracing_subscriber::registry().with(layer);
    let _guard = tracing::subscriber::set_default(subscriber);
    test_fn().await;

    let bytes = buffer.0.lock().unwrap().clone();
    String::from_utf8(bytes).unwrap()
}

fn assert_secret_not_in_logs(logs: &str, secret: &str, context: &str) {
    assert!(
        !logs.contains(secret),
        "Secret found in logs during {context}!\nSecret: {secret}\nLogs:\n{logs}"
    );
}

fn auth_config() -> Config {
    Config {
        port: 0,
        user_tokens: HashMap::from([(VIEWER_TOKEN.to_string(), UserId(11))]),
        ..Config::default()
    }
}

// ============================================================================
// Test Cases
// ============================================================================

#[tokio::test]
async fn rejected_viewer_token_not_logged() {
    let logs = with_log_capture_async(|| async {
        let app = create_router(AppState::new(auth_config()));

        let by_query = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri(format!("/ws?accessToken={BOGUS_TOKEN}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(by_query.status(), StatusCode::UNAUTHORIZED);

        let by_header = app
            .oneshot(
                Request::builder()
                    .uri("/api/contests/C1/chat/ws")
                    .header("Authorization", format!("Bearer {BOGUS_TOKEN}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(by_header.status(), StatusCode::UNAUTHORIZED);
    })
    .await;

    assert!(!logs.is_empty(), "expected rejection to be logged");
    assert_secret_not_in_logs(&logs, BOGUS_TOKEN, "token rejection");
}

#[tokio::test]
async fn request_span_records_path_without_query() {
    let logs = with_log_capture_async(|| async {
        let app = create_router(AppState::new(auth_config()));
        let response = app
            .oneshot(
                Request::builder()
                    .uri(format!("/ws?accessToken={VIEWER_TOKEN}&user_id=11"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        // Authenticated, but a plain GET is not an upgrade.
        assert_ne!(response.status(), StatusCode::UNAUTHORIZED);
    })
    .await;

    assert!(logs.contains("[span request]"), "expected a request span:\n{logs}");
    assert!(logs.contains("path=/ws"), "expected the path in the span:\n{logs}");
    assert!(!logs.contains("accessToken"), "query leaked into logs:\n{logs}");
    assert_secret_not_in_logs(&logs, VIEWER_TOKEN, "request span");
}

#[tokio::test]
async fn json_log_output_omits_query_token() {
    let output = with_json_output_async(|| async {
        let app = create_router(AppState::new(auth_config()));
        let response = app
            .oneshot(
                Request::builder()
                    .uri(format!("/api/contests/C1/chat/ws?accessToken={BOGUS_TOKEN}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    })
    .await;

    assert!(
        output.contains(r#""path":"/api/contests/C1/chat/ws""#),
        "expected the request path in JSON output:\n{output}"
    );
    assert_secret_not_in_logs(&output, BOGUS_TOKEN, "JSON formatted request");
}

#[tokio::test]
async fn accepted_viewer_token_not_logged() {
    let logs = with_log_capture_async(|| async {
        let app = create_router(AppState::new(auth_config()));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let (mut ws, _) = timeout(
            Duration::from_secs(3),
            connect_async(format!("ws://{addr}/api/contests/C1/chat/ws?accessToken={VIEWER_TOKEN}")),
        )
        .await
        .expect("timed out connecting")
        .expect("handshake failed");

        ws.send(Message::text(
            r#"{"type":"message","contest_id":"C1","text":"sit"}"#,
        ))
        .await
        .unwrap();
        let echoed = timeout(Duration::from_secs(3), ws.next()).await;
        assert!(matches!(echoed, Ok(Some(Ok(Message::Text(_))))));

        ws.close(None).await.unwrap();
    })
    .await;

    assert_secret_not_in_logs(&logs, VIEWER_TOKEN, "viewer session");
}

#[tokio::test]
async fn publisher_signature_not_logged_on_failure() {
    let signature = "c2lnbmF0dXJlLXRoYXQtZG9lcy1ub3QtdmVyaWZ5LWF0LWFsbC0xMjM0NTY3ODkw";

    let logs = with_log_capture_async(|| async {
        let app = create_router(AppState::new(auth_config()));
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/events")
                    .header("X-Source-ID", "vote-service")
                    .header("X-Signature", signature)
                    .body(Body::from(r#"{"event":{}}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    })
    .await;

    assert!(logs.contains("vote-service"), "source id should be logged");
    assert_secret_not_in_logs(&logs, signature, "signature verification");
}

#[test]
fn debug_output_does_not_leak_tokens() {
    let config = auth_config();
    let authenticator = StaticTokenAuthenticator::new(&config.user_tokens);

    let rendered = format!("{config:?} {authenticator:?}");

    assert_secret_not_in_logs(&rendered, VIEWER_TOKEN, "Debug formatting");
}
