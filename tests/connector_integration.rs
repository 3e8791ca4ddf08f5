//! Integration tests for the session connector: real Socket.IO transport against
//! an in-process server, registration against a mock REST backend.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use session_connector::auth::StaticToken;
use session_connector::config::ReconnectionPolicy;
use session_connector::registration::HttpRegistrar;
use session_connector::transport::{TransportError, WsTransport};
use session_connector::{ConnectorError, SessionConnector};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;
use wiremock::matchers::{body_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const OPEN: &str = r#"0{"sid":"eio-1","upgrades":[],"pingInterval":25000,"pingTimeout":20000}"#;
const AUTHENTICATE: &str = r#"42["authenticate"]"#;

type ServerStream = WebSocketStream<TcpStream>;

// ============================================================================
// Log capture
// ============================================================================

/// Level and message of every event recorded while the guard is alive
#[derive(Clone, Default)]
struct CapturedLogs {
    events: Arc<Mutex<Vec<(Level, String, String)>>>,
}

impl CapturedLogs {
    /// Messages logged at `level` by this crate
    fn crate_messages(&self, level: Level) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(l, target, _)| *l == level && target.starts_with("session_connector"))
            .map(|(_, _, message)| message.clone())
            .collect()
    }
}

struct CaptureLayer {
    logs: CapturedLogs,
}

struct MessageVisitor(String);

impl tracing::field::Visit for MessageVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.0 = format!("{value:?}");
        }
    }
}

impl<S: Subscriber> Layer<S> for CaptureLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = MessageVisitor(String::new());
        event.record(&mut visitor);
        let metadata = event.metadata();
        self.logs.events.lock().unwrap().push((
            *metadata.level(),
            metadata.target().to_owned(),
            visitor.0,
        ));
    }
}

/// Capture events on the current thread. `#[tokio::test]` runs every task on
/// that thread, so the connector's tasks are captured too.
fn capture_logs() -> (CapturedLogs, tracing::subscriber::DefaultGuard) {
    let logs = CapturedLogs::default();
    let layer = CaptureLayer { logs: logs.clone() };
    let guard = tracing_subscriber::registry().with(layer).set_default();
    (logs, guard)
}

// ============================================================================
// Socket.IO server
// ============================================================================

async fn next_text(ws: &mut ServerStream) -> Option<String> {
    while let Some(Ok(message)) = ws.next().await {
        if let Message::Text(text) = message {
            return Some(text);
        }
    }
    None
}

/// Accept one socket, open the engine session and acknowledge the namespace
/// connect as `socket_id`
async fn accept_socket(listener: &TcpListener, socket_id: &str) -> ServerStream {
    let (tcp_stream, _) = listener.accept().await.unwrap();
    let mut ws = accept_async(tcp_stream).await.unwrap();
    ws.send(Message::Text(OPEN.into())).await.unwrap();

    let connect = next_text(&mut ws).await.unwrap();
    assert_eq!(connect, r#"40{"token":"test-token"}"#);
    ws.send(Message::Text(format!(r#"40{{"sid":"{}"}}"#, socket_id)))
        .await
        .unwrap();
    ws
}

async fn send_authenticated(ws: &mut ServerStream, socket_id: &str) {
    let reply = format!(
        r#"42["authenticated",{{"socketId":"{}","user":42}}]"#,
        socket_id
    );
    ws.send(Message::Text(reply)).await.unwrap();
}

/// Accepts one socket as `socket_id` and answers `authenticate`.
/// Every packet received after the handshake is reported on the returned channel.
async fn spawn_socket_server(socket_id: &'static str) -> (u16, mpsc::UnboundedReceiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (frames_tx, frames_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let mut ws = accept_socket(&listener, socket_id).await;
        while let Some(text) = next_text(&mut ws).await {
            let _ = frames_tx.send(text.clone());
            if text == AUTHENTICATE {
                send_authenticated(&mut ws, socket_id).await;
            }
        }
    });

    (port, frames_rx)
}

fn transport(port: u16, policy: ReconnectionPolicy) -> Arc<WsTransport> {
    Arc::new(WsTransport::new(
        format!("ws://127.0.0.1:{}/socket.io/", port),
        Arc::new(StaticToken::new("test-token")),
        policy,
    ))
}

fn registrar(backend: &MockServer) -> Arc<HttpRegistrar> {
    Arc::new(HttpRegistrar::new(format!(
        "{}/api/me/socketIds",
        backend.uri()
    )))
}

async fn mount_binding(backend: &MockServer, socket_id: &str, delay: Duration) {
    Mock::given(method("POST"))
        .and(path("/api/me/socketIds"))
        .and(body_json(serde_json::json!({ "socketId": socket_id })))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(serde_json::json!({ "socketId": socket_id, "userId": 42 }))
                .set_delay(delay),
        )
        .mount(backend)
        .await;
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn authenticates_and_publishes_connection() {
    let backend = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/me/socketIds"))
        .and(body_json(serde_json::json!({"socketId": "sock-123"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "socketId": "sock-123",
            "userId": 42
        })))
        .expect(1)
        .mount(&backend)
        .await;

    let (port, _frames) = spawn_socket_server("sock-123").await;
    let connector = SessionConnector::activate(
        transport(port, ReconnectionPolicy::disabled()),
        registrar(&backend),
    );
    let reader = connector.reader();

    let connection = tokio::time::timeout(Duration::from_secs(5), reader.authenticated())
        .await
        .expect("handshake should complete")
        .expect("connector should still be active");

    assert_eq!(connection.socket_id(), "sock-123");
    assert_eq!(connection.user(), &serde_json::json!(42));

    connector.deactivate().await.unwrap();
    assert!(reader.current().is_none());
}

#[tokio::test]
async fn registration_failure_keeps_session_unpublished() {
    let (logs, _guard) = capture_logs();

    let backend = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/me/socketIds"))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&backend)
        .await;

    let (port, mut frames) = spawn_socket_server("sock-999").await;
    let connector = SessionConnector::activate(
        transport(port, ReconnectionPolicy::disabled()),
        registrar(&backend),
    );
    let reader = connector.reader();

    let waited = tokio::time::timeout(Duration::from_millis(500), reader.authenticated()).await;
    assert!(waited.is_err(), "no connection should be published");
    assert!(reader.current().is_none());
    assert!(frames.try_recv().is_err(), "authenticate must not be sent");

    let warnings = logs.crate_messages(Level::WARN);
    assert_eq!(warnings.len(), 1, "expected exactly one warning, got {:?}", warnings);
    assert!(warnings[0].contains("sock-999"));
    assert!(warnings[0].contains("500"));

    connector.deactivate().await.unwrap();
}

#[tokio::test]
async fn withdrawn_connection_cannot_reach_next_socket() {
    let backend = MockServer::start().await;
    mount_binding(&backend, "sock-1", Duration::ZERO).await;
    mount_binding(&backend, "sock-2", Duration::from_secs(60)).await;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (close_first_tx, close_first_rx) = oneshot::channel::<()>();
    let (second_up_tx, second_up_rx) = oneshot::channel::<()>();
    let (frames_tx, mut frames) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let mut first = accept_socket(&listener, "sock-1").await;
        assert_eq!(next_text(&mut first).await.as_deref(), Some(AUTHENTICATE));
        send_authenticated(&mut first, "sock-1").await;
        let _ = close_first_rx.await;
        let _ = first.close(None).await;

        let mut second = accept_socket(&listener, "sock-2").await;
        let _ = second_up_tx.send(());
        while let Some(text) = next_text(&mut second).await {
            let _ = frames_tx.send(text);
        }
    });

    let policy = ReconnectionPolicy {
        delay_ms: 200,
        max_delay_ms: 200,
        ..ReconnectionPolicy::default()
    };
    let connector = SessionConnector::activate(transport(port, policy), registrar(&backend));
    let mut reader = connector.reader();

    let stale = tokio::time::timeout(Duration::from_secs(5), reader.authenticated())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stale.socket_id(), "sock-1");
    assert!(stale.is_open());

    let _ = close_first_tx.send(());
    loop {
        let current = tokio::time::timeout(Duration::from_secs(5), reader.changed())
            .await
            .unwrap()
            .unwrap();
        if current.is_none() {
            break;
        }
    }
    tokio::time::timeout(Duration::from_secs(5), second_up_rx)
        .await
        .unwrap()
        .unwrap();

    assert!(!stale.is_open());
    assert!(matches!(
        stale.emit("message", Some(serde_json::json!({"text": "stale"}))),
        Err(ConnectorError::Transport(TransportError::Closed))
    ));

    let leaked = tokio::time::timeout(Duration::from_millis(300), frames.recv()).await;
    assert!(leaked.is_err(), "second socket received {:?}", leaked);
    assert!(reader.current().is_none());

    connector.deactivate().await.unwrap();
}
