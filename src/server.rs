//! HTTP surface of the server: control and pickup WebSockets, stats, health.
//!
//! An agent keeps one control WebSocket open at `/api/revdial?key=K`. For
//! every dial the server sends `conn-ready{id}` on it and the agent answers
//! by opening `/api/revdial/pickup?key=K&id=ID`, which becomes the byte
//! stream handed to the dial's caller.

use std::time::Instant;

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::get,
    Extension, Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::auth::{require_token, AuthToken};
use crate::dialer::{CloseReason, Dialer};
use crate::error::ProtocolError;
use crate::manager::{ConnectionManager, ManagerStats};
use crate::protocol::{is_valid_correlation_id, is_valid_key, ControlMessage};
use crate::stream::Connection;

/// Shared state passed to every handler via Axum's `State` extractor.
#[derive(Clone)]
pub struct ServerState {
    pub manager: ConnectionManager,
    /// Monotonic instant when the server started (for uptime calculation).
    pub start_time: Instant,
}

impl ServerState {
    pub fn new(manager: ConnectionManager) -> Self {
        Self {
            manager,
            start_time: Instant::now(),
        }
    }
}

/// Build the router with every endpoint. `token` guards all but health.
pub fn router(state: ServerState, token: String) -> Router {
    let public_routes = Router::new().route("/api/health", get(health));

    let authed_routes = Router::new()
        .route("/api/revdial", get(control_ws))
        .route("/api/revdial/pickup", get(pickup_ws))
        .route("/api/revdial/stats", get(stats))
        .layer(middleware::from_fn(require_token));

    Router::new()
        .merge(public_routes)
        .merge(authed_routes)
        .layer(Extension(AuthToken(token)))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn bad_request(message: &str) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({"error": message}))).into_response()
}

/// `GET /api/health`: liveness probe, no authentication.
async fn health(State(state): State<ServerState>) -> Json<Value> {
    let stats = state.manager.stats();
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.start_time.elapsed().as_secs(),
        "active_connections": stats.active_connections,
        "grace_period_entries": stats.grace_period_entries,
    }))
}

/// `GET /api/revdial/stats`: registry snapshot.
async fn stats(State(state): State<ServerState>) -> Json<ManagerStats> {
    Json(state.manager.stats())
}

// ─── Control connection ──────────────────────────────────────────────────────

#[derive(Deserialize)]
struct ControlQuery {
    key: String,
}

/// `GET /api/revdial?key=<key>`: agent control WebSocket.
async fn control_ws(
    State(state): State<ServerState>,
    Query(query): Query<ControlQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    if !is_valid_key(&query.key) {
        return bad_request("Invalid key format");
    }

    let key = query.key;
    info!(key = %key, "Agent connecting...");

    ws.on_upgrade(move |socket| {
        let span = info_span!("revdial_agent", key = %key);
        handle_control(socket, state, key).instrument(span)
    })
}

/// Why the control loop stopped, before it is mapped to a [`CloseReason`].
enum Exit {
    /// The dialer was closed from elsewhere (replaced, unregistered, shutdown).
    Closed(CloseReason),
    Peer(CloseReason),
}

/// Serve one registered agent until its control connection ends.
async fn handle_control(socket: WebSocket, state: ServerState, key: String) {
    let (dialer, mut control_rx) = match state.manager.connect(&key) {
        Ok(registered) => registered,
        Err(e) => {
            warn!(key = %key, error = %e, "Rejected agent registration");
            return;
        }
    };
    let config = state.manager.dialer_config().clone();
    let (mut ws_sink, mut ws_stream) = socket.split();

    let mut keepalive = tokio::time::interval_at(
        tokio::time::Instant::now() + config.keepalive_interval,
        config.keepalive_interval,
    );
    let read_timeout = tokio::time::sleep(config.read_timeout);
    tokio::pin!(read_timeout);
    let closed = dialer.closed();
    tokio::pin!(closed);

    let exit = loop {
        tokio::select! {
            outbound = control_rx.recv() => {
                let Some(msg) = outbound else { break Exit::Peer(CloseReason::Abrupt) };
                if ws_sink.send(Message::Text(msg.encode().into())).await.is_err() {
                    warn!(key = %key, "Control write failed");
                    break Exit::Peer(CloseReason::Abrupt);
                }
            }
            _ = keepalive.tick() => {
                let ping = ControlMessage::KeepAlive.encode();
                if ws_sink.send(Message::Text(ping.into())).await.is_err() {
                    warn!(key = %key, "Keep-alive write failed");
                    break Exit::Peer(CloseReason::Abrupt);
                }
            }
            frame = ws_stream.next() => {
                let msg = match frame {
                    Some(Ok(msg)) => msg,
                    Some(Err(e)) => {
                        warn!(key = %key, error = %e, "Control read failed");
                        break Exit::Peer(CloseReason::Abrupt);
                    }
                    None => {
                        info!(key = %key, "Control connection ended without close frame");
                        break Exit::Peer(CloseReason::Abrupt);
                    }
                };
                read_timeout
                    .as_mut()
                    .reset(tokio::time::Instant::now() + config.read_timeout);

                match handle_control_frame(&dialer, msg) {
                    Ok(None) => {}
                    Ok(Some(reason)) => break Exit::Peer(reason),
                    Err(e) => {
                        warn!(key = %key, error = %e, "Protocol error on control connection");
                        break Exit::Peer(CloseReason::Abrupt);
                    }
                }
            }
            () = &mut read_timeout => {
                warn!(key = %key, "No frame from agent within {:?}", config.read_timeout);
                break Exit::Peer(CloseReason::Abrupt);
            }
            reason = &mut closed => break Exit::Closed(reason),
        }
    };

    match exit {
        Exit::Peer(reason) => {
            dialer.close(reason);
        }
        Exit::Closed(reason) => {
            let note = match reason {
                CloseReason::Replaced => "replaced by new connection",
                _ => "server closed connection",
            };
            let _ = ws_sink
                .send(Message::Close(Some(CloseFrame {
                    code: close_code::NORMAL,
                    reason: note.into(),
                })))
                .await;
        }
    }
    info!(key = %key, pending = dialer.pending_count(), "Control connection finished");
}

/// Apply one inbound control frame. `Some(reason)` ends the connection.
fn handle_control_frame(
    dialer: &Dialer,
    msg: Message,
) -> Result<Option<CloseReason>, ProtocolError> {
    match msg {
        Message::Text(text) => match ControlMessage::decode(text.as_str())? {
            ControlMessage::KeepAlive => {}
            ControlMessage::PickupFailed { id, reason } => {
                if !dialer.fail(&id, reason) {
                    debug!(key = dialer.key(), id = %id, "pickup-failed for unknown id");
                }
            }
            msg @ ControlMessage::ConnReady { .. } => {
                return Err(ProtocolError::UnexpectedCommand(msg.command()));
            }
            ControlMessage::Unknown => {
                debug!(key = dialer.key(), "Ignoring unknown control command");
            }
        },
        Message::Binary(_) => return Err(ProtocolError::UnexpectedBinary),
        Message::Close(frame) => {
            let intentional = frame
                .as_ref()
                .is_some_and(|f| f.code == close_code::NORMAL || f.code == close_code::AWAY);
            info!(
                key = dialer.key(),
                intentional,
                "Agent closed control connection"
            );
            return Ok(Some(if intentional {
                CloseReason::Intentional
            } else {
                CloseReason::Abrupt
            }));
        }
        Message::Ping(_) | Message::Pong(_) => {}
    }
    Ok(None)
}

// ─── Data connections ────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct PickupQuery {
    key: String,
    id: String,
}

/// `GET /api/revdial/pickup?key=<key>&id=<id>`: data WebSocket for one dial.
///
/// The pending dial is claimed before upgrading so unknown, expired or reused
/// IDs get a `404` instead of a dangling socket.
async fn pickup_ws(
    State(state): State<ServerState>,
    Query(query): Query<PickupQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    if !is_valid_key(&query.key) {
        return bad_request("Invalid key format");
    }
    if !is_valid_correlation_id(&query.id) {
        return bad_request("Invalid connection id");
    }

    let Some(slot) = state.manager.claim(&query.key, &query.id) else {
        warn!(key = %query.key, id = %query.id, "Pickup for unknown or expired id");
        return (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "No pending dial for this id"})),
        )
            .into_response();
    };

    let PickupQuery { key, id } = query;
    ws.on_upgrade(move |socket| async move {
        let conn = Connection::from_ws(key, id, socket);
        if let Err(orphan) = slot.fulfil(conn) {
            debug!(key = orphan.key(), id = orphan.id(), "Closing orphaned data connection");
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialer::DialerConfig;
    use crate::manager::ManagerConfig;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use std::time::Duration;
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;
    use tower::ServiceExt;

    fn app() -> (Router, ConnectionManager) {
        let manager = ConnectionManager::new(ManagerConfig::default(), DialerConfig::default());
        let router = router(ServerState::new(manager.clone()), "tok".into());
        (router, manager)
    }

    async fn call(router: Router, uri: &str) -> (StatusCode, Value) {
        let req = Request::get(uri)
            .header("authorization", "Bearer tok")
            .body(Body::empty())
            .unwrap();
        let resp = router.oneshot(req).await.unwrap();
        let status = resp.status();
        let body = to_bytes(resp.into_body(), 64 * 1024).await.unwrap();
        let json = serde_json::from_slice(&body).unwrap_or(Value::Null);
        (status, json)
    }

    async fn serve(manager: ConnectionManager) -> std::net::SocketAddr {
        let app = router(ServerState::new(manager), "tok".into());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        addr
    }

    #[tokio::test]
    async fn test_silent_agent_times_out_into_grace_period() {
        let manager = ConnectionManager::new(
            ManagerConfig::default(),
            DialerConfig {
                dial_timeout: Duration::from_secs(5),
                keepalive_interval: Duration::from_millis(50),
                read_timeout: Duration::from_millis(300),
            },
        );
        let addr = serve(manager.clone()).await;

        let mut request = format!("ws://{addr}/api/revdial?key=quiet")
            .into_client_request()
            .unwrap();
        request
            .headers_mut()
            .insert("authorization", "Bearer tok".parse().unwrap());
        let (mut ws, _) = tokio_tungstenite::connect_async(request).await.unwrap();

        // The server keeps talking even though the agent never does.
        let frame = tokio::time::timeout(Duration::from_secs(2), ws.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(frame.to_text().unwrap(), ControlMessage::KeepAlive.encode());
        assert_eq!(manager.keys(), vec!["quiet".to_string()]);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
        while manager.grace_keys().is_empty() {
            assert!(
                tokio::time::Instant::now() < deadline,
                "agent was never timed out"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(manager.grace_keys(), vec!["quiet".to_string()]);
        assert!(manager.keys().is_empty());
        manager.shutdown();
    }

    #[tokio::test]
    async fn test_health_is_public() {
        let (router, _) = app();
        let resp = router
            .oneshot(Request::get("/api/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = to_bytes(resp.into_body(), 4096).await.unwrap();
        let json: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["active_connections"], 0);
    }

    #[tokio::test]
    async fn test_stats_requires_token() {
        let (router, _) = app();
        let resp = router
            .oneshot(Request::get("/api/revdial/stats").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_stats_reports_registry() {
        let (router, manager) = app();
        let (_dialer, _rx) = manager.connect("agent-1").unwrap();
        let (status, json) = call(router, "/api/revdial/stats").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["active_connections"], 1);
        assert_eq!(json["connected_keys"], json!(["agent-1"]));
    }

    #[tokio::test]
    async fn test_dialer_close_frame_classification() {
        let (dialer, _rx) = Dialer::new("k", DialerConfig::default());
        let normal = Message::Close(Some(CloseFrame {
            code: close_code::NORMAL,
            reason: "bye".into(),
        }));
        assert_eq!(
            handle_control_frame(&dialer, normal).unwrap(),
            Some(CloseReason::Intentional)
        );
        let error = Message::Close(Some(CloseFrame {
            code: close_code::ERROR,
            reason: "".into(),
        }));
        assert_eq!(
            handle_control_frame(&dialer, error).unwrap(),
            Some(CloseReason::Abrupt)
        );
        assert_eq!(
            handle_control_frame(&dialer, Message::Close(None)).unwrap(),
            Some(CloseReason::Abrupt)
        );
    }

    #[tokio::test]
    async fn test_control_frames_from_agent() {
        let (dialer, _rx) = Dialer::new("k", DialerConfig::default());
        let ka = Message::Text(ControlMessage::KeepAlive.encode().into());
        assert_eq!(handle_control_frame(&dialer, ka).unwrap(), None);

        let unknown = Message::Text(r#"{"command":"future-thing"}"#.into());
        assert_eq!(handle_control_frame(&dialer, unknown).unwrap(), None);

        let bogus = Message::Text(r#"{"command":"conn-ready","id":"x"}"#.into());
        assert_eq!(
            handle_control_frame(&dialer, bogus).unwrap_err(),
            ProtocolError::UnexpectedCommand("conn-ready")
        );
        assert_eq!(
            handle_control_frame(&dialer, Message::Binary(vec![1u8].into())).unwrap_err(),
            ProtocolError::UnexpectedBinary
        );
        assert!(matches!(
            handle_control_frame(&dialer, Message::Text("{".into())),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn test_pickup_failed_frame_fails_pending_dial() {
        let (dialer, mut rx) = Dialer::new("k", DialerConfig::default());
        let d = dialer.clone();
        let dial = tokio::spawn(async move { d.dial().await });
        let Some(ControlMessage::ConnReady { id }) = rx.recv().await else {
            panic!("expected conn-ready");
        };
        let frame = ControlMessage::PickupFailed {
            id,
            reason: "connection refused".into(),
        };
        handle_control_frame(&dialer, Message::Text(frame.encode().into())).unwrap();
        assert!(matches!(
            dial.await.unwrap().unwrap_err(),
            crate::error::DialError::PickupFailed { .. }
        ));
    }
}
