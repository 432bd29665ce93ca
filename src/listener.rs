//! Agent-side listener: keeps an outbound control WebSocket to the server
//! and opens a data connection for every `conn-ready` it receives.
//!
//! The listener owns the reconnect loop (exponential backoff, reset after
//! every connection that completed its handshake). Each data connection dials
//! the local target first so a dead target is reported as `pickup-failed`
//! before the server's dial timeout has to fire.

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::error::{ConfigError, ListenerError, ProtocolError};
use crate::protocol::{is_valid_correlation_id, ControlMessage};
use crate::stream::pump;

/// Type alias for the control connection sink to reduce verbosity.
type WsSink = Arc<Mutex<SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>>>;

/// The local endpoint data connections are spliced to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// `host:port`, optionally written `tcp:host:port`.
    Tcp(String),
    /// `unix:/path` or an absolute path.
    Unix(PathBuf),
}

/// Any byte stream a [`Target`] can produce.
pub trait LocalStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> LocalStream for T {}

impl Target {
    pub async fn connect(&self) -> io::Result<Box<dyn LocalStream>> {
        match self {
            Target::Tcp(addr) => {
                let stream = TcpStream::connect(addr).await?;
                stream.set_nodelay(true)?;
                Ok(Box::new(stream))
            }
            #[cfg(unix)]
            Target::Unix(path) => Ok(Box::new(tokio::net::UnixStream::connect(path).await?)),
            #[cfg(not(unix))]
            Target::Unix(_) => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "unix sockets are not supported on this platform",
            )),
        }
    }
}

impl FromStr for Target {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidTarget(s.to_string());
        if let Some(path) = s.strip_prefix("unix:") {
            if path.is_empty() {
                return Err(invalid());
            }
            return Ok(Target::Unix(PathBuf::from(path)));
        }
        if s.starts_with('/') {
            return Ok(Target::Unix(PathBuf::from(s)));
        }
        let addr = s.strip_prefix("tcp:").unwrap_or(s);
        let (host, port) = addr.rsplit_once(':').ok_or_else(invalid)?;
        if host.is_empty() || port.parse::<u16>().is_err() {
            return Err(invalid());
        }
        Ok(Target::Tcp(addr.to_string()))
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Tcp(addr) => write!(f, "tcp:{addr}"),
            Target::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

/// Everything the agent needs to serve one key.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Server base URL (`ws`, `wss`, `http` or `https`).
    pub server_url: String,
    pub key: String,
    /// Bearer token presented on every upgrade.
    pub token: String,
    pub target: Target,
    pub keepalive_interval: Duration,
    /// Control connection is considered dead after this long without a frame.
    pub read_timeout: Duration,
    pub reconnect_delay: Duration,
    pub reconnect_max_delay: Duration,
    /// How long shutdown waits for in-flight data connections.
    pub shutdown_timeout: Duration,
}

impl AgentConfig {
    /// Defaults for everything but the endpoints and credentials.
    pub fn new(
        server_url: impl Into<String>,
        key: impl Into<String>,
        token: impl Into<String>,
        target: Target,
    ) -> Self {
        Self {
            server_url: server_url.into(),
            key: key.into(),
            token: token.into(),
            target,
            keepalive_interval: Duration::from_secs(15),
            read_timeout: Duration::from_secs(45),
            reconnect_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(10),
        }
    }

    fn ws_base(&self) -> Result<String, ListenerError> {
        let url = self.server_url.trim_end_matches('/');
        if let Some(rest) = url.strip_prefix("http://") {
            Ok(format!("ws://{rest}"))
        } else if let Some(rest) = url.strip_prefix("https://") {
            Ok(format!("wss://{rest}"))
        } else if url.starts_with("ws://") || url.starts_with("wss://") {
            Ok(url.to_string())
        } else {
            Err(ListenerError::Request(format!(
                "unsupported server URL scheme: {url}"
            )))
        }
    }

    pub fn control_url(&self) -> Result<String, ListenerError> {
        Ok(format!("{}/api/revdial?key={}", self.ws_base()?, self.key))
    }

    pub fn pickup_url(&self, id: &str) -> Result<String, ListenerError> {
        Ok(format!(
            "{}/api/revdial/pickup?key={}&id={id}",
            self.ws_base()?,
            self.key
        ))
    }

    fn request(&self, url: &str) -> Result<Request, ListenerError> {
        let mut request = url.into_client_request()?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", self.token))
            .map_err(|e| ListenerError::Request(e.to_string()))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);
        Ok(request)
    }
}

/// Live counters for one listener.
#[derive(Debug, Default)]
pub struct ListenerStats {
    pub connected: AtomicBool,
    pub reconnects: AtomicU64,
    pub pickups_served: AtomicU64,
    pub pickups_failed: AtomicU64,
    pub active_data_connections: AtomicU64,
}

/// Point-in-time copy of [`ListenerStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ListenerSnapshot {
    pub connected: bool,
    pub reconnects: u64,
    pub pickups_served: u64,
    pub pickups_failed: u64,
    pub active_data_connections: u64,
}

impl ListenerStats {
    pub fn snapshot(&self) -> ListenerSnapshot {
        ListenerSnapshot {
            connected: self.connected.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            pickups_served: self.pickups_served.load(Ordering::Relaxed),
            pickups_failed: self.pickups_failed.load(Ordering::Relaxed),
            active_data_connections: self.active_data_connections.load(Ordering::Relaxed),
        }
    }
}

/// How one control session ended.
enum SessionEnd {
    Shutdown,
    /// The session was established, then lost.
    Lost(ListenerError),
}

/// Agent-side half of the tunnel for one key.
#[derive(Clone)]
pub struct AgentListener {
    config: Arc<AgentConfig>,
    stats: Arc<ListenerStats>,
}

impl AgentListener {
    pub fn new(config: AgentConfig) -> Self {
        Self {
            config: Arc::new(config),
            stats: Arc::new(ListenerStats::default()),
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn stats(&self) -> Arc<ListenerStats> {
        Arc::clone(&self.stats)
    }

    /// Connect, serve, reconnect on failure, until `shutdown` fires. Then
    /// wait up to `shutdown_timeout` for in-flight data connections.
    pub async fn run(&self, shutdown: CancellationToken) {
        let config = &self.config;
        let tracker = TaskTracker::new();
        let data_cancel = CancellationToken::new();
        let mut delay = config.reconnect_delay;

        while !shutdown.is_cancelled() {
            info!(key = %config.key, server = %config.server_url, "Connecting to server");
            let outcome = self.session(&shutdown, &tracker, &data_cancel).await;
            self.stats.connected.store(false, Ordering::Relaxed);

            match outcome {
                Ok(SessionEnd::Shutdown) => break,
                Ok(SessionEnd::Lost(e)) => {
                    delay = config.reconnect_delay;
                    warn!(key = %config.key, error = %e, "Control connection lost, reconnecting in {delay:?}");
                }
                Err(e) => {
                    warn!(key = %config.key, error = %e, "Connection failed, retrying in {delay:?}");
                }
            }

            self.stats.reconnects.fetch_add(1, Ordering::Relaxed);
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = shutdown.cancelled() => break,
            }
            delay = (delay * 2).min(config.reconnect_max_delay);
        }

        tracker.close();
        if !tracker.is_empty() {
            info!(
                in_flight = tracker.len(),
                "Waiting up to {:?} for data connections", config.shutdown_timeout
            );
        }
        if tokio::time::timeout(config.shutdown_timeout, tracker.wait())
            .await
            .is_err()
        {
            warn!(
                remaining = tracker.len(),
                "Shutdown timeout reached, closing data connections"
            );
            data_cancel.cancel();
            tracker.wait().await;
        }
        info!(key = %config.key, "Agent listener stopped");
    }

    /// One control connection. `Err` means it was never established.
    async fn session(
        &self,
        shutdown: &CancellationToken,
        tracker: &TaskTracker,
        data_cancel: &CancellationToken,
    ) -> Result<SessionEnd, ListenerError> {
        let config = &self.config;
        let request = config.request(&config.control_url()?)?;
        let (ws, _response) = tokio::select! {
            res = tokio_tungstenite::connect_async(request) => res?,
            () = shutdown.cancelled() => return Ok(SessionEnd::Shutdown),
        };
        info!(key = %config.key, "Control connection established");
        self.stats.connected.store(true, Ordering::Relaxed);

        let (sink, mut stream) = ws.split();
        let sink: WsSink = Arc::new(Mutex::new(sink));

        let mut keepalive = tokio::time::interval_at(
            tokio::time::Instant::now() + config.keepalive_interval,
            config.keepalive_interval,
        );
        let read_timeout = tokio::time::sleep(config.read_timeout);
        tokio::pin!(read_timeout);

        let end = loop {
            tokio::select! {
                frame = stream.next() => {
                    let msg = match frame {
                        Some(Ok(msg)) => msg,
                        Some(Err(e)) => break SessionEnd::Lost(e.into()),
                        None => break SessionEnd::Lost(ListenerError::Eof),
                    };
                    read_timeout
                        .as_mut()
                        .reset(tokio::time::Instant::now() + config.read_timeout);

                    match msg {
                        Message::Text(text) => match ControlMessage::decode(text.as_str()) {
                            Ok(ControlMessage::KeepAlive) => {}
                            Ok(ControlMessage::ConnReady { id }) => {
                                self.spawn_pickup(id, &sink, tracker, data_cancel);
                            }
                            Ok(msg @ ControlMessage::PickupFailed { .. }) => {
                                break SessionEnd::Lost(
                                    ProtocolError::UnexpectedCommand(msg.command()).into(),
                                );
                            }
                            Ok(ControlMessage::Unknown) => {
                                debug!("Ignoring unknown control command");
                            }
                            Err(e) => break SessionEnd::Lost(e.into()),
                        },
                        Message::Binary(_) => {
                            break SessionEnd::Lost(ProtocolError::UnexpectedBinary.into());
                        }
                        Message::Close(frame) => {
                            let reason = frame.map(|f| f.reason.as_str().to_string()).unwrap_or_default();
                            break SessionEnd::Lost(ListenerError::ClosedByServer(reason));
                        }
                        Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
                    }
                }
                _ = keepalive.tick() => {
                    let ping = Message::Text(ControlMessage::KeepAlive.encode().into());
                    if let Err(e) = sink.lock().await.send(ping).await {
                        break SessionEnd::Lost(e.into());
                    }
                }
                () = &mut read_timeout => {
                    break SessionEnd::Lost(ListenerError::ReadTimeout(config.read_timeout));
                }
                () = shutdown.cancelled() => {
                    info!(key = %config.key, "Closing control connection");
                    let goodbye = Message::Close(Some(CloseFrame {
                        code: CloseCode::Normal,
                        reason: "agent shutting down".into(),
                    }));
                    let _ = sink.lock().await.send(goodbye).await;
                    break SessionEnd::Shutdown;
                }
            }
        };

        Ok(end)
    }

    fn spawn_pickup(
        &self,
        id: String,
        sink: &WsSink,
        tracker: &TaskTracker,
        data_cancel: &CancellationToken,
    ) {
        if !is_valid_correlation_id(&id) {
            warn!(id = %id, "Ignoring conn-ready with malformed id");
            return;
        }
        let span = info_span!("revdial_pickup", id = %id);
        tracker.spawn(
            pickup(
                Arc::clone(&self.config),
                Arc::clone(&self.stats),
                Arc::clone(sink),
                id,
                data_cancel.clone(),
            )
            .instrument(span),
        );
    }
}

/// Serve one `conn-ready`: reach the local target, then the pickup endpoint,
/// then splice the two until either side closes.
async fn pickup(
    config: Arc<AgentConfig>,
    stats: Arc<ListenerStats>,
    sink: WsSink,
    id: String,
    cancel: CancellationToken,
) {
    let local = match config.target.connect().await {
        Ok(local) => local,
        Err(e) => {
            warn!(target = %config.target, error = %e, "Local target unreachable");
            stats.pickups_failed.fetch_add(1, Ordering::Relaxed);
            report_failure(&sink, id, e.to_string()).await;
            return;
        }
    };

    let data_ws = match open_pickup(&config, &id).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!(error = %e, "Could not open data connection");
            stats.pickups_failed.fetch_add(1, Ordering::Relaxed);
            report_failure(&sink, id, e.to_string()).await;
            return;
        }
    };

    stats.pickups_served.fetch_add(1, Ordering::Relaxed);
    stats.active_data_connections.fetch_add(1, Ordering::Relaxed);
    let spliced = pump(data_ws, local, cancel).await;
    stats.active_data_connections.fetch_sub(1, Ordering::Relaxed);
    debug!(
        bytes_in = spliced.to_io,
        bytes_out = spliced.from_io,
        "Data connection closed"
    );
}

async fn open_pickup(
    config: &AgentConfig,
    id: &str,
) -> Result<WebSocketStream<MaybeTlsStream<TcpStream>>, ListenerError> {
    let request = config.request(&config.pickup_url(id)?)?;
    let (ws, _response) = tokio_tungstenite::connect_async(request).await?;
    Ok(ws)
}

async fn report_failure(sink: &WsSink, id: String, reason: String) {
    let msg = ControlMessage::PickupFailed { id, reason };
    if sink
        .lock()
        .await
        .send(Message::Text(msg.encode().into()))
        .await
        .is_err()
    {
        debug!("Control connection gone, pickup-failed not delivered");
    }
}
