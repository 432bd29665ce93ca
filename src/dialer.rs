//! Server-side dialer: one per registered agent.
//!
//! A dial is split in two halves so the connection manager can replay queued
//! requests in order while holding its lock:
//!
//! 1. [`Dialer::begin`] mints a correlation ID, records the pending dial and
//!    queues `conn-ready{id}` for the control connection's writer.
//! 2. [`PendingDial::wait`] waits for the agent's data connection, a
//!    `pickup-failed`, the caller's cancellation token or the dial timeout.
//!
//! Every pending dial lives in exactly one map entry holding the only
//! `oneshot::Sender` for it. Whoever removes the entry resolves the dial, so
//! it resolves exactly once. A [`PendingDial`] that is dropped removes its
//! entry, which makes a late data connection an orphan that gets closed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::DialError;
use crate::protocol::{new_correlation_id, ControlMessage};
use crate::stream::Connection;

/// Timeouts for one agent's control connection and its dials.
#[derive(Debug, Clone)]
pub struct DialerConfig {
    /// How long a dial waits for the agent's data connection.
    pub dial_timeout: Duration,
    /// Interval between server-sent keep-alives.
    pub keepalive_interval: Duration,
    /// Control connection is considered dead after this long without a frame.
    pub read_timeout: Duration,
}

impl Default for DialerConfig {
    fn default() -> Self {
        Self {
            dial_timeout: Duration::from_secs(30),
            keepalive_interval: Duration::from_secs(15),
            read_timeout: Duration::from_secs(45),
        }
    }
}

/// Dialer lifecycle: `Active → Closing → Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialerState {
    Active,
    Closing,
    Closed,
}

/// Why a dialer stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Transport error, EOF, read timeout or protocol error. Starts a grace period.
    Abrupt,
    /// The agent said goodbye or the key was unregistered on purpose.
    Intentional,
    /// A newer control connection registered for the same key.
    Replaced,
}

impl CloseReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Abrupt => "abrupt",
            Self::Intentional => "intentional",
            Self::Replaced => "replaced",
        }
    }
}

type DialResult = Result<Connection, DialError>;

struct PendingEntry {
    tx: oneshot::Sender<DialResult>,
    created_at: Instant,
}

type PendingMap = Arc<Mutex<HashMap<String, PendingEntry>>>;

#[derive(Debug, Clone, Copy)]
struct Lifecycle {
    state: DialerState,
    reason: Option<CloseReason>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The server's handle on one agent's ability to accept reverse dials.
pub struct Dialer {
    key: String,
    config: DialerConfig,
    control_tx: mpsc::UnboundedSender<ControlMessage>,
    pending: PendingMap,
    lifecycle: watch::Sender<Lifecycle>,
}

impl Dialer {
    /// Create a dialer for `key`. The returned receiver yields the control
    /// messages the connection's writer must send to the agent, in order.
    pub fn new(
        key: impl Into<String>,
        config: DialerConfig,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ControlMessage>) {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (lifecycle, _) = watch::channel(Lifecycle {
            state: DialerState::Active,
            reason: None,
        });
        let dialer = Arc::new(Self {
            key: key.into(),
            config,
            control_tx,
            pending: Arc::new(Mutex::new(HashMap::new())),
            lifecycle,
        });
        (dialer, control_rx)
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn state(&self) -> DialerState {
        self.lifecycle.borrow().state
    }

    /// True once closing has started.
    pub fn is_closed(&self) -> bool {
        self.state() != DialerState::Active
    }

    /// Number of dials currently waiting for a data connection.
    pub fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }

    /// Register a pending dial and emit `conn-ready` for it.
    pub fn begin(&self) -> Result<PendingDial, DialError> {
        let id = new_correlation_id();
        let (tx, rx) = oneshot::channel();
        {
            // State is checked under the pending lock so `close()` either
            // sees this entry in its drain or we see it closing.
            let mut pending = lock(&self.pending);
            if self.is_closed() {
                return Err(DialError::Closed);
            }
            pending.insert(
                id.clone(),
                PendingEntry {
                    tx,
                    created_at: Instant::now(),
                },
            );
        }

        if self
            .control_tx
            .send(ControlMessage::ConnReady { id: id.clone() })
            .is_err()
        {
            lock(&self.pending).remove(&id);
            return Err(DialError::Closed);
        }
        debug!(key = %self.key, id = %id, "Sent conn-ready");

        Ok(PendingDial {
            key: self.key.clone(),
            id,
            rx,
            pending: Arc::clone(&self.pending),
            timeout: self.config.dial_timeout,
        })
    }

    /// Open a new logical connection to the agent's local target.
    pub async fn dial(&self) -> Result<Connection, DialError> {
        self.dial_cancellable(&CancellationToken::new()).await
    }

    /// Like [`Dialer::dial`], giving up with [`DialError::Cancelled`] as soon
    /// as `cancel` fires.
    pub async fn dial_cancellable(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Connection, DialError> {
        self.begin()?.wait(cancel).await
    }

    /// Take the pending entry for `id`, if it is still waiting.
    pub fn claim(&self, id: &str) -> Option<PickupSlot> {
        let entry = lock(&self.pending).remove(id)?;
        debug!(
            key = %self.key,
            id,
            waited_ms = entry.created_at.elapsed().as_millis(),
            "Claimed pending dial"
        );
        Some(PickupSlot {
            key: self.key.clone(),
            id: id.to_string(),
            tx: Some(entry.tx),
        })
    }

    /// Hand a data connection to the dial waiting on `id`. Unknown, expired
    /// and already-used IDs give the connection back so the caller closes it.
    pub fn deliver(&self, id: &str, conn: Connection) -> Result<(), Connection> {
        match self.claim(id) {
            Some(slot) => slot.fulfil(conn),
            None => {
                warn!(key = %self.key, id, "Data connection for unknown or expired id");
                Err(conn)
            }
        }
    }

    /// Fail the dial waiting on `id` with the agent's reason. Returns `false`
    /// if nothing was waiting.
    pub fn fail(&self, id: &str, reason: String) -> bool {
        let Some(entry) = lock(&self.pending).remove(id) else {
            return false;
        };
        warn!(key = %self.key, id, reason = %reason, "Agent reported pickup failure");
        let _ = entry.tx.send(Err(DialError::PickupFailed { reason }));
        true
    }

    /// Fail every pending dial with [`DialError::Closed`] and notify
    /// [`Dialer::closed`] waiters. Only the first call has any effect.
    pub fn close(&self, reason: CloseReason) -> bool {
        let first = self.lifecycle.send_if_modified(|l| {
            if l.state == DialerState::Active {
                l.state = DialerState::Closing;
                l.reason = Some(reason);
                true
            } else {
                false
            }
        });
        if !first {
            return false;
        }

        let drained: Vec<PendingEntry> = lock(&self.pending).drain().map(|(_, e)| e).collect();
        let failed = drained.len();
        for entry in drained {
            let _ = entry.tx.send(Err(DialError::Closed));
        }

        self.lifecycle.send_replace(Lifecycle {
            state: DialerState::Closed,
            reason: Some(reason),
        });
        info!(
            key = %self.key,
            reason = reason.as_str(),
            failed,
            "Dialer closed"
        );
        true
    }

    /// Resolves once the dialer is fully closed.
    pub async fn closed(&self) -> CloseReason {
        let mut rx = self.lifecycle.subscribe();
        let reason = match rx.wait_for(|l| l.state == DialerState::Closed).await {
            Ok(l) => l.reason.unwrap_or(CloseReason::Abrupt),
            Err(_) => CloseReason::Abrupt,
        };
        reason
    }

    /// The reason given to [`Dialer::close`], once closing has started.
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.lifecycle.borrow().reason
    }
}

/// Second half of a dial: the caller's wait for its data connection.
pub struct PendingDial {
    key: String,
    id: String,
    rx: oneshot::Receiver<DialResult>,
    pending: PendingMap,
    timeout: Duration,
}

impl PendingDial {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Wait for the data connection, the agent's failure report, `cancel` or
    /// the dial timeout, whichever comes first.
    pub async fn wait(mut self, cancel: &CancellationToken) -> Result<Connection, DialError> {
        let timeout = self.timeout;
        tokio::select! {
            res = &mut self.rx => res.unwrap_or(Err(DialError::Closed)),
            () = cancel.cancelled() => {
                debug!(key = %self.key, id = %self.id, "Dial cancelled by caller");
                Err(DialError::Cancelled)
            }
            () = tokio::time::sleep(timeout) => {
                warn!(key = %self.key, id = %self.id, "No data connection within {timeout:?}");
                Err(DialError::Timeout(timeout))
            }
        }
    }
}

impl Drop for PendingDial {
    fn drop(&mut self) {
        lock(&self.pending).remove(&self.id);
    }
}

/// A claimed pending dial, resolved by handing it a data connection. Dropping
/// an unfulfilled slot fails the dial with [`DialError::PickupFailed`].
pub struct PickupSlot {
    key: String,
    id: String,
    tx: Option<oneshot::Sender<DialResult>>,
}

impl PickupSlot {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Deliver `conn` to the waiting caller. If the caller already gave up the
    /// connection comes back.
    pub fn fulfil(mut self, conn: Connection) -> Result<(), Connection> {
        let Some(tx) = self.tx.take() else {
            return Err(conn);
        };
        if let Err(Ok(conn)) = tx.send(Ok(conn)) {
            debug!(key = %self.key, id = %self.id, "Caller stopped waiting before handoff");
            return Err(conn);
        }
        debug!(key = %self.key, id = %self.id, "Data connection handed off");
        Ok(())
    }
}

impl Drop for PickupSlot {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Err(DialError::PickupFailed {
                reason: "data connection was not established".to_string(),
            }));
        }
    }
}
