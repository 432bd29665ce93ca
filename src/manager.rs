//! Connection manager: the process-wide registry of agent key → dialer.
//!
//! When a control connection drops abruptly the key enters a grace period
//! instead of disappearing. Dials for that key are queued (up to a hard
//! capacity) and replayed in arrival order against the next dialer that
//! registers for it. If nothing registers before the window closes, the
//! queued dials fail with [`DialError::GraceExpired`].
//!
//! All registry state sits behind one mutex so a dial never observes a
//! half-updated view (a dialer gone but its grace entry not yet created).
//! A dialer closes without taking that lock, so every path that reads the
//! registry treats an already-closed active dialer as retired. The lock is
//! never held across an await.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::dialer::{CloseReason, Dialer, DialerConfig, PendingDial, PickupSlot};
use crate::error::{DialError, RegisterError};
use crate::protocol::{is_valid_key, ControlMessage};
use crate::stream::Connection;

/// Grace-period and queueing limits.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// How long an abruptly disconnected key stays dialable.
    pub grace_period: Duration,
    /// Hard cap on dials queued for one key during its grace period.
    pub max_queued_dials: usize,
    /// How often the sweeper expires stale grace entries.
    pub sweep_interval: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(30),
            max_queued_dials: 16,
            sweep_interval: Duration::from_secs(5),
        }
    }
}

/// Read-only snapshot for health endpoints and metrics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManagerStats {
    pub active_connections: usize,
    pub grace_period_entries: usize,
    pub queued_dials: usize,
    pub connected_keys: Vec<String>,
}

type Replay = Result<PendingDial, DialError>;

/// A dial that arrived during a grace period.
struct Waiter {
    tx: oneshot::Sender<Replay>,
}

impl Waiter {
    fn is_live(&self) -> bool {
        !self.tx.is_closed()
    }
}

struct GraceEntry {
    disconnected_at: Instant,
    queue: VecDeque<Waiter>,
}

impl GraceEntry {
    fn live_waiters(&self) -> usize {
        self.queue.iter().filter(|w| w.is_live()).count()
    }

    fn fail_all(self, err: &DialError) -> usize {
        let mut failed = 0;
        for waiter in self.queue {
            if waiter.tx.send(Err(err.clone())).is_ok() {
                failed += 1;
            }
        }
        failed
    }
}

#[derive(Default)]
struct Registry {
    active: HashMap<String, Arc<Dialer>>,
    grace: HashMap<String, GraceEntry>,
}

impl Registry {
    /// Drop `dialer` from `active` if it is still current for `key`. An
    /// abrupt close leaves a grace entry in its place.
    fn retire(&mut self, key: &str, dialer: &Arc<Dialer>, reason: CloseReason, grace: Duration) {
        let is_current = self
            .active
            .get(key)
            .is_some_and(|current| Arc::ptr_eq(current, dialer));
        if !is_current {
            return;
        }
        self.active.remove(key);

        match reason {
            CloseReason::Abrupt => {
                info!(key, "Connection lost, starting {grace:?} grace period");
                self.grace.insert(
                    key.to_string(),
                    GraceEntry {
                        disconnected_at: Instant::now(),
                        queue: VecDeque::new(),
                    },
                );
            }
            CloseReason::Intentional | CloseReason::Replaced => {
                info!(key, reason = reason.as_str(), "Agent unregistered");
            }
        }
    }

    /// Live keys and grace keys, counting closed dialers the watcher has not
    /// retired yet as if it had.
    fn view(&self) -> (Vec<String>, Vec<String>) {
        let mut active = Vec::with_capacity(self.active.len());
        let mut grace: Vec<String> = self.grace.keys().cloned().collect();
        for (key, dialer) in &self.active {
            match dialer.close_reason() {
                None => active.push(key.clone()),
                Some(CloseReason::Abrupt) => grace.push(key.clone()),
                Some(_) => {}
            }
        }
        active.sort();
        grace.sort();
        (active, grace)
    }
}

struct Shared {
    config: ManagerConfig,
    dialer_config: DialerConfig,
    registry: Mutex<Registry>,
    stop: CancellationToken,
}

enum Route {
    Direct(PendingDial),
    Queued {
        rx: oneshot::Receiver<Replay>,
        deadline: Instant,
    },
}

/// Single source of truth mapping agent keys to their active dialer.
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

impl ConnectionManager {
    /// A manager with no background sweeper. Expired grace entries are
    /// still removed when a dial touches them, or by
    /// [`ConnectionManager::sweep_expired`].
    pub fn new(config: ManagerConfig, dialer_config: DialerConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                dialer_config,
                registry: Mutex::new(Registry::default()),
                stop: CancellationToken::new(),
            }),
        }
    }

    /// A manager that sweeps its own grace entries every `sweep_interval`
    /// until [`ConnectionManager::shutdown`] or the last clone is dropped.
    /// Must be called inside a tokio runtime.
    pub fn start(config: ManagerConfig, dialer_config: DialerConfig) -> Self {
        let manager = Self::new(config, dialer_config);
        manager.spawn_sweeper(manager.shared.stop.clone());
        manager
    }

    pub fn dialer_config(&self) -> &DialerConfig {
        &self.shared.dialer_config
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.shared
            .registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Create and register a dialer for a freshly accepted control connection.
    /// The receiver carries the messages its writer must send to the agent.
    pub fn connect(
        &self,
        key: &str,
    ) -> Result<(Arc<Dialer>, mpsc::UnboundedReceiver<ControlMessage>), RegisterError> {
        if !is_valid_key(key) {
            return Err(RegisterError::InvalidKey(key.to_string()));
        }
        let (dialer, control_rx) = Dialer::new(key, self.shared.dialer_config.clone());
        self.register(key, Arc::clone(&dialer));
        Ok((dialer, control_rx))
    }

    /// Install `dialer` as the active dialer for `key`.
    ///
    /// A previous dialer for the key is closed as replaced. Dials queued
    /// during a grace period are started on the new dialer, oldest first,
    /// before the lock is released, so they precede any dial that arrives
    /// after registration.
    pub fn register(&self, key: &str, dialer: Arc<Dialer>) {
        let replaced = {
            let mut reg = self.registry();
            let replaced = reg.active.insert(key.to_string(), Arc::clone(&dialer));

            if let Some(entry) = reg.grace.remove(key) {
                let mut replayed = 0;
                for waiter in entry.queue {
                    if !waiter.is_live() {
                        continue;
                    }
                    let started = dialer.begin();
                    if waiter.tx.send(started).is_ok() {
                        replayed += 1;
                    }
                }
                info!(
                    key,
                    replayed,
                    after_ms = entry.disconnected_at.elapsed().as_millis(),
                    "Agent reconnected within grace period"
                );
            }
            replaced
        };

        if let Some(old) = replaced.filter(|old| !Arc::ptr_eq(old, &dialer)) {
            warn!(key, "Agent re-registered while a connection exists, replacing old");
            old.close(CloseReason::Replaced);
        }
        info!(key, "Agent registered");

        let manager = self.clone();
        let key = key.to_string();
        let span = info_span!("revdial_watch", key = %key);
        tokio::spawn(
            async move {
                let reason = dialer.closed().await;
                manager.on_dialer_closed(&key, &dialer, reason);
            }
            .instrument(span),
        );
    }

    fn on_dialer_closed(&self, key: &str, dialer: &Arc<Dialer>, reason: CloseReason) {
        let grace = self.shared.config.grace_period;
        self.registry().retire(key, dialer, reason, grace);
    }

    /// Explicitly unregister `key`: closes its dialer without a grace period
    /// and fails dials queued for it. Returns whether anything was registered.
    pub fn disconnect(&self, key: &str) -> bool {
        let (dialer, grace) = {
            let mut reg = self.registry();
            (reg.active.remove(key), reg.grace.remove(key))
        };
        let found = dialer.is_some() || grace.is_some();
        if let Some(dialer) = dialer {
            dialer.close(CloseReason::Intentional);
        }
        if let Some(entry) = grace {
            let failed = entry.fail_all(&DialError::Disconnected(key.to_string()));
            if failed > 0 {
                info!(key, failed, "Failed queued dials for disconnected agent");
            }
        }
        if found {
            info!(key, "Agent disconnected");
        }
        found
    }

    /// Open a new logical connection to the agent registered as `key`.
    pub async fn dial(&self, key: &str) -> Result<Connection, DialError> {
        self.dial_cancellable(key, &CancellationToken::new()).await
    }

    /// Like [`ConnectionManager::dial`], returning [`DialError::Cancelled`]
    /// as soon as `cancel` fires.
    pub async fn dial_cancellable(
        &self,
        key: &str,
        cancel: &CancellationToken,
    ) -> Result<Connection, DialError> {
        match self.route(key)? {
            Route::Direct(pending) => pending.wait(cancel).await,
            Route::Queued { mut rx, deadline } => {
                let pending = tokio::select! {
                    replay = &mut rx => match replay {
                        Ok(started) => started?,
                        Err(_) => return Err(DialError::GraceExpired(key.to_string())),
                    },
                    () = cancel.cancelled() => return Err(DialError::Cancelled),
                    () = tokio::time::sleep_until(deadline) => {
                        return Err(DialError::GraceExpired(key.to_string()));
                    }
                };
                debug!(key, id = pending.id(), "Queued dial replayed after reconnect");
                pending.wait(cancel).await
            }
        }
    }

    fn route(&self, key: &str) -> Result<Route, DialError> {
        let grace_period = self.shared.config.grace_period;
        let capacity = self.shared.config.max_queued_dials;
        let mut reg = self.registry();

        if let Some(dialer) = reg.active.get(key).cloned() {
            // Started under the lock, so a close from here on fails this dial
            // as pending rather than racing the watcher.
            if dialer.close_reason().is_none() {
                if let Ok(pending) = dialer.begin() {
                    return Ok(Route::Direct(pending));
                }
                // Writer already gone
                dialer.close(CloseReason::Abrupt);
            }
            let reason = dialer.close_reason().unwrap_or(CloseReason::Abrupt);
            reg.retire(key, &dialer, reason, grace_period);
        }

        let Some(entry) = reg.grace.get_mut(key) else {
            return Err(DialError::NoConnection(key.to_string()));
        };

        let deadline = entry.disconnected_at + grace_period;
        if Instant::now() >= deadline {
            if let Some(expired) = reg.grace.remove(key) {
                expired.fail_all(&DialError::GraceExpired(key.to_string()));
            }
            return Err(DialError::GraceExpired(key.to_string()));
        }

        entry.queue.retain(Waiter::is_live);
        if entry.queue.len() >= capacity {
            warn!(key, capacity, "Too many pending dials during grace period");
            return Err(DialError::QueueFull {
                key: key.to_string(),
                capacity,
            });
        }

        let (tx, rx) = oneshot::channel();
        entry.queue.push_back(Waiter { tx });
        debug!(
            key,
            queued = entry.queue.len(),
            remaining_ms = deadline.saturating_duration_since(Instant::now()).as_millis(),
            "Dial waiting for reconnection"
        );
        Ok(Route::Queued { rx, deadline })
    }

    /// Take the pending dial `id` on `key`'s current dialer.
    pub fn claim(&self, key: &str, id: &str) -> Option<PickupSlot> {
        let dialer = self.registry().active.get(key).cloned()?;
        dialer.claim(id)
    }

    /// Route a data connection to the dial waiting on `id`. The connection is
    /// returned when nothing is waiting for it.
    pub fn deliver(&self, key: &str, id: &str, conn: Connection) -> Result<(), Connection> {
        let dialer = self.registry().active.get(key).cloned();
        match dialer {
            Some(dialer) => dialer.deliver(id, conn),
            None => Err(conn),
        }
    }

    /// Expire grace entries older than the grace period, failing their queued
    /// dials. Returns the expired keys.
    pub fn sweep_expired(&self) -> Vec<String> {
        let grace_period = self.shared.config.grace_period;
        let now = Instant::now();
        let expired: Vec<(String, GraceEntry)> = {
            let mut reg = self.registry();
            let keys: Vec<String> = reg
                .grace
                .iter()
                .filter(|(_, e)| now.duration_since(e.disconnected_at) >= grace_period)
                .map(|(k, _)| k.clone())
                .collect();
            keys.into_iter()
                .filter_map(|k| reg.grace.remove(&k).map(|e| (k, e)))
                .collect()
        };

        let mut keys = Vec::with_capacity(expired.len());
        for (key, entry) in expired {
            let failed = entry.fail_all(&DialError::GraceExpired(key.clone()));
            info!(key = %key, failed, "Grace period expired, cleaning up");
            keys.push(key);
        }
        keys
    }

    /// Run [`ConnectionManager::sweep_expired`] every `sweep_interval` until
    /// `cancel` fires or every clone of the manager is dropped.
    pub fn spawn_sweeper(&self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let shared: Weak<Shared> = Arc::downgrade(&self.shared);
        let every = self.shared.config.sweep_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let Some(shared) = shared.upgrade() else { break };
                        ConnectionManager { shared }.sweep_expired();
                    }
                    () = cancel.cancelled() => break,
                }
            }
        })
    }

    pub fn stats(&self) -> ManagerStats {
        let reg = self.registry();
        let (connected_keys, grace_keys) = reg.view();
        ManagerStats {
            active_connections: connected_keys.len(),
            grace_period_entries: grace_keys.len(),
            queued_dials: reg.grace.values().map(GraceEntry::live_waiters).sum(),
            connected_keys,
        }
    }

    /// Keys with an active dialer, sorted.
    pub fn keys(&self) -> Vec<String> {
        self.registry().view().0
    }

    /// Keys currently in their grace period, sorted.
    pub fn grace_keys(&self) -> Vec<String> {
        self.registry().view().1
    }

    /// Close every dialer intentionally, fail all queued dials and stop the
    /// sweeper started by [`ConnectionManager::start`].
    pub fn shutdown(&self) {
        self.shared.stop.cancel();
        let (active, grace) = {
            let mut reg = self.registry();
            (
                std::mem::take(&mut reg.active),
                std::mem::take(&mut reg.grace),
            )
        };
        for (key, dialer) in active {
            dialer.close(CloseReason::Intentional);
            debug!(key = %key, "Closed dialer for shutdown");
        }
        for (key, entry) in grace {
            entry.fail_all(&DialError::Disconnected(key));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    fn manager(capacity: usize) -> ConnectionManager {
        ConnectionManager::new(
            ManagerConfig {
                grace_period: Duration::from_secs(30),
                max_queued_dials: capacity,
                sweep_interval: Duration::from_secs(5),
            },
            DialerConfig {
                dial_timeout: Duration::from_secs(10),
                ..DialerConfig::default()
            },
        )
    }

    /// Let spawned watcher tasks observe closes.
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    async fn next_id(rx: &mut mpsc::UnboundedReceiver<ControlMessage>) -> String {
        match rx.recv().await {
            Some(ControlMessage::ConnReady { id }) => id,
            other => panic!("expected conn-ready, got {other:?}"),
        }
    }

    fn data_conn(key: &str, id: &str) -> (Connection, DuplexStream) {
        let (near, far) = tokio::io::duplex(1024);
        (Connection::from_duplex(key, id, near), far)
    }

    #[tokio::test]
    async fn test_dial_unknown_key() {
        let mgr = manager(4);
        assert_eq!(
            mgr.dial("nobody").await.unwrap_err(),
            DialError::NoConnection("nobody".into())
        );
    }

    #[tokio::test]
    async fn test_connect_rejects_invalid_key() {
        let mgr = manager(4);
        assert!(matches!(
            mgr.connect("bad key"),
            Err(RegisterError::InvalidKey(_))
        ));
        assert_eq!(mgr.stats().active_connections, 0);
    }

    #[tokio::test]
    async fn test_dial_active_agent_round_trip() {
        let mgr = manager(4);
        let (_dialer, mut rx) = mgr.connect("A").unwrap();

        let m = mgr.clone();
        let dial = tokio::spawn(async move { m.dial("A").await });
        let id = next_id(&mut rx).await;
        let (conn, mut agent) = data_conn("A", &id);
        mgr.deliver("A", &id, conn).unwrap();

        let mut conn = dial.await.unwrap().unwrap();
        conn.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        agent.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        agent.write_all(b"pong").await.unwrap();
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[tokio::test(start_paused = true)]
    async fn test_dial_during_grace_succeeds_after_reconnect() {
        let mgr = manager(4);
        let (dialer, _rx) = mgr.connect("B").unwrap();
        dialer.close(CloseReason::Abrupt);
        settle().await;
        assert_eq!(mgr.grace_keys(), vec!["B".to_string()]);

        tokio::time::sleep(Duration::from_secs(5)).await;
        let m = mgr.clone();
        let dial = tokio::spawn(async move { m.dial("B").await });
        settle().await;
        assert_eq!(mgr.stats().queued_dials, 1);

        tokio::time::sleep(Duration::from_secs(10)).await;
        let (_dialer, mut rx) = mgr.connect("B").unwrap();
        let id = next_id(&mut rx).await;
        let (conn, _agent) = data_conn("B", &id);
        mgr.deliver("B", &id, conn).unwrap();

        assert_eq!(dial.await.unwrap().unwrap().key(), "B");
        let stats = mgr.stats();
        assert_eq!(stats.grace_period_entries, 0);
        assert_eq!(stats.queued_dials, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dial_fails_when_grace_expires_before_reconnect() {
        let mgr = manager(4);
        let (dialer, _rx) = mgr.connect("B").unwrap();
        dialer.close(CloseReason::Abrupt);
        settle().await;

        tokio::time::sleep(Duration::from_secs(5)).await;
        let started = Instant::now();
        let err = mgr.dial("B").await.unwrap_err();
        assert_eq!(err, DialError::GraceExpired("B".into()));
        assert!(started.elapsed() <= Duration::from_secs(26));

        // After expiry the key is unknown until the agent returns at 40s.
        mgr.sweep_expired();
        assert_eq!(
            mgr.dial("B").await.unwrap_err(),
            DialError::NoConnection("B".into())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_full_is_immediate_backpressure() {
        let mgr = manager(2);
        let (dialer, _rx) = mgr.connect("C").unwrap();
        dialer.close(CloseReason::Abrupt);
        settle().await;

        let mut queued = Vec::new();
        for _ in 0..2 {
            let m = mgr.clone();
            queued.push(tokio::spawn(async move { m.dial("C").await }));
        }
        settle().await;
        assert_eq!(mgr.stats().queued_dials, 2);

        let err = mgr.dial("C").await.unwrap_err();
        assert_eq!(
            err,
            DialError::QueueFull {
                key: "C".into(),
                capacity: 2
            }
        );
        mgr.disconnect("C");
        for handle in queued {
            assert_eq!(
                handle.await.unwrap().unwrap_err(),
                DialError::Disconnected("C".into())
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_waiter_frees_its_queue_slot() {
        let mgr = manager(1);
        let (dialer, _rx) = mgr.connect("D").unwrap();
        dialer.close(CloseReason::Abrupt);
        settle().await;

        let cancel = CancellationToken::new();
        let m = mgr.clone();
        let c = cancel.clone();
        let waiting = tokio::spawn(async move { m.dial_cancellable("D", &c).await });
        settle().await;
        cancel.cancel();
        assert_eq!(waiting.await.unwrap().unwrap_err(), DialError::Cancelled);
        assert_eq!(mgr.stats().queued_dials, 0);

        let m = mgr.clone();
        let next = tokio::spawn(async move { m.dial("D").await });
        settle().await;
        assert_eq!(mgr.stats().queued_dials, 1);
        mgr.disconnect("D");
        assert!(next.await.unwrap().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_replay_preserves_arrival_order() {
        let mgr = manager(4);
        let (dialer, _rx) = mgr.connect("E").unwrap();
        dialer.close(CloseReason::Abrupt);
        settle().await;

        let mut handles = Vec::new();
        for _ in 0..3 {
            let m = mgr.clone();
            handles.push(tokio::spawn(async move { m.dial("E").await }));
            settle().await;
        }

        let (_dialer, mut rx) = mgr.connect("E").unwrap();
        let mut ids = Vec::new();
        for _ in 0..3 {
            ids.push(next_id(&mut rx).await);
        }
        settle().await;
        for (handle, id) in handles.into_iter().zip(&ids) {
            let (conn, _agent) = data_conn("E", id);
            mgr.deliver("E", id, conn).unwrap();
            assert_eq!(handle.await.unwrap().unwrap().id(), id.as_str());
        }
    }

    #[tokio::test]
    async fn test_intentional_close_skips_grace() {
        let mgr = manager(4);
        let (dialer, _rx) = mgr.connect("F").unwrap();
        dialer.close(CloseReason::Intentional);
        settle().await;
        assert_eq!(mgr.stats().grace_period_entries, 0);
        assert_eq!(
            mgr.dial("F").await.unwrap_err(),
            DialError::NoConnection("F".into())
        );
    }

    #[tokio::test]
    async fn test_reregistration_replaces_previous_dialer() {
        let mgr = manager(4);
        let (old, _old_rx) = mgr.connect("G").unwrap();
        let (new, _new_rx) = mgr.connect("G").unwrap();
        settle().await;

        assert!(old.is_closed());
        assert!(!new.is_closed());
        let stats = mgr.stats();
        assert_eq!(stats.active_connections, 1);
        assert_eq!(stats.grace_period_entries, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_expires_only_stale_entries() {
        let mgr = manager(4);
        let (first, _r1) = mgr.connect("H1").unwrap();
        first.close(CloseReason::Abrupt);
        settle().await;
        tokio::time::sleep(Duration::from_secs(20)).await;
        let (second, _r2) = mgr.connect("H2").unwrap();
        second.close(CloseReason::Abrupt);
        settle().await;
        tokio::time::sleep(Duration::from_secs(11)).await;

        assert_eq!(mgr.sweep_expired(), vec!["H1".to_string()]);
        assert_eq!(mgr.grace_keys(), vec!["H2".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_task_runs_periodically() {
        let mgr = manager(4);
        let cancel = CancellationToken::new();
        let sweeper = mgr.spawn_sweeper(cancel.clone());
        let (dialer, _rx) = mgr.connect("I").unwrap();
        dialer.close(CloseReason::Abrupt);
        settle().await;

        tokio::time::sleep(Duration::from_secs(36)).await;
        assert!(mgr.grace_keys().is_empty());
        cancel.cancel();
        sweeper.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stats_is_read_only() {
        let mgr = manager(4);
        let (_a, _ra) = mgr.connect("J1").unwrap();
        let (b, _rb) = mgr.connect("J2").unwrap();
        b.close(CloseReason::Abrupt);
        settle().await;
        let m = mgr.clone();
        let _queued = tokio::spawn(async move { m.dial("J2").await });
        settle().await;

        let first = mgr.stats();
        for _ in 0..5 {
            assert_eq!(mgr.stats(), first);
        }
        assert_eq!(first.active_connections, 1);
        assert_eq!(first.grace_period_entries, 1);
        assert_eq!(first.queued_dials, 1);
        assert_eq!(first.connected_keys, vec!["J1".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dial_right_after_abrupt_close_is_queued() {
        let mgr = manager(4);
        let (dialer, _rx) = mgr.connect("L").unwrap();
        dialer.close(CloseReason::Abrupt);

        // Polled before the watcher task gets a chance to run.
        let mut dial = Box::pin(mgr.dial("L"));
        assert!(futures::poll!(dial.as_mut()).is_pending());
        let stats = mgr.stats();
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.grace_period_entries, 1);
        assert_eq!(stats.queued_dials, 1);

        let (_dialer, mut rx) = mgr.connect("L").unwrap();
        let id = next_id(&mut rx).await;
        let (conn, _agent) = data_conn("L", &id);
        mgr.deliver("L", &id, conn).unwrap();
        assert_eq!(dial.await.unwrap().id(), id.as_str());
    }

    #[tokio::test]
    async fn test_stats_reflect_close_before_watcher_runs() {
        let mgr = manager(4);
        let (abrupt, _r1) = mgr.connect("M1").unwrap();
        let (intentional, _r2) = mgr.connect("M2").unwrap();
        abrupt.close(CloseReason::Abrupt);
        intentional.close(CloseReason::Intentional);

        let stats = mgr.stats();
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.grace_period_entries, 1);
        assert!(stats.connected_keys.is_empty());
        assert_eq!(mgr.grace_keys(), vec!["M1".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_started_manager_sweeps_until_shutdown() {
        let mgr = ConnectionManager::start(
            ManagerConfig::default(),
            DialerConfig::default(),
        );
        let (dialer, _rx) = mgr.connect("N").unwrap();
        dialer.close(CloseReason::Abrupt);
        settle().await;
        assert_eq!(mgr.grace_keys(), vec!["N".to_string()]);

        tokio::time::sleep(Duration::from_secs(36)).await;
        assert!(mgr.grace_keys().is_empty());
        mgr.shutdown();
        assert!(mgr.shared.stop.is_cancelled());
    }

    #[tokio::test]
    async fn test_shutdown_closes_everything() {
        let mgr = manager(4);
        let (a, _ra) = mgr.connect("K").unwrap();
        mgr.shutdown();
        assert!(a.is_closed());
        assert_eq!(mgr.stats().active_connections, 0);
    }
}
