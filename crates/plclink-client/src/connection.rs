//! Connection lifecycle: connect gate, link supervision and draining.

use crate::ClientError;
#[cfg(feature = "metrics")]
use crate::ClientMetrics;
use crate::registry::{AbortReason, TransactionRegistry};
use crate::settings::ClientSettings;
use plclink_core::frame::tcp::decode_frame;
use plclink_datalink::{DataLink, LinkEvent};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Extra time a caller waits on someone else's connect attempt beyond that
/// attempt's own timeout.
const CONNECT_WAIT_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Everything the per-connection reader task touches.
#[derive(Debug)]
struct Shared {
    registry: TransactionRegistry,
    state: watch::Sender<ConnectionState>,
    /// Bumped on every connect and disconnect; events tagged with an older
    /// epoch belong to a link that is already gone.
    epoch: AtomicU64,
    link_up: AtomicBool,
    #[cfg(feature = "metrics")]
    metrics: Arc<ClientMetrics>,
}

impl Shared {
    fn link_state_changed(&self, up: bool, epoch: u64) {
        if self.epoch.load(Ordering::SeqCst) != epoch {
            debug!(epoch, up, "ignoring state change from a retired link");
            return;
        }
        if self.link_up.swap(up, Ordering::SeqCst) == up {
            return;
        }
        if up {
            debug!("link reported up");
            return;
        }

        self.state.send_if_modified(|state| {
            let changed = *state != ConnectionState::Disconnected;
            *state = ConnectionState::Disconnected;
            changed
        });
        let failed = self.registry.drain_all(AbortReason::ConnectionClosed);
        warn!(failed, "modbus link dropped");
    }

    fn dispatch_frame(&self, bytes: &[u8], unit_id: u8) {
        let frame = match decode_frame(bytes) {
            Ok(frame) => frame,
            Err(err) => {
                #[cfg(feature = "metrics")]
                self.metrics
                    .dropped_frames_total
                    .fetch_add(1, Ordering::Relaxed);
                warn!(error = %err, frame_len = bytes.len(), "dropping undecodable frame");
                return;
            }
        };
        trace!(
            transaction_id = frame.transaction_id,
            unit_id = frame.unit_id,
            pdu_len = frame.pdu.len(),
            "inbound frame"
        );

        if frame.unit_id != unit_id {
            #[cfg(feature = "metrics")]
            self.metrics
                .dropped_frames_total
                .fetch_add(1, Ordering::Relaxed);
            warn!(
                transaction_id = frame.transaction_id,
                expected = unit_id,
                actual = frame.unit_id,
                "dropping frame addressed from another unit"
            );
            return;
        }

        if !self
            .registry
            .try_resolve(frame.transaction_id, Ok(frame.pdu.to_vec()))
        {
            #[cfg(feature = "metrics")]
            self.metrics.late_frames_total.fetch_add(1, Ordering::Relaxed);
            debug!(
                transaction_id = frame.transaction_id,
                "no pending request for frame"
            );
        }
    }
}

async fn watch_link(
    shared: Arc<Shared>,
    mut events: mpsc::UnboundedReceiver<LinkEvent>,
    epoch: u64,
    unit_id: u8,
) {
    while let Some(event) = events.recv().await {
        match event {
            LinkEvent::Frame(bytes) => shared.dispatch_frame(&bytes, unit_id),
            LinkEvent::State(up) => shared.link_state_changed(up, epoch),
        }
    }
    // A closed event stream means the link is gone.
    shared.link_state_changed(false, epoch);
}

/// Owns the link and its state machine:
/// `Disconnected -> Connecting -> Connected -> Disconnected`.
///
/// Only one connect attempt runs at a time; concurrent callers wait for its
/// outcome. Whenever the link goes down, every pending request fails with
/// `ConnectionClosed`.
pub struct ConnectionManager<D> {
    link: D,
    shared: Arc<Shared>,
    connect_gate: tokio::sync::Mutex<()>,
    reader: Mutex<Option<JoinHandle<()>>>,
    settings: Mutex<ClientSettings>,
    active: Mutex<Option<Arc<ClientSettings>>>,
    last_failure: Mutex<Option<String>>,
    /// Id of the most recently claimed connect attempt; only that attempt may
    /// move the state out of `Connecting`.
    attempts: AtomicU64,
    shutdown: CancellationToken,
}

impl<D: DataLink> ConnectionManager<D> {
    pub fn new(link: D, settings: ClientSettings) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            link,
            shared: Arc::new(Shared {
                registry: TransactionRegistry::new(),
                state,
                epoch: AtomicU64::new(0),
                link_up: AtomicBool::new(false),
                #[cfg(feature = "metrics")]
                metrics: Arc::new(ClientMetrics::default()),
            }),
            connect_gate: tokio::sync::Mutex::new(()),
            reader: Mutex::new(None),
            settings: Mutex::new(settings),
            active: Mutex::new(None),
            last_failure: Mutex::new(None),
            attempts: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Settings the next `connect()` will use.
    pub fn settings(&self) -> ClientSettings {
        lock(&self.settings).clone()
    }

    /// Settings of the live connection, if any.
    pub fn active_settings(&self) -> Option<Arc<ClientSettings>> {
        lock(&self.active).clone()
    }

    /// Takes effect on the next `connect()`; a live connection keeps its snapshot.
    pub fn replace_settings(&self, settings: ClientSettings) {
        debug!(host = %settings.host, port = settings.port, "connection settings replaced");
        *lock(&self.settings) = settings;
    }

    pub fn pending_count(&self) -> usize {
        self.shared.registry.len()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub(crate) fn link(&self) -> &D {
        &self.link
    }

    pub(crate) fn registry(&self) -> &TransactionRegistry {
        &self.shared.registry
    }

    pub(crate) fn cancellation(&self) -> &CancellationToken {
        &self.shutdown
    }

    #[cfg(feature = "metrics")]
    pub(crate) fn metrics(&self) -> &Arc<ClientMetrics> {
        &self.shared.metrics
    }

    /// Bring the link up, or join an attempt that is already running.
    ///
    /// Returns immediately when already connected. Dropping the returned
    /// future mid-attempt hands the state back to `Disconnected`.
    pub async fn connect(&self) -> Result<(), ClientError> {
        if self.shutdown.is_cancelled() {
            return Err(ClientError::Cancelled);
        }
        let Some(attempt) = self.claim_attempt() else {
            return self.follow_attempt().await;
        };
        let guard = AttemptGuard {
            manager: self,
            attempt,
            armed: true,
        };

        let _gate = self.connect_gate.lock().await;
        let epoch = self.shared.epoch.load(Ordering::SeqCst);
        let settings = Arc::new(self.settings());
        info!(
            host = %settings.host,
            port = settings.port,
            unit_id = settings.unit_id,
            attempt,
            "connecting"
        );

        let dial = timeout(
            settings.connect_timeout,
            self.link.connect(&settings.host, settings.port),
        );
        let outcome = tokio::select! {
            outcome = dial => outcome,
            _ = self.shutdown.cancelled() => {
                guard.fail("shut down while connecting".to_string());
                return Err(ClientError::Cancelled);
            }
        };

        match outcome {
            Ok(Ok(events)) => match self.establish(events, settings, epoch, attempt).await {
                Ok(()) => {
                    guard.disarm();
                    Ok(())
                }
                Err(err) => {
                    guard.fail(err.to_string());
                    Err(err)
                }
            },
            Ok(Err(err)) => {
                warn!(host = %settings.host, port = settings.port, error = %err, "connect failed");
                guard.fail(err.to_string());
                Err(err.into())
            }
            Err(_) => {
                warn!(
                    host = %settings.host,
                    port = settings.port,
                    timeout_ms = settings.connect_timeout.as_millis() as u64,
                    "connect timed out"
                );
                guard.fail("connect timed out".to_string());
                Err(ClientError::ConnectTimeout)
            }
        }
    }

    /// Move `Disconnected -> Connecting` and return the id of the attempt the
    /// caller now leads, or `None` when the state was anything else.
    fn claim_attempt(&self) -> Option<u64> {
        let mut claimed = None;
        self.shared.state.send_if_modified(|state| {
            if *state != ConnectionState::Disconnected {
                return false;
            }
            *state = ConnectionState::Connecting;
            claimed = Some(self.attempts.fetch_add(1, Ordering::SeqCst) + 1);
            true
        });
        claimed
    }

    /// Move `Connecting` to `next`, but only while `attempt` still owns it.
    fn settle_attempt(&self, attempt: u64, next: ConnectionState) -> bool {
        self.shared.state.send_if_modified(|state| {
            if *state != ConnectionState::Connecting
                || self.attempts.load(Ordering::SeqCst) != attempt
            {
                return false;
            }
            *state = next;
            true
        })
    }

    async fn follow_attempt(&self) -> Result<(), ClientError> {
        let mut rx = self.subscribe_state();
        let cap = self.settings().connect_timeout + CONNECT_WAIT_GRACE;
        let settled = match timeout(
            cap,
            rx.wait_for(|state| *state != ConnectionState::Connecting),
        )
        .await
        {
            Ok(Ok(state)) => *state,
            Ok(Err(_)) => return Err(ClientError::ConnectionClosed),
            Err(_) => return Err(ClientError::ConnectTimeout),
        };

        if settled == ConnectionState::Connected {
            return Ok(());
        }
        let reason = lock(&self.last_failure)
            .clone()
            .unwrap_or_else(|| "connection attempt failed".to_string());
        Err(ClientError::ConnectFailed(reason))
    }

    fn fail_attempt(&self, attempt: u64, reason: String) {
        *lock(&self.last_failure) = Some(reason);
        self.settle_attempt(attempt, ConnectionState::Disconnected);
    }

    async fn establish(
        &self,
        events: mpsc::UnboundedReceiver<LinkEvent>,
        settings: Arc<ClientSettings>,
        dialled_at: u64,
        attempt: u64,
    ) -> Result<(), ClientError> {
        let epoch = dialled_at + 1;
        if self
            .shared
            .epoch
            .compare_exchange(dialled_at, epoch, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            // disconnect() ran while we were dialling.
            debug!(attempt, "connect attempt overtaken by disconnect");
            self.link.disconnect().await;
            return Err(ClientError::ConnectionClosed);
        }

        self.shared.link_up.store(true, Ordering::SeqCst);
        self.shared.registry.reopen();
        let task = tokio::spawn(watch_link(
            Arc::clone(&self.shared),
            events,
            epoch,
            settings.unit_id,
        ));
        if let Some(previous) = lock(&self.reader).replace(task) {
            previous.abort();
        }
        *lock(&self.active) = Some(Arc::clone(&settings));
        *lock(&self.last_failure) = None;

        if !self.settle_attempt(attempt, ConnectionState::Connected) {
            debug!(attempt, "link went away before the connection was established");
            self.disconnect().await;
            return Err(ClientError::ConnectionClosed);
        }

        info!(host = %settings.host, port = settings.port, epoch, "connected");
        Ok(())
    }

    /// Tear the link down and fail everything still pending. Idempotent.
    pub async fn disconnect(&self) {
        self.shared.epoch.fetch_add(1, Ordering::SeqCst);
        self.shared.link_up.store(false, Ordering::SeqCst);
        let previous = self.shared.state.send_replace(ConnectionState::Disconnected);

        let reader = lock(&self.reader).take();
        if let Some(task) = reader {
            task.abort();
        }
        self.link.disconnect().await;
        *lock(&self.active) = None;

        let failed = self.shared.registry.drain_all(AbortReason::ConnectionClosed);
        if previous != ConnectionState::Disconnected || failed > 0 {
            info!(failed, "disconnected");
        }
    }

    /// Cancel every pending request, disconnect, and refuse further connects.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let cancelled = self.shared.registry.drain_all(AbortReason::Cancelled);
        info!(cancelled, "shutting down");
        self.disconnect().await;
    }
}

/// Owned by the leader of a connect attempt. If the leader's future is dropped
/// before the attempt concludes, the attempt is failed so the state does not
/// stay `Connecting`.
struct AttemptGuard<'a, D: DataLink> {
    manager: &'a ConnectionManager<D>,
    attempt: u64,
    armed: bool,
}

impl<D: DataLink> AttemptGuard<'_, D> {
    fn fail(mut self, reason: String) {
        self.armed = false;
        self.manager.fail_attempt(self.attempt, reason);
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl<D: DataLink> Drop for AttemptGuard<'_, D> {
    fn drop(&mut self) {
        if self.armed {
            debug!(attempt = self.attempt, "connect attempt abandoned by its caller");
            self.manager
                .fail_attempt(self.attempt, "connect attempt abandoned".to_string());
        }
    }
}

impl<D> Drop for ConnectionManager<D> {
    fn drop(&mut self) {
        if let Some(task) = lock(&self.reader).take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ConnectionManager, ConnectionState};
    use crate::ClientError;
    use crate::registry::AbortReason;
    use crate::settings::ClientSettings;
    use crate::testing::ScriptedLink;
    use plclink_datalink::LinkEvent;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::oneshot;

    fn manager(link: &ScriptedLink) -> ConnectionManager<ScriptedLink> {
        ConnectionManager::new(link.clone(), ClientSettings::default())
    }

    async fn wait_for_state(mgr: &ConnectionManager<ScriptedLink>, wanted: ConnectionState) {
        let mut rx = mgr.subscribe_state();
        rx.wait_for(|state| *state == wanted).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_connects_share_one_attempt() {
        let link = ScriptedLink::new().with_connect_delay(Duration::from_millis(50));
        let mgr = manager(&link);

        let (a, b, c) = tokio::join!(mgr.connect(), mgr.connect(), mgr.connect());
        assert!(a.is_ok() && b.is_ok() && c.is_ok());
        assert_eq!(link.connects(), 1);
        assert_eq!(mgr.state(), ConnectionState::Connected);

        mgr.connect().await.unwrap();
        assert_eq!(link.connects(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn waiters_see_the_leaders_failure() {
        let link = ScriptedLink::new().with_connect_delay(Duration::from_millis(50));
        link.refuse_connect(true);
        let mgr = manager(&link);

        let (leader, follower) = tokio::join!(mgr.connect(), mgr.connect());
        assert!(matches!(leader, Err(ClientError::DataLink(_))));
        match follower {
            Err(ClientError::ConnectFailed(reason)) => assert!(reason.contains("scripted refusal")),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(mgr.state(), ConnectionState::Disconnected);

        link.refuse_connect(false);
        mgr.connect().await.unwrap();
        assert!(mgr.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_dial_times_out_and_manager_stays_usable() {
        let link = ScriptedLink::new().with_connect_delay(Duration::from_secs(10));
        let mgr = ConnectionManager::new(
            link.clone(),
            ClientSettings::default().with_connect_timeout(Duration::from_millis(100)),
        );

        assert!(matches!(mgr.connect().await, Err(ClientError::ConnectTimeout)));
        assert_eq!(mgr.state(), ConnectionState::Disconnected);

        link.set_connect_delay(Duration::ZERO);
        mgr.connect().await.unwrap();
        assert!(mgr.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_leader_releases_the_attempt() {
        let link = ScriptedLink::new().with_connect_delay(Duration::from_millis(500));
        let mgr = manager(&link);

        let (abandoned, follower) = tokio::join!(
            tokio::time::timeout(Duration::from_millis(100), mgr.connect()),
            mgr.connect(),
        );
        assert!(abandoned.is_err());
        match follower {
            Err(ClientError::ConnectFailed(reason)) => assert!(reason.contains("abandoned")),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(mgr.state(), ConnectionState::Disconnected);

        link.set_connect_delay(Duration::ZERO);
        mgr.connect().await.unwrap();
        assert!(mgr.is_connected());
        assert_eq!(link.connects(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn late_failure_leaves_a_newer_attempt_alone() {
        let link = ScriptedLink::new().with_connect_delay(Duration::from_millis(100));
        link.refuse_connect(true);
        let mgr = Arc::new(manager(&link));
        let spawn_connect = |mgr: &Arc<ConnectionManager<ScriptedLink>>| {
            let mgr = Arc::clone(mgr);
            tokio::spawn(async move { mgr.connect().await })
        };

        let first = spawn_connect(&mgr);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(mgr.state(), ConnectionState::Connecting);

        // The first dial is still running when the link is torn down and two
        // new callers arrive: one leads a second attempt, one follows it.
        mgr.disconnect().await;
        let second = spawn_connect(&mgr);
        tokio::time::sleep(Duration::from_millis(10)).await;
        let third = spawn_connect(&mgr);

        // t=150ms: the first dial failed at 100ms, the second is still dialling.
        tokio::time::sleep(Duration::from_millis(130)).await;
        assert!(matches!(first.await.unwrap(), Err(ClientError::DataLink(_))));
        assert_eq!(mgr.state(), ConnectionState::Connecting);
        link.refuse_connect(false);

        second.await.unwrap().unwrap();
        third.await.unwrap().unwrap();
        assert!(mgr.is_connected());
        assert_eq!(link.connects(), 2);
    }

    #[tokio::test]
    async fn link_drop_fails_pending_and_repeated_up_is_ignored() {
        let link = ScriptedLink::new();
        let mgr = manager(&link);
        mgr.connect().await.unwrap();

        let (tx1, rx1) = oneshot::channel();
        let (tx2, rx2) = oneshot::channel();
        mgr.registry().register(1, tx1).unwrap();
        mgr.registry().register(2, tx2).unwrap();

        link.inject(LinkEvent::State(true));
        tokio::task::yield_now().await;
        assert!(mgr.is_connected());
        assert_eq!(mgr.pending_count(), 2);

        link.inject(LinkEvent::State(false));
        link.inject(LinkEvent::State(false));
        wait_for_state(&mgr, ConnectionState::Disconnected).await;
        assert_eq!(rx1.await.unwrap(), Err(AbortReason::ConnectionClosed));
        assert_eq!(rx2.await.unwrap(), Err(AbortReason::ConnectionClosed));
        assert_eq!(mgr.pending_count(), 0);

        // Nothing may register against a dead link.
        let (tx3, _rx3) = oneshot::channel();
        assert!(matches!(
            mgr.registry().register(3, tx3),
            Err(ClientError::ConnectionClosed)
        ));

        mgr.connect().await.unwrap();
        assert_eq!(link.connects(), 2);
    }

    #[tokio::test]
    async fn disconnect_is_idempotent_and_drains() {
        let link = ScriptedLink::new();
        let mgr = manager(&link);
        mgr.connect().await.unwrap();

        let (tx, rx) = oneshot::channel();
        mgr.registry().register(5, tx).unwrap();

        mgr.disconnect().await;
        mgr.disconnect().await;
        assert_eq!(mgr.state(), ConnectionState::Disconnected);
        assert_eq!(rx.await.unwrap(), Err(AbortReason::ConnectionClosed));
        assert!(mgr.active_settings().is_none());
    }

    #[tokio::test]
    async fn replaced_settings_apply_to_next_connect() {
        let link = ScriptedLink::new();
        let mgr = manager(&link);
        mgr.connect().await.unwrap();

        mgr.replace_settings(ClientSettings::new("10.1.2.3", 1502).with_unit_id(9));
        assert_eq!(mgr.active_settings().unwrap().port, 502);

        mgr.disconnect().await;
        mgr.connect().await.unwrap();
        assert_eq!(link.last_target(), Some(("10.1.2.3".to_string(), 1502)));
        assert_eq!(mgr.active_settings().unwrap().unit_id, 9);
    }

    #[tokio::test]
    async fn shutdown_cancels_and_blocks_reconnect() {
        let link = ScriptedLink::new();
        let mgr = manager(&link);
        mgr.connect().await.unwrap();

        let (tx, rx) = oneshot::channel();
        mgr.registry().register(8, tx).unwrap();

        mgr.shutdown().await;
        assert_eq!(rx.await.unwrap(), Err(AbortReason::Cancelled));
        assert!(mgr.is_shut_down());
        assert!(matches!(mgr.connect().await, Err(ClientError::Cancelled)));
    }
}
