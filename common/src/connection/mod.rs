// Connection manager: one tunnel and one store client per target
//
// Connections are built lazily through a single-flight slot per target. A
// watcher task follows each link's close signal and moves the slot to
// `Closed`; the next `acquire` rebuilds it.

pub mod single_flight;
pub mod tunnel;

pub use single_flight::{ConnectionState, SingleFlight};
pub use tunnel::SshTunnel;

use crate::config::{TargetConfig, TargetsConfig};
use crate::errors::{ConnectionError, StoreError};
use crate::models::ConnectionTarget;
use crate::retry::CappedBackoff;
use crate::store::{KeyInspector, StoreClient};
use crate::telemetry;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{watch, Mutex};
use tracing::{error, info, instrument, warn};

/// What the manager tracks about a built connection
pub trait Link: Send + Sync + 'static {
    fn generation(&self) -> u64;

    fn established_at(&self) -> DateTime<Utc>;

    fn local_endpoint(&self) -> Option<SocketAddr>;

    /// Signal that flips to `true` when the link goes away underneath us
    fn close_signal(&self) -> Option<watch::Receiver<bool>>;

    fn is_open(&self) -> bool;
}

/// Builds the link for one target under a given generation
#[async_trait]
pub trait Opener<L>: Send + Sync + 'static {
    async fn open(
        &self,
        target: ConnectionTarget,
        config: &TargetConfig,
        generation: u64,
    ) -> Result<L, ConnectionError>;
}

/// A live channel to the store for one target
pub struct Connection {
    target: ConnectionTarget,
    generation: u64,
    tunnel: Option<SshTunnel>,
    store: StoreClient,
    established_at: DateTime<Utc>,
}

impl Connection {
    pub fn target(&self) -> ConnectionTarget {
        self.target
    }

    /// Build counter value this connection was created under
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn store(&self) -> &StoreClient {
        &self.store
    }

    pub fn established_at(&self) -> DateTime<Utc> {
        self.established_at
    }

    /// Loopback endpoint of the tunnel, when there is one
    pub fn local_endpoint(&self) -> Option<SocketAddr> {
        self.tunnel.as_ref().map(SshTunnel::local_addr)
    }

    /// False once the tunnel underneath has closed
    pub fn is_open(&self) -> bool {
        self.tunnel.as_ref().map_or(true, |tunnel| !tunnel.is_closed())
    }
}

impl Link for Connection {
    fn generation(&self) -> u64 {
        self.generation
    }

    fn established_at(&self) -> DateTime<Utc> {
        self.established_at
    }

    fn local_endpoint(&self) -> Option<SocketAddr> {
        Connection::local_endpoint(self)
    }

    fn close_signal(&self) -> Option<watch::Receiver<bool>> {
        self.tunnel.as_ref().map(SshTunnel::closed)
    }

    fn is_open(&self) -> bool {
        Connection::is_open(self)
    }
}

/// Opens the SSH tunnel when the target has one, then the store client
pub struct TunnelOpener;

#[async_trait]
impl Opener<Connection> for TunnelOpener {
    async fn open(
        &self,
        target: ConnectionTarget,
        config: &TargetConfig,
        generation: u64,
    ) -> Result<Connection, ConnectionError> {
        let store_config = &config.store;
        let retry = CappedBackoff::with_config(
            store_config.retry_step_ms,
            store_config.retry_max_ms,
            store_config.retry_jitter,
            store_config.max_connect_attempts,
        );

        let (tunnel, store) = match &config.tunnel {
            Some(tunnel_config) => {
                let tunnel = SshTunnel::open(tunnel_config).await?;
                let local = tunnel.local_addr();
                let store = match StoreClient::connect(
                    &local.ip().to_string(),
                    local.port(),
                    store_config.db,
                    &retry,
                )
                .await
                {
                    Ok(store) => store,
                    Err(e) => {
                        tunnel.shutdown().await;
                        return Err(e);
                    }
                };
                (Some(tunnel), store)
            }
            None => {
                let store =
                    StoreClient::connect(&store_config.host, store_config.port, store_config.db, &retry)
                        .await?;
                (None, store)
            }
        };

        info!(target = %target, generation, store = %store.endpoint(), "Store client attached");

        Ok(Connection {
            target,
            generation,
            tunnel,
            store,
            established_at: Utc::now(),
        })
    }
}

/// Snapshot of one target's connection
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    pub target: ConnectionTarget,
    pub state: ConnectionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub established_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_failure: Option<String>,
}

struct Inner<L> {
    targets: TargetsConfig,
    opener: Arc<dyn Opener<L>>,
    slots: SingleFlight<ConnectionTarget, L, ConnectionError>,
    generation: AtomicU64,
    failures: Mutex<HashMap<ConnectionTarget, String>>,
}

impl<L: Link> Inner<L> {
    async fn link_closed(&self, target: ConnectionTarget, generation: u64) {
        let closed = self
            .slots
            .invalidate_if(&target, |link| link.generation() == generation)
            .await;
        if closed {
            warn!(target = %target, generation, "Connection closed; will reconnect on next use");
            telemetry::record_connection_transition(target.as_str(), "closed");
        }
    }

    async fn record_failure(&self, target: ConnectionTarget, error: &ConnectionError) {
        self.failures.lock().await.insert(target, error.to_string());
    }

    async fn clear_failure(&self, target: ConnectionTarget) {
        self.failures.lock().await.remove(&target);
    }
}

/// Process-wide owner of the per-target connections. Cheap to clone.
pub struct ConnectionManager<L = Connection> {
    inner: Arc<Inner<L>>,
}

impl<L> Clone for ConnectionManager<L> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl ConnectionManager<Connection> {
    pub fn new(targets: TargetsConfig) -> Self {
        Self::with_opener(targets, Arc::new(TunnelOpener))
    }
}

impl<L: Link> ConnectionManager<L> {
    pub fn with_opener(targets: TargetsConfig, opener: Arc<dyn Opener<L>>) -> Self {
        Self {
            inner: Arc::new(Inner {
                targets,
                opener,
                slots: SingleFlight::new(),
                generation: AtomicU64::new(0),
                failures: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Ready connection for `target`, building it on first use.
    ///
    /// A connection whose tunnel closed before the watcher caught up is
    /// discarded and rebuilt once.
    #[instrument(skip(self), fields(target = %target))]
    pub async fn acquire(&self, target: ConnectionTarget) -> Result<Arc<L>, ConnectionError> {
        let link = self.connect(target).await?;
        if link.is_open() {
            return Ok(link);
        }

        self.inner.link_closed(target, link.generation()).await;
        info!(target = %target, "Connection reconnecting");
        telemetry::record_connection_transition(target.as_str(), "reconnecting");

        let link = self.connect(target).await?;
        if link.is_open() {
            Ok(link)
        } else {
            Err(ConnectionError::TunnelClosed(format!(
                "tunnel for {} closed right after it was opened",
                target
            )))
        }
    }

    async fn connect(&self, target: ConnectionTarget) -> Result<Arc<L>, ConnectionError> {
        let inner = Arc::downgrade(&self.inner);
        let opener = self.inner.opener.clone();
        let config = self.inner.targets.get(target).clone();
        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed) + 1;

        self.inner
            .slots
            .get_or_init(target, move || establish(inner, opener, target, config, generation))
            .await
    }

    /// Lifecycle snapshot of every target
    pub async fn status(&self) -> Vec<ConnectionStatus> {
        let mut statuses = Vec::with_capacity(ConnectionTarget::ALL.len());
        for target in ConnectionTarget::ALL {
            let state = self.inner.slots.state(&target).await;
            let link = self.inner.slots.peek(&target).await;
            let last_failure = self.inner.failures.lock().await.get(&target).cloned();

            statuses.push(ConnectionStatus {
                target,
                state,
                generation: link.as_ref().map(|l| l.generation()),
                local_endpoint: link
                    .as_ref()
                    .and_then(|l| l.local_endpoint())
                    .map(|addr| addr.to_string()),
                established_at: link.as_ref().map(|l| l.established_at()),
                last_failure,
            });
        }
        statuses
    }
}

/// Build one link and start following its close signal
async fn establish<L: Link>(
    inner: Weak<Inner<L>>,
    opener: Arc<dyn Opener<L>>,
    target: ConnectionTarget,
    config: TargetConfig,
    generation: u64,
) -> Result<L, ConnectionError> {
    info!(target = %target, generation, "Connection connecting");
    telemetry::record_connection_transition(target.as_str(), "connecting");

    let result = opener.open(target, &config, generation).await;

    let Some(manager) = inner.upgrade() else {
        return result;
    };

    match &result {
        Ok(link) => {
            manager.clear_failure(target).await;
            if let Some(closed) = link.close_signal() {
                watch_close(Arc::downgrade(&manager), target, generation, closed);
            }
            info!(
                target = %target,
                generation,
                local_endpoint = ?link.local_endpoint(),
                "Connection ready"
            );
            telemetry::record_connection_transition(target.as_str(), "ready");
        }
        Err(e) => {
            error!(target = %target, generation, error = %e, "Connection error");
            telemetry::record_connection_transition(target.as_str(), "error");
            manager.record_failure(target, e).await;
        }
    }

    result
}

/// Follow a close signal and retire the link when it fires
fn watch_close<L: Link>(
    inner: Weak<Inner<L>>,
    target: ConnectionTarget,
    generation: u64,
    mut closed: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        while !*closed.borrow_and_update() {
            if closed.changed().await.is_err() {
                break;
            }
        }
        if let Some(inner) = inner.upgrade() {
            inner.link_closed(target, generation).await;
        }
    });
}

#[async_trait]
impl KeyInspector for ConnectionManager<Connection> {
    #[instrument(skip(self), fields(target = %target))]
    async fn inspect(
        &self,
        target: ConnectionTarget,
        pattern: &str,
    ) -> Result<BTreeMap<String, Value>, StoreError> {
        let connection = self.acquire(target).await?;
        connection.store().scan_json(pattern).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct FakeLink {
        generation: u64,
        established_at: DateTime<Utc>,
        closed: Option<watch::Receiver<bool>>,
    }

    impl Link for FakeLink {
        fn generation(&self) -> u64 {
            self.generation
        }

        fn established_at(&self) -> DateTime<Utc> {
            self.established_at
        }

        fn local_endpoint(&self) -> Option<SocketAddr> {
            None
        }

        fn close_signal(&self) -> Option<watch::Receiver<bool>> {
            self.closed.clone()
        }

        fn is_open(&self) -> bool {
            self.closed.as_ref().map_or(false, |closed| !*closed.borrow())
        }
    }

    /// Hands out links whose close signal the test controls. The first
    /// `dead_on_arrival` links come back already closed and unwatched.
    struct FakeOpener {
        opened: AtomicUsize,
        dead_on_arrival: usize,
        signals: std::sync::Mutex<Vec<watch::Sender<bool>>>,
    }

    impl FakeOpener {
        fn new(dead_on_arrival: usize) -> Arc<Self> {
            Arc::new(Self {
                opened: AtomicUsize::new(0),
                dead_on_arrival,
                signals: std::sync::Mutex::new(Vec::new()),
            })
        }

        fn opened(&self) -> usize {
            self.opened.load(Ordering::SeqCst)
        }

        fn close_latest(&self) {
            let signals = self.signals.lock().unwrap();
            signals.last().unwrap().send(true).unwrap();
        }
    }

    #[async_trait]
    impl Opener<FakeLink> for FakeOpener {
        async fn open(
            &self,
            _target: ConnectionTarget,
            _config: &TargetConfig,
            generation: u64,
        ) -> Result<FakeLink, ConnectionError> {
            let count = self.opened.fetch_add(1, Ordering::SeqCst) + 1;
            let closed = if count <= self.dead_on_arrival {
                None
            } else {
                let (tx, rx) = watch::channel(false);
                self.signals.lock().unwrap().push(tx);
                Some(rx)
            };
            Ok(FakeLink {
                generation,
                established_at: Utc::now(),
                closed,
            })
        }
    }

    fn fake_manager(opener: &Arc<FakeOpener>) -> ConnectionManager<FakeLink> {
        let opener: Arc<dyn Opener<FakeLink>> = opener.clone();
        ConnectionManager::with_opener(Settings::default().targets, opener)
    }

    async fn dev_status<L: Link>(manager: &ConnectionManager<L>) -> ConnectionStatus {
        manager
            .status()
            .await
            .into_iter()
            .find(|s| s.target == ConnectionTarget::Dev)
            .unwrap()
    }

    fn unreachable_targets() -> TargetsConfig {
        let mut targets = Settings::default().targets;
        targets.dev.store.host = "127.0.0.1".to_string();
        targets.dev.store.port = 1;
        targets.dev.store.retry_step_ms = 1;
        targets.dev.store.retry_max_ms = 1;
        targets.dev.store.max_connect_attempts = 1;
        targets
    }

    #[tokio::test]
    async fn test_status_starts_absent() {
        let manager = ConnectionManager::new(Settings::default().targets);
        let statuses = manager.status().await;

        assert_eq!(statuses.len(), 2);
        assert!(statuses.iter().all(|s| s.state == ConnectionState::Absent));
        assert!(statuses.iter().all(|s| s.last_failure.is_none()));
    }

    #[tokio::test]
    async fn test_failed_acquire_is_recorded_and_retried() {
        let manager = ConnectionManager::new(unreachable_targets());

        let err = manager.acquire(ConnectionTarget::Dev).await.err().unwrap();
        assert!(matches!(err, ConnectionError::StoreConnectFailed { attempts: 1, .. }));

        let status = manager
            .status()
            .await
            .into_iter()
            .find(|s| s.target == ConnectionTarget::Dev)
            .unwrap();
        assert_eq!(status.state, ConnectionState::Absent);
        assert!(status.last_failure.is_some());

        // Not cached: the next call makes a fresh attempt and fails the same way
        let err = manager.acquire(ConnectionTarget::Dev).await.err().unwrap();
        assert!(matches!(err, ConnectionError::StoreConnectFailed { .. }));
    }

    #[tokio::test]
    async fn test_concurrent_failed_acquires_share_one_error() {
        let manager = ConnectionManager::new(unreachable_targets());

        let (a, b) = tokio::join!(
            manager.acquire(ConnectionTarget::Dev),
            manager.acquire(ConnectionTarget::Dev)
        );
        assert_eq!(a.err(), b.err());
    }

    #[tokio::test]
    async fn test_inspect_surfaces_connection_failure() {
        let manager = ConnectionManager::new(unreachable_targets());
        let result = manager.inspect(ConnectionTarget::Dev, "*").await;
        assert!(matches!(result, Err(StoreError::Connection(_))));
    }

    #[tokio::test]
    async fn test_closed_link_is_rebuilt_on_next_acquire() {
        let opener = FakeOpener::new(0);
        let manager = fake_manager(&opener);

        let first = manager.acquire(ConnectionTarget::Dev).await.unwrap();
        let again = manager.acquire(ConnectionTarget::Dev).await.unwrap();
        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(opener.opened(), 1);
        assert_eq!(dev_status(&manager).await.state, ConnectionState::Ready);

        opener.close_latest();
        tokio::time::timeout(Duration::from_secs(1), async {
            while dev_status(&manager).await.state != ConnectionState::Closed {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("watcher never retired the closed link");
        assert_eq!(dev_status(&manager).await.generation, None);

        let (a, b) = tokio::join!(
            manager.acquire(ConnectionTarget::Dev),
            manager.acquire(ConnectionTarget::Dev)
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        assert!(Arc::ptr_eq(&a, &b));
        assert!(a.generation() > first.generation());
        assert!(a.is_open());
        assert_eq!(opener.opened(), 2);

        let status = dev_status(&manager).await;
        assert_eq!(status.state, ConnectionState::Ready);
        assert_eq!(status.generation, Some(a.generation()));
    }

    #[tokio::test]
    async fn test_link_closed_on_arrival_is_rebuilt_once() {
        let opener = FakeOpener::new(1);
        let manager = fake_manager(&opener);

        let link = manager.acquire(ConnectionTarget::Dev).await.unwrap();
        assert!(link.is_open());
        assert_eq!(opener.opened(), 2);
        assert_eq!(dev_status(&manager).await.state, ConnectionState::Ready);
    }

    #[tokio::test]
    async fn test_rebuild_gives_up_when_fresh_link_is_closed() {
        let opener = FakeOpener::new(usize::MAX);
        let manager = fake_manager(&opener);

        let err = manager.acquire(ConnectionTarget::Dev).await.err().unwrap();
        assert!(matches!(err, ConnectionError::TunnelClosed(_)));
        assert_eq!(opener.opened(), 2);
    }

    #[tokio::test]
    #[ignore] // Requires Redis to be running on localhost:6379
    async fn test_dev_connection_is_reused() {
        let mut targets = Settings::default().targets;
        targets.dev.store.port = 6379;
        let manager = ConnectionManager::new(targets);

        let first = manager.acquire(ConnectionTarget::Dev).await.unwrap();
        let second = manager.acquire(ConnectionTarget::Dev).await.unwrap();
        assert_eq!(first.generation(), second.generation());
        assert!(first.local_endpoint().is_none());
        first.store().health_check().await.unwrap();
    }
}
