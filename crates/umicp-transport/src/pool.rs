//! Bounded connection pool with staleness and idle eviction.
//!
//! The pool is generic over a [`Connector`], the seam that knows how to
//! open and close one connection. [`ChannelConnector`] plugs in real
//! [`TransportChannel`]s; tests plug in cheap fakes.
//!
//! Validation is deliberately split: acquire and release check only age
//! against `max_age`, while [`ConnectionPool::cleanup`] additionally
//! evicts connections idle past `idle_timeout`.

use std::collections::{HashMap, VecDeque};
use std::ops::Deref;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use umicp_core::{UmicpError, UmicpResult};
use uuid::Uuid;

use crate::channel::TransportChannel;
use crate::config::{ChannelConfig, PoolConfig};
use crate::sync::locked;

/// Interval between capacity rechecks while waiting at `max_size`. A
/// release wakes waiters early; this bounds the wait when a wakeup is
/// missed and paces retries after a failed create.
const ACQUIRE_TICK: Duration = Duration::from_millis(100);

/// Opens and closes the connections a [`ConnectionPool`] manages.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// The pooled resource.
    type Connection: Send + Sync + 'static;

    /// Open one connection to the given address.
    async fn connect(&self, address: &str) -> UmicpResult<Self::Connection>;

    /// Close one connection. Failures are swallowed; the pool has already
    /// dropped the entry.
    async fn close(&self, connection: &Self::Connection);
}

/// [`Connector`] producing connected [`TransportChannel`]s.
pub struct ChannelConnector {
    config: ChannelConfig,
}

impl ChannelConnector {
    /// Connector using the given channel settings as a template; the
    /// pool's address overrides the configured url per connection.
    /// Reconnection is disabled so the pool, not the channel, decides
    /// when a dead connection is replaced.
    pub fn new(config: ChannelConfig) -> Self {
        let config = ChannelConfig {
            auto_reconnect: false,
            ..config
        };
        Self { config }
    }
}

impl Default for ChannelConnector {
    fn default() -> Self {
        Self::new(ChannelConfig::default())
    }
}

#[async_trait]
impl Connector for ChannelConnector {
    type Connection = TransportChannel;

    async fn connect(&self, address: &str) -> UmicpResult<TransportChannel> {
        let config = ChannelConfig {
            url: address.to_string(),
            ..self.config.clone()
        };
        let channel = TransportChannel::new(config);
        channel.connect().await?;
        Ok(channel)
    }

    async fn close(&self, connection: &TransportChannel) {
        connection.disconnect();
    }
}

/// Lifecycle state of one tracked connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolConnectionState {
    /// Queued and ready to be acquired
    Available,
    /// Checked out by a caller
    InUse,
    /// Removed from tracking, close in progress
    Closed,
}

/// Handle to one acquired connection. Hand it back with
/// [`ConnectionPool::release`] when done.
#[derive(Debug)]
pub struct PooledConnection<C> {
    id: Uuid,
    connection: Arc<C>,
    address: String,
    created_at: Instant,
    use_count: u64,
}

impl<C> PooledConnection<C> {
    /// Pool-internal identifier.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Address the connection was opened against.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Age since the underlying connection was created.
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// How many times this connection has been acquired, this checkout
    /// included.
    pub fn use_count(&self) -> u64 {
        self.use_count
    }

    /// The underlying connection.
    pub fn connection(&self) -> &C {
        &self.connection
    }
}

impl<C> Clone for PooledConnection<C> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            connection: Arc::clone(&self.connection),
            address: self.address.clone(),
            created_at: self.created_at,
            use_count: self.use_count,
        }
    }
}

impl<C> Deref for PooledConnection<C> {
    type Target = C;

    fn deref(&self) -> &C {
        &self.connection
    }
}

/// Pool counters. Live values reflect the current registry; cumulative
/// ones survive [`ConnectionPool::shutdown`].
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Tracked connections
    pub total: usize,
    /// Connections queued as available
    pub available: usize,
    /// Connections checked out
    pub in_use: usize,
    /// Creates currently in flight
    pub pending_creates: usize,
    /// Whether the pool has been shut down
    pub closed: bool,
    /// Connections ever created
    pub total_created: u64,
    /// Connections ever closed or discarded
    pub total_closed: u64,
    /// Successful acquires
    pub total_acquired: u64,
    /// Connections handed back and requeued
    pub total_released: u64,
    /// Acquires that hit their deadline or found the pool closed
    pub failed_acquires: u64,
}

struct PoolEntry<C> {
    connection: Arc<C>,
    state: PoolConnectionState,
    created_at: Instant,
    last_used: Instant,
    use_count: u64,
}

impl<C> PoolEntry<C> {
    fn is_stale(&self, max_age: Duration) -> bool {
        self.created_at.elapsed() > max_age
    }

    fn is_idle(&self, idle_timeout: Duration) -> bool {
        self.last_used.elapsed() > idle_timeout
    }
}

struct PoolInner<C> {
    connections: HashMap<Uuid, PoolEntry<C>>,
    available: VecDeque<Uuid>,
    pending_creates: usize,
    closed: bool,
    total_created: u64,
    total_closed: u64,
    total_acquired: u64,
    total_released: u64,
    failed_acquires: u64,
}

struct PoolShared<N: Connector> {
    config: PoolConfig,
    connector: N,
    inner: Mutex<PoolInner<N::Connection>>,
    released: Notify,
}

/// Bounded pool of reusable connections with FIFO handout.
pub struct ConnectionPool<N: Connector> {
    shared: Arc<PoolShared<N>>,
}

impl<N: Connector> Clone for ConnectionPool<N> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<N: Connector> ConnectionPool<N> {
    /// Create an empty pool. Nothing connects until
    /// [`initialize`](Self::initialize) or the first acquire.
    pub fn new(config: PoolConfig, connector: N) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                config: config.clamped(),
                connector,
                inner: Mutex::new(PoolInner {
                    connections: HashMap::new(),
                    available: VecDeque::new(),
                    pending_creates: 0,
                    closed: false,
                    total_created: 0,
                    total_closed: 0,
                    total_acquired: 0,
                    total_released: 0,
                    failed_acquires: 0,
                }),
                released: Notify::new(),
            }),
        }
    }

    /// Eagerly create `min_size` available connections. A failed create
    /// is logged and skipped; the pool grows back on demand.
    pub async fn initialize(&self) -> UmicpResult<()> {
        for _ in 0..self.shared.config.min_size {
            let connection = match self
                .shared
                .connector
                .connect(&self.shared.config.address)
                .await
            {
                Ok(connection) => connection,
                Err(err) => {
                    warn!(error = %err, "eager pool connection failed");
                    continue;
                }
            };
            let mut inner = locked(&self.shared.inner);
            if inner.closed {
                drop(inner);
                self.shared.connector.close(&connection).await;
                return Err(UmicpError::pool_closed("pool closed during initialize"));
            }
            let id = Uuid::new_v4();
            let now = Instant::now();
            inner.connections.insert(
                id,
                PoolEntry {
                    connection: Arc::new(connection),
                    state: PoolConnectionState::Available,
                    created_at: now,
                    last_used: now,
                    use_count: 0,
                },
            );
            inner.available.push_back(id);
            inner.total_created += 1;
        }
        info!(
            address = %self.shared.config.address,
            size = self.shared.config.min_size,
            "pool initialized"
        );
        Ok(())
    }

    /// Check out one connection.
    ///
    /// Reuses the oldest available connection that passes the staleness
    /// check, creates a new one while under `max_size`, or waits for a
    /// release until the deadline. A missed deadline is `Ok(None)`; only
    /// a shut-down pool is an error.
    pub async fn acquire(
        &self,
        timeout: Option<Duration>,
    ) -> UmicpResult<Option<PooledConnection<N::Connection>>> {
        let deadline =
            tokio::time::Instant::now() + timeout.unwrap_or(self.shared.config.acquire_timeout);

        loop {
            enum Plan<C> {
                Ready(PooledConnection<C>),
                Discard(Arc<C>),
                Create,
                Wait,
            }

            let plan = {
                let mut inner = locked(&self.shared.inner);
                if inner.closed {
                    inner.failed_acquires += 1;
                    return Err(UmicpError::pool_closed("acquire on closed pool"));
                }

                if let Some(id) = inner.available.pop_front() {
                    let Some(entry) = inner.connections.get_mut(&id) else {
                        continue;
                    };
                    if entry.is_stale(self.shared.config.max_age) {
                        entry.state = PoolConnectionState::Closed;
                        let entry = inner
                            .connections
                            .remove(&id)
                            .map(|entry| entry.connection);
                        inner.total_closed += 1;
                        match entry {
                            Some(connection) => Plan::Discard(connection),
                            None => continue,
                        }
                    } else {
                        entry.state = PoolConnectionState::InUse;
                        entry.last_used = Instant::now();
                        entry.use_count += 1;
                        let handle = PooledConnection {
                            id,
                            connection: Arc::clone(&entry.connection),
                            address: self.shared.config.address.clone(),
                            created_at: entry.created_at,
                            use_count: entry.use_count,
                        };
                        inner.total_acquired += 1;
                        Plan::Ready(handle)
                    }
                } else if inner.connections.len() + inner.pending_creates
                    < self.shared.config.max_size
                {
                    inner.pending_creates += 1;
                    Plan::Create
                } else {
                    Plan::Wait
                }
            };

            match plan {
                Plan::Ready(handle) => return Ok(Some(handle)),
                Plan::Discard(connection) => {
                    debug!("stale connection discarded on acquire");
                    self.shared.connector.close(&connection).await;
                }
                Plan::Create => match self.create_in_use().await? {
                    Some(handle) => return Ok(Some(handle)),
                    None => {
                        if self.wait_for_capacity(deadline).await {
                            return self.timed_out();
                        }
                    }
                },
                Plan::Wait => {
                    if self.wait_for_capacity(deadline).await {
                        return self.timed_out();
                    }
                }
            }
        }
    }

    /// Hand a connection back. True only when the connection was
    /// requeued; a stale connection is discarded and reported false, as
    /// is a closed pool or an unknown handle.
    pub async fn release(&self, connection: &PooledConnection<N::Connection>) -> bool {
        enum Plan<C> {
            Requeued,
            Discard(Arc<C>),
            Rejected,
        }

        let plan = {
            let mut inner = locked(&self.shared.inner);
            if inner.closed || !inner.connections.contains_key(&connection.id) {
                Plan::Rejected
            } else {
                let stale = inner
                    .connections
                    .get(&connection.id)
                    .is_some_and(|entry| entry.is_stale(self.shared.config.max_age));
                if stale {
                    let removed = inner
                        .connections
                        .remove(&connection.id)
                        .map(|entry| entry.connection);
                    inner.total_closed += 1;
                    match removed {
                        Some(connection) => Plan::Discard(connection),
                        None => Plan::Rejected,
                    }
                } else if let Some(entry) = inner.connections.get_mut(&connection.id) {
                    entry.state = PoolConnectionState::Available;
                    entry.last_used = Instant::now();
                    inner.available.push_back(connection.id);
                    inner.total_released += 1;
                    Plan::Requeued
                } else {
                    Plan::Rejected
                }
            }
        };

        match plan {
            Plan::Requeued => {
                self.shared.released.notify_waiters();
                true
            }
            Plan::Discard(stale) => {
                debug!(id = %connection.id, "stale connection discarded on release");
                self.shared.connector.close(&stale).await;
                self.shared.released.notify_waiters();
                false
            }
            Plan::Rejected => false,
        }
    }

    /// Force-close and evict one connection regardless of its state.
    /// False on unknown id.
    pub async fn remove(&self, id: Uuid) -> bool {
        let removed = {
            let mut inner = locked(&self.shared.inner);
            let removed = inner.connections.remove(&id);
            if removed.is_some() {
                inner.available.retain(|queued| *queued != id);
                inner.total_closed += 1;
            }
            removed.map(|entry| entry.connection)
        };

        match removed {
            Some(connection) => {
                debug!(%id, "connection removed from pool");
                self.shared.connector.close(&connection).await;
                self.shared.released.notify_waiters();
                true
            }
            None => false,
        }
    }

    /// Evict available connections past `max_age` or `idle_timeout`,
    /// never shrinking below `min_size`. Returns the eviction count.
    pub async fn cleanup(&self) -> usize {
        let evicted = {
            let mut inner = locked(&self.shared.inner);
            let candidates: Vec<Uuid> = inner.available.iter().copied().collect();
            let mut evicted = Vec::new();
            for id in candidates {
                if inner.connections.len() <= self.shared.config.min_size {
                    break;
                }
                let expired = inner.connections.get(&id).is_some_and(|entry| {
                    entry.is_stale(self.shared.config.max_age)
                        || entry.is_idle(self.shared.config.idle_timeout)
                });
                if expired {
                    if let Some(entry) = inner.connections.remove(&id) {
                        inner.available.retain(|queued| *queued != id);
                        inner.total_closed += 1;
                        evicted.push(entry.connection);
                    }
                }
            }
            evicted
        };

        let count = evicted.len();
        for connection in evicted {
            self.shared.connector.close(&connection).await;
        }
        if count > 0 {
            debug!(count, "pool cleanup evicted connections");
            self.shared.released.notify_waiters();
        }
        count
    }

    /// Close every tracked connection and refuse further acquires.
    /// Cumulative counters survive; idempotent.
    pub async fn shutdown(&self) {
        let drained = {
            let mut inner = locked(&self.shared.inner);
            if inner.closed {
                return;
            }
            inner.closed = true;
            inner.available.clear();
            inner.total_closed += inner.connections.len() as u64;
            inner
                .connections
                .drain()
                .map(|(_, entry)| entry.connection)
                .collect::<Vec<_>>()
        };

        for connection in &drained {
            self.shared.connector.close(connection).await;
        }
        // Wake waiters so they observe the closed pool.
        self.shared.released.notify_waiters();
        info!(closed = drained.len(), "pool shut down");
    }

    /// Current counters.
    pub fn stats(&self) -> PoolStats {
        let inner = locked(&self.shared.inner);
        let in_use = inner
            .connections
            .values()
            .filter(|entry| entry.state == PoolConnectionState::InUse)
            .count();
        PoolStats {
            total: inner.connections.len(),
            available: inner.available.len(),
            in_use,
            pending_creates: inner.pending_creates,
            closed: inner.closed,
            total_created: inner.total_created,
            total_closed: inner.total_closed,
            total_acquired: inner.total_acquired,
            total_released: inner.total_released,
            failed_acquires: inner.failed_acquires,
        }
    }

    /// Pool configuration after clamping.
    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Whether [`shutdown`](Self::shutdown) has run.
    pub fn is_closed(&self) -> bool {
        locked(&self.shared.inner).closed
    }

    async fn create_in_use(&self) -> UmicpResult<Option<PooledConnection<N::Connection>>> {
        let created = self
            .shared
            .connector
            .connect(&self.shared.config.address)
            .await;

        match created {
            Ok(connection) => {
                let connection = Arc::new(connection);
                let handle = {
                    let mut inner = locked(&self.shared.inner);
                    inner.pending_creates -= 1;
                    if inner.closed {
                        None
                    } else {
                        let id = Uuid::new_v4();
                        let now = Instant::now();
                        inner.connections.insert(
                            id,
                            PoolEntry {
                                connection: Arc::clone(&connection),
                                state: PoolConnectionState::InUse,
                                created_at: now,
                                last_used: now,
                                use_count: 1,
                            },
                        );
                        inner.total_created += 1;
                        inner.total_acquired += 1;
                        Some(PooledConnection {
                            id,
                            connection: Arc::clone(&connection),
                            address: self.shared.config.address.clone(),
                            created_at: now,
                            use_count: 1,
                        })
                    }
                };
                match handle {
                    Some(handle) => Ok(Some(handle)),
                    None => {
                        self.shared.connector.close(&connection).await;
                        Err(UmicpError::pool_closed("pool closed during create"))
                    }
                }
            }
            Err(err) => {
                locked(&self.shared.inner).pending_creates -= 1;
                warn!(error = %err, "pool connection create failed");
                Ok(None)
            }
        }
    }

    /// Wait for a release or the next recheck tick. True when the
    /// deadline has passed.
    async fn wait_for_capacity(&self, deadline: tokio::time::Instant) -> bool {
        let now = tokio::time::Instant::now();
        if now >= deadline {
            return true;
        }
        let until = deadline.min(now + ACQUIRE_TICK);
        let _ = tokio::time::timeout_at(until, self.shared.released.notified()).await;
        tokio::time::Instant::now() >= deadline
    }

    fn timed_out(&self) -> UmicpResult<Option<PooledConnection<N::Connection>>> {
        locked(&self.shared.inner).failed_acquires += 1;
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

    use assert_matches::assert_matches;

    use super::*;

    #[derive(Default)]
    struct FakeConnector {
        created: AtomicU64,
        closed: AtomicU64,
        failing: AtomicBool,
    }

    #[async_trait]
    impl Connector for Arc<FakeConnector> {
        type Connection = u64;

        async fn connect(&self, _address: &str) -> UmicpResult<u64> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(UmicpError::connect_failed("fake connector down"));
            }
            Ok(self.created.fetch_add(1, Ordering::SeqCst))
        }

        async fn close(&self, _connection: &u64) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn pool(min: usize, max: usize) -> (ConnectionPool<Arc<FakeConnector>>, Arc<FakeConnector>) {
        let connector = Arc::new(FakeConnector::default());
        let config = PoolConfig::new("fake://pool").with_sizes(min, max);
        (ConnectionPool::new(config, Arc::clone(&connector)), connector)
    }

    #[tokio::test]
    async fn initialize_creates_min_size_available() {
        let (pool, connector) = pool(2, 5);
        pool.initialize().await.unwrap();

        let stats = pool.stats();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.available, 2);
        assert_eq!(stats.in_use, 0);
        assert_eq!(connector.created.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn initialize_skips_failed_creates() {
        let (pool, connector) = pool(2, 5);
        connector.failing.store(true, Ordering::SeqCst);

        pool.initialize().await.unwrap();
        assert_eq!(pool.stats().total, 0);
    }

    #[tokio::test]
    async fn acquire_reuses_then_grows_to_max() {
        let (pool, _) = pool(2, 5);
        pool.initialize().await.unwrap();

        let first = pool.acquire(None).await.unwrap().unwrap();
        let second = pool.acquire(None).await.unwrap().unwrap();
        let stats = pool.stats();
        assert_eq!(stats.in_use, 2);
        assert_eq!(stats.available, 0);
        assert_eq!(stats.total, 2);

        let third = pool.acquire(None).await.unwrap().unwrap();
        assert_eq!(pool.stats().total, 3);

        assert!(pool.release(&first).await);
        assert!(pool.release(&second).await);
        assert!(pool.release(&third).await);
        let stats = pool.stats();
        assert_eq!(stats.available, 3);
        assert_eq!(stats.total_released, 3);
    }

    #[tokio::test]
    async fn use_count_grows_across_checkouts() {
        let (pool, _) = pool(1, 1);
        pool.initialize().await.unwrap();

        let first = pool.acquire(None).await.unwrap().unwrap();
        assert_eq!(first.use_count(), 1);
        assert_eq!(first.address(), "fake://pool");
        assert!(pool.release(&first).await);

        let second = pool.acquire(None).await.unwrap().unwrap();
        assert_eq!(second.id(), first.id());
        assert_eq!(second.use_count(), 2);
    }

    #[tokio::test]
    async fn exhausted_pool_returns_none_after_deadline() {
        let (pool, _) = pool(0, 1);
        let held = pool.acquire(None).await.unwrap().unwrap();

        let start = Instant::now();
        let second = pool
            .acquire(Some(Duration::from_millis(50)))
            .await
            .unwrap();
        let elapsed = start.elapsed();

        assert!(second.is_none());
        assert!(elapsed >= Duration::from_millis(50));
        assert!(elapsed < Duration::from_millis(200));
        assert_eq!(pool.stats().failed_acquires, 1);
        drop(held);
    }

    #[tokio::test]
    async fn waiter_wakes_on_release() {
        let (pool, _) = pool(0, 1);
        let held = pool.acquire(None).await.unwrap().unwrap();

        let waiter = pool.clone();
        let task = tokio::spawn(async move {
            waiter.acquire(Some(Duration::from_secs(2))).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(pool.release(&held).await);

        let reacquired = task.await.unwrap().unwrap();
        assert!(reacquired.is_some());
    }

    #[tokio::test]
    async fn stale_connection_is_discarded_on_acquire() {
        let connector = Arc::new(FakeConnector::default());
        let config = PoolConfig {
            max_age: Duration::from_millis(10),
            ..PoolConfig::new("fake://pool").with_sizes(1, 2)
        };
        let pool = ConnectionPool::new(config, Arc::clone(&connector));
        pool.initialize().await.unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        let fresh = pool.acquire(None).await.unwrap().unwrap();

        // The seeded connection aged out; the handle is a replacement.
        assert_eq!(connector.closed.load(Ordering::SeqCst), 1);
        assert_eq!(connector.created.load(Ordering::SeqCst), 2);
        assert_eq!(pool.stats().total, 1);
        drop(fresh);
    }

    #[tokio::test]
    async fn stale_connection_is_discarded_on_release() {
        let connector = Arc::new(FakeConnector::default());
        let config = PoolConfig {
            max_age: Duration::from_millis(10),
            ..PoolConfig::new("fake://pool").with_sizes(0, 2)
        };
        let pool = ConnectionPool::new(config, Arc::clone(&connector));

        let held = pool.acquire(None).await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        // The discard is reported, not hidden behind a successful release.
        assert!(!pool.release(&held).await);

        let stats = pool.stats();
        assert_eq!(stats.total, 0);
        assert_eq!(stats.total_released, 0);
        assert_eq!(connector.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cleanup_never_shrinks_below_min_size() {
        let connector = Arc::new(FakeConnector::default());
        let config = PoolConfig {
            idle_timeout: Duration::from_millis(10),
            ..PoolConfig::new("fake://pool").with_sizes(2, 5)
        };
        let pool = ConnectionPool::new(config, Arc::clone(&connector));
        pool.initialize().await.unwrap();

        let a = pool.acquire(None).await.unwrap().unwrap();
        let b = pool.acquire(None).await.unwrap().unwrap();
        let c = pool.acquire(None).await.unwrap().unwrap();
        pool.release(&a).await;
        pool.release(&b).await;
        pool.release(&c).await;
        assert_eq!(pool.stats().total, 3);

        tokio::time::sleep(Duration::from_millis(20)).await;
        let evicted = pool.cleanup().await;

        assert_eq!(evicted, 1);
        assert_eq!(pool.stats().total, 2);
    }

    #[tokio::test]
    async fn create_failure_retries_until_deadline() {
        let (pool, connector) = pool(0, 2);
        connector.failing.store(true, Ordering::SeqCst);

        let start = Instant::now();
        let acquired = pool
            .acquire(Some(Duration::from_millis(120)))
            .await
            .unwrap();

        assert!(acquired.is_none());
        assert!(start.elapsed() >= Duration::from_millis(120));
        assert_eq!(pool.stats().total, 0);
        assert_eq!(pool.stats().pending_creates, 0);
    }

    #[tokio::test]
    async fn shutdown_preserves_cumulative_counters() {
        let (pool, connector) = pool(2, 5);
        pool.initialize().await.unwrap();
        let held = pool.acquire(None).await.unwrap().unwrap();

        pool.shutdown().await;

        let stats = pool.stats();
        assert!(stats.closed);
        assert_eq!(stats.total, 0);
        assert_eq!(stats.available, 0);
        assert_eq!(stats.total_created, 2);
        assert_eq!(stats.total_closed, 2);
        assert_eq!(stats.total_acquired, 1);
        assert_eq!(connector.closed.load(Ordering::SeqCst), 2);

        assert_matches!(pool.acquire(None).await, Err(UmicpError::PoolClosed { .. }));
        assert_eq!(pool.stats().failed_acquires, 1);
        assert!(!pool.release(&held).await);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn remove_evicts_regardless_of_state() {
        let (pool, connector) = pool(1, 2);
        pool.initialize().await.unwrap();
        let held = pool.acquire(None).await.unwrap().unwrap();

        assert!(pool.remove(held.id()).await);
        assert!(!pool.remove(held.id()).await);
        assert_eq!(pool.stats().total, 0);
        assert_eq!(connector.closed.load(Ordering::SeqCst), 1);
    }
}
