//! Endpoint-keyed pooling of upgraded connections.
//!
//! A [`Pool`] groups connections by a logical endpoint key (usually the route path).
//! Each endpoint tracks its checked-out (active) and checked-in (idle) connections and
//! never holds more than [`PoolConfig::max_connections_per_endpoint`] of them, handshakes
//! in flight included.
//!
//! # Locking
//! - The endpoint map sits behind a reader/writer lock. Lookups take the read lock; only
//!   the first request for a new endpoint takes the write lock.
//! - Each endpoint's active/idle sets sit behind their own mutex. No lock is ever held
//!   across an `.await`.
//! - Aggregate counters are atomics, so [`Pool::stats`] never blocks request handling.
//!
//! A background task started by [`Pool::new`] runs [`Pool::sweep`] every
//! [`PoolConfig::health_check_interval`] until [`Pool::shutdown`] is called or the pool
//! is dropped.
use std::{
    collections::{HashMap, VecDeque},
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    task::JoinHandle,
    time::{self, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use crate::{handshake, Connection, Exchange, OpCode, Result, Upgrader, WebSocketError};

// ============================================================================
// Configuration
// ============================================================================

const DEFAULT_MAX_CONNECTIONS_PER_ENDPOINT: usize = 10;
const DEFAULT_MAX_IDLE_CONNECTIONS: usize = 5;
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(10);
const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_PING_TIMEOUT: Duration = Duration::from_secs(5);

/// Pool limits and timings.
///
/// A zero in any field stands for its default.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "json", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "json", serde(default))]
pub struct PoolConfig {
    /// Cap on active, idle and in-flight connections of one endpoint.
    ///
    /// Default: 10
    pub max_connections_per_endpoint: usize,

    /// Idle connections kept per endpoint; a connection put back beyond this is closed.
    ///
    /// Default: 5
    pub max_idle_connections: usize,

    /// Idle connections unused for longer than this are closed by the next sweep.
    ///
    /// Default: 30 seconds
    pub idle_timeout: Duration,

    /// Period of the background sweep.
    ///
    /// Default: 10 seconds
    pub health_check_interval: Duration,

    /// Deadline for the handshake of a new connection.
    ///
    /// Default: 10 seconds
    pub connection_timeout: Duration,

    /// Deadline for a health-check Ping to be written.
    ///
    /// Default: 5 seconds
    pub ping_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections_per_endpoint: DEFAULT_MAX_CONNECTIONS_PER_ENDPOINT,
            max_idle_connections: DEFAULT_MAX_IDLE_CONNECTIONS,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            health_check_interval: DEFAULT_HEALTH_CHECK_INTERVAL,
            connection_timeout: DEFAULT_CONNECTION_TIMEOUT,
            ping_timeout: DEFAULT_PING_TIMEOUT,
        }
    }
}

impl PoolConfig {
    pub fn with_max_connections_per_endpoint(self, max: usize) -> Self {
        Self {
            max_connections_per_endpoint: max,
            ..self
        }
    }

    pub fn with_max_idle_connections(self, max: usize) -> Self {
        Self {
            max_idle_connections: max,
            ..self
        }
    }

    pub fn with_idle_timeout(self, timeout: Duration) -> Self {
        Self {
            idle_timeout: timeout,
            ..self
        }
    }

    pub fn with_health_check_interval(self, interval: Duration) -> Self {
        Self {
            health_check_interval: interval,
            ..self
        }
    }

    pub fn with_connection_timeout(self, timeout: Duration) -> Self {
        Self {
            connection_timeout: timeout,
            ..self
        }
    }

    pub fn with_ping_timeout(self, timeout: Duration) -> Self {
        Self {
            ping_timeout: timeout,
            ..self
        }
    }

    /// Replaces zero values with their defaults.
    fn normalized(self) -> Self {
        fn or(value: usize, default: usize) -> usize {
            if value == 0 {
                default
            } else {
                value
            }
        }
        fn or_duration(value: Duration, default: Duration) -> Duration {
            if value.is_zero() {
                default
            } else {
                value
            }
        }

        Self {
            max_connections_per_endpoint: or(
                self.max_connections_per_endpoint,
                DEFAULT_MAX_CONNECTIONS_PER_ENDPOINT,
            ),
            max_idle_connections: or(self.max_idle_connections, DEFAULT_MAX_IDLE_CONNECTIONS),
            idle_timeout: or_duration(self.idle_timeout, DEFAULT_IDLE_TIMEOUT),
            health_check_interval: or_duration(
                self.health_check_interval,
                DEFAULT_HEALTH_CHECK_INTERVAL,
            ),
            connection_timeout: or_duration(self.connection_timeout, DEFAULT_CONNECTION_TIMEOUT),
            ping_timeout: or_duration(self.ping_timeout, DEFAULT_PING_TIMEOUT),
        }
    }
}

// ============================================================================
// Statistics
// ============================================================================

/// Live pool counters.
///
/// `total`, `active` and `idle` are gauges; everything else only grows.
#[derive(Debug, Default)]
pub struct PoolStats {
    total: AtomicI64,
    active: AtomicI64,
    idle: AtomicI64,
    failed: AtomicU64,
    created: AtomicU64,
    reused: AtomicU64,
    health_checks_failed: AtomicU64,
    destroyed: AtomicU64,
}

/// A point-in-time copy of [`PoolStats`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "json", derive(serde::Serialize, serde::Deserialize))]
pub struct PoolSnapshot {
    /// Connections currently tracked, active or idle.
    pub total: u64,
    pub active: u64,
    pub idle: u64,
    /// Handshakes that failed or timed out while creating a connection.
    pub failed: u64,
    pub created: u64,
    /// Times an idle connection was handed out again.
    pub reused: u64,
    pub health_checks_failed: u64,
    /// Connections closed by the pool, for any [`EvictReason`].
    pub destroyed: u64,
}

impl PoolStats {
    pub fn snapshot(&self) -> PoolSnapshot {
        let gauge = |value: &AtomicI64| u64::try_from(value.load(Ordering::Relaxed)).unwrap_or(0);
        PoolSnapshot {
            total: gauge(&self.total),
            active: gauge(&self.active),
            idle: gauge(&self.idle),
            failed: self.failed.load(Ordering::Relaxed),
            created: self.created.load(Ordering::Relaxed),
            reused: self.reused.load(Ordering::Relaxed),
            health_checks_failed: self.health_checks_failed.load(Ordering::Relaxed),
            destroyed: self.destroyed.load(Ordering::Relaxed),
        }
    }

    fn created(&self) {
        self.total.fetch_add(1, Ordering::Relaxed);
        self.active.fetch_add(1, Ordering::Relaxed);
        self.created.fetch_add(1, Ordering::Relaxed);
    }

    fn checked_out(&self) {
        self.idle.fetch_sub(1, Ordering::Relaxed);
        self.active.fetch_add(1, Ordering::Relaxed);
        self.reused.fetch_add(1, Ordering::Relaxed);
    }

    fn checked_in(&self) {
        self.active.fetch_sub(1, Ordering::Relaxed);
        self.idle.fetch_add(1, Ordering::Relaxed);
    }

    fn removed_active(&self) {
        self.active.fetch_sub(1, Ordering::Relaxed);
        self.total.fetch_sub(1, Ordering::Relaxed);
    }

    fn removed_idle(&self) {
        self.idle.fetch_sub(1, Ordering::Relaxed);
        self.total.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Occupancy of one endpoint.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EndpointSnapshot {
    pub active: usize,
    pub idle: usize,
    /// Handshakes in flight.
    pub pending: usize,
}

// ============================================================================
// Hooks
// ============================================================================

/// Why the pool closed a connection.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum EvictReason {
    /// Put back while the endpoint already held `max_idle_connections` idle ones.
    IdleCapacity,
    /// Idle for longer than `idle_timeout`.
    IdleTimeout,
    /// The health-check Ping could not be written.
    HealthCheckFailed,
    /// Removed through [`Pool::discard`].
    Discarded,
    /// Closed by [`Pool::shutdown`].
    Shutdown,
    /// Returned or found already closed.
    Closed,
}

impl fmt::Display for EvictReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            Self::IdleCapacity => "idle capacity reached",
            Self::IdleTimeout => "idle timeout",
            Self::HealthCheckFailed => "health check failed",
            Self::Discarded => "discarded",
            Self::Shutdown => "pool shutdown",
            Self::Closed => "connection closed",
        };
        f.write_str(reason)
    }
}

/// Called with the endpoint key and a connection the pool just created.
pub type CreatedHook<S> = Arc<dyn Fn(&str, &Connection<S>) + Send + Sync>;

/// Called with the endpoint key, a connection the pool just closed, and why.
pub type ClosedHook<S> = Arc<dyn Fn(&str, &Connection<S>, EvictReason) + Send + Sync>;

/// Lifecycle callbacks, run synchronously on the task that caused the event.
pub struct PoolHooks<S> {
    pub on_connection_created: Option<CreatedHook<S>>,
    pub on_connection_closed: Option<ClosedHook<S>>,
}

impl<S> PoolHooks<S> {
    pub fn on_created<F>(self, hook: F) -> Self
    where
        F: Fn(&str, &Connection<S>) + Send + Sync + 'static,
    {
        Self {
            on_connection_created: Some(Arc::new(hook)),
            ..self
        }
    }

    pub fn on_closed<F>(self, hook: F) -> Self
    where
        F: Fn(&str, &Connection<S>, EvictReason) + Send + Sync + 'static,
    {
        Self {
            on_connection_closed: Some(Arc::new(hook)),
            ..self
        }
    }
}

impl<S> Default for PoolHooks<S> {
    fn default() -> Self {
        Self {
            on_connection_created: None,
            on_connection_closed: None,
        }
    }
}

impl<S> Clone for PoolHooks<S> {
    fn clone(&self) -> Self {
        Self {
            on_connection_created: self.on_connection_created.clone(),
            on_connection_closed: self.on_connection_closed.clone(),
        }
    }
}

impl<S> fmt::Debug for PoolHooks<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolHooks")
            .field("on_connection_created", &self.on_connection_created.is_some())
            .field("on_connection_closed", &self.on_connection_closed.is_some())
            .finish()
    }
}

// ============================================================================
// Internal state
// ============================================================================

struct IdleEntry<S> {
    conn: Arc<Connection<S>>,
    last_access: Instant,
}

struct EndpointState<S> {
    active: HashMap<u64, Arc<Connection<S>>>,
    idle: VecDeque<IdleEntry<S>>,
    /// Slots reserved by handshakes in flight.
    pending: usize,
}

impl<S> EndpointState<S> {
    fn live(&self) -> usize {
        self.active.len() + self.idle.len() + self.pending
    }

    fn take_idle(&mut self, id: u64) -> Option<Arc<Connection<S>>> {
        let pos = self.idle.iter().position(|entry| entry.conn.id() == id)?;
        self.idle.remove(pos).map(|entry| entry.conn)
    }
}

struct Endpoint<S> {
    key: String,
    state: Mutex<EndpointState<S>>,
}

impl<S> Endpoint<S> {
    fn new(key: &str) -> Self {
        Self {
            key: key.to_owned(),
            state: Mutex::new(EndpointState {
                active: HashMap::new(),
                idle: VecDeque::new(),
                pending: 0,
            }),
        }
    }
}

enum Checkout<S> {
    Reused(Arc<Connection<S>>),
    Reserved,
    Exhausted,
}

/// A capacity slot held by a handshake in flight. Released on drop unless committed.
struct Reservation<'a, S> {
    endpoint: &'a Endpoint<S>,
    committed: bool,
}

impl<S> Drop for Reservation<'_, S> {
    fn drop(&mut self) {
        if !self.committed {
            let mut state = self.endpoint.state.lock();
            state.pending = state.pending.saturating_sub(1);
        }
    }
}

struct Shared<S> {
    config: PoolConfig,
    endpoints: RwLock<HashMap<String, Arc<Endpoint<S>>>>,
    stats: PoolStats,
    hooks: PoolHooks<S>,
    shutdown: AtomicBool,
    cancel: CancellationToken,
}

impl<S> Shared<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    fn endpoint(&self, key: &str) -> Arc<Endpoint<S>> {
        if let Some(endpoint) = self.endpoints.read().get(key) {
            return Arc::clone(endpoint);
        }
        let mut endpoints = self.endpoints.write();
        Arc::clone(
            endpoints
                .entry(key.to_owned())
                .or_insert_with(|| Arc::new(Endpoint::new(key))),
        )
    }

    fn endpoint_list(&self) -> Vec<Arc<Endpoint<S>>> {
        self.endpoints.read().values().cloned().collect()
    }

    /// Closes a connection that has already been taken out of every set and counted out.
    async fn destroy(&self, key: &str, conn: Arc<Connection<S>>, reason: EvictReason) {
        if let Err(_err) = conn.close().await {
            #[cfg(feature = "logging")]
            log::warn!("pool[{key}]: failed to close connection {}: {_err}", conn.id());
        }
        self.stats.destroyed.fetch_add(1, Ordering::Relaxed);

        #[cfg(feature = "logging")]
        log::debug!("pool[{key}]: connection {} closed ({reason})", conn.id());

        if let Some(hook) = &self.hooks.on_connection_closed {
            hook(key, &conn, reason);
        }
    }

    async fn sweep(&self) {
        for endpoint in self.endpoint_list() {
            if self.is_shutdown() {
                return;
            }
            self.sweep_endpoint(&endpoint).await;
        }
    }

    async fn sweep_endpoint(&self, endpoint: &Endpoint<S>) {
        let now = Instant::now();
        let idle_timeout = self.config.idle_timeout;

        let (expired, alive) = {
            let mut state = endpoint.state.lock();
            let mut expired = Vec::new();
            state.idle.retain(|entry| {
                let stale = entry.conn.is_closed()
                    || now.saturating_duration_since(entry.last_access) > idle_timeout;
                if stale {
                    expired.push(Arc::clone(&entry.conn));
                }
                !stale
            });
            let alive: Vec<_> = state
                .idle
                .iter()
                .map(|entry| Arc::clone(&entry.conn))
                .collect();
            (expired, alive)
        };

        for conn in expired {
            self.stats.removed_idle();
            let reason = if conn.is_closed() {
                EvictReason::Closed
            } else {
                EvictReason::IdleTimeout
            };
            self.destroy(&endpoint.key, conn, reason).await;
        }

        let payload = format!("ping-{}", unix_secs());
        let payload = payload.as_str();
        let deadline = Instant::now() + self.config.ping_timeout;
        let checks = alive.iter().map(|conn| async move {
            let result = conn.write_control(OpCode::Ping, payload, deadline).await;
            (conn, result)
        });

        for (conn, result) in join_all(checks).await {
            let Err(_err) = result else {
                continue;
            };
            self.stats.health_checks_failed.fetch_add(1, Ordering::Relaxed);

            #[cfg(feature = "logging")]
            log::warn!(
                "pool[{}]: health check failed for connection {}: {_err}",
                endpoint.key,
                conn.id()
            );

            // a connection checked out meanwhile is destroyed when it is put back
            let removed = endpoint.state.lock().take_idle(conn.id());
            if let Some(conn) = removed {
                self.stats.removed_idle();
                self.destroy(&endpoint.key, conn, EvictReason::HealthCheckFailed)
                    .await;
            }
        }
    }
}

fn unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}

// ============================================================================
// Pool
// ============================================================================

/// Pool of server connections keyed by endpoint.
///
/// Connections are handed out as `Arc<Connection<S>>`. A caller returns one with
/// [`put`](Self::put) once it is done with it, or removes it for good with
/// [`discard`](Self::discard).
pub struct Pool<S> {
    shared: Arc<Shared<S>>,
    maintenance: Mutex<Option<JoinHandle<()>>>,
}

impl<S> Pool<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    /// Creates a pool and starts its maintenance task.
    ///
    /// # Panics
    /// Must be called from within a tokio runtime.
    pub fn new(config: PoolConfig) -> Self {
        Self::with_hooks(config, PoolHooks::default())
    }

    /// Creates a pool that reports connection lifecycle events to `hooks`.
    pub fn with_hooks(config: PoolConfig, hooks: PoolHooks<S>) -> Self {
        let shared = Arc::new(Shared {
            config: config.normalized(),
            endpoints: RwLock::new(HashMap::new()),
            stats: PoolStats::default(),
            hooks,
            shutdown: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        });

        let maintenance = tokio::spawn(maintain(Arc::clone(&shared)));

        Self {
            shared,
            maintenance: Mutex::new(Some(maintenance)),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Current counters.
    pub fn stats(&self) -> PoolSnapshot {
        self.shared.stats.snapshot()
    }

    /// Occupancy of `endpoint`, or `None` if it was never used.
    pub fn endpoint_stats(&self, endpoint: &str) -> Option<EndpointSnapshot> {
        let endpoint = self.shared.endpoints.read().get(endpoint).cloned()?;
        let state = endpoint.state.lock();
        Some(EndpointSnapshot {
            active: state.active.len(),
            idle: state.idle.len(),
            pending: state.pending,
        })
    }

    /// Checks a connection out for `endpoint`.
    ///
    /// An idle connection is reused when there is one, in which case `exchange` is dropped
    /// without a response. Otherwise `exchange` is upgraded with `upgrader` under
    /// [`PoolConfig::connection_timeout`]. Dropping the returned future cancels the
    /// handshake and gives its slot back.
    ///
    /// # Errors
    /// - [`WebSocketError::PoolShutdown`] after [`shutdown`](Self::shutdown).
    /// - [`WebSocketError::PoolExhausted`] if the endpoint is at its cap. The exchange
    ///   is answered with `503 Service Unavailable`.
    /// - Any handshake error, or [`WebSocketError::Timeout`] if the handshake ran past
    ///   the deadline.
    pub async fn get<E>(
        &self,
        endpoint: &str,
        upgrader: &Upgrader,
        exchange: E,
    ) -> Result<Arc<Connection<S>>>
    where
        E: Exchange<Io = S>,
    {
        let shared = &*self.shared;
        if shared.is_shutdown() {
            return Err(refuse(exchange, WebSocketError::PoolShutdown).await);
        }

        let entry = shared.endpoint(endpoint);
        let mut stale = Vec::new();

        let checkout = {
            let mut state = entry.state.lock();
            let mut checkout = Checkout::Exhausted;
            while let Some(idle) = state.idle.pop_front() {
                if idle.conn.is_closed() {
                    stale.push(idle.conn);
                    continue;
                }
                state.active.insert(idle.conn.id(), Arc::clone(&idle.conn));
                checkout = Checkout::Reused(idle.conn);
                break;
            }
            if matches!(checkout, Checkout::Exhausted)
                && state.live() < shared.config.max_connections_per_endpoint
            {
                state.pending += 1;
                checkout = Checkout::Reserved;
            }
            checkout
        };

        for conn in stale {
            shared.stats.removed_idle();
            shared.destroy(endpoint, conn, EvictReason::Closed).await;
        }

        match checkout {
            Checkout::Reused(conn) => {
                shared.stats.checked_out();

                #[cfg(feature = "logging")]
                log::debug!("pool[{endpoint}]: reusing connection {}", conn.id());

                return Ok(conn);
            }
            Checkout::Exhausted => {
                #[cfg(feature = "logging")]
                log::debug!("pool[{endpoint}]: connection limit reached");

                let err = WebSocketError::PoolExhausted(endpoint.to_owned());
                return Err(refuse(exchange, err).await);
            }
            Checkout::Reserved => {}
        }

        let mut reservation = Reservation {
            endpoint: &*entry,
            committed: false,
        };

        let upgraded = time::timeout(shared.config.connection_timeout, upgrader.upgrade(exchange))
            .await
            .map_err(WebSocketError::from)
            .and_then(|result| result);

        let conn = match upgraded {
            Ok(conn) => Arc::new(conn),
            Err(err) => {
                shared.stats.failed.fetch_add(1, Ordering::Relaxed);

                #[cfg(feature = "logging")]
                log::debug!("pool[{endpoint}]: failed to create connection: {err}");

                return Err(err);
            }
        };

        let accepted = {
            let mut state = entry.state.lock();
            state.pending = state.pending.saturating_sub(1);
            reservation.committed = true;
            let accepted = !shared.is_shutdown();
            if accepted {
                state.active.insert(conn.id(), Arc::clone(&conn));
                shared.stats.created();
            }
            accepted
        };

        if !accepted {
            shared.stats.destroyed.fetch_add(1, Ordering::Relaxed);
            let _ = conn.close().await;
            return Err(WebSocketError::PoolShutdown);
        }

        #[cfg(feature = "logging")]
        log::debug!("pool[{endpoint}]: created connection {}", conn.id());

        if let Some(hook) = &shared.hooks.on_connection_created {
            hook(endpoint, &conn);
        }

        Ok(conn)
    }

    /// Checks a connection back in.
    ///
    /// The connection is closed instead of kept when it is already closed, when the
    /// endpoint holds [`PoolConfig::max_idle_connections`] idle connections, or when the
    /// pool is shutting down. A connection the pool does not track is just closed.
    pub async fn put(&self, conn: Arc<Connection<S>>) {
        let shared = &*self.shared;
        let id = conn.id();

        let mut outcome = None;
        for endpoint in shared.endpoint_list() {
            let mut state = endpoint.state.lock();
            let Some(tracked) = state.active.remove(&id) else {
                continue;
            };

            let reason = if tracked.is_closed() {
                Some(EvictReason::Closed)
            } else if shared.is_shutdown() {
                Some(EvictReason::Shutdown)
            } else if state.idle.len() >= shared.config.max_idle_connections {
                Some(EvictReason::IdleCapacity)
            } else {
                None
            };

            match reason {
                None => {
                    state.idle.push_back(IdleEntry {
                        conn: tracked,
                        last_access: Instant::now(),
                    });
                    shared.stats.checked_in();
                }
                Some(_) => shared.stats.removed_active(),
            }
            outcome = Some((endpoint.key.clone(), reason));
            break;
        }

        match outcome {
            Some((_key, None)) => {
                #[cfg(feature = "logging")]
                log::trace!("pool[{_key}]: connection {id} is idle");
            }
            Some((key, Some(reason))) => shared.destroy(&key, conn, reason).await,
            None => {
                #[cfg(feature = "logging")]
                log::debug!("pool: closing untracked connection {id}");

                let _ = conn.close().await;
            }
        }
    }

    /// Removes `conn` from the pool and closes it.
    pub async fn discard(&self, conn: Arc<Connection<S>>) {
        let shared = &*self.shared;
        let id = conn.id();

        let mut owner = None;
        for endpoint in shared.endpoint_list() {
            let mut state = endpoint.state.lock();
            if state.active.remove(&id).is_some() {
                shared.stats.removed_active();
            } else if state.take_idle(id).is_some() {
                shared.stats.removed_idle();
            } else {
                continue;
            }
            owner = Some(endpoint.key.clone());
            break;
        }

        match owner {
            Some(key) => shared.destroy(&key, conn, EvictReason::Discarded).await,
            None => {
                let _ = conn.close().await;
            }
        }
    }

    /// Runs one maintenance pass now: idle connections past the idle timeout are closed,
    /// the rest are pinged, and those whose Ping fails are closed as well.
    pub async fn sweep(&self) {
        self.shared.sweep().await;
    }

    /// Stops the maintenance task and closes every tracked connection, active and idle.
    ///
    /// Connections that fail to close are logged and skipped. Calling this again is a no-op.
    ///
    /// # Errors
    /// [`WebSocketError::Timeout`] if the connections could not all be closed within `grace`.
    /// They are no longer tracked either way.
    pub async fn shutdown(&self, grace: Duration) -> Result<()> {
        let shared = &*self.shared;
        if shared.shutdown.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let deadline = Instant::now() + grace;

        #[cfg(feature = "logging")]
        log::info!("pool: shutting down");

        shared.cancel.cancel();
        let maintenance = self.maintenance.lock().take();
        if let Some(handle) = maintenance {
            if time::timeout_at(deadline, handle).await.is_err() {
                #[cfg(feature = "logging")]
                log::warn!("pool: maintenance task did not stop in time");
            }
        }

        let drained: Vec<_> = shared.endpoints.write().drain().collect();
        let mut doomed = Vec::new();
        for (key, endpoint) in drained {
            let mut state = endpoint.state.lock();
            for (_, conn) in state.active.drain() {
                shared.stats.removed_active();
                doomed.push((key.clone(), conn));
            }
            for entry in state.idle.drain(..) {
                shared.stats.removed_idle();
                doomed.push((key.clone(), entry.conn));
            }
        }

        let closing = join_all(
            doomed
                .into_iter()
                .map(|(key, conn)| async move {
                    shared.destroy(&key, conn, EvictReason::Shutdown).await
                }),
        );
        if time::timeout_at(deadline, closing).await.is_err() {
            #[cfg(feature = "logging")]
            log::warn!("pool: connections still closing after the grace period");

            return Err(WebSocketError::Timeout);
        }

        #[cfg(feature = "logging")]
        log::info!("pool: shutdown complete");

        Ok(())
    }
}

impl<S> Drop for Pool<S> {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}

impl<S> fmt::Debug for Pool<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("config", &self.shared.config)
            .field("stats", &self.shared.stats.snapshot())
            .field("shutdown", &self.shared.shutdown.load(Ordering::Relaxed))
            .finish()
    }
}

/// Answers `exchange` with the status of `err` and hands `err` back.
async fn refuse<E: Exchange>(exchange: E, err: WebSocketError) -> WebSocketError {
    if let Some(response) = handshake::rejection(&err) {
        if let Err(_reject_err) = exchange.reject(response).await {
            #[cfg(feature = "logging")]
            log::debug!("pool: failed to deliver rejection: {_reject_err}");
        }
    }
    err
}

async fn maintain<S>(shared: Arc<Shared<S>>)
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let mut ticker = time::interval(shared.config.health_check_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // the first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        tokio::select! {
            _ = shared.cancel.cancelled() => break,
            _ = shared.sweep() => {}
        }
    }

    #[cfg(feature = "logging")]
    log::debug!("pool: maintenance task stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{HandshakeOptions, OriginPolicy, RawExchange};
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};

    const REQUEST: &str = "GET /chat HTTP/1.1\r\n\
        Host: localhost\r\n\
        Upgrade: websocket\r\n\
        Connection: Upgrade\r\n\
        Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
        Sec-WebSocket-Version: 13\r\n\r\n";

    async fn exchange() -> (RawExchange<DuplexStream>, DuplexStream) {
        let (mut client, server) = duplex(64 * 1024);
        client.write_all(REQUEST.as_bytes()).await.unwrap();
        (RawExchange::read(server).await.unwrap(), client)
    }

    fn upgrader() -> Upgrader {
        Upgrader::default()
            .with_handshake(HandshakeOptions::default().with_origin_policy(OriginPolicy::Any))
    }

    fn config() -> PoolConfig {
        PoolConfig::default().with_health_check_interval(Duration::from_secs(3600))
    }

    fn assert_within_cap(pool: &Pool<DuplexStream>, endpoint: &str) {
        let snapshot = pool.endpoint_stats(endpoint).unwrap();
        assert!(
            snapshot.active + snapshot.idle <= pool.config().max_connections_per_endpoint,
            "{snapshot:?}"
        );
    }

    mod config_tests {
        use super::*;

        #[test]
        fn test_zero_values_fall_back_to_defaults() {
            let config = PoolConfig::default()
                .with_max_connections_per_endpoint(0)
                .with_idle_timeout(Duration::ZERO)
                .with_max_idle_connections(2)
                .normalized();
            assert_eq!(config.max_connections_per_endpoint, 10);
            assert_eq!(config.idle_timeout, Duration::from_secs(30));
            assert_eq!(config.max_idle_connections, 2);
        }

        #[test]
        fn test_evict_reason_display() {
            assert_eq!(EvictReason::IdleTimeout.to_string(), "idle timeout");
        }
    }

    mod lifecycle_tests {
        use super::*;

        #[tokio::test]
        async fn test_idle_connection_is_reused() {
            let pool = Pool::new(config());
            let upgrader = upgrader();

            let (ex, _c1) = exchange().await;
            let conn = pool.get("/chat", &upgrader, ex).await.unwrap();
            let id = conn.id();
            pool.put(conn).await;
            assert_eq!(pool.stats().idle, 1);

            let (ex, _c2) = exchange().await;
            let again = pool.get("/chat", &upgrader, ex).await.unwrap();
            assert_eq!(again.id(), id);

            let stats = pool.stats();
            assert_eq!(stats.created, 1);
            assert_eq!(stats.reused, 1);
            assert_eq!(stats.active, 1);
            assert_eq!(stats.idle, 0);
        }

        #[tokio::test]
        async fn test_endpoint_cap() {
            let pool = Pool::new(config().with_max_connections_per_endpoint(2));
            let upgrader = upgrader();
            let mut clients = Vec::new();

            let mut conns = Vec::new();
            for _ in 0..2 {
                let (ex, client) = exchange().await;
                clients.push(client);
                conns.push(pool.get("/chat", &upgrader, ex).await.unwrap());
                assert_within_cap(&pool, "/chat");
            }

            let (ex, mut refused) = exchange().await;
            let err = pool.get("/chat", &upgrader, ex).await.unwrap_err();
            assert!(matches!(err, WebSocketError::PoolExhausted(ref key) if key == "/chat"));
            assert_eq!(err.kind(), crate::ErrorKind::Pool);

            let mut response = String::new();
            refused.read_to_string(&mut response).await.unwrap();
            assert!(response.starts_with("HTTP/1.1 503"), "{response}");
            assert!(response.contains("retry-after: 1"));

            // another endpoint has its own budget
            let (ex, _other) = exchange().await;
            pool.get("/feed", &upgrader, ex).await.unwrap();

            pool.put(conns.pop().unwrap()).await;
            assert_within_cap(&pool, "/chat");
            let (ex, _c) = exchange().await;
            pool.get("/chat", &upgrader, ex).await.unwrap();
            assert_within_cap(&pool, "/chat");
            assert_eq!(pool.stats().failed, 0);
        }

        #[tokio::test]
        async fn test_put_beyond_idle_capacity_destroys() {
            let pool = Pool::new(config().with_max_idle_connections(1));
            let upgrader = upgrader();

            let (ex, _c1) = exchange().await;
            let a = pool.get("/chat", &upgrader, ex).await.unwrap();
            let (ex, _c2) = exchange().await;
            let b = pool.get("/chat", &upgrader, ex).await.unwrap();

            pool.put(a).await;
            pool.put(Arc::clone(&b)).await;

            assert!(b.is_closed());
            let stats = pool.stats();
            assert_eq!(stats.idle, 1);
            assert_eq!(stats.active, 0);
            assert_eq!(stats.total, 1);
            assert_eq!(stats.destroyed, 1);
        }

        #[tokio::test]
        async fn test_closed_connection_is_not_kept() {
            let pool = Pool::new(config());
            let (ex, _c) = exchange().await;
            let conn = pool.get("/chat", &upgrader(), ex).await.unwrap();

            conn.close().await.unwrap();
            pool.put(conn).await;
            assert_eq!(pool.stats().idle, 0);
            assert_eq!(pool.stats().total, 0);
        }

        #[tokio::test]
        async fn test_discard() {
            let closed = Arc::new(AtomicU64::new(0));
            let counter = Arc::clone(&closed);
            let hooks = PoolHooks::default().on_closed(move |_, _, reason| {
                assert_eq!(reason, EvictReason::Discarded);
                counter.fetch_add(1, Ordering::Relaxed);
            });
            let pool = Pool::with_hooks(config(), hooks);

            let (ex, _c) = exchange().await;
            let conn = pool.get("/chat", &upgrader(), ex).await.unwrap();
            pool.discard(Arc::clone(&conn)).await;

            assert!(conn.is_closed());
            assert_eq!(closed.load(Ordering::Relaxed), 1);
            assert_eq!(pool.endpoint_stats("/chat"), Some(EndpointSnapshot::default()));
        }

        #[tokio::test]
        async fn test_failed_handshake_releases_slot() {
            let pool = Pool::new(config().with_max_connections_per_endpoint(1));

            let (mut client, server) = duplex(64 * 1024);
            client
                .write_all(b"GET /chat HTTP/1.1\r\nHost: localhost\r\n\r\n")
                .await
                .unwrap();
            let ex = RawExchange::read(server).await.unwrap();
            let err = pool.get("/chat", &upgrader(), ex).await.unwrap_err();
            assert!(matches!(err, WebSocketError::NotWebSocket));
            assert_eq!(pool.stats().failed, 1);
            assert_eq!(pool.endpoint_stats("/chat").unwrap().pending, 0);

            let (ex, _c) = exchange().await;
            pool.get("/chat", &upgrader(), ex).await.unwrap();
        }

        #[tokio::test]
        async fn test_created_hook() {
            let created = Arc::new(AtomicU64::new(0));
            let counter = Arc::clone(&created);
            let hooks = PoolHooks::default().on_created(move |endpoint, _| {
                assert_eq!(endpoint, "/chat");
                counter.fetch_add(1, Ordering::Relaxed);
            });
            let pool = Pool::with_hooks(config(), hooks);

            let (ex, _c) = exchange().await;
            let conn = pool.get("/chat", &upgrader(), ex).await.unwrap();
            pool.put(conn).await;
            let (ex, _c) = exchange().await;
            pool.get("/chat", &upgrader(), ex).await.unwrap();

            assert_eq!(created.load(Ordering::Relaxed), 1);
        }
    }

    mod sweep_tests {
        use super::*;

        #[tokio::test]
        async fn test_idle_timeout_eviction() {
            let pool = Pool::new(config().with_idle_timeout(Duration::from_millis(50)));
            let (ex, _c) = exchange().await;
            let conn = pool.get("/chat", &upgrader(), ex).await.unwrap();
            pool.put(Arc::clone(&conn)).await;

            tokio::time::sleep(Duration::from_millis(100)).await;
            pool.sweep().await;

            assert!(conn.is_closed());
            assert_eq!(pool.endpoint_stats("/chat").unwrap().idle, 0);
            assert_eq!(pool.stats().destroyed, 1);
            assert_eq!(pool.stats().health_checks_failed, 0);
        }

        #[tokio::test]
        async fn test_healthy_connection_is_pinged() {
            let pool = Pool::new(config());
            let (ex, mut client) = exchange().await;
            let conn = pool.get("/chat", &upgrader(), ex).await.unwrap();
            pool.put(conn).await;

            pool.sweep().await;
            assert_eq!(pool.stats().idle, 1);

            // skip the 101 response, then expect an unmasked ping frame
            let mut buf = vec![0u8; 1024];
            let mut seen = Vec::new();
            while !seen.windows(4).any(|w| w == b"ping") {
                let n = client.read(&mut buf).await.unwrap();
                assert!(n > 0);
                seen.extend_from_slice(&buf[..n]);
            }
            let head = seen.windows(4).position(|w| w == b"\r\n\r\n").unwrap() + 4;
            assert_eq!(seen[head], 0x89);
        }

        #[tokio::test]
        async fn test_failed_health_check_destroys() {
            let pool = Pool::new(config());
            let (ex, client) = exchange().await;
            let conn = pool.get("/chat", &upgrader(), ex).await.unwrap();
            pool.put(Arc::clone(&conn)).await;

            drop(client);
            pool.sweep().await;

            assert!(conn.is_closed());
            let stats = pool.stats();
            assert_eq!(stats.health_checks_failed, 1);
            assert_eq!(stats.idle, 0);
            assert_eq!(stats.total, 0);
            assert_eq!(stats.destroyed, 1);
        }
    }

    mod shutdown_tests {
        use super::*;

        #[tokio::test]
        async fn test_shutdown_twice() {
            let pool = Pool::new(config());
            let upgrader = upgrader();

            let (ex, _c1) = exchange().await;
            let active = pool.get("/chat", &upgrader, ex).await.unwrap();
            let (ex, _c2) = exchange().await;
            let idle = pool.get("/chat", &upgrader, ex).await.unwrap();
            pool.put(Arc::clone(&idle)).await;

            pool.shutdown(Duration::from_secs(1)).await.unwrap();
            pool.shutdown(Duration::from_secs(1)).await.unwrap();

            assert!(active.is_closed());
            assert!(idle.is_closed());
            let stats = pool.stats();
            assert_eq!(stats.total, 0);
            assert_eq!(stats.active, 0);
            assert_eq!(stats.idle, 0);
            assert_eq!(stats.created, 2);
            assert_eq!(stats.destroyed, 2);

            // returning a connection after shutdown closes it without counting it twice
            pool.put(active).await;
            assert_eq!(pool.stats().destroyed, 2);
        }

        #[tokio::test]
        async fn test_get_after_shutdown() {
            let pool = Pool::<DuplexStream>::new(config());
            pool.shutdown(Duration::from_secs(1)).await.unwrap();

            let (ex, mut client) = exchange().await;
            let err = pool.get("/chat", &upgrader(), ex).await.unwrap_err();
            assert!(matches!(err, WebSocketError::PoolShutdown));

            let mut response = String::new();
            client.read_to_string(&mut response).await.unwrap();
            assert!(response.starts_with("HTTP/1.1 503"));
        }

        #[tokio::test(start_paused = true)]
        async fn test_shutdown_grace_expires() {
            let pool = Pool::new(config());
            let (ex, _client) = exchange().await;
            let conn = pool.get("/chat", &upgrader(), ex).await.unwrap();

            // a write nobody drains keeps the writer busy, so the Close frame waits
            let stalled = tokio::spawn({
                let conn = Arc::clone(&conn);
                async move {
                    let _ = conn.write_message(OpCode::Binary, vec![0u8; 256 * 1024]).await;
                }
            });
            tokio::task::yield_now().await;

            let started = Instant::now();
            let err = pool.shutdown(Duration::from_millis(100)).await.unwrap_err();
            assert!(matches!(err, WebSocketError::Timeout));
            assert!(started.elapsed() < Duration::from_secs(1));

            let stats = pool.stats();
            assert_eq!(stats.total, 0);
            assert_eq!(stats.active, 0);
            assert!(pool.shutdown(Duration::from_millis(100)).await.is_ok());
            stalled.abort();
        }

        #[tokio::test(start_paused = true)]
        async fn test_background_sweep_runs() {
            let pool = Pool::new(
                PoolConfig::default()
                    .with_health_check_interval(Duration::from_secs(1))
                    .with_idle_timeout(Duration::from_millis(500)),
            );
            let (ex, _c) = exchange().await;
            let conn = pool.get("/chat", &upgrader(), ex).await.unwrap();
            pool.put(Arc::clone(&conn)).await;

            tokio::time::sleep(Duration::from_millis(1500)).await;
            assert!(conn.is_closed());
            assert_eq!(pool.stats().idle, 0);

            pool.shutdown(Duration::from_secs(1)).await.unwrap();
        }
    }
}
