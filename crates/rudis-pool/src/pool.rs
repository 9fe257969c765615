//! Connection pool for the rudis client
//!
//! Bounded, health-checked pooling of TCP connections with:
//! - Semaphore-based admission control (no caller starvation)
//! - LIFO or FIFO idle ordering
//! - Lifetime, idle-age and socket-probe staleness classification
//! - A dial-error circuit with background recovery probing
//! - Min-idle replenishment and a periodic stale-connection reaper
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use rudis_pool::prelude::*;
//!
//! let config = PoolConfig::new(Arc::new(TcpDialer::new("127.0.0.1:6379")))
//!     .with_pool_size(16)
//!     .with_min_idle_conns(4);
//! let pool = ConnPool::new(config);
//!
//! let cn = pool.get().await?;
//! cn.write_all(b"PING\r\n").await?;
//! pool.put(cn).await;
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{Semaphore, TryAcquireError};
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, warn};

use crate::conn::{Conn, Dialer};
use crate::error::{Error, Result};

/// Idle candidates inspected per acquire before falling back to a fresh
/// dial. Bounds the cost of churn where unhealthy idles are reinserted
/// concurrently.
const MAX_POP_ATTEMPTS: u32 = 3;

/// Delay between recovery probes while the dial circuit is open.
const PROBE_INTERVAL: Duration = Duration::from_secs(1);

// ============================================================================
// Configuration
// ============================================================================

/// Pool configuration.
///
/// Durations set to [`Duration::ZERO`] disable the corresponding behavior.
#[derive(Clone)]
pub struct PoolConfig {
    /// Produces new connections on demand.
    pub dialer: Arc<dyn Dialer>,
    /// Pop idle connections oldest-first instead of most-recently-used
    /// first. FIFO spreads load across sockets; LIFO (the default) prefers
    /// TCP-warm ones.
    pub pool_fifo: bool,
    /// Hard ceiling on live pooled connections. Must be positive.
    pub pool_size: usize,
    /// Maximum time to wait for a pool slot before giving up.
    pub pool_timeout: Duration,
    /// Target floor of idle connections, replenished in the background.
    pub min_idle_conns: usize,
    /// Ceiling on idle connections; 0 means unbounded.
    pub max_idle_conns: usize,
    /// Connections idle longer than this are retired; 0 disables.
    pub conn_max_idle_time: Duration,
    /// Connections older than this are retired; 0 disables.
    pub conn_max_lifetime: Duration,
    /// Period of the background stale-connection reaper; 0 disables it.
    pub idle_check_frequency: Duration,
}

impl PoolConfig {
    /// Create a configuration with defaults around the given dialer.
    pub fn new(dialer: Arc<dyn Dialer>) -> Self {
        Self {
            dialer,
            pool_fifo: false,
            pool_size: 10,
            pool_timeout: Duration::from_secs(5),
            min_idle_conns: 0,
            max_idle_conns: 0,
            conn_max_idle_time: Duration::from_secs(30 * 60),
            conn_max_lifetime: Duration::ZERO,
            idle_check_frequency: Duration::from_secs(60),
        }
    }

    /// Set FIFO idle ordering.
    pub fn with_pool_fifo(mut self, fifo: bool) -> Self {
        self.pool_fifo = fifo;
        self
    }

    /// Set the pooled-connection ceiling.
    pub fn with_pool_size(mut self, size: usize) -> Self {
        self.pool_size = size;
        self
    }

    /// Set the slot-wait timeout.
    pub fn with_pool_timeout(mut self, timeout: Duration) -> Self {
        self.pool_timeout = timeout;
        self
    }

    /// Set the idle-connection floor.
    pub fn with_min_idle_conns(mut self, count: usize) -> Self {
        self.min_idle_conns = count;
        self
    }

    /// Set the idle-connection ceiling (0 = unbounded).
    pub fn with_max_idle_conns(mut self, count: usize) -> Self {
        self.max_idle_conns = count;
        self
    }

    /// Set the maximum idle age (0 disables idle expiry).
    pub fn with_conn_max_idle_time(mut self, max_idle: Duration) -> Self {
        self.conn_max_idle_time = max_idle;
        self
    }

    /// Set the maximum connection lifetime (0 disables lifetime expiry).
    pub fn with_conn_max_lifetime(mut self, max_lifetime: Duration) -> Self {
        self.conn_max_lifetime = max_lifetime;
        self
    }

    /// Set the reaper period (0 disables the reaper).
    pub fn with_idle_check_frequency(mut self, frequency: Duration) -> Self {
        self.idle_check_frequency = frequency;
        self
    }
}

impl fmt::Debug for PoolConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolConfig")
            .field("pool_fifo", &self.pool_fifo)
            .field("pool_size", &self.pool_size)
            .field("pool_timeout", &self.pool_timeout)
            .field("min_idle_conns", &self.min_idle_conns)
            .field("max_idle_conns", &self.max_idle_conns)
            .field("conn_max_idle_time", &self.conn_max_idle_time)
            .field("conn_max_lifetime", &self.conn_max_lifetime)
            .field("idle_check_frequency", &self.idle_check_frequency)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Statistics
// ============================================================================

/// Snapshot of pool counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Stats {
    /// Times an idle connection was found in the pool.
    pub hits: u64,
    /// Times no idle connection was found and one had to be dialed.
    pub misses: u64,
    /// Times a caller timed out waiting for a pool slot.
    pub timeouts: u64,
    /// Stale connections removed from the pool.
    pub stale_conns: u64,
    /// Current total number of connections tracked by the pool.
    pub total_conns: u64,
    /// Current number of idle connections.
    pub idle_conns: u64,
}

#[derive(Debug, Default)]
struct AtomicStats {
    hits: AtomicU64,
    misses: AtomicU64,
    timeouts: AtomicU64,
    stale_conns: AtomicU64,
}

impl AtomicStats {
    fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    fn record_stale(&self, n: u64) {
        if n > 0 {
            self.stale_conns.fetch_add(n, Ordering::Relaxed);
        }
    }

    fn snapshot(&self, total_conns: u64, idle_conns: u64) -> Stats {
        Stats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            stale_conns: self.stale_conns.load(Ordering::Relaxed),
            total_conns,
            idle_conns,
        }
    }
}

// ============================================================================
// Pooler trait
// ============================================================================

/// Capability interface the pool exposes to a higher-level client.
#[async_trait]
pub trait Pooler: Send + Sync {
    /// Create an ad-hoc connection outside the pooled budget.
    async fn new_conn(&self) -> Result<Arc<Conn>>;

    /// Acquire a connection, reusing a healthy idle one when possible.
    async fn get(&self) -> Result<Arc<Conn>>;

    /// Return a connection to the pool.
    async fn put(&self, cn: Arc<Conn>);

    /// Evict a connection and close it in the caller's context.
    async fn remove(&self, cn: Arc<Conn>, reason: &str);

    /// Evict and close a connection outside the slot accounting
    /// (staleness path and ad-hoc connections).
    async fn close_conn(&self, cn: Arc<Conn>) -> Result<()>;

    /// Total number of connections tracked by the pool.
    fn len(&self) -> usize;

    /// Whether the pool tracks no connections.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of idle connections.
    fn idle_len(&self) -> usize;

    /// Snapshot of the pool counters.
    fn stats(&self) -> Stats;

    /// Shut the pool down. Idempotent; the second call reports `Closed`.
    async fn close(&self) -> Result<()>;
}

// ============================================================================
// ConnPool
// ============================================================================

/// Registry state: every live connection, the idle subset, and the two
/// counters that include in-flight min-idle reservations. One mutex guards
/// it all; the lock is never held across a dial or a socket close.
struct PoolState {
    conns: Vec<Arc<Conn>>,
    idle: VecDeque<Arc<Conn>>,
    /// Count of pooled connections, including reserved-but-dialing slots.
    pool_size: usize,
    /// Count of idle connections, including reserved-but-dialing slots.
    idle_len: usize,
}

struct PoolInner {
    cfg: PoolConfig,
    /// Admission gate: one permit per in-use pooled connection.
    queue: Semaphore,
    state: Mutex<PoolState>,
    stats: AtomicStats,
    /// Consecutive dial failures; at `pool_size` the circuit opens.
    dial_errors: AtomicUsize,
    last_dial_error: RwLock<Option<Error>>,
    closed: AtomicBool,
}

/// Thread-safe connection pool.
///
/// Cheap to clone; all clones share the same state. Each successful
/// [`get`](ConnPool::get) must be paired with exactly one
/// [`put`](ConnPool::put) or [`remove`](ConnPool::remove).
///
/// Callers impose their own deadline by wrapping `get()` in
/// [`tokio::time::timeout`]; dropping the future while waiting consumes no
/// pool slot and is not counted as a pool timeout.
#[derive(Clone)]
pub struct ConnPool {
    inner: Arc<PoolInner>,
}

impl ConnPool {
    /// Create a pool and eagerly start filling towards `min_idle_conns`.
    ///
    /// Must be called within a tokio runtime: the min-idle fillers, the
    /// reaper and asynchronous closes are spawned tasks.
    ///
    /// # Panics
    ///
    /// Panics if `cfg.pool_size` is zero.
    pub fn new(cfg: PoolConfig) -> Self {
        assert!(cfg.pool_size > 0, "pool_size must be positive");

        let pool_size = cfg.pool_size;
        let idle_check_frequency = cfg.idle_check_frequency;
        let pool = Self {
            inner: Arc::new(PoolInner {
                cfg,
                queue: Semaphore::new(pool_size),
                state: Mutex::new(PoolState {
                    conns: Vec::new(),
                    idle: VecDeque::new(),
                    pool_size: 0,
                    idle_len: 0,
                }),
                stats: AtomicStats::default(),
                dial_errors: AtomicUsize::new(0),
                last_dial_error: RwLock::new(None),
                closed: AtomicBool::new(false),
            }),
        };

        {
            let mut state = pool.inner.state.lock();
            pool.check_min_idle_conns(&mut state);
        }

        if idle_check_frequency > Duration::ZERO {
            tokio::spawn(reaper(Arc::downgrade(&pool.inner), idle_check_frequency));
        }

        pool
    }

    /// Pool configuration.
    pub fn config(&self) -> &PoolConfig {
        &self.inner.cfg
    }

    fn closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    // ------------------------------------------------------------------
    // Admission gate
    // ------------------------------------------------------------------

    /// Take a slot, waiting at most `pool_timeout`.
    async fn wait_turn(&self) -> Result<()> {
        match self.inner.queue.try_acquire() {
            Ok(permit) => {
                permit.forget();
                return Ok(());
            }
            Err(TryAcquireError::Closed) => return Err(Error::Closed),
            Err(TryAcquireError::NoPermits) => {}
        }

        match timeout(self.inner.cfg.pool_timeout, self.inner.queue.acquire()).await {
            Ok(Ok(permit)) => {
                permit.forget();
                Ok(())
            }
            Ok(Err(_)) => Err(Error::Closed),
            Err(_) => {
                self.inner.stats.record_timeout();
                Err(Error::PoolTimeout)
            }
        }
    }

    /// Take a slot with no pool-side timeout (reaper path).
    async fn get_turn(&self) -> Result<()> {
        match self.inner.queue.acquire().await {
            Ok(permit) => {
                permit.forget();
                Ok(())
            }
            Err(_) => Err(Error::Closed),
        }
    }

    fn free_turn(&self) {
        self.inner.queue.add_permits(1);
    }

    // ------------------------------------------------------------------
    // Acquire / release
    // ------------------------------------------------------------------

    /// Acquire a connection.
    ///
    /// Waits for a pool slot, then hands out a healthy idle connection if
    /// one exists, dialing a fresh one otherwise. Unhealthy idle candidates
    /// are evicted and retried a bounded number of times before falling
    /// back to the dialer.
    pub async fn get(&self) -> Result<Arc<Conn>> {
        if self.closed() {
            return Err(Error::Closed);
        }

        self.wait_turn().await?;

        for _ in 0..MAX_POP_ATTEMPTS {
            let popped = {
                let mut state = self.inner.state.lock();
                self.pop_idle(&mut state)
            };

            let cn = match popped {
                Ok(Some(cn)) => cn,
                Ok(None) => break,
                Err(err) => {
                    self.free_turn();
                    return Err(err);
                }
            };

            if self.is_healthy_conn(&cn) {
                self.inner.stats.record_hit();
                return Ok(cn);
            }
            self.async_close_conn(cn);
        }

        self.inner.stats.record_miss();

        match self.new_conn_inner(true).await {
            Ok(cn) => Ok(cn),
            Err(err) => {
                self.free_turn();
                Err(err)
            }
        }
    }

    /// Return a connection to the pool.
    ///
    /// A connection with unread buffered data is unusable for the next
    /// caller and is discarded; so is one the pool no longer has a slot
    /// for.
    pub async fn put(&self, cn: Arc<Conn>) {
        if cn.buffered() > 0 {
            warn!(
                conn = cn.id(),
                buffered = cn.buffered(),
                "connection returned with unread data"
            );
            self.async_remove(cn, "unread data");
            return;
        }

        if !cn.is_pooled() {
            self.async_remove(cn, "not pooled");
            return;
        }

        cn.set_used_at(Instant::now());

        let should_close;
        {
            let mut state = self.inner.state.lock();
            if self.closed() {
                drop(state);
                self.free_turn();
                Self::spawn_close(cn);
                return;
            }
            if self.inner.cfg.max_idle_conns == 0
                || state.idle_len < self.inner.cfg.max_idle_conns
            {
                state.idle.push_back(cn.clone());
                state.idle_len += 1;
                should_close = false;
            } else {
                self.remove_conn_locked(&mut state, &cn);
                should_close = true;
            }
        }

        self.free_turn();

        if should_close {
            Self::spawn_close(cn);
        }
    }

    /// Evict a connection and close it in the caller's context, releasing
    /// its pool slot.
    pub async fn remove(&self, cn: Arc<Conn>, reason: &str) {
        debug!(conn = cn.id(), reason, "removing connection");
        self.remove_conn_with_lock(&cn);
        self.free_turn();
        Self::teardown(cn).await;
    }

    /// Evict a connection, releasing its slot; the close happens in the
    /// background so the caller never waits on socket teardown.
    fn async_remove(&self, cn: Arc<Conn>, reason: &str) {
        debug!(conn = cn.id(), reason, "removing connection");
        self.remove_conn_with_lock(&cn);
        self.free_turn();
        Self::spawn_close(cn);
    }

    /// Evict and close a connection without touching the admission gate.
    ///
    /// This is the staleness path (the caller holds no slot for the
    /// connection) and the release path for [`new_conn`](Self::new_conn)
    /// ad-hoc connections. Counts towards `stale_conns`.
    pub async fn close_conn(&self, cn: Arc<Conn>) -> Result<()> {
        self.remove_conn_with_lock(&cn);
        self.inner.stats.record_stale(1);
        Self::close_conn_inner(cn).await
    }

    /// Background variant of [`close_conn`](Self::close_conn), used when
    /// evicting unhealthy idle candidates on the acquire path.
    fn async_close_conn(&self, cn: Arc<Conn>) {
        self.remove_conn_with_lock(&cn);
        self.inner.stats.record_stale(1);
        Self::spawn_close(cn);
    }

    // ------------------------------------------------------------------
    // Registry
    // ------------------------------------------------------------------

    fn pop_idle(&self, state: &mut PoolState) -> Result<Option<Arc<Conn>>> {
        if self.closed() {
            return Err(Error::Closed);
        }

        let cn = if self.inner.cfg.pool_fifo {
            state.idle.pop_front()
        } else {
            state.idle.pop_back()
        };
        let Some(cn) = cn else {
            return Ok(None);
        };
        state.idle_len -= 1;

        // Eviction-driven shrinkage is repaired eagerly.
        self.check_min_idle_conns(state);
        Ok(Some(cn))
    }

    fn remove_conn_with_lock(&self, cn: &Arc<Conn>) {
        let mut state = self.inner.state.lock();
        self.remove_conn_locked(&mut state, cn);
    }

    fn remove_conn_locked(&self, state: &mut PoolState, cn: &Arc<Conn>) {
        if let Some(pos) = state.conns.iter().position(|c| c.id() == cn.id()) {
            state.conns.remove(pos);
            if cn.is_pooled() {
                state.pool_size = state.pool_size.saturating_sub(1);
                self.check_min_idle_conns(state);
            }
        }
    }

    // ------------------------------------------------------------------
    // Min-idle filler
    // ------------------------------------------------------------------

    fn check_min_idle_conns(&self, state: &mut PoolState) {
        if self.inner.cfg.min_idle_conns == 0 || self.closed() {
            return;
        }
        while state.pool_size < self.inner.cfg.pool_size
            && state.idle_len < self.inner.cfg.min_idle_conns
        {
            // Reserve the slot synchronously so concurrent fillers cannot
            // over-commit the pool; the dial happens off-lock.
            state.pool_size += 1;
            state.idle_len += 1;

            let pool = self.clone();
            tokio::spawn(async move {
                if let Err(err) = pool.add_idle_conn().await {
                    if !matches!(err, Error::Closed) {
                        debug!(error = %err, "min idle fill failed");
                        let mut state = pool.inner.state.lock();
                        if !pool.closed() {
                            state.pool_size = state.pool_size.saturating_sub(1);
                            state.idle_len = state.idle_len.saturating_sub(1);
                        }
                    }
                }
            });
        }
    }

    async fn add_idle_conn(&self) -> Result<()> {
        let cn = self.dial_conn(true).await?;

        let mut state = self.inner.state.lock();
        if self.closed() {
            drop(state);
            Self::spawn_close(cn);
            return Err(Error::Closed);
        }

        // The filler already reserved its slot in both counters.
        state.conns.push(cn.clone());
        state.idle.push_back(cn);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Dialing
    // ------------------------------------------------------------------

    /// Create an ad-hoc connection.
    ///
    /// The connection is tracked for shutdown but lives outside the pooled
    /// budget: it holds no pool slot, and the total socket count may exceed
    /// `pool_size` while the pooled budget is still honored. Release it
    /// with [`close_conn`](Self::close_conn), not [`put`](Self::put).
    pub async fn new_conn(&self) -> Result<Arc<Conn>> {
        self.new_conn_inner(false).await
    }

    async fn new_conn_inner(&self, pooled: bool) -> Result<Arc<Conn>> {
        let cn = self.dial_conn(pooled).await?;

        let mut state = self.inner.state.lock();
        if self.closed() {
            drop(state);
            Self::spawn_close(cn);
            return Err(Error::Closed);
        }

        state.conns.push(cn.clone());
        if pooled {
            // The pool may have filled while this dial was in flight; hand
            // the connection out anyway and let `put` retire it.
            if state.pool_size >= self.inner.cfg.pool_size {
                cn.set_pooled(false);
            } else {
                state.pool_size += 1;
            }
        }

        Ok(cn)
    }

    async fn dial_conn(&self, pooled: bool) -> Result<Arc<Conn>> {
        if self.closed() {
            return Err(Error::Closed);
        }

        if self.inner.dial_errors.load(Ordering::Acquire) >= self.inner.cfg.pool_size {
            return Err(self
                .last_dial_error()
                .unwrap_or_else(|| Error::dial("dialer unavailable")));
        }

        match self.inner.cfg.dialer.dial().await {
            Ok(stream) => {
                let cn = Arc::new(Conn::new(stream));
                cn.set_pooled(pooled);
                Ok(cn)
            }
            Err(err) => {
                self.set_last_dial_error(err.clone());
                let failures = self.inner.dial_errors.fetch_add(1, Ordering::AcqRel) + 1;
                if failures == self.inner.cfg.pool_size {
                    warn!(failures, "dial circuit opened, starting recovery probe");
                    tokio::spawn(probe_dialer(Arc::downgrade(&self.inner)));
                }
                Err(err)
            }
        }
    }

    fn set_last_dial_error(&self, err: Error) {
        *self.inner.last_dial_error.write() = Some(err);
    }

    /// Most recent dialer failure, if any.
    pub fn last_dial_error(&self) -> Option<Error> {
        self.inner.last_dial_error.read().clone()
    }

    // ------------------------------------------------------------------
    // Health
    // ------------------------------------------------------------------

    fn conn_expired(&self, cn: &Conn, now: Instant) -> bool {
        let cfg = &self.inner.cfg;
        if cfg.conn_max_lifetime > Duration::ZERO
            && now.saturating_duration_since(cn.created_at()) >= cfg.conn_max_lifetime
        {
            debug!(conn = cn.id(), "connection exceeded max lifetime");
            return true;
        }
        if cfg.conn_max_idle_time > Duration::ZERO
            && now.saturating_duration_since(cn.used_at()) >= cfg.conn_max_idle_time
        {
            debug!(conn = cn.id(), "connection exceeded max idle time");
            return true;
        }
        false
    }

    /// Acquire-path health check; refreshes `used_at` on a pass.
    fn is_healthy_conn(&self, cn: &Conn) -> bool {
        let now = Instant::now();
        if self.conn_expired(cn, now) {
            return false;
        }
        if let Err(err) = cn.probe() {
            debug!(conn = cn.id(), error = %err, "socket probe failed");
            return false;
        }
        cn.set_used_at(now);
        true
    }

    /// Reaper-path staleness check; does not refresh `used_at`.
    fn is_stale_conn(&self, cn: &Conn) -> bool {
        let now = Instant::now();
        if self.conn_expired(cn, now) {
            return true;
        }
        if let Err(err) = cn.probe() {
            debug!(conn = cn.id(), error = %err, "socket probe failed");
            return true;
        }
        false
    }

    // ------------------------------------------------------------------
    // Reaping
    // ------------------------------------------------------------------

    /// Evict stale idle connections, oldest first, until the idle head is
    /// healthy. Returns how many were reaped.
    pub async fn reap_stale_conns(&self) -> Result<usize> {
        let mut reaped = 0u64;
        loop {
            if let Err(err) = self.get_turn().await {
                self.inner.stats.record_stale(reaped);
                return Err(err);
            }

            let cn = {
                let mut state = self.inner.state.lock();
                self.reap_stale_conn(&mut state)
            };
            self.free_turn();

            match cn {
                Some(cn) => {
                    Self::teardown(cn).await;
                    reaped += 1;
                }
                None => break,
            }
        }

        self.inner.stats.record_stale(reaped);
        Ok(reaped as usize)
    }

    /// Inspect the idle head; entries are inserted at the tail, so the head
    /// is the oldest idle connection.
    fn reap_stale_conn(&self, state: &mut PoolState) -> Option<Arc<Conn>> {
        match state.idle.front() {
            Some(cn) if self.is_stale_conn(cn) => {}
            _ => return None,
        }
        let cn = state.idle.pop_front()?;
        state.idle_len -= 1;
        self.remove_conn_locked(state, &cn);
        Some(cn)
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    /// Total number of connections tracked by the pool.
    pub fn len(&self) -> usize {
        self.inner.state.lock().conns.len()
    }

    /// Whether the pool tracks no connections.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of idle connections (including in-flight min-idle fills).
    pub fn idle_len(&self) -> usize {
        self.inner.state.lock().idle_len
    }

    /// Snapshot of the pool counters.
    pub fn stats(&self) -> Stats {
        let (total, idle) = {
            let state = self.inner.state.lock();
            (state.conns.len() as u64, state.idle_len as u64)
        };
        self.inner.stats.snapshot(total, idle)
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    /// Close every connection matching `predicate`, evicting it from the
    /// registry. Reports the first close error, if any.
    pub async fn filter(&self, predicate: impl Fn(&Conn) -> bool) -> Result<()> {
        let matched = {
            let mut state = self.inner.state.lock();

            let mut matched = Vec::new();
            let mut kept = Vec::with_capacity(state.conns.len());
            for cn in state.conns.drain(..) {
                if predicate(&cn) {
                    matched.push(cn);
                } else {
                    kept.push(cn);
                }
            }
            state.conns = kept;

            for cn in &matched {
                if let Some(pos) = state.idle.iter().position(|c| c.id() == cn.id()) {
                    let _ = state.idle.remove(pos);
                    state.idle_len = state.idle_len.saturating_sub(1);
                }
                if cn.is_pooled() {
                    state.pool_size = state.pool_size.saturating_sub(1);
                }
            }
            self.check_min_idle_conns(&mut state);
            matched
        };

        let mut first_err = None;
        for cn in matched {
            if let Err(err) = Self::close_conn_inner(cn).await {
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Shut the pool down, closing every tracked connection.
    ///
    /// Idempotent: the second and later calls report [`Error::Closed`].
    /// Reports the first close error encountered, if any.
    pub async fn close(&self) -> Result<()> {
        if self
            .inner
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::Closed);
        }

        // Fail queued waiters promptly instead of letting them ride out
        // their pool timeout.
        self.inner.queue.close();

        let conns = {
            let mut state = self.inner.state.lock();
            state.idle.clear();
            state.idle_len = 0;
            state.pool_size = 0;
            std::mem::take(&mut state.conns)
        };

        let mut first_err = None;
        for cn in conns {
            if let Err(err) = Self::close_conn_inner(cn).await {
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Close a connection exactly once. The socket is shut down gracefully
    /// when the pool holds the last handle; otherwise the fd is released
    /// when the final holder drops its `Arc`.
    async fn close_conn_inner(cn: Arc<Conn>) -> Result<()> {
        if !cn.mark_closed() {
            return Ok(());
        }
        if let Some(conn) = Arc::into_inner(cn) {
            conn.shutdown().await?;
        }
        Ok(())
    }

    /// Error-absorbing wrapper around [`close_conn_inner`](Self::close_conn_inner).
    async fn teardown(cn: Arc<Conn>) {
        if let Err(err) = Self::close_conn_inner(cn).await {
            debug!(error = %err, "connection close failed");
        }
    }

    fn spawn_close(cn: Arc<Conn>) {
        tokio::spawn(Self::teardown(cn));
    }
}

impl fmt::Debug for ConnPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnPool")
            .field("cfg", &self.inner.cfg)
            .field("closed", &self.closed())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Pooler for ConnPool {
    async fn new_conn(&self) -> Result<Arc<Conn>> {
        ConnPool::new_conn(self).await
    }

    async fn get(&self) -> Result<Arc<Conn>> {
        ConnPool::get(self).await
    }

    async fn put(&self, cn: Arc<Conn>) {
        ConnPool::put(self, cn).await;
    }

    async fn remove(&self, cn: Arc<Conn>, reason: &str) {
        ConnPool::remove(self, cn, reason).await;
    }

    async fn close_conn(&self, cn: Arc<Conn>) -> Result<()> {
        ConnPool::close_conn(self, cn).await
    }

    fn len(&self) -> usize {
        ConnPool::len(self)
    }

    fn idle_len(&self) -> usize {
        ConnPool::idle_len(self)
    }

    fn stats(&self) -> Stats {
        ConnPool::stats(self)
    }

    async fn close(&self) -> Result<()> {
        ConnPool::close(self).await
    }
}

// ============================================================================
// Background tasks
// ============================================================================

/// Periodically reap stale idle connections. Holds only a weak reference so
/// an abandoned pool is not kept alive by its own maintenance task.
async fn reaper(inner: Weak<PoolInner>, frequency: Duration) {
    let mut ticker = interval(frequency);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately; reaping starts one full period
    // after construction.
    ticker.tick().await;

    loop {
        ticker.tick().await;

        let Some(inner) = inner.upgrade() else { return };
        let pool = ConnPool { inner };
        if pool.closed() {
            return;
        }
        if let Err(err) = pool.reap_stale_conns().await {
            debug!(error = %err, "reap pass failed");
            return;
        }
    }
}

/// Recovery probe for the dial circuit: retry the dialer until it produces
/// a socket, then reset the failure counter. The probe socket is discarded,
/// never pooled.
async fn probe_dialer(inner: Weak<PoolInner>) {
    loop {
        let Some(inner) = inner.upgrade() else { return };
        if inner.closed.load(Ordering::Acquire) {
            return;
        }

        match inner.cfg.dialer.dial().await {
            Ok(stream) => {
                drop(stream);
                inner.dial_errors.store(0, Ordering::Release);
                debug!("dialer recovered, dial circuit reset");
                return;
            }
            Err(err) => {
                *inner.last_dial_error.write() = Some(err);
            }
        }

        drop(inner);
        tokio::time::sleep(PROBE_INTERVAL).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::TcpDialer;

    fn test_config() -> PoolConfig {
        PoolConfig::new(Arc::new(TcpDialer::new("127.0.0.1:6379")))
    }

    #[test]
    fn test_pool_config_defaults() {
        let cfg = test_config();

        assert!(!cfg.pool_fifo);
        assert_eq!(cfg.pool_size, 10);
        assert_eq!(cfg.pool_timeout, Duration::from_secs(5));
        assert_eq!(cfg.min_idle_conns, 0);
        assert_eq!(cfg.max_idle_conns, 0);
        assert_eq!(cfg.conn_max_idle_time, Duration::from_secs(1800));
        assert_eq!(cfg.conn_max_lifetime, Duration::ZERO);
        assert_eq!(cfg.idle_check_frequency, Duration::from_secs(60));
    }

    #[test]
    fn test_pool_config_builder() {
        let cfg = test_config()
            .with_pool_fifo(true)
            .with_pool_size(20)
            .with_pool_timeout(Duration::from_millis(250))
            .with_min_idle_conns(2)
            .with_max_idle_conns(8)
            .with_conn_max_idle_time(Duration::from_secs(120))
            .with_conn_max_lifetime(Duration::from_secs(600))
            .with_idle_check_frequency(Duration::from_secs(15));

        assert!(cfg.pool_fifo);
        assert_eq!(cfg.pool_size, 20);
        assert_eq!(cfg.pool_timeout, Duration::from_millis(250));
        assert_eq!(cfg.min_idle_conns, 2);
        assert_eq!(cfg.max_idle_conns, 8);
        assert_eq!(cfg.conn_max_idle_time, Duration::from_secs(120));
        assert_eq!(cfg.conn_max_lifetime, Duration::from_secs(600));
        assert_eq!(cfg.idle_check_frequency, Duration::from_secs(15));
    }

    #[test]
    fn test_pool_config_debug_skips_dialer() {
        let repr = format!("{:?}", test_config());
        assert!(repr.contains("pool_size"));
        assert!(!repr.contains("dialer"));
    }

    #[test]
    fn test_atomic_stats() {
        let stats = AtomicStats::default();

        stats.record_hit();
        stats.record_hit();
        stats.record_miss();
        stats.record_timeout();
        stats.record_stale(3);
        stats.record_stale(0);

        let snapshot = stats.snapshot(5, 2);
        assert_eq!(snapshot.hits, 2);
        assert_eq!(snapshot.misses, 1);
        assert_eq!(snapshot.timeouts, 1);
        assert_eq!(snapshot.stale_conns, 3);
        assert_eq!(snapshot.total_conns, 5);
        assert_eq!(snapshot.idle_conns, 2);
    }

    #[test]
    #[should_panic(expected = "pool_size must be positive")]
    fn test_zero_pool_size_panics() {
        let _pool = ConnPool::new(test_config().with_pool_size(0));
    }
}
