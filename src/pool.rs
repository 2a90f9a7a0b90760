//! The endpoint-restricted connection pool.
//!
//! The pool keeps a bounded set of idle connections whose remote addresses
//! are restricted to a dynamically updated endpoint list. Connections to
//! endpoints that leave the list are evicted and closed after a delay, so
//! in-flight work on them can drain. Unreachable endpoints are quarantined
//! under exponential backoff and probed by a background maintenance task,
//! which also rebalances the connection count so every reachable endpoint is
//! served by roughly the same number of connections.

use std::any::Any;
use std::collections::HashSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Once};

use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use slog::{debug, error, info, o, warn, Drain, Logger};
use thiserror::Error;
use tokio::sync::{watch, Notify};
use tokio::time::{interval_at, Duration, Instant, MissedTickBehavior};

use crate::backoff::ExponentialBackoff;
use crate::conn::Conn;
use crate::dialer::{self, SharedDialer};
use crate::endpoint::Endpoint;
use crate::health::HealthTracker;
use crate::inventory::Inventory;
use crate::queue::ReadyQueue;
use crate::registry::Registry;

/// How long an evicted connection keeps running before it is closed, so that
/// in-flight requests on it can complete.
pub const DEFAULT_CONN_CLOSE_DELAY: Duration = Duration::from_secs(120);

// Server failure is a low-probability event, so a fairly high probe
// frequency is acceptable; the dump is purely observational.
const DEFAULT_RECOVER_INTERVAL: Duration = Duration::from_secs(10);
const DUMP_INTERVAL: Duration = Duration::from_secs(10);

// The rebalance tick must outlast the close delay so deferred closes settle
// into the inventory before the next target computation reads it.
const REBALANCE_MARGIN: Duration = Duration::from_secs(30);

// Lower bound for the defaulted queue capacity.
const DEFAULT_MIN_POOL_SIZE: usize = 1024;

#[derive(Error, Debug)]
pub enum Error {
    #[error("init endpoints is empty")]
    InitEndpointsEmpty,

    #[error("no available server endpoint")]
    NoAvailableEndpoint,

    #[error("new connection has no remote address")]
    MissingRemoteAddr,

    #[error(transparent)]
    Dial(#[from] dialer::Error),
}

/// Tunables for a [Pool].
#[derive(Debug)]
pub struct PoolOptions {
    /// How many connections to hold per endpoint. Zero means one.
    pub conns_per_endpoint: usize,

    /// Capacity of the idle-connection queue. Zero picks
    /// `max(1024, endpoints × conns_per_endpoint)`.
    pub size: usize,

    /// Grace period between evicting a connection and closing it.
    pub conn_close_delay: Duration,

    /// How often quarantined endpoints are considered for a recovery probe.
    pub recover_interval: Duration,

    /// Backoff schedule for recovery probes.
    pub backoff: ExponentialBackoff,

    /// Destination for the pool's log output. `None` falls back to the
    /// standard `log` facade.
    pub log: Option<Logger>,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            conns_per_endpoint: 1,
            size: 0,
            conn_close_delay: DEFAULT_CONN_CLOSE_DELAY,
            recover_interval: DEFAULT_RECOVER_INTERVAL,
            backoff: ExponentialBackoff::default(),
            log: None,
        }
    }
}

/// Closes `conn` once `delay` has elapsed, or immediately for a zero delay.
///
/// Never blocks the caller; close failures are ignored.
pub fn close_conn<C: Conn>(conn: Arc<C>, delay: Duration) {
    if delay.is_zero() {
        let _ = conn.close();
        return;
    }
    tokio::task::spawn(async move {
        tokio::time::sleep(delay).await;
        let _ = conn.close();
    });
}

struct PoolInner<C: Conn> {
    queue: ReadyQueue<C>,
    registry: Registry,
    health: HealthTracker,
    inventory: Inventory,

    // Round-robin cursor over the registry snapshot.
    cursor: AtomicU64,

    conns_per_endpoint: usize,
    required_conns: usize,
    conn_close_delay: Duration,
    recover_interval: Duration,
    backoff: ExponentialBackoff,

    dialer: SharedDialer<C>,

    // Edge for an immediate rebalance after an endpoint update.
    rebalance_now: Notify,
    shutdown_tx: watch::Sender<bool>,
    close_once: Once,

    log: Logger,
}

/// A pool of connections restricted to a known endpoint set.
///
/// All methods take `&self`; share the pool between tasks with an `Arc`.
/// Dropping the pool closes it.
pub struct Pool<C: Conn> {
    inner: Arc<PoolInner<C>>,
    task: tokio::task::JoinHandle<()>,
}

impl<C: Conn> Pool<C> {
    /// Creates a new connection pool.
    ///
    /// Dials `init_endpoints × conns_per_endpoint` connections concurrently
    /// and fails with the first dial error if any endpoint is unreachable.
    /// On success a maintenance task is spawned; it runs until [Pool::close].
    pub async fn new(
        init_endpoints: Vec<Endpoint>,
        dialer: SharedDialer<C>,
        options: PoolOptions,
    ) -> Result<Self, Error> {
        if init_endpoints.is_empty() {
            return Err(Error::InitEndpointsEmpty);
        }

        let conns_per_endpoint = options.conns_per_endpoint.max(1);
        let required_conns = init_endpoints.len() * conns_per_endpoint;
        let size = if options.size == 0 {
            required_conns.max(DEFAULT_MIN_POOL_SIZE)
        } else {
            options.size
        };
        let log = options
            .log
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let inner = Arc::new(PoolInner {
            queue: ReadyQueue::new(size),
            registry: Registry::new(init_endpoints),
            health: HealthTracker::new(),
            inventory: Inventory::new(),
            cursor: AtomicU64::new(0),
            conns_per_endpoint,
            required_conns,
            conn_close_delay: options.conn_close_delay,
            recover_interval: options.recover_interval,
            backoff: options.backoff,
            dialer,
            rebalance_now: Notify::new(),
            shutdown_tx,
            close_once: Once::new(),
            log,
        });

        inner.init_conns(required_conns).await?;

        let worker = inner.clone();
        let task = tokio::task::spawn(async move { worker.run(shutdown_rx).await });

        Ok(Self { inner, task })
    }

    /// Takes a connection out of the pool, dialing a fresh one if no idle
    /// connection is available.
    pub async fn get(&self) -> Result<Arc<C>, Error> {
        self.inner.get().await
    }

    /// Returns a connection to the pool.
    ///
    /// The connection is closed (after the configured delay) instead of
    /// pooled if `err` is set, if its endpoint has been removed, or if the
    /// pool is full.
    pub fn put(&self, conn: Arc<C>, err: Option<anyhow::Error>) {
        self.inner.put_conn(conn, err, false);
    }

    /// Replaces the endpoint set with `all`; `add` and `del` are hints for
    /// incremental cleanup. Connections to deleted endpoints are evicted and
    /// an immediate rebalance is triggered. Faults are logged, never
    /// propagated: a buggy discovery source must not take the pool down.
    pub fn update_endpoints(&self, all: Vec<Endpoint>, add: &[Endpoint], del: &[Endpoint]) {
        self.inner.update_endpoints(all, add, del);
    }

    /// The number of idle connections currently pooled. Approximate under
    /// concurrency.
    pub fn num_pooled(&self) -> usize {
        self.inner.queue.len()
    }

    /// Notifies the pool that `conn` was closed, e.g. by the peer. With
    /// `err` set the endpoint is also quarantined.
    ///
    /// Accounting is best-effort: if the connection's remote address is
    /// already absent the inventory decrement is skipped, and later
    /// rebalances reconcile the drift.
    pub fn on_conn_closed(&self, conn: &Arc<C>, err: Option<anyhow::Error>) {
        self.inner.on_conn_closed(conn, err);
    }

    /// Closes the pool: stops the maintenance task and synchronously closes
    /// every idle connection. Idempotent.
    pub fn close(&self) {
        self.inner.close();
    }
}

impl<C: Conn> Drop for Pool<C> {
    fn drop(&mut self) {
        self.inner.close();
        self.task.abort();
    }
}

impl<C: Conn> PoolInner<C> {
    async fn get(&self) -> Result<Arc<C>, Error> {
        if let Some(conn) = self.queue.try_pop() {
            return Ok(conn);
        }

        debug!(self.log, "pool is empty, dialing a new connection");
        let conn = self.new_conn().await?;
        let Some(addr) = conn.remote_addr() else {
            error!(self.log, "new connection has no remote address");
            close_conn(conn, Duration::ZERO);
            return Err(Error::MissingRemoteAddr);
        };
        self.inventory.inc(&addr);
        Ok(conn)
    }

    /// Dials the next healthy endpoint in round-robin order.
    async fn new_conn(&self) -> Result<Arc<C>, Error> {
        let endpoint = self.next_healthy_endpoint()?;
        self.dial_endpoint(&endpoint).await
    }

    fn next_healthy_endpoint(&self) -> Result<Endpoint, Error> {
        let snapshot = self.registry.snapshot();
        if snapshot.is_empty() {
            return Err(Error::NoAvailableEndpoint);
        }

        for _ in 0..snapshot.len() {
            let index = self.cursor.fetch_add(1, Ordering::Relaxed);
            let endpoint = &snapshot[(index % snapshot.len() as u64) as usize];
            if self.health.is_unavailable(endpoint) {
                continue;
            }
            return Ok(endpoint.clone());
        }

        Err(Error::NoAvailableEndpoint)
    }

    async fn dial_endpoint(&self, endpoint: &Endpoint) -> Result<Arc<C>, Error> {
        match self.dialer.dial(endpoint).await {
            Ok(conn) => Ok(Arc::new(conn)),
            Err(err) => {
                info!(
                    self.log,
                    "endpoint cannot be connected, marking as unavailable, addr: {}", endpoint
                );
                self.health.mark_unavailable(endpoint);
                Err(err.into())
            }
        }
    }

    /// Dials `count` connections concurrently and pools them. Any dial
    /// failure fails the whole batch; connections that did come up are
    /// closed before the error is returned.
    async fn init_conns(&self, count: usize) -> Result<(), Error> {
        let mut dials = FuturesUnordered::new();
        for _ in 0..count {
            dials.push(self.new_conn());
        }

        let mut conns = Vec::with_capacity(count);
        let mut first_err = None;
        while let Some(result) = dials.next().await {
            match result {
                Ok(conn) => conns.push(conn),
                Err(err) => first_err = first_err.or(Some(err)),
            }
        }

        if let Some(err) = first_err {
            for conn in conns {
                close_conn(conn, Duration::ZERO);
            }
            return Err(err);
        }

        for conn in conns {
            self.put_conn(conn, None, true);
        }
        Ok(())
    }

    /// `is_new` marks connections the pool itself created (construction,
    /// recovery, rebalance): only those increment the inventory, and only
    /// once they are actually enqueued.
    fn put_conn(&self, conn: Arc<C>, err: Option<anyhow::Error>, is_new: bool) {
        let Some(addr) = conn.remote_addr() else {
            error!(self.log, "remote address is absent, the peer closed the connection");
            close_conn(conn, self.conn_close_delay);
            return;
        };

        if !self.registry.contains(&addr) {
            info!(self.log, "endpoint deleted, close its connection, addr: {}", addr);
            close_conn(conn, self.conn_close_delay);
            return;
        }

        if let Some(err) = err {
            warn!(self.log, "connection error, close it, addr: {}, err: {}", addr, err);
            close_conn(conn, self.conn_close_delay);
            return;
        }

        match self.queue.try_push(conn) {
            Ok(()) => {
                if is_new {
                    self.inventory.inc(&addr);
                }
            }
            Err(conn) => {
                warn!(self.log, "connection pool is full, closing connection, addr: {}", addr);
                close_conn(conn, self.conn_close_delay);
            }
        }
    }

    fn on_conn_closed(&self, conn: &Arc<C>, err: Option<anyhow::Error>) {
        if let Some(addr) = conn.remote_addr() {
            if let Some(err) = err {
                warn!(self.log, "connection closed, addr: {}, err: {}", addr, err);
                info!(
                    self.log,
                    "endpoint cannot be connected, marking as unavailable, addr: {}", addr
                );
                self.health.mark_unavailable(&addr);
            }
            self.inventory.dec(&addr);
        }

        // Purge the closed connection, and any other entry whose peer has
        // vanished, from the queue. The dropped entries are already closed;
        // only refill overflow needs the delayed close.
        let mut survivors = Vec::new();
        for pooled in self.queue.drain() {
            if Arc::ptr_eq(&pooled, conn) || pooled.remote_addr().is_none() {
                debug!(self.log, "removed closed connection from the pool");
                continue;
            }
            survivors.push(pooled);
        }
        self.refill(survivors);
    }

    /// Pushes `conns` back into the queue, closing with delay whatever no
    /// longer fits.
    fn refill(&self, conns: Vec<Arc<C>>) {
        for conn in conns {
            if let Err(conn) = self.queue.try_push(conn) {
                close_conn(conn, self.conn_close_delay);
            }
        }
    }

    fn update_endpoints(&self, all: Vec<Endpoint>, add: &[Endpoint], del: &[Endpoint]) {
        let result = catch_unwind(AssertUnwindSafe(|| {
            self.apply_endpoint_update(all, add, del);
        }));
        if let Err(panic) = result {
            error!(
                self.log,
                "panic while updating endpoints: {}",
                panic_message(panic.as_ref())
            );
        }
    }

    fn apply_endpoint_update(&self, all: Vec<Endpoint>, add: &[Endpoint], del: &[Endpoint]) {
        if all.is_empty() {
            return;
        }
        debug!(
            self.log,
            "updating endpoints, all: {:?}, add: {:?}, del: {:?}", all, add, del
        );

        self.registry.apply(all, add, del);
        for endpoint in del {
            self.health.clear(endpoint);
        }

        if !del.is_empty() {
            info!(self.log, "deleting connections of removed endpoints");
            let deleted: HashSet<Endpoint> = del.iter().cloned().collect();
            let mut survivors = Vec::new();
            for pooled in self.queue.drain() {
                match pooled.remote_addr() {
                    None => close_conn(pooled, Duration::ZERO),
                    Some(addr) if deleted.contains(&addr) => {
                        info!(self.log, "endpoint deleted, close its connection, addr: {}", addr);
                        // Decrement at eviction time rather than at the real
                        // close, so the next rebalance computes its deficit
                        // from connections that will actually survive.
                        self.inventory.dec(&addr);
                        close_conn(pooled, self.conn_close_delay);
                    }
                    Some(_) => survivors.push(pooled),
                }
            }
            self.refill(survivors);
        }

        if !add.is_empty() || !del.is_empty() {
            self.rebalance_now.notify_one();
        }
    }

    fn close(&self) {
        self.close_once.call_once(|| {
            info!(self.log, "closing connection pool");
            let _ = self.shutdown_tx.send(true);
            while let Some(conn) = self.queue.try_pop() {
                close_conn(conn, Duration::ZERO);
            }
        });
    }

    /// The maintenance loop: recovery probes, the diagnostic dump, and
    /// periodic rebalancing, multiplexed with the shutdown signal. A single
    /// task owns all three so they never run concurrently with each other.
    async fn run(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        let mut recover_tick = interval_at(
            Instant::now() + self.recover_interval,
            self.recover_interval,
        );
        recover_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut dump_tick = interval_at(Instant::now() + DUMP_INTERVAL, DUMP_INTERVAL);
        dump_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let rebalance_interval = self.conn_close_delay + REBALANCE_MARGIN;
        let mut rebalance_tick =
            interval_at(Instant::now() + rebalance_interval, rebalance_interval);
        rebalance_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = recover_tick.tick() => {
                    if self.guarded("recover", self.recover()).await == Some(true) {
                        self.guarded("rebalance", self.rebalance()).await;
                    }
                }
                _ = dump_tick.tick() => self.dump(),
                _ = rebalance_tick.tick() => {
                    self.guarded("rebalance", self.rebalance()).await;
                }
                _ = self.rebalance_now.notified() => {
                    self.guarded("rebalance", self.rebalance()).await;
                }
                _ = shutdown_rx.changed() => return,
            }
        }
    }

    /// Runs a maintenance action with a panic guard, so a buggy dialer
    /// cannot kill the maintenance task.
    async fn guarded<F>(&self, label: &str, action: F) -> Option<F::Output>
    where
        F: std::future::Future,
    {
        match AssertUnwindSafe(action).catch_unwind().await {
            Ok(value) => Some(value),
            Err(panic) => {
                error!(
                    self.log,
                    "panic in pool maintenance ({}): {}",
                    label,
                    panic_message(panic.as_ref())
                );
                None
            }
        }
    }

    /// Probes quarantined endpoints whose backoff window has elapsed.
    /// Returns whether any endpoint recovered.
    async fn recover(&self) -> bool {
        let mut recovered = false;
        for endpoint in self.health.due_for_probe(&self.backoff) {
            match self.dialer.dial(&endpoint).await {
                Ok(conn) => {
                    info!(self.log, "endpoint recovered, addr: {}", endpoint);
                    self.health.clear(&endpoint);
                    self.put_conn(Arc::new(conn), None, true);
                    recovered = true;
                }
                Err(err) => {
                    info!(self.log, "failed to recover endpoint, addr: {}, err: {}", endpoint, err);
                    self.health.record_failed_probe(&endpoint);
                }
            }
        }
        if recovered {
            info!(self.log, "recover triggered");
        }
        recovered
    }

    fn dump(&self) {
        info!(self.log, "all endpoints:");
        for endpoint in self.registry.snapshot().iter() {
            info!(self.log, "{}", endpoint);
        }

        let down = self.health.snapshot();
        if !down.is_empty() {
            info!(self.log, "unavailable endpoints:");
            for endpoint in &down {
                info!(self.log, "{}", endpoint);
            }
        }

        info!(self.log, "opened connections:");
        for (endpoint, count) in self.inventory.snapshot() {
            info!(self.log, "endpoint: {}, conns: {}", endpoint, count);
        }
    }

    /// The per-endpoint connection target.
    ///
    /// Deferred closes make the current inventory an over-estimate of the
    /// live connection count, so the target leans on a damped average of the
    /// current and initial counts instead of converging immediately.
    fn expected_conns_per_endpoint(&self) -> usize {
        let current = self.inventory.total();
        if current == 0 {
            return 1;
        }

        let average = (current + self.required_conns) / 2;
        if average == 0 {
            return 1;
        }

        let available = self.registry.len().saturating_sub(self.health.len());
        if available == 0 {
            return 1;
        }

        let estimated = current / available;
        let averaged = average / available;
        let initial = self.conns_per_endpoint;
        debug!(
            self.log,
            "conns per endpoint: estimated {}, averaged {}, initial {}",
            estimated,
            averaged,
            initial
        );

        let expected = if estimated < initial {
            // The endpoint set grew and connections are spread thinner; grow
            // toward the estimate, but no faster than the damped average.
            estimated.min(averaged)
        } else {
            // The endpoint set shrank or is steady.
            initial.max(averaged)
        };
        let expected = expected.max(1);
        debug!(self.log, "expected conns per endpoint: {}", expected);
        expected
    }

    /// Brings each endpoint's connection count toward the computed target:
    /// deficits are dialed up (stopping at the first dial error per
    /// endpoint), surpluses are evicted and closed with delay.
    async fn rebalance(&self) {
        let expected = self.expected_conns_per_endpoint();
        let mut rebalanced = false;

        for (endpoint, count) in self.inventory.snapshot() {
            if !self.registry.contains(&endpoint) {
                continue;
            }
            if count < expected {
                rebalanced |= self.add_endpoint_conns(&endpoint, expected - count).await;
            } else if count > expected {
                self.remove_endpoint_conns(&endpoint, count - expected);
                rebalanced = true;
            }
        }

        // Endpoints with no inventory at all: fresh additions, or endpoints
        // whose connections have all been declared closed.
        for endpoint in self.registry.snapshot().iter() {
            if self.inventory.count(endpoint) > 0 {
                continue;
            }
            rebalanced |= self.add_endpoint_conns(endpoint, expected).await;
        }

        if rebalanced {
            info!(self.log, "rebalance triggered");
        }
    }

    async fn add_endpoint_conns(&self, endpoint: &Endpoint, count: usize) -> bool {
        let mut added = false;
        for _ in 0..count {
            match self.dial_endpoint(endpoint).await {
                Ok(conn) => {
                    info!(self.log, "adding connection for addr: {}", endpoint);
                    self.put_conn(conn, None, true);
                    added = true;
                }
                Err(err) => {
                    warn!(
                        self.log,
                        "failed to add connection during rebalancing, addr: {}, err: {}",
                        endpoint,
                        err
                    );
                    break;
                }
            }
        }
        added
    }

    fn remove_endpoint_conns(&self, endpoint: &Endpoint, count: usize) {
        let mut removed = 0;
        let mut survivors = Vec::new();
        for pooled in self.queue.drain() {
            // Entries whose peer vanished are dropped without another close.
            let Some(addr) = pooled.remote_addr() else {
                continue;
            };
            if removed < count && addr == *endpoint {
                info!(self.log, "reducing connection for addr: {}", endpoint);
                // The inventory is left untouched here; the deferred close
                // settles it through on_conn_closed before the next
                // rebalance tick reads it.
                close_conn(pooled, self.conn_close_delay);
                removed += 1;
                continue;
            }
            survivors.push(pooled);
        }
        self.refill(survivors);
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}
