// Copyright 2020 Joyent, Inc.

pub mod types;

use std::collections::{BTreeMap, HashMap};
use std::error::Error as StdError;
use std::fmt;
use std::mem;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread;
use std::time::Duration;

use slog::{debug, error, info, o, trace, warn, Drain, Logger};
use timer::Guard;

use crate::backend::{self, Backend, BackendKey, BackendName};
use crate::cancel::CancelToken;
use crate::connection::Connection;
use crate::connection_pool::types::{
    ConnectionData, ConnectionPoolOptions, ConnectionPoolState,
    ConnectionPoolStats, PooledConnection, ProtectedData, RefreshCheck,
};
use crate::error::{Error, FatalErrors};
use crate::probe::{self, HttpRoleProber, NodeStatus, RoleProber};
use crate::resolver::Resolver;

/// Default interval between refresh cycles
pub const DEFAULT_UPDATE_INTERVAL: Duration = Duration::from_secs(2);
/// Default deadline of a background refresh cycle
pub const DEFAULT_UPDATE_TIMEOUT: Duration = Duration::from_secs(5);
/// Default deadline of the refresh cycle run at construction
pub const DEFAULT_INIT_TIMEOUT: Duration = Duration::from_secs(1);
/// Default timeout of a single role probe
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_millis(500);
/// Default number of `RetryHelper` attempts
pub const DEFAULT_MAX_RETRIES: u32 = 3;
/// Default wait between `RetryHelper` attempts
pub const DEFAULT_INTER_RETRY_DELAY: Duration = Duration::from_millis(500);

type CreateConnection<C> = Box<dyn Fn(&Backend) -> C + Send + Sync>;

// State shared between the pool, its refresh worker, its timer and the
// handles it gives out.
struct PoolInner<C> {
    protected_data: ProtectedData<C>,
    refresh_check: RefreshCheck,
    resolver: Box<dyn Resolver>,
    prober: Box<dyn RoleProber>,
    create_connection: CreateConnection<C>,
    // The last non-empty directory listing. Only touched by refresh cycles.
    last_members: Mutex<Vec<Backend>>,
    // Held for the whole of a refresh cycle.
    cycle_lock: Mutex<()>,
    stop: CancelToken,
    fatal_errors: Arc<FatalErrors>,
    update_timeout: Duration,
    probe_timeout: Duration,
    log: Logger,
}

struct RefreshTimer {
    _guard: Guard,
    _timer: timer::Timer,
}

/// A pool of connections to the members of a Patroni cluster
///
/// The pool keeps one connection per reachable member and knows which member
/// is the leader. `write_conn` hands out the leader's connection and
/// `read_conn` prefers the leader but falls back to any healthy replica.
/// Every handle must be followed by `ConnectionHandle::report_err` with the
/// outcome of the work done on it, so the pool can stop handing out
/// connections that broke.
pub struct ConnectionPool<C>
where
    C: Connection,
{
    inner: Arc<PoolInner<C>>,
    state: Mutex<ConnectionPoolState>,
    refresh_thread: Mutex<Option<thread::JoinHandle<()>>>,
    refresh_timer: Mutex<Option<RefreshTimer>>,
    max_retries: u32,
    inter_retry_delay: Duration,
    log: Logger,
}

impl<C> fmt::Debug for ConnectionPool<C>
where
    C: Connection,
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("state", &self.get_state())
            .field("stats", &self.inner.protected_data.read().stats())
            .field("max_retries", &self.max_retries)
            .field("inter_retry_delay", &self.inter_retry_delay)
            .finish()
    }
}

impl<C> ConnectionPool<C>
where
    C: Connection,
{
    /// Create a pool that confirms member roles over the Patroni REST API.
    ///
    /// One refresh cycle runs before this returns, bounded by
    /// `init_timeout`. Construction fails if the resolver fails; members
    /// that cannot be reached only leave the pool without connections.
    pub fn new<R, F>(
        cpo: ConnectionPoolOptions,
        resolver: R,
        create_connection: F,
    ) -> Result<Self, Error>
    where
        R: Resolver + 'static,
        F: Fn(&Backend) -> C + Send + Sync + 'static,
    {
        let prober = HttpRoleProber::new()?;
        Self::with_prober(cpo, resolver, prober, create_connection)
    }

    /// Create a pool with a custom `RoleProber`.
    pub fn with_prober<R, P, F>(
        cpo: ConnectionPoolOptions,
        resolver: R,
        prober: P,
        create_connection: F,
    ) -> Result<Self, Error>
    where
        R: Resolver + 'static,
        P: RoleProber + 'static,
        F: Fn(&Backend) -> C + Send + Sync + 'static,
    {
        let logger = cpo
            .log
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()));

        let update_interval =
            cpo.update_interval.unwrap_or(DEFAULT_UPDATE_INTERVAL);
        let init_timeout = cpo.init_timeout.unwrap_or(DEFAULT_INIT_TIMEOUT);

        let inner = Arc::new(PoolInner {
            protected_data: ProtectedData::new(ConnectionData::new()),
            refresh_check: RefreshCheck::new(),
            resolver: Box::new(resolver),
            prober: Box::new(prober),
            create_connection: Box::new(create_connection),
            last_members: Mutex::new(Vec::new()),
            cycle_lock: Mutex::new(()),
            stop: CancelToken::new(),
            fatal_errors: Arc::new(cpo.fatal_errors.unwrap_or_default()),
            update_timeout: cpo
                .update_timeout
                .unwrap_or(DEFAULT_UPDATE_TIMEOUT),
            probe_timeout: cpo.probe_timeout.unwrap_or(DEFAULT_PROBE_TIMEOUT),
            log: logger.clone(),
        });

        let init_token = inner.stop.child_with_timeout(init_timeout);
        refresh_connections(&inner, &init_token, true)?;

        let refresh_inner = Arc::clone(&inner);
        let refresh_thread = thread::Builder::new()
            .name("patroni-pool-refresh".into())
            .spawn(move || refresh_loop(refresh_inner))?;

        let timer = timer::Timer::new();
        let guard = match start_refresh_timer(
            &timer,
            update_interval,
            Arc::downgrade(&inner),
            logger.clone(),
        ) {
            Ok(guard) => guard,
            Err(e) => {
                inner.stop.cancel();
                let _ = refresh_thread.join();
                close_all(&inner, &logger);
                return Err(e);
            }
        };

        Ok(ConnectionPool {
            inner,
            state: Mutex::new(ConnectionPoolState::Running),
            refresh_thread: Mutex::new(Some(refresh_thread)),
            refresh_timer: Mutex::new(Some(RefreshTimer {
                _guard: guard,
                _timer: timer,
            })),
            max_retries: cpo.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
            inter_retry_delay: cpo
                .inter_retry_delay
                .unwrap_or(DEFAULT_INTER_RETRY_DELAY),
            log: logger,
        })
    }

    /// Return a handle to the leader's connection, or `None` if there is no
    /// healthy leader. Never blocks on I/O.
    pub fn write_conn(&self) -> Option<ConnectionHandle<C>> {
        let connection_data = self.inner.protected_data.read();
        self.leader_handle(&connection_data)
    }

    /// Return a handle to the leader's connection if it is healthy,
    /// otherwise to the healthy member whose name sorts first, or `None` if
    /// no member is healthy. Never blocks on I/O.
    pub fn read_conn(&self) -> Option<ConnectionHandle<C>> {
        let connection_data = self.inner.protected_data.read();
        self.leader_handle(&connection_data).or_else(|| {
            connection_data
                .healthy
                .values()
                .next()
                .map(|conn| self.handle(connection_data.version, conn))
        })
    }

    /// Run one refresh cycle on the calling thread. Cycles never overlap:
    /// this waits for a cycle the refresh worker may be running. A cycle
    /// that is cancelled, or runs past `update_timeout` before every member
    /// is probed, leaves the pool unchanged and returns the reason.
    pub fn refresh(&self) -> Result<(), Error> {
        let token = self.inner.stop.child_with_timeout(self.inner.update_timeout);
        refresh_connections(&self.inner, &token, false)
    }

    pub fn get_stats(&self) -> Option<ConnectionPoolStats> {
        match *self.state_lock() {
            ConnectionPoolState::Running => {
                Some(self.inner.protected_data.read().stats())
            }
            _ => None,
        }
    }

    pub fn get_state(&self) -> String {
        self.state_lock().to_string()
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn inter_retry_delay(&self) -> Duration {
        self.inter_retry_delay
    }

    pub(crate) fn log(&self) -> &Logger {
        &self.log
    }

    /// Stop the refresh timer and worker, then close every connection.
    /// Handles obtained earlier stay usable until the connection behind them
    /// is closed; connections still locked by a caller are closed on a
    /// separate thread once released. Calling `close` more than once is a
    /// no-op.
    pub fn close(&self) {
        {
            let mut state = self.state_lock();
            if *state != ConnectionPoolState::Running {
                trace!(self.log, "close called on a pool that is not running");
                return;
            }
            *state = ConnectionPoolState::Stopping;
        }

        // Dropping the guard and timer stops the periodic refresh requests
        drop(
            self.refresh_timer
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );

        // Cancelling the stop token discards any cycle in progress
        self.inner.stop.cancel();
        self.inner.refresh_check.condvar_notify();
        let refresh_thread = self
            .refresh_thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(refresh_thread) = refresh_thread {
            let _ = refresh_thread.join();
        }
        trace!(self.log, "close: joined refresh worker");

        // Wait out a cycle running on a caller's thread; it sees the
        // cancelled token and discards its work.
        let _cycle = self
            .inner
            .cycle_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        close_all(&self.inner, &self.log);

        *self.state_lock() = ConnectionPoolState::Stopped;
    }

    fn state_lock(&self) -> MutexGuard<ConnectionPoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // Callers hold the read lock
    fn leader_handle(
        &self,
        connection_data: &ConnectionData<C>,
    ) -> Option<ConnectionHandle<C>> {
        let leader = connection_data.leader.as_ref()?;
        let conn = connection_data.healthy.get(leader)?;
        Some(self.handle(connection_data.version, conn))
    }

    fn handle(
        &self,
        version: u64,
        conn: &Arc<PooledConnection<C>>,
    ) -> ConnectionHandle<C> {
        ConnectionHandle {
            version,
            connection: Arc::clone(conn),
            pool: Arc::downgrade(&self.inner),
            fatal_errors: Arc::clone(&self.inner.fatal_errors),
        }
    }
}

impl<C> Drop for ConnectionPool<C>
where
    C: Connection,
{
    fn drop(&mut self) {
        self.close();
    }
}

/// A short-lived reference to one pooled connection
///
/// A handle is stamped with the pool version it was issued under. It should
/// be used for one operation, after which the outcome must be passed to
/// `report_err`. Reports made through a handle issued before the pool's last
/// refresh are ignored, so a late report cannot demote a connection the pool
/// has since replaced or re-validated.
pub struct ConnectionHandle<C>
where
    C: Connection,
{
    version: u64,
    connection: Arc<PooledConnection<C>>,
    pool: Weak<PoolInner<C>>,
    fatal_errors: Arc<FatalErrors>,
}

impl<C> ConnectionHandle<C>
where
    C: Connection,
{
    pub fn version(&self) -> u64 {
        self.version
    }

    /// The member this handle points at.
    pub fn node(&self) -> &BackendName {
        &self.connection.name
    }

    /// Lock the underlying connection. Other callers holding a handle to the
    /// same member wait until the guard is dropped.
    pub fn connection(&self) -> MutexGuard<C> {
        self.connection.lock()
    }

    /// Report the outcome of using this handle. Returns `true` if `err` means
    /// the connection is broken, in which case the member is moved out of
    /// the healthy set (unless the handle is stale) and an early refresh is
    /// requested. `None` and errors that leave the connection usable return
    /// `false` and change nothing.
    pub fn report_err(&self, err: Option<&(dyn StdError + 'static)>) -> bool {
        let err = match err {
            Some(err) => err,
            None => return false,
        };
        if !self.fatal_errors.is_fatal(err) {
            return false;
        }
        if let Some(inner) = self.pool.upgrade() {
            warn!(inner.log, "connection failed";
                "node" => %self.connection.name, "err" => %err);
            demote_connection(&inner, self);
        }
        true
    }
}

impl<C> fmt::Display for ConnectionHandle<C>
where
    C: Connection,
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "ConnectionHandle{{node: {}, v: {}}}",
            self.connection.name, self.version
        )
    }
}

impl<C> fmt::Debug for ConnectionHandle<C>
where
    C: Connection,
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("node", &self.connection.name)
            .field("version", &self.version)
            .finish()
    }
}

fn demote_connection<C>(inner: &PoolInner<C>, handle: &ConnectionHandle<C>)
where
    C: Connection,
{
    let name = handle.node();
    {
        let mut connection_data = inner.protected_data.write();
        if handle.version < connection_data.version {
            debug!(inner.log, "ignoring error reported through stale handle";
                "node" => %name,
                "handle_version" => handle.version,
                "version" => connection_data.version);
            return;
        }
        if let Some(conn) = connection_data.healthy.remove(name) {
            info!(inner.log, "marking connection unhealthy"; "node" => %name);
            if connection_data.leader.as_ref() == Some(name) {
                connection_data.leader = None;
            }
            connection_data.unhealthy.insert(name.clone(), conn);
        }
    }
    request_refresh(inner);
}

// Ask the refresh worker for a cycle. Requests made while one is already
// pending or running are dropped.
fn request_refresh<C>(inner: &PoolInner<C>)
where
    C: Connection,
{
    {
        let mut connection_data = inner.protected_data.write();
        if connection_data.refreshing {
            trace!(inner.log, "refresh already pending");
            return;
        }
        connection_data.refreshing = true;
    }
    inner.refresh_check.request();
}

fn refresh_loop<C>(inner: Arc<PoolInner<C>>)
where
    C: Connection,
{
    let log = inner.log.new(o!("component" => "refresh"));
    let mut done = inner.stop.is_cancelled();
    while !done {
        let mut refresh = inner.refresh_check.get_lock();
        if !*refresh {
            refresh = inner.refresh_check.condvar_wait(refresh);
        }
        let requested = *refresh;
        *refresh = false;
        drop(refresh);

        if requested && !inner.stop.is_cancelled() {
            let token = inner.stop.child_with_timeout(inner.update_timeout);
            if let Err(e) = refresh_connections(&inner, &token, false) {
                warn!(log, "refresh cycle discarded"; "err" => %e);
            }
        }

        done = inner.stop.is_cancelled();
    }
    trace!(log, "refresh_loop exiting");
}

/// Start the timer that requests a refresh every `update_interval`
fn start_refresh_timer<C>(
    timer: &timer::Timer,
    update_interval: Duration,
    inner: Weak<PoolInner<C>>,
    log: Logger,
) -> Result<Guard, Error>
where
    C: Connection,
{
    let interval = chrono::Duration::from_std(update_interval)
        .map_err(|e| Error::InvalidOption(format!("update_interval: {}", e)))?;
    debug!(log, "starting refresh timer";
        "interval_ms" => update_interval.as_millis() as u64);
    Ok(timer.schedule_repeating(interval, move || {
        if let Some(inner) = inner.upgrade() {
            request_refresh(&inner);
        }
    }))
}

// The connections a refresh cycle will commit, built without holding the
// state lock.
struct RefreshPlan<C> {
    healthy: BTreeMap<BackendName, Arc<PooledConnection<C>>>,
    unhealthy: BTreeMap<BackendName, Arc<PooledConnection<C>>>,
    leader: Option<BackendName>,
    // Connections carried over from the healthy set without a ping
    reused_healthy: Vec<BackendName>,
    // Connections opened by this cycle
    created: Vec<Arc<PooledConnection<C>>>,
}

fn refresh_connections<C>(
    inner: &PoolInner<C>,
    token: &CancelToken,
    initial: bool,
) -> Result<(), Error>
where
    C: Connection,
{
    let _cycle = inner
        .cycle_lock
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    inner.protected_data.write().refreshing = true;

    let result = run_cycle(inner, token, initial);
    if result.is_err() {
        inner.protected_data.write().refreshing = false;
    }
    result
}

fn run_cycle<C>(
    inner: &PoolInner<C>,
    token: &CancelToken,
    initial: bool,
) -> Result<(), Error>
where
    C: Connection,
{
    let members = resolve_members(inner, token, initial)?;
    // A cycle that runs out of time keeps the current state; probing with
    // no time left would mark every member unreachable.
    token.check()?;

    let probed = probe::probe_backends(
        &*inner.prober,
        &members,
        inner.probe_timeout,
        token,
        &inner.log,
    );
    token.check()?;

    let online: Vec<(Backend, NodeStatus)> = probed
        .into_iter()
        .filter(|(_, status)| *status != NodeStatus::Unreachable)
        .collect();
    debug!(inner.log, "probed members";
        "members" => members.len(), "online" => online.len());

    // Every member is classified by now, so only cancellation discards the
    // connections opened below.
    let plan = plan_connections(inner, &online);
    if token.is_cancelled() {
        plan.created
            .into_iter()
            .for_each(|conn| close_connection(&inner.log, conn));
        return Err(Error::Cancelled);
    }

    commit(inner, plan)
        .into_iter()
        .for_each(|conn| close_connection(&inner.log, conn));
    Ok(())
}

// Query the directory. Outside of the initial cycle a failure falls back to
// the last good listing.
fn resolve_members<C>(
    inner: &PoolInner<C>,
    token: &CancelToken,
    initial: bool,
) -> Result<Vec<Backend>, Error>
where
    C: Connection,
{
    let mut last_members = inner
        .last_members
        .lock()
        .unwrap_or_else(PoisonError::into_inner);

    let resolved = inner.resolver.resolve(token).and_then(|members| {
        if members.is_empty() {
            Err(Error::NoMembers)
        } else {
            Ok(dedup_members(members))
        }
    });

    match resolved {
        Ok(members) => {
            *last_members = members.clone();
            Ok(members)
        }
        Err(e) if initial => {
            error!(inner.log, "failed to resolve cluster members"; "err" => %e);
            Err(e)
        }
        Err(e) => {
            error!(inner.log, "failed to resolve cluster members, using cached list";
                "err" => %e, "cached" => last_members.len());
            Ok(last_members.clone())
        }
    }
}

// Keep the last entry for each member name, in listing order.
fn dedup_members(members: Vec<Backend>) -> Vec<Backend> {
    let mut last_index = HashMap::with_capacity(members.len());
    members.iter().enumerate().for_each(|(i, b)| {
        last_index.insert(b.name.clone(), i);
    });
    members
        .into_iter()
        .enumerate()
        .filter(|(i, b)| last_index.get(&b.name) == Some(i))
        .map(|(_, b)| b)
        .collect()
}

fn plan_connections<C>(
    inner: &PoolInner<C>,
    online: &[(Backend, NodeStatus)],
) -> RefreshPlan<C>
where
    C: Connection,
{
    // (connection, was healthy)
    let existing: HashMap<BackendName, (Arc<PooledConnection<C>>, bool)> = {
        let connection_data = inner.protected_data.read();
        connection_data
            .healthy
            .iter()
            .map(|(n, c)| (n.clone(), (Arc::clone(c), true)))
            .chain(
                connection_data
                    .unhealthy
                    .iter()
                    .map(|(n, c)| (n.clone(), (Arc::clone(c), false))),
            )
            .collect()
    };

    let mut plan = RefreshPlan {
        healthy: BTreeMap::new(),
        unhealthy: BTreeMap::new(),
        leader: None,
        reused_healthy: Vec::new(),
        created: Vec::new(),
    };

    for (backend, status) in online {
        let name = backend.name.clone();
        let key = backend::srv_key(backend);

        let (conn, healthy) = match existing.get(&name) {
            Some((conn, was_healthy)) if conn.key == key => {
                let healthy = if *was_healthy {
                    !has_broken(conn)
                } else {
                    revalidate(conn, &inner.log)
                };
                if *was_healthy && healthy {
                    plan.reused_healthy.push(name.clone());
                }
                (Arc::clone(conn), healthy)
            }
            previous => {
                if previous.is_some() {
                    info!(inner.log, "connection string changed"; "node" => %name);
                }
                let (conn, healthy) = open_connection(inner, backend, key);
                plan.created.push(Arc::clone(&conn));
                (conn, healthy)
            }
        };

        if *status == NodeStatus::Leader {
            if !healthy {
                warn!(inner.log, "leader connection is not healthy"; "node" => %name);
            } else {
                if let Some(previous) = &plan.leader {
                    error!(inner.log, "detected more than one leader";
                        "previous" => %previous, "node" => %name);
                }
                plan.leader = Some(name.clone());
            }
        }

        if healthy {
            plan.healthy.insert(name, conn);
        } else {
            plan.unhealthy.insert(name, conn);
        }
    }

    plan
}

fn open_connection<C>(
    inner: &PoolInner<C>,
    backend: &Backend,
    key: BackendKey,
) -> (Arc<PooledConnection<C>>, bool)
where
    C: Connection,
{
    info!(inner.log, "connecting to member"; "node" => %backend.name);
    let mut conn = (inner.create_connection)(backend);
    let healthy = match conn.connect() {
        Ok(()) => {
            let valid = conn.is_valid();
            if !valid {
                warn!(inner.log, "initial ping failed"; "node" => %backend.name);
            }
            valid
        }
        Err(e) => {
            warn!(inner.log, "failed to connect to member";
                "node" => %backend.name, "err" => %e);
            false
        }
    };
    let conn = PooledConnection::new(backend.name.clone(), key, conn);
    (Arc::new(conn), healthy)
}

// A connection somebody is using is not broken as far as we can tell.
fn has_broken<C>(conn: &PooledConnection<C>) -> bool
where
    C: Connection,
{
    conn.try_lock().map(|c| c.has_broken()).unwrap_or(false)
}

// Ping an unhealthy connection, reconnecting it if the ping fails.
fn revalidate<C>(conn: &PooledConnection<C>, log: &Logger) -> bool
where
    C: Connection,
{
    let mut c = match conn.try_lock() {
        Some(c) => c,
        None => {
            debug!(log, "unhealthy connection still in use"; "node" => %conn.name);
            return false;
        }
    };
    if c.is_valid() {
        info!(log, "connection recovered"; "node" => %conn.name);
        return true;
    }
    if let Err(e) = c.connect() {
        warn!(log, "failed to reconnect to member";
            "node" => %conn.name, "err" => %e);
        return false;
    }
    c.is_valid()
}

// Install the plan and return the connections that are no longer referenced.
fn commit<C>(
    inner: &PoolInner<C>,
    mut plan: RefreshPlan<C>,
) -> Vec<Arc<PooledConnection<C>>>
where
    C: Connection,
{
    let mut connection_data = inner.protected_data.write();

    // A connection reported broken after it was planned as healthy stays
    // unhealthy until the next cycle pings it.
    let mut retrigger = false;
    for name in &plan.reused_healthy {
        if !connection_data.unhealthy.contains_key(name) {
            continue;
        }
        if let Some(conn) = plan.healthy.remove(name) {
            debug!(inner.log, "connection failed during refresh"; "node" => %name);
            plan.unhealthy.insert(name.clone(), conn);
            if plan.leader.as_ref() == Some(name) {
                plan.leader = None;
            }
            retrigger = true;
        }
    }

    let old_healthy = mem::replace(&mut connection_data.healthy, plan.healthy);
    let old_unhealthy =
        mem::replace(&mut connection_data.unhealthy, plan.unhealthy);

    let mut unreferenced = Vec::new();
    for (name, conn) in old_healthy.into_iter().chain(old_unhealthy) {
        let kept = connection_data
            .healthy
            .get(&name)
            .or_else(|| connection_data.unhealthy.get(&name))
            .map(|c| Arc::ptr_eq(c, &conn))
            .unwrap_or(false);
        if !kept {
            info!(inner.log, "dropping connection"; "node" => %name);
            unreferenced.push(conn);
        }
    }

    connection_data.leader = plan.leader;
    connection_data.version += 1;
    connection_data.refreshing = retrigger;

    debug!(inner.log, "committed refresh";
        "version" => connection_data.version,
        "leader" => ?connection_data.leader,
        "healthy" => connection_data.healthy.len(),
        "unhealthy" => connection_data.unhealthy.len());
    drop(connection_data);

    if retrigger {
        inner.refresh_check.request();
    }
    unreferenced
}

fn close_all<C>(inner: &PoolInner<C>, log: &Logger)
where
    C: Connection,
{
    let (healthy, unhealthy) = {
        let mut connection_data = inner.protected_data.write();
        connection_data.leader = None;
        (
            mem::take(&mut connection_data.healthy),
            mem::take(&mut connection_data.unhealthy),
        )
    };
    info!(log, "closing connections";
        "count" => healthy.len() + unhealthy.len());
    healthy
        .into_iter()
        .chain(unhealthy)
        .for_each(|(_, conn)| close_connection(log, conn));
}

fn close_connection<C>(log: &Logger, conn: Arc<PooledConnection<C>>)
where
    C: Connection,
{
    if let Some(mut c) = conn.try_lock() {
        close_locked(log, &conn.name, &mut *c);
        return;
    }
    // The connection is in use. Do not block on caller code; close it once
    // the caller lets go.
    let close_log = log.clone();
    let _close_thread = thread::spawn(move || {
        let mut c = conn.lock();
        close_locked(&close_log, &conn.name, &mut *c);
    });
}

fn close_locked<C>(log: &Logger, name: &BackendName, conn: &mut C)
where
    C: Connection,
{
    info!(log, "closing connection"; "node" => %name);
    if let Err(err) = conn.close() {
        warn!(log, "failed to close connection"; "node" => %name, "err" => %err);
    }
}
