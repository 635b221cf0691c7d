// Copyright 2020 Joyent, Inc.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{
    Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard,
    RwLockWriteGuard, TryLockError,
};
use std::time::Duration;

use slog::Logger;

use crate::backend::{BackendKey, BackendName};
use crate::connection::Connection;
use crate::error::FatalErrors;

/// A snapshot of the pool state, as returned by `ConnectionPool::get_stats`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ConnectionPoolStats {
    /// The version of the last committed refresh cycle.
    pub version: u64,
    /// The member currently used for writes, if any.
    pub leader: Option<BackendName>,
    /// Members with a healthy connection, in name order.
    pub healthy: Vec<BackendName>,
    /// Members that are online but whose connection is not usable, in name
    /// order.
    pub unhealthy: Vec<BackendName>,
}

/// The configuration options for a patroni connection pool. Every option has
/// a default, so `ConnectionPoolOptions::default()` is a valid configuration.
#[derive(Clone, Debug, Default)]
pub struct ConnectionPoolOptions {
    /// How often the pool refreshes its view of the cluster. A refresh is
    /// also started early when a connection fails. The default is 2 seconds.
    pub update_interval: Option<Duration>,
    /// Deadline for one background refresh cycle. A cycle still querying the
    /// directory or probing members when it passes is discarded. The default
    /// is 5 seconds.
    pub update_timeout: Option<Duration>,
    /// Deadline for the refresh cycle run while the pool is constructed.
    /// The default is 1 second.
    pub init_timeout: Option<Duration>,
    /// Timeout for each role probe. The default is 500 milliseconds.
    pub probe_timeout: Option<Duration>,
    /// Attempts made by `RetryHelper` before giving up. The default is 3.
    pub max_retries: Option<u32>,
    /// Wait between `RetryHelper` attempts. The default is 500
    /// milliseconds.
    pub inter_retry_delay: Option<Duration>,
    /// Errors that mean a connection is broken. Defaults to closed stream
    /// and end-of-file errors, see `FatalErrors::default`.
    pub fatal_errors: Option<FatalErrors>,
    /// An optional `slog` logger instance. If none is provided then the
    /// logging will fall back to using the
    /// [`slog-stdlog`](https://docs.rs/slog-stdlog) drain which is
    /// essentially the same as using the rust standard
    /// [`log`](https://docs.rs/log) crate.
    pub log: Option<Logger>,
}

/// The single connection the pool keeps for one cluster member.
pub struct PooledConnection<C> {
    pub name: BackendName,
    /// Fingerprint of the connection string this connection was opened
    /// with; a member whose key changes gets a new connection.
    pub key: BackendKey,
    connection: Mutex<C>,
}

impl<C> PooledConnection<C>
where
    C: Connection,
{
    pub fn new(name: BackendName, key: BackendKey, connection: C) -> Self {
        PooledConnection {
            name,
            key,
            connection: Mutex::new(connection),
        }
    }

    /// Lock the connection for exclusive use.
    pub fn lock(&self) -> MutexGuard<C> {
        self.connection.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Lock the connection only if no caller is using it.
    pub fn try_lock(&self) -> Option<MutexGuard<C>> {
        match self.connection.try_lock() {
            Ok(guard) => Some(guard),
            Err(TryLockError::Poisoned(e)) => Some(e.into_inner()),
            Err(TryLockError::WouldBlock) => None,
        }
    }
}

impl<C> fmt::Debug for PooledConnection<C> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("name", &self.name)
            .field("key", &self.key)
            .finish()
    }
}

// The authoritative pool state. Readers always see a consistent snapshot:
// refresh cycles replace the maps wholesale and error reports move a single
// entry, both under the write lock.
#[doc(hidden)]
pub struct ConnectionData<C> {
    pub version: u64,
    pub leader: Option<BackendName>,
    pub healthy: BTreeMap<BackendName, Arc<PooledConnection<C>>>,
    pub unhealthy: BTreeMap<BackendName, Arc<PooledConnection<C>>>,
    pub refreshing: bool,
}

impl<C> ConnectionData<C>
where
    C: Connection,
{
    #[doc(hidden)]
    pub fn new() -> Self {
        ConnectionData {
            version: 0,
            leader: None,
            healthy: BTreeMap::new(),
            unhealthy: BTreeMap::new(),
            refreshing: false,
        }
    }

    pub fn stats(&self) -> ConnectionPoolStats {
        ConnectionPoolStats {
            version: self.version,
            leader: self.leader.clone(),
            healthy: self.healthy.keys().cloned().collect(),
            unhealthy: self.unhealthy.keys().cloned().collect(),
        }
    }
}

impl<C> Default for ConnectionData<C>
where
    C: Connection,
{
    fn default() -> Self {
        Self::new()
    }
}

// Protected access to the pool state
#[doc(hidden)]
pub struct ProtectedData<C>(Arc<RwLock<ConnectionData<C>>>);

impl<C> ProtectedData<C>
where
    C: Connection,
{
    pub fn new(connection_data: ConnectionData<C>) -> Self {
        ProtectedData(Arc::new(RwLock::new(connection_data)))
    }

    pub fn read(&self) -> RwLockReadGuard<ConnectionData<C>> {
        self.0.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn write(&self) -> RwLockWriteGuard<ConnectionData<C>> {
        self.0.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<C> Clone for ProtectedData<C>
where
    C: Connection,
{
    fn clone(&self) -> ProtectedData<C> {
        ProtectedData(Arc::clone(&self.0))
    }
}

// Wakes the refresh worker. The flag is set by whoever requests a refresh
// and cleared by the worker when it picks the request up.
#[doc(hidden)]
#[derive(Debug, Default)]
pub struct RefreshCheck(Arc<(Mutex<bool>, Condvar)>);

impl RefreshCheck {
    #![allow(clippy::mutex_atomic)]
    pub fn new() -> Self {
        RefreshCheck(Arc::new((Mutex::new(false), Condvar::new())))
    }

    pub fn get_lock(&self) -> MutexGuard<bool> {
        (self.0).0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn condvar_wait<'a>(
        &self,
        g: MutexGuard<'a, bool>,
    ) -> MutexGuard<'a, bool> {
        let timeout = Duration::from_millis(500);
        (self.0)
            .1
            .wait_timeout(g, timeout)
            .unwrap_or_else(PoisonError::into_inner)
            .0
    }

    pub fn condvar_notify(&self) {
        (self.0).1.notify_one()
    }

    pub fn request(&self) {
        let mut refresh = self.get_lock();
        *refresh = true;
        self.condvar_notify();
    }
}

impl Clone for RefreshCheck {
    fn clone(&self) -> RefreshCheck {
        RefreshCheck(Arc::clone(&self.0))
    }
}

/// Sum type representing the current state of the connection pool. Possible
/// states are running, stopping, or stopped.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ConnectionPoolState {
    /// The pool is running and handing out connections.
    Running,
    /// The connection pool is shutting down its refresh worker and closing
    /// connections.
    Stopping,
    /// The connection pool is stopped and hands out no connections.
    Stopped,
}

impl fmt::Display for ConnectionPoolState {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConnectionPoolState::Running => String::from("running").fmt(fmt),
            ConnectionPoolState::Stopping => String::from("stopping").fmt(fmt),
            ConnectionPoolState::Stopped => String::from("stopped").fmt(fmt),
        }
    }
}
