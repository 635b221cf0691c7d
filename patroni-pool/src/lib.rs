// Copyright 2020 Joyent, Inc.

//! A leader-aware connection pool for Patroni managed Postgres clusters
//!
//! A Patroni cluster is a set of Postgres members, one of which is the leader
//! and accepts writes while the others replicate from it. Patroni records
//! the members in a distributed configuration store and moves the leader
//! role around on failure. This crate keeps one connection per reachable
//! member, knows which member currently leads, and hands out connections
//! accordingly. It relies on two traits: the
//! [`Resolver`](resolver/trait.Resolver.html) trait and the
//! [`Connection`](connection/trait.Connection.html) trait.
//!
//! ## Resolvers
//!
//! A *resolver* lists the members of the cluster as recorded in the
//! membership directory: their names, the URL of their Patroni REST API,
//! their Postgres connection string and the role the directory believes they
//! hold. The `patroni-pool-consul-resolver` crate reads the member keys
//! Patroni writes to Consul.
//!
//! ## Connections
//!
//! A *connection* is anything that can be opened, pinged and closed. Users
//! of the pool also provide a function that builds an unopened connection
//! for a [`Backend`](backend/struct.Backend.html):
//! ```rust,ignore
//! Fn(&Backend) -> C + Send + Sync + 'static
//! where C: Connection
//! ```
//! This is where application configuration such as credentials or the
//! database name is captured. The `patroni-pool-postgres-connection` crate
//! provides an implementation over the synchronous `postgres` client.
//!
//! ## Refreshing
//!
//! The directory can lag behind the cluster, so the pool never takes the
//! recorded role on trust. Every `update_interval` a refresh cycle lists the
//! members, asks each one over its REST API whether it is the leader or a
//! replica, opens connections to members seen for the first time, and drops
//! connections to members that left or stopped answering. Cycles never run
//! concurrently, and the pool's state is replaced in one step at the end of
//! a cycle, so callers always see a consistent view: the leader, if known,
//! always has a healthy connection.
//!
//! If the directory cannot be reached the cycle carries on with the last
//! member list it saw.
//!
//! ## Handles and error reporting
//!
//! `write_conn` returns a handle to the leader's connection and `read_conn`
//! a handle to the leader or, failing that, any healthy replica. Neither
//! waits on I/O: if nothing suitable is known they return `None`. After
//! using a handle the caller passes the outcome to `report_err`. An error
//! that means the connection broke (see
//! [`FatalErrors`](error/struct.FatalErrors.html)) moves the member out of
//! the healthy set at once and starts a refresh early. Handles carry the
//! version of the pool state they were issued from, and reports through a
//! handle from an older version are ignored.
//!
//! [`RetryHelper`](retry/struct.RetryHelper.html) wraps this protocol for
//! callers who would rather retry than handle missing connections
//! themselves.
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::{Arc, Mutex};
//!
//! use slog::{o, Drain, Logger};
//!
//! use patroni_pool::cancel::CancelToken;
//! use patroni_pool::connection_pool::ConnectionPool;
//! use patroni_pool::connection_pool::types::ConnectionPoolOptions;
//! use patroni_pool::retry::RetryHelper;
//!
//! let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
//! let log = Logger::root(
//!     Mutex::new(slog_term::FullFormat::new(plain).build()).fuse(),
//!     o!("build-id" => "0.1.0"),
//! );
//!
//! let pool_opts = ConnectionPoolOptions {
//!     log: Some(log),
//!     ..Default::default()
//! };
//!
//! let pool = ConnectionPool::new(pool_opts, resolver, connection_creator)?;
//! let helper = RetryHelper::new(Arc::new(pool));
//!
//! let token = CancelToken::with_timeout(Duration::from_secs(5));
//! let rows = helper.do_read(&token, |_token, client| {
//!     client.query("SELECT name FROM accounts", &[])
//! })?;
//! ```

#![allow(missing_docs)]

pub mod backend;
pub mod cancel;
pub mod connection;
pub mod connection_pool;
pub mod error;
pub mod probe;
pub mod resolver;
pub mod retry;
