// Copyright 2020 Joyent, Inc.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use slog::{o, Drain, Logger};
use url::Url;

use patroni_pool::backend::{Backend, Role};
use patroni_pool::cancel::CancelToken;
use patroni_pool::connection::Connection;
use patroni_pool::connection_pool::types::ConnectionPoolOptions;
use patroni_pool::connection_pool::ConnectionPool;
use patroni_pool::error::Error;
use patroni_pool::probe::{RoleProber, STATUS_OK, STATUS_SERVICE_UNAVAILABLE};
use patroni_pool::resolver::Resolver;

/// What a member's REST API answers to role probes.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Answer {
    Leader,
    Replica,
    Down,
}

impl From<Role> for Answer {
    fn from(role: Role) -> Self {
        match role {
            Role::Leader => Answer::Leader,
            Role::Replica => Answer::Replica,
        }
    }
}

#[derive(Default)]
struct ClusterState {
    members: Mutex<Vec<Backend>>,
    directory_down: AtomicBool,
    directory_delay: Mutex<Duration>,
    connect_delay: Mutex<Duration>,
    answers: Mutex<HashMap<String, Answer>>,
    db_down: Mutex<HashSet<String>>,
    next_id: AtomicUsize,
    closed: Mutex<Vec<usize>>,
}

/// A fake Patroni cluster. The directory listing, the role probe answers and
/// the reachability of each member's database can be changed at any time;
/// `FakeResolver`, `FakeProber` and `DummyConnection` all read from it.
#[derive(Clone, Default)]
pub struct Cluster(Arc<ClusterState>);

pub fn backend(name: &str, role: Role) -> Backend {
    Backend::new(
        name,
        Url::parse(&format!("http://{}:8008/patroni", name)).unwrap(),
        Url::parse(&format!("postgres://{}:5432/postgres", name)).unwrap(),
        role,
    )
}

impl Cluster {
    pub fn new() -> Self {
        Cluster::default()
    }

    /// A cluster with `leader` leading and every name in `replicas`
    /// replicating.
    pub fn with_members(leader: &str, replicas: &[&str]) -> Self {
        let cluster = Cluster::new();
        cluster.add(leader, Role::Leader);
        replicas.iter().for_each(|r| cluster.add(r, Role::Replica));
        cluster
    }

    pub fn add(&self, name: &str, role: Role) {
        self.0.members.lock().unwrap().push(backend(name, role));
        self.set_answer(name, role.into());
    }

    pub fn remove(&self, name: &str) {
        self.0
            .members
            .lock()
            .unwrap()
            .retain(|b| b.name.as_ref() != name);
    }

    pub fn set_conn_url(&self, name: &str, conn_url: &str) {
        self.0
            .members
            .lock()
            .unwrap()
            .iter_mut()
            .filter(|b| b.name.as_ref() == name)
            .for_each(|b| b.conn_url = Url::parse(conn_url).unwrap());
    }

    pub fn set_answer(&self, name: &str, answer: Answer) {
        self.0
            .answers
            .lock()
            .unwrap()
            .insert(name.to_string(), answer);
    }

    pub fn set_directory_down(&self, down: bool) {
        self.0.directory_down.store(down, Ordering::SeqCst);
    }

    /// Make every directory query take `delay` before answering.
    pub fn set_directory_delay(&self, delay: Duration) {
        *self.0.directory_delay.lock().unwrap() = delay;
    }

    /// Make every connection attempt take `delay`.
    pub fn set_connect_delay(&self, delay: Duration) {
        *self.0.connect_delay.lock().unwrap() = delay;
    }

    pub fn set_db_down(&self, name: &str, down: bool) {
        let mut db_down = self.0.db_down.lock().unwrap();
        if down {
            db_down.insert(name.to_string());
        } else {
            db_down.remove(name);
        }
    }

    fn is_db_down(&self, name: &str) -> bool {
        self.0.db_down.lock().unwrap().contains(name)
    }

    /// The number of connections created so far.
    pub fn created(&self) -> usize {
        self.0.next_id.load(Ordering::SeqCst)
    }

    /// The ids of the connections closed so far, in closing order.
    pub fn closed(&self) -> Vec<usize> {
        self.0.closed.lock().unwrap().clone()
    }

    pub fn resolver(&self) -> FakeResolver {
        FakeResolver(self.clone())
    }

    pub fn prober(&self) -> FakeProber {
        FakeProber(self.clone())
    }

    pub fn connection_creator(
        &self,
    ) -> impl Fn(&Backend) -> DummyConnection + Send + Sync + 'static {
        let cluster = self.clone();
        move |b: &Backend| DummyConnection::new(&cluster, b)
    }
}

pub struct FakeResolver(Cluster);

impl Resolver for FakeResolver {
    fn resolve(&self, _token: &CancelToken) -> Result<Vec<Backend>, Error> {
        let state = &(self.0).0;
        let delay = *state.directory_delay.lock().unwrap();
        thread::sleep(delay);
        if state.directory_down.load(Ordering::SeqCst) {
            return Err(Error::ResolverError("connection refused".into()));
        }
        Ok(state.members.lock().unwrap().clone())
    }
}

pub struct FakeProber(Cluster);

impl RoleProber for FakeProber {
    fn get_status(
        &self,
        backend: &Backend,
        role: Role,
        _timeout: Duration,
    ) -> Result<u16, Error> {
        let answer = (self.0)
            .0
            .answers
            .lock()
            .unwrap()
            .get(backend.name.as_ref())
            .copied()
            .unwrap_or(Answer::Down);
        match (answer, role) {
            (Answer::Down, _) => {
                Err(Error::ProbeError("connection refused".into()))
            }
            (Answer::Leader, Role::Leader) => Ok(STATUS_OK),
            (Answer::Replica, Role::Replica) => Ok(STATUS_OK),
            _ => Ok(STATUS_SERVICE_UNAVAILABLE),
        }
    }
}

pub struct DummyConnection {
    pub id: usize,
    pub node: String,
    pub conn_url: String,
    pub connected: bool,
    cluster: Cluster,
}

impl DummyConnection {
    fn new(cluster: &Cluster, b: &Backend) -> Self {
        DummyConnection {
            id: cluster.0.next_id.fetch_add(1, Ordering::SeqCst),
            node: b.name.to_string(),
            conn_url: b.conn_url.to_string(),
            connected: false,
            cluster: cluster.clone(),
        }
    }
}

impl Connection for DummyConnection {
    type Error = Error;

    fn connect(&mut self) -> Result<(), Error> {
        let delay = *self.cluster.0.connect_delay.lock().unwrap();
        thread::sleep(delay);
        if self.cluster.is_db_down(&self.node) {
            return Err(Error::ConnectionError("connection refused".into()));
        }
        self.connected = true;
        Ok(())
    }

    fn is_valid(&mut self) -> bool {
        self.connected && !self.cluster.is_db_down(&self.node)
    }

    fn has_broken(&self) -> bool {
        !self.connected
    }

    fn close(&mut self) -> Result<(), Error> {
        self.connected = false;
        self.cluster.0.closed.lock().unwrap().push(self.id);
        Ok(())
    }
}

pub fn log() -> Logger {
    let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
    Logger::root(
        Mutex::new(slog_term::FullFormat::new(plain).build()).fuse(),
        o!("build-id" => "0.1.0"),
    )
}

/// Options with the refresh timer effectively disabled, so tests drive
/// refresh cycles through `ConnectionPool::refresh`.
pub fn manual_options() -> ConnectionPoolOptions {
    ConnectionPoolOptions {
        update_interval: Some(Duration::from_secs(3600)),
        log: Some(log()),
        ..Default::default()
    }
}

pub fn start_pool(
    cluster: &Cluster,
    cpo: ConnectionPoolOptions,
) -> ConnectionPool<DummyConnection> {
    ConnectionPool::with_prober(
        cpo,
        cluster.resolver(),
        cluster.prober(),
        cluster.connection_creator(),
    )
    .unwrap()
}

/// Poll `cond` until it holds or `timeout` passes.
pub fn wait_for<F>(timeout: Duration, mut cond: F) -> bool
where
    F: FnMut() -> bool,
{
    let start = Instant::now();
    while start.elapsed() < timeout {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    cond()
}
