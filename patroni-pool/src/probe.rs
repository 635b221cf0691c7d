// Copyright 2020 Joyent, Inc.

//! Role probing.
//!
//! The membership directory can lag behind the cluster: after a failover it
//! may still advertise the old leader for a while. Before the pool trusts a
//! member's role it asks the member itself, using the Patroni REST API
//! health endpoints. `GET /master` answers 200 only on the leader and `GET
//! /replica` answers 200 only on a running replica; both answer 503
//! otherwise.

use std::thread;
use std::time::Duration;

use reqwest::blocking::Client;
use slog::{debug, warn, Logger};

use crate::backend::{Backend, Role};
use crate::cancel::CancelToken;
use crate::error::Error;

/// HTTP 200.
pub const STATUS_OK: u16 = 200;
/// HTTP 503, returned by Patroni when the member does not hold the role that
/// was asked for.
pub const STATUS_SERVICE_UNAVAILABLE: u16 = 503;

/// The outcome of probing one member.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum NodeStatus {
    Leader,
    Replica,
    Unreachable,
}

impl From<Role> for NodeStatus {
    fn from(role: Role) -> Self {
        match role {
            Role::Leader => NodeStatus::Leader,
            Role::Replica => NodeStatus::Replica,
        }
    }
}

/// Issues a single role check against a member and returns the HTTP status
/// code. Transport failures, including timeouts, are errors.
pub trait RoleProber: Send + Sync {
    fn get_status(
        &self,
        backend: &Backend,
        role: Role,
        timeout: Duration,
    ) -> Result<u16, Error>;
}

/// A `RoleProber` that talks to the Patroni REST API over HTTP.
#[derive(Clone, Debug)]
pub struct HttpRoleProber {
    client: Client,
}

impl HttpRoleProber {
    pub fn new() -> Result<Self, Error> {
        let client = Client::builder()
            .build()
            .map_err(|e| Error::ProbeError(e.to_string()))?;
        Ok(HttpRoleProber { client })
    }
}

impl RoleProber for HttpRoleProber {
    fn get_status(
        &self,
        backend: &Backend,
        role: Role,
        timeout: Duration,
    ) -> Result<u16, Error> {
        let url = backend.role_url(role);
        self.client
            .get(url)
            .timeout(timeout)
            .send()
            .map(|resp| resp.status().as_u16())
            .map_err(|e| Error::ProbeError(e.to_string()))
    }
}

/// Classify a member by asking the endpoint that matches its role hint.
///
/// A 200 confirms the hint. A 503 means the member does not hold the hinted
/// role right now, which happens when a failover lands between the directory
/// listing and the probe, so the other role's endpoint is checked exactly
/// once. Anything else makes the member unreachable for this cycle.
pub fn check_node_status(
    prober: &dyn RoleProber,
    backend: &Backend,
    timeout: Duration,
    log: &Logger,
) -> NodeStatus {
    let mut role = backend.role;
    let mut cross_checked = false;
    loop {
        match prober.get_status(backend, role, timeout) {
            Ok(STATUS_OK) => return role.into(),
            Ok(STATUS_SERVICE_UNAVAILABLE) if !cross_checked => {
                debug!(log, "role not confirmed, checking other role";
                    "node" => %backend.name, "role" => %role);
                cross_checked = true;
                role = role.other();
            }
            Ok(STATUS_SERVICE_UNAVAILABLE) => {
                warn!(log, "member unavailable as both leader and replica";
                    "node" => %backend.name);
                return NodeStatus::Unreachable;
            }
            Ok(status) => {
                warn!(log, "unexpected role probe status";
                    "node" => %backend.name, "status" => status);
                return NodeStatus::Unreachable;
            }
            Err(e) => {
                warn!(log, "failed to probe member";
                    "node" => %backend.name, "role" => %role, "err" => %e);
                return NodeStatus::Unreachable;
            }
        }
    }
}

/// Probe every member in parallel and return each member paired with its
/// status, in input order. Each probe is bounded by `timeout` and by the
/// token's deadline; the call returns only once every probe has finished.
pub fn probe_backends(
    prober: &dyn RoleProber,
    backends: &[Backend],
    timeout: Duration,
    token: &CancelToken,
    log: &Logger,
) -> Vec<(Backend, NodeStatus)> {
    let timeout = token.bound(timeout);
    if timeout == Duration::from_millis(0) {
        warn!(log, "no time left to probe members");
        return backends
            .iter()
            .map(|b| (b.clone(), NodeStatus::Unreachable))
            .collect();
    }

    thread::scope(|s| {
        let probes: Vec<_> = backends
            .iter()
            .map(|b| {
                s.spawn(move || check_node_status(prober, b, timeout, log))
            })
            .collect();

        backends
            .iter()
            .zip(probes)
            .map(|(b, probe)| {
                let status = probe.join().unwrap_or(NodeStatus::Unreachable);
                (b.clone(), status)
            })
            .collect()
    })
}
