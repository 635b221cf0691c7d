// Copyright 2020 Joyent, Inc.

use std::fmt;

use base64;
use derive_more::{Display, From, Into};
use sha1::Sha1;
use url::Url;

/// The name of a cluster member as registered by Patroni. Member names are
/// unique within a cluster and are the key for every per-node structure in
/// the pool.
#[derive(
    Clone, Debug, Display, Eq, From, Hash, Into, Ord, PartialOrd, PartialEq,
)]
pub struct BackendName(String);

impl From<&str> for BackendName {
    fn from(name: &str) -> Self {
        BackendName(name.to_string())
    }
}

impl AsRef<str> for BackendName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A base64 encoded fingerprint of the backend name and connection string.
/// Two backends with the same key can share a pooled connection.
#[derive(
    Clone, Debug, Display, Eq, From, Hash, Into, Ord, PartialOrd, PartialEq,
)]
pub struct BackendKey(String);

/// The role a cluster member advertises in the membership directory. This is
/// only a hint; the pool confirms it against the member's REST API before
/// trusting it.
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
pub enum Role {
    Leader,
    Replica,
}

impl Role {
    /// The path of the Patroni health endpoint that answers 200 when the
    /// member currently holds this role.
    pub fn endpoint(self) -> &'static str {
        match self {
            Role::Leader => "master",
            Role::Replica => "replica",
        }
    }

    pub fn other(self) -> Role {
        match self {
            Role::Leader => Role::Replica,
            Role::Replica => Role::Leader,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Role::Leader => String::from("leader").fmt(fmt),
            Role::Replica => String::from("replica").fmt(fmt),
        }
    }
}

/// One member of the cluster as seen by the membership directory.
#[derive(Clone, Debug, PartialEq)]
pub struct Backend {
    /// The Patroni member name.
    pub name: BackendName,
    /// The member's Patroni REST API, *e.g.* `http://10.0.0.1:8008/patroni`.
    pub api_url: Url,
    /// The member's postgres connection string, *e.g.*
    /// `postgres://10.0.0.1:5432/postgres`.
    pub conn_url: Url,
    /// The role hint recorded by the directory.
    pub role: Role,
}

impl Backend {
    pub fn new<N>(name: N, api_url: Url, conn_url: Url, role: Role) -> Self
    where
        N: Into<BackendName>,
    {
        Backend {
            name: name.into(),
            api_url,
            conn_url,
            role,
        }
    }

    /// Return the URL of the member's health endpoint for `role`. Patroni
    /// publishes `api_url` with a `/patroni` path, which is rewritten to
    /// `/master` or `/replica`.
    pub fn role_url(&self, role: Role) -> Url {
        let mut url = self.api_url.clone();
        url.set_path(role.endpoint());
        url.set_query(None);
        url
    }
}

/// Return a base64 encoded identifier based on the backend name and its
/// connection string. The role hint is deliberately excluded: a role change
/// alone must not invalidate a live connection.
pub fn srv_key(backend: &Backend) -> BackendKey {
    let mut sha1 = Sha1::new();
    sha1.update(backend.name.as_ref().as_bytes());
    sha1.update(b"||");
    sha1.update(backend.conn_url.as_str().as_bytes());

    base64::encode(&sha1.digest().bytes()).into()
}
