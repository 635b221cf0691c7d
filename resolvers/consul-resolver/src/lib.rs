//
// Copyright 2020 Joyent, Inc.
//
// THEORY STATEMENT -- READ THIS FIRST!
//
// This library has just one task: list the members of a Patroni cluster as
// Patroni records them in the Consul key/value store. Every Patroni member
// keeps a key of the form
//
//     <namespace>/<cluster key>/members/<member name>
//
// whose value is a JSON object describing the member. One recursive GET of
// the members prefix returns every key, with values base64 encoded. The code
// structure looks a little like this:
//
// ConsulResolver::resolve()
//   -> Issues the recursive GET against the local Consul agent.
//   -> Calls parse_listing() on the response body.
//      -> For every key below the members prefix, calls process_value() to
//         turn the member's JSON into a Backend. Members that cannot be
//         parsed are logged and skipped.
//
// Roles in the member data are only hints; the connection pool confirms them
// against each member's REST API.
//
// Note that this file also contains unit tests for process_value() and
// parse_listing().
//

use std::fmt;
use std::fmt::Debug;
use std::sync::Mutex;
use std::time::Duration;

use clap::{crate_name, crate_version};
use reqwest::blocking::Client;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value as SerdeJsonValue;
use slog::Result as SlogResult;
use slog::Value as SlogValue;
use slog::{debug, o, warn, Drain, Key, LevelFilter, Logger, Record, Serializer};
use url::Url;

use patroni_pool::backend::{Backend, Role};
use patroni_pool::cancel::CancelToken;
use patroni_pool::error::Error;
use patroni_pool::resolver::Resolver;

pub mod common;

///
/// The Consul KV namespace Patroni uses unless configured otherwise.
///
pub const DEFAULT_NAMESPACE: &str = "service";

///
/// Timeout for one directory listing. The caller's `CancelToken` deadline
/// still applies if it is sooner.
///
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);

//
// An error type to be used internally.
//
#[derive(Clone, Debug, PartialEq)]
enum ResolverError {
    InvalidListing,
    InvalidMemberJson,
    InvalidMemberData(MemberDataField),
    MissingMemberData(MemberDataField),
}

#[derive(Clone, Debug, PartialEq)]
enum MemberDataField {
    ApiUrl,
    ConnUrl,
    Role,
}

impl fmt::Display for MemberDataField {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            MemberDataField::ApiUrl => fmt::Display::fmt(&String::from("api_url"), fmt),
            MemberDataField::ConnUrl => fmt::Display::fmt(&String::from("conn_url"), fmt),
            MemberDataField::Role => fmt::Display::fmt(&String::from("role"), fmt),
        }
    }
}

impl fmt::Display for ResolverError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ResolverError::InvalidListing => {
                fmt::Display::fmt(&String::from("invalid consul kv listing"), fmt)
            }
            ResolverError::InvalidMemberJson => {
                fmt::Display::fmt(&String::from("member data is not valid json"), fmt)
            }
            ResolverError::InvalidMemberData(field) => {
                write!(fmt, "invalid member field: {}", field)
            }
            ResolverError::MissingMemberData(field) => {
                write!(fmt, "missing member field: {}", field)
            }
        }
    }
}

///
/// A serializable type to be used in log entries. Wraps around any type that
/// implements Debug and uses the Debug representation of the type as the
/// serialized output.
///
struct LogItem<T>(T)
where
    T: Debug;

impl<T: Debug> SlogValue for LogItem<T> {
    fn serialize(
        &self,
        _rec: &Record,
        key: Key,
        serializer: &mut dyn Serializer,
    ) -> SlogResult {
        serializer.emit_str(key, &format!("{:?}", self.0))
    }
}

//
// One entry of a recursive Consul KV listing. Folder keys have no value.
//
#[derive(Debug, Deserialize)]
struct KvEntry {
    #[serde(rename = "Key")]
    key: String,
    #[serde(rename = "Value")]
    value: Option<String>,
}

#[derive(Clone, Debug)]
pub struct ConsulResolverConfig {
    ///
    /// The Consul agent's HTTP API, *e.g.* `http://127.0.0.1:8500`
    ///
    pub agent: Url,
    ///
    /// The Patroni cluster name (the `scope` in Patroni's configuration).
    /// Required.
    ///
    pub cluster_key: String,
    ///
    /// The Patroni namespace. Defaults to `DEFAULT_NAMESPACE`.
    ///
    pub namespace: Option<String>,
    ///
    /// Timeout for one listing. Defaults to `DEFAULT_TIMEOUT`.
    ///
    pub timeout: Option<Duration>,
    ///
    /// If none is provided the resolver logs bunyan formatted records to
    /// stdout at info level.
    ///
    pub log: Option<Logger>,
}

impl ConsulResolverConfig {
    pub fn new<S: Into<String>>(agent: Url, cluster_key: S) -> Self {
        ConsulResolverConfig {
            agent,
            cluster_key: cluster_key.into(),
            namespace: None,
            timeout: None,
            log: None,
        }
    }
}

#[derive(Debug)]
pub struct ConsulResolver {
    ///
    /// The recursive listing URL of the cluster's members prefix
    ///
    members_url: Url,
    ///
    /// The KV key prefix under which each member has one key, *e.g.*
    /// "service/batman/members/"
    ///
    key_prefix: String,
    timeout: Duration,
    client: Client,
    ///
    /// The ConsulResolver's root log
    ///
    log: Logger,
}

impl ConsulResolver {
    ///
    /// Creates a new ConsulResolver instance. Fails if the cluster key is
    /// empty or the listing URL cannot be built from the agent URL.
    ///
    pub fn new(config: ConsulResolverConfig) -> Result<Self, Error> {
        let cluster_key = config.cluster_key.trim_matches('/');
        if cluster_key.is_empty() {
            return Err(Error::InvalidOption(
                "cluster_key must not be empty".into(),
            ));
        }
        let namespace = config
            .namespace
            .as_deref()
            .unwrap_or(DEFAULT_NAMESPACE)
            .trim_matches('/');

        let key_prefix = if namespace.is_empty() {
            format!("{}/members/", cluster_key)
        } else {
            format!("{}/{}/members/", namespace, cluster_key)
        };

        let mut members_url = config
            .agent
            .join(&format!("v1/kv/{}", key_prefix))
            .map_err(|e| Error::InvalidOption(format!("agent: {}", e)))?;
        members_url.set_query(Some("recurse=true"));

        let client = Client::builder()
            .build()
            .map_err(|e| Error::ResolverError(e.to_string()))?;

        //
        // Use the passed-in logger, or create a new logger if the caller did
        // not pass one in
        //
        let log = config.log.unwrap_or_else(|| {
            Logger::root(
                Mutex::new(LevelFilter::new(
                    slog_bunyan::with_name(crate_name!(), std::io::stdout())
                        .build(),
                    slog::Level::Info,
                ))
                .fuse(),
                o!("build-id" => crate_version!()),
            )
        });

        Ok(ConsulResolver {
            members_url,
            key_prefix,
            timeout: config.timeout.unwrap_or(DEFAULT_TIMEOUT),
            client,
            log,
        })
    }

    pub fn members_url(&self) -> &Url {
        &self.members_url
    }
}

//
// Returns the member name for a key in the listing, or None for keys that do
// not name a member directly below the prefix (such as the prefix itself).
//
fn member_name<'a>(prefix: &str, key: &'a str) -> Option<&'a str> {
    let key = key.strip_prefix(prefix)?;
    if key.is_empty() || key.contains('/') {
        return None;
    }
    Some(key)
}

fn parse_role(role: &str) -> Role {
    match role {
        "master" | "primary" | "leader" => Role::Leader,
        _ => Role::Replica,
    }
}

//
// Parse a URL field of the member data. We expect the json field to exist,
// and return an error if it doesn't, or if it is of the wrong type.
//
fn url_field(
    v: &SerdeJsonValue,
    field: MemberDataField,
    name: &str,
) -> Result<Url, ResolverError> {
    match &v[name] {
        SerdeJsonValue::String(s) => {
            Url::parse(s).map_err(|_| ResolverError::InvalidMemberData(field))
        }
        SerdeJsonValue::Null => Err(ResolverError::MissingMemberData(field)),
        _ => Err(ResolverError::InvalidMemberData(field)),
    }
}

///
/// Turn the value of one member key into a Backend.
///
fn process_value(name: &str, value: &[u8]) -> Result<Backend, ResolverError> {
    // Parse the bytes into a json object
    let v: SerdeJsonValue = match serde_json::from_slice(value) {
        Ok(v) => v,
        Err(_) => {
            return Err(ResolverError::InvalidMemberJson);
        }
    };
    if !v.is_object() {
        return Err(ResolverError::InvalidMemberJson);
    }

    let api_url = url_field(&v, MemberDataField::ApiUrl, "api_url")?;
    let conn_url = url_field(&v, MemberDataField::ConnUrl, "conn_url")?;

    //
    // A member without a role is treated as a replica; the probe decides
    // anyway.
    //
    let role = match &v["role"] {
        SerdeJsonValue::String(s) => parse_role(s),
        SerdeJsonValue::Null => Role::Replica,
        _ => {
            return Err(ResolverError::InvalidMemberData(MemberDataField::Role));
        }
    };

    Ok(Backend::new(name, api_url, conn_url, role))
}

///
/// Parse a recursive listing of the members prefix. Malformed members are
/// logged and skipped; a body that is not a listing at all is an error.
///
fn parse_listing(
    prefix: &str,
    body: &[u8],
    log: &Logger,
) -> Result<Vec<Backend>, ResolverError> {
    let entries: Vec<KvEntry> = serde_json::from_slice(body)
        .map_err(|_| ResolverError::InvalidListing)?;

    let backends = entries
        .iter()
        .filter_map(|entry| {
            let name = member_name(prefix, &entry.key)?;
            let value = match &entry.value {
                Some(value) => value,
                None => {
                    warn!(log, "skipping member without data"; "member" => name);
                    return None;
                }
            };
            let raw = match base64::decode(value) {
                Ok(raw) => raw,
                Err(e) => {
                    warn!(log, "skipping member with undecodable data";
                        "member" => name, "err" => %e);
                    return None;
                }
            };
            match process_value(name, &raw) {
                Ok(backend) => Some(backend),
                Err(e) => {
                    warn!(log, "skipping malformed member";
                        "member" => name, "err" => %e);
                    None
                }
            }
        })
        .collect();
    Ok(backends)
}

impl Resolver for ConsulResolver {
    fn resolve(&self, token: &CancelToken) -> Result<Vec<Backend>, Error> {
        token.check()?;
        let timeout = token.bound(self.timeout);

        debug!(self.log, "listing cluster members";
            "url" => %self.members_url);
        let resp = self
            .client
            .get(self.members_url.clone())
            .timeout(timeout)
            .send()
            .map_err(|e| Error::ResolverError(e.to_string()))?;

        match resp.status() {
            StatusCode::OK => (),
            // Consul answers 404 for a prefix without keys
            StatusCode::NOT_FOUND => return Err(Error::NoMembers),
            status => {
                return Err(Error::ResolverError(format!(
                    "unexpected status: {}",
                    status
                )))
            }
        }

        let body = resp
            .bytes()
            .map_err(|e| Error::ResolverError(e.to_string()))?;
        let backends = parse_listing(&self.key_prefix, &body, &self.log)
            .map_err(|e| Error::ResolverError(e.to_string()))?;

        debug!(self.log, "listed cluster members";
            "members" => LogItem(
                backends.iter().map(|b| b.name.to_string()).collect::<Vec<_>>()
            ));
        Ok(backends)
    }
}
