//
// Copyright 2020 Joyent, Inc
//

use serde_json::{json, Value as SerdeJsonValue};
use url::Url;

use patroni_pool::backend::{self, Backend, BackendKey, Role};

//
// Return a vector of mock Patroni member data, given the passed-in ip and
// role
//
pub fn json_vec(ip: &str, role: &str) -> Vec<u8> {
    //
    // Most of the data here isn't relevant, but real member data written by
    // Patroni will include it, so we include it here.
    //
    format!(
        r#" {{
        "conn_url": "postgres://{ip}:5432/postgres",
        "api_url": "http://{ip}:8008/patroni",
        "state": "running",
        "role": "{role}",
        "version": "2.1.4",
        "xlog_location": 50331968,
        "timeline": 1
    }}"#,
        ip = ip,
        role = role
    )
    .as_bytes()
    .to_vec()
}

///
/// Represents a valid member
///
#[derive(Clone)]
pub struct MemberData {
    name: String,
    vec: Vec<u8>,
    object: Backend,
}

impl MemberData {
    pub fn new(name: &str, ip: &str, role: &str) -> Self {
        let backend_role = match role {
            "master" => Role::Leader,
            _ => Role::Replica,
        };
        MemberData {
            name: name.to_string(),
            vec: json_vec(ip, role),
            object: Backend::new(
                name,
                Url::parse(&format!("http://{}:8008/patroni", ip))
                    .expect("Invalid api url"),
                Url::parse(&format!("postgres://{}:5432/postgres", ip))
                    .expect("Invalid conn url"),
                backend_role,
            ),
        }
    }

    //
    // The below functions provide convenient ways to convert the data to
    // various related types.
    //

    pub fn raw_vec(&self) -> Vec<u8> {
        self.vec.clone()
    }

    pub fn backend(&self) -> Backend {
        self.object.clone()
    }

    pub fn key(&self) -> BackendKey {
        backend::srv_key(&self.object)
    }

    pub fn kv_entry(&self, prefix: &str) -> SerdeJsonValue {
        raw_kv_entry(prefix, &self.name, &self.vec)
    }
}

///
/// One entry of a recursive Consul KV listing, as returned by the agent
///
pub fn raw_kv_entry(prefix: &str, name: &str, value: &[u8]) -> SerdeJsonValue {
    json!({
        "LockIndex": 0,
        "Key": format!("{}{}", prefix, name),
        "Flags": 0,
        "Value": base64::encode(value),
        "CreateIndex": 112,
        "ModifyIndex": 348
    })
}

///
/// A recursive listing of `prefix` holding `members`, including the folder
/// key some agents return for the prefix itself
///
pub fn listing(prefix: &str, members: &[MemberData]) -> Vec<u8> {
    let mut entries = vec![json!({
        "LockIndex": 0,
        "Key": prefix,
        "Flags": 0,
        "Value": null,
        "CreateIndex": 100,
        "ModifyIndex": 100
    })];
    entries.extend(members.iter().map(|m| m.kv_entry(prefix)));
    serde_json::to_vec(&entries).expect("Unserializable listing")
}

//
// The rest of the functions here provide mock data for use in tests.
//

pub fn leader_pg0() -> MemberData {
    MemberData::new("pg-0", "10.77.77.28", "master")
}

pub fn replica_pg1() -> MemberData {
    MemberData::new("pg-1", "10.77.77.21", "replica")
}

pub fn replica_pg2() -> MemberData {
    MemberData::new("pg-2", "10.77.77.22", "replica")
}

pub fn invalid_json_vec() -> Vec<u8> {
    b"foo".to_vec()
}

pub fn no_role_vec() -> Vec<u8> {
    br#" {
        "conn_url": "postgres://10.77.77.28:5432/postgres",
        "api_url": "http://10.77.77.28:8008/patroni",
        "state": "running",
        "version": "2.1.4"
    }"#
    .to_vec()
}

pub fn wrong_type_role_vec() -> Vec<u8> {
    br#" {
        "conn_url": "postgres://10.77.77.28:5432/postgres",
        "api_url": "http://10.77.77.28:8008/patroni",
        "state": "running",
        "role": 1,
        "version": "2.1.4"
    }"#
    .to_vec()
}

pub fn no_api_url_vec() -> Vec<u8> {
    br#" {
        "conn_url": "postgres://10.77.77.28:5432/postgres",
        "state": "running",
        "role": "master",
        "version": "2.1.4"
    }"#
    .to_vec()
}

pub fn invalid_api_url_vec() -> Vec<u8> {
    br#" {
        "conn_url": "postgres://10.77.77.28:5432/postgres",
        "api_url": "foo",
        "state": "running",
        "role": "master",
        "version": "2.1.4"
    }"#
    .to_vec()
}

pub fn no_conn_url_vec() -> Vec<u8> {
    br#" {
        "api_url": "http://10.77.77.28:8008/patroni",
        "state": "running",
        "role": "master",
        "version": "2.1.4"
    }"#
    .to_vec()
}

pub fn wrong_type_conn_url_vec() -> Vec<u8> {
    br#" {
        "conn_url": true,
        "api_url": "http://10.77.77.28:8008/patroni",
        "state": "running",
        "role": "master",
        "version": "2.1.4"
    }"#
    .to_vec()
}
