// Copyright 2020 Joyent, Inc.

use std::net::TcpListener;
use std::time::Duration;

use url::Url;

use patroni_pool::backend::{self, Backend, Role};
use patroni_pool::cancel::CancelToken;
use patroni_pool::error::Error;
use patroni_pool::resolver::Resolver;

use patroni_pool_consul_resolver::common::test_data;
use patroni_pool_consul_resolver::common::util::{
    self, ConsulAgent, Response,
};
use patroni_pool_consul_resolver::{ConsulResolver, ConsulResolverConfig};

const PREFIX: &str = "service/batman/members/";

fn resolver(agent: Url) -> ConsulResolver {
    let config = ConsulResolverConfig {
        timeout: Some(Duration::from_secs(2)),
        log: Some(util::log_from_env(util::DEFAULT_LOG_LEVEL).unwrap()),
        ..ConsulResolverConfig::new(agent, "batman")
    };
    ConsulResolver::new(config).unwrap()
}

fn cluster_listing() -> Vec<u8> {
    test_data::listing(
        PREFIX,
        &[
            test_data::leader_pg0(),
            test_data::replica_pg1(),
            test_data::replica_pg2(),
        ],
    )
}

#[test]
fn resolve_lists_members() {
    let agent = ConsulAgent::start(vec![
        Response::ok(cluster_listing()),
        Response::ok(cluster_listing()),
    ]);
    let resolver = resolver(agent.url.clone());
    let token = CancelToken::new();

    let backends = resolver.resolve(&token).unwrap();
    let names: Vec<String> =
        backends.iter().map(|b| b.name.to_string()).collect();
    assert_eq!(names, vec!["pg-0", "pg-1", "pg-2"]);

    let roles: Vec<Role> = backends.iter().map(|b| b.role).collect();
    assert_eq!(roles, vec![Role::Leader, Role::Replica, Role::Replica]);
    assert_eq!(
        backends[0].api_url.as_str(),
        "http://10.77.77.28:8008/patroni"
    );

    // Listing the same data again yields the same backend keys
    let again = resolver.resolve(&token).unwrap();
    let keys = |b: &[Backend]| -> Vec<_> { b.iter().map(backend::srv_key).collect() };
    assert_eq!(keys(&backends), keys(&again));
    assert_eq!(keys(&backends)[0], test_data::leader_pg0().key());

    assert_eq!(
        agent.requests(),
        vec![
            "GET /v1/kv/service/batman/members/?recurse=true HTTP/1.1";
            2
        ]
    );
}

#[test]
fn missing_prefix_is_no_members() {
    let agent = ConsulAgent::start(vec![Response::status(404)]);
    let resolver = resolver(agent.url.clone());

    match resolver.resolve(&CancelToken::new()) {
        Err(Error::NoMembers) => (),
        other => panic!("unexpected result: {:?}", other),
    }
}

#[test]
fn agent_errors_are_resolver_errors() {
    let agent = ConsulAgent::start(vec![
        Response::status(500),
        Response::ok(b"<html>".to_vec()),
    ]);
    let resolver = resolver(agent.url.clone());

    for _ in 0..2 {
        match resolver.resolve(&CancelToken::new()) {
            Err(Error::ResolverError(_)) => (),
            other => panic!("unexpected result: {:?}", other),
        }
    }
}

#[test]
fn unreachable_agent_is_resolver_error() {
    // Bind and drop a listener to find a port that refuses connections.
    let addr = TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap();
    let resolver =
        resolver(Url::parse(&format!("http://{}", addr)).unwrap());

    match resolver.resolve(&CancelToken::new()) {
        Err(Error::ResolverError(_)) => (),
        other => panic!("unexpected result: {:?}", other),
    }
}

#[test]
fn cancelled_token_skips_request() {
    let agent = ConsulAgent::start(vec![Response::ok(cluster_listing())]);
    let resolver = resolver(agent.url.clone());

    let token = CancelToken::new();
    token.cancel();
    match resolver.resolve(&token) {
        Err(Error::Cancelled) => (),
        other => panic!("unexpected result: {:?}", other),
    }
    assert!(agent.requests().is_empty());
}
