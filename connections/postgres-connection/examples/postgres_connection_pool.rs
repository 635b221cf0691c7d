/*
 * Copyright 2020 Joyent, Inc.
 */

//! A basic example that lists the members of the Patroni cluster "batman"
//! from a local Consul agent and runs a read and a write through the
//! connection pool.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use slog::{error, info, o, Drain, Logger};
use url::Url;

use patroni_pool::cancel::CancelToken;
use patroni_pool::connection_pool::types::ConnectionPoolOptions;
use patroni_pool::connection_pool::ConnectionPool;
use patroni_pool::retry::RetryHelper;
use patroni_pool_consul_resolver::{ConsulResolver, ConsulResolverConfig};
use patroni_pool_postgres_connection::{
    PostgresConnection, PostgresConnectionConfig, PostgresConnectionError,
    TlsConfig,
};

fn main() {
    let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
    let log = Logger::root(
        Mutex::new(slog_term::FullFormat::new(plain).build()).fuse(),
        o!("build-id" => "0.1.0"),
    );

    let agent = Url::parse("http://127.0.0.1:8500").expect("invalid agent url");
    let resolver = ConsulResolver::new(ConsulResolverConfig {
        log: Some(log.clone()),
        ..ConsulResolverConfig::new(agent, "batman")
    })
    .expect("failed to create resolver");

    let pg_config = PostgresConnectionConfig {
        user: Some("postgres".into()),
        password: None,
        database: Some("test".into()),
        application_name: Some("patroni-connection-pool".into()),
        connect_timeout: Some(Duration::from_secs(2)),
        tls_config: TlsConfig::disable(),
    };
    let connection_creator = PostgresConnection::connection_creator(pg_config);
    let pool_opts = ConnectionPoolOptions {
        log: Some(log.clone()),
        ..Default::default()
    };

    let pool = ConnectionPool::new(pool_opts, resolver, connection_creator)
        .expect("failed to create connection pool");
    let helper = RetryHelper::new(Arc::new(pool));

    let token = CancelToken::with_timeout(Duration::from_secs(10));
    let write = helper.do_write(&token, |_, conn| {
        conn.client()?.batch_execute(
            "CREATE TABLE IF NOT EXISTS visits (at timestamptz NOT NULL);
             INSERT INTO visits VALUES (now());",
        )?;
        Ok::<_, PostgresConnectionError>(())
    });
    if let Err(e) = write {
        error!(log, "write failed"; "err" => %e);
    }

    let read = helper.do_read(&token, |_, conn| {
        let row = conn.client()?.query_one("SELECT count(*) FROM visits", &[])?;
        Ok::<i64, PostgresConnectionError>(row.get(0))
    });
    match read {
        Ok(count) => info!(log, "visits"; "count" => count),
        Err(e) => error!(log, "read failed"; "err" => %e),
    }

    if let Some(stats) = helper.pool().get_stats() {
        info!(log, "pool stats";
            "version" => stats.version,
            "leader" => ?stats.leader,
            "healthy" => stats.healthy.len());
    }
    helper.pool().close();
}
