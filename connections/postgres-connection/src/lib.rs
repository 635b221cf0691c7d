/*
 * Copyright 2020 Joyent, Inc.
 */

//! A `Connection` over the synchronous `postgres` client.
//!
//! Patroni publishes a connection string per member; the host and port are
//! taken from it, everything else (credentials, database, TLS) comes from a
//! `PostgresConnectionConfig` shared by every member.

use std::error::Error as StdError;
use std::fmt;
use std::time::Duration;

use native_tls::Certificate as NativeCertificate;
use native_tls::Error as NativeError;
use native_tls::TlsConnector;
use postgres::config::SslMode;
use postgres::{Client, Config, NoTls};
use postgres_native_tls::MakeTlsConnector;
use serde::Deserialize;
use url::Url;

use patroni_pool::backend::Backend;
use patroni_pool::connection::Connection;

/// Bound on opening a connection and on each validity check.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// The port Postgres listens on unless the member says otherwise.
pub const DEFAULT_PORT: u16 = 5432;

#[derive(Debug)]
pub enum PostgresConnectionError {
    Postgres(postgres::Error),
    Tls(NativeError),
    /// The member's connection string names no host.
    MissingHost(String),
    /// The TLS mode verifies the server but no root certificate was given.
    MissingCertificate(TlsConnectMode),
    NotConnected,
}

impl From<postgres::Error> for PostgresConnectionError {
    fn from(error: postgres::Error) -> Self {
        PostgresConnectionError::Postgres(error)
    }
}

impl From<NativeError> for PostgresConnectionError {
    fn from(error: NativeError) -> Self {
        PostgresConnectionError::Tls(error)
    }
}

impl fmt::Display for PostgresConnectionError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PostgresConnectionError::Postgres(e) => e.fmt(fmt),
            PostgresConnectionError::Tls(e) => write!(fmt, "tls: {}", e),
            PostgresConnectionError::MissingHost(url) => {
                write!(fmt, "no host in connection string: {}", url)
            }
            PostgresConnectionError::MissingCertificate(mode) => write!(
                fmt,
                "a certificate is required for sslmode {}",
                mode
            ),
            PostgresConnectionError::NotConnected => {
                String::from("not connected").fmt(fmt)
            }
        }
    }
}

impl StdError for PostgresConnectionError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            PostgresConnectionError::Postgres(e) => Some(e),
            PostgresConnectionError::Tls(e) => Some(e),
            _ => None,
        }
    }
}

pub struct PostgresConnection {
    pub connection: Option<Client>,
    conn_url: Url,
    config: PostgresConnectionConfig,
}

impl PostgresConnection {
    pub fn new(config: &PostgresConnectionConfig, b: &Backend) -> Self {
        PostgresConnection {
            connection: None,
            conn_url: b.conn_url.clone(),
            config: config.clone(),
        }
    }

    /// Return a function that builds an unopened connection for a member,
    /// for use with `ConnectionPool::new`.
    pub fn connection_creator(
        config: PostgresConnectionConfig,
    ) -> impl Fn(&Backend) -> PostgresConnection + Send + Sync + 'static {
        move |b| PostgresConnection::new(&config, b)
    }

    /// The open client, for running queries.
    pub fn client(&mut self) -> Result<&mut Client, PostgresConnectionError> {
        self.connection
            .as_mut()
            .ok_or(PostgresConnectionError::NotConnected)
    }

    fn connect_timeout(&self) -> Duration {
        self.config
            .connect_timeout
            .unwrap_or(DEFAULT_CONNECT_TIMEOUT)
    }

    /// Combine the member's connection string with the shared settings.
    /// Settings in `PostgresConnectionConfig` win; user and database fall
    /// back to the connection string.
    pub fn pg_config(&self) -> Result<Config, PostgresConnectionError> {
        let url = &self.conn_url;
        let host = url.host_str().filter(|h| !h.is_empty()).ok_or_else(|| {
            PostgresConnectionError::MissingHost(url.to_string())
        })?;

        let mut pg = Config::new();
        pg.host(host)
            .port(url.port().unwrap_or(DEFAULT_PORT))
            .connect_timeout(self.connect_timeout())
            .ssl_mode(self.config.tls_config.mode.ssl_mode());

        match (&self.config.user, url.username()) {
            (Some(user), _) => {
                pg.user(user);
            }
            (None, user) if !user.is_empty() => {
                pg.user(user);
            }
            _ => (),
        }
        if let Some(password) = &self.config.password {
            pg.password(password);
        }
        let url_database = url.path().trim_start_matches('/');
        match &self.config.database {
            Some(database) => {
                pg.dbname(database);
            }
            None if !url_database.is_empty() => {
                pg.dbname(url_database);
            }
            None => (),
        }
        if let Some(application_name) = &self.config.application_name {
            pg.application_name(application_name);
        }
        Ok(pg)
    }
}

impl Connection for PostgresConnection {
    type Error = PostgresConnectionError;

    fn connect(&mut self) -> Result<(), Self::Error> {
        self.connection = None;
        let pg = self.pg_config()?;
        let connection = match make_tls_connector(&self.config.tls_config)? {
            Some(tls_connector) => pg.connect(tls_connector)?,
            None => pg.connect(NoTls)?,
        };
        self.connection = Some(connection);
        Ok(())
    }

    fn is_valid(&mut self) -> bool {
        let timeout = self.connect_timeout();
        match self.connection.as_mut() {
            Some(conn) => !conn.is_closed() && conn.is_valid(timeout).is_ok(),
            None => false,
        }
    }

    fn has_broken(&self) -> bool {
        match &self.connection {
            Some(conn) => conn.is_closed(),
            None => false,
        }
    }

    fn close(&mut self) -> Result<(), Self::Error> {
        if let Some(conn) = self.connection.take() {
            conn.close()?;
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct PostgresConnectionConfig {
    pub user: Option<String>,
    pub password: Option<String>,
    pub database: Option<String>,
    pub application_name: Option<String>,
    /// Defaults to `DEFAULT_CONNECT_TIMEOUT`.
    pub connect_timeout: Option<Duration>,
    pub tls_config: TlsConfig,
}

impl Default for PostgresConnectionConfig {
    fn default() -> Self {
        PostgresConnectionConfig {
            user: None,
            password: None,
            database: None,
            application_name: None,
            connect_timeout: None,
            tls_config: TlsConfig::disable(),
        }
    }
}

#[derive(Copy, Debug, Clone, Deserialize, Eq, PartialEq)]
pub enum TlsConnectMode {
    #[serde(alias = "disable")]
    Disable,
    #[serde(alias = "allow")]
    Allow,
    #[serde(alias = "prefer")]
    Prefer,
    #[serde(alias = "require")]
    Require,
    #[serde(alias = "verify-ca")]
    VerifyCa,
    #[serde(alias = "verify-full")]
    VerifyFull,
}

impl TlsConnectMode {
    // The client only distinguishes whether TLS is attempted and whether it
    // is mandatory; verification is configured on the connector.
    fn ssl_mode(self) -> SslMode {
        match self {
            TlsConnectMode::Disable => SslMode::Disable,
            TlsConnectMode::Allow | TlsConnectMode::Prefer => SslMode::Prefer,
            TlsConnectMode::Require
            | TlsConnectMode::VerifyCa
            | TlsConnectMode::VerifyFull => SslMode::Require,
        }
    }
}

impl fmt::Display for TlsConnectMode {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        let mode = match self {
            TlsConnectMode::Disable => "disable",
            TlsConnectMode::Allow => "allow",
            TlsConnectMode::Prefer => "prefer",
            TlsConnectMode::Require => "require",
            TlsConnectMode::VerifyCa => "verify-ca",
            TlsConnectMode::VerifyFull => "verify-full",
        };
        mode.fmt(fmt)
    }
}

/// An X509 certificate.
pub type Certificate = NativeCertificate;

/// An error returned from the TLS implementation.
pub type CertificateError = NativeError;

#[derive(Clone)]
pub struct TlsConfig {
    pub(self) mode: TlsConnectMode,
    pub(self) certificate: Option<Certificate>,
}

impl TlsConfig {
    pub fn disable() -> Self {
        TlsConfig {
            mode: TlsConnectMode::Disable,
            certificate: None,
        }
    }

    pub fn allow(certificate: Option<Certificate>) -> Self {
        TlsConfig {
            mode: TlsConnectMode::Allow,
            certificate,
        }
    }

    pub fn prefer(certificate: Option<Certificate>) -> Self {
        TlsConfig {
            mode: TlsConnectMode::Prefer,
            certificate,
        }
    }

    pub fn require(certificate: Option<Certificate>) -> Self {
        TlsConfig {
            mode: TlsConnectMode::Require,
            certificate,
        }
    }

    pub fn verify_ca(certificate: Certificate) -> Self {
        TlsConfig {
            mode: TlsConnectMode::VerifyCa,
            certificate: Some(certificate),
        }
    }

    pub fn verify_full(certificate: Certificate) -> Self {
        TlsConfig {
            mode: TlsConnectMode::VerifyFull,
            certificate: Some(certificate),
        }
    }

    pub fn mode(&self) -> TlsConnectMode {
        self.mode
    }
}

fn make_tls_connector(
    tls_config: &TlsConfig,
) -> Result<Option<MakeTlsConnector>, PostgresConnectionError> {
    let m_cert = tls_config.certificate.clone();
    let connector = match tls_config.mode {
        TlsConnectMode::Disable => return Ok(None),
        TlsConnectMode::Allow
        | TlsConnectMode::Prefer
        | TlsConnectMode::Require => {
            if let Some(cert) = m_cert {
                // root cert supplied, use it to verify server certs
                TlsConnector::builder().add_root_certificate(cert).build()?
            } else {
                // no cert is given, disable certificate verification
                TlsConnector::builder()
                    .danger_accept_invalid_certs(true)
                    .build()?
            }
        }
        TlsConnectMode::VerifyCa => {
            let cert = m_cert.ok_or(
                PostgresConnectionError::MissingCertificate(tls_config.mode),
            )?;
            TlsConnector::builder()
                .add_root_certificate(cert)
                .danger_accept_invalid_hostnames(true)
                .build()?
        }
        TlsConnectMode::VerifyFull => {
            let cert = m_cert.ok_or(
                PostgresConnectionError::MissingCertificate(tls_config.mode),
            )?;
            TlsConnector::builder().add_root_certificate(cert).build()?
        }
    };
    Ok(Some(MakeTlsConnector::new(connector)))
}

#[cfg(test)]
mod test {
    use super::*;

    use std::net::TcpListener;

    use patroni_pool::backend::Role;

    fn backend(conn_url: &str) -> Backend {
        Backend::new(
            "pg-0",
            Url::parse("http://10.77.77.28:8008/patroni").unwrap(),
            Url::parse(conn_url).unwrap(),
            Role::Leader,
        )
    }

    fn connection(
        config: PostgresConnectionConfig,
        conn_url: &str,
    ) -> PostgresConnection {
        let creator = PostgresConnection::connection_creator(config);
        creator(&backend(conn_url))
    }

    #[test]
    fn pg_config_uses_member_address() {
        let config = PostgresConnectionConfig {
            user: Some("app".into()),
            password: Some("s3cr:t@".into()),
            database: Some("accounts".into()),
            application_name: Some("patroni-pool".into()),
            ..Default::default()
        };
        let conn = connection(config, "postgres://10.77.77.28:5433/postgres");
        let pg = conn.pg_config().unwrap();

        assert_eq!(pg.get_ports(), &[5433]);
        assert_eq!(pg.get_user(), Some("app"));
        assert_eq!(pg.get_password(), Some(&b"s3cr:t@"[..]));
        assert_eq!(pg.get_dbname(), Some("accounts"));
        assert_eq!(pg.get_application_name(), Some("patroni-pool"));
        assert_eq!(pg.get_connect_timeout(), Some(&DEFAULT_CONNECT_TIMEOUT));
        assert_eq!(pg.get_ssl_mode(), SslMode::Disable);
        match pg.get_hosts() {
            [postgres::config::Host::Tcp(host)] => {
                assert_eq!(host, "10.77.77.28")
            }
            other => panic!("unexpected hosts: {:?}", other),
        }
    }

    #[test]
    fn pg_config_falls_back_to_conn_url() {
        let conn = connection(
            PostgresConnectionConfig::default(),
            "postgres://replicator@10.77.77.21/postgres",
        );
        let pg = conn.pg_config().unwrap();
        assert_eq!(pg.get_ports(), &[DEFAULT_PORT]);
        assert_eq!(pg.get_user(), Some("replicator"));
        assert_eq!(pg.get_dbname(), Some("postgres"));
    }

    #[test]
    fn conn_url_without_host() {
        let mut conn =
            connection(PostgresConnectionConfig::default(), "unix:/tmp/pg");
        match conn.connect() {
            Err(PostgresConnectionError::MissingHost(_)) => (),
            other => panic!("unexpected result: {:?}", other.err()),
        }
        assert!(!conn.is_valid());
    }

    #[test]
    fn unopened_connection() {
        let mut conn = connection(
            PostgresConnectionConfig::default(),
            "postgres://10.77.77.28:5432/postgres",
        );
        assert!(!conn.is_valid());
        assert!(!conn.has_broken());
        assert!(matches!(
            conn.client(),
            Err(PostgresConnectionError::NotConnected)
        ));
        assert!(conn.close().is_ok());
    }

    #[test]
    fn connect_refused() {
        // Bind and drop a listener to find a port that refuses connections.
        let addr = TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap();
        let config = PostgresConnectionConfig {
            connect_timeout: Some(Duration::from_millis(500)),
            ..Default::default()
        };
        let mut conn =
            connection(config, &format!("postgres://{}/postgres", addr));

        match conn.connect() {
            Err(PostgresConnectionError::Postgres(_)) => (),
            other => panic!("unexpected result: {:?}", other.err()),
        }
        assert!(conn.connection.is_none());
        assert!(!conn.is_valid());
    }

    #[test]
    fn verify_modes_need_certificate() {
        let tls_config = TlsConfig {
            mode: TlsConnectMode::VerifyFull,
            certificate: None,
        };
        match make_tls_connector(&tls_config) {
            Err(PostgresConnectionError::MissingCertificate(
                TlsConnectMode::VerifyFull,
            )) => (),
            other => panic!("unexpected result: {:?}", other.err()),
        }
        assert!(make_tls_connector(&TlsConfig::disable()).unwrap().is_none());
    }

    #[test]
    fn tls_modes() {
        let mode: TlsConnectMode =
            serde_json::from_str("\"verify-full\"").unwrap();
        assert_eq!(mode, TlsConnectMode::VerifyFull);
        assert_eq!(mode.to_string(), "verify-full");
        assert_eq!(mode.ssl_mode(), SslMode::Require);
        assert_eq!(TlsConnectMode::Allow.ssl_mode(), SslMode::Prefer);
        assert_eq!(TlsConfig::require(None).mode(), TlsConnectMode::Require);
    }
}
