//
// Copyright 2020 Joyent, Inc.
//

use std::env;
use std::io::{Read, Write};
use std::net::TcpListener;
use std::sync::{Arc, Mutex};
use std::thread;

use clap::{crate_name, crate_version};
use slog::{o, Drain, Level, LevelFilter, Logger};
use url::Url;

pub const DEFAULT_LOG_LEVEL: Level = Level::Info;
pub const LOG_LEVEL_ENV_VAR: &str = "RESOLVER_LOG_LEVEL";

#[derive(Debug)]
pub enum TestError {
    InvalidLogLevel,
}

pub fn parse_log_level(s: String) -> Result<Level, TestError> {
    match s.to_lowercase().as_str() {
        "trace" => Ok(Level::Trace),
        "debug" => Ok(Level::Debug),
        "info" => Ok(Level::Info),
        "warning" => Ok(Level::Warning),
        "error" => Ok(Level::Error),
        "critical" => Ok(Level::Critical),
        _ => Err(TestError::InvalidLogLevel),
    }
}

pub fn log_level_from_env() -> Result<Option<Level>, TestError> {
    let level_env = env::var_os(LOG_LEVEL_ENV_VAR);
    let level = match level_env {
        Some(level_str) => Some(parse_log_level(
            level_str
                .into_string()
                .map_err(|_| TestError::InvalidLogLevel)?,
        )?),
        None => None,
    };
    Ok(level)
}

pub fn standard_log(l: Level) -> Logger {
    Logger::root(
        Mutex::new(LevelFilter::new(
            slog_bunyan::with_name(crate_name!(), std::io::stdout()).build(),
            l,
        ))
        .fuse(),
        o!("build-id" => crate_version!()),
    )
}

pub fn log_from_env(default_level: Level) -> Result<Logger, TestError> {
    let level = log_level_from_env()?.unwrap_or(default_level);
    Ok(standard_log(level))
}

///
/// A canned HTTP response served by `ConsulAgent`
///
#[derive(Clone, Debug)]
pub struct Response {
    pub status: u16,
    pub body: Vec<u8>,
}

impl Response {
    pub fn ok(body: Vec<u8>) -> Self {
        Response { status: 200, body }
    }

    pub fn status(status: u16) -> Self {
        Response {
            status,
            body: Vec::new(),
        }
    }
}

///
/// A stand-in for the Consul agent's HTTP API. Serves the given responses in
/// order, one per connection, and records the request line of each request.
///
pub struct ConsulAgent {
    pub url: Url,
    requests: Arc<Mutex<Vec<String>>>,
}

impl ConsulAgent {
    pub fn start(responses: Vec<Response>) -> Self {
        let listener =
            TcpListener::bind("127.0.0.1:0").expect("Failed to bind listener");
        let addr = listener.local_addr().expect("Listener has no address");
        let requests = Arc::new(Mutex::new(Vec::new()));
        let recorded = Arc::clone(&requests);

        thread::spawn(move || {
            for response in responses {
                let mut stream = match listener.accept() {
                    Ok((stream, _)) => stream,
                    Err(_) => return,
                };
                let mut buf = [0u8; 4096];
                let n = stream.read(&mut buf).unwrap_or(0);
                let request = String::from_utf8_lossy(&buf[..n]).to_string();
                let request_line =
                    request.lines().next().unwrap_or("").to_string();
                recorded.lock().unwrap().push(request_line);

                let header = format!(
                    "HTTP/1.1 {} X\r\ncontent-type: application/json\r\n\
                     content-length: {}\r\nconnection: close\r\n\r\n",
                    response.status,
                    response.body.len()
                );
                let _ = stream.write_all(header.as_bytes());
                let _ = stream.write_all(&response.body);
            }
        });

        ConsulAgent {
            url: Url::parse(&format!("http://{}", addr))
                .expect("Invalid agent url"),
            requests,
        }
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}
