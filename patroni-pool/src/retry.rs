// Copyright 2020 Joyent, Inc.

//! Retrying database actions across connection failures.
//!
//! `RetryHelper` obtains a handle from the pool, runs the caller's action on
//! it and reports the outcome. Errors that leave the connection usable are
//! handed back at once; a missing connection or a connection-fatal error is
//! retried after `inter_retry_delay`, up to `max_retries` attempts in total.

use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

use backoff::backoff::{Backoff, Constant};
use slog::{debug, warn};

use crate::backend::BackendName;
use crate::cancel::CancelToken;
use crate::connection::Connection;
use crate::connection_pool::{ConnectionHandle, ConnectionPool};
use crate::error::Error;

/// One failed attempt made by `RetryHelper`.
#[derive(Debug)]
pub enum Attempt<E> {
    /// The pool had no suitable connection.
    NoConnection,
    /// The action failed with an error that broke the connection.
    ConnectionFatal { node: BackendName, error: E },
}

impl<E> fmt::Display for Attempt<E>
where
    E: fmt::Display,
{
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Attempt::NoConnection => String::from("No connection").fmt(fmt),
            Attempt::ConnectionFatal { node, error } => {
                write!(fmt, "{}: {}", node, error)
            }
        }
    }
}

#[derive(Debug)]
pub enum RetryError<E> {
    /// The action failed and the connection is still usable. The error is
    /// the action's own.
    Action(E),
    /// Every attempt found no connection or broke the one it used.
    BadConnection(Vec<Attempt<E>>),
    /// The token was cancelled, or its deadline passed, while waiting to
    /// retry.
    Interrupted {
        cause: Error,
        history: Vec<Attempt<E>>,
    },
}

impl<E> RetryError<E> {
    /// The failed attempts made before giving up. Empty for `Action`.
    pub fn history(&self) -> &[Attempt<E>] {
        match self {
            RetryError::Action(_) => &[],
            RetryError::BadConnection(history) => history,
            RetryError::Interrupted { history, .. } => history,
        }
    }
}

fn write_history<E>(
    fmt: &mut fmt::Formatter,
    history: &[Attempt<E>],
) -> fmt::Result
where
    E: fmt::Display,
{
    for (i, attempt) in history.iter().enumerate() {
        write!(fmt, "; attempt {}: {}", i + 1, attempt)?;
    }
    Ok(())
}

impl<E> fmt::Display for RetryError<E>
where
    E: fmt::Display,
{
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RetryError::Action(e) => e.fmt(fmt),
            RetryError::BadConnection(history) => {
                String::from("Bad connection").fmt(fmt)?;
                write_history(fmt, history)
            }
            RetryError::Interrupted { cause, history } => {
                write!(fmt, "retry interrupted: {}", cause)?;
                write_history(fmt, history)
            }
        }
    }
}

impl<E> StdError for RetryError<E>
where
    E: StdError + 'static,
{
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            RetryError::Action(e) => e.source(),
            RetryError::BadConnection(history) => {
                history.iter().rev().find_map(|attempt| match attempt {
                    Attempt::ConnectionFatal { error, .. } => {
                        Some(error as &(dyn StdError + 'static))
                    }
                    Attempt::NoConnection => None,
                })
            }
            RetryError::Interrupted { cause, .. } => Some(cause),
        }
    }
}

/// Runs database actions against a pool, retrying when no connection is
/// available or the connection breaks under the action.
pub struct RetryHelper<C>
where
    C: Connection,
{
    pool: Arc<ConnectionPool<C>>,
}

impl<C> Clone for RetryHelper<C>
where
    C: Connection,
{
    fn clone(&self) -> Self {
        RetryHelper {
            pool: Arc::clone(&self.pool),
        }
    }
}

impl<C> RetryHelper<C>
where
    C: Connection,
{
    pub fn new(pool: Arc<ConnectionPool<C>>) -> Self {
        RetryHelper { pool }
    }

    pub fn pool(&self) -> &Arc<ConnectionPool<C>> {
        &self.pool
    }

    /// Run `action` on the leader's connection.
    pub fn do_write<T, E, A>(
        &self,
        token: &CancelToken,
        action: A,
    ) -> Result<T, RetryError<E>>
    where
        E: StdError + 'static,
        A: FnMut(&CancelToken, &mut C) -> Result<T, E>,
    {
        self.do_internally(token, action, ConnectionPool::write_conn, "write")
    }

    /// Run `action` on a connection suitable for reads.
    pub fn do_read<T, E, A>(
        &self,
        token: &CancelToken,
        action: A,
    ) -> Result<T, RetryError<E>>
    where
        E: StdError + 'static,
        A: FnMut(&CancelToken, &mut C) -> Result<T, E>,
    {
        self.do_internally(token, action, ConnectionPool::read_conn, "read")
    }

    fn do_internally<T, E, A, P>(
        &self,
        token: &CancelToken,
        mut action: A,
        conn_provider: P,
        kind: &'static str,
    ) -> Result<T, RetryError<E>>
    where
        E: StdError + 'static,
        A: FnMut(&CancelToken, &mut C) -> Result<T, E>,
        P: Fn(&ConnectionPool<C>) -> Option<ConnectionHandle<C>>,
    {
        let log = self.pool.log();
        let max_retries = self.pool.max_retries().max(1);
        let delay = self.pool.inter_retry_delay();
        let mut delays = Constant::new(delay);
        let mut history = Vec::new();

        for attempt in 1..=max_retries {
            match conn_provider(&self.pool) {
                Some(handle) => {
                    let result = action(token, &mut *handle.connection());
                    match result {
                        Ok(value) => return Ok(value),
                        Err(error) => {
                            if !handle.report_err(Some(&error)) {
                                return Err(RetryError::Action(error));
                            }
                            warn!(log, "connection failed during action";
                                "kind" => kind,
                                "attempt" => attempt,
                                "handle" => %handle,
                                "err" => %error);
                            history.push(Attempt::ConnectionFatal {
                                node: handle.node().clone(),
                                error,
                            });
                        }
                    }
                }
                None => {
                    debug!(log, "no connection available";
                        "kind" => kind, "attempt" => attempt);
                    history.push(Attempt::NoConnection);
                }
            }

            if attempt == max_retries {
                break;
            }
            let wait = delays.next_backoff().unwrap_or(delay);
            if let Err(cause) = token.sleep(wait) {
                return Err(RetryError::Interrupted { cause, history });
            }
        }

        Err(RetryError::BadConnection(history))
    }
}
