// Copyright 2020 Joyent, Inc.

use crate::backend::Backend;
use crate::cancel::CancelToken;
use crate::error::Error;

/// A source of cluster membership.
///
/// The pool calls `resolve` once per refresh cycle from its refresh worker.
/// Implementations must bound their I/O by the token's deadline and must
/// report a directory they cannot reach as an error rather than as an empty
/// list: the pool falls back to the last good list on error, but an empty
/// `Ok` would drop every connection.
pub trait Resolver: Send + Sync {
    fn resolve(&self, token: &CancelToken) -> Result<Vec<Backend>, Error>;
}
