// Copyright 2020 Joyent, Inc.

use std::error;

/// Patroni pool connection
///
/// The `Connection` trait defines the interface that must be implemented in
/// order to participate in a patroni connection pool. The pool keeps at most
/// one `Connection` per cluster member and shares it among callers, so a
/// connection is usually a database client rather than a raw socket.
///
/// Implementations are created by the connection function passed to
/// `ConnectionPool::new` whenever a member is seen for the first time or its
/// connection string changes.
pub trait Connection: Send + Sized + 'static {
    /// The error type returned by the `connect` or `close` functions. Each
    /// implementation of the `Connection` trait may choose the appropriate
    /// concrete error type to return, as long as it implements the standard
    /// library [Error](https://doc.rust-lang.org/std/error/trait.Error.html)
    /// trait.
    type Error: error::Error;
    /// Open the connection to the member. The pool follows a successful
    /// `connect` with `is_valid` before counting the member as healthy.
    fn connect(&mut self) -> Result<(), Self::Error>;
    /// Ping the member over an established connection. Returns `false` if
    /// the connection was never established.
    fn is_valid(&mut self) -> bool;
    /// Cheap, local check for a connection the driver already knows to be
    /// dead. Must not perform I/O.
    fn has_broken(&self) -> bool;
    /// Close the connection to the member.
    fn close(&mut self) -> Result<(), Self::Error>;
}
