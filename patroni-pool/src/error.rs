// Copyright 2020 Joyent, Inc.

use std::error::Error as StdError;
use std::fmt;
use std::io;

#[derive(Debug)]
pub enum Error {
    /// The membership directory could not be queried.
    ResolverError(String),
    /// The membership directory answered, but listed no members.
    NoMembers,
    /// A role probe could not be sent or its response could not be read.
    ProbeError(String),
    /// A database connection could not be opened or did not answer a ping.
    ConnectionError(String),
    /// The operation's `CancelToken` was cancelled.
    Cancelled,
    /// The operation's `CancelToken` deadline passed.
    DeadlineExceeded,
    /// A pool option could not be applied.
    InvalidOption(String),
    IOError(io::Error),
}

impl From<io::Error> for Error {
    fn from(error: io::Error) -> Self {
        Error::IOError(error)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::ResolverError(err_str) => {
                write!(fmt, "membership directory unavailable: {}", err_str)
            }
            Error::NoMembers => {
                String::from("membership directory lists no members").fmt(fmt)
            }
            Error::ProbeError(err_str) => {
                write!(fmt, "role probe failed: {}", err_str)
            }
            Error::ConnectionError(err_str) => {
                write!(fmt, "connection failed: {}", err_str)
            }
            Error::Cancelled => String::from("operation cancelled").fmt(fmt),
            Error::DeadlineExceeded => {
                String::from("operation deadline exceeded").fmt(fmt)
            }
            Error::InvalidOption(err_str) => {
                write!(fmt, "invalid pool option: {}", err_str)
            }
            Error::IOError(io_err) => io_err.fmt(fmt),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Error::IOError(io_err) => Some(io_err),
            _ => None,
        }
    }
}

// Default allow-list of I/O error kinds that mean the connection itself is
// gone.
const DEFAULT_FATAL_IO_KINDS: [io::ErrorKind; 5] = [
    io::ErrorKind::UnexpectedEof,
    io::ErrorKind::ConnectionReset,
    io::ErrorKind::ConnectionAborted,
    io::ErrorKind::BrokenPipe,
    io::ErrorKind::NotConnected,
];

// Default allow-list of message fragments, matched case-insensitively.
const DEFAULT_FATAL_MESSAGES: [&str; 4] = [
    "connection closed",
    "unexpected eof",
    "broken pipe",
    "connection reset",
];

/// The allow-list used to decide whether an error reported through a
/// `ConnectionHandle` means the underlying connection is broken (as opposed
/// to the query failing). An error is fatal if it, or any error in its
/// `source()` chain, is an `io::Error` of one of the listed kinds or has a
/// `Display` rendering containing one of the listed fragments.
#[derive(Clone, Debug)]
pub struct FatalErrors {
    pub io_kinds: Vec<io::ErrorKind>,
    pub messages: Vec<String>,
}

impl FatalErrors {
    /// An allow-list that treats nothing as fatal.
    pub fn none() -> Self {
        FatalErrors {
            io_kinds: Vec::new(),
            messages: Vec::new(),
        }
    }

    pub fn with_io_kind(mut self, kind: io::ErrorKind) -> Self {
        self.io_kinds.push(kind);
        self
    }

    pub fn with_message<S: Into<String>>(mut self, fragment: S) -> Self {
        self.messages.push(fragment.into().to_lowercase());
        self
    }

    pub fn is_fatal(&self, err: &(dyn StdError + 'static)) -> bool {
        let mut current = Some(err);
        while let Some(e) = current {
            if let Some(io_err) = e.downcast_ref::<io::Error>() {
                if self.io_kinds.contains(&io_err.kind()) {
                    return true;
                }
            }
            let rendered = e.to_string().to_lowercase();
            if self
                .messages
                .iter()
                .any(|m| rendered.contains(&m.to_lowercase()))
            {
                return true;
            }
            current = e.source();
        }
        false
    }
}

impl Default for FatalErrors {
    fn default() -> Self {
        FatalErrors {
            io_kinds: DEFAULT_FATAL_IO_KINDS.to_vec(),
            messages: DEFAULT_FATAL_MESSAGES
                .iter()
                .map(|m| m.to_string())
                .collect(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[derive(Debug)]
    struct Wrapped(io::Error);

    impl fmt::Display for Wrapped {
        fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
            write!(fmt, "query failed")
        }
    }

    impl StdError for Wrapped {
        fn source(&self) -> Option<&(dyn StdError + 'static)> {
            Some(&self.0)
        }
    }

    #[test]
    fn default_matches_closed_connections() {
        let fatal = FatalErrors::default();
        let eof = io::Error::new(io::ErrorKind::UnexpectedEof, "eof");
        assert!(fatal.is_fatal(&eof));

        let closed = Error::ConnectionError("Connection Closed".into());
        assert!(fatal.is_fatal(&closed));
    }

    #[test]
    fn default_ignores_business_errors() {
        let fatal = FatalErrors::default();
        let err = io::Error::new(
            io::ErrorKind::InvalidData,
            "duplicate key value violates unique constraint",
        );
        assert!(!fatal.is_fatal(&err));
    }

    #[test]
    fn classification_walks_sources() {
        let fatal = FatalErrors::default();
        let wrapped =
            Wrapped(io::Error::new(io::ErrorKind::BrokenPipe, "write"));
        assert!(fatal.is_fatal(&wrapped));
        assert!(!FatalErrors::none().is_fatal(&wrapped));
    }

    #[test]
    fn custom_allow_list() {
        let fatal = FatalErrors::none().with_message("Terminating Connection");
        let err = Error::ConnectionError(
            "FATAL: terminating connection due to administrator command"
                .into(),
        );
        assert!(fatal.is_fatal(&err));
        assert!(!fatal.is_fatal(&Error::NoMembers));
    }
}
