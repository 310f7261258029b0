use std::fmt::Display;

use serde::{Deserialize, Serialize};

/// CinderDB errors.
///
/// The enum is serializable so a transport layer can carry errors back to
/// clients unchanged; `Remote` wraps an error relayed from a peer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Error {
    /// The named region is not hosted by this server.
    NotServingRegion(String),
    /// The scanner id is unknown, either never issued or already expired.
    UnknownScanner(u64),
    /// The row lock id is unknown, either never issued or already released.
    UnknownLock(u64),
    /// A merge was requested on a table that still has online regions.
    TableNotDisabled(String),
    /// Another region server already owns this root directory.
    RegionServerRunning(String),
    /// A memcache snapshot was written but could not be promoted into the
    /// store. The write-ahead log must be replayed; the server has to stop.
    DroppedSnapshot(String),
    /// The lease with this id has already expired.
    LeaseExpired(u64),
    /// The server is shutting down or its filesystem is gone.
    ServerNotRunning,
    /// Invalid on-disk data: decoding errors, checksum mismatches.
    Corrupt(String),
    /// Invalid caller input, typically configuration or malformed names.
    InvalidInput(String),
    /// An IO error.
    Io(String),
    /// An error relayed from a remote peer.
    Remote(Box<Error>),
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::NotServingRegion(name) => write!(f, "not serving region {name}"),
            Error::UnknownScanner(id) => write!(f, "unknown scanner {id}"),
            Error::UnknownLock(id) => write!(f, "unknown row lock {id}"),
            Error::TableNotDisabled(name) => write!(f, "table {name} is not disabled"),
            Error::RegionServerRunning(dir) => {
                write!(f, "a region server is already running under {dir}")
            }
            Error::DroppedSnapshot(msg) => write!(f, "dropped memcache snapshot: {msg}"),
            Error::LeaseExpired(id) => write!(f, "lease {id} expired"),
            Error::ServerNotRunning => write!(f, "server not running"),
            Error::Corrupt(msg) => write!(f, "corrupt data: {msg}"),
            Error::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            Error::Io(msg) => write!(f, "io error: {msg}"),
            Error::Remote(inner) => write!(f, "remote error: {inner}"),
        }
    }
}

impl Error {
    /// Unwraps `Remote` wrappers, yielding the underlying error kind.
    pub fn unwrap_remote(self) -> Error {
        match self {
            Error::Remote(inner) => inner.unwrap_remote(),
            other => other,
        }
    }
}

/// Constructs an Error::Corrupt for the given format string.
#[macro_export]
macro_rules! errcorrupt {
    ($($args:tt)*) => { $crate::error::Error::Corrupt(format!($($args)*)).into() };
}

/// Constructs an Error::InvalidInput for the given format string.
#[macro_export]
macro_rules! errinput {
    ($($args:tt)*) => { $crate::error::Error::InvalidInput(format!($($args)*)).into() };
}

/// A CinderDB Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl<T> From<Error> for Result<T> {
    fn from(error: Error) -> Self {
        Err(error)
    }
}

impl From<Box<bincode::ErrorKind>> for Error {
    fn from(err: Box<bincode::ErrorKind>) -> Self {
        Error::Corrupt(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Error::Io(err.to_string())
    }
}
