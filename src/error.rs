use std::fmt::Display;

/// EmberDB errors.
#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    /// The engine or its storage has been closed; no further operations are
    /// accepted.
    Closed,
    /// Invalid on-disk data, typically decoding errors, corruption, or
    /// unexpected internal values. Fatal at open time.
    InvalidData(String),
    /// Invalid user input, e.g. an empty key.
    InvalidInput(String),
    /// An invalid state transition, e.g. freezing a memtable while a flush
    /// is already in progress.
    InvalidState(String),
    /// An IO error.
    IO(String),
    /// A write was attempted on the read-only empty memtable.
    ReadOnly,
    /// An overflow-triggered flush was requested while another flush is
    /// still pending. The caller should back off and retry.
    TooManyFlushes,
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Closed => write!(f, "engine is closed"),
            Error::InvalidData(msg) => write!(f, "invalid data: {msg}"),
            Error::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            Error::InvalidState(msg) => write!(f, "invalid state: {msg}"),
            Error::IO(msg) => write!(f, "io error: {msg}"),
            Error::ReadOnly => write!(f, "write attempted on read-only memtable"),
            Error::TooManyFlushes => write!(f, "too many flushes in background"),
        }
    }
}

/// Constructs an Error::InvalidData for the given format string.
#[macro_export]
macro_rules! errdata {
    ($($args:tt)*) => { $crate::error::Error::InvalidData(format!($($args)*)).into() };
}

/// Constructs an Error::InvalidInput for the given format string.
#[macro_export]
macro_rules! errinput {
    ($($args:tt)*) => { $crate::error::Error::InvalidInput(format!($($args)*)).into() };
}

/// An EmberDB Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl<T> From<Error> for Result<T> {
    fn from(error: Error) -> Self {
        Err(error)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IO(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Error::IO(err.to_string())
    }
}
