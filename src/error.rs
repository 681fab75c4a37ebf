use std::fmt::Display;

use serde::{Deserialize, Serialize};

/// Emberstore errors.
///
/// Operation outcomes that a protocol front-end must distinguish (missing
/// key, cas conflict, wrong vbucket, would-block) are carried here as well,
/// so every public engine operation returns a plain `Result`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Error {
    /// The key was not found.
    KeyNotFound,
    /// The key exists and the operation required it not to, or a cas
    /// mismatch was detected.
    KeyExists,
    /// The vbucket is not owned by this node (missing, dead, or in a state
    /// that rejects the operation).
    NotMyVbucket,
    /// An add/store precondition failed.
    NotStored,
    /// The operation has been queued; the caller will be notified through
    /// its cookie when it may retry.
    WouldBlock,
    /// The engine is over its memory budget.
    NoMem,
    /// A temporary failure, typically a locked key. Retry later.
    TempFail,
    /// Invalid user input, typically a malformed argument.
    InvalidInput(String),
    /// Invalid data, typically decoding errors, corruption, or unexpected
    /// internal values.
    InvalidData(String),
    /// An IO error.
    Io(String),
    /// Warmup could not reload the persisted data set.
    WarmupFailed(String),
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::KeyNotFound => write!(f, "key not found"),
            Error::KeyExists => write!(f, "key exists"),
            Error::NotMyVbucket => write!(f, "not my vbucket"),
            Error::NotStored => write!(f, "not stored"),
            Error::WouldBlock => write!(f, "operation queued, would block"),
            Error::NoMem => write!(f, "out of memory"),
            Error::TempFail => write!(f, "temporary failure, retry"),
            Error::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            Error::InvalidData(msg) => write!(f, "invalid data: {msg}"),
            Error::Io(msg) => write!(f, "io error: {msg}"),
            Error::WarmupFailed(msg) => write!(f, "warmup failed: {msg}"),
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

/// An Emberstore Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl<T> From<Error> for Result<T> {
    fn from(error: Error) -> Self {
        Err(error)
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(Error::KeyNotFound.to_string(), "key not found");
        assert_eq!(
            Error::Io("broken pipe".to_string()).to_string(),
            "io error: broken pipe"
        );
    }

    #[test]
    fn test_io_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }
}
