//! Contains the types necessary for optimistic concurrency checks on streams.

use std::fmt;

/// Used to set a specific expectation on the version of a stream
/// when appending new events, deleting it or writing its metadata.
///
/// It allows for optimistic locking, avoiding data races
/// when modifying the same stream at the same time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedVersion {
    /// Disables any kind of optimistic locking check.
    Any,
    /// Expects the stream not to exist yet.
    NoStream,
    /// Expects the stream to exist, regardless of its version.
    StreamExists,
    /// Expects the last event in the stream to have the specified number.
    Exact(i64),
}

impl ExpectedVersion {
    /// Returns the numeric encoding used by the server in the
    /// `ES-ExpectedVersion` header.
    pub fn as_i64(self) -> i64 {
        match self {
            ExpectedVersion::Any => -2,
            ExpectedVersion::NoStream => -1,
            ExpectedVersion::StreamExists => -4,
            ExpectedVersion::Exact(version) => version,
        }
    }

    /// Checks the expectation against the version of the last event in a stream,
    /// `None` meaning the stream does not exist.
    pub fn is_satisfied_by(self, current: Option<i64>) -> bool {
        match (self, current) {
            (ExpectedVersion::Any, _) => true,
            (ExpectedVersion::NoStream, current) => current.is_none(),
            (ExpectedVersion::StreamExists, current) => current.is_some(),
            (ExpectedVersion::Exact(expected), Some(current)) => expected == current,
            (ExpectedVersion::Exact(_), None) => false,
        }
    }
}

impl fmt::Display for ExpectedVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExpectedVersion::Any => f.write_str("any"),
            ExpectedVersion::NoStream => f.write_str("no stream"),
            ExpectedVersion::StreamExists => f.write_str("stream exists"),
            ExpectedVersion::Exact(version) => write!(f, "{version}"),
        }
    }
}

/// This error is returned by a write operation when the expected version
/// of the stream did not match the actual one.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("wrong expected version on stream '{stream}', expected: {expected}, actual: {actual:?}")]
pub struct ConflictError {
    /// The stream the write was targeting.
    pub stream: String,

    /// The expectation used when calling the function that failed.
    pub expected: ExpectedVersion,

    /// The actual version of the stream, if known; `Some(-1)` means the stream does not exist.
    pub actual: Option<i64>,
}
