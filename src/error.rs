//! Error types returned by the Store API and the subscriptions built on top of it.

use crate::version::ConflictError;

/// Maximum number of events that can be requested in a single read call.
pub const MAX_READ_SIZE: usize = 4096;

/// All the possible errors returned by this crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Returned synchronously, before any network call is made, when
    /// one of the arguments of an operation is not valid.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The server rejected the request because the credentials used
    /// do not grant access to the requested resource.
    #[error("access denied: {0}")]
    AccessDenied(String),

    /// An optimistic concurrency check failed while writing to a stream.
    #[error(transparent)]
    WrongExpectedVersion(#[from] ConflictError),

    /// The stream targeted by a write operation has been deleted.
    #[error("stream '{0}' has been deleted")]
    StreamDeleted(String),

    /// The persistent subscription group requested does not exist.
    #[error("persistent subscription '{group}' on stream '{stream}' not found")]
    PersistentSubscriptionNotFound {
        /// Stream the subscription group was expected on.
        stream: String,
        /// Name of the subscription group.
        group: String,
    },

    /// Transport failure while talking to the server.
    #[error("connection error: {0}")]
    Connection(#[from] reqwest::Error),

    /// The server replied with a status code the client does not expect.
    #[error("unexpected response status {status}: {reason}")]
    UnexpectedStatus {
        /// HTTP status code received.
        status: u16,
        /// Reason phrase, or a snippet of the response body.
        reason: String,
    },

    /// The response body could not be decoded.
    #[error("failed to decode response body: {0}")]
    Decode(#[from] serde_json::Error),

    /// The response was well-formed JSON but missing required information.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// A subscription has been asked to start after being stopped.
    #[error("subscription already stopped")]
    SubscriptionStopped,
}

/// Result type returning the crate [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

pub(crate) fn ensure_stream(stream: &str) -> Result<()> {
    if stream.is_empty() {
        return Err(Error::InvalidArgument("stream name must not be empty".into()));
    }

    Ok(())
}

pub(crate) fn ensure_group(group: &str) -> Result<()> {
    if group.is_empty() {
        return Err(Error::InvalidArgument("group name must not be empty".into()));
    }

    Ok(())
}

pub(crate) fn ensure_count(count: usize) -> Result<()> {
    if count == 0 {
        return Err(Error::InvalidArgument("count must be positive".into()));
    }

    if count > MAX_READ_SIZE {
        return Err(Error::InvalidArgument(format!(
            "count should be less than or equal to {MAX_READ_SIZE}, got {count}"
        )));
    }

    Ok(())
}

pub(crate) fn ensure_start(start: i64) -> Result<()> {
    if start < 0 {
        return Err(Error::InvalidArgument(format!(
            "start must be a non-negative event number, got {start}"
        )));
    }

    Ok(())
}

pub(crate) fn ensure_event_number(number: i64) -> Result<()> {
    if number < -1 {
        return Err(Error::InvalidArgument(format!(
            "event number must be -1 (last) or greater, got {number}"
        )));
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn count_bounds_are_enforced() {
        assert!(ensure_count(1).is_ok());
        assert!(ensure_count(MAX_READ_SIZE).is_ok());
        assert!(matches!(ensure_count(0), Err(Error::InvalidArgument(_))));
        assert!(matches!(
            ensure_count(MAX_READ_SIZE + 1),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn event_number_accepts_last_event_sentinel() {
        assert!(ensure_event_number(-1).is_ok());
        assert!(ensure_event_number(0).is_ok());
        assert!(ensure_event_number(-2).is_err());
    }
}
