//! Module `event` contains the in-memory representation of the events
//! read from and written to the remote store.

use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

/// Event number of the first event in a stream.
pub const STREAM_START: i64 = 0;

/// Event number pointing at the last event in a stream.
pub const STREAM_END: i64 = -1;

/// Event type used by the server for link events.
pub const LINK_EVENT_TYPE: &str = "$>";

/// An event that has been persisted in a stream.
///
/// Values of this type are created by the Store API while parsing
/// a server response, and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedEvent {
    /// The stream this event belongs to.
    pub stream_id: String,

    /// Zero-based sequence number of the event in its stream.
    pub event_number: i64,

    /// Globally unique identifier of the event.
    pub event_id: Uuid,

    /// The type tag of the event.
    pub event_type: String,

    /// Whether `data` and `metadata` are JSON documents.
    pub is_json: bool,

    /// The event payload.
    pub data: Vec<u8>,

    /// The event metadata payload.
    pub metadata: Vec<u8>,

    /// When the event was written, if reported by the server.
    pub created: Option<DateTime<Utc>>,
}

impl RecordedEvent {
    /// Decodes the event payload from JSON.
    pub fn as_json<T>(&self) -> serde_json::Result<T>
    where
        T: DeserializeOwned,
    {
        serde_json::from_slice(&self.data)
    }

    /// Returns true if this is a link event pointing to another event.
    pub fn is_link(&self) -> bool {
        self.event_type == LINK_EVENT_TYPE
    }

    /// Parses the `number@stream` pointer carried by a link event.
    pub fn link_pointer(&self) -> Option<(i64, &str)> {
        if !self.is_link() {
            return None;
        }

        let pointer = std::str::from_utf8(&self.data).ok()?;
        let (number, stream) = pointer.split_once('@')?;

        Some((number.parse().ok()?, stream))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Resolution {
    Event,
    Link(Option<RecordedEvent>),
}

/// An event read from a stream, where link events may have been
/// resolved into the event they point to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedEvent {
    original: RecordedEvent,
    resolution: Resolution,
    original_position: Option<Position>,
}

impl ResolvedEvent {
    /// Wraps an event that is not a resolved link.
    pub fn new(event: RecordedEvent) -> Self {
        Self {
            original: event,
            resolution: Resolution::Event,
            original_position: None,
        }
    }

    /// Wraps a link event together with its target, if the target could be resolved.
    pub fn resolved_link(link: RecordedEvent, target: Option<RecordedEvent>) -> Self {
        Self {
            original: link,
            resolution: Resolution::Link(target),
            original_position: None,
        }
    }

    /// Attaches the position in the `$all` log this event was read at.
    #[must_use]
    pub fn with_position(mut self, position: Position) -> Self {
        self.original_position = Some(position);
        self
    }

    /// Returns the event, or the resolved target if this was a link.
    ///
    /// `None` only for links whose target could not be resolved.
    pub fn event(&self) -> Option<&RecordedEvent> {
        match &self.resolution {
            Resolution::Event => Some(&self.original),
            Resolution::Link(target) => target.as_ref(),
        }
    }

    /// Returns the link event, if this was a resolved link.
    pub fn link(&self) -> Option<&RecordedEvent> {
        match self.resolution {
            Resolution::Event => None,
            Resolution::Link(_) => Some(&self.original),
        }
    }

    /// Returns the event that was actually read from the stream:
    /// the link if present, the event otherwise.
    pub fn original_event(&self) -> &RecordedEvent {
        &self.original
    }

    /// Returns the stream the original event was read from.
    pub fn original_stream_id(&self) -> &str {
        &self.original.stream_id
    }

    /// Returns the sequence number of the original event.
    pub fn original_event_number(&self) -> i64 {
        self.original.event_number
    }

    /// Returns the position in the `$all` log, when read from it.
    pub fn original_position(&self) -> Option<Position> {
        self.original_position
    }

    /// Returns true if the original event is a link that has been resolved.
    pub fn is_resolved(&self) -> bool {
        matches!(self.resolution, Resolution::Link(Some(_)))
    }
}

impl From<RecordedEvent> for ResolvedEvent {
    fn from(event: RecordedEvent) -> Self {
        ResolvedEvent::new(event)
    }
}

/// A point in the global `$all` log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Position {
    /// Commit position of the record.
    pub commit: i64,
    /// Prepare position of the record.
    pub prepare: i64,
}

impl Position {
    /// Creates a new position.
    pub const fn new(commit: i64, prepare: i64) -> Self {
        Self { commit, prepare }
    }

    /// Position of the first record in the log.
    pub const fn start() -> Self {
        Self::new(0, 0)
    }

    /// Position past the last record in the log.
    pub const fn end() -> Self {
        Self::new(-1, -1)
    }

    /// Returns true if this is the [`Position::end`] sentinel.
    pub fn is_end(&self) -> bool {
        *self == Self::end()
    }

    /// Encodes the position the way it appears in `$all` feed urls.
    pub fn to_hex(&self) -> String {
        format!("{:016X}{:016X}", self.commit, self.prepare)
    }

    /// Parses a position encoded with [`Position::to_hex`].
    pub fn from_hex(value: &str) -> Option<Self> {
        if value.len() != 32 || !value.is_ascii() {
            return None;
        }

        let commit = u64::from_str_radix(&value[..16], 16).ok()? as i64;
        let prepare = u64::from_str_radix(&value[16..], 16).ok()? as i64;

        Some(Self::new(commit, prepare))
    }
}

impl PartialOrd for Position {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Position {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.commit, self.prepare).cmp(&(other.commit, other.prepare))
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.commit, self.prepare)
    }
}

/// An event to be appended to a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventData {
    /// Identifier of the event, used by the server for idempotent writes.
    pub event_id: Uuid,
    /// The type tag of the event.
    pub event_type: String,
    /// Whether `data` and `metadata` are JSON documents.
    pub is_json: bool,
    /// The event payload.
    pub data: Vec<u8>,
    /// The event metadata payload.
    pub metadata: Vec<u8>,
}

impl EventData {
    /// Creates a new JSON event by serializing the payload.
    pub fn json<T>(event_type: impl Into<String>, payload: &T) -> serde_json::Result<Self>
    where
        T: Serialize + ?Sized,
    {
        Ok(Self {
            event_id: Uuid::new_v4(),
            event_type: event_type.into(),
            is_json: true,
            data: serde_json::to_vec(payload)?,
            metadata: Vec::new(),
        })
    }

    /// Creates a new event with an opaque binary payload.
    pub fn binary(event_type: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type: event_type.into(),
            is_json: false,
            data: payload.into(),
            metadata: Vec::new(),
        }
    }

    /// Creates a link event pointing to `number` in `stream`.
    pub fn link_to(stream: &str, number: i64) -> Self {
        Self::binary(LINK_EVENT_TYPE, format!("{number}@{stream}"))
    }

    /// Overrides the generated event id.
    #[must_use]
    pub fn with_id(mut self, event_id: Uuid) -> Self {
        self.event_id = event_id;
        self
    }

    /// Sets the metadata to the JSON serialization of `metadata`.
    pub fn with_json_metadata<T>(mut self, metadata: &T) -> serde_json::Result<Self>
    where
        T: Serialize + ?Sized,
    {
        self.metadata = serde_json::to_vec(metadata)?;
        Ok(self)
    }
}

/// Direction of a read operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadDirection {
    /// From older to newer events.
    Forward,
    /// From newer to older events.
    Backward,
}

/// Outcome of reading a page from a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SliceReadStatus {
    /// The read succeeded.
    Success,
    /// The stream does not exist.
    StreamNotFound,
    /// The stream has been deleted.
    StreamDeleted,
}

/// A page of events read from a single stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEventsSlice {
    /// Outcome of the read.
    pub status: SliceReadStatus,
    /// The stream that has been read.
    pub stream: String,
    /// The event number the read started from.
    pub from_event_number: i64,
    /// The direction of the read.
    pub direction: ReadDirection,
    /// Events read, in the order of `direction`.
    pub events: Vec<ResolvedEvent>,
    /// Event number the next page should be read from.
    pub next_event_number: i64,
    /// Number of the last event in the stream known when the page was read.
    pub last_event_number: i64,
    /// Whether the page reached the end of the stream.
    pub is_end_of_stream: bool,
}

impl StreamEventsSlice {
    pub(crate) fn empty(
        status: SliceReadStatus,
        stream: &str,
        from_event_number: i64,
        direction: ReadDirection,
    ) -> Self {
        Self {
            status,
            stream: stream.to_owned(),
            from_event_number,
            direction,
            events: Vec::new(),
            next_event_number: from_event_number,
            last_event_number: STREAM_END,
            is_end_of_stream: true,
        }
    }
}

/// A page of events read from the `$all` log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllEventsSlice {
    /// The direction of the read.
    pub direction: ReadDirection,
    /// The position the read started from.
    pub from_position: Position,
    /// Position the next page should be read from.
    pub next_position: Position,
    /// Events read, in the order of `direction`.
    pub events: Vec<ResolvedEvent>,
    /// Whether the page reached the end of the log.
    pub is_end_of_stream: bool,
}

/// Outcome of reading a single event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventReadStatus {
    /// The event was found.
    Success,
    /// The stream exists but the event does not.
    NotFound,
    /// The stream does not exist.
    NoStream,
    /// The stream has been deleted.
    StreamDeleted,
}

/// Result of reading a single event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventReadResult {
    /// Outcome of the read.
    pub status: EventReadStatus,
    /// The stream that has been read.
    pub stream: String,
    /// The event number requested.
    pub event_number: i64,
    /// The event, when `status` is [`EventReadStatus::Success`].
    pub event: Option<ResolvedEvent>,
}

/// Result of a successful write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteResult {
    /// The version the stream is at after the write; use it as
    /// [`ExpectedVersion::Exact`](crate::version::ExpectedVersion::Exact) for the next one.
    pub next_expected_version: i64,
}
