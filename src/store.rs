//! The Store API: request/response operations exposed by the remote event store.
//!
//! The API is split in three traits, [`Reader`], [`Writer`] and
//! [`PersistentSubscriptions`]; any type implementing all of them
//! is a [`Store`] through a blanket implementation.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::event::{
    AllEventsSlice, EventData, EventReadResult, Position, ResolvedEvent, StreamEventsSlice,
    WriteResult,
};
use crate::metadata::{StreamMetadata, StreamMetadataResult};
use crate::version::ExpectedVersion;

/// Options shared by all the read operations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadOptions {
    /// Resolve link events into the events they point to.
    pub resolve_link_tos: bool,

    /// Ask the server to hold the request up to this long when there
    /// are no new events to return, instead of answering with an empty page.
    pub long_poll: Option<Duration>,
}

impl ReadOptions {
    /// Sets [`ReadOptions::resolve_link_tos`].
    #[must_use]
    pub fn resolve_link_tos(mut self, resolve: bool) -> Self {
        self.resolve_link_tos = resolve;
        self
    }

    /// Sets [`ReadOptions::long_poll`].
    #[must_use]
    pub fn long_poll(mut self, long_poll: Duration) -> Self {
        self.long_poll = Some(long_poll);
        self
    }
}

/// Interface used to read events and metadata from the store.
#[async_trait]
pub trait Reader: Send + Sync {
    /// Reads a single event; `number` -1 reads the last event of the stream.
    async fn read_event(
        &self,
        stream: &str,
        number: i64,
        resolve_link_tos: bool,
    ) -> Result<EventReadResult>;

    /// Reads `count` events from `stream`, starting at `start` and moving forward.
    async fn read_stream_forward(
        &self,
        stream: &str,
        start: i64,
        count: usize,
        options: &ReadOptions,
    ) -> Result<StreamEventsSlice>;

    /// Reads `count` events from `stream`, starting at `start` (-1 for the end)
    /// and moving backward.
    async fn read_stream_backward(
        &self,
        stream: &str,
        start: i64,
        count: usize,
        options: &ReadOptions,
    ) -> Result<StreamEventsSlice>;

    /// Reads `count` events from the `$all` log, from `position` included, moving forward.
    async fn read_all_forward(
        &self,
        position: Position,
        count: usize,
        options: &ReadOptions,
    ) -> Result<AllEventsSlice>;

    /// Reads `count` events from the `$all` log, before `position`, moving backward.
    async fn read_all_backward(
        &self,
        position: Position,
        count: usize,
        options: &ReadOptions,
    ) -> Result<AllEventsSlice>;

    /// Reads the metadata of a stream.
    async fn get_stream_metadata(&self, stream: &str) -> Result<StreamMetadataResult>;
}

/// Interface used to write events and metadata into the store.
#[async_trait]
pub trait Writer: Send + Sync {
    /// Appends events to a stream, checking the expected version first.
    async fn append_to_stream(
        &self,
        stream: &str,
        expected: ExpectedVersion,
        events: Vec<EventData>,
    ) -> Result<WriteResult>;

    /// Deletes a stream. Hard deletes are permanent: the stream can never be recreated.
    async fn delete_stream(
        &self,
        stream: &str,
        expected: ExpectedVersion,
        hard_delete: bool,
    ) -> Result<()>;

    /// Writes the metadata of a stream.
    async fn set_stream_metadata(
        &self,
        stream: &str,
        expected_meta_version: ExpectedVersion,
        metadata: &StreamMetadata,
    ) -> Result<WriteResult>;
}

/// Strategy used by the server to distribute events among the
/// consumers of a persistent subscription group.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsumerStrategy {
    /// Each event goes to the next consumer in turn.
    #[default]
    RoundRobin,
    /// Events go to a single consumer, until it fails.
    DispatchToSingle,
    /// Events of the same stream always go to the same consumer.
    Pinned,
}

/// Server-side configuration of a persistent subscription group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistentSubscriptionSettings {
    /// Resolve link events into the events they point to.
    #[serde(rename = "resolveLinktos")]
    pub resolve_link_tos: bool,
    /// Event number the group starts from; -1 starts from the current end.
    pub start_from: i64,
    /// Collect extra statistics on the server.
    pub extra_statistics: bool,
    /// Time after which an unacknowledged event is retried.
    pub message_timeout_milliseconds: u64,
    /// Retries before an event gets parked.
    pub max_retry_count: u32,
    /// Size of the live buffer on the server.
    pub live_buffer_size: u32,
    /// Number of events read at once when catching up.
    pub read_batch_size: u32,
    /// Size of the history buffer on the server.
    #[serde(rename = "bufferSize")]
    pub history_buffer_size: u32,
    /// Time between checkpoints.
    #[serde(rename = "checkPointAfterMilliseconds")]
    pub checkpoint_after_milliseconds: u64,
    /// Minimum number of processed events before a checkpoint.
    #[serde(rename = "minCheckPointCount")]
    pub min_checkpoint_count: u32,
    /// Maximum number of processed events before a checkpoint.
    #[serde(rename = "maxCheckPointCount")]
    pub max_checkpoint_count: u32,
    /// Maximum number of consumers, 0 for unbounded.
    pub max_subscriber_count: u32,
    /// How events are distributed among consumers.
    pub named_consumer_strategy: ConsumerStrategy,
}

impl Default for PersistentSubscriptionSettings {
    fn default() -> Self {
        Self {
            resolve_link_tos: false,
            start_from: -1,
            extra_statistics: false,
            message_timeout_milliseconds: 30_000,
            max_retry_count: 10,
            live_buffer_size: 500,
            read_batch_size: 20,
            history_buffer_size: 500,
            checkpoint_after_milliseconds: 2_000,
            min_checkpoint_count: 10,
            max_checkpoint_count: 1_000,
            max_subscriber_count: 0,
            named_consumer_strategy: ConsumerStrategy::RoundRobin,
        }
    }
}

impl PersistentSubscriptionSettings {
    /// Starts the group from the first event of the stream.
    #[must_use]
    pub fn start_from_beginning(mut self) -> Self {
        self.start_from = 0;
        self
    }

    /// Sets [`PersistentSubscriptionSettings::resolve_link_tos`].
    #[must_use]
    pub fn resolve_link_tos(mut self, resolve: bool) -> Self {
        self.resolve_link_tos = resolve;
        self
    }

    /// Sets [`PersistentSubscriptionSettings::message_timeout_milliseconds`].
    #[must_use]
    pub fn message_timeout(mut self, timeout: Duration) -> Self {
        self.message_timeout_milliseconds = timeout.as_millis() as u64;
        self
    }

    /// Sets [`PersistentSubscriptionSettings::max_retry_count`].
    #[must_use]
    pub fn max_retry_count(mut self, count: u32) -> Self {
        self.max_retry_count = count;
        self
    }
}

/// Outcome of a persistent subscription management call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistentSubscriptionStatus {
    /// The operation succeeded.
    Success,
    /// A group with the same name already exists on the stream.
    AlreadyExists,
    /// The group does not exist.
    NotFound,
}

/// Action the server should take for events that failed processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NakAction {
    /// Park the event, so that it is not retried until replayed.
    Park,
    /// Retry the event.
    Retry,
    /// Skip the event.
    Skip,
    /// Stop the subscription.
    Stop,
}

impl NakAction {
    /// Name of the action as expected by the server.
    pub fn as_str(self) -> &'static str {
        match self {
            NakAction::Park => "Park",
            NakAction::Retry => "Retry",
            NakAction::Skip => "Skip",
            NakAction::Stop => "Stop",
        }
    }
}

/// An event delivered by a persistent subscription group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistentSubscriptionEvent {
    /// The event itself.
    pub event: ResolvedEvent,
    /// How many times the event has been delivered before.
    pub retry_count: u32,
}

/// Interface used to manage and consume server-side persistent subscription groups.
#[async_trait]
pub trait PersistentSubscriptions: Send + Sync {
    /// Creates a new subscription group on a stream.
    async fn create_persistent_subscription(
        &self,
        stream: &str,
        group: &str,
        settings: &PersistentSubscriptionSettings,
    ) -> Result<PersistentSubscriptionStatus>;

    /// Updates the settings of an existing subscription group.
    async fn update_persistent_subscription(
        &self,
        stream: &str,
        group: &str,
        settings: &PersistentSubscriptionSettings,
    ) -> Result<PersistentSubscriptionStatus>;

    /// Deletes a subscription group.
    async fn delete_persistent_subscription(
        &self,
        stream: &str,
        group: &str,
    ) -> Result<PersistentSubscriptionStatus>;

    /// Reads up to `amount` events from the group buffer, newest first.
    async fn read_from_subscription(
        &self,
        stream: &str,
        group: &str,
        amount: usize,
    ) -> Result<Vec<PersistentSubscriptionEvent>>;

    /// Acknowledges the processing of the events with the specified ids.
    async fn ack_events(&self, stream: &str, group: &str, ids: &[Uuid]) -> Result<()>;

    /// Reports the failed processing of the events with the specified ids.
    async fn nack_events(
        &self,
        stream: &str,
        group: &str,
        ids: &[Uuid],
        action: NakAction,
        reason: &str,
    ) -> Result<()>;
}

/// A remote event store, able to serve all the operations of the Store API.
pub trait Store: Reader + Writer + PersistentSubscriptions + Send + Sync {}

impl<T> Store for T where T: Reader + Writer + PersistentSubscriptions + Send + Sync {}
