//! Module containing some extension traits to support code instrumentation
//! using the `tracing` crate.

use async_trait::async_trait;
use tracing::instrument;
use uuid::Uuid;

use crate::error::Result;
use crate::event::{
    AllEventsSlice, EventData, EventReadResult, Position, StreamEventsSlice, WriteResult,
};
use crate::metadata::{StreamMetadata, StreamMetadataResult};
use crate::store::{
    NakAction, PersistentSubscriptionEvent, PersistentSubscriptionSettings,
    PersistentSubscriptionStatus, PersistentSubscriptions, ReadOptions, Reader, Store, Writer,
};
use crate::version::ExpectedVersion;

/// [`Store`] type wrapper that provides instrumentation
/// features through the `tracing` crate.
///
/// Event payloads are never recorded, only their count.
#[derive(Debug, Clone)]
pub struct InstrumentedStore<T>
where
    T: Store,
{
    store: T,
}

impl<T> InstrumentedStore<T>
where
    T: Store,
{
    /// Returns the wrapped store.
    pub fn into_inner(self) -> T {
        self.store
    }
}

#[async_trait]
impl<T> Reader for InstrumentedStore<T>
where
    T: Store,
{
    #[allow(clippy::blocks_in_conditions)] // NOTE(ar3s3ru): seems to be a false positive.
    #[instrument(name = "store::Reader.read_event", err, skip(self))]
    async fn read_event(
        &self,
        stream: &str,
        number: i64,
        resolve_link_tos: bool,
    ) -> Result<EventReadResult> {
        self.store.read_event(stream, number, resolve_link_tos).await
    }

    #[allow(clippy::blocks_in_conditions)]
    #[instrument(name = "store::Reader.read_stream_forward", err, skip(self))]
    async fn read_stream_forward(
        &self,
        stream: &str,
        start: i64,
        count: usize,
        options: &ReadOptions,
    ) -> Result<StreamEventsSlice> {
        self.store
            .read_stream_forward(stream, start, count, options)
            .await
    }

    #[allow(clippy::blocks_in_conditions)]
    #[instrument(name = "store::Reader.read_stream_backward", err, skip(self))]
    async fn read_stream_backward(
        &self,
        stream: &str,
        start: i64,
        count: usize,
        options: &ReadOptions,
    ) -> Result<StreamEventsSlice> {
        self.store
            .read_stream_backward(stream, start, count, options)
            .await
    }

    #[allow(clippy::blocks_in_conditions)]
    #[instrument(name = "store::Reader.read_all_forward", err, skip(self))]
    async fn read_all_forward(
        &self,
        position: Position,
        count: usize,
        options: &ReadOptions,
    ) -> Result<AllEventsSlice> {
        self.store.read_all_forward(position, count, options).await
    }

    #[allow(clippy::blocks_in_conditions)]
    #[instrument(name = "store::Reader.read_all_backward", err, skip(self))]
    async fn read_all_backward(
        &self,
        position: Position,
        count: usize,
        options: &ReadOptions,
    ) -> Result<AllEventsSlice> {
        self.store.read_all_backward(position, count, options).await
    }

    #[allow(clippy::blocks_in_conditions)]
    #[instrument(name = "store::Reader.get_stream_metadata", ret, err, skip(self))]
    async fn get_stream_metadata(&self, stream: &str) -> Result<StreamMetadataResult> {
        self.store.get_stream_metadata(stream).await
    }
}

#[async_trait]
impl<T> Writer for InstrumentedStore<T>
where
    T: Store,
{
    #[allow(clippy::blocks_in_conditions)]
    #[instrument(
        name = "store::Writer.append_to_stream",
        ret,
        err,
        skip(self, events),
        fields(events = events.len())
    )]
    async fn append_to_stream(
        &self,
        stream: &str,
        expected: ExpectedVersion,
        events: Vec<EventData>,
    ) -> Result<WriteResult> {
        self.store.append_to_stream(stream, expected, events).await
    }

    #[allow(clippy::blocks_in_conditions)]
    #[instrument(name = "store::Writer.delete_stream", err, skip(self))]
    async fn delete_stream(
        &self,
        stream: &str,
        expected: ExpectedVersion,
        hard_delete: bool,
    ) -> Result<()> {
        self.store.delete_stream(stream, expected, hard_delete).await
    }

    #[allow(clippy::blocks_in_conditions)]
    #[instrument(name = "store::Writer.set_stream_metadata", ret, err, skip(self))]
    async fn set_stream_metadata(
        &self,
        stream: &str,
        expected_meta_version: ExpectedVersion,
        metadata: &StreamMetadata,
    ) -> Result<WriteResult> {
        self.store
            .set_stream_metadata(stream, expected_meta_version, metadata)
            .await
    }
}

#[async_trait]
impl<T> PersistentSubscriptions for InstrumentedStore<T>
where
    T: Store,
{
    #[allow(clippy::blocks_in_conditions)]
    #[instrument(
        name = "store::PersistentSubscriptions.create_persistent_subscription",
        ret,
        err,
        skip(self)
    )]
    async fn create_persistent_subscription(
        &self,
        stream: &str,
        group: &str,
        settings: &PersistentSubscriptionSettings,
    ) -> Result<PersistentSubscriptionStatus> {
        self.store
            .create_persistent_subscription(stream, group, settings)
            .await
    }

    #[allow(clippy::blocks_in_conditions)]
    #[instrument(
        name = "store::PersistentSubscriptions.update_persistent_subscription",
        ret,
        err,
        skip(self)
    )]
    async fn update_persistent_subscription(
        &self,
        stream: &str,
        group: &str,
        settings: &PersistentSubscriptionSettings,
    ) -> Result<PersistentSubscriptionStatus> {
        self.store
            .update_persistent_subscription(stream, group, settings)
            .await
    }

    #[allow(clippy::blocks_in_conditions)]
    #[instrument(
        name = "store::PersistentSubscriptions.delete_persistent_subscription",
        ret,
        err,
        skip(self)
    )]
    async fn delete_persistent_subscription(
        &self,
        stream: &str,
        group: &str,
    ) -> Result<PersistentSubscriptionStatus> {
        self.store.delete_persistent_subscription(stream, group).await
    }

    #[allow(clippy::blocks_in_conditions)]
    #[instrument(
        name = "store::PersistentSubscriptions.read_from_subscription",
        err,
        skip(self)
    )]
    async fn read_from_subscription(
        &self,
        stream: &str,
        group: &str,
        amount: usize,
    ) -> Result<Vec<PersistentSubscriptionEvent>> {
        self.store
            .read_from_subscription(stream, group, amount)
            .await
    }

    #[allow(clippy::blocks_in_conditions)]
    #[instrument(
        name = "store::PersistentSubscriptions.ack_events",
        err,
        skip(self, ids),
        fields(ids = ids.len())
    )]
    async fn ack_events(&self, stream: &str, group: &str, ids: &[Uuid]) -> Result<()> {
        self.store.ack_events(stream, group, ids).await
    }

    #[allow(clippy::blocks_in_conditions)]
    #[instrument(
        name = "store::PersistentSubscriptions.nack_events",
        err,
        skip(self, ids),
        fields(ids = ids.len())
    )]
    async fn nack_events(
        &self,
        stream: &str,
        group: &str,
        ids: &[Uuid],
        action: NakAction,
        reason: &str,
    ) -> Result<()> {
        self.store
            .nack_events(stream, group, ids, action, reason)
            .await
    }
}

/// Extension trait for any [`Store`] type to provide
/// instrumentation features through the `tracing` crate.
pub trait StoreExt: Store + Sized {
    /// Returns an instrumented version of the [`Store`] instance.
    fn with_tracing(self) -> InstrumentedStore<Self> {
        InstrumentedStore { store: self }
    }
}

impl<T> StoreExt for T where T: Store {}

#[cfg(test)]
mod test {
    use super::*;
    use crate::inmemory::InMemory;

    #[tokio::test]
    async fn instrumented_store_forwards_to_the_inner_store() {
        let store = InMemory::default().with_tracing();

        store
            .append_to_stream(
                "instrumented",
                ExpectedVersion::NoStream,
                vec![EventData::binary("Pinged", b"ping".to_vec())],
            )
            .await
            .expect("append should not fail");

        let read = store
            .into_inner()
            .read_event("instrumented", 0, false)
            .await
            .expect("read should not fail");

        assert_eq!(
            "Pinged",
            read.event.expect("event should exist").original_event().event_type
        );
    }
}
