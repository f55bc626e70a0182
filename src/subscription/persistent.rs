//! Client of the server-side persistent subscription groups.
//!
//! The subscription polls the group for events, delivers them in order to a
//! [`PersistentHandler`], and acknowledges them when `auto_ack` is enabled.
//! Events can also be acknowledged, or reported as failed, through the
//! [`PersistentSubscriptionHandle`] passed to the handler.
//!
//! A handler error drops the subscription without reporting the event as
//! failed: the server redelivers it once its message timeout expires.
//!
//! Events already buffered when the subscription is stopped are delivered
//! before the drop notification.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::{self, Error, Result};
use crate::event::ResolvedEvent;
use crate::store::{NakAction, PersistentSubscriptionEvent, PersistentSubscriptions};
use crate::subscription::{
    dropped_by, DropData, LiveQueue, Queued, StopHandle, SubscriptionDropReason,
};

/// Options of a [`PersistentSubscription`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Options {
    /// Number of events requested by each poll.
    pub buffer_size: usize,
    /// Acknowledge each event once the handler processed it successfully.
    pub auto_ack: bool,
    /// Pause between polls that returned no events.
    pub idle_backoff: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            buffer_size: 10,
            auto_ack: true,
            idle_backoff: Duration::from_millis(100),
        }
    }
}

impl Options {
    pub(crate) fn validate(&self) -> Result<()> {
        error::ensure_count(self.buffer_size)
    }
}

/// Handle of a running persistent subscription, used to acknowledge
/// events and to stop the subscription.
#[derive(Clone)]
pub struct PersistentSubscriptionHandle {
    store: Arc<dyn PersistentSubscriptions>,
    stream: String,
    group: String,
    stop: StopHandle,
}

impl fmt::Debug for PersistentSubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistentSubscriptionHandle")
            .field("stream", &self.stream)
            .field("group", &self.group)
            .field("stop", &self.stop)
            .finish()
    }
}

impl PersistentSubscriptionHandle {
    /// Name of the subscribed stream.
    pub fn stream_id(&self) -> &str {
        &self.stream
    }

    /// Name of the subscription group.
    pub fn group_name(&self) -> &str {
        &self.group
    }

    /// Stops the subscription, after the event being processed.
    pub fn stop(&self) {
        self.stop.stop();
    }

    /// Returns true if the subscription has been requested to stop.
    pub fn is_stopped(&self) -> bool {
        self.stop.is_stopped()
    }

    /// Acknowledges the processing of an event.
    pub async fn acknowledge(&self, event: &ResolvedEvent) -> Result<()> {
        self.acknowledge_event_id(event.original_event().event_id)
            .await
    }

    /// Acknowledges the processing of several events.
    pub async fn acknowledge_multiple(&self, events: &[ResolvedEvent]) -> Result<()> {
        self.acknowledge_event_ids(&ids_of(events)).await
    }

    /// Acknowledges the processing of the event with the specified id.
    pub async fn acknowledge_event_id(&self, id: Uuid) -> Result<()> {
        self.acknowledge_event_ids(&[id]).await
    }

    /// Acknowledges the processing of the events with the specified ids.
    pub async fn acknowledge_event_ids(&self, ids: &[Uuid]) -> Result<()> {
        self.store.ack_events(&self.stream, &self.group, ids).await
    }

    /// Reports the failed processing of an event.
    pub async fn fail(&self, event: &ResolvedEvent, action: NakAction, reason: &str) -> Result<()> {
        self.fail_event_id(event.original_event().event_id, action, reason)
            .await
    }

    /// Reports the failed processing of several events.
    pub async fn fail_multiple(
        &self,
        events: &[ResolvedEvent],
        action: NakAction,
        reason: &str,
    ) -> Result<()> {
        self.fail_event_ids(&ids_of(events), action, reason).await
    }

    /// Reports the failed processing of the event with the specified id.
    pub async fn fail_event_id(&self, id: Uuid, action: NakAction, reason: &str) -> Result<()> {
        self.fail_event_ids(&[id], action, reason).await
    }

    /// Reports the failed processing of the events with the specified ids.
    pub async fn fail_event_ids(&self, ids: &[Uuid], action: NakAction, reason: &str) -> Result<()> {
        self.store
            .nack_events(&self.stream, &self.group, ids, action, reason)
            .await
    }
}

fn ids_of(events: &[ResolvedEvent]) -> Vec<Uuid> {
    events
        .iter()
        .map(|event| event.original_event().event_id)
        .collect()
}

/// Handler of the events delivered by a [`PersistentSubscription`].
#[async_trait]
pub trait PersistentHandler: Send {
    /// Called for every event, in order; `retry_count` is the number of
    /// previous deliveries of the event.
    async fn event_appeared(
        &mut self,
        subscription: &PersistentSubscriptionHandle,
        event: &ResolvedEvent,
        retry_count: u32,
    ) -> anyhow::Result<()>;

    /// Called exactly once, when the subscription gets dropped.
    async fn subscription_dropped(
        &mut self,
        _subscription: &PersistentSubscriptionHandle,
        _drop: &DropData,
    ) {
    }
}

/// Consumer of a persistent subscription group.
pub struct PersistentSubscription<H> {
    handle: PersistentSubscriptionHandle,
    options: Options,
    handler: H,
    queue: Arc<LiveQueue<PersistentSubscriptionEvent>>,
    started: bool,
    dropped: Option<DropData>,
}

impl<H> PersistentSubscription<H>
where
    H: PersistentHandler,
{
    pub(crate) fn new(
        store: Arc<dyn PersistentSubscriptions>,
        stream: String,
        group: String,
        options: Options,
        handler: H,
    ) -> Self {
        let queue = Arc::new(LiveQueue::new(Some(options.buffer_size)));

        Self {
            handle: PersistentSubscriptionHandle {
                store,
                stream,
                group,
                stop: StopHandle::with_queue(queue.clone()),
            },
            options,
            handler,
            queue,
            started: false,
            dropped: None,
        }
    }

    /// Returns the handle of the subscription.
    pub fn handle(&self) -> PersistentSubscriptionHandle {
        self.handle.clone()
    }

    /// Stops the subscription; same as calling [`PersistentSubscriptionHandle::stop`].
    pub fn stop(&self) {
        self.handle.stop();
    }

    /// Runs the subscription until it gets dropped, and returns why.
    ///
    /// Fails with [`Error::SubscriptionStopped`] if started again, or after a stop.
    pub async fn start(&mut self) -> Result<DropData> {
        if self.started || self.handle.is_stopped() {
            return Err(Error::SubscriptionStopped);
        }

        self.started = true;

        tracing::debug!(
            subscription.stream = self.handle.stream_id(),
            subscription.group = self.handle.group_name(),
            "Persistent subscription started"
        );

        loop {
            while let Some(item) = self.queue.try_pop() {
                let data = match item {
                    Queued::Event(message) => match self.process(message).await {
                        Ok(()) => continue,
                        Err(data) => data,
                    },
                    Queued::Drop(data) => data,
                };

                return Ok(self.drop_subscription(data).await);
            }

            let page = self
                .handle
                .store
                .read_from_subscription(
                    &self.handle.stream,
                    &self.handle.group,
                    self.options.buffer_size,
                )
                .await;

            match page {
                Err(err) => {
                    let data = failure(err);
                    return Ok(self.drop_subscription(data).await);
                },
                Ok(page) if page.is_empty() => {
                    self.handle.stop.sleep(self.options.idle_backoff).await;
                },
                Ok(page) => {
                    // Pages come newest first.
                    for message in page.into_iter().rev() {
                        let id = message.event.original_event().event_id;

                        if self.queue.push(message).is_err() {
                            // Left in flight: the server redelivers it after its message timeout.
                            tracing::warn!(
                                subscription.stream = self.handle.stream_id(),
                                subscription.group = self.handle.group_name(),
                                event.id = %id,
                                "Persistent subscription buffer is full, event not delivered"
                            );
                        }
                    }
                },
            }
        }
    }

    async fn process(
        &mut self,
        message: PersistentSubscriptionEvent,
    ) -> std::result::Result<(), DropData> {
        self.handler
            .event_appeared(&self.handle, &message.event, message.retry_count)
            .await
            .map_err(|err| {
                tracing::warn!(
                    subscription.stream = self.handle.stream_id(),
                    subscription.group = self.handle.group_name(),
                    event.id = %message.event.original_event().event_id,
                    error = %err,
                    "Event handler failed"
                );

                DropData::with_error(SubscriptionDropReason::EventHandlerException, err)
            })?;

        if self.options.auto_ack {
            self.handle
                .acknowledge(&message.event)
                .await
                .map_err(failure)?;
        }

        Ok(())
    }

    async fn drop_subscription(&mut self, data: DropData) -> DropData {
        if let Some(dropped) = &self.dropped {
            return dropped.clone();
        }

        self.queue.drop_with(data.clone());
        let data = self.queue.drop_data().unwrap_or(data);

        self.handle.stop();

        tracing::debug!(
            subscription.stream = self.handle.stream_id(),
            subscription.group = self.handle.group_name(),
            reason = %data.reason,
            "Persistent subscription dropped"
        );

        self.dropped = Some(data.clone());
        self.handler.subscription_dropped(&self.handle, &data).await;

        data
    }
}

fn failure(err: Error) -> DropData {
    match err {
        Error::PersistentSubscriptionNotFound { .. } => {
            DropData::with_error(SubscriptionDropReason::SubscribingError, err)
        },
        err => dropped_by(err, SubscriptionDropReason::ServerError),
    }
}

#[cfg(test)]
mod test {
    use parking_lot::Mutex;

    use super::*;
    use crate::event::EventData;
    use crate::inmemory::InMemory;
    use crate::store::{PersistentSubscriptionSettings, Writer};
    use crate::subscription::SubscribeExt;
    use crate::version::ExpectedVersion;

    #[derive(Clone, Default)]
    struct Nack {
        deliveries: Arc<Mutex<Vec<(i64, u32)>>>,
    }

    #[async_trait]
    impl PersistentHandler for Nack {
        async fn event_appeared(
            &mut self,
            subscription: &PersistentSubscriptionHandle,
            event: &ResolvedEvent,
            retry_count: u32,
        ) -> anyhow::Result<()> {
            self.deliveries
                .lock()
                .push((event.original_event_number(), retry_count));

            if retry_count == 0 {
                subscription
                    .fail(event, NakAction::Retry, "first attempt")
                    .await?;
            } else {
                subscription.acknowledge(event).await?;
                subscription.stop();
            }

            Ok(())
        }
    }

    #[tokio::test]
    async fn manual_nack_makes_the_server_redeliver() {
        let store = InMemory::default();
        store
            .append_to_stream(
                "payments",
                ExpectedVersion::Any,
                vec![EventData::binary("PaymentReceived", b"10".to_vec())],
            )
            .await
            .expect("append should not fail");

        store
            .create_persistent_subscription(
                "payments",
                "billing",
                &PersistentSubscriptionSettings::default().start_from_beginning(),
            )
            .await
            .expect("group creation should not fail");

        let handler = Nack::default();
        let options = Options {
            auto_ack: false,
            ..Options::default()
        };

        let mut subscription = store
            .connect_to_persistent_subscription("payments", "billing", options, handler.clone())
            .expect("subscription options are valid");

        let dropped = tokio::time::timeout(Duration::from_secs(5), subscription.start())
            .await
            .expect("subscription should stop")
            .expect("subscription should start");

        assert_eq!(SubscriptionDropReason::UserInitiated, dropped.reason);
        assert_eq!(vec![(0, 0), (0, 1)], *handler.deliveries.lock());
        assert_eq!(Some(0), store.in_flight_count("payments", "billing"));
    }

    #[tokio::test]
    async fn missing_group_is_a_subscribing_error() {
        let store = InMemory::default();

        let mut subscription = store
            .connect_to_persistent_subscription(
                "payments",
                "missing",
                Options::default(),
                Nack::default(),
            )
            .expect("subscription options are valid");

        let dropped = subscription.start().await.expect("subscription should start");

        assert_eq!(SubscriptionDropReason::SubscribingError, dropped.reason);
    }
}
