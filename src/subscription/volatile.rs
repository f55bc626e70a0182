//! Volatile subscriptions: live tailing of a stream or of `$all`,
//! without any historical replay.

use std::time::Duration;

use crate::error::{self, Error, Result};
use crate::event::{ResolvedEvent, SliceReadStatus};
use crate::store::{ReadOptions, Reader};
use crate::subscription::{
    dropped_by, DropData, Handler, Source, StopHandle, SubscriptionDropReason, Tail,
};

/// Options of a [`VolatileSubscription`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Options {
    /// Resolve link events into the events they point to.
    pub resolve_link_tos: bool,
    /// How long each poll waits on the server for new events.
    pub long_poll: Duration,
    /// Maximum number of events read by each poll.
    pub page_size: usize,
    /// Pause between polls that returned no events.
    pub idle_backoff: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            resolve_link_tos: false,
            long_poll: Duration::from_secs(1),
            page_size: 20,
            idle_backoff: Duration::from_millis(100),
        }
    }
}

impl Options {
    pub(crate) fn validate(&self) -> Result<()> {
        error::ensure_count(self.page_size)
    }
}

/// Subscription delivering the events appended to a [`Source`]
/// after it has connected.
#[derive(Debug)]
pub struct VolatileSubscription<S, Src, H>
where
    Src: Source,
{
    store: S,
    source: Src,
    options: Options,
    handler: H,
    stop: StopHandle,
    tail: Option<Tail<Src::Cursor>>,
    dropped: Option<DropData>,
}

impl<S, Src, H> VolatileSubscription<S, Src, H>
where
    S: Reader,
    Src: Source,
    H: Handler,
{
    pub(crate) fn new(store: S, source: Src, options: Options, handler: H) -> Self {
        Self {
            store,
            source,
            options,
            handler,
            stop: StopHandle::new(),
            tail: None,
            dropped: None,
        }
    }

    /// Returns the handle used to stop the subscription.
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Stops the subscription; same as calling [`StopHandle::stop`].
    pub fn unsubscribe(&self) {
        self.stop.stop();
    }

    /// Returns the cursor of the last event in the source when connecting,
    /// if the subscription is connected and the source was not empty.
    pub fn last_cursor(&self) -> Option<Src::Cursor> {
        self.tail.and_then(|tail| tail.last)
    }

    /// Reads the current end of the source: only events after it are delivered.
    ///
    /// Called by [`VolatileSubscription::start`] when not connected yet.
    pub async fn connect(&mut self) -> Result<Tail<Src::Cursor>> {
        if let Some(tail) = self.tail {
            return Ok(tail);
        }

        let options = ReadOptions::default().resolve_link_tos(self.options.resolve_link_tos);
        let tail = self.source.read_tail(&self.store, &options).await?;

        tracing::debug!(
            subscription.source = self.source.name(),
            subscription.next = ?tail.next,
            subscription.last = ?tail.last,
            "Volatile subscription connected"
        );

        self.tail = Some(tail);
        Ok(tail)
    }

    /// Runs the subscription until it gets dropped, and returns why.
    ///
    /// Fails with [`Error::SubscriptionStopped`] if the subscription
    /// has been stopped or dropped before.
    pub async fn start(&mut self) -> Result<DropData> {
        if self.dropped.is_some() || self.stop.is_stopped() {
            return Err(Error::SubscriptionStopped);
        }

        let tail = match self.connect().await {
            Ok(tail) => tail,
            Err(err) => {
                let data = dropped_by(err, SubscriptionDropReason::ServerError);
                return Ok(self.drop_subscription(data).await);
            },
        };

        let options = ReadOptions::default()
            .resolve_link_tos(self.options.resolve_link_tos)
            .long_poll(self.options.long_poll);

        let mut next = tail.next;
        let mut last_seen = tail.last;

        loop {
            if self.stop.is_stopped() {
                let data = DropData::new(SubscriptionDropReason::UserInitiated);
                return Ok(self.drop_subscription(data).await);
            }

            let page = tokio::select! {
                page = self.source.read_forward(&self.store, next, self.options.page_size, &options) => page,
                _ = self.stop.stopped() => continue,
            };

            let page = match page {
                Ok(page) => page,
                Err(err) => {
                    let data = dropped_by(err, SubscriptionDropReason::ServerError);
                    return Ok(self.drop_subscription(data).await);
                },
            };

            if page.status == SliceReadStatus::StreamDeleted {
                let data = DropData::with_error(
                    SubscriptionDropReason::ServerError,
                    Error::StreamDeleted(self.source.name().to_owned()),
                );

                return Ok(self.drop_subscription(data).await);
            }

            let received = page.events.len();

            for event in page.events {
                let cursor = self.source.cursor_of(&event);

                if matches!((cursor, last_seen), (Some(cursor), Some(last)) if cursor <= last) {
                    continue;
                }

                if self.stop.is_stopped() {
                    break;
                }

                if let Err(err) = self.deliver(&event).await {
                    return Ok(self.drop_subscription(err).await);
                }

                last_seen = cursor.or(last_seen);
            }

            next = page.next;

            if received == 0 {
                self.stop.sleep(self.options.idle_backoff).await;
            }
        }
    }

    async fn deliver(&mut self, event: &ResolvedEvent) -> std::result::Result<(), DropData> {
        self.handler
            .event_appeared(&self.stop, event)
            .await
            .map_err(|err| {
                tracing::warn!(
                    subscription.source = self.source.name(),
                    event.number = event.original_event_number(),
                    error = %err,
                    "Event handler failed"
                );

                DropData::with_error(SubscriptionDropReason::EventHandlerException, err)
            })
    }

    async fn drop_subscription(&mut self, data: DropData) -> DropData {
        if let Some(dropped) = &self.dropped {
            return dropped.clone();
        }

        self.dropped = Some(data.clone());
        self.stop.stop();

        tracing::debug!(
            subscription.source = self.source.name(),
            reason = %data.reason,
            "Volatile subscription dropped"
        );

        self.handler.subscription_dropped(&self.stop, &data).await;

        data
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use async_trait::async_trait;
    use parking_lot::Mutex;

    use super::*;
    use crate::event::EventData;
    use crate::inmemory::InMemory;
    use crate::store::Writer;
    use crate::subscription::SubscribeExt;
    use crate::version::ExpectedVersion;

    #[derive(Clone, Default)]
    struct Collect {
        events: Arc<Mutex<Vec<i64>>>,
        drops: Arc<Mutex<Vec<SubscriptionDropReason>>>,
    }

    #[async_trait]
    impl Handler for Collect {
        async fn event_appeared(
            &mut self,
            subscription: &StopHandle,
            event: &ResolvedEvent,
        ) -> anyhow::Result<()> {
            let mut events = self.events.lock();
            events.push(event.original_event_number());

            if events.len() == 2 {
                subscription.stop();
            }

            Ok(())
        }

        async fn subscription_dropped(&mut self, _subscription: &StopHandle, drop: &DropData) {
            self.drops.lock().push(drop.reason);
        }
    }

    fn event(kind: &str) -> EventData {
        EventData::binary(kind, kind.as_bytes().to_vec())
    }

    #[tokio::test]
    async fn only_events_appended_after_connecting_are_delivered() {
        let store = InMemory::default();
        let handler = Collect::default();

        store
            .append_to_stream("volatile", ExpectedVersion::Any, vec![event("before")])
            .await
            .expect("append should not fail");

        let mut subscription = store
            .subscribe_to_stream("volatile", Options::default(), handler.clone())
            .expect("subscription options are valid");

        let tail = subscription.connect().await.expect("connect should not fail");
        assert_eq!(1, tail.next);
        assert_eq!(Some(0), subscription.last_cursor());

        store
            .append_to_stream(
                "volatile",
                ExpectedVersion::Exact(0),
                vec![event("after-1"), event("after-2"), event("after-3")],
            )
            .await
            .expect("append should not fail");

        let dropped = tokio::time::timeout(Duration::from_secs(5), subscription.start())
            .await
            .expect("subscription should stop")
            .expect("subscription should start");

        assert_eq!(SubscriptionDropReason::UserInitiated, dropped.reason);
        assert_eq!(vec![1, 2], *handler.events.lock());
        assert_eq!(
            vec![SubscriptionDropReason::UserInitiated],
            *handler.drops.lock()
        );

        assert!(matches!(
            subscription.start().await,
            Err(Error::SubscriptionStopped)
        ));
    }

    #[tokio::test]
    async fn access_denied_drops_the_subscription() {
        let store = InMemory::default();
        store.deny_access("secret");

        let handler = Collect::default();
        let mut subscription = store
            .subscribe_to_stream("secret", Options::default(), handler.clone())
            .expect("subscription options are valid");

        let dropped = subscription.start().await.expect("subscription should start");

        assert_eq!(SubscriptionDropReason::AccessDenied, dropped.reason);
        assert!(dropped.error.is_some());
        assert_eq!(
            vec![SubscriptionDropReason::AccessDenied],
            *handler.drops.lock()
        );
    }

    #[tokio::test]
    async fn unsubscribing_before_start_fails_the_start() {
        let store = InMemory::default();
        let subscription = store.subscribe_to_all(Options::default(), Collect::default());
        let mut subscription = subscription.expect("subscription options are valid");

        subscription.unsubscribe();
        subscription.unsubscribe();

        assert!(matches!(
            subscription.start().await,
            Err(Error::SubscriptionStopped)
        ));
    }
}
