//! Catch-up subscriptions: historical replay from a checkpoint, followed by
//! live tailing, delivering every event exactly once and in order.
//!
//! A catch-up subscription goes through the following phases:
//!
//! 1. it reads the historical events, page by page, until the end of the source;
//! 2. it starts a [`VolatileSubscription`] in a background task, which pushes
//!    the live events into a bounded queue instead of delivering them;
//! 3. it reads again the historical events, up to the last event known to the
//!    volatile subscription when it connected, to fill any gap between the
//!    first phase and the start of the live events;
//! 4. it drains the queue of live events in order, up to the drop notification.
//!    A queue overflow discards the events still waiting in it.
//!
//! Events with a cursor not greater than the last delivered one are skipped,
//! so that events read in more than one phase are delivered only once.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;

use crate::error::{self, Error, Result};
use crate::event::{ResolvedEvent, SliceReadStatus};
use crate::store::{ReadOptions, Reader};
use crate::subscription::volatile::{self, VolatileSubscription};
use crate::subscription::{
    dropped_by, AllSource, DropData, Handler, LiveQueue, Queued, Source, StopHandle,
    StreamSource, SubscriptionDropReason,
};

const END_OF_STREAM_BACKOFF: Duration = Duration::from_millis(10);

/// Options of a [`CatchUpSubscription`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Options {
    /// Number of events read by each historical page.
    pub read_batch_size: usize,
    /// Maximum number of live events waiting to be processed; the
    /// subscription drops with [`SubscriptionDropReason::ProcessingQueueOverflow`]
    /// when exceeded.
    pub max_live_queue_size: usize,
    /// Resolve link events into the events they point to.
    pub resolve_link_tos: bool,
    /// How long each live poll waits on the server for new events.
    pub long_poll: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            read_batch_size: 500,
            max_live_queue_size: 10_000,
            resolve_link_tos: false,
            long_poll: Duration::from_secs(1),
        }
    }
}

impl Options {
    pub(crate) fn validate(&self) -> Result<()> {
        error::ensure_count(self.read_batch_size)?;

        if self.max_live_queue_size == 0 {
            return Err(Error::InvalidArgument(
                "max_live_queue_size must be greater than zero".into(),
            ));
        }

        Ok(())
    }

    fn volatile(&self) -> volatile::Options {
        volatile::Options {
            resolve_link_tos: self.resolve_link_tos,
            long_poll: self.long_poll,
            page_size: self.read_batch_size,
            ..volatile::Options::default()
        }
    }
}

/// Catch-up subscription on a single stream.
pub type StreamCatchUpSubscription<S, H> = CatchUpSubscription<S, StreamSource, H>;

/// Catch-up subscription on the `$all` log.
pub type AllCatchUpSubscription<S, H> = CatchUpSubscription<S, AllSource, H>;

/// Feeds the live queue with the events of the inner volatile subscription.
struct LiveQueueFeeder {
    queue: Arc<LiveQueue<ResolvedEvent>>,
}

#[async_trait]
impl Handler for LiveQueueFeeder {
    async fn event_appeared(
        &mut self,
        subscription: &StopHandle,
        event: &ResolvedEvent,
    ) -> anyhow::Result<()> {
        if self.queue.push(event.clone()).is_err() {
            tracing::warn!(
                event.number = event.original_event_number(),
                "Live queue is full, dropping subscription"
            );

            self.queue.overflow(DropData::new(
                SubscriptionDropReason::ProcessingQueueOverflow,
            ));

            subscription.stop();
        }

        Ok(())
    }

    async fn subscription_dropped(&mut self, _subscription: &StopHandle, drop: &DropData) {
        self.queue.drop_with(drop.clone());
    }
}

/// Subscription delivering the events of a [`Source`] from a checkpoint,
/// then the live ones.
pub struct CatchUpSubscription<S, Src, H>
where
    Src: Source,
{
    store: S,
    source: Src,
    options: Options,
    handler: H,
    queue: Arc<LiveQueue<ResolvedEvent>>,
    stop: StopHandle,
    next_read: Src::Cursor,
    last_processed: Option<Src::Cursor>,
    live: Option<(StopHandle, JoinHandle<Result<DropData>>)>,
    started: bool,
    dropped: Option<DropData>,
}

impl<S, Src, H> CatchUpSubscription<S, Src, H>
where
    S: Reader + Clone + 'static,
    Src: Source,
    H: Handler,
{
    pub(crate) fn new(
        store: S,
        source: Src,
        checkpoint: Option<Src::Cursor>,
        options: Options,
        handler: H,
    ) -> Self {
        let queue = Arc::new(LiveQueue::new(Some(options.max_live_queue_size)));

        Self {
            next_read: checkpoint.map_or_else(|| source.first(), |c| source.after(c)),
            last_processed: checkpoint,
            stop: StopHandle::with_queue(queue.clone()),
            queue,
            store,
            source,
            options,
            handler,
            live: None,
            started: false,
            dropped: None,
        }
    }

    /// Returns the handle used to stop the subscription.
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Stops the subscription; same as calling [`StopHandle::stop`].
    pub fn stop(&self) {
        self.stop.stop();
    }

    /// Cursor of the last event delivered to the handler, to be used
    /// as checkpoint when resubscribing.
    pub fn last_processed(&self) -> Option<Src::Cursor> {
        self.last_processed
    }

    /// Runs the subscription until it gets dropped, and returns why.
    ///
    /// Failures never escape as errors: they drop the subscription, and the
    /// returned [`DropData`] carries them. The only error is
    /// [`Error::SubscriptionStopped`], when started again or after a stop.
    pub async fn start(&mut self) -> Result<DropData> {
        if self.started || self.stop.is_stopped() {
            return Err(Error::SubscriptionStopped);
        }

        self.started = true;

        tracing::debug!(
            subscription.source = self.source.name(),
            subscription.checkpoint = ?self.last_processed,
            "Catch-up subscription started"
        );

        if let Err(data) = self.read_history(None).await {
            return Ok(self.drop_subscription(data).await);
        }

        if let Err(data) = self.ensure_running() {
            return Ok(self.drop_subscription(data).await);
        }

        let mut volatile = VolatileSubscription::new(
            self.store.clone(),
            self.source.clone(),
            self.options.volatile(),
            LiveQueueFeeder {
                queue: self.queue.clone(),
            },
        );

        let tail = match volatile.connect().await {
            Ok(tail) => tail,
            Err(err) => {
                let data = dropped_by(err, SubscriptionDropReason::SubscribingError);
                return Ok(self.drop_subscription(data).await);
            },
        };

        let volatile_stop = volatile.stop_handle();
        let task = tokio::spawn(async move { volatile.start().await });
        self.live = Some((volatile_stop, task));

        if let Some(last) = tail.last {
            tracing::trace!(
                subscription.source = self.source.name(),
                subscription.bound = ?last,
                "Reading missed historical events"
            );

            if let Err(data) = self.read_history(Some(last)).await {
                return Ok(self.drop_subscription(data).await);
            }
        }

        if !self.queue.is_dropping() {
            tracing::debug!(
                subscription.source = self.source.name(),
                subscription.last_processed = ?self.last_processed,
                "Live processing started"
            );

            self.handler.live_processing_started(&self.stop).await;
        }

        loop {
            let data = match self.queue.pop().await {
                Queued::Event(event) => match self.try_process(&event).await {
                    Ok(()) => continue,
                    Err(data) => data,
                },
                Queued::Drop(data) => data,
            };

            return Ok(self.drop_subscription(data).await);
        }
    }

    /// Reads and delivers historical events, up to `bound` included if
    /// specified, or until the end of the source.
    async fn read_history(
        &mut self,
        bound: Option<Src::Cursor>,
    ) -> std::result::Result<(), DropData> {
        let options = ReadOptions::default().resolve_link_tos(self.options.resolve_link_tos);

        loop {
            self.ensure_running()?;

            let page = self
                .source
                .read_forward(&self.store, self.next_read, self.options.read_batch_size, &options)
                .await
                .map_err(|err| dropped_by(err, SubscriptionDropReason::CatchUpError))?;

            match page.status {
                SliceReadStatus::Success => {},
                SliceReadStatus::StreamNotFound if self.source.allows_missing(bound) => {
                    return Ok(())
                },
                SliceReadStatus::StreamNotFound => {
                    return Err(DropData::with_error(
                        SubscriptionDropReason::CatchUpError,
                        anyhow::anyhow!(
                            "stream '{}' not found while reading up to {:?}",
                            self.source.name(),
                            bound
                        ),
                    ))
                },
                SliceReadStatus::StreamDeleted => {
                    return Err(DropData::with_error(
                        SubscriptionDropReason::CatchUpError,
                        Error::StreamDeleted(self.source.name().to_owned()),
                    ))
                },
            }

            for event in &page.events {
                // Events past the bound are delivered by the live queue.
                let past_bound = match (bound, self.source.cursor_of(event)) {
                    (Some(bound), Some(cursor)) => cursor > bound,
                    _ => false,
                };

                if !past_bound {
                    self.ensure_running()?;
                    self.try_process(event).await?;
                }
            }

            self.next_read = page.next;

            let done = match bound {
                None => page.is_end_of_stream,
                Some(bound) => page.next > bound,
            };

            if done {
                return Ok(());
            }

            if page.is_end_of_stream {
                self.stop.sleep(END_OF_STREAM_BACKOFF).await;
            }
        }
    }

    /// Delivers the event, unless already delivered.
    async fn try_process(&mut self, event: &ResolvedEvent) -> std::result::Result<(), DropData> {
        let cursor = self.source.cursor_of(event);

        if let (Some(cursor), Some(last)) = (cursor, self.last_processed) {
            if cursor <= last {
                tracing::trace!(
                    event.cursor = ?cursor,
                    subscription.last_processed = ?last,
                    "Duplicated event detected; skipping"
                );

                return Ok(());
            }
        }

        let result = self.handler.event_appeared(&self.stop, event).await;

        if cursor.is_some() {
            self.last_processed = cursor;
        }

        result.map_err(|err| {
            tracing::warn!(
                subscription.source = self.source.name(),
                event.number = event.original_event_number(),
                error = %err,
                "Event handler failed"
            );

            DropData::with_error(SubscriptionDropReason::EventHandlerException, err)
        })
    }

    fn ensure_running(&self) -> std::result::Result<(), DropData> {
        match self.queue.drop_data() {
            Some(data) => Err(data),
            None => Ok(()),
        }
    }

    async fn drop_subscription(&mut self, data: DropData) -> DropData {
        if let Some(dropped) = &self.dropped {
            return dropped.clone();
        }

        self.queue.drop_with(data.clone());
        let data = self.queue.drop_data().unwrap_or(data);

        self.stop.stop();

        if let Some((volatile_stop, task)) = self.live.take() {
            volatile_stop.stop();

            if let Err(err) = task.await {
                tracing::error!(error = %err, "Live subscription task failed");
            }
        }

        tracing::debug!(
            subscription.source = self.source.name(),
            subscription.last_processed = ?self.last_processed,
            reason = %data.reason,
            "Catch-up subscription dropped"
        );

        self.dropped = Some(data.clone());
        self.handler.subscription_dropped(&self.stop, &data).await;

        data
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

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
        stop_after: usize,
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

            if events.len() == self.stop_after {
                subscription.stop();
            }

            Ok(())
        }
    }

    async fn append(store: &InMemory, stream: &str, count: usize) {
        let events = (0..count)
            .map(|i| EventData::binary("Appended", i.to_string().into_bytes()))
            .collect();

        store
            .append_to_stream(stream, ExpectedVersion::Any, events)
            .await
            .expect("append should not fail");
    }

    #[tokio::test]
    async fn delivery_starts_after_the_checkpoint() {
        let store = InMemory::default();
        append(&store, "checkpointed", 6).await;

        let handler = Collect {
            stop_after: 3,
            ..Collect::default()
        };

        let options = Options {
            read_batch_size: 2,
            ..Options::default()
        };

        let mut subscription = store
            .subscribe_to_stream_from("checkpointed", Some(2), options, handler.clone())
            .expect("subscription options are valid");

        let dropped = tokio::time::timeout(Duration::from_secs(5), subscription.start())
            .await
            .expect("subscription should stop")
            .expect("subscription should start");

        assert_eq!(SubscriptionDropReason::UserInitiated, dropped.reason);
        assert_eq!(vec![3, 4, 5], *handler.events.lock());
        assert_eq!(Some(5), subscription.last_processed());
    }

    #[tokio::test]
    async fn missing_stream_is_caught_up_immediately() {
        let store = InMemory::default();
        let handler = Collect {
            stop_after: 1,
            ..Collect::default()
        };

        let mut subscription = store
            .subscribe_to_stream_from("not-yet", None, Options::default(), handler.clone())
            .expect("subscription options are valid");

        let writer = store.clone();
        let append = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            append(&writer, "not-yet", 1).await;
        });

        let dropped = tokio::time::timeout(Duration::from_secs(5), subscription.start())
            .await
            .expect("subscription should stop")
            .expect("subscription should start");

        append.await.expect("append task should not panic");

        assert_eq!(SubscriptionDropReason::UserInitiated, dropped.reason);
        assert_eq!(vec![0], *handler.events.lock());
    }

    #[test]
    fn invalid_options_are_rejected() {
        let store = InMemory::default();

        let options = Options {
            max_live_queue_size: 0,
            ..Options::default()
        };

        assert!(matches!(
            store.subscribe_to_stream_from("stream", None, options, Collect::default()),
            Err(Error::InvalidArgument(_))
        ));

        assert!(matches!(
            store.subscribe_to_stream_from(
                "stream",
                Some(-3),
                Options::default(),
                Collect::default()
            ),
            Err(Error::InvalidArgument(_))
        ));
    }
}
