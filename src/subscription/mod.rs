//! Subscriptions delivering events from the store to user-supplied handlers.
//!
//! Three kinds of subscriptions are available:
//!
//! * [`volatile`]: live tailing of a stream or `$all`, without replay,
//! * [`catchup`]: replay from a checkpoint followed by live tailing,
//!   delivering every event exactly once and in order,
//! * [`persistent`]: consumption of a server-side, competing-consumers group.
//!
//! Subscriptions are created through [`SubscribeExt`]. Their `start` method
//! runs the subscription loop until it gets dropped: spawn it on a dedicated
//! task, and use the [`StopHandle`] to stop it.

use std::collections::VecDeque;
use std::fmt::{self, Debug};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{watch, Notify};

use crate::error::{self, Error, Result};
use crate::event::{Position, ResolvedEvent, SliceReadStatus, STREAM_END, STREAM_START};
use crate::store::{PersistentSubscriptions, ReadOptions, Reader};

pub mod catchup;
pub mod persistent;
pub mod volatile;

use catchup::{AllCatchUpSubscription, StreamCatchUpSubscription};
use persistent::{PersistentHandler, PersistentSubscription};
use volatile::VolatileSubscription;

/// Reason a subscription has been dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionDropReason {
    /// The subscription has been stopped by the user.
    UserInitiated,
    /// The user is not allowed to read the subscribed stream.
    AccessDenied,
    /// The server returned an error.
    ServerError,
    /// The event handler returned an error.
    EventHandlerException,
    /// Live events arrived faster than they could be processed.
    ProcessingQueueOverflow,
    /// Subscribing to the live events failed.
    SubscribingError,
    /// Reading the historical events failed.
    CatchUpError,
    /// Unknown reason.
    Unknown,
}

impl fmt::Display for SubscriptionDropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Debug::fmt(self, f)
    }
}

/// Reason and, when available, cause of a subscription drop.
///
/// A subscription records its drop data only once: the first recorded
/// reason is the one reported to the handler.
#[derive(Debug, Clone)]
pub struct DropData {
    /// Why the subscription has been dropped.
    pub reason: SubscriptionDropReason,
    /// The error that caused the drop, if any.
    pub error: Option<Arc<anyhow::Error>>,
}

impl DropData {
    /// Drop data without an error.
    pub fn new(reason: SubscriptionDropReason) -> Self {
        Self {
            reason,
            error: None,
        }
    }

    /// Drop data caused by the specified error.
    pub fn with_error(reason: SubscriptionDropReason, error: impl Into<anyhow::Error>) -> Self {
        Self {
            reason,
            error: Some(Arc::new(error.into())),
        }
    }
}

/// An item of a subscription queue: an event to deliver,
/// or the notification that the subscription has been dropped.
#[derive(Debug, Clone)]
pub enum Queued<T> {
    /// An event to deliver to the handler.
    Event(T),
    /// The subscription has been dropped; always the last item of a queue.
    Drop(DropData),
}

#[derive(Debug)]
pub(crate) struct QueueFull;

#[derive(Debug)]
struct QueueState<T> {
    items: VecDeque<Queued<T>>,
    drop: Option<DropData>,
}

/// FIFO queue shared by the producer and the consumer of a subscription.
///
/// Once the drop notification has been appended, the queue ignores
/// any further event.
#[derive(Debug)]
pub(crate) struct LiveQueue<T> {
    state: Mutex<QueueState<T>>,
    available: Notify,
    capacity: Option<usize>,
}

impl<T> LiveQueue<T> {
    pub fn new(capacity: Option<usize>) -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                drop: None,
            }),
            available: Notify::new(),
            capacity,
        }
    }

    pub fn push(&self, item: T) -> std::result::Result<(), QueueFull> {
        let mut state = self.state.lock();

        if state.drop.is_some() {
            return Ok(());
        }

        if matches!(self.capacity, Some(capacity) if state.items.len() >= capacity) {
            return Err(QueueFull);
        }

        state.items.push_back(Queued::Event(item));
        drop(state);

        self.available.notify_one();
        Ok(())
    }

    /// Records the drop data and appends the drop notification,
    /// unless the queue has been dropped already.
    pub fn drop_with(&self, data: DropData) -> bool {
        let mut state = self.state.lock();

        if state.drop.is_some() {
            return false;
        }

        state.drop = Some(data.clone());
        state.items.push_back(Queued::Drop(data));
        drop(state);

        self.available.notify_one();
        true
    }

    /// Discards the events waiting in the queue, then records the drop
    /// like [`LiveQueue::drop_with`]. Nothing queued before the overflow
    /// gets delivered.
    pub fn overflow(&self, data: DropData) -> bool {
        let mut state = self.state.lock();

        if state.drop.is_some() {
            return false;
        }

        state.items.clear();
        state.drop = Some(data.clone());
        state.items.push_back(Queued::Drop(data));
        drop(state);

        self.available.notify_one();
        true
    }

    pub fn drop_data(&self) -> Option<DropData> {
        self.state.lock().drop.clone()
    }

    pub fn is_dropping(&self) -> bool {
        self.state.lock().drop.is_some()
    }

    pub fn try_pop(&self) -> Option<Queued<T>> {
        self.state.lock().items.pop_front()
    }

    pub async fn pop(&self) -> Queued<T> {
        loop {
            if let Some(item) = self.try_pop() {
                return item;
            }

            self.available.notified().await;
        }
    }
}

pub(crate) trait Interrupt: Send + Sync {
    fn interrupt(&self, data: DropData);
}

impl<T> Interrupt for LiveQueue<T>
where
    T: Send,
{
    fn interrupt(&self, data: DropData) {
        self.drop_with(data);
    }
}

/// Handle used to stop a running subscription.
///
/// Stopping is cooperative: the subscription loop notices the request
/// at its next poll or queue-drain boundary, then drops the subscription
/// with [`SubscriptionDropReason::UserInitiated`].
#[derive(Clone)]
pub struct StopHandle {
    signal: Arc<watch::Sender<bool>>,
    queue: Option<Arc<dyn Interrupt>>,
}

impl Debug for StopHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StopHandle")
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

impl StopHandle {
    pub(crate) fn new() -> Self {
        let (signal, _) = watch::channel(false);

        Self {
            signal: Arc::new(signal),
            queue: None,
        }
    }

    pub(crate) fn with_queue(queue: Arc<dyn Interrupt>) -> Self {
        Self {
            queue: Some(queue),
            ..Self::new()
        }
    }

    /// Requests the subscription to stop. Calling it more than once has no effect.
    pub fn stop(&self) {
        self.signal.send_replace(true);

        if let Some(queue) = &self.queue {
            queue.interrupt(DropData::new(SubscriptionDropReason::UserInitiated));
        }
    }

    /// Returns true if the subscription has been requested to stop.
    pub fn is_stopped(&self) -> bool {
        *self.signal.borrow()
    }

    pub(crate) async fn stopped(&self) {
        let mut receiver = self.signal.subscribe();
        // The sender lives as long as self, so waiting cannot fail.
        let _ = receiver.wait_for(|stopped| *stopped).await;
    }

    /// Sleeps for the specified duration, waking up early if stopped.
    pub(crate) async fn sleep(&self, duration: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(duration) => {},
            _ = self.stopped() => {},
        }
    }
}

/// Handler of the events delivered by volatile and catch-up subscriptions.
#[async_trait]
pub trait Handler: Send {
    /// Called for every event, in order. An error drops the subscription
    /// with [`SubscriptionDropReason::EventHandlerException`].
    async fn event_appeared(
        &mut self,
        subscription: &StopHandle,
        event: &ResolvedEvent,
    ) -> anyhow::Result<()>;

    /// Called once by catch-up subscriptions, when switching from
    /// historical to live events.
    async fn live_processing_started(&mut self, _subscription: &StopHandle) {}

    /// Called exactly once, when the subscription gets dropped.
    async fn subscription_dropped(&mut self, _subscription: &StopHandle, _drop: &DropData) {}
}

/// A page of events read from a [`Source`].
#[derive(Debug, Clone)]
pub struct Page<C> {
    /// Outcome of the read.
    pub status: SliceReadStatus,
    /// Events read, in order.
    pub events: Vec<ResolvedEvent>,
    /// Cursor to read the next page from.
    pub next: C,
    /// No further events were available.
    pub is_end_of_stream: bool,
}

/// End of a [`Source`] at the time it was read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tail<C> {
    /// Cursor to read new events from.
    pub next: C,
    /// Cursor of the last event; `None` if unknown or the source is empty.
    pub last: Option<C>,
}

/// Target of a subscription: a single stream, or the `$all` log.
#[async_trait]
pub trait Source: Clone + Debug + Send + Sync + 'static {
    /// Totally ordered cursor identifying events in the source.
    type Cursor: Copy + Ord + Debug + Send + Sync + 'static;

    /// Name of the source, for logging.
    fn name(&self) -> &str;

    /// Cursor of the first event in the source.
    fn first(&self) -> Self::Cursor;

    /// Cursor to read from to get the events following `checkpoint`.
    fn after(&self, checkpoint: Self::Cursor) -> Self::Cursor;

    /// Cursor of an event read from this source, if known.
    fn cursor_of(&self, event: &ResolvedEvent) -> Option<Self::Cursor>;

    /// Whether the source may legitimately not exist, when read up to `bound`.
    fn allows_missing(&self, bound: Option<Self::Cursor>) -> bool;

    /// Reads a page of events moving forward, from `from` included.
    async fn read_forward<R>(
        &self,
        reader: &R,
        from: Self::Cursor,
        count: usize,
        options: &ReadOptions,
    ) -> Result<Page<Self::Cursor>>
    where
        R: Reader + ?Sized;

    /// Reads the current end of the source.
    async fn read_tail<R>(&self, reader: &R, options: &ReadOptions) -> Result<Tail<Self::Cursor>>
    where
        R: Reader + ?Sized;
}

/// A single stream, with event numbers as cursors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSource {
    stream: String,
}

impl StreamSource {
    /// Source reading from the specified stream.
    pub fn new(stream: impl Into<String>) -> Self {
        Self {
            stream: stream.into(),
        }
    }
}

#[async_trait]
impl Source for StreamSource {
    type Cursor = i64;

    fn name(&self) -> &str {
        &self.stream
    }

    fn first(&self) -> i64 {
        STREAM_START
    }

    fn after(&self, checkpoint: i64) -> i64 {
        checkpoint + 1
    }

    fn cursor_of(&self, event: &ResolvedEvent) -> Option<i64> {
        Some(event.original_event_number())
    }

    fn allows_missing(&self, bound: Option<i64>) -> bool {
        matches!(bound, None | Some(STREAM_END))
    }

    async fn read_forward<R>(
        &self,
        reader: &R,
        from: i64,
        count: usize,
        options: &ReadOptions,
    ) -> Result<Page<i64>>
    where
        R: Reader + ?Sized,
    {
        let slice = reader
            .read_stream_forward(&self.stream, from, count, options)
            .await?;

        Ok(match slice.status {
            SliceReadStatus::Success => Page {
                status: slice.status,
                next: slice.next_event_number.max(from),
                is_end_of_stream: slice.is_end_of_stream,
                events: slice.events,
            },
            status => Page {
                status,
                events: Vec::new(),
                next: from,
                is_end_of_stream: true,
            },
        })
    }

    async fn read_tail<R>(&self, reader: &R, options: &ReadOptions) -> Result<Tail<i64>>
    where
        R: Reader + ?Sized,
    {
        let slice = reader
            .read_stream_backward(&self.stream, STREAM_END, 1, options)
            .await?;

        match slice.status {
            SliceReadStatus::StreamDeleted => Err(Error::StreamDeleted(self.stream.clone())),
            SliceReadStatus::StreamNotFound => Ok(Tail {
                next: STREAM_START,
                last: Some(STREAM_END),
            }),
            SliceReadStatus::Success => {
                let last = slice
                    .events
                    .first()
                    .map_or(slice.last_event_number, ResolvedEvent::original_event_number);

                Ok(Tail {
                    next: last + 1,
                    last: Some(last),
                })
            },
        }
    }
}

/// The `$all` log, with positions as cursors.
///
/// Events read through the HTTP API carry no position: those are
/// delivered without deduplication.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllSource;

#[async_trait]
impl Source for AllSource {
    type Cursor = Position;

    fn name(&self) -> &str {
        "$all"
    }

    fn first(&self) -> Position {
        Position::start()
    }

    fn after(&self, checkpoint: Position) -> Position {
        checkpoint
    }

    fn cursor_of(&self, event: &ResolvedEvent) -> Option<Position> {
        event.original_position()
    }

    fn allows_missing(&self, _bound: Option<Position>) -> bool {
        true
    }

    async fn read_forward<R>(
        &self,
        reader: &R,
        from: Position,
        count: usize,
        options: &ReadOptions,
    ) -> Result<Page<Position>>
    where
        R: Reader + ?Sized,
    {
        let slice = reader.read_all_forward(from, count, options).await?;

        Ok(Page {
            status: SliceReadStatus::Success,
            next: slice.next_position,
            is_end_of_stream: slice.is_end_of_stream,
            events: slice.events,
        })
    }

    async fn read_tail<R>(&self, reader: &R, options: &ReadOptions) -> Result<Tail<Position>>
    where
        R: Reader + ?Sized,
    {
        let slice = reader
            .read_all_backward(Position::end(), 1, options)
            .await?;

        let last = slice
            .events
            .first()
            .and_then(ResolvedEvent::original_position);

        Ok(Tail {
            next: last.unwrap_or(slice.next_position),
            last,
        })
    }
}

/// Maps a store error returned by a subscription loop to its drop data.
pub(crate) fn dropped_by(error: Error, otherwise: SubscriptionDropReason) -> DropData {
    let reason = match error {
        Error::AccessDenied(_) => SubscriptionDropReason::AccessDenied,
        _ => otherwise,
    };

    DropData::with_error(reason, error)
}

/// Extension trait to create subscriptions from any store.
pub trait SubscribeExt: Reader + Clone + Sized + 'static {
    /// Creates a volatile subscription on a stream.
    fn subscribe_to_stream<H>(
        &self,
        stream: impl Into<String>,
        options: volatile::Options,
        handler: H,
    ) -> Result<VolatileSubscription<Self, StreamSource, H>>
    where
        H: Handler,
    {
        let stream = stream.into();
        error::ensure_stream(&stream)?;
        options.validate()?;

        Ok(VolatileSubscription::new(
            self.clone(),
            StreamSource::new(stream),
            options,
            handler,
        ))
    }

    /// Creates a volatile subscription on the `$all` log.
    fn subscribe_to_all<H>(
        &self,
        options: volatile::Options,
        handler: H,
    ) -> Result<VolatileSubscription<Self, AllSource, H>>
    where
        H: Handler,
    {
        options.validate()?;

        Ok(VolatileSubscription::new(
            self.clone(),
            AllSource,
            options,
            handler,
        ))
    }

    /// Creates a catch-up subscription on a stream. Events are delivered
    /// from the one following `checkpoint`, or from the first one.
    fn subscribe_to_stream_from<H>(
        &self,
        stream: impl Into<String>,
        checkpoint: Option<i64>,
        options: catchup::Options,
        handler: H,
    ) -> Result<StreamCatchUpSubscription<Self, H>>
    where
        H: Handler,
    {
        let stream = stream.into();
        error::ensure_stream(&stream)?;

        if let Some(checkpoint) = checkpoint {
            error::ensure_start(checkpoint)?;
        }

        options.validate()?;

        Ok(StreamCatchUpSubscription::new(
            self.clone(),
            StreamSource::new(stream),
            checkpoint,
            options,
            handler,
        ))
    }

    /// Creates a catch-up subscription on the `$all` log. Events are
    /// delivered from the one following `checkpoint`, or from the first one.
    fn subscribe_to_all_from<H>(
        &self,
        checkpoint: Option<Position>,
        options: catchup::Options,
        handler: H,
    ) -> Result<AllCatchUpSubscription<Self, H>>
    where
        H: Handler,
    {
        options.validate()?;

        Ok(AllCatchUpSubscription::new(
            self.clone(),
            AllSource,
            checkpoint,
            options,
            handler,
        ))
    }

    /// Connects to an existing persistent subscription group.
    fn connect_to_persistent_subscription<H>(
        &self,
        stream: impl Into<String>,
        group: impl Into<String>,
        options: persistent::Options,
        handler: H,
    ) -> Result<PersistentSubscription<H>>
    where
        Self: PersistentSubscriptions,
        H: PersistentHandler,
    {
        let stream = stream.into();
        let group = group.into();
        error::ensure_stream(&stream)?;
        error::ensure_group(&group)?;
        options.validate()?;

        Ok(PersistentSubscription::new(
            Arc::new(self.clone()),
            stream,
            group,
            options,
            handler,
        ))
    }
}

impl<T> SubscribeExt for T where T: Reader + Clone + 'static {}
