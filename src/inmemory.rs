//! Contains an in-memory implementation of the Store API,
//! backed by a thread-safe [`std::collections::HashMap`].
//!
//! Useful for testing code built on top of the [`Store`](crate::store::Store)
//! traits without a running server.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::error::{self, Error, Result};
use crate::event::{
    AllEventsSlice, EventData, EventReadResult, EventReadStatus, Position, ReadDirection,
    RecordedEvent, ResolvedEvent, SliceReadStatus, StreamEventsSlice, WriteResult, STREAM_END,
};
use crate::metadata::{
    metastream_of, StreamMetadata, StreamMetadataResult, METADATA_EVENT_TYPE,
};
use crate::store::{
    NakAction, PersistentSubscriptionEvent, PersistentSubscriptionSettings,
    PersistentSubscriptionStatus, PersistentSubscriptions, ReadOptions, Reader, Writer,
};
use crate::version::{ConflictError, ExpectedVersion};

const ALL_STREAM: &str = "$all";

#[derive(Debug, Default)]
struct EventStream {
    events: Vec<RecordedEvent>,
    truncate_before: i64,
    soft_deleted: bool,
    hard_deleted: bool,
}

impl EventStream {
    fn last_event_number(&self) -> Option<i64> {
        self.events.last().map(|event| event.event_number)
    }

    /// Version used for optimistic concurrency checks.
    fn current_version(&self) -> Option<i64> {
        if self.soft_deleted {
            return None;
        }

        self.last_event_number()
    }

    fn is_visible(&self) -> bool {
        !self.soft_deleted && !self.events.is_empty()
    }

    fn get(&self, number: i64) -> Option<&RecordedEvent> {
        if number < self.truncate_before {
            return None;
        }

        usize::try_from(number)
            .ok()
            .and_then(|index| self.events.get(index))
    }
}

#[derive(Debug)]
struct InFlight {
    event: ResolvedEvent,
    retry_count: u32,
    sent_at: Instant,
}

#[derive(Debug)]
struct Group {
    stream: String,
    settings: PersistentSubscriptionSettings,
    next_event_number: i64,
    retries: VecDeque<(ResolvedEvent, u32)>,
    in_flight: Vec<InFlight>,
    parked: Vec<ResolvedEvent>,
}

impl Group {
    fn retry(&mut self, event: ResolvedEvent, retry_count: u32) {
        if retry_count > self.settings.max_retry_count {
            self.parked.push(event);
        } else {
            self.retries.push_back((event, retry_count));
        }
    }

    fn expire_timed_out(&mut self) {
        let timeout = Duration::from_millis(self.settings.message_timeout_milliseconds);
        let (expired, in_flight): (Vec<_>, Vec<_>) = std::mem::take(&mut self.in_flight)
            .into_iter()
            .partition(|message| message.sent_at.elapsed() >= timeout);

        self.in_flight = in_flight;

        for message in expired {
            self.retry(message.event, message.retry_count + 1);
        }
    }

    fn take_in_flight(&mut self, id: &Uuid) -> Option<InFlight> {
        let index = self
            .in_flight
            .iter()
            .position(|message| &message.event.original_event().event_id == id)?;

        Some(self.in_flight.remove(index))
    }
}

#[derive(Debug, Default)]
struct Backend {
    streams: HashMap<String, EventStream>,
    log: Vec<(String, i64)>,
    denied: HashSet<String>,
    groups: HashMap<(String, String), Group>,
}

impl Backend {
    fn check_access(&self, stream: &str) -> Result<()> {
        if self.denied.contains(stream) {
            return Err(Error::AccessDenied(format!("access to '{stream}' denied")));
        }

        Ok(())
    }

    fn resolve(&self, event: &RecordedEvent, resolve_link_tos: bool) -> ResolvedEvent {
        if !resolve_link_tos || !event.is_link() {
            return ResolvedEvent::new(event.clone());
        }

        let target = event
            .link_pointer()
            .and_then(|(number, stream)| self.streams.get(stream)?.get(number))
            .cloned();

        ResolvedEvent::resolved_link(event.clone(), target)
    }

    fn log_event(&self, index: usize, resolve_link_tos: bool) -> Option<ResolvedEvent> {
        let (stream, number) = self.log.get(index)?;
        let event = self.streams.get(stream)?.events.get(*number as usize)?;
        let position = Position::new(index as i64, index as i64);

        Some(self.resolve(event, resolve_link_tos).with_position(position))
    }

    fn append(
        &mut self,
        stream: &str,
        expected: ExpectedVersion,
        events: Vec<EventData>,
    ) -> Result<WriteResult> {
        self.check_access(stream)?;

        let state = self.streams.entry(stream.to_owned()).or_default();

        if state.hard_deleted {
            return Err(Error::StreamDeleted(stream.to_owned()));
        }

        let current = state.current_version();

        if !expected.is_satisfied_by(current) {
            return Err(ConflictError {
                stream: stream.to_owned(),
                expected,
                actual: Some(current.unwrap_or(STREAM_END)),
            }
            .into());
        }

        let mut next = state.last_event_number().map_or(0, |last| last + 1);
        let created = Utc::now();

        for event in events {
            state.events.push(RecordedEvent {
                stream_id: stream.to_owned(),
                event_number: next,
                event_id: event.event_id,
                event_type: event.event_type,
                is_json: event.is_json,
                data: event.data,
                metadata: event.metadata,
                created: Some(created),
            });

            self.log.push((stream.to_owned(), next));
            next += 1;
        }

        state.soft_deleted = false;

        Ok(WriteResult {
            next_expected_version: next - 1,
        })
    }

    fn group_mut(&mut self, stream: &str, group: &str) -> Result<&mut Group> {
        self.groups
            .get_mut(&(stream.to_owned(), group.to_owned()))
            .ok_or_else(|| Error::PersistentSubscriptionNotFound {
                stream: stream.to_owned(),
                group: group.to_owned(),
            })
    }
}

/// In-memory implementation of the Store API.
///
/// Cloned instances share the same data.
#[derive(Debug, Clone, Default)]
pub struct InMemory {
    backend: Arc<RwLock<Backend>>,
    appended: Arc<Notify>,
}

impl InMemory {
    /// Makes every operation on `stream` fail with [`Error::AccessDenied`].
    /// Use `"$all"` to deny reading the `$all` log.
    pub fn deny_access(&self, stream: impl Into<String>) {
        self.backend.write().denied.insert(stream.into());
    }

    /// Returns the number of events delivered to a persistent subscription
    /// group that have not been acknowledged yet.
    pub fn in_flight_count(&self, stream: &str, group: &str) -> Option<usize> {
        self.backend
            .read()
            .groups
            .get(&(stream.to_owned(), group.to_owned()))
            .map(|group| group.in_flight.len())
    }

    /// Returns the events parked by a persistent subscription group.
    pub fn parked_events(&self, stream: &str, group: &str) -> Vec<ResolvedEvent> {
        self.backend
            .read()
            .groups
            .get(&(stream.to_owned(), group.to_owned()))
            .map(|group| group.parked.clone())
            .unwrap_or_default()
    }

    /// Runs `read` until it returns a non-empty result, or the long-poll
    /// duration has expired.
    async fn long_poll<T>(
        &self,
        long_poll: Option<Duration>,
        is_empty: impl Fn(&T) -> bool + Send,
        read: impl Fn(&Backend) -> Result<T> + Send,
    ) -> Result<T> {
        let deadline = long_poll.map(|duration| tokio::time::Instant::now() + duration);

        loop {
            let notified = self.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let result = read(&self.backend.read())?;

            match deadline {
                Some(deadline) if is_empty(&result) && tokio::time::Instant::now() < deadline => {
                    let _ = tokio::time::timeout_at(deadline, notified).await;
                },
                _ => return Ok(result),
            }
        }
    }
}

#[async_trait]
impl Reader for InMemory {
    async fn read_event(
        &self,
        stream: &str,
        number: i64,
        resolve_link_tos: bool,
    ) -> Result<EventReadResult> {
        error::ensure_stream(stream)?;
        error::ensure_event_number(number)?;

        let backend = self.backend.read();
        backend.check_access(stream)?;

        let result = |status: EventReadStatus, event: Option<ResolvedEvent>| EventReadResult {
            status,
            stream: stream.to_owned(),
            event_number: number,
            event,
        };

        let Some(state) = backend
            .streams
            .get(stream)
            .filter(|state| state.is_visible() || state.hard_deleted)
        else {
            return Ok(result(EventReadStatus::NoStream, None));
        };

        if state.hard_deleted {
            return Ok(result(EventReadStatus::StreamDeleted, None));
        }

        let number = if number == STREAM_END {
            state.last_event_number().unwrap_or(STREAM_END)
        } else {
            number
        };

        Ok(match state.get(number) {
            Some(event) => result(
                EventReadStatus::Success,
                Some(backend.resolve(event, resolve_link_tos)),
            ),
            None => result(EventReadStatus::NotFound, None),
        })
    }

    async fn read_stream_forward(
        &self,
        stream: &str,
        start: i64,
        count: usize,
        options: &ReadOptions,
    ) -> Result<StreamEventsSlice> {
        error::ensure_stream(stream)?;
        error::ensure_start(start)?;
        error::ensure_count(count)?;

        let direction = ReadDirection::Forward;
        let is_empty = |slice: &StreamEventsSlice| slice.events.is_empty();

        self.long_poll(options.long_poll, is_empty, |backend| {
            backend.check_access(stream)?;

            let state = match backend.streams.get(stream) {
                Some(state) if state.hard_deleted => {
                    return Ok(StreamEventsSlice::empty(
                        SliceReadStatus::StreamDeleted,
                        stream,
                        start,
                        direction,
                    ))
                },
                Some(state) if state.is_visible() => state,
                _ => {
                    return Ok(StreamEventsSlice::empty(
                        SliceReadStatus::StreamNotFound,
                        stream,
                        start,
                        direction,
                    ))
                },
            };

            let last = state.last_event_number().unwrap_or(STREAM_END);
            let from = start.max(state.truncate_before);
            let events: Vec<_> = (from..=last)
                .take(count)
                .filter_map(|number| state.get(number))
                .map(|event| backend.resolve(event, options.resolve_link_tos))
                .collect();

            let next_event_number = from + events.len() as i64;

            Ok(StreamEventsSlice {
                status: SliceReadStatus::Success,
                stream: stream.to_owned(),
                from_event_number: start,
                direction,
                events,
                next_event_number,
                last_event_number: last,
                is_end_of_stream: next_event_number > last,
            })
        })
        .await
    }

    async fn read_stream_backward(
        &self,
        stream: &str,
        start: i64,
        count: usize,
        options: &ReadOptions,
    ) -> Result<StreamEventsSlice> {
        error::ensure_stream(stream)?;
        error::ensure_event_number(start)?;
        error::ensure_count(count)?;

        let backend = self.backend.read();
        backend.check_access(stream)?;

        let direction = ReadDirection::Backward;
        let state = match backend.streams.get(stream) {
            Some(state) if state.hard_deleted => {
                return Ok(StreamEventsSlice::empty(
                    SliceReadStatus::StreamDeleted,
                    stream,
                    start,
                    direction,
                ))
            },
            Some(state) if state.is_visible() => state,
            _ => {
                return Ok(StreamEventsSlice::empty(
                    SliceReadStatus::StreamNotFound,
                    stream,
                    start,
                    direction,
                ))
            },
        };

        let last = state.last_event_number().unwrap_or(STREAM_END);
        let from = if start == STREAM_END { last } else { start.min(last) };
        let events: Vec<_> = (state.truncate_before..=from)
            .rev()
            .take(count)
            .filter_map(|number| state.get(number))
            .map(|event| backend.resolve(event, options.resolve_link_tos))
            .collect();

        let next_event_number = from - events.len() as i64;

        Ok(StreamEventsSlice {
            status: SliceReadStatus::Success,
            stream: stream.to_owned(),
            from_event_number: start,
            direction,
            events,
            next_event_number,
            last_event_number: last,
            is_end_of_stream: next_event_number < state.truncate_before,
        })
    }

    async fn read_all_forward(
        &self,
        position: Position,
        count: usize,
        options: &ReadOptions,
    ) -> Result<AllEventsSlice> {
        error::ensure_count(count)?;

        let is_empty = |slice: &AllEventsSlice| slice.events.is_empty();

        self.long_poll(options.long_poll, is_empty, |backend| {
            backend.check_access(ALL_STREAM)?;

            let from = if position.is_end() {
                backend.log.len()
            } else {
                usize::try_from(position.commit).unwrap_or_default()
            };

            let events: Vec<_> = (from..backend.log.len())
                .take(count)
                .filter_map(|index| backend.log_event(index, options.resolve_link_tos))
                .collect();

            let next = (from + events.len()) as i64;

            Ok(AllEventsSlice {
                direction: ReadDirection::Forward,
                from_position: position,
                next_position: Position::new(next, next),
                events,
                is_end_of_stream: next as usize >= backend.log.len(),
            })
        })
        .await
    }

    async fn read_all_backward(
        &self,
        position: Position,
        count: usize,
        options: &ReadOptions,
    ) -> Result<AllEventsSlice> {
        error::ensure_count(count)?;

        let backend = self.backend.read();
        backend.check_access(ALL_STREAM)?;

        let before = if position.is_end() {
            backend.log.len()
        } else {
            usize::try_from(position.commit)
                .unwrap_or_default()
                .min(backend.log.len())
        };

        let events: Vec<_> = (0..before)
            .rev()
            .take(count)
            .filter_map(|index| backend.log_event(index, options.resolve_link_tos))
            .collect();

        let next = (before - events.len()) as i64;

        Ok(AllEventsSlice {
            direction: ReadDirection::Backward,
            from_position: position,
            next_position: Position::new(next, next),
            events,
            is_end_of_stream: next == 0,
        })
    }

    async fn get_stream_metadata(&self, stream: &str) -> Result<StreamMetadataResult> {
        error::ensure_stream(stream)?;

        let backend = self.backend.read();
        backend.check_access(stream)?;

        let is_stream_deleted = backend
            .streams
            .get(stream)
            .map_or(false, |state| state.hard_deleted);

        let Some(event) = backend
            .streams
            .get(&metastream_of(stream))
            .and_then(|state| state.events.last())
        else {
            return Ok(StreamMetadataResult::empty(stream, is_stream_deleted));
        };

        Ok(StreamMetadataResult {
            stream: stream.to_owned(),
            is_stream_deleted,
            meta_stream_version: event.event_number,
            metadata: event.as_json()?,
        })
    }
}

#[async_trait]
impl Writer for InMemory {
    async fn append_to_stream(
        &self,
        stream: &str,
        expected: ExpectedVersion,
        events: Vec<EventData>,
    ) -> Result<WriteResult> {
        error::ensure_stream(stream)?;

        if events.is_empty() {
            return Err(Error::InvalidArgument("events must not be empty".into()));
        }

        let result = self.backend.write().append(stream, expected, events)?;
        self.appended.notify_waiters();

        Ok(result)
    }

    async fn delete_stream(
        &self,
        stream: &str,
        expected: ExpectedVersion,
        hard_delete: bool,
    ) -> Result<()> {
        error::ensure_stream(stream)?;

        let mut backend = self.backend.write();
        backend.check_access(stream)?;

        let state = backend.streams.entry(stream.to_owned()).or_default();

        if state.hard_deleted {
            return Err(Error::StreamDeleted(stream.to_owned()));
        }

        let current = state.current_version();

        if !expected.is_satisfied_by(current) {
            return Err(ConflictError {
                stream: stream.to_owned(),
                expected,
                actual: Some(current.unwrap_or(STREAM_END)),
            }
            .into());
        }

        if hard_delete {
            state.hard_deleted = true;
        } else {
            state.soft_deleted = true;
            state.truncate_before = state.last_event_number().map_or(0, |last| last + 1);
        }

        Ok(())
    }

    async fn set_stream_metadata(
        &self,
        stream: &str,
        expected_meta_version: ExpectedVersion,
        metadata: &StreamMetadata,
    ) -> Result<WriteResult> {
        error::ensure_stream(stream)?;

        let event = EventData::json(METADATA_EVENT_TYPE, metadata)?;

        let result = {
            let mut backend = self.backend.write();
            backend.check_access(stream)?;

            if let Some(truncate_before) = metadata.truncate_before {
                if let Some(state) = backend.streams.get_mut(stream) {
                    state.truncate_before = truncate_before;
                }
            }

            backend.append(&metastream_of(stream), expected_meta_version, vec![event])?
        };

        self.appended.notify_waiters();

        Ok(result)
    }
}

#[async_trait]
impl PersistentSubscriptions for InMemory {
    async fn create_persistent_subscription(
        &self,
        stream: &str,
        group: &str,
        settings: &PersistentSubscriptionSettings,
    ) -> Result<PersistentSubscriptionStatus> {
        error::ensure_stream(stream)?;
        error::ensure_group(group)?;

        let mut backend = self.backend.write();
        backend.check_access(stream)?;

        let key = (stream.to_owned(), group.to_owned());
        if backend.groups.contains_key(&key) {
            return Ok(PersistentSubscriptionStatus::AlreadyExists);
        }

        let next_event_number = if settings.start_from < 0 {
            backend
                .streams
                .get(stream)
                .and_then(EventStream::last_event_number)
                .map_or(0, |last| last + 1)
        } else {
            settings.start_from
        };

        backend.groups.insert(
            key,
            Group {
                stream: stream.to_owned(),
                settings: settings.clone(),
                next_event_number,
                retries: VecDeque::new(),
                in_flight: Vec::new(),
                parked: Vec::new(),
            },
        );

        Ok(PersistentSubscriptionStatus::Success)
    }

    async fn update_persistent_subscription(
        &self,
        stream: &str,
        group: &str,
        settings: &PersistentSubscriptionSettings,
    ) -> Result<PersistentSubscriptionStatus> {
        error::ensure_stream(stream)?;
        error::ensure_group(group)?;

        let mut backend = self.backend.write();
        backend.check_access(stream)?;

        Ok(match backend.groups.get_mut(&(stream.to_owned(), group.to_owned())) {
            Some(existing) => {
                existing.settings = settings.clone();
                PersistentSubscriptionStatus::Success
            },
            None => PersistentSubscriptionStatus::NotFound,
        })
    }

    async fn delete_persistent_subscription(
        &self,
        stream: &str,
        group: &str,
    ) -> Result<PersistentSubscriptionStatus> {
        error::ensure_stream(stream)?;
        error::ensure_group(group)?;

        let mut backend = self.backend.write();
        backend.check_access(stream)?;

        Ok(
            match backend.groups.remove(&(stream.to_owned(), group.to_owned())) {
                Some(_) => PersistentSubscriptionStatus::Success,
                None => PersistentSubscriptionStatus::NotFound,
            },
        )
    }

    async fn read_from_subscription(
        &self,
        stream: &str,
        group: &str,
        amount: usize,
    ) -> Result<Vec<PersistentSubscriptionEvent>> {
        error::ensure_stream(stream)?;
        error::ensure_group(group)?;
        error::ensure_count(amount)?;

        let mut guard = self.backend.write();
        let backend = &mut *guard;
        backend.check_access(stream)?;

        let subscription = backend
            .groups
            .get_mut(&(stream.to_owned(), group.to_owned()))
            .ok_or_else(|| Error::PersistentSubscriptionNotFound {
                stream: stream.to_owned(),
                group: group.to_owned(),
            })?;

        subscription.expire_timed_out();

        let mut batch = Vec::with_capacity(amount);

        while batch.len() < amount {
            let Some((event, retry_count)) = subscription.retries.pop_front() else {
                break;
            };

            batch.push((event, retry_count));
        }

        if let Some(state) = backend.streams.get(&subscription.stream) {
            while batch.len() < amount {
                let Some(event) = state.get(subscription.next_event_number) else {
                    break;
                };

                let resolved = if subscription.settings.resolve_link_tos && event.is_link() {
                    let target = event
                        .link_pointer()
                        .and_then(|(number, target)| backend_get(&backend.streams, target, number));

                    ResolvedEvent::resolved_link(event.clone(), target)
                } else {
                    ResolvedEvent::new(event.clone())
                };

                batch.push((resolved, 0));
                subscription.next_event_number += 1;
            }
        }

        let now = Instant::now();
        subscription
            .in_flight
            .extend(batch.iter().map(|(event, retry_count)| InFlight {
                event: event.clone(),
                retry_count: *retry_count,
                sent_at: now,
            }));

        // The server hands out the newest events first.
        Ok(batch
            .into_iter()
            .rev()
            .map(|(event, retry_count)| PersistentSubscriptionEvent { event, retry_count })
            .collect())
    }

    async fn ack_events(&self, stream: &str, group: &str, ids: &[Uuid]) -> Result<()> {
        error::ensure_stream(stream)?;
        error::ensure_group(group)?;

        let mut backend = self.backend.write();
        backend.check_access(stream)?;

        let subscription = backend.group_mut(stream, group)?;
        for id in ids {
            subscription.take_in_flight(id);
        }

        Ok(())
    }

    async fn nack_events(
        &self,
        stream: &str,
        group: &str,
        ids: &[Uuid],
        action: NakAction,
        reason: &str,
    ) -> Result<()> {
        error::ensure_stream(stream)?;
        error::ensure_group(group)?;

        let mut backend = self.backend.write();
        backend.check_access(stream)?;

        let subscription = backend.group_mut(stream, group)?;
        for id in ids {
            let Some(message) = subscription.take_in_flight(id) else {
                continue;
            };

            tracing::trace!(stream, group, %id, ?action, reason, "Event not acknowledged");

            match action {
                NakAction::Retry => subscription.retry(message.event, message.retry_count + 1),
                NakAction::Park => subscription.parked.push(message.event),
                NakAction::Skip | NakAction::Stop => {},
            }
        }

        Ok(())
    }
}

fn backend_get(
    streams: &HashMap<String, EventStream>,
    stream: &str,
    number: i64,
) -> Option<RecordedEvent> {
    streams.get(stream)?.get(number).cloned()
}
