#![allow(dead_code)]

use std::time::Duration;

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::StreamExt;

use eventstore_http::inmemory::InMemory;
use eventstore_http::store::Writer;
use eventstore_http::subscription::{DropData, Handler, StopHandle, SubscriptionDropReason};
use eventstore_http::{EventData, ExpectedVersion, ResolvedEvent};

const WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    Event(String, i64),
    LiveProcessingStarted,
    Dropped(SubscriptionDropReason),
}

pub fn event(stream: &str, number: i64) -> Notification {
    Notification::Event(stream.to_owned(), number)
}

/// Handler forwarding every callback to a channel.
pub struct Recorder {
    sender: mpsc::UnboundedSender<Notification>,
    fail_on: Option<i64>,
}

impl Recorder {
    pub fn new() -> (Self, Notifications) {
        let (sender, receiver) = mpsc::unbounded();

        (
            Self {
                sender,
                fail_on: None,
            },
            Notifications { receiver },
        )
    }

    /// Makes the handler fail on the event with the specified number.
    pub fn failing_on(mut self, number: i64) -> Self {
        self.fail_on = Some(number);
        self
    }

    pub fn notify(&self, notification: Notification) {
        // The test may have stopped listening already.
        let _ = self.sender.unbounded_send(notification);
    }
}

#[async_trait]
impl Handler for Recorder {
    async fn event_appeared(
        &mut self,
        _subscription: &StopHandle,
        event: &ResolvedEvent,
    ) -> anyhow::Result<()> {
        let number = event.original_event_number();
        self.notify(Notification::Event(
            event.original_stream_id().to_owned(),
            number,
        ));

        if self.fail_on == Some(number) {
            anyhow::bail!("failed to handle event #{number}");
        }

        Ok(())
    }

    async fn live_processing_started(&mut self, _subscription: &StopHandle) {
        self.notify(Notification::LiveProcessingStarted);
    }

    async fn subscription_dropped(&mut self, _subscription: &StopHandle, drop: &DropData) {
        self.notify(Notification::Dropped(drop.reason));
    }
}

pub struct Notifications {
    receiver: mpsc::UnboundedReceiver<Notification>,
}

impl Notifications {
    pub async fn next(&mut self) -> Notification {
        tokio::time::timeout(WAIT, self.receiver.next())
            .await
            .expect("timed out waiting for a notification")
            .expect("handler has been dropped")
    }

    pub async fn take(&mut self, count: usize) -> Vec<Notification> {
        let mut notifications = Vec::with_capacity(count);

        for _ in 0..count {
            notifications.push(self.next().await);
        }

        notifications
    }

    /// Collects the notifications left, once the handler has been dropped.
    pub async fn remaining(self) -> Vec<Notification> {
        tokio::time::timeout(WAIT, self.receiver.collect())
            .await
            .expect("handler should have been dropped")
    }
}

pub fn events(count: usize) -> Vec<EventData> {
    (0..count)
        .map(|i| EventData::binary("Appended", i.to_string().into_bytes()))
        .collect()
}

pub async fn append(store: &InMemory, stream: &str, count: usize) {
    store
        .append_to_stream(stream, ExpectedVersion::Any, events(count))
        .await
        .expect("append should not fail");
}
