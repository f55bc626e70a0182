use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use uuid::Uuid;

use eventstore_http::event::{AllEventsSlice, EventReadResult, StreamEventsSlice};
use eventstore_http::inmemory::InMemory;
use eventstore_http::metadata::StreamMetadataResult;
use eventstore_http::store::{
    NakAction, PersistentSubscriptionEvent, PersistentSubscriptionSettings,
    PersistentSubscriptionStatus, PersistentSubscriptions, Reader,
};
use eventstore_http::subscription::persistent::{
    self, PersistentHandler, PersistentSubscriptionHandle,
};
use eventstore_http::subscription::DropData;
use eventstore_http::{
    Position, ReadOptions, ResolvedEvent, Result, SubscribeExt, SubscriptionDropReason,
};

mod setup;

use setup::append;

const STREAM: &str = "payments";
const GROUP: &str = "billing";

async fn create_group(store: &InMemory) {
    let status = store
        .create_persistent_subscription(
            STREAM,
            GROUP,
            &PersistentSubscriptionSettings::default().start_from_beginning(),
        )
        .await
        .expect("group creation should not fail");

    assert_eq!(PersistentSubscriptionStatus::Success, status);
}

#[derive(Clone, Default)]
struct Handled {
    events: Arc<Mutex<Vec<(i64, u32)>>>,
    drops: Arc<Mutex<Vec<SubscriptionDropReason>>>,
}

/// Handler stopping the subscription after a number of events,
/// or failing on the first one.
#[derive(Clone, Default)]
struct Counting {
    handled: Handled,
    stop_after: usize,
    fail: bool,
}

#[async_trait]
impl PersistentHandler for Counting {
    async fn event_appeared(
        &mut self,
        subscription: &PersistentSubscriptionHandle,
        event: &ResolvedEvent,
        retry_count: u32,
    ) -> anyhow::Result<()> {
        if self.fail {
            anyhow::bail!("cannot process payment #{}", event.original_event_number());
        }

        let mut events = self.handled.events.lock();
        events.push((event.original_event_number(), retry_count));

        if events.len() == self.stop_after {
            subscription.stop();
        }

        Ok(())
    }

    async fn subscription_dropped(
        &mut self,
        _subscription: &PersistentSubscriptionHandle,
        drop: &DropData,
    ) {
        self.handled.drops.lock().push(drop.reason);
    }
}

#[tokio::test]
async fn auto_ack_leaves_nothing_to_redeliver() {
    let store = InMemory::default();
    create_group(&store).await;
    append(&store, STREAM, 1).await;

    let handler = Counting {
        stop_after: 1,
        ..Counting::default()
    };

    let mut subscription = store
        .connect_to_persistent_subscription(
            STREAM,
            GROUP,
            persistent::Options::default(),
            handler.clone(),
        )
        .expect("subscription options are valid");

    let dropped = tokio::time::timeout(Duration::from_secs(5), subscription.start())
        .await
        .expect("subscription should stop")
        .expect("subscription should start");

    assert_eq!(SubscriptionDropReason::UserInitiated, dropped.reason);
    assert_eq!(vec![(0, 0)], *handler.handled.events.lock());
    assert_eq!(
        vec![SubscriptionDropReason::UserInitiated],
        *handler.handled.drops.lock()
    );

    let page = store
        .read_from_subscription(STREAM, GROUP, 10)
        .await
        .expect("read should not fail");

    assert!(page.is_empty());
    assert_eq!(Some(0), store.in_flight_count(STREAM, GROUP));
}

/// Store recording the persistent subscription calls it receives.
#[derive(Clone)]
struct Spy {
    store: InMemory,
    calls: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl Reader for Spy {
    async fn read_event(
        &self,
        stream: &str,
        number: i64,
        resolve_link_tos: bool,
    ) -> Result<EventReadResult> {
        self.store.read_event(stream, number, resolve_link_tos).await
    }

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

    async fn read_all_forward(
        &self,
        position: Position,
        count: usize,
        options: &ReadOptions,
    ) -> Result<AllEventsSlice> {
        self.store.read_all_forward(position, count, options).await
    }

    async fn read_all_backward(
        &self,
        position: Position,
        count: usize,
        options: &ReadOptions,
    ) -> Result<AllEventsSlice> {
        self.store.read_all_backward(position, count, options).await
    }

    async fn get_stream_metadata(&self, stream: &str) -> Result<StreamMetadataResult> {
        self.store.get_stream_metadata(stream).await
    }
}

#[async_trait]
impl PersistentSubscriptions for Spy {
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

    async fn delete_persistent_subscription(
        &self,
        stream: &str,
        group: &str,
    ) -> Result<PersistentSubscriptionStatus> {
        self.store.delete_persistent_subscription(stream, group).await
    }

    async fn read_from_subscription(
        &self,
        stream: &str,
        group: &str,
        amount: usize,
    ) -> Result<Vec<PersistentSubscriptionEvent>> {
        let page = self
            .store
            .read_from_subscription(stream, group, amount)
            .await?;

        self.calls.lock().push(format!("read:{}", page.len()));
        Ok(page)
    }

    async fn ack_events(&self, stream: &str, group: &str, ids: &[Uuid]) -> Result<()> {
        self.calls.lock().push(format!("ack:{}", ids.len()));
        self.store.ack_events(stream, group, ids).await
    }

    async fn nack_events(
        &self,
        stream: &str,
        group: &str,
        ids: &[Uuid],
        action: NakAction,
        reason: &str,
    ) -> Result<()> {
        self.calls.lock().push(format!("nack:{}", ids.len()));
        self.store
            .nack_events(stream, group, ids, action, reason)
            .await
    }
}

#[tokio::test]
async fn delivered_events_are_acknowledged_before_the_next_poll() {
    let store = InMemory::default();
    create_group(&store).await;
    append(&store, STREAM, 3).await;

    let spy = Spy {
        store: store.clone(),
        calls: Arc::default(),
    };

    let handler = Counting {
        stop_after: 3,
        ..Counting::default()
    };

    let options = persistent::Options {
        buffer_size: 2,
        ..persistent::Options::default()
    };

    let mut subscription = spy
        .connect_to_persistent_subscription(STREAM, GROUP, options, handler.clone())
        .expect("subscription options are valid");

    tokio::time::timeout(Duration::from_secs(5), subscription.start())
        .await
        .expect("subscription should stop")
        .expect("subscription should start");

    assert_eq!(
        vec![(0, 0), (1, 0), (2, 0)],
        *handler.handled.events.lock()
    );
    assert_eq!(
        vec!["read:2", "ack:1", "ack:1", "read:1", "ack:1"],
        *spy.calls.lock()
    );
}

#[tokio::test]
async fn buffered_events_are_delivered_before_stopping() {
    let store = InMemory::default();
    create_group(&store).await;
    append(&store, STREAM, 3).await;

    let handler = Counting {
        stop_after: 1,
        ..Counting::default()
    };

    let mut subscription = store
        .connect_to_persistent_subscription(
            STREAM,
            GROUP,
            persistent::Options::default(),
            handler.clone(),
        )
        .expect("subscription options are valid");

    let dropped = tokio::time::timeout(Duration::from_secs(5), subscription.start())
        .await
        .expect("subscription should stop")
        .expect("subscription should start");

    assert_eq!(SubscriptionDropReason::UserInitiated, dropped.reason);
    assert_eq!(
        vec![(0, 0), (1, 0), (2, 0)],
        *handler.handled.events.lock()
    );
    assert_eq!(Some(0), store.in_flight_count(STREAM, GROUP));
}

#[tokio::test]
async fn handler_errors_drop_without_acknowledging() {
    let store = InMemory::default();
    create_group(&store).await;
    append(&store, STREAM, 1).await;

    let handler = Counting {
        fail: true,
        ..Counting::default()
    };

    let mut subscription = store
        .connect_to_persistent_subscription(
            STREAM,
            GROUP,
            persistent::Options::default(),
            handler.clone(),
        )
        .expect("subscription options are valid");

    let dropped = subscription.start().await.expect("subscription should start");

    assert_eq!(SubscriptionDropReason::EventHandlerException, dropped.reason);
    assert_eq!(
        "cannot process payment #0",
        dropped
            .error
            .expect("handler error should be reported")
            .to_string()
    );
    assert_eq!(
        vec![SubscriptionDropReason::EventHandlerException],
        *handler.handled.drops.lock()
    );

    // Left to the server message timeout.
    assert_eq!(Some(1), store.in_flight_count(STREAM, GROUP));
}

#[tokio::test]
async fn denied_streams_drop_with_access_denied() {
    let store = InMemory::default();
    create_group(&store).await;
    store.deny_access(STREAM);

    let handler = Counting::default();
    let mut subscription = store
        .connect_to_persistent_subscription(
            STREAM,
            GROUP,
            persistent::Options::default(),
            handler.clone(),
        )
        .expect("subscription options are valid");

    let dropped = subscription.start().await.expect("subscription should start");

    assert_eq!(SubscriptionDropReason::AccessDenied, dropped.reason);
    assert_eq!(
        vec![SubscriptionDropReason::AccessDenied],
        *handler.handled.drops.lock()
    );
}

#[tokio::test]
async fn parked_events_are_not_redelivered() {
    let store = InMemory::default();
    create_group(&store).await;
    append(&store, STREAM, 2).await;

    let page = store
        .read_from_subscription(STREAM, GROUP, 10)
        .await
        .expect("read should not fail");

    let handle_ids: Vec<_> = page
        .iter()
        .map(|message| message.event.original_event().event_id)
        .collect();

    store
        .nack_events(STREAM, GROUP, &handle_ids[..1], NakAction::Park, "poison")
        .await
        .expect("nack should not fail");
    store
        .ack_events(STREAM, GROUP, &handle_ids[1..])
        .await
        .expect("ack should not fail");

    let parked = store.parked_events(STREAM, GROUP);
    assert_eq!(1, parked.len());
    assert_eq!(1, parked[0].original_event_number());

    let page = store
        .read_from_subscription(STREAM, GROUP, 10)
        .await
        .expect("read should not fail");
    assert!(page.is_empty());
}
