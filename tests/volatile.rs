use eventstore_http::event::EventData;
use eventstore_http::inmemory::InMemory;
use eventstore_http::store::Writer;
use eventstore_http::subscription::volatile;
use eventstore_http::{ExpectedVersion, SubscribeExt, SubscriptionDropReason};

mod setup;

use setup::{append, event, Notification, Recorder};

#[tokio::test]
async fn all_subscription_delivers_only_new_events() {
    let store = InMemory::default();
    append(&store, "before", 2).await;

    let (handler, mut notifications) = Recorder::new();
    let mut subscription = store
        .subscribe_to_all(volatile::Options::default(), handler)
        .expect("subscription options are valid");

    subscription.connect().await.expect("connect should not fail");

    let stop = subscription.stop_handle();
    let running = tokio::spawn(async move { subscription.start().await });

    append(&store, "after", 1).await;
    append(&store, "before", 1).await;

    assert_eq!(
        vec![event("after", 0), event("before", 2)],
        notifications.take(2).await
    );

    stop.stop();

    let dropped = running
        .await
        .expect("subscription task should not panic")
        .expect("subscription should start");

    assert_eq!(SubscriptionDropReason::UserInitiated, dropped.reason);
    assert_eq!(
        vec![Notification::Dropped(SubscriptionDropReason::UserInitiated)],
        notifications.remaining().await
    );
}

#[tokio::test]
async fn link_events_are_delivered_as_appended_to_the_subscribed_stream() {
    let store = InMemory::default();

    let (handler, mut notifications) = Recorder::new();
    let options = volatile::Options {
        resolve_link_tos: true,
        ..volatile::Options::default()
    };

    let mut subscription = store
        .subscribe_to_stream("$ce-orders", options, handler)
        .expect("subscription options are valid");

    subscription.connect().await.expect("connect should not fail");

    let stop = subscription.stop_handle();
    let running = tokio::spawn(async move { subscription.start().await });

    append(&store, "orders-1", 1).await;
    store
        .append_to_stream(
            "$ce-orders",
            ExpectedVersion::NoStream,
            vec![EventData::link_to("orders-1", 0)],
        )
        .await
        .expect("append should not fail");

    assert_eq!(event("$ce-orders", 0), notifications.next().await);

    stop.stop();
    running
        .await
        .expect("subscription task should not panic")
        .expect("subscription should start");
}

#[tokio::test]
async fn handler_errors_drop_the_subscription() {
    let store = InMemory::default();

    let (handler, mut notifications) = Recorder::new();
    let mut subscription = store
        .subscribe_to_stream("failing", volatile::Options::default(), handler.failing_on(0))
        .expect("subscription options are valid");

    subscription.connect().await.expect("connect should not fail");

    let running = tokio::spawn(async move { subscription.start().await });

    append(&store, "failing", 2).await;

    let dropped = running
        .await
        .expect("subscription task should not panic")
        .expect("subscription should start");

    assert_eq!(SubscriptionDropReason::EventHandlerException, dropped.reason);
    assert_eq!(
        vec![
            event("failing", 0),
            Notification::Dropped(SubscriptionDropReason::EventHandlerException),
        ],
        notifications.take(2).await
    );
}
