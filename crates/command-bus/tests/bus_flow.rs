//! End-to-end command handling over the in-process transport.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use command_bus::{
    BusConfig, ChannelTransport, CommandBus, Dependencies, HandlerError, InMemoryStorage, Topic,
};
use message_store::{
    InMemoryMessageRepository, Message, MessageRepository, MessageRepositoryExt, MessageStatus,
};
use tokio::sync::mpsc;

type TestBus = CommandBus<InMemoryMessageRepository, ChannelTransport>;

const NAMESPACE: &str = "quant";
const MODULE: &str = "backtest";

fn bus_with(dependencies: Dependencies) -> Arc<TestBus> {
    Arc::new(CommandBus::new(
        BusConfig::new(NAMESPACE, MODULE),
        InMemoryMessageRepository::new(),
        ChannelTransport::new(),
        dependencies,
    ))
}

/// Forwards every completion event to a channel.
async fn watch_events(bus: &TestBus) -> mpsc::UnboundedReceiver<Message> {
    let (sender, receiver) = mpsc::unbounded_channel();
    bus.event_subscriber(&Topic::event_wildcard(NAMESPACE), move |message: Message| {
        let sender = sender.clone();
        async move {
            let _ = sender.send(message);
            Ok::<_, HandlerError>(())
        }
    })
    .await
    .unwrap();
    receiver
}

async fn next_event(events: &mut mpsc::UnboundedReceiver<Message>) -> Message {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for completion event")
        .expect("event channel closed")
}

async fn persisted(bus: &TestBus, method: &str) -> Message {
    let mut message =
        Message::new(MODULE, "runner", method, &serde_json::json!({"symbol": "MSFT"})).unwrap();
    message.id = Some(bus.repository().create_message(&message).await.unwrap());
    message
}

#[tokio::test]
async fn handled_command_completes_and_emits_event() {
    let bus = bus_with(Dependencies::new());
    let mut events = watch_events(&bus).await;
    bus.command_subscriber("runner", "start", |message: Message, _: Dependencies| async move {
        let payload: serde_json::Value = message.parse_payload()?;
        assert_eq!(payload["symbol"], "MSFT");
        Ok::<_, HandlerError>(())
    })
    .await
    .unwrap();

    let message = persisted(&bus, "start").await;
    bus.publish(&message).await.unwrap();

    let event = next_event(&mut events).await;
    assert_eq!(event.id, message.id);

    let stored = bus.repository().require_message(message.id.unwrap()).await.unwrap();
    let statuses: Vec<_> = stored.history().iter().map(|e| e.status).collect();
    assert_eq!(
        statuses,
        vec![
            MessageStatus::Complete,
            MessageStatus::Received,
            MessageStatus::Published,
            MessageStatus::Created,
        ]
    );
    assert_eq!(stored.error(), None);
    assert_eq!(
        bus.transport().published_count("quant.backtest.runner.start.event").await,
        1
    );
}

#[tokio::test]
async fn handler_error_is_recorded_on_completion() {
    let bus = bus_with(Dependencies::new());
    let mut events = watch_events(&bus).await;
    bus.command_subscriber("runner", "start", |_: Message, _: Dependencies| async {
        Err::<(), _>(HandlerError::failed("market closed"))
    })
    .await
    .unwrap();

    let message = persisted(&bus, "start").await;
    bus.publish(&message).await.unwrap();
    next_event(&mut events).await;

    let stored = bus.repository().require_message(message.id.unwrap()).await.unwrap();
    assert_eq!(stored.status(), Some(MessageStatus::Complete));
    assert_eq!(stored.error(), Some("market closed"));
}

#[tokio::test]
async fn handler_panic_is_recorded_and_subscriber_survives() {
    let bus = bus_with(Dependencies::new());
    let mut events = watch_events(&bus).await;
    bus.command_subscriber("runner", "start", |message: Message, _: Dependencies| async move {
        if message.parse_payload::<serde_json::Value>()?["symbol"] == "MSFT" {
            panic!("division by zero");
        }
        Ok::<_, HandlerError>(())
    })
    .await
    .unwrap();

    let first = persisted(&bus, "start").await;
    bus.publish(&first).await.unwrap();
    next_event(&mut events).await;

    let stored = bus.repository().require_message(first.id.unwrap()).await.unwrap();
    assert_eq!(stored.status(), Some(MessageStatus::Complete));
    assert_eq!(stored.error(), Some("handler panicked: division by zero"));

    let mut second = Message::new(MODULE, "runner", "start", &serde_json::json!({"symbol": "IBM"})).unwrap();
    second.id = Some(bus.repository().create_message(&second).await.unwrap());
    bus.publish(&second).await.unwrap();
    next_event(&mut events).await;

    let stored = bus.repository().require_message(second.id.unwrap()).await.unwrap();
    assert_eq!(stored.status(), Some(MessageStatus::Complete));
    assert_eq!(stored.error(), None);
}

#[tokio::test]
async fn redelivered_command_is_discarded() {
    let bus = bus_with(Dependencies::new());
    let mut events = watch_events(&bus).await;
    bus.command_subscriber("runner", "start", |_: Message, _: Dependencies| async { Ok::<_, HandlerError>(()) })
        .await
        .unwrap();

    let message = persisted(&bus, "start").await;
    bus.publish(&message).await.unwrap();
    next_event(&mut events).await;
    let log_rows = bus.repository().status_log_count().await;

    // Broker redelivery of a message that already completed.
    bus.send(&message).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(bus.repository().status_log_count().await, log_rows);
    assert!(events.try_recv().is_err());
    assert_eq!(bus.transport().published_count("quant.*.*.*.event").await, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_copies_of_a_command_run_the_handler_once() {
    let bus = bus_with(Dependencies::new());
    let mut events = watch_events(&bus).await;
    let runs = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&runs);
    bus.command_subscriber("runner", "start", move |_: Message, _: Dependencies| {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok::<_, HandlerError>(())
        }
    })
    .await
    .unwrap();

    // A stale re-send racing the original delivery.
    let message = persisted(&bus, "start").await;
    bus.publish(&message).await.unwrap();
    for _ in 0..4 {
        bus.send(&message).await.unwrap();
    }

    next_event(&mut events).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert!(events.try_recv().is_err());
    assert_eq!(bus.transport().published_count("quant.*.*.*.event").await, 1);

    let stored = bus.repository().require_message(message.id.unwrap()).await.unwrap();
    assert_eq!(stored.history().len(), 4);
}

#[tokio::test]
async fn unpublished_command_is_not_handled() {
    let bus = bus_with(Dependencies::new());
    let mut events = watch_events(&bus).await;
    bus.command_subscriber("runner", "start", |_: Message, _: Dependencies| async { Ok::<_, HandlerError>(()) })
        .await
        .unwrap();

    // Still CREATED: sent without the status transition.
    let message = persisted(&bus, "start").await;
    bus.send(&message).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let stored = bus.repository().require_message(message.id.unwrap()).await.unwrap();
    assert_eq!(stored.status(), Some(MessageStatus::Created));
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn handler_reaches_collaborators_through_registry() {
    let storage = InMemoryStorage::new();
    let mut dependencies = Dependencies::new();
    dependencies.add_storage(storage.clone());

    let bus = bus_with(dependencies);
    let mut events = watch_events(&bus).await;
    bus.command_subscriber("runner", "store", |message: Message, deps: Dependencies| async move {
        deps.storage()
            .put("results", "MSFT.json", message.raw_payload().to_vec())
            .await?;
        Ok::<_, HandlerError>(())
    })
    .await
    .unwrap();

    let message = persisted(&bus, "store").await;
    bus.publish(&message).await.unwrap();
    next_event(&mut events).await;

    assert_eq!(storage.object_count().await, 1);
    let stored = bus.repository().require_message(message.id.unwrap()).await.unwrap();
    assert_eq!(stored.error(), None);
}

#[tokio::test]
async fn missing_registry_entry_fails_the_command_not_the_bus() {
    let bus = bus_with(Dependencies::new());
    let mut events = watch_events(&bus).await;
    bus.command_subscriber("runner", "store", |_: Message, deps: Dependencies| async move {
        deps.storage().list("results", "").await?;
        Ok::<_, HandlerError>(())
    })
    .await
    .unwrap();

    let message = persisted(&bus, "store").await;
    bus.publish(&message).await.unwrap();
    next_event(&mut events).await;

    let stored = bus.repository().require_message(message.id.unwrap()).await.unwrap();
    let error = stored.error().unwrap();
    assert!(error.starts_with("handler panicked: dependency `storage` is not registered"));
}

#[tokio::test]
async fn commands_for_other_modules_are_not_consumed() {
    let bus = bus_with(Dependencies::new());
    bus.command_subscriber("runner", "start", |_: Message, _: Dependencies| async { Ok::<_, HandlerError>(()) })
        .await
        .unwrap();

    let mut foreign =
        Message::new("reporting", "runner", "start", &serde_json::json!({})).unwrap();
    foreign.id = Some(bus.repository().create_message(&foreign).await.unwrap());
    bus.publish(&foreign).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let stored = bus.repository().require_message(foreign.id.unwrap()).await.unwrap();
    assert_eq!(stored.status(), Some(MessageStatus::Published));
    assert_eq!(
        bus.transport().published_subjects().await,
        vec!["quant.reporting.runner.start.command"]
    );
}
