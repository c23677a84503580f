//! End-to-end bus tests over the in-process broker.
//!
//! Several buses built on clones of one `MemoryBroker` behave like separate
//! processes attached to the same RabbitMQ.

mod common;

use std::sync::Arc;
use std::time::Duration;

use mailbus::broker::memory::MemoryBroker;
use mailbus::config::Config;
use mailbus::dlq::{EventDeadLetters, MemoryEventDeadLetters};
use mailbus::retry::RetryBackoffConfiguration;
use mailbus::routing::{MailboxIdRegistrationKey, UsernameRegistrationKey};
use mailbus::{broker, EventBus, Group};

use common::{serializer, wait_until, BrokenListener, MailboxEvent, RecordingListener, USER};

const WAIT: Duration = Duration::from_secs(5);

fn retry(max_retries: u32) -> RetryBackoffConfiguration {
    RetryBackoffConfiguration::builder()
        .max_retries(max_retries)
        .first_backoff(Duration::from_millis(5))
        .build()
        .unwrap()
}

async fn instance(broker: &MemoryBroker, dead_letters: &Arc<MemoryEventDeadLetters>) -> EventBus {
    let bus = EventBus::builder(Arc::new(broker.clone()), serializer())
        .retry(retry(2))
        .dead_letters(dead_letters.clone())
        .build();
    bus.start().await.unwrap();
    bus
}

#[tokio::test]
async fn test_mailbox_listener_on_remote_instance() {
    let broker = MemoryBroker::new();
    let dead_letters = Arc::new(MemoryEventDeadLetters::new());
    let imap = instance(&broker, &dead_letters).await;
    let jmap = instance(&broker, &dead_letters).await;

    let idle = RecordingListener::synchronous();
    let _registration = jmap
        .register_key(idle.clone(), MailboxIdRegistrationKey::new("inbox-1"))
        .await
        .unwrap();

    let event = MailboxEvent::added("inbox-1");
    imap.dispatch(
        event.clone(),
        &[MailboxIdRegistrationKey::new("inbox-1").into()],
    )
    .await
    .unwrap();

    assert!(wait_until(WAIT, || idle.calls() == 1).await);
    assert_eq!(idle.received(), vec![event.event_id()]);
}

#[tokio::test]
async fn test_username_key_reaches_user_listeners() {
    let broker = MemoryBroker::new();
    let dead_letters = Arc::new(MemoryEventDeadLetters::new());
    let bus = instance(&broker, &dead_letters).await;

    let listener = RecordingListener::synchronous();
    let _registration = bus
        .register_key(listener.clone(), UsernameRegistrationKey::new(USER))
        .await
        .unwrap();

    bus.dispatch(
        MailboxEvent::added("inbox-1"),
        &[UsernameRegistrationKey::new(USER).into()],
    )
    .await
    .unwrap();

    assert_eq!(listener.calls(), 1);
}

#[tokio::test]
async fn test_group_event_is_processed_once_across_instances() {
    let broker = MemoryBroker::new();
    let dead_letters = Arc::new(MemoryEventDeadLetters::new());
    let first = instance(&broker, &dead_letters).await;
    let second = instance(&broker, &dead_letters).await;
    let group = Group::named("search-indexer").unwrap();

    let on_first = RecordingListener::asynchronous();
    let on_second = RecordingListener::asynchronous();
    let _a = first
        .register_group(on_first.clone(), group.clone())
        .await
        .unwrap();
    let _b = second
        .register_group(on_second.clone(), group.clone())
        .await
        .unwrap();

    for _ in 0..10 {
        first
            .dispatch(MailboxEvent::added("inbox-1"), &[])
            .await
            .unwrap();
    }

    assert!(wait_until(WAIT, || on_first.calls() + on_second.calls() == 10).await);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(on_first.calls() + on_second.calls(), 10);
}

#[tokio::test]
async fn test_dead_letters_can_be_redelivered_after_fix() {
    let broker = MemoryBroker::new();
    let dead_letters = Arc::new(MemoryEventDeadLetters::new());
    let group = Group::named("quota-updater").unwrap();

    let broken_bus = instance(&broker, &dead_letters).await;
    let broken = Arc::new(BrokenListener::default());
    let registration = broken_bus
        .register_group(broken.clone(), group.clone())
        .await
        .unwrap();

    let event = MailboxEvent::added("inbox-1");
    broken_bus.dispatch(event.clone(), &[]).await.unwrap();

    // One attempt plus two retries.
    assert!(wait_until(WAIT, || broken.calls() == 3).await);
    let mut failed = Vec::new();
    for _ in 0..100 {
        failed = dead_letters.failed_ids(&group).await.unwrap();
        if !failed.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(failed.len(), 1);
    assert_eq!(
        dead_letters.groups_with_failed_events().await.unwrap(),
        vec![group.clone()]
    );

    // Replace the broken listener, then replay the stored event.
    registration.unregister().await.unwrap();
    let fixed = RecordingListener::asynchronous();
    let _fixed = broken_bus
        .register_group(fixed.clone(), group.clone())
        .await
        .unwrap();

    let stored = dead_letters
        .failed_event(&group, failed[0])
        .await
        .unwrap()
        .unwrap();
    broken_bus.redeliver(&group, stored).await.unwrap();
    dead_letters.remove(&group, event.event_id()).await.unwrap();

    assert!(wait_until(WAIT, || fixed.calls() == 1).await);
    assert_eq!(fixed.received(), vec![event.event_id()]);
    assert!(!dead_letters.contain_events().await.unwrap());
}

#[tokio::test]
async fn test_noop_event_is_dropped() {
    let broker = MemoryBroker::new();
    let dead_letters = Arc::new(MemoryEventDeadLetters::new());
    let bus = instance(&broker, &dead_letters).await;

    bus.dispatch(
        MailboxEvent::empty_flags_update("inbox-1"),
        &[MailboxIdRegistrationKey::new("inbox-1").into()],
    )
    .await
    .unwrap();

    assert_eq!(broker.published_count(), 0);
}

#[tokio::test]
async fn test_bus_from_default_config() {
    let config = Config::for_test();
    let broker = broker::from_config(&config.messaging).unwrap();
    let bus = EventBus::builder(broker, serializer())
        .configure(&config)
        .unwrap()
        .build();

    bus.start().await.unwrap();
    assert_eq!(bus.naming().exchange(), "mailboxEvent-exchange");

    let group = Group::generic("tap").unwrap();
    let listener = RecordingListener::asynchronous();
    let _registration = bus
        .register_group(listener.clone(), group)
        .await
        .unwrap();
    bus.dispatch(MailboxEvent::added("inbox-1"), &[])
        .await
        .unwrap();

    assert!(wait_until(WAIT, || listener.calls() == 1).await);
    bus.stop().await;
}
