use std::collections::HashSet;
use std::sync::{Arc, Weak};
use std::time::Duration;

use super::{test_context, test_settings, wait_for};
use crate::broker::context::Context;
use crate::broker::message::Message;
use crate::broker::topic::Topic;
use crate::client::mock::RecordingConsumer;
use crate::config::Settings;
use crate::utils::BrokerError;

const WAIT: Duration = Duration::from_secs(2);

fn lone_topic(ctx: &Arc<Context>, name: &str) -> Arc<Topic> {
    Topic::new(name, ctx.clone(), Weak::new()).unwrap()
}

fn new_topic(settings: Settings) -> (Arc<Context>, Arc<Topic>) {
    let (ctx, _events) = test_context(settings);
    let topic = lone_topic(&ctx, "orders");
    (ctx, topic)
}

fn publish(topic: &Topic, body: &str) -> Message {
    let msg = Message::new(topic.generate_id(), body.to_string());
    topic.put_message(msg.duplicate()).unwrap();
    msg
}

#[tokio::test]
async fn test_fan_out_to_every_channel() {
    let (_ctx, topic) = new_topic(test_settings());
    let channels = vec![
        topic.get_channel("a").await.unwrap(),
        topic.get_channel("b").await.unwrap(),
        topic.get_channel("c").await.unwrap(),
    ];
    topic.start();

    for n in 0..100 {
        publish(&topic, &format!("m{n}"));
    }
    assert_eq!(topic.message_count(), 100);

    assert!(wait_for(WAIT, || channels.iter().all(|c| c.depth() == 100)).await);
    assert_eq!(topic.depth(), 0);

    // drain one channel; the others are unaffected
    for _ in 0..100 {
        channels[0].next_message().await.unwrap();
    }
    assert_eq!(channels[0].depth(), 0);
    assert_eq!(channels[1].depth(), 100);
    assert_eq!(channels[2].depth(), 100);
}

#[tokio::test]
async fn test_each_channel_gets_its_own_instance() {
    let (_ctx, topic) = new_topic(test_settings());
    let a = topic.get_channel("a").await.unwrap();
    let b = topic.get_channel("b").await.unwrap();
    topic.start();

    let sent = publish(&topic, "hello");

    let from_a = a.next_message().await.unwrap();
    let from_b = b.next_message().await.unwrap();
    assert!(!Arc::ptr_eq(&from_a, &from_b));
    assert_eq!(from_a.id, sent.id);
    assert_eq!(from_b.id, sent.id);
    assert_eq!(from_a.body, from_b.body);
    assert_eq!(from_a.timestamp, from_b.timestamp);

    // claiming one copy leaves the other untouched
    a.start_in_flight_timeout(from_a.clone(), 1, Duration::from_secs(5))
        .unwrap();
    assert_eq!(from_b.index(), -1);
    b.start_in_flight_timeout(from_b.clone(), 2, Duration::from_secs(5))
        .unwrap();
    assert_eq!(from_a.client_id(), 1);
    assert_eq!(from_b.client_id(), 2);
}

#[tokio::test]
async fn test_nothing_delivered_before_start() {
    let (_ctx, topic) = new_topic(test_settings());
    let channel = topic.get_channel("a").await.unwrap();

    publish(&topic, "early");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(channel.depth(), 0);
    assert_eq!(topic.depth(), 1);

    topic.start();
    topic.start();
    assert!(wait_for(WAIT, || channel.depth() == 1).await);
    assert_eq!(topic.depth(), 0);
}

#[tokio::test]
async fn test_topic_without_channels_holds_messages() {
    let (_ctx, topic) = new_topic(test_settings());
    topic.start();

    publish(&topic, "waiting");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(topic.depth(), 1);

    let channel = topic.get_channel("late").await.unwrap();
    assert!(wait_for(WAIT, || channel.depth() == 1).await);
}

#[tokio::test]
async fn test_pause_stops_the_pump() {
    let (_ctx, topic) = new_topic(test_settings());
    let channel = topic.get_channel("a").await.unwrap();
    topic.start();

    topic.pause();
    assert!(topic.is_paused());
    publish(&topic, "held");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(channel.depth(), 0);
    assert_eq!(topic.depth(), 1);

    topic.unpause();
    assert!(wait_for(WAIT, || channel.depth() == 1).await);
}

#[tokio::test]
async fn test_deferred_messages_go_to_deferred_queue() {
    let (_ctx, topic) = new_topic(test_settings());
    let a = topic.get_channel("a").await.unwrap();
    let b = topic.get_channel("b").await.unwrap();
    topic.start();

    let msg = Message::new(topic.generate_id(), "later").deferred_by(Duration::from_secs(3600));
    topic.put_message(msg).unwrap();

    assert!(wait_for(WAIT, || a.deferred_count() == 1 && b.deferred_count() == 1).await);
    assert_eq!(a.depth(), 0);
    assert_eq!(b.depth(), 0);
    assert_eq!(a.message_count(), 1);
}

#[tokio::test]
async fn test_spilled_messages_are_delivered() {
    let mut settings = test_settings();
    settings.queue.mem_queue_size = 0;
    let (_ctx, topic) = new_topic(settings);
    let channel = topic.get_channel("a").await.unwrap();

    for n in 0..10 {
        publish(&topic, &format!("spill-{n}"));
    }
    assert_eq!(topic.depth(), 10);
    assert_eq!(topic.stats(None).backend_depth, 10);

    topic.start();
    assert!(wait_for(WAIT, || channel.depth() == 10).await);
    assert_eq!(topic.depth(), 0);

    let mut bodies = HashSet::new();
    for _ in 0..10 {
        let m = channel.next_message().await.unwrap();
        bodies.insert(String::from_utf8(m.body.to_vec()).unwrap());
    }
    assert!(bodies.contains("spill-0") && bodies.contains("spill-9"));
}

#[tokio::test]
async fn test_put_messages_is_not_atomic() {
    let mut settings = test_settings();
    settings.queue.max_msg_size = 4;
    let (_ctx, topic) = new_topic(settings);

    let batch = ["ok", "fine", "too large", "late"]
        .iter()
        .map(|body| Message::new(topic.generate_id(), body.to_string()))
        .collect();
    let err = topic.put_messages(batch).unwrap_err();

    assert!(matches!(err, BrokerError::MessageTooLarge { size: 9, max: 4 }));
    assert_eq!(topic.message_count(), 2);
    assert_eq!(topic.message_bytes(), 6);
    assert_eq!(topic.depth(), 2);
}

#[tokio::test]
async fn test_oversized_message_rejected() {
    let mut settings = test_settings();
    settings.queue.max_msg_size = 3;
    let (_ctx, topic) = new_topic(settings);

    let msg = Message::new(topic.generate_id(), "four");
    assert!(matches!(
        topic.put_message(msg),
        Err(BrokerError::MessageTooLarge { .. })
    ));
    assert_eq!(topic.message_count(), 0);
}

#[tokio::test]
async fn test_closed_topic_rejects_puts() {
    let (_ctx, topic) = new_topic(test_settings());
    topic.start();
    topic.close().await.unwrap();

    let msg = Message::new(topic.generate_id(), "too late");
    assert!(matches!(topic.put_message(msg), Err(BrokerError::Exiting)));
    assert!(matches!(topic.put_messages(Vec::new()), Err(BrokerError::Exiting)));
    assert!(matches!(topic.close().await, Err(BrokerError::Exiting)));
    assert!(matches!(topic.get_channel("x").await, Err(BrokerError::Exiting)));
}

#[tokio::test]
async fn test_close_flushes_buffered_messages() {
    let (ctx, _events) = test_context(test_settings());
    let topic = lone_topic(&ctx, "orders");

    publish(&topic, "one");
    publish(&topic, "two");
    publish(&topic, "three");
    topic.close().await.unwrap();

    let reopened = lone_topic(&ctx, "orders");
    assert_eq!(reopened.depth(), 3);
}

#[tokio::test]
async fn test_close_keeps_channel_state() {
    let (ctx, _events) = test_context(test_settings());
    let topic = lone_topic(&ctx, "orders");
    let channel = topic.get_channel("a").await.unwrap();
    topic.start();

    publish(&topic, "one");
    assert!(wait_for(WAIT, || channel.depth() == 1).await);
    topic.close().await.unwrap();
    assert!(channel.exiting());

    let reopened = lone_topic(&ctx, "orders");
    let channel = reopened.get_channel("a").await.unwrap();
    assert_eq!(channel.depth(), 1);
}

#[tokio::test]
async fn test_delete_removes_channels_and_storage() {
    let (ctx, _events) = test_context(test_settings());
    let topic = lone_topic(&ctx, "orders");
    let channel = topic.get_channel("a").await.unwrap();
    publish(&topic, "one");

    topic.delete().await.unwrap();
    assert!(channel.exiting());
    assert_eq!(topic.channel_count(), 0);
    assert_eq!(topic.depth(), 0);

    let reopened = lone_topic(&ctx, "orders");
    assert_eq!(reopened.depth(), 0);
}

#[tokio::test]
async fn test_get_channel_is_idempotent() {
    let (_ctx, topic) = new_topic(test_settings());
    let first = topic.get_channel("a").await.unwrap();
    let second = topic.get_channel("a").await.unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(topic.channel_count(), 1);

    assert!(matches!(
        topic.get_channel("bad name").await,
        Err(BrokerError::InvalidName { kind: "channel", .. })
    ));
    assert!(matches!(
        topic.get_existing_channel("missing"),
        Err(BrokerError::ChannelNotFound(_))
    ));
}

#[tokio::test]
async fn test_delete_existing_channel() {
    let (_ctx, topic) = new_topic(test_settings());
    let a = topic.get_channel("a").await.unwrap();
    let b = topic.get_channel("b").await.unwrap();
    topic.start();

    topic.delete_existing_channel("a").await.unwrap();
    assert!(a.exiting());
    assert!(topic.get_existing_channel("a").is_err());

    publish(&topic, "after");
    assert!(wait_for(WAIT, || b.depth() == 1).await);
    assert_eq!(a.depth(), 0);

    assert!(matches!(
        topic.delete_existing_channel("a").await,
        Err(BrokerError::ChannelNotFound(_))
    ));
}

#[tokio::test]
async fn test_ephemeral_channel_deleted_with_last_client() {
    let (_ctx, topic) = new_topic(test_settings());
    let channel = topic.get_channel("scratch#ephemeral").await.unwrap();
    channel
        .add_client(1, Arc::new(RecordingConsumer::new(1)))
        .unwrap();
    channel
        .add_client(2, Arc::new(RecordingConsumer::new(2)))
        .unwrap();

    channel.remove_client(1);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(topic.get_existing_channel("scratch#ephemeral").is_ok());

    channel.remove_client(2);
    channel.remove_client(2);
    assert!(wait_for(WAIT, || topic.get_existing_channel("scratch#ephemeral").is_err()).await);
    assert!(channel.exiting());
}

#[tokio::test]
async fn test_remove_client_ignored_while_exiting() {
    let (_ctx, topic) = new_topic(test_settings());
    let channel = topic.get_channel("scratch#ephemeral").await.unwrap();
    channel
        .add_client(1, Arc::new(RecordingConsumer::new(1)))
        .unwrap();

    channel.close().unwrap();
    channel.remove_client(1);

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(channel.client_count(), 1);
    assert!(topic.get_existing_channel("scratch#ephemeral").is_ok());
    assert!(!topic.exiting());
}

#[tokio::test]
async fn test_generate_id_is_unique() {
    let (_ctx, topic) = new_topic(test_settings());
    let ids: HashSet<_> = (0..5_000).map(|_| topic.generate_id()).collect();
    assert_eq!(ids.len(), 5_000);
}

#[tokio::test]
async fn test_aggregate_latency_merges_channels() {
    let mut settings = test_settings();
    settings.latency.percentiles = vec![0.5];
    let (_ctx, topic) = new_topic(settings);
    let a = topic.get_channel("a").await.unwrap();
    let b = topic.get_channel("b").await.unwrap();
    topic.start();

    publish(&topic, "timed");
    for (client, channel) in [(1, &a), (2, &b)] {
        let m = channel.next_message().await.unwrap();
        channel
            .start_in_flight_timeout(m.clone(), client, Duration::from_secs(5))
            .unwrap();
        channel.finish_message(client, m.id).unwrap();
    }

    let stats = topic.stats(None);
    assert_eq!(stats.e2e_processing_latency.count, 2);
    assert_eq!(stats.channels.len(), 2);
    assert_eq!(topic.stats(Some("b")).channels.len(), 1);
}
