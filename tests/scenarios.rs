//! End-to-end delivery scenarios driven through the public API.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use popsubd::broker::{Message, Node};
use popsubd::client::{ClientId, ClientStats, Consumer};
use popsubd::config::Settings;
use tempfile::TempDir;

const WAIT: Duration = Duration::from_secs(3);

#[derive(Default)]
struct CountingConsumer {
    id: ClientId,
    timeouts: AtomicU64,
}

impl Consumer for CountingConsumer {
    fn pause(&self) {}

    fn unpause(&self) {}

    fn close(&self) -> std::io::Result<()> {
        Ok(())
    }

    fn timed_out_message(&self) {
        self.timeouts.fetch_add(1, Ordering::SeqCst);
    }

    fn stats(&self, _topic: &str) -> ClientStats {
        ClientStats {
            client_id: self.id,
            ..Default::default()
        }
    }

    fn empty(&self) {}
}

fn start_node(dir: &TempDir) -> Arc<Node> {
    let mut settings = Settings::default();
    settings.node.data_path = dir.path().to_string_lossy().into_owned();
    settings.scanner.interval_ms = 10;
    settings.scanner.refresh_interval_ms = 20;
    let node = Node::new(settings).unwrap();
    node.start();
    node
}

async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}

#[tokio::test]
async fn test_ack_before_timeout_is_not_redelivered() {
    let dir = TempDir::new().unwrap();
    let node = start_node(&dir);
    let topic = node.get_topic("greetings").unwrap();
    let channel = topic.get_channel("inbox").await.unwrap();

    topic
        .put_message(Message::new(topic.generate_id(), "hello"))
        .unwrap();
    let msg = channel.next_message().await.unwrap();
    assert_eq!(&msg.body[..], b"hello");

    let client_id = node.next_client_id();
    channel
        .start_in_flight_timeout(msg.clone(), client_id, Duration::from_secs(5))
        .unwrap();
    assert_eq!(channel.in_flight_count(), 1);

    tokio::time::sleep(Duration::from_secs(1)).await;
    channel.finish_message(client_id, msg.id).unwrap();

    assert_eq!(channel.in_flight_count(), 0);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(channel.depth(), 0);
    assert_eq!(channel.timeout_count(), 0);
    node.exit().await;
}

#[tokio::test]
async fn test_unacked_message_is_requeued_after_timeout() {
    let dir = TempDir::new().unwrap();
    let node = start_node(&dir);
    let topic = node.get_topic("greetings").unwrap();
    let channel = topic.get_channel("inbox").await.unwrap();

    let client_id = node.next_client_id();
    let consumer = Arc::new(CountingConsumer {
        id: client_id,
        ..Default::default()
    });
    channel.add_client(client_id, consumer.clone()).unwrap();

    topic
        .put_message(Message::new(topic.generate_id(), "hello"))
        .unwrap();
    let msg = channel.next_message().await.unwrap();
    channel
        .start_in_flight_timeout(msg.clone(), client_id, Duration::from_millis(100))
        .unwrap();

    assert!(eventually(|| channel.timeout_count() == 1).await);
    assert_eq!(consumer.timeouts.load(Ordering::SeqCst), 1);
    assert_eq!(channel.in_flight_count(), 0);

    let again = tokio::time::timeout(WAIT, channel.next_message())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(again.id, msg.id);
    node.exit().await;
}

#[tokio::test]
async fn test_requeue_immediate_and_deferred() {
    let dir = TempDir::new().unwrap();
    let node = start_node(&dir);
    let topic = node.get_topic("greetings").unwrap();
    let channel = topic.get_channel("inbox").await.unwrap();
    let client_id = node.next_client_id();

    topic
        .put_message(Message::new(topic.generate_id(), "hello"))
        .unwrap();
    let msg = channel.next_message().await.unwrap();

    channel
        .start_in_flight_timeout(msg.clone(), client_id, Duration::from_secs(5))
        .unwrap();
    channel
        .requeue_message(client_id, msg.id, Duration::ZERO)
        .unwrap();
    let now = tokio::time::timeout(Duration::from_millis(50), channel.next_message())
        .await
        .expect("immediate requeue must be deliverable right away")
        .unwrap();
    assert_eq!(now.id, msg.id);

    channel
        .start_in_flight_timeout(now.clone(), client_id, Duration::from_secs(5))
        .unwrap();
    let requeued_at = Instant::now();
    channel
        .requeue_message(client_id, now.id, Duration::from_millis(200))
        .unwrap();
    let later = tokio::time::timeout(WAIT, channel.next_message())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(later.id, msg.id);
    assert!(requeued_at.elapsed() >= Duration::from_millis(200));
    assert_eq!(channel.requeue_count(), 2);
    node.exit().await;
}

#[tokio::test]
async fn test_fan_out_to_independent_channels() {
    let dir = TempDir::new().unwrap();
    let node = start_node(&dir);
    let topic = node.get_topic("events").unwrap();
    let fast = topic.get_channel("fast").await.unwrap();
    let slow = topic.get_channel("slow").await.unwrap();
    let idle = topic.get_channel("idle").await.unwrap();

    let batch = (0..100)
        .map(|n| Message::new(topic.generate_id(), format!("event-{n}")))
        .collect();
    topic.put_messages(batch).unwrap();

    assert!(eventually(|| [&fast, &slow, &idle].iter().all(|c| c.depth() == 100)).await);

    for _ in 0..100 {
        fast.next_message().await.unwrap();
    }
    for _ in 0..10 {
        slow.next_message().await.unwrap();
    }
    assert_eq!(fast.depth(), 0);
    assert_eq!(slow.depth(), 90);
    assert_eq!(idle.depth(), 100);
    assert_eq!(topic.message_count(), 100);
    node.exit().await;
}
