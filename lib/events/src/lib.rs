//! # Events
//!
//! Concurrency-safe in-process pub/sub with string topics.
//!
//! Each subscriber owns a bounded buffer (capacity 100). Delivery
//! is non-blocking: a full buffer drops the event for that
//! subscriber only, never stalling the publisher. Subscribing to
//! `*` receives every topic. Unsubscribe closes the subscriber's
//! channel and deregisters it idempotently.

use std::{
  collections::HashMap,
  sync::{
    Arc, RwLock,
    atomic::{AtomicU64, Ordering},
  },
};

use docksmith_client::entities::event::{Event, topics};
use tokio::sync::mpsc;

/// Buffered events per subscriber.
pub const SUBSCRIBER_BUFFER: usize = 100;

#[derive(Debug)]
struct Subscriber {
  topics: Vec<String>,
  tx: mpsc::Sender<Event>,
}

impl Subscriber {
  fn wants(&self, topic: &str) -> bool {
    self
      .topics
      .iter()
      .any(|t| t == topic || t == topics::WILDCARD)
  }
}

#[derive(Debug, Default)]
pub struct EventBus {
  next_id: AtomicU64,
  subscribers: RwLock<HashMap<u64, Subscriber>>,
}

/// Handle returned from [`EventBus::subscribe`]; pass back to
/// [`EventBus::unsubscribe`] to deregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriberId(u64);

impl EventBus {
  pub fn new() -> EventBus {
    Default::default()
  }

  /// Subscribe to a set of topics (use [`topics::WILDCARD`] for
  /// everything). The receiver is closed on unsubscribe.
  pub fn subscribe(
    &self,
    subscribed_topics: impl IntoIterator<Item = impl Into<String>>,
  ) -> (SubscriberId, mpsc::Receiver<Event>) {
    let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
    self.subscribers.write().unwrap().insert(
      id,
      Subscriber {
        topics: subscribed_topics
          .into_iter()
          .map(Into::into)
          .collect(),
        tx,
      },
    );
    (SubscriberId(id), rx)
  }

  /// Idempotent: unsubscribing twice is a no-op.
  pub fn unsubscribe(&self, id: SubscriberId) {
    self.subscribers.write().unwrap().remove(&id.0);
  }

  /// Deliver to every subscriber of the event's topic (and of
  /// `*`). Never blocks; slow consumers lose events.
  pub fn publish(&self, event: Event) {
    let subscribers = self.subscribers.read().unwrap();
    for subscriber in subscribers.values() {
      if !subscriber.wants(&event.typ) {
        continue;
      }
      if subscriber.tx.try_send(event.clone()).is_err() {
        tracing::trace!(
          topic = event.typ,
          "subscriber buffer full, event dropped"
        );
      }
    }
  }

  pub fn subscriber_count(&self) -> usize {
    self.subscribers.read().unwrap().len()
  }
}

/// A shared bus handle.
pub type SharedBus = Arc<EventBus>;

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn delivers_to_exact_topic_and_wildcard() {
    let bus = EventBus::new();
    let (_exact, mut exact_rx) =
      bus.subscribe([topics::OPERATION_STAGE]);
    let (_wild, mut wild_rx) = bus.subscribe([topics::WILDCARD]);
    let (_other, mut other_rx) =
      bus.subscribe([topics::CHECK_PROGRESS]);

    bus.publish(
      Event::new(topics::OPERATION_STAGE).with("stage", "backup"),
    );

    assert_eq!(
      exact_rx.recv().await.unwrap().typ,
      topics::OPERATION_STAGE
    );
    assert_eq!(
      wild_rx.recv().await.unwrap().typ,
      topics::OPERATION_STAGE
    );
    assert!(other_rx.try_recv().is_err());
  }

  #[tokio::test]
  async fn full_buffer_drops_for_that_subscriber_only() {
    let bus = EventBus::new();
    let (_slow, mut slow_rx) = bus.subscribe([topics::WILDCARD]);
    let (_fast, mut fast_rx) = bus.subscribe([topics::WILDCARD]);

    for n in 0..SUBSCRIBER_BUFFER + 10 {
      bus.publish(
        Event::new(topics::CHECK_PROGRESS).with("n", n as i64),
      );
      // Keep the fast subscriber drained.
      assert!(fast_rx.try_recv().is_ok());
    }
    // The slow subscriber holds exactly its buffer; the overflow
    // was dropped.
    let mut received = 0;
    while slow_rx.try_recv().is_ok() {
      received += 1;
    }
    assert_eq!(received, SUBSCRIBER_BUFFER);
  }

  #[tokio::test]
  async fn unsubscribe_closes_channel_and_is_idempotent() {
    let bus = EventBus::new();
    let (id, mut rx) = bus.subscribe([topics::WILDCARD]);
    bus.unsubscribe(id);
    bus.unsubscribe(id);
    assert_eq!(bus.subscriber_count(), 0);
    assert!(rx.recv().await.is_none());
  }

  #[tokio::test]
  async fn events_for_one_publisher_arrive_in_order() {
    let bus = EventBus::new();
    let (_id, mut rx) = bus.subscribe([topics::OPERATION_STAGE]);
    for n in 0..10i64 {
      bus.publish(
        Event::new(topics::OPERATION_STAGE).with("seq", n),
      );
    }
    for n in 0..10i64 {
      let event = rx.recv().await.unwrap();
      assert_eq!(event.payload["seq"], serde_json::json!(n));
    }
  }
}
