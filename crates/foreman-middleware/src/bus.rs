//! Headless, typed, topic-based publish/subscribe event bus.
//!
//! Uses [`tokio::sync::broadcast`] channels under the hood so that every
//! subscriber receives every message without any single subscriber blocking
//! the others.
//!
//! # Topics
//!
//! | Topic | Typical traffic |
//! |---|---|
//! | [`Topic::Tasks`] | Enqueue notices, stage results, task completion/failure |
//! | [`Topic::Approvals`] | Approval requests and their resolutions |
//! | [`Topic::Services`] | Service registration and removal |

use foreman_types::{Event, EventPayload};
use tokio::sync::broadcast;
use tracing::{trace, warn};

/// Default channel capacity (number of buffered events before old ones are
/// dropped for slow subscribers).
const DEFAULT_CAPACITY: usize = 256;

/// Routing lanes on the event bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Tasks,
    Approvals,
    Services,
}

/// Shared event bus. Clone it cheaply – all clones share the same underlying
/// broadcast channels.
#[derive(Clone, Debug)]
pub struct EventBus {
    tasks: broadcast::Sender<Event>,
    approvals: broadcast::Sender<Event>,
    services: broadcast::Sender<Event>,
}

impl EventBus {
    /// Create a new bus with the given channel capacity.
    ///
    /// The `capacity` is applied to every topic channel independently.
    pub fn new(capacity: usize) -> Self {
        let (tasks, _) = broadcast::channel(capacity);
        let (approvals, _) = broadcast::channel(capacity);
        let (services, _) = broadcast::channel(capacity);
        Self {
            tasks,
            approvals,
            services,
        }
    }

    /// Publish `event` to the given [`Topic`] channel.
    ///
    /// Returns the number of active receivers that were handed the event.
    /// Publishing with nobody listening is a normal condition and yields `0`.
    pub fn publish_to(&self, topic: Topic, event: Event) -> usize {
        match self.topic_sender(topic).send(event) {
            Ok(n) => n,
            Err(broadcast::error::SendError(event)) => {
                trace!(?topic, source = %event.source, "no subscribers; event dropped");
                0
            }
        }
    }

    /// Wrap `payload` in an [`Event`] stamped with `source` and publish it.
    pub fn emit(&self, topic: Topic, source: &str, payload: EventPayload) -> usize {
        self.publish_to(topic, Event::new(source, payload))
    }

    /// Subscribe to a specific [`Topic`] channel.
    pub fn subscribe_to(&self, topic: Topic) -> TopicReceiver {
        TopicReceiver {
            topic,
            receiver: self.topic_sender(topic).subscribe(),
        }
    }

    fn topic_sender(&self, topic: Topic) -> &broadcast::Sender<Event> {
        match topic {
            Topic::Tasks => &self.tasks,
            Topic::Approvals => &self.approvals,
            Topic::Services => &self.services,
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// An async receiver bound to a single [`Topic`] channel.
///
/// Obtained via [`EventBus::subscribe_to`].
pub struct TopicReceiver {
    topic: Topic,
    receiver: broadcast::Receiver<Event>,
}

impl TopicReceiver {
    /// Wait for the next event on this topic.
    ///
    /// Lag is logged and skipped over.  Returns `None` once the bus has shut
    /// down.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(topic = ?self.topic, lagged_by = n, "TopicReceiver lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Return every event already buffered for this receiver without waiting.
    pub fn drain_ready(&mut self) -> Vec<Event> {
        let mut events = Vec::new();
        loop {
            match self.receiver.try_recv() {
                Ok(event) => events.push(event),
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    warn!(topic = ?self.topic, lagged_by = n, "TopicReceiver lagged");
                }
                Err(_) => return events,
            }
        }
    }

    /// The [`Topic`] this receiver is bound to.
    pub fn topic(&self) -> Topic {
        self.topic
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn enqueued(task_id: &str) -> EventPayload {
        EventPayload::TaskEnqueued {
            task_id: task_id.to_string(),
            feature_name: "login form".to_string(),
        }
    }

    #[tokio::test]
    async fn publish_and_receive() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe_to(Topic::Tasks);

        let event = Event::new("foreman-runtime::test", enqueued("t1"));
        assert_eq!(bus.publish_to(Topic::Tasks, event.clone()), 1);

        let received = rx.recv().await.expect("event");
        assert_eq!(received.id, event.id);
        assert_eq!(received.source, event.source);
    }

    #[tokio::test]
    async fn multiple_subscribers_receive_same_event() {
        let bus = EventBus::default();
        let mut rx1 = bus.subscribe_to(Topic::Approvals);
        let mut rx2 = bus.subscribe_to(Topic::Approvals);

        let event = Event::new("foreman-kernel::approval", enqueued("t1"));
        assert_eq!(bus.publish_to(Topic::Approvals, event.clone()), 2);

        assert_eq!(rx1.recv().await.expect("rx1").id, event.id);
        assert_eq!(rx2.recv().await.expect("rx2").id, event.id);
    }

    #[test]
    fn publish_without_subscribers_is_not_an_error() {
        let bus = EventBus::default();
        assert_eq!(bus.emit(Topic::Services, "test", enqueued("t1")), 0);
    }

    /// A subscriber on `Approvals` must not receive events published to
    /// `Tasks` because they are routed through separate channels.
    #[tokio::test]
    async fn topic_subscriber_does_not_receive_other_topic_events() {
        let bus = EventBus::default();
        let mut approvals = bus.subscribe_to(Topic::Approvals);
        let _tasks = bus.subscribe_to(Topic::Tasks);

        bus.emit(Topic::Tasks, "test", enqueued("t1"));

        let result = tokio::time::timeout(Duration::from_millis(50), approvals.recv()).await;
        assert!(result.is_err(), "Approvals subscriber must not see a Tasks event");
    }

    #[tokio::test]
    async fn drain_ready_returns_buffered_events_in_order() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe_to(Topic::Tasks);
        bus.emit(Topic::Tasks, "test", enqueued("t1"));
        bus.emit(Topic::Tasks, "test", enqueued("t2"));

        let ids: Vec<String> = rx
            .drain_ready()
            .into_iter()
            .filter_map(|e| match e.payload {
                EventPayload::TaskEnqueued { task_id, .. } => Some(task_id),
                _ => None,
            })
            .collect();
        assert_eq!(ids, vec!["t1", "t2"]);
        assert!(rx.drain_ready().is_empty());
    }

    /// Flooding a small channel while the subscriber sleeps must not panic or
    /// block; the receiver skips the lag and resumes with the newest events.
    #[tokio::test]
    async fn slow_subscriber_skips_lag() {
        let bus = EventBus::new(4);
        let mut slow = bus.subscribe_to(Topic::Tasks);
        for i in 0..100 {
            bus.emit(Topic::Tasks, "flood", enqueued(&format!("t{i}")));
        }
        let event = slow.recv().await.expect("event after lag");
        assert!(matches!(
            event.payload,
            EventPayload::TaskEnqueued { ref task_id, .. } if task_id == "t96"
        ));
    }
}
