use serde_json::Value;
use tokio::sync::broadcast;

/// High-throughput publisher for lifecycle events.
///
/// Fire-and-forget: publishing succeeds whether or not anyone is listening.
/// Tests subscribe to assert event ordering; the notifier does not hang off
/// this bus — user-visible notifications are explicit collaborator calls.
#[derive(Debug, Clone)]
pub struct EventPublisher {
    sender: broadcast::Sender<PublishedEvent>,
}

/// An event that has been published.
#[derive(Debug, Clone)]
pub struct PublishedEvent {
    pub name: String,
    pub context: Value,
    pub published_at: chrono::DateTime<chrono::Utc>,
}

impl EventPublisher {
    /// Create a new publisher with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event with the given name and context.
    pub fn publish(&self, event_name: impl Into<String>, context: Value) {
        let event = PublishedEvent {
            name: event_name.into(),
            context,
            published_at: chrono::Utc::now(),
        };
        // send() errors only when there are no subscribers, which is fine.
        let _ = self.sender.send(event);
    }

    /// Subscribe to the event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<PublishedEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventPublisher {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_and_receive() {
        let publisher = EventPublisher::new(16);
        let mut rx = publisher.subscribe();

        publisher.publish("task.completed", serde_json::json!({"task_id": "abc"}));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.name, "task.completed");
        assert_eq!(event.context["task_id"], "abc");
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_ok() {
        let publisher = EventPublisher::new(16);
        publisher.publish("run.started", Value::Null);
        assert_eq!(publisher.subscriber_count(), 0);
    }
}
