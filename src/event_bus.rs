//! In-process publish/subscribe with filtered subscriptions and a bounded
//! ring-buffer history (§4.2).
//!
//! Each subscriber owns a bounded channel (`buffer_size` per §6.6) drained by
//! a dedicated background task, so a single subscriber always observes
//! events in publish order while a slow subscriber never blocks `publish`.
//! A subscriber callback that panics is caught and logged; it never takes
//! down the bus.

use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, RwLock};
use tracing::{error, warn};
use uuid::Uuid;

use crate::config::EventBusConfig;
use crate::models::Event;

pub type EventFilter = Arc<dyn Fn(&Event) -> bool + Send + Sync>;
pub type EventCallback = Arc<dyn Fn(Event) + Send + Sync>;

struct Subscription {
    filter: EventFilter,
    sender: mpsc::Sender<Event>,
}

pub struct EventBus {
    subscriptions: Arc<RwLock<HashMap<Uuid, Subscription>>>,
    history: Arc<RwLock<VecDeque<Event>>>,
    buffer_size: usize,
    history_size: usize,
}

impl EventBus {
    pub fn new(config: EventBusConfig) -> Self {
        Self {
            subscriptions: Arc::new(RwLock::new(HashMap::new())),
            history: Arc::new(RwLock::new(VecDeque::new())),
            buffer_size: config.buffer_size.max(1),
            history_size: config.history_size,
        }
    }

    /// Appends to the ring buffer and fans out to every matching
    /// subscriber. Never blocks on a slow subscriber: a full per-subscriber
    /// buffer just drops that delivery with a warning.
    pub async fn publish(&self, event: Event) {
        {
            let mut history = self.history.write().await;
            history.push_back(event.clone());
            while history.len() > self.history_size {
                history.pop_front();
            }
        }

        let subs = self.subscriptions.read().await;
        for sub in subs.values() {
            if (sub.filter)(&event) {
                if sub.sender.try_send(event.clone()).is_err() {
                    warn!(event_type = %event.event_type, "subscriber buffer full or closed, dropping delivery");
                }
            }
        }
    }

    /// Registers a predicate-filtered callback, returning a subscription id
    /// usable with [`EventBus::unsubscribe`].
    pub async fn subscribe(&self, filter: EventFilter, callback: EventCallback) -> Uuid {
        let (tx, mut rx) = mpsc::channel(self.buffer_size);
        let id = Uuid::new_v4();
        self.subscriptions.write().await.insert(id, Subscription { filter, sender: tx });

        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let callback = callback.clone();
                if let Err(panic) = std::panic::catch_unwind(AssertUnwindSafe(|| callback(event))) {
                    error!(subscription_id = %id, ?panic, "event subscriber callback panicked");
                }
            }
        });

        id
    }

    pub async fn subscribe_to_workspace(&self, workspace_id: Uuid, callback: EventCallback) -> Uuid {
        self.subscribe(Arc::new(move |e: &Event| e.workspace_id == workspace_id), callback).await
    }

    pub async fn subscribe_to_event_type(&self, event_type: impl Into<String>, callback: EventCallback) -> Uuid {
        let wanted = event_type.into();
        self.subscribe(Arc::new(move |e: &Event| e.event_type == wanted), callback).await
    }

    pub async fn subscribe_to_event_types(&self, event_types: Vec<String>, callback: EventCallback) -> Uuid {
        let wanted: HashSet<String> = event_types.into_iter().collect();
        self.subscribe(Arc::new(move |e: &Event| wanted.contains(&e.event_type)), callback).await
    }

    pub async fn unsubscribe(&self, id: Uuid) {
        self.subscriptions.write().await.remove(&id);
    }

    /// Returns up to `limit` recent events matching `filter`, newest-first.
    pub async fn get_history(&self, filter: EventFilter, limit: usize) -> Vec<Event> {
        let history = self.history.read().await;
        history.iter().rev().filter(|e| filter(e)).take(limit).cloned().collect()
    }

    pub async fn get_workspace_history(&self, workspace_id: Uuid, limit: usize) -> Vec<Event> {
        self.get_history(Arc::new(move |e: &Event| e.workspace_id == workspace_id), limit).await
    }

    pub async fn get_events_since(&self, since: DateTime<Utc>, limit: usize) -> Vec<Event> {
        self.get_history(Arc::new(move |e: &Event| e.timestamp > since), limit).await
    }

    /// Clears subscriptions. In-flight deliveries already queued in a
    /// subscriber's channel may still fire before its drain task notices
    /// the sender side has gone away.
    pub async fn shutdown(&self) {
        self.subscriptions.write().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::time::{sleep, Duration};

    fn test_bus() -> EventBus {
        EventBus::new(EventBusConfig { buffer_size: 16, history_size: 4 })
    }

    #[tokio::test]
    async fn subscriber_receives_matching_events_in_order() {
        let bus = test_bus();
        let received = Arc::new(Mutex::new(Vec::new()));
        let received_clone = received.clone();

        bus.subscribe_to_event_type(
            "task.completed",
            Arc::new(move |e: Event| received_clone.lock().unwrap().push(e.event_type)),
        )
        .await;

        let ws_id = Uuid::new_v4();
        bus.publish(Event::new("task.started", ws_id, "test")).await;
        bus.publish(Event::new("task.completed", ws_id, "test")).await;
        bus.publish(Event::new("task.completed", ws_id, "test")).await;

        sleep(Duration::from_millis(20)).await;
        let got = received.lock().unwrap().clone();
        assert_eq!(got, vec!["task.completed", "task.completed"]);
    }

    #[tokio::test]
    async fn history_is_bounded_and_newest_first() {
        let bus = test_bus();
        let ws_id = Uuid::new_v4();
        for i in 0..10 {
            bus.publish(Event::new(format!("evt.{i}"), ws_id, "test")).await;
        }
        let history = bus.get_workspace_history(ws_id, 100).await;
        assert_eq!(history.len(), 4);
        assert_eq!(history[0].event_type, "evt.9");
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let bus = test_bus();
        let count = Arc::new(Mutex::new(0usize));
        let count_clone = count.clone();
        let id = bus
            .subscribe(Arc::new(|_: &Event| true), Arc::new(move |_| *count_clone.lock().unwrap() += 1))
            .await;

        let ws_id = Uuid::new_v4();
        bus.publish(Event::new("x", ws_id, "test")).await;
        sleep(Duration::from_millis(10)).await;
        bus.unsubscribe(id).await;
        bus.publish(Event::new("x", ws_id, "test")).await;
        sleep(Duration::from_millis(10)).await;

        assert_eq!(*count.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn panicking_subscriber_does_not_crash_bus() {
        let bus = test_bus();
        bus.subscribe(Arc::new(|_: &Event| true), Arc::new(|_| panic!("boom"))).await;
        let ws_id = Uuid::new_v4();
        bus.publish(Event::new("x", ws_id, "test")).await;
        sleep(Duration::from_millis(10)).await;
        // still responsive afterwards
        bus.publish(Event::new("y", ws_id, "test")).await;
        let history = bus.get_workspace_history(ws_id, 10).await;
        assert_eq!(history.len(), 2);
    }
}
