//! The Notification Service (§4.8): a thin, unfiltered consumer of the event
//! bus that keeps a bounded FIFO of recent events and serves both a pull API
//! (notifications since a timestamp) and a push API (a live per-client
//! stream). Left loosely specified upstream, so its shape follows the event
//! bus's own subscribe/history split rather than inventing new plumbing.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::event_bus::EventBus;
use crate::models::Event;

pub struct NotificationService {
    buffer: Mutex<VecDeque<Event>>,
    capacity: usize,
    clients: Mutex<HashMap<Uuid, mpsc::Sender<Event>>>,
}

impl NotificationService {
    /// Subscribes to every event on `event_bus` before returning, so no
    /// notification published after this call can be missed.
    pub async fn new(event_bus: &EventBus, capacity: usize) -> Arc<Self> {
        let service = Arc::new(Self {
            buffer: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            clients: Mutex::new(HashMap::new()),
        });

        let recorder = Arc::clone(&service);
        event_bus
            .subscribe(Arc::new(|_: &Event| true), Arc::new(move |event: Event| recorder.record(event)))
            .await;

        service
    }

    fn record(&self, event: Event) {
        {
            let mut buffer = self.buffer.lock().unwrap();
            buffer.push_back(event.clone());
            while buffer.len() > self.capacity {
                buffer.pop_front();
            }
        }

        let clients = self.clients.lock().unwrap();
        for sender in clients.values() {
            let _ = sender.try_send(event.clone());
        }
    }

    /// Pull API: notifications strictly newer than `since`, oldest first,
    /// capped at `limit`.
    pub fn notifications_since(&self, since: DateTime<Utc>, limit: usize) -> Vec<Event> {
        let buffer = self.buffer.lock().unwrap();
        buffer.iter().filter(|e| e.timestamp > since).take(limit).cloned().collect()
    }

    /// Push API: registers a new client queue that receives every
    /// notification recorded from this point on, until `unsubscribe_stream`
    /// is called or the receiver is dropped.
    pub fn subscribe_stream(&self, buffer_size: usize) -> (Uuid, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(buffer_size);
        let id = Uuid::new_v4();
        self.clients.lock().unwrap().insert(id, tx);
        (id, rx)
    }

    pub fn unsubscribe_stream(&self, id: Uuid) {
        self.clients.lock().unwrap().remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EventBusConfig;
    use crate::models::SYSTEM_AGENT;
    use tokio::time::{sleep, Duration};
    use uuid::Uuid as UuidGen;

    fn test_bus() -> EventBus {
        EventBus::new(EventBusConfig { buffer_size: 16, history_size: 64 })
    }

    #[tokio::test]
    async fn records_published_events_into_bounded_buffer() {
        let bus = test_bus();
        let service = NotificationService::new(&bus, 2).await;

        for i in 0..5 {
            bus.publish(Event::new(format!("evt.{i}"), UuidGen::new_v4(), SYSTEM_AGENT)).await;
        }
        sleep(Duration::from_millis(30)).await;

        let all = service.notifications_since(Utc::now() - chrono::Duration::hours(1), 100);
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].event_type, "evt.3");
        assert_eq!(all[1].event_type, "evt.4");
    }

    #[tokio::test]
    async fn notifications_since_filters_and_caps() {
        let bus = test_bus();
        let service = NotificationService::new(&bus, 10).await;

        bus.publish(Event::new("evt.a", UuidGen::new_v4(), SYSTEM_AGENT)).await;
        sleep(Duration::from_millis(10)).await;
        let cutoff = Utc::now();
        bus.publish(Event::new("evt.b", UuidGen::new_v4(), SYSTEM_AGENT)).await;
        bus.publish(Event::new("evt.c", UuidGen::new_v4(), SYSTEM_AGENT)).await;
        sleep(Duration::from_millis(30)).await;

        let recent = service.notifications_since(cutoff, 1);
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].event_type, "evt.b");
    }

    #[tokio::test]
    async fn stream_client_receives_until_unsubscribed() {
        let bus = test_bus();
        let service = NotificationService::new(&bus, 10).await;
        let (id, mut rx) = service.subscribe_stream(8);

        bus.publish(Event::new("evt.live", UuidGen::new_v4(), SYSTEM_AGENT)).await;
        let received = rx.recv().await.unwrap();
        assert_eq!(received.event_type, "evt.live");

        service.unsubscribe_stream(id);
        bus.publish(Event::new("evt.after", UuidGen::new_v4(), SYSTEM_AGENT)).await;
        sleep(Duration::from_millis(30)).await;
        assert!(rx.try_recv().is_err());
    }
}
