use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tokio::sync::mpsc;
use tracing::debug;

use crate::types::WikiEvent;

struct Subscriber {
    id: u64,
    tx: mpsc::UnboundedSender<WikiEvent>,
}

/// In-process pub/sub for wiki generation progress, keyed by wiki id.
///
/// Publishing never blocks the caller: each subscriber drains its own
/// unbounded queue. Nothing is persisted — late subscribers never see past
/// events. When the last subscriber for an id leaves, its bucket is
/// reclaimed.
pub struct EventBus {
    subscribers: Mutex<HashMap<String, Vec<Subscriber>>>,
    next_id: AtomicU64,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Deliver an event to every current subscriber for `wiki_id`.
    /// Subscribers whose receiver has been dropped are pruned here.
    pub fn publish(&self, wiki_id: &str, event: WikiEvent) {
        let mut map = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        let Some(subs) = map.get_mut(wiki_id) else {
            return;
        };
        subs.retain(|s| s.tx.send(event.clone()).is_ok());
        debug!(
            wiki_id,
            kind = event.kind(),
            subscribers = subs.len(),
            "published wiki event"
        );
        if subs.is_empty() {
            map.remove(wiki_id);
        }
    }

    /// Register a fresh queue for `wiki_id`. The returned id is the handle
    /// for `unsubscribe`.
    pub fn subscribe(&self, wiki_id: &str) -> (u64, mpsc::UnboundedReceiver<WikiEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut map = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        map.entry(wiki_id.to_string())
            .or_default()
            .push(Subscriber { id, tx });
        (id, rx)
    }

    pub fn unsubscribe(&self, wiki_id: &str, subscriber_id: u64) {
        let mut map = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(subs) = map.get_mut(wiki_id) {
            subs.retain(|s| s.id != subscriber_id);
            if subs.is_empty() {
                map.remove(wiki_id);
            }
        }
    }

    pub fn subscriber_count(&self, wiki_id: &str) -> usize {
        let map = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        map.get(wiki_id).map(|s| s.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::WikiStatus;

    #[test]
    fn events_arrive_in_publish_order() {
        let bus = EventBus::new();
        let (_id, mut rx) = bus.subscribe("w1");

        bus.publish("w1", WikiEvent::StatusChange { status: WikiStatus::Cloning });
        bus.publish("w1", WikiEvent::StatusChange { status: WikiStatus::Analyzing });
        bus.publish("w1", WikiEvent::Complete { wiki_id: "w1".into() });

        assert_eq!(rx.try_recv().map(|e| e.kind()), Ok("status_change"));
        assert_eq!(rx.try_recv().map(|e| e.kind()), Ok("status_change"));
        assert_eq!(rx.try_recv().map(|e| e.kind()), Ok("complete"));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn late_subscribers_miss_past_events() {
        let bus = EventBus::new();
        bus.publish("w1", WikiEvent::Complete { wiki_id: "w1".into() });

        let (_id, mut rx) = bus.subscribe("w1");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn bucket_reclaimed_after_last_unsubscribe() {
        let bus = EventBus::new();
        let (a, _rx_a) = bus.subscribe("w1");
        let (b, _rx_b) = bus.subscribe("w1");
        assert_eq!(bus.subscriber_count("w1"), 2);

        bus.unsubscribe("w1", a);
        assert_eq!(bus.subscriber_count("w1"), 1);
        bus.unsubscribe("w1", b);
        assert_eq!(bus.subscriber_count("w1"), 0);
    }

    #[test]
    fn dropped_receivers_are_pruned_on_publish() {
        let bus = EventBus::new();
        let (_id, rx) = bus.subscribe("w1");
        drop(rx);

        bus.publish("w1", WikiEvent::Error { message: "boom".into() });
        assert_eq!(bus.subscriber_count("w1"), 0);
    }
}
