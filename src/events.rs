use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use crate::types::ProviderKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum EventKind {
    #[serde(rename = "customer.created")]
    CustomerCreated,
    #[serde(rename = "customer.updated")]
    CustomerUpdated,
    #[serde(rename = "customer.deleted")]
    CustomerDeleted,
    #[serde(rename = "deal.created")]
    DealCreated,
    #[serde(rename = "deal.updated")]
    DealUpdated,
    #[serde(rename = "contact.added")]
    ContactAdded,
    #[serde(rename = "sync.completed")]
    SyncCompleted,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::CustomerCreated => "customer.created",
            EventKind::CustomerUpdated => "customer.updated",
            EventKind::CustomerDeleted => "customer.deleted",
            EventKind::DealCreated => "deal.created",
            EventKind::DealUpdated => "deal.updated",
            EventKind::ContactAdded => "contact.added",
            EventKind::SyncCompleted => "sync.completed",
        }
    }
}

/// Notification emitted by the customer service after a successful
/// mutation or sync.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CrmEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub entity_id: String,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    pub source: ProviderKind,
}

/// Token returned by [`EventBus::add_listener`], used to detach it again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerHandle(u64);

type Listener = Arc<dyn Fn(&CrmEvent) + Send + Sync>;

/// Instance-owned publish/subscribe registry. Each service owns its own
/// bus, so separate service instances never cross-talk.
#[derive(Default)]
pub struct EventBus {
    listeners: Mutex<HashMap<EventKind, Vec<(u64, Listener)>>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_listener<F>(&self, kind: EventKind, listener: F) -> ListenerHandle
    where
        F: Fn(&CrmEvent) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .lock()
            .entry(kind)
            .or_default()
            .push((id, Arc::new(listener)));
        ListenerHandle(id)
    }

    pub fn remove_listener(&self, kind: EventKind, handle: ListenerHandle) -> bool {
        let mut listeners = self.listeners.lock();
        if let Some(entries) = listeners.get_mut(&kind) {
            let before = entries.len();
            entries.retain(|(id, _)| *id != handle.0);
            return entries.len() != before;
        }
        false
    }

    /// Delivers the event synchronously and in registration order. A
    /// panicking listener is logged and skipped; the rest still run.
    pub fn emit(&self, event: &CrmEvent) {
        let snapshot: Vec<Listener> = self
            .listeners
            .lock()
            .get(&event.kind)
            .map(|entries| entries.iter().map(|(_, l)| Arc::clone(l)).collect())
            .unwrap_or_default();

        for listener in snapshot {
            if catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                log::error!("event listener for {} panicked", event.kind.as_str());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(kind: EventKind) -> CrmEvent {
        CrmEvent {
            kind,
            entity_id: "native_1_abc".into(),
            payload: serde_json::json!({}),
            timestamp: Utc::now(),
            source: ProviderKind::Native,
        }
    }

    #[test]
    fn delivers_to_matching_listeners_only() {
        let bus = EventBus::new();
        let created = Arc::new(Mutex::new(0u32));
        let deleted = Arc::new(Mutex::new(0u32));

        let c = Arc::clone(&created);
        bus.add_listener(EventKind::CustomerCreated, move |_| *c.lock() += 1);
        let d = Arc::clone(&deleted);
        bus.add_listener(EventKind::CustomerDeleted, move |_| *d.lock() += 1);

        bus.emit(&event(EventKind::CustomerCreated));
        bus.emit(&event(EventKind::CustomerCreated));

        assert_eq!(*created.lock(), 2);
        assert_eq!(*deleted.lock(), 0);
    }

    #[test]
    fn removed_listener_stops_receiving() {
        let bus = EventBus::new();
        let count = Arc::new(Mutex::new(0u32));

        let c = Arc::clone(&count);
        let handle = bus.add_listener(EventKind::DealCreated, move |_| *c.lock() += 1);

        bus.emit(&event(EventKind::DealCreated));
        assert!(bus.remove_listener(EventKind::DealCreated, handle));
        bus.emit(&event(EventKind::DealCreated));

        assert_eq!(*count.lock(), 1);
        assert!(!bus.remove_listener(EventKind::DealCreated, handle));
    }

    #[test]
    fn panicking_listener_does_not_block_others() {
        let bus = EventBus::new();
        let count = Arc::new(Mutex::new(0u32));

        bus.add_listener(EventKind::SyncCompleted, |_| panic!("boom"));
        let c = Arc::clone(&count);
        bus.add_listener(EventKind::SyncCompleted, move |_| *c.lock() += 1);

        bus.emit(&event(EventKind::SyncCompleted));
        assert_eq!(*count.lock(), 1);
    }

    #[test]
    fn event_serializes_with_dotted_type() {
        let json = serde_json::to_value(event(EventKind::ContactAdded)).unwrap();
        assert_eq!(json["type"], "contact.added");
        assert_eq!(json["entityId"], "native_1_abc");
        assert_eq!(json["source"], "native");
    }
}
