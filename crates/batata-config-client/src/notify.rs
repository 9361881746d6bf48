//! In-process event bus
//!
//! Events are published synchronously to every listener interested in the
//! event's concrete type. An event may declare implied events, which are
//! published first.

use std::any::{Any, TypeId};
use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, error};

/// An event that can be published on the [`NotifyCenter`].
pub trait Event: Any + Debug + Send + Sync {
    fn as_any(&self) -> &dyn Any;

    /// Events that must be published before this one.
    fn implied_events(&self) -> Vec<Arc<dyn Event>> {
        Vec::new()
    }
}

/// A handler for one or more event types.
pub trait EventListener: Send + Sync + 'static {
    /// Concrete event types this listener wants to receive.
    fn interests(&self) -> Vec<TypeId>;

    fn on_event(&self, event: &dyn Event) -> anyhow::Result<()>;
}

/// Published by the server list manager whenever its address list changes.
#[derive(Debug, Clone)]
pub struct ServerListChangedEvent {
    pub name: String,
    pub servers: Vec<String>,
}

impl Event for ServerListChangedEvent {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Synchronous event dispatcher
#[derive(Default)]
pub struct NotifyCenter {
    listeners: RwLock<HashMap<TypeId, Vec<Arc<dyn EventListener>>>>,
}

impl NotifyCenter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener. Registering the same listener twice is a no-op.
    pub fn register_listener(&self, listener: Arc<dyn EventListener>) {
        let mut listeners = self.listeners.write();
        for type_id in listener.interests() {
            let entry = listeners.entry(type_id).or_default();
            if !entry.iter().any(|l| same_listener(l, &listener)) {
                entry.push(listener.clone());
            }
        }
    }

    /// Number of listeners registered for events of type `E`.
    pub fn listener_count<E: Event>(&self) -> usize {
        self.listeners
            .read()
            .get(&TypeId::of::<E>())
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Publish an event and everything it implies.
    pub fn publish(&self, event: Arc<dyn Event>) {
        let mut published = HashSet::new();
        self.publish_inner(&event, &mut published);
    }

    fn publish_inner(&self, event: &Arc<dyn Event>, published: &mut HashSet<*const ()>) {
        let identity = Arc::as_ptr(event) as *const ();
        if !published.insert(identity) {
            return;
        }

        for implied in event.implied_events() {
            self.publish_inner(&implied, published);
        }

        let type_id = Any::type_id(event.as_any());
        // Snapshot so handlers may register further listeners.
        let listeners = self.listeners.read().get(&type_id).cloned();
        let Some(listeners) = listeners else {
            debug!(event = ?event, "No listener for event");
            return;
        };

        for listener in listeners {
            if let Err(e) = listener.on_event(event.as_ref()) {
                error!(event = ?event, error = %e, "Event listener failed");
            }
        }
    }
}

fn same_listener(a: &Arc<dyn EventListener>, b: &Arc<dyn EventListener>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}
