//! Event dispatcher.
//!
//! A registry of callbacks keyed by event name. Inbound relay events and
//! local connection notifications are delivered through it synchronously,
//! in registration order. A panicking callback is logged and skipped; the
//! remaining callbacks for the event still run.

use dashmap::DashMap;
use serde_json::Value;
use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{error, trace};

/// A registered event callback.
pub type Callback = Arc<dyn Fn(&Value) + Send + Sync>;

/// Identity of a registered callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

struct Listener {
    id: ListenerId,
    callback: Callback,
}

#[derive(Default)]
struct Registry {
    listeners: DashMap<String, Vec<Listener>>,
    next_id: AtomicU64,
}

impl Registry {
    fn remove(&self, event: &str, id: ListenerId) -> bool {
        let Some(mut entry) = self.listeners.get_mut(event) else {
            return false;
        };

        let before = entry.len();
        entry.retain(|l| l.id != id);
        let removed = entry.len() != before;

        if entry.is_empty() {
            drop(entry); // Release the shard lock
            self.listeners.remove_if(event, |_, v| v.is_empty());
        }

        removed
    }
}

/// Name-keyed callback registry.
///
/// Cloning is cheap; clones share the same registry.
#[derive(Clone, Default)]
pub struct EventDispatcher {
    registry: Arc<Registry>,
}

impl fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("events", &self.registry.listeners.len())
            .finish()
    }
}

impl EventDispatcher {
    /// Create an empty dispatcher.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback for an event.
    ///
    /// The callback stays registered until the returned [`Subscription`] is
    /// dropped or unsubscribed, or until [`off`](Self::off) is called with
    /// its id.
    pub fn on<F>(&self, event: impl Into<String>, callback: F) -> Subscription
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.on_callback(event, Arc::new(callback))
    }

    /// Register an already shared callback.
    pub fn on_callback(&self, event: impl Into<String>, callback: Callback) -> Subscription {
        let event = event.into();
        let id = ListenerId(self.registry.next_id.fetch_add(1, Ordering::Relaxed));

        self.registry
            .listeners
            .entry(event.clone())
            .or_default()
            .push(Listener { id, callback });

        trace!(event = %event, listener = %id, "Listener registered");

        Subscription {
            registry: Arc::downgrade(&self.registry),
            event,
            id,
            active: true,
        }
    }

    /// Remove one callback by identity.
    ///
    /// Returns `true` if it was registered. Other callbacks for the same
    /// event are unaffected.
    pub fn off(&self, event: &str, id: ListenerId) -> bool {
        let removed = self.registry.remove(event, id);
        if removed {
            trace!(event = %event, listener = %id, "Listener removed");
        }
        removed
    }

    /// Deliver an event to every callback registered for it.
    ///
    /// Returns the number of callbacks invoked. Events nobody listens to are
    /// dropped.
    pub fn dispatch(&self, event: &str, data: &Value) -> usize {
        // Snapshot so callbacks can register or remove listeners while we
        // deliver.
        let callbacks: Vec<Callback> = match self.registry.listeners.get(event) {
            Some(listeners) => listeners.iter().map(|l| Arc::clone(&l.callback)).collect(),
            None => {
                trace!(event = %event, "No listeners, event dropped");
                return 0;
            }
        };

        for callback in &callbacks {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| callback(data))) {
                error!(
                    event = %event,
                    panic = %panic_message(panic.as_ref()),
                    "Event listener panicked"
                );
            }
        }

        callbacks.len()
    }

    /// Number of callbacks registered for an event.
    #[must_use]
    pub fn listener_count(&self, event: &str) -> usize {
        self.registry
            .listeners
            .get(event)
            .map(|l| l.len())
            .unwrap_or(0)
    }

    /// Names of all events with at least one listener.
    #[must_use]
    pub fn events(&self) -> Vec<String> {
        self.registry
            .listeners
            .iter()
            .map(|e| e.key().clone())
            .collect()
    }

    /// Remove every listener.
    pub fn clear(&self) {
        self.registry.listeners.clear();
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}

/// Handle to a registered callback.
///
/// Dropping the handle unregisters the callback. Use
/// [`detach`](Self::detach) to keep it registered for the lifetime of the
/// dispatcher.
#[must_use = "dropping a Subscription unregisters its callback"]
pub struct Subscription {
    registry: Weak<Registry>,
    event: String,
    id: ListenerId,
    active: bool,
}

impl Subscription {
    /// Identity of the registered callback.
    #[must_use]
    pub fn id(&self) -> ListenerId {
        self.id
    }

    /// Event the callback is registered for.
    #[must_use]
    pub fn event(&self) -> &str {
        &self.event
    }

    /// Unregister the callback now.
    ///
    /// Returns `true` if it was still registered.
    pub fn unsubscribe(mut self) -> bool {
        self.release()
    }

    /// Keep the callback registered and forget this handle.
    pub fn detach(mut self) -> ListenerId {
        self.active = false;
        self.id
    }

    fn release(&mut self) -> bool {
        if !std::mem::replace(&mut self.active, false) {
            return false;
        }
        match self.registry.upgrade() {
            Some(registry) => registry.remove(&self.event, self.id),
            None => false,
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("event", &self.event)
            .field("id", &self.id)
            .field("active", &self.active)
            .finish()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}
