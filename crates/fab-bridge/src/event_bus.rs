use std::sync::{Arc, Mutex};

use crate::protocol::StreamEvent;

struct Subscriber {
    tx: flume::Sender<StreamEvent>,
    /// Empty = all projects (§4.G: "filtered by project, empty filter = all").
    projects: Vec<String>,
}

/// A broadcast-style event bus built on top of flume channels.
///
/// Each call to [`subscribe`] creates a new receiver scoped to a (possibly
/// empty, meaning unfiltered) set of project names. The bus is thread-safe
/// and can be cloned cheaply (it wraps its internals in an `Arc`).
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Mutex<Vec<Subscriber>>>,
}

impl EventBus {
    /// Create a new, empty event bus with no subscribers.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Register a new subscriber and return its receiving end. `projects`
    /// restricts delivery to events for those projects; pass an empty vec
    /// to receive every project's events.
    pub fn subscribe(&self, projects: Vec<String>) -> flume::Receiver<StreamEvent> {
        let (tx, rx) = flume::unbounded();
        let mut subs = self.inner.lock().expect("EventBus lock poisoned");
        subs.push(Subscriber { tx, projects });
        rx
    }

    /// Publish an event to every subscriber whose project filter matches.
    ///
    /// Disconnected subscribers (whose receivers have been dropped) are
    /// automatically pruned.
    pub fn broadcast(&self, event: StreamEvent) {
        let mut subs = self.inner.lock().expect("EventBus lock poisoned");
        subs.retain(|s| {
            if s.projects.is_empty() || s.projects.iter().any(|p| p == event.project()) {
                s.tx.send(event.clone()).is_ok()
            } else {
                !s.tx.is_disconnected()
            }
        });
    }

    /// Return the number of currently active subscribers.
    pub fn subscriber_count(&self) -> usize {
        let subs = self.inner.lock().expect("EventBus lock poisoned");
        subs.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
