//! Events and the thread-safe inbox.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;

/// Where an event came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Pushed by the host or an invoker.
    External,
    /// Raised by the machine itself (`Raise` actions, error events).
    Internal,
    /// Synthesized on entry, exit and completion (`<id>.entry`, `<id>.exit`,
    /// `<id>.done`). Never matched by the `*` pattern.
    Completion,
}

/// An event processed by a machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub name: String,
    #[serde(default)]
    pub data: Value,
    pub kind: EventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub send_id: Option<String>,
}

impl Event {
    /// Creates an external event without payload.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data: Value::Null,
            kind: EventKind::External,
            send_id: None,
        }
    }

    /// Creates an internal event.
    pub fn internal(name: impl Into<String>) -> Self {
        Self {
            kind: EventKind::Internal,
            ..Self::new(name)
        }
    }

    pub(crate) fn completion(name: impl Into<String>) -> Self {
        Self {
            kind: EventKind::Completion,
            ..Self::new(name)
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    pub fn with_send_id(mut self, send_id: impl Into<String>) -> Self {
        self.send_id = Some(send_id.into());
        self
    }

    /// Internal and completion events are both generated by the machine.
    pub fn is_internal(&self) -> bool {
        !matches!(self.kind, EventKind::External)
    }

    pub fn is_completion(&self) -> bool {
        matches!(self.kind, EventKind::Completion)
    }
}

/// The inbox of a machine.
///
/// Events pushed from other threads wait here until the next macrostep
/// drains them. Nothing else touches machine state from outside.
#[derive(Debug, Clone, Default)]
pub(crate) struct EventQueue {
    inner: Arc<Mutex<VecDeque<Event>>>,
}

impl EventQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&self, event: Event) {
        self.inner.lock().push_back(event);
    }

    pub(crate) fn drain(&self) -> Vec<Event> {
        self.inner.lock().drain(..).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub(crate) fn clear(&self) {
        self.inner.lock().clear();
    }

    pub(crate) fn sender(&self) -> EventSender {
        EventSender {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// A cloneable handle that enqueues external events into a machine.
#[derive(Debug, Clone)]
pub struct EventSender {
    inner: Arc<Mutex<VecDeque<Event>>>,
}

impl EventSender {
    pub fn send(&self, event: Event) {
        self.inner.lock().push_back(event);
    }
}
