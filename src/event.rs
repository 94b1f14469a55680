/*! Typed publish/subscribe event bus.

The bus is owned by its session, not process-wide; tests construct a
fresh one. Subscribers register against one event kind or against the
wildcard. On emit, kind-specific subscribers run first, then wildcard
subscribers, each set in registration order. A panicking subscriber is
caught and logged without interrupting delivery.
*/
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Mutex;

use log::error;

use crate::adapter::AdapterStats;
use crate::device::DeviceInfo;
use crate::frame::{FrameError, ProtocolFrame};

/// Event kinds, used for subscription routing.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum EventKind {
    /// A device was opened.
    DeviceConnected,
    /// A device was closed.
    DeviceDisconnected,
    /// A transport error occurred.
    DeviceError,
    /// A frame was ingested.
    FrameReceived,
    /// A frame was transmitted.
    FrameSent,
    /// A frame failed validation.
    FrameError,
    /// Fresh statistics are available.
    StatsUpdate,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EventKind::DeviceConnected => "device:connected",
            EventKind::DeviceDisconnected => "device:disconnected",
            EventKind::DeviceError => "device:error",
            EventKind::FrameReceived => "frame:received",
            EventKind::FrameSent => "frame:sent",
            EventKind::FrameError => "frame:error",
            EventKind::StatsUpdate => "stats:update",
        };
        write!(f, "{s}")
    }
}

/// A bus event with its payload.
#[derive(Clone, Debug)]
pub enum Event {
    /// A device was opened.
    DeviceConnected(DeviceInfo),
    /// A device was closed.
    DeviceDisconnected(DeviceInfo),
    /// A transport error occurred.
    DeviceError {
        /// Device id.
        device: String,
        /// What went wrong.
        message: String,
    },
    /// A frame was ingested into the session log.
    FrameReceived(ProtocolFrame),
    /// A frame was transmitted.
    FrameSent(ProtocolFrame),
    /// A frame failed validation.
    FrameError {
        /// Id of the offending frame.
        frame_id: u64,
        /// The validation finding.
        error: FrameError,
    },
    /// Fresh statistics are available.
    StatsUpdate(AdapterStats),
}

impl Event {
    /// The kind used for subscription routing.
    #[must_use]
    pub fn kind(&self) -> EventKind {
        match self {
            Event::DeviceConnected(_) => EventKind::DeviceConnected,
            Event::DeviceDisconnected(_) => EventKind::DeviceDisconnected,
            Event::DeviceError { .. } => EventKind::DeviceError,
            Event::FrameReceived(_) => EventKind::FrameReceived,
            Event::FrameSent(_) => EventKind::FrameSent,
            Event::FrameError { .. } => EventKind::FrameError,
            Event::StatsUpdate(_) => EventKind::StatsUpdate,
        }
    }
}

/// Token for unsubscribing.
pub type ListenerId = u64;

/// Callback invoked per event.
pub type EventCallback = Box<dyn FnMut(&Event) + Send>;

struct Listener {
    id: ListenerId,
    callback: EventCallback,
}

#[derive(Default)]
struct Inner {
    typed: HashMap<EventKind, Vec<Listener>>,
    wildcard: Vec<Listener>,
    next_id: u64,
}

/// The event bus.
#[derive(Default)]
pub struct EventBus {
    inner: Mutex<Inner>,
}

impl EventBus {
    /// New empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to one event kind.
    pub fn subscribe(&self, kind: EventKind, callback: EventCallback) -> ListenerId {
        let mut inner = self.inner.lock().unwrap();
        inner.next_id += 1;
        let id = inner.next_id;
        inner
            .typed
            .entry(kind)
            .or_default()
            .push(Listener { id, callback });
        id
    }

    /// Subscribe to every event.
    pub fn subscribe_all(&self, callback: EventCallback) -> ListenerId {
        let mut inner = self.inner.lock().unwrap();
        inner.next_id += 1;
        let id = inner.next_id;
        inner.wildcard.push(Listener { id, callback });
        id
    }

    /// Remove a listener from whichever set holds it.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let mut removed = false;
        for listeners in inner.typed.values_mut() {
            let before = listeners.len();
            listeners.retain(|l| l.id != id);
            removed |= listeners.len() != before;
        }
        let before = inner.wildcard.len();
        inner.wildcard.retain(|l| l.id != id);
        removed | (inner.wildcard.len() != before)
    }

    /// Clear both the per-kind and the wildcard sets.
    pub fn remove_all_listeners(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.typed.clear();
        inner.wildcard.clear();
    }

    /// Deliver an event: kind subscribers first, then wildcard, each
    /// in registration order.
    pub fn emit(&self, event: &Event) {
        let kind = event.kind();
        let mut inner = self.inner.lock().unwrap();
        let inner = &mut *inner;
        if let Some(listeners) = inner.typed.get_mut(&kind) {
            for l in listeners.iter_mut() {
                Self::invoke(l, event, kind);
            }
        }
        for l in inner.wildcard.iter_mut() {
            Self::invoke(l, event, kind);
        }
    }

    fn invoke(listener: &mut Listener, event: &Event, kind: EventKind) {
        let r = std::panic::catch_unwind(AssertUnwindSafe(|| {
            (listener.callback)(event);
        }));
        if r.is_err() {
            error!("event subscriber {} panicked during {kind}", listener.id);
        }
    }

    /// Number of registered listeners, wildcard included.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.typed.values().map(Vec::len).sum::<usize>() + inner.wildcard.len()
    }
}
