use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use taskpool_api::event::{PoolEvent, PoolEventKind};

/// Subscriber callback, invoked synchronously on the emitting thread.
pub type EventListener = Arc<dyn Fn(&PoolEvent) + Send + Sync>;

/// Subscriber lists per event kind.
#[derive(Default)]
pub(crate) struct EventEmitter {
    listeners: RwLock<HashMap<PoolEventKind, Vec<EventListener>>>,
}

impl EventEmitter {
    pub fn on(&self, kind: PoolEventKind, listener: EventListener) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(kind)
            .or_default()
            .push(listener);
    }

    pub fn listener_count(&self, kind: PoolEventKind) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .map_or(0, Vec::len)
    }

    /// Calls the listeners of `event`'s kind in subscription order.
    /// Listeners may subscribe from inside a callback.
    pub fn emit(&self, event: &PoolEvent) {
        let listeners = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&event.kind())
            .cloned()
            .unwrap_or_default();
        for listener in listeners {
            listener(event);
        }
    }
}

impl fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let listeners = self.listeners.read().unwrap_or_else(PoisonError::into_inner);
        let counts: HashMap<_, _> = listeners.iter().map(|(kind, list)| (*kind, list.len())).collect();
        f.debug_struct("EventEmitter").field("listeners", &counts).finish()
    }
}
