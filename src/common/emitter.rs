//! In-process event fan-out.
//!
//! An [`Emitter`] carries one event stream. Handlers run synchronously on the
//! emitting thread, in registration order. A panicking handler is logged and
//! the remaining handlers still run. Nothing is buffered for late subscribers.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, Weak};

use tracing::error;

use super::lock;

type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Identifies one registered handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

struct Registry<T> {
    next_id: u64,
    handlers: Vec<(HandlerId, Handler<T>)>,
}

pub struct Emitter<T> {
    name: &'static str,
    registry: Arc<Mutex<Registry<T>>>,
}

impl<T> Clone for Emitter<T> {
    fn clone(&self) -> Self {
        Emitter {
            name: self.name,
            registry: self.registry.clone(),
        }
    }
}

impl<T> fmt::Debug for Emitter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Emitter")
            .field("name", &self.name)
            .field("handlers", &self.handler_count())
            .finish()
    }
}

impl<T> Emitter<T> {
    pub fn handler_count(&self) -> usize {
        lock(&self.registry).handlers.len()
    }
}

impl<T: 'static> Emitter<T> {
    pub fn new(name: &'static str) -> Self {
        Emitter {
            name,
            registry: Arc::new(Mutex::new(Registry {
                next_id: 0,
                handlers: Vec::new(),
            })),
        }
    }

    /// Registers `handler`; the returned [`Subscription`] removes it again.
    pub fn on<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = {
            let mut registry = lock(&self.registry);
            let id = HandlerId(registry.next_id);
            registry.next_id += 1;
            registry.handlers.push((id, Arc::new(handler)));
            id
        };

        let weak: Weak<Mutex<Registry<T>>> = Arc::downgrade(&self.registry);
        Subscription {
            id,
            detach: Some(Box::new(move || {
                if let Some(registry) = weak.upgrade() {
                    lock(&registry).handlers.retain(|(h, _)| *h != id);
                }
            })),
        }
    }

    /// Removes a handler. Returns `false` if it was not registered.
    pub fn off(&self, id: HandlerId) -> bool {
        let mut registry = lock(&self.registry);
        let before = registry.handlers.len();
        registry.handlers.retain(|(h, _)| *h != id);
        registry.handlers.len() != before
    }

    pub fn emit(&self, payload: &T) {
        // handlers may (un)subscribe while running
        let handlers: Vec<Handler<T>> = lock(&self.registry)
            .handlers
            .iter()
            .map(|(_, h)| h.clone())
            .collect();

        for handler in handlers {
            if panic::catch_unwind(AssertUnwindSafe(|| handler(payload))).is_err() {
                error!("Handler for '{}' event panicked", self.name);
            }
        }
    }

}

/// Handle returned by [`Emitter::on`].
///
/// Dropping it keeps the handler registered; call [`Subscription::unsubscribe`]
/// to remove it.
pub struct Subscription {
    id: HandlerId,
    detach: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn id(&self) -> HandlerId {
        self.id
    }

    pub fn unsubscribe(mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}
