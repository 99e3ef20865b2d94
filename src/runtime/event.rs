use crate::runtime::handle::Handle;
use crate::runtime::owner::Owner;
use std::any::{Any, TypeId};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error};

/// Typed named multicast event channel declaration.
pub struct EventKey<T: 'static> {
    name: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T: 'static> EventKey<T> {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            _marker: PhantomData,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    fn id(&self) -> EventId {
        (self.name, TypeId::of::<T>())
    }
}

impl<T: 'static> fmt::Debug for EventKey<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventKey").field("name", &self.name).finish()
    }
}

type EventId = (&'static str, TypeId);

/// Payload wrapper handed to handlers. `handled` is the shared-pool
/// convention (e.g. touch input): a handler marks it so later handlers know
/// the occurrence is already consumed; delivery itself is not cut short.
pub struct Event<T> {
    pub payload: T,
    handled: bool,
}

impl<T> Event<T> {
    pub fn new(payload: T) -> Self {
        Self {
            payload,
            handled: false,
        }
    }

    pub fn mark_handled(&mut self) {
        self.handled = true;
    }

    pub fn is_handled(&self) -> bool {
        self.handled
    }
}

struct HandlerEntry<T> {
    active: Arc<AtomicBool>,
    handler: Rc<dyn Fn(&mut Event<T>)>,
}

struct Channel<T> {
    handlers: RefCell<Vec<HandlerEntry<T>>>,
}

/// Per-component typed event channels. Thread-affine like [`PropertyHost`];
/// raising delivers to handlers in registration order on the raising
/// component's own execution context.
///
/// [`PropertyHost`]: crate::runtime::property::PropertyHost
pub struct EventHost {
    owner: Owner,
    channels: RefCell<HashMap<EventId, Rc<dyn Any>>>,
}

impl EventHost {
    pub fn new(owner: Owner) -> Self {
        Self {
            owner,
            channels: RefCell::new(HashMap::new()),
        }
    }

    pub fn owner(&self) -> &Owner {
        &self.owner
    }

    fn verify_access(&self, operation: &str) {
        if !self.owner.is_current() {
            error!(
                "Event {} on owner '{}' from a foreign thread",
                operation,
                self.owner.name()
            );
            debug_assert!(false, "event {} off the owning execution context", operation);
        }
    }

    fn channel<T: 'static>(&self, key: &EventKey<T>) -> Rc<Channel<T>> {
        let mut channels = self.channels.borrow_mut();
        let entry = channels.entry(key.id()).or_insert_with(|| {
            Rc::new(Channel::<T> {
                handlers: RefCell::new(Vec::new()),
            }) as Rc<dyn Any>
        });
        Rc::clone(entry)
            .downcast::<Channel<T>>()
            .expect("event channel type")
    }

    /// Register a handler. Closing the returned subscription handle (from any
    /// thread) deactivates it.
    pub fn add_handler<T: 'static>(
        &self,
        key: &EventKey<T>,
        handler: impl Fn(&mut Event<T>) + 'static,
    ) -> Handle {
        self.verify_access("add_handler");
        let active = Arc::new(AtomicBool::new(true));
        self.channel(key).handlers.borrow_mut().push(HandlerEntry {
            active: Arc::clone(&active),
            handler: Rc::new(handler),
        });
        Handle::new("EventHandler", move || {
            active.store(false, Ordering::Release);
        })
    }

    /// Deliver `payload` to every registered handler, in registration order.
    /// Returns whether some handler marked the event handled.
    pub fn raise<T: 'static>(&self, key: &EventKey<T>, payload: T) -> bool {
        self.verify_access("raise");
        debug!("Raising event '{}'", key.name);

        let snapshot: Vec<_> = {
            let channel = self.channel(key);
            let mut handlers = channel.handlers.borrow_mut();
            handlers.retain(|entry| entry.active.load(Ordering::Acquire));
            handlers
                .iter()
                .map(|entry| (Arc::clone(&entry.active), Rc::clone(&entry.handler)))
                .collect()
        };

        let mut event = Event::new(payload);
        for (active, handler) in snapshot {
            if active.load(Ordering::Acquire) {
                handler(&mut event);
            }
        }
        event.handled
    }
}
