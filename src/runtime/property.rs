use crate::error::{CamkitError, Result};
use crate::runtime::handle::Handle;
use crate::runtime::owner::Owner;
use std::any::{Any, TypeId};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, trace};

/// Bound for values held in properties. Values are plain data: they are
/// cloned into callbacks and carried across owner boundaries by proxies.
pub trait PropertyValue: Clone + PartialEq + fmt::Debug + Send + Sync + 'static {}

impl<T: Clone + PartialEq + fmt::Debug + Send + Sync + 'static> PropertyValue for T {}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct PropertyFlags(u8);

impl PropertyFlags {
    pub const NONE: PropertyFlags = PropertyFlags(0);
    /// Mutable only through the owning component's `set_read_only` path.
    pub const READ_ONLY: PropertyFlags = PropertyFlags(1);
    /// A `set` to a null value is rejected. Only meaningful for
    /// `Option`-typed keys declared with [`PropertyKey::not_null`].
    pub const NOT_NULL: PropertyFlags = PropertyFlags(2);

    pub const fn contains(self, other: PropertyFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn union(self, other: PropertyFlags) -> PropertyFlags {
        PropertyFlags(self.0 | other.0)
    }
}

fn option_is_none<T>(value: &Option<T>) -> bool {
    value.is_none()
}

/// Typed named property declaration: name, flags, default value and an
/// optional null check. Declared as `static`s on the owning component module.
pub struct PropertyKey<T: PropertyValue> {
    name: &'static str,
    flags: PropertyFlags,
    default: T,
    null_check: Option<fn(&T) -> bool>,
}

impl<T: PropertyValue> PropertyKey<T> {
    pub const fn new(name: &'static str, default: T) -> Self {
        Self {
            name,
            flags: PropertyFlags::NONE,
            default,
            null_check: None,
        }
    }

    pub const fn read_only(name: &'static str, default: T) -> Self {
        Self {
            name,
            flags: PropertyFlags::READ_ONLY,
            default,
            null_check: None,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn flags(&self) -> PropertyFlags {
        self.flags
    }

    pub fn default_value(&self) -> T {
        self.default.clone()
    }

    fn id(&self) -> PropertyId {
        (self.name, TypeId::of::<T>())
    }

    fn is_null(&self, value: &T) -> bool {
        match self.null_check {
            Some(check) => check(value),
            None => false,
        }
    }
}

impl<V: PropertyValue> PropertyKey<Option<V>> {
    /// Read-only key for which a mirrored/explicit `None` write is rejected.
    pub const fn not_null(name: &'static str, default: Option<V>) -> Self {
        Self {
            name,
            flags: PropertyFlags::READ_ONLY.union(PropertyFlags::NOT_NULL),
            default,
            null_check: Some(option_is_none::<V>),
        }
    }
}

impl<T: PropertyValue> fmt::Debug for PropertyKey<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PropertyKey")
            .field("name", &self.name)
            .field("flags", &self.flags)
            .finish()
    }
}

type PropertyId = (&'static str, TypeId);

/// Old and new value handed to change callbacks.
pub struct PropertyChange<'a, T> {
    pub old: &'a T,
    pub new: &'a T,
}

struct CallbackEntry<T> {
    active: Arc<AtomicBool>,
    callback: Rc<dyn Fn(&PropertyChange<T>)>,
}

struct Slot<T> {
    value: RefCell<T>,
    callbacks: RefCell<Vec<CallbackEntry<T>>>,
}

/// Per-component typed property table. Thread-affine: every access is
/// verified against the owning execution context.
pub struct PropertyHost {
    owner: Owner,
    slots: RefCell<HashMap<PropertyId, Rc<dyn Any>>>,
}

impl PropertyHost {
    pub fn new(owner: Owner) -> Self {
        Self {
            owner,
            slots: RefCell::new(HashMap::new()),
        }
    }

    pub fn owner(&self) -> &Owner {
        &self.owner
    }

    /// Off-owner access is a programming error: fail fast in debug builds,
    /// log loudly in release.
    fn verify_access(&self, operation: &str) {
        if !self.owner.is_current() {
            error!(
                "Property {} on owner '{}' from a foreign thread",
                operation,
                self.owner.name()
            );
            debug_assert!(
                false,
                "property {} off the owning execution context",
                operation
            );
        }
    }

    fn slot<T: PropertyValue>(&self, key: &PropertyKey<T>) -> Rc<Slot<T>> {
        let mut slots = self.slots.borrow_mut();
        let entry = slots.entry(key.id()).or_insert_with(|| {
            Rc::new(Slot {
                value: RefCell::new(key.default_value()),
                callbacks: RefCell::new(Vec::new()),
            }) as Rc<dyn Any>
        });
        Rc::clone(entry)
            .downcast::<Slot<T>>()
            .expect("property slot type")
    }

    pub fn get<T: PropertyValue>(&self, key: &PropertyKey<T>) -> T {
        self.verify_access("get");
        self.slot(key).value.borrow().clone()
    }

    /// Public mutation path. Rejected for read-only keys and null values;
    /// `Ok(true)` means the value changed and every registered callback was
    /// notified before this call returned.
    pub fn set<T: PropertyValue>(&self, key: &PropertyKey<T>, value: T) -> Result<bool> {
        self.verify_access("set");
        if key.flags.contains(PropertyFlags::READ_ONLY) {
            return Err(CamkitError::ReadOnlyProperty { name: key.name });
        }
        self.set_value(key, value)
    }

    /// Owner-internal mutation path for read-only keys.
    pub fn set_read_only<T: PropertyValue>(&self, key: &PropertyKey<T>, value: T) -> Result<bool> {
        self.verify_access("set_read_only");
        self.set_value(key, value)
    }

    fn set_value<T: PropertyValue>(&self, key: &PropertyKey<T>, value: T) -> Result<bool> {
        if key.is_null(&value) {
            return Err(CamkitError::NullProperty { name: key.name });
        }

        let slot = self.slot(key);
        let old = {
            let mut current = slot.value.borrow_mut();
            if *current == value {
                return Ok(false);
            }
            std::mem::replace(&mut *current, value.clone())
        };

        trace!("Property '{}': {:?} -> {:?}", key.name, old, value);
        self.notify(&slot, &old, &value);
        Ok(true)
    }

    fn notify<T: PropertyValue>(&self, slot: &Slot<T>, old: &T, new: &T) {
        // Snapshot so callbacks may add/remove subscriptions (or nest sets)
        // without holding the list borrow; closed subscriptions are purged.
        let snapshot: Vec<_> = {
            let mut callbacks = slot.callbacks.borrow_mut();
            callbacks.retain(|entry| entry.active.load(Ordering::Acquire));
            callbacks
                .iter()
                .map(|entry| (Arc::clone(&entry.active), Rc::clone(&entry.callback)))
                .collect()
        };

        let change = PropertyChange { old, new };
        for (active, callback) in snapshot {
            if active.load(Ordering::Acquire) {
                callback(&change);
            }
        }
    }

    /// Register a change callback. The returned subscription handle may be
    /// closed from any thread; a closed callback never fires again.
    pub fn add_callback<T: PropertyValue>(
        &self,
        key: &PropertyKey<T>,
        callback: impl Fn(&PropertyChange<T>) + 'static,
    ) -> Handle {
        self.verify_access("add_callback");
        let active = Arc::new(AtomicBool::new(true));
        self.slot(key).callbacks.borrow_mut().push(CallbackEntry {
            active: Arc::clone(&active),
            callback: Rc::new(callback),
        });
        Handle::new("PropertyCallback", move || {
            active.store(false, Ordering::Release);
        })
    }

    /// Replay path used by proxies mirroring a remote component: bypasses the
    /// read-only rejection and skips the release sentinel so a mirror can
    /// never mask the proxy's own release state.
    pub fn mirror_apply<T: PropertyValue>(&self, key: &PropertyKey<T>, value: T) {
        self.verify_access("mirror_apply");
        if key.id() == crate::runtime::component::PROP_RELEASED.id() {
            trace!("Skipping mirror of release sentinel");
            return;
        }
        if let Err(e) = self.set_value(key, value) {
            error!("Mirror of property '{}' rejected: {}", key.name, e);
        }
    }
}
