use crate::error::Result;
use crate::runtime::event::EventHost;
use crate::runtime::owner::Owner;
use crate::runtime::property::{PropertyHost, PropertyKey};
use std::any::{Any, TypeId};
use std::cell::Cell;
use std::fmt;
use std::rc::Rc;
use tracing::{debug, error, warn};

/// Release sentinel. Set when a component releases; deliberately excluded
/// from proxy mirroring so a mirrored target can never mask the proxy's own
/// release state.
pub static PROP_RELEASED: PropertyKey<bool> = PropertyKey::read_only("IsReleased", false);

/// Component lifecycle state. Only ever advances forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentState {
    New,
    Initializing,
    Running,
    Releasing,
    Released,
}

/// An interface type a component implements, used for cross-component
/// discovery (including across owners, through proxies).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Capability {
    type_id: TypeId,
    name: &'static str,
}

impl Capability {
    pub fn of<T: 'static>() -> Self {
        Self {
            type_id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Whether `value`'s concrete type is this capability's type.
    pub fn matches_value(&self, value: &dyn Any) -> bool {
        value.type_id() == self.type_id
    }
}

pub type ComponentId = u64;

/// Creation context handed to component factories by the manager.
pub struct ComponentContext {
    owner: Owner,
    id: ComponentId,
}

impl ComponentContext {
    pub(crate) fn new(owner: Owner, id: ComponentId) -> Self {
        Self { owner, id }
    }

    pub fn owner(&self) -> &Owner {
        &self.owner
    }

    pub fn id(&self) -> ComponentId {
        self.id
    }
}

/// Shared identity and state of every component: name, owner back-reference
/// (non-owning handle), lifecycle state, property table and event channels.
pub struct ComponentCore {
    name: &'static str,
    id: ComponentId,
    owner: Owner,
    state: Cell<ComponentState>,
    properties: PropertyHost,
    events: EventHost,
}

impl ComponentCore {
    pub fn new(name: &'static str, ctx: &ComponentContext) -> Self {
        Self {
            name,
            id: ctx.id,
            owner: ctx.owner.clone(),
            state: Cell::new(ComponentState::New),
            properties: PropertyHost::new(ctx.owner.clone()),
            events: EventHost::new(ctx.owner.clone()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn id(&self) -> ComponentId {
        self.id
    }

    pub fn owner(&self) -> &Owner {
        &self.owner
    }

    pub fn state(&self) -> ComponentState {
        self.state.get()
    }

    pub fn properties(&self) -> &PropertyHost {
        &self.properties
    }

    pub fn events(&self) -> &EventHost {
        &self.events
    }

    pub fn is_running_or_initializing(&self) -> bool {
        matches!(
            self.state.get(),
            ComponentState::Initializing | ComponentState::Running
        )
    }

    pub fn verify_access(&self) {
        if !self.owner.is_current() {
            error!(
                "Component '{}' accessed off its owner '{}'",
                self.name,
                self.owner.name()
            );
            debug_assert!(false, "component accessed off the owning execution context");
        }
    }
}

impl fmt::Debug for ComponentCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentCore")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("owner", &self.owner.name())
            .field("state", &self.state.get())
            .finish()
    }
}

/// A unit with a lifecycle, owned by exactly one [`Owner`] for its entire
/// lifetime. Implementations put their shared state behind the core's
/// property/event hosts and interior-mutable fields; all access happens on
/// the owning context.
pub trait Component: 'static {
    fn core(&self) -> &ComponentCore;

    /// Capability interfaces this component answers discovery for, beyond
    /// its own concrete type.
    fn capabilities(&self) -> Vec<Capability> {
        Vec::new()
    }

    fn on_initialize(&self) -> Result<()> {
        Ok(())
    }

    fn on_release(&self) {}

    fn as_any(self: Rc<Self>) -> Rc<dyn Any>;
}

pub type ComponentRc = Rc<dyn Component>;

pub fn downcast_component<T: Component>(component: &ComponentRc) -> Option<Rc<T>> {
    Rc::clone(component).as_any().downcast::<T>().ok()
}

/// Drive `New -> Initializing -> Running`; on failure roll back to
/// `Released` so a component is never left partially initialized.
pub(crate) fn initialize_component(component: &ComponentRc) -> bool {
    let core = component.core();
    core.verify_access();
    match core.state.get() {
        ComponentState::New => {}
        state => {
            warn!("Component '{}' already initialized ({:?})", core.name, state);
            return state == ComponentState::Running;
        }
    }

    core.state.set(ComponentState::Initializing);
    match component.on_initialize() {
        Ok(()) => {
            core.state.set(ComponentState::Running);
            debug!("Component '{}' running", core.name);
            true
        }
        Err(e) => {
            error!("Component '{}' failed to initialize: {}", core.name, e);
            component.on_release();
            core.state.set(ComponentState::Released);
            let _ = core.properties.set_read_only(&PROP_RELEASED, true);
            false
        }
    }
}

/// Force `-> Releasing -> Released` from any live state. Safe to call more
/// than once; the release hook runs at most once.
pub(crate) fn release_component(component: &ComponentRc) {
    let core = component.core();
    core.verify_access();
    match core.state.get() {
        ComponentState::Releasing | ComponentState::Released => return,
        _ => {}
    }

    debug!("Releasing component '{}'", core.name);
    core.state.set(ComponentState::Releasing);
    component.on_release();
    core.state.set(ComponentState::Released);
    let _ = core.properties.set_read_only(&PROP_RELEASED, true);
}
