use crate::runtime::component::{
    downcast_component, initialize_component, release_component, Capability, Component,
    ComponentContext, ComponentId, ComponentRc,
};
use crate::runtime::owner::Owner;
use parking_lot::Mutex;
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use tracing::{debug, error, info, warn};

/// Component creation priority tiers. Within a tier, creation order is
/// insertion order; `OnDemand` components are created lazily on first
/// matching lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CreationPriority {
    Launch,
    High,
    Normal,
    OnDemand,
}

type Factory = Box<dyn FnOnce(&ComponentContext) -> ComponentRc + Send>;

/// `(priority, capabilities, factory)` registration value. Builders are
/// plain values handed to a manager; there are no global builder arrays.
pub struct ComponentBuilder {
    priority: CreationPriority,
    capabilities: Vec<Capability>,
    factory: Mutex<Option<Factory>>,
}

impl ComponentBuilder {
    pub fn new(
        priority: CreationPriority,
        capabilities: Vec<Capability>,
        factory: impl FnOnce(&ComponentContext) -> ComponentRc + Send + 'static,
    ) -> Self {
        Self {
            priority,
            capabilities,
            factory: Mutex::new(Some(Box::new(factory))),
        }
    }

    fn supports(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }
}

struct BuilderEntry {
    builder: ComponentBuilder,
    built: Cell<bool>,
}

struct Watcher {
    capability: Capability,
    callback: Box<dyn FnOnce(ComponentRc)>,
}

type ComponentHook = Rc<dyn Fn(&ComponentRc)>;

/// Registry and factory for one owner's components. The manager owns the
/// registry; components keep only a non-owning [`Owner`] handle back.
pub struct ComponentManager {
    owner: Owner,
    next_id: Cell<ComponentId>,
    builders: RefCell<Vec<Rc<BuilderEntry>>>,
    components: RefCell<Vec<ComponentRc>>,
    watchers: RefCell<Vec<Watcher>>,
    added_hooks: RefCell<Vec<ComponentHook>>,
    removed_hooks: RefCell<Vec<ComponentHook>>,
}

impl ComponentManager {
    pub(crate) fn new(owner: Owner) -> Self {
        Self {
            owner,
            next_id: Cell::new(1),
            builders: RefCell::new(Vec::new()),
            components: RefCell::new(Vec::new()),
            watchers: RefCell::new(Vec::new()),
            added_hooks: RefCell::new(Vec::new()),
            removed_hooks: RefCell::new(Vec::new()),
        }
    }

    pub fn owner(&self) -> &Owner {
        &self.owner
    }

    pub fn add_builder(&self, builder: ComponentBuilder) {
        self.builders.borrow_mut().push(Rc::new(BuilderEntry {
            builder,
            built: Cell::new(false),
        }));
    }

    pub fn add_builders(&self, builders: Vec<ComponentBuilder>) {
        for builder in builders {
            self.add_builder(builder);
        }
    }

    /// Register `builder` and build it right away, regardless of the current
    /// creation pass. Components that spawn sub-components during their own
    /// initialization use this; re-entering [`create_components`] from there
    /// would build every still-pending lower-tier builder first.
    pub fn create_component(&self, builder: ComponentBuilder) -> Option<ComponentRc> {
        let entry = Rc::new(BuilderEntry {
            builder,
            built: Cell::new(false),
        });
        self.builders.borrow_mut().push(Rc::clone(&entry));
        self.build_entry(&entry)
    }

    /// Create every not-yet-built component registered at `priority` or a
    /// higher tier, tier by tier, in insertion order within each tier.
    /// On-demand builders are never built here.
    pub fn create_components(&self, priority: CreationPriority) {
        if priority == CreationPriority::OnDemand {
            warn!("create_components called with OnDemand priority");
            return;
        }
        let pending: Vec<_> = {
            let builders = self.builders.borrow();
            let mut pending: Vec<_> = builders
                .iter()
                .filter(|entry| {
                    !entry.built.get()
                        && entry.builder.priority <= priority
                        && entry.builder.priority != CreationPriority::OnDemand
                })
                .cloned()
                .collect();
            pending.sort_by_key(|entry| entry.builder.priority);
            pending
        };
        for entry in pending {
            self.build_entry(&entry);
        }
    }

    fn build_entry(&self, entry: &Rc<BuilderEntry>) -> Option<ComponentRc> {
        if entry.built.get() {
            return None;
        }
        entry.built.set(true);
        let factory = entry.builder.factory.lock().take()?;

        let id = self.next_id.get();
        self.next_id.set(id + 1);
        let ctx = ComponentContext::new(self.owner.clone(), id);
        let component = factory(&ctx);
        debug!(
            "Built component '{}' ({}) on owner '{}'",
            component.core().name(),
            id,
            self.owner.name()
        );
        self.register(component)
    }

    /// Register and initialize a freshly built component. A component whose
    /// initialization fails is not registered.
    fn register(&self, component: ComponentRc) -> Option<ComponentRc> {
        if !initialize_component(&component) {
            error!(
                "Component '{}' dropped after failed initialization",
                component.core().name()
            );
            return None;
        }
        self.components.borrow_mut().push(Rc::clone(&component));

        // fire matching lookup watchers, each at most once
        let matched: Vec<_> = {
            let mut watchers = self.watchers.borrow_mut();
            let mut matched = Vec::new();
            let mut index = 0;
            while index < watchers.len() {
                if component_matches(&component, watchers[index].capability) {
                    matched.push(watchers.remove(index));
                } else {
                    index += 1;
                }
            }
            matched
        };
        for watcher in matched {
            (watcher.callback)(Rc::clone(&component));
        }

        let hooks: Vec<_> = self.added_hooks.borrow().clone();
        for hook in hooks {
            hook(&component);
        }
        Some(component)
    }

    pub fn component_by_id(&self, id: ComponentId) -> Option<ComponentRc> {
        self.components
            .borrow()
            .iter()
            .find(|c| c.core().id() == id)
            .cloned()
    }

    /// Typed lookup across this owner's components; builds a matching
    /// on-demand component when none exists yet.
    pub fn find_component<T: Component>(&self) -> Option<Rc<T>> {
        self.find_by_capability(Capability::of::<T>())
            .and_then(|c| downcast_component::<T>(&c))
    }

    pub fn find_components<T: Component>(&self) -> Vec<Rc<T>> {
        self.components
            .borrow()
            .iter()
            .filter_map(downcast_component::<T>)
            .collect()
    }

    /// Capability lookup; builds a matching on-demand component when none
    /// exists yet.
    pub fn find_by_capability(&self, capability: Capability) -> Option<ComponentRc> {
        let existing = self
            .components
            .borrow()
            .iter()
            .find(|c| component_matches(c, capability))
            .cloned();
        if existing.is_some() {
            return existing;
        }
        self.build_on_demand(capability)
    }

    fn build_on_demand(&self, capability: Capability) -> Option<ComponentRc> {
        let entry = {
            let builders = self.builders.borrow();
            builders
                .iter()
                .find(|entry| {
                    !entry.built.get()
                        && entry.builder.priority == CreationPriority::OnDemand
                        && entry.builder.supports(capability)
                })
                .cloned()
        };
        let entry = entry?;
        info!("Creating on-demand component for {}", capability.name());
        self.build_entry(&entry)
            .filter(|c| component_matches(c, capability))
    }

    /// Resolve `capability` now, or register a one-shot watcher that fires
    /// once a matching component is added. Returns whether the lookup
    /// resolved synchronously.
    pub fn find_with_callback(
        &self,
        capability: Capability,
        callback: impl FnOnce(ComponentRc) + 'static,
    ) -> bool {
        if let Some(component) = self.find_by_capability(capability) {
            callback(component);
            return true;
        }
        self.watchers.borrow_mut().push(Watcher {
            capability,
            callback: Box::new(callback),
        });
        false
    }

    /// Release and deregister one component.
    pub fn remove_component(&self, id: ComponentId) {
        let removed = {
            let mut components = self.components.borrow_mut();
            components
                .iter()
                .position(|c| c.core().id() == id)
                .map(|index| components.remove(index))
        };
        if let Some(component) = removed {
            release_component(&component);
            let hooks: Vec<_> = self.removed_hooks.borrow().clone();
            for hook in hooks {
                hook(&component);
            }
        }
    }

    pub fn on_component_added(&self, hook: impl Fn(&ComponentRc) + 'static) {
        self.added_hooks.borrow_mut().push(Rc::new(hook));
    }

    pub fn on_component_removed(&self, hook: impl Fn(&ComponentRc) + 'static) {
        self.removed_hooks.borrow_mut().push(Rc::new(hook));
    }

    /// Release everything, newest first. Called on owner shutdown.
    pub(crate) fn release_all(&self) {
        self.watchers.borrow_mut().clear();
        let components: Vec<_> = {
            let mut components = self.components.borrow_mut();
            components.drain(..).collect()
        };
        for component in components.iter().rev() {
            release_component(component);
        }
    }
}

fn component_matches(component: &ComponentRc, capability: Capability) -> bool {
    capability.matches_value(Rc::clone(component).as_any().as_ref())
        || component.capabilities().contains(&capability)
}

/// Search a *different* owner's components by capability; the callback runs
/// on the target owner's context (synchronously if already resolvable,
/// otherwise once a match is added). Observing the found component's state
/// from the searching owner still requires a proxy.
pub fn find_component_on(
    owner: &Owner,
    capability: Capability,
    callback: impl FnOnce(ComponentRc) + Send + 'static,
) -> crate::error::Result<()> {
    owner.post(move |ctx| {
        ctx.manager().find_with_callback(capability, callback);
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::component::ComponentCore;
    use std::any::Any;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Tagged {
        core: ComponentCore,
        tag: &'static str,
    }

    impl Component for Tagged {
        fn core(&self) -> &ComponentCore {
            &self.core
        }

        fn as_any(self: Rc<Self>) -> Rc<dyn Any> {
            self
        }
    }

    fn tagged_builder(
        priority: CreationPriority,
        tag: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
    ) -> ComponentBuilder {
        ComponentBuilder::new(priority, vec![Capability::of::<Tagged>()], move |ctx| {
            log.lock().push(tag);
            Rc::new(Tagged {
                core: ComponentCore::new("tagged", ctx),
                tag,
            })
        })
    }

    #[test]
    fn test_creation_order_is_tier_then_insertion() {
        let owner = Owner::new("manager-order");
        owner.start().unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        let builders = vec![
            tagged_builder(CreationPriority::Normal, "n1", Arc::clone(&log)),
            tagged_builder(CreationPriority::Launch, "l1", Arc::clone(&log)),
            tagged_builder(CreationPriority::High, "h1", Arc::clone(&log)),
            tagged_builder(CreationPriority::Normal, "n2", Arc::clone(&log)),
            tagged_builder(CreationPriority::Launch, "l2", Arc::clone(&log)),
        ];
        owner
            .call(move |ctx| {
                ctx.manager().add_builders(builders);
                ctx.manager().create_components(CreationPriority::Normal);
            })
            .unwrap();
        assert_eq!(*log.lock(), vec!["l1", "l2", "h1", "n1", "n2"]);
        owner.shutdown();
        owner.join();
    }

    #[test]
    fn test_launch_tier_only_leaves_lower_tiers_unbuilt() {
        let owner = Owner::new("manager-tiers");
        owner.start().unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        let builders = vec![
            tagged_builder(CreationPriority::High, "h1", Arc::clone(&log)),
            tagged_builder(CreationPriority::Launch, "l1", Arc::clone(&log)),
        ];
        owner
            .call(move |ctx| {
                ctx.manager().add_builders(builders);
                ctx.manager().create_components(CreationPriority::Launch);
            })
            .unwrap();
        assert_eq!(*log.lock(), vec!["l1"]);
        owner
            .call(|ctx| ctx.manager().create_components(CreationPriority::High))
            .unwrap();
        assert_eq!(*log.lock(), vec!["l1", "h1"]);
        owner.shutdown();
        owner.join();
    }

    #[test]
    fn test_create_component_builds_immediately_and_once() {
        let owner = Owner::new("manager-immediate");
        owner.start().unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        let built = owner
            .call(move |ctx| {
                let built = ctx
                    .manager()
                    .create_component(tagged_builder(
                        CreationPriority::Normal,
                        "now",
                        Arc::clone(&log),
                    ))
                    .is_some();
                // a later tier pass must not rebuild it
                ctx.manager().create_components(CreationPriority::Normal);
                (built, log.lock().clone())
            })
            .unwrap();
        assert_eq!(built, (true, vec!["now"]));
        owner.shutdown();
        owner.join();
    }

    #[test]
    fn test_on_demand_built_on_first_lookup_only() {
        let owner = Owner::new("manager-ondemand");
        owner.start().unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        let builder = tagged_builder(CreationPriority::OnDemand, "lazy", Arc::clone(&log));
        let built = owner
            .call(move |ctx| {
                ctx.manager().add_builder(builder);
                ctx.manager().create_components(CreationPriority::Normal);
                assert!(log.lock().is_empty());

                let first = ctx.manager().find_component::<Tagged>();
                let second = ctx.manager().find_component::<Tagged>();
                assert!(first.is_some() && second.is_some());
                assert!(Rc::ptr_eq(&first.unwrap(), &second.unwrap()));
                log.lock().len()
            })
            .unwrap();
        assert_eq!(built, 1);
        owner.shutdown();
        owner.join();
    }

    #[test]
    fn test_watcher_fires_once_component_appears() {
        let owner = Owner::new("manager-watcher");
        owner.start().unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let log = Arc::new(Mutex::new(Vec::new()));

        let fired_in = Arc::clone(&fired);
        owner
            .call(move |ctx| {
                let resolved = ctx
                    .manager()
                    .find_with_callback(Capability::of::<Tagged>(), move |_| {
                        fired_in.fetch_add(1, Ordering::SeqCst);
                    });
                assert!(!resolved);
            })
            .unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        let builder = tagged_builder(CreationPriority::Normal, "late", Arc::clone(&log));
        owner
            .call(move |ctx| {
                ctx.manager().add_builder(builder);
                ctx.manager().create_components(CreationPriority::Normal);
            })
            .unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        owner.shutdown();
        owner.join();
    }

    #[test]
    fn test_remove_component_releases_it() {
        let owner = Owner::new("manager-remove");
        owner.start().unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        let builder = tagged_builder(CreationPriority::Normal, "x", Arc::clone(&log));
        let gone = owner
            .call(move |ctx| {
                ctx.manager().add_builder(builder);
                ctx.manager().create_components(CreationPriority::Normal);
                let component = ctx.manager().find_component::<Tagged>().unwrap();
                assert_eq!(component.tag, "x");
                ctx.manager().remove_component(component.core().id());
                ctx.manager()
                    .components
                    .borrow()
                    .is_empty()
            })
            .unwrap();
        assert!(gone);
        owner.shutdown();
        owner.join();
    }
}
