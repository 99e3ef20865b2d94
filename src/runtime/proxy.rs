use crate::runtime::component::{
    downcast_component, Capability, Component, ComponentContext, ComponentCore, ComponentId,
};
use crate::runtime::event::EventKey;
use crate::runtime::handle::Handle;
use crate::runtime::owner::{Owner, OwnerContext};
use crate::runtime::property::{PropertyKey, PropertyValue};
use parking_lot::Mutex;
use std::any::Any;
use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::Arc;
use tracing::{debug, warn};

/// Set once the proxy has located its target component.
pub static PROP_TARGET_BOUND: PropertyKey<bool> = PropertyKey::read_only("IsTargetBound", false);

type Command<T> = Box<dyn FnOnce(&T) -> Option<Handle> + Send>;
type BridgeInstaller<T> = Box<dyn FnOnce(&T, &Owner, ComponentId) -> Handle + Send>;

#[derive(Default)]
struct CallState {
    cancelled: bool,
    executed: bool,
    result: Option<Handle>,
}

#[derive(Default)]
struct CallShared {
    state: Mutex<CallState>,
}

struct QueuedCall<T> {
    shared: Arc<CallShared>,
    command: Command<T>,
}

struct ProxyState<T> {
    target: Option<ComponentId>,
    released: bool,
    pending: VecDeque<QueuedCall<T>>,
    bridges: Vec<BridgeInstaller<T>>,
    bridge_subs: Vec<Handle>,
}

struct ProxyShared<T> {
    state: Mutex<ProxyState<T>>,
}

/// A component on one owner standing in for a target component of concrete
/// type `T` living on another owner. Commands are typed closures executed on
/// the target's context; registered properties and events are mirrored back
/// onto the proxy's own hosts. Binding is deferred until the target owner is
/// running and a matching component exists, and commands queued meanwhile
/// flush in order once it does.
pub struct ProxyComponent<T: Component> {
    core: ComponentCore,
    target_owner: Owner,
    shared: Arc<ProxyShared<T>>,
}

impl<T: Component> ProxyComponent<T> {
    pub fn new(name: &'static str, ctx: &ComponentContext, target_owner: Owner) -> Self {
        Self {
            core: ComponentCore::new(name, ctx),
            target_owner,
            shared: Arc::new(ProxyShared {
                state: Mutex::new(ProxyState {
                    target: None,
                    released: false,
                    pending: VecDeque::new(),
                    bridges: Vec::new(),
                    bridge_subs: Vec::new(),
                }),
            }),
        }
    }

    pub fn target_owner(&self) -> &Owner {
        &self.target_owner
    }

    pub fn is_bound(&self) -> bool {
        self.shared.state.lock().target.is_some()
    }

    /// Mirror `key` from the target onto this proxy's own property table.
    /// The current value is replayed at bind time, then every change is
    /// forwarded. Must be registered before binding completes; the release
    /// sentinel is never mirrored regardless.
    pub fn mirror_property<P: PropertyValue>(&self, key: &'static PropertyKey<P>) {
        self.core.verify_access();
        let installer: BridgeInstaller<T> =
            Box::new(move |target, proxy_owner, proxy_id| {
                let host = target.core().properties();
                forward_property(proxy_owner, proxy_id, key, host.get(key));
                let owner = proxy_owner.clone();
                host.add_callback(key, move |change| {
                    forward_property(&owner, proxy_id, key, change.new.clone());
                })
            });
        self.shared.state.lock().bridges.push(installer);
    }

    /// Re-raise the target's `key` events on this proxy's own event host.
    pub fn mirror_event<E: Clone + Send + 'static>(&self, key: &'static EventKey<E>) {
        self.core.verify_access();
        let installer: BridgeInstaller<T> =
            Box::new(move |target, proxy_owner, proxy_id| {
                let owner = proxy_owner.clone();
                target.core().events().add_handler(key, move |event| {
                    let payload = event.payload.clone();
                    let _ = owner.post(move |ctx| {
                        if let Some(proxy) = ctx.manager().component_by_id(proxy_id) {
                            proxy.core().events().raise(key, payload);
                        }
                    });
                })
            });
        self.shared.state.lock().bridges.push(installer);
    }

    /// Run `command` against the target on the target's context. Before the
    /// target is bound the command queues; queued and in-flight calls are
    /// cancelled by closing the returned handle. A cancelled command never
    /// runs, and a command that already ran has its nested result handle
    /// closed on the target context instead.
    pub fn call_target(
        &self,
        command: impl FnOnce(&T) -> Option<Handle> + Send + 'static,
    ) -> Handle {
        self.core.verify_access();
        if !self.core.is_running_or_initializing() {
            warn!("Proxy '{}' called after release", self.core.name());
            return Handle::empty("ProxyCall");
        }

        let call = Arc::new(CallShared::default());
        let queued = QueuedCall {
            shared: Arc::clone(&call),
            command: Box::new(command),
        };

        let run_now = {
            let mut state = self.shared.state.lock();
            if state.released {
                return Handle::empty("ProxyCall");
            }
            match state.target {
                Some(id) => Some((id, queued)),
                None => {
                    state.pending.push_back(queued);
                    None
                }
            }
        };
        if let Some((target_id, queued)) = run_now {
            if self.target_owner.is_current() {
                // proxy and target share an owner; run inline
                if let Some(ctx) = OwnerContext::current() {
                    if let Some(component) = ctx.manager().component_by_id(target_id) {
                        if let Some(target) = downcast_component::<T>(&component) {
                            run_call(queued, target.as_ref());
                        }
                    }
                }
            } else {
                let posted = self.target_owner.post(move |ctx| {
                    if let Some(component) = ctx.manager().component_by_id(target_id) {
                        if let Some(target) = downcast_component::<T>(&component) {
                            run_call(queued, target.as_ref());
                        }
                    }
                });
                if posted.is_err() {
                    return Handle::empty("ProxyCall");
                }
            }
        }

        let target_owner = self.target_owner.clone();
        Handle::new("ProxyCall", move || {
            let result = {
                let mut state = call.state.lock();
                state.cancelled = true;
                state.result.take()
            };
            if let Some(result) = result {
                let _ = target_owner.post(move |_| result.close());
            }
        })
    }

    fn start_binding(&self) {
        let shared = Arc::clone(&self.shared);
        let proxy_owner = self.core.owner().clone();
        let proxy_id = self.core.id();
        self.target_owner.on_started(move || {
            let ctx = match OwnerContext::current() {
                Some(ctx) => ctx,
                None => return,
            };
            ctx.manager()
                .find_with_callback(Capability::of::<T>(), move |component| {
                    if let Some(target) = downcast_component::<T>(&component) {
                        bind(shared, &target, proxy_owner, proxy_id);
                    }
                });
        });
    }
}

impl<T: Component> Component for ProxyComponent<T> {
    fn core(&self) -> &ComponentCore {
        &self.core
    }

    fn on_initialize(&self) -> crate::error::Result<()> {
        self.start_binding();
        Ok(())
    }

    fn on_release(&self) {
        let (pending, subs) = {
            let mut state = self.shared.state.lock();
            state.released = true;
            (
                std::mem::take(&mut state.pending),
                std::mem::take(&mut state.bridge_subs),
            )
        };
        debug!(
            "Proxy '{}' released, dropping {} pending call(s)",
            self.core.name(),
            pending.len()
        );
        for sub in subs {
            sub.close();
        }
    }

    fn as_any(self: Rc<Self>) -> Rc<dyn Any> {
        self
    }
}

/// Runs on the target owner's context once a matching target exists.
fn bind<T: Component>(
    shared: Arc<ProxyShared<T>>,
    target: &Rc<T>,
    proxy_owner: Owner,
    proxy_id: ComponentId,
) {
    let (pending, installers) = {
        let mut state = shared.state.lock();
        if state.released {
            return;
        }
        state.target = Some(target.core().id());
        (
            std::mem::take(&mut state.pending),
            std::mem::take(&mut state.bridges),
        )
    };
    debug!(
        "Proxy bound to '{}', flushing {} pending call(s)",
        target.core().name(),
        pending.len()
    );

    // Release may race the flush from the proxy owner; once it lands, the
    // remaining calls are cancelled and nothing further is installed.
    for call in pending {
        if shared.state.lock().released {
            return;
        }
        run_call(call, target.as_ref());
    }

    let subs: Vec<_> = installers
        .into_iter()
        .map(|installer| installer(target.as_ref(), &proxy_owner, proxy_id))
        .collect();
    {
        let mut state = shared.state.lock();
        if state.released {
            // on_release already drained bridge_subs; close these here
            drop(state);
            for sub in subs {
                sub.close();
            }
            return;
        }
        state.bridge_subs.extend(subs);
    }

    let _ = proxy_owner.post(move |ctx| {
        if let Some(proxy) = ctx.manager().component_by_id(proxy_id) {
            let _ = proxy
                .core()
                .properties()
                .set_read_only(&PROP_TARGET_BOUND, true);
        }
    });
}

/// Executes one command on the target context, honouring cancellation: a
/// cancelled call never runs, and a cancellation racing the run closes the
/// nested result handle right here on the target context.
fn run_call<T>(call: QueuedCall<T>, target: &T) {
    {
        let mut state = call.shared.state.lock();
        if state.cancelled {
            return;
        }
        state.executed = true;
    }
    let result = (call.command)(target);
    let mut state = call.shared.state.lock();
    if state.cancelled {
        drop(state);
        if let Some(result) = result {
            result.close();
        }
    } else {
        state.result = result;
    }
}

fn forward_property<P: PropertyValue>(
    proxy_owner: &Owner,
    proxy_id: ComponentId,
    key: &'static PropertyKey<P>,
    value: P,
) {
    let _ = proxy_owner.post(move |ctx| {
        if let Some(proxy) = ctx.manager().component_by_id(proxy_id) {
            proxy.core().properties().mirror_apply(key, value);
        }
    });
}
