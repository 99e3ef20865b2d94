//! Execution-context runtime: owners (serialized task loops), closeable
//! handles, typed property and event hosts, component lifecycle and
//! discovery, and cross-owner proxies.

pub mod component;
pub mod event;
pub mod handle;
pub mod manager;
pub mod owner;
pub mod property;
pub mod proxy;

pub use component::{
    Capability, Component, ComponentContext, ComponentCore, ComponentId, ComponentRc,
    ComponentState, PROP_RELEASED,
};
pub use event::{Event, EventHost, EventKey};
pub use handle::Handle;
pub use manager::{find_component_on, ComponentBuilder, ComponentManager, CreationPriority};
pub use owner::{Owner, OwnerContext};
pub use property::{PropertyChange, PropertyFlags, PropertyHost, PropertyKey};
pub use proxy::{ProxyComponent, PROP_TARGET_BOUND};
