//! camkit: component runtime and capture orchestration core for a camera
//! application.
//!
//! The [`runtime`] module provides the execution-context machinery: owners
//! (one serialized task loop per logical thread), closeable handles, typed
//! property/event hosts, component lifecycle and discovery, and cross-owner
//! proxies. The [`capture`] module builds the camera orchestration on top of
//! it: camera open/preview sequencing, photo and video capture state
//! machines, and the driver/encoder/sound boundaries as traits.

pub mod capture;
pub mod config;
pub mod error;
pub mod runtime;

pub use config::CamkitConfig;
pub use error::{CamkitError, Result};

pub use runtime::{
    find_component_on, Capability, Component, ComponentBuilder, ComponentContext, ComponentCore,
    ComponentId, ComponentManager, ComponentRc, ComponentState, CreationPriority, Event, EventHost,
    EventKey, Handle, Owner, OwnerContext, PropertyChange, PropertyFlags, PropertyHost,
    PropertyKey, ProxyComponent,
};

pub use capture::{
    Camera, CameraDevice, CameraDeviceManager, CameraInfo, CameraState, CaptureController,
    CaptureHandle, CaptureProxy, CaptureService, EncoderFactory, EncoderProfile, MediaType,
    OperationState, PhotoCaptureHandler, PhotoCaptureState, PictureData, PictureSink,
    ResolutionTier, SoundBackend, SoundPlayer, StopWaiter, VideoCaptureHandler, VideoCaptureState,
    VideoEncoder,
};
