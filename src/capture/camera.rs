use crate::capture::states::{CameraState, OperationState};
use crate::error::{CamkitError, Result};
use crate::runtime::component::{
    Capability, Component, ComponentContext, ComponentCore, ComponentId,
};
use crate::runtime::event::EventKey;
use crate::runtime::handle::Handle;
use crate::runtime::manager::{ComponentBuilder, CreationPriority};
use crate::runtime::owner::{Owner, OwnerContext};
use crate::runtime::property::PropertyKey;
use serde::Serialize;
use std::any::Any;
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Driver-level camera state, preview state and capture-session state.
pub static PROP_CAMERA_STATE: PropertyKey<CameraState> =
    PropertyKey::read_only("CameraState", CameraState::Closed);
pub static PROP_PREVIEW_STATE: PropertyKey<OperationState> =
    PropertyKey::read_only("PreviewState", OperationState::Stopped);
pub static PROP_CAPTURE_STATE: PropertyKey<OperationState> =
    PropertyKey::read_only("CaptureState", OperationState::Stopped);

/// Shutter fired for one frame of a capture burst (payload = frame index).
pub static EVENT_SHUTTER: EventKey<u32> = EventKey::new("Shutter");
pub static EVENT_PICTURE_RECEIVED: EventKey<PictureData> = EventKey::new("PictureReceived");
pub static EVENT_CAPTURE_FAILED: EventKey<String> = EventKey::new("CaptureFailed");
pub static EVENT_ERROR: EventKey<String> = EventKey::new("CameraError");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LensFacing {
    Back,
    Front,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CameraInfo {
    pub id: String,
    pub name: String,
    pub facing: LensFacing,
}

/// One captured frame, delivered through [`EVENT_PICTURE_RECEIVED`].
#[derive(Debug, Clone, PartialEq)]
pub struct PictureData {
    pub frame_index: u32,
    pub bytes: Arc<Vec<u8>>,
}

/// Completion reported asynchronously by a driver through [`CameraSignal`].
#[derive(Debug, Clone)]
pub enum CameraEvent {
    Opened,
    OpenFailed { message: String },
    Closed,
    PreviewStarted,
    PreviewStopped,
    Shutter { frame_index: u32 },
    PictureReady(PictureData),
    CaptureCompleted,
    CaptureFailed { message: String },
    Error { message: String },
}

/// `Send` reporting handle a driver uses to deliver completions back onto
/// the owning context. Emission order is preserved.
#[derive(Clone)]
pub struct CameraSignal {
    owner: Owner,
    camera: ComponentId,
}

impl CameraSignal {
    pub fn emit(&self, event: CameraEvent) {
        let camera = self.camera;
        let posted = self.owner.post(move |ctx| {
            let found = ctx
                .manager()
                .component_by_id(camera)
                .and_then(|c| crate::runtime::component::downcast_component::<Camera>(&c));
            match found {
                Some(camera) => camera.handle_driver_event(event),
                None => debug!("Camera signal after camera removal, dropped"),
            }
        });
        if posted.is_err() {
            debug!("Camera signal after owner shutdown, dropped");
        }
    }
}

/// The OS camera driver boundary. All methods are invoked on the owning
/// context and must not block; completions arrive through the signal.
pub trait CameraDevice: Send + 'static {
    fn info(&self) -> CameraInfo;

    fn open(&self, signal: &CameraSignal) -> Result<()>;
    fn close(&self, signal: &CameraSignal);

    fn start_preview(&self, signal: &CameraSignal) -> Result<()>;
    fn stop_preview(&self, signal: &CameraSignal);

    /// Begin a capture of `frame_count` frames. The returned handle stops
    /// the hardware capture when closed.
    fn capture(&self, frame_count: u32, signal: &CameraSignal) -> Result<Handle>;

    /// Route the preview stream into an attached recorder.
    fn attach_recorder(&self, signal: &CameraSignal) -> Result<()>;
    fn detach_recorder(&self, signal: &CameraSignal);
}

/// Wraps one [`CameraDevice`] as a component: driver completions become
/// property changes and events on the owning context.
pub struct Camera {
    core: ComponentCore,
    device: Box<dyn CameraDevice>,
    info: CameraInfo,
}

impl Camera {
    pub fn new(ctx: &ComponentContext, device: Box<dyn CameraDevice>) -> Self {
        let info = device.info();
        Self {
            core: ComponentCore::new("Camera", ctx),
            device,
            info,
        }
    }

    pub fn info(&self) -> &CameraInfo {
        &self.info
    }

    fn signal(&self) -> CameraSignal {
        CameraSignal {
            owner: self.core.owner().clone(),
            camera: self.core.id(),
        }
    }

    pub fn state(&self) -> CameraState {
        self.core.properties().get(&PROP_CAMERA_STATE)
    }

    pub fn preview_state(&self) -> OperationState {
        self.core.properties().get(&PROP_PREVIEW_STATE)
    }

    pub fn capture_state(&self) -> OperationState {
        self.core.properties().get(&PROP_CAPTURE_STATE)
    }

    /// Idempotent open: already `Opening`/`Opened` short-circuits to success.
    pub fn open(&self) -> Result<()> {
        self.core.verify_access();
        match self.state() {
            CameraState::Opening | CameraState::Opened => return Ok(()),
            CameraState::Unavailable => {
                return Err(CamkitError::camera(format!(
                    "camera '{}' is unavailable",
                    self.info.id
                )))
            }
            CameraState::Closed | CameraState::Closing => {}
        }
        info!("Opening camera '{}'", self.info.id);
        let _ = self
            .core
            .properties()
            .set_read_only(&PROP_CAMERA_STATE, CameraState::Opening);
        if let Err(e) = self.device.open(&self.signal()) {
            error!("Failed to open camera '{}': {}", self.info.id, e);
            let _ = self
                .core
                .properties()
                .set_read_only(&PROP_CAMERA_STATE, CameraState::Closed);
            return Err(e);
        }
        Ok(())
    }

    pub fn close(&self) {
        self.core.verify_access();
        match self.state() {
            CameraState::Closed | CameraState::Closing | CameraState::Unavailable => return,
            CameraState::Opening | CameraState::Opened => {}
        }
        info!("Closing camera '{}'", self.info.id);
        let _ = self
            .core
            .properties()
            .set_read_only(&PROP_CAMERA_STATE, CameraState::Closing);
        self.device.close(&self.signal());
    }

    pub fn start_preview(&self) -> Result<()> {
        self.core.verify_access();
        if self.state() != CameraState::Opened {
            return Err(CamkitError::invalid_state("start_preview", self.state()));
        }
        match self.preview_state() {
            OperationState::Starting | OperationState::Started => return Ok(()),
            OperationState::Stopping | OperationState::Stopped => {}
        }
        let _ = self
            .core
            .properties()
            .set_read_only(&PROP_PREVIEW_STATE, OperationState::Starting);
        if let Err(e) = self.device.start_preview(&self.signal()) {
            let _ = self
                .core
                .properties()
                .set_read_only(&PROP_PREVIEW_STATE, OperationState::Stopped);
            return Err(e);
        }
        Ok(())
    }

    pub fn stop_preview(&self) {
        self.core.verify_access();
        match self.preview_state() {
            OperationState::Stopping | OperationState::Stopped => return,
            OperationState::Starting | OperationState::Started => {}
        }
        let _ = self
            .core
            .properties()
            .set_read_only(&PROP_PREVIEW_STATE, OperationState::Stopping);
        self.device.stop_preview(&self.signal());
    }

    /// Begin a hardware capture. Only one capture session at a time.
    pub fn capture(&self, frame_count: u32) -> Result<Handle> {
        self.core.verify_access();
        if self.capture_state() != OperationState::Stopped {
            return Err(CamkitError::invalid_state("capture", self.capture_state()));
        }
        let _ = self
            .core
            .properties()
            .set_read_only(&PROP_CAPTURE_STATE, OperationState::Starting);
        match self.device.capture(frame_count, &self.signal()) {
            Ok(handle) => Ok(handle),
            Err(e) => {
                let _ = self
                    .core
                    .properties()
                    .set_read_only(&PROP_CAPTURE_STATE, OperationState::Stopped);
                Err(e)
            }
        }
    }

    pub fn attach_recorder(&self) -> Result<()> {
        self.core.verify_access();
        self.device.attach_recorder(&self.signal())
    }

    pub fn detach_recorder(&self) {
        self.core.verify_access();
        self.device.detach_recorder(&self.signal());
    }

    fn handle_driver_event(&self, event: CameraEvent) {
        if !self.core.is_running_or_initializing() {
            return;
        }
        let properties = self.core.properties();
        let events = self.core.events();
        match event {
            CameraEvent::Opened => {
                let _ = properties.set_read_only(&PROP_CAMERA_STATE, CameraState::Opened);
            }
            CameraEvent::OpenFailed { message } => {
                error!("Camera '{}' open failed: {}", self.info.id, message);
                let _ = properties.set_read_only(&PROP_CAMERA_STATE, CameraState::Unavailable);
                events.raise(&EVENT_ERROR, message);
            }
            CameraEvent::Closed => {
                let _ = properties.set_read_only(&PROP_CAMERA_STATE, CameraState::Closed);
            }
            CameraEvent::PreviewStarted => {
                let _ = properties.set_read_only(&PROP_PREVIEW_STATE, OperationState::Started);
            }
            CameraEvent::PreviewStopped => {
                let _ = properties.set_read_only(&PROP_PREVIEW_STATE, OperationState::Stopped);
            }
            CameraEvent::Shutter { frame_index } => {
                if self.capture_state() == OperationState::Starting {
                    let _ = properties.set_read_only(&PROP_CAPTURE_STATE, OperationState::Started);
                }
                events.raise(&EVENT_SHUTTER, frame_index);
            }
            CameraEvent::PictureReady(picture) => {
                events.raise(&EVENT_PICTURE_RECEIVED, picture);
            }
            CameraEvent::CaptureCompleted => {
                let _ = properties.set_read_only(&PROP_CAPTURE_STATE, OperationState::Stopped);
            }
            CameraEvent::CaptureFailed { message } => {
                warn!("Camera '{}' capture failed: {}", self.info.id, message);
                events.raise(&EVENT_CAPTURE_FAILED, message);
                let _ = properties.set_read_only(&PROP_CAPTURE_STATE, OperationState::Stopped);
            }
            CameraEvent::Error { message } => {
                error!("Camera '{}' error: {}", self.info.id, message);
                events.raise(&EVENT_ERROR, message);
            }
        }
    }
}

impl Component for Camera {
    fn core(&self) -> &ComponentCore {
        &self.core
    }

    fn on_release(&self) {
        self.close();
    }

    fn as_any(self: Rc<Self>) -> Rc<dyn Any> {
        self
    }
}

pub static PROP_AVAILABLE_CAMERAS: PropertyKey<Vec<CameraInfo>> =
    PropertyKey::read_only("AvailableCameras", Vec::new());

/// Owns the injected driver list and spawns one [`Camera`] component per
/// device on the owning context.
pub struct CameraDeviceManager {
    core: ComponentCore,
    devices: RefCell<Vec<Box<dyn CameraDevice>>>,
}

impl CameraDeviceManager {
    pub fn new(ctx: &ComponentContext, devices: Vec<Box<dyn CameraDevice>>) -> Self {
        Self {
            core: ComponentCore::new("CameraDeviceManager", ctx),
            devices: RefCell::new(devices),
        }
    }

    pub fn available_cameras(&self) -> Vec<CameraInfo> {
        self.core.properties().get(&PROP_AVAILABLE_CAMERAS)
    }
}

impl Component for CameraDeviceManager {
    fn core(&self) -> &ComponentCore {
        &self.core
    }

    fn on_initialize(&self) -> Result<()> {
        let ctx = OwnerContext::current().ok_or_else(|| CamkitError::CrossContext {
            owner: self.core.owner().name().to_string(),
        })?;

        let devices: Vec<_> = self.devices.borrow_mut().drain(..).collect();
        let infos: Vec<_> = devices.iter().map(|d| d.info()).collect();
        info!("Found {} camera device(s)", infos.len());
        self.core
            .properties()
            .set_read_only(&PROP_AVAILABLE_CAMERAS, infos)?;

        // Build each camera right now: components registered after this
        // manager may look cameras up from their own initialization.
        for device in devices {
            let _ = ctx.manager().create_component(ComponentBuilder::new(
                CreationPriority::Normal,
                vec![Capability::of::<Camera>()],
                move |component_ctx| Rc::new(Camera::new(component_ctx, device)),
            ));
        }
        Ok(())
    }

    fn as_any(self: Rc<Self>) -> Rc<dyn Any> {
        self
    }
}

/// Shared control block for [`MockCameraDevice`]: lets a test (or the demo
/// binary) script driver behaviour and emit completions by hand.
#[derive(Clone, Default)]
pub struct MockCameraControl {
    shared: Arc<parking_lot::Mutex<MockShared>>,
}

#[derive(Default)]
struct MockShared {
    signal: Option<CameraSignal>,
    fail_open: bool,
    defer_preview_start: bool,
    defer_preview_stop: bool,
    manual_capture: bool,
    capture_calls: u32,
}

impl MockCameraControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn device(&self, id: &str, facing: LensFacing) -> Box<dyn CameraDevice> {
        Box::new(MockCameraDevice {
            info: CameraInfo {
                id: id.to_string(),
                name: format!("mock-{id}"),
                facing,
            },
            shared: Arc::clone(&self.shared),
        })
    }

    /// Make the next `open` fail synchronously.
    pub fn set_fail_open(&self, fail: bool) {
        self.shared.lock().fail_open = fail;
    }

    /// Swallow `start_preview`; the preview stays `Starting` until
    /// [`complete_preview_start`](Self::complete_preview_start) is called.
    pub fn set_defer_preview_start(&self, defer: bool) {
        self.shared.lock().defer_preview_start = defer;
    }

    /// Swallow `stop_preview`; the preview never reaches `Stopped` until
    /// [`complete_preview_stop`](Self::complete_preview_stop) is called.
    pub fn set_defer_preview_stop(&self, defer: bool) {
        self.shared.lock().defer_preview_stop = defer;
    }

    /// Suppress automatic frame/completion emission for `capture`; the test
    /// drives the session through [`emit`](Self::emit).
    pub fn set_manual_capture(&self, manual: bool) {
        self.shared.lock().manual_capture = manual;
    }

    pub fn capture_calls(&self) -> u32 {
        self.shared.lock().capture_calls
    }

    /// Emit a driver completion as if the hardware reported it.
    pub fn emit(&self, event: CameraEvent) {
        let signal = self.shared.lock().signal.clone();
        match signal {
            Some(signal) => signal.emit(event),
            None => warn!("Mock camera emit before open, dropped"),
        }
    }

    pub fn complete_preview_start(&self) {
        self.emit(CameraEvent::PreviewStarted);
    }

    pub fn complete_preview_stop(&self) {
        self.emit(CameraEvent::PreviewStopped);
    }
}

pub struct MockCameraDevice {
    info: CameraInfo,
    shared: Arc<parking_lot::Mutex<MockShared>>,
}

impl CameraDevice for MockCameraDevice {
    fn info(&self) -> CameraInfo {
        self.info.clone()
    }

    fn open(&self, signal: &CameraSignal) -> Result<()> {
        let mut shared = self.shared.lock();
        shared.signal = Some(signal.clone());
        if shared.fail_open {
            return Err(CamkitError::camera("mock open failure"));
        }
        signal.emit(CameraEvent::Opened);
        Ok(())
    }

    fn close(&self, signal: &CameraSignal) {
        signal.emit(CameraEvent::Closed);
    }

    fn start_preview(&self, signal: &CameraSignal) -> Result<()> {
        if self.shared.lock().defer_preview_start {
            debug!("Mock camera deferring preview start");
            return Ok(());
        }
        signal.emit(CameraEvent::PreviewStarted);
        Ok(())
    }

    fn stop_preview(&self, signal: &CameraSignal) {
        if self.shared.lock().defer_preview_stop {
            debug!("Mock camera deferring preview stop");
            return;
        }
        signal.emit(CameraEvent::PreviewStopped);
    }

    fn capture(&self, frame_count: u32, signal: &CameraSignal) -> Result<Handle> {
        let manual = {
            let mut shared = self.shared.lock();
            shared.capture_calls += 1;
            shared.manual_capture
        };
        if !manual {
            for frame_index in 0..frame_count {
                signal.emit(CameraEvent::Shutter { frame_index });
                signal.emit(CameraEvent::PictureReady(PictureData {
                    frame_index,
                    bytes: Arc::new(vec![0xD8, 0xFF]),
                }));
            }
            signal.emit(CameraEvent::CaptureCompleted);
        }
        let stop_signal = signal.clone();
        Ok(Handle::new("MockCapture", move || {
            if manual {
                stop_signal.emit(CameraEvent::CaptureCompleted);
            }
        }))
    }

    fn attach_recorder(&self, _signal: &CameraSignal) -> Result<()> {
        Ok(())
    }

    fn detach_recorder(&self, _signal: &CameraSignal) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capture_rig() -> (Owner, MockCameraControl) {
        let owner = Owner::new("camera-test");
        owner.start().unwrap();
        let control = MockCameraControl::new();
        let devices = vec![control.device("0", LensFacing::Back)];
        owner
            .call(move |ctx| {
                ctx.manager().add_builder(ComponentBuilder::new(
                    CreationPriority::Normal,
                    vec![Capability::of::<CameraDeviceManager>()],
                    move |component_ctx| Rc::new(CameraDeviceManager::new(component_ctx, devices)),
                ));
                ctx.manager().create_components(CreationPriority::Normal);
            })
            .unwrap();
        (owner, control)
    }

    fn with_camera<R: Send + 'static>(
        owner: &Owner,
        f: impl FnOnce(&Camera) -> R + Send + 'static,
    ) -> R {
        owner
            .call(move |ctx| {
                let camera = ctx.manager().find_component::<Camera>().unwrap();
                f(&camera)
            })
            .unwrap()
    }

    struct CameraConsumer {
        core: ComponentCore,
    }

    impl Component for CameraConsumer {
        fn core(&self) -> &ComponentCore {
            &self.core
        }

        fn as_any(self: Rc<Self>) -> Rc<dyn Any> {
            self
        }
    }

    #[test]
    fn test_cameras_exist_before_lower_tier_components_build() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let owner = Owner::new("camera-order");
        owner.start().unwrap();
        let control = MockCameraControl::new();
        let devices = vec![control.device("0", LensFacing::Back)];
        let seen = Arc::new(AtomicUsize::new(0));

        let seen_in = Arc::clone(&seen);
        owner
            .call(move |ctx| {
                ctx.manager().add_builder(ComponentBuilder::new(
                    CreationPriority::Launch,
                    vec![Capability::of::<CameraDeviceManager>()],
                    move |component_ctx| Rc::new(CameraDeviceManager::new(component_ctx, devices)),
                ));
                // counts the cameras visible while it is being built
                ctx.manager().add_builder(ComponentBuilder::new(
                    CreationPriority::Normal,
                    vec![Capability::of::<CameraConsumer>()],
                    move |component_ctx| {
                        if let Some(current) = OwnerContext::current() {
                            seen_in.store(
                                current.manager().find_components::<Camera>().len(),
                                Ordering::SeqCst,
                            );
                        }
                        Rc::new(CameraConsumer {
                            core: ComponentCore::new("CameraConsumer", component_ctx),
                        })
                    },
                ));
                ctx.manager().create_components(CreationPriority::Normal);
            })
            .unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        owner.shutdown();
        owner.join();
    }

    #[test]
    fn test_device_manager_spawns_camera_components() {
        let (owner, _control) = capture_rig();
        let (count, infos) = owner
            .call(|ctx| {
                let manager = ctx.manager().find_component::<CameraDeviceManager>().unwrap();
                (
                    ctx.manager().find_components::<Camera>().len(),
                    manager.available_cameras(),
                )
            })
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].id, "0");
        owner.shutdown();
        owner.join();
    }

    #[test]
    fn test_open_is_idempotent() {
        let (owner, _control) = capture_rig();
        with_camera(&owner, |camera| {
            camera.open().unwrap();
            assert_eq!(camera.state(), CameraState::Opening);
            camera.open().unwrap();
        });
        // drain the posted Opened completion
        owner.call(|_| {}).unwrap();
        let state = with_camera(&owner, |camera| {
            camera.open().unwrap();
            camera.state()
        });
        assert_eq!(state, CameraState::Opened);
        owner.shutdown();
        owner.join();
    }

    #[test]
    fn test_failed_open_returns_to_closed() {
        let (owner, control) = capture_rig();
        control.set_fail_open(true);
        let state = with_camera(&owner, |camera| {
            assert!(camera.open().is_err());
            camera.state()
        });
        assert_eq!(state, CameraState::Closed);
        owner.shutdown();
        owner.join();
    }

    #[test]
    fn test_capture_emits_shutter_picture_completed() {
        let (owner, _control) = capture_rig();
        with_camera(&owner, |camera| {
            camera.open().unwrap();
        });
        owner.call(|_| {}).unwrap();
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let log_in = Arc::clone(&log);
        with_camera(&owner, move |camera| {
            let shutters = Arc::clone(&log_in);
            let _ = camera.core.events().add_handler(&EVENT_SHUTTER, move |e| {
                shutters.lock().push(format!("shutter:{}", e.payload));
            });
            let pictures = Arc::clone(&log_in);
            let _ = camera
                .core
                .events()
                .add_handler(&EVENT_PICTURE_RECEIVED, move |e| {
                    pictures
                        .lock()
                        .push(format!("picture:{}", e.payload.frame_index));
                });
            let _hw = camera.capture(2).unwrap();
            assert_eq!(camera.capture_state(), OperationState::Starting);
        });
        owner.call(|_| {}).unwrap();
        let state = with_camera(&owner, |camera| camera.capture_state());
        assert_eq!(
            *log.lock(),
            vec!["shutter:0", "picture:0", "shutter:1", "picture:1"]
        );
        assert_eq!(state, OperationState::Stopped);
        owner.shutdown();
        owner.join();
    }
}
