use crate::capture::camera::{
    Camera, CameraDeviceManager, CameraInfo, PictureData, EVENT_CAPTURE_FAILED, EVENT_ERROR,
    EVENT_PICTURE_RECEIVED, EVENT_SHUTTER, PROP_AVAILABLE_CAMERAS, PROP_CAMERA_STATE,
    PROP_CAPTURE_STATE, PROP_PREVIEW_STATE,
};
use crate::capture::recorder::{EncoderFactory, EncoderProfile, VideoEncoder};
use crate::capture::sound::SoundPlayer;
use crate::capture::states::{
    CameraState, MediaType, OperationState, PhotoCaptureState, VideoCaptureState,
};
use crate::config::CamkitConfig;
use crate::error::{CamkitError, Result};
use crate::runtime::component::{
    downcast_component, Component, ComponentContext, ComponentCore, ComponentId,
};
use crate::runtime::event::EventKey;
use crate::runtime::handle::Handle;
use crate::runtime::owner::{Owner, OwnerContext};
use crate::runtime::property::PropertyKey;
use parking_lot::{Condvar, Mutex};
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub static PROP_CAMERA: PropertyKey<Option<CameraInfo>> = PropertyKey::read_only("Camera", None);
pub static PROP_CAMERA_PREVIEW_STATE: PropertyKey<OperationState> =
    PropertyKey::read_only("CameraPreviewState", OperationState::Stopped);
pub static PROP_MEDIA_TYPE: PropertyKey<MediaType> =
    PropertyKey::read_only("MediaType", MediaType::Photo);
pub static PROP_PHOTO_CAPTURE_STATE: PropertyKey<PhotoCaptureState> =
    PropertyKey::read_only("PhotoCaptureState", PhotoCaptureState::Preparing);
pub static PROP_VIDEO_CAPTURE_STATE: PropertyKey<VideoCaptureState> =
    PropertyKey::read_only("VideoCaptureState", VideoCaptureState::Preparing);

/// Camera driver errors, re-raised for UI proxies. No retry at this layer.
pub static EVENT_CAMERA_ERROR: EventKey<String> = EventKey::new("CameraError");
/// Raised when the default hardware photo path auto-completes (payload =
/// capture request id).
pub static EVENT_DEFAULT_PHOTO_CAPTURE_COMPLETED: EventKey<Uuid> =
    EventKey::new("DefaultPhotoCaptureCompleted");

/// Token for one capture request. Closing it cancels the capture through the
/// owning handler's stop path. Clones share identity.
#[derive(Clone)]
pub struct CaptureHandle {
    handle: Handle,
    media_type: MediaType,
    request_id: Uuid,
}

impl CaptureHandle {
    fn new(media_type: MediaType, owner: Owner, controller: ComponentId) -> Self {
        let request_id = Uuid::new_v4();
        let handle = Handle::new("Capture", move || {
            let _ = owner.post(move |ctx| {
                route_to_controller(ctx.manager(), controller, move |c| {
                    c.cancel_capture(media_type, request_id);
                });
            });
        });
        Self {
            handle,
            media_type,
            request_id,
        }
    }

    pub fn media_type(&self) -> MediaType {
        self.media_type
    }

    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    pub fn is_valid(&self) -> bool {
        self.handle.is_valid()
    }

    /// The underlying cancellation handle; clones share identity with this
    /// capture, so closing it cancels the capture too.
    pub(crate) fn cancel_handle(&self) -> Handle {
        self.handle.clone()
    }

    /// Cancel the capture.
    pub fn close(&self) {
        self.handle.close();
    }
}

impl std::fmt::Debug for CaptureHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureHandle")
            .field("media_type", &self.media_type)
            .field("request_id", &self.request_id)
            .finish()
    }
}

/// An installed photo pipeline. Handlers are tried most-recently-registered
/// first; the first to return `Ok(true)` owns the request until it calls
/// [`CaptureController::complete_capture`]. An `Err` rolls the request back.
pub trait PhotoCaptureHandler: 'static {
    fn capture(&self, camera: &Camera, capture: &CaptureHandle) -> Result<bool>;
    fn stop_capture(&self, camera: &Camera, capture: &CaptureHandle) -> bool;
}

pub trait VideoCaptureHandler: 'static {
    fn capture(&self, camera: &Camera, capture: &CaptureHandle) -> Result<bool>;
    fn stop_capture(&self, camera: &Camera, capture: &CaptureHandle) -> bool;
}

/// Receives captured picture bytes; naming and persistence live behind it.
pub trait PictureSink: Send + 'static {
    fn on_picture_taken(&self, picture: &PictureData, media_type: MediaType);
}

/// One-shot cross-thread completion cell for the synchronous preview stop.
#[derive(Clone)]
pub struct StopWaiter {
    inner: Arc<StopWaiterInner>,
}

struct StopWaiterInner {
    result: Mutex<Option<bool>>,
    cond: Condvar,
}

impl StopWaiter {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(StopWaiterInner {
                result: Mutex::new(None),
                cond: Condvar::new(),
            }),
        }
    }

    fn signal(&self, ok: bool) {
        let mut result = self.inner.result.lock();
        if result.is_none() {
            *result = Some(ok);
            self.inner.cond.notify_all();
        }
    }

    /// `None` on timeout; timeout is failure, never "stopped".
    pub fn wait(&self, timeout: Duration) -> Option<bool> {
        let deadline = Instant::now() + timeout;
        let mut result = self.inner.result.lock();
        while result.is_none() {
            if self.inner.cond.wait_until(&mut result, deadline).timed_out() {
                return *result;
            }
        }
        *result
    }
}

impl Default for StopWaiter {
    fn default() -> Self {
        Self::new()
    }
}

struct StopRequest {
    waiter: Option<StopWaiter>,
}

struct HandlerEntry<H: ?Sized> {
    registration: Handle,
    active: Arc<AtomicBool>,
    handler: Rc<H>,
}

struct PhotoSession {
    capture: CaptureHandle,
    /// Registration handle of the claiming handler; `None` = default path.
    handler: Option<Handle>,
    hw: Option<Handle>,
    /// Multi-frame default capture; the shutter sound loops until the
    /// session ends.
    burst: bool,
    shutter_stream: Option<Handle>,
    subscriptions: Vec<Handle>,
}

struct VideoSession {
    capture: CaptureHandle,
    handler: Option<Handle>,
    encoder: Option<Box<dyn VideoEncoder>>,
    output: PathBuf,
}

/// The capture orchestration state machine, living on the capture owner.
/// All methods are owner-thread internal; [`CaptureService`] is the `Send`
/// facade other threads go through.
pub struct CaptureController {
    core: ComponentCore,
    config: CamkitConfig,
    encoder_factory: EncoderFactory,
    sink: Option<Box<dyn PictureSink>>,
    camera: RefCell<Option<Rc<Camera>>>,
    sound: RefCell<Option<Rc<SoundPlayer>>>,
    shutter_sound: RefCell<Option<Handle>>,
    camera_subs: RefCell<Vec<Handle>>,
    pending_preview_start: Cell<bool>,
    photo_handlers: RefCell<Vec<HandlerEntry<dyn PhotoCaptureHandler>>>,
    video_handlers: RefCell<Vec<HandlerEntry<dyn VideoCaptureHandler>>>,
    photo_session: RefCell<Option<PhotoSession>>,
    video_session: RefCell<Option<VideoSession>>,
    // stop requests that arrived while the preview was still Starting
    pending_stops: RefCell<Vec<StopRequest>>,
    // waiters for an in-flight stop
    stop_waiters: RefCell<Vec<StopWaiter>>,
    deferred_encoder: RefCell<Option<Box<dyn VideoEncoder>>>,
}

fn route_to_controller(
    manager: &crate::runtime::manager::ComponentManager,
    id: ComponentId,
    f: impl FnOnce(&CaptureController),
) {
    if let Some(controller) = manager
        .component_by_id(id)
        .and_then(|c| downcast_component::<CaptureController>(&c))
    {
        f(&controller);
    }
}

/// Run `f` against the controller `id` on the current owner context.
/// Used by subscriptions, which cannot capture the controller directly.
fn on_self(id: ComponentId, f: impl FnOnce(&CaptureController)) {
    if let Some(ctx) = OwnerContext::current() {
        route_to_controller(ctx.manager(), id, f);
    }
}

impl CaptureController {
    pub fn new(
        ctx: &ComponentContext,
        config: CamkitConfig,
        encoder_factory: EncoderFactory,
        sink: Option<Box<dyn PictureSink>>,
    ) -> Self {
        Self {
            core: ComponentCore::new("CaptureController", ctx),
            config,
            encoder_factory,
            sink,
            camera: RefCell::new(None),
            sound: RefCell::new(None),
            shutter_sound: RefCell::new(None),
            camera_subs: RefCell::new(Vec::new()),
            pending_preview_start: Cell::new(false),
            photo_handlers: RefCell::new(Vec::new()),
            video_handlers: RefCell::new(Vec::new()),
            photo_session: RefCell::new(None),
            video_session: RefCell::new(None),
            pending_stops: RefCell::new(Vec::new()),
            stop_waiters: RefCell::new(Vec::new()),
            deferred_encoder: RefCell::new(None),
        }
    }

    /// `Send` facade for other threads.
    pub fn service(&self) -> CaptureService {
        CaptureService {
            owner: self.core.owner().clone(),
            controller: self.core.id(),
            stop_timeout: Duration::from_millis(self.config.system.preview_stop_timeout_ms),
        }
    }

    fn camera(&self) -> Option<Rc<Camera>> {
        self.camera.borrow().clone()
    }

    pub fn media_type(&self) -> MediaType {
        self.core.properties().get(&PROP_MEDIA_TYPE)
    }

    pub fn photo_state(&self) -> PhotoCaptureState {
        self.core.properties().get(&PROP_PHOTO_CAPTURE_STATE)
    }

    pub fn video_state(&self) -> VideoCaptureState {
        self.core.properties().get(&PROP_VIDEO_CAPTURE_STATE)
    }

    pub fn preview_state(&self) -> OperationState {
        self.core.properties().get(&PROP_CAMERA_PREVIEW_STATE)
    }

    fn set_photo_state(&self, state: PhotoCaptureState) {
        let _ = self
            .core
            .properties()
            .set_read_only(&PROP_PHOTO_CAPTURE_STATE, state);
    }

    fn set_video_state(&self, state: VideoCaptureState) {
        let _ = self
            .core
            .properties()
            .set_read_only(&PROP_VIDEO_CAPTURE_STATE, state);
    }

    fn attach_camera(&self, camera: Rc<Camera>) {
        let id = self.core.id();
        let mut subs = self.camera_subs.borrow_mut();
        subs.push(camera.core().properties().add_callback(
            &PROP_PREVIEW_STATE,
            move |change| {
                on_self(id, |c| c.on_camera_preview_state_changed(*change.old, *change.new));
            },
        ));
        subs.push(camera.core().properties().add_callback(
            &PROP_CAMERA_STATE,
            move |change| {
                on_self(id, |c| c.on_camera_state_changed(*change.new));
            },
        ));
        subs.push(camera.core().events().add_handler(&EVENT_ERROR, move |event| {
            let message = event.payload.clone();
            on_self(id, |c| {
                c.core.events().raise(&EVENT_CAMERA_ERROR, message);
            });
        }));
        drop(subs);
        *self.camera.borrow_mut() = Some(camera);
    }

    fn ensure_camera(&self) -> Result<Rc<Camera>> {
        if let Some(camera) = self.camera() {
            return Ok(camera);
        }
        let ctx = OwnerContext::current().ok_or_else(|| CamkitError::CrossContext {
            owner: self.core.owner().name().to_string(),
        })?;
        let camera = ctx
            .manager()
            .find_component::<Camera>()
            .ok_or_else(|| CamkitError::camera("no camera available"))?;
        self.attach_camera(Rc::clone(&camera));
        Ok(camera)
    }

    /// Idempotent: an already opening/opened camera short-circuits to success.
    pub fn open_camera(&self) -> Result<()> {
        self.core.verify_access();
        let camera = self.ensure_camera()?;
        camera.open()?;
        let _ = self
            .core
            .properties()
            .set_read_only(&PROP_CAMERA, Some(camera.info().clone()));
        Ok(())
    }

    /// Open (if needed) and start the preview. If the camera is still mid
    /// open, the preview start is latched and fires on the opened transition.
    pub fn start_preview(&self) -> Result<()> {
        self.core.verify_access();
        self.open_camera()?;
        let camera = self.ensure_camera()?;
        match camera.state() {
            CameraState::Opened => camera.start_preview(),
            CameraState::Opening => {
                debug!("Camera still opening, preview start deferred");
                self.pending_preview_start.set(true);
                Ok(())
            }
            state => Err(CamkitError::invalid_state("start_preview", state)),
        }
    }

    /// Stop the preview, stopping any in-flight video capture first. A stop
    /// requested while the preview is still `Starting` is queued and
    /// re-entered once `Started` is reached. The optional waiter is signalled
    /// with the outcome; errors signal failure, never success.
    pub fn stop_preview(&self, waiter: Option<StopWaiter>) {
        self.core.verify_access();
        if self.video_session.borrow().is_some() {
            self.stop_video_session();
        }

        let camera = match self.camera() {
            Some(camera) => camera,
            None => {
                // nothing to stop
                if let Some(waiter) = waiter {
                    waiter.signal(true);
                }
                return;
            }
        };

        match camera.preview_state() {
            OperationState::Stopped => {
                if let Some(waiter) = waiter {
                    waiter.signal(true);
                }
            }
            OperationState::Starting => {
                debug!("Preview still starting, stop request queued");
                self.pending_stops.borrow_mut().push(StopRequest { waiter });
            }
            OperationState::Started | OperationState::Stopping => {
                camera.stop_preview();
                if let Some(waiter) = waiter {
                    if camera.preview_state() == OperationState::Stopped {
                        waiter.signal(true);
                    } else {
                        self.stop_waiters.borrow_mut().push(waiter);
                    }
                }
            }
        }
    }

    /// Stop requests currently queued behind a still-starting preview.
    pub fn pending_stop_count(&self) -> usize {
        self.pending_stops.borrow().len()
    }

    /// Switch between photo and video. Rejected while the other media's
    /// capture is past `Ready`; stops and restarts the preview around the
    /// switch.
    pub fn set_media_type(&self, media_type: MediaType) -> Result<()> {
        self.core.verify_access();
        if media_type == self.media_type() {
            return Ok(());
        }
        match media_type {
            MediaType::Video => {
                let state = self.photo_state();
                if !matches!(state, PhotoCaptureState::Preparing | PhotoCaptureState::Ready) {
                    return Err(CamkitError::invalid_state("set_media_type", state));
                }
            }
            MediaType::Photo => {
                let state = self.video_state();
                if !matches!(state, VideoCaptureState::Preparing | VideoCaptureState::Ready) {
                    return Err(CamkitError::invalid_state("set_media_type", state));
                }
            }
        }

        info!("Switching media type to {}", media_type);
        let preview_active = matches!(
            self.camera().map(|c| c.preview_state()),
            Some(OperationState::Starting | OperationState::Started)
        );
        self.stop_preview(None);
        let _ = self
            .core
            .properties()
            .set_read_only(&PROP_MEDIA_TYPE, media_type);
        self.set_photo_state(PhotoCaptureState::Preparing);
        self.set_video_state(VideoCaptureState::Preparing);
        if preview_active {
            self.start_preview()?;
        }
        Ok(())
    }

    pub fn set_photo_capture_handler(&self, handler: Rc<dyn PhotoCaptureHandler>) -> Handle {
        self.core.verify_access();
        let active = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&active);
        let registration = Handle::new("PhotoCaptureHandler", move || {
            flag.store(false, Ordering::Release);
        });
        self.photo_handlers.borrow_mut().push(HandlerEntry {
            registration: registration.clone(),
            active,
            handler,
        });
        registration
    }

    pub fn set_video_capture_handler(&self, handler: Rc<dyn VideoCaptureHandler>) -> Handle {
        self.core.verify_access();
        let active = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&active);
        let registration = Handle::new("VideoCaptureHandler", move || {
            flag.store(false, Ordering::Release);
        });
        self.video_handlers.borrow_mut().push(HandlerEntry {
            registration: registration.clone(),
            active,
            handler,
        });
        registration
    }

    pub fn capture_photo(&self, frame_count: u32) -> Result<CaptureHandle> {
        let capture =
            CaptureHandle::new(MediaType::Photo, self.core.owner().clone(), self.core.id());
        self.start_photo_capture(capture.clone(), frame_count)?;
        Ok(capture)
    }

    /// Photo capture entry point. Only legal from `Ready`; a rejection leaves
    /// every state untouched.
    pub(crate) fn start_photo_capture(
        &self,
        capture: CaptureHandle,
        frame_count: u32,
    ) -> Result<()> {
        self.core.verify_access();
        let state = self.photo_state();
        if state != PhotoCaptureState::Ready {
            warn!("Photo capture rejected in state {:?}", state);
            return Err(CamkitError::invalid_state("capture_photo", state));
        }
        let camera = self.ensure_camera()?;
        info!(
            "Capturing photo ({} frame(s), request {})",
            frame_count,
            capture.request_id()
        );
        self.set_photo_state(PhotoCaptureState::Starting);

        // most recently registered handler first; the first claimant owns
        // completion
        let handlers: Vec<_> = {
            let mut list = self.photo_handlers.borrow_mut();
            list.retain(|entry| entry.active.load(Ordering::Acquire));
            list.iter()
                .rev()
                .map(|entry| (entry.registration.clone(), Rc::clone(&entry.handler)))
                .collect()
        };
        for (registration, handler) in handlers {
            match handler.capture(&camera, &capture) {
                Ok(true) => {
                    *self.photo_session.borrow_mut() = Some(PhotoSession {
                        capture,
                        handler: Some(registration),
                        hw: None,
                        burst: false,
                        shutter_stream: None,
                        subscriptions: Vec::new(),
                    });
                    self.set_photo_state(PhotoCaptureState::Capturing);
                    return Ok(());
                }
                Ok(false) => continue,
                Err(e) => {
                    error!("Photo capture handler failed: {}", e);
                    self.restore_photo_idle();
                    return Err(e);
                }
            }
        }

        self.default_photo_capture(camera, capture, frame_count)
    }

    /// Hardware path used when no handler claims the request: drive the
    /// camera directly and auto-complete when its capture session stops.
    fn default_photo_capture(
        &self,
        camera: Rc<Camera>,
        capture: CaptureHandle,
        frame_count: u32,
    ) -> Result<()> {
        let id = self.core.id();
        let request = capture.request_id();
        let mut subscriptions = Vec::new();

        subscriptions.push(camera.core().events().add_handler(&EVENT_SHUTTER, move |event| {
            let frame_index = event.payload;
            on_self(id, |c| c.on_default_shutter(frame_index));
        }));
        subscriptions.push(camera.core().events().add_handler(
            &EVENT_PICTURE_RECEIVED,
            move |event| {
                let picture = event.payload.clone();
                on_self(id, |c| c.on_default_picture(&picture));
            },
        ));
        subscriptions.push(camera.core().events().add_handler(
            &EVENT_CAPTURE_FAILED,
            move |event| {
                let message = event.payload.clone();
                on_self(id, |c| c.on_default_capture_failed(&message));
            },
        ));
        subscriptions.push(camera.core().properties().add_callback(
            &PROP_CAPTURE_STATE,
            move |change| {
                if *change.new == OperationState::Stopped {
                    on_self(id, |c| c.on_default_capture_stopped(request));
                }
            },
        ));

        match camera.capture(frame_count) {
            Ok(hw) => {
                *self.photo_session.borrow_mut() = Some(PhotoSession {
                    capture,
                    handler: None,
                    hw: Some(hw),
                    burst: frame_count != 1,
                    shutter_stream: None,
                    subscriptions,
                });
                self.set_photo_state(PhotoCaptureState::Capturing);
                Ok(())
            }
            Err(e) => {
                error!("Default photo capture failed to start: {}", e);
                for sub in subscriptions {
                    sub.close();
                }
                self.restore_photo_idle();
                Err(e)
            }
        }
    }

    fn on_default_shutter(&self, frame_index: u32) {
        if frame_index != 0 || !self.config.capture.shutter_sound {
            return;
        }
        let looped = self
            .photo_session
            .borrow()
            .as_ref()
            .map(|s| s.burst)
            .unwrap_or(false);
        let stream = {
            let player = self.sound.borrow().clone();
            let sound = self.shutter_sound.borrow();
            match (player, sound.as_ref()) {
                (Some(player), Some(sound)) => player.play_sound(sound, looped).ok(),
                _ => None,
            }
        };
        if let Some(stream) = stream {
            if let Some(session) = self.photo_session.borrow_mut().as_mut() {
                session.shutter_stream = Some(stream);
            } else {
                stream.close();
            }
        }
    }

    fn on_default_picture(&self, picture: &PictureData) {
        if let Some(sink) = &self.sink {
            sink.on_picture_taken(picture, MediaType::Photo);
        }
    }

    fn on_default_capture_failed(&self, message: &str) {
        let is_default = self
            .photo_session
            .borrow()
            .as_ref()
            .map(|s| s.handler.is_none())
            .unwrap_or(false);
        if !is_default {
            return;
        }
        warn!("Default photo capture failed: {}", message);
        self.finish_photo_session();
    }

    fn on_default_capture_stopped(&self, request: Uuid) {
        let is_current_default = self
            .photo_session
            .borrow()
            .as_ref()
            .map(|s| s.handler.is_none() && s.capture.request_id() == request)
            .unwrap_or(false);
        if !is_current_default {
            return;
        }
        debug!("Default photo capture {} completed", request);
        self.core
            .events()
            .raise(&EVENT_DEFAULT_PHOTO_CAPTURE_COMPLETED, request);
        self.finish_photo_session();
    }

    /// Single completion point for claiming handlers. Both handles must
    /// match the in-flight pair; a stale or duplicate completion is rejected
    /// without touching any state.
    pub fn complete_capture(&self, handler: &Handle, capture: &CaptureHandle) -> bool {
        self.core.verify_access();
        {
            let session = self.photo_session.borrow();
            let session = match session.as_ref() {
                Some(session) => session,
                None => {
                    warn!("complete_capture with no capture in flight");
                    return false;
                }
            };
            if session.capture.request_id() != capture.request_id() {
                warn!("complete_capture for a stale capture, rejected");
                return false;
            }
            match &session.handler {
                Some(registration) if registration.is_same(handler) => {}
                _ => {
                    warn!("complete_capture from a non-owning handler, rejected");
                    return false;
                }
            }
        }
        self.finish_photo_session();
        true
    }

    fn finish_photo_session(&self) {
        let session = self.photo_session.borrow_mut().take();
        if let Some(session) = session {
            for sub in session.subscriptions {
                sub.close();
            }
            if let Some(stream) = session.shutter_stream {
                stream.close();
            }
            if let Some(hw) = session.hw {
                hw.close();
            }
        }
        self.restore_photo_idle();
    }

    fn restore_photo_idle(&self) {
        let ready = self
            .camera()
            .map(|c| c.preview_state() == OperationState::Started)
            .unwrap_or(false);
        self.set_photo_state(if ready {
            PhotoCaptureState::Ready
        } else {
            PhotoCaptureState::Preparing
        });
    }

    pub fn capture_video(&self) -> Result<CaptureHandle> {
        let capture =
            CaptureHandle::new(MediaType::Video, self.core.owner().clone(), self.core.id());
        self.start_video_capture(capture.clone())?;
        Ok(capture)
    }

    /// Video capture entry point. Only legal from `Ready`; any failure along
    /// the prepare/connect/start sequence releases the encoder and leaves no
    /// partial recording.
    pub(crate) fn start_video_capture(&self, capture: CaptureHandle) -> Result<()> {
        self.core.verify_access();
        let state = self.video_state();
        if state != VideoCaptureState::Ready {
            warn!("Video capture rejected in state {:?}", state);
            return Err(CamkitError::invalid_state("capture_video", state));
        }
        let camera = self.ensure_camera()?;
        info!("Starting video capture (request {})", capture.request_id());
        self.set_video_state(VideoCaptureState::Starting);

        let handlers: Vec<_> = {
            let mut list = self.video_handlers.borrow_mut();
            list.retain(|entry| entry.active.load(Ordering::Acquire));
            list.iter()
                .rev()
                .map(|entry| (entry.registration.clone(), Rc::clone(&entry.handler)))
                .collect()
        };
        for (registration, handler) in handlers {
            match handler.capture(&camera, &capture) {
                Ok(true) => {
                    *self.video_session.borrow_mut() = Some(VideoSession {
                        capture,
                        handler: Some(registration),
                        encoder: None,
                        output: PathBuf::new(),
                    });
                    self.set_video_state(VideoCaptureState::Capturing);
                    return Ok(());
                }
                Ok(false) => continue,
                Err(e) => {
                    error!("Video capture handler failed: {}", e);
                    self.restore_video_idle();
                    return Err(e);
                }
            }
        }

        let profile = match EncoderProfile::resolve(&self.config.video) {
            Ok(profile) => profile,
            Err(e) => {
                self.restore_video_idle();
                return Err(e);
            }
        };
        let output = video_output_path(&self.config.capture.path);
        let encoder = (self.encoder_factory)();

        if let Err(e) = encoder.prepare(&profile, &output) {
            error!("Encoder prepare failed: {}", e);
            encoder.release();
            self.restore_video_idle();
            return Err(e);
        }
        if let Err(e) = camera.attach_recorder() {
            error!("Failed to connect camera to recorder: {}", e);
            encoder.release();
            self.restore_video_idle();
            return Err(e);
        }
        if let Err(e) = encoder.start() {
            error!("Encoder start failed: {}", e);
            camera.detach_recorder();
            encoder.release();
            self.restore_video_idle();
            return Err(e);
        }

        info!("Recording to {}", output.display());
        *self.video_session.borrow_mut() = Some(VideoSession {
            capture,
            handler: None,
            encoder: Some(encoder),
            output,
        });
        self.set_video_state(VideoCaptureState::Capturing);
        Ok(())
    }

    pub fn pause_video(&self) -> Result<()> {
        self.core.verify_access();
        if self.video_state() != VideoCaptureState::Capturing {
            return Err(CamkitError::invalid_state("pause_video", self.video_state()));
        }
        let session = self.video_session.borrow();
        let encoder = session
            .as_ref()
            .and_then(|s| s.encoder.as_ref())
            .ok_or_else(|| CamkitError::invalid_state("pause_video", "handler session"))?;
        encoder.pause();
        drop(session);
        self.set_video_state(VideoCaptureState::Paused);
        Ok(())
    }

    pub fn resume_video(&self) -> Result<()> {
        self.core.verify_access();
        if self.video_state() != VideoCaptureState::Paused {
            return Err(CamkitError::invalid_state(
                "resume_video",
                self.video_state(),
            ));
        }
        let session = self.video_session.borrow();
        let encoder = session
            .as_ref()
            .and_then(|s| s.encoder.as_ref())
            .ok_or_else(|| CamkitError::invalid_state("resume_video", "handler session"))?;
        encoder.resume();
        drop(session);
        self.set_video_state(VideoCaptureState::Capturing);
        Ok(())
    }

    /// Stop the in-flight recording. The encoder is released immediately
    /// unless the preview is itself mid-stop, in which case the release is
    /// deferred to the preview `Stopped` transition.
    fn stop_video_session(&self) {
        let session = match self.video_session.borrow_mut().take() {
            Some(session) => session,
            None => return,
        };
        self.set_video_state(VideoCaptureState::Stopping);
        let camera = self.camera();

        if let Some(registration) = &session.handler {
            if let (Some(camera), Some(handler)) =
                (camera.as_ref(), self.video_handler_for(registration))
            {
                handler.stop_capture(camera, &session.capture);
            }
        } else if let Some(encoder) = session.encoder {
            if let Some(camera) = camera.as_ref() {
                camera.detach_recorder();
            }
            if let Err(e) = encoder.stop() {
                warn!("Encoder stop failed: {}", e);
            }
            let preview_stopping = camera
                .map(|c| c.preview_state() == OperationState::Stopping)
                .unwrap_or(false);
            if preview_stopping {
                debug!("Preview mid-stop, deferring encoder release");
                *self.deferred_encoder.borrow_mut() = Some(encoder);
            } else {
                encoder.release();
            }
            info!("Recording finished: {}", session.output.display());
        }
        self.restore_video_idle();
    }

    fn video_handler_for(&self, registration: &Handle) -> Option<Rc<dyn VideoCaptureHandler>> {
        self.video_handlers
            .borrow()
            .iter()
            .find(|entry| entry.registration.is_same(registration))
            .map(|entry| Rc::clone(&entry.handler))
    }

    fn photo_handler_for(&self, registration: &Handle) -> Option<Rc<dyn PhotoCaptureHandler>> {
        self.photo_handlers
            .borrow()
            .iter()
            .find(|entry| entry.registration.is_same(registration))
            .map(|entry| Rc::clone(&entry.handler))
    }

    fn restore_video_idle(&self) {
        let ready = self.media_type() == MediaType::Video
            && self
                .camera()
                .map(|c| c.preview_state() == OperationState::Started)
                .unwrap_or(false);
        self.set_video_state(if ready {
            VideoCaptureState::Ready
        } else {
            VideoCaptureState::Preparing
        });
    }

    /// Routed here by a closed [`CaptureHandle`].
    fn cancel_capture(&self, media_type: MediaType, request: Uuid) {
        match media_type {
            MediaType::Photo => self.cancel_photo_capture(request),
            MediaType::Video => {
                let matches = self
                    .video_session
                    .borrow()
                    .as_ref()
                    .map(|s| s.capture.request_id() == request)
                    .unwrap_or(false);
                if matches {
                    self.stop_video_session();
                }
            }
        }
    }

    fn cancel_photo_capture(&self, request: Uuid) {
        let (handler, capture) = {
            let session = self.photo_session.borrow();
            match session.as_ref() {
                Some(s) if s.capture.request_id() == request => {
                    (s.handler.clone(), s.capture.clone())
                }
                _ => return,
            }
        };
        info!("Stopping photo capture {}", request);
        self.set_photo_state(PhotoCaptureState::Stopping);

        match handler {
            Some(registration) => {
                // the owning handler finishes through complete_capture
                if let (Some(camera), Some(handler)) =
                    (self.camera(), self.photo_handler_for(&registration))
                {
                    handler.stop_capture(&camera, &capture);
                }
            }
            None => {
                let (hw, stream) = {
                    let mut session = self.photo_session.borrow_mut();
                    match session.as_mut() {
                        Some(s) => (s.hw.take(), s.shutter_stream.take()),
                        None => (None, None),
                    }
                };
                // stopping the hardware drives the capture state to Stopped,
                // which auto-completes the session
                if let Some(hw) = hw {
                    hw.close();
                }
                if let Some(stream) = stream {
                    stream.close();
                }
            }
        }
    }

    fn on_camera_preview_state_changed(&self, old: OperationState, new: OperationState) {
        let _ = self
            .core
            .properties()
            .set_read_only(&PROP_CAMERA_PREVIEW_STATE, new);
        match new {
            OperationState::Started => {
                if self.photo_state() == PhotoCaptureState::Preparing {
                    self.set_photo_state(PhotoCaptureState::Ready);
                }
                if self.media_type() == MediaType::Video
                    && self.video_state() == VideoCaptureState::Preparing
                {
                    self.set_video_state(VideoCaptureState::Ready);
                }
                let pending: Vec<_> = self.pending_stops.borrow_mut().drain(..).collect();
                if !pending.is_empty() {
                    debug!("Preview started, re-entering {} queued stop(s)", pending.len());
                    for request in pending {
                        self.stop_preview(request.waiter);
                    }
                }
            }
            OperationState::Stopped => {
                if self.photo_state() == PhotoCaptureState::Ready {
                    self.set_photo_state(PhotoCaptureState::Preparing);
                }
                if self.video_state() == VideoCaptureState::Ready {
                    self.set_video_state(VideoCaptureState::Preparing);
                }
                for waiter in self.stop_waiters.borrow_mut().drain(..) {
                    waiter.signal(true);
                }
                if let Some(encoder) = self.deferred_encoder.borrow_mut().take() {
                    debug!("Releasing deferred encoder");
                    encoder.release();
                }
            }
            OperationState::Starting | OperationState::Stopping => {
                if old == OperationState::Started {
                    if self.photo_state() == PhotoCaptureState::Ready {
                        self.set_photo_state(PhotoCaptureState::Preparing);
                    }
                    if self.video_state() == VideoCaptureState::Ready {
                        self.set_video_state(VideoCaptureState::Preparing);
                    }
                }
            }
        }
    }

    fn on_camera_state_changed(&self, new: CameraState) {
        match new {
            CameraState::Opened => {
                if self.pending_preview_start.replace(false) {
                    if let Some(camera) = self.camera() {
                        if let Err(e) = camera.start_preview() {
                            error!("Deferred preview start failed: {}", e);
                        }
                    }
                }
            }
            CameraState::Closed | CameraState::Unavailable => {
                self.pending_preview_start.set(false);
                let _ = self.core.properties().set_read_only(&PROP_CAMERA, None);
            }
            CameraState::Opening | CameraState::Closing => {}
        }
    }
}

impl Component for CaptureController {
    fn core(&self) -> &ComponentCore {
        &self.core
    }

    fn on_initialize(&self) -> Result<()> {
        let ctx = OwnerContext::current().ok_or_else(|| CamkitError::CrossContext {
            owner: self.core.owner().name().to_string(),
        })?;

        if self.config.capture.shutter_sound {
            match ctx.manager().find_component::<SoundPlayer>() {
                Some(player) => {
                    match player.load_sound("shutter") {
                        Ok(handle) => *self.shutter_sound.borrow_mut() = Some(handle),
                        Err(e) => warn!("Failed to load shutter sound: {}", e),
                    }
                    *self.sound.borrow_mut() = Some(player);
                }
                None => warn!("Shutter sound enabled but no sound player present"),
            }
        }

        if let Some(device_manager) = ctx.manager().find_component::<CameraDeviceManager>() {
            self.core
                .properties()
                .set_read_only(&PROP_AVAILABLE_CAMERAS, device_manager.available_cameras())?;
            let id = self.core.id();
            self.camera_subs.borrow_mut().push(
                device_manager.core().properties().add_callback(
                    &PROP_AVAILABLE_CAMERAS,
                    move |change| {
                        let cameras = change.new.clone();
                        on_self(id, |c| {
                            let _ = c
                                .core
                                .properties()
                                .set_read_only(&PROP_AVAILABLE_CAMERAS, cameras);
                        });
                    },
                ),
            );
        }

        if let Some(camera) = ctx.manager().find_component::<Camera>() {
            self.attach_camera(camera);
        }
        Ok(())
    }

    fn on_release(&self) {
        // fail anyone blocked on a synchronous stop
        for request in self.pending_stops.borrow_mut().drain(..) {
            if let Some(waiter) = request.waiter {
                waiter.signal(false);
            }
        }
        for waiter in self.stop_waiters.borrow_mut().drain(..) {
            waiter.signal(false);
        }
        self.stop_video_session();
        self.finish_photo_session();
        if let Some(encoder) = self.deferred_encoder.borrow_mut().take() {
            encoder.release();
        }
        for sub in self.camera_subs.borrow_mut().drain(..) {
            sub.close();
        }
        Handle::close_opt(&mut self.shutter_sound.borrow_mut());
    }

    fn as_any(self: Rc<Self>) -> Rc<dyn Any> {
        self
    }
}

fn video_output_path(base: &str) -> PathBuf {
    let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
    PathBuf::from(base).join(format!("VID_{stamp}.mp4"))
}

/// `Send + Clone` facade over the capture owner. Every method posts onto the
/// controller's context and returns immediately, except
/// [`stop_preview_and_wait`](Self::stop_preview_and_wait) which blocks the
/// calling (non-owner) thread until the preview stopped or the configured
/// timeout elapsed.
#[derive(Clone)]
pub struct CaptureService {
    owner: Owner,
    controller: ComponentId,
    stop_timeout: Duration,
}

impl CaptureService {
    fn post(&self, f: impl FnOnce(&CaptureController) + Send + 'static) -> Result<()> {
        let id = self.controller;
        self.owner
            .post(move |ctx| route_to_controller(ctx.manager(), id, f))
    }

    pub fn open_camera(&self) -> Result<()> {
        self.post(|c| {
            if let Err(e) = c.open_camera() {
                error!("open_camera failed: {}", e);
            }
        })
    }

    pub fn start_preview(&self) -> Result<()> {
        self.post(|c| {
            if let Err(e) = c.start_preview() {
                error!("start_preview failed: {}", e);
            }
        })
    }

    /// Asynchronous stop.
    pub fn stop_preview(&self) -> Result<()> {
        self.post(|c| c.stop_preview(None))
    }

    /// Synchronous stop. A timeout is a failure; the preview may still stop
    /// later, but the caller must not assume it did. Rejected from any owner
    /// loop: blocking one would stall every component living on it.
    pub fn stop_preview_and_wait(&self) -> Result<()> {
        if let Some(current) = OwnerContext::current() {
            return Err(CamkitError::CrossContext {
                owner: current.owner().name().to_string(),
            });
        }
        let waiter = StopWaiter::new();
        let posted = waiter.clone();
        self.post(move |c| c.stop_preview(Some(posted)))?;
        match waiter.wait(self.stop_timeout) {
            Some(true) => Ok(()),
            Some(false) => Err(CamkitError::camera("preview stop failed")),
            None => Err(CamkitError::camera("preview stop timed out")),
        }
    }

    pub fn set_media_type(&self, media_type: MediaType) -> Result<()> {
        self.post(move |c| {
            if let Err(e) = c.set_media_type(media_type) {
                error!("set_media_type failed: {}", e);
            }
        })
    }

    /// The returned handle is live immediately; if the capture is rejected on
    /// the owner the handle simply never corresponds to a session.
    pub fn capture_photo(&self, frame_count: u32) -> Result<CaptureHandle> {
        let capture = CaptureHandle::new(MediaType::Photo, self.owner.clone(), self.controller);
        let queued = capture.clone();
        self.post(move |c| {
            if let Err(e) = c.start_photo_capture(queued, frame_count) {
                error!("capture_photo failed: {}", e);
            }
        })?;
        Ok(capture)
    }

    pub fn capture_video(&self) -> Result<CaptureHandle> {
        let capture = CaptureHandle::new(MediaType::Video, self.owner.clone(), self.controller);
        let queued = capture.clone();
        self.post(move |c| {
            if let Err(e) = c.start_video_capture(queued) {
                error!("capture_video failed: {}", e);
            }
        })?;
        Ok(capture)
    }

    pub fn pause_video(&self) -> Result<()> {
        self.post(|c| {
            if let Err(e) = c.pause_video() {
                error!("pause_video failed: {}", e);
            }
        })
    }

    pub fn resume_video(&self) -> Result<()> {
        self.post(|c| {
            if let Err(e) = c.resume_video() {
                error!("resume_video failed: {}", e);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::camera::{LensFacing, MockCameraControl};
    use crate::capture::recorder::MockEncoderControl;
    use crate::capture::sound::MockSoundBackend;
    use crate::runtime::component::Capability;
    use crate::runtime::manager::{ComponentBuilder, CreationPriority};

    struct CollectingSink {
        frames: Arc<Mutex<Vec<u32>>>,
    }

    impl PictureSink for CollectingSink {
        fn on_picture_taken(&self, picture: &PictureData, _media_type: MediaType) {
            self.frames.lock().push(picture.frame_index);
        }
    }

    struct Rig {
        owner: Owner,
        camera: MockCameraControl,
        sound: MockSoundBackend,
        encoder: MockEncoderControl,
        frames: Arc<Mutex<Vec<u32>>>,
    }

    impl Rig {
        fn new(tag: &str) -> Self {
            Self::with_config(tag, CamkitConfig::default())
        }

        fn with_config(tag: &str, config: CamkitConfig) -> Self {
            let owner = Owner::new(format!("capture-{tag}"));
            owner.start().unwrap();
            let camera = MockCameraControl::new();
            let sound = MockSoundBackend::new();
            let encoder = MockEncoderControl::new();
            let frames = Arc::new(Mutex::new(Vec::new()));

            let devices = vec![camera.device("0", LensFacing::Back)];
            let sound_backend = sound.clone();
            let encoder_factory = encoder.factory();
            let sink = CollectingSink {
                frames: Arc::clone(&frames),
            };
            owner
                .call(move |ctx| {
                    ctx.manager().add_builders(vec![
                        ComponentBuilder::new(
                            CreationPriority::Launch,
                            vec![Capability::of::<CameraDeviceManager>()],
                            move |c| Rc::new(CameraDeviceManager::new(c, devices)),
                        ),
                        ComponentBuilder::new(
                            CreationPriority::High,
                            vec![Capability::of::<SoundPlayer>()],
                            move |c| Rc::new(SoundPlayer::new(c, Box::new(sound_backend))),
                        ),
                        ComponentBuilder::new(
                            CreationPriority::Normal,
                            vec![Capability::of::<CaptureController>()],
                            move |c| {
                                Rc::new(CaptureController::new(
                                    c,
                                    config,
                                    encoder_factory,
                                    Some(Box::new(sink)),
                                ))
                            },
                        ),
                    ]);
                    ctx.manager().create_components(CreationPriority::Normal);
                })
                .unwrap();
            Rig {
                owner,
                camera,
                sound,
                encoder,
                frames,
            }
        }

        fn with_controller<R: Send + 'static>(
            &self,
            f: impl FnOnce(&CaptureController) -> R + Send + 'static,
        ) -> R {
            self.owner
                .call(move |ctx| {
                    let controller = ctx.manager().find_component::<CaptureController>().unwrap();
                    f(&controller)
                })
                .unwrap()
        }

        fn settle(&self) {
            self.owner.call(|_| {}).unwrap();
        }

        /// Open, start the preview and drive it to `Started`.
        fn start_preview_ready(&self) {
            self.with_controller(|c| c.start_preview().unwrap());
            self.settle(); // opened completion, deferred preview start
            self.settle(); // preview started completion
            assert_eq!(
                self.with_controller(|c| c.preview_state()),
                OperationState::Started
            );
        }

        fn teardown(self) {
            self.owner.shutdown();
            self.owner.join();
        }
    }

    struct ClaimingHandler;

    impl PhotoCaptureHandler for ClaimingHandler {
        fn capture(&self, _camera: &Camera, _capture: &CaptureHandle) -> Result<bool> {
            Ok(true)
        }

        fn stop_capture(&self, _camera: &Camera, _capture: &CaptureHandle) -> bool {
            true
        }
    }

    struct FailingHandler;

    impl PhotoCaptureHandler for FailingHandler {
        fn capture(&self, _camera: &Camera, _capture: &CaptureHandle) -> Result<bool> {
            Err(CamkitError::camera("induced handler failure"))
        }

        fn stop_capture(&self, _camera: &Camera, _capture: &CaptureHandle) -> bool {
            false
        }
    }

    #[test]
    fn test_capture_rejected_outside_ready_without_transition() {
        let rig = Rig::new("reject");
        let (rejected, state) = rig.with_controller(|c| {
            let rejected = matches!(
                c.capture_photo(1),
                Err(CamkitError::InvalidState { .. })
            );
            (rejected, c.photo_state())
        });
        assert!(rejected);
        assert_eq!(state, PhotoCaptureState::Preparing);
        assert_eq!(rig.camera.capture_calls(), 0);
        rig.teardown();
    }

    #[test]
    fn test_full_default_photo_capture_scenario() {
        let rig = Rig::new("full");
        rig.start_preview_ready();

        let completed = Arc::new(Mutex::new(Vec::new()));
        let completed_in = Arc::clone(&completed);
        let request = rig.with_controller(move |c| {
            let _ = c
                .core
                .events()
                .add_handler(&EVENT_DEFAULT_PHOTO_CAPTURE_COMPLETED, move |event| {
                    completed_in.lock().push(event.payload);
                });
            let capture = c.capture_photo(1).unwrap();
            assert_eq!(c.photo_state(), PhotoCaptureState::Capturing);
            capture.request_id()
        });
        rig.settle(); // shutter / picture / completed driver events
        rig.settle(); // shutter stream stop posted by session teardown

        assert_eq!(*completed.lock(), vec![request]);
        assert_eq!(*rig.frames.lock(), vec![0]);
        assert_eq!(
            rig.with_controller(|c| c.photo_state()),
            PhotoCaptureState::Ready
        );
        let sound_log = rig.sound.log();
        assert!(sound_log.iter().any(|entry| entry.starts_with("play:")));
        rig.teardown();
    }

    #[test]
    fn test_handler_error_reverts_to_ready() {
        let rig = Rig::new("handler-err");
        rig.start_preview_ready();
        let (failed, state) = rig.with_controller(|c| {
            let _reg = c.set_photo_capture_handler(Rc::new(FailingHandler));
            (c.capture_photo(1).is_err(), c.photo_state())
        });
        assert!(failed);
        assert_eq!(state, PhotoCaptureState::Ready);
        // the default hardware path was never reached
        assert_eq!(rig.camera.capture_calls(), 0);
        rig.teardown();
    }

    #[test]
    fn test_claiming_handler_owns_completion() {
        let rig = Rig::new("claim");
        rig.start_preview_ready();
        rig.with_controller(|c| {
            let registration = c.set_photo_capture_handler(Rc::new(ClaimingHandler));
            let capture = c.capture_photo(1).unwrap();
            assert_eq!(c.photo_state(), PhotoCaptureState::Capturing);

            // a non-owning handle must not complete, and must not mutate
            let bogus = Handle::empty("bogus");
            assert!(!c.complete_capture(&bogus, &capture));
            assert_eq!(c.photo_state(), PhotoCaptureState::Capturing);

            assert!(c.complete_capture(&registration, &capture));
            assert_eq!(c.photo_state(), PhotoCaptureState::Ready);

            // duplicate completion is stale
            assert!(!c.complete_capture(&registration, &capture));
        });
        rig.teardown();
    }

    #[test]
    fn test_sync_stop_queued_mid_starting_succeeds() {
        let rig = Rig::new("sync-stop");
        rig.camera.set_defer_preview_start(true);
        rig.with_controller(|c| c.start_preview().unwrap());
        rig.settle(); // opened; preview start deferred by the mock
        assert_eq!(
            rig.with_controller(|c| c.preview_state()),
            OperationState::Starting
        );

        let service = rig.with_controller(|c| c.service());
        let waiter = std::thread::spawn(move || service.stop_preview_and_wait());
        while rig.with_controller(|c| c.pending_stop_count()) == 0 {
            std::thread::sleep(Duration::from_millis(5));
        }

        rig.camera.complete_preview_start();
        assert!(waiter.join().unwrap().is_ok());
        assert_eq!(
            rig.with_controller(|c| c.preview_state()),
            OperationState::Stopped
        );
        rig.teardown();
    }

    #[test]
    fn test_sync_stop_rejected_from_any_owner_loop() {
        let rig = Rig::new("sync-stop-foreign");
        rig.start_preview_ready();
        let service = rig.with_controller(|c| c.service());

        let ui = Owner::new("ui-sync-stop");
        ui.start().unwrap();
        let started = Instant::now();
        let result = ui.call(move |_| service.stop_preview_and_wait()).unwrap();
        // fails fast instead of parking the foreign loop for the timeout
        assert!(matches!(result, Err(CamkitError::CrossContext { .. })));
        assert!(started.elapsed() < Duration::from_millis(500));
        assert_eq!(
            rig.with_controller(|c| c.preview_state()),
            OperationState::Started
        );
        ui.shutdown();
        ui.join();
        rig.teardown();
    }

    #[test]
    fn test_sync_stop_times_out_when_preview_hangs() {
        let mut config = CamkitConfig::default();
        config.system.preview_stop_timeout_ms = 100;
        let rig = Rig::with_config("stop-timeout", config);
        rig.camera.set_defer_preview_stop(true);
        rig.start_preview_ready();

        let service = rig.with_controller(|c| c.service());
        assert!(service.stop_preview_and_wait().is_err());
        rig.teardown();
    }

    #[test]
    fn test_cancelling_default_capture_restores_ready() {
        let rig = Rig::new("cancel");
        rig.camera.set_manual_capture(true);
        rig.start_preview_ready();

        let capture = rig.with_controller(|c| {
            let capture = c.capture_photo(3).unwrap();
            assert_eq!(c.photo_state(), PhotoCaptureState::Capturing);
            capture
        });

        capture.close();
        rig.settle(); // cancel -> hardware stop -> completion posted
        rig.settle();
        assert_eq!(
            rig.with_controller(|c| c.photo_state()),
            PhotoCaptureState::Ready
        );
        rig.teardown();
    }

    #[test]
    fn test_video_capture_lifecycle() {
        let rig = Rig::new("video");
        rig.with_controller(|c| c.set_media_type(MediaType::Video).unwrap());
        rig.start_preview_ready();

        rig.with_controller(|c| {
            assert_eq!(c.video_state(), VideoCaptureState::Ready);
            let capture = c.capture_video().unwrap();
            assert_eq!(c.video_state(), VideoCaptureState::Capturing);
            c.pause_video().unwrap();
            assert_eq!(c.video_state(), VideoCaptureState::Paused);
            c.resume_video().unwrap();
            assert_eq!(c.video_state(), VideoCaptureState::Capturing);
            capture.close();
        });
        rig.settle();
        rig.settle();

        assert_eq!(
            rig.with_controller(|c| c.video_state()),
            VideoCaptureState::Ready
        );
        let log = rig.encoder.log();
        assert!(log[0].starts_with("prepare:1080p:"));
        assert_eq!(&log[1..], ["start", "pause", "resume", "stop", "release"]);
        assert_eq!(rig.encoder.release_count(), 1);
        rig.teardown();
    }

    #[test]
    fn test_video_prepare_failure_releases_encoder() {
        let rig = Rig::new("video-fail");
        rig.encoder.set_fail_prepare(true);
        rig.with_controller(|c| c.set_media_type(MediaType::Video).unwrap());
        rig.start_preview_ready();

        let (failed, state) =
            rig.with_controller(|c| (c.capture_video().is_err(), c.video_state()));
        assert!(failed);
        assert_eq!(state, VideoCaptureState::Ready);
        assert_eq!(rig.encoder.release_count(), 1);
        rig.teardown();
    }

    #[test]
    fn test_encoder_release_deferred_while_preview_stopping() {
        let rig = Rig::new("video-defer");
        rig.with_controller(|c| c.set_media_type(MediaType::Video).unwrap());
        rig.start_preview_ready();

        let capture = rig.with_controller(|c| c.capture_video().unwrap());
        rig.camera.set_defer_preview_stop(true);
        rig.owner
            .call(|ctx| {
                // drive the preview into Stopping underneath the recording
                let camera = ctx.manager().find_component::<Camera>().unwrap();
                camera.stop_preview();
            })
            .unwrap();

        capture.close();
        rig.settle();
        assert_eq!(rig.encoder.release_count(), 0);
        assert!(rig.encoder.log().contains(&"stop".to_string()));

        rig.camera.complete_preview_stop();
        rig.settle();
        assert_eq!(rig.encoder.release_count(), 1);
        rig.teardown();
    }

    #[test]
    fn test_set_media_type_rejected_mid_capture() {
        let rig = Rig::new("media-switch");
        rig.start_preview_ready();
        rig.with_controller(|c| {
            let _reg = c.set_photo_capture_handler(Rc::new(ClaimingHandler));
            let _capture = c.capture_photo(1).unwrap();
            assert_eq!(c.photo_state(), PhotoCaptureState::Capturing);
            assert!(matches!(
                c.set_media_type(MediaType::Video),
                Err(CamkitError::InvalidState { .. })
            ));
            assert_eq!(c.media_type(), MediaType::Photo);
        });
        rig.teardown();
    }
}
