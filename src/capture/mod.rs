//! Capture orchestration: the camera/recorder/sound driver boundaries and
//! the controller sequencing camera open, preview, photo and video capture
//! on the capture owner.

pub mod camera;
pub mod controller;
pub mod proxy;
pub mod recorder;
pub mod sound;
pub mod states;

pub use camera::{
    Camera, CameraDevice, CameraDeviceManager, CameraEvent, CameraInfo, CameraSignal, LensFacing,
    MockCameraControl, PictureData, PROP_AVAILABLE_CAMERAS,
};
pub use controller::{
    CaptureController, CaptureHandle, CaptureService, PhotoCaptureHandler, PictureSink, StopWaiter,
    VideoCaptureHandler, EVENT_CAMERA_ERROR, EVENT_DEFAULT_PHOTO_CAPTURE_COMPLETED, PROP_CAMERA,
    PROP_CAMERA_PREVIEW_STATE, PROP_MEDIA_TYPE, PROP_PHOTO_CAPTURE_STATE, PROP_VIDEO_CAPTURE_STATE,
};
pub use proxy::CaptureProxy;
pub use recorder::{EncoderFactory, EncoderProfile, MockEncoderControl, ResolutionTier, VideoEncoder};
pub use sound::{MockSoundBackend, SoundBackend, SoundPlayer};
pub use states::{CameraState, MediaType, OperationState, PhotoCaptureState, VideoCaptureState};
