use crate::capture::controller::{
    CaptureController, EVENT_CAMERA_ERROR, PROP_CAMERA_PREVIEW_STATE, PROP_MEDIA_TYPE,
    PROP_PHOTO_CAPTURE_STATE, PROP_VIDEO_CAPTURE_STATE,
};
use crate::capture::states::{MediaType, OperationState, PhotoCaptureState, VideoCaptureState};
use crate::error::Result;
use crate::runtime::component::{Component, ComponentContext, ComponentCore};
use crate::runtime::handle::Handle;
use crate::runtime::owner::Owner;
use crate::runtime::proxy::ProxyComponent;
use std::any::Any;
use std::rc::Rc;
use tracing::error;

/// UI-owner stand-in for the [`CaptureController`] living on the capture
/// owner. Capture/preview/media-type states and camera errors are mirrored
/// onto this component's own hosts, so UI code subscribes locally; commands
/// are posted to the capture context and can be cancelled through the
/// returned handles. Calls made before the controller is bound queue and
/// flush in order at bind.
pub struct CaptureProxy {
    proxy: ProxyComponent<CaptureController>,
}

impl CaptureProxy {
    pub fn new(ctx: &ComponentContext, capture_owner: Owner) -> Self {
        let proxy = ProxyComponent::new("CaptureProxy", ctx, capture_owner);
        proxy.mirror_property(&PROP_CAMERA_PREVIEW_STATE);
        proxy.mirror_property(&PROP_MEDIA_TYPE);
        proxy.mirror_property(&PROP_PHOTO_CAPTURE_STATE);
        proxy.mirror_property(&PROP_VIDEO_CAPTURE_STATE);
        proxy.mirror_event(&EVENT_CAMERA_ERROR);
        Self { proxy }
    }

    pub fn is_bound(&self) -> bool {
        self.proxy.is_bound()
    }

    /// Mirrored snapshot; lags the controller by at most the in-flight
    /// forwarding tasks.
    pub fn preview_state(&self) -> OperationState {
        self.proxy
            .core()
            .properties()
            .get(&PROP_CAMERA_PREVIEW_STATE)
    }

    pub fn media_type(&self) -> MediaType {
        self.proxy.core().properties().get(&PROP_MEDIA_TYPE)
    }

    pub fn photo_state(&self) -> PhotoCaptureState {
        self.proxy.core().properties().get(&PROP_PHOTO_CAPTURE_STATE)
    }

    pub fn video_state(&self) -> VideoCaptureState {
        self.proxy.core().properties().get(&PROP_VIDEO_CAPTURE_STATE)
    }

    pub fn open_camera(&self) -> Handle {
        self.proxy.call_target(|c| {
            if let Err(e) = c.open_camera() {
                error!("open_camera failed: {}", e);
            }
            None
        })
    }

    pub fn start_preview(&self) -> Handle {
        self.proxy.call_target(|c| {
            if let Err(e) = c.start_preview() {
                error!("start_preview failed: {}", e);
            }
            None
        })
    }

    pub fn stop_preview(&self) -> Handle {
        self.proxy.call_target(|c| {
            c.stop_preview(None);
            None
        })
    }

    pub fn set_media_type(&self, media_type: MediaType) -> Handle {
        self.proxy.call_target(move |c| {
            if let Err(e) = c.set_media_type(media_type) {
                error!("set_media_type failed: {}", e);
            }
            None
        })
    }

    /// Closing the returned handle cancels the capture (queued calls never
    /// run; an in-flight capture is stopped through its handler's stop path).
    pub fn capture_photo(&self, frame_count: u32) -> Handle {
        self.proxy.call_target(move |c| match c.capture_photo(frame_count) {
            Ok(capture) => Some(capture.cancel_handle()),
            Err(e) => {
                error!("capture_photo failed: {}", e);
                None
            }
        })
    }

    pub fn capture_video(&self) -> Handle {
        self.proxy.call_target(|c| match c.capture_video() {
            Ok(capture) => Some(capture.cancel_handle()),
            Err(e) => {
                error!("capture_video failed: {}", e);
                None
            }
        })
    }
}

impl Component for CaptureProxy {
    fn core(&self) -> &ComponentCore {
        self.proxy.core()
    }

    fn on_initialize(&self) -> Result<()> {
        Component::on_initialize(&self.proxy)
    }

    fn on_release(&self) {
        Component::on_release(&self.proxy)
    }

    fn as_any(self: Rc<Self>) -> Rc<dyn Any> {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::camera::{Camera, CameraDeviceManager, LensFacing, MockCameraControl};
    use crate::capture::recorder::MockEncoderControl;
    use crate::capture::sound::{MockSoundBackend, SoundPlayer};
    use crate::capture::states::CameraState;
    use crate::config::CamkitConfig;
    use crate::runtime::component::Capability;
    use crate::runtime::manager::{ComponentBuilder, CreationPriority};

    fn capture_builders(camera: &MockCameraControl) -> Vec<ComponentBuilder> {
        let devices = vec![camera.device("0", LensFacing::Back)];
        let sound = MockSoundBackend::new();
        let encoder_factory = MockEncoderControl::new().factory();
        vec![
            ComponentBuilder::new(
                CreationPriority::Launch,
                vec![Capability::of::<CameraDeviceManager>()],
                move |ctx| Rc::new(CameraDeviceManager::new(ctx, devices)),
            ),
            ComponentBuilder::new(
                CreationPriority::High,
                vec![Capability::of::<SoundPlayer>()],
                move |ctx| Rc::new(SoundPlayer::new(ctx, Box::new(sound))),
            ),
            ComponentBuilder::new(
                CreationPriority::Normal,
                vec![Capability::of::<CaptureController>()],
                move |ctx| {
                    Rc::new(CaptureController::new(
                        ctx,
                        CamkitConfig::default(),
                        encoder_factory,
                        None,
                    ))
                },
            ),
        ]
    }

    struct Rig {
        ui: Owner,
        capture: Owner,
        camera: MockCameraControl,
    }

    impl Rig {
        fn new(tag: &str) -> Self {
            let ui = Owner::new(format!("ui-{tag}"));
            let capture = Owner::new(format!("capture-{tag}"));
            ui.start().unwrap();
            capture.start().unwrap();
            let camera = MockCameraControl::new();

            let builders = capture_builders(&camera);
            capture
                .call(move |ctx| {
                    ctx.manager().add_builders(builders);
                    ctx.manager().create_components(CreationPriority::Normal);
                })
                .unwrap();

            let capture_owner = capture.clone();
            ui.call(move |ctx| {
                ctx.manager().add_builder(ComponentBuilder::new(
                    CreationPriority::Normal,
                    vec![Capability::of::<CaptureProxy>()],
                    move |component_ctx| Rc::new(CaptureProxy::new(component_ctx, capture_owner)),
                ));
                ctx.manager().create_components(CreationPriority::Normal);
            })
            .unwrap();

            Rig { ui, capture, camera }
        }

        fn settle(&self) {
            for _ in 0..4 {
                self.capture.call(|_| {}).unwrap();
                self.ui.call(|_| {}).unwrap();
            }
        }

        fn with_proxy<R: Send + 'static>(
            &self,
            f: impl FnOnce(&CaptureProxy) -> R + Send + 'static,
        ) -> R {
            self.ui
                .call(move |ctx| {
                    let proxy = ctx.manager().find_component::<CaptureProxy>().unwrap();
                    f(&proxy)
                })
                .unwrap()
        }

        fn teardown(self) {
            self.ui.shutdown();
            self.ui.join();
            self.capture.shutdown();
            self.capture.join();
        }
    }

    #[test]
    fn test_binding_and_state_mirroring() {
        let rig = Rig::new("mirror");
        rig.settle();
        assert!(rig.with_proxy(|p| p.is_bound()));

        rig.with_proxy(|p| {
            let _ = p.start_preview();
        });
        rig.settle();

        let (preview, photo) = rig.with_proxy(|p| (p.preview_state(), p.photo_state()));
        assert_eq!(preview, OperationState::Started);
        assert_eq!(photo, PhotoCaptureState::Ready);
        rig.teardown();
    }

    #[test]
    fn test_photo_capture_through_proxy() {
        let rig = Rig::new("photo");
        rig.settle();
        rig.with_proxy(|p| {
            let _ = p.start_preview();
        });
        rig.settle();

        rig.with_proxy(|p| {
            let _capture = p.capture_photo(1);
        });
        rig.settle();

        assert_eq!(rig.camera.capture_calls(), 1);
        // the mirrored state has cycled back to Ready after auto-completion
        assert_eq!(
            rig.with_proxy(|p| p.photo_state()),
            PhotoCaptureState::Ready
        );
        rig.teardown();
    }

    #[test]
    fn test_call_queued_before_target_start_flushes_at_bind() {
        let ui = Owner::new("ui-queued");
        let capture = Owner::new("capture-queued");
        ui.start().unwrap();
        let camera = MockCameraControl::new();

        // buffered until the capture owner starts
        let builders = capture_builders(&camera);
        capture
            .post(move |ctx| {
                ctx.manager().add_builders(builders);
                ctx.manager().create_components(CreationPriority::Normal);
            })
            .unwrap();

        let capture_owner = capture.clone();
        ui.call(move |ctx| {
            ctx.manager().add_builder(ComponentBuilder::new(
                CreationPriority::Normal,
                vec![Capability::of::<CaptureProxy>()],
                move |component_ctx| Rc::new(CaptureProxy::new(component_ctx, capture_owner)),
            ));
            ctx.manager().create_components(CreationPriority::Normal);
        })
        .unwrap();

        let bound = ui
            .call(|ctx| {
                let proxy = ctx.manager().find_component::<CaptureProxy>().unwrap();
                let _ = proxy.open_camera();
                proxy.is_bound()
            })
            .unwrap();
        assert!(!bound);

        capture.start().unwrap();
        for _ in 0..4 {
            capture.call(|_| {}).unwrap();
            ui.call(|_| {}).unwrap();
        }

        assert!(ui
            .call(|ctx| ctx
                .manager()
                .find_component::<CaptureProxy>()
                .unwrap()
                .is_bound())
            .unwrap());
        let state = capture
            .call(|ctx| {
                ctx.manager()
                    .find_component::<Camera>()
                    .unwrap()
                    .state()
            })
            .unwrap();
        assert_eq!(state, CameraState::Opened);

        ui.shutdown();
        ui.join();
        capture.shutdown();
        capture.join();
    }
}
