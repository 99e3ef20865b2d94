use crate::error::{CamkitError, Result};
use crate::runtime::component::{Component, ComponentContext, ComponentCore};
use crate::runtime::handle::Handle;
use parking_lot::Mutex;
use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;
use tracing::debug;

pub type SoundId = u64;
pub type StreamId = u64;

/// The platform audio boundary for short notification sounds.
pub trait SoundBackend: Send + 'static {
    fn load(&self, name: &str) -> Result<SoundId>;
    fn unload(&self, id: SoundId);
    fn play(&self, id: SoundId, looped: bool) -> Result<StreamId>;
    fn stop(&self, stream: StreamId);
}

/// Capture-owner component playing loaded sounds (the shutter click and the
/// burst loop). Loaded sounds and running streams are closeable handles;
/// closing a handle from any thread routes the unload/stop back onto the
/// owning context.
pub struct SoundPlayer {
    core: ComponentCore,
    backend: Box<dyn SoundBackend>,
    // handle id -> loaded sound, for play_sound lookups
    sounds: RefCell<HashMap<u64, SoundId>>,
    streams: RefCell<Vec<StreamId>>,
}

impl SoundPlayer {
    pub fn new(ctx: &ComponentContext, backend: Box<dyn SoundBackend>) -> Self {
        Self {
            core: ComponentCore::new("SoundPlayer", ctx),
            backend,
            sounds: RefCell::new(HashMap::new()),
            streams: RefCell::new(Vec::new()),
        }
    }

    fn post_to_self(&self, f: impl FnOnce(&SoundPlayer) + Send + 'static) -> impl FnOnce() + Send {
        let owner = self.core.owner().clone();
        let component = self.core.id();
        move || {
            let _ = owner.post(move |ctx| {
                let player = ctx
                    .manager()
                    .component_by_id(component)
                    .and_then(|c| crate::runtime::component::downcast_component::<SoundPlayer>(&c));
                if let Some(player) = player {
                    f(&player);
                }
            });
        }
    }

    /// Load a named sound; closing the returned handle unloads it.
    pub fn load_sound(&self, name: &str) -> Result<Handle> {
        self.core.verify_access();
        let sound = self.backend.load(name)?;
        debug!("Loaded sound '{}' as {}", name, sound);

        let handle = Handle::new(
            "Sound",
            self.post_to_self(move |player| player.unload(sound)),
        );
        self.sounds.borrow_mut().insert(handle.id(), sound);
        Ok(handle)
    }

    /// Start playback of a loaded sound; closing the returned handle stops
    /// the stream.
    pub fn play_sound(&self, sound: &Handle, looped: bool) -> Result<Handle> {
        self.core.verify_access();
        if !sound.is_valid() {
            return Err(CamkitError::invalid_state("play_sound", "closed sound"));
        }
        let sound_id = *self
            .sounds
            .borrow()
            .get(&sound.id())
            .ok_or_else(|| CamkitError::invalid_state("play_sound", "unknown sound"))?;
        let stream = self.backend.play(sound_id, looped)?;
        self.streams.borrow_mut().push(stream);
        Ok(Handle::new(
            "SoundStream",
            self.post_to_self(move |player| player.stop(stream)),
        ))
    }

    fn unload(&self, sound: SoundId) {
        self.sounds.borrow_mut().retain(|_, id| *id != sound);
        self.backend.unload(sound);
    }

    fn stop(&self, stream: StreamId) {
        let mut streams = self.streams.borrow_mut();
        if let Some(index) = streams.iter().position(|s| *s == stream) {
            streams.remove(index);
            self.backend.stop(stream);
        }
    }
}

impl Component for SoundPlayer {
    fn core(&self) -> &ComponentCore {
        &self.core
    }

    fn on_release(&self) {
        for stream in self.streams.borrow_mut().drain(..) {
            self.backend.stop(stream);
        }
        for (_, sound) in self.sounds.borrow_mut().drain() {
            self.backend.unload(sound);
        }
    }

    fn as_any(self: Rc<Self>) -> Rc<dyn Any> {
        self
    }
}

#[derive(Clone, Default)]
pub struct MockSoundBackend {
    shared: Arc<Mutex<MockSoundShared>>,
}

#[derive(Default)]
struct MockSoundShared {
    log: Vec<String>,
    next_id: u64,
}

impl MockSoundBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn log(&self) -> Vec<String> {
        self.shared.lock().log.clone()
    }
}

impl SoundBackend for MockSoundBackend {
    fn load(&self, name: &str) -> Result<SoundId> {
        let mut shared = self.shared.lock();
        shared.next_id += 1;
        let id = shared.next_id;
        shared.log.push(format!("load:{name}:{id}"));
        Ok(id)
    }

    fn unload(&self, id: SoundId) {
        self.shared.lock().log.push(format!("unload:{id}"));
    }

    fn play(&self, id: SoundId, looped: bool) -> Result<StreamId> {
        let mut shared = self.shared.lock();
        shared.next_id += 1;
        let stream = shared.next_id;
        shared.log.push(format!("play:{id}:{looped}:{stream}"));
        Ok(stream)
    }

    fn stop(&self, stream: StreamId) {
        self.shared.lock().log.push(format!("stop:{stream}"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::component::Capability;
    use crate::runtime::manager::{ComponentBuilder, CreationPriority};
    use crate::runtime::owner::Owner;

    fn sound_rig() -> (Owner, MockSoundBackend) {
        let owner = Owner::new("sound-test");
        owner.start().unwrap();
        let backend = MockSoundBackend::new();
        let injected = backend.clone();
        owner
            .call(move |ctx| {
                ctx.manager().add_builder(ComponentBuilder::new(
                    CreationPriority::Normal,
                    vec![Capability::of::<SoundPlayer>()],
                    move |component_ctx| {
                        Rc::new(SoundPlayer::new(component_ctx, Box::new(injected)))
                    },
                ));
                ctx.manager().create_components(CreationPriority::Normal);
            })
            .unwrap();
        (owner, backend)
    }

    #[test]
    fn test_closing_stream_handle_stops_playback() {
        let (owner, backend) = sound_rig();
        let stream = owner
            .call(|ctx| {
                let player = ctx.manager().find_component::<SoundPlayer>().unwrap();
                let sound = player.load_sound("shutter").unwrap();
                player.play_sound(&sound, false).unwrap()
            })
            .unwrap();
        stream.close();
        owner.call(|_| {}).unwrap();
        assert_eq!(backend.log(), vec!["load:shutter:1", "play:1:false:2", "stop:2"]);
        owner.shutdown();
        owner.join();
    }

    #[test]
    fn test_playing_a_closed_sound_is_rejected() {
        let (owner, _backend) = sound_rig();
        owner
            .call(|ctx| {
                let player = ctx.manager().find_component::<SoundPlayer>().unwrap();
                let sound = player.load_sound("shutter").unwrap();
                sound.close();
            })
            .unwrap();
        // the unload posted by close runs before this task
        let rejected = owner
            .call(|ctx| {
                let player = ctx.manager().find_component::<SoundPlayer>().unwrap();
                let ghost = Handle::empty("ghost");
                player.play_sound(&ghost, false).is_err()
            })
            .unwrap();
        assert!(rejected);
        owner.shutdown();
        owner.join();
    }

    #[test]
    fn test_release_stops_and_unloads_everything() {
        let (owner, backend) = sound_rig();
        owner
            .call(|ctx| {
                let player = ctx.manager().find_component::<SoundPlayer>().unwrap();
                let sound = player.load_sound("burst").unwrap();
                let _stream = player.play_sound(&sound, true).unwrap();
                let id = player.core.id();
                ctx.manager().remove_component(id);
            })
            .unwrap();
        let log = backend.log();
        assert!(log.contains(&"stop:2".to_string()));
        assert!(log.contains(&"unload:1".to_string()));
        owner.shutdown();
        owner.join();
    }
}
