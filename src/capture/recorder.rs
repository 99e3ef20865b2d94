use crate::config::VideoConfig;
use crate::error::{CamkitError, Result};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Resolution tier a requested capture size falls into; selects the encoder
/// profile row from the config table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionTier {
    Uhd2160,
    Fhd1080,
    Hd720,
    Low,
}

impl ResolutionTier {
    /// Tier by the smaller dimension, so portrait and landscape sizes of the
    /// same resolution land in the same tier.
    pub fn from_size(width: u32, height: u32) -> Self {
        match width.min(height) {
            h if h >= 2160 => ResolutionTier::Uhd2160,
            h if h >= 1080 => ResolutionTier::Fhd1080,
            h if h >= 720 => ResolutionTier::Hd720,
            _ => ResolutionTier::Low,
        }
    }

    /// Key used in the config profile table.
    pub fn key(&self) -> &'static str {
        match self {
            ResolutionTier::Uhd2160 => "2160p",
            ResolutionTier::Fhd1080 => "1080p",
            ResolutionTier::Hd720 => "720p",
            ResolutionTier::Low => "low",
        }
    }
}

/// Fully resolved encoder parameters for one recording session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderProfile {
    pub tier: ResolutionTier,
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    pub bit_rate: u32,
}

impl EncoderProfile {
    /// Pick the profile row matching the configured capture size's tier.
    pub fn resolve(video: &VideoConfig) -> Result<Self> {
        let tier = ResolutionTier::from_size(video.size.0, video.size.1);
        let entry = video
            .profiles
            .iter()
            .find(|entry| entry.tier == tier.key())
            .ok_or_else(|| {
                CamkitError::encoder(format!("no encoder profile for tier '{}'", tier.key()))
            })?;
        debug!(
            "Resolved encoder profile '{}': {}x{} @ {} fps",
            entry.tier, entry.width, entry.height, entry.frame_rate
        );
        Ok(Self {
            tier,
            width: entry.width,
            height: entry.height,
            frame_rate: entry.frame_rate,
            bit_rate: entry.bit_rate,
        })
    }
}

/// The media encoder boundary (the platform recorder). Used only on the
/// capture owner's context; a prepared-but-failed session must always end in
/// `release`.
pub trait VideoEncoder: 'static {
    fn prepare(&self, profile: &EncoderProfile, output: &Path) -> Result<()>;
    fn start(&self) -> Result<()>;
    fn pause(&self);
    fn resume(&self);
    fn stop(&self) -> Result<()>;
    fn release(&self);
}

/// Factory handed to the capture controller; encoders are created per
/// recording session on the owning context.
pub type EncoderFactory = Box<dyn Fn() -> Box<dyn VideoEncoder> + Send>;

#[derive(Clone, Default)]
pub struct MockEncoderControl {
    shared: Arc<Mutex<MockEncoderShared>>,
}

#[derive(Default)]
struct MockEncoderShared {
    log: Vec<String>,
    fail_prepare: bool,
    fail_start: bool,
    releases: u32,
}

impl MockEncoderControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn encoder(&self) -> Box<dyn VideoEncoder> {
        Box::new(MockEncoder {
            shared: Arc::clone(&self.shared),
        })
    }

    pub fn factory(&self) -> EncoderFactory {
        let control = self.clone();
        Box::new(move || control.encoder())
    }

    pub fn set_fail_prepare(&self, fail: bool) {
        self.shared.lock().fail_prepare = fail;
    }

    pub fn set_fail_start(&self, fail: bool) {
        self.shared.lock().fail_start = fail;
    }

    pub fn log(&self) -> Vec<String> {
        self.shared.lock().log.clone()
    }

    pub fn release_count(&self) -> u32 {
        self.shared.lock().releases
    }
}

pub struct MockEncoder {
    shared: Arc<Mutex<MockEncoderShared>>,
}

impl VideoEncoder for MockEncoder {
    fn prepare(&self, profile: &EncoderProfile, output: &Path) -> Result<()> {
        let mut shared = self.shared.lock();
        if shared.fail_prepare {
            return Err(CamkitError::encoder("mock prepare failure"));
        }
        shared.log.push(format!(
            "prepare:{}:{}",
            profile.tier.key(),
            output.display()
        ));
        Ok(())
    }

    fn start(&self) -> Result<()> {
        let mut shared = self.shared.lock();
        if shared.fail_start {
            return Err(CamkitError::encoder("mock start failure"));
        }
        shared.log.push("start".to_string());
        Ok(())
    }

    fn pause(&self) {
        self.shared.lock().log.push("pause".to_string());
    }

    fn resume(&self) {
        self.shared.lock().log.push("resume".to_string());
    }

    fn stop(&self) -> Result<()> {
        self.shared.lock().log.push("stop".to_string());
        Ok(())
    }

    fn release(&self) {
        let mut shared = self.shared.lock();
        shared.releases += 1;
        shared.log.push("release".to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CamkitConfig;

    #[test]
    fn test_tier_by_smaller_dimension() {
        assert_eq!(ResolutionTier::from_size(3840, 2160), ResolutionTier::Uhd2160);
        assert_eq!(ResolutionTier::from_size(1920, 1080), ResolutionTier::Fhd1080);
        assert_eq!(ResolutionTier::from_size(1080, 1920), ResolutionTier::Fhd1080);
        assert_eq!(ResolutionTier::from_size(1280, 720), ResolutionTier::Hd720);
        assert_eq!(ResolutionTier::from_size(640, 480), ResolutionTier::Low);
    }

    #[test]
    fn test_profile_resolved_from_default_table() {
        let config = CamkitConfig::default();
        let profile = EncoderProfile::resolve(&config.video).unwrap();
        assert_eq!(profile.tier, ResolutionTier::Fhd1080);
        assert_eq!(profile.width, 1920);
        assert_eq!(profile.bit_rate, 17_000_000);
    }

    #[test]
    fn test_missing_tier_row_is_an_error() {
        let mut config = CamkitConfig::default();
        config.video.size = (3840, 2160);
        config.video.profiles.retain(|p| p.tier != "2160p");
        assert!(EncoderProfile::resolve(&config.video).is_err());
    }

    #[test]
    fn test_mock_encoder_logs_session() {
        let control = MockEncoderControl::new();
        let encoder = control.encoder();
        let profile = EncoderProfile::resolve(&CamkitConfig::default().video).unwrap();
        encoder.prepare(&profile, Path::new("/tmp/out.mp4")).unwrap();
        encoder.start().unwrap();
        encoder.pause();
        encoder.resume();
        encoder.stop().unwrap();
        encoder.release();
        assert_eq!(
            control.log(),
            vec![
                "prepare:1080p:/tmp/out.mp4",
                "start",
                "pause",
                "resume",
                "stop",
                "release"
            ]
        );
        assert_eq!(control.release_count(), 1);
    }
}
