use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info};

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CamkitConfig {
    pub system: SystemConfig,
    pub capture: CaptureConfig,
    pub video: VideoConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SystemConfig {
    /// Timeout for the synchronous preview-stop wait, in milliseconds.
    ///
    /// The original used a fixed 5 second wait; this is deliberately a
    /// tunable since "hardware slow" and "hardware hung" cannot be told
    /// apart at this layer.
    #[serde(default = "default_preview_stop_timeout_ms")]
    pub preview_stop_timeout_ms: u64,

    /// Prefix used for owner thread names
    #[serde(default = "default_thread_name_prefix")]
    pub thread_name_prefix: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CaptureConfig {
    /// Base path for storing captured media
    #[serde(default = "default_capture_path")]
    pub path: String,

    /// Play the default shutter sound on photo capture
    #[serde(default = "default_shutter_sound")]
    pub shutter_sound: bool,

    /// Write a JSON metadata sidecar next to each captured picture
    #[serde(default = "default_save_metadata")]
    pub save_metadata: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct VideoConfig {
    /// Requested video capture size (width, height). The encoder profile is
    /// selected from the resolution tier this size falls into.
    #[serde(default = "default_video_size")]
    pub size: (u32, u32),

    /// Encoder profile per resolution tier
    #[serde(default = "default_profiles")]
    pub profiles: Vec<ProfileEntry>,
}

/// One row of the resolution tier -> encoder profile mapping.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct ProfileEntry {
    pub tier: String,
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    pub bit_rate: u32,
}

impl CamkitConfig {
    /// Load configuration from default sources (file + environment variables)
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_file("camkit.toml")
    }

    /// Load configuration from a specific file path
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path_str = path.as_ref().to_string_lossy();
        debug!("Loading configuration from: {}", path_str);

        let settings = Config::builder()
            .set_default(
                "system.preview_stop_timeout_ms",
                default_preview_stop_timeout_ms(),
            )?
            .set_default("system.thread_name_prefix", default_thread_name_prefix())?
            .set_default("capture.path", default_capture_path())?
            .set_default("capture.shutter_sound", default_shutter_sound())?
            .set_default("capture.save_metadata", default_save_metadata())?
            .set_default(
                "video.size",
                vec![default_video_size().0, default_video_size().1],
            )?
            // Add configuration file (optional)
            .add_source(File::with_name(&path_str).required(false))
            // Add environment variables with CAMKIT_ prefix
            .add_source(Environment::with_prefix("CAMKIT").separator("_"))
            .build()?;

        let mut config: CamkitConfig = settings.try_deserialize()?;
        if config.video.profiles.is_empty() {
            config.video.profiles = default_profiles();
        }

        info!("Configuration loaded successfully");
        debug!("Final configuration: {:#?}", config);

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.system.preview_stop_timeout_ms == 0 {
            return Err(ConfigError::Message(
                "preview_stop_timeout_ms must be greater than 0".to_string(),
            ));
        }

        if self.video.size.0 == 0 || self.video.size.1 == 0 {
            return Err(ConfigError::Message(
                "Video size must be greater than 0".to_string(),
            ));
        }

        for profile in &self.video.profiles {
            if profile.width == 0 || profile.height == 0 || profile.frame_rate == 0 {
                return Err(ConfigError::Message(format!(
                    "Invalid encoder profile for tier '{}'",
                    profile.tier
                )));
            }
        }

        Ok(())
    }

    /// Save the configuration to a TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> crate::error::Result<()> {
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path.as_ref(), contents)?;
        info!("Configuration saved to: {}", path.as_ref().display());
        Ok(())
    }
}

impl Default for CamkitConfig {
    fn default() -> Self {
        Self {
            system: SystemConfig {
                preview_stop_timeout_ms: default_preview_stop_timeout_ms(),
                thread_name_prefix: default_thread_name_prefix(),
            },
            capture: CaptureConfig {
                path: default_capture_path(),
                shutter_sound: default_shutter_sound(),
                save_metadata: default_save_metadata(),
            },
            video: VideoConfig {
                size: default_video_size(),
                profiles: default_profiles(),
            },
        }
    }
}

// Default value functions
fn default_preview_stop_timeout_ms() -> u64 {
    5000
}
fn default_thread_name_prefix() -> String {
    "camkit".to_string()
}

fn default_capture_path() -> String {
    "./captures".to_string()
}
fn default_shutter_sound() -> bool {
    true
}
fn default_save_metadata() -> bool {
    false
}

fn default_video_size() -> (u32, u32) {
    (1920, 1080)
}

fn default_profiles() -> Vec<ProfileEntry> {
    vec![
        ProfileEntry {
            tier: "2160p".to_string(),
            width: 3840,
            height: 2160,
            frame_rate: 30,
            bit_rate: 42_000_000,
        },
        ProfileEntry {
            tier: "1080p".to_string(),
            width: 1920,
            height: 1080,
            frame_rate: 30,
            bit_rate: 17_000_000,
        },
        ProfileEntry {
            tier: "720p".to_string(),
            width: 1280,
            height: 720,
            frame_rate: 30,
            bit_rate: 12_000_000,
        },
        ProfileEntry {
            tier: "low".to_string(),
            width: 640,
            height: 480,
            frame_rate: 30,
            bit_rate: 1_500_000,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config_validates() {
        let config = CamkitConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.system.preview_stop_timeout_ms, 5000);
        assert_eq!(config.video.profiles.len(), 4);
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let config = CamkitConfig::load_from_file("/nonexistent/camkit.toml").unwrap();
        assert_eq!(config.capture.path, "./captures");
        assert!(config.capture.shutter_sound);
    }

    #[test]
    fn test_save_and_reload_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("camkit.toml");

        let mut config = CamkitConfig::default();
        config.system.preview_stop_timeout_ms = 1234;
        config.capture.path = "/tmp/camkit_test".to_string();
        config.save(&path).unwrap();

        let reloaded = CamkitConfig::load_from_file(&path).unwrap();
        assert_eq!(reloaded.system.preview_stop_timeout_ms, 1234);
        assert_eq!(reloaded.capture.path, "/tmp/camkit_test");
        assert_eq!(reloaded.video.profiles, config.video.profiles);
    }

    #[test]
    fn test_validate_rejects_zero_timeout() {
        let mut config = CamkitConfig::default();
        config.system.preview_stop_timeout_ms = 0;
        assert!(config.validate().is_err());
    }
}
