use serde::{Deserialize, Serialize};
use std::fmt;

/// What a capture request produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Photo,
    Video,
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaType::Photo => write!(f, "photo"),
            MediaType::Video => write!(f, "video"),
        }
    }
}

/// Generic start/stop progression used by the camera preview.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationState {
    Starting,
    Started,
    Stopping,
    Stopped,
}

/// Photo capture progression on the capture owner.
///
/// `Preparing` means the preview is not yet delivering frames; `Ready` is the
/// only state a new capture may start from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhotoCaptureState {
    Preparing,
    Ready,
    Starting,
    Capturing,
    Stopping,
    Reviewing,
}

/// Video capture progression on the capture owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoCaptureState {
    Preparing,
    Ready,
    Starting,
    Capturing,
    Paused,
    Stopping,
}

/// Driver-level camera state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CameraState {
    Closed,
    Opening,
    Opened,
    Closing,
    Unavailable,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_media_type_serde_names() {
        assert_eq!(serde_json::to_string(&MediaType::Photo).unwrap(), "\"photo\"");
        assert_eq!(
            serde_json::from_str::<MediaType>("\"video\"").unwrap(),
            MediaType::Video
        );
    }
}
