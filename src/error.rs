use thiserror::Error;

#[derive(Error, Debug)]
pub enum CamkitError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("Invalid state for {operation}: {state}")]
    InvalidState { operation: String, state: String },

    #[error("Property '{name}' is read-only")]
    ReadOnlyProperty { name: &'static str },

    #[error("Property '{name}' cannot be set to null")]
    NullProperty { name: &'static str },

    #[error("Owner '{owner}' is not running")]
    OwnerStopped { owner: String },

    #[error("Cross-context access on owner '{owner}'")]
    CrossContext { owner: String },

    #[error("Camera error: {message}")]
    Camera { message: String },

    #[error("Encoder error: {message}")]
    Encoder { message: String },

    #[error("Component error in {component}: {message}")]
    Component { component: String, message: String },
}

impl CamkitError {
    pub fn invalid_state<S: Into<String>>(operation: S, state: impl std::fmt::Debug) -> Self {
        Self::InvalidState {
            operation: operation.into(),
            state: format!("{:?}", state),
        }
    }

    pub fn camera<S: Into<String>>(message: S) -> Self {
        Self::Camera {
            message: message.into(),
        }
    }

    pub fn encoder<S: Into<String>>(message: S) -> Self {
        Self::Encoder {
            message: message.into(),
        }
    }

    pub fn component<S: Into<String>>(component: S, message: S) -> Self {
        Self::Component {
            component: component.into(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, CamkitError>;
