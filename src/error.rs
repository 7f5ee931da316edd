use thiserror::Error;

/// Main error type for the homeguard controller
#[derive(Error, Debug)]
pub enum HomeguardError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    TomlDeserialize(#[from] toml::de::Error),

    #[error("TOML error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Capture error: {0}")]
    Capture(#[from] CaptureError),

    #[error("Video writer error: {0}")]
    Writer(#[from] WriterError),

    #[error("Alarm error: {0}")]
    Alarm(#[from] AlarmError),

    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    #[error("Component error in {component}: {message}")]
    Component { component: String, message: String },
}

/// Camera capture and frame provider errors
#[derive(Error, Debug, Clone)]
pub enum CaptureError {
    #[error("Failed to open capture uri '{uri}': {details}")]
    Open { uri: String, details: String },

    #[error("Invalid capture uri '{uri}'")]
    InvalidUri { uri: String },

    #[error("Capture stream error: {details}")]
    Stream { details: String },

    #[error("Capture source stopped")]
    Stopped,
}

/// Video writer errors
#[derive(Error, Debug, Clone)]
pub enum WriterError {
    #[error("Failed to open video writer '{path}': {details}")]
    Open { path: String, details: String },

    #[error("Video encoding error: {details}")]
    Encode { details: String },
}

/// Alarm engine errors
#[derive(Error, Debug, Clone)]
pub enum AlarmError {
    #[error("Failed to start alarm countdown: {details}")]
    SpawnFailed { details: String },

    #[error("No alarm is running")]
    NotRunning,
}

/// Message bus errors
#[derive(Error, Debug, Clone)]
pub enum BusError {
    #[error("Bus channel closed")]
    ChannelClosed,

    #[error("Failed to publish event: {details}")]
    PublishFailed { details: String },
}

impl HomeguardError {
    /// Create a component error with context
    pub fn component(component: &str, message: &str) -> Self {
        HomeguardError::Component {
            component: component.to_string(),
            message: message.to_string(),
        }
    }
}

/// Result type alias for homeguard operations
pub type Result<T> = std::result::Result<T, HomeguardError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_conversion() {
        let capture_error = CaptureError::InvalidUri {
            uri: "bogus://".to_string(),
        };
        let err: HomeguardError = capture_error.into();
        assert!(matches!(err, HomeguardError::Capture(_)));
    }

    #[test]
    fn test_component_error_display() {
        let err = HomeguardError::component("motion", "writer failed");
        assert_eq!(err.to_string(), "Component error in motion: writer failed");
    }
}
