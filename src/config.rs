use crate::error::Result;
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct HomeguardConfig {
    pub security: SecurityConfig,
    pub system: SystemConfig,
    pub paths: PathsConfig,
    pub bus: BusConfig,
    pub video: VideoConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SecurityConfig {
    /// Comma-separated list of accepted pin codes
    #[serde(default = "default_pin")]
    pub pin: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SystemConfig {
    /// Default email address for smtp alert gateways
    #[serde(default)]
    pub email: String,

    /// Default phone number for sms alert gateways
    #[serde(default)]
    pub phone: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PathsConfig {
    /// Directory holding persisted maps (securitymap.json lives under maps/)
    #[serde(default = "default_config_dir")]
    pub config_dir: String,

    /// Local state directory (recordings land under recordings/)
    #[serde(default = "default_state_dir")]
    pub state_dir: String,

    /// Directory for motion snapshot pictures
    #[serde(default = "default_snapshot_dir")]
    pub snapshot_dir: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct BusConfig {
    /// Event broadcast channel capacity
    #[serde(default = "default_bus_capacity")]
    pub channel_capacity: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct VideoConfig {
    /// Path to TrueType font used for frame overlays
    #[serde(default = "default_overlay_font_path")]
    pub overlay_font_path: String,

    /// Per-consumer frame queue depth before oldest frames are dropped
    #[serde(default = "default_consumer_queue_depth")]
    pub consumer_queue_depth: usize,
}

impl HomeguardConfig {
    /// Load configuration from a specific file path
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> std::result::Result<Self, ConfigError> {
        let path_str = path.as_ref().to_string_lossy();
        debug!("Loading configuration from: {}", path_str);

        let settings = Config::builder()
            .set_default("security.pin", default_pin())?
            .set_default("system.email", "")?
            .set_default("system.phone", "")?
            .set_default("paths.config_dir", default_config_dir())?
            .set_default("paths.state_dir", default_state_dir())?
            .set_default("paths.snapshot_dir", default_snapshot_dir())?
            .set_default("bus.channel_capacity", default_bus_capacity() as i64)?
            .set_default("video.overlay_font_path", default_overlay_font_path())?
            .set_default(
                "video.consumer_queue_depth",
                default_consumer_queue_depth() as i64,
            )?
            .add_source(File::with_name(&path_str).required(false))
            .add_source(Environment::with_prefix("HOMEGUARD").separator("_"))
            .build()?;

        let config: HomeguardConfig = settings.try_deserialize()?;

        info!("Configuration loaded successfully");
        debug!("Final configuration: {:#?}", config);

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.security.pin.is_empty() {
            return Err(ConfigError::Message(
                "At least one pin code must be configured".to_string(),
            ));
        }

        if self.bus.channel_capacity == 0 {
            return Err(ConfigError::Message(
                "Bus channel capacity must be greater than 0".to_string(),
            ));
        }

        if self.video.consumer_queue_depth == 0 {
            return Err(ConfigError::Message(
                "Consumer queue depth must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Path of the persisted securitymap document
    pub fn securitymap_path(&self) -> PathBuf {
        PathBuf::from(&self.paths.config_dir)
            .join("maps")
            .join("securitymap.json")
    }

    /// Directory receiving timelapse and motion recordings
    pub fn recordings_dir(&self) -> PathBuf {
        PathBuf::from(&self.paths.state_dir).join("recordings")
    }

    /// Check a pin code against the configured comma-separated list
    pub fn pin_matches(pins: &str, candidate: &str) -> bool {
        pins.split(',').any(|pin| pin == candidate)
    }
}

/// Persist a new pin list back into the configuration file.
///
/// Unknown keys in the file are preserved; only `[security].pin` is rewritten.
pub fn save_pin<P: AsRef<Path>>(path: P, new_pin: &str) -> Result<()> {
    let path = path.as_ref();
    let mut document: toml::Table = match std::fs::read_to_string(path) {
        Ok(raw) => raw.parse()?,
        Err(_) => toml::Table::new(),
    };

    let security = document
        .entry("security")
        .or_insert_with(|| toml::Value::Table(toml::Table::new()));
    if let toml::Value::Table(table) = security {
        table.insert("pin".to_string(), toml::Value::String(new_pin.to_string()));
    }

    std::fs::write(path, toml::to_string_pretty(&document)?)?;
    info!("Pin codes updated in {}", path.display());
    Ok(())
}

impl Default for HomeguardConfig {
    fn default() -> Self {
        Self {
            security: SecurityConfig { pin: default_pin() },
            system: SystemConfig {
                email: String::new(),
                phone: String::new(),
            },
            paths: PathsConfig {
                config_dir: default_config_dir(),
                state_dir: default_state_dir(),
                snapshot_dir: default_snapshot_dir(),
            },
            bus: BusConfig {
                channel_capacity: default_bus_capacity(),
            },
            video: VideoConfig {
                overlay_font_path: default_overlay_font_path(),
                consumer_queue_depth: default_consumer_queue_depth(),
            },
        }
    }
}

// Default value functions
fn default_pin() -> String {
    "0815".to_string()
}
fn default_config_dir() -> String {
    "./config".to_string()
}
fn default_state_dir() -> String {
    "./state".to_string()
}
fn default_snapshot_dir() -> String {
    "/tmp".to_string()
}
fn default_bus_capacity() -> usize {
    100
}
fn default_overlay_font_path() -> String {
    "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf".to_string()
}
fn default_consumer_queue_depth() -> usize {
    4
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_valid() {
        let config = HomeguardConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.security.pin, "0815");
        assert_eq!(config.video.consumer_queue_depth, 4);
    }

    #[test]
    fn test_pin_matching() {
        assert!(HomeguardConfig::pin_matches("0815", "0815"));
        assert!(HomeguardConfig::pin_matches("1234,0815,9999", "0815"));
        assert!(!HomeguardConfig::pin_matches("1234,0815", "0000"));
        assert!(!HomeguardConfig::pin_matches("1234", "123"));
    }

    #[test]
    fn test_validation_rejects_empty_pin() {
        let mut config = HomeguardConfig::default();
        config.security.pin = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_securitymap_path_layout() {
        let config = HomeguardConfig::default();
        assert!(config
            .securitymap_path()
            .ends_with("maps/securitymap.json"));
        assert!(config.recordings_dir().ends_with("recordings"));
    }

    #[test]
    fn test_save_pin_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("homeguard.toml");
        std::fs::write(&path, "[system]\nemail = \"a@b.c\"\n").unwrap();

        save_pin(&path, "4321,0815").unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        let parsed: toml::Table = raw.parse().unwrap();
        assert_eq!(
            parsed["security"]["pin"].as_str().unwrap(),
            "4321,0815"
        );
        // untouched section survives the rewrite
        assert_eq!(parsed["system"]["email"].as_str().unwrap(), "a@b.c");
    }
}
