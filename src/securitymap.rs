use crate::error::Result;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// The persisted securitymap document: housemodes, zones, camera workers and
/// recordings retention.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Securitymap {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub housemode: Option<String>,

    #[serde(rename = "defaultHousemode", skip_serializing_if = "Option::is_none")]
    pub default_housemode: Option<String>,

    #[serde(rename = "armedMessage", default)]
    pub armed_message: String,

    #[serde(rename = "disarmedMessage", default)]
    pub disarmed_message: String,

    /// housemode name -> ordered zones
    #[serde(default)]
    pub config: BTreeMap<String, Vec<Zone>>,

    /// internal id -> timelapse worker config
    #[serde(default)]
    pub timelapses: BTreeMap<String, TimelapseConfig>,

    /// internal id -> motion worker config
    #[serde(default)]
    pub motions: BTreeMap<String, MotionConfig>,

    #[serde(default)]
    pub recordings: RecordingsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Zone {
    pub zone: String,
    /// Arm delay in seconds; negative means the zone is inactive in this housemode
    pub delay: i16,
    /// Sensor uuids arming this zone
    #[serde(default)]
    pub devices: Vec<String>,
    /// Notification device uuids receiving the alarm fan-out
    #[serde(default)]
    pub alarms: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimelapseConfig {
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default)]
    pub uri: String,
    #[serde(default = "default_timelapse_fps")]
    pub fps: u32,
    #[serde(default = "default_codec")]
    pub codec: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl Default for TimelapseConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            uri: String::new(),
            fps: default_timelapse_fps(),
            codec: default_codec(),
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MotionConfig {
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default)]
    pub uri: String,
    /// Minimum changed-pixel count considered real motion
    #[serde(default = "default_sensitivity")]
    pub sensitivity: u32,
    /// Maximum mask standard deviation; noisier masks are rejected
    #[serde(default = "default_deviation")]
    pub deviation: u32,
    /// Pre-roll ring length in seconds
    #[serde(default = "default_bufferduration")]
    pub bufferduration: u32,
    /// Seconds the motion sensor stays on after a trigger
    #[serde(default = "default_onduration")]
    pub onduration: u32,
    /// Seconds of video recorded per trigger
    #[serde(default = "default_recordduration")]
    pub recordduration: u32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            uri: String::new(),
            sensitivity: default_sensitivity(),
            deviation: default_deviation(),
            bufferduration: default_bufferduration(),
            onduration: default_onduration(),
            recordduration: default_recordduration(),
            enabled: true,
        }
    }
}

impl MotionConfig {
    /// Enforce `bufferduration < recordduration < onduration` by decrementing
    /// the larger value. Returns true when anything was adjusted.
    pub fn repair_durations(&mut self) -> bool {
        let mut repaired = false;
        if self.recordduration >= self.onduration {
            warn!(
                "Record duration must be lower than on duration. Record duration forced to {}",
                self.onduration.saturating_sub(1)
            );
            self.recordduration = self.onduration.saturating_sub(1);
            repaired = true;
        }
        if self.bufferduration >= self.recordduration {
            warn!(
                "Buffer duration must be lower than record duration. Buffer duration forced to {}",
                self.recordduration.saturating_sub(1)
            );
            self.bufferduration = self.recordduration.saturating_sub(1);
            repaired = true;
        }
        repaired
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecordingsConfig {
    #[serde(default = "default_timelapses_lifetime")]
    pub timelapseslifetime: u32,
    #[serde(default = "default_motions_lifetime")]
    pub motionslifetime: u32,
}

impl Default for RecordingsConfig {
    fn default() -> Self {
        Self {
            timelapseslifetime: default_timelapses_lifetime(),
            motionslifetime: default_motions_lifetime(),
        }
    }
}

fn default_name() -> String {
    "noname".to_string()
}
fn default_timelapse_fps() -> u32 {
    1
}
fn default_codec() -> String {
    "FMP4".to_string()
}
fn default_enabled() -> bool {
    true
}
fn default_sensitivity() -> u32 {
    10
}
fn default_deviation() -> u32 {
    20
}
fn default_bufferduration() -> u32 {
    10
}
fn default_onduration() -> u32 {
    300
}
fn default_recordduration() -> u32 {
    30
}
fn default_timelapses_lifetime() -> u32 {
    7
}
fn default_motions_lifetime() -> u32 {
    14
}

impl Securitymap {
    /// Load the document from disk; a missing file yields the default document
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(raw) => {
                let map = serde_json::from_str(&raw)?;
                debug!("Loaded securitymap from {}", path.display());
                Ok(map)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No securitymap at {}, starting empty", path.display());
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Persist the document atomically (write-then-rename)
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(self)?)?;
        std::fs::rename(&tmp, path)?;
        debug!("Persisted securitymap to {}", path.display());
        Ok(())
    }

    /// Armed notification body with the built-in fallback
    pub fn armed_message(&self) -> &str {
        if self.armed_message.is_empty() {
            "Alarm armed"
        } else {
            &self.armed_message
        }
    }

    /// Disarmed notification body with the built-in fallback
    pub fn disarmed_message(&self) -> &str {
        if self.disarmed_message.is_empty() {
            "Alarm disarmed"
        } else {
            &self.disarmed_message
        }
    }

    /// Look up a zone within a housemode
    pub fn zone(&self, housemode: &str, zone: &str) -> Option<&Zone> {
        self.config
            .get(housemode)
            .and_then(|zones| zones.iter().find(|z| z.zone == zone))
    }

    /// Alarm uuids bound to a housemode/zone pair
    pub fn zone_alarms(&self, housemode: &str, zone: &str) -> Vec<String> {
        self.zone(housemode, zone)
            .map(|z| z.alarms.clone())
            .unwrap_or_default()
    }

    /// First zone of the housemode whose device list contains the uuid
    pub fn find_triggered_zone(&self, housemode: &str, uuid: &str) -> Option<&Zone> {
        self.config
            .get(housemode)?
            .iter()
            .find(|zone| zone.devices.iter().any(|d| d == uuid))
    }
}

/// Shared securitymap guarded by a single mutex; every mutation persists the
/// document to disk while the lock is held, serializing writes.
pub struct SecuritymapStore {
    path: PathBuf,
    map: Mutex<Securitymap>,
}

impl SecuritymapStore {
    /// Load the store, defaulting missing sections and persisting the result
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let map = Securitymap::load(&path)?;
        // recordings defaults are handled by serde; rewrite so a fresh
        // install has a complete document on disk
        map.save(&path)?;
        Ok(Self {
            path,
            map: Mutex::new(map),
        })
    }

    /// Read access under the lock
    pub fn read<R>(&self, f: impl FnOnce(&Securitymap) -> R) -> R {
        f(&self.map.lock())
    }

    /// Mutate and persist under the lock. On persistence failure the
    /// in-memory mutation is kept so a later retry can succeed.
    pub fn mutate<R>(&self, f: impl FnOnce(&mut Securitymap) -> R) -> (R, Result<()>) {
        let mut guard = self.map.lock();
        let out = f(&mut guard);
        let persisted = guard.save(&self.path);
        if let Err(ref e) = persisted {
            warn!("Failed to persist securitymap: {}", e);
        }
        (out, persisted)
    }

    pub fn snapshot(&self) -> Securitymap {
        self.map.lock().clone()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
