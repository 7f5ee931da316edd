use crate::error::{BusError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, trace, warn};

/// Internal id of the controller device on the bus
pub const CONTROLLER_ID: &str = "securitycontroller";

/// Events flowing over the message bus, typed per wire subject
#[derive(Debug, Clone, PartialEq)]
pub enum BusEvent {
    /// The active housemode changed
    HousemodeChanged { housemode: String },
    /// An alarm countdown started for a zone
    CountdownStarted { delay: i64, zone: String },
    /// A countdown tick with the remaining delay
    Countdown { delay: i64, zone: String },
    /// A countdown expired without cancellation
    IntruderAlert { zone: String },
    /// A countdown was cancelled before expiry
    AlarmCancelled { zone: String },
    /// A sounding alarm was disabled
    AlarmStopped,
    /// A device changed state (sensors in, motion sensors out)
    StateChanged { uuid: String, level: i64 },
    /// A security sensor fired
    SensorTriggered { uuid: String, level: i64 },
    /// A snapshot picture was written by a motion worker
    PictureAvailable { uuid: String, filename: String },
    /// A motion recording was finalized
    VideoAvailable { uuid: String, filename: String },
    /// Wall-clock minute tick
    TimeChanged { hour: u32, minute: u32 },
    /// A device was renamed through the inventory
    DeviceNameChanged { uuid: String, name: String },
}

impl BusEvent {
    /// Wire subject for this event
    pub fn subject(&self) -> &'static str {
        match self {
            BusEvent::HousemodeChanged { .. } => "event.security.housemodechanged",
            BusEvent::CountdownStarted { .. } => "event.security.countdown.started",
            BusEvent::Countdown { .. } => "event.security.countdown",
            BusEvent::IntruderAlert { .. } => "event.security.intruderalert",
            BusEvent::AlarmCancelled { .. } => "event.security.alarmcancelled",
            BusEvent::AlarmStopped => "event.security.alarmstopped",
            BusEvent::StateChanged { .. } => "event.device.statechanged",
            BusEvent::SensorTriggered { .. } => "event.security.sensortriggered",
            BusEvent::PictureAvailable { .. } => "event.device.pictureavailable",
            BusEvent::VideoAvailable { .. } => "event.device.videoavailable",
            BusEvent::TimeChanged { .. } => "event.environment.timechanged",
            BusEvent::DeviceNameChanged { .. } => "event.system.devicenamechanged",
        }
    }
}

/// An event together with the internal id of the emitting device
#[derive(Debug, Clone, PartialEq)]
pub struct BusEnvelope {
    pub source: String,
    pub event: BusEvent,
}

/// A command addressed to a device on the bus
#[derive(Debug, Clone)]
pub struct Command {
    pub internalid: String,
    pub command: String,
    pub params: serde_json::Map<String, Value>,
}

impl Command {
    pub fn new(internalid: &str, command: &str) -> Self {
        Self {
            internalid: internalid.to_string(),
            command: command.to_string(),
            params: serde_json::Map::new(),
        }
    }

    pub fn param(mut self, key: &str, value: Value) -> Self {
        self.params.insert(key.to_string(), value);
        self
    }

    pub fn str_param(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(Value::as_str)
    }

    pub fn int_param(&self, key: &str) -> Option<i64> {
        self.params.get(key).and_then(Value::as_i64)
    }

    pub fn bool_param(&self, key: &str) -> Option<bool> {
        self.params.get(key).and_then(Value::as_bool)
    }
}

/// Command response envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResponse {
    pub result: ResponseResult,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseResult {
    Success,
    Error,
}

impl CommandResponse {
    pub fn success() -> Self {
        Self {
            result: ResponseResult::Success,
            code: None,
            message: None,
            data: None,
        }
    }

    pub fn success_message(message: &str) -> Self {
        Self {
            message: Some(message.to_string()),
            ..Self::success()
        }
    }

    pub fn success_data(data: Value) -> Self {
        Self {
            data: Some(data),
            ..Self::success()
        }
    }

    pub fn success_message_data(message: &str, data: Value) -> Self {
        Self {
            message: Some(message.to_string()),
            data: Some(data),
            ..Self::success()
        }
    }

    pub fn error(code: &str, message: &str) -> Self {
        Self {
            result: ResponseResult::Error,
            code: Some(code.to_string()),
            message: Some(message.to_string()),
            data: None,
        }
    }

    pub fn error_data(code: &str, message: &str, data: Value) -> Self {
        Self {
            data: Some(data),
            ..Self::error(code, message)
        }
    }

    pub fn unknown_command() -> Self {
        Self::error("unknown-command", "Unknown command")
    }

    pub fn missing_parameter(name: &str) -> Self {
        Self::error(
            "error.parameter.missing",
            &format!("Missing parameter '{}'", name),
        )
    }

    pub fn is_success(&self) -> bool {
        self.result == ResponseResult::Success
    }
}

/// In-process message bus connection.
///
/// The transport itself is an external collaborator; this connection models
/// its surface: event broadcast, fire-and-forget outbound messages, the
/// command/reply channel, a device registry and global variables.
#[derive(Clone)]
pub struct BusConnection {
    events: broadcast::Sender<BusEnvelope>,
    outbound: mpsc::UnboundedSender<Value>,
    commands: mpsc::UnboundedSender<(Command, oneshot::Sender<CommandResponse>)>,
    devices: Arc<Mutex<HashMap<String, String>>>,
    globals: Arc<Mutex<HashMap<String, String>>>,
}

/// Receiving half handed to the controller at startup
pub struct BusReceiver {
    pub outbound: mpsc::UnboundedReceiver<Value>,
    pub commands: mpsc::UnboundedReceiver<(Command, oneshot::Sender<CommandResponse>)>,
}

impl BusConnection {
    /// Create a bus connection and its controller-side receiver
    pub fn new(capacity: usize) -> (Self, BusReceiver) {
        let (events, _) = broadcast::channel(capacity);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        (
            Self {
                events,
                outbound: outbound_tx,
                commands: commands_tx,
                devices: Arc::new(Mutex::new(HashMap::new())),
                globals: Arc::new(Mutex::new(HashMap::new())),
            },
            BusReceiver {
                outbound: outbound_rx,
                commands: commands_rx,
            },
        )
    }

    /// Subscribe to all bus events
    pub fn subscribe(&self) -> broadcast::Receiver<BusEnvelope> {
        self.events.subscribe()
    }

    /// Emit an event from the named device
    pub fn emit(&self, source: &str, event: BusEvent) {
        trace!("emit {} from '{}'", event.subject(), source);
        // no subscribers is not an error, events are fire-and-forget
        let _ = self.events.send(BusEnvelope {
            source: source.to_string(),
            event,
        });
    }

    /// Send an outbound message with no reply expectation
    pub fn send_message(&self, content: Value) {
        trace!("send message {}", content);
        if self.outbound.send(content).is_err() {
            warn!("Outbound message dropped, bus receiver is gone");
        }
    }

    /// Send a command and wait for the controller's response
    pub async fn send_command(&self, command: Command) -> Result<CommandResponse> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send((command, tx))
            .map_err(|_| BusError::ChannelClosed)?;
        rx.await.map_err(|_| BusError::ChannelClosed.into())
    }

    /// Register a device on the bus
    pub fn add_device(&self, internalid: &str, devicetype: &str) {
        debug!("Registering device '{}' ({})", internalid, devicetype);
        self.devices
            .lock()
            .insert(internalid.to_string(), devicetype.to_string());
    }

    /// Deregister a device from the bus
    pub fn remove_device(&self, internalid: &str) {
        debug!("Deregistering device '{}'", internalid);
        self.devices.lock().remove(internalid);
    }

    /// Check whether a device is registered
    pub fn has_device(&self, internalid: &str) -> bool {
        self.devices.lock().contains_key(internalid)
    }

    /// Publish a global variable
    pub fn set_global_variable(&self, name: &str, value: &str) {
        self.globals
            .lock()
            .insert(name.to_string(), value.to_string());
    }

    /// Read a global variable
    pub fn global_variable(&self, name: &str) -> Option<String> {
        self.globals.lock().get(name).cloned()
    }
}

/// Inventory snapshot used to resolve alert gateways
#[derive(Debug, Clone, Default)]
pub struct Inventory {
    /// Device types belonging to the usernotification category
    pub notification_kinds: Vec<String>,
    /// All known devices, keyed by uuid
    pub devices: HashMap<String, DeviceEntry>,
}

#[derive(Debug, Clone)]
pub struct DeviceEntry {
    pub devicetype: String,
    pub name: String,
}

/// Source of inventory snapshots (external service at the boundary)
#[async_trait]
pub trait InventoryClient: Send + Sync {
    async fn fetch(&self) -> Result<Inventory>;
}

/// Inventory client returning an empty inventory, for standalone operation
pub struct EmptyInventory;

#[async_trait]
impl InventoryClient for EmptyInventory {
    async fn fetch(&self) -> Result<Inventory> {
        Ok(Inventory::default())
    }
}

/// Fixed inventory snapshot, useful for embedding and tests
pub struct StaticInventory(pub Inventory);

#[async_trait]
impl InventoryClient for StaticInventory {
    async fn fetch(&self) -> Result<Inventory> {
        Ok(self.0.clone())
    }
}
