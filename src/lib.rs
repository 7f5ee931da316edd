// Bus surface and shared primitives
pub mod bus;
pub mod config;
pub mod error;
pub mod securitymap;

// Alarm state machine and notification fan-out
pub mod alarm;

// Camera capture, workers and recordings
pub mod video;

// Application coordination
pub mod controller;

// Re-export common types at the crate root
pub use alarm::{AlarmEngine, GatewayDispatcher, GatewayKind, TriggerStatus};
pub use bus::{
    BusConnection, BusEnvelope, BusEvent, BusReceiver, Command, CommandResponse, Inventory,
    InventoryClient, CONTROLLER_ID,
};
pub use config::HomeguardConfig;
pub use controller::SecurityController;
pub use error::{HomeguardError, Result};
pub use securitymap::{MotionConfig, Securitymap, SecuritymapStore, TimelapseConfig, Zone};
pub use video::frame::Frame;
pub use video::provider::{FrameConsumer, FrameProvider, ProviderRegistry};
pub use video::supervisor::WorkerSupervisor;
