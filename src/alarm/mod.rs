pub mod engine;
pub mod gateway;

pub use engine::{AlarmEngine, CurrentAlarm, TriggerStatus};
pub use gateway::{Contacts, GatewayDispatcher, GatewayKind};
