use crate::bus::{BusConnection, InventoryClient};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Kinds of user-notification gateways known to the dispatcher
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayKind {
    Sms,
    Smtp,
    Twitter,
    Push,
}

impl GatewayKind {
    pub fn from_devicetype(devicetype: &str) -> Option<Self> {
        match devicetype {
            "smsgateway" => Some(GatewayKind::Sms),
            "smtpgateway" => Some(GatewayKind::Smtp),
            "twittergateway" => Some(GatewayKind::Twitter),
            "pushgateway" => Some(GatewayKind::Push),
            _ => None,
        }
    }
}

/// Default contact details for sms and smtp gateways
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Contacts {
    pub email: String,
    pub phone: String,
}

/// Maps notification-device uuids to gateway kinds and formats the outbound
/// alarm messages. The gateway table and contacts are refreshed periodically.
pub struct GatewayDispatcher {
    bus: BusConnection,
    inventory: Arc<dyn InventoryClient>,
    gateways: Mutex<HashMap<String, GatewayKind>>,
    contacts: Mutex<Contacts>,
}

impl GatewayDispatcher {
    pub fn new(bus: BusConnection, inventory: Arc<dyn InventoryClient>) -> Self {
        Self {
            bus,
            inventory,
            gateways: Mutex::new(HashMap::new()),
            contacts: Mutex::new(Contacts::default()),
        }
    }

    /// Rebuild the gateway table from the inventory (read-copy-update)
    pub async fn refresh_gateways(&self) {
        let inventory = match self.inventory.fetch().await {
            Ok(inventory) => inventory,
            Err(e) => {
                warn!("Failed to fetch inventory for gateway refresh: {}", e);
                return;
            }
        };

        let mut fresh = HashMap::new();
        for (uuid, device) in &inventory.devices {
            if !inventory
                .notification_kinds
                .iter()
                .any(|kind| kind == &device.devicetype)
            {
                continue;
            }
            if let Some(kind) = GatewayKind::from_devicetype(&device.devicetype) {
                trace!(
                    "Found alert {} with uuid {} [name={}]",
                    device.devicetype,
                    uuid,
                    device.name
                );
                fresh.insert(uuid.clone(), kind);
            }
        }

        debug!("Refreshed {} alert gateways", fresh.len());
        *self.gateways.lock() = fresh;
    }

    /// Update the default contact details
    pub fn refresh_contacts(&self, email: String, phone: String) {
        let mut contacts = self.contacts.lock();
        if contacts.email != email {
            debug!("Default email changed (now {})", email);
        }
        if contacts.phone != phone {
            debug!("Default phone number changed (now {})", phone);
        }
        *contacts = Contacts { email, phone };
    }

    pub fn gateway_kind(&self, uuid: &str) -> Option<GatewayKind> {
        self.gateways.lock().get(uuid).copied()
    }

    /// Build the outbound message for one notification device.
    ///
    /// Devices absent from the gateway table are treated as plain switches.
    /// Returns `None` when the message must be suppressed because the
    /// required contact detail is unset.
    pub fn build_alarm_message(&self, zone: &str, uuid: &str, message: &str) -> Option<Value> {
        let body = format!("{}[{}]", message, zone);
        match self.gateway_kind(uuid) {
            Some(GatewayKind::Sms) => {
                let contacts = self.contacts.lock();
                if contacts.phone.is_empty() {
                    warn!(
                        "Trying to send alert to undefined phone number. \
                         You must configure a default one in system config"
                    );
                    return None;
                }
                Some(json!({
                    "command": "sendsms",
                    "uuid": uuid,
                    "to": contacts.phone.clone(),
                    "text": body,
                }))
            }
            Some(GatewayKind::Smtp) => {
                let contacts = self.contacts.lock();
                if contacts.email.is_empty() {
                    warn!(
                        "Trying to send alert to undefined email address. \
                         You must configure a default one in system config"
                    );
                    return None;
                }
                Some(json!({
                    "command": "sendmail",
                    "uuid": uuid,
                    "to": contacts.email.clone(),
                    "subject": "Homeguard security",
                    "body": body,
                }))
            }
            Some(GatewayKind::Twitter) => Some(json!({
                "command": "sendtweet",
                "uuid": uuid,
                "tweet": body,
            })),
            Some(GatewayKind::Push) => Some(json!({
                "command": "sendpush",
                "uuid": uuid,
                "message": body,
            })),
            None => Some(json!({
                "command": "on",
                "uuid": uuid,
            })),
        }
    }

    /// Send one alarm notification over the bus
    pub fn send_alarm(&self, zone: &str, uuid: &str, message: &str) {
        if let Some(content) = self.build_alarm_message(zone, uuid, message) {
            debug!("sendAlarm: notify uuid='{}' {}", uuid, content);
            self.bus.send_message(content);
        }
    }

    /// Fan the message out to every alarm uuid of the zone
    pub fn fan_out(&self, zone: &str, alarms: &[String], message: &str) {
        for uuid in alarms {
            self.send_alarm(zone, uuid, message);
        }
    }
}
