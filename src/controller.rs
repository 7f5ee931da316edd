use crate::alarm::{AlarmEngine, GatewayDispatcher, TriggerStatus};
use crate::bus::{
    BusConnection, BusEnvelope, BusEvent, BusReceiver, Command, CommandResponse, InventoryClient,
    CONTROLLER_ID,
};
use crate::config::{save_pin, HomeguardConfig};
use crate::error::Result;
use crate::securitymap::{MotionConfig, SecuritymapStore, TimelapseConfig, Zone};
use crate::video::capture::CaptureBackend;
use crate::video::overlay::OverlayRenderer;
use crate::video::provider::ProviderRegistry;
use crate::video::recordings::{list_recordings, purge_expired};
use crate::video::supervisor::WorkerSupervisor;
use crate::video::writer::WriterBackend;
use crate::video::WorkerEnv;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// The `securitycontroller` bus entity: routes commands to the alarm engine
/// and the worker supervisor and consumes the inbound event stream.
pub struct SecurityController {
    bus: BusConnection,
    config_path: PathBuf,
    pin: Mutex<String>,
    store: Arc<SecuritymapStore>,
    dispatcher: Arc<GatewayDispatcher>,
    engine: Arc<AlarmEngine>,
    supervisor: Arc<WorkerSupervisor>,
    registry: Arc<ProviderRegistry>,
    recordings_dir: PathBuf,
}

impl SecurityController {
    /// Build and start the controller: load the securitymap, refresh the
    /// gateways, register the device and launch the configured workers.
    pub async fn new(
        config: &HomeguardConfig,
        config_path: PathBuf,
        bus: BusConnection,
        inventory: Arc<dyn InventoryClient>,
        capture: Arc<dyn CaptureBackend>,
        writers: Arc<dyn WriterBackend>,
    ) -> Result<Self> {
        let store = Arc::new(SecuritymapStore::open(config.securitymap_path())?);
        if let Some(housemode) = store.read(|map| map.housemode.clone()) {
            debug!("Current house mode: {}", housemode);
            bus.set_global_variable("housemode", &housemode);
        }

        let dispatcher = Arc::new(GatewayDispatcher::new(bus.clone(), inventory));
        dispatcher.refresh_gateways().await;
        dispatcher.refresh_contacts(config.system.email.clone(), config.system.phone.clone());

        let engine = Arc::new(AlarmEngine::new(
            bus.clone(),
            Arc::clone(&store),
            Arc::clone(&dispatcher),
        ));

        let registry = Arc::new(ProviderRegistry::new(
            capture,
            config.video.consumer_queue_depth,
        ));
        let recordings_dir = config.recordings_dir();
        std::fs::create_dir_all(&recordings_dir)?;

        let supervisor = Arc::new(WorkerSupervisor::new(WorkerEnv {
            bus: bus.clone(),
            registry: Arc::clone(&registry),
            writers,
            recordings_dir: recordings_dir.clone(),
            snapshot_dir: PathBuf::from(&config.paths.snapshot_dir),
            overlay: Arc::new(OverlayRenderer::from_path(&config.video.overlay_font_path)),
        }));

        bus.add_device(CONTROLLER_ID, "securitycontroller");

        let snapshot = store.snapshot();
        supervisor.launch_all(&snapshot).await;

        Ok(Self {
            bus,
            config_path,
            pin: Mutex::new(config.security.pin.clone()),
            store,
            dispatcher,
            engine,
            supervisor,
            registry,
            recordings_dir,
        })
    }

    /// Main loop: handle bus events and commands until shutdown
    pub async fn run(&self, mut receiver: BusReceiver, shutdown: CancellationToken) {
        let mut events = self.bus.subscribe();
        info!("Security controller running");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                envelope = events.recv() => match envelope {
                    Ok(envelope) => self.handle_event(envelope).await,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Controller lagged behind by {} events", n);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
                command = receiver.commands.recv() => match command {
                    Some((command, reply)) => {
                        let response = self.handle_command(command).await;
                        let _ = reply.send(response);
                    }
                    None => break,
                },
            }
        }

        self.cleanup().await;
    }

    /// Stop workers and providers on shutdown
    pub async fn cleanup(&self) {
        info!("Security controller shutting down");
        self.supervisor.stop_all().await;
        self.registry.stop_all().await;
    }

    /// Inbound event intake
    pub async fn handle_event(&self, envelope: BusEnvelope) {
        match envelope.event {
            BusEvent::StateChanged { uuid, level }
            | BusEvent::SensorTriggered { uuid, level } => {
                self.engine.handle_sensor_event(&uuid, level);
            }
            BusEvent::TimeChanged { hour, minute } => {
                self.handle_time_changed(hour, minute).await;
            }
            BusEvent::DeviceNameChanged { uuid, name } => {
                self.handle_device_renamed(&uuid, &name).await;
            }
            _ => {}
        }
    }

    async fn handle_time_changed(&self, hour: u32, minute: u32) {
        // refresh gateway list and contacts every 5 minutes
        if minute % 5 == 0 {
            self.dispatcher.refresh_gateways().await;
            match HomeguardConfig::load_from_file(&self.config_path) {
                Ok(config) => {
                    self.dispatcher
                        .refresh_contacts(config.system.email, config.system.phone);
                    *self.pin.lock() = config.security.pin;
                }
                Err(e) => warn!("Failed to reload configuration: {}", e),
            }
        }

        // midnight: rotate timelapse files and purge expired recordings
        if hour == 0 && minute == 0 {
            let snapshot = self.store.snapshot();
            self.supervisor.restart_timelapses(&snapshot).await;
            purge_expired(
                &self.recordings_dir,
                "timelapse_",
                snapshot.recordings.timelapseslifetime,
            );
            purge_expired(
                &self.recordings_dir,
                "motion_",
                snapshot.recordings.motionslifetime,
            );
        }
    }

    async fn handle_device_renamed(&self, internalid: &str, name: &str) {
        enum Renamed {
            Motion(MotionConfig),
            Timelapse(TimelapseConfig),
        }

        let known = self.store.read(|map| {
            map.motions.contains_key(internalid) || map.timelapses.contains_key(internalid)
        });
        if !known {
            error!(
                "devicenamechanged event: no device '{}' found, unable to rename",
                internalid
            );
            return;
        }

        let (renamed, persisted) = self.store.mutate(|map| {
            if let Some(motion) = map.motions.get_mut(internalid) {
                motion.name = name.to_string();
                Some(Renamed::Motion(motion.clone()))
            } else if let Some(timelapse) = map.timelapses.get_mut(internalid) {
                timelapse.name = name.to_string();
                Some(Renamed::Timelapse(timelapse.clone()))
            } else {
                None
            }
        });
        if let Err(e) = persisted {
            error!("devicenamechanged: cannot save securitymap: {}", e);
        }

        match renamed {
            Some(Renamed::Motion(config)) => {
                debug!("Device '{}' renamed to '{}', restarting motion", internalid, name);
                self.supervisor.restart_motion(internalid, config).await;
            }
            Some(Renamed::Timelapse(config)) => {
                debug!(
                    "Device '{}' renamed to '{}', restarting timelapse",
                    internalid, name
                );
                self.supervisor.restart_timelapse(internalid, config).await;
            }
            None => {}
        }
    }

    fn check_pin(&self, candidate: &str) -> bool {
        HomeguardConfig::pin_matches(&self.pin.lock(), candidate)
    }

    /// Command handler for the `securitycontroller` device
    pub async fn handle_command(&self, command: Command) -> CommandResponse {
        trace!("Handling command: {:?}", command);

        if command.internalid != CONTROLLER_ID {
            // motion and timelapse devices accept no direct commands
            return CommandResponse::unknown_command();
        }

        match command.command.as_str() {
            "sethousemode" => self.cmd_sethousemode(&command),
            "gethousemode" => self.cmd_gethousemode(),
            "triggerzone" => self.cmd_triggerzone(&command),
            "cancelalarm" => self.cmd_cancelalarm(&command),
            "getconfig" => self.cmd_getconfig(),
            "setconfig" => self.cmd_setconfig(&command),
            "checkpin" => self.cmd_checkpin(&command),
            "setpin" => self.cmd_setpin(&command),
            "getalarmstate" => self.cmd_getalarmstate(),
            "addtimelapse" => self.cmd_addtimelapse(&command).await,
            "gettimelapses" => self.cmd_gettimelapses(),
            "addmotion" => self.cmd_addmotion(&command).await,
            "getmotions" => self.cmd_getmotions(),
            "getrecordingsconfig" => self.cmd_getrecordingsconfig(),
            "setrecordingsconfig" => self.cmd_setrecordingsconfig(&command),
            _ => CommandResponse::unknown_command(),
        }
    }

    fn cmd_sethousemode(&self, command: &Command) -> CommandResponse {
        let Some(housemode) = command.str_param("housemode") else {
            return CommandResponse::missing_parameter("housemode");
        };
        let Some(pin) = command.str_param("pin") else {
            return CommandResponse::missing_parameter("pin");
        };

        if !self.check_pin(pin) {
            error!("Command 'sethousemode': invalid pin");
            let current = self
                .store
                .read(|map| map.housemode.clone())
                .unwrap_or_default();
            return CommandResponse::error_data(
                "error.security.invalidpin",
                "Invalid pin specified",
                json!({ "housemode": current }),
            );
        }

        match self.engine.change_housemode(housemode) {
            Ok(()) => CommandResponse::success_message("Housemode changed"),
            Err(e) => {
                error!("Command 'sethousemode': cannot write securitymap: {}", e);
                CommandResponse::error("error.failed", "Cannot write config file")
            }
        }
    }

    fn cmd_gethousemode(&self) -> CommandResponse {
        match self.store.read(|map| map.housemode.clone()) {
            Some(housemode) => CommandResponse::success_data(json!({ "housemode": housemode })),
            None => {
                warn!("Command 'gethousemode': no housemode set");
                CommandResponse::error("error.security.housemodenotset", "No housemode set")
            }
        }
    }

    fn cmd_triggerzone(&self, command: &Command) -> CommandResponse {
        let Some(zone) = command.str_param("zone") else {
            return CommandResponse::missing_parameter("zone");
        };
        let housemode = self
            .store
            .read(|map| map.housemode.clone())
            .unwrap_or_default();

        match self.engine.trigger_zone(zone, &housemode) {
            TriggerStatus::Ok | TriggerStatus::OkInactiveZone => CommandResponse::success(),
            TriggerStatus::KoAlarmAlreadyRunning => {
                CommandResponse::success_message("Alarm thread is already running")
            }
            TriggerStatus::KoAlarmFailed => {
                error!("Command 'triggerzone': failed to start alarm countdown");
                CommandResponse::error(
                    "error.security.alarmthreadfailed",
                    "Failed to start alarm thread",
                )
            }
            TriggerStatus::KoConfigInfoMissing | TriggerStatus::KoInvalidConfig => {
                error!("Command 'triggerzone': invalid configuration file content");
                CommandResponse::error("error.security.invalidconfig", "Invalid config")
            }
        }
    }

    fn cmd_cancelalarm(&self, command: &Command) -> CommandResponse {
        let Some(pin) = command.str_param("pin") else {
            return CommandResponse::missing_parameter("pin");
        };
        if !self.check_pin(pin) {
            error!("Command 'cancelalarm': invalid pin specified");
            return CommandResponse::error("error.security.invalidpin", "Invalid pin specified");
        }

        if !self.engine.is_activated() {
            error!("Command 'cancelalarm': no alarm is running");
            return CommandResponse::error(
                "error.security.alarmthreadcancelfailed",
                "No alarm running",
            );
        }

        if self.engine.is_counting() {
            match self.engine.cancel_countdown() {
                Ok(()) => {
                    info!("Command 'cancelalarm': alarm cancelled");
                    CommandResponse::success_message("Alarm cancelled")
                }
                Err(_) => {
                    error!("Command 'cancelalarm': cannot cancel alarm countdown");
                    CommandResponse::error(
                        "error.security.alarmthreadcancelfailed",
                        "Cannot cancel alarm thread",
                    )
                }
            }
        } else {
            // countdown is over, the alarm is sounding
            let current = self.engine.current_alarm().unwrap_or_default();
            self.engine
                .disable_alarm(&current.zone, &current.housemode);
            info!("Command 'cancelalarm': alarm disabled");
            CommandResponse::success_message("Alarm disabled")
        }
    }

    fn cmd_getconfig(&self) -> CommandResponse {
        self.store.read(|map| {
            CommandResponse::success_data(json!({
                "config": &map.config,
                "armedMessage": &map.armed_message,
                "disarmedMessage": &map.disarmed_message,
                "defaultHousemode": map.default_housemode.clone().unwrap_or_default(),
                "housemode": map.housemode.clone().unwrap_or_default(),
            }))
        })
    }

    fn cmd_setconfig(&self, command: &Command) -> CommandResponse {
        let Some(config_value) = command.params.get("config") else {
            return CommandResponse::missing_parameter("config");
        };
        let Some(armed) = command.str_param("armedMessage") else {
            return CommandResponse::missing_parameter("armedMessage");
        };
        let Some(disarmed) = command.str_param("disarmedMessage") else {
            return CommandResponse::missing_parameter("disarmedMessage");
        };
        let Some(default_housemode) = command.str_param("defaultHousemode") else {
            return CommandResponse::missing_parameter("defaultHousemode");
        };
        let Some(pin) = command.str_param("pin") else {
            return CommandResponse::missing_parameter("pin");
        };

        if !self.check_pin(pin) {
            error!("Command 'setconfig': invalid pin");
            return CommandResponse::error("error.security.invalidpin", "Invalid pin specified");
        }

        let zones: BTreeMap<String, Vec<Zone>> =
            match serde_json::from_value(config_value.clone()) {
                Ok(zones) => zones,
                Err(e) => {
                    error!("Command 'setconfig': malformed zone config: {}", e);
                    return CommandResponse::error("error.security.invalidconfig", "Invalid config");
                }
            };

        let (_, persisted) = self.store.mutate(|map| {
            map.config = zones;
            map.armed_message = armed.to_string();
            map.disarmed_message = disarmed.to_string();
            map.default_housemode = if default_housemode.is_empty() {
                None
            } else {
                Some(default_housemode.to_string())
            };
        });

        match persisted {
            Ok(()) => CommandResponse::success(),
            Err(e) => {
                error!("Command 'setconfig': cannot save securitymap: {}", e);
                CommandResponse::error("error.security.setzones", "Cannot save securitymap")
            }
        }
    }

    fn cmd_checkpin(&self, command: &Command) -> CommandResponse {
        let Some(pin) = command.str_param("pin") else {
            return CommandResponse::missing_parameter("pin");
        };
        if self.check_pin(pin) {
            CommandResponse::success()
        } else {
            warn!("Command 'checkpin': invalid pin");
            CommandResponse::error("error.security.invalidpin", "Invalid pin specified")
        }
    }

    fn cmd_setpin(&self, command: &Command) -> CommandResponse {
        let Some(pin) = command.str_param("pin") else {
            return CommandResponse::missing_parameter("pin");
        };
        let Some(newpin) = command.str_param("newpin") else {
            return CommandResponse::missing_parameter("newpin");
        };

        if !self.check_pin(pin) {
            warn!("Command 'setpin': invalid pin");
            return CommandResponse::error("error.security.invalidpin", "Invalid pin specified");
        }

        match save_pin(&self.config_path, newpin) {
            Ok(()) => {
                *self.pin.lock() = newpin.to_string();
                CommandResponse::success()
            }
            Err(e) => {
                error!("Command 'setpin': unable to save pin: {}", e);
                CommandResponse::error("error.security.setpin", "Unable to save new pin code")
            }
        }
    }

    fn cmd_getalarmstate(&self) -> CommandResponse {
        CommandResponse::success_data(json!({
            "alarmactivated": self.engine.is_activated(),
            "countdown": self.engine.is_counting(),
        }))
    }

    async fn cmd_addtimelapse(&self, command: &Command) -> CommandResponse {
        let Some(uri) = command.str_param("uri") else {
            return CommandResponse::missing_parameter("uri");
        };
        let Some(fps) = command.int_param("fps") else {
            return CommandResponse::missing_parameter("fps");
        };
        let Some(codec) = command.str_param("codec") else {
            return CommandResponse::missing_parameter("codec");
        };
        let Some(enabled) = command.bool_param("enabled") else {
            return CommandResponse::missing_parameter("enabled");
        };

        let duplicate = self
            .store
            .read(|map| map.timelapses.values().any(|t| t.uri == uri));
        if duplicate {
            return CommandResponse::error(
                "error.security.addtimelapse",
                "Timelapse already exists",
            );
        }

        let timelapse = TimelapseConfig {
            name: command.str_param("name").unwrap_or("noname").to_string(),
            uri: uri.to_string(),
            fps: fps.max(1) as u32,
            codec: codec.to_string(),
            enabled,
        };

        let internalid = uuid::Uuid::new_v4().to_string();
        let (_, persisted) = self.store.mutate(|map| {
            map.timelapses.insert(internalid.clone(), timelapse.clone());
        });
        if let Err(e) = persisted {
            error!("Command 'addtimelapse': cannot save securitymap: {}", e);
            return CommandResponse::error("error.security.addtimelapse", "Cannot save config");
        }

        debug!("Command 'addtimelapse': timelapse added {:?}", timelapse);
        self.supervisor
            .launch_timelapse(&internalid, timelapse)
            .await;
        CommandResponse::success_message_data("Timelapse added", json!({ "internalid": internalid }))
    }

    fn cmd_gettimelapses(&self) -> CommandResponse {
        let timelapses = list_recordings(&self.recordings_dir, "timelapse_");
        CommandResponse::success_data(json!({ "timelapses": timelapses }))
    }

    async fn cmd_addmotion(&self, command: &Command) -> CommandResponse {
        let Some(uri) = command.str_param("uri") else {
            return CommandResponse::missing_parameter("uri");
        };
        let Some(sensitivity) = command.int_param("sensitivity") else {
            return CommandResponse::missing_parameter("sensitivity");
        };
        let Some(deviation) = command.int_param("deviation") else {
            return CommandResponse::missing_parameter("deviation");
        };
        let Some(bufferduration) = command.int_param("bufferduration") else {
            return CommandResponse::missing_parameter("bufferduration");
        };
        let Some(onduration) = command.int_param("onduration") else {
            return CommandResponse::missing_parameter("onduration");
        };
        let Some(recordduration) = command.int_param("recordduration") else {
            return CommandResponse::missing_parameter("recordduration");
        };
        let Some(enabled) = command.bool_param("enabled") else {
            return CommandResponse::missing_parameter("enabled");
        };

        let duplicate = self
            .store
            .read(|map| map.motions.values().any(|m| m.uri == uri));
        if duplicate {
            return CommandResponse::error("error.security.addmotion", "Motion already exists");
        }

        let mut motion = MotionConfig {
            name: command.str_param("name").unwrap_or("noname").to_string(),
            uri: uri.to_string(),
            sensitivity: sensitivity.max(0) as u32,
            deviation: deviation.max(0) as u32,
            bufferduration: bufferduration.max(0) as u32,
            onduration: onduration.max(0) as u32,
            recordduration: recordduration.max(0) as u32,
            enabled,
        };
        motion.repair_durations();

        let internalid = uuid::Uuid::new_v4().to_string();
        let (_, persisted) = self.store.mutate(|map| {
            map.motions.insert(internalid.clone(), motion.clone());
        });
        if let Err(e) = persisted {
            error!("Command 'addmotion': cannot save securitymap: {}", e);
            return CommandResponse::error("error.security.addmotion", "Cannot save config");
        }

        debug!("Command 'addmotion': motion added {:?}", motion);
        self.supervisor.launch_motion(&internalid, motion).await;
        CommandResponse::success_message_data("Motion added", json!({ "internalid": internalid }))
    }

    fn cmd_getmotions(&self) -> CommandResponse {
        let motions = list_recordings(&self.recordings_dir, "motion_");
        CommandResponse::success_data(json!({ "motions": motions }))
    }

    fn cmd_getrecordingsconfig(&self) -> CommandResponse {
        let config = self.store.read(|map| map.recordings.clone());
        CommandResponse::success_data(json!({ "config": config }))
    }

    fn cmd_setrecordingsconfig(&self, command: &Command) -> CommandResponse {
        let Some(timelapses_lifetime) = command.int_param("timelapseslifetime") else {
            return CommandResponse::missing_parameter("timelapseslifetime");
        };
        let Some(motions_lifetime) = command.int_param("motionslifetime") else {
            return CommandResponse::missing_parameter("motionslifetime");
        };

        let (_, persisted) = self.store.mutate(|map| {
            map.recordings.timelapseslifetime = timelapses_lifetime.max(0) as u32;
            map.recordings.motionslifetime = motions_lifetime.max(0) as u32;
        });

        match persisted {
            Ok(()) => {
                debug!("Command 'setrecordingsconfig': recordings config stored");
                CommandResponse::success()
            }
            Err(e) => {
                error!("Command 'setrecordingsconfig': cannot save securitymap: {}", e);
                CommandResponse::error("error.security.setrecordingsconfig", "Cannot save config")
            }
        }
    }

    pub fn store(&self) -> &Arc<SecuritymapStore> {
        &self.store
    }

    pub fn dispatcher(&self) -> &Arc<GatewayDispatcher> {
        &self.dispatcher
    }

    pub fn engine(&self) -> &Arc<AlarmEngine> {
        &self.engine
    }

    pub fn supervisor(&self) -> &Arc<WorkerSupervisor> {
        &self.supervisor
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{DeviceEntry, Inventory, StaticInventory};
    use crate::securitymap::Securitymap;
    use crate::video::testutil::{static_frames, RecordingWriterBackend, ScriptedBackend};
    use serde_json::Value;
    use std::collections::HashMap;
    use std::time::Duration;
    use tokio::sync::broadcast;

    struct Fixture {
        controller: SecurityController,
        events: broadcast::Receiver<BusEnvelope>,
        outbound: tokio::sync::mpsc::UnboundedReceiver<Value>,
        config_path: PathBuf,
        _dir: tempfile::TempDir,
    }

    async fn fixture(
        inventory: Inventory,
        phone: &str,
        configure: impl FnOnce(&mut Securitymap),
    ) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let mut config = HomeguardConfig::default();
        config.paths.config_dir = dir.path().join("config").to_string_lossy().to_string();
        config.paths.state_dir = dir.path().join("state").to_string_lossy().to_string();
        config.paths.snapshot_dir = dir.path().to_string_lossy().to_string();
        config.system.phone = phone.to_string();
        config.system.email = String::new();
        let config_path = dir.path().join("homeguard.toml");

        // seed the persisted securitymap before the controller starts
        {
            let store = SecuritymapStore::open(config.securitymap_path()).unwrap();
            let (_, persisted) = store.mutate(configure);
            persisted.unwrap();
        }

        let (bus, rx) = BusConnection::new(512);
        let events = bus.subscribe();
        let controller = SecurityController::new(
            &config,
            config_path.clone(),
            bus,
            Arc::new(StaticInventory(inventory)),
            Arc::new(ScriptedBackend {
                width: 32,
                height: 24,
                fps: 10,
                generator: static_frames,
            }),
            Arc::new(RecordingWriterBackend::default()),
        )
        .await
        .unwrap();

        Fixture {
            controller,
            events,
            outbound: rx.outbound,
            config_path,
            _dir: dir,
        }
    }

    fn night_perimeter(map: &mut Securitymap, delay: i16, alarms: &[&str]) {
        map.housemode = Some("night".to_string());
        map.config.insert(
            "night".to_string(),
            vec![Zone {
                zone: "perimeter".to_string(),
                delay,
                devices: vec!["d1".to_string()],
                alarms: alarms.iter().map(|a| a.to_string()).collect(),
            }],
        );
    }

    fn sms_inventory(uuid: &str) -> Inventory {
        let mut devices = HashMap::new();
        devices.insert(
            uuid.to_string(),
            DeviceEntry {
                devicetype: "smsgateway".to_string(),
                name: "sms".to_string(),
            },
        );
        Inventory {
            notification_kinds: vec!["smsgateway".to_string()],
            devices,
        }
    }

    async fn next_event(events: &mut broadcast::Receiver<BusEnvelope>) -> BusEvent {
        tokio::time::timeout(Duration::from_secs(60), events.recv())
            .await
            .expect("no event in time")
            .unwrap()
            .event
    }

    fn command(name: &str) -> Command {
        Command::new(CONTROLLER_ID, name)
    }

    #[tokio::test(start_paused = true)]
    async fn test_scenario_arm_and_cancel_before_expiry() {
        let mut f = fixture(Inventory::default(), "", |map| {
            night_perimeter(map, 10, &["a1"]);
        })
        .await;

        f.controller
            .handle_event(BusEnvelope {
                source: "d1".to_string(),
                event: BusEvent::StateChanged {
                    uuid: "d1".to_string(),
                    level: 1,
                },
            })
            .await;

        assert_eq!(
            next_event(&mut f.events).await,
            BusEvent::CountdownStarted {
                delay: 10,
                zone: "perimeter".to_string()
            }
        );

        tokio::time::sleep(Duration::from_secs(3)).await;
        let response = f
            .controller
            .handle_command(command("cancelalarm").param("pin", "0815".into()))
            .await;
        assert!(response.is_success());
        assert_eq!(response.message.as_deref(), Some("Alarm cancelled"));

        let mut cancelled = false;
        while !cancelled {
            match next_event(&mut f.events).await {
                BusEvent::Countdown { delay, .. } => assert!((0..10).contains(&delay)),
                BusEvent::AlarmCancelled { zone } => {
                    assert_eq!(zone, "perimeter");
                    cancelled = true;
                }
                BusEvent::IntruderAlert { .. } => panic!("cancelled alarm fired"),
                other => panic!("unexpected event {:?}", other),
            }
        }
        assert!(!f.controller.engine().is_activated());
    }

    #[tokio::test(start_paused = true)]
    async fn test_scenario_arm_and_fire() {
        let mut f = fixture(Inventory::default(), "", |map| {
            night_perimeter(map, 2, &["a1"]);
        })
        .await;

        f.controller
            .handle_event(BusEnvelope {
                source: "d1".to_string(),
                event: BusEvent::SensorTriggered {
                    uuid: "d1".to_string(),
                    level: 1,
                },
            })
            .await;

        loop {
            match next_event(&mut f.events).await {
                BusEvent::CountdownStarted { delay, .. } => assert_eq!(delay, 2),
                BusEvent::Countdown { .. } => {}
                BusEvent::IntruderAlert { zone } => {
                    assert_eq!(zone, "perimeter");
                    break;
                }
                other => panic!("unexpected event {:?}", other),
            }
        }

        let message = f.outbound.recv().await.unwrap();
        assert_eq!(message, json!({"command": "on", "uuid": "a1"}));
        assert!(f.controller.engine().is_activated());
    }

    #[tokio::test]
    async fn test_scenario_inactive_zone() {
        let mut f = fixture(Inventory::default(), "", |map| {
            night_perimeter(map, -1, &["a1"]);
        })
        .await;

        let response = f
            .controller
            .handle_command(command("triggerzone").param("zone", "perimeter".into()))
            .await;
        assert!(response.is_success());
        assert!(!f.controller.engine().is_activated());
        assert!(f.events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_scenario_sms_fan_out() {
        let mut f = fixture(sms_inventory("g1"), "+1", |map| {
            night_perimeter(map, 0, &["g1"]);
        })
        .await;

        f.controller
            .handle_event(BusEnvelope {
                source: "d1".to_string(),
                event: BusEvent::StateChanged {
                    uuid: "d1".to_string(),
                    level: 255,
                },
            })
            .await;

        loop {
            if let BusEvent::IntruderAlert { .. } = next_event(&mut f.events).await {
                break;
            }
        }

        let message = f.outbound.recv().await.unwrap();
        assert_eq!(
            message,
            json!({
                "command": "sendsms",
                "uuid": "g1",
                "to": "+1",
                "text": "Alarm armed[perimeter]",
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_scenario_housemode_transition_on_cancel() {
        let mut f = fixture(Inventory::default(), "", |map| {
            night_perimeter(map, 10, &["a1"]);
            map.default_housemode = Some("day".to_string());
        })
        .await;

        f.controller
            .handle_event(BusEnvelope {
                source: "d1".to_string(),
                event: BusEvent::StateChanged {
                    uuid: "d1".to_string(),
                    level: 1,
                },
            })
            .await;
        tokio::time::sleep(Duration::from_secs(1)).await;

        let response = f
            .controller
            .handle_command(command("cancelalarm").param("pin", "0815".into()))
            .await;
        assert!(response.is_success());

        loop {
            if let BusEvent::HousemodeChanged { housemode } = next_event(&mut f.events).await {
                assert_eq!(housemode, "day");
                break;
            }
        }
        assert_eq!(
            f.controller.store().read(|map| map.housemode.clone()).as_deref(),
            Some("day")
        );
    }

    #[tokio::test]
    async fn test_sethousemode_pin_handling() {
        let mut f = fixture(Inventory::default(), "", |map| {
            map.housemode = Some("night".to_string());
        })
        .await;

        let rejected = f
            .controller
            .handle_command(
                command("sethousemode")
                    .param("housemode", "day".into())
                    .param("pin", "9999".into()),
            )
            .await;
        assert!(!rejected.is_success());
        assert_eq!(rejected.code.as_deref(), Some("error.security.invalidpin"));
        assert_eq!(rejected.data.unwrap()["housemode"], "night");

        let accepted = f
            .controller
            .handle_command(
                command("sethousemode")
                    .param("housemode", "day".into())
                    .param("pin", "0815".into()),
            )
            .await;
        assert!(accepted.is_success());
        assert_eq!(
            next_event(&mut f.events).await,
            BusEvent::HousemodeChanged {
                housemode: "day".to_string()
            }
        );
        assert_eq!(
            f.controller.store().read(|map| map.housemode.clone()).as_deref(),
            Some("day")
        );
    }

    #[tokio::test]
    async fn test_gethousemode_unset_errors() {
        let f = fixture(Inventory::default(), "", |_| {}).await;
        let response = f.controller.handle_command(command("gethousemode")).await;
        assert!(!response.is_success());
        assert_eq!(
            response.code.as_deref(),
            Some("error.security.housemodenotset")
        );
    }

    #[tokio::test]
    async fn test_checkpin_and_setpin() {
        let f = fixture(Inventory::default(), "", |_| {}).await;

        let ok = f
            .controller
            .handle_command(command("checkpin").param("pin", "0815".into()))
            .await;
        assert!(ok.is_success());

        let bad = f
            .controller
            .handle_command(command("checkpin").param("pin", "1111".into()))
            .await;
        assert_eq!(bad.code.as_deref(), Some("error.security.invalidpin"));

        let set = f
            .controller
            .handle_command(
                command("setpin")
                    .param("pin", "0815".into())
                    .param("newpin", "4321".into()),
            )
            .await;
        assert!(set.is_success());

        // new pin is live and persisted to the config file
        let ok = f
            .controller
            .handle_command(command("checkpin").param("pin", "4321".into()))
            .await;
        assert!(ok.is_success());
        let raw = std::fs::read_to_string(&f.config_path).unwrap();
        assert!(raw.contains("4321"));
    }

    #[tokio::test]
    async fn test_setconfig_getconfig_roundtrip() {
        let f = fixture(Inventory::default(), "", |_| {}).await;

        let zones = json!({
            "night": [
                {"zone": "perimeter", "delay": 10, "devices": ["d1"], "alarms": ["a1"]}
            ]
        });
        let set = f
            .controller
            .handle_command(
                command("setconfig")
                    .param("config", zones.clone())
                    .param("armedMessage", "Armed!".into())
                    .param("disarmedMessage", "Disarmed!".into())
                    .param("defaultHousemode", "day".into())
                    .param("pin", "0815".into()),
            )
            .await;
        assert!(set.is_success());

        let get = f.controller.handle_command(command("getconfig")).await;
        let data = get.data.unwrap();
        assert_eq!(data["config"], zones);
        assert_eq!(data["armedMessage"], "Armed!");
        assert_eq!(data["disarmedMessage"], "Disarmed!");
        assert_eq!(data["defaultHousemode"], "day");

        // bad pin leaves the config untouched
        let rejected = f
            .controller
            .handle_command(
                command("setconfig")
                    .param("config", json!({}))
                    .param("armedMessage", "".into())
                    .param("disarmedMessage", "".into())
                    .param("defaultHousemode", "".into())
                    .param("pin", "0000".into()),
            )
            .await;
        assert_eq!(rejected.code.as_deref(), Some("error.security.invalidpin"));
        let get = f.controller.handle_command(command("getconfig")).await;
        assert_eq!(get.data.unwrap()["armedMessage"], "Armed!");
    }

    #[tokio::test]
    async fn test_addtimelapse_launches_worker_and_rejects_duplicates() {
        let f = fixture(Inventory::default(), "", |_| {}).await;

        let added = f
            .controller
            .handle_command(
                command("addtimelapse")
                    .param("uri", "cam://yard".into())
                    .param("fps", 1.into())
                    .param("codec", "FMP4".into())
                    .param("enabled", true.into()),
            )
            .await;
        assert!(added.is_success());
        let internalid = added.data.unwrap()["internalid"]
            .as_str()
            .unwrap()
            .to_string();
        assert!(!internalid.is_empty());
        assert_eq!(f.controller.supervisor().timelapse_count().await, 1);

        // persisted with the default name
        let stored = f
            .controller
            .store()
            .read(|map| map.timelapses.get(&internalid).cloned())
            .unwrap();
        assert_eq!(stored.name, "noname");
        assert_eq!(stored.uri, "cam://yard");

        let duplicate = f
            .controller
            .handle_command(
                command("addtimelapse")
                    .param("uri", "cam://yard".into())
                    .param("fps", 1.into())
                    .param("codec", "FMP4".into())
                    .param("enabled", true.into()),
            )
            .await;
        assert_eq!(
            duplicate.code.as_deref(),
            Some("error.security.addtimelapse")
        );

        f.controller.cleanup().await;
    }

    #[tokio::test]
    async fn test_addmotion_repairs_durations() {
        let f = fixture(Inventory::default(), "", |_| {}).await;

        let added = f
            .controller
            .handle_command(
                command("addmotion")
                    .param("uri", "cam://door".into())
                    .param("sensitivity", 10.into())
                    .param("deviation", 20.into())
                    .param("bufferduration", 60.into())
                    .param("onduration", 30.into())
                    .param("recordduration", 45.into())
                    .param("enabled", false.into()),
            )
            .await;
        assert!(added.is_success());
        let internalid = added.data.unwrap()["internalid"]
            .as_str()
            .unwrap()
            .to_string();

        let stored = f
            .controller
            .store()
            .read(|map| map.motions.get(&internalid).cloned())
            .unwrap();
        assert!(stored.recordduration < stored.onduration);
        assert!(stored.bufferduration < stored.recordduration);
        // disabled entries are stored but not launched
        assert_eq!(f.controller.supervisor().motion_count().await, 0);
    }

    #[tokio::test]
    async fn test_alarmstate_and_recordings_config() {
        let f = fixture(Inventory::default(), "", |_| {}).await;

        let state = f.controller.handle_command(command("getalarmstate")).await;
        let data = state.data.unwrap();
        assert_eq!(data["alarmactivated"], false);
        assert_eq!(data["countdown"], false);

        let defaults = f
            .controller
            .handle_command(command("getrecordingsconfig"))
            .await;
        let config = defaults.data.unwrap();
        assert_eq!(config["config"]["timelapseslifetime"], 7);
        assert_eq!(config["config"]["motionslifetime"], 14);

        let set = f
            .controller
            .handle_command(
                command("setrecordingsconfig")
                    .param("timelapseslifetime", 3.into())
                    .param("motionslifetime", 5.into()),
            )
            .await;
        assert!(set.is_success());

        let updated = f
            .controller
            .handle_command(command("getrecordingsconfig"))
            .await;
        assert_eq!(updated.data.unwrap()["config"]["timelapseslifetime"], 3);
    }

    #[tokio::test]
    async fn test_gettimelapses_lists_recordings_directory() {
        let f = fixture(Inventory::default(), "", |_| {}).await;
        std::fs::write(
            f.controller.recordings_dir.join("timelapse_cam1_20260801.avi"),
            b"data",
        )
        .unwrap();
        std::fs::write(
            f.controller.recordings_dir.join("motion_cam1_20260801_120000.avi"),
            b"data",
        )
        .unwrap();

        let timelapses = f.controller.handle_command(command("gettimelapses")).await;
        let list = timelapses.data.unwrap();
        assert_eq!(list["timelapses"].as_array().unwrap().len(), 1);
        assert_eq!(list["timelapses"][0]["internalid"], "cam1");

        let motions = f.controller.handle_command(command("getmotions")).await;
        assert_eq!(motions.data.unwrap()["motions"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_command_and_foreign_device() {
        let f = fixture(Inventory::default(), "", |_| {}).await;

        let unknown = f.controller.handle_command(command("frobnicate")).await;
        assert_eq!(unknown.code.as_deref(), Some("unknown-command"));

        let foreign = f
            .controller
            .handle_command(Command::new("somedevice", "gethousemode"))
            .await;
        assert_eq!(foreign.code.as_deref(), Some("unknown-command"));
    }

    #[tokio::test]
    async fn test_cancelalarm_without_alarm_errors() {
        let f = fixture(Inventory::default(), "", |_| {}).await;
        let response = f
            .controller
            .handle_command(command("cancelalarm").param("pin", "0815".into()))
            .await;
        assert_eq!(
            response.code.as_deref(),
            Some("error.security.alarmthreadcancelfailed")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelalarm_after_expiry_disables_sounding_alarm() {
        let mut f = fixture(Inventory::default(), "", |map| {
            night_perimeter(map, 0, &["a1"]);
        })
        .await;

        f.controller
            .handle_event(BusEnvelope {
                source: "d1".to_string(),
                event: BusEvent::StateChanged {
                    uuid: "d1".to_string(),
                    level: 1,
                },
            })
            .await;

        loop {
            if let BusEvent::IntruderAlert { .. } = next_event(&mut f.events).await {
                break;
            }
        }
        // drain the armed fan-out
        let armed = f.outbound.recv().await.unwrap();
        assert_eq!(armed["command"], "on");

        // countdown is over: cancelling now disables the sounding alarm
        tokio::time::sleep(Duration::from_millis(50)).await;
        let response = f
            .controller
            .handle_command(command("cancelalarm").param("pin", "0815".into()))
            .await;
        assert!(response.is_success());
        assert_eq!(response.message.as_deref(), Some("Alarm disabled"));

        loop {
            if let BusEvent::AlarmStopped = next_event(&mut f.events).await {
                break;
            }
        }
        // disarmed fan-out to the same alarm uuid
        let disarmed = f.outbound.recv().await.unwrap();
        assert_eq!(disarmed["uuid"], "a1");
        assert!(!f.controller.engine().is_activated());
    }

    #[tokio::test]
    async fn test_midnight_tick_restarts_timelapses() {
        let f = fixture(Inventory::default(), "", |map| {
            map.timelapses.insert(
                "tl1".to_string(),
                TimelapseConfig {
                    uri: "cam://yard".to_string(),
                    ..TimelapseConfig::default()
                },
            );
        })
        .await;
        assert_eq!(f.controller.supervisor().timelapse_count().await, 1);

        f.controller
            .handle_event(BusEnvelope {
                source: "clock".to_string(),
                event: BusEvent::TimeChanged { hour: 0, minute: 0 },
            })
            .await;
        assert_eq!(f.controller.supervisor().timelapse_count().await, 1);

        // a non-midnight tick leaves the workers alone
        f.controller
            .handle_event(BusEnvelope {
                source: "clock".to_string(),
                event: BusEvent::TimeChanged { hour: 12, minute: 30 },
            })
            .await;
        assert_eq!(f.controller.supervisor().timelapse_count().await, 1);

        f.controller.cleanup().await;
    }

    #[tokio::test]
    async fn test_device_rename_updates_map_and_restarts_worker() {
        let f = fixture(Inventory::default(), "", |map| {
            map.motions.insert(
                "m1".to_string(),
                MotionConfig {
                    uri: "cam://door".to_string(),
                    ..MotionConfig::default()
                },
            );
        })
        .await;
        assert_eq!(f.controller.supervisor().motion_count().await, 1);

        f.controller
            .handle_event(BusEnvelope {
                source: "inventory".to_string(),
                event: BusEvent::DeviceNameChanged {
                    uuid: "m1".to_string(),
                    name: "front door".to_string(),
                },
            })
            .await;

        let stored = f
            .controller
            .store()
            .read(|map| map.motions.get("m1").cloned())
            .unwrap();
        assert_eq!(stored.name, "front door");
        assert_eq!(f.controller.supervisor().motion_count().await, 1);

        f.controller.cleanup().await;
    }
}
