use crate::alarm::gateway::GatewayDispatcher;
use crate::bus::{BusConnection, BusEvent, CONTROLLER_ID};
use crate::error::{AlarmError, Result};
use crate::securitymap::SecuritymapStore;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

/// Outcome of a zone trigger attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerStatus {
    Ok,
    OkInactiveZone,
    KoConfigInfoMissing,
    KoInvalidConfig,
    KoAlarmAlreadyRunning,
    KoAlarmFailed,
}

/// The alarm currently counting down or sounding
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CurrentAlarm {
    pub housemode: String,
    pub zone: String,
}

/// Zone alarm state machine.
///
/// At most one countdown runs per process. `activated` covers both the
/// counting and the sounding phase; `counting` only the countdown itself.
/// Clones share the same state, so the countdown task can carry one.
#[derive(Clone)]
pub struct AlarmEngine {
    bus: BusConnection,
    store: Arc<SecuritymapStore>,
    dispatcher: Arc<GatewayDispatcher>,
    activated: Arc<AtomicBool>,
    counting: Arc<AtomicBool>,
    current: Arc<Mutex<Option<CurrentAlarm>>>,
    countdown: Arc<Mutex<Option<CancellationToken>>>,
}

impl AlarmEngine {
    pub fn new(
        bus: BusConnection,
        store: Arc<SecuritymapStore>,
        dispatcher: Arc<GatewayDispatcher>,
    ) -> Self {
        Self {
            bus,
            store,
            dispatcher,
            activated: Arc::new(AtomicBool::new(false)),
            counting: Arc::new(AtomicBool::new(false)),
            current: Arc::new(Mutex::new(None)),
            countdown: Arc::new(Mutex::new(None)),
        }
    }

    pub fn is_activated(&self) -> bool {
        self.activated.load(Ordering::Acquire)
    }

    pub fn is_counting(&self) -> bool {
        self.counting.load(Ordering::Acquire)
    }

    pub fn current_alarm(&self) -> Option<CurrentAlarm> {
        self.current.lock().clone()
    }

    /// Arm a zone under a housemode, spawning the countdown task.
    pub fn trigger_zone(&self, zone: &str, housemode: &str) -> TriggerStatus {
        let lookup = self.store.read(|map| {
            if map.config.is_empty() {
                return Err(TriggerStatus::KoInvalidConfig);
            }
            match map.zone(housemode, zone) {
                Some(z) => Ok(z.delay),
                None => Err(TriggerStatus::KoConfigInfoMissing),
            }
        });

        let delay = match lookup {
            Ok(delay) => delay,
            Err(status) => {
                if status == TriggerStatus::KoConfigInfoMissing {
                    error!(
                        "Specified housemode/zone '{}/{}' doesn't exist",
                        housemode, zone
                    );
                }
                return status;
            }
        };

        if delay < 0 {
            // zone is inactive in this housemode
            return TriggerStatus::OkInactiveZone;
        }

        if self.counting.load(Ordering::Acquire) {
            debug!("Alarm countdown is already running");
            return TriggerStatus::KoAlarmAlreadyRunning;
        }

        *self.current.lock() = Some(CurrentAlarm {
            housemode: housemode.to_string(),
            zone: zone.to_string(),
        });
        self.activated.store(true, Ordering::Release);
        self.counting.store(true, Ordering::Release);

        let cancel = CancellationToken::new();
        *self.countdown.lock() = Some(cancel.clone());
        tokio::spawn(self.clone().run_countdown(
            zone.to_string(),
            housemode.to_string(),
            delay,
            cancel,
        ));

        TriggerStatus::Ok
    }

    /// Countdown task: a tick per second with the remaining delay, then the
    /// intruder alert and alarm fan-out, unless cancelled first.
    async fn run_countdown(
        self,
        zone: String,
        housemode: String,
        delay: i16,
        cancel: CancellationToken,
    ) {
        self.bus.emit(
            CONTROLLER_ID,
            BusEvent::CountdownStarted {
                delay: delay as i64,
                zone: zone.clone(),
            },
        );
        info!(
            "Alarm triggered: zone={} housemode={} delay={}",
            zone, housemode, delay
        );

        let mut remaining = delay as i64;
        let mut cancelled = cancel.is_cancelled();
        while !cancelled && remaining > 0 {
            remaining -= 1;
            trace!("countdown={}", remaining);
            self.bus.emit(
                CONTROLLER_ID,
                BusEvent::Countdown {
                    delay: remaining,
                    zone: zone.clone(),
                },
            );
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                _ = cancel.cancelled() => cancelled = true,
            }
        }

        if cancelled {
            debug!("Alarm countdown cancelled");
            self.bus
                .emit(CONTROLLER_ID, BusEvent::AlarmCancelled { zone });
            self.activated.store(false, Ordering::Release);
            self.counting.store(false, Ordering::Release);
            self.current.lock().take();
            self.countdown.lock().take();
            self.switch_to_default_housemode();
        } else {
            info!(
                "Countdown expired for zone={} housemode={}, sending intruder alert",
                zone, housemode
            );
            self.bus.emit(
                CONTROLLER_ID,
                BusEvent::IntruderAlert { zone: zone.clone() },
            );
            self.trigger_alarms(&zone, &housemode);
            // the alarm keeps sounding; only the countdown phase is over
            self.counting.store(false, Ordering::Release);
            self.countdown.lock().take();
        }
        debug!("Alarm countdown task exited");
    }

    /// Fan the armed message out to the zone's notification devices
    fn trigger_alarms(&self, zone: &str, housemode: &str) {
        let (alarms, message) = self.store.read(|map| {
            (
                map.zone_alarms(housemode, zone),
                map.armed_message().to_string(),
            )
        });
        self.dispatcher.fan_out(zone, &alarms, &message);
    }

    /// Cancel a running countdown; the task emits the cancellation event
    pub fn cancel_countdown(&self) -> std::result::Result<(), AlarmError> {
        match self.countdown.lock().take() {
            Some(cancel) => {
                cancel.cancel();
                Ok(())
            }
            None => Err(AlarmError::NotRunning),
        }
    }

    /// Disable a sounding alarm (cancellation after countdown expiry)
    pub fn disable_alarm(&self, zone: &str, housemode: &str) {
        info!("Disabling alarm");
        self.activated.store(false, Ordering::Release);
        self.current.lock().take();

        self.bus.emit(CONTROLLER_ID, BusEvent::AlarmStopped);
        self.switch_to_default_housemode();

        let (alarms, message) = self.store.read(|map| {
            (
                map.zone_alarms(housemode, zone),
                map.disarmed_message().to_string(),
            )
        });
        self.dispatcher.fan_out(zone, &alarms, &message);
    }

    /// Write the housemode, publish the global variable, emit the change
    /// event and persist; emissions stay ordered with the map write.
    pub fn change_housemode(&self, housemode: &str) -> Result<()> {
        info!("Setting housemode: {}", housemode);
        let (_, persisted) = self.store.mutate(|map| {
            map.housemode = Some(housemode.to_string());
            self.bus.set_global_variable("housemode", housemode);
            self.bus.emit(
                CONTROLLER_ID,
                BusEvent::HousemodeChanged {
                    housemode: housemode.to_string(),
                },
            );
        });
        persisted
    }

    fn switch_to_default_housemode(&self) {
        let default = self.store.read(|map| map.default_housemode.clone());
        match default {
            Some(housemode) => {
                if let Err(e) = self.change_housemode(&housemode) {
                    error!("Unable to write config file saving default housemode: {}", e);
                }
            }
            None => debug!("No default housemode, current housemode is not changed"),
        }
    }

    /// Route a sensor state change into zone arbitration. A single event
    /// never triggers more than one zone.
    pub fn handle_sensor_event(&self, uuid: &str, level: i64) {
        if level == 0 {
            trace!("Disabled sensor event, event dropped");
            return;
        }
        if self.activated.load(Ordering::Acquire) {
            trace!("Alarm already running, event dropped");
            return;
        }

        let target = self.store.read(|map| {
            if map.config.is_empty() {
                debug!("No zone config, sensor event ignored");
                return None;
            }
            let Some(housemode) = map.housemode.clone() else {
                error!("Missing housemode in securitymap");
                return None;
            };
            map.find_triggered_zone(&housemode, uuid)
                .map(|zone| (housemode, zone.zone.clone()))
        });

        if let Some((housemode, zone)) = target {
            debug!(
                "housemode[{}] is triggered in zone[{}] by device [{}]",
                housemode, zone, uuid
            );
            self.trigger_zone(&zone, &housemode);
        }
    }
}
