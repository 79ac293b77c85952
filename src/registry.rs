//! Device registry and the enumeration poller.
//!
//! The registry is the single owner of device records; every other component
//! holds serials and looks records up here. The poller feeds it from
//! `fastboot devices` with a two-tick debounce: a serial must show up in two
//! consecutive enumerations before a record is created, which hides the
//! transient flaps fastboot transactions cause.

use crate::{
    device::{ApplianceDevice, Phase, ProvisionStatus, TargetDevice},
    error::{Error, Result},
    events::EventSender,
    fastboot::Fastboot,
    lock_map::{LockMap, LockMapGuard},
    reboot::RebootTracker,
    serial_mapper::SerialMapper,
};
use async_trait::async_trait;
use log::{debug, warn};
use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::task::JoinHandle;

/// Appliance serials carry this prefix.
pub const APPLIANCE_SERIAL_PREFIX: &str = "ATFA";

#[derive(Default)]
struct RegistryInner {
    stable: HashSet<String>,
    pending: HashSet<String>,
    targets: HashMap<String, TargetDevice>,
    appliance: Option<ApplianceDevice>,
}

/// Owner of all device records plus the per-device operation tokens and the
/// poller pause counter.
#[derive(Default)]
pub struct DeviceRegistry {
    inner: Mutex<RegistryInner>,
    locks: LockMap<String>,
    pause_count: AtomicUsize,
}

impl DeviceRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fold one enumeration into the stable/pending sets and return the
    /// serials that are now stable.
    pub fn update_serials(&self, seen: &[String]) -> Vec<String> {
        let mut inner = self.inner.lock().expect("registry");
        let mut stable = HashSet::new();
        let mut pending = HashSet::new();
        for serial in seen {
            if serial.is_empty() {
                continue;
            }
            if inner.stable.contains(serial) || inner.pending.contains(serial) {
                stable.insert(serial.clone());
            } else {
                pending.insert(serial.clone());
            }
        }
        inner.stable = stable;
        inner.pending = pending;
        inner.stable.iter().cloned().collect()
    }

    /// Forget a serial's stable standing so the next two ticks re-admit it.
    pub fn drop_stable(&self, serial: &str) {
        self.inner.lock().expect("registry").stable.remove(serial);
    }

    pub fn is_stable(&self, serial: &str) -> bool {
        self.inner.lock().expect("registry").stable.contains(serial)
    }

    /// Target snapshots ordered by USB location, which is how the console
    /// lays out its slots.
    pub fn targets_sorted(&self) -> Vec<TargetDevice> {
        let inner = self.inner.lock().expect("registry");
        let mut targets: Vec<_> = inner.targets.values().cloned().collect();
        targets.sort_by_key(|t| t.location.clone().unwrap_or_default());
        targets
    }

    pub fn target(&self, serial: &str) -> Option<TargetDevice> {
        self.inner.lock().expect("registry").targets.get(serial).cloned()
    }

    pub fn insert_target(&self, device: TargetDevice) {
        let mut inner = self.inner.lock().expect("registry");
        inner.targets.insert(device.serial.clone(), device);
    }

    pub fn remove_target(&self, serial: &str) {
        let mut inner = self.inner.lock().expect("registry");
        if inner.targets.remove(serial).is_some() {
            self.locks.forget(&serial.to_string());
        }
    }

    fn retain_targets(&self, keep: impl Fn(&TargetDevice) -> bool) {
        let mut inner = self.inner.lock().expect("registry");
        let dropped: Vec<String> = inner
            .targets
            .values()
            .filter(|t| !keep(t))
            .map(|t| t.serial.clone())
            .collect();
        for serial in dropped {
            inner.targets.remove(&serial);
            self.locks.forget(&serial);
        }
    }

    /// Mutate a target in place; false when the serial is no longer tracked.
    pub fn with_target(&self, serial: &str, f: impl FnOnce(&mut TargetDevice)) -> bool {
        let mut inner = self.inner.lock().expect("registry");
        match inner.targets.get_mut(serial) {
            Some(device) => {
                f(device);
                true
            }
            None => false,
        }
    }

    pub fn set_status(&self, serial: &str, status: ProvisionStatus) -> bool {
        self.with_target(serial, |t| t.provision_status = status)
    }

    pub fn appliance(&self) -> Option<ApplianceDevice> {
        self.inner.lock().expect("registry").appliance.clone()
    }

    pub fn appliance_serial(&self) -> Option<String> {
        self.inner
            .lock()
            .expect("registry")
            .appliance
            .as_ref()
            .map(|a| a.serial.clone())
    }

    pub fn set_appliance(&self, appliance: Option<ApplianceDevice>) {
        let mut inner = self.inner.lock().expect("registry");
        if let Some(old) = inner.appliance.take() {
            if appliance.as_ref().map(|a| a.serial.as_str()) != Some(old.serial.as_str()) {
                self.locks.forget(&old.serial);
            }
        }
        inner.appliance = appliance;
    }

    pub fn with_appliance(&self, f: impl FnOnce(&mut ApplianceDevice)) -> bool {
        let mut inner = self.inner.lock().expect("registry");
        match inner.appliance.as_mut() {
            Some(appliance) => {
                f(appliance);
                true
            }
            None => false,
        }
    }

    pub fn appliance_keys_left(&self) -> Option<i64> {
        self.inner
            .lock()
            .expect("registry")
            .appliance
            .as_ref()
            .and_then(|a| a.keys_left)
    }

    fn set_operation(&self, serial: &str, operation: Option<String>) {
        let mut inner = self.inner.lock().expect("registry");
        if let Some(target) = inner.targets.get_mut(serial) {
            target.operation = operation;
        } else if let Some(appliance) = inner.appliance.as_mut() {
            if appliance.serial == serial {
                appliance.operation = operation;
            }
        }
    }

    fn operation_of(&self, serial: &str) -> Option<String> {
        let inner = self.inner.lock().expect("registry");
        if let Some(target) = inner.targets.get(serial) {
            return target.operation.clone();
        }
        inner
            .appliance
            .as_ref()
            .filter(|a| a.serial == serial)
            .and_then(|a| a.operation.clone())
    }

    /// Take a device's operation token without blocking. `None` means another
    /// operation holds it; the returned error text names that operation.
    pub fn try_start_operation(
        self: &Arc<Self>,
        serial: &str,
        operation: &str,
    ) -> std::result::Result<OperationGuard, String> {
        match self.locks.try_lock(serial.to_string()) {
            Ok(token) => Ok(self.operation_guard(serial, operation, token)),
            Err(_) => Err(self.operation_of(serial).unwrap_or_default()),
        }
    }

    /// Wait for the token; used only where back-pressure is wanted.
    pub async fn start_operation_blocking(
        self: &Arc<Self>,
        serial: &str,
        operation: &str,
    ) -> OperationGuard {
        let token = self.locks.lock(serial.to_string()).await;
        self.operation_guard(serial, operation, token)
    }

    fn operation_guard(
        self: &Arc<Self>,
        serial: &str,
        operation: &str,
        token: LockMapGuard,
    ) -> OperationGuard {
        self.set_operation(serial, Some(operation.to_string()));
        OperationGuard {
            registry: Arc::clone(self),
            serial: serial.to_string(),
            _pause: self.pause(),
            _token: token,
        }
    }

    /// Suspend poller ticks for the guard's lifetime. Pauses are layered;
    /// the poller resumes when the last guard drops.
    pub fn pause(self: &Arc<Self>) -> PauseGuard {
        self.pause_count.fetch_add(1, Ordering::SeqCst);
        PauseGuard {
            registry: Arc::clone(self),
        }
    }

    pub fn paused(&self) -> bool {
        self.pause_count.load(Ordering::SeqCst) > 0
    }
}

/// Keeps the poller quiet while a fastboot operation is in flight.
pub struct PauseGuard {
    registry: Arc<DeviceRegistry>,
}

impl Drop for PauseGuard {
    fn drop(&mut self) {
        self.registry.pause_count.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Witness that one operation owns a device: holds the token, pauses the
/// poller, and shows the operation name on the device row.
pub struct OperationGuard {
    registry: Arc<DeviceRegistry>,
    serial: String,
    _pause: PauseGuard,
    _token: LockMapGuard,
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        self.registry.set_operation(&self.serial, None);
    }
}

/// Reads a fresh provision status off a newly seen device. Implemented by the
/// provisioner; injected so the poller stays free of step logic.
#[async_trait]
pub trait StatusProbe: Send + Sync {
    async fn refresh(&self, device: &mut TargetDevice) -> Result<()>;
}

/// Periodic device enumeration task.
pub struct Poller {
    fastboot: Arc<Fastboot>,
    registry: Arc<DeviceRegistry>,
    reboots: Arc<RebootTracker>,
    probe: Arc<dyn StatusProbe>,
    mapper: Mutex<SerialMapper>,
    events: EventSender,
    compatible_version: i64,
    interval: Duration,
}

impl Poller {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        fastboot: Arc<Fastboot>,
        registry: Arc<DeviceRegistry>,
        reboots: Arc<RebootTracker>,
        probe: Arc<dyn StatusProbe>,
        mapper: SerialMapper,
        events: EventSender,
        compatible_version: i64,
        interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            fastboot,
            registry,
            reboots,
            probe,
            mapper: Mutex::new(mapper),
            events,
            compatible_version,
            interval,
        })
    }

    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.tick().await;
            }
        })
    }

    /// One enumeration round.
    pub async fn tick(&self) {
        if self.registry.paused() {
            return;
        }
        let serials = match self.fastboot.list_devices().await {
            Ok(serials) => serials,
            Err(e) => {
                warn!("device enumeration failed: {}", e);
                self.events
                    .operation_error("List Devices", vec![], e.to_string());
                return;
            }
        };

        let stable = self.registry.update_serials(&serials);
        let mut appliance_serial = None;
        let mut target_serials = Vec::new();
        for serial in stable {
            if serial.starts_with(APPLIANCE_SERIAL_PREFIX) {
                appliance_serial = Some(serial);
            } else {
                target_serials.push(serial);
            }
        }

        // Rebooting targets are expected to vanish from enumeration; keep
        // their placeholders alive.
        let stable_set: HashSet<String> = target_serials.iter().cloned().collect();
        self.registry.retain_targets(|t| {
            stable_set.contains(&t.serial)
                || t.provision_status == ProvisionStatus::Reboot(Phase::InProgress)
        });

        let new_serials: Vec<String> = target_serials
            .iter()
            .filter(|serial| self.registry.target(serial).is_none())
            .cloned()
            .collect();
        let reboot_serials: Vec<String> = target_serials
            .iter()
            .filter(|serial| self.reboots.pending(serial))
            .cloned()
            .collect();

        if appliance_serial.is_some() || !new_serials.is_empty() || !reboot_serials.is_empty() {
            self.mapper.lock().expect("serial map").refresh();
        }

        self.handle_appliance(appliance_serial).await;

        let mut failures = Vec::new();
        for serial in new_serials {
            match self.create_target(&serial).await {
                Ok(device) => {
                    debug!("new target device {}", device);
                    self.registry.insert_target(device);
                }
                Err(e) => {
                    // The serial leaves the stable set so a later tick can
                    // retry from scratch.
                    self.registry.drop_stable(&serial);
                    failures.push((serial, e.to_string()));
                }
            }
        }

        for serial in reboot_serials {
            if !self.reboots.try_claim(&serial) {
                continue;
            }
            match self.create_target(&serial).await {
                Ok(mut device) => {
                    device.provision_status = ProvisionStatus::Reboot(Phase::Success);
                    self.registry.insert_target(device);
                    if let Some(on_success) = self.reboots.complete(&serial) {
                        on_success();
                    }
                }
                Err(e) => {
                    self.reboots.release_claim(&serial);
                    failures.push((serial, e.to_string()));
                }
            }
        }

        if !failures.is_empty() {
            let serials: Vec<String> = failures.iter().map(|(s, _)| s.clone()).collect();
            let message = failures
                .into_iter()
                .map(|(_, m)| m)
                .collect::<Vec<_>>()
                .join("; ");
            let error = Error::DeviceCreation { serials, message };
            warn!("{}", error);
            self.events
                .operation_error("List Devices", vec![], error.to_string());
        }

        self.events.device_list_refreshed();
    }

    async fn create_target(&self, serial: &str) -> Result<TargetDevice> {
        let location = self
            .mapper
            .lock()
            .expect("serial map")
            .location_of(serial);
        let mut device = TargetDevice::new(serial, location);
        self.probe.refresh(&mut device).await?;
        Ok(device)
    }

    async fn handle_appliance(&self, serial: Option<String>) {
        let serial = match serial {
            Some(serial) => serial,
            None => {
                self.registry.set_appliance(None);
                return;
            }
        };
        if self.registry.appliance_serial().as_deref() == Some(serial.as_str()) {
            return;
        }

        let device = self.fastboot.device(&serial);
        // A do-nothing query first: the appliance enumerates before its
        // fastboot stack is ready to answer.
        if device.get_var("version").await.is_err() {
            return;
        }

        let location = self
            .mapper
            .lock()
            .expect("serial map")
            .location_of(&serial);
        self.registry
            .set_appliance(Some(ApplianceDevice::new(serial.clone(), location)));
        debug!("appliance {} admitted", serial);

        if self.compatible_version == 0 {
            return;
        }
        match device.get_var("os-version").await {
            Ok(version) => match version.parse::<i64>() {
                Ok(version) if version < self.compatible_version => {
                    let error = Error::VersionIncompatible(version);
                    warn!("{}", error);
                    self.events.alert(error.to_string());
                }
                Ok(_) => {}
                Err(_) => {
                    warn!("{}", Error::OsVersionUnavailable);
                    self.events.alert(Error::OsVersionUnavailable.to_string());
                }
            },
            Err(_) => {
                warn!("{}", Error::OsVersionUnavailable);
                self.events.alert(Error::OsVersionUnavailable.to_string());
            }
        }
    }
}
