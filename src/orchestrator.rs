//! Automatic provisioning and the manual batch entry points.
//!
//! In auto mode every newly stable, unfinished target is admitted into its
//! own pipeline task. Pipelines serialize on a single auto-provision mutex,
//! released only while a pipeline sits out a reboot wait so other targets can
//! use the appliance in the meantime.

use crate::{
    atfa::ApplianceManager,
    device::{Phase, ProvisionStatus},
    error::Result,
    events::EventSender,
    product::DescriptorStore,
    provision::Provisioner,
    registry::DeviceRegistry,
    steps::{self, ProvisionStep},
};
use log::{info, warn};
use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

pub struct Orchestrator {
    registry: Arc<DeviceRegistry>,
    provisioner: Arc<Provisioner>,
    appliance: Arc<ApplianceManager>,
    descriptors: Arc<DescriptorStore>,
    events: EventSender,
    /// Steps from configuration once they passed validation; `None` falls
    /// back to the mode default.
    configured_steps: Mutex<Option<Vec<ProvisionStep>>>,
    auto_prov_mutex: Arc<tokio::sync::Mutex<()>>,
    in_flight: Mutex<HashSet<String>>,
    auto_active: AtomicBool,
    first_warning: Option<i64>,
    second_warning: Option<i64>,
    first_alert_shown: AtomicBool,
    second_alert_shown: AtomicBool,
    /// Configured slot locations; when any is set, only mapped targets are
    /// eligible for automatic mode.
    mapped_locations: Vec<String>,
    test_mode: bool,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<DeviceRegistry>,
        provisioner: Arc<Provisioner>,
        appliance: Arc<ApplianceManager>,
        descriptors: Arc<DescriptorStore>,
        events: EventSender,
        first_warning: Option<i64>,
        second_warning: Option<i64>,
        mapped_locations: Vec<String>,
        test_mode: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            provisioner,
            appliance,
            descriptors,
            events,
            configured_steps: Mutex::new(None),
            auto_prov_mutex: Arc::new(tokio::sync::Mutex::new(())),
            in_flight: Mutex::new(HashSet::new()),
            auto_active: AtomicBool::new(false),
            first_warning,
            second_warning,
            first_alert_shown: AtomicBool::new(false),
            second_alert_shown: AtomicBool::new(false),
            mapped_locations,
            test_mode,
        })
    }

    /// Install the configured step sequence, falling back to the mode
    /// default on a syntax or security violation.
    pub fn set_configured_steps(&self, names: &[String]) {
        let mut slot = self.configured_steps.lock().expect("steps");
        if names.is_empty() {
            *slot = None;
            return;
        }
        match steps::parse_steps(names) {
            Err(token) => {
                warn!("provision steps syntax error at {:?}", token);
                self.events.alert(format!(
                    "Provision steps contain an unknown step: {}. Using the default sequence.",
                    token
                ));
                *slot = None;
            }
            Ok(parsed) => {
                if !self.test_mode && !steps::validate_security(&parsed) {
                    warn!("provision steps failed security validation");
                    self.events.alert(
                        "Provision steps do not meet the security requirements. \
                         Using the default sequence."
                            .to_string(),
                    );
                    *slot = None;
                } else {
                    *slot = Some(parsed);
                }
            }
        }
    }

    /// The sequence auto mode runs right now.
    pub fn current_steps(&self) -> Vec<ProvisionStep> {
        if let Some(configured) = self.configured_steps.lock().expect("steps").clone() {
            return configured;
        }
        if self.descriptors.is_som() {
            steps::DEFAULT_SOM_STEPS.to_vec()
        } else {
            steps::DEFAULT_PRODUCT_STEPS.to_vec()
        }
    }

    pub fn enter_auto(&self) {
        self.first_alert_shown.store(false, Ordering::SeqCst);
        self.second_alert_shown.store(false, Ordering::SeqCst);
        self.auto_active.store(true, Ordering::SeqCst);
        info!("auto provisioning on");
    }

    /// Cooperative: running pipelines finish their current step, observe the
    /// flag, and stop issuing new ones.
    pub fn leave_auto(&self) {
        self.auto_active.store(false, Ordering::SeqCst);
        info!("auto provisioning off");
    }

    pub fn auto_active(&self) -> bool {
        self.auto_active.load(Ordering::SeqCst)
    }

    fn mapped(&self, location: &Option<String>) -> bool {
        if self.mapped_locations.is_empty() {
            return true;
        }
        match location {
            Some(location) => self.mapped_locations.iter().any(|l| l == location),
            None => false,
        }
    }

    /// Admit every available target into its own pipeline. Called on each
    /// device list refresh while auto mode is on.
    pub fn on_registry_update(self: &Arc<Self>) {
        if !self.auto_active() {
            return;
        }
        let steps = self.current_steps();
        for target in self.registry.targets_sorted() {
            if target.provision_status == ProvisionStatus::Reboot(Phase::InProgress)
                || target.provision_status.is_failed()
                || !self.mapped(&target.location)
                || steps::is_finished(&target.provision_state, &steps)
            {
                continue;
            }
            {
                let mut in_flight = self.in_flight.lock().expect("in flight");
                if !in_flight.insert(target.serial.clone()) {
                    continue;
                }
            }
            self.registry
                .set_status(&target.serial, ProvisionStatus::Waiting);
            let orchestrator = Arc::clone(self);
            let serial = target.serial.clone();
            tokio::spawn(async move {
                orchestrator.handle_state_transition(&serial).await;
                orchestrator
                    .in_flight
                    .lock()
                    .expect("in flight")
                    .remove(&serial);
            });
        }
    }

    /// Run one target through the configured sequence, skipping steps whose
    /// facet already holds.
    pub async fn handle_state_transition(self: &Arc<Self>, serial: &str) {
        let steps = self.current_steps();
        let mut auto_guard = Some(self.auto_prov_mutex.lock().await);

        for step in steps.iter().copied() {
            let target = match self.registry.target(serial) {
                Some(target) => target,
                None => break,
            };
            if target.provision_status.is_failed() || !self.auto_active() {
                break;
            }
            let state = target.provision_state;

            let result = match step {
                ProvisionStep::FuseVbootKey if !state.bootloader_locked => {
                    let fused = self.run_logged(serial, "Fuse bootloader verified boot key", {
                        let p = Arc::clone(&self.provisioner);
                        let s = serial.to_string();
                        async move { p.fuse_vboot(&s).await }
                    })
                    .await;
                    match fused {
                        Ok(()) => {
                            // Other pipelines may proceed while this target
                            // is away rebooting.
                            drop(auto_guard.take());
                            let rebooted = self
                                .run_logged(serial, "Verify bootloader locked, rebooting", {
                                    let p = Arc::clone(&self.provisioner);
                                    let s = serial.to_string();
                                    async move { p.reboot_and_wait(&s).await }
                                })
                                .await;
                            auto_guard = Some(self.auto_prov_mutex.lock().await);
                            rebooted
                        }
                        Err(e) => Err(e),
                    }
                }
                ProvisionStep::FusePermAttr if !state.avb_perm_attr_set => {
                    self.run_logged(serial, "Fuse permanent attributes", {
                        let p = Arc::clone(&self.provisioner);
                        let s = serial.to_string();
                        async move { p.fuse_perm_attr(&s).await }
                    })
                    .await
                }
                ProvisionStep::LockAvb if !state.avb_locked => {
                    self.run_logged(serial, "Lock android verified boot", {
                        let p = Arc::clone(&self.provisioner);
                        let s = serial.to_string();
                        async move { p.lock_avb(&s).await }
                    })
                    .await
                }
                ProvisionStep::UnlockAvb if state.avb_locked => {
                    self.run_logged(serial, "Unlock android verified boot", {
                        let p = Arc::clone(&self.provisioner);
                        let s = serial.to_string();
                        async move { p.unlock_avb(&s).await }
                    })
                    .await
                }
                ProvisionStep::ProvisionProduct if !state.product_provisioned => {
                    let result = self
                        .run_logged(serial, "Product Attestation Key Provisioning", {
                            let p = Arc::clone(&self.provisioner);
                            let s = serial.to_string();
                            async move { p.provision(&s, false).await }
                        })
                        .await;
                    self.after_provision(result.is_ok(), false).await;
                    result
                }
                ProvisionStep::ProvisionSom if !state.som_provisioned => {
                    let result = self
                        .run_logged(serial, "SoM Attestation Key Provisioning", {
                            let p = Arc::clone(&self.provisioner);
                            let s = serial.to_string();
                            async move { p.provision(&s, true).await }
                        })
                        .await;
                    self.after_provision(result.is_ok(), true).await;
                    result
                }
                // Facet already satisfied.
                _ => Ok(()),
            };

            if result.is_err() {
                // The step marked its failed status; the next loop pass
                // observes it and stops this pipeline.
                continue;
            }
        }
        drop(auto_guard);

        if let Some(target) = self.registry.target(serial) {
            if steps::is_finished(&target.provision_state, &self.current_steps()) {
                self.events
                    .print(format!("{{{}}} All steps Succeed", target));
            }
        }
    }

    /// Refresh the key supply after a transfer attempt (a failed attempt may
    /// still have consumed a key), fire threshold alerts, and leave auto
    /// mode when the supply is exhausted.
    async fn after_provision(&self, succeeded: bool, is_som: bool) {
        if let Err(e) = self.appliance.update_keys_left(is_som).await {
            warn!("keys-left refresh failed: {}", e);
        }
        if !succeeded {
            return;
        }
        self.check_low_key_alert();
        if self.registry.appliance_keys_left() == Some(0) && self.auto_active() {
            self.events.alert(
                "No attestation keys left in the appliance. Leaving automatic provisioning."
                    .to_string(),
            );
            self.leave_auto();
        }
    }

    /// Each warning threshold fires at most once per automatic run.
    fn check_low_key_alert(&self) {
        let keys_left = match self.registry.appliance_keys_left() {
            Some(n) if n >= 0 => n,
            _ => return,
        };
        if let Some(second) = self.second_warning {
            if keys_left < second
                && self
                    .second_alert_shown
                    .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
            {
                self.first_alert_shown.store(true, Ordering::SeqCst);
                self.events.low_key(keys_left);
                return;
            }
        }
        if let Some(first) = self.first_warning {
            if keys_left < first
                && self
                    .first_alert_shown
                    .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
            {
                self.events.low_key(keys_left);
            }
        }
    }

    async fn run_logged<F>(&self, serial: &str, operation: &str, step: F) -> Result<()>
    where
        F: std::future::Future<Output = Result<()>>,
    {
        let display = self
            .registry
            .target(serial)
            .map(|t| t.to_string())
            .unwrap_or_else(|| serial.to_string());
        self.events
            .print(format!("{{{}}} {} Start", display, operation));
        match step.await {
            Ok(()) => {
                self.events
                    .print(format!("{{{}}} {} Succeed", display, operation));
                Ok(())
            }
            Err(e) => {
                self.events
                    .operation_error(operation, vec![serial.to_string()], e.to_string());
                Err(e)
            }
        }
    }

    fn manual_eligible(&self, serial: &str) -> bool {
        match self.registry.target(serial) {
            Some(target) => {
                target.provision_status != ProvisionStatus::Reboot(Phase::InProgress)
            }
            None => false,
        }
    }

    /// Manual mode: fuse the vboot key on each selected target, rebooting to
    /// verify the lock took.
    pub async fn manual_fuse_vboot(&self, serials: &[String]) {
        let mut pending = Vec::new();
        for serial in serials {
            if !self.manual_eligible(serial) {
                continue;
            }
            let target = self.registry.target(serial).expect("eligible target");
            if !self.provisioner.test_mode() && target.provision_state.bootloader_locked {
                self.events
                    .alert(format!("{} already has its vboot key fused", target));
                continue;
            }
            self.registry.set_status(serial, ProvisionStatus::Waiting);
            pending.push(serial.clone());
        }
        for serial in pending {
            if self
                .run_logged(&serial, "Fuse bootloader verified boot key", {
                    let p = Arc::clone(&self.provisioner);
                    let s = serial.clone();
                    async move { p.fuse_vboot(&s).await }
                })
                .await
                .is_ok()
            {
                let _ = self
                    .run_logged(&serial, "Verify bootloader locked, rebooting", {
                        let p = Arc::clone(&self.provisioner);
                        let s = serial.clone();
                        async move { p.reboot_and_wait(&s).await }
                    })
                    .await;
            }
        }
    }

    pub async fn manual_fuse_perm_attr(&self, serials: &[String]) {
        for serial in serials {
            if !self.manual_eligible(serial) {
                continue;
            }
            self.registry.set_status(serial, ProvisionStatus::Waiting);
            let _ = self
                .run_logged(serial, "Fuse permanent attributes", {
                    let p = Arc::clone(&self.provisioner);
                    let s = serial.clone();
                    async move { p.fuse_perm_attr(&s).await }
                })
                .await;
        }
    }

    pub async fn manual_lock_avb(&self, serials: &[String]) {
        for serial in serials {
            if !self.manual_eligible(serial) {
                continue;
            }
            self.registry.set_status(serial, ProvisionStatus::Waiting);
            let _ = self
                .run_logged(serial, "Lock android verified boot", {
                    let p = Arc::clone(&self.provisioner);
                    let s = serial.clone();
                    async move { p.lock_avb(&s).await }
                })
                .await;
        }
    }

    pub async fn manual_unlock_avb(&self, serials: &[String]) {
        for serial in serials {
            if !self.manual_eligible(serial) {
                continue;
            }
            self.registry.set_status(serial, ProvisionStatus::Waiting);
            let _ = self
                .run_logged(serial, "Unlock android verified boot", {
                    let p = Arc::clone(&self.provisioner);
                    let s = serial.clone();
                    async move { p.unlock_avb(&s).await }
                })
                .await;
        }
    }

    /// Manual key transfer; re-arms the low-key alert latches.
    pub async fn manual_provision(&self, serials: &[String], is_som: bool) {
        self.first_alert_shown.store(false, Ordering::SeqCst);
        self.second_alert_shown.store(false, Ordering::SeqCst);
        let operation = if is_som {
            "SoM Attestation Key Provisioning"
        } else {
            "Product Attestation Key Provisioning"
        };
        for serial in serials {
            if !self.manual_eligible(serial) {
                continue;
            }
            self.registry.set_status(serial, ProvisionStatus::Waiting);
            let result = self
                .run_logged(serial, operation, {
                    let p = Arc::clone(&self.provisioner);
                    let s = serial.clone();
                    async move { p.provision(&s, is_som).await }
                })
                .await;
            self.after_provision(result.is_ok(), is_som).await;
        }
    }
}
