//! The per-target provisioning state machine.
//!
//! Each step reads the device, performs one fastboot transaction, refreshes
//! the observed provision state, and asserts the step actually took. Steps
//! hold the target's operation token for their whole duration; the provision
//! step additionally takes the appliance token, always target first.

use crate::{
    atap::{codec, Algorithm, Operation, MIN_CA_REQUEST_LEN},
    atfa::ApplianceManager,
    device::{Phase, ProvisionStatus, TargetDevice},
    error::{Error, Result},
    events::EventSender,
    fastboot::{Fastboot, FastbootDevice},
    product::DescriptorStore,
    reboot::RebootTracker,
    registry::{DeviceRegistry, OperationGuard, StatusProbe},
};
use async_trait::async_trait;
use log::{debug, info};
use std::{
    fs,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::sync::oneshot;
use uuid::Uuid;

const BOOTLOADER_PREFIX: &str = "(bootloader) ";
/// Some boards report this instead of an empty attestation uuid.
const NOT_PROVISIONED: &str = "NOT_PROVISIONED";

pub struct Provisioner {
    fastboot: Arc<Fastboot>,
    registry: Arc<DeviceRegistry>,
    reboots: Arc<RebootTracker>,
    descriptors: Arc<DescriptorStore>,
    appliance: Arc<ApplianceManager>,
    events: EventSender,
    unlock_credential: Option<String>,
    test_mode: bool,
    reboot_timeout: Duration,
}

impl Provisioner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        fastboot: Arc<Fastboot>,
        registry: Arc<DeviceRegistry>,
        reboots: Arc<RebootTracker>,
        descriptors: Arc<DescriptorStore>,
        appliance: Arc<ApplianceManager>,
        events: EventSender,
        unlock_credential: Option<String>,
        test_mode: bool,
        reboot_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            fastboot,
            registry,
            reboots,
            descriptors,
            appliance,
            events,
            unlock_credential,
            test_mode,
            reboot_timeout,
        })
    }

    pub fn reboot_timeout(&self) -> Duration {
        self.reboot_timeout
    }

    pub fn test_mode(&self) -> bool {
        self.test_mode
    }

    /// Re-read everything the device reports about its provision progress
    /// and compute the display status from the highest facet that holds.
    pub async fn refresh_status(&self, device: &mut TargetDevice) -> Result<()> {
        let handle = self.fastboot.device(&device.serial);
        // The vboot state answer spans multiple bootloader lines.
        let state_string = handle.get_var_output("at-vboot-state").await?;

        device.provision_status = ProvisionStatus::Idle;
        device.provision_state = Default::default();
        device.at_attest_uuid = None;
        let mut status_set = false;

        // Boards without a provisioned key may error on this query.
        if let Ok(uuid) = handle.get_var("at-attest-uuid").await {
            if !uuid.is_empty() && uuid != NOT_PROVISIONED {
                device.at_attest_uuid = Some(uuid);
                device.provision_state.product_provisioned = true;
                device.provision_status = ProvisionStatus::Provision(Phase::Success);
                status_set = true;
            }
        }

        let state = parse_state_string(&state_string);
        if state_value(&state, "avb-locked") {
            device.provision_state.avb_locked = true;
            if !status_set {
                device.provision_status = ProvisionStatus::LockAvb(Phase::Success);
                status_set = true;
            }
        }

        if self.check_som_status(&handle).await {
            device.provision_state.som_provisioned = true;
            if !status_set {
                device.provision_status = ProvisionStatus::SomProvision(Phase::Success);
                status_set = true;
            }
        }

        if state_value(&state, "avb-perm-attr-set") {
            device.provision_state.avb_perm_attr_set = true;
            if !status_set {
                device.provision_status = ProvisionStatus::FuseAttr(Phase::Success);
                status_set = true;
            }
        }

        if state_value(&state, "bootloader-locked") {
            device.provision_state.bootloader_locked = true;
            if !status_set {
                device.provision_status = ProvisionStatus::FuseVboot(Phase::Success);
            }
        }

        debug!("{} state refreshed: {:?}", device.serial, device.provision_state);
        Ok(())
    }

    /// Refresh the live registry record and return the updated snapshot.
    async fn refresh_target(&self, serial: &str) -> Result<TargetDevice> {
        let mut device = self.registry.target(serial).ok_or(Error::DeviceNotFound)?;
        self.refresh_status(&mut device).await?;
        let snapshot = device.clone();
        self.registry.with_target(serial, move |t| {
            t.provision_state = device.provision_state;
            t.provision_status = device.provision_status;
            t.at_attest_uuid = device.at_attest_uuid;
        });
        Ok(snapshot)
    }

    /// Probe whether the device already holds a SoM key. The device answers a
    /// staged Operation Start with its CA Request; a reply longer than the
    /// smallest possible product request means the SoM certificate field is
    /// populated. Any transport failure reads as "no SoM key".
    async fn check_som_status(&self, handle: &FastbootDevice) -> bool {
        let algorithm = match self.algorithm_for(handle).await {
            Ok(algorithm) => algorithm,
            Err(_) => return false,
        };
        let scratch = match tempfile::tempdir() {
            Ok(dir) => dir,
            Err(_) => return false,
        };
        let op_start = scratch.path().join("operation_start.bin");
        let ca_request = scratch.path().join("ca_request.bin");

        if fs::write(&op_start, codec::probe_operation_start(algorithm)).is_err() {
            return false;
        }
        if handle.download(&op_start).await.is_err() {
            return false;
        }
        if handle.oem("at-get-ca-request", false).await.is_err() {
            return false;
        }
        if handle.upload(&ca_request).await.is_err() {
            return false;
        }
        match fs::metadata(&ca_request) {
            Ok(meta) => meta.len() > MIN_CA_REQUEST_LEN as u64,
            Err(_) => false,
        }
    }

    /// Negotiate the key exchange curve: X25519 when offered, else P256.
    async fn algorithm_for(&self, handle: &FastbootDevice) -> Result<Algorithm> {
        let at_attest_dh = handle.get_var("at-attest-dh").await?;
        choose_algorithm(&parse_algorithm_ids(&at_attest_dh))
    }

    fn start_target(&self, serial: &str, operation: &str) -> Result<OperationGuard> {
        if self.registry.target(serial).is_none() {
            return Err(Error::DeviceNotFound);
        }
        self.registry
            .try_start_operation(serial, operation)
            .map_err(|running| {
                let message = format!(
                    "Unable to start operation: {}, Target: {} is currently in another operation: {}. Please try again later",
                    operation, serial, running
                );
                self.events.alert(message.clone());
                Error::Transport(message)
            })
    }

    fn precondition(&self, holds: bool, message: &str) -> Result<()> {
        if self.test_mode || holds {
            Ok(())
        } else {
            Err(Error::StepRefused(message.to_string()))
        }
    }

    /// Fuse the verified boot key. The device resets itself on success, so
    /// the caller follows up with [`Self::reboot_and_wait`].
    pub async fn fuse_vboot(&self, serial: &str) -> Result<()> {
        let vboot_key = match self.descriptors.vboot_key() {
            Ok(key) => key,
            Err(e) => {
                self.registry
                    .set_status(serial, ProvisionStatus::FuseVboot(Phase::Failed));
                return Err(e);
            }
        };

        let _guard = self.start_target(serial, "Fuse bootloader verified boot key")?;
        self.registry
            .set_status(serial, ProvisionStatus::FuseVboot(Phase::InProgress));

        let result = async {
            let handle = self.fastboot.device(serial);
            let scratch = tempfile::tempdir()?;
            let key_file = scratch.path().join(Uuid::new_v4().to_string());
            fs::write(&key_file, &vboot_key)?;
            handle.download(&key_file).await?;
            handle.oem("fuse at-bootloader-vboot-key", false).await?;
            Ok(())
        }
        .await;

        if result.is_err() {
            self.registry
                .set_status(serial, ProvisionStatus::FuseVboot(Phase::Failed));
        } else {
            info!("{} vboot key fused", serial);
        }
        result
    }

    /// Reset the device and wait for it to come back, then check that the
    /// bootloader reports locked.
    pub async fn reboot_and_wait(&self, serial: &str) -> Result<()> {
        let handle = self.fastboot.device(serial);
        let (tx, rx) = oneshot::channel::<bool>();
        let slot = Arc::new(Mutex::new(Some(tx)));

        let success_slot = Arc::clone(&slot);
        let on_success = Box::new(move || {
            if let Some(tx) = success_slot.lock().expect("reboot slot").take() {
                let _ = tx.send(true);
            }
        });
        let timeout_slot = Arc::clone(&slot);
        let on_timeout = Box::new(move || {
            if let Some(tx) = timeout_slot.lock().expect("reboot slot").take() {
                let _ = tx.send(false);
            }
        });

        {
            let _pause = self.registry.pause();
            if let Err(e) = self
                .reboots
                .reboot(&handle, self.reboot_timeout, on_success, on_timeout)
                .await
            {
                self.registry
                    .set_status(serial, ProvisionStatus::Reboot(Phase::Failed));
                return Err(e);
            }
        }

        match rx.await {
            Ok(true) => {
                let target = self.registry.target(serial).ok_or(Error::DeviceNotFound)?;
                if target.provision_state.bootloader_locked {
                    info!("{} back after reboot, bootloader locked", serial);
                    Ok(())
                } else {
                    self.registry
                        .set_status(serial, ProvisionStatus::FuseVboot(Phase::Failed));
                    Err(Error::Transport("Status not updated.".into()))
                }
            }
            _ => {
                self.registry
                    .set_status(serial, ProvisionStatus::Reboot(Phase::Failed));
                Err(Error::Transport("Reboot timed out".into()))
            }
        }
    }

    /// Fuse the 1052 byte permanent attribute.
    pub async fn fuse_perm_attr(&self, serial: &str) -> Result<()> {
        let product = match self.descriptors.product() {
            Some(product) => product,
            None => {
                self.registry
                    .set_status(serial, ProvisionStatus::FuseAttr(Phase::Failed));
                return Err(Error::ProductNotSpecified);
            }
        };
        let target = self.registry.target(serial).ok_or(Error::DeviceNotFound)?;
        self.precondition(
            target.provision_state.bootloader_locked && !target.provision_state.avb_perm_attr_set,
            "permanent attribute fuse needs a locked bootloader and an unset attribute",
        )?;

        let _guard = self.start_target(serial, "Fuse permanent attributes")?;
        self.registry
            .set_status(serial, ProvisionStatus::FuseAttr(Phase::InProgress));

        let result = async {
            let handle = self.fastboot.device(serial);
            let scratch = tempfile::tempdir()?;
            let attr_file = scratch.path().join(Uuid::new_v4().to_string());
            fs::write(&attr_file, &product.product_attributes)?;
            handle.download(&attr_file).await?;
            handle.oem("fuse at-perm-attr", false).await?;

            let refreshed = self.refresh_target(serial).await?;
            if !refreshed.provision_state.avb_perm_attr_set {
                return Err(Error::Transport("Status not updated".into()));
            }
            Ok(())
        }
        .await;

        if result.is_err() {
            self.registry
                .set_status(serial, ProvisionStatus::FuseAttr(Phase::Failed));
        } else {
            info!("{} permanent attribute fused", serial);
        }
        result
    }

    /// Lock android verified boot.
    pub async fn lock_avb(&self, serial: &str) -> Result<()> {
        let target = self.registry.target(serial).ok_or(Error::DeviceNotFound)?;
        self.precondition(
            target.provision_state.bootloader_locked
                && target.provision_state.avb_perm_attr_set
                && !target.provision_state.avb_locked,
            "avb lock needs the vboot key and permanent attribute fused first",
        )?;

        let _guard = self.start_target(serial, "Lock android verified boot")?;
        self.registry
            .set_status(serial, ProvisionStatus::LockAvb(Phase::InProgress));

        let result = async {
            let handle = self.fastboot.device(serial);
            handle.oem("at-lock-vboot", false).await?;
            let refreshed = self.refresh_target(serial).await?;
            if !refreshed.provision_state.avb_locked {
                return Err(Error::Transport("Status not updated".into()));
            }
            Ok(())
        }
        .await;

        if result.is_err() {
            self.registry
                .set_status(serial, ProvisionStatus::LockAvb(Phase::Failed));
        } else {
            info!("{} avb locked", serial);
        }
        result
    }

    /// Unlock android verified boot, with the configured credential if any.
    pub async fn unlock_avb(&self, serial: &str) -> Result<()> {
        let _guard = self.start_target(serial, "Unlock android verified boot")?;
        self.registry
            .set_status(serial, ProvisionStatus::UnlockAvb(Phase::InProgress));

        let result = async {
            let handle = self.fastboot.device(serial);
            let command = match &self.unlock_credential {
                Some(credential) => format!("at-unlock-vboot {}", credential),
                None => "at-unlock-vboot".to_string(),
            };
            handle.oem(command, false).await?;
            let refreshed = self.refresh_target(serial).await?;
            if refreshed.provision_state.avb_locked {
                return Err(Error::Transport("Status not updated".into()));
            }
            Ok(())
        }
        .await;

        if result.is_err() {
            self.registry
                .set_status(serial, ProvisionStatus::UnlockAvb(Phase::Failed));
        } else {
            info!("{} avb unlocked", serial);
        }
        result
    }

    /// Transfer an attestation key from the appliance to the target.
    ///
    /// Token order is fixed: target first, then appliance, so provisioning
    /// can never deadlock against an appliance-only operation.
    pub async fn provision(&self, serial: &str, is_som: bool) -> Result<()> {
        let failed_status = if is_som {
            ProvisionStatus::SomProvision(Phase::Failed)
        } else {
            ProvisionStatus::Provision(Phase::Failed)
        };

        let target = self.registry.target(serial).ok_or(Error::DeviceNotFound)?;
        if is_som {
            self.precondition(
                target.provision_state.bootloader_locked && !target.provision_state.som_provisioned,
                "SoM key provisioning needs a locked bootloader and no SoM key present",
            )?;
        } else {
            self.precondition(
                !target.provision_state.product_provisioned
                    && target.provision_state.bootloader_locked
                    && target.provision_state.avb_perm_attr_set
                    && target.provision_state.avb_locked,
                "product key provisioning needs every earlier step done and no key present",
            )?;
        }

        let operation = if is_som {
            "SoM Attestation Key Provisioning"
        } else {
            "Product Attestation Key Provisioning"
        };
        let _target_guard = self.start_target(serial, operation)?;

        let appliance_serial = self.registry.appliance_serial();
        let appliance_serial = match appliance_serial {
            Some(serial) => serial,
            None => {
                self.registry.set_status(serial, failed_status);
                return Err(Error::DeviceNotFound);
            }
        };
        let _appliance_guard = self
            .registry
            .try_start_operation(&appliance_serial, operation)
            .map_err(|running| {
                let message = format!(
                    "Unable to start operation: {}, the appliance is currently in another operation: {}. Please try again later",
                    operation, running
                );
                self.events.alert(message.clone());
                Error::Transport(message)
            })?;

        self.registry.set_status(
            serial,
            if is_som {
                ProvisionStatus::SomProvision(Phase::InProgress)
            } else {
                ProvisionStatus::Provision(Phase::InProgress)
            },
        );

        let result = self
            .run_provision_exchange(serial, &appliance_serial, is_som)
            .await;
        if result.is_err() {
            self.registry.set_status(serial, failed_status);
        }
        result
    }

    async fn run_provision_exchange(
        &self,
        serial: &str,
        appliance_serial: &str,
        is_som: bool,
    ) -> Result<()> {
        let target = self.fastboot.device(serial);
        let appliance = self.fastboot.device(appliance_serial);

        // Certificates the appliance emits must validate against real time.
        self.appliance.set_time_on(&appliance).await?;

        let algorithm = self.algorithm_for(&target).await?;
        let start_command = if is_som {
            format!(
                "start-provisioning {} {}",
                algorithm.id(),
                Operation::IssueSom.id()
            )
        } else {
            format!("start-provisioning {}", algorithm.id())
        };
        appliance.oem(start_command, false).await?;

        // Operation Start travels appliance -> target, then the CA Request
        // comes back, then the CA Response goes out again.
        self.transfer_content(&appliance, &target).await?;
        target.oem("at-get-ca-request", false).await?;
        self.transfer_content(&target, &appliance).await?;
        appliance.oem("finish-provisioning", false).await?;
        self.transfer_content(&appliance, &target).await?;
        target.oem("at-set-ca-response", false).await?;

        let refreshed = self.refresh_target(serial).await?;
        let provisioned = if is_som {
            refreshed.provision_state.som_provisioned
        } else {
            refreshed.provision_state.product_provisioned
        };
        if !provisioned {
            return Err(Error::Transport("Status not updated.".into()));
        }
        if !is_som {
            info!(
                "{} provisioned, at-attest-uuid: {}",
                serial,
                refreshed.at_attest_uuid.as_deref().unwrap_or("")
            );
        } else {
            info!("{} SoM key stored", serial);
        }
        Ok(())
    }

    /// Move the staged blob from one device to the other through a scratch
    /// file that is removed even when a transfer leg fails.
    async fn transfer_content(&self, src: &FastbootDevice, dst: &FastbootDevice) -> Result<()> {
        let scratch = tempfile::tempdir()?;
        let file = scratch.path().join(Uuid::new_v4().to_string());
        src.upload(&file).await?;
        dst.download(&file).await?;
        Ok(())
    }
}

#[async_trait]
impl StatusProbe for Provisioner {
    async fn refresh(&self, device: &mut TargetDevice) -> Result<()> {
        self.refresh_status(device).await
    }
}

/// Parse the `at-vboot-state` report into key/value pairs. Only lines with
/// exactly one separator count; the multi-valued version lines are noise.
fn parse_state_string(state_string: &str) -> Vec<(String, String)> {
    let mut state = Vec::new();
    for line in state_string.lines() {
        let line = match line.strip_prefix(BOOTLOADER_PREFIX) {
            Some(rest) => rest,
            None => continue,
        };
        let parts: Vec<&str> = line
            .split(|c| c == ':' || c == '=')
            .map(str::trim)
            .collect();
        if parts.len() == 2 {
            state.push((parts[0].to_string(), parts[1].to_string()));
        }
    }
    state
}

fn state_value(state: &[(String, String)], key: &str) -> bool {
    state
        .iter()
        .any(|(k, v)| k == key && v == "1")
}

/// `at-attest-dh` is a comma separated list of `id:name` pairs.
fn parse_algorithm_ids(at_attest_dh: &str) -> Vec<u8> {
    at_attest_dh
        .split(',')
        .filter_map(|entry| entry.split(':').next())
        .filter_map(|id| id.trim().parse().ok())
        .collect()
}

fn choose_algorithm(ids: &[u8]) -> Result<Algorithm> {
    if ids.contains(&Algorithm::X25519.id()) {
        Ok(Algorithm::X25519)
    } else if ids.contains(&Algorithm::P256.id()) {
        Ok(Algorithm::P256)
    } else {
        Err(Error::NoAlgorithm)
    }
}
