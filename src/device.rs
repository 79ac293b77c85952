//! Records for the devices tracked on the factory line.

use std::fmt;

/// The five independent facets of a target's provisioning progress, read
/// back from the device itself.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ProvisionState {
    pub bootloader_locked: bool,
    pub avb_perm_attr_set: bool,
    pub avb_locked: bool,
    pub product_provisioned: bool,
    pub som_provisioned: bool,
}

/// Outcome phase of a step.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Phase {
    InProgress,
    Success,
    Failed,
}

/// What a target is currently showing on the console.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProvisionStatus {
    Idle,
    Waiting,
    FuseVboot(Phase),
    Reboot(Phase),
    FuseAttr(Phase),
    LockAvb(Phase),
    Provision(Phase),
    UnlockAvb(Phase),
    SomProvision(Phase),
}

impl ProvisionStatus {
    fn phase(&self) -> Option<Phase> {
        match self {
            ProvisionStatus::Idle | ProvisionStatus::Waiting => None,
            ProvisionStatus::FuseVboot(p)
            | ProvisionStatus::Reboot(p)
            | ProvisionStatus::FuseAttr(p)
            | ProvisionStatus::LockAvb(p)
            | ProvisionStatus::Provision(p)
            | ProvisionStatus::UnlockAvb(p)
            | ProvisionStatus::SomProvision(p) => Some(*p),
        }
    }

    pub fn is_processing(&self) -> bool {
        self.phase() == Some(Phase::InProgress)
    }

    pub fn is_success(&self) -> bool {
        self.phase() == Some(Phase::Success)
    }

    pub fn is_failed(&self) -> bool {
        self.phase() == Some(Phase::Failed)
    }
}

impl fmt::Display for ProvisionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use Phase::*;
        use ProvisionStatus::*;
        let text = match self {
            Idle => "Idle",
            Waiting => "Waiting",
            FuseVboot(InProgress) => "Fusing VbootKey...",
            FuseVboot(Success) => "Bootloader Locked",
            FuseVboot(Failed) => "Lock Vboot Failed",
            Reboot(InProgress) => "Rebooting...",
            Reboot(Success) => "Rebooted",
            Reboot(Failed) => "Reboot Failed",
            FuseAttr(InProgress) => "Fusing PermAttr",
            FuseAttr(Success) => "PermAttr Fused",
            FuseAttr(Failed) => "Fuse PermAttr Failed",
            LockAvb(InProgress) => "Locking AVB",
            LockAvb(Success) => "AVB Locked",
            LockAvb(Failed) => "Lock AVB Failed",
            Provision(InProgress) => "Giving Key",
            Provision(Success) => "Success",
            Provision(Failed) => "Provision Failed",
            UnlockAvb(InProgress) => "Unlocking AVB",
            UnlockAvb(Success) => "AVB Unlocked",
            UnlockAvb(Failed) => "Unlock AVB Failed",
            SomProvision(InProgress) => "Giving SoMKey",
            SomProvision(Success) => "SoM Key Stored",
            SomProvision(Failed) => "SoM Key Failed",
        };
        write!(f, "{}", text)
    }
}

/// One target device on the line, keyed by serial. Other components hold the
/// serial only and look the record up through the registry.
#[derive(Clone, Debug)]
pub struct TargetDevice {
    pub serial: String,
    pub location: Option<String>,
    pub provision_status: ProvisionStatus,
    pub provision_state: ProvisionState,
    /// Filled after a successful product key transfer.
    pub at_attest_uuid: Option<String>,
    /// Name of the operation currently holding the device token, display only.
    pub operation: Option<String>,
}

impl TargetDevice {
    pub fn new(serial: impl Into<String>, location: Option<String>) -> Self {
        Self {
            serial: serial.into(),
            location,
            provision_status: ProvisionStatus::Idle,
            provision_state: ProvisionState::default(),
            at_attest_uuid: None,
            operation: None,
        }
    }

    /// Placeholder standing in for a device that is expected to vanish from
    /// enumeration while it reboots.
    pub fn rebooting(serial: impl Into<String>, location: Option<String>) -> Self {
        let mut device = Self::new(serial, location);
        device.provision_status = ProvisionStatus::Reboot(Phase::InProgress);
        device
    }
}

impl fmt::Display for TargetDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.location {
            Some(location) => write!(f, "{} at location: {}", self.serial, location),
            None => write!(f, "{}", self.serial),
        }
    }
}

/// The one appliance on the line.
#[derive(Clone, Debug)]
pub struct ApplianceDevice {
    pub serial: String,
    pub location: Option<String>,
    /// `None` unknown, `-1` last query errored, otherwise last known count.
    pub keys_left: Option<i64>,
    pub operation: Option<String>,
}

impl ApplianceDevice {
    pub fn new(serial: impl Into<String>, location: Option<String>) -> Self {
        Self {
            serial: serial.into(),
            location,
            keys_left: None,
            operation: None,
        }
    }
}

impl fmt::Display for ApplianceDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.location {
            Some(location) => write!(f, "{} at location: {}", self.serial, location),
            None => write!(f, "{}", self.serial),
        }
    }
}
