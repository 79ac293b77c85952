//! Interface to the [fastboot][0] host tool, the command channel to every
//! device on the factory line.
//!
//! [0]: https://android.googlesource.com/platform/system/core/+/master/fastboot/

use crate::error::{Error, Result};
use anyhow::Context;
use async_trait::async_trait;
use derive_builder::Builder;
use dyn_clone::{clone_trait_object, DynClone};
use getset::Getters;
use std::{
    fmt::{self, Debug},
    path::{Path, PathBuf},
    process::Output,
    string::ToString,
    sync::Arc,
};
use tokio::{process::Command, sync::RwLock};

#[derive(Builder, Debug, Getters)]
#[builder(pattern = "owned", setter(into))]
/// Fastboot is the main structure to be used when interacting with devices in
/// fastboot mode.
pub struct Fastboot {
    #[get]
    #[builder(private, default = "Box::new(DefaultExecCommand)")]
    /// The executor for fastboot
    exec: Box<dyn ExecCommand>,

    #[get]
    /// Path to the fastboot binary
    binary: PathBuf,

    #[builder(private, default = "Arc::new(RwLock::new(()))")]
    /// Device enumeration transiently hides a device that is mid-transaction
    /// on some hosts, so `devices` must not interleave with any other call.
    /// Commands take the lock shared, enumeration takes it exclusive.
    devices_lock: Arc<RwLock<()>>,
}

impl Fastboot {
    /// Run fastboot with the provided subcommand, addressed to `serial` when
    /// given, and return the raw output of the invocation.
    async fn run(&self, serial: Option<&str>, subcommand: &Subcommand) -> Result<Output> {
        let _shared = self.devices_lock.read().await;
        self.run_unlocked(serial, subcommand).await
    }

    async fn run_unlocked(&self, serial: Option<&str>, subcommand: &Subcommand) -> Result<Output> {
        let mut args = Vec::new();
        if let Some(serial) = serial {
            args.push("-s".to_string());
            args.push(serial.to_string());
        }
        args.extend(subcommand.build_cmd());

        let output = self
            .exec()
            .run_output(self.binary(), &args)
            .await
            .map_err(|e| Error::Transport(format!("{:#}", e)))?;

        if output.status.success() {
            Ok(output)
        } else {
            Err(Error::Transport(merged_output(&output)))
        }
    }

    /// Enumerate the serial numbers of every device in fastboot mode.
    pub async fn list_devices(&self) -> Result<Vec<String>> {
        let _exclusive = self.devices_lock.write().await;
        let output = self.run_unlocked(None, &Subcommand::Devices).await?;
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(|line| line.replace("\tfastboot", "").trim().to_string())
            .filter(|serial| !serial.is_empty())
            .collect())
    }

    /// Create a handle bound to one device serial.
    pub fn device(self: &Arc<Self>, serial: impl Into<String>) -> FastbootDevice {
        FastbootDevice {
            fastboot: Arc::clone(self),
            serial: serial.into(),
        }
    }
}

#[derive(Clone, Debug)]
/// A per-device command handle. Callers must not issue concurrent commands to
/// the same serial; the device operation tokens enforce that.
pub struct FastbootDevice {
    fastboot: Arc<Fastboot>,
    serial: String,
}

impl FastbootDevice {
    pub fn serial(&self) -> &str {
        &self.serial
    }

    /// Run an OEM command. With `err_to_out` the merged output is returned,
    /// otherwise only stdout.
    pub async fn oem(&self, oem_command: impl Into<String>, err_to_out: bool) -> Result<String> {
        let output = self
            .fastboot
            .run(Some(&self.serial), &Subcommand::Oem(oem_command.into()))
            .await?;
        if err_to_out {
            Ok(merged_output(&output))
        } else {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        }
    }

    /// Read a fastboot variable. The value is reported on a `<name>: <value>`
    /// line of the diagnostic stream.
    pub async fn get_var(&self, var: &str) -> Result<String> {
        let output = self
            .fastboot
            .run(Some(&self.serial), &Subcommand::GetVar(var.to_string()))
            .await?;
        let merged = merged_output(&output);
        let prefix = format!("{}: ", var);
        let mut value = None;
        for line in merged.lines() {
            if let Some(rest) = line.strip_prefix(&prefix) {
                value = Some(rest.trim_end_matches('\r').to_string());
            }
        }
        value.ok_or_else(|| Error::Transport(format!("no value for variable {}: {}", var, merged)))
    }

    /// Run `getvar` and return the whole diagnostic output. Some variables
    /// answer across multiple `(bootloader) ` lines instead of a single
    /// `<name>: <value>` line.
    pub async fn get_var_output(&self, var: &str) -> Result<String> {
        let output = self
            .fastboot
            .run(Some(&self.serial), &Subcommand::GetVar(var.to_string()))
            .await?;
        Ok(merged_output(&output))
    }

    /// Push a local file to the device staging area.
    pub async fn download(&self, file_path: &Path) -> Result<()> {
        self.fastboot
            .run(
                Some(&self.serial),
                &Subcommand::Stage(file_path.to_path_buf()),
            )
            .await?;
        Ok(())
    }

    /// Pull the device staging area into a local file.
    pub async fn upload(&self, file_path: &Path) -> Result<()> {
        self.fastboot
            .run(
                Some(&self.serial),
                &Subcommand::GetStaged(file_path.to_path_buf()),
            )
            .await?;
        Ok(())
    }

    /// Request a device reset.
    pub async fn reboot(&self) -> Result<()> {
        self.fastboot
            .run(Some(&self.serial), &Subcommand::Reboot)
            .await?;
        Ok(())
    }
}

impl fmt::Display for FastbootDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.serial)
    }
}

/// Both output streams of a finished invocation, stdout first. `getvar`
/// reports on stderr, so most parsing happens on the merged text.
fn merged_output(output: &Output) -> String {
    let mut merged = String::from_utf8_lossy(&output.stdout).into_owned();
    merged.push_str(&String::from_utf8_lossy(&output.stderr));
    merged
}

#[derive(Clone, Default, Debug)]
/// DefaultExecCommand is a wrapper which can be used to execute fastboot in a
/// standard way.
struct DefaultExecCommand;

impl ExecCommand for DefaultExecCommand {}

#[async_trait]
trait ExecCommand: Debug + DynClone + Send + Sync {
    /// Run a command and return its `Output`.
    async fn run_output(&self, binary: &Path, args: &[String]) -> anyhow::Result<Output> {
        Command::new(binary)
            .args(args)
            .output()
            .await
            .context("run fastboot")
    }
}

clone_trait_object!(ExecCommand);

#[derive(Clone, Debug, Hash, Eq, PartialEq)]
/// Available fastboot subcommands.
pub enum Subcommand {
    /// List connected fastboot devices
    Devices,
    /// Read a bootloader variable
    GetVar(String),
    /// Run a vendor specific command
    Oem(String),
    /// Send a local file to the device staging area
    Stage(PathBuf),
    /// Write the device staging area to a local file
    GetStaged(PathBuf),
    /// Reboot the device
    Reboot,
}

impl Subcommand {
    fn build_cmd(&self) -> Vec<String> {
        use crate::fastboot::Subcommand::*;
        match self {
            Devices => vec!["devices".into()],
            GetVar(var) => vec!["getvar".into(), var.clone()],
            Oem(command) => {
                let mut cmd = vec!["oem".into()];
                cmd.extend(command.split_whitespace().map(ToString::to_string));
                cmd
            }
            Stage(path) => vec!["stage".into(), path.display().to_string()],
            GetStaged(path) => vec!["get_staged".into(), path.display().to_string()],
            Reboot => vec!["reboot".into()],
        }
    }
}
