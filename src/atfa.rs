//! Appliance-only operations.
//!
//! Everything that mutates the appliance goes through here so the appliance
//! token serializes the whole class of operations: key bundle processing,
//! firmware update, purges, key counting, and audit/registration pulls.

use crate::{
    audit::AuditRotation,
    error::{Error, Result},
    events::EventSender,
    fastboot::{Fastboot, FastbootDevice},
    product::DescriptorStore,
    registry::{DeviceRegistry, OperationGuard},
};
use chrono::Utc;
use log::{info, warn};
use std::{
    fs,
    path::Path,
    sync::{Arc, Mutex},
    time::Duration,
};

/// Appliance answers containing these fragments mean the queried product or
/// SoM has no keys loaded at all, which reports as a count of zero.
const NO_MATCHING_FRAGMENTS: [&str; 2] =
    ["No matching available products", "No matching available SoMs"];

const BOOTLOADER_PREFIX: &str = "(bootloader) ";

/// What `prepare_file` asks the appliance to stage.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ApplianceFile {
    Reg,
    Audit,
}

impl ApplianceFile {
    fn command(self) -> &'static str {
        match self {
            ApplianceFile::Reg => "reg",
            ApplianceFile::Audit => "audit",
        }
    }
}

pub struct ApplianceManager {
    fastboot: Arc<Fastboot>,
    registry: Arc<DeviceRegistry>,
    descriptors: Arc<DescriptorStore>,
    events: EventSender,
    audit: Mutex<AuditRotation>,
}

impl ApplianceManager {
    pub fn new(
        fastboot: Arc<Fastboot>,
        registry: Arc<DeviceRegistry>,
        descriptors: Arc<DescriptorStore>,
        events: EventSender,
        audit: AuditRotation,
    ) -> Arc<Self> {
        Arc::new(Self {
            fastboot,
            registry,
            descriptors,
            events,
            audit: Mutex::new(audit),
        })
    }

    fn device(&self) -> Result<FastbootDevice> {
        let serial = self
            .registry
            .appliance_serial()
            .ok_or(Error::DeviceNotFound)?;
        Ok(self.fastboot.device(serial))
    }

    /// Take the appliance token or fail with a message naming the operation
    /// currently holding it.
    fn start(&self, operation: &str) -> Result<(FastbootDevice, OperationGuard)> {
        let device = self.device()?;
        let guard = self
            .registry
            .try_start_operation(device.serial(), operation)
            .map_err(|running| {
                Error::Transport(format!(
                    "appliance is busy with another operation: {}",
                    running
                ))
            })?;
        Ok((device, guard))
    }

    /// Like [`Self::start`] but waits for the token. Only the background key
    /// ingest uses this; back-pressure there is wanted.
    async fn start_blocking(&self, operation: &str) -> Result<(FastbootDevice, OperationGuard)> {
        let device = self.device()?;
        let guard = self
            .registry
            .start_operation_blocking(device.serial(), operation)
            .await;
        Ok((device, guard))
    }

    /// Inject the host UTC time; appliance certificate checks need it.
    pub async fn set_time(&self) -> Result<()> {
        let (device, _guard) = self.start("Set appliance time")?;
        self.set_time_on(&device).await
    }

    pub(crate) async fn set_time_on(&self, device: &FastbootDevice) -> Result<()> {
        let now = Utc::now().format("%Y-%m-%d %H:%M:%S");
        device.oem(format!("set-date {}", now), false).await?;
        Ok(())
    }

    /// Query how many keys remain for the selected product or SoM, cache the
    /// answer on the appliance record, and drive the audit pull policy.
    pub async fn update_keys_left(&self, is_som: bool) -> Result<i64> {
        let id = self.key_id(is_som)?;
        let command = if is_som { "num-som-keys" } else { "num-keys" };

        let keys_left = {
            let (device, _guard) = self.start("Check appliance key count")?;
            match device.oem(format!("{} {}", command, id), true).await {
                Ok(output) => match parse_keys_left(&output) {
                    Some(n) => n,
                    None => {
                        self.registry.with_appliance(|a| a.keys_left = Some(-1));
                        return Err(Error::Transport(
                            "ATFA device response has invalid format".into(),
                        ));
                    }
                },
                Err(Error::Transport(msg))
                    if NO_MATCHING_FRAGMENTS.iter().any(|f| msg.contains(f)) =>
                {
                    0
                }
                Err(e) => {
                    self.registry.with_appliance(|a| a.keys_left = Some(-1));
                    return Err(e);
                }
            }
        };

        self.registry.with_appliance(|a| a.keys_left = Some(keys_left));
        info!("appliance keys left: {}", keys_left);

        // The token is free again; the audit pull takes its own.
        self.maybe_pull_audit(keys_left).await;
        Ok(keys_left)
    }

    /// Store and process a staged key bundle. `blocking` is set by the
    /// automatic ingest, which would rather wait than skip a tick.
    pub async fn process_key(&self, path: &Path, blocking: bool) -> Result<()> {
        {
            let operation = "ATFA device store and process key bundle";
            let (device, _guard) = if blocking {
                self.start_blocking(operation).await?
            } else {
                self.start(operation)?
            };
            self.set_time_on(&device).await?;
            device.download(path).await?;
            device.oem("keybundle", false).await?;
        }
        info!("key bundle {} processed", path.display());

        // A fresh bundle changes the supply: force the next audit pull and
        // refresh the count.
        self.audit.lock().expect("audit rotation").reset();
        let is_som = self.descriptors.is_som();
        if self.descriptors.current().is_some() {
            let _ = self.update_keys_left(is_som).await;
        }
        Ok(())
    }

    /// Flash an appliance OS update file.
    pub async fn update(&self, path: &Path) -> Result<()> {
        let (device, _guard) = self.start("Update appliance OS")?;
        self.set_time_on(&device).await?;
        device.download(path).await?;
        device.oem("update", false).await?;
        Ok(())
    }

    /// Remove every key for the selected product or SoM.
    pub async fn purge(&self, is_som: bool) -> Result<()> {
        let id = self.key_id(is_som)?;
        {
            let (device, _guard) = self.start("Purge appliance keys")?;
            let command = if is_som { "purge-som" } else { "purge" };
            device.oem(format!("{} {}", command, id), false).await?;
        }
        self.update_keys_left(is_som).await?;
        Ok(())
    }

    /// Ask the appliance to stage a reg or audit file, then pull it to
    /// `filepath`. Returns whether the pull succeeded.
    pub async fn get_file(&self, filepath: &Path, kind: ApplianceFile, show_alert: bool) -> bool {
        let operation = format!("ATFA device prepare and download {} file", kind.command());
        let result: Result<()> = async {
            let (device, _guard) = self.start(&operation)?;
            fs::write(filepath, b"")?;
            device.oem(kind.command(), false).await?;
            device.upload(filepath).await?;
            Ok(())
        }
        .await;

        match result {
            Ok(()) => {
                info!("{} file saved to {}", kind.command(), filepath.display());
                if show_alert {
                    self.events.alert(format!(
                        "{} file downloaded to {}",
                        kind.command(),
                        filepath.display()
                    ));
                }
                true
            }
            Err(e) => {
                warn!("{} failed: {}", operation, e);
                if show_alert {
                    self.events.alert(format!(
                        "Cannot get {} file from the appliance: {}",
                        kind.command(),
                        e
                    ));
                }
                false
            }
        }
    }

    /// Ask the appliance to stage a reg or audit file without pulling it;
    /// the caller uploads at its own pace.
    pub async fn prepare_file(&self, kind: ApplianceFile) -> Result<()> {
        let operation = format!("ATFA device prepare {} file", kind.command());
        let (device, _guard) = self.start(&operation)?;
        device.oem(kind.command(), false).await?;
        Ok(())
    }

    pub async fn reboot(&self) -> Result<()> {
        let (device, _guard) = self.start("Reboot appliance")?;
        device.oem("reboot", false).await?;
        Ok(())
    }

    pub async fn shutdown(&self) -> Result<()> {
        let (device, _guard) = self.start("Shutdown appliance")?;
        device.oem("shutdown", false).await?;
        Ok(())
    }

    /// The appliance's own idea of its serial.
    pub async fn get_serial(&self) -> Result<String> {
        self.device()?.get_var("serial").await
    }

    /// Poll the registry until the appliance is back, bounded by `timeout`.
    /// Used after updates and reboots.
    pub async fn wait_for_appliance(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.registry.appliance_serial().is_some() {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }

    /// Force the next audit check to pull; called when a new appliance or a
    /// new product becomes current.
    pub fn reset_audit(&self) {
        self.audit.lock().expect("audit rotation").reset();
    }

    async fn maybe_pull_audit(&self, keys_left: i64) {
        if keys_left < 0 {
            return;
        }
        if !self.audit.lock().expect("audit rotation").should_pull(keys_left) {
            return;
        }

        let serial = match self.get_serial().await {
            Ok(serial) => serial,
            Err(Error::DeviceNotFound) => return,
            Err(e) => {
                warn!("audit pull skipped, serial query failed: {}", e);
                return;
            }
        };

        let path = self
            .audit
            .lock()
            .expect("audit rotation")
            .audit_file_path(&serial);
        // Another operation in flight makes the pull fail quietly; the next
        // key count delta retries.
        if !self.get_file(&path, ApplianceFile::Audit, false).await {
            return;
        }

        let mut audit = self.audit.lock().expect("audit rotation");
        audit.record_pull(keys_left);
        if let Err(e) = audit.enforce_retention(&serial) {
            warn!("audit retention failed for {}: {}", serial, e);
        }
    }

    fn key_id(&self, is_som: bool) -> Result<String> {
        match (is_som, self.descriptors.current()) {
            (false, Some(crate::product::Descriptor::Product(info))) => Ok(info.product_id),
            (true, Some(crate::product::Descriptor::Som(info))) => Ok(info.som_id),
            _ => Err(Error::ProductNotSpecified),
        }
    }
}

/// Pull the integer off the first `(bootloader) ` line.
fn parse_keys_left(output: &str) -> Option<i64> {
    for line in output.lines() {
        if let Some(rest) = line.strip_prefix(BOOTLOADER_PREFIX) {
            return rest.trim().parse().ok();
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        device::ApplianceDevice,
        fastboot::tests::{failure_output, scripted_fastboot, success_output, ScriptedExecCommand},
        provision::tests::product_descriptor_store,
    };
    use tempfile::TempDir;

    struct ApplianceFixture {
        script: ScriptedExecCommand,
        registry: Arc<DeviceRegistry>,
        manager: Arc<ApplianceManager>,
        audit_dir: TempDir,
    }

    fn appliance_fixture(rules: Vec<(&str, std::process::Output)>) -> ApplianceFixture {
        let script = ScriptedExecCommand::new(rules);
        let fastboot = scripted_fastboot(&script);
        let registry = DeviceRegistry::new();
        registry.set_appliance(Some(ApplianceDevice::new("ATFA001", None)));
        let (events, _rx) = EventSender::channel();
        let audit_dir = TempDir::new().expect("audit dir");
        let manager = ApplianceManager::new(
            fastboot,
            Arc::clone(&registry),
            product_descriptor_store(),
            events,
            AuditRotation::new(audit_dir.path(), 10),
        );
        ApplianceFixture {
            script,
            registry,
            manager,
            audit_dir,
        }
    }

    #[test]
    fn parses_keys_left_lines() {
        assert_eq!(parse_keys_left("(bootloader) 42\nOKAY\n"), Some(42));
        assert_eq!(
            parse_keys_left("getvar:foo\n(bootloader) 7\r\nfinished\n"),
            Some(7)
        );
        assert_eq!(parse_keys_left("OKAY\n"), None);
        assert_eq!(parse_keys_left("(bootloader) not a number\n"), None);
    }

    #[test]
    fn appliance_file_commands() {
        assert_eq!(ApplianceFile::Reg.command(), "reg");
        assert_eq!(ApplianceFile::Audit.command(), "audit");
    }

    #[tokio::test]
    async fn update_keys_left_caches_count_and_pulls_audit() {
        let fixture = appliance_fixture(vec![
            ("oem num-keys", success_output("(bootloader) 42\n", "")),
            ("getvar serial", success_output("", "serial: ATFA001\n")),
        ]);

        let keys_left = fixture
            .manager
            .update_keys_left(false)
            .await
            .expect("keys left");
        assert_eq!(keys_left, 42);
        assert_eq!(fixture.registry.appliance_keys_left(), Some(42));

        // The first count after startup always pulls an audit file.
        let seen = fixture.script.commands_seen().join("\n");
        assert!(seen.contains("oem audit"));
        let audit_files: Vec<_> = std::fs::read_dir(fixture.audit_dir.path())
            .expect("audit dir")
            .flatten()
            .collect();
        assert_eq!(audit_files.len(), 1);

        // Asking again with no delta leaves the audit state alone.
        fixture.manager.update_keys_left(false).await.expect("again");
        let audit_runs = fixture
            .script
            .commands_seen()
            .iter()
            .filter(|c| c.contains("oem audit"))
            .count();
        assert_eq!(audit_runs, 1);
    }

    #[tokio::test]
    async fn update_keys_left_no_matching_product_reads_zero() {
        let fixture = appliance_fixture(vec![
            (
                "oem num-keys",
                failure_output("", "FAILED: No matching available products\n"),
            ),
            ("getvar serial", success_output("", "serial: ATFA001\n")),
        ]);

        let keys_left = fixture
            .manager
            .update_keys_left(false)
            .await
            .expect("keys left");
        assert_eq!(keys_left, 0);
        assert_eq!(fixture.registry.appliance_keys_left(), Some(0));
    }

    #[tokio::test]
    async fn update_keys_left_bad_answer_marks_error() {
        let fixture = appliance_fixture(vec![
            ("oem num-keys", success_output("nothing useful\n", "")),
            ("getvar serial", success_output("", "serial: ATFA001\n")),
        ]);

        let result = fixture.manager.update_keys_left(false).await;
        assert!(matches!(result, Err(Error::Transport(_))));
        assert_eq!(fixture.registry.appliance_keys_left(), Some(-1));
    }

    #[tokio::test]
    async fn update_keys_left_without_appliance_fails() {
        let fixture = appliance_fixture(vec![]);
        fixture.registry.set_appliance(None);
        assert!(matches!(
            fixture.manager.update_keys_left(false).await,
            Err(Error::DeviceNotFound)
        ));
    }

    #[tokio::test]
    async fn process_key_stages_and_processes_the_bundle() {
        let fixture = appliance_fixture(vec![(
            "getvar serial",
            success_output("", "serial: ATFA001\n"),
        )]);
        let bundle_dir = TempDir::new().expect("bundle dir");
        let bundle = bundle_dir.path().join("ATFA001_batch.atfa");
        std::fs::write(&bundle, b"encrypted bundle").expect("bundle file");

        fixture
            .manager
            .process_key(&bundle, false)
            .await
            .expect("process key");

        let seen = fixture.script.commands_seen().join("\n");
        assert!(seen.contains("oem set-date"));
        assert!(seen.contains(&format!("stage {}", bundle.display())));
        assert!(seen.contains("oem keybundle"));
        // A fresh bundle refreshes the key count too.
        assert!(seen.contains("oem num-keys"));
    }

    #[tokio::test]
    async fn purge_issues_command_and_refreshes_count() {
        let fixture = appliance_fixture(vec![
            ("oem num-keys", success_output("(bootloader) 0\n", "")),
            ("getvar serial", success_output("", "serial: ATFA001\n")),
        ]);

        fixture.manager.purge(false).await.expect("purge");
        let seen = fixture.script.commands_seen().join("\n");
        assert!(seen.contains("oem purge 00000000000000000000000000000000"));
        assert_eq!(fixture.registry.appliance_keys_left(), Some(0));
    }

    #[tokio::test]
    async fn get_file_prepares_and_uploads() {
        let fixture = appliance_fixture(vec![(
            "getvar serial",
            success_output("", "serial: ATFA001\n"),
        )]);
        let out_dir = TempDir::new().expect("out dir");
        let reg_path = out_dir.path().join("device.reg");

        assert!(
            fixture
                .manager
                .get_file(&reg_path, ApplianceFile::Reg, false)
                .await
        );
        let seen = fixture.script.commands_seen().join("\n");
        assert!(seen.contains("oem reg"));
        assert!(seen.contains(&format!("get_staged {}", reg_path.display())));
        assert!(reg_path.exists());
    }

    #[tokio::test]
    async fn get_file_busy_appliance_fails_quietly() {
        let fixture = appliance_fixture(vec![]);
        let _held = fixture
            .registry
            .try_start_operation("ATFA001", "something else")
            .expect("token");
        let out_dir = TempDir::new().expect("out dir");

        assert!(
            !fixture
                .manager
                .get_file(&out_dir.path().join("x.audit"), ApplianceFile::Audit, false)
                .await
        );
        assert!(fixture.script.commands_seen().is_empty());
    }

    #[tokio::test]
    async fn maintenance_operations_each_take_the_token() {
        let fixture = appliance_fixture(vec![]);
        fixture.manager.reboot().await.expect("reboot");
        fixture.manager.shutdown().await.expect("shutdown");
        fixture.manager.prepare_file(ApplianceFile::Reg).await.expect("prepare");
        fixture
            .manager
            .update(Path::new("/tmp/appliance.upd"))
            .await
            .expect("update");

        let seen = fixture.script.commands_seen().join("\n");
        assert!(seen.contains("-s ATFA001 oem reboot"));
        assert!(seen.contains("-s ATFA001 oem shutdown"));
        assert!(seen.contains("-s ATFA001 oem reg"));
        assert!(seen.contains("stage /tmp/appliance.upd"));
        assert!(seen.contains("-s ATFA001 oem update"));
    }
}
