//! Background ingest of staged key bundle files.
//!
//! A factory drops encrypted key bundles for a given appliance into a
//! staging directory. The ingest task scans it periodically, feeds new files
//! to the appliance, and records processed names in a per-appliance log file
//! so a bundle is never replayed across restarts. A bundle the appliance
//! says it has already consumed is recorded the same way.

use crate::{
    atfa::ApplianceManager,
    error::{Error, Result},
    registry::APPLIANCE_SERIAL_PREFIX,
};
use log::{debug, info, warn};
use std::{
    collections::{HashMap, HashSet},
    fs,
    fs::OpenOptions,
    io::Write,
    path::PathBuf,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::task::JoinHandle;

/// Default scan period.
pub const INGEST_INTERVAL: Duration = Duration::from_secs(300);

pub struct KeyIngest {
    key_dir: PathBuf,
    log_dir: PathBuf,
    /// Extension without any `*.` wildcard prefix, e.g. `atfa`.
    extension: String,
    appliance: Arc<ApplianceManager>,
    processed: Mutex<HashMap<String, HashSet<String>>>,
    interval: Duration,
}

impl KeyIngest {
    pub fn new(
        key_dir: impl Into<PathBuf>,
        log_dir: impl Into<PathBuf>,
        key_file_extension: &str,
        appliance: Arc<ApplianceManager>,
        interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            key_dir: key_dir.into(),
            log_dir: log_dir.into(),
            extension: key_file_extension.replace("*.", ""),
            appliance,
            processed: Mutex::new(HashMap::new()),
            interval,
        })
    }

    /// Rebuild the in-memory dedup sets from every per-appliance log file.
    pub fn load_processed(&self) {
        let entries = match fs::read_dir(&self.log_dir) {
            Ok(entries) => entries,
            Err(_) => return,
        };
        let mut processed = self.processed.lock().expect("processed keys");
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with(APPLIANCE_SERIAL_PREFIX) || !name.ends_with(".log") {
                continue;
            }
            let appliance_id = name.trim_end_matches(".log").to_string();
            let content = match fs::read_to_string(entry.path()) {
                Ok(content) => content,
                Err(_) => continue,
            };
            let set = processed.entry(appliance_id).or_default();
            for line in content.lines() {
                if !line.is_empty() {
                    set.insert(line.to_string());
                }
            }
        }
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

    /// One scan round. Absence of the appliance or of the staging directory
    /// just means "try again next tick".
    pub async fn tick(&self) {
        if !self.key_dir.is_dir() {
            return;
        }
        let appliance_id = match self.appliance.get_serial().await {
            Ok(serial) => serial,
            Err(_) => return,
        };

        for file_name in self.unprocessed_files(&appliance_id) {
            let path = self.key_dir.join(&file_name);
            match self.appliance.process_key(&path, true).await {
                Ok(()) => {
                    info!("key bundle {} stored", file_name);
                    self.record(&appliance_id, &file_name);
                }
                Err(e) if e.is_keybundle_processed() => {
                    // Benign: the bundle reached the appliance some other
                    // way. Record it so it is never offered again.
                    debug!("key bundle {} already processed", file_name);
                    self.record(&appliance_id, &file_name);
                }
                Err(Error::DeviceNotFound) => continue,
                Err(e) => {
                    // Possibly a half-written or corrupt file; leave it for
                    // the next tick.
                    warn!("processing key bundle {} failed: {}", file_name, e);
                }
            }
        }
    }

    fn unprocessed_files(&self, appliance_id: &str) -> Vec<String> {
        let entries = match fs::read_dir(&self.key_dir) {
            Ok(entries) => entries,
            Err(_) => return Vec::new(),
        };
        let processed = self.processed.lock().expect("processed keys");
        let seen = processed.get(appliance_id);
        let mut files: Vec<String> = entries
            .flatten()
            .filter(|e| e.path().is_file())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|name| name.starts_with(appliance_id))
            .filter(|name| name.ends_with(&self.extension))
            .filter(|name| seen.map_or(true, |set| !set.contains(name)))
            .collect();
        files.sort();
        files
    }

    /// Append to the per-appliance log and the in-memory set. The set only
    /// grows: a recorded name is never retried in this process lifetime.
    fn record(&self, appliance_id: &str, file_name: &str) {
        self.processed
            .lock()
            .expect("processed keys")
            .entry(appliance_id.to_string())
            .or_default()
            .insert(file_name.to_string());

        if let Err(e) = self.append_log(appliance_id, file_name) {
            warn!("cannot record {} in ingest log: {}", file_name, e);
        }
    }

    fn append_log(&self, appliance_id: &str, file_name: &str) -> Result<()> {
        let log_path = self.log_path(appliance_id);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)?;
        writeln!(file, "{}", file_name)?;
        file.flush()?;
        Ok(())
    }

    fn log_path(&self, appliance_id: &str) -> PathBuf {
        self.log_dir.join(format!("{}.log", appliance_id))
    }

    #[cfg(test)]
    fn is_recorded(&self, appliance_id: &str, file_name: &str) -> bool {
        self.processed
            .lock()
            .expect("processed keys")
            .get(appliance_id)
            .map_or(false, |set| set.contains(file_name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn touch(path: &Path) {
        fs::write(path, b"bundle").expect("write file");
    }
    use crate::{
        audit::AuditRotation,
        device::ApplianceDevice,
        error::KEYBUNDLE_PROCESSED_MESSAGE,
        events::EventSender,
        fastboot::tests::{failure_output, scripted_fastboot, success_output, ScriptedExecCommand},
        product::DescriptorStore,
        registry::DeviceRegistry,
    };
    use tempfile::TempDir;

    struct IngestFixture {
        ingest: Arc<KeyIngest>,
        registry: Arc<DeviceRegistry>,
        key_dir: TempDir,
        log_dir: TempDir,
        _audit_dir: TempDir,
    }

    fn ingest_fixture(script: &ScriptedExecCommand) -> IngestFixture {
        let fastboot = scripted_fastboot(script);
        let registry = DeviceRegistry::new();
        registry.set_appliance(Some(ApplianceDevice::new("ATFA001", None)));
        let (events, _rx) = EventSender::channel();
        let audit_dir = TempDir::new().expect("audit dir");
        let appliance = ApplianceManager::new(
            fastboot,
            Arc::clone(&registry),
            Arc::new(DescriptorStore::default()),
            events,
            AuditRotation::new(audit_dir.path(), 10),
        );
        let key_dir = TempDir::new().expect("key dir");
        let log_dir = TempDir::new().expect("log dir");
        let ingest = KeyIngest::new(
            key_dir.path(),
            log_dir.path(),
            "*.atfa",
            appliance,
            INGEST_INTERVAL,
        );
        IngestFixture {
            ingest,
            registry,
            key_dir,
            log_dir,
            _audit_dir: audit_dir,
        }
    }

    fn serial_ok() -> (&'static str, std::process::Output) {
        ("getvar serial", success_output("", "serial: ATFA001\n"))
    }

    #[tokio::test]
    async fn processes_matching_files_and_records_them() {
        let script = ScriptedExecCommand::new(vec![serial_ok()]);
        let fixture = ingest_fixture(&script);

        touch(&fixture.key_dir.path().join("ATFA001_batch1.atfa"));
        touch(&fixture.key_dir.path().join("ATFA001_batch2.atfa"));
        // Wrong appliance and wrong extension are ignored.
        touch(&fixture.key_dir.path().join("ATFA999_batch.atfa"));
        touch(&fixture.key_dir.path().join("ATFA001_notes.txt"));

        fixture.ingest.tick().await;

        assert!(fixture.ingest.is_recorded("ATFA001", "ATFA001_batch1.atfa"));
        assert!(fixture.ingest.is_recorded("ATFA001", "ATFA001_batch2.atfa"));
        assert!(!fixture.ingest.is_recorded("ATFA001", "ATFA999_batch.atfa"));
        assert!(!fixture.ingest.is_recorded("ATFA001", "ATFA001_notes.txt"));

        let log = fs::read_to_string(fixture.log_dir.path().join("ATFA001.log"))
            .expect("ingest log");
        assert!(log.contains("ATFA001_batch1.atfa\n"));
        assert!(log.contains("ATFA001_batch2.atfa\n"));

        // The keybundle command ran once per new file.
        let keybundle_runs = script
            .commands_seen()
            .iter()
            .filter(|c| c.contains("oem keybundle"))
            .count();
        assert_eq!(keybundle_runs, 2);
    }

    #[tokio::test]
    async fn already_processed_answer_is_recorded_silently() {
        let script = ScriptedExecCommand::new(vec![
            serial_ok(),
            (
                "oem keybundle",
                failure_output("", &format!("FAILED: {}\n", KEYBUNDLE_PROCESSED_MESSAGE)),
            ),
        ]);
        let fixture = ingest_fixture(&script);
        touch(&fixture.key_dir.path().join("ATFA001_old.atfa"));

        fixture.ingest.tick().await;

        assert!(fixture.ingest.is_recorded("ATFA001", "ATFA001_old.atfa"));
        let log = fs::read_to_string(fixture.log_dir.path().join("ATFA001.log"))
            .expect("ingest log");
        assert_eq!(log, "ATFA001_old.atfa\n");

        // Next tick skips it entirely.
        fixture.ingest.tick().await;
        let keybundle_runs = script
            .commands_seen()
            .iter()
            .filter(|c| c.contains("oem keybundle"))
            .count();
        assert_eq!(keybundle_runs, 1);
    }

    #[tokio::test]
    async fn transient_failures_retry_next_tick() {
        let script = ScriptedExecCommand::new(vec![
            serial_ok(),
            (
                "oem keybundle",
                failure_output("", "FAILED: flash write error\n"),
            ),
        ]);
        let fixture = ingest_fixture(&script);
        touch(&fixture.key_dir.path().join("ATFA001_new.atfa"));

        fixture.ingest.tick().await;
        assert!(!fixture.ingest.is_recorded("ATFA001", "ATFA001_new.atfa"));
        assert!(!fixture.log_dir.path().join("ATFA001.log").exists());

        fixture.ingest.tick().await;
        let keybundle_runs = script
            .commands_seen()
            .iter()
            .filter(|c| c.contains("oem keybundle"))
            .count();
        assert_eq!(keybundle_runs, 2);
    }

    #[tokio::test]
    async fn missing_appliance_skips_the_tick() {
        let script = ScriptedExecCommand::new(vec![serial_ok()]);
        let fixture = ingest_fixture(&script);
        fixture.registry.set_appliance(None);
        touch(&fixture.key_dir.path().join("ATFA001_batch.atfa"));

        fixture.ingest.tick().await;
        assert!(script.commands_seen().is_empty());
    }

    #[tokio::test]
    async fn load_processed_restores_dedup_state() {
        let script = ScriptedExecCommand::new(vec![serial_ok()]);
        let fixture = ingest_fixture(&script);

        fs::write(
            fixture.log_dir.path().join("ATFA001.log"),
            "ATFA001_seen.atfa\n",
        )
        .expect("seed log");
        fs::write(fixture.log_dir.path().join("notes.txt"), "ignored")
            .expect("seed noise");

        fixture.ingest.load_processed();
        assert!(fixture.ingest.is_recorded("ATFA001", "ATFA001_seen.atfa"));

        touch(&fixture.key_dir.path().join("ATFA001_seen.atfa"));
        fixture.ingest.tick().await;
        assert!(!script
            .commands_seen()
            .iter()
            .any(|c| c.contains("oem keybundle")));
    }
}
