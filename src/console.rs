//! Console bootstrap: builds every component, runs the event loop, and
//! tears the system down on a signal.

use crate::{
    atfa::ApplianceManager,
    audit::AuditRotation,
    audit_log::{other_instance_running, AuditLog},
    config::Config,
    events::{EventSender, UiEvent},
    fastboot::{Fastboot, FastbootBuilder},
    key_ingest::{KeyIngest, INGEST_INTERVAL},
    orchestrator::Orchestrator,
    product::DescriptorStore,
    provision::Provisioner,
    reboot::RebootTracker,
    registry::{DeviceRegistry, Poller},
    serial_mapper::SerialMapper,
};
use anyhow::{Context, Result};
use log::{info, warn};
use std::{path::PathBuf, sync::Arc};
use tokio::signal::unix::{signal, SignalKind};

/// Console is the main instance wiring the provisioning pipeline together.
pub struct Console {
    config: Config,
    config_path: PathBuf,
    fastboot_binary: PathBuf,
    product_file: Option<PathBuf>,
    auto: bool,
}

impl Console {
    pub fn new(
        config: Config,
        config_path: PathBuf,
        fastboot_binary: PathBuf,
        product_file: Option<PathBuf>,
        auto: bool,
    ) -> Self {
        Console {
            config,
            config_path,
            fastboot_binary,
            product_file,
            auto,
        }
    }

    /// Run until interrupted or terminated.
    pub async fn start(self) -> Result<()> {
        let audit_log = match self.config.log_dir() {
            Some(dir) => Arc::new(AuditLog::new(
                dir.clone(),
                self.config.log_size(),
                self.config.log_file_number(),
            )),
            None => Arc::new(AuditLog::new(
                std::env::temp_dir().join("atft_log"),
                self.config.log_size().max(1024 * 1024),
                self.config.log_file_number().max(2),
            )),
        };
        if !audit_log.ready() {
            warn!("cannot create the operator log file");
        }
        if other_instance_running(env!("CARGO_PKG_NAME")) {
            audit_log.warning("Program", "Another instance appears to be running");
            warn!("another instance of this console appears to be running");
        }
        audit_log.info("Program", "Program start");

        let (events, mut event_rx) = EventSender::channel();
        let fastboot: Arc<Fastboot> = Arc::new(
            FastbootBuilder::default()
                .binary(self.fastboot_binary.clone())
                .build()
                .context("construct fastboot controller")?,
        );
        let registry = DeviceRegistry::new();
        let reboots = RebootTracker::new(Arc::clone(&registry));
        let descriptors = Arc::new(DescriptorStore::default());

        let audit_dir = self
            .config
            .audit_dir()
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("atft_audit"));
        let appliance = ApplianceManager::new(
            Arc::clone(&fastboot),
            Arc::clone(&registry),
            Arc::clone(&descriptors),
            events.clone(),
            AuditRotation::new(audit_dir, self.config.audit_interval()),
        );
        let provisioner = Provisioner::new(
            Arc::clone(&fastboot),
            Arc::clone(&registry),
            Arc::clone(&reboots),
            Arc::clone(&descriptors),
            Arc::clone(&appliance),
            events.clone(),
            self.config.unlock_credential().clone(),
            self.config.test_mode(),
            self.config.reboot_timeout_duration(),
        );
        let orchestrator = Orchestrator::new(
            Arc::clone(&registry),
            Arc::clone(&provisioner),
            Arc::clone(&appliance),
            Arc::clone(&descriptors),
            events.clone(),
            self.config.default_key_threshold_1(),
            self.config.default_key_threshold_2(),
            self.config
                .device_usb_locations()
                .iter()
                .flatten()
                .cloned()
                .collect(),
            self.config.test_mode(),
        );
        orchestrator.set_configured_steps(self.config.provision_steps());

        if let Some(product_file) = &self.product_file {
            match descriptors.load_file(product_file) {
                Ok(_) => {
                    info!("descriptor {} loaded", product_file.display());
                    // A new identity invalidates the audit baseline and the
                    // cached key count.
                    appliance.reset_audit();
                }
                Err(e) => {
                    audit_log.error("Program", &format!("descriptor load failed: {}", e));
                    return Err(e).context("load attestation descriptor");
                }
            }
        }

        let poller = Poller::new(
            Arc::clone(&fastboot),
            Arc::clone(&registry),
            Arc::clone(&reboots),
            Arc::clone(&provisioner) as Arc<dyn crate::registry::StatusProbe>,
            SerialMapper::default(),
            events.clone(),
            self.config.compatible_atfa_version_number(),
            self.config.refresh_interval(),
        );
        let poller_handle = poller.spawn();

        if self.product_file.is_some() {
            // A freshly selected identity wants a key count as soon as the
            // appliance shows up.
            let appliance = Arc::clone(&appliance);
            let descriptors = Arc::clone(&descriptors);
            let timeout = self.config.atfa_reboot_timeout_duration().max(
                std::time::Duration::from_secs(30),
            );
            tokio::spawn(async move {
                if appliance.wait_for_appliance(timeout).await {
                    if let Err(e) = appliance.update_keys_left(descriptors.is_som()).await {
                        warn!("initial keys-left query failed: {}", e);
                    }
                }
            });
        }

        let ingest_handle = match self.config.key_dir() {
            Some(key_dir) => {
                let log_dir = self
                    .config
                    .log_dir()
                    .clone()
                    .unwrap_or_else(|| std::env::temp_dir().join("atft_log"));
                let ingest = KeyIngest::new(
                    key_dir.clone(),
                    log_dir,
                    self.config.key_file_extension(),
                    Arc::clone(&appliance),
                    INGEST_INTERVAL,
                );
                ingest.load_processed();
                Some(ingest.spawn())
            }
            None => None,
        };

        if self.auto {
            orchestrator.enter_auto();
        }

        let mut shutdown_terminate = signal(SignalKind::terminate())?;
        let mut shutdown_interrupt = signal(SignalKind::interrupt())?;

        loop {
            tokio::select! {
                _ = shutdown_interrupt.recv() => {
                    info!("Got interrupt signal, shutting down console");
                    break;
                }
                _ = shutdown_terminate.recv() => {
                    info!("Got termination signal, shutting down console");
                    break;
                }
                event = event_rx.recv() => match event {
                    Some(event) => Self::handle_event(&audit_log, &orchestrator, event),
                    None => break,
                }
            }
        }

        poller_handle.abort();
        if let Some(handle) = ingest_handle {
            handle.abort();
        }
        reboots.shutdown();
        self.cleanup(&audit_log)
    }

    /// Route worker events into the operator log; a headless console has no
    /// dialogs, so alerts become log entries.
    fn handle_event(audit_log: &AuditLog, orchestrator: &Arc<Orchestrator>, event: UiEvent) {
        match event {
            UiEvent::Alert(message) => audit_log.warning("Alert", &message),
            UiEvent::Print(message) => audit_log.info("Op", &message),
            UiEvent::DeviceListRefreshed => orchestrator.on_registry_update(),
            UiEvent::LowKey(keys_left) => audit_log.warning(
                "LowKey",
                &format!("attestation keys running low: {} left", keys_left),
            ),
            UiEvent::OperationError {
                operation,
                serials,
                message,
            } => audit_log.error(
                "OpException",
                &format!("{} [{}]: {}", operation, serials.join(", "), message),
            ),
            UiEvent::SelectFile { message, .. } | UiEvent::SaveFile { message, .. } => {
                audit_log.info("Op", &message)
            }
            UiEvent::MappingUpdated => audit_log.info("Op", "USB mapping updated"),
        }
    }

    /// Persist the configuration and note the exit.
    fn cleanup(self, audit_log: &AuditLog) -> Result<()> {
        self.config
            .persist(&self.config_path)
            .context("persist configuration")?;
        audit_log.info("Program", "Program exit");
        Ok(())
    }
}
