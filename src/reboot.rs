//! Reboot tracking: one record per device reset in flight.
//!
//! A reboot ends in exactly one of two ways: the poller sees the serial come
//! back, or the timer runs out. Both paths race for the record's single-fire
//! claim; whichever wins runs its callback, the other does nothing.

use crate::{
    device::TargetDevice,
    error::Result,
    fastboot::FastbootDevice,
    registry::DeviceRegistry,
};
use log::{debug, info};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::task::JoinHandle;

pub type RebootCallback = Box<dyn FnOnce() + Send + 'static>;

struct RebootRecord {
    claimed: Arc<AtomicBool>,
    on_success: Option<RebootCallback>,
    timer: JoinHandle<()>,
}

pub struct RebootTracker {
    registry: Arc<DeviceRegistry>,
    records: Mutex<HashMap<String, RebootRecord>>,
}

impl RebootTracker {
    pub fn new(registry: Arc<DeviceRegistry>) -> Arc<Self> {
        Arc::new(Self {
            registry,
            records: Mutex::new(HashMap::new()),
        })
    }

    /// Reset the device and start waiting for it to come back.
    ///
    /// The record is replaced by a placeholder with `REBOOT` in-progress
    /// status so the registry keeps the slot visible while the serial is
    /// absent from enumeration. On timeout the placeholder is removed and
    /// `on_timeout` runs; on reappearance the poller re-creates the record
    /// and runs `on_success`.
    pub async fn reboot(
        self: &Arc<Self>,
        device: &FastbootDevice,
        timeout: Duration,
        on_success: RebootCallback,
        on_timeout: RebootCallback,
    ) -> Result<()> {
        let serial = device.serial().to_string();
        let location = self
            .registry
            .target(&serial)
            .and_then(|t| t.location.clone());

        device.reboot().await?;
        info!("{} rebooting, timeout {:?}", serial, timeout);

        self.registry.remove_target(&serial);
        self.registry.drop_stable(&serial);
        self.registry
            .insert_target(TargetDevice::rebooting(&serial, location));

        let claimed = Arc::new(AtomicBool::new(false));
        let timer = {
            let tracker = Arc::clone(self);
            let claimed = Arc::clone(&claimed);
            let serial = serial.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                if claimed
                    .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    debug!("{} did not come back before timeout", serial);
                    tracker.registry.remove_target(&serial);
                    tracker.records.lock().expect("reboot records").remove(&serial);
                    on_timeout();
                }
            })
        };

        self.records.lock().expect("reboot records").insert(
            serial,
            RebootRecord {
                claimed,
                on_success: Some(on_success),
                timer,
            },
        );
        Ok(())
    }

    /// Whether a reboot is being tracked for this serial.
    pub fn pending(&self, serial: &str) -> bool {
        self.records.lock().expect("reboot records").contains_key(serial)
    }

    /// Try to win the record's single-fire claim. The poller calls this when
    /// the serial shows up stable again.
    pub fn try_claim(&self, serial: &str) -> bool {
        let records = self.records.lock().expect("reboot records");
        match records.get(serial) {
            Some(record) => record
                .claimed
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok(),
            None => false,
        }
    }

    /// Give the claim back after a failed device re-creation so a later tick
    /// can retry before the timer fires.
    pub fn release_claim(&self, serial: &str) {
        let records = self.records.lock().expect("reboot records");
        if let Some(record) = records.get(serial) {
            record.claimed.store(false, Ordering::SeqCst);
        }
    }

    /// Finish the success path: cancel the timer, drop the record, and hand
    /// back the success callback for the caller to run.
    pub fn complete(&self, serial: &str) -> Option<RebootCallback> {
        let mut records = self.records.lock().expect("reboot records");
        let mut record = records.remove(serial)?;
        record.timer.abort();
        record.on_success.take()
    }

    /// Cancel every outstanding timer; used on shutdown.
    pub fn shutdown(&self) {
        let mut records = self.records.lock().expect("reboot records");
        for (_, record) in records.drain() {
            record.timer.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Phase, ProvisionStatus};
    use crate::fastboot::tests::{mock_fastboot, success_output};

    fn counters() -> (Arc<AtomicBool>, RebootCallback) {
        let flag = Arc::new(AtomicBool::new(false));
        let clone = Arc::clone(&flag);
        (flag, Box::new(move || clone.store(true, Ordering::SeqCst)))
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_fires_once_and_removes_placeholder() {
        let registry = DeviceRegistry::new();
        registry.insert_target(TargetDevice::new("T1", Some("1-2".into())));
        let tracker = RebootTracker::new(Arc::clone(&registry));
        let fastboot = mock_fastboot(success_output("", ""));
        let device = fastboot.device("T1");

        let (success_fired, on_success) = counters();
        let (timeout_fired, on_timeout) = counters();
        tracker
            .reboot(&device, Duration::from_secs(30), on_success, on_timeout)
            .await
            .expect("reboot");

        let placeholder = registry.target("T1").expect("placeholder");
        assert_eq!(
            placeholder.provision_status,
            ProvisionStatus::Reboot(Phase::InProgress)
        );
        assert_eq!(placeholder.location.as_deref(), Some("1-2"));

        tokio::time::sleep(Duration::from_secs(31)).await;
        // Let the timer task run.
        tokio::task::yield_now().await;

        assert!(timeout_fired.load(Ordering::SeqCst));
        assert!(!success_fired.load(Ordering::SeqCst));
        assert!(registry.target("T1").is_none());
        assert!(!tracker.pending("T1"));
    }

    #[tokio::test(start_paused = true)]
    async fn success_claim_beats_timer() {
        let registry = DeviceRegistry::new();
        registry.insert_target(TargetDevice::new("T1", None));
        let tracker = RebootTracker::new(Arc::clone(&registry));
        let fastboot = mock_fastboot(success_output("", ""));
        let device = fastboot.device("T1");

        let (success_fired, on_success) = counters();
        let (timeout_fired, on_timeout) = counters();
        tracker
            .reboot(&device, Duration::from_secs(30), on_success, on_timeout)
            .await
            .expect("reboot");

        // The poller path: serial is back, claim and complete.
        assert!(tracker.try_claim("T1"));
        let callback = tracker.complete("T1").expect("success callback");
        callback();

        tokio::time::sleep(Duration::from_secs(31)).await;
        tokio::task::yield_now().await;

        assert!(success_fired.load(Ordering::SeqCst));
        assert!(!timeout_fired.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn released_claim_can_be_retried() {
        let registry = DeviceRegistry::new();
        registry.insert_target(TargetDevice::new("T1", None));
        let tracker = RebootTracker::new(Arc::clone(&registry));
        let fastboot = mock_fastboot(success_output("", ""));
        let device = fastboot.device("T1");

        let (_, on_success) = counters();
        let (_, on_timeout) = counters();
        tracker
            .reboot(&device, Duration::from_secs(30), on_success, on_timeout)
            .await
            .expect("reboot");

        assert!(tracker.try_claim("T1"));
        // Creation failed; give the claim back.
        tracker.release_claim("T1");
        assert!(tracker.try_claim("T1"));
    }

    #[tokio::test(start_paused = true)]
    async fn second_claim_fails_while_held() {
        let registry = DeviceRegistry::new();
        registry.insert_target(TargetDevice::new("T1", None));
        let tracker = RebootTracker::new(Arc::clone(&registry));
        let fastboot = mock_fastboot(success_output("", ""));
        let device = fastboot.device("T1");

        let (_, on_success) = counters();
        let (_, on_timeout) = counters();
        tracker
            .reboot(&device, Duration::from_secs(30), on_success, on_timeout)
            .await
            .expect("reboot");

        assert!(tracker.try_claim("T1"));
        assert!(!tracker.try_claim("T1"));
    }
}
