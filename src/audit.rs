//! Audit file pull policy and on-disk retention.
//!
//! The appliance keeps an audit trail of consumed keys. The console pulls a
//! fresh copy every `download_interval` consumed keys and keeps a bounded
//! number of files per appliance, deleting old ones only after a new pull
//! landed.

use chrono::Utc;
use log::debug;
use std::{fs, io, path::PathBuf};

/// How many audit files to keep per appliance, in case one is broken.
pub const MAX_AUDIT_FILE_NUMBER: usize = 1;

pub struct AuditRotation {
    audit_dir: PathBuf,
    download_interval: i64,
    /// Keys-left at the last successful pull; `None` forces the next pull.
    last_keys_at_pull: Option<i64>,
    max_files: usize,
}

impl AuditRotation {
    pub fn new(audit_dir: impl Into<PathBuf>, download_interval: i64) -> Self {
        let audit_dir = audit_dir.into();
        if !audit_dir.exists() {
            // Best effort: a failed pull later surfaces the real problem.
            let _ = fs::create_dir_all(&audit_dir);
        }
        Self {
            audit_dir,
            download_interval,
            last_keys_at_pull: None,
            max_files: MAX_AUDIT_FILE_NUMBER,
        }
    }

    #[cfg(test)]
    fn with_max_files(mut self, max_files: usize) -> Self {
        self.max_files = max_files;
        self
    }

    /// Whether enough keys were consumed since the last pull.
    pub fn should_pull(&self, keys_left: i64) -> bool {
        match self.last_keys_at_pull {
            None => true,
            Some(last) => last - keys_left >= self.download_interval,
        }
    }

    /// Remember a successful pull at this key count.
    pub fn record_pull(&mut self, keys_left: i64) {
        self.last_keys_at_pull = Some(keys_left);
    }

    /// Force the next check to pull, e.g. after an appliance or product
    /// change made the old baseline meaningless.
    pub fn reset(&mut self) {
        self.last_keys_at_pull = None;
    }

    /// Timestamped destination for the next pull; names sort by age.
    pub fn audit_file_path(&self, serial: &str) -> PathBuf {
        let timestamp = Utc::now().format("%Y%m%d%H%M%S");
        self.audit_dir.join(format!("{}_{}.audit", serial, timestamp))
    }

    /// Delete the oldest audit files of this appliance until at most
    /// `max_files` remain. Called only after a successful pull.
    pub fn enforce_retention(&self, serial: &str) -> io::Result<()> {
        loop {
            let files = self.audit_files(serial);
            if files.len() <= self.max_files {
                return Ok(());
            }
            let oldest = self.audit_dir.join(&files[0]);
            debug!("removing old audit file {}", oldest.display());
            fs::remove_file(oldest)?;
        }
    }

    fn audit_files(&self, serial: &str) -> Vec<String> {
        let mut files: Vec<String> = match fs::read_dir(&self.audit_dir) {
            Ok(entries) => entries
                .flatten()
                .filter(|e| e.path().is_file())
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .filter(|name| name.starts_with(serial) && name.ends_with(".audit"))
                .collect(),
            Err(_) => Vec::new(),
        };
        files.sort();
        files
    }

    #[cfg(test)]
    pub fn audit_file_count(&self, serial: &str) -> usize {
        self.audit_files(serial).len()
    }
}
