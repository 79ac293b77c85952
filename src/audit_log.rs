//! The rotating operator log and the single-instance check.
//!
//! This log is a product feature, separate from developer logging: operators
//! archive it with the audit files. Entries go to `atft_log_<epoch>` files
//! under the configured directory; a file rolls over when an entry would
//! push it past its share of the configured total size, and the oldest file
//! is dropped once the file count exceeds the limit.

use chrono::{Local, Utc};
use log::warn;
use std::{
    fs,
    fs::OpenOptions,
    io::Write,
    path::{Path, PathBuf},
    sync::Mutex,
};
use sysinfo::System;

const LOG_FILE_PREFIX: &str = "atft_log_";

struct LogInner {
    log_dir: PathBuf,
    current_file: Option<PathBuf>,
    max_file_size: u64,
    max_files: usize,
}

pub struct AuditLog {
    inner: Mutex<LogInner>,
}

impl AuditLog {
    /// Open the log directory, continuing the newest existing file or
    /// starting a fresh one.
    pub fn new(log_dir: impl Into<PathBuf>, log_size: u64, log_file_number: usize) -> Self {
        let log_dir = log_dir.into();
        if !log_dir.exists() {
            let _ = fs::create_dir_all(&log_dir);
        }

        let max_files = log_file_number.max(1);
        let mut inner = LogInner {
            current_file: None,
            max_file_size: log_size / max_files as u64,
            max_files,
            log_dir,
        };
        match log_files(&inner.log_dir).pop() {
            Some(latest) => inner.current_file = Some(inner.log_dir.join(latest)),
            None => create_log_file(&mut inner),
        }
        Self {
            inner: Mutex::new(inner),
        }
    }

    /// Whether a log file could be opened at all.
    pub fn ready(&self) -> bool {
        self.inner.lock().expect("audit log").current_file.is_some()
    }

    pub fn error(&self, tag: &str, message: &str) {
        self.output('E', tag, message);
    }

    pub fn warning(&self, tag: &str, message: &str) {
        self.output('W', tag, message);
    }

    pub fn info(&self, tag: &str, message: &str) {
        self.output('I', tag, message);
    }

    pub fn debug(&self, tag: &str, message: &str) {
        self.output('D', tag, message);
    }

    fn output(&self, level: char, tag: &str, message: &str) {
        let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S");
        let entry = format!(
            "[{}] {}/{}: {}\n",
            timestamp,
            level,
            tag,
            message.replace('\n', "\t")
        );

        let mut inner = self.inner.lock().expect("audit log");
        if inner.current_file.is_none() {
            return;
        }
        limit_size(&mut inner, entry.len() as u64);
        let path = match &inner.current_file {
            Some(path) => path.clone(),
            None => return,
        };
        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .and_then(|mut file| {
                file.write_all(entry.as_bytes())?;
                file.flush()
            });
        if let Err(e) = result {
            warn!("audit log write failed: {}", e);
        }
    }
}

/// Roll to a new file when this entry would push the current one over its
/// share, then prune the oldest files beyond the count limit.
fn limit_size(inner: &mut LogInner, entry_len: u64) {
    let current_size = inner
        .current_file
        .as_ref()
        .and_then(|path| fs::metadata(path).ok())
        .map(|meta| meta.len())
        .unwrap_or(0);
    if current_size + entry_len > inner.max_file_size {
        create_log_file(inner);
    }

    let files = log_files(&inner.log_dir);
    if files.len() > inner.max_files {
        for name in &files[..files.len() - inner.max_files] {
            let _ = fs::remove_file(inner.log_dir.join(name));
        }
    }
}

fn create_log_file(inner: &mut LogInner) {
    let timestamp = Utc::now().timestamp();
    let base = format!("{}{}", LOG_FILE_PREFIX, timestamp);
    let mut path = inner.log_dir.join(&base);
    let mut suffix = 1;
    while path.exists() {
        path = inner.log_dir.join(format!("{}_{}", base, suffix));
        suffix += 1;
    }
    match fs::File::create(&path) {
        Ok(_) => inner.current_file = Some(path),
        Err(_) => inner.current_file = None,
    }
}

fn log_files(log_dir: &Path) -> Vec<String> {
    let mut files: Vec<String> = match fs::read_dir(log_dir) {
        Ok(entries) => entries
            .flatten()
            .filter(|e| e.path().is_file())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|name| name.starts_with(LOG_FILE_PREFIX))
            .collect(),
        Err(_) => Vec::new(),
    };
    files.sort();
    files
}

/// Whether another instance of this program is already running. Child
/// processes forked by an instance do not count as separate instances.
pub fn other_instance_running(program_name: &str) -> bool {
    let system = System::new_all();
    let processes: Vec<(u32, Option<u32>, String)> = system
        .processes()
        .iter()
        .map(|(pid, process)| {
            (
                pid.as_u32(),
                process.parent().map(|p| p.as_u32()),
                process.name().to_string_lossy().into_owned(),
            )
        })
        .collect();
    count_instances(&processes, program_name) > 1
}

fn count_instances(processes: &[(u32, Option<u32>, String)], program_name: &str) -> usize {
    let matching: Vec<&(u32, Option<u32>, String)> = processes
        .iter()
        .filter(|(_, _, name)| name == program_name)
        .collect();
    matching
        .iter()
        .filter(|(_, parent, _)| match parent {
            Some(parent) => !matching.iter().any(|(pid, _, _)| pid == parent),
            None => true,
        })
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use tempfile::TempDir;

    #[test]
    fn entry_format_and_newline_folding() -> Result<()> {
        let dir = TempDir::new()?;
        let log = AuditLog::new(dir.path(), 4096, 2);
        assert!(log.ready());

        log.info("Program", "Program start");
        log.error("OpException", "line one\nline two");

        let files = log_files(dir.path());
        assert_eq!(files.len(), 1);
        let content = fs::read_to_string(dir.path().join(&files[0]))?;
        let mut lines = content.lines();

        let first = lines.next().expect("first entry");
        assert!(first.ends_with("I/Program: Program start"), "{}", first);
        assert!(first.starts_with('['));
        // [YYYY-MM-DD HH:MM:SS] prefix is fixed width.
        assert_eq!(&first[21..24], " I/");

        let second = lines.next().expect("second entry");
        assert!(second.ends_with("E/OpException: line one\tline two"));
        Ok(())
    }

    #[test]
    fn rollover_and_retention() -> Result<()> {
        let dir = TempDir::new()?;
        // Two files of ~128 bytes each.
        let log = AuditLog::new(dir.path(), 256, 2);

        for i in 0..20 {
            log.info("Tag", &format!("entry number {}", i));
        }

        let files = log_files(dir.path());
        assert!(files.len() <= 2, "kept {} files", files.len());
        for name in &files {
            let size = fs::metadata(dir.path().join(name))?.len();
            assert!(size <= 256, "file {} has {} bytes", name, size);
        }
        Ok(())
    }

    #[test]
    fn continues_latest_existing_file() -> Result<()> {
        let dir = TempDir::new()?;
        fs::write(dir.path().join("atft_log_100"), b"old\n")?;
        fs::write(dir.path().join("atft_log_200"), b"newer\n")?;

        let log = AuditLog::new(dir.path(), 4096, 3);
        log.info("Program", "resumed");

        let content = fs::read_to_string(dir.path().join("atft_log_200"))?;
        assert!(content.contains("resumed"));
        let old = fs::read_to_string(dir.path().join("atft_log_100"))?;
        assert_eq!(old, "old\n");
        Ok(())
    }

    #[test]
    fn instance_counting_ignores_children() {
        let processes = vec![
            (100, Some(1), "atft".to_string()),
            // A worker forked by pid 100.
            (101, Some(100), "atft".to_string()),
            (200, Some(1), "bash".to_string()),
        ];
        assert_eq!(count_instances(&processes, "atft"), 1);

        let two = vec![
            (100, Some(1), "atft".to_string()),
            (300, Some(1), "atft".to_string()),
        ];
        assert_eq!(count_instances(&two, "atft"), 2);

        assert_eq!(count_instances(&[], "atft"), 0);
    }
}
