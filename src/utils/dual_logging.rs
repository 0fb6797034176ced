use chrono::Local;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Mutex, OnceLock};
use tracing::Level;

use crate::utils::app_paths::AppPaths;
use crate::utils::logging::LogEntry;

static DUAL_LOGGER: OnceLock<DualLogger> = OnceLock::new();

fn fallback_log_dir() -> PathBuf {
    std::env::temp_dir().join("explorer-cli")
}

/// Writes log lines to a timestamped file, optionally echoing to stderr
pub struct DualLogger {
    log_file: Mutex<Option<File>>,
    log_path: PathBuf,
}

impl DualLogger {
    pub fn new() -> Self {
        let log_dir = AppPaths::log_dir().unwrap_or_else(|_| fallback_log_dir());
        let _ = std::fs::create_dir_all(&log_dir);

        let timestamp = Local::now().format("%Y%m%d_%H%M%S");
        let log_path = log_dir.join(format!("explorer-cli_{}.log", timestamp));

        #[cfg(unix)]
        {
            let latest_path = log_dir.join("latest.log");
            let _ = std::fs::remove_file(&latest_path);
            let _ = std::os::unix::fs::symlink(&log_path, &latest_path);
        }

        let log_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .ok();

        Self {
            log_file: Mutex::new(log_file),
            log_path,
        }
    }

    pub fn log(&self, level: Level, target: &str, message: &str) {
        let entry = LogEntry::new(level, target, message.to_string());

        if let Ok(mut file_opt) = self.log_file.lock() {
            if let Some(ref mut file) = *file_opt {
                let _ = writeln!(file, "{}", entry.format_for_display());
                let _ = file.flush();
            }
        }

        if std::env::var("EXPLORER_CLI_DEBUG").is_ok() {
            eprintln!("{}", entry.format_for_display());
        }
    }

    pub fn log_path(&self) -> &PathBuf {
        &self.log_path
    }

    pub fn flush(&self) {
        if let Ok(mut file_opt) = self.log_file.lock() {
            if let Some(ref mut file) = *file_opt {
                let _ = file.flush();
            }
        }
    }
}

impl Default for DualLogger {
    fn default() -> Self {
        Self::new()
    }
}

pub fn init_dual_logger() -> &'static DualLogger {
    DUAL_LOGGER.get_or_init(DualLogger::new)
}

pub fn get_dual_logger() -> Option<&'static DualLogger> {
    DUAL_LOGGER.get()
}
