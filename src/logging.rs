// src/logging.rs
//
// `tlog!`: local-time stamped lines on stderr, mirrored into a per-run log
// file under the configured log directory when one is set.

use std::fmt;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Suffix shared by every run's log file; the symlink is `benchtap.log`.
const LOG_SUFFIX: &str = "-benchtap.log";
const LATEST_LINK: &str = "benchtap.log";

/// Mirror file for the current run, if file logging is on.
pub static LOG_FILE: Mutex<Option<std::fs::File>> = Mutex::new(None);

/// `HH:MM:SS.mmm` in local time.
pub fn timestamp() -> impl fmt::Display {
    chrono::Local::now().format("%H:%M:%S%.3f")
}

/// Write one stamped line to stderr and, when enabled, to the mirror file.
pub fn emit(args: fmt::Arguments<'_>) {
    let line = format!("{} {}", timestamp(), args);
    eprintln!("{}", line);
    if let Ok(mut guard) = LOG_FILE.lock() {
        if let Some(file) = guard.as_mut() {
            let _ = writeln!(file, "{}", line);
        }
    }
}

#[macro_export]
macro_rules! tlog {
    ($($arg:tt)*) => {
        $crate::logging::emit(format_args!($($arg)*))
    };
}

/// Open this run's log file in `log_dir`, repoint the `benchtap.log` symlink
/// (Unix only) and delete all but the newest `keep_files` run logs.
/// Returns the path of the new file.
pub fn init_file_logging(log_dir: &Path, keep_files: usize) -> Result<PathBuf, String> {
    std::fs::create_dir_all(log_dir).map_err(|e| format!("Failed to create log dir: {}", e))?;

    let filename = format!("{}{}", chrono::Local::now().format("%Y%m%d-%H%M%S"), LOG_SUFFIX);
    let log_path = log_dir.join(&filename);
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .map_err(|e| format!("Failed to create log file {}: {}", log_path.display(), e))?;

    #[cfg(unix)]
    {
        let link = log_dir.join(LATEST_LINK);
        let _ = std::fs::remove_file(&link);
        if let Err(e) = std::os::unix::fs::symlink(&filename, &link) {
            tlog!("[logging] Could not point {} at {}: {}", LATEST_LINK, filename, e);
        }
    }

    let pruned = prune_run_logs(log_dir, keep_files.max(1));

    if let Ok(mut guard) = LOG_FILE.lock() {
        *guard = Some(file);
    }
    tlog!("[logging] Writing {} ({} old log(s) removed)", log_path.display(), pruned);
    Ok(log_path)
}

/// Close the mirror file. Safe to call when file logging never started.
pub fn stop_file_logging() {
    let closed = LOG_FILE.lock().map(|mut guard| guard.take().is_some()).unwrap_or(false);
    if closed {
        tlog!("[logging] File logging stopped");
    }
}

/// Delete the oldest `<stamp>-benchtap.log` files so at most `keep` remain.
/// File names sort chronologically. Returns how many were removed.
fn prune_run_logs(log_dir: &Path, keep: usize) -> usize {
    let Ok(entries) = std::fs::read_dir(log_dir) else {
        return 0;
    };
    let mut runs: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .map(|name| name.ends_with(LOG_SUFFIX) && name != LATEST_LINK)
                .unwrap_or(false)
        })
        .collect();
    if runs.len() <= keep {
        return 0;
    }
    runs.sort();
    let excess = runs.len() - keep;
    runs.iter()
        .take(excess)
        .filter(|path| std::fs::remove_file(path).is_ok())
        .count()
}
