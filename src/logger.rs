//! Session logger: routes `tracing` events to a single file in the OS data
//! directory.
//!
//! The file is truncated at each launch, so it only holds the most recent
//! session.
//!
//! Log location:
//!   Windows:  `%APPDATA%\LabelFE\labelfe.log`
//!   Linux:    `~/.local/share/LabelFE/labelfe.log`
//!   macOS:    `~/Library/Application Support/LabelFE/labelfe.log`

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::Level;
use tracing_subscriber::fmt;

static LOG_PATH: OnceLock<PathBuf> = OnceLock::new();

/// Path of the current session log, if [`init`] opened one.
pub fn log_path() -> Option<&'static PathBuf> {
    LOG_PATH.get()
}

/// Install the global subscriber. Call once at startup.
///
/// * Creates (or truncates) the log file.
/// * Installs a panic hook that records the panic before the default handler.
///
/// Failing to open the log only prints a warning; the session continues with
/// logging disabled.
pub fn init(verbose: bool) {
    let path = log_file_path(&data_dir());
    let file = match open_session_file(&path) {
        Ok(f) => f,
        Err(e) => {
            eprintln!("[logger] Failed to open log file {:?}: {}", path, e);
            return;
        }
    };
    let _ = LOG_PATH.set(path.clone());

    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = fmt::Subscriber::builder()
        .with_max_level(level)
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(false)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        return;
    }

    tracing::info!(log = %path.display(), "LabelFE session started");

    let prev = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        tracing::error!(target: "panic", "PANIC: {}", info);
        prev(info);
    }));
}

/// Open `path` for a new session, writing a header line.
fn open_session_file(path: &Path) -> std::io::Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)?;
    writeln!(file, "=== LabelFE session started {} ===", human_timestamp())?;
    Ok(file)
}

fn log_file_path(data_dir: &Path) -> PathBuf {
    data_dir.join("LabelFE").join("labelfe.log")
}

/// Platform data directory (without the app sub-folder).
fn data_dir() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        if let Ok(appdata) = std::env::var("APPDATA") {
            return PathBuf::from(appdata);
        }
    }
    #[cfg(target_os = "macos")]
    {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join("Library")
                .join("Application Support");
        }
    }
    if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
        return PathBuf::from(xdg);
    }
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".local").join("share");
    }
    PathBuf::from(".")
}

fn human_timestamp() -> String {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => format!("(unix {})", d.as_secs()),
        Err(_) => "(unknown time)".to_string(),
    }
}
