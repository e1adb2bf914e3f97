/// Canonical file locations for Linkwall data files.
///
/// Everything lives under the platform's local data directory
/// (e.g. `%LOCALAPPDATA%\linkwall` on Windows, `~/.local/share/linkwall`
/// on Linux):
///   - config.toml    Written by the user (or a companion UI), read by the daemon.
///   - status.toml    Written by the daemon, read by external tooling.
///   - history.json   The applied-image history, owned by the daemon.
///   - cache/         Content-addressed store of downloaded images.
use std::path::PathBuf;

const APP_DIR_NAME: &str = "linkwall";
pub const CONFIG_FILE_NAME: &str = "config.toml";
pub const STATUS_FILE_NAME: &str = "status.toml";
pub const HISTORY_FILE_NAME: &str = "history.json";
pub const CACHE_DIR_NAME: &str = "cache";

/// Returns the Linkwall application data directory.
pub fn app_data_dir() -> PathBuf {
    let base = dirs::data_local_dir().expect("no local data directory on this platform");
    base.join(APP_DIR_NAME)
}

/// Returns the full path to the config file.
pub fn config_file_path() -> PathBuf {
    app_data_dir().join(CONFIG_FILE_NAME)
}

/// Returns the full path to the status file.
pub fn status_file_path() -> PathBuf {
    app_data_dir().join(STATUS_FILE_NAME)
}

/// Returns the full path to the persisted history file.
pub fn history_file_path() -> PathBuf {
    app_data_dir().join(HISTORY_FILE_NAME)
}

/// Returns the image cache directory.
pub fn cache_dir() -> PathBuf {
    app_data_dir().join(CACHE_DIR_NAME)
}
