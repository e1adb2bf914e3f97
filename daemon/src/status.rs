use serde::{Deserialize, Serialize};
use std::path::Path;

/// Current operational state of the poll loop.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum PollingState {
    /// Polling is disabled; cycles sleep without doing work.
    Stopped,
    /// Polling is enabled and cycles are completing normally.
    Running,
    /// The last cycle raised an error; the loop is backing off and will
    /// retry. Cleared by the next successful cycle.
    Error,
}

/// Runtime status written by the daemon to status.toml under the app data
/// directory. External tooling reads this file (read-only) to display
/// daemon state.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DaemonStatus {
    /// Daemon binary version (set from Cargo.toml at compile time).
    pub version: String,
    /// Current poll-loop state.
    pub state: PollingState,
    /// Message of the error that put the loop into the Error state, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// URL of the image currently applied to the desktop surface, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub desktop_image: Option<String>,
    /// URL of the image currently applied to the lock-screen surface, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lockscreen_image: Option<String>,
}

impl DaemonStatus {
    /// Constructs the initial stopped status on daemon startup.
    pub fn new() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            state: PollingState::Stopped,
            last_error: None,
            desktop_image: None,
            lockscreen_image: None,
        }
    }
}

/// Serializes `status` to TOML and writes it to `path`.
/// Creates the parent directory if it does not exist.
/// Logs errors to stderr rather than panicking — a status write failure
/// must never take the daemon down.
pub fn write_status(path: &Path, status: &DaemonStatus) {
    if let Some(parent) = path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            eprintln!("[status] Failed to create directory {}: {e}", parent.display());
            return;
        }
    }
    match toml::to_string_pretty(status) {
        Ok(content) => {
            if let Err(e) = std::fs::write(path, content) {
                eprintln!("[status] Failed to write status file: {e}");
            }
        }
        Err(e) => eprintln!("[status] Failed to serialize status: {e}"),
    }
}
