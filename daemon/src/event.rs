use crate::config::Config;
use crate::history::HistoryEvent;
use crate::status::PollingState;

pub enum DaemonEvent {
    /// The config file changed on disk and was successfully re-parsed.
    ConfigReloaded(Config),
    /// The poll loop transitioned to a new state. Emitted only when the new
    /// state differs from the previous one.
    PollerState(PollingState, Option<String>),
    /// The history store mutated (item applied, or history cleared).
    HistoryChanged(HistoryEvent),
    /// Ctrl+C received; the daemon should stop the poll loop and exit.
    Shutdown,
}
