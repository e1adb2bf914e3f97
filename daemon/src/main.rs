mod api;
mod cache;
mod config;
mod detector;
mod event;
mod history;
mod netgate;
mod paths;
mod poller;
mod renderer;
mod rollback;
mod startup;
mod status;

use std::sync::Arc;
use tokio::sync::{mpsc, watch, RwLock};

use crate::cache::{CacheSettings, ImageCache};
use crate::detector::ChangeDetector;
use crate::event::DaemonEvent;
use crate::history::HistoryStore;
use crate::poller::PollCoordinator;
use crate::rollback::RollbackManager;
use crate::status::{DaemonStatus, PollingState};

#[tokio::main]
async fn main() {
    // ── CLI flags ─────────────────────────────────────────────────────────────
    if std::env::args().any(|a| a == "--unregister-startup") {
        if let Err(e) = startup::unregister_startup() {
            eprintln!("Failed to unregister startup: {e:#}");
            std::process::exit(1);
        }
        return;
    }

    // ── App data directory ────────────────────────────────────────────────────
    let app_dir = paths::app_data_dir();
    if let Err(e) = std::fs::create_dir_all(&app_dir) {
        eprintln!("Failed to create app data directory {}: {e}", app_dir.display());
        std::process::exit(1);
    }

    // ── Configuration ─────────────────────────────────────────────────────────
    let config_path = paths::config_file_path();
    let initial_config = config::load_or_default(&config_path).unwrap_or_else(|e| {
        eprintln!("[config] Error (using defaults): {e}");
        config::Config::default()
    });
    if initial_config.daemon.autostart {
        if let Err(e) = startup::register_startup() {
            eprintln!("[startup] Registration failed: {e:#}");
        }
    }
    let shared_config = Arc::new(RwLock::new(initial_config.clone()));

    // ── Initial status ────────────────────────────────────────────────────────
    let status_path = paths::status_file_path();
    let mut current_status = DaemonStatus::new();
    status::write_status(&status_path, &current_status);

    // ── Stores and collaborators ──────────────────────────────────────────────
    let history = Arc::new(HistoryStore::new(
        paths::history_file_path(),
        initial_config.history.max_entries,
    ));
    let mut history_rx = history.subscribe();

    let cache_settings = CacheSettings::from(&initial_config.cache);
    let cache = Arc::new(ImageCache::new(paths::cache_dir(), &cache_settings));

    let api: Arc<dyn api::LinkApi> = match api::HttpLinkApi::new() {
        Ok(client) => Arc::new(client),
        Err(e) => {
            eprintln!("Failed to initialize HTTP client: {e:#}");
            std::process::exit(1);
        }
    };

    // The renderer is chosen once here; nothing below branches on platform.
    let renderer = renderer::platform_renderer();

    let detector = ChangeDetector::new(Arc::clone(&api), Arc::clone(&history));
    let rollback = RollbackManager::new(
        Arc::clone(&history),
        Arc::clone(&renderer),
        Arc::clone(&cache),
        Arc::clone(&api),
    );

    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<DaemonEvent>();

    // ── Background tasks ──────────────────────────────────────────────────────
    {
        let tx = event_tx.clone();
        tokio::spawn(async move {
            while let Some(ev) = history_rx.recv().await {
                if tx.send(DaemonEvent::HistoryChanged(ev)).is_err() {
                    break;
                }
            }
        });
    }
    tokio::spawn(config::watch_config(config_path, event_tx.clone()));

    // Graceful shutdown on Ctrl+C.
    {
        let tx = event_tx.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                let _ = tx.send(DaemonEvent::Shutdown);
            }
        });
    }

    // ── Poll loop ─────────────────────────────────────────────────────────────
    let coordinator = Arc::new(PollCoordinator::new(
        Arc::clone(&shared_config),
        Arc::clone(&api),
        detector,
        Arc::clone(&cache),
        Arc::clone(&history),
        Arc::clone(&renderer),
        event_tx.clone(),
    ));

    // Restore the last applied images before the first check so the surfaces
    // survive a reboot even if the remote is unreachable.
    if rollback
        .reapply_current(&cache_settings, initial_config.render.fit_mode)
        .await
    {
        println!("Restored previously applied image(s)");
    }
    sync_current_images(&mut current_status, &rollback);
    status::write_status(&status_path, &current_status);

    if initial_config.polling.enabled {
        coordinator.enable();
    }
    let (stop_tx, stop_rx) = watch::channel(false);
    {
        let coordinator = Arc::clone(&coordinator);
        tokio::spawn(async move {
            coordinator.run(stop_rx).await;
        });
    }

    println!("linkwall-daemon v{} started", env!("CARGO_PKG_VERSION"));

    // ── Event loop ────────────────────────────────────────────────────────────
    while let Some(evt) = event_rx.recv().await {
        match evt {
            DaemonEvent::ConfigReloaded(new_config) => {
                println!("Config reloaded");
                history.set_max_entries(new_config.history.max_entries);
                if new_config.polling.enabled {
                    coordinator.enable();
                } else {
                    coordinator.disable();
                }
                if new_config.daemon.autostart {
                    if let Err(e) = startup::register_startup() {
                        eprintln!("[startup] Registration failed: {e:#}");
                    }
                }
                *shared_config.write().await = new_config;
            }

            DaemonEvent::PollerState(state, last_error) => {
                current_status.state = state;
                current_status.last_error = last_error;
                status::write_status(&status_path, &current_status);
            }

            DaemonEvent::HistoryChanged(_) => {
                sync_current_images(&mut current_status, &rollback);
                status::write_status(&status_path, &current_status);
            }

            DaemonEvent::Shutdown => {
                println!("Shutting down");
                let _ = stop_tx.send(true);
                coordinator.disable();
                current_status.state = PollingState::Stopped;
                status::write_status(&status_path, &current_status);
                break;
            }
        }
    }
}

/// Mirrors the newest applied image per surface into the status file fields.
fn sync_current_images(status: &mut DaemonStatus, rollback: &RollbackManager) {
    let (desktop, lockscreen) = rollback.current_state();
    status.desktop_image = desktop.map(|i| i.image_url);
    status.lockscreen_image = lockscreen.map(|i| i.image_url);
}
