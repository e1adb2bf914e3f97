/// The coordinating poll loop.
///
/// Runs as a single long-lived task: each cycle gates on network policy,
/// asks the change detector what moved, pulls each changed image through
/// the cache, hands it to the renderer, and records successes in history.
/// Per-item apply failures are logged and surface in the Error state but
/// never abort the remaining items; a cycle-level failure additionally
/// forces a fixed extended backoff. The loop itself only ever exits through
/// the stop channel.
///
/// `enable`/`disable` and state reads arrive from other tasks concurrently
/// with the loop, so the enabled flag is atomic and the state pair sits
/// behind a mutex. State-change events are emitted only on actual
/// transitions.
use anyhow::Result;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch, RwLock};
use tokio::time::{sleep, Duration};

use crate::api::LinkApi;
use crate::cache::{self, CacheSettings, ImageCache};
use crate::config::{Config, FitMode, SubscriptionKind};
use crate::detector::{ChangeDetector, ReportedChange};
use crate::event::DaemonEvent;
use crate::history::{HistoryItem, HistoryStore};
use crate::netgate;
use crate::renderer::Renderer;
use crate::status::PollingState;

/// Extended sleep after a cycle-level failure.
pub const ERROR_BACKOFF_SECS: u64 = 30;

pub struct PollCoordinator {
    config: Arc<RwLock<Config>>,
    api: Arc<dyn LinkApi>,
    detector: ChangeDetector,
    cache: Arc<ImageCache>,
    history: Arc<HistoryStore>,
    renderer: Arc<dyn Renderer>,
    enabled: AtomicBool,
    state: Mutex<(PollingState, Option<String>)>,
    events: mpsc::UnboundedSender<DaemonEvent>,
}

impl PollCoordinator {
    pub fn new(
        config: Arc<RwLock<Config>>,
        api: Arc<dyn LinkApi>,
        detector: ChangeDetector,
        cache: Arc<ImageCache>,
        history: Arc<HistoryStore>,
        renderer: Arc<dyn Renderer>,
        events: mpsc::UnboundedSender<DaemonEvent>,
    ) -> Self {
        Self {
            config,
            api,
            detector,
            cache,
            history,
            renderer,
            enabled: AtomicBool::new(false),
            state: Mutex::new((PollingState::Stopped, None)),
            events,
        }
    }

    /// Starts doing work on subsequent cycles. Idempotent.
    pub fn enable(&self) {
        if !self.enabled.swap(true, Ordering::SeqCst) {
            eprintln!("[poller] Polling enabled");
            self.set_state(PollingState::Running, None);
        }
    }

    /// Stops doing work (the loop keeps ticking idle). Idempotent.
    pub fn disable(&self) {
        if self.enabled.swap(false, Ordering::SeqCst) {
            eprintln!("[poller] Polling disabled");
            self.set_state(PollingState::Stopped, None);
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> (PollingState, Option<String>) {
        self.state.lock().unwrap().clone()
    }

    /// Runs until the stop channel flips to true. Spawn exactly once.
    pub async fn run(&self, mut stop_rx: watch::Receiver<bool>) {
        loop {
            if *stop_rx.borrow() {
                break;
            }

            let mut backoff = false;
            if self.is_enabled() {
                match self.run_cycle().await {
                    Ok(None) => {
                        // Error is not sticky: any clean cycle while enabled
                        // transitions back to Running.
                        if self.is_enabled() {
                            self.set_state(PollingState::Running, None);
                        }
                    }
                    Ok(Some(apply_failure)) => {
                        self.set_state(PollingState::Error, Some(apply_failure));
                    }
                    Err(e) => {
                        eprintln!("[poller] Cycle failed: {e:#}");
                        self.set_state(PollingState::Error, Some(format!("{e:#}")));
                        backoff = true;
                    }
                }
            }

            let sleep_secs = if backoff {
                ERROR_BACKOFF_SECS
            } else {
                self.config.read().await.polling.effective_interval_secs()
            };
            tokio::select! {
                _ = sleep(Duration::from_secs(sleep_secs)) => {}
                _ = stop_rx.changed() => {}
            }
        }
        eprintln!("[poller] Loop stopped");
    }

    /// Forwards a feedback response through the same network gate as the
    /// cycle. Returns `(success, message)`.
    pub async fn post_feedback(
        &self,
        link_id: &str,
        api_key: &str,
        response_type: &str,
        text: Option<&str>,
    ) -> (bool, String) {
        let cfg = self.config.read().await.clone();
        if !netgate::internet_reachable(&cfg.api.base_url).await {
            return (false, "internet unreachable".to_string());
        }
        if cfg.polling.restrict_to_local_network && !netgate::on_local_network() {
            return (false, "not on a local network".to_string());
        }
        self.detector
            .post_response(&cfg.api.base_url, link_id, api_key, response_type, text)
            .await
    }

    /// One check cycle. `Ok(None)` is a clean cycle (including policy
    /// skips); `Ok(Some(msg))` completed but had at least one apply
    /// failure; `Err` is an unexpected cycle-level failure.
    async fn run_cycle(&self) -> Result<Option<String>> {
        let cfg = self.config.read().await.clone();
        let subs = &cfg.subscriptions;

        if !subs.has_usable_id() {
            return Ok(None);
        }

        if !netgate::internet_reachable(&cfg.api.base_url).await {
            eprintln!("[poller] Skipping cycle: internet unreachable");
            return Ok(None);
        }
        if cfg.polling.restrict_to_local_network && !netgate::on_local_network() {
            eprintln!("[poller] Skipping cycle: not on a local network");
            return Ok(None);
        }

        let changes = self
            .detector
            .check_all(
                &cfg.api.base_url,
                subs.id_for(SubscriptionKind::Desktop),
                subs.id_for(SubscriptionKind::Lockscreen),
                subs.link_mode,
            )
            .await;

        let settings = CacheSettings::from(&cfg.cache);
        let mut apply_failure = None;
        for change in changes {
            // A surface can be individually switched off while its
            // subscription stays configured.
            if !subs.enabled_for(change.kind) {
                continue;
            }
            if let Err(e) = self
                .apply_change(&change, &settings, cfg.render.fit_mode)
                .await
            {
                let msg = format!("Apply of {} ({:?}) failed: {e:#}", change.image_url, change.kind);
                eprintln!("[poller] {msg}");
                apply_failure = Some(msg);
            }
        }
        Ok(apply_failure)
    }

    async fn apply_change(
        &self,
        change: &ReportedChange,
        settings: &CacheSettings,
        fit: FitMode,
    ) -> Result<()> {
        let path =
            cache::resolve_or_fetch(&self.cache, self.api.as_ref(), settings, &change.image_url)
                .await?;
        self.renderer.set_wallpaper(&path, fit, change.kind)?;
        eprintln!("[poller] Applied {} to {:?}", change.image_url, change.kind);
        self.history.add(make_history_item(change));
        Ok(())
    }

    fn set_state(&self, new_state: PollingState, error: Option<String>) {
        let mut cell = self.state.lock().unwrap();
        let changed = cell.0 != new_state;
        *cell = (new_state, error.clone());
        drop(cell);
        if changed {
            let _ = self.events.send(DaemonEvent::PollerState(new_state, error));
        }
    }
}

fn make_history_item(change: &ReportedChange) -> HistoryItem {
    HistoryItem {
        image_url: change.image_url.clone(),
        thumbnail_url: change.descriptor.post_thumbnail_url.clone(),
        description: change.descriptor.post_description.clone(),
        set_time: Utc::now(),
        kind: change.kind,
        set_by: change.descriptor.set_by.clone(),
        link_id: Some(change.link_id.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::path::Path;
    use std::sync::atomic::AtomicUsize;

    use crate::api::LinkDescriptor;
    use crate::config::LinkMode;

    #[derive(Default)]
    struct MockApi {
        descriptors: Mutex<HashMap<String, LinkDescriptor>>,
        fetches: AtomicUsize,
        posts: Mutex<Vec<(String, String, String)>>,
    }

    impl MockApi {
        fn assign(&self, id: &str, post_url: &str) {
            let descriptor = LinkDescriptor {
                post_url: Some(post_url.to_string()),
                post_description: Some("a description".to_string()),
                set_by: Some("someone".to_string()),
                ..Default::default()
            };
            self.descriptors.lock().unwrap().insert(id.to_string(), descriptor);
        }
    }

    #[async_trait]
    impl LinkApi for MockApi {
        async fn fetch_descriptor(&self, _base_url: &str, id: &str) -> Result<LinkDescriptor> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            self.descriptors
                .lock()
                .unwrap()
                .get(id)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("unknown link {id}"))
        }

        async fn post_response(
            &self,
            _base_url: &str,
            id: &str,
            api_key: &str,
            response_type: &str,
            _text: Option<&str>,
        ) -> Result<(bool, String)> {
            self.posts.lock().unwrap().push((
                id.to_string(),
                api_key.to_string(),
                response_type.to_string(),
            ));
            Ok((true, "ok".to_string()))
        }

        async fn download(&self, _url: &str) -> Result<Vec<u8>> {
            Ok(b"imagebytes".to_vec())
        }
    }

    #[derive(Default)]
    struct RecordingRenderer {
        calls: Mutex<Vec<(String, SubscriptionKind)>>,
        fail_kind: Mutex<Option<SubscriptionKind>>,
    }

    impl Renderer for RecordingRenderer {
        fn set_wallpaper(&self, image: &Path, _fit: FitMode, kind: SubscriptionKind) -> Result<()> {
            if *self.fail_kind.lock().unwrap() == Some(kind) {
                bail!("renderer rejected image for {kind:?}");
            }
            self.calls
                .lock()
                .unwrap()
                .push((image.display().to_string(), kind));
            Ok(())
        }
    }

    struct Fixture {
        coordinator: PollCoordinator,
        api: Arc<MockApi>,
        renderer: Arc<RecordingRenderer>,
        history: Arc<HistoryStore>,
        events: mpsc::UnboundedReceiver<DaemonEvent>,
        // Keeps the reachability probe target alive for the test's lifetime.
        _listener: tokio::net::TcpListener,
        _dir: tempfile::TempDir,
    }

    /// Builds a coordinator wired to mocks, with `base_url` pointing at a
    /// live local listener so the reachability gate passes.
    async fn fixture(mutate: impl FnOnce(&mut Config)) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let mut config = Config::default();
        config.api.base_url = format!("http://127.0.0.1:{port}");
        config.subscriptions.desktop_id = "42".to_string();
        config.subscriptions.link_mode = LinkMode::Separate;
        mutate(&mut config);

        let api = Arc::new(MockApi::default());
        let renderer = Arc::new(RecordingRenderer::default());
        let history = Arc::new(HistoryStore::new(dir.path().join("history.json"), 10));
        let settings = CacheSettings::from(&config.cache);
        let cache = Arc::new(ImageCache::new(dir.path().join("cache"), &settings));
        let detector = ChangeDetector::new(api.clone(), history.clone());
        let (tx, rx) = mpsc::unbounded_channel();

        let coordinator = PollCoordinator::new(
            Arc::new(RwLock::new(config)),
            api.clone(),
            detector,
            cache,
            history.clone(),
            renderer.clone(),
            tx,
        );

        Fixture {
            coordinator,
            api,
            renderer,
            history,
            events: rx,
            _listener: listener,
            _dir: dir,
        }
    }

    fn expect_state(fx: &mut Fixture) -> (PollingState, Option<String>) {
        match fx.events.try_recv() {
            Ok(DaemonEvent::PollerState(state, err)) => (state, err),
            Ok(_) => panic!("unexpected event type"),
            Err(e) => panic!("expected a state event: {e}"),
        }
    }

    // ── enable / disable ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn enable_and_disable_emit_one_event_each() {
        let mut fx = fixture(|_| {}).await;

        fx.coordinator.enable();
        assert_eq!(expect_state(&mut fx).0, PollingState::Running);
        // Idempotent: a second enable is silent.
        fx.coordinator.enable();
        assert!(fx.events.try_recv().is_err());

        fx.coordinator.disable();
        assert_eq!(expect_state(&mut fx).0, PollingState::Stopped);
        fx.coordinator.disable();
        assert!(fx.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn initial_state_is_stopped() {
        let fx = fixture(|_| {}).await;
        assert_eq!(fx.coordinator.state().0, PollingState::Stopped);
        assert!(!fx.coordinator.is_enabled());
    }

    // ── run_cycle ─────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn cycle_applies_change_and_records_history() {
        let mut fx = fixture(|_| {}).await;
        fx.api.assign("42", "https://x/a.png");

        let outcome = fx.coordinator.run_cycle().await.unwrap();
        assert!(outcome.is_none());

        let calls = fx.renderer.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].1, SubscriptionKind::Desktop);
        drop(calls);

        assert_eq!(fx.history.len(), 1);
        let item = &fx.history.items()[0];
        assert_eq!(item.image_url, "https://x/a.png");
        assert_eq!(item.link_id.as_deref(), Some("42"));
        assert_eq!(item.description.as_deref(), Some("a description"));
        assert!(fx.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn unchanged_remote_applies_nothing_on_second_cycle() {
        let fx = fixture(|_| {}).await;
        fx.api.assign("42", "https://x/a.png");

        fx.coordinator.run_cycle().await.unwrap();
        fx.coordinator.run_cycle().await.unwrap();

        assert_eq!(fx.renderer.calls.lock().unwrap().len(), 1);
        assert_eq!(fx.history.len(), 1);
    }

    #[tokio::test]
    async fn cycle_without_usable_id_fetches_nothing() {
        let fx = fixture(|c| {
            c.subscriptions.desktop_id.clear();
        })
        .await;

        let outcome = fx.coordinator.run_cycle().await.unwrap();
        assert!(outcome.is_none());
        assert_eq!(fx.api.fetches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unreachable_host_skips_cycle_without_error() {
        let fx = fixture(|c| {
            // Nothing listens on port 1; the reachability gate must fail.
            c.api.base_url = "http://127.0.0.1:1".to_string();
        })
        .await;
        fx.api.assign("42", "https://x/a.png");

        let outcome = fx.coordinator.run_cycle().await.unwrap();
        assert!(outcome.is_none());
        assert_eq!(fx.api.fetches.load(Ordering::SeqCst), 0);
        assert!(fx.history.is_empty());
    }

    #[tokio::test]
    async fn per_kind_disable_filters_shared_reports() {
        let fx = fixture(|c| {
            c.subscriptions.link_mode = LinkMode::Shared;
            c.subscriptions.lockscreen_enabled = false;
        })
        .await;
        fx.api.assign("42", "https://x/a.png");

        fx.coordinator.run_cycle().await.unwrap();

        let calls = fx.renderer.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].1, SubscriptionKind::Desktop);
    }

    #[tokio::test]
    async fn apply_failure_does_not_abort_remaining_changes() {
        let mut fx = fixture(|c| {
            c.subscriptions.link_mode = LinkMode::Shared;
        })
        .await;
        fx.api.assign("42", "https://x/a.png");
        *fx.renderer.fail_kind.lock().unwrap() = Some(SubscriptionKind::Desktop);

        let outcome = fx.coordinator.run_cycle().await.unwrap();

        // The desktop apply failed but the lock-screen one still ran.
        let failure = outcome.expect("cycle should report the apply failure");
        assert!(failure.contains("Desktop"));
        let calls = fx.renderer.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].1, SubscriptionKind::Lockscreen);
        drop(calls);

        // Only the successful apply reached history.
        assert_eq!(fx.history.len(), 1);
        assert_eq!(fx.history.items()[0].kind, SubscriptionKind::Lockscreen);
        assert!(fx.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn error_state_recovers_on_next_clean_cycle() {
        let mut fx = fixture(|_| {}).await;
        fx.coordinator.enable();
        let _ = expect_state(&mut fx); // Running

        fx.coordinator
            .set_state(PollingState::Error, Some("boom".to_string()));
        let (state, err) = expect_state(&mut fx);
        assert_eq!(state, PollingState::Error);
        assert_eq!(err.as_deref(), Some("boom"));

        // A clean cycle while enabled flips back to Running.
        let outcome = fx.coordinator.run_cycle().await.unwrap();
        assert!(outcome.is_none());
        fx.coordinator.set_state(PollingState::Running, None);
        assert_eq!(expect_state(&mut fx).0, PollingState::Running);
    }

    #[tokio::test]
    async fn repeated_error_state_does_not_renotify() {
        let mut fx = fixture(|_| {}).await;
        fx.coordinator
            .set_state(PollingState::Error, Some("first".to_string()));
        assert_eq!(expect_state(&mut fx).0, PollingState::Error);

        fx.coordinator
            .set_state(PollingState::Error, Some("second".to_string()));
        assert!(fx.events.try_recv().is_err());
        // The message still updates silently.
        assert_eq!(fx.coordinator.state().1.as_deref(), Some("second"));
    }

    #[tokio::test]
    async fn disabled_cache_still_applies_via_temp_file() {
        let fx = fixture(|c| {
            c.cache.enabled = false;
        })
        .await;
        fx.api.assign("42", "https://x/a.png");

        fx.coordinator.run_cycle().await.unwrap();

        let calls = fx.renderer.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(fx.history.len(), 1);
    }

    // ── run loop ──────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn run_exits_promptly_on_stop_signal() {
        let fx = fixture(|_| {}).await;
        let (stop_tx, stop_rx) = watch::channel(false);

        let handle = {
            let coordinator = Arc::new(fx.coordinator);
            let c = coordinator.clone();
            tokio::spawn(async move { c.run(stop_rx).await })
        };

        // Let the loop park itself in its sleep, then stop it.
        tokio::time::sleep(Duration::from_millis(50)).await;
        stop_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("loop did not stop in time")
            .unwrap();
    }

    // ── post_feedback ─────────────────────────────────────────────────────────

    #[tokio::test]
    async fn post_feedback_forwards_when_network_eligible() {
        let fx = fixture(|_| {}).await;
        let (ok, _) = fx
            .coordinator
            .post_feedback("42", "key", "liked", Some("nice"))
            .await;
        assert!(ok);
        let posts = fx.api.posts.lock().unwrap();
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0], ("42".to_string(), "key".to_string(), "liked".to_string()));
    }

    #[tokio::test]
    async fn post_feedback_fails_closed_when_unreachable() {
        let fx = fixture(|c| {
            c.api.base_url = "http://127.0.0.1:1".to_string();
        })
        .await;
        let (ok, msg) = fx.coordinator.post_feedback("42", "key", "liked", None).await;
        assert!(!ok);
        assert!(msg.contains("unreachable"));
        assert!(fx.api.posts.lock().unwrap().is_empty());
    }
}
