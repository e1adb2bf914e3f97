/// Reapply and rollback over the applied-image history.
///
/// Reapply is what makes an installed image survive reboots: at startup the
/// newest history entry per surface is pushed back through the renderer.
/// Rollback reverts a surface to its previous entry and forgets the
/// rejected one — but only after the renderer confirmed the revert, so a
/// failed apply never loses history.
use anyhow::Result;
use std::sync::Arc;

use crate::api::LinkApi;
use crate::cache::{self, CacheSettings, ImageCache};
use crate::config::{FitMode, SubscriptionKind};
use crate::history::{HistoryItem, HistoryStore};
use crate::renderer::Renderer;

pub struct RollbackManager {
    history: Arc<HistoryStore>,
    renderer: Arc<dyn Renderer>,
    cache: Arc<ImageCache>,
    api: Arc<dyn LinkApi>,
}

impl RollbackManager {
    pub fn new(
        history: Arc<HistoryStore>,
        renderer: Arc<dyn Renderer>,
        cache: Arc<ImageCache>,
        api: Arc<dyn LinkApi>,
    ) -> Self {
        Self {
            history,
            renderer,
            cache,
            api,
        }
    }

    /// Re-applies the newest history entry of every surface that has one.
    /// Returns true when at least one surface was successfully reapplied.
    pub async fn reapply_current(&self, settings: &CacheSettings, fit: FitMode) -> bool {
        let mut applied = false;
        for kind in SubscriptionKind::ALL {
            let Some(item) = self.history.newest_for_kind(kind) else {
                continue;
            };
            match self.apply(&item, settings, fit, kind).await {
                Ok(()) => {
                    eprintln!("[rollback] Reapplied {} ({kind:?})", item.image_url);
                    applied = true;
                }
                Err(e) => {
                    eprintln!("[rollback] Reapply of {} ({kind:?}) failed: {e:#}", item.image_url)
                }
            }
        }
        applied
    }

    /// Reverts `kind` to its previous entry. Requires both a current and a
    /// previous entry of that kind; on success the rejected current entry is
    /// removed from history. A renderer failure leaves history untouched.
    pub async fn rollback_to_previous(
        &self,
        kind: SubscriptionKind,
        settings: &CacheSettings,
        fit: FitMode,
    ) -> bool {
        let items = self.history.items_for_kind(kind);
        if items.len() < 2 {
            eprintln!("[rollback] Nothing to roll back to for {kind:?}");
            return false;
        }
        let current = &items[0];
        let previous = &items[1];

        match self.apply(previous, settings, fit, kind).await {
            Ok(()) => {
                self.history.remove(&current.image_url);
                eprintln!(
                    "[rollback] Rolled {kind:?} back to {} (dropped {})",
                    previous.image_url, current.image_url
                );
                true
            }
            Err(e) => {
                eprintln!("[rollback] Rollback of {kind:?} failed: {e:#}");
                false
            }
        }
    }

    /// The newest history entry per surface, for display. Pure read.
    pub fn current_state(&self) -> (Option<HistoryItem>, Option<HistoryItem>) {
        (
            self.history.newest_for_kind(SubscriptionKind::Desktop),
            self.history.newest_for_kind(SubscriptionKind::Lockscreen),
        )
    }

    async fn apply(
        &self,
        item: &HistoryItem,
        settings: &CacheSettings,
        fit: FitMode,
        kind: SubscriptionKind,
    ) -> Result<()> {
        let path =
            cache::resolve_or_fetch(&self.cache, self.api.as_ref(), settings, &item.image_url)
                .await?;
        self.renderer.set_wallpaper(&path, fit, kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    use crate::api::LinkDescriptor;

    struct StaticApi;

    #[async_trait]
    impl LinkApi for StaticApi {
        async fn fetch_descriptor(&self, _base_url: &str, _id: &str) -> Result<LinkDescriptor> {
            bail!("not used")
        }

        async fn post_response(
            &self,
            _base_url: &str,
            _id: &str,
            _api_key: &str,
            _response_type: &str,
            _text: Option<&str>,
        ) -> Result<(bool, String)> {
            bail!("not used")
        }

        async fn download(&self, _url: &str) -> Result<Vec<u8>> {
            Ok(b"imagebytes".to_vec())
        }
    }

    #[derive(Default)]
    struct RecordingRenderer {
        calls: Mutex<Vec<(PathBuf, SubscriptionKind)>>,
        fail: AtomicBool,
    }

    impl Renderer for RecordingRenderer {
        fn set_wallpaper(&self, image: &Path, _fit: FitMode, kind: SubscriptionKind) -> Result<()> {
            if self.fail.load(Ordering::Relaxed) {
                bail!("renderer rejected image");
            }
            self.calls.lock().unwrap().push((image.to_path_buf(), kind));
            Ok(())
        }
    }

    fn applied(url: &str, kind: SubscriptionKind) -> HistoryItem {
        HistoryItem {
            image_url: url.to_string(),
            thumbnail_url: None,
            description: None,
            set_time: Utc::now(),
            kind,
            set_by: None,
            link_id: None,
        }
    }

    fn manager_at(
        dir: &tempfile::TempDir,
    ) -> (RollbackManager, Arc<HistoryStore>, Arc<RecordingRenderer>, CacheSettings) {
        let settings = CacheSettings {
            enabled: true,
            max_bytes: 10 * 1024,
            expiry: std::time::Duration::from_secs(3600),
        };
        let history = Arc::new(HistoryStore::new(dir.path().join("history.json"), 10));
        let renderer = Arc::new(RecordingRenderer::default());
        let cache = Arc::new(ImageCache::new(dir.path().join("cache"), &settings));
        let manager = RollbackManager::new(
            history.clone(),
            renderer.clone(),
            cache,
            Arc::new(StaticApi),
        );
        (manager, history, renderer, settings)
    }

    // ── rollback_to_previous ──────────────────────────────────────────────────

    #[tokio::test]
    async fn rollback_fails_with_fewer_than_two_entries_of_kind() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, history, renderer, settings) = manager_at(&dir);
        history.add(applied("https://x/only.png", SubscriptionKind::Desktop));

        let ok = manager
            .rollback_to_previous(SubscriptionKind::Desktop, &settings, FitMode::Fill)
            .await;

        assert!(!ok);
        assert_eq!(history.len(), 1);
        assert!(renderer.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn rollback_applies_previous_and_drops_current() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, history, renderer, settings) = manager_at(&dir);
        history.add(applied("https://x/old.png", SubscriptionKind::Desktop));
        history.add(applied("https://x/new.png", SubscriptionKind::Desktop));

        let ok = manager
            .rollback_to_previous(SubscriptionKind::Desktop, &settings, FitMode::Fill)
            .await;

        assert!(ok);
        let urls: Vec<String> = history.items().into_iter().map(|e| e.image_url).collect();
        assert_eq!(urls, vec!["https://x/old.png"]);

        let calls = renderer.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].1, SubscriptionKind::Desktop);
    }

    #[tokio::test]
    async fn rollback_only_counts_entries_of_the_requested_kind() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, history, _renderer, settings) = manager_at(&dir);
        history.add(applied("https://x/d1.png", SubscriptionKind::Desktop));
        history.add(applied("https://x/l1.png", SubscriptionKind::Lockscreen));

        // Two entries total, but only one per kind — both must refuse.
        assert!(
            !manager
                .rollback_to_previous(SubscriptionKind::Desktop, &settings, FitMode::Fill)
                .await
        );
        assert!(
            !manager
                .rollback_to_previous(SubscriptionKind::Lockscreen, &settings, FitMode::Fill)
                .await
        );
        assert_eq!(history.len(), 2);
    }

    #[tokio::test]
    async fn failed_render_leaves_history_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, history, renderer, settings) = manager_at(&dir);
        history.add(applied("https://x/old.png", SubscriptionKind::Desktop));
        history.add(applied("https://x/new.png", SubscriptionKind::Desktop));
        renderer.fail.store(true, Ordering::Relaxed);

        let ok = manager
            .rollback_to_previous(SubscriptionKind::Desktop, &settings, FitMode::Fill)
            .await;

        assert!(!ok);
        assert_eq!(history.len(), 2);
        assert_eq!(history.items()[0].image_url, "https://x/new.png");
    }

    // ── reapply_current ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn reapply_with_empty_history_returns_false() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _history, renderer, settings) = manager_at(&dir);
        assert!(!manager.reapply_current(&settings, FitMode::Fill).await);
        assert!(renderer.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn reapply_applies_newest_entry_per_kind() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, history, renderer, settings) = manager_at(&dir);
        history.add(applied("https://x/d1.png", SubscriptionKind::Desktop));
        history.add(applied("https://x/d2.png", SubscriptionKind::Desktop));
        history.add(applied("https://x/l1.png", SubscriptionKind::Lockscreen));

        assert!(manager.reapply_current(&settings, FitMode::Fill).await);

        let calls = renderer.calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].1, SubscriptionKind::Desktop);
        assert_eq!(calls[1].1, SubscriptionKind::Lockscreen);
    }

    #[tokio::test]
    async fn reapply_returns_false_when_every_render_fails() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, history, renderer, settings) = manager_at(&dir);
        history.add(applied("https://x/d1.png", SubscriptionKind::Desktop));
        renderer.fail.store(true, Ordering::Relaxed);

        assert!(!manager.reapply_current(&settings, FitMode::Fill).await);
    }

    // ── current_state ─────────────────────────────────────────────────────────

    #[tokio::test]
    async fn current_state_reads_newest_per_kind_without_mutating() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, history, _renderer, _settings) = manager_at(&dir);
        history.add(applied("https://x/d1.png", SubscriptionKind::Desktop));
        history.add(applied("https://x/d2.png", SubscriptionKind::Desktop));

        let (desktop, lockscreen) = manager.current_state();
        assert_eq!(desktop.unwrap().image_url, "https://x/d2.png");
        assert!(lockscreen.is_none());
        assert_eq!(history.len(), 2);
    }
}
