/// Change detection over the remote link subscriptions.
///
/// Keeps an in-memory (link id, kind) → last-seen-image map so an unchanged
/// remote assignment is never re-reported. The map is seeded lazily from the
/// newest history entry of the relevant kind, which is what stops a restart
/// from re-applying the image installed in a previous session.
///
/// Remote fetch failures are logged and count as "no change" for that id —
/// they never bubble into the coordinator as a distinct error class.
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::api::{LinkApi, LinkDescriptor};
use crate::config::{LinkMode, SubscriptionKind};
use crate::history::HistoryStore;

/// One detected assignment change, targeted at a single surface.
#[derive(Debug, Clone)]
pub struct ReportedChange {
    pub kind: SubscriptionKind,
    /// Subscription id the change arrived through.
    pub link_id: String,
    pub image_url: String,
    /// Full fetched descriptor, for history enrichment.
    pub descriptor: LinkDescriptor,
}

pub struct ChangeDetector {
    api: Arc<dyn LinkApi>,
    history: Arc<HistoryStore>,
    last_seen: Mutex<HashMap<(String, SubscriptionKind), String>>,
}

impl ChangeDetector {
    pub fn new(api: Arc<dyn LinkApi>, history: Arc<HistoryStore>) -> Self {
        Self {
            api,
            history,
            last_seen: Mutex::new(HashMap::new()),
        }
    }

    /// Checks the configured subscriptions and returns every surface whose
    /// assigned image changed since it was last seen.
    ///
    /// Shared mode queries one id (desktop preferred) and, on a change,
    /// reports the same image for **both** surfaces. Separate mode checks
    /// each surface's own id independently.
    pub async fn check_all(
        &self,
        base_url: &str,
        desktop_id: Option<&str>,
        lockscreen_id: Option<&str>,
        mode: LinkMode,
    ) -> Vec<ReportedChange> {
        match mode {
            LinkMode::Shared => {
                let Some(id) = desktop_id.or(lockscreen_id) else {
                    return Vec::new();
                };
                let Some(descriptor) = self.fetch(base_url, id).await else {
                    return Vec::new();
                };
                let Some(image_url) = assigned_image(&descriptor) else {
                    return Vec::new();
                };
                // One shared visual: compared against the desktop slot's
                // memory, reported and remembered for both slots.
                if !self.differs(id, SubscriptionKind::Desktop, &image_url) {
                    return Vec::new();
                }
                for kind in SubscriptionKind::ALL {
                    self.remember(id, kind, &image_url);
                }
                SubscriptionKind::ALL
                    .into_iter()
                    .map(|kind| ReportedChange {
                        kind,
                        link_id: id.to_string(),
                        image_url: image_url.clone(),
                        descriptor: descriptor.clone(),
                    })
                    .collect()
            }
            LinkMode::Separate => {
                let mut changes = Vec::new();
                let pairs = [
                    (SubscriptionKind::Desktop, desktop_id),
                    (SubscriptionKind::Lockscreen, lockscreen_id),
                ];
                for (kind, id) in pairs {
                    let Some(id) = id else { continue };
                    let Some(descriptor) = self.fetch(base_url, id).await else {
                        continue;
                    };
                    let Some(image_url) = assigned_image(&descriptor) else {
                        continue;
                    };
                    if !self.differs(id, kind, &image_url) {
                        continue;
                    }
                    self.remember(id, kind, &image_url);
                    changes.push(ReportedChange {
                        kind,
                        link_id: id.to_string(),
                        image_url,
                        descriptor,
                    });
                }
                changes
            }
        }
    }

    /// Posts a feedback response for `id`. Validation failures and transport
    /// errors surface as `(false, message)`, never as panics or Err.
    pub async fn post_response(
        &self,
        base_url: &str,
        id: &str,
        api_key: &str,
        response_type: &str,
        text: Option<&str>,
    ) -> (bool, String) {
        if id.trim().is_empty() {
            return (false, "subscription id is required".to_string());
        }
        if api_key.trim().is_empty() {
            return (false, "api key is required".to_string());
        }
        match self
            .api
            .post_response(base_url, id, api_key, response_type, text)
            .await
        {
            Ok(result) => result,
            Err(e) => (false, format!("{e:#}")),
        }
    }

    async fn fetch(&self, base_url: &str, id: &str) -> Option<LinkDescriptor> {
        match self.api.fetch_descriptor(base_url, id).await {
            Ok(d) => Some(d),
            Err(e) => {
                eprintln!("[detector] Fetch failed for link {id}: {e:#}");
                None
            }
        }
    }

    /// True when `image_url` is not what this (id, kind) slot last saw.
    /// A slot with no in-memory value is seeded from the newest history
    /// entry of its kind before comparing.
    fn differs(&self, id: &str, kind: SubscriptionKind, image_url: &str) -> bool {
        let key = (id.to_string(), kind);
        let mut last_seen = self.last_seen.lock().unwrap();
        let last = match last_seen.get(&key) {
            Some(url) => Some(url.clone()),
            None => {
                let seeded = self.history.newest_for_kind(kind).map(|i| i.image_url);
                if let Some(url) = &seeded {
                    last_seen.insert(key, url.clone());
                }
                seeded
            }
        };
        last.as_deref() != Some(image_url)
    }

    fn remember(&self, id: &str, kind: SubscriptionKind, image_url: &str) {
        self.last_seen
            .lock()
            .unwrap()
            .insert((id.to_string(), kind), image_url.to_string());
    }
}

/// The non-empty assigned image URL, if the descriptor carries one.
fn assigned_image(descriptor: &LinkDescriptor) -> Option<String> {
    descriptor
        .post_url
        .as_deref()
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .map(str::to_string)
}
