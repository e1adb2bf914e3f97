/// Ordered, deduplicated, size-bounded log of applied images.
///
/// Newest entries sit at index 0. An image URL appears at most once: a
/// repeat of an existing URL overwrites that entry **in place at its
/// current index** rather than moving it to the front (observed upstream
/// behavior, kept deliberately — see DESIGN.md). Every mutation is
/// persisted write-through to a JSON file; a failed write is logged and the
/// in-memory state stays authoritative for the session.
///
/// All read-modify-write-persist sequences run under one mutex because
/// apply completions call [`HistoryStore::add`] from several background
/// contexts.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Mutex;
use tokio::sync::mpsc;

use crate::config::SubscriptionKind;

/// One applied image, keyed by `image_url`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryItem {
    pub image_url: String,
    #[serde(default)]
    pub thumbnail_url: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    pub set_time: DateTime<Utc>,
    pub kind: SubscriptionKind,
    #[serde(default)]
    pub set_by: Option<String>,
    /// Subscription id the image arrived through.
    #[serde(default)]
    pub link_id: Option<String>,
}

/// Fired on every successful mutation: `Added` for inserts and in-place
/// replacements, `Cleared` for clear-all. No event fires for no-ops.
#[derive(Debug, Clone)]
pub enum HistoryEvent {
    Added(HistoryItem),
    Cleared,
}

struct Inner {
    entries: Vec<HistoryItem>,
    max_entries: usize,
    subscribers: Vec<mpsc::UnboundedSender<HistoryEvent>>,
}

pub struct HistoryStore {
    path: PathBuf,
    inner: Mutex<Inner>,
}

impl HistoryStore {
    /// Opens the store at `path`, loading and normalizing any persisted
    /// history (see [`load`](Self::load) semantics).
    pub fn new(path: PathBuf, max_entries: usize) -> Self {
        let store = Self {
            path,
            inner: Mutex::new(Inner {
                entries: Vec::new(),
                max_entries,
                subscribers: Vec::new(),
            }),
        };
        {
            let mut inner = store.inner.lock().unwrap();
            store.load_locked(&mut inner);
        }
        store
    }

    /// Registers a listener. Events fire for mutations made after this call.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<HistoryEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.lock().unwrap().subscribers.push(tx);
        rx
    }

    /// Records an applied image.
    ///
    /// With `max_entries == 0` the item is only announced to listeners,
    /// never retained or persisted. Otherwise a repeated `image_url`
    /// overwrites its existing entry in place; a new URL is inserted at the
    /// front and the tail is dropped down to the limit.
    pub fn add(&self, item: HistoryItem) {
        let mut inner = self.inner.lock().unwrap();

        if inner.max_entries == 0 {
            Self::notify(&mut inner, HistoryEvent::Added(item));
            return;
        }

        match inner.entries.iter().position(|e| e.image_url == item.image_url) {
            Some(index) => inner.entries[index] = item.clone(),
            None => {
                inner.entries.insert(0, item.clone());
                let max = inner.max_entries;
                inner.entries.truncate(max);
            }
        }

        self.persist_locked(&inner);
        Self::notify(&mut inner, HistoryEvent::Added(item));
    }

    /// Empties the store. A no-op (no persist, no event) when already empty.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.entries.is_empty() {
            return;
        }
        inner.entries.clear();
        self.persist_locked(&inner);
        Self::notify(&mut inner, HistoryEvent::Cleared);
    }

    /// Removes the entry with `image_url`, if present. Used by rollback.
    pub fn remove(&self, image_url: &str) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let Some(index) = inner.entries.iter().position(|e| e.image_url == image_url) else {
            return false;
        };
        inner.entries.remove(index);
        self.persist_locked(&inner);
        true
    }

    /// Applies a new entry limit and re-runs the load/normalize passes.
    pub fn set_max_entries(&self, max_entries: usize) {
        let mut inner = self.inner.lock().unwrap();
        if inner.max_entries == max_entries {
            return;
        }
        inner.max_entries = max_entries;
        self.load_locked(&mut inner);
    }

    /// Snapshot of all entries, newest first.
    pub fn items(&self) -> Vec<HistoryItem> {
        self.inner.lock().unwrap().entries.clone()
    }

    /// Entries of one kind, newest first.
    pub fn items_for_kind(&self, kind: SubscriptionKind) -> Vec<HistoryItem> {
        self.inner
            .lock()
            .unwrap()
            .entries
            .iter()
            .filter(|e| e.kind == kind)
            .cloned()
            .collect()
    }

    /// The most recently applied entry of `kind`, if any.
    pub fn newest_for_kind(&self, kind: SubscriptionKind) -> Option<HistoryItem> {
        self.inner
            .lock()
            .unwrap()
            .entries
            .iter()
            .find(|e| e.kind == kind)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().entries.is_empty()
    }

    /// Reads the persisted file into memory.
    ///
    /// A corrupt file is renamed aside as a backup and replaced by a fresh,
    /// persisted empty store — never a crash. After a successful read, two
    /// normalization passes run: de-duplicate by `image_url` keeping the
    /// first (newest) occurrence, then trim to the entry limit (0 clears
    /// entirely). The file is re-persisted when either pass changed
    /// anything.
    fn load_locked(&self, inner: &mut Inner) {
        let loaded: Vec<HistoryItem> = match std::fs::read_to_string(&self.path) {
            Err(_) => Vec::new(),
            Ok(content) => match serde_json::from_str(&content) {
                Ok(entries) => entries,
                Err(e) => {
                    eprintln!("[history] Corrupt history file ({e}); backing it up");
                    let backup = self.path.with_extension("json.bak");
                    if std::fs::rename(&self.path, &backup).is_err() {
                        if let Err(e) = std::fs::copy(&self.path, &backup) {
                            eprintln!("[history] Failed to back up corrupt file: {e}");
                        }
                    }
                    inner.entries = Vec::new();
                    self.persist_locked(inner);
                    return;
                }
            },
        };

        let before = loaded.len();
        let mut deduped: Vec<HistoryItem> = Vec::with_capacity(before);
        for item in loaded {
            if !deduped.iter().any(|e| e.image_url == item.image_url) {
                deduped.push(item);
            }
        }
        deduped.truncate(inner.max_entries);

        let changed = deduped.len() != before;
        inner.entries = deduped;
        if changed {
            self.persist_locked(inner);
        }
    }

    /// Write-through persistence. Failures are logged; in-memory state
    /// remains authoritative for the rest of the session.
    fn persist_locked(&self, inner: &Inner) {
        if let Some(parent) = self.path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                eprintln!("[history] Failed to create directory {}: {e}", parent.display());
                return;
            }
        }
        match serde_json::to_string_pretty(&inner.entries) {
            Ok(content) => {
                if let Err(e) = std::fs::write(&self.path, content) {
                    eprintln!("[history] Failed to write history file: {e}");
                }
            }
            Err(e) => eprintln!("[history] Failed to serialize history: {e}"),
        }
    }

    fn notify(inner: &mut Inner, event: HistoryEvent) {
        inner.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}
