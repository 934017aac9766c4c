//! Per-host-document session tracking.
//!
//! Tracking is keyed by host document identity: each recognized host the
//! user accepted gets its own [`Session`] holding the latest host text, the
//! ordinal bindings to its region documents, and the pending debounce
//! timers. A reverse index maps each region document back to its owning
//! session and slot.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tower_lsp::lsp_types::Url;

/// Identifies which session and ordinal slot a region document belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionKey {
    /// The host document that owns the region.
    pub host: Url,
    /// 0-based position of the region's open marker at extraction time.
    /// Never recomputed as the host is edited.
    pub index: usize,
}

/// Mutable tracking state for one host document.
#[derive(Debug, Default)]
pub struct SessionState {
    /// Latest known full text of the host document.
    pub host_text: String,
    /// Latest known host document version from the client.
    pub version: i32,
    /// Ordinal index -> region document handle. `None` marks an orphaned
    /// slot whose region document was closed; slots are never renumbered.
    pub bindings: Vec<Option<Url>>,
    /// Last known full text of each region document, recorded when the
    /// region is materialized and on every region edit or push. Used to
    /// build replacement ranges and to skip pushes that would rewrite a
    /// region with its own content.
    region_texts: Vec<Option<String>>,
    /// Full host text of the most recent write this server made, used to
    /// recognize and ignore the echo of our own edit.
    pub last_self_write: Option<String>,
    /// At most one live debounce timer per region stream. Scheduling a new
    /// timer aborts and replaces the previous one for the same stream.
    pending: HashMap<usize, JoinHandle<()>>,
}

impl SessionState {
    /// The region document bound to `index`, if the slot exists and has not
    /// been orphaned.
    pub fn binding(&self, index: usize) -> Option<&Url> {
        self.bindings.get(index).and_then(|b| b.as_ref())
    }

    /// Record the region document handle for an ordinal slot.
    pub fn bind(&mut self, index: usize, region_uri: Url) {
        if let Some(slot) = self.bindings.get_mut(index) {
            *slot = Some(region_uri);
        }
    }

    /// Orphan a slot and cancel its pending timer. Other slots keep their
    /// indices.
    pub fn unbind(&mut self, index: usize) {
        if let Some(slot) = self.bindings.get_mut(index) {
            *slot = None;
        }
        if let Some(text) = self.region_texts.get_mut(index) {
            *text = None;
        }
        if let Some(timer) = self.pending.remove(&index) {
            timer.abort();
        }
    }

    /// Last known text of the region document at `index`.
    pub fn region_text(&self, index: usize) -> Option<&str> {
        self.region_texts.get(index).and_then(|t| t.as_deref())
    }

    /// Record the current text of the region document at `index`.
    pub fn set_region_text(&mut self, index: usize, text: String) {
        if let Some(slot) = self.region_texts.get_mut(index) {
            *slot = Some(text);
        }
    }

    /// Replace the pending timer for a region stream, aborting any previous
    /// one (latest write wins).
    pub fn replace_timer(&mut self, index: usize, handle: JoinHandle<()>) {
        if let Some(old) = self.pending.insert(index, handle) {
            old.abort();
        }
    }

    /// Drop a fired timer's own bookkeeping entry.
    pub fn clear_timer(&mut self, index: usize) {
        self.pending.remove(&index);
    }

    /// Cancel every pending timer. Used when the host document closes.
    pub fn cancel_all_timers(&mut self) {
        for (_, timer) in self.pending.drain() {
            timer.abort();
        }
    }
}

/// Tracking state for one host document and its region documents.
#[derive(Debug)]
pub struct Session {
    /// Stable identity of the host document.
    pub host_uri: Url,
    state: Mutex<SessionState>,
}

impl Session {
    /// Create a session with `region_count` unbound slots.
    pub fn new(host_uri: Url, host_text: String, version: i32, region_count: usize) -> Self {
        Self {
            host_uri,
            state: Mutex::new(SessionState {
                host_text,
                version,
                bindings: vec![None; region_count],
                region_texts: vec![None; region_count],
                last_self_write: None,
                pending: HashMap::new(),
            }),
        }
    }

    /// Lock the session state. All reads and writes of host text, bindings
    /// and timers go through this single lock, so a timer firing always sees
    /// the freshest host text.
    pub async fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().await
    }
}

/// Registry of active sessions, keyed by host document identity, plus the
/// reverse index from region document to owning session.
#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: DashMap<Url, Arc<Session>>,
    regions: DashMap<Url, RegionKey>,
}

impl SessionStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a new session. Replaces any prior session for the same host.
    pub fn insert(&self, session: Arc<Session>) {
        self.sessions
            .insert(session.host_uri.clone(), Arc::clone(&session));
    }

    /// Get the session for a host document.
    pub fn get(&self, host: &Url) -> Option<Arc<Session>> {
        self.sessions.get(host).map(|s| Arc::clone(&s))
    }

    /// Whether a host document is currently tracked.
    pub fn contains(&self, host: &Url) -> bool {
        self.sessions.contains_key(host)
    }

    /// Record the reverse mapping for a region document.
    pub fn index_region(&self, region_uri: Url, key: RegionKey) {
        self.regions.insert(region_uri, key);
    }

    /// Look up which session and slot a region document belongs to.
    pub fn region_key(&self, region_uri: &Url) -> Option<RegionKey> {
        self.regions.get(region_uri).map(|k| k.clone())
    }

    /// Stop tracking a host document: cancel its timers and drop the
    /// session and every reverse entry pointing at it.
    pub async fn close_host(&self, host: &Url) {
        let Some((_, session)) = self.sessions.remove(host) else {
            return;
        };
        let mut state = session.lock().await;
        state.cancel_all_timers();
        for region_uri in state.bindings.iter().flatten() {
            self.regions.remove(region_uri);
        }
        state.bindings.clear();
    }

    /// A region document closed: orphan its slot. The host session stays
    /// active and no other slot is renumbered.
    pub async fn close_region(&self, region_uri: &Url) -> Option<RegionKey> {
        let (_, key) = self.regions.remove(region_uri)?;
        if let Some(session) = self.get(&key.host) {
            session.lock().await.unbind(key.index);
        }
        Some(key)
    }
}
