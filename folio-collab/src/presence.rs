//! Active-user tracking for document sessions.
//!
//! Presence is signal-based, not connection-based: any observed activity
//! (a local edit, a received change) marks its user active, and a user
//! stays listed while their newest signal is younger than
//! [`ACTIVE_WINDOW_MS`]. There is no leave message; silence is the only
//! way out of the list.
//!
//! ## Architecture
//!
//! ```text
//! local edit ──────┐
//!                  ├──▶ PresenceTracker::mark_active(doc, user)
//! relayed change ──┘             │
//!                                ▼
//!              HashMap<doc_id, HashMap<user_id, last_seen_ms>>
//!                                │
//! session sweep tick ────────────┼──▶ active_users(doc) ─▶ sorted names
//!                                ▼
//!                stale entries purged (on query and on sweep)
//! ```
//!
//! Expired entries are removed, never just filtered out, so a document
//! that users drift away from costs nothing once the window passes.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::protocol::now_ms;

/// How long a user stays active after their last observed signal.
pub const ACTIVE_WINDOW_MS: u64 = 15_000;

/// How often sessions sweep stale presence entries.
pub const SWEEP_INTERVAL_MS: u64 = 5_000;

/// Per-document activity registry shared by every session in a process.
///
/// All methods take `&self`; the map sits behind a mutex and no lock is
/// held across an await point, so the tracker can be shared freely via
/// `Arc` between sessions and the relay server.
pub struct PresenceTracker {
    window_ms: u64,
    docs: Mutex<HashMap<String, HashMap<String, u64>>>,
}

impl PresenceTracker {
    /// Create a tracker with the standard activity window.
    pub fn new() -> Self {
        Self::with_window(ACTIVE_WINDOW_MS)
    }

    /// Create with a custom activity window (for testing).
    pub fn with_window(window_ms: u64) -> Self {
        Self {
            window_ms,
            docs: Mutex::new(HashMap::new()),
        }
    }

    fn docs(&self) -> MutexGuard<'_, HashMap<String, HashMap<String, u64>>> {
        // The map stays consistent across panics; recover from poisoning.
        self.docs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ───────────────────────────────────────────────────────────────
    // Marking
    // ───────────────────────────────────────────────────────────────

    /// Record activity for `user_id` in `doc_id` at the current wall clock.
    pub fn mark_active(&self, doc_id: &str, user_id: &str) {
        self.mark_active_at(doc_id, user_id, now_ms());
    }

    /// Record activity at an explicit timestamp.
    ///
    /// The stored timestamp only moves forward: marking with an older
    /// timestamp than the one on record is a no-op, so out-of-order
    /// signals can never shorten a user's remaining window.
    pub fn mark_active_at(&self, doc_id: &str, user_id: &str, at_ms: u64) {
        let mut docs = self.docs();
        let users = docs.entry(doc_id.to_string()).or_default();
        let seen = users.entry(user_id.to_string()).or_insert(at_ms);
        if at_ms > *seen {
            *seen = at_ms;
        }
    }

    // ───────────────────────────────────────────────────────────────
    // Querying
    // ───────────────────────────────────────────────────────────────

    /// Users with a signal younger than the window, sorted by name.
    ///
    /// Stale entries encountered along the way are purged.
    pub fn active_users(&self, doc_id: &str) -> Vec<String> {
        self.active_users_at(doc_id, now_ms())
    }

    /// Active users evaluated against an explicit "now".
    pub fn active_users_at(&self, doc_id: &str, now_ms: u64) -> Vec<String> {
        let mut docs = self.docs();
        let Some(users) = docs.get_mut(doc_id) else {
            return Vec::new();
        };

        users.retain(|_, seen| now_ms.saturating_sub(*seen) < self.window_ms);
        let mut names: Vec<String> = users.keys().cloned().collect();
        if users.is_empty() {
            docs.remove(doc_id);
        }
        names.sort();
        names
    }

    /// Last recorded signal for one user, if any entry survives.
    pub fn last_seen(&self, doc_id: &str, user_id: &str) -> Option<u64> {
        self.docs().get(doc_id).and_then(|users| users.get(user_id).copied())
    }

    // ───────────────────────────────────────────────────────────────
    // Sweeping
    // ───────────────────────────────────────────────────────────────

    /// Drop entries older than the window; returns how many were purged.
    ///
    /// Sessions run this on a [`SWEEP_INTERVAL_MS`] tick so that a doc
    /// nobody queries anymore still releases its memory.
    pub fn sweep(&self, doc_id: &str) -> usize {
        self.sweep_at(doc_id, now_ms())
    }

    /// Sweep evaluated against an explicit "now".
    pub fn sweep_at(&self, doc_id: &str, now_ms: u64) -> usize {
        let mut docs = self.docs();
        let Some(users) = docs.get_mut(doc_id) else {
            return 0;
        };

        let before = users.len();
        users.retain(|_, seen| now_ms.saturating_sub(*seen) < self.window_ms);
        let purged = before - users.len();
        if users.is_empty() {
            docs.remove(doc_id);
        }
        purged
    }

    /// Raw entry count for one document, stale entries included.
    pub fn tracked_users(&self, doc_id: &str) -> usize {
        self.docs().get(doc_id).map_or(0, HashMap::len)
    }

    /// Number of documents holding at least one entry.
    pub fn tracked_docs(&self) -> usize {
        self.docs().len()
    }
}

impl Default for PresenceTracker {
    fn default() -> Self {
        Self::new()
    }
}

// ===================================================================
// Tests
// ===================================================================
