//! Periodic store reconciliation.
//!
//! The relay is the fast path; this is the safety net. On a fixed
//! interval the poller fetches the authoritative record and hands it to
//! its session, which overwrites local state wherever the two differ.
//! The store always wins: the poll path exists to catch missed relay
//! messages, not to arbitrate concurrent edits. Title changes, which
//! never ride the relay, converge only through here.
//!
//! Fetch errors are logged and skipped; the next tick is the retry.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

use crate::storage::{DocumentStore, StoredDocument};

/// Interval between authoritative fetches.
pub const POLL_INTERVAL_MS: u64 = 2_000;

/// What a fetched record should replace in session-local state.
///
/// `None` fields match already; `Some` fields carry the store's value.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Reconciliation {
    pub title: Option<String>,
    pub content: Option<String>,
}

impl Reconciliation {
    pub fn is_noop(&self) -> bool {
        self.title.is_none() && self.content.is_none()
    }
}

/// Store-wins comparison of local state against a fetched record.
pub fn reconcile(
    local_title: &str,
    local_content: &str,
    fetched: &StoredDocument,
) -> Reconciliation {
    Reconciliation {
        title: (fetched.title != local_title).then(|| fetched.title.clone()),
        content: (fetched.content != local_content).then(|| fetched.content.clone()),
    }
}

/// Background task fetching one document on a fixed interval.
///
/// Owned by a session; stops when the shutdown signal fires or the
/// session drops its update receiver.
pub struct ReconciliationPoller {
    handle: JoinHandle<()>,
}

impl ReconciliationPoller {
    /// Spawn the polling task.
    ///
    /// The first fetch lands one full interval after spawn, matching the
    /// cadence of every later fetch.
    pub fn spawn(
        store: Arc<dyn DocumentStore>,
        doc_id: String,
        interval: Duration,
        updates: mpsc::Sender<StoredDocument>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Self {
        let handle = tokio::spawn(async move {
            let mut ticker = time::interval_at(time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match store.get(&doc_id) {
                            Ok(Some(doc)) => {
                                if updates.send(doc).await.is_err() {
                                    // Session gone
                                    break;
                                }
                            }
                            Ok(None) => {
                                log::debug!("poll: document {doc_id} missing from store");
                            }
                            Err(e) => {
                                log::debug!("poll for {doc_id} failed: {e}");
                            }
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        });

        Self { handle }
    }

    /// Whether the polling task has exited.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the polling task to exit.
    pub async fn stopped(self) {
        let _ = self.handle.await;
    }
}
