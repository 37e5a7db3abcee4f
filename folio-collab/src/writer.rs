//! Debounced document persistence.
//!
//! Edits arrive keystroke-fast; the store should not. `schedule` opens
//! (or re-opens) a debounce window, and when the window finally elapses
//! exactly one `put` goes out, carrying the values of the most recent
//! call. Intermediate values are coalesced away, never queued.
//!
//! One writer task per session means writes for a document are serialized
//! end to end: a put in flight always completes before the next window
//! can fire. A failed put surfaces as [`SaveStatus::Failed`] and is not
//! retried on its own; the next edit's write is the retry.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time;

use crate::protocol::now_ms;
use crate::storage::DocumentStore;

/// Debounce window between the last edit and its write.
pub const DEBOUNCE_WINDOW_MS: u64 = 1_000;

/// Schedule queue depth; a burst beyond this drops the newest revision.
const SCHEDULE_QUEUE_DEPTH: usize = 64;

/// Persistence outcome reported back to the session.
#[derive(Debug, Clone, PartialEq)]
pub enum SaveStatus {
    /// A write is being issued.
    Saving,
    /// The write landed, milliseconds since epoch.
    Saved { at: u64 },
    /// The write failed; content stays local until something retries.
    Failed { error: String },
}

struct PendingWrite {
    title: String,
    content: String,
}

/// Handle to one document's write-behind task.
///
/// Dropping the handle (or calling [`shutdown`](Self::shutdown)) stops
/// the task; a write still inside its debounce window is cancelled, not
/// flushed.
pub struct PersistenceWriter {
    tx: mpsc::Sender<PendingWrite>,
    handle: JoinHandle<()>,
}

impl PersistenceWriter {
    /// Spawn the write-behind task for one document.
    ///
    /// `status` receives a `Saving`/`Saved`/`Failed` trail for every
    /// write that actually fires.
    pub fn spawn(
        store: Arc<dyn DocumentStore>,
        doc_id: String,
        window: Duration,
        status: mpsc::Sender<SaveStatus>,
    ) -> Self {
        let (tx, mut rx) = mpsc::channel::<PendingWrite>(SCHEDULE_QUEUE_DEPTH);

        let handle = tokio::spawn(async move {
            let mut pending: Option<PendingWrite> = None;
            let sleep = time::sleep(window);
            tokio::pin!(sleep);

            loop {
                tokio::select! {
                    scheduled = rx.recv() => match scheduled {
                        Some(write) => {
                            // Latest value wins; the window restarts
                            pending = Some(write);
                            sleep.as_mut().reset(time::Instant::now() + window);
                        }
                        // Sender dropped: session closed. Pending write
                        // is cancelled.
                        None => break,
                    },
                    _ = &mut sleep, if pending.is_some() => {
                        let Some(write) = pending.take() else { continue };

                        let _ = status.send(SaveStatus::Saving).await;
                        match store.put(&doc_id, &write.title, &write.content) {
                            Ok(()) => {
                                let _ = status.send(SaveStatus::Saved { at: now_ms() }).await;
                            }
                            Err(e) => {
                                log::warn!("save for {doc_id} failed: {e}");
                                let _ = status
                                    .send(SaveStatus::Failed { error: e.to_string() })
                                    .await;
                            }
                        }
                    }
                }
            }
        });

        Self { tx, handle }
    }

    /// Schedule a write with the current title and content.
    ///
    /// Replaces any write still waiting out its window. A burst that
    /// overfills the queue drops this revision; the next edit schedules
    /// a fresh one.
    pub fn schedule(&self, title: impl Into<String>, content: impl Into<String>) {
        let write = PendingWrite {
            title: title.into(),
            content: content.into(),
        };
        match self.tx.try_send(write) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                log::warn!("write queue full; revision dropped until the next edit");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                log::debug!("write scheduled against a stopped writer; dropped");
            }
        }
    }

    /// Stop the task and wait for it to exit.
    ///
    /// A write inside its debounce window is dropped; one already being
    /// issued completes first.
    pub async fn shutdown(self) {
        let Self { tx, handle } = self;
        drop(tx);
        let _ = handle.await;
    }
}
