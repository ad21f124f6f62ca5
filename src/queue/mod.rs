//! In-memory priority queue store: thread-safe job storage, prioritized
//! dispatch, cancellation, and status queries.
//!
//! A single [`std::sync::Mutex`] protects the heap, the status-indexed map
//! and the duplicate side-table; a [`tokio::sync::Notify`] plays the role of
//! the condition variable, woken on every state change that could make
//! `get_next` productive. Lock sections never `.await`, so hold times stay
//! bounded by heap operations alone.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tracing::{debug, instrument, trace};

use crate::model::{
    BookInfo, BookView, CancelToken, DuplicateEntry, QueueBrief, QueueEntry, QueueStatus,
};

struct Inner {
    heap: BinaryHeap<Reverse<(i64, u64, String)>>,
    entries: HashMap<String, QueueEntry>,
    duplicates: HashMap<String, DuplicateEntry>,
    next_sequence: u64,
}

impl Inner {
    fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            entries: HashMap::new(),
            duplicates: HashMap::new(),
            next_sequence: 0,
        }
    }

    /// Drops stale heap entries and rebuilds it from the current priorities
    /// of all `QUEUED` entries. Relative FIFO order among equal priorities
    /// survives because `sequence` is untouched.
    fn rebuild_heap(&mut self) {
        self.heap.clear();
        for entry in self.entries.values() {
            if entry.status == QueueStatus::Queued {
                self.heap
                    .push(Reverse((entry.priority, entry.sequence, entry.book_info.id.clone())));
            }
        }
    }
}

/// Thread-safe storage of all known jobs, prioritized dispatch,
/// cancellation, and status query.
pub struct Queue {
    inner: Mutex<Inner>,
    notify: Notify,
}

impl Default for Queue {
    fn default() -> Self {
        Self::new()
    }
}

impl Queue {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::new()),
            notify: Notify::new(),
        }
    }

    /// Inserts a new entry with status `QUEUED`. If `book_id` already
    /// exists, behavior is unspecified — callers must run duplicate
    /// detection first.
    #[instrument(skip(self, book_info), fields(book_id = %book_info.id, priority))]
    pub fn add(&self, book_info: BookInfo, priority: i64) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let book_id = book_info.id.clone();
        let sequence = inner.next_sequence;
        inner.next_sequence += 1;
        let entry = QueueEntry {
            book_info,
            priority,
            sequence,
            status: QueueStatus::Queued,
            download_path: None,
            progress: None,
            cancel_token: CancelToken::new(),
            enqueued_at: Instant::now(),
        };
        inner.heap.push(Reverse((priority, sequence, book_id.clone())));
        inner.entries.insert(book_id, entry);
        drop(inner);
        self.notify.notify_one();
        trace!("queue entry added");
    }

    /// Pops the highest-priority `QUEUED` entry, transitioning it to
    /// `DOWNLOADING` and returning its cancellation token. Stale heap
    /// entries (superseded by a cancel or a priority rewrite) are discarded
    /// lazily.
    fn try_pop(&self) -> Option<(String, CancelToken)> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            let Reverse((_, _, book_id)) = inner.heap.pop()?;
            let Some(entry) = inner.entries.get_mut(&book_id) else {
                continue;
            };
            if entry.status != QueueStatus::Queued {
                continue;
            }
            if entry.cancel_token.is_cancelled() {
                entry.status = QueueStatus::Cancelled;
                continue;
            }
            entry.status = QueueStatus::Downloading;
            return Some((book_id, entry.cancel_token.clone()));
        }
    }

    /// Pops the next job, optionally blocking up to `timeout` for one to
    /// become available. `block = false` returns immediately.
    #[instrument(skip(self))]
    pub async fn get_next(
        &self,
        block: bool,
        timeout: Option<Duration>,
    ) -> Option<(String, CancelToken)> {
        let deadline = timeout.map(|d| tokio::time::Instant::now() + d);
        loop {
            if let Some(item) = self.try_pop() {
                debug!(book_id = %item.0, "dequeued");
                return Some(item);
            }
            if !block {
                return None;
            }
            let notified = self.notify.notified();
            match deadline {
                Some(dl) => {
                    let remaining = dl.saturating_duration_since(tokio::time::Instant::now());
                    if remaining.is_zero() {
                        return None;
                    }
                    if tokio::time::timeout(remaining, notified).await.is_err() {
                        return None;
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Blocks up to `timeout` on the same notification `get_next` uses,
    /// without attempting to pop anything itself.
    pub async fn wait_for_item(&self, timeout: Option<Duration>) {
        let notified = self.notify.notified();
        match timeout {
            Some(d) => {
                let _ = tokio::time::timeout(d, notified).await;
            }
            None => notified.await,
        }
    }

    pub fn update_status(&self, book_id: &str, new_status: QueueStatus) {
        if let Some(entry) = self
            .inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entries
            .get_mut(book_id)
        {
            entry.status = new_status;
        }
    }

    pub fn update_download_path(&self, book_id: &str, path: std::path::PathBuf) {
        if let Some(entry) = self
            .inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entries
            .get_mut(book_id)
        {
            entry.download_path = Some(path);
        }
    }

    pub fn update_progress(&self, book_id: &str, percent: f64) {
        if let Some(entry) = self
            .inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entries
            .get_mut(book_id)
        {
            entry.progress = Some(percent.clamp(0.0, 100.0));
        }
    }

    /// Signals the cancellation token and, if still `QUEUED`, marks the
    /// entry `CANCELLED` immediately; a `DOWNLOADING` entry is left as-is
    /// for the worker to observe and finish transitioning. Returns whether
    /// a matching entry existed.
    #[instrument(skip(self))]
    pub fn cancel_download(&self, book_id: &str) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let Some(entry) = inner.entries.get_mut(book_id) else {
            return false;
        };
        entry.cancel_token.cancel();
        if entry.status == QueueStatus::Queued {
            entry.status = QueueStatus::Cancelled;
        }
        drop(inner);
        self.notify.notify_one();
        true
    }

    /// Updates the priority of a single `QUEUED` entry and re-heapifies.
    /// Returns `false` (a no-op) if the entry is absent or not `QUEUED`.
    pub fn set_priority(&self, book_id: &str, new_priority: i64) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let Some(entry) = inner.entries.get_mut(book_id) else {
            return false;
        };
        if entry.status != QueueStatus::Queued {
            return false;
        }
        entry.priority = new_priority;
        inner.rebuild_heap();
        drop(inner);
        self.notify.notify_one();
        true
    }

    /// Bulk priority update. Entries not currently `QUEUED` are silently
    /// skipped — preserved as-is from the original behavior, not treated as
    /// an error. Returns `false` if no entry was actually reordered.
    pub fn reorder_queue(&self, priorities: &HashMap<String, i64>) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut changed = false;
        for (book_id, priority) in priorities {
            if let Some(entry) = inner.entries.get_mut(book_id) {
                if entry.status == QueueStatus::Queued {
                    entry.priority = *priority;
                    changed = true;
                }
            }
        }
        if changed {
            inner.rebuild_heap();
        }
        drop(inner);
        if changed {
            self.notify.notify_one();
        }
        changed
    }

    /// Status-indexed snapshot of every known job. Performs the
    /// `AVAILABLE → DONE` rewrite for entries whose `download_path` no
    /// longer exists on disk.
    #[instrument(skip(self))]
    pub fn get_status(&self) -> HashMap<QueueStatus, HashMap<String, BookView>> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        let missing: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, entry)| entry.status == QueueStatus::Available)
            .filter(|(_, entry)| {
                entry
                    .download_path
                    .as_ref()
                    .is_some_and(|path| !path.exists())
            })
            .map(|(id, _)| id.clone())
            .collect();

        for id in missing {
            if let Some(entry) = inner.entries.get_mut(&id) {
                entry.download_path = None;
                entry.status = QueueStatus::Done;
            }
        }

        let mut result: HashMap<QueueStatus, HashMap<String, BookView>> = QueueStatus::all()
            .into_iter()
            .map(|status| (status, HashMap::new()))
            .collect();

        for entry in inner.entries.values() {
            result
                .entry(entry.status)
                .or_default()
                .insert(entry.book_info.id.clone(), BookView::from(entry));
        }

        result
    }

    pub fn get_status_for(&self, book_id: &str) -> Option<QueueStatus> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entries
            .get(book_id)
            .map(|entry| entry.status)
    }

    pub fn get_book(&self, book_id: &str) -> Option<QueueEntry> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entries
            .get(book_id)
            .cloned()
    }

    pub fn get_active_downloads(&self) -> Vec<String> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entries
            .values()
            .filter(|entry| entry.status == QueueStatus::Downloading)
            .map(|entry| entry.book_info.id.clone())
            .collect()
    }

    pub fn get_queue_order(&self) -> Vec<QueueBrief> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut queued: Vec<&QueueEntry> = inner
            .entries
            .values()
            .filter(|entry| entry.status == QueueStatus::Queued)
            .collect();
        queued.sort_by_key(|entry| (entry.priority, entry.sequence));
        queued
            .into_iter()
            .map(|entry| QueueBrief {
                book_id: entry.book_info.id.clone(),
                priority: entry.priority,
                sequence: entry.sequence,
            })
            .collect()
    }

    /// Removes all entries in a terminal status, returning the count
    /// removed.
    #[instrument(skip(self))]
    pub fn clear_completed(&self) -> usize {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let terminal: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, entry)| entry.status.is_terminal())
            .map(|(id, _)| id.clone())
            .collect();
        for id in &terminal {
            inner.entries.remove(id);
        }
        let count = terminal.len();
        drop(inner);
        if count > 0 {
            self.notify.notify_one();
        }
        count
    }

    pub fn record_duplicate(&self, entry: DuplicateEntry) {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .duplicates
            .insert(entry.book_id.clone(), entry);
    }

    pub fn resolve_duplicate(&self, book_id: &str) -> Option<DuplicateEntry> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .duplicates
            .remove(book_id)
    }

    pub fn list_duplicates(&self) -> Vec<DuplicateEntry> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .duplicates
            .values()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(id: &str) -> BookInfo {
        BookInfo::new(id, id)
    }

    #[tokio::test]
    async fn dispatch_order_is_priority_then_sequence() {
        let queue = Queue::new();
        queue.add(info("c"), 2);
        queue.add(info("a"), 0);
        queue.add(info("b"), 0);

        let (first, _) = queue.get_next(false, None).await.unwrap();
        let (second, _) = queue.get_next(false, None).await.unwrap();
        let (third, _) = queue.get_next(false, None).await.unwrap();

        assert_eq!(first, "a");
        assert_eq!(second, "b");
        assert_eq!(third, "c");
    }

    #[tokio::test]
    async fn cancelled_before_dispatch_is_skipped() {
        let queue = Queue::new();
        queue.add(info("x"), 0);
        assert!(queue.cancel_download("x"));
        queue.add(info("y"), 1);

        let (next, _) = queue.get_next(false, None).await.unwrap();
        assert_eq!(next, "y");
        assert_eq!(queue.get_status_for("x"), Some(QueueStatus::Cancelled));
        assert!(queue.get_next(false, None).await.is_none());
    }

    #[tokio::test]
    async fn get_next_nonblocking_returns_none_when_empty() {
        let queue = Queue::new();
        assert!(queue.get_next(false, None).await.is_none());
    }

    #[tokio::test]
    async fn get_next_blocking_wakes_on_add() {
        let queue = std::sync::Arc::new(Queue::new());
        let waiter = queue.clone();
        let handle = tokio::spawn(async move {
            waiter
                .get_next(true, Some(Duration::from_secs(2)))
                .await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.add(info("late"), 0);

        let result = handle.await.unwrap();
        assert_eq!(result.unwrap().0, "late");
    }

    #[tokio::test]
    async fn blocking_get_next_times_out_when_nothing_arrives() {
        let queue = Queue::new();
        let result = queue.get_next(true, Some(Duration::from_millis(20))).await;
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn set_priority_reorders_and_keeps_fifo_ties() {
        let queue = Queue::new();
        queue.add(info("a"), 0);
        queue.add(info("b"), 0);
        assert!(queue.set_priority("b", -1));

        let (first, _) = queue.get_next(false, None).await.unwrap();
        assert_eq!(first, "b");
    }

    #[tokio::test]
    async fn set_priority_on_non_queued_entry_is_a_noop() {
        let queue = Queue::new();
        queue.add(info("a"), 0);
        queue.get_next(false, None).await; // now DOWNLOADING
        assert!(!queue.set_priority("a", 5));
    }

    #[tokio::test]
    async fn reorder_queue_silently_skips_non_queued_entries() {
        let queue = Queue::new();
        queue.add(info("a"), 0);
        queue.add(info("b"), 1);
        queue.get_next(false, None).await; // "a" becomes DOWNLOADING

        let mut priorities = HashMap::new();
        priorities.insert("a".to_string(), -10);
        priorities.insert("b".to_string(), -10);
        assert!(queue.reorder_queue(&priorities));

        let (next, _) = queue.get_next(false, None).await.unwrap();
        assert_eq!(next, "b");
    }

    #[tokio::test]
    async fn reorder_queue_returns_false_when_nothing_matches() {
        let queue = Queue::new();
        queue.add(info("a"), 0);
        queue.get_next(false, None).await; // "a" becomes DOWNLOADING

        let mut priorities = HashMap::new();
        priorities.insert("a".to_string(), -10); // not QUEUED, skipped
        priorities.insert("missing".to_string(), 0); // no such entry
        assert!(!queue.reorder_queue(&priorities));
    }

    #[tokio::test]
    async fn clear_completed_removes_only_terminal_entries() {
        let queue = Queue::new();
        queue.add(info("a"), 0);
        queue.add(info("b"), 1);
        queue.cancel_download("a");

        assert_eq!(queue.clear_completed(), 1);
        assert!(queue.get_status_for("a").is_none());
        assert_eq!(queue.get_status_for("b"), Some(QueueStatus::Queued));
    }

    #[test]
    fn duplicate_side_table_round_trips() {
        let queue = Queue::new();
        let dup = DuplicateEntry {
            book_id: "dup".to_string(),
            book_info: info("dup"),
            ingest_path: std::path::PathBuf::from("/tmp/dup.epub"),
            reason: crate::model::DuplicateReason::OnDisk,
            existing_path: None,
            status: None,
            priority: 0,
        };
        queue.record_duplicate(dup);
        assert_eq!(queue.list_duplicates().len(), 1);
        assert!(queue.resolve_duplicate("dup").is_some());
        assert!(queue.list_duplicates().is_empty());
    }
}
