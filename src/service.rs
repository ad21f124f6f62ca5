//! Facade composing the queue, ingest pipeline and book catalog into the
//! operations an HTTP/JSON API surface would call directly. The surface
//! itself (routing, auth, JSON encoding) is out of scope for this crate;
//! this module is the contract it would sit on top of.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{info, instrument, warn};

use crate::collaborators::BookManager;
use crate::ingest::{DuplicateGroup, DuplicateReviewStore, IngestError, IngestPipeline};
use crate::model::{BookInfo, BookView, DuplicateEntry, QueueStatus};
use crate::queue::Queue;

/// Composes the queue, ingest pipeline, book catalog and review store into
/// the set of operations named in the external-interfaces contract.
pub struct Service {
    queue: Arc<Queue>,
    ingest: Arc<IngestPipeline>,
    book_manager: Arc<dyn BookManager>,
    review_store: Arc<DuplicateReviewStore>,
}

impl Service {
    #[must_use]
    pub fn new(
        queue: Arc<Queue>,
        ingest: Arc<IngestPipeline>,
        book_manager: Arc<dyn BookManager>,
        review_store: Arc<DuplicateReviewStore>,
    ) -> Self {
        Self {
            queue,
            ingest,
            book_manager,
            review_store,
        }
    }

    pub async fn search(&self, query: &str, filters: &str) -> Vec<BookInfo> {
        self.book_manager.search(query, filters).await
    }

    pub async fn get_book_info(&self, book_id: &str) -> Option<BookInfo> {
        self.book_manager.get_info(book_id).await
    }

    /// Status-indexed snapshot of every known job, as `queue_status` in the
    /// original: a map keyed by status, each holding book views by id.
    #[must_use]
    pub fn queue_status(&self) -> HashMap<QueueStatus, HashMap<String, BookView>> {
        self.queue.get_status()
    }

    /// Reads the bytes of a downloaded book from its recorded path, along
    /// with the book info known about it. `None` bytes with `Some` info
    /// means the entry exists but the file is missing or unreadable.
    #[instrument(skip(self))]
    pub async fn get_book_data(&self, book_id: &str) -> (Option<Vec<u8>>, Option<BookInfo>) {
        let Some(entry) = self.queue.get_book(book_id) else {
            return (None, None);
        };
        let Some(path) = entry.download_path.clone() else {
            return (None, Some(entry.book_info));
        };
        match tokio::fs::read(&path).await {
            Ok(bytes) => (Some(bytes), Some(entry.book_info)),
            Err(err) => {
                warn!(book_id, path = %path.display(), error = %err, "failed reading book data");
                (None, Some(entry.book_info))
            }
        }
    }

    /// Enqueues `book_id` at `priority` unless a duplicate already exists,
    /// in which case the duplicate is recorded and returned instead.
    /// `force` skips detection and resolves any previously-recorded
    /// duplicate entry for this id before enqueueing.
    #[instrument(skip(self))]
    pub async fn queue_book(
        &self,
        book_id: &str,
        priority: i64,
        force: bool,
    ) -> (bool, Option<DuplicateEntry>) {
        let Some(book_info) = self.book_manager.get_info(book_id).await else {
            warn!(book_id, "catalog has no info for this id");
            return (false, None);
        };

        if force {
            self.queue.resolve_duplicate(book_id);
        } else if let Some(mut duplicate) = self.ingest.detect_duplicate(&book_info, &self.queue, priority) {
            duplicate.priority = priority;
            info!(book_id, reason = ?duplicate.reason, "duplicate detected, rejecting enqueue");
            self.queue.record_duplicate(duplicate.clone());
            return (false, Some(duplicate));
        }

        self.queue.add(book_info, priority);
        info!(book_id, priority, "queued");
        (true, None)
    }

    pub fn cancel_download(&self, book_id: &str) -> bool {
        self.queue.cancel_download(book_id)
    }

    pub fn set_book_priority(&self, book_id: &str, priority: i64) -> bool {
        self.queue.set_priority(book_id, priority)
    }

    pub fn reorder_queue(&self, priorities: &HashMap<String, i64>) -> bool {
        self.queue.reorder_queue(priorities)
    }

    #[must_use]
    pub fn get_queue_order(&self) -> Vec<crate::model::QueueBrief> {
        self.queue.get_queue_order()
    }

    #[must_use]
    pub fn get_active_downloads(&self) -> Vec<String> {
        self.queue.get_active_downloads()
    }

    pub fn clear_completed(&self) -> usize {
        self.queue.clear_completed()
    }

    #[must_use]
    pub fn list_duplicates(&self) -> Vec<DuplicateEntry> {
        self.queue.list_duplicates()
    }

    pub fn remove_duplicate(&self, book_id: &str) -> Option<DuplicateEntry> {
        self.queue.resolve_duplicate(book_id)
    }

    /// Attempts to queue a previously-rejected duplicate anyway, overriding
    /// detection. On failure the entry is restored to the duplicate
    /// side-table so it can be reviewed again later.
    #[instrument(skip(self))]
    pub async fn force_duplicate(
        &self,
        book_id: &str,
        priority: Option<i64>,
    ) -> (bool, Option<DuplicateEntry>, Option<String>) {
        let Some(entry) = self.queue.resolve_duplicate(book_id) else {
            return (false, None, Some("duplicate entry not found".to_string()));
        };

        let target_priority = priority.unwrap_or(entry.priority);
        let (success, duplicate) = self.queue_book(book_id, target_priority, true).await;
        if success {
            let mut resolved = entry;
            resolved.priority = target_priority;
            return (true, Some(resolved), None);
        }

        if let Some(duplicate) = duplicate {
            self.queue.record_duplicate(duplicate.clone());
            return (false, Some(duplicate), Some("failed to queue duplicate".to_string()));
        }

        let mut resolved = entry;
        resolved.priority = target_priority;
        self.queue.record_duplicate(resolved.clone());
        (false, Some(resolved), Some("failed to queue duplicate".to_string()))
    }

    pub async fn list_duplicate_groups(&self) -> std::io::Result<Vec<DuplicateGroup>> {
        self.ingest.list_duplicate_groups(&self.review_store).await
    }

    pub fn set_duplicate_reviewed(&self, group_id: &str, reviewed: bool) {
        self.review_store.set_reviewed(group_id, reviewed);
    }

    pub fn resolve_ingest_file(&self, rel: &str) -> Result<std::path::PathBuf, IngestError> {
        self.ingest.resolve_ingest_file(rel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::path::Path;
    use tempfile::TempDir;

    struct StubManager {
        books: HashMap<String, BookInfo>,
    }

    #[async_trait]
    impl BookManager for StubManager {
        async fn search(&self, _query: &str, _filters: &str) -> Vec<BookInfo> {
            self.books.values().cloned().collect()
        }

        async fn get_info(&self, id: &str) -> Option<BookInfo> {
            self.books.get(id).cloned()
        }

        async fn download(
            &self,
            _info: &BookInfo,
            _dest: &Path,
            _progress_cb: crate::collaborators::ProgressCallback,
            _cancel_token: &crate::model::CancelToken,
        ) -> bool {
            false
        }
    }

    fn service(dir: &TempDir) -> Service {
        let mut books = HashMap::new();
        books.insert("abc".to_string(), BookInfo::new("abc", "A Book").with_format("epub"));
        let queue = Arc::new(Queue::new());
        let ingest = Arc::new(IngestPipeline::new(dir.path().join("ingest"), false, None));
        let review_store = Arc::new(DuplicateReviewStore::new(dir.path().join("review.json")));
        let manager: Arc<dyn BookManager> = Arc::new(StubManager { books });
        Service::new(queue, ingest, manager, review_store)
    }

    #[tokio::test]
    async fn queue_book_enqueues_unknown_book() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir);
        let (ok, dup) = svc.queue_book("abc", 0, false).await;
        assert!(ok);
        assert!(dup.is_none());
        assert_eq!(svc.get_queue_order().len(), 1);
    }

    #[tokio::test]
    async fn queue_book_rejects_unknown_catalog_id() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir);
        let (ok, dup) = svc.queue_book("missing", 0, false).await;
        assert!(!ok);
        assert!(dup.is_none());
    }

    #[tokio::test]
    async fn queue_book_reports_duplicate_when_already_queued() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir);
        assert!(svc.queue_book("abc", 0, false).await.0);

        let (ok, dup) = svc.queue_book("abc", 1, false).await;
        assert!(!ok);
        let dup = dup.unwrap();
        assert_eq!(dup.reason, crate::model::DuplicateReason::Queued);
        assert_eq!(svc.list_duplicates().len(), 1);
    }

    #[tokio::test]
    async fn force_duplicate_requeues_a_recorded_entry() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir);
        assert!(svc.queue_book("abc", 0, false).await.0);
        svc.queue_book("abc", 1, false).await;
        assert_eq!(svc.list_duplicates().len(), 1);

        // cancel and clear the original so the forced requeue can succeed
        svc.cancel_download("abc");
        svc.clear_completed();

        let (ok, entry, error) = svc.force_duplicate("abc", Some(5)).await;
        assert!(ok, "force_duplicate failed: {error:?}");
        assert_eq!(entry.unwrap().priority, 5);
        assert!(svc.list_duplicates().is_empty());
    }

    #[tokio::test]
    async fn force_duplicate_reports_missing_entry() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir);
        let (ok, entry, error) = svc.force_duplicate("nope", None).await;
        assert!(!ok);
        assert!(entry.is_none());
        assert!(error.is_some());
    }

    #[tokio::test]
    async fn get_book_data_reads_the_published_file() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir);
        svc.queue_book("abc", 0, false).await;
        svc.cancel_download("abc"); // doesn't matter; we set the path directly below

        let path = dir.path().join("payload.bin");
        tokio::fs::write(&path, b"hello").await.unwrap();
        svc.queue.update_download_path("abc", path);

        let (bytes, info) = svc.get_book_data("abc").await;
        assert_eq!(bytes.unwrap(), b"hello");
        assert_eq!(info.unwrap().id, "abc");
    }
}
