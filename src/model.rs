//! Value types shared by every subsystem: book descriptors, queue status,
//! queue entries and duplicate-detection snapshots.

use std::collections::HashMap;
use std::time::Instant;

use serde::{Deserialize, Serialize};

/// Immutable descriptor of a book as seen by the queue and ingest pipeline.
///
/// Two `BookInfo`s are equal iff their `id` matches, regardless of the other
/// fields — callers may refresh `title`/`format`/`metadata` without that
/// counting as a different book.
#[derive(Debug, Clone)]
pub struct BookInfo {
    /// Stable identifier used as the queue key.
    pub id: String,
    /// Human-readable title, used for filename derivation when enabled.
    pub title: String,
    /// Lowercase file extension without the dot, e.g. `"epub"`.
    pub format: Option<String>,
    /// Opaque metadata passed through to consumers untouched.
    pub metadata: HashMap<String, String>,
}

impl BookInfo {
    #[must_use]
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            format: None,
            metadata: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_format(mut self, format: impl Into<String>) -> Self {
        self.format = Some(format.into());
        self
    }
}

impl PartialEq for BookInfo {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for BookInfo {}

/// Closed set of states a queue entry can occupy.
///
/// `AVAILABLE`, `DONE`, `ERROR` and `CANCELLED` are terminal: once an entry
/// reaches one of these it is never mutated again except for the
/// `AVAILABLE → DONE` garbage-sweep rewrite performed by `get_status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    Queued,
    Downloading,
    Available,
    Done,
    Error,
    Cancelled,
}

impl QueueStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Available | Self::Done | Self::Error | Self::Cancelled
        )
    }

    /// All status values, used to build a fully-populated status index.
    #[must_use]
    pub fn all() -> [Self; 6] {
        [
            Self::Queued,
            Self::Downloading,
            Self::Available,
            Self::Done,
            Self::Error,
            Self::Cancelled,
        ]
    }
}

/// Why an enqueue was rejected as a duplicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DuplicateReason {
    /// A non-terminal entry for this `book_id` already exists in the queue.
    Queued,
    /// The final artifact already exists in the ingest directory.
    OnDisk,
    /// An intermediate (`.crdownload`) artifact for this id already exists.
    Downloading,
}

/// Snapshot of a rejected enqueue, returned to the caller and retained in
/// the queue store's duplicate side-table until resolved.
#[derive(Debug, Clone)]
pub struct DuplicateEntry {
    pub book_id: String,
    pub book_info: BookInfo,
    pub ingest_path: std::path::PathBuf,
    pub reason: DuplicateReason,
    pub existing_path: Option<std::path::PathBuf>,
    pub status: Option<QueueStatus>,
    /// Priority the caller wanted; replayed if the entry is later forced.
    pub priority: i64,
}

/// A one-way, idempotent cancellation signal.
///
/// Cloning shares the underlying flag: every clone observes the same
/// signalled state. Signalling more than once is a no-op.
#[derive(Debug, Clone)]
pub struct CancelToken {
    inner: std::sync::Arc<std::sync::atomic::AtomicBool>,
}

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false)),
        }
    }

    pub fn cancel(&self) {
        self.inner.store(true, std::sync::atomic::Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.load(std::sync::atomic::Ordering::SeqCst)
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// An entry living in the priority queue store.
///
/// Mutated only through `Queue`'s public operations; never constructed
/// directly by callers outside the `queue` module.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub book_info: BookInfo,
    pub priority: i64,
    pub sequence: u64,
    pub status: QueueStatus,
    pub download_path: Option<std::path::PathBuf>,
    pub progress: Option<f64>,
    pub cancel_token: CancelToken,
    pub enqueued_at: Instant,
}

impl QueueEntry {
    #[must_use]
    pub fn book_id(&self) -> &str {
        &self.book_info.id
    }
}

/// JSON-friendly view of a queue entry, as returned by `get_status`.
#[derive(Debug, Clone, Serialize)]
pub struct BookView {
    pub id: String,
    pub title: String,
    pub format: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
    pub priority: i64,
}

impl From<&QueueEntry> for BookView {
    fn from(entry: &QueueEntry) -> Self {
        Self {
            id: entry.book_info.id.clone(),
            title: entry.book_info.title.clone(),
            format: entry.book_info.format.clone(),
            download_path: entry
                .download_path
                .as_ref()
                .map(|p| p.to_string_lossy().into_owned()),
            progress: entry.progress,
            priority: entry.priority,
        }
    }
}

/// A queued book's identity and ordering key, without the full entry.
#[derive(Debug, Clone, Serialize)]
pub struct QueueBrief {
    pub book_id: String,
    pub priority: i64,
    pub sequence: u64,
}
