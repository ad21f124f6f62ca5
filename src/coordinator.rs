//! Download coordinator: a single dispatch loop driving a bounded pool of
//! workers, each running one job through the fetch engine's collaborator
//! and the ingest pipeline.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::FutureExt;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

use crate::collaborators::{BookManager, ProgressCallback};
use crate::config::Config;
use crate::ingest::IngestPipeline;
use crate::model::{BookInfo, CancelToken, QueueStatus};
use crate::queue::Queue;

/// Dispatch-loop poll interval used both to avoid a spin loop when idle and
/// to bound how long shutdown takes to be observed.
const DISPATCH_POLL: Duration = Duration::from_millis(100);

struct CoordinatorInner {
    queue: Arc<Queue>,
    book_manager: Arc<dyn BookManager>,
    ingest: Arc<IngestPipeline>,
    tmp_dir: PathBuf,
    max_concurrent: usize,
}

/// Handle to a running coordinator. Dropping it without calling
/// [`shutdown`](CoordinatorHandle::shutdown) leaves the dispatch task
/// running detached.
pub struct CoordinatorHandle {
    stop: watch::Sender<bool>,
    dispatch_task: tokio::task::JoinHandle<()>,
}

impl CoordinatorHandle {
    /// Signals shutdown and waits for the dispatch loop and every in-flight
    /// worker to finish. In-flight downloads are not aborted; the worker
    /// pool drains naturally via cancellation plus bounded rate-limit waits.
    pub async fn shutdown(self) {
        let _ = self.stop.send(true);
        if let Err(err) = self.dispatch_task.await {
            warn!(error = %err, "coordinator dispatch task did not exit cleanly");
        }
    }
}

/// Spawns the dispatch loop as a background task and returns a handle to
/// stop it. The caller decides whether to call this at all (mirroring
/// `DISABLE_DOWNLOAD_COORDINATOR`) since Rust has no import-time side
/// effects to replicate that check for.
#[must_use]
pub fn spawn(
    queue: Arc<Queue>,
    book_manager: Arc<dyn BookManager>,
    ingest: Arc<IngestPipeline>,
    config: &Config,
) -> CoordinatorHandle {
    let inner = Arc::new(CoordinatorInner {
        queue,
        book_manager,
        ingest,
        tmp_dir: config.tmp_dir.clone(),
        max_concurrent: config.max_concurrent_downloads,
    });

    let (stop_tx, stop_rx) = watch::channel(false);
    let dispatch_task = tokio::spawn(run(inner, stop_rx));

    CoordinatorHandle {
        stop: stop_tx,
        dispatch_task,
    }
}

enum WorkerOutcome {
    Published(PathBuf),
    Cancelled,
    Failed,
}

async fn run(inner: Arc<CoordinatorInner>, mut stop_rx: watch::Receiver<bool>) {
    let mut workers: JoinSet<(String, CancelToken, WorkerOutcome)> = JoinSet::new();

    loop {
        if *stop_rx.borrow() {
            break;
        }

        while workers.len() < inner.max_concurrent {
            if *stop_rx.borrow() {
                break;
            }
            let block = workers.is_empty();
            let timeout = if block { Some(DISPATCH_POLL) } else { None };
            match inner.queue.get_next(block, timeout).await {
                Some((book_id, cancel_token)) => {
                    spawn_worker(&inner, &mut workers, book_id, cancel_token);
                }
                None => break,
            }
        }

        if *stop_rx.borrow() {
            break;
        }

        if workers.is_empty() {
            tokio::select! {
                _ = stop_rx.changed() => {},
                () = inner.queue.wait_for_item(Some(DISPATCH_POLL)) => {},
            }
        } else {
            tokio::select! {
                _ = stop_rx.changed() => {},
                joined = workers.join_next() => {
                    if let Some(result) = joined {
                        reap(result);
                    }
                }
                () = tokio::time::sleep(DISPATCH_POLL) => {},
            }
        }
    }

    info!("coordinator shutting down, draining in-flight workers");
    while let Some(result) = workers.join_next().await {
        reap(result);
    }
}

fn spawn_worker(
    inner: &Arc<CoordinatorInner>,
    workers: &mut JoinSet<(String, CancelToken, WorkerOutcome)>,
    book_id: String,
    cancel_token: CancelToken,
) {
    let inner = inner.clone();

    workers.spawn(async move {
        let outcome = std::panic::AssertUnwindSafe(process_single(&inner, &book_id, &cancel_token))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| {
                error!(book_id = %book_id, "worker panicked");
                if cancel_token.is_cancelled() {
                    WorkerOutcome::Cancelled
                } else {
                    WorkerOutcome::Failed
                }
            });
        (book_id, cancel_token, outcome)
    });
}

fn reap(result: Result<(String, CancelToken, WorkerOutcome), tokio::task::JoinError>) {
    match result {
        Ok((book_id, _cancel_token, outcome)) => match outcome {
            WorkerOutcome::Published(path) => {
                debug!(book_id, path = %path.display(), "job completed");
            }
            WorkerOutcome::Cancelled => {
                debug!(book_id, "job cancelled");
            }
            WorkerOutcome::Failed => {
                warn!(book_id, "job failed");
            }
        },
        Err(err) => {
            warn!(error = %err, "worker task join error");
        }
    }
}

#[instrument(skip(inner, cancel_token), fields(book_id))]
async fn process_single(inner: &Arc<CoordinatorInner>, book_id: &str, cancel_token: &CancelToken) -> WorkerOutcome {
    inner.queue.update_status(book_id, QueueStatus::Downloading);

    let Some(entry) = inner.queue.get_book(book_id) else {
        warn!(book_id, "job vanished from queue before it could be dispatched");
        return WorkerOutcome::Failed;
    };
    let book_info = entry.book_info;

    let published = download_with_cancellation(inner, book_id, &book_info, cancel_token).await;

    if cancel_token.is_cancelled() {
        inner.queue.update_status(book_id, QueueStatus::Cancelled);
        cleanup_staging(inner, &book_info);
        return WorkerOutcome::Cancelled;
    }

    match published {
        Some(path) => {
            inner.queue.update_download_path(book_id, path.clone());
            inner.queue.update_status(book_id, QueueStatus::Available);
            WorkerOutcome::Published(path)
        }
        None => {
            inner.queue.update_status(book_id, QueueStatus::Error);
            WorkerOutcome::Failed
        }
    }
}

async fn download_with_cancellation(
    inner: &Arc<CoordinatorInner>,
    book_id: &str,
    book_info: &BookInfo,
    cancel_token: &CancelToken,
) -> Option<PathBuf> {
    if cancel_token.is_cancelled() {
        return None;
    }

    let staging_path = staging_path(&inner.tmp_dir, book_info);

    let queue = inner.queue.clone();
    let progress_book_id = book_id.to_string();
    let progress_cb: ProgressCallback = Arc::new(move |percent| {
        queue.update_progress(&progress_book_id, percent);
    });

    let success = inner
        .book_manager
        .download(book_info, &staging_path, progress_cb, cancel_token)
        .await;

    if cancel_token.is_cancelled() || !success {
        let _ = std::fs::remove_file(&staging_path);
        return None;
    }

    match inner.ingest.publish(book_info, &staging_path, cancel_token).await {
        Ok(Some(path)) => Some(path),
        Ok(None) => None,
        Err(err) => {
            error!(book_id, error = %err, "ingest publish failed");
            let _ = std::fs::remove_file(&staging_path);
            None
        }
    }
}

fn cleanup_staging(inner: &Arc<CoordinatorInner>, book_info: &BookInfo) {
    let path = staging_path(&inner.tmp_dir, book_info);
    let _ = std::fs::remove_file(path);
}

fn staging_path(tmp_dir: &std::path::Path, book_info: &BookInfo) -> PathBuf {
    match &book_info.format {
        Some(format) if !format.is_empty() => tmp_dir.join(format!("{}.{}", book_info.id, format)),
        _ => tmp_dir.join(&book_info.id),
    }
}
