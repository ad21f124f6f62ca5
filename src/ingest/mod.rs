//! Publishes completed downloads into the shared ingest directory and
//! detects duplicates against both queue state and what is already on disk.

mod error;
pub mod review_store;

pub use error::{IngestError, ReviewStoreError};
pub use review_store::DuplicateReviewStore;

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;
use tracing::{debug, info, instrument, warn};

use crate::model::{BookInfo, CancelToken, DuplicateEntry, DuplicateReason};
use crate::queue::Queue;

const HASH_READ_CHUNK: usize = 1024 * 1024;

/// Publishes completed downloads from a staging directory into the shared
/// ingest directory, and answers duplicate queries against it.
pub struct IngestPipeline {
    ingest_dir: PathBuf,
    use_book_title: bool,
    custom_script: Option<PathBuf>,
}

impl IngestPipeline {
    #[must_use]
    pub fn new(ingest_dir: PathBuf, use_book_title: bool, custom_script: Option<PathBuf>) -> Self {
        Self {
            ingest_dir,
            use_book_title,
            custom_script,
        }
    }

    /// Derives the published filename for `book_info`: `{book_id}.{format}`,
    /// or, under `USE_BOOK_TITLE`, a sanitized-title-plus-id-hash form.
    #[must_use]
    pub fn derive_filename(&self, book_info: &BookInfo) -> String {
        derive_filename(&book_info.id, &book_info.title, book_info.format.as_deref(), self.use_book_title)
    }

    #[must_use]
    pub fn final_path(&self, book_info: &BookInfo) -> PathBuf {
        self.ingest_dir.join(self.derive_filename(book_info))
    }

    #[must_use]
    pub fn intermediate_path(&self, book_id: &str) -> PathBuf {
        self.ingest_dir.join(format!("{book_id}.crdownload"))
    }

    /// Moves `staging_path` into the ingest directory under its final name,
    /// running the configured post-download hook in between. Returns
    /// `Ok(None)` if cancellation was observed before the rename; the
    /// intermediate file is cleaned up in that case.
    #[instrument(skip(self, cancel_token), fields(book_id = %book_info.id))]
    pub async fn publish(
        &self,
        book_info: &BookInfo,
        staging_path: &Path,
        cancel_token: &CancelToken,
    ) -> Result<Option<PathBuf>, IngestError> {
        let final_path = self.final_path(book_info);
        let intermediate_path = self.intermediate_path(&book_info.id);

        tokio::fs::create_dir_all(&self.ingest_dir)
            .await
            .map_err(|e| IngestError::create_dir(self.ingest_dir.clone(), e))?;

        if !tokio::fs::try_exists(staging_path).await.unwrap_or(false) {
            return Err(IngestError::StagingMissing {
                path: staging_path.to_path_buf(),
            });
        }

        self.stage_to_intermediate(staging_path, &intermediate_path).await?;

        if cancel_token.is_cancelled() {
            debug!("cancelled before publish, removing intermediate");
            let _ = tokio::fs::remove_file(&intermediate_path).await;
            return Ok(None);
        }

        if let Some(script) = &self.custom_script {
            self.run_custom_script(script, &intermediate_path).await;
        }

        tokio::fs::rename(&intermediate_path, &final_path)
            .await
            .map_err(|e| IngestError::rename(intermediate_path.clone(), final_path.clone(), e))?;

        info!(path = %final_path.display(), "published");
        Ok(Some(final_path))
    }

    async fn stage_to_intermediate(&self, staging: &Path, intermediate: &Path) -> Result<(), IngestError> {
        match tokio::fs::rename(staging, intermediate).await {
            Ok(()) => return Ok(()),
            Err(err) => {
                warn!(error = %err, "move to intermediate failed, falling back to copy");
            }
        }

        let _ = tokio::fs::remove_file(intermediate).await;
        match tokio::fs::copy(staging, intermediate).await {
            Ok(_) => {
                let _ = tokio::fs::remove_file(staging).await;
                return Ok(());
            }
            Err(err) => {
                warn!(error = %err, "copy-with-permissions failed, retrying without permissions");
            }
        }

        let _ = tokio::fs::remove_file(intermediate).await;
        let mut src = tokio::fs::File::open(staging)
            .await
            .map_err(|e| IngestError::move_failed(staging.to_path_buf(), intermediate.to_path_buf(), e))?;
        let mut dst = tokio::fs::File::create(intermediate)
            .await
            .map_err(|e| IngestError::move_failed(staging.to_path_buf(), intermediate.to_path_buf(), e))?;
        tokio::io::copy(&mut src, &mut dst)
            .await
            .map_err(|e| IngestError::move_failed(staging.to_path_buf(), intermediate.to_path_buf(), e))?;
        drop(src);
        drop(dst);
        let _ = tokio::fs::remove_file(staging).await;
        Ok(())
    }

    /// Runs the configured hook synchronously, exactly as the original does:
    /// no timeout, no cancellation awareness. This is a known hang vector.
    /// Called with the intermediate path, since by this point in the
    /// pipeline the staging file has already been moved or copied there.
    async fn run_custom_script(&self, script: &Path, file_path: &Path) {
        let script = script.to_path_buf();
        let file_path = file_path.to_path_buf();
        let result = tokio::task::spawn_blocking(move || {
            std::process::Command::new(&script).arg(&file_path).output()
        })
        .await;

        match result {
            Ok(Ok(output)) => {
                info!(
                    status = ?output.status.code(),
                    stdout = %String::from_utf8_lossy(&output.stdout),
                    stderr = %String::from_utf8_lossy(&output.stderr),
                    "custom script finished"
                );
            }
            Ok(Err(err)) => {
                warn!(error = %err, "custom script failed to launch");
            }
            Err(err) => {
                warn!(error = %err, "custom script task panicked");
            }
        }
    }

    /// Checks whether `book_info` already has an entry in the queue or on
    /// disk, returning the reason and existing path if so.
    #[must_use]
    pub fn detect_duplicate(
        &self,
        book_info: &BookInfo,
        queue: &Queue,
        priority: i64,
    ) -> Option<DuplicateEntry> {
        if let Some(status) = queue.get_status_for(&book_info.id) {
            if !status.is_terminal() {
                let existing_path = queue
                    .get_book(&book_info.id)
                    .and_then(|entry| entry.download_path.clone());
                return Some(DuplicateEntry {
                    book_id: book_info.id.clone(),
                    book_info: book_info.clone(),
                    ingest_path: self.final_path(book_info),
                    reason: DuplicateReason::Queued,
                    existing_path,
                    status: Some(status),
                    priority,
                });
            }
        }

        let final_path = self.final_path(book_info);
        if final_path.exists() {
            return Some(DuplicateEntry {
                book_id: book_info.id.clone(),
                book_info: book_info.clone(),
                ingest_path: final_path.clone(),
                reason: DuplicateReason::OnDisk,
                existing_path: Some(final_path),
                status: None,
                priority,
            });
        }

        let intermediate_path = self.intermediate_path(&book_info.id);
        if intermediate_path.exists() {
            return Some(DuplicateEntry {
                book_id: book_info.id.clone(),
                book_info: book_info.clone(),
                ingest_path: final_path,
                reason: DuplicateReason::Downloading,
                existing_path: Some(intermediate_path),
                status: None,
                priority,
            });
        }

        None
    }

    /// Groups files in the ingest directory that share a sanitized stem or
    /// a content hash, attaching persisted review state for each group.
    #[instrument(skip(self, review_store))]
    pub async fn list_duplicate_groups(
        &self,
        review_store: &DuplicateReviewStore,
    ) -> std::io::Result<Vec<DuplicateGroup>> {
        let mut entries = tokio::fs::read_dir(&self.ingest_dir).await?;
        let mut by_stem: std::collections::BTreeMap<String, Vec<PathBuf>> = Default::default();
        let mut by_hash: std::collections::BTreeMap<String, Vec<PathBuf>> = Default::default();

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let metadata = entry.metadata().await?;
            if !metadata.is_file() {
                continue;
            }

            let stem = sanitized_stem(&path);
            by_stem.entry(stem).or_default().push(path.clone());

            let hash = hash_file(&path).await?;
            by_hash.entry(hash).or_default().push(path);
        }

        let reviews = review_store.load();
        let mut groups = Vec::new();

        for (stem, members) in by_stem {
            if members.len() < 2 {
                continue;
            }
            let id = format!("stem:{stem}");
            groups.push(build_group(id, DuplicateGroupKind::Stem, stem, members, &reviews));
        }

        for (hash, members) in by_hash {
            if members.len() < 2 {
                continue;
            }
            let id = format!("hash:{hash}");
            groups.push(build_group(id, DuplicateGroupKind::Hash, hash, members, &reviews));
        }

        groups.sort_by(|a, b| (a.kind, &a.key).cmp(&(b.kind, &b.key)));
        Ok(groups)
    }

    /// Resolves `rel` against the ingest root, rejecting paths that escape
    /// it, don't exist, or aren't regular files.
    pub fn resolve_ingest_file(&self, rel: &str) -> Result<PathBuf, IngestError> {
        if rel.trim().is_empty() {
            return Err(IngestError::NotRegularFile {
                path: PathBuf::from(rel),
            });
        }

        let root = self
            .ingest_dir
            .canonicalize()
            .map_err(|_| IngestError::PathEscape {
                path: self.ingest_dir.clone(),
            })?;
        let candidate = root.join(rel);
        let resolved = candidate.canonicalize().map_err(|_| IngestError::PathEscape {
            path: candidate.clone(),
        })?;

        if !resolved.starts_with(&root) {
            return Err(IngestError::PathEscape { path: resolved });
        }

        if !resolved.is_file() {
            return Err(IngestError::NotRegularFile { path: resolved });
        }

        Ok(resolved)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DuplicateGroupKind {
    Hash,
    Stem,
}

#[derive(Debug, Clone)]
pub struct DuplicateGroup {
    pub id: String,
    pub kind: DuplicateGroupKind,
    pub key: String,
    pub members: Vec<PathBuf>,
    pub reviewed: bool,
    pub reviewed_at: Option<String>,
}

fn build_group(
    id: String,
    kind: DuplicateGroupKind,
    key: String,
    members: Vec<PathBuf>,
    reviews: &std::collections::BTreeMap<String, review_store::ReviewEntry>,
) -> DuplicateGroup {
    let review = reviews.get(&id);
    DuplicateGroup {
        id,
        kind,
        key,
        members,
        reviewed: review.map(|r| r.reviewed).unwrap_or(false),
        reviewed_at: review.map(|r| r.timestamp.clone()),
    }
}

async fn hash_file(path: &Path) -> std::io::Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_READ_CHUNK];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

fn sanitized_stem(path: &Path) -> String {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    sanitize_filename_component(&stem).to_ascii_lowercase()
}

/// Keeps alphanumerics and ` . _`, discarding everything else, then
/// right-strips whitespace. Returns `"book"` if the result is empty.
fn sanitize_filename_component(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, ' ' | '.' | '_'))
        .collect();
    let trimmed = cleaned.trim_end().to_string();
    if trimmed.is_empty() {
        "book".to_string()
    } else {
        trimmed
    }
}

fn derive_filename(book_id: &str, title: &str, format: Option<&str>, use_book_title: bool) -> String {
    let stem = if use_book_title {
        let sanitized = sanitize_filename_component(title);
        let digest = format!("{:x}", md5::compute(book_id.as_bytes()));
        format!("{sanitized}-{}", &digest[..8])
    } else {
        book_id.to_string()
    };

    match format {
        Some(format) if !format.is_empty() => format!("{stem}.{format}"),
        _ => stem,
    }
}
