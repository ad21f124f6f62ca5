//! Trait boundaries for the collaborators this crate consumes but does not
//! implement: the upstream book catalog and the optional Cloudflare
//! bypasser. Kept as `async_trait` objects (rather than native async
//! traits) so the coordinator and fetch engine can hold them as
//! `Arc<dyn ...>` without knowing the concrete implementation.

use std::path::Path;

use async_trait::async_trait;

use crate::model::{BookInfo, CancelToken};

/// Callback invoked with a 0.0-100.0 percentage as a download progresses.
pub type ProgressCallback = std::sync::Arc<dyn Fn(f64) + Send + Sync>;

/// The upstream book-catalog provider. Only `download` is exercised by the
/// coordinator in this crate; `search`/`get_info` complete the contract for
/// callers sitting above the core (an HTTP/JSON API surface, a CLI, etc.).
#[async_trait]
pub trait BookManager: Send + Sync {
    async fn search(&self, query: &str, filters: &str) -> Vec<BookInfo>;
    async fn get_info(&self, id: &str) -> Option<BookInfo>;

    /// Downloads `info` to `dest`, reporting progress and honoring
    /// cancellation. Returns `true` on success.
    async fn download(
        &self,
        info: &BookInfo,
        dest: &Path,
        progress_cb: ProgressCallback,
        cancel_token: &CancelToken,
    ) -> bool;
}

/// Side-channel HTTP fetcher used when the origin returns 403 under a
/// challenge and `USE_CF_BYPASS` is enabled.
#[async_trait]
pub trait Bypasser: Send + Sync {
    async fn fetch_bypassed(&self, url: &str) -> Option<String>;
}
