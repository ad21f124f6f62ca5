//! HTTP fetch engine: page fetches and streaming downloads with
//! rate-limit-aware retry and 403→bypass escalation.

mod error;
mod retry;

pub use error::FetchError;
pub use retry::{RetryTuning, generic_retry_sleep, parse_retry_after, parse_size_to_bytes, rate_limit_wait};

use std::path::PathBuf;
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, error, info, instrument, warn};

use crate::collaborators::{Bypasser, ProgressCallback};
use crate::model::CancelToken;

/// Fixed chunk size the original streams in, enforced here by re-chunking
/// whatever sizes the transport actually delivers.
const DOWNLOAD_CHUNK_SIZE: usize = 64 * 1024;
const PROGRESS_MIN_INCREMENT: f64 = 1.0;
const PROGRESS_MIN_INTERVAL: Duration = Duration::from_millis(250);

/// Where a streamed download's bytes should land.
pub enum Destination {
    /// A filesystem path; parent directories are created if missing, and
    /// the file is deleted if the download does not succeed.
    Path(PathBuf),
    /// A caller-owned writable sink; never deleted on failure since the
    /// engine did not open it.
    Sink(Box<dyn AsyncWrite + Unpin + Send>),
}

/// GETs `url`, returning the response body or an empty string once
/// `retry_budget` is exhausted. Rate-limited responses (429/503) retry
/// without consuming the budget; a 403 escalates subsequent attempts to
/// `bypasser` (when provided) and consumes one unit of budget; a 404
/// returns immediately without retrying.
#[instrument(skip(client, bypasser, tuning), fields(retry_budget))]
pub async fn fetch_page(
    client: &reqwest::Client,
    url: &str,
    retry_budget: i64,
    use_bypass: bool,
    bypasser: Option<&dyn Bypasser>,
    tuning: &RetryTuning,
) -> String {
    let mut retries_remaining = retry_budget;
    let mut rate_limit_attempts: u32 = 0;
    let mut current_use_bypass = use_bypass;

    loop {
        if retries_remaining < 0 {
            return String::new();
        }

        if current_use_bypass {
            if let Some(bypasser) = bypasser {
                debug!(url, "fetching via bypass");
                match bypasser.fetch_bypassed(url).await {
                    Some(page) => {
                        debug!(url, "bypass succeeded");
                        return page;
                    }
                    None => {
                        warn!(url, "bypass attempt failed");
                        if retries_remaining == 0 {
                            return String::new();
                        }
                        tokio::time::sleep(generic_retry_sleep(tuning, retries_remaining)).await;
                        retries_remaining -= 1;
                        rate_limit_attempts = 0;
                        continue;
                    }
                }
            }
        }

        debug!(url, retries_remaining, "GET");
        let response = match client.get(url).send().await {
            Ok(response) => response,
            Err(err) => {
                warn!(url, error = %err, "request error");
                if retries_remaining == 0 {
                    error!(url, error = %err, "exhausted retries fetching page");
                    return String::new();
                }
                tokio::time::sleep(generic_retry_sleep(tuning, retries_remaining)).await;
                retries_remaining -= 1;
                rate_limit_attempts = 0;
                continue;
            }
        };

        let status = response.status().as_u16();
        let retry_after = header_value(&response, reqwest::header::RETRY_AFTER);

        if let Some((wait, header)) = rate_limit_wait(
            status,
            retry_after.as_deref(),
            rate_limit_attempts,
            tuning.default_sleep,
            tuning.rate_limit_max_sleep,
        ) {
            warn!(
                url,
                status,
                wait_secs = wait.as_secs_f64(),
                retry_after = ?header,
                "rate limited"
            );
            drop(response);
            rate_limit_attempts += 1;
            if !wait.is_zero() {
                tokio::time::sleep(wait).await;
            }
            continue;
        }

        rate_limit_attempts = 0;

        if status >= 400 {
            warn!(url, status, "error response");
            if retries_remaining == 0 {
                return String::new();
            }
            if status == 404 {
                return String::new();
            }
            if status == 403 {
                warn!(url, "403, escalating to bypass for subsequent attempts");
                current_use_bypass = true;
                rate_limit_attempts = 0;
                retries_remaining -= 1;
                continue;
            }
            tokio::time::sleep(generic_retry_sleep(tuning, retries_remaining)).await;
            retries_remaining -= 1;
            rate_limit_attempts = 0;
            continue;
        }

        let body = match response.text().await {
            Ok(body) => body,
            Err(err) => {
                warn!(url, error = %err, "failed reading response body");
                if retries_remaining == 0 {
                    return String::new();
                }
                tokio::time::sleep(generic_retry_sleep(tuning, retries_remaining)).await;
                retries_remaining -= 1;
                rate_limit_attempts = 0;
                continue;
            }
        };

        debug!(url, "success");
        tokio::time::sleep(Duration::from_secs(1)).await;
        return body;
    }
}

fn header_value(response: &reqwest::Response, name: reqwest::header::HeaderName) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

struct ProgressState {
    last_percent: f64,
    last_time: Instant,
    reported_completion: bool,
}

impl ProgressState {
    fn new() -> Self {
        Self {
            last_percent: -1.0,
            last_time: Instant::now(),
            reported_completion: false,
        }
    }

    fn maybe_report(&mut self, cb: &ProgressCallback, bytes_downloaded: u64, total: u64) {
        if total == 0 {
            return;
        }
        let percent = ((bytes_downloaded as f64 / total as f64) * 100.0).min(100.0);
        let now = Instant::now();
        if percent >= 100.0
            || percent - self.last_percent >= PROGRESS_MIN_INCREMENT
            || now.duration_since(self.last_time) >= PROGRESS_MIN_INTERVAL
        {
            safe_call(cb, percent);
            self.last_percent = percent;
            self.last_time = now;
            if percent >= 100.0 {
                self.reported_completion = true;
            }
        }
    }
}

/// Progress callbacks are user code; a panicking callback must not abort
/// the download, mirroring the original's `try/except` around the call.
fn safe_call(cb: &ProgressCallback, percent: f64) {
    if std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| cb(percent))).is_err() {
        warn!(percent, "progress callback panicked");
    }
}

/// Streams `url` into `destination`, honoring `cancel_token` and reporting
/// progress via `progress_cb`. Returns `true` on success; on any failure
/// (including cancellation) a path-based destination is deleted.
#[instrument(skip(client, progress_cb, cancel_token, tuning), fields(url))]
pub async fn download_stream(
    client: &reqwest::Client,
    url: &str,
    destination: Destination,
    size_hint: &str,
    progress_cb: Option<ProgressCallback>,
    cancel_token: &CancelToken,
    tuning: &RetryTuning,
) -> bool {
    match destination {
        Destination::Path(path) => {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    if let Err(err) = tokio::fs::create_dir_all(parent).await {
                        error!(path = %path.display(), error = %err, "failed to create parent directory");
                        return false;
                    }
                }
            }
            let file = match tokio::fs::File::create(&path).await {
                Ok(file) => file,
                Err(err) => {
                    error!(path = %path.display(), error = %err, "failed to open destination");
                    return false;
                }
            };
            let writer = tokio::io::BufWriter::new(file);
            let success =
                stream_body(client, url, writer, size_hint, progress_cb, cancel_token, tuning).await;
            if !success {
                let _ = tokio::fs::remove_file(&path).await;
            }
            success
        }
        Destination::Sink(sink) => {
            stream_body(client, url, sink, size_hint, progress_cb, cancel_token, tuning).await
        }
    }
}

async fn stream_body<W: AsyncWrite + Unpin>(
    client: &reqwest::Client,
    url: &str,
    mut writer: W,
    size_hint: &str,
    progress_cb: Option<ProgressCallback>,
    cancel_token: &CancelToken,
    tuning: &RetryTuning,
) -> bool {
    info!(url, "downloading");
    let mut rate_limit_attempts: u32 = 0;

    let response = loop {
        let response = match client.get(url).send().await {
            Ok(response) => response,
            Err(err) => {
                warn!(url, error = %err, "download request failed");
                return false;
            }
        };

        let status = response.status().as_u16();
        let retry_after = header_value(&response, reqwest::header::RETRY_AFTER);

        if let Some((wait, header)) = rate_limit_wait(
            status,
            retry_after.as_deref(),
            rate_limit_attempts,
            tuning.default_sleep,
            tuning.rate_limit_max_sleep,
        ) {
            warn!(url, status, wait_secs = wait.as_secs_f64(), retry_after = ?header, "rate limited");
            drop(response);
            rate_limit_attempts += 1;
            if !wait.is_zero() {
                tokio::time::sleep(wait).await;
            }
            continue;
        }

        rate_limit_attempts = 0;
        break response;
    };

    if response.status().as_u16() >= 400 {
        warn!(url, status = response.status().as_u16(), "download response error status");
        return false;
    }

    let total_size = parse_size_to_bytes(size_hint).or_else(|| response.content_length());
    let content_type = header_value(&response, reqwest::header::CONTENT_TYPE).unwrap_or_default();

    let mut progress = ProgressState::new();
    if let Some(cb) = &progress_cb {
        safe_call(cb, 0.0);
    }

    let mut stream = response.bytes_stream();
    let mut buffer: Vec<u8> = Vec::with_capacity(DOWNLOAD_CHUNK_SIZE * 2);
    let mut bytes_downloaded: u64 = 0;
    let mut cancelled = false;

    'outer: while let Some(chunk_result) = stream.next().await {
        let chunk = match chunk_result {
            Ok(chunk) => chunk,
            Err(err) => {
                warn!(url, error = %err, "stream read error");
                return false;
            }
        };
        if chunk.is_empty() {
            continue;
        }
        buffer.extend_from_slice(&chunk);

        while buffer.len() >= DOWNLOAD_CHUNK_SIZE {
            if cancel_token.is_cancelled() {
                cancelled = true;
                break 'outer;
            }
            let piece: Vec<u8> = buffer.drain(..DOWNLOAD_CHUNK_SIZE).collect();
            if let Err(err) = writer.write_all(&piece).await {
                error!(url, error = %err, "write error");
                return false;
            }
            bytes_downloaded += piece.len() as u64;
            if cancel_token.is_cancelled() {
                cancelled = true;
                break 'outer;
            }
            if let (Some(cb), Some(total)) = (&progress_cb, total_size) {
                progress.maybe_report(cb, bytes_downloaded, total);
            }
        }
    }

    if !cancelled && !buffer.is_empty() {
        if cancel_token.is_cancelled() {
            cancelled = true;
        } else {
            let remaining = std::mem::take(&mut buffer);
            if let Err(err) = writer.write_all(&remaining).await {
                error!(url, error = %err, "write error");
                return false;
            }
            bytes_downloaded += remaining.len() as u64;
            if cancel_token.is_cancelled() {
                cancelled = true;
            } else if let (Some(cb), Some(total)) = (&progress_cb, total_size) {
                progress.maybe_report(cb, bytes_downloaded, total);
            }
        }
    }

    if cancelled {
        info!(url, "download cancelled");
        return false;
    }

    if let Some(cb) = &progress_cb {
        if !progress.reported_completion {
            safe_call(cb, 100.0);
        }
    }

    if let Err(err) = writer.flush().await {
        warn!(url, error = %err, "flush failed");
    }

    if let Some(total) = total_size {
        if total > 0
            && (bytes_downloaded as f64) < (total as f64) * 0.9
            && content_type.starts_with("text/html")
        {
            warn!(url, "content mismatch: html body instead of binary");
            return false;
        }
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn tuning() -> RetryTuning {
        RetryTuning {
            max_retry: 3,
            default_sleep: Duration::from_millis(1),
            rate_limit_max_sleep: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn fetch_page_returns_body_on_success() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ok"))
            .respond_with(ResponseTemplate::new(200).set_body_string("hello"))
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let url = format!("{}/ok", server.uri());
        let body = fetch_page(&client, &url, 3, false, None, &tuning()).await;
        assert_eq!(body, "hello");
    }

    #[tokio::test]
    async fn fetch_page_returns_empty_on_404_without_retry() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/missing"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let url = format!("{}/missing", server.uri());
        let body = fetch_page(&client, &url, 3, false, None, &tuning()).await;
        assert_eq!(body, "");
    }

    #[tokio::test]
    async fn fetch_page_escalates_403_to_bypass() {
        struct StubBypasser {
            called: Arc<AtomicBool>,
        }

        #[async_trait::async_trait]
        impl Bypasser for StubBypasser {
            async fn fetch_bypassed(&self, _url: &str) -> Option<String> {
                self.called.store(true, Ordering::SeqCst);
                Some("page".to_string())
            }
        }

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(403))
            .expect(1)
            .mount(&server)
            .await;

        let called = Arc::new(AtomicBool::new(false));
        let bypasser = StubBypasser {
            called: called.clone(),
        };
        let client = reqwest::Client::new();
        let url = format!("{}/cf", server.uri());
        let body = fetch_page(&client, &url, 1, false, Some(&bypasser), &tuning()).await;
        assert_eq!(body, "page");
        assert!(called.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn download_stream_writes_body_to_path() {
        let server = MockServer::start().await;
        let body = vec![7u8; 200_000];
        Mock::given(method("GET"))
            .and(path("/file"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.bin");
        let client = reqwest::Client::new();
        let url = format!("{}/file", server.uri());
        let cancel = CancelToken::new();
        let ok = download_stream(
            &client,
            &url,
            Destination::Path(dest.clone()),
            "",
            None,
            &cancel,
            &tuning(),
        )
        .await;

        assert!(ok);
        assert_eq!(std::fs::read(&dest).unwrap(), body);
    }

    #[tokio::test]
    async fn download_stream_cancellation_removes_destination_file() {
        let server = MockServer::start().await;
        let body = vec![9u8; 200_000];
        Mock::given(method("GET"))
            .and(path("/file"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.bin");
        let client = reqwest::Client::new();
        let url = format!("{}/file", server.uri());
        let cancel = CancelToken::new();
        cancel.cancel();

        let ok = download_stream(
            &client,
            &url,
            Destination::Path(dest.clone()),
            "",
            None,
            &cancel,
            &tuning(),
        )
        .await;

        assert!(!ok);
        assert!(!dest.exists());
    }

    /// S3: a `429 Retry-After: 2` followed by a `200` sleeps exactly 2s for
    /// the rate-limit wait plus the 1s polite success-sleep, verified on a
    /// paused virtual clock rather than a real 3-second wait.
    #[tokio::test(start_paused = true)]
    async fn fetch_page_sleeps_exactly_retry_after_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "2"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let url = server.uri();
        let started = tokio::time::Instant::now();
        let body = fetch_page(&client, &url, 3, false, None, &tuning()).await;
        let elapsed = started.elapsed();

        assert_eq!(body, "ok");
        assert_eq!(elapsed, Duration::from_secs(3));
    }
}
