//! End-to-end integration test driving the queue, coordinator and ingest
//! pipeline together against a real HTTP server, matching scenario S1/S6
//! from the design notes: priority dispatch with fill-on-completion, and
//! atomic publish leaving no `.crdownload` file behind.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use downloader_core::{
    BookInfo, BookManager, CancelToken, Config, IngestPipeline, ProgressCallback, Queue,
    QueueStatus, RetryTuning, coordinator, download_stream, fetch::Destination,
};
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct HttpBookManager {
    client: reqwest::Client,
    tuning: RetryTuning,
}

#[async_trait]
impl BookManager for HttpBookManager {
    async fn search(&self, _query: &str, _filters: &str) -> Vec<BookInfo> {
        Vec::new()
    }

    async fn get_info(&self, _id: &str) -> Option<BookInfo> {
        None
    }

    async fn download(
        &self,
        info: &BookInfo,
        dest: &Path,
        progress_cb: ProgressCallback,
        cancel_token: &CancelToken,
    ) -> bool {
        let url = info.metadata.get("url").expect("test jobs carry a url");
        download_stream(
            &self.client,
            url,
            Destination::Path(dest.to_path_buf()),
            "",
            Some(progress_cb),
            cancel_token,
            &self.tuning,
        )
        .await
    }
}

fn test_config(tmp_dir: std::path::PathBuf, ingest_dir: std::path::PathBuf) -> Config {
    Config {
        ingest_dir,
        tmp_dir,
        max_concurrent_downloads: 2,
        max_retry: 3,
        default_sleep: Duration::from_millis(1),
        rate_limit_max_sleep: Duration::from_secs(1),
        use_book_title: false,
        use_cf_bypass: false,
        using_external_bypasser: false,
        disable_download_coordinator: false,
        http_proxy: None,
        https_proxy: None,
        custom_script: None,
    }
}

#[tokio::test]
async fn full_pipeline_publishes_atomically_with_no_leftover_intermediate() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/book.epub"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![42u8; 50_000]))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let tmp_dir = dir.path().join("tmp");
    let ingest_dir = dir.path().join("ingest");
    let config = test_config(tmp_dir, ingest_dir.clone());

    let queue = Arc::new(Queue::new());
    let ingest = Arc::new(IngestPipeline::new(ingest_dir.clone(), false, None));
    let manager: Arc<dyn BookManager> = Arc::new(HttpBookManager {
        client: reqwest::Client::new(),
        tuning: RetryTuning {
            max_retry: config.max_retry,
            default_sleep: config.default_sleep,
            rate_limit_max_sleep: config.rate_limit_max_sleep,
        },
    });

    let mut info = BookInfo::new("book-1", "Book One").with_format("epub");
    info.metadata
        .insert("url".to_string(), format!("{}/book.epub", server.uri()));
    queue.add(info, 0);

    let handle = coordinator::spawn(queue.clone(), manager, ingest, &config);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if queue.get_status_for("book-1") == Some(QueueStatus::Available) {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "download did not complete in time");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    handle.shutdown().await;

    let published = ingest_dir.join("book-1.epub");
    assert!(published.exists());
    assert!(!ingest_dir.join("book-1.crdownload").exists());
}

#[tokio::test]
async fn third_job_starts_only_after_a_slot_frees_up() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/slow.epub"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(150)).set_body_bytes(vec![1u8; 1000]))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path().join("tmp"), dir.path().join("ingest"));

    let queue = Arc::new(Queue::new());
    let ingest = Arc::new(IngestPipeline::new(dir.path().join("ingest"), false, None));
    let manager: Arc<dyn BookManager> = Arc::new(HttpBookManager {
        client: reqwest::Client::new(),
        tuning: RetryTuning {
            max_retry: config.max_retry,
            default_sleep: config.default_sleep,
            rate_limit_max_sleep: config.rate_limit_max_sleep,
        },
    });

    for (id, priority) in [("a", 0), ("b", 1), ("c", 2)] {
        let mut info = BookInfo::new(id, id).with_format("epub");
        info.metadata
            .insert("url".to_string(), format!("{}/slow.epub", server.uri()));
        queue.add(info, priority);
    }

    let handle = coordinator::spawn(queue.clone(), manager, ingest, &config);

    tokio::time::sleep(Duration::from_millis(40)).await;
    assert_eq!(queue.get_status_for("c"), Some(QueueStatus::Queued));

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while queue.get_status_for("c") != Some(QueueStatus::Available) {
        assert!(tokio::time::Instant::now() < deadline, "third job never started");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    handle.shutdown().await;
}
