//! CLI shim for the downloader core: reads a batch of book-download jobs,
//! enqueues the ones that aren't duplicates, runs the coordinator until the
//! batch drains (or `--wait-secs` elapses), and prints a summary.
//!
//! This binary supplies the one concrete [`BookManager`] implementation the
//! core itself intentionally has no opinion about: it treats each job's
//! `url` as a direct link and streams it with [`downloader_core::fetch`].

use std::io::{self, IsTerminal, Read};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use clap::Parser;
use downloader_core::{
    BookInfo, BookManager, CancelToken, Config, IngestPipeline, ProgressCallback, Queue,
    QueueStatus, RetryTuning, coordinator, download_stream,
};
use downloader_core::fetch::Destination;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{debug, info, warn};

mod cli;

use cli::{Args, JobSpec, parse_job_line};

/// Treats a job's URL as a direct download link and streams it with the
/// fetch engine's rate-limit-aware `download_stream`. `search`/`get_info`
/// are not used by this CLI; they exist to complete the trait contract.
struct UrlBookManager {
    client: reqwest::Client,
    tuning: RetryTuning,
}

#[async_trait]
impl BookManager for UrlBookManager {
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
        let Some(url) = info.metadata.get("url") else {
            warn!(book_id = %info.id, "job has no url in metadata, cannot download");
            return false;
        };
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

fn job_to_book_info(job: &JobSpec) -> BookInfo {
    let mut info = BookInfo::new(job.book_id.clone(), job.title.clone());
    if let Some(format) = &job.format {
        info = info.with_format(format.clone());
    }
    info.metadata.insert("url".to_string(), job.url.clone());
    info
}

fn read_jobs(args: &Args) -> Vec<JobSpec> {
    let lines: Vec<String> = if !args.jobs.is_empty() {
        args.jobs.clone()
    } else if !io::stdin().is_terminal() {
        let mut buffer = String::new();
        if let Err(err) = io::stdin().read_to_string(&mut buffer) {
            warn!(error = %err, "failed reading stdin");
            return Vec::new();
        }
        buffer.lines().map(str::to_string).collect()
    } else {
        Vec::new()
    };

    lines
        .iter()
        .filter_map(|line| {
            let parsed = parse_job_line(line);
            if parsed.is_none() {
                warn!(line = %line, "skipping unparsable job line");
            }
            parsed
        })
        .collect()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Some(dir) = &args.ingest_dir {
        // SAFETY: single-threaded at this point, before any Config::from_env() read.
        unsafe { std::env::set_var("INGEST_DIR", dir) };
    }
    if let Some(dir) = &args.tmp_dir {
        unsafe { std::env::set_var("TMP_DIR", dir) };
    }

    let config = Config::from_env()?;
    info!(ingest_dir = %config.ingest_dir.display(), tmp_dir = %config.tmp_dir.display(), "downloader starting");

    let jobs = read_jobs(&args);
    if jobs.is_empty() {
        info!("no jobs provided; pipe `book_id,priority,url[,title[,format]]` lines via stdin");
        return Ok(());
    }

    let mut client_builder = reqwest::Client::builder();
    if let Some(proxy) = &config.https_proxy {
        client_builder = client_builder.proxy(reqwest::Proxy::https(proxy)?);
    }
    if let Some(proxy) = &config.http_proxy {
        client_builder = client_builder.proxy(reqwest::Proxy::http(proxy)?);
    }
    let client = client_builder.build()?;

    let tuning = RetryTuning {
        max_retry: config.max_retry,
        default_sleep: config.default_sleep,
        rate_limit_max_sleep: config.rate_limit_max_sleep,
    };

    if config.use_cf_bypass {
        warn!("USE_CF_BYPASS is set but this CLI ships no bypasser implementation; 403s will not be escalated");
    }

    let queue = Arc::new(Queue::new());
    let ingest = Arc::new(IngestPipeline::new(
        config.ingest_dir.clone(),
        config.use_book_title,
        config.custom_script.clone(),
    ));
    let book_manager: Arc<dyn BookManager> = Arc::new(UrlBookManager { client, tuning });

    let mut accepted = Vec::new();
    for job in jobs {
        let info = job_to_book_info(&job);
        if let Some(dup) = ingest.detect_duplicate(&info, &queue, job.priority) {
            info!(book_id = %job.book_id, reason = ?dup.reason, "skipping duplicate");
            continue;
        }
        debug!(book_id = %job.book_id, priority = job.priority, "enqueuing");
        queue.add(info, job.priority);
        accepted.push(job.book_id);
    }

    if accepted.is_empty() {
        info!("nothing left to do after duplicate detection");
        return Ok(());
    }

    if config.disable_download_coordinator {
        info!("DISABLE_DOWNLOAD_COORDINATOR set; jobs queued but not started");
        return Ok(());
    }

    let handle = coordinator::spawn(queue.clone(), book_manager, ingest, &config);

    let bar = ProgressBar::new(accepted.len() as u64);
    bar.set_style(
        ProgressStyle::with_template("{bar:40.cyan/blue} {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );

    let deadline = Instant::now() + Duration::from_secs(args.wait_secs);
    loop {
        let done = accepted
            .iter()
            .filter(|id| {
                queue
                    .get_status_for(id)
                    .is_none_or(QueueStatus::is_terminal)
            })
            .count();
        bar.set_position(done as u64);
        if done == accepted.len() || Instant::now() >= deadline {
            break;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    bar.finish_and_clear();

    handle.shutdown().await;

    let mut available = 0;
    let mut errored = 0;
    let mut cancelled = 0;
    let mut still_running = 0;
    for id in &accepted {
        match queue.get_status_for(id) {
            Some(QueueStatus::Available | QueueStatus::Done) => available += 1,
            Some(QueueStatus::Error) => errored += 1,
            Some(QueueStatus::Cancelled) => cancelled += 1,
            _ => still_running += 1,
        }
    }

    info!(available, errored, cancelled, still_running, "batch complete");
    println!(
        "{available} available, {errored} failed, {cancelled} cancelled, {still_running} still running"
    );

    Ok(())
}
