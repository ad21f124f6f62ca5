//! CLI argument definitions for the `downloader` binary.

use clap::Parser;

/// Runs the book-download coordinator against a batch of jobs read from
/// stdin (or passed as positional arguments), one job per line as
/// `book_id,priority,url[,title[,format]]`.
#[derive(Parser, Debug)]
#[command(name = "downloader")]
#[command(author, version, about)]
pub struct Args {
    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long)]
    pub quiet: bool,

    /// Job lines (`book_id,priority,url[,title[,format]]`); read from stdin when omitted
    pub jobs: Vec<String>,

    /// Override `INGEST_DIR` for this run
    #[arg(long)]
    pub ingest_dir: Option<String>,

    /// Override `TMP_DIR` for this run
    #[arg(long)]
    pub tmp_dir: Option<String>,

    /// How long to wait for the batch to drain before giving up, in seconds
    #[arg(long, default_value_t = 300)]
    pub wait_secs: u64,
}

/// A single parsed job line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSpec {
    pub book_id: String,
    pub priority: i64,
    pub url: String,
    pub title: String,
    pub format: Option<String>,
}

/// Parses `book_id,priority,url[,title[,format]]`. Malformed lines are
/// skipped by the caller, which logs a warning naming the offending line.
#[must_use]
pub fn parse_job_line(line: &str) -> Option<JobSpec> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    let mut parts = line.splitn(5, ',');
    let book_id = parts.next()?.trim().to_string();
    let priority: i64 = parts.next()?.trim().parse().ok()?;
    let url = parts.next()?.trim().to_string();
    if book_id.is_empty() || url.is_empty() {
        return None;
    }
    let title = parts
        .next()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(&book_id)
        .to_string();
    let format = parts
        .next()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_ascii_lowercase);
    Some(JobSpec {
        book_id,
        priority,
        url,
        title,
        format,
    })
}
