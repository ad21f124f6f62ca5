//! End-to-end CLI tests for the `downloader` binary.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[test]
fn help_displays_usage() {
    let mut cmd = Command::cargo_bin("downloader").unwrap();
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("book_id,priority,url"));
}

#[test]
fn missing_ingest_dir_env_fails_fast() {
    let mut cmd = Command::cargo_bin("downloader").unwrap();
    cmd.env_remove("INGEST_DIR")
        .env_remove("TMP_DIR")
        .write_stdin("")
        .assert()
        .failure();
}

#[tokio::test]
async fn downloads_a_job_from_stdin_and_publishes_it() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/book.epub"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![5u8; 10_000]))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let ingest_dir = dir.path().join("ingest");
    let tmp_dir = dir.path().join("tmp");

    let job = format!("book-1,0,{}/book.epub,Title,epub\n", server.uri());

    let mut cmd = Command::cargo_bin("downloader").unwrap();
    cmd.env("INGEST_DIR", &ingest_dir)
        .env("TMP_DIR", &tmp_dir)
        .env("MAX_CONCURRENT_DOWNLOADS", "1")
        .arg("--wait-secs")
        .arg("10")
        .write_stdin(job)
        .assert()
        .success()
        .stdout(predicate::str::contains("1 available"));

    assert!(ingest_dir.join("book-1.epub").exists());
}
