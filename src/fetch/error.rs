//! Error types for the HTTP fetch engine.
//!
//! `fetch_page` and `download_stream` absorb every failure mode internally
//! and return `String`/`bool` per their public contract; these variants
//! exist for the internal plumbing that classifies and logs a failure
//! before it is swallowed at the boundary.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("failed to open destination {path}: {source}")]
    Destination {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("error streaming response body from {url}: {source}")]
    Stream {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("failed writing to destination: {source}")]
    Write {
        #[source]
        source: std::io::Error,
    },
}

impl FetchError {
    #[must_use]
    pub fn destination(path: PathBuf, source: std::io::Error) -> Self {
        Self::Destination { path, source }
    }

    #[must_use]
    pub fn request(url: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Request {
            url: url.into(),
            source,
        }
    }

    #[must_use]
    pub fn stream(url: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Stream {
            url: url.into(),
            source,
        }
    }

    #[must_use]
    pub fn write(source: std::io::Error) -> Self {
        Self::Write { source }
    }
}
