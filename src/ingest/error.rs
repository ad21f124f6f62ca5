//! Errors surfaced by the ingest pipeline and duplicate-review store.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("failed to move {from} to {to}: {source}")]
    Move {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to create ingest directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to rename {from} to {to}: {source}")]
    Rename {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("path {path} escapes the ingest root")]
    PathEscape { path: PathBuf },

    #[error("path {path} does not refer to a regular file")]
    NotRegularFile { path: PathBuf },

    #[error("staging file {path} does not exist")]
    StagingMissing { path: PathBuf },

    #[error("failed computing digest of {path}: {source}")]
    Digest {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl IngestError {
    #[must_use]
    pub fn move_failed(from: PathBuf, to: PathBuf, source: std::io::Error) -> Self {
        Self::Move { from, to, source }
    }

    #[must_use]
    pub fn create_dir(path: PathBuf, source: std::io::Error) -> Self {
        Self::CreateDir { path, source }
    }

    #[must_use]
    pub fn rename(from: PathBuf, to: PathBuf, source: std::io::Error) -> Self {
        Self::Rename { from, to, source }
    }
}

#[derive(Debug, Error)]
pub enum ReviewStoreError {
    #[error("failed to read duplicate review store at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write duplicate review store at {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse duplicate review store at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}
