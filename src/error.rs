// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::PathBuf;
use thiserror::Error;

use crate::episode::EpisodeId;
use crate::record::TaskId;

/// Errors that can occur when fetching or parsing RSS feeds
#[derive(Error, Debug)]
pub enum FeedError {
    #[error("Failed to fetch feed from {url}: {source}")]
    FetchFailed {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Failed to read feed file {path}: {source}")]
    FileReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse RSS feed: {0}")]
    ParseFailed(#[from] rss::Error),

    #[error("Invalid feed URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

/// Errors raised by a single transfer
#[derive(Error, Debug)]
pub enum TransferError {
    #[error("HTTP request failed for {url}: {source}")]
    HttpFailed {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("HTTP error {status} for {url}")]
    HttpStatus { url: String, status: u16 },

    #[error("Failed to create file {path}: {source}")]
    FileCreateFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read partial file {path}: {source}")]
    FileReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write to file {path}: {source}")]
    FileWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Stream error while downloading {url}: {source}")]
    StreamFailed {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Resume token could not be decoded: {0}")]
    InvalidResumeToken(#[source] serde_json::Error),

    #[error("Transfer session has shut down")]
    SessionClosed,
}

/// Errors raised by the download record store
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Failed to read record store {path}: {source}")]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write record store {path}: {source}")]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse record store JSON in {path}: {source}")]
    JsonParseFailed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to serialize download records: {0}")]
    JsonSerializeFailed(#[from] serde_json::Error),

    #[error("Record store rejected the write: {0}")]
    Rejected(String),
}

/// Errors returned by the download coordinator's operations
#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("Episode '{episode_id}' has no source URL")]
    MissingSourceUrl { episode_id: EpisodeId },

    #[error("Episode '{episode_id}' already has a download in flight")]
    AlreadyInFlight { episode_id: EpisodeId },

    #[error("Episode '{episode_id}' is already downloaded")]
    AlreadyDownloaded { episode_id: EpisodeId },

    #[error("No active transfer for episode '{episode_id}'")]
    NoActiveTransfer { episode_id: EpisodeId },

    #[error("Episode '{episode_id}' has no resume data")]
    NoResumeData { episode_id: EpisodeId },

    #[error("No in-flight record for task {task_id}")]
    MissingRecord { task_id: TaskId },

    #[error("Transfer error: {0}")]
    Transfer(#[from] TransferError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}
