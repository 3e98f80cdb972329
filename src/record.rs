// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::episode::EpisodeId;

/// Identifier a transfer session assigns to a transfer.
///
/// Unique among in-flight transfers of one session only; a resumed download
/// gets a new one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle state of a download record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadStatus {
    Pending,
    Succeeded,
    Failed,
    Canceled,
}

impl DownloadStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        };
        f.write_str(name)
    }
}

/// Opaque bytes produced by a transfer session when a transfer is canceled,
/// allowing it to continue later without refetching received bytes
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResumeToken(Vec<u8>);

impl ResumeToken {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for ResumeToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ResumeToken({} bytes)", self.0.len())
    }
}

/// Persisted state of one download attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadRecord {
    pub task_id: TaskId,
    pub episode_id: EpisodeId,
    pub source_url: Url,
    pub status: DownloadStatus,
    /// Fraction of the file received, 0.0 to 1.0
    pub progress: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_token: Option<ResumeToken>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub downloaded_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

impl DownloadRecord {
    /// A fresh record for a transfer that has just been started
    pub fn pending(task_id: TaskId, episode_id: EpisodeId, source_url: Url) -> Self {
        Self {
            task_id,
            episode_id,
            source_url,
            status: DownloadStatus::Pending,
            progress: 0.0,
            path: None,
            size_bytes: None,
            content_hash: None,
            resume_token: None,
            downloaded_at: None,
            failure_reason: None,
        }
    }

    pub fn is_in_flight(&self) -> bool {
        self.status == DownloadStatus::Pending
    }

    /// Path and size are taken together so a succeeded record always has both
    pub fn mark_succeeded(&mut self, path: PathBuf, size_bytes: u64, content_hash: Option<String>) {
        self.status = DownloadStatus::Succeeded;
        self.progress = 1.0;
        self.path = Some(path);
        self.size_bytes = Some(size_bytes);
        self.content_hash = content_hash;
        self.resume_token = None;
        self.downloaded_at = Some(Utc::now());
        self.failure_reason = None;
    }

    pub fn mark_failed(&mut self, reason: impl Into<String>) {
        self.status = DownloadStatus::Failed;
        self.resume_token = None;
        self.failure_reason = Some(reason.into());
    }

    pub fn mark_canceled(&mut self, progress: f64, resume_token: Option<ResumeToken>) {
        self.status = DownloadStatus::Canceled;
        self.progress = progress.clamp(0.0, 1.0);
        self.resume_token = resume_token;
    }

    /// Move the record onto a new transfer continuing from its resume token,
    /// which is consumed
    pub fn mark_resumed(&mut self, task_id: TaskId) {
        self.task_id = task_id;
        self.status = DownloadStatus::Pending;
        self.resume_token = None;
        self.failure_reason = None;
    }
}
