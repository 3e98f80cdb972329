// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Transfer sessions: the layer that actually moves bytes.
//!
//! A session runs transfers on its own and reports on them through a channel
//! of [`TransferEvent`]s. Events carry only the [`TaskId`]; correlating them
//! with episodes and records is the coordinator's job.

mod http;

use std::path::PathBuf;

use async_trait::async_trait;
use url::Url;

use crate::error::TransferError;
use crate::record::{ResumeToken, TaskId};

pub use http::{DEFAULT_MAX_CONCURRENT, HttpTransferSession};

/// Capacity of a session's event channel
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// What a transfer should fetch and where the finished file goes
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub url: Url,
    pub destination: PathBuf,
    /// Continue a canceled transfer instead of starting from scratch
    pub resume_token: Option<ResumeToken>,
}

/// Reports from a running transfer
#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    Progress {
        task_id: TaskId,
        /// Total bytes of the file received so far, earlier attempts included
        bytes_written: u64,
        /// Total size of the file, when the server announced one
        bytes_expected: Option<u64>,
    },

    Finished {
        task_id: TaskId,
        path: PathBuf,
        bytes: u64,
        content_hash: Option<String>,
    },

    Failed {
        task_id: TaskId,
        reason: String,
    },
}

impl TransferEvent {
    pub fn task_id(&self) -> TaskId {
        match self {
            Self::Progress { task_id, .. }
            | Self::Finished { task_id, .. }
            | Self::Failed { task_id, .. } => *task_id,
        }
    }
}

/// Answer to a cancellation request
#[derive(Debug, Clone, PartialEq)]
pub struct CancelOutcome {
    /// Present when the session can continue the transfer later
    pub resume_token: Option<ResumeToken>,
    pub bytes_received: u64,
    pub bytes_expected: Option<u64>,
}

/// A service that runs transfers in the background.
///
/// A canceled transfer reports nothing further on the event channel.
#[async_trait]
pub trait TransferSession: Send + Sync {
    /// Start a transfer and return its id; the transfer may be queued
    /// behind others before any bytes move
    async fn start(&self, request: TransferRequest) -> Result<TaskId, TransferError>;

    /// Cancel a transfer, producing resume data where possible. `None` when
    /// the session no longer knows the task.
    async fn cancel(&self, task_id: TaskId) -> Option<CancelOutcome>;
}

#[async_trait]
impl<T: TransferSession + ?Sized> TransferSession for std::sync::Arc<T> {
    async fn start(&self, request: TransferRequest) -> Result<TaskId, TransferError> {
        (**self).start(request).await
    }

    async fn cancel(&self, task_id: TaskId) -> Option<CancelOutcome> {
        (**self).cancel(task_id).await
    }
}
