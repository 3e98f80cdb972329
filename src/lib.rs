// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

pub mod coordinator;
pub mod episode;
pub mod error;
pub mod events;
pub mod feed;
pub mod http;
pub mod record;
pub mod store;
pub mod transfer;

// Re-export main types for convenience
pub use coordinator::{CoordinatorConfig, DownloadCoordinator, PersistPolicy, ToggleAction};
pub use episode::{Enclosure, Episode, EpisodeId, generate_filename, get_audio_extension};
pub use error::{CoordinatorError, FeedError, StoreError, TransferError};
pub use events::{DownloadEvent, EventBus};
pub use feed::{Podcast, is_url, load_feed, parse_feed};
pub use http::{HttpClient, HttpResponse, ReqwestClient};
pub use record::{DownloadRecord, DownloadStatus, ResumeToken, TaskId};
pub use store::{JsonRecordStore, MemoryRecordStore, RecordStore};
pub use transfer::{
    CancelOutcome, DEFAULT_MAX_CONCURRENT, HttpTransferSession, TransferEvent, TransferRequest,
    TransferSession,
};
