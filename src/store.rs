// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::episode::EpisodeId;
use crate::error::StoreError;
use crate::record::{DownloadRecord, DownloadStatus, TaskId};

const STORE_VERSION: u32 = 1;

/// Storage for download records.
///
/// Records are kept in memory in insertion order and written out as a whole
/// by `save`. Lookups prefer the most recently inserted match.
pub trait RecordStore: Send {
    fn records(&self) -> &[DownloadRecord];

    fn records_mut(&mut self) -> &mut Vec<DownloadRecord>;

    /// Persist every record
    fn save(&mut self) -> Result<(), StoreError>;

    fn insert(&mut self, record: DownloadRecord) {
        self.records_mut().push(record);
    }

    /// The in-flight record for a task id
    fn fetch_by_task(&self, task_id: TaskId) -> Option<&DownloadRecord> {
        self.records()
            .iter()
            .rev()
            .find(|r| r.task_id == task_id && r.is_in_flight())
    }

    fn fetch_by_task_mut(&mut self, task_id: TaskId) -> Option<&mut DownloadRecord> {
        self.records_mut()
            .iter_mut()
            .rev()
            .find(|r| r.task_id == task_id && r.is_in_flight())
    }

    /// The latest record for an episode
    fn latest_for_episode(&self, episode_id: &EpisodeId) -> Option<&DownloadRecord> {
        self.records()
            .iter()
            .rev()
            .find(|r| &r.episode_id == episode_id)
    }

    fn latest_for_episode_mut(&mut self, episode_id: &EpisodeId) -> Option<&mut DownloadRecord> {
        self.records_mut()
            .iter_mut()
            .rev()
            .find(|r| &r.episode_id == episode_id)
    }

    /// Succeeded records, most recently downloaded first
    fn downloaded(&self) -> Vec<DownloadRecord> {
        let mut records: Vec<_> = self
            .records()
            .iter()
            .filter(|r| r.status == DownloadStatus::Succeeded)
            .cloned()
            .collect();
        records.sort_by(|a, b| b.downloaded_at.cmp(&a.downloaded_at));
        records
    }
}

#[derive(Serialize, Deserialize)]
struct StoreFile {
    version: u32,
    records: Vec<DownloadRecord>,
}

/// Record store backed by a single JSON file
#[derive(Debug)]
pub struct JsonRecordStore {
    path: PathBuf,
    records: Vec<DownloadRecord>,
}

impl JsonRecordStore {
    /// Open the store at `path`, starting empty if the file does not exist
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();

        let records = match std::fs::read_to_string(&path) {
            Ok(content) => {
                let file: StoreFile =
                    serde_json::from_str(&content).map_err(|e| StoreError::JsonParseFailed {
                        path: path.clone(),
                        source: e,
                    })?;
                file.records
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                return Err(StoreError::ReadFailed {
                    path: path.clone(),
                    source: e,
                });
            }
        };

        debug!(path = %path.display(), records = records.len(), "opened record store");
        Ok(Self { path, records })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RecordStore for JsonRecordStore {
    fn records(&self) -> &[DownloadRecord] {
        &self.records
    }

    fn records_mut(&mut self) -> &mut Vec<DownloadRecord> {
        &mut self.records
    }

    /// Writes to `<path>.partial` and renames it over the store, so a crash
    /// mid-write leaves the previous contents intact
    fn save(&mut self) -> Result<(), StoreError> {
        let file = StoreFile {
            version: STORE_VERSION,
            records: self.records.clone(),
        };
        let json = serde_json::to_string_pretty(&file)?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::WriteFailed {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        let mut partial = self.path.clone().into_os_string();
        partial.push(".partial");
        let partial = PathBuf::from(partial);

        std::fs::write(&partial, json).map_err(|e| StoreError::WriteFailed {
            path: partial.clone(),
            source: e,
        })?;
        std::fs::rename(&partial, &self.path).map_err(|e| StoreError::WriteFailed {
            path: self.path.clone(),
            source: e,
        })
    }
}

/// In-memory record store.
///
/// `save` only counts calls; clones share the failure switch and counter so a
/// caller can keep a handle after giving the store away.
#[derive(Debug, Clone, Default)]
pub struct MemoryRecordStore {
    records: Vec<DownloadRecord>,
    fail_saves: Arc<AtomicBool>,
    saves: Arc<AtomicUsize>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: Vec<DownloadRecord>) -> Self {
        Self {
            records,
            ..Self::default()
        }
    }

    /// Make every following `save` fail (or succeed again)
    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    /// Number of `save` calls, failed ones included
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

impl RecordStore for MemoryRecordStore {
    fn records(&self) -> &[DownloadRecord] {
        &self.records
    }

    fn records_mut(&mut self) -> &mut Vec<DownloadRecord> {
        &mut self.records
    }

    fn save(&mut self) -> Result<(), StoreError> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(StoreError::Rejected("saves disabled".to_string()));
        }
        Ok(())
    }
}
