// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The download coordinator: the single authority over active transfers and
//! their persisted records.
//!
//! Operations (`download`, `cancel`, `resume`) start and stop transfers on a
//! [`TransferSession`]. The session reports back through
//! [`TransferEvent`]s, which the coordinator turns into record updates and
//! [`DownloadEvent`]s on its [`EventBus`].
//!
//! All record and task-index mutation happens under one lock, so concurrent
//! events for different transfers never interleave their writes. Store
//! writes are synchronous and block the caller while the lock is held.

mod config;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::episode::{Episode, EpisodeId, generate_filename};
use crate::error::{CoordinatorError, StoreError};
use crate::events::{DownloadEvent, EventBus};
use crate::record::{DownloadRecord, DownloadStatus, TaskId};
use crate::store::RecordStore;
use crate::transfer::{TransferEvent, TransferRequest, TransferSession};

pub use config::{CoordinatorConfig, PersistPolicy};

/// What `toggle` did
#[derive(Debug, Clone, PartialEq)]
pub enum ToggleAction {
    Started(TaskId),
    Canceled(DownloadRecord),
    Resumed(TaskId),
}

/// Bookkeeping for one in-flight transfer
#[derive(Debug, Clone)]
struct ActiveTransfer {
    episode_id: EpisodeId,
    url: Url,
    bytes_received: u64,
    bytes_expected: Option<u64>,
    /// A `cancel` call is waiting on the session for this transfer
    canceling: bool,
}

impl ActiveTransfer {
    fn new(episode_id: EpisodeId, url: Url) -> Self {
        Self {
            episode_id,
            url,
            bytes_received: 0,
            bytes_expected: None,
            canceling: false,
        }
    }

    fn progress(&self) -> Option<f64> {
        progress_fraction(self.bytes_received, self.bytes_expected)
    }
}

struct State {
    store: Box<dyn RecordStore>,
    transfers: HashMap<TaskId, ActiveTransfer>,
}

/// Fraction of a file received; `None` unless the total is known and non-zero
pub fn progress_fraction(received: u64, expected: Option<u64>) -> Option<f64> {
    match expected {
        Some(total) if total > 0 => Some((received as f64 / total as f64).min(1.0)),
        _ => None,
    }
}

pub struct DownloadCoordinator<S> {
    session: S,
    state: Mutex<State>,
    bus: EventBus,
    config: CoordinatorConfig,
}

impl<S: TransferSession + 'static> DownloadCoordinator<S> {
    /// Create a coordinator over `session` and `store`.
    ///
    /// Records a previous process left pending are marked failed first: their
    /// transfers died with that process and will never report.
    pub fn new(
        session: S,
        mut store: Box<dyn RecordStore>,
        config: CoordinatorConfig,
    ) -> Result<Self, CoordinatorError> {
        let mut recovered = 0;
        for record in store.records_mut().iter_mut().filter(|r| r.is_in_flight()) {
            warn!(episode = %record.episode_id, task = %record.task_id, "download interrupted");
            record.mark_failed("interrupted");
            recovered += 1;
        }
        if recovered > 0 {
            info!(count = recovered, "marked interrupted downloads as failed");
            persist(config.persist_policy, store.as_mut())?;
        }

        Ok(Self {
            session,
            state: Mutex::new(State {
                store,
                transfers: HashMap::new(),
            }),
            bus: EventBus::new(config.event_capacity),
            config,
        })
    }

    pub fn events(&self) -> &EventBus {
        &self.bus
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Feed session events into the coordinator until the channel closes
    pub fn spawn_event_pump(
        self: &Arc<Self>,
        mut events: mpsc::Receiver<TransferEvent>,
    ) -> JoinHandle<()> {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                coordinator.handle_transfer_event(event).await;
            }
            debug!("transfer event channel closed");
        })
    }

    /// Start downloading an episode.
    ///
    /// Fails without side effects if the episode has no source URL or
    /// already has a pending record.
    pub async fn download(&self, episode: &Episode) -> Result<TaskId, CoordinatorError> {
        let url = self.source_url(episode)?;
        let mut state = self.state.lock().await;

        if state
            .store
            .latest_for_episode(&episode.id)
            .is_some_and(DownloadRecord::is_in_flight)
        {
            return Err(CoordinatorError::AlreadyInFlight {
                episode_id: episode.id.clone(),
            });
        }

        let destination = self.config.download_dir.join(generate_filename(episode));
        let task_id = self
            .session
            .start(TransferRequest {
                url: url.clone(),
                destination,
                resume_token: None,
            })
            .await?;

        state
            .transfers
            .insert(task_id, ActiveTransfer::new(episode.id.clone(), url.clone()));
        state
            .store
            .insert(DownloadRecord::pending(task_id, episode.id.clone(), url));

        if let Err(e) = self.persist(state.store.as_mut()) {
            state.transfers.remove(&task_id);
            state
                .store
                .records_mut()
                .retain(|record| !(record.task_id == task_id && record.is_in_flight()));
            drop(state);
            self.abandon(task_id).await;
            return Err(e.into());
        }

        info!(episode = %episode.id, task = %task_id, "download started");
        Ok(task_id)
    }

    /// Cancel an episode's active transfer, keeping resume data if the
    /// session produced any. Returns the updated record.
    ///
    /// A transfer that ends on its own before the session can stop it is
    /// left to its completion or failure event, and `NoActiveTransfer` is
    /// returned.
    pub async fn cancel(&self, episode: &Episode) -> Result<DownloadRecord, CoordinatorError> {
        let url = self.source_url(episode)?;

        // Claim the transfer, then release the lock while the session winds it down
        let task_id = {
            let mut state = self.state.lock().await;
            let (task_id, transfer) = state
                .transfers
                .iter_mut()
                .find(|(_, transfer)| transfer.url == url && !transfer.canceling)
                .ok_or_else(|| CoordinatorError::NoActiveTransfer {
                    episode_id: episode.id.clone(),
                })?;
            transfer.canceling = true;
            *task_id
        };

        let outcome = self.session.cancel(task_id).await;
        let mut state = self.state.lock().await;

        let Some(outcome) = outcome else {
            if let Some(transfer) = state.transfers.get_mut(&task_id) {
                transfer.canceling = false;
            }
            debug!(episode = %episode.id, task = %task_id, "transfer ended before cancel");
            return Err(CoordinatorError::NoActiveTransfer {
                episode_id: episode.id.clone(),
            });
        };

        // Out of the index first: the session reports nothing more for this task
        let active = state.transfers.remove(&task_id);
        let progress = progress_fraction(outcome.bytes_received, outcome.bytes_expected)
            .or_else(|| active.as_ref().and_then(ActiveTransfer::progress))
            .unwrap_or(0.0);
        let resumable = outcome.resume_token.is_some();

        let record = state
            .store
            .fetch_by_task_mut(task_id)
            .ok_or(CoordinatorError::MissingRecord { task_id })?;
        record.mark_canceled(progress, outcome.resume_token);
        let record = record.clone();

        info!(episode = %episode.id, task = %task_id, progress, resumable, "download canceled");
        self.persist(state.store.as_mut())?;
        drop(state);

        self.bus.publish(DownloadEvent::Canceled {
            episode_id: record.episode_id.clone(),
            url: record.source_url.clone(),
            resumable,
        });
        Ok(record)
    }

    /// Continue a canceled download from its resume token
    pub async fn resume(&self, episode: &Episode) -> Result<TaskId, CoordinatorError> {
        let url = self.source_url(episode)?;
        let mut state = self.state.lock().await;

        let in_flight = state
            .transfers
            .values()
            .any(|transfer| transfer.episode_id == episode.id)
            || state
                .store
                .latest_for_episode(&episode.id)
                .is_some_and(DownloadRecord::is_in_flight);
        if in_flight {
            return Err(CoordinatorError::AlreadyInFlight {
                episode_id: episode.id.clone(),
            });
        }

        let previous = state.store.latest_for_episode(&episode.id).cloned();
        let resume_token = previous
            .as_ref()
            .and_then(|record| record.resume_token.clone())
            .ok_or_else(|| CoordinatorError::NoResumeData {
                episode_id: episode.id.clone(),
            })?;

        let destination = self.config.download_dir.join(generate_filename(episode));
        let task_id = self
            .session
            .start(TransferRequest {
                url: url.clone(),
                destination,
                resume_token: Some(resume_token),
            })
            .await?;

        state
            .transfers
            .insert(task_id, ActiveTransfer::new(episode.id.clone(), url));
        if let Some(record) = state.store.latest_for_episode_mut(&episode.id) {
            record.mark_resumed(task_id);
        }

        if let Err(e) = self.persist(state.store.as_mut()) {
            state.transfers.remove(&task_id);
            if let (Some(record), Some(previous)) =
                (state.store.latest_for_episode_mut(&episode.id), previous)
            {
                *record = previous;
            }
            drop(state);
            self.abandon(task_id).await;
            return Err(e.into());
        }

        info!(episode = %episode.id, task = %task_id, "download resumed");
        Ok(task_id)
    }

    /// The single "download button": start, cancel, or resume depending on
    /// the episode's current record
    pub async fn toggle(&self, episode: &Episode) -> Result<ToggleAction, CoordinatorError> {
        let current = self.record(&episode.id).await;

        match current {
            None => self.download(episode).await.map(ToggleAction::Started),
            Some(record) => match record.status {
                DownloadStatus::Pending => self.cancel(episode).await.map(ToggleAction::Canceled),
                DownloadStatus::Canceled if record.resume_token.is_some() => {
                    self.resume(episode).await.map(ToggleAction::Resumed)
                }
                DownloadStatus::Canceled | DownloadStatus::Failed => {
                    self.download(episode).await.map(ToggleAction::Started)
                }
                DownloadStatus::Succeeded => Err(CoordinatorError::AlreadyDownloaded {
                    episode_id: episode.id.clone(),
                }),
            },
        }
    }

    /// The latest record for an episode
    pub async fn record(&self, episode_id: &EpisodeId) -> Option<DownloadRecord> {
        self.state
            .lock()
            .await
            .store
            .latest_for_episode(episode_id)
            .cloned()
    }

    pub async fn status(&self, episode_id: &EpisodeId) -> Option<DownloadStatus> {
        self.record(episode_id).await.map(|record| record.status)
    }

    /// Succeeded records, most recently downloaded first
    pub async fn downloaded(&self) -> Vec<DownloadRecord> {
        self.state.lock().await.store.downloaded()
    }

    /// Number of transfers currently in flight
    pub async fn active_count(&self) -> usize {
        self.state.lock().await.transfers.len()
    }

    /// Apply one session event to the records and notify observers
    pub async fn handle_transfer_event(&self, event: TransferEvent) {
        match event {
            TransferEvent::Progress {
                task_id,
                bytes_written,
                bytes_expected,
            } => self.on_progress(task_id, bytes_written, bytes_expected).await,
            TransferEvent::Finished {
                task_id,
                path,
                bytes,
                content_hash,
            } => {
                self.on_finished(task_id, path, bytes, content_hash)
                    .await
            }
            TransferEvent::Failed { task_id, reason } => self.on_failed(task_id, reason).await,
        }
    }

    /// Progress is never persisted; only cancel records a fraction durably
    async fn on_progress(&self, task_id: TaskId, bytes_written: u64, bytes_expected: Option<u64>) {
        let event = {
            let mut state = self.state.lock().await;
            let Some(active) = state.transfers.get_mut(&task_id) else {
                debug!(task = %task_id, "progress for unknown transfer");
                return;
            };
            active.bytes_received = bytes_written;
            active.bytes_expected = bytes_expected;

            progress_fraction(bytes_written, bytes_expected).map(|fraction| {
                DownloadEvent::Progress {
                    episode_id: active.episode_id.clone(),
                    url: active.url.clone(),
                    fraction,
                }
            })
        };

        if let Some(event) = event {
            self.bus.publish(event);
        }
    }

    async fn on_finished(
        &self,
        task_id: TaskId,
        path: std::path::PathBuf,
        bytes: u64,
        content_hash: Option<String>,
    ) {
        let event = {
            let mut state = self.state.lock().await;
            let Some(active) = state.transfers.remove(&task_id) else {
                debug!(task = %task_id, "completion for unknown transfer");
                return;
            };

            match state.store.fetch_by_task_mut(task_id) {
                Some(record) => record.mark_succeeded(path.clone(), bytes, content_hash),
                None => {
                    warn!(task = %task_id, episode = %active.episode_id, "no record for finished transfer");
                    let mut record =
                        DownloadRecord::pending(task_id, active.episode_id.clone(), active.url.clone());
                    record.mark_succeeded(path.clone(), bytes, content_hash);
                    state.store.insert(record);
                }
            }
            info!(episode = %active.episode_id, task = %task_id, bytes, "download completed");
            self.persist_logged(state.store.as_mut());

            DownloadEvent::Completed {
                episode_id: active.episode_id,
                url: active.url,
                path,
                size_bytes: bytes,
            }
        };

        self.bus.publish(event);
    }

    async fn on_failed(&self, task_id: TaskId, reason: String) {
        let event = {
            let mut state = self.state.lock().await;
            let active = state.transfers.remove(&task_id);

            match state.store.fetch_by_task_mut(task_id) {
                Some(record) => {
                    record.mark_failed(reason.clone());
                    warn!(episode = %record.episode_id, task = %task_id, reason = %reason, "download failed");
                    self.persist_logged(state.store.as_mut());
                }
                None => warn!(task = %task_id, reason = %reason, "no record for failed transfer"),
            }

            active.map(|active| DownloadEvent::Failed {
                episode_id: active.episode_id,
                url: active.url,
                reason,
            })
        };

        if let Some(event) = event {
            self.bus.publish(event);
        }
    }

    /// Stop a transfer whose start could not be recorded. Must be called
    /// without the state lock held.
    async fn abandon(&self, task_id: TaskId) {
        warn!(task = %task_id, "download records not saved, stopping transfer");
        // Any resume data it produced is dropped with it
        let _ = self.session.cancel(task_id).await;
    }

    fn source_url(&self, episode: &Episode) -> Result<Url, CoordinatorError> {
        episode
            .source_url()
            .cloned()
            .ok_or_else(|| CoordinatorError::MissingSourceUrl {
                episode_id: episode.id.clone(),
            })
    }

    fn persist(&self, store: &mut dyn RecordStore) -> Result<(), StoreError> {
        persist(self.config.persist_policy, store)
    }

    /// Event handlers have no caller to report to
    fn persist_logged(&self, store: &mut dyn RecordStore) {
        if let Err(e) = self.persist(store) {
            error!(error = %e, "failed to save download records");
        }
    }
}

/// Save the store according to `policy`
fn persist(policy: PersistPolicy, store: &mut dyn RecordStore) -> Result<(), StoreError> {
    let result = match store.save() {
        Err(e) if policy == PersistPolicy::RetryOnce => {
            warn!(error = %e, "saving download records failed, retrying");
            store.save()
        }
        result => result,
    };

    match result {
        Ok(()) => Ok(()),
        Err(e) if policy == PersistPolicy::Fail => Err(e),
        Err(e) => {
            error!(error = %e, "failed to save download records");
            Ok(())
        }
    }
}
