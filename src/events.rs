// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::PathBuf;

use tokio::sync::broadcast;
use url::Url;

use crate::episode::EpisodeId;

/// Default number of events buffered per subscriber before it starts lagging
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Download lifecycle events published to in-process observers
#[derive(Debug, Clone, PartialEq)]
pub enum DownloadEvent {
    /// Bytes arrived for a transfer whose total size is known
    Progress {
        episode_id: EpisodeId,
        url: Url,
        /// 0.0 to 1.0
        fraction: f64,
    },

    /// The file is complete and recorded
    Completed {
        episode_id: EpisodeId,
        url: Url,
        path: PathBuf,
        size_bytes: u64,
    },

    /// The transfer failed
    Failed {
        episode_id: EpisodeId,
        url: Url,
        reason: String,
    },

    /// The transfer was canceled on request
    Canceled {
        episode_id: EpisodeId,
        url: Url,
        /// Whether a resume token was kept
        resumable: bool,
    },
}

impl DownloadEvent {
    pub fn episode_id(&self) -> &EpisodeId {
        match self {
            Self::Progress { episode_id, .. }
            | Self::Completed { episode_id, .. }
            | Self::Failed { episode_id, .. }
            | Self::Canceled { episode_id, .. } => episode_id,
        }
    }

    pub fn url(&self) -> &Url {
        match self {
            Self::Progress { url, .. }
            | Self::Completed { url, .. }
            | Self::Failed { url, .. }
            | Self::Canceled { url, .. } => url,
        }
    }

    /// Whether this event ends the transfer it belongs to
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Progress { .. })
    }
}

/// Process-wide, best-effort fan-out of download events.
///
/// Delivery is at-most-once: events published while nobody is subscribed are
/// dropped, and a subscriber that falls more than the channel capacity behind
/// loses the oldest events.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<DownloadEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event, returning how many subscribers it reached
    pub fn publish(&self, event: DownloadEvent) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DownloadEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast::error::{RecvError, TryRecvError};

    fn progress(fraction: f64) -> DownloadEvent {
        DownloadEvent::Progress {
            episode_id: EpisodeId::new("ep"),
            url: Url::parse("https://example.com/ep.mp3").unwrap(),
            fraction,
        }
    }

    #[test]
    fn publish_without_subscribers_is_dropped() {
        let bus = EventBus::default();
        assert_eq!(bus.publish(progress(0.1)), 0);

        let mut rx = bus.subscribe();
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn every_subscriber_receives_events() {
        let bus = EventBus::default();
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();

        assert_eq!(bus.subscriber_count(), 2);
        assert_eq!(bus.publish(progress(0.5)), 2);

        assert_eq!(first.recv().await.unwrap(), progress(0.5));
        assert_eq!(second.recv().await.unwrap(), progress(0.5));
    }

    #[tokio::test]
    async fn slow_subscriber_lags() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe();

        for i in 0..4 {
            bus.publish(progress(f64::from(i) / 4.0));
        }

        assert!(matches!(rx.recv().await, Err(RecvError::Lagged(2))));
        assert_eq!(rx.recv().await.unwrap(), progress(0.5));
    }

    #[test]
    fn accessors_cover_every_variant() {
        let url = Url::parse("https://example.com/ep.mp3").unwrap();
        let canceled = DownloadEvent::Canceled {
            episode_id: EpisodeId::new("ep"),
            url: url.clone(),
            resumable: true,
        };

        assert_eq!(canceled.url(), &url);
        assert_eq!(canceled.episode_id().as_str(), "ep");
        assert!(canceled.is_terminal());
        assert!(!progress(0.2).is_terminal());
    }
}
