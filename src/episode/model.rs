// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::fmt;

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use url::Url;

/// Stable identifier of an episode (the feed GUID, or the enclosure URL when
/// the feed carries none)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EpisodeId(String);

impl EpisodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EpisodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EpisodeId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// A single podcast episode
#[derive(Debug, Clone)]
pub struct Episode {
    pub id: EpisodeId,
    pub title: String,
    pub pub_date: Option<DateTime<FixedOffset>>,
    pub enclosure: Option<Enclosure>,
}

/// The audio file attached to an episode
#[derive(Debug, Clone)]
pub struct Enclosure {
    pub url: Url,
    pub length: Option<u64>,
    pub mime_type: Option<String>,
}

impl Episode {
    /// Create an episode with just an id, a title and an audio URL
    pub fn new(id: impl Into<EpisodeId>, title: impl Into<String>, url: Url) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            pub_date: None,
            enclosure: Some(Enclosure {
                url,
                length: None,
                mime_type: None,
            }),
        }
    }

    /// URL the audio is downloaded from, if the episode has one
    pub fn source_url(&self) -> Option<&Url> {
        self.enclosure.as_ref().map(|enclosure| &enclosure.url)
    }
}
