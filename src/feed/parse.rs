// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use chrono::{DateTime, FixedOffset};
use url::Url;

use crate::episode::{Enclosure, Episode, EpisodeId};
use crate::error::FeedError;

/// A parsed podcast feed
#[derive(Debug, Clone)]
pub struct Podcast {
    pub title: String,
    pub feed_url: Url,
    /// Episodes in feed order
    pub episodes: Vec<Episode>,
}

/// Parse RSS feed XML bytes into a Podcast
pub fn parse_feed(xml_bytes: &[u8], feed_url: Url) -> Result<Podcast, FeedError> {
    let channel = rss::Channel::read_from(xml_bytes)?;

    let episodes = channel.items().iter().map(parse_episode).collect();

    Ok(Podcast {
        title: channel.title().to_string(),
        feed_url,
        episodes,
    })
}

fn parse_episode(item: &rss::Item) -> Episode {
    let title = item
        .title()
        .map(String::from)
        .unwrap_or_else(|| "Untitled Episode".to_string());

    // An unparsable enclosure URL leaves the episode without a source
    let enclosure = item.enclosure().and_then(|enclosure| {
        Some(Enclosure {
            url: Url::parse(enclosure.url()).ok()?,
            length: enclosure.length().parse().ok(),
            mime_type: Some(enclosure.mime_type().to_string()).filter(|s| !s.is_empty()),
        })
    });

    let id = item
        .guid()
        .map(|g| g.value().to_string())
        .or_else(|| enclosure.as_ref().map(|e| e.url.to_string()))
        .unwrap_or_else(|| title.clone());

    let pub_date = item.pub_date().and_then(parse_date);

    Episode {
        id: EpisodeId::new(id),
        title,
        pub_date,
        enclosure,
    }
}

fn parse_date(date_str: &str) -> Option<DateTime<FixedOffset>> {
    if let Ok(date) = DateTime::parse_from_rfc2822(date_str) {
        return Some(date);
    }

    ["%Y-%m-%dT%H:%M:%S%:z", "%Y-%m-%d %H:%M:%S %z"]
        .into_iter()
        .find_map(|format| DateTime::parse_from_str(date_str, format).ok())
}
