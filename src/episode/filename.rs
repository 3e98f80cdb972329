// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use sanitize_filename::{Options, sanitize_with_options};

use super::Episode;

/// Maximum length (in characters) of the title portion of a filename
const MAX_TITLE_LENGTH: usize = 100;

/// Generate the local filename for an episode's audio file
///
/// Format: "YYYY-MM-DD-sanitized-title.ext", or "sanitized-title.ext" when the
/// episode is undated. Falls back to the episode id when the title sanitizes
/// to nothing.
pub fn generate_filename(episode: &Episode) -> String {
    let mut stem = sanitize_component(&episode.title);
    if stem.is_empty() {
        stem = sanitize_component(episode.id.as_str());
    }
    if stem.is_empty() {
        stem = "episode".to_string();
    }

    let ext = get_audio_extension(episode);
    match episode.pub_date {
        Some(date) => format!("{}-{}.{}", date.format("%Y-%m-%d"), stem, ext),
        None => format!("{}.{}", stem, ext),
    }
}

/// Get the audio file extension from an episode's enclosure
///
/// Tries the URL path first, then the MIME type, and defaults to "mp3"
pub fn get_audio_extension(episode: &Episode) -> String {
    let Some(enclosure) = episode.enclosure.as_ref() else {
        return "mp3".to_string();
    };

    if let Some(ext) = enclosure
        .url
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .and_then(|name| name.rsplit_once('.'))
        .map(|(_, ext)| ext.to_lowercase())
        .filter(|ext| is_audio_extension(ext))
    {
        return ext;
    }

    enclosure
        .mime_type
        .as_deref()
        .and_then(mime_to_extension)
        .unwrap_or("mp3")
        .to_string()
}

fn sanitize_component(raw: &str) -> String {
    let options = Options {
        truncate: true,
        windows: true,
        replacement: "-",
    };
    let cleaned = sanitize_with_options(raw, options);

    // Whitespace and dash runs become a single dash
    let collapsed = cleaned
        .split(|c: char| c.is_whitespace() || c == '-')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("-");

    let trimmed = collapsed.trim_matches(|c: char| c == '.' || c == '-');
    trimmed
        .chars()
        .take(MAX_TITLE_LENGTH)
        .collect::<String>()
        .trim_end_matches(['-', '.'])
        .to_string()
}

fn is_audio_extension(ext: &str) -> bool {
    matches!(
        ext,
        "mp3" | "m4a" | "mp4" | "aac" | "ogg" | "opus" | "wav" | "flac"
    )
}

fn mime_to_extension(mime: &str) -> Option<&'static str> {
    match mime.to_lowercase().as_str() {
        "audio/mpeg" | "audio/mp3" => Some("mp3"),
        "audio/mp4" | "audio/m4a" | "audio/x-m4a" => Some("m4a"),
        "audio/aac" => Some("aac"),
        "audio/ogg" => Some("ogg"),
        "audio/opus" => Some("opus"),
        "audio/wav" | "audio/x-wav" => Some("wav"),
        "audio/flac" | "audio/x-flac" => Some("flac"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::episode::{Enclosure, EpisodeId};
    use chrono::DateTime;
    use url::Url;

    fn make_episode(title: &str, date: Option<&str>, url: &str, mime: Option<&str>) -> Episode {
        Episode {
            id: EpisodeId::new("guid-1"),
            title: title.to_string(),
            pub_date: date.and_then(|d| DateTime::parse_from_rfc2822(d).ok()),
            enclosure: Some(Enclosure {
                url: Url::parse(url).unwrap(),
                length: None,
                mime_type: mime.map(String::from),
            }),
        }
    }

    #[test]
    fn dated_episode_gets_date_prefix() {
        let episode = make_episode(
            "Episode 42: The Answer",
            Some("Mon, 15 Jan 2024 12:00:00 +0000"),
            "https://example.com/ep42.mp3",
            None,
        );

        assert_eq!(
            generate_filename(&episode),
            "2024-01-15-Episode-42-The-Answer.mp3"
        );
    }

    #[test]
    fn undated_episode_has_no_prefix() {
        let episode = make_episode("Bonus", None, "https://example.com/bonus.m4a", None);
        assert_eq!(generate_filename(&episode), "Bonus.m4a");
    }

    #[test]
    fn path_separators_never_survive() {
        let episode = make_episode("a/b\\c", None, "https://example.com/x.mp3", None);
        let name = generate_filename(&episode);

        assert!(!name.contains('/'));
        assert!(!name.contains('\\'));
    }

    #[test]
    fn empty_title_falls_back_to_episode_id() {
        let episode = make_episode("   ", None, "https://example.com/x.mp3", None);
        assert_eq!(generate_filename(&episode), "guid-1.mp3");
    }

    #[test]
    fn long_titles_are_truncated() {
        let title = "word ".repeat(60);
        let episode = make_episode(&title, None, "https://example.com/x.mp3", None);
        let name = generate_filename(&episode);

        assert!(name.len() <= MAX_TITLE_LENGTH + ".mp3".len());
        assert!(!name.contains("-.mp3"));
    }

    #[test]
    fn extension_from_url_wins_over_mime() {
        let episode = make_episode(
            "t",
            None,
            "https://example.com/audio.OGG?token=1",
            Some("audio/mpeg"),
        );
        assert_eq!(get_audio_extension(&episode), "ogg");
    }

    #[test]
    fn extension_falls_back_to_mime_then_mp3() {
        let by_mime = make_episode("t", None, "https://example.com/stream", Some("audio/x-m4a"));
        assert_eq!(get_audio_extension(&by_mime), "m4a");

        let unknown = make_episode("t", None, "https://example.com/stream", Some("text/html"));
        assert_eq!(get_audio_extension(&unknown), "mp3");
    }
}
