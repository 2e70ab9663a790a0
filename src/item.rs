//! Catalog items that can be queued for download.
//!
//! A [`WorkItem`] is a closed tagged union over the three kinds of content
//! the queue accepts: a single [`Song`], a [`Release`] (album or single)
//! owning an ordered list of songs, and an [`Artist`] owning an ordered list
//! of releases. Collections are populated lazily: a release or artist may be
//! enqueued with empty children, which the queue expands through the
//! metadata resolver before dispatch.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{Error, Result};

/// The kind of content a work item refers to.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    Song,
    Release,
    Artist,
}

impl ContentKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ContentKind::Song => "song",
            ContentKind::Release => "release",
            ContentKind::Artist => "artist",
        }
    }
}

impl fmt::Display for ContentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single downloadable track.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Song {
    /// Stable catalog id of the track.
    pub id: String,
    pub title: String,
    pub artist: String,
    pub album: String,
    /// 1-based position within the parent release, `0` when unknown.
    pub track_number: u32,
    pub year: String,
    pub genre: String,
    /// Duration as displayed (`"3:45"`), informational only.
    pub duration: String,
    /// Watch-page video id, used to repair placeholder URLs.
    pub video_id: String,
    pub url: String,
    pub thumbnail_url: String,
    /// User inclusion flag; only consulted when the parent is a collection.
    #[serde(default = "default_selected")]
    pub selected: bool,
}

fn default_selected() -> bool {
    true
}

impl Default for Song {
    fn default() -> Self {
        Self {
            id: String::new(),
            title: String::new(),
            artist: String::new(),
            album: String::new(),
            track_number: 0,
            year: String::new(),
            genre: String::new(),
            duration: String::new(),
            video_id: String::new(),
            url: String::new(),
            thumbnail_url: String::new(),
            selected: true,
        }
    }
}

impl Song {
    /// Returns a usable source URL for the track, repairing placeholder URLs
    /// from the catalog when a video id is known.
    ///
    /// # Errors
    ///
    /// Returns an error if neither the URL nor the video id resolve to a
    /// valid watch URL.
    pub fn source_url(&self) -> Result<String> {
        let placeholder = self.url.is_empty() || self.url.contains("watch?v=song_");
        if !placeholder {
            Url::parse(&self.url)?;
            return Ok(self.url.clone());
        }

        if self.video_id.is_empty() {
            return Err(Error::invalid_argument(format!(
                "no valid source for {self}"
            )));
        }
        Ok(format!(
            "https://music.youtube.com/watch?v={}",
            self.video_id
        ))
    }
}

impl fmt::Display for Song {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{} - {}\"", self.artist, self.title)
    }
}

/// Whether a release is a full album or a single/EP.
#[derive(Copy, Clone, Debug, Default, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReleaseType {
    #[default]
    Album,
    Single,
}

/// An album or single owning an ordered list of songs.
///
/// `songs` may be empty until the release has been expanded through the
/// metadata resolver.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Release {
    pub id: String,
    pub title: String,
    pub artist: String,
    pub year: String,
    pub url: String,
    pub thumbnail_url: String,
    pub release_type: ReleaseType,
    pub songs: Vec<Song>,
}

impl Release {
    /// The songs the user asked for: those flagged `selected`, or all of
    /// them when nothing was explicitly selected.
    #[must_use]
    pub fn selected_songs(&self) -> Vec<Song> {
        let selected: Vec<Song> = self
            .songs
            .iter()
            .filter(|song| song.selected)
            .cloned()
            .collect();
        if selected.is_empty() {
            self.songs.clone()
        } else {
            selected
        }
    }
}

impl fmt::Display for Release {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{}\" by {}", self.title, self.artist)
    }
}

/// An artist owning an ordered list of releases.
///
/// `releases` may be empty until the artist has been expanded through the
/// metadata resolver.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Artist {
    pub id: String,
    pub name: String,
    pub url: String,
    pub thumbnail_url: String,
    pub releases: Vec<Release>,
}

impl fmt::Display for Artist {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// A unit of work accepted by the download queue.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum WorkItem {
    Song(Song),
    Release(Release),
    Artist(Artist),
}

impl WorkItem {
    #[must_use]
    pub fn kind(&self) -> ContentKind {
        match self {
            WorkItem::Song(_) => ContentKind::Song,
            WorkItem::Release(_) => ContentKind::Release,
            WorkItem::Artist(_) => ContentKind::Artist,
        }
    }

    /// Stable catalog id of the wrapped item.
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            WorkItem::Song(song) => &song.id,
            WorkItem::Release(release) => &release.id,
            WorkItem::Artist(artist) => &artist.id,
        }
    }

    /// Display title of the wrapped item.
    #[must_use]
    pub fn title(&self) -> &str {
        match self {
            WorkItem::Song(song) => &song.title,
            WorkItem::Release(release) => &release.title,
            WorkItem::Artist(artist) => &artist.name,
        }
    }

    /// Source URL of the wrapped item.
    #[must_use]
    pub fn url(&self) -> &str {
        match self {
            WorkItem::Song(song) => &song.url,
            WorkItem::Release(release) => &release.url,
            WorkItem::Artist(artist) => &artist.url,
        }
    }
}

impl fmt::Display for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkItem::Song(song) => song.fmt(f),
            WorkItem::Release(release) => release.fmt(f),
            WorkItem::Artist(artist) => artist.fmt(f),
        }
    }
}

/// Audio container formats the external tool can produce.
#[derive(
    Copy, Clone, Debug, Default, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum AudioFormat {
    #[default]
    Mp3,
    Flac,
    Wav,
    Ogg,
    M4a,
}

impl AudioFormat {
    /// File extension, which doubles as the tool's format argument.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            AudioFormat::Mp3 => "mp3",
            AudioFormat::Flac => "flac",
            AudioFormat::Wav => "wav",
            AudioFormat::Ogg => "ogg",
            AudioFormat::M4a => "m4a",
        }
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AudioFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let variant = match s.to_ascii_lowercase().as_str() {
            "mp3" => AudioFormat::Mp3,
            "flac" => AudioFormat::Flac,
            "wav" => AudioFormat::Wav,
            "ogg" => AudioFormat::Ogg,
            "m4a" => AudioFormat::M4a,
            _ => return Err(Error::invalid_argument(format!("audio format: {s}"))),
        };
        Ok(variant)
    }
}

/// Audio quality tiers, mapped to bitrate windows by the fetcher.
#[derive(
    Copy, Clone, Debug, Default, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum AudioQuality {
    #[default]
    High,
    Medium,
    Low,
}

impl AudioQuality {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            AudioQuality::High => "high",
            AudioQuality::Medium => "medium",
            AudioQuality::Low => "low",
        }
    }
}

impl fmt::Display for AudioQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AudioQuality {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let variant = match s.to_ascii_lowercase().as_str() {
            "high" => AudioQuality::High,
            "medium" => AudioQuality::Medium,
            "low" => AudioQuality::Low,
            _ => return Err(Error::invalid_argument(format!("audio quality: {s}"))),
        };
        Ok(variant)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_url_repairs_placeholder() {
        let song = Song {
            url: "https://music.youtube.com/watch?v=song_abc_0".to_string(),
            video_id: "dQw4w9WgXcQ".to_string(),
            ..Song::default()
        };
        assert_eq!(
            song.source_url().unwrap(),
            "https://music.youtube.com/watch?v=dQw4w9WgXcQ"
        );
    }

    #[test]
    fn source_url_rejects_unresolvable() {
        let song = Song {
            title: "Nowhere".to_string(),
            ..Song::default()
        };
        assert!(song.source_url().is_err());
    }

    #[test]
    fn selected_songs_defaults_to_all() {
        let mut release = Release {
            songs: vec![
                Song {
                    selected: false,
                    ..Song::default()
                },
                Song {
                    selected: false,
                    ..Song::default()
                },
            ],
            ..Release::default()
        };
        // Nothing explicitly selected: fall back to the full track list.
        assert_eq!(release.selected_songs().len(), 2);

        release.songs[0].selected = true;
        assert_eq!(release.selected_songs().len(), 1);
    }

    #[test]
    fn format_and_quality_parse() {
        assert_eq!("flac".parse::<AudioFormat>().unwrap(), AudioFormat::Flac);
        assert!("aiff".parse::<AudioFormat>().is_err());
        assert_eq!("low".parse::<AudioQuality>().unwrap(), AudioQuality::Low);
        assert!("extreme".parse::<AudioQuality>().is_err());
    }
}
