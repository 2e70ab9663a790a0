//! Catalog metadata resolution.
//!
//! Collections are enqueued lazily: a release may arrive without its track
//! list and an artist without their releases. The [`MetadataResolver`]
//! boundary turns a catalog URL/id into the expanded children, plus the core
//! tags (year, track numbers) needed for naming and tagging.
//!
//! [`YtDlpResolver`] is the concrete implementation: it asks the external
//! tool for a flat JSON dump of the playlist or channel behind the URL and
//! maps the entries into [`Song`]s and [`Release`]s. Anything smarter —
//! searching the catalog, scoring matches — is somebody else's job.

use std::{path::PathBuf, process::Stdio};

use async_trait::async_trait;
use serde_json::Value;
use tokio::process::Command;

use crate::{
    error::{Error, Result},
    http,
    item::{Release, ReleaseType, Song},
};

/// Expanded children of a release.
#[derive(Clone, Debug, Default)]
pub struct ResolvedRelease {
    pub songs: Vec<Song>,
    pub year: String,
}

/// Expanded children of an artist.
#[derive(Clone, Debug, Default)]
pub struct ResolvedArtist {
    pub releases: Vec<Release>,
}

/// Boundary to the catalog service.
///
/// An empty-but-successful result means "no children", not an error; the
/// queue applies its own aggregation rules to childless collections.
#[async_trait]
pub trait MetadataResolver: Send + Sync {
    async fn resolve_release(&self, url: &str, id: &str) -> Result<ResolvedRelease>;
    async fn resolve_artist(&self, url: &str, id: &str) -> Result<ResolvedArtist>;
}

/// Resolver backed by the external download tool's metadata dump.
pub struct YtDlpResolver {
    tool: PathBuf,
}

impl YtDlpResolver {
    /// Cap on stderr carried into error messages.
    const STDERR_EXCERPT: usize = 512;

    #[must_use]
    pub fn new(tool: PathBuf) -> Self {
        Self { tool }
    }

    /// Dumps the flat playlist JSON for `url`.
    async fn dump(&self, url: &str) -> Result<Value> {
        debug!("resolving metadata for {url}");
        let output = Command::new(&self.tool)
            .args(["--no-update", "--flat-playlist", "--no-warnings", "-J", url])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::resolution(format!("could not run {}: {e}", self.tool.display())))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let excerpt: String = stderr.trim().chars().take(Self::STDERR_EXCERPT).collect();
            return Err(Error::resolution(format!(
                "metadata dump of {url} failed ({}): {excerpt}",
                output.status
            )));
        }

        serde_json::from_slice(&output.stdout)
            .map_err(|e| Error::resolution(format!("malformed metadata dump of {url}: {e}")))
    }
}

#[async_trait]
impl MetadataResolver for YtDlpResolver {
    async fn resolve_release(&self, url: &str, id: &str) -> Result<ResolvedRelease> {
        let dump = self.dump(url).await?;

        let album = string_field(&dump, "title");
        let album_artist = entry_artist(&dump);
        let year = release_year(&dump);
        let thumbnail = best_thumbnail(&dump);

        let mut songs = Vec::new();
        if let Some(entries) = dump.get("entries").and_then(Value::as_array) {
            for (index, entry) in entries.iter().enumerate() {
                let video_id = string_field(entry, "id");
                let track_number = u32::try_from(index).unwrap_or(u32::MAX).saturating_add(1);
                songs.push(Song {
                    id: if video_id.is_empty() {
                        format!("song_{id}_{index}")
                    } else {
                        video_id.clone()
                    },
                    title: {
                        let title = string_field(entry, "title");
                        if title.is_empty() {
                            format!("Track {track_number}")
                        } else {
                            title
                        }
                    },
                    artist: {
                        let artist = entry_artist(entry);
                        if artist.is_empty() {
                            album_artist.clone()
                        } else {
                            artist
                        }
                    },
                    album: album.clone(),
                    track_number,
                    year: year.clone(),
                    genre: String::new(),
                    duration: format_duration(entry),
                    url: if video_id.is_empty() {
                        url.to_string()
                    } else {
                        format!("https://music.youtube.com/watch?v={video_id}")
                    },
                    video_id,
                    thumbnail_url: thumbnail.clone(),
                    selected: true,
                });
            }
        }

        info!("resolved {} tracks for release {id}", songs.len());
        Ok(ResolvedRelease { songs, year })
    }

    async fn resolve_artist(&self, url: &str, id: &str) -> Result<ResolvedArtist> {
        let dump = self.dump(url).await?;

        let artist_name = {
            let name = entry_artist(&dump);
            if name.is_empty() {
                string_field(&dump, "title")
            } else {
                name
            }
        };

        let mut releases = Vec::new();
        if let Some(entries) = dump.get("entries").and_then(Value::as_array) {
            for (index, entry) in entries.iter().enumerate() {
                let browse_id = string_field(entry, "id");
                let title = string_field(entry, "title");
                if title.is_empty() {
                    continue;
                }

                let release_type = if title.contains("Single") || title.contains("EP") {
                    ReleaseType::Single
                } else {
                    ReleaseType::Album
                };

                releases.push(Release {
                    id: if browse_id.is_empty() {
                        format!("release_{id}_{index}")
                    } else {
                        browse_id.clone()
                    },
                    title,
                    artist: artist_name.clone(),
                    year: release_year(entry),
                    url: {
                        let entry_url = string_field(entry, "url");
                        if entry_url.is_empty() {
                            format!("https://music.youtube.com/browse/{browse_id}")
                        } else {
                            entry_url
                        }
                    },
                    thumbnail_url: best_thumbnail(entry),
                    release_type,
                    songs: Vec::new(),
                });
            }
        }

        info!("resolved {} releases for artist {id}", releases.len());
        Ok(ResolvedArtist { releases })
    }
}

fn string_field(value: &Value, key: &str) -> String {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// The tool reports the performing artist under different keys depending on
/// the extractor.
fn entry_artist(value: &Value) -> String {
    for key in ["artist", "creator", "uploader", "channel"] {
        let artist = string_field(value, key);
        if !artist.is_empty() {
            return artist;
        }
    }
    String::new()
}

fn release_year(value: &Value) -> String {
    if let Some(year) = value.get("release_year").and_then(Value::as_u64) {
        return year.to_string();
    }

    // Fall back to the first four digits of the upload date.
    let date = string_field(value, "upload_date");
    date.chars().take(4).collect()
}

fn best_thumbnail(value: &Value) -> String {
    // Thumbnails are listed in ascending fidelity.
    value
        .get("thumbnails")
        .and_then(Value::as_array)
        .and_then(|thumbs| thumbs.last())
        .map(|thumb| string_field(thumb, "url"))
        .unwrap_or_else(|| string_field(value, "thumbnail"))
}

fn format_duration(value: &Value) -> String {
    let seconds = value
        .get("duration")
        .and_then(Value::as_f64)
        .unwrap_or_default();
    if seconds <= 0.0 {
        return String::new();
    }

    #[expect(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let seconds = seconds as u64;
    format!("{}:{:02}", seconds / 60, seconds % 60)
}

/// Attempts to find official release artwork for an album.
///
/// Queries the iTunes Search API and returns a 600x600 artwork URL when a
/// result matches the release and artist. Best-effort by design: callers
/// treat `None` as "keep the thumbnail we already have".
pub async fn upgrade_artwork(
    http: &http::Client,
    release_title: &str,
    artist_name: &str,
) -> Option<String> {
    let query = format!("{release_title} {artist_name}");
    let url = format!(
        "https://itunes.apple.com/search?term={}&entity=album&limit=5",
        urlencoding::encode(&query)
    );

    let body = match http.get_bytes(&url).await {
        Ok(body) => body,
        Err(e) => {
            debug!("artwork lookup for {query:?} failed: {e}");
            return None;
        }
    };

    let parsed: Value = match serde_json::from_slice(&body) {
        Ok(parsed) => parsed,
        Err(e) => {
            debug!("artwork lookup for {query:?} returned malformed JSON: {e}");
            return None;
        }
    };

    let results = parsed.get("results").and_then(Value::as_array)?;
    let release_lower = release_title.to_lowercase();
    let artist_lower = artist_name.to_lowercase();

    let exact = results.iter().find(|&result| {
        string_field(result, "collectionName")
            .to_lowercase()
            .contains(&release_lower)
            && string_field(result, "artistName")
                .to_lowercase()
                .contains(&artist_lower)
    });

    // Fall back to the first result if nothing matches perfectly.
    let candidate = exact.or_else(|| results.first())?;
    let artwork = string_field(candidate, "artworkUrl100");
    if artwork.is_empty() {
        None
    } else {
        Some(artwork.replace("100x100bb", "600x600bb"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn release_year_prefers_explicit_field() {
        let explicit = serde_json::json!({ "release_year": 1980, "upload_date": "20210101" });
        assert_eq!(release_year(&explicit), "1980");

        let fallback = serde_json::json!({ "upload_date": "20210101" });
        assert_eq!(release_year(&fallback), "2021");
    }

    #[test]
    fn best_thumbnail_takes_highest_fidelity() {
        let value = serde_json::json!({
            "thumbnails": [
                { "url": "small.jpg" },
                { "url": "large.jpg" },
            ]
        });
        assert_eq!(best_thumbnail(&value), "large.jpg");
    }
}
