//! Tag writing for downloaded files.
//!
//! Stamps title/artist/album/track/year/genre and cover art onto a produced
//! file. Tagging failures are non-fatal by contract: callers log them and
//! count the download as successful anyway.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use lofty::{
    config::WriteOptions,
    picture::{MimeType, Picture, PictureType},
    prelude::{Accessor, TagExt, TaggedFileExt},
    tag::Tag,
};

use crate::{
    error::{Error, Result},
    item::Song,
};

/// The tag fields stamped onto a file.
#[derive(Clone, Debug, Default)]
pub struct TagFields {
    pub title: String,
    pub artist: String,
    pub album: String,
    pub track_number: u32,
    pub year: String,
    pub genre: String,
}

impl TagFields {
    #[must_use]
    pub fn from_song(song: &Song) -> Self {
        Self {
            title: song.title.clone(),
            artist: song.artist.clone(),
            album: song.album.clone(),
            track_number: song.track_number,
            year: song.year.clone(),
            genre: song.genre.clone(),
        }
    }
}

/// Boundary to the tag-writing library.
#[async_trait]
pub trait Tagger: Send + Sync {
    /// Writes `fields` and optional cover art to the file at `path`.
    async fn tag(&self, path: &Path, fields: &TagFields, cover: Option<&[u8]>) -> Result<()>;
}

/// Tagger backed by lofty, covering ID3v2, Vorbis comments and MP4 atoms
/// across the supported container formats.
pub struct LoftyTagger;

impl LoftyTagger {
    fn write(path: &PathBuf, fields: &TagFields, cover: Option<Vec<u8>>) -> Result<()> {
        let tagged = lofty::read_from_path(path)?;

        // Reuse the tool-written tag when one exists so its fields survive,
        // otherwise start a fresh tag of the format's primary type.
        let mut tag = tagged
            .primary_tag()
            .cloned()
            .unwrap_or_else(|| Tag::new(tagged.primary_tag_type()));

        tag.set_title(fields.title.clone());
        tag.set_artist(fields.artist.clone());
        if !fields.album.is_empty() {
            tag.set_album(fields.album.clone());
        }
        if fields.track_number > 0 {
            tag.set_track(fields.track_number);
        }
        if let Ok(year) = fields.year.parse::<u32>() {
            tag.set_year(year);
        }
        if !fields.genre.is_empty() {
            tag.set_genre(fields.genre.clone());
        }

        if let Some(data) = cover {
            let mime = if data.starts_with(&[0x89, 0x50, 0x4E, 0x47]) {
                MimeType::Png
            } else {
                MimeType::Jpeg
            };
            // Replace any front cover the tool may have embedded already.
            tag.remove_picture_type(PictureType::CoverFront);
            tag.push_picture(Picture::new_unchecked(
                PictureType::CoverFront,
                Some(mime),
                None,
                data,
            ));
        }

        tag.save_to_path(path, WriteOptions::default())?;
        Ok(())
    }
}

#[async_trait]
impl Tagger for LoftyTagger {
    async fn tag(&self, path: &Path, fields: &TagFields, cover: Option<&[u8]>) -> Result<()> {
        let path = path.to_path_buf();
        let fields = fields.clone();
        let cover = cover.map(<[u8]>::to_vec);

        // Tag IO is blocking; keep it off the async workers.
        tokio::task::spawn_blocking(move || Self::write(&path, &fields, cover))
            .await
            .map_err(|e| Error::tagging(format!("tag task failed: {e}")))?
    }
}
