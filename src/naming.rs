//! Filesystem-safe naming of downloaded tracks.
//!
//! Pure functions only: mapping a song and the user's layout settings to an
//! output directory and file name involves no I/O.

use std::path::PathBuf;

use crate::{
    config::Settings,
    item::{AudioFormat, Song},
};

/// Placeholder used when sanitization leaves nothing behind.
const FALLBACK_NAME: &str = "Unknown";

/// Characters that are invalid in file names on at least one supported
/// platform.
const INVALID_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

/// Makes a name safe for use as a file or directory name.
///
/// Strips invalid characters, trims leading and trailing dots and spaces,
/// and collapses internal runs of spaces. Returns `"Unknown"` when nothing
/// usable remains.
#[must_use]
pub fn sanitize(name: &str) -> String {
    let stripped: String = name.chars().filter(|c| !INVALID_CHARS.contains(c)).collect();

    let mut result = String::with_capacity(stripped.len());
    let mut last_was_space = false;
    for c in stripped.trim_matches(['.', ' ']).chars() {
        if c == ' ' {
            if !last_was_space {
                result.push(c);
            }
            last_was_space = true;
        } else {
            result.push(c);
            last_was_space = false;
        }
    }

    if result.is_empty() {
        FALLBACK_NAME.to_string()
    } else {
        result
    }
}

/// Directory a song should be written into.
///
/// With album folders enabled the layout is `Artist/Album/`, degrading to
/// `Artist/Singles/` when the album is unknown; otherwise everything lands
/// in a flat `Singles/` directory.
#[must_use]
pub fn output_dir(settings: &Settings, song: &Song) -> PathBuf {
    let base = &settings.download_dir;
    if settings.use_album_folders && !song.artist.is_empty() && !song.album.is_empty() {
        base.join(sanitize(&song.artist)).join(sanitize(&song.album))
    } else if settings.use_album_folders && !song.artist.is_empty() {
        base.join(sanitize(&song.artist)).join("Singles")
    } else {
        base.join("Singles")
    }
}

/// File name for a song in the requested format.
///
/// Two naming modes: `"Artist - Title"` when auto-rename is enabled, and
/// `"NN - Title"` otherwise.
#[must_use]
pub fn file_name(settings: &Settings, song: &Song, format: AudioFormat) -> String {
    let base = if settings.auto_rename {
        format!("{} - {}", sanitize(&song.artist), sanitize(&song.title))
    } else {
        let track = if song.track_number == 0 {
            1
        } else {
            song.track_number
        };
        format!("{track:02} - {}", sanitize(&song.title))
    };
    format!("{base}.{format}")
}

/// Full output path for a song: [`output_dir`] joined with [`file_name`].
#[must_use]
pub fn output_path(settings: &Settings, song: &Song, format: AudioFormat) -> PathBuf {
    output_dir(settings, song).join(file_name(settings, song, format))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn song(artist: &str, title: &str, album: &str, track: u32) -> Song {
        Song {
            artist: artist.to_string(),
            title: title.to_string(),
            album: album.to_string(),
            track_number: track,
            ..Song::default()
        }
    }

    #[test]
    fn sanitize_strips_invalid_characters() {
        let out = sanitize("AC/DC: Best?");
        assert!(!out.is_empty());
        assert!(!out.contains(['/', ':', '?']));
        assert_eq!(out, "ACDC Best");
    }

    #[test]
    fn sanitize_falls_back_when_empty() {
        assert_eq!(sanitize("<>:\"/\\|?*"), FALLBACK_NAME);
        assert_eq!(sanitize(""), FALLBACK_NAME);
        assert_eq!(sanitize(" .. "), FALLBACK_NAME);
    }

    #[test]
    fn sanitize_collapses_spaces_and_trims() {
        assert_eq!(sanitize("  So   Much   Space . "), "So Much Space");
    }

    #[test]
    fn nested_layout_uses_artist_and_album() {
        let mut settings = Settings {
            download_dir: PathBuf::from("/music"),
            ..Settings::default()
        };

        let s = song("Jane Doe", "Hello", "Greetings", 2);
        assert_eq!(
            output_dir(&settings, &s),
            PathBuf::from("/music/Jane Doe/Greetings")
        );

        let single = song("Jane Doe", "Hello", "", 0);
        assert_eq!(
            output_dir(&settings, &single),
            PathBuf::from("/music/Jane Doe/Singles")
        );

        settings.use_album_folders = false;
        assert_eq!(output_dir(&settings, &s), PathBuf::from("/music/Singles"));
    }

    #[test]
    fn file_name_modes() {
        let mut settings = Settings::default();
        let s = song("Jane Doe", "Hello", "Greetings", 7);

        assert_eq!(
            file_name(&settings, &s, AudioFormat::Mp3),
            "Jane Doe - Hello.mp3"
        );

        settings.auto_rename = false;
        assert_eq!(
            file_name(&settings, &s, AudioFormat::Flac),
            "07 - Hello.flac"
        );

        // Unknown track numbers still get a prefix.
        let untracked = song("Jane Doe", "Hello", "Greetings", 0);
        assert_eq!(
            file_name(&settings, &untracked, AudioFormat::Mp3),
            "01 - Hello.mp3"
        );
    }
}
