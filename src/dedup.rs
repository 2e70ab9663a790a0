//! Fuzzy duplicate detection for downloaded tracks.
//!
//! Catalog titles and on-disk names rarely match exactly: files may carry
//! `(Official Video)` suffixes, different separators, or reordered fields.
//! The matcher normalizes both sides and declares a duplicate when every
//! remaining title token and every remaining artist token appears in the
//! candidate file name.

use std::{fs, path::Path};

use crate::item::AudioFormat;

/// Words that frequently decorate titles and file names without carrying
/// identity.
const STOP_WORDS: [&str; 8] = [
    "official", "video", "audio", "lyrics", "ft", "feat", "remix", "version",
];

/// Punctuation that is replaced by whitespace before tokenizing.
const PUNCTUATION: &[char] = &[
    '(', ')', '[', ']', '{', '}', '-', '_', '.', ',', '\'', '"',
];

/// Lowercases, strips punctuation, and drops stop words, returning a
/// single-space separated string.
fn normalize(text: &str) -> String {
    let lowered = text.to_lowercase();
    let cleaned: String = lowered
        .chars()
        .map(|c| if PUNCTUATION.contains(&c) { ' ' } else { c })
        .collect();

    let words: Vec<&str> = cleaned
        .split_whitespace()
        .filter(|word| !STOP_WORDS.contains(word))
        .collect();
    words.join(" ")
}

/// Tokens worth matching on: normalized words longer than one character.
fn tokens(text: &str) -> Vec<String> {
    normalize(text)
        .split_whitespace()
        .filter(|word| word.len() > 1)
        .map(str::to_string)
        .collect()
}

/// Whether a candidate file stem matches the given title and artist.
///
/// Every title token and every artist token must be a substring of the
/// normalized stem. Empty token sets never match; a file can't be declared
/// a duplicate of nothing.
#[must_use]
pub fn matches(file_stem: &str, title: &str, artist: &str) -> bool {
    let title_tokens = tokens(title);
    let artist_tokens = tokens(artist);
    if title_tokens.is_empty() || artist_tokens.is_empty() {
        return false;
    }

    let stem = normalize(file_stem);
    title_tokens
        .iter()
        .chain(artist_tokens.iter())
        .all(|token| stem.contains(token.as_str()))
}

/// Scans `dir` for an existing file of the given format that fuzzily
/// matches `title` by `artist`.
///
/// IO failures are treated as "no duplicate": a directory that can't be
/// read will fail properly later when the download tries to write into it.
#[must_use]
pub fn scan_dir(dir: &Path, title: &str, artist: &str, format: AudioFormat) -> bool {
    if title.is_empty() || artist.is_empty() {
        return false;
    }

    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            debug!("duplicate scan of {} skipped: {e}", dir.display());
            return false;
        }
    };

    let extension = format.as_str();
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };

        let lowered = name.to_lowercase();
        let Some(stem) = lowered.strip_suffix(&format!(".{extension}")) else {
            continue;
        };

        if matches(stem, title, artist) {
            info!("duplicate found: {name} matches {artist} - {title}");
            return true;
        }
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decorated_title_matches_plain_file() {
        assert!(matches(
            "jane doe - hello",
            "Hello (Official Video)",
            "Jane Doe"
        ));
    }

    #[test]
    fn different_title_does_not_match() {
        assert!(!matches("jane doe - goodbye", "Hello", "Jane Doe"));
    }

    #[test]
    fn artist_must_match_too() {
        assert!(!matches("john smith - hello", "Hello", "Jane Doe"));
    }

    #[test]
    fn short_tokens_are_ignored_but_empty_sets_never_match() {
        // "a" is dropped as a one-character token, leaving "song".
        assert!(matches("someone - song", "A Song", "Someone"));
        // A title of only droppable tokens can never declare a match.
        assert!(!matches("someone - song", "a", "Someone"));
    }

    #[test]
    fn scan_dir_finds_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("jane doe - hello.mp3"), b"x").unwrap();
        std::fs::write(dir.path().join("unrelated.flac"), b"x").unwrap();

        assert!(scan_dir(
            dir.path(),
            "Hello (Official Video)",
            "Jane Doe",
            AudioFormat::Mp3
        ));
        // Same name, wrong format.
        assert!(!scan_dir(
            dir.path(),
            "Hello (Official Video)",
            "Jane Doe",
            AudioFormat::Flac
        ));
        // Missing directory reads as "no duplicate".
        assert!(!scan_dir(
            &dir.path().join("missing"),
            "Hello",
            "Jane Doe",
            AudioFormat::Mp3
        ));
    }
}
