//! Persisted application settings.
//!
//! Settings are a flat TOML record loaded at startup and saved on change.
//! Missing keys fall back to defaults; an invalid download directory falls
//! back to the user's music directory, then the downloads directory, then
//! the process working directory.

use std::{
    env, fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::{
    error::Result,
    item::{AudioFormat, AudioQuality},
};

/// Default number of concurrent downloads.
pub const DEFAULT_THREADS: usize = 3;

/// Upper bound on the settings file size. The file is a handful of keys;
/// anything larger is not ours.
const MAX_SETTINGS_FILE_SIZE: u64 = 64 * 1024;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Root directory downloads are written into.
    pub download_dir: PathBuf,

    /// Concurrent download slots; sizes both worker pools.
    pub threads: usize,

    pub format: AudioFormat,
    pub quality: AudioQuality,

    /// Name files as `"Artist - Title"` instead of `"NN - Title"`.
    pub auto_rename: bool,

    /// Nest output under `Artist/Album/` instead of a flat `Singles/`.
    pub use_album_folders: bool,

    /// Scan the destination directory for fuzzy duplicates before fetching.
    pub check_duplicates: bool,

    pub normalize_audio: bool,
    pub notify_on_complete: bool,

    /// Treat a collection with any failed leaf as failed, instead of the
    /// default zero-success rule.
    pub strict_collections: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            download_dir: default_download_dir(),
            threads: DEFAULT_THREADS,
            format: AudioFormat::default(),
            quality: AudioQuality::default(),
            auto_rename: true,
            use_album_folders: true,
            check_duplicates: true,
            normalize_audio: true,
            notify_on_complete: true,
            strict_collections: false,
        }
    }
}

impl Settings {
    /// Default on-disk location of the settings file.
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("tunepull")
            .join("settings.toml")
    }

    /// Loads settings from `path`, falling back to defaults when the file is
    /// missing or malformed. The download directory is validated either way.
    #[must_use]
    pub fn load(path: &Path) -> Self {
        let mut settings = match Self::read(path) {
            Ok(settings) => settings,
            Err(e) => {
                if path.exists() {
                    warn!("could not load settings from {}: {e}", path.display());
                }
                Self::default()
            }
        };

        settings.validate_download_dir();
        settings
    }

    fn read(path: &Path) -> Result<Self> {
        // Prevent out-of-memory condition: the settings file should be small.
        let attributes = fs::metadata(path)?;
        if attributes.len() > MAX_SETTINGS_FILE_SIZE {
            return Err(crate::error::Error::invalid_argument(format!(
                "{} is too large",
                path.display()
            )));
        }

        let contents = fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Saves settings to `path`, creating parent directories as needed.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    /// Ensures the download directory exists, walking the fallback chain
    /// when it cannot be created.
    fn validate_download_dir(&mut self) {
        if self.download_dir.is_dir() || fs::create_dir_all(&self.download_dir).is_ok() {
            return;
        }

        warn!(
            "download directory {} is unusable, falling back",
            self.download_dir.display()
        );
        self.download_dir = default_download_dir();
    }
}

/// The user's music directory when present, then the downloads directory,
/// then the process working directory.
fn default_download_dir() -> PathBuf {
    if let Some(music) = dirs::audio_dir() {
        if music.is_dir() {
            return music;
        }
    }

    if let Some(downloads) = dirs::download_dir() {
        if downloads.is_dir() || fs::create_dir_all(&downloads).is_ok() {
            return downloads;
        }
    }

    env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::load(&dir.path().join("nope.toml"));
        assert_eq!(settings.threads, DEFAULT_THREADS);
        assert_eq!(settings.format, AudioFormat::Mp3);
        assert_eq!(settings.quality, AudioQuality::High);
        assert!(settings.check_duplicates);
    }

    #[test]
    fn save_and_reload_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");

        let settings = Settings {
            download_dir: dir.path().to_path_buf(),
            threads: 5,
            format: AudioFormat::Flac,
            quality: AudioQuality::Low,
            use_album_folders: false,
            ..Settings::default()
        };
        settings.save(&path).unwrap();

        let reloaded = Settings::load(&path);
        assert_eq!(reloaded.threads, 5);
        assert_eq!(reloaded.format, AudioFormat::Flac);
        assert_eq!(reloaded.quality, AudioQuality::Low);
        assert!(!reloaded.use_album_folders);
        assert_eq!(reloaded.download_dir, dir.path());
    }

    #[test]
    fn partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        fs::write(&path, "threads = 8\n").unwrap();

        let settings = Settings::load(&path);
        assert_eq!(settings.threads, 8);
        assert_eq!(settings.format, AudioFormat::Mp3);
        assert!(settings.auto_rename);
    }
}
