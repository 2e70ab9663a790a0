//! Track fetching through the external download tool.
//!
//! The actual media transfer and transcode is delegated to an external
//! process (yt-dlp plus ffmpeg). This module owns the thin boundary around
//! it: building the invocation for the requested format and quality,
//! streaming the tool's progress output back as callbacks, and killing the
//! process when the entry is cancelled.
//!
//! The tool enforces its own retry/backoff on network hiccups (`--retries`,
//! `--fragment-retries`); the queue deliberately does not add another layer
//! on top.

use std::{
    path::{Path, PathBuf},
    process::Stdio,
    sync::OnceLock,
};

use async_trait::async_trait;
use regex_lite::Regex;
use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, BufReader},
    process::Command,
};
use tokio_util::sync::CancellationToken;

use crate::{
    error::{Error, Result},
    item::{AudioFormat, AudioQuality, Song},
};

/// Callback invoked synchronously from the fetch worker as the tool reports
/// percent-complete.
pub trait ProgressObserver: Send + Sync {
    fn on_progress(&self, percent: f64, message: &str);
}

/// Boundary to the external download/transcode tool.
#[async_trait]
pub trait TrackFetcher: Send + Sync {
    /// Fetches `song` into `output_path` in the requested format and
    /// quality, reporting progress along the way.
    ///
    /// Implementations must observe `cancel` and terminate promptly —
    /// killing the external process rather than waiting it out.
    async fn fetch(
        &self,
        song: &Song,
        output_path: &Path,
        format: AudioFormat,
        quality: AudioQuality,
        progress: &dyn ProgressObserver,
        cancel: &CancellationToken,
    ) -> Result<()>;
}

/// Fetcher shelling out to yt-dlp.
pub struct YtDlpFetcher {
    tool: PathBuf,
}

impl YtDlpFetcher {
    /// Cap on stderr carried into error messages.
    const STDERR_EXCERPT: usize = 512;

    #[must_use]
    pub fn new(tool: PathBuf) -> Self {
        Self { tool }
    }

    /// Builds the tool's format selector for the requested format and
    /// quality tier.
    ///
    /// Prefers official audio sources over video soundtracks and pins
    /// bitrate windows per tier.
    #[must_use]
    pub fn format_selector(format: AudioFormat, quality: AudioQuality) -> String {
        const BASE: &str = "bestaudio[acodec!=opus]/bestaudio";

        match quality {
            AudioQuality::High => match format {
                AudioFormat::Mp3 => format!("{BASE}[abr>=256]/bestaudio"),
                AudioFormat::Flac => format!("{BASE}[acodec=flac]/bestaudio"),
                AudioFormat::Wav => format!("{BASE}/bestaudio"),
                AudioFormat::Ogg => format!("{BASE}[acodec=vorbis]/bestaudio"),
                AudioFormat::M4a => format!("bestaudio[ext=m4a][abr>=256]/{BASE}"),
            },
            AudioQuality::Medium => format!("{BASE}[abr>=192][abr<=256]/{BASE}"),
            AudioQuality::Low => format!("{BASE}[abr>=128][abr<=192]/{BASE}"),
        }
    }

    fn build_command(
        &self,
        url: &str,
        output_path: &Path,
        format: AudioFormat,
        quality: AudioQuality,
    ) -> Command {
        let mut cmd = Command::new(&self.tool);
        cmd.arg("-f")
            .arg(Self::format_selector(format, quality))
            .arg("-o")
            .arg(output_path)
            .args([
                "--extract-audio",
                "--audio-format",
                format.as_str(),
                "--audio-quality",
                "0",
                "--no-playlist",
                "--no-warnings",
                "--newline",
                "--retries",
                "10",
                "--fragment-retries",
                "10",
            ]);

        match format {
            AudioFormat::Mp3 | AudioFormat::M4a => {
                cmd.args(["--postprocessor-args", "-ar 44100 -ac 2"]);
            }
            AudioFormat::Flac => {
                cmd.args(["--postprocessor-args", "-compression_level 12 -sample_fmt s16"]);
            }
            AudioFormat::Wav | AudioFormat::Ogg => {}
        }

        cmd.arg(url)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

/// Extracts a percent-complete value from one line of tool output.
///
/// The tool prints download progress as `[download]  42.7% of ...`.
fn parse_progress(line: &str) -> Option<f64> {
    static PROGRESS: OnceLock<Regex> = OnceLock::new();
    let regex = PROGRESS.get_or_init(|| {
        Regex::new(r"\[download\]\s+([0-9]+(?:\.[0-9]+)?)%").expect("invalid progress regex")
    });

    regex
        .captures(line)
        .and_then(|captures| captures.get(1))
        .and_then(|percent| percent.as_str().parse().ok())
}

#[async_trait]
impl TrackFetcher for YtDlpFetcher {
    async fn fetch(
        &self,
        song: &Song,
        output_path: &Path,
        format: AudioFormat,
        quality: AudioQuality,
        progress: &dyn ProgressObserver,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let url = song.source_url()?;
        debug!("fetching {song} from {url}");

        let mut child = self
            .build_command(&url, output_path, format, quality)
            .spawn()
            .map_err(|e| Error::fetch(format!("could not run {}: {e}", self.tool.display())))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::fetch("tool stdout unavailable"))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::fetch("tool stderr unavailable"))?;

        // Drain stderr concurrently so the child can't block on a full pipe.
        let stderr_task = tokio::spawn(async move {
            let mut buffer = String::new();
            let _ = stderr.read_to_string(&mut buffer).await;
            buffer
        });

        let message = format!("Downloading: {}", song.title);
        let mut lines = BufReader::new(stdout).lines();
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("cancelling fetch of {song}");
                    if let Err(e) = child.kill().await {
                        warn!("could not kill fetch process for {song}: {e}");
                    }
                    stderr_task.abort();
                    return Err(Error::cancelled(format!("fetch of {song} cancelled")));
                }
                line = lines.next_line() => {
                    match line {
                        Ok(Some(line)) => {
                            trace!("tool output: {line}");
                            if let Some(percent) = parse_progress(&line) {
                                progress.on_progress(percent, &message);
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            warn!("error reading tool output for {song}: {e}");
                            break;
                        }
                    }
                }
            }
        }

        let status = tokio::select! {
            () = cancel.cancelled() => {
                info!("cancelling fetch of {song}");
                if let Err(e) = child.kill().await {
                    warn!("could not kill fetch process for {song}: {e}");
                }
                stderr_task.abort();
                return Err(Error::cancelled(format!("fetch of {song} cancelled")));
            }
            status = child.wait() => {
                status.map_err(|e| Error::fetch(format!("tool did not exit cleanly: {e}")))?
            }
        };

        let diagnostics = stderr_task.await.unwrap_or_default();

        if !status.success() {
            // The tool sometimes reports a nonzero exit for non-fatal
            // post-processing complaints while still producing the file.
            if output_path.exists() {
                warn!("tool exited with {status} but produced {}", output_path.display());
            } else {
                let excerpt: String = diagnostics
                    .trim()
                    .chars()
                    .take(Self::STDERR_EXCERPT)
                    .collect();
                return Err(Error::fetch(format!(
                    "tool exited with {status} for {song}: {excerpt}"
                )));
            }
        } else if !output_path.exists() {
            return Err(Error::fetch(format!(
                "tool reported success but produced no file for {song}"
            )));
        }

        progress.on_progress(100.0, &message);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_progress_lines() {
        assert_eq!(
            parse_progress("[download]  42.7% of 3.52MiB at 1.21MiB/s ETA 00:02"),
            Some(42.7)
        );
        assert_eq!(parse_progress("[download] 100% of 3.52MiB"), Some(100.0));
        assert_eq!(parse_progress("[ExtractAudio] Destination: x.mp3"), None);
        assert_eq!(parse_progress("[download] Destination: x.webm"), None);
    }

    #[test]
    fn selector_varies_by_format_and_quality() {
        let high_mp3 = YtDlpFetcher::format_selector(AudioFormat::Mp3, AudioQuality::High);
        assert!(high_mp3.contains("abr>=256"));

        let high_flac = YtDlpFetcher::format_selector(AudioFormat::Flac, AudioQuality::High);
        assert!(high_flac.contains("acodec=flac"));

        let medium = YtDlpFetcher::format_selector(AudioFormat::Mp3, AudioQuality::Medium);
        assert!(medium.contains("abr>=192"));
        assert!(medium.contains("abr<=256"));

        let low = YtDlpFetcher::format_selector(AudioFormat::Ogg, AudioQuality::Low);
        assert!(low.contains("abr>=128"));
    }
}
