//! Download queue and concurrency scheduler.
//!
//! The [`QueueManager`] owns every queued [`WorkItem`] for its whole
//! lifetime: it expands collections through the metadata resolver, admits
//! entries into a bounded set of download slots, fans a release's tracks out
//! over a secondary pool, aggregates per-leaf outcomes back into the entry,
//! and reports everything through the event stream.
//!
//! Two background tasks keep the machine moving: a dispatch loop that wakes
//! on a short interval to admit work, and a network monitor that probes
//! connectivity and pauses admission while offline. Neither consumes a
//! download slot.
//!
//! Locking: the queue map and active set live behind a single mutex that is
//! held only for field updates, never across an await point. Blocking work
//! (the external fetch, metadata resolution) always happens off the
//! dispatch loop on spawned tasks.

use std::{
    collections::{HashMap, HashSet},
    fmt, fs,
    path::PathBuf,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::{Duration, SystemTime},
};

use tokio::{sync::Semaphore, task::JoinSet, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::{
    config::Settings,
    dedup,
    error::{Error, Result},
    events::{Event, EventSink},
    fetcher::{ProgressObserver, TrackFetcher},
    http,
    item::{Artist, AudioFormat, AudioQuality, Release, Song, WorkItem},
    naming,
    resolver::{self, MetadataResolver},
    tagger::{TagFields, Tagger},
};

/// Lifecycle of a queue entry.
///
/// `Pending` is the initial sub-state of collection entries that still need
/// their children resolved; everything else follows
/// `Queued → Downloading → Processing → Completed`, with `Failed` and
/// `Cancelled` reachable from any non-terminal state.
#[derive(Copy, Clone, Debug, Default, Hash, PartialEq, Eq)]
pub enum DownloadStatus {
    /// Waiting for metadata expansion.
    Pending,
    #[default]
    Queued,
    Downloading,
    /// File exists on disk, tags being written.
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl DownloadStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            DownloadStatus::Completed | DownloadStatus::Failed | DownloadStatus::Cancelled
        )
    }
}

impl fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            DownloadStatus::Pending => "Pending Metadata",
            DownloadStatus::Queued => "Queued",
            DownloadStatus::Downloading => "Downloading",
            DownloadStatus::Processing => "Processing Metadata",
            DownloadStatus::Completed => "Completed",
            DownloadStatus::Failed => "Failed",
            DownloadStatus::Cancelled => "Cancelled",
        };
        f.write_str(text)
    }
}

/// One queued unit of work wrapping a [`WorkItem`].
///
/// Mutated exclusively by the queue manager under its lock; the UI boundary
/// only ever sees clones obtained through [`QueueManager::snapshot`].
#[derive(Clone, Debug)]
pub struct DownloadEntry {
    pub id: String,
    pub item: WorkItem,
    pub status: DownloadStatus,
    /// Overall progress in percent, 0–100.
    pub progress: f64,
    /// Empty unless the entry failed.
    pub error_message: String,
    /// Resolved output file (single song) or directory (collection).
    pub output_path: PathBuf,
    pub format: AudioFormat,
    pub quality: AudioQuality,
    /// The child currently being downloaded, for collections.
    pub current_song: Option<Song>,
    /// Expected leaf count. Always at least 1.
    pub total_songs: usize,
    /// Leaves finished so far, whether skipped as duplicates or fetched.
    pub completed_songs: usize,
}

struct EntryState {
    entry: DownloadEntry,
    cancel: CancellationToken,
    /// An expansion task for this entry is in flight.
    expanding: bool,
    /// Release ids whose track counts were estimated because their
    /// resolution failed during expansion.
    estimated_releases: HashSet<String>,
}

struct State {
    entries: HashMap<String, EntryState>,
    /// Entry ids currently occupying a download slot.
    active: HashSet<String>,
    network_connected: bool,
}

struct Inner {
    state: Mutex<State>,
    settings: Mutex<Settings>,
    /// Secondary pool bounding a collection's internal fan-out. Swapped
    /// wholesale on resize so in-flight permits drain on the old pool.
    song_pool: Mutex<Arc<Semaphore>>,
    events: EventSink,
    resolver: Arc<dyn MetadataResolver>,
    fetcher: Arc<dyn TrackFetcher>,
    tagger: Arc<dyn Tagger>,
    http: http::Client,
    shutdown: CancellationToken,
}

/// Recovers from a poisoned lock: the last value before the panic is still
/// the best value we have.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The download queue and its scheduler.
#[derive(Clone)]
pub struct QueueManager {
    inner: Arc<Inner>,
}

impl QueueManager {
    /// How often the dispatch loop wakes to admit work.
    const DISPATCH_INTERVAL: Duration = Duration::from_millis(500);

    /// How often connectivity is probed.
    const NETWORK_PROBE_INTERVAL: Duration = Duration::from_secs(30);

    /// Budget for a single connectivity probe.
    const NETWORK_PROBE_TIMEOUT: Duration = Duration::from_secs(3);

    /// Reachability target for the connectivity probe.
    const NETWORK_PROBE_URL: &'static str = "https://www.google.com";

    /// Assumed track count for a release whose resolution failed during
    /// artist expansion. Keeps progress accounting moving instead of
    /// failing the whole artist.
    const ESTIMATED_SONGS_PER_RELEASE: usize = 10;

    /// Creates a new queue manager.
    ///
    /// The background loops are not running yet; call [`Self::start`] once
    /// the event receiver is wired up.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(
        settings: Settings,
        resolver: Arc<dyn MetadataResolver>,
        fetcher: Arc<dyn TrackFetcher>,
        tagger: Arc<dyn Tagger>,
        events: EventSink,
    ) -> Result<Self> {
        let user_agent = format!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
        let threads = settings.threads.max(1);

        Ok(Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    entries: HashMap::new(),
                    active: HashSet::new(),
                    network_connected: true,
                }),
                settings: Mutex::new(settings),
                song_pool: Mutex::new(Arc::new(Semaphore::new(threads))),
                events,
                resolver,
                fetcher,
                tagger,
                http: http::Client::new(&user_agent)?,
                shutdown: CancellationToken::new(),
            }),
        })
    }

    /// Starts the dispatch loop and the network monitor.
    pub fn start(&self) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(Self::run_dispatch(inner));

        let inner = Arc::clone(&self.inner);
        tokio::spawn(Self::run_network_monitor(inner));
    }

    /// Adds an item to the download queue and returns its entry id.
    ///
    /// Collections without resolved children start in `Pending` and are
    /// expanded by the background loop; everything else starts in `Queued`.
    pub fn enqueue(
        &self,
        item: WorkItem,
        format: Option<AudioFormat>,
        quality: Option<AudioQuality>,
    ) -> String {
        let (format, quality) = {
            let settings = lock(&self.inner.settings);
            (
                format.unwrap_or(settings.format),
                quality.unwrap_or(settings.quality),
            )
        };

        let (status, total_songs) = match &item {
            WorkItem::Song(_) => (DownloadStatus::Queued, 1),
            WorkItem::Release(release) => {
                if release.songs.is_empty() {
                    (DownloadStatus::Pending, 1)
                } else {
                    (DownloadStatus::Queued, release.selected_songs().len().max(1))
                }
            }
            WorkItem::Artist(artist) => {
                let has_songs = artist.releases.iter().any(|release| !release.songs.is_empty());
                let total = artist
                    .releases
                    .iter()
                    .map(|release| release.songs.len().max(1))
                    .sum::<usize>()
                    .max(1);
                if has_songs {
                    (DownloadStatus::Queued, total)
                } else {
                    (DownloadStatus::Pending, total)
                }
            }
        };

        let timestamp = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map_or(0, |elapsed| elapsed.as_secs());
        let base = format!("{}_{}_{timestamp}", item.kind(), item.id());

        let entry_id = {
            let mut state = lock(&self.inner.state);

            let mut entry_id = base.clone();
            let mut suffix = 1;
            while state.entries.contains_key(&entry_id) {
                entry_id = format!("{base}_{suffix}");
                suffix += 1;
            }

            state.entries.insert(
                entry_id.clone(),
                EntryState {
                    entry: DownloadEntry {
                        id: entry_id.clone(),
                        item,
                        status,
                        progress: 0.0,
                        error_message: String::new(),
                        output_path: PathBuf::new(),
                        format,
                        quality,
                        current_song: None,
                        total_songs,
                        completed_songs: 0,
                    },
                    cancel: CancellationToken::new(),
                    expanding: false,
                    estimated_releases: HashSet::new(),
                },
            );
            entry_id
        };

        info!("enqueued {entry_id} as {status}");
        self.inner.events.send(Event::StatusChanged {
            entry_id: entry_id.clone(),
            status,
            message: String::new(),
        });
        entry_id
    }

    /// Cancels an entry.
    ///
    /// An entry that is not yet occupying a slot is removed from the queue
    /// synchronously with a single `Cancelled` notification. An active
    /// entry is flagged; the executing task observes the flag, terminates
    /// the external fetch, and reports `Cancelled` itself.
    pub fn cancel(&self, entry_id: &str) {
        let removed = {
            let mut state = lock(&self.inner.state);
            let state = &mut *state;
            let Some(entry_state) = state.entries.get_mut(entry_id) else {
                return;
            };
            if entry_state.entry.status.is_terminal() {
                return;
            }

            if state.active.contains(entry_id) {
                entry_state.entry.status = DownloadStatus::Cancelled;
                entry_state.cancel.cancel();
                false
            } else {
                entry_state.cancel.cancel();
                state.entries.remove(entry_id);
                true
            }
        };

        if removed {
            info!("removed {entry_id} from queue");
            self.inner.events.send(Event::StatusChanged {
                entry_id: entry_id.to_string(),
                status: DownloadStatus::Cancelled,
                message: String::new(),
            });
        }
    }

    /// Removes all entries in a terminal state. Active entries are never
    /// touched; entries are never auto-expired.
    pub fn clear_finished(&self) {
        let mut state = lock(&self.inner.state);
        state
            .entries
            .retain(|_, entry_state| !entry_state.entry.status.is_terminal());
    }

    /// Read-only clones of every entry, for display.
    #[must_use]
    pub fn snapshot(&self) -> Vec<DownloadEntry> {
        lock(&self.inner.state)
            .entries
            .values()
            .map(|entry_state| entry_state.entry.clone())
            .collect()
    }

    /// Read-only clone of a single entry.
    #[must_use]
    pub fn entry(&self, entry_id: &str) -> Option<DownloadEntry> {
        lock(&self.inner.state)
            .entries
            .get(entry_id)
            .map(|entry_state| entry_state.entry.clone())
    }

    /// Number of entries currently occupying a download slot.
    #[must_use]
    pub fn active_count(&self) -> usize {
        lock(&self.inner.state).active.len()
    }

    /// Whether every entry has reached a terminal state and no task is
    /// still winding down.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        let state = lock(&self.inner.state);
        state.active.is_empty()
            && state
                .entries
                .values()
                .all(|entry_state| entry_state.entry.status.is_terminal() && !entry_state.expanding)
    }

    #[must_use]
    pub fn network_connected(&self) -> bool {
        lock(&self.inner.state).network_connected
    }

    /// Changes the concurrent download limit at runtime.
    ///
    /// The primary pool picks the new limit up on the next dispatch tick;
    /// the secondary pool is replaced, letting in-flight permits drain on
    /// the old one.
    pub fn set_threads(&self, threads: usize) {
        let threads = threads.max(1);
        lock(&self.inner.settings).threads = threads;
        *lock(&self.inner.song_pool) = Arc::new(Semaphore::new(threads));
        info!("thread limit set to {threads}");
    }

    /// Stops the background loops and cancels everything still active.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();

        let mut state = lock(&self.inner.state);
        let state = &mut *state;
        for entry_id in &state.active {
            if let Some(entry_state) = state.entries.get_mut(entry_id) {
                if !entry_state.entry.status.is_terminal() {
                    entry_state.entry.status = DownloadStatus::Cancelled;
                }
                entry_state.cancel.cancel();
            }
        }
    }

    /// The dispatch loop. Wakes on an interval instead of busy-spinning,
    /// and never dies on behalf of an individual entry.
    async fn run_dispatch(inner: Arc<Inner>) {
        let mut interval = tokio::time::interval(Self::DISPATCH_INTERVAL);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = inner.shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }
            Self::dispatch_once(&inner);
        }
        debug!("dispatch loop stopped");
    }

    /// One admission pass: starts expansions for `Pending` entries and
    /// fills free download slots with `Queued` ones.
    ///
    /// Admission order follows map iteration order; callers must not depend
    /// on FIFO behavior.
    fn dispatch_once(inner: &Arc<Inner>) {
        let threads = lock(&inner.settings).threads.max(1);

        let mut to_download = Vec::new();
        let mut to_expand = Vec::new();
        {
            let mut state = lock(&inner.state);
            let state = &mut *state;

            // While offline, neither admission nor expansion makes progress.
            if !state.network_connected {
                return;
            }

            let available = threads.saturating_sub(state.active.len());
            for (entry_id, entry_state) in &state.entries {
                match entry_state.entry.status {
                    DownloadStatus::Queued
                        if !state.active.contains(entry_id) && to_download.len() < available =>
                    {
                        to_download.push(entry_id.clone());
                    }
                    DownloadStatus::Pending if !entry_state.expanding => {
                        to_expand.push(entry_id.clone());
                    }
                    _ => {}
                }
            }

            for entry_id in &to_download {
                state.active.insert(entry_id.clone());
            }
            for entry_id in &to_expand {
                if let Some(entry_state) = state.entries.get_mut(entry_id) {
                    entry_state.expanding = true;
                }
            }
        }

        for entry_id in to_expand {
            let inner = Arc::clone(inner);
            tokio::spawn(async move {
                Self::expand_entry(&inner, &entry_id).await;
            });
        }

        for entry_id in to_download {
            Self::set_status(inner, &entry_id, DownloadStatus::Downloading, "");
            let inner = Arc::clone(inner);
            tokio::spawn(async move {
                Self::run_entry(&inner, &entry_id).await;
            });
        }
    }

    /// The connectivity monitor. Flips the shared flag and notifies the UI;
    /// it never cancels in-flight downloads.
    async fn run_network_monitor(inner: Arc<Inner>) {
        loop {
            let connected = inner
                .http
                .probe(Self::NETWORK_PROBE_URL, Self::NETWORK_PROBE_TIMEOUT)
                .await;

            let changed = {
                let mut state = lock(&inner.state);
                if state.network_connected == connected {
                    false
                } else {
                    state.network_connected = connected;
                    true
                }
            };

            if changed {
                if connected {
                    info!("network connection restored");
                } else {
                    warn!("network connection lost, pausing dispatch");
                }
                inner.events.send(Event::NetworkStatus { connected });
            }

            tokio::select! {
                () = inner.shutdown.cancelled() => break,
                () = tokio::time::sleep(Self::NETWORK_PROBE_INTERVAL) => {}
            }
        }
        debug!("network monitor stopped");
    }

    /// Resolves a collection's children and promotes the entry to `Queued`,
    /// or fails it when the resolver does.
    async fn expand_entry(inner: &Arc<Inner>, entry_id: &str) {
        let item = {
            let state = lock(&inner.state);
            state
                .entries
                .get(entry_id)
                .map(|entry_state| entry_state.entry.item.clone())
        };
        // Cancelled and removed while we were getting started.
        let Some(item) = item else {
            return;
        };

        let outcome = match item {
            WorkItem::Release(mut release) => inner
                .resolver
                .resolve_release(&release.url, &release.id)
                .await
                .map(|resolved| {
                    release.songs = resolved.songs;
                    if release.year.is_empty() {
                        release.year = resolved.year;
                    }
                    let total = release.selected_songs().len();
                    (WorkItem::Release(release), total, HashSet::new())
                }),
            WorkItem::Artist(mut artist) => match inner
                .resolver
                .resolve_artist(&artist.url, &artist.id)
                .await
            {
                Ok(resolved) => {
                    artist.releases = resolved.releases;
                    let (total, estimated) = Self::expand_artist_releases(inner, &mut artist).await;
                    Ok((WorkItem::Artist(artist), total, estimated))
                }
                Err(e) => Err(e),
            },
            // A song never needs expansion; promote it as-is.
            WorkItem::Song(song) => Ok((WorkItem::Song(song), 1, HashSet::new())),
        };

        match outcome {
            Ok((item, total, estimated)) => {
                let resolved = {
                    let mut state = lock(&inner.state);
                    let Some(entry_state) = state.entries.get_mut(entry_id) else {
                        return;
                    };
                    entry_state.expanding = false;
                    if entry_state.entry.status == DownloadStatus::Pending {
                        entry_state.entry.item = item.clone();
                        entry_state.entry.total_songs = total.max(1);
                        entry_state.entry.status = DownloadStatus::Queued;
                        entry_state.estimated_releases = estimated;
                        true
                    } else {
                        false
                    }
                };
                if resolved {
                    debug!("expanded {entry_id}");
                    inner.events.send(Event::MetadataResolved {
                        entry_id: entry_id.to_string(),
                        item,
                    });
                }
            }
            Err(e) => {
                error!("expansion of {entry_id} failed: {e}");
                let mut state = lock(&inner.state);
                let Some(entry_state) = state.entries.get_mut(entry_id) else {
                    return;
                };
                entry_state.expanding = false;
                if entry_state.entry.status == DownloadStatus::Pending {
                    entry_state.entry.status = DownloadStatus::Failed;
                    entry_state.entry.error_message = e.to_string();
                    drop(state);
                    inner.events.send(Event::StatusChanged {
                        entry_id: entry_id.to_string(),
                        status: DownloadStatus::Failed,
                        message: e.to_string(),
                    });
                }
            }
        }
    }

    /// Resolves the track list of every release of an artist, sequentially.
    ///
    /// A release whose resolution fails contributes an estimated track
    /// count instead of failing the artist; its id is recorded so the
    /// estimate can be reconciled when the release is resolved again at
    /// download time.
    async fn expand_artist_releases(
        inner: &Arc<Inner>,
        artist: &mut Artist,
    ) -> (usize, HashSet<String>) {
        let mut total = 0;
        let mut estimated = HashSet::new();

        for release in &mut artist.releases {
            if !release.songs.is_empty() {
                total += release.songs.len();
                continue;
            }

            match inner
                .resolver
                .resolve_release(&release.url, &release.id)
                .await
            {
                Ok(resolved) => {
                    release.songs = resolved.songs;
                    if release.year.is_empty() {
                        release.year = resolved.year;
                    }
                    total += release.songs.len();
                }
                Err(e) => {
                    warn!(
                        "could not resolve {release}, estimating {} tracks: {e}",
                        Self::ESTIMATED_SONGS_PER_RELEASE
                    );
                    total += Self::ESTIMATED_SONGS_PER_RELEASE;
                    estimated.insert(release.id.clone());
                }
            }
        }

        (total, estimated)
    }

    /// Runs one admitted entry to a terminal state and frees its slot.
    ///
    /// No error escapes this function; whatever happens inside an entry,
    /// the dispatch loop stays alive.
    async fn run_entry(inner: &Arc<Inner>, entry_id: &str) {
        let context = {
            let state = lock(&inner.state);
            state.entries.get(entry_id).map(|entry_state| {
                (entry_state.entry.item.clone(), entry_state.cancel.clone())
            })
        };

        if let Some((item, cancel)) = context {
            let result = match item {
                WorkItem::Song(song) => {
                    Self::download_leaf(inner, entry_id, song, &cancel, true).await
                }
                WorkItem::Release(release) => {
                    Self::download_release_entry(inner, entry_id, release, &cancel).await
                }
                WorkItem::Artist(artist) => {
                    Self::download_artist_entry(inner, entry_id, artist, &cancel).await
                }
            };

            if let Err(e) = result {
                Self::finish_with_error(inner, entry_id, &e);
            }
        }

        lock(&inner.state).active.remove(entry_id);
    }

    /// Downloads one concrete song.
    ///
    /// For a top-level song entry this drives the entry through
    /// `Downloading → Processing → Completed`; for a collection leaf the
    /// same steps are reflected upward as progress only.
    async fn download_leaf(
        inner: &Arc<Inner>,
        entry_id: &str,
        mut song: Song,
        cancel: &CancellationToken,
        top: bool,
    ) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(Error::cancelled(format!("download of {song} cancelled")));
        }

        // Fail the leaf early when the source reference is unresolvable.
        song.url = song.source_url()?;

        let settings = lock(&inner.settings).clone();
        let (format, quality) = {
            let state = lock(&inner.state);
            let Some(entry_state) = state.entries.get(entry_id) else {
                return Err(Error::cancelled("entry removed"));
            };
            (entry_state.entry.format, entry_state.entry.quality)
        };

        // Best-effort upgrade to higher-fidelity artwork; failures ignored.
        if song.thumbnail_url.is_empty() || song.thumbnail_url.contains("googleusercontent") {
            let release_hint = if song.album.is_empty() {
                song.title.clone()
            } else {
                song.album.clone()
            };
            if let Some(better) =
                resolver::upgrade_artwork(&inner.http, &release_hint, &song.artist).await
            {
                song.thumbnail_url = better;
            }
        }

        let output_dir = naming::output_dir(&settings, &song);
        fs::create_dir_all(&output_dir).map_err(|e| {
            Error::filesystem(format!(
                "failed to create output directory {}: {e}",
                output_dir.display()
            ))
        })?;
        let output_path = output_dir.join(naming::file_name(&settings, &song, format));

        {
            let mut state = lock(&inner.state);
            if let Some(entry_state) = state.entries.get_mut(entry_id) {
                entry_state.entry.current_song = Some(song.clone());
                if top {
                    entry_state.entry.output_path = output_path.clone();
                }
            }
        }

        // Idempotence: an already-present file short-circuits as completed
        // without invoking the fetcher.
        let duplicate = settings.check_duplicates
            && dedup::scan_dir(&output_dir, &song.title, &song.artist, format);
        if duplicate || output_path.exists() {
            info!("skipping {song}: already exists");
            Self::complete_leaf(inner, entry_id, &song, top, true);
            return Ok(());
        }

        if cancel.is_cancelled() {
            return Err(Error::cancelled(format!("download of {song} cancelled")));
        }

        let relay = ProgressRelay {
            inner: Arc::clone(inner),
            entry_id: entry_id.to_string(),
            top,
        };
        inner
            .fetcher
            .fetch(&song, &output_path, format, quality, &relay, cancel)
            .await?;

        if top {
            Self::set_status(inner, entry_id, DownloadStatus::Processing, "");
        }

        // Tag the produced file; failures are logged but never fatal.
        let cover = if song.thumbnail_url.starts_with("http") {
            inner.http.get_bytes(&song.thumbnail_url).await.ok()
        } else {
            None
        };
        let fields = TagFields::from_song(&song);
        if let Err(e) = inner.tagger.tag(&output_path, &fields, cover.as_deref()).await {
            warn!("tagging {} failed (non-fatal): {e}", output_path.display());
        }

        Self::complete_leaf(inner, entry_id, &song, top, false);
        Ok(())
    }

    /// Books a finished leaf: bumps the counter, rolls progress forward and
    /// completes the entry when the leaf was the whole unit of work.
    fn complete_leaf(inner: &Arc<Inner>, entry_id: &str, song: &Song, top: bool, skipped: bool) {
        let update = {
            let mut state = lock(&inner.state);
            let Some(entry_state) = state.entries.get_mut(entry_id) else {
                return;
            };
            let entry = &mut entry_state.entry;

            entry.completed_songs += 1;
            // An estimated total can undershoot; never let the counters cross.
            entry.total_songs = entry.total_songs.max(entry.completed_songs);

            if top {
                entry.progress = 100.0;
                entry.status = DownloadStatus::Completed;
                (100.0, true)
            } else {
                #[expect(clippy::cast_precision_loss)]
                let percent =
                    (entry.completed_songs as f64 / entry.total_songs as f64) * 100.0;
                entry.progress = entry.progress.max(percent);
                (entry.progress, false)
            }
        };

        let (percent, completed) = update;
        if completed {
            inner.events.send(Event::StatusChanged {
                entry_id: entry_id.to_string(),
                status: DownloadStatus::Completed,
                message: String::new(),
            });
        }

        let message = if skipped {
            format!("Already exists: {}", song.title)
        } else {
            format!("Completed: {}", song.title)
        };
        inner.events.send(Event::Progress {
            entry_id: entry_id.to_string(),
            percent,
            message,
        });
    }

    /// Downloads a top-level release entry and applies the collection
    /// aggregation rules.
    async fn download_release_entry(
        inner: &Arc<Inner>,
        entry_id: &str,
        release: Release,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let title = release.title.clone();
        let (successes, attempted, errors) =
            Self::download_release_inner(inner, entry_id, release, cancel, true).await?;

        Self::finish_collection(
            inner,
            entry_id,
            successes,
            &errors,
            format!("Downloaded {successes}/{attempted} songs"),
            format!("Failed to download release: {title}"),
        );
        Ok(())
    }

    /// Downloads the songs of one release concurrently through the
    /// secondary pool. Returns `(successes, attempted, error messages)`.
    ///
    /// When the release arrives without children (a direct enqueue that
    /// skipped expansion, or an estimated release inside an artist), they
    /// are resolved here, with a best-effort artwork upgrade propagated to
    /// every child.
    async fn download_release_inner(
        inner: &Arc<Inner>,
        entry_id: &str,
        mut release: Release,
        cancel: &CancellationToken,
        is_entry_item: bool,
    ) -> Result<(usize, usize, Vec<String>)> {
        let settings = lock(&inner.settings).clone();

        let release_dir = settings
            .download_dir
            .join(naming::sanitize(&release.artist))
            .join(naming::sanitize(&release.title));
        fs::create_dir_all(&release_dir).map_err(|e| {
            Error::filesystem(format!(
                "failed to create output directory {}: {e}",
                release_dir.display()
            ))
        })?;

        if is_entry_item {
            let mut state = lock(&inner.state);
            if let Some(entry_state) = state.entries.get_mut(entry_id) {
                entry_state.entry.output_path = release_dir.clone();
            }
        }

        if release.songs.is_empty() {
            let resolved = inner
                .resolver
                .resolve_release(&release.url, &release.id)
                .await?;
            release.songs = resolved.songs;
            if release.year.is_empty() {
                release.year = resolved.year;
            }

            if let Some(better) =
                resolver::upgrade_artwork(&inner.http, &release.title, &release.artist).await
            {
                release.thumbnail_url = better;
            }
            if !release.thumbnail_url.is_empty() {
                for song in &mut release.songs {
                    song.thumbnail_url = release.thumbnail_url.clone();
                }
            }

            if is_entry_item {
                let mut state = lock(&inner.state);
                if let Some(entry_state) = state.entries.get_mut(entry_id) {
                    entry_state.entry.total_songs = release.selected_songs().len().max(1);
                }
            }
        }

        if release.songs.is_empty() {
            return Err(Error::resolution(format!(
                "no songs found in release: {}",
                release.title
            )));
        }

        let mut selected = release.selected_songs();
        for song in &mut selected {
            if song.album.is_empty() {
                song.album = release.title.clone();
            }
            if song.artist.is_empty() {
                song.artist = release.artist.clone();
            }
            if song.year.is_empty() {
                song.year = release.year.clone();
            }
        }

        let attempted = selected.len();
        let song_pool = lock(&inner.song_pool).clone();
        let mut workers: JoinSet<(String, Result<()>)> = JoinSet::new();

        for song in selected {
            // Checkpoint before starting each song.
            if cancel.is_cancelled() {
                return Err(Error::cancelled(format!(
                    "download of {} cancelled",
                    release.title
                )));
            }

            let counters = {
                let mut state = lock(&inner.state);
                state.entries.get_mut(entry_id).map(|entry_state| {
                    let entry = &mut entry_state.entry;
                    entry.current_song = Some(song.clone());
                    (entry.completed_songs, entry.total_songs.max(1))
                })
            };
            if let Some((completed, total)) = counters {
                #[expect(clippy::cast_precision_loss)]
                let percent = (completed as f64 / total as f64) * 100.0;
                inner.events.send(Event::Progress {
                    entry_id: entry_id.to_string(),
                    percent,
                    message: format!("Downloading {}/{total}: {}", completed + 1, song.title),
                });
            }

            let inner = Arc::clone(inner);
            let entry_id = entry_id.to_string();
            let cancel = cancel.clone();
            let song_pool = Arc::clone(&song_pool);
            workers.spawn(async move {
                let _permit = song_pool.acquire_owned().await;
                let title = song.title.clone();
                let result = Self::download_leaf(&inner, &entry_id, song, &cancel, false).await;
                (title, result)
            });
        }

        let mut successes = 0;
        let mut errors = Vec::new();
        let mut cancelled = false;
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok((_, Ok(()))) => successes += 1,
                Ok((_, Err(e))) if e.is_cancelled() => cancelled = true,
                Ok((title, Err(e))) => {
                    error!("error downloading {title}: {e}");
                    errors.push(format!("Error downloading {title}: {e}"));
                }
                Err(e) => errors.push(format!("download worker failed: {e}")),
            }
        }

        if cancelled || cancel.is_cancelled() {
            return Err(Error::cancelled(format!(
                "download of {} cancelled",
                release.title
            )));
        }

        Ok((successes, attempted, errors))
    }

    /// Downloads a top-level artist entry: releases strictly sequentially,
    /// songs within each release concurrently.
    ///
    /// A failed release does not stop subsequent releases; the artist is
    /// completed iff at least one release succeeded.
    async fn download_artist_entry(
        inner: &Arc<Inner>,
        entry_id: &str,
        mut artist: Artist,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let settings = lock(&inner.settings).clone();

        let artist_dir = settings.download_dir.join(naming::sanitize(&artist.name));
        fs::create_dir_all(&artist_dir).map_err(|e| {
            Error::filesystem(format!(
                "failed to create output directory {}: {e}",
                artist_dir.display()
            ))
        })?;

        {
            let mut state = lock(&inner.state);
            if let Some(entry_state) = state.entries.get_mut(entry_id) {
                entry_state.entry.output_path = artist_dir;
            }
        }

        // Normally expansion has run by now; resolve here for entries that
        // were enqueued with a partial discography.
        if artist.releases.is_empty() {
            inner.events.send(Event::Progress {
                entry_id: entry_id.to_string(),
                percent: 0.0,
                message: format!("Fetching artist details: {}", artist.name),
            });

            let resolved = inner
                .resolver
                .resolve_artist(&artist.url, &artist.id)
                .await?;
            artist.releases = resolved.releases;
            let (total, estimated) = Self::expand_artist_releases(inner, &mut artist).await;

            let mut state = lock(&inner.state);
            if let Some(entry_state) = state.entries.get_mut(entry_id) {
                entry_state.entry.total_songs = total.max(1);
                entry_state.estimated_releases = estimated;
            }
        }

        if artist.releases.is_empty() {
            return Err(Error::resolution(format!(
                "no releases found for artist: {}",
                artist.name
            )));
        }

        let total_releases = artist.releases.len();
        let mut successes = 0;
        let mut failed_releases = Vec::new();

        for mut release in artist.releases {
            // Checkpoint before starting each release.
            if cancel.is_cancelled() {
                return Err(Error::cancelled(format!(
                    "download of {} cancelled",
                    artist.name
                )));
            }

            {
                let state = lock(&inner.state);
                let progress = state
                    .entries
                    .get(entry_id)
                    .map_or(0.0, |entry_state| entry_state.entry.progress);
                drop(state);
                inner.events.send(Event::Progress {
                    entry_id: entry_id.to_string(),
                    percent: progress,
                    message: format!(
                        "Downloading release {}/{total_releases}: {}",
                        successes + 1,
                        release.title
                    ),
                });
            }

            // An estimated release gets a second resolution attempt; its
            // estimate is reconciled against the real track count.
            if release.songs.is_empty() {
                match inner
                    .resolver
                    .resolve_release(&release.url, &release.id)
                    .await
                {
                    Ok(resolved) if !resolved.songs.is_empty() => {
                        release.songs = resolved.songs;
                        Self::reconcile_estimate(inner, entry_id, &release);
                    }
                    Ok(_) => {
                        failed_releases
                            .push(format!("{}: no songs found in release", release.title));
                        continue;
                    }
                    Err(e) => {
                        failed_releases.push(format!("{}: {e}", release.title));
                        continue;
                    }
                }
            }

            match Self::download_release_inner(inner, entry_id, release.clone(), cancel, false)
                .await
            {
                Ok((successes_in_release, _, errors)) if successes_in_release > 0 => {
                    successes += 1;
                    if !errors.is_empty() {
                        warn!(
                            "{} finished with {} failed tracks",
                            release.title,
                            errors.len()
                        );
                    }
                }
                Ok((_, _, errors)) => {
                    failed_releases.push(format!("{}: {}", release.title, errors.join("; ")));
                }
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => failed_releases.push(format!("{}: {e}", release.title)),
            }
        }

        Self::finish_collection(
            inner,
            entry_id,
            successes,
            &failed_releases,
            format!("Downloaded {successes}/{total_releases} releases"),
            format!("Failed to download any releases for: {}", artist.name),
        );
        Ok(())
    }

    /// Replaces an estimated track count with the real one once a release
    /// resolves at download time.
    fn reconcile_estimate(inner: &Arc<Inner>, entry_id: &str, release: &Release) {
        let mut state = lock(&inner.state);
        let Some(entry_state) = state.entries.get_mut(entry_id) else {
            return;
        };
        if !entry_state.estimated_releases.remove(&release.id) {
            return;
        }

        let actual = release.selected_songs().len();
        let entry = &mut entry_state.entry;
        entry.total_songs = (entry.total_songs + actual)
            .saturating_sub(Self::ESTIMATED_SONGS_PER_RELEASE)
            .max(entry.completed_songs)
            .max(1);
    }

    /// Applies the collection aggregation rules and emits the terminal
    /// status: failed only when zero children succeeded (or, under strict
    /// collections, when any child failed), completed with a
    /// partial-success message otherwise.
    fn finish_collection(
        inner: &Arc<Inner>,
        entry_id: &str,
        successes: usize,
        errors: &[String],
        success_message: String,
        failure_message: String,
    ) {
        let strict = lock(&inner.settings).strict_collections;
        let failed = successes == 0 || (strict && !errors.is_empty());

        {
            let mut state = lock(&inner.state);
            let Some(entry_state) = state.entries.get_mut(entry_id) else {
                return;
            };
            if entry_state.entry.status.is_terminal() {
                return;
            }
            if failed {
                entry_state.entry.status = DownloadStatus::Failed;
                entry_state.entry.error_message = errors.join("\n");
            } else {
                entry_state.entry.status = DownloadStatus::Completed;
            }
        }

        let (status, message) = if failed {
            (DownloadStatus::Failed, failure_message)
        } else {
            (DownloadStatus::Completed, success_message)
        };
        inner.events.send(Event::StatusChanged {
            entry_id: entry_id.to_string(),
            status,
            message,
        });
    }

    /// Moves an entry to its terminal state after its task returned an
    /// error, folding cancellation and failure into the right status.
    fn finish_with_error(inner: &Arc<Inner>, entry_id: &str, error: &Error) {
        let status = {
            let mut state = lock(&inner.state);
            let Some(entry_state) = state.entries.get_mut(entry_id) else {
                return;
            };
            if entry_state.entry.status == DownloadStatus::Completed {
                return;
            }

            if error.is_cancelled() || entry_state.entry.status == DownloadStatus::Cancelled {
                entry_state.entry.status = DownloadStatus::Cancelled;
                DownloadStatus::Cancelled
            } else {
                entry_state.entry.status = DownloadStatus::Failed;
                entry_state.entry.error_message = error.to_string();
                DownloadStatus::Failed
            }
        };

        let message = if status == DownloadStatus::Cancelled {
            String::new()
        } else {
            error!("{entry_id} failed: {error}");
            error.to_string()
        };
        inner.events.send(Event::StatusChanged {
            entry_id: entry_id.to_string(),
            status,
            message,
        });
    }

    /// Sets an entry status and notifies listeners.
    fn set_status(inner: &Arc<Inner>, entry_id: &str, status: DownloadStatus, message: &str) {
        {
            let mut state = lock(&inner.state);
            let Some(entry_state) = state.entries.get_mut(entry_id) else {
                return;
            };
            entry_state.entry.status = status;
        }
        inner.events.send(Event::StatusChanged {
            entry_id: entry_id.to_string(),
            status,
            message: message.to_string(),
        });
    }
}

/// Translates fetcher percent callbacks into entry progress.
///
/// A collection leaf's local fraction is scaled into the parent's overall
/// share; progress never rolls backwards even when concurrent leaves report
/// out of order.
struct ProgressRelay {
    inner: Arc<Inner>,
    entry_id: String,
    top: bool,
}

impl ProgressObserver for ProgressRelay {
    fn on_progress(&self, percent: f64, message: &str) {
        let overall = {
            let mut state = lock(&self.inner.state);
            let Some(entry_state) = state.entries.get_mut(&self.entry_id) else {
                return;
            };
            let entry = &mut entry_state.entry;

            let overall = if self.top {
                percent
            } else {
                #[expect(clippy::cast_precision_loss)]
                let total = entry.total_songs.max(1) as f64;
                #[expect(clippy::cast_precision_loss)]
                let completed = entry.completed_songs as f64;
                ((completed + percent / 100.0) / total) * 100.0
            };
            entry.progress = entry.progress.max(overall);
            entry.progress
        };

        self.inner.events.send(Event::Progress {
            entry_id: self.entry_id.clone(),
            percent: overall,
            message: message.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use tokio::sync::mpsc::UnboundedReceiver;

    use super::*;
    use crate::resolver::{ResolvedArtist, ResolvedRelease};

    fn test_song(id: &str, title: &str, artist: &str) -> Song {
        Song {
            id: id.to_string(),
            title: title.to_string(),
            artist: artist.to_string(),
            album: String::new(),
            url: format!("https://music.youtube.com/watch?v={id}"),
            video_id: id.to_string(),
            thumbnail_url: "cover.jpg".to_string(),
            selected: true,
            ..Song::default()
        }
    }

    fn test_release(id: &str, title: &str, artist: &str, songs: Vec<Song>) -> Release {
        Release {
            id: id.to_string(),
            title: title.to_string(),
            artist: artist.to_string(),
            url: format!("https://music.youtube.com/browse/{id}"),
            thumbnail_url: "cover.jpg".to_string(),
            songs,
            ..Release::default()
        }
    }

    #[derive(Default)]
    struct MockResolver {
        releases: HashMap<String, ResolvedRelease>,
        artists: HashMap<String, ResolvedArtist>,
    }

    #[async_trait]
    impl MetadataResolver for MockResolver {
        async fn resolve_release(&self, _url: &str, id: &str) -> Result<ResolvedRelease> {
            self.releases
                .get(id)
                .cloned()
                .ok_or_else(|| Error::resolution(format!("catalog unreachable for {id}")))
        }

        async fn resolve_artist(&self, _url: &str, id: &str) -> Result<ResolvedArtist> {
            self.artists
                .get(id)
                .cloned()
                .ok_or_else(|| Error::resolution(format!("catalog unreachable for {id}")))
        }
    }

    /// Fetcher double that writes the output file instead of shelling out.
    #[derive(Default)]
    struct MockFetcher {
        /// Titles that should fail with a fetch error.
        fail_titles: HashSet<String>,
        /// Titles that block until cancelled, standing in for a long
        /// external process.
        block_titles: HashSet<String>,
        calls: Mutex<Vec<String>>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl MockFetcher {
        fn fetched_titles(&self) -> Vec<String> {
            lock(&self.calls).clone()
        }
    }

    #[async_trait]
    impl TrackFetcher for MockFetcher {
        async fn fetch(
            &self,
            song: &Song,
            output_path: &std::path::Path,
            _format: AudioFormat,
            _quality: AudioQuality,
            progress: &dyn ProgressObserver,
            cancel: &CancellationToken,
        ) -> Result<()> {
            lock(&self.calls).push(song.title.clone());

            let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(running, Ordering::SeqCst);

            let result = async {
                if self.block_titles.contains(&song.title) {
                    cancel.cancelled().await;
                    return Err(Error::cancelled(format!("fetch of {song} cancelled")));
                }

                progress.on_progress(50.0, "Downloading");
                tokio::time::sleep(Duration::from_millis(20)).await;
                if self.fail_titles.contains(&song.title) {
                    return Err(Error::fetch(format!("tool exited with 1 for {song}")));
                }

                fs::write(output_path, b"audio").map_err(Error::from)?;
                progress.on_progress(100.0, "Downloading");
                Ok(())
            }
            .await;

            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            result
        }
    }

    struct MockTagger;

    #[async_trait]
    impl Tagger for MockTagger {
        async fn tag(
            &self,
            _path: &std::path::Path,
            _fields: &TagFields,
            _cover: Option<&[u8]>,
        ) -> Result<()> {
            Ok(())
        }
    }

    struct Harness {
        manager: QueueManager,
        fetcher: Arc<MockFetcher>,
        events: UnboundedReceiver<Event>,
        _download_dir: tempfile::TempDir,
    }

    fn harness_with(resolver: MockResolver, fetcher: MockFetcher, threads: usize) -> Harness {
        let download_dir = tempfile::tempdir().unwrap();
        let settings = Settings {
            download_dir: download_dir.path().to_path_buf(),
            threads,
            use_album_folders: false,
            ..Settings::default()
        };

        let fetcher = Arc::new(fetcher);
        let (sink, events) = crate::events::channel();
        let manager = QueueManager::new(
            settings,
            Arc::new(resolver),
            Arc::clone(&fetcher) as Arc<dyn TrackFetcher>,
            Arc::new(MockTagger),
            sink,
        )
        .unwrap();

        Harness {
            manager,
            fetcher,
            events,
            _download_dir: download_dir,
        }
    }

    fn harness() -> Harness {
        harness_with(MockResolver::default(), MockFetcher::default(), 3)
    }

    /// Drives dispatch manually until the entry reaches a terminal state.
    async fn wait_terminal(manager: &QueueManager, entry_id: &str) -> DownloadEntry {
        for _ in 0..500 {
            QueueManager::dispatch_once(&manager.inner);
            if let Some(entry) = manager.entry(entry_id) {
                if entry.status.is_terminal() {
                    return entry;
                }
            } else {
                panic!("entry {entry_id} disappeared while waiting");
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("entry {entry_id} never reached a terminal state");
    }

    async fn wait_status(manager: &QueueManager, entry_id: &str, status: DownloadStatus) {
        for _ in 0..500 {
            QueueManager::dispatch_once(&manager.inner);
            if manager.entry(entry_id).is_some_and(|entry| entry.status == status) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("entry {entry_id} never reached {status}");
    }

    fn drain(events: &mut UnboundedReceiver<Event>) -> Vec<Event> {
        let mut collected = Vec::new();
        while let Ok(event) = events.try_recv() {
            collected.push(event);
        }
        collected
    }

    fn cancelled_events(events: &[Event], id: &str) -> usize {
        events
            .iter()
            .filter(|event| {
                matches!(
                    event,
                    Event::StatusChanged { entry_id, status, .. }
                        if entry_id == id && *status == DownloadStatus::Cancelled
                )
            })
            .count()
    }

    #[tokio::test]
    async fn song_entry_counts_one() {
        let h = harness();
        let id = h.manager.enqueue(
            WorkItem::Song(test_song("v1", "Hello", "Jane Doe")),
            None,
            None,
        );

        let entry = h.manager.entry(&id).unwrap();
        assert_eq!(entry.status, DownloadStatus::Queued);
        assert_eq!(entry.total_songs, 1);

        let entry = wait_terminal(&h.manager, &id).await;
        assert_eq!(entry.status, DownloadStatus::Completed);
        assert_eq!(entry.completed_songs, 1);
        assert!((entry.progress - 100.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn release_downloads_only_selected_songs() {
        const TITLES: [&str; 10] = [
            "Alpha", "Bravo", "Charlie", "Delta", "Echo", "Foxtrot", "Golf", "Hotel", "India",
            "Juliett",
        ];
        let mut songs: Vec<Song> = TITLES
            .iter()
            .enumerate()
            .map(|(i, title)| test_song(&format!("v{i}"), title, "Jane Doe"))
            .collect();
        for song in songs.iter_mut().take(3) {
            song.selected = false;
        }

        let h = harness();
        let id = h.manager.enqueue(
            WorkItem::Release(test_release("r1", "Greatest", "Jane Doe", songs)),
            None,
            None,
        );

        let entry = h.manager.entry(&id).unwrap();
        assert_eq!(entry.total_songs, 7);

        let entry = wait_terminal(&h.manager, &id).await;
        assert_eq!(entry.status, DownloadStatus::Completed);
        assert_eq!(entry.completed_songs, 7);
        assert_eq!(entry.total_songs, 7);

        let fetched = h.fetcher.fetched_titles();
        assert_eq!(fetched.len(), 7);
        assert!(!fetched
            .iter()
            .any(|title| title == "Alpha" || title == "Bravo" || title == "Charlie"));
    }

    #[tokio::test]
    async fn pending_release_expands_before_download() {
        let songs = vec![
            test_song("v1", "One", "Jane Doe"),
            test_song("v2", "Two", "Jane Doe"),
        ];
        let mut resolver = MockResolver::default();
        resolver.releases.insert(
            "r1".to_string(),
            ResolvedRelease {
                songs,
                year: "1999".to_string(),
            },
        );

        let mut h = harness_with(resolver, MockFetcher::default(), 3);
        let id = h.manager.enqueue(
            WorkItem::Release(test_release("r1", "Greatest", "Jane Doe", Vec::new())),
            None,
            None,
        );
        assert_eq!(
            h.manager.entry(&id).unwrap().status,
            DownloadStatus::Pending
        );

        let entry = wait_terminal(&h.manager, &id).await;
        assert_eq!(entry.status, DownloadStatus::Completed);
        assert_eq!(entry.total_songs, 2);
        assert_eq!(entry.completed_songs, 2);

        let events = drain(&mut h.events);
        assert!(events.iter().any(|event| {
            matches!(event, Event::MetadataResolved { entry_id, .. } if *entry_id == id)
        }));
    }

    #[tokio::test]
    async fn resolver_failure_fails_pending_entry() {
        // Resolver knows nothing, so expansion must fail.
        let h = harness();
        let id = h.manager.enqueue(
            WorkItem::Release(test_release("r404", "Ghost", "Nobody", Vec::new())),
            None,
            None,
        );

        let entry = wait_terminal(&h.manager, &id).await;
        assert_eq!(entry.status, DownloadStatus::Failed);
        assert!(entry.error_message.contains("catalog unreachable"));
    }

    #[tokio::test]
    async fn cancelling_queued_entry_removes_it() {
        let mut h = harness();
        let id = h.manager.enqueue(
            WorkItem::Song(test_song("v1", "Hello", "Jane Doe")),
            None,
            None,
        );

        h.manager.cancel(&id);
        assert!(h.manager.entry(&id).is_none());
        assert!(h.manager.snapshot().is_empty());

        let events = drain(&mut h.events);
        assert_eq!(cancelled_events(&events, &id), 1);
    }

    #[tokio::test]
    async fn cancelling_active_entry_terminates_fetch() {
        let mut fetcher = MockFetcher::default();
        fetcher.block_titles.insert("Forever".to_string());

        let mut h = harness_with(MockResolver::default(), fetcher, 3);
        let id = h.manager.enqueue(
            WorkItem::Song(test_song("v1", "Forever", "Jane Doe")),
            None,
            None,
        );

        wait_status(&h.manager, &id, DownloadStatus::Downloading).await;
        h.manager.cancel(&id);

        let entry = wait_terminal(&h.manager, &id).await;
        assert_eq!(entry.status, DownloadStatus::Cancelled);
        // The entry stays in the queue until explicitly cleared.
        assert!(h.manager.entry(&id).is_some());

        let events = drain(&mut h.events);
        assert_eq!(cancelled_events(&events, &id), 1);

        h.manager.clear_finished();
        assert!(h.manager.entry(&id).is_none());
    }

    #[tokio::test]
    async fn existing_file_short_circuits_without_fetching() {
        let h = harness();
        let song = test_song("v1", "Hello", "Jane Doe");

        // The file is already on disk from an earlier run.
        let settings = lock(&h.manager.inner.settings).clone();
        let path = naming::output_path(&settings, &song, settings.format);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, b"audio").unwrap();

        let id = h
            .manager
            .enqueue(WorkItem::Song(song.clone()), None, None);
        let entry = wait_terminal(&h.manager, &id).await;
        assert_eq!(entry.status, DownloadStatus::Completed);
        assert!(h.fetcher.fetched_titles().is_empty());

        // Re-running the same enqueue is idempotent.
        let second = h.manager.enqueue(WorkItem::Song(song), None, None);
        let entry = wait_terminal(&h.manager, &second).await;
        assert_eq!(entry.status, DownloadStatus::Completed);
        assert!(h.fetcher.fetched_titles().is_empty());
    }

    #[tokio::test]
    async fn fuzzy_duplicate_short_circuits() {
        let h = harness();
        let song = test_song("v1", "Hello (Official Video)", "Jane Doe");

        let settings = lock(&h.manager.inner.settings).clone();
        let dir = naming::output_dir(&settings, &song);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("jane doe - hello.mp3"), b"audio").unwrap();

        let id = h.manager.enqueue(WorkItem::Song(song), None, None);
        let entry = wait_terminal(&h.manager, &id).await;
        assert_eq!(entry.status, DownloadStatus::Completed);
        assert!(h.fetcher.fetched_titles().is_empty());
    }

    #[tokio::test]
    async fn release_with_all_failures_fails() {
        let songs = vec![
            test_song("v1", "One", "Jane Doe"),
            test_song("v2", "Two", "Jane Doe"),
        ];
        let mut fetcher = MockFetcher::default();
        fetcher.fail_titles.insert("One".to_string());
        fetcher.fail_titles.insert("Two".to_string());

        let h = harness_with(MockResolver::default(), fetcher, 3);
        let id = h.manager.enqueue(
            WorkItem::Release(test_release("r1", "Greatest", "Jane Doe", songs)),
            None,
            None,
        );

        let entry = wait_terminal(&h.manager, &id).await;
        assert_eq!(entry.status, DownloadStatus::Failed);
        assert!(entry.error_message.contains("One"));
        assert!(entry.error_message.contains("Two"));
    }

    #[tokio::test]
    async fn release_partial_failure_completes() {
        let songs = vec![
            test_song("v1", "One", "Jane Doe"),
            test_song("v2", "Two", "Jane Doe"),
        ];
        let mut fetcher = MockFetcher::default();
        fetcher.fail_titles.insert("One".to_string());

        let mut h = harness_with(MockResolver::default(), fetcher, 3);
        let id = h.manager.enqueue(
            WorkItem::Release(test_release("r1", "Greatest", "Jane Doe", songs)),
            None,
            None,
        );

        let entry = wait_terminal(&h.manager, &id).await;
        assert_eq!(entry.status, DownloadStatus::Completed);
        assert!(entry.completed_songs < entry.total_songs);

        let events = drain(&mut h.events);
        let message = events.iter().rev().find_map(|event| match event {
            Event::StatusChanged {
                entry_id,
                status: DownloadStatus::Completed,
                message,
            } if *entry_id == id => Some(message.clone()),
            _ => None,
        });
        assert_eq!(message.unwrap(), "Downloaded 1/2 songs");
    }

    #[tokio::test]
    async fn artist_partial_success_completes_with_summary() {
        let failing = test_release(
            "rA",
            "First",
            "Jane Doe",
            vec![test_song("v1", "Bad", "Jane Doe")],
        );
        let fine = test_release(
            "rB",
            "Second",
            "Jane Doe",
            vec![test_song("v2", "Good", "Jane Doe")],
        );
        let artist = Artist {
            id: "a1".to_string(),
            name: "Jane Doe".to_string(),
            url: "https://music.youtube.com/channel/a1".to_string(),
            thumbnail_url: "cover.jpg".to_string(),
            releases: vec![failing, fine],
        };

        let mut fetcher = MockFetcher::default();
        fetcher.fail_titles.insert("Bad".to_string());

        let mut h = harness_with(MockResolver::default(), fetcher, 3);
        let id = h.manager.enqueue(WorkItem::Artist(artist), None, None);

        let entry = wait_terminal(&h.manager, &id).await;
        assert_eq!(entry.status, DownloadStatus::Completed);

        let events = drain(&mut h.events);
        let message = events.iter().rev().find_map(|event| match event {
            Event::StatusChanged {
                entry_id,
                status: DownloadStatus::Completed,
                message,
            } if *entry_id == id => Some(message.clone()),
            _ => None,
        });
        assert_eq!(message.unwrap(), "Downloaded 1/2 releases");
    }

    #[tokio::test]
    async fn artist_with_all_releases_failing_fails() {
        let first = test_release(
            "rA",
            "First",
            "Jane Doe",
            vec![test_song("v1", "Bad", "Jane Doe")],
        );
        let second = test_release(
            "rB",
            "Second",
            "Jane Doe",
            vec![test_song("v2", "Worse", "Jane Doe")],
        );
        let artist = Artist {
            id: "a1".to_string(),
            name: "Jane Doe".to_string(),
            url: "https://music.youtube.com/channel/a1".to_string(),
            thumbnail_url: "cover.jpg".to_string(),
            releases: vec![first, second],
        };

        let mut fetcher = MockFetcher::default();
        fetcher.fail_titles.insert("Bad".to_string());
        fetcher.fail_titles.insert("Worse".to_string());

        let h = harness_with(MockResolver::default(), fetcher, 3);
        let id = h.manager.enqueue(WorkItem::Artist(artist), None, None);

        let entry = wait_terminal(&h.manager, &id).await;
        assert_eq!(entry.status, DownloadStatus::Failed);
        assert!(!entry.error_message.is_empty());
    }

    #[tokio::test]
    async fn active_set_respects_thread_limit() {
        const TITLES: [&str; 6] = ["Alpha", "Bravo", "Charlie", "Delta", "Echo", "Foxtrot"];
        let h = harness_with(MockResolver::default(), MockFetcher::default(), 2);
        let mut ids = Vec::new();
        for (i, title) in TITLES.iter().enumerate() {
            ids.push(h.manager.enqueue(
                WorkItem::Song(test_song(&format!("v{i}"), title, "Jane Doe")),
                None,
                None,
            ));
        }

        for _ in 0..200 {
            QueueManager::dispatch_once(&h.manager.inner);
            assert!(h.manager.active_count() <= 2);
            if ids.iter().all(|id| {
                h.manager
                    .entry(id)
                    .is_some_and(|entry| entry.status.is_terminal())
            }) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        for id in &ids {
            let entry = h.manager.entry(id).unwrap();
            assert_eq!(entry.status, DownloadStatus::Completed);
            assert_eq!(entry.completed_songs, entry.total_songs);
        }
        // The per-release fan-out shares the same bound.
        assert!(h.fetcher.max_in_flight.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn strict_collections_escalates_partial_failure() {
        let songs = vec![
            test_song("v1", "One", "Jane Doe"),
            test_song("v2", "Two", "Jane Doe"),
        ];
        let mut fetcher = MockFetcher::default();
        fetcher.fail_titles.insert("One".to_string());

        let h = harness_with(MockResolver::default(), fetcher, 3);
        lock(&h.manager.inner.settings).strict_collections = true;

        let id = h.manager.enqueue(
            WorkItem::Release(test_release("r1", "Greatest", "Jane Doe", songs)),
            None,
            None,
        );
        let entry = wait_terminal(&h.manager, &id).await;
        assert_eq!(entry.status, DownloadStatus::Failed);
    }
}
