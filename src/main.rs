use std::{path::PathBuf, process, sync::Arc, time::Duration};

use clap::{Parser, ValueEnum, ValueHint};
use log::{debug, error, info, warn, LevelFilter};
use url::Url;

use tunepull::{
    config::Settings,
    events::{self, Event},
    fetcher::YtDlpFetcher,
    item::{Artist, AudioFormat, AudioQuality, Release, Song, WorkItem},
    queue::{DownloadStatus, QueueManager},
    resolver::YtDlpResolver,
    tagger::LoftyTagger,
};

/// Profile to display when not built in release mode.
#[cfg(debug_assertions)]
const BUILD_PROFILE: &str = "debug";
/// Profile to display when built in release mode.
#[cfg(not(debug_assertions))]
const BUILD_PROFILE: &str = "release";

/// Group name for mutually exclusive logging options.
const ARGS_GROUP_LOGGING: &str = "logging";

/// The kind of catalog item behind a URL.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, ValueEnum)]
enum Kind {
    #[default]
    Song,
    Release,
    Artist,
}

/// Command line arguments as parsed by `clap`.
#[derive(Clone, Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Catalog URLs to download
    #[arg(required = true, value_hint = ValueHint::Url)]
    urls: Vec<String>,

    /// What the URLs point at
    #[arg(short, long, value_enum, default_value = "song")]
    kind: Kind,

    /// Track title, for naming and tagging single songs
    #[arg(long)]
    title: Option<String>,

    /// Artist name, for naming and tagging single songs
    #[arg(long)]
    artist: Option<String>,

    /// Album title, for naming and tagging single songs
    #[arg(long)]
    album: Option<String>,

    /// Audio format to produce
    ///
    /// [default: from settings]
    #[arg(short, long)]
    format: Option<AudioFormat>,

    /// Audio quality tier
    ///
    /// [default: from settings]
    #[arg(short = 'Q', long)]
    quality: Option<AudioQuality>,

    /// Download directory, overriding settings
    #[arg(short, long, value_name = "DIR", value_hint = ValueHint::DirPath)]
    dir: Option<PathBuf>,

    /// Concurrent download slots, overriding settings
    #[arg(short, long)]
    threads: Option<usize>,

    /// Settings file
    ///
    /// [default: per-user configuration directory]
    #[arg(short, long, value_name = "FILE", value_hint = ValueHint::FilePath)]
    settings_file: Option<PathBuf>,

    /// Path to the external download tool
    #[arg(long, value_name = "FILE", value_hint = ValueHint::FilePath, default_value = "yt-dlp")]
    tool: PathBuf,

    /// Suppresses all output except warnings and errors.
    #[arg(short = 'q', long, default_value_t = false, group = ARGS_GROUP_LOGGING)]
    quiet: bool,

    /// Enable verbose logging
    ///
    /// Specify twice for trace logging.
    #[arg(short, long, action = clap::ArgAction::Count, group = ARGS_GROUP_LOGGING)]
    verbose: u8,
}

/// Initializes the logger facade.
///
/// The logging level is determined as follows, in order of precedence from
/// highest to lowest:
/// 1. Command line arguments
/// 2. `RUST_LOG` environment variable
/// 3. Hard coded default
///
/// # Panics
///
/// Panics when a logger facade is already initialized.
fn init_logger(args: &Args) {
    let mut logger = env_logger::Builder::from_env(
        // Note: if you change the default logging level here, then you should
        // probably also change the verbosity levels below.
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
    );

    if args.quiet || args.verbose > 0 {
        let level = match args.verbose {
            0 => {
                // Quiet and verbose are mutually exclusive, and `verbose` is 0
                // by default. So this arm means: quiet mode.
                LevelFilter::Warn
            }
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        };

        // Filter log messages of external crates.
        logger.filter_module("tunepull", level);
    }

    logger.init();
}

/// Extracts a stable catalog id from a URL: the `v` or `list` query
/// parameter when present, the last path segment otherwise.
fn catalog_id(url: &str) -> String {
    if let Ok(parsed) = Url::parse(url) {
        for (key, value) in parsed.query_pairs() {
            if key == "v" || key == "list" {
                return value.into_owned();
            }
        }
        if let Some(segment) = parsed
            .path_segments()
            .and_then(|segments| segments.rev().find(|segment| !segment.is_empty()))
        {
            return segment.to_string();
        }
    }
    url.to_string()
}

/// Builds the work item for one URL from the command line arguments.
fn work_item(args: &Args, url: &str) -> WorkItem {
    let id = catalog_id(url);
    match args.kind {
        Kind::Song => WorkItem::Song(Song {
            video_id: id.clone(),
            id,
            title: args.title.clone().unwrap_or_default(),
            artist: args.artist.clone().unwrap_or_default(),
            album: args.album.clone().unwrap_or_default(),
            url: url.to_string(),
            ..Song::default()
        }),
        Kind::Release => WorkItem::Release(Release {
            id,
            title: args.title.clone().unwrap_or_default(),
            artist: args.artist.clone().unwrap_or_default(),
            url: url.to_string(),
            ..Release::default()
        }),
        Kind::Artist => WorkItem::Artist(Artist {
            id,
            name: args.artist.clone().or_else(|| args.title.clone()).unwrap_or_default(),
            url: url.to_string(),
            ..Artist::default()
        }),
    }
}

fn render_event(event: &Event) {
    match event {
        Event::StatusChanged {
            entry_id,
            status,
            message,
        } => {
            if message.is_empty() {
                info!("{entry_id}: {status}");
            } else {
                info!("{entry_id}: {status} ({message})");
            }
        }
        Event::Progress {
            entry_id,
            percent,
            message,
        } => debug!("{entry_id}: {percent:.1}% - {message}"),
        Event::MetadataResolved { entry_id, item } => {
            info!("{entry_id}: resolved {item}");
        }
        Event::NetworkStatus { connected } => {
            if *connected {
                info!("network connection restored");
            } else {
                warn!("network connection lost, downloads paused");
            }
        }
    }
}

/// Main application loop: enqueue every URL and report events until the
/// queue drains or the user interrupts.
///
/// # Errors
///
/// Returns an error when the queue manager cannot be constructed.
async fn run(args: Args) -> Result<bool, Box<dyn std::error::Error>> {
    let settings_path = args
        .settings_file
        .clone()
        .unwrap_or_else(Settings::default_path);
    let mut settings = Settings::load(&settings_path);

    if let Some(dir) = &args.dir {
        settings.download_dir.clone_from(dir);
    }
    if let Some(threads) = args.threads {
        settings.threads = threads.max(1);
    }
    if let Some(format) = args.format {
        settings.format = format;
    }
    if let Some(quality) = args.quality {
        settings.quality = quality;
    }

    let (sink, mut events) = events::channel();
    let manager = QueueManager::new(
        settings,
        Arc::new(YtDlpResolver::new(args.tool.clone())),
        Arc::new(YtDlpFetcher::new(args.tool.clone())),
        Arc::new(LoftyTagger),
        sink,
    )?;
    manager.start();

    for url in &args.urls {
        let entry_id = manager.enqueue(work_item(&args, url), None, None);
        debug!("queued {url} as {entry_id}");
    }

    loop {
        tokio::select! {
            // Prioritize shutdown signals.
            biased;

            _ = tokio::signal::ctrl_c() => {
                info!("shutting down gracefully");
                manager.shutdown();
                break;
            }

            event = events.recv() => {
                match event {
                    Some(event) => render_event(&event),
                    None => break,
                }
                if manager.is_idle() {
                    break;
                }
            }

            // Status events land before slots are released; poll for the
            // drained queue instead of waiting on an event that won't come.
            () = tokio::time::sleep(Duration::from_millis(500)) => {
                if manager.is_idle() {
                    break;
                }
            }
        }
    }

    let failed = manager
        .snapshot()
        .iter()
        .any(|entry| entry.status == DownloadStatus::Failed);
    Ok(!failed)
}

/// Main entry point of the application.
///
/// This function initializes the logger facade, parses the command line
/// arguments, and starts the main application loop.
#[tokio::main]
async fn main() {
    // `clap` handles our command line arguments and help text.
    let args = Args::parse();
    init_logger(&args);

    // Dump command line arguments before we do anything more.
    // This aids in debugging of whatever comes next.
    debug!("Command {args:#?}");

    info!(
        "starting {}/{}; {BUILD_PROFILE}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION")
    );

    match run(args).await {
        Ok(true) => {}
        Ok(false) => process::exit(1),
        Err(e) => {
            error!("{e}");
            process::exit(1);
        }
    }
}
