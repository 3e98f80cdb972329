// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use colored::Colorize;
use console::Emoji;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;
use url::Url;

use recast_dl::{
    CoordinatorConfig, CoordinatorError, DEFAULT_MAX_CONCURRENT, DownloadCoordinator,
    DownloadEvent, DownloadStatus, Episode, EpisodeId, HttpTransferSession, JsonRecordStore,
    PersistPolicy, RecordStore, ReqwestClient, ToggleAction, load_feed,
};

// Emoji with fallback for terminals without Unicode support
static MICROPHONE: Emoji<'_, '_> = Emoji("🎙️  ", "");
static SEARCH: Emoji<'_, '_> = Emoji("🔍 ", "[~] ");
static HEADPHONES: Emoji<'_, '_> = Emoji("🎧 ", "[i] ");
static DOWNLOAD: Emoji<'_, '_> = Emoji("📥 ", "[v] ");
static RESUME: Emoji<'_, '_> = Emoji("⏯️  ", "[>] ");
static SUCCESS: Emoji<'_, '_> = Emoji("✅ ", "[+] ");
static FAILURE: Emoji<'_, '_> = Emoji("❌ ", "[!] ");
static PAUSE: Emoji<'_, '_> = Emoji("⏸️  ", "[=] ");
static PARTY: Emoji<'_, '_> = Emoji("🎉 ", "[*] ");
static FOLDER: Emoji<'_, '_> = Emoji("📁 ", "");
static CROSS: Emoji<'_, '_> = Emoji("✗ ", "x ");

/// Resolution of the per-episode progress bars
const BAR_STEPS: u64 = 1000;

/// Download podcast episodes in the background, resuming interrupted ones
#[derive(Parser, Debug)]
#[command(name = "recast-dl")]
#[command(about = "Download podcast episodes with resumable background transfers")]
#[command(version)]
struct Args {
    /// Audio URL of the episode, or feed URL/path with --feed
    #[arg(required_unless_present = "list")]
    source: Option<String>,

    /// Stable episode identifier (defaults to the audio URL; with --feed,
    /// the feed item's guid)
    episode: Option<String>,

    /// Treat SOURCE as an RSS feed URL or local file
    #[arg(short, long)]
    feed: bool,

    /// Number of newest feed episodes to download when no EPISODE is given
    #[arg(short, long, default_value = "1")]
    limit: usize,

    /// Directory finished episodes are written to
    #[arg(short = 'd', long, default_value = "downloads")]
    download_dir: PathBuf,

    /// Download record store (defaults to <DOWNLOAD_DIR>/downloads.json)
    #[arg(short, long)]
    store: Option<PathBuf>,

    /// Maximum number of concurrent transfers
    #[arg(short = 'c', long, default_value_t = DEFAULT_MAX_CONCURRENT)]
    concurrent: usize,

    /// What to do when the record store cannot be written
    #[arg(long, default_value_t = PersistPolicy::Log)]
    persist_policy: PersistPolicy,

    /// Episode title used for the local filename
    #[arg(long)]
    title: Option<String>,

    /// Print downloaded episodes and exit
    #[arg(long)]
    list: bool,

    /// Quiet mode - suppress progress output
    #[arg(short, long)]
    quiet: bool,
}

/// Renders coordinator events as one progress bar per episode
struct Reporter {
    multi: Option<MultiProgress>,
    bars: HashMap<EpisodeId, ProgressBar>,
    style: ProgressStyle,
}

impl Reporter {
    fn new(quiet: bool) -> Result<Self> {
        let style = ProgressStyle::default_bar()
            .template("  {prefix}[{bar:30.cyan/blue}] {percent:>3}% {wide_msg}")?
            .progress_chars("█▓░");

        Ok(Self {
            multi: (!quiet).then(MultiProgress::new),
            bars: HashMap::new(),
            style,
        })
    }

    fn add(&mut self, episode: &Episode, resumed: bool) {
        let Some(multi) = self.multi.as_ref() else {
            return;
        };

        let bar = multi.add(ProgressBar::new(BAR_STEPS));
        bar.set_style(self.style.clone());
        bar.set_prefix(if resumed {
            RESUME.to_string()
        } else {
            DOWNLOAD.to_string()
        });
        bar.set_message(truncate_title(&episode.title, 40));
        self.bars.insert(episode.id.clone(), bar);
    }

    fn handle(&mut self, event: &DownloadEvent, title: &str) {
        match event {
            DownloadEvent::Progress {
                episode_id,
                fraction,
                ..
            } => {
                if let Some(bar) = self.bars.get(episode_id) {
                    bar.set_position((fraction * BAR_STEPS as f64) as u64);
                }
            }

            DownloadEvent::Completed { episode_id, .. } => {
                if let Some(bar) = self.bars.remove(episode_id) {
                    bar.set_position(BAR_STEPS);
                    bar.finish_with_message(format!(
                        "{SUCCESS}{}",
                        truncate_title(title, 40).green()
                    ));
                }
            }

            DownloadEvent::Failed {
                episode_id, reason, ..
            } => {
                if let Some(bar) = self.bars.remove(episode_id) {
                    bar.abandon_with_message(format!(
                        "{FAILURE}{} - {}",
                        truncate_title(title, 30).red(),
                        reason.red()
                    ));
                }
            }

            DownloadEvent::Canceled {
                episode_id,
                resumable,
                ..
            } => {
                if let Some(bar) = self.bars.remove(episode_id) {
                    let note = if *resumable {
                        "paused, run again to resume"
                    } else {
                        "canceled"
                    };
                    bar.abandon_with_message(format!(
                        "{PAUSE}{} - {}",
                        truncate_title(title, 30).yellow(),
                        note.dimmed()
                    ));
                }
            }
        }
    }

    fn line(&self, message: String) {
        match self.multi.as_ref() {
            Some(multi) => {
                let _ = multi.println(message);
            }
            None => debug!("{message}"),
        }
    }
}

#[derive(Debug, Default)]
struct Summary {
    downloaded: usize,
    skipped: usize,
    paused: usize,
    failed: Vec<(String, String)>,
}

impl Summary {
    fn record(&mut self, event: &DownloadEvent, title: &str) {
        match event {
            DownloadEvent::Completed { .. } => self.downloaded += 1,
            DownloadEvent::Canceled { .. } => self.paused += 1,
            DownloadEvent::Failed { reason, .. } => {
                self.failed.push((title.to_string(), reason.clone()))
            }
            DownloadEvent::Progress { .. } => {}
        }
    }
}

fn truncate_title(title: &str, max_len: usize) -> String {
    if title.chars().count() <= max_len {
        title.to_string()
    } else {
        let head: String = title.chars().take(max_len.saturating_sub(3)).collect();
        format!("{head}...")
    }
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("recast_dl=warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Episodes to download for this invocation
async fn select_episodes(client: &ReqwestClient, args: &Args, source: &str) -> Result<Vec<Episode>> {
    if !args.feed {
        let url = Url::parse(source).with_context(|| format!("Invalid episode URL: {source}"))?;
        let id = args.episode.clone().unwrap_or_else(|| source.to_string());
        let title = args.title.clone().unwrap_or_else(|| title_from_url(&url, &id));
        return Ok(vec![Episode::new(EpisodeId::new(id), title, url)]);
    }

    let podcast = load_feed(client, source)
        .await
        .with_context(|| format!("Failed to load feed {source}"))?;
    if !args.quiet {
        println!(
            "{HEADPHONES}{} • {} episodes",
            podcast.title.bold().green(),
            podcast.episodes.len().to_string().cyan()
        );
    }

    let mut episodes: Vec<Episode> = match args.episode.as_deref() {
        Some(id) => {
            let episode = podcast
                .episodes
                .into_iter()
                .find(|episode| episode.id.as_str() == id)
                .with_context(|| format!("Episode '{id}' not found in feed"))?;
            vec![episode]
        }
        None => podcast
            .episodes
            .into_iter()
            .filter(|episode| episode.source_url().is_some())
            .take(args.limit)
            .collect(),
    };

    if let Some(title) = args.title.as_ref()
        && let [episode] = episodes.as_mut_slice()
    {
        episode.title = title.clone();
    }
    Ok(episodes)
}

/// Last path segment of the URL without its extension
fn title_from_url(url: &Url, fallback: &str) -> String {
    url.path_segments()
        .and_then(|mut segments| segments.next_back())
        .map(|name| name.rsplit_once('.').map_or(name, |(stem, _)| stem))
        .filter(|stem| !stem.is_empty())
        .unwrap_or(fallback)
        .to_string()
}

fn print_downloaded(store: &dyn RecordStore) {
    let records = store.downloaded();
    if records.is_empty() {
        println!("{}", "No downloaded episodes".dimmed());
        return;
    }

    for record in records {
        let when = record
            .downloaded_at
            .map(|at| at.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_default();
        let path = record
            .path
            .as_ref()
            .map(|path| path.display().to_string())
            .unwrap_or_default();
        println!(
            "{SUCCESS}{} {} {} {}",
            when.dimmed(),
            record.episode_id.to_string().bold(),
            path.cyan(),
            format!("({} bytes)", record.size_bytes.unwrap_or(0)).dimmed()
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing();

    let store_path = args
        .store
        .clone()
        .unwrap_or_else(|| args.download_dir.join("downloads.json"));
    let store = JsonRecordStore::open(&store_path)
        .with_context(|| format!("Failed to open record store {}", store_path.display()))?;

    // Listing only reads; recovering interrupted records is left to the next download
    if args.list {
        print_downloaded(&store);
        return Ok(());
    }

    let client = ReqwestClient::new();
    let (session, transfer_events) = HttpTransferSession::new(client.clone(), args.concurrent);
    let config = CoordinatorConfig {
        download_dir: args.download_dir.clone(),
        persist_policy: args.persist_policy,
        ..CoordinatorConfig::default()
    };
    let coordinator = Arc::new(
        DownloadCoordinator::new(session, Box::new(store), config)
            .context("Failed to start download coordinator")?,
    );
    let pump = coordinator.spawn_event_pump(transfer_events);

    let Some(source) = args.source.as_deref() else {
        bail!("No source given");
    };

    if !args.quiet {
        println!(
            "\n{}{} {}\n",
            MICROPHONE,
            "recast-dl".bold().magenta(),
            "- Podcast Episode Downloader".dimmed()
        );
        if args.feed {
            println!("{SEARCH}Fetching feed: {}", source.cyan());
        }
    }

    let episodes = select_episodes(&client, &args, source).await?;

    // Subscribe before starting anything so no terminal event is missed
    let mut events = coordinator.events().subscribe();
    let mut reporter = Reporter::new(args.quiet)?;
    let mut summary = Summary::default();
    let mut active: HashMap<EpisodeId, Episode> = HashMap::new();

    for episode in episodes {
        match coordinator.toggle(&episode).await {
            Ok(ToggleAction::Started(_)) => {
                reporter.add(&episode, false);
                active.insert(episode.id.clone(), episode);
            }
            Ok(ToggleAction::Resumed(_)) => {
                reporter.add(&episode, true);
                active.insert(episode.id.clone(), episode);
            }
            Ok(ToggleAction::Canceled(_)) => {
                warn!(episode = %episode.id, "toggle canceled a running download");
                summary.paused += 1;
            }
            Err(CoordinatorError::AlreadyDownloaded { .. }) => {
                reporter.line(format!(
                    "  {CROSS}{} {}",
                    truncate_title(&episode.title, 40).dimmed(),
                    "already downloaded".dimmed()
                ));
                summary.skipped += 1;
            }
            Err(e) => summary.failed.push((episode.title.clone(), e.to_string())),
        }
    }

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut interrupted = false;

    while !active.is_empty() {
        tokio::select! {
            received = events.recv() => match received {
                Ok(event) => {
                    let Some(episode) = active.get(event.episode_id()) else {
                        continue;
                    };
                    let title = episode.title.clone();
                    reporter.handle(&event, &title);
                    if event.is_terminal() {
                        summary.record(&event, &title);
                        active.remove(event.episode_id());
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event receiver lagged, checking records");
                    let ids: Vec<EpisodeId> = active.keys().cloned().collect();
                    for id in ids {
                        let status = coordinator.status(&id).await;
                        if status.is_some_and(|status| status != DownloadStatus::Pending) {
                            if let Some(episode) = active.remove(&id) {
                                match status {
                                    Some(DownloadStatus::Succeeded) => summary.downloaded += 1,
                                    Some(DownloadStatus::Canceled) => summary.paused += 1,
                                    _ => summary
                                        .failed
                                        .push((episode.title, "see record store".to_string())),
                                }
                            }
                        }
                    }
                }
                Err(RecvError::Closed) => break,
            },
            _ = &mut ctrl_c, if !interrupted => {
                interrupted = true;
                reporter.line(format!("{PAUSE}{}", "Interrupted, pausing downloads...".yellow()));
                let in_flight: Vec<Episode> = active.values().cloned().collect();
                for episode in in_flight {
                    if let Err(e) = coordinator.cancel(&episode).await {
                        debug!(episode = %episode.id, error = %e, "cancel on interrupt");
                    }
                }
            }
        }
    }
    pump.abort();

    if !args.quiet {
        println!(
            "\n{PARTY}{} {} downloaded, {} skipped, {} paused, {} failed",
            "Done:".bold().green(),
            summary.downloaded.to_string().green().bold(),
            summary.skipped.to_string().yellow(),
            summary.paused.to_string().yellow(),
            if summary.failed.is_empty() {
                "0".green()
            } else {
                summary.failed.len().to_string().red().bold()
            }
        );

        if !summary.failed.is_empty() {
            println!("\n{}", "Failed episodes:".red().bold());
            for (title, error) in &summary.failed {
                println!("  {}{} - {}", CROSS, title.yellow(), error.dimmed());
            }
        }

        println!(
            "\n{FOLDER}Output: {}\n",
            args.download_dir.display().to_string().cyan()
        );
    }

    if !summary.failed.is_empty() && summary.downloaded == 0 {
        std::process::exit(1);
    }

    Ok(())
}
