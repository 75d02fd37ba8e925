use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use clap::Parser;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod error;
mod player;
mod providers;
mod session;
mod store;
mod tracker;
mod types;

use config::AppConfig;
use error::{ResolveError, TrackerError};
use providers::{SourceProvider, allanime::AllAnimeClient, prioritize_links};
use session::{PlaybackSession, SessionController, reconcile_remote};
use store::WatchStore;
use tracker::AniListClient;
use types::{EpisodeReference, Translation};

#[derive(Debug, Parser)]
#[command(
    name = "anisync",
    about = "Stream tracked episodes into mpv and keep watch progress in sync.",
    version
)]
struct Cli {
    /// Tracker id of the show to play.
    #[arg(long, value_name = "ID")]
    show_id: Option<i64>,

    /// Episode to play instead of the next unwatched one.
    #[arg(short = 'e', long, value_name = "EPISODE")]
    episode: Option<u32>,

    #[arg(long)]
    dub: bool,

    /// Resume the last watched show without any arguments.
    #[arg(short = 'c', long = "continue")]
    continue_last: bool,

    /// Skip the remote tracker entirely.
    #[arg(long)]
    untracked: bool,

    /// Drop the local watch entry for --show-id and exit.
    #[arg(long)]
    forget: bool,

    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Search words used to link the show on the catalog.
    #[arg(value_name = "QUERY")]
    query: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("anisync=info")),
        )
        .init();

    let result = run().await;
    if let Err(err) = &result {
        eprintln!("error: {err:?}");
    }
    result
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    let cfg = AppConfig::load(cli.config.as_deref())?;
    if cli.config.is_none()
        && let Some(path) = config::default_config_path()
        && !path.exists()
        && let Err(err) = cfg.write_file(&path)
    {
        warn!("could not seed default config file: {err:#}");
    }
    let timeout = Duration::from_secs(cfg.request_timeout_secs);
    let storage_dir = cfg.storage_dir()?;
    let store = WatchStore::open(&storage_dir)?;

    if cli.forget {
        let show_id = cli
            .show_id
            .ok_or_else(|| anyhow!("--forget needs --show-id"))?;
        store.remove(show_id)?;
        println!("Dropped local watch entry for show {show_id}.");
        return Ok(());
    }

    let translation = if cli.dub {
        Translation::Dub
    } else {
        cfg.translation
    };

    let tracker = if cli.untracked {
        None
    } else {
        match tracker::read_token(&storage_dir)? {
            Some(token) => Some(AniListClient::new(token, timeout)?),
            None => bail!(
                "no tracker credential at {}; put a bearer token there or pass --untracked",
                storage_dir.join("token").display()
            ),
        }
    };

    let show_id = if cli.continue_last {
        store
            .read_last_watched()?
            .ok_or_else(|| anyhow!("no last watched show recorded yet"))?
    } else {
        cli.show_id
            .ok_or_else(|| anyhow!("pass --show-id, or --continue to resume the last session"))?
    };

    let local = store.find(show_id)?;
    let remote = match &tracker {
        Some(client) => match client.list_entry(show_id).await {
            Ok(entry) => {
                debug!(
                    "tracker has show {} at {}/{}",
                    entry.progress.show_id, entry.progress.progress, entry.progress.total_episodes
                );
                Some(entry)
            }
            Err(TrackerError::NotFound(_)) => {
                warn!("show {show_id} is not on the tracker list");
                None
            }
            Err(TrackerError::Auth) => {
                return Err(TrackerError::Auth).context("tracker rejected the stored credential");
            }
            Err(err) => {
                warn!("tracker read failed, continuing from local state: {err}");
                None
            }
        },
        None => None,
    };

    // Local history names the episode to resume; the tracker supplies the
    // next unwatched one for a fresh start, and wins outright when ahead.
    let mut episode = cli
        .episode
        .or_else(|| local.as_ref().map(|e| e.episode))
        .or_else(|| remote.as_ref().map(|r| r.progress.progress + 1))
        .unwrap_or(1);
    let mut playback_secs = local
        .as_ref()
        .filter(|e| e.episode == episode)
        .map(|e| e.playback_secs)
        .unwrap_or(0);
    if cli.episode.is_none()
        && let Some(remote) = &remote
    {
        (episode, playback_secs) = reconcile_remote(episode, playback_secs, &remote.progress);
    }

    let title = remote
        .as_ref()
        .map(|r| r.title.clone())
        .filter(|t| !t.is_empty())
        .or_else(|| local.as_ref().map(|e| e.title.clone()))
        .unwrap_or_else(|| cli.query.join(" "));
    let total_episodes = remote
        .as_ref()
        .map(|r| r.progress.total_episodes)
        .unwrap_or(0);
    let score = local.as_ref().map(|e| e.score).unwrap_or(0.0);

    let provider = AllAnimeClient::new(timeout)?;
    let provider_show_id = match local.as_ref().map(|e| e.provider_show_id.clone()) {
        Some(id) if !id.is_empty() => id,
        _ => {
            let query = if cli.query.is_empty() {
                title.clone()
            } else {
                cli.query.join(" ")
            };
            if query.trim().is_empty() {
                bail!("no search terms available to link show {show_id} on the catalog; pass a QUERY");
            }
            link_show_on_catalog(&provider, &query, translation).await?
        }
    };

    let reference = EpisodeReference {
        show_id: provider_show_id.clone(),
        episode,
        translation,
    };
    info!(
        "resolving {title} episode {episode} ({})",
        translation.label()
    );
    let links = provider.resolve(&reference).await?;
    if links.is_empty() {
        return Err(ResolveError::NoSources {
            show_id: provider_show_id,
            episode,
        })
        .context("try another episode with --episode, or rerun later");
    }
    let links = prioritize_links(links);
    info!("{} link(s) resolved", links.len());

    let media_title = format!("{title} - Episode {episode}");
    let handle = player::launch_player(&cfg.player, &links[0].url, &media_title).await?;
    println!("{media_title}");

    store.write_last_watched(show_id)?;

    let session = PlaybackSession {
        player: handle,
        show_id,
        provider_show_id,
        episode,
        title,
        total_episodes,
        score,
        position_secs: playback_secs,
        duration_secs: 0,
    };

    let controller = SessionController::new(store, tracker, cfg.completion_threshold);
    let session_handle = controller.spawn(session);

    let stopper = session_handle.stopper();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received; finalizing session");
            stopper.stop();
        }
    });

    let outcome = session_handle.join().await?;
    if outcome.completed {
        println!(
            "Marked episode {} watched{}.",
            outcome.episode - 1,
            if outcome.progress_pushed {
                " and synced to the tracker"
            } else {
                ""
            }
        );
    } else {
        println!(
            "Stopped at {} in episode {}.",
            format_position(outcome.position_secs),
            outcome.episode
        );
    }
    Ok(())
}

async fn link_show_on_catalog(
    provider: &impl SourceProvider,
    query: &str,
    translation: Translation,
) -> Result<String> {
    let shows = provider.search_shows(query, translation).await?;
    if shows.is_empty() {
        bail!("no catalog results for \"{query}\" ({})", translation.label());
    }
    let chosen = shows
        .iter()
        .find(|s| s.title.eq_ignore_ascii_case(query))
        .unwrap_or(&shows[0]);
    info!(
        "linked \"{query}\" to {} ({} episodes, id {})",
        chosen.title, chosen.available_episodes, chosen.id
    );
    Ok(chosen.id.clone())
}

fn format_position(secs: u32) -> String {
    format!("{:02}:{:02}", secs / 60, secs % 60)
}
