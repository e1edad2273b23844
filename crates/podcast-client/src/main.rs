use std::path::Path;

use anyhow::Context;
use clap::Parser;
use podcast_client::feed::{FeedBroadcast, FeedHandle, FeedState, FeedSynchronizer, SyncSettings};
use podcast_client::http::HttpEpisodeService;
use podcast_client::mpv::MpvTransport;
use podcast_client::playback::{PlaybackSession, TransportEvent};
use podcast_client::query::{QueryParams, SortDirection, SortKey};
use podcast_proto::config::Config;
use podcast_proto::episode::{Episode, Tone};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

#[derive(Parser, Debug)]
#[command(
    name = "podcast-watch",
    version,
    about = "Follow the episode feed and play episodes with live citations"
)]
struct Cli {
    #[arg(long, help = "Episode service base URL (overrides config)")]
    api: Option<String>,

    #[arg(long, default_value = "", help = "Free-text topic search")]
    search: String,

    #[arg(long)]
    category: Option<String>,

    #[arg(long, help = "Only episodes with this tone")]
    tone: Option<Tone>,

    #[arg(long, default_value = "created_at", help = "created_at, topic or status")]
    sort: SortKey,

    #[arg(long, default_value = "desc", help = "asc or desc")]
    order: SortDirection,

    #[arg(long, value_name = "TOPIC", help = "Submit a new episode")]
    create: Option<String>,

    #[arg(long, default_value = "conversational", help = "Tone for --create")]
    create_tone: Tone,

    #[arg(long, value_name = "ID", help = "Run a failed episode again")]
    regenerate: Option<String>,

    #[arg(long, value_name = "ID", help = "Play a completed episode through mpv")]
    play: Option<String>,
}

type Player = PlaybackSession<MpvTransport>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load().unwrap_or_default();
    if let Some(api) = &cli.api {
        config.api.base_url = api.clone();
    }

    init_logging(&config.paths.log_file)?;
    info!("podcast-watch starting…");

    let service = HttpEpisodeService::new(&config.api)?;
    if let Err(e) = service.health().await {
        warn!("episode service health check failed: {}", e);
        eprintln!("warning: {} is not answering: {}", service.base_url(), e);
    }
    let base_url = service.base_url().to_string();

    let params = QueryParams::default()
        .with_search(cli.search.clone())
        .with_category(cli.category.clone())
        .with_tone(cli.tone)
        .with_sort(cli.sort, cli.order)
        .with_limit(config.feed.page_size);
    let (feed, feed_task) =
        FeedSynchronizer::spawn(service, params, SyncSettings::from_config(&config));
    let mut updates = feed.subscribe();

    if let Some(topic) = &cli.create {
        match feed.create_episode(topic, cli.create_tone).await {
            Ok(ep) => println!("+ {} [{}] {}", ep.id, ep.status.label(), ep.topic),
            Err(e) => eprintln!("create failed: {}", e),
        }
    }
    if let Some(id) = &cli.regenerate {
        match feed.regenerate(id).await {
            Ok(()) => println!("~ {} queued again", id),
            Err(e) => eprintln!("regenerate failed: {}", e),
        }
    }

    let mut player: Option<Player> = None;
    let mut player_events: Option<mpsc::Receiver<TransportEvent>> = None;
    if let Some(id) = &cli.play {
        match start_player(&feed, id, &config, &base_url).await {
            Ok((session, events)) => {
                player = Some(session);
                player_events = Some(events);
            }
            Err(e) => eprintln!("cannot play {}: {:#}", id, e),
        }
    }

    let mut last_listing: Vec<String> = Vec::new();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }

            msg = updates.recv() => match msg {
                Ok(FeedBroadcast::StateUpdated) => {
                    let state = feed.snapshot().await;
                    let listing = render_listing(&state);
                    if listing != last_listing {
                        for line in &listing {
                            println!("{}", line);
                        }
                        last_listing = listing;
                    }
                }
                Ok(FeedBroadcast::EpisodeFailed(n)) => {
                    println!("! failed: {} ({})", n.topic, n.episode_id);
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!("feed updates lagged by {}", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },

            event = next_event(&mut player_events) => match (event, player.as_mut()) {
                (Some(event), Some(session)) => {
                    if session.handle_event(event) {
                        print_active(session);
                    }
                }
                _ => {
                    info!("player events closed");
                    player_events = None;
                }
            },
        }
    }

    feed.shutdown().await;
    let _ = feed_task.await;
    if let Some(mut session) = player {
        let _ = session.stop().await;
    }
    Ok(())
}

fn init_logging(log_path: &Path) -> anyhow::Result<()> {
    if let Some(dir) = log_path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .with_context(|| format!("opening log file {}", log_path.display()))?;

    // RUST_LOG wins; otherwise keep HTTP client internals quiet.
    let log_filter = std::env::var("RUST_LOG")
        .unwrap_or_else(|_| "info,podcast_client=debug,hyper=warn,reqwest=warn".to_string());
    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_env_filter(log_filter.as_str())
        .with_ansi(false)
        .init();

    eprintln!("podcast-watch log: {}", log_path.display());
    Ok(())
}

async fn start_player(
    feed: &FeedHandle<HttpEpisodeService>,
    id: &str,
    config: &Config,
    base_url: &str,
) -> anyhow::Result<(Player, mpsc::Receiver<TransportEvent>)> {
    let mut episode = feed.get_episode(id).await?;
    if !episode.status.is_playable() {
        anyhow::bail!("episode is {}", episode.status.label());
    }
    resolve_audio_url(&mut episode, base_url);

    let (transport, events) = MpvTransport::spawn(config.playback.volume).await?;
    let mut session = PlaybackSession::new(transport, config.playback.autoplay);
    session.load_episode(&episode).await?;

    println!(
        "> {} ({} citations){}",
        episode.topic,
        session.track().len(),
        if session.is_paused() { " [paused]" } else { "" }
    );
    Ok((session, events))
}

/// Relative media paths are served by the episode service itself.
fn resolve_audio_url(episode: &mut Episode, base_url: &str) {
    if let Some(url) = episode.audio_url.as_mut() {
        if url.starts_with('/') {
            *url = format!("{}{}", base_url, url);
        }
    }
}

fn render_listing(state: &FeedState) -> Vec<String> {
    if let Some(err) = &state.error {
        return vec![format!("error: {}", err)];
    }
    let mut lines = vec![format!(
        "-- {} episodes, {} in progress --",
        state.episodes.len(),
        state.in_flight
    )];
    for ep in &state.episodes {
        let progress = match ep.status.stage() {
            Some(stage) => format!(" {}/{}", stage, podcast_proto::episode::EpisodeStatus::STAGES),
            None => String::new(),
        };
        lines.push(format!(
            "{:<24} {:<20}{} {}",
            ep.id,
            ep.status.label(),
            progress,
            ep.topic
        ));
    }
    lines
}

fn print_active(session: &Player) {
    let position = session.position();
    match session.active_citation() {
        Some(c) => println!("[{:>6.1}s] {}", position, c.byline()),
        None => println!("[{:>6.1}s] -", position),
    }
}

async fn next_event<T>(rx: &mut Option<mpsc::Receiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
