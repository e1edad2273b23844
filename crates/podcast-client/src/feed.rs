/// FeedSynchronizer — single-owner event loop for the episode feed.
///
/// The loop owns the query controller, the poller, the transition detector
/// and the notification queue exclusively; nothing else mutates them.  Other
/// tasks talk to it through a cloneable `FeedHandle`, which sends
/// `FeedCommand`s in and reads the published `FeedState` out.
///
/// List requests run in their own tasks and report back on an internal
/// channel tagged with the generation they were issued under.  A completion
/// is applied only if that generation is still current, so exactly one
/// writer ever lands in the snapshot.
///
/// Three deadlines drive the loop besides commands and completions: the
/// debounce deadline, the poll tick, and the notification expiry.
use std::sync::Arc;
use std::time::Duration;

use podcast_proto::config::Config;
use podcast_proto::episode::{CreateEpisode, Episode, Tone};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{EpisodeError, Result};
use crate::notifications::{Notification, NotificationQueue};
use crate::poller::{in_flight_count, AdaptivePoller};
use crate::query::{FetchOrigin, FetchTicket, QueryController, QueryParams};
use crate::service::EpisodeService;
use crate::transitions::TransitionDetector;

// ── Settings ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub debounce: Duration,
    pub poll_interval: Duration,
    pub notification_expiry: Duration,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl SyncSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            debounce: config.feed.debounce(),
            poll_interval: config.feed.poll_interval(),
            notification_expiry: config.notifications.expiry(),
        }
    }
}

// ── Published state ──────────────────────────────────────────────────────────

/// Read-only view of the feed.  `rev` increases on every change.
#[derive(Debug, Clone, Default)]
pub struct FeedState {
    pub rev: u64,
    pub query: QueryParams,
    pub episodes: Vec<Episode>,
    /// A user query is on its way.
    pub loading: bool,
    /// Last user query failure.  Takes precedence over `episodes` for
    /// display until the next successful fetch.
    pub error: Option<String>,
    pub notifications: Vec<Notification>,
    pub in_flight: usize,
}

#[derive(Debug, Clone)]
pub enum FeedBroadcast {
    /// `FeedState` changed; fetch it with [`FeedHandle::snapshot`].
    StateUpdated,
    /// An episode was seen moving into `failed`.
    EpisodeFailed(Notification),
}

// ── Commands ─────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum FeedCommand {
    SetQuery(QueryParams),
    /// Data changed elsewhere; refetch the current query.
    Refresh,
    Dismiss(String),
    Shutdown,
}

struct FetchDone {
    generation: u64,
    origin: FetchOrigin,
    result: Result<Vec<Episode>>,
}

// ── Handle ───────────────────────────────────────────────────────────────────

pub struct FeedHandle<S> {
    cmd_tx: mpsc::Sender<FeedCommand>,
    state: Arc<RwLock<FeedState>>,
    broadcast_tx: broadcast::Sender<FeedBroadcast>,
    service: Arc<S>,
}

impl<S> Clone for FeedHandle<S> {
    fn clone(&self) -> Self {
        Self {
            cmd_tx: self.cmd_tx.clone(),
            state: Arc::clone(&self.state),
            broadcast_tx: self.broadcast_tx.clone(),
            service: Arc::clone(&self.service),
        }
    }
}

impl<S: EpisodeService> FeedHandle<S> {
    pub async fn snapshot(&self) -> FeedState {
        self.state.read().await.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FeedBroadcast> {
        self.broadcast_tx.subscribe()
    }

    pub async fn set_query(&self, params: QueryParams) -> Result<()> {
        self.send(FeedCommand::SetQuery(params)).await
    }

    pub async fn refresh(&self) -> Result<()> {
        self.send(FeedCommand::Refresh).await
    }

    pub async fn dismiss(&self, episode_id: impl Into<String>) -> Result<()> {
        self.send(FeedCommand::Dismiss(episode_id.into())).await
    }

    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(FeedCommand::Shutdown).await;
    }

    /// Validate and submit a new episode.  Failures come back to the caller
    /// only; the feed is refreshed on success.
    pub async fn create_episode(&self, topic: &str, tone: Tone) -> Result<Episode> {
        let request = CreateEpisode::new(topic, tone).map_err(EpisodeError::Validation)?;
        let episode = self.service.create_episode(&request).await?;
        info!("[feed] created {} ({:?})", episode.id, episode.topic);
        if self.refresh().await.is_err() {
            debug!("[feed] synchronizer gone, skipping refresh after create");
        }
        Ok(episode)
    }

    pub async fn regenerate(&self, episode_id: &str) -> Result<()> {
        self.service.regenerate_episode(episode_id).await?;
        info!("[feed] regenerating {}", episode_id);
        if self.refresh().await.is_err() {
            debug!("[feed] synchronizer gone, skipping refresh after regenerate");
        }
        Ok(())
    }

    /// Full record for the player.  Does not touch feed state.
    pub async fn get_episode(&self, episode_id: &str) -> Result<Episode> {
        self.service.get_episode(episode_id).await
    }

    async fn send(&self, cmd: FeedCommand) -> Result<()> {
        self.cmd_tx.send(cmd).await.map_err(|_| EpisodeError::Closed)
    }
}

// ── Synchronizer ─────────────────────────────────────────────────────────────

pub struct FeedSynchronizer<S> {
    service: Arc<S>,
    query: QueryController,
    poller: AdaptivePoller,
    detector: TransitionDetector,
    notifications: NotificationQueue,
    state: Arc<RwLock<FeedState>>,
    broadcast_tx: broadcast::Sender<FeedBroadcast>,
    done_tx: mpsc::Sender<FetchDone>,
}

impl<S: EpisodeService> FeedSynchronizer<S> {
    /// Start the loop.  The initial query is fetched immediately.
    pub fn spawn(
        service: S,
        params: QueryParams,
        settings: SyncSettings,
    ) -> (FeedHandle<S>, JoinHandle<()>) {
        let service = Arc::new(service);
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (done_tx, done_rx) = mpsc::channel(64);
        let (broadcast_tx, _) = broadcast::channel(256);
        let state = Arc::new(RwLock::new(FeedState {
            rev: 1,
            query: params.clone(),
            ..FeedState::default()
        }));

        let sync = Self {
            service: Arc::clone(&service),
            query: QueryController::new(params, settings.debounce),
            poller: AdaptivePoller::new(settings.poll_interval),
            detector: TransitionDetector::new(),
            notifications: NotificationQueue::new(settings.notification_expiry),
            state: Arc::clone(&state),
            broadcast_tx: broadcast_tx.clone(),
            done_tx,
        };
        let task = tokio::spawn(sync.run(cmd_rx, done_rx));

        let handle = FeedHandle {
            cmd_tx,
            state,
            broadcast_tx,
            service,
        };
        (handle, task)
    }

    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<FeedCommand>,
        mut done_rx: mpsc::Receiver<FetchDone>,
    ) {
        info!("[feed] starting event loop");
        self.dispatch(FetchOrigin::Query).await;

        loop {
            let debounce_at = self.query.deadline();
            let poll_at = self.poller.next_tick();
            let expire_at = self.notifications.deadline();

            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    None | Some(FeedCommand::Shutdown) => {
                        info!("[feed] shutting down");
                        break;
                    }
                    Some(cmd) => self.handle_command(cmd).await,
                },

                Some(done) = done_rx.recv() => self.apply(done).await,

                _ = sleep_opt(debounce_at) => self.dispatch(FetchOrigin::Query).await,

                _ = sleep_opt(poll_at) => {
                    let busy = self.query.is_busy();
                    if self.poller.on_tick(busy, Instant::now()) {
                        self.dispatch(FetchOrigin::Poll).await;
                    }
                }

                _ = sleep_opt(expire_at) => {
                    if self.notifications.expire(Instant::now()) {
                        self.publish_notifications().await;
                    }
                }
            }
        }

        self.query.cancel_all();
    }

    async fn handle_command(&mut self, cmd: FeedCommand) {
        let now = Instant::now();
        match cmd {
            FeedCommand::SetQuery(params) => {
                if params == *self.query.params() {
                    debug!("[feed] query unchanged, ignoring");
                    return;
                }
                self.note_poll_superseded(now);
                self.query.set_params(params.clone(), now);
                debug!("[feed] query → {:?}", params);
                self.update_state(|s| s.query = params).await;
            }
            FeedCommand::Refresh => {
                self.note_poll_superseded(now);
                self.query.mark_dirty(now);
            }
            FeedCommand::Dismiss(id) => {
                if self.notifications.dismiss(&id, now) {
                    self.publish_notifications().await;
                }
            }
            FeedCommand::Shutdown => {}
        }
    }

    /// Issue a list request under a fresh generation.
    async fn dispatch(&mut self, origin: FetchOrigin) {
        self.note_poll_superseded(Instant::now());
        let ticket = self.query.begin(origin);
        debug!(
            "[feed] fetch gen={} origin={:?}",
            ticket.generation, ticket.origin
        );
        if origin == FetchOrigin::Query {
            self.update_state(|s| s.loading = true).await;
        }
        tokio::spawn(fetch(Arc::clone(&self.service), ticket, self.done_tx.clone()));
    }

    async fn apply(&mut self, done: FetchDone) {
        if !self.query.finish(done.generation) {
            debug!("[feed] discarding stale gen={}", done.generation);
            return;
        }
        let now = Instant::now();

        match done.result {
            Ok(episodes) => {
                let episodes = self.query.params().refine(episodes);
                if self.query.take_fresh_query() {
                    self.detector.reset();
                }
                for t in self.detector.observe(&episodes) {
                    let notification = Notification::from_transition(t);
                    info!(
                        "[feed] episode {} failed ({:?})",
                        notification.episode_id, notification.topic
                    );
                    self.notifications.push(notification.clone(), now);
                    let _ = self
                        .broadcast_tx
                        .send(FeedBroadcast::EpisodeFailed(notification));
                }

                let in_flight = in_flight_count(&episodes);
                debug!(
                    "[feed] applied gen={} ({} episodes, {} in flight)",
                    done.generation,
                    episodes.len(),
                    in_flight
                );
                let notifications = self.notifications.to_vec();
                self.update_state(|s| {
                    s.episodes = episodes;
                    s.in_flight = in_flight;
                    s.error = None;
                    s.loading = false;
                    s.notifications = notifications;
                })
                .await;
                self.poller.observe(in_flight, now);
            }
            Err(e) if e.is_cancelled() => {}
            Err(e) => match done.origin {
                FetchOrigin::Query => {
                    warn!("[feed] query failed: {}", e);
                    let message = e.to_string();
                    self.update_state(|s| {
                        s.error = Some(message);
                        s.loading = false;
                    })
                    .await;
                    self.poller.on_missed(now);
                }
                FetchOrigin::Poll => {
                    warn!("[poller] poll failed: {}", e);
                    self.poller.on_missed(now);
                }
            },
        }
    }

    /// A poll that is about to be cancelled will never report back.
    fn note_poll_superseded(&mut self, now: Instant) {
        if self.query.in_flight_origin() == Some(FetchOrigin::Poll) {
            self.poller.on_missed(now);
        }
    }

    async fn publish_notifications(&self) {
        let notifications = self.notifications.to_vec();
        self.update_state(|s| s.notifications = notifications).await;
    }

    async fn update_state(&self, f: impl FnOnce(&mut FeedState)) {
        {
            let mut state = self.state.write().await;
            f(&mut state);
            state.rev += 1;
        }
        let _ = self.broadcast_tx.send(FeedBroadcast::StateUpdated);
    }
}

async fn fetch<S: EpisodeService>(
    service: Arc<S>,
    ticket: FetchTicket,
    done_tx: mpsc::Sender<FetchDone>,
) {
    let FetchTicket {
        generation,
        origin,
        params,
        token,
    } = ticket;

    let result = tokio::select! {
        biased;
        _ = token.cancelled() => {
            debug!("[feed] gen={} cancelled", generation);
            return;
        }
        result = service.list_episodes(&params) => result,
    };

    let _ = done_tx
        .send(FetchDone {
            generation,
            origin,
            result,
        })
        .await;
}

async fn sleep_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_follow_config() {
        let mut config = Config::default();
        config.feed.debounce_ms = 120;
        config.notifications.expiry_ms = 900;
        let s = SyncSettings::from_config(&config);
        assert_eq!(s.debounce, Duration::from_millis(120));
        assert_eq!(s.poll_interval, Duration::from_millis(3000));
        assert_eq!(s.notification_expiry, Duration::from_millis(900));
    }

    #[test]
    fn test_initial_state() {
        let state = FeedState::default();
        assert_eq!(state.rev, 0);
        assert!(state.episodes.is_empty());
        assert!(!state.loading);
        assert!(state.error.is_none());
    }
}
