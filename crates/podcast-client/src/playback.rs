//! Playback citation engine.
//!
//! `CitationTrack` is the pure part: citations sorted by timestamp, the
//! active-index lookup and timeline marker positions.  `PlaybackSession`
//! drives a [`Transport`] and keeps position, duration and the pause flag in
//! step with the events the transport reports, since something other than
//! this session (mpv keybindings, end of file) may change them too.

use std::future::Future;

use podcast_proto::episode::{Citation, Episode};
use tracing::{debug, info, warn};

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("media transport not ready")]
    NotReady,
    /// Playback refused by the player (autoplay policy, nothing loaded).
    #[error("playback rejected: {0}")]
    Rejected(String),
    #[error("transport IPC error: {0}")]
    Ipc(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum PlaybackError {
    #[error("episode {0} has no audio")]
    NoMedia(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

// ── Transport ────────────────────────────────────────────────────────────────

/// What a media transport reports on its own.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Position(f64),
    /// `None` until metadata has loaded.
    Duration(Option<f64>),
    Paused(bool),
    Ended,
}

pub trait Transport: Send + Sync {
    fn load(&self, url: &str) -> impl Future<Output = Result<(), TransportError>> + Send;
    fn play(&self) -> impl Future<Output = Result<(), TransportError>> + Send;
    fn pause(&self) -> impl Future<Output = Result<(), TransportError>> + Send;
    fn stop(&self) -> impl Future<Output = Result<(), TransportError>> + Send;
    fn seek(&self, seconds: f64) -> impl Future<Output = Result<(), TransportError>> + Send;
}

// ── Citation track ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct CitationTrack {
    citations: Vec<Citation>,
}

fn known_duration(duration: Option<f64>) -> Option<f64> {
    duration.filter(|d| d.is_finite() && *d > 0.0)
}

impl CitationTrack {
    /// Stable sort by timestamp; ties keep their delivered order.
    pub fn new(mut citations: Vec<Citation>) -> Self {
        citations.sort_by(|a, b| a.timestamp_seconds.total_cmp(&b.timestamp_seconds));
        Self { citations }
    }

    pub fn from_episode(episode: &Episode) -> Self {
        Self::new(episode.citations.clone().unwrap_or_default())
    }

    pub fn citations(&self) -> &[Citation] {
        &self.citations
    }

    pub fn get(&self, index: usize) -> Option<&Citation> {
        self.citations.get(index)
    }

    pub fn len(&self) -> usize {
        self.citations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.citations.is_empty()
    }

    /// Greatest index whose timestamp is `<= time`.
    pub fn active_index(&self, time: f64) -> Option<usize> {
        self.citations
            .partition_point(|c| c.timestamp_seconds <= time)
            .checked_sub(1)
    }

    /// Position of `citation` along the timeline as a fraction in `[0, 1]`.
    /// `None` while the duration is unknown.
    pub fn marker_position(citation: &Citation, duration: Option<f64>) -> Option<f64> {
        let duration = known_duration(duration)?;
        Some((citation.timestamp_seconds / duration).clamp(0.0, 1.0))
    }

    pub fn markers(&self, duration: Option<f64>) -> Option<Vec<f64>> {
        known_duration(duration)?;
        self.citations
            .iter()
            .map(|c| Self::marker_position(c, duration))
            .collect()
    }
}

// ── Session ──────────────────────────────────────────────────────────────────

/// Everything a timeline view needs.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackView {
    pub episode_id: Option<String>,
    pub position: f64,
    pub duration: Option<f64>,
    pub paused: bool,
    pub active: Option<usize>,
    pub markers: Option<Vec<f64>>,
}

pub struct PlaybackSession<T> {
    transport: T,
    autoplay: bool,
    episode_id: Option<String>,
    track: CitationTrack,
    position: f64,
    duration: Option<f64>,
    paused: bool,
    active: Option<usize>,
}

impl<T: Transport> PlaybackSession<T> {
    pub fn new(transport: T, autoplay: bool) -> Self {
        Self {
            transport,
            autoplay,
            episode_id: None,
            track: CitationTrack::default(),
            position: 0.0,
            duration: None,
            paused: true,
            active: None,
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn episode_id(&self) -> Option<&str> {
        self.episode_id.as_deref()
    }

    pub fn track(&self) -> &CitationTrack {
        &self.track
    }

    pub fn position(&self) -> f64 {
        self.position
    }

    pub fn duration(&self) -> Option<f64> {
        self.duration
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn active_index(&self) -> Option<usize> {
        self.active
    }

    pub fn active_citation(&self) -> Option<&Citation> {
        self.active.and_then(|i| self.track.get(i))
    }

    pub fn view(&self) -> PlaybackView {
        PlaybackView {
            episode_id: self.episode_id.clone(),
            position: self.position,
            duration: self.duration,
            paused: self.paused,
            active: self.active,
            markers: self.track.markers(self.duration),
        }
    }

    /// Switch to `episode`.  Same id is a no-op and returns `false`.
    ///
    /// Stops whatever is playing, loads the new source and tries to start
    /// it.  A refused start leaves the session paused without an error.
    pub async fn load_episode(&mut self, episode: &Episode) -> Result<bool, PlaybackError> {
        if self.episode_id.as_deref() == Some(episode.id.as_str()) {
            return Ok(false);
        }
        let url = episode
            .audio_url
            .as_deref()
            .ok_or_else(|| PlaybackError::NoMedia(episode.id.clone()))?;

        if let Err(e) = self.transport.stop().await {
            debug!("[playback] stop before load failed: {}", e);
        }

        self.episode_id = Some(episode.id.clone());
        self.track = CitationTrack::from_episode(episode);
        self.position = 0.0;
        self.duration = None;
        self.paused = true;
        self.active = None;
        info!(
            "[playback] loading {} ({} citations)",
            episode.id,
            self.track.len()
        );

        if let Err(e) = self.transport.load(url).await {
            warn!("[playback] load of {} failed: {}", episode.id, e);
            self.unload();
            return Err(e.into());
        }
        if self.autoplay {
            match self.transport.play().await {
                Ok(()) => self.paused = false,
                Err(TransportError::Rejected(reason)) => {
                    info!("[playback] autoplay refused, staying paused: {}", reason);
                }
                Err(e) => {
                    self.unload();
                    return Err(e.into());
                }
            }
        }
        Ok(true)
    }

    /// Forget the current episode so the next load of any id goes through.
    fn unload(&mut self) {
        self.episode_id = None;
        self.track = CitationTrack::default();
        self.active = None;
    }

    /// Fold in an event from the transport.  Returns `true` when the active
    /// citation changed.
    pub fn handle_event(&mut self, event: TransportEvent) -> bool {
        match event {
            TransportEvent::Position(t) if t.is_finite() => self.position = t.max(0.0),
            TransportEvent::Position(_) => {}
            TransportEvent::Duration(d) => self.duration = known_duration(d),
            TransportEvent::Paused(p) => self.paused = p,
            TransportEvent::Ended => self.paused = true,
        }
        self.refresh_active()
    }

    /// Seek to `fraction` of the duration.  No-op until the duration is
    /// known.  Returns whether a seek happened.
    pub async fn seek_by_time(&mut self, fraction: f64) -> Result<bool, PlaybackError> {
        let Some(duration) = self.duration else {
            debug!("[playback] seek ignored, duration unknown");
            return Ok(false);
        };
        if fraction.is_nan() {
            return Ok(false);
        }
        let target = (fraction * duration).clamp(0.0, duration);
        self.transport.seek(target).await?;
        self.position = target;
        self.refresh_active();
        Ok(true)
    }

    /// Jump to a citation and listen: resumes if paused.
    pub async fn seek_by_citation(&mut self, timestamp: f64) -> Result<(), PlaybackError> {
        let target = timestamp.max(0.0);
        self.transport.seek(target).await?;
        self.position = target;
        self.refresh_active();
        if self.paused {
            self.transport.play().await?;
            self.paused = false;
        }
        Ok(())
    }

    /// [`seek_by_citation`](Self::seek_by_citation) by index into the sorted
    /// track.  Returns `false` for an index past the end.
    pub async fn seek_to_citation(&mut self, index: usize) -> Result<bool, PlaybackError> {
        let Some(timestamp) = self.track.get(index).map(|c| c.timestamp_seconds) else {
            return Ok(false);
        };
        self.seek_by_citation(timestamp).await?;
        Ok(true)
    }

    pub async fn toggle_pause(&mut self) -> Result<(), PlaybackError> {
        if self.paused {
            self.transport.play().await?;
            self.paused = false;
        } else {
            self.transport.pause().await?;
            self.paused = true;
        }
        Ok(())
    }

    pub async fn stop(&mut self) -> Result<(), PlaybackError> {
        self.transport.stop().await?;
        self.episode_id = None;
        self.track = CitationTrack::default();
        self.position = 0.0;
        self.duration = None;
        self.paused = true;
        self.active = None;
        Ok(())
    }

    fn refresh_active(&mut self) -> bool {
        let next = self.track.active_index(self.position);
        let changed = next != self.active;
        self.active = next;
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use podcast_proto::episode::EpisodeStatus;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeTransport {
        calls: Mutex<Vec<String>>,
        refuse_play: bool,
        failing_loads: Mutex<usize>,
    }

    impl FakeTransport {
        fn refusing() -> Self {
            Self {
                refuse_play: true,
                ..Self::default()
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }
    }

    impl Transport for FakeTransport {
        async fn load(&self, url: &str) -> Result<(), TransportError> {
            self.record(format!("load {}", url));
            let mut failing = self.failing_loads.lock().unwrap();
            if *failing > 0 {
                *failing -= 1;
                return Err(TransportError::Ipc("timeout".to_string()));
            }
            Ok(())
        }

        async fn play(&self) -> Result<(), TransportError> {
            self.record("play".to_string());
            if self.refuse_play {
                return Err(TransportError::Rejected("autoplay blocked".to_string()));
            }
            Ok(())
        }

        async fn pause(&self) -> Result<(), TransportError> {
            self.record("pause".to_string());
            Ok(())
        }

        async fn stop(&self) -> Result<(), TransportError> {
            self.record("stop".to_string());
            Ok(())
        }

        async fn seek(&self, seconds: f64) -> Result<(), TransportError> {
            self.record(format!("seek {}", seconds));
            Ok(())
        }
    }

    fn cite(ts: f64, title: &str) -> Citation {
        Citation {
            timestamp_seconds: ts,
            title: title.to_string(),
            ..Citation::default()
        }
    }

    fn episode(id: &str) -> Episode {
        let mut ep = Episode::new(id, "Marsha P. Johnson", EpisodeStatus::Completed);
        ep.audio_url = Some(format!("http://localhost:8000/audio/{}.mp3", id));
        ep.citations = Some(vec![cite(75.0, "c"), cite(10.0, "a"), cite(30.0, "b")]);
        ep
    }

    #[test]
    fn test_active_index_boundaries() {
        let track = CitationTrack::new(vec![cite(10.0, "a"), cite(30.0, "b"), cite(75.0, "c")]);
        assert_eq!(track.active_index(5.0), None);
        assert_eq!(track.active_index(10.0), Some(0));
        assert_eq!(track.active_index(29.0), Some(0));
        assert_eq!(track.active_index(30.0), Some(1));
        assert_eq!(track.active_index(9999.0), Some(2));
        assert_eq!(CitationTrack::default().active_index(50.0), None);
    }

    #[test]
    fn test_sort_is_stable_for_ties() {
        let track = CitationTrack::new(vec![
            cite(20.0, "late"),
            cite(5.0, "first"),
            cite(5.0, "second"),
        ]);
        let titles: Vec<_> = track.citations().iter().map(|c| c.title.as_str()).collect();
        assert_eq!(titles, ["first", "second", "late"]);
        assert_eq!(track.active_index(5.0), Some(1));
    }

    #[test]
    fn test_markers_need_duration() {
        let track = CitationTrack::new(vec![cite(50.0, "a"), cite(150.0, "b")]);
        assert_eq!(track.markers(None), None);
        assert_eq!(track.markers(Some(0.0)), None);
        assert_eq!(track.markers(Some(200.0)), Some(vec![0.25, 0.75]));
        assert_eq!(
            CitationTrack::marker_position(&cite(300.0, "x"), Some(200.0)),
            Some(1.0)
        );
    }

    #[tokio::test]
    async fn test_load_stops_loads_and_autoplays() {
        let mut session = PlaybackSession::new(FakeTransport::default(), true);
        assert!(session.load_episode(&episode("e1")).await.unwrap());
        assert_eq!(
            session.transport().calls(),
            ["stop", "load http://localhost:8000/audio/e1.mp3", "play"]
        );
        assert!(!session.is_paused());
        assert_eq!(session.track().get(0).unwrap().title, "a");

        // same id again does nothing
        assert!(!session.load_episode(&episode("e1")).await.unwrap());
        assert_eq!(session.transport().calls().len(), 3);
    }

    #[tokio::test]
    async fn test_refused_autoplay_falls_back_to_paused() {
        let mut session = PlaybackSession::new(FakeTransport::refusing(), true);
        assert!(session.load_episode(&episode("e1")).await.is_ok());
        assert!(session.is_paused());
    }

    #[tokio::test]
    async fn test_episode_without_audio() {
        let mut session = PlaybackSession::new(FakeTransport::default(), true);
        let mut ep = episode("e1");
        ep.audio_url = None;
        assert!(matches!(
            session.load_episode(&ep).await,
            Err(PlaybackError::NoMedia(id)) if id == "e1"
        ));
        assert!(session.transport().calls().is_empty());
    }

    #[tokio::test]
    async fn test_seek_by_time_waits_for_duration() {
        let mut session = PlaybackSession::new(FakeTransport::default(), true);
        session.load_episode(&episode("e1")).await.unwrap();
        session.handle_event(TransportEvent::Position(12.0));

        assert!(!session.seek_by_time(0.5).await.unwrap());
        assert_eq!(session.position(), 12.0);

        session.handle_event(TransportEvent::Duration(Some(200.0)));
        assert!(session.seek_by_time(0.5).await.unwrap());
        assert_eq!(session.position(), 100.0);
        assert_eq!(session.active_index(), Some(2));

        session.seek_by_time(1.7).await.unwrap();
        assert_eq!(session.position(), 200.0);
    }

    #[tokio::test]
    async fn test_seek_by_citation_resumes() {
        let mut session = PlaybackSession::new(FakeTransport::default(), false);
        session.load_episode(&episode("e1")).await.unwrap();
        assert!(session.is_paused());

        session.seek_by_citation(30.0).await.unwrap();
        assert!(!session.is_paused());
        assert_eq!(session.active_index(), Some(1));
        let calls = session.transport().calls();
        assert_eq!(&calls[calls.len() - 2..], ["seek 30", "play"]);

        // already playing: no extra play
        session.seek_to_citation(0).await.unwrap();
        assert_eq!(session.transport().calls().last().unwrap(), "seek 10");
        assert!(!session.seek_to_citation(9).await.unwrap());
    }

    #[tokio::test]
    async fn test_events_drive_active_citation() {
        let mut session = PlaybackSession::new(FakeTransport::default(), true);
        session.load_episode(&episode("e1")).await.unwrap();

        assert!(!session.handle_event(TransportEvent::Position(3.0)));
        assert!(session.handle_event(TransportEvent::Position(10.5)));
        assert_eq!(session.active_citation().unwrap().title, "a");
        assert!(!session.handle_event(TransportEvent::Position(11.0)));

        session.handle_event(TransportEvent::Paused(true));
        assert!(session.is_paused());
        session.handle_event(TransportEvent::Paused(false));
        session.handle_event(TransportEvent::Ended);
        assert!(session.is_paused());

        assert_eq!(session.view().markers, None);
        session.handle_event(TransportEvent::Duration(Some(100.0)));
        assert_eq!(session.view().markers, Some(vec![0.1, 0.3, 0.75]));
    }

    #[tokio::test]
    async fn test_switching_episode_resets_state() {
        let mut session = PlaybackSession::new(FakeTransport::default(), true);
        session.load_episode(&episode("e1")).await.unwrap();
        session.handle_event(TransportEvent::Duration(Some(100.0)));
        session.handle_event(TransportEvent::Position(80.0));

        session.load_episode(&episode("e2")).await.unwrap();
        assert_eq!(session.episode_id(), Some("e2"));
        assert_eq!(session.position(), 0.0);
        assert_eq!(session.duration(), None);
        assert_eq!(session.active_index(), None);
    }

    #[tokio::test]
    async fn test_failed_load_can_be_retried() {
        let transport = FakeTransport::default();
        *transport.failing_loads.lock().unwrap() = 1;
        let mut session = PlaybackSession::new(transport, true);

        let err = session.load_episode(&episode("e1")).await.unwrap_err();
        assert!(matches!(
            err,
            PlaybackError::Transport(TransportError::Ipc(_))
        ));
        assert_eq!(session.episode_id(), None);
        assert!(session.track().is_empty());

        assert!(session.load_episode(&episode("e1")).await.unwrap());
        assert_eq!(session.episode_id(), Some("e1"));
        assert!(!session.is_paused());
        assert_eq!(
            session.transport().calls(),
            [
                "stop",
                "load http://localhost:8000/audio/e1.mp3",
                "stop",
                "load http://localhost:8000/audio/e1.mp3",
                "play"
            ]
        );
    }
}
