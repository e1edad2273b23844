#![allow(dead_code)]

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use podcast_client::error::{EpisodeError, Result};
use podcast_client::query::QueryParams;
use podcast_client::service::EpisodeService;
use podcast_proto::episode::{CreateEpisode, Episode, EpisodeStatus};

/// In-memory episode service with scripted latency and failures.
///
/// Every list call is recorded with its parameters.  The response reflects
/// the episode set at the moment the (simulated) round trip finishes.
#[derive(Clone, Default)]
pub struct FakeService {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
    episodes: Vec<Episode>,
    latency: Duration,
    delays: VecDeque<Duration>,
    list_calls: Vec<QueryParams>,
    completed_lists: usize,
    fail_next: usize,
    fail_searches: HashSet<String>,
    fail_create: bool,
    created: usize,
}

pub fn episode(id: &str, topic: &str, status: &str) -> Episode {
    Episode::new(id, topic, EpisodeStatus::from(status))
}

impl FakeService {
    pub fn new(episodes: Vec<Episode>) -> Self {
        let svc = Self::default();
        {
            let mut g = svc.inner.lock().unwrap();
            g.episodes = episodes;
            g.latency = Duration::from_millis(50);
        }
        svc
    }

    pub fn set_status(&self, id: &str, status: &str) {
        let mut g = self.inner.lock().unwrap();
        for ep in g.episodes.iter_mut().filter(|e| e.id == id) {
            ep.status = EpisodeStatus::from(status);
        }
    }

    /// Latency of the next list call only.
    pub fn delay_next_list(&self, delay: Duration) {
        self.inner.lock().unwrap().delays.push_back(delay);
    }

    /// The next `n` list responses fail with a 503.
    pub fn fail_next_lists(&self, n: usize) {
        self.inner.lock().unwrap().fail_next = n;
    }

    /// List calls searching for exactly `search` fail.
    pub fn fail_search(&self, search: &str) {
        self.inner
            .lock()
            .unwrap()
            .fail_searches
            .insert(search.to_string());
    }

    pub fn fail_create(&self) {
        self.inner.lock().unwrap().fail_create = true;
    }

    pub fn list_calls(&self) -> Vec<QueryParams> {
        self.inner.lock().unwrap().list_calls.clone()
    }

    pub fn completed_lists(&self) -> usize {
        self.inner.lock().unwrap().completed_lists
    }

    pub fn created(&self) -> usize {
        self.inner.lock().unwrap().created
    }
}

impl EpisodeService for FakeService {
    async fn list_episodes(&self, params: &QueryParams) -> Result<Vec<Episode>> {
        let delay = {
            let mut g = self.inner.lock().unwrap();
            g.list_calls.push(params.clone());
            g.delays.pop_front().unwrap_or(g.latency)
        };
        tokio::time::sleep(delay).await;

        let mut g = self.inner.lock().unwrap();
        g.completed_lists += 1;
        if g.fail_searches.contains(&params.search) {
            return Err(EpisodeError::Api {
                status: 500,
                detail: format!("search '{}' exploded", params.search),
            });
        }
        if g.fail_next > 0 {
            g.fail_next -= 1;
            return Err(EpisodeError::Api {
                status: 503,
                detail: "database unavailable".to_string(),
            });
        }
        let needle = params.search.trim().to_lowercase();
        Ok(g.episodes
            .iter()
            .filter(|e| needle.is_empty() || e.topic.to_lowercase().contains(&needle))
            .cloned()
            .collect())
    }

    async fn get_episode(&self, id: &str) -> Result<Episode> {
        let g = self.inner.lock().unwrap();
        g.episodes
            .iter()
            .find(|e| e.id == id)
            .cloned()
            .ok_or_else(|| EpisodeError::NotFound(id.to_string()))
    }

    async fn create_episode(&self, request: &CreateEpisode) -> Result<Episode> {
        let mut g = self.inner.lock().unwrap();
        if g.fail_create {
            return Err(EpisodeError::Api {
                status: 500,
                detail: "pipeline offline".to_string(),
            });
        }
        g.created += 1;
        let mut ep = Episode::new(
            format!("new-{}", g.created),
            request.topic(),
            EpisodeStatus::Pending,
        );
        ep.tone = request.tone();
        g.episodes.insert(0, ep.clone());
        Ok(ep)
    }

    async fn regenerate_episode(&self, id: &str) -> Result<()> {
        let mut g = self.inner.lock().unwrap();
        match g.episodes.iter_mut().find(|e| e.id == id) {
            Some(ep) => {
                ep.status = EpisodeStatus::Pending;
                ep.error = None;
                Ok(())
            }
            None => Err(EpisodeError::NotFound(id.to_string())),
        }
    }
}
