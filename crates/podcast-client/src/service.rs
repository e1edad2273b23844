//! Contract of the remote episode service.
//!
//! The synchronizer only ever talks to the service through this trait, so the
//! HTTP client and the scripted fakes used in tests are interchangeable.
//! Cancellation is by dropping the returned future.

use std::future::Future;

use podcast_proto::episode::{CreateEpisode, Episode};

use crate::error::Result;
use crate::query::QueryParams;

pub trait EpisodeService: Send + Sync + 'static {
    /// List episodes matching `params`.
    fn list_episodes(
        &self,
        params: &QueryParams,
    ) -> impl Future<Output = Result<Vec<Episode>>> + Send;

    /// Full record including citations and script.
    fn get_episode(&self, id: &str) -> impl Future<Output = Result<Episode>> + Send;

    /// Start a new job.  Returns immediately with a non-terminal status.
    fn create_episode(
        &self,
        request: &CreateEpisode,
    ) -> impl Future<Output = Result<Episode>> + Send;

    /// Reset an episode to `pending` and run the pipeline again.
    fn regenerate_episode(&self, id: &str) -> impl Future<Output = Result<()>> + Send;
}
