/// Errors returned by an [`EpisodeService`](crate::service::EpisodeService)
/// and by the action entry points on [`FeedHandle`](crate::feed::FeedHandle).
#[derive(Debug, thiserror::Error)]
pub enum EpisodeError {
    /// The request was superseded or shut down.  Not a failure: callers must
    /// never surface it as an error state.
    #[error("request cancelled")]
    Cancelled,

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("episode service returned {status}: {detail}")]
    Api { status: u16, detail: String },

    #[error("episode not found: {0}")]
    NotFound(String),

    #[error("invalid episode id: {0}")]
    InvalidId(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("malformed response: {0}")]
    Decode(#[from] serde_json::Error),

    /// The synchronizer task is gone.
    #[error("feed synchronizer stopped")]
    Closed,
}

impl EpisodeError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, EpisodeError>;
