pub mod error;
pub mod feed;
pub mod http;
pub mod mpv;
pub mod notifications;
pub mod playback;
pub mod poller;
pub mod query;
pub mod service;
pub mod transitions;

pub use error::EpisodeError;
pub use feed::{FeedBroadcast, FeedHandle, FeedState, FeedSynchronizer, SyncSettings};
pub use service::EpisodeService;
