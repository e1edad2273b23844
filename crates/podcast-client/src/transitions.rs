use std::collections::HashMap;

use podcast_proto::episode::{Episode, EpisodeStatus};
use tracing::debug;

/// An episode seen moving into `failed` between two snapshots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedTransition {
    pub episode_id: String,
    /// Topic as it was when the transition was observed.
    pub topic: String,
}

/// Diffs successive snapshots by episode id.
///
/// Only episodes present in both snapshots can transition.  The very first
/// snapshot after construction or [`reset`](Self::reset) only seeds the
/// baseline.
#[derive(Debug, Default)]
pub struct TransitionDetector {
    baseline: Option<HashMap<String, EpisodeStatus>>,
}

impl TransitionDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget the baseline; the next snapshot seeds it again.
    pub fn reset(&mut self) {
        self.baseline = None;
    }

    pub fn has_baseline(&self) -> bool {
        self.baseline.is_some()
    }

    /// Compare `snapshot` with the baseline and make it the new baseline.
    pub fn observe(&mut self, snapshot: &[Episode]) -> Vec<FailedTransition> {
        let next: HashMap<String, EpisodeStatus> = snapshot
            .iter()
            .map(|e| (e.id.clone(), e.status.clone()))
            .collect();

        let mut failed = Vec::new();
        if let Some(prev) = &self.baseline {
            for ep in snapshot {
                match prev.get(&ep.id) {
                    Some(before) if !before.is_failed() && ep.status.is_failed() => {
                        debug!("[transitions] {} {} → failed", ep.id, before);
                        failed.push(FailedTransition {
                            episode_id: ep.id.clone(),
                            topic: ep.topic.clone(),
                        });
                    }
                    _ => {}
                }
            }
        }

        self.baseline = Some(next);
        failed
    }
}
