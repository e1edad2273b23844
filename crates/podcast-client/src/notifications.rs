//! Failure notifications: append-ordered, dismissable, auto-expiring.
//!
//! Expiry is batch based.  Every change to the queue's composition restarts a
//! single timer; when it fires, everything that was queued at the time of the
//! last change goes at once, oldest first.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

use crate::transitions::FailedTransition;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub episode_id: String,
    /// Captured when the failure was detected; never updated.
    pub topic: String,
    pub created_at: DateTime<Local>,
}

impl Notification {
    pub fn from_transition(t: FailedTransition) -> Self {
        Self {
            episode_id: t.episode_id,
            topic: t.topic,
            created_at: Local::now(),
        }
    }
}

pub struct NotificationQueue {
    items: VecDeque<Notification>,
    expiry: Duration,
    deadline: Option<Instant>,
    /// How many entries at the front belong to the batch the deadline covers.
    batch_len: usize,
}

impl NotificationQueue {
    pub fn new(expiry: Duration) -> Self {
        Self {
            items: VecDeque::new(),
            expiry,
            deadline: None,
            batch_len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn iter(&self) -> impl Iterator<Item = &Notification> {
        self.items.iter()
    }

    pub fn to_vec(&self) -> Vec<Notification> {
        self.items.iter().cloned().collect()
    }

    /// Append, replacing any older entry for the same episode.
    pub fn push(&mut self, notification: Notification, now: Instant) {
        self.items
            .retain(|n| n.episode_id != notification.episode_id);
        debug!(
            "[notify] queued {} ({} pending)",
            notification.episode_id,
            self.items.len() + 1
        );
        self.items.push_back(notification);
        self.reschedule(now);
    }

    /// Remove the entry for `episode_id`.  Returns `false` if there was none.
    pub fn dismiss(&mut self, episode_id: &str, now: Instant) -> bool {
        let before = self.items.len();
        self.items.retain(|n| n.episode_id != episode_id);
        if self.items.len() == before {
            return false;
        }
        self.reschedule(now);
        true
    }

    /// Drop the scheduled batch if its deadline has passed.  Returns `true`
    /// if anything was removed.
    pub fn expire(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(at) if at <= now => {}
            _ => return false,
        }
        let n = self.batch_len.min(self.items.len());
        self.items.drain(..n);
        debug!("[notify] expired {} ({} left)", n, self.items.len());
        self.deadline = None;
        self.batch_len = 0;
        if !self.items.is_empty() {
            self.reschedule(now);
        }
        n > 0
    }

    fn reschedule(&mut self, now: Instant) {
        if self.items.is_empty() {
            self.deadline = None;
            self.batch_len = 0;
        } else {
            self.deadline = Some(now + self.expiry);
            self.batch_len = self.items.len();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXPIRY: Duration = Duration::from_millis(6000);

    fn note(id: &str) -> Notification {
        Notification {
            episode_id: id.to_string(),
            topic: format!("topic {}", id),
            created_at: Local::now(),
        }
    }

    fn ids(q: &NotificationQueue) -> Vec<String> {
        q.iter().map(|n| n.episode_id.clone()).collect()
    }

    #[test]
    fn test_push_keeps_insertion_order_and_dedupes() {
        let now = Instant::now();
        let mut q = NotificationQueue::new(EXPIRY);
        q.push(note("a"), now);
        q.push(note("b"), now);
        q.push(note("a"), now);
        assert_eq!(ids(&q), ["b", "a"]);
    }

    #[test]
    fn test_dismiss_removes_only_that_entry() {
        let now = Instant::now();
        let mut q = NotificationQueue::new(EXPIRY);
        q.push(note("a"), now);
        q.push(note("b"), now);
        q.push(note("c"), now);
        assert!(q.dismiss("b", now));
        assert_eq!(ids(&q), ["a", "c"]);
        assert!(!q.dismiss("zzz", now));
    }

    #[test]
    fn test_deadline_restarts_on_change() {
        let t0 = Instant::now();
        let mut q = NotificationQueue::new(EXPIRY);
        q.push(note("a"), t0);
        assert_eq!(q.deadline(), Some(t0 + EXPIRY));

        let t1 = t0 + Duration::from_millis(2000);
        q.push(note("b"), t1);
        assert_eq!(q.deadline(), Some(t1 + EXPIRY));

        assert!(!q.expire(t0 + EXPIRY));
        assert_eq!(q.len(), 2);
        assert!(q.expire(t1 + EXPIRY));
        assert!(q.is_empty());
        assert_eq!(q.deadline(), None);
    }

    #[test]
    fn test_dismissing_last_clears_deadline() {
        let now = Instant::now();
        let mut q = NotificationQueue::new(EXPIRY);
        q.push(note("a"), now);
        q.dismiss("a", now);
        assert_eq!(q.deadline(), None);
        assert!(!q.expire(now + EXPIRY));
    }

    #[test]
    fn test_topic_is_snapshotted() {
        let t = FailedTransition {
            episode_id: "x".into(),
            topic: "Harvey Milk".into(),
        };
        let n = Notification::from_transition(t);
        assert_eq!(n.topic, "Harvey Milk");
    }
}
