//! Adaptive background poller.
//!
//! Runs only while the snapshot has in-flight episodes.  When the in-flight
//! count drops to zero it fires exactly one more refresh, then goes idle
//! until new in-flight work shows up.
//!
//! ```text
//!          in_flight > 0            in_flight == 0
//!   Idle ───────────────→ Polling ──────────────────→ Settling
//!    ↑                      ↑                            │
//!    │                      └──── in_flight > 0 ─────────┤
//!    └──────── final tick fired, still in_flight == 0 ───┘
//! ```

use std::time::Duration;

use podcast_proto::episode::Episode;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollPhase {
    Idle,
    Polling,
    /// In-flight work just drained; one final refresh is owed.
    Settling { fired: bool },
}

pub struct AdaptivePoller {
    interval: Duration,
    phase: PollPhase,
    next_tick: Option<Instant>,
}

pub fn in_flight_count(episodes: &[Episode]) -> usize {
    episodes.iter().filter(|e| e.is_in_flight()).count()
}

impl AdaptivePoller {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            phase: PollPhase::Idle,
            next_tick: None,
        }
    }

    pub fn phase(&self) -> PollPhase {
        self.phase
    }

    pub fn next_tick(&self) -> Option<Instant> {
        self.next_tick
    }

    pub fn is_running(&self) -> bool {
        self.phase != PollPhase::Idle
    }

    /// Re-evaluate the run condition against a freshly applied snapshot.
    pub fn observe(&mut self, in_flight: usize, now: Instant) {
        let next = match (self.phase, in_flight) {
            (_, n) if n > 0 => PollPhase::Polling,
            (PollPhase::Polling, _) => PollPhase::Settling { fired: false },
            (PollPhase::Settling { fired: false }, _) => PollPhase::Settling { fired: false },
            (PollPhase::Settling { fired: true }, _) | (PollPhase::Idle, _) => PollPhase::Idle,
        };
        if next != self.phase {
            debug!(
                "[poller] {:?} → {:?} (in_flight={})",
                self.phase, next, in_flight
            );
            self.phase = next;
        }
        match self.phase {
            PollPhase::Idle => self.next_tick = None,
            PollPhase::Polling | PollPhase::Settling { fired: false } => self.arm(now),
            PollPhase::Settling { fired: true } => {}
        }
    }

    /// The tick deadline passed.  Returns `true` if a poll request should go
    /// out now.  `busy` means a user query is scheduled or in flight; the
    /// tick is then skipped and re-armed so the two never compete.
    pub fn on_tick(&mut self, busy: bool, now: Instant) -> bool {
        self.next_tick = None;
        match self.phase {
            PollPhase::Idle => false,
            _ if busy => {
                debug!("[poller] query busy, skipping tick");
                self.arm(now);
                false
            }
            PollPhase::Polling => true,
            PollPhase::Settling { .. } => {
                self.phase = PollPhase::Settling { fired: true };
                true
            }
        }
    }

    /// A fetch ended without producing a snapshot (failed, or cancelled by a
    /// user query).  Keep the loop alive; a missed final refresh is owed
    /// again.
    pub fn on_missed(&mut self, now: Instant) {
        match self.phase {
            PollPhase::Idle => {}
            PollPhase::Polling => self.arm(now),
            PollPhase::Settling { .. } => {
                self.phase = PollPhase::Settling { fired: false };
                self.arm(now);
            }
        }
    }

    fn arm(&mut self, now: Instant) {
        if self.next_tick.is_none() {
            self.next_tick = Some(now + self.interval);
        }
    }
}
