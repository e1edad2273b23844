//! Filter/query state and the debounced, cancellable query controller.
//!
//! Every list request carries a *generation*.  The controller bumps the
//! generation whenever a request is issued and whenever the current lineage is
//! superseded, so a completion is applied only if its generation is still the
//! latest one.  Together with the per-request `CancellationToken` this makes a
//! superseded response unobservable no matter when it arrives.

use std::cmp::Ordering;
use std::str::FromStr;
use std::time::Duration;

use podcast_proto::episode::{Episode, Tone};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub const MAX_PAGE_SIZE: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortKey {
    #[default]
    CreatedAt,
    Topic,
    Status,
}

impl SortKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CreatedAt => "created_at",
            Self::Topic => "topic",
            Self::Status => "status",
        }
    }
}

impl FromStr for SortKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "created_at" | "created" | "date" => Ok(Self::CreatedAt),
            "topic" => Ok(Self::Topic),
            "status" => Ok(Self::Status),
            other => Err(format!("unknown sort key '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    Asc,
    #[default]
    Desc,
}

impl SortDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Asc => "asc",
            Self::Desc => "desc",
        }
    }
}

impl FromStr for SortDirection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "asc" => Ok(Self::Asc),
            "desc" => Ok(Self::Desc),
            other => Err(format!("unknown sort order '{}'", other)),
        }
    }
}

/// Everything that selects which episodes the feed shows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryParams {
    pub search: String,
    pub category: Option<String>,
    pub tone: Option<Tone>,
    pub sort: SortKey,
    pub direction: SortDirection,
    pub limit: u32,
    pub offset: u32,
}

impl Default for QueryParams {
    fn default() -> Self {
        Self {
            search: String::new(),
            category: None,
            tone: None,
            sort: SortKey::default(),
            direction: SortDirection::default(),
            limit: MAX_PAGE_SIZE,
            offset: 0,
        }
    }
}

impl QueryParams {
    pub fn with_search(mut self, search: impl Into<String>) -> Self {
        self.search = search.into();
        self
    }

    pub fn with_category(mut self, category: Option<String>) -> Self {
        self.category = category.filter(|c| !c.trim().is_empty());
        self
    }

    pub fn with_tone(mut self, tone: Option<Tone>) -> Self {
        self.tone = tone;
        self
    }

    pub fn with_sort(mut self, sort: SortKey, direction: SortDirection) -> Self {
        self.sort = sort;
        self.direction = direction;
        self
    }

    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = limit.clamp(1, MAX_PAGE_SIZE);
        self
    }

    /// Query-string pairs for the list endpoint.  Optional filters are only
    /// sent when set.
    pub fn to_query_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = vec![
            ("search", self.search.trim().to_string()),
            ("limit", self.limit.clamp(1, MAX_PAGE_SIZE).to_string()),
            ("offset", self.offset.to_string()),
        ];
        if let Some(category) = &self.category {
            pairs.push(("category", category.clone()));
        }
        if let Some(tone) = self.tone {
            pairs.push(("tone", tone.as_str().to_string()));
        }
        pairs.push(("sort", self.sort.as_str().to_string()));
        pairs.push(("order", self.direction.as_str().to_string()));
        pairs
    }

    /// Apply the category/tone filter and the sort order to a list the
    /// service returned.  The sort is stable, so equal keys keep the
    /// service's relative order.
    pub fn refine(&self, mut episodes: Vec<Episode>) -> Vec<Episode> {
        if let Some(category) = &self.category {
            episodes.retain(|e| {
                e.category
                    .as_deref()
                    .map(|c| c.eq_ignore_ascii_case(category))
                    .unwrap_or(false)
            });
        }
        if let Some(tone) = self.tone {
            episodes.retain(|e| e.tone == tone);
        }

        let cmp = |a: &Episode, b: &Episode| -> Ordering {
            match self.sort {
                SortKey::CreatedAt => a.created_at.cmp(&b.created_at),
                SortKey::Topic => a.topic.to_lowercase().cmp(&b.topic.to_lowercase()),
                SortKey::Status => a.status.as_str().cmp(b.status.as_str()),
            }
        };
        match self.direction {
            SortDirection::Asc => episodes.sort_by(cmp),
            SortDirection::Desc => episodes.sort_by(|a, b| cmp(b, a)),
        }
        episodes
    }
}

// ── Controller ───────────────────────────────────────────────────────────────

/// Who asked for a list request.  Only `Query` failures are user-visible.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOrigin {
    Query,
    Poll,
}

/// Ticket for one issued list request.
#[derive(Debug, Clone)]
pub struct FetchTicket {
    pub generation: u64,
    pub origin: FetchOrigin,
    pub params: QueryParams,
    pub token: CancellationToken,
}

struct InFlight {
    generation: u64,
    origin: FetchOrigin,
    token: CancellationToken,
}

/// Owns the filter state, the debounce deadline and the outstanding request.
pub struct QueryController {
    params: QueryParams,
    debounce: Duration,
    generation: u64,
    deadline: Option<Instant>,
    in_flight: Option<InFlight>,
    /// Set when the parameters changed; the next applied snapshot is the
    /// first load of a fresh query.
    fresh_query: bool,
}

impl QueryController {
    pub fn new(params: QueryParams, debounce: Duration) -> Self {
        Self {
            params,
            debounce,
            generation: 0,
            deadline: None,
            in_flight: None,
            fresh_query: true,
        }
    }

    pub fn params(&self) -> &QueryParams {
        &self.params
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// When the debounced request should go out, if one is scheduled.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// A request is scheduled or outstanding.  Background polls must not
    /// compete with it.
    pub fn is_busy(&self) -> bool {
        self.deadline.is_some() || self.in_flight.is_some()
    }

    pub fn in_flight_origin(&self) -> Option<FetchOrigin> {
        self.in_flight.as_ref().map(|r| r.origin)
    }

    /// Record new parameters.  Identical parameters are ignored.  Returns
    /// `true` if a fetch was scheduled.
    pub fn set_params(&mut self, params: QueryParams, now: Instant) -> bool {
        if params == self.params && self.generation > 0 {
            return false;
        }
        self.params = params;
        self.fresh_query = true;
        self.schedule(now);
        true
    }

    /// The "data changed" signal: refetch the current parameters after the
    /// quiet period without treating it as a fresh query.
    pub fn mark_dirty(&mut self, now: Instant) {
        self.schedule(now);
    }

    fn schedule(&mut self, now: Instant) {
        self.supersede();
        self.deadline = Some(now + self.debounce);
        debug!(
            "[query] scheduled gen>{} in {:?} search={:?}",
            self.generation, self.debounce, self.params.search
        );
    }

    /// Cancel whatever is outstanding and invalidate its generation.
    /// Safe to call any number of times.
    pub fn supersede(&mut self) {
        self.generation += 1;
        if let Some(prev) = self.in_flight.take() {
            debug!(
                "[query] cancelling gen={} ({:?})",
                prev.generation, prev.origin
            );
            prev.token.cancel();
        }
    }

    /// Drop the pending debounce and cancel the outstanding request.
    pub fn cancel_all(&mut self) {
        self.deadline = None;
        self.supersede();
    }

    /// Issue a request now.  Any outstanding request is cancelled first.
    pub fn begin(&mut self, origin: FetchOrigin) -> FetchTicket {
        if origin == FetchOrigin::Query {
            self.deadline = None;
        }
        self.supersede();
        let token = CancellationToken::new();
        self.in_flight = Some(InFlight {
            generation: self.generation,
            origin,
            token: token.clone(),
        });
        FetchTicket {
            generation: self.generation,
            origin,
            params: self.params.clone(),
            token,
        }
    }

    /// A request finished.  Returns `true` if it is the latest one and its
    /// result may be applied.
    pub fn finish(&mut self, generation: u64) -> bool {
        if generation != self.generation {
            return false;
        }
        match &self.in_flight {
            Some(r) if r.generation == generation => {
                self.in_flight = None;
                true
            }
            _ => false,
        }
    }

    /// Consume the "first load of a fresh query" flag.
    pub fn take_fresh_query(&mut self) -> bool {
        std::mem::take(&mut self.fresh_query)
    }
}
