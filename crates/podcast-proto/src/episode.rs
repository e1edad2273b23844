//! Episode records as delivered by the remote episode service.
//!
//! The client never computes lifecycle transitions itself; it only observes
//! the `status` string the service reports.  Every status or tone string the
//! client does not recognise decodes into a fallback variant instead of
//! failing the whole list.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

/// Shortest accepted topic, in characters, after trimming.
pub const TOPIC_MIN_CHARS: usize = 3;
/// Longest accepted topic, in characters, after trimming.
pub const TOPIC_MAX_CHARS: usize = 200;

// ── Lifecycle status ─────────────────────────────────────────────────────────

/// Lifecycle status of an episode job.
///
/// ```text
///   pending → researching → scriptwriting → generating_audio → stitching → completed
///      ↑           └──────────────┴──────────────┴──────────────┴──→ failed
///      └──────────────────────── regenerate ─────────────────────────────┘
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EpisodeStatus {
    Pending,
    Researching,
    Scriptwriting,
    GeneratingAudio,
    Stitching,
    Completed,
    Failed,
    /// A status string this client does not know.  Kept verbatim for display.
    Unknown(String),
}

impl EpisodeStatus {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Pending => "pending",
            Self::Researching => "researching",
            Self::Scriptwriting => "scriptwriting",
            Self::GeneratingAudio => "generating_audio",
            Self::Stitching => "stitching",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Unknown(raw) => raw,
        }
    }

    /// `completed` and `failed` only.  Unknown statuses are not terminal, so
    /// polling keeps going rather than silently stopping.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn is_in_flight(&self) -> bool {
        !self.is_terminal()
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed)
    }

    pub fn is_playable(&self) -> bool {
        matches!(self, Self::Completed)
    }

    /// 1-based pipeline step for in-flight states (for progress display).
    pub fn stage(&self) -> Option<u8> {
        match self {
            Self::Pending => Some(1),
            Self::Researching => Some(2),
            Self::Scriptwriting => Some(3),
            Self::GeneratingAudio => Some(4),
            Self::Stitching => Some(5),
            _ => None,
        }
    }

    /// Number of in-flight pipeline steps.
    pub const STAGES: u8 = 5;

    /// User-facing label.  Unknown statuses render like a queued job.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Completed => "Ready",
            Self::Pending | Self::Unknown(_) => "Queued",
            Self::Researching => "Researching...",
            Self::Scriptwriting => "Writing script...",
            Self::GeneratingAudio => "Generating audio...",
            Self::Stitching => "Stitching audio...",
            Self::Failed => "Failed",
        }
    }
}

impl From<String> for EpisodeStatus {
    fn from(raw: String) -> Self {
        match raw.as_str() {
            "pending" => Self::Pending,
            "researching" => Self::Researching,
            "scriptwriting" => Self::Scriptwriting,
            "generating_audio" => Self::GeneratingAudio,
            "stitching" => Self::Stitching,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            _ => Self::Unknown(raw),
        }
    }
}

impl From<&str> for EpisodeStatus {
    fn from(raw: &str) -> Self {
        Self::from(raw.to_string())
    }
}

impl From<EpisodeStatus> for String {
    fn from(status: EpisodeStatus) -> Self {
        match status {
            EpisodeStatus::Unknown(raw) => raw,
            other => other.as_str().to_string(),
        }
    }
}

impl fmt::Display for EpisodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Tone ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tone {
    #[default]
    Conversational,
    Professional,
    Humorous,
    Dramatic,
    Educational,
    Casual,
    /// Tone string not in the known set.
    #[serde(other)]
    Other,
}

impl Tone {
    pub const ALL: [Tone; 6] = [
        Tone::Conversational,
        Tone::Professional,
        Tone::Humorous,
        Tone::Dramatic,
        Tone::Educational,
        Tone::Casual,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Conversational => "conversational",
            Self::Professional => "professional",
            Self::Humorous => "humorous",
            Self::Dramatic => "dramatic",
            Self::Educational => "educational",
            Self::Casual => "casual",
            Self::Other => "other",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::Conversational => "Friendly and natural chat",
            Self::Professional => "Polished and authoritative",
            Self::Humorous => "Light-hearted and fun",
            Self::Dramatic => "Bold and captivating",
            Self::Educational => "Clear and informative",
            Self::Casual => "Relaxed and easygoing",
            Self::Other => "",
        }
    }
}

impl fmt::Display for Tone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Tone {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Tone::ALL
            .iter()
            .copied()
            .find(|t| t.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown tone '{}'", s))
    }
}

// ── Records ──────────────────────────────────────────────────────────────────

/// A timestamped reference attached to an episode's audio.
///
/// The service does not guarantee any ordering; consumers sort by
/// `timestamp_seconds` at read time.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Citation {
    pub timestamp_seconds: f64,
    pub title: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub authors: Vec<String>,
    #[serde(default)]
    pub published_date: Option<String>,
    #[serde(default)]
    pub thumbnail_url: Option<String>,
    #[serde(default)]
    pub source_url: Option<String>,
    /// Host who spoke the cited line.
    #[serde(default)]
    pub speaker: Option<String>,
    /// First part of the cited line.
    #[serde(default)]
    pub text_snippet: Option<String>,
    /// Search query the citation was resolved from.
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default)]
    pub source_name: Option<String>,
}

/// Python backends send `null` for an empty optional list.
fn null_as_empty<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(Option::<Vec<T>>::deserialize(deserializer)?.unwrap_or_default())
}

impl Citation {
    /// "Title — Author A, Author B" or just the title.
    pub fn byline(&self) -> String {
        if self.authors.is_empty() {
            self.title.clone()
        } else {
            format!("{} — {}", self.title, self.authors.join(", "))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DialogueLine {
    pub speaker: String,
    pub text: String,
}

/// One generative job.  List responses omit the detail fields, so everything
/// beyond identity, topic and status is optional.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Episode {
    pub id: String,
    pub topic: String,
    #[serde(default)]
    pub tone: Tone,
    #[serde(default)]
    pub category: Option<String>,
    pub status: EpisodeStatus,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub audio_url: Option<String>,
    #[serde(default)]
    pub cover_image_url: Option<String>,
    #[serde(default)]
    pub duration_seconds: Option<f64>,
    #[serde(default)]
    pub citations: Option<Vec<Citation>>,
    #[serde(default)]
    pub research_notes: Option<String>,
    #[serde(default)]
    pub script: Option<Vec<DialogueLine>>,
    /// Failure reason, set by the service when `status` is `failed`.
    #[serde(default)]
    pub error: Option<String>,
}

impl Episode {
    pub fn new(id: impl Into<String>, topic: impl Into<String>, status: EpisodeStatus) -> Self {
        Self {
            id: id.into(),
            topic: topic.into(),
            tone: Tone::default(),
            category: None,
            status,
            created_at: None,
            audio_url: None,
            cover_image_url: None,
            duration_seconds: None,
            citations: None,
            research_notes: None,
            script: None,
            error: None,
        }
    }

    pub fn is_in_flight(&self) -> bool {
        self.status.is_in_flight()
    }

    pub fn citation_count(&self) -> usize {
        self.citations.as_ref().map(Vec::len).unwrap_or(0)
    }
}

/// Body of a create request.  Only constructible through [`CreateEpisode::new`],
/// which enforces the topic length bounds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CreateEpisode {
    topic: String,
    tone: Tone,
}

impl CreateEpisode {
    pub fn new(topic: &str, tone: Tone) -> Result<Self, String> {
        let topic = topic.trim();
        let chars = topic.chars().count();
        if chars < TOPIC_MIN_CHARS {
            return Err(format!(
                "topic must be at least {} characters",
                TOPIC_MIN_CHARS
            ));
        }
        if chars > TOPIC_MAX_CHARS {
            return Err(format!(
                "topic must be at most {} characters (got {})",
                TOPIC_MAX_CHARS, chars
            ));
        }
        if tone == Tone::Other {
            return Err("tone must be one of the known tones".to_string());
        }
        Ok(Self {
            topic: topic.to_string(),
            tone,
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn tone(&self) -> Tone {
        self.tone
    }
}
