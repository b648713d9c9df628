use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A sporting match as reported by an odds provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Stable id: `{provider}:{provider_event_id}`
    pub id: String,
    pub provider: String,
    pub provider_event_id: String,
    /// Provider sport key, e.g. "basketball_nba"
    pub sport_key: String,
    pub league: Option<String>,
    /// Scheduled start; the feed may correct it between cycles
    pub commence_time: Option<DateTime<Utc>>,
    pub home_team: String,
    pub away_team: String,
}

impl Event {
    pub fn make_id(provider: &str, provider_event_id: &str) -> String {
        format!("{}:{}", provider, provider_event_id)
    }
}

/// A bookmaker whose prices we track
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sportsbook {
    /// Provider key, e.g. "draftkings"
    pub key: String,
    pub name: String,
}

/// Which outcome of a head-to-head market a price belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarketSide {
    Home,
    Away,
    Draw,
}

impl MarketSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarketSide::Home => "home",
            MarketSide::Away => "away",
            MarketSide::Draw => "draw",
        }
    }
}

impl fmt::Display for MarketSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MarketSide {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "home" => Ok(MarketSide::Home),
            "away" => Ok(MarketSide::Away),
            "draw" => Ok(MarketSide::Draw),
            other => Err(format!("unknown market side '{}'", other)),
        }
    }
}

/// Identity of one detection lane: (event, sportsbook, side)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LaneKey {
    pub event_id: String,
    pub sportsbook: String,
    pub side: MarketSide,
}

impl LaneKey {
    pub fn new(event_id: &str, sportsbook: &str, side: MarketSide) -> Self {
        LaneKey {
            event_id: event_id.to_string(),
            sportsbook: sportsbook.to_string(),
            side,
        }
    }
}

impl fmt::Display for LaneKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.event_id, self.sportsbook, self.side)
    }
}

/// Normalized observation handed over by a provider, before it is stored
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub event_id: String,
    pub sportsbook: String,
    pub side: MarketSide,
    /// American moneyline price, e.g. -150 or +120
    pub price: i32,
    pub observed_at: DateTime<Utc>,
}

/// One stored moneyline observation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OddsSnapshot {
    pub id: Option<i64>,
    pub event_id: String,
    pub sportsbook: String,
    pub side: MarketSide,
    /// American moneyline price
    pub price: i32,
    /// Implied probability derived from `price` (0.0–1.0)
    pub implied_prob: f64,
    pub observed_at: DateTime<Utc>,
    /// Ingestion cycle that stored this row
    pub batch_id: Option<i64>,
}

impl OddsSnapshot {
    pub fn lane(&self) -> LaneKey {
        LaneKey::new(&self.event_id, &self.sportsbook, self.side)
    }
}

/// Which way a side's price moved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MovementDirection {
    /// Price came in: the side became more likely (e.g. +120 → +105)
    Shortened,
    /// Price drifted out: the side became less likely (e.g. -150 → +120)
    Lengthened,
}

impl MovementDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            MovementDirection::Shortened => "shortened",
            MovementDirection::Lengthened => "lengthened",
        }
    }
}

impl FromStr for MovementDirection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "shortened" => Ok(MovementDirection::Shortened),
            "lengthened" => Ok(MovementDirection::Lengthened),
            other => Err(format!("unknown movement direction '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

impl Confidence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Confidence::Low => "low",
            Confidence::Medium => "medium",
            Confidence::High => "high",
        }
    }
}

impl FromStr for Confidence {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Confidence::Low),
            "medium" => Ok(Confidence::Medium),
            "high" => Ok(Confidence::High),
            other => Err(format!("unknown confidence '{}'", other)),
        }
    }
}

/// A reverse line movement flagged by the detector.
///
/// References exactly one adjacent (prior, current) snapshot pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub id: Option<i64>,
    pub event_id: String,
    pub sportsbook: String,
    pub side: MarketSide,
    /// Observed-at of the current snapshot
    pub triggered_at: DateTime<Utc>,
    pub prior_price: i32,
    pub current_price: i32,
    pub prior_observed_at: DateTime<Utc>,
    pub current_observed_at: DateTime<Utc>,
    /// Absolute move on the cents scale
    pub movement_cents: i32,
    pub direction: MovementDirection,
    /// current implied probability − prior implied probability
    pub probability_delta: f64,
    /// movement_cents / threshold
    pub strength: f64,
    pub confidence: Confidence,
    /// e.g. "trend-v1" or "consensus-v1"
    pub rule_version: String,
    pub created_at: DateTime<Utc>,
}

/// Recommendation joined with its event for the API layer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecommendationView {
    #[serde(flatten)]
    pub recommendation: Recommendation,
    /// Sportsbook display name (the key when the book was never upserted)
    pub sportsbook_name: String,
    pub home_team: String,
    pub away_team: String,
    pub sport_key: String,
    pub league: Option<String>,
    pub commence_time: Option<DateTime<Utc>>,
    /// Participant the recommendation's side refers to (None for draw)
    pub team: Option<String>,
}

/// Which recommendations the API should list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecommendationScope {
    /// Event not started yet (or start time unknown)
    #[default]
    Live,
    /// Event already started
    History,
    All,
}

impl FromStr for RecommendationScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "live" => Ok(RecommendationScope::Live),
            "history" => Ok(RecommendationScope::History),
            "all" => Ok(RecommendationScope::All),
            other => Err(format!("unknown scope '{}'", other)),
        }
    }
}

/// A lane whose detection is stopped until the row is removed by an operator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HaltedLane {
    pub event_id: String,
    pub sportsbook: String,
    pub side: MarketSide,
    pub reason: String,
    pub halted_at: DateTime<Utc>,
}

/// What started an ingestion cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleTrigger {
    Timer,
    OnDemand,
    Queued,
}

impl CycleTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            CycleTrigger::Timer => "timer",
            CycleTrigger::OnDemand => "on_demand",
            CycleTrigger::Queued => "queued",
        }
    }
}

/// A failure confined to one event within a cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventFailure {
    pub event_id: String,
    /// "provider_fetch" | "malformed_snapshot" | "storage" | "detection"
    pub kind: String,
    pub message: String,
}

/// Outcome of one ingestion cycle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleReport {
    pub id: Option<i64>,
    pub trigger: CycleTrigger,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub events_attempted: usize,
    /// Events whose fetch, store and detection all succeeded
    pub success_count: usize,
    /// Events with at least one failure
    pub failure_count: usize,
    pub errors: Vec<EventFailure>,
    pub snapshots_stored: usize,
    pub duplicates_skipped: usize,
    pub malformed_rejected: usize,
    pub recommendations_emitted: usize,
    /// "running" | "completed" | "failed" | "cancelled"
    pub status: String,
}

impl CycleReport {
    pub fn new(trigger: CycleTrigger) -> Self {
        CycleReport {
            id: None,
            trigger,
            started_at: Utc::now(),
            finished_at: None,
            events_attempted: 0,
            success_count: 0,
            failure_count: 0,
            errors: Vec::new(),
            snapshots_stored: 0,
            duplicates_skipped: 0,
            malformed_rejected: 0,
            recommendations_emitted: 0,
            status: "running".to_string(),
        }
    }
}
