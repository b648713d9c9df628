//! Reverse line movement detection.
//!
//! Every appended snapshot is compared with its true previous-by-time
//! snapshot in the same lane (event, sportsbook, side). A move qualifies
//! when its magnitude is strictly above the threshold and it runs against
//! the expected direction:
//!
//! - **consensus**: the median move of the other books for the same
//!   event/side in this cycle's batch;
//! - **trend**: the same book's drift over the preceding window, used alone
//!   in `trend` mode and as the fallback when no consensus is available.
//!
//! Emission is at most once per (prior, current) pair; the recommendation
//! table's unique key makes re-processing a no-op.

pub mod batch;

pub use batch::CycleBatch;

use chrono::{Duration, Utc};
use clap::ValueEnum;
use serde::Serialize;
use tracing::{debug, error, info};

use crate::db::models::{Confidence, MovementDirection, OddsSnapshot, Recommendation};
use crate::db::Database;
use crate::error::{LineError, Result};
use crate::odds::moneyline;

/// Other books needed on a side before their median counts as consensus.
const MIN_CONSENSUS_BOOKS: usize = 2;

pub const TREND_RULE: &str = "trend-v1";
pub const CONSENSUS_RULE: &str = "consensus-v1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectionStrategy {
    /// Single-book: a sharp move against (or out of) the book's own recent trend
    Trend,
    /// Cross-book: a move against the other books' median, trend as fallback
    Consensus,
}

#[derive(Debug, Clone)]
pub struct DetectorConfig {
    pub strategy: DetectionStrategy,
    /// Snapshots preceding the new one that make up the trend window
    pub window_size: usize,
    /// Minimum move in cents; a move exactly at the threshold does not trigger
    pub movement_threshold: f64,
    /// 0 disables the cooldown
    pub cooldown_minutes: i64,
    pub medium_multiplier: f64,
    pub high_multiplier: f64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        DetectorConfig {
            strategy: DetectionStrategy::Consensus,
            window_size: 5,
            movement_threshold: 20.0,
            cooldown_minutes: 0,
            medium_multiplier: 2.0,
            high_multiplier: 3.0,
        }
    }
}

/// A qualifying move, before it is turned into a `Recommendation`
#[derive(Debug, Clone, PartialEq)]
pub struct Movement {
    /// Signed cents (positive = lengthened)
    pub cents: i32,
    pub rule_version: &'static str,
}

/// Decide whether `current` is a reverse move relative to `window`.
///
/// `window` is the lane's history before `current`, oldest first; its last
/// element is the prior snapshot. `consensus` is the other books' median
/// move for the same side in this cycle.
pub fn classify(
    window: &[OddsSnapshot],
    current: &OddsSnapshot,
    consensus: Option<f64>,
    config: &DetectorConfig,
) -> Option<Movement> {
    let prior = window.last()?;
    let cents = moneyline::movement_cents(prior.price, current.price);
    if (cents.unsigned_abs() as f64) <= config.movement_threshold {
        return None;
    }

    if config.strategy == DetectionStrategy::Consensus {
        if let Some(median) = consensus.filter(|m| *m != 0.0) {
            let opposes = (cents > 0) != (median > 0.0);
            return opposes.then_some(Movement {
                cents,
                rule_version: CONSENSUS_RULE,
            });
        }
    }

    // Drift across the window leading up to (and including) the prior.
    let trend = match window.first() {
        Some(first) if window.len() > 1 => moneyline::movement_cents(first.price, prior.price),
        _ => 0,
    };
    let continues_trend = trend != 0 && (trend > 0) == (cents > 0);
    if continues_trend {
        return None;
    }
    Some(Movement {
        cents,
        rule_version: TREND_RULE,
    })
}

/// Confidence bucket for a move of `magnitude` cents.
pub fn confidence_bucket(magnitude: f64, config: &DetectorConfig) -> Confidence {
    if magnitude >= config.movement_threshold * config.high_multiplier {
        Confidence::High
    } else if magnitude >= config.movement_threshold * config.medium_multiplier {
        Confidence::Medium
    } else {
        Confidence::Low
    }
}

/// Verify a window is strictly time-ordered, belongs to `current`'s lane and
/// ends before `current`.
fn check_order(window: &[OddsSnapshot], current: &OddsSnapshot) -> std::result::Result<(), String> {
    let lane = current.lane();
    if let Some(s) = window.iter().find(|s| s.lane() != lane) {
        return Err(format!("snapshot from lane {} in window", s.lane()));
    }
    if window.windows(2).any(|w| w[0].observed_at >= w[1].observed_at) {
        return Err("history window is not strictly ordered by observed_at".to_string());
    }
    if let Some(prior) = window.last() {
        if prior.observed_at >= current.observed_at {
            return Err(format!(
                "prior at {} is not before current at {}",
                prior.observed_at, current.observed_at
            ));
        }
    }
    Ok(())
}

/// Runs `classify` against stored history and persists what it finds.
#[derive(Clone)]
pub struct Detector {
    db: Database,
    config: DetectorConfig,
}

impl Detector {
    pub fn new(db: Database, config: DetectorConfig) -> Self {
        Detector { db, config }
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// Detection for a freshly appended snapshot.
    ///
    /// Evaluates `snapshot` against its true predecessor and, when the
    /// snapshot landed in the middle of history (late arrival), re-evaluates
    /// its successor whose predecessor just changed. Returns newly persisted
    /// recommendations.
    pub fn on_snapshot(
        &self,
        snapshot: &OddsSnapshot,
        batch: Option<&CycleBatch>,
    ) -> Result<Vec<Recommendation>> {
        let mut emitted = Vec::new();
        if let Some(rec) = self.evaluate(snapshot, batch)? {
            emitted.push(rec);
        }
        if let Some(successor) = self.db.next_after(&snapshot.lane(), snapshot.observed_at)? {
            debug!(
                "Late snapshot on {} at {}; re-evaluating successor at {}",
                snapshot.lane(),
                snapshot.observed_at,
                successor.observed_at
            );
            // The successor belongs to an earlier cycle, so this batch says
            // nothing about it.
            if let Some(rec) = self.evaluate(&successor, None)? {
                emitted.push(rec);
            }
        }
        Ok(emitted)
    }

    /// Evaluate the pair ending at `current`; persist and return a new
    /// recommendation if it qualifies and was not emitted before.
    pub fn evaluate(
        &self,
        current: &OddsSnapshot,
        batch: Option<&CycleBatch>,
    ) -> Result<Option<Recommendation>> {
        let lane = current.lane();
        if self.db.is_lane_halted(&lane)? {
            debug!("Detection halted on {}; skipping", lane);
            return Ok(None);
        }

        let window = self
            .db
            .window_before(&lane, current.observed_at, self.config.window_size.max(1))?;
        self.evaluate_window(&window, current, batch)
    }

    /// Evaluate `current` against an already-read `window` (oldest first).
    ///
    /// A window that is out of order, from another lane, or not strictly
    /// before `current` halts the lane and fails with
    /// `DetectionInvariantViolation`.
    pub fn evaluate_window(
        &self,
        window: &[OddsSnapshot],
        current: &OddsSnapshot,
        batch: Option<&CycleBatch>,
    ) -> Result<Option<Recommendation>> {
        let lane = current.lane();
        if let Err(reason) = check_order(window, current) {
            error!("Detection invariant violated on {}: {} (lane halted)", lane, reason);
            self.db.halt_lane(&lane, &reason)?;
            return Err(LineError::DetectionInvariantViolation { lane, reason });
        }
        let prior = match window.last() {
            Some(p) => p.clone(),
            None => return Ok(None),
        };

        if self
            .db
            .recommendation_exists(&lane, prior.observed_at, current.observed_at)?
        {
            return Ok(None);
        }

        let consensus = batch.and_then(|b| {
            b.consensus_excluding(current.side, &current.sportsbook, MIN_CONSENSUS_BOOKS)
        });
        let movement = match classify(window, current, consensus, &self.config) {
            Some(m) => m,
            None => return Ok(None),
        };

        if self.config.cooldown_minutes > 0 {
            if let Some(last) = self.db.last_recommendation_before(&lane, current.observed_at)? {
                if current.observed_at - last < Duration::minutes(self.config.cooldown_minutes) {
                    debug!("Cooldown active on {} (last trigger {})", lane, last);
                    return Ok(None);
                }
            }
        }

        let magnitude = movement.cents.unsigned_abs() as f64;
        let mut rec = Recommendation {
            id: None,
            event_id: current.event_id.clone(),
            sportsbook: current.sportsbook.clone(),
            side: current.side,
            triggered_at: current.observed_at,
            prior_price: prior.price,
            current_price: current.price,
            prior_observed_at: prior.observed_at,
            current_observed_at: current.observed_at,
            movement_cents: movement.cents.abs(),
            direction: if movement.cents > 0 {
                MovementDirection::Lengthened
            } else {
                MovementDirection::Shortened
            },
            probability_delta: current.implied_prob - prior.implied_prob,
            strength: magnitude / self.config.movement_threshold,
            confidence: confidence_bucket(magnitude, &self.config),
            rule_version: movement.rule_version.to_string(),
            created_at: Utc::now(),
        };

        match self.db.insert_recommendation(&rec)? {
            Some(id) => {
                rec.id = Some(id);
                info!(
                    "Reverse line movement on {}: {} → {} ({} cents, {}, {})",
                    lane,
                    rec.prior_price,
                    rec.current_price,
                    rec.movement_cents,
                    rec.confidence.as_str(),
                    rec.rule_version
                );
                Ok(Some(rec))
            }
            None => Ok(None),
        }
    }
}
