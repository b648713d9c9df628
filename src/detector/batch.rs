//! Per-cycle view of how every book moved for one event.
//!
//! The scheduler builds a `CycleBatch` only after all fetches and appends
//! for the event have finished, then hands the same immutable value to
//! every detection lane. Consensus reads therefore never observe a
//! half-written batch.

use std::collections::HashMap;

use crate::db::models::{MarketSide, OddsSnapshot};
use crate::odds::moneyline;

/// One lane's move within the cycle
#[derive(Debug, Clone, PartialEq)]
pub struct BatchMove {
    pub sportsbook: String,
    pub side: MarketSide,
    pub prior_price: i32,
    pub current_price: i32,
    /// Signed move in cents (positive = lengthened)
    pub cents: i32,
}

#[derive(Debug, Clone, Default)]
pub struct CycleBatch {
    event_id: String,
    moves: HashMap<MarketSide, Vec<BatchMove>>,
}

impl CycleBatch {
    pub fn new(event_id: &str) -> Self {
        CycleBatch {
            event_id: event_id.to_string(),
            moves: HashMap::new(),
        }
    }

    /// Record the move from `prior` to `current`. Snapshots of other events
    /// are ignored.
    pub fn record(&mut self, prior: &OddsSnapshot, current: &OddsSnapshot) {
        if current.event_id != self.event_id || prior.event_id != self.event_id {
            return;
        }
        self.moves.entry(current.side).or_default().push(BatchMove {
            sportsbook: current.sportsbook.clone(),
            side: current.side,
            prior_price: prior.price,
            current_price: current.price,
            cents: moneyline::movement_cents(prior.price, current.price),
        });
    }

    pub fn event_id(&self) -> &str {
        &self.event_id
    }

    pub fn len(&self) -> usize {
        self.moves.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Median move of every book except `exclude_book` on `side`.
    ///
    /// `None` when fewer than `min_books` other books moved this cycle.
    pub fn consensus_excluding(
        &self,
        side: MarketSide,
        exclude_book: &str,
        min_books: usize,
    ) -> Option<f64> {
        let mut cents: Vec<i32> = self
            .moves
            .get(&side)?
            .iter()
            .filter(|m| m.sportsbook != exclude_book)
            .map(|m| m.cents)
            .collect();
        if cents.is_empty() || cents.len() < min_books {
            return None;
        }
        cents.sort_unstable();
        let mid = cents.len() / 2;
        let median = if cents.len() % 2 == 0 {
            (cents[mid - 1] as f64 + cents[mid] as f64) / 2.0
        } else {
            cents[mid] as f64
        };
        Some(median)
    }
}
