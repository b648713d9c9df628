use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::{Arc, Mutex, MutexGuard};

pub mod models;
use models::*;

use crate::error::{LineError, Result};
use crate::odds::moneyline;

/// Thread-safe SQLite handle (single connection behind a mutex).
///
/// Every write goes through the one connection, so appends to the same
/// lane are serialized; the unique keys on `odds_snapshots` and
/// `recommendations` turn retried writes into conflicts instead of rows.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) the SQLite database at the given path
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        Self::from_connection(conn)
    }

    /// Private in-memory database, used by tests and dry runs
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        let db = Database {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    /// Run schema migrations (idempotent)
    fn run_migrations(&self) -> Result<()> {
        self.conn().execute_batch(SCHEMA_SQL)?;
        Ok(())
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        // A panic while holding the lock cannot leave SQLite half-written.
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ── Reference data ────────────────────────────────────────────────────────

    /// Insert an event or refresh its mutable fields (start time may be corrected)
    pub fn upsert_event(&self, event: &Event) -> Result<()> {
        self.conn().execute(
            "INSERT INTO events (id, provider, provider_event_id, sport_key, league,
                                 commence_time, home_team, away_team, updated_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)
             ON CONFLICT(id) DO UPDATE SET
                sport_key=excluded.sport_key,
                league=excluded.league,
                commence_time=excluded.commence_time,
                updated_at=excluded.updated_at",
            params![
                event.id,
                event.provider,
                event.provider_event_id,
                event.sport_key,
                event.league,
                event.commence_time,
                event.home_team,
                event.away_team,
                Utc::now(),
            ],
        )?;
        Ok(())
    }

    pub fn get_event(&self, id: &str) -> Result<Event> {
        self.conn()
            .query_row(
                "SELECT id, provider, provider_event_id, sport_key, league,
                        commence_time, home_team, away_team
                 FROM events WHERE id=?1",
                params![id],
                map_event,
            )
            .optional()?
            .ok_or_else(|| LineError::NotFound(format!("event {}", id)))
    }

    /// Insert a sportsbook if unseen; the display name is never overwritten
    pub fn upsert_sportsbook(&self, book: &Sportsbook) -> Result<()> {
        self.conn().execute(
            "INSERT INTO sportsbooks (key, name) VALUES (?1, ?2)
             ON CONFLICT(key) DO NOTHING",
            params![book.key, book.name],
        )?;
        Ok(())
    }

    pub fn list_sportsbooks(&self) -> Result<Vec<Sportsbook>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT key, name FROM sportsbooks ORDER BY key")?;
        let books = stmt
            .query_map([], |row| {
                Ok(Sportsbook {
                    key: row.get(0)?,
                    name: row.get(1)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(books)
    }

    // ── Odds snapshots ────────────────────────────────────────────────────────

    /// Append one observation to its lane's history.
    ///
    /// Fails with `MalformedSnapshot` before touching the database when the
    /// record is invalid, and with `DuplicateSnapshot` when the lane already
    /// holds a row at the same `observed_at`. Neither failure alters history.
    pub fn append_snapshot(
        &self,
        record: &SnapshotRecord,
        batch_id: Option<i64>,
    ) -> Result<OddsSnapshot> {
        validate_record(record)?;
        let observed_at = truncate_micros(record.observed_at);
        let implied_prob = moneyline::implied_probability(record.price);

        let conn = self.conn();
        let res = conn.execute(
            "INSERT INTO odds_snapshots (
                event_id, sportsbook, side, price, implied_prob,
                observed_at_us, batch_id, created_at
             ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8)",
            params![
                record.event_id,
                record.sportsbook,
                record.side.as_str(),
                record.price,
                implied_prob,
                observed_at.timestamp_micros(),
                batch_id,
                Utc::now(),
            ],
        );
        match res {
            Ok(_) => Ok(OddsSnapshot {
                id: Some(conn.last_insert_rowid()),
                event_id: record.event_id.clone(),
                sportsbook: record.sportsbook.clone(),
                side: record.side,
                price: record.price,
                implied_prob,
                observed_at,
                batch_id,
            }),
            Err(e) if is_unique_violation(&e) => Err(LineError::DuplicateSnapshot {
                lane: LaneKey::new(&record.event_id, &record.sportsbook, record.side),
                observed_at,
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Ordered history for a lane, oldest first. `since` is inclusive.
    pub fn history(
        &self,
        lane: &LaneKey,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<OddsSnapshot>> {
        let since_us = since.map(|t| t.timestamp_micros()).unwrap_or(i64::MIN);
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, event_id, sportsbook, side, price, implied_prob, observed_at_us, batch_id
             FROM odds_snapshots
             WHERE event_id=?1 AND sportsbook=?2 AND side=?3 AND observed_at_us >= ?4
             ORDER BY observed_at_us ASC",
        )?;
        let rows = stmt
            .query_map(
                params![lane.event_id, lane.sportsbook, lane.side.as_str(), since_us],
                map_snapshot,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Most recent snapshot for a lane
    pub fn latest(&self, lane: &LaneKey) -> Result<OddsSnapshot> {
        self.conn()
            .query_row(
                "SELECT id, event_id, sportsbook, side, price, implied_prob, observed_at_us, batch_id
                 FROM odds_snapshots
                 WHERE event_id=?1 AND sportsbook=?2 AND side=?3
                 ORDER BY observed_at_us DESC LIMIT 1",
                params![lane.event_id, lane.sportsbook, lane.side.as_str()],
                map_snapshot,
            )
            .optional()?
            .ok_or_else(|| LineError::NotFound(format!("no snapshots for {}", lane)))
    }

    /// The snapshot immediately preceding `at` in the lane, if any
    pub fn previous_before(
        &self,
        lane: &LaneKey,
        at: DateTime<Utc>,
    ) -> Result<Option<OddsSnapshot>> {
        Ok(self.window_before(lane, at, 1)?.pop())
    }

    /// The snapshot immediately following `at` in the lane, if any
    pub fn next_after(&self, lane: &LaneKey, at: DateTime<Utc>) -> Result<Option<OddsSnapshot>> {
        let row = self
            .conn()
            .query_row(
                "SELECT id, event_id, sportsbook, side, price, implied_prob, observed_at_us, batch_id
                 FROM odds_snapshots
                 WHERE event_id=?1 AND sportsbook=?2 AND side=?3 AND observed_at_us > ?4
                 ORDER BY observed_at_us ASC LIMIT 1",
                params![
                    lane.event_id,
                    lane.sportsbook,
                    lane.side.as_str(),
                    at.timestamp_micros()
                ],
                map_snapshot,
            )
            .optional()?;
        Ok(row)
    }

    /// Up to `n` snapshots strictly before `at`, returned oldest first
    pub fn window_before(
        &self,
        lane: &LaneKey,
        at: DateTime<Utc>,
        n: usize,
    ) -> Result<Vec<OddsSnapshot>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, event_id, sportsbook, side, price, implied_prob, observed_at_us, batch_id
             FROM odds_snapshots
             WHERE event_id=?1 AND sportsbook=?2 AND side=?3 AND observed_at_us < ?4
             ORDER BY observed_at_us DESC LIMIT ?5",
        )?;
        let mut rows = stmt
            .query_map(
                params![
                    lane.event_id,
                    lane.sportsbook,
                    lane.side.as_str(),
                    at.timestamp_micros(),
                    n as i64
                ],
                map_snapshot,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.reverse();
        Ok(rows)
    }

    pub fn count_snapshots(&self) -> Result<i64> {
        let n = self
            .conn()
            .query_row("SELECT COUNT(*) FROM odds_snapshots", [], |r| r.get(0))?;
        Ok(n)
    }

    // ── Recommendations ───────────────────────────────────────────────────────

    /// Persist a recommendation once per (lane, prior, current) pair.
    ///
    /// Returns `None` when the pair already produced a recommendation.
    pub fn insert_recommendation(&self, rec: &Recommendation) -> Result<Option<i64>> {
        let conn = self.conn();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO recommendations (
                event_id, sportsbook, side, triggered_at, prior_price, current_price,
                prior_observed_at_us, current_observed_at_us, movement_cents, direction,
                probability_delta, strength, confidence, rule_version, created_at
             ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15)",
            params![
                rec.event_id,
                rec.sportsbook,
                rec.side.as_str(),
                rec.triggered_at,
                rec.prior_price,
                rec.current_price,
                rec.prior_observed_at.timestamp_micros(),
                rec.current_observed_at.timestamp_micros(),
                rec.movement_cents,
                rec.direction.as_str(),
                rec.probability_delta,
                rec.strength,
                rec.confidence.as_str(),
                rec.rule_version,
                rec.created_at,
            ],
        )?;
        if inserted == 0 {
            return Ok(None);
        }
        Ok(Some(conn.last_insert_rowid()))
    }

    /// Whether the pair ending at `current_observed_at` already has a recommendation
    pub fn recommendation_exists(
        &self,
        lane: &LaneKey,
        prior_observed_at: DateTime<Utc>,
        current_observed_at: DateTime<Utc>,
    ) -> Result<bool> {
        let n: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM recommendations
             WHERE event_id=?1 AND sportsbook=?2 AND side=?3
               AND prior_observed_at_us=?4 AND current_observed_at_us=?5",
            params![
                lane.event_id,
                lane.sportsbook,
                lane.side.as_str(),
                prior_observed_at.timestamp_micros(),
                current_observed_at.timestamp_micros(),
            ],
            |r| r.get(0),
        )?;
        Ok(n > 0)
    }

    /// Current observed-at of the newest recommendation for a lane strictly before `at`
    pub fn last_recommendation_before(
        &self,
        lane: &LaneKey,
        at: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>> {
        let us: Option<i64> = self
            .conn()
            .query_row(
                "SELECT current_observed_at_us FROM recommendations
                 WHERE event_id=?1 AND sportsbook=?2 AND side=?3 AND current_observed_at_us < ?4
                 ORDER BY current_observed_at_us DESC LIMIT 1",
                params![
                    lane.event_id,
                    lane.sportsbook,
                    lane.side.as_str(),
                    at.timestamp_micros()
                ],
                |r| r.get(0),
            )
            .optional()?;
        Ok(us.map(from_micros))
    }

    /// Recommendations newest first, joined with their event
    pub fn list_recommendations(
        &self,
        limit: i64,
        scope: RecommendationScope,
        now: DateTime<Utc>,
    ) -> Result<Vec<RecommendationView>> {
        let filter = match scope {
            RecommendationScope::Live => "WHERE (e.commence_time IS NULL OR e.commence_time >= ?2)",
            RecommendationScope::History => "WHERE e.commence_time IS NOT NULL AND e.commence_time < ?2",
            RecommendationScope::All => "WHERE ?2 IS NOT NULL",
        };
        let sql = format!(
            "SELECT r.id, r.event_id, r.sportsbook, r.side, r.triggered_at, r.prior_price,
                    r.current_price, r.prior_observed_at_us, r.current_observed_at_us,
                    r.movement_cents, r.direction, r.probability_delta, r.strength,
                    r.confidence, r.rule_version, r.created_at,
                    e.home_team, e.away_team, e.sport_key, e.league, e.commence_time,
                    s.name
             FROM recommendations r
             JOIN events e ON e.id = r.event_id
             LEFT JOIN sportsbooks s ON s.key = r.sportsbook
             {}
             ORDER BY r.triggered_at DESC, r.id DESC LIMIT ?1",
            filter
        );
        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![limit, now], |row| {
                let recommendation = map_recommendation(row)?;
                let home_team: String = row.get(16)?;
                let away_team: String = row.get(17)?;
                let team = match recommendation.side {
                    MarketSide::Home => Some(home_team.clone()),
                    MarketSide::Away => Some(away_team.clone()),
                    MarketSide::Draw => None,
                };
                let sportsbook_name: Option<String> = row.get(21)?;
                Ok(RecommendationView {
                    sportsbook_name: sportsbook_name
                        .unwrap_or_else(|| recommendation.sportsbook.clone()),
                    recommendation,
                    home_team,
                    away_team,
                    sport_key: row.get(18)?,
                    league: row.get(19)?,
                    commence_time: row.get(20)?,
                    team,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Recommendations for one lane, oldest first
    pub fn recommendations_for_lane(&self, lane: &LaneKey) -> Result<Vec<Recommendation>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, event_id, sportsbook, side, triggered_at, prior_price,
                    current_price, prior_observed_at_us, current_observed_at_us,
                    movement_cents, direction, probability_delta, strength,
                    confidence, rule_version, created_at
             FROM recommendations
             WHERE event_id=?1 AND sportsbook=?2 AND side=?3
             ORDER BY current_observed_at_us ASC",
        )?;
        let rows = stmt
            .query_map(
                params![lane.event_id, lane.sportsbook, lane.side.as_str()],
                map_recommendation,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn count_recommendations(&self) -> Result<i64> {
        let n = self
            .conn()
            .query_row("SELECT COUNT(*) FROM recommendations", [], |r| r.get(0))?;
        Ok(n)
    }

    // ── Halted lanes ──────────────────────────────────────────────────────────

    pub fn halt_lane(&self, lane: &LaneKey, reason: &str) -> Result<()> {
        self.conn().execute(
            "INSERT INTO halted_lanes (event_id, sportsbook, side, reason, halted_at)
             VALUES (?1,?2,?3,?4,?5)
             ON CONFLICT(event_id, sportsbook, side) DO NOTHING",
            params![
                lane.event_id,
                lane.sportsbook,
                lane.side.as_str(),
                reason,
                Utc::now()
            ],
        )?;
        Ok(())
    }

    pub fn is_lane_halted(&self, lane: &LaneKey) -> Result<bool> {
        let n: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM halted_lanes WHERE event_id=?1 AND sportsbook=?2 AND side=?3",
            params![lane.event_id, lane.sportsbook, lane.side.as_str()],
            |r| r.get(0),
        )?;
        Ok(n > 0)
    }

    pub fn list_halted_lanes(&self) -> Result<Vec<HaltedLane>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT event_id, sportsbook, side, reason, halted_at
             FROM halted_lanes ORDER BY halted_at DESC",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(HaltedLane {
                    event_id: row.get(0)?,
                    sportsbook: row.get(1)?,
                    side: parse_side(row, 2)?,
                    reason: row.get(3)?,
                    halted_at: row.get(4)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // ── Ingestion cycles ──────────────────────────────────────────────────────

    /// Record the start of a cycle; the returned id doubles as the batch id
    pub fn begin_cycle(&self, report: &CycleReport) -> Result<i64> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO ingest_cycles (trigger, started_at, status) VALUES (?1, ?2, ?3)",
            params![report.trigger.as_str(), report.started_at, report.status],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Store the final counters and per-event errors of a cycle
    pub fn finish_cycle(&self, report: &CycleReport) -> Result<()> {
        let id = report
            .id
            .ok_or_else(|| LineError::NotFound("cycle report has no id".to_string()))?;
        let errors = serde_json::to_string(&report.errors)?;
        self.conn().execute(
            "UPDATE ingest_cycles SET
                finished_at=?1, events_attempted=?2, success_count=?3, failure_count=?4,
                errors=?5, snapshots_stored=?6, duplicates_skipped=?7,
                malformed_rejected=?8, recommendations_emitted=?9, status=?10
             WHERE id=?11",
            params![
                report.finished_at,
                report.events_attempted as i64,
                report.success_count as i64,
                report.failure_count as i64,
                errors,
                report.snapshots_stored as i64,
                report.duplicates_skipped as i64,
                report.malformed_rejected as i64,
                report.recommendations_emitted as i64,
                report.status,
                id,
            ],
        )?;
        Ok(())
    }

    /// Close a cycle that was dropped before it could report. Only a row
    /// still `running` is touched.
    pub fn cancel_cycle(&self, id: i64, at: DateTime<Utc>) -> Result<bool> {
        let n = self.conn().execute(
            "UPDATE ingest_cycles SET finished_at=?1, status='cancelled'
             WHERE id=?2 AND status='running'",
            params![at, id],
        )?;
        Ok(n > 0)
    }

    /// Most recent cycles first
    pub fn list_cycles(&self, limit: i64) -> Result<Vec<CycleReport>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, trigger, started_at, finished_at, events_attempted, success_count,
                    failure_count, errors, snapshots_stored, duplicates_skipped,
                    malformed_rejected, recommendations_emitted, status
             FROM ingest_cycles ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit], map_cycle)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

// ── SQL helpers ────────────────────────────────────────────────────────────────

fn validate_record(record: &SnapshotRecord) -> Result<()> {
    if record.event_id.trim().is_empty() {
        return Err(LineError::MalformedSnapshot("empty event id".to_string()));
    }
    if record.sportsbook.trim().is_empty() {
        return Err(LineError::MalformedSnapshot(format!(
            "empty sportsbook for event {}",
            record.event_id
        )));
    }
    if !moneyline::is_valid_price(record.price) {
        return Err(LineError::MalformedSnapshot(format!(
            "price {} is not a moneyline price ({} {} {})",
            record.price, record.event_id, record.sportsbook, record.side
        )));
    }
    Ok(())
}

/// Snapshot timestamps are keyed at microsecond precision
fn truncate_micros(at: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(at.timestamp_micros()).unwrap_or(at)
}

fn from_micros(us: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(us).unwrap_or_default()
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

fn parse_side(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<MarketSide> {
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e: String| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, e.into())
    })
}

fn parse_text<T: std::str::FromStr<Err = String>>(
    row: &rusqlite::Row,
    idx: usize,
) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e: String| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, e.into())
    })
}

fn map_event(row: &rusqlite::Row) -> rusqlite::Result<Event> {
    Ok(Event {
        id: row.get(0)?,
        provider: row.get(1)?,
        provider_event_id: row.get(2)?,
        sport_key: row.get(3)?,
        league: row.get(4)?,
        commence_time: row.get(5)?,
        home_team: row.get(6)?,
        away_team: row.get(7)?,
    })
}

fn map_snapshot(row: &rusqlite::Row) -> rusqlite::Result<OddsSnapshot> {
    Ok(OddsSnapshot {
        id: row.get(0)?,
        event_id: row.get(1)?,
        sportsbook: row.get(2)?,
        side: parse_side(row, 3)?,
        price: row.get(4)?,
        implied_prob: row.get(5)?,
        observed_at: from_micros(row.get(6)?),
        batch_id: row.get(7)?,
    })
}

fn map_recommendation(row: &rusqlite::Row) -> rusqlite::Result<Recommendation> {
    Ok(Recommendation {
        id: row.get(0)?,
        event_id: row.get(1)?,
        sportsbook: row.get(2)?,
        side: parse_side(row, 3)?,
        triggered_at: row.get(4)?,
        prior_price: row.get(5)?,
        current_price: row.get(6)?,
        prior_observed_at: from_micros(row.get(7)?),
        current_observed_at: from_micros(row.get(8)?),
        movement_cents: row.get(9)?,
        direction: parse_text(row, 10)?,
        probability_delta: row.get(11)?,
        strength: row.get(12)?,
        confidence: parse_text(row, 13)?,
        rule_version: row.get(14)?,
        created_at: row.get(15)?,
    })
}

fn map_cycle(row: &rusqlite::Row) -> rusqlite::Result<CycleReport> {
    let trigger = match row.get::<_, String>(1)?.as_str() {
        "timer" => CycleTrigger::Timer,
        "queued" => CycleTrigger::Queued,
        _ => CycleTrigger::OnDemand,
    };
    let errors: Option<String> = row.get(7)?;
    let errors = errors
        .and_then(|raw| serde_json::from_str(&raw).ok())
        .unwrap_or_default();
    Ok(CycleReport {
        id: row.get(0)?,
        trigger,
        started_at: row.get(2)?,
        finished_at: row.get(3)?,
        events_attempted: row.get::<_, i64>(4)? as usize,
        success_count: row.get::<_, i64>(5)? as usize,
        failure_count: row.get::<_, i64>(6)? as usize,
        errors,
        snapshots_stored: row.get::<_, i64>(8)? as usize,
        duplicates_skipped: row.get::<_, i64>(9)? as usize,
        malformed_rejected: row.get::<_, i64>(10)? as usize,
        recommendations_emitted: row.get::<_, i64>(11)? as usize,
        status: row.get(12)?,
    })
}

/// SQLite schema (idempotent CREATE IF NOT EXISTS)
pub const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS events (
    id                TEXT    PRIMARY KEY,
    provider          TEXT    NOT NULL,
    provider_event_id TEXT    NOT NULL,
    sport_key         TEXT    NOT NULL,
    league            TEXT,
    commence_time     TEXT,
    home_team         TEXT    NOT NULL,
    away_team         TEXT    NOT NULL,
    updated_at        TEXT    NOT NULL
);

CREATE TABLE IF NOT EXISTS sportsbooks (
    key   TEXT PRIMARY KEY,
    name  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS odds_snapshots (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    event_id        TEXT    NOT NULL,
    sportsbook      TEXT    NOT NULL,
    side            TEXT    NOT NULL,
    price           INTEGER NOT NULL,
    implied_prob    REAL    NOT NULL,
    observed_at_us  INTEGER NOT NULL,
    batch_id        INTEGER,
    created_at      TEXT    NOT NULL,
    UNIQUE (event_id, sportsbook, side, observed_at_us)
);

CREATE TABLE IF NOT EXISTS recommendations (
    id                      INTEGER PRIMARY KEY AUTOINCREMENT,
    event_id                TEXT    NOT NULL,
    sportsbook              TEXT    NOT NULL,
    side                    TEXT    NOT NULL,
    triggered_at            TEXT    NOT NULL,
    prior_price             INTEGER NOT NULL,
    current_price           INTEGER NOT NULL,
    prior_observed_at_us    INTEGER NOT NULL,
    current_observed_at_us  INTEGER NOT NULL,
    movement_cents          INTEGER NOT NULL,
    direction               TEXT    NOT NULL,
    probability_delta       REAL    NOT NULL,
    strength                REAL    NOT NULL,
    confidence              TEXT    NOT NULL,
    rule_version            TEXT    NOT NULL,
    created_at              TEXT    NOT NULL,
    UNIQUE (event_id, sportsbook, side, prior_observed_at_us, current_observed_at_us)
);

CREATE TABLE IF NOT EXISTS halted_lanes (
    event_id    TEXT NOT NULL,
    sportsbook  TEXT NOT NULL,
    side        TEXT NOT NULL,
    reason      TEXT NOT NULL,
    halted_at   TEXT NOT NULL,
    PRIMARY KEY (event_id, sportsbook, side)
);

CREATE TABLE IF NOT EXISTS ingest_cycles (
    id                      INTEGER PRIMARY KEY AUTOINCREMENT,
    trigger                 TEXT    NOT NULL,
    started_at              TEXT    NOT NULL,
    finished_at             TEXT,
    events_attempted        INTEGER NOT NULL DEFAULT 0,
    success_count           INTEGER NOT NULL DEFAULT 0,
    failure_count           INTEGER NOT NULL DEFAULT 0,
    errors                  TEXT,
    snapshots_stored        INTEGER NOT NULL DEFAULT 0,
    duplicates_skipped      INTEGER NOT NULL DEFAULT 0,
    malformed_rejected      INTEGER NOT NULL DEFAULT 0,
    recommendations_emitted INTEGER NOT NULL DEFAULT 0,
    status                  TEXT    NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_snapshots_event ON odds_snapshots(event_id);
CREATE INDEX IF NOT EXISTS idx_recommendations_triggered ON recommendations(triggered_at);
CREATE INDEX IF NOT EXISTS idx_events_commence ON events(commence_time);
"#;
