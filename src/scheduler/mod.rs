//! Ingestion cycle orchestration.
//!
//! One cycle walks every tracked event through
//! `Idle → Fetching → Storing → Detecting → Idle`, with `Failed` reachable
//! from any stage when the cycle as a whole cannot continue. Entry into
//! `Fetching` is a compare-and-swap on the scheduler-owned state, so at most
//! one cycle is ever active. Each stage finishes for all events before the
//! next starts, which is the barrier the consensus batch relies on.
//!
//! ```text
//!  timer tick ─┐
//!              ├─▶ trigger() ──CAS──▶ run_cycle()
//!  POST ingest ┘        │                 │ discover → fetch (concurrent)
//!                       │ busy            │ → append → batch → detect
//!                       ▼                 ▼
//!           Rejected / Queued        CycleReport (persisted)
//! ```

use anyhow::Context;
use chrono::Utc;
use clap::ValueEnum;
use futures_util::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::db::models::{
    CycleReport, CycleTrigger, Event, EventFailure, OddsSnapshot, SnapshotRecord, Sportsbook,
};
use crate::db::Database;
use crate::detector::{CycleBatch, Detector};
use crate::error::LineError;
use crate::odds::OddsProvider;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum CycleState {
    Idle = 0,
    Fetching = 1,
    Storing = 2,
    Detecting = 3,
    Failed = 4,
}

impl CycleState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => CycleState::Fetching,
            2 => CycleState::Storing,
            3 => CycleState::Detecting,
            4 => CycleState::Failed,
            _ => CycleState::Idle,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self,
            CycleState::Fetching | CycleState::Storing | CycleState::Detecting
        )
    }
}

/// What happens to a trigger that arrives while a cycle is running
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OverlapPolicy {
    /// Answer `CycleInProgress` and drop the request
    Reject,
    /// Run once more after the active cycle; further requests coalesce
    Queue,
}

/// Result of asking for a cycle
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TriggerOutcome {
    Completed { report: CycleReport },
    Queued,
    Rejected { reason: String },
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub sports: Vec<String>,
    /// Sportsbook keys to store; empty keeps every book the feed returns
    pub tracked_sportsbooks: HashSet<String>,
    pub provider_timeout: Duration,
    pub fetch_concurrency: usize,
    pub overlap_policy: OverlapPolicy,
    /// `None` disables the timer; cycles then run on demand only
    pub cycle_interval: Option<Duration>,
    pub run_on_start: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            sports: vec!["basketball_nba".to_string()],
            tracked_sportsbooks: HashSet::new(),
            provider_timeout: Duration::from_secs(20),
            fetch_concurrency: 4,
            overlap_policy: OverlapPolicy::Reject,
            cycle_interval: Some(Duration::from_secs(900)),
            run_on_start: true,
        }
    }
}

/// Drives ingestion cycles. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    db: Database,
    detector: Detector,
    providers: Vec<Arc<dyn OddsProvider>>,
    config: SchedulerConfig,
    state: AtomicU8,
    pending: AtomicBool,
    /// Row id of the cycle being executed, 0 when none
    current_cycle: AtomicI64,
}

/// Ownership of the scheduler for one `trigger` call.
///
/// Dropped without `release` (the trigger future was cancelled mid-cycle):
/// closes the open cycle row as `cancelled`, forgets queued requests and
/// leaves the scheduler in `Failed`, from which the next trigger may start.
struct Claim<'a> {
    scheduler: &'a Scheduler,
    released: bool,
}

impl<'a> Claim<'a> {
    fn new(scheduler: &'a Scheduler) -> Self {
        Claim {
            scheduler,
            released: false,
        }
    }

    fn release(mut self) {
        self.released = true;
    }
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let inner = &self.scheduler.inner;
        let id = inner.current_cycle.swap(0, Ordering::AcqRel);
        if id != 0 {
            warn!("Ingestion cycle #{} cancelled before completion", id);
            if let Err(e) = inner.db.cancel_cycle(id, Utc::now()) {
                warn!("Failed to mark cycle #{} cancelled: {}", id, e);
            }
        } else {
            warn!("Ingestion cycle cancelled before it was recorded");
        }
        inner.pending.store(false, Ordering::Release);
        self.scheduler.set_state(CycleState::Failed);
    }
}

/// Per-event progress through one cycle
struct EventWork {
    event: Event,
    records: Vec<SnapshotRecord>,
    stored: Vec<OddsSnapshot>,
    failed: bool,
}

impl Scheduler {
    pub fn new(
        db: Database,
        detector: Detector,
        providers: Vec<Arc<dyn OddsProvider>>,
        config: SchedulerConfig,
    ) -> Self {
        Scheduler {
            inner: Arc::new(SchedulerInner {
                db,
                detector,
                providers,
                config,
                state: AtomicU8::new(CycleState::Idle as u8),
                pending: AtomicBool::new(false),
                current_cycle: AtomicI64::new(0),
            }),
        }
    }

    pub fn state(&self) -> CycleState {
        CycleState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    pub fn detector(&self) -> &Detector {
        &self.inner.detector
    }

    fn set_state(&self, state: CycleState) {
        debug!("Scheduler state → {:?}", state);
        self.inner.state.store(state as u8, Ordering::Release);
    }

    /// Claim the scheduler: `Idle | Failed → Fetching`.
    fn try_begin(&self) -> bool {
        [CycleState::Idle, CycleState::Failed].iter().any(|from| {
            self.inner
                .state
                .compare_exchange(
                    *from as u8,
                    CycleState::Fetching as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
        })
    }

    /// Request a cycle. Never runs two cycles at once: a request that finds
    /// one active is rejected or queued per `overlap_policy`.
    pub async fn trigger(&self, trigger: CycleTrigger) -> TriggerOutcome {
        if !self.try_begin() {
            match self.inner.config.overlap_policy {
                OverlapPolicy::Reject => {
                    info!(
                        "Ingestion cycle requested ({}) while one is in progress; rejected",
                        trigger.as_str()
                    );
                    return TriggerOutcome::Rejected {
                        reason: LineError::CycleInProgress.to_string(),
                    };
                }
                OverlapPolicy::Queue => {
                    self.inner.pending.store(true, Ordering::Release);
                    // The active cycle may have released between the CAS and the store.
                    if !self.try_begin() {
                        info!(
                            "Ingestion cycle requested ({}) while one is in progress; queued",
                            trigger.as_str()
                        );
                        return TriggerOutcome::Queued;
                    }
                    self.inner.pending.store(false, Ordering::Release);
                }
            }
        }

        let claim = Claim::new(self);
        let report = self.run_cycle(trigger).await;
        self.finish_and_drain(&report).await;
        claim.release();
        TriggerOutcome::Completed { report }
    }

    /// Run queued requests while still owning the scheduler, then release it.
    async fn finish_and_drain(&self, first: &CycleReport) {
        let mut last_failed = first.status == "failed";
        loop {
            if self.inner.pending.swap(false, Ordering::AcqRel) {
                self.set_state(CycleState::Fetching);
                let report = self.run_cycle(CycleTrigger::Queued).await;
                last_failed = report.status == "failed";
                continue;
            }
            self.set_state(if last_failed {
                CycleState::Failed
            } else {
                CycleState::Idle
            });
            // A request queued after the swap but before the release.
            if self.inner.pending.load(Ordering::Acquire) && self.try_begin() {
                self.inner.pending.store(false, Ordering::Release);
                let report = self.run_cycle(CycleTrigger::Queued).await;
                last_failed = report.status == "failed";
                continue;
            }
            break;
        }
    }

    /// Execute one full cycle. The caller must own the scheduler state.
    async fn run_cycle(&self, trigger: CycleTrigger) -> CycleReport {
        let mut report = CycleReport::new(trigger);
        match self.inner.db.begin_cycle(&report) {
            Ok(id) => {
                report.id = Some(id);
                self.inner.current_cycle.store(id, Ordering::Release);
            }
            Err(e) => {
                error!("Could not record ingestion cycle start: {}", e);
                report.status = "failed".to_string();
                report.finished_at = Some(Utc::now());
                return report;
            }
        }
        let cycle_id = report.id.unwrap_or_default();
        info!("Ingestion cycle #{} started ({})", cycle_id, trigger.as_str());

        match self.execute(&mut report).await {
            Ok(()) => report.status = "completed".to_string(),
            Err(e) => {
                self.set_state(CycleState::Failed);
                error!("Ingestion cycle #{} failed: {:#}", cycle_id, e);
                report.status = "failed".to_string();
            }
        }
        report.finished_at = Some(Utc::now());

        if let Err(e) = self.inner.db.finish_cycle(&report) {
            warn!("Failed to persist report for cycle #{}: {}", cycle_id, e);
        }
        self.inner.current_cycle.store(0, Ordering::Release);
        info!(
            "Ingestion cycle #{} {}: {} events, {} ok, {} failed, {} stored, {} duplicate, {} malformed, {} recommendations",
            cycle_id,
            report.status,
            report.events_attempted,
            report.success_count,
            report.failure_count,
            report.snapshots_stored,
            report.duplicates_skipped,
            report.malformed_rejected,
            report.recommendations_emitted
        );
        report
    }

    async fn execute(&self, report: &mut CycleReport) -> anyhow::Result<()> {
        let inner = &self.inner;

        // ── Fetching ─────────────────────────────────────────────────────────
        self.set_state(CycleState::Fetching);
        let targets = self.discover().await?;
        report.events_attempted = targets.len();
        if targets.is_empty() {
            info!("No events to ingest this cycle");
            return Ok(());
        }

        let timeout = inner.config.provider_timeout;
        let fetch_futs: Vec<_> = targets
            .into_iter()
            .map(|(provider, event)| async move {
                let res = tokio::time::timeout(timeout, provider.fetch_latest(&event)).await;
                let res = match res {
                    Ok(r) => r,
                    Err(_) => Err(anyhow::anyhow!("timed out after {:?}", timeout)),
                };
                (provider.name().to_string(), event, res)
            })
            .collect();
        let fetches: Vec<_> = stream::iter(fetch_futs)
            .buffer_unordered(inner.config.fetch_concurrency.max(1))
            .collect()
            .await;

        let mut work: Vec<EventWork> = Vec::with_capacity(fetches.len());
        for (provider, event, res) in fetches {
            match res {
                Ok(records) => work.push(EventWork {
                    event,
                    records,
                    stored: Vec::new(),
                    failed: false,
                }),
                Err(e) => {
                    let err = LineError::ProviderFetch {
                        provider,
                        event_id: event.id.clone(),
                        message: format!("{:#}", e),
                    };
                    warn!("{}", err);
                    report.errors.push(failure(&event.id, &err));
                    work.push(EventWork {
                        event,
                        records: Vec::new(),
                        stored: Vec::new(),
                        failed: true,
                    });
                }
            }
        }
        work.sort_by(|a, b| a.event.id.cmp(&b.event.id));

        // ── Storing ──────────────────────────────────────────────────────────
        self.set_state(CycleState::Storing);
        let mut seen_books: BTreeSet<String> = BTreeSet::new();
        for item in work.iter_mut().filter(|w| !w.failed) {
            for record in &item.records {
                if record.event_id != item.event.id {
                    let err = LineError::MalformedSnapshot(format!(
                        "record for {} returned while fetching {}",
                        record.event_id, item.event.id
                    ));
                    report.malformed_rejected += 1;
                    report.errors.push(failure(&item.event.id, &err));
                    continue;
                }
                if !self.is_tracked(&record.sportsbook) {
                    continue;
                }
                if seen_books.insert(record.sportsbook.clone()) {
                    inner
                        .db
                        .upsert_sportsbook(&Sportsbook {
                            key: record.sportsbook.clone(),
                            name: display_name(&record.sportsbook),
                        })
                        .context("upserting sportsbook")?;
                }
                match inner.db.append_snapshot(record, report.id) {
                    Ok(snapshot) => {
                        report.snapshots_stored += 1;
                        item.stored.push(snapshot);
                    }
                    Err(LineError::DuplicateSnapshot { .. }) => {
                        report.duplicates_skipped += 1;
                    }
                    Err(err @ LineError::MalformedSnapshot(_)) => {
                        warn!("Rejected snapshot for {}: {}", item.event.id, err);
                        report.malformed_rejected += 1;
                        report.errors.push(failure(&item.event.id, &err));
                    }
                    Err(err) => {
                        warn!("Storing snapshots for {} failed: {}", item.event.id, err);
                        report.errors.push(failure(&item.event.id, &err));
                        item.failed = true;
                        break;
                    }
                }
            }
        }

        // ── Detecting ────────────────────────────────────────────────────────
        self.set_state(CycleState::Detecting);
        for item in work.iter_mut().filter(|w| !w.stored.is_empty()) {
            let outcome = self.detect_event(item);
            record_detection(report, item, outcome);
        }

        report.failure_count = work.iter().filter(|w| w.failed).count();
        report.success_count = work.len() - report.failure_count;
        Ok(())
    }

    /// Ask every provider for its events; a provider failing discovery is
    /// skipped, all of them failing is a cycle failure.
    async fn discover(&self) -> anyhow::Result<Vec<(Arc<dyn OddsProvider>, Event)>> {
        let inner = &self.inner;
        if inner.providers.is_empty() {
            anyhow::bail!("no odds providers configured");
        }

        let mut targets = Vec::new();
        let mut failures = 0usize;
        for provider in &inner.providers {
            let res = tokio::time::timeout(
                inner.config.provider_timeout,
                provider.discover_events(&inner.config.sports),
            )
            .await;
            match res {
                Ok(Ok(events)) => {
                    debug!("{} offered {} events", provider.name(), events.len());
                    for event in events {
                        inner.db.upsert_event(&event).context("upserting event")?;
                        targets.push((Arc::clone(provider), event));
                    }
                }
                Ok(Err(e)) => {
                    failures += 1;
                    warn!("Event discovery failed for provider '{}': {:#}", provider.name(), e);
                }
                Err(_) => {
                    failures += 1;
                    warn!("Event discovery timed out for provider '{}'", provider.name());
                }
            }
        }
        if failures == inner.providers.len() {
            anyhow::bail!("event discovery failed for every provider");
        }
        Ok(targets)
    }

    /// Build the event's batch from everything stored this cycle, then run
    /// each lane against it. Lane errors do not stop the other lanes.
    fn detect_event(&self, item: &EventWork) -> std::result::Result<usize, Vec<LineError>> {
        let db = &self.inner.db;
        let mut errors = Vec::new();

        let mut batch = CycleBatch::new(&item.event.id);
        for snapshot in &item.stored {
            match db.previous_before(&snapshot.lane(), snapshot.observed_at) {
                Ok(Some(prior)) => batch.record(&prior, snapshot),
                Ok(None) => {}
                Err(e) => errors.push(e),
            }
        }
        if batch.is_empty() {
            debug!("No prior prices for {}; consensus unavailable", batch.event_id());
        } else {
            debug!("Cycle batch for {}: {} moves", batch.event_id(), batch.len());
        }

        let mut emitted = 0;
        for snapshot in &item.stored {
            match self.inner.detector.on_snapshot(snapshot, Some(&batch)) {
                Ok(recs) => emitted += recs.len(),
                Err(e) => {
                    warn!("Detection failed on {}: {}", snapshot.lane(), e);
                    errors.push(e);
                }
            }
        }

        if errors.is_empty() {
            Ok(emitted)
        } else {
            Err(errors)
        }
    }

    fn is_tracked(&self, sportsbook: &str) -> bool {
        let tracked = &self.inner.config.tracked_sportsbooks;
        tracked.is_empty() || tracked.contains(sportsbook)
    }

    /// Timer loop. Returns when `shutdown` flips; an in-flight cycle is
    /// dropped at its next suspension point and committed rows stay.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let period = match self.inner.config.cycle_interval {
            Some(p) => p,
            None => {
                info!("Cycle timer disabled; ingestion runs on demand only");
                let _ = shutdown.changed().await;
                return;
            }
        };

        info!("Ingestion scheduler started (interval={:?})", period);
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        if !self.inner.config.run_on_start {
            // First tick fires immediately.
            interval.tick().await;
        }

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    tokio::select! {
                        outcome = self.trigger(CycleTrigger::Timer) => {
                            if let TriggerOutcome::Rejected { reason } = outcome {
                                debug!("Timer tick skipped: {}", reason);
                            }
                        }
                        _ = shutdown.changed() => {
                            warn!("Shutdown requested; cancelling in-flight ingestion cycle");
                            return;
                        }
                    }
                }
                _ = shutdown.changed() => {
                    info!("Ingestion scheduler stopped");
                    return;
                }
            }
        }
    }
}

/// Fold one event's detection outcome into the report; any lane error fails
/// the event.
fn record_detection(
    report: &mut CycleReport,
    item: &mut EventWork,
    outcome: std::result::Result<usize, Vec<LineError>>,
) {
    match outcome {
        Ok(n) => report.recommendations_emitted += n,
        Err(errs) => {
            item.failed = true;
            for err in errs {
                report.errors.push(failure(&item.event.id, &err));
            }
        }
    }
}

fn failure(event_id: &str, err: &LineError) -> EventFailure {
    EventFailure {
        event_id: event_id.to_string(),
        kind: err.kind().to_string(),
        message: err.to_string(),
    }
}

/// "draftkings" → "Draftkings"
fn display_name(key: &str) -> String {
    let mut chars = key.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{LaneKey, MarketSide};
    use crate::detector::DetectorConfig;
    use async_trait::async_trait;
    use chrono::{DateTime, Duration as ChronoDuration, TimeZone};
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    fn t(min: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap() + ChronoDuration::minutes(min)
    }

    fn event(n: usize) -> Event {
        let provider_event_id = format!("e{}", n);
        Event {
            id: Event::make_id("mock", &provider_event_id),
            provider: "mock".into(),
            provider_event_id,
            sport_key: "basketball_nba".into(),
            league: Some("NBA".into()),
            commence_time: None,
            home_team: format!("Home {}", n),
            away_team: format!("Away {}", n),
        }
    }

    fn rec(event: &Event, book: &str, side: MarketSide, price: i32, min: i64) -> SnapshotRecord {
        SnapshotRecord {
            event_id: event.id.clone(),
            sportsbook: book.into(),
            side,
            price,
            observed_at: t(min),
        }
    }

    /// Scripted provider: fixed events, settable odds and failures.
    struct MockProvider {
        events: Vec<Event>,
        odds: Mutex<HashMap<String, Vec<SnapshotRecord>>>,
        failing: Mutex<HashSet<String>>,
        discover_fails: AtomicBool,
        delay: Duration,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl MockProvider {
        fn new(count: usize) -> Self {
            MockProvider {
                events: (1..=count).map(event).collect(),
                odds: Mutex::new(HashMap::new()),
                failing: Mutex::new(HashSet::new()),
                discover_fails: AtomicBool::new(false),
                delay: Duration::from_millis(0),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            }
        }

        /// Every event quotes `home`/`away` at draftkings at minute `min`.
        fn quote_all(&self, home: i32, away: i32, min: i64) {
            let mut odds = self.odds.lock().unwrap();
            for e in &self.events {
                odds.insert(
                    e.id.clone(),
                    vec![
                        rec(e, "draftkings", MarketSide::Home, home, min),
                        rec(e, "draftkings", MarketSide::Away, away, min),
                    ],
                );
            }
        }

        fn set_odds(&self, event: &Event, records: Vec<SnapshotRecord>) {
            self.odds.lock().unwrap().insert(event.id.clone(), records);
        }

        fn fail(&self, event: &Event) {
            self.failing.lock().unwrap().insert(event.id.clone());
        }
    }

    #[async_trait]
    impl OddsProvider for MockProvider {
        fn name(&self) -> &str {
            "mock"
        }

        async fn discover_events(&self, _sports: &[String]) -> anyhow::Result<Vec<Event>> {
            if self.discover_fails.load(Ordering::SeqCst) {
                anyhow::bail!("feed down");
            }
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(self.events.clone())
        }

        async fn fetch_latest(&self, event: &Event) -> anyhow::Result<Vec<SnapshotRecord>> {
            if self.failing.lock().unwrap().contains(&event.id) {
                anyhow::bail!("provider timeout");
            }
            Ok(self
                .odds
                .lock()
                .unwrap()
                .get(&event.id)
                .cloned()
                .unwrap_or_default())
        }
    }

    fn scheduler_with(
        provider: Arc<MockProvider>,
        config: SchedulerConfig,
    ) -> (Database, Scheduler) {
        let db = Database::open_in_memory().unwrap();
        let detector = Detector::new(db.clone(), DetectorConfig::default());
        let providers: Vec<Arc<dyn OddsProvider>> = vec![provider];
        (db.clone(), Scheduler::new(db, detector, providers, config))
    }

    fn config() -> SchedulerConfig {
        SchedulerConfig {
            cycle_interval: None,
            ..SchedulerConfig::default()
        }
    }

    fn completed(outcome: TriggerOutcome) -> CycleReport {
        match outcome {
            TriggerOutcome::Completed { report } => report,
            other => panic!("expected a completed cycle, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cycle_isolates_failed_event() {
        let provider = Arc::new(MockProvider::new(10));
        let (db, scheduler) = scheduler_with(provider.clone(), config());

        provider.quote_all(-150, 130, 0);
        let first = completed(scheduler.trigger(CycleTrigger::OnDemand).await);
        assert_eq!(first.status, "completed");
        assert_eq!(first.snapshots_stored, 20);
        assert_eq!(first.recommendations_emitted, 0);

        provider.quote_all(120, -140, 10);
        provider.fail(&provider.events[3]);
        let second = completed(scheduler.trigger(CycleTrigger::OnDemand).await);

        assert_eq!(second.events_attempted, 10);
        assert_eq!(second.failure_count, 1);
        assert_eq!(second.success_count, 9);
        assert_eq!(second.errors.len(), 1);
        assert_eq!(second.errors[0].event_id, "mock:e4");
        assert_eq!(second.errors[0].kind, "provider_fetch");
        // home and away both reversed for the nine healthy events
        assert_eq!(second.recommendations_emitted, 18);
        assert_eq!(db.count_recommendations().unwrap(), 18);

        let e4_home = LaneKey::new("mock:e4", "draftkings", MarketSide::Home);
        assert_eq!(db.history(&e4_home, None).unwrap().len(), 1);
        assert_eq!(scheduler.state(), CycleState::Idle);
    }

    #[tokio::test]
    async fn test_retried_cycle_is_idempotent() {
        let provider = Arc::new(MockProvider::new(2));
        let (db, scheduler) = scheduler_with(provider.clone(), config());
        provider.quote_all(-150, 130, 0);
        completed(scheduler.trigger(CycleTrigger::OnDemand).await);
        provider.quote_all(120, -140, 10);
        completed(scheduler.trigger(CycleTrigger::OnDemand).await);

        // the feed hands back the same observations again
        let again = completed(scheduler.trigger(CycleTrigger::OnDemand).await);
        assert_eq!(again.snapshots_stored, 0);
        assert_eq!(again.duplicates_skipped, 4);
        assert_eq!(again.failure_count, 0);
        assert_eq!(again.recommendations_emitted, 0);
        assert_eq!(db.count_recommendations().unwrap(), 4);
    }

    #[tokio::test]
    async fn test_malformed_snapshot_reported_not_stored() {
        let provider = Arc::new(MockProvider::new(1));
        let (db, scheduler) = scheduler_with(provider.clone(), config());
        let e = provider.events[0].clone();
        provider.set_odds(
            &e,
            vec![
                rec(&e, "draftkings", MarketSide::Home, 50, 0),
                rec(&e, "draftkings", MarketSide::Away, 130, 0),
            ],
        );
        let report = completed(scheduler.trigger(CycleTrigger::OnDemand).await);
        assert_eq!(report.malformed_rejected, 1);
        assert_eq!(report.snapshots_stored, 1);
        assert_eq!(report.failure_count, 0);
        assert_eq!(report.errors[0].kind, "malformed_snapshot");
        assert_eq!(db.count_snapshots().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_untracked_books_are_ignored() {
        let provider = Arc::new(MockProvider::new(1));
        let mut cfg = config();
        cfg.tracked_sportsbooks = ["fanduel".to_string()].into_iter().collect();
        let (db, scheduler) = scheduler_with(provider.clone(), cfg);
        let e = provider.events[0].clone();
        provider.set_odds(
            &e,
            vec![
                rec(&e, "draftkings", MarketSide::Home, -150, 0),
                rec(&e, "fanduel", MarketSide::Home, -155, 0),
            ],
        );
        let report = completed(scheduler.trigger(CycleTrigger::OnDemand).await);
        assert_eq!(report.snapshots_stored, 1);
        let books = db.list_sportsbooks().unwrap();
        assert_eq!(books.len(), 1);
        assert_eq!(books[0].name, "Fanduel");
    }

    #[tokio::test]
    async fn test_concurrent_trigger_rejected() {
        let mut mock = MockProvider::new(1);
        mock.delay = Duration::from_millis(50);
        let provider = Arc::new(mock);
        let (db, scheduler) = scheduler_with(provider.clone(), config());

        let (a, b) = tokio::join!(
            scheduler.trigger(CycleTrigger::OnDemand),
            scheduler.trigger(CycleTrigger::OnDemand)
        );
        assert!(matches!(a, TriggerOutcome::Completed { .. }));
        assert!(matches!(b, TriggerOutcome::Rejected { .. }));
        assert_eq!(provider.max_in_flight.load(Ordering::SeqCst), 1);
        assert_eq!(db.list_cycles(10).unwrap().len(), 1);
        assert_eq!(scheduler.state(), CycleState::Idle);
    }

    #[tokio::test]
    async fn test_concurrent_triggers_queue_and_coalesce() {
        let mut mock = MockProvider::new(1);
        mock.delay = Duration::from_millis(50);
        let provider = Arc::new(mock);
        let mut cfg = config();
        cfg.overlap_policy = OverlapPolicy::Queue;
        let (db, scheduler) = scheduler_with(provider.clone(), cfg);

        let (a, b, c) = tokio::join!(
            scheduler.trigger(CycleTrigger::OnDemand),
            scheduler.trigger(CycleTrigger::OnDemand),
            scheduler.trigger(CycleTrigger::Timer)
        );
        assert!(matches!(a, TriggerOutcome::Completed { .. }));
        assert!(matches!(b, TriggerOutcome::Queued));
        assert!(matches!(c, TriggerOutcome::Queued));
        assert_eq!(provider.max_in_flight.load(Ordering::SeqCst), 1);

        // the two queued requests collapse into one follow-up cycle
        let cycles = db.list_cycles(10).unwrap();
        assert_eq!(cycles.len(), 2);
        assert_eq!(cycles[0].trigger, CycleTrigger::Queued);
    }

    #[tokio::test]
    async fn test_discovery_failure_fails_cycle_but_not_scheduler() {
        let provider = Arc::new(MockProvider::new(1));
        let (_db, scheduler) = scheduler_with(provider.clone(), config());
        provider.discover_fails.store(true, Ordering::SeqCst);

        let report = completed(scheduler.trigger(CycleTrigger::OnDemand).await);
        assert_eq!(report.status, "failed");
        assert_eq!(scheduler.state(), CycleState::Failed);

        provider.discover_fails.store(false, Ordering::SeqCst);
        let report = completed(scheduler.trigger(CycleTrigger::OnDemand).await);
        assert_eq!(report.status, "completed");
        assert_eq!(scheduler.state(), CycleState::Idle);
    }

    #[tokio::test]
    async fn test_dropped_trigger_releases_scheduler() {
        let mut mock = MockProvider::new(1);
        mock.delay = Duration::from_millis(200);
        let provider = Arc::new(mock);
        let (db, scheduler) = scheduler_with(provider.clone(), config());

        let dropped = tokio::time::timeout(
            Duration::from_millis(20),
            scheduler.trigger(CycleTrigger::OnDemand),
        )
        .await;
        assert!(dropped.is_err());
        assert_eq!(scheduler.state(), CycleState::Failed);

        let cycles = db.list_cycles(10).unwrap();
        assert_eq!(cycles.len(), 1);
        assert_eq!(cycles[0].status, "cancelled");
        assert!(cycles[0].finished_at.is_some());

        let report = completed(scheduler.trigger(CycleTrigger::OnDemand).await);
        assert_eq!(report.status, "completed");
        assert_eq!(scheduler.state(), CycleState::Idle);
    }

    #[tokio::test]
    async fn test_dropped_trigger_clears_queued_request() {
        let mut mock = MockProvider::new(1);
        mock.delay = Duration::from_millis(200);
        let provider = Arc::new(mock);
        let mut cfg = config();
        cfg.overlap_policy = OverlapPolicy::Queue;
        let (db, scheduler) = scheduler_with(provider.clone(), cfg);

        let (dropped, queued) = tokio::join!(
            tokio::time::timeout(
                Duration::from_millis(20),
                scheduler.trigger(CycleTrigger::OnDemand)
            ),
            scheduler.trigger(CycleTrigger::Timer)
        );
        assert!(dropped.is_err());
        assert!(matches!(queued, TriggerOutcome::Queued));

        let report = completed(scheduler.trigger(CycleTrigger::OnDemand).await);
        assert_eq!(report.status, "completed");
        // one cancelled, one completed, no stray queued follow-up
        assert_eq!(db.list_cycles(10).unwrap().len(), 2);
        assert_eq!(scheduler.state(), CycleState::Idle);
    }

    #[tokio::test]
    async fn test_detection_violation_fails_event() {
        let provider = Arc::new(MockProvider::new(1));
        let (_db, scheduler) = scheduler_with(provider.clone(), config());
        let e = provider.events[0].clone();
        let mut item = EventWork {
            event: e.clone(),
            records: Vec::new(),
            stored: Vec::new(),
            failed: false,
        };
        let mut report = CycleReport::new(CycleTrigger::OnDemand);

        // an out-of-order window as the detector reports it
        let current = OddsSnapshot {
            id: None,
            event_id: e.id.clone(),
            sportsbook: "draftkings".into(),
            side: MarketSide::Home,
            price: 120,
            implied_prob: 100.0 / 220.0,
            observed_at: t(30),
            batch_id: None,
        };
        let mut earlier = current.clone();
        earlier.price = -150;
        earlier.observed_at = t(10);
        let mut later = earlier.clone();
        later.observed_at = t(5);
        let err = scheduler
            .detector()
            .evaluate_window(&[earlier, later], &current, None)
            .unwrap_err();

        record_detection(&mut report, &mut item, Err(vec![err]));
        assert!(item.failed);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].event_id, e.id);
        assert_eq!(report.errors[0].kind, "detection");

        let mut ok_item = EventWork {
            event: e,
            records: Vec::new(),
            stored: Vec::new(),
            failed: false,
        };
        record_detection(&mut report, &mut ok_item, Ok(2));
        assert!(!ok_item.failed);
        assert_eq!(report.recommendations_emitted, 2);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let provider = Arc::new(MockProvider::new(1));
        let mut cfg = config();
        cfg.cycle_interval = Some(Duration::from_secs(3600));
        let (db, scheduler) = scheduler_with(provider.clone(), cfg);
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(scheduler.clone().run(rx));
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        // run_on_start fired exactly one cycle
        assert_eq!(db.list_cycles(10).unwrap().len(), 1);
    }

    #[test]
    fn test_display_name() {
        assert_eq!(display_name("betmgm"), "Betmgm");
        assert_eq!(display_name(""), "");
    }
}
