use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;

use crate::db::models::{
    CycleTrigger, Event, HaltedLane, LaneKey, MarketSide, OddsSnapshot, Recommendation,
    RecommendationScope,
};
use crate::db::Database;
use crate::detector::DetectionStrategy;
use crate::error::LineError;
use crate::scheduler::{CycleState, OverlapPolicy, Scheduler, TriggerOutcome};

const DEFAULT_LIMIT: i64 = 50;
const MAX_LIMIT: i64 = 500;

#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub scheduler: Scheduler,
}

/// Build the Axum router for the JSON API.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/", get(heartbeat_handler))
        .route("/api/recommendations", get(recommendations_handler))
        .route("/api/ingest", post(ingest_handler))
        .route("/api/cycles", get(cycles_handler))
        .route("/api/status", get(status_handler))
        .route("/api/lanes/:event_id/:sportsbook/:side", get(lane_handler))
        .layer(CorsLayer::permissive())
        .with_state(Arc::new(state))
}

#[derive(Debug, Default, Deserialize)]
pub struct ListParams {
    pub limit: Option<i64>,
    pub scope: Option<String>,
}

#[derive(Debug, Serialize)]
struct Heartbeat {
    status: &'static str,
    name: &'static str,
    version: &'static str,
}

#[derive(Debug, Serialize)]
pub struct StatusView {
    pub state: CycleState,
    pub cycle_active: bool,
    pub strategy: DetectionStrategy,
    pub movement_threshold: f64,
    pub overlap_policy: OverlapPolicy,
    /// `None` when cycles only run on demand
    pub cycle_interval_secs: Option<u64>,
    pub snapshots: i64,
    pub recommendations: i64,
    pub sportsbooks: usize,
    pub halted_lanes: Vec<HaltedLane>,
}

/// One lane's stored prices and what was flagged on it
#[derive(Debug, Serialize)]
pub struct LaneView {
    pub event: Event,
    pub latest: OddsSnapshot,
    pub history: Vec<OddsSnapshot>,
    pub recommendations: Vec<Recommendation>,
    pub halted: bool,
}

fn clamp_limit(limit: Option<i64>) -> i64 {
    limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
}

fn internal(e: impl std::fmt::Display) -> (StatusCode, String) {
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

/// GET /api/
async fn heartbeat_handler() -> impl IntoResponse {
    Json(Heartbeat {
        status: "ok",
        name: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// GET /api/recommendations?limit=50&scope=live
async fn recommendations_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListParams>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let scope = match params.scope.as_deref() {
        None => RecommendationScope::default(),
        Some(s) => s
            .parse::<RecommendationScope>()
            .map_err(|e| (StatusCode::BAD_REQUEST, e))?,
    };
    state
        .db
        .list_recommendations(clamp_limit(params.limit), scope, Utc::now())
        .map(Json)
        .map_err(internal)
}

/// POST /api/ingest
///
/// Runs a cycle and answers 200 with its report. A request that finds a
/// cycle running answers 202 (queued) or 409 (rejected).
async fn ingest_handler(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    // Runs detached so a disconnecting client does not cancel the cycle
    let scheduler = state.scheduler.clone();
    let outcome = tokio::spawn(async move { scheduler.trigger(CycleTrigger::OnDemand).await })
        .await
        .map_err(internal)?;
    let status = match &outcome {
        TriggerOutcome::Completed { .. } => StatusCode::OK,
        TriggerOutcome::Queued => StatusCode::ACCEPTED,
        TriggerOutcome::Rejected { .. } => StatusCode::CONFLICT,
    };
    Ok((status, Json(outcome)))
}

/// GET /api/cycles?limit=50
async fn cycles_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListParams>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    state
        .db
        .list_cycles(clamp_limit(params.limit))
        .map(Json)
        .map_err(internal)
}

/// GET /api/status
async fn status_handler(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let db = &state.db;
    let scheduler = &state.scheduler;
    let current = scheduler.state();
    Ok(Json(StatusView {
        state: current,
        cycle_active: current.is_active(),
        strategy: scheduler.detector().config().strategy,
        movement_threshold: scheduler.detector().config().movement_threshold,
        overlap_policy: scheduler.config().overlap_policy,
        cycle_interval_secs: scheduler.config().cycle_interval.map(|d| d.as_secs()),
        snapshots: db.count_snapshots().map_err(internal)?,
        recommendations: db.count_recommendations().map_err(internal)?,
        sportsbooks: db.list_sportsbooks().map_err(internal)?.len(),
        halted_lanes: db.list_halted_lanes().map_err(internal)?,
    }))
}

/// GET /api/lanes/:event_id/:sportsbook/:side
async fn lane_handler(
    State(state): State<Arc<AppState>>,
    Path((event_id, sportsbook, side)): Path<(String, String, String)>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let side: MarketSide = side.parse().map_err(|e| (StatusCode::BAD_REQUEST, e))?;
    let lane = LaneKey::new(&event_id, &sportsbook, side);
    let db = &state.db;
    let not_found = |e: LineError| match e {
        LineError::NotFound(what) => (StatusCode::NOT_FOUND, what),
        other => internal(other),
    };
    let event = db.get_event(&event_id).map_err(not_found)?;
    let latest = db.latest(&lane).map_err(not_found)?;
    Ok(Json(LaneView {
        event,
        latest,
        history: db.history(&lane, None).map_err(internal)?,
        recommendations: db.recommendations_for_lane(&lane).map_err(internal)?,
        halted: db.is_lane_halted(&lane).map_err(internal)?,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{Confidence, MovementDirection, SnapshotRecord, Sportsbook};
    use crate::detector::{Detector, DetectorConfig};
    use crate::scheduler::SchedulerConfig;
    use axum::response::Response;
    use chrono::Duration;

    fn state() -> Arc<AppState> {
        let db = Database::open_in_memory().unwrap();
        let detector = Detector::new(db.clone(), DetectorConfig::default());
        let scheduler = Scheduler::new(
            db.clone(),
            detector,
            Vec::new(),
            SchedulerConfig {
                cycle_interval: None,
                ..SchedulerConfig::default()
            },
        );
        Arc::new(AppState { db, scheduler })
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn seed(db: &Database, id: &str, starts_in: Duration, minutes_ago: i64) {
        let now = Utc::now();
        db.upsert_event(&Event {
            id: id.into(),
            provider: "mock".into(),
            provider_event_id: id.into(),
            sport_key: "basketball_nba".into(),
            league: Some("NBA".into()),
            commence_time: Some(now + starts_in),
            home_team: "Lakers".into(),
            away_team: "Celtics".into(),
        })
        .unwrap();
        db.upsert_sportsbook(&Sportsbook {
            key: "draftkings".into(),
            name: "DraftKings".into(),
        })
        .unwrap();
        let at = now - Duration::minutes(minutes_ago);
        db.insert_recommendation(&Recommendation {
            id: None,
            event_id: id.into(),
            sportsbook: "draftkings".into(),
            side: MarketSide::Home,
            triggered_at: at,
            prior_price: -150,
            current_price: 120,
            prior_observed_at: at - Duration::minutes(15),
            current_observed_at: at,
            movement_cents: 70,
            direction: MovementDirection::Lengthened,
            probability_delta: -0.1455,
            strength: 3.5,
            confidence: Confidence::High,
            rule_version: "trend-v1".into(),
            created_at: at,
        })
        .unwrap();
    }

    #[tokio::test]
    async fn test_heartbeat() {
        let resp = heartbeat_handler().await.into_response();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["status"], "ok");
    }

    #[tokio::test]
    async fn test_recommendations_scope_and_order() {
        let state = state();
        seed(&state.db, "upcoming-a", Duration::hours(2), 30);
        seed(&state.db, "upcoming-b", Duration::hours(3), 5);
        seed(&state.db, "started", -Duration::hours(1), 90);

        let resp = recommendations_handler(State(state.clone()), Query(ListParams::default()))
            .await
            .unwrap()
            .into_response();
        let body = body_json(resp).await;
        let rows = body.as_array().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["event_id"], "upcoming-b");
        assert_eq!(rows[0]["team"], "Lakers");
        assert_eq!(rows[0]["sportsbook_name"], "DraftKings");

        let params = ListParams {
            limit: Some(10),
            scope: Some("history".into()),
        };
        let resp = recommendations_handler(State(state.clone()), Query(params))
            .await
            .unwrap()
            .into_response();
        let body = body_json(resp).await;
        assert_eq!(body.as_array().unwrap().len(), 1);
        assert_eq!(body[0]["event_id"], "started");
    }

    #[tokio::test]
    async fn test_unknown_scope_is_bad_request() {
        let params = ListParams {
            limit: None,
            scope: Some("tomorrow".into()),
        };
        let err = recommendations_handler(State(state()), Query(params))
            .await
            .err()
            .unwrap();
        assert_eq!(err.0, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_limit_clamped() {
        assert_eq!(clamp_limit(None), 50);
        assert_eq!(clamp_limit(Some(0)), 1);
        assert_eq!(clamp_limit(Some(10_000)), 500);
    }

    #[tokio::test]
    async fn test_ingest_reports_cycle() {
        let state = state();
        // no providers: the cycle runs and fails, the endpoint still answers
        let resp = ingest_handler(State(state.clone()))
            .await
            .unwrap()
            .into_response();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["outcome"], "completed");
        assert_eq!(body["report"]["status"], "failed");

        let resp = cycles_handler(State(state), Query(ListParams::default()))
            .await
            .unwrap()
            .into_response();
        assert_eq!(body_json(resp).await.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_status() {
        let state = state();
        seed(&state.db, "upcoming-a", Duration::hours(2), 30);
        let resp = status_handler(State(state)).await.unwrap().into_response();
        let body = body_json(resp).await;
        assert_eq!(body["state"], "idle");
        assert_eq!(body["cycle_active"], false);
        assert_eq!(body["strategy"], "consensus");
        assert_eq!(body["overlap_policy"], "reject");
        assert_eq!(body["recommendations"], 1);
        assert_eq!(body["halted_lanes"].as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_lane_view() {
        let state = state();
        seed(&state.db, "upcoming-a", Duration::hours(2), 30);
        let now = Utc::now();
        for (price, min) in [(-150, 20), (120, 5)] {
            state
                .db
                .append_snapshot(
                    &SnapshotRecord {
                        event_id: "upcoming-a".into(),
                        sportsbook: "draftkings".into(),
                        side: MarketSide::Home,
                        price,
                        observed_at: now - Duration::minutes(min),
                    },
                    None,
                )
                .unwrap();
        }

        let path = Path((
            "upcoming-a".to_string(),
            "draftkings".to_string(),
            "home".to_string(),
        ));
        let resp = lane_handler(State(state.clone()), path)
            .await
            .unwrap()
            .into_response();
        let body = body_json(resp).await;
        assert_eq!(body["latest"]["price"], 120);
        assert_eq!(body["history"].as_array().unwrap().len(), 2);
        assert_eq!(body["recommendations"].as_array().unwrap().len(), 1);
        assert_eq!(body["halted"], false);
    }

    #[tokio::test]
    async fn test_lane_not_found_and_bad_side() {
        let state = state();
        let path = Path(("nope".to_string(), "draftkings".to_string(), "home".to_string()));
        let err = lane_handler(State(state.clone()), path).await.err().unwrap();
        assert_eq!(err.0, StatusCode::NOT_FOUND);

        let path = Path(("nope".to_string(), "draftkings".to_string(), "over".to_string()));
        let err = lane_handler(State(state), path).await.err().unwrap();
        assert_eq!(err.0, StatusCode::BAD_REQUEST);
    }
}
