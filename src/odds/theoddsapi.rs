use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

use super::provider::OddsProvider;
use crate::db::models::{Event, MarketSide, SnapshotRecord};

pub const PROVIDER_NAME: &str = "theoddsapi";

const MAX_ATTEMPTS: u32 = 3;
const RETRY_WAIT: Duration = Duration::from_secs(2);
/// Remaining-request count at which quota logging escalates to `warn!`
const LOW_QUOTA: u64 = 50;

/// Odds provider backed by The Odds API v4.
/// Docs: <https://the-odds-api.com/liveapi/guides/v4/>
pub struct TheOddsApi {
    http: Client,
    api_key: String,
    /// Base URL, overridable for tests and proxies
    base_url: String,
    /// Bookmaker keys passed to the odds endpoint (empty = all US books)
    bookmakers: Vec<String>,
    regions: String,
}

impl TheOddsApi {
    pub fn new(api_key: &str, base_url: &str, bookmakers: Vec<String>) -> Result<Self> {
        if api_key.trim().is_empty() {
            anyhow::bail!("The Odds API key is required");
        }
        let http = Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(TheOddsApi {
            http,
            api_key: api_key.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            bookmakers,
            regions: "us".to_string(),
        })
    }

    /// GET with up to three attempts and a jittered fixed wait between them.
    async fn get_json(&self, url: Url) -> Result<serde_json::Value> {
        let mut last_err = None;
        for attempt in 1..=MAX_ATTEMPTS {
            match self.try_get(&url).await {
                Ok(v) => return Ok(v),
                Err(e) => {
                    debug!("Odds API attempt {}/{} failed: {}", attempt, MAX_ATTEMPTS, e);
                    last_err = Some(e);
                    if attempt < MAX_ATTEMPTS {
                        let jitter = rand::thread_rng().gen_range(0..500);
                        tokio::time::sleep(RETRY_WAIT + Duration::from_millis(jitter)).await;
                    }
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("Odds API request failed")))
    }

    async fn try_get(&self, url: &Url) -> Result<serde_json::Value> {
        // The key is a query param; keep it out of logs.
        debug!("Requesting {}{}", url.origin().ascii_serialization(), url.path());
        let resp = self
            .http
            .get(url.clone())
            .send()
            .await
            .context("Odds API request failed")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("Odds API error {}: {}", status, body);
        }

        if let Some(remaining) = remaining_requests(resp.headers()) {
            if remaining <= LOW_QUOTA {
                warn!("The Odds API quota nearly exhausted: {} requests remaining", remaining);
            } else {
                info!("The Odds API remaining requests: {}", remaining);
            }
        }

        resp.json().await.context("Failed to parse Odds API response")
    }
}

#[async_trait]
impl OddsProvider for TheOddsApi {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    async fn discover_events(&self, sports: &[String]) -> Result<Vec<Event>> {
        let mut events = Vec::new();
        let mut last_err = None;
        for sport in sports {
            let url = Url::parse_with_params(
                &format!("{}/sports/{}/events", self.base_url, sport),
                &[("apiKey", self.api_key.as_str()), ("dateFormat", "iso")],
            )
            .context("Invalid Odds API URL")?;

            match self.get_json(url).await {
                Ok(raw) => events.extend(parse_events(&raw, sport)),
                Err(e) => {
                    warn!("Event discovery failed for {}: {}", sport, e);
                    last_err = Some(e);
                }
            }
        }
        // Only a total failure is an error; partial sport outages are logged.
        if events.is_empty() {
            if let Some(e) = last_err {
                return Err(e);
            }
        }
        Ok(events)
    }

    async fn fetch_latest(&self, event: &Event) -> Result<Vec<SnapshotRecord>> {
        let mut query = vec![
            ("apiKey", self.api_key.clone()),
            ("regions", self.regions.clone()),
            ("markets", "h2h".to_string()),
            ("oddsFormat", "american".to_string()),
            ("dateFormat", "iso".to_string()),
        ];
        if !self.bookmakers.is_empty() {
            query.push(("bookmakers", self.bookmakers.join(",")));
        }
        let url = Url::parse_with_params(
            &format!(
                "{}/sports/{}/events/{}/odds",
                self.base_url, event.sport_key, event.provider_event_id
            ),
            &query,
        )
        .context("Invalid Odds API URL")?;

        let raw = self.get_json(url).await?;
        Ok(parse_event_odds(&raw, event, Utc::now()))
    }
}

// ── Parsing helpers ────────────────────────────────────────────────────────────

/// `x-requests-remaining` quota header; the API sends it as a decimal,
/// sometimes with a fractional part.
fn remaining_requests(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    let raw = headers.get("x-requests-remaining")?.to_str().ok()?;
    raw.trim().parse::<f64>().ok().map(|v| v.max(0.0) as u64)
}

fn parse_time(v: &serde_json::Value) -> Option<DateTime<Utc>> {
    v.as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

/// Parse the `/events` listing for one sport.
fn parse_events(raw: &serde_json::Value, sport_hint: &str) -> Vec<Event> {
    let items = match raw.as_array() {
        Some(a) => a,
        None => return vec![],
    };

    items
        .iter()
        .filter_map(|item| {
            let provider_event_id = item["id"].as_str()?;
            let home_team = item["home_team"].as_str()?.to_string();
            let away_team = item["away_team"].as_str()?.to_string();
            Some(Event {
                id: Event::make_id(PROVIDER_NAME, provider_event_id),
                provider: PROVIDER_NAME.to_string(),
                provider_event_id: provider_event_id.to_string(),
                sport_key: item["sport_key"].as_str().unwrap_or(sport_hint).to_string(),
                league: item["sport_title"].as_str().map(str::to_string),
                commence_time: parse_time(&item["commence_time"]),
                home_team,
                away_team,
            })
        })
        .collect()
}

/// Parse the per-event odds payload into one record per (bookmaker, side).
///
/// Uses the h2h market's `last_update` as the observation time, falling back
/// to the bookmaker's, then to `fetched_at`.
fn parse_event_odds(
    raw: &serde_json::Value,
    event: &Event,
    fetched_at: DateTime<Utc>,
) -> Vec<SnapshotRecord> {
    let bookmakers = match raw["bookmakers"].as_array() {
        Some(b) => b,
        None => return vec![],
    };

    let mut records = Vec::new();
    for book in bookmakers {
        let key = match book["key"].as_str() {
            Some(k) => k,
            None => continue,
        };
        let market = match book["markets"]
            .as_array()
            .and_then(|ms| ms.iter().find(|m| m["key"].as_str() == Some("h2h")))
        {
            Some(m) => m,
            None => continue,
        };
        let observed_at = parse_time(&market["last_update"])
            .or_else(|| parse_time(&book["last_update"]))
            .unwrap_or(fetched_at);

        for outcome in market["outcomes"].as_array().into_iter().flatten() {
            let name = outcome["name"].as_str().unwrap_or("");
            let side = if name == event.home_team {
                MarketSide::Home
            } else if name == event.away_team {
                MarketSide::Away
            } else if name.eq_ignore_ascii_case("draw") {
                MarketSide::Draw
            } else {
                debug!("Unmatched outcome '{}' for event {}", name, event.id);
                continue;
            };
            let price = match outcome["price"]
                .as_i64()
                .or_else(|| outcome["price"].as_f64().map(|p| p.round() as i64))
            {
                Some(p) => match i32::try_from(p) {
                    Ok(p) => p,
                    Err(_) => {
                        debug!("Out-of-range price {} at {} for event {}", p, key, event.id);
                        continue;
                    }
                },
                None => continue,
            };
            records.push(SnapshotRecord {
                event_id: event.id.clone(),
                sportsbook: key.to_string(),
                side,
                price,
                observed_at,
            });
        }
    }
    records
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn bulls_knicks() -> Event {
        Event {
            id: Event::make_id(PROVIDER_NAME, "e1"),
            provider: PROVIDER_NAME.into(),
            provider_event_id: "e1".into(),
            sport_key: "basketball_nba".into(),
            league: Some("NBA".into()),
            commence_time: None,
            home_team: "Chicago Bulls".into(),
            away_team: "New York Knicks".into(),
        }
    }

    #[test]
    fn test_new_requires_key() {
        assert!(TheOddsApi::new("", "https://api.the-odds-api.com/v4", vec![]).is_err());
    }

    #[test]
    fn test_parse_events() {
        let raw = json!([
            {
                "id": "e1",
                "sport_key": "basketball_nba",
                "sport_title": "NBA",
                "commence_time": "2024-03-01T00:10:00Z",
                "home_team": "Chicago Bulls",
                "away_team": "New York Knicks"
            },
            { "id": "broken" }
        ]);
        let events = parse_events(&raw, "basketball_nba");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id, "theoddsapi:e1");
        assert_eq!(events[0].league.as_deref(), Some("NBA"));
        assert_eq!(
            events[0].commence_time,
            Some(Utc.with_ymd_and_hms(2024, 3, 1, 0, 10, 0).unwrap())
        );
    }

    #[test]
    fn test_parse_event_odds_maps_sides() {
        let raw = json!({
            "id": "e1",
            "bookmakers": [
                {
                    "key": "draftkings",
                    "title": "DraftKings",
                    "last_update": "2024-03-01T00:00:00Z",
                    "markets": [
                        {
                            "key": "h2h",
                            "last_update": "2024-03-01T00:01:00Z",
                            "outcomes": [
                                { "name": "Chicago Bulls", "price": -150 },
                                { "name": "New York Knicks", "price": 130 }
                            ]
                        }
                    ]
                },
                {
                    "key": "fanduel",
                    "last_update": "2024-03-01T00:02:00Z",
                    "markets": [
                        { "key": "spreads", "outcomes": [] },
                        {
                            "key": "h2h",
                            "outcomes": [
                                { "name": "Chicago Bulls", "price": -145.0 },
                                { "name": "Somebody Else", "price": 300 }
                            ]
                        }
                    ]
                }
            ]
        });
        let fetched = Utc.with_ymd_and_hms(2024, 3, 1, 1, 0, 0).unwrap();
        let records = parse_event_odds(&raw, &bulls_knicks(), fetched);
        assert_eq!(records.len(), 3);

        assert_eq!(records[0].sportsbook, "draftkings");
        assert_eq!(records[0].side, MarketSide::Home);
        assert_eq!(records[0].price, -150);
        assert_eq!(
            records[0].observed_at,
            Utc.with_ymd_and_hms(2024, 3, 1, 0, 1, 0).unwrap()
        );
        assert_eq!(records[1].side, MarketSide::Away);

        // falls back to the bookmaker timestamp
        assert_eq!(records[2].sportsbook, "fanduel");
        assert_eq!(records[2].price, -145);
        assert_eq!(
            records[2].observed_at,
            Utc.with_ymd_and_hms(2024, 3, 1, 0, 2, 0).unwrap()
        );
    }

    #[test]
    fn test_parse_event_odds_draw_and_missing_markets() {
        let mut event = bulls_knicks();
        event.home_team = "Arsenal".into();
        event.away_team = "Chelsea".into();
        let raw = json!({
            "bookmakers": [
                { "key": "betmgm", "markets": [] },
                {
                    "key": "caesars",
                    "markets": [{
                        "key": "h2h",
                        "outcomes": [{ "name": "Draw", "price": 240 }]
                    }]
                }
            ]
        });
        let fetched = Utc.with_ymd_and_hms(2024, 3, 1, 1, 0, 0).unwrap();
        let records = parse_event_odds(&raw, &event, fetched);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].side, MarketSide::Draw);
        assert_eq!(records[0].observed_at, fetched);
    }

    #[test]
    fn test_parse_event_odds_no_bookmakers() {
        let records = parse_event_odds(&json!({}), &bulls_knicks(), Utc::now());
        assert!(records.is_empty());
    }

    #[test]
    fn test_parse_event_odds_skips_out_of_range_price() {
        let raw = json!({
            "bookmakers": [{
                "key": "draftkings",
                "markets": [{
                    "key": "h2h",
                    "outcomes": [
                        { "name": "Chicago Bulls", "price": 4_294_967_446_i64 },
                        { "name": "New York Knicks", "price": 130 }
                    ]
                }]
            }]
        });
        let records = parse_event_odds(&raw, &bulls_knicks(), Utc::now());
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].side, MarketSide::Away);
        assert_eq!(records[0].price, 130);
    }

    #[test]
    fn test_remaining_requests_header() {
        use reqwest::header::{HeaderMap, HeaderValue};
        let mut headers = HeaderMap::new();
        assert_eq!(remaining_requests(&headers), None);
        headers.insert("x-requests-remaining", HeaderValue::from_static("487"));
        assert_eq!(remaining_requests(&headers), Some(487));
        headers.insert("x-requests-remaining", HeaderValue::from_static("12.0"));
        assert_eq!(remaining_requests(&headers), Some(12));
        headers.insert("x-requests-remaining", HeaderValue::from_static("n/a"));
        assert_eq!(remaining_requests(&headers), None);
    }
}
