use clap::Parser;
use std::collections::HashSet;
use std::time::Duration;

use crate::detector::{DetectionStrategy, DetectorConfig};
use crate::scheduler::{OverlapPolicy, SchedulerConfig};

/// Moneyline odds monitor with reverse line movement detection
#[derive(Parser, Debug, Clone)]
#[command(name = "linewatch", version, about)]
pub struct Config {
    /// SQLite database path
    #[arg(long, env = "DATABASE_PATH", default_value = "linewatch.db")]
    pub database_path: String,

    /// JSON API listen address
    #[arg(long, env = "API_ADDR", default_value = "0.0.0.0:8080")]
    pub api_addr: String,

    /// The Odds API key (without it no provider is configured)
    #[arg(long, env = "ODDS_API_KEY")]
    pub odds_api_key: Option<String>,

    /// The Odds API base URL
    #[arg(
        long,
        env = "ODDS_API_URL",
        default_value = "https://api.the-odds-api.com/v4"
    )]
    pub odds_api_url: String,

    /// Sport keys to ingest
    #[arg(
        long,
        env = "SPORTS",
        value_delimiter = ',',
        default_value = "americanfootball_nfl,basketball_nba,baseball_mlb,icehockey_nhl"
    )]
    pub sports: Vec<String>,

    /// Sportsbook keys to store; pass an empty string to keep every book
    #[arg(
        long,
        env = "TRACKED_SPORTSBOOKS",
        value_delimiter = ',',
        default_value = "draftkings,fanduel,betmgm,caesars"
    )]
    pub tracked_sportsbooks: Vec<String>,

    /// Snapshots preceding a new one that form the trend window
    #[arg(long, env = "WINDOW_SIZE", default_value = "5")]
    pub window_size: usize,

    /// Minimum move in cents for a recommendation (strictly greater than)
    #[arg(long, env = "MOVEMENT_THRESHOLD", default_value = "20")]
    pub movement_threshold: f64,

    /// Expected-direction rule
    #[arg(long, env = "DETECTION_STRATEGY", value_enum, default_value = "consensus")]
    pub detection_strategy: DetectionStrategy,

    /// Minimum minutes between recommendations on one lane (0 = off)
    #[arg(long, env = "COOLDOWN_MINUTES", default_value = "0")]
    pub cooldown_minutes: i64,

    /// Strength (move / threshold) at which confidence becomes medium
    #[arg(long, env = "MEDIUM_MULTIPLIER", default_value = "2.0")]
    pub medium_multiplier: f64,

    /// Strength (move / threshold) at which confidence becomes high
    #[arg(long, env = "HIGH_MULTIPLIER", default_value = "3.0")]
    pub high_multiplier: f64,

    /// Seconds between ingestion cycles (0 = on-demand only)
    #[arg(long, env = "CYCLE_INTERVAL_SECS", default_value = "900")]
    pub cycle_interval_secs: u64,

    /// What to do with a cycle request while one is running
    #[arg(long, env = "OVERLAP_POLICY", value_enum, default_value = "reject")]
    pub overlap_policy: OverlapPolicy,

    /// Per-request provider timeout in seconds
    #[arg(long, env = "PROVIDER_TIMEOUT_SECS", default_value = "20")]
    pub provider_timeout_secs: u64,

    /// Events fetched concurrently within a cycle
    #[arg(long, env = "FETCH_CONCURRENCY", default_value = "4")]
    pub fetch_concurrency: usize,

    /// Run a cycle immediately at startup instead of waiting one interval
    #[arg(long, env = "RUN_ON_START", default_value = "true", action = clap::ArgAction::Set)]
    pub run_on_start: bool,
}

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        if !(2..=50).contains(&self.window_size) {
            anyhow::bail!("window_size must be between 2 and 50");
        }
        if !self.movement_threshold.is_finite() || self.movement_threshold <= 0.0 {
            anyhow::bail!("movement_threshold must be positive");
        }
        if self.cooldown_minutes < 0 {
            anyhow::bail!("cooldown_minutes must not be negative");
        }
        if self.medium_multiplier < 1.0 || self.high_multiplier < self.medium_multiplier {
            anyhow::bail!("multipliers must satisfy 1.0 <= medium_multiplier <= high_multiplier");
        }
        if self.provider_timeout_secs == 0 {
            anyhow::bail!("provider_timeout_secs must be positive");
        }
        if self.fetch_concurrency == 0 {
            anyhow::bail!("fetch_concurrency must be at least 1");
        }
        if self.sports().is_empty() {
            anyhow::bail!("at least one sport key is required");
        }
        Ok(())
    }

    pub fn sports(&self) -> Vec<String> {
        normalize_keys(&self.sports)
    }

    pub fn detector_config(&self) -> DetectorConfig {
        DetectorConfig {
            strategy: self.detection_strategy,
            window_size: self.window_size,
            movement_threshold: self.movement_threshold,
            cooldown_minutes: self.cooldown_minutes,
            medium_multiplier: self.medium_multiplier,
            high_multiplier: self.high_multiplier,
        }
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            sports: self.sports(),
            tracked_sportsbooks: normalize_keys(&self.tracked_sportsbooks)
                .into_iter()
                .collect::<HashSet<_>>(),
            provider_timeout: Duration::from_secs(self.provider_timeout_secs),
            fetch_concurrency: self.fetch_concurrency,
            overlap_policy: self.overlap_policy,
            cycle_interval: (self.cycle_interval_secs > 0)
                .then(|| Duration::from_secs(self.cycle_interval_secs)),
            run_on_start: self.run_on_start,
        }
    }
}

/// Trim, lowercase, drop empties and repeats.
fn normalize_keys(keys: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for key in keys {
        let key = key.trim().to_lowercase();
        if !key.is_empty() && !out.contains(&key) {
            out.push(key);
        }
    }
    out
}
