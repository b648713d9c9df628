use anyhow::Result;
use async_trait::async_trait;

use crate::db::models::{Event, SnapshotRecord};

/// Trait that every odds feed must implement.
///
/// Implementations own all vendor-specific wire formats; the ingestion core
/// only ever sees `Event`s and normalized `SnapshotRecord`s.
#[async_trait]
pub trait OddsProvider: Send + Sync {
    /// Events currently offered for the given sport keys.
    async fn discover_events(&self, sports: &[String]) -> Result<Vec<Event>>;

    /// Latest moneyline observations for one event, one record per
    /// (sportsbook, side).
    async fn fetch_latest(&self, event: &Event) -> Result<Vec<SnapshotRecord>>;

    /// Provider key, stored on every event it discovers.
    fn name(&self) -> &str;
}
