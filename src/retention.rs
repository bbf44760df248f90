use chrono::Duration as ChronoDuration;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time;

use crate::db::{now_millis, Database};

/// Background task that prunes visitor records not seen within the retention window.
pub fn start_retention_task(db: Database, retention_days: u64, interval_secs: u64) -> JoinHandle<()> {
    tokio::spawn(retention_loop(db, retention_days, interval_secs))
}

async fn retention_loop(db: Database, retention_days: u64, interval_secs: u64) {
    let mut interval = time::interval(Duration::from_secs(interval_secs));

    loop {
        interval.tick().await;

        match run_retention_once(&db, retention_days).await {
            Ok(deleted) if deleted > 0 => tracing::info!(deleted, "pruned old visitor records"),
            Ok(_) => tracing::debug!("no visitor records to prune"),
            Err(e) => tracing::error!(error = %e, "retention prune failed"),
        }
    }
}

/// Run a single retention pass. Returns the number of deleted records.
pub async fn run_retention_once(db: &Database, retention_days: u64) -> anyhow::Result<u64> {
    let window = i64::try_from(retention_days)
        .ok()
        .and_then(ChronoDuration::try_days)
        .ok_or_else(|| anyhow::anyhow!("retention window of {} days is out of range", retention_days))?;
    let cutoff = now_millis()
        .checked_sub_signed(window)
        .ok_or_else(|| anyhow::anyhow!("retention window of {} days is out of range", retention_days))?;
    db.prune_visitors(cutoff).await
}
