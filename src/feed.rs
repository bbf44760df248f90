//! Stale-while-revalidate stats snapshot.
//!
//! The first load decides between `Ready` and `Error`. After that a background
//! task refreshes on a fixed interval: success swaps the snapshot in, failure
//! keeps the last good snapshot and only marks it stale. The task is owned by
//! the feed and aborted on shutdown or drop.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::stats::{StatsReader, VisitorStats, FULL_RECENT_LIMIT};

#[async_trait]
pub trait StatsSource: Send + Sync {
    async fn fetch(&self) -> Result<VisitorStats>;
}

#[async_trait]
impl StatsSource for StatsReader {
    /// Always fetch the full page; smaller views are cut from it
    async fn fetch(&self) -> Result<VisitorStats> {
        self.get_stats(FULL_RECENT_LIMIT).await
    }
}

#[derive(Debug, Clone)]
pub enum FeedState {
    Loading,
    Ready {
        snapshot: Arc<VisitorStats>,
        refreshed_at: DateTime<Utc>,
        /// Set when the latest refresh failed and the snapshot is older
        stale: bool,
    },
    Error(String),
}

pub struct StatsFeed {
    state: Arc<RwLock<FeedState>>,
    refresh_task: Option<JoinHandle<()>>,
}

impl StatsFeed {
    /// Perform the initial load, then start the refresh timer
    pub async fn start(source: Arc<dyn StatsSource>, interval: Duration) -> Self {
        let state = Arc::new(RwLock::new(FeedState::Loading));
        refresh(source.as_ref(), &state).await;

        let task = tokio::spawn(refresh_loop(source, state.clone(), interval));
        info!(interval_secs = interval.as_secs(), "Stats refresh started");

        Self {
            state,
            refresh_task: Some(task),
        }
    }

    pub async fn state(&self) -> FeedState {
        self.state.read().await.clone()
    }

    pub fn is_running(&self) -> bool {
        self.refresh_task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Stop the refresh timer; the last state stays readable
    pub fn shutdown(&mut self) {
        if let Some(task) = self.refresh_task.take() {
            task.abort();
            debug!("Stats refresh stopped");
        }
    }
}

impl Drop for StatsFeed {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn refresh_loop(source: Arc<dyn StatsSource>, state: Arc<RwLock<FeedState>>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    // The first tick completes immediately and the initial load already ran
    ticker.tick().await;

    loop {
        ticker.tick().await;
        refresh(source.as_ref(), &state).await;
    }
}

async fn refresh(source: &dyn StatsSource, state: &RwLock<FeedState>) {
    match source.fetch().await {
        Ok(stats) => {
            *state.write().await = FeedState::Ready {
                snapshot: Arc::new(stats),
                refreshed_at: Utc::now(),
                stale: false,
            };
        }
        Err(e) => {
            let mut guard = state.write().await;
            match &mut *guard {
                FeedState::Ready { stale, .. } => {
                    debug!(error = %e, "Stats refresh failed, keeping last snapshot");
                    *stale = true;
                }
                other => {
                    warn!(error = %e, "Failed to load visitor stats");
                    *other = FeedState::Error(e.to_string());
                }
            }
        }
    }
}
