//! Stats reader: aggregate totals, ranked country/city lists and the most
//! recent visitors for the map.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::db::{AggregateStats, Database, LabelCount, VisitorRecord};

/// Page size of the embedded widget
pub const COMPACT_RECENT_LIMIT: i64 = 20;
/// Page size of the full statistics view, also the hard cap
pub const FULL_RECENT_LIMIT: i64 = 100;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatsView {
    #[default]
    Compact,
    Full,
}

impl StatsView {
    pub fn recent_limit(self) -> i64 {
        match self {
            StatsView::Compact => COMPACT_RECENT_LIMIT,
            StatsView::Full => FULL_RECENT_LIMIT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TopNEntry {
    pub label: String,
    pub count: i64,
    pub percentage: f64,
}

/// A recent visitor as the map needs it; the address stays server side
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VisitorLocation {
    pub id: String,
    pub city: String,
    pub country: String,
    pub latitude: f64,
    pub longitude: f64,
    pub visit_count: i64,
    pub timestamp: DateTime<Utc>,
}

impl From<VisitorRecord> for VisitorLocation {
    fn from(record: VisitorRecord) -> Self {
        Self {
            id: record.id,
            city: record.city,
            country: record.country_name,
            latitude: record.latitude,
            longitude: record.longitude,
            visit_count: record.visit_count,
            timestamp: record.first_seen,
        }
    }
}

impl VisitorLocation {
    pub fn city_label(&self) -> String {
        format!("{}, {}", self.city, self.country)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VisitorStats {
    pub total_visitors: i64,
    pub top_countries: Vec<TopNEntry>,
    pub top_cities: Vec<TopNEntry>,
    pub recent_visitors: Vec<VisitorLocation>,
    pub last_updated: Option<DateTime<Utc>>,
}

impl VisitorStats {
    /// Same totals with the recent list cut down to `limit`
    pub fn limited(&self, limit: i64) -> Self {
        let mut stats = self.clone();
        stats.recent_visitors.truncate(limit.max(0) as usize);
        stats
    }
}

/// `count / total * 100`, defined as 0 for an empty total
pub fn percentage(count: i64, total: i64) -> f64 {
    if total <= 0 {
        0.0
    } else {
        count as f64 / total as f64 * 100.0
    }
}

/// Highest counts first; equal counts keep their input order
pub fn top_n(counts: &[LabelCount], total: i64, n: usize) -> Vec<TopNEntry> {
    let mut sorted: Vec<&LabelCount> = counts.iter().collect();
    sorted.sort_by(|a, b| b.count.cmp(&a.count));
    sorted
        .into_iter()
        .take(n)
        .map(|entry| TopNEntry {
            label: entry.label.clone(),
            count: entry.count,
            percentage: percentage(entry.count, total),
        })
        .collect()
}

#[derive(Clone)]
pub struct StatsReader {
    db: Database,
    top_n: usize,
}

impl StatsReader {
    pub fn new(db: Database, top_n: usize) -> Self {
        Self { db, top_n }
    }

    pub async fn get_stats(&self, recent_limit: i64) -> Result<VisitorStats> {
        let limit = recent_limit.clamp(1, FULL_RECENT_LIMIT);
        let (aggregate, recent) = tokio::try_join!(self.db.get_aggregate(), self.db.get_recent_visitors(limit))?;
        Ok(self.assemble(aggregate, recent))
    }

    fn assemble(&self, aggregate: AggregateStats, recent: Vec<VisitorRecord>) -> VisitorStats {
        let total = aggregate.total_visitors;
        VisitorStats {
            total_visitors: total,
            top_countries: top_n(&aggregate.countries, total, self.top_n),
            top_cities: top_n(&aggregate.cities, total, self.top_n),
            recent_visitors: recent.into_iter().map(VisitorLocation::from).collect(),
            last_updated: aggregate.last_updated,
        }
    }
}
