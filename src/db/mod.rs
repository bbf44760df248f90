//! Database module
//!
//! Visitor records, the aggregate statistics singleton and contact messages
//! all live in one SQLite file. Every mutation of the aggregate happens inside
//! the same transaction as the visitor insert that caused it.

mod schema;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Pool, Sqlite, SqlitePool};
use std::path::Path;

use crate::config::DatabaseConfig;
use crate::geo::GeoLocation;

/// Placeholder for missing geo fields
pub const UNKNOWN: &str = "Unknown";

/// Current time truncated to the millisecond precision the store keeps
pub fn now_millis() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now)
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_else(Utc::now)
}

/// One persisted visitor, keyed by IP address
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisitorRecord {
    pub id: String,
    pub ip: String,
    pub city: String,
    pub region: Option<String>,
    pub country_code: Option<String>,
    pub country_name: String,
    pub latitude: f64,
    pub longitude: f64,
    pub org: Option<String>,
    pub timezone: Option<String>,
    pub postal: Option<String>,
    pub user_agent: Option<String>,
    pub referrer: Option<String>,
    pub screen_size: Option<String>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub visit_count: i64,
}

impl VisitorRecord {
    pub fn new(ip: String) -> Self {
        let now = now_millis();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            ip,
            city: UNKNOWN.to_string(),
            region: None,
            country_code: None,
            country_name: UNKNOWN.to_string(),
            latitude: 0.0,
            longitude: 0.0,
            org: None,
            timezone: None,
            postal: None,
            user_agent: None,
            referrer: None,
            screen_size: None,
            first_seen: now,
            last_seen: now,
            visit_count: 1,
        }
    }

    pub fn with_geo(mut self, location: &GeoLocation) -> Self {
        self.city = non_empty_or_unknown(&location.city);
        self.region = location.region.clone();
        self.country_code = location.country_code.clone();
        self.country_name = non_empty_or_unknown(&location.country_name);
        self.latitude = location.latitude;
        self.longitude = location.longitude;
        self.org = location.org.clone();
        self.timezone = location.timezone.clone();
        self.postal = location.postal.clone();
        self
    }

    pub fn with_user_agent(mut self, user_agent: Option<String>) -> Self {
        self.user_agent = user_agent;
        self
    }

    pub fn with_referrer(mut self, referrer: Option<String>) -> Self {
        self.referrer = referrer;
        self
    }

    pub fn with_screen_size(mut self, screen_size: Option<String>) -> Self {
        self.screen_size = screen_size;
        self
    }

    /// Key used in the per-city counters: "city, country"
    pub fn city_label(&self) -> String {
        format!("{}, {}", self.city, self.country_name)
    }
}

fn non_empty_or_unknown(value: &str) -> String {
    let value = value.trim();
    if value.is_empty() {
        UNKNOWN.to_string()
    } else {
        value.to_string()
    }
}

/// Result of the create-if-absent write for a visit
#[derive(Debug, Clone, PartialEq)]
pub enum UpsertOutcome {
    /// First visit from this IP; the aggregate was incremented
    Created(VisitorRecord),
    /// Known IP; visit count bumped, aggregate untouched
    Returning(VisitorRecord),
}

impl UpsertOutcome {
    pub fn is_new(&self) -> bool {
        matches!(self, UpsertOutcome::Created(_))
    }

    pub fn record(&self) -> &VisitorRecord {
        match self {
            UpsertOutcome::Created(r) | UpsertOutcome::Returning(r) => r,
        }
    }

    pub fn into_record(self) -> VisitorRecord {
        match self {
            UpsertOutcome::Created(r) | UpsertOutcome::Returning(r) => r,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LabelCount {
    pub label: String,
    pub count: i64,
}

/// Running totals. `countries` and `cities` are in first-insertion order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AggregateStats {
    pub total_visitors: i64,
    pub countries: Vec<LabelCount>,
    pub cities: Vec<LabelCount>,
    pub last_updated: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContactMessage {
    pub id: String,
    pub name: String,
    pub email: String,
    pub message: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub notification_sent: bool,
    pub notification_time: Option<DateTime<Utc>>,
}

#[derive(sqlx::FromRow)]
struct VisitorRow {
    id: String,
    ip: String,
    city: String,
    region: Option<String>,
    country_code: Option<String>,
    country_name: String,
    latitude: f64,
    longitude: f64,
    org: Option<String>,
    timezone: Option<String>,
    postal: Option<String>,
    user_agent: Option<String>,
    referrer: Option<String>,
    screen_size: Option<String>,
    first_seen: i64,
    last_seen: i64,
    visit_count: i64,
}

impl From<VisitorRow> for VisitorRecord {
    fn from(row: VisitorRow) -> Self {
        Self {
            id: row.id,
            ip: row.ip,
            city: row.city,
            region: row.region,
            country_code: row.country_code,
            country_name: row.country_name,
            latitude: row.latitude,
            longitude: row.longitude,
            org: row.org,
            timezone: row.timezone,
            postal: row.postal,
            user_agent: row.user_agent,
            referrer: row.referrer,
            screen_size: row.screen_size,
            first_seen: from_millis(row.first_seen),
            last_seen: from_millis(row.last_seen),
            visit_count: row.visit_count,
        }
    }
}

const VISITOR_COLUMNS: &str = "id, ip, city, region, country_code, country_name, latitude, longitude, org, timezone, postal, user_agent, referrer, screen_size, first_seen, last_seen, visit_count";

#[derive(Clone)]
pub struct Database {
    pool: Pool<Sqlite>,
}

impl Database {
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        if let Some(parent) = Path::new(&config.url).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let pool = SqlitePool::connect(&format!("sqlite:{}?mode=rwc", config.url)).await?;
        Ok(Self { pool })
    }

    pub async fn run_migrations(&self) -> Result<()> {
        // WAL lets the stats reader run alongside visit writes
        sqlx::query("PRAGMA journal_mode=WAL")
            .execute(&self.pool)
            .await?;
        sqlx::query("PRAGMA synchronous=NORMAL")
            .execute(&self.pool)
            .await?;

        for statement in [
            schema::CREATE_VISITORS_TABLE,
            schema::CREATE_VISITOR_STATS_TABLE,
            schema::CREATE_COUNTRY_COUNTS_TABLE,
            schema::CREATE_CITY_COUNTS_TABLE,
            schema::CREATE_CONTACT_MESSAGES_TABLE,
            schema::CREATE_INDEX_FIRST_SEEN,
            schema::CREATE_INDEX_LAST_SEEN,
            schema::CREATE_INDEX_CONTACT_CREATED,
        ] {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Create the visitor if its IP is absent, otherwise count a repeat visit.
    ///
    /// The insert, the aggregate increments and the read-back share one
    /// transaction. The transaction opens with a write, so concurrent first
    /// visits from the same IP serialize on SQLite's write lock and exactly one
    /// of them takes the `Created` branch.
    pub async fn upsert_visit(&self, visitor: &VisitorRecord) -> Result<UpsertOutcome> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO visitors (id, ip, city, region, country_code, country_name, latitude, longitude, org, timezone, postal, user_agent, referrer, screen_size, first_seen, last_seen, visit_count)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 1)
            ON CONFLICT(ip) DO NOTHING
            "#,
        )
        .bind(&visitor.id)
        .bind(&visitor.ip)
        .bind(&visitor.city)
        .bind(&visitor.region)
        .bind(&visitor.country_code)
        .bind(&visitor.country_name)
        .bind(visitor.latitude)
        .bind(visitor.longitude)
        .bind(&visitor.org)
        .bind(&visitor.timezone)
        .bind(&visitor.postal)
        .bind(&visitor.user_agent)
        .bind(&visitor.referrer)
        .bind(&visitor.screen_size)
        .bind(visitor.first_seen.timestamp_millis())
        .bind(visitor.last_seen.timestamp_millis())
        .execute(&mut *tx)
        .await?
        .rows_affected()
            == 1;

        if inserted {
            let now = visitor.last_seen.timestamp_millis();
            sqlx::query(
                r#"
                INSERT INTO visitor_stats (id, total_visitors, last_updated) VALUES (1, 1, ?)
                ON CONFLICT(id) DO UPDATE SET total_visitors = total_visitors + 1, last_updated = excluded.last_updated
                "#,
            )
            .bind(now)
            .execute(&mut *tx)
            .await?;
            sqlx::query(
                "INSERT INTO country_counts (name, visitors) VALUES (?, 1) ON CONFLICT(name) DO UPDATE SET visitors = visitors + 1",
            )
            .bind(&visitor.country_name)
            .execute(&mut *tx)
            .await?;
            sqlx::query(
                "INSERT INTO city_counts (label, visitors) VALUES (?, 1) ON CONFLICT(label) DO UPDATE SET visitors = visitors + 1",
            )
            .bind(visitor.city_label())
            .execute(&mut *tx)
            .await?;
        } else {
            sqlx::query("UPDATE visitors SET visit_count = visit_count + 1, last_seen = ? WHERE ip = ?")
                .bind(visitor.last_seen.timestamp_millis())
                .bind(&visitor.ip)
                .execute(&mut *tx)
                .await?;
        }

        let row: VisitorRow = sqlx::query_as(&format!("SELECT {} FROM visitors WHERE ip = ?", VISITOR_COLUMNS))
            .bind(&visitor.ip)
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;

        let record = VisitorRecord::from(row);
        Ok(if inserted {
            UpsertOutcome::Created(record)
        } else {
            UpsertOutcome::Returning(record)
        })
    }

    pub async fn get_visitor_by_ip(&self, ip: &str) -> Result<Option<VisitorRecord>> {
        let row: Option<VisitorRow> = sqlx::query_as(&format!("SELECT {} FROM visitors WHERE ip = ?", VISITOR_COLUMNS))
            .bind(ip)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(VisitorRecord::from))
    }

    pub async fn count_visitor_records(&self) -> Result<i64> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM visitors")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0)
    }

    /// Most recently first-seen visitors, newest first
    pub async fn get_recent_visitors(&self, limit: i64) -> Result<Vec<VisitorRecord>> {
        let rows: Vec<VisitorRow> = sqlx::query_as(&format!(
            "SELECT {} FROM visitors ORDER BY first_seen DESC, rowid DESC LIMIT ?",
            VISITOR_COLUMNS
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(VisitorRecord::from).collect())
    }

    /// Read the aggregate as one consistent snapshot
    pub async fn get_aggregate(&self) -> Result<AggregateStats> {
        let mut tx = self.pool.begin().await?;

        let totals: Option<(i64, Option<i64>)> =
            sqlx::query_as("SELECT total_visitors, last_updated FROM visitor_stats WHERE id = 1")
                .fetch_optional(&mut *tx)
                .await?;
        let countries: Vec<(String, i64)> =
            sqlx::query_as("SELECT name, visitors FROM country_counts ORDER BY id ASC")
                .fetch_all(&mut *tx)
                .await?;
        let cities: Vec<(String, i64)> =
            sqlx::query_as("SELECT label, visitors FROM city_counts ORDER BY id ASC")
                .fetch_all(&mut *tx)
                .await?;

        tx.commit().await?;

        let (total_visitors, last_updated) = totals.unwrap_or((0, None));
        Ok(AggregateStats {
            total_visitors,
            countries: to_label_counts(countries),
            cities: to_label_counts(cities),
            last_updated: last_updated.map(from_millis),
        })
    }

    /// Delete visitor records last seen before `cutoff`. The aggregate keeps
    /// counting them.
    pub async fn prune_visitors(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM visitors WHERE last_seen < ?")
            .bind(cutoff.timestamp_millis())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Drop all running totals
    pub async fn reset_stats(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM visitor_stats").execute(&mut *tx).await?;
        sqlx::query("DELETE FROM country_counts").execute(&mut *tx).await?;
        sqlx::query("DELETE FROM city_counts").execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Recompute the aggregate from the visitor records currently stored
    pub async fn rebuild_stats(&self) -> Result<AggregateStats> {
        let now = now_millis().timestamp_millis();
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM visitor_stats").execute(&mut *tx).await?;
        sqlx::query("DELETE FROM country_counts").execute(&mut *tx).await?;
        sqlx::query("DELETE FROM city_counts").execute(&mut *tx).await?;

        sqlx::query("INSERT INTO visitor_stats (id, total_visitors, last_updated) SELECT 1, COUNT(*), ? FROM visitors")
            .bind(now)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            r#"
            INSERT INTO country_counts (name, visitors)
            SELECT country_name, COUNT(*) FROM visitors
            GROUP BY country_name
            ORDER BY MIN(first_seen) ASC, country_name ASC
            "#,
        )
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            r#"
            INSERT INTO city_counts (label, visitors)
            SELECT city || ', ' || country_name, COUNT(*) FROM visitors
            GROUP BY city || ', ' || country_name
            ORDER BY MIN(first_seen) ASC, city || ', ' || country_name ASC
            "#,
        )
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        self.get_aggregate().await
    }
}

fn to_label_counts(rows: Vec<(String, i64)>) -> Vec<LabelCount> {
    rows.into_iter()
        .map(|(label, count)| LabelCount { label, count })
        .collect()
}

impl Database {
    pub async fn insert_contact_message(&self, message: &ContactMessage) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO contact_messages (id, name, email, message, status, created_at, notification_sent, notification_time)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&message.id)
        .bind(&message.name)
        .bind(&message.email)
        .bind(&message.message)
        .bind(&message.status)
        .bind(message.created_at.timestamp_millis())
        .bind(message.notification_sent)
        .bind(message.notification_time.map(|t| t.timestamp_millis()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mark_notification_sent(&self, id: &str, at: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE contact_messages SET notification_sent = 1, notification_time = ? WHERE id = ?",
        )
        .bind(at.timestamp_millis())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn get_contact_message(&self, id: &str) -> Result<Option<ContactMessage>> {
        let row: Option<(String, String, String, String, String, i64, bool, Option<i64>)> = sqlx::query_as(
            r#"
            SELECT id, name, email, message, status, created_at, notification_sent, notification_time
            FROM contact_messages
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(id, name, email, message, status, created_at, notification_sent, notification_time)| {
            ContactMessage {
                id,
                name,
                email,
                message,
                status,
                created_at: from_millis(created_at),
                notification_sent,
                notification_time: notification_time.map(from_millis),
            }
        }))
    }
}
