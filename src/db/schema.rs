//! Database schema definitions

// One row per distinct visitor IP. Timestamps are Unix milliseconds.
pub const CREATE_VISITORS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS visitors (
    id TEXT PRIMARY KEY,
    ip TEXT NOT NULL UNIQUE,
    city TEXT NOT NULL,
    region TEXT,
    country_code TEXT,
    country_name TEXT NOT NULL,
    latitude REAL NOT NULL,
    longitude REAL NOT NULL,
    org TEXT,
    timezone TEXT,
    postal TEXT,
    user_agent TEXT,
    referrer TEXT,
    screen_size TEXT,
    first_seen BIGINT NOT NULL,
    last_seen BIGINT NOT NULL,
    visit_count INTEGER NOT NULL DEFAULT 1 CHECK (visit_count >= 1)
)
"#;

// Singleton running totals; the CHECK pins it to a single row
pub const CREATE_VISITOR_STATS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS visitor_stats (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    total_visitors INTEGER NOT NULL DEFAULT 0,
    last_updated BIGINT
)
"#;

// AUTOINCREMENT ids record first-insertion order, used as the ranking tie break
pub const CREATE_COUNTRY_COUNTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS country_counts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    visitors INTEGER NOT NULL DEFAULT 0
)
"#;

pub const CREATE_CITY_COUNTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS city_counts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    label TEXT NOT NULL UNIQUE,
    visitors INTEGER NOT NULL DEFAULT 0
)
"#;

pub const CREATE_CONTACT_MESSAGES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS contact_messages (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    email TEXT NOT NULL,
    message TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'unread',
    created_at BIGINT NOT NULL,
    notification_sent INTEGER NOT NULL DEFAULT 0,
    notification_time BIGINT
)
"#;

// Recent visitors for the map, newest first
pub const CREATE_INDEX_FIRST_SEEN: &str =
    "CREATE INDEX IF NOT EXISTS idx_visitors_first_seen ON visitors(first_seen DESC)";

// Retention scans
pub const CREATE_INDEX_LAST_SEEN: &str =
    "CREATE INDEX IF NOT EXISTS idx_visitors_last_seen ON visitors(last_seen)";

pub const CREATE_INDEX_CONTACT_CREATED: &str =
    "CREATE INDEX IF NOT EXISTS idx_contact_created ON contact_messages(created_at DESC)";
