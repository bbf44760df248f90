//! Configuration management

use anyhow::Result;
use serde::Deserialize;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub geo: GeoConfig,
    #[serde(default)]
    pub stats: StatsConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub contact: ContactConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    #[serde(default = "default_https_port")]
    pub https_port: u16,
    #[serde(default)]
    pub tls_cert: String,
    #[serde(default)]
    pub tls_key: String,
    /// Directory holding the built portfolio page (index.html and assets)
    #[serde(default = "default_static_dir")]
    pub static_dir: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            http_port: default_http_port(),
            https_port: default_https_port(),
            tls_cert: String::new(),
            tls_key: String::new(),
            static_dir: default_static_dir(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_http_port() -> u16 {
    8080
}

fn default_https_port() -> u16 {
    8443
}

fn default_static_dir() -> String {
    "static".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path of the SQLite file (created if missing)
    #[serde(default = "default_database_url")]
    pub url: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
        }
    }
}

fn default_database_url() -> String {
    "data/visitors.db".to_string()
}

/// Geolocation provider chain settings
#[derive(Debug, Clone, Deserialize)]
pub struct GeoConfig {
    /// Providers tried in order: "ipinfo", "ipgeolocation", "maxmind"
    #[serde(default = "default_providers")]
    pub providers: Vec<String>,
    /// Upper bound for a single provider attempt
    #[serde(default = "default_geo_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_geo_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    #[serde(default = "default_ipinfo_url")]
    pub ipinfo_url: String,
    #[serde(default)]
    pub ipinfo_token: String,
    #[serde(default = "default_ipgeolocation_url")]
    pub ipgeolocation_url: String,
    #[serde(default)]
    pub ipgeolocation_api_key: String,
    #[serde(default = "default_maxmind_database")]
    pub maxmind_database: String,
}

impl Default for GeoConfig {
    fn default() -> Self {
        Self {
            providers: default_providers(),
            timeout_ms: default_geo_timeout_ms(),
            cache_ttl_secs: default_geo_cache_ttl_secs(),
            ipinfo_url: default_ipinfo_url(),
            ipinfo_token: String::new(),
            ipgeolocation_url: default_ipgeolocation_url(),
            ipgeolocation_api_key: String::new(),
            maxmind_database: default_maxmind_database(),
        }
    }
}

pub const KNOWN_PROVIDERS: &[&str] = &["ipinfo", "ipgeolocation", "maxmind"];

fn default_providers() -> Vec<String> {
    KNOWN_PROVIDERS.iter().map(|p| p.to_string()).collect()
}

fn default_geo_timeout_ms() -> u64 {
    4000
}

fn default_geo_cache_ttl_secs() -> u64 {
    3600
}

fn default_ipinfo_url() -> String {
    "https://ipinfo.io".to_string()
}

fn default_ipgeolocation_url() -> String {
    "https://api.ipgeolocation.io".to_string()
}

fn default_maxmind_database() -> String {
    "data/GeoLite2-City.mmdb".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatsConfig {
    /// Length of the ranked country/city lists
    #[serde(default = "default_top_n")]
    pub top_n: usize,
    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            top_n: default_top_n(),
            refresh_interval_secs: default_refresh_interval_secs(),
        }
    }
}

fn default_top_n() -> usize {
    5
}

fn default_refresh_interval_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetentionConfig {
    /// Visitor records not seen for this many days are pruned
    #[serde(default = "default_retention_days")]
    pub days: u64,
    #[serde(default = "default_retention_interval_secs")]
    pub interval_secs: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            days: default_retention_days(),
            interval_secs: default_retention_interval_secs(),
        }
    }
}

/// Upper bound for `retention.days`, one century
pub const MAX_RETENTION_DAYS: u64 = 36_500;

fn default_retention_days() -> u64 {
    30
}

fn default_retention_interval_secs() -> u64 {
    24 * 3600
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ContactConfig {
    /// Address contact notifications go to; empty disables notification
    #[serde(default)]
    pub recipient: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// "pretty" for terminal output, "gcp" for Cloud Logging JSON
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Config {
    pub fn load(config_path: &str) -> Result<Self> {
        let builder = config::Config::builder()
            .add_source(config::File::with_name(config_path).required(false))
            .add_source(
                config::Environment::with_prefix("PORTFOLIO")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("geo.providers")
                    .try_parsing(true),
            );

        let settings = builder.build()?;
        let config: Config = settings.try_deserialize()?;

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.server.http_port == 0 {
            anyhow::bail!("Invalid http_port: 0 is not allowed");
        }
        if self.server.host.is_empty() {
            anyhow::bail!("Server host cannot be empty");
        }

        // TLS needs both halves or neither
        let has_cert = !self.server.tls_cert.is_empty();
        let has_key = !self.server.tls_key.is_empty();
        if has_cert != has_key {
            anyhow::bail!("TLS configuration incomplete: both tls_cert and tls_key must be set, or neither");
        }
        if self.tls_enabled() && self.server.https_port == 0 {
            anyhow::bail!("Invalid https_port: 0 is not allowed when TLS is enabled");
        }

        if self.database.url.is_empty() {
            anyhow::bail!("Database URL cannot be empty");
        }

        if self.geo.providers.is_empty() {
            anyhow::bail!("At least one geolocation provider must be configured");
        }
        for provider in &self.geo.providers {
            if !KNOWN_PROVIDERS.contains(&provider.as_str()) {
                anyhow::bail!("Unknown geolocation provider '{}'. Must be one of: {:?}", provider, KNOWN_PROVIDERS);
            }
        }
        if self.geo.timeout_ms == 0 {
            anyhow::bail!("geo.timeout_ms must be greater than 0");
        }

        if self.stats.top_n == 0 {
            anyhow::bail!("stats.top_n must be greater than 0");
        }
        if self.stats.refresh_interval_secs == 0 {
            anyhow::bail!("stats.refresh_interval_secs must be greater than 0");
        }

        if self.retention.days == 0 || self.retention.days > MAX_RETENTION_DAYS {
            anyhow::bail!("retention.days must be between 1 and {}", MAX_RETENTION_DAYS);
        }
        if self.retention.interval_secs == 0 {
            anyhow::bail!("retention.interval_secs must be greater than 0");
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!("Invalid logging level '{}'. Must be one of: {:?}", self.logging.level, valid_levels);
        }
        let valid_formats = ["pretty", "gcp"];
        if !valid_formats.contains(&self.logging.format.as_str()) {
            anyhow::bail!("Invalid logging format '{}'. Must be one of: {:?}", self.logging.format, valid_formats);
        }

        Ok(())
    }

    pub fn tls_enabled(&self) -> bool {
        !self.server.tls_cert.is_empty() && !self.server.tls_key.is_empty()
    }
}
