//! Local lookup against a MaxMind GeoLite2-City database

use async_trait::async_trait;
use maxminddb::{geoip2, Reader};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::Path;
use tracing::{info, warn};

use super::{GeoError, GeoLocation, GeoProvider};
use crate::db::UNKNOWN;

/// GeoIP reader wrapper. Only useful when the caller's address is known.
pub struct MaxMindProvider {
    reader: Option<Reader<Vec<u8>>>,
}

impl MaxMindProvider {
    /// Load the database if it exists; a missing file disables the provider
    pub fn open(database_path: &str) -> Self {
        let path = Path::new(database_path);

        if !path.exists() {
            warn!("GeoIP database not found at: {}", database_path);
            return Self { reader: None };
        }

        match Reader::open_readfile(path) {
            Ok(reader) => {
                info!("GeoIP database loaded: {}", database_path);
                Self { reader: Some(reader) }
            }
            Err(e) => {
                warn!("Failed to load GeoIP database: {}", e);
                Self { reader: None }
            }
        }
    }

    pub fn is_available(&self) -> bool {
        self.reader.is_some()
    }

    fn lookup(&self, ip: IpAddr) -> Result<GeoLocation, GeoError> {
        let reader = self
            .reader
            .as_ref()
            .ok_or_else(|| GeoError::NotFound("database not loaded".to_string()))?;

        let city: geoip2::City = reader
            .lookup(ip)
            .map_err(|_| GeoError::NotFound(ip.to_string()))?;

        let location = city
            .location
            .as_ref()
            .ok_or_else(|| GeoError::NotFound(ip.to_string()))?;
        let (latitude, longitude) = match (location.latitude, location.longitude) {
            (Some(lat), Some(lon)) => (lat, lon),
            _ => return Err(GeoError::NotFound(ip.to_string())),
        };

        let country_code = city
            .country
            .as_ref()
            .and_then(|c| c.iso_code)
            .map(str::to_string);
        let country_name = city
            .country
            .as_ref()
            .and_then(|c| english_name(c.names.as_ref()))
            .or_else(|| country_code.clone())
            .unwrap_or_else(|| UNKNOWN.to_string());
        let city_name = city
            .city
            .as_ref()
            .and_then(|c| english_name(c.names.as_ref()))
            .unwrap_or_else(|| UNKNOWN.to_string());
        let region = city
            .subdivisions
            .as_ref()
            .and_then(|subs| subs.first())
            .and_then(|s| english_name(s.names.as_ref()));

        Ok(GeoLocation {
            ip: ip.to_string(),
            city: city_name,
            region,
            country_code,
            country_name,
            latitude,
            longitude,
            org: None,
            timezone: location.time_zone.map(str::to_string),
            postal: city.postal.as_ref().and_then(|p| p.code).map(str::to_string),
        })
    }
}

fn english_name(names: Option<&BTreeMap<&str, &str>>) -> Option<String> {
    names.and_then(|n| n.get("en")).map(|s| s.to_string())
}

#[async_trait]
impl GeoProvider for MaxMindProvider {
    fn name(&self) -> &str {
        "maxmind"
    }

    async fn locate(&self, ip: Option<IpAddr>) -> Result<GeoLocation, GeoError> {
        let ip = ip.ok_or(GeoError::NeedsAddress)?;
        self.lookup(ip)
    }
}
