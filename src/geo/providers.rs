//! Remote HTTP geolocation providers
//!
//! Both services answer a plain GET with JSON. Their schemas differ, so each
//! provider normalizes into `GeoLocation`.

use async_trait::async_trait;
use serde::{Deserialize, Deserializer};
use std::net::IpAddr;

use super::{GeoError, GeoLocation, GeoProvider};
use crate::db::UNKNOWN;

/// ipinfo.io: `{ip, city, region, country, loc: "lat,lng", org, timezone, postal}`
pub struct IpInfoProvider {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl IpInfoProvider {
    pub fn new(client: reqwest::Client, base_url: &str, token: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: (!token.is_empty()).then(|| token.to_string()),
        }
    }

    fn url(&self, ip: Option<IpAddr>) -> String {
        match ip {
            Some(ip) => format!("{}/{}/json", self.base_url, ip),
            None => format!("{}/json", self.base_url),
        }
    }
}

#[derive(Debug, Deserialize)]
struct IpInfoResponse {
    ip: Option<String>,
    city: Option<String>,
    region: Option<String>,
    country: Option<String>,
    loc: Option<String>,
    org: Option<String>,
    timezone: Option<String>,
    postal: Option<String>,
    #[serde(default)]
    bogon: bool,
}

#[async_trait]
impl GeoProvider for IpInfoProvider {
    fn name(&self) -> &str {
        "ipinfo"
    }

    async fn locate(&self, ip: Option<IpAddr>) -> Result<GeoLocation, GeoError> {
        let mut request = self
            .client
            .get(self.url(ip))
            .header(reqwest::header::ACCEPT, "application/json");
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(GeoError::Status(response.status().as_u16()));
        }
        let body: IpInfoResponse = response.json().await?;
        normalize_ipinfo(body)
    }
}

fn normalize_ipinfo(body: IpInfoResponse) -> Result<GeoLocation, GeoError> {
    if body.bogon {
        return Err(GeoError::NotFound(body.ip.unwrap_or_default()));
    }
    let ip = body
        .ip
        .filter(|ip| !ip.is_empty())
        .ok_or_else(|| GeoError::Invalid("missing ip".to_string()))?;
    let (latitude, longitude) = body.loc.as_deref().map(parse_loc).unwrap_or((0.0, 0.0));

    // ipinfo only reports a country code; it doubles as the display name
    let country_code = non_empty(body.country);
    Ok(GeoLocation {
        ip,
        city: non_empty(body.city).unwrap_or_else(|| UNKNOWN.to_string()),
        region: non_empty(body.region),
        country_name: country_code.clone().unwrap_or_else(|| UNKNOWN.to_string()),
        country_code,
        latitude,
        longitude,
        org: non_empty(body.org),
        timezone: non_empty(body.timezone),
        postal: non_empty(body.postal),
    })
}

/// Parse ipinfo's "lat,lng"; unparseable halves become 0
fn parse_loc(loc: &str) -> (f64, f64) {
    let mut parts = loc.split(',').map(|p| p.trim().parse::<f64>().unwrap_or(0.0));
    let latitude = parts.next().unwrap_or(0.0);
    let longitude = parts.next().unwrap_or(0.0);
    (latitude, longitude)
}

/// ipgeolocation.io: `{ip, city, state_prov, country_code2, country_name,
/// latitude, longitude, organization, isp, time_zone: {name}, zipcode}`
pub struct IpGeolocationProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl IpGeolocationProvider {
    pub fn new(client: reqwest::Client, base_url: &str, api_key: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct IpGeolocationResponse {
    ip: Option<String>,
    city: Option<String>,
    state_prov: Option<String>,
    country_code2: Option<String>,
    country_name: Option<String>,
    #[serde(default, deserialize_with = "number_or_string")]
    latitude: Option<f64>,
    #[serde(default, deserialize_with = "number_or_string")]
    longitude: Option<f64>,
    organization: Option<String>,
    isp: Option<String>,
    time_zone: Option<IpGeolocationTimeZone>,
    zipcode: Option<String>,
}

#[derive(Debug, Deserialize)]
struct IpGeolocationTimeZone {
    name: Option<String>,
}

/// ipgeolocation sends coordinates as strings
fn number_or_string<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(f64),
        Text(String),
    }

    Ok(match Option::<Raw>::deserialize(deserializer)? {
        Some(Raw::Number(n)) => Some(n),
        Some(Raw::Text(s)) => s.trim().parse().ok(),
        None => None,
    })
}

#[async_trait]
impl GeoProvider for IpGeolocationProvider {
    fn name(&self) -> &str {
        "ipgeolocation"
    }

    async fn locate(&self, ip: Option<IpAddr>) -> Result<GeoLocation, GeoError> {
        let mut query = vec![("apiKey", self.api_key.clone())];
        if let Some(ip) = ip {
            query.push(("ip", ip.to_string()));
        }

        let response = self
            .client
            .get(format!("{}/ipgeo", self.base_url))
            .query(&query)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(GeoError::Status(response.status().as_u16()));
        }
        let body: IpGeolocationResponse = response.json().await?;
        normalize_ipgeolocation(body)
    }
}

fn normalize_ipgeolocation(body: IpGeolocationResponse) -> Result<GeoLocation, GeoError> {
    let ip = body
        .ip
        .filter(|ip| !ip.is_empty())
        .ok_or_else(|| GeoError::Invalid("missing ip".to_string()))?;
    let country_code = non_empty(body.country_code2);
    let country_name = non_empty(body.country_name)
        .or_else(|| country_code.clone())
        .unwrap_or_else(|| UNKNOWN.to_string());

    Ok(GeoLocation {
        ip,
        city: non_empty(body.city).unwrap_or_else(|| UNKNOWN.to_string()),
        region: non_empty(body.state_prov),
        country_code,
        country_name,
        latitude: body.latitude.unwrap_or(0.0),
        longitude: body.longitude.unwrap_or(0.0),
        org: non_empty(body.organization).or_else(|| non_empty(body.isp)),
        timezone: body.time_zone.and_then(|tz| non_empty(tz.name)),
        postal: non_empty(body.zipcode),
    })
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::StatusCode, routing::get, Json, Router};
    use std::net::SocketAddr;

    #[test]
    fn normalizes_ipinfo_payload() {
        let body: IpInfoResponse = serde_json::from_str(
            r#"{
                "ip": "81.2.69.142",
                "city": "London",
                "region": "England",
                "country": "GB",
                "loc": "51.5085,-0.1257",
                "org": "AS20712 Andrews & Arnold Ltd",
                "timezone": "Europe/London",
                "postal": "E1W"
            }"#,
        )
        .unwrap();

        let location = normalize_ipinfo(body).unwrap();
        assert_eq!(location.ip, "81.2.69.142");
        assert_eq!(location.city, "London");
        assert_eq!(location.country_code.as_deref(), Some("GB"));
        assert_eq!(location.country_name, "GB");
        assert_eq!(location.latitude, 51.5085);
        assert_eq!(location.longitude, -0.1257);
        assert_eq!(location.timezone.as_deref(), Some("Europe/London"));
    }

    #[test]
    fn ipinfo_missing_fields_become_unknown() {
        let body: IpInfoResponse = serde_json::from_str(r#"{"ip": "81.2.69.142", "loc": "garbage"}"#).unwrap();

        let location = normalize_ipinfo(body).unwrap();
        assert_eq!(location.city, "Unknown");
        assert_eq!(location.country_name, "Unknown");
        assert_eq!((location.latitude, location.longitude), (0.0, 0.0));
    }

    #[test]
    fn ipinfo_bogon_is_not_found() {
        let body: IpInfoResponse = serde_json::from_str(r#"{"ip": "10.0.0.1", "bogon": true}"#).unwrap();
        assert!(matches!(normalize_ipinfo(body), Err(GeoError::NotFound(_))));
    }

    #[test]
    fn normalizes_ipgeolocation_payload() {
        let body: IpGeolocationResponse = serde_json::from_str(
            r#"{
                "ip": "8.8.8.8",
                "city": "Mountain View",
                "state_prov": "California",
                "country_code2": "US",
                "country_name": "United States",
                "latitude": "37.42240",
                "longitude": "-122.08421",
                "isp": "Google LLC",
                "organization": "",
                "time_zone": {"name": "America/Los_Angeles", "offset": -8},
                "zipcode": "94043-1351"
            }"#,
        )
        .unwrap();

        let location = normalize_ipgeolocation(body).unwrap();
        assert_eq!(location.country_name, "United States");
        assert_eq!(location.region.as_deref(), Some("California"));
        assert_eq!(location.latitude, 37.4224);
        assert_eq!(location.longitude, -122.08421);
        assert_eq!(location.org.as_deref(), Some("Google LLC"));
        assert_eq!(location.timezone.as_deref(), Some("America/Los_Angeles"));
    }

    #[test]
    fn ipgeolocation_accepts_numeric_coordinates() {
        let body: IpGeolocationResponse =
            serde_json::from_str(r#"{"ip": "8.8.8.8", "latitude": 1.25, "longitude": -3.5}"#).unwrap();

        let location = normalize_ipgeolocation(body).unwrap();
        assert_eq!((location.latitude, location.longitude), (1.25, -3.5));
        assert_eq!(location.country_name, "Unknown");
    }

    async fn spawn(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr: SocketAddr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn ipinfo_server_error_is_status_error() {
        let base = spawn(Router::new().route("/json", get(|| async { StatusCode::INTERNAL_SERVER_ERROR }))).await;
        let provider = IpInfoProvider::new(reqwest::Client::new(), &base, "");

        let err = provider.locate(None).await.unwrap_err();
        assert!(matches!(err, GeoError::Status(500)));
    }

    #[tokio::test]
    async fn ipinfo_fetches_caller_by_address() {
        let app = Router::new().route(
            "/81.2.69.142/json",
            get(|| async {
                Json(serde_json::json!({
                    "ip": "81.2.69.142",
                    "city": "London",
                    "country": "GB",
                    "loc": "51.5,-0.12"
                }))
            }),
        );
        let base = spawn(app).await;
        let provider = IpInfoProvider::new(reqwest::Client::new(), &base, "token");

        let location = provider.locate(Some("81.2.69.142".parse().unwrap())).await.unwrap();
        assert_eq!(location.city, "London");
        assert_eq!(location.latitude, 51.5);
    }
}
