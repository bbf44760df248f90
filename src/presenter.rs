//! Map and ranked-list inputs derived from a stats snapshot.
//!
//! The map library on the page is a sink: it takes heat points and circle
//! markers. Everything here is pure so the empty state is just empty vectors.

use serde::Serialize;

use crate::stats::{TopNEntry, VisitorLocation, VisitorStats};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HeatPoint {
    pub latitude: f64,
    pub longitude: f64,
    pub weight: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CityMarker {
    pub label: String,
    pub latitude: f64,
    pub longitude: f64,
    pub count: i64,
    pub rank: usize,
    pub radius: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedRow {
    pub rank: usize,
    pub label: String,
    pub count: i64,
    /// One decimal place, e.g. "42.9"
    pub percentage: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MapLayer {
    pub heat: Vec<HeatPoint>,
    pub markers: Vec<CityMarker>,
    pub countries: Vec<RankedRow>,
    pub cities: Vec<RankedRow>,
    pub empty: bool,
}

const MIN_MARKER_RADIUS: f64 = 6.0;
const MAX_MARKER_RADIUS: f64 = 18.0;

/// (0, 0) is where failed lookups land, not a real visitor
fn has_position(location: &VisitorLocation) -> bool {
    !(location.latitude == 0.0 && location.longitude == 0.0)
        && location.latitude.is_finite()
        && location.longitude.is_finite()
}

/// Heat intensity grows with repeat visits and saturates at 1
pub fn heat_weight(visit_count: i64) -> f64 {
    (0.5 + visit_count.max(0) as f64 * 0.1).min(1.0)
}

pub fn heat_points(recent: &[VisitorLocation]) -> Vec<HeatPoint> {
    recent
        .iter()
        .filter(|v| has_position(v))
        .map(|v| HeatPoint {
            latitude: v.latitude,
            longitude: v.longitude,
            weight: heat_weight(v.visit_count),
        })
        .collect()
}

/// Place each top city at the first recent visitor from it. Cities with no
/// located recent visitor get no marker.
pub fn city_markers(top_cities: &[TopNEntry], recent: &[VisitorLocation]) -> Vec<CityMarker> {
    let max_count = top_cities.iter().map(|c| c.count).max().unwrap_or(0);

    top_cities
        .iter()
        .enumerate()
        .filter_map(|(index, city)| {
            let anchor = recent
                .iter()
                .find(|v| has_position(v) && v.city_label() == city.label)?;
            let scale = if max_count > 0 {
                city.count as f64 / max_count as f64
            } else {
                0.0
            };
            Some(CityMarker {
                label: city.label.clone(),
                latitude: anchor.latitude,
                longitude: anchor.longitude,
                count: city.count,
                rank: index + 1,
                radius: MIN_MARKER_RADIUS + (MAX_MARKER_RADIUS - MIN_MARKER_RADIUS) * scale,
            })
        })
        .collect()
}

pub fn ranked_rows(entries: &[TopNEntry]) -> Vec<RankedRow> {
    entries
        .iter()
        .enumerate()
        .map(|(index, entry)| RankedRow {
            rank: index + 1,
            label: entry.label.clone(),
            count: entry.count,
            percentage: format!("{:.1}", entry.percentage),
        })
        .collect()
}

pub fn map_layer(stats: &VisitorStats) -> MapLayer {
    MapLayer {
        heat: heat_points(&stats.recent_visitors),
        markers: city_markers(&stats.top_cities, &stats.recent_visitors),
        countries: ranked_rows(&stats.top_countries),
        cities: ranked_rows(&stats.top_cities),
        empty: stats.total_visitors == 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn located(city: &str, country: &str, lat: f64, lon: f64, visits: i64) -> VisitorLocation {
        VisitorLocation {
            id: format!("{}-{}", city, visits),
            city: city.to_string(),
            country: country.to_string(),
            latitude: lat,
            longitude: lon,
            visit_count: visits,
            timestamp: Utc::now(),
        }
    }

    fn entry(label: &str, count: i64, percentage: f64) -> TopNEntry {
        TopNEntry { label: label.to_string(), count, percentage }
    }

    #[test]
    fn heat_weight_saturates() {
        assert!((heat_weight(1) - 0.6).abs() < 1e-9);
        assert!((heat_weight(3) - 0.8).abs() < 1e-9);
        assert_eq!(heat_weight(50), 1.0);
    }

    #[test]
    fn heat_skips_unlocated_visitors() {
        let recent = vec![
            located("Berlin", "Germany", 52.52, 13.4, 1),
            located("Unknown", "Unknown", 0.0, 0.0, 4),
        ];

        let heat = heat_points(&recent);
        assert_eq!(heat.len(), 1);
        assert_eq!(heat[0].latitude, 52.52);
    }

    #[test]
    fn markers_anchor_on_recent_visitors() {
        let top = vec![
            entry("Berlin, Germany", 4, 66.66),
            entry("Atlantis, Nowhere", 1, 16.66),
            entry("Vienna, Austria", 1, 16.66),
        ];
        let recent = vec![
            located("Vienna", "Austria", 48.2, 16.37, 1),
            located("Berlin", "Germany", 52.52, 13.4, 2),
        ];

        let markers = city_markers(&top, &recent);
        assert_eq!(markers.len(), 2);
        assert_eq!(markers[0].label, "Berlin, Germany");
        assert_eq!(markers[0].rank, 1);
        assert_eq!(markers[0].radius, MAX_MARKER_RADIUS);
        assert_eq!(markers[1].rank, 3);
        assert!(markers[1].radius < markers[0].radius);
    }

    #[test]
    fn ranked_rows_use_one_decimal() {
        let rows = ranked_rows(&[entry("Germany", 3, 42.857), entry("Austria", 4, 57.142)]);
        assert_eq!(rows[0].percentage, "42.9");
        assert_eq!(rows[1].rank, 2);
        assert_eq!(rows[1].percentage, "57.1");
    }

    #[test]
    fn empty_stats_give_empty_layer() {
        let stats = VisitorStats {
            total_visitors: 0,
            top_countries: Vec::new(),
            top_cities: Vec::new(),
            recent_visitors: Vec::new(),
            last_updated: None,
        };

        let layer = map_layer(&stats);
        assert!(layer.empty);
        assert!(layer.heat.is_empty());
        assert!(layer.markers.is_empty());
        assert!(layer.countries.is_empty());
    }
}
