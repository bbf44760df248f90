//! Visit recording
//!
//! Resolves the caller's location, then creates or bumps its visitor record.
//! Recording is fail-open: storage errors are logged and the attempted record
//! is returned so the page never waits on analytics.

use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::db::{Database, UpsertOutcome, VisitorRecord};
use crate::events::{EventBus, VisitEvent, VisitKind};
use crate::geo::GeoLookup;

/// What the request tells us about the visitor besides its location
#[derive(Debug, Clone, Default)]
pub struct VisitContext {
    pub ip: Option<IpAddr>,
    pub user_agent: Option<String>,
    pub referrer: Option<String>,
    pub screen_size: Option<String>,
}

#[derive(Clone)]
pub struct StatsAggregator {
    db: Database,
    geo: Arc<GeoLookup>,
    event_bus: EventBus,
}

impl StatsAggregator {
    pub fn new(db: Database, geo: Arc<GeoLookup>, event_bus: EventBus) -> Self {
        Self { db, geo, event_bus }
    }

    pub async fn record_visit(&self, ctx: VisitContext) -> VisitorRecord {
        let location = self.geo.lookup(ctx.ip).await.into_location();

        // The request address is the visitor identity whenever it is known
        let key = match ctx.ip {
            Some(ip) => ip.to_string(),
            None => location.ip.clone(),
        };

        let attempted = VisitorRecord::new(key)
            .with_geo(&location)
            .with_user_agent(ctx.user_agent)
            .with_referrer(ctx.referrer.filter(|r| !r.is_empty()))
            .with_screen_size(ctx.screen_size);

        match self.db.upsert_visit(&attempted).await {
            Ok(outcome) => {
                let kind = match &outcome {
                    UpsertOutcome::Created(record) => {
                        info!(city = %record.city, country = %record.country_name, "New visitor recorded");
                        VisitKind::New
                    }
                    UpsertOutcome::Returning(record) => {
                        debug!(visits = record.visit_count, "Returning visitor");
                        VisitKind::Returning
                    }
                };
                let record = outcome.into_record();
                self.event_bus.publish(VisitEvent::new(kind, &record));
                record
            }
            Err(e) => {
                warn!(error = %e, "Failed to persist visit, returning unsaved record");
                attempted
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::{break_visitors_table, temp_database};
    use crate::geo::{GeoError, GeoLocation, GeoProvider};
    use async_trait::async_trait;
    use std::time::Duration;

    /// Resolves every caller to a fixed city
    struct Echo {
        city: &'static str,
        country: &'static str,
    }

    #[async_trait]
    impl GeoProvider for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        async fn locate(&self, ip: Option<IpAddr>) -> Result<GeoLocation, GeoError> {
            Ok(GeoLocation {
                ip: ip.map(|ip| ip.to_string()).unwrap_or_else(|| "81.2.69.1".to_string()),
                city: self.city.to_string(),
                country_name: self.country.to_string(),
                latitude: 52.52,
                longitude: 13.405,
                ..GeoLocation::sentinel()
            })
        }
    }

    struct Down;

    #[async_trait]
    impl GeoProvider for Down {
        fn name(&self) -> &str {
            "down"
        }

        async fn locate(&self, _ip: Option<IpAddr>) -> Result<GeoLocation, GeoError> {
            Err(GeoError::Status(500))
        }
    }

    fn aggregator(db: Database, provider: Box<dyn GeoProvider>) -> StatsAggregator {
        let geo = Arc::new(GeoLookup::new(vec![provider], Duration::from_secs(1), 60));
        StatsAggregator::new(db, geo, EventBus::with_capacity(16))
    }

    fn ctx(ip: &str) -> VisitContext {
        VisitContext {
            ip: Some(ip.parse().unwrap()),
            user_agent: Some("Mozilla/5.0".to_string()),
            referrer: Some(String::new()),
            screen_size: Some("1920x1080".to_string()),
        }
    }

    #[tokio::test]
    async fn new_ip_creates_record_and_counts_once() {
        let (db, _dir) = temp_database().await;
        let agg = aggregator(db.clone(), Box::new(Echo { city: "Berlin", country: "Germany" }));

        let record = agg.record_visit(ctx("81.2.69.10")).await;

        assert_eq!(record.ip, "81.2.69.10");
        assert_eq!(record.visit_count, 1);
        assert_eq!(record.screen_size.as_deref(), Some("1920x1080"));
        assert_eq!(record.referrer, None);
        let stats = db.get_aggregate().await.unwrap();
        assert_eq!(stats.total_visitors, 1);
        assert_eq!(stats.cities[0].label, "Berlin, Germany");
    }

    #[tokio::test]
    async fn k_sequential_visits_count_one_visitor() {
        let (db, _dir) = temp_database().await;
        let agg = aggregator(db.clone(), Box::new(Echo { city: "Berlin", country: "Germany" }));

        for _ in 0..5 {
            agg.record_visit(ctx("81.2.69.11")).await;
        }

        let record = db.get_visitor_by_ip("81.2.69.11").await.unwrap().unwrap();
        assert_eq!(record.visit_count, 5);
        assert_eq!(db.count_visitor_records().await.unwrap(), 1);
        assert_eq!(db.get_aggregate().await.unwrap().total_visitors, 1);
    }

    #[tokio::test]
    async fn concurrent_first_visits_do_not_double_count() {
        let (db, _dir) = temp_database().await;
        let agg = aggregator(db.clone(), Box::new(Echo { city: "Berlin", country: "Germany" }));

        let (a, b) = tokio::join!(agg.record_visit(ctx("81.2.69.12")), agg.record_visit(ctx("81.2.69.12")));

        assert_eq!(a.id, b.id);
        assert_eq!(db.count_visitor_records().await.unwrap(), 1);
        assert_eq!(db.get_aggregate().await.unwrap().total_visitors, 1);
        assert_eq!(db.get_visitor_by_ip("81.2.69.12").await.unwrap().unwrap().visit_count, 2);
    }

    #[tokio::test]
    async fn provider_failure_still_records_sentinel_location() {
        let (db, _dir) = temp_database().await;
        let agg = aggregator(db.clone(), Box::new(Down));

        let record = agg.record_visit(ctx("81.2.69.13")).await;

        assert_eq!(record.city, "Unknown");
        assert_eq!(record.country_name, "Unknown");
        assert_eq!((record.latitude, record.longitude), (0.0, 0.0));
        // Keyed by the request address rather than the sentinel 0.0.0.0
        assert_eq!(record.ip, "81.2.69.13");
        assert_eq!(db.get_aggregate().await.unwrap().countries[0].label, "Unknown");
    }

    #[tokio::test]
    async fn private_callers_stay_distinct_visitors() {
        let (db, _dir) = temp_database().await;
        let agg = aggregator(db.clone(), Box::new(Echo { city: "Berlin", country: "Germany" }));

        let a = agg.record_visit(ctx("192.168.1.20")).await;
        let b = agg.record_visit(ctx("192.168.1.21")).await;

        assert_eq!(a.ip, "192.168.1.20");
        assert_eq!(b.ip, "192.168.1.21");
        assert_eq!(b.visit_count, 1);
        // No location is invented for an address that has none
        assert_eq!(a.city, "Unknown");
        assert_eq!(b.country_name, "Unknown");
        assert_eq!(db.count_visitor_records().await.unwrap(), 2);
        assert_eq!(db.get_aggregate().await.unwrap().total_visitors, 2);
    }

    #[tokio::test]
    async fn unknown_caller_with_failed_lookup_uses_sentinel_ip() {
        let (db, _dir) = temp_database().await;
        let agg = aggregator(db, Box::new(Down));

        let record = agg.record_visit(VisitContext::default()).await;
        assert_eq!(record.ip, "0.0.0.0");
    }

    #[tokio::test]
    async fn storage_failure_returns_attempted_record() {
        let (db, dir) = temp_database().await;
        let agg = aggregator(db.clone(), Box::new(Echo { city: "Berlin", country: "Germany" }));
        break_visitors_table(&db).await;

        let record = agg.record_visit(ctx("81.2.69.14")).await;

        assert_eq!(record.ip, "81.2.69.14");
        assert_eq!(record.city, "Berlin");
        assert_eq!(record.visit_count, 1);
        drop(dir);
    }

    #[tokio::test]
    async fn visits_are_broadcast() {
        let (db, _dir) = temp_database().await;
        let agg = aggregator(db, Box::new(Echo { city: "Berlin", country: "Germany" }));
        let mut rx = agg.event_bus.subscribe();

        agg.record_visit(ctx("81.2.69.15")).await;
        agg.record_visit(ctx("81.2.69.15")).await;

        assert_eq!(rx.recv().await.unwrap().kind, VisitKind::New);
        let second = rx.recv().await.unwrap();
        assert_eq!(second.kind, VisitKind::Returning);
        assert_eq!(second.visit_count, 2);
    }
}
