//! Event bus for broadcasting recorded visits to live map subscribers

use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::db::VisitorRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VisitKind {
    New,
    Returning,
}

#[derive(Debug, Clone, Serialize)]
pub struct VisitEvent {
    pub kind: VisitKind,
    pub city: String,
    pub country: String,
    pub latitude: f64,
    pub longitude: f64,
    pub visit_count: i64,
}

impl VisitEvent {
    /// The address is left out; subscribers are anonymous page viewers
    pub fn new(kind: VisitKind, visitor: &VisitorRecord) -> Self {
        Self {
            kind,
            city: visitor.city.clone(),
            country: visitor.country_name.clone(),
            latitude: visitor.latitude,
            longitude: visitor.longitude,
            visit_count: visitor.visit_count,
        }
    }
}

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Arc<VisitEvent>>,
}

impl EventBus {
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn publish(&self, event: VisitEvent) {
        let _ = self.sender.send(Arc::new(event));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<VisitEvent>> {
        self.sender.subscribe()
    }
}
