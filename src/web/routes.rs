//! HTTP routes

use axum::{
    extract::{Query, State},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::client::ClientInfo;
use super::AppState;
use crate::aggregator::VisitContext;
use crate::contact::ContactForm;
use crate::db::VisitorRecord;
use crate::error::{ApiError, ApiResult};
use crate::feed::FeedState;
use crate::presenter::{map_layer, MapLayer};
use crate::stats::{StatsView, VisitorStats};

/// Browser-side details the server cannot see
#[derive(Debug, Default, Deserialize)]
pub struct VisitRequest {
    pub screen_size: Option<String>,
    /// `document.referrer`; the request's own Referer is the portfolio page
    pub referrer: Option<String>,
}

const MAX_CLIENT_FIELD_LEN: usize = 512;

fn bounded(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().chars().take(MAX_CLIENT_FIELD_LEN).collect::<String>())
        .filter(|v| !v.is_empty())
}

/// API: Record the current page view. Always answers with a visitor record.
pub async fn api_visit(
    State(state): State<Arc<AppState>>,
    client: ClientInfo,
    body: Option<Json<VisitRequest>>,
) -> Json<VisitorRecord> {
    let Json(body) = body.unwrap_or_default();
    let ctx = VisitContext {
        ip: client.ip,
        user_agent: bounded(client.user_agent),
        referrer: bounded(body.referrer),
        screen_size: bounded(body.screen_size),
    };
    Json(state.aggregator.record_visit(ctx).await)
}

#[derive(Debug, Deserialize)]
pub struct ViewQuery {
    #[serde(default)]
    pub view: StatsView,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    #[serde(flatten)]
    pub stats: VisitorStats,
    pub refreshed_at: DateTime<Utc>,
    /// Latest background refresh failed; data is from an earlier one
    pub stale: bool,
}

#[derive(Debug, Serialize)]
pub struct MapResponse {
    #[serde(flatten)]
    pub layer: MapLayer,
    pub refreshed_at: DateTime<Utc>,
    pub stale: bool,
}

/// Current snapshot cut to the requested view
async fn snapshot(state: &AppState, view: StatsView) -> ApiResult<(VisitorStats, DateTime<Utc>, bool)> {
    match state.feed.state().await {
        FeedState::Ready {
            snapshot,
            refreshed_at,
            stale,
        } => Ok((snapshot.limited(view.recent_limit()), refreshed_at, stale)),
        FeedState::Loading => Err(ApiError::Unavailable("visitor statistics are loading".to_string())),
        FeedState::Error(_) => Err(ApiError::Unavailable("error loading visitor statistics".to_string())),
    }
}

/// API: Totals, ranked lists and recent visitors
pub async fn api_stats(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ViewQuery>,
) -> ApiResult<Json<StatsResponse>> {
    let (stats, refreshed_at, stale) = snapshot(&state, query.view).await?;
    Ok(Json(StatsResponse {
        stats,
        refreshed_at,
        stale,
    }))
}

/// API: Heat points, city markers and ranked rows for the map widget
pub async fn api_map(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ViewQuery>,
) -> ApiResult<Json<MapResponse>> {
    let (stats, refreshed_at, stale) = snapshot(&state, query.view).await?;
    Ok(Json(MapResponse {
        layer: map_layer(&stats),
        refreshed_at,
        stale,
    }))
}

#[derive(Debug, Serialize)]
pub struct ContactResponse {
    pub success: bool,
    pub id: String,
}

/// API: Store a contact form submission
pub async fn api_contact(
    State(state): State<Arc<AppState>>,
    Json(form): Json<ContactForm>,
) -> ApiResult<Json<ContactResponse>> {
    let message = state.contact.submit(&form).await?;
    Ok(Json(ContactResponse {
        success: true,
        id: message.id,
    }))
}
