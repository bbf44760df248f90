//! Portfolio Stats - visitor analytics for a personal portfolio site
//!
//! Records each page view once per visitor IP, resolves where it came from
//! through a chain of geolocation providers and serves aggregate counts,
//! ranked countries and cities, recent visitors and map data.

pub mod aggregator;
pub mod config;
pub mod contact;
pub mod db;
pub mod error;
pub mod events;
pub mod feed;
pub mod geo;
pub mod presenter;
pub mod retention;
pub mod stats;
pub mod web;
