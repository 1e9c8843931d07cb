//! Read surface over the state store (§4.G).
//!
//! Plain async functions an external HTTP layer could call directly — no
//! server, routing, or auth lives here; those are named out of scope in
//! spec.md §1 and §6 and stay that way.

use serde_json::Value;

use crate::config::Config;
use crate::error::TriageError;
use crate::store::{CityStats, StateStore};

pub async fn list_by_city<S: StateStore>(store: &S, city: &str) -> Result<Vec<Value>, TriageError> {
    store.mget_requests(city).await
}

pub async fn recent<S: StateStore>(store: &S, n: usize) -> Result<Vec<Value>, TriageError> {
    store.get_recent_requests(n).await
}

pub async fn city_stats<S: StateStore>(store: &S, city: &str) -> Result<CityStats, TriageError> {
    store.get_city_stats(city).await
}

pub async fn global_stats<S: StateStore>(store: &S) -> Result<CityStats, TriageError> {
    store.get_global_stats().await
}

pub fn available_cities(config: &Config) -> Vec<&str> {
    config.cities.keys().map(String::as_str).collect()
}
