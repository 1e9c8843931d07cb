use std::collections::{HashMap, HashSet};

use serde_json::Value;
use tokio::sync::Mutex;

use super::{CityStats, StateStore, record_priority, record_ts_epoch, req_key};
use crate::error::TriageError;

const RECENT_WINDOW_SECS: i64 = 3600;

#[derive(Default)]
struct Inner {
    records: HashMap<String, Value>,
    open_ids: HashMap<String, HashSet<String>>,
    priority_sum: HashMap<String, i64>,
    ts_by_city: HashMap<String, Vec<(String, i64)>>,
    global_num_open: i64,
    global_priority_sum: i64,
    global_ts: Vec<(String, i64)>,
}

/// In-memory double for `StateStore`, used by unit and integration tests.
/// Kept as an ordinary `pub` module rather than `#[cfg(test)]`-gated so it
/// stays visible to integration tests under `tests/`, which compile this
/// crate as an ordinary (non-`--cfg test`) dependency.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemoryStore {
    async fn cache_request(
        &self,
        city: &str,
        id: &str,
        record: &Value,
        _ttl_secs: u64,
    ) -> Result<(), TriageError> {
        let priority = record_priority(record);
        let ts_epoch = record_ts_epoch(record);
        let key = req_key(city, id);

        let mut inner = self.inner.lock().await;
        inner.records.insert(key.clone(), record.clone());
        inner
            .open_ids
            .entry(city.to_string())
            .or_default()
            .insert(id.to_string());
        *inner.priority_sum.entry(city.to_string()).or_default() += priority;
        inner
            .ts_by_city
            .entry(city.to_string())
            .or_default()
            .push((id.to_string(), ts_epoch));
        inner.global_num_open += 1;
        inner.global_priority_sum += priority;
        inner.global_ts.push((key, ts_epoch));
        Ok(())
    }

    async fn evict_request(&self, city: &str, id: &str) -> Result<(), TriageError> {
        let key = req_key(city, id);
        let mut inner = self.inner.lock().await;
        let priority = inner
            .records
            .get(&key)
            .map(record_priority)
            .unwrap_or(0);

        inner.records.remove(&key);
        if let Some(set) = inner.open_ids.get_mut(city) {
            set.remove(id);
        }
        *inner.priority_sum.entry(city.to_string()).or_default() -= priority;
        if let Some(list) = inner.ts_by_city.get_mut(city) {
            list.retain(|(existing, _)| existing != id);
        }
        inner.global_num_open -= 1;
        inner.global_priority_sum -= priority;
        inner.global_ts.retain(|(existing, _)| existing != &key);
        Ok(())
    }

    async fn is_cached(&self, city: &str, id: &str) -> Result<bool, TriageError> {
        let key = req_key(city, id);
        let inner = self.inner.lock().await;
        let in_set = inner
            .open_ids
            .get(city)
            .is_some_and(|set| set.contains(id));
        Ok(in_set || inner.records.contains_key(&key))
    }

    async fn get_cached_ids(&self, city: &str) -> Result<HashSet<String>, TriageError> {
        let inner = self.inner.lock().await;
        Ok(inner.open_ids.get(city).cloned().unwrap_or_default())
    }

    async fn get_request(&self, city: &str, id: &str) -> Result<Option<Value>, TriageError> {
        let inner = self.inner.lock().await;
        Ok(inner.records.get(&req_key(city, id)).cloned())
    }

    async fn mget_requests(&self, city: &str) -> Result<Vec<Value>, TriageError> {
        let inner = self.inner.lock().await;
        let Some(ids) = inner.open_ids.get(city) else {
            return Ok(Vec::new());
        };
        Ok(ids
            .iter()
            .filter_map(|id| inner.records.get(&req_key(city, id)))
            .cloned()
            .collect())
    }

    async fn get_city_stats(&self, city: &str) -> Result<CityStats, TriageError> {
        let inner = self.inner.lock().await;
        let num_open = inner.open_ids.get(city).map(|s| s.len() as i64).unwrap_or(0);
        let priority_sum = inner.priority_sum.get(city).copied().unwrap_or(0);
        let cutoff = chrono::Utc::now().timestamp() - RECENT_WINDOW_SECS;
        let recent = inner
            .ts_by_city
            .get(city)
            .map(|list| list.iter().filter(|(_, ts)| *ts >= cutoff).count() as i64)
            .unwrap_or(0);
        Ok(CityStats::new(num_open, priority_sum, recent))
    }

    async fn get_global_stats(&self) -> Result<CityStats, TriageError> {
        let inner = self.inner.lock().await;
        let cutoff = chrono::Utc::now().timestamp() - RECENT_WINDOW_SECS;
        let recent = inner
            .global_ts
            .iter()
            .filter(|(_, ts)| *ts >= cutoff)
            .count() as i64;
        Ok(CityStats::new(
            inner.global_num_open,
            inner.global_priority_sum,
            recent,
        ))
    }

    async fn get_recent_requests(&self, n: usize) -> Result<Vec<Value>, TriageError> {
        if n == 0 {
            return Ok(Vec::new());
        }
        let inner = self.inner.lock().await;
        let mut sorted = inner.global_ts.clone();
        sorted.sort_by(|a, b| b.1.cmp(&a.1));
        Ok(sorted
            .into_iter()
            .take(n)
            .filter_map(|(key, _)| inner.records.get(&key).cloned())
            .collect())
    }
}
