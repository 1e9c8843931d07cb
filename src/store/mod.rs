//! Shared request/aggregate state (§4.D, §5).
//!
//! The store holds merged records as plain JSON (`serde_json::Value`) rather
//! than a typed `AugmentedRequest` — matching the original `cache.py`'s
//! dict-shaped payloads and letting `get_city_stats`/`get_global_stats` treat
//! a record missing `priority` as priority 0 without special-cased typed
//! fallback logic.
//!
//! Aggregates (`priority_sum`, the open-id set, the two timestamp indexes)
//! are maintained by non-transactional pipelined writes, same as the
//! original `redis.pipeline(transaction=False)` usage — a crash between two
//! pipeline calls can leave them skewed relative to the record set. §5 and
//! §9 call this out as an accepted relaxation, not a bug; callers that read
//! stats must tolerate the skew.

mod fake;
mod redis_store;

pub use fake::MemoryStore;
pub use redis_store::RedisStore;

use std::collections::HashSet;

use serde_json::Value;

use crate::error::TriageError;

/// Aggregate counters for one city, or for the whole deployment.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize)]
pub struct CityStats {
    pub num_open: i64,
    pub avg_priority: f64,
    pub recent_requests: i64,
}

impl CityStats {
    pub fn new(num_open: i64, priority_sum: i64, recent_requests: i64) -> Self {
        let avg_priority = if num_open > 0 {
            (priority_sum as f64 / num_open as f64 * 10.0).round() / 10.0
        } else {
            0.0
        };
        Self {
            num_open,
            avg_priority,
            recent_requests,
        }
    }
}

/// Persistent state behind the triage pipeline: cached records, per-city and
/// global aggregates, and a recency index (§4.D). Implemented against a
/// generic type parameter rather than `dyn` — native async-fn-in-trait
/// methods aren't object-safe, and nothing in this crate needs dynamic
/// dispatch between implementations.
pub trait StateStore: Send + Sync {
    /// Stores `record` under `(city, id)` with a TTL, and folds it into the
    /// per-city and global aggregates.
    async fn cache_request(
        &self,
        city: &str,
        id: &str,
        record: &Value,
        ttl_secs: u64,
    ) -> Result<(), TriageError>;

    /// Removes `(city, id)` and its contribution to the aggregates.
    async fn evict_request(&self, city: &str, id: &str) -> Result<(), TriageError>;

    /// True if `id` is a member of the city's open-id set *or* its record key
    /// still exists — deliberately permissive (§9 Open Question): a record
    /// that TTL'd out of the open set but not yet out of its key, or vice
    /// versa, still counts as cached rather than being re-classified.
    async fn is_cached(&self, city: &str, id: &str) -> Result<bool, TriageError>;

    async fn get_cached_ids(&self, city: &str) -> Result<HashSet<String>, TriageError>;

    async fn get_request(&self, city: &str, id: &str) -> Result<Option<Value>, TriageError>;

    /// Fetches every record currently in the city's open-id set. IDs whose
    /// record key already expired are silently skipped.
    async fn mget_requests(&self, city: &str) -> Result<Vec<Value>, TriageError>;

    async fn get_city_stats(&self, city: &str) -> Result<CityStats, TriageError>;

    async fn get_global_stats(&self) -> Result<CityStats, TriageError>;

    /// Most recently ingested records across all cities, newest first.
    async fn get_recent_requests(&self, n: usize) -> Result<Vec<Value>, TriageError>;
}

fn req_key(city: &str, id: &str) -> String {
    format!("req:{city}:{id}")
}

fn open_set_key(city: &str) -> String {
    format!("city:{city}:open_ids")
}

fn priority_sum_key(city: &str) -> String {
    format!("city:{city}:priority_sum")
}

fn ts_zset_key(city: &str) -> String {
    format!("city:{city}:ts_open")
}

const GLOBAL_NUM_OPEN: &str = "global:num_open";
const GLOBAL_PRIORITY_SUM: &str = "global:priority_sum";
const GLOBAL_TS_ZSET: &str = "global:ts_open";

/// Priority a record contributes to the aggregates if it carries none — a
/// record missing `priority` is treated as priority 0 (invariant, §5).
fn record_priority(record: &Value) -> i64 {
    record.get("priority").and_then(Value::as_i64).unwrap_or(0)
}

fn record_ts_epoch(record: &Value) -> i64 {
    record
        .get("requested_datetime")
        .and_then(Value::as_str)
        .map(crate::time::parse_or_now)
        .unwrap_or_else(|| chrono::Utc::now().timestamp())
}
