use std::collections::HashSet;

use redis::AsyncCommands;
use serde_json::Value;

use super::{
    CityStats, GLOBAL_NUM_OPEN, GLOBAL_PRIORITY_SUM, GLOBAL_TS_ZSET, StateStore, open_set_key,
    priority_sum_key, record_priority, record_ts_epoch, req_key, ts_zset_key,
};
use crate::error::TriageError;

const RECENT_WINDOW_SECS: i64 = 3600;

/// Redis-backed `StateStore`, sharing one multiplexed `ConnectionManager`
/// across every poller (§5, "no per-poller locking").
#[derive(Clone)]
pub struct RedisStore {
    conn: redis::aio::ConnectionManager,
}

impl RedisStore {
    pub async fn connect(redis_url: &str) -> Result<Self, TriageError> {
        let client = redis::Client::open(redis_url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self { conn })
    }
}

impl StateStore for RedisStore {
    async fn cache_request(
        &self,
        city: &str,
        id: &str,
        record: &Value,
        ttl_secs: u64,
    ) -> Result<(), TriageError> {
        let priority = record_priority(record);
        let ts_epoch = record_ts_epoch(record);
        let payload = serde_json::to_string(record)
            .map_err(|e| TriageError::ClassifierOther(format!("record not serializable: {e}")))?;

        let mut conn = self.conn.clone();
        let key = req_key(city, id);
        let _: () = redis::pipe()
            .set_ex(&key, &payload, ttl_secs)
            .ignore()
            .sadd(open_set_key(city), id)
            .ignore()
            .incr(priority_sum_key(city), priority)
            .ignore()
            .zadd(ts_zset_key(city), id, ts_epoch)
            .ignore()
            .incr(GLOBAL_PRIORITY_SUM, priority)
            .ignore()
            .incr(GLOBAL_NUM_OPEN, 1)
            .ignore()
            .zadd(GLOBAL_TS_ZSET, &key, ts_epoch)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn evict_request(&self, city: &str, id: &str) -> Result<(), TriageError> {
        let mut conn = self.conn.clone();
        let key = req_key(city, id);
        let existing: Option<String> = conn.get(&key).await?;
        let priority = existing
            .as_deref()
            .and_then(|s| serde_json::from_str::<Value>(s).ok())
            .map(|v| record_priority(&v))
            .unwrap_or(0);

        let _: () = redis::pipe()
            .del(&key)
            .ignore()
            .srem(open_set_key(city), id)
            .ignore()
            .decr(priority_sum_key(city), priority)
            .ignore()
            .zrem(ts_zset_key(city), id)
            .ignore()
            .decr(GLOBAL_PRIORITY_SUM, priority)
            .ignore()
            .decr(GLOBAL_NUM_OPEN, 1)
            .ignore()
            .zrem(GLOBAL_TS_ZSET, &key)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn is_cached(&self, city: &str, id: &str) -> Result<bool, TriageError> {
        let mut conn = self.conn.clone();
        let in_set: bool = conn.sismember(open_set_key(city), id).await?;
        if in_set {
            return Ok(true);
        }
        let exists: bool = conn.exists(req_key(city, id)).await?;
        Ok(exists)
    }

    async fn get_cached_ids(&self, city: &str) -> Result<HashSet<String>, TriageError> {
        let mut conn = self.conn.clone();
        let ids: HashSet<String> = conn.smembers(open_set_key(city)).await?;
        Ok(ids)
    }

    async fn get_request(&self, city: &str, id: &str) -> Result<Option<Value>, TriageError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(req_key(city, id)).await?;
        Ok(raw.and_then(|s| serde_json::from_str(&s).ok()))
    }

    async fn mget_requests(&self, city: &str) -> Result<Vec<Value>, TriageError> {
        let ids = self.get_cached_ids(city).await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let keys: Vec<String> = ids.iter().map(|id| req_key(city, id)).collect();
        let mut conn = self.conn.clone();
        let raw: Vec<Option<String>> = conn.get(keys).await?;
        Ok(raw
            .into_iter()
            .flatten()
            .filter_map(|s| serde_json::from_str(&s).ok())
            .collect())
    }

    async fn get_city_stats(&self, city: &str) -> Result<CityStats, TriageError> {
        let mut conn = self.conn.clone();
        let one_hour_ago = chrono::Utc::now().timestamp() - RECENT_WINDOW_SECS;
        let (num_open, priority_sum, recent): (i64, Option<i64>, i64) = redis::pipe()
            .scard(open_set_key(city))
            .get(priority_sum_key(city))
            .zcount(ts_zset_key(city), one_hour_ago, "+inf")
            .query_async(&mut conn)
            .await?;
        Ok(CityStats::new(num_open, priority_sum.unwrap_or(0), recent))
    }

    async fn get_global_stats(&self) -> Result<CityStats, TriageError> {
        let mut conn = self.conn.clone();
        let one_hour_ago = chrono::Utc::now().timestamp() - RECENT_WINDOW_SECS;
        let (num_open, priority_sum, recent): (Option<i64>, Option<i64>, i64) = redis::pipe()
            .get(GLOBAL_NUM_OPEN)
            .get(GLOBAL_PRIORITY_SUM)
            .zcount(GLOBAL_TS_ZSET, one_hour_ago, "+inf")
            .query_async(&mut conn)
            .await?;
        Ok(CityStats::new(
            num_open.unwrap_or(0),
            priority_sum.unwrap_or(0),
            recent,
        ))
    }

    async fn get_recent_requests(&self, n: usize) -> Result<Vec<Value>, TriageError> {
        if n == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let keys: Vec<String> = conn
            .zrevrange(GLOBAL_TS_ZSET, 0, (n as isize).saturating_sub(1))
            .await?;
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let raw: Vec<Option<String>> = conn.get(keys).await?;
        Ok(raw
            .into_iter()
            .flatten()
            .filter_map(|s| serde_json::from_str(&s).ok())
            .collect())
    }
}
