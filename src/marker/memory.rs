//! In-process marker sets with the same day-bucket semantics as Redis.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;

use super::{MARKER_EXPIRY, MarkerSet, bucket_keys};
use crate::error::Result;

type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

struct Bucket {
    ids: HashSet<String>,
    expires_on: DateTime<Utc>,
}

/// Marker sets held in memory. The clock is injectable so day rollover can be
/// exercised without waiting for midnight.
pub struct MemoryMarkers {
    buckets: Mutex<HashMap<String, Bucket>>,
    clock: Clock,
}

impl Default for MemoryMarkers {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryMarkers {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(Utc::now))
    }

    pub fn with_clock(clock: Clock) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            clock,
        }
    }

    fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }
}

#[async_trait]
impl MarkerSet for MemoryMarkers {
    async fn contains(&self, group: &str, id: &str) -> Result<bool> {
        let now = self.now();
        let buckets = self.buckets.lock().await;

        Ok(bucket_keys(group, now).iter().any(|key| {
            buckets
                .get(key)
                .is_some_and(|b| b.expires_on > now && b.ids.contains(id))
        }))
    }

    async fn add(&self, group: &str, id: &str) -> Result<()> {
        let now = self.now();
        let [today, _] = bucket_keys(group, now);
        let expires_on = now + chrono::Duration::from_std(MARKER_EXPIRY).unwrap_or_default();

        let mut buckets = self.buckets.lock().await;
        let bucket = buckets.entry(today).or_insert_with(|| Bucket {
            ids: HashSet::new(),
            expires_on,
        });
        if bucket.expires_on <= now {
            bucket.ids.clear();
        }
        bucket.ids.insert(id.to_string());
        bucket.expires_on = expires_on;
        Ok(())
    }

    async fn remove(&self, group: &str, id: &str) -> Result<()> {
        let now = self.now();
        let mut buckets = self.buckets.lock().await;
        for key in bucket_keys(group, now) {
            if let Some(bucket) = buckets.get_mut(&key) {
                bucket.ids.remove(id);
            }
        }
        Ok(())
    }

    async fn clear(&self, group: &str) -> Result<()> {
        let now = self.now();
        let mut buckets = self.buckets.lock().await;
        for key in bucket_keys(group, now) {
            buckets.remove(&key);
        }
        Ok(())
    }
}
