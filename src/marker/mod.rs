//! Rolling deduplication sets for already-queued work.
//!
//! A marker group is backed by one set per UTC day, named `{group}_{date}`.
//! Membership is checked against today's and yesterday's sets together so an
//! ID added just before midnight is still seen just after it. Each day's set
//! expires about a day after its last write, so storage never grows unbounded.
//!
//! Presence means "already queued, do not queue again". Absence only proves
//! that within the two-day window; the durable row remains authoritative.

mod memory;
mod redis;

pub use memory::MemoryMarkers;
pub use redis::RedisMarkers;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::time::Duration;

use crate::error::Result;

/// Expiry re-applied to today's set on every add.
pub const MARKER_EXPIRY: Duration = Duration::from_secs(24 * 60 * 60);

/// Group used for campaign event fires.
pub const CAMPAIGN_EVENT_GROUP: &str = "campaign_event";

#[async_trait]
pub trait MarkerSet: Send + Sync {
    /// Whether `id` was marked today or yesterday.
    async fn contains(&self, group: &str, id: &str) -> Result<bool>;

    /// Marks `id` in today's set.
    async fn add(&self, group: &str, id: &str) -> Result<()>;

    /// Unmarks `id` from both days' sets.
    async fn remove(&self, group: &str, id: &str) -> Result<()>;

    /// Removes every mark in the group.
    async fn clear(&self, group: &str) -> Result<()>;
}

/// Names of the today and yesterday sets for `group` at `now`.
pub fn bucket_keys(group: &str, now: DateTime<Utc>) -> [String; 2] {
    let today = now.date_naive();
    let yesterday = (now - ChronoDuration::days(1)).date_naive();
    [
        format!("{group}_{}", today.format("%Y_%m_%d")),
        format!("{group}_{}", yesterday.format("%Y_%m_%d")),
    ]
}
