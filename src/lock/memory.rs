//! In-process locks with expiry.

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::{LockToken, Locker, lock_key, next_wait};
use crate::error::Result;

#[derive(Default)]
pub struct MemoryLocker {
    held: Mutex<HashMap<String, (LockToken, Instant)>>,
}

impl MemoryLocker {
    pub fn new() -> Self {
        Self::default()
    }

    async fn try_grab(&self, key: &str, ttl: Duration) -> Option<LockToken> {
        let now = Instant::now();
        let mut held = self.held.lock().await;
        match held.get(key) {
            Some((_, expires)) if *expires > now => None,
            _ => {
                let token = LockToken::generate();
                held.insert(key.to_string(), (token.clone(), now + ttl));
                Some(token)
            }
        }
    }
}

#[async_trait]
impl Locker for MemoryLocker {
    async fn grab(&self, key: &str, ttl: Duration, timeout: Duration) -> Result<Option<LockToken>> {
        let key = lock_key(key);
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(token) = self.try_grab(&key, ttl).await {
                return Ok(Some(token));
            }
            match next_wait(deadline) {
                Some(wait) => tokio::time::sleep(wait).await,
                None => return Ok(None),
            }
        }
    }

    async fn extend(&self, key: &str, token: &LockToken, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        let mut held = self.held.lock().await;
        match held.get_mut(&lock_key(key)) {
            Some((owner, expires)) if owner == token && *expires > now => {
                *expires = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, key: &str, token: &LockToken) -> Result<bool> {
        let now = Instant::now();
        let key = lock_key(key);
        let mut held = self.held.lock().await;
        match held.get(&key) {
            Some((owner, expires)) if owner == token && *expires > now => {
                held.remove(&key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
