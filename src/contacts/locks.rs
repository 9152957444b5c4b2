//! Per-contact locks.
//!
//! Only one flow engine run may touch a contact at a time. Handle tasks take
//! a single contact's lock for the length of a drain; start batches lock
//! their contacts in rounds, processing whatever they managed to lock and
//! retrying the rest, so one busy contact never holds up a whole batch.
//!
//! A lock must outlive the flow engine call it guards, however long that
//! call takes. Holders re-check their locks just before the call and keep
//! re-arming them while it runs.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;

use crate::error::Result;
use crate::lock::{LockToken, Locker};
use crate::model::{ContactId, OrgId};
use crate::runtime::Runtime;

pub fn contact_lock_key(org_id: OrgId, contact_id: ContactId) -> String {
    format!("c:{org_id}:{contact_id}")
}

/// A held lock on one contact.
pub(crate) struct ContactLock {
    key: String,
    token: LockToken,
}

impl ContactLock {
    /// Waits up to the configured contact lock wait. None means the contact
    /// is busy.
    pub(crate) async fn grab(
        rt: &Runtime,
        org_id: OrgId,
        contact_id: ContactId,
    ) -> Result<Option<Self>> {
        let key = contact_lock_key(org_id, contact_id);
        let token = rt
            .locker
            .grab(&key, rt.limits.contact_lock_ttl, rt.limits.contact_lock_wait)
            .await?;
        Ok(token.map(|token| Self { key, token }))
    }

    /// Pushes the expiry out by another lock TTL. False if the lock was lost.
    pub(crate) async fn extend(&self, rt: &Runtime) -> Result<bool> {
        rt.locker
            .extend(&self.key, &self.token, rt.limits.contact_lock_ttl)
            .await
    }

    /// Runs `work` while keeping this lock alive.
    pub(crate) async fn hold<F: Future>(&self, rt: &Runtime, work: F) -> F::Output {
        keep_alive(
            rt.locker.as_ref(),
            &[(self.key.clone(), &self.token)],
            rt.limits.contact_lock_ttl,
            work,
        )
        .await
    }

    /// Releases the lock. A failure only delays the next holder until expiry.
    pub(crate) async fn release(self, rt: &Runtime) {
        if let Err(e) = rt.locker.release(&self.key, &self.token).await {
            warn!(key = %self.key, error = %e, "unable to release contact lock");
        }
    }
}

/// Tries to lock each contact, waiting up to `wait` per contact. Returns the
/// locks obtained and the contacts that were busy, in input order.
///
/// Once half of `ttl` has gone by, the remaining contacts are returned as
/// busy without being tried, so the locks handed back still have at least
/// half their expiry left.
///
/// If the backend fails part way, locks already obtained are released before
/// the error is returned.
pub async fn lock_contacts(
    locker: &dyn Locker,
    org_id: OrgId,
    contacts: &[ContactId],
    ttl: Duration,
    wait: Duration,
) -> Result<(HashMap<ContactId, LockToken>, Vec<ContactId>)> {
    let cutoff = Instant::now() + ttl / 2;
    let mut locked = HashMap::with_capacity(contacts.len());
    let mut skipped = Vec::new();

    for (i, &contact_id) in contacts.iter().enumerate() {
        if i > 0 && Instant::now() >= cutoff {
            skipped.extend_from_slice(&contacts[i..]);
            break;
        }

        let key = contact_lock_key(org_id, contact_id);
        match locker.grab(&key, ttl, wait).await {
            Ok(Some(token)) => {
                locked.insert(contact_id, token);
            }
            Ok(None) => skipped.push(contact_id),
            Err(e) => {
                unlock_contacts(locker, org_id, &locked).await?;
                return Err(e);
            }
        }
    }
    Ok((locked, skipped))
}

/// Re-arms every held lock for another `ttl`. Locks that expired while the
/// rest were being taken are removed from `locks` and their contacts
/// returned, in no particular order.
pub async fn extend_contacts(
    locker: &dyn Locker,
    org_id: OrgId,
    locks: &mut HashMap<ContactId, LockToken>,
    ttl: Duration,
) -> Result<Vec<ContactId>> {
    let mut lost = Vec::new();
    for (contact_id, token) in locks.iter() {
        if !locker
            .extend(&contact_lock_key(org_id, *contact_id), token, ttl)
            .await?
        {
            lost.push(*contact_id);
        }
    }
    for contact_id in &lost {
        locks.remove(contact_id);
    }
    Ok(lost)
}

/// Runs `work` while re-arming the held locks every third of `ttl`.
pub async fn hold_contacts<F: Future>(
    locker: &dyn Locker,
    org_id: OrgId,
    locks: &HashMap<ContactId, LockToken>,
    ttl: Duration,
    work: F,
) -> F::Output {
    let held: Vec<(String, &LockToken)> = locks
        .iter()
        .map(|(contact_id, token)| (contact_lock_key(org_id, *contact_id), token))
        .collect();
    keep_alive(locker, &held, ttl, work).await
}

async fn keep_alive<F: Future>(
    locker: &dyn Locker,
    held: &[(String, &LockToken)],
    ttl: Duration,
    work: F,
) -> F::Output {
    let period = (ttl / 3).max(Duration::from_millis(10));
    tokio::pin!(work);

    loop {
        tokio::select! {
            output = &mut work => return output,
            _ = tokio::time::sleep(period) => {
                for (key, token) in held {
                    match locker.extend(key, token, ttl).await {
                        Ok(true) => {}
                        Ok(false) => warn!(key = %key, "contact lock lost while held"),
                        Err(e) => warn!(key = %key, error = %e, "unable to extend contact lock"),
                    }
                }
            }
        }
    }
}

pub async fn unlock_contacts(
    locker: &dyn Locker,
    org_id: OrgId,
    locks: &HashMap<ContactId, LockToken>,
) -> Result<()> {
    for (contact_id, token) in locks {
        locker
            .release(&contact_lock_key(org_id, *contact_id), token)
            .await?;
    }
    Ok(())
}
