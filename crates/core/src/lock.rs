//! Distributed mutual-exclusion primitive keyed by a resource string.
//!
//! Locks carry a lease so a crashed holder cannot wedge a resource; a
//! holder whose section may outlast the lease renews it. The in-memory
//! implementation models the shared-store semantics workers see in
//! production, and is what tests substitute in.

use crate::error::{HeraldError, HeraldResult};
use crate::types::JobId;
use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

/// Owner token proving who holds a lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken(pub Uuid);

impl LockToken {
    fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

/// Mutual-exclusion contract backed by a shared store.
#[async_trait]
pub trait LockService: Send + Sync {
    /// Try to take the lock; `None` means another holder owns it.
    async fn acquire(&self, resource: &str, lease: Duration) -> Option<LockToken>;
    /// Extend the lease; fails when the token no longer owns the resource.
    async fn renew(&self, resource: &str, token: &LockToken, lease: Duration) -> bool;
    /// Release the lock; fails when the token no longer owns the resource.
    async fn release(&self, resource: &str, token: &LockToken) -> bool;
}

/// Lock resource string for a job claim (at-most-one processor per job).
pub fn job_claim_resource(job_id: JobId) -> String {
    format!("job:{}", job_id)
}

/// Run a closure while holding the lock, retrying acquisition a bounded
/// number of times before giving up with `LockBusy`.
pub async fn with_lock<T, F, Fut>(
    locks: &dyn LockService,
    resource: &str,
    lease: Duration,
    max_attempts: u32,
    retry_delay: Duration,
    f: F,
) -> HeraldResult<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = HeraldResult<T>>,
{
    let attempts = max_attempts.max(1);
    let mut token = None;
    for attempt in 0..attempts {
        if let Some(t) = locks.acquire(resource, lease).await {
            token = Some(t);
            break;
        }
        if attempt + 1 == attempts {
            break;
        }
        debug!(resource = %resource, attempt = attempt + 1, "lock busy, retrying");
        tokio::time::sleep(retry_delay).await;
    }

    let token = match token {
        Some(t) => t,
        None => return Err(HeraldError::LockBusy(resource.to_string())),
    };

    let result = f().await;

    if !locks.release(resource, &token).await {
        // Lease expired mid-section; the work may have raced another holder
        warn!(resource = %resource, "lock lease expired before release");
    }

    result
}

struct Held {
    token: LockToken,
    expires_at: Instant,
}

/// In-memory lock service with lease expiry.
pub struct InMemoryLockService {
    held: Mutex<HashMap<String, Held>>,
}

impl InMemoryLockService {
    pub fn new() -> Self {
        Self {
            held: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryLockService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LockService for InMemoryLockService {
    async fn acquire(&self, resource: &str, lease: Duration) -> Option<LockToken> {
        let mut held = self.held.lock().unwrap();
        let now = Instant::now();

        if let Some(existing) = held.get(resource) {
            if existing.expires_at > now {
                return None;
            }
            // Expired lease; the previous holder crashed or stalled
        }

        let token = LockToken::generate();
        held.insert(
            resource.to_string(),
            Held {
                token: token.clone(),
                expires_at: now + lease,
            },
        );
        Some(token)
    }

    async fn renew(&self, resource: &str, token: &LockToken, lease: Duration) -> bool {
        let mut held = self.held.lock().unwrap();
        match held.get_mut(resource) {
            Some(existing) if existing.token == *token => {
                existing.expires_at = Instant::now() + lease;
                true
            }
            _ => false,
        }
    }

    async fn release(&self, resource: &str, token: &LockToken) -> bool {
        let mut held = self.held.lock().unwrap();
        match held.get(resource) {
            Some(existing) if existing.token == *token && existing.expires_at > Instant::now() => {
                held.remove(resource);
                true
            }
            _ => false,
        }
    }
}
