//! Digest and delay scheduling.
//!
//! Three digest policies compute a wait window: Regular (fixed duration
//! from window start), Timed (next cron instant), and LookBack (rolling,
//! extended by every new event). Window open/merge/flush is serialized by
//! the distributed lock keyed by (workflow, digest key, subscriber) so
//! two workers can never flush the same window twice or lose a
//! concurrently merged event.

use crate::error::{HeraldError, HeraldResult};
use crate::lock::{with_lock, LockService};
use crate::storage::DigestWindowStore;
use crate::types::{DigestPolicy, DigestWindow, DigestWindowKey, Job};
use chrono::{DateTime, Utc};
use cron::Schedule;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// What the scheduler decided for an incoming digest job.
#[derive(Debug, Clone, PartialEq)]
pub enum DigestOutcome {
    /// First event: a window was opened anchored on this job.
    Opened { wait_until: DateTime<Utc> },
    /// Absorbed into the open window; the job is done (status `merged`).
    Merged,
    /// This job anchors a window whose wait has elapsed; flush now.
    FlushDue,
    /// This job anchors a window that is not yet due; re-check later.
    Waiting { wait_until: DateTime<Utc> },
}

/// Compute the instant a window anchored at `anchor` may flush.
pub fn wait_until(policy: &DigestPolicy, anchor: DateTime<Utc>) -> HeraldResult<DateTime<Utc>> {
    match policy {
        DigestPolicy::Regular { amount, unit } => Ok(anchor + unit.to_duration(*amount)),
        DigestPolicy::Timed { cron } => next_cron_occurrence(cron, anchor),
        DigestPolicy::LookBack { amount, unit } => Ok(anchor + unit.to_duration(*amount)),
    }
}

/// Next instant a cron expression fires after the given time.
///
/// Accepts the common five-field form by normalizing it to the six-field
/// (with seconds) form the `cron` crate parses.
pub fn next_cron_occurrence(
    expression: &str,
    after: DateTime<Utc>,
) -> HeraldResult<DateTime<Utc>> {
    let normalized = normalize_cron(expression);
    let schedule = Schedule::from_str(&normalized).map_err(|e| {
        HeraldError::Configuration(format!("invalid cron expression '{}': {}", expression, e))
    })?;
    schedule.after(&after).next().ok_or_else(|| {
        HeraldError::Configuration(format!(
            "cron expression '{}' has no future occurrence",
            expression
        ))
    })
}

fn normalize_cron(expression: &str) -> String {
    let fields = expression.split_whitespace().count();
    if fields == 5 {
        format!("0 {}", expression)
    } else {
        expression.to_string()
    }
}

/// Knobs for the lock-guarded window operations.
#[derive(Debug, Clone)]
pub struct DigestServiceConfig {
    pub lock_lease: Duration,
    pub lock_attempts: u32,
    pub lock_retry_delay: Duration,
}

impl Default for DigestServiceConfig {
    fn default() -> Self {
        Self {
            lock_lease: Duration::from_secs(30),
            lock_attempts: 3,
            lock_retry_delay: Duration::from_millis(50),
        }
    }
}

/// Stateful digest windowing over a shared window store and lock service.
pub struct DigestService {
    windows: Arc<dyn DigestWindowStore>,
    locks: Arc<dyn LockService>,
    config: DigestServiceConfig,
}

impl DigestService {
    pub fn new(
        windows: Arc<dyn DigestWindowStore>,
        locks: Arc<dyn LockService>,
        config: DigestServiceConfig,
    ) -> Self {
        Self {
            windows,
            locks,
            config,
        }
    }

    /// Handle an incoming digest job: open a window, merge into the open
    /// one, or report that the anchored window is due.
    ///
    /// Invariant: at most one open window per (workflow, digest key,
    /// subscriber); the lock guarantees it.
    pub async fn open_or_merge(
        &self,
        job: &Job,
        policy: &DigestPolicy,
    ) -> HeraldResult<DigestOutcome> {
        let key = window_key(job)?;
        let resource = key.lock_resource();
        let windows = self.windows.clone();
        let job = job.clone();
        let policy = policy.clone();

        with_lock(
            self.locks.as_ref(),
            &resource,
            self.config.lock_lease,
            self.config.lock_attempts,
            self.config.lock_retry_delay,
            move || async move {
                let now = Utc::now();
                match windows.find(&key).await? {
                    None => {
                        let flush_at = wait_until(&policy, now)?;
                        windows
                            .put(DigestWindow {
                                key: key.clone(),
                                environment_id: job.environment_id.clone(),
                                anchor_job_id: job.id,
                                opened_at: now,
                                last_event_at: now,
                                wait_until: flush_at,
                                payloads: vec![job.payload.clone()],
                            })
                            .await?;
                        info!(job_id = %job.id, wait_until = %flush_at, "digest window opened");
                        Ok(DigestOutcome::Opened {
                            wait_until: flush_at,
                        })
                    }
                    Some(window) if window.anchor_job_id == job.id => {
                        // The anchor came back around after its wait
                        if now >= window.wait_until {
                            Ok(DigestOutcome::FlushDue)
                        } else {
                            Ok(DigestOutcome::Waiting {
                                wait_until: window.wait_until,
                            })
                        }
                    }
                    Some(mut window) => {
                        window.payloads.push(job.payload.clone());
                        window.last_event_at = now;
                        // Look-back windows extend on every event; the
                        // original wait is preserved for Regular/Timed
                        if let DigestPolicy::LookBack { amount, unit } = &policy {
                            window.wait_until = now + unit.to_duration(*amount);
                        }
                        let wait = window.wait_until;
                        windows.put(window).await?;
                        debug!(job_id = %job.id, wait_until = %wait, "merged into digest window");
                        Ok(DigestOutcome::Merged)
                    }
                }
            },
        )
        .await
    }

    /// Close a due window and hand back its accumulated payloads.
    ///
    /// `None` means no window exists anymore: a concurrent worker already
    /// flushed it, and this call is a no-op.
    pub async fn flush(&self, key: &DigestWindowKey) -> HeraldResult<Option<DigestWindow>> {
        let resource = key.lock_resource();
        let windows = self.windows.clone();
        let key = key.clone();

        with_lock(
            self.locks.as_ref(),
            &resource,
            self.config.lock_lease,
            self.config.lock_attempts,
            self.config.lock_retry_delay,
            move || async move {
                match windows.find(&key).await? {
                    Some(window) => {
                        windows.delete(&key).await?;
                        info!(
                            anchor_job_id = %window.anchor_job_id,
                            events = window.payloads.len(),
                            "digest window flushed"
                        );
                        Ok(Some(window))
                    }
                    None => Ok(None),
                }
            },
        )
        .await
    }
}

fn window_key(job: &Job) -> HeraldResult<DigestWindowKey> {
    let digest_key = job.digest_key.clone().ok_or_else(|| {
        HeraldError::Configuration(format!("job {} has no digest key", job.id))
    })?;
    Ok(DigestWindowKey {
        workflow_id: job.workflow_id.clone(),
        digest_key,
        subscriber_id: job.subscriber_id.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::InMemoryLockService;
    use crate::storage::InMemoryDigestWindowStore;
    use crate::types::{
        DigestUnit, EnvironmentId, JobId, JobStatus, OrganizationId, Step, StepControls, StepId,
        SubscriberId, TransactionId, WorkflowId,
    };
    use serde_json::json;

    fn create_test_job(payload: serde_json::Value) -> Job {
        let policy = DigestPolicy::Regular {
            amount: 5,
            unit: DigestUnit::Minutes,
        };
        Job {
            id: JobId::new(),
            workflow_id: WorkflowId::new("w1"),
            step: Step {
                id: StepId::new("digest_step"),
                name: "Digest".to_string(),
                controls: StepControls::Digest {
                    policy,
                    digest_key: None,
                },
                filter: None,
                bridge_step_id: None,
                active: true,
            },
            step_index: 0,
            subscriber_id: SubscriberId::new("s1"),
            transaction_id: TransactionId::generate(),
            environment_id: EnvironmentId::new("env_1"),
            organization_id: OrganizationId::new("org_1"),
            status: JobStatus::Pending,
            payload,
            overrides: json!({}),
            digest_key: Some("s1".to_string()),
            result: None,
            wait_until: None,
            attempts: 0,
            error: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn service() -> DigestService {
        DigestService::new(
            Arc::new(InMemoryDigestWindowStore::new()),
            Arc::new(InMemoryLockService::new()),
            DigestServiceConfig::default(),
        )
    }

    #[test]
    fn test_regular_wait_until() {
        let anchor = Utc::now();
        let policy = DigestPolicy::Regular {
            amount: 5,
            unit: DigestUnit::Minutes,
        };
        assert_eq!(
            wait_until(&policy, anchor).unwrap(),
            anchor + chrono::Duration::minutes(5)
        );
    }

    #[test]
    fn test_timed_wait_until_uses_cron() {
        let anchor = Utc::now();
        let policy = DigestPolicy::Timed {
            cron: "0 * * * *".to_string(), // top of every hour, five-field form
        };
        let next = wait_until(&policy, anchor).unwrap();
        assert!(next > anchor);
        assert!(next - anchor <= chrono::Duration::hours(1));
        assert_eq!(next.timestamp() % 3600, 0);
    }

    #[test]
    fn test_invalid_cron_is_configuration_error() {
        let policy = DigestPolicy::Timed {
            cron: "not a cron".to_string(),
        };
        let result = wait_until(&policy, Utc::now());
        assert!(matches!(result, Err(HeraldError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_second_event_merges_into_open_window() {
        let service = service();
        let policy = DigestPolicy::Regular {
            amount: 5,
            unit: DigestUnit::Minutes,
        };

        let first = create_test_job(json!({"n": 1}));
        let outcome = service.open_or_merge(&first, &policy).await.unwrap();
        assert!(matches!(outcome, DigestOutcome::Opened { .. }));

        let second = create_test_job(json!({"n": 2}));
        let outcome = service.open_or_merge(&second, &policy).await.unwrap();
        assert_eq!(outcome, DigestOutcome::Merged);

        // Flush carries both payloads, in arrival order
        let key = window_key(&first).unwrap();
        let window = service.flush(&key).await.unwrap().unwrap();
        assert_eq!(window.anchor_job_id, first.id);
        assert_eq!(window.payloads, vec![json!({"n": 1}), json!({"n": 2})]);

        // A second flush attempt is a no-op
        assert!(service.flush(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_merge_preserves_regular_wait() {
        let windows = Arc::new(InMemoryDigestWindowStore::new());
        let service = DigestService::new(
            windows.clone(),
            Arc::new(InMemoryLockService::new()),
            DigestServiceConfig::default(),
        );
        let policy = DigestPolicy::Regular {
            amount: 5,
            unit: DigestUnit::Minutes,
        };

        let first = create_test_job(json!({"n": 1}));
        let opened_wait = match service.open_or_merge(&first, &policy).await.unwrap() {
            DigestOutcome::Opened { wait_until } => wait_until,
            other => panic!("expected Opened, got {:?}", other),
        };

        let second = create_test_job(json!({"n": 2}));
        service.open_or_merge(&second, &policy).await.unwrap();

        let window = windows.find(&window_key(&first).unwrap()).await.unwrap().unwrap();
        assert_eq!(window.wait_until, opened_wait);
    }

    #[tokio::test]
    async fn test_lookback_extends_on_merge() {
        let windows = Arc::new(InMemoryDigestWindowStore::new());
        let service = DigestService::new(
            windows.clone(),
            Arc::new(InMemoryLockService::new()),
            DigestServiceConfig::default(),
        );
        let policy = DigestPolicy::LookBack {
            amount: 10,
            unit: DigestUnit::Minutes,
        };

        let first = create_test_job(json!({"n": 1}));
        let opened_wait = match service.open_or_merge(&first, &policy).await.unwrap() {
            DigestOutcome::Opened { wait_until } => wait_until,
            other => panic!("expected Opened, got {:?}", other),
        };

        tokio::time::sleep(Duration::from_millis(20)).await;

        let second = create_test_job(json!({"n": 2}));
        service.open_or_merge(&second, &policy).await.unwrap();

        let window = windows.find(&window_key(&first).unwrap()).await.unwrap().unwrap();
        assert!(window.wait_until > opened_wait, "look-back must extend the window");
    }

    #[tokio::test]
    async fn test_anchor_recheck_before_due_is_waiting() {
        let service = service();
        let policy = DigestPolicy::Regular {
            amount: 5,
            unit: DigestUnit::Minutes,
        };

        let anchor = create_test_job(json!({"n": 1}));
        service.open_or_merge(&anchor, &policy).await.unwrap();

        let outcome = service.open_or_merge(&anchor, &policy).await.unwrap();
        assert!(matches!(outcome, DigestOutcome::Waiting { .. }));
    }

    #[tokio::test]
    async fn test_anchor_after_due_flushes() {
        let service = service();
        let policy = DigestPolicy::Regular {
            amount: 0,
            unit: DigestUnit::Seconds,
        };

        let anchor = create_test_job(json!({"n": 1}));
        service.open_or_merge(&anchor, &policy).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let outcome = service.open_or_merge(&anchor, &policy).await.unwrap();
        assert_eq!(outcome, DigestOutcome::FlushDue);
    }

    #[tokio::test]
    async fn test_flush_requires_lock() {
        let windows = Arc::new(InMemoryDigestWindowStore::new());
        let locks = Arc::new(InMemoryLockService::new());
        let service = DigestService::new(
            windows,
            locks.clone(),
            DigestServiceConfig {
                lock_attempts: 1,
                lock_retry_delay: Duration::from_millis(1),
                ..Default::default()
            },
        );
        let policy = DigestPolicy::Regular {
            amount: 5,
            unit: DigestUnit::Minutes,
        };

        let job = create_test_job(json!({}));
        service.open_or_merge(&job, &policy).await.unwrap();
        let key = window_key(&job).unwrap();

        // Another worker holds the window lock
        let held = locks
            .acquire(&key.lock_resource(), Duration::from_secs(5))
            .await
            .unwrap();

        let result = service.flush(&key).await;
        assert!(matches!(result, Err(HeraldError::LockBusy(_))));

        locks.release(&key.lock_resource(), &held).await;
        assert!(service.flush(&key).await.unwrap().is_some());
    }
}
