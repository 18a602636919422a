//! Job processing state machine.
//!
//! A job moves pending → running → {completed | failed | merged |
//! canceled}; failed jobs bounce back to pending up to the retry budget.
//! Every run is claimed through the lock service so at most one worker
//! processes a given job at a time.

use crate::config::WorkerConfig;
use crate::queue::JobQueue;
use chrono::Utc;
use herald_bridge::{BridgeClient, BridgeRequest};
use herald_core::cache::{Cache, CacheKey};
use herald_core::digest::{DigestOutcome, DigestService};
use herald_core::error::HeraldResult;
use herald_core::lock::{job_claim_resource, LockService, LockToken};
use herald_core::storage::{
    is_valid_transition, ExecutionDetailStore, JobStore, SubscriberStore, WorkflowStore,
};
use herald_core::types::{
    DetailSource, DetailStatus, DigestPolicy, DigestUnit, DigestWindowKey, ExecutionDetail, Job,
    JobId, JobStatus, StepControls, Subscriber, Workflow, WorkflowOrigin,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// A held job claim lock: the processor renews it around slow sections
/// and releases it when the run ends.
struct JobClaim {
    resource: String,
    token: LockToken,
}

/// Executes queued jobs against the stores, digest service and bridge.
pub struct JobProcessor {
    jobs: Arc<dyn JobStore>,
    workflows: Arc<dyn WorkflowStore>,
    subscribers: Arc<dyn SubscriberStore>,
    details: Arc<dyn ExecutionDetailStore>,
    digests: Arc<DigestService>,
    locks: Arc<dyn LockService>,
    queue: Arc<dyn JobQueue>,
    cache: Arc<dyn Cache>,
    bridge: Option<Arc<BridgeClient>>,
    config: WorkerConfig,
}

impl JobProcessor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        jobs: Arc<dyn JobStore>,
        workflows: Arc<dyn WorkflowStore>,
        subscribers: Arc<dyn SubscriberStore>,
        details: Arc<dyn ExecutionDetailStore>,
        digests: Arc<DigestService>,
        locks: Arc<dyn LockService>,
        queue: Arc<dyn JobQueue>,
        cache: Arc<dyn Cache>,
        bridge: Option<Arc<BridgeClient>>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            jobs,
            workflows,
            subscribers,
            details,
            digests,
            locks,
            queue,
            cache,
            bridge,
            config,
        }
    }

    /// Process one dequeued job end to end, holding its claim lock.
    pub async fn process(&self, job_id: JobId) -> HeraldResult<()> {
        let resource = job_claim_resource(job_id);
        let Some(token) = self.locks.acquire(&resource, self.config.lock_lease).await else {
            // Another worker holds the claim; hand the job back
            debug!(job_id = %job_id, "job claimed elsewhere, requeueing");
            return self.queue.nack(job_id, self.config.poll_interval).await;
        };
        let claim = JobClaim { resource, token };

        let result = self.run(job_id, &claim).await;

        if !self.locks.release(&claim.resource, &claim.token).await {
            warn!(job_id = %job_id, "job claim lease expired before release");
        }
        result
    }

    async fn run(&self, job_id: JobId, claim: &JobClaim) -> HeraldResult<()> {
        let Some(mut job) = self.jobs.find(job_id).await? else {
            warn!(job_id = %job_id, "dequeued job does not exist");
            return self.queue.ack(job_id).await;
        };

        if job.status.is_terminal() {
            return self.queue.ack(job_id).await;
        }

        // Dequeued before its wait elapsed; push it back out
        if let Some(wait) = job.wait_until {
            let now = Utc::now();
            if job.status == JobStatus::Pending && now < wait {
                let remaining = (wait - now).to_std().unwrap_or(Duration::ZERO);
                return self.queue.nack(job_id, remaining).await;
            }
        }

        if self.config.dedupe_transactions {
            let duplicate = self
                .jobs
                .find_completed_duplicate(
                    &job.environment_id,
                    &job.workflow_id,
                    &job.step.id,
                    &job.subscriber_id,
                    &job.transaction_id,
                    job.id,
                )
                .await?;
            if let Some(duplicate) = duplicate {
                self.transition(&mut job, JobStatus::Running).await?;
                self.record(
                    &job,
                    DetailStatus::Warning,
                    format!("duplicate of completed job {}, delivery skipped", duplicate.id),
                )
                .await?;
                return self.complete_and_chain(job, None).await;
            }
        }

        // Re-validate the world before doing any work; definitions can
        // change between trigger time and execution time
        let workflow = self
            .workflows
            .find(&job.environment_id, &job.workflow_id)
            .await?;
        let workflow = match workflow {
            Some(w) if w.active => w,
            Some(_) => return self.cancel(job, "workflow deactivated").await,
            None => return self.cancel(job, "workflow deleted").await,
        };
        let subscriber = self
            .subscribers
            .find(&job.environment_id, &job.subscriber_id)
            .await?;
        let subscriber = match subscriber {
            Some(s) if s.active => s,
            Some(_) => return self.cancel(job, "subscriber deactivated").await,
            None => return self.cancel(job, "subscriber deleted").await,
        };

        if !self.transition(&mut job, JobStatus::Running).await? {
            return self.queue.ack(job_id).await;
        }

        match job.step.controls.clone() {
            StepControls::Delay { amount, unit } => self.handle_delay(job, amount, unit).await,
            StepControls::Digest { policy, .. } => self.handle_digest(job, policy).await,
            StepControls::Custom { .. } => {
                self.handle_bridge_step(job, &workflow, subscriber, claim).await
            }
            controls => {
                if workflow.origin == WorkflowOrigin::External {
                    self.handle_bridge_step(job, &workflow, subscriber, claim).await
                } else {
                    // Provider dispatch is an external collaborator; the
                    // internal path records the handoff and moves on
                    let channel = controls
                        .channel()
                        .map(|c| c.to_string())
                        .unwrap_or_else(|| "unknown".to_string());
                    self.record(
                        &job,
                        DetailStatus::Success,
                        format!("dispatched to {} provider", channel),
                    )
                    .await?;
                    self.complete_and_chain(job, None).await
                }
            }
        }
    }

    async fn handle_delay(&self, mut job: Job, amount: u64, unit: DigestUnit) -> HeraldResult<()> {
        let now = Utc::now();
        match job.wait_until {
            None => {
                let wait = now + unit.to_duration(amount);
                job.wait_until = Some(wait);
                self.transition(&mut job, JobStatus::Pending).await?;
                self.record(
                    &job,
                    DetailStatus::Queued,
                    format!("delay scheduled until {}", wait),
                )
                .await?;
                let delay = (wait - now).to_std().unwrap_or(Duration::ZERO);
                self.queue.nack(job.id, delay).await
            }
            Some(wait) if now >= wait => {
                self.record(&job, DetailStatus::Success, "delay elapsed")
                    .await?;
                self.complete_and_chain(job, None).await
            }
            Some(wait) => {
                self.transition(&mut job, JobStatus::Pending).await?;
                let remaining = (wait - now).to_std().unwrap_or(Duration::ZERO);
                self.queue.nack(job.id, remaining).await
            }
        }
    }

    async fn handle_digest(&self, mut job: Job, policy: DigestPolicy) -> HeraldResult<()> {
        let outcome = match self.digests.open_or_merge(&job, &policy).await {
            Ok(outcome) => outcome,
            Err(e) => return self.fail(job, e.to_string(), e.is_retryable()).await,
        };

        match outcome {
            DigestOutcome::Opened { wait_until } => {
                job.wait_until = Some(wait_until);
                self.transition(&mut job, JobStatus::Pending).await?;
                self.record(
                    &job,
                    DetailStatus::Queued,
                    format!("digest window opened, flushing at {}", wait_until),
                )
                .await?;
                let delay = (wait_until - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                self.queue.nack(job.id, delay).await
            }
            DigestOutcome::Merged => {
                self.transition(&mut job, JobStatus::Merged).await?;
                self.record(
                    &job,
                    DetailStatus::Success,
                    "merged into open digest window",
                )
                .await?;
                // The anchor's chain will carry the flush; this chain ends
                self.cancel_downstream(&job).await?;
                self.queue.ack(job.id).await
            }
            DigestOutcome::Waiting { wait_until } => {
                job.wait_until = Some(wait_until);
                self.transition(&mut job, JobStatus::Pending).await?;
                let remaining = (wait_until - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                self.queue.nack(job.id, remaining).await
            }
            DigestOutcome::FlushDue => {
                let key = DigestWindowKey {
                    workflow_id: job.workflow_id.clone(),
                    digest_key: job.digest_key.clone().unwrap_or_default(),
                    subscriber_id: job.subscriber_id.clone(),
                };
                match self.digests.flush(&key).await {
                    Ok(Some(window)) => {
                        let events = window.payloads.len();
                        job.payload = serde_json::Value::Array(window.payloads);
                        self.record_raw(
                            &job,
                            DetailStatus::Success,
                            format!("digest flushed with {} events", events),
                            json!({ "events": events }),
                        )
                        .await?;
                        let digested = job.payload.clone();
                        self.complete_and_chain(job, Some(digested)).await
                    }
                    Ok(None) => {
                        // A concurrent worker beat this one to the flush
                        self.record(
                            &job,
                            DetailStatus::Warning,
                            "digest window already flushed",
                        )
                        .await?;
                        self.transition(&mut job, JobStatus::Completed).await?;
                        self.queue.ack(job.id).await
                    }
                    Err(e) => self.fail(job, e.to_string(), e.is_retryable()).await,
                }
            }
        }
    }

    async fn handle_bridge_step(
        &self,
        mut job: Job,
        workflow: &Workflow,
        subscriber: Subscriber,
        claim: &JobClaim,
    ) -> HeraldResult<()> {
        let Some(bridge) = self.bridge.clone() else {
            return self
                .fail(job, "no bridge endpoint configured".to_string(), false)
                .await;
        };

        // The round trip with retries can outlast the remaining claim
        // lease; push it out to cover the call
        if !self
            .locks
            .renew(&claim.resource, &claim.token, self.config.lock_lease)
            .await
        {
            warn!(job_id = %job.id, "job claim lease could not be renewed");
        }

        let request = BridgeRequest {
            controls: serde_json::to_value(&job.step.controls)?,
            payload: job.payload.clone(),
            state: self.chain_state(&job).await?,
            subscriber: Some(subscriber),
            workflow_id: workflow.id.to_string(),
            step_id: job
                .step
                .bridge_step_id
                .clone()
                .unwrap_or_else(|| job.step.id.to_string()),
        };

        match bridge.execute(&request).await {
            Ok(response) => {
                self.record_raw(
                    &job,
                    DetailStatus::Success,
                    "bridge step executed",
                    json!({
                        "outputs": response.outputs.clone(),
                        "duration_ms": response.metadata.duration_ms,
                    }),
                )
                .await?;
                job.result = Some(response.outputs);
                self.complete_and_chain(job, None).await
            }
            Err(e) => {
                let retryable = e.is_retryable();
                self.fail(job, format!("{}: {}", e.code(), e), retryable)
                    .await
            }
        }
    }

    /// Outputs of the already-completed earlier steps in this job's chain,
    /// keyed by step id.
    async fn chain_state(&self, job: &Job) -> HeraldResult<serde_json::Value> {
        let chain = self
            .jobs
            .list_by_transaction(&job.environment_id, &job.transaction_id)
            .await?;

        let mut state = serde_json::Map::new();
        for earlier in chain {
            if earlier.subscriber_id != job.subscriber_id || earlier.step_index >= job.step_index {
                continue;
            }
            if let Some(outputs) = earlier.result {
                state.insert(earlier.step.id.to_string(), outputs);
            }
        }
        Ok(serde_json::Value::Object(state))
    }

    /// Mark the job completed, refresh caches and enqueue the next step
    /// in the (transaction, subscriber) chain. A digest flush passes the
    /// accumulated payload array along to the downstream job.
    async fn complete_and_chain(
        &self,
        mut job: Job,
        propagate_payload: Option<serde_json::Value>,
    ) -> HeraldResult<()> {
        self.transition(&mut job, JobStatus::Completed).await?;
        info!(job_id = %job.id, step = %job.step.id, "job completed");

        // Derived feed/count queries for this subscriber are stale now
        self.cache
            .invalidate_by_pattern(&CacheKey::query_prefix(
                &job.environment_id,
                &job.subscriber_id,
            ))
            .await;

        self.queue.ack(job.id).await?;

        let next = self
            .jobs
            .find_next_in_chain(
                &job.environment_id,
                &job.transaction_id,
                &job.subscriber_id,
                job.step_index,
            )
            .await?;
        if let Some(mut next) = next {
            if let Some(payload) = propagate_payload {
                next.payload = payload;
                self.jobs.update(next.clone()).await?;
            }
            self.queue.enqueue(next.id, None).await?;
        }
        Ok(())
    }

    /// Record the failure and either schedule a retry or go terminal.
    async fn fail(&self, mut job: Job, message: String, retryable: bool) -> HeraldResult<()> {
        self.record(&job, DetailStatus::Failed, message.clone())
            .await?;
        job.error = Some(message.clone());

        if retryable && job.attempts < self.config.max_retries {
            let backoff = self.config.backoff_for_attempt(job.attempts);
            job.attempts += 1;
            self.transition(&mut job, JobStatus::Pending).await?;
            warn!(
                job_id = %job.id,
                attempt = job.attempts,
                backoff_ms = backoff.as_millis(),
                error = %message,
                "job failed, retrying"
            );
            self.queue.nack(job.id, backoff).await
        } else {
            self.transition(&mut job, JobStatus::Failed).await?;
            warn!(job_id = %job.id, error = %message, "job failed terminally");
            self.queue.ack(job.id).await
        }
    }

    async fn cancel(&self, mut job: Job, reason: &str) -> HeraldResult<()> {
        job.error = Some(reason.to_string());
        self.transition(&mut job, JobStatus::Canceled).await?;
        self.record(&job, DetailStatus::Warning, format!("canceled: {}", reason))
            .await?;
        info!(job_id = %job.id, reason = reason, "job canceled");
        self.queue.ack(job.id).await
    }

    /// Cancel the still-pending remainder of a chain whose delivery was
    /// absorbed by another chain's digest window.
    async fn cancel_downstream(&self, job: &Job) -> HeraldResult<()> {
        let mut index = job.step_index;
        while let Some(mut next) = self
            .jobs
            .find_next_in_chain(
                &job.environment_id,
                &job.transaction_id,
                &job.subscriber_id,
                index,
            )
            .await?
        {
            index = next.step_index;
            next.status = JobStatus::Canceled;
            self.jobs.update(next).await?;
        }
        Ok(())
    }

    /// Apply a status transition and persist it; `false` (without error)
    /// means the transition was not legal from the current status.
    async fn transition(&self, job: &mut Job, to: JobStatus) -> HeraldResult<bool> {
        if !is_valid_transition(job.status, to) {
            warn!(job_id = %job.id, from = ?job.status, to = ?to, "illegal status transition skipped");
            return Ok(false);
        }
        job.status = to;
        job.updated_at = Utc::now();
        self.jobs.update(job.clone()).await?;
        Ok(true)
    }

    async fn record(
        &self,
        job: &Job,
        status: DetailStatus,
        detail: impl Into<String>,
    ) -> HeraldResult<()> {
        self.details
            .append(ExecutionDetail::new(job, DetailSource::Internal, status, detail))
            .await
    }

    async fn record_raw(
        &self,
        job: &Job,
        status: DetailStatus,
        detail: impl Into<String>,
        raw: serde_json::Value,
    ) -> HeraldResult<()> {
        self.details
            .append(ExecutionDetail::new(job, DetailSource::Internal, status, detail).with_raw(raw))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::InMemoryQueue;
    use herald_bridge::{BridgeConfig, RetryConfig};
    use herald_core::cache::InMemoryCache;
    use herald_core::digest::DigestServiceConfig;
    use herald_core::lock::InMemoryLockService;
    use herald_core::storage::{
        InMemoryDigestWindowStore, InMemoryExecutionDetailStore, InMemoryJobStore,
        InMemorySubscriberStore, InMemoryWorkflowStore,
    };
    use herald_core::types::{
        EnvironmentId, OrganizationId, Step, StepId, SubscriberId, TransactionId, Workflow,
        WorkflowId,
    };
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use url::Url;
    use wiremock::matchers::{body_partial_json, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct Fixture {
        jobs: Arc<InMemoryJobStore>,
        workflows: Arc<InMemoryWorkflowStore>,
        subscribers: Arc<InMemorySubscriberStore>,
        details: Arc<InMemoryExecutionDetailStore>,
        queue: Arc<InMemoryQueue>,
        processor: JobProcessor,
    }

    fn create_fixture(bridge: Option<Arc<BridgeClient>>, config: WorkerConfig) -> Fixture {
        create_fixture_with_locks(bridge, config, Arc::new(InMemoryLockService::new()))
    }

    fn create_fixture_with_locks(
        bridge: Option<Arc<BridgeClient>>,
        config: WorkerConfig,
        locks: Arc<dyn LockService>,
    ) -> Fixture {
        let jobs = Arc::new(InMemoryJobStore::new());
        let workflows = Arc::new(InMemoryWorkflowStore::new());
        let subscribers = Arc::new(InMemorySubscriberStore::new());
        let details = Arc::new(InMemoryExecutionDetailStore::new());
        let queue = Arc::new(InMemoryQueue::new());
        let digests = Arc::new(DigestService::new(
            Arc::new(InMemoryDigestWindowStore::new()),
            locks.clone(),
            DigestServiceConfig::default(),
        ));

        let processor = JobProcessor::new(
            jobs.clone(),
            workflows.clone(),
            subscribers.clone(),
            details.clone(),
            digests,
            locks,
            queue.clone(),
            Arc::new(InMemoryCache::new()),
            bridge,
            config,
        );

        Fixture {
            jobs,
            workflows,
            subscribers,
            details,
            queue,
            processor,
        }
    }

    fn env() -> EnvironmentId {
        EnvironmentId::new("env-1")
    }

    fn org() -> OrganizationId {
        OrganizationId::new("org-1")
    }

    fn create_test_step(id: &str, controls: StepControls) -> Step {
        Step {
            id: StepId::new(id),
            name: id.to_string(),
            controls,
            filter: None,
            bridge_step_id: None,
            active: true,
        }
    }

    fn email_step(id: &str) -> Step {
        create_test_step(
            id,
            StepControls::Email {
                subject: "s".to_string(),
                body: "b".to_string(),
            },
        )
    }

    fn create_test_workflow(steps: Vec<Step>, origin: WorkflowOrigin) -> Workflow {
        let now = Utc::now();
        Workflow {
            id: WorkflowId::new("wf-1"),
            name: "Onboarding".to_string(),
            trigger_identifier: "onboarding".to_string(),
            steps,
            origin,
            active: true,
            tags: vec![],
            environment_id: env(),
            organization_id: org(),
            created_at: now,
            updated_at: now,
        }
    }

    fn create_test_subscriber(id: &str) -> Subscriber {
        Subscriber {
            id: SubscriberId::new(id),
            email: Some(format!("{}@example.com", id)),
            phone: None,
            first_name: None,
            last_name: None,
            active: true,
            environment_id: env(),
            organization_id: org(),
        }
    }

    fn create_test_job(step: Step, step_index: usize, subscriber: &str, txn: &str) -> Job {
        let now = Utc::now();
        Job {
            id: JobId::new(),
            workflow_id: WorkflowId::new("wf-1"),
            step,
            step_index,
            subscriber_id: SubscriberId::new(subscriber),
            transaction_id: TransactionId::new(txn),
            environment_id: env(),
            organization_id: org(),
            status: JobStatus::Pending,
            payload: json!({"n": 1}),
            overrides: json!({}),
            digest_key: None,
            result: None,
            wait_until: None,
            attempts: 0,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    async fn seed(fixture: &Fixture, workflow: Workflow, subscriber: &str) {
        fixture.workflows.upsert(workflow).await.unwrap();
        fixture
            .subscribers
            .upsert(create_test_subscriber(subscriber))
            .await
            .unwrap();
    }

    fn bridge_for(uri: &str, retries: u32) -> Arc<BridgeClient> {
        let config = BridgeConfig::new(Url::parse(uri).unwrap())
            .with_retry_config(RetryConfig {
                max_retries: retries,
                initial_backoff: Duration::from_millis(1),
                ..Default::default()
            });
        Arc::new(BridgeClient::new(config).unwrap())
    }

    fn execute_body() -> serde_json::Value {
        json!({
            "outputs": {"subject": "hi"},
            "providers": {},
            "metadata": {"status": "success", "error": false, "duration_ms": 3}
        })
    }

    #[tokio::test]
    async fn test_internal_channel_step_completes_and_chains() {
        let fixture = create_fixture(None, WorkerConfig::default());
        seed(
            &fixture,
            create_test_workflow(vec![email_step("e1"), email_step("e2")], WorkflowOrigin::Internal),
            "sub-1",
        )
        .await;

        let first = create_test_job(email_step("e1"), 0, "sub-1", "txn-1");
        let second = create_test_job(email_step("e2"), 1, "sub-1", "txn-1");
        let (first_id, second_id) = (first.id, second.id);
        fixture.jobs.insert(first).await.unwrap();
        fixture.jobs.insert(second).await.unwrap();

        fixture.processor.process(first_id).await.unwrap();

        let done = fixture.jobs.find(first_id).await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Completed);

        // The chain continues: the next step is now on the queue
        assert_eq!(fixture.queue.dequeue().await.unwrap(), Some(second_id));

        fixture.processor.process(second_id).await.unwrap();
        let done = fixture.jobs.find(second_id).await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        // End of chain: queue drained
        fixture.queue.ack(second_id).await.unwrap();
        assert_eq!(fixture.queue.dequeue().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_inactive_workflow_cancels_job() {
        let fixture = create_fixture(None, WorkerConfig::default());
        let mut workflow = create_test_workflow(vec![email_step("e1")], WorkflowOrigin::Internal);
        workflow.active = false;
        seed(&fixture, workflow, "sub-1").await;

        let job = create_test_job(email_step("e1"), 0, "sub-1", "txn-1");
        let job_id = job.id;
        fixture.jobs.insert(job).await.unwrap();

        fixture.processor.process(job_id).await.unwrap();

        let canceled = fixture.jobs.find(job_id).await.unwrap().unwrap();
        assert_eq!(canceled.status, JobStatus::Canceled);
        assert_eq!(canceled.error.as_deref(), Some("workflow deactivated"));
    }

    #[tokio::test]
    async fn test_missing_subscriber_cancels_job() {
        let fixture = create_fixture(None, WorkerConfig::default());
        fixture
            .workflows
            .upsert(create_test_workflow(
                vec![email_step("e1")],
                WorkflowOrigin::Internal,
            ))
            .await
            .unwrap();

        let job = create_test_job(email_step("e1"), 0, "ghost", "txn-1");
        let job_id = job.id;
        fixture.jobs.insert(job).await.unwrap();

        fixture.processor.process(job_id).await.unwrap();

        let canceled = fixture.jobs.find(job_id).await.unwrap().unwrap();
        assert_eq!(canceled.status, JobStatus::Canceled);
    }

    #[tokio::test]
    async fn test_delay_step_waits_then_completes() {
        let fixture = create_fixture(None, WorkerConfig::default());
        let delay = create_test_step(
            "wait",
            StepControls::Delay {
                amount: 0,
                unit: DigestUnit::Seconds,
            },
        );
        seed(
            &fixture,
            create_test_workflow(vec![delay.clone()], WorkflowOrigin::Internal),
            "sub-1",
        )
        .await;

        let job = create_test_job(delay, 0, "sub-1", "txn-1");
        let job_id = job.id;
        fixture.jobs.insert(job).await.unwrap();

        // First pass schedules the wait and re-enqueues
        fixture.processor.process(job_id).await.unwrap();
        let waiting = fixture.jobs.find(job_id).await.unwrap().unwrap();
        assert_eq!(waiting.status, JobStatus::Pending);
        assert!(waiting.wait_until.is_some());

        // Zero-length delay: immediately due on the second pass
        assert_eq!(fixture.queue.dequeue().await.unwrap(), Some(job_id));
        fixture.processor.process(job_id).await.unwrap();
        let done = fixture.jobs.find(job_id).await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_digest_merge_flush_single_downstream() {
        let fixture = create_fixture(None, WorkerConfig::default());
        let digest = create_test_step(
            "digest",
            StepControls::Digest {
                policy: DigestPolicy::Regular {
                    amount: 0,
                    unit: DigestUnit::Seconds,
                },
                digest_key: None,
            },
        );
        seed(
            &fixture,
            create_test_workflow(
                vec![digest.clone(), email_step("notify")],
                WorkflowOrigin::Internal,
            ),
            "sub-1",
        )
        .await;

        // Two triggers for the same subscriber and digest key
        let mut anchor = create_test_job(digest.clone(), 0, "sub-1", "txn-1");
        anchor.digest_key = Some("sub-1".to_string());
        anchor.payload = json!({"n": 1});
        let anchor_email = create_test_job(email_step("notify"), 1, "sub-1", "txn-1");
        let mut merged = create_test_job(digest, 0, "sub-1", "txn-2");
        merged.digest_key = Some("sub-1".to_string());
        merged.payload = json!({"n": 2});
        let merged_email = create_test_job(email_step("notify"), 1, "sub-1", "txn-2");

        let (anchor_id, anchor_email_id) = (anchor.id, anchor_email.id);
        let (merged_id, merged_email_id) = (merged.id, merged_email.id);
        for job in [anchor, anchor_email, merged, merged_email] {
            fixture.jobs.insert(job).await.unwrap();
        }

        // First event opens the window
        fixture.processor.process(anchor_id).await.unwrap();
        let opened = fixture.jobs.find(anchor_id).await.unwrap().unwrap();
        assert_eq!(opened.status, JobStatus::Pending);

        // Second event merges; its chain is suppressed
        fixture.processor.process(merged_id).await.unwrap();
        let absorbed = fixture.jobs.find(merged_id).await.unwrap().unwrap();
        assert_eq!(absorbed.status, JobStatus::Merged);
        let suppressed = fixture.jobs.find(merged_email_id).await.unwrap().unwrap();
        assert_eq!(suppressed.status, JobStatus::Canceled);

        // Anchor comes back due; flush produces one downstream job
        // carrying both payloads
        fixture.queue.dequeue().await.unwrap();
        fixture.processor.process(anchor_id).await.unwrap();
        let flushed = fixture.jobs.find(anchor_id).await.unwrap().unwrap();
        assert_eq!(flushed.status, JobStatus::Completed);
        assert_eq!(flushed.payload, json!([{"n": 1}, {"n": 2}]));

        assert_eq!(fixture.queue.dequeue().await.unwrap(), Some(anchor_email_id));
        let downstream = fixture.jobs.find(anchor_email_id).await.unwrap().unwrap();
        assert_eq!(downstream.payload, json!([{"n": 1}, {"n": 2}]));
    }

    #[tokio::test]
    async fn test_bridge_step_success_records_detail() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(execute_body()))
            .mount(&server)
            .await;

        let fixture = create_fixture(
            Some(bridge_for(&server.uri(), 0)),
            WorkerConfig::default(),
        );
        seed(
            &fixture,
            create_test_workflow(vec![email_step("e1")], WorkflowOrigin::External),
            "sub-1",
        )
        .await;

        let job = create_test_job(email_step("e1"), 0, "sub-1", "txn-1");
        let job_id = job.id;
        fixture.jobs.insert(job).await.unwrap();

        fixture.processor.process(job_id).await.unwrap();

        let done = fixture.jobs.find(job_id).await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Completed);

        let details = fixture.details.list_for_job(job_id).await.unwrap();
        assert_eq!(details.len(), 1);
        assert_eq!(details[0].status, DetailStatus::Success);
        assert!(details[0].raw.is_some());
    }

    #[tokio::test]
    async fn test_bridge_step_receives_prior_step_outputs_as_state() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"step_id": "e1"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "outputs": {"subject": "from-step-1"},
                "providers": {},
                "metadata": {"status": "success", "error": false, "duration_ms": 3}
            })))
            .expect(1)
            .mount(&server)
            .await;
        // Matches only when the first step's outputs arrive as state
        Mock::given(method("POST"))
            .and(body_partial_json(json!({
                "step_id": "e2",
                "state": {"e1": {"subject": "from-step-1"}}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(execute_body()))
            .expect(1)
            .mount(&server)
            .await;

        let fixture = create_fixture(
            Some(bridge_for(&server.uri(), 0)),
            WorkerConfig::default(),
        );
        seed(
            &fixture,
            create_test_workflow(
                vec![email_step("e1"), email_step("e2")],
                WorkflowOrigin::External,
            ),
            "sub-1",
        )
        .await;

        let first = create_test_job(email_step("e1"), 0, "sub-1", "txn-1");
        let second = create_test_job(email_step("e2"), 1, "sub-1", "txn-1");
        let (first_id, second_id) = (first.id, second.id);
        fixture.jobs.insert(first).await.unwrap();
        fixture.jobs.insert(second).await.unwrap();

        fixture.processor.process(first_id).await.unwrap();
        let done = fixture.jobs.find(first_id).await.unwrap().unwrap();
        assert_eq!(done.result, Some(json!({"subject": "from-step-1"})));

        assert_eq!(fixture.queue.dequeue().await.unwrap(), Some(second_id));
        fixture.processor.process(second_id).await.unwrap();
        let done = fixture.jobs.find(second_id).await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Completed);
    }

    struct RenewCountingLocks {
        inner: InMemoryLockService,
        renewals: AtomicU32,
    }

    impl RenewCountingLocks {
        fn new() -> Self {
            Self {
                inner: InMemoryLockService::new(),
                renewals: AtomicU32::new(0),
            }
        }
    }

    #[async_trait::async_trait]
    impl LockService for RenewCountingLocks {
        async fn acquire(&self, resource: &str, lease: Duration) -> Option<LockToken> {
            self.inner.acquire(resource, lease).await
        }

        async fn renew(&self, resource: &str, token: &LockToken, lease: Duration) -> bool {
            self.renewals.fetch_add(1, Ordering::SeqCst);
            self.inner.renew(resource, token, lease).await
        }

        async fn release(&self, resource: &str, token: &LockToken) -> bool {
            self.inner.release(resource, token).await
        }
    }

    #[tokio::test]
    async fn test_bridge_dispatch_renews_job_claim() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(execute_body()))
            .mount(&server)
            .await;

        let locks = Arc::new(RenewCountingLocks::new());
        let fixture = create_fixture_with_locks(
            Some(bridge_for(&server.uri(), 0)),
            WorkerConfig::default(),
            locks.clone(),
        );
        seed(
            &fixture,
            create_test_workflow(vec![email_step("e1")], WorkflowOrigin::External),
            "sub-1",
        )
        .await;

        let job = create_test_job(email_step("e1"), 0, "sub-1", "txn-1");
        let job_id = job.id;
        fixture.jobs.insert(job).await.unwrap();

        fixture.processor.process(job_id).await.unwrap();

        let done = fixture.jobs.find(job_id).await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        // The claim lease was pushed out before the bridge call
        assert_eq!(locks.renewals.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_transient_bridge_failure_retries_then_goes_terminal() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let config = WorkerConfig {
            max_retries: 1,
            initial_backoff: Duration::from_millis(1),
            ..Default::default()
        };
        let fixture = create_fixture(Some(bridge_for(&server.uri(), 0)), config);
        seed(
            &fixture,
            create_test_workflow(vec![email_step("e1")], WorkflowOrigin::External),
            "sub-1",
        )
        .await;

        let job = create_test_job(email_step("e1"), 0, "sub-1", "txn-1");
        let job_id = job.id;
        fixture.jobs.insert(job).await.unwrap();

        // First failure schedules a retry
        fixture.processor.process(job_id).await.unwrap();
        let retrying = fixture.jobs.find(job_id).await.unwrap().unwrap();
        assert_eq!(retrying.status, JobStatus::Pending);
        assert_eq!(retrying.attempts, 1);

        // Budget exhausted on the second failure
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(fixture.queue.dequeue().await.unwrap(), Some(job_id));
        fixture.processor.process(job_id).await.unwrap();
        let failed = fixture.jobs.find(job_id).await.unwrap().unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert!(failed.error.as_deref().unwrap().contains("endpoint-unavailable"));

        let details = fixture.details.list_for_job(job_id).await.unwrap();
        assert_eq!(details.len(), 2);
        assert!(details[1].is_retry);
    }

    #[tokio::test]
    async fn test_fatal_bridge_failure_does_not_retry() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(405))
            .mount(&server)
            .await;

        let fixture = create_fixture(
            Some(bridge_for(&server.uri(), 0)),
            WorkerConfig::default(),
        );
        seed(
            &fixture,
            create_test_workflow(vec![email_step("e1")], WorkflowOrigin::External),
            "sub-1",
        )
        .await;

        let job = create_test_job(email_step("e1"), 0, "sub-1", "txn-1");
        let job_id = job.id;
        fixture.jobs.insert(job).await.unwrap();

        fixture.processor.process(job_id).await.unwrap();
        let failed = fixture.jobs.find(job_id).await.unwrap().unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.attempts, 0);
    }

    #[tokio::test]
    async fn test_custom_step_without_bridge_fails_fatally() {
        let fixture = create_fixture(None, WorkerConfig::default());
        let custom = create_test_step(
            "hook",
            StepControls::Custom {
                inputs: json!({}),
            },
        );
        seed(
            &fixture,
            create_test_workflow(vec![custom.clone()], WorkflowOrigin::Internal),
            "sub-1",
        )
        .await;

        let job = create_test_job(custom, 0, "sub-1", "txn-1");
        let job_id = job.id;
        fixture.jobs.insert(job).await.unwrap();

        fixture.processor.process(job_id).await.unwrap();
        let failed = fixture.jobs.find(job_id).await.unwrap().unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert!(failed.error.as_deref().unwrap().contains("bridge"));
    }

    #[tokio::test]
    async fn test_duplicate_transaction_is_skipped() {
        let fixture = create_fixture(None, WorkerConfig::default());
        seed(
            &fixture,
            create_test_workflow(vec![email_step("e1")], WorkflowOrigin::Internal),
            "sub-1",
        )
        .await;

        let mut completed = create_test_job(email_step("e1"), 0, "sub-1", "txn-1");
        completed.status = JobStatus::Completed;
        fixture.jobs.insert(completed).await.unwrap();

        let replay = create_test_job(email_step("e1"), 0, "sub-1", "txn-1");
        let replay_id = replay.id;
        fixture.jobs.insert(replay).await.unwrap();

        fixture.processor.process(replay_id).await.unwrap();

        let skipped = fixture.jobs.find(replay_id).await.unwrap().unwrap();
        assert_eq!(skipped.status, JobStatus::Completed);

        let details = fixture.details.list_for_job(replay_id).await.unwrap();
        assert_eq!(details[0].status, DetailStatus::Warning);
        assert!(details[0].detail.contains("duplicate"));
    }

    #[tokio::test]
    async fn test_terminal_job_is_acked_untouched() {
        let fixture = create_fixture(None, WorkerConfig::default());
        let mut job = create_test_job(email_step("e1"), 0, "sub-1", "txn-1");
        job.status = JobStatus::Canceled;
        let job_id = job.id;
        fixture.jobs.insert(job).await.unwrap();

        fixture.processor.process(job_id).await.unwrap();
        let unchanged = fixture.jobs.find(job_id).await.unwrap().unwrap();
        assert_eq!(unchanged.status, JobStatus::Canceled);
        assert!(fixture.details.list_for_job(job_id).await.unwrap().is_empty());
    }
}
