//! Trigger ingestion: validation, recipient expansion and job creation.
//!
//! One trigger fans out to one job per (recipient, step). Jobs for one
//! recipient form a chain ordered by step index; only the chain head is
//! enqueued here, the processor enqueues the rest as steps complete.

use crate::queue::JobQueue;
use chrono::Utc;
use herald_core::cache::{cached_query, Cache, CacheKey};
use herald_core::error::{HeraldError, HeraldResult, Violation};
use herald_core::preferences::PreferenceResolver;
use herald_core::storage::{
    JobStore, OrganizationStore, SubscriberStore, TopicStore, WorkflowStore,
};
use herald_core::tier;
use herald_core::types::{
    EnvironmentId, Job, JobId, JobStatus, Recipient, Step, StepControls, Subscriber,
    SubscriberId, TransactionId, TriggerEvent, Workflow, WorkflowId,
};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// How long cached workflow definitions and resolved preference sets stay
/// fresh between invalidations.
const ENTITY_CACHE_TTL: Duration = Duration::from_secs(60);

/// Synchronous acknowledgment of an accepted trigger.
#[derive(Debug, Clone, Serialize)]
pub struct TriggerResult {
    pub transaction_id: TransactionId,
    /// Jobs created, in (recipient, step) order.
    pub job_ids: Vec<JobId>,
    /// Per-recipient failures; one recipient failing never blocks siblings.
    pub errors: Vec<String>,
}

/// Validate a trigger request, reporting every violation at once.
pub fn validate_trigger(event: &TriggerEvent) -> Vec<Violation> {
    let mut violations = Vec::new();

    if event.workflow.trim().is_empty() {
        violations.push(Violation::new(
            "workflow",
            "required",
            "workflow trigger identifier must not be empty",
        ));
    }
    if event.recipients.is_empty() {
        violations.push(Violation::new(
            "recipients",
            "required",
            "at least one recipient is required",
        ));
    }
    if !event.payload.is_object() && !event.payload.is_null() {
        violations.push(Violation::new(
            "payload",
            "invalid-type",
            "payload must be a JSON object",
        ));
    }
    for (index, recipient) in event.recipients.iter().enumerate() {
        let empty = match recipient {
            Recipient::Subscriber { subscriber_id } => subscriber_id.0.trim().is_empty(),
            Recipient::Inline { subscriber } => subscriber.id.0.trim().is_empty(),
            Recipient::Topic { topic_id } => topic_id.0.trim().is_empty(),
        };
        if empty {
            violations.push(Violation::new(
                format!("recipients[{}]", index),
                "required",
                "recipient identifier must not be empty",
            ));
        }
    }

    violations
}

/// Turns validated triggers into per-recipient job chains.
pub struct JobFactory {
    workflows: Arc<dyn WorkflowStore>,
    subscribers: Arc<dyn SubscriberStore>,
    topics: Arc<dyn TopicStore>,
    organizations: Arc<dyn OrganizationStore>,
    jobs: Arc<dyn JobStore>,
    resolver: Arc<PreferenceResolver>,
    cache: Arc<dyn Cache>,
    queue: Arc<dyn JobQueue>,
}

impl JobFactory {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        workflows: Arc<dyn WorkflowStore>,
        subscribers: Arc<dyn SubscriberStore>,
        topics: Arc<dyn TopicStore>,
        organizations: Arc<dyn OrganizationStore>,
        jobs: Arc<dyn JobStore>,
        resolver: Arc<PreferenceResolver>,
        cache: Arc<dyn Cache>,
        queue: Arc<dyn JobQueue>,
    ) -> Self {
        Self {
            workflows,
            subscribers,
            topics,
            organizations,
            jobs,
            resolver,
            cache,
            queue,
        }
    }

    /// Ingest a trigger: validate, expand recipients and create jobs.
    ///
    /// All-or-nothing on validation failure; nothing is persisted until
    /// the request as a whole is acceptable.
    pub async fn trigger(&self, event: TriggerEvent) -> HeraldResult<TriggerResult> {
        let violations = validate_trigger(&event);
        if !violations.is_empty() {
            return Err(HeraldError::Validation(violations));
        }

        let workflow: Workflow = cached_query(
            self.cache.as_ref(),
            &CacheKey::workflow(&event.environment_id, &event.workflow),
            ENTITY_CACHE_TTL,
            || async {
                self.workflows
                    .find_by_trigger(&event.environment_id, &event.workflow)
                    .await?
                    .ok_or_else(|| HeraldError::not_found("workflow", &event.workflow))
                    .map_err(Into::into)
            },
        )
        .await
        .map_err(HeraldError::from_anyhow)?;
        if !workflow.active {
            return Err(HeraldError::Validation(vec![Violation::new(
                "workflow",
                "workflow-inactive",
                format!("workflow '{}' is not active", event.workflow),
            )]));
        }

        let organization = self
            .organizations
            .find(&event.organization_id)
            .await?
            .ok_or_else(|| HeraldError::not_found("organization", &event.organization_id.0))?;
        let tier_violations = tier::validate_steps(
            organization.tier,
            workflow.steps.iter().filter(|s| s.active).map(|s| &s.controls),
        );
        if !tier_violations.is_empty() {
            return Err(HeraldError::Validation(tier_violations));
        }

        let transaction_id = event
            .transaction_id
            .clone()
            .unwrap_or_else(TransactionId::generate);

        let mut errors = Vec::new();
        let recipients = self.expand_recipients(&event, &mut errors).await?;

        let mut job_ids = Vec::new();
        for subscriber_id in recipients {
            match self
                .create_chain(&workflow, &subscriber_id, &transaction_id, &event)
                .await
            {
                Ok(created) => job_ids.extend(created),
                Err(e) => {
                    warn!(subscriber_id = %subscriber_id, error = %e, "job creation failed for recipient");
                    errors.push(format!("subscriber '{}': {}", subscriber_id, e));
                }
            }
        }

        info!(
            transaction_id = %transaction_id,
            workflow = %workflow.id,
            jobs = job_ids.len(),
            errors = errors.len(),
            "trigger ingested"
        );

        Ok(TriggerResult {
            transaction_id,
            job_ids,
            errors,
        })
    }

    /// Deactivate a workflow and cancel every job of it that has not yet
    /// reached a terminal state. Returns the number of canceled jobs.
    pub async fn deactivate_workflow(
        &self,
        env: &EnvironmentId,
        workflow_id: &WorkflowId,
    ) -> HeraldResult<u64> {
        let mut workflow = self
            .workflows
            .find(env, workflow_id)
            .await?
            .ok_or_else(|| HeraldError::not_found("workflow", workflow_id))?;
        workflow.active = false;
        let trigger_identifier = workflow.trigger_identifier.clone();
        self.workflows.upsert(workflow).await?;
        // The cached definition still says active until dropped
        self.cache
            .invalidate_by_key(&CacheKey::workflow(env, &trigger_identifier))
            .await;

        let canceled = self
            .jobs
            .cancel_pending_for_workflow(env, workflow_id)
            .await?;
        info!(workflow = %workflow_id, canceled = canceled, "workflow deactivated");
        Ok(canceled)
    }

    /// Expand recipients to a deduplicated subscriber list, preserving
    /// request order. Failures are recorded and skipped.
    async fn expand_recipients(
        &self,
        event: &TriggerEvent,
        errors: &mut Vec<String>,
    ) -> HeraldResult<Vec<SubscriberId>> {
        let env = &event.environment_id;
        let mut seen = HashSet::new();
        let mut expanded = Vec::new();
        let mut push = |id: SubscriberId, expanded: &mut Vec<SubscriberId>| {
            if seen.insert(id.clone()) {
                expanded.push(id);
            }
        };

        for recipient in &event.recipients {
            match recipient {
                Recipient::Subscriber { subscriber_id } => {
                    match self.subscribers.find(env, subscriber_id).await? {
                        Some(_) => push(subscriber_id.clone(), &mut expanded),
                        None => {
                            errors.push(format!("subscriber '{}' not found", subscriber_id));
                        }
                    }
                }
                Recipient::Inline { subscriber } => {
                    self.upsert_inline(env, subscriber).await?;
                    push(subscriber.id.clone(), &mut expanded);
                }
                Recipient::Topic { topic_id } => {
                    match self.topics.subscribers_of(env, topic_id).await? {
                        Some(members) => {
                            for member in members {
                                if self.subscribers.find(env, &member).await?.is_some() {
                                    push(member, &mut expanded);
                                } else {
                                    errors.push(format!(
                                        "topic '{}' member '{}' not found",
                                        topic_id.0, member
                                    ));
                                }
                            }
                        }
                        None => errors.push(format!("topic '{}' not found", topic_id.0)),
                    }
                }
            }
        }

        Ok(expanded)
    }

    async fn upsert_inline(&self, env: &EnvironmentId, subscriber: &Subscriber) -> HeraldResult<()> {
        self.subscribers.upsert(subscriber.clone()).await?;
        // Entity and derived-query caches are stale after the upsert
        self.cache
            .invalidate_by_key(&CacheKey::subscriber(env, &subscriber.id))
            .await;
        self.cache
            .invalidate_by_pattern(&CacheKey::query_prefix(env, &subscriber.id))
            .await;
        Ok(())
    }

    /// Create the job chain for one subscriber and enqueue its head.
    async fn create_chain(
        &self,
        workflow: &Workflow,
        subscriber_id: &SubscriberId,
        transaction_id: &TransactionId,
        event: &TriggerEvent,
    ) -> HeraldResult<Vec<JobId>> {
        let resolved = cached_query(
            self.cache.as_ref(),
            &CacheKey::preferences(&event.environment_id, subscriber_id, &workflow.id),
            ENTITY_CACHE_TTL,
            || async {
                Ok(self
                    .resolver
                    .resolve(
                        &event.environment_id,
                        &event.organization_id,
                        subscriber_id,
                        &workflow.id,
                    )
                    .await?)
            },
        )
        .await
        .map_err(HeraldError::from_anyhow)?;

        let mut created = Vec::new();
        for (index, step) in workflow.steps.iter().enumerate() {
            if !step.active {
                continue;
            }
            // Preference filtering applies per channel step; action steps
            // (delay, digest, custom) always run
            if let Some(channel) = step.controls.channel() {
                if !resolved.channel_enabled(channel) {
                    continue;
                }
            }
            if let Some(filter) = &step.filter {
                if !filter.matches(&event.payload) {
                    continue;
                }
            }

            let job = build_job(workflow, step, index, subscriber_id, transaction_id, event);
            let job_id = job.id;
            self.jobs.insert(job).await?;
            created.push(job_id);
        }

        if let Some(head) = created.first() {
            self.queue.enqueue(*head, None).await?;
        }
        Ok(created)
    }
}

fn build_job(
    workflow: &Workflow,
    step: &Step,
    step_index: usize,
    subscriber_id: &SubscriberId,
    transaction_id: &TransactionId,
    event: &TriggerEvent,
) -> Job {
    let now = Utc::now();
    Job {
        id: JobId::new(),
        workflow_id: workflow.id.clone(),
        step: step.clone(),
        step_index,
        subscriber_id: subscriber_id.clone(),
        transaction_id: transaction_id.clone(),
        environment_id: event.environment_id.clone(),
        organization_id: event.organization_id.clone(),
        status: JobStatus::Pending,
        payload: event.payload.clone(),
        overrides: event.overrides.clone(),
        digest_key: resolve_digest_key(step, subscriber_id, &event.payload),
        result: None,
        wait_until: None,
        attempts: 0,
        error: None,
        created_at: now,
        updated_at: now,
    }
}

/// The digest accumulation key: the configured payload field when present,
/// otherwise the subscriber. Non-digest steps carry no key.
fn resolve_digest_key(
    step: &Step,
    subscriber_id: &SubscriberId,
    payload: &serde_json::Value,
) -> Option<String> {
    let StepControls::Digest { digest_key, .. } = &step.controls else {
        return None;
    };
    let resolved = digest_key
        .as_ref()
        .and_then(|field| payload.get(field))
        .map(|value| match value {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .unwrap_or_else(|| subscriber_id.to_string());
    Some(resolved)
}
