//! Persistence contracts consumed by the orchestration core.
//!
//! The storage engine itself is an external collaborator; the core only
//! depends on these traits. Every query is scoped by environment so
//! tenants stay isolated. In-memory implementations back tests and
//! embedded use.

pub mod in_memory;

pub use in_memory::{
    InMemoryDigestWindowStore, InMemoryExecutionDetailStore, InMemoryJobStore,
    InMemoryOrganizationStore, InMemoryPreferenceRepository, InMemorySubscriberStore,
    InMemoryTopicStore, InMemoryWorkflowStore,
};

use crate::error::HeraldResult;
use crate::types::{
    DigestWindow, DigestWindowKey, EnvironmentId, ExecutionDetail, Job, JobId, JobStatus,
    Organization, OrganizationId, Preference, StepId, Subscriber, SubscriberId, TopicId,
    TransactionId, Workflow, WorkflowId,
};
use async_trait::async_trait;

/// Access to workflow definitions.
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    async fn find(&self, env: &EnvironmentId, id: &WorkflowId) -> HeraldResult<Option<Workflow>>;
    async fn find_by_trigger(
        &self,
        env: &EnvironmentId,
        trigger_identifier: &str,
    ) -> HeraldResult<Option<Workflow>>;
    /// List workflows, optionally narrowed to those carrying any of the tags.
    async fn list(&self, env: &EnvironmentId, tags: Option<&[String]>)
        -> HeraldResult<Vec<Workflow>>;
    async fn upsert(&self, workflow: Workflow) -> HeraldResult<()>;
    async fn delete(&self, env: &EnvironmentId, id: &WorkflowId) -> HeraldResult<()>;
}

/// Access to job records.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn find(&self, id: JobId) -> HeraldResult<Option<Job>>;
    async fn insert(&self, job: Job) -> HeraldResult<()>;
    async fn update(&self, job: Job) -> HeraldResult<()>;
    async fn list_by_transaction(
        &self,
        env: &EnvironmentId,
        transaction_id: &TransactionId,
    ) -> HeraldResult<Vec<Job>>;
    /// Next pending job after the given step index within the same
    /// (transaction, subscriber) chain.
    async fn find_next_in_chain(
        &self,
        env: &EnvironmentId,
        transaction_id: &TransactionId,
        subscriber_id: &SubscriberId,
        after_step_index: usize,
    ) -> HeraldResult<Option<Job>>;
    /// A completed job for the same (workflow, step, subscriber,
    /// transaction), used for replay deduplication.
    async fn find_completed_duplicate(
        &self,
        env: &EnvironmentId,
        workflow_id: &WorkflowId,
        step_id: &StepId,
        subscriber_id: &SubscriberId,
        transaction_id: &TransactionId,
        exclude: JobId,
    ) -> HeraldResult<Option<Job>>;
    /// Transition queued/in-flight jobs of a scope to `canceled`.
    async fn cancel_pending_for_workflow(
        &self,
        env: &EnvironmentId,
        workflow_id: &WorkflowId,
    ) -> HeraldResult<u64>;
}

/// Access to subscribers.
#[async_trait]
pub trait SubscriberStore: Send + Sync {
    async fn find(
        &self,
        env: &EnvironmentId,
        id: &SubscriberId,
    ) -> HeraldResult<Option<Subscriber>>;
    async fn upsert(&self, subscriber: Subscriber) -> HeraldResult<()>;
    async fn delete(&self, env: &EnvironmentId, id: &SubscriberId) -> HeraldResult<()>;
}

/// Topic membership expansion (external collaborator).
#[async_trait]
pub trait TopicStore: Send + Sync {
    /// Subscriber list for a topic; `None` when the topic does not exist.
    async fn subscribers_of(
        &self,
        env: &EnvironmentId,
        topic: &TopicId,
    ) -> HeraldResult<Option<Vec<SubscriberId>>>;
}

/// Read-only access to preference records, one query per cascade level.
#[async_trait]
pub trait PreferenceRepository: Send + Sync {
    async fn find_global(
        &self,
        env: &EnvironmentId,
        subscriber: &SubscriberId,
    ) -> HeraldResult<Option<Preference>>;
    async fn find_workflow_defaults(
        &self,
        env: &EnvironmentId,
        workflow: &WorkflowId,
    ) -> HeraldResult<Option<Preference>>;
    async fn find_subscriber_workflow(
        &self,
        env: &EnvironmentId,
        subscriber: &SubscriberId,
        workflow: &WorkflowId,
    ) -> HeraldResult<Option<Preference>>;
    async fn list_subscriber_workflow(
        &self,
        env: &EnvironmentId,
        subscriber: &SubscriberId,
    ) -> HeraldResult<Vec<Preference>>;
}

/// Access to open digest windows.
#[async_trait]
pub trait DigestWindowStore: Send + Sync {
    async fn find(&self, key: &DigestWindowKey) -> HeraldResult<Option<DigestWindow>>;
    async fn put(&self, window: DigestWindow) -> HeraldResult<()>;
    async fn delete(&self, key: &DigestWindowKey) -> HeraldResult<()>;
}

/// Append-only audit trail of job attempts.
#[async_trait]
pub trait ExecutionDetailStore: Send + Sync {
    async fn append(&self, detail: ExecutionDetail) -> HeraldResult<()>;
    async fn list_for_job(&self, job_id: JobId) -> HeraldResult<Vec<ExecutionDetail>>;
    async fn list_for_transaction(
        &self,
        transaction_id: &TransactionId,
    ) -> HeraldResult<Vec<ExecutionDetail>>;
}

/// Access to organizations (service tier lookup).
#[async_trait]
pub trait OrganizationStore: Send + Sync {
    async fn find(&self, id: &OrganizationId) -> HeraldResult<Option<Organization>>;
}

/// Helper used by job mutation paths: true when the status change took effect.
pub fn is_valid_transition(from: JobStatus, to: JobStatus) -> bool {
    use JobStatus::*;
    match (from, to) {
        // Cancellation is reachable from any non-terminal state
        (Pending | Running | Failed, Canceled) => true,
        (Pending, Running) => true,
        (Running, Completed | Failed | Merged) => true,
        // Retry path re-queues a failed job
        (Failed, Pending) => true,
        // Delay/digest jobs bounce back to pending while waiting
        (Running, Pending) => true,
        _ => false,
    }
}
