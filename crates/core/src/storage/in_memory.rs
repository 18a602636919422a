//! In-memory implementations of the storage contracts.

use super::{
    DigestWindowStore, ExecutionDetailStore, JobStore, OrganizationStore, PreferenceRepository,
    SubscriberStore, TopicStore, WorkflowStore,
};
use crate::error::HeraldResult;
use crate::types::{
    DigestWindow, DigestWindowKey, EnvironmentId, ExecutionDetail, Job, JobId, JobStatus,
    Organization, OrganizationId, Preference, PreferenceLevel, StepId, Subscriber, SubscriberId,
    TopicId, TransactionId, Workflow, WorkflowId,
};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Mutex;

/// In-memory workflow store.
pub struct InMemoryWorkflowStore {
    workflows: Mutex<HashMap<(EnvironmentId, WorkflowId), Workflow>>,
}

impl InMemoryWorkflowStore {
    pub fn new() -> Self {
        Self {
            workflows: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryWorkflowStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkflowStore for InMemoryWorkflowStore {
    async fn find(&self, env: &EnvironmentId, id: &WorkflowId) -> HeraldResult<Option<Workflow>> {
        Ok(self
            .workflows
            .lock()
            .unwrap()
            .get(&(env.clone(), id.clone()))
            .cloned())
    }

    async fn find_by_trigger(
        &self,
        env: &EnvironmentId,
        trigger_identifier: &str,
    ) -> HeraldResult<Option<Workflow>> {
        Ok(self
            .workflows
            .lock()
            .unwrap()
            .values()
            .find(|w| w.environment_id == *env && w.trigger_identifier == trigger_identifier)
            .cloned())
    }

    async fn list(
        &self,
        env: &EnvironmentId,
        tags: Option<&[String]>,
    ) -> HeraldResult<Vec<Workflow>> {
        Ok(self
            .workflows
            .lock()
            .unwrap()
            .values()
            .filter(|w| w.environment_id == *env)
            .filter(|w| match tags {
                Some(tags) => w.tags.iter().any(|t| tags.contains(t)),
                None => true,
            })
            .cloned()
            .collect())
    }

    async fn upsert(&self, workflow: Workflow) -> HeraldResult<()> {
        self.workflows.lock().unwrap().insert(
            (workflow.environment_id.clone(), workflow.id.clone()),
            workflow,
        );
        Ok(())
    }

    async fn delete(&self, env: &EnvironmentId, id: &WorkflowId) -> HeraldResult<()> {
        self.workflows
            .lock()
            .unwrap()
            .remove(&(env.clone(), id.clone()));
        Ok(())
    }
}

/// In-memory job store.
pub struct InMemoryJobStore {
    jobs: Mutex<HashMap<JobId, Job>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn find(&self, id: JobId) -> HeraldResult<Option<Job>> {
        Ok(self.jobs.lock().unwrap().get(&id).cloned())
    }

    async fn insert(&self, job: Job) -> HeraldResult<()> {
        self.jobs.lock().unwrap().insert(job.id, job);
        Ok(())
    }

    async fn update(&self, mut job: Job) -> HeraldResult<()> {
        job.updated_at = Utc::now();
        self.jobs.lock().unwrap().insert(job.id, job);
        Ok(())
    }

    async fn list_by_transaction(
        &self,
        env: &EnvironmentId,
        transaction_id: &TransactionId,
    ) -> HeraldResult<Vec<Job>> {
        let mut jobs: Vec<Job> = self
            .jobs
            .lock()
            .unwrap()
            .values()
            .filter(|j| j.environment_id == *env && j.transaction_id == *transaction_id)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.step_index);
        Ok(jobs)
    }

    async fn find_next_in_chain(
        &self,
        env: &EnvironmentId,
        transaction_id: &TransactionId,
        subscriber_id: &SubscriberId,
        after_step_index: usize,
    ) -> HeraldResult<Option<Job>> {
        Ok(self
            .jobs
            .lock()
            .unwrap()
            .values()
            .filter(|j| {
                j.environment_id == *env
                    && j.transaction_id == *transaction_id
                    && j.subscriber_id == *subscriber_id
                    && j.step_index > after_step_index
                    && j.status == JobStatus::Pending
            })
            .min_by_key(|j| j.step_index)
            .cloned())
    }

    async fn find_completed_duplicate(
        &self,
        env: &EnvironmentId,
        workflow_id: &WorkflowId,
        step_id: &StepId,
        subscriber_id: &SubscriberId,
        transaction_id: &TransactionId,
        exclude: JobId,
    ) -> HeraldResult<Option<Job>> {
        Ok(self
            .jobs
            .lock()
            .unwrap()
            .values()
            .find(|j| {
                j.id != exclude
                    && j.environment_id == *env
                    && j.workflow_id == *workflow_id
                    && j.step.id == *step_id
                    && j.subscriber_id == *subscriber_id
                    && j.transaction_id == *transaction_id
                    && j.status == JobStatus::Completed
            })
            .cloned())
    }

    async fn cancel_pending_for_workflow(
        &self,
        env: &EnvironmentId,
        workflow_id: &WorkflowId,
    ) -> HeraldResult<u64> {
        let mut jobs = self.jobs.lock().unwrap();
        let mut canceled = 0;
        for job in jobs.values_mut() {
            if job.environment_id == *env
                && job.workflow_id == *workflow_id
                && !job.status.is_terminal()
            {
                job.status = JobStatus::Canceled;
                job.updated_at = Utc::now();
                canceled += 1;
            }
        }
        Ok(canceled)
    }
}

/// In-memory subscriber store.
pub struct InMemorySubscriberStore {
    subscribers: Mutex<HashMap<(EnvironmentId, SubscriberId), Subscriber>>,
}

impl InMemorySubscriberStore {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for InMemorySubscriberStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SubscriberStore for InMemorySubscriberStore {
    async fn find(
        &self,
        env: &EnvironmentId,
        id: &SubscriberId,
    ) -> HeraldResult<Option<Subscriber>> {
        Ok(self
            .subscribers
            .lock()
            .unwrap()
            .get(&(env.clone(), id.clone()))
            .cloned())
    }

    async fn upsert(&self, subscriber: Subscriber) -> HeraldResult<()> {
        self.subscribers.lock().unwrap().insert(
            (subscriber.environment_id.clone(), subscriber.id.clone()),
            subscriber,
        );
        Ok(())
    }

    async fn delete(&self, env: &EnvironmentId, id: &SubscriberId) -> HeraldResult<()> {
        self.subscribers
            .lock()
            .unwrap()
            .remove(&(env.clone(), id.clone()));
        Ok(())
    }
}

/// In-memory topic store.
pub struct InMemoryTopicStore {
    topics: Mutex<HashMap<(EnvironmentId, TopicId), Vec<SubscriberId>>>,
}

impl InMemoryTopicStore {
    pub fn new() -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_members(&self, env: EnvironmentId, topic: TopicId, members: Vec<SubscriberId>) {
        self.topics.lock().unwrap().insert((env, topic), members);
    }
}

impl Default for InMemoryTopicStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TopicStore for InMemoryTopicStore {
    async fn subscribers_of(
        &self,
        env: &EnvironmentId,
        topic: &TopicId,
    ) -> HeraldResult<Option<Vec<SubscriberId>>> {
        Ok(self
            .topics
            .lock()
            .unwrap()
            .get(&(env.clone(), topic.clone()))
            .cloned())
    }
}

/// In-memory preference repository.
pub struct InMemoryPreferenceRepository {
    preferences: Mutex<Vec<Preference>>,
}

impl InMemoryPreferenceRepository {
    pub fn new() -> Self {
        Self {
            preferences: Mutex::new(Vec::new()),
        }
    }

    pub fn insert(&self, preference: Preference) {
        self.preferences.lock().unwrap().push(preference);
    }
}

impl Default for InMemoryPreferenceRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PreferenceRepository for InMemoryPreferenceRepository {
    async fn find_global(
        &self,
        env: &EnvironmentId,
        subscriber: &SubscriberId,
    ) -> HeraldResult<Option<Preference>> {
        Ok(self
            .preferences
            .lock()
            .unwrap()
            .iter()
            .find(|p| {
                p.environment_id == *env
                    && p.level == PreferenceLevel::Global
                    && p.subscriber_id.as_ref() == Some(subscriber)
            })
            .cloned())
    }

    async fn find_workflow_defaults(
        &self,
        env: &EnvironmentId,
        workflow: &WorkflowId,
    ) -> HeraldResult<Option<Preference>> {
        Ok(self
            .preferences
            .lock()
            .unwrap()
            .iter()
            .find(|p| {
                p.environment_id == *env
                    && p.level == PreferenceLevel::Workflow
                    && p.workflow_id.as_ref() == Some(workflow)
            })
            .cloned())
    }

    async fn find_subscriber_workflow(
        &self,
        env: &EnvironmentId,
        subscriber: &SubscriberId,
        workflow: &WorkflowId,
    ) -> HeraldResult<Option<Preference>> {
        Ok(self
            .preferences
            .lock()
            .unwrap()
            .iter()
            .find(|p| {
                p.environment_id == *env
                    && p.level == PreferenceLevel::SubscriberWorkflow
                    && p.subscriber_id.as_ref() == Some(subscriber)
                    && p.workflow_id.as_ref() == Some(workflow)
            })
            .cloned())
    }

    async fn list_subscriber_workflow(
        &self,
        env: &EnvironmentId,
        subscriber: &SubscriberId,
    ) -> HeraldResult<Vec<Preference>> {
        Ok(self
            .preferences
            .lock()
            .unwrap()
            .iter()
            .filter(|p| {
                p.environment_id == *env
                    && p.level == PreferenceLevel::SubscriberWorkflow
                    && p.subscriber_id.as_ref() == Some(subscriber)
            })
            .cloned()
            .collect())
    }
}

/// In-memory digest window store.
pub struct InMemoryDigestWindowStore {
    windows: Mutex<HashMap<DigestWindowKey, DigestWindow>>,
}

impl InMemoryDigestWindowStore {
    pub fn new() -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryDigestWindowStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DigestWindowStore for InMemoryDigestWindowStore {
    async fn find(&self, key: &DigestWindowKey) -> HeraldResult<Option<DigestWindow>> {
        Ok(self.windows.lock().unwrap().get(key).cloned())
    }

    async fn put(&self, window: DigestWindow) -> HeraldResult<()> {
        self.windows
            .lock()
            .unwrap()
            .insert(window.key.clone(), window);
        Ok(())
    }

    async fn delete(&self, key: &DigestWindowKey) -> HeraldResult<()> {
        self.windows.lock().unwrap().remove(key);
        Ok(())
    }
}

/// In-memory execution detail store (append-only).
pub struct InMemoryExecutionDetailStore {
    details: Mutex<Vec<ExecutionDetail>>,
}

impl InMemoryExecutionDetailStore {
    pub fn new() -> Self {
        Self {
            details: Mutex::new(Vec::new()),
        }
    }
}

impl Default for InMemoryExecutionDetailStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExecutionDetailStore for InMemoryExecutionDetailStore {
    async fn append(&self, detail: ExecutionDetail) -> HeraldResult<()> {
        self.details.lock().unwrap().push(detail);
        Ok(())
    }

    async fn list_for_job(&self, job_id: JobId) -> HeraldResult<Vec<ExecutionDetail>> {
        Ok(self
            .details
            .lock()
            .unwrap()
            .iter()
            .filter(|d| d.job_id == job_id)
            .cloned()
            .collect())
    }

    async fn list_for_transaction(
        &self,
        transaction_id: &TransactionId,
    ) -> HeraldResult<Vec<ExecutionDetail>> {
        Ok(self
            .details
            .lock()
            .unwrap()
            .iter()
            .filter(|d| d.transaction_id == *transaction_id)
            .cloned()
            .collect())
    }
}

/// In-memory organization store.
pub struct InMemoryOrganizationStore {
    organizations: Mutex<HashMap<OrganizationId, Organization>>,
}

impl InMemoryOrganizationStore {
    pub fn new() -> Self {
        Self {
            organizations: Mutex::new(HashMap::new()),
        }
    }

    pub fn insert(&self, organization: Organization) {
        self.organizations
            .lock()
            .unwrap()
            .insert(organization.id.clone(), organization);
    }
}

impl Default for InMemoryOrganizationStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OrganizationStore for InMemoryOrganizationStore {
    async fn find(&self, id: &OrganizationId) -> HeraldResult<Option<Organization>> {
        Ok(self.organizations.lock().unwrap().get(id).cloned())
    }
}
