use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a job (one step, one recipient, one transaction)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a workflow
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkflowId(pub String);

impl WorkflowId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a workflow step
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StepId(pub String);

impl StepId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for StepId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a subscriber
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriberId(pub String);

impl SubscriberId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a topic (a named subscriber list)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TopicId(pub String);

impl TopicId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

/// Identifier shared by every job created from one trigger
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransactionId(pub String);

impl TransactionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Create a new random transaction ID
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl std::fmt::Display for TransactionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for an environment (dev/prod scope within an organization)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EnvironmentId(pub String);

impl EnvironmentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

/// Unique identifier for an organization
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrganizationId(pub String);

impl OrganizationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

/// Delivery channel for a notification step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelType {
    Email,
    Sms,
    Push,
    Chat,
    InApp,
}

impl ChannelType {
    pub const ALL: [ChannelType; 5] = [
        ChannelType::Email,
        ChannelType::Sms,
        ChannelType::Push,
        ChannelType::Chat,
        ChannelType::InApp,
    ];
}

impl std::fmt::Display for ChannelType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ChannelType::Email => "email",
            ChannelType::Sms => "sms",
            ChannelType::Push => "push",
            ChannelType::Chat => "chat",
            ChannelType::InApp => "in_app",
        };
        write!(f, "{}", name)
    }
}

/// Time unit for delay and digest durations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DigestUnit {
    Seconds,
    Minutes,
    Hours,
    Days,
    Weeks,
    Months,
}

impl DigestUnit {
    /// Convert an amount of this unit into a chrono duration.
    ///
    /// Months are treated as 30 days; tier enforcement and window math
    /// only need an upper-bound approximation.
    pub fn to_duration(self, amount: u64) -> chrono::Duration {
        let amount = amount as i64;
        match self {
            DigestUnit::Seconds => chrono::Duration::seconds(amount),
            DigestUnit::Minutes => chrono::Duration::minutes(amount),
            DigestUnit::Hours => chrono::Duration::hours(amount),
            DigestUnit::Days => chrono::Duration::days(amount),
            DigestUnit::Weeks => chrono::Duration::weeks(amount),
            DigestUnit::Months => chrono::Duration::days(amount * 30),
        }
    }
}

/// Batching policy for a digest step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DigestPolicy {
    /// Fixed window measured from the first event
    Regular { amount: u64, unit: DigestUnit },
    /// Flush at the next cron-computed instant, regardless of window start
    Timed { cron: String },
    /// Rolling window that stays open until no event arrives for the
    /// configured duration; every new event extends it
    LookBack { amount: u64, unit: DigestUnit },
}

/// User-supplied configuration for a step, one schema per step type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepControls {
    Email {
        subject: String,
        body: String,
    },
    Sms {
        content: String,
    },
    Push {
        title: String,
        content: String,
    },
    Chat {
        content: String,
    },
    InApp {
        content: String,
    },
    Delay {
        amount: u64,
        unit: DigestUnit,
    },
    Digest {
        policy: DigestPolicy,
        /// Payload field used to group events into windows; defaults to
        /// the subscriber when absent
        digest_key: Option<String>,
    },
    /// Step whose logic lives in externally hosted code
    Custom {
        #[serde(default)]
        inputs: serde_json::Value,
    },
}

impl StepControls {
    /// Delivery channel for channel steps, `None` for action steps
    pub fn channel(&self) -> Option<ChannelType> {
        match self {
            StepControls::Email { .. } => Some(ChannelType::Email),
            StepControls::Sms { .. } => Some(ChannelType::Sms),
            StepControls::Push { .. } => Some(ChannelType::Push),
            StepControls::Chat { .. } => Some(ChannelType::Chat),
            StepControls::InApp { .. } => Some(ChannelType::InApp),
            _ => None,
        }
    }

    pub fn is_action(&self) -> bool {
        matches!(
            self,
            StepControls::Delay { .. } | StepControls::Digest { .. } | StepControls::Custom { .. }
        )
    }
}

/// Step-level conditional filter evaluated against the trigger payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepFilter {
    /// Payload field must equal the given value
    PayloadEquals { key: String, value: serde_json::Value },
    /// Payload field must be present
    PayloadExists { key: String },
}

impl StepFilter {
    /// Evaluate the filter against a trigger payload.
    pub fn matches(&self, payload: &serde_json::Value) -> bool {
        match self {
            StepFilter::PayloadEquals { key, value } => {
                payload.get(key).map(|v| v == value).unwrap_or(false)
            }
            StepFilter::PayloadExists { key } => payload.get(key).is_some(),
        }
    }
}

/// A single step within a workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: StepId,
    pub name: String,
    pub controls: StepControls,
    /// Conditional filter; the step is skipped when it does not match
    pub filter: Option<StepFilter>,
    /// Identifier of the step inside externally hosted workflow code
    pub bridge_step_id: Option<String>,
    pub active: bool,
}

/// Where a workflow's step logic lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowOrigin {
    /// Authored and executed inside Herald
    Internal,
    /// Step logic hosted externally and reached over the bridge protocol
    External,
}

/// A workflow definition: an ordered list of steps bound to a trigger
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: WorkflowId,
    pub name: String,
    /// Identifier used by triggers to address this workflow
    pub trigger_identifier: String,
    pub steps: Vec<Step>,
    pub origin: WorkflowOrigin,
    pub active: bool,
    pub tags: Vec<String>,
    pub environment_id: EnvironmentId,
    pub organization_id: OrganizationId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A notification recipient in a trigger request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Recipient {
    /// A known subscriber, addressed by ID
    Subscriber { subscriber_id: SubscriberId },
    /// An inline subscriber definition, upserted before job creation
    Inline { subscriber: Subscriber },
    /// A topic whose member list is expanded at trigger time
    Topic { topic_id: TopicId },
}

/// A person (or system) that can receive notifications
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscriber {
    pub id: SubscriberId,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub active: bool,
    pub environment_id: EnvironmentId,
    pub organization_id: OrganizationId,
}

/// Inbound request naming a workflow, recipients and payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerEvent {
    /// Trigger identifier of the workflow to run
    pub workflow: String,
    pub recipients: Vec<Recipient>,
    pub payload: serde_json::Value,
    /// Provider/channel overrides passed through to step execution
    #[serde(default)]
    pub overrides: serde_json::Value,
    pub transaction_id: Option<TransactionId>,
    pub actor: Option<SubscriberId>,
    pub tenant: Option<String>,
    pub environment_id: EnvironmentId,
    pub organization_id: OrganizationId,
}

/// Status of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Merged,
    Canceled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Merged | JobStatus::Canceled
        )
    }
}

/// One execution unit: (workflow, step, recipient, transaction)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub workflow_id: WorkflowId,
    /// Snapshot of the step at trigger time; immutable for the job's lifetime
    pub step: Step,
    /// Position of the step within the workflow, used for chaining
    pub step_index: usize,
    pub subscriber_id: SubscriberId,
    pub transaction_id: TransactionId,
    pub environment_id: EnvironmentId,
    pub organization_id: OrganizationId,
    pub status: JobStatus,
    /// Payload snapshot; becomes an array of payloads after a digest flush
    pub payload: serde_json::Value,
    #[serde(default)]
    pub overrides: serde_json::Value,
    /// Resolved digest accumulation key, for digest steps only
    pub digest_key: Option<String>,
    /// Outputs produced by the step, handed to later bridge steps as state
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    /// Earliest instant a delay/digest job may proceed
    pub wait_until: Option<DateTime<Utc>>,
    pub attempts: u32,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Scope at which a preference record applies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreferenceLevel {
    Global,
    Workflow,
    SubscriberWorkflow,
}

/// Per-channel enablement flags; `None` means "unset at this level"
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelPreferences {
    pub email: Option<bool>,
    pub sms: Option<bool>,
    pub push: Option<bool>,
    pub chat: Option<bool>,
    pub in_app: Option<bool>,
}

impl ChannelPreferences {
    pub fn get(&self, channel: ChannelType) -> Option<bool> {
        match channel {
            ChannelType::Email => self.email,
            ChannelType::Sms => self.sms,
            ChannelType::Push => self.push,
            ChannelType::Chat => self.chat,
            ChannelType::InApp => self.in_app,
        }
    }

    pub fn set(&mut self, channel: ChannelType, enabled: bool) {
        match channel {
            ChannelType::Email => self.email = Some(enabled),
            ChannelType::Sms => self.sms = Some(enabled),
            ChannelType::Push => self.push = Some(enabled),
            ChannelType::Chat => self.chat = Some(enabled),
            ChannelType::InApp => self.in_app = Some(enabled),
        }
    }

    /// Overlay another layer on top of this one; channels set in `other`
    /// win, channels unset in `other` keep this layer's value.
    pub fn overlay(&self, other: &ChannelPreferences) -> ChannelPreferences {
        let mut merged = *self;
        for channel in ChannelType::ALL {
            if let Some(enabled) = other.get(channel) {
                merged.set(channel, enabled);
            }
        }
        merged
    }
}

/// A stored preference record at one cascade level
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Preference {
    pub level: PreferenceLevel,
    /// Required for Workflow and SubscriberWorkflow levels
    pub workflow_id: Option<WorkflowId>,
    /// Required for SubscriberWorkflow level
    pub subscriber_id: Option<SubscriberId>,
    /// Overall enabled flag; `false` disables every channel
    pub enabled: bool,
    pub channels: ChannelPreferences,
    pub environment_id: EnvironmentId,
    pub organization_id: OrganizationId,
    pub updated_at: DateTime<Utc>,
}

/// Effective preference set after cascade resolution, every channel a boolean
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedPreferences {
    pub workflow_id: Option<WorkflowId>,
    pub enabled: bool,
    pub email: bool,
    pub sms: bool,
    pub push: bool,
    pub chat: bool,
    pub in_app: bool,
}

impl ResolvedPreferences {
    /// All channels enabled; the default when no record exists at any level.
    pub fn all_enabled(workflow_id: Option<WorkflowId>) -> Self {
        Self {
            workflow_id,
            enabled: true,
            email: true,
            sms: true,
            push: true,
            chat: true,
            in_app: true,
        }
    }

    pub fn channel_enabled(&self, channel: ChannelType) -> bool {
        if !self.enabled {
            return false;
        }
        match channel {
            ChannelType::Email => self.email,
            ChannelType::Sms => self.sms,
            ChannelType::Push => self.push,
            ChannelType::Chat => self.chat,
            ChannelType::InApp => self.in_app,
        }
    }
}

/// Identity of a digest accumulation bucket
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DigestWindowKey {
    pub workflow_id: WorkflowId,
    pub digest_key: String,
    pub subscriber_id: SubscriberId,
}

impl DigestWindowKey {
    /// Lock resource string guarding this window.
    pub fn lock_resource(&self) -> String {
        format!(
            "digest:{}:{}:{}",
            self.workflow_id, self.digest_key, self.subscriber_id
        )
    }
}

/// An open digest accumulation bucket
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DigestWindow {
    pub key: DigestWindowKey,
    pub environment_id: EnvironmentId,
    /// Job that opened the window and will carry the flushed payloads
    pub anchor_job_id: JobId,
    pub opened_at: DateTime<Utc>,
    pub last_event_at: DateTime<Utc>,
    pub wait_until: DateTime<Utc>,
    pub payloads: Vec<serde_json::Value>,
}

/// Where an execution detail originated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetailSource {
    Internal,
    Webhook,
    Credentials,
    Payload,
}

/// Outcome class of an execution detail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetailStatus {
    Success,
    Warning,
    Failed,
    Pending,
    Queued,
}

/// Append-only audit record of one job attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionDetail {
    pub id: Uuid,
    pub job_id: JobId,
    pub transaction_id: TransactionId,
    pub source: DetailSource,
    pub status: DetailStatus,
    pub detail: String,
    pub is_retry: bool,
    /// Raw context (bridge response, provider output) for debugging
    pub raw: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl ExecutionDetail {
    /// Create a new detail record for a job attempt.
    pub fn new(
        job: &Job,
        source: DetailSource,
        status: DetailStatus,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_id: job.id,
            transaction_id: job.transaction_id.clone(),
            source,
            status,
            detail: detail.into(),
            is_retry: job.attempts > 0,
            raw: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_raw(mut self, raw: serde_json::Value) -> Self {
        self.raw = Some(raw);
        self
    }
}

/// Billing tier of an organization, capping delay/digest durations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceTier {
    Free,
    Business,
    Enterprise,
}

/// An organization owning workflows and subscribers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Organization {
    pub id: OrganizationId,
    pub name: String,
    pub tier: ServiceTier,
}
