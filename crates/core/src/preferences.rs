//! Preference cascade resolution.
//!
//! Three scopes layer per-channel: SUBSCRIBER_WORKFLOW overrides beat
//! WORKFLOW defaults, which beat the subscriber's GLOBAL record. A channel
//! unset at every level defaults to enabled. Resolution is read-only;
//! callers may cache results keyed by subscriber + environment.

use crate::error::{HeraldError, HeraldResult};
use crate::storage::{PreferenceRepository, SubscriberStore, WorkflowStore};
use crate::types::{
    ChannelPreferences, ChannelType, EnvironmentId, OrganizationId, Preference, PreferenceLevel,
    ResolvedPreferences, SubscriberId, Workflow, WorkflowId,
};
use std::sync::Arc;
use tracing::warn;

/// Resolves effective preferences for a subscriber.
pub struct PreferenceResolver {
    preferences: Arc<dyn PreferenceRepository>,
    subscribers: Arc<dyn SubscriberStore>,
    workflows: Arc<dyn WorkflowStore>,
}

impl PreferenceResolver {
    pub fn new(
        preferences: Arc<dyn PreferenceRepository>,
        subscribers: Arc<dyn SubscriberStore>,
        workflows: Arc<dyn WorkflowStore>,
    ) -> Self {
        Self {
            preferences,
            subscribers,
            workflows,
        }
    }

    /// Resolve the effective preference set for one subscriber and workflow.
    pub async fn resolve(
        &self,
        env: &EnvironmentId,
        _org: &OrganizationId,
        subscriber: &SubscriberId,
        workflow: &WorkflowId,
    ) -> HeraldResult<ResolvedPreferences> {
        if self.subscribers.find(env, subscriber).await?.is_none() {
            return Err(HeraldError::not_found("subscriber", subscriber));
        }

        let global = self.preferences.find_global(env, subscriber).await?;
        let workflow_defaults = self
            .preferences
            .find_workflow_defaults(env, workflow)
            .await?;
        let subscriber_workflow = self
            .preferences
            .find_subscriber_workflow(env, subscriber, workflow)
            .await?;

        Ok(merge_cascade(
            Some(workflow.clone()),
            global.as_ref(),
            workflow_defaults.as_ref(),
            subscriber_workflow.as_ref(),
        ))
    }

    /// Resolve one effective preference object per relevant workflow,
    /// optionally narrowed by workflow tags.
    pub async fn resolve_all(
        &self,
        env: &EnvironmentId,
        _org: &OrganizationId,
        subscriber: &SubscriberId,
        tags: Option<&[String]>,
    ) -> HeraldResult<Vec<ResolvedPreferences>> {
        if self.subscribers.find(env, subscriber).await?.is_none() {
            return Err(HeraldError::not_found("subscriber", subscriber));
        }

        let global = self.preferences.find_global(env, subscriber).await?;
        let overrides = self
            .preferences
            .list_subscriber_workflow(env, subscriber)
            .await?;
        let workflows = self.workflows.list(env, tags).await?;

        let mut resolved = Vec::with_capacity(workflows.len());
        for workflow in &workflows {
            let workflow_defaults = self
                .preferences
                .find_workflow_defaults(env, &workflow.id)
                .await?;
            let subscriber_workflow = overrides
                .iter()
                .find(|p| p.workflow_id.as_ref() == Some(&workflow.id));

            resolved.push(merge_cascade(
                Some(workflow.id.clone()),
                global.as_ref(),
                workflow_defaults.as_ref(),
                subscriber_workflow,
            ));
        }
        Ok(resolved)
    }

    /// Whether a specific channel is enabled for a subscriber on a workflow.
    pub async fn channel_enabled(
        &self,
        env: &EnvironmentId,
        org: &OrganizationId,
        subscriber: &SubscriberId,
        workflow: &Workflow,
        channel: ChannelType,
    ) -> HeraldResult<bool> {
        let resolved = self.resolve(env, org, subscriber, &workflow.id).await?;
        Ok(resolved.channel_enabled(channel))
    }
}

/// Merge the cascade layers into one resolved set. Later layers win
/// per-channel, not per-object; a missing GLOBAL record means all
/// channels start enabled.
fn merge_cascade(
    workflow_id: Option<WorkflowId>,
    global: Option<&Preference>,
    workflow_defaults: Option<&Preference>,
    subscriber_workflow: Option<&Preference>,
) -> ResolvedPreferences {
    let mut channels = ChannelPreferences::default();
    let mut enabled = true;

    for layer in [global, workflow_defaults, subscriber_workflow]
        .into_iter()
        .flatten()
    {
        if let Some(record) = validated(layer) {
            channels = channels.overlay(&record.channels);
            enabled = record.enabled;
        }
    }

    ResolvedPreferences {
        workflow_id,
        enabled,
        email: channels.email.unwrap_or(true),
        sms: channels.sms.unwrap_or(true),
        push: channels.push.unwrap_or(true),
        chat: channels.chat.unwrap_or(true),
        in_app: channels.in_app.unwrap_or(true),
    }
}

/// Skip malformed records (wrong identifiers for their level) with a
/// warning instead of failing the whole resolution.
fn validated(preference: &Preference) -> Option<&Preference> {
    let malformed = match preference.level {
        PreferenceLevel::Global => false,
        PreferenceLevel::Workflow => preference.workflow_id.is_none(),
        PreferenceLevel::SubscriberWorkflow => {
            preference.workflow_id.is_none() || preference.subscriber_id.is_none()
        }
    };

    if malformed {
        warn!(
            level = ?preference.level,
            "skipping malformed preference record"
        );
        None
    } else {
        Some(preference)
    }
}
