//! Wire types of the bridge protocol.

use herald_core::Subscriber;
use serde::{Deserialize, Serialize};

/// Protocol action, selected by the `action` query parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeAction {
    Discover,
    HealthCheck,
    Preview,
    /// Runs a step for real; serialized as `trigger` on the wire.
    Execute,
}

impl BridgeAction {
    pub fn as_query_value(self) -> &'static str {
        match self {
            BridgeAction::Discover => "discover",
            BridgeAction::HealthCheck => "health-check",
            BridgeAction::Preview => "preview",
            BridgeAction::Execute => "trigger",
        }
    }
}

/// Request body for `preview` and `execute` actions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BridgeRequest {
    /// User-supplied step configuration.
    pub controls: serde_json::Value,
    /// Trigger payload (or accumulated payload array after a digest).
    pub payload: serde_json::Value,
    /// Outputs of prior steps in the same transaction.
    pub state: serde_json::Value,
    pub subscriber: Option<Subscriber>,
    /// Workflow and step being addressed.
    pub workflow_id: String,
    pub step_id: String,
}

/// Execution metadata returned with every bridge response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionMetadata {
    pub status: String,
    pub error: bool,
    pub duration_ms: u64,
}

/// Response body for `preview` and `execute` actions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeResponse {
    /// Step outputs consumed by downstream steps.
    pub outputs: serde_json::Value,
    /// Provider passthrough data, opaque to the core.
    #[serde(default)]
    pub providers: serde_json::Value,
    pub metadata: ExecutionMetadata,
}

/// One workflow as enumerated by `discover`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveredWorkflow {
    pub workflow_id: String,
    pub steps: Vec<String>,
}

/// Response body for the `discover` action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoverResponse {
    pub workflows: Vec<DiscoveredWorkflow>,
}

/// Response body for the `health-check` action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResponse {
    pub status: String,
    #[serde(default)]
    pub discovered: Option<DiscoverResponse>,
    pub sdk_version: Option<String>,
}

impl HealthCheckResponse {
    pub fn is_healthy(&self) -> bool {
        self.status == "ok"
    }
}
