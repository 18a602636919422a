//! Bridge execution client: the HTTP protocol layer that drives workflow
//! step logic hosted outside Herald.
//!
//! One endpoint, four actions selected by a query parameter (`discover`,
//! `health-check`, `preview`, `trigger`), a fixed error taxonomy, and a
//! bounded retry budget for transient failure classes.

pub mod client;
pub mod config;
pub mod error;
pub mod protocol;

pub use client::BridgeClient;
pub use config::{BridgeConfig, EnvironmentMode, RetryConfig};
pub use error::{BridgeError, BridgeResult};
pub use protocol::{
    BridgeAction, BridgeRequest, BridgeResponse, DiscoverResponse, DiscoveredWorkflow,
    ExecutionMetadata, HealthCheckResponse,
};
