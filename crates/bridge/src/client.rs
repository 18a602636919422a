//! HTTP client for the bridge protocol.

use crate::config::{BridgeConfig, EnvironmentMode, RetryConfig};
use crate::error::{classify_request_error, is_tunnel_host, BridgeError, BridgeResult};
use crate::protocol::{
    BridgeAction, BridgeRequest, BridgeResponse, DiscoverResponse, HealthCheckResponse,
};
use reqwest::{header, Client, StatusCode};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};
use url::Url;

const MAX_REDIRECTS: usize = 10;

/// Client for invoking externally hosted workflow code.
#[derive(Debug, Clone)]
pub struct BridgeClient {
    client: Client,
    config: BridgeConfig,
}

impl BridgeClient {
    /// Create a client for the configured endpoint.
    pub fn new(config: BridgeConfig) -> BridgeResult<Self> {
        let scheme = config.endpoint.scheme();
        if scheme != "http" && scheme != "https" {
            return Err(BridgeError::UnsupportedProtocol {
                url: config.endpoint.to_string(),
            });
        }

        let mut headers = header::HeaderMap::new();
        // Tunneling tools show a reminder interstitial to browsers; this
        // header tells them to pass the request straight through.
        headers.insert(
            header::HeaderName::from_static("bypass-tunnel-reminder"),
            header::HeaderValue::from_static("true"),
        );

        let mut builder = Client::builder()
            .timeout(config.timeout)
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
            .default_headers(headers);

        if config.mode == EnvironmentMode::Local {
            builder = builder.danger_accept_invalid_certs(true);
        }

        let client = builder.build().map_err(|e| BridgeError::UnknownError {
            url: config.endpoint.to_string(),
            message: e.to_string(),
        })?;

        Ok(Self { client, config })
    }

    /// Create a client from a raw URL string.
    pub fn from_url(url: &str) -> BridgeResult<Self> {
        let endpoint = Url::parse(url).map_err(|_| BridgeError::InvalidUrl {
            url: url.to_string(),
        })?;
        Self::new(BridgeConfig::new(endpoint))
    }

    pub fn endpoint(&self) -> &Url {
        &self.config.endpoint
    }

    /// Enumerate the workflows and steps the bridge hosts.
    pub async fn discover(&self) -> BridgeResult<DiscoverResponse> {
        self.send(BridgeAction::Discover, None, &self.config.retry_config)
            .await
    }

    /// Probe the bridge. Single attempt, so a disconnected bridge is
    /// reported promptly instead of blocking the caller through retries.
    pub async fn health_check(&self) -> BridgeResult<HealthCheckResponse> {
        self.send(BridgeAction::HealthCheck, None, &RetryConfig::no_retry())
            .await
    }

    /// Render a step without side effects.
    pub async fn preview(&self, request: &BridgeRequest) -> BridgeResult<BridgeResponse> {
        self.send(
            BridgeAction::Preview,
            Some(request),
            &self.config.retry_config,
        )
        .await
    }

    /// Run a step and return its outputs.
    pub async fn execute(&self, request: &BridgeRequest) -> BridgeResult<BridgeResponse> {
        self.send(
            BridgeAction::Execute,
            Some(request),
            &self.config.retry_config,
        )
        .await
    }

    async fn send<T: DeserializeOwned>(
        &self,
        action: BridgeAction,
        body: Option<&BridgeRequest>,
        retry_config: &RetryConfig,
    ) -> BridgeResult<T> {
        let mut url = self.config.endpoint.clone();
        url.query_pairs_mut()
            .append_pair("action", action.as_query_value());

        let mut attempts = 0;
        loop {
            debug!(url = %url, action = action.as_query_value(), attempt = attempts + 1, "bridge request");

            let request = match body {
                Some(body) => self.client.post(url.clone()).json(body),
                None => self.client.get(url.clone()),
            };

            let error = match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return response.json().await.map_err(|_| {
                            BridgeError::ResponseReadError {
                                url: url.to_string(),
                            }
                        });
                    }
                    self.classify_status(status, &url)
                }
                Err(e) => classify_request_error(
                    &e,
                    &url,
                    self.config.mode == EnvironmentMode::Production,
                ),
            };

            if attempts < retry_config.max_retries && error.is_retryable() {
                let backoff = retry_config.backoff_for_attempt(attempts);
                warn!(
                    url = %url,
                    code = error.code(),
                    attempt = attempts + 1,
                    backoff_ms = backoff.as_millis(),
                    "bridge request failed, retrying"
                );
                tokio::time::sleep(backoff).await;
                attempts += 1;
                continue;
            }

            return Err(error);
        }
    }

    fn classify_status(&self, status: StatusCode, url: &Url) -> BridgeError {
        match status {
            StatusCode::NOT_FOUND if is_tunnel_host(url) => BridgeError::TunnelNotFound {
                url: url.to_string(),
            },
            StatusCode::NOT_FOUND => BridgeError::EndpointNotFound {
                url: url.to_string(),
            },
            StatusCode::METHOD_NOT_ALLOWED | StatusCode::NOT_IMPLEMENTED => {
                BridgeError::MethodNotConfigured {
                    url: url.to_string(),
                }
            }
            StatusCode::SERVICE_UNAVAILABLE | StatusCode::BAD_GATEWAY => {
                BridgeError::EndpointUnavailable {
                    url: url.to_string(),
                }
            }
            other => BridgeError::UnknownRequestError {
                url: url.to_string(),
                message: format!("unexpected status {}", other),
            },
        }
    }
}
