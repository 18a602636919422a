//! Error taxonomy for the bridge protocol.
//!
//! Every failure class gets its own stable code; transient classes are
//! retried, configuration classes are fatal, and nothing is silently
//! merged into a generic bucket.

/// Result type for bridge operations.
pub type BridgeResult<T> = Result<T, BridgeError>;

/// Errors that can occur when calling externally hosted workflow code.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// The configured bridge URL cannot be parsed.
    #[error("the bridge URL ({url}) is invalid")]
    InvalidUrl { url: String },

    /// The local-dev tunneling layer in front of the bridge is unreachable.
    #[error("the tunnel at {url} could not be found, make sure the tunnel is running")]
    TunnelNotFound { url: String },

    /// The bridge endpoint returned a 404-class response.
    #[error("the bridge endpoint at {url} was not found (404)")]
    EndpointNotFound { url: String },

    /// Connection refused or host unreachable.
    #[error("the bridge endpoint at {url} is unavailable")]
    EndpointUnavailable { url: String },

    /// The endpoint does not expose the verbs the protocol requires.
    #[error("the endpoint at {url} does not accept the required methods, make sure the bridge handler is configured")]
    MethodNotConfigured { url: String },

    /// The request exceeded the timeout budget.
    #[error("the request to {url} timed out")]
    RequestTimeout { url: String },

    /// The bridge URL uses a scheme other than http(s).
    #[error("the bridge URL ({url}) does not use a supported protocol, only http and https are allowed")]
    UnsupportedProtocol { url: String },

    /// The response body could not be read or decoded.
    #[error("the response from {url} could not be read")]
    ResponseReadError { url: String },

    /// The request body could not be uploaded.
    #[error("the request body sent to {url} could not be uploaded")]
    RequestUploadError { url: String },

    /// A cache layer in front of the request failed.
    #[error("the cached request to {url} failed")]
    RequestCacheError { url: String },

    /// Too many redirects while following the bridge URL.
    #[error("the request to {url} exceeded the maximum number of redirects")]
    MaximumRedirectsExceeded { url: String },

    /// A self-signed certificate was presented outside local mode.
    #[error("the bridge at {url} presented a self-signed certificate, which is not allowed in production")]
    SelfSignedCertificate { url: String },

    /// A request-level failure the taxonomy does not classify further.
    #[error("an unknown request error occurred while calling {url}: {message}")]
    UnknownRequestError { url: String, message: String },

    /// A failure outside the request itself (serialization, runtime).
    #[error("an unknown error occurred while calling {url}: {message}")]
    UnknownError { url: String, message: String },
}

impl BridgeError {
    /// Stable machine-readable code for this error class.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidUrl { .. } => "invalid-url",
            Self::TunnelNotFound { .. } => "tunnel-not-found",
            Self::EndpointNotFound { .. } => "endpoint-not-found",
            Self::EndpointUnavailable { .. } => "endpoint-unavailable",
            Self::MethodNotConfigured { .. } => "method-not-configured",
            Self::RequestTimeout { .. } => "request-timeout",
            Self::UnsupportedProtocol { .. } => "unsupported-protocol",
            Self::ResponseReadError { .. } => "response-read-error",
            Self::RequestUploadError { .. } => "request-upload-error",
            Self::RequestCacheError { .. } => "request-cache-error",
            Self::MaximumRedirectsExceeded { .. } => "maximum-redirects-exceeded",
            Self::SelfSignedCertificate { .. } => "self-signed-certificate",
            Self::UnknownRequestError { .. } => "unknown-request-error",
            Self::UnknownError { .. } => "unknown-error",
        }
    }

    /// Transient classes worth another attempt. Configuration classes
    /// (bad URL, missing handler, certificate problems) never are.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RequestTimeout { .. }
                | Self::EndpointUnavailable { .. }
                | Self::TunnelNotFound { .. }
                | Self::ResponseReadError { .. }
        )
    }
}

/// Hostname suffixes of known local-dev tunneling services.
const TUNNEL_HOSTS: [&str; 4] = [
    ".ngrok.io",
    ".ngrok-free.app",
    ".loca.lt",
    ".trycloudflare.com",
];

pub(crate) fn is_tunnel_host(url: &url::Url) -> bool {
    url.host_str()
        .map(|host| TUNNEL_HOSTS.iter().any(|suffix| host.ends_with(suffix)))
        .unwrap_or(false)
}

/// Map a transport-level failure onto the taxonomy.
pub(crate) fn classify_request_error(
    error: &reqwest::Error,
    url: &url::Url,
    production: bool,
) -> BridgeError {
    let url_string = url.to_string();

    if error.is_timeout() {
        return BridgeError::RequestTimeout { url: url_string };
    }
    if error.is_redirect() {
        return BridgeError::MaximumRedirectsExceeded { url: url_string };
    }
    if error.is_connect() {
        // Certificate failures surface as connect errors; inspect the chain
        let detail = source_chain(error);
        if production && is_certificate_failure(&detail) {
            return BridgeError::SelfSignedCertificate { url: url_string };
        }
        if is_tunnel_host(url) {
            return BridgeError::TunnelNotFound { url: url_string };
        }
        return BridgeError::EndpointUnavailable { url: url_string };
    }
    if error.is_body() {
        return BridgeError::RequestUploadError { url: url_string };
    }
    if error.is_decode() {
        return BridgeError::ResponseReadError { url: url_string };
    }
    if error.is_request() {
        return BridgeError::UnknownRequestError {
            url: url_string,
            message: error.to_string(),
        };
    }
    BridgeError::UnknownError {
        url: url_string,
        message: error.to_string(),
    }
}

/// rustls never says "self-signed": an untrusted chain surfaces as
/// "invalid peer certificate: UnknownIssuer". openssl-backed stacks use
/// the "self signed certificate" wording.
fn is_certificate_failure(detail: &str) -> bool {
    detail.contains("UnknownIssuer")
        || detail.contains("invalid peer certificate")
        || detail.contains("self-signed")
        || detail.contains("self signed")
}

fn source_chain(error: &reqwest::Error) -> String {
    let mut chain = error.to_string();
    let mut source = std::error::Error::source(error);
    while let Some(inner) = source {
        chain.push_str(": ");
        chain.push_str(&inner.to_string());
        source = inner.source();
    }
    chain
}
