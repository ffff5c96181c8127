// Closed error taxonomy. Every failure crossing the adapter boundary is
// wrapped in one of these variants before it leaves; tool failures never
// appear here, they are normalized into ToolOutcome by the runner.

use thiserror::Error;

/// Gateway error taxonomy.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Missing or malformed upstream credentials or base URL. Never retried.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Request shape or schema violation.
    #[error("validation error: {0}")]
    Validation(String),

    /// Model or app not permitted for the caller.
    #[error("not authorized: {0}")]
    Authorization(String),

    /// App or model unknown.
    #[error("not found: {0}")]
    NotFound(String),

    /// Upstream 429.
    #[error("rate limited by {provider}")]
    RateLimit {
        provider: String,
        /// Seconds, when the upstream supplied a Retry-After header.
        retry_after: Option<u64>,
    },

    /// Upstream non-2xx or malformed body.
    #[error("provider {provider} error (HTTP {status}): {body}")]
    Provider {
        provider: String,
        status: u16,
        /// Snippet of the upstream body, bounded for log hygiene.
        body: String,
    },

    /// DNS/TCP/TLS/timeout at the upstream.
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Wall-clock timeout of a round or request.
    #[error("request timed out")]
    Timeout,

    /// Malformed SSE frame or fatally broken upstream stream.
    #[error("streaming error: {0}")]
    Streaming(String),

    /// A second round was submitted on a busy session.
    #[error("session busy: {0}")]
    Busy(String),
}

impl GatewayError {
    /// Stable machine code, used for locale lookup and API payloads.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::Configuration(_) => "CONFIGURATION_ERROR",
            GatewayError::Validation(_) => "VALIDATION_ERROR",
            GatewayError::Authorization(_) => "AUTHORIZATION_ERROR",
            GatewayError::NotFound(_) => "NOT_FOUND",
            GatewayError::RateLimit { .. } => "RATE_LIMIT",
            GatewayError::Provider { .. } => "PROVIDER_ERROR",
            GatewayError::Network(err) if err.is_timeout() => "TIMEOUT",
            GatewayError::Network(_) => "NETWORK_ERROR",
            GatewayError::Timeout => "TIMEOUT",
            GatewayError::Streaming(_) => "STREAMING_ERROR",
            GatewayError::Busy(_) => "BUSY",
        }
    }

    /// HTTP status the surface maps this error to.
    pub fn http_status(&self) -> u16 {
        match self {
            GatewayError::Configuration(_) => 500,
            GatewayError::Validation(_) => 400,
            GatewayError::Authorization(_) => 403,
            GatewayError::NotFound(_) => 404,
            GatewayError::RateLimit { .. } => 429,
            GatewayError::Provider { .. } => 502,
            GatewayError::Network(err) if err.is_timeout() => 504,
            GatewayError::Network(_) => 502,
            GatewayError::Timeout => 504,
            GatewayError::Streaming(_) => 502,
            GatewayError::Busy(_) => 409,
        }
    }

    /// Truncate an upstream body for inclusion in a Provider error.
    pub fn body_snippet(body: &str) -> String {
        const LIMIT: usize = 512;
        if body.len() <= LIMIT {
            body.to_string()
        } else {
            let mut end = LIMIT;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}…", &body[..end])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_follows_the_taxonomy() {
        assert_eq!(GatewayError::Configuration("x".into()).http_status(), 500);
        assert_eq!(GatewayError::Validation("x".into()).http_status(), 400);
        assert_eq!(GatewayError::Authorization("x".into()).http_status(), 403);
        assert_eq!(GatewayError::NotFound("x".into()).http_status(), 404);
        assert_eq!(
            GatewayError::RateLimit {
                provider: "openai".into(),
                retry_after: Some(5)
            }
            .http_status(),
            429
        );
        assert_eq!(
            GatewayError::Provider {
                provider: "openai".into(),
                status: 500,
                body: "boom".into()
            }
            .http_status(),
            502
        );
        assert_eq!(GatewayError::Timeout.http_status(), 504);
        assert_eq!(GatewayError::Streaming("bad frame".into()).http_status(), 502);
        assert_eq!(GatewayError::Busy("chat-1".into()).http_status(), 409);
    }

    #[test]
    fn body_snippet_truncates_on_char_boundaries() {
        let long = "é".repeat(600);
        let snippet = GatewayError::body_snippet(&long);
        assert!(snippet.len() <= 515);
        assert!(snippet.ends_with('…'));

        assert_eq!(GatewayError::body_snippet("short"), "short");
    }
}
