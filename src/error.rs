use http::StatusCode;
use std::fmt;

/// Every failure the forwarding pipeline can produce. Each variant maps to a
/// fixed downstream status; none of them escape the handler as an `Err`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    /// Selection returned nothing: the target set had no healthy upstream.
    NoHealthyUpstream,
    /// Connecting to the chosen upstream failed.
    UpstreamUnreachable(String),
    UpstreamTimeout,
    /// Protocol-level failure after the connection was established.
    Transport(String),
    /// The upstream answered, but with a 4xx/5xx status.
    UpstreamStatus(u16),
    /// No rule is bound to the handler.
    Misconfiguration(String),
    Config(String),
    Internal(String),
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayError::NoHealthyUpstream => write!(f, "no healthy upstream"),
            GatewayError::UpstreamUnreachable(msg) => {
                write!(f, "upstream unreachable: {}", msg)
            }
            GatewayError::UpstreamTimeout => write!(f, "upstream timeout"),
            GatewayError::Transport(msg) => write!(f, "transport error: {}", msg),
            GatewayError::UpstreamStatus(status) => {
                write!(f, "upstream responded with status {}", status)
            }
            GatewayError::Misconfiguration(msg) => write!(f, "misconfiguration: {}", msg),
            GatewayError::Config(msg) => write!(f, "config error: {}", msg),
            GatewayError::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl std::error::Error for GatewayError {}

impl GatewayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::NoHealthyUpstream | GatewayError::UpstreamUnreachable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            GatewayError::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::Transport(_) => StatusCode::BAD_GATEWAY,
            GatewayError::UpstreamStatus(status) => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            GatewayError::Misconfiguration(_)
            | GatewayError::Config(_)
            | GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether this outcome counts against the upstream's availability and
    /// must be fed to passive health tracking.
    pub fn reports_failure(&self) -> bool {
        matches!(
            self,
            GatewayError::UpstreamUnreachable(_) | GatewayError::UpstreamTimeout
        )
    }

    /// Short machine-readable code used in error page bodies.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::NoHealthyUpstream => "no_healthy_upstream",
            GatewayError::UpstreamUnreachable(_) => "upstream_unreachable",
            GatewayError::UpstreamTimeout => "upstream_timeout",
            GatewayError::Transport(_) => "bad_gateway",
            GatewayError::UpstreamStatus(_) => "upstream_error",
            GatewayError::Misconfiguration(_) => "misconfiguration",
            GatewayError::Config(_) => "config_error",
            GatewayError::Internal(_) => "internal_error",
        }
    }
}
