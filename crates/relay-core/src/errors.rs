use std::time::Duration;

/// Failure outcomes of a relayed request.
///
/// Only `NoClients`, `Timeout` and `Rejected` are meant for external callers;
/// the remaining variants describe local faults.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum RelayError {
    #[error("no clients connected")]
    NoClients,

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("{0}")]
    Rejected(String),

    #[error("failed to encode message: {0}")]
    Serialization(String),

    #[error("request abandoned before completion")]
    Abandoned,
}

impl RelayError {
    /// Reason used when a plugin reports failure without saying why.
    pub const DEFAULT_REJECTION: &'static str = "operation failed";

    /// Build a rejection from an optional remote reason.
    pub fn rejected(reason: Option<String>) -> Self {
        match reason {
            Some(r) if !r.trim().is_empty() => Self::Rejected(r),
            _ => Self::Rejected(Self::DEFAULT_REJECTION.into()),
        }
    }

    /// Whether repeating the same request could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::NoClients | Self::Timeout(_))
    }

    /// Short classification string for logging and API error codes.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::NoClients => "no_clients",
            Self::Timeout(_) => "timeout",
            Self::Rejected(_) => "remote_rejected",
            Self::Serialization(_) => "serialization",
            Self::Abandoned => "abandoned",
        }
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
