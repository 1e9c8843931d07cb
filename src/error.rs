use thiserror::Error;

#[derive(Debug, Error)]
pub enum TriageError {
    #[error("failed to parse timestamp: {0}")]
    ParseTime(String),

    #[error("unknown city: {0}")]
    UnknownCity(String),

    #[error("transient upstream failure (status={status:?}): {message}")]
    TransientUpstream {
        status: Option<u16>,
        message: String,
    },

    #[error("upstream returned permanent error status {status}")]
    UpstreamPermanent { status: u16 },

    #[error("rate limited by classifier provider {provider}")]
    ClassifierRateLimit { provider: String },

    #[error("classifier rejected an image URL")]
    ClassifierBadImage,

    #[error("classifier error: {0}")]
    ClassifierOther(String),

    #[error("state store error: {0}")]
    StateStore(#[from] redis::RedisError),

    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl TriageError {
    /// True if retrying the same operation after a short backoff is reasonable.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::TransientUpstream { .. } | Self::ClassifierRateLimit { .. } | Self::Request(_)
        )
    }

    /// Sanitized message safe to surface to a caller or log line.
    pub fn user_message(&self) -> String {
        match self {
            Self::ParseTime(s) => format!("could not parse timestamp: {s}"),
            Self::UnknownCity(city) => format!("unknown city: {city}"),
            Self::TransientUpstream { status, .. } => {
                format!("upstream temporarily unavailable (status={status:?})")
            }
            Self::UpstreamPermanent { status } => format!("upstream returned status {status}"),
            Self::ClassifierRateLimit { provider } => format!("{provider} rate limited"),
            Self::ClassifierBadImage => "classifier rejected an image URL".to_string(),
            Self::ClassifierOther(_) => "classifier request failed".to_string(),
            Self::StateStore(_) => "state store request failed".to_string(),
            Self::Request(_) => "network request failed".to_string(),
            Self::Config(msg) => format!("configuration error: {msg}"),
        }
    }
}
