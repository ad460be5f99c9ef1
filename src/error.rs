use thiserror::Error;

#[derive(Debug, Error)]
pub enum MonitorError {
    /// Transient: the surface behind a source could not be reached this poll.
    #[error("source '{source_name}' unavailable: {reason}")]
    SourceUnavailable { source_name: String, reason: String },

    #[error("delivery to channel '{channel}' failed: {reason}")]
    ChannelDelivery { channel: String, reason: String },

    #[error("invalid configuration: {0}")]
    ConfigurationInvalid(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl MonitorError {
    pub fn unavailable(source_name: impl Into<String>, reason: impl ToString) -> Self {
        MonitorError::SourceUnavailable {
            source_name: source_name.into(),
            reason: reason.to_string(),
        }
    }

    pub fn delivery(channel: impl Into<String>, reason: impl ToString) -> Self {
        MonitorError::ChannelDelivery {
            channel: channel.into(),
            reason: reason.to_string(),
        }
    }

    pub fn invalid(reason: impl ToString) -> Self {
        MonitorError::ConfigurationInvalid(reason.to_string())
    }
}

impl From<toml::de::Error> for MonitorError {
    fn from(e: toml::de::Error) -> Self {
        MonitorError::ConfigurationInvalid(e.to_string())
    }
}

impl From<sqlx::Error> for MonitorError {
    fn from(e: sqlx::Error) -> Self {
        MonitorError::Store(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, MonitorError>;
