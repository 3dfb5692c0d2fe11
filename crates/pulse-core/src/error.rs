use thiserror::Error;

#[derive(Error, Debug)]
pub enum AnalyticsError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {key}: {message}")]
    Storage { key: String, message: String },

    #[error("Lookup failed: {provider}: {message}")]
    Lookup { provider: String, message: String },

    #[error("Watch error: {0}")]
    Watch(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl AnalyticsError {
    pub(crate) fn storage(key: &str, message: impl std::fmt::Display) -> Self {
        Self::Storage {
            key: key.to_string(),
            message: message.to_string(),
        }
    }

    pub(crate) fn lookup(provider: &str, message: impl std::fmt::Display) -> Self {
        Self::Lookup {
            provider: provider.to_string(),
            message: message.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, AnalyticsError>;
