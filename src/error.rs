//! Error types shared by every playback component.

use serde::Serialize;
use thiserror::Error;

/// Crate-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Crate-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    /// Decode or initialisation failure of a media resource.
    #[error("Load error: {0}")]
    Load(String),

    /// Network failure. Transient failures are retried by the cache.
    #[error("Network error: {message}")]
    Network { message: String, transient: bool },

    /// A bounded wait elapsed.
    #[error("Timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Not found: {entity} with id {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    pub fn load(msg: impl Into<String>) -> Self {
        Self::Load(msg.into())
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Network {
            message: msg.into(),
            transient: true,
        }
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Network {
            message: msg.into(),
            transient: false,
        }
    }

    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Whether the cache should retry the operation that produced this error.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Network { transient: true, .. })
    }

    /// Copy for delivery to more than one receiver. Wrapped IO and JSON
    /// errors keep their message but lose their source chain.
    pub fn duplicate(&self) -> Self {
        match self {
            Error::Load(msg) => Error::Load(msg.clone()),
            Error::Network { message, transient } => Error::Network {
                message: message.clone(),
                transient: *transient,
            },
            Error::Timeout(after) => Error::Timeout(*after),
            Error::NotFound { entity, id } => Error::NotFound {
                entity,
                id: id.clone(),
            },
            Error::Configuration(msg) => Error::Configuration(msg.clone()),
            Error::Io(e) => Error::Io(std::io::Error::new(e.kind(), e.to_string())),
            Error::Serialization(e) => Error::Load(e.to_string()),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Load(_) | Error::Io(_) | Error::Serialization(_) => ErrorKind::Load,
            Error::Network { .. } => ErrorKind::Network,
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::NotFound { .. } => ErrorKind::NotFound,
            Error::Configuration(_) => ErrorKind::Configuration,
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        // Client errors will not improve on retry; everything else might.
        let transient = match err.status() {
            Some(status) => {
                status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS
            }
            None => !err.is_builder() && !err.is_redirect(),
        };
        Self::Network {
            message: err.to_string(),
            transient,
        }
    }
}

/// Copyable error category reported to the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorKind {
    Load,
    Network,
    Timeout,
    NotFound,
    Configuration,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Load => "load",
            ErrorKind::Network => "network",
            ErrorKind::Timeout => "timeout",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Configuration => "configuration",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transient_network_errors_retry() {
        assert!(Error::transient("reset").is_transient());
        assert!(!Error::permanent("404").is_transient());
        assert!(!Error::load("bad codec").is_transient());
        assert!(!Error::Timeout(std::time::Duration::from_secs(1)).is_transient());
    }

    #[test]
    fn test_kind_mapping() {
        assert_eq!(Error::not_found("item", "x").kind(), ErrorKind::NotFound);
        assert_eq!(Error::config("empty").kind(), ErrorKind::Configuration);
        assert_eq!(Error::transient("x").kind(), ErrorKind::Network);
        assert_eq!(ErrorKind::Timeout.to_string(), "timeout");
    }
}
