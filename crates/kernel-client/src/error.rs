//! Error type shared by every layer of the client core.

use std::time::Duration;

/// Errors surfaced by kernelspec discovery, message construction, channel
/// dispatch and request tracking.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The enumeration call failed or printed something we could not parse.
    /// The previous kernelspec cache is left in place.
    #[error("Kernelspec discovery failed: {0}")]
    Discovery(String),

    #[error("No kernelspec found for '{0}'")]
    NotFound(String),

    /// A request was built for a channel outside the fixed set.
    #[error("Unknown channel: {0}")]
    UnknownChannel(String),

    /// Reply-type derivation was attempted on a type without `request` in it.
    #[error("Cannot derive a reply type from '{0}'")]
    InvalidMessageType(String),

    #[error("Timed out after {0:?} waiting for idle")]
    Timeout(Duration),

    /// The client was torn down while the request was outstanding.
    #[error("Client disconnected before the request became idle")]
    Disconnected,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Whether the caller may retry the operation that produced this error.
    ///
    /// Only an elapsed wait is recoverable; the request it timed out on can
    /// still become idle later.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::Timeout(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(
            Error::NotFound("python3".into()).to_string(),
            "No kernelspec found for 'python3'"
        );
        assert_eq!(
            Error::UnknownChannel("bogus".into()).to_string(),
            "Unknown channel: bogus"
        );
    }

    #[test]
    fn test_only_timeout_is_recoverable() {
        assert!(Error::Timeout(Duration::from_millis(10)).is_recoverable());
        assert!(!Error::Disconnected.is_recoverable());
        assert!(!Error::Discovery("boom".into()).is_recoverable());
    }
}
