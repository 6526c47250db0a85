//! Error types for the AVL environment abstraction.

use thiserror::Error;

/// Errors that can occur in the environment abstraction layer.
#[derive(Debug, Error)]
pub enum EnvError {
    /// Outbound queue is saturated; the record was not enqueued
    #[error("Sink full: {0}")]
    SinkFull(String),

    /// Receiving side of the sink has gone away
    #[error("Sink closed: {0}")]
    SinkClosed(String),
}

impl EnvError {
    /// Creates a sink-full error.
    pub fn full(sink: impl Into<String>) -> Self {
        Self::SinkFull(sink.into())
    }

    /// Creates a sink-closed error.
    pub fn closed(sink: impl std::fmt::Display) -> Self {
        Self::SinkClosed(sink.to_string())
    }

    /// True if retrying later could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::SinkFull(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(EnvError::full("arrivals").to_string(), "Sink full: arrivals");
        assert_eq!(EnvError::closed("predictions").to_string(), "Sink closed: predictions");
    }

    #[test]
    fn test_transient_classification() {
        assert!(EnvError::full("x").is_transient());
        assert!(!EnvError::closed("x").is_transient());
    }
}
