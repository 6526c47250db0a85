//! Error taxonomy for the AVL core.
//!
//! Only invalid reference data and configuration problems are errors.
//! "No match" is modelled as `Option::None` and never reaches this type.

use thiserror::Error;

/// Errors surfaced by reference-data lookups and configuration loading.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A cursor or lookup pointed outside the trip/stop path/segment arrays
    #[error("{what} index {index} out of range (len {len}) for {context}")]
    IndexOutOfRange {
        what: &'static str,
        index: i32,
        len: usize,
        context: String,
    },

    #[error("Unknown block {block_id} for service {service_id}")]
    UnknownBlock { service_id: String, block_id: String },

    #[error("Unknown trip {0}")]
    UnknownTrip(String),

    /// Structurally invalid reference data (empty path, mismatched arrays, ...)
    #[error("Invalid reference data: {0}")]
    InvalidReference(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoreError {
    pub fn out_of_range(what: &'static str, index: i32, len: usize, context: impl Into<String>) -> Self {
        Self::IndexOutOfRange {
            what,
            index,
            len,
            context: context.into(),
        }
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidReference(msg.into())
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
