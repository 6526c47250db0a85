//! Harness errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SimError {
    #[error("invalid network: {0}")]
    Network(#[from] avl_core::CoreError),

    #[error("export failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("export encoding failed: {0}")]
    Json(#[from] serde_json::Error),
}

pub type SimResult<T> = Result<T, SimError>;
