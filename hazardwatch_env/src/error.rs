//! Error types for the HazardWatch environment abstraction.

use thiserror::Error;

/// Errors that can occur in the environment abstraction layer.
#[derive(Debug, Clone, Error)]
pub enum EnvError {
    /// Wall clock unusable (before the epoch or out of range)
    #[error("Clock error: {0}")]
    Clock(String),
}
