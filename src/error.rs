//! Error types for simulation construction and streaming.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// The MNA system could not be fully assigned to the solver strata at
    /// construction time (singular, floating, or inconsistent circuit).
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A requested output expression is neither a solved voltage nor a
    /// registered component voltage.
    #[error("unknown output: {0}")]
    UnknownOutput(String),

    /// An input or output buffer does not match the requested sample count.
    #[error("buffer length mismatch: expected {expected} samples, got {got}")]
    LengthMismatch { expected: usize, got: usize },

    /// The kernel for the requested signature could not be built. The cache
    /// is left unpopulated so a later call may retry.
    #[error("kernel build failed: {0}")]
    Build(String),
}

pub type Result<T> = std::result::Result<T, Error>;
