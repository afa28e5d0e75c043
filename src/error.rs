//! Error types for the hanzo-hmm crate

use thiserror::Error;

/// Errors that can occur while constructing, training, or running an HMM.
#[derive(Error, Debug)]
pub enum HmmError {
    /// A parameter array's dimensions disagree with N, D, K, or M.
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    /// `start_prob` or a row of `trans_mat`/emission matrix is not a
    /// probability distribution (negative entry, or doesn't sum to 1).
    #[error("not stochastic: {0}")]
    NotStochastic(String),

    /// A covariance matrix is not positive-definite even after flooring
    /// with `min_covar`.
    #[error("covariance is not positive-definite: {0}")]
    NonPositiveDefinite(String),

    /// `lengths` does not partition the observation buffer.
    #[error("lengths partition sums to {actual}, expected {expected}")]
    LengthMismatch { expected: usize, actual: usize },

    /// Inference requested before the model has been fitted or otherwise
    /// given the parameters it needs.
    #[error("model not fitted: {0}")]
    NotFitted(String),

    /// The forward pass assigned zero total probability mass to the
    /// observations (`logsumexp` of the final column is `-inf`).
    #[error("ill-conditioned: model assigns zero probability to the observations ({0})")]
    IllConditioned(String),

    /// An unknown `algorithm`, `covariance_type`, `implementation`, or
    /// `params`/`init_params` letter was supplied.
    #[error("invalid option: {0}")]
    InvalidOption(String),

    /// A `Model`'s parameters failed to round-trip through JSON. Not a
    /// persisted file *format* (that is an explicit non-goal) -- this
    /// only covers the ad-hoc `to_json`/`from_json` convenience a host
    /// application can use to hand parameters to its own storage layer.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias used throughout this crate.
pub type Result<T> = std::result::Result<T, HmmError>;
