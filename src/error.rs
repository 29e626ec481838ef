// error.rs - Error taxonomy for observable construction, propagation and analysis

use thiserror::Error;

/// Fatal errors raised by the propagation core.
///
/// Every variant aborts only the operation that raised it; observables built
/// before the failure are never touched. Windowing problems in the gamma
/// method are not errors, see [`crate::gamma::AutocorrelationWindowWarning`].
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ObsError {
    /// Shared ensemble whose configuration lists cannot be reconciled.
    #[error("configuration mismatch on ensemble '{ensemble}': {detail}")]
    ConfigurationMismatch { ensemble: String, detail: String },

    /// Observables with conflicting `reweighted` (or merge) status were combined.
    #[error("inconsistent flags: {detail}")]
    InconsistentFlags { detail: String },

    /// An operand of the wrong kind was handed to an operation.
    #[error("type mismatch: expected {expected}, found {found}")]
    TypeMismatch { expected: String, found: String },

    /// Raw samples or configuration ids violate the sample store invariants.
    #[error("invalid samples: {detail}")]
    InvalidSamples { detail: String },

    /// Array / matrix arguments with incompatible shapes.
    #[error("shape mismatch: {detail}")]
    ShapeMismatch { detail: String },

    /// The central-value matrix has no inverse.
    #[error("matrix of central values is singular")]
    SingularMatrix,

    /// A numeric parameter lies outside its admissible range.
    #[error("invalid parameter: {detail}")]
    InvalidParameter { detail: String },
}

impl ObsError {
    pub(crate) fn mismatch(ensemble: impl Into<String>, detail: impl Into<String>) -> Self {
        ObsError::ConfigurationMismatch {
            ensemble: ensemble.into(),
            detail: detail.into(),
        }
    }

    pub(crate) fn invalid_samples(detail: impl Into<String>) -> Self {
        ObsError::InvalidSamples {
            detail: detail.into(),
        }
    }

    pub(crate) fn invalid_parameter(detail: impl Into<String>) -> Self {
        ObsError::InvalidParameter {
            detail: detail.into(),
        }
    }

    pub(crate) fn shape(detail: impl Into<String>) -> Self {
        ObsError::ShapeMismatch {
            detail: detail.into(),
        }
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ObsError>;
