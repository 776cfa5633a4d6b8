//! Error types for the infill decoder, searches and trainers.

use thiserror::Error;

/// Errors that can occur while building or running the decoder.
#[derive(Debug, Error)]
pub enum DecoderError {
    /// Invalid or inconsistent hyperparameters, detected at construction.
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    /// The incremental cache was used out of step order.
    #[error("Cache desync: cache holds {actual} steps but step {expected} was requested")]
    CacheDesync { expected: usize, actual: usize },

    /// Tensor dimensions that must agree did not.
    #[error("Shape mismatch in {context}: {detail}")]
    ShapeMismatch { context: String, detail: String },

    /// A reshape inside a tensor op failed.
    #[error(transparent)]
    Shape(#[from] ndarray::ShapeError),
}

impl DecoderError {
    pub fn shape(context: impl Into<String>, detail: impl Into<String>) -> Self {
        DecoderError::ShapeMismatch {
            context: context.into(),
            detail: detail.into(),
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        DecoderError::Configuration(msg.into())
    }
}

/// Result type for decoder operations.
pub type DecoderResult<T> = Result<T, DecoderError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages() {
        let err = DecoderError::CacheDesync {
            expected: 3,
            actual: 2,
        };
        assert_eq!(
            err.to_string(),
            "Cache desync: cache holds 2 steps but step 3 was requested"
        );

        let err = DecoderError::shape("policy loss", "rewards have 5 steps, logits 4");
        assert!(err.to_string().contains("policy loss"));
    }

    #[test]
    fn test_from_shape_error() {
        let arr = ndarray::Array1::<f32>::zeros(6);
        let res: DecoderResult<_> = arr
            .into_shape_with_order((4, 2))
            .map_err(DecoderError::from);
        assert!(matches!(res, Err(DecoderError::Shape(_))));
    }
}
