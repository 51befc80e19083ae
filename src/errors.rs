//! Error types and validation functions for HMM inference.
//!
//! This module provides error handling for all inference and estimation
//! operations, including parameter validation, dimension checks, and the
//! frame-stack faults raised by the dynamic-programming engine.

use thiserror::Error;

/// Error types for HMM inference and estimation operations.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum HmmError {
    /// Parameter vector rejected by a distribution's validity predicate.
    #[error("Invalid parameters for {family}: {reason}")]
    InvalidParameters {
        /// Distribution family name
        family: String,
        /// Why the parameters were rejected
        reason: String,
    },

    /// Option name not recognised by the distribution family.
    #[error("Unknown option: {name}")]
    UnknownOption {
        /// Option name that was not recognised
        name: String,
    },

    /// Distribution family name not present in the registry.
    #[error("Unknown distribution family: {name}")]
    UnknownFamily {
        /// Family name that was looked up
        name: String,
    },

    /// Buffer or table size does not match the declared dimensions.
    #[error("Dimension mismatch in {context}: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// Operation or structure being validated
        context: String,
        /// Expected element count
        expected: usize,
        /// Actual element count
        actual: usize,
    },

    /// Numerical computation produced a non-finite or inconsistent result.
    #[error("Numerical failure: {reason}")]
    NumericalFailure {
        /// Detailed reason for the failure
        reason: String,
    },

    /// M-step hit its iteration limit without an acceptable candidate.
    ///
    /// Not fatal: the distribution retains its previous parameters and EM
    /// continues.
    #[error("M-step did not converge for state {state_id} slot {slot_id}")]
    NotConverged {
        /// State the distribution is attached to
        state_id: usize,
        /// Emission slot (0 for transitions)
        slot_id: usize,
    },

    /// Fault raised inside a DP sweep, carrying the frame stack for
    /// diagnostics (`"forward" | "backward" | "viterbi" | "em"`).
    #[error("Engine fault [{}]: {source}", .frames.join(" <- "))]
    EngineFault {
        /// Innermost frame first
        frames: Vec<String>,
        /// Underlying failure
        source: Box<HmmError>,
    },
}

impl HmmError {
    /// Wrap (or extend) this error with a DP frame name.
    ///
    /// An existing `EngineFault` grows its stack; any other error becomes
    /// the fault's source.
    pub fn with_frame(self, frame: &str) -> HmmError {
        match self {
            HmmError::EngineFault { mut frames, source } => {
                frames.push(frame.to_string());
                HmmError::EngineFault { frames, source }
            }
            other => HmmError::EngineFault {
                frames: vec![frame.to_string()],
                source: Box::new(other),
            },
        }
    }
}

/// Result type for HMM inference operations.
pub type HmmResult<T> = Result<T, HmmError>;

/// Validates that a flat buffer holds exactly `expected` elements.
pub fn validate_buffer_len(buffer: &[f64], expected: usize, context: &str) -> HmmResult<()> {
    if buffer.len() != expected {
        return Err(HmmError::DimensionMismatch {
            context: context.to_string(),
            expected,
            actual: buffer.len(),
        });
    }
    Ok(())
}

/// Validates that a log-likelihood value is usable (finite or -inf).
///
/// NaN and +inf both indicate a corrupted recurrence and are fatal.
pub fn validate_loglik(value: f64, operation: &str) -> HmmResult<()> {
    if value.is_nan() || value == f64::INFINITY {
        return Err(HmmError::NumericalFailure {
            reason: format!("{} produced non-finite log-likelihood: {}", operation, value),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_stack_grows() {
        let err = HmmError::NumericalFailure {
            reason: "bad".to_string(),
        }
        .with_frame("forward")
        .with_frame("em");

        match err {
            HmmError::EngineFault { frames, .. } => {
                assert_eq!(frames, vec!["forward".to_string(), "em".to_string()]);
            }
            other => panic!("expected EngineFault, got {:?}", other),
        }
    }

    #[test]
    fn test_validate_buffer_len() {
        let buf = vec![0.0; 6];
        assert!(validate_buffer_len(&buf, 6, "test").is_ok());
        assert!(validate_buffer_len(&buf, 8, "test").is_err());
    }

    #[test]
    fn test_validate_loglik() {
        assert!(validate_loglik(-3.5, "forward").is_ok());
        assert!(validate_loglik(f64::NEG_INFINITY, "forward").is_ok());
        assert!(validate_loglik(f64::NAN, "forward").is_err());
        assert!(validate_loglik(f64::INFINITY, "forward").is_err());
    }
}
