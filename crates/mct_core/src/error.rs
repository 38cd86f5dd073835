//! Failure taxonomy of the transport unit operation.

use crate::parameters::ParameterId;
use thiserror::Error;

/// Errors surfaced to the caller of the unit operation.
///
/// Configuration failures abort model construction. Numerical failures are
/// returned to the outer integrator, which decides whether to retry with a
/// smaller step or to abort the simulation.
#[derive(Debug, Error)]
pub enum ModelError {
    /// Malformed or missing configuration value.
    #[error("configuration error: {0:#}")]
    Configuration(#[from] anyhow::Error),

    /// Discretization shape violates its invariants.
    #[error("invalid discretization: {0}")]
    InvalidDiscretization(String),

    /// Array or buffer length does not match the model layout.
    #[error("dimension mismatch for {what}: expected {expected}, got {actual}")]
    DimensionMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    /// Newton iteration of the consistent initialization did not converge.
    #[error(
        "consistent initialization did not converge in {iterations} iterations (‖F‖ = {residual_norm:e})"
    )]
    InitializationFailed {
        iterations: usize,
        residual_norm: f64,
    },

    #[error("Jacobian is singular")]
    SingularJacobian,

    /// A Jacobian entry evaluated to NaN or infinity.
    #[error("non-finite Jacobian entry at ({row}, {col})")]
    NonFiniteJacobian { row: usize, col: usize },

    #[error("parameter {0:?} does not address any model quantity")]
    UnknownParameter(ParameterId),

    #[error("capability not supported: {0}")]
    Unsupported(&'static str),
}

impl ModelError {
    pub fn dimension_mismatch(what: &'static str, expected: usize, actual: usize) -> Self {
        Self::DimensionMismatch {
            what,
            expected,
            actual,
        }
    }

    /// Whether the outer integrator may recover by reducing its step size.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::InitializationFailed { .. } | Self::SingularJacobian | Self::NonFiniteJacobian { .. }
        )
    }
}
