pub mod autodiff;
pub mod banded;
pub mod config;
pub mod convection_dispersion;
pub mod discretization;
pub mod error;
pub mod exporter;
pub mod inlet;
pub mod jacobian;
pub mod model;
pub mod parameters;
/// The `mct_core` crate implements a multi-channel convection-dispersion
/// transport unit operation for a DAE-based process simulator.
/// The residual is written once, generically over the evaluation type, and
/// instantiated with `f64` for plain evaluation and with Dual numbers for
/// Jacobian and parameter-sensitivity extraction.
///
/// Key components:
/// - **Traits**: `Active` (value with seeded derivative), `UnitOperation` (capability-tagged contract).
/// - **Discretization**: DOF layout and the `Indexer` owning it.
/// - **Transport**: WENO upwinding, Danckwerts boundaries, and inter-channel exchange.
/// - **Model**: residual/Jacobian engine, linear solve, consistent initialization, sensitivities.
/// - **Exporter**: read-only solution views for recording.
pub mod traits;
pub mod weno;

pub use error::ModelError;
pub use model::MultiChannelTransportModel;
