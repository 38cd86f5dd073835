use crate::error::ModelError;
use crate::exporter::SolutionRecorder;
use num_traits::{Float, FromPrimitive};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

/// A trait for types that can be used as scalars in the transport formulas.
/// Must support basic arithmetic, debug printing, and conversion from f64.
pub trait Scalar: Float + FromPrimitive + Debug + 'static {}

impl<T: Float + FromPrimitive + Debug + 'static> Scalar for T {}

/// Evaluation type of the residual kernel: a scalar that may carry one
/// seeded directional derivative alongside its value.
///
/// `f64` drops the derivative, [`crate::autodiff::Dual`] keeps it.
pub trait Active: Scalar {
    fn seeded(value: f64, derivative: f64) -> Self;
    fn value(&self) -> f64;
    fn derivative(&self) -> f64;

    #[inline]
    fn constant(value: f64) -> Self {
        Self::seeded(value, 0.0)
    }
}

impl Active for f64 {
    #[inline]
    fn seeded(value: f64, _derivative: f64) -> Self {
        value
    }

    #[inline]
    fn value(&self) -> f64 {
        *self
    }

    #[inline]
    fn derivative(&self) -> f64 {
        0.0
    }
}

/// Time point together with the index of the active section.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SimulationTime {
    pub t: f64,
    pub sec_idx: usize,
}

impl SimulationTime {
    pub fn new(t: f64, sec_idx: usize) -> Self {
        Self { t, sec_idx }
    }
}

/// Read-only view of a state vector and its time derivative.
#[derive(Debug, Clone, Copy)]
pub struct SimulationState<'a> {
    pub y: &'a [f64],
    pub y_dot: &'a [f64],
}

impl<'a> SimulationState<'a> {
    pub fn new(y: &'a [f64], y_dot: &'a [f64]) -> Self {
        Self { y, y_dot }
    }
}

/// Optional capabilities a unit operation may advertise.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub forward_sensitivities: bool,
    pub lean_initialization: bool,
    pub analytic_jacobian: bool,
}

/// Scratch memory owned by the caller and handed to every evaluation.
///
/// Each worker thread keeps its own instance; evaluation entry points never
/// touch storage shared between threads.
#[derive(Debug, Clone, Default)]
pub struct Scratch {
    pub(crate) dual_state: Vec<crate::autodiff::Dual>,
    pub(crate) dual_res: Vec<crate::autodiff::Dual>,
    pub(crate) real: Vec<f64>,
}

impl Scratch {
    pub fn new(size: usize) -> Self {
        let mut scratch = Self::default();
        scratch.ensure(size);
        scratch
    }

    pub fn ensure(&mut self, size: usize) {
        if self.real.len() < size {
            self.dual_state.resize(size, Default::default());
            self.dual_res.resize(size, Default::default());
            self.real.resize(size, 0.0);
        }
    }
}

/// Contract between a unit operation and the layers driving it: the system of
/// unit operations wiring ports together, the time integrator, and solution
/// recording.
///
/// Capabilities a model lacks fall back to the default implementations below;
/// callers consult [`UnitOperation::capabilities`] instead of probing types.
pub trait UnitOperation {
    fn unit_operation_name(&self) -> &'static str;
    fn unit_operation_id(&self) -> usize;
    fn capabilities(&self) -> Capabilities;

    /// Number of scalar unknowns, inlet DOFs included.
    fn num_dofs(&self) -> usize;
    /// Number of unknowns excluding inlet DOFs.
    fn num_pure_dofs(&self) -> usize;
    fn num_components(&self) -> usize;
    fn num_inlet_ports(&self) -> usize;
    fn num_outlet_ports(&self) -> usize;

    fn local_inlet_component_index(&self, port: usize) -> usize;
    fn local_inlet_component_stride(&self, port: usize) -> usize;
    fn local_outlet_component_index(&self, port: usize) -> usize;
    fn local_outlet_component_stride(&self, port: usize) -> usize;

    fn create_scratch(&self) -> Scratch {
        Scratch::new(self.num_dofs())
    }

    /// Latches flow directions and invalidates the factorized Jacobian.
    fn notify_discontinuous_section_transition(&mut self, t: f64, sec_idx: usize);

    fn residual(
        &self,
        time: SimulationTime,
        state: SimulationState<'_>,
        res: &mut [f64],
        scratch: &mut Scratch,
    ) -> Result<(), ModelError>;

    fn residual_with_jacobian(
        &mut self,
        time: SimulationTime,
        state: SimulationState<'_>,
        res: &mut [f64],
        scratch: &mut Scratch,
    ) -> Result<(), ModelError>;

    /// Solves `(∂F/∂y + alpha·∂F/∂ẏ) x = rhs` in place.
    fn linear_solve(
        &mut self,
        t: f64,
        alpha: f64,
        tol: f64,
        rhs: &mut [f64],
        weight: &[f64],
    ) -> Result<(), ModelError>;

    fn consistent_initial_state(
        &mut self,
        time: SimulationTime,
        y: &mut [f64],
        error_tol: f64,
        scratch: &mut Scratch,
    ) -> Result<(), ModelError>;

    fn consistent_initial_time_derivative(
        &mut self,
        time: SimulationTime,
        y: &[f64],
        y_dot: &mut [f64],
        scratch: &mut Scratch,
    ) -> Result<(), ModelError>;

    fn lean_consistent_initial_state(
        &mut self,
        time: SimulationTime,
        y: &mut [f64],
        error_tol: f64,
        scratch: &mut Scratch,
    ) -> Result<(), ModelError> {
        self.consistent_initial_state(time, y, error_tol, scratch)
    }

    fn lean_consistent_initial_time_derivative(
        &mut self,
        time: SimulationTime,
        y: &[f64],
        y_dot: &mut [f64],
        scratch: &mut Scratch,
    ) -> Result<(), ModelError> {
        self.consistent_initial_time_derivative(time, y, y_dot, scratch)
    }

    fn num_sens_directions(&self) -> usize {
        0
    }

    /// Writes `∂F/∂p` for every sensitive direction.
    fn residual_sens_fwd_ad_only(
        &self,
        _time: SimulationTime,
        _state: SimulationState<'_>,
        _param_derivs: &mut [Vec<f64>],
        _scratch: &mut Scratch,
    ) -> Result<(), ModelError> {
        Err(ModelError::Unsupported("forward sensitivities"))
    }

    fn residual_sens_fwd_combine(
        &self,
        _y_s: &[Vec<f64>],
        _y_s_dot: &[Vec<f64>],
        _param_derivs: &[Vec<f64>],
        _res_s: &mut [Vec<f64>],
    ) -> Result<(), ModelError> {
        Err(ModelError::Unsupported("forward sensitivities"))
    }

    fn initialize_sensitivity_states(&self, y_s: &mut [Vec<f64>]) {
        for dir in y_s {
            dir.iter_mut().for_each(|v| *v = 0.0);
        }
    }

    fn consistent_initial_sensitivity(
        &mut self,
        _time: SimulationTime,
        _state: SimulationState<'_>,
        _y_s: &mut [Vec<f64>],
        _y_s_dot: &mut [Vec<f64>],
        _param_derivs: &[Vec<f64>],
        _scratch: &mut Scratch,
    ) -> Result<(), ModelError> {
        Err(ModelError::Unsupported("forward sensitivities"))
    }

    fn lean_consistent_initial_sensitivity(
        &mut self,
        time: SimulationTime,
        state: SimulationState<'_>,
        y_s: &mut [Vec<f64>],
        y_s_dot: &mut [Vec<f64>],
        param_derivs: &[Vec<f64>],
        scratch: &mut Scratch,
    ) -> Result<(), ModelError> {
        self.consistent_initial_sensitivity(time, state, y_s, y_s_dot, param_derivs, scratch)
    }

    fn report_solution_structure(&self, recorder: &mut dyn SolutionRecorder);
    fn report_solution(&self, recorder: &mut dyn SolutionRecorder, solution: &[f64]);
}
