//! Multi-channel transport unit operation.
//!
//! DOFs are the inlet concentrations of every channel (algebraic, pinned to
//! the inlet profile) followed by the bulk concentrations (differential).
//! The Jacobian comes either from hand-derived formulas or from dual-number
//! evaluation of the generic residual, as chosen at configuration time.

use crate::autodiff::Dual;
use crate::config::ParameterProvider;
use crate::convection_dispersion::{MultiChannelConvectionDispersionOperator, TransportCoefficients};
use crate::discretization::{Discretization, Dof, Indexer};
use crate::error::ModelError;
use crate::exporter::{Exporter, SolutionRecorder, SolutionStructure};
use crate::inlet::{CubicSection, InletProfile};
use crate::jacobian::SparseJacobian;
use crate::parameters::{ModelParameters, ParameterId};
use crate::traits::{
    Active, Capabilities, Scratch, SimulationState, SimulationTime, UnitOperation,
};
use crate::weno::{BoundaryModel, WenoSettings};
use anyhow::Context;
use log::{debug, trace, warn};
use nalgebra::DVector;
use serde::{Deserialize, Serialize};
use std::ops::Range;

pub const UNIT_OPERATION_NAME: &str = "MULTI_CHANNEL_TRANSPORT";

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct NewtonSettings {
    pub max_steps: usize,
    pub damping: f64,
}

impl Default for NewtonSettings {
    fn default() -> Self {
        Self {
            max_steps: 25,
            damping: 1.0,
        }
    }
}

#[derive(Debug)]
pub struct MultiChannelTransportModel {
    unit_op_idx: usize,
    disc: Discretization,
    conv_disp_op: MultiChannelConvectionDispersionOperator,
    params: ModelParameters,
    /// Flow rates taking effect at the next section transition.
    pending_flow_rates: Vec<f64>,
    section_times: Vec<f64>,
    jacobian: SparseJacobian,
    analytic_jacobian: bool,
    init_state: Option<Vec<f64>>,
    init_state_dot: Option<Vec<f64>>,
    newton: NewtonSettings,
}

struct Layout {
    n_comp: usize,
    n_col: usize,
    n_channel: usize,
    weno: WenoSettings,
    analytic_jacobian: bool,
}

fn read_layout(provider: &mut dyn ParameterProvider) -> anyhow::Result<Layout> {
    let n_comp = provider.get_usize("NCOMP")?;
    provider.push_scope("discretization")?;
    let n_col = provider.get_usize("NCOL")?;
    let n_channel = provider.get_usize("NCHANNEL")?;
    let analytic_jacobian = if provider.exists("USE_ANALYTIC_JACOBIAN") {
        provider.get_bool("USE_ANALYTIC_JACOBIAN")?
    } else {
        false
    };

    let mut weno = WenoSettings::default();
    if provider.exists("weno") {
        provider.push_scope("weno")?;
        if provider.exists("WENO_ORDER") {
            weno.order = provider.get_usize("WENO_ORDER")?;
        }
        if provider.exists("WENO_EPS") {
            weno.eps = provider.get_double("WENO_EPS")?;
        }
        if provider.exists("BOUNDARY_MODEL") {
            let code = provider.get_int("BOUNDARY_MODEL")?;
            weno.boundary_model = BoundaryModel::from_code(code)
                .with_context(|| format!("Unsupported WENO boundary model {code}."))?;
        }
        provider.pop_scope()?;
    }
    provider.pop_scope()?;

    weno.validate()?;

    Ok(Layout {
        n_comp,
        n_col,
        n_channel,
        weno,
        analytic_jacobian,
    })
}

/// Reads a per-entry array that may be given once for all channels.
fn read_per_channel(
    provider: &dyn ParameterProvider,
    name: &'static str,
    n_comp: usize,
    n_channel: usize,
    allow_scalar: bool,
) -> Result<Vec<f64>, ModelError> {
    let values = provider.get_double_array(name)?;
    let full = n_comp * n_channel;
    match values.len() {
        len if len == full => Ok(values),
        len if len == n_comp => Ok(values.repeat(n_channel)),
        1 if allow_scalar => Ok(vec![values[0]; full]),
        len => Err(ModelError::dimension_mismatch(name, full, len)),
    }
}

fn read_exact(
    provider: &dyn ParameterProvider,
    name: &'static str,
    expected: usize,
) -> Result<Vec<f64>, ModelError> {
    let values = provider.get_double_array(name)?;
    if values.len() != expected {
        return Err(ModelError::dimension_mismatch(name, expected, values.len()));
    }
    Ok(values)
}

fn read_inlet_profile(
    provider: &mut dyn ParameterProvider,
    n_comp: usize,
    n_channel: usize,
) -> Result<InletProfile, ModelError> {
    const KEYS: [&str; 4] = ["CONST_COEFF", "LIN_COEFF", "QUAD_COEFF", "CUBE_COEFF"];
    let entries = n_comp * n_channel;
    let mut sections = Vec::new();
    loop {
        let scope = format!("sec_{:03}", sections.len());
        if !provider.exists(&scope) {
            break;
        }
        provider.push_scope(&scope)?;
        let mut coeffs: [Vec<f64>; 4] = Default::default();
        for (degree, key) in KEYS.into_iter().enumerate() {
            coeffs[degree] = if provider.exists(key) {
                read_per_channel(provider, key, n_comp, n_channel, false)?
            } else {
                vec![0.0; entries]
            };
        }
        provider.pop_scope()?;
        sections.push(CubicSection { coeffs });
    }
    Ok(InletProfile::new(entries, sections))
}

fn l2_norm(values: &[f64]) -> f64 {
    values.iter().map(|v| v * v).sum::<f64>().sqrt()
}

fn check_len(what: &'static str, expected: usize, actual: usize) -> Result<(), ModelError> {
    if actual < expected {
        return Err(ModelError::dimension_mismatch(what, expected, actual));
    }
    Ok(())
}

impl MultiChannelTransportModel {
    /// Creates a model with default parameters: unit column length and
    /// cross sections, no flow, no dispersion, no exchange.
    pub fn new(
        unit_op_idx: usize,
        disc: Discretization,
        weno: WenoSettings,
    ) -> Result<Self, ModelError> {
        weno.validate()?;
        let conv_disp_op = MultiChannelConvectionDispersionOperator::new(disc, weno);
        let jacobian = SparseJacobian::new(&disc, conv_disp_op.stencil_width())?;
        let params = ModelParameters::new(disc.n_comp, disc.n_channel);
        Ok(Self {
            unit_op_idx,
            disc,
            conv_disp_op,
            pending_flow_rates: params.flow_rates.clone(),
            params,
            section_times: Vec::new(),
            jacobian,
            analytic_jacobian: false,
            init_state: None,
            init_state_dot: None,
            newton: NewtonSettings::default(),
        })
    }

    /// Builds the model from a configuration scope.
    pub fn configure(
        unit_op_idx: usize,
        provider: &mut dyn ParameterProvider,
    ) -> Result<Self, ModelError> {
        let layout = read_layout(provider)?;
        let disc = Discretization::new(layout.n_comp, layout.n_col, layout.n_channel)?;
        let mut model = Self::new(unit_op_idx, disc, layout.weno)?;
        model.analytic_jacobian = layout.analytic_jacobian;
        model.read_parameters(provider)?;

        debug!(
            "configured {} #{}: {} components, {} cells, {} channels, WENO order {}, {} Jacobian, {} DOFs",
            UNIT_OPERATION_NAME,
            unit_op_idx,
            disc.n_comp,
            disc.n_col,
            disc.n_channel,
            layout.weno.order,
            if model.analytic_jacobian { "analytic" } else { "AD" },
            disc.num_dofs()
        );
        Ok(model)
    }

    fn read_parameters(&mut self, provider: &mut dyn ParameterProvider) -> Result<(), ModelError> {
        let Discretization {
            n_comp, n_channel, ..
        } = self.disc;

        let col_length = provider.get_double("COL_LENGTH")?;
        if col_length <= 0.0 {
            return Err(anyhow::anyhow!("COL_LENGTH must be positive, got {col_length}.").into());
        }
        self.params.col_length = col_length;

        let areas = read_exact(provider, "CHANNEL_CROSS_SECTION_AREAS", n_channel)?;
        if let Some(bad) = areas.iter().position(|a| *a <= 0.0) {
            return Err(anyhow::anyhow!("Cross section area of channel {bad} must be positive.").into());
        }
        self.params.cross_sections = areas;
        self.params.dispersion = read_per_channel(provider, "COL_DISPERSION", n_comp, n_channel, true)?;
        self.params.exchange = read_exact(provider, "EXCHANGE_MATRIX", n_channel * n_channel * n_comp)?;
        self.params.init_c = read_per_channel(provider, "INIT_C", n_comp, n_channel, false)?;

        if provider.exists("FLOW_RATE") {
            let rates = read_exact(provider, "FLOW_RATE", n_channel)?;
            self.set_flow_rates(&rates)?;
            self.latch_flow();
        }

        if provider.exists("INIT_STATE") {
            let state = provider.get_double_array("INIT_STATE")?;
            let n = self.disc.num_dofs();
            match state.len() {
                len if len == n => self.init_state = Some(state),
                len if len == 2 * n => {
                    self.init_state_dot = Some(state[n..].to_vec());
                    self.init_state = Some(state[..n].to_vec());
                }
                len => return Err(ModelError::dimension_mismatch("INIT_STATE", n, len)),
            }
        }

        if provider.exists("inlet") {
            provider.push_scope("inlet")?;
            let profile = read_inlet_profile(provider, n_comp, n_channel);
            provider.pop_scope()?;
            self.params.inlet = profile?;
        }
        Ok(())
    }

    pub fn discretization(&self) -> &Discretization {
        &self.disc
    }

    pub fn indexer(&self) -> Indexer {
        self.disc.indexer()
    }

    pub fn parameters(&self) -> &ModelParameters {
        &self.params
    }

    pub fn operator(&self) -> &MultiChannelConvectionDispersionOperator {
        &self.conv_disp_op
    }

    pub fn jacobian(&self) -> &SparseJacobian {
        &self.jacobian
    }

    pub fn use_analytic_jacobian(&mut self, analytic: bool) {
        if self.analytic_jacobian != analytic {
            self.analytic_jacobian = analytic;
            self.jacobian.mark_stale();
        }
    }

    pub fn uses_ad(&self) -> bool {
        !self.analytic_jacobian
    }

    /// Number of directions seeded per Jacobian evaluation.
    pub fn required_ad_dirs(&self) -> usize {
        if self.uses_ad() {
            self.jacobian.num_colors()
        } else {
            0
        }
    }

    pub fn set_newton_settings(&mut self, settings: NewtonSettings) {
        self.newton = settings;
    }

    pub fn set_inlet_profile(&mut self, profile: InletProfile) -> Result<(), ModelError> {
        let expected = self.disc.num_inlet_dofs();
        if profile.num_entries() != expected {
            return Err(ModelError::dimension_mismatch(
                "inlet profile",
                expected,
                profile.num_entries(),
            ));
        }
        self.params.inlet = profile;
        Ok(())
    }

    /// Start times of the sections; inlet profiles are evaluated in time
    /// relative to the start of the active section.
    pub fn set_section_times(&mut self, times: &[f64]) {
        self.section_times = times.to_vec();
    }

    /// Stores flow rates that take effect at the next section transition.
    pub fn set_flow_rates(&mut self, rates: &[f64]) -> Result<(), ModelError> {
        if rates.len() != self.disc.n_channel {
            return Err(ModelError::dimension_mismatch(
                "flow rates",
                self.disc.n_channel,
                rates.len(),
            ));
        }
        self.pending_flow_rates.copy_from_slice(rates);
        Ok(())
    }

    fn latch_flow(&mut self) {
        self.params.flow_rates.copy_from_slice(&self.pending_flow_rates);
        let velocity: Vec<f64> = self
            .params
            .flow_rates
            .iter()
            .zip(&self.params.cross_sections)
            .map(|(q, a)| q / a)
            .collect();
        self.conv_disp_op.set_flow_state(&velocity);
    }

    /// Sets every quantity addressed by `id`. Flow rates are staged like
    /// [`Self::set_flow_rates`] and take effect at the next section transition.
    pub fn set_parameter(&mut self, id: ParameterId, value: f64) -> Result<(), ModelError> {
        if let ParameterId::FlowRate { channel } = id {
            let mut hit = false;
            for (ch, q) in self.pending_flow_rates.iter_mut().enumerate() {
                if channel.map_or(true, |c| c == ch) {
                    *q = value;
                    hit = true;
                }
            }
            if !hit {
                return Err(ModelError::UnknownParameter(id));
            }
            return Ok(());
        }
        if !self.params.set(&id, value) {
            return Err(ModelError::UnknownParameter(id));
        }
        self.jacobian.mark_stale();
        Ok(())
    }

    /// Registers `id` as sensitive in `direction` with derivative seed `seed`.
    pub fn set_sensitive_parameter(
        &mut self,
        id: ParameterId,
        direction: usize,
        seed: f64,
    ) -> Result<(), ModelError> {
        if !self.params.addresses_any(&id) {
            return Err(ModelError::UnknownParameter(id));
        }
        let before = self.params.num_directions();
        self.params.add_sensitive(id, direction, seed);
        if self.params.num_directions() != before {
            self.jacobian.mark_stale();
        }
        Ok(())
    }

    /// Updates the value of a parameter previously registered as sensitive.
    pub fn set_sensitive_parameter_value(
        &mut self,
        id: ParameterId,
        value: f64,
    ) -> Result<(), ModelError> {
        if !self.params.sensitive().iter().any(|s| s.id == id) {
            return Err(ModelError::UnknownParameter(id));
        }
        self.set_parameter(id, value)
    }

    pub fn clear_sensitive_parameters(&mut self) {
        if self.params.num_directions() != 0 {
            self.jacobian.mark_stale();
        }
        self.params.clear_sensitive();
    }

    fn inlet_rows(&self) -> Range<usize> {
        let idx = self.disc.indexer();
        idx.offset_inlet()..idx.offset_c()
    }

    fn bulk_rows(&self) -> Range<usize> {
        self.disc.indexer().offset_c()..self.disc.num_dofs()
    }

    fn section_tau(&self, time: SimulationTime) -> f64 {
        time.t - self.section_times.get(time.sec_idx).copied().unwrap_or(0.0)
    }

    /// Full residual in evaluation type `T`. Inlet rows read `y_in - c_in(t)`.
    fn residual_impl<T: Active>(
        &self,
        coeffs: &TransportCoefficients<T>,
        time: SimulationTime,
        y: &[T],
        y_dot: Option<&[f64]>,
        res: &mut [T],
        direction: Option<usize>,
    ) {
        let inlet = self.inlet_rows();
        let tau = self.section_tau(time);
        self.params
            .inlet_values(time.sec_idx, tau, direction, &mut res[inlet.clone()]);
        for i in inlet {
            res[i] = y[i] - res[i];
        }
        self.conv_disp_op.residual(coeffs, y, y_dot, res);
    }

    fn check_state(&self, state: &SimulationState<'_>, res_len: usize) -> Result<(), ModelError> {
        let n = self.disc.num_dofs();
        check_len("state", n, state.y.len())?;
        check_len("state derivative", n, state.y_dot.len())?;
        check_len("residual", n, res_len)
    }

    /// Evaluates the residual once per seed color and harvests the Jacobian.
    fn residual_with_ad_jacobian(
        &mut self,
        time: SimulationTime,
        state: SimulationState<'_>,
        res: &mut [f64],
        scratch: &mut Scratch,
    ) -> Result<(), ModelError> {
        let n = self.disc.num_dofs();
        scratch.ensure(n);
        let Scratch {
            dual_state,
            dual_res,
            real: seeds,
            ..
        } = scratch;
        let coeffs = self.params.coefficients::<Dual>(None);

        for color in 0..self.jacobian.num_colors() {
            self.jacobian.seed_vector(color, &mut seeds[..n]);
            for ((d, y), s) in dual_state[..n].iter_mut().zip(state.y).zip(&seeds[..n]) {
                *d = Dual::new(*y, *s);
            }
            self.residual_impl(
                &coeffs,
                time,
                &dual_state[..n],
                Some(state.y_dot),
                &mut dual_res[..n],
                None,
            );
            if color == 0 {
                for (r, d) in res[..n].iter_mut().zip(&dual_res[..n]) {
                    *r = d.val;
                }
            }
            self.jacobian.harvest(color, &dual_res[..n]);
        }
        Ok(())
    }

    fn assemble_analytic_jacobian(&mut self, y: &[f64]) {
        let coeffs = self.params.coefficients::<f64>(None);
        let inlet = self.inlet_rows();
        self.jacobian.reset();
        self.jacobian.set_identity_rows(inlet);
        self.conv_disp_op
            .assemble_jacobian(&coeffs, y, &mut self.jacobian);
    }

    /// `ret = alpha·J·x + beta·ret` with the Jacobian of the last evaluation.
    pub fn multiply_with_jacobian(&self, x: &[f64], alpha: f64, beta: f64, ret: &mut [f64]) {
        self.jacobian.multiply(x, alpha, beta, ret);
    }

    /// `ret = ∂F/∂ẏ · x`
    pub fn multiply_with_derivative_jacobian(&self, x: &[f64], ret: &mut [f64]) {
        self.jacobian.multiply_derivative(x, ret);
    }

    /// Maximum deviation `|J_analytic - J_ad| / (1 + |J_ad|)` over all entries
    /// at the given state. The configured Jacobian path is left unchanged.
    pub fn check_analytic_jacobian_against_ad(
        &mut self,
        time: SimulationTime,
        state: SimulationState<'_>,
        scratch: &mut Scratch,
    ) -> Result<f64, ModelError> {
        let mut res = vec![0.0; self.disc.num_dofs()];
        self.check_state(&state, res.len())?;
        self.residual_with_ad_jacobian(time, state, &mut res, scratch)?;
        let ad = self.jacobian.to_dense();
        self.assemble_analytic_jacobian(state.y);
        let analytic = self.jacobian.to_dense();

        let deviation = analytic
            .iter()
            .zip(ad.iter())
            .map(|(a, b)| (a - b).abs() / (1.0 + b.abs()))
            .fold(0.0, f64::max);
        debug!("analytic vs AD Jacobian: max deviation {deviation:e}");

        if self.uses_ad() {
            self.residual_with_ad_jacobian(time, state, &mut res, scratch)?;
        }
        Ok(deviation)
    }

    /// Writes the configured initial condition into `y` and `y_dot`.
    pub fn apply_initial_condition(&self, y: &mut [f64], y_dot: &mut [f64]) -> Result<(), ModelError> {
        let n = self.disc.num_dofs();
        check_len("state", n, y.len())?;
        check_len("state derivative", n, y_dot.len())?;
        y_dot[..n].iter_mut().for_each(|v| *v = 0.0);

        if let Some(state) = &self.init_state {
            y[..n].copy_from_slice(state);
            if let Some(state_dot) = &self.init_state_dot {
                y_dot[..n].copy_from_slice(state_dot);
            }
            return Ok(());
        }

        let idx = self.disc.indexer();
        y[self.inlet_rows()].iter_mut().for_each(|v| *v = 0.0);
        for cell in 0..self.disc.n_col {
            for ch in 0..self.disc.n_channel {
                for comp in 0..self.disc.n_comp {
                    y[idx.c(cell, ch, comp)] = self.params.init_c[self.params.entry(ch, comp)];
                }
            }
        }
        Ok(())
    }

    /// Expands a per-component tolerance (or a single value) to every DOF.
    pub fn expand_error_tol(&self, error_spec: &[f64]) -> Vec<f64> {
        let idx = self.disc.indexer();
        (0..self.disc.num_dofs())
            .map(|dof| {
                let comp = match idx.decompose(dof) {
                    Dof::Inlet { comp, .. } | Dof::Bulk { comp, .. } => comp,
                };
                error_spec
                    .get(comp)
                    .or_else(|| error_spec.first())
                    .copied()
                    .unwrap_or(0.0)
            })
            .collect()
    }

    /// [`UnitOperation::residual_sens_fwd_ad_only`] preceded by a Jacobian
    /// refresh at the same state.
    pub fn residual_sens_fwd_with_jacobian(
        &mut self,
        time: SimulationTime,
        state: SimulationState<'_>,
        res: &mut [f64],
        param_derivs: &mut [Vec<f64>],
        scratch: &mut Scratch,
    ) -> Result<(), ModelError> {
        self.residual_with_jacobian(time, state, res, scratch)?;
        self.residual_sens_fwd_ad_only(time, state, param_derivs, scratch)
    }

    /// Solves the sensitivity systems of all directions in place with the
    /// factorization of the current iteration matrix.
    pub fn solve_sensitivities(
        &mut self,
        t: f64,
        alpha: f64,
        tol: f64,
        rhs: &mut [Vec<f64>],
        weight: &[f64],
    ) -> Result<(), ModelError> {
        for dir in rhs.iter_mut() {
            self.linear_solve(t, alpha, tol, dir, weight)?;
        }
        Ok(())
    }

    pub fn exporter<'a>(&'a self, data: &'a [f64]) -> Exporter<'a> {
        Exporter::new(
            self.disc,
            self.conv_disp_op.flow_directions(),
            self.params.col_length,
            data,
        )
    }

    /// Time derivative of the inlet profile in `direction`'s seed.
    fn inlet_slope_sensitivity(&self, time: SimulationTime, direction: usize, out: &mut [f64]) {
        let mut slopes = vec![Dual::default(); out.len()];
        self.params
            .inlet_slopes(time.sec_idx, self.section_tau(time), Some(direction), &mut slopes);
        for (o, s) in out.iter_mut().zip(&slopes) {
            *o = s.eps;
        }
    }
}

impl UnitOperation for MultiChannelTransportModel {
    fn unit_operation_name(&self) -> &'static str {
        UNIT_OPERATION_NAME
    }

    fn unit_operation_id(&self) -> usize {
        self.unit_op_idx
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            forward_sensitivities: true,
            lean_initialization: true,
            analytic_jacobian: true,
        }
    }

    fn num_dofs(&self) -> usize {
        self.disc.num_dofs()
    }

    fn num_pure_dofs(&self) -> usize {
        self.disc.num_bulk_dofs()
    }

    fn num_components(&self) -> usize {
        self.disc.n_comp
    }

    fn num_inlet_ports(&self) -> usize {
        self.disc.n_channel
    }

    fn num_outlet_ports(&self) -> usize {
        self.disc.n_channel
    }

    fn local_inlet_component_index(&self, port: usize) -> usize {
        self.disc.indexer().inlet(port, 0)
    }

    fn local_inlet_component_stride(&self, _port: usize) -> usize {
        self.disc.indexer().stride_comp()
    }

    fn local_outlet_component_index(&self, port: usize) -> usize {
        self.disc
            .indexer()
            .c(self.conv_disp_op.outflow_cell(port), port, 0)
    }

    fn local_outlet_component_stride(&self, _port: usize) -> usize {
        self.disc.indexer().stride_comp()
    }

    fn notify_discontinuous_section_transition(&mut self, t: f64, sec_idx: usize) {
        self.latch_flow();
        self.jacobian.mark_stale();
        debug!(
            "section {sec_idx} at t = {t}: velocities {:?}",
            (0..self.disc.n_channel)
                .map(|ch| self.conv_disp_op.current_velocity(ch))
                .collect::<Vec<_>>()
        );
    }

    fn residual(
        &self,
        time: SimulationTime,
        state: SimulationState<'_>,
        res: &mut [f64],
        _scratch: &mut Scratch,
    ) -> Result<(), ModelError> {
        self.check_state(&state, res.len())?;
        let coeffs = self.params.coefficients::<f64>(None);
        self.residual_impl(&coeffs, time, state.y, Some(state.y_dot), res, None);
        Ok(())
    }

    fn residual_with_jacobian(
        &mut self,
        time: SimulationTime,
        state: SimulationState<'_>,
        res: &mut [f64],
        scratch: &mut Scratch,
    ) -> Result<(), ModelError> {
        self.check_state(&state, res.len())?;
        if self.analytic_jacobian {
            self.residual(time, state, res, scratch)?;
            self.assemble_analytic_jacobian(state.y);
        } else {
            self.residual_with_ad_jacobian(time, state, res, scratch)?;
        }
        self.jacobian.check_finite()
    }

    fn linear_solve(
        &mut self,
        _t: f64,
        alpha: f64,
        tol: f64,
        rhs: &mut [f64],
        weight: &[f64],
    ) -> Result<(), ModelError> {
        check_len("right hand side", self.disc.num_dofs(), rhs.len())?;
        self.jacobian.solve_refined(alpha, tol, rhs, weight)
    }

    /// Newton iteration on the inlet rows with the bulk held fixed.
    fn consistent_initial_state(
        &mut self,
        time: SimulationTime,
        y: &mut [f64],
        error_tol: f64,
        scratch: &mut Scratch,
    ) -> Result<(), ModelError> {
        let n = self.disc.num_dofs();
        check_len("state", n, y.len())?;
        let alg: Vec<usize> = self.inlet_rows().collect();
        let y_dot = vec![0.0; n];
        let mut res = vec![0.0; n];
        let mut alg_res = vec![0.0; alg.len()];
        let mut iterations = 0usize;

        loop {
            self.residual_with_jacobian(time, SimulationState::new(y, &y_dot), &mut res, scratch)?;
            for (r, &i) in alg_res.iter_mut().zip(&alg) {
                *r = res[i];
            }
            let residual_norm = l2_norm(&alg_res);
            trace!("consistent init iteration {iterations}: ‖F_alg‖ = {residual_norm:e}");
            if residual_norm <= error_tol {
                return Ok(());
            }
            if iterations >= self.newton.max_steps {
                warn!(
                    "consistent initialization did not converge in {iterations} iterations (‖F_alg‖ = {residual_norm:e})"
                );
                return Err(ModelError::InitializationFailed {
                    iterations,
                    residual_norm,
                });
            }

            let block = self.jacobian.submatrix(&alg, &alg);
            let delta = block
                .lu()
                .solve(&DVector::from_column_slice(&alg_res))
                .ok_or(ModelError::SingularJacobian)?;
            for (k, &i) in alg.iter().enumerate() {
                y[i] -= self.newton.damping * delta[k];
            }
            iterations += 1;
        }
    }

    fn consistent_initial_time_derivative(
        &mut self,
        time: SimulationTime,
        y: &[f64],
        y_dot: &mut [f64],
        scratch: &mut Scratch,
    ) -> Result<(), ModelError> {
        check_len("state derivative", self.disc.num_dofs(), y_dot.len())?;
        let inlet = self.inlet_rows();
        self.params.inlet_slopes(
            time.sec_idx,
            self.section_tau(time),
            None,
            &mut y_dot[inlet],
        );
        self.lean_consistent_initial_time_derivative(time, y, y_dot, scratch)
    }

    /// Inlet rows are affine with unit slope, so they are set directly.
    fn lean_consistent_initial_state(
        &mut self,
        time: SimulationTime,
        y: &mut [f64],
        _error_tol: f64,
        _scratch: &mut Scratch,
    ) -> Result<(), ModelError> {
        check_len("state", self.disc.num_dofs(), y.len())?;
        let inlet = self.inlet_rows();
        let tau = self.section_tau(time);
        self.params
            .inlet_values(time.sec_idx, tau, None, &mut y[inlet]);
        Ok(())
    }

    /// Solves the bulk derivatives from `ẏ_bulk = -F_bulk(y, 0)`; inlet
    /// derivatives are left as they are.
    fn lean_consistent_initial_time_derivative(
        &mut self,
        time: SimulationTime,
        y: &[f64],
        y_dot: &mut [f64],
        scratch: &mut Scratch,
    ) -> Result<(), ModelError> {
        let n = self.disc.num_dofs();
        check_len("state derivative", n, y_dot.len())?;
        let zeros = vec![0.0; n];
        let mut res = vec![0.0; n];
        self.residual(time, SimulationState::new(y, &zeros), &mut res, scratch)?;
        for i in self.bulk_rows() {
            y_dot[i] = -res[i];
        }
        Ok(())
    }

    fn num_sens_directions(&self) -> usize {
        self.params.num_directions()
    }

    fn residual_sens_fwd_ad_only(
        &self,
        time: SimulationTime,
        state: SimulationState<'_>,
        param_derivs: &mut [Vec<f64>],
        scratch: &mut Scratch,
    ) -> Result<(), ModelError> {
        let n = self.disc.num_dofs();
        let n_dirs = self.num_sens_directions();
        check_len("sensitivity directions", n_dirs, param_derivs.len())?;
        self.check_state(&state, n)?;
        scratch.ensure(n);

        for (d, y) in scratch.dual_state[..n].iter_mut().zip(state.y) {
            *d = Dual::constant(*y);
        }
        for (dir, out) in param_derivs.iter_mut().enumerate().take(n_dirs) {
            check_len("parameter derivative", n, out.len())?;
            let coeffs = self.params.coefficients::<Dual>(Some(dir));
            self.residual_impl(
                &coeffs,
                time,
                &scratch.dual_state[..n],
                Some(state.y_dot),
                &mut scratch.dual_res[..n],
                Some(dir),
            );
            for (o, r) in out.iter_mut().zip(&scratch.dual_res[..n]) {
                *o = r.eps;
            }
        }
        Ok(())
    }

    /// `res_s = J·s + ∂F/∂ẏ·ṡ + ∂F/∂p` per direction.
    fn residual_sens_fwd_combine(
        &self,
        y_s: &[Vec<f64>],
        y_s_dot: &[Vec<f64>],
        param_derivs: &[Vec<f64>],
        res_s: &mut [Vec<f64>],
    ) -> Result<(), ModelError> {
        let n = self.disc.num_dofs();
        let n_dirs = res_s.len();
        check_len("sensitivity states", n_dirs, y_s.len())?;
        check_len("sensitivity derivatives", n_dirs, y_s_dot.len())?;
        check_len("parameter derivatives", n_dirs, param_derivs.len())?;
        let mut tmp = vec![0.0; n];
        for (dir, out) in res_s.iter_mut().enumerate() {
            check_len("sensitivity residual", n, out.len())?;
            check_len("sensitivity state", n, y_s[dir].len())?;
            check_len("sensitivity derivative", n, y_s_dot[dir].len())?;
            check_len("parameter derivatives", n, param_derivs[dir].len())?;
            self.jacobian.multiply(&y_s[dir], 1.0, 0.0, out);
            self.jacobian.multiply_derivative(&y_s_dot[dir], &mut tmp);
            for ((o, t), p) in out.iter_mut().zip(&tmp).zip(&param_derivs[dir]) {
                *o += t + p;
            }
        }
        Ok(())
    }

    /// Zero everywhere except the bulk entries driven by sensitive `INIT_C`
    /// parameters.
    fn initialize_sensitivity_states(&self, y_s: &mut [Vec<f64>]) {
        let idx = self.disc.indexer();
        for (dir, s) in y_s.iter_mut().enumerate() {
            s.iter_mut().for_each(|v| *v = 0.0);
            if self.init_state.is_some() {
                continue;
            }
            for ch in 0..self.disc.n_channel {
                for comp in 0..self.disc.n_comp {
                    let seed = self.params.seed(
                        &ParameterId::InitC {
                            component: Some(comp),
                            channel: Some(ch),
                        },
                        Some(dir),
                    );
                    if seed == 0.0 {
                        continue;
                    }
                    for cell in 0..self.disc.n_col {
                        s[idx.c(cell, ch, comp)] = seed;
                    }
                }
            }
        }
    }

    /// Solves the inlet rows of the sensitivity system for the inlet
    /// sensitivities, then the bulk rows for the bulk sensitivity derivatives.
    fn consistent_initial_sensitivity(
        &mut self,
        time: SimulationTime,
        state: SimulationState<'_>,
        y_s: &mut [Vec<f64>],
        y_s_dot: &mut [Vec<f64>],
        param_derivs: &[Vec<f64>],
        scratch: &mut Scratch,
    ) -> Result<(), ModelError> {
        let n = self.disc.num_dofs();
        check_len("parameter derivatives", y_s.len(), param_derivs.len())?;
        let mut res = vec![0.0; n];
        self.residual_with_jacobian(time, state, &mut res, scratch)?;

        let alg: Vec<usize> = self.inlet_rows().collect();
        let lu = self.jacobian.submatrix(&alg, &alg).lu();
        let mut tmp = vec![0.0; n];
        let mut slopes = vec![0.0; alg.len()];

        for (dir, (s, s_dot)) in y_s.iter_mut().zip(y_s_dot.iter_mut()).enumerate() {
            check_len("sensitivity state", n, s.len())?;
            check_len("sensitivity derivative", n, s_dot.len())?;
            let dfdp = &param_derivs[dir];

            // J_aa s_a = -(∂F_a/∂p + J_ad s_d)
            for &i in &alg {
                s[i] = 0.0;
            }
            self.jacobian.multiply(s, 1.0, 0.0, &mut tmp);
            let rhs = DVector::from_iterator(alg.len(), alg.iter().map(|&i| -(tmp[i] + dfdp[i])));
            let s_alg = lu.solve(&rhs).ok_or(ModelError::SingularJacobian)?;
            for (k, &i) in alg.iter().enumerate() {
                s[i] = s_alg[k];
            }

            self.jacobian.multiply(s, 1.0, 0.0, &mut tmp);
            for i in self.bulk_rows() {
                s_dot[i] = -(tmp[i] + dfdp[i]);
            }
            self.inlet_slope_sensitivity(time, dir, &mut slopes);
            for (k, &i) in alg.iter().enumerate() {
                s_dot[i] = slopes[k];
            }
        }
        Ok(())
    }

    /// Inlet sensitivities follow directly from the unit inlet Jacobian; their
    /// derivatives are not touched.
    fn lean_consistent_initial_sensitivity(
        &mut self,
        time: SimulationTime,
        state: SimulationState<'_>,
        y_s: &mut [Vec<f64>],
        y_s_dot: &mut [Vec<f64>],
        param_derivs: &[Vec<f64>],
        scratch: &mut Scratch,
    ) -> Result<(), ModelError> {
        let n = self.disc.num_dofs();
        check_len("parameter derivatives", y_s.len(), param_derivs.len())?;
        let mut res = vec![0.0; n];
        self.residual_with_jacobian(time, state, &mut res, scratch)?;
        let mut tmp = vec![0.0; n];

        for (dir, (s, s_dot)) in y_s.iter_mut().zip(y_s_dot.iter_mut()).enumerate() {
            check_len("sensitivity state", n, s.len())?;
            check_len("sensitivity derivative", n, s_dot.len())?;
            let dfdp = &param_derivs[dir];
            for i in self.inlet_rows() {
                s[i] = -dfdp[i];
            }
            self.jacobian.multiply(s, 1.0, 0.0, &mut tmp);
            for i in self.bulk_rows() {
                s_dot[i] = -(tmp[i] + dfdp[i]);
            }
        }
        Ok(())
    }

    fn report_solution_structure(&self, recorder: &mut dyn SolutionRecorder) {
        recorder.unit_operation_structure(
            self.unit_op_idx,
            &SolutionStructure::new(&self.disc, self.params.col_length),
        );
    }

    fn report_solution(&self, recorder: &mut dyn SolutionRecorder, solution: &[f64]) {
        recorder.unit_operation_solution(self.unit_op_idx, &self.exporter(solution));
    }
}
