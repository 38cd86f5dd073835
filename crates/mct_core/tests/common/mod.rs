//! Scenario builders and a minimal implicit Euler driver for integration tests.
//!
//! The driver only talks to the model through the `UnitOperation` contract.
#![allow(dead_code)]

use mct_core::config::JsonParameterProvider;
use mct_core::exporter::InternalStorageRecorder;
use mct_core::traits::{Scratch, SimulationState, SimulationTime, UnitOperation};
use mct_core::{ModelError, MultiChannelTransportModel};
use serde_json::{json, Value};

const MAX_NEWTON_STEPS: usize = 25;
const NEWTON_STEP_TOL: f64 = 1e-13;
const LINEAR_TOL: f64 = 1e-12;

/// Single-component column: inlet concentration 0 before `t = 10`, 1 after.
pub fn step_inlet_config(n_channel: usize, n_col: usize, order: usize) -> Value {
    json!({
        "NCOMP": 1,
        "COL_LENGTH": 200.0,
        "COL_DISPERSION": 5.75e-8,
        "EXCHANGE_MATRIX": vec![0.0; n_channel * n_channel],
        "CHANNEL_CROSS_SECTION_AREAS": vec![1.0; n_channel],
        "INIT_C": [0.0],
        "FLOW_RATE": vec![1.0; n_channel],
        "discretization": {
            "NCOL": n_col,
            "NCHANNEL": n_channel,
            "USE_ANALYTIC_JACOBIAN": false,
            "weno": { "WENO_ORDER": order, "BOUNDARY_MODEL": 0, "WENO_EPS": 1e-10 }
        },
        "inlet": {
            "sec_000": { "CONST_COEFF": [0.0] },
            "sec_001": { "CONST_COEFF": [1.0] }
        }
    })
}

pub const STEP_SECTIONS: [f64; 3] = [0.0, 10.0, 1500.0];

pub fn build_model(config: Value) -> MultiChannelTransportModel {
    let mut provider = JsonParameterProvider::new(config);
    MultiChannelTransportModel::configure(0, &mut provider).expect("configure model")
}

pub fn l2_norm(values: &[f64]) -> f64 {
    values.iter().map(|v| v * v).sum::<f64>().sqrt()
}

pub fn max_abs_diff(a: &[f64], b: &[f64]) -> f64 {
    assert_eq!(a.len(), b.len(), "length mismatch");
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y).abs())
        .fold(0.0, f64::max)
}

/// Implicit Euler integration of one unit operation, optionally carrying
/// forward sensitivities of every registered direction.
pub struct Simulation {
    pub model: MultiChannelTransportModel,
    pub y: Vec<f64>,
    pub y_dot: Vec<f64>,
    pub y_s: Vec<Vec<f64>>,
    pub y_s_dot: Vec<Vec<f64>>,
    pub t: f64,
    scratch: Scratch,
    section_times: Vec<f64>,
    weight: Vec<f64>,
}

impl Simulation {
    pub fn new(mut model: MultiChannelTransportModel, section_times: &[f64]) -> Self {
        let n = model.num_dofs();
        let n_dirs = model.num_sens_directions();
        model.set_section_times(section_times);
        let scratch = model.create_scratch();
        let mut y = vec![0.0; n];
        let mut y_dot = vec![0.0; n];
        model
            .apply_initial_condition(&mut y, &mut y_dot)
            .expect("apply initial condition");
        let mut y_s = vec![vec![0.0; n]; n_dirs];
        model.initialize_sensitivity_states(&mut y_s);
        Self {
            model,
            y,
            y_dot,
            y_s,
            y_s_dot: vec![vec![0.0; n]; n_dirs],
            t: section_times[0],
            scratch,
            section_times: section_times.to_vec(),
            weight: vec![1.0; n],
        }
    }

    /// Makes state, derivative, and sensitivities consistent at a section start.
    pub fn initialize(&mut self, time: SimulationTime) -> Result<(), ModelError> {
        self.model
            .consistent_initial_state(time, &mut self.y, 1e-12, &mut self.scratch)?;
        self.model.consistent_initial_time_derivative(
            time,
            &self.y,
            &mut self.y_dot,
            &mut self.scratch,
        )?;
        if self.y_s.is_empty() {
            return Ok(());
        }
        let state = SimulationState::new(&self.y, &self.y_dot);
        let mut dfdp = vec![vec![0.0; self.y.len()]; self.y_s.len()];
        self.model
            .residual_sens_fwd_ad_only(time, state, &mut dfdp, &mut self.scratch)?;
        self.model.consistent_initial_sensitivity(
            time,
            state,
            &mut self.y_s,
            &mut self.y_s_dot,
            &dfdp,
            &mut self.scratch,
        )
    }

    /// Integrates through all sections with a fixed step, reporting every
    /// time point to `recorder`.
    pub fn run(&mut self, dt: f64, recorder: &mut InternalStorageRecorder) -> Result<(), ModelError> {
        self.model.report_solution_structure(recorder);
        let mut reported_start = false;
        for sec in 0..self.section_times.len() - 1 {
            let (start, end) = (self.section_times[sec], self.section_times[sec + 1]);
            self.model.notify_discontinuous_section_transition(start, sec);
            self.initialize(SimulationTime::new(start, sec))?;
            if !reported_start {
                recorder.begin_timestep(start);
                self.model.report_solution(recorder, &self.y);
                reported_start = true;
            }

            let steps = ((end - start) / dt).round() as usize;
            for k in 1..=steps {
                let t = start + k as f64 * (end - start) / steps as f64;
                self.step(SimulationTime::new(t, sec), t - self.t)?;
                recorder.begin_timestep(t);
                self.model.report_solution(recorder, &self.y);
            }
        }
        Ok(())
    }

    fn step(&mut self, time: SimulationTime, dt: f64) -> Result<(), ModelError> {
        let alpha = 1.0 / dt;
        let n = self.y.len();
        let y_prev = self.y.clone();
        let mut res = vec![0.0; n];

        let mut converged = false;
        for _ in 0..MAX_NEWTON_STEPS {
            for ((yd, y), yp) in self.y_dot.iter_mut().zip(&self.y).zip(&y_prev) {
                *yd = (y - yp) * alpha;
            }
            self.model.residual_with_jacobian(
                time,
                SimulationState::new(&self.y, &self.y_dot),
                &mut res,
                &mut self.scratch,
            )?;
            self.model
                .linear_solve(time.t, alpha, LINEAR_TOL, &mut res, &self.weight)?;
            for (y, dy) in self.y.iter_mut().zip(&res) {
                *y -= dy;
            }
            if l2_norm(&res) <= NEWTON_STEP_TOL * (1.0 + l2_norm(&self.y)) {
                converged = true;
                break;
            }
        }
        assert!(converged, "Newton iteration did not converge at t = {}", time.t);
        for ((yd, y), yp) in self.y_dot.iter_mut().zip(&self.y).zip(&y_prev) {
            *yd = (y - yp) * alpha;
        }

        if !self.y_s.is_empty() {
            self.step_sensitivities(time, alpha)?;
        }
        self.t = time.t;
        Ok(())
    }

    /// `(J + M/dt)·s_{n+1} = M·s_n/dt - ∂F/∂p`
    fn step_sensitivities(&mut self, time: SimulationTime, alpha: f64) -> Result<(), ModelError> {
        let n = self.y.len();
        let mut res = vec![0.0; n];
        let mut dfdp = vec![vec![0.0; n]; self.y_s.len()];
        self.model.residual_sens_fwd_with_jacobian(
            time,
            SimulationState::new(&self.y, &self.y_dot),
            &mut res,
            &mut dfdp,
            &mut self.scratch,
        )?;

        let mut rhs = vec![vec![0.0; n]; self.y_s.len()];
        for (dir, r) in rhs.iter_mut().enumerate() {
            self.model
                .multiply_with_derivative_jacobian(&self.y_s[dir], r);
            for (ri, p) in r.iter_mut().zip(&dfdp[dir]) {
                *ri = *ri * alpha - p;
            }
        }
        self.model
            .solve_sensitivities(time.t, alpha, LINEAR_TOL, &mut rhs, &self.weight)?;

        for (dir, s_new) in rhs.into_iter().enumerate() {
            for ((sd, s), sp) in self.y_s_dot[dir].iter_mut().zip(&s_new).zip(&self.y_s[dir]) {
                *sd = (s - sp) * alpha;
            }
            self.y_s[dir] = s_new;
        }
        Ok(())
    }
}
