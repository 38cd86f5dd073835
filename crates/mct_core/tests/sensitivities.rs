mod common;

use common::{build_model, Simulation};
use mct_core::exporter::InternalStorageRecorder;
use mct_core::parameters::ParameterId;
use mct_core::traits::UnitOperation;
use mct_core::MultiChannelTransportModel;
use serde_json::json;

const SECTIONS: [f64; 2] = [0.0, 4.0];
const DT: f64 = 0.1;

fn smooth_model() -> MultiChannelTransportModel {
    build_model(json!({
        "NCOMP": 1,
        "COL_LENGTH": 10.0,
        "COL_DISPERSION": 0.05,
        "EXCHANGE_MATRIX": [0.0, 0.1, 0.2, 0.0],
        "CHANNEL_CROSS_SECTION_AREAS": [1.0, 2.0],
        "INIT_C": [0.0, 0.2],
        "FLOW_RATE": [1.5, 2.0],
        "discretization": {
            "NCOL": 8,
            "NCHANNEL": 2,
            "USE_ANALYTIC_JACOBIAN": false,
            "weno": { "WENO_ORDER": 1 }
        },
        "inlet": { "sec_000": { "CONST_COEFF": [0.0], "LIN_COEFF": [0.2] } }
    }))
}

fn sensitive_parameters() -> Vec<(ParameterId, f64)> {
    vec![
        (
            ParameterId::ColDispersion {
                component: Some(0),
                channel: None,
            },
            0.05,
        ),
        (ParameterId::FlowRate { channel: Some(0) }, 1.5),
        (
            ParameterId::ExchangeRate {
                from: Some(1),
                to: Some(0),
                component: Some(0),
            },
            0.2,
        ),
        (
            ParameterId::InitC {
                component: Some(0),
                channel: Some(1),
            },
            0.2,
        ),
        (
            ParameterId::InletCoefficient {
                section: Some(0),
                channel: None,
                component: Some(0),
                degree: Some(1),
            },
            0.2,
        ),
    ]
}

fn final_state(id: ParameterId, value: f64) -> Vec<f64> {
    let mut model = smooth_model();
    model.set_parameter(id, value).expect("perturb parameter");
    let mut sim = Simulation::new(model, &SECTIONS);
    sim.run(DT, &mut InternalStorageRecorder::new(false))
        .expect("perturbed simulation");
    sim.y
}

#[test]
fn forward_sensitivities_match_central_differences() {
    let params = sensitive_parameters();
    let mut model = smooth_model();
    for (dir, (id, _)) in params.iter().enumerate() {
        model
            .set_sensitive_parameter(*id, dir, 1.0)
            .expect("register sensitivity");
    }
    assert_eq!(model.num_sens_directions(), params.len());

    let mut sim = Simulation::new(model, &SECTIONS);
    sim.run(DT, &mut InternalStorageRecorder::new(false))
        .expect("simulation with sensitivities");

    for (dir, (id, value)) in params.iter().enumerate() {
        let h = 1e-5 * value;
        let plus = final_state(*id, value + h);
        let minus = final_state(*id, value - h);
        let fd: Vec<f64> = plus
            .iter()
            .zip(&minus)
            .map(|(p, m)| (p - m) / (2.0 * h))
            .collect();
        let scale = fd.iter().fold(1.0_f64, |acc, v| acc.max(v.abs()));
        let deviation = common::max_abs_diff(&sim.y_s[dir], &fd);
        assert!(
            deviation < 1e-5 * scale,
            "direction {dir} ({id:?}): deviation {deviation:e}"
        );
        assert!(
            sim.y_s[dir].iter().any(|v| v.abs() > 1e-6),
            "direction {dir} ({id:?}) has a vanishing sensitivity"
        );
    }
}

#[test]
fn sensitivity_residual_vanishes_after_consistent_initialization() {
    let mut model = smooth_model();
    model
        .set_sensitive_parameter(ParameterId::ColLength, 0, 1.0)
        .expect("column length");
    model
        .set_sensitive_parameter(
            ParameterId::CrossSectionArea { channel: Some(1) },
            1,
            1.0,
        )
        .expect("area");
    let mut sim = Simulation::new(model, &SECTIONS);
    sim.run(DT, &mut InternalStorageRecorder::new(false))
        .expect("simulation");

    let time = mct_core::traits::SimulationTime::new(SECTIONS[1], 0);
    sim.initialize(time).expect("re-initialize");

    let n = sim.y.len();
    let mut scratch = sim.model.create_scratch();
    let mut res = vec![0.0; n];
    let mut dfdp = vec![vec![0.0; n]; 2];
    sim.model
        .residual_sens_fwd_with_jacobian(
            time,
            mct_core::traits::SimulationState::new(&sim.y, &sim.y_dot),
            &mut res,
            &mut dfdp,
            &mut scratch,
        )
        .expect("sensitivity residual");
    assert!(dfdp.iter().all(|d| d.iter().any(|v| v.abs() > 0.0)));

    let mut res_s = vec![vec![0.0; n]; 2];
    sim.model
        .residual_sens_fwd_combine(&sim.y_s, &sim.y_s_dot, &dfdp, &mut res_s)
        .expect("combine");
    for (dir, r) in res_s.iter().enumerate() {
        assert!(common::l2_norm(r) < 1e-10, "direction {dir}: {r:?}");
    }
}
