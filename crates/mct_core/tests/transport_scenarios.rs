mod common;

use common::{build_model, max_abs_diff, step_inlet_config, Simulation, STEP_SECTIONS};
use mct_core::exporter::{InternalStorageRecorder, StateOrdering};
use mct_core::traits::{SimulationState, SimulationTime, UnitOperation};
use serde_json::json;

#[test]
fn decoupled_identical_channels_have_identical_outlets() {
    let model = build_model(step_inlet_config(2, 16, 3));
    let mut sim = Simulation::new(model, &STEP_SECTIONS);
    let mut recorder = InternalStorageRecorder::new(false);
    sim.run(1.0, &mut recorder).expect("simulation");

    assert_eq!(recorder.num_records(), 1501);
    let ch0 = recorder.outlet_series(0, 0);
    let ch1 = recorder.outlet_series(1, 0);
    for (i, (a, b)) in ch0.iter().zip(&ch1).enumerate() {
        let diff = (a - b).abs();
        assert!(
            diff <= 1e-10 || diff <= 1e-10 * a.abs().max(b.abs()),
            "t = {}: outlets {a} and {b} differ",
            recorder.records[i].time
        );
    }

    // the front has passed the outlet by the end
    let last = *ch0.last().expect("records");
    assert!((last - 1.0).abs() < 1e-3, "final outlet {last}");
    assert!(ch0[100].abs() < 1e-2, "outlet before breakthrough {}", ch0[100]);
}

#[test]
fn reversed_channel_drains_through_first_cell() {
    let forward_model = build_model(step_inlet_config(2, 16, 2));
    let mut forward = Simulation::new(forward_model, &[0.0, 10.0, 300.0]);
    let mut forward_rec = InternalStorageRecorder::new(true);
    forward.run(1.0, &mut forward_rec).expect("forward simulation");

    let mut config = step_inlet_config(2, 16, 2);
    config["FLOW_RATE"] = json!([1.0, -1.0]);
    let reversed_model = build_model(config);
    let idx = reversed_model.indexer();
    assert_eq!(reversed_model.local_outlet_component_index(1), idx.c(0, 1, 0));
    assert_eq!(reversed_model.local_outlet_component_index(0), idx.c(15, 0, 0));

    let mut reversed = Simulation::new(reversed_model, &[0.0, 10.0, 300.0]);
    let mut reversed_rec = InternalStorageRecorder::new(true);
    reversed.run(1.0, &mut reversed_rec).expect("reversed simulation");

    let exporter = reversed.model.exporter(&reversed.y);
    assert_eq!(exporter.outlet(1)[0], reversed.y[idx.c(0, 1, 0)]);
    assert_eq!(exporter.outlet(0)[0], reversed.y[idx.c(15, 0, 0)]);

    // channel 0 is unaffected by the reversal of channel 1
    let fwd0 = forward_rec.outlet_series(0, 0);
    let rev0 = reversed_rec.outlet_series(0, 0);
    assert!(max_abs_diff(&fwd0, &rev0) < 1e-12);

    // mirrored flow through an identical channel gives the same outlet history
    let rev1 = reversed_rec.outlet_series(1, 0);
    assert!(max_abs_diff(&fwd0, &rev1) < 1e-10);
    assert!(fwd0.last().copied().unwrap_or(0.0) > 0.5);
}

#[test]
fn consistent_initialization_is_idempotent() {
    let mut config = step_inlet_config(3, 8, 3);
    config["EXCHANGE_MATRIX"] = json!([0.0, 0.02, 0.01, 0.03, 0.0, 0.0, 0.0, 0.05, 0.0]);
    config["INIT_C"] = json!([0.3, 0.1, 0.0]);
    config["inlet"]["sec_000"]["LIN_COEFF"] = json!([0.01]);
    let mut model = build_model(config);
    model.set_section_times(&STEP_SECTIONS);
    model.notify_discontinuous_section_transition(0.0, 0);
    let mut scratch = model.create_scratch();
    let n = model.num_dofs();
    let mut y = vec![0.0; n];
    let mut y_dot = vec![0.0; n];
    model
        .apply_initial_condition(&mut y, &mut y_dot)
        .expect("initial condition");

    let time = SimulationTime::new(2.0, 0);
    model
        .consistent_initial_state(time, &mut y, 1e-12, &mut scratch)
        .expect("first state init");
    model
        .consistent_initial_time_derivative(time, &y, &mut y_dot, &mut scratch)
        .expect("first derivative init");

    let (y_once, y_dot_once) = (y.clone(), y_dot.clone());
    model
        .consistent_initial_state(time, &mut y, 1e-12, &mut scratch)
        .expect("second state init");
    model
        .consistent_initial_time_derivative(time, &y, &mut y_dot, &mut scratch)
        .expect("second derivative init");
    assert!(max_abs_diff(&y, &y_once) < 1e-15);
    assert!(max_abs_diff(&y_dot, &y_dot_once) < 1e-15);

    let mut res = vec![0.0; n];
    model
        .residual(time, SimulationState::new(&y, &y_dot), &mut res, &mut scratch)
        .expect("residual");
    assert!(common::l2_norm(&res) < 1e-12);

    // the lean variant reaches the same point
    let mut y_lean = y_once.clone();
    y_lean[..3].iter_mut().for_each(|v| *v = 42.0);
    let mut y_dot_lean = y_dot_once.clone();
    model
        .lean_consistent_initial_state(time, &mut y_lean, 1e-12, &mut scratch)
        .expect("lean state");
    model
        .lean_consistent_initial_time_derivative(time, &y_lean, &mut y_dot_lean, &mut scratch)
        .expect("lean derivative");
    assert!(max_abs_diff(&y_lean, &y_once) < 1e-15);
    assert!(max_abs_diff(&y_dot_lean, &y_dot_once) < 1e-15);
}

#[test]
fn recorder_receives_structure_and_coordinates() {
    let model = build_model(step_inlet_config(2, 4, 1));
    let mut sim = Simulation::new(model, &[0.0, 10.0, 12.0]);
    let mut recorder = InternalStorageRecorder::new(true);
    sim.run(1.0, &mut recorder).expect("simulation");

    let structure = recorder.structure.as_ref().expect("structure reported");
    assert_eq!(structure.n_axial_cells, 4);
    assert_eq!(structure.n_outlet_ports, 2);
    assert_eq!(structure.axial_coordinates, vec![25.0, 75.0, 125.0, 175.0]);
    assert_eq!(structure.channel_coordinates, vec![0.0, 1.0]);
    assert_eq!(
        structure.ordering,
        vec![StateOrdering::AxialCell, StateOrdering::Channel, StateOrdering::Component]
    );
    assert_eq!(recorder.times().len(), 13);
    let last = recorder.records.last().expect("records");
    for port in &last.inlet {
        assert!((port[0] - 1.0).abs() < 1e-14);
    }
    assert_eq!(last.bulk.as_ref().map(Vec::len), Some(8));
}
