//! End-to-end scenarios driving the assembled rig through the command
//! dispatch, the way a real command stream would.

use figment::{
    providers::{Format, Toml},
    Figment,
};
use motiond::{
    config::Config,
    exec::{build_rig, dispatch, Rig},
    kinematics::Kinematics,
    sim::SimEndstop,
    stepper::Endstop,
    toolhead::Toolhead,
};
use std::sync::Arc;

// all endstops at the origin
const ZERO_CONFIG: &str = r#"
[printer]
axis = "XYZ"

[stepper.x]
step_distance = 0.01
position_max = 200.0
position_endstop = 0.0

[stepper.y]
step_distance = 0.01
position_max = 200.0
position_endstop = 0.0

[stepper.z]
step_distance = 0.0025
position_max = 200.0
position_endstop = 0.0

[extruder]
step_distance = 0.002
nozzle_diameter = 0.4
filament_diameter = 1.75
"#;

// x homes against a positive endstop at the far end of its travel
const OVERSHOOT_CONFIG: &str = r#"
[printer]
axis = "XYZ"
max_z_velocity = 25.0

[stepper.x]
step_distance = 0.01
position_max = 200.0
position_endstop = 200.0
homing_speed = 20.0
homing_retract_dist = 5.0
second_homing_speed = 10.0
homing_positive_dir = true

[stepper.y]
step_distance = 0.01
position_max = 200.0
position_endstop = 0.0

[stepper.z]
step_distance = 0.0025
position_min = -10.0
position_max = 180.0
position_endstop = 0.0

[extruder]
step_distance = 0.002
nozzle_diameter = 0.4
filament_diameter = 1.75
"#;

fn rig_from(toml: &str) -> Rig {
    let cfg: Config = Figment::new().merge(Toml::string(toml)).extract().unwrap();
    build_rig(&cfg).unwrap()
}

fn home_zero(rig: &Rig) {
    for letter in ['X', 'Y', 'Z'] {
        rig.endstops[&letter].set_trigger_pos(0.);
    }
    dispatch(rig, "G28").unwrap();
}

#[test]
fn relative_move_basic() {
    let rig = rig_from(ZERO_CONFIG);
    home_zero(&rig);
    let moves_before = rig.toolhead.moves().len();
    dispatch(&rig, "G91").unwrap();
    dispatch(&rig, "G1 X10 Y5 F600").unwrap();
    {
        let gm = rig.gcode_move.lock().unwrap();
        assert!(!gm.absolute_coord());
        assert!((gm.speed() - 10.).abs() < 1e-9);
        assert_eq!(gm.last_position(), &[10., 5., 0., 0.]);
    }
    let moves = rig.toolhead.moves();
    assert_eq!(moves.len(), moves_before + 1);
    let (target, speed) = moves.last().unwrap();
    assert_eq!(target, &vec![10., 5., 0., 0.]);
    assert!((speed - 10.).abs() < 1e-9);
}

#[test]
fn g92_with_partial_axes() {
    let rig = rig_from(ZERO_CONFIG);
    home_zero(&rig);
    dispatch(&rig, "G91").unwrap();
    dispatch(&rig, "G1 X10 Y5 F600").unwrap();
    dispatch(&rig, "G92 X0").unwrap();
    {
        let gm = rig.gcode_move.lock().unwrap();
        assert_eq!(gm.base_position(), &[10., 0., 0., 0.]);
        assert_eq!(gm.last_position(), &[10., 5., 0., 0.]);
    }
    let out = dispatch(&rig, "M114").unwrap();
    assert_eq!(out, vec![String::from("X:0.000 Y:5.000 Z:0.000 E:0.000")]);
}

#[test]
fn speed_and_extrude_factor_overrides() {
    let rig = rig_from(ZERO_CONFIG);
    home_zero(&rig);
    dispatch(&rig, "M220 S200").unwrap();
    dispatch(&rig, "M221 S50").unwrap();
    let gm = rig.gcode_move.lock().unwrap();
    let status = gm.get_status();
    // speed_factor is exposed in F-space as a fraction
    assert!((status.speed_factor - 2.).abs() < 1e-9);
    // the F-space speed is preserved across the factor change
    assert!((status.speed - 1500.).abs() < 1e-9);
    assert!((gm.speed() - 50.).abs() < 1e-9);
    assert_eq!(gm.extrude_factor(), 0.5);
    // the reported E coordinate did not jump
    assert!((status.gcode_position[3] - 0.).abs() < 1e-9);
}

#[test]
fn homing_with_overshoot() {
    let rig = rig_from(OVERSHOOT_CONFIG);
    rig.endstops[&'X'].set_trigger_pos(199.9);
    rig.endstops[&'X'].set_overshoot_steps(10);
    dispatch(&rig, "G28 X").unwrap();

    // first homing move to the endstop position, retract, second slower move
    let moves = rig.toolhead.moves();
    assert_eq!(moves[0], (vec![200., 0., 0., 0.], 20.));
    assert!((moves[1].0[0] - 195.).abs() < 1e-9, "moves: {:?}", moves);
    assert_eq!(moves[1].1, 20.);
    assert_eq!(moves[2], (vec![200., 0., 0., 0.], 10.));

    // the corrected position reflects the 10-step overshoot
    let pos = rig.toolhead.get_position();
    assert!((pos[0] - 200.1).abs() < 1e-6, "pos was {:?}", pos);

    let kins = rig.toolhead.kinematics();
    assert!(kins[0].get_status().homed_axes.contains('x'));

    let gm = rig.gcode_move.lock().unwrap();
    assert!((gm.last_position()[0] - 200.1).abs() < 1e-6);
    assert_eq!(gm.base_position()[0], gm.get_status().homing_origin[0]);
}

#[test]
fn probing_move_corrects_to_trigger_point() {
    let rig = rig_from(OVERSHOOT_CONFIG);
    rig.endstops[&'X'].set_trigger_pos(200.);
    rig.endstops[&'Y'].set_trigger_pos(0.);
    rig.endstops[&'Z'].set_trigger_pos(0.);
    dispatch(&rig, "G28").unwrap();

    let z_stepper = rig.toolhead.sim_stepper("stepper_z").unwrap();
    let probe = SimEndstop::new(vec![z_stepper]);
    rig.toolhead.register_endstop(Arc::clone(&probe));
    probe.set_trigger_pos(-3.);

    let mut target = rig.toolhead.get_position();
    target[2] = -5.;
    let probe_dyn: Arc<dyn Endstop> = probe.clone() as Arc<dyn Endstop>;
    let trigpos = rig
        .homing
        .probing_move(probe_dyn, &target, 5., true, true, Some(&[String::from("z")]))
        .unwrap();
    assert!((trigpos[2] - -3.).abs() < 1e-6, "trigpos was {:?}", trigpos);
    // no overshoot: the halt position equals the trigger position
    assert!((rig.toolhead.get_position()[2] - -3.).abs() < 1e-6);
}

#[test]
fn probe_already_triggered_is_detected() {
    let rig = rig_from(OVERSHOOT_CONFIG);
    rig.endstops[&'X'].set_trigger_pos(200.);
    rig.endstops[&'Y'].set_trigger_pos(0.);
    rig.endstops[&'Z'].set_trigger_pos(0.);
    dispatch(&rig, "G28").unwrap();

    let z_stepper = rig.toolhead.sim_stepper("stepper_z").unwrap();
    let probe = SimEndstop::new(vec![z_stepper]);
    rig.toolhead.register_endstop(Arc::clone(&probe));
    probe.set_stuck_triggered(true);

    let mut target = rig.toolhead.get_position();
    target[2] = -5.;
    let probe_dyn: Arc<dyn Endstop> = probe.clone() as Arc<dyn Endstop>;
    let err = rig
        .homing
        .probing_move(probe_dyn, &target, 5., true, true, Some(&[String::from("z")]))
        .unwrap_err();
    assert_eq!(err.to_string(), "Probe triggered prior to movement");
}

#[test]
fn g28_during_shutdown_reports_shutdown_error() {
    let rig = rig_from(OVERSHOOT_CONFIG);
    rig.toolhead.set_shutdown(true);
    let err = dispatch(&rig, "G28 X").unwrap_err();
    assert_eq!(err, "Homing failed due to printer shutdown");
    // motor power was cut, nothing reads as homed anymore
    assert_eq!(rig.toolhead.kinematics()[0].get_status().homed_axes, "");
}

#[test]
fn get_position_reports_all_layers() {
    let rig = rig_from(ZERO_CONFIG);
    home_zero(&rig);
    let out = dispatch(&rig, "GET_POSITION").unwrap();
    let report = &out[0];
    let lines: Vec<&str> = report.lines().collect();
    assert!(lines[0].starts_with("mcu: stepper_x:"), "{}", report);
    assert!(lines[1].starts_with("stepper: stepper_x:"), "{}", report);
    assert!(lines[2].starts_with("kinematic: X:"), "{}", report);
    assert!(lines[3].starts_with("toolhead: X:"), "{}", report);
    assert!(lines[4].starts_with("gcode: X:"), "{}", report);
    assert!(lines[5].starts_with("gcode base: X:"), "{}", report);
    assert!(lines[6].starts_with("gcode homing: X:"), "{}", report);
}

#[test]
fn executor_thread_round_trip() {
    let cfg: Config = Figment::new()
        .merge(Toml::string(ZERO_CONFIG))
        .extract()
        .unwrap();
    let ctrl = motiond::exec::start(cfg).unwrap();
    assert_eq!(
        ctrl.execute_line("M114").unwrap(),
        vec![String::from("X:0.000 Y:0.000 Z:0.000 E:0.000")]
    );
    // no endstop scripted to trigger, the homing must fail cleanly
    let err = ctrl.execute_line("G28 X").unwrap_err();
    assert!(err.contains("No trigger on stepper_x"), "{}", err);
    let status = ctrl.execute_line("STATUS").unwrap();
    let doc: serde_json::Value = serde_json::from_str(&status[0]).unwrap();
    assert!((doc["gcode_move"]["speed_factor"].as_f64().unwrap() - 1.).abs() < 1e-9);
}
