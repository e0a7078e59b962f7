//! Shared fixtures for the module tests: small configs over the sim rig.

use crate::{
    config::Config,
    exec::{build_rig, dispatch, Rig},
};
use figment::{
    providers::{Format, Toml},
    Figment,
};

// x homes against a positive endstop, the way the overshoot tests want it
pub(crate) const BASE_CONFIG: &str = r#"
[printer]
axis = "XYZ"
max_velocity = 500.0
max_accel = 3000.0
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
homing_speed = 20.0

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

// all endstops at the origin; frontend math tests start from zero
pub(crate) const ZERO_CONFIG: &str = r#"
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

// a secondary ABC triplet next to the primary one
pub(crate) const ABC_CONFIG: &str = r#"
[printer]
axis = "XYZABC"

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

[stepper.a]
step_distance = 0.005
position_max = 100.0
position_endstop = 0.0

[stepper.b]
step_distance = 0.005
position_max = 100.0
position_endstop = 0.0

[stepper.c]
step_distance = 0.005
position_max = 100.0
position_endstop = 0.0

[extruder]
step_distance = 0.002
nozzle_diameter = 0.4
filament_diameter = 1.75
"#;

// only the first letter of the secondary triplet is wired up; B and C sit
// in the axis map but are not configured
pub(crate) const PARTIAL_CONFIG: &str = r#"
[printer]
axis = "XYZA"

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

[stepper.a]
step_distance = 0.005
position_max = 100.0
position_endstop = 0.0

[extruder]
step_distance = 0.002
nozzle_diameter = 0.4
filament_diameter = 1.75
"#;

// the extruder carries an endstop and becomes home-able
pub(crate) const E_HOME_CONFIG: &str = r#"
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
max_extrude_only_distance = 500.0

[extruder.endstop]
position_max = 100.0
position_endstop = 0.0
"#;

pub(crate) fn config(toml: &str) -> Config {
    Figment::new().merge(Toml::string(toml)).extract().unwrap()
}

pub(crate) fn rig_from(toml: &str) -> Rig {
    build_rig(&config(toml)).unwrap()
}

pub(crate) fn base_rig() -> Rig {
    rig_from(BASE_CONFIG)
}

pub(crate) fn zero_rig() -> Rig {
    rig_from(ZERO_CONFIG)
}

/// Scripts the axis endstops and runs a full G28.
pub(crate) fn home(rig: &Rig, triggers: &[(char, f64)]) {
    for (letter, pos) in triggers {
        rig.endstops[letter].set_trigger_pos(*pos);
    }
    dispatch(rig, "G28").unwrap();
}

pub(crate) fn home_base(rig: &Rig) {
    home(rig, &[('X', 200.), ('Y', 0.), ('Z', 0.)]);
}

pub(crate) fn home_zero(rig: &Rig) {
    home(rig, &[('X', 0.), ('Y', 0.), ('Z', 0.)]);
}
